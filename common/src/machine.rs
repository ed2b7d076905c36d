use chrono::{DateTime, FixedOffset, Utc};
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::{
    commands::{Command, Ingress},
    config::{MachineConfig, PersistedState, ReportMode},
    counters::{CounterStore, PulseDelta},
    error::ValidationError,
    report::{self, ReportPublisher},
    schedule::ScheduleController,
    status::StatusMonitor,
    storage::StateStorage,
    types::{CommandEnvelope, MachineStatus, PinLevel, ReportPayload, RpcRequest, RpcResponse},
};

/// Outbound channel, resolved to a topic by the runtime adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Report,
    Confirmation,
    Status,
}

/// Side effect requested by the engine, executed in order by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineAction {
    DriveMachinePin(PinLevel),
    Publish { channel: Channel, payload: Value },
}

impl MachineAction {
    pub fn publish(channel: Channel, payload: &impl Serialize) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or_else(|err| {
            warn!("failed to encode {channel:?} payload: {err}");
            Value::Null
        });
        Self::Publish { channel, payload }
    }
}

/// Control state of one machine. Owned by the single control loop; only
/// the pulse counters are shared with edge callbacks.
#[derive(Debug)]
pub struct MachineEngine<S> {
    counters: CounterStore<S>,
    schedule: ScheduleController,
    status: StatusMonitor,
    report: ReportPublisher,
}

impl<S: StateStorage> MachineEngine<S> {
    pub fn new(config: &MachineConfig, counters: CounterStore<S>) -> Self {
        Self {
            counters,
            schedule: ScheduleController::new(),
            status: StatusMonitor::new(),
            report: ReportPublisher::new(config.report_mode),
        }
    }

    pub fn counters(&self) -> &CounterStore<S> {
        &self.counters
    }

    pub fn snapshot(&mut self) -> PersistedState {
        self.counters.snapshot()
    }

    pub fn machine_status(&self) -> MachineStatus {
        MachineStatus {
            machine_on: self.status.machine_on(),
            commanded_power: self.schedule.commanded_power(),
        }
    }

    /// Fold pulses recorded by edge callbacks and persist them.
    pub fn absorb_pulses(&mut self) -> PulseDelta {
        self.counters.absorb_pulses()
    }

    pub fn schedule_tick(&mut self, now: Option<DateTime<FixedOffset>>) -> Vec<MachineAction> {
        let state = self.counters.snapshot();
        self.schedule.tick(&state, now)
    }

    pub fn status_tick(&mut self, reading: bool) -> Vec<MachineAction> {
        self.status.poll(reading).into_iter().collect()
    }

    pub fn report_tick(&mut self, now: DateTime<Utc>) -> Vec<MachineAction> {
        if self.report.mode() == ReportMode::Always {
            let _ = self.counters.persist();
        } else {
            self.counters.absorb_pulses();
        }

        let snapshot = report::compose(&self.counters.snapshot(), self.machine_status());
        self.report
            .tick(snapshot, now)
            .map(|payload| vec![MachineAction::publish(Channel::Report, &payload)])
            .unwrap_or_default()
    }

    /// Current report without advancing the publisher's dedup state.
    pub fn report(&mut self, now: DateTime<Utc>) -> ReportPayload {
        ReportPayload {
            snapshot: report::compose(&self.counters.snapshot(), self.machine_status()),
            time: now,
        }
    }

    /// Request/response ingress. The response is returned first; the
    /// actions end with the confirmation publish on success.
    pub fn handle_request(&mut self, request: &RpcRequest) -> (RpcResponse, Vec<MachineAction>) {
        match self.execute(Ingress::Rpc, &request.method, &request.params) {
            Ok((body, actions)) => (RpcResponse::success(request.id, body), actions),
            Err(err) => {
                warn!("rpc {} (id {}) rejected: {err}", request.method, request.id);
                (RpcResponse::failure(request.id, &err), Vec::new())
            }
        }
    }

    /// One-way ingress. Failures are logged and the command is dropped.
    pub fn handle_one_way(&mut self, payload: &[u8]) -> Vec<MachineAction> {
        let envelope = match serde_json::from_slice::<CommandEnvelope>(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping command: {}", ValidationError::malformed(&err));
                return Vec::new();
            }
        };

        match self.execute(Ingress::OneWay, &envelope.method, &envelope.params) {
            Ok((_, actions)) => actions,
            Err(err) => {
                warn!("dropping command {}: {err}", envelope.method);
                Vec::new()
            }
        }
    }

    fn execute(
        &mut self,
        ingress: Ingress,
        method: &str,
        params: &Value,
    ) -> Result<(Value, Vec<MachineAction>), ValidationError> {
        let command = Command::parse(ingress, method, params)?;
        let (body, mut actions) = command.apply(&mut self.counters, &mut self.schedule);
        info!("applied {method} via {ingress:?}: {body}");
        actions.push(MachineAction::Publish {
            channel: Channel::Confirmation,
            payload: body.clone(),
        });
        Ok((body, actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schedule::MACHINE_PIN_OFF, storage::MemoryStorage};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine(mode: ReportMode) -> (MachineEngine<MemoryStorage>, MemoryStorage) {
        let storage = MemoryStorage::new();
        let config = MachineConfig {
            report_mode: mode,
            ..MachineConfig::default()
        };
        let engine = MachineEngine::new(&config, CounterStore::open(storage.clone()));
        (engine, storage)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
    }

    #[test]
    fn failed_request_gets_error_and_no_confirmation() {
        let (mut engine, storage) = engine(ReportMode::Always);
        let request = RpcRequest {
            id: 11,
            src: Some("ops".to_string()),
            method: "App.SetOnHour".to_string(),
            params: json!({"on_hour": "nine"}),
        };

        let (response, actions) = engine.handle_request(&request);

        assert!(!response.is_success());
        assert_eq!(response.id, 11);
        assert_eq!(response.error.unwrap().code, 400);
        assert!(actions.is_empty());
        assert_eq!(storage.writes(), 0);
    }

    #[test]
    fn malformed_one_way_payload_is_dropped() {
        let (mut engine, storage) = engine(ReportMode::Always);

        assert!(engine.handle_one_way(b"{\"method\": ").is_empty());
        assert!(engine
            .handle_one_way(br#"{"method":"App.Nope","params":{}}"#)
            .is_empty());
        assert_eq!(storage.writes(), 0);
    }

    #[test]
    fn pin_override_is_confirmed_after_the_write() {
        let (mut engine, _) = engine(ReportMode::Always);

        let actions =
            engine.handle_one_way(br#"{"method":"App.SetPinMachine","params":{"pin_machine":1}}"#);

        assert_eq!(
            actions,
            vec![
                MachineAction::DriveMachinePin(MACHINE_PIN_OFF),
                MachineAction::Publish {
                    channel: Channel::Confirmation,
                    payload: json!({"method": "App.SetPinMachine", "pin_machine": 1}),
                },
            ]
        );
    }

    #[test]
    fn always_mode_persists_and_reports_each_tick() {
        let (mut engine, storage) = engine(ReportMode::Always);

        assert_eq!(engine.report_tick(now()).len(), 1);
        assert_eq!(engine.report_tick(now()).len(), 1);
        assert_eq!(storage.writes(), 2);
    }

    #[test]
    fn on_change_mode_skips_identical_reports() {
        let (mut engine, storage) = engine(ReportMode::OnChange);

        assert_eq!(engine.report_tick(now()).len(), 1);
        assert!(engine.report_tick(now()).is_empty());

        engine.counters().increment_gift();
        let actions = engine.report_tick(now());
        let MachineAction::Publish { channel, payload } = &actions[0] else {
            panic!("expected a publish, got {actions:?}");
        };
        assert_eq!(*channel, Channel::Report);
        assert_eq!(payload["total_gift"], json!(1.0));
        assert_eq!(storage.writes(), 1);
    }

    #[test]
    fn report_reflects_status_and_power() {
        let (mut engine, _) = engine(ReportMode::Always);
        engine.status_tick(true);

        let report = engine.report(now());

        assert!(report.snapshot.machine_on);
        assert!(!report.snapshot.power_on_auto);
        assert_eq!(report.time, now());
    }
}
