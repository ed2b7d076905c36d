use chrono::{DateTime, Utc};

use crate::{
    config::{PersistedState, ReportMode},
    types::{MachineStatus, ReportPayload, ReportSnapshot},
};

pub fn compose(state: &PersistedState, status: MachineStatus) -> ReportSnapshot {
    ReportSnapshot {
        total_bag: state.total_bag,
        total_gift: state.total_gift,
        init_bag: state.init_bag,
        init_gift: state.init_gift,
        enable_auto: state.enable_auto,
        on_hour: state.on_hour,
        off_hour: state.off_hour,
        power_on_auto: status.commanded_power,
        machine_on: status.machine_on,
    }
}

#[derive(Debug, Clone)]
pub struct ReportPublisher {
    mode: ReportMode,
    previous: Option<ReportSnapshot>,
}

impl ReportPublisher {
    pub fn new(mode: ReportMode) -> Self {
        Self {
            mode,
            previous: None,
        }
    }

    pub fn mode(&self) -> ReportMode {
        self.mode
    }

    /// Report due on this tick, if any. In `OnChange` mode a snapshot equal
    /// to the previous tick's is suppressed; the timestamp is not compared.
    pub fn tick(&mut self, snapshot: ReportSnapshot, now: DateTime<Utc>) -> Option<ReportPayload> {
        let unchanged = self.previous.as_ref() == Some(&snapshot);
        self.previous = Some(snapshot.clone());

        if self.mode == ReportMode::OnChange && unchanged {
            return None;
        }

        Some(ReportPayload {
            snapshot,
            time: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, second).unwrap()
    }

    fn snapshot(total_bag: f64) -> ReportSnapshot {
        compose(
            &PersistedState {
                total_bag,
                ..PersistedState::default()
            },
            MachineStatus::default(),
        )
    }

    #[test]
    fn always_mode_reports_every_tick() {
        let mut publisher = ReportPublisher::new(ReportMode::Always);

        assert!(publisher.tick(snapshot(1.0), now(0)).is_some());
        let second = publisher.tick(snapshot(1.0), now(1)).unwrap();
        assert_eq!(second.time, now(1));
    }

    #[test]
    fn on_change_mode_suppresses_duplicates() {
        let mut publisher = ReportPublisher::new(ReportMode::OnChange);

        assert!(publisher.tick(snapshot(1.0), now(0)).is_some());
        assert!(publisher.tick(snapshot(1.0), now(1)).is_none());
        assert_eq!(
            publisher.tick(snapshot(2.0), now(2)).unwrap().snapshot.total_bag,
            2.0
        );
        assert!(publisher.tick(snapshot(2.0), now(3)).is_none());
    }

    #[test]
    fn status_changes_count_as_changes() {
        let mut publisher = ReportPublisher::new(ReportMode::OnChange);
        let state = PersistedState::default();

        publisher.tick(compose(&state, MachineStatus::default()), now(0));
        let flipped = MachineStatus {
            machine_on: true,
            commanded_power: false,
        };
        assert!(publisher.tick(compose(&state, flipped), now(1)).is_some());
    }
}
