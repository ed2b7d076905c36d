use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Notify},
    time::MissedTickBehavior,
};
use tracing::{info, warn};

use coinbox_common::{
    BringUpError, Channel, CounterStore, FileStorage, MachineAction, MachineEngine, PinLevel,
    PulseCounters, PulseKind, ReportPayload, RpcRequest, RpcResponse, RuntimeConfig, Topics,
    ValidationError, MACHINE_PIN_OFF,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const INBOX_CAPACITY: usize = 32;

/// Work for the control loop. Everything that touches the engine goes
/// through here so only one task ever owns it.
#[derive(Debug)]
enum Inbound {
    OneWay(Vec<u8>),
    Rpc {
        request: RpcRequest,
        reply: Option<oneshot::Sender<RpcResponse>>,
    },
    Rejected(RpcResponse),
    Report(oneshot::Sender<ReportPayload>),
    Shutdown,
}

/// GPIO stand-in for machines without the real inputs and relay.
#[derive(Debug)]
struct SimulatedPins {
    status_on: AtomicBool,
    machine_high: AtomicBool,
}

impl SimulatedPins {
    fn new() -> Self {
        Self {
            status_on: AtomicBool::new(false),
            machine_high: AtomicBool::new(MACHINE_PIN_OFF.is_high()),
        }
    }

    fn status(&self) -> bool {
        self.status_on.load(Ordering::Relaxed)
    }

    fn set_status(&self, on: bool) {
        self.status_on.store(on, Ordering::Relaxed);
    }

    fn drive_machine(&self, level: PinLevel) {
        let previous = self.machine_high.swap(level.is_high(), Ordering::Relaxed);
        if previous != level.is_high() {
            info!("machine pin -> {level:?}");
        }
    }
}

#[derive(Clone)]
struct AppState {
    inbox: mpsc::Sender<Inbound>,
    pulses: Arc<PulseCounters>,
    pulse_ready: Arc<Notify>,
    pins: Arc<SimulatedPins>,
    next_request_id: Arc<AtomicI64>,
}

struct HostSettings {
    runtime: RuntimeConfig,
    data_dir: PathBuf,
    http_port: u16,
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    on: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = load_settings(|key| std::env::var(key).ok())?;
    let runtime = settings.runtime;
    runtime.validate().context("invalid runtime configuration")?;
    let timezone: Tz = runtime
        .machine
        .timezone
        .parse()
        .map_err(|_| BringUpError::InvalidConfig {
            field: "machine.timezone",
            reason: format!("unknown timezone `{}`", runtime.machine.timezone),
        })?;

    let storage = FileStorage::new(settings.data_dir.join(&runtime.machine.state_file));
    info!("state document at {}", storage.path().display());
    let engine = MachineEngine::new(&runtime.machine, CounterStore::open(storage));
    let topics = Topics::for_machine(&runtime.machine.machine_id);

    let mut mqtt_options = MqttOptions::new(
        format!("coinbox-{}", runtime.machine.machine_id),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let app_state = AppState {
        inbox: inbox_tx,
        pulses: engine.counters().pulse_counters(),
        pulse_ready: Arc::new(Notify::new()),
        pins: Arc::new(SimulatedPins::new()),
        next_request_id: Arc::new(AtomicI64::new(1)),
    };

    spawn_mqtt_loop(
        mqtt.clone(),
        eventloop,
        topics.clone(),
        app_state.inbox.clone(),
    );
    let control = tokio::spawn(run_control_loop(
        engine,
        ControlContext {
            mqtt,
            topics,
            timezone,
            pins: app_state.pins.clone(),
            pulse_ready: app_state.pulse_ready.clone(),
            schedule_every: Duration::from_millis(runtime.machine.schedule_interval_ms),
            status_every: Duration::from_millis(runtime.machine.status_poll_interval_ms),
            report_every: Duration::from_millis(runtime.machine.report_interval_ms),
        },
        inbox_rx,
    ));

    let app = Router::new()
        .route("/rpc/{method}", post(handle_rpc))
        .route("/api/report", get(handle_get_report))
        .route("/sim/pulse/{kind}", post(handle_sim_pulse))
        .route("/sim/status", put(handle_sim_status))
        .with_state(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = app_state.inbox.send(Inbound::Shutdown).await;
    control.await.context("control loop panicked")?;
    Ok(())
}

fn load_settings(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<HostSettings> {
    let mut runtime = match env("COINBOX_CONFIG") {
        Some(path) => load_runtime_config(Path::new(&path))?,
        None => RuntimeConfig::default(),
    };
    apply_env_overrides(&mut runtime, &env)?;

    let data_dir = env("COINBOX_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./.coinbox"));
    let http_port = match env("CONTROLLER_HTTP_PORT") {
        Some(value) => parse_port("CONTROLLER_HTTP_PORT", &value)?,
        None => 8080,
    };

    Ok(HostSettings {
        runtime,
        data_dir,
        http_port,
    })
}

fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse runtime config {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("runtime config {} not found; using defaults", path.display());
            Ok(RuntimeConfig::default())
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to read runtime config {}", path.display()))
        }
    }
}

fn apply_env_overrides(
    runtime: &mut RuntimeConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), BringUpError> {
    if let Some(id) = env("MACHINE_ID") {
        runtime.machine.machine_id = id;
    }
    if let Some(host) = env("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = env("MQTT_PORT") {
        runtime.network.mqtt_port = parse_port("MQTT_PORT", &port)?;
    }
    if let Some(user) = env("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Some(pass) = env("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    Ok(())
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, BringUpError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|err| BringUpError::InvalidConfig {
            field,
            reason: format!("`{value}` is not a port: {err}"),
        })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn spawn_mqtt_loop(
    mqtt: AsyncClient,
    mut eventloop: EventLoop,
    topics: Topics,
    inbox: mpsc::Sender<Inbound>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    let Some(inbound) = decode_inbound(&topics, &message.topic, &message.payload)
                    else {
                        continue;
                    };
                    if inbox.send(inbound).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    for topic in [&topics.set, &topics.rpc] {
                        if let Err(err) = mqtt.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            warn!("mqtt subscribe to {topic} failed: {err}");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn decode_inbound(topics: &Topics, topic: &str, payload: &[u8]) -> Option<Inbound> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return None;
    }

    if topic == topics.set {
        return Some(Inbound::OneWay(payload.to_vec()));
    }
    if topic == topics.rpc {
        return match RpcRequest::decode(payload) {
            Ok(request) => Some(Inbound::Rpc {
                request,
                reply: None,
            }),
            Err(rejection) => {
                warn!("rejecting rpc frame: {rejection}");
                rejection
                    .response(&topics.machine_id)
                    .map(Inbound::Rejected)
            }
        };
    }

    warn!("ignoring message on unexpected topic {topic}");
    None
}

struct ControlContext {
    mqtt: AsyncClient,
    topics: Topics,
    timezone: Tz,
    pins: Arc<SimulatedPins>,
    pulse_ready: Arc<Notify>,
    schedule_every: Duration,
    status_every: Duration,
    report_every: Duration,
}

async fn run_control_loop(
    mut engine: MachineEngine<FileStorage>,
    ctx: ControlContext,
    mut inbox: mpsc::Receiver<Inbound>,
) {
    let mut schedule = tokio::time::interval(ctx.schedule_every);
    let mut status = tokio::time::interval(ctx.status_every);
    let mut report = tokio::time::interval(ctx.report_every);
    for interval in [&mut schedule, &mut status, &mut report] {
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        let actions = tokio::select! {
            _ = schedule.tick() => engine.schedule_tick(now_in_timezone(ctx.timezone)),
            _ = status.tick() => engine.status_tick(ctx.pins.status()),
            _ = report.tick() => engine.report_tick(Utc::now()),
            _ = ctx.pulse_ready.notified() => {
                engine.absorb_pulses();
                Vec::new()
            }
            inbound = inbox.recv() => match inbound {
                Some(Inbound::OneWay(payload)) => engine.handle_one_way(&payload),
                Some(Inbound::Rpc { request, reply }) => {
                    let (response, actions) = engine.handle_request(&request);
                    let response = response.routed(&ctx.topics.machine_id, request.src.clone());
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(response);
                        }
                        None => publish_rpc_response(&ctx.mqtt, &response),
                    }
                    actions
                }
                Some(Inbound::Rejected(response)) => {
                    publish_rpc_response(&ctx.mqtt, &response);
                    Vec::new()
                }
                Some(Inbound::Report(reply)) => {
                    let _ = reply.send(engine.report(Utc::now()));
                    Vec::new()
                }
                Some(Inbound::Shutdown) | None => {
                    engine.absorb_pulses();
                    info!("control loop stopped");
                    return;
                }
            },
        };

        execute_actions(&ctx, actions);
    }
}

/// Never awaits the MQTT client: a full request queue drops the publish
/// instead of stalling pulse accounting and the schedule.
fn execute_actions(ctx: &ControlContext, actions: Vec<MachineAction>) {
    for action in actions {
        match action {
            MachineAction::DriveMachinePin(level) => ctx.pins.drive_machine(level),
            MachineAction::Publish { channel, payload } => {
                publish_json(&ctx.mqtt, topic_for(&ctx.topics, channel), &payload)
            }
        }
    }
}

fn topic_for(topics: &Topics, channel: Channel) -> &str {
    match channel {
        Channel::Report => &topics.report,
        Channel::Confirmation => &topics.confirmation,
        Channel::Status => &topics.status,
    }
}

fn publish_rpc_response(mqtt: &AsyncClient, response: &RpcResponse) {
    match response.dst.as_deref() {
        Some(dst) => publish_json(mqtt, &Topics::rpc_reply(dst), response),
        None => warn!("rpc {} has no src; response not routed", response.id),
    }
}

fn publish_json(mqtt: &AsyncClient, topic: &str, payload: &impl Serialize) {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(err) => {
            warn!("serialization for {topic} failed: {err}");
            return;
        }
    };
    if let Err(err) = mqtt.try_publish(topic, QoS::AtLeastOnce, false, body) {
        warn!("publish to {topic} failed: {err}");
    }
}

async fn handle_rpc(
    State(state): State<AppState>,
    UrlPath(method): UrlPath<String>,
    body: Bytes,
) -> axum::response::Response {
    let params = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(params) => params,
            Err(err) => {
                let err = ValidationError::malformed(&err);
                return error_response(http_status(err.code), &err.message);
            }
        }
    };

    let request = RpcRequest {
        id: state.next_request_id.fetch_add(1, Ordering::Relaxed),
        src: None,
        method,
        params,
    };
    let (reply, response) = oneshot::channel();
    if state
        .inbox
        .send(Inbound::Rpc {
            request,
            reply: Some(reply),
        })
        .await
        .is_err()
    {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop stopped");
    }

    match response.await {
        Ok(response) => {
            let status = response
                .error
                .as_ref()
                .map_or(StatusCode::OK, |err| http_status(err.code));
            (status, Json(response)).into_response()
        }
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop stopped"),
    }
}

async fn handle_get_report(State(state): State<AppState>) -> axum::response::Response {
    let (reply, report) = oneshot::channel();
    if state.inbox.send(Inbound::Report(reply)).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop stopped");
    }
    match report.await {
        Ok(report) => Json(report).into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop stopped"),
    }
}

async fn handle_sim_pulse(
    State(state): State<AppState>,
    UrlPath(kind): UrlPath<String>,
) -> impl IntoResponse {
    let kind = match kind.as_str() {
        "bag" => PulseKind::Bag,
        "gift" => PulseKind::Gift,
        _ => return error_response(StatusCode::NOT_FOUND, "Unknown pulse input. Use 'bag' or 'gift'"),
    };
    state.pulses.record(kind);
    state.pulse_ready.notify_one();
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_sim_status(
    State(state): State<AppState>,
    Json(update): Json<StatusUpdate>,
) -> impl IntoResponse {
    state.pins.set_status(update.on);
    StatusCode::NO_CONTENT
}

fn http_status(code: i32) -> StatusCode {
    u16::try_from(code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::BAD_REQUEST)
}

fn now_in_timezone(timezone: Tz) -> Option<DateTime<FixedOffset>> {
    let local = Utc::now().with_timezone(&timezone);
    Some(local.with_timezone(&local.offset().fix()))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coinbox_common::MACHINE_PIN_ON;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn environment_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(
            &path,
            r#"{"machine": {"machine_id": "from-file", "report_mode": "on_change"},
                "network": {"mqtt_host": "broker.local"}}"#,
        )
        .unwrap();

        let settings = load_settings(env_from(&[
            ("COINBOX_CONFIG", path.to_str().unwrap()),
            ("MACHINE_ID", "box-3"),
            ("MQTT_PORT", "8883"),
            ("COINBOX_DATA_DIR", "/var/lib/coinbox"),
        ]))
        .unwrap();

        assert_eq!(settings.runtime.machine.machine_id, "box-3");
        assert_eq!(settings.runtime.network.mqtt_host, "broker.local");
        assert_eq!(settings.runtime.network.mqtt_port, 8883);
        assert_eq!(
            settings.runtime.machine.report_mode,
            coinbox_common::ReportMode::OnChange
        );
        assert_eq!(settings.data_dir, PathBuf::from("/var/lib/coinbox"));
        assert_eq!(settings.http_port, 8080);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let settings =
            load_settings(env_from(&[("COINBOX_CONFIG", "/nonexistent/coinbox.json")])).unwrap();

        assert_eq!(settings.runtime.machine.state_file, "counts.json");
        assert_eq!(settings.data_dir, PathBuf::from("./.coinbox"));
        assert!(settings.runtime.validate().is_err(), "machine id is required");
    }

    #[test]
    fn bad_port_is_a_bring_up_error() {
        let err = load_settings(env_from(&[("MQTT_PORT", "eighty")]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("MQTT_PORT"));
    }

    #[test]
    fn routes_only_machine_topics() {
        let topics = Topics::for_machine("box-3");

        assert!(matches!(
            decode_inbound(&topics, "machine/box-3/out/set", b"{}"),
            Some(Inbound::OneWay(_))
        ));
        assert!(matches!(
            decode_inbound(
                &topics,
                "machine/box-3/rpc",
                br#"{"id":4,"src":"ops","method":"App.SetOnHour","args":{"on_hour":7}}"#
            ),
            Some(Inbound::Rpc { request, reply: None }) if request.params["on_hour"] == 7
        ));
        assert!(decode_inbound(&topics, "machine/box-3/rpc", b"not json").is_none());
        assert!(decode_inbound(
            &topics,
            "machine/box-3/rpc",
            br#"{"src":"ops","method":"App.SetOnHour","params":{"on_hour":7}}"#
        )
        .is_none());
        assert!(decode_inbound(&topics, "machine/box-4/out/set", b"{}").is_none());
    }

    #[test]
    fn rpc_frame_without_method_gets_a_failure_reply() {
        let topics = Topics::for_machine("box-3");

        let Some(Inbound::Rejected(response)) = decode_inbound(
            &topics,
            &topics.rpc,
            br#"{"id":5,"src":"ops","params":{}}"#,
        ) else {
            panic!("frame with an id must be answered");
        };

        assert_eq!(response.id, 5);
        assert_eq!(response.src.as_deref(), Some("box-3"));
        assert_eq!(response.dst.as_deref(), Some("ops"));
        assert_eq!(response.error.map(|err| err.code), Some(400));
        assert_eq!(Topics::rpc_reply("ops"), "ops/rpc");
    }

    #[test]
    fn stalled_broker_does_not_block_actions() {
        // The event loop is never polled, so the request queue fills after one publish.
        let (mqtt, _eventloop) = AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 1883), 1);
        let ctx = ControlContext {
            mqtt,
            topics: Topics::for_machine("box-3"),
            timezone: chrono_tz::UTC,
            pins: Arc::new(SimulatedPins::new()),
            pulse_ready: Arc::new(Notify::new()),
            schedule_every: Duration::from_secs(1),
            status_every: Duration::from_secs(1),
            report_every: Duration::from_secs(1),
        };
        let was_high = ctx.pins.machine_high.load(Ordering::Relaxed);
        let level = if was_high { MACHINE_PIN_OFF } else { MACHINE_PIN_ON };

        let mut actions: Vec<MachineAction> = (0..200)
            .map(|n| MachineAction::Publish {
                channel: Channel::Report,
                payload: serde_json::json!({ "n": n }),
            })
            .collect();
        actions.push(MachineAction::DriveMachinePin(level));
        execute_actions(&ctx, actions);

        assert_eq!(ctx.pins.machine_high.load(Ordering::Relaxed), level.is_high());
    }

    #[test]
    fn oversized_payloads_are_dropped() {
        let topics = Topics::for_machine("box-3");
        let payload = vec![b' '; MAX_MQTT_PAYLOAD_BYTES + 1];

        assert!(decode_inbound(&topics, &topics.set, &payload).is_none());
    }

    #[test]
    fn channels_map_to_machine_topics() {
        let topics = Topics::for_machine("box-3");

        assert_eq!(topic_for(&topics, Channel::Report), "machine/box-3/in/report");
        assert_eq!(
            topic_for(&topics, Channel::Confirmation),
            "machine/box-3/confirmation"
        );
        assert_eq!(topic_for(&topics, Channel::Status), "machine/box-3/status");
    }

    #[test]
    fn rpc_error_codes_become_http_statuses() {
        assert_eq!(http_status(400), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(404), StatusCode::NOT_FOUND);
        assert_eq!(http_status(-1), StatusCode::BAD_REQUEST);
    }
}
