use core::convert::TryInto;
use std::{
    io,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{
    AnyInputPin, AnyOutputPin, Input, InterruptType, Level, Output, PinDriver, Pull,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use coinbox_common::{
    BringUpError, Channel, CounterStore, MachineAction, MachineEngine, NetworkConfig,
    PersistenceError, PinConfig, PinLevel, PulseCounters, PulseKind, RpcRequest, RpcResponse,
    RuntimeConfig, StateStorage, Topics, MACHINE_PIN_OFF,
};

const NVS_NAMESPACE: &str = "coinbox";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_STATE_KEY: &str = "counts_json";
const NVS_READ_BUFFER: usize = 2048;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const INBOX_CAPACITY: usize = 16;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const CONTROL_LOOP_WAIT_MS: u64 = 50;
/// A delivered edge leaves its interrupt disabled until the next re-arm, so
/// edges closer together than this (rounded up to one FreeRTOS tick) count
/// once. Re-arming runs on its own thread so NVS writes and MQTT publishes in
/// the control loop never widen the window.
const PULSE_REARM_MS: u64 = 5;
/// SNTP has not run yet while the RTC still reports a date before this year.
const MIN_PLAUSIBLE_YEAR: i32 = 2024;

enum Inbound {
    OneWay(Vec<u8>),
    Rpc(RpcRequest),
    Rejected(RpcResponse),
}

/// The state document stored as one NVS string.
#[derive(Clone)]
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    key: &'static str,
    lock: Arc<Mutex<()>>,
}

struct PulseInputs {
    coin: PinDriver<'static, AnyInputPin, Input>,
    gift: PinDriver<'static, AnyInputPin, Input>,
}

struct MachinePins {
    status: PinDriver<'static, AnyInputPin, Input>,
    machine: PinDriver<'static, AnyOutputPin, Output>,
}

type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    apply_build_defaults(&mut runtime);
    runtime.validate().context("invalid runtime configuration")?;
    let timezone: Tz = runtime
        .machine
        .timezone
        .parse()
        .map_err(|_| BringUpError::InvalidConfig {
            field: "machine.timezone",
            reason: format!("unknown timezone `{}`", runtime.machine.timezone),
        })?;

    info!(
        "machine `{}`: ssid=`{}`, mqtt=`{}:{}`, pins={:?}",
        runtime.machine.machine_id,
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.machine.pins,
    );

    let storage = NvsStorage::new(nvs_partition.clone(), NVS_STATE_KEY);
    let engine = MachineEngine::new(&runtime.machine, CounterStore::open(storage));
    let (inputs, pins) = init_pins(&runtime.machine.pins, engine.counters().pulse_counters())?;
    spawn_pulse_rearm(inputs)?;

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let topics = Topics::for_machine(&runtime.machine.machine_id);
    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    let (inbox_tx, inbox_rx) = mpsc::sync_channel(INBOX_CAPACITY);

    spawn_mqtt_receiver(mqtt_conn, mqtt_client.clone(), topics.clone(), inbox_tx)?;
    let control = spawn_control_loop(
        engine,
        pins,
        ControlContext {
            mqtt: mqtt_client,
            topics,
            timezone,
            schedule_every_ms: runtime.machine.schedule_interval_ms,
            status_every_ms: runtime.machine.status_poll_interval_ms,
            report_every_ms: runtime.machine.report_interval_ms,
        },
        inbox_rx,
    )?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    control
        .join()
        .map_err(|_| anyhow!("control loop panicked"))?;
    Ok(())
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; NVS_READ_BUFFER];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

/// Fill fields NVS left empty from values baked in at build time.
fn apply_build_defaults(runtime: &mut RuntimeConfig) {
    let defaults = [
        (&mut runtime.machine.machine_id, option_env!("MACHINE_ID")),
        (&mut runtime.network.wifi_ssid, option_env!("WIFI_SSID")),
        (&mut runtime.network.wifi_pass, option_env!("WIFI_PASS")),
        (&mut runtime.network.mqtt_user, option_env!("MQTT_USER")),
        (&mut runtime.network.mqtt_pass, option_env!("MQTT_PASS")),
    ];
    for (field, baked) in defaults {
        match baked {
            Some(value) if field.is_empty() => *field = value.to_string(),
            _ => {}
        }
    }

    if let Some(host) = option_env!("MQTT_HOST") {
        if runtime.network.mqtt_host == NetworkConfig::default().mqtt_host {
            runtime.network.mqtt_host = host.to_string();
        }
    }
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition, key: &'static str) -> Self {
        Self {
            partition,
            key,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, PersistenceError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| PersistenceError::Backend(format!("nvs open: {err}")))
    }
}

impl StateStorage for NvsStorage {
    fn read(&self) -> Result<Vec<u8>, PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; NVS_READ_BUFFER];

        match nvs.get_str(self.key, &mut buffer) {
            Ok(Some(value)) => Ok(value.as_bytes().to_vec()),
            Ok(None) => Err(PersistenceError::Open(io::Error::new(
                io::ErrorKind::NotFound,
                format!("nvs key `{}` not set", self.key),
            ))),
            Err(err) => Err(PersistenceError::Backend(format!("nvs read: {err}"))),
        }
    }

    fn write(&self, contents: &[u8]) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let contents = core::str::from_utf8(contents)
            .map_err(|err| PersistenceError::Backend(format!("state is not utf-8: {err}")))?;
        let mut nvs = self.open()?;
        nvs.set_str(self.key, contents)
            .map_err(|err| PersistenceError::Backend(format!("nvs write: {err}")))
    }
}

fn init_pins(
    config: &PinConfig,
    pulses: Arc<PulseCounters>,
) -> Result<(PulseInputs, MachinePins), BringUpError> {
    let peripheral = |pin: i32, err: esp_idf_svc::sys::EspError| {
        BringUpError::Peripheral(format!("GPIO{pin}: {err}"))
    };

    let coin = pulse_input(config.coin_pin, PulseKind::Bag, pulses.clone())
        .map_err(|err| peripheral(config.coin_pin, err))?;
    let gift = pulse_input(config.gift_pin, PulseKind::Gift, pulses)
        .map_err(|err| peripheral(config.gift_pin, err))?;
    let status = PinDriver::input(unsafe { AnyInputPin::new(config.status_pin) })
        .map_err(|err| peripheral(config.status_pin, err))?;

    let mut machine = PinDriver::output(unsafe { AnyOutputPin::new(config.machine_pin) })
        .map_err(|err| peripheral(config.machine_pin, err))?;
    machine
        .set_level(gpio_level(MACHINE_PIN_OFF))
        .map_err(|err| peripheral(config.machine_pin, err))?;

    info!(
        "pulse inputs on GPIO{} (bag) and GPIO{} (gift), status GPIO{}, machine GPIO{}",
        config.coin_pin, config.gift_pin, config.status_pin, config.machine_pin
    );
    Ok((PulseInputs { coin, gift }, MachinePins { status, machine }))
}

/// Falling-edge input with pull-up. The ISR only bumps an atomic counter.
fn pulse_input(
    pin: i32,
    kind: PulseKind,
    pulses: Arc<PulseCounters>,
) -> Result<PinDriver<'static, AnyInputPin, Input>, esp_idf_svc::sys::EspError> {
    let mut driver = PinDriver::input(unsafe { AnyInputPin::new(pin) })?;
    driver.set_pull(Pull::Up)?;
    driver.set_interrupt_type(InterruptType::NegEdge)?;
    // SAFETY: the callback runs in ISR context and does a single atomic add.
    unsafe {
        driver.subscribe(move || pulses.record(kind))?;
    }
    driver.enable_interrupt()?;
    Ok(driver)
}

impl PulseInputs {
    /// The HAL disables a pin's interrupt after each delivery.
    fn rearm(&mut self) {
        for (name, pin) in [("coin", &mut self.coin), ("gift", &mut self.gift)] {
            if let Err(err) = pin.enable_interrupt() {
                warn!("failed to re-arm {name} interrupt: {err}");
            }
        }
    }
}

fn spawn_pulse_rearm(mut inputs: PulseInputs) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("pulse-rearm".into())
        .stack_size(4 * 1024)
        .spawn(move || loop {
            inputs.rearm();
            thread::sleep(Duration::from_millis(PULSE_REARM_MS));
        })
        .context("failed to spawn pulse re-arm thread")?;
    Ok(())
}

impl MachinePins {
    fn status_on(&self) -> bool {
        self.status.is_high()
    }

    fn drive_machine(&mut self, level: PinLevel) {
        match self.machine.set_level(gpio_level(level)) {
            Ok(()) => info!("machine pin -> {level:?}"),
            Err(err) => warn!("failed to drive machine pin {level:?}: {err}"),
        }
    }
}

fn gpio_level(level: PinLevel) -> Level {
    match level {
        PinLevel::Low => Level::Low,
        PinLevel::High => Level::High,
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(BringUpError::MissingConfig("network.wifi_ssid").into());
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        let result = wifi.connect().and_then(|()| wifi.wait_netif_up());
        match result {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                drop(wifi);
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    // Keep counting offline; the control loop restarts the device if the
    // station never comes up.
    warn!("wifi unavailable after {WIFI_CONNECT_ATTEMPTS} attempts; running offline");
    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    runtime: &RuntimeConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let network = &runtime.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);
    let client_id = format!("coinbox-{}", runtime.machine.machine_id);

    let conf = MqttClientConfiguration {
        client_id: Some(client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &SharedMqtt, topics: &Topics) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    for topic in [&topics.set, &topics.rpc] {
        mqtt.subscribe(topic, QoS::AtLeastOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: SharedMqtt,
    topics: Topics,
    inbox: SyncSender<Inbound>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => event,
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    continue;
                }
            };

            match event.payload() {
                EventPayload::Connected(_) => {
                    info!("mqtt connected");
                    if let Err(err) = subscribe_topics(&mqtt, &topics) {
                        warn!("mqtt subscribe failed: {err:#}");
                    }
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details,
                    ..
                } => {
                    // Fragmented payloads exceed the size limit anyway.
                    if !matches!(details, Details::Complete) {
                        continue;
                    }
                    if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            topic,
                            data.len()
                        );
                        continue;
                    }

                    let inbound = if topic == topics.set {
                        Inbound::OneWay(data.to_vec())
                    } else if topic == topics.rpc {
                        match RpcRequest::decode(data) {
                            Ok(request) => Inbound::Rpc(request),
                            Err(rejection) => {
                                warn!("rejecting rpc frame: {rejection}");
                                match rejection.response(&topics.machine_id) {
                                    Some(response) => Inbound::Rejected(response),
                                    None => continue,
                                }
                            }
                        }
                    } else {
                        continue;
                    };
                    if inbox.send(inbound).is_err() {
                        warn!("control loop gone; stopping mqtt receiver");
                        return;
                    }
                }
                _ => {}
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

struct ControlContext {
    mqtt: SharedMqtt,
    topics: Topics,
    timezone: Tz,
    schedule_every_ms: u64,
    status_every_ms: u64,
    report_every_ms: u64,
}

/// Monotonic deadline for one periodic tick.
struct Ticker {
    every_ms: u64,
    due_ms: u64,
}

impl Ticker {
    fn new(every_ms: u64) -> Self {
        Self { every_ms, due_ms: 0 }
    }

    fn fire(&mut self, now_ms: u64) -> bool {
        if now_ms < self.due_ms {
            return false;
        }
        self.due_ms = now_ms.saturating_add(self.every_ms);
        true
    }
}

fn spawn_control_loop(
    mut engine: MachineEngine<NvsStorage>,
    mut pins: MachinePins,
    ctx: ControlContext,
    inbox: Receiver<Inbound>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut schedule = Ticker::new(ctx.schedule_every_ms);
            let mut status = Ticker::new(ctx.status_every_ms);
            let mut report = Ticker::new(ctx.report_every_ms);
            let mut wifi_disconnected_since_ms: Option<u64> = None;

            loop {
                feed_watchdog();
                engine.absorb_pulses();

                match inbox.recv_timeout(Duration::from_millis(CONTROL_LOOP_WAIT_MS)) {
                    Ok(Inbound::OneWay(payload)) => {
                        let actions = engine.handle_one_way(&payload);
                        execute_actions(&ctx, &mut pins, actions);
                    }
                    Ok(Inbound::Rpc(request)) => {
                        let (response, actions) = engine.handle_request(&request);
                        let response =
                            response.routed(&ctx.topics.machine_id, request.src.clone());
                        publish_rpc_response(&ctx.mqtt, &response);
                        execute_actions(&ctx, &mut pins, actions);
                    }
                    Ok(Inbound::Rejected(response)) => publish_rpc_response(&ctx.mqtt, &response),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("mqtt receiver stopped; control loop continues offline");
                        thread::sleep(Duration::from_millis(CONTROL_LOOP_WAIT_MS));
                    }
                }

                let now_ms = monotonic_ms();
                if schedule.fire(now_ms) {
                    let actions = engine.schedule_tick(now_in_timezone(ctx.timezone));
                    execute_actions(&ctx, &mut pins, actions);
                }
                if status.fire(now_ms) {
                    let actions = engine.status_tick(pins.status_on());
                    execute_actions(&ctx, &mut pins, actions);
                }
                if report.fire(now_ms) {
                    let actions = engine.report_tick(Utc::now());
                    execute_actions(&ctx, &mut pins, actions);
                }

                if is_wifi_station_connected() {
                    wifi_disconnected_since_ms = None;
                } else if let Some(since_ms) = wifi_disconnected_since_ms {
                    if now_ms.saturating_sub(since_ms) >= WIFI_RESTART_GRACE_MS {
                        warn!(
                            "wifi disconnected for {}s; restarting device for recovery",
                            WIFI_RESTART_GRACE_MS / 1000
                        );
                        engine.absorb_pulses();
                        thread::sleep(Duration::from_millis(100));
                        unsafe { esp_idf_svc::sys::esp_restart() };
                    }
                } else {
                    wifi_disconnected_since_ms = Some(now_ms);
                }
            }
        })
        .context("failed to spawn control loop thread")
}

fn execute_actions(ctx: &ControlContext, pins: &mut MachinePins, actions: Vec<MachineAction>) {
    for action in actions {
        match action {
            MachineAction::DriveMachinePin(level) => pins.drive_machine(level),
            MachineAction::Publish { channel, payload } => {
                let topic = match channel {
                    Channel::Report => &ctx.topics.report,
                    Channel::Confirmation => &ctx.topics.confirmation,
                    Channel::Status => &ctx.topics.status,
                };
                publish_json(&ctx.mqtt, topic, &payload);
            }
        }
    }
}

fn publish_rpc_response(mqtt: &SharedMqtt, response: &RpcResponse) {
    match response.dst.as_deref() {
        Some(dst) => publish_json(mqtt, &Topics::rpc_reply(dst), response),
        None => warn!("rpc {} has no src; response not routed", response.id),
    }
}

fn publish_json(mqtt: &SharedMqtt, topic: &str, payload: &impl Serialize) {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(err) => {
            warn!("serialization for {topic} failed: {err}");
            return;
        }
    };
    let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(err) = client.publish(topic, QoS::AtLeastOnce, false, &body) {
        warn!("publish to {topic} failed: {err}");
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

/// Local wall-clock time, or `None` until SNTP has set the clock.
fn now_in_timezone(timezone: Tz) -> Option<DateTime<FixedOffset>> {
    let now = Utc::now();
    if now.year() < MIN_PLAUSIBLE_YEAR {
        return None;
    }
    let local = now.with_timezone(&timezone);
    Some(local.with_timezone(&local.offset().fix()))
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
