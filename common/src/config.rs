use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::BringUpError;

/// The durable record: running totals plus the power schedule.
///
/// Every field except `last_saved_at` is required when decoding, so a
/// truncated document is rejected instead of being half-applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub total_bag: f64,
    pub total_gift: f64,
    pub init_bag: f64,
    pub init_gift: f64,
    pub enable_auto: bool,
    pub on_hour: i32,
    pub off_hour: i32,
    #[serde(rename = "time", default)]
    pub last_saved_at: Option<DateTime<Utc>>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            total_bag: 0.0,
            total_gift: 0.0,
            init_bag: 0.0,
            init_gift: 0.0,
            enable_auto: true,
            on_hour: 9,
            off_hour: 22,
            last_saved_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    /// Publish (and persist) on every report tick.
    #[default]
    Always,
    /// Publish only when the snapshot differs from the previous tick.
    OnChange,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinConfig {
    pub coin_pin: i32,
    pub gift_pin: i32,
    pub status_pin: i32,
    pub machine_pin: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            coin_pin: 4,
            gift_pin: 5,
            status_pin: 18,
            machine_pin: 23,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub machine_id: String,
    pub timezone: String,
    #[serde(default)]
    pub pins: PinConfig,
    pub report_interval_ms: u64,
    pub schedule_interval_ms: u64,
    pub status_poll_interval_ms: u64,
    #[serde(default)]
    pub report_mode: ReportMode,
    pub state_file: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            machine_id: String::new(),
            timezone: "America/Mexico_City".to_string(),
            pins: PinConfig::default(),
            report_interval_ms: 30_000,
            schedule_interval_ms: 60_000,
            status_poll_interval_ms: 1_000,
            report_mode: ReportMode::Always,
            state_file: "counts.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub machine: MachineConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), BringUpError> {
        self.machine.validate()?;
        if self.network.mqtt_host.trim().is_empty() {
            return Err(BringUpError::MissingConfig("network.mqtt_host"));
        }
        if self.network.mqtt_port == 0 {
            return Err(BringUpError::InvalidConfig {
                field: "network.mqtt_port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }
        Ok(())
    }
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), BringUpError> {
        let id = self.machine_id.trim();
        if id.is_empty() {
            return Err(BringUpError::MissingConfig("machine.machine_id"));
        }
        if id.contains(['/', '+', '#']) {
            return Err(BringUpError::InvalidConfig {
                field: "machine.machine_id",
                reason: "must not contain '/', '+' or '#'".to_string(),
            });
        }

        let intervals = [
            ("machine.report_interval_ms", self.report_interval_ms),
            ("machine.schedule_interval_ms", self.schedule_interval_ms),
            ("machine.status_poll_interval_ms", self.status_poll_interval_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(BringUpError::InvalidConfig {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let pins = [
            self.pins.coin_pin,
            self.pins.gift_pin,
            self.pins.status_pin,
            self.pins.machine_pin,
        ];
        for (index, pin) in pins.iter().enumerate() {
            if *pin < 0 {
                return Err(BringUpError::InvalidConfig {
                    field: "machine.pins",
                    reason: format!("GPIO{pin} is not a valid pin"),
                });
            }
            if pins[index + 1..].contains(pin) {
                return Err(BringUpError::InvalidConfig {
                    field: "machine.pins",
                    reason: format!("GPIO{pin} is assigned more than once"),
                });
            }
        }

        if self.timezone.parse::<Tz>().is_err() {
            return Err(BringUpError::InvalidConfig {
                field: "machine.timezone",
                reason: format!("unknown timezone `{}`", self.timezone),
            });
        }

        if self.state_file.trim().is_empty() {
            return Err(BringUpError::MissingConfig("machine.state_file"));
        }

        Ok(())
    }
}
