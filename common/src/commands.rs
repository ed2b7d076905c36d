//! Remote command vocabulary shared by the request/response and one-way
//! ingress channels.
//!
//! Each method maps to one parser producing a typed [`Command`]; applying a
//! command goes through the [`CounterStore`] setters (which persist) or the
//! [`ScheduleController`] override, and yields the confirmation body.

use serde_json::{json, Value};

use crate::{
    counters::{CounterStore, CounterUpdate},
    error::ValidationError,
    machine::MachineAction,
    schedule::ScheduleController,
    storage::StateStorage,
    topics::{
        METHOD_COUNTERS_SET, METHOD_SET_ENABLE_AUTO, METHOD_SET_OFF_HOUR, METHOD_SET_ON_HOUR,
        METHOD_SET_PIN_MACHINE,
    },
    types::PinLevel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingress {
    /// Request/response: the caller always gets a result or an error.
    Rpc,
    /// Fire-and-forget envelopes; failures are only logged.
    OneWay,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetCounters(CounterUpdate),
    SetEnableAuto(bool),
    SetOnHour(i32),
    SetOffHour(i32),
    SetPinMachine(PinLevel),
}

struct MethodEntry {
    name: &'static str,
    ingress: &'static [Ingress],
    parse: fn(&Value) -> Result<Command, ValidationError>,
}

const ALL_CHANNELS: &[Ingress] = &[Ingress::Rpc, Ingress::OneWay];
const ONE_WAY_ONLY: &[Ingress] = &[Ingress::OneWay];

const METHODS: &[MethodEntry] = &[
    MethodEntry {
        name: METHOD_COUNTERS_SET,
        ingress: ALL_CHANNELS,
        parse: parse_counters,
    },
    MethodEntry {
        name: METHOD_SET_ENABLE_AUTO,
        ingress: ALL_CHANNELS,
        parse: parse_enable_auto,
    },
    MethodEntry {
        name: METHOD_SET_ON_HOUR,
        ingress: ALL_CHANNELS,
        parse: parse_on_hour,
    },
    MethodEntry {
        name: METHOD_SET_OFF_HOUR,
        ingress: ALL_CHANNELS,
        parse: parse_off_hour,
    },
    MethodEntry {
        name: METHOD_SET_PIN_MACHINE,
        ingress: ONE_WAY_ONLY,
        parse: parse_pin_machine,
    },
];

impl Command {
    pub fn parse(ingress: Ingress, method: &str, params: &Value) -> Result<Self, ValidationError> {
        let entry = METHODS
            .iter()
            .find(|entry| entry.name == method && entry.ingress.contains(&ingress))
            .ok_or_else(|| ValidationError::unknown_method(method))?;
        (entry.parse)(params)
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::SetCounters(_) => METHOD_COUNTERS_SET,
            Self::SetEnableAuto(_) => METHOD_SET_ENABLE_AUTO,
            Self::SetOnHour(_) => METHOD_SET_ON_HOUR,
            Self::SetOffHour(_) => METHOD_SET_OFF_HOUR,
            Self::SetPinMachine(_) => METHOD_SET_PIN_MACHINE,
        }
    }

    /// Apply the command. Returns the confirmation body (method name plus
    /// the new values) and any hardware actions it requires.
    pub fn apply<S: StateStorage>(
        self,
        counters: &mut CounterStore<S>,
        schedule: &mut ScheduleController,
    ) -> (Value, Vec<MachineAction>) {
        let method = self.method();
        match self {
            Self::SetCounters(update) => {
                counters.set_counters(&update);
                let state = counters.snapshot();
                let body = json!({
                    "method": method,
                    "total_bag": state.total_bag,
                    "total_gift": state.total_gift,
                    "init_bag": state.init_bag,
                    "init_gift": state.init_gift,
                });
                (body, Vec::new())
            }
            Self::SetEnableAuto(enabled) => {
                counters.set_enable_auto(enabled);
                (json!({"method": method, "enable_auto": enabled}), Vec::new())
            }
            Self::SetOnHour(hour) => {
                counters.set_on_hour(hour);
                (json!({"method": method, "on_hour": hour}), Vec::new())
            }
            Self::SetOffHour(hour) => {
                counters.set_off_hour(hour);
                (json!({"method": method, "off_hour": hour}), Vec::new())
            }
            Self::SetPinMachine(level) => {
                let action = schedule.override_pin(level);
                (
                    json!({"method": method, "pin_machine": level.as_u8()}),
                    vec![action],
                )
            }
        }
    }
}

fn parse_counters(params: &Value) -> Result<Command, ValidationError> {
    let float = |key: &str| params.get(key).and_then(Value::as_f64);
    let update = CounterUpdate {
        total_bag: float("total_bag"),
        total_gift: float("total_gift"),
        init_bag: float("init_bag"),
        init_gift: float("init_gift"),
    };

    if update.is_empty() {
        return Err(ValidationError::invalid_params(
            "expected at least one of total_bag, total_gift, init_bag, init_gift",
        ));
    }
    Ok(Command::SetCounters(update))
}

fn parse_enable_auto(params: &Value) -> Result<Command, ValidationError> {
    params
        .get("enable_auto")
        .and_then(Value::as_bool)
        .map(Command::SetEnableAuto)
        .ok_or_else(|| ValidationError::invalid_params("enable_auto must be a boolean"))
}

fn parse_on_hour(params: &Value) -> Result<Command, ValidationError> {
    hour_field(params, "on_hour").map(Command::SetOnHour)
}

fn parse_off_hour(params: &Value) -> Result<Command, ValidationError> {
    hour_field(params, "off_hour").map(Command::SetOffHour)
}

fn hour_field(params: &Value, key: &str) -> Result<i32, ValidationError> {
    params
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|hour| i32::try_from(hour).ok())
        .ok_or_else(|| ValidationError::invalid_params(format!("{key} must be an integer")))
}

fn parse_pin_machine(params: &Value) -> Result<Command, ValidationError> {
    params
        .get("pin_machine")
        .and_then(Value::as_i64)
        .map(|value| Command::SetPinMachine(PinLevel::from_value(value)))
        .ok_or_else(|| ValidationError::invalid_params("pin_machine must be an integer"))
}
