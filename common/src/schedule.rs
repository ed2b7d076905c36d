use chrono::{DateTime, FixedOffset, Timelike};
use log::{info, warn};

use crate::{
    config::PersistedState,
    machine::{Channel, MachineAction},
    types::{PinLevel, PowerStatePayload},
};

/// Output level that powers the machine. The relay board is active-low.
pub const MACHINE_PIN_ON: PinLevel = PinLevel::Low;
/// Output level that cuts machine power.
pub const MACHINE_PIN_OFF: PinLevel = PinLevel::High;

pub fn power_level(on: bool) -> PinLevel {
    if on {
        MACHINE_PIN_ON
    } else {
        MACHINE_PIN_OFF
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Auto,
    Manual,
}

impl ControlMode {
    pub fn from_state(state: &PersistedState) -> Self {
        if state.enable_auto {
            Self::Auto
        } else {
            Self::Manual
        }
    }
}

/// Half-open `[on_hour, off_hour)` window. A window with
/// `on_hour >= off_hour` is empty; overnight spans are not expressible.
pub fn within_window(on_hour: i32, off_hour: i32, hour: u32) -> bool {
    let hour = hour as i64;
    (on_hour as i64) <= hour && hour < (off_hour as i64)
}

/// Derives the commanded power from the schedule and drives the actuator.
#[derive(Debug, Clone, Default)]
pub struct ScheduleController {
    commanded_power: bool,
    manual_power: bool,
    applied: bool,
}

impl ScheduleController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commanded_power(&self) -> bool {
        self.commanded_power
    }

    pub fn manual_power(&self) -> bool {
        self.manual_power
    }

    /// Re-evaluate against `state` and re-apply the result.
    ///
    /// `now` is local wall-clock time; `None` means the clock is not set yet,
    /// in which case an AUTO schedule is left untouched until the next tick.
    pub fn tick(
        &mut self,
        state: &PersistedState,
        now: Option<DateTime<FixedOffset>>,
    ) -> Vec<MachineAction> {
        let desired = match ControlMode::from_state(state) {
            ControlMode::Auto => {
                let Some(now) = now else {
                    warn!("clock unavailable; skipping schedule evaluation");
                    return Vec::new();
                };
                within_window(state.on_hour, state.off_hour, now.hour())
            }
            ControlMode::Manual => self.manual_power,
        };

        if desired != self.commanded_power || !self.applied {
            info!(
                "commanded power {} ({:?})",
                if desired { "ON" } else { "OFF" },
                ControlMode::from_state(state)
            );
        }
        self.commanded_power = desired;
        self.applied = true;

        vec![
            MachineAction::DriveMachinePin(power_level(desired)),
            MachineAction::publish(
                Channel::Status,
                &PowerStatePayload {
                    power_on_auto: desired,
                },
            ),
        ]
    }

    /// Drive the output directly, outside schedule evaluation. The level is
    /// remembered as the manual override so MANUAL ticks keep it; the next
    /// AUTO tick replaces it.
    pub fn override_pin(&mut self, level: PinLevel) -> MachineAction {
        self.manual_power = level == MACHINE_PIN_ON;
        MachineAction::DriveMachinePin(level)
    }
}
