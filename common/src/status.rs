use log::info;

use crate::{
    machine::{Channel, MachineAction},
    types::MachineOnPayload,
};

/// Reports flips of the machine status input. No debouncing: one noisy read
/// produces one publish.
#[derive(Debug, Clone, Default)]
pub struct StatusMonitor {
    last_known_status: bool,
}

impl StatusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine_on(&self) -> bool {
        self.last_known_status
    }

    pub fn poll(&mut self, reading: bool) -> Option<MachineAction> {
        if reading == self.last_known_status {
            return None;
        }

        self.last_known_status = reading;
        info!("machine status changed: on={reading}");
        Some(MachineAction::publish(
            Channel::Status,
            &MachineOnPayload {
                machine_on: reading,
            },
        ))
    }
}
