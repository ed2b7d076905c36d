pub const METHOD_COUNTERS_SET: &str = "Counters.Set";
pub const METHOD_SET_ENABLE_AUTO: &str = "App.SetEnableAuto";
pub const METHOD_SET_ON_HOUR: &str = "App.SetOnHour";
pub const METHOD_SET_OFF_HOUR: &str = "App.SetOffHour";
pub const METHOD_SET_PIN_MACHINE: &str = "App.SetPinMachine";

/// Channel names for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub machine_id: String,
    pub report: String,
    pub set: String,
    pub confirmation: String,
    pub status: String,
    pub rpc: String,
}

impl Topics {
    pub fn for_machine(machine_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            report: format!("machine/{machine_id}/in/report"),
            set: format!("machine/{machine_id}/out/set"),
            confirmation: format!("machine/{machine_id}/confirmation"),
            status: format!("machine/{machine_id}/status"),
            rpc: format!("machine/{machine_id}/rpc"),
        }
    }

    pub fn rpc_reply(dst: &str) -> String {
        format!("{dst}/rpc")
    }
}
