pub mod commands;
pub mod config;
pub mod counters;
pub mod error;
pub mod machine;
pub mod report;
pub mod schedule;
pub mod status;
pub mod storage;
pub mod topics;
pub mod types;

pub use commands::{Command, Ingress};
pub use config::{
    MachineConfig, NetworkConfig, PersistedState, PinConfig, ReportMode, RuntimeConfig,
};
pub use counters::{CounterStore, CounterUpdate, PulseCounters, PulseDelta, PulseKind};
pub use error::{BringUpError, PersistenceError, ValidationError};
pub use machine::{Channel, MachineAction, MachineEngine};
pub use schedule::{ControlMode, ScheduleController, MACHINE_PIN_OFF, MACHINE_PIN_ON};
pub use status::StatusMonitor;
pub use storage::{FileStorage, MemoryStorage, StateStorage};
pub use topics::*;
pub use types::{
    CommandEnvelope, MachineStatus, PinLevel, ReportPayload, ReportSnapshot, RpcRejection,
    RpcRequest, RpcResponse,
};
