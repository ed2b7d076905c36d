use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Electrical level of a digital output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    pub fn is_high(self) -> bool {
        self == Self::High
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::High => 1,
        }
    }

    /// Any non-zero value drives the pin high.
    pub fn from_value(value: i64) -> Self {
        if value == 0 {
            Self::Low
        } else {
            Self::High
        }
    }
}

/// Volatile machine state, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachineStatus {
    pub machine_on: bool,
    pub commanded_power: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerStatePayload {
    pub power_on_auto: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineOnPayload {
    pub machine_on: bool,
}

/// Report fields compared between ticks when deduplicating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSnapshot {
    pub total_bag: f64,
    pub total_gift: f64,
    pub init_bag: f64,
    pub init_gift: f64,
    pub enable_auto: bool,
    pub on_hour: i32,
    pub off_hour: i32,
    pub power_on_auto: bool,
    pub machine_on: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    #[serde(flatten)]
    pub snapshot: ReportSnapshot,
    pub time: DateTime<Utc>,
}

/// One-way command envelope received on the `out/set` channel.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: i64,
    #[serde(default)]
    pub src: Option<String>,
    pub method: String,
    #[serde(default, alias = "args")]
    pub params: Value,
}

/// Addressing part of a request frame, readable even when the rest is not.
#[derive(Debug, Deserialize)]
struct RpcHeader {
    id: i64,
    #[serde(default)]
    src: Option<String>,
}

/// A request frame that cannot be executed.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcRejection {
    /// No usable `id`: there is nobody to answer.
    Unaddressable(ValidationError),
    /// The caller is known and gets a failure frame.
    Invalid {
        id: i64,
        src: Option<String>,
        error: ValidationError,
    },
}

impl RpcRejection {
    /// Failure frame for the caller, if the frame carried an id.
    pub fn response(&self, machine_id: &str) -> Option<RpcResponse> {
        match self {
            Self::Unaddressable(_) => None,
            Self::Invalid { id, src, error } => {
                Some(RpcResponse::failure(*id, error).routed(machine_id, src.clone()))
            }
        }
    }
}

impl std::fmt::Display for RpcRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unaddressable(error) => write!(f, "unaddressable frame: {error}"),
            Self::Invalid { id, error, .. } => write!(f, "request {id}: {error}"),
        }
    }
}

impl RpcRequest {
    /// Decode in two passes: the header first, so any frame with a readable
    /// `id` can still be answered when its method or params are malformed.
    pub fn decode(payload: &[u8]) -> Result<Self, RpcRejection> {
        let frame: Value = serde_json::from_slice(payload)
            .map_err(|err| RpcRejection::Unaddressable(ValidationError::malformed(&err)))?;
        let header = RpcHeader::deserialize(&frame)
            .map_err(|err| RpcRejection::Unaddressable(ValidationError::malformed(&err)))?;

        Self::deserialize(&frame).map_err(|err| RpcRejection::Invalid {
            id: header.id,
            src: header.src,
            error: ValidationError::malformed(&err),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            id,
            src: None,
            dst: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: i64, err: &ValidationError) -> Self {
        Self {
            id,
            src: None,
            dst: None,
            result: None,
            error: Some(RpcErrorBody {
                code: err.code,
                message: err.message.clone(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Address the response from this machine back to the caller.
    pub fn routed(mut self, machine_id: &str, dst: Option<String>) -> Self {
        self.src = Some(machine_id.to_string());
        self.dst = dst;
        self
    }
}
