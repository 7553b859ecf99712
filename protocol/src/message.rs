//! Request/response schema spoken between the gateway and device endpoints.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use discovery::{DeviceCategory, ServiceKind};

/// A framed request. Devices only accept commands targeting their own
/// category; everything else earns an [`ErrorCode::InvalidCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Empty,
    ListDevices {
        kind: Option<ServiceKind>,
        name: Option<String>,
    },
    SendActuatorCommand {
        device_id: String,
        action: ActuatorAction,
    },
}

/// Commands understood by the actuator categories. Optional fields leave the
/// corresponding piece of state untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActuatorAction {
    #[serde(rename_all = "camelCase")]
    LightLamp {
        turn_on: Option<bool>,
        brightness: Option<u8>,
        color: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Sink { turn_on: Option<bool> },
    #[serde(rename_all = "camelCase")]
    Toilet {
        flush: Option<bool>,
        lid_open: Option<bool>,
    },
}

impl ActuatorAction {
    /// The device category this action targets.
    pub fn category(&self) -> DeviceCategory {
        match self {
            ActuatorAction::LightLamp { .. } => DeviceCategory::LightLamp,
            ActuatorAction::Sink { .. } => DeviceCategory::Sink,
            ActuatorAction::Toilet { .. } => DeviceCategory::Toilet,
        }
    }
}

/// Closed error taxonomy surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownError,
    DeviceNotFound,
    InvalidCommand,
    DeviceOffline,
    ValidationError,
}

/// A structured error: code, human-readable message and optional metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// A framed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Empty,
    Error(ErrorBody),
    SendActuatorCommand { message: String },
}
