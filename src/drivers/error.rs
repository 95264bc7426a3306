use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures on the serial line to the amplifier stack.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("malformed amplifier response: field {field} in {response:?} is not a number")]
    Protocol { field: usize, response: String },
    #[error("no complete response from amplifier within {0:?}")]
    Timeout(Duration),
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open serial port: {0}")]
    Serial(#[from] serialport::Error),
}

/// Terminal acquisition failures, stored on the panel rather than returned.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanelError {
    #[error("panel already under measurement")]
    AlreadyActive,
    #[error("panel data overflow: more than {capacity} samples")]
    Overflow { capacity: usize },
    #[error("no panel arrived within {waited_ms} ms")]
    Timeout { waited_ms: u64 },
    #[error("amplifier link failed: {0}")]
    Link(String),
}

/// Session and control-level errors.
#[derive(Debug, Error)]
pub enum GaugeError {
    #[error("no measurement session is open")]
    NoSession,
    #[error("a measurement is already in progress")]
    AlreadyActive,
    #[error("thickness {0:?} is not a number")]
    InvalidThickness(String),
    #[error("stack index {0} out of range")]
    InvalidStack(usize),
    #[error("session log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session log record is malformed: {0}")]
    Record(String),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("measurement worker exited without returning the panel")]
    WorkerLost,
    #[error("measurement did not finish within {0:?}")]
    Timeout(Duration),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for GaugeError {
    fn from(value: serde_json::Error) -> Self {
        GaugeError::Record(value.to_string())
    }
}
