// src/config.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::Deserialize;

use crate::drivers::GaugeError;

// ---------------------------------------------------------------------------
// Amplifier stack
// ---------------------------------------------------------------------------
pub const MAX_AMP_NUM: usize = 4; // two stacks of two heads
pub const STACK_COUNT: usize = MAX_AMP_NUM / 2;
pub const READ_BUF_SIZE: usize = 36; // "M0," + 4 x "+dd.ddd" + 3 commas + CRLF
pub const DEFAULT_BAUD_RATE: u32 = 38_400;
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------
pub const MAX_PANEL_DATA: usize = 600;
pub const PANEL_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_LINK_ERRORS: u32 = 3; // consecutive failed polls before the panel is aborted

// ---------------------------------------------------------------------------
// Filter & judgment
// ---------------------------------------------------------------------------
pub const DATA_DIV: f32 = 1.0; // outlier tolerance around the nominal thickness
pub const JUDGMENT_VALUE: f32 = 0.5; // max spread of a flat panel

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------
pub const SIM_IDLE_POLLS: u64 = 50;
pub const SIM_PANEL_POLLS: u64 = 300;
pub const SIM_NOISE_MM: f32 = 0.02;
pub const SIM_POLL_DELAY: Duration = Duration::from_millis(2);

/// Runtime configuration, read from an optional TOML file.
///
/// Every field falls back to the constants above, so an empty file (or no
/// file at all) is a valid configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GaugeConfig {
    pub serial: SerialConfig,
    pub acquisition: AcquisitionConfig,
    pub judgment: JudgmentConfig,
    pub session: SessionConfig,
    pub simulation: SimulationConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            response_timeout_ms: RESPONSE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl SerialConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub max_panel_data: usize,
    pub panel_wait_timeout_ms: u64,
    pub max_link_errors: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            max_panel_data: MAX_PANEL_DATA,
            panel_wait_timeout_ms: PANEL_WAIT_TIMEOUT.as_millis() as u64,
            max_link_errors: MAX_LINK_ERRORS,
        }
    }
}

impl AcquisitionConfig {
    pub fn panel_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.panel_wait_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct JudgmentConfig {
    pub data_div: f32,
    pub judgment_value: f32,
}

impl Default for JudgmentConfig {
    fn default() -> Self {
        Self {
            data_div: DATA_DIV,
            judgment_value: JUDGMENT_VALUE,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub log_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("sessions"),
        }
    }
}

/// Shape of the synthetic panel stream used by `--simulate`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: Option<u64>,
    pub idle_polls: u64,
    pub panel_polls: u64,
    pub noise_mm: f32,
    pub poll_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            idle_polls: SIM_IDLE_POLLS,
            panel_polls: SIM_PANEL_POLLS,
            noise_mm: SIM_NOISE_MM,
            poll_delay_ms: SIM_POLL_DELAY.as_millis() as u64,
        }
    }
}

impl SimulationConfig {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }
}

impl GaugeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, GaugeError> {
        toml::from_str(text).map_err(|e| GaugeError::Config(e.to_string()))
    }

    /// Loads `path` if given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, GaugeError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let config = Self::from_toml_str(&text)?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }
}
