// src/types.rs
use serde::Serialize;

use crate::drivers::{Command, LiveValues, Panel, PanelOutcome, RawSample};

// 连接模式
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum ConnectionMode {
    Simulation,
    Hardware,
}

// 调用方发给后台的命令
#[derive(Clone, Debug)]
pub enum GaugeCommand {
    StartSession { material: String, thickness: String },
    // repeat = 重新测量当前面板 (编号不变)
    Measure { repeat: bool },
    Calibrate { stack: usize, reference: f32 },
    Power(bool),
    Reset,
    // 读回每个通道的某项设定
    ReadSettings(Command),
    SetLiveView(bool),
    EndSession,
    Shutdown,
}

// 后台发给调用方的消息
#[derive(Clone, Debug)]
pub enum GaugeMessage {
    Log(String),
    SessionStatus(bool),
    MeasurementStarted(u32),
    PanelFinished(PanelReport),
    Values(LiveValues),
    Settings { code: &'static str, values: Vec<String> },
    Error(String),
    Stopped,
}

/// Snapshot of a finished panel for display.
#[derive(Clone, Debug, Serialize)]
pub struct PanelReport {
    pub id: u32,
    pub thickness: f32,
    pub outcome: PanelOutcome,
    pub raw: Vec<RawSample>,
    pub filtered: Vec<(f32, f32)>,
}

impl From<&Panel> for PanelReport {
    fn from(panel: &Panel) -> Self {
        Self {
            id: panel.id(),
            thickness: panel.thickness(),
            outcome: panel.outcome(),
            raw: panel.raw_samples().to_vec(),
            filtered: panel.filtered_samples().to_vec(),
        }
    }
}

impl PanelReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, PanelOutcome::Failed { .. })
    }

    /// One-line result; errors are reported before any quality.
    pub fn summary(&self) -> String {
        match &self.outcome {
            PanelOutcome::Failed { error } => format!("Panel {}: ERROR {error}", self.id),
            PanelOutcome::Judged {
                quality,
                spread1,
                spread2,
            } => format!(
                "Panel {}: {:?} ({} samples, spread {:.3} / {:.3} mm at {:.3} mm)",
                self.id,
                quality,
                self.raw.len(),
                spread1,
                spread2,
                self.thickness
            ),
            PanelOutcome::Pending => format!("Panel {}: not measured", self.id),
        }
    }
}
