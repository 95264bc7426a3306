// src/drivers/mod.rs
// 声明同级目录下的子模块文件
pub mod acquisition;
pub mod aggregator;
pub mod error;
pub mod filter;
pub mod link;
pub mod panel;
pub mod simulator;
pub mod source;
// 公开导出这些模块里的结构体，方便外部调用
pub use acquisition::{measure, spawn_measurement, MeasurementHandle, SharedAggregator};
pub use aggregator::{ChannelAggregator, LiveValues};
pub use error::GaugeError;
pub use link::{list_ports, open_serial};
pub use panel::{Panel, PanelOutcome, RawSample};
pub use simulator::SimulatedAmplifier;
pub use source::{Amplifier, Command, ManualAmplifier};
