// src/main.rs
mod config;
mod drivers;
mod engine;
mod recorder;
mod types;

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use crate::config::GaugeConfig;
use crate::drivers::{
    list_ports, measure, open_serial, Amplifier, ChannelAggregator, Command, ManualAmplifier,
    Panel, PanelOutcome, SimulatedAmplifier,
};
use crate::recorder::{read_session_log, PanelRecord, SessionManager};
use crate::types::{ConnectionMode, GaugeCommand, GaugeMessage, PanelReport};

const DEFAULT_SIM_THICKNESS: f32 = 12.0;

#[derive(Parser, Debug)]
#[command(name = "panel-gauge", version, about = "Laser panel thickness gauge")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port of the amplifier stack (overrides the config file)
    #[arg(long, global = true)]
    port: Option<String>,

    /// Use the built-in simulated amplifier instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Directory for session logs (overrides the config file)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a session and measure panels as they pass the heads
    Run {
        material: String,
        thickness: String,
        /// Number of panels to measure
        #[arg(long, default_value_t = 1)]
        panels: u32,
        /// Measure a failed panel again under the same number
        #[arg(long)]
        repeat_failed: bool,
    },
    /// Zero-shift one stack against a reference block
    Calibrate { stack: usize, reference: f32 },
    /// Print live head and stack values
    Values {
        #[arg(long, default_value_t = 10)]
        count: u32,
    },
    /// Factory-reset every amplifier and restore the wide judgment limits
    Reset,
    /// Read one setting back from every amplifier (three-digit code, e.g. 067)
    Settings {
        #[arg(default_value = "067")]
        code: String,
    },
    /// Re-judge the panels of a session log with the current settings
    Replay {
        log: PathBuf,
        #[arg(long)]
        data_div: Option<f32>,
        #[arg(long)]
        judgment_value: Option<f32>,
    },
    /// List serial ports
    Ports,
}

// 入口函数
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = GaugeConfig::load(cli.config.as_deref())?;
    if let Some(port) = &cli.port {
        config.serial.port = Some(port.clone());
    }
    if let Some(dir) = &cli.log_dir {
        config.session.log_dir = dir.clone();
    }
    let mode = if cli.simulate {
        ConnectionMode::Simulation
    } else {
        ConnectionMode::Hardware
    };

    match cli.command {
        Commands::Run {
            material,
            thickness,
            panels,
            repeat_failed,
        } => {
            let sim_thickness = thickness.trim().parse().unwrap_or(DEFAULT_SIM_THICKNESS);
            let amp = open_amplifier(mode, &config, sim_thickness)?;
            run_session(amp, config, &material, &thickness, panels, repeat_failed)
        }
        Commands::Calibrate { stack, reference } => {
            let amp = open_amplifier(mode, &config, reference)?;
            let client = EngineClient::start(amp, config);
            client.send(GaugeCommand::Power(true))?;
            client.send(GaugeCommand::Calibrate { stack, reference })?;
            client.finish()
        }
        Commands::Values { count } => {
            let amp = open_amplifier(mode, &config, DEFAULT_SIM_THICKNESS)?;
            let client = EngineClient::start(amp, config);
            client.send(GaugeCommand::Power(true))?;
            client.send(GaugeCommand::SetLiveView(true))?;
            let mut shown = 0;
            while shown < count {
                match client.recv()? {
                    GaugeMessage::Values(values) => {
                        println!("{values}");
                        shown += 1;
                    }
                    GaugeMessage::Error(text) => bail!(text),
                    other => print_message(&other),
                }
            }
            client.finish()
        }
        Commands::Reset => {
            let amp = open_amplifier(mode, &config, DEFAULT_SIM_THICKNESS)?;
            let client = EngineClient::start(amp, config);
            client.send(GaugeCommand::Reset)?;
            client.finish()
        }
        Commands::Settings { code } => {
            let command =
                Command::from_code(&code).ok_or_else(|| anyhow!("unknown command code {code:?}"))?;
            let amp = open_amplifier(mode, &config, DEFAULT_SIM_THICKNESS)?;
            let client = EngineClient::start(amp, config);
            client.send(GaugeCommand::ReadSettings(command))?;
            client.finish()
        }
        Commands::Replay {
            log,
            data_div,
            judgment_value,
        } => {
            if let Some(v) = data_div {
                config.judgment.data_div = v;
            }
            if let Some(v) = judgment_value {
                config.judgment.judgment_value = v;
            }
            replay(&log, &config)
        }
        Commands::Ports => {
            let ports = list_ports();
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                println!("{port}");
            }
            Ok(())
        }
    }
}

fn open_amplifier(
    mode: ConnectionMode,
    config: &GaugeConfig,
    sim_thickness: f32,
) -> Result<Box<dyn Amplifier>> {
    match mode {
        ConnectionMode::Simulation => {
            info!("🤖 Simulated amplifier, {sim_thickness:.3} mm panels");
            Ok(Box::new(SimulatedAmplifier::from_config(
                sim_thickness,
                &config.simulation,
            )))
        }
        ConnectionMode::Hardware => {
            let port = match &config.serial.port {
                Some(port) => port.clone(),
                None => match list_ports().into_iter().next() {
                    Some(port) => port,
                    None => bail!("no serial port found; pass --port or --simulate"),
                },
            };
            let link = open_serial(&port, config.serial.baud_rate, config.serial.response_timeout())
                .with_context(|| format!("opening amplifier on {port}"))?;
            info!("🔌 Amplifier connected on {port}");
            Ok(Box::new(link))
        }
    }
}

fn print_message(msg: &GaugeMessage) {
    match msg {
        GaugeMessage::Log(text) => println!("{text}"),
        GaugeMessage::MeasurementStarted(id) => println!("Waiting for panel {id}..."),
        GaugeMessage::PanelFinished(report) => println!("{}", report.summary()),
        GaugeMessage::Values(values) => println!("{values}"),
        GaugeMessage::Settings { code, values } => {
            for (channel, value) in values.iter().enumerate() {
                println!("{code} ch{channel:02}: {value}");
            }
        }
        GaugeMessage::Error(text) => eprintln!("Error: {text}"),
        GaugeMessage::SessionStatus(_) | GaugeMessage::Stopped => {}
    }
}

/// Caller side of the control thread.
struct EngineClient {
    tx_cmd: Sender<GaugeCommand>,
    rx: Receiver<GaugeMessage>,
    worker: JoinHandle<()>,
}

impl EngineClient {
    fn start(amp: Box<dyn Amplifier>, config: GaugeConfig) -> Self {
        let (tx, rx) = mpsc::channel();
        let (tx_cmd, rx_cmd) = mpsc::channel();
        let sessions = SessionManager::new(
            config.session.log_dir.clone(),
            config.acquisition.max_panel_data,
        );
        let amp = Arc::new(Mutex::new(ChannelAggregator::new(amp)));
        let worker = engine::spawn_thread(amp, config, sessions, tx, rx_cmd);
        Self { tx_cmd, rx, worker }
    }

    fn send(&self, cmd: GaugeCommand) -> Result<()> {
        self.tx_cmd.send(cmd).context("engine stopped")
    }

    fn recv(&self) -> Result<GaugeMessage> {
        self.rx.recv().context("engine stopped")
    }

    /// Shuts the engine down, printing whatever it still reports. Fails if
    /// any command ended in an error.
    fn finish(self) -> Result<()> {
        self.send(GaugeCommand::Shutdown).ok();
        let mut failure = None;
        for msg in self.rx.iter() {
            match msg {
                GaugeMessage::Stopped => break,
                GaugeMessage::Error(text) => {
                    eprintln!("Error: {text}");
                    failure = Some(text);
                }
                other => print_message(&other),
            }
        }
        if self.worker.join().is_err() {
            bail!("engine thread panicked");
        }
        match failure {
            Some(text) => Err(anyhow!(text)),
            None => Ok(()),
        }
    }
}

fn run_session(
    amp: Box<dyn Amplifier>,
    config: GaugeConfig,
    material: &str,
    thickness: &str,
    panels: u32,
    repeat_failed: bool,
) -> Result<()> {
    let client = EngineClient::start(amp, config);
    client.send(GaugeCommand::StartSession {
        material: material.to_owned(),
        thickness: thickness.to_owned(),
    })?;
    client.send(GaugeCommand::Power(true))?;
    client.send(GaugeCommand::Measure { repeat: false })?;

    let mut measured = 0;
    let mut session_open = false;
    loop {
        let msg = client.recv()?;
        match &msg {
            GaugeMessage::SessionStatus(open) => {
                if session_open && !open {
                    warn!("Session closed unexpectedly");
                    break;
                }
                session_open = *open;
            }
            GaugeMessage::PanelFinished(report) => {
                print_message(&msg);
                if report.is_failed() && repeat_failed {
                    client.send(GaugeCommand::Measure { repeat: true })?;
                    continue;
                }
                measured += 1;
                if measured >= panels {
                    break;
                }
                client.send(GaugeCommand::Measure { repeat: false })?;
            }
            GaugeMessage::Error(_) => {
                print_message(&msg);
                if !session_open {
                    break;
                }
            }
            GaugeMessage::Stopped => break,
            _ => print_message(&msg),
        }
    }

    if session_open {
        client.send(GaugeCommand::EndSession)?;
    }
    client.finish()
}

/// Feeds each recorded panel back through acquisition and judgment.
fn replay(path: &Path, config: &GaugeConfig) -> Result<()> {
    let sessions =
        read_session_log(path).with_context(|| format!("reading {}", path.display()))?;
    for session in sessions {
        let header = &session.header;
        let thickness: f32 = header
            .thickness
            .parse()
            .with_context(|| format!("session {} has no numeric thickness", header.time))?;
        println!("{} {} {} mm", header.time, header.material, header.thickness);
        for record in &session.panels {
            match rejudge(record, thickness, config) {
                Ok(report) => println!("{}", report.summary()),
                Err(reason) => println!("Panel {}: skipped ({reason})", record.id),
            }
        }
    }
    Ok(())
}

/// Runs one logged panel through a scripted amplifier. Panels that failed
/// when recorded, or left no samples, are returned as the reason to skip.
fn rejudge(
    record: &PanelRecord,
    thickness: f32,
    config: &GaugeConfig,
) -> Result<PanelReport, &'static str> {
    if matches!(record.outcome, PanelOutcome::Failed { .. }) {
        return Err("failed when recorded");
    }
    if record.value1.is_empty() || record.value2.is_empty() {
        return Err("no samples recorded");
    }
    let absent = (-99.999, -99.999);
    let stacks = std::iter::once(absent)
        .chain(record.value1.iter().copied().zip(record.value2.iter().copied()))
        .chain(std::iter::once(absent));
    let amp = Mutex::new(ChannelAggregator::new(ManualAmplifier::from_stacks(stacks)));
    let mut panel = Panel::with_capacity(record.value1.len());
    panel.reset(record.id, thickness);
    measure(&amp, &mut panel, &config.acquisition, &config.judgment);
    Ok(PanelReport::from(&panel))
}
