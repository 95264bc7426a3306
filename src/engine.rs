// src/engine.rs
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::PoisonError;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::GaugeConfig;
use crate::drivers::{
    spawn_measurement, Amplifier, ChannelAggregator, GaugeError, MeasurementHandle,
    SharedAggregator,
};
use crate::recorder::SessionManager;
use crate::types::{GaugeCommand, GaugeMessage, PanelReport};

const TICK: Duration = Duration::from_millis(10);
const LIVE_VALUES_PERIOD: Duration = Duration::from_secs(1);

/// Starts the control loop on its own thread.
///
/// The loop never blocks on a measurement: each panel runs on a worker of its
/// own and is picked up here once it has been handed back.
pub fn spawn_thread<A: Amplifier + 'static>(
    amp: SharedAggregator<A>,
    config: GaugeConfig,
    sessions: SessionManager,
    tx: Sender<GaugeMessage>,
    rx_cmd: Receiver<GaugeCommand>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut engine = Engine {
            amp,
            config,
            sessions,
            tx,
            measurement: None,
            live_view: false,
            last_live: Instant::now(),
        };
        engine.log("⚙️ Panel gauge engine ready.");
        engine.run(rx_cmd);
    })
}

struct Engine<A> {
    amp: SharedAggregator<A>,
    config: GaugeConfig,
    sessions: SessionManager,
    tx: Sender<GaugeMessage>,
    measurement: Option<MeasurementHandle>,
    live_view: bool,
    last_live: Instant,
}

impl<A: Amplifier + 'static> Engine<A> {
    fn run(&mut self, rx_cmd: Receiver<GaugeCommand>) {
        loop {
            // 1. 命令处理
            for _ in 0..10 {
                match rx_cmd.try_recv() {
                    Ok(GaugeCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                        self.shutdown();
                        return;
                    }
                    Ok(cmd) => self.handle(cmd),
                    Err(TryRecvError::Empty) => break,
                }
            }
            // 2. 测量完成检查
            self.poll_measurement();
            // 3. 实时数值
            self.refresh_live_values();
            thread::sleep(TICK);
        }
    }

    fn send(&self, msg: GaugeMessage) {
        self.tx.send(msg).ok();
    }

    fn log(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{text}");
        self.send(GaugeMessage::Log(text));
    }

    fn report_error(&self, err: &GaugeError) {
        warn!("{err}");
        self.send(GaugeMessage::Error(err.to_string()));
    }

    /// Runs `op` on the amplifier unless a measurement owns it.
    fn with_amp<T>(
        &self,
        op: impl FnOnce(&mut ChannelAggregator<A>) -> Result<T, GaugeError>,
    ) -> Result<T, GaugeError> {
        if self.measurement.is_some() {
            return Err(GaugeError::AlreadyActive);
        }
        let mut amp = self.amp.lock().unwrap_or_else(PoisonError::into_inner);
        op(&mut amp)
    }

    fn handle(&mut self, cmd: GaugeCommand) {
        let result = match cmd {
            GaugeCommand::StartSession {
                material,
                thickness,
            } => self.start_session(&material, &thickness),
            GaugeCommand::Measure { repeat } => self.start_measurement(repeat),
            GaugeCommand::Calibrate { stack, reference } => self
                .with_amp(|amp| {
                    amp.poll()?;
                    amp.apply_zero_shift(stack, reference)
                })
                .map(|()| self.log(format!("🎯 Stack {stack} zero-shifted to {reference:.3}"))),
            GaugeCommand::Power(on) => self
                .with_amp(|amp| Ok(amp.amplifier_mut().power(on)?))
                .map(|()| self.log(if on { "🔦 Laser on" } else { "🌙 Laser off" })),
            GaugeCommand::Reset => self
                .with_amp(|amp| Ok(amp.amplifier_mut().reset_all()?))
                .map(|()| self.log("♻️ Amplifiers reset")),
            GaugeCommand::ReadSettings(command) => self
                .with_amp(|amp| Ok(amp.amplifier_mut().read_setting_all(command)?))
                .map(|values| {
                    self.send(GaugeMessage::Settings {
                        code: command.code(),
                        values,
                    })
                }),
            GaugeCommand::SetLiveView(on) => {
                self.live_view = on;
                Ok(())
            }
            GaugeCommand::EndSession => self.end_session(),
            GaugeCommand::Shutdown => Ok(()),
        };
        if let Err(err) = result {
            self.report_error(&err);
        }
    }

    fn start_session(&mut self, material: &str, thickness: &str) -> Result<(), GaugeError> {
        if self.measurement.is_some() {
            return Err(GaugeError::AlreadyActive);
        }
        let summary = self.sessions.start_session(material, thickness)?.to_string();
        self.send(GaugeMessage::SessionStatus(true));
        self.log(summary);
        if let Some(path) = self.sessions.log_path() {
            self.log(format!("💾 Logging to {}", path.display()));
        }
        Ok(())
    }

    fn end_session(&mut self) -> Result<(), GaugeError> {
        if self.measurement.is_some() {
            return Err(GaugeError::AlreadyActive);
        }
        let Some(session) = self.sessions.session() else {
            return Err(GaugeError::NoSession);
        };
        let summary = format!(
            "Session closed: {} panels of {} at {:.3} mm",
            session.panel_count(),
            session.material(),
            session.thickness()
        );
        self.sessions.end_session()?;
        self.send(GaugeMessage::SessionStatus(false));
        self.log(summary);
        Ok(())
    }

    fn start_measurement(&mut self, repeat: bool) -> Result<(), GaugeError> {
        let panel = if repeat {
            self.sessions.re_panel()?
        } else {
            self.sessions.new_panel()?
        };
        let id = panel.id();
        let handle = spawn_measurement(
            self.amp.clone(),
            panel,
            self.config.acquisition.clone(),
            self.config.judgment,
        )
        .map_err(|e| {
            self.sessions.recover_panel();
            e
        })?;
        self.measurement = Some(handle);
        self.send(GaugeMessage::MeasurementStarted(id));
        info!("📏 Waiting for panel {id}");
        Ok(())
    }

    fn poll_measurement(&mut self) {
        let Some(handle) = self.measurement.as_mut() else {
            return;
        };
        match handle.try_finish() {
            Ok(None) => {}
            Ok(Some(panel)) => {
                self.measurement = None;
                let report = PanelReport::from(&panel);
                if let Err(err) = self.sessions.complete(panel) {
                    self.report_error(&err);
                    if self.sessions.session().is_none() {
                        self.send(GaugeMessage::SessionStatus(false));
                    }
                }
                self.send(GaugeMessage::PanelFinished(report));
            }
            Err(err) => {
                self.measurement = None;
                self.sessions.recover_panel();
                self.report_error(&err);
            }
        }
    }

    fn refresh_live_values(&mut self) {
        if !self.live_view || self.measurement.is_some() {
            return;
        }
        if self.last_live.elapsed() < LIVE_VALUES_PERIOD {
            return;
        }
        self.last_live = Instant::now();
        match self.with_amp(|amp| {
            amp.poll()?;
            Ok(amp.live_values())
        }) {
            Ok(values) => self.send(GaugeMessage::Values(values)),
            Err(err) => warn!("Live values unavailable: {err}"),
        }
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.measurement.take() {
            // A panel still under the beam ends by itself within this bound.
            let acquisition = &self.config.acquisition;
            let limit = acquisition.panel_wait_timeout()
                + self.config.serial.response_timeout() * (acquisition.max_link_errors + 1);
            warn!("Shutting down, waiting up to {limit:?} for the panel in progress");
            match handle.wait(limit) {
                Ok(panel) => {
                    if let Err(err) = self.sessions.complete(panel) {
                        warn!("{err}");
                    }
                }
                Err(err) => {
                    warn!("{err}");
                    self.sessions.recover_panel();
                }
            }
        }
        if let Err(err) = self.with_amp(|amp| Ok(amp.amplifier_mut().power(false)?)) {
            warn!("Could not switch the laser off: {err}");
        }
        if self.sessions.session().is_some() {
            if let Err(err) = self.sessions.end_session() {
                warn!("{err}");
            }
        }
        self.send(GaugeMessage::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::error::PanelError;
    use crate::drivers::panel::Quality;
    use crate::drivers::{Command, ManualAmplifier, PanelOutcome, SimulatedAmplifier};
    use crate::recorder::BrokenSink;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    struct Harness {
        tx_cmd: Sender<GaugeCommand>,
        rx: Receiver<GaugeMessage>,
        worker: JoinHandle<()>,
    }

    impl Harness {
        fn start<A: Amplifier + 'static>(amp: A, config: GaugeConfig, dir: &std::path::Path) -> Self {
            let sessions = SessionManager::new(dir, config.acquisition.max_panel_data);
            Self::with_sessions(amp, config, sessions)
        }

        fn with_sessions<A: Amplifier + 'static>(
            amp: A,
            config: GaugeConfig,
            sessions: SessionManager,
        ) -> Self {
            let (tx, rx) = mpsc::channel();
            let (tx_cmd, rx_cmd) = mpsc::channel();
            let amp = Arc::new(Mutex::new(ChannelAggregator::new(amp)));
            let worker = spawn_thread(amp, config, sessions, tx, rx_cmd);
            Self { tx_cmd, rx, worker }
        }

        fn send(&self, cmd: GaugeCommand) {
            self.tx_cmd.send(cmd).unwrap();
        }

        fn next_matching(&self, pred: impl Fn(&GaugeMessage) -> bool) -> GaugeMessage {
            loop {
                let msg = self.rx.recv_timeout(Duration::from_secs(5)).unwrap();
                if pred(&msg) {
                    return msg;
                }
            }
        }

        fn finished(&self) -> PanelReport {
            match self.next_matching(|m| matches!(m, GaugeMessage::PanelFinished(_))) {
                GaugeMessage::PanelFinished(report) => report,
                _ => unreachable!(),
            }
        }

        fn stop(self) {
            self.send(GaugeCommand::Shutdown);
            self.next_matching(|m| matches!(m, GaugeMessage::Stopped));
            self.worker.join().unwrap();
        }
    }

    fn start_session() -> GaugeCommand {
        GaugeCommand::StartSession {
            material: "MDF".into(),
            thickness: "12.0".into(),
        }
    }

    #[test]
    fn measures_and_records_a_panel() {
        let dir = tempfile::tempdir().unwrap();
        let mut script = vec![(-99.0, -99.0)];
        script.extend(std::iter::repeat((12.0, 12.05)).take(60));
        script.push((-99.0, -99.0));
        let h = Harness::start(ManualAmplifier::from_stacks(script), GaugeConfig::default(), dir.path());

        h.send(start_session());
        h.next_matching(|m| matches!(m, GaugeMessage::SessionStatus(true)));
        h.send(GaugeCommand::Measure { repeat: false });
        let report = h.finished();
        assert_eq!(report.id, 1);
        assert_eq!(report.raw.len(), 60);
        assert_eq!(report.filtered.len(), 57);
        assert!(matches!(
            report.outcome,
            PanelOutcome::Judged {
                quality: Quality::Good,
                ..
            }
        ));
        h.stop();

        let logs: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn second_measurement_is_rejected_while_one_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GaugeConfig::default();
        config.acquisition.panel_wait_timeout_ms = 300;
        let amp = SimulatedAmplifier::new(12.0)
            .with_seed(1)
            .with_cycle(1_000_000, 10)
            .with_poll_delay(Duration::from_millis(1));
        let h = Harness::start(amp, config, dir.path());

        h.send(start_session());
        h.send(GaugeCommand::Measure { repeat: false });
        h.next_matching(|m| matches!(m, GaugeMessage::MeasurementStarted(1)));
        h.send(GaugeCommand::Measure { repeat: true });
        match h.next_matching(|m| matches!(m, GaugeMessage::Error(_))) {
            GaugeMessage::Error(text) => assert!(text.contains("already in progress")),
            _ => unreachable!(),
        }
        let report = h.finished();
        assert_eq!(report.id, 1);
        assert!(matches!(
            report.outcome,
            PanelOutcome::Failed {
                error: PanelError::Timeout { waited_ms: 300 }
            }
        ));
        h.stop();
    }

    #[test]
    fn measure_without_session_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::start(ManualAmplifier::default(), GaugeConfig::default(), dir.path());
        h.send(GaugeCommand::Measure { repeat: false });
        match h.next_matching(|m| matches!(m, GaugeMessage::Error(_))) {
            GaugeMessage::Error(text) => assert!(text.contains("no measurement session")),
            _ => unreachable!(),
        }
        h.stop();
    }

    #[test]
    fn calibrate_goes_through_the_link() {
        let dir = tempfile::tempdir().unwrap();
        let amp = SimulatedAmplifier::new(12.0)
            .with_noise(0.0)
            .with_poll_delay(Duration::ZERO)
            .with_cycle(1, 100);
        let h = Harness::start(amp, GaugeConfig::default(), dir.path());
        h.send(GaugeCommand::Calibrate {
            stack: 0,
            reference: 6.0,
        });
        h.next_matching(|m| matches!(m, GaugeMessage::Log(text) if text.contains("zero-shifted")));
        h.send(GaugeCommand::Calibrate {
            stack: 5,
            reference: 6.0,
        });
        match h.next_matching(|m| matches!(m, GaugeMessage::Error(_))) {
            GaugeMessage::Error(text) => assert!(text.contains("out of range")),
            _ => unreachable!(),
        }
        h.stop();
    }

    fn one_panel_script() -> ManualAmplifier {
        let mut script = vec![(-99.0, -99.0)];
        script.extend(std::iter::repeat((12.0, 12.05)).take(40));
        script.push((-99.0, -99.0));
        ManualAmplifier::from_stacks(script)
    }

    #[test]
    fn log_write_failure_ends_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut sessions = SessionManager::new(dir.path(), 600);
        sessions.start_session("MDF", "12.0").unwrap();
        sessions.replace_sink(Box::new(BrokenSink));
        let h = Harness::with_sessions(one_panel_script(), GaugeConfig::default(), sessions);

        h.send(GaugeCommand::Measure { repeat: false });
        match h.next_matching(|m| matches!(m, GaugeMessage::Error(_))) {
            GaugeMessage::Error(text) => assert!(text.contains("I/O")),
            _ => unreachable!(),
        }
        h.next_matching(|m| matches!(m, GaugeMessage::SessionStatus(false)));
        assert_eq!(h.finished().id, 1);

        h.send(GaugeCommand::Measure { repeat: false });
        match h.next_matching(|m| matches!(m, GaugeMessage::Error(_))) {
            GaugeMessage::Error(text) => assert!(text.contains("no measurement session")),
            _ => unreachable!(),
        }
        h.stop();
    }

    #[test]
    fn settings_are_read_from_every_channel() {
        let dir = tempfile::tempdir().unwrap();
        let amp = SimulatedAmplifier::new(12.0).with_poll_delay(Duration::ZERO);
        let h = Harness::start(amp, GaugeConfig::default(), dir.path());
        h.send(GaugeCommand::ReadSettings(Command::ShiftValue));
        match h.next_matching(|m| matches!(m, GaugeMessage::Settings { .. })) {
            GaugeMessage::Settings { code, values } => {
                assert_eq!(code, "067");
                assert_eq!(values.len(), 4);
                assert_eq!(values[3], "SR,03,067,+00.000");
            }
            _ => unreachable!(),
        }
        h.stop();
    }

    #[test]
    fn live_view_publishes_values_while_idle() {
        let dir = tempfile::tempdir().unwrap();
        let amp = SimulatedAmplifier::new(12.0)
            .with_noise(0.0)
            .with_poll_delay(Duration::ZERO)
            .with_cycle(1_000, 10);
        let h = Harness::start(amp, GaugeConfig::default(), dir.path());
        h.send(GaugeCommand::SetLiveView(true));
        match h.next_matching(|m| matches!(m, GaugeMessage::Values(_))) {
            GaugeMessage::Values(values) => assert_eq!(values.stacks, [-100.0, -100.0]),
            _ => unreachable!(),
        }
        h.stop();
    }

    #[test]
    fn shutdown_records_the_panel_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GaugeConfig::default();
        config.acquisition.panel_wait_timeout_ms = 200;
        let amp = SimulatedAmplifier::new(12.0)
            .with_poll_delay(Duration::from_millis(1))
            .with_cycle(1_000_000, 10);
        let h = Harness::start(amp, config, dir.path());
        h.send(start_session());
        h.send(GaugeCommand::Measure { repeat: false });
        h.next_matching(|m| matches!(m, GaugeMessage::MeasurementStarted(1)));
        h.stop();

        let log = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let records = crate::recorder::read_session_log(&log).unwrap();
        assert_eq!(records[0].panels.len(), 1);
        assert_eq!(
            records[0].panels[0].outcome,
            PanelOutcome::Failed {
                error: PanelError::Timeout { waited_ms: 200 }
            }
        );
    }
}
