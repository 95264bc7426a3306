// src/recorder.rs
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike};
use log::{error, info};
use serde::Serialize;

use crate::drivers::{GaugeError, Panel, PanelOutcome};

/// Wall-clock source for file names and headers.
pub trait WallClock: Send {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Operator feedback once a panel is finished (buzzer on the bench unit).
pub trait PanelNotifier: Send {
    fn panel_finished(&mut self, panel: &Panel);
}

pub struct LogNotifier;

impl PanelNotifier for LogNotifier {
    fn panel_finished(&mut self, panel: &Panel) {
        match panel.outcome() {
            PanelOutcome::Failed { error } => info!("🔔 panel {} failed: {error}", panel.id()),
            _ => info!("🔔 panel {} done: {:?}", panel.id(), panel.quality()),
        }
    }
}

/// One material/thickness run.
#[derive(Clone, Debug)]
pub struct MeasurementSession {
    material: String,
    thickness_text: String,
    thickness: f32,
    start_time: DateTime<Local>,
    panel_count: u32,
}

impl MeasurementSession {
    pub fn new(
        material: &str,
        thickness: &str,
        start_time: DateTime<Local>,
    ) -> Result<Self, GaugeError> {
        let value = thickness
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| GaugeError::InvalidThickness(thickness.to_owned()))?;
        Ok(Self {
            material: material.to_owned(),
            thickness_text: thickness.trim().to_owned(),
            thickness: value,
            start_time,
            panel_count: 0,
        })
    }

    pub fn material(&self) -> &str {
        &self.material
    }

    pub fn thickness(&self) -> f32 {
        self.thickness
    }

    pub fn panel_count(&self) -> u32 {
        self.panel_count
    }

    /// `Y-M-D-H-M_<material>_<thickness>.txt`, fields unpadded.
    pub fn file_name(&self) -> String {
        let t = self.start_time;
        format!(
            "{}-{}-{}-{}-{}_{}_{}.txt",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            sanitize(&self.material),
            sanitize(&self.thickness_text)
        )
    }
}

impl fmt::Display for MeasurementSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.start_time;
        write!(
            f,
            "Session started: {} {} {} {} {}\nPanel Count: {} Material: {} Thickness: {}mm",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            self.panel_count,
            self.material,
            self.thickness_text
        )
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '-' } else { c })
        .collect()
}

/// Destination of a session log.
pub trait SessionSink: Write + Send {
    /// Pushes everything written so far to stable storage.
    fn sync(&mut self) -> std::io::Result<()>;
}

impl SessionSink for BufWriter<File> {
    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.get_ref().sync_data()
    }
}

/// Sink whose every write fails, as a full or vanished disk would.
#[cfg(test)]
pub(crate) struct BrokenSink;

#[cfg(test)]
impl Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl SessionSink for BrokenSink {
    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct ActiveSession {
    session: MeasurementSession,
    writer: Box<dyn SessionSink>,
    path: PathBuf,
}

impl ActiveSession {
    fn write_header(&mut self) -> std::io::Result<()> {
        let w = &mut self.writer;
        writeln!(w, "Time: {}", self.session.start_time.to_rfc3339())?;
        writeln!(w, "Material: {}", self.session.material)?;
        writeln!(w, "Thickness: {}", self.session.thickness_text)?;
        writeln!(w)?;
        w.flush()
    }

    fn write_panel(&mut self, panel: &Panel) -> Result<(), GaugeError> {
        let raw = panel.raw_samples();
        let times: Vec<u64> = raw.iter().map(|s| s.elapsed_us).collect();
        let value1: Vec<f32> = raw.iter().map(|s| s.value1).collect();
        let value2: Vec<f32> = raw.iter().map(|s| s.value2).collect();
        let w = &mut self.writer;
        writeln!(w, "ID: {}", panel.id())?;
        writeln!(w, "Result: {}", serde_json::to_string(&panel.outcome())?)?;
        writeln!(w, "{}", serde_json::to_string(&times)?)?;
        writeln!(w, "{}", serde_json::to_string(&value1)?)?;
        writeln!(w, "{}", serde_json::to_string(&value2)?)?;
        w.sync()?;
        Ok(())
    }
}

/// Owns the session log and the one reusable `Panel`.
///
/// The panel is lent out for each measurement and must be handed back with
/// [`SessionManager::complete`]; while it is out, new measurements are
/// refused.
pub struct SessionManager {
    log_dir: PathBuf,
    capacity: usize,
    clock: Box<dyn WallClock>,
    notifier: Box<dyn PanelNotifier>,
    active: Option<ActiveSession>,
    panel: Option<Panel>,
}

impl SessionManager {
    pub fn new(log_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            log_dir: log_dir.into(),
            capacity,
            clock: Box::new(SystemClock),
            notifier: Box::new(LogNotifier),
            active: None,
            panel: Some(Panel::with_capacity(capacity)),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl WallClock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    #[cfg(test)]
    pub fn with_notifier(mut self, notifier: impl PanelNotifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn session(&self) -> Option<&MeasurementSession> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    /// The panel, when no measurement holds it.
    #[cfg(test)]
    pub fn panel(&self) -> Option<&Panel> {
        self.panel.as_ref()
    }

    /// Swaps the writer of the open session.
    #[cfg(test)]
    pub(crate) fn replace_sink(&mut self, sink: Box<dyn SessionSink>) {
        if let Some(active) = self.active.as_mut() {
            active.writer = sink;
        }
    }

    /// Opens (appending) the session log and writes its header.
    pub fn start_session(
        &mut self,
        material: &str,
        thickness: &str,
    ) -> Result<&MeasurementSession, GaugeError> {
        let session = MeasurementSession::new(material, thickness, self.clock.now())?;
        if self.active.is_some() {
            self.end_session()?;
        }
        fs::create_dir_all(&self.log_dir)?;
        let path = self.log_dir.join(session.file_name());
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut active = ActiveSession {
            session,
            writer: Box::new(BufWriter::new(file)),
            path,
        };
        active.write_header()?;
        info!("💾 Session started: {}", active.path.display());
        let active = self.active.insert(active);
        Ok(&active.session)
    }

    fn lend(
        &mut self,
        next_id: impl FnOnce(&mut MeasurementSession) -> u32,
    ) -> Result<Panel, GaugeError> {
        let active = self.active.as_mut().ok_or(GaugeError::NoSession)?;
        let mut panel = self.panel.take().ok_or(GaugeError::AlreadyActive)?;
        let id = next_id(&mut active.session);
        panel.reset(id, active.session.thickness);
        Ok(panel)
    }

    /// Lends the panel out for the next panel number.
    pub fn new_panel(&mut self) -> Result<Panel, GaugeError> {
        self.lend(|session| {
            session.panel_count += 1;
            session.panel_count
        })
    }

    /// Lends the panel out again under the current panel number.
    pub fn re_panel(&mut self) -> Result<Panel, GaugeError> {
        self.lend(|session| session.panel_count)
    }

    /// Appends one panel block and flushes it to disk.
    ///
    /// A write failure closes the session; nothing after it would be trusted.
    pub fn record(&mut self, panel: &Panel) -> Result<(), GaugeError> {
        let active = self.active.as_mut().ok_or(GaugeError::NoSession)?;
        if let Err(e) = active.write_panel(panel) {
            error!("Session log {} failed, closing session: {e}", active.path.display());
            self.active = None;
            return Err(e);
        }
        Ok(())
    }

    /// Takes the panel back from a finished measurement, records and announces it.
    pub fn complete(&mut self, panel: Panel) -> Result<(), GaugeError> {
        let result = self.record(&panel);
        self.notifier.panel_finished(&panel);
        self.panel = Some(panel);
        result
    }

    /// Replaces a panel lost with a crashed measurement worker.
    pub fn recover_panel(&mut self) {
        if self.panel.is_none() {
            self.panel = Some(Panel::with_capacity(self.capacity));
        }
    }

    pub fn end_session(&mut self) -> Result<(), GaugeError> {
        let mut active = self.active.take().ok_or(GaugeError::NoSession)?;
        active.writer.flush()?;
        info!(
            "💾 Session closed after {} panels: {}",
            active.session.panel_count,
            active.path.display()
        );
        Ok(())
    }
}

/// Header block of one session in a log file.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionHeader {
    pub time: String,
    pub material: String,
    pub thickness: String,
}

/// One panel block read back from a log file.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PanelRecord {
    pub id: u32,
    pub outcome: PanelOutcome,
    pub elapsed_us: Vec<u64>,
    pub value1: Vec<f32>,
    pub value2: Vec<f32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionRecord {
    pub header: SessionHeader,
    pub panels: Vec<PanelRecord>,
}

fn field<'a>(line: Option<&'a str>, key: &str) -> Result<&'a str, GaugeError> {
    line.and_then(|l| l.strip_prefix(key))
        .map(str::trim)
        .ok_or_else(|| GaugeError::Record(format!("expected {key:?} line")))
}

/// Parses a session log; an appended file may hold several sessions.
pub fn read_session_log(path: &Path) -> Result<Vec<SessionRecord>, GaugeError> {
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
    let mut lines = lines
        .iter()
        .map(String::as_str)
        .filter(|l| !l.trim().is_empty());
    let mut sessions: Vec<SessionRecord> = Vec::new();
    while let Some(line) = lines.next() {
        if line.starts_with("Time:") {
            let header = SessionHeader {
                time: field(Some(line), "Time:")?.to_owned(),
                material: field(lines.next(), "Material:")?.to_owned(),
                thickness: field(lines.next(), "Thickness:")?.to_owned(),
            };
            sessions.push(SessionRecord {
                header,
                panels: Vec::new(),
            });
            continue;
        }
        let id = field(Some(line), "ID:")?
            .parse::<u32>()
            .map_err(|e| GaugeError::Record(e.to_string()))?;
        let outcome = serde_json::from_str(field(lines.next(), "Result:")?)?;
        let mut series = || {
            lines
                .next()
                .ok_or_else(|| GaugeError::Record(format!("panel {id} is truncated")))
        };
        let elapsed_us = serde_json::from_str(series()?)?;
        let value1 = serde_json::from_str(series()?)?;
        let value2 = serde_json::from_str(series()?)?;
        let session = sessions
            .last_mut()
            .ok_or_else(|| GaugeError::Record("panel block before session header".to_owned()))?;
        session.panels.push(PanelRecord {
            id,
            outcome,
            elapsed_us,
            value1,
            value2,
        });
    }
    Ok(sessions)
}
