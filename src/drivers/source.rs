use std::collections::VecDeque;
use std::time::Duration;

use crate::config::MAX_AMP_NUM;
use crate::drivers::link::{encode_read_channel, encode_write_all, encode_write_channel};
use crate::drivers::error::LinkError;

/// One snapshot of every amplifier head, in channel order.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AmplifierReading(pub [f32; MAX_AMP_NUM]);

impl AmplifierReading {
    pub fn channel(&self, index: usize) -> f32 {
        self.0[index]
    }
}

/// Amplifier setting codes used by this controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    ZeroShift,
    Reset,
    InitialReset,
    HighValue,
    LowValue,
    ShiftValue,
    LaserStop,
    ZeroShiftMemory,
    PowerSave,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::ZeroShift,
        Command::Reset,
        Command::InitialReset,
        Command::HighValue,
        Command::LowValue,
        Command::ShiftValue,
        Command::LaserStop,
        Command::ZeroShiftMemory,
        Command::PowerSave,
    ];

    /// Looks a command up by its three-digit wire code.
    pub fn from_code(code: &str) -> Option<Command> {
        Self::ALL.into_iter().find(|c| c.code() == code.trim())
    }

    pub fn code(self) -> &'static str {
        match self {
            Command::ZeroShift => "001",
            Command::Reset => "003",
            Command::InitialReset => "005",
            Command::HighValue => "065",
            Command::LowValue => "066",
            Command::ShiftValue => "067",
            Command::LaserStop => "100",
            Command::ZeroShiftMemory => "152",
            Command::PowerSave => "155",
        }
    }
}

/// Anything that speaks the amplifier command set.
///
/// Only one operation is ever in flight: every method takes `&mut self` and
/// returns once the response has been consumed.
pub trait Amplifier: Send {
    fn poll_all(&mut self) -> Result<AmplifierReading, LinkError>;
    fn write_channel(&mut self, channel: usize, command: Command, value: &str)
        -> Result<(), LinkError>;
    fn write_all(&mut self, command: Command, value: &str) -> Result<(), LinkError>;
    fn read_channel(&mut self, channel: usize, command: Command) -> Result<String, LinkError>;

    /// Reads one setting back from every head.
    fn read_setting_all(&mut self, command: Command) -> Result<Vec<String>, LinkError> {
        (0..MAX_AMP_NUM)
            .map(|channel| self.read_channel(channel, command))
            .collect()
    }

    /// Laser emission and power-save toggled together.
    fn power(&mut self, on: bool) -> Result<(), LinkError> {
        if on {
            self.write_all(Command::LaserStop, "0")?;
            self.write_all(Command::PowerSave, "0")
        } else {
            self.write_all(Command::LaserStop, "1")?;
            self.write_all(Command::PowerSave, "2")
        }
    }

    /// Factory reset followed by the widest judgment limits.
    fn reset_all(&mut self) -> Result<(), LinkError> {
        self.write_all(Command::InitialReset, "0")?;
        self.write_all(Command::InitialReset, "1")?;
        self.write_all(Command::HighValue, "+99.999")?;
        self.write_all(Command::LowValue, "-99.999")
    }
}

impl<A: Amplifier + ?Sized> Amplifier for Box<A> {
    fn poll_all(&mut self) -> Result<AmplifierReading, LinkError> {
        (**self).poll_all()
    }
    fn write_channel(
        &mut self,
        channel: usize,
        command: Command,
        value: &str,
    ) -> Result<(), LinkError> {
        (**self).write_channel(channel, command, value)
    }
    fn write_all(&mut self, command: Command, value: &str) -> Result<(), LinkError> {
        (**self).write_all(command, value)
    }
    fn read_channel(&mut self, channel: usize, command: Command) -> Result<String, LinkError> {
        (**self).read_channel(channel, command)
    }
}

/// One scripted poll result.
#[derive(Clone, Debug)]
pub enum Scripted {
    Reading(AmplifierReading),
    #[cfg(test)]
    Malformed,
}

/// In-memory amplifier useful for tests and deterministic playback.
///
/// Polls pop the script front to back; an exhausted script behaves like a
/// silent line and times out. Writes are kept as their wire lines.
#[derive(Debug, Default)]
pub struct ManualAmplifier {
    script: VecDeque<Scripted>,
    written: Vec<String>,
    fail_write_at: Option<usize>,
}

impl ManualAmplifier {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: script.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Builds a script from per-stack values; each head reports half its stack.
    pub fn from_stacks(stacks: impl IntoIterator<Item = (f32, f32)>) -> Self {
        Self::new(stacks.into_iter().map(|(a, b)| {
            Scripted::Reading(AmplifierReading([a / 2.0, a / 2.0, b / 2.0, b / 2.0]))
        }))
    }

    #[cfg(test)]
    pub fn push(&mut self, entry: Scripted) {
        self.script.push_back(entry);
    }

    /// The write with this zero-based index (and every later one) fails.
    #[cfg(test)]
    pub fn fail_write_at(mut self, index: usize) -> Self {
        self.fail_write_at = Some(index);
        self
    }

    #[cfg(test)]
    pub fn written(&self) -> &[String] {
        &self.written
    }

    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    fn record(&mut self, line: String) -> Result<(), LinkError> {
        if self.fail_write_at.is_some_and(|at| self.written.len() >= at) {
            return Err(LinkError::Timeout(Duration::ZERO));
        }
        self.written.push(line.trim_end().to_owned());
        Ok(())
    }
}

impl Amplifier for ManualAmplifier {
    fn poll_all(&mut self) -> Result<AmplifierReading, LinkError> {
        match self.script.pop_front() {
            Some(Scripted::Reading(reading)) => Ok(reading),
            #[cfg(test)]
            Some(Scripted::Malformed) => Err(LinkError::Protocol {
                field: 0,
                response: "M0,+12.3?5".to_owned(),
            }),
            None => Err(LinkError::Timeout(Duration::ZERO)),
        }
    }

    fn write_channel(
        &mut self,
        channel: usize,
        command: Command,
        value: &str,
    ) -> Result<(), LinkError> {
        self.record(encode_write_channel(channel, command, value))
    }

    fn write_all(&mut self, command: Command, value: &str) -> Result<(), LinkError> {
        self.record(encode_write_all(command, value))
    }

    fn read_channel(&mut self, channel: usize, command: Command) -> Result<String, LinkError> {
        self.record(encode_read_channel(channel, command))?;
        Ok(format!("SR,{channel:02},{},0", command.code()))
    }
}
