use log::info;
use serde::Serialize;

use crate::config::{MAX_AMP_NUM, STACK_COUNT};
use crate::drivers::link::format_shift;
use crate::drivers::source::{Amplifier, AmplifierReading, Command};
use crate::drivers::error::{GaugeError, LinkError};

/// Summed reading of one stack. Negative means nothing is under the beam.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CalibratedValue(pub f32);

impl CalibratedValue {
    pub fn is_present(self) -> bool {
        self.0 >= 0.0
    }
}

/// Folds four heads into two stacks: stack `k` is `reading[2k] + reading[2k + 1]`.
pub fn aggregate(reading: &AmplifierReading) -> [CalibratedValue; STACK_COUNT] {
    std::array::from_fn(|k| CalibratedValue(reading.channel(2 * k) + reading.channel(2 * k + 1)))
}

/// Latest values for display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LiveValues {
    pub heads: [f32; MAX_AMP_NUM],
    pub stacks: [f32; STACK_COUNT],
}

impl std::fmt::Display for LiveValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for head in self.heads {
            write!(f, "{head:8.3} ")?;
        }
        writeln!(f)?;
        for stack in self.stacks {
            write!(f, "{stack:8.3} ")?;
        }
        Ok(())
    }
}

/// Owns the amplifier and turns raw readings into per-stack values.
pub struct ChannelAggregator<A> {
    amp: A,
    last: AmplifierReading,
}

impl<A: Amplifier> ChannelAggregator<A> {
    pub fn new(amp: A) -> Self {
        Self {
            amp,
            last: AmplifierReading::default(),
        }
    }

    #[cfg(test)]
    pub fn amplifier(&self) -> &A {
        &self.amp
    }

    pub fn amplifier_mut(&mut self) -> &mut A {
        &mut self.amp
    }

    pub fn live_values(&self) -> LiveValues {
        LiveValues {
            heads: self.last.0,
            stacks: aggregate(&self.last).map(|v| v.0),
        }
    }

    /// Polls every head once and returns both stack values.
    pub fn poll(&mut self) -> Result<[CalibratedValue; STACK_COUNT], LinkError> {
        self.last = self.amp.poll_all()?;
        Ok(aggregate(&self.last))
    }

    /// Zero-shifts one stack so its first head reads `reference`.
    ///
    /// Five blocking writes to the stack's second head. A failure stops the
    /// sequence where it is; nothing already written is undone.
    pub fn apply_zero_shift(&mut self, stack: usize, reference: f32) -> Result<(), GaugeError> {
        if stack >= STACK_COUNT {
            return Err(GaugeError::InvalidStack(stack));
        }
        let channel = stack * 2 + 1;
        let shift = reference - self.last.channel(stack * 2);
        info!("Zero-shift stack {stack}: reference {reference:.3}, shift {shift:+.3}");
        // Without the memory flag the shift is lost on power cycle.
        self.amp.write_channel(channel, Command::ZeroShiftMemory, "1")?;
        self.amp
            .write_channel(channel, Command::ShiftValue, &format_shift(shift))?;
        self.amp.write_channel(channel, Command::ZeroShift, "0")?;
        self.amp.write_channel(channel, Command::ZeroShift, "1")?;
        self.amp.write_channel(channel, Command::ZeroShiftMemory, "0")?;
        Ok(())
    }
}
