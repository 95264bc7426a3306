use std::thread;
use std::time::Duration;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{SimulationConfig, MAX_AMP_NUM};
use crate::drivers::source::{Amplifier, AmplifierReading, Command};
use crate::drivers::error::LinkError;

const NO_TARGET: f32 = -50.0;
const LASER_OFF: f32 = -99.999;

/// Synthetic amplifier stack: panels pass under the beam on a fixed cycle.
pub struct SimulatedAmplifier {
    rng: StdRng,
    thickness: f32,
    idle_polls: u64,
    panel_polls: u64,
    noise: f32,
    poll_delay: Duration,
    tick: u64,
    emitting: bool,
    pending_shift: [f32; MAX_AMP_NUM],
    shift: [f32; MAX_AMP_NUM],
}

impl SimulatedAmplifier {
    pub fn new(thickness: f32) -> Self {
        let defaults = SimulationConfig::default();
        Self {
            rng: StdRng::from_entropy(),
            thickness,
            idle_polls: defaults.idle_polls,
            panel_polls: defaults.panel_polls,
            noise: defaults.noise_mm,
            poll_delay: defaults.poll_delay(),
            tick: 0,
            emitting: true,
            pending_shift: [0.0; MAX_AMP_NUM],
            shift: [0.0; MAX_AMP_NUM],
        }
    }

    pub fn from_config(thickness: f32, config: &SimulationConfig) -> Self {
        let amp = Self::new(thickness)
            .with_cycle(config.idle_polls, config.panel_polls)
            .with_noise(config.noise_mm)
            .with_poll_delay(config.poll_delay());
        match config.seed {
            Some(seed) => amp.with_seed(seed),
            None => amp,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_cycle(mut self, idle_polls: u64, panel_polls: u64) -> Self {
        self.idle_polls = idle_polls.max(1);
        self.panel_polls = panel_polls;
        self
    }

    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise = noise.abs();
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    fn head_value(&mut self, head: usize, under_beam: bool) -> f32 {
        if !under_beam {
            return NO_TARGET;
        }
        let jitter = if self.noise > 0.0 {
            self.rng.gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        self.thickness / 2.0 + jitter + self.shift[head]
    }
}

impl Amplifier for SimulatedAmplifier {
    fn poll_all(&mut self) -> Result<AmplifierReading, LinkError> {
        if !self.poll_delay.is_zero() {
            thread::sleep(self.poll_delay);
        }
        if !self.emitting {
            return Ok(AmplifierReading([LASER_OFF; MAX_AMP_NUM]));
        }
        let position = self.tick % (self.idle_polls + self.panel_polls);
        self.tick += 1;
        let under_beam = position >= self.idle_polls;
        let mut values = [0.0; MAX_AMP_NUM];
        for (head, value) in values.iter_mut().enumerate() {
            *value = self.head_value(head, under_beam);
        }
        Ok(AmplifierReading(values))
    }

    fn write_channel(
        &mut self,
        channel: usize,
        command: Command,
        value: &str,
    ) -> Result<(), LinkError> {
        debug!("sim SW {channel:02} {} {value}", command.code());
        if channel >= MAX_AMP_NUM {
            return Ok(());
        }
        match command {
            Command::ShiftValue => {
                if let Ok(shift) = value.trim().parse::<f32>() {
                    self.pending_shift[channel] = shift;
                }
            }
            // The shift lands on the stack's first head.
            Command::ZeroShift if value == "1" => {
                let first = channel - channel % 2;
                self.shift[first] += self.pending_shift[channel];
                self.pending_shift[channel] = 0.0;
            }
            _ => {}
        }
        Ok(())
    }

    fn write_all(&mut self, command: Command, value: &str) -> Result<(), LinkError> {
        debug!("sim AW {} {value}", command.code());
        match command {
            Command::LaserStop => self.emitting = value != "1",
            Command::InitialReset => self.shift = [0.0; MAX_AMP_NUM],
            _ => {}
        }
        Ok(())
    }

    fn read_channel(&mut self, channel: usize, command: Command) -> Result<String, LinkError> {
        let value = match command {
            Command::ShiftValue => self.shift.get(channel).copied().unwrap_or_default(),
            _ => 0.0,
        };
        Ok(format!("SR,{channel:02},{},{value:+07.3}", command.code()))
    }
}
