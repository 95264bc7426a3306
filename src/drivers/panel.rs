use serde::{Deserialize, Serialize};

use crate::drivers::filter::Judgment;
use crate::drivers::error::PanelError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    #[default]
    Unknown,
    Good,
    Bad,
}

/// One buffered poll: microseconds since the first sample, then both stacks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RawSample {
    pub elapsed_us: u64,
    pub value1: f32,
    pub value2: f32,
}

/// What a finished measurement amounted to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PanelOutcome {
    Pending,
    Judged {
        quality: Quality,
        spread1: f32,
        spread2: f32,
    },
    Failed {
        error: PanelError,
    },
}

/// One physical sheet under the beam.
///
/// A session keeps a single `Panel` and resets it for every measurement, so
/// the sample buffers are allocated once at their full capacity.
#[derive(Clone, Debug)]
pub struct Panel {
    id: u32,
    thickness: f32,
    capacity: usize,
    raw: Vec<RawSample>,
    filtered: Vec<(f32, f32)>,
    quality: Quality,
    spread1: f32,
    spread2: f32,
    error: Option<PanelError>,
}

impl Panel {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: 0,
            thickness: 0.0,
            capacity,
            raw: Vec::with_capacity(capacity),
            filtered: Vec::with_capacity(capacity),
            quality: Quality::Unknown,
            spread1: 0.0,
            spread2: 0.0,
            error: None,
        }
    }

    /// Prepares the panel for a fresh acquisition without reallocating.
    pub fn reset(&mut self, id: u32, thickness: f32) {
        self.id = id;
        self.thickness = thickness;
        self.raw.clear();
        self.filtered.clear();
        self.quality = Quality::Unknown;
        self.spread1 = 0.0;
        self.spread2 = 0.0;
        self.error = None;
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn thickness(&self) -> f32 {
        self.thickness
    }

    pub fn raw_samples(&self) -> &[RawSample] {
        &self.raw
    }

    pub fn filtered_samples(&self) -> &[(f32, f32)] {
        &self.filtered
    }

    /// Appends one sample; a full buffer is an overflow, never a wrap.
    pub fn push_raw(&mut self, sample: RawSample) -> Result<(), PanelError> {
        if self.raw.len() >= self.capacity {
            return Err(PanelError::Overflow {
                capacity: self.capacity,
            });
        }
        self.raw.push(sample);
        Ok(())
    }

    pub(crate) fn filtered_buffer(&mut self) -> &mut Vec<(f32, f32)> {
        &mut self.filtered
    }

    pub fn set_judgment(&mut self, judgment: Judgment) {
        self.quality = judgment.quality;
        self.spread1 = judgment.spread1;
        self.spread2 = judgment.spread2;
    }

    /// Marks the acquisition as failed. Any quality is discarded.
    pub fn fail(&mut self, error: PanelError) {
        self.quality = Quality::Unknown;
        self.error = Some(error);
    }

    pub fn error(&self) -> Option<&PanelError> {
        self.error.as_ref()
    }

    /// Quality is only meaningful when there is no error.
    pub fn quality(&self) -> Quality {
        if self.error.is_some() {
            Quality::Unknown
        } else {
            self.quality
        }
    }

    pub fn outcome(&self) -> PanelOutcome {
        if let Some(error) = &self.error {
            return PanelOutcome::Failed {
                error: error.clone(),
            };
        }
        match self.quality {
            Quality::Unknown => PanelOutcome::Pending,
            quality => PanelOutcome::Judged {
                quality,
                spread1: self.spread1,
                spread2: self.spread2,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(v: f32) -> RawSample {
        RawSample {
            elapsed_us: 0,
            value1: v,
            value2: v,
        }
    }

    #[test]
    fn push_stops_at_capacity() {
        let mut panel = Panel::with_capacity(2);
        panel.push_raw(sample(1.0)).unwrap();
        panel.push_raw(sample(2.0)).unwrap();
        assert_eq!(
            panel.push_raw(sample(3.0)),
            Err(PanelError::Overflow { capacity: 2 })
        );
        assert_eq!(panel.raw_samples().len(), 2);
        assert_eq!(panel.raw_samples()[1].value1, 2.0);
    }

    #[test]
    fn reset_keeps_allocation_and_clears_state() {
        let mut panel = Panel::with_capacity(8);
        panel.push_raw(sample(1.0)).unwrap();
        panel.fail(PanelError::AlreadyActive);
        let ptr = panel.raw_samples().as_ptr();
        panel.reset(4, 12.0);
        assert_eq!(panel.id(), 4);
        assert!(panel.raw_samples().is_empty());
        assert!(panel.error().is_none());
        assert_eq!(panel.outcome(), PanelOutcome::Pending);
        panel.push_raw(sample(1.0)).unwrap();
        assert_eq!(panel.raw_samples().as_ptr(), ptr);
    }

    #[test]
    fn error_masks_quality() {
        let mut panel = Panel::with_capacity(1);
        panel.set_judgment(Judgment {
            quality: Quality::Good,
            spread1: 0.0,
            spread2: 0.0,
        });
        panel.fail(PanelError::Overflow { capacity: 1 });
        assert_eq!(panel.quality(), Quality::Unknown);
        assert!(matches!(panel.outcome(), PanelOutcome::Failed { .. }));
    }
}
