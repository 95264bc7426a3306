use crate::config::JudgmentConfig;
use crate::drivers::panel::{Panel, Quality, RawSample};

/// Result of the flatness test on a filtered run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Judgment {
    pub quality: Quality,
    pub spread1: f32,
    pub spread2: f32,
}

/// Window length of the moving average: 5% of the run.
pub fn filter_size(raw_count: usize) -> usize {
    raw_count / 20
}

/// Trimmed moving average over `raw`, written into `out`.
///
/// Output `i` averages the window `[i, i + filter_size)`, skipping every sample
/// whose value1 or value2 is further than `data_div` from `thickness`. A window
/// with nothing left yields `(0.0, 0.0)`, as does every window of a run shorter
/// than 20 samples.
pub fn moving_average(
    raw: &[RawSample],
    thickness: f32,
    data_div: f32,
    out: &mut Vec<(f32, f32)>,
) {
    let size = filter_size(raw.len());
    let count = raw.len() - size;
    let accepted = (thickness - data_div)..=(thickness + data_div);
    out.clear();
    for i in 0..count {
        let (mut sum1, mut sum2, mut n) = (0.0f32, 0.0f32, 0usize);
        for sample in &raw[i..i + size] {
            if !accepted.contains(&sample.value1) || !accepted.contains(&sample.value2) {
                continue;
            }
            sum1 += sample.value1;
            sum2 += sample.value2;
            n += 1;
        }
        if n > 0 {
            out.push((sum1 / n as f32, sum2 / n as f32));
        } else {
            out.push((0.0, 0.0));
        }
    }
}

fn spread(values: impl Iterator<Item = f32>) -> f32 {
    let (min, max) = values.fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if min > max {
        0.0
    } else {
        max - min
    }
}

/// Flatness test: both channels must spread less than `judgment_value`.
pub fn judge(filtered: &[(f32, f32)], judgment_value: f32) -> Judgment {
    let spread1 = spread(filtered.iter().map(|s| s.0));
    let spread2 = spread(filtered.iter().map(|s| s.1));
    let quality = if spread1 < judgment_value && spread2 < judgment_value {
        Quality::Good
    } else {
        Quality::Bad
    };
    Judgment {
        quality,
        spread1,
        spread2,
    }
}

/// Filters a completed panel in place and stores its judgment.
pub fn process_panel(panel: &mut Panel, settings: &JudgmentConfig) -> Judgment {
    let mut filtered = std::mem::take(panel.filtered_buffer());
    moving_average(
        panel.raw_samples(),
        panel.thickness(),
        settings.data_div,
        &mut filtered,
    );
    let judgment = judge(&filtered, settings.judgment_value);
    *panel.filtered_buffer() = filtered;
    panel.set_judgment(judgment);
    judgment
}
