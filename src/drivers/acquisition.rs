use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{AcquisitionConfig, JudgmentConfig};
use crate::drivers::aggregator::ChannelAggregator;
use crate::drivers::filter::process_panel;
use crate::drivers::panel::{Panel, RawSample};
use crate::drivers::source::Amplifier;
use crate::drivers::error::{GaugeError, LinkError, PanelError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Armed,
    Acquiring,
    Complete,
    Overflow,
    AlreadyActive,
    TimedOut,
    Aborted,
}

impl AcquisitionState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            AcquisitionState::Idle | AcquisitionState::Armed | AcquisitionState::Acquiring
        )
    }
}

/// Edge-triggered acquisition of one panel.
///
/// Every `step` is exactly one poll. The window opens when either stack turns
/// non-negative and closes when either turns negative again; the closing poll
/// is not buffered.
pub struct Acquisition<'a, A> {
    source: &'a mut ChannelAggregator<A>,
    panel: &'a mut Panel,
    state: AcquisitionState,
    wait_timeout: Duration,
    armed_at: Instant,
    first_sample: Instant,
}

impl<'a, A: Amplifier> Acquisition<'a, A> {
    pub fn new(
        source: &'a mut ChannelAggregator<A>,
        panel: &'a mut Panel,
        wait_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            source,
            panel,
            state: AcquisitionState::Idle,
            wait_timeout,
            armed_at: now,
            first_sample: now,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    fn fail(&mut self, state: AcquisitionState, error: PanelError) -> AcquisitionState {
        self.panel.fail(error);
        self.state = state;
        state
    }

    /// Runs one poll. A link error leaves the state untouched.
    pub fn step(&mut self) -> Result<AcquisitionState, LinkError> {
        match self.state {
            AcquisitionState::Idle => {
                let [a, b] = self.source.poll()?;
                if a.is_present() || b.is_present() {
                    return Ok(self.fail(AcquisitionState::AlreadyActive, PanelError::AlreadyActive));
                }
                self.armed_at = Instant::now();
                self.state = AcquisitionState::Armed;
            }
            AcquisitionState::Armed => {
                if self.armed_at.elapsed() >= self.wait_timeout {
                    let waited_ms = u64::try_from(self.wait_timeout.as_millis()).unwrap_or(u64::MAX);
                    return Ok(self.fail(AcquisitionState::TimedOut, PanelError::Timeout { waited_ms }));
                }
                let [a, b] = self.source.poll()?;
                if a.is_present() || b.is_present() {
                    self.first_sample = Instant::now();
                    let first = RawSample {
                        elapsed_us: 0,
                        value1: a.0,
                        value2: b.0,
                    };
                    if let Err(error) = self.panel.push_raw(first) {
                        return Ok(self.fail(AcquisitionState::Overflow, error));
                    }
                    debug!("Panel {} entered the beam", self.panel.id());
                    self.state = AcquisitionState::Acquiring;
                }
            }
            AcquisitionState::Acquiring => {
                let [a, b] = self.source.poll()?;
                if !a.is_present() || !b.is_present() {
                    self.state = AcquisitionState::Complete;
                    return Ok(self.state);
                }
                let sample = RawSample {
                    elapsed_us: u64::try_from(self.first_sample.elapsed().as_micros())
                        .unwrap_or(u64::MAX),
                    value1: a.0,
                    value2: b.0,
                };
                if let Err(error) = self.panel.push_raw(sample) {
                    return Ok(self.fail(AcquisitionState::Overflow, error));
                }
            }
            _ => {}
        }
        Ok(self.state)
    }

    /// Steps until a terminal state, giving up after `max_link_errors`
    /// consecutive failed polls.
    pub fn run(&mut self, max_link_errors: u32) -> AcquisitionState {
        let mut failures = 0;
        while !self.state.is_terminal() {
            match self.step() {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!("Poll failed in {:?} ({failures}/{max_link_errors}): {e}", self.state);
                    if failures >= max_link_errors {
                        return self.fail(AcquisitionState::Aborted, PanelError::Link(e.to_string()));
                    }
                }
            }
        }
        self.state
    }
}

pub type SharedAggregator<A> = Arc<Mutex<ChannelAggregator<A>>>;

/// Acquires and, if the panel passed cleanly, filters and judges it.
///
/// The amplifier stays locked for the whole acquisition.
pub fn measure<A: Amplifier>(
    amp: &Mutex<ChannelAggregator<A>>,
    panel: &mut Panel,
    acquisition: &AcquisitionConfig,
    judgment: &JudgmentConfig,
) -> AcquisitionState {
    let state = {
        let mut source = amp.lock().unwrap_or_else(PoisonError::into_inner);
        Acquisition::new(&mut source, panel, acquisition.panel_wait_timeout())
            .run(acquisition.max_link_errors)
    };
    if state == AcquisitionState::Complete {
        let result = process_panel(panel, judgment);
        info!(
            "Panel {}: {} samples, {:?} (spread {:.3} / {:.3})",
            panel.id(),
            panel.raw_samples().len(),
            result.quality,
            result.spread1,
            result.spread2
        );
    } else if let Some(error) = panel.error() {
        warn!("Panel {}: {error}", panel.id());
    }
    state
}

/// A panel being measured on its own worker thread.
///
/// The panel is handed back exactly once; receiving it is the completion
/// signal, after which every field the worker wrote is visible.
pub struct MeasurementHandle {
    rx: Receiver<Panel>,
    worker: Option<JoinHandle<()>>,
}

impl MeasurementHandle {
    /// Non-blocking check for completion.
    pub fn try_finish(&mut self) -> Result<Option<Panel>, GaugeError> {
        match self.rx.try_recv() {
            Ok(panel) => {
                self.join();
                Ok(Some(panel))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.join();
                Err(GaugeError::WorkerLost)
            }
        }
    }

    /// Waits at most `timeout` for the panel.
    pub fn wait(mut self, timeout: Duration) -> Result<Panel, GaugeError> {
        match self.rx.recv_timeout(timeout) {
            Ok(panel) => {
                self.join();
                Ok(panel)
            }
            Err(RecvTimeoutError::Timeout) => Err(GaugeError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                self.join();
                Err(GaugeError::WorkerLost)
            }
        }
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Measurement worker panicked");
            }
        }
    }
}

/// Moves `panel` onto a dedicated worker and starts measuring.
pub fn spawn_measurement<A: Amplifier + 'static>(
    amp: SharedAggregator<A>,
    mut panel: Panel,
    acquisition: AcquisitionConfig,
    judgment: JudgmentConfig,
) -> Result<MeasurementHandle, GaugeError> {
    let (tx, rx) = mpsc::sync_channel(1);
    let worker = thread::Builder::new()
        .name(format!("panel-{}", panel.id()))
        .spawn(move || {
            measure(&amp, &mut panel, &acquisition, &judgment);
            tx.send(panel).ok();
        })?;
    Ok(MeasurementHandle {
        rx,
        worker: Some(worker),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_PANEL_DATA;
    use crate::drivers::panel::{PanelOutcome, Quality};
    use crate::drivers::source::{AmplifierReading, ManualAmplifier, Scripted};

    const ABSENT: (f32, f32) = (-99.0, -99.0);
    const LONG: Duration = Duration::from_secs(30);

    fn fresh_panel(capacity: usize) -> Panel {
        let mut panel = Panel::with_capacity(capacity);
        panel.reset(1, 12.0);
        panel
    }

    fn run_script(
        script: Vec<(f32, f32)>,
        panel: &mut Panel,
    ) -> (AcquisitionState, ChannelAggregator<ManualAmplifier>) {
        let mut agg = ChannelAggregator::new(ManualAmplifier::from_stacks(script));
        let state = Acquisition::new(&mut agg, panel, LONG).run(3);
        (state, agg)
    }

    #[test]
    fn present_on_first_poll_is_already_active() {
        let mut panel = fresh_panel(16);
        let (state, agg) = run_script(vec![(-1.0, 0.0), (12.0, 12.0)], &mut panel);
        assert_eq!(state, AcquisitionState::AlreadyActive);
        assert_eq!(panel.error(), Some(&PanelError::AlreadyActive));
        assert!(panel.raw_samples().is_empty());
        assert_eq!(agg.amplifier().remaining(), 1);
    }

    #[test]
    fn buffers_only_while_present() {
        let mut panel = fresh_panel(16);
        let script = vec![
            ABSENT,
            ABSENT,
            (12.0, 12.1),
            (12.2, 12.3),
            (12.4, 12.5),
            (12.0, -1.0),
            (12.0, 12.0),
        ];
        let (state, agg) = run_script(script, &mut panel);
        assert_eq!(state, AcquisitionState::Complete);
        let values: Vec<(f32, f32)> = panel
            .raw_samples()
            .iter()
            .map(|s| (s.value1, s.value2))
            .collect();
        assert_eq!(values, vec![(12.0, 12.1), (12.2, 12.3), (12.4, 12.5)]);
        assert_eq!(panel.raw_samples()[0].elapsed_us, 0);
        assert!(panel
            .raw_samples()
            .windows(2)
            .all(|w| w[0].elapsed_us <= w[1].elapsed_us));
        // The poll after the falling edge is never consumed.
        assert_eq!(agg.amplifier().remaining(), 1);
        assert!(panel.error().is_none());
    }

    #[test]
    fn either_stack_opens_the_window() {
        let mut panel = fresh_panel(16);
        let (state, _) = run_script(vec![ABSENT, (-5.0, 12.0), ABSENT], &mut panel);
        assert_eq!(state, AcquisitionState::Complete);
        assert_eq!(panel.raw_samples().len(), 1);
    }

    #[test]
    fn capacity_plus_one_polls_overflow() {
        let capacity = 10;
        let mut panel = fresh_panel(capacity);
        let mut script = vec![ABSENT];
        script.extend(std::iter::repeat((12.0, 12.0)).take(capacity + 1));
        let (state, _) = run_script(script, &mut panel);
        assert_eq!(state, AcquisitionState::Overflow);
        assert_eq!(panel.error(), Some(&PanelError::Overflow { capacity }));
        assert_eq!(panel.raw_samples().len(), capacity);
    }

    #[test]
    fn full_size_panel_overflows_on_one_more_sample() {
        let mut panel = fresh_panel(MAX_PANEL_DATA);
        let mut script = vec![ABSENT];
        script.extend(std::iter::repeat((12.0, 12.0)).take(MAX_PANEL_DATA + 1));
        script.push(ABSENT);
        let (state, agg) = run_script(script, &mut panel);
        assert_eq!(state, AcquisitionState::Overflow);
        assert_eq!(
            panel.error(),
            Some(&PanelError::Overflow {
                capacity: MAX_PANEL_DATA
            })
        );
        assert_eq!(panel.raw_samples().len(), MAX_PANEL_DATA);
        // Acquisition stops at the overflowing poll.
        assert_eq!(agg.amplifier().remaining(), 1);
    }

    #[test]
    fn exactly_capacity_polls_complete() {
        let capacity = 10;
        let mut panel = fresh_panel(capacity);
        let mut script = vec![ABSENT];
        script.extend(std::iter::repeat((12.0, 12.0)).take(capacity));
        script.push(ABSENT);
        let (state, _) = run_script(script, &mut panel);
        assert_eq!(state, AcquisitionState::Complete);
        assert_eq!(panel.raw_samples().len(), capacity);
    }

    #[test]
    fn protocol_error_only_aborts_the_step() {
        let mut panel = fresh_panel(16);
        let mut agg = ChannelAggregator::new(ManualAmplifier::from_stacks([ABSENT]));
        agg.amplifier_mut().push(Scripted::Malformed);
        let mut acq = Acquisition::new(&mut agg, &mut panel, LONG);
        assert_eq!(acq.step().unwrap(), AcquisitionState::Armed);
        assert!(matches!(acq.step(), Err(LinkError::Protocol { .. })));
        assert_eq!(acq.state(), AcquisitionState::Armed);
    }

    #[test]
    fn repeated_link_errors_abort_the_panel() {
        let mut panel = fresh_panel(16);
        let mut agg = ChannelAggregator::new(ManualAmplifier::from_stacks([ABSENT]));
        for _ in 0..3 {
            agg.amplifier_mut().push(Scripted::Malformed);
        }
        let state = Acquisition::new(&mut agg, &mut panel, LONG).run(3);
        assert_eq!(state, AcquisitionState::Aborted);
        assert!(matches!(panel.error(), Some(PanelError::Link(_))));
    }

    #[test]
    fn isolated_link_error_is_retried() {
        let mut panel = fresh_panel(16);
        let mut amp = ManualAmplifier::from_stacks([ABSENT, (12.0, 12.0)]);
        amp.push(Scripted::Malformed);
        amp.push(Scripted::Reading(Default::default()));
        amp.push(Scripted::Reading(AmplifierReading([-1.0; 4])));
        let mut agg = ChannelAggregator::new(amp);
        let state = Acquisition::new(&mut agg, &mut panel, LONG).run(3);
        assert_eq!(state, AcquisitionState::Complete);
        assert_eq!(panel.raw_samples().len(), 2);
    }

    #[test]
    fn armed_wait_is_bounded() {
        let mut panel = fresh_panel(16);
        let mut agg = ChannelAggregator::new(ManualAmplifier::from_stacks([ABSENT, ABSENT]));
        let state = Acquisition::new(&mut agg, &mut panel, Duration::ZERO).run(3);
        assert_eq!(state, AcquisitionState::TimedOut);
        assert_eq!(panel.error(), Some(&PanelError::Timeout { waited_ms: 0 }));
    }

    #[test]
    fn worker_returns_judged_panel() {
        let mut script = vec![ABSENT];
        script.extend(std::iter::repeat((12.0, 12.0)).take(40));
        script.push(ABSENT);
        let amp = Arc::new(Mutex::new(ChannelAggregator::new(ManualAmplifier::from_stacks(script))));
        let handle = spawn_measurement(
            amp,
            fresh_panel(600),
            AcquisitionConfig::default(),
            JudgmentConfig::default(),
        )
        .unwrap();
        let panel = handle.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(panel.raw_samples().len(), 40);
        assert_eq!(panel.filtered_samples().len(), 38);
        assert_eq!(
            panel.outcome(),
            PanelOutcome::Judged {
                quality: Quality::Good,
                spread1: 0.0,
                spread2: 0.0
            }
        );
    }

    #[test]
    fn failed_panel_skips_filtering() {
        let amp = Arc::new(Mutex::new(ChannelAggregator::new(ManualAmplifier::from_stacks([
            (12.0, 12.0),
        ]))));
        let mut handle = spawn_measurement(
            amp,
            fresh_panel(600),
            AcquisitionConfig::default(),
            JudgmentConfig::default(),
        )
        .unwrap();
        let panel = loop {
            if let Some(panel) = handle.try_finish().unwrap() {
                break panel;
            }
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(panel.error(), Some(&PanelError::AlreadyActive));
        assert!(panel.filtered_samples().is_empty());
        assert_eq!(panel.quality(), Quality::Unknown);
    }
}
