//! Synthetic progress for stages whose backend reports nothing
//!
//! Each long-running stage gets a ticker that climbs by a random amount per
//! tick toward a ceiling. The display is cosmetic; only the stage sequencer
//! decides when a stage is really complete.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::{ProgressConfig, StageProgressConfig};

/// Stages that show synthesized progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStage {
    Acquisition,
    StorageUpload,
    PlatformUpload,
}

impl ProgressStage {
    pub const ALL: [ProgressStage; 3] = [
        ProgressStage::Acquisition,
        ProgressStage::StorageUpload,
        ProgressStage::PlatformUpload,
    ];

    /// Status text for a running ticker at `percent`
    pub fn status_text(self, percent: f64) -> &'static str {
        let band = match percent {
            p if p < 30.0 => 0,
            p if p < 60.0 => 1,
            p if p < 90.0 => 2,
            _ => 3,
        };
        match (self, band) {
            (ProgressStage::Acquisition, 0) => "Initializing download...",
            (ProgressStage::Acquisition, 1) => "Downloading video...",
            (ProgressStage::Acquisition, 2) => "Processing video...",
            (ProgressStage::Acquisition, _) => "Download complete!",
            (ProgressStage::StorageUpload, 0) => "Preparing for upload...",
            (ProgressStage::StorageUpload, 1) => "Uploading to storage...",
            (ProgressStage::StorageUpload, 2) => "Finalizing upload...",
            (ProgressStage::StorageUpload, _) => "Upload complete!",
            (ProgressStage::PlatformUpload, 0) => "Preparing video for the platform...",
            (ProgressStage::PlatformUpload, 1) => "Uploading to the platform...",
            // Ticking alone never claims the platform upload is done
            (ProgressStage::PlatformUpload, _) => "Processing on platform servers...",
        }
    }

    /// Status text once the stage really finished
    pub fn completed_text(self) -> &'static str {
        match self {
            ProgressStage::Acquisition => "Download complete!",
            ProgressStage::StorageUpload => "Upload complete!",
            ProgressStage::PlatformUpload => "Upload to the platform complete!",
        }
    }

    fn cadence(self, config: &ProgressConfig) -> StageProgressConfig {
        match self {
            ProgressStage::Acquisition => config.acquisition,
            ProgressStage::StorageUpload => config.storage,
            ProgressStage::PlatformUpload => config.platform,
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressStage::Acquisition => write!(f, "acquisition"),
            ProgressStage::StorageUpload => write!(f, "storage upload"),
            ProgressStage::PlatformUpload => write!(f, "platform upload"),
        }
    }
}

/// Ticker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running,
    /// Hit a ceiling below 100 and waits for the real result
    Capped,
    Completed,
}

/// What observers see for one stage
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub stage: ProgressStage,
    pub percent: f64,
    pub status: &'static str,
    pub state: TimerState,
    /// Incremented on every start; ticks from an older run are ignored
    pub generation: u64,
}

impl ProgressSnapshot {
    fn idle(stage: ProgressStage) -> Self {
        Self {
            stage,
            percent: 0.0,
            status: "",
            state: TimerState::Stopped,
            generation: 0,
        }
    }

    /// Percentage as shown in a progress bar
    pub fn rounded(&self) -> u8 {
        self.percent.round().clamp(0.0, 100.0) as u8
    }
}

/// Pure progress arithmetic, advanced one tick at a time
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    stage: ProgressStage,
    cadence: StageProgressConfig,
    percent: f64,
    state: TimerState,
}

impl ProgressMeter {
    /// A running meter at 0%
    pub fn start(stage: ProgressStage, cadence: StageProgressConfig) -> Self {
        Self {
            stage,
            cadence,
            percent: 0.0,
            state: TimerState::Running,
        }
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    /// Advance by a random step; returns whether the meter keeps running
    pub fn tick<R: Rng>(&mut self, rng: &mut R) -> bool {
        if self.state != TimerState::Running {
            return false;
        }

        let step = (rng.gen::<f64>() * self.cadence.max_step).max(0.0);
        self.percent = (self.percent + step).min(self.cadence.ceiling);

        if self.percent >= 100.0 {
            self.percent = 100.0;
            self.state = TimerState::Completed;
        } else if self.percent >= self.cadence.ceiling {
            self.state = TimerState::Capped;
        }

        self.state == TimerState::Running
    }

    pub fn snapshot(&self, generation: u64) -> ProgressSnapshot {
        let status = match self.state {
            TimerState::Completed => self.stage.completed_text(),
            _ => self.stage.status_text(self.percent),
        };
        ProgressSnapshot {
            stage: self.stage,
            percent: self.percent,
            status,
            state: self.state,
            generation,
        }
    }
}

struct TimerSlot {
    tx: watch::Sender<ProgressSnapshot>,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    fn halt(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Owns one ticker per progress stage
pub struct ProgressSynthesizer {
    config: ProgressConfig,
    slots: Mutex<HashMap<ProgressStage, TimerSlot>>,
}

impl ProgressSynthesizer {
    pub fn new(config: ProgressConfig) -> Self {
        let slots = ProgressStage::ALL
            .into_iter()
            .map(|stage| {
                let (tx, _) = watch::channel(ProgressSnapshot::idle(stage));
                (
                    stage,
                    TimerSlot {
                        tx,
                        task: None,
                        generation: 0,
                    },
                )
            })
            .collect();
        Self {
            config,
            slots: Mutex::new(slots),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ProgressStage, TimerSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `stage` from 0%, cancelling a ticker already running for it
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, stage: ProgressStage) {
        let cadence = stage.cadence(&self.config);
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&stage) else {
            return;
        };

        slot.halt();
        slot.generation += 1;
        let generation = slot.generation;

        let meter = ProgressMeter::start(stage, cadence);
        slot.tx.send_replace(meter.snapshot(generation));
        debug!("Progress for {} started (run {})", stage, generation);

        let tx = slot.tx.clone();
        slot.task = Some(tokio::spawn(run_ticker(meter, tx, generation)));
    }

    /// Snap `stage` to 100% because the real request succeeded
    pub fn complete(&self, stage: ProgressStage) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&stage) {
            slot.halt();
            slot.tx.send_modify(|s| {
                s.percent = 100.0;
                s.status = stage.completed_text();
                s.state = TimerState::Completed;
            });
            debug!("Progress for {} completed", stage);
        }
    }

    /// Stop `stage` where it is because the request failed
    pub fn cancel(&self, stage: ProgressStage) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&stage) {
            slot.halt();
            slot.tx.send_if_modified(|s| {
                if s.state == TimerState::Stopped {
                    return false;
                }
                s.state = TimerState::Stopped;
                true
            });
            debug!("Progress for {} cancelled", stage);
        }
    }

    /// Return every stage to an idle 0%
    pub fn reset_all(&self) {
        let mut slots = self.slots();
        for (stage, slot) in slots.iter_mut() {
            slot.halt();
            let generation = slot.generation;
            slot.tx.send_replace(ProgressSnapshot {
                generation,
                ..ProgressSnapshot::idle(*stage)
            });
        }
    }

    pub fn snapshot(&self, stage: ProgressStage) -> Option<ProgressSnapshot> {
        self.slots().get(&stage).map(|slot| slot.tx.borrow().clone())
    }

    /// Whether a ticker task is still alive for `stage`
    pub fn is_ticking(&self, stage: ProgressStage) -> bool {
        self.slots()
            .get(&stage)
            .and_then(|slot| slot.task.as_ref())
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Follow `stage` as it changes
    pub fn subscribe(&self, stage: ProgressStage) -> Option<watch::Receiver<ProgressSnapshot>> {
        self.slots().get(&stage).map(|slot| slot.tx.subscribe())
    }
}

impl Drop for ProgressSynthesizer {
    fn drop(&mut self) {
        for slot in self.slots().values_mut() {
            slot.halt();
        }
    }
}

async fn run_ticker(
    mut meter: ProgressMeter,
    tx: watch::Sender<ProgressSnapshot>,
    generation: u64,
) {
    let period = meter.cadence.tick;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rng = StdRng::from_entropy();

    loop {
        ticker.tick().await;
        let running = meter.tick(&mut rng);
        let next = meter.snapshot(generation);
        trace!("{} progress {:.1}%", next.stage, next.percent);

        // A completion or cancellation may have landed between ticks
        let applied = tx.send_if_modified(|current| {
            if current.generation != generation || current.state != TimerState::Running {
                return false;
            }
            *current = next;
            true
        });

        if !applied || !running {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cadence(max_step: f64, ceiling: f64) -> StageProgressConfig {
        StageProgressConfig {
            tick: Duration::from_secs(1),
            max_step,
            ceiling,
        }
    }

    #[test]
    fn test_status_bands() {
        let stage = ProgressStage::Acquisition;
        assert_eq!(stage.status_text(0.0), "Initializing download...");
        assert_eq!(stage.status_text(29.9), "Initializing download...");
        assert_eq!(stage.status_text(30.0), "Downloading video...");
        assert_eq!(stage.status_text(60.0), "Processing video...");
        assert_eq!(stage.status_text(90.0), "Download complete!");
        assert_eq!(
            ProgressStage::PlatformUpload.status_text(95.0),
            "Processing on platform servers..."
        );
    }

    #[test]
    fn test_meter_is_monotonic_and_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut meter = ProgressMeter::start(ProgressStage::Acquisition, cadence(10.0, 100.0));
        let mut last = 0.0;
        for _ in 0..500 {
            meter.tick(&mut rng);
            assert!(meter.percent() >= last);
            assert!(meter.percent() <= 100.0);
            last = meter.percent();
        }
        assert_eq!(meter.state(), TimerState::Completed);
        assert_eq!(meter.snapshot(1).status, "Download complete!");
    }

    #[test]
    fn test_meter_caps_below_hundred() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut meter = ProgressMeter::start(ProgressStage::PlatformUpload, cadence(5.0, 95.0));
        while meter.tick(&mut rng) {}
        assert_eq!(meter.state(), TimerState::Capped);
        assert_eq!(meter.percent(), 95.0);
        // Further ticks are ignored
        assert!(!meter.tick(&mut rng));
        assert_eq!(meter.percent(), 95.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_ticks_to_completion() {
        let synth = ProgressSynthesizer::new(ProgressConfig::default());
        let mut rx = synth.subscribe(ProgressStage::Acquisition).unwrap();

        synth.start(ProgressStage::Acquisition);
        let mut last = 0.0;
        loop {
            rx.changed().await.unwrap();
            let snap = rx.borrow_and_update().clone();
            assert!(snap.percent >= last);
            last = snap.percent;
            if snap.state != TimerState::Running {
                assert_eq!(snap.state, TimerState::Completed);
                assert_eq!(snap.percent, 100.0);
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_waits_for_real_completion() {
        let synth = ProgressSynthesizer::new(ProgressConfig::default());
        synth.start(ProgressStage::PlatformUpload);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let snap = synth.snapshot(ProgressStage::PlatformUpload).unwrap();
        assert_eq!(snap.state, TimerState::Capped);
        assert_eq!(snap.percent, 95.0);

        synth.complete(ProgressStage::PlatformUpload);
        let snap = synth.snapshot(ProgressStage::PlatformUpload).unwrap();
        assert_eq!(snap.state, TimerState::Completed);
        assert_eq!(snap.rounded(), 100);
        assert_eq!(snap.status, "Upload to the platform complete!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_freezes_progress() {
        let synth = ProgressSynthesizer::new(ProgressConfig::default());
        synth.start(ProgressStage::StorageUpload);
        tokio::time::sleep(Duration::from_secs(5)).await;

        synth.cancel(ProgressStage::StorageUpload);
        let frozen = synth.snapshot(ProgressStage::StorageUpload).unwrap();
        assert_eq!(frozen.state, TimerState::Stopped);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let later = synth.snapshot(ProgressStage::StorageUpload).unwrap();
        assert_eq!(later.percent, frozen.percent);
        assert!(!synth.is_ticking(ProgressStage::StorageUpload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_running_ticker() {
        let synth = ProgressSynthesizer::new(ProgressConfig::default());
        synth.start(ProgressStage::Acquisition);
        tokio::time::sleep(Duration::from_secs(4)).await;

        synth.start(ProgressStage::Acquisition);
        let snap = synth.snapshot(ProgressStage::Acquisition).unwrap();
        assert_eq!(snap.percent, 0.0);
        assert_eq!(snap.generation, 2);
        assert_eq!(snap.state, TimerState::Running);
    }
}
