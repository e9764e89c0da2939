use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Emission floor: samples closer together than this are dropped, except for
/// step transitions and terminal samples.
const MIN_EMIT_INTERVAL: Duration = Duration::from_millis(34);

/// ETA smoothing parameters: moving window over the last samples, blended
/// with the previous estimate, estimates past the clamp are omitted.
const ETA_WINDOW: usize = 10;
const ETA_MIN_SPAN: Duration = Duration::from_secs(5);
const ETA_ALPHA: f64 = 0.3;
const ETA_CLAMP_SECONDS: f64 = 30.0 * 60.0;

/// The band in which mod-download re-weighting may push the aggregate
/// percentage backwards a little; everywhere else emission is monotone.
const REGRESSION_BAND: (f64, f64) = (75.0, 95.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Preparing,
    FetchingMetadata,
    InstallingRuntime,
    InstallingLoader,
    ResolvingMods,
    DownloadingMods,
    Staging,
    Committing,
    Verifying,
    Launching,
    Complete,
}

/// One progress emission. `counter` is (current, total) within the step,
/// `file` the item being worked on, rates and ETA best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    pub percentage: f64,
    pub step: Step,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<(u64, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

struct EtaSmoother {
    history: VecDeque<(Instant, f64)>,
    previous: Option<f64>,
}

impl EtaSmoother {
    fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(ETA_WINDOW + 1),
            previous: None,
        }
    }

    fn observe(&mut self, now: Instant, percentage: f64) -> Option<u64> {
        self.history.push_back((now, percentage));
        while self.history.len() > ETA_WINDOW {
            self.history.pop_front();
        }

        let (oldest_t, oldest_pct) = *self.history.front()?;
        let span = now.duration_since(oldest_t);
        if span < ETA_MIN_SPAN {
            return self.previous.map(|e| e.round() as u64);
        }

        let progressed = percentage - oldest_pct;
        if progressed <= f64::EPSILON {
            return None;
        }
        let rate = progressed / span.as_secs_f64();
        let raw = (100.0 - percentage) / rate;
        let smoothed = match self.previous {
            Some(prev) => ETA_ALPHA * raw + (1.0 - ETA_ALPHA) * prev,
            None => raw,
        };
        self.previous = Some(smoothed);
        if smoothed >= ETA_CLAMP_SECONDS {
            None
        } else {
            Some(smoothed.round().max(0.0) as u64)
        }
    }
}

struct BusState {
    last_pct: f64,
    last_emit: Option<Instant>,
    last_step: Option<Step>,
    eta: EtaSmoother,
}

/// Aggregates per-phase progress into one operation-wide percentage stream.
/// Phases carry fixed weights; emission is throttled and monotone outside
/// the mod-download regression band.
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressSample>,
    state: Mutex<BusState>,
}

impl ProgressBus {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self {
            tx,
            state: Mutex::new(BusState {
                last_pct: 0.0,
                last_emit: None,
                last_step: None,
                eta: EtaSmoother::new(),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSample> {
        self.tx.subscribe()
    }

    /// Open a weighted phase starting at `start` percent and spanning
    /// `weight` percent of the whole operation.
    pub fn phase(self: &Arc<Self>, step: Step, start: f64, weight: f64) -> PhaseHandle {
        PhaseHandle {
            bus: Arc::clone(self),
            step,
            start,
            weight,
        }
    }

    /// Emit the terminal 100% sample.
    pub fn complete(&self) {
        self.emit(100.0, Step::Complete, None, None, None, true);
    }

    /// Emit rate/file detail at the current percentage, without advancing it.
    fn emit_sticky(
        &self,
        step: Step,
        file: Option<String>,
        bytes_per_sec: Option<u64>,
    ) {
        let pct = self.state.lock().unwrap().last_pct;
        self.emit(pct, step, None, file, bytes_per_sec, false);
    }

    fn emit(
        &self,
        percentage: f64,
        step: Step,
        counter: Option<(u64, u64)>,
        file: Option<String>,
        bytes_per_sec: Option<u64>,
        force: bool,
    ) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        let mut pct = percentage.clamp(0.0, 100.0);
        if pct < state.last_pct {
            let in_band = step == Step::DownloadingMods
                && state.last_pct >= REGRESSION_BAND.0
                && state.last_pct <= REGRESSION_BAND.1;
            if !in_band {
                pct = state.last_pct;
            }
        }

        let step_changed = state.last_step != Some(step);
        if !force && !step_changed {
            if let Some(last) = state.last_emit {
                if now.duration_since(last) < MIN_EMIT_INTERVAL {
                    state.last_pct = state.last_pct.max(pct);
                    return;
                }
            }
        }

        let eta = state.eta.observe(now, pct);
        state.last_pct = pct;
        state.last_emit = Some(now);
        state.last_step = Some(step);
        drop(state);

        let _ = self.tx.send(ProgressSample {
            percentage: pct,
            step,
            counter,
            file,
            bytes_per_sec,
            eta_seconds: eta,
        });
    }
}

/// Handle for one weighted phase; cheap to clone into worker tasks.
#[derive(Clone)]
pub struct PhaseHandle {
    bus: Arc<ProgressBus>,
    step: Step,
    start: f64,
    weight: f64,
}

impl PhaseHandle {
    /// Report phase-relative progress (0.0..=1.0).
    pub fn tick(&self, fraction: f64) {
        self.tick_detail(fraction, None, None, None);
    }

    pub fn tick_counter(&self, current: u64, total: u64) {
        let fraction = if total == 0 {
            1.0
        } else {
            current as f64 / total as f64
        };
        self.tick_detail(fraction, Some((current, total)), None, None);
    }

    pub fn tick_detail(
        &self,
        fraction: f64,
        counter: Option<(u64, u64)>,
        file: Option<String>,
        bytes_per_sec: Option<u64>,
    ) {
        let pct = self.start + fraction.clamp(0.0, 1.0) * self.weight;
        self.bus.emit(pct, self.step, counter, file, bytes_per_sec, false);
    }

    /// Byte-rate detail for the file currently in flight; the aggregate
    /// percentage is left where it is.
    pub fn note_file(&self, file: impl Into<String>, bytes_per_sec: u64) {
        self.bus
            .emit_sticky(self.step, Some(file.into()), Some(bytes_per_sec));
    }

    /// Force-emit the phase end so step boundaries are never throttled away.
    pub fn finish(&self) {
        self.bus
            .emit(self.start + self.weight, self.step, None, None, None, true);
    }

    pub fn step(&self) -> Step {
        self.step
    }
}

/// Canonical phase weights for a full install/update operation.
pub mod weights {
    /// Minecraft runtime + loader libraries
    pub const RUNTIME: f64 = 35.0;
    /// Mod downloads
    pub const MODS: f64 = 50.0;
    /// Staging + commit
    pub const COMMIT: f64 = 15.0;
}
