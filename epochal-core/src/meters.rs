//! Meters: stateful accumulators read by the epoch summary.
//!
//! Every meter supports `reset` and `value`. Meters are shared between the
//! experiment and the hooks that mutate them, so they live behind
//! `Rc<RefCell<_>>` and are only ever mutated in place.

use crate::error::{ExperimentError, Result};
use crate::format::Reading;
use crate::state::{StateDict, Stateful};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A resettable accumulator with a current reading.
pub trait Meter {
    /// Clear accumulated state.
    fn reset(&mut self);

    /// Current reading. Shape depends on the meter kind.
    fn value(&self) -> Reading;
}

/// A meter shared between the experiment, its hooks and the summary.
pub type SharedMeter = Rc<RefCell<dyn Meter>>;

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Monotonic time source for [`TimeMeter`].
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// Clock shared by every timer of an experiment.
pub type SharedClock = Rc<dyn Clock>;

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to. Used for deterministic timing.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

// ---------------------------------------------------------------------------
// Running average
// ---------------------------------------------------------------------------

/// Running mean and standard deviation of the values added since the last reset.
///
/// `value()` is a [`Reading::Pair`] of (mean, population std). Both are NaN
/// while the meter is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningAverageMeter {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

impl RunningAverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.sum / self.count as f64
    }

    pub fn std(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        let mean = self.mean();
        (self.sum_sq / self.count as f64 - mean * mean).max(0.0).sqrt()
    }
}

impl Meter for RunningAverageMeter {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn value(&self) -> Reading {
        Reading::Pair(self.mean(), self.std())
    }
}

impl Stateful for RunningAverageMeter {
    fn state_dict(&self) -> Result<StateDict> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        *self = serde_json::from_value(state.clone())
            .map_err(|e| ExperimentError::state("running_average", e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Elapsed time
// ---------------------------------------------------------------------------

/// Seconds elapsed since the last reset.
pub struct TimeMeter {
    clock: SharedClock,
    start: Duration,
}

impl TimeMeter {
    pub fn new(clock: SharedClock) -> Self {
        let start = clock.now();
        Self { clock, start }
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.start)
    }
}

impl Default for TimeMeter {
    fn default() -> Self {
        Self::new(Rc::new(SystemClock::new()))
    }
}

impl std::fmt::Debug for TimeMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeMeter")
            .field("start", &self.start)
            .finish()
    }
}

impl Meter for TimeMeter {
    fn reset(&mut self) {
        self.start = self.clock.now();
    }

    fn value(&self) -> Reading {
        Reading::Scalar(self.elapsed().as_secs_f64())
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Point-in-time resident memory of the current process, sampled on every read.
pub struct MemoryMeter {
    sampler: fn() -> Option<u64>,
}

impl MemoryMeter {
    pub fn new() -> Self {
        Self {
            sampler: resident_bytes,
        }
    }

    /// Use a custom byte-count sampler.
    pub fn with_sampler(sampler: fn() -> Option<u64>) -> Self {
        Self { sampler }
    }
}

impl Default for MemoryMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl Meter for MemoryMeter {
    fn reset(&mut self) {}

    fn value(&self) -> Reading {
        match (self.sampler)() {
            Some(bytes) => Reading::Text(format!("{}MB", bytes / (1024 * 1024))),
            None => Reading::Text("n/a".into()),
        }
    }
}

/// Resident set size of this process in bytes.
#[cfg(target_os = "linux")]
pub fn resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(pages * page_size as u64)
}

/// Peak resident set size of this process in bytes.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn resident_bytes() -> Option<u64> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::uninit();
    // SAFETY: getrusage fully initialises `usage` when it returns 0.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let usage = unsafe { usage.assume_init() };
    // ru_maxrss is reported in bytes on macOS.
    u64::try_from(usage.ru_maxrss).ok()
}

#[cfg(not(unix))]
pub fn resident_bytes() -> Option<u64> {
    None
}
