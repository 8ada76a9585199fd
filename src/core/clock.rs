use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// A source of nanosecond timestamps for the driver duty cycle.
///
/// All timeouts in the crate are measured against this clock, so it must be
/// monotonic non-decreasing for the life of a publication.
pub trait Clock: Send + Sync + 'static {
    /// Returns nanoseconds elapsed on a monotonic timeline.
    fn nano_time(&self) -> i64;
}

/// A clock backed by `std::time::Instant`.
///
/// This is the default implementation. Monotonic, no calibration required,
/// latency in the tens of nanoseconds.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn nano_time(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }
}

/// A clock that uses the CPU's Time-Stamp Counter via the `quanta` crate.
///
/// Significantly faster than `SystemClock` (~6-10ns per read) and monotonic.
/// Anchors at construction and progresses by TSC ticks.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start = clock.now();
        Self { clock, start }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn nano_time(&self) -> i64 {
        self.clock.now().duration_since(self.start).as_nanos() as i64
    }
}

/// A manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ns: i64) -> Self {
        Self {
            now_ns: AtomicI64::new(now_ns),
        }
    }

    pub fn set(&self, now_ns: i64) {
        self.now_ns.store(now_ns, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ns: i64) {
        self.now_ns.fetch_add(delta_ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn nano_time(&self) -> i64 {
        self.now_ns.load(Ordering::Relaxed)
    }
}
