use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of timestamps for the broker.
///
/// Message timestamps and connection activity tracking both read from a
/// `Clock`, which lets tests drive heartbeat eviction without sleeping.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current timestamp in nanoseconds since the UNIX epoch.
    fn now(&self) -> u64;
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A clock that uses `std::time::SystemTime`.
///
/// Susceptible to NTP adjustments, so idle tracking on a host with a jumpy
/// wall clock should prefer `QuantaClock`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        wall_clock_ns()
    }
}

/// The broker's default clock. Connection idle times are measured against
/// it, so a wall-clock step (NTP, manual change) can neither evict a live
/// connection nor keep a dead one around. Readings stay comparable with
/// message timestamps because they start from the wall time at open.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    ticks: quanta::Clock,
    opened_at: quanta::Instant,
    opened_at_wall_ns: u64,
}

impl QuantaClock {
    pub fn new() -> Self {
        let ticks = quanta::Clock::new();
        Self {
            opened_at: ticks.now(),
            opened_at_wall_ns: wall_clock_ns(),
            ticks,
        }
    }

    /// Time since the clock was created.
    pub fn uptime(&self) -> Duration {
        self.ticks.now().duration_since(self.opened_at)
    }
}

impl Default for QuantaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        self.opened_at_wall_ns
            .saturating_add(self.uptime().as_nanos() as u64)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.now_ns
            .fetch_add(delta.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}
