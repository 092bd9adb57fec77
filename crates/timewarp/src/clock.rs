use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use warpconfig::SleepMode;

/// Portion of a hybrid sleep spent spinning before the wake point.
const HYBRID_SPIN_NANOS: f64 = 1_000_000.0;

/// Monotonic time base shared by the display callback, the producer and the
/// warp thread. Times are nanoseconds since an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> f64;

    /// Returns once `now_nanos() >= target_nanos`. Yields the seconds slept.
    fn sleep_until(&self, target_nanos: f64) -> f64;

    fn now_seconds(&self) -> f64 {
        self.now_nanos() * 1e-9
    }
}

/// Clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
    mode: SleepMode,
}

impl SystemClock {
    pub fn new(mode: SleepMode) -> Self {
        Self {
            origin: Instant::now(),
            mode,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(SleepMode::Block)
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> f64 {
        // Offset by one second so a pulse stamped at start-up is never zero.
        self.origin.elapsed().as_nanos() as f64 + 1e9
    }

    fn sleep_until(&self, target_nanos: f64) -> f64 {
        let start = self.now_nanos();
        let remaining = target_nanos - start;
        if remaining <= 0.0 {
            return 0.0;
        }
        match self.mode {
            SleepMode::Block => thread::sleep(Duration::from_nanos(remaining as u64)),
            SleepMode::Spin => {
                while self.now_nanos() < target_nanos {
                    hint::spin_loop();
                }
            }
            SleepMode::Hybrid => {
                if remaining > HYBRID_SPIN_NANOS {
                    thread::sleep(Duration::from_nanos((remaining - HYBRID_SPIN_NANOS) as u64));
                }
                while self.now_nanos() < target_nanos {
                    hint::spin_loop();
                }
            }
        }
        (self.now_nanos() - start) * 1e-9
    }
}

/// Virtual clock for single-threaded simulation: sleeping jumps time forward.
#[derive(Debug)]
pub struct SimulatedClock {
    now: AtomicU64,
}

impl SimulatedClock {
    /// Starts at one second.
    pub fn new() -> Self {
        Self::starting_at(1_000_000_000)
    }

    pub fn starting_at(nanos: u64) -> Self {
        Self {
            now: AtomicU64::new(nanos),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimulatedClock {
    fn now_nanos(&self) -> f64 {
        self.now.load(Ordering::SeqCst) as f64
    }

    fn sleep_until(&self, target_nanos: f64) -> f64 {
        let target = target_nanos.max(0.0).ceil() as u64;
        let previous = self.now.fetch_max(target, Ordering::SeqCst);
        target.saturating_sub(previous) as f64 * 1e-9
    }
}
