use log::debug;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nix::sys::time::TimeSpec;
use nix::time::{ClockId, ClockNanosleepFlags, clock_gettime, clock_nanosleep};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TimingStrategy {
    /// Spin on the monotonic clock for the whole interval.
    BusyWait,
    /// Absolute-deadline sleep for all but the final threshold, then spin.
    #[default]
    HybridSleep,
}

/// Spins between run-flag checks. Keeps `stop` latency bounded during long
/// busy-waits without hammering the atomic.
const SPIN_CHECK_INTERVAL: u32 = 64;

#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    strategy: TimingStrategy,
    threshold: Duration,
}

impl Pacer {
    pub fn new(strategy: TimingStrategy, threshold: Duration) -> Self {
        Self {
            strategy,
            threshold,
        }
    }

    pub fn strategy(&self) -> TimingStrategy {
        self.strategy
    }

    /// Blocks for `duration`, returning early once `running` is cleared.
    pub fn wait(&self, duration: Duration, running: &AtomicBool) {
        let deadline = Instant::now() + duration;
        match self.strategy {
            TimingStrategy::BusyWait => spin_until(deadline, running),
            TimingStrategy::HybridSleep => {
                if duration > self.threshold {
                    sleep_monotonic(duration - self.threshold);
                }
                spin_until(deadline, running);
            }
        }
    }
}

fn spin_until(deadline: Instant, running: &AtomicBool) {
    let mut spins = 0u32;
    while Instant::now() < deadline {
        spins = spins.wrapping_add(1);
        if spins % SPIN_CHECK_INTERVAL == 0 {
            if !running.load(Ordering::Acquire) {
                return;
            }
            std::thread::yield_now();
        } else {
            hint::spin_loop();
        }
    }
}

fn sleep_monotonic(duration: Duration) {
    let clock = ClockId::CLOCK_MONOTONIC;
    let now = match clock_gettime(clock) {
        Ok(now) => now,
        Err(e) => {
            debug!("clock_gettime failed ({e}), falling back to busy-wait");
            return;
        }
    };
    let deadline = now + TimeSpec::from_duration(duration);
    // absolute deadline: an EINTR retry cannot overshoot
    loop {
        match clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, &deadline) {
            Ok(_) => return,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                debug!("clock_nanosleep failed ({e}), falling back to busy-wait");
                return;
            }
        }
    }
}

/// Lock-free `f64` cell stored as its bit pattern.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_f64_round_trips_value() {
        let cell = AtomicF64::new(12.5);
        assert_eq!(cell.load(), 12.5);
        cell.store(99.9);
        assert_eq!(cell.load(), 99.9);
    }

    #[test]
    fn hybrid_wait_reaches_deadline() {
        let pacer = Pacer::new(TimingStrategy::HybridSleep, Duration::from_micros(100));
        let running = AtomicBool::new(true);
        let start = Instant::now();
        pacer.wait(Duration::from_millis(5), &running);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn busy_wait_returns_early_when_stopped() {
        let pacer = Pacer::new(TimingStrategy::BusyWait, Duration::from_micros(100));
        let running = AtomicBool::new(false);
        let start = Instant::now();
        pacer.wait(Duration::from_secs(5), &running);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
