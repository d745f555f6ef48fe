//! Engine tunables and backoff policy.

use std::time::Duration;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Number of proposer tasks sharing the input queue.
pub const PROPOSERS: usize = 1;

/// A batch stops growing at this many payload bytes.
pub const MAX_BATCH_SIZE: usize = 0x3_FFFF;
/// A batch stops growing at this many payloads.
pub const MAX_BATCH_APP_DATA: usize = 101;

/// Slots newer than `executed_msg - MIN_CACHED` are never evicted.
pub const MIN_CACHED: u64 = 10;

/// Re-send the prepare/accept with a higher ballot after this long without
/// progress on a slot.
pub const PROPOSE_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// How long the proposer waits for a cache slot before retrying the round.
pub const CACHE_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Patience in `snapshot_wait` before giving up and returning to `start`.
pub const SNAPSHOT_WAIT_TIME: Duration = Duration::from_secs(3);

/// Drain delay between halting delivery and telling the FSM to exit.
pub const TERMINATE_DELAY: Duration = Duration::from_secs(3);

/// Interval between `IAmAlive` beacons.
pub const ALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// A member silent for longer than this is suspect.
pub const DETECTOR_LIVENESS_LAG: Duration = Duration::from_secs(5);

/// Engine configuration. `Default` matches a small LAN deployment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Client-payload bytes the slot cache may retain.
    pub cache_limit: u64,
    /// Hard cap on resident slot states.
    pub max_cached_slots: usize,
    /// Run full 3-phase rounds even on the owner fast path.
    pub three_phase: bool,
    /// Round-trip estimate used before any measurement exists.
    pub initial_rtt: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_limit: 1 << 30,
            max_cached_slots: 50_000,
            three_phase: false,
            initial_rtt: Duration::from_millis(50),
        }
    }
}

/// Exponential backoff for waits on a slot, seeded from the measured
/// round-trip time and clamped to `[5 ms, min(500 ms, 10 x RTT)]`.
#[derive(Debug, Clone)]
pub struct WakeupDelay {
    current: Duration,
    rtt: Duration,
    rng: StdRng,
}

impl WakeupDelay {
    #[must_use]
    pub fn new(rtt: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            rtt,
            rng: StdRng::from_os_rng(),
        }
    }

    #[must_use]
    pub fn with_seed(rtt: Duration, seed: u64) -> Self {
        Self {
            current: Duration::ZERO,
            rtt,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    /// Next delay: first wait is one RTT plus a millisecond, then backs off
    /// by 1.4x per round, folded back under the ceiling with jitter.
    pub fn next(&mut self) -> Duration {
        let mut d = if self.current.is_zero() {
            Duration::from_millis(1) + self.rtt
        } else {
            self.current.mul_f64(1.4)
        };

        let floor = Duration::from_millis(5);
        let ceiling = (self.rtt * 10).min(Duration::from_millis(500)).max(floor);
        while d > ceiling {
            d = d.div_f64(1.3);
        }
        if d < floor {
            d = floor;
        }

        // Jitter desynchronizes competing proposers.
        let jitter = self.rng.random_range(0.9..1.1);
        self.current = d;
        d.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_bounds() {
        let mut w = WakeupDelay::with_seed(Duration::from_millis(50), 1);
        for _ in 0..32 {
            let d = w.next();
            assert!(d >= Duration::from_millis(4), "delay too small: {d:?}");
            assert!(d <= Duration::from_millis(550), "delay too large: {d:?}");
        }
    }

    #[test]
    fn delay_backs_off_then_saturates() {
        let mut w = WakeupDelay::with_seed(Duration::from_millis(10), 7);
        let first = w.next();
        let mut last = first;
        for _ in 0..16 {
            last = w.next();
        }
        // 10x RTT ceiling: 100 ms.
        assert!(last <= Duration::from_millis(115));
        assert!(first <= last || last >= Duration::from_millis(50));
    }

    #[test]
    fn tiny_rtt_respects_floor() {
        let mut w = WakeupDelay::with_seed(Duration::from_micros(100), 3);
        for _ in 0..8 {
            assert!(w.next() >= Duration::from_millis(4));
        }
    }
}
