//! Jittered exponential backoff for reconnect loops.
//!
//! Delays double from the base up to the cap, with ±50% jitter so a
//! rendezvous point never sees a herd of synchronized redials.

use std::time::Duration;

use rand::Rng;

#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Sensible defaults for peer redial: 500 ms base, 30 s cap.
    pub fn for_reconnect() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    /// Next delay, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        jitter(exp)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn jitter(d: Duration) -> Duration {
    let millis = d.as_millis() as u64;
    if millis == 0 {
        return d;
    }
    let spread = millis / 2;
    let jittered = millis - spread / 2 + rand::thread_rng().gen_range(0..=spread);
    Duration::from_millis(jittered)
}

// ===========================================================================
// Tests
// ===========================================================================
