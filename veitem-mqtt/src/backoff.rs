//! Staggered reconnect delays

use std::time::Duration;

use rand::Rng;

/// Default delay table: 250ms, 1s, 2s, 5s, 10s, 30s
pub fn default_delays() -> Vec<Duration> {
    vec![
        Duration::from_millis(250),
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(5),
        Duration::from_secs(10),
        Duration::from_secs(30),
    ]
}

/// Picks the delay before each reconnect attempt
///
/// Attempt `n` waits `delays[n]` (the last entry once the table runs out)
/// plus a random jitter up to `max_jitter`. After `max_attempts` attempts
/// [`next_delay`](Self::next_delay) returns `None` and the caller gives up.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    delays: Vec<Duration>,
    max_jitter: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(delays: Vec<Duration>, max_jitter: Duration, max_attempts: u32) -> Self {
        Self {
            delays,
            max_jitter,
            max_attempts,
            attempts: 0,
        }
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Forget past attempts, after a successful connect
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let base = self.base_delay(self.attempts);
        self.attempts += 1;
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 { 0 } else { rng.gen_range(0..=jitter_ms) };
        Some(base + Duration::from_millis(jitter))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(index).copied().unwrap_or_default()
    }
}
