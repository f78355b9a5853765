//! Per-source handshake rate limiting.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Allows at most `max_per_window` handshake attempts per source IP in any
/// rolling one-minute window.
#[derive(Debug)]
pub struct HandshakeLimiter {
    /// IP -> timestamps of recent attempts, oldest first
    attempts: HashMap<IpAddr, VecDeque<Instant>>,
    max_per_window: usize,
}

impl HandshakeLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            attempts: HashMap::new(),
            max_per_window: max_per_minute.max(1) as usize,
        }
    }

    /// Record an attempt from `ip`. Returns false if it is over the limit;
    /// rejected attempts are not counted.
    pub fn check(&mut self, ip: IpAddr, now: Instant) -> bool {
        let entry = self.attempts.entry(ip).or_default();

        while entry
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= WINDOW)
        {
            entry.pop_front();
        }

        if entry.len() >= self.max_per_window {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Forget sources with no attempts inside the window.
    pub fn prune(&mut self, now: Instant) {
        self.attempts.retain(|_, times| {
            times
                .back()
                .is_some_and(|t| now.saturating_duration_since(*t) < WINDOW)
        });
    }

    pub fn tracked_sources(&self) -> usize {
        self.attempts.len()
    }
}
