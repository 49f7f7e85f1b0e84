//! Per-source sliding-window rate limiter.
//!
//! Each original sender may have at most `max_messages` envelopes admitted
//! in any `window`. Idle senders are swept so the table cannot grow without
//! bound.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

pub struct RateLimiter {
    max_messages: usize,
    window: Duration,
    hits: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages: max_messages.max(1) as usize,
            window,
            hits: HashMap::new(),
        }
    }

    /// Admit one message from `source` at `now`, or refuse it.
    pub fn check(&mut self, source: &str, now: DateTime<Utc>) -> bool {
        let window = self.window;
        let hits = self.hits.entry(source.to_owned()).or_default();
        while hits.front().map(|t| now - *t >= window).unwrap_or(false) {
            hits.pop_front();
        }
        if hits.len() >= self.max_messages {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Drop senders with no hits inside the window.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.hits
            .retain(|_, hits| hits.back().map(|t| now - *t < window).unwrap_or(false));
    }

    pub fn tracked_sources(&self) -> usize {
        self.hits.len()
    }
}
