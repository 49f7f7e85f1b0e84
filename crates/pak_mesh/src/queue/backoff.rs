//! Retry delays: exponential, capped, with symmetric jitter.
//!
//! attempt 1 → base, attempt 2 → 2·base, attempt 3 → 4·base … until `cap`.

use chrono::Duration;
use rand::Rng;

use crate::config::QueueSettings;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    jitter: f64,
}

impl Backoff {
    pub fn new(base_ms: u64, cap_ms: u64, jitter: f64) -> Self {
        Self {
            base_ms,
            cap_ms: cap_ms.max(base_ms),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self::new(settings.backoff_base_ms, settings.backoff_cap_ms, settings.backoff_jitter)
    }

    /// Delay before the retry that follows `attempts` failed tries, no jitter.
    pub fn base_delay_ms(&self, attempts: u32) -> u64 {
        // 2^40 · base overflows nothing we care about and is always past the cap.
        let exp = attempts.saturating_sub(1).min(40);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.cap_ms)
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_ms(attempts) as f64;
        let spread = if self.jitter > 0.0 {
            rng.gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        let ms = (base * (1.0 + spread)).max(0.0) as i64;
        Duration::milliseconds(ms)
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        self.delay_with(attempts, &mut rand::thread_rng())
    }
}
