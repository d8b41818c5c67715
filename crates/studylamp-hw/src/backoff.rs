//! Retry delays for device acquisition.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a retry cap.
///
/// With the defaults a failing device is retried after 1, 2, 4, 8, 16, 16, 16
/// and 16 seconds, then given up on.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Extra random delay as a fraction of each step (0.0 disables jitter).
    pub jitter: f32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(16),
            max_retries: 8,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Same delay every time, for `max_retries` attempts.
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            initial: delay,
            factor: 1,
            max_delay: delay,
            max_retries,
            jitter: 0.0,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Fresh sequence of delays for one start attempt.
    pub fn delays(&self) -> Delays {
        Delays {
            policy: self.clone(),
            next: self.initial.min(self.max_delay),
            issued: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delays {
    policy: Backoff,
    next: Duration,
    issued: u32,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.issued >= self.policy.max_retries {
            return None;
        }
        self.issued += 1;

        let base = self.next;
        self.next = base
            .saturating_mul(self.policy.factor.max(1))
            .min(self.policy.max_delay);

        if self.policy.jitter > 0.0 {
            let extra = base.mul_f32(self.policy.jitter * rand::thread_rng().gen::<f32>());
            Some(base + extra)
        } else {
            Some(base)
        }
    }
}
