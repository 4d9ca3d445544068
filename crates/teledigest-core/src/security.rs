use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::domain::UserId;

// ============== Authorization ==============

/// Static allowlist check (`telegram.allowed_users`).
///
/// Runtime grants from `/auth` live in the message store and are checked by
/// the caller.
pub fn is_authorized(user_id: Option<UserId>, allowed_users: &[i64]) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    allowed_users.contains(&user_id.0)
}

/// Compare secrets without early exit on the first differing byte.
pub fn secrets_match(expected: &str, provided: &str) -> bool {
    let a = expected.as_bytes();
    let b = provided.as_bytes();
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

// ============== Rate Limiter (Token Bucket) ==============

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Per-user token bucket, used to keep `/today` from hammering the LLM.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: HashMap<UserId, Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(1e-9),
            buckets: HashMap::new(),
        }
    }

    /// `Ok(())` if a request is allowed now, else how long until the next token.
    pub fn check(&mut self, user_id: UserId) -> Result<(), Duration> {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&mut self, user_id: UserId, now: Instant) -> Result<(), Duration> {
        let capacity = self.capacity;
        let bucket = self.buckets.entry(user_id).or_insert_with(|| Bucket {
            tokens: capacity,
            last_update: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(capacity);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let secs = (1.0 - bucket.tokens) / self.refill_per_sec;
        Err(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_requires_listed_user() {
        assert!(is_authorized(Some(UserId(1)), &[1, 2]));
        assert!(!is_authorized(Some(UserId(3)), &[1, 2]));
        assert!(!is_authorized(None, &[1]));
        assert!(!is_authorized(Some(UserId(1)), &[]));
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("hunter2", "hunter2"));
        assert!(!secrets_match("hunter2", "hunter3"));
        assert!(!secrets_match("hunter2", "hunter"));
        assert!(!secrets_match("hunter2", "hunter22"));
        assert!(secrets_match("", ""));
    }

    #[test]
    fn rate_limiter_refills_over_window() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(2, Duration::from_secs(10));
        let u = UserId(1);

        assert!(rl.check_at(u, start).is_ok());
        assert!(rl.check_at(u, start).is_ok());
        let wait = rl.check_at(u, start).unwrap_err();
        assert!(wait > Duration::from_secs(4) && wait <= Duration::from_secs(5));

        // 2 tokens per 10s: one token back after 5s.
        assert!(rl.check_at(u, start + Duration::from_secs(5)).is_ok());
        // Other users have their own bucket.
        assert!(rl.check_at(UserId(2), start).is_ok());
    }
}
