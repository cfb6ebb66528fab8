//! Bucket Types and Window Accounting
//!
//! A bucket is a named rate-limit scope with a fixed capacity window. This
//! module holds the pure accounting shared by every store backend: window
//! rollover, consumption, and authoritative corrections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default requests per window for a bucket never seen before
pub const DEFAULT_BUCKET_LIMIT: u32 = 5;

/// Default window length for a bucket never seen before
pub const DEFAULT_BUCKET_WINDOW: Duration = Duration::from_secs(1);

/// Limits applied when a bucket is created lazily
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDefaults {
    /// Max requests per window
    pub limit: u32,

    /// Window length
    pub window: Duration,
}

impl Default for BucketDefaults {
    fn default() -> Self {
        Self {
            limit: DEFAULT_BUCKET_LIMIT,
            window: DEFAULT_BUCKET_WINDOW,
        }
    }
}

/// Quota state of one rate-limit bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket identifier (route template key)
    pub bucket_id: String,

    /// Max requests per window
    pub limit: u32,

    /// Requests left in the current window
    pub remaining: u32,

    /// When the current window ends
    pub reset_at: DateTime<Utc>,

    /// Window length used on rollover
    #[serde(with = "duration_ms")]
    pub window: Duration,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

/// Result of a consume attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Capacity was taken
    Allowed {
        /// Remaining capacity after this grant
        remaining: u32,
    },
    /// No capacity until the window resets
    Denied {
        /// Time until `reset_at`
        retry_after: Duration,
    },
}

impl ConsumeOutcome {
    /// Whether the consume was granted
    pub fn is_allowed(&self) -> bool {
        matches!(self, ConsumeOutcome::Allowed { .. })
    }
}

impl Bucket {
    /// Create a fresh bucket with a full window starting at `now`
    pub fn new(bucket_id: impl Into<String>, defaults: BucketDefaults, now: DateTime<Utc>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            limit: defaults.limit,
            remaining: defaults.limit,
            reset_at: window_end(now, defaults.window),
            window: defaults.window,
            updated_at: now,
        }
    }

    /// Roll the window over if `reset_at` has passed
    ///
    /// Returns true if the window was reset.
    pub fn roll_window(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.reset_at {
            return false;
        }
        self.remaining = self.limit;
        self.reset_at = window_end(now, self.window);
        self.updated_at = now;
        true
    }

    /// Try to take `cost` units of capacity at `now`
    ///
    /// `remaining` never goes negative: a consume that would overdraw the
    /// bucket is denied with the time left until `reset_at`.
    pub fn consume(&mut self, cost: u32, now: DateTime<Utc>) -> ConsumeOutcome {
        self.roll_window(now);

        if self.remaining >= cost {
            self.remaining -= cost;
            self.updated_at = now;
            ConsumeOutcome::Allowed {
                remaining: self.remaining,
            }
        } else {
            let retry_after = (self.reset_at - now).to_std().unwrap_or(Duration::ZERO);
            ConsumeOutcome::Denied { retry_after }
        }
    }

    /// Overwrite local state with limits reported by the remote API
    pub fn apply_snapshot(&mut self, snapshot: &RateLimitSnapshot, now: DateTime<Utc>) {
        self.limit = snapshot.limit;
        self.remaining = snapshot.remaining.min(snapshot.limit);
        self.reset_at = snapshot.reset_at;
        self.updated_at = now;
    }
}

/// Rate-limit state observed on a remote response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    /// Max requests per window
    pub limit: u32,

    /// Requests left in the window
    pub remaining: u32,

    /// When the window ends
    pub reset_at: DateTime<Utc>,
}

const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";
const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
const HEADER_RETRY_AFTER: &str = "retry-after";

impl RateLimitSnapshot {
    /// Parse rate-limit headers from a remote response
    ///
    /// `Reset-After` is preferred over the absolute `Reset` since it does not
    /// depend on clock agreement with the remote.
    pub fn from_headers(headers: &HashMap<String, String>, now: DateTime<Utc>) -> Option<Self> {
        let limit = header_value(headers, HEADER_LIMIT)?.parse::<u32>().ok()?;
        let remaining = header_value(headers, HEADER_REMAINING)?.parse::<u32>().ok()?;

        let reset_at = match header_value(headers, HEADER_RESET_AFTER)
            .and_then(|v| parse_seconds(v))
        {
            Some(after) => window_end(now, after),
            None => {
                let epoch = header_value(headers, HEADER_RESET)?.parse::<f64>().ok()?;
                if !epoch.is_finite() || epoch < 0.0 {
                    return None;
                }
                DateTime::from_timestamp_millis((epoch * 1000.0) as i64)?
            }
        };

        Some(Self {
            limit,
            remaining,
            reset_at,
        })
    }
}

/// Parse the `Retry-After` header (seconds)
pub fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    header_value(headers, HEADER_RETRY_AFTER).and_then(parse_seconds)
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs = value.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// End of a window of length `window` starting at `start`, saturating
pub(crate) fn window_end(start: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn defaults(limit: u32, window_ms: u64) -> BucketDefaults {
        BucketDefaults {
            limit,
            window: Duration::from_millis(window_ms),
        }
    }

    #[test]
    fn test_new_bucket_is_full() {
        let now = Utc::now();
        let bucket = Bucket::new("GET /users/{id}", defaults(3, 1000), now);
        assert_eq!(bucket.remaining, 3);
        assert_eq!(bucket.reset_at, now + chrono::Duration::milliseconds(1000));
    }

    #[test]
    fn test_consume_until_denied() {
        let now = Utc::now();
        let mut bucket = Bucket::new("b", defaults(2, 1000), now);

        assert_eq!(bucket.consume(1, now), ConsumeOutcome::Allowed { remaining: 1 });
        assert_eq!(bucket.consume(1, now), ConsumeOutcome::Allowed { remaining: 0 });

        match bucket.consume(1, now) {
            ConsumeOutcome::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(1000));
            }
            other => panic!("expected denial, got {:?}", other),
        }
        assert_eq!(bucket.remaining, 0);
    }

    #[test]
    fn test_window_rollover_resets_remaining() {
        let now = Utc::now();
        let mut bucket = Bucket::new("b", defaults(1, 100), now);
        assert!(bucket.consume(1, now).is_allowed());
        assert!(!bucket.consume(1, now).is_allowed());

        let later = now + chrono::Duration::milliseconds(100);
        assert_eq!(bucket.consume(1, later), ConsumeOutcome::Allowed { remaining: 0 });
        assert_eq!(bucket.reset_at, later + chrono::Duration::milliseconds(100));
    }

    #[test]
    fn test_cost_above_remaining_is_denied_without_overdraw() {
        let now = Utc::now();
        let mut bucket = Bucket::new("b", defaults(3, 1000), now);
        assert!(!bucket.consume(4, now).is_allowed());
        assert_eq!(bucket.remaining, 3);
    }

    #[test]
    fn test_apply_snapshot_overrides_local_state() {
        let now = Utc::now();
        let mut bucket = Bucket::new("b", defaults(5, 1000), now);
        let reset_at = now + chrono::Duration::seconds(30);
        bucket.apply_snapshot(
            &RateLimitSnapshot {
                limit: 10,
                remaining: 0,
                reset_at,
            },
            now,
        );
        assert_eq!(bucket.limit, 10);
        assert_eq!(bucket.remaining, 0);
        assert_eq!(bucket.reset_at, reset_at);
        assert!(!bucket.consume(1, now).is_allowed());
    }

    #[test]
    fn test_snapshot_from_headers_reset_after() {
        let now = Utc::now();
        let mut headers = HashMap::new();
        headers.insert("X-RateLimit-Limit".to_string(), "5".to_string());
        headers.insert("X-RateLimit-Remaining".to_string(), "4".to_string());
        headers.insert("X-RateLimit-Reset-After".to_string(), "1.5".to_string());
        headers.insert("X-RateLimit-Reset".to_string(), "1".to_string());

        let snapshot = RateLimitSnapshot::from_headers(&headers, now).unwrap();
        assert_eq!(snapshot.limit, 5);
        assert_eq!(snapshot.remaining, 4);
        assert_eq!(snapshot.reset_at, now + chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn test_snapshot_from_headers_epoch_reset() {
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-limit".to_string(), "10".to_string());
        headers.insert("x-ratelimit-remaining".to_string(), "9".to_string());
        headers.insert("x-ratelimit-reset".to_string(), "1700000000.250".to_string());

        let snapshot = RateLimitSnapshot::from_headers(&headers, Utc::now()).unwrap();
        assert_eq!(snapshot.reset_at.timestamp_millis(), 1_700_000_000_250);
    }

    #[test]
    fn test_snapshot_requires_all_headers() {
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-limit".to_string(), "10".to_string());
        assert!(RateLimitSnapshot::from_headers(&headers, Utc::now()).is_none());
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "2".to_string());
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(2)));
    }

    proptest! {
        /// However many consumes land inside one window, grants never exceed the limit
        #[test]
        fn prop_grants_never_exceed_limit(limit in 0u32..50, attempts in 0usize..200) {
            let now = Utc::now();
            let mut bucket = Bucket::new("p", defaults(limit, 60_000), now);
            let granted = (0..attempts)
                .filter(|_| bucket.consume(1, now).is_allowed())
                .count();
            prop_assert_eq!(granted, attempts.min(limit as usize));
            prop_assert!(bucket.remaining <= bucket.limit);
        }

        /// A denial never asks the caller to wait past the window reset
        #[test]
        fn prop_retry_after_bounded_by_reset(window_ms in 1u64..10_000, elapsed_ms in 0u64..10_000) {
            let start = Utc::now();
            let mut bucket = Bucket::new("p", defaults(0, window_ms), start);
            let now = start + chrono::Duration::milliseconds(elapsed_ms as i64);
            if let ConsumeOutcome::Denied { retry_after } = bucket.consume(1, now) {
                let until_reset = (bucket.reset_at - now).to_std().unwrap_or(Duration::ZERO);
                prop_assert!(retry_after <= until_reset);
            }
        }
    }
}
