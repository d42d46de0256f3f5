//! Sliding-window rate limiting with block-and-decay, and IP hashing.
//!
//! Four independently configured limiters coexist: websocket control frames,
//! the HTTP API, heartbeats, and session-begin. Each identifier's entry is
//! mutated atomically with respect to other operations on the same
//! identifier; a `DashMap` gives that per-key atomicity without a single
//! coarse lock across the whole table.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::metrics::METRICS_ID_RATE_LIMIT_DENIALS;

/// Which preconfigured limiter an identifier is being checked against.
///
/// Carried on each [`RateLimiter`] purely to label the shared
/// `rate_limit.denials` metric by kind at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimiterKind {
    /// Inbound websocket control frames, keyed by socket id.
    WsControl,
    /// The HTTP API surface, keyed by client IP.
    Api,
    /// Inbound heartbeat frames, keyed by socket id.
    Heartbeat,
    /// `POST /session/begin`, keyed by client IP.
    SessionBegin,
}

impl RateLimiterKind {
    /// The metric label value for this kind.
    pub fn as_label(self) -> &'static str {
        match self {
            RateLimiterKind::WsControl => "ws_control",
            RateLimiterKind::Api => "api",
            RateLimiterKind::Heartbeat => "heartbeat",
            RateLimiterKind::SessionBegin => "session_begin",
        }
    }
}

/// Tunable constants for one [`RateLimiterKind`].
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Maximum requests allowed within `window`.
    pub max_requests: u32,
    /// The sliding window's width.
    pub window: Duration,
    /// How long an identifier stays blocked once it exceeds `max_requests`.
    pub block_duration: Duration,
}

impl RateLimiterConfig {
    /// `60 req / 60 s`, blocked for `300 s` — websocket control frames.
    pub const fn ws_control() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
        }
    }

    /// `30 req / 60 s`, blocked for `300 s` — the HTTP API surface.
    pub const fn api() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
        }
    }

    /// `120 req / 60 s`, blocked for `60 s` — heartbeat frames.
    pub const fn heartbeat() -> Self {
        Self {
            max_requests: 120,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(60),
        }
    }

    /// `5 req / 60 s`, blocked for `300 s` — `POST /session/begin`.
    pub const fn session_begin() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
        }
    }

}

#[derive(Debug, Clone)]
struct Entry {
    count: u32,
    window_start: i64,
    blocked: bool,
    blocked_until: i64,
}

/// The decision returned by [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The call may proceed.
    Allowed,
    /// The call must be denied; retry after this many seconds.
    Denied {
        /// Seconds the caller should wait before retrying.
        retry_after_seconds: u64,
    },
}

/// One sliding-window-with-block limiter instance.
pub struct RateLimiter {
    kind: RateLimiterKind,
    config: RateLimiterConfig,
    entries: DashMap<String, Entry>,
}

impl RateLimiter {
    /// Builds a limiter of `kind`, tuned by `config`.
    pub fn new(kind: RateLimiterKind, config: RateLimiterConfig) -> Self {
        Self {
            kind,
            config,
            entries: DashMap::new(),
        }
    }

    /// Checks and, if allowed, consumes one unit of budget for `identifier`.
    pub fn check(&self, identifier: &str) -> RateDecision {
        let now = Utc::now().timestamp_millis();
        let window_ms = self.config.window.as_millis() as i64;
        let block_ms = self.config.block_duration.as_millis() as i64;

        let mut entry = self.entries.entry(identifier.to_owned()).or_insert(Entry {
            count: 0,
            window_start: now,
            blocked: false,
            blocked_until: 0,
        });

        if entry.blocked {
            if now < entry.blocked_until {
                let retry_after_seconds = ((entry.blocked_until - now).max(0) as u64).div_ceil(1000);
                ::metrics::counter!(METRICS_ID_RATE_LIMIT_DENIALS, "kind" => self.kind.as_label()).increment(1);
                return RateDecision::Denied {
                    retry_after_seconds,
                };
            }
            entry.blocked = false;
            entry.count = 1;
            entry.window_start = now;
            return RateDecision::Allowed;
        }

        if now - entry.window_start > window_ms {
            entry.count = 1;
            entry.window_start = now;
            return RateDecision::Allowed;
        }

        entry.count += 1;
        if entry.count > self.config.max_requests {
            entry.blocked = true;
            entry.blocked_until = now + block_ms;
            let retry_after_seconds = (block_ms.max(0) as u64).div_ceil(1000);
            ::metrics::counter!(METRICS_ID_RATE_LIMIT_DENIALS, "kind" => self.kind.as_label()).increment(1);
            return RateDecision::Denied {
                retry_after_seconds,
            };
        }
        RateDecision::Allowed
    }

    /// Drops entries whose window has expired and whose block, if any, has
    /// elapsed, bounding the table's memory use.
    pub fn sweep(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        let window_ms = self.config.window.as_millis() as i64;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if entry.blocked {
                now < entry.blocked_until
            } else {
                now - entry.window_start <= window_ms
            }
        });
        before - self.entries.len()
    }
}

/// Keyed SHA-256 IP hashing, deterministic and one-way.
///
/// Used by the Session Manager and anywhere a caller wants to derive a rate
/// limiter identifier from a client address without storing the raw value.
pub struct IpHasher {
    key: Vec<u8>,
}

impl IpHasher {
    /// Builds a hasher keyed by `secret`.
    pub fn new(secret: &secrecy::SecretString) -> Self {
        use secrecy::ExposeSecret as _;
        Self {
            key: secret.expose_secret().as_bytes().to_vec(),
        }
    }

    /// Hashes `address` to 64 lowercase hex characters.
    pub fn hash(&self, address: &str) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts keys of any length");
        mac.update(address.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn allows_up_to_the_configured_budget_then_blocks() {
        let limiter = RateLimiter::new(
            RateLimiterKind::Api,
            RateLimiterConfig {
                max_requests: 3,
                window: Duration::from_secs(60),
                block_duration: Duration::from_secs(300),
            },
        );
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        match limiter.check("a") {
            RateDecision::Denied {
                retry_after_seconds,
            } => assert_eq!(retry_after_seconds, 300),
            RateDecision::Allowed => panic!("expected a denial on the 4th call"),
        }
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = RateLimiter::new(
            RateLimiterKind::Api,
            RateLimiterConfig {
                max_requests: 1,
                window: Duration::from_secs(60),
                block_duration: Duration::from_secs(60),
            },
        );
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("b"), RateDecision::Allowed);
    }

    #[test]
    fn ip_hash_is_deterministic_and_distinguishes_inputs() {
        let hasher = IpHasher::new(&SecretString::from(
            "ip-hash-secret-value-long-enough".to_owned(),
        ));
        let h1 = hasher.hash("203.0.113.7");
        let h2 = hasher.hash("203.0.113.7");
        let h3 = hasher.hash("203.0.113.8");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }
}
