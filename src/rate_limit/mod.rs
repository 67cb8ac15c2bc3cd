// src/rate_limit/mod.rs
//! Local mirror of the upstream source's multi-bucket rate-limit state.
//!
//! The upstream reports per-rule windows as `current:limit:reset_s` triples.
//! We sync that state wholesale after every network call (the server is
//! authoritative) and decay the timers locally once per second in between, so
//! scheduling decisions never need a round-trip of their own.

use crate::types::{RateLimitBucket, RateLimitState};
use log::{debug, warn};

/// Buckets with a cap of at most this many requests saturate after a handful
/// of calls, so near-limit for them means "one request away from the cap".
const SMALL_BUCKET_LIMIT: u32 = 10;
/// Larger buckets tolerate proportional throttling; near-limit kicks in at
/// this utilization once a few requests have been spent.
const LARGE_BUCKET_RATIO: f64 = 0.7;
const LARGE_BUCKET_MIN_CURRENT: u32 = 3;

/// Holds the most recently observed rate-limit state and decays it between
/// server syncs. Owns no timers and performs no I/O; the coordinator drives
/// `tick()` at 1 Hz and `sync()` after every network operation.
#[derive(Debug, Default)]
pub struct RateLimitMonitor {
    state: RateLimitState,
}

impl RateLimitMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole state with the freshly observed server state. Total
    /// overwrite, not a merge.
    pub fn sync(&mut self, state: RateLimitState) {
        if state.blocked {
            warn!(
                "Upstream reports hard block, {:.1}s remaining",
                state.block_remaining_seconds
            );
        }
        self.state = state;
    }

    /// Called once per second; decays every timer by one second, floored at
    /// zero, and recomputes the blocked flag.
    pub fn tick(&mut self) {
        self.state.block_remaining_seconds = (self.state.block_remaining_seconds - 1.0).max(0.0);
        for buckets in self.state.rules.values_mut() {
            for bucket in buckets.iter_mut() {
                bucket.reset_seconds = (bucket.reset_seconds - 1.0).max(0.0);
            }
        }
        self.state.blocked = self.state.block_remaining_seconds > 0.0;
    }

    pub fn is_blocked(&self) -> bool {
        self.state.blocked
    }

    pub fn block_remaining(&self) -> f64 {
        self.state.block_remaining_seconds
    }

    /// True when any live bucket is close enough to its cap that non-critical
    /// traffic should be suppressed. Buckets whose window already elapsed or
    /// whose cap is zero are ignored.
    pub fn is_near_limit(&self) -> bool {
        self.buckets().any(|bucket| {
            if bucket.reset_seconds <= 0.0 || bucket.limit == 0 {
                return false;
            }
            if bucket.limit <= SMALL_BUCKET_LIMIT {
                bucket.current >= bucket.limit.saturating_sub(1)
            } else {
                bucket.current >= LARGE_BUCKET_MIN_CURRENT
                    && bucket.ratio() >= LARGE_BUCKET_RATIO
            }
        })
    }

    /// Highest current/limit ratio across live buckets, for status lines.
    pub fn utilization(&self) -> f64 {
        self.buckets()
            .filter(|b| b.reset_seconds > 0.0 && b.limit > 0)
            .map(RateLimitBucket::ratio)
            .fold(0.0, f64::max)
    }

    pub fn snapshot(&self) -> &RateLimitState {
        &self.state
    }

    fn buckets(&self) -> impl Iterator<Item = &RateLimitBucket> {
        self.state.rules.values().flatten()
    }
}

/// Parses the upstream wire encoding of one rule's bucket list: comma-joined
/// `current:limit:reset_s` triples. Malformed fragments are skipped, never
/// fatal.
pub fn parse_state_header(rule: &str, raw: &str) -> Vec<RateLimitBucket> {
    let mut buckets = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let pieces: Vec<&str> = part.split(':').collect();
        if pieces.len() != 3 {
            debug!("Skipping malformed bucket triple for {}: '{}'", rule, part);
            continue;
        }
        let parsed = (
            pieces[0].parse::<u32>(),
            pieces[1].parse::<u32>(),
            pieces[2].parse::<f64>(),
        );
        match parsed {
            (Ok(current), Ok(limit), Ok(reset_seconds)) => {
                buckets.push(RateLimitBucket::new(current, limit, reset_seconds));
            }
            _ => {
                debug!("Skipping unparsable bucket triple for {}: '{}'", rule, part);
            }
        }
    }
    buckets
}
