// src/types.rs
//! Core wire and domain types shared across the desk: trade pairs, listing
//! summaries, rate-limit bucket state and undercut suggestions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One configured exchange direction. Identity is the pair's position index
/// in the configured ordered sequence, not anything carried on the struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradePair {
    /// Currency we want to receive.
    #[serde(rename = "get")]
    pub want: String,
    /// Currency we pay with.
    pub pay: String,
    /// Priority flag set by the user for pairs they watch closely.
    #[serde(default)]
    pub hot: bool,
}

impl TradePair {
    pub fn new(want: impl Into<String>, pay: impl Into<String>) -> Self {
        Self {
            want: want.into(),
            pay: pay.into(),
            hot: false,
        }
    }
}

impl fmt::Display for TradePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.pay, self.want)
    }
}

/// A single competing listing. Rate is pay-units per want-unit; within a
/// `PairSummary` listings are ordered ascending by rate, index 0 being the
/// most competitive offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub rate: f64,
    #[serde(rename = "seller", default)]
    pub account: Option<String>,
    #[serde(default)]
    pub stock: Option<u64>,
    #[serde(rename = "indexed", default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn at_rate(rate: f64) -> Self {
        Self {
            rate,
            account: None,
            stock: None,
            observed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Ok,
    Error,
    Invalid,
    Loading,
    RateLimited,
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PairStatus::Ok => "ok",
            PairStatus::Error => "error",
            PairStatus::Invalid => "invalid",
            PairStatus::Loading => "loading",
            PairStatus::RateLimited => "rate_limited",
        };
        write!(f, "{}", s)
    }
}

/// Everything the desk knows about one configured pair. Replaced wholesale on
/// every successful refresh; the `index` always mirrors the slot position in
/// the `ResultStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSummary {
    pub index: usize,
    #[serde(flatten)]
    pub pair: TradePair,
    pub status: PairStatus,
    #[serde(default)]
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub best_rate: Option<f64>,
    #[serde(default)]
    pub median_rate: Option<f64>,
    #[serde(default)]
    pub count_returned: usize,
    #[serde(default)]
    pub trend: Option<Vec<f64>>,
    #[serde(default)]
    pub fetched_at: Option<String>,
    /// Seconds until the next attempt makes sense, set when `rate_limited`.
    #[serde(default)]
    pub rate_limit_remaining: Option<f64>,
    /// Index of the reciprocal pair (A->B vs B->A) when one is configured.
    #[serde(default)]
    pub linked_pair_index: Option<usize>,
    #[serde(default)]
    pub profit_margin_raw: Option<f64>,
    #[serde(default)]
    pub profit_margin_pct: Option<f64>,
}

impl PairSummary {
    /// Placeholder shown while a refresh for this slot is outstanding.
    pub fn loading(index: usize, pair: TradePair) -> Self {
        Self {
            index,
            pair,
            status: PairStatus::Loading,
            listings: Vec::new(),
            best_rate: None,
            median_rate: None,
            count_returned: 0,
            trend: None,
            fetched_at: None,
            rate_limit_remaining: None,
            linked_pair_index: None,
            profit_margin_raw: None,
            profit_margin_pct: None,
        }
    }

    /// Builds a settled summary from listings already sorted rate-ascending.
    pub fn with_listings(index: usize, pair: TradePair, listings: Vec<Listing>) -> Self {
        let best_rate = listings.first().map(|l| l.rate);
        let median_rate = median_of(&listings);
        let count_returned = listings.len();
        Self {
            index,
            pair,
            status: if listings.is_empty() {
                PairStatus::Error
            } else {
                PairStatus::Ok
            },
            listings,
            best_rate,
            median_rate,
            count_returned,
            trend: None,
            fetched_at: Some(Utc::now().to_rfc3339()),
            rate_limit_remaining: None,
            linked_pair_index: None,
            profit_margin_raw: None,
            profit_margin_pct: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.status != PairStatus::Loading
    }
}

fn median_of(listings: &[Listing]) -> Option<f64> {
    if listings.is_empty() {
        return None;
    }
    let n = listings.len();
    if n % 2 == 1 {
        Some(listings[n / 2].rate)
    } else {
        Some((listings[n / 2 - 1].rate + listings[n / 2].rate) / 2.0)
    }
}

/// One rate-limit window as reported by the upstream source, wire format
/// `current:limit:reset_s`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub current: u32,
    pub limit: u32,
    #[serde(rename = "reset_s")]
    pub reset_seconds: f64,
}

impl RateLimitBucket {
    pub fn new(current: u32, limit: u32, reset_seconds: f64) -> Self {
        Self {
            current,
            limit,
            reset_seconds,
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            f64::from(self.current) / f64::from(self.limit)
        }
    }
}

/// Full rate-limit picture, synced wholesale from the upstream source and
/// decayed locally between syncs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    #[serde(default)]
    pub blocked: bool,
    #[serde(rename = "block_remaining", default)]
    pub block_remaining_seconds: f64,
    #[serde(default)]
    pub rules: BTreeMap<String, Vec<RateLimitBucket>>,
}

/// Staleness report for one configured pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalePair {
    pub index: usize,
    #[serde(default)]
    pub expired: bool,
    #[serde(default)]
    pub seconds_remaining: f64,
}

/// Upstream answer to the cache-staleness query, including the recommended
/// polling interval for the background check loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessReport {
    #[serde(default)]
    pub check_interval_seconds: u64,
    #[serde(default)]
    pub pairs: Vec<StalePair>,
}

/// A price the undercut engine proposes, either a plain decimal or an exact
/// fraction rendered as `num/den` (unit fractions come out as `1/N`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SuggestedPrice {
    Decimal(f64),
    Fraction(u64, u64),
}

impl SuggestedPrice {
    pub fn as_f64(&self) -> f64 {
        match *self {
            SuggestedPrice::Decimal(v) => v,
            SuggestedPrice::Fraction(num, den) => num as f64 / den as f64,
        }
    }
}

impl fmt::Display for SuggestedPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SuggestedPrice::Decimal(v) => write!(f, "{}", v),
            SuggestedPrice::Fraction(num, den) => write!(f, "{}/{}", num, den),
        }
    }
}

/// Outcome of an undercut computation. `value` is `None` when no meaningful
/// undercut exists at the target's resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct UndercutSuggestion {
    pub value: Option<SuggestedPrice>,
    pub already_optimal: bool,
}

impl UndercutSuggestion {
    pub fn none() -> Self {
        Self {
            value: None,
            already_optimal: false,
        }
    }
}
