// src/service/mod.rs
//! The Trade Data Service boundary: everything the coordinator needs from the
//! upstream source, expressed as one async trait so the scheduler can be
//! exercised against scripted fakes in tests.

pub mod http;

use crate::error::Result;
use crate::types::{PairSummary, RateLimitState, StalenessReport};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use http::HttpTradeDataService;

/// Upstream marketplace data source.
///
/// The streamed fetch is the system's only push channel: one message per
/// pair, each carrying a full `PairSummary` keyed by its index, in whatever
/// order the server produces them. Channel close signals batch completion; an
/// `Err` message signals a channel-level failure (already-received pairs stay
/// valid).
#[async_trait]
pub trait TradeDataService: Send + Sync {
    /// Opens the streamed multi-pair fetch.
    async fn stream_pairs(
        &self,
        desired_count: usize,
        force_fresh: bool,
    ) -> Result<mpsc::Receiver<Result<PairSummary>>>;

    /// Refreshes a single pair. When `proposed_price` is set the upstream
    /// listing itself is updated to that price before being re-read.
    async fn refresh_pair(
        &self,
        index: usize,
        desired_count: usize,
        proposed_price: Option<&str>,
    ) -> Result<PairSummary>;

    /// Returns the full current summary set without forcing a fresh upstream
    /// fetch.
    async fn latest_cached(&self, desired_count: usize) -> Result<Vec<PairSummary>>;

    /// Per-pair cache staleness plus the recommended check interval.
    async fn staleness(&self) -> Result<StalenessReport>;

    /// Current upstream rate-limit picture.
    async fn rate_limit_status(&self) -> Result<RateLimitState>;
}
