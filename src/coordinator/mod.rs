// src/coordinator/mod.rs
//! The refresh scheduler: decides when, how many, and in what order pair
//! refreshes are issued, across the initial streamed load, manual refreshes,
//! per-pair reloads, and the unattended background staleness sweep -- all
//! without ever tripping the upstream rate limit.
//!
//! Concurrency model: one logical timeline of async operations interleaving
//! at network and timer suspension points. The store's per-index busy gate
//! serializes writes per slot, the background sweep never overlaps itself,
//! and starting a fresh initial load cancels any prior streaming channel --
//! the system's only explicit cancellation point.

use crate::config::Config;
use crate::error::{DeskError, Result};
use crate::rate_limit::RateLimitMonitor;
use crate::service::TradeDataService;
use crate::store::ResultStore;
use crate::types::{PairStatus, PairSummary, TradePair, UndercutSuggestion};
use crate::undercut;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Coarse scheduler phase. Per-pair reloads are tracked by the store's busy
/// gate instead, since any number of them may run concurrently for distinct
/// indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    StreamingInitial,
    ManualRefreshing,
    BackgroundChecking,
}

pub struct RefreshCoordinator {
    service: Arc<dyn TradeDataService>,
    store: Arc<ResultStore>,
    monitor: Arc<RwLock<RateLimitMonitor>>,
    config: Arc<Config>,
    phase: RwLock<Phase>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    background_in_flight: AtomicBool,
    /// Timers owned by `start_background`, registered so `stop()` releases
    /// every one of them.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RefreshCoordinator {
    pub fn new(
        service: Arc<dyn TradeDataService>,
        store: Arc<ResultStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            service,
            store,
            monitor: Arc::new(RwLock::new(RateLimitMonitor::new())),
            config,
            phase: RwLock::new(Phase::Idle),
            stream_task: Mutex::new(None),
            background_in_flight: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn phase(&self) -> Phase {
        *self.phase.read().await
    }

    pub fn store(&self) -> Arc<ResultStore> {
        Arc::clone(&self.store)
    }

    pub fn monitor(&self) -> Arc<RwLock<RateLimitMonitor>> {
        Arc::clone(&self.monitor)
    }

    /// Seeds the store with loading placeholders in configured pair order.
    pub async fn init_pairs(&self, pairs: Vec<TradePair>) {
        info!("Seeding {} configured pairs", pairs.len());
        self.store.init_pairs(pairs).await;
    }

    /// Seeds the store from the upstream's cached summary set, establishing
    /// the configured pair order without forcing a fresh fetch.
    pub async fn prime_from_cache(&self) -> Result<usize> {
        let mut results = self.service.latest_cached(self.config.desired_count).await?;
        undercut::annotate_profit_margins(&mut results);
        let count = results.len();
        self.store
            .init_pairs(results.iter().map(|s| s.pair.clone()).collect())
            .await;
        for summary in results {
            let index = summary.index;
            if let Err(e) = self.store.replace(index, summary).await {
                warn!("Discarding cached summary for index {}: {}", index, e);
            }
        }
        self.sync_rate_limits().await;
        info!("Primed {} pairs from upstream cache", count);
        Ok(count)
    }

    /// Begins (or restarts) the initial streamed load. Any previously open
    /// streaming channel is closed first; every slot resets to loading; each
    /// arriving message lands at its carried index regardless of arrival
    /// order. Consumption runs on its own task -- await `join_stream` to
    /// block until the batch settles.
    pub async fn start(self: &Arc<Self>, force_fresh: bool) -> Result<()> {
        if let Some(handle) = self.stream_task.lock().await.take() {
            debug!("Cancelling previously open streaming channel");
            handle.abort();
        }

        self.store.set_all_loading().await;
        *self.phase.write().await = Phase::StreamingInitial;
        info!(
            "Opening streamed load for {} pairs (force_fresh={})",
            self.store.len().await,
            force_fresh
        );

        let mut rx = match self
            .service
            .stream_pairs(self.config.desired_count, force_fresh)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                *self.phase.write().await = Phase::Idle;
                return Err(e);
            }
        };

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Ok(summary) => {
                        let index = summary.index;
                        if let Err(e) = this.store.replace(index, summary).await {
                            warn!("Dropping stream message for index {}: {}", index, e);
                        }
                    }
                    Err(e) => {
                        // Channel-level failure ends the loading state but
                        // keeps every pair that already arrived.
                        warn!("Streaming channel failed: {}", e);
                        break;
                    }
                }
                if this.store.all_settled().await {
                    break;
                }
            }
            this.sync_rate_limits().await;
            *this.phase.write().await = Phase::Idle;
            info!("Initial load settled");
        });
        *self.stream_task.lock().await = Some(handle);
        Ok(())
    }

    /// Awaits the currently running stream consumer, if any.
    pub async fn join_stream(&self) {
        let handle = self.stream_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Reloads one pair, optionally carrying an accepted undercut price that
    /// updates the upstream listing itself. A reload for an index already in
    /// flight is rejected (`Ok(false)`), never queued. The rate-limit state
    /// is re-synced after the call, success or failure alike.
    pub async fn manual_reload(&self, index: usize, proposed_price: Option<&str>) -> Result<bool> {
        if index >= self.store.len().await {
            return Err(DeskError::IndexOutOfRange(index));
        }
        let Some(claim) = self.store.try_begin(index).await else {
            debug!("Manual reload rejected, index {} busy", index);
            return Ok(false);
        };

        if !self.store.mark_loading(&claim).await {
            self.store.finish(claim);
            return Err(DeskError::IndexOutOfRange(index));
        }
        if let Some(price) = proposed_price {
            info!("Repricing index {} to {} before reload", index, price);
        }
        // Resolve through the claim right before dispatch; a concurrent
        // removal may have shifted the slot since the claim was taken.
        let target = match self.store.claim_index(&claim) {
            Some(target) => target,
            None => {
                self.store.finish(claim);
                return Ok(true);
            }
        };
        let outcome = self
            .service
            .refresh_pair(target, self.config.desired_count, proposed_price)
            .await;
        match outcome {
            Ok(summary) => self.store.complete(&claim, summary).await,
            Err(e) => {
                warn!("Reload failed for index {}: {}", target, e);
                self.store.mark_failed(&claim, &e).await;
            }
        }
        self.sync_rate_limits().await;
        self.store.finish(claim);
        Ok(true)
    }

    /// Sequential full refresh of every slot, the user-triggered variant of
    /// the initial load for when streaming is not wanted (one-shot CLI runs).
    pub async fn refresh_all(&self) -> Result<Vec<PairSummary>> {
        *self.phase.write().await = Phase::ManualRefreshing;
        let count = self.store.len().await;
        info!("Manual refresh of all {} pairs", count);
        for index in 0..count {
            let Some(claim) = self.store.try_begin(index).await else {
                debug!("Skipping busy index {} during full refresh", index);
                continue;
            };
            if !self.store.mark_loading(&claim).await {
                self.store.finish(claim);
                warn!("Slot {} vanished during full refresh", index);
                continue;
            }
            let outcome = self
                .service
                .refresh_pair(index, self.config.desired_count, None)
                .await;
            match outcome {
                Ok(summary) => self.store.complete(&claim, summary).await,
                Err(e) => {
                    warn!("Refresh failed for index {}: {}", index, e);
                    self.store.mark_failed(&claim, &e).await;
                }
            }
            self.store.finish(claim);
            if index + 1 < count {
                sleep(Duration::from_millis(self.config.inter_request_delay_ms)).await;
            }
        }
        self.sync_rate_limits().await;
        *self.phase.write().await = Phase::Idle;
        let mut snapshot = self.store.snapshot().await;
        undercut::annotate_profit_margins(&mut snapshot);
        Ok(snapshot)
    }

    /// One background sweep: gated first on the rate-limit monitor (blocked
    /// or near-limit means zero network calls), then bounded to the first
    /// `stale_batch_size` stale pairs, refreshed sequentially with a fixed
    /// delay between requests. Skipped outright when the previous sweep is
    /// still running. Returns the number of pairs refreshed.
    pub async fn background_tick(&self) -> Result<usize> {
        if self.background_in_flight.swap(true, Ordering::SeqCst) {
            debug!("Background sweep still running, skipping this tick");
            return Ok(0);
        }
        let result = self.run_background_sweep().await;
        self.background_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run_background_sweep(&self) -> Result<usize> {
        {
            let monitor = self.monitor.read().await;
            if monitor.is_blocked() {
                info!(
                    "Background sweep suppressed, blocked for {:.0}s",
                    monitor.block_remaining()
                );
                return Ok(0);
            }
            if monitor.is_near_limit() {
                info!(
                    "Background sweep suppressed, utilization {:.0}%",
                    monitor.utilization() * 100.0
                );
                return Ok(0);
            }
        }

        *self.phase.write().await = Phase::BackgroundChecking;
        let sweep = self.refresh_stale_batch().await;
        *self.phase.write().await = Phase::Idle;
        sweep
    }

    async fn refresh_stale_batch(&self) -> Result<usize> {
        let report = self.service.staleness().await?;
        let mut batch = Vec::new();
        for stale in report.pairs.iter().filter(|p| p.expired) {
            if batch.len() >= self.config.stale_batch_size {
                // Deterministic truncation; the remainder waits for the
                // next tick.
                break;
            }
            match self.store.get(stale.index).await {
                // Invalid pairs are excluded from background eligibility.
                Some(slot) if slot.status == PairStatus::Invalid => continue,
                Some(_) => batch.push(stale.index),
                None => continue,
            }
        }
        if batch.is_empty() {
            debug!("No stale pairs eligible for background refresh");
            self.sync_rate_limits().await;
            return Ok(0);
        }
        info!("Background refresh of stale pairs {:?}", batch);

        let mut refreshed = 0;
        for (position, &index) in batch.iter().enumerate() {
            if position > 0 {
                sleep(Duration::from_millis(self.config.inter_request_delay_ms)).await;
            }
            let Some(claim) = self.store.try_begin(index).await else {
                continue;
            };
            let Some(target) = self.store.claim_index(&claim) else {
                self.store.finish(claim);
                continue;
            };
            let outcome = self
                .service
                .refresh_pair(target, self.config.desired_count, None)
                .await;
            match outcome {
                Ok(summary) => {
                    self.store.complete(&claim, summary).await;
                    refreshed += 1;
                }
                Err(e) => {
                    if e.is_recoverable() {
                        warn!(
                            "Background refresh failed for index {}, will retry next sweep: {}",
                            target, e
                        );
                    } else {
                        warn!(
                            "Background refresh failed for index {} for good: {}",
                            target, e
                        );
                    }
                    self.store.mark_failed(&claim, &e).await;
                }
            }
            self.store.finish(claim);
        }
        // One sync covers the whole batch.
        self.sync_rate_limits().await;
        Ok(refreshed)
    }

    /// Appends a new pair as a loading slot and refreshes it. A failed first
    /// refresh leaves the slot visible with an error status, never silently
    /// rolled back.
    pub async fn add_pair(&self, pair: TradePair) -> Result<usize> {
        let index = self
            .store
            .append(PairSummary::loading(0, pair.clone()))
            .await;
        info!("Added pair {} at index {}", pair, index);
        self.manual_reload(index, None).await?;
        Ok(index)
    }

    /// Removes the pair at `index`; every later slot shifts down by one.
    pub async fn remove_pair(&self, index: usize) -> Result<PairSummary> {
        let removed = self.store.remove_at(index).await?;
        info!("Removed pair {} from index {}", removed.pair, index);
        Ok(removed)
    }

    /// Undercut suggestion for one pair, locating the caller's own listing by
    /// the configured account name(s).
    pub async fn suggest_undercut(&self, index: usize) -> Result<UndercutSuggestion> {
        let summary = self
            .store
            .get(index)
            .await
            .ok_or(DeskError::IndexOutOfRange(index))?;
        let account = self.config.account_name.as_deref().unwrap_or("");
        debug!(
            "Undercut for index {}: occupied denominators {:?}",
            index,
            undercut::occupied_denominators(&summary.listings)
        );
        Ok(undercut::suggest_for_summary(&summary, account))
    }

    /// Spawns the recurring timers: the 1 Hz monitor decay tick and the
    /// background staleness sweep. The sweep interval comes from the
    /// service's recommended check interval when available, falling back to
    /// the configured default. Both timers are registered for release by
    /// `stop()`.
    pub async fn start_background(self: &Arc<Self>) {
        let monitor = Arc::clone(&self.monitor);
        let decay = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.write().await.tick();
            }
        });

        let check_interval = match self.service.staleness().await {
            Ok(report) if report.check_interval_seconds > 0 => report.check_interval_seconds,
            _ => self.config.background_check_interval_secs,
        };
        info!("Background staleness sweep every {}s", check_interval);

        let this = Arc::clone(self);
        let sweep = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(check_interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; the
            // sweep should wait one full period after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = this.background_tick().await {
                    warn!("Background sweep errored: {}", e);
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(decay);
        tasks.push(sweep);
    }

    /// Tears down every timer and any open streaming channel. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        if let Some(handle) = self.stream_task.lock().await.take() {
            handle.abort();
        }
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        *self.phase.write().await = Phase::Idle;
        info!("Coordinator stopped, timers and channels released");
    }

    async fn sync_rate_limits(&self) {
        match self.service.rate_limit_status().await {
            Ok(state) => self.monitor.write().await.sync(state),
            Err(e) => warn!("Rate limit sync failed: {}", e),
        }
    }
}
