// src/store/mod.rs
//! Indexed store of per-pair summaries plus the per-index busy gate.
//!
//! Slots are always contiguous `0..N-1` and mirror the configured pair order
//! exactly. The busy gate is the single enforcement point for "at most one
//! in-flight refresh per index": a refresh claims its slot before dispatching
//! and writes back through the claim, so the result lands on the right pair
//! even when a removal shifts slot indices while the request is in flight.

use crate::error::{DeskError, Result};
use crate::types::{PairStatus, PairSummary, TradePair};
use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Exclusive handle on one slot's in-flight refresh. The handle stays valid
/// across removals that shift its slot to a lower index; a handle whose slot
/// was itself removed turns into a no-op writer.
#[derive(Debug)]
pub struct RefreshClaim {
    id: u64,
}

#[derive(Debug, Default)]
pub struct ResultStore {
    slots: RwLock<Vec<PairSummary>>,
    /// index -> claim id for in-flight refreshes.
    busy: DashMap<usize, u64>,
    /// claim id -> current slot index, `None` once the slot was removed.
    claims: DashMap<u64, Option<usize>>,
    next_claim: AtomicU64,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub async fn get(&self, index: usize) -> Option<PairSummary> {
        self.slots.read().await.get(index).cloned()
    }

    pub async fn snapshot(&self) -> Vec<PairSummary> {
        self.slots.read().await.clone()
    }

    /// Drops all slots, orphans any outstanding claims, and seeds fresh
    /// loading placeholders in the given pair order.
    pub async fn init_pairs(&self, pairs: Vec<TradePair>) {
        let mut slots = self.slots.write().await;
        self.busy.clear();
        for mut entry in self.claims.iter_mut() {
            *entry.value_mut() = None;
        }
        *slots = pairs
            .into_iter()
            .enumerate()
            .map(|(index, pair)| PairSummary::loading(index, pair))
            .collect();
    }

    /// Overwrites one slot wholesale. The stored summary's index is forced to
    /// the slot position so stream messages can never desynchronize identity.
    pub async fn replace(&self, index: usize, mut summary: PairSummary) -> Result<()> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(index)
            .ok_or(DeskError::IndexOutOfRange(index))?;
        summary.index = index;
        *slot = summary;
        Ok(())
    }

    /// Appends a slot at the end, returning its index.
    pub async fn append(&self, mut summary: PairSummary) -> usize {
        let mut slots = self.slots.write().await;
        let index = slots.len();
        summary.index = index;
        slots.push(summary);
        index
    }

    /// Removes one slot and shifts every later slot down by one, preserving
    /// relative order. Live claims follow their shifted slots; the removed
    /// slot's own claim, if any, is orphaned so its in-flight result is
    /// discarded rather than written over whichever pair now holds the index.
    pub async fn remove_at(&self, index: usize) -> Result<PairSummary> {
        let mut slots = self.slots.write().await;
        if index >= slots.len() {
            return Err(DeskError::IndexOutOfRange(index));
        }
        let removed = slots.remove(index);
        for (position, slot) in slots.iter_mut().enumerate().skip(index) {
            slot.index = position;
        }
        if let Some((_, id)) = self.busy.remove(&index) {
            self.claims.insert(id, None);
        }
        let mut shifted: Vec<(usize, u64)> = self
            .busy
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .filter(|&(key, _)| key > index)
            .collect();
        shifted.sort_unstable();
        for (key, id) in shifted {
            self.busy.remove(&key);
            self.busy.insert(key - 1, id);
            self.claims.insert(id, Some(key - 1));
        }
        Ok(removed)
    }

    /// Resets every slot to a loading placeholder, keeping its pair.
    pub async fn set_all_loading(&self) {
        let mut slots = self.slots.write().await;
        for (index, slot) in slots.iter_mut().enumerate() {
            *slot = PairSummary::loading(index, slot.pair.clone());
        }
    }

    /// Claims the busy flag for an index. Returns `None` when the index is
    /// out of range or a refresh for it is already in flight; callers must
    /// treat that as a no-op, never queue behind it.
    pub async fn try_begin(&self, index: usize) -> Option<RefreshClaim> {
        use dashmap::mapref::entry::Entry;
        let slots = self.slots.read().await;
        if index >= slots.len() {
            return None;
        }
        match self.busy.entry(index) {
            Entry::Occupied(_) => {
                debug!("Refresh already in flight for index {}", index);
                None
            }
            Entry::Vacant(vacant) => {
                let id = self.next_claim.fetch_add(1, Ordering::Relaxed);
                vacant.insert(id);
                self.claims.insert(id, Some(index));
                Some(RefreshClaim { id })
            }
        }
    }

    /// Current index of the claimed slot, `None` once the slot was removed.
    pub fn claim_index(&self, claim: &RefreshClaim) -> Option<usize> {
        self.claims.get(&claim.id).and_then(|entry| *entry)
    }

    /// Resets the claimed slot to a loading placeholder, keeping its pair.
    /// Returns false when the slot no longer exists.
    pub async fn mark_loading(&self, claim: &RefreshClaim) -> bool {
        let mut slots = self.slots.write().await;
        let Some(index) = self.claim_index(claim) else {
            return false;
        };
        match slots.get_mut(index) {
            Some(slot) => {
                *slot = PairSummary::loading(index, slot.pair.clone());
                true
            }
            None => false,
        }
    }

    /// Writes a finished summary through the claim, landing wherever the
    /// slot currently lives. Results for removed slots are discarded.
    pub async fn complete(&self, claim: &RefreshClaim, mut summary: PairSummary) {
        let mut slots = self.slots.write().await;
        let Some(index) = self.claim_index(claim) else {
            debug!("Discarding refresh result for a removed slot");
            return;
        };
        if let Some(slot) = slots.get_mut(index) {
            summary.index = index;
            *slot = summary;
        }
    }

    /// Applies a failure status through the claim. Rate-limited slots have
    /// their listings withheld until the next successful refresh.
    pub async fn mark_failed(&self, claim: &RefreshClaim, error: &DeskError) {
        let mut slots = self.slots.write().await;
        let Some(index) = self.claim_index(claim) else {
            return;
        };
        let Some(slot) = slots.get_mut(index) else {
            return;
        };
        slot.status = error.pair_status();
        if slot.status == PairStatus::RateLimited {
            slot.listings.clear();
            slot.best_rate = None;
            slot.median_rate = None;
            slot.count_returned = 0;
            slot.rate_limit_remaining = Some(error.retry_after());
        }
    }

    /// True once every slot has left the loading state.
    pub async fn all_settled(&self) -> bool {
        self.slots.read().await.iter().all(PairSummary::is_settled)
    }

    /// Releases the claim and the busy flag wherever it moved, success or
    /// failure alike.
    pub fn finish(&self, claim: RefreshClaim) {
        if let Some((_, index)) = self.claims.remove(&claim.id) {
            if let Some(index) = index {
                self.busy.remove(&index);
            }
        }
    }

    pub fn is_busy(&self, index: usize) -> bool {
        self.busy.contains_key(&index)
    }
}
