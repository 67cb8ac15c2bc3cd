// tests/coordinator_flow.rs
//! End-to-end scheduler behavior against a scripted in-memory trade data
//! service: streamed initial loads, per-index failure scoping, the busy
//! gate, and the rate-limit gating of the background sweep.

use async_trait::async_trait;
use exchange_desk::config::Config;
use exchange_desk::coordinator::{Phase, RefreshCoordinator};
use exchange_desk::error::{DeskError, Result};
use exchange_desk::service::TradeDataService;
use exchange_desk::store::ResultStore;
use exchange_desk::types::{
    Listing, PairStatus, PairSummary, RateLimitBucket, RateLimitState, StalePair, StalenessReport,
    TradePair,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn pairs(n: usize) -> Vec<TradePair> {
    (0..n)
        .map(|i| TradePair::new(format!("want{}", i), format!("pay{}", i)))
        .collect()
}

fn ok_summary(index: usize, pair: TradePair) -> PairSummary {
    PairSummary::with_listings(index, pair, vec![Listing::at_rate(1.0 + index as f64)])
}

#[derive(Default)]
struct MockService {
    pairs: Vec<TradePair>,
    stream_opens: AtomicUsize,
    refresh_calls: AtomicUsize,
    staleness_calls: AtomicUsize,
    /// One-shot scripted failures per index.
    refresh_errors: Mutex<HashMap<usize, DeskError>>,
    stale_indices: Mutex<Vec<usize>>,
    /// When set, the next stream consumes this script instead of emitting
    /// every pair in reverse order.
    stream_script: Mutex<Option<Vec<Result<PairSummary>>>>,
    refresh_delay_ms: u64,
    check_interval_seconds: u64,
    rate_state: Mutex<RateLimitState>,
}

impl MockService {
    fn new(pairs: Vec<TradePair>) -> Self {
        Self {
            pairs,
            check_interval_seconds: 30,
            ..Default::default()
        }
    }

    fn script_stream(&self, messages: Vec<Result<PairSummary>>) {
        *self.stream_script.lock().unwrap() = Some(messages);
    }

    fn fail_next_refresh(&self, index: usize, error: DeskError) {
        self.refresh_errors.lock().unwrap().insert(index, error);
    }

    fn set_stale(&self, indices: Vec<usize>) {
        *self.stale_indices.lock().unwrap() = indices;
    }

    fn set_rate_state(&self, state: RateLimitState) {
        *self.rate_state.lock().unwrap() = state;
    }
}

#[async_trait]
impl TradeDataService for MockService {
    async fn stream_pairs(
        &self,
        _desired_count: usize,
        _force_fresh: bool,
    ) -> Result<mpsc::Receiver<Result<PairSummary>>> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        let script = self.stream_script.lock().unwrap().take().unwrap_or_else(|| {
            // Default: every pair arrives, in reverse index order.
            self.pairs
                .iter()
                .enumerate()
                .rev()
                .map(|(i, p)| Ok(ok_summary(i, p.clone())))
                .collect()
        });
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for message in script {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn refresh_pair(
        &self,
        index: usize,
        _desired_count: usize,
        _proposed_price: Option<&str>,
    ) -> Result<PairSummary> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.refresh_delay_ms)).await;
        }
        let scripted = self.refresh_errors.lock().unwrap().remove(&index);
        if let Some(error) = scripted {
            return Err(error);
        }
        let pair = self
            .pairs
            .get(index)
            .cloned()
            .unwrap_or_else(|| TradePair::new("added", "pay"));
        Ok(ok_summary(index, pair))
    }

    async fn latest_cached(&self, _desired_count: usize) -> Result<Vec<PairSummary>> {
        Ok(self
            .pairs
            .iter()
            .enumerate()
            .map(|(i, p)| ok_summary(i, p.clone()))
            .collect())
    }

    async fn staleness(&self) -> Result<StalenessReport> {
        self.staleness_calls.fetch_add(1, Ordering::SeqCst);
        let stale = self.stale_indices.lock().unwrap().clone();
        Ok(StalenessReport {
            check_interval_seconds: self.check_interval_seconds,
            pairs: stale
                .into_iter()
                .map(|index| StalePair {
                    index,
                    expired: true,
                    seconds_remaining: 0.0,
                })
                .collect(),
        })
    }

    async fn rate_limit_status(&self) -> Result<RateLimitState> {
        Ok(self.rate_state.lock().unwrap().clone())
    }
}

fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    config.inter_request_delay_ms = 1;
    Arc::new(config)
}

async fn desk(n: usize) -> (Arc<MockService>, Arc<RefreshCoordinator>) {
    let service = Arc::new(MockService::new(pairs(n)));
    let store = Arc::new(ResultStore::new());
    let coordinator = Arc::new(RefreshCoordinator::new(
        service.clone() as Arc<dyn TradeDataService>,
        store,
        test_config(),
    ));
    coordinator.init_pairs(pairs(n)).await;
    (service, coordinator)
}

#[tokio::test]
async fn initial_load_settles_every_index_despite_arrival_order() {
    let (_, coordinator) = desk(4).await;
    coordinator.start(false).await.unwrap();
    coordinator.join_stream().await;

    let board = coordinator.store().snapshot().await;
    assert_eq!(board.len(), 4);
    for (i, summary) in board.iter().enumerate() {
        assert_eq!(summary.index, i);
        assert_eq!(summary.status, PairStatus::Ok);
    }
    assert_eq!(coordinator.phase().await, Phase::Idle);
}

#[tokio::test]
async fn stream_failure_keeps_partial_results_and_forces_idle() {
    let (service, coordinator) = desk(3).await;
    service.script_stream(vec![
        Ok(ok_summary(2, TradePair::new("want2", "pay2"))),
        Err(DeskError::Stream("connection reset".to_string())),
    ]);
    coordinator.start(false).await.unwrap();
    coordinator.join_stream().await;

    let board = coordinator.store().snapshot().await;
    assert_eq!(board[2].status, PairStatus::Ok);
    assert_eq!(board[0].status, PairStatus::Loading);
    assert_eq!(board[1].status, PairStatus::Loading);
    assert_eq!(coordinator.phase().await, Phase::Idle);
}

#[tokio::test]
async fn restarting_cancels_the_previous_stream() {
    let (service, coordinator) = desk(2).await;
    coordinator.start(false).await.unwrap();
    coordinator.start(true).await.unwrap();
    coordinator.join_stream().await;

    assert_eq!(service.stream_opens.load(Ordering::SeqCst), 2);
    let board = coordinator.store().snapshot().await;
    assert!(board.iter().all(|s| s.status == PairStatus::Ok));
}

#[tokio::test]
async fn busy_index_rejects_second_reload_without_network_call() {
    let service = Arc::new(MockService {
        pairs: pairs(2),
        refresh_delay_ms: 50,
        ..Default::default()
    });
    let coordinator = Arc::new(RefreshCoordinator::new(
        service.clone() as Arc<dyn TradeDataService>,
        Arc::new(ResultStore::new()),
        test_config(),
    ));
    coordinator.init_pairs(pairs(2)).await;

    let slow = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.manual_reload(0, None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Same index: rejected, not queued. Different index: admitted.
    assert_eq!(coordinator.manual_reload(0, None).await.unwrap(), false);
    assert_eq!(coordinator.manual_reload(1, None).await.unwrap(), true);

    assert_eq!(slow.await.unwrap().unwrap(), true);
    assert_eq!(service.refresh_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        coordinator.store().get(0).await.unwrap().status,
        PairStatus::Ok
    );
}

#[tokio::test]
async fn failed_reload_scopes_error_to_its_own_index() {
    let (service, coordinator) = desk(3).await;
    coordinator.refresh_all().await.unwrap();

    service.fail_next_refresh(1, DeskError::Network("timeout".to_string()));
    coordinator.manual_reload(1, None).await.unwrap();

    let board = coordinator.store().snapshot().await;
    assert_eq!(board[0].status, PairStatus::Ok);
    assert_eq!(board[1].status, PairStatus::Error);
    assert_eq!(board[2].status, PairStatus::Ok);
}

#[tokio::test]
async fn rate_limited_reload_withholds_listings() {
    let (service, coordinator) = desk(1).await;
    coordinator.refresh_all().await.unwrap();
    service.fail_next_refresh(
        0,
        DeskError::RateLimited {
            retry_after_secs: 42.0,
        },
    );
    coordinator.manual_reload(0, None).await.unwrap();

    let slot = coordinator.store().get(0).await.unwrap();
    assert_eq!(slot.status, PairStatus::RateLimited);
    assert!(slot.listings.is_empty());
    assert_eq!(slot.rate_limit_remaining, Some(42.0));
}

#[tokio::test]
async fn background_tick_makes_zero_calls_while_blocked() {
    let (service, coordinator) = desk(2).await;
    service.set_stale(vec![0, 1]);
    coordinator.monitor().write().await.sync(RateLimitState {
        blocked: true,
        block_remaining_seconds: 30.0,
        rules: BTreeMap::new(),
    });

    assert_eq!(coordinator.background_tick().await.unwrap(), 0);
    assert_eq!(service.staleness_calls.load(Ordering::SeqCst), 0);
    assert_eq!(service.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn background_tick_makes_zero_calls_near_limit() {
    let (service, coordinator) = desk(2).await;
    service.set_stale(vec![0]);
    let mut rules = BTreeMap::new();
    rules.insert("account".to_string(), vec![RateLimitBucket::new(4, 5, 60.0)]);
    coordinator.monitor().write().await.sync(RateLimitState {
        blocked: false,
        block_remaining_seconds: 0.0,
        rules,
    });

    assert_eq!(coordinator.background_tick().await.unwrap(), 0);
    assert_eq!(service.staleness_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn background_tick_refreshes_at_most_the_first_two_stale_pairs() {
    let (service, coordinator) = desk(4).await;
    service.set_stale(vec![3, 1, 0, 2]);

    assert_eq!(coordinator.background_tick().await.unwrap(), 2);
    assert_eq!(service.refresh_calls.load(Ordering::SeqCst), 2);
    let board = coordinator.store().snapshot().await;
    // Deterministic truncation: only the first two of the reported subset.
    assert_eq!(board[3].status, PairStatus::Ok);
    assert_eq!(board[1].status, PairStatus::Ok);
    assert_eq!(board[0].status, PairStatus::Loading);
    assert_eq!(board[2].status, PairStatus::Loading);
}

#[tokio::test]
async fn background_tick_skips_invalid_pairs() {
    let (service, coordinator) = desk(2).await;
    coordinator.refresh_all().await.unwrap();

    service.fail_next_refresh(0, DeskError::InvalidPair("no such currency".to_string()));
    coordinator.manual_reload(0, None).await.unwrap();
    assert_eq!(
        coordinator.store().get(0).await.unwrap().status,
        PairStatus::Invalid
    );

    let before = service.refresh_calls.load(Ordering::SeqCst);
    service.set_stale(vec![0, 1]);
    assert_eq!(coordinator.background_tick().await.unwrap(), 1);
    assert_eq!(service.refresh_calls.load(Ordering::SeqCst), before + 1);
}

#[tokio::test]
async fn add_pair_appends_and_refreshes() {
    let (_, coordinator) = desk(2).await;
    let index = coordinator
        .add_pair(TradePair::new("added", "pay"))
        .await
        .unwrap();
    assert_eq!(index, 2);
    let slot = coordinator.store().get(2).await.unwrap();
    assert_eq!(slot.status, PairStatus::Ok);
    assert_eq!(coordinator.store().len().await, 3);
}

#[tokio::test]
async fn failed_add_leaves_a_visible_error_slot() {
    let (service, coordinator) = desk(1).await;
    service.fail_next_refresh(1, DeskError::Network("down".to_string()));
    let index = coordinator
        .add_pair(TradePair::new("added", "pay"))
        .await
        .unwrap();
    assert_eq!(index, 1);
    let slot = coordinator.store().get(1).await.unwrap();
    assert_eq!(slot.status, PairStatus::Error);
    assert_eq!(coordinator.store().len().await, 2);
}

#[tokio::test]
async fn removal_during_inflight_reload_follows_the_slot() {
    let service = Arc::new(MockService {
        pairs: pairs(5),
        refresh_delay_ms: 50,
        ..Default::default()
    });
    let coordinator = Arc::new(RefreshCoordinator::new(
        service.clone() as Arc<dyn TradeDataService>,
        Arc::new(ResultStore::new()),
        test_config(),
    ));
    coordinator.init_pairs(pairs(5)).await;

    let slow = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.manual_reload(3, None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    coordinator.remove_pair(1).await.unwrap();
    assert!(slow.await.unwrap().unwrap());

    // want3's refresh result lands on its shifted slot, not the old index.
    let board = coordinator.store().snapshot().await;
    assert_eq!(board.len(), 4);
    let wants: Vec<&str> = board.iter().map(|s| s.pair.want.as_str()).collect();
    assert_eq!(wants, vec!["want0", "want2", "want3", "want4"]);
    assert_eq!(board[2].status, PairStatus::Ok);
    assert_eq!(board[3].status, PairStatus::Loading);
    for i in 0..board.len() {
        assert!(!coordinator.store().is_busy(i));
    }
    // The shifted index is reusable once the reload completed.
    assert!(coordinator.manual_reload(2, None).await.unwrap());
}

#[tokio::test]
async fn removing_the_refreshing_slot_discards_its_result() {
    let service = Arc::new(MockService {
        pairs: pairs(3),
        refresh_delay_ms: 50,
        ..Default::default()
    });
    let coordinator = Arc::new(RefreshCoordinator::new(
        service.clone() as Arc<dyn TradeDataService>,
        Arc::new(ResultStore::new()),
        test_config(),
    ));
    coordinator.init_pairs(pairs(3)).await;

    let slow = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.manual_reload(1, None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    coordinator.remove_pair(1).await.unwrap();
    assert!(slow.await.unwrap().unwrap());

    // want1 is gone; its in-flight result must not resurface on want2.
    let board = coordinator.store().snapshot().await;
    assert_eq!(board.len(), 2);
    assert_eq!(board[1].pair.want, "want2");
    assert_eq!(board[1].status, PairStatus::Loading);
    assert!(!coordinator.store().is_busy(0));
    assert!(!coordinator.store().is_busy(1));
    assert!(coordinator.manual_reload(1, None).await.unwrap());
    assert_eq!(
        coordinator.store().get(1).await.unwrap().status,
        PairStatus::Ok
    );
}

#[tokio::test]
async fn remove_pair_shifts_later_indices_down() {
    let (_, coordinator) = desk(4).await;
    coordinator.refresh_all().await.unwrap();
    coordinator.remove_pair(1).await.unwrap();

    let board = coordinator.store().snapshot().await;
    assert_eq!(board.len(), 3);
    let wants: Vec<&str> = board.iter().map(|s| s.pair.want.as_str()).collect();
    assert_eq!(wants, vec!["want0", "want2", "want3"]);
    for (i, summary) in board.iter().enumerate() {
        assert_eq!(summary.index, i);
    }
}

#[tokio::test]
async fn manual_reload_syncs_rate_limit_state() {
    let (service, coordinator) = desk(1).await;
    let mut rules = BTreeMap::new();
    rules.insert(
        "ip".to_string(),
        vec![RateLimitBucket::new(7, 15, 60.0)],
    );
    service.set_rate_state(RateLimitState {
        blocked: false,
        block_remaining_seconds: 0.0,
        rules,
    });

    coordinator.manual_reload(0, None).await.unwrap();
    let monitor = coordinator.monitor();
    let monitor = monitor.read().await;
    assert_eq!(monitor.snapshot().rules["ip"][0].current, 7);
}

#[tokio::test]
async fn stop_aborts_the_background_timers() {
    let service = Arc::new(MockService {
        pairs: pairs(1),
        check_interval_seconds: 1,
        ..Default::default()
    });
    service.set_stale(vec![0]);
    let coordinator = Arc::new(RefreshCoordinator::new(
        service.clone() as Arc<dyn TradeDataService>,
        Arc::new(ResultStore::new()),
        test_config(),
    ));
    coordinator.init_pairs(pairs(1)).await;

    coordinator.start_background().await;
    // The only staleness call so far is the interval probe at startup.
    assert_eq!(service.staleness_calls.load(Ordering::SeqCst), 1);
    coordinator.stop().await;

    // With the 1s sweep timer still alive, at least two sweeps would have
    // fired by now.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(service.staleness_calls.load(Ordering::SeqCst), 1);
    assert_eq!(service.refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.phase().await, Phase::Idle);
}

#[tokio::test]
async fn suggest_undercut_spots_the_own_listing_by_account_name() {
    let service = Arc::new(MockService::new(pairs(1)));
    let mut config = Config::default();
    config.account_name = Some("MyShop".to_string());
    let coordinator = Arc::new(RefreshCoordinator::new(
        service as Arc<dyn TradeDataService>,
        Arc::new(ResultStore::new()),
        Arc::new(config),
    ));
    coordinator.init_pairs(pairs(1)).await;

    let listings = vec![
        Listing {
            rate: 1.0 / 8.0,
            account: Some("MyShop#1234".to_string()),
            stock: None,
            observed_at: None,
        },
        Listing::at_rate(1.0 / 7.0),
    ];
    let summary = PairSummary::with_listings(0, TradePair::new("want0", "pay0"), listings);
    coordinator.store().replace(0, summary).await.unwrap();

    // Our quote already beats the next competitor; nothing better exists.
    let suggestion = coordinator.suggest_undercut(0).await.unwrap();
    assert!(suggestion.already_optimal);

    assert!(matches!(
        coordinator.suggest_undercut(9).await,
        Err(DeskError::IndexOutOfRange(9))
    ));
}

#[tokio::test]
async fn prime_from_cache_establishes_the_board() {
    let service = Arc::new(MockService::new(pairs(3)));
    let coordinator = Arc::new(RefreshCoordinator::new(
        service.clone() as Arc<dyn TradeDataService>,
        Arc::new(ResultStore::new()),
        test_config(),
    ));
    assert_eq!(coordinator.prime_from_cache().await.unwrap(), 3);
    let board = coordinator.store().snapshot().await;
    assert_eq!(board.len(), 3);
    assert!(board.iter().all(|s| s.status == PairStatus::Ok));
}
