//! End-to-end scenario tests driving the real component chain (collector
//! -> registry -> spread engine -> analyzer -> qualifier -> convergence
//! tracker) against mock venues, wired the same way `Observatory` wires
//! them internally. `pipeline_tick`/`fetch_books` are private to the
//! composition root, so these tests reconstruct the same call sequence
//! from the public component API rather than reaching into `app.rs`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use arb_observatory::analyzer::OrderBookAnalyzer;
use arb_observatory::convergence::analyzer::ConvergenceThresholds;
use arb_observatory::convergence::ConvergenceTracker;
use arb_observatory::kv::{InMemoryKv, KvStore};
use arb_observatory::models::{Category, Quote, TrackingOutcome, VenueKind};
use arb_observatory::notifier::NullNotifier;
use arb_observatory::pair_stats::PairStatisticsService;
use arb_observatory::qualifier::{QualifyOutcome, SignalQualifier};
use arb_observatory::registry::TickerRegistry;
use arb_observatory::spread::SpreadEngine;
use arb_observatory::storage::{DurableStore, SqliteStore};
use arb_observatory::venue::mock::MockAdapter;
use arb_observatory::venue::{OrderBook, OrderBookLevel, VenueAdapter};

fn quote(bid: f64, ask: f64) -> Quote {
    Quote {
        bid,
        ask,
        bid_size: 5.0,
        ask_size: 5.0,
        ts: Utc::now(),
    }
}

fn deep_book(bid: f64, ask: f64) -> OrderBook {
    OrderBook {
        bids: vec![OrderBookLevel { price: bid, size: 1000.0 }],
        asks: vec![OrderBookLevel { price: ask, size: 1000.0 }],
    }
}

fn venue(id: &str) -> arb_observatory::models::Venue {
    arb_observatory::models::Venue {
        id: id.to_string(),
        kind: VenueKind::CexSpot,
        display_name: id.to_string(),
        taker_fee_bps: 5,
        chain: None,
        token_address: None,
    }
}

async fn seed_two_venue_registry(
    kv: Arc<dyn KvStore>,
    a_bid: f64,
    a_ask: f64,
    b_bid: f64,
    b_ask: f64,
) -> (Arc<TickerRegistry>, Arc<MockAdapter>, Arc<MockAdapter>) {
    let a = MockAdapter::new("binance");
    a.set_quote("btcusdt", quote(a_bid, a_ask));
    let b = MockAdapter::new("okx");
    b.set_quote("btcusdt", quote(b_bid, b_ask));

    let registry = Arc::new(TickerRegistry::new(kv));
    let adapters: Vec<Arc<dyn VenueAdapter>> = vec![a.clone(), b.clone()];
    registry.rebuild(&adapters).await.unwrap();
    (registry, a, b)
}

async fn cache_quote(kv: &dyn KvStore, venue_id: &str, symbol: &str, q: Quote) {
    kv.set_ex(
        &format!("prices:latest:{venue_id}:{symbol}"),
        &serde_json::to_string(&q).unwrap(),
        Duration::from_secs(30),
    )
    .await
    .unwrap();
}

/// A. A wide, deep, profitable spread fires a signal, and once the two
/// venues' mid prices converge the tracking closes as `Converged`.
#[tokio::test]
async fn scenario_a_spread_fires_then_converges() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let notifier = Arc::new(NullNotifier);

    let (registry, _a, _b) = seed_two_venue_registry(kv.clone(), 100.0, 100.1, 104.0, 104.1).await;
    cache_quote(&*kv, "binance", "btcusdt", quote(100.0, 100.1)).await;
    cache_quote(&*kv, "okx", "btcusdt", quote(104.0, 104.1)).await;

    let pair = registry.arbitrage_pairs().into_iter().next().unwrap();
    let spread_engine = SpreadEngine::new(kv.clone());
    let symbol_a = registry.native_symbol(&pair.venue_a, &pair.base_symbol).unwrap();
    let symbol_b = registry.native_symbol(&pair.venue_b, &pair.base_symbol).unwrap();
    let spread = spread_engine
        .compute(&pair, &symbol_a, &symbol_b)
        .await
        .unwrap()
        .unwrap();
    assert!(spread.spread_pct > 3.0);

    let analyzer = OrderBookAnalyzer::new(1.0, 10.0);
    let low_book = deep_book(100.0, 100.1);
    let high_book = deep_book(104.0, 104.1);
    let candidate = analyzer
        .analyze(&spread, &venue(&spread.low_venue), &venue(&spread.high_venue), &low_book, &high_book)
        .unwrap();
    assert!(!candidate.fallback_signal);

    let qualifier = SignalQualifier::new(kv.clone(), store.clone(), 0.3, Duration::from_secs(300), 4.0, 30);
    let outcome = qualifier.qualify(&candidate, Category::Layer1).await.unwrap();
    let mut signal = match outcome {
        QualifyOutcome::Accepted(s) => s,
        QualifyOutcome::Rejected { reason } => panic!("expected acceptance, got {reason}"),
    };
    signal.id = Some(store.insert_signal(&signal).await.unwrap());

    let pair_stats = Arc::new(PairStatisticsService::new(store.clone()));
    let tracker = Arc::new(ConvergenceTracker::new(
        kv.clone(),
        store.clone(),
        notifier,
        registry,
        pair_stats,
        ConvergenceThresholds {
            converge_at_pct: 0.1,
            diverge_multiplier: 1.5,
            expire_after_secs: 3600.0,
        },
    ));
    tracker.begin(&signal).await.unwrap();

    // Prices converge: both venues now quote the same mid, with the high
    // side doing essentially all the moving.
    cache_quote(&*kv, "binance", "btcusdt", quote(100.0, 100.1)).await;
    cache_quote(&*kv, "okx", "btcusdt", quote(100.0, 100.1)).await;

    let tracking = store.get_tracking(signal.id.unwrap()).await.unwrap().unwrap();
    tracker.poll_one(tracking).await.unwrap();

    let closed = store.get_tracking(signal.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(closed.outcome, TrackingOutcome::Converged);

    let analysis = store
        .convergence_analysis_for(signal.id.unwrap())
        .await
        .unwrap()
        .expect("a closed tracking should leave a convergence analysis behind");
    assert_eq!(analysis.convergence_reason, arb_observatory::models::ConvergenceReason::SellDown);
}

/// B. A quote older than the stale budget never reaches the spread
/// engine's cache, so no spread is computed for that tick.
#[tokio::test]
async fn scenario_b_stale_quote_is_dropped_before_it_reaches_the_spread_engine() {
    use arb_observatory::collector::{cached_quote, PriceCollector};

    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let adapter = MockAdapter::new("binance");
    let mut stale = quote(100.0, 100.1);
    stale.ts = Utc::now() - chrono::Duration::seconds(120);
    adapter.set_quote("btcusdt", stale);

    let collector = Arc::new(PriceCollector::new(
        vec![adapter],
        kv.clone(),
        Duration::from_secs(10),
    ));
    collector.tick_once().await;

    let cached = cached_quote(&*kv, "binance", "btcusdt").await.unwrap();
    assert!(cached.is_none(), "a stale quote must never populate the price cache");
}

/// C. Token-mismatch guard: a caller who knows two venues' "BTC" listing
/// isn't the same underlying token can refuse the pairing even though the
/// registry normalized both symbols to the same base.
#[test]
fn scenario_c_token_mismatch_guard_rejects_unconfirmed_equivalence() {
    use arb_observatory::errors::ObservatoryError;
    use arb_observatory::spread::assert_token_match;

    let err = assert_token_match("BTC", "some-bridge", "okx", false).unwrap_err();
    assert!(matches!(err, ObservatoryError::TokenMismatch { .. }));
    assert!(assert_token_match("BTC", "binance", "okx", true).is_ok());
}

/// D. Once a signal qualifies for a pair, the cooldown blocks a second
/// signal for the same pair until it expires.
#[tokio::test]
async fn scenario_d_cooldown_blocks_repeat_signals_for_the_same_pair() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let qualifier = SignalQualifier::new(kv, store, 0.2, Duration::from_secs(300), 4.0, 30);

    let candidate = arb_observatory::analyzer::ExecutableSpread {
        base_symbol: "BTC".into(),
        low_venue: "binance".into(),
        high_venue: "okx".into(),
        buy_price: 100.0,
        sell_price: 100.5,
        nominal_spread_pct: 0.5,
        executable_spread_pct: 0.5,
        loss_pct: 0.0,
        max_entry_usd: 10_000.0,
        exit_liquidity_usd: 50_000.0,
        suggested_position_usd: 10_000.0,
        fully_fillable: true,
        fallback_signal: false,
        detected_at: Utc::now(),
    };

    let first = qualifier.qualify(&candidate, Category::Layer1).await.unwrap();
    assert!(matches!(first, QualifyOutcome::Accepted(_)));

    // A distinct detection timestamp so the second call isn't caught by the
    // already-processed guard instead of the cooldown this scenario tests.
    let mut second_candidate = candidate.clone();
    second_candidate.detected_at = Utc::now() + chrono::Duration::milliseconds(1);

    let second = qualifier.qualify(&second_candidate, Category::Layer1).await.unwrap();
    match second {
        QualifyOutcome::Rejected { reason } => assert!(reason.contains("cooldown")),
        QualifyOutcome::Accepted(_) => panic!("cooldown should have blocked the second signal"),
    }
}

/// E. Neither venue's order book can be fetched, but the quote spread is
/// still real: `OrderBookAnalyzer::fallback` produces a conservative,
/// size-capped candidate, and it still qualifies through the same gate.
#[tokio::test]
async fn scenario_e_orderbook_unavailable_yields_a_fallback_signal() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());

    // A modest spread: wide enough to clear the qualifier's spread floor
    // but well under the 10x-of-floor ceiling a fallback (unconfirmed-book)
    // candidate is held to.
    let (registry, _a, _b) = seed_two_venue_registry(kv.clone(), 100.0, 100.1, 101.0, 101.1).await;
    cache_quote(&*kv, "binance", "btcusdt", quote(100.0, 100.1)).await;
    cache_quote(&*kv, "okx", "btcusdt", quote(101.0, 101.1)).await;

    let pair = registry.arbitrage_pairs().into_iter().next().unwrap();
    let symbol_a = registry.native_symbol(&pair.venue_a, &pair.base_symbol).unwrap();
    let symbol_b = registry.native_symbol(&pair.venue_b, &pair.base_symbol).unwrap();
    let spread_engine = SpreadEngine::new(kv.clone());
    let spread = spread_engine
        .compute(&pair, &symbol_a, &symbol_b)
        .await
        .unwrap()
        .unwrap();

    // Neither adapter has an order book set — both `order_book` calls
    // return `None`, exactly as if both venues had timed out.
    let analyzer = OrderBookAnalyzer::new(1.0, 20_000.0);
    let candidate = analyzer.fallback(&spread);
    assert!(candidate.fallback_signal);
    assert!(!candidate.fully_fillable);
    assert!(candidate.max_entry_usd <= (20_000.0_f64 * 0.1).min(5_000.0) + 1e-9);

    let qualifier = SignalQualifier::new(kv, store, 0.3, Duration::from_secs(300), 4.0, 30);
    let outcome = qualifier.qualify(&candidate, Category::Layer1).await.unwrap();
    let signal = match outcome {
        QualifyOutcome::Accepted(s) => s,
        QualifyOutcome::Rejected { reason } => panic!("expected fallback signal to qualify, got {reason}"),
    };
    assert!(signal.fallback_signal);
    assert!(!signal.fully_fillable);
    assert!(signal.max_entry_usd <= 5_000.0 + 1e-9);
}

/// F. A tracking whose spread blows out past the divergence multiplier
/// closes as `Diverged` in the same poll that detects it.
#[tokio::test]
async fn scenario_f_diverging_tracking_closes_immediately() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let notifier = Arc::new(NullNotifier);

    let (registry, _a, _b) = seed_two_venue_registry(kv.clone(), 100.0, 100.1, 101.0, 101.1).await;

    let mut signal = arb_observatory::models::Signal::new(
        "BTC".into(),
        Category::Layer1,
        "binance".into(),
        "okx".into(),
        1.0,
        1.0,
        10_000.0,
    );
    signal.id = Some(store.insert_signal(&signal).await.unwrap());

    let pair_stats = Arc::new(PairStatisticsService::new(store.clone()));
    let tracker = Arc::new(ConvergenceTracker::new(
        kv.clone(),
        store.clone(),
        notifier,
        registry,
        pair_stats,
        ConvergenceThresholds {
            converge_at_pct: 0.1,
            diverge_multiplier: 1.5,
            expire_after_secs: 3600.0,
        },
    ));
    tracker.begin(&signal).await.unwrap();

    // Spread blows out well past 1.5x the initial 1.0%.
    cache_quote(&*kv, "binance", "btcusdt", quote(100.0, 100.1)).await;
    cache_quote(&*kv, "okx", "btcusdt", quote(104.0, 104.1)).await;

    let tracking = store.get_tracking(signal.id.unwrap()).await.unwrap().unwrap();
    tracker.poll_one(tracking).await.unwrap();

    let closed = store.get_tracking(signal.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(closed.outcome, TrackingOutcome::Diverged);
    assert!(closed.closed_at.is_some());
}
