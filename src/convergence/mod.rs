//! ConvergenceTracker (C8): follows every open `Tracking` until it
//! converges, diverges, or expires, reading spreads back through the same
//! venue adapters C1 exposes to the rest of the pipeline.
//!
//! Scheduling is adaptive per-tracking rather than a single fixed cadence:
//! a tracking's age selects its poll interval from a five-tier table (see
//! `analyzer::poll_interval_secs`), so a signal that's been open for days
//! doesn't get re-checked as often as one that opened a minute ago.

pub mod analyzer;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::collector::cached_quote;
use crate::convergence::analyzer::{classify, classify_convergence_reason, poll_interval_secs, ConvergenceThresholds};
use crate::kv::KvStore;
use crate::models::{ConvergenceAnalysis, Signal, Snapshot, Tracking, TrackingOutcome};
use crate::notifier::Notifier;
use crate::pair_stats::PairStatisticsService;
use crate::registry::{ArbitragePair, TickerRegistry};
use crate::storage::DurableStore;

/// Base cadence of the scheduling loop itself — the finest tier in the
/// poll-interval table. Each tick re-evaluates every open tracking and
/// only actually polls the ones whose own adaptive interval has elapsed.
const SCHEDULER_TICK: Duration = Duration::from_secs(5);

const DIVERGENCE_ALERT_COOLDOWN_SECS: u64 = 3600;

pub struct ConvergenceTracker {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn DurableStore>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<TickerRegistry>,
    pair_stats: Arc<PairStatisticsService>,
    thresholds: ConvergenceThresholds,
}

impl ConvergenceTracker {
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn DurableStore>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<TickerRegistry>,
        pair_stats: Arc<PairStatisticsService>,
        thresholds: ConvergenceThresholds,
    ) -> Self {
        Self {
            kv,
            store,
            notifier,
            registry,
            pair_stats,
            thresholds,
        }
    }

    /// Open a new tracking for a just-qualified signal and send the alert.
    pub async fn begin(&self, signal: &Signal) -> anyhow::Result<()> {
        let signal_id = signal
            .id
            .ok_or_else(|| anyhow::anyhow!("signal must be persisted before tracking begins"))?;

        let tracking = Tracking {
            signal_id,
            started_at: Utc::now(),
            last_checked_at: Utc::now(),
            initial_spread_pct: signal.executable_spread_pct,
            latest_spread_pct: signal.executable_spread_pct,
            min_spread_pct: signal.executable_spread_pct,
            max_spread_pct: signal.executable_spread_pct,
            checks_count: 0,
            outcome: TrackingOutcome::Pending,
            closed_at: None,
        };
        self.store.start_tracking(&tracking).await?;

        if let Err(e) = self.record_opening_snapshot(&tracking, signal).await {
            warn!(error = %e, "failed to record opening snapshot for new tracking");
        }

        let message_id = self
            .notifier
            .send_alert(signal)
            .await
            .map_err(|source| crate::errors::ObservatoryError::NotifierFailure {
                chat_id: signal_id.to_string(),
                source,
            })?;
        self.kv
            .hset(
                "convergence:message_ids",
                &signal_id.to_string(),
                &message_id,
            )
            .await?;
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SCHEDULER_TICK);
        loop {
            ticker.tick().await;
            self.clone().poll_once().await;
        }
    }

    /// One scheduling pass: every open tracking whose own adaptive
    /// interval has elapsed since its last check gets polled this round.
    async fn poll_once(self: Arc<Self>) {
        let open = match self.store.open_trackings().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to list open trackings");
                return;
            }
        };

        let now = Utc::now();
        for tracking in open {
            let age_secs = now.signed_duration_since(tracking.started_at).num_seconds() as f64;
            let since_last_check = now
                .signed_duration_since(tracking.last_checked_at)
                .num_seconds() as f64;

            if since_last_check < poll_interval_secs(age_secs) {
                continue;
            }

            if let Err(e) = self.poll_one(tracking).await {
                warn!(error = %e, "failed to poll tracking");
            }
        }
    }

    /// Recompute and classify one open tracking. Exposed directly (not
    /// just via `run`'s ticker loop) so callers — and tests — can force a
    /// single poll without waiting on the scheduler's own cadence.
    pub async fn poll_one(&self, mut tracking: Tracking) -> anyhow::Result<()> {
        // Recompute the current spread the same way SpreadEngine would,
        // reading straight from the quote cache rather than re-deriving
        // pair/venue wiring here.
        let pair = self.pair_for(tracking.signal_id).await?;
        let Some(pair) = pair else {
            return Ok(());
        };

        let (Some(symbol_a), Some(symbol_b)) = (
            self.registry.native_symbol(&pair.venue_a, &pair.base_symbol),
            self.registry.native_symbol(&pair.venue_b, &pair.base_symbol),
        ) else {
            return Ok(());
        };

        let quote_a = cached_quote(&*self.kv, &pair.venue_a, &symbol_a).await?;
        let quote_b = cached_quote(&*self.kv, &pair.venue_b, &symbol_b).await?;
        let (Some(qa), Some(qb)) = (quote_a, quote_b) else {
            return Ok(());
        };

        let mid_a = qa.mid();
        let mid_b = qb.mid();
        if mid_a <= 0.0 || mid_b <= 0.0 {
            return Ok(());
        }
        let (low_price, high_price) = if mid_a <= mid_b { (mid_a, mid_b) } else { (mid_b, mid_a) };
        let latest_spread_pct = ((mid_a - mid_b).abs() / mid_a.min(mid_b)) * 100.0;

        let elapsed_secs = Utc::now()
            .signed_duration_since(tracking.started_at)
            .num_seconds() as f64;

        self.store
            .record_snapshot(&Snapshot {
                signal_id: tracking.signal_id,
                ts: Utc::now(),
                spread_pct: latest_spread_pct,
                low_price,
                high_price,
            })
            .await?;

        tracking.observe(latest_spread_pct);
        tracking.last_checked_at = Utc::now();

        if let Some(outcome) = classify(
            tracking.initial_spread_pct,
            latest_spread_pct,
            elapsed_secs,
            &self.thresholds,
        ) {
            tracking.outcome = outcome;
            tracking.closed_at = Some(Utc::now());
            self.store.close_tracking(&tracking).await?;

            if let Err(e) = self
                .pair_stats
                .refresh(&pair.base_symbol, &pair.venue_a, &pair.venue_b)
                .await
            {
                warn!(error = %e, "failed to refresh pair statistics");
            }

            if let Err(e) = self.record_convergence_analysis(&tracking).await {
                warn!(error = %e, "failed to record convergence analysis");
            }

            self.finalize_alert(&pair, &tracking).await?;
            info!(
                signal_id = tracking.signal_id,
                outcome = ?tracking.outcome,
                "tracking closed"
            );
        } else {
            self.store.start_tracking(&tracking).await?;
        }

        Ok(())
    }

    /// Record the prices a tracking opened at, so C8.A's first/last
    /// comparison has a genuine starting point instead of collapsing to the
    /// first poll's snapshot. Best-effort: a cache miss on either leg just
    /// means the analysis will fall back to whatever the first poll sees.
    async fn record_opening_snapshot(&self, tracking: &Tracking, signal: &Signal) -> anyhow::Result<()> {
        let (Some(symbol_a), Some(symbol_b)) = (
            self.registry.native_symbol(&signal.low_venue, &signal.base_symbol),
            self.registry.native_symbol(&signal.high_venue, &signal.base_symbol),
        ) else {
            return Ok(());
        };

        let quote_a = cached_quote(&*self.kv, &signal.low_venue, &symbol_a).await?;
        let quote_b = cached_quote(&*self.kv, &signal.high_venue, &symbol_b).await?;
        let (Some(qa), Some(qb)) = (quote_a, quote_b) else {
            return Ok(());
        };

        let mid_a = qa.mid();
        let mid_b = qb.mid();
        if mid_a <= 0.0 || mid_b <= 0.0 {
            return Ok(());
        }
        let (low_price, high_price) = if mid_a <= mid_b { (mid_a, mid_b) } else { (mid_b, mid_a) };

        self.store
            .record_snapshot(&Snapshot {
                signal_id: tracking.signal_id,
                ts: Utc::now(),
                spread_pct: tracking.initial_spread_pct,
                low_price,
                high_price,
            })
            .await
    }

    /// C8.A: compare the first and last recorded snapshots of a just-closed
    /// tracking and persist a verdict on which side moved. Depth history
    /// isn't captured per-snapshot today, so the arb-activity branch of the
    /// classifier never fires here — it only ever sees the price-based
    /// reasons, which is still the common case.
    async fn record_convergence_analysis(&self, tracking: &Tracking) -> anyhow::Result<()> {
        let snapshots = self.store.snapshots_for(tracking.signal_id).await?;
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return Ok(());
        };

        let low_change_pct = if first.low_price > 0.0 {
            (last.low_price - first.low_price) / first.low_price * 100.0
        } else {
            0.0
        };
        let high_change_pct = if first.high_price > 0.0 {
            (last.high_price - first.high_price) / first.high_price * 100.0
        } else {
            0.0
        };
        let duration_minutes = last
            .ts
            .signed_duration_since(first.ts)
            .num_seconds() as f64
            / 60.0;

        let convergence_reason =
            classify_convergence_reason(low_change_pct, high_change_pct, duration_minutes, 0.0, 0.0);

        self.store
            .record_convergence_analysis(&ConvergenceAnalysis {
                signal_id: tracking.signal_id,
                initial_low_price: first.low_price,
                initial_high_price: first.high_price,
                final_low_price: last.low_price,
                final_high_price: last.high_price,
                low_change_pct,
                high_change_pct,
                convergence_reason,
                duration_minutes,
                snapshots_count: snapshots.len() as u64,
                analyzed_at: Utc::now(),
            })
            .await
    }

    /// Clear the alert's interactive controls once a tracking resolves. For
    /// a divergence, also edit the message in place with the updated
    /// spread — rate-limited per pair so a signal that keeps re-diverging
    /// (or a pair with many concurrent signals) can't spam the channel
    /// more than once an hour.
    async fn finalize_alert(&self, pair: &ArbitragePair, tracking: &Tracking) -> anyhow::Result<()> {
        let Some(message_id) = self
            .kv
            .hget("convergence:message_ids", &tracking.signal_id.to_string())
            .await?
        else {
            return Ok(());
        };

        if tracking.outcome == TrackingOutcome::Diverged {
            let cooldown_key = format!(
                "convergence:divergence_alert:{}:{}:{}",
                pair.base_symbol, pair.venue_a, pair.venue_b
            );
            let claimed = self
                .kv
                .set_nx_ex(&cooldown_key, "1", Duration::from_secs(DIVERGENCE_ALERT_COOLDOWN_SECS))
                .await?;
            if claimed {
                if let Some(signal) = self.signal_for(tracking.signal_id).await? {
                    self.notifier.edit(&message_id, &signal, tracking).await?;
                }
            }
        }

        self.notifier.remove_markup(&message_id).await?;
        Ok(())
    }

    async fn signal_for(&self, signal_id: i64) -> anyhow::Result<Option<Signal>> {
        let signals = self.store.recent_signals(10_000).await?;
        Ok(signals.into_iter().find(|s| s.id == Some(signal_id)))
    }

    /// Look up the venue pair a tracking belongs to. Stored alongside the
    /// message id at `begin` time since `Tracking` itself doesn't carry
    /// venue/base-symbol fields (those live on the `Signal` row).
    async fn pair_for(&self, signal_id: i64) -> anyhow::Result<Option<ArbitragePair>> {
        let signals = self.store.recent_signals(10_000).await?;
        Ok(signals
            .into_iter()
            .find(|s| s.id == Some(signal_id))
            .map(|s| ArbitragePair {
                base_symbol: s.base_symbol,
                venue_a: s.low_venue,
                venue_b: s.high_venue,
                auto: true,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::models::{Category, Quote};
    use crate::notifier::NullNotifier;
    use crate::storage::SqliteStore;

    fn thresholds() -> ConvergenceThresholds {
        ConvergenceThresholds {
            converge_at_pct: 0.1,
            diverge_multiplier: 1.5,
            expire_after_secs: 3600.0,
        }
    }

    async fn seed_quote(kv: &dyn KvStore, venue: &str, symbol: &str, bid: f64, ask: f64) {
        let quote = Quote {
            bid,
            ask,
            bid_size: 1.0,
            ask_size: 1.0,
            ts: Utc::now(),
        };
        kv.set_ex(
            &format!("prices:latest:{venue}:{symbol}"),
            &serde_json::to_string(&quote).unwrap(),
            std::time::Duration::from_secs(30),
        )
        .await
        .unwrap();
    }

    async fn registry_with_btc(kv: Arc<dyn KvStore>) -> Arc<TickerRegistry> {
        use crate::venue::mock::MockAdapter;
        let registry = Arc::new(TickerRegistry::new(kv));
        let a = MockAdapter::new("binance");
        a.set_quote("BTC", Quote { bid: 1.0, ask: 1.1, bid_size: 1.0, ask_size: 1.0, ts: Utc::now() });
        let b = MockAdapter::new("okx");
        b.set_quote("BTC", Quote { bid: 1.0, ask: 1.1, bid_size: 1.0, ask_size: 1.0, ts: Utc::now() });
        let adapters: Vec<Arc<dyn crate::venue::VenueAdapter>> = vec![a, b];
        registry.rebuild(&adapters).await.unwrap();
        registry
    }

    fn tracker(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn DurableStore>,
        registry: Arc<TickerRegistry>,
    ) -> ConvergenceTracker {
        let notifier: Arc<dyn Notifier> = Arc::new(NullNotifier);
        let pair_stats = Arc::new(PairStatisticsService::new(store.clone()));
        ConvergenceTracker::new(kv, store, notifier, registry, pair_stats, thresholds())
    }

    #[tokio::test]
    async fn begin_persists_a_pending_tracking_and_sends_an_alert() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = registry_with_btc(kv.clone()).await;
        let t = tracker(kv, store.clone(), registry);

        let mut signal = Signal::new(
            "BTC".into(),
            Category::Layer1,
            "binance".into(),
            "okx".into(),
            0.5,
            0.5,
            10_000.0,
        );
        signal.id = Some(store.insert_signal(&signal).await.unwrap());

        t.begin(&signal).await.unwrap();
        let tracking = store.get_tracking(signal.id.unwrap()).await.unwrap();
        assert!(tracking.is_some());
        let tracking = tracking.unwrap();
        assert_eq!(tracking.outcome, TrackingOutcome::Pending);
        assert_eq!(tracking.checks_count, 0);
    }

    #[tokio::test]
    async fn poll_one_closes_a_converged_tracking_and_records_analysis() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = registry_with_btc(kv.clone()).await;
        let t = tracker(kv.clone(), store.clone(), registry);

        let mut signal = Signal::new(
            "BTC".into(),
            Category::Layer1,
            "binance".into(),
            "okx".into(),
            0.5,
            0.5,
            10_000.0,
        );
        signal.id = Some(store.insert_signal(&signal).await.unwrap());
        t.begin(&signal).await.unwrap();

        seed_quote(&*kv, "binance", "BTC", 100.0, 100.01).await;
        seed_quote(&*kv, "okx", "BTC", 100.0, 100.02).await;

        let tracking = store.get_tracking(signal.id.unwrap()).await.unwrap().unwrap();
        t.poll_one(tracking).await.unwrap();

        let closed = store.get_tracking(signal.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(closed.outcome, TrackingOutcome::Converged);
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.checks_count, 1);

        let stats = store
            .pair_statistics("BTC", "binance", "okx")
            .await
            .unwrap();
        assert!(stats.is_some());
    }

    #[tokio::test]
    async fn poll_one_keeps_an_open_tracking_alive_across_polls() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = registry_with_btc(kv.clone()).await;
        let t = tracker(kv.clone(), store.clone(), registry);

        let mut signal = Signal::new(
            "BTC".into(),
            Category::Layer1,
            "binance".into(),
            "okx".into(),
            0.5,
            0.5,
            10_000.0,
        );
        signal.id = Some(store.insert_signal(&signal).await.unwrap());
        t.begin(&signal).await.unwrap();

        seed_quote(&*kv, "binance", "BTC", 100.0, 100.2).await;
        seed_quote(&*kv, "okx", "BTC", 100.3, 100.5).await;

        let tracking = store.get_tracking(signal.id.unwrap()).await.unwrap().unwrap();
        t.poll_one(tracking).await.unwrap();

        let still_open = store.get_tracking(signal.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(still_open.outcome, TrackingOutcome::Pending);
        assert_eq!(still_open.checks_count, 1);
    }

    #[tokio::test]
    async fn begin_records_an_opening_snapshot_when_quotes_are_already_cached() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = registry_with_btc(kv.clone()).await;
        let t = tracker(kv.clone(), store.clone(), registry);

        seed_quote(&*kv, "binance", "BTC", 100.0, 100.1).await;
        seed_quote(&*kv, "okx", "BTC", 104.0, 104.1).await;

        let mut signal = Signal::new(
            "BTC".into(),
            Category::Layer1,
            "binance".into(),
            "okx".into(),
            4.0,
            4.0,
            10_000.0,
        );
        signal.id = Some(store.insert_signal(&signal).await.unwrap());
        t.begin(&signal).await.unwrap();

        let snapshots = store.snapshots_for(signal.id.unwrap()).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].low_price > 0.0 && snapshots[0].high_price > snapshots[0].low_price);
    }
}
