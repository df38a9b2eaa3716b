//! Composition root: wires every component together and owns the
//! top-level tick loop — one `tokio::spawn` per periodic concern off a
//! shared, `Arc`-wrapped state struct, with cooperative shutdown via a
//! cancellation token.
//!
//! The arbitrage pipeline itself is queue-driven rather than one monolithic
//! per-pair loop: spread computation fans candidates into
//! `queue:orderbook_analysis`, a bounded worker pool walks order books into
//! `signals:pending`, and a single consumer runs the safety/qualification
//! gate and persists whatever survives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analyzer::{ExecutableSpread, OrderBookAnalyzer};
use crate::baseline::BaselineCollector;
use crate::collector::PriceCollector;
use crate::convergence::analyzer::ConvergenceThresholds;
use crate::convergence::ConvergenceTracker;
use crate::kv::KvStore;
use crate::models::{Category, Config, Spread, VenueKind};
use crate::notifier::{NullNotifier, Notifier};
use crate::pair_stats::PairStatisticsService;
use crate::position::PositionTracker;
use crate::qualifier::{QualifyOutcome, SignalQualifier};
use crate::registry::TickerRegistry;
use crate::spread::SpreadEngine;
use crate::storage::DurableStore;
use crate::venue::VenueAdapter;

#[cfg(feature = "notifier-telegram")]
use crate::notifier::TelegramNotifier;

const ORDERBOOK_QUEUE_KEY: &str = "queue:orderbook_analysis";
const SIGNALS_QUEUE_KEY: &str = "signals:pending";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedSpread {
    spread: Spread,
    category: Category,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedCandidate {
    candidate: ExecutableSpread,
    category: Category,
}

pub struct Observatory {
    pub config: Config,
    pub kv: Arc<dyn KvStore>,
    pub store: Arc<dyn DurableStore>,
    pub registry: Arc<TickerRegistry>,
    pub notifier: Arc<dyn Notifier>,
    pub pair_stats: Arc<PairStatisticsService>,
    adapters: Vec<Arc<dyn VenueAdapter>>,
    collector: Arc<PriceCollector>,
    spread_engine: SpreadEngine,
    analyzer: OrderBookAnalyzer,
    qualifier: SignalQualifier,
    convergence: Arc<ConvergenceTracker>,
    baseline: Arc<BaselineCollector>,
    position: Arc<PositionTracker>,
}

impl Observatory {
    pub fn new(
        config: Config,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn DurableStore>,
        adapters: Vec<Arc<dyn VenueAdapter>>,
    ) -> Arc<Self> {
        let registry = Arc::new(TickerRegistry::new(kv.clone()));

        let notifier: Arc<dyn Notifier> = build_notifier(&config);

        let pair_stats = Arc::new(PairStatisticsService::new(store.clone()));
        let collector = Arc::new(PriceCollector::new(
            adapters.clone(),
            kv.clone(),
            Duration::from_secs(config.stale_data_secs),
        ));

        let venue_kinds: HashMap<String, VenueKind> = adapters
            .iter()
            .map(|a| (a.venue_id().to_string(), a.kind()))
            .collect();
        let spread_engine = SpreadEngine::new(
            kv.clone(),
            venue_kinds,
            config.token_mismatch_ratio,
            config.min_dex_liquidity_usd,
        );
        let analyzer = OrderBookAnalyzer::new(1.0, config.min_liquidity_usd);
        let qualifier = SignalQualifier::new(
            kv.clone(),
            store.clone(),
            config.min_spread_pct,
            Duration::from_secs(config.cooldown_secs),
            config.zscore_threshold,
            config.max_signal_age_secs,
        );
        let convergence = Arc::new(ConvergenceTracker::new(
            kv.clone(),
            store.clone(),
            notifier.clone(),
            registry.clone(),
            pair_stats.clone(),
            ConvergenceThresholds {
                converge_at_pct: config.min_spread_pct / 2.0,
                diverge_multiplier: 1.5,
                expire_after_secs: 3600.0,
            },
        ));
        let baseline = Arc::new(BaselineCollector::new(store.clone()));
        let position = Arc::new(
            PositionTracker::new(kv.clone(), store.clone())
                .with_dependencies(registry.clone(), notifier.clone()),
        );

        Arc::new(Self {
            config,
            kv,
            store,
            registry,
            notifier,
            pair_stats,
            adapters,
            collector,
            spread_engine,
            analyzer,
            qualifier,
            convergence,
            baseline,
            position,
        })
    }

    pub fn spawn_all(self: &Arc<Self>, shutdown: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            this.registry.rebuild(&this.adapters).await.ok();
        });

        let collector = self.collector.clone();
        let price_poll_interval = self.config.price_poll_interval;
        tokio::spawn(async move { collector.run(price_poll_interval).await });

        let convergence = self.convergence.clone();
        tokio::spawn(async move { convergence.run().await });

        let position = self.position.clone();
        tokio::spawn(async move { position.run().await });

        let this = self.clone();
        let shutdown_for_pipeline = shutdown.clone();
        tokio::spawn(async move { this.run_pipeline(shutdown_for_pipeline).await });

        let this = self.clone();
        tokio::spawn(async move { this.run_baseline_flush(shutdown).await });
    }

    /// Main arbitrage loop: each tick fans spread candidates into a queue,
    /// drains that queue through the order-book worker pool into a second
    /// queue, then drains that one through the qualifier.
    async fn run_pipeline(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.price_poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("pipeline loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.stage_collect_spreads().await;
                    self.stage_analyze_orderbooks().await;
                    self.stage_qualify_signals().await;
                }
            }
        }
    }

    /// C4: recompute every pair's spread and push it onto the order-book
    /// analysis queue, capped at `orderbook_queue_capacity` entries so a
    /// stalled downstream stage can't grow the list without bound.
    async fn stage_collect_spreads(&self) {
        for pair in self.registry.arbitrage_pairs() {
            let Some(symbol_a) = self.registry.native_symbol(&pair.venue_a, &pair.base_symbol) else {
                continue;
            };
            let Some(symbol_b) = self.registry.native_symbol(&pair.venue_b, &pair.base_symbol) else {
                continue;
            };
            let spread = match self.spread_engine.compute(&pair, &symbol_a, &symbol_b).await {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, base = %pair.base_symbol, "spread compute failed");
                    continue;
                }
            };

            self.baseline.record(
                &spread.base_symbol,
                &spread.low_venue,
                &spread.high_venue,
                spread.spread_pct,
                chrono::Utc::now(),
            );

            let category = self
                .registry
                .tickers()
                .into_iter()
                .find(|t| t.base_symbol == spread.base_symbol)
                .map(|t| t.category)
                .unwrap_or_default();

            if let Err(e) = self.push_capped(
                ORDERBOOK_QUEUE_KEY,
                &QueuedSpread { spread, category },
                self.config.orderbook_queue_capacity,
            )
            .await
            {
                warn!(error = %e, "failed to enqueue spread for orderbook analysis");
            }
        }
    }

    /// C5: drain the order-book analysis queue through a bounded worker
    /// pool, walking real depth when it's fetchable and falling back to a
    /// conservative quote-only candidate otherwise. Survivors land on the
    /// signals queue.
    async fn stage_analyze_orderbooks(&self) {
        let queued: Vec<QueuedSpread> = match self.drain_queue(ORDERBOOK_QUEUE_KEY).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "failed to drain orderbook analysis queue");
                return;
            }
        };
        if queued.is_empty() {
            return;
        }

        for chunk in queued.chunks(self.config.orderbook_worker_count.max(1)) {
            let results = join_all(chunk.iter().map(|item| self.analyze_one(item))).await;
            for candidate in results.into_iter().flatten() {
                if let Err(e) = self.push_capped(
                    SIGNALS_QUEUE_KEY,
                    &candidate,
                    self.config.signals_queue_capacity,
                )
                .await
                {
                    warn!(error = %e, "failed to enqueue candidate for qualification");
                }
            }
        }
    }

    async fn analyze_one(&self, item: &QueuedSpread) -> Option<QueuedCandidate> {
        let candidate = match self.fetch_books(&item.spread).await {
            Some((low_venue, high_venue, low_book, high_book)) => self.analyzer.analyze(
                &item.spread,
                &low_venue,
                &high_venue,
                &low_book,
                &high_book,
            )?,
            // Neither venue's depth was fetchable this tick — still worth
            // surfacing a conservative, size-capped signal rather than
            // dropping a real quote-spread reading on the floor.
            None => self.analyzer.fallback(&item.spread),
        };
        Some(QueuedCandidate {
            candidate,
            category: item.category,
        })
    }

    /// C6: drain the signals queue, group same-symbol candidates so one
    /// busy base symbol can't fire more than one signal per tick, and run
    /// each group's primary candidate through the qualifier sequentially.
    async fn stage_qualify_signals(&self) {
        let queued: Vec<QueuedCandidate> = match self.drain_queue(SIGNALS_QUEUE_KEY).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "failed to drain signals queue");
                return;
            }
        };
        if queued.is_empty() {
            return;
        }

        let mut groups: HashMap<String, (Category, Vec<ExecutableSpread>)> = HashMap::new();
        for item in queued {
            groups
                .entry(item.candidate.base_symbol.clone())
                .or_insert_with(|| (item.category, Vec::new()))
                .1
                .push(item.candidate);
        }

        for (base_symbol, (category, candidates)) in groups {
            match self.qualifier.qualify_group(candidates, category).await {
                Ok(QualifyOutcome::Accepted(mut signal)) => match self.store.insert_signal(&signal).await {
                    Ok(id) => {
                        signal.id = Some(id);
                        if let Err(e) = self.convergence.begin(&signal).await {
                            warn!(error = %e, "failed to start tracking for qualified signal");
                        }
                    }
                    Err(e) => warn!(
                        error = %crate::errors::ObservatoryError::PersistenceFailure {
                            operation: "insert_signal".to_string(),
                            source: e,
                        },
                        "failed to persist qualified signal"
                    ),
                },
                Ok(QualifyOutcome::Rejected { reason }) => {
                    tracing::debug!(base = %base_symbol, %reason, "signal rejected");
                }
                Err(e) => warn!(error = %e, "qualifier failed"),
            }
        }
    }

    async fn push_capped<T: Serialize>(&self, key: &str, value: &T, capacity: usize) -> anyhow::Result<()> {
        let blob = serde_json::to_string(value)?;
        let current_len = self.kv.lrange(key, 0, -1).await?.len();
        if current_len >= capacity {
            warn!(
                error = %crate::errors::ObservatoryError::QueueOverflow { queue_name: key.to_string() },
                "queue at capacity, oldest entry will be dropped"
            );
        }
        self.kv.lpush(key, &blob).await?;
        self.kv.ltrim(key, 0, capacity.saturating_sub(1) as isize).await?;
        Ok(())
    }

    /// Reads the full queue and clears it. Not atomic against a concurrent
    /// push landing between the two calls — acceptable here since at most
    /// one producer (`stage_collect_spreads`/`stage_analyze_orderbooks`)
    /// writes to a given key per tick, ahead of the matching drain.
    async fn drain_queue<T: for<'de> Deserialize<'de>>(&self, key: &str) -> anyhow::Result<Vec<T>> {
        let raw = self.kv.lrange(key, 0, -1).await?;
        self.kv.del(key).await?;
        Ok(raw
            .into_iter()
            .rev()
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect())
    }

    async fn fetch_books(
        &self,
        spread: &Spread,
    ) -> Option<(
        crate::models::Venue,
        crate::models::Venue,
        crate::venue::OrderBook,
        crate::venue::OrderBook,
    )> {
        let low_adapter = self
            .adapters
            .iter()
            .find(|a| a.venue_id() == spread.low_venue)?;
        let high_adapter = self
            .adapters
            .iter()
            .find(|a| a.venue_id() == spread.high_venue)?;

        let low_symbol = self
            .registry
            .native_symbol(&spread.low_venue, &spread.base_symbol)?;
        let high_symbol = self
            .registry
            .native_symbol(&spread.high_venue, &spread.base_symbol)?;

        let low_book = low_adapter.order_book(&low_symbol).await.ok()??;
        let high_book = high_adapter.order_book(&high_symbol).await.ok()??;

        let low_venue = crate::models::Venue {
            id: spread.low_venue.clone(),
            kind: low_adapter.kind(),
            display_name: spread.low_venue.clone(),
            taker_fee_bps: 10,
            chain: None,
            token_address: None,
        };
        let high_venue = crate::models::Venue {
            id: spread.high_venue.clone(),
            kind: high_adapter.kind(),
            display_name: spread.high_venue.clone(),
            taker_fee_bps: 10,
            chain: None,
            token_address: None,
        };

        Some((low_venue, high_venue, low_book, high_book))
    }

    async fn run_baseline_flush(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(e) = self.baseline.flush_all().await {
                        warn!(error = %e, "final baseline flush failed");
                    }
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.baseline.flush_all().await {
                        warn!(error = %e, "baseline flush failed");
                    }
                }
            }
        }
    }
}

fn build_notifier(config: &Config) -> Arc<dyn Notifier> {
    #[cfg(feature = "notifier-telegram")]
    {
        if let (Some(token), Some(chat_id)) = (&config.telegram_bot_token, &config.telegram_chat_id) {
            match TelegramNotifier::new(token, chat_id) {
                Ok(n) => return Arc::new(n),
                Err(e) => warn!(error = %e, "failed to initialize telegram notifier, falling back to null notifier"),
            }
        }
    }
    let _ = config;
    Arc::new(NullNotifier)
}
