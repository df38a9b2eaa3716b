//! PositionTracker (C11): watches positions an operator has explicitly
//! entered against a qualified signal, polling the live spread until it
//! closes to the target and firing a single notification.
//!
//! Unlike ConvergenceTracker (which follows every signal regardless of
//! whether anyone acted on it), this only tracks what a user told us they
//! entered — `enter()` is the write path, `run()` the poll loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::collector::cached_quote;
use crate::kv::KvStore;
use crate::models::{PositionEntry, PositionStatus};
use crate::notifier::Notifier;
use crate::registry::TickerRegistry;
use crate::storage::DurableStore;

const DEFAULT_INTERVAL_SECS: u64 = 30;

pub struct PositionTracker {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn DurableStore>,
    registry: Option<Arc<TickerRegistry>>,
    notifier: Option<Arc<dyn Notifier>>,
    interval: Duration,
}

impl PositionTracker {
    pub fn new(kv: Arc<dyn KvStore>, store: Arc<dyn DurableStore>) -> Self {
        let interval_secs = std::env::var("POSITION_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        Self {
            kv,
            store,
            registry: None,
            notifier: None,
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// Wire in the registry and notifier the poll loop needs to resolve
    /// native symbols and deliver the one-shot notification. Kept optional
    /// on the struct (rather than required constructor args) so unit tests
    /// exercising `enter`/persistence alone don't need to stand up a full
    /// registry.
    pub fn with_dependencies(mut self, registry: Arc<TickerRegistry>, notifier: Arc<dyn Notifier>) -> Self {
        self.registry = Some(registry);
        self.notifier = Some(notifier);
        self
    }

    /// Record a user's "I entered this" bookmark against a signal.
    /// `target_spread_pct` defaults to half the entry spread.
    #[allow(clippy::too_many_arguments)]
    pub async fn enter(
        &self,
        signal_id: i64,
        user_id: String,
        base_symbol: String,
        low_venue: String,
        high_venue: String,
        entry_spread_pct: f64,
        target_spread_pct: Option<f64>,
    ) -> anyhow::Result<PositionEntry> {
        let mut entry = PositionEntry::new(
            signal_id,
            user_id,
            base_symbol,
            low_venue,
            high_venue,
            entry_spread_pct,
            target_spread_pct,
        );
        let id = self.store.upsert_position(&entry).await?;
        entry.id = Some(id);
        Ok(entry)
    }

    pub async fn run(self: Arc<Self>) {
        info!(interval_secs = self.interval.as_secs(), "starting position tracker");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick_once().await {
                warn!(error = %e, "position tracker tick failed");
            }
        }
    }

    pub async fn tick_once(&self) -> anyhow::Result<()> {
        let Some(registry) = &self.registry else {
            return Ok(());
        };

        for mut entry in self.store.open_positions().await? {
            let (Some(symbol_low), Some(symbol_high)) = (
                registry.native_symbol(&entry.low_venue, &entry.base_symbol),
                registry.native_symbol(&entry.high_venue, &entry.base_symbol),
            ) else {
                continue;
            };

            let quote_low = cached_quote(&*self.kv, &entry.low_venue, &symbol_low).await?;
            let quote_high = cached_quote(&*self.kv, &entry.high_venue, &symbol_high).await?;
            let (Some(ql), Some(qh)) = (quote_low, quote_high) else {
                continue;
            };

            let mid_low = ql.mid();
            let mid_high = qh.mid();
            if mid_low <= 0.0 || mid_high <= 0.0 {
                continue;
            }
            entry.current_spread_pct = (mid_high - mid_low).abs() / mid_low.min(mid_high) * 100.0;

            if entry.current_spread_pct <= entry.target_spread_pct {
                self.notify_target_reached(&mut entry).await?;
            }

            self.store.upsert_position(&entry).await?;
        }
        Ok(())
    }

    async fn notify_target_reached(&self, entry: &mut PositionEntry) -> anyhow::Result<()> {
        entry.status = PositionStatus::Notified;
        entry.notified_at = Some(chrono::Utc::now());

        let Some(notifier) = &self.notifier else {
            return Ok(());
        };
        let Some(signal) = self
            .store
            .recent_signals(10_000)
            .await?
            .into_iter()
            .find(|s| s.id == Some(entry.signal_id))
        else {
            return Ok(());
        };

        let message_id = notifier
            .send_alert(&signal)
            .await
            .map_err(|source| crate::errors::ObservatoryError::NotifierFailure {
                chat_id: entry.user_id.clone(),
                source,
            })?;
        entry.telegram_msg_id = Some(message_id);
        info!(
            signal_id = entry.signal_id,
            user_id = %entry.user_id,
            "position target reached, notified"
        );
        Ok(())
    }
}
