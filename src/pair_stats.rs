//! PairStatisticsService (C10): wraps the durable store's aggregation
//! query so callers (the status API, ConvergenceTracker's closing hook)
//! don't need to know the recompute-on-write vs. read-cached distinction.

use std::sync::Arc;

use tracing::debug;

use crate::models::PairStatistics;
use crate::storage::DurableStore;

pub struct PairStatisticsService {
    store: Arc<dyn DurableStore>,
}

impl PairStatisticsService {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Recompute and persist fresh statistics for one pair. Called after a
    /// tracking closes so the aggregate never drifts far from the signals
    /// table it's derived from.
    pub async fn refresh(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
    ) -> anyhow::Result<PairStatistics> {
        let stats = self
            .store
            .recompute_pair_statistics(base_symbol, low_venue, high_venue)
            .await?;
        debug!(
            base = base_symbol,
            total = stats.total_signals,
            success_rate = stats.success_rate(),
            "pair statistics refreshed"
        );
        Ok(stats)
    }

    /// Read the last computed statistics without recomputing, falling back
    /// to an empty record for pairs that have never closed a tracking yet.
    pub async fn get(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
    ) -> anyhow::Result<PairStatistics> {
        Ok(self
            .store
            .pair_statistics(base_symbol, low_venue, high_venue)
            .await?
            .unwrap_or_else(|| PairStatistics {
                base_symbol: base_symbol.to_string(),
                low_venue: low_venue.to_string(),
                high_venue: high_venue.to_string(),
                ..Default::default()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, Signal, Tracking, TrackingOutcome};
    use crate::storage::SqliteStore;
    use chrono::Utc;

    #[tokio::test]
    async fn get_falls_back_to_empty_record_for_unknown_pair() {
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let service = PairStatisticsService::new(store);
        let stats = service.get("BTC", "binance", "okx").await.unwrap();
        assert_eq!(stats.total_signals, 0);
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn refresh_persists_and_returns_updated_counts() {
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let signal = Signal::new(
            "BTC".into(),
            Category::Layer1,
            "binance".into(),
            "okx".into(),
            0.5,
            0.4,
            10_000.0,
        );
        let id = store.insert_signal(&signal).await.unwrap();
        let now = Utc::now();
        store
            .start_tracking(&Tracking {
                signal_id: id,
                started_at: now,
                last_checked_at: now,
                initial_spread_pct: 0.5,
                latest_spread_pct: 0.05,
                outcome: TrackingOutcome::Converged,
                closed_at: Some(now),
            })
            .await
            .unwrap();

        let service = PairStatisticsService::new(store);
        let stats = service.refresh("BTC", "binance", "okx").await.unwrap();
        assert_eq!(stats.total_signals, 1);
        assert_eq!(stats.converged, 1);
    }
}
