//! Durable store contract (C12): the relational side of persistence —
//! signals, convergence history and analysis, baselines, pair statistics,
//! position tracking and trade results. Backed by `rusqlite` in WAL mode,
//! using prepared statements and covering indexes throughout.

pub mod sqlite;

use async_trait::async_trait;

use crate::models::{
    BaselineBucket, BaselineSummary, ConvergenceAnalysis, PairStatistics, PositionEntry, Signal,
    Snapshot, SpreadLogEntry, TradeResult, Tracking, ZScoreLogEntry,
};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn insert_signal(&self, signal: &Signal) -> anyhow::Result<i64>;
    async fn recent_signals(&self, limit: usize) -> anyhow::Result<Vec<Signal>>;
    async fn log_rejection(&self, entry: &ZScoreLogEntry) -> anyhow::Result<()>;

    async fn start_tracking(&self, tracking: &Tracking) -> anyhow::Result<()>;
    async fn record_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
    async fn snapshots_for(&self, signal_id: i64) -> anyhow::Result<Vec<Snapshot>>;
    async fn close_tracking(&self, tracking: &Tracking) -> anyhow::Result<()>;
    async fn get_tracking(&self, signal_id: i64) -> anyhow::Result<Option<Tracking>>;
    async fn open_trackings(&self) -> anyhow::Result<Vec<Tracking>>;

    async fn record_convergence_analysis(&self, analysis: &ConvergenceAnalysis) -> anyhow::Result<()>;
    async fn convergence_analysis_for(&self, signal_id: i64) -> anyhow::Result<Option<ConvergenceAnalysis>>;

    async fn merge_baseline_bucket(&self, bucket: &BaselineBucket) -> anyhow::Result<()>;
    async fn baseline_for(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
    ) -> anyhow::Result<Vec<BaselineBucket>>;
    async fn baseline_summary(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
        current_spread_pct: Option<f64>,
    ) -> anyhow::Result<BaselineSummary>;

    async fn recompute_pair_statistics(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
    ) -> anyhow::Result<PairStatistics>;
    async fn pair_statistics(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
    ) -> anyhow::Result<Option<PairStatistics>>;

    async fn record_trade_result(&self, result: &TradeResult) -> anyhow::Result<()>;

    async fn log_spread(&self, entry: &SpreadLogEntry) -> anyhow::Result<i64>;

    async fn upsert_position(&self, entry: &PositionEntry) -> anyhow::Result<i64>;
    async fn open_positions(&self) -> anyhow::Result<Vec<PositionEntry>>;
    async fn positions_for_user(&self, user_id: &str) -> anyhow::Result<Vec<PositionEntry>>;
}
