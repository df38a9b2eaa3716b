//! `rusqlite` (WAL mode) implementation of `DurableStore`.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::models::{
    BaselineBucket, BaselineSummary, Category, ConvergenceAnalysis, ConvergenceReason,
    PairStatistics, PositionEntry, PositionStatus, Signal, SignalStatus, SignalType, Snapshot,
    SpreadLogEntry, TradeResult, Tracking, TrackingOutcome, ZScoreLogEntry,
};

use super::DurableStore;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("opening sqlite database")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL,
                base_symbol TEXT NOT NULL,
                category TEXT NOT NULL,
                low_venue TEXT NOT NULL,
                high_venue TEXT NOT NULL,
                buy_price REAL NOT NULL,
                sell_price REAL NOT NULL,
                spread_pct REAL NOT NULL,
                executable_spread_pct REAL NOT NULL,
                loss_pct REAL NOT NULL,
                max_entry_usd REAL NOT NULL,
                exit_liquidity_usd REAL NOT NULL,
                suggested_position_usd REAL NOT NULL,
                fully_fillable INTEGER NOT NULL DEFAULT 1,
                fallback_signal INTEGER NOT NULL DEFAULT 0,
                signal_type TEXT NOT NULL DEFAULT 'auto',
                strategy_type TEXT NOT NULL DEFAULT 'cross_venue_spot',
                status TEXT NOT NULL,
                rejection_reason TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signals_created_at ON signals(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_signals_pair ON signals(base_symbol, low_venue, high_venue);

            CREATE TABLE IF NOT EXISTS zscore_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                base_symbol TEXT NOT NULL,
                family TEXT NOT NULL,
                observed REAL NOT NULL,
                mean REAL NOT NULL,
                std_dev REAL NOT NULL,
                accepted INTEGER NOT NULL,
                corroborated INTEGER NOT NULL,
                ts TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS spread_convergence (
                signal_id INTEGER PRIMARY KEY,
                started_at TEXT NOT NULL,
                last_checked_at TEXT NOT NULL,
                initial_spread_pct REAL NOT NULL,
                latest_spread_pct REAL NOT NULL,
                min_spread_pct REAL NOT NULL,
                max_spread_pct REAL NOT NULL,
                checks_count INTEGER NOT NULL DEFAULT 0,
                outcome TEXT NOT NULL,
                closed_at TEXT,
                FOREIGN KEY(signal_id) REFERENCES signals(id)
            );

            CREATE TABLE IF NOT EXISTS convergence_snapshots (
                signal_id INTEGER NOT NULL,
                ts TEXT NOT NULL,
                spread_pct REAL NOT NULL,
                low_price REAL NOT NULL DEFAULT 0,
                high_price REAL NOT NULL DEFAULT 0,
                FOREIGN KEY(signal_id) REFERENCES signals(id)
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_signal ON convergence_snapshots(signal_id);

            CREATE TABLE IF NOT EXISTS convergence_analysis (
                signal_id INTEGER PRIMARY KEY,
                initial_low_price REAL NOT NULL,
                initial_high_price REAL NOT NULL,
                final_low_price REAL NOT NULL,
                final_high_price REAL NOT NULL,
                low_change_pct REAL NOT NULL,
                high_change_pct REAL NOT NULL,
                convergence_reason TEXT NOT NULL,
                duration_minutes REAL NOT NULL,
                snapshots_count INTEGER NOT NULL,
                analyzed_at TEXT NOT NULL,
                FOREIGN KEY(signal_id) REFERENCES signals(id)
            );

            CREATE TABLE IF NOT EXISTS spread_baseline (
                base_symbol TEXT NOT NULL,
                low_venue TEXT NOT NULL,
                high_venue TEXT NOT NULL,
                hour_start TEXT NOT NULL,
                sample_count INTEGER NOT NULL,
                mean_pct REAL NOT NULL,
                stddev_pct REAL NOT NULL,
                min_pct REAL NOT NULL,
                max_pct REAL NOT NULL,
                p50_pct REAL NOT NULL,
                p95_pct REAL NOT NULL,
                PRIMARY KEY (base_symbol, low_venue, high_venue, hour_start)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS pair_statistics (
                base_symbol TEXT NOT NULL,
                low_venue TEXT NOT NULL,
                high_venue TEXT NOT NULL,
                total_signals INTEGER NOT NULL,
                converged INTEGER NOT NULL,
                diverged INTEGER NOT NULL,
                expired INTEGER NOT NULL,
                avg_time_to_converge_secs REAL NOT NULL,
                PRIMARY KEY (base_symbol, low_venue, high_venue)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS trade_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id INTEGER NOT NULL,
                pnl_pct REAL NOT NULL,
                hold_hours REAL NOT NULL,
                notes TEXT,
                recorded_at TEXT NOT NULL,
                FOREIGN KEY(signal_id) REFERENCES signals(id)
            );

            CREATE TABLE IF NOT EXISTS spread_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                base_symbol TEXT NOT NULL,
                strategy_type TEXT NOT NULL,
                low_venue TEXT NOT NULL,
                high_venue TEXT NOT NULL,
                low_price REAL NOT NULL,
                high_price REAL NOT NULL,
                spread_pct REAL NOT NULL,
                net_spread_pct REAL NOT NULL,
                liquidity_usd REAL NOT NULL,
                passed_validation INTEGER NOT NULL,
                rejection_reason TEXT,
                signal_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_spread_log_ts ON spread_log(ts DESC);
            CREATE INDEX IF NOT EXISTS idx_spread_log_pair ON spread_log(base_symbol, low_venue, high_venue);

            CREATE TABLE IF NOT EXISTS position_tracking (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                base_symbol TEXT NOT NULL,
                low_venue TEXT NOT NULL,
                high_venue TEXT NOT NULL,
                entry_spread_pct REAL NOT NULL,
                target_spread_pct REAL NOT NULL,
                current_spread_pct REAL NOT NULL,
                status TEXT NOT NULL,
                entered_at TEXT NOT NULL,
                notified_at TEXT,
                closed_at TEXT,
                telegram_msg_id TEXT,
                FOREIGN KEY(signal_id) REFERENCES signals(id)
            );
            CREATE INDEX IF NOT EXISTS idx_position_user ON position_tracking(user_id, status);
            "#,
        )
        .context("running schema migration")?;

        info!(path, "durable store opened (WAL mode)");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-memory store for tests and short-lived tooling — same schema,
    /// no file on disk.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::open(":memory:")
    }
}

fn category_str(c: Category) -> &'static str {
    match c {
        Category::Layer1 => "layer1",
        Category::Layer2 => "layer2",
        Category::Defi => "defi",
        Category::Meme => "meme",
        Category::Stable => "stable",
        Category::Unknown => "unknown",
    }
}

fn category_from_str(s: &str) -> Category {
    match s {
        "layer1" => Category::Layer1,
        "layer2" => Category::Layer2,
        "defi" => Category::Defi,
        "meme" => Category::Meme,
        "stable" => Category::Stable,
        _ => Category::Unknown,
    }
}

fn status_str(s: SignalStatus) -> &'static str {
    match s {
        SignalStatus::Open => "open",
        SignalStatus::Converged => "converged",
        SignalStatus::Diverged => "diverged",
        SignalStatus::Expired => "expired",
    }
}

fn status_from_str(s: &str) -> SignalStatus {
    match s {
        "converged" => SignalStatus::Converged,
        "diverged" => SignalStatus::Diverged,
        "expired" => SignalStatus::Expired,
        _ => SignalStatus::Open,
    }
}

fn outcome_str(o: TrackingOutcome) -> &'static str {
    match o {
        TrackingOutcome::Pending => "pending",
        TrackingOutcome::Converged => "converged",
        TrackingOutcome::Diverged => "diverged",
        TrackingOutcome::Expired => "expired",
    }
}

fn outcome_from_str(s: &str) -> TrackingOutcome {
    match s {
        "converged" => TrackingOutcome::Converged,
        "diverged" => TrackingOutcome::Diverged,
        "expired" => TrackingOutcome::Expired,
        _ => TrackingOutcome::Pending,
    }
}

fn position_status_str(s: PositionStatus) -> &'static str {
    s.as_str()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert_signal(&self, signal: &Signal) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signals
                (fingerprint, base_symbol, category, low_venue, high_venue,
                 buy_price, sell_price, spread_pct, executable_spread_pct, loss_pct,
                 max_entry_usd, exit_liquidity_usd, suggested_position_usd, fully_fillable,
                 fallback_signal, signal_type, strategy_type, status, rejection_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                signal.fingerprint,
                signal.base_symbol,
                category_str(signal.category),
                signal.low_venue,
                signal.high_venue,
                signal.buy_price,
                signal.sell_price,
                signal.spread_pct,
                signal.executable_spread_pct,
                signal.loss_pct,
                signal.max_entry_usd,
                signal.exit_liquidity_usd,
                signal.suggested_position_usd,
                signal.fully_fillable,
                signal.fallback_signal,
                signal.signal_type.as_str(),
                signal.strategy_type,
                status_str(signal.status),
                signal.rejection_reason,
                signal.created_at.to_rfc3339(),
            ],
        )
        .context("inserting signal")?;
        Ok(conn.last_insert_rowid())
    }

    async fn recent_signals(&self, limit: usize) -> anyhow::Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, fingerprint, base_symbol, category, low_venue, high_venue,
                    buy_price, sell_price, spread_pct, executable_spread_pct, loss_pct,
                    max_entry_usd, exit_liquidity_usd, suggested_position_usd, fully_fillable,
                    fallback_signal, signal_type, strategy_type, status, rejection_reason, created_at
             FROM signals ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(Signal {
                    id: Some(row.get(0)?),
                    fingerprint: row.get(1)?,
                    base_symbol: row.get(2)?,
                    category: category_from_str(&row.get::<_, String>(3)?),
                    low_venue: row.get(4)?,
                    high_venue: row.get(5)?,
                    buy_price: row.get(6)?,
                    sell_price: row.get(7)?,
                    spread_pct: row.get(8)?,
                    executable_spread_pct: row.get(9)?,
                    loss_pct: row.get(10)?,
                    max_entry_usd: row.get(11)?,
                    exit_liquidity_usd: row.get(12)?,
                    suggested_position_usd: row.get(13)?,
                    fully_fillable: row.get(14)?,
                    fallback_signal: row.get(15)?,
                    signal_type: SignalType::from_str(&row.get::<_, String>(16)?),
                    strategy_type: row.get(17)?,
                    status: status_from_str(&row.get::<_, String>(18)?),
                    rejection_reason: row.get(19)?,
                    created_at: parse_ts(&row.get::<_, String>(20)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn log_rejection(&self, entry: &ZScoreLogEntry) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO zscore_log
                (base_symbol, family, observed, mean, std_dev, accepted, corroborated, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.base_symbol,
                entry.family,
                entry.observed,
                entry.mean,
                entry.std_dev,
                entry.accepted as i64,
                entry.corroborated as i64,
                entry.ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn start_tracking(&self, tracking: &Tracking) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO spread_convergence
                (signal_id, started_at, last_checked_at, initial_spread_pct,
                 latest_spread_pct, min_spread_pct, max_spread_pct, checks_count,
                 outcome, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                tracking.signal_id,
                tracking.started_at.to_rfc3339(),
                tracking.last_checked_at.to_rfc3339(),
                tracking.initial_spread_pct,
                tracking.latest_spread_pct,
                tracking.min_spread_pct,
                tracking.max_spread_pct,
                tracking.checks_count as i64,
                outcome_str(tracking.outcome),
                tracking.closed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    async fn record_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO convergence_snapshots (signal_id, ts, spread_pct, low_price, high_price)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.signal_id,
                snapshot.ts.to_rfc3339(),
                snapshot.spread_pct,
                snapshot.low_price,
                snapshot.high_price,
            ],
        )?;
        Ok(())
    }

    async fn snapshots_for(&self, signal_id: i64) -> anyhow::Result<Vec<Snapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT signal_id, ts, spread_pct, low_price, high_price
             FROM convergence_snapshots WHERE signal_id = ?1 ORDER BY ts ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![signal_id], |row| {
                Ok(Snapshot {
                    signal_id: row.get(0)?,
                    ts: parse_ts(&row.get::<_, String>(1)?),
                    spread_pct: row.get(2)?,
                    low_price: row.get(3)?,
                    high_price: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn close_tracking(&self, tracking: &Tracking) -> anyhow::Result<()> {
        self.start_tracking(tracking).await
    }

    async fn get_tracking(&self, signal_id: i64) -> anyhow::Result<Option<Tracking>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT signal_id, started_at, last_checked_at, initial_spread_pct,
                    latest_spread_pct, min_spread_pct, max_spread_pct, checks_count,
                    outcome, closed_at
             FROM spread_convergence WHERE signal_id = ?1",
            params![signal_id],
            |row| {
                Ok(Tracking {
                    signal_id: row.get(0)?,
                    started_at: parse_ts(&row.get::<_, String>(1)?),
                    last_checked_at: parse_ts(&row.get::<_, String>(2)?),
                    initial_spread_pct: row.get(3)?,
                    latest_spread_pct: row.get(4)?,
                    min_spread_pct: row.get(5)?,
                    max_spread_pct: row.get(6)?,
                    checks_count: row.get::<_, i64>(7)? as u64,
                    outcome: outcome_from_str(&row.get::<_, String>(8)?),
                    closed_at: row.get::<_, Option<String>>(9)?.map(|s| parse_ts(&s)),
                })
            },
        )
        .optional()
        .context("fetching tracking")
    }

    async fn open_trackings(&self) -> anyhow::Result<Vec<Tracking>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT signal_id, started_at, last_checked_at, initial_spread_pct,
                    latest_spread_pct, min_spread_pct, max_spread_pct, checks_count,
                    outcome, closed_at
             FROM spread_convergence WHERE outcome = 'pending'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Tracking {
                    signal_id: row.get(0)?,
                    started_at: parse_ts(&row.get::<_, String>(1)?),
                    last_checked_at: parse_ts(&row.get::<_, String>(2)?),
                    initial_spread_pct: row.get(3)?,
                    latest_spread_pct: row.get(4)?,
                    min_spread_pct: row.get(5)?,
                    max_spread_pct: row.get(6)?,
                    checks_count: row.get::<_, i64>(7)? as u64,
                    outcome: outcome_from_str(&row.get::<_, String>(8)?),
                    closed_at: row.get::<_, Option<String>>(9)?.map(|s| parse_ts(&s)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn record_convergence_analysis(&self, analysis: &ConvergenceAnalysis) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO convergence_analysis
                (signal_id, initial_low_price, initial_high_price, final_low_price,
                 final_high_price, low_change_pct, high_change_pct, convergence_reason,
                 duration_minutes, snapshots_count, analyzed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                analysis.signal_id,
                analysis.initial_low_price,
                analysis.initial_high_price,
                analysis.final_low_price,
                analysis.final_high_price,
                analysis.low_change_pct,
                analysis.high_change_pct,
                analysis.convergence_reason.as_str(),
                analysis.duration_minutes,
                analysis.snapshots_count as i64,
                analysis.analyzed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn convergence_analysis_for(&self, signal_id: i64) -> anyhow::Result<Option<ConvergenceAnalysis>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT signal_id, initial_low_price, initial_high_price, final_low_price,
                    final_high_price, low_change_pct, high_change_pct, convergence_reason,
                    duration_minutes, snapshots_count, analyzed_at
             FROM convergence_analysis WHERE signal_id = ?1",
            params![signal_id],
            |row| {
                Ok(ConvergenceAnalysis {
                    signal_id: row.get(0)?,
                    initial_low_price: row.get(1)?,
                    initial_high_price: row.get(2)?,
                    final_low_price: row.get(3)?,
                    final_high_price: row.get(4)?,
                    low_change_pct: row.get(5)?,
                    high_change_pct: row.get(6)?,
                    convergence_reason: ConvergenceReason::from_str(&row.get::<_, String>(7)?),
                    duration_minutes: row.get(8)?,
                    snapshots_count: row.get::<_, i64>(9)? as u64,
                    analyzed_at: parse_ts(&row.get::<_, String>(10)?),
                })
            },
        )
        .optional()
        .context("fetching convergence analysis")
    }

    async fn merge_baseline_bucket(&self, bucket: &BaselineBucket) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        // Idempotent weighted merge: combining the same hour twice (e.g. a
        // retried flush) must not double-count samples. min/max merge as
        // running extremes rather than weighted averages.
        let existing: Option<(i64, f64, f64, f64, f64)> = conn
            .query_row(
                "SELECT sample_count, mean_pct, stddev_pct, min_pct, max_pct FROM spread_baseline
                 WHERE base_symbol = ?1 AND low_venue = ?2 AND high_venue = ?3 AND hour_start = ?4",
                params![
                    bucket.base_symbol,
                    bucket.low_venue,
                    bucket.high_venue,
                    bucket.hour_start.to_rfc3339()
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        let (merged_count, merged_mean, merged_stddev, merged_min, merged_max) = match existing {
            Some((prev_count, prev_mean, prev_stddev, prev_min, prev_max)) => {
                let total = prev_count + bucket.sample_count as i64;
                let weight_prev = prev_count as f64 / total as f64;
                let weight_new = bucket.sample_count as f64 / total as f64;
                let mean = prev_mean * weight_prev + bucket.mean_pct * weight_new;
                let stddev = prev_stddev * weight_prev + bucket.stddev_pct * weight_new;
                (
                    total,
                    mean,
                    stddev,
                    prev_min.min(bucket.min_pct),
                    prev_max.max(bucket.max_pct),
                )
            }
            None => (
                bucket.sample_count as i64,
                bucket.mean_pct,
                bucket.stddev_pct,
                bucket.min_pct,
                bucket.max_pct,
            ),
        };

        conn.execute(
            "INSERT INTO spread_baseline
                (base_symbol, low_venue, high_venue, hour_start, sample_count,
                 mean_pct, stddev_pct, min_pct, max_pct, p50_pct, p95_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(base_symbol, low_venue, high_venue, hour_start) DO UPDATE SET
                sample_count = excluded.sample_count,
                mean_pct = excluded.mean_pct,
                stddev_pct = excluded.stddev_pct,
                min_pct = excluded.min_pct,
                max_pct = excluded.max_pct,
                p50_pct = excluded.p50_pct,
                p95_pct = excluded.p95_pct",
            params![
                bucket.base_symbol,
                bucket.low_venue,
                bucket.high_venue,
                bucket.hour_start.to_rfc3339(),
                merged_count,
                merged_mean,
                merged_stddev,
                merged_min,
                merged_max,
                bucket.p50_pct,
                bucket.p95_pct,
            ],
        )?;
        Ok(())
    }

    async fn baseline_for(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
    ) -> anyhow::Result<Vec<BaselineBucket>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT base_symbol, low_venue, high_venue, hour_start, sample_count,
                    mean_pct, stddev_pct, min_pct, max_pct, p50_pct, p95_pct
             FROM spread_baseline
             WHERE base_symbol = ?1 AND low_venue = ?2 AND high_venue = ?3
             ORDER BY hour_start DESC",
        )?;
        let rows = stmt
            .query_map(params![base_symbol, low_venue, high_venue], |row| {
                Ok(BaselineBucket {
                    base_symbol: row.get(0)?,
                    low_venue: row.get(1)?,
                    high_venue: row.get(2)?,
                    hour_start: parse_ts(&row.get::<_, String>(3)?),
                    sample_count: row.get::<_, i64>(4)? as u64,
                    mean_pct: row.get(5)?,
                    stddev_pct: row.get(6)?,
                    min_pct: row.get(7)?,
                    max_pct: row.get(8)?,
                    p50_pct: row.get(9)?,
                    p95_pct: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn baseline_summary(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
        current_spread_pct: Option<f64>,
    ) -> anyhow::Result<BaselineSummary> {
        let buckets = self.baseline_for(base_symbol, low_venue, high_venue).await?;
        if buckets.is_empty() {
            return Ok(BaselineSummary {
                base_symbol: base_symbol.to_string(),
                low_venue: low_venue.to_string(),
                high_venue: high_venue.to_string(),
                bucket_count: 0,
                total_samples: 0,
                hours_covered: 0.0,
                has_sufficient_history: false,
                mean_pct: 0.0,
                p95_pct: 0.0,
                min_pct: 0.0,
                max_pct: 0.0,
                is_anomalous: false,
            });
        }

        let total_samples: u64 = buckets.iter().map(|b| b.sample_count).sum();
        let weighted_mean: f64 = buckets
            .iter()
            .map(|b| b.mean_pct * b.sample_count as f64)
            .sum::<f64>()
            / total_samples.max(1) as f64;
        let p95_pct = buckets.iter().map(|b| b.p95_pct).fold(f64::MIN, f64::max);
        let min_pct = buckets.iter().map(|b| b.min_pct).fold(f64::MAX, f64::min);
        let max_pct = buckets.iter().map(|b| b.max_pct).fold(f64::MIN, f64::max);
        let hours_covered = buckets.len() as f64;
        let has_sufficient_history = hours_covered >= 24.0;
        let is_anomalous = has_sufficient_history
            && current_spread_pct
                .map(|c| c > p95_pct * 1.5)
                .unwrap_or(false);

        Ok(BaselineSummary {
            base_symbol: base_symbol.to_string(),
            low_venue: low_venue.to_string(),
            high_venue: high_venue.to_string(),
            bucket_count: buckets.len() as u64,
            total_samples,
            hours_covered,
            has_sufficient_history,
            mean_pct: weighted_mean,
            p95_pct,
            min_pct,
            max_pct,
            is_anomalous,
        })
    }

    async fn recompute_pair_statistics(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
    ) -> anyhow::Result<PairStatistics> {
        let conn = self.conn.lock();
        let (total, converged, diverged, expired, avg_secs): (i64, i64, i64, i64, f64) = conn
            .query_row(
                "SELECT
                    COUNT(*),
                    SUM(CASE WHEN c.outcome = 'converged' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN c.outcome = 'diverged' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN c.outcome = 'expired' THEN 1 ELSE 0 END),
                    COALESCE(AVG(
                        CASE WHEN c.outcome = 'converged' AND c.closed_at IS NOT NULL
                        THEN (julianday(c.closed_at) - julianday(c.started_at)) * 86400.0
                        END
                    ), 0.0)
                 FROM signals s
                 JOIN spread_convergence c ON c.signal_id = s.id
                 WHERE s.base_symbol = ?1 AND s.low_venue = ?2 AND s.high_venue = ?3
                   AND c.outcome != 'pending'",
                params![base_symbol, low_venue, high_venue],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        row.get(4)?,
                    ))
                },
            )?;

        let stats = PairStatistics {
            base_symbol: base_symbol.to_string(),
            low_venue: low_venue.to_string(),
            high_venue: high_venue.to_string(),
            total_signals: total as u64,
            converged: converged as u64,
            diverged: diverged as u64,
            expired: expired as u64,
            avg_time_to_converge_secs: avg_secs,
        };

        conn.execute(
            "INSERT INTO pair_statistics
                (base_symbol, low_venue, high_venue, total_signals, converged,
                 diverged, expired, avg_time_to_converge_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(base_symbol, low_venue, high_venue) DO UPDATE SET
                total_signals = excluded.total_signals,
                converged = excluded.converged,
                diverged = excluded.diverged,
                expired = excluded.expired,
                avg_time_to_converge_secs = excluded.avg_time_to_converge_secs",
            params![
                stats.base_symbol,
                stats.low_venue,
                stats.high_venue,
                stats.total_signals as i64,
                stats.converged as i64,
                stats.diverged as i64,
                stats.expired as i64,
                stats.avg_time_to_converge_secs,
            ],
        )?;

        Ok(stats)
    }

    async fn pair_statistics(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
    ) -> anyhow::Result<Option<PairStatistics>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT base_symbol, low_venue, high_venue, total_signals, converged,
                    diverged, expired, avg_time_to_converge_secs
             FROM pair_statistics
             WHERE base_symbol = ?1 AND low_venue = ?2 AND high_venue = ?3",
            params![base_symbol, low_venue, high_venue],
            |row| {
                Ok(PairStatistics {
                    base_symbol: row.get(0)?,
                    low_venue: row.get(1)?,
                    high_venue: row.get(2)?,
                    total_signals: row.get::<_, i64>(3)? as u64,
                    converged: row.get::<_, i64>(4)? as u64,
                    diverged: row.get::<_, i64>(5)? as u64,
                    expired: row.get::<_, i64>(6)? as u64,
                    avg_time_to_converge_secs: row.get(7)?,
                })
            },
        )
        .optional()
        .context("fetching pair statistics")
    }

    async fn record_trade_result(&self, result: &TradeResult) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trade_results (signal_id, pnl_pct, hold_hours, notes, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.signal_id,
                result.pnl_pct,
                result.hold_hours,
                result.notes,
                result.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn log_spread(&self, entry: &SpreadLogEntry) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO spread_log
                (ts, base_symbol, strategy_type, low_venue, high_venue, low_price, high_price,
                 spread_pct, net_spread_pct, liquidity_usd, passed_validation, rejection_reason,
                 signal_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.ts.to_rfc3339(),
                entry.base_symbol,
                entry.strategy_type,
                entry.low_venue,
                entry.high_venue,
                entry.low_price,
                entry.high_price,
                entry.spread_pct,
                entry.net_spread_pct,
                entry.liquidity_usd,
                entry.passed_validation,
                entry.rejection_reason,
                entry.signal_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn upsert_position(&self, entry: &PositionEntry) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        match entry.id {
            Some(id) => {
                conn.execute(
                    "UPDATE position_tracking SET
                        current_spread_pct = ?1, status = ?2, notified_at = ?3,
                        closed_at = ?4, telegram_msg_id = ?5
                     WHERE id = ?6",
                    params![
                        entry.current_spread_pct,
                        position_status_str(entry.status),
                        entry.notified_at.map(|t| t.to_rfc3339()),
                        entry.closed_at.map(|t| t.to_rfc3339()),
                        entry.telegram_msg_id,
                        id,
                    ],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO position_tracking
                        (signal_id, user_id, base_symbol, low_venue, high_venue,
                         entry_spread_pct, target_spread_pct, current_spread_pct, status,
                         entered_at, notified_at, closed_at, telegram_msg_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        entry.signal_id,
                        entry.user_id,
                        entry.base_symbol,
                        entry.low_venue,
                        entry.high_venue,
                        entry.entry_spread_pct,
                        entry.target_spread_pct,
                        entry.current_spread_pct,
                        position_status_str(entry.status),
                        entry.entered_at.to_rfc3339(),
                        entry.notified_at.map(|t| t.to_rfc3339()),
                        entry.closed_at.map(|t| t.to_rfc3339()),
                        entry.telegram_msg_id,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    async fn open_positions(&self) -> anyhow::Result<Vec<PositionEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, signal_id, user_id, base_symbol, low_venue, high_venue,
                    entry_spread_pct, target_spread_pct, current_spread_pct, status,
                    entered_at, notified_at, closed_at, telegram_msg_id
             FROM position_tracking WHERE status = 'tracking'",
        )?;
        let rows = stmt
            .query_map([], position_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn positions_for_user(&self, user_id: &str) -> anyhow::Result<Vec<PositionEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, signal_id, user_id, base_symbol, low_venue, high_venue,
                    entry_spread_pct, target_spread_pct, current_spread_pct, status,
                    entered_at, notified_at, closed_at, telegram_msg_id
             FROM position_tracking WHERE user_id = ?1 ORDER BY entered_at DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id], position_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn position_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<PositionEntry> {
    Ok(PositionEntry {
        id: Some(row.get(0)?),
        signal_id: row.get(1)?,
        user_id: row.get(2)?,
        base_symbol: row.get(3)?,
        low_venue: row.get(4)?,
        high_venue: row.get(5)?,
        entry_spread_pct: row.get(6)?,
        target_spread_pct: row.get(7)?,
        current_spread_pct: row.get(8)?,
        status: PositionStatus::from_str(&row.get::<_, String>(9)?),
        entered_at: parse_ts(&row.get::<_, String>(10)?),
        notified_at: row.get::<_, Option<String>>(11)?.map(|s| parse_ts(&s)),
        closed_at: row.get::<_, Option<String>>(12)?.map(|s| parse_ts(&s)),
        telegram_msg_id: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_signal() -> Signal {
        Signal::new(
            "BTC".into(),
            Category::Layer1,
            "binance".into(),
            "okx".into(),
            0.5,
            0.4,
            12_000.0,
        )
    }

    #[tokio::test]
    async fn insert_and_read_back_signal() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert_signal(&sample_signal()).await.unwrap();
        assert!(id > 0);
        let recent = store.recent_signals(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].base_symbol, "BTC");
        assert_eq!(recent[0].signal_type.as_str(), "auto");
    }

    #[tokio::test]
    async fn baseline_merge_is_weighted_and_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let hour = Utc::now();
        let bucket = BaselineBucket {
            base_symbol: "ETH".into(),
            low_venue: "binance".into(),
            high_venue: "okx".into(),
            hour_start: hour,
            sample_count: 10,
            mean_pct: 0.2,
            stddev_pct: 0.05,
            min_pct: 0.1,
            max_pct: 0.4,
            p50_pct: 0.18,
            p95_pct: 0.38,
        };
        store.merge_baseline_bucket(&bucket).await.unwrap();
        store.merge_baseline_bucket(&bucket).await.unwrap();

        let rows = store.baseline_for("ETH", "binance", "okx").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample_count, 20);
        assert!((rows[0].mean_pct - 0.2).abs() < 1e-9);
        assert!((rows[0].min_pct - 0.1).abs() < 1e-9);
        assert!((rows[0].max_pct - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn baseline_summary_requires_24_hourly_buckets() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        for i in 0..5 {
            let bucket = BaselineBucket {
                base_symbol: "ETH".into(),
                low_venue: "binance".into(),
                high_venue: "okx".into(),
                hour_start: now - chrono::Duration::hours(i),
                sample_count: 10,
                mean_pct: 0.2,
                stddev_pct: 0.05,
                min_pct: 0.1,
                max_pct: 0.4,
                p50_pct: 0.18,
                p95_pct: 0.3,
            };
            store.merge_baseline_bucket(&bucket).await.unwrap();
        }
        let summary = store
            .baseline_summary("ETH", "binance", "okx", Some(1.0))
            .await
            .unwrap();
        assert!(!summary.has_sufficient_history);
        assert!(!summary.is_anomalous);
    }

    #[tokio::test]
    async fn pair_statistics_recompute_counts_outcomes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let signal = sample_signal();
        let id = store.insert_signal(&signal).await.unwrap();

        let now = Utc::now();
        store
            .start_tracking(&Tracking {
                signal_id: id,
                started_at: now,
                last_checked_at: now,
                initial_spread_pct: 0.5,
                latest_spread_pct: 0.1,
                min_spread_pct: 0.1,
                max_spread_pct: 0.5,
                checks_count: 3,
                outcome: TrackingOutcome::Converged,
                closed_at: Some(now + chrono::Duration::minutes(5)),
            })
            .await
            .unwrap();

        let stats = store
            .recompute_pair_statistics("BTC", "binance", "okx")
            .await
            .unwrap();
        assert_eq!(stats.total_signals, 1);
        assert_eq!(stats.converged, 1);
        assert!(stats.success_rate() > 0.99);
    }

    #[tokio::test]
    async fn position_entry_round_trips_through_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let signal = sample_signal();
        let signal_id = store.insert_signal(&signal).await.unwrap();

        let mut entry = PositionEntry::new(
            signal_id,
            "user-1".into(),
            "BTC".into(),
            "binance".into(),
            "okx".into(),
            0.5,
            None,
        );
        let id = store.upsert_position(&entry).await.unwrap();
        entry.id = Some(id);

        let open = store.open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].user_id, "user-1");

        entry.status = PositionStatus::Closed;
        entry.closed_at = Some(Utc::now());
        store.upsert_position(&entry).await.unwrap();

        let open_after_close = store.open_positions().await.unwrap();
        assert!(open_after_close.is_empty());

        let for_user = store.positions_for_user("user-1").await.unwrap();
        assert_eq!(for_user.len(), 1);
    }

    #[tokio::test]
    async fn convergence_analysis_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let signal = sample_signal();
        let signal_id = store.insert_signal(&signal).await.unwrap();

        let analysis = ConvergenceAnalysis {
            signal_id,
            initial_low_price: 100.0,
            initial_high_price: 102.0,
            final_low_price: 101.5,
            final_high_price: 101.6,
            low_change_pct: 1.5,
            high_change_pct: -0.4,
            convergence_reason: ConvergenceReason::BuyUp,
            duration_minutes: 12.0,
            snapshots_count: 4,
            analyzed_at: Utc::now(),
        };
        store.record_convergence_analysis(&analysis).await.unwrap();

        let fetched = store.convergence_analysis_for(signal_id).await.unwrap().unwrap();
        assert_eq!(fetched.convergence_reason, ConvergenceReason::BuyUp);
        assert!((fetched.low_change_pct - 1.5).abs() < 1e-9);
        assert_eq!(fetched.snapshots_count, 4);
    }
}
