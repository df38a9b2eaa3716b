//! Core data model: venues, tickers, quotes, spreads, signals, tracking,
//! baseline buckets and pair statistics, plus the process-wide `Config`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of trading venue. Determines which `VenueAdapter` impl serves it
/// and how its order book is shaped (CLOB snapshot vs. synthesized depth).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueKind {
    CexSpot,
    CexFutures,
    PerpDex,
    DexSpot,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Venue {
    pub id: String,
    pub kind: VenueKind,
    pub display_name: String,
    pub taker_fee_bps: u32,
    /// Chain identifier for on-chain venues (e.g. `"ethereum"`, `"solana"`).
    /// `None` for centralized venues.
    pub chain: Option<String>,
    /// Contract address of the traded token on `chain`. `None` for
    /// centralized venues or when the adapter hasn't resolved it yet.
    pub token_address: Option<String>,
}

/// A tradable pair on a venue, keyed by its normalized base symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticker {
    pub venue_id: String,
    pub symbol: String,
    pub base_symbol: String,
    pub category: Category,
    /// `true` when this ticker's base-symbol normalization was inferred by
    /// `symbol::base_symbol` rather than confirmed against an explicit
    /// operator-maintained mapping.
    pub auto: bool,
    pub valid: bool,
    pub validation_errors: Vec<String>,
}

/// Coarse asset taxonomy used for grouping related signals. `Unknown` is
/// the required default — an unrecognized symbol must never panic the
/// qualifier, it just can't be grouped with anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Layer1,
    Layer2,
    Defi,
    Meme,
    Stable,
    Unknown,
}

impl Default for Category {
    fn default() -> Self {
        Category::Unknown
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub ts: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn is_crossed(&self) -> bool {
        self.bid >= self.ask
    }
}

/// A transient pairwise spread, produced by SpreadEngine and consumed by
/// OrderBookAnalyzer. Never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spread {
    pub base_symbol: String,
    pub low_venue: String,
    pub high_venue: String,
    pub low_quote: Quote,
    pub high_quote: Quote,
    pub spread_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Open,
    Converged,
    Diverged,
    Expired,
}

/// How a signal came to exist. `Auto` is the steady-state path (both books
/// walked successfully); `Fallback` is a quote-only candidate produced
/// when depth wasn't fetchable; `Lagging`/`Manual`/`Invalid` are reserved
/// for signal sources this crate doesn't originate itself but that the
/// qualifier's type gate still has to recognize and be able to disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Auto,
    Manual,
    Lagging,
    Fallback,
    Invalid,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Auto => "auto",
            SignalType::Manual => "manual",
            SignalType::Lagging => "lagging",
            SignalType::Fallback => "fallback",
            SignalType::Invalid => "invalid",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "manual" => SignalType::Manual,
            "lagging" => SignalType::Lagging,
            "fallback" => SignalType::Fallback,
            "invalid" => SignalType::Invalid,
            _ => SignalType::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Option<i64>,
    pub fingerprint: String,
    pub base_symbol: String,
    pub category: Category,
    pub low_venue: String,
    pub high_venue: String,
    /// Executable buy price on `low_venue`. Zero when the signal was built
    /// from a bare `Signal::new` test constructor rather than a walked book.
    pub buy_price: f64,
    /// Executable sell price on `high_venue`.
    pub sell_price: f64,
    /// Nominal (quote mid-to-mid) spread, before walking either book.
    pub spread_pct: f64,
    /// Real, executable spread after walking both books and netting fees.
    pub executable_spread_pct: f64,
    /// `spread_pct - executable_spread_pct`, floored at zero: how much of
    /// the nominal spread is given up to slippage and fees.
    pub loss_pct: f64,
    /// Size, in USD, the books support filling at `max_slippage_pct`.
    pub max_entry_usd: f64,
    /// Resting liquidity on the exit side once the entry leg fills.
    pub exit_liquidity_usd: f64,
    /// `min(max_entry_usd, 0.5 * exit_liquidity_usd, hard cap)`, rounded to
    /// the nearest dollar — the position size actually recommended.
    pub suggested_position_usd: f64,
    /// `true` when both legs were confirmed fillable by walking real depth
    /// (as opposed to a fallback candidate built from quotes alone).
    pub fully_fillable: bool,
    /// `true` when this signal was built from `OrderBookAnalyzer::fallback`
    /// (neither venue's depth was fetchable) rather than a walked book —
    /// `max_entry_usd` is a conservative cap, not a real fill estimate.
    pub fallback_signal: bool,
    pub signal_type: SignalType,
    pub strategy_type: String,
    pub status: SignalStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        base_symbol: String,
        category: Category,
        low_venue: String,
        high_venue: String,
        spread_pct: f64,
        executable_spread_pct: f64,
        max_entry_usd: f64,
    ) -> Self {
        Self::new_with_fallback(
            base_symbol,
            category,
            low_venue,
            high_venue,
            spread_pct,
            executable_spread_pct,
            max_entry_usd,
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_with_fallback(
        base_symbol: String,
        category: Category,
        low_venue: String,
        high_venue: String,
        spread_pct: f64,
        executable_spread_pct: f64,
        max_entry_usd: f64,
        fallback_signal: bool,
    ) -> Self {
        let fingerprint = format!(
            "{}:{}:{}:{}",
            base_symbol,
            low_venue,
            high_venue,
            (spread_pct * 1000.0).round() as i64
        );
        Self {
            id: None,
            fingerprint,
            base_symbol,
            category,
            low_venue,
            high_venue,
            buy_price: 0.0,
            sell_price: 0.0,
            spread_pct,
            executable_spread_pct,
            loss_pct: (spread_pct - executable_spread_pct).max(0.0),
            max_entry_usd,
            exit_liquidity_usd: 0.0,
            suggested_position_usd: max_entry_usd,
            fully_fillable: !fallback_signal,
            fallback_signal,
            signal_type: if fallback_signal {
                SignalType::Fallback
            } else {
                SignalType::Auto
            },
            strategy_type: "cross_venue_spot".to_string(),
            status: SignalStatus::Open,
            rejection_reason: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingOutcome {
    Pending,
    Converged,
    Diverged,
    Expired,
}

/// Follows one emitted `Signal` across time, sampling its spread at an
/// adaptive interval until it converges, diverges, or expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracking {
    pub signal_id: i64,
    pub started_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    pub initial_spread_pct: f64,
    pub latest_spread_pct: f64,
    /// Lowest spread_pct observed across every check so far.
    pub min_spread_pct: f64,
    /// Highest spread_pct observed across every check so far.
    pub max_spread_pct: f64,
    /// Number of polling passes that have sampled this tracking,
    /// monotonically increasing for the life of the tracking.
    pub checks_count: u64,
    pub outcome: TrackingOutcome,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Tracking {
    /// Fold one new sample into the running min/max/count, returning the
    /// updated values. Kept as a free function on the model so both the
    /// live poller and tests exercise the same bookkeeping.
    pub fn observe(&mut self, spread_pct: f64) {
        self.min_spread_pct = self.min_spread_pct.min(spread_pct);
        self.max_spread_pct = self.max_spread_pct.max(spread_pct);
        self.checks_count += 1;
        self.latest_spread_pct = spread_pct;
    }
}

/// One point-in-time observation recorded while a tracking is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub signal_id: i64,
    pub ts: DateTime<Utc>,
    pub spread_pct: f64,
    /// Mid price on the low venue at the time of this sample, used by the
    /// convergence analyzer to classify which side moved.
    pub low_price: f64,
    pub high_price: f64,
}

/// Which side of a closed tracking moved to produce the convergence,
/// derived by comparing the first and last recorded snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceReason {
    /// The low-venue (buy) side rose to meet the high-venue side.
    BuyUp,
    /// The high-venue (sell) side dropped to meet the low-venue side.
    SellDown,
    /// Both sides moved meaningfully toward each other.
    Both,
    /// Depth dropped sharply on either side within a short window —
    /// consistent with another actor having already arbitraged the gap.
    ArbActivity,
    /// Neither side moved enough to explain the convergence.
    Unknown,
}

impl ConvergenceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvergenceReason::BuyUp => "buy_up",
            ConvergenceReason::SellDown => "sell_down",
            ConvergenceReason::Both => "both",
            ConvergenceReason::ArbActivity => "arb_activity",
            ConvergenceReason::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "buy_up" => ConvergenceReason::BuyUp,
            "sell_down" => ConvergenceReason::SellDown,
            "both" => ConvergenceReason::Both,
            "arb_activity" => ConvergenceReason::ArbActivity,
            _ => ConvergenceReason::Unknown,
        }
    }
}

/// C8.A's verdict on a closed tracking: which side moved, by how much, and
/// over what window. One row per closed tracking, keyed by signal_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceAnalysis {
    pub signal_id: i64,
    pub initial_low_price: f64,
    pub initial_high_price: f64,
    pub final_low_price: f64,
    pub final_high_price: f64,
    pub low_change_pct: f64,
    pub high_change_pct: f64,
    pub convergence_reason: ConvergenceReason,
    pub duration_minutes: f64,
    pub snapshots_count: u64,
    pub analyzed_at: DateTime<Utc>,
}

/// An hourly rollup bucket for a (venue-pair, symbol)'s spread distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineBucket {
    pub base_symbol: String,
    pub low_venue: String,
    pub high_venue: String,
    pub hour_start: DateTime<Utc>,
    pub sample_count: u64,
    pub mean_pct: f64,
    pub stddev_pct: f64,
    pub min_pct: f64,
    pub max_pct: f64,
    pub p50_pct: f64,
    pub p95_pct: f64,
}

/// Read-side view over a pair's recent baseline history: whether there's
/// enough data to trust it, and whether the current reading is anomalous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineSummary {
    pub base_symbol: String,
    pub low_venue: String,
    pub high_venue: String,
    pub bucket_count: u64,
    pub total_samples: u64,
    pub hours_covered: f64,
    /// `true` once at least 24h of hourly buckets have been observed —
    /// below that, an anomaly verdict isn't trustworthy yet.
    pub has_sufficient_history: bool,
    pub mean_pct: f64,
    pub p95_pct: f64,
    pub min_pct: f64,
    pub max_pct: f64,
    /// `current_spread_pct > p95_pct * 1.5`, only meaningful when
    /// `has_sufficient_history` is true.
    pub is_anomalous: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairStatistics {
    pub base_symbol: String,
    pub low_venue: String,
    pub high_venue: String,
    pub total_signals: u64,
    pub converged: u64,
    pub diverged: u64,
    pub expired: u64,
    pub avg_time_to_converge_secs: f64,
}

impl PairStatistics {
    pub fn success_rate(&self) -> f64 {
        if self.total_signals == 0 {
            0.0
        } else {
            self.converged as f64 / self.total_signals as f64
        }
    }
}

/// Optional caller-recorded outcome of following a signal manually.
/// Supplements PositionTracker: attached after a tracking closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub signal_id: i64,
    pub pnl_pct: f64,
    pub hold_hours: f64,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Audit row for the z-score outlier gate in the SignalQualifier, one per
/// accept/reject decision. Supplements the qualifier with a durable trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZScoreLogEntry {
    pub base_symbol: String,
    pub family: String,
    pub observed: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub accepted: bool,
    pub corroborated: bool,
    pub ts: DateTime<Utc>,
}

/// One row per spread computation, kept whether or not it ever became a
/// signal — the audit trail the qualifier's rejections are otherwise
/// invisible in (`passed_validation = false` covers the token-mismatch and
/// liquidity-gate rejections that never reach the qualifier at all).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadLogEntry {
    pub id: Option<i64>,
    pub ts: DateTime<Utc>,
    pub base_symbol: String,
    pub strategy_type: String,
    pub low_venue: String,
    pub high_venue: String,
    pub low_price: f64,
    pub high_price: f64,
    pub spread_pct: f64,
    pub net_spread_pct: f64,
    pub liquidity_usd: f64,
    pub passed_validation: bool,
    pub rejection_reason: Option<String>,
    pub signal_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Tracking,
    Notified,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Tracking => "tracking",
            PositionStatus::Notified => "notified",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "notified" => PositionStatus::Notified,
            "closed" => PositionStatus::Closed,
            _ => PositionStatus::Tracking,
        }
    }
}

/// An operator's explicit "I entered this" bookmark on a signal (C11):
/// one row per user per position, watched until the spread closes to the
/// target and a single notification fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub id: Option<i64>,
    pub signal_id: i64,
    pub user_id: String,
    pub base_symbol: String,
    pub low_venue: String,
    pub high_venue: String,
    pub entry_spread_pct: f64,
    pub target_spread_pct: f64,
    pub current_spread_pct: f64,
    pub status: PositionStatus,
    pub entered_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub telegram_msg_id: Option<String>,
}

impl PositionEntry {
    /// `target_spread_pct` defaults to half the entry spread when the
    /// caller doesn't name one explicitly.
    pub fn new(
        signal_id: i64,
        user_id: String,
        base_symbol: String,
        low_venue: String,
        high_venue: String,
        entry_spread_pct: f64,
        target_spread_pct: Option<f64>,
    ) -> Self {
        Self {
            id: None,
            signal_id,
            user_id,
            base_symbol,
            low_venue,
            high_venue,
            entry_spread_pct,
            target_spread_pct: target_spread_pct.unwrap_or(entry_spread_pct / 2.0),
            current_spread_pct: entry_spread_pct,
            status: PositionStatus::Tracking,
            entered_at: Utc::now(),
            notified_at: None,
            closed_at: None,
            telegram_msg_id: None,
        }
    }
}

/// Process-wide configuration, loaded once at startup from the environment
/// (and overlaid at runtime by the `settings:config` KV hash for the
/// tunables that support hot reload).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub redis_url: String,
    pub port: u16,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub min_spread_pct: f64,
    pub min_liquidity_usd: f64,
    pub min_dex_liquidity_usd: f64,
    pub cooldown_secs: u64,
    pub price_poll_interval: Duration,
    pub orderbook_queue_capacity: usize,
    pub signals_queue_capacity: usize,
    pub orderbook_worker_count: usize,
    pub zscore_threshold: f64,
    pub stale_data_secs: u64,
    pub max_signal_age_secs: u64,
    pub token_mismatch_ratio: f64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./observatory.db".to_string());

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8090".to_string())
            .parse()
            .unwrap_or(8090);

        let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        let telegram_chat_id = std::env::var("TELEGRAM_CHAT_ID").ok();

        let min_spread_pct = std::env::var("MIN_SPREAD_PCT")
            .unwrap_or_else(|_| "0.3".to_string())
            .parse()
            .unwrap_or(0.3);

        let min_liquidity_usd = std::env::var("MIN_LIQUIDITY_USD")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000.0);

        let min_dex_liquidity_usd = std::env::var("MIN_DEX_LIQUIDITY_USD")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .unwrap_or(2000.0);

        let cooldown_secs = std::env::var("SIGNAL_COOLDOWN_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let price_poll_secs: u64 = std::env::var("PRICE_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .unwrap_or(2);

        let orderbook_queue_capacity = std::env::var("ORDERBOOK_QUEUE_CAPACITY")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000);

        let signals_queue_capacity = std::env::var("SIGNALS_QUEUE_CAPACITY")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .unwrap_or(500);

        let orderbook_worker_count = std::env::var("ORDERBOOK_WORKER_COUNT")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .unwrap_or(4);

        let zscore_threshold = std::env::var("ZSCORE_THRESHOLD")
            .unwrap_or_else(|_| "4.0".to_string())
            .parse()
            .unwrap_or(4.0);

        let stale_data_secs = std::env::var("STALE_DATA_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let max_signal_age_secs = std::env::var("MAX_SIGNAL_AGE_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let token_mismatch_ratio = std::env::var("TOKEN_MISMATCH_RATIO")
            .unwrap_or_else(|_| "10.0".to_string())
            .parse()
            .unwrap_or(10.0);

        Ok(Self {
            database_path,
            redis_url,
            port,
            telegram_bot_token,
            telegram_chat_id,
            min_spread_pct,
            min_liquidity_usd,
            min_dex_liquidity_usd,
            cooldown_secs,
            price_poll_interval: Duration::from_secs(price_poll_secs),
            orderbook_queue_capacity,
            signals_queue_capacity,
            orderbook_worker_count,
            zscore_threshold,
            stale_data_secs,
            max_signal_age_secs,
            token_mismatch_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_fingerprint_is_stable_for_equal_inputs() {
        let a = Signal::new(
            "BTC".into(),
            Category::Layer1,
            "binance".into(),
            "okx".into(),
            0.42,
            0.38,
            10_000.0,
        );
        let b = Signal::new(
            "BTC".into(),
            Category::Layer1,
            "binance".into(),
            "okx".into(),
            0.42,
            0.10,
            999.0,
        );
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn category_defaults_to_unknown() {
        assert_eq!(Category::default(), Category::Unknown);
    }

    #[test]
    fn pair_statistics_success_rate_handles_zero_signals() {
        let stats = PairStatistics::default();
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[test]
    fn tracking_observe_tracks_running_min_max_and_count() {
        let mut tracking = Tracking {
            signal_id: 1,
            started_at: Utc::now(),
            last_checked_at: Utc::now(),
            initial_spread_pct: 0.5,
            latest_spread_pct: 0.5,
            min_spread_pct: 0.5,
            max_spread_pct: 0.5,
            checks_count: 0,
            outcome: TrackingOutcome::Pending,
            closed_at: None,
        };
        tracking.observe(0.8);
        tracking.observe(0.2);
        assert_eq!(tracking.checks_count, 2);
        assert!((tracking.min_spread_pct - 0.2).abs() < 1e-9);
        assert!((tracking.max_spread_pct - 0.8).abs() < 1e-9);
    }

    #[test]
    fn position_entry_defaults_target_to_half_entry_spread() {
        let entry = PositionEntry::new(
            1,
            "user-1".into(),
            "BTC".into(),
            "binance".into(),
            "okx".into(),
            2.0,
            None,
        );
        assert!((entry.target_spread_pct - 1.0).abs() < 1e-9);
    }
}
