//! SignalQualifier (C6): the last gate before a candidate spread becomes a
//! persisted `Signal` — safety predicates, cooldown, blacklist, minimum
//! spread floor, grouping of same-symbol candidates down to one primary
//! signal, and a z-score outlier check requiring corroboration for
//! extreme readings.
//!
//! The outlier gate is a Welford online mean/variance tracker per family
//! (here, asset `Category`) feeding a z-score test, with a corroboration
//! requirement before an extreme reading is trusted rather than dropped
//! as noise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::analyzer::ExecutableSpread;
use crate::kv::KvStore;
use crate::models::{Category, Signal, ZScoreLogEntry};
use crate::storage::DurableStore;

/// Alternative candidates kept alongside the primary when several pairs
/// for the same base symbol qualify in the same tick.
const MAX_ALTERNATIVES: usize = 4;
const PROCESSED_TTL_SECS: u64 = 60;

/// Welford's online algorithm: mean and variance in one pass, no history
/// buffer required.
#[derive(Debug, Clone, Default)]
struct RollingStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RollingStats {
    fn update(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    /// z-score of `x` against the distribution observed so far. `None`
    /// until there's enough history to say anything meaningful.
    fn zscore(&self, x: f64) -> Option<f64> {
        if self.count < 5 {
            return None;
        }
        let sd = self.std_dev();
        if sd <= f64::EPSILON {
            None
        } else {
            Some((x - self.mean) / sd)
        }
    }
}

pub enum QualifyOutcome {
    Accepted(Signal),
    Rejected { reason: String },
}

pub struct SignalQualifier {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn DurableStore>,
    min_spread_pct: f64,
    cooldown: Duration,
    zscore_threshold: f64,
    max_signal_age_secs: u64,
    family_stats: Mutex<HashMap<Category, RollingStats>>,
}

impl SignalQualifier {
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn DurableStore>,
        min_spread_pct: f64,
        cooldown: Duration,
        zscore_threshold: f64,
        max_signal_age_secs: u64,
    ) -> Self {
        Self {
            kv,
            store,
            min_spread_pct,
            cooldown,
            zscore_threshold,
            max_signal_age_secs,
            family_stats: Mutex::new(HashMap::new()),
        }
    }

    /// Qualify every candidate sharing a base symbol together: the
    /// richest executable spread becomes the primary candidate and runs
    /// the full gate; the rest are kept only as logged alternatives (up
    /// to [`MAX_ALTERNATIVES`]) so one busy symbol can't fire a
    /// notification per venue pair in the same tick.
    pub async fn qualify_group(
        &self,
        mut candidates: Vec<ExecutableSpread>,
        category: Category,
    ) -> anyhow::Result<QualifyOutcome> {
        candidates.sort_by(|a, b| {
            b.executable_spread_pct
                .partial_cmp(&a.executable_spread_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let Some(primary) = candidates.first().cloned() else {
            return Ok(self.reject("no candidates in group"));
        };

        for alt in candidates.iter().skip(1).take(MAX_ALTERNATIVES) {
            debug!(
                base = %alt.base_symbol,
                low = %alt.low_venue,
                high = %alt.high_venue,
                spread = alt.executable_spread_pct,
                "alternative candidate logged, not qualified"
            );
        }

        self.qualify(&primary, category).await
    }

    pub async fn qualify(
        &self,
        candidate: &ExecutableSpread,
        category: Category,
    ) -> anyhow::Result<QualifyOutcome> {
        if !self.claim_unprocessed(candidate).await? {
            return Ok(self.reject("candidate already processed"));
        }

        if let Some(reason) = self.safety_violation(candidate) {
            warn!(
                error = %crate::errors::ObservatoryError::SafetyRejection {
                    base_symbol: candidate.base_symbol.clone(),
                    low_venue: candidate.low_venue.clone(),
                    high_venue: candidate.high_venue.clone(),
                    reason: reason.clone(),
                },
                "signal rejected on a safety predicate"
            );
            return Ok(self.reject(&reason));
        }

        if candidate.executable_spread_pct < self.min_spread_pct {
            return Ok(self.reject("below minimum spread floor"));
        }

        if self.is_blacklisted(&candidate.base_symbol).await? {
            return Ok(self.reject("base symbol is blacklisted"));
        }

        if !self.pass_cooldown(candidate).await? {
            return Ok(self.reject("cooldown active for this pair"));
        }

        let (zscore, mean, std_dev) = {
            let mut stats = self.family_stats.lock();
            let entry = stats.entry(category).or_default();
            let z = entry.zscore(candidate.executable_spread_pct);
            let (mean, sd) = (entry.mean, entry.std_dev());
            entry.update(candidate.executable_spread_pct);
            (z, mean, sd)
        };

        let is_outlier = zscore.map(|z| z.abs() > self.zscore_threshold).unwrap_or(false);
        if is_outlier {
            let corroborated = self.corroborated(candidate).await?;
            let entry = ZScoreLogEntry {
                base_symbol: candidate.base_symbol.clone(),
                family: format!("{category:?}"),
                observed: candidate.executable_spread_pct,
                mean,
                std_dev,
                accepted: corroborated,
                corroborated,
                ts: chrono::Utc::now(),
            };
            self.store.log_rejection(&entry).await?;

            if !corroborated {
                warn!(
                    base = %candidate.base_symbol,
                    z = zscore,
                    "rejecting uncorroborated z-score outlier"
                );
                return Ok(self.reject("uncorroborated statistical outlier"));
            }
        }

        let mut signal = Signal::new_with_fallback(
            candidate.base_symbol.clone(),
            category,
            candidate.low_venue.clone(),
            candidate.high_venue.clone(),
            candidate.nominal_spread_pct,
            candidate.executable_spread_pct,
            candidate.max_entry_usd,
            candidate.fallback_signal,
        );
        signal.buy_price = candidate.buy_price;
        signal.sell_price = candidate.sell_price;
        signal.loss_pct = candidate.loss_pct;
        signal.exit_liquidity_usd = candidate.exit_liquidity_usd;
        signal.suggested_position_usd = candidate.suggested_position_usd;
        signal.fully_fillable = candidate.fully_fillable;

        debug!(base = %signal.base_symbol, spread = signal.executable_spread_pct, "signal qualified");
        Ok(QualifyOutcome::Accepted(signal))
    }

    fn reject(&self, reason: &str) -> QualifyOutcome {
        QualifyOutcome::Rejected {
            reason: reason.to_string(),
        }
    }

    /// Rejects stale candidates, non-finite or crossed prices, and a
    /// position sized past what its own exit liquidity supports. A
    /// fallback candidate (no walked book) is held to a tighter spread
    /// ceiling since it can't rule out a quote glitch the way a walked
    /// book can.
    fn safety_violation(&self, candidate: &ExecutableSpread) -> Option<String> {
        if !candidate.is_within_max_age(self.max_signal_age_secs, Utc::now()) {
            return Some("candidate older than max signal age".to_string());
        }
        if !candidate.buy_price.is_finite()
            || !candidate.sell_price.is_finite()
            || candidate.buy_price <= 0.0
            || candidate.sell_price <= 0.0
        {
            return Some("non-finite or non-positive leg price".to_string());
        }
        if candidate.buy_price >= candidate.sell_price {
            return Some("buy leg is not cheaper than sell leg".to_string());
        }
        if candidate.fully_fillable && candidate.suggested_position_usd > candidate.exit_liquidity_usd {
            return Some("suggested position exceeds exit liquidity".to_string());
        }
        if !candidate.fully_fillable && candidate.nominal_spread_pct > self.min_spread_pct * 10.0 {
            return Some("fallback candidate spread implausibly large for an unconfirmed book".to_string());
        }
        None
    }

    /// Claims this exact candidate (same pair, same detection instant) for
    /// processing. Returns `false` if it was already claimed — guards
    /// against the same candidate being pushed through the pipeline twice
    /// (e.g. a requeue after a worker crash) and double-firing a signal.
    async fn claim_unprocessed(&self, candidate: &ExecutableSpread) -> anyhow::Result<bool> {
        let key = format!(
            "qualifier:processed:{}:{}:{}:{}",
            candidate.base_symbol,
            candidate.low_venue,
            candidate.high_venue,
            candidate.detected_at.timestamp_millis()
        );
        self.kv
            .set_nx_ex(&key, "1", Duration::from_secs(PROCESSED_TTL_SECS))
            .await
    }

    async fn is_blacklisted(&self, base_symbol: &str) -> anyhow::Result<bool> {
        self.kv.sismember("qualifier:blacklist", base_symbol).await
    }

    async fn pass_cooldown(&self, candidate: &ExecutableSpread) -> anyhow::Result<bool> {
        let key = format!(
            "cooldown:{}:{}:{}",
            candidate.base_symbol, candidate.low_venue, candidate.high_venue
        );
        self.kv.set_nx_ex(&key, "1", self.cooldown).await
    }

    /// An extreme z-score is trusted only if at least one other outlier
    /// fingerprint for the same pair was also observed within the last
    /// minute — i.e. the move shows up from more than a single noisy tick.
    async fn corroborated(&self, candidate: &ExecutableSpread) -> anyhow::Result<bool> {
        let key = format!(
            "qualifier:outlier_sightings:{}:{}:{}",
            candidate.base_symbol, candidate.low_venue, candidate.high_venue
        );
        let now = chrono::Utc::now().timestamp() as f64;
        self.kv.zadd(&key, &now.to_string(), now).await?;
        let recent = self.kv.zrange(&key, 0, -1).await?;
        let cutoff = now - 60.0;
        let sightings = recent
            .iter()
            .filter_map(|s| s.parse::<f64>().ok())
            .filter(|ts| *ts >= cutoff)
            .count();
        Ok(sightings >= 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::storage::SqliteStore;

    fn candidate(pct: f64) -> ExecutableSpread {
        ExecutableSpread {
            base_symbol: "BTC".into(),
            low_venue: "binance".into(),
            high_venue: "okx".into(),
            buy_price: 100.0,
            sell_price: 100.0 * (1.0 + pct / 100.0),
            nominal_spread_pct: pct,
            executable_spread_pct: pct,
            loss_pct: 0.0,
            max_entry_usd: 10_000.0,
            exit_liquidity_usd: 50_000.0,
            suggested_position_usd: 10_000.0,
            fully_fillable: true,
            fallback_signal: false,
            detected_at: Utc::now(),
        }
    }

    fn qualifier() -> SignalQualifier {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        SignalQualifier::new(kv, store, 0.2, Duration::from_secs(300), 4.0, 30)
    }

    #[tokio::test]
    async fn rejects_below_minimum_spread() {
        let q = qualifier();
        let outcome = q.qualify(&candidate(0.05), Category::Layer1).await.unwrap();
        assert!(matches!(outcome, QualifyOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn accepts_a_reasonable_spread_once() {
        let q = qualifier();
        let outcome = q.qualify(&candidate(0.5), Category::Layer1).await.unwrap();
        assert!(matches!(outcome, QualifyOutcome::Accepted(_)));
    }

    #[tokio::test]
    async fn cooldown_rejects_the_second_call_for_the_same_pair() {
        let q = qualifier();
        let mut first_candidate = candidate(0.5);
        first_candidate.detected_at = Utc::now() - chrono::Duration::milliseconds(5);
        let first = q.qualify(&first_candidate, Category::Layer1).await.unwrap();
        assert!(matches!(first, QualifyOutcome::Accepted(_)));
        let second = q.qualify(&candidate(0.6), Category::Layer1).await.unwrap();
        assert!(matches!(second, QualifyOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn blacklisted_symbol_is_always_rejected() {
        let q = qualifier();
        q.kv.sadd("qualifier:blacklist", "BTC").await.unwrap();
        let outcome = q.qualify(&candidate(0.5), Category::Layer1).await.unwrap();
        assert!(matches!(outcome, QualifyOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn stale_candidate_is_rejected() {
        let q = qualifier();
        let mut stale = candidate(0.5);
        stale.detected_at = Utc::now() - chrono::Duration::seconds(120);
        let outcome = q.qualify(&stale, Category::Layer1).await.unwrap();
        assert!(matches!(outcome, QualifyOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn position_larger_than_exit_liquidity_is_rejected() {
        let q = qualifier();
        let mut c = candidate(0.5);
        c.suggested_position_usd = 100_000.0;
        c.exit_liquidity_usd = 1_000.0;
        let outcome = q.qualify(&c, Category::Layer1).await.unwrap();
        assert!(matches!(outcome, QualifyOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn qualify_group_picks_the_richest_candidate_as_primary() {
        let q = qualifier();
        let mut weak = candidate(0.3);
        weak.high_venue = "bybit".into();
        let strong = candidate(0.9);
        let outcome = q
            .qualify_group(vec![weak, strong], Category::Layer1)
            .await
            .unwrap();
        match outcome {
            QualifyOutcome::Accepted(signal) => assert_eq!(signal.high_venue, "okx"),
            QualifyOutcome::Rejected { reason } => panic!("expected accept, got {reason}"),
        }
    }
}
