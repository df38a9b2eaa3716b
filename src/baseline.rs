//! BaselineCollector (C9): accumulates spread-pct samples for every venue
//! pair into rolling hourly windows and flushes each into a merged
//! `BaselineBucket` once the hour rolls over.
//!
//! Two-tier shape: an in-memory rolling window feeding a percentile/stddev
//! rollup, fed once per price-collection tick rather than on a separate
//! probe cadence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::models::{BaselineBucket, BaselineSummary};
use crate::storage::DurableStore;

#[derive(Clone, Eq, PartialEq, Hash)]
struct PairKey {
    base_symbol: String,
    low_venue: String,
    high_venue: String,
}

struct Window {
    hour_start: DateTime<Utc>,
    samples: Vec<f64>,
}

pub struct BaselineCollector {
    store: Arc<dyn DurableStore>,
    windows: Mutex<HashMap<PairKey, Window>>,
}

impl BaselineCollector {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one observed spread-pct sample for a venue pair. Called once
    /// per pair on every price-collection tick. If the sample belongs to a
    /// new hour, the previous window is returned for the caller to flush —
    /// rollover never blocks on a durable-store write while holding the
    /// in-memory lock.
    pub fn record(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
        spread_pct: f64,
        now: DateTime<Utc>,
    ) -> Option<BaselineBucket> {
        let key = PairKey {
            base_symbol: base_symbol.to_string(),
            low_venue: low_venue.to_string(),
            high_venue: high_venue.to_string(),
        };
        let hour_start = truncate_to_hour(now);

        let mut windows = self.windows.lock();
        let rolled_over = match windows.get(&key) {
            Some(w) => w.hour_start != hour_start,
            None => false,
        };

        let finished = if rolled_over {
            windows.insert(
                key.clone(),
                Window {
                    hour_start,
                    samples: vec![spread_pct],
                },
            )
            .map(|old| summarize(&key, &old))
        } else {
            windows
                .entry(key.clone())
                .or_insert_with(|| Window {
                    hour_start,
                    samples: Vec::new(),
                })
                .samples
                .push(spread_pct);
            None
        };

        finished
    }

    /// Flush every open window regardless of hour boundary. Used on
    /// shutdown so the last partial hour isn't lost.
    pub async fn flush_all(&self) -> anyhow::Result<()> {
        let finished: Vec<BaselineBucket> = {
            let mut windows = self.windows.lock();
            windows
                .drain()
                .map(|(key, window)| summarize(&key, &window))
                .collect()
        };
        for bucket in finished {
            self.persist(bucket).await?;
        }
        Ok(())
    }

    pub async fn persist(&self, bucket: BaselineBucket) -> anyhow::Result<()> {
        debug!(
            base = %bucket.base_symbol,
            samples = bucket.sample_count,
            "flushing baseline bucket"
        );
        if let Err(e) = self.store.merge_baseline_bucket(&bucket).await {
            warn!(error = %e, "failed to merge baseline bucket");
            return Err(e);
        }
        Ok(())
    }

    /// Read-side view for a venue pair: whether there's at least 24h of
    /// hourly history to trust, and whether `current_spread_pct` is
    /// anomalous against it. Delegates the rollup to the durable store,
    /// which holds every flushed hour this collector ever produced.
    pub async fn summary(
        &self,
        base_symbol: &str,
        low_venue: &str,
        high_venue: &str,
        current_spread_pct: Option<f64>,
    ) -> anyhow::Result<BaselineSummary> {
        self.store
            .baseline_summary(base_symbol, low_venue, high_venue, current_spread_pct)
            .await
    }
}

fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(ts.hour(), 0, 0)
        .unwrap()
        .and_utc()
}

fn summarize(key: &PairKey, window: &Window) -> BaselineBucket {
    let mut sorted = window.samples.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let n = sorted.len();
    let mean = if n == 0 {
        0.0
    } else {
        sorted.iter().sum::<f64>() / n as f64
    };
    let variance = if n < 2 {
        0.0
    } else {
        sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    };

    BaselineBucket {
        base_symbol: key.base_symbol.clone(),
        low_venue: key.low_venue.clone(),
        high_venue: key.high_venue.clone(),
        hour_start: window.hour_start,
        sample_count: n as u64,
        mean_pct: mean,
        stddev_pct: variance.sqrt(),
        min_pct: sorted.first().copied().unwrap_or(0.0),
        max_pct: sorted.last().copied().unwrap_or(0.0),
        p50_pct: percentile(&sorted, 0.50),
        p95_pct: percentile(&sorted, 0.95),
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Hour window duration used by callers scheduling the periodic flush.
pub const FLUSH_INTERVAL: ChronoDuration = ChronoDuration::hours(1);
