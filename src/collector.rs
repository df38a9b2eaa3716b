//! PriceCollector (C3): fans out to every venue adapter on a fixed tick,
//! filters stale quotes, and writes the survivors into the `prices:latest`
//! KV cache for SpreadEngine to read back.
//!
//! The single-flight guard is a small `AtomicBool` that prevents two
//! overlapping ticks from racing each other if one run falls behind its
//! interval.

use std::sync::{atomic::{AtomicBool, Ordering}, Arc};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::kv::KvStore;
use crate::models::Quote;
use crate::venue::VenueAdapter;

fn quote_key(venue_id: &str, symbol: &str) -> String {
    format!("prices:latest:{venue_id}:{symbol}")
}

pub struct PriceCollector {
    adapters: Vec<Arc<dyn VenueAdapter>>,
    kv: Arc<dyn KvStore>,
    stale_budget: Duration,
    in_flight: AtomicBool,
}

impl PriceCollector {
    pub fn new(
        adapters: Vec<Arc<dyn VenueAdapter>>,
        kv: Arc<dyn KvStore>,
        stale_budget: Duration,
    ) -> Self {
        Self {
            adapters,
            kv,
            stale_budget,
            in_flight: AtomicBool::new(false),
        }
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        let deadline = interval * 3;
        loop {
            ticker.tick().await;
            let this = self.clone();
            if tokio::time::timeout(deadline, this.tick_once()).await.is_err() {
                warn!(deadline_secs = deadline.as_secs(), "price collector tick missed its deadline");
            }
        }
    }

    /// One collection pass: fan out to every adapter/symbol concurrently
    /// (one venue's slow response shouldn't hold up every other venue's
    /// quotes), drop stale or unavailable quotes, write survivors to the
    /// KV cache.
    pub async fn tick_once(self: Arc<Self>) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("price collector tick skipped: previous tick still in flight");
            return;
        }

        let fetches = self.adapters.iter().cloned().map(|adapter| {
            let this = self.clone();
            async move { this.collect_adapter(&adapter).await }
        });
        let written: usize = join_all(fetches).await.into_iter().sum();

        debug!(written, "price collector tick complete");
        self.in_flight.store(false, Ordering::SeqCst);
    }

    /// Fetch and cache every symbol for one adapter. Symbols within an
    /// adapter are still fetched sequentially — venues typically rate-limit
    /// per connection, so fanning out within a venue buys nothing and risks
    /// tripping that limit.
    async fn collect_adapter(&self, adapter: &Arc<dyn VenueAdapter>) -> usize {
        let mut written = 0usize;
        for symbol in adapter.symbols() {
            match adapter.quote(&symbol).await {
                Ok(Some(quote)) => {
                    if self.is_stale(&quote) {
                        let age_secs = Utc::now()
                            .signed_duration_since(quote.ts)
                            .to_std()
                            .map(|d| d.as_secs())
                            .unwrap_or(u64::MAX);
                        debug!(
                            error = %crate::errors::ObservatoryError::StaleData {
                                venue: adapter.venue_id().to_string(),
                                symbol: symbol.clone(),
                                age_secs,
                            },
                            "dropping stale quote"
                        );
                        continue;
                    }
                    if let Err(e) = self.cache(adapter.venue_id(), &symbol, &quote).await {
                        warn!(error = %e, "failed to cache quote");
                        continue;
                    }
                    written += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        error = %crate::errors::ObservatoryError::AdapterUnavailable {
                            venue: adapter.venue_id().to_string(),
                            reason: e.to_string(),
                        },
                        %symbol,
                        "adapter quote fetch failed"
                    );
                }
            }
        }
        written
    }

    fn is_stale(&self, quote: &Quote) -> bool {
        let age = Utc::now().signed_duration_since(quote.ts);
        age.to_std().map(|d| d > self.stale_budget).unwrap_or(true)
    }

    async fn cache(&self, venue_id: &str, symbol: &str, quote: &Quote) -> anyhow::Result<()> {
        let blob = serde_json::to_string(quote)?;
        self.kv
            .set_ex(&quote_key(venue_id, symbol), &blob, self.stale_budget * 3)
            .await
    }
}

/// Read the most recently cached quote for a venue/symbol pair. Used by
/// SpreadEngine and PositionTracker instead of calling adapters directly.
pub async fn cached_quote(
    kv: &dyn KvStore,
    venue_id: &str,
    symbol: &str,
) -> anyhow::Result<Option<Quote>> {
    match kv.get(&quote_key(venue_id, symbol)).await? {
        Some(blob) => Ok(serde_json::from_str(&blob).ok()),
        None => Ok(None),
    }
}
