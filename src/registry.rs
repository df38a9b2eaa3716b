//! TickerRegistry (C2): the symbol universe each venue adapter exposes,
//! normalized to base symbol, and the set of cross-venue pairs that are
//! worth comparing.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::info;

use crate::kv::KvStore;
use crate::models::{Category, Ticker};
use crate::symbol::base_symbol;
use crate::venue::VenueAdapter;

const UNIVERSE_KEY: &str = "tickers:universe";

/// One base-symbol vs. base-symbol comparison to run through the pipeline.
#[derive(Debug, Clone)]
pub struct ArbitragePair {
    pub base_symbol: String,
    pub venue_a: String,
    pub venue_b: String,
    /// `true` when both sides of the pair were auto-labeled rather than
    /// confirmed against an explicit equivalence mapping.
    pub auto: bool,
}

pub struct TickerRegistry {
    tickers: RwLock<Vec<Ticker>>,
    kv: Arc<dyn KvStore>,
}

impl TickerRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            tickers: RwLock::new(Vec::new()),
            kv,
        }
    }

    /// Rebuild the universe from the current adapter set. Re-runs replace
    /// the set atomically — this is a single KV `SET` of the whole blob,
    /// so readers never observe a half-written universe.
    pub async fn rebuild(&self, adapters: &[Arc<dyn VenueAdapter>]) -> anyhow::Result<()> {
        let mut tickers = Vec::new();
        for adapter in adapters {
            for symbol in adapter.symbols() {
                tickers.push(build_ticker(adapter.venue_id(), &symbol));
            }
        }

        let blob = serde_json::to_string(&tickers)?;
        self.kv
            .set_ex(UNIVERSE_KEY, &blob, std::time::Duration::from_secs(24 * 3600))
            .await?;

        let count = tickers.len();
        let invalid = tickers.iter().filter(|t| !t.valid).count();
        *self.tickers.write() = tickers;
        info!(count, invalid, "ticker universe rebuilt");
        Ok(())
    }

    pub fn tickers(&self) -> Vec<Ticker> {
        self.tickers.read().clone()
    }

    /// The venue-native symbol string a given venue uses for a base
    /// symbol, e.g. `("binance-spot", "BTC") -> "btcusdt"`. Needed because
    /// the quote cache is keyed by each venue's native spelling, not the
    /// normalized base symbol `ArbitragePair` carries. Invalid tickers are
    /// excluded — a ticker that failed validation has no business feeding
    /// the pipeline's symbol resolution.
    pub fn native_symbol(&self, venue_id: &str, base_symbol: &str) -> Option<String> {
        self.tickers
            .read()
            .iter()
            .find(|t| t.venue_id == venue_id && t.base_symbol == base_symbol && t.valid)
            .map(|t| t.symbol.clone())
    }

    /// All cross-venue pairs sharing a base symbol, one entry per
    /// unordered venue pair (never a venue against itself). Invalid
    /// tickers are dropped before pairing — they carry no information
    /// worth comparing.
    pub fn arbitrage_pairs(&self) -> Vec<ArbitragePair> {
        let tickers = self.tickers.read();
        let mut by_base: HashMap<&str, Vec<&Ticker>> = HashMap::new();
        for t in tickers.iter().filter(|t| t.valid) {
            by_base.entry(t.base_symbol.as_str()).or_default().push(t);
        }

        let mut pairs = Vec::new();
        for (base, group) in by_base {
            for i in 0..group.len() {
                for j in (i + 1)..group.len() {
                    if group[i].venue_id == group[j].venue_id {
                        continue;
                    }
                    pairs.push(ArbitragePair {
                        base_symbol: base.to_string(),
                        venue_a: group[i].venue_id.clone(),
                        venue_b: group[j].venue_id.clone(),
                        auto: group[i].auto && group[j].auto,
                    });
                }
            }
        }
        pairs
    }
}

/// Build one ticker from a venue's raw symbol string: normalize to a base
/// symbol, classify, and run the validation checks that decide whether
/// this listing is trustworthy enough to pair against other venues.
fn build_ticker(venue_id: &str, raw_symbol: &str) -> Ticker {
    let base = base_symbol(raw_symbol);
    let mut validation_errors = Vec::new();

    if base.is_empty() {
        validation_errors.push("base symbol normalized to empty string".to_string());
    }
    if base.len() > 20 {
        validation_errors.push("base symbol implausibly long".to_string());
    }
    if raw_symbol.trim().is_empty() {
        validation_errors.push("raw symbol is blank".to_string());
    }

    Ticker {
        venue_id: venue_id.to_string(),
        symbol: raw_symbol.to_string(),
        base_symbol: base.clone(),
        category: classify(&base),
        auto: true,
        valid: validation_errors.is_empty(),
        validation_errors,
    }
}

/// Coarse asset taxonomy lookup. Anything not in the known lists falls
/// back to `Unknown` rather than panicking — an unrecognized symbol must
/// never crash the pipeline, it just can't be grouped with its peers.
fn classify(base: &str) -> Category {
    const LAYER1: &[&str] = &["BTC", "ETH", "SOL", "AVAX", "ADA", "DOT", "ATOM", "NEAR"];
    const LAYER2: &[&str] = &["ARB", "OP", "MATIC", "STRK", "ZK"];
    const DEFI: &[&str] = &["UNI", "AAVE", "MKR", "CRV", "LDO", "SNX"];
    const MEME: &[&str] = &["DOGE", "SHIB", "PEPE", "WIF", "BONK"];
    const STABLE: &[&str] = &["USDT", "USDC", "DAI", "TUSD", "FDUSD"];

    if LAYER1.contains(&base) {
        Category::Layer1
    } else if LAYER2.contains(&base) {
        Category::Layer2
    } else if DEFI.contains(&base) {
        Category::Defi
    } else if MEME.contains(&base) {
        Category::Meme
    } else if STABLE.contains(&base) {
        Category::Stable
    } else {
        Category::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::venue::mock::MockAdapter;

    #[tokio::test]
    async fn rebuild_derives_base_symbol_and_category() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let registry = TickerRegistry::new(kv);

        let a = MockAdapter::new("binance");
        a.set_quote(
            "btcusdt",
            crate::models::Quote {
                bid: 1.0,
                ask: 1.1,
                bid_size: 1.0,
                ask_size: 1.0,
                ts: chrono::Utc::now(),
            },
        );
        let adapters: Vec<Arc<dyn VenueAdapter>> = vec![a];
        registry.rebuild(&adapters).await.unwrap();

        let tickers = registry.tickers();
        assert_eq!(tickers.len(), 1);
        assert_eq!(tickers[0].base_symbol, "BTC");
        assert_eq!(tickers[0].category, Category::Layer1);
        assert!(tickers[0].valid);
        assert!(tickers[0].auto);
    }

    #[tokio::test]
    async fn arbitrage_pairs_never_pair_a_venue_with_itself() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let registry = TickerRegistry::new(kv);

        let a = MockAdapter::new("binance");
        a.set_quote("btcusdt", dummy_quote());
        let b = MockAdapter::new("okx");
        b.set_quote("btcusdt", dummy_quote());

        let adapters: Vec<Arc<dyn VenueAdapter>> = vec![a, b];
        registry.rebuild(&adapters).await.unwrap();

        let pairs = registry.arbitrage_pairs();
        assert_eq!(pairs.len(), 1);
        assert_ne!(pairs[0].venue_a, pairs[0].venue_b);
    }

    #[tokio::test]
    async fn blank_raw_symbol_is_marked_invalid_and_excluded_from_pairs() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let registry = TickerRegistry::new(kv);

        let a = MockAdapter::new("binance");
        a.set_quote("  ", dummy_quote());
        let b = MockAdapter::new("okx");
        b.set_quote("btcusdt", dummy_quote());

        let adapters: Vec<Arc<dyn VenueAdapter>> = vec![a, b];
        registry.rebuild(&adapters).await.unwrap();

        let tickers = registry.tickers();
        let blank = tickers.iter().find(|t| t.venue_id == "binance").unwrap();
        assert!(!blank.valid);
        assert!(!blank.validation_errors.is_empty());
        assert!(registry.arbitrage_pairs().is_empty());
    }

    fn dummy_quote() -> crate::models::Quote {
        crate::models::Quote {
            bid: 1.0,
            ask: 1.1,
            bid_size: 1.0,
            ask_size: 1.0,
            ts: chrono::Utc::now(),
        }
    }
}
