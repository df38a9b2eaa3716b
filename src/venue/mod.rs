//! VenueAdapter contract (C1): the one seam every exchange/DEX integration
//! goes through. Concrete adapters live in `cex.rs` (barter-data backed CEX
//! spot/futures) and `dex.rs` (on-chain depth synthesized from an oracle
//! feed); `mock.rs` is the test double the integration tests drive.

pub mod cex;
pub mod dex;
pub mod mock;
pub mod orderbook;

use async_trait::async_trait;

pub use orderbook::{max_size_within_slippage, OrderBook, OrderBookLevel};

use crate::models::{Quote, VenueKind};

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue_id(&self) -> &str;

    /// What kind of venue this is, needed by the pipeline to decide which
    /// venue-kind-specific gates (DEX liquidity floor, perp funding, etc.)
    /// apply to a pair. Defaults to `CexSpot`, the common case.
    fn kind(&self) -> VenueKind {
        VenueKind::CexSpot
    }

    /// Symbols this adapter currently tracks, as venue-native strings.
    fn symbols(&self) -> Vec<String>;

    /// Best bid/ask for one symbol, or `None` if never observed.
    async fn quote(&self, symbol: &str) -> anyhow::Result<Option<Quote>>;

    /// Full depth snapshot for one symbol, used by OrderBookAnalyzer to
    /// walk the book for executable price/slippage/exit-liquidity.
    async fn order_book(&self, symbol: &str) -> anyhow::Result<Option<OrderBook>>;
}
