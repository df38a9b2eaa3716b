//! In-process test double for `VenueAdapter`, used to drive the
//! end-to-end scenarios without a live exchange connection.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::models::{Quote, VenueKind};
use crate::venue::{OrderBook, VenueAdapter};

pub struct MockAdapter {
    venue_id: String,
    kind: VenueKind,
    quotes: RwLock<HashMap<String, Quote>>,
    books: RwLock<HashMap<String, OrderBook>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            venue_id: String::new(),
            kind: VenueKind::CexSpot,
            quotes: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
        }
    }
}

impl MockAdapter {
    pub fn new(venue_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            venue_id: venue_id.into(),
            kind: VenueKind::CexSpot,
            quotes: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
        })
    }

    /// A mock adapter that reports as a given venue kind, needed to drive
    /// kind-specific gates (e.g. the DEX liquidity floor) in tests.
    pub fn with_kind(venue_id: impl Into<String>, kind: VenueKind) -> Arc<Self> {
        Arc::new(Self {
            venue_id: venue_id.into(),
            kind,
            quotes: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
        })
    }

    pub fn set_quote(&self, symbol: &str, quote: Quote) {
        self.quotes.write().insert(symbol.to_string(), quote);
    }

    pub fn set_order_book(&self, symbol: &str, book: OrderBook) {
        self.books.write().insert(symbol.to_string(), book);
    }
}

#[async_trait]
impl VenueAdapter for MockAdapter {
    fn venue_id(&self) -> &str {
        &self.venue_id
    }

    fn kind(&self) -> VenueKind {
        self.kind
    }

    fn symbols(&self) -> Vec<String> {
        self.quotes.read().keys().cloned().collect()
    }

    async fn quote(&self, symbol: &str) -> anyhow::Result<Option<Quote>> {
        Ok(self.quotes.read().get(symbol).copied())
    }

    async fn order_book(&self, symbol: &str) -> anyhow::Result<Option<OrderBook>> {
        Ok(self.books.read().get(symbol).cloned())
    }
}
