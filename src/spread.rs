//! SpreadEngine (C4): pairwise spread computation across every
//! `ArbitragePair` the registry emits — a plain bid/ask mid-price spread
//! between two venues of the same asset, labeling which side is cheaper,
//! gated by a token-identity sanity check and a DEX liquidity floor.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::collector::cached_quote;
use crate::errors::ObservatoryError;
use crate::kv::KvStore;
use crate::models::{Spread, VenueKind};
use crate::registry::ArbitragePair;

pub struct SpreadEngine {
    kv: Arc<dyn KvStore>,
    venue_kinds: HashMap<String, VenueKind>,
    token_mismatch_ratio: f64,
    min_dex_liquidity_usd: f64,
}

impl SpreadEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        venue_kinds: HashMap<String, VenueKind>,
        token_mismatch_ratio: f64,
        min_dex_liquidity_usd: f64,
    ) -> Self {
        Self {
            kv,
            venue_kinds,
            token_mismatch_ratio,
            min_dex_liquidity_usd,
        }
    }

    /// Compute the spread for one pair, or `None` if either side has no
    /// cached quote yet, the book is crossed, or a gate silently disqualifies
    /// this tick (not an error, just not actionable right now). Returns an
    /// `Err` only for a structural defect — the pair claims a token identity
    /// the prices don't support.
    pub async fn compute(
        &self,
        pair: &ArbitragePair,
        symbol_a: &str,
        symbol_b: &str,
    ) -> anyhow::Result<Option<Spread>> {
        let quote_a = cached_quote(&*self.kv, &pair.venue_a, symbol_a).await?;
        let quote_b = cached_quote(&*self.kv, &pair.venue_b, symbol_b).await?;

        let (Some(qa), Some(qb)) = (quote_a, quote_b) else {
            return Ok(None);
        };

        if qa.is_crossed() || qb.is_crossed() {
            debug!(base = %pair.base_symbol, "skipping crossed-book quote");
            return Ok(None);
        }

        let mid_a = qa.mid();
        let mid_b = qb.mid();
        if mid_a <= 0.0 || mid_b <= 0.0 {
            return Ok(None);
        }

        let (low_venue, high_venue, low_quote, high_quote, spread_pct) = if mid_a <= mid_b {
            (
                pair.venue_a.clone(),
                pair.venue_b.clone(),
                qa,
                qb,
                (mid_b - mid_a) / mid_a * 100.0,
            )
        } else {
            (
                pair.venue_b.clone(),
                pair.venue_a.clone(),
                qb,
                qa,
                (mid_a - mid_b) / mid_b * 100.0,
            )
        };

        assert_token_match(
            &pair.base_symbol,
            &low_venue,
            &high_venue,
            low_quote.mid(),
            high_quote.mid(),
            self.token_mismatch_ratio,
        )?;

        if !self.passes_dex_liquidity_gate(&low_venue, &low_quote)
            || !self.passes_dex_liquidity_gate(&high_venue, &high_quote)
        {
            debug!(base = %pair.base_symbol, "dropping pair below dex liquidity floor");
            return Ok(None);
        }

        Ok(Some(Spread {
            base_symbol: pair.base_symbol.clone(),
            low_venue,
            high_venue,
            low_quote,
            high_quote,
            spread_pct,
        }))
    }

    /// `true` unless `venue_id` is a DEX venue whose quoted liquidity falls
    /// below the configured floor. Non-DEX venues and unknown venue ids
    /// (never seen by `rebuild`) always pass — the gate only constrains
    /// the venue kind it exists for.
    fn passes_dex_liquidity_gate(&self, venue_id: &str, quote: &crate::models::Quote) -> bool {
        if self.venue_kinds.get(venue_id) != Some(&VenueKind::DexSpot) {
            return true;
        }
        let liquidity_usd = quote.bid_size.min(quote.ask_size) * quote.mid();
        liquidity_usd >= self.min_dex_liquidity_usd
    }
}

/// Guard against comparing two venues' symbols that normalize to the same
/// base but represent different underlying tokens (e.g. a wrapped asset
/// vs. its native counterpart): if one side's price is more than
/// `max_ratio` times the other's, they aren't the same asset.
pub fn assert_token_match(
    base_symbol: &str,
    low_venue: &str,
    high_venue: &str,
    low_price: f64,
    high_price: f64,
    max_ratio: f64,
) -> Result<(), ObservatoryError> {
    if low_price <= 0.0 || high_price / low_price > max_ratio {
        Err(ObservatoryError::TokenMismatch {
            base_symbol: base_symbol.to_string(),
            venue_a: low_venue.to_string(),
            venue_b: high_venue.to_string(),
        })
    } else {
        Ok(())
    }
}
