//! OrderBookAnalyzer (C5): turns a raw `Spread` into an executable
//! picture — walked price, capped size, exit liquidity — net of taker
//! fees on both legs, generalized to a per-venue `taker_fee_bps` rather
//! than a fixed fee pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Quote, Spread, Venue};
use crate::venue::orderbook::max_size_within_slippage;
use crate::venue::OrderBook;

/// Hard ceiling on any single suggested position, independent of the
/// liquidity the books support. Keeps one freakishly deep book from
/// recommending a position no operator would actually size into.
pub const HARD_POSITION_CAP_USD: f64 = 50_000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableSpread {
    pub base_symbol: String,
    pub low_venue: String,
    pub high_venue: String,
    pub buy_price: f64,
    pub sell_price: f64,
    /// Quote mid-to-mid spread, before walking either book.
    pub nominal_spread_pct: f64,
    /// Spread after walking both books for `max_entry_usd` and netting
    /// taker fees on both legs.
    pub executable_spread_pct: f64,
    /// `nominal_spread_pct - executable_spread_pct`, floored at zero.
    pub loss_pct: f64,
    pub max_entry_usd: f64,
    pub exit_liquidity_usd: f64,
    /// `min(max_entry_usd, 0.5 * exit_liquidity_usd, HARD_POSITION_CAP_USD)`,
    /// rounded to the nearest dollar.
    pub suggested_position_usd: f64,
    /// `true` when both legs were confirmed fillable by walking real
    /// depth, as opposed to a fallback candidate built from quotes alone.
    pub fully_fillable: bool,
    /// `true` when neither venue's depth was available and this candidate
    /// was produced from the raw quote spread alone, with a conservative
    /// size cap rather than a walked one.
    pub fallback_signal: bool,
    pub detected_at: DateTime<Utc>,
}

impl ExecutableSpread {
    /// Whether this candidate is still fresh enough to act on. Books move;
    /// a candidate built several seconds ago may no longer reflect what's
    /// resting on either venue.
    pub fn is_within_max_age(&self, max_age_secs: u64, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.detected_at);
        age.num_milliseconds() >= 0 && age.num_seconds() <= max_age_secs as i64
    }
}

fn suggested_position(max_entry_usd: f64, exit_liquidity_usd: f64) -> f64 {
    max_entry_usd
        .min(0.5 * exit_liquidity_usd)
        .min(HARD_POSITION_CAP_USD)
        .max(0.0)
        .round()
}

pub struct OrderBookAnalyzer {
    max_slippage_pct: f64,
    min_liquidity_usd: f64,
}

impl OrderBookAnalyzer {
    pub fn new(max_slippage_pct: f64, min_liquidity_usd: f64) -> Self {
        Self {
            max_slippage_pct,
            min_liquidity_usd,
        }
    }

    /// Analyze one spread against both venues' order books. Returns
    /// `None` when there isn't enough liquidity to act on — this is the
    /// fallback-to-no-signal path, not an error.
    pub fn analyze(
        &self,
        spread: &Spread,
        low_venue: &Venue,
        high_venue: &Venue,
        low_book: &OrderBook,
        high_book: &OrderBook,
    ) -> Option<ExecutableSpread> {
        if low_book.is_crossed() || high_book.is_crossed() {
            return None;
        }

        let best_ask = low_book.best_ask()?;
        let best_bid = high_book.best_bid()?;

        let buy_size = max_size_within_slippage(&low_book.asks, best_ask, self.max_slippage_pct);
        let sell_size = max_size_within_slippage(&high_book.bids, best_bid, self.max_slippage_pct);
        let size = buy_size.min(sell_size);
        if size <= 0.0 {
            return None;
        }

        let buy_price = low_book.executable_buy_price(size)?;
        let sell_price = high_book.executable_sell_price(size)?;

        let max_entry_usd = size * buy_price;
        if max_entry_usd < self.min_liquidity_usd {
            return None;
        }

        let (gross, net, net_pct) =
            net_profit(buy_price, sell_price, size, low_venue.taker_fee_bps, high_venue.taker_fee_bps);
        let _ = gross;

        let exit_liquidity_usd =
            high_book.liquidity_within(crate::venue::orderbook::Side::Bid, 5) * best_bid;

        let executable_spread_pct = net_pct * 100.0;
        let nominal_spread_pct = spread.spread_pct;

        Some(ExecutableSpread {
            base_symbol: spread.base_symbol.clone(),
            low_venue: spread.low_venue.clone(),
            high_venue: spread.high_venue.clone(),
            buy_price,
            sell_price,
            nominal_spread_pct,
            executable_spread_pct,
            loss_pct: (nominal_spread_pct - executable_spread_pct).max(0.0),
            max_entry_usd,
            exit_liquidity_usd,
            suggested_position_usd: suggested_position(max_entry_usd, exit_liquidity_usd),
            fully_fillable: true,
            fallback_signal: false,
            detected_at: Utc::now(),
        })
        .filter(|_| net > 0.0)
    }

    /// Conservative candidate produced when neither venue's order book
    /// could be fetched this tick — the quote spread is still real
    /// information, it just can't be walked for size. Caps the suggested
    /// position at 10% of the configured minimum liquidity floor, or
    /// $5,000, whichever is smaller, and leaves a 20% haircut on the raw
    /// spread to stand in for the unknown slippage.
    pub fn fallback(&self, spread: &Spread) -> ExecutableSpread {
        let max_entry_usd = (self.min_liquidity_usd * 0.1).min(5_000.0);
        let nominal_spread_pct = spread.spread_pct;
        let executable_spread_pct = nominal_spread_pct * 0.8;
        ExecutableSpread {
            base_symbol: spread.base_symbol.clone(),
            low_venue: spread.low_venue.clone(),
            high_venue: spread.high_venue.clone(),
            buy_price: spread.low_quote.ask,
            sell_price: spread.high_quote.bid,
            nominal_spread_pct,
            executable_spread_pct,
            loss_pct: (nominal_spread_pct - executable_spread_pct).max(0.0),
            max_entry_usd,
            exit_liquidity_usd: 0.0,
            suggested_position_usd: suggested_position(max_entry_usd, 0.0),
            fully_fillable: false,
            fallback_signal: true,
            detected_at: Utc::now(),
        }
    }

    /// Sanity predicate applied before a signal is allowed through:
    /// rejects non-finite prices and crossed quotes that slipped past the
    /// spread-compute stage.
    pub fn quotes_are_sane(&self, low: &Quote, high: &Quote) -> bool {
        [low.bid, low.ask, high.bid, high.ask]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
            && !low.is_crossed()
            && !high.is_crossed()
    }
}

/// (gross_profit, net_profit, net_profit_pct) for buying `size` at
/// `buy_price` on the low venue and selling at `sell_price` on the high
/// venue, net of both venues' taker fees.
fn net_profit(
    buy_price: f64,
    sell_price: f64,
    size: f64,
    buy_fee_bps: u32,
    sell_fee_bps: u32,
) -> (f64, f64, f64) {
    let buy_cost = buy_price * size;
    let sell_revenue = sell_price * size;
    let gross = sell_revenue - buy_cost;

    let buy_fee = buy_cost * (buy_fee_bps as f64 / 10_000.0);
    let sell_fee = sell_revenue * (sell_fee_bps as f64 / 10_000.0);
    let net = gross - buy_fee - sell_fee;
    let net_pct = if buy_cost > 0.0 { net / buy_cost } else { 0.0 };

    (gross, net, net_pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VenueKind;
    use crate::venue::OrderBookLevel;

    fn venue(fee_bps: u32) -> Venue {
        Venue {
            id: "v".into(),
            kind: VenueKind::CexSpot,
            display_name: "v".into(),
            taker_fee_bps: fee_bps,
            chain: None,
            token_address: None,
        }
    }

    fn deep_book(bid: f64, ask: f64) -> OrderBook {
        OrderBook {
            bids: vec![OrderBookLevel { price: bid, size: 1000.0 }],
            asks: vec![OrderBookLevel { price: ask, size: 1000.0 }],
        }
    }

    fn spread() -> Spread {
        Spread {
            base_symbol: "BTC".into(),
            low_venue: "binance".into(),
            high_venue: "okx".into(),
            low_quote: Quote { bid: 99.9, ask: 100.0, bid_size: 1.0, ask_size: 1.0, ts: chrono::Utc::now() },
            high_quote: Quote { bid: 104.0, ask: 104.1, bid_size: 1.0, ask_size: 1.0, ts: chrono::Utc::now() },
            spread_pct: 4.0,
        }
    }

    #[test]
    fn analyze_accepts_a_deep_profitable_book() {
        let analyzer = OrderBookAnalyzer::new(1.0, 10.0);
        let low_book = deep_book(99.9, 100.0);
        let high_book = deep_book(104.0, 104.1);
        let result = analyzer.analyze(&spread(), &venue(5), &venue(5), &low_book, &high_book);
        assert!(result.is_some());
        let result = result.unwrap();
        assert!(result.executable_spread_pct > 0.0);
        assert!(result.fully_fillable);
        assert!(result.suggested_position_usd > 0.0);
    }

    #[test]
    fn analyze_rejects_crossed_book() {
        let analyzer = OrderBookAnalyzer::new(1.0, 10.0);
        let mut low_book = deep_book(99.9, 100.0);
        low_book.bids[0].price = 200.0;
        let high_book = deep_book(104.0, 104.1);
        let result = analyzer.analyze(&spread(), &venue(5), &venue(5), &low_book, &high_book);
        assert!(result.is_none());
    }

    #[test]
    fn analyze_rejects_thin_book_below_min_liquidity() {
        let analyzer = OrderBookAnalyzer::new(1.0, 1_000_000.0);
        let low_book = deep_book(99.9, 100.0);
        let high_book = deep_book(104.0, 104.1);
        let result = analyzer.analyze(&spread(), &venue(5), &venue(5), &low_book, &high_book);
        assert!(result.is_none());
    }

    #[test]
    fn quotes_are_sane_rejects_crossed_quote() {
        let analyzer = OrderBookAnalyzer::new(1.0, 10.0);
        let low = Quote { bid: 101.0, ask: 100.0, bid_size: 1.0, ask_size: 1.0, ts: chrono::Utc::now() };
        let high = Quote { bid: 104.0, ask: 104.1, bid_size: 1.0, ask_size: 1.0, ts: chrono::Utc::now() };
        assert!(!analyzer.quotes_are_sane(&low, &high));
    }

    #[test]
    fn fallback_caps_size_at_ten_percent_of_liquidity_floor_or_five_thousand() {
        let analyzer = OrderBookAnalyzer::new(1.0, 200_000.0);
        let candidate = analyzer.fallback(&spread());
        assert!(candidate.fallback_signal);
        assert!(!candidate.fully_fillable);
        assert!((candidate.max_entry_usd - 5_000.0).abs() < 1e-9);
        assert!(candidate.executable_spread_pct < candidate.nominal_spread_pct);
    }

    #[test]
    fn suggested_position_is_capped_by_half_exit_liquidity() {
        let analyzer = OrderBookAnalyzer::new(1.0, 10.0);
        let low_book = deep_book(99.9, 100.0);
        let mut high_book = deep_book(104.0, 104.1);
        // Thin exit liquidity: only 10 units resting at best bid.
        high_book.bids[0].size = 10.0;
        let result = analyzer
            .analyze(&spread(), &venue(5), &venue(5), &low_book, &high_book)
            .unwrap();
        let half_exit = 0.5 * result.exit_liquidity_usd;
        assert!(result.suggested_position_usd <= half_exit + 1e-6);
    }

    #[test]
    fn is_within_max_age_rejects_stale_candidates() {
        let analyzer = OrderBookAnalyzer::new(1.0, 10.0);
        let low_book = deep_book(99.9, 100.0);
        let high_book = deep_book(104.0, 104.1);
        let mut candidate = analyzer
            .analyze(&spread(), &venue(5), &venue(5), &low_book, &high_book)
            .unwrap();
        candidate.detected_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(!candidate.is_within_max_age(30, Utc::now()));
    }
}
