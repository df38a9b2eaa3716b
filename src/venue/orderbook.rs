//! Read-only order book snapshot plus the slippage-capped walk used by
//! OrderBookAnalyzer (C5): a price-impact simulation over a static
//! snapshot, not a live matching engine — there's nothing to match
//! against here, only a depth profile to walk for size.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    /// Descending by price.
    pub bids: Vec<OrderBookLevel>,
    /// Ascending by price.
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Average executable price for buying `size` units by walking the ask
    /// side, or `None` if the book can't fill the requested size.
    pub fn executable_buy_price(&self, size: f64) -> Option<f64> {
        walk(&self.asks, size)
    }

    /// Average executable price for selling `size` units by walking the
    /// bid side, or `None` if the book can't fill the requested size.
    pub fn executable_sell_price(&self, size: f64) -> Option<f64> {
        walk(&self.bids, size)
    }

    /// Total size resting within `max_levels` price levels of best, used
    /// as a cheap proxy for exit liquidity on the opposite side of a fill.
    pub fn liquidity_within(&self, side: Side, max_levels: usize) -> f64 {
        let levels = match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        };
        levels.iter().take(max_levels).map(|l| l.size).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

fn walk(levels: &[OrderBookLevel], size: f64) -> Option<f64> {
    if size <= 0.0 {
        return None;
    }
    let mut remaining = size;
    let mut cost = 0.0;
    for level in levels {
        let take = remaining.min(level.size);
        cost += take * level.price;
        remaining -= take;
        if remaining <= 0.0 {
            return Some(cost / size);
        }
    }
    None
}

/// Largest size that can be filled while keeping the average executable
/// price within `max_slippage_pct` of the book's best price on that side.
/// Used by OrderBookAnalyzer to cap a signal's `max_entry_usd`.
pub fn max_size_within_slippage(
    levels: &[OrderBookLevel],
    best_price: f64,
    max_slippage_pct: f64,
) -> f64 {
    if best_price <= 0.0 || levels.is_empty() {
        return 0.0;
    }
    let mut cumulative_size = 0.0;
    let mut cumulative_cost = 0.0;
    let mut accepted_size = 0.0;

    for level in levels {
        let next_size = cumulative_size + level.size;
        let next_cost = cumulative_cost + level.size * level.price;
        let avg_price = next_cost / next_size;
        let slippage_pct = ((avg_price - best_price) / best_price).abs() * 100.0;

        if slippage_pct > max_slippage_pct {
            // Binary-search within this level for the exact boundary size.
            let mut lo = 0.0_f64;
            let mut hi = level.size;
            for _ in 0..24 {
                let mid = (lo + hi) / 2.0;
                let size = cumulative_size + mid;
                let cost = cumulative_cost + mid * level.price;
                let avg = cost / size;
                let slip = ((avg - best_price) / best_price).abs() * 100.0;
                if slip > max_slippage_pct {
                    hi = mid;
                } else {
                    lo = mid;
                    accepted_size = size;
                }
            }
            return accepted_size;
        }

        cumulative_size = next_size;
        cumulative_cost = next_cost;
        accepted_size = cumulative_size;
    }

    accepted_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBook {
        OrderBook {
            bids: vec![
                OrderBookLevel { price: 99.0, size: 1.0 },
                OrderBookLevel { price: 98.0, size: 2.0 },
            ],
            asks: vec![
                OrderBookLevel { price: 100.0, size: 1.0 },
                OrderBookLevel { price: 101.0, size: 2.0 },
            ],
        }
    }

    #[test]
    fn executable_buy_price_walks_the_ask_side() {
        let b = book();
        let price = b.executable_buy_price(2.0).unwrap();
        // 1 @ 100 + 1 @ 101 = 201 / 2 = 100.5
        assert!((price - 100.5).abs() < 1e-9);
    }

    #[test]
    fn executable_price_is_none_for_thin_book() {
        let b = book();
        assert!(b.executable_buy_price(10.0).is_none());
    }

    #[test]
    fn crossed_book_is_detected() {
        let mut b = book();
        b.bids[0].price = 101.0;
        assert!(b.is_crossed());
    }

    #[test]
    fn max_size_within_slippage_caps_at_boundary() {
        let levels = vec![
            OrderBookLevel { price: 100.0, size: 1.0 },
            OrderBookLevel { price: 110.0, size: 10.0 },
        ];
        // 1% slippage cap should accept roughly the first level only.
        let size = max_size_within_slippage(&levels, 100.0, 1.0);
        assert!(size > 0.0 && size <= 1.2);
    }

    #[test]
    fn max_size_within_slippage_is_zero_for_empty_book() {
        assert_eq!(max_size_within_slippage(&[], 100.0, 1.0), 0.0);
    }
}
