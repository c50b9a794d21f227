use std::collections::HashMap;

use serde::Serialize;

use crate::wire::{DepthUpdateEvent, LevelChange};

/// Ranked views are truncated to the top entries per side.
pub const MAX_RANKED_LEVELS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub amount: f64,
    /// Running sum of `amount` from the best price outward.
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spread {
    pub value: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookView {
    pub symbol: Option<String>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub spread: Option<Spread>,
}

/// Per-side state keyed by the exact price text from the wire. Prices are
/// never compared as floats; a stored quantity is always strictly positive.
#[derive(Debug, Default)]
pub struct OrderBook {
    symbol: Option<String>,
    bids: HashMap<String, f64>,
    asks: HashMap<String, f64>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit instrument-switch boundary: clears both sides and adopts the
    /// new symbol without waiting for data to arrive.
    pub fn reset_for(&mut self, symbol: Option<String>) {
        self.bids.clear();
        self.asks.clear();
        self.symbol = symbol;
    }

    /// Applies one depth diff. An event for a different symbol resets both
    /// sides first (fallback switch detection from stream content). No
    /// sequence validation against `U`/`u`; gaps are tolerated silently.
    pub fn apply(&mut self, event: &DepthUpdateEvent) {
        if self.symbol.as_deref() != Some(event.symbol.as_str()) {
            self.reset_for(Some(event.symbol.clone()));
        }

        apply_side(&mut self.bids, &event.bid_changes);
        apply_side(&mut self.asks, &event.ask_changes);
    }

    /// Full projection of the side state: bids descending, asks ascending,
    /// top [`MAX_RANKED_LEVELS`] each, cumulative totals, and the spread of
    /// the best levels. Recomputed from scratch on every call.
    pub fn ranked_view(&self) -> OrderBookView {
        let bids = rank_side(&self.bids, true);
        let asks = rank_side(&self.asks, false);

        let spread = match (bids.first(), asks.first()) {
            (Some(best_bid), Some(best_ask)) => {
                let value = best_ask.price - best_bid.price;
                Some(Spread {
                    value,
                    percent: value / best_ask.price * 100.0,
                })
            }
            _ => None,
        };

        OrderBookView {
            symbol: self.symbol.clone(),
            bids,
            asks,
            spread,
        }
    }
}

fn apply_side(side: &mut HashMap<String, f64>, changes: &[LevelChange]) {
    for (price, quantity) in changes {
        let Ok(quantity) = quantity.trim().parse::<f64>() else {
            continue;
        };

        // Zero quantity is the wire's deletion sentinel, not a resting level.
        if quantity <= 0.0 {
            side.remove(price);
            continue;
        }

        if price.trim().parse::<f64>().is_err() {
            continue;
        }

        side.insert(price.clone(), quantity);
    }
}

fn rank_side(side: &HashMap<String, f64>, descending: bool) -> Vec<BookLevel> {
    let mut levels = Vec::with_capacity(side.len());
    for (price, amount) in side {
        let Ok(price) = price.parse::<f64>() else {
            continue;
        };
        levels.push((price, *amount));
    }

    if descending {
        levels.sort_by(|left, right| right.0.total_cmp(&left.0));
    } else {
        levels.sort_by(|left, right| left.0.total_cmp(&right.0));
    }
    levels.truncate(MAX_RANKED_LEVELS);

    let mut total = 0.0;
    levels
        .into_iter()
        .map(|(price, amount)| {
            total += amount;
            BookLevel {
                price,
                amount,
                total,
            }
        })
        .collect()
}
