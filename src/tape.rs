use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::wire::AggTradeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: u64,
    pub price: f64,
    pub amount: f64,
    pub time: u64,
    pub side: TradeSide,
    /// Newly-arrived highlight; cleared exactly once when the flash window
    /// for this id elapses, never re-armed.
    pub flash_active: bool,
}

struct FlashEntry {
    deadline: Instant,
    trade_id: u64,
}

/// Bounded newest-first trade buffer. Flash expiry runs off a single
/// time-ordered delay queue drained by a periodic tick rather than one
/// timer per record. Clearing the buffer on an instrument switch also drops
/// every pending expiry for the retired instrument.
pub struct TradeTape {
    symbol: Option<String>,
    records: VecDeque<TradeRecord>,
    flash_queue: VecDeque<FlashEntry>,
    capacity: usize,
    flash_duration: Duration,
}

impl TradeTape {
    pub fn new(capacity: usize, flash_duration: Duration) -> Self {
        Self {
            symbol: None,
            records: VecDeque::new(),
            flash_queue: VecDeque::new(),
            capacity: capacity.max(1),
            flash_duration,
        }
    }

    /// Explicit instrument-switch boundary; see [`TradeTape`] docs for the
    /// flash-queue consequence.
    pub fn reset_for(&mut self, symbol: Option<String>) {
        self.records.clear();
        self.flash_queue.clear();
        self.symbol = symbol;
    }

    pub fn apply(&mut self, event: &AggTradeEvent, now: Instant) {
        if self.symbol.as_deref() != Some(event.symbol.as_str()) {
            self.reset_for(Some(event.symbol.clone()));
        }

        let Ok(price) = event.price.trim().parse::<f64>() else {
            return;
        };
        let Ok(amount) = event.quantity.trim().parse::<f64>() else {
            return;
        };

        let side = if event.is_buyer_maker {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        };

        self.records.push_front(TradeRecord {
            id: event.aggregate_id,
            price,
            amount,
            time: event.trade_time,
            side,
            flash_active: true,
        });
        self.records.truncate(self.capacity);

        // Insertion order is arrival order, so the queue stays deadline-sorted.
        self.flash_queue.push_back(FlashEntry {
            deadline: now + self.flash_duration,
            trade_id: event.aggregate_id,
        });
    }

    /// Drains due flash entries; each clears `flash_active` for its own id
    /// only, and only if that record is still buffered. Returns whether any
    /// record changed.
    pub fn expire_flashes(&mut self, now: Instant) -> bool {
        let mut changed = false;
        while let Some(entry) = self.flash_queue.front() {
            if entry.deadline > now {
                break;
            }
            let Some(entry) = self.flash_queue.pop_front() else {
                break;
            };

            if let Some(record) = self
                .records
                .iter_mut()
                .find(|record| record.id == entry.trade_id)
            {
                if record.flash_active {
                    record.flash_active = false;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Owned newest-first snapshot for consumers; never a live reference.
    pub fn snapshot(&self) -> Vec<TradeRecord> {
        self.records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{TradeSide, TradeTape};
    use crate::wire::AggTradeEvent;

    const FLASH: Duration = Duration::from_millis(500);

    fn trade_event(symbol: &str, id: u64, price: &str, quantity: &str) -> AggTradeEvent {
        AggTradeEvent {
            event_type: "aggTrade".to_string(),
            event_time: 1_700_000_000_000,
            symbol: symbol.to_string(),
            aggregate_id: id,
            price: price.to_string(),
            quantity: quantity.to_string(),
            first_trade_id: id,
            last_trade_id: id,
            trade_time: 1_700_000_000_000 + id,
            is_buyer_maker: false,
            ignore: false,
        }
    }

    #[test]
    fn records_are_newest_first_and_capped() {
        let mut tape = TradeTape::new(3, FLASH);
        let now = Instant::now();
        for id in 1..=5 {
            tape.apply(&trade_event("BTCUSDT", id, "100.0", "1.0"), now);
        }

        let snapshot = tape.snapshot();
        assert_eq!(
            snapshot.iter().map(|record| record.id).collect::<Vec<_>>(),
            vec![5, 4, 3]
        );
    }

    #[test]
    fn maker_sell_flag_maps_to_display_side() {
        let mut tape = TradeTape::new(10, FLASH);
        let now = Instant::now();

        let mut maker_sell = trade_event("BTCUSDT", 1, "100.0", "1.0");
        maker_sell.is_buyer_maker = true;
        tape.apply(&maker_sell, now);
        tape.apply(&trade_event("BTCUSDT", 2, "100.5", "2.0"), now);

        let snapshot = tape.snapshot();
        assert_eq!(snapshot[0].side, TradeSide::Buy);
        assert_eq!(snapshot[1].side, TradeSide::Sell);
        assert_eq!(snapshot[0].price, 100.5);
        assert_eq!(snapshot[1].amount, 1.0);
    }

    #[test]
    fn flash_clears_exactly_once_after_the_window() {
        let mut tape = TradeTape::new(10, FLASH);
        let start = Instant::now();
        tape.apply(&trade_event("BTCUSDT", 1, "100.0", "1.0"), start);

        assert!(tape.snapshot()[0].flash_active);
        assert!(!tape.expire_flashes(start + Duration::from_millis(499)));
        assert!(tape.snapshot()[0].flash_active);

        assert!(tape.expire_flashes(start + FLASH));
        assert!(!tape.snapshot()[0].flash_active);

        // A second drain past the deadline must not report a change again.
        assert!(!tape.expire_flashes(start + Duration::from_secs(2)));
    }

    #[test]
    fn flash_expiries_are_independent_per_id() {
        let mut tape = TradeTape::new(10, FLASH);
        let start = Instant::now();
        tape.apply(&trade_event("BTCUSDT", 1, "100.0", "1.0"), start);
        tape.apply(
            &trade_event("BTCUSDT", 2, "100.1", "1.0"),
            start + Duration::from_millis(200),
        );

        assert!(tape.expire_flashes(start + FLASH));
        let snapshot = tape.snapshot();
        assert!(snapshot.iter().find(|record| record.id == 2).is_some_and(|record| record.flash_active));
        assert!(snapshot.iter().find(|record| record.id == 1).is_some_and(|record| !record.flash_active));

        assert!(tape.expire_flashes(start + Duration::from_millis(700)));
        assert!(tape.snapshot().iter().all(|record| !record.flash_active));
    }

    #[test]
    fn expiry_for_an_evicted_record_is_a_noop() {
        let mut tape = TradeTape::new(1, FLASH);
        let start = Instant::now();
        tape.apply(&trade_event("BTCUSDT", 1, "100.0", "1.0"), start);
        tape.apply(&trade_event("BTCUSDT", 2, "100.1", "1.0"), start);

        // Record 1 is gone; only record 2 can change.
        assert!(tape.expire_flashes(start + FLASH));
        let snapshot = tape.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, 2);
        assert!(!snapshot[0].flash_active);
    }

    #[test]
    fn symbol_change_clears_records_and_pending_expiries() {
        let mut tape = TradeTape::new(10, FLASH);
        let start = Instant::now();
        tape.apply(&trade_event("BTCUSDT", 1, "100.0", "1.0"), start);
        tape.apply(&trade_event("ETHUSDT", 7, "2000.0", "0.5"), start);

        let snapshot = tape.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, 7);

        // Only the ETHUSDT expiry is left in the queue.
        assert!(tape.expire_flashes(start + FLASH));
        assert_eq!(tape.flash_queue.len(), 0);
    }

    #[test]
    fn unparsable_price_or_quantity_drops_the_event() {
        let mut tape = TradeTape::new(10, FLASH);
        let now = Instant::now();
        tape.apply(&trade_event("BTCUSDT", 1, "abc", "1.0"), now);
        tape.apply(&trade_event("BTCUSDT", 2, "100.0", ""), now);

        assert!(tape.snapshot().is_empty());
    }
}
