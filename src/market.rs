use std::time::{Duration, Instant};

use tokio::{
    sync::{broadcast, watch},
    time::MissedTickBehavior,
};

use crate::{
    book::{OrderBook, OrderBookView},
    config::FeedConfig,
    errors::FeedError,
    feed::{ConnectionState, ConnectionStatus, MarketFeed},
    tape::{TradeRecord, TradeTape},
    wire::{AggTradeEvent, DepthUpdateEvent},
};

/// Wires the feed into two independent reactive pipelines (depth events
/// into the order book, trade events into the tape) and republishes their
/// derived snapshots. Each pipeline exclusively owns its state; consumers
/// only ever see owned copies through the `watch` channels.
pub struct Market {
    feed: MarketFeed,
    book_rx: watch::Receiver<OrderBookView>,
    tape_rx: watch::Receiver<Vec<TradeRecord>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Market {
    pub fn spawn(config: FeedConfig) -> Self {
        let feed = MarketFeed::new(config.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (book_tx, book_rx) = watch::channel(OrderBookView::default());
        let (tape_tx, tape_rx) = watch::channel(Vec::new());

        tokio::spawn(run_book_pipeline(
            feed.subscribe_depth(),
            feed.instrument(),
            book_tx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_tape_pipeline(
            TradeTape::new(config.tape_capacity, config.flash_duration),
            feed.subscribe_trades(),
            feed.instrument(),
            tape_tx,
            config.flash_tick,
            shutdown_rx,
        ));

        Self {
            feed,
            book_rx,
            tape_rx,
            shutdown_tx,
        }
    }

    /// The instrument-selection boundary: opens (or switches) the feed. The
    /// pipelines reset their state off the feed's instrument signal, with
    /// the in-event symbol check kept as a defensive fallback.
    pub async fn switch(&self, instrument: &str) -> Result<(), FeedError> {
        self.feed.open(instrument).await
    }

    pub async fn shutdown(&self) {
        self.feed.close().await;
        let _ = self.shutdown_tx.send(true);
    }

    pub fn book(&self) -> watch::Receiver<OrderBookView> {
        self.book_rx.clone()
    }

    pub fn tape(&self) -> watch::Receiver<Vec<TradeRecord>> {
        self.tape_rx.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.feed.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.feed.status()
    }
}

async fn run_book_pipeline(
    mut depth_rx: broadcast::Receiver<DepthUpdateEvent>,
    mut instrument_rx: watch::Receiver<Option<String>>,
    book_tx: watch::Sender<OrderBookView>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut book = OrderBook::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    return;
                }
            }
            changed = instrument_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let instrument = instrument_rx.borrow_and_update().clone();
                book.reset_for(instrument);
                book_tx.send_replace(book.ranked_view());
            }
            event = depth_rx.recv() => {
                match event {
                    Ok(event) => {
                        book.apply(&event);
                        book_tx.send_replace(book.ranked_view());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropped diffs are tolerated like upstream sequence
                        // gaps; the book catches up on later updates.
                        tracing::warn!(skipped, "depth pipeline lagged behind the feed");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

async fn run_tape_pipeline(
    mut tape: TradeTape,
    mut trade_rx: broadcast::Receiver<AggTradeEvent>,
    mut instrument_rx: watch::Receiver<Option<String>>,
    tape_tx: watch::Sender<Vec<TradeRecord>>,
    flash_tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(flash_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    return;
                }
            }
            changed = instrument_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let instrument = instrument_rx.borrow_and_update().clone();
                tape.reset_for(instrument);
                tape_tx.send_replace(tape.snapshot());
            }
            event = trade_rx.recv() => {
                match event {
                    Ok(event) => {
                        tape.apply(&event, Instant::now());
                        tape_tx.send_replace(tape.snapshot());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "trade pipeline lagged behind the feed");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            _ = tick.tick() => {
                if tape.expire_flashes(Instant::now()) {
                    tape_tx.send_replace(tape.snapshot());
                }
            }
        }
    }
}
