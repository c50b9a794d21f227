use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch, Mutex},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    config::FeedConfig,
    errors::FeedError,
    wire::{self, AggTradeEvent, DepthUpdateEvent},
};

const EVENT_BROADCAST_CAPACITY: usize = 512;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Trade,
    Depth,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Depth => "depth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelPhase {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Failed,
}

/// Transitions applied to [`ConnectionState`]. Channel tasks report these;
/// the state machine is the single place connectivity rules live, so the
/// switching/closing races are explicit instead of spread across callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedTransition {
    SwitchStarted,
    ChannelConnecting(ChannelKind),
    ChannelOpened(ChannelKind),
    /// An unexpected close observed by the channel reader.
    ChannelClosed(ChannelKind),
    TransportError(ChannelKind, String),
    ReconnectExhausted(ChannelKind, u32),
    Shutdown,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub trade: ChannelPhase,
    pub depth: ChannelPhase,
    pub switching: bool,
    /// Stored rather than derived: while `switching` it keeps its previous
    /// value, and only flips true once both channels report open.
    pub connected: bool,
    pub error: Option<String>,
}

/// Downstream connectivity projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub error: Option<String>,
}

impl ConnectionState {
    pub fn apply(&mut self, transition: &FeedTransition) {
        match transition {
            FeedTransition::SwitchStarted => {
                self.switching = true;
                self.trade = ChannelPhase::Connecting;
                self.depth = ChannelPhase::Connecting;
            }
            FeedTransition::ChannelConnecting(kind) => {
                *self.phase_mut(*kind) = ChannelPhase::Connecting;
            }
            FeedTransition::ChannelOpened(kind) => {
                *self.phase_mut(*kind) = ChannelPhase::Open;
                self.error = None;
                if self.trade == ChannelPhase::Open && self.depth == ChannelPhase::Open {
                    self.switching = false;
                    self.connected = true;
                }
            }
            FeedTransition::ChannelClosed(kind) => {
                *self.phase_mut(*kind) = ChannelPhase::Reconnecting;
                if !self.switching {
                    self.connected = false;
                }
            }
            FeedTransition::TransportError(_, message) => {
                // The close handler stays authoritative for connectivity.
                self.error = Some(message.clone());
            }
            FeedTransition::ReconnectExhausted(kind, attempts) => {
                *self.phase_mut(*kind) = ChannelPhase::Failed;
                self.connected = false;
                self.error = Some(
                    FeedError::ReconnectExhausted {
                        channel: kind.as_str(),
                        attempts: *attempts,
                    }
                    .to_string(),
                );
            }
            FeedTransition::Shutdown => {
                *self = ConnectionState::default();
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.connected,
            error: self.error.clone(),
        }
    }

    fn phase_mut(&mut self, kind: ChannelKind) -> &mut ChannelPhase {
        match kind {
            ChannelKind::Trade => &mut self.trade,
            ChannelKind::Depth => &mut self.depth,
        }
    }
}

/// Owns the two streaming channels for the active instrument and exposes
/// their events plus a connectivity state. `open` doubles as the explicit
/// instrument-switch boundary.
pub struct MarketFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    config: FeedConfig,
    /// Bumped on every `open`/`close`; transitions from a stale session are
    /// discarded, so a late close from a retired channel cannot corrupt the
    /// state of its successor.
    session: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    instrument_tx: watch::Sender<Option<String>>,
    trade_tx: broadcast::Sender<AggTradeEvent>,
    depth_tx: broadcast::Sender<DepthUpdateEvent>,
    active: Mutex<Option<FeedSession>>,
}

struct FeedSession {
    instrument: String,
    shutdown_tx: watch::Sender<bool>,
}

impl MarketFeed {
    pub fn new(config: FeedConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (instrument_tx, _) = watch::channel(None);
        let (trade_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let (depth_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);

        Self {
            inner: Arc::new(FeedInner {
                config,
                session: AtomicU64::new(0),
                state_tx,
                instrument_tx,
                trade_tx,
                depth_tx,
                active: Mutex::new(None),
            }),
        }
    }

    /// Opens both streaming channels for `instrument`. When channels for a
    /// previous instrument exist this is the switch protocol: mark
    /// switching, retire the old channels (their closes are expected and do
    /// not flip `connected`), then bring up fresh ones.
    pub async fn open(&self, instrument: &str) -> Result<(), FeedError> {
        let instrument = wire::normalize_instrument(instrument)?;
        let mut active = self.inner.active.lock().await;

        if let Some(previous) = active.take() {
            tracing::info!(
                from = %previous.instrument,
                to = %instrument,
                "switching instrument"
            );
            self.inner
                .state_tx
                .send_modify(|state| state.apply(&FeedTransition::SwitchStarted));
            let _ = previous.shutdown_tx.send(true);
        }

        // Invalidate transitions from the retired channels before the new
        // ones start reporting.
        let session = self.inner.session.fetch_add(1, Ordering::SeqCst) + 1;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        for kind in [ChannelKind::Trade, ChannelKind::Depth] {
            let endpoint = match kind {
                ChannelKind::Trade => {
                    wire::trade_endpoint(&self.inner.config.ws_base_url, &instrument)
                }
                ChannelKind::Depth => {
                    wire::depth_endpoint(&self.inner.config.ws_base_url, &instrument)
                }
            };
            tokio::spawn(run_channel(
                self.inner.clone(),
                session,
                kind,
                endpoint,
                shutdown_rx.clone(),
            ));
        }

        *active = Some(FeedSession {
            instrument: instrument.clone(),
            shutdown_tx,
        });
        drop(active);

        self.inner.instrument_tx.send_replace(Some(instrument));
        Ok(())
    }

    /// Tears both channels down and cancels any pending reconnect timer.
    pub async fn close(&self) {
        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            tracing::info!(instrument = %previous.instrument, "closing feed");
            let _ = previous.shutdown_tx.send(true);
        }
        self.inner.session.fetch_add(1, Ordering::SeqCst);
        self.inner
            .state_tx
            .send_modify(|state| state.apply(&FeedTransition::Shutdown));
        self.inner.instrument_tx.send_replace(None);
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state_tx.borrow().status()
    }

    /// The explicit switch signal: holds the active instrument, `None` when
    /// closed. Consumers reset their per-instrument state on change instead
    /// of waiting for mismatching data to arrive.
    pub fn instrument(&self) -> watch::Receiver<Option<String>> {
        self.inner.instrument_tx.subscribe()
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<AggTradeEvent> {
        self.inner.trade_tx.subscribe()
    }

    pub fn subscribe_depth(&self) -> broadcast::Receiver<DepthUpdateEvent> {
        self.inner.depth_tx.subscribe()
    }
}

impl FeedInner {
    fn report(&self, session: u64, transition: FeedTransition) {
        if self.session.load(Ordering::SeqCst) != session {
            return;
        }
        self.state_tx.send_modify(|state| state.apply(&transition));
    }

    fn dispatch_frame(&self, kind: ChannelKind, payload: &str) {
        match kind {
            ChannelKind::Trade => {
                if let Some(event) = wire::parse_trade_frame(payload) {
                    let _ = self.trade_tx.send(event);
                }
            }
            ChannelKind::Depth => {
                if let Some(event) = wire::parse_depth_frame(payload) {
                    let _ = self.depth_tx.send(event);
                }
            }
        }
    }
}

enum ReadOutcome {
    Shutdown,
    Closed,
}

async fn run_channel(
    inner: Arc<FeedInner>,
    session: u64,
    kind: ChannelKind,
    endpoint: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        inner.report(session, FeedTransition::ChannelConnecting(kind));

        match connect_async(endpoint.as_str()).await {
            Ok((stream, _response)) => {
                attempts = 0;
                inner.report(session, FeedTransition::ChannelOpened(kind));
                tracing::info!(channel = kind.as_str(), endpoint = %endpoint, "channel open");

                match read_frames(&inner, session, kind, stream, &mut shutdown).await {
                    ReadOutcome::Shutdown => return,
                    ReadOutcome::Closed => {
                        if *shutdown.borrow() {
                            return;
                        }
                        inner.report(session, FeedTransition::ChannelClosed(kind));
                        tracing::warn!(channel = kind.as_str(), "channel closed unexpectedly");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    channel = kind.as_str(),
                    endpoint = %endpoint,
                    error = %err,
                    "failed to connect channel"
                );
                inner.report(
                    session,
                    FeedTransition::TransportError(
                        kind,
                        FeedError::Transport(err.to_string()).to_string(),
                    ),
                );
            }
        }

        attempts += 1;
        if attempts >= inner.config.max_reconnect_attempts {
            inner.report(session, FeedTransition::ReconnectExhausted(kind, attempts));
            tracing::error!(
                channel = kind.as_str(),
                attempts,
                "reconnect attempts exhausted"
            );
            return;
        }

        // The sleep races shutdown so teardown cancels a pending reconnect.
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    return;
                }
            }
            _ = sleep(inner.config.reconnect_delay) => {}
        }
    }
}

async fn read_frames(
    inner: &FeedInner,
    session: u64,
    kind: ChannelKind,
    mut stream: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> ReadOutcome {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    let _ = stream.close(None).await;
                    return ReadOutcome::Shutdown;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        inner.dispatch_frame(kind, text.as_ref());
                    }
                    Some(Ok(Message::Binary(binary))) => {
                        if let Ok(text) = String::from_utf8(binary.to_vec()) {
                            inner.dispatch_frame(kind, &text);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if stream.send(Message::Pong(payload)).await.is_err() {
                            return ReadOutcome::Closed;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        return ReadOutcome::Closed;
                    }
                    Some(Err(err)) => {
                        inner.report(
                            session,
                            FeedTransition::TransportError(
                                kind,
                                FeedError::Transport(err.to_string()).to_string(),
                            ),
                        );
                        tracing::warn!(channel = kind.as_str(), error = %err, "channel read error");
                        return ReadOutcome::Closed;
                    }
                    None => {
                        return ReadOutcome::Closed;
                    }
                    _ => {}
                }
            }
        }
    }
}
