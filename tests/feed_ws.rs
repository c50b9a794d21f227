use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::any,
    Router,
};
use depthwatch::{config::FeedConfig, feed::ChannelPhase, market::Market};
use serde_json::json;
use tokio::{
    net::TcpListener,
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct MockUpstream {
    trade_connections: Arc<AtomicUsize>,
    depth_connections: Arc<AtomicUsize>,
    trade_frames: broadcast::Sender<String>,
    depth_frames: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

impl MockUpstream {
    fn new() -> Self {
        let (trade_frames, _) = broadcast::channel(64);
        let (depth_frames, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(8);
        Self {
            trade_connections: Arc::new(AtomicUsize::new(0)),
            depth_connections: Arc::new(AtomicUsize::new(0)),
            trade_frames,
            depth_frames,
            kick,
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/{*stream}", any(stream_route))
            .with_state(self.clone())
    }
}

async fn stream_route(
    ws: WebSocketUpgrade,
    Path(stream): Path<String>,
    State(state): State<MockUpstream>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, stream, state))
}

async fn handle_stream(mut socket: WebSocket, stream: String, state: MockUpstream) {
    let is_trade = stream.ends_with("@aggTrade");
    if is_trade {
        state.trade_connections.fetch_add(1, Ordering::SeqCst);
    } else {
        state.depth_connections.fetch_add(1, Ordering::SeqCst);
    }

    let mut frames = if is_trade {
        state.trade_frames.subscribe()
    } else {
        state.depth_frames.subscribe()
    };
    let mut kick = state.kick.subscribe();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Ok(frame) = frame else {
                    break;
                };
                if socket.send(AxumWsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = kick.recv() => {
                break;
            }
            message = socket.recv() => {
                if message.is_none() {
                    break;
                }
            }
        }
    }
}

async fn spawn_server(app: Router) -> (String, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose address");
    let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_receiver.await;
            })
            .await
            .expect("server should run");
    });

    (format!("127.0.0.1:{}", addr.port()), shutdown_sender, task)
}

fn test_config(addr: &str) -> FeedConfig {
    FeedConfig {
        ws_base_url: format!("ws://{addr}"),
        reconnect_delay: Duration::from_millis(100),
        max_reconnect_attempts: 3,
        tape_capacity: 50,
        flash_duration: Duration::from_millis(120),
        flash_tick: Duration::from_millis(20),
    }
}

fn depth_frame(symbol: &str, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    let to_rows = |levels: &[(&str, &str)]| {
        levels
            .iter()
            .map(|(price, quantity)| json!([price, quantity]))
            .collect::<Vec<_>>()
    };
    json!({
        "e": "depthUpdate",
        "E": 1672515782136u64,
        "s": symbol,
        "U": 157,
        "u": 160,
        "b": to_rows(bids),
        "a": to_rows(asks),
    })
    .to_string()
}

fn trade_frame(symbol: &str, id: u64, price: &str, quantity: &str, is_buyer_maker: bool) -> String {
    json!({
        "e": "aggTrade",
        "E": 1672515782136u64,
        "s": symbol,
        "a": id,
        "p": price,
        "q": quantity,
        "f": id,
        "l": id,
        "T": 1672515782134u64 + id,
        "m": is_buyer_maker,
        "M": true,
    })
    .to_string()
}

#[tokio::test]
async fn reconstructs_book_and_tape_from_both_streams() {
    let upstream = MockUpstream::new();
    let (addr, shutdown_server, server) = spawn_server(upstream.router()).await;

    let market = Market::spawn(test_config(&addr));
    market.switch("BTCUSDT").await.expect("feed should open");

    let mut state_rx = market.state();
    timeout(WAIT, state_rx.wait_for(|state| state.connected))
        .await
        .expect("feed should connect")
        .expect("state channel should stay open");

    let mut book_rx = market.book();
    upstream
        .depth_frames
        .send(depth_frame(
            "BTCUSDT",
            &[("100.00", "1.5"), ("99.50", "2.0")],
            &[("100.10", "1.0")],
        ))
        .expect("depth frame should broadcast");

    let view = timeout(WAIT, book_rx.wait_for(|view| !view.bids.is_empty()))
        .await
        .expect("book should update")
        .expect("book channel should stay open")
        .clone();

    assert_eq!(view.symbol.as_deref(), Some("BTCUSDT"));
    assert_eq!(
        view.bids.iter().map(|level| level.price).collect::<Vec<_>>(),
        vec![100.0, 99.5]
    );
    assert_eq!(view.bids[1].total, 3.5);
    let spread = view.spread.expect("spread should exist");
    assert!((spread.value - 0.1).abs() < 1e-9);
    assert!((spread.percent - 0.1 / 100.10 * 100.0).abs() < 1e-9);

    // A zero-quantity change removes the level it names, nothing else.
    upstream
        .depth_frames
        .send(depth_frame("BTCUSDT", &[("100.00", "0")], &[]))
        .expect("depth frame should broadcast");
    let view = timeout(WAIT, book_rx.wait_for(|view| view.bids.len() == 1))
        .await
        .expect("book should update")
        .expect("book channel should stay open")
        .clone();
    assert_eq!(view.bids[0].price, 99.5);

    let mut tape_rx = market.tape();
    upstream
        .trade_frames
        .send(trade_frame("BTCUSDT", 1, "100.05", "0.25", true))
        .expect("trade frame should broadcast");
    upstream
        .trade_frames
        .send(trade_frame("BTCUSDT", 2, "100.06", "0.50", false))
        .expect("trade frame should broadcast");

    let trades = timeout(WAIT, tape_rx.wait_for(|trades| trades.len() == 2))
        .await
        .expect("tape should update")
        .expect("tape channel should stay open")
        .clone();
    assert_eq!(
        trades.iter().map(|trade| trade.id).collect::<Vec<_>>(),
        vec![2, 1]
    );
    assert!(trades[0].flash_active);

    timeout(
        WAIT,
        tape_rx.wait_for(|trades| trades.iter().all(|trade| !trade.flash_active)),
    )
    .await
    .expect("flash should expire")
    .expect("tape channel should stay open");

    market.shutdown().await;
    let _ = shutdown_server.send(());
    let _ = server.await;
}

#[tokio::test]
async fn unexpected_close_reconnects_both_channels() {
    let upstream = MockUpstream::new();
    let (addr, shutdown_server, server) = spawn_server(upstream.router()).await;

    let market = Market::spawn(test_config(&addr));
    market.switch("BTCUSDT").await.expect("feed should open");

    let mut state_rx = market.state();
    timeout(WAIT, state_rx.wait_for(|state| state.connected))
        .await
        .expect("feed should connect")
        .expect("state channel should stay open");

    let trades_before = upstream.trade_connections.load(Ordering::SeqCst);
    let depths_before = upstream.depth_connections.load(Ordering::SeqCst);

    upstream.kick.send(()).expect("kick should broadcast");

    timeout(WAIT, state_rx.wait_for(|state| !state.connected))
        .await
        .expect("close should flip connectivity")
        .expect("state channel should stay open");

    timeout(WAIT, state_rx.wait_for(|state| state.connected))
        .await
        .expect("feed should reconnect")
        .expect("state channel should stay open");

    assert!(upstream.trade_connections.load(Ordering::SeqCst) > trades_before);
    assert!(upstream.depth_connections.load(Ordering::SeqCst) > depths_before);

    market.shutdown().await;
    let _ = shutdown_server.send(());
    let _ = server.await;
}

#[tokio::test]
async fn instrument_switch_resets_state_without_dropping_connectivity() {
    let upstream = MockUpstream::new();
    let (addr, shutdown_server, server) = spawn_server(upstream.router()).await;

    let market = Market::spawn(test_config(&addr));
    market.switch("BTCUSDT").await.expect("feed should open");

    let mut state_rx = market.state();
    timeout(WAIT, state_rx.wait_for(|state| state.connected))
        .await
        .expect("feed should connect")
        .expect("state channel should stay open");

    let mut book_rx = market.book();
    let mut tape_rx = market.tape();
    upstream
        .depth_frames
        .send(depth_frame("BTCUSDT", &[("100.00", "1.5")], &[]))
        .expect("depth frame should broadcast");
    upstream
        .trade_frames
        .send(trade_frame("BTCUSDT", 1, "100.05", "0.25", false))
        .expect("trade frame should broadcast");
    timeout(WAIT, book_rx.wait_for(|view| !view.bids.is_empty()))
        .await
        .expect("book should update")
        .expect("book channel should stay open");
    timeout(WAIT, tape_rx.wait_for(|trades| !trades.is_empty()))
        .await
        .expect("tape should update")
        .expect("tape channel should stay open");

    market.switch("ethusdt").await.expect("switch should open");

    // The explicit switch boundary resets both views before any ETH data.
    let view = timeout(
        WAIT,
        book_rx.wait_for(|view| view.symbol.as_deref() == Some("ETHUSDT")),
    )
    .await
    .expect("book should reset")
    .expect("book channel should stay open")
    .clone();
    assert!(view.bids.is_empty());
    assert!(view.spread.is_none());
    timeout(WAIT, tape_rx.wait_for(|trades| trades.is_empty()))
        .await
        .expect("tape should reset")
        .expect("tape channel should stay open");

    // Connectivity survives the switch and settles open on the new pair.
    let state = timeout(
        WAIT,
        state_rx.wait_for(|state| {
            state.trade == ChannelPhase::Open && state.depth == ChannelPhase::Open
        }),
    )
    .await
    .expect("new channels should open")
    .expect("state channel should stay open")
    .clone();
    assert!(state.connected);
    assert!(!state.switching);

    upstream
        .depth_frames
        .send(depth_frame("ETHUSDT", &[("2000.00", "4.0")], &[]))
        .expect("depth frame should broadcast");
    let view = timeout(WAIT, book_rx.wait_for(|view| !view.bids.is_empty()))
        .await
        .expect("book should update")
        .expect("book channel should stay open")
        .clone();
    assert_eq!(view.bids[0].price, 2000.0);

    market.shutdown().await;
    let _ = shutdown_server.send(());
    let _ = server.await;
}

#[tokio::test]
async fn reconnect_exhaustion_surfaces_a_terminal_error() {
    // Reserve a port with no listener behind it.
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose address");
    drop(listener);

    let config = FeedConfig {
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 2,
        ..test_config(&format!("127.0.0.1:{}", addr.port()))
    };

    let market = Market::spawn(config);
    market.switch("BTCUSDT").await.expect("open should succeed");

    let mut state_rx = market.state();
    let state = timeout(
        WAIT,
        state_rx.wait_for(|state| {
            state
                .error
                .as_deref()
                .is_some_and(|error| error.contains("gave up"))
        }),
    )
    .await
    .expect("exhaustion should surface")
    .expect("state channel should stay open")
    .clone();

    assert!(!state.connected);
    assert!(state.trade == ChannelPhase::Failed || state.depth == ChannelPhase::Failed);

    market.shutdown().await;
}
