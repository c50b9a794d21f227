use std::{
    env,
    time::{Duration, Instant},
};

use anyhow::Context;
use depthwatch::{config::FeedConfig, market::Market};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;
mod view;

use cli::{parse_args, print_usage, Config, ParseResult};
use view::{build_market_frame, build_waiting_frame, FrameRenderer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let parse_result = match parse_args(&args) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("error: {err}\n");
            print_usage();
            std::process::exit(2);
        }
    };

    match parse_result {
        ParseResult::Help => {
            print_usage();
            Ok(())
        }
        ParseResult::Run(config) => run_viewer(config).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run_viewer(config: Config) -> anyhow::Result<()> {
    let mut feed_config = FeedConfig::from_env().context("failed to load configuration")?;
    if let Some(ws_url) = config.ws_url.as_deref() {
        feed_config.ws_base_url = ws_url.trim_end_matches('/').to_string();
    }

    let market = Market::spawn(feed_config);
    market
        .switch(&config.symbol)
        .await
        .with_context(|| format!("failed to open feed for `{}`", config.symbol))?;

    let mut book_rx = market.book();
    let mut tape_rx = market.tape();
    let mut state_rx = market.state();

    let mut renderer = FrameRenderer::new()?;
    let started_at = Instant::now();
    let mut iteration = 0u64;

    renderer.render(&build_waiting_frame(
        &config.symbol,
        started_at.elapsed(),
        "waiting for stream updates",
    ))?;

    let mut stop_check = tokio::time::interval(Duration::from_millis(50));
    stop_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
    stop_check.tick().await;

    let stop_reason = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break "received Ctrl+C";
            }
            _ = stop_check.tick() => {
                if should_stop(started_at, iteration, &config) {
                    break "reached configured stop condition";
                }
            }
            changed = book_rx.changed() => {
                if changed.is_err() {
                    break "market pipelines stopped";
                }
                iteration += 1;
                render_frame(&mut renderer, &book_rx, &tape_rx, &state_rx, &config, iteration, started_at)?;
                if should_stop(started_at, iteration, &config) {
                    break "reached configured stop condition";
                }
            }
            changed = tape_rx.changed() => {
                if changed.is_err() {
                    break "market pipelines stopped";
                }
                render_frame(&mut renderer, &book_rx, &tape_rx, &state_rx, &config, iteration, started_at)?;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break "market pipelines stopped";
                }
                render_frame(&mut renderer, &book_rx, &tape_rx, &state_rx, &config, iteration, started_at)?;
            }
        }
    };

    market.shutdown().await;
    drop(renderer);
    println!("stopped: {stop_reason}");
    Ok(())
}

fn render_frame(
    renderer: &mut FrameRenderer,
    book_rx: &tokio::sync::watch::Receiver<depthwatch::book::OrderBookView>,
    tape_rx: &tokio::sync::watch::Receiver<Vec<depthwatch::tape::TradeRecord>>,
    state_rx: &tokio::sync::watch::Receiver<depthwatch::feed::ConnectionState>,
    config: &Config,
    iteration: u64,
    started_at: Instant,
) -> anyhow::Result<()> {
    let book = book_rx.borrow().clone();
    let trades = tape_rx.borrow().clone();
    let status = state_rx.borrow().status();

    let frame = build_market_frame(
        &book,
        &trades,
        &status,
        &config.symbol,
        config.book_levels,
        config.trade_rows,
        iteration,
        started_at.elapsed(),
    );
    renderer.render(&frame)
}

fn should_stop(started_at: Instant, iteration: u64, config: &Config) -> bool {
    if let Some(max_iterations) = config.iterations {
        if iteration >= max_iterations {
            return true;
        }
    }

    if let Some(duration_secs) = config.duration_secs {
        if started_at.elapsed() >= Duration::from_secs(duration_secs) {
            return true;
        }
    }

    false
}
