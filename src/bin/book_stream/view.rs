use std::{
    fmt::Write as FmtWrite,
    io::{self, IsTerminal, Stdout, Write},
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    style::Print,
    terminal::{Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand, QueueableCommand,
};
use depthwatch::{
    book::{BookLevel, OrderBookView},
    feed::ConnectionStatus,
    tape::{TradeRecord, TradeSide},
};

const DEPTH_BAR_WIDTH: usize = 12;

/// In-place terminal renderer: alternate screen when interactive, plain
/// frame-per-line output when piped.
pub(crate) struct FrameRenderer {
    stdout: Stdout,
    previous_line_count: usize,
    interactive: bool,
}

impl FrameRenderer {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let interactive = io::stdout().is_terminal();
        let mut stdout = io::stdout();

        if interactive {
            stdout
                .execute(EnterAlternateScreen)
                .context("failed to enter alternate terminal screen")?;
            stdout
                .execute(Hide)
                .context("failed to hide terminal cursor")?;
            stdout
                .execute(Clear(ClearType::All))
                .context("failed to clear terminal screen")?;
            stdout.flush().context("failed to flush terminal output")?;
        }

        Ok(Self {
            stdout,
            previous_line_count: 0,
            interactive,
        })
    }

    pub(crate) fn render(&mut self, frame: &str) -> anyhow::Result<()> {
        if !self.interactive {
            println!("{frame}");
            return Ok(());
        }

        let lines: Vec<&str> = frame.lines().collect();

        for (index, line) in lines.iter().enumerate() {
            let Ok(row) = u16::try_from(index) else {
                break;
            };
            self.stdout
                .queue(MoveTo(0, row))
                .context("failed to move cursor during frame render")?;
            self.stdout
                .queue(Clear(ClearType::CurrentLine))
                .context("failed to clear line during frame render")?;
            self.stdout
                .queue(Print(*line))
                .context("failed to print frame line")?;
        }

        // Blank out any rows left over from a taller previous frame.
        for index in lines.len()..self.previous_line_count {
            let Ok(row) = u16::try_from(index) else {
                break;
            };
            self.stdout
                .queue(MoveTo(0, row))
                .context("failed to move cursor during line cleanup")?;
            self.stdout
                .queue(Clear(ClearType::CurrentLine))
                .context("failed to clear stale frame line")?;
        }

        self.stdout
            .flush()
            .context("failed to flush terminal frame")?;
        self.previous_line_count = lines.len();

        Ok(())
    }
}

impl Drop for FrameRenderer {
    fn drop(&mut self) {
        if !self.interactive {
            return;
        }

        let _ = self.stdout.execute(Show);
        let _ = self.stdout.execute(LeaveAlternateScreen);
        let _ = self.stdout.flush();
    }
}

pub(crate) fn build_market_frame(
    book: &OrderBookView,
    trades: &[TradeRecord],
    status: &ConnectionStatus,
    symbol: &str,
    book_levels: usize,
    trade_rows: usize,
    iteration: u64,
    elapsed: Duration,
) -> String {
    let mut output = String::new();

    let _ = writeln!(
        output,
        "book stream | update={} | elapsed={}s | symbol={} | connected={}",
        iteration,
        elapsed.as_secs(),
        book.symbol.as_deref().unwrap_or(symbol),
        if status.connected { "yes" } else { "no" },
    );
    if let Some(error) = status.error.as_deref() {
        let _ = writeln!(output, "error: {}", error.replace('\n', " | "));
    }
    match book.spread {
        Some(spread) => {
            let _ = writeln!(
                output,
                "spread: {:.6} ({:.4}%)",
                spread.value, spread.percent
            );
        }
        None => {
            let _ = writeln!(output, "spread: -");
        }
    }
    let _ = writeln!(output);

    let max_total = book
        .bids
        .iter()
        .take(book_levels)
        .chain(book.asks.iter().take(book_levels))
        .map(|level| level.total)
        .fold(0.0f64, f64::max);

    let _ = writeln!(output, "        price        amount         total   depth");
    let asks_far_to_near = book
        .asks
        .iter()
        .take(book_levels)
        .rev()
        .collect::<Vec<_>>();
    // Bottom-align asks against the mid line; blank rows pad the far side.
    let ask_offset = book_levels.saturating_sub(asks_far_to_near.len());
    for slot in 0..book_levels {
        let row = slot
            .checked_sub(ask_offset)
            .and_then(|index| asks_far_to_near.get(index).copied());
        let _ = writeln!(output, "{}", format_book_row(row, max_total));
    }

    let _ = writeln!(output, "---------------------- MID ----------------------");

    for slot in 0..book_levels {
        let row = book.bids.get(slot);
        let _ = writeln!(output, "{}", format_book_row(row, max_total));
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "recent trades (newest first)");
    if trades.is_empty() {
        let _ = writeln!(output, "(waiting for trades)");
    }
    for trade in trades.iter().take(trade_rows) {
        let _ = writeln!(output, "{}", format_trade_line(trade));
    }

    output
}

pub(crate) fn build_waiting_frame(symbol: &str, elapsed: Duration, detail: &str) -> String {
    let mut output = String::new();
    let _ = writeln!(
        output,
        "book stream | elapsed={}s | symbol={}",
        elapsed.as_secs(),
        symbol
    );
    let _ = writeln!(output, "{}", detail.replace('\n', " | "));
    output
}

fn format_book_row(row: Option<&BookLevel>, max_total: f64) -> String {
    let Some(row) = row else {
        return format!("{:>13} {:>13} {:>13}   {:<12}", "-", "-", "-", "-");
    };

    format!(
        "{:>13} {:>13} {:>13}   {:<12}",
        format_price(row.price),
        format!("{:.6}", row.amount),
        format!("{:.6}", row.total),
        format_depth_bar(row.total, max_total, DEPTH_BAR_WIDTH),
    )
}

pub(crate) fn format_depth_bar(value: f64, max_value: f64, width: usize) -> String {
    if width == 0 {
        return String::new();
    }

    if max_value <= 0.0 || value <= 0.0 {
        return "-".repeat(width);
    }

    let ratio = (value / max_value).clamp(0.0, 1.0);
    let filled = ((ratio * width as f64).round() as usize).min(width);
    format!("{}{}", "#".repeat(filled), "-".repeat(width - filled))
}

fn format_trade_line(trade: &TradeRecord) -> String {
    let side = match trade.side {
        TradeSide::Buy => "BUY ",
        TradeSide::Sell => "SELL",
    };
    let flash = if trade.flash_active { " *" } else { "" };

    format!(
        "{}  {}  price={:<14} amount={:<12} id={}{}",
        format_trade_time(trade.time),
        side,
        format_price(trade.price),
        format!("{:.6}", trade.amount),
        trade.id,
        flash,
    )
}

fn format_trade_time(timestamp: u64) -> String {
    chrono::DateTime::<Utc>::from_timestamp_millis(timestamp as i64)
        .map(|value| value.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "unknown-time".to_string())
}

fn format_price(value: f64) -> String {
    if value.abs() >= 10_000.0 {
        return format!("{value:.2}");
    }
    if value.abs() >= 100.0 {
        return format!("{value:.4}");
    }
    format!("{value:.6}")
}
