const DEFAULT_SYMBOL: &str = "BTCUSDT";
const DEFAULT_BOOK_LEVELS: usize = 10;
const DEFAULT_TRADE_ROWS: usize = 10;
const MAX_BOOK_LEVELS: usize = 20;
const MAX_TRADE_ROWS: usize = 50;

const USAGE: &str = r#"Usage:
  cargo run --bin book_stream -- [options]

Renders a live order book, spread, and recent-trade tape for one Binance
spot pair, reconstructed locally from the aggTrade and depth-diff streams.

Options:
  --symbol <symbol>        Trading pair (default: BTCUSDT)
  --ws-url <url>           Websocket base URL override
  --levels <count>         Book levels to display per side (max: 20)
  --trades <count>         Trade rows to display (max: 50)
  --duration-secs <secs>   Stop after this duration
  --iterations <count>     Stop after this many book updates

Examples:
  cargo run --bin book_stream
  cargo run --bin book_stream -- --symbol ETHUSDT --levels 15
"#;

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) symbol: String,
    pub(crate) ws_url: Option<String>,
    pub(crate) book_levels: usize,
    pub(crate) trade_rows: usize,
    pub(crate) duration_secs: Option<u64>,
    pub(crate) iterations: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum ParseResult {
    Help,
    Run(Config),
}

pub(crate) fn print_usage() {
    println!("{USAGE}");
}

pub(crate) fn parse_args(args: &[String]) -> Result<ParseResult, String> {
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(ParseResult::Help);
    }

    let mut config = Config {
        symbol: DEFAULT_SYMBOL.to_string(),
        ws_url: None,
        book_levels: DEFAULT_BOOK_LEVELS,
        trade_rows: DEFAULT_TRADE_ROWS,
        duration_secs: None,
        iterations: None,
    };

    let mut index = 0usize;
    while index < args.len() {
        let flag = &args[index];
        let value = |i: &mut usize| -> Result<String, String> {
            let next = *i + 1;
            if next >= args.len() {
                return Err(format!("missing value for `{flag}`"));
            }
            *i = next;
            Ok(args[*i].clone())
        };

        match flag.as_str() {
            "--symbol" => {
                config.symbol = value(&mut index)?;
            }
            "--ws-url" => {
                config.ws_url = Some(value(&mut index)?);
            }
            "--levels" => {
                let levels = parse_usize_gt_zero("--levels", &value(&mut index)?)?;
                config.book_levels = levels.min(MAX_BOOK_LEVELS);
            }
            "--trades" => {
                let rows = parse_usize_gt_zero("--trades", &value(&mut index)?)?;
                config.trade_rows = rows.min(MAX_TRADE_ROWS);
            }
            "--duration-secs" => {
                config.duration_secs =
                    Some(parse_u64_gt_zero("--duration-secs", &value(&mut index)?)?);
            }
            "--iterations" => {
                config.iterations = Some(parse_u64_gt_zero("--iterations", &value(&mut index)?)?);
            }
            _ => {
                return Err(format!("unknown argument `{flag}`"));
            }
        }

        index += 1;
    }

    if config.symbol.trim().is_empty() {
        return Err("`--symbol` cannot be empty".to_string());
    }
    if let Some(ws_url) = config.ws_url.as_deref() {
        if ws_url.trim().is_empty() {
            return Err("`--ws-url` cannot be empty".to_string());
        }
    }

    Ok(ParseResult::Run(config))
}

fn parse_u64_gt_zero(field: &str, value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|_| format!("`{field}` expects a positive integer"))?;
    if parsed == 0 {
        return Err(format!("`{field}` must be greater than 0"));
    }
    Ok(parsed)
}

fn parse_usize_gt_zero(field: &str, value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|_| format!("`{field}` expects a positive integer"))?;
    if parsed == 0 {
        return Err(format!("`{field}` must be greater than 0"));
    }
    Ok(parsed)
}
