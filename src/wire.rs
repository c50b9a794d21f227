use serde::Deserialize;

use crate::errors::FeedError;

pub const DEFAULT_WS_BASE_URL: &str = "wss://stream.binance.com/ws";

pub const AGG_TRADE_EVENT_TYPE: &str = "aggTrade";
pub const DEPTH_UPDATE_EVENT_TYPE: &str = "depthUpdate";

/// One `(price, quantity)` change from a depth diff, both decimal text as
/// sent on the wire. A quantity parsing to zero removes the level.
pub type LevelChange = (String, String);

#[derive(Debug, Clone, Deserialize)]
pub struct AggTradeEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "a")]
    pub aggregate_id: u64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "f")]
    pub first_trade_id: u64,
    #[serde(rename = "l")]
    pub last_trade_id: u64,
    #[serde(rename = "T")]
    pub trade_time: u64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
    #[serde(rename = "M", default)]
    pub ignore: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdateEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    #[serde(rename = "b")]
    pub bid_changes: Vec<LevelChange>,
    #[serde(rename = "a")]
    pub ask_changes: Vec<LevelChange>,
}

/// Parses a trade-channel frame. Frames that fail to decode or carry an
/// unexpected event tag are dropped (`None`) without affecting the channel.
pub fn parse_trade_frame(payload: &str) -> Option<AggTradeEvent> {
    let event = serde_json::from_str::<AggTradeEvent>(payload).ok()?;
    (event.event_type == AGG_TRADE_EVENT_TYPE).then_some(event)
}

/// Parses a depth-channel frame; same drop semantics as [`parse_trade_frame`].
pub fn parse_depth_frame(payload: &str) -> Option<DepthUpdateEvent> {
    let event = serde_json::from_str::<DepthUpdateEvent>(payload).ok()?;
    (event.event_type == DEPTH_UPDATE_EVENT_TYPE).then_some(event)
}

pub fn trade_endpoint(base_url: &str, instrument: &str) -> String {
    format!(
        "{}/{}@aggTrade",
        base_url.trim_end_matches('/'),
        instrument.to_ascii_lowercase(),
    )
}

pub fn depth_endpoint(base_url: &str, instrument: &str) -> String {
    format!(
        "{}/{}@depth@100ms",
        base_url.trim_end_matches('/'),
        instrument.to_ascii_lowercase(),
    )
}

pub fn normalize_instrument(instrument: &str) -> Result<String, FeedError> {
    let trimmed = instrument.trim();
    if trimmed.is_empty() {
        return Err(FeedError::InvalidInstrument(instrument.to_string()));
    }

    if !trimmed.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(FeedError::InvalidInstrument(instrument.to_string()));
    }

    Ok(trimmed.to_ascii_uppercase())
}
