use std::time::Duration;

use anyhow::{Context, Result};

use crate::wire::DEFAULT_WS_BASE_URL;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_base_url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub tape_capacity: usize,
    pub flash_duration: Duration,
    pub flash_tick: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
            reconnect_delay: Duration::from_millis(3_000),
            max_reconnect_attempts: 5,
            tape_capacity: 50,
            flash_duration: Duration::from_millis(500),
            flash_tick: Duration::from_millis(50),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let ws_base_url = std::env::var("BINANCE_WS_URL")
            .unwrap_or(defaults.ws_base_url)
            .trim()
            .trim_end_matches('/')
            .to_string();

        let reconnect_delay = match std::env::var("RECONNECT_DELAY_MS") {
            Ok(value) => Duration::from_millis(
                value
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid RECONNECT_DELAY_MS value: {value}"))?,
            ),
            Err(_) => defaults.reconnect_delay,
        };

        let max_reconnect_attempts = match std::env::var("MAX_RECONNECT_ATTEMPTS") {
            Ok(value) => value
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid MAX_RECONNECT_ATTEMPTS value: {value}"))?,
            Err(_) => defaults.max_reconnect_attempts,
        };

        let tape_capacity = match std::env::var("TRADE_TAPE_CAPACITY") {
            Ok(value) => value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid TRADE_TAPE_CAPACITY value: {value}"))?,
            Err(_) => defaults.tape_capacity,
        };

        let flash_duration = match std::env::var("FLASH_DURATION_MS") {
            Ok(value) => Duration::from_millis(
                value
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid FLASH_DURATION_MS value: {value}"))?,
            ),
            Err(_) => defaults.flash_duration,
        };

        let flash_tick = match std::env::var("FLASH_TICK_MS") {
            Ok(value) => Duration::from_millis(
                value
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid FLASH_TICK_MS value: {value}"))?,
            ),
            Err(_) => defaults.flash_tick,
        };

        Ok(Self {
            ws_base_url,
            reconnect_delay,
            max_reconnect_attempts,
            tape_capacity,
            flash_duration,
            flash_tick,
        })
    }
}
