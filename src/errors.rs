#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("invalid instrument `{0}`")]
    InvalidInstrument(String),
    #[error("connection error: {0}")]
    Transport(String),
    #[error("{channel} stream gave up after {attempts} reconnect attempts; re-open the feed to resume")]
    ReconnectExhausted { channel: &'static str, attempts: u32 },
}
