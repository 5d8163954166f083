use thiserror::Error;

/// Errors raised while encoding or decoding a [`crate::frame::Frame`].
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("msgpack encode error: {0}")]
    Encode(#[from] std::io::Error),
}

/// Errors raised by the tunnel transport itself (connect, read, write).
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("tunnel closed by peer")]
    Closed,

    #[error("server rejected connection: {0}")]
    Rejected(String),

    #[error("invalid tunnel server url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("token is not a valid header value: {0}")]
    InvalidToken(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}
