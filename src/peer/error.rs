use thiserror::Error;

/// Errors at the peer-connection boundary. None of these propagate past the
/// session: each one converts into a session drop.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("unknown message id {0}")]
    InvalidMessageId(u8),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    #[error("peer silent too long")]
    Silent,

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
