use thiserror::Error;

/// Errors returned at the torrent's public boundary. Internal failures
/// (peer, tracker) never surface here; they convert to drops and retries.
#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("torrent is closed")]
    Closed,

    #[error("data transfer already started")]
    AlreadyStarted,

    #[error("info dictionary not known yet")]
    NoInfo,

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] crate::metainfo::MetainfoError),
}
