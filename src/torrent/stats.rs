use tokio::time::Instant;

/// Torrent-wide transfer totals, mutated only by the coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TorrentStats {
    /// Useful payload bytes received.
    pub downloaded: u64,
    /// Useful payload bytes sent.
    pub uploaded: u64,
    /// Bytes still missing from verified pieces.
    pub left: u64,
}

/// Per-session counters kept by the coordinator alongside each session's
/// command queue.
#[derive(Debug)]
pub struct SessionStats {
    pub downloaded: u64,
    pub uploaded: u64,
    /// Totals at the last choker window boundary; rates are the deltas.
    pub window_downloaded: u64,
    pub window_uploaded: u64,
    /// Bytes this session contributed to pieces that failed verification.
    /// The highest scorer gets banned on the next failure.
    pub corrupt: u64,
    pub connected_at: Instant,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            downloaded: 0,
            uploaded: 0,
            window_downloaded: 0,
            window_uploaded: 0,
            corrupt: 0,
            connected_at: Instant::now(),
        }
    }

    /// Download bytes since the last window rollover.
    pub fn download_rate(&self) -> u64 {
        self.downloaded - self.window_downloaded
    }

    /// Upload bytes since the last window rollover.
    pub fn upload_rate(&self) -> u64 {
        self.uploaded - self.window_uploaded
    }

    pub fn roll_window(&mut self) {
        self.window_downloaded = self.downloaded;
        self.window_uploaded = self.uploaded;
    }
}
