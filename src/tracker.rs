//! HTTP tracker announces (BEP-3) and the announcer worker.
//!
//! Each client runs one announcer task. Torrents submit [`AnnounceJob`]s on
//! its queue; the worker performs the HTTP round trip and posts the outcome
//! back on the per-torrent reply channel, so a slow or dead tracker never
//! stalls a coordinator.

mod error;
mod http;
mod response;

pub use error::TrackerError;
pub use http::announce;
pub use response::{parse_compact_peers, AnnounceResponse, TrackerEvent};

use tokio::sync::mpsc;
use tracing::debug;

/// Transfer totals reported with every announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// One announce request from a torrent.
#[derive(Debug)]
pub struct AnnounceJob {
    pub url: String,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub event: TrackerEvent,
    pub stats: AnnounceStats,
    /// Where the outcome goes; the torrent's coordinator selects on the
    /// other end.
    pub reply: mpsc::Sender<AnnounceOutcome>,
}

pub type AnnounceOutcome = Result<AnnounceResponse, TrackerError>;

/// Spawns the announcer worker. It exits when every job sender is gone.
pub fn spawn_announcer() -> mpsc::Sender<AnnounceJob> {
    let (tx, mut rx) = mpsc::channel::<AnnounceJob>(16);
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        while let Some(job) = rx.recv().await {
            let outcome = announce(&client, &job).await;
            if let Err(err) = &outcome {
                debug!(url = %job.url, %err, "announce failed");
            }
            // the torrent may have closed; nothing to do then
            let _ = job.reply.try_send(outcome);
        }
    });
    tx
}

#[cfg(test)]
mod tests;
