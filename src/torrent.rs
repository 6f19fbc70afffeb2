//! Per-torrent state and the coordinator task.
//!
//! Every torrent runs one coordinator task that owns all torrent-global
//! state: the active session table, the candidate peer list, the piece
//! registry, the choker and the announce timers. Peer sessions, the hasher
//! and the announcer talk to it exclusively through channels, so every
//! state transition is serialized through one event loop. Public methods on
//! [`Torrent`] post commands onto the same loop and await their
//! acknowledgement, which makes user calls linear with internal events.

mod choker;
mod coordinator;
mod error;
mod hasher;
mod info_sync;
mod pieces;
mod stats;

use std::net::SocketAddr;

pub use coordinator::Torrent;
pub(crate) use coordinator::{DialEvent, PendingSession, TorrentParams};
pub use error::TorrentError;
pub use pieces::{
    PieceSelector, PieceTable, PieceView, RarestFirst, SelectorFactory, ENDGAME_THRESHOLD,
};
pub use stats::TorrentStats;

#[cfg(test)]
mod tests;

/// Which subsystem produced a peer candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    /// Added through [`Torrent::add_peers`].
    User,
    /// The peer dialed us.
    Incoming,
    /// Learned through the DHT.
    Dht,
    /// Returned by a tracker announce.
    Tracker,
}

/// A peer candidate: an address plus where we heard about it. Deduplicated
/// by address against both the active set and the candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub source: PeerSource,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self { addr, source }
    }
}
