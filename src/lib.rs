//! tidal - a BitTorrent engine
//!
//! The core of the crate is the per-torrent coordinator: one task that owns
//! all torrent-global state and arbitrates between peer sessions, the piece
//! registry, the hasher worker and the announcer over bounded channels.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`metainfo`] - torrent files and info dictionaries
//! - [`peer`] - BEP-3/10 peer wire protocol and the per-connection session
//! - [`torrent`] - the coordinator, piece scheduling, choking, verification
//! - [`tracker`] - BEP-3 HTTP announces
//! - [`storage`] - block storage behind the coordinator, sessions and hasher
//! - [`client`] - listener, dialer and configuration

pub mod bencode;
pub mod client;
pub mod metainfo;
pub mod peer;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use bencode::{decode, encode, BencodeError, Value};
pub use client::{Client, ClientError, Config};
pub use metainfo::{Info, InfoHash, Metainfo, MetainfoError};
pub use peer::{Bitfield, Handshake, Message, PeerError, PeerId};
pub use storage::{FileStorage, MemoryStorage, OpenStorage, Storage, StorageError};
pub use torrent::{PeerInfo, PeerSource, Torrent, TorrentError, TorrentStats};
pub use tracker::{TrackerError, TrackerEvent};
