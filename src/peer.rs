//! Peer wire protocol (BEP-3, BEP-10) and the per-connection session task.
//!
//! One [`PeerSession`] task per established connection. The session is the
//! only reader and writer of its socket; it converts wire messages into
//! events for the torrent coordinator and executes the coordinator's
//! commands in order. The metadata exchange (BEP-9) rides on the extension
//! protocol framing defined here.

mod bitfield;
mod error;
mod extension;
mod message;
mod metadata;
mod peer_id;
mod session;
mod transport;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID, UT_METADATA_LOCAL_ID};
pub use message::{Handshake, Message, MessageId, BLOCK_SIZE, HANDSHAKE_LEN};
pub use metadata::{metadata_piece_count, MetadataMessage, METADATA_PIECE_SIZE};
pub use peer_id::PeerId;
pub use session::{
    BlockRequest, PeerEvent, PeerSession, SessionCommand, SessionEvent, SessionId, StorageCtx,
    COMMAND_QUEUE_LEN,
};
pub use transport::PeerTransport;
