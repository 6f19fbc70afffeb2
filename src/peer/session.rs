use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID, UT_METADATA_LOCAL_ID};
use super::message::{Message, BLOCK_SIZE};
use super::metadata::MetadataMessage;
use super::transport::PeerTransport;
use crate::storage::Storage;

/// Depth of the coordinator-to-session command queue. The coordinator never
/// blocks on it: a session that stops draining gets dropped instead.
pub const COMMAND_QUEUE_LEN: usize = 64;

/// Most queued peer requests we hold before shedding the oldest.
const MAX_PEER_REQUESTS: usize = 250;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
const SILENCE_LIMIT: Duration = Duration::from_secs(240);

/// Coordinator-assigned identity of one session. Stable for the life of the
/// connection; never reused within a torrent.
pub type SessionId = u64;

/// A block to transfer: piece index, byte offset within the piece, length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, begin: u32, length: u32) -> Self {
        Self {
            piece,
            begin,
            length,
        }
    }
}

/// Everything a session needs once the info dictionary is known: the block
/// store for serving uploads, piece geometry for validating requests, and
/// the raw info bytes for serving the metadata extension.
pub struct StorageCtx {
    pub storage: Arc<dyn Storage>,
    pub piece_length: u64,
    pub num_pieces: u32,
    pub total_length: u64,
    pub raw_info: Bytes,
}

impl std::fmt::Debug for StorageCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCtx")
            .field("piece_length", &self.piece_length)
            .field("num_pieces", &self.num_pieces)
            .field("total_length", &self.total_length)
            .finish_non_exhaustive()
    }
}

impl StorageCtx {
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length;
        (self.total_length - start).min(self.piece_length) as u32
    }

    pub fn global_offset(&self, piece: u32, begin: u32) -> u64 {
        piece as u64 * self.piece_length + begin as u64
    }

    pub fn valid_block(&self, piece: u32, begin: u32, length: u32) -> bool {
        piece < self.num_pieces
            && length > 0
            && begin
                .checked_add(length)
                .is_some_and(|end| end <= self.piece_len(piece))
    }
}

/// Inbound event from a session to the coordinator.
#[derive(Debug)]
pub struct PeerEvent {
    pub session: SessionId,
    pub event: SessionEvent,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// The peer's interest in our data changed.
    PeerInterested(bool),
    /// The peer choked (true) or unchoked (false) us. On choke every
    /// outstanding request we had sent is implicitly discarded.
    PeerChoked(bool),
    Have(u32),
    /// Raw bitfield payload; the coordinator interprets it against the
    /// piece count, which the session may not know yet.
    Bitfield(Bytes),
    BlockDownloaded {
        request: BlockRequest,
        data: Bytes,
    },
    BlockUploaded(BlockRequest),
    /// The peer's DHT port (BEP-5).
    Port(u16),
    ExtendedHandshake {
        ut_metadata: Option<u8>,
        metadata_size: Option<i64>,
    },
    MetadataPiece {
        piece: u32,
        total_size: i64,
        data: Bytes,
    },
    MetadataRejected(u32),
    /// Always the session's final event, sent exactly once after the socket
    /// is closed.
    Dropped,
}

/// Ordered command from the coordinator to one session.
#[derive(Debug)]
pub enum SessionCommand {
    /// The info dictionary became known; carries the storage context.
    HaveInfo(Arc<StorageCtx>),
    /// Our owned-piece bitfield, sent on the wire at admission.
    Bitfield(Bitfield),
    Have(u32),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Send these requests and add them to the in-flight set.
    Request(Vec<BlockRequest>),
    /// Endgame cancel for a block another session completed first.
    Cancel(BlockRequest),
    RequestMetadata(u32),
    Port(u16),
    Drop,
}

enum Step {
    Shutdown,
    Command(Option<SessionCommand>),
    Wire(Result<Message, PeerError>),
    Timer,
    Serve,
}

/// One established connection. Owns the socket exclusively; all other state
/// it touches is its own.
pub struct PeerSession {
    id: SessionId,
    addr: SocketAddr,
    transport: PeerTransport,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<SessionCommand>,
    shutdown: watch::Receiver<bool>,
    peer_supports_extensions: bool,

    ctx: Option<Arc<StorageCtx>>,
    /// Our verified pieces, mirrored from coordinator commands; requests
    /// are validated against it.
    ours: Bitfield,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    /// Requests we have sent and not yet seen answered or cancelled.
    inflight: HashSet<BlockRequest>,
    /// Requests the peer sent and we have not served yet.
    peer_requests: VecDeque<BlockRequest>,
    peer_ut_metadata: Option<u8>,
    /// Set once any message beyond the keep-alive/extended/port prelude
    /// arrives; a bitfield after that is a protocol violation.
    past_prelude: bool,
    last_send: Instant,
    last_recv: Instant,
}

impl PeerSession {
    /// Spawns the session task and returns its command queue.
    pub fn spawn(
        id: SessionId,
        addr: SocketAddr,
        transport: PeerTransport,
        peer_supports_extensions: bool,
        events: mpsc::Sender<PeerEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Sender<SessionCommand> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        let now = Instant::now();
        let session = PeerSession {
            id,
            addr,
            transport,
            events,
            commands: cmd_rx,
            shutdown,
            peer_supports_extensions,
            ctx: None,
            ours: Bitfield::new(0),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            inflight: HashSet::new(),
            peer_requests: VecDeque::new(),
            peer_ut_metadata: None,
            past_prelude: false,
            last_send: now,
            last_recv: now,
        };
        tokio::spawn(session.run());
        cmd_tx
    }

    async fn run(mut self) {
        if let Err(err) = self.drive().await {
            debug!(peer = %self.addr, %err, "session closed");
        }
        // socket closes when the transport drops; the coordinator removes us
        // when it sees this event
        let _ = self
            .events
            .send(PeerEvent {
                session: self.id,
                event: SessionEvent::Dropped,
            })
            .await;
    }

    async fn drive(&mut self) -> Result<(), PeerError> {
        if self.peer_supports_extensions {
            self.send_extension_handshake().await?;
        }
        loop {
            let keepalive_at = self.last_send + KEEPALIVE_INTERVAL;
            let silence_at = self.last_recv + SILENCE_LIMIT;
            let can_serve =
                !self.peer_requests.is_empty() && !self.am_choking && self.ctx.is_some();

            let step = {
                let shutdown = &mut self.shutdown;
                let commands = &mut self.commands;
                let transport = &mut self.transport;
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => Step::Shutdown,
                    cmd = commands.recv() => Step::Command(cmd),
                    msg = transport.receive_message() => Step::Wire(msg),
                    _ = sleep_until(keepalive_at.min(silence_at)) => Step::Timer,
                    _ = std::future::ready(()), if can_serve => Step::Serve,
                }
            };

            match step {
                Step::Shutdown => return Ok(()),
                Step::Command(None) | Step::Command(Some(SessionCommand::Drop)) => return Ok(()),
                Step::Command(Some(cmd)) => self.on_command(cmd).await?,
                Step::Wire(msg) => self.on_message(msg?).await?,
                Step::Timer => {
                    if Instant::now() >= silence_at {
                        return Err(PeerError::Silent);
                    }
                    self.send(Message::KeepAlive).await?;
                }
                Step::Serve => self.serve_one().await?,
            }
        }
    }

    async fn on_command(&mut self, cmd: SessionCommand) -> Result<(), PeerError> {
        match cmd {
            SessionCommand::HaveInfo(ctx) => {
                if self.ours.piece_count() == 0 {
                    self.ours = Bitfield::new(ctx.num_pieces as usize);
                }
                self.ctx = Some(ctx);
                // re-handshake so the peer learns metadata_size
                if self.peer_supports_extensions {
                    self.send_extension_handshake().await?;
                }
            }
            SessionCommand::Bitfield(bf) => {
                self.send(Message::Bitfield(bf.to_bytes())).await?;
                self.ours = bf;
            }
            SessionCommand::Have(piece) => {
                self.ours.set_piece(piece as usize);
                self.send(Message::Have { piece }).await?;
            }
            SessionCommand::Choke => {
                if !self.am_choking {
                    self.am_choking = true;
                    self.peer_requests.clear();
                    self.send(Message::Choke).await?;
                }
            }
            SessionCommand::Unchoke => {
                if self.am_choking {
                    self.am_choking = false;
                    self.send(Message::Unchoke).await?;
                }
            }
            SessionCommand::Interested => {
                if !self.am_interested {
                    self.am_interested = true;
                    self.send(Message::Interested).await?;
                }
            }
            SessionCommand::NotInterested => {
                if self.am_interested {
                    self.am_interested = false;
                    self.send(Message::NotInterested).await?;
                }
            }
            SessionCommand::Request(requests) => {
                for request in requests {
                    // a choke may have arrived after the coordinator queued
                    // these; the choke event returns them to the registry
                    if self.peer_choking {
                        break;
                    }
                    if self.inflight.insert(request) {
                        self.send(Message::Request {
                            index: request.piece,
                            begin: request.begin,
                            length: request.length,
                        })
                        .await?;
                    }
                }
            }
            SessionCommand::Cancel(request) => {
                if self.inflight.remove(&request) {
                    self.send(Message::Cancel {
                        index: request.piece,
                        begin: request.begin,
                        length: request.length,
                    })
                    .await?;
                }
            }
            SessionCommand::RequestMetadata(piece) => {
                if let Some(id) = self.peer_ut_metadata {
                    let msg = MetadataMessage::Request { piece };
                    self.send_extended(id, msg.encode()).await?;
                }
            }
            SessionCommand::Port(port) => self.send(Message::Port(port)).await?,
            SessionCommand::Drop => unreachable!("handled by the event loop"),
        }
        Ok(())
    }

    async fn on_message(&mut self, msg: Message) -> Result<(), PeerError> {
        self.last_recv = Instant::now();
        let in_prelude = !self.past_prelude;
        if !matches!(
            msg,
            Message::KeepAlive | Message::Extended { .. } | Message::Port(_)
        ) {
            self.past_prelude = true;
        }

        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                self.inflight.clear();
                self.emit(SessionEvent::PeerChoked(true)).await?;
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.emit(SessionEvent::PeerChoked(false)).await?;
            }
            Message::Interested => {
                self.peer_interested = true;
                self.emit(SessionEvent::PeerInterested(true)).await?;
            }
            Message::NotInterested => {
                self.peer_interested = false;
                self.peer_requests.clear();
                self.emit(SessionEvent::PeerInterested(false)).await?;
            }
            Message::Have { piece } => self.emit(SessionEvent::Have(piece)).await?,
            Message::Bitfield(bits) => {
                if !in_prelude {
                    return Err(PeerError::Protocol("bitfield after other messages"));
                }
                self.emit(SessionEvent::Bitfield(bits)).await?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.on_peer_request(index, begin, length)?,
            Message::Piece { index, begin, data } => {
                let request = BlockRequest::new(index, begin, data.len() as u32);
                if self.inflight.remove(&request) {
                    self.emit(SessionEvent::BlockDownloaded { request, data })
                        .await?;
                } else {
                    // we cancelled this block and the peer sent it anyway
                    trace!(peer = %self.addr, piece = index, begin, "discarding unrequested block");
                }
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let request = BlockRequest::new(index, begin, length);
                self.peer_requests.retain(|r| *r != request);
            }
            Message::Port(port) => self.emit(SessionEvent::Port(port)).await?,
            Message::Extended { id, payload } => self.on_extended(id, payload).await?,
        }
        Ok(())
    }

    fn on_peer_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        if self.am_choking {
            return Err(PeerError::Protocol("request while choked"));
        }
        let ctx = self
            .ctx
            .as_ref()
            .ok_or(PeerError::Protocol("request before info known"))?;
        if length > BLOCK_SIZE || !ctx.valid_block(index, begin, length) {
            return Err(PeerError::Protocol("request out of bounds"));
        }
        if !self.ours.has_piece(index as usize) {
            return Err(PeerError::Protocol("request for piece we lack"));
        }
        if self.peer_requests.len() >= MAX_PEER_REQUESTS {
            self.peer_requests.pop_front();
        }
        self.peer_requests
            .push_back(BlockRequest::new(index, begin, length));
        Ok(())
    }

    async fn serve_one(&mut self) -> Result<(), PeerError> {
        let Some(request) = self.peer_requests.pop_front() else {
            return Ok(());
        };
        let ctx = self.ctx.clone().expect("guarded by can_serve");
        let mut data = vec![0u8; request.length as usize];
        ctx.storage
            .read_block(&mut data, ctx.global_offset(request.piece, request.begin))
            .map_err(|err| PeerError::Io(std::io::Error::other(err)))?;
        self.send(Message::Piece {
            index: request.piece,
            begin: request.begin,
            data: data.into(),
        })
        .await?;
        self.emit(SessionEvent::BlockUploaded(request)).await
    }

    async fn on_extended(&mut self, id: u8, payload: Bytes) -> Result<(), PeerError> {
        if id == EXTENSION_HANDSHAKE_ID {
            let hs = ExtensionHandshake::decode(&payload)?;
            self.peer_ut_metadata = hs.ut_metadata();
            return self
                .emit(SessionEvent::ExtendedHandshake {
                    ut_metadata: self.peer_ut_metadata,
                    metadata_size: hs.metadata_size,
                })
                .await;
        }
        if id == UT_METADATA_LOCAL_ID {
            match MetadataMessage::decode(&payload)? {
                MetadataMessage::Request { piece } => self.serve_metadata(piece).await?,
                MetadataMessage::Data {
                    piece,
                    total_size,
                    data,
                } => {
                    self.emit(SessionEvent::MetadataPiece {
                        piece,
                        total_size,
                        data,
                    })
                    .await?
                }
                MetadataMessage::Reject { piece } => {
                    self.emit(SessionEvent::MetadataRejected(piece)).await?
                }
            }
        }
        // unknown extended ids are ignored
        Ok(())
    }

    async fn serve_metadata(&mut self, piece: u32) -> Result<(), PeerError> {
        let Some(peer_id) = self.peer_ut_metadata else {
            return Ok(());
        };
        let reply = match &self.ctx {
            Some(ctx) => {
                let raw = &ctx.raw_info;
                let start = piece as usize * super::metadata::METADATA_PIECE_SIZE;
                if start >= raw.len() {
                    MetadataMessage::Reject { piece }
                } else {
                    let end = (start + super::metadata::METADATA_PIECE_SIZE).min(raw.len());
                    MetadataMessage::Data {
                        piece,
                        total_size: raw.len() as i64,
                        data: raw.slice(start..end),
                    }
                }
            }
            None => MetadataMessage::Reject { piece },
        };
        self.send_extended(peer_id, reply.encode()).await
    }

    async fn send_extension_handshake(&mut self) -> Result<(), PeerError> {
        let metadata_size = self.ctx.as_ref().map(|ctx| ctx.raw_info.len() as i64);
        let hs = ExtensionHandshake::ours(metadata_size);
        self.send_extended(EXTENSION_HANDSHAKE_ID, hs.encode()).await
    }

    async fn send_extended(&mut self, id: u8, payload: Bytes) -> Result<(), PeerError> {
        self.send(Message::Extended { id, payload }).await
    }

    async fn send(&mut self, msg: Message) -> Result<(), PeerError> {
        self.transport.send_message(&msg).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    async fn emit(&self, event: SessionEvent) -> Result<(), PeerError> {
        self.events
            .send(PeerEvent {
                session: self.id,
                event,
            })
            .await
            .map_err(|_| PeerError::ConnectionClosed)
    }
}
