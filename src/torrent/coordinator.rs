//! The torrent coordinator task and the public [`Torrent`] handle.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::choker::{Choker, ChokerPeer, CHOKER_INTERVAL};
use super::error::TorrentError;
use super::hasher::{spawn_hasher, PieceHashed};
use super::info_sync::{InfoSync, MetadataProgress};
use super::pieces::{BlockCompletion, PieceTable};
use super::stats::{SessionStats, TorrentStats};
use super::{PeerInfo, PeerSource};
use crate::client::Config;
use crate::metainfo::{Info, InfoHash, Metainfo};
use crate::peer::{
    Bitfield, PeerEvent, PeerId, PeerSession, PeerTransport, SessionCommand, SessionEvent,
    SessionId, StorageCtx,
};
use crate::tracker::{AnnounceJob, AnnounceOutcome, AnnounceStats, TrackerEvent};

/// Re-announce delay after a tracker error.
const ANNOUNCE_RETRY: Duration = Duration::from_secs(60);

/// Dial attempts per candidate before it is forgotten.
const MAX_DIAL_FAILS: u32 = 3;

/// Metadata requests kept outstanding per session.
const METADATA_PIPELINE: usize = 4;

/// A connection that finished its handshake and awaits admission, or a
/// failed dial attempt that frees a half-open slot.
pub(crate) enum DialEvent {
    Established(PendingSession),
    Failed(PeerInfo),
}

pub(crate) struct PendingSession {
    pub transport: PeerTransport,
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub supports_extensions: bool,
    pub supports_dht: bool,
}

/// State the handle can reach without a round trip to the coordinator.
struct Shared {
    info_hash: InfoHash,
    ctx: OnceLock<Arc<StorageCtx>>,
}

enum Command {
    StartTransfer {
        ack: oneshot::Sender<Result<(), TorrentError>>,
    },
    AddPeers {
        peers: Vec<PeerInfo>,
        ack: oneshot::Sender<Result<(), TorrentError>>,
    },
    Status {
        ack: oneshot::Sender<String>,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

pub(crate) struct TorrentParams {
    pub metainfo: Option<Metainfo>,
    pub info_hash: InfoHash,
    pub announce_url: Option<String>,
    pub cfg: Arc<Config>,
    pub peer_id: PeerId,
    pub listen_port: u16,
    pub announce_jobs: Option<mpsc::Sender<AnnounceJob>>,
}

/// Handle to one torrent. Cheap to clone; every method that mutates state
/// is serialized through the coordinator's event loop.
#[derive(Clone)]
pub struct Torrent {
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<Command>,
    closed_rx: watch::Receiver<bool>,
    downloaded_rx: watch::Receiver<bool>,
    info_rx: watch::Receiver<bool>,
}

impl Torrent {
    /// Builds the coordinator, runs `got_info` if the metainfo is already
    /// known, and spawns the event loop.
    pub(crate) fn spawn(
        params: TorrentParams,
    ) -> Result<(Torrent, mpsc::Sender<DialEvent>), TorrentError> {
        let cfg = params.cfg.clone();
        let (events_tx, events_rx) = mpsc::channel(cfg.max_established_conns.max(1) * 8);
        let (conns_tx, conns_rx) = mpsc::channel(cfg.max_established_conns.max(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (announce_reply_tx, announce_rx) = mpsc::channel(2);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (downloaded_tx, downloaded_rx) = watch::channel(false);
        let (info_tx, info_rx) = watch::channel(false);
        let (drop_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            info_hash: params.info_hash,
            ctx: OnceLock::new(),
        });

        let mut coordinator = Coordinator {
            shared: shared.clone(),
            cfg,
            peer_id: params.peer_id,
            listen_port: params.listen_port,
            announce_url: params.announce_url,
            announce_jobs: params.announce_jobs,
            events_tx,
            events_rx,
            conns_tx: conns_tx.clone(),
            conns_rx,
            cmd_rx,
            cmd_closed: false,
            announce_reply_tx,
            announce_rx,
            hash_req: None,
            hash_res: None,
            drop_tx,
            closed_tx,
            downloaded_tx,
            info_tx,
            next_session: 0,
            sessions: HashMap::new(),
            candidates: Vec::new(),
            dial_fails: HashMap::new(),
            half_open: Arc::new(Mutex::new(HashSet::new())),
            banned: HashSet::new(),
            info: None,
            ctx: None,
            pieces: None,
            info_sync: InfoSync::new(params.info_hash),
            info_was_downloaded: false,
            queued_for_hash: HashSet::new(),
            upload_enabled: false,
            download_enabled: false,
            stats: TorrentStats::default(),
            choker: Choker::new(),
            can_announce: true,
            next_announce: None,
            sent_started: false,
            announces_sent: 0,
            announces_answered: 0,
            closing: false,
            close_acks: Vec::new(),
        };

        if let Some(mi) = params.metainfo {
            let raw = mi.raw_info().clone();
            coordinator.got_info(mi.info, raw)?;
        }
        tokio::spawn(coordinator.run());

        let torrent = Torrent {
            shared,
            cmd_tx,
            closed_rx,
            downloaded_rx,
            info_rx,
        };
        Ok((torrent, conns_tx))
    }

    pub fn info_hash(&self) -> InfoHash {
        self.shared.info_hash
    }

    /// Enables upload and download. Idempotent in effect but a second call
    /// reports [`TorrentError::AlreadyStarted`].
    pub async fn start_transfer(&self) -> Result<(), TorrentError> {
        self.request(|ack| Command::StartTransfer { ack }).await?
    }

    /// Adds candidates to the swarm after deduplication.
    pub async fn add_peers(&self, peers: Vec<PeerInfo>) -> Result<(), TorrentError> {
        self.request(|ack| Command::AddPeers { peers, ack }).await?
    }

    /// Renders a human-readable status snapshot into `out`. Works on a
    /// closed torrent too.
    pub async fn write_status(&self, out: &mut String) {
        match self.request(|ack| Command::Status { ack }).await {
            Ok(status) => out.push_str(&status),
            Err(_) => {
                let _ = writeln!(out, "State: closed");
            }
        }
    }

    /// Closes the torrent: drops every session, stops the workers, resolves
    /// the closed signal. Safe to call concurrently and repeatedly; every
    /// call returns after the work is done.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { ack }).await.is_ok() {
            let _ = done.await;
            return;
        }
        // the coordinator is already gone; its last act was setting the flag
        let mut closed = self.closed_rx.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// True once every piece has verified.
    pub fn have_all(&self) -> bool {
        *self.downloaded_rx.borrow()
    }

    /// Resolves when the last piece verifies (or immediately if it has).
    pub async fn downloaded(&self) {
        let mut rx = self.downloaded_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the info dictionary is known.
    pub async fn info_ready(&self) {
        let mut rx = self.info_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn num_pieces(&self) -> Result<u32, TorrentError> {
        Ok(self.ctx()?.num_pieces)
    }

    pub fn length(&self) -> Result<u64, TorrentError> {
        Ok(self.ctx()?.total_length)
    }

    /// Reads straight through the block store; valid once info is known.
    pub fn read_block(&self, buf: &mut [u8], piece: u32, begin: u32) -> Result<(), TorrentError> {
        let ctx = self.ctx()?;
        ctx.storage
            .read_block(buf, ctx.global_offset(piece, begin))?;
        Ok(())
    }

    fn ctx(&self) -> Result<&Arc<StorageCtx>, TorrentError> {
        self.shared.ctx.get().ok_or(TorrentError::NoInfo)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TorrentError> {
        let (ack, response) = oneshot::channel();
        self.cmd_tx
            .send(make(ack))
            .await
            .map_err(|_| TorrentError::Closed)?;
        response.await.map_err(|_| TorrentError::Closed)
    }
}

/// Coordinator-side record of one admitted session.
struct SessionEntry {
    cmd: mpsc::Sender<SessionCommand>,
    addr: SocketAddr,
    source: PeerSource,
    /// The peer negotiated ut_metadata.
    ut_metadata: bool,
    /// The peer's pieces. Empty-sized until info is known.
    bitfield: Bitfield,
    /// Bitfield payload received before the piece count was known.
    raw_bitfield: Option<Bytes>,
    /// Haves received before the piece count was known.
    pending_haves: Vec<u32>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    /// Mirror of the blocks in flight to this peer; kept in lockstep with
    /// the registry's pending sets.
    inflight: HashSet<crate::peer::BlockRequest>,
    /// Pieces the peer has that we lack; interest follows it.
    num_want: usize,
    stats: SessionStats,
}

enum Step {
    Peer(PeerEvent),
    Dial(DialEvent),
    User(Option<Command>),
    Announced(AnnounceOutcome),
    Hashed(Option<PieceHashed>),
    ChokerTick,
    AnnounceTimer,
}

struct Coordinator {
    shared: Arc<Shared>,
    cfg: Arc<Config>,
    peer_id: PeerId,
    listen_port: u16,
    announce_url: Option<String>,
    announce_jobs: Option<mpsc::Sender<AnnounceJob>>,

    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    conns_tx: mpsc::Sender<DialEvent>,
    conns_rx: mpsc::Receiver<DialEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_closed: bool,
    announce_reply_tx: mpsc::Sender<AnnounceOutcome>,
    announce_rx: mpsc::Receiver<AnnounceOutcome>,
    hash_req: Option<mpsc::Sender<u32>>,
    hash_res: Option<mpsc::Receiver<PieceHashed>>,

    drop_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
    downloaded_tx: watch::Sender<bool>,
    info_tx: watch::Sender<bool>,

    next_session: SessionId,
    sessions: HashMap<SessionId, SessionEntry>,
    candidates: Vec<PeerInfo>,
    dial_fails: HashMap<SocketAddr, u32>,
    /// Shared with dial tasks; the only torrent state touched outside the
    /// coordinator.
    half_open: Arc<Mutex<HashSet<SocketAddr>>>,
    banned: HashSet<IpAddr>,

    info: Option<Info>,
    ctx: Option<Arc<StorageCtx>>,
    pieces: Option<PieceTable>,
    info_sync: InfoSync,
    info_was_downloaded: bool,
    queued_for_hash: HashSet<u32>,
    upload_enabled: bool,
    download_enabled: bool,
    stats: TorrentStats,
    choker: Choker,

    can_announce: bool,
    next_announce: Option<Instant>,
    sent_started: bool,
    announces_sent: u32,
    announces_answered: u32,

    closing: bool,
    close_acks: Vec<oneshot::Sender<()>>,
}

impl Coordinator {
    async fn run(mut self) {
        let mut choker_tick = time::interval(CHOKER_INTERVAL);
        choker_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.try_announce();

        loop {
            if self.closing && self.sessions.is_empty() {
                break;
            }
            let announce_armed = self.next_announce.is_some();
            let announce_at = self.next_announce.unwrap_or_else(Instant::now);
            let hash_armed = self.hash_res.is_some();
            let cmds_open = !self.cmd_closed;

            let step = {
                let events = &mut self.events_rx;
                let conns = &mut self.conns_rx;
                let cmds = &mut self.cmd_rx;
                let announces = &mut self.announce_rx;
                let hash_res = &mut self.hash_res;
                tokio::select! {
                    Some(event) = events.recv() => Step::Peer(event),
                    Some(conn) = conns.recv() => Step::Dial(conn),
                    cmd = cmds.recv(), if cmds_open => Step::User(cmd),
                    Some(outcome) = announces.recv() => Step::Announced(outcome),
                    res = async { hash_res.as_mut().expect("armed").recv().await }, if hash_armed => {
                        Step::Hashed(res)
                    }
                    _ = choker_tick.tick() => Step::ChokerTick,
                    _ = time::sleep_until(announce_at), if announce_armed => Step::AnnounceTimer,
                }
            };

            match step {
                Step::Peer(event) => self.on_peer_event(event),
                Step::Dial(DialEvent::Established(pending)) => self.on_established(pending),
                Step::Dial(DialEvent::Failed(peer)) => self.on_dial_failed(peer),
                Step::User(Some(cmd)) => self.on_command(cmd),
                Step::User(None) => {
                    self.cmd_closed = true;
                    self.begin_close(None);
                }
                Step::Announced(outcome) => self.on_announced(outcome),
                Step::Hashed(Some(res)) => self.on_piece_hashed(res.piece, res.ok),
                Step::Hashed(None) => self.hash_res = None,
                Step::ChokerTick => self.review_choker(true),
                Step::AnnounceTimer => {
                    self.next_announce = None;
                    self.can_announce = true;
                    self.try_announce();
                }
            }
        }

        let _ = self.closed_tx.send(true);
        for ack in self.close_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    // ---- user commands -------------------------------------------------

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartTransfer { ack } => {
                let result = self.start_transfer();
                let _ = ack.send(result);
            }
            Command::AddPeers { peers, ack } => {
                let result = if self.closing {
                    Err(TorrentError::Closed)
                } else {
                    self.add_candidates(peers);
                    self.dial_candidates();
                    Ok(())
                };
                let _ = ack.send(result);
            }
            Command::Status { ack } => {
                let _ = ack.send(self.render_status());
            }
            Command::Close { ack } => self.begin_close(Some(ack)),
        }
    }

    fn start_transfer(&mut self) -> Result<(), TorrentError> {
        if self.closing {
            return Err(TorrentError::Closed);
        }
        if self.upload_enabled || self.download_enabled {
            return Err(TorrentError::AlreadyStarted);
        }
        self.upload_enabled = true;
        self.download_enabled = true;
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.update_interest(id);
            self.fill_requests(id);
        }
        self.review_choker(false);
        self.dial_candidates();
        self.try_announce();
        Ok(())
    }

    fn begin_close(&mut self, ack: Option<oneshot::Sender<()>>) {
        if let Some(ack) = ack {
            self.close_acks.push(ack);
        }
        if self.closing {
            return;
        }
        debug!(info_hash = %self.shared.info_hash, "closing torrent");
        self.closing = true;
        self.send_announce(TrackerEvent::Stopped);
        self.next_announce = None;
        self.can_announce = false;
        self.candidates.clear();
        // hasher exits when its request queue closes
        self.hash_req = None;
        // every session sees this and unwinds; their Dropped events drain
        // the active set, which ends the run loop
        let _ = self.drop_tx.send(true);
    }

    // ---- peer events ---------------------------------------------------

    fn on_peer_event(&mut self, event: PeerEvent) {
        let id = event.session;
        if let SessionEvent::Dropped = event.event {
            self.remove_session(id);
            return;
        }
        if !self.sessions.contains_key(&id) {
            // events racing a forced drop
            return;
        }
        match event.event {
            SessionEvent::PeerInterested(interested) => {
                if let Some(entry) = self.entry(id) {
                    entry.peer_interested = interested;
                }
                self.review_choker(false);
            }
            SessionEvent::PeerChoked(choked) => {
                let Some(entry) = self.entry(id) else { return };
                entry.peer_choking = choked;
                if choked {
                    let freed: Vec<_> = entry.inflight.drain().collect();
                    if let Some(pieces) = &mut self.pieces {
                        pieces.unassign_session(id);
                    }
                    trace!(session = id, blocks = freed.len(), "peer choked us");
                    self.fill_all_except(id);
                } else {
                    self.fill_requests(id);
                }
            }
            SessionEvent::Have(piece) => self.on_peer_have(id, piece),
            SessionEvent::Bitfield(bytes) => self.on_peer_bitfield(id, bytes),
            SessionEvent::BlockDownloaded { request, data } => {
                self.on_block_downloaded(id, request, data)
            }
            SessionEvent::BlockUploaded(request) => {
                if let Some(entry) = self.entry(id) {
                    entry.stats.uploaded += request.length as u64;
                }
                self.stats.uploaded += request.length as u64;
            }
            SessionEvent::Port(port) => {
                trace!(session = id, port, "peer announced dht port");
            }
            SessionEvent::ExtendedHandshake {
                ut_metadata,
                metadata_size,
            } => {
                if let Some(entry) = self.entry(id) {
                    entry.ut_metadata = ut_metadata.is_some();
                }
                if self.info.is_none() {
                    if let Some(size) = metadata_size {
                        self.info_sync.record_size(size);
                    }
                    if self.info_sync.try_allocate() {
                        self.kick_metadata();
                    }
                }
            }
            SessionEvent::MetadataPiece {
                piece,
                total_size,
                data,
            } => self.on_metadata_piece(id, piece, total_size, data),
            SessionEvent::MetadataRejected(piece) => {
                self.info_sync.on_reject(piece, id);
                self.kick_metadata();
            }
            SessionEvent::Dropped => unreachable!("handled above"),
        }
    }

    /// A session can disappear mid-handler when a full command queue forces
    /// a drop, so lookups stay fallible everywhere.
    fn entry(&mut self, id: SessionId) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(&id)
    }

    fn on_peer_have(&mut self, id: SessionId, piece: u32) {
        if self.pieces.is_none() {
            if let Some(entry) = self.entry(id) {
                entry.pending_haves.push(piece);
            }
            return;
        }
        let num_pieces = self.pieces.as_ref().expect("info known").num_pieces();
        if piece >= num_pieces {
            self.disconnect(id);
            return;
        }
        let Some(entry) = self.entry(id) else { return };
        if entry.bitfield.has_piece(piece as usize) {
            return;
        }
        entry.bitfield.set_piece(piece as usize);
        let pieces = self.pieces.as_mut().expect("info known");
        pieces.on_have(piece);
        if !pieces.owned().has_piece(piece as usize) {
            if let Some(entry) = self.entry(id) {
                entry.num_want += 1;
            }
        }
        self.update_interest(id);
        self.fill_requests(id);
    }

    fn on_peer_bitfield(&mut self, id: SessionId, bytes: Bytes) {
        if self.pieces.is_none() {
            if let Some(entry) = self.entry(id) {
                entry.raw_bitfield = Some(bytes);
            }
            return;
        }
        let n = self.pieces.as_ref().expect("info known").num_pieces() as usize;
        if bytes.len() != n.div_ceil(8) {
            self.disconnect(id);
            return;
        }
        let bitfield = Bitfield::from_bytes(&bytes, n);
        let pieces = self.pieces.as_mut().expect("info known");
        pieces.on_bitfield(&bitfield);
        let num_want = count_wanted(pieces.owned(), &bitfield);
        let Some(entry) = self.entry(id) else { return };
        entry.bitfield = bitfield;
        entry.num_want = num_want;
        self.update_interest(id);
        self.fill_requests(id);
    }

    fn on_block_downloaded(
        &mut self,
        id: SessionId,
        request: crate::peer::BlockRequest,
        data: Bytes,
    ) {
        let Some(entry) = self.entry(id) else { return };
        entry.inflight.remove(&request);
        entry.stats.downloaded += request.length as u64;
        self.stats.downloaded += request.length as u64;

        let (Some(ctx), Some(pieces)) = (&self.ctx, &mut self.pieces) else {
            return;
        };
        if let Err(err) = ctx
            .storage
            .write_block(&data, ctx.global_offset(request.piece, request.begin))
        {
            warn!(piece = request.piece, begin = request.begin, %err, "block write failed");
            return;
        }

        match pieces.set_block_complete(request.piece, request.begin, id) {
            BlockCompletion::Duplicate => {}
            BlockCompletion::Completed { piece_done, cancel } => {
                for other in cancel {
                    if let Some(e) = self.sessions.get_mut(&other) {
                        e.inflight.remove(&request);
                    }
                    self.send_to(other, SessionCommand::Cancel(request));
                }
                if piece_done {
                    self.queue_hash(request.piece);
                }
            }
        }
        self.fill_requests(id);
    }

    fn on_metadata_piece(&mut self, id: SessionId, piece: u32, total_size: i64, data: Bytes) {
        if self.info.is_some() {
            return;
        }
        match self.info_sync.on_data(id, piece, total_size, &data) {
            MetadataProgress::Incomplete => self.kick_metadata(),
            MetadataProgress::Corrupt => self.kick_metadata(),
            MetadataProgress::Complete(raw) => match Info::from_bytes(&raw) {
                Ok(info) => {
                    self.info_was_downloaded = true;
                    if let Err(err) = self.got_info(info, raw) {
                        warn!(%err, "opening storage failed, closing torrent");
                        self.begin_close(None);
                    }
                }
                Err(err) => warn!(%err, "verified info bytes failed to parse"),
            },
        }
    }

    // ---- piece verification --------------------------------------------

    fn queue_hash(&mut self, piece: u32) {
        let pieces = self.pieces.as_ref().expect("info known");
        if self.queued_for_hash.contains(&piece) || pieces.is_verified(piece) {
            return;
        }
        self.queued_for_hash.insert(piece);
        if let Some(tx) = &self.hash_req {
            // sized to the piece count and deduplicated above
            tx.try_send(piece).expect("hash queue never fills");
        }
    }

    fn on_piece_hashed(&mut self, piece: u32, ok: bool) {
        self.queued_for_hash.remove(&piece);
        let Some(pieces) = &mut self.pieces else {
            return;
        };
        if ok {
            let len = pieces.piece_len(piece) as u64;
            pieces.on_piece_verified(piece);
            self.stats.left = self.stats.left.saturating_sub(len);

            let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
            for id in ids {
                if let Some(entry) = self.entry(id) {
                    if entry.bitfield.has_piece(piece as usize) {
                        entry.num_want = entry.num_want.saturating_sub(1);
                    }
                }
                self.send_to(id, SessionCommand::Have(piece));
                self.update_interest(id);
            }
            if self.pieces.as_ref().expect("info known").have_all() {
                self.on_downloaded_all();
                self.send_announce(TrackerEvent::Completed);
            }
        } else {
            warn!(piece, "piece failed verification");
            let blame = pieces.on_piece_corrupt(piece);
            self.stats.downloaded = self
                .stats
                .downloaded
                .saturating_sub(blame.iter().map(|(_, b)| b).sum());
            for (session, bytes) in blame {
                if let Some(entry) = self.sessions.get_mut(&session) {
                    entry.stats.corrupt += bytes;
                }
            }
            self.ban_worst();
            self.fill_all();
        }
    }

    fn on_downloaded_all(&mut self) {
        debug!(info_hash = %self.shared.info_hash, "all pieces verified");
        let _ = self.downloaded_tx.send(true);
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.update_interest(id);
        }
    }

    /// Bans the session that fed the most bytes into corrupt pieces.
    fn ban_worst(&mut self) {
        let Some((&id, entry)) = self
            .sessions
            .iter()
            .filter(|(_, e)| e.stats.corrupt > 0)
            .max_by_key(|(_, e)| e.stats.corrupt)
        else {
            return;
        };
        warn!(peer = %entry.addr, corrupt = entry.stats.corrupt, "banning peer");
        self.banned.insert(entry.addr.ip());
        self.disconnect(id);
    }

    // ---- sessions ------------------------------------------------------

    fn on_established(&mut self, pending: PendingSession) {
        if self.closing
            || !self.want_conns()
            || self.banned.contains(&pending.addr.ip())
            || self.dup_addr(pending.addr)
        {
            debug!(peer = %pending.addr, "rejecting connection");
            // dropping the transport closes the socket
            return;
        }

        let id = self.next_session;
        self.next_session += 1;
        let cmd = PeerSession::spawn(
            id,
            pending.addr,
            pending.transport,
            pending.supports_extensions,
            self.events_tx.clone(),
            self.drop_tx.subscribe(),
        );

        let piece_count = self.ctx.as_ref().map_or(0, |c| c.num_pieces as usize);
        let entry = SessionEntry {
            cmd,
            addr: pending.addr,
            source: pending.source,
            ut_metadata: false,
            bitfield: Bitfield::new(piece_count),
            raw_bitfield: None,
            pending_haves: Vec::new(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            inflight: HashSet::new(),
            num_want: 0,
            stats: SessionStats::new(),
        };
        self.sessions.insert(id, entry);
        debug!(peer = %pending.addr, session = id, "admitted connection");

        if let Some(ctx) = self.ctx.clone() {
            let owned = self.pieces.as_ref().expect("info known").owned().clone();
            self.send_to(id, SessionCommand::HaveInfo(ctx));
            if !owned.is_empty() {
                self.send_to(id, SessionCommand::Bitfield(owned));
            }
        }
        if pending.supports_dht && !self.cfg.disable_dht {
            self.send_to(id, SessionCommand::Port(self.listen_port));
        }
        self.review_choker(false);
    }

    fn on_dial_failed(&mut self, peer: PeerInfo) {
        let fails = self.dial_fails.entry(peer.addr).or_insert(0);
        *fails += 1;
        if *fails < MAX_DIAL_FAILS && !self.closing {
            self.candidates.push(peer);
        }
        self.dial_candidates();
    }

    /// Removes a session from the active set; idempotent by id.
    fn remove_session(&mut self, id: SessionId) {
        let Some(entry) = self.sessions.remove(&id) else {
            return;
        };
        debug!(peer = %entry.addr, session = id, "session removed");
        if let Some(pieces) = &mut self.pieces {
            pieces.on_session_gone(&entry.bitfield, id);
        }
        self.info_sync.unassign_session(id);
        // a seeder that dropped us while transfer is paused is worth
        // remembering; we will want it once the user starts the download
        if self.info_was_downloaded && !self.data_transfer_allowed() && !self.closing {
            self.candidates.push(PeerInfo::new(entry.addr, entry.source));
        }
        if !self.closing {
            self.review_choker(false);
            self.kick_metadata();
            self.fill_all();
            self.dial_candidates();
            self.try_announce();
        }
    }

    /// Asks a session to unwind; removal happens when its Dropped event
    /// arrives.
    fn disconnect(&mut self, id: SessionId) {
        self.send_to(id, SessionCommand::Drop);
    }

    fn send_to(&mut self, id: SessionId, cmd: SessionCommand) {
        use mpsc::error::TrySendError;
        let Some(entry) = self.sessions.get(&id) else {
            return;
        };
        match entry.cmd.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // not draining its queue: too slow to keep up with the
                // swarm, shed it
                debug!(peer = %entry.addr, session = id, "command queue full, dropping session");
                self.remove_session(id);
            }
            Err(TrySendError::Closed(_)) => {
                // session is unwinding; its Dropped event cleans up
            }
        }
    }

    fn dup_addr(&self, addr: SocketAddr) -> bool {
        self.sessions.values().any(|e| e.addr == addr)
    }

    fn want_conns(&self) -> bool {
        self.sessions.len() < self.cfg.max_established_conns && self.data_transfer_allowed()
    }

    fn want_peers(&self) -> bool {
        if self.closing || !self.data_transfer_allowed() {
            return false;
        }
        let mut threshold = self.cfg.want_peers_threshold;
        if !self.sessions.is_empty() {
            let occupancy =
                self.sessions.len() as f64 / self.cfg.max_established_conns.max(1) as f64;
            if occupancy > 0.9 {
                // nearly full: keep a deeper reserve of candidates
                threshold += (occupancy * 10.0) as usize;
            }
        }
        self.candidates.len() < threshold
    }

    fn data_transfer_allowed(&self) -> bool {
        self.info.is_none() || self.upload_enabled || self.download_enabled
    }

    fn seeding(&self) -> bool {
        self.upload_enabled && self.pieces.as_ref().is_some_and(|p| p.have_all())
    }

    // ---- scheduling ----------------------------------------------------

    fn fill_requests(&mut self, id: SessionId) {
        if self.closing || !self.download_enabled {
            return;
        }
        let Some(pieces) = &mut self.pieces else {
            return;
        };
        let Some(entry) = self.sessions.get_mut(&id) else {
            return;
        };
        if !entry.am_interested || entry.peer_choking {
            return;
        }
        let want = self.cfg.max_onflight_reqs.saturating_sub(entry.inflight.len());
        if want == 0 {
            return;
        }
        let requests = pieces.pick_requests(id, &entry.bitfield, want);
        if requests.is_empty() {
            return;
        }
        entry.inflight.extend(requests.iter().copied());
        self.send_to(id, SessionCommand::Request(requests));
    }

    fn fill_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.fill_requests(id);
        }
    }

    fn fill_all_except(&mut self, skip: SessionId) {
        let ids: Vec<SessionId> = self
            .sessions
            .keys()
            .copied()
            .filter(|&id| id != skip)
            .collect();
        for id in ids {
            self.fill_requests(id);
        }
    }

    fn update_interest(&mut self, id: SessionId) {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return;
        };
        let want = entry.num_want > 0
            && self.download_enabled
            && self.pieces.is_some()
            && !self.closing;
        if want && !entry.am_interested {
            entry.am_interested = true;
            self.send_to(id, SessionCommand::Interested);
        } else if !want && entry.am_interested {
            entry.am_interested = false;
            self.send_to(id, SessionCommand::NotInterested);
        }
    }

    fn review_choker(&mut self, rotate: bool) {
        if self.closing {
            return;
        }
        if !self.upload_enabled {
            let ids: Vec<SessionId> = self
                .sessions
                .iter()
                .filter(|(_, e)| !e.am_choking)
                .map(|(&id, _)| id)
                .collect();
            for id in ids {
                if let Some(entry) = self.entry(id) {
                    entry.am_choking = true;
                }
                self.send_to(id, SessionCommand::Choke);
            }
            return;
        }

        let seeding = self.seeding();
        let peers: Vec<ChokerPeer> = self
            .sessions
            .iter()
            .map(|(&id, e)| ChokerPeer {
                id,
                interested: e.peer_interested,
                rate: if seeding {
                    e.stats.upload_rate()
                } else {
                    e.stats.download_rate()
                },
                unchoked: !e.am_choking,
                connected_for: e.stats.connected_at.elapsed(),
            })
            .collect();

        for (id, unchoke) in self.choker.review(&peers, rotate) {
            if let Some(entry) = self.sessions.get_mut(&id) {
                entry.am_choking = !unchoke;
            }
            self.send_to(
                id,
                if unchoke {
                    SessionCommand::Unchoke
                } else {
                    SessionCommand::Choke
                },
            );
        }
        if rotate {
            for entry in self.sessions.values_mut() {
                entry.stats.roll_window();
            }
        }
    }

    fn kick_metadata(&mut self) {
        if self.info.is_some() || !self.info_sync.allocated() {
            return;
        }
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.ut_metadata)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            for piece in self.info_sync.assign_requests(id, METADATA_PIPELINE) {
                self.send_to(id, SessionCommand::RequestMetadata(piece));
            }
        }
    }

    // ---- candidates and dialing ----------------------------------------

    fn add_candidates(&mut self, peers: Vec<PeerInfo>) {
        for peer in peers {
            if self.banned.contains(&peer.addr.ip())
                || self.dup_addr(peer.addr)
                || self.candidates.iter().any(|c| c.addr == peer.addr)
            {
                continue;
            }
            self.candidates.push(peer);
        }
    }

    fn dial_candidates(&mut self) {
        if self.closing || !self.want_conns() {
            return;
        }
        while !self.candidates.is_empty() {
            {
                let half = self.half_open.lock();
                if half.len() >= self.cfg.max_half_open {
                    break;
                }
            }
            let idx = rand::rng().random_range(0..self.candidates.len());
            let peer = self.candidates.swap_remove(idx);
            if self.dup_addr(peer.addr) || self.banned.contains(&peer.addr.ip()) {
                continue;
            }
            if !self.half_open.lock().insert(peer.addr) {
                continue;
            }
            crate::client::spawn_dial(
                self.cfg.clone(),
                peer,
                self.shared.info_hash,
                self.peer_id,
                self.conns_tx.clone(),
                self.half_open.clone(),
            );
        }
        self.try_announce();
    }

    // ---- announcing ----------------------------------------------------

    fn try_announce(&mut self) {
        if self.can_announce && self.want_peers() {
            let event = if self.sent_started {
                TrackerEvent::None
            } else {
                TrackerEvent::Started
            };
            self.send_announce(event);
        }
    }

    fn send_announce(&mut self, event: TrackerEvent) {
        if self.cfg.disable_trackers {
            return;
        }
        let (Some(jobs), Some(url)) = (&self.announce_jobs, &self.announce_url) else {
            return;
        };
        let job = AnnounceJob {
            url: url.clone(),
            info_hash: *self.shared.info_hash.as_bytes(),
            peer_id: *self.peer_id.as_bytes(),
            port: self.listen_port,
            event,
            stats: AnnounceStats {
                uploaded: self.stats.uploaded,
                downloaded: self.stats.downloaded,
                left: self.stats.left,
            },
            reply: self.announce_reply_tx.clone(),
        };
        if jobs.try_send(job).is_ok() {
            self.can_announce = false;
            self.announces_sent += 1;
            if event == TrackerEvent::Started {
                self.sent_started = true;
            }
        }
    }

    fn on_announced(&mut self, outcome: AnnounceOutcome) {
        self.announces_answered += 1;
        if self.closing {
            return;
        }
        match outcome {
            Ok(resp) => {
                self.next_announce =
                    Some(Instant::now() + Duration::from_secs(resp.interval as u64));
                let peers: Vec<PeerInfo> = resp
                    .peers
                    .into_iter()
                    .map(|addr| PeerInfo::new(addr, PeerSource::Tracker))
                    .collect();
                self.add_candidates(peers);
                self.dial_candidates();
            }
            Err(_) => {
                self.next_announce = Some(Instant::now() + ANNOUNCE_RETRY);
            }
        }
    }

    // ---- info ----------------------------------------------------------

    fn got_info(&mut self, info: Info, raw_info: Bytes) -> Result<(), TorrentError> {
        debug!(info_hash = %self.shared.info_hash, name = %info.name, "info dictionary known");
        let (storage, complete_on_disk) = (self.cfg.open_storage)(&info, &self.cfg.base_dir)?;
        let ctx = Arc::new(StorageCtx {
            storage,
            piece_length: info.piece_length,
            num_pieces: info.num_pieces(),
            total_length: info.total_length,
            raw_info,
        });
        let _ = self.shared.ctx.set(ctx.clone());

        let mut pieces = PieceTable::new(
            info.total_length,
            info.piece_length,
            (self.cfg.selector_factory)(),
        );
        self.stats.left = info.total_length;

        let (hash_req, hash_req_rx) = mpsc::channel(info.num_pieces().max(1) as usize);
        let (hash_res_tx, hash_res_rx) = mpsc::channel(info.num_pieces().max(1) as usize);
        spawn_hasher(ctx.clone(), hash_req_rx, hash_res_tx);
        self.hash_req = Some(hash_req);
        self.hash_res = Some(hash_res_rx);

        if complete_on_disk {
            debug!("storage already holds a verified copy, seeding");
            pieces.mark_all_verified();
            self.stats.left = 0;
            let _ = self.downloaded_tx.send(true);
        }

        let n = info.num_pieces() as usize;
        self.info = Some(info);
        self.ctx = Some(ctx.clone());
        self.pieces = Some(pieces);
        let _ = self.info_tx.send(true);

        // sessions admitted before the info arrived catch up now
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            let Some(entry) = self.entry(id) else { continue };
            let mut bitfield = match entry.raw_bitfield.take() {
                Some(raw) if raw.len() == n.div_ceil(8) => Bitfield::from_bytes(&raw, n),
                _ => Bitfield::new(n),
            };
            for piece in entry.pending_haves.drain(..) {
                bitfield.set_piece(piece as usize);
            }
            entry.bitfield = bitfield.clone();

            let pieces = self.pieces.as_mut().expect("just set");
            pieces.on_bitfield(&bitfield);
            let num_want = count_wanted(pieces.owned(), &bitfield);
            let owned = pieces.owned().clone();
            let Some(entry) = self.entry(id) else { continue };
            entry.num_want = num_want;

            self.send_to(id, SessionCommand::HaveInfo(ctx.clone()));
            if !owned.is_empty() {
                self.send_to(id, SessionCommand::Bitfield(owned));
            }
            self.update_interest(id);
            self.fill_requests(id);
        }
        Ok(())
    }

    // ---- status --------------------------------------------------------

    fn state_name(&self) -> &'static str {
        if self.closing {
            return "closed";
        }
        if self.seeding() {
            return "seeding";
        }
        if self.info.is_none() {
            return "downloading info";
        }
        match (self.upload_enabled, self.download_enabled) {
            (true, true) => "uploading/downloading",
            (true, false) => "uploading only",
            (false, true) => "downloading only",
            (false, false) => "waiting for transfer request",
        }
    }

    fn render_status(&self) -> String {
        let mut out = String::new();
        if let Some(info) = &self.info {
            let _ = writeln!(out, "Name: {}", info.name);
        }
        let _ = writeln!(out, "State: {}", self.state_name());
        let _ = writeln!(
            out,
            "Downloaded: {} B\tUploaded: {} B\tRemaining: {} B",
            self.stats.downloaded, self.stats.uploaded, self.stats.left
        );
        let _ = writeln!(
            out,
            "Announces: {} sent, {} answered",
            self.announces_sent, self.announces_answered
        );
        let half_open = self.half_open.lock().len();
        let _ = writeln!(
            out,
            "Swarm: {} connected, {} half-open, {} candidates",
            self.sessions.len(),
            half_open,
            self.candidates.len()
        );
        if let Some(pieces) = &self.pieces {
            let _ = writeln!(
                out,
                "Pieces: {}/{} verified",
                pieces.verified_count(),
                pieces.num_pieces()
            );
        }
        for entry in self.sessions.values() {
            let percent = if entry.bitfield.piece_count() == 0 {
                0
            } else {
                entry.bitfield.count() * 100 / entry.bitfield.piece_count()
            };
            let _ = writeln!(
                out,
                "  {}\t{:>3}%\tup {} B\tdown {} B",
                entry.addr, percent, entry.stats.uploaded, entry.stats.downloaded
            );
        }
        out
    }
}

fn count_wanted(owned: &Bitfield, peer: &Bitfield) -> usize {
    (0..peer.piece_count())
        .filter(|&i| peer.has_piece(i) && !owned.has_piece(i))
        .count()
}
