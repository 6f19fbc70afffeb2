//! The client: configuration, the TCP listener, and outgoing dials.
//!
//! A [`Client`] manages any number of torrents behind one listen socket and
//! one announcer worker. Incoming connections are routed to a torrent by the
//! info hash in their handshake; outgoing dials are spawned by torrent
//! coordinators through [`spawn_dial`], bounded by the per-torrent half-open
//! set.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::metainfo::{InfoHash, Metainfo, MetainfoError};
use crate::peer::{Handshake, PeerError, PeerId, PeerTransport};
use crate::storage::{open_file_storage, OpenStorage};
use crate::torrent::{
    DialEvent, PeerInfo, PeerSource, PendingSession, RarestFirst, SelectorFactory, Torrent,
    TorrentError, TorrentParams,
};
use crate::tracker::{spawn_announcer, AnnounceJob};

/// Engine configuration. The defaults mirror what mainstream clients ship.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on admitted sessions per torrent.
    pub max_established_conns: usize,
    /// Cap on dials in progress per torrent.
    pub max_half_open: usize,
    /// Request-pipeline depth per session.
    pub max_onflight_reqs: usize,
    /// Announce for more peers while the candidate list is below this.
    pub want_peers_threshold: usize,
    /// Handed to the block store; torrent content lives under it.
    pub base_dir: PathBuf,
    pub disable_trackers: bool,
    pub disable_dht: bool,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    /// 0 scans the conventional BitTorrent range and falls back to an
    /// ephemeral port.
    pub listen_port: u16,
    pub open_storage: OpenStorage,
    pub selector_factory: SelectorFactory,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_established_conns: 55,
            max_half_open: 55,
            max_onflight_reqs: 250,
            want_peers_threshold: 100,
            base_dir: PathBuf::from("."),
            disable_trackers: false,
            disable_dht: false,
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(4),
            listen_port: 0,
            open_storage: open_file_storage,
            selector_factory: default_selector,
        }
    }
}

fn default_selector() -> Box<dyn crate::torrent::PieceSelector> {
    Box::new(RarestFirst)
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("torrent already added")]
    DuplicateTorrent,

    #[error("torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),
}

#[derive(Clone)]
struct TorrentSlot {
    torrent: Torrent,
    conns: mpsc::Sender<DialEvent>,
}

type TorrentTable = Arc<RwLock<HashMap<InfoHash, TorrentSlot>>>;

/// Manages torrents behind one listen socket.
pub struct Client {
    cfg: Arc<Config>,
    peer_id: PeerId,
    port: u16,
    torrents: TorrentTable,
    announce_jobs: Option<mpsc::Sender<AnnounceJob>>,
    shutdown: watch::Sender<bool>,
}

impl Client {
    /// Binds the listener and spawns the accept loop and announcer worker.
    pub async fn new(cfg: Config) -> Result<Self, ClientError> {
        let cfg = Arc::new(cfg);
        let peer_id = PeerId::generate();
        let listener = bind_listener(cfg.listen_port).await?;
        let port = listener.local_addr()?.port();
        debug!(port, ?peer_id, "client listening");

        let torrents: TorrentTable = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let announce_jobs = if cfg.disable_trackers {
            None
        } else {
            Some(spawn_announcer())
        };

        tokio::spawn(accept_loop(
            listener,
            cfg.clone(),
            peer_id,
            torrents.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            cfg,
            peer_id,
            port,
            torrents,
            announce_jobs,
            shutdown,
        })
    }

    /// The port other peers reach us on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn add_torrent_file(&self, path: impl AsRef<std::path::Path>) -> Result<Torrent, ClientError> {
        self.add_metainfo(Metainfo::load(path)?)
    }

    /// Adds a torrent whose info dictionary is already known.
    pub fn add_metainfo(&self, metainfo: Metainfo) -> Result<Torrent, ClientError> {
        let info_hash = metainfo.info_hash;
        let announce = metainfo.announce.clone();
        self.add(info_hash, Some(metainfo), announce)
    }

    /// Adds a torrent from a bare info hash; the info dictionary is fetched
    /// from peers over the metadata extension.
    pub fn add_info_hash(
        &self,
        info_hash: InfoHash,
        announce: Option<String>,
    ) -> Result<Torrent, ClientError> {
        self.add(info_hash, None, announce)
    }

    fn add(
        &self,
        info_hash: InfoHash,
        metainfo: Option<Metainfo>,
        announce_url: Option<String>,
    ) -> Result<Torrent, ClientError> {
        let mut torrents = self.torrents.write();
        if torrents.contains_key(&info_hash) {
            return Err(ClientError::DuplicateTorrent);
        }
        let (torrent, conns) = Torrent::spawn(TorrentParams {
            metainfo,
            info_hash,
            announce_url,
            cfg: self.cfg.clone(),
            peer_id: self.peer_id,
            listen_port: self.port,
            announce_jobs: self.announce_jobs.clone(),
        })?;
        torrents.insert(
            info_hash,
            TorrentSlot {
                torrent: torrent.clone(),
                conns,
            },
        );
        Ok(torrent)
    }

    pub fn torrents(&self) -> Vec<Torrent> {
        self.torrents
            .read()
            .values()
            .map(|slot| slot.torrent.clone())
            .collect()
    }

    /// Stops accepting connections and closes every torrent. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        for torrent in self.torrents() {
            torrent.close().await;
        }
    }
}

async fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    if port != 0 {
        return TcpListener::bind(("0.0.0.0", port)).await;
    }
    // the conventional BitTorrent range first, then anything free
    for candidate in 6881..6890 {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", candidate)).await {
            return Ok(listener);
        }
    }
    TcpListener::bind(("0.0.0.0", 0)).await
}

async fn accept_loop(
    listener: TcpListener,
    cfg: Arc<Config>,
    peer_id: PeerId,
    torrents: TorrentTable,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let cfg = cfg.clone();
                    let torrents = torrents.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            handle_incoming(stream, addr, cfg, peer_id, torrents).await
                        {
                            debug!(peer = %addr, %err, "incoming connection failed");
                        }
                    });
                }
                Err(err) => warn!(%err, "accept failed"),
            },
        }
    }
}

/// The responder side of the handshake: read theirs first, reply only if we
/// manage the info hash, then hand the connection to the torrent.
async fn handle_incoming(
    stream: TcpStream,
    addr: SocketAddr,
    cfg: Arc<Config>,
    peer_id: PeerId,
    torrents: TorrentTable,
) -> Result<(), PeerError> {
    let mut transport = PeerTransport::new(stream);
    let theirs = transport.receive_handshake(cfg.handshake_timeout).await?;

    let slot = torrents.read().get(&InfoHash(theirs.info_hash)).cloned();
    let Some(slot) = slot else {
        return Err(PeerError::InfoHashMismatch);
    };

    let ours = Handshake::new(theirs.info_hash, *peer_id.as_bytes());
    transport.send_handshake(&ours, cfg.handshake_timeout).await?;

    let pending = PendingSession {
        transport,
        addr,
        source: PeerSource::Incoming,
        supports_extensions: theirs.supports_extensions(),
        supports_dht: theirs.supports_dht(),
    };
    // if the admission queue is gone the torrent has closed; the
    // connection just drops
    let _ = slot.conns.send(DialEvent::Established(pending)).await;
    Ok(())
}

/// Spawns one outgoing dial. The address stays in the torrent's half-open
/// set until the attempt settles either way.
pub(crate) fn spawn_dial(
    cfg: Arc<Config>,
    peer: PeerInfo,
    info_hash: InfoHash,
    peer_id: PeerId,
    conns: mpsc::Sender<DialEvent>,
    half_open: Arc<Mutex<HashSet<SocketAddr>>>,
) {
    tokio::spawn(async move {
        let result = dial_and_handshake(&cfg, peer.addr, info_hash, peer_id).await;
        half_open.lock().remove(&peer.addr);
        let event = match result {
            Ok((transport, theirs)) => DialEvent::Established(PendingSession {
                transport,
                addr: peer.addr,
                source: peer.source,
                supports_extensions: theirs.supports_extensions(),
                supports_dht: theirs.supports_dht(),
            }),
            Err(err) => {
                debug!(peer = %peer.addr, %err, "dial failed");
                DialEvent::Failed(peer)
            }
        };
        let _ = conns.send(event).await;
    });
}

/// The initiator side of the handshake.
async fn dial_and_handshake(
    cfg: &Config,
    addr: SocketAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
) -> Result<(PeerTransport, Handshake), PeerError> {
    let stream = timeout(cfg.dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::Timeout)??;
    let mut transport = PeerTransport::new(stream);

    let ours = Handshake::new(*info_hash.as_bytes(), *peer_id.as_bytes());
    transport.send_handshake(&ours, cfg.handshake_timeout).await?;
    let theirs = transport.receive_handshake(cfg.handshake_timeout).await?;
    if theirs.info_hash != *info_hash.as_bytes() {
        return Err(PeerError::InfoHashMismatch);
    }
    Ok((transport, theirs))
}
