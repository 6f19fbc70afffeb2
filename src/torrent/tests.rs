//! End-to-end tests: real clients over loopback TCP.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::{PeerInfo, PeerSource, Torrent, TorrentError};
use crate::client::{Client, Config};
use crate::metainfo::{Builder, Info, Metainfo};
use crate::peer::Handshake;
use crate::storage::{Storage, StorageError};

const HELLO: &[u8] = b"Hello World\n";

fn test_config(dir: &Path) -> Config {
    Config {
        base_dir: dir.to_path_buf(),
        disable_trackers: true,
        disable_dht: true,
        listen_port: 0,
        ..Config::default()
    }
}

fn hello_metainfo() -> (Metainfo, Vec<u8>) {
    Builder::new("helloworld.txt", 32768)
        .file("helloworld.txt", HELLO.to_vec())
        .build()
}

fn multi_file_metainfo() -> (Metainfo, Vec<u8>) {
    let a: Vec<u8> = (0..3000u32).map(|i| (i * 31 % 251) as u8).collect();
    let b: Vec<u8> = (0..5096u32).map(|i| (i * 7 % 253) as u8).collect();
    Builder::new("album", 1024)
        .file("a.bin", a)
        .file("sub/b.bin", b)
        .build()
}

fn local_peer(port: u16) -> PeerInfo {
    PeerInfo::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        PeerSource::User,
    )
}

/// A started seeder: content on disk before the torrent is added, so
/// storage reports a complete copy.
async fn spawn_seeder(mi: &Metainfo, content: &[u8]) -> (Client, Torrent, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    write_content(mi, content, dir.path());
    let client = Client::new(test_config(dir.path())).await.unwrap();
    let torrent = client.add_metainfo(mi.clone()).unwrap();
    assert!(torrent.have_all());
    torrent.start_transfer().await.unwrap();
    (client, torrent, dir)
}

fn write_content(mi: &Metainfo, content: &[u8], dir: &Path) {
    for file in &mi.info.files {
        let path = dir.join(&file.path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let span = &content[file.offset as usize..(file.offset + file.length) as usize];
        std::fs::write(path, span).unwrap();
    }
}

async fn status_of(torrent: &Torrent) -> String {
    let mut out = String::new();
    torrent.write_status(&mut out).await;
    out
}

/// (connected, half-open, candidates) from the status snapshot.
fn swarm_counts(status: &str) -> Option<(usize, usize, usize)> {
    let line = status.lines().find(|l| l.starts_with("Swarm:"))?;
    let nums: Vec<usize> = line
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().unwrap())
        .collect();
    Some((nums[0], nums[1], nums[2]))
}

async fn wait_status(torrent: &Torrent, secs: u64, pred: impl Fn(&str) -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if pred(&status_of(torrent).await) {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn read_all(torrent: &Torrent) -> Vec<u8> {
    let mut data = vec![0u8; torrent.length().unwrap() as usize];
    torrent.read_block(&mut data, 0, 0).unwrap();
    data
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_complete_torrent_seeds_on_start() {
    let (mi, content) = hello_metainfo();
    let (client, torrent, _dir) = spawn_seeder(&mi, &content).await;
    assert!(torrent.have_all());
    assert_eq!(torrent.length().unwrap(), 12);
    assert_eq!(torrent.num_pieces().unwrap(), 1);
    assert_eq!(read_all(&torrent), HELLO);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_file_transfer() {
    let (mi, content) = hello_metainfo();
    let (seeder, seeder_tr, _sdir) = spawn_seeder(&mi, &content).await;

    let dir = tempfile::tempdir().unwrap();
    let leecher = Client::new(test_config(dir.path())).await.unwrap();
    let torrent = leecher.add_metainfo(mi.clone()).unwrap();
    assert!(!torrent.have_all());
    torrent.start_transfer().await.unwrap();
    torrent.add_peers(vec![local_peer(seeder.port())]).await.unwrap();

    timeout(Duration::from_secs(30), torrent.downloaded())
        .await
        .expect("transfer finished");
    assert!(torrent.have_all());
    assert!(seeder_tr.have_all());
    assert_eq!(read_all(&torrent), HELLO);

    leecher.close().await;
    seeder.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_leecher_swarm() {
    let (mi, content) = multi_file_metainfo();
    let (seeder, _seeder_tr, _sdir) = spawn_seeder(&mi, &content).await;

    let mut clients = Vec::new();
    let mut torrents = Vec::new();
    let mut dirs = Vec::new();
    for _ in 0..3 {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(test_config(dir.path())).await.unwrap();
        let torrent = client.add_metainfo(mi.clone()).unwrap();
        torrent.start_transfer().await.unwrap();
        clients.push(client);
        torrents.push(torrent);
        dirs.push(dir);
    }
    // every leecher knows the seeder and the other leechers
    let mut ports = vec![seeder.port()];
    ports.extend(clients.iter().map(|c| c.port()));
    for (i, torrent) in torrents.iter().enumerate() {
        let peers: Vec<PeerInfo> = ports
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i + 1)
            .map(|(_, &port)| local_peer(port))
            .collect();
        torrent.add_peers(peers).await.unwrap();
    }

    for torrent in &torrents {
        timeout(Duration::from_secs(60), torrent.downloaded())
            .await
            .expect("leecher finished");
        assert_eq!(read_all(torrent), content);
    }

    for client in &clients {
        client.close().await;
    }
    seeder.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metadata_exchange_bootstraps_from_info_hash() {
    let (mi, content) = hello_metainfo();
    let (seeder, _seeder_tr, _sdir) = spawn_seeder(&mi, &content).await;

    let dir = tempfile::tempdir().unwrap();
    let leecher = Client::new(test_config(dir.path())).await.unwrap();
    let torrent = leecher.add_info_hash(mi.info_hash, None).unwrap();
    assert!(matches!(torrent.length(), Err(TorrentError::NoInfo)));

    torrent.add_peers(vec![local_peer(seeder.port())]).await.unwrap();
    timeout(Duration::from_secs(15), torrent.info_ready())
        .await
        .expect("info fetched from peer");
    assert_eq!(torrent.length().unwrap(), HELLO.len() as u64);

    torrent.start_transfer().await.unwrap();
    timeout(Duration::from_secs(30), torrent.downloaded())
        .await
        .expect("transfer finished");
    assert_eq!(read_all(&torrent), HELLO);

    leecher.close().await;
    seeder.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_close_is_idempotent() {
    let (mi, content) = hello_metainfo();
    let (client, torrent, _dir) = spawn_seeder(&mi, &content).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let t = torrent.clone();
        tasks.push(tokio::spawn(async move { t.close().await }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(torrent.closed());

    // state-mutating calls on a closed torrent fail cleanly
    assert!(matches!(
        torrent.add_peers(vec![local_peer(1)]).await,
        Err(TorrentError::Closed)
    ));
    assert!(matches!(
        torrent.start_transfer().await,
        Err(TorrentError::Closed)
    ));
    assert!(status_of(&torrent).await.contains("State: closed"));
    // closing again is a no-op
    torrent.close().await;
    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_start_transfer_rejected() {
    let (mi, content) = hello_metainfo();
    let (client, torrent, _dir) = spawn_seeder(&mi, &content).await;
    assert!(matches!(
        torrent.start_transfer().await,
        Err(TorrentError::AlreadyStarted)
    ));
    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn established_connections_capped() {
    let (mi, content) = hello_metainfo();
    let dir = tempfile::tempdir().unwrap();
    write_content(&mi, &content, dir.path());
    let mut cfg = test_config(dir.path());
    cfg.max_established_conns = 2;
    let client = Client::new(cfg).await.unwrap();
    let torrent = client.add_metainfo(mi.clone()).unwrap();
    torrent.start_transfer().await.unwrap();

    // four hopeful peers handshake in; only two may be admitted
    let mut sockets = Vec::new();
    for i in 0..4u8 {
        let mut stream = TcpStream::connect(("127.0.0.1", client.port())).await.unwrap();
        let hs = Handshake::new(*mi.info_hash.as_bytes(), [i; 20]);
        stream.write_all(&hs.encode()).await.unwrap();
        let mut reply = [0u8; 68];
        stream.read_exact(&mut reply).await.unwrap();
        sockets.push(stream);
    }

    assert!(
        wait_status(&torrent, 10, |s| {
            swarm_counts(s).is_some_and(|(connected, _, _)| connected == 2)
        })
        .await
    );
    // and it stays at two
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (connected, _, _) = swarm_counts(&status_of(&torrent).await).unwrap();
    assert_eq!(connected, 2);

    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn half_open_dials_capped() {
    let (mi, content) = hello_metainfo();
    let dir = tempfile::tempdir().unwrap();
    write_content(&mi, &content, dir.path());
    let mut cfg = test_config(dir.path());
    cfg.max_half_open = 8;
    cfg.dial_timeout = Duration::from_millis(100);
    let client = Client::new(cfg).await.unwrap();
    let torrent = client.add_metainfo(mi.clone()).unwrap();
    torrent.start_transfer().await.unwrap();

    // TEST-NET-1 addresses: guaranteed unreachable
    let peers: Vec<PeerInfo> = (0..64u8)
        .map(|i| {
            PeerInfo::new(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, i)), 9090),
                PeerSource::User,
            )
        })
        .collect();
    torrent.add_peers(peers).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let status = status_of(&torrent).await;
        let (_, half_open, candidates) = swarm_counts(&status).unwrap();
        assert!(half_open <= 8, "half-open cap exceeded: {}", status);
        if half_open == 0 && candidates == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "dials never drained: {}",
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    client.close().await;
}

/// Serves any piece request with zeroes while claiming a complete copy;
/// the downloading side must catch the corruption and ban us.
struct ZeroStorage {
    total: u64,
}

impl Storage for ZeroStorage {
    fn read_block(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError> {
        if offset + buf.len() as u64 > self.total {
            return Err(StorageError::OutOfRange);
        }
        buf.fill(0);
        Ok(())
    }

    fn write_block(&self, _buf: &[u8], _offset: u64) -> Result<(), StorageError> {
        Ok(())
    }

    fn hash_piece(&self, _index: u32, _length: u32) -> bool {
        true
    }
}

fn open_zero_storage(
    info: &Info,
    _dir: &Path,
) -> Result<(Arc<dyn Storage>, bool), StorageError> {
    Ok((Arc::new(ZeroStorage { total: info.total_length }), true))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupt_seeder_is_banned() {
    let (mi, _content) = hello_metainfo();
    let sdir = tempfile::tempdir().unwrap();
    let mut scfg = test_config(sdir.path());
    scfg.open_storage = open_zero_storage;
    let seeder = Client::new(scfg).await.unwrap();
    let seeder_tr = seeder.add_metainfo(mi.clone()).unwrap();
    assert!(seeder_tr.have_all());
    seeder_tr.start_transfer().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let leecher = Client::new(test_config(dir.path())).await.unwrap();
    let torrent = leecher.add_metainfo(mi.clone()).unwrap();
    torrent.start_transfer().await.unwrap();
    torrent.add_peers(vec![local_peer(seeder.port())]).await.unwrap();

    // the single source fed us garbage: it gets dropped and banned, and
    // with nobody else to ask the download cannot finish
    assert!(
        wait_status(&torrent, 30, |s| {
            swarm_counts(s).is_some_and(|(connected, _, _)| connected == 0)
        })
        .await
    );
    assert!(!torrent.have_all());

    // the ban holds: re-adding the peer does not bring it back
    torrent.add_peers(vec![local_peer(seeder.port())]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let (connected, _, _) = swarm_counts(&status_of(&torrent).await).unwrap();
    assert_eq!(connected, 0);

    leecher.close().await;
    seeder.close().await;
}

// ---- tracker interaction ----------------------------------------------

/// A tracker that always answers with the same single peer.
async fn spawn_dummy_tracker(peer_addr: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                let mut read = 0;
                loop {
                    match stream.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            read += n;
                            if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let mut body = b"d8:intervali1e5:peers6:".to_vec();
                let IpAddr::V4(ip) = peer_addr.ip() else {
                    return;
                };
                body.extend_from_slice(&ip.octets());
                body.extend_from_slice(&peer_addr.port().to_be_bytes());
                body.push(b'e');
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&body).await;
                let _ = stream.flush().await;
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tracker_peers_deduplicated() {
    let (mi, content) = hello_metainfo();
    let dir = tempfile::tempdir().unwrap();
    write_content(&mi, &content, dir.path());
    let mut cfg = test_config(dir.path());
    cfg.disable_trackers = false;
    let client = Client::new(cfg).await.unwrap();

    // the tracker always hands back our own address
    let own_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), client.port());
    let tracker_addr = spawn_dummy_tracker(own_addr).await;

    let mut mi = mi;
    mi.announce = Some(format!("http://{}/announce", tracker_addr));
    let torrent = client.add_metainfo(mi).unwrap();
    torrent.start_transfer().await.unwrap();

    // dialing ourselves yields exactly two sessions (one dialed, one
    // accepted); repeated announces must not add more
    tokio::time::sleep(Duration::from_secs(4)).await;
    let status = status_of(&torrent).await;
    let (connected, _, _) = swarm_counts(&status).unwrap();
    assert_eq!(connected, 2, "{}", status);

    client.close().await;
}
