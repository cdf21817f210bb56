//! The per-torrent session task.
//!
//! A torrent owns the piece manager, the tracker loops and the set of live
//! peer sessions. It runs as one task that multiplexes commands (tracker
//! results, inbound peers, snapshot queries, shutdown) with the piece
//! completion channel, on which it broadcasts Have messages to every live
//! peer. Peers and trackers communicate with it exclusively through
//! channels, so there is no shared mutable torrent state outside the piece
//! manager's lock.

use std::{
    collections::HashMap,
    mem,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use futures::{select, stream::Fuse, FutureExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, RwLock,
    },
    time,
};
use tokio_util::codec::Framed;

use crate::{
    conf::TorrentConf,
    counter::Counter,
    disk::DiskHandle,
    metainfo::Metainfo,
    peer::{self, codec::HandshakeCodec, PeerSession, PeerStats},
    piece_manager::PieceManager,
    storage_info::StorageInfo,
    tracker::{Announce, AnnounceResult, Tracker},
    PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// The channel on which the torrent task receives commands.
pub(crate) type Sender = UnboundedSender<Command>;
pub(crate) type Receiver = UnboundedReceiver<Command>;

/// The commands a torrent task can receive.
#[derive(Debug)]
pub(crate) enum Command {
    /// The outcome of one announce, reported by a tracker loop.
    TrackerResult {
        tracker_index: usize,
        result: AnnounceResult,
        interval: Duration,
        next_announce: Instant,
    },
    /// A peer session task has ended and should be evicted.
    PeerStopped(SocketAddr),
    /// The engine accepted a connection for this torrent; the handshake was
    /// already read off the socket.
    InboundPeer {
        socket: Framed<TcpStream, HandshakeCodec>,
        addr: SocketAddr,
        peer_id: PeerId,
    },
    Snapshot(oneshot::Sender<TorrentSnapshot>),
    PeerSnapshots(oneshot::Sender<Vec<PeerSnapshot>>),
    TrackerSnapshots(oneshot::Sender<Vec<TrackerSnapshot>>),
    Shutdown,
}

/// Information and handles shared between the torrent and its peer
/// sessions.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    /// Our own id, sent in every handshake.
    pub client_id: PeerId,
    pub storage: StorageInfo,
    /// The single authority over piece and block state.
    pub pieces: RwLock<PieceManager>,
    /// Bytes of verified pieces added since init.
    pub downloaded: Arc<Counter>,
    /// Bytes of blocks served to peers.
    pub uploaded: Arc<Counter>,
    pub disk: DiskHandle,
    /// For notifying the torrent task (peer stopped etc).
    pub cmd_chan: Sender,
}

/// A live peer session, as seen by the torrent.
struct PeerHandle {
    cmd: peer::Sender,
    stats: Arc<PeerStats>,
}

/// Announce bookkeeping for one tracker, fed by its loop's results.
struct TrackerState {
    url: String,
    peers_returned: usize,
    interval: u32,
    reachable: bool,
    status: String,
    next_announce: Option<Instant>,
}

impl TrackerState {
    fn new(url: String) -> Self {
        Self {
            url,
            peers_returned: 0,
            interval: 0,
            reachable: false,
            status: String::new(),
            next_announce: None,
        }
    }
}

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    conf: TorrentConf,
    listen_port: u16,
    cmd_port: Fuse<Receiver>,
    /// Verified piece indices arrive here from the piece manager.
    completion_port: Fuse<UnboundedReceiver<PieceIndex>>,
    peers: HashMap<SocketAddr, PeerHandle>,
    trackers: Vec<TrackerState>,
    /// The clients are moved into their announce loops on start.
    tracker_clients: Vec<Tracker>,
    tracker_stops: Vec<oneshot::Sender<()>>,
}

impl Torrent {
    /// Builds the torrent session from parsed metadata: the piece manager
    /// (with resumed pieces already marked) and the ordered, de-duplicated
    /// tracker list. Tracker URLs with unsupported schemes are skipped.
    pub fn new(
        id: TorrentId,
        metainfo: &Metainfo,
        storage: StorageInfo,
        conf: TorrentConf,
        listen_port: u16,
        client_id: PeerId,
        disk: DiskHandle,
        resumed: Vec<PieceIndex>,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (completion_chan, completion_port) = mpsc::unbounded_channel();

        let downloaded = Arc::new(Counter::new());
        let mut pieces = PieceManager::new(
            id,
            storage.clone(),
            metainfo.piece_hashes.clone(),
            Arc::clone(&downloaded),
            disk.clone(),
            completion_chan,
        );
        pieces.mark_resumed(&resumed);

        let ctx = Arc::new(TorrentContext {
            id,
            info_hash: metainfo.info_hash,
            client_id,
            storage,
            pieces: RwLock::new(pieces),
            downloaded,
            uploaded: Arc::new(Counter::new()),
            disk,
            cmd_chan: cmd_chan.clone(),
        });

        let mut trackers = Vec::new();
        let mut tracker_clients = Vec::new();
        for url in metainfo.tracker_urls() {
            match Tracker::from_url(&url) {
                Ok(client) => {
                    trackers.push(TrackerState::new(url));
                    tracker_clients.push(client);
                }
                Err(e) => {
                    log::warn!("Skipping tracker {}: {}", url, e);
                }
            }
        }

        (
            Self {
                ctx,
                conf,
                listen_port,
                cmd_port: cmd_port.fuse(),
                completion_port: completion_port.fuse(),
                peers: HashMap::new(),
                trackers,
                tracker_clients,
                tracker_stops: Vec::new(),
            },
            cmd_chan,
        )
    }

    /// Spawns the tracker loops and runs the torrent until shutdown.
    pub async fn start(mut self) {
        log::info!(
            "Starting torrent {} ({} trackers)",
            self.ctx.id,
            self.tracker_clients.len()
        );
        for (tracker_index, tracker) in
            mem::take(&mut self.tracker_clients).into_iter().enumerate()
        {
            let (stop_chan, stop_port) = oneshot::channel();
            self.tracker_stops.push(stop_chan);
            tokio::spawn(tracker_loop(
                tracker,
                tracker_index,
                Arc::clone(&self.ctx),
                self.conf.announce_interval,
                self.listen_port,
                stop_port,
            ));
        }
        self.run().await;
    }

    async fn run(&mut self) {
        loop {
            select! {
                cmd = self.cmd_port.select_next_some() => {
                    if self.handle_cmd(cmd).await {
                        break;
                    }
                }
                index = self.completion_port.select_next_some() => {
                    self.handle_piece_completion(index);
                }
            }
        }

        // stop the tracker loops and every peer session on the way out
        for stop_chan in self.tracker_stops.drain(..) {
            let _ = stop_chan.send(());
        }
        for (addr, peer) in self.peers.drain() {
            log::debug!("Stopping peer {} session", addr);
            let _ = peer.cmd.send(peer::Command::Shutdown);
        }
        log::info!("Torrent {} stopped", self.ctx.id);
    }

    /// Executes one command; returns true when the torrent should stop.
    async fn handle_cmd(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::TrackerResult {
                tracker_index,
                result,
                interval,
                next_announce,
            } => {
                self.handle_tracker_result(
                    tracker_index,
                    result,
                    interval,
                    next_announce,
                );
                false
            }
            Command::PeerStopped(addr) => {
                log::info!("Evicting stopped peer {}", addr);
                self.peers.remove(&addr);
                false
            }
            Command::InboundPeer {
                socket,
                addr,
                peer_id,
            } => {
                self.add_inbound_peer(socket, addr, peer_id);
                false
            }
            Command::Snapshot(tx) => {
                let _ = tx.send(self.snapshot().await);
                false
            }
            Command::PeerSnapshots(tx) => {
                let _ = tx.send(self.peer_snapshots());
                false
            }
            Command::TrackerSnapshots(tx) => {
                let _ = tx.send(self.tracker_snapshots());
                false
            }
            Command::Shutdown => true,
        }
    }

    fn handle_tracker_result(
        &mut self,
        tracker_index: usize,
        result: AnnounceResult,
        interval: Duration,
        next_announce: Instant,
    ) {
        let state = &mut self.trackers[tracker_index];
        state.peers_returned = result.peers.len();
        state.interval = interval.as_secs() as u32;
        state.reachable = result.error.is_none();
        state.status = result.error.clone().unwrap_or_default();
        state.next_announce = Some(next_announce);

        match &result.error {
            Some(error) => {
                log::warn!("Tracker {} announce failed: {}", state.url, error)
            }
            None => log::info!(
                "Tracker {} returned {} peers",
                state.url,
                result.peers.len()
            ),
        }

        for peer in result.peers {
            self.connect_to_peer(peer.addr);
        }
    }

    /// Spawns an outbound session towards a tracker-supplied peer, unless
    /// one is already running for that address or the peer cap is reached.
    fn connect_to_peer(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr) {
            return;
        }
        if self.peers.len() >= self.conf.max_connected_peer_count {
            log::debug!("Torrent {} peer limit reached", self.ctx.id);
            return;
        }

        let (mut session, cmd_chan) =
            PeerSession::outbound(Arc::clone(&self.ctx), addr);
        let stats = session.stats();
        self.peers.insert(
            addr,
            PeerHandle {
                cmd: cmd_chan,
                stats,
            },
        );

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            if let Err(e) = session.start_outbound().await {
                log::info!("Peer {} session error: {}", addr, e);
            }
            let _ = ctx.cmd_chan.send(Command::PeerStopped(addr));
        });
    }

    /// Adopts a connection accepted by the engine's listener.
    fn add_inbound_peer(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        addr: SocketAddr,
        peer_id: PeerId,
    ) {
        if self.peers.contains_key(&addr) {
            log::debug!("Peer {} already connected", addr);
            return;
        }
        if self.peers.len() >= self.conf.max_connected_peer_count {
            log::debug!("Torrent {} peer limit reached", self.ctx.id);
            return;
        }
        log::info!("Adopting inbound peer {}", addr);

        let (mut session, cmd_chan) =
            PeerSession::inbound(Arc::clone(&self.ctx), addr, peer_id);
        let stats = session.stats();
        self.peers.insert(
            addr,
            PeerHandle {
                cmd: cmd_chan,
                stats,
            },
        );

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            if let Err(e) = session.start_inbound(socket).await {
                log::info!("Peer {} session error: {}", addr, e);
            }
            let _ = ctx.cmd_chan.send(Command::PeerStopped(addr));
        });
    }

    /// Broadcasts a Have for the completed piece to every live peer
    /// session. Per-peer send order is preserved by each session's command
    /// queue.
    fn handle_piece_completion(&mut self, index: PieceIndex) {
        log::debug!(
            "Broadcasting Have({}) to {} peers",
            index,
            self.peers.len()
        );
        for peer in self.peers.values() {
            if peer.stats.stopped.load(Ordering::Relaxed) {
                continue;
            }
            let _ = peer.cmd.send(peer::Command::PieceCompleted(index));
        }
    }

    async fn snapshot(&self) -> TorrentSnapshot {
        let (is_complete, completed_bytes) = {
            let pieces = self.ctx.pieces.read().await;
            (pieces.is_complete(), pieces.completed_bytes())
        };
        let total_size = self.ctx.storage.total_size;
        TorrentSnapshot {
            name: self.ctx.storage.name.clone(),
            info_hash: hex::encode(self.ctx.info_hash),
            total_size,
            downloaded: self.ctx.downloaded.sum(),
            uploaded: self.ctx.uploaded.sum(),
            progress: completed_bytes as f64 * 100.0 / total_size as f64,
            peer_count: self.peers.len(),
            tracker_count: self.trackers.len(),
            status: if is_complete {
                "completed"
            } else {
                "downloading"
            }
            .to_string(),
        }
    }

    fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let piece_count = self.ctx.storage.piece_count;
        self.peers
            .iter()
            .map(|(addr, peer)| {
                let remote_piece_count =
                    peer.stats.remote_piece_count.load(Ordering::Relaxed);
                PeerSnapshot {
                    addr: addr.to_string(),
                    client: peer.stats.client.lock().unwrap().clone(),
                    progress: remote_piece_count as f64 * 100.0
                        / piece_count as f64,
                    request_count: peer
                        .stats
                        .request_count
                        .load(Ordering::Relaxed),
                    is_choked: peer.stats.is_choked.load(Ordering::Relaxed),
                    is_interested: peer
                        .stats
                        .is_interested
                        .load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    fn tracker_snapshots(&self) -> Vec<TrackerSnapshot> {
        self.trackers
            .iter()
            .map(|state| TrackerSnapshot {
                url: state.url.clone(),
                peers_returned: state.peers_returned,
                interval: state.interval,
                reachable: state.reachable,
                status: state.status.clone(),
                next_announce_in: state
                    .next_announce
                    .map(|at| {
                        at.saturating_duration_since(Instant::now()).as_secs()
                    })
                    .unwrap_or(0),
            })
            .collect()
    }
}

/// One tracker's announce loop: announce, report the result to the torrent,
/// sleep for the returned interval (or the default on failure), repeat. The
/// stop signal is observed before every announce and during the sleep.
async fn tracker_loop(
    mut tracker: Tracker,
    tracker_index: usize,
    ctx: Arc<TorrentContext>,
    default_interval: Duration,
    listen_port: u16,
    mut stop_port: oneshot::Receiver<()>,
) {
    use tokio::sync::oneshot::error::TryRecvError;

    loop {
        match stop_port.try_recv() {
            Err(TryRecvError::Empty) => {}
            // stopped, or the torrent is gone
            _ => return,
        }

        let announce = Announce {
            info_hash: ctx.info_hash,
            peer_id: ctx.client_id,
            port: listen_port,
            downloaded: ctx.downloaded.sum(),
            uploaded: ctx.uploaded.sum(),
            total: ctx.storage.total_size,
        };
        let result = tracker.announce(&announce).await;

        let interval = if result.error.is_some() {
            default_interval
        } else {
            result
                .interval
                .map(|secs| Duration::from_secs(secs as u64))
                .unwrap_or(default_interval)
        };
        let next_announce = Instant::now() + interval;
        if ctx
            .cmd_chan
            .send(Command::TrackerResult {
                tracker_index,
                result,
                interval,
                next_announce,
            })
            .is_err()
        {
            return;
        }

        select! {
            _ = time::delay_for(interval).fuse() => {}
            _ = (&mut stop_port).fuse() => return,
        }
    }
}

/// A torrent summary for the control front-end.
#[derive(Clone, Debug, Serialize)]
pub struct TorrentSnapshot {
    pub name: String,
    /// The hex form of the info hash, the user-facing torrent key.
    pub info_hash: String,
    pub total_size: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Share of the torrent's bytes covered by complete pieces, 0 to 100.
    pub progress: f64,
    pub peer_count: usize,
    pub tracker_count: usize,
    pub status: String,
}

/// A peer list entry for the control front-end.
#[derive(Clone, Debug, Serialize)]
pub struct PeerSnapshot {
    pub addr: String,
    /// The client name decoded from the peer id.
    pub client: String,
    /// Share of pieces the remote side has, 0 to 100.
    pub progress: f64,
    pub request_count: usize,
    pub is_choked: bool,
    pub is_interested: bool,
}

/// A tracker list entry for the control front-end.
#[derive(Clone, Debug, Serialize)]
pub struct TrackerSnapshot {
    pub url: String,
    pub peers_returned: usize,
    /// The announce interval in seconds.
    pub interval: u32,
    pub reachable: bool,
    pub status: String,
    /// Seconds until the next announce.
    pub next_announce_in: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        disk,
        storage_info::FsStructure,
        FileInfo,
    };
    use std::path::PathBuf;

    fn test_metainfo(name: &str) -> Metainfo {
        Metainfo {
            name: name.to_string(),
            info_hash: [0x21; 20],
            piece_hashes: vec![[0x42; 20]; 2],
            piece_len: 16_384,
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from(name),
                torrent_offset: 0,
                len: 32_768,
            }),
            announce: None,
            announce_list: Some(vec![vec![
                // unsupported schemes are skipped when building the list
                "http://plain.example/announce".to_string(),
            ]]),
        }
    }

    #[tokio::test]
    async fn test_snapshot_query_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let name = format!("riptorrent-torrent-test-{}", std::process::id());
        let metainfo = test_metainfo(&name);
        let storage =
            StorageInfo::new(&metainfo, dir.path().to_path_buf());
        let (disk, _disk_join) = disk::spawn().unwrap();
        let resumed =
            disk.allocate_torrent(9, storage.clone()).await.unwrap();
        assert!(resumed.is_empty());

        let (torrent, cmd_chan) = Torrent::new(
            9,
            &metainfo,
            storage,
            TorrentConf::new(dir.path()),
            6881,
            *b"-RT0010-testtesttest",
            disk.clone(),
            resumed,
        );
        let join = tokio::spawn(torrent.start());

        let (tx, rx) = oneshot::channel();
        cmd_chan.send(Command::Snapshot(tx)).unwrap();
        let snapshot = rx.await.unwrap();
        assert_eq!(snapshot.name, name);
        assert_eq!(snapshot.info_hash, hex::encode([0x21; 20]));
        assert_eq!(snapshot.total_size, 32_768);
        assert_eq!(snapshot.downloaded, 0);
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.status, "downloading");
        assert_eq!(snapshot.peer_count, 0);
        // the plain http tracker was dropped at construction
        assert_eq!(snapshot.tracker_count, 0);

        let (tx, rx) = oneshot::channel();
        cmd_chan.send(Command::PeerSnapshots(tx)).unwrap();
        assert!(rx.await.unwrap().is_empty());

        cmd_chan.send(Command::Shutdown).unwrap();
        join.await.unwrap();

        let _ = std::fs::remove_file(format!("{}.fastresume", name));
    }

    /// A failed announce on the primary tracker is recorded as unreachable;
    /// a successful one on the secondary yields peers that are connected to.
    #[tokio::test]
    async fn test_tracker_fallback_spawns_peers() {
        use crate::tracker::TrackerPeer;
        use tokio::net::TcpListener;

        let dir = tempfile::tempdir().unwrap();
        let name = format!(
            "riptorrent-tracker-test-{}",
            std::process::id()
        );
        let mut metainfo = test_metainfo(&name);
        metainfo.announce =
            Some("https://primary.example/announce".to_string());
        metainfo.announce_list = Some(vec![vec![
            "udp://secondary.example:6969".to_string(),
        ]]);
        let storage =
            StorageInfo::new(&metainfo, dir.path().to_path_buf());
        let (disk, _disk_join) = disk::spawn().unwrap();
        let resumed =
            disk.allocate_torrent(3, storage.clone()).await.unwrap();

        let (torrent, cmd_chan) = Torrent::new(
            3,
            &metainfo,
            storage,
            TorrentConf::new(dir.path()),
            6881,
            *b"-RT0010-testtesttest",
            disk,
            resumed,
        );
        assert_eq!(torrent.trackers.len(), 2);
        // drive the command loop directly, without the announce loops
        let join = tokio::spawn(async move {
            let mut torrent = torrent;
            torrent.run().await;
        });

        // peers that accept but never respond keep their sessions alive
        let mut listeners = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..2 {
            let listener =
                TcpListener::bind("127.0.0.1:0").await.unwrap();
            peers.push(TrackerPeer {
                addr: listener.local_addr().unwrap(),
                id: None,
            });
            listeners.push(listener);
        }

        let now = Instant::now();
        cmd_chan
            .send(Command::TrackerResult {
                tracker_index: 0,
                result: AnnounceResult::failure("connection refused"),
                interval: Duration::from_secs(180),
                next_announce: now + Duration::from_secs(180),
            })
            .unwrap();
        cmd_chan
            .send(Command::TrackerResult {
                tracker_index: 1,
                result: AnnounceResult {
                    peers,
                    interval: Some(900),
                    error: None,
                },
                interval: Duration::from_secs(900),
                next_announce: now + Duration::from_secs(900),
            })
            .unwrap();

        let (tx, rx) = oneshot::channel();
        cmd_chan.send(Command::TrackerSnapshots(tx)).unwrap();
        let trackers = rx.await.unwrap();
        assert!(!trackers[0].reachable);
        assert_eq!(trackers[0].status, "connection refused");
        assert_eq!(trackers[0].peers_returned, 0);
        assert_eq!(trackers[0].interval, 180);
        assert!(trackers[1].reachable);
        assert_eq!(trackers[1].peers_returned, 2);
        assert_eq!(trackers[1].interval, 900);
        assert!(trackers[1].next_announce_in > 0);

        // both tracker-supplied peers got outbound sessions
        let (tx, rx) = oneshot::channel();
        cmd_chan.send(Command::PeerSnapshots(tx)).unwrap();
        assert_eq!(rx.await.unwrap().len(), 2);

        cmd_chan.send(Command::Shutdown).unwrap();
        join.await.unwrap();
        let _ = std::fs::remove_file(format!("{}.fastresume", name));
    }
}
