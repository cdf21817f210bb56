//! The torrent engine: the entry point of the crate.
//!
//! The engine owns the disk task and the per-torrent session tasks, keyed by
//! the hex info hash, and runs the TCP listeners that gate inbound peers.
//! Multiple torrents run concurrently; adding and removing one never
//! disturbs the others.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{oneshot, RwLock},
    task,
};
use tokio_util::codec::Framed;

use crate::{
    conf::{Conf, CLIENT_ID_PREFIX},
    disk::{self, DiskHandle},
    error::*,
    metainfo::Metainfo,
    peer::codec::HandshakeCodec,
    storage_info::StorageInfo,
    torrent::{
        self, PeerSnapshot, Torrent, TorrentSnapshot, TrackerSnapshot,
    },
    PeerId, TorrentId,
};

/// A registered torrent, as seen by the engine.
struct TorrentHandle {
    id: TorrentId,
    cmd: torrent::Sender,
    join: task::JoinHandle<()>,
}

type TorrentMap = Arc<RwLock<HashMap<String, TorrentHandle>>>;

pub struct Engine {
    conf: Conf,
    /// Our peer id: a fixed prefix and a random tail, generated per engine
    /// instance.
    client_id: PeerId,
    disk: DiskHandle,
    disk_join: Option<task::JoinHandle<()>>,
    /// Live torrents keyed by their hex info hash.
    torrents: TorrentMap,
    next_torrent_id: TorrentId,
}

impl Engine {
    /// Creates the engine and spawns its disk task. Must be called within a
    /// tokio runtime.
    pub fn new(conf: Conf) -> Result<Self> {
        let client_id = generate_client_id();
        log::info!(
            "Engine client id: {}",
            String::from_utf8_lossy(&client_id)
        );
        let (disk, disk_join) = disk::spawn()?;
        Ok(Self {
            conf,
            client_id,
            disk,
            disk_join: Some(disk_join),
            torrents: Arc::new(RwLock::new(HashMap::new())),
            next_torrent_id: 0,
        })
    }

    /// Starts the inbound peer listeners on the configured port, on both
    /// address families when the host is capable. Failure to listen is not
    /// fatal: the engine still works with outbound connections only.
    pub async fn start(&self) {
        let port = self.conf.engine.listen_port;
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                log::info!("IPv4 peer listener on port {}", port);
                tokio::spawn(accept_loop(
                    listener,
                    Arc::clone(&self.torrents),
                ));
            }
            Err(e) => {
                log::warn!("Failed to bind IPv4 listener on {}: {}", port, e)
            }
        }
        match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                log::info!("IPv6 peer listener on port {}", port);
                tokio::spawn(accept_loop(
                    listener,
                    Arc::clone(&self.torrents),
                ));
            }
            Err(e) => log::debug!("No IPv6 listener: {}", e),
        }
    }

    /// Registers a torrent and starts downloading (or seeding, if the
    /// resume log shows it complete). Returns the torrent's hex info hash,
    /// the key for the query and remove operations.
    pub async fn add_torrent(&mut self, metainfo: Metainfo) -> Result<String> {
        let info_hash = hex::encode(metainfo.info_hash);
        if self.torrents.read().await.contains_key(&info_hash) {
            return Err(Error::TorrentExists);
        }

        let id = self.next_torrent_id;
        self.next_torrent_id += 1;
        log::info!("Adding torrent {} ({})", id, info_hash);

        let storage = StorageInfo::new(
            &metainfo,
            self.conf.torrent.download_dir.clone(),
        );
        // the disk task creates the layout and replays the resume log
        let resumed = self.disk.allocate_torrent(id, storage.clone()).await?;

        let (torrent, cmd_chan) = Torrent::new(
            id,
            &metainfo,
            storage,
            self.conf.torrent.clone(),
            self.conf.engine.listen_port,
            self.client_id,
            self.disk.clone(),
            resumed,
        );
        let join = tokio::spawn(torrent.start());
        self.torrents.write().await.insert(
            info_hash.clone(),
            TorrentHandle {
                id,
                cmd: cmd_chan,
                join,
            },
        );
        Ok(info_hash)
    }

    /// Stops and unregisters a torrent, optionally deleting its downloaded
    /// files and resume log.
    pub async fn remove_torrent(
        &mut self,
        info_hash: &str,
        delete_files: bool,
    ) -> Result<()> {
        let handle = self
            .torrents
            .write()
            .await
            .remove(info_hash)
            .ok_or(Error::TorrentNotFound)?;
        log::info!("Removing torrent {}", info_hash);
        let _ = handle.cmd.send(torrent::Command::Shutdown);
        let _ = handle.join.await;
        self.disk.remove_torrent(handle.id, delete_files)?;
        Ok(())
    }

    /// A summary of every registered torrent.
    pub async fn torrent_snapshots(&self) -> Vec<TorrentSnapshot> {
        let torrents = self.torrents.read().await;
        let mut snapshots = Vec::with_capacity(torrents.len());
        for handle in torrents.values() {
            let (tx, rx) = oneshot::channel();
            if handle.cmd.send(torrent::Command::Snapshot(tx)).is_ok() {
                if let Ok(snapshot) = rx.await {
                    snapshots.push(snapshot);
                }
            }
        }
        snapshots
    }

    /// The peer list of one torrent.
    pub async fn peer_snapshots(
        &self,
        info_hash: &str,
    ) -> Result<Vec<PeerSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.send_to_torrent(
            info_hash,
            torrent::Command::PeerSnapshots(tx),
        )
        .await?;
        Ok(rx.await?)
    }

    /// The tracker list of one torrent.
    pub async fn tracker_snapshots(
        &self,
        info_hash: &str,
    ) -> Result<Vec<TrackerSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.send_to_torrent(
            info_hash,
            torrent::Command::TrackerSnapshots(tx),
        )
        .await?;
        Ok(rx.await?)
    }

    async fn send_to_torrent(
        &self,
        info_hash: &str,
        cmd: torrent::Command,
    ) -> Result<()> {
        self.torrents
            .read()
            .await
            .get(info_hash)
            .ok_or(Error::TorrentNotFound)?
            .cmd
            .send(cmd)
            .map_err(|_| Error::Channel)
    }

    /// Stops every torrent, then shuts down the disk task and awaits it so
    /// that all queued piece writes are on disk before returning.
    pub async fn shutdown(mut self) -> Result<()> {
        log::info!("Shutting down engine");
        let handles: Vec<_> = {
            let mut torrents = self.torrents.write().await;
            torrents.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.cmd.send(torrent::Command::Shutdown);
            let _ = handle.join.await;
        }
        self.disk.shutdown()?;
        if let Some(join) = self.disk_join.take() {
            let _ = join.await;
        }
        Ok(())
    }
}

/// Accepts inbound peer connections and routes each through the handshake
/// gate on its own task.
async fn accept_loop(mut listener: TcpListener, torrents: TorrentMap) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                log::info!("Inbound peer connection from {}", addr);
                tokio::spawn(handle_inbound(
                    socket,
                    addr,
                    Arc::clone(&torrents),
                ));
            }
            Err(e) => {
                log::warn!("Failed to accept peer connection: {}", e);
            }
        }
    }
}

/// The inbound gate: reads the 68 byte handshake, validates its framing and
/// looks up the torrent by the advertised info hash. A match hands the
/// socket to the owning torrent; anything else closes it.
///
/// A peer from a stale swarm may well advertise a torrent we no longer
/// serve, so an unknown info hash is routine.
async fn handle_inbound(
    socket: TcpStream,
    addr: SocketAddr,
    torrents: TorrentMap,
) {
    let mut socket = Framed::new(socket, HandshakeCodec);
    let handshake = match socket.next().await {
        Some(Ok(handshake)) => handshake,
        Some(Err(e)) => {
            log::info!("Invalid handshake from {}: {}", addr, e);
            return;
        }
        None => return,
    };

    let info_hash = hex::encode(handshake.info_hash);
    let torrents = torrents.read().await;
    match torrents.get(&info_hash) {
        Some(handle) => {
            // ownership of the socket moves to the torrent, with the
            // handshake already consumed
            let _ = handle.cmd.send(torrent::Command::InboundPeer {
                socket,
                addr,
                peer_id: handshake.peer_id,
            });
        }
        None => {
            log::info!(
                "Inbound peer {} for unknown torrent {}",
                addr,
                info_hash
            );
            let _ = socket.close().await;
        }
    }
}

/// Generates the engine's peer id: the Azureus style client prefix followed
/// by 12 random alphanumeric bytes.
fn generate_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = rng.sample(rand::distributions::Alphanumeric);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FsStructure;
    use crate::FileInfo;
    use std::path::PathBuf;

    fn test_metainfo(name: &str) -> Metainfo {
        Metainfo {
            name: name.to_string(),
            info_hash: [0x77; 20],
            piece_hashes: vec![[0x42; 20]],
            piece_len: 16_384,
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from(name),
                torrent_offset: 0,
                len: 10_000,
            }),
            announce: None,
            announce_list: None,
        }
    }

    #[test]
    fn test_generated_client_id_shape() {
        let id = generate_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        // ids differ between engine instances
        assert_ne!(id[8..], generate_client_id()[8..]);
    }

    #[tokio::test]
    async fn test_add_query_remove_torrent() {
        let dir = tempfile::tempdir().unwrap();
        let name =
            format!("riptorrent-engine-test-{}", std::process::id());
        let mut engine = Engine::new(Conf::new(dir.path())).unwrap();

        let info_hash =
            engine.add_torrent(test_metainfo(&name)).await.unwrap();
        assert_eq!(info_hash, hex::encode([0x77; 20]));
        assert!(matches!(
            engine.add_torrent(test_metainfo(&name)).await,
            Err(Error::TorrentExists)
        ));

        let file_path = dir.path().join(&name);
        assert_eq!(fs_len(&file_path), 10_000);

        let snapshots = engine.torrent_snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].info_hash, info_hash);
        assert_eq!(snapshots[0].status, "downloading");
        assert!(engine.peer_snapshots(&info_hash).await.unwrap().is_empty());
        assert!(matches!(
            engine.peer_snapshots("deadbeef").await,
            Err(Error::TorrentNotFound)
        ));

        engine.remove_torrent(&info_hash, true).await.unwrap();
        assert!(matches!(
            engine.remove_torrent(&info_hash, true).await,
            Err(Error::TorrentNotFound)
        ));

        // shutdown drains the disk queue, after which the deletion is
        // visible
        engine.shutdown().await.unwrap();
        assert!(!file_path.exists());
        assert!(
            !PathBuf::from(format!("{}.fastresume", name)).exists()
        );
    }

    fn fs_len(path: &std::path::Path) -> u64 {
        std::fs::metadata(path).unwrap().len()
    }
}
