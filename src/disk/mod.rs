//! The disk task and its handle.
//!
//! All filesystem work of the engine runs on one task so that blocking file
//! IO never stalls the network tasks: commands are processed strictly in
//! order, with the blocking system calls pushed onto the runtime's blocking
//! thread pool. Piece writes are fire and forget, block reads are awaited by
//! the requesting peer connection through a oneshot channel.

pub(crate) mod error;
mod io;

use tokio::{
    sync::{mpsc, oneshot},
    task,
};

use crate::{
    error::{Error, Result},
    storage_info::StorageInfo,
    BlockInfo, PieceIndex, TorrentId,
};
use error::{NewTorrentError, ReadError};
use io::Disk;

/// Spawns the disk task and returns its handle along with the join handle
/// that resolves once the task has drained its command queue after a
/// [`DiskHandle::shutdown`].
pub(crate) fn spawn() -> Result<(DiskHandle, task::JoinHandle<()>)> {
    log::info!("Spawning disk IO task");
    let (mut disk, cmd_chan) = Disk::new();
    let join_handle = tokio::spawn(async move { disk.start().await });
    Ok((DiskHandle(cmd_chan), join_handle))
}

/// The channel through which the rest of the engine talks to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Sets up the torrent's on-disk layout (creating and preallocating any
    /// missing files) and returns the piece indices recorded in its resume
    /// log.
    pub async fn allocate_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
    ) -> Result<Vec<PieceIndex>> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(Command::NewTorrent { id, info, tx })
            .map_err(|_| Error::Channel)?;
        let resumed = rx.await??;
        Ok(resumed)
    }

    /// Queues a verified piece for writing. Returns as soon as the command is
    /// enqueued; write failures are logged by the disk task.
    pub fn write_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        self.0
            .send(Command::WritePiece {
                id,
                piece_index,
                data,
            })
            .map_err(|_| Error::Channel)
    }

    /// Reads a block of a complete piece for uploading to a peer.
    pub async fn read_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
    ) -> std::result::Result<Vec<u8>, ReadError> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(Command::ReadBlock { id, block, tx })
            .map_err(|_| ReadError::Channel)?;
        rx.await.map_err(|_| ReadError::Channel)?
    }

    /// Drops the torrent's file handles, optionally deleting the downloaded
    /// files and the resume log.
    pub fn remove_torrent(
        &self,
        id: TorrentId,
        delete_files: bool,
    ) -> Result<()> {
        self.0
            .send(Command::RemoveTorrent { id, delete_files })
            .map_err(|_| Error::Channel)
    }

    /// Tells the disk task to exit once all previously queued commands have
    /// been processed. Await the join handle returned by [`spawn`] for disk
    /// quiescence.
    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown).map_err(|_| Error::Channel)
    }
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// The commands the disk task can receive.
pub(crate) enum Command {
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        tx: oneshot::Sender<
            std::result::Result<Vec<PieceIndex>, NewTorrentError>,
        >,
    },
    WritePiece {
        id: TorrentId,
        piece_index: PieceIndex,
        data: Vec<u8>,
    },
    ReadBlock {
        id: TorrentId,
        block: BlockInfo,
        tx: oneshot::Sender<std::result::Result<Vec<u8>, ReadError>>,
    },
    RemoveTorrent {
        id: TorrentId,
        delete_files: bool,
    },
    Shutdown,
}
