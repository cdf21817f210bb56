use {
    lru::LruCache,
    nix::sys::uio::{pread, pwrite},
    std::{
        collections::HashMap,
        fs::{self, File, OpenOptions},
        io::{Seek, SeekFrom, Write},
        os::unix::io::AsRawFd,
        path::PathBuf,
        sync::{Arc, Mutex},
    },
    tokio::task,
};

use {
    super::{error::*, Command, CommandReceiver, CommandSender},
    crate::{
        storage_info::{FileInfo, FsStructure, StorageInfo},
        BlockInfo, PieceIndex, TorrentId,
    },
};

/// How many whole pieces the upload read cache keeps per torrent. Peers
/// request the blocks of a piece mostly in order, so one disk read serves a
/// run of requests.
const READ_CACHE_PIECE_COUNT: usize = 64;

/// The entity responsible for persisting verified pieces and serving block
/// reads for all torrents in the engine.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this map.
    torrents: HashMap<TorrentId, Torrent>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
}

impl Disk {
    pub(super) fn new() -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                torrents: HashMap::new(),
                cmd_port,
            },
            cmd_chan,
        )
    }

    /// Runs the disk event loop until shutdown. Commands are processed in
    /// order; IO failures are contained here and never abort the loop.
    pub(super) async fn start(&mut self) {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent { id, info, tx } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        let _ = tx.send(Err(NewTorrentError::AlreadyExists));
                        continue;
                    }
                    match Torrent::new(info) {
                        Ok((torrent, resumed)) => {
                            log::info!("Torrent {} allocated", id);
                            self.torrents.insert(id, torrent);
                            let _ = tx.send(Ok(resumed));
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            let _ = tx.send(Err(e));
                        }
                    }
                }
                Command::WritePiece {
                    id,
                    piece_index,
                    data,
                } => match self.torrents.get_mut(&id) {
                    Some(torrent) => {
                        torrent.write_piece(piece_index, data).await
                    }
                    None => log::warn!("Torrent {} not found", id),
                },
                Command::ReadBlock { id, block, tx } => {
                    let result = match self.torrents.get_mut(&id) {
                        Some(torrent) => torrent.read_block(block).await,
                        None => Err(ReadError::TorrentNotFound),
                    };
                    let _ = tx.send(result);
                }
                Command::RemoveTorrent { id, delete_files } => {
                    match self.torrents.remove(&id) {
                        Some(torrent) => {
                            log::info!("Removing torrent {}", id);
                            if delete_files {
                                torrent.delete_files();
                            }
                        }
                        None => log::warn!("Torrent {} not found", id),
                    }
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk IO event loop");
                    for (id, torrent) in self.torrents.iter() {
                        log::info!(
                            "Torrent {} disk stats: {} bytes written, \
                             {} bytes read, {} failed writes",
                            id,
                            torrent.stats.write_count,
                            torrent.stats.read_count,
                            torrent.stats.write_failure_count,
                        );
                    }
                    break;
                }
            }
        }
    }
}

/// A torrent's disk state: its open file handles, resume log, upload read
/// cache and IO statistics.
struct Torrent {
    info: StorageInfo,
    /// Handles of all files in torrent, opened (and preallocated if absent)
    /// during allocation. The blocking write and read closures index into
    /// this vector, hence the arc.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The resume log, opened in append mode. An entry is appended only
    /// after its piece's bytes were written.
    resume: Arc<Mutex<File>>,
    resume_path: PathBuf,
    /// Recently read pieces kept around for serving further block requests.
    read_cache: LruCache<PieceIndex, Arc<Vec<u8>>>,
    stats: Stats,
}

impl Torrent {
    /// Creates the torrent's file system structure: parent directories are
    /// created, missing files are created and preallocated to their full
    /// length, existing files are left untouched. Also opens the resume log
    /// (creating it if absent) and returns the piece indices it records.
    fn new(
        info: StorageInfo,
    ) -> Result<(Self, Vec<PieceIndex>), NewTorrentError> {
        let file_infos: Vec<FileInfo> = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is a single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                vec![file.clone()]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is an archive of {} files", files.len());
                files.clone()
            }
        };

        let mut files = Vec::with_capacity(file_infos.len());
        for file in file_infos {
            let path = info.download_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    log::info!("Creating torrent subdir {:?}", parent);
                    fs::create_dir_all(parent).map_err(|e| {
                        log::warn!("Failed to create subdir {:?}", parent);
                        NewTorrentError::Io(e)
                    })?;
                }
            }

            let existed = path.exists();
            let mut handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", path);
                    NewTorrentError::Io(e)
                })?;
            if !existed && file.len > 0 {
                // preallocate the full length so later random access writes
                // land in already reserved space
                handle
                    .seek(SeekFrom::Start(file.len - 1))
                    .and_then(|_| handle.write_all(&[0]))
                    .map_err(NewTorrentError::Io)?;
            }

            files.push(Mutex::new(TorrentFile {
                info: FileInfo {
                    path,
                    torrent_offset: file.torrent_offset,
                    len: file.len,
                },
                handle,
            }));
        }

        let resume_path = resume_file_path(&info.name);
        let resumed = match fs::read(&resume_path) {
            Ok(bytes) => parse_resume_log(&bytes, info.piece_count),
            Err(_) => Vec::new(),
        };
        let resume = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&resume_path)
            .map_err(NewTorrentError::Io)?;

        Ok((
            Self {
                info,
                files: Arc::new(files),
                resume: Arc::new(Mutex::new(resume)),
                resume_path,
                read_cache: LruCache::new(READ_CACHE_PIECE_COUNT),
                stats: Stats::default(),
            },
            resumed,
        ))
    }

    /// Writes a verified piece to the files it overlaps with and appends its
    /// index to the resume log. Failures are logged and counted; the piece
    /// stays complete in memory either way.
    async fn write_piece(&mut self, index: PieceIndex, data: Vec<u8>) {
        let piece_len = match self.info.piece_len(index) {
            Ok(len) => len,
            Err(_) => {
                log::warn!("Piece {} write with invalid index", index);
                self.stats.write_failure_count += 1;
                return;
            }
        };
        if data.len() != piece_len as usize {
            log::warn!(
                "Piece {} write buffer has {} bytes, expected {}",
                index,
                data.len(),
                piece_len
            );
            self.stats.write_failure_count += 1;
            return;
        }
        // a rewrite of the piece invalidates any cached copy
        self.read_cache.pop(&index);

        let file_range = self
            .info
            .files_intersecting_piece(index)
            .expect("piece index was checked above");
        let piece_offset = self.info.piece_offset(index);
        let files = Arc::clone(&self.files);
        let resume = Arc::clone(&self.resume);

        // don't block the reactor with the sync file writing
        let write_result = task::spawn_blocking(move || {
            let write_count = write_stream_slice(
                &files[file_range],
                piece_offset,
                &data,
            )?;
            // the resume entry goes in only once the bytes are on disk
            let mut resume = resume.lock().unwrap();
            resume
                .write_all(&(index as u32).to_le_bytes())
                .map_err(WriteError::Io)?;
            Ok::<usize, WriteError>(write_count)
        })
        .await
        // our code doesn't panic in the task so until better strategies are
        // devised, unwrap here
        .expect("disk IO write task panicked");

        match write_result {
            Ok(write_count) => {
                log::trace!("Piece {} written to disk", index);
                self.stats.write_count += write_count as u64;
            }
            Err(e) => {
                log::warn!("Piece {} disk write error: {}", index, e);
                self.stats.write_failure_count += 1;
            }
        }
    }

    /// Reads a block out of a previously written piece. The whole piece is
    /// read and cached, further blocks of it are served from memory.
    async fn read_block(
        &mut self,
        block: BlockInfo,
    ) -> Result<Vec<u8>, ReadError> {
        let index = block.piece_index;
        let piece_len = self
            .info
            .piece_len(index)
            .map_err(|_| ReadError::InvalidBlock)?;
        if block.len == 0
            || block.offset as u64 + block.len as u64 > piece_len as u64
        {
            return Err(ReadError::InvalidBlock);
        }

        let piece = match self.read_cache.get(&index) {
            Some(piece) => Arc::clone(piece),
            None => {
                let file_range = self
                    .info
                    .files_intersecting_piece(index)
                    .map_err(|_| ReadError::InvalidBlock)?;
                let piece_offset = self.info.piece_offset(index);
                let files = Arc::clone(&self.files);

                let piece = task::spawn_blocking(move || {
                    let mut piece = vec![0; piece_len as usize];
                    read_stream_slice(
                        &files[file_range],
                        piece_offset,
                        &mut piece,
                    )?;
                    Ok::<Vec<u8>, ReadError>(piece)
                })
                .await
                .expect("disk IO read task panicked")?;

                self.stats.read_count += piece_len as u64;
                let piece = Arc::new(piece);
                self.read_cache.put(index, Arc::clone(&piece));
                piece
            }
        };

        let offset = block.offset as usize;
        Ok(piece[offset..offset + block.len as usize].to_vec())
    }

    /// Deletes the downloaded files and the resume log.
    fn delete_files(&self) {
        let result = if self.info.structure.is_archive() {
            fs::remove_dir_all(&self.info.download_dir)
        } else {
            // for a single file download the one open handle is the file
            fs::remove_file(&self.files[0].lock().unwrap().info.path)
        };
        if let Err(e) = result {
            log::warn!("Failed to delete downloaded files: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.resume_path) {
            log::warn!("Failed to delete resume log: {}", e);
        }
    }
}

/// The resume log lives in the process working directory, named after the
/// torrent.
fn resume_file_path(torrent_name: &str) -> PathBuf {
    PathBuf::from(format!("{}.fastresume", torrent_name))
}

/// Parses the resume log: a packed sequence of little-endian 32 bit piece
/// indices. Out of range entries are dropped.
fn parse_resume_log(bytes: &[u8], piece_count: usize) -> Vec<PieceIndex> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
                as PieceIndex
        })
        .filter(|index| *index < piece_count)
        .collect()
}

/// Writes a buffer positioned at the given torrent stream offset across the
/// files it overlaps with.
///
/// # Important
///
/// This performs sync IO and is thus potentially blocking and should be
/// executed on a thread pool and not the executor.
fn write_stream_slice(
    files: &[Mutex<TorrentFile>],
    mut torrent_offset: u64,
    data: &[u8],
) -> Result<usize, WriteError> {
    let mut buf = data;
    let mut total_write_count = 0;
    debug_assert!(!files.is_empty());
    for file in files.iter() {
        let file = file.lock().unwrap();
        let slice = file.info.get_slice(torrent_offset, buf.len() as u64);
        // an empty file slice would mean the piece was thought to span more
        // files than it actually does
        debug_assert!(slice.len > 0);
        let write_count =
            file.write_at(&buf[..slice.len as usize], slice.offset)?;
        buf = &buf[write_count..];
        torrent_offset += write_count as u64;
        total_write_count += write_count;
        if buf.is_empty() {
            break;
        }
    }
    // all bytes must have been written at this point
    debug_assert!(buf.is_empty());
    Ok(total_write_count)
}

/// Fills a buffer positioned at the given torrent stream offset from the
/// files it overlaps with. Blocking, like [`write_stream_slice`].
fn read_stream_slice(
    files: &[Mutex<TorrentFile>],
    mut torrent_offset: u64,
    data: &mut [u8],
) -> Result<usize, ReadError> {
    let mut pos = 0;
    debug_assert!(!files.is_empty());
    for file in files.iter() {
        let file = file.lock().unwrap();
        let slice =
            file.info.get_slice(torrent_offset, (data.len() - pos) as u64);
        // an empty file slice would mean the piece was thought to span more
        // files than it actually does
        debug_assert!(slice.len > 0);
        let read_count = file
            .read_at(&mut data[pos..pos + slice.len as usize], slice.offset)?;
        pos += read_count;
        torrent_offset += read_count as u64;
        if pos == data.len() {
            break;
        }
    }
    // the whole buffer must have been filled at this point
    debug_assert_eq!(pos, data.len());
    Ok(pos)
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Writes the whole buffer at the file offset, retrying partial writes.
    fn write_at(
        &self,
        mut buf: &[u8],
        mut offset: u64,
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;
        while !buf.is_empty() {
            let write_count =
                pwrite(self.handle.as_raw_fd(), buf, offset as i64).map_err(
                    |e| {
                        log::warn!(
                            "File {:?} write error: {}",
                            self.info.path,
                            e
                        );
                        WriteError::Io(nix_to_io_error(e))
                    },
                )?;
            if write_count == 0 {
                return Err(WriteError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                )));
            }
            buf = &buf[write_count..];
            offset += write_count as u64;
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }

    /// Fills the whole buffer from the file offset, retrying partial reads.
    fn read_at(
        &self,
        buf: &mut [u8],
        mut offset: u64,
    ) -> Result<usize, ReadError> {
        let mut pos = 0;
        while pos < buf.len() {
            let read_count =
                pread(self.handle.as_raw_fd(), &mut buf[pos..], offset as i64)
                    .map_err(|e| {
                        log::warn!(
                            "File {:?} read error: {}",
                            self.info.path,
                            e
                        );
                        ReadError::Io(nix_to_io_error(e))
                    })?;
            if read_count == 0 {
                return Err(ReadError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                )));
            }
            pos += read_count;
            offset += read_count as u64;
        }
        Ok(pos)
    }
}

fn nix_to_io_error(e: nix::Error) -> std::io::Error {
    match e.as_errno() {
        Some(errno) => std::io::Error::from_raw_os_error(errno as i32),
        None => std::io::Error::new(std::io::ErrorKind::Other, e),
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
    /// The number of piece bytes read from disk (cache hits excluded).
    read_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FsStructure;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // resume logs land in the working directory, so every test gets a unique
    // torrent name and cleans up after itself
    static TEST_ID: AtomicUsize = AtomicUsize::new(0);

    struct ResumeGuard(PathBuf);

    impl Drop for ResumeGuard {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.0);
        }
    }

    fn unique_name() -> String {
        format!(
            "riptorrent-disk-test-{}-{}",
            std::process::id(),
            TEST_ID.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn archive_storage(
        download_root: &std::path::Path,
        name: &str,
    ) -> StorageInfo {
        // two pieces of 32 KiB nominal length over two files: the first
        // piece spans both files
        StorageInfo {
            name: name.to_string(),
            piece_count: 2,
            piece_len: 32_768,
            last_piece_len: 16_384,
            total_size: 49_152,
            download_dir: download_root.join(name),
            structure: FsStructure::Archive {
                files: vec![
                    FileInfo {
                        path: PathBuf::from("a/first"),
                        torrent_offset: 0,
                        len: 20_000,
                    },
                    FileInfo {
                        path: PathBuf::from("second"),
                        torrent_offset: 20_000,
                        len: 29_152,
                    },
                ],
            },
        }
    }

    #[tokio::test]
    async fn test_allocation_creates_preallocated_layout() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique_name();
        let info = archive_storage(dir.path(), &name);
        let _guard = ResumeGuard(resume_file_path(&name));

        let (_torrent, resumed) = Torrent::new(info.clone()).unwrap();
        assert!(resumed.is_empty());

        let first = info.download_dir.join("a/first");
        let second = info.download_dir.join("second");
        assert_eq!(fs::metadata(&first).unwrap().len(), 20_000);
        assert_eq!(fs::metadata(&second).unwrap().len(), 29_152);
        assert!(resume_file_path(&name).exists());

        // a second allocation sees the existing files and leaves them alone
        let (_torrent, resumed) = Torrent::new(info).unwrap();
        assert!(resumed.is_empty());
        assert_eq!(fs::metadata(&first).unwrap().len(), 20_000);
    }

    #[tokio::test]
    async fn test_write_pieces_read_blocks_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let name = unique_name();
        let info = archive_storage(dir.path(), &name);
        let _guard = ResumeGuard(resume_file_path(&name));

        let (mut torrent, _) = Torrent::new(info.clone()).unwrap();

        let piece0: Vec<u8> = (0..32_768u32).map(|i| i as u8).collect();
        let piece1: Vec<u8> = (0..16_384u32).map(|i| (i / 3) as u8).collect();
        torrent.write_piece(0, piece0.clone()).await;
        torrent.write_piece(1, piece1.clone()).await;
        assert_eq!(torrent.stats.write_failure_count, 0);
        assert_eq!(torrent.stats.write_count, 49_152);

        // the files hold the stream slices
        let first = fs::read(info.download_dir.join("a/first")).unwrap();
        let second = fs::read(info.download_dir.join("second")).unwrap();
        assert_eq!(&first[..], &piece0[..20_000]);
        assert_eq!(&second[..12_768], &piece0[20_000..]);
        assert_eq!(&second[12_768..], &piece1[..]);

        // blocks read back, including one crossing the file boundary
        let block = torrent
            .read_block(BlockInfo {
                piece_index: 0,
                offset: 16_384,
                len: 16_384,
            })
            .await
            .unwrap();
        assert_eq!(&block[..], &piece0[16_384..]);
        let block = torrent
            .read_block(BlockInfo {
                piece_index: 1,
                offset: 0,
                len: 16_384,
            })
            .await
            .unwrap();
        assert_eq!(&block[..], &piece1[..]);

        // out of bounds reads are rejected
        assert!(matches!(
            torrent
                .read_block(BlockInfo {
                    piece_index: 0,
                    offset: 32_768,
                    len: 1,
                })
                .await,
            Err(ReadError::InvalidBlock)
        ));
        assert!(matches!(
            torrent
                .read_block(BlockInfo {
                    piece_index: 2,
                    offset: 0,
                    len: 16_384,
                })
                .await,
            Err(ReadError::InvalidBlock)
        ));

        // the resume log records both pieces, in completion order
        let resume_bytes = fs::read(resume_file_path(&name)).unwrap();
        assert_eq!(resume_bytes.len(), 8);
        assert_eq!(parse_resume_log(&resume_bytes, 2), vec![0, 1]);

        // a fresh allocation resumes them
        drop(torrent);
        let (_torrent, resumed) = Torrent::new(info).unwrap();
        assert_eq!(resumed, vec![0, 1]);
    }

    #[test]
    fn test_parse_resume_log_drops_out_of_range_entries() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&9u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        // trailing partial entry is ignored
        bytes.push(0xff);
        assert_eq!(parse_resume_log(&bytes, 4), vec![1, 0]);
    }
}
