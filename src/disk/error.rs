use std::{fmt, io};

use crate::error::Error;

/// Why allocating a torrent's storage failed.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// The torrent id is already registered with the disk task.
    AlreadyExists,
    Io(io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl From<NewTorrentError> for Error {
    fn from(e: NewTorrentError) -> Self {
        match e {
            NewTorrentError::AlreadyExists => Self::TorrentExists,
            NewTorrentError::Io(e) => Self::Io(e),
        }
    }
}

/// Why writing a verified piece to disk failed. Write failures are logged and
/// counted by the disk task, never propagated to the network tasks.
#[derive(Debug)]
pub(crate) enum WriteError {
    Io(io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

/// Why reading a block for upload failed. The peer connection silently drops
/// the remote request in all of these cases.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The block is not within the torrent's piece bounds.
    InvalidBlock,
    /// The torrent id is not registered with the disk task.
    TorrentNotFound,
    /// The disk task went away before answering.
    Channel,
    Io(io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidBlock => write!(f, "invalid block"),
            Self::TorrentNotFound => write!(f, "torrent not found"),
            Self::Channel => write!(f, "disk task unavailable"),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}
