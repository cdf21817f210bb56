//! Error types surfaced by the engine.
//!
//! All recoverable failures are contained at the component where they occur:
//! losing a peer or a tracker is routine and never tears down a torrent. The
//! variants here are what crosses module boundaries.

use std::fmt;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The metainfo file could not be parsed or is semantically invalid.
    InvalidMetainfo,
    /// Failed to decode a bencoded buffer.
    Bencode(serde_bencode::Error),
    /// The peer's handshake was malformed: bad length prefix byte or wrong
    /// protocol string.
    InvalidHandshake,
    /// The info hash in the peer's handshake does not match the torrent's.
    InvalidPeerInfoHash,
    /// The peer sent a message that violates the wire protocol framing.
    InvalidMessage,
    /// The peer closed the connection or stopped responding.
    PeerDisconnected,
    /// The peer kept us choked and silent past the idle timeout.
    PeerIdleTimeout,
    /// The piece index is not within the torrent's piece count.
    InvalidPieceIndex,
    /// The torrent id has no registered torrent.
    InvalidTorrentId,
    /// A torrent with the same info hash is already registered.
    TorrentExists,
    /// No torrent is registered under the given info hash.
    TorrentNotFound,
    /// The tracker URL's scheme has no client implementation.
    UnsupportedTrackerScheme(String),
    /// An mpsc or oneshot channel endpoint was dropped while in use. This
    /// normally only happens during shutdown.
    Channel,
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            InvalidMetainfo => write!(f, "invalid metainfo"),
            Bencode(e) => write!(f, "bencode error: {}", e),
            InvalidHandshake => write!(f, "invalid peer handshake"),
            InvalidPeerInfoHash => {
                write!(f, "info hash in peer handshake does not match")
            }
            InvalidMessage => write!(f, "invalid peer message"),
            PeerDisconnected => write!(f, "peer disconnected"),
            PeerIdleTimeout => write!(f, "peer idle timeout"),
            InvalidPieceIndex => write!(f, "invalid piece index"),
            InvalidTorrentId => write!(f, "invalid torrent id"),
            TorrentExists => write!(f, "torrent already exists"),
            TorrentNotFound => write!(f, "torrent not found"),
            UnsupportedTrackerScheme(scheme) => {
                write!(f, "unsupported tracker URL scheme: {}", scheme)
            }
            Channel => write!(f, "channel endpoint dropped"),
            Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Channel
    }
}
