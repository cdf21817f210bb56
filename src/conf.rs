//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

/// The Azureus-style prefix of the client id announced to trackers and peers.
/// The remaining 12 bytes are randomized per engine instance.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-RT0010-";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The TCP port on which inbound peer connections are accepted. The same
    /// port is reported to trackers.
    pub listen_port: u16,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self { listen_port: 6881 }
    }
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide an announce interval, or the announce
    /// fails, we fall back to re-announcing after this long.
    pub announce_interval: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(180),
        }
    }
}
