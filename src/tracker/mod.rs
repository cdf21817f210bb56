//! Tracker announce clients.
//!
//! A tracker client performs one announce on demand and reports the peers
//! and the re-announce interval it got, or the failure it ran into. The
//! torrent's tracker loops own one client each and decide the announce
//! cadence; announce failures are routine and never abort a loop.

pub(crate) mod http;
pub(crate) mod udp;

use std::net::SocketAddr;

use url::Url;

use crate::{error::*, PeerId, Sha1Hash};
use http::HttpTracker;
use udp::UdpTracker;

/// A peer endpoint as returned by a tracker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TrackerPeer {
    pub addr: SocketAddr,
    /// The peer's id, only known if the tracker response was the
    /// non-compact dictionary form.
    pub id: Option<PeerId>,
}

/// The parameters of one announce.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port on which we accept inbound peer connections.
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    /// The torrent's total size; `left` is derived from it.
    pub total: u64,
}

impl Announce {
    pub fn left(&self) -> u64 {
        self.total.saturating_sub(self.downloaded)
    }
}

/// The outcome of one announce. A failed announce carries an error message
/// and no peers; the caller falls back to its default interval.
#[derive(Clone, Debug, Default)]
pub(crate) struct AnnounceResult {
    pub peers: Vec<TrackerPeer>,
    pub interval: Option<u32>,
    pub error: Option<String>,
}

impl AnnounceResult {
    pub(crate) fn failure(error: impl Into<String>) -> Self {
        Self {
            peers: Vec::new(),
            interval: None,
            error: Some(error.into()),
        }
    }
}

/// A tracker client. The variant is selected by the announce URL's scheme:
/// `https` speaks HTTP over TLS with a bencoded response body, `udp` speaks
/// the BEP 15 binary protocol. Other schemes are unsupported.
pub(crate) enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| {
            Error::UnsupportedTrackerScheme(url.to_string())
        })?;
        match parsed.scheme() {
            "https" => Ok(Self::Http(HttpTracker::new(parsed))),
            "udp" => Ok(Self::Udp(UdpTracker::new(parsed)?)),
            scheme => {
                Err(Error::UnsupportedTrackerScheme(scheme.to_string()))
            }
        }
    }

    pub async fn announce(&mut self, announce: &Announce) -> AnnounceResult {
        match self {
            Self::Http(t) => t.announce(announce).await,
            Self::Udp(t) => t.announce(announce).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_factory_selects_by_scheme() {
        assert!(matches!(
            Tracker::from_url("https://tracker.example/announce"),
            Ok(Tracker::Http(_))
        ));
        assert!(matches!(
            Tracker::from_url("udp://tracker.example:6969"),
            Ok(Tracker::Udp(_))
        ));
        assert!(matches!(
            Tracker::from_url("wss://tracker.example"),
            Err(Error::UnsupportedTrackerScheme(_))
        ));
        assert!(Tracker::from_url("not a url").is_err());
    }
}
