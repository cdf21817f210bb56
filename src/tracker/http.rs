//! The HTTP(S) tracker client.
//!
//! One announce is a GET whose query carries the torrent and transfer state,
//! answered with a bencoded dictionary. Trackers are not always well behaved:
//! truncated responses and in-band `failure reason` strings both surface as a
//! failed announce with the message recorded, never as a crate error.

use std::{
    convert::TryInto,
    fmt,
    net::{IpAddr, SocketAddr},
};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::{self, Deserializer, Visitor};
use url::Url;

use super::{Announce, AnnounceResult, TrackerPeer};

/// The set of characters that are percent-encoded in the `info_hash` and
/// `peer_id` query parameters. Everything but the characters that are
/// unreserved in URLs, since both values are raw 20 byte strings.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

pub(crate) struct HttpTracker {
    client: reqwest::Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub async fn announce(&self, announce: &Announce) -> AnnounceResult {
        let url = self.build_announce_url(announce);
        log::debug!("Announcing to tracker {}", self.url);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Tracker {} request error: {}", self.url, e);
                return AnnounceResult::failure(e.to_string());
            }
        };
        if !response.status().is_success() {
            return AnnounceResult::failure(format!(
                "tracker returned HTTP {}",
                response.status()
            ));
        }
        // a prematurely closed stream is tolerated by parsing whatever
        // arrived; an empty or truncated body simply fails the bencode parse
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Tracker {} body error: {}", self.url, e);
                return AnnounceResult::failure(e.to_string());
            }
        };

        parse_response(&body)
    }

    /// Builds the announce URL. The `event=started` parameter is included on
    /// the very first announce, that is, while nothing has been downloaded.
    fn build_announce_url(&self, announce: &Announce) -> String {
        let mut url = format!(
            "{url}{sep}info_hash={info_hash}\
             &peer_id={peer_id}\
             &port={port}\
             &downloaded={downloaded}\
             &uploaded={uploaded}\
             &left={left}\
             &compact=1",
            url = self.url,
            sep = if self.url.query().is_some() { '&' } else { '?' },
            info_hash =
                percent_encode(&announce.info_hash, URL_ENCODE_RESERVED),
            peer_id = percent_encode(&announce.peer_id, URL_ENCODE_RESERVED),
            port = announce.port,
            downloaded = announce.downloaded,
            uploaded = announce.uploaded,
            left = announce.left(),
        );
        if announce.downloaded == 0 {
            url.push_str("&event=started");
        }
        url
    }
}

fn parse_response(body: &[u8]) -> AnnounceResult {
    let response: Response = match serde_bencode::from_bytes(body) {
        Ok(response) => response,
        Err(e) => {
            log::warn!("Failed to parse tracker response: {}", e);
            return AnnounceResult::failure(e.to_string());
        }
    };
    if let Some(reason) = response.failure_reason {
        return AnnounceResult::failure(reason);
    }
    AnnounceResult {
        peers: response.peers,
        interval: response.interval,
        error: None,
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    interval: Option<u32>,
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default, deserialize_with = "deserialize_peers")]
    peers: Vec<TrackerPeer>,
}

/// The entry of the non-compact peer list form.
#[derive(Debug, Deserialize)]
struct RawPeer {
    ip: String,
    port: u16,
    #[serde(default, rename = "peer id")]
    peer_id: Option<serde_bytes::ByteBuf>,
}

/// The `peers` key is either a list of dictionaries or a single byte string
/// of 6 byte IPv4 + port rows ("compact" form).
fn deserialize_peers<'de, D>(
    deserializer: D,
) -> Result<Vec<TrackerPeer>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PeersVisitor;

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = Vec<TrackerPeer>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a compact peer string or a list of peer dicts")
        }

        fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if bytes.len() % 6 != 0 {
                return Err(E::custom("invalid compact peer list"));
            }
            Ok(bytes
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = IpAddr::from([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    TrackerPeer {
                        addr: SocketAddr::new(ip, port),
                        id: None,
                    }
                })
                .collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<RawPeer>()? {
                // entries whose ip field is a hostname are skipped, we only
                // connect to resolved addresses
                let ip: IpAddr = match peer.ip.parse() {
                    Ok(ip) => ip,
                    Err(_) => continue,
                };
                let id = peer
                    .peer_id
                    .and_then(|id| id.into_vec().try_into().ok());
                peers.push(TrackerPeer {
                    addr: SocketAddr::new(ip, peer.port),
                    id,
                });
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeersVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{mock, Matcher};
    use percent_encoding::percent_decode_str;

    fn test_announce(downloaded: u64) -> Announce {
        Announce {
            info_hash: *b"\xab\xcd\xef\x01\x02\x03\x04\x05\x06\x07\
                          \x08\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10\x11",
            peer_id: *b"-RT0010-abcdefghijkl",
            port: 6881,
            downloaded,
            uploaded: 512,
            total: 49_152,
        }
    }

    #[test]
    fn test_info_hash_percent_encoding_round_trip() {
        let announce = test_announce(0);
        let encoded =
            percent_encode(&announce.info_hash, URL_ENCODE_RESERVED)
                .to_string();
        // every non-alphanumeric byte is an upper-case hex escape
        assert!(encoded.contains("%AB"));
        let decoded: Vec<u8> =
            percent_decode_str(&encoded).collect();
        assert_eq!(&decoded[..], &announce.info_hash[..]);
    }

    #[test]
    fn test_announce_url_carries_transfer_state() {
        let tracker = HttpTracker::new(
            Url::parse("https://tracker.example/announce").unwrap(),
        );
        let url = tracker.build_announce_url(&test_announce(16_384));
        assert!(url.starts_with("https://tracker.example/announce?info_hash=%AB"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&downloaded=16384"));
        assert!(url.contains("&uploaded=512"));
        assert!(url.contains("&left=32768"));
        assert!(url.contains("&compact=1"));
        // only the very first announce carries event=started
        assert!(!url.contains("event=started"));
        let url = tracker.build_announce_url(&test_announce(0));
        assert!(url.contains("&event=started"));
    }

    #[tokio::test]
    async fn test_announce_parses_compact_peers() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        // two peers: 10.0.0.1:6881 and 192.168.1.2:51413
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(&[192, 168, 1, 2, 0xc8, 0xd5]);
        body.extend_from_slice(b"e");
        let _m = mock("GET", Matcher::Regex("^/compact.*".to_string()))
            .with_body(body)
            .create();

        let url = format!("{}/compact", mockito::server_url());
        let tracker = HttpTracker::new(Url::parse(&url).unwrap());
        let result = tracker.announce(&test_announce(0)).await;

        assert_eq!(result.error, None);
        assert_eq!(result.interval, Some(1800));
        assert_eq!(result.peers.len(), 2);
        assert_eq!(result.peers[0].addr, "10.0.0.1:6881".parse().unwrap());
        assert_eq!(
            result.peers[1].addr,
            "192.168.1.2:51413".parse().unwrap()
        );
        assert_eq!(result.peers[0].id, None);
    }

    #[tokio::test]
    async fn test_announce_parses_peer_dict_list() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali900e5:peersl");
        body.extend_from_slice(b"d2:ip8:10.0.0.27:peer id20:-TR2940-123456789012");
        body.extend_from_slice(b"4:porti6881ee");
        // a hostname entry is skipped
        body.extend_from_slice(b"d2:ip12:seed.example4:porti6881ee");
        body.extend_from_slice(b"ee");
        let _m = mock("GET", Matcher::Regex("^/dicts.*".to_string()))
            .with_body(body)
            .create();

        let url = format!("{}/dicts", mockito::server_url());
        let tracker = HttpTracker::new(Url::parse(&url).unwrap());
        let result = tracker.announce(&test_announce(0)).await;

        assert_eq!(result.error, None);
        assert_eq!(result.interval, Some(900));
        assert_eq!(result.peers.len(), 1);
        assert_eq!(result.peers[0].addr, "10.0.0.2:6881".parse().unwrap());
        assert_eq!(result.peers[0].id, Some(*b"-TR2940-123456789012"));
    }

    #[tokio::test]
    async fn test_announce_failure_reason_and_garbage() {
        let _m = mock("GET", Matcher::Regex("^/garbage.*".to_string()))
            .with_body(b"this is not bencode".to_vec())
            .create();

        // a garbage body fails the parse, which fails the announce
        let url = format!("{}/garbage", mockito::server_url());
        let tracker = HttpTracker::new(Url::parse(&url).unwrap());
        let result = tracker.announce(&test_announce(0)).await;
        assert!(result.error.is_some());
        assert!(result.peers.is_empty());
        assert_eq!(result.interval, None);

        // an unreachable tracker is a failed announce, not a crash
        let tracker = HttpTracker::new(
            Url::parse("https://127.0.0.1:1/announce").unwrap(),
        );
        let result = tracker.announce(&test_announce(0)).await;
        assert!(result.error.is_some());
    }

    #[test]
    fn test_parse_failure_reason_body() {
        let result = parse_response(b"d14:failure reason9:not founde");
        assert_eq!(result.error.as_deref(), Some("not found"));
        assert!(result.peers.is_empty());
    }
}
