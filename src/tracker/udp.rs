//! The UDP tracker client (BEP 15).
//!
//! An announce is a two message handshake on a 60 second session: a connect
//! round trip yields a connection id, which authenticates the following
//! announce round trips until it expires. Requests and responses are fixed
//! binary layouts with big-endian fields.
//!
//! When the host has IPv6 connectivity the client runs the v4 and v6 paths
//! in one announce and merges the peer lists; the torrent session dedups.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut};
use tokio::{net::UdpSocket, time};
use url::Url;

use super::{Announce, AnnounceResult, TrackerPeer};
use crate::error::{Error, Result};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// How long a connection id remains valid, per the protocol.
const CONNECTION_TTL: Duration = Duration::from_secs(60);

/// How long we wait for a tracker datagram before declaring the announce
/// failed. A single attempt is made per announce; the next announce retries
/// from scratch.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) struct UdpTracker {
    url: String,
    host: String,
    port: u16,
    v4: Option<Context>,
    v6: Option<Context>,
    /// Whether we already tried to set up the v6 path; it is only probed
    /// once.
    probed_v6: bool,
}

/// One address family's socket and connection id cache.
struct Context {
    socket: UdpSocket,
    connection_id: u64,
    expires_at: Option<Instant>,
}

impl UdpTracker {
    pub fn new(url: Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| {
                Error::UnsupportedTrackerScheme(url.to_string())
            })?
            .to_string();
        let port = url.port().unwrap_or(6969);
        Ok(Self {
            url: url.to_string(),
            host,
            port,
            v4: None,
            v6: None,
            probed_v6: false,
        })
    }

    pub async fn announce(&mut self, announce: &Announce) -> AnnounceResult {
        // the tracker hostname may resolve to both families
        let addrs: Vec<SocketAddr> =
            match tokio::net::lookup_host((self.host.as_str(), self.port))
                .await
            {
                Ok(addrs) => addrs.collect(),
                Err(e) => {
                    log::warn!(
                        "Failed to resolve tracker {}: {}",
                        self.host,
                        e
                    );
                    return AnnounceResult::failure(e.to_string());
                }
            };

        let mut result = AnnounceResult::default();
        let mut any_success = false;

        if let Some(addr) =
            addrs.iter().find(|addr| addr.is_ipv4()).copied()
        {
            match self.announce_on_family(announce, addr, false).await {
                Ok((peers, interval)) => {
                    result.peers.extend(peers);
                    result.interval = Some(interval);
                    any_success = true;
                }
                Err(e) => log::warn!(
                    "UDP v4 announce to {} failed: {}",
                    self.url,
                    e
                ),
            }
        }
        if let Some(addr) =
            addrs.iter().find(|addr| addr.is_ipv6()).copied()
        {
            match self.announce_on_family(announce, addr, true).await {
                Ok((peers, interval)) => {
                    result.peers.extend(peers);
                    // keep the sooner re-announce deadline of the two paths
                    result.interval = Some(
                        result
                            .interval
                            .map_or(interval, |v4| v4.min(interval)),
                    );
                    any_success = true;
                }
                Err(e) => log::warn!(
                    "UDP v6 announce to {} failed: {}",
                    self.url,
                    e
                ),
            }
        }

        if any_success {
            result
        } else {
            AnnounceResult::failure("UDP tracker unreachable")
        }
    }

    /// Runs the connect/announce exchange on one address family.
    async fn announce_on_family(
        &mut self,
        announce: &Announce,
        tracker_addr: SocketAddr,
        is_v6: bool,
    ) -> std::result::Result<(Vec<TrackerPeer>, u32), String> {
        let ctx = if is_v6 {
            // v6 outbound capability is probed by the first bind attempt
            if self.v6.is_none() && !self.probed_v6 {
                self.probed_v6 = true;
                let bind_addr =
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0);
                match UdpSocket::bind(bind_addr).await {
                    Ok(socket) => {
                        self.v6 = Some(Context {
                            socket,
                            connection_id: 0,
                            expires_at: None,
                        })
                    }
                    Err(e) => {
                        log::debug!("No IPv6 outbound capability: {}", e)
                    }
                }
            }
            self.v6.as_mut().ok_or("no IPv6 socket")?
        } else {
            if self.v4.is_none() {
                let bind_addr =
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
                let socket = UdpSocket::bind(bind_addr)
                    .await
                    .map_err(|e| e.to_string())?;
                self.v4 = Some(Context {
                    socket,
                    connection_id: 0,
                    expires_at: None,
                });
            }
            self.v4.as_mut().expect("v4 context was just created")
        };

        ctx.connect_to_tracker(tracker_addr).await?;
        let response = ctx.send_announce(announce).await?;
        parse_announce_response(&response, is_v6)
    }
}

impl Context {
    /// Obtains a fresh connection id with the connect round trip, unless the
    /// cached one is still valid.
    async fn connect_to_tracker(
        &mut self,
        tracker_addr: SocketAddr,
    ) -> std::result::Result<(), String> {
        if let Some(expires_at) = self.expires_at {
            if Instant::now() < expires_at {
                return Ok(());
            }
        }

        self.socket
            .connect(tracker_addr)
            .await
            .map_err(|e| e.to_string())?;

        let transaction_id = rand::random::<u32>();
        let request = build_connect_request(transaction_id);
        self.socket
            .send(&request)
            .await
            .map_err(|e| e.to_string())?;

        let mut response = [0; 16];
        let len = time::timeout(
            RESPONSE_TIMEOUT,
            self.socket.recv(&mut response),
        )
        .await
        .map_err(|_| "connect timed out".to_string())?
        .map_err(|e| e.to_string())?;
        if len < 16 {
            return Err("incomplete connect response".to_string());
        }

        let mut buf = &response[..];
        let action = buf.get_u32();
        let received_transaction_id = buf.get_u32();
        let connection_id = buf.get_u64();
        if action != ACTION_CONNECT
            || received_transaction_id != transaction_id
        {
            return Err("invalid connect response".to_string());
        }

        self.connection_id = connection_id;
        self.expires_at = Some(Instant::now() + CONNECTION_TTL);
        Ok(())
    }

    async fn send_announce(
        &mut self,
        announce: &Announce,
    ) -> std::result::Result<Vec<u8>, String> {
        let transaction_id = rand::random::<u32>();
        let request = build_announce_request(
            self.connection_id,
            transaction_id,
            announce,
        );
        debug_assert_eq!(request.len(), 98);
        self.socket
            .send(&request)
            .await
            .map_err(|e| e.to_string())?;

        let mut response = vec![0; 1500];
        let len = time::timeout(
            RESPONSE_TIMEOUT,
            self.socket.recv(&mut response),
        )
        .await
        .map_err(|_| "announce timed out".to_string())?
        .map_err(|e| e.to_string())?;
        response.truncate(len);

        // the transaction id is validated during parsing
        if response.len() >= 8 {
            let mut buf = &response[4..8];
            if buf.get_u32() != transaction_id {
                return Err("invalid announce transaction id".to_string());
            }
        }
        Ok(response)
    }
}

fn build_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf
}

fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    announce: &Announce,
) -> Vec<u8> {
    // 0=none, 1=completed, 2=started, 3=stopped
    let event: u32 = if announce.downloaded == 0 {
        2
    } else if announce.downloaded == announce.total {
        1
    } else {
        0
    };

    let mut buf = Vec::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&announce.info_hash);
    buf.put_slice(&announce.peer_id);
    buf.put_u64(announce.downloaded);
    buf.put_u64(announce.left());
    buf.put_u64(announce.uploaded);
    buf.put_u32(event);
    // let the tracker use the source address
    buf.put_u32(0);
    buf.put_u32(rand::random::<u32>());
    // num want: default peer count
    buf.put_u32(0xFFFF_FFFF);
    buf.put_u16(announce.port);
    buf
}

/// Parses an announce response: a 20 byte header followed by peer rows,
/// 6 bytes each for IPv4 or 18 bytes each for IPv6, depending on the
/// socket's address family.
fn parse_announce_response(
    response: &[u8],
    is_v6: bool,
) -> std::result::Result<(Vec<TrackerPeer>, u32), String> {
    if response.len() < 20 {
        return Err("incomplete announce response".to_string());
    }
    let mut buf = &response[..];
    let action = buf.get_u32();
    // the transaction id was validated on receipt
    let _transaction_id = buf.get_u32();
    if action != ACTION_ANNOUNCE {
        return Err("invalid announce response".to_string());
    }
    let interval = buf.get_u32();
    let _leechers = buf.get_u32();
    let _seeders = buf.get_u32();

    let row_len = if is_v6 { 18 } else { 6 };
    let mut peers = Vec::with_capacity(buf.len() / row_len);
    while buf.len() >= row_len {
        let ip: IpAddr = if is_v6 {
            let mut octets = [0; 16];
            buf.copy_to_slice(&mut octets);
            Ipv6Addr::from(octets).into()
        } else {
            let mut octets = [0; 4];
            buf.copy_to_slice(&mut octets);
            Ipv4Addr::from(octets).into()
        };
        let port = buf.get_u16();
        peers.push(TrackerPeer {
            addr: SocketAddr::new(ip, port),
            id: None,
        });
    }
    Ok((peers, interval))
}
