//! A peer session drives the wire protocol against one remote peer, in
//! either direction.
//!
//! After the handshake the session settles into a single loop that
//! multiplexes the peer's messages, commands from the torrent (Have
//! broadcasts and shutdown) and a one second watchdog tick. The session
//! owns its socket, so all writes are naturally sequenced; block state is
//! shared with the rest of the torrent only through the piece manager.

pub(crate) mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex as StdMutex,
        },
        time::{Duration, Instant},
    },
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        error::*, storage_info::StorageInfo, torrent::TorrentContext,
        Bitfield, BlockInfo, PeerId, PieceIndex, BLOCK_LEN,
    },
    codec::*,
};

/// The max number of block requests kept outstanding towards a peer.
pub(crate) const MAX_IN_FLIGHT: usize = 16;

/// An unanswered request is taken back from the peer after this long. The
/// connection itself survives; slowness is not a protocol violation.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer that keeps us choked and sends nothing for this long on both
/// counts is dropped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// The channel on which the torrent sends commands to the peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
#[derive(Debug)]
pub(crate) enum Command {
    /// A piece completed locally; announce it to the peer with a Have.
    PieceCompleted(PieceIndex),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// Whether the connection was initiated by us or by the remote. Direction
/// determines the handshake order only.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Direction {
    Outbound,
    Inbound,
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum ConnState {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state during which the BitTorrent handshake is exchanged.
    Handshaking,
    /// The normal state of a peer session, in which any message may be
    /// exchanged.
    Connected,
}

/// The session's protocol state. Both sides of a fresh connection start out
/// choked and not interested.
#[derive(Clone, Copy, Debug)]
struct State {
    conn: ConnState,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
    /// When the last message (of any kind) arrived.
    last_received: Instant,
    /// When the peer last unchoked us.
    last_unchoked: Instant,
}

impl State {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            conn: ConnState::Disconnected,
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            last_received: now,
            last_unchoked: now,
        }
    }
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    #[allow(dead_code)]
    id: PeerId,
    /// The client name decoded from the id.
    client: String,
}

/// Best effort view of a session for snapshots, updated by the session task
/// and read without synchronization by the torrent.
pub(crate) struct PeerStats {
    /// The decoded client name, set after the handshake.
    pub client: StdMutex<String>,
    /// How many pieces the remote side has.
    pub remote_piece_count: AtomicUsize,
    /// The current in-flight request count.
    pub request_count: AtomicUsize,
    /// Whether the peer is choking us.
    pub is_choked: AtomicBool,
    /// Whether we are interested in the peer.
    pub is_interested: AtomicBool,
    /// Set once the session task has exited.
    pub stopped: AtomicBool,
}

impl PeerStats {
    fn new() -> Self {
        Self {
            client: StdMutex::new("Unknown".to_string()),
            remote_piece_count: AtomicUsize::new(0),
            request_count: AtomicUsize::new(0),
            is_choked: AtomicBool::new(true),
            is_interested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }
}

/// A block request sent to the peer that hasn't been answered yet.
#[derive(Clone, Copy, Debug)]
struct OutgoingRequest {
    block: BlockInfo,
    sent_at: Instant,
}

type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

pub(crate) struct PeerSession {
    /// Shared information and handles of the torrent.
    torrent: Arc<TorrentContext>,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    direction: Direction,
    state: State,
    /// Which pieces the remote side has, sized to the torrent's piece count.
    peer_pieces: Bitfield,
    /// Our pending requests that we sent to peer. If we receive a block that
    /// is not in this list it is still handed to the piece manager, whose
    /// idempotent ingestion absorbs it (the endgame relies on this).
    outgoing_requests: Vec<OutgoingRequest>,
    peer_info: Option<PeerInfo>,
    stats: Arc<PeerStats>,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(
        torrent: Arc<TorrentContext>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let piece_count = torrent.storage.piece_count;
        (
            Self {
                torrent,
                cmd_port: cmd_port.fuse(),
                addr,
                direction: Direction::Outbound,
                state: State::new(),
                peer_pieces: Bitfield::repeat(false, piece_count),
                outgoing_requests: Vec::new(),
                peer_info: None,
                stats: Arc::new(PeerStats::new()),
            },
            cmd_chan,
        )
    }

    /// Creates a session for a peer that connected to us. The acceptor has
    /// already read and validated the remote handshake, so the peer id is
    /// known up front.
    pub fn inbound(
        torrent: Arc<TorrentContext>,
        addr: SocketAddr,
        peer_id: PeerId,
    ) -> (Self, Sender) {
        let (mut session, cmd_chan) = Self::outbound(torrent, addr);
        session.direction = Direction::Inbound;
        session.record_peer_info(peer_id);
        (session, cmd_chan)
    }

    /// The shared view of this session used for snapshots.
    pub fn stats(&self) -> Arc<PeerStats> {
        Arc::clone(&self.stats)
    }

    /// Connects to the peer, exchanges handshakes (sending first) and runs
    /// the session until the peer disconnects, errors out or the torrent
    /// tells it to stop.
    pub async fn start_outbound(&mut self) -> Result<()> {
        debug_assert_eq!(self.direction, Direction::Outbound);
        log::info!("Connecting to peer {}", self.addr);
        self.state.conn = ConnState::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state.conn = ConnState::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        let peer_handshake = socket
            .next()
            .await
            .ok_or(Error::PeerDisconnected)??;
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        // the codec only returns a handshake whose protocol string is valid,
        // but the advertised torrent must be ours too
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }
        self.record_peer_info(peer_handshake.peer_id);

        self.run(socket).await
    }

    /// Runs a session accepted by the engine's listener. The remote
    /// handshake was consumed by the inbound gate; we reply with ours and
    /// enter the message loop.
    pub async fn start_inbound(
        &mut self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Result<()> {
        debug_assert_eq!(self.direction, Direction::Inbound);
        log::info!("Starting inbound peer {} session", self.addr);
        self.state.conn = ConnState::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        self.run(socket).await
    }

    /// The main session loop: sends the initial bitfield, then multiplexes
    /// peer messages, torrent commands and the watchdog tick until the
    /// session ends. In-flight blocks are returned to the piece manager on
    /// the way out, however the session ends.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Result<()> {
        // Switch to the peer message codec, keeping the buffers: the peer
        // may have sent message bytes right after its handshake.
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        self.state.conn = ConnState::Connected;
        self.state.last_received = Instant::now();
        self.state.last_unchoked = Instant::now();
        log::info!(
            "Peer {} session connected ({:?})",
            self.addr,
            self.direction
        );

        // the local piece availability is always announced first, even when
        // we have nothing
        let own_pieces = self.torrent.pieces.read().await.own_pieces();
        sink.send(Message::Bitfield(own_pieces)).await?;

        let mut tick_timer = time::interval(WATCHDOG_INTERVAL).fuse();

        let result = loop {
            select! {
                msg = stream.next() => match msg {
                    Some(Ok(msg)) => {
                        self.state.last_received = Instant::now();
                        if let Err(e) = self.handle_msg(&mut sink, msg).await
                        {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    // the peer closed the connection
                    None => break Ok(()),
                },
                cmd = self.cmd_port.select_next_some() => match cmd {
                    Command::PieceCompleted(index) => {
                        if let Err(e) = sink
                            .send(Message::Have { piece_index: index })
                            .await
                        {
                            break Err(e);
                        }
                    }
                    Command::Shutdown => {
                        log::info!(
                            "Shutting down peer {} session",
                            self.addr
                        );
                        break Ok(());
                    }
                },
                _ = tick_timer.select_next_some() => {
                    if let Err(e) = self.tick(&mut sink).await {
                        break Err(e);
                    }
                }
            }
        };

        self.state.conn = ConnState::Disconnected;
        self.return_outgoing_requests().await;
        self.stats.stopped.store(true, Ordering::Relaxed);
        if let Err(e) = &result {
            let client = self
                .peer_info
                .as_ref()
                .map(|info| info.client.as_str())
                .unwrap_or("Unknown");
            log::info!(
                "Peer {} ({}) session ended: {}",
                self.addr,
                client,
                e
            );
        }
        result
    }

    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        log::debug!(
            "Received message {:?} from peer {}",
            msg.id(),
            self.addr
        );
        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(bitfield) => {
                self.handle_bitfield_msg(sink, bitfield).await?;
            }
            Message::Choke => {
                if !self.state.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.state.is_choked = true;
                    self.stats.is_choked.store(true, Ordering::Relaxed);
                }
            }
            Message::Unchoke => {
                if self.state.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.state.is_choked = false;
                    self.state.last_unchoked = Instant::now();
                    self.stats.is_choked.store(false, Ordering::Relaxed);
                    // now that we are allowed to request blocks, fill the
                    // pipeline if we're interested
                    if self.state.is_interested {
                        self.make_requests(sink).await?;
                    }
                }
            }
            Message::Interested => {
                if !self.state.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.state.is_peer_interested = true;
                }
                // every interested peer is unchoked, there is no choking
                // policy beyond this
                if self.state.is_peer_choked {
                    self.state.is_peer_choked = false;
                    sink.send(Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {
                if self.state.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.state.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                if piece_index < self.peer_pieces.len()
                    && !self.peer_pieces[piece_index]
                {
                    self.peer_pieces.set(piece_index, true);
                    self.stats
                        .remote_piece_count
                        .fetch_add(1, Ordering::Relaxed);
                }
                self.ensure_interested(sink).await?;
            }
            Message::Request(block) => {
                self.handle_request_msg(sink, block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(piece_index, offset, data).await;
                // a delivered block frees up pipeline room
                self.make_requests(sink).await?;
            }
            Message::Cancel(block) => {
                // requests are block sized and short-lived, cancel
                // bookkeeping isn't implemented
                log::trace!("Peer {} cancelled {:?}", self.addr, block);
            }
            Message::Port { port } => {
                // for the DHT, which we don't speak
                log::trace!("Peer {} sent DHT port {}", self.addr, port);
            }
        }
        Ok(())
    }

    /// Overlays the peer's bitfield on the remote piece map. The wire form
    /// is padded to a byte boundary, so trailing bits are sliced off.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut MessageSink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        log::info!("Peer {} sent bitfield", self.addr);
        bitfield.resize(self.torrent.storage.piece_count, false);
        self.stats
            .remote_piece_count
            .store(bitfield.count_ones(), Ordering::Relaxed);
        self.peer_pieces = bitfield;
        self.ensure_interested(sink).await
    }

    async fn ensure_interested(
        &mut self,
        sink: &mut MessageSink,
    ) -> Result<()> {
        if !self.state.is_interested {
            log::info!("Interested in peer {}", self.addr);
            self.state.is_interested = true;
            self.stats.is_interested.store(true, Ordering::Relaxed);
            sink.send(Message::Interested).await?;
        }
        Ok(())
    }

    /// Fills the request pipeline up to [`MAX_IN_FLIGHT`] while the piece
    /// manager has blocks this peer can serve.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {
        while !self.state.is_choked
            && self.outgoing_requests.len() < MAX_IN_FLIGHT
        {
            let block = self
                .torrent
                .pieces
                .write()
                .await
                .next_block_request(&self.peer_pieces);
            let block = match block {
                Some(block) => block,
                None => break,
            };
            log::debug!(
                "Requesting block {:?} from peer {}",
                block,
                self.addr
            );
            self.outgoing_requests.push(OutgoingRequest {
                block,
                sent_at: Instant::now(),
            });
            self.stats
                .request_count
                .store(self.outgoing_requests.len(), Ordering::Relaxed);
            sink.send(Message::Request(block)).await?;
        }
        Ok(())
    }

    /// Takes delivery of a block: the matching in-flight entry is removed
    /// and the bytes go to the piece manager. Unknown `(piece, begin)` pairs
    /// are handed over too; the manager's received guard absorbs endgame
    /// duplicates.
    async fn handle_block_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) {
        log::debug!(
            "Received block ({}, {}) of {} bytes from peer {}",
            piece_index,
            offset,
            data.len(),
            self.addr
        );
        match self.outgoing_requests.iter().position(|request| {
            request.block.piece_index == piece_index
                && request.block.offset == offset
        }) {
            Some(pos) => {
                self.outgoing_requests.remove(pos);
                self.stats
                    .request_count
                    .store(self.outgoing_requests.len(), Ordering::Relaxed);
            }
            None => {
                log::debug!(
                    "Peer {} sent block ({}, {}) we didn't ask for",
                    self.addr,
                    piece_index,
                    offset
                );
            }
        }
        self.torrent
            .pieces
            .write()
            .await
            .add_block(piece_index, offset, &data);
    }

    /// Serves an upload request. Requests from a choked peer, malformed
    /// requests and requests for incomplete pieces are silently dropped, as
    /// are disk read failures.
    async fn handle_request_msg(
        &mut self,
        sink: &mut MessageSink,
        block: BlockInfo,
    ) -> Result<()> {
        if self.state.is_peer_choked {
            log::debug!(
                "Ignoring request from choked peer {}",
                self.addr
            );
            return Ok(());
        }
        let valid = is_request_in_bounds(&block, &self.torrent.storage)
            && self
                .torrent
                .pieces
                .read()
                .await
                .is_piece_complete(block.piece_index);
        if !valid {
            log::debug!(
                "Peer {} sent unservable request {:?}",
                self.addr,
                block
            );
            return Ok(());
        }

        let data = match self
            .torrent
            .disk
            .read_block(self.torrent.id, block)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Failed to read block {:?}: {}", block, e);
                return Ok(());
            }
        };

        self.torrent.uploaded.add(block.len as u64);
        log::debug!("Serving block {:?} to peer {}", block, self.addr);
        sink.send(Message::Block {
            piece_index: block.piece_index,
            offset: block.offset,
            data,
        })
        .await?;
        Ok(())
    }

    /// The watchdog pass: drops the session if the peer kept us choked and
    /// silent past the idle timeout, takes back requests that timed out, and
    /// tops up the pipeline.
    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let now = Instant::now();
        if self.state.is_choked
            && now.duration_since(self.state.last_received) > IDLE_TIMEOUT
            && now.duration_since(self.state.last_unchoked) > IDLE_TIMEOUT
        {
            log::info!("Peer {} idle timeout", self.addr);
            return Err(Error::PeerIdleTimeout);
        }

        let mut timed_out = Vec::new();
        self.outgoing_requests.retain(|request| {
            if now.duration_since(request.sent_at) >= REQUEST_TIMEOUT {
                timed_out.push(request.block);
                false
            } else {
                true
            }
        });
        if !timed_out.is_empty() {
            log::debug!(
                "Returning {} timed out requests of peer {}",
                timed_out.len(),
                self.addr
            );
            self.stats
                .request_count
                .store(self.outgoing_requests.len(), Ordering::Relaxed);
            let mut pieces = self.torrent.pieces.write().await;
            for block in timed_out {
                pieces.return_block(block.piece_index, block.offset);
            }
        }

        if !self.state.is_choked
            && self.state.is_interested
            && self.outgoing_requests.len() < MAX_IN_FLIGHT
        {
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    /// Returns every in-flight block to the piece manager. Part of session
    /// teardown, whichever way the session ended.
    async fn return_outgoing_requests(&mut self) {
        if self.outgoing_requests.is_empty() {
            return;
        }
        log::debug!(
            "Returning {} in-flight blocks of peer {}",
            self.outgoing_requests.len(),
            self.addr
        );
        let requests: Vec<_> = self.outgoing_requests.drain(..).collect();
        let mut pieces = self.torrent.pieces.write().await;
        for request in requests {
            pieces.return_block(request.block.piece_index, request.block.offset);
        }
        self.stats.request_count.store(0, Ordering::Relaxed);
    }

    fn record_peer_info(&mut self, peer_id: PeerId) {
        let client = decode_client_id(&peer_id);
        log::info!("Peer {} client: {}", self.addr, client);
        *self.stats.client.lock().unwrap() = client.clone();
        self.peer_info = Some(PeerInfo {
            id: peer_id,
            client,
        });
    }
}

/// Checks a remote block request against the torrent's dimensions. Piece
/// completeness is checked separately, against the piece manager.
fn is_request_in_bounds(block: &BlockInfo, storage: &StorageInfo) -> bool {
    if block.piece_index >= storage.piece_count {
        return false;
    }
    let piece_len = match storage.piece_len(block.piece_index) {
        Ok(piece_len) => piece_len,
        Err(_) => return false,
    };
    block.len > 0
        && block.len <= BLOCK_LEN
        && block.offset % BLOCK_LEN == 0
        && block.offset as u64 + block.len as u64 <= piece_len as u64
}

/// Decodes the client name from an Azureus style peer id (`-XXyyyy-` then
/// random bytes).
pub(crate) fn decode_client_id(id: &PeerId) -> String {
    if id[0] == b'-' && id[7] == b'-' {
        let code = [id[1], id[2]];
        let name = match &code {
            b"qB" => Some("qBittorrent"),
            b"TR" => Some("Transmission"),
            b"UT" => Some("\u{3bc}Torrent"),
            b"LT" => Some("libtorrent"),
            b"AZ" => Some("Azureus"),
            _ => None,
        };
        if let Some(name) = name {
            return format!(
                "{} {}.{}.{}",
                name,
                id[3] as char,
                id[4] as char,
                id[5] as char,
            );
        }
    }
    "Unknown".to_string()
}
