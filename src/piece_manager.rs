//! The piece manager is the sole owner of a torrent's piece and block state.
//!
//! Every mutating call happens behind the torrent's piece lock, which plays
//! the role of the single logical thread the state machine assumes: block
//! hand-out, block ingestion, hash verification, and the local bitfield all
//! live here. Verified pieces are handed to the disk task without awaiting
//! the write.

use std::{mem, sync::Arc};

use sha1::{Digest, Sha1};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    block_count, block_len, counter::Counter, disk::DiskHandle,
    storage_info::StorageInfo, Bitfield, BlockInfo, PieceIndex, Sha1Hash,
    TorrentId, BLOCK_LEN,
};

/// Once this share of pieces is complete, remaining blocks are requested in
/// endgame mode: the same block may be handed to multiple peers and the first
/// delivery wins.
const ENDGAME_COMPLETION_THRESHOLD: f64 = 0.9;

/// The request state of a single block within a piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    NotRequested,
    Requested,
    Received,
}

/// A piece's in-flight download state.
///
/// The buffer and the block state vector are allocated lazily when the first
/// block of the piece is requested and released as soon as the piece is
/// verified or fails verification.
#[derive(Debug, Default)]
struct Piece {
    /// The write buffer, sized to the piece length while the piece is in
    /// flight and empty otherwise.
    data: Vec<u8>,
    /// Per block request state. Its length is the piece's block count while
    /// the piece is in flight and zero otherwise.
    block_states: Vec<BlockState>,
    /// The number of blocks in `block_states` that are `Received`.
    blocks_received: usize,
    /// Set once the piece hash-verified. Only ever transitions to true.
    is_complete: bool,
}

pub(crate) struct PieceManager {
    torrent_id: TorrentId,
    storage: StorageInfo,
    /// The expected hash of each piece, in piece order.
    piece_hashes: Vec<Sha1Hash>,
    pieces: Vec<Piece>,
    /// Which pieces we have, in the wire's MSB-first packing.
    own_pieces: Bitfield,
    completed_count: usize,
    /// Where the next endgame scan starts. Deliberately shared by all peers
    /// so that they converge on the same missing region.
    endgame_cursor: usize,
    /// Bytes of verified pieces added to the local store since init.
    downloaded: Arc<Counter>,
    disk: DiskHandle,
    /// Completed piece indices are pushed here; the torrent broadcasts a Have
    /// for each.
    completion_chan: UnboundedSender<PieceIndex>,
}

impl PieceManager {
    pub fn new(
        torrent_id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        downloaded: Arc<Counter>,
        disk: DiskHandle,
        completion_chan: UnboundedSender<PieceIndex>,
    ) -> Self {
        debug_assert_eq!(piece_hashes.len(), storage.piece_count);
        let piece_count = storage.piece_count;
        let mut pieces = Vec::with_capacity(piece_count);
        pieces.resize_with(piece_count, Piece::default);
        Self {
            torrent_id,
            storage,
            piece_hashes,
            pieces,
            own_pieces: Bitfield::repeat(false, piece_count),
            completed_count: 0,
            endgame_cursor: 0,
            downloaded,
            disk,
            completion_chan,
        }
    }

    /// Marks pieces recorded in the resume log as complete, without counting
    /// them towards the downloaded bytes of this run. Out of range and
    /// duplicate entries are ignored.
    pub fn mark_resumed(&mut self, indices: &[PieceIndex]) {
        for index in indices.iter().copied() {
            if index >= self.pieces.len() || self.pieces[index].is_complete {
                continue;
            }
            self.pieces[index].is_complete = true;
            self.own_pieces.set(index, true);
            self.completed_count += 1;
        }
        if self.completed_count > 0 {
            log::info!(
                "Torrent {} resumed with {}/{} pieces",
                self.torrent_id,
                self.completed_count,
                self.pieces.len()
            );
        }
    }

    /// A snapshot of the local bitfield, in wire packing.
    pub fn own_pieces(&self) -> Bitfield {
        self.own_pieces.clone()
    }

    pub fn is_piece_complete(&self, index: PieceIndex) -> bool {
        index < self.pieces.len() && self.pieces[index].is_complete
    }

    /// True once every piece hash-verified (or was resumed).
    pub fn is_complete(&self) -> bool {
        self.completed_count == self.pieces.len()
    }

    /// The number of bytes covered by complete pieces. Unlike the downloaded
    /// counter this includes resumed pieces.
    pub fn completed_bytes(&self) -> u64 {
        let piece_count = self.storage.piece_count;
        let mut bytes = self.completed_count as u64 * self.storage.piece_len as u64;
        if piece_count > 0 && self.own_pieces[piece_count - 1] {
            bytes = bytes - self.storage.piece_len as u64
                + self.storage.last_piece_len as u64;
        }
        bytes
    }

    /// Picks the next block to request from a peer with the given piece
    /// availability, or returns `None` if the peer has nothing we need.
    ///
    /// In normal mode a block is handed out at most once and transitions to
    /// requested. Once at least 90% of pieces are complete the manager enters
    /// endgame: any block not yet received is eligible, so multiple peers may
    /// race for the same block; the scan cursor advances on every hand-out so
    /// peers spread over the remaining blocks before wrapping around.
    pub fn next_block_request(
        &mut self,
        peer_pieces: &Bitfield,
    ) -> Option<BlockInfo> {
        let piece_count = self.storage.piece_count;
        if self.completed_count == piece_count {
            return None;
        }
        debug_assert_eq!(peer_pieces.len(), piece_count);

        let endgame = self.completed_count as f64 / piece_count as f64
            >= ENDGAME_COMPLETION_THRESHOLD;
        let start = if endgame {
            self.endgame_cursor % piece_count
        } else {
            0
        };

        for i in 0..piece_count {
            let index = (start + i) % piece_count;
            if self.pieces[index].is_complete || !peer_pieces[index] {
                continue;
            }

            // piece_len can't fail for an index below the piece count
            let piece_len = self
                .storage
                .piece_len(index)
                .expect("piece index in bounds");
            self.init_piece(index, piece_len);

            let piece = &mut self.pieces[index];
            for (block, state) in piece.block_states.iter_mut().enumerate() {
                let eligible = if endgame {
                    *state != BlockState::Received
                } else {
                    *state == BlockState::NotRequested
                };
                if !eligible {
                    continue;
                }
                if *state == BlockState::NotRequested {
                    *state = BlockState::Requested;
                }
                if endgame {
                    self.endgame_cursor = index + 1;
                }
                return Some(BlockInfo {
                    piece_index: index,
                    offset: block as u32 * BLOCK_LEN,
                    len: block_len(piece_len, block),
                });
            }
        }

        None
    }

    /// Ingests a block received from a peer.
    ///
    /// Blocks for complete pieces, out of range blocks and duplicates (the
    /// normal case under endgame racing) are ignored. When the last missing
    /// block of a piece arrives the piece is hashed: a match completes the
    /// piece and hands the buffer to the disk task, a mismatch resets the
    /// piece to pristine so it is re-selectable.
    pub fn add_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
    ) {
        if piece_index >= self.pieces.len() {
            log::warn!(
                "Torrent {} received block for invalid piece {}",
                self.torrent_id,
                piece_index
            );
            return;
        }
        let block = (offset / BLOCK_LEN) as usize;
        let piece = &mut self.pieces[piece_index];

        if piece.is_complete {
            log::trace!("Piece {} already complete", piece_index);
            return;
        }
        if block >= piece.block_states.len() {
            log::trace!(
                "Piece {} block offset {} out of range",
                piece_index,
                offset
            );
            return;
        }
        if piece.block_states[block] == BlockState::Received {
            log::trace!(
                "Piece {} block {} already received",
                piece_index,
                block
            );
            return;
        }
        let begin = offset as usize;
        if begin + data.len() > piece.data.len() {
            log::warn!(
                "Piece {} block at offset {} overflows piece buffer",
                piece_index,
                offset
            );
            return;
        }

        piece.data[begin..begin + data.len()].copy_from_slice(data);
        piece.block_states[block] = BlockState::Received;
        piece.blocks_received += 1;

        if piece.blocks_received < piece.block_states.len() {
            return;
        }

        // all blocks are in, verify the piece
        let matches = {
            let digest = Sha1::digest(&piece.data);
            digest.as_slice() == self.piece_hashes[piece_index]
        };
        if matches {
            piece.is_complete = true;
            let data = mem::take(&mut piece.data);
            piece.block_states = Vec::new();
            piece.blocks_received = 0;

            self.own_pieces.set(piece_index, true);
            self.completed_count += 1;
            self.downloaded.add(data.len() as u64);
            log::info!(
                "Torrent {} finished piece {} ({}/{})",
                self.torrent_id,
                piece_index,
                self.completed_count,
                self.pieces.len()
            );

            // the torrent broadcasts the Have; during shutdown the receiver
            // may already be gone
            let _ = self.completion_chan.send(piece_index);

            if let Err(e) =
                self.disk.write_piece(self.torrent_id, piece_index, data)
            {
                log::warn!(
                    "Failed to queue piece {} for disk write: {}",
                    piece_index,
                    e
                );
            }
        } else {
            log::warn!(
                "Torrent {} piece {} failed hash verification",
                self.torrent_id,
                piece_index
            );
            piece.data = Vec::new();
            piece.block_states = Vec::new();
            piece.blocks_received = 0;
        }
    }

    /// Returns a previously handed out block to the not-requested state, e.g.
    /// after a request timed out or its connection died. A no-op for received
    /// blocks and complete pieces.
    pub fn return_block(&mut self, piece_index: PieceIndex, offset: u32) {
        if piece_index >= self.pieces.len() {
            return;
        }
        let piece = &mut self.pieces[piece_index];
        if piece.is_complete {
            return;
        }
        let block = (offset / BLOCK_LEN) as usize;
        if block >= piece.block_states.len() {
            return;
        }
        if piece.block_states[block] == BlockState::Requested {
            piece.block_states[block] = BlockState::NotRequested;
        }
    }

    /// The length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        self.storage
            .piece_len(index)
            .expect("piece index in bounds")
    }

    /// Allocates the piece's write buffer and block state vector if they
    /// aren't allocated yet.
    fn init_piece(&mut self, index: PieceIndex, piece_len: u32) {
        let piece = &mut self.pieces[index];
        if piece.block_states.is_empty() {
            piece.data = vec![0; piece_len as usize];
            piece.block_states =
                vec![BlockState::NotRequested; block_count(piece_len)];
            piece.blocks_received = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disk, storage_info::FsStructure, FileInfo};
    use std::path::PathBuf;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const PIECE_LEN: u32 = 2 * BLOCK_LEN;

    fn test_storage(piece_count: usize, last_piece_len: u32) -> StorageInfo {
        let total_size = PIECE_LEN as u64 * (piece_count as u64 - 1)
            + last_piece_len as u64;
        StorageInfo {
            name: "test".to_string(),
            piece_count,
            piece_len: PIECE_LEN,
            last_piece_len,
            total_size,
            download_dir: PathBuf::from("/tmp"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("test"),
                torrent_offset: 0,
                len: total_size,
            }),
        }
    }

    /// Builds a piece manager over pieces of deterministic content along with
    /// the content itself, keyed by piece index.
    fn test_manager(
        piece_count: usize,
        last_piece_len: u32,
    ) -> (PieceManager, Vec<Vec<u8>>, UnboundedReceiver<PieceIndex>) {
        let storage = test_storage(piece_count, last_piece_len);
        let mut piece_data = Vec::with_capacity(piece_count);
        let mut piece_hashes = Vec::with_capacity(piece_count);
        for index in 0..piece_count {
            let len = storage.piece_len(index).unwrap();
            let data: Vec<u8> =
                (0..len).map(|i| (index as u32 + i) as u8).collect();
            let mut hash = [0; 20];
            hash.copy_from_slice(&Sha1::digest(&data));
            piece_data.push(data);
            piece_hashes.push(hash);
        }
        let (disk, _) = disk::spawn().unwrap();
        let (completion_chan, completion_port) = mpsc::unbounded_channel();
        let manager = PieceManager::new(
            0,
            storage,
            piece_hashes,
            Arc::new(Counter::new()),
            disk,
            completion_chan,
        );
        (manager, piece_data, completion_port)
    }

    fn full_bitfield(piece_count: usize) -> Bitfield {
        Bitfield::repeat(true, piece_count)
    }

    /// Feeds all blocks of a piece to the manager.
    fn feed_piece(manager: &mut PieceManager, index: PieceIndex, data: &[u8]) {
        for (block, chunk) in data.chunks(BLOCK_LEN as usize).enumerate() {
            manager.add_block(index, block as u32 * BLOCK_LEN, chunk);
        }
    }

    #[tokio::test]
    async fn test_blocks_are_handed_out_in_order() {
        let (mut manager, _, _) = test_manager(2, PIECE_LEN);
        let peer_pieces = full_bitfield(2);

        let first = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(first.piece_index, 0);
        assert_eq!(first.offset, 0);
        assert_eq!(first.len, BLOCK_LEN);

        let second = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(second.piece_index, 0);
        assert_eq!(second.offset, BLOCK_LEN);

        let third = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(third.piece_index, 1);
        assert_eq!(third.offset, 0);
    }

    #[tokio::test]
    async fn test_peer_without_needed_pieces_yields_nothing() {
        let (mut manager, _, _) = test_manager(2, PIECE_LEN);
        let peer_pieces = Bitfield::repeat(false, 2);
        assert_eq!(manager.next_block_request(&peer_pieces), None);
    }

    #[tokio::test]
    async fn test_last_block_of_short_last_piece_is_trimmed() {
        // the last piece is one full block plus 100 bytes
        let (mut manager, _, _) = test_manager(2, BLOCK_LEN + 100);
        let mut peer_pieces = Bitfield::repeat(false, 2);
        peer_pieces.set(1, true);

        let first = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(first.piece_index, 1);
        assert_eq!(first.len, BLOCK_LEN);
        let second = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(second.offset, BLOCK_LEN);
        assert_eq!(second.len, 100);
    }

    #[tokio::test]
    async fn test_piece_completion() {
        let (mut manager, piece_data, mut completion_port) =
            test_manager(2, PIECE_LEN);
        let peer_pieces = full_bitfield(2);

        // drain the first piece's requests so states transition
        let _ = manager.next_block_request(&peer_pieces);
        let _ = manager.next_block_request(&peer_pieces);

        feed_piece(&mut manager, 0, &piece_data[0]);

        assert!(manager.is_piece_complete(0));
        assert!(!manager.is_complete());
        assert_eq!(manager.completed_bytes(), PIECE_LEN as u64);
        assert_eq!(manager.downloaded.sum(), PIECE_LEN as u64);
        assert_eq!(completion_port.recv().await, Some(0));

        // the local bitfield packs MSB first: piece 0 is the top bit
        assert_eq!(manager.own_pieces().as_slice(), &[0b1000_0000]);
    }

    #[tokio::test]
    async fn test_hash_mismatch_resets_piece() {
        let (mut manager, piece_data, _) = test_manager(1, PIECE_LEN);
        let peer_pieces = full_bitfield(1);
        let _ = manager.next_block_request(&peer_pieces);

        // corrupt every block
        let bad: Vec<u8> = piece_data[0].iter().map(|b| !b).collect();
        feed_piece(&mut manager, 0, &bad);

        assert!(!manager.is_piece_complete(0));
        assert_eq!(manager.downloaded.sum(), 0);
        assert_eq!(manager.own_pieces().as_slice(), &[0u8]);

        // the piece is re-selectable and completes with good data
        let request = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(request.piece_index, 0);
        assert_eq!(request.offset, 0);
        feed_piece(&mut manager, 0, &piece_data[0]);
        assert!(manager.is_piece_complete(0));
        assert!(manager.is_complete());
        assert_eq!(manager.downloaded.sum(), PIECE_LEN as u64);
    }

    #[tokio::test]
    async fn test_duplicate_block_is_ignored() {
        let (mut manager, piece_data, _) = test_manager(1, PIECE_LEN);
        let peer_pieces = full_bitfield(1);
        let _ = manager.next_block_request(&peer_pieces);

        let first_block = &piece_data[0][..BLOCK_LEN as usize];
        manager.add_block(0, 0, first_block);
        // the duplicate must not double count
        manager.add_block(0, 0, first_block);
        assert_eq!(manager.pieces[0].blocks_received, 1);

        manager.add_block(0, BLOCK_LEN, &piece_data[0][BLOCK_LEN as usize..]);
        assert!(manager.is_piece_complete(0));
    }

    #[tokio::test]
    async fn test_return_block_is_idempotent() {
        let (mut manager, _, _) = test_manager(1, PIECE_LEN);
        let peer_pieces = full_bitfield(1);

        let block = manager.next_block_request(&peer_pieces).unwrap();
        manager.return_block(block.piece_index, block.offset);
        manager.return_block(block.piece_index, block.offset);

        // the same block is handed out again
        let again = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(again, block);

        // out of range calls are no-ops
        manager.return_block(10, 0);
        manager.return_block(0, 100 * BLOCK_LEN);
    }

    #[tokio::test]
    async fn test_endgame_hands_out_requested_blocks() {
        // 10 pieces, 9 complete: endgame engages at >= 90%
        let piece_count = 10;
        let (mut manager, piece_data, _) =
            test_manager(piece_count, PIECE_LEN);
        let peer_pieces = full_bitfield(piece_count);

        for index in 0..piece_count - 1 {
            let _ = manager.next_block_request(&peer_pieces);
            let _ = manager.next_block_request(&peer_pieces);
            feed_piece(&mut manager, index, &piece_data[index]);
        }
        assert_eq!(manager.completed_count, piece_count - 1);

        // first peer requests the missing piece's first block
        let first = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(first.piece_index, 9);
        assert_eq!(first.offset, 0);

        // a second peer asking immediately gets a block of the same piece
        // even though it is already requested
        let second = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(second.piece_index, 9);

        // the first arrival wins; the duplicate is dropped silently
        feed_piece(&mut manager, 9, &piece_data[9]);
        assert!(manager.is_complete());
        manager.add_block(9, 0, &piece_data[9][..BLOCK_LEN as usize]);
        assert_eq!(
            manager.downloaded.sum(),
            piece_count as u64 * PIECE_LEN as u64
        );

        // all pieces complete: endgame disengages into None
        assert_eq!(manager.next_block_request(&peer_pieces), None);
    }

    #[tokio::test]
    async fn test_resumed_pieces_are_complete_but_not_counted() {
        let (mut manager, _, _) = test_manager(2, PIECE_LEN);
        manager.mark_resumed(&[1, 1, 7]);
        assert!(manager.is_piece_complete(1));
        assert!(!manager.is_piece_complete(0));
        assert_eq!(manager.completed_count, 1);
        assert_eq!(manager.downloaded.sum(), 0);

        // resumed pieces are not re-requested
        let peer_pieces = full_bitfield(2);
        let request = manager.next_block_request(&peer_pieces).unwrap();
        assert_eq!(request.piece_index, 0);
    }
}
