//! Piece work units
//!
//! A `PieceWork` is the unit moved between the dispatcher and a session.
//! Exactly one session owns a piece at a time; it is moved by value into
//! the session and moved back on the `done` stream, so the buffer never
//! needs interior mutability.

use sha1::{Digest, Sha1};

use crate::error::TorrentError;
use crate::protocol::BLOCK_LEN;

/// Lifecycle of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceState {
    /// Waiting on the todo queue
    #[default]
    Pending,
    /// Owned by a session
    InFlight,
    /// Downloaded and hash-verified
    Done,
    /// The owning session failed; requeue after reset
    Failed,
}

/// One piece of the payload and its download progress.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Piece index within the torrent
    pub index: u32,
    /// Exact length of this piece (the last piece may be shorter)
    pub length: u32,
    /// Expected SHA-1 of the assembled piece
    pub expected_hash: [u8; 20],
    /// Assembled bytes, indexed by block offset
    buf: Vec<u8>,
    /// Which blocks have been received
    received: Vec<bool>,
    /// Lifecycle state
    pub state: PieceState,
}

impl PieceWork {
    pub fn new(index: u32, length: u32, expected_hash: [u8; 20]) -> Self {
        let blocks = length.div_ceil(BLOCK_LEN) as usize;
        Self {
            index,
            length,
            expected_hash,
            buf: vec![0u8; length as usize],
            received: vec![false; blocks],
            state: PieceState::Pending,
        }
    }

    /// Number of 16 KiB blocks in this piece.
    pub fn block_count(&self) -> usize {
        self.received.len()
    }

    /// The `(begin, length)` of the block at `block_index`; the final
    /// block covers the remainder.
    pub fn block_range(&self, block_index: usize) -> (u32, u32) {
        let begin = block_index as u32 * BLOCK_LEN;
        let length = std::cmp::min(BLOCK_LEN, self.length - begin);
        (begin, length)
    }

    /// Store one received block at its offset.
    ///
    /// Rejects blocks that fall outside the piece, misaligned offsets
    /// and wrong-sized blocks, so a completed piece is known to cover
    /// `[0, length)` exactly. A block that is already present is dropped
    /// silently: quick choke/unchoke cycles can legitimately deliver the
    /// same range twice.
    pub fn accept_block(&mut self, begin: u32, block: &[u8]) -> Result<(), TorrentError> {
        if begin % BLOCK_LEN != 0 {
            return Err(TorrentError::protocol_with_source(
                "misaligned block offset",
                format!("piece {}, begin {}", self.index, begin),
            ));
        }
        let block_index = (begin / BLOCK_LEN) as usize;
        if block_index >= self.received.len() {
            return Err(TorrentError::protocol_with_source(
                "block offset beyond piece",
                format!("piece {}, begin {}", self.index, begin),
            ));
        }
        if self.received[block_index] {
            return Ok(());
        }
        let (_, expected_len) = self.block_range(block_index);
        if block.len() as u32 != expected_len {
            return Err(TorrentError::protocol_with_source(
                "unexpected block length",
                format!(
                    "piece {}, begin {}: expected {}, got {}",
                    self.index,
                    begin,
                    expected_len,
                    block.len()
                ),
            ));
        }

        let begin = begin as usize;
        self.buf[begin..begin + block.len()].copy_from_slice(block);
        self.received[block_index] = true;
        Ok(())
    }

    /// Whether every block has been received.
    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }

    /// Whether the block starting at `begin` has been received.
    pub fn block_is_received(&self, begin: u32) -> bool {
        let block_index = (begin / BLOCK_LEN) as usize;
        self.received.get(block_index).copied().unwrap_or(false)
    }

    /// Bytes received so far.
    pub fn downloaded(&self) -> u32 {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, &r)| r)
            .map(|(i, _)| self.block_range(i).1)
            .sum()
    }

    /// Verify the assembled piece against its expected hash and mark the
    /// terminal state accordingly.
    pub fn verify(&mut self) -> Result<(), TorrentError> {
        let actual: [u8; 20] = Sha1::digest(&self.buf).into();
        if actual != self.expected_hash {
            self.state = PieceState::Failed;
            return Err(TorrentError::integrity(self.index));
        }
        self.state = PieceState::Done;
        Ok(())
    }

    /// The assembled bytes. Meaningful once the piece is [`PieceState::Done`].
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Clear progress so a failed piece can go back to the todo queue.
    pub fn reset(&mut self) {
        self.buf.fill(0);
        self.received.fill(false);
        self.state = PieceState::Pending;
    }
}
