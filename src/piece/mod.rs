mod picker;
mod store;

pub use picker::Picker;
pub use store::{Block, Piece, PieceStore};

/// Registry-assigned session identifier used to track block claimants.
pub type PeerId = u64;

/// Largest requestable block. The last block of the last piece may be
/// shorter.
pub const BLOCK_MAX: usize = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// No block has been claimed yet.
    InQueue,
    /// At least one block is claimed, some are still in queue.
    InProgress,
    /// Every block is claimed or done, hash not yet verified.
    Pending,
    /// Hash verified.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    InQueue,
    Pending,
    Done,
}

pub fn piece_count(total_len: usize, piece_len: usize) -> usize {
    total_len.div_ceil(piece_len)
}

/// Actual byte length of piece `index`; the final piece is truncated to
/// whatever remains of the file.
pub fn piece_size(total_len: usize, piece_len: usize, index: usize) -> usize {
    piece_len.min(total_len - index * piece_len)
}

pub fn block_count(total_len: usize, piece_len: usize, index: usize) -> usize {
    piece_size(total_len, piece_len, index).div_ceil(BLOCK_MAX)
}

/// Byte length of block `block` within piece `index`.
pub fn block_size(total_len: usize, piece_len: usize, index: usize, block: usize) -> usize {
    BLOCK_MAX.min(piece_size(total_len, piece_len, index) - block * BLOCK_MAX)
}
