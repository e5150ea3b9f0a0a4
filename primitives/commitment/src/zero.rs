use crate::{commd::piece_hash, piece::PaddedPieceSize, NODE_SIZE};

/// Commitment of a piece of the given size filled only with zeroes.
///
/// The leaves of the tree are zeroed [`NODE_SIZE`] chunks, every level above
/// hashes two equal children, so the root only depends on the tree height.
pub(crate) fn zero_piece_commitment(size: PaddedPieceSize) -> [u8; 32] {
    let leaves = *size / NODE_SIZE as u64;
    // A valid padded size is a power of two, so the height is exact.
    let height = leaves.trailing_zeros();

    let mut node = [0u8; 32];
    for _ in 0..height {
        node = piece_hash(&node, &node);
    }
    node
}
