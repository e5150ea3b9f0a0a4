use alloc::vec::Vec;

use primitives_proofs::SectorSize;
use sha2::{Digest, Sha256};

use crate::{
    piece::{PaddedPieceSize, PieceInfo},
    zero_piece_commitment, Commitment, CommitmentKind, NODE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommDError {
    #[error("pieces to be joined are not the same size")]
    InvalidPieceSize,
    #[error("pieces do not fit into the sector")]
    PieceSizeTooLarge,
    #[error("too many pieces for the sector size")]
    TooManyPieces,
}

// Ensure that the pieces are correct sizes
fn ensure_piece_sizes(
    sector_size: PaddedPieceSize,
    piece_infos: &[PieceInfo],
) -> Result<(), CommDError> {
    // Sector should be able to hold all pieces
    let size_sum = piece_infos
        .iter()
        .try_fold(0u64, |acc, piece| acc.checked_add(*piece.size))
        .ok_or(CommDError::PieceSizeTooLarge)?;
    if size_sum > *sector_size {
        return Err(CommDError::PieceSizeTooLarge);
    }

    // Check if there are too many pieces for a sector of this size
    let max_pieces = *sector_size / *PaddedPieceSize::MIN;
    if piece_infos.len() as u64 > max_pieces {
        return Err(CommDError::TooManyPieces);
    }

    Ok(())
}

/// Computes an unsealed sector CID (CommD) from its constituent piece CIDs (CommPs) and sizes.
///
/// Pieces are laid out in the given order, the free space left in the sector
/// is filled with zero pieces.
pub fn compute_unsealed_sector_commitment(
    sector_size: SectorSize,
    piece_infos: &[PieceInfo],
) -> Result<Commitment, CommDError> {
    let padded_sector_size = PaddedPieceSize::of_sector(sector_size);

    // In case of no pieces, return the piece zero commitment for the whole
    // sector size.
    if piece_infos.is_empty() {
        let zero = zero_piece_commitment(padded_sector_size);
        return Ok(Commitment::new(zero.raw(), CommitmentKind::Data));
    }

    // Check if pieces are correct sizes.
    ensure_piece_sizes(padded_sector_size, piece_infos)?;

    // Reduce the pieces to the 1-piece commitment
    let mut reduction = CommDPieceReduction::new();
    for piece in piece_infos {
        reduction.add_piece(*piece)?;
    }
    let commitment = reduction.finish(padded_sector_size)?;

    Ok(Commitment::new(commitment.raw(), CommitmentKind::Data))
}

/// Reduces pieces passed to their data commitment. The process of the reduction
/// is following:
///
/// 1. Pieces are added to the stack one by one.
/// 2. After each piece is added, the stack is reduced by combining pieces of
///    the same size.
/// 3. If a piece to be added is larger than the last piece on the stack,
///    padding pieces are added until the last piece on the stack is at least as
///    large as the piece to be added.
/// 4. At the end, padding pieces are added until the stack is reduced to a
///    single piece of the sector size.
struct CommDPieceReduction {
    /// Pieces stack
    pieces: Vec<PieceInfo>,
}

impl CommDPieceReduction {
    fn new() -> Self {
        CommDPieceReduction { pieces: Vec::new() }
    }

    fn add_piece(&mut self, piece: PieceInfo) -> Result<(), CommDError> {
        // Pad the stack until the last piece is at least as large as the new one,
        // so the new piece is aligned to its own size.
        while let Some(last_piece) = self.pieces.last() {
            if last_piece.size >= piece.size {
                break;
            }

            let padding = padding_piece(last_piece.size);
            self.pieces.push(padding);
            self.reduce()?;
        }

        self.pieces.push(piece);
        self.reduce()
    }

    /// Combine pieces until there are any on the stack available to combine
    fn reduce(&mut self) -> Result<(), CommDError> {
        while self.pieces.len() >= 2 {
            let len = self.pieces.len();
            // If the two pieces on top of the stack are not the same size, we
            // can't reduce them
            if self.pieces[len - 1].size != self.pieces[len - 2].size {
                break;
            }

            let right = self.pieces.remove(len - 1);
            let left = self.pieces.remove(len - 2);
            self.pieces.push(join_piece_infos(left, right)?);
        }

        Ok(())
    }

    /// Finish the reduction of all pieces. Result is a data commitment for the
    /// pieces added, padded up to `sector_size`.
    fn finish(mut self, sector_size: PaddedPieceSize) -> Result<Commitment, CommDError> {
        loop {
            match self.pieces.as_slice() {
                [single] if single.size >= sector_size => return Ok(single.commitment),
                [.., last] => {
                    let padding = padding_piece(last.size);
                    self.pieces.push(padding);
                    self.reduce()?;
                }
                [] => return Err(CommDError::InvalidPieceSize),
            }
        }
    }
}

/// Create a piece of specific size used as a padding.
fn padding_piece(piece_size: PaddedPieceSize) -> PieceInfo {
    PieceInfo {
        commitment: zero_piece_commitment(piece_size),
        size: piece_size,
    }
}

/// Join two equally sized `PieceInfo`s together, by hashing them and adding
/// their sizes.
fn join_piece_infos(left: PieceInfo, right: PieceInfo) -> Result<PieceInfo, CommDError> {
    if left.size != right.size {
        return Err(CommDError::InvalidPieceSize);
    }

    let comm = piece_hash(&left.commitment.raw(), &right.commitment.raw());

    Ok(PieceInfo {
        commitment: Commitment::new(comm, CommitmentKind::Piece),
        size: left.size + right.size,
    })
}

/// Calculate Hash of two raw piece commitments
pub fn piece_hash(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut buf = [0u8; NODE_SIZE * 2];
    buf[..NODE_SIZE].copy_from_slice(a);
    buf[NODE_SIZE..].copy_from_slice(b);

    let mut hashed = Sha256::digest(buf);

    // strip last two bits, to ensure result is in Fr.
    hashed[31] &= 0b0011_1111;

    hashed.into()
}
