use core::ops::{Add, Deref};

use codec::{Decode, Encode};
use primitives_proofs::SectorSize;
use scale_info::TypeInfo;

use crate::{Commitment, NODE_SIZE};

/// Piece info contains piece commitment and piece size.
#[derive(PartialEq, Debug, Eq, Clone, Copy)]
pub struct PieceInfo {
    /// Piece commitment
    pub commitment: Commitment,
    /// Piece size
    pub size: PaddedPieceSize,
}

#[derive(Clone, Copy, Eq, PartialEq, TypeInfo, Encode, Decode, thiserror::Error)]
pub enum PaddedPieceSizeError {
    #[error("minimum piece size is 128 bytes")]
    SizeTooSmall,
    #[error("padded piece size must be a power of 2")]
    SizeNotPowerOfTwo,
    #[error("padded_piece_size is not multiple of NODE_SIZE")]
    NotAMultipleOfNodeSize,
}

impl core::fmt::Debug for PaddedPieceSizeError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

/// Size of a piece in bytes with padding. The size is always a power of two
/// number.
#[derive(PartialEq, Debug, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct PaddedPieceSize(u64);

impl PaddedPieceSize {
    /// The minimum piece size
    pub const MIN: PaddedPieceSize = PaddedPieceSize(128);

    /// Initialize new padded piece size. Error is returned if the size is
    /// invalid.
    pub fn new(size: u64) -> Result<Self, PaddedPieceSizeError> {
        if size < 128 {
            return Err(PaddedPieceSizeError::SizeTooSmall);
        }

        if size.count_ones() != 1 {
            return Err(PaddedPieceSizeError::SizeNotPowerOfTwo);
        }

        if size % NODE_SIZE as u64 != 0 {
            return Err(PaddedPieceSizeError::NotAMultipleOfNodeSize);
        }

        Ok(Self(size))
    }

    /// Padded size of a whole sector.
    pub fn of_sector(sector_size: SectorSize) -> Self {
        // Every sector size is a power of two, larger than the minimum piece.
        Self(sector_size.bytes())
    }

    /// Amount of user data that fits into a piece of this size, after the Fr32 padding.
    pub fn unpadded(self) -> u64 {
        self.0 - (self.0 / 128)
    }
}

impl core::fmt::Display for PaddedPieceSize {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for PaddedPieceSize {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Add for PaddedPieceSize {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        PaddedPieceSize(self.0 + other.0)
    }
}
