#![no_std]

extern crate alloc;

pub mod commd;
pub mod piece;
mod zero;

use cid::{multihash::Multihash, Cid};
use primitives_proofs::{RawCommitment, RegisteredSealProof};

use crate::piece::PaddedPieceSize;

/// Merkle tree node size in bytes.
pub const NODE_SIZE: usize = 32;

/// Filecoin piece or sector data commitment merkle node/root (CommP & CommD)
///
/// https://github.com/multiformats/multicodec/blob/badcfe56bb7e0bbb06b60d57565186cd6be1f932/table.csv#L554
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;

/// Filecoin sector data commitment merkle node/root - sealed and replicated
/// (CommR)
///
/// https://github.com/multiformats/multicodec/blob/badcfe56bb7e0bbb06b60d57565186cd6be1f932/table.csv#L555
pub const FIL_COMMITMENT_SEALED: u64 = 0xf102;

/// SHA2-256 with the two most significant bits from the last byte zeroed (as
/// via a mask with 0b00111111) - used for proving trees as in Filecoin.
///
/// https://github.com/multiformats/multicodec/blob/badcfe56bb7e0bbb06b60d57565186cd6be1f932/table.csv#L153
pub const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

/// Poseidon using BLS12-381 and arity of 2 with Filecoin parameters
///
/// https://github.com/multiformats/multicodec/blob/badcfe56bb7e0bbb06b60d57565186cd6be1f932/table.csv#L537
pub const POSEIDON_BLS12_381_A1_FC1: u64 = 0xb401;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitmentKind {
    // CommP - Piece commitment
    Piece,
    // CommD - Data commitment
    Data,
    // CommR - Replica commitment
    Replica,
}

impl CommitmentKind {
    fn multicodec(&self) -> u64 {
        match self {
            CommitmentKind::Piece | CommitmentKind::Data => FIL_COMMITMENT_UNSEALED,
            CommitmentKind::Replica => FIL_COMMITMENT_SEALED,
        }
    }

    fn multihash(&self) -> u64 {
        match self {
            CommitmentKind::Piece | CommitmentKind::Data => SHA2_256_TRUNC254_PADDED,
            CommitmentKind::Replica => POSEIDON_BLS12_381_A1_FC1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommitmentError {
    #[error("bytes are not a valid cid")]
    InvalidCid,
    #[error("cid digest is not 32 bytes long")]
    InvalidDigestLength,
    #[error("invalid multicodec {0:#x} for the commitment kind")]
    InvalidMulticodec(u64),
    #[error("invalid multihash {0:#x} for the commitment kind")]
    InvalidMultihash(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    commitment: RawCommitment,
    kind: CommitmentKind,
}

impl Commitment {
    pub fn new(commitment: RawCommitment, kind: CommitmentKind) -> Self {
        Self { commitment, kind }
    }

    /// Creates a new `Commitment` from CID bytes. Returns an error if the bytes
    /// passed do not represent a valid commitment of the given kind.
    pub fn from_bytes(bytes: &[u8], kind: CommitmentKind) -> Result<Self, CommitmentError> {
        let cid = Cid::try_from(bytes).map_err(|_| CommitmentError::InvalidCid)?;
        Self::from_cid(&cid, kind)
    }

    /// Creates a new `Commitment` from a CID. Returns an error if the CID
    /// passed does not represent a commitment of the given kind.
    pub fn from_cid(cid: &Cid, kind: CommitmentKind) -> Result<Self, CommitmentError> {
        let multicodec = cid.codec();
        if multicodec != kind.multicodec() {
            return Err(CommitmentError::InvalidMulticodec(multicodec));
        }

        let multihash = cid.hash().code();
        if multihash != kind.multihash() {
            return Err(CommitmentError::InvalidMultihash(multihash));
        }

        let commitment = cid
            .hash()
            .digest()
            .try_into()
            .map_err(|_| CommitmentError::InvalidDigestLength)?;

        Ok(Self { commitment, kind })
    }

    /// Returns the raw commitment bytes.
    pub fn raw(&self) -> RawCommitment {
        self.commitment
    }

    pub fn kind(&self) -> CommitmentKind {
        self.kind
    }

    /// Converts the commitment to a CID.
    pub fn cid(&self) -> Cid {
        // 32 bytes always fit into the 64 bytes a Multihash can hold.
        let hash = Multihash::<64>::wrap(self.kind.multihash(), &self.commitment)
            .unwrap_or_default();
        Cid::new_v1(self.kind.multicodec(), hash)
    }
}

/// Returns a zero-piece commitment for a given piece size.
pub fn zero_piece_commitment(size: PaddedPieceSize) -> Commitment {
    Commitment {
        commitment: zero::zero_piece_commitment(size),
        kind: CommitmentKind::Piece,
    }
}

/// Return a zero data commitment for specific seal proof.
pub fn zero_data_commitment(seal_proof: RegisteredSealProof) -> Commitment {
    // Zero data commitment is the same as zero piece commitment of the sector size,
    // an empty sector is filled with zeroes only.
    Commitment {
        commitment: zero::zero_piece_commitment(PaddedPieceSize::of_sector(
            seal_proof.sector_size(),
        )),
        kind: CommitmentKind::Data,
    }
}
