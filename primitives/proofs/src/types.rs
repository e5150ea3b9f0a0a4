use codec::{Decode, Encode, MaxEncodedLen};
use scale_info::TypeInfo;
use sp_core::ConstU32;
use sp_runtime::{BoundedVec, RuntimeDebug};

/// Identifier of a deal published in the market.
/// Assigned sequentially by the market, the first published deal gets `1`.
pub type DealId = u64;

pub type SectorNumber = u64;

/// Raw 32 byte commitment (CommD, CommR or CommP), without the CID wrapping.
pub type RawCommitment = [u8; 32];

/// Randomness used while sealing (ticket) and proving (seed).
pub type Ticket = [u8; 32];

/// Identifier of a prover, derived from the account of the storage provider.
pub type ProverId = [u8; 32];

/// How many deals can be stored in a single sector.
/// <https://github.com/filecoin-project/builtin-actors/blob/17ede2b256bc819dc309edf38e031e246a516486/runtime/src/runtime/policy.rs#L290>
pub const MAX_DEALS_PER_SECTOR: u32 = 128;

/// The maximum size, in bytes, of a PoRep proof for the supported seal proofs.
///
/// References:
/// * <https://github.com/filecoin-project/ref-fvm/blob/32583cc05aa422c8e1e7ba81d56a888ac9d90e61/shared/src/sector/registered_proof.rs#L90>
pub const MAX_SEAL_PROOF_BYTES: u32 = 1_920;

#[allow(non_camel_case_types)]
#[derive(RuntimeDebug, Decode, Encode, TypeInfo, Eq, PartialEq, Clone, Copy, MaxEncodedLen)]
pub enum RegisteredSealProof {
    StackedDRG2KiBV1P1,
}

impl RegisteredSealProof {
    pub fn sector_size(&self) -> SectorSize {
        match self {
            RegisteredSealProof::StackedDRG2KiBV1P1 => SectorSize::_2KiB,
        }
    }
}

/// SectorSize indicates one of a set of possible sizes in the network.
#[derive(Encode, Decode, TypeInfo, Clone, RuntimeDebug, PartialEq, Eq, Copy, MaxEncodedLen)]
pub enum SectorSize {
    _2KiB,
}

impl SectorSize {
    /// Returns the size of a sector in bytes
    /// <https://github.com/filecoin-project/ref-fvm/blob/5659196fa94accdf1e7f10e00586a8166c44a60d/shared/src/sector/mod.rs#L40>
    pub fn bytes(&self) -> u64 {
        match self {
            SectorSize::_2KiB => 2 << 10,
        }
    }
}

/// Binds given Sector with the Deals that it should contain.
/// Passed from the miner to the market both on pre-commit (verification)
/// and on prove-commit (activation).
#[derive(RuntimeDebug, Clone, PartialEq, Eq)]
pub struct SectorDeal {
    pub sector_number: SectorNumber,
    pub sector_type: RegisteredSealProof,
    pub deal_ids: BoundedVec<DealId, ConstU32<MAX_DEALS_PER_SECTOR>>,
}
