use codec::{Decode, Encode};
use frame_support::{pallet_prelude::*, BoundedVec};
use primitives_proofs::{
    DealId, RawCommitment, RegisteredSealProof, SectorDeal, SectorNumber, MAX_DEALS_PER_SECTOR,
    MAX_SEAL_PROOF_BYTES,
};
use scale_info::TypeInfo;

// https://github.com/filecoin-project/builtin-actors/blob/17ede2b256bc819dc309edf38e031e246a516486/runtime/src/runtime/policy.rs#L262
pub const MAX_SECTORS: u32 = 32 << 20;

/// Max size of a CID, in bytes.
pub const CID_MAX_BYTE_SIZE: u32 = 128;

/// Byte encoded CID.
pub type CidBytes = BoundedVec<u8, ConstU32<CID_MAX_BYTE_SIZE>>;

/// Lifecycle of a sector, from the point of view of the chain.
#[derive(Clone, Copy, RuntimeDebug, Decode, Encode, PartialEq, Eq, TypeInfo)]
pub enum SectorState {
    /// Nothing has been declared for this sector number.
    Uncommitted,
    /// Storage provider declared the sector, the proof is pending.
    PreCommitted,
    /// Proof of replication has been accepted.
    Proven,
}

/// This type is passed into the pre commit function on the miner pallet
#[derive(Clone, RuntimeDebug, Decode, Encode, PartialEq, Eq, TypeInfo)]
pub struct SectorPreCommitInfo<BlockNumber> {
    pub seal_proof: RegisteredSealProof,
    /// Which sector number this SP is pre-committing.
    pub sector_number: SectorNumber,
    /// This value is also known as 'commR', Commitment of replication. The terms commR and sealed_cid are interchangeable.
    /// Some docs on commR here: <https://proto.school/verifying-storage-on-filecoin/03>
    pub sealed_cid: CidBytes,
    /// Block at which the sealing started, the sealing ticket is drawn from it.
    pub seal_block: BlockNumber,
    /// Deals Ids that are supposed to be activated.
    /// If any of those is invalid, whole activation is rejected.
    pub deal_ids: BoundedVec<DealId, ConstU32<MAX_DEALS_PER_SECTOR>>,
}

/// Information stored on-chain for a pre-committed sector.
#[derive(Clone, RuntimeDebug, Decode, Encode, PartialEq, Eq, TypeInfo)]
pub struct SectorPreCommitOnChainInfo<Balance, BlockNumber> {
    pub info: SectorPreCommitInfo<BlockNumber>,
    /// CommD, as computed by the market from the deals' pieces.
    pub unsealed_cid: RawCommitment,
    /// Total collateral for this sector
    pub pre_commit_deposit: Balance,
    /// Block number this was pre-committed
    pub pre_commit_block_number: BlockNumber,
}

impl<Balance, BlockNumber> SectorPreCommitOnChainInfo<Balance, BlockNumber> {
    pub fn new(
        info: SectorPreCommitInfo<BlockNumber>,
        unsealed_cid: RawCommitment,
        pre_commit_deposit: Balance,
        pre_commit_block_number: BlockNumber,
    ) -> Self {
        Self {
            info,
            unsealed_cid,
            pre_commit_deposit,
            pre_commit_block_number,
        }
    }
}

impl<BlockNumber> From<&SectorPreCommitInfo<BlockNumber>> for SectorDeal {
    fn from(info: &SectorPreCommitInfo<BlockNumber>) -> Self {
        Self {
            sector_number: info.sector_number,
            sector_type: info.seal_proof,
            deal_ids: info.deal_ids.clone(),
        }
    }
}

#[derive(Clone, Decode, Encode, TypeInfo, RuntimeDebug, PartialEq, Eq)]
pub struct SectorOnChainInfo<BlockNumber> {
    pub sector_number: SectorNumber,
    pub seal_proof: RegisteredSealProof,
    /// The root hash of the sealed sector's merkle tree, CommR.
    pub sealed_cid: CidBytes,
    /// CommD
    pub unsealed_cid: RawCommitment,
    /// Block number during which the sector proof was accepted
    pub activation: BlockNumber,
    /// Deals stored in the sector.
    pub deal_ids: BoundedVec<DealId, ConstU32<MAX_DEALS_PER_SECTOR>>,
}

impl<BlockNumber> SectorOnChainInfo<BlockNumber> {
    pub fn from_pre_commit<Balance>(
        pre_commit: SectorPreCommitOnChainInfo<Balance, BlockNumber>,
        activation: BlockNumber,
    ) -> Self {
        SectorOnChainInfo {
            sector_number: pre_commit.info.sector_number,
            seal_proof: pre_commit.info.seal_proof,
            sealed_cid: pre_commit.info.sealed_cid,
            unsealed_cid: pre_commit.unsealed_cid,
            activation,
            deal_ids: pre_commit.info.deal_ids,
        }
    }
}

/// Arguments passed into the `prove_commit_sector` extrinsic.
#[derive(Clone, RuntimeDebug, Decode, Encode, PartialEq, Eq, TypeInfo)]
pub struct ProveCommitSector {
    pub sector_number: SectorNumber,
    pub proof: BoundedVec<u8, ConstU32<MAX_SEAL_PROOF_BYTES>>,
    /// Must be the same set of deals as declared in the pre-commit.
    pub deal_ids: BoundedVec<DealId, ConstU32<MAX_DEALS_PER_SECTOR>>,
}
