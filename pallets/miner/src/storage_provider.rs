use codec::{Decode, Encode};
use frame_support::{
    pallet_prelude::{ConstU32, RuntimeDebug},
    sp_runtime::BoundedBTreeMap,
    PalletError,
};
use primitives_proofs::{RegisteredSealProof, SectorNumber, SectorSize};
use scale_info::TypeInfo;
use sp_arithmetic::{traits::BaseArithmetic, ArithmeticError};

use crate::sector::{SectorOnChainInfo, SectorPreCommitOnChainInfo, SectorState, MAX_SECTORS};

/// This struct holds the state of a single storage provider.
#[derive(RuntimeDebug, Decode, Encode, TypeInfo)]
pub struct StorageProviderState<PeerId, AccountId, Balance, BlockNumber> {
    /// Contains static information about this storage provider
    pub info: StorageProviderInfo<PeerId, AccountId>,

    /// Information for all proven sectors.
    pub sectors:
        BoundedBTreeMap<SectorNumber, SectorOnChainInfo<BlockNumber>, ConstU32<MAX_SECTORS>>, // Cannot use ConstU64 here because of BoundedBTreeMap trait bound `Get<u32>`,

    /// Total funds locked as pre_commit_deposit
    pub pre_commit_deposits: Balance,

    /// Sectors that have been pre-committed but not yet proven.
    pub pre_committed_sectors: BoundedBTreeMap<
        SectorNumber,
        SectorPreCommitOnChainInfo<Balance, BlockNumber>,
        ConstU32<MAX_SECTORS>, // Cannot use ConstU64 here because of BoundedBTreeMap trait bound `Get<u32>`
    >,
}

impl<PeerId, AccountId, Balance, BlockNumber>
    StorageProviderState<PeerId, AccountId, Balance, BlockNumber>
where
    Balance: BaseArithmetic,
{
    pub fn new(info: StorageProviderInfo<PeerId, AccountId>) -> Self {
        Self {
            info,
            sectors: BoundedBTreeMap::new(),
            pre_commit_deposits: Balance::zero(),
            pre_committed_sectors: BoundedBTreeMap::new(),
        }
    }

    pub fn add_pre_commit_deposit(&mut self, amount: Balance) -> Result<(), ArithmeticError> {
        self.pre_commit_deposits = self
            .pre_commit_deposits
            .checked_add(&amount)
            .ok_or(ArithmeticError::Overflow)?;
        Ok(())
    }

    pub fn release_pre_commit_deposit(&mut self, amount: Balance) -> Result<(), ArithmeticError> {
        self.pre_commit_deposits = self
            .pre_commit_deposits
            .checked_sub(&amount)
            .ok_or(ArithmeticError::Underflow)?;
        Ok(())
    }

    /// Inserts sectors into the pre commit state.
    /// The sector number must not be used by any pre-committed or proven sector.
    pub fn put_pre_committed_sector(
        &mut self,
        precommit: SectorPreCommitOnChainInfo<Balance, BlockNumber>,
    ) -> Result<(), StorageProviderError> {
        let sector_number = precommit.info.sector_number;
        if self.sector_state(sector_number) != SectorState::Uncommitted {
            return Err(StorageProviderError::SectorNumberInUse);
        }

        self.pre_committed_sectors
            .try_insert(sector_number, precommit)
            .map_err(|_| StorageProviderError::MaxPreCommittedSectorExceeded)?;

        Ok(())
    }

    /// Get a pre committed sector from the given sector number.
    pub fn get_pre_committed_sector(
        &self,
        sector_number: SectorNumber,
    ) -> Result<&SectorPreCommitOnChainInfo<Balance, BlockNumber>, StorageProviderError> {
        self.pre_committed_sectors
            .get(&sector_number)
            .ok_or(StorageProviderError::SectorNotFound)
    }

    /// Removes a pre committed sector from the given sector number.
    pub fn remove_pre_committed_sector(
        &mut self,
        sector_number: SectorNumber,
    ) -> Result<SectorPreCommitOnChainInfo<Balance, BlockNumber>, StorageProviderError> {
        self.pre_committed_sectors
            .remove(&sector_number)
            .ok_or(StorageProviderError::SectorNotFound)
    }

    pub fn activate_sector(
        &mut self,
        sector_number: SectorNumber,
        info: SectorOnChainInfo<BlockNumber>,
    ) -> Result<(), StorageProviderError> {
        if self.sectors.contains_key(&sector_number) {
            return Err(StorageProviderError::SectorNumberInUse);
        }
        self.sectors
            .try_insert(sector_number, info)
            .map_err(|_| StorageProviderError::MaxPreCommittedSectorExceeded)?;
        Ok(())
    }

    pub fn sector_state(&self, sector_number: SectorNumber) -> SectorState {
        if self.sectors.contains_key(&sector_number) {
            SectorState::Proven
        } else if self.pre_committed_sectors.contains_key(&sector_number) {
            SectorState::PreCommitted
        } else {
            SectorState::Uncommitted
        }
    }
}

#[derive(Decode, Encode, PalletError, TypeInfo, RuntimeDebug, PartialEq, Eq)]
pub enum StorageProviderError {
    MaxPreCommittedSectorExceeded,
    SectorNotFound,
    SectorNumberInUse,
}

#[derive(RuntimeDebug, Clone, Decode, Encode, TypeInfo, PartialEq, Eq)]
pub struct StorageProviderInfo<PeerId, AccountId> {
    /// Libp2p identity that should be used when connecting to this Storage Provider
    pub peer_id: PeerId,
    /// The proof type used by this Storage Provider for sealing sectors.
    pub seal_proof: RegisteredSealProof,
    /// Amount of space in each sector committed to the network by this Storage Provider
    pub sector_size: SectorSize,
    /// Account which pays for the messages on behalf of the owner.
    pub worker: AccountId,
}

impl<PeerId, AccountId> StorageProviderInfo<PeerId, AccountId> {
    pub fn new(peer_id: PeerId, seal_proof: RegisteredSealProof, worker: AccountId) -> Self {
        Self {
            peer_id,
            seal_proof,
            sector_size: seal_proof.sector_size(),
            worker,
        }
    }
}
