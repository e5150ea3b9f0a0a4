//! # Miner Pallet
//!
//! This pallet is responsible for:
//! - Registering storage providers and their sealing parameters.
//! - Accepting sector pre-commitments, which declare the deals that a sector will hold.
//! - Verifying Proofs-of-Replication (PoRep) through the configured [`ProofVerification`] and
//!   activating the sector deals in the market once a proof is accepted.
//! - Expiring pre-commitments that were never proven, slashing their deposit.
//!
//! The Miner Pallet is the source of truth for the state of the sectors.
//!
//! [`ProofVerification`]: primitives_proofs::ProofVerification

#![cfg_attr(not(feature = "std"), no_std)]

pub use pallet::*;

#[cfg(test)]
mod tests;

mod sector;
mod storage_provider;

pub use sector::{
    CidBytes, ProveCommitSector, SectorOnChainInfo, SectorPreCommitInfo,
    SectorPreCommitOnChainInfo, SectorState,
};
pub use storage_provider::{StorageProviderError, StorageProviderInfo, StorageProviderState};

#[frame_support::pallet(dev_mode)]
pub mod pallet {
    pub const LOG_TARGET: &'static str = "runtime::miner";

    extern crate alloc;

    use core::fmt::Debug;

    use codec::{Decode, Encode};
    use frame_support::{
        dispatch::DispatchResult,
        ensure,
        pallet_prelude::*,
        sp_runtime::traits::Zero,
        traits::{Currency, ReservableCurrency},
    };
    use frame_system::{ensure_signed, pallet_prelude::*, Config as SystemConfig};
    use primitives_commitment::{Commitment, CommitmentKind};
    use primitives_proofs::{
        derive_prover_id, draw_randomness, DealId, DomainSeparationTag, Market,
        ProofVerification, Randomness, RegisteredSealProof, SectorDeal, SectorNumber,
        MAX_DEALS_PER_SECTOR,
    };
    use scale_info::TypeInfo;
    use sp_arithmetic::{traits::CheckedAdd, ArithmeticError};

    use crate::{
        sector::{
            ProveCommitSector, SectorOnChainInfo, SectorPreCommitInfo, SectorPreCommitOnChainInfo,
            SectorState, MAX_SECTORS,
        },
        storage_provider::{StorageProviderError, StorageProviderInfo, StorageProviderState},
    };

    /// Allows to extract Balance of an account via the Config::Currency associated type.
    /// BalanceOf is a sophisticated way of getting an u128.
    pub type BalanceOf<T> =
        <<T as Config>::Currency as Currency<<T as SystemConfig>::AccountId>>::Balance;

    pub type StorageProviderStateOf<T> = StorageProviderState<
        <T as Config>::PeerId,
        <T as SystemConfig>::AccountId,
        BalanceOf<T>,
        BlockNumberFor<T>,
    >;

    #[pallet::pallet]
    #[pallet::without_storage_info] // Allows to define storage items without fixed size
    pub struct Pallet<T>(_);

    #[pallet::config]
    pub trait Config: frame_system::Config {
        /// Because this pallet emits events, it depends on the runtime's definition of an event.
        type RuntimeEvent: From<Event<Self>> + IsType<<Self as frame_system::Config>::RuntimeEvent>;

        /// Peer ID is derived by hashing an encoded public key.
        /// Usually represented in bytes.
        /// https://github.com/libp2p/specs/blob/2ea41e8c769f1bead8e637a9d4ebf8c791976e8a/peer-ids/peer-ids.md#peer-ids
        type PeerId: Clone + Debug + Decode + Encode + Eq + TypeInfo;

        /// Currency mechanism, used for collateral
        type Currency: ReservableCurrency<Self::AccountId>;

        /// Market used to verify and activate the deals of a sector.
        type Market: Market<Self::AccountId, BlockNumberFor<Self>>;

        /// Proof verification trait implementation for verifying proofs
        type ProofVerification: ProofVerification;

        /// Randomness source, the sealing ticket and the interactive seed are drawn from it.
        type Randomness: Randomness<BlockNumberFor<Self>>;

        /// Deposit reserved on every pre-commit, returned when the sector is proven.
        #[pallet::constant]
        type PreCommitDeposit: Get<BalanceOf<Self>>;

        /// Number of blocks between the pre-commit and the block the interactive seed is drawn from.
        #[pallet::constant]
        type PreCommitChallengeDelay: Get<BlockNumberFor<Self>>;

        #[pallet::constant]
        /// The max prove commit duration in blocks.
        type MaxProveCommitDuration: Get<BlockNumberFor<Self>>;
    }

    #[pallet::storage]
    pub type StorageProviders<T: Config> =
        StorageMap<_, _, T::AccountId, StorageProviderStateOf<T>>;

    /// Pre-commits that expire at a given block, unless proven before.
    #[pallet::storage]
    pub type PreCommitExpirations<T: Config> = StorageDoubleMap<
        _,
        _,
        BlockNumberFor<T>,
        _,
        (T::AccountId, SectorNumber),
        (),
        OptionQuery,
    >;

    #[pallet::event]
    #[pallet::generate_deposit(fn deposit_event)]
    pub enum Event<T: Config> {
        /// Emitted when a new storage provider is registered.
        StorageProviderRegistered {
            owner: T::AccountId,
            info: StorageProviderInfo<T::PeerId, T::AccountId>,
        },
        /// Emitted when a storage provider pre commits a sector.
        SectorPreCommitted {
            owner: T::AccountId,
            sector: SectorPreCommitInfo<BlockNumberFor<T>>,
        },
        /// Emitted when a storage provider successfully proves a pre committed sector.
        SectorProven {
            owner: T::AccountId,
            sector_number: SectorNumber,
            deal_ids: BoundedVec<DealId, ConstU32<MAX_DEALS_PER_SECTOR>>,
        },
        /// Emitted when a pre-commit was not proven in time and its deposit got slashed.
        PreCommitExpired {
            owner: T::AccountId,
            sector_number: SectorNumber,
        },
    }

    #[pallet::error]
    pub enum Error<T> {
        /// Emitted when a storage provider is trying to be registered
        /// but there is already storage provider registered for that `AccountId`.
        StorageProviderExists,
        /// Emitted when an account tries to call a storage provider
        /// extrinsic but is not registered as one.
        StorageProviderNotFound,
        /// Emitted when trying to access an invalid sector.
        InvalidSector,
        /// Emitted when submitting an invalid proof type.
        InvalidProofType,
        /// Emitted when the sealed CID is not a valid replica commitment.
        InvalidCid,
        /// Emitted when the sector number is held by a pre-committed or proven sector.
        SectorNumberAlreadyUsed,
        /// Emitted when the seal block is not in the past.
        InvalidSealBlock,
        /// Emitted when there is not enough funds to run an extrinsic.
        NotEnoughFunds,
        /// Emitted when proving a sector that has not been pre-committed.
        SectorNotPreCommitted,
        /// Emitted when the prove commit window of the sector has passed.
        ProveCommitAfterDeadline,
        /// Emitted when the interactive seed of the sector is not available yet.
        ProveCommitTooEarly,
        /// Emitted when the deals of the proof are not the deals of the pre-commit.
        DealsMismatch,
        /// Emitted when the proof has been checked and rejected.
        InvalidProof,
        /// Emitted when a type conversion fails.
        ConversionError,
        /// Inner pallet errors
        StorageProviderError(StorageProviderError),
    }

    impl<T> From<StorageProviderError> for Error<T> {
        fn from(value: StorageProviderError) -> Self {
            Error::<T>::StorageProviderError(value)
        }
    }

    #[pallet::call]
    impl<T: Config> Pallet<T> {
        pub fn register_storage_provider(
            origin: OriginFor<T>,
            peer_id: T::PeerId,
            seal_proof: RegisteredSealProof,
            worker: T::AccountId,
        ) -> DispatchResult {
            // This will be the owner of the storage provider
            let owner = ensure_signed(origin)?;

            ensure!(
                !StorageProviders::<T>::contains_key(&owner),
                Error::<T>::StorageProviderExists
            );

            let info = StorageProviderInfo::new(peer_id, seal_proof, worker);
            StorageProviders::<T>::insert(&owner, StorageProviderState::new(info.clone()));

            Self::deposit_event(Event::StorageProviderRegistered { owner, info });

            Ok(())
        }

        /// Pledges the storage provider to seal and commit a new sector holding the given deals.
        pub fn pre_commit_sector(
            origin: OriginFor<T>,
            sector: SectorPreCommitInfo<BlockNumberFor<T>>,
        ) -> DispatchResult {
            let owner = ensure_signed(origin)?;
            let sp = StorageProviders::<T>::try_get(&owner)
                .map_err(|_| Error::<T>::StorageProviderNotFound)?;
            let current_block = <frame_system::Pallet<T>>::block_number();

            ensure!(
                sector.sector_number <= MAX_SECTORS.into(),
                Error::<T>::InvalidSector
            );
            ensure!(
                sp.info.seal_proof == sector.seal_proof,
                Error::<T>::InvalidProofType
            );
            Commitment::from_bytes(&sector.sealed_cid, CommitmentKind::Replica)
                .map_err(|_| Error::<T>::InvalidCid)?;
            ensure!(
                sp.sector_state(sector.sector_number) == SectorState::Uncommitted,
                Error::<T>::SectorNumberAlreadyUsed
            );
            ensure!(
                sector.seal_block < current_block,
                Error::<T>::InvalidSealBlock
            );
            let expiration = current_block
                .checked_add(&T::MaxProveCommitDuration::get())
                .ok_or(ArithmeticError::Overflow)?;

            let unsealed_cid =
                T::Market::verify_deals_for_activation(&owner, SectorDeal::from(&sector))?;

            let deposit = T::PreCommitDeposit::get();
            T::Currency::reserve(&owner, deposit).map_err(|_| Error::<T>::NotEnoughFunds)?;

            StorageProviders::<T>::try_mutate(&owner, |maybe_sp| -> DispatchResult {
                let sp = maybe_sp
                    .as_mut()
                    .ok_or(Error::<T>::StorageProviderNotFound)?;
                sp.add_pre_commit_deposit(deposit)?;
                sp.put_pre_committed_sector(SectorPreCommitOnChainInfo::new(
                    sector.clone(),
                    unsealed_cid,
                    deposit,
                    current_block,
                ))
                .map_err(Error::<T>::from)?;
                Ok(())
            })?;

            PreCommitExpirations::<T>::insert(
                expiration,
                (owner.clone(), sector.sector_number),
                (),
            );

            log::debug!(
                target: LOG_TARGET,
                "pre-committed sector {} of {:?}, expires at {:?}",
                sector.sector_number, owner, expiration
            );
            Self::deposit_event(Event::SectorPreCommitted { owner, sector });
            Ok(())
        }

        /// Verifies the Proof-of-Replication of a pre-committed sector and activates its deals.
        pub fn prove_commit_sector(
            origin: OriginFor<T>,
            sector: ProveCommitSector,
        ) -> DispatchResult {
            let owner = ensure_signed(origin)?;
            let sp = StorageProviders::<T>::try_get(&owner)
                .map_err(|_| Error::<T>::StorageProviderNotFound)?;
            let sector_number = sector.sector_number;

            let precommit = sp
                .get_pre_committed_sector(sector_number)
                .map_err(|_| Error::<T>::SectorNotPreCommitted)?;

            let current_block = <frame_system::Pallet<T>>::block_number();
            let prove_commit_due = precommit
                .pre_commit_block_number
                .checked_add(&T::MaxProveCommitDuration::get())
                .ok_or(ArithmeticError::Overflow)?;
            ensure!(
                current_block <= prove_commit_due,
                Error::<T>::ProveCommitAfterDeadline
            );
            let seed_block = precommit
                .pre_commit_block_number
                .checked_add(&T::PreCommitChallengeDelay::get())
                .ok_or(ArithmeticError::Overflow)?;
            ensure!(current_block > seed_block, Error::<T>::ProveCommitTooEarly);

            // Same deals, in any order, each of them once.
            let mut declared = precommit.info.deal_ids.to_vec();
            declared.sort_unstable();
            let mut proven = sector.deal_ids.to_vec();
            proven.sort_unstable();
            ensure!(declared == proven, Error::<T>::DealsMismatch);

            let comm_r =
                Commitment::from_bytes(&precommit.info.sealed_cid, CommitmentKind::Replica)
                    .map_err(|_| Error::<T>::InvalidCid)?;
            let entropy = owner.encode();
            let ticket = Self::draw(
                precommit.info.seal_block,
                DomainSeparationTag::SealRandomness,
                &entropy,
            )?;
            let seed = Self::draw(
                seed_block,
                DomainSeparationTag::InteractiveSealChallengeSeed,
                &entropy,
            )?;

            let accepted = T::ProofVerification::verify_porep(
                derive_prover_id(owner.clone()),
                precommit.info.seal_proof,
                precommit.unsealed_cid,
                comm_r.raw(),
                ticket,
                &sector.proof,
                seed,
                sector_number,
            )?;
            if !accepted {
                log::warn!(
                    target: LOG_TARGET,
                    "rejected proof for sector {} of {:?}",
                    sector_number, owner
                );
                return Err(Error::<T>::InvalidProof.into());
            }

            let deal_ids = precommit.info.deal_ids.clone();
            let sector_deal = SectorDeal::from(&precommit.info);
            let deposit = precommit.pre_commit_deposit;
            let expiration = prove_commit_due;

            StorageProviders::<T>::try_mutate(&owner, |maybe_sp| -> DispatchResult {
                let sp = maybe_sp
                    .as_mut()
                    .ok_or(Error::<T>::StorageProviderNotFound)?;
                let precommit = sp
                    .remove_pre_committed_sector(sector_number)
                    .map_err(Error::<T>::from)?;
                sp.release_pre_commit_deposit(deposit)?;
                sp.activate_sector(
                    sector_number,
                    SectorOnChainInfo::from_pre_commit(precommit, current_block),
                )
                .map_err(Error::<T>::from)?;
                Ok(())
            })?;

            T::Market::activate_deals(&owner, sector_deal)?;
            T::Currency::unreserve(&owner, deposit);
            PreCommitExpirations::<T>::remove(expiration, (owner.clone(), sector_number));

            Self::deposit_event(Event::SectorProven {
                owner,
                sector_number,
                deal_ids,
            });
            Ok(())
        }
    }

    #[pallet::hooks]
    impl<T: Config> Hooks<BlockNumberFor<T>> for Pallet<T> {
        fn on_finalize(current_block: BlockNumberFor<T>) {
            Self::expire_pre_commits(current_block);
        }
    }

    impl<T: Config> Pallet<T> {
        /// State of a sector of the given storage provider.
        /// Sectors of unknown storage providers are [`SectorState::Uncommitted`].
        pub fn sector_state(owner: &T::AccountId, sector_number: SectorNumber) -> SectorState {
            StorageProviders::<T>::get(owner)
                .map(|sp| sp.sector_state(sector_number))
                .unwrap_or(SectorState::Uncommitted)
        }

        /// Worker account of the given storage provider.
        pub fn worker(owner: &T::AccountId) -> Option<T::AccountId> {
            StorageProviders::<T>::get(owner).map(|sp| sp.info.worker)
        }

        fn draw(
            block_number: BlockNumberFor<T>,
            tag: DomainSeparationTag,
            entropy: &[u8],
        ) -> Result<[u8; 32], DispatchError> {
            let randomness = T::Randomness::get_randomness(block_number)?;
            let block_number: u64 = block_number
                .try_into()
                .map_err(|_| Error::<T>::ConversionError)?;
            Ok(draw_randomness(&randomness, tag, block_number, entropy))
        }

        /// Slashes every pre-commit scheduled to expire at `current_block`.
        fn expire_pre_commits(current_block: BlockNumberFor<T>) {
            let expired = PreCommitExpirations::<T>::drain_prefix(current_block);
            for ((owner, sector_number), ()) in expired {
                let result = StorageProviders::<T>::try_mutate(
                    &owner,
                    |maybe_sp| -> Result<Option<BalanceOf<T>>, DispatchError> {
                        let Some(sp) = maybe_sp.as_mut() else {
                            return Err(Error::<T>::StorageProviderNotFound.into());
                        };
                        if sp.sector_state(sector_number) != SectorState::PreCommitted {
                            return Ok(None);
                        }
                        let precommit = sp
                            .remove_pre_committed_sector(sector_number)
                            .map_err(Error::<T>::from)?;
                        sp.release_pre_commit_deposit(precommit.pre_commit_deposit)?;
                        Ok(Some(precommit.pre_commit_deposit))
                    },
                );

                match result {
                    Ok(Some(deposit)) => {
                        let (_imbalance, unslashed) = T::Currency::slash_reserved(&owner, deposit);
                        if !unslashed.is_zero() {
                            log::warn!(
                                target: LOG_TARGET,
                                "could not slash {:?} of the deposit of {:?}",
                                unslashed, owner
                            );
                        }
                        log::info!(
                            target: LOG_TARGET,
                            "pre-commit of sector {} of {:?} expired",
                            sector_number, owner
                        );
                        Self::deposit_event(Event::PreCommitExpired {
                            owner,
                            sector_number,
                        });
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::error!(
                            target: LOG_TARGET,
                            "failed to expire sector {} of {:?}: {:?}",
                            sector_number, owner, err
                        );
                    }
                }
            }
        }
    }
}
