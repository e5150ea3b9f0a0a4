//! # Market Pallet
//!
//! Ledger of the storage market. Participants deposit funds into the market account,
//! providers publish the deals their clients signed, which locks the client fee and the
//! provider collateral, and the miner pallet activates the deals once their sector is proven
//! (see the [`Market`] trait implementation).

#![cfg_attr(not(feature = "std"), no_std)]

pub use pallet::*;

#[cfg(test)]
mod mock;


#[frame_support::pallet(dev_mode)]
pub mod pallet {
    pub const LOG_TARGET: &'static str = "runtime::market";

    use codec::{Decode, Encode};
    use frame_support::{
        dispatch::DispatchResult,
        ensure,
        pallet_prelude::*,
        sp_runtime::{
            traits::{
                AccountIdConversion, CheckedAdd, CheckedSub, Hash, IdentifyAccount, Verify, Zero,
            },
            ArithmeticError, BoundedBTreeMap, BoundedBTreeSet, RuntimeDebug,
        },
        traits::{
            Currency,
            ExistenceRequirement::{AllowDeath, KeepAlive},
            ReservableCurrency,
        },
        PalletId,
    };
    use frame_system::{pallet_prelude::*, Config as SystemConfig, Pallet as System};
    use primitives_commitment::{
        commd::compute_unsealed_sector_commitment,
        piece::{PaddedPieceSize, PieceInfo},
        zero_data_commitment, Commitment, CommitmentKind,
    };
    use primitives_proofs::{
        DealId, Market, RawCommitment, SectorDeal, SectorNumber, MAX_DEALS_PER_SECTOR,
    };
    use scale_info::TypeInfo;
    use sp_arithmetic::traits::BaseArithmetic;
    use sp_std::{collections::btree_set::BTreeSet, vec::Vec};

    pub type BalanceOf<T> =
        <<T as Config>::Currency as Currency<<T as SystemConfig>::AccountId>>::Balance;

    #[pallet::config]
    pub trait Config: frame_system::Config {
        type RuntimeEvent: From<Event<Self>> + IsType<<Self as frame_system::Config>::RuntimeEvent>;

        type Currency: ReservableCurrency<Self::AccountId>;

        /// Derives the account holding every deposit made to the market.
        #[pallet::constant]
        type PalletId: Get<PalletId>;

        /// Signature clients put on their proposals.
        type OffchainSignature: Verify<Signer = Self::OffchainPublic> + Parameter;

        /// Key behind an [`Config::OffchainSignature`], maps to the client's account.
        type OffchainPublic: IdentifyAccount<AccountId = Self::AccountId>;

        /// Upper bound of a `publish_storage_deals` batch.
        #[pallet::constant]
        type MaxDeals: Get<u32>;
    }

    /// Funds a participant deposited into the market account.
    ///
    /// Deposits are bookkept here rather than reserved on the participant's own account.
    #[derive(
        Clone, Eq, PartialEq, Encode, Decode, RuntimeDebug, Default, TypeInfo, MaxEncodedLen,
    )]
    pub struct BalanceEntry<Balance> {
        /// Withdrawable, or lockable by the next published deal.
        pub free: Balance,
        /// Fees and collateral of published deals.
        pub locked: Balance,
    }

    /// Identifies the extrinsic which published a deal, so the parties can look it up.
    #[derive(
        Clone, Copy, Eq, PartialEq, Encode, Decode, RuntimeDebug, TypeInfo, MaxEncodedLen,
    )]
    pub struct PublishMessageRef<BlockNumber> {
        pub block_number: BlockNumber,
        pub extrinsic_index: u32,
    }

    /// Where and since when an activated deal is stored.
    #[derive(Clone, Eq, PartialEq, Encode, Decode, RuntimeDebug, TypeInfo, MaxEncodedLen)]
    pub struct ActiveDealState<BlockNumber> {
        pub sector_number: SectorNumber,
        /// Block in which the sector got proven.
        pub sector_start_block: BlockNumber,
    }

    /// Terms a client and a provider agreed on, exactly as the client signed them.
    ///
    /// Generic over its parts instead of `T: Config`, deriving `TypeInfo` and `RuntimeDebug`
    /// would otherwise require them from `T`.
    #[derive(Clone, Eq, PartialEq, Encode, Decode, RuntimeDebug, TypeInfo, MaxEncodedLen)]
    pub struct DealProposal<Address, Balance, BlockNumber> {
        /// CID bytes of the piece commitment.
        pub piece_cid: BoundedVec<u8, ConstU32<128>>,
        /// Padded piece size, in bytes.
        pub piece_size: u64,
        pub client: Address,
        pub provider: Address,
        /// First block at which the proposal can no longer be published.
        pub proposal_expiration: BlockNumber,
        /// Storage duration, in blocks.
        pub duration: BlockNumber,
        pub storage_price_per_block: Balance,
        /// Locked from the provider's market funds on publication.
        pub provider_collateral: Balance,
    }

    impl<Address, Balance: BaseArithmetic + Copy, BlockNumber: BaseArithmetic + Copy>
        DealProposal<Address, Balance, BlockNumber>
    {
        /// `storage_price_per_block * duration`, `None` when it does not fit a `u128`.
        pub fn total_storage_fee(&self) -> Option<u128> {
            let price: u128 = self.storage_price_per_block.try_into().ok()?;
            let duration: u128 = self.duration.try_into().ok()?;
            price.checked_mul(duration)
        }

        fn piece_info(&self) -> Result<PieceInfo, ProposalError> {
            let commitment = Commitment::from_bytes(&self.piece_cid, CommitmentKind::Piece)
                .map_err(|_| ProposalError::InvalidPieceCid)?;
            let size =
                PaddedPieceSize::new(self.piece_size).map_err(|_| ProposalError::InvalidPieceSize)?;
            Ok(PieceInfo { commitment, size })
        }
    }

    pub type DealProposalOf<T> =
        DealProposal<<T as frame_system::Config>::AccountId, BalanceOf<T>, BlockNumberFor<T>>;

    /// A proposal along with the client's signature over its SCALE encoding.
    /// The provider submits it, the signature proves the client agreed to pay.
    #[derive(Clone, Eq, PartialEq, Encode, Decode, RuntimeDebug, TypeInfo, MaxEncodedLen)]
    pub struct ClientDealProposal<Address, Currency, BlockNumber, OffchainSignature> {
        pub proposal: DealProposal<Address, Currency, BlockNumber>,
        pub client_signature: OffchainSignature,
    }

    pub type ClientDealProposalOf<T> = ClientDealProposal<
        <T as frame_system::Config>::AccountId,
        BalanceOf<T>,
        BlockNumberFor<T>,
        <T as Config>::OffchainSignature,
    >;

    /// Published deal, as stored by the Market. Never modified after publication.
    #[derive(Clone, Eq, PartialEq, Encode, Decode, RuntimeDebug, TypeInfo, MaxEncodedLen)]
    pub struct PublishedDeal<Address, Balance, BlockNumber> {
        pub proposal: DealProposal<Address, Balance, BlockNumber>,
        pub publish_message: PublishMessageRef<BlockNumber>,
    }

    pub type PublishedDealOf<T> =
        PublishedDeal<<T as frame_system::Config>::AccountId, BalanceOf<T>, BlockNumberFor<T>>;

    #[pallet::pallet]
    pub struct Pallet<T>(_);

    /// Market funds of every participant.
    ///
    /// The native balance of [`Pallet::account_id`] equals the sum of `free + locked` over all entries.
    #[pallet::storage]
    pub type BalanceTable<T: Config> =
        StorageMap<_, _, T::AccountId, BalanceEntry<BalanceOf<T>>, ValueQuery>;

    /// Last assigned [`DealId`], ids start at 1 and never wrap.
    #[pallet::storage]
    pub type NextDealId<T: Config> = StorageValue<_, DealId, ValueQuery>;

    #[pallet::storage]
    pub type Proposals<T: Config> = StorageMap<_, _, DealId, PublishedDealOf<T>>;

    /// Deals whose sector has been proven.
    #[pallet::storage]
    pub type ActiveDeals<T: Config> =
        StorageMap<_, _, DealId, ActiveDealState<BlockNumberFor<T>>>;

    /// Published deals waiting for activation, keyed by [`Pallet::hash_proposal`].
    /// Identical proposals would get different ids, the hash is what deduplicates them.
    #[pallet::storage]
    pub type PendingProposals<T: Config> = StorageMap<_, _, T::Hash, DealId>;

    #[pallet::event]
    #[pallet::generate_deposit(pub(super) fn deposit_event)]
    pub enum Event<T: Config> {
        BalanceAdded {
            who: T::AccountId,
            amount: BalanceOf<T>,
        },
        BalanceWithdrawn {
            who: T::AccountId,
            amount: BalanceOf<T>,
        },
        DealPublished {
            deal_id: DealId,
            client: T::AccountId,
            provider: T::AccountId,
        },
        /// A batch of deals has been published, the message reference is shared by all of them.
        DealsPublished {
            deal_ids: BoundedVec<DealId, T::MaxDeals>,
            publish_message: PublishMessageRef<BlockNumberFor<T>>,
        },
        /// The deal's sector has been proven.
        DealActivated {
            deal_id: DealId,
            client: T::AccountId,
            provider: T::AccountId,
            sector_number: SectorNumber,
        },
    }

    #[pallet::error]
    pub enum Error<T> {
        /// The free part of the participant's market funds is too small.
        InsufficientFreeFunds,
        NoProposalsToBePublished,
        /// Only the provider of every deal in the batch can publish it.
        ProposalsNotPublishedByStorageProvider,
        WrongClientSignatureOnProposal,
        /// Deal's piece_cid is not a valid piece commitment.
        InvalidPieceCid,
        /// Deal's piece_size is not a valid padded piece size.
        InvalidPieceSize,
        /// Deal's duration must be at least one block.
        DealDurationZero,
        /// Deal was published at or after its `proposal_expiration`.
        ProposalExpired,
        /// The same deal is already pending or appears twice in the batch.
        DuplicateProposal,
        /// Client does not have enough free balance to pay for all of its deals in the batch.
        InsufficientClientFunds,
        /// Provider does not have enough free balance to cover collateral of all of the deals in the batch.
        InsufficientProviderFunds,
        /// A sector lists the same deal more than once.
        DuplicateDeal,
        /// Internal bookkeeping went out of its bounds.
        DealPreconditionFailed,
        DealNotFound,
        /// The deal cannot go into the sector, the reason is logged.
        DealActivationError,
        /// The pieces of the deals do not fit in the sector.
        DealsTooLargeToFitIntoSector,
        /// Piece commitments could not be combined into the sector data commitment.
        CommD,
    }

    /// Why a single proposal of a batch got rejected.
    #[derive(RuntimeDebug)]
    pub enum ProposalError {
        WrongClientSignatureOnProposal,
        /// The caller is not the deal's provider.
        DifferentProvider,
        DealDurationZero,
        ProposalExpired,
        InvalidPieceCid,
        InvalidPieceSize,
    }

    impl<T> From<ProposalError> for Error<T> {
        fn from(value: ProposalError) -> Self {
            match value {
                ProposalError::WrongClientSignatureOnProposal => {
                    Error::<T>::WrongClientSignatureOnProposal
                }
                ProposalError::DifferentProvider => {
                    Error::<T>::ProposalsNotPublishedByStorageProvider
                }
                ProposalError::DealDurationZero => Error::<T>::DealDurationZero,
                ProposalError::ProposalExpired => Error::<T>::ProposalExpired,
                ProposalError::InvalidPieceCid => Error::<T>::InvalidPieceCid,
                ProposalError::InvalidPieceSize => Error::<T>::InvalidPieceSize,
            }
        }
    }

    /// Why a deal cannot be put in a sector.
    #[derive(RuntimeDebug)]
    pub enum DealActivationError {
        /// The sector belongs to someone else than the deal's provider.
        InvalidProvider,
        AlreadyActive,
        /// Published once but no longer pending, or never published under this id.
        DealNotPending,
    }

    #[pallet::call]
    impl<T: Config> Pallet<T> {
        /// Deposits `amount` into the market as free funds of the caller.
        pub fn add_balance(origin: OriginFor<T>, amount: BalanceOf<T>) -> DispatchResult {
            let who = ensure_signed(origin)?;

            let mut entry = BalanceTable::<T>::get(&who);
            entry.free = entry
                .free
                .checked_add(&amount)
                .ok_or(ArithmeticError::Overflow)?;
            T::Currency::transfer(&who, &Self::account_id(), amount, KeepAlive)?;
            BalanceTable::<T>::insert(&who, entry);

            Self::deposit_event(Event::<T>::BalanceAdded { who, amount });
            Ok(())
        }

        /// Pays `amount` of the caller's free market funds back to them.
        pub fn withdraw_balance(origin: OriginFor<T>, amount: BalanceOf<T>) -> DispatchResult {
            let who = ensure_signed(origin)?;

            let mut entry = BalanceTable::<T>::get(&who);
            entry.free = entry
                .free
                .checked_sub(&amount)
                .ok_or(Error::<T>::InsufficientFreeFunds)?;
            // An empty market account gets reaped.
            T::Currency::transfer(&Self::account_id(), &who, amount, AllowDeath)?;
            BalanceTable::<T>::insert(&who, entry);

            Self::deposit_event(Event::<T>::BalanceWithdrawn { who, amount });
            Ok(())
        }

        /// Publishes a batch of client-signed deals of the calling provider.
        ///
        /// Either every deal is published, with fees and collateral locked, or none is.
        /// Emits a [`Event::DealPublished`] per deal, then one [`Event::DealsPublished`].
        pub fn publish_storage_deals(
            origin: OriginFor<T>,
            deals: BoundedVec<ClientDealProposalOf<T>, T::MaxDeals>,
        ) -> DispatchResult {
            let provider = ensure_signed(origin)?;
            let (client_lockups, provider_lockup) = Self::validate_deals(&provider, &deals)?;

            for (client, client_lockup) in client_lockups {
                Self::lock_funds(&client, client_lockup)?;
            }
            Self::lock_funds(&provider, provider_lockup)?;

            let publish_message = PublishMessageRef {
                block_number: System::<T>::block_number(),
                extrinsic_index: System::<T>::extrinsic_index().unwrap_or_default(),
            };

            let mut deal_ids = BoundedVec::<DealId, T::MaxDeals>::new();
            for deal in deals {
                let deal_id = Self::generate_deal_id()?;
                PendingProposals::<T>::insert(Self::hash_proposal(&deal.proposal), deal_id);

                Self::deposit_event(Event::<T>::DealPublished {
                    deal_id,
                    client: deal.proposal.client.clone(),
                    provider: provider.clone(),
                });
                Proposals::<T>::insert(
                    deal_id,
                    PublishedDeal {
                        proposal: deal.proposal,
                        publish_message,
                    },
                );

                // Same bound as `deals`.
                deal_ids.try_push(deal_id).map_err(|_| {
                    log::error!(target: LOG_TARGET, "published deal ids overflowed at {}", deal_id);
                    Error::<T>::DealPreconditionFailed
                })?;
            }

            Self::deposit_event(Event::<T>::DealsPublished {
                deal_ids,
                publish_message,
            });

            Ok(())
        }
    }

    impl<T: Config> Pallet<T> {
        /// Account holding the deposits of every participant, derived from [`Config::PalletId`].
        pub fn account_id() -> T::AccountId {
            T::PalletId::get().into_account_truncating()
        }

        /// Current balance of a Market Participant.
        pub fn balance(who: &T::AccountId) -> BalanceEntry<BalanceOf<T>> {
            BalanceTable::<T>::get(who)
        }

        /// Checks whether `who` has at least `amount` of free balance.
        /// It does not lock anything, funds are locked when deals get published.
        pub fn ensure_available(who: &T::AccountId, amount: BalanceOf<T>) -> DispatchResult {
            let balance = BalanceTable::<T>::get(who);
            ensure!(balance.free >= amount, {
                log::error!(target: LOG_TARGET, "{:?} has not enough free balance {:?} < {:?}", who, balance.free, amount);
                Error::<T>::InsufficientFreeFunds
            });
            Ok(())
        }

        /// Checks `signature` over `data`, either raw or wrapped in `<Bytes>..</Bytes>`
        /// the way browser wallets sign.
        pub fn validate_signature(
            data: &[u8],
            signature: &T::OffchainSignature,
            signer: &T::AccountId,
        ) -> Result<(), ProposalError> {
            let wrapped = || [&b"<Bytes>"[..], data, &b"</Bytes>"[..]].concat();
            let valid = signature.verify(data, signer) || signature.verify(&wrapped()[..], signer);
            ensure!(valid, ProposalError::WrongClientSignatureOnProposal);
            Ok(())
        }

        /// Moves `amount` from the free to the locked funds of `who`.
        fn lock_funds(who: &T::AccountId, amount: BalanceOf<T>) -> DispatchResult {
            BalanceTable::<T>::try_mutate(who, |balance| -> DispatchResult {
                balance.free = balance
                    .free
                    .checked_sub(&amount)
                    .ok_or(ArithmeticError::Underflow)?;
                balance.locked = balance
                    .locked
                    .checked_add(&amount)
                    .ok_or(ArithmeticError::Overflow)?;
                Ok(())
            })
        }

        /// Data commitment of a sector holding the given pieces, in order.
        fn compute_commd<'a>(
            proposals: impl IntoIterator<Item = &'a DealProposalOf<T>>,
            sector_deal: &SectorDeal,
        ) -> Result<RawCommitment, DispatchError> {
            let pieces = proposals
                .into_iter()
                .map(|proposal| proposal.piece_info())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    log::error!(target: LOG_TARGET, "invalid piece stored on-chain for sector {}: {:?}", sector_deal.sector_number, e);
                    Error::<T>::DealPreconditionFailed
                })?;

            // Committed capacity.
            if pieces.is_empty() {
                return Ok(zero_data_commitment(sector_deal.sector_type).raw());
            }

            let comm_d =
                compute_unsealed_sector_commitment(sector_deal.sector_type.sector_size(), &pieces)
                    .map_err(|e| {
                        log::error!(target: LOG_TARGET, "failed to compute CommD for sector {}: {:?}", sector_deal.sector_number, e);
                        Error::<T>::CommD
                    })?;

            Ok(comm_d.raw())
        }

        /// Every deal must be pending, owned by `provider`, and all pieces must fit the sector.
        fn validate_deals_for_sector(
            deals: &[(DealId, DealProposalOf<T>)],
            provider: &T::AccountId,
            sector_deal: &SectorDeal,
        ) -> DispatchResult {
            let sector_bytes = sector_deal.sector_type.sector_size().bytes();
            let mut used: u64 = 0;
            for (deal_id, deal) in deals {
                if let Err(reason) = Self::activation_check(*deal_id, deal, provider) {
                    log::error!(target: LOG_TARGET, "deal {} cannot go into sector {}: {:?}", deal_id, sector_deal.sector_number, reason);
                    return Err(Error::<T>::DealActivationError.into());
                }
                used = used
                    .checked_add(deal.piece_size)
                    .ok_or(ArithmeticError::Overflow)?;
            }

            ensure!(used <= sector_bytes, {
                log::error!(target: LOG_TARGET, "sector {} holds {} bytes, the deals need {}", sector_deal.sector_number, sector_bytes, used);
                Error::<T>::DealsTooLargeToFitIntoSector
            });
            Ok(())
        }

        fn activation_check(
            deal_id: DealId,
            deal: &DealProposalOf<T>,
            provider: &T::AccountId,
        ) -> Result<(), DealActivationError> {
            if deal.provider != *provider {
                return Err(DealActivationError::InvalidProvider);
            }
            if ActiveDeals::<T>::contains_key(deal_id) {
                return Err(DealActivationError::AlreadyActive);
            }
            // Activation removes the pending entry, a published deal without one was never pending.
            match PendingProposals::<T>::get(Self::hash_proposal(deal)) {
                Some(pending) if pending == deal_id => Ok(()),
                _ => Err(DealActivationError::DealNotPending),
            }
        }

        /// Loads the proposals of a sector's deals, each id may appear once.
        fn proposals_for_deals(
            deal_ids: &BoundedVec<DealId, ConstU32<MAX_DEALS_PER_SECTOR>>,
        ) -> Result<Vec<(DealId, DealProposalOf<T>)>, DispatchError> {
            let mut seen = BTreeSet::new();
            deal_ids
                .iter()
                .map(|&deal_id| -> Result<_, DispatchError> {
                    ensure!(seen.insert(deal_id), {
                        log::error!(target: LOG_TARGET, "deal {} is listed twice", deal_id);
                        Error::<T>::DuplicateDeal
                    });
                    let published = Proposals::<T>::get(deal_id).ok_or_else(|| {
                        log::error!(target: LOG_TARGET, "deal {} was never published", deal_id);
                        Error::<T>::DealNotFound
                    })?;
                    Ok((deal_id, published.proposal))
                })
                .collect()
        }

        fn generate_deal_id() -> Result<DealId, DispatchError> {
            let deal_id = NextDealId::<T>::get()
                .checked_add(1)
                .ok_or(ArithmeticError::Overflow)?;
            NextDealId::<T>::set(deal_id);
            Ok(deal_id)
        }

        fn sanity_check(
            deal: &ClientDealProposalOf<T>,
            provider: &T::AccountId,
            current_block: BlockNumberFor<T>,
        ) -> Result<(), ProposalError> {
            Self::validate_signature(
                &Encode::encode(&deal.proposal),
                &deal.client_signature,
                &deal.proposal.client,
            )?;

            deal.proposal.piece_info()?;
            ensure!(
                deal.proposal.provider == *provider,
                ProposalError::DifferentProvider
            );
            ensure!(
                !deal.proposal.duration.is_zero(),
                ProposalError::DealDurationZero
            );
            ensure!(
                current_block < deal.proposal.proposal_expiration,
                ProposalError::ProposalExpired
            );
            Ok(())
        }

        /// Validates the whole batch, returning the amounts to be locked for every client
        /// and the total collateral of the provider.
        fn validate_deals(
            caller: &T::AccountId,
            deals: &BoundedVec<ClientDealProposalOf<T>, T::MaxDeals>,
        ) -> Result<
            (
                BoundedBTreeMap<T::AccountId, BalanceOf<T>, T::MaxDeals>,
                BalanceOf<T>,
            ),
            DispatchError,
        > {
            ensure!(deals.len() > 0, Error::<T>::NoProposalsToBePublished);

            let current_block = System::<T>::block_number();
            let mut total_client_lockup: BoundedBTreeMap<T::AccountId, BalanceOf<T>, T::MaxDeals> =
                BoundedBTreeMap::new();
            let mut total_provider_lockup: BalanceOf<T> = Default::default();
            let mut message_proposals: BoundedBTreeSet<T::Hash, T::MaxDeals> =
                BoundedBTreeSet::new();

            for (idx, deal) in deals.iter().enumerate() {
                Self::sanity_check(deal, caller, current_block).map_err(|e| {
                    log::error!(target: LOG_TARGET, "invalid deal: idx {}, error: {:?}", idx, e);
                    Error::<T>::from(e)
                })?;

                let hash = Self::hash_proposal(&deal.proposal);
                let duplicate_in_state = PendingProposals::<T>::contains_key(&hash);
                let duplicate_in_message = message_proposals.contains(&hash);
                ensure!(!duplicate_in_state && !duplicate_in_message, {
                    log::error!(target: LOG_TARGET, "invalid deal: cannot publish duplicate deal idx: {}", idx);
                    Error::<T>::DuplicateProposal
                });
                // Bounded by `T::MaxDeals`, like the batch.
                message_proposals
                    .try_insert(hash)
                    .map_err(|_| Error::<T>::DealPreconditionFailed)?;

                let client_lockup = total_client_lockup
                    .get(&deal.proposal.client)
                    .copied()
                    .unwrap_or_default();
                let client_fee: BalanceOf<T> = deal
                    .proposal
                    .total_storage_fee()
                    .and_then(|fee| fee.try_into().ok())
                    .ok_or(ArithmeticError::Overflow)?;
                let client_lockup = client_lockup
                    .checked_add(&client_fee)
                    .ok_or(ArithmeticError::Overflow)?;

                // A provider dealing with itself pays both sides from the same entry.
                let self_deal = deal.proposal.client == *caller;

                let client_balance = BalanceTable::<T>::get(&deal.proposal.client);
                let client_required = if self_deal {
                    client_lockup
                        .checked_add(&total_provider_lockup)
                        .ok_or(ArithmeticError::Overflow)?
                } else {
                    client_lockup
                };
                ensure!(client_required <= client_balance.free, {
                    log::error!(target: LOG_TARGET, "invalid deal: client {:?} not enough free balance {:?} < {:?} to cover deal idx: {}",
                        deal.proposal.client, client_balance.free, client_required, idx);
                    Error::<T>::InsufficientClientFunds
                });

                let provider_lockup = total_provider_lockup
                    .checked_add(&deal.proposal.provider_collateral)
                    .ok_or(ArithmeticError::Overflow)?;
                let caller_as_client = if self_deal {
                    client_lockup
                } else {
                    total_client_lockup.get(caller).copied().unwrap_or_default()
                };
                let provider_required = provider_lockup
                    .checked_add(&caller_as_client)
                    .ok_or(ArithmeticError::Overflow)?;

                let provider_balance = BalanceTable::<T>::get(caller);
                ensure!(provider_required <= provider_balance.free, {
                    log::error!(target: LOG_TARGET, "invalid deal: storage provider {:?} not enough free balance {:?} < {:?} to cover deal idx: {}",
                        caller, provider_balance.free, provider_required, idx);
                    Error::<T>::InsufficientProviderFunds
                });

                total_client_lockup
                    .try_insert(deal.proposal.client.clone(), client_lockup)
                    .map_err(|_| Error::<T>::DealPreconditionFailed)?;
                total_provider_lockup = provider_lockup;
            }

            Ok((total_client_lockup, total_provider_lockup))
        }

        /// Identity of a proposal's content, used to refuse publishing it twice.
        pub(crate) fn hash_proposal(proposal: &DealProposalOf<T>) -> T::Hash {
            T::Hashing::hash_of(proposal)
        }
    }

    impl<T: Config> Market<T::AccountId, BlockNumberFor<T>> for Pallet<T> {
        /// Checks that the deals can go into the pre-committed sector and returns its data
        /// commitment, which is the zero commitment when there are no deals.
        fn verify_deals_for_activation(
            storage_provider: &T::AccountId,
            sector_deal: SectorDeal,
        ) -> Result<RawCommitment, DispatchError> {
            let proposals = Self::proposals_for_deals(&sector_deal.deal_ids)?;
            Self::validate_deals_for_sector(&proposals, storage_provider, &sector_deal)?;

            Self::compute_commd(proposals.iter().map(|(_, deal)| deal), &sector_deal)
        }

        /// Marks the deals of a proven sector active, all of them or none.
        fn activate_deals(storage_provider: &T::AccountId, sector_deal: SectorDeal) -> DispatchResult {
            let proposals = Self::proposals_for_deals(&sector_deal.deal_ids)?;
            Self::validate_deals_for_sector(&proposals, storage_provider, &sector_deal)?;

            let curr_block = System::<T>::block_number();
            for (deal_id, proposal) in proposals {
                PendingProposals::<T>::remove(Self::hash_proposal(&proposal));
                ActiveDeals::<T>::insert(
                    deal_id,
                    ActiveDealState {
                        sector_number: sector_deal.sector_number,
                        sector_start_block: curr_block,
                    },
                );

                Self::deposit_event(Event::<T>::DealActivated {
                    deal_id,
                    client: proposal.client,
                    provider: proposal.provider,
                    sector_number: sector_deal.sector_number,
                });
            }

            Ok(())
        }
    }
}
