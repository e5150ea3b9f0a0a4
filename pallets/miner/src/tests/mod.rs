use core::cell::{Cell, RefCell};

use codec::Encode;
use frame_support::{
    assert_ok, derive_impl, pallet_prelude::ConstU32, parameter_types, sp_runtime::BoundedVec,
    traits::Hooks, PalletId,
};
use frame_system::pallet_prelude::BlockNumberFor;
use pallet_market::{BalanceOf, ClientDealProposal, DealProposal};
use primitives_commitment::{Commitment, CommitmentKind};
use primitives_proofs::{
    DealId, ProofVerification, ProverId, Randomness, RawCommitment, RegisteredSealProof,
    SectorNumber, Ticket, MAX_DEALS_PER_SECTOR,
};
use sp_core::{bounded_vec, Pair};
use sp_runtime::{
    traits::{IdentifyAccount, IdentityLookup, Verify},
    BuildStorage, DispatchError, MultiSignature, MultiSigner,
};

use crate::{self as pallet_miner, sector::SectorPreCommitInfo, CidBytes};


type Block = frame_system::mocking::MockBlock<Test>;
type BlockNumber = u64;

frame_support::construct_runtime!(
    pub enum Test {
        System: frame_system,
        Balances: pallet_balances,
        Miner: pallet_miner::pallet,
        Market: pallet_market,
    }
);

pub type Signature = MultiSignature;
pub type AccountPublic = <Signature as Verify>::Signer;
pub type AccountId = <AccountPublic as IdentifyAccount>::AccountId;

#[derive_impl(frame_system::config_preludes::TestDefaultConfig)]
impl frame_system::Config for Test {
    type Block = Block;
    type AccountData = pallet_balances::AccountData<u64>;
    type AccountId = AccountId;
    type Lookup = IdentityLookup<Self::AccountId>;
}

#[derive_impl(pallet_balances::config_preludes::TestDefaultConfig)]
impl pallet_balances::Config for Test {
    type AccountStore = System;
}

parameter_types! {
    pub const MarketPalletId: PalletId = PalletId(*b"spMarket");
}

impl pallet_market::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type PalletId = MarketPalletId;
    type Currency = Balances;
    type OffchainSignature = Signature;
    type OffchainPublic = AccountPublic;
    type MaxDeals = ConstU32<32>;
}

parameter_types! {
    pub const PreCommitDeposit: u64 = 10;
    pub const PreCommitChallengeDelay: BlockNumber = 2;
    pub const MaxProveCommitDuration: BlockNumber = 10;
}

/// Inputs the proof verification has been called with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoRepInputs {
    pub prover_id: ProverId,
    pub comm_d: RawCommitment,
    pub comm_r: RawCommitment,
    pub ticket: Ticket,
    pub seed: Ticket,
    pub sector: SectorNumber,
}

thread_local! {
    static PROOFS_VALID: Cell<bool> = Cell::new(true);
    static LAST_POREP: RefCell<Option<PoRepInputs>> = RefCell::new(None);
}

/// Makes the dummy verifier reject (or accept again) every proof.
pub fn set_proofs_valid(valid: bool) {
    PROOFS_VALID.with(|v| v.set(valid));
}

pub fn last_porep() -> Option<PoRepInputs> {
    LAST_POREP.with(|p| p.borrow().clone())
}

/// Proof verification which records the inputs and answers as configured with [`set_proofs_valid`].
pub struct DummyProofsVerification;

impl ProofVerification for DummyProofsVerification {
    fn verify_porep(
        prover_id: ProverId,
        _seal_proof: RegisteredSealProof,
        comm_d: RawCommitment,
        comm_r: RawCommitment,
        ticket: Ticket,
        proof: &[u8],
        seed: Ticket,
        sector: SectorNumber,
    ) -> Result<bool, DispatchError> {
        if proof.is_empty() {
            return Err(DispatchError::Other("empty proof"));
        }
        LAST_POREP.with(|p| {
            *p.borrow_mut() = Some(PoRepInputs {
                prover_id,
                comm_d,
                comm_r,
                ticket,
                seed,
                sector,
            })
        });
        Ok(PROOFS_VALID.with(|v| v.get()))
    }
}

/// Randomness of a block is the block number, repeated.
pub struct DummyRandomness;

impl Randomness<BlockNumber> for DummyRandomness {
    fn get_randomness(block_number: BlockNumber) -> Result<[u8; 32], DispatchError> {
        Ok([block_number as u8; 32])
    }
}

impl pallet_miner::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type PeerId = BoundedVec<u8, ConstU32<256>>; // Arbitrary length
    type Currency = Balances;
    type Market = Market;
    type ProofVerification = DummyProofsVerification;
    type Randomness = DummyRandomness;
    type PreCommitDeposit = PreCommitDeposit;
    type PreCommitChallengeDelay = PreCommitChallengeDelay;
    type MaxProveCommitDuration = MaxProveCommitDuration;
}

type AccountIdOf<Test> = <Test as frame_system::Config>::AccountId;

type DealProposalOf<Test> =
    DealProposal<<Test as frame_system::Config>::AccountId, BalanceOf<Test>, BlockNumberFor<Test>>;

type ClientDealProposalOf<Test> = ClientDealProposal<
    <Test as frame_system::Config>::AccountId,
    BalanceOf<Test>,
    BlockNumberFor<Test>,
    MultiSignature,
>;

const ALICE: &'static str = "//Alice";
const BOB: &'static str = "//Bob";
const CHARLIE: &'static str = "//Charlie";

/// Initial funds of all accounts.
const INITIAL_FUNDS: u64 = 1000;

// Build genesis storage according to the mock runtime.
fn new_test_ext() -> sp_io::TestExternalities {
    let _ = env_logger::try_init();
    set_proofs_valid(true);
    LAST_POREP.with(|p| *p.borrow_mut() = None);

    let mut t = frame_system::GenesisConfig::<Test>::default()
        .build_storage()
        .unwrap()
        .into();

    pallet_balances::GenesisConfig::<Test> {
        balances: vec![
            (account(ALICE), INITIAL_FUNDS),
            (account(BOB), INITIAL_FUNDS),
            (account(CHARLIE), INITIAL_FUNDS),
        ],
    }
    .assimilate_storage(&mut t)
    .unwrap();

    let mut ext = sp_io::TestExternalities::new(t);
    ext.execute_with(|| System::set_block_number(1));
    ext
}

fn events() -> Vec<RuntimeEvent> {
    let evt = System::events()
        .into_iter()
        .map(|evt| evt.event)
        .collect::<Vec<_>>();
    System::reset_events();
    evt
}

fn sign(pair: &sp_core::sr25519::Pair, bytes: &[u8]) -> MultiSignature {
    MultiSignature::Sr25519(pair.sign(bytes))
}

fn sign_proposal(client: &str, proposal: DealProposalOf<Test>) -> ClientDealProposalOf<Test> {
    let pair = key_pair(client);
    let client_signature = sign(&pair, &Encode::encode(&proposal));
    ClientDealProposal {
        proposal,
        client_signature,
    }
}

fn key_pair(name: &str) -> sp_core::sr25519::Pair {
    sp_core::sr25519::Pair::from_string(name, None).unwrap()
}

fn account(name: &str) -> AccountIdOf<Test> {
    let user_pair = key_pair(name);
    let signer = MultiSigner::Sr25519(user_pair.public());
    signer.into_account()
}

/// Replica commitment used as the sealed CID of the test sectors.
fn sealed_cid() -> CidBytes {
    Commitment::new([9; 32], CommitmentKind::Replica)
        .cid()
        .to_bytes()
        .try_into()
        .unwrap()
}

/// Run until a particular block.
///
/// Stolen't from: <https://github.com/paritytech/polkadot-sdk/blob/7df94a469e02e1d553bd4050b0e91870d6a4c31b/substrate/frame/lottery/src/mock.rs#L87-L98>
fn run_to_block(n: u64) {
    while System::block_number() < n {
        if System::block_number() > 1 {
            Miner::on_finalize(System::block_number());
            System::on_finalize(System::block_number());
        }

        System::set_block_number(System::block_number() + 1);
        System::on_initialize(System::block_number());
        Miner::on_initialize(System::block_number());
    }
}

/// Register account as a provider, the owner is its own worker.
fn register_storage_provider(account: AccountIdOf<Test>) {
    let peer_id = "storage_provider_1".as_bytes().to_vec();
    let peer_id = BoundedVec::try_from(peer_id).unwrap();

    assert_ok!(Miner::register_storage_provider(
        RuntimeOrigin::signed(account.clone()),
        peer_id,
        RegisteredSealProof::StackedDRG2KiBV1P1,
        account,
    ));

    // Remove any events that were triggered during registration.
    System::reset_events();
}

/// Publish deals to Market Pallet for the sectors to be properly pre-committed and proven.
///
/// Deal 1: Client = Alice, Provider = provided, piece filled with 1
/// Deal 2: Client = Bob, Provider = provided, piece filled with 2
/// Both pieces are half of a 2KiB sector.
fn publish_deals(storage_provider: &str) {
    assert_ok!(Market::add_balance(
        RuntimeOrigin::signed(account(ALICE)),
        60
    ));
    assert_ok!(Market::add_balance(RuntimeOrigin::signed(account(BOB)), 60));
    assert_ok!(Market::add_balance(
        RuntimeOrigin::signed(account(storage_provider)),
        70
    ));

    assert_ok!(Market::publish_storage_deals(
        RuntimeOrigin::signed(account(storage_provider)),
        bounded_vec![
            DealProposalBuilder::default()
                .piece(1)
                .client(ALICE)
                .provider(storage_provider)
                .signed(ALICE),
            DealProposalBuilder::default()
                .piece(2)
                .client(BOB)
                .provider(storage_provider)
                .signed(BOB)
        ],
    ));
    System::reset_events();
}

struct SectorPreCommitInfoBuilder {
    seal_proof: RegisteredSealProof,
    sector_number: SectorNumber,
    sealed_cid: CidBytes,
    seal_block: BlockNumber,
    deal_ids: BoundedVec<DealId, ConstU32<MAX_DEALS_PER_SECTOR>>,
}

impl Default for SectorPreCommitInfoBuilder {
    fn default() -> Self {
        Self {
            seal_proof: RegisteredSealProof::StackedDRG2KiBV1P1,
            sector_number: 1,
            sealed_cid: sealed_cid(),
            seal_block: 1,
            deal_ids: bounded_vec![1, 2],
        }
    }
}

impl SectorPreCommitInfoBuilder {
    pub fn sector_number(mut self, sector_number: SectorNumber) -> Self {
        self.sector_number = sector_number;
        self
    }

    pub fn deals(mut self, deal_ids: Vec<DealId>) -> Self {
        self.deal_ids = BoundedVec::try_from(deal_ids).unwrap();
        self
    }

    pub fn sealed_cid(mut self, sealed_cid: CidBytes) -> Self {
        self.sealed_cid = sealed_cid;
        self
    }

    pub fn seal_block(mut self, seal_block: BlockNumber) -> Self {
        self.seal_block = seal_block;
        self
    }

    pub fn build(self) -> SectorPreCommitInfo<BlockNumber> {
        SectorPreCommitInfo {
            seal_proof: self.seal_proof,
            sector_number: self.sector_number,
            sealed_cid: self.sealed_cid,
            seal_block: self.seal_block,
            deal_ids: self.deal_ids,
        }
    }
}

/// Builder to simplify writing complex tests of [`DealProposal`].
/// Exclusively uses [`Test`] for simplification purposes.
struct DealProposalBuilder {
    piece: u8,
    piece_size: u64,
    client: AccountIdOf<Test>,
    provider: AccountIdOf<Test>,
    proposal_expiration: u64,
    duration: u64,
    storage_price_per_block: u64,
    provider_collateral: u64,
}

impl Default for DealProposalBuilder {
    fn default() -> Self {
        Self {
            piece: 1,
            piece_size: 1024,
            client: account(BOB),
            provider: account(CHARLIE),
            proposal_expiration: 100,
            duration: 50,
            storage_price_per_block: 1,
            provider_collateral: 25,
        }
    }
}

impl DealProposalBuilder {
    pub fn piece(mut self, piece: u8) -> Self {
        self.piece = piece;
        self
    }

    pub fn client(mut self, client: &str) -> Self {
        self.client = account(client);
        self
    }

    pub fn provider(mut self, provider: &str) -> Self {
        self.provider = account(provider);
        self
    }

    pub fn unsigned(self) -> DealProposalOf<Test> {
        DealProposalOf::<Test> {
            piece_cid: Commitment::new([self.piece; 32], CommitmentKind::Piece)
                .cid()
                .to_bytes()
                .try_into()
                .unwrap(),
            piece_size: self.piece_size,
            client: self.client,
            provider: self.provider,
            proposal_expiration: self.proposal_expiration,
            duration: self.duration,
            storage_price_per_block: self.storage_price_per_block,
            provider_collateral: self.provider_collateral,
        }
    }

    pub fn signed(self, by: &str) -> ClientDealProposalOf<Test> {
        sign_proposal(by, self.unsigned())
    }
}
