use codec::Encode;
use frame_support::{derive_impl, parameter_types, traits::OnInitialize, PalletId};
use frame_system::pallet_prelude::BlockNumberFor;
use primitives_commitment::{Commitment, CommitmentKind};
use sp_core::{sr25519, Pair};
use sp_runtime::{
    traits::{ConstU32, IdentifyAccount, IdentityLookup, Verify},
    BoundedVec, BuildStorage, MultiSignature, MultiSigner,
};

use crate::{self as pallet_market, BalanceOf, ClientDealProposal, DealProposal};

frame_support::construct_runtime!(
    pub enum Test
    {
        System: frame_system,
        Balances: pallet_balances,
        Market: pallet_market,
    }
);

type Signer = <MultiSignature as Verify>::Signer;
pub type AccountId = <Signer as IdentifyAccount>::AccountId;

#[derive_impl(frame_system::config_preludes::TestDefaultConfig)]
impl frame_system::Config for Test {
    type Block = frame_system::mocking::MockBlock<Test>;
    type AccountData = pallet_balances::AccountData<u64>;
    type AccountId = AccountId;
    type Lookup = IdentityLookup<AccountId>;
}

#[derive_impl(pallet_balances::config_preludes::TestDefaultConfig)]
impl pallet_balances::Config for Test {
    type AccountStore = System;
}

parameter_types! {
    pub const MarketPalletId: PalletId = PalletId(*b"mk/deals");
}

impl pallet_market::Config for Test {
    type RuntimeEvent = RuntimeEvent;
    type PalletId = MarketPalletId;
    type Currency = Balances;
    type OffchainSignature = MultiSignature;
    type OffchainPublic = Signer;
    type MaxDeals = ConstU32<32>;
}

pub(crate) type DealProposalOf<T> =
    DealProposal<<T as frame_system::Config>::AccountId, BalanceOf<T>, BlockNumberFor<T>>;

pub(crate) type ClientDealProposalOf<T> = ClientDealProposal<
    <T as frame_system::Config>::AccountId,
    BalanceOf<T>,
    BlockNumberFor<T>,
    MultiSignature,
>;

pub const ALICE: &str = "//Alice";
pub const BOB: &str = "//Bob";
pub const PROVIDER: &str = "//StorageProvider";
/// Native balance every named account starts with.
pub const INITIAL_FUNDS: u64 = 100;

fn pair_of(name: &str) -> sr25519::Pair {
    sr25519::Pair::from_string(name, None).expect("dev seeds are valid")
}

pub fn account(name: &str) -> AccountId {
    MultiSigner::from(pair_of(name).public()).into_account()
}

/// Signs arbitrary bytes with the key of `name`.
pub fn sign_bytes(name: &str, bytes: &[u8]) -> MultiSignature {
    pair_of(name).sign(bytes).into()
}

pub fn sign_proposal(client: &str, proposal: DealProposalOf<Test>) -> ClientDealProposalOf<Test> {
    ClientDealProposal {
        client_signature: sign_bytes(client, &proposal.encode()),
        proposal,
    }
}

/// CID bytes of a piece commitment filled with `byte`.
pub fn piece_cid(byte: u8) -> BoundedVec<u8, ConstU32<128>> {
    let cid = Commitment::new([byte; 32], CommitmentKind::Piece).cid();
    BoundedVec::truncate_from(cid.to_bytes())
}

pub fn new_test_ext() -> sp_io::TestExternalities {
    let _ = env_logger::try_init();

    let mut storage = frame_system::GenesisConfig::<Test>::default()
        .build_storage()
        .expect("system genesis builds");
    pallet_balances::GenesisConfig::<Test> {
        balances: [ALICE, BOB, PROVIDER]
            .into_iter()
            .map(|name| (account(name), INITIAL_FUNDS))
            .collect(),
    }
    .assimilate_storage(&mut storage)
    .expect("balances genesis builds");

    let mut ext = sp_io::TestExternalities::from(storage);
    // Events are only recorded from block 1 on.
    ext.execute_with(|| System::set_block_number(1));
    ext
}

/// Takes the events recorded so far.
pub fn events() -> Vec<RuntimeEvent> {
    let recorded = System::events()
        .into_iter()
        .map(|record| record.event)
        .collect();
    System::reset_events();
    recorded
}

pub fn run_to_block(n: u64) {
    for block in System::block_number() + 1..=n {
        System::set_block_number(block);
        System::on_initialize(block);
    }
}
