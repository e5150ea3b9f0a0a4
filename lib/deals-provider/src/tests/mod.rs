
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use cid::{multihash::Multihash, Cid};
use codec::Encode;
use primitives_commitment::{Commitment, CommitmentKind};
use primitives_proofs::{DealId, SectorSize};
use sp_core::Pair;
use sp_runtime::{
    traits::{IdentifyAccount, Verify},
    MultiSigner,
};
use tokio::sync::{mpsc::UnboundedReceiver, watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    allocator::BinPackingAllocator,
    deal::{
        AccountId, Balance, BlockNumber, ClientDealProposal, DataRef, DealProposal, DealResponse,
        DealState, MinerDeal, PublishMessageRef, Selector, SerializationMode, StorageAsk,
        StorageDataTransferVoucher,
    },
    handlers::HandlerContext,
    node::{
        BoxError, ChainApi, ChannelId, ClientConnection, DataTransfer, MarketBalance,
        PublishedDeals,
    },
    start_provider, DealFailure, ProviderConfiguration, ProviderHandle, ProviderNode,
};

pub(crate) const ALICE: &str = "//Alice";
pub(crate) const BOB: &str = "//Bob";
pub(crate) const PROVIDER: &str = "//Charlie";

/// Ask price making 1 the minimum price of a 1KiB piece.
pub(crate) const ASK_PRICE: Balance = 1 << 20;
pub(crate) const MIN_PIECE_SIZE: u64 = 256;
pub(crate) const CHAIN_HEAD: BlockNumber = 10;
pub(crate) const CLIENT_BALANCE: Balance = 1_000_000;
pub(crate) const WORKER_FUNDS: Balance = 1_000;

pub(crate) fn key_pair(name: &str) -> sp_core::sr25519::Pair {
    sp_core::sr25519::Pair::from_string(name, None).unwrap()
}

pub(crate) fn account(name: &str) -> AccountId {
    MultiSigner::Sr25519(key_pair(name).public()).into_account()
}

pub(crate) fn proposal(client: &str, provider: &str) -> DealProposal {
    DealProposal {
        piece_cid: Commitment::new([1; 32], CommitmentKind::Piece).cid(),
        piece_size: 1024,
        piece_serialization: SerializationMode::UnixFsV0,
        client: account(client),
        provider: account(provider),
        proposal_expiration: 100,
        duration: 150,
        storage_price_per_block: 1,
        provider_collateral: 100,
    }
}

pub(crate) fn signed(proposal: DealProposal, client: &str) -> ClientDealProposal {
    proposal.sign(&key_pair(client)).unwrap()
}

pub(crate) fn data_ref() -> DataRef {
    DataRef {
        root: Cid::new_v1(0x70, Multihash::wrap(0x12, &[7; 32]).unwrap()),
    }
}

pub(crate) fn ask() -> StorageAsk {
    StorageAsk {
        price: ASK_PRICE,
        min_piece_size: MIN_PIECE_SIZE,
    }
}

pub(crate) struct ChainState {
    pub head: BlockNumber,
    pub balances: HashMap<AccountId, MarketBalance>,
    pub worker: AccountId,
    pub next_deal_id: DealId,
    pub published: Vec<ClientDealProposal>,
    /// Free funds outside of the market, used to top up market entries.
    pub wallets: HashMap<AccountId, Balance>,
    /// `(provider, wallet, amount)` of every collateral request.
    pub ensured: Vec<(AccountId, AccountId, Balance)>,
    pub fail_publish: bool,
    /// When set, publication waits for a notification.
    pub publish_gate: Option<Arc<Notify>>,
}

/// In-memory chain, verifies client signatures on publication like the market does.
pub(crate) struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new() -> Self {
        let balances = [ALICE, BOB]
            .into_iter()
            .map(|client| {
                (
                    account(client),
                    MarketBalance {
                        available: CLIENT_BALANCE,
                        locked: 0,
                    },
                )
            })
            .collect();

        Self {
            state: Mutex::new(ChainState {
                head: CHAIN_HEAD,
                balances,
                worker: account(PROVIDER),
                next_deal_id: 1,
                published: vec![],
                wallets: HashMap::from([(account(PROVIDER), WORKER_FUNDS)]),
                ensured: vec![],
                fail_publish: false,
                publish_gate: None,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ChainApi for FakeChain {
    async fn chain_head(&self) -> Result<BlockNumber, BoxError> {
        Ok(self.state().head)
    }

    async fn market_balance(&self, address: &AccountId) -> Result<MarketBalance, BoxError> {
        Ok(self
            .state()
            .balances
            .get(address)
            .copied()
            .unwrap_or_default())
    }

    async fn miner_worker(&self, _provider: &AccountId) -> Result<AccountId, BoxError> {
        Ok(self.state().worker.clone())
    }

    async fn ensure_available(
        &self,
        provider: &AccountId,
        wallet: &AccountId,
        amount: Balance,
    ) -> Result<(), BoxError> {
        let mut state = self.state();
        state
            .ensured
            .push((provider.clone(), wallet.clone(), amount));

        let available = state
            .balances
            .get(provider)
            .map_or(0, |balance| balance.available);
        let missing = amount.saturating_sub(available);
        if missing == 0 {
            return Ok(());
        }
        let funds = state.wallets.entry(wallet.clone()).or_default();
        if *funds < missing {
            return Err(format!("wallet cannot deposit {missing}").into());
        }
        *funds -= missing;
        state.balances.entry(provider.clone()).or_default().available += missing;
        Ok(())
    }

    async fn publish_deals(
        &self,
        deals: Vec<ClientDealProposal>,
    ) -> Result<PublishedDeals, BoxError> {
        let gate = self.state().publish_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        for deal in &deals {
            let encoded = deal.proposal.to_chain()?.encode();
            if !deal
                .client_signature
                .verify(encoded.as_slice(), &deal.proposal.client)
            {
                return Err("invalid client signature".into());
            }
        }

        let mut state = self.state();
        if state.fail_publish {
            return Err("publish transaction failed".into());
        }
        let deal_ids = deals
            .into_iter()
            .map(|deal| {
                let deal_id = state.next_deal_id;
                state.next_deal_id += 1;
                state.published.push(deal);
                deal_id
            })
            .collect();

        Ok(PublishedDeals {
            deal_ids,
            message: PublishMessageRef {
                block_number: state.head,
                extrinsic_index: 1,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PullRequest {
    pub counterparty: AccountId,
    pub voucher: StorageDataTransferVoucher,
    pub root: Cid,
    pub selector: Selector,
}

#[derive(Default)]
pub(crate) struct FakeTransfer {
    pub requests: Mutex<Vec<PullRequest>>,
    pub fail: Mutex<bool>,
}

#[async_trait]
impl DataTransfer for FakeTransfer {
    async fn open_pull_data_channel(
        &self,
        counterparty: &AccountId,
        voucher: StorageDataTransferVoucher,
        root: Cid,
        selector: Selector,
    ) -> Result<ChannelId, BoxError> {
        if *self.fail.lock().unwrap() {
            return Err("peer unreachable".into());
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(PullRequest {
            counterparty: counterparty.clone(),
            voucher,
            root,
            selector,
        });
        Ok(requests.len() as ChannelId)
    }
}

#[derive(Default)]
pub(crate) struct FakeConnection {
    pub responses: Mutex<Vec<DealResponse>>,
    pub closed: Mutex<bool>,
    pub fail: bool,
}

impl FakeConnection {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn responses(&self) -> Vec<DealResponse> {
        self.responses.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl ClientConnection for FakeConnection {
    async fn send_response(&self, response: DealResponse) -> Result<(), BoxError> {
        if self.fail {
            return Err("connection reset".into());
        }
        self.responses.lock().unwrap().push(response);
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        *self.closed.lock().unwrap() = true;
        if self.fail {
            return Err("connection reset".into());
        }
        Ok(())
    }
}

/// Handler context backed by the given fakes and the default [`ask`].
pub(crate) fn context(chain: Arc<FakeChain>, transfer: Arc<FakeTransfer>) -> Arc<HandlerContext> {
    // The receiver keeps the last value after the sender is gone.
    let (_, ask) = watch::channel(ask());
    Arc::new(HandlerContext {
        provider: account(PROVIDER),
        chain,
        transfer,
        allocator: Arc::new(BinPackingAllocator::new(SectorSize::_2KiB, 1)),
        ask,
    })
}

pub(crate) struct TestProvider {
    pub handle: ProviderHandle,
    pub join_handle: tokio::task::JoinHandle<Vec<MinerDeal>>,
    pub chain: Arc<FakeChain>,
    pub transfer: Arc<FakeTransfer>,
    pub failures: UnboundedReceiver<DealFailure>,
    pub token: CancellationToken,
}

impl TestProvider {
    pub fn start() -> Self {
        let chain = Arc::new(FakeChain::new());
        let transfer = Arc::new(FakeTransfer::default());
        let (failures_tx, failures) = tokio::sync::mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let (handle, join_handle) = start_provider(
            ProviderConfiguration {
                provider: account(PROVIDER),
                ask: ask(),
            },
            ProviderNode {
                chain: chain.clone(),
                data_transfer: transfer.clone(),
                allocator: Arc::new(BinPackingAllocator::new(SectorSize::_2KiB, 1)),
            },
            Some(failures_tx),
            token.clone(),
        );

        Self {
            handle,
            join_handle,
            chain,
            transfer,
            failures,
            token,
        }
    }

    pub async fn propose(&self, proposal: ClientDealProposal) -> (Cid, Arc<FakeConnection>) {
        let connection = Arc::new(FakeConnection::default());
        let proposal_cid = self
            .handle
            .propose(proposal, data_ref(), connection.clone())
            .await
            .unwrap();
        (proposal_cid, connection)
    }

    /// Waits until the deal reaches `state`, panics after a few seconds.
    pub async fn wait_for(&self, proposal_cid: Cid, state: DealState) -> MinerDeal {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(deal) = self.handle.deal(proposal_cid).await.unwrap() {
                    if deal.state == state {
                        return deal;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("deal {proposal_cid} never reached {state:?}"))
    }

    pub async fn next_failure(&mut self) -> DealFailure {
        tokio::time::timeout(Duration::from_secs(5), self.failures.recv())
            .await
            .expect("no failure was reported")
            .expect("failure channel closed")
    }
}
