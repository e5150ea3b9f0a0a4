//! Interfaces of the collaborators the provider depends on.
//!
//! Every call may block on network or chain I/O, they are only ever awaited from handler tasks.

use async_trait::async_trait;
use cid::Cid;
use primitives_proofs::{DealId, SectorNumber};

use crate::deal::{
    AccountId, Balance, BlockNumber, ClientDealProposal, DealResponse, MinerDeal,
    PublishMessageRef, Selector, StorageDataTransferVoucher,
};

/// Error returned by a collaborator, opaque to the provider.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Market balance of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarketBalance {
    pub available: Balance,
    pub locked: Balance,
}

/// Outcome of a deal publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedDeals {
    /// Ids assigned to the deals, in the order they were published.
    pub deal_ids: Vec<DealId>,
    pub message: PublishMessageRef,
}

pub type ChannelId = u64;

#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn chain_head(&self) -> Result<BlockNumber, BoxError>;

    async fn market_balance(&self, address: &AccountId) -> Result<MarketBalance, BoxError>;

    /// Worker account of the given storage provider.
    async fn miner_worker(&self, provider: &AccountId) -> Result<AccountId, BoxError>;

    /// Makes sure the market entry of `provider` has `amount` free, the missing part is
    /// deposited from `wallet`.
    async fn ensure_available(
        &self,
        provider: &AccountId,
        wallet: &AccountId,
        amount: Balance,
    ) -> Result<(), BoxError>;

    /// Publishes the deals in a single message. Either all of them are published or none.
    async fn publish_deals(
        &self,
        deals: Vec<ClientDealProposal>,
    ) -> Result<PublishedDeals, BoxError>;
}

#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Asks `counterparty` to send the data under `root`.
    /// Completion is reported through [`ProviderHandle::data_transfer_completed`].
    ///
    /// [`ProviderHandle::data_transfer_completed`]: crate::ProviderHandle::data_transfer_completed
    async fn open_pull_data_channel(
        &self,
        counterparty: &AccountId,
        voucher: StorageDataTransferVoucher,
        root: Cid,
        selector: Selector,
    ) -> Result<ChannelId, BoxError>;
}

/// Connection to the client which sent a proposal.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    async fn send_response(&self, response: DealResponse) -> Result<(), BoxError>;

    async fn close(&self) -> Result<(), BoxError>;
}

/// Assigns deals to sectors.
#[async_trait]
pub trait SectorAllocator: Send + Sync {
    async fn on_deal_complete(&self, deal: &MinerDeal) -> Result<SectorNumber, BoxError>;
}
