use cid::Cid;
use codec::Encode;
use primitives_proofs::{DealId, SectorNumber};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use sp_core::Pair;
use sp_runtime::{AccountId32, BoundedVec, MultiSignature};

pub type AccountId = AccountId32;
pub type Balance = u128;
pub type BlockNumber = u64;

/// Reference to the extrinsic which published a deal.
pub type PublishMessageRef = pallet_market::PublishMessageRef<BlockNumber>;

/// [`DealProposal`] as it is signed by the client and stored on chain.
pub type ChainDealProposal = pallet_market::DealProposal<AccountId, Balance, BlockNumber>;

pub type ChainClientDealProposal =
    pallet_market::ClientDealProposal<AccountId, Balance, BlockNumber, MultiSignature>;

// Reference: <https://github.com/multiformats/multicodec/blob/master/table.csv>
const SHA2_256_MULTICODEC_CODE: u64 = 0x12;
const JSON_MULTICODEC_CODE: u64 = 0x0200;

/// Max size of a piece CID accepted by the market.
const PIECE_CID_MAX_BYTES: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Multihash(#[from] cid::multihash::Error),

    #[error("piece cid takes {0} bytes, the market accepts at most {PIECE_CID_MAX_BYTES}")]
    PieceCidTooLong(usize),
}

/// How the data of a piece is laid out in the sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializationMode {
    Raw,
    Ipld,
    UnixFsV0,
}

/// Storage deal proposal, as negotiated between the client and the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealProposal {
    #[serde(with = "cid_as_string")]
    pub piece_cid: Cid,
    pub piece_size: u64,
    pub piece_serialization: SerializationMode,
    pub client: AccountId,
    pub provider: AccountId,
    /// The proposal cannot be published at or after this block.
    pub proposal_expiration: BlockNumber,
    pub duration: BlockNumber,
    pub storage_price_per_block: Balance,
    pub provider_collateral: Balance,
}

impl DealProposal {
    /// Total amount the client pays over the whole deal, `None` on overflow.
    pub fn total_storage_price(&self) -> Option<Balance> {
        self.storage_price_per_block
            .checked_mul(Balance::from(self.duration))
    }

    /// Get the CID of this deal proposal, as serialized into JSON.
    pub fn json_cid(&self) -> Result<Cid, ConversionError> {
        let deal_proposal_json = serde_json::to_string(self)?;
        let deal_proposal_sha256 = sha2::Sha256::digest(&deal_proposal_json);
        let deal_proposal_multihash =
            cid::multihash::Multihash::wrap(SHA2_256_MULTICODEC_CODE, &deal_proposal_sha256)?;
        Ok(Cid::new_v1(JSON_MULTICODEC_CODE, deal_proposal_multihash))
    }

    /// Converts the proposal into its on-chain form, the one the client signs.
    pub fn to_chain(&self) -> Result<ChainDealProposal, ConversionError> {
        let piece_cid = self.piece_cid.to_bytes();
        let piece_cid_len = piece_cid.len();
        Ok(ChainDealProposal {
            piece_cid: BoundedVec::try_from(piece_cid)
                .map_err(|_| ConversionError::PieceCidTooLong(piece_cid_len))?,
            piece_size: self.piece_size,
            client: self.client.clone(),
            provider: self.provider.clone(),
            proposal_expiration: self.proposal_expiration,
            duration: self.duration,
            storage_price_per_block: self.storage_price_per_block,
            provider_collateral: self.provider_collateral,
        })
    }

    /// Consumes the [`DealProposal`] and signs its SCALE encoded on-chain form.
    pub fn sign(
        self,
        keypair: &sp_core::sr25519::Pair,
    ) -> Result<ClientDealProposal, ConversionError> {
        let encoded = self.to_chain()?.encode();
        tracing::trace!("deal_proposal: encoded proposal: {}", hex::encode(&encoded));
        let client_signature = MultiSignature::Sr25519(keypair.sign(&encoded));
        Ok(ClientDealProposal {
            proposal: self,
            client_signature,
        })
    }
}

/// A client-signed [`DealProposal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: MultiSignature,
}

impl ClientDealProposal {
    pub fn to_chain(&self) -> Result<ChainClientDealProposal, ConversionError> {
        Ok(ChainClientDealProposal {
            proposal: self.proposal.to_chain()?,
            client_signature: self.client_signature.clone(),
        })
    }
}

/// Lifecycle of a deal, as seen by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DealState {
    /// Proposal received, not validated yet.
    New,
    /// Validated and published on chain, waiting for the data.
    Accepted,
    /// Data has been transferred.
    Staged,
    /// Assigned to a sector which is being sealed.
    Sealing,
    Complete,
    Failed,
}

impl DealState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DealState::Complete | DealState::Failed)
    }
}

/// Reference to the data of a deal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRef {
    /// Root of the DAG to be transferred.
    pub root: Cid,
}

/// Deal record kept by the provider. Mutated only by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerDeal {
    pub proposal: DealProposal,
    pub client_signature: MultiSignature,
    pub proposal_cid: Cid,
    pub state: DealState,
    pub data_ref: DataRef,
    pub sector_number: Option<SectorNumber>,
    pub deal_id: Option<DealId>,
    pub publish_message: Option<PublishMessageRef>,
}

impl MinerDeal {
    pub fn new(proposal: ClientDealProposal, proposal_cid: Cid, data_ref: DataRef) -> Self {
        Self {
            proposal: proposal.proposal,
            client_signature: proposal.client_signature,
            proposal_cid,
            state: DealState::New,
            data_ref,
            sector_number: None,
            deal_id: None,
            publish_message: None,
        }
    }

    pub fn signed_proposal(&self) -> ClientDealProposal {
        ClientDealProposal {
            proposal: self.proposal.clone(),
            client_signature: self.client_signature.clone(),
        }
    }
}

/// Asking terms of the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageAsk {
    /// Price per GiB per block.
    pub price: Balance,
    /// Minimum padded piece size, in bytes.
    pub min_piece_size: u64,
}

impl StorageAsk {
    /// Lowest `storage_price_per_block` accepted for a piece of the given size.
    pub fn minimum_price(&self, piece_size: u64) -> Option<Balance> {
        Some(self.price.checked_mul(Balance::from(piece_size))? / (1 << 30))
    }
}

/// Response sent to the client once its proposal has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealResponse {
    pub state: DealState,
    pub proposal_cid: Cid,
    pub publish_message: Option<PublishMessageRef>,
    pub storage_deal: Option<DealProposal>,
}

/// Voucher attached to the pull request of the deal data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDataTransferVoucher {
    pub proposal: Cid,
}

/// Which part of the DAG is transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Every node reachable from the root, `None` meaning no recursion limit.
    ExploreAll { recursion_limit: Option<u64> },
}

impl Selector {
    /// Selector for "get the whole DAG".
    pub fn whole_dag() -> Self {
        Selector::ExploreAll {
            recursion_limit: None,
        }
    }
}

/// Report of a deal handler or event which did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealFailure {
    pub proposal_cid: Cid,
    pub state: DealState,
    pub error: String,
}

/// Change of a deal record, produced by a handler and applied by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DealMutation {
    None,
    SetDealId {
        deal_id: DealId,
        publish_message: PublishMessageRef,
    },
    SetSectorNumber(SectorNumber),
}

impl DealMutation {
    pub fn apply(self, deal: &mut MinerDeal) {
        match self {
            DealMutation::None => {}
            DealMutation::SetDealId {
                deal_id,
                publish_message,
            } => {
                deal.deal_id = Some(deal_id);
                deal.publish_message = Some(publish_message);
            }
            DealMutation::SetSectorNumber(sector_number) => {
                deal.sector_number = Some(sector_number);
            }
        }
    }
}

/// Successful outcome of a deal handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Apply the mutation and move the deal to `next`.
    Advance {
        next: DealState,
        mutation: DealMutation,
    },
    /// Apply the mutation, an external event drives the next transition.
    NoUpdate { mutation: DealMutation },
}

mod cid_as_string {
    use std::str::FromStr;

    use cid::Cid;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(cid: &Cid, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&cid.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Cid, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Cid::from_str(&s).map_err(serde::de::Error::custom)
    }
}
