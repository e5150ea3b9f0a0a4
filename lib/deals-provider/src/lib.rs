//! Storage provider side of the storage deal flow.
//!
//! A deal goes `New → Accepted → Staged → Sealing → Complete`, any non-terminal
//! deal can be moved to `Failed`. Every change of a deal record goes through a single
//! dispatcher task, see [`start_provider`]; the handlers run concurrently and only
//! return the change they want applied.

pub mod allocator;
pub mod config;
pub mod deal;
mod handlers;
pub mod node;
mod provider;

#[cfg(test)]
mod tests;

pub use allocator::BinPackingAllocator;
pub use config::{init_tracing, ConfigurationError, ProviderArguments, ProviderConfiguration};
pub use deal::{DealFailure, DealState, MinerDeal, StorageAsk};
pub use provider::{start_provider, ProviderHandle, ProviderNode};

use deal::{AccountId, Balance, BlockNumber, ConversionError, SerializationMode};
use node::BoxError;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("serialization mode {0:?} is not supported")]
    UnsupportedSerialization(SerializationMode),

    #[error("proposal expired at block {expiration}, chain head is at {head}")]
    ProposalExpired {
        head: BlockNumber,
        expiration: BlockNumber,
    },

    #[error("storage price per block {offered} is lower than the asking price {minimum}")]
    PriceTooLow { offered: Balance, minimum: Balance },

    #[error("piece size {size} is smaller than the minimum {minimum}")]
    PieceTooSmall { size: u64, minimum: u64 },

    #[error("client market balance {available} does not cover the total price {required}")]
    InsufficientClientBalance {
        available: Balance,
        required: Balance,
    },

    #[error("proposal is addressed to another provider: {0}")]
    WrongProvider(AccountId),

    #[error("chain returned no deal id for the published proposal")]
    NothingPublished,

    #[error("no client connection for the proposal")]
    MissingConnection,

    #[error("deal not found")]
    DealNotFound,

    #[error("no handler registered for state {0:?}")]
    NoHandler(DealState),

    #[error("arithmetic overflow")]
    Overflow,

    #[error("chain error: {0}")]
    Chain(#[source] BoxError),

    #[error("data transfer error: {0}")]
    Transfer(#[source] BoxError),

    #[error("client connection error: {0}")]
    Connection(#[source] BoxError),

    #[error("sector allocation failed: {0}")]
    Allocator(#[source] BoxError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("provider is shutting down")]
    ShuttingDown,
}
