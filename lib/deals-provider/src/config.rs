use primitives_commitment::piece::{PaddedPieceSize, PaddedPieceSizeError};
use sp_core::crypto::{PublicError, Ss58Codec};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::FromEnvError,
    fmt,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use crate::deal::{AccountId, Balance, StorageAsk};

/// Default minimum padded piece size, the smallest piece the market accepts.
const DEFAULT_MIN_PIECE_SIZE: u64 = 128;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid provider address: {0:?}")]
    InvalidProviderAddress(PublicError),

    #[error("no ask price was passed")]
    MissingAskPrice,

    #[error("invalid minimum piece size: {0}")]
    InvalidMinPieceSize(#[from] PaddedPieceSizeError),

    #[error(transparent)]
    EnvFilter(#[from] FromEnvError),

    #[error(transparent)]
    TryInit(#[from] TryInitError),
}

/// The provider arguments, as passed by the user, unvalidated.
#[derive(Debug, Clone, clap::Args)]
pub struct ProviderArguments {
    /// SS58 address of the storage provider account deals are made with.
    #[arg(long)]
    pub provider: String,

    /// Asking price, per GiB per block.
    #[arg(long)]
    pub ask_price: Option<Balance>,

    /// Smallest padded piece size accepted, in bytes.
    #[arg(long, default_value_t = DEFAULT_MIN_PIECE_SIZE)]
    pub min_piece_size: u64,
}

/// A valid provider configuration. To be created using [`ProviderConfiguration::try_from`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfiguration {
    pub provider: AccountId,
    pub ask: StorageAsk,
}

impl TryFrom<ProviderArguments> for ProviderConfiguration {
    type Error = ConfigurationError;

    fn try_from(value: ProviderArguments) -> Result<Self, Self::Error> {
        let provider = AccountId::from_ss58check(&value.provider)
            .map_err(ConfigurationError::InvalidProviderAddress)?;
        let price = value.ask_price.ok_or(ConfigurationError::MissingAskPrice)?;
        let min_piece_size = PaddedPieceSize::new(value.min_piece_size)?;

        Ok(Self {
            provider,
            ask: StorageAsk {
                price,
                min_piece_size: *min_piece_size,
            },
        })
    }
}

/// Installs the global `tracing` subscriber, filtered through `RUST_LOG` and defaulting to `INFO`.
pub fn init_tracing() -> Result<(), ConfigurationError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use rstest::rstest;
    use sp_core::crypto::Ss58Codec;

    use super::{ConfigurationError, ProviderArguments, ProviderConfiguration};
    use crate::tests::{account, PROVIDER};

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        provider: ProviderArguments,
    }

    fn parse(args: &[&str]) -> Result<ProviderConfiguration, ConfigurationError> {
        let cli = Cli::parse_from(std::iter::once("provider").chain(args.iter().copied()));
        ProviderConfiguration::try_from(cli.provider)
    }

    #[test]
    fn parses_valid_arguments() {
        let address = account(PROVIDER).to_ss58check();
        let configuration = parse(&["--provider", &address, "--ask-price", "1000"]).unwrap();

        assert_eq!(configuration.provider, account(PROVIDER));
        assert_eq!(configuration.ask.price, 1000);
        assert_eq!(configuration.ask.min_piece_size, 128);
    }

    #[rstest]
    #[case::bad_address(&["--provider", "not-an-address", "--ask-price", "1"])]
    #[case::missing_price(&["--provider", "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"])]
    #[case::piece_too_small(&[
        "--provider",
        "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY",
        "--ask-price",
        "1",
        "--min-piece-size",
        "64",
    ])]
    #[case::piece_not_power_of_two(&[
        "--provider",
        "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY",
        "--ask-price",
        "1",
        "--min-piece-size",
        "1000",
    ])]
    fn rejects_invalid_arguments(#[case] args: &[&str]) {
        assert!(parse(args).is_err());
    }
}
