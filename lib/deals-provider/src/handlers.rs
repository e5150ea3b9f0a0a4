use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    deal::{
        AccountId, DealMutation, DealResponse, DealState, MinerDeal, Selector, SerializationMode,
        StorageAsk, StorageDataTransferVoucher, Transition,
    },
    node::{ChainApi, ClientConnection, DataTransfer, SectorAllocator},
    ProviderError,
};

/// Everything a handler needs besides the deal itself.
pub(crate) struct HandlerContext {
    pub provider: AccountId,
    pub chain: Arc<dyn ChainApi>,
    pub transfer: Arc<dyn DataTransfer>,
    pub allocator: Arc<dyn SectorAllocator>,
    pub ask: watch::Receiver<StorageAsk>,
}

/// Whether a handler runs when a deal enters `state`.
pub(crate) fn has_handler(state: DealState) -> bool {
    matches!(
        state,
        DealState::New | DealState::Staged | DealState::Sealing | DealState::Complete
    )
}

/// Runs the handler registered for the current state of `deal`.
///
/// Handlers work on a snapshot of the deal, the returned [`Transition`] is applied by the dispatcher.
pub(crate) async fn handle(
    ctx: Arc<HandlerContext>,
    deal: MinerDeal,
    connection: Option<Arc<dyn ClientConnection>>,
) -> Result<Transition, ProviderError> {
    match deal.state {
        DealState::New => accept(&ctx, &deal, connection).await,
        DealState::Staged => staged(&ctx, &deal).await,
        DealState::Sealing | DealState::Complete => Ok(Transition::NoUpdate {
            mutation: DealMutation::None,
        }),
        state @ (DealState::Accepted | DealState::Failed) => Err(ProviderError::NoHandler(state)),
    }
}

/// Validates the proposal against the ask and the chain state, publishes it
/// and asks the client for the data.
#[tracing::instrument(skip_all, fields(proposal_cid = %deal.proposal_cid))]
async fn accept(
    ctx: &HandlerContext,
    deal: &MinerDeal,
    connection: Option<Arc<dyn ClientConnection>>,
) -> Result<Transition, ProviderError> {
    let connection = connection.ok_or(ProviderError::MissingConnection)?;
    let proposal = &deal.proposal;

    // Raw and IPLD pieces cannot be unsealed into a retrievable DAG yet.
    if proposal.piece_serialization != SerializationMode::UnixFsV0 {
        return Err(ProviderError::UnsupportedSerialization(
            proposal.piece_serialization,
        ));
    }

    let head = ctx.chain.chain_head().await.map_err(ProviderError::Chain)?;
    if head >= proposal.proposal_expiration {
        return Err(ProviderError::ProposalExpired {
            head,
            expiration: proposal.proposal_expiration,
        });
    }

    let ask = *ctx.ask.borrow();
    let minimum = ask
        .minimum_price(proposal.piece_size)
        .ok_or(ProviderError::Overflow)?;
    if proposal.storage_price_per_block < minimum {
        return Err(ProviderError::PriceTooLow {
            offered: proposal.storage_price_per_block,
            minimum,
        });
    }

    if proposal.piece_size < ask.min_piece_size {
        return Err(ProviderError::PieceTooSmall {
            size: proposal.piece_size,
            minimum: ask.min_piece_size,
        });
    }

    // The chain checks it again on publication, this only avoids a doomed transaction.
    let balance = ctx
        .chain
        .market_balance(&proposal.client)
        .await
        .map_err(ProviderError::Chain)?;
    let required = proposal
        .total_storage_price()
        .ok_or(ProviderError::Overflow)?;
    if balance.available < required {
        return Err(ProviderError::InsufficientClientBalance {
            available: balance.available,
            required,
        });
    }

    let worker = ctx
        .chain
        .miner_worker(&ctx.provider)
        .await
        .map_err(ProviderError::Chain)?;
    ctx.chain
        .ensure_available(&ctx.provider, &worker, proposal.provider_collateral)
        .await
        .map_err(ProviderError::Chain)?;

    let published = ctx
        .chain
        .publish_deals(vec![deal.signed_proposal()])
        .await
        .map_err(ProviderError::Chain)?;
    let deal_id = published
        .deal_ids
        .first()
        .copied()
        .ok_or(ProviderError::NothingPublished)?;
    tracing::info!(deal_id, "deal published");

    // From here on the deal is locked on chain, the remaining failures must not lose the deal id.
    let response = DealResponse {
        state: DealState::Accepted,
        proposal_cid: deal.proposal_cid,
        publish_message: Some(published.message),
        storage_deal: Some(proposal.clone()),
    };
    if let Err(err) = connection.send_response(response).await {
        tracing::error!(%err, "failed to send the deal response");
    }
    if let Err(err) = connection.close().await {
        tracing::warn!(%err, "failed to close the client connection");
    }

    let voucher = StorageDataTransferVoucher {
        proposal: deal.proposal_cid,
    };
    match ctx
        .transfer
        .open_pull_data_channel(
            &proposal.client,
            voucher,
            deal.data_ref.root,
            Selector::whole_dag(),
        )
        .await
    {
        Ok(channel_id) => tracing::debug!(channel_id, "opened pull data channel"),
        Err(err) => tracing::error!(%err, "failed to open the pull data channel"),
    }

    Ok(Transition::Advance {
        next: DealState::Accepted,
        mutation: DealMutation::SetDealId {
            deal_id,
            publish_message: published.message,
        },
    })
}

/// Hands the transferred piece over to sealing.
#[tracing::instrument(skip_all, fields(proposal_cid = %deal.proposal_cid))]
async fn staged(ctx: &HandlerContext, deal: &MinerDeal) -> Result<Transition, ProviderError> {
    let sector_number = ctx
        .allocator
        .on_deal_complete(deal)
        .await
        .map_err(ProviderError::Allocator)?;
    tracing::info!(sector_number, "deal assigned to sector");

    Ok(Transition::Advance {
        next: DealState::Sealing,
        mutation: DealMutation::SetSectorNumber(sector_number),
    })
}
