use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use cid::Cid;
use primitives_proofs::SectorNumber;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender},
        oneshot, watch,
    },
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::ProviderConfiguration,
    deal::{
        ClientDealProposal, DataRef, DealFailure, DealMutation, DealResponse, DealState, MinerDeal,
        StorageAsk, Transition,
    },
    handlers::{self, HandlerContext},
    node::{ChainApi, ClientConnection, DataTransfer, SectorAllocator},
    ProviderError,
};

/// Collaborators the provider talks to.
pub struct ProviderNode {
    pub chain: Arc<dyn ChainApi>,
    pub data_transfer: Arc<dyn DataTransfer>,
    pub allocator: Arc<dyn SectorAllocator>,
}

/// Messages processed, in order, by the dispatcher.
enum ProviderMessage {
    Propose {
        proposal: ClientDealProposal,
        data_ref: DataRef,
        connection: Arc<dyn ClientConnection>,
        respond_to: oneshot::Sender<Result<Cid, ProviderError>>,
    },
    HandlerResult {
        proposal_cid: Cid,
        from_state: DealState,
        outcome: Result<Transition, ProviderError>,
    },
    DataTransferCompleted {
        proposal_cid: Cid,
        success: bool,
    },
    SectorSealed {
        sector_number: SectorNumber,
    },
    Retry {
        proposal_cid: Cid,
    },
    FailDeal {
        proposal_cid: Cid,
        reason: String,
    },
    Deal {
        proposal_cid: Cid,
        respond_to: oneshot::Sender<Option<MinerDeal>>,
    },
    Deals {
        respond_to: oneshot::Sender<Vec<MinerDeal>>,
    },
}

/// Owner of every deal record.
struct Dispatcher {
    deals: HashMap<Cid, MinerDeal>,
    /// Client connections of the deals which have not been accepted yet.
    connections: HashMap<Cid, Arc<dyn ClientConnection>>,
    /// Deals with a handler currently running.
    in_flight: HashSet<Cid>,
    context: Arc<HandlerContext>,
    /// Weak, so the dispatcher stops once every [`ProviderHandle`] is gone.
    sender: WeakUnboundedSender<ProviderMessage>,
    failures: Option<UnboundedSender<DealFailure>>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Dispatcher {
    #[tracing::instrument(skip_all)]
    async fn run(mut self, mut receiver: UnboundedReceiver<ProviderMessage>) -> Vec<MinerDeal> {
        let token = self.token.clone();

        loop {
            tokio::select! {
                // Cancellation wins over pending messages, those are handled by the drain below.
                biased;

                _ = token.cancelled() => {
                    tracing::info!("Provider has been cancelled...");
                    break;
                }
                msg = receiver.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg, true),
                        None => {
                            tracing::info!("All provider handles have been dropped...");
                            break;
                        }
                    }
                },
            }
        }

        // Nothing new gets in, what is already queued is still processed.
        receiver.close();
        while let Some(msg) = receiver.recv().await {
            self.handle_message(msg, false);
        }

        tracing::info!("Waiting for handlers to finish...");
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(deals = self.deals.len(), "Provider stopped");

        self.deals.into_values().collect()
    }

    /// Processes a single message, handlers are only dispatched while `running`.
    fn handle_message(&mut self, msg: ProviderMessage, running: bool) {
        match msg {
            ProviderMessage::Propose {
                proposal,
                data_ref,
                connection,
                respond_to,
            } => {
                let result = if running {
                    self.propose(proposal, data_ref, connection)
                } else {
                    Err(ProviderError::ShuttingDown)
                };
                if respond_to.send(result).is_err() {
                    tracing::debug!("proposer went away before the response");
                }
            }
            ProviderMessage::HandlerResult {
                proposal_cid,
                from_state,
                outcome,
            } => self.apply_result(proposal_cid, from_state, outcome, running),
            ProviderMessage::DataTransferCompleted {
                proposal_cid,
                success,
            } => self.data_transfer_completed(proposal_cid, success, running),
            ProviderMessage::SectorSealed { sector_number } => {
                self.sector_sealed(sector_number, running)
            }
            ProviderMessage::Retry { proposal_cid } => {
                if running {
                    self.retry(proposal_cid)
                }
            }
            ProviderMessage::FailDeal {
                proposal_cid,
                reason,
            } => self.fail_deal(proposal_cid, reason),
            ProviderMessage::Deal {
                proposal_cid,
                respond_to,
            } => {
                let _ = respond_to.send(self.deals.get(&proposal_cid).cloned());
            }
            ProviderMessage::Deals { respond_to } => {
                let _ = respond_to.send(self.deals.values().cloned().collect());
            }
        }
    }

    fn propose(
        &mut self,
        proposal: ClientDealProposal,
        data_ref: DataRef,
        connection: Arc<dyn ClientConnection>,
    ) -> Result<Cid, ProviderError> {
        let proposal_cid = proposal.proposal.json_cid()?;
        if self.deals.contains_key(&proposal_cid) {
            tracing::info!(%proposal_cid, "proposal is already known");
            return Ok(proposal_cid);
        }
        if proposal.proposal.provider != self.context.provider {
            return Err(ProviderError::WrongProvider(proposal.proposal.provider));
        }

        tracing::info!(%proposal_cid, "received deal proposal");
        self.deals.insert(
            proposal_cid,
            MinerDeal::new(proposal, proposal_cid, data_ref),
        );
        self.connections.insert(proposal_cid, connection);
        self.dispatch(proposal_cid);

        Ok(proposal_cid)
    }

    fn apply_result(
        &mut self,
        proposal_cid: Cid,
        from_state: DealState,
        outcome: Result<Transition, ProviderError>,
        running: bool,
    ) {
        self.in_flight.remove(&proposal_cid);
        let Some(deal) = self.deals.get_mut(&proposal_cid) else {
            tracing::warn!(%proposal_cid, "handler result for an unknown deal");
            return;
        };
        if deal.state != from_state {
            tracing::warn!(
                %proposal_cid,
                ?from_state,
                current_state = ?deal.state,
                "dropping stale handler result"
            );
            // A deal published on chain keeps its id, whatever happened to it locally.
            if let Ok(Transition::Advance { mutation, .. } | Transition::NoUpdate { mutation }) =
                outcome
            {
                if let DealMutation::SetDealId { deal_id, .. } = mutation {
                    tracing::warn!(%proposal_cid, deal_id, "keeping the id of a published deal");
                    mutation.apply(deal);
                }
            }
            return;
        }

        match outcome {
            Err(err) => {
                tracing::error!(%proposal_cid, state = ?from_state, %err, "deal handler failed");
                self.report(DealFailure {
                    proposal_cid,
                    state: from_state,
                    error: err.to_string(),
                });
            }
            Ok(Transition::NoUpdate { mutation }) => mutation.apply(deal),
            Ok(Transition::Advance { next, mutation }) => {
                mutation.apply(deal);
                deal.state = next;
                tracing::info!(%proposal_cid, from = ?from_state, to = ?next, "deal advanced");
                if from_state == DealState::New {
                    self.connections.remove(&proposal_cid);
                }
                if running {
                    self.dispatch(proposal_cid);
                }
            }
        }
    }

    fn data_transfer_completed(&mut self, proposal_cid: Cid, success: bool, running: bool) {
        let Some(deal) = self.deals.get_mut(&proposal_cid) else {
            tracing::warn!(%proposal_cid, "data transfer completed for an unknown deal");
            return;
        };
        if deal.state != DealState::Accepted {
            tracing::warn!(%proposal_cid, state = ?deal.state, "unexpected data transfer completion");
            return;
        }

        if success {
            deal.state = DealState::Staged;
            tracing::info!(%proposal_cid, "deal data received");
            if running {
                self.dispatch(proposal_cid);
            }
        } else {
            deal.state = DealState::Failed;
            tracing::error!(%proposal_cid, "deal data transfer failed");
            self.report(DealFailure {
                proposal_cid,
                state: DealState::Accepted,
                error: "data transfer failed".to_string(),
            });
        }
    }

    fn sector_sealed(&mut self, sector_number: SectorNumber, running: bool) {
        let sealed: Vec<Cid> = self
            .deals
            .values_mut()
            .filter(|deal| {
                deal.state == DealState::Sealing && deal.sector_number == Some(sector_number)
            })
            .map(|deal| {
                deal.state = DealState::Complete;
                deal.proposal_cid
            })
            .collect();
        tracing::info!(sector_number, deals = sealed.len(), "sector sealed");

        if running {
            for proposal_cid in sealed {
                self.dispatch(proposal_cid);
            }
        }
    }

    fn retry(&mut self, proposal_cid: Cid) {
        match self.deals.get(&proposal_cid).map(|deal| deal.state) {
            Some(state) if !state.is_terminal() => {
                tracing::info!(%proposal_cid, ?state, "retrying deal");
                self.dispatch(proposal_cid);
            }
            Some(state) => tracing::debug!(%proposal_cid, ?state, "not retrying a finished deal"),
            None => tracing::warn!(%proposal_cid, "retry of an unknown deal"),
        }
    }

    fn fail_deal(&mut self, proposal_cid: Cid, reason: String) {
        let Some(deal) = self.deals.get_mut(&proposal_cid) else {
            tracing::warn!(%proposal_cid, "failing an unknown deal");
            return;
        };
        if deal.state.is_terminal() {
            tracing::warn!(%proposal_cid, state = ?deal.state, "deal is already finished");
            return;
        }

        let state = deal.state;
        deal.state = DealState::Failed;
        tracing::error!(%proposal_cid, ?state, %reason, "deal failed");

        // The client is still waiting for an answer on a proposal that never got accepted.
        if let Some(connection) = self.connections.remove(&proposal_cid) {
            let response = DealResponse {
                state: DealState::Failed,
                proposal_cid,
                publish_message: None,
                storage_deal: None,
            };
            self.tracker.spawn(async move {
                if let Err(err) = connection.send_response(response).await {
                    tracing::warn!(%proposal_cid, %err, "failed to send the rejection");
                }
                if let Err(err) = connection.close().await {
                    tracing::warn!(%proposal_cid, %err, "failed to close the client connection");
                }
            });
        }

        self.report(DealFailure {
            proposal_cid,
            state,
            error: reason,
        });
    }

    /// Spawns the handler of the deal's current state, if it has one and none is running.
    fn dispatch(&mut self, proposal_cid: Cid) {
        let Some(deal) = self.deals.get(&proposal_cid) else {
            return;
        };
        if !handlers::has_handler(deal.state) {
            return;
        }
        if !self.in_flight.insert(proposal_cid) {
            tracing::debug!(%proposal_cid, "handler already running");
            return;
        }

        let deal = deal.clone();
        let from_state = deal.state;
        let connection = self.connections.get(&proposal_cid).cloned();
        let context = self.context.clone();
        let sender = self.sender.clone();
        let token = self.token.clone();

        self.tracker.spawn(async move {
            let outcome = tokio::select! {
                outcome = handlers::handle(context, deal, connection) => outcome,
                _ = token.cancelled() => {
                    tracing::debug!(%proposal_cid, ?from_state, "handler cancelled");
                    return;
                }
            };

            let Some(sender) = sender.upgrade() else {
                tracing::debug!(%proposal_cid, "provider stopped, dropping handler result");
                return;
            };
            let result = ProviderMessage::HandlerResult {
                proposal_cid,
                from_state,
                outcome,
            };
            if sender.send(result).is_err() {
                tracing::debug!(%proposal_cid, "provider queue closed, dropping handler result");
            }
        });
    }

    fn report(&self, failure: DealFailure) {
        if let Some(failures) = &self.failures {
            if failures.send(failure).is_err() {
                tracing::debug!("failure report receiver has been dropped");
            }
        }
    }
}

/// Handle to a running provider. Cheap to clone.
#[derive(Clone)]
pub struct ProviderHandle {
    sender: UnboundedSender<ProviderMessage>,
    ask: Arc<watch::Sender<StorageAsk>>,
}

impl ProviderHandle {
    fn send(&self, msg: ProviderMessage) -> Result<(), ProviderError> {
        self.sender
            .send(msg)
            .map_err(|_| ProviderError::ShuttingDown)
    }

    /// Submits a signed proposal, returns its CID once it has been recorded.
    ///
    /// Validation and publication happen afterwards, the client is answered through `connection`.
    pub async fn propose(
        &self,
        proposal: ClientDealProposal,
        data_ref: DataRef,
        connection: Arc<dyn ClientConnection>,
    ) -> Result<Cid, ProviderError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ProviderMessage::Propose {
            proposal,
            data_ref,
            connection,
            respond_to,
        })?;
        response.await.map_err(|_| ProviderError::ShuttingDown)?
    }

    pub fn data_transfer_completed(
        &self,
        proposal_cid: Cid,
        success: bool,
    ) -> Result<(), ProviderError> {
        self.send(ProviderMessage::DataTransferCompleted {
            proposal_cid,
            success,
        })
    }

    pub fn sector_sealed(&self, sector_number: SectorNumber) -> Result<(), ProviderError> {
        self.send(ProviderMessage::SectorSealed { sector_number })
    }

    /// Runs the handler of the deal's current state again.
    pub fn retry(&self, proposal_cid: Cid) -> Result<(), ProviderError> {
        self.send(ProviderMessage::Retry { proposal_cid })
    }

    pub fn fail_deal(
        &self,
        proposal_cid: Cid,
        reason: impl Into<String>,
    ) -> Result<(), ProviderError> {
        self.send(ProviderMessage::FailDeal {
            proposal_cid,
            reason: reason.into(),
        })
    }

    pub async fn deal(&self, proposal_cid: Cid) -> Result<Option<MinerDeal>, ProviderError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ProviderMessage::Deal {
            proposal_cid,
            respond_to,
        })?;
        response.await.map_err(|_| ProviderError::ShuttingDown)
    }

    pub async fn deals(&self) -> Result<Vec<MinerDeal>, ProviderError> {
        let (respond_to, response) = oneshot::channel();
        self.send(ProviderMessage::Deals { respond_to })?;
        response.await.map_err(|_| ProviderError::ShuttingDown)
    }

    /// Replaces the ask, proposals accepted from now on are checked against it.
    pub fn set_ask(&self, ask: StorageAsk) {
        self.ask.send_replace(ask);
    }

    pub fn ask(&self) -> StorageAsk {
        *self.ask.borrow()
    }
}

/// Spawns the dispatcher on the current runtime.
///
/// The provider runs until `token` is cancelled or every [`ProviderHandle`] is dropped,
/// the join handle then yields the final deal records.
/// Handler failures are reported to `failures`, when given, besides being logged.
pub fn start_provider(
    config: ProviderConfiguration,
    node: ProviderNode,
    failures: Option<UnboundedSender<DealFailure>>,
    token: CancellationToken,
) -> (ProviderHandle, JoinHandle<Vec<MinerDeal>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let (ask_sender, ask_receiver) = watch::channel(config.ask);

    let context = Arc::new(HandlerContext {
        provider: config.provider,
        chain: node.chain,
        transfer: node.data_transfer,
        allocator: node.allocator,
        ask: ask_receiver,
    });
    let dispatcher = Dispatcher {
        deals: HashMap::new(),
        connections: HashMap::new(),
        in_flight: HashSet::new(),
        context,
        sender: sender.downgrade(),
        failures,
        tracker: TaskTracker::new(),
        token,
    };
    let join_handle = tokio::spawn(dispatcher.run(receiver));

    (
        ProviderHandle {
            sender,
            ask: Arc::new(ask_sender),
        },
        join_handle,
    )
}
