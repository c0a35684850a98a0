// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Client-side deal machine: propose, fund, transfer, then follow the deal
//! on chain from the opposite side of the provider's flow.

use crate::events::ClientEvent;
use crate::network::{DealStatusResponse, SignedResponse};
use crate::nodes::{DealCompletion, StorageClientNode};
use crate::types::{ClientDeal, StorageDealStatus};
use async_std::task;
use async_trait::async_trait;
use cid::Cid;
use datatransfer::ChannelId;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::warn;
use num_traits::Zero;
use statemachine::{Ctx, Machine, Transition};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// How long the client waits between provider status polls while checking
/// for acceptance.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Dependencies needed to process client deals.
#[async_trait]
pub trait ClientDealEnvironment: Send + Sync + 'static {
    fn node(&self) -> &dyn StorageClientNode;

    /// Sends the signed proposal to the provider and returns its signed
    /// response together with the raw response bytes the signature covers.
    async fn propose_deal(&self, deal: &ClientDeal) -> Result<(SignedResponse, Vec<u8>), String>;

    /// Opens the push channel moving payload data to the provider.
    async fn open_data_transfer(&self, deal: &ClientDeal) -> Result<ChannelId, String>;

    async fn restart_data_transfer(&self, channel_id: ChannelId) -> Result<(), String>;

    /// Queries the provider's view of the deal over the status protocol.
    async fn get_provider_deal_state(
        &self,
        deal: &ClientDeal,
    ) -> Result<DealStatusResponse, String>;
}

pub struct ClientDealMachine<E> {
    _env: PhantomData<E>,
}

pub type ClientCtx<E> = Ctx<ClientDealMachine<E>>;

impl<E: ClientDealEnvironment> Machine for ClientDealMachine<E> {
    type Key = Cid;
    type State = StorageDealStatus;
    type Event = ClientEvent;
    type Record = ClientDeal;
    type Environment = E;

    fn key(record: &ClientDeal) -> Cid {
        record.proposal_cid
    }

    fn state(record: &ClientDeal) -> StorageDealStatus {
        record.state
    }

    fn set_state(record: &mut ClientDeal, state: StorageDealStatus) {
        record.state = state;
    }

    fn is_final(state: StorageDealStatus) -> bool {
        matches!(
            state,
            StorageDealStatus::Expired | StorageDealStatus::Slashed | StorageDealStatus::Error
        )
    }

    fn plan(
        state: StorageDealStatus,
        event: &ClientEvent,
    ) -> Option<Transition<StorageDealStatus>> {
        use StorageDealStatus as S;
        use Transition::*;
        match event {
            ClientEvent::Open => from(state, &[S::Unknown], To(S::EnsureClientFunds)),
            ClientEvent::FundsReserved { .. } => Some(JustRecord),
            ClientEvent::FundsReleased { .. } => Some(JustRecord),
            ClientEvent::FundingInitiated { .. } => {
                from(state, &[S::EnsureClientFunds], To(S::ClientFunding))
            }
            ClientEvent::EnsureFundsFailed { .. } => from(
                state,
                &[S::EnsureClientFunds, S::ClientFunding],
                To(S::Failing),
            ),
            ClientEvent::FundingComplete => from(
                state,
                &[S::EnsureClientFunds, S::ClientFunding],
                To(S::FundsEnsured),
            ),
            ClientEvent::WriteProposalFailed { .. } => {
                from(state, &[S::FundsEnsured], To(S::Error))
            }
            ClientEvent::ReadResponseFailed { .. } => from(state, &[S::FundsEnsured], To(S::Error)),
            ClientEvent::ResponseVerificationFailed => {
                from(state, &[S::FundsEnsured], To(S::Failing))
            }
            ClientEvent::ResponseDealDidNotMatch { .. } => {
                from(state, &[S::FundsEnsured], To(S::Failing))
            }
            ClientEvent::UnexpectedDealState { .. } => {
                from(state, &[S::FundsEnsured], To(S::Failing))
            }
            ClientEvent::DealProposed => from(state, &[S::FundsEnsured], To(S::StartDataTransfer)),
            ClientEvent::DataTransferFailed { .. } => from(
                state,
                &[S::StartDataTransfer, S::Transferring],
                To(S::Failing),
            ),
            ClientEvent::DataTransferInitiated { .. } => {
                from(state, &[S::StartDataTransfer], To(S::Transferring))
            }
            ClientEvent::DataTransferRestarted { .. } => {
                from(state, &[S::Transferring], JustRecord)
            }
            ClientEvent::DataTransferRestartFailed { .. } => {
                from(state, &[S::Transferring], To(S::Failing))
            }
            ClientEvent::DataTransferComplete => {
                from(state, &[S::Transferring], To(S::CheckForDealAcceptance))
            }
            ClientEvent::DealAccepted { .. } => {
                from(state, &[S::CheckForDealAcceptance], To(S::ProposalAccepted))
            }
            ClientEvent::DealRejected { .. } => {
                from(state, &[S::CheckForDealAcceptance], To(S::Failing))
            }
            ClientEvent::StatusRequestFailed { .. } => {
                from(state, &[S::CheckForDealAcceptance], To(S::Failing))
            }
            ClientEvent::DealPublishFailed { .. } => {
                from(state, &[S::ProposalAccepted], To(S::Error))
            }
            ClientEvent::DealPublished { .. } => {
                from(state, &[S::ProposalAccepted], To(S::Sealing))
            }
            ClientEvent::DealActivationFailed { .. } => from(state, &[S::Sealing], To(S::Error)),
            ClientEvent::DealActivated => from(state, &[S::Sealing], To(S::Active)),
            ClientEvent::DealCompletionFailed { .. } => from(state, &[S::Active], To(S::Error)),
            ClientEvent::DealSlashed { .. } => from(state, &[S::Active], To(S::Slashed)),
            ClientEvent::DealExpired => from(state, &[S::Active], To(S::Expired)),
            ClientEvent::Failed => from(state, &[S::Failing], To(S::Error)),
        }
    }

    fn apply(deal: &mut ClientDeal, event: &ClientEvent) {
        match event {
            ClientEvent::FundsReserved { amount } => {
                deal.funds_reserved = deal.funds_reserved.clone() + amount.clone();
            }
            ClientEvent::FundsReleased { amount } => {
                deal.funds_reserved = deal.funds_reserved.clone() - amount.clone();
            }
            ClientEvent::FundingInitiated { message_cid } => {
                deal.add_funds_cid = Some(*message_cid);
            }
            ClientEvent::EnsureFundsFailed { message } => {
                deal.message = format!("adding market funds failed: {}", message);
            }
            ClientEvent::WriteProposalFailed { message } => {
                deal.message = format!("sending proposal to storage provider failed: {}", message);
            }
            ClientEvent::ReadResponseFailed { message } => {
                deal.message = format!("error reading Response message: {}", message);
            }
            ClientEvent::ResponseVerificationFailed => {
                deal.message = "unable to verify signature on deal response".to_string();
            }
            ClientEvent::ResponseDealDidNotMatch { received, expected } => {
                deal.message = format!(
                    "miner responded to a wrong proposal: {} != {}",
                    received, expected
                );
            }
            ClientEvent::UnexpectedDealState { status } => {
                deal.message = format!(
                    "unexpected deal status while waiting for data request: {}",
                    status
                );
            }
            ClientEvent::DataTransferFailed { message } => {
                deal.message = format!("failed to initiate data transfer: {}", message);
            }
            ClientEvent::DataTransferInitiated { channel_id }
            | ClientEvent::DataTransferRestarted { channel_id } => {
                deal.transfer_channel_id = Some(channel_id.clone());
            }
            ClientEvent::DataTransferRestartFailed { message } => {
                deal.message = format!("restarting data transfer: {}", message);
            }
            ClientEvent::DealAccepted { publish_message } => {
                deal.publish_message = *publish_message;
                deal.message = String::new();
            }
            ClientEvent::DealRejected { reason } => {
                deal.message = format!("deal failed: {}", reason);
            }
            ClientEvent::StatusRequestFailed { message } => {
                deal.message = format!("error when querying deal status: {}", message);
            }
            ClientEvent::DealPublishFailed { message } => {
                deal.message = format!("error validating deal published: {}", message);
            }
            ClientEvent::DealPublished { deal_id } => {
                deal.deal_id = *deal_id;
            }
            ClientEvent::DealActivationFailed { message } => {
                deal.message = format!("error in deal activation: {}", message);
            }
            ClientEvent::DealCompletionFailed { message } => {
                deal.message = message.clone();
            }
            _ => {}
        }
    }

    fn handle(
        env: Arc<E>,
        ctx: ClientCtx<E>,
        deal: ClientDeal,
    ) -> BoxFuture<'static, Result<(), String>> {
        use StorageDealStatus as S;
        async move {
            match deal.state {
                S::EnsureClientFunds => ensure_client_funds(&ctx, env.as_ref(), deal).await,
                S::ClientFunding => wait_for_funding(&ctx, env.as_ref(), deal).await,
                S::FundsEnsured => propose_deal(&ctx, env.as_ref(), deal).await,
                S::StartDataTransfer => initiate_data_transfer(&ctx, env.as_ref(), deal).await,
                S::Transferring => restart_data_transfer(&ctx, env, deal).await,
                S::CheckForDealAcceptance => check_for_deal_acceptance(&ctx, env, deal).await,
                S::ProposalAccepted => validate_deal_published(&ctx, env.as_ref(), deal).await,
                S::Sealing => verify_deal_activated(&ctx, env, deal).await,
                S::Active => wait_for_deal_completion(&ctx, env, deal).await,
                S::Failing => fail_deal(&ctx, env.as_ref(), deal).await,
                _ => Ok(()),
            }
        }
        .boxed()
    }
}

fn from(
    state: StorageDealStatus,
    allowed: &[StorageDealStatus],
    transition: Transition<StorageDealStatus>,
) -> Option<Transition<StorageDealStatus>> {
    allowed.contains(&state).then_some(transition)
}

/// Makes sure the client's market escrow covers collateral plus the total
/// storage fee.
async fn ensure_client_funds<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDeal,
) -> Result<(), String> {
    let proposal = deal.proposal().clone();
    let requirement = proposal.client_balance_requirement();

    let mcid = match env
        .node()
        .reserve_funds(&proposal.client, &proposal.client, &requirement)
        .await
    {
        Ok(mcid) => mcid,
        Err(e) => {
            ctx.trigger(ClientEvent::EnsureFundsFailed {
                message: e.to_string(),
            });
            return Ok(());
        }
    };

    ctx.trigger(ClientEvent::FundsReserved {
        amount: requirement,
    });

    match mcid {
        None => ctx.trigger(ClientEvent::FundingComplete),
        Some(mcid) => ctx.trigger(ClientEvent::FundingInitiated { message_cid: mcid }),
    }
    Ok(())
}

/// Waits for the add-funds message to land on chain.
async fn wait_for_funding<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDeal,
) -> Result<(), String> {
    let add_funds_cid = deal
        .add_funds_cid
        .ok_or_else(|| "no add funds message to wait for".to_string())?;
    match env.node().wait_for_message(&add_funds_cid).await {
        Err(e) => ctx.trigger(ClientEvent::EnsureFundsFailed {
            message: format!("AddFunds errored: {}", e),
        }),
        Ok(receipt) if !receipt.exit_code.is_success() => {
            ctx.trigger(ClientEvent::EnsureFundsFailed {
                message: format!("AddFunds exit code: {}", receipt.exit_code),
            })
        }
        Ok(_) => ctx.trigger(ClientEvent::FundingComplete),
    }
    Ok(())
}

/// Sends the signed proposal and validates the provider's signed answer
/// before anything else happens on this deal.
async fn propose_deal<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDeal,
) -> Result<(), String> {
    let (signed_response, response_bytes) = match env.propose_deal(&deal).await {
        Ok(got) => got,
        Err(e) => {
            ctx.trigger(ClientEvent::WriteProposalFailed { message: e });
            return Ok(());
        }
    };

    if let Err(e) =
        verify_response(env.node(), &signed_response, &deal.miner_worker, &response_bytes).await
    {
        warn!(
            "deal {}: provider response failed verification: {}",
            deal.proposal_cid, e
        );
        ctx.trigger(ClientEvent::ResponseVerificationFailed);
        return Ok(());
    }

    if signed_response.response.proposal != deal.proposal_cid {
        ctx.trigger(ClientEvent::ResponseDealDidNotMatch {
            received: signed_response.response.proposal,
            expected: deal.proposal_cid,
        });
        return Ok(());
    }

    if signed_response.response.state != StorageDealStatus::WaitingForData {
        ctx.trigger(ClientEvent::UnexpectedDealState {
            status: signed_response.response.state,
        });
        return Ok(());
    }

    ctx.trigger(ClientEvent::DealProposed);
    Ok(())
}

/// Checks the provider's signature over the raw response bytes.
pub async fn verify_response(
    node: &dyn StorageClientNode,
    signed: &SignedResponse,
    miner_worker: &fvm_shared::address::Address,
    response_bytes: &[u8],
) -> Result<(), String> {
    let (tok, _) = node.get_chain_head().await.map_err(|e| e.to_string())?;
    let verified = node
        .verify_signature(&signed.signature, miner_worker, response_bytes, &tok)
        .await
        .map_err(|e| e.to_string())?;
    if !verified {
        return Err("could not verify signature".to_string());
    }
    Ok(())
}

async fn initiate_data_transfer<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDeal,
) -> Result<(), String> {
    match env.open_data_transfer(&deal).await {
        Err(e) => ctx.trigger(ClientEvent::DataTransferFailed { message: e }),
        Ok(channel_id) => ctx.trigger(ClientEvent::DataTransferInitiated { channel_id }),
    }
    Ok(())
}

/// Resumes an interrupted outbound transfer; runs off the handler task
/// because the restart call reads deal state through the engine.
async fn restart_data_transfer<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: Arc<E>,
    deal: ClientDeal,
) -> Result<(), String> {
    let Some(channel_id) = deal.transfer_channel_id.clone() else {
        ctx.trigger(ClientEvent::DataTransferRestartFailed {
            message: "channel id on client deal is unset".to_string(),
        });
        return Ok(());
    };

    let ctx = ctx.clone();
    task::spawn(async move {
        if let Err(e) = env.restart_data_transfer(channel_id).await {
            ctx.trigger(ClientEvent::DataTransferRestartFailed { message: e });
        }
    });
    Ok(())
}

/// Polls the provider over the status protocol until the deal is accepted
/// or terminally rejected.
async fn check_for_deal_acceptance<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: Arc<E>,
    deal: ClientDeal,
) -> Result<(), String> {
    let ctx = ctx.clone();
    task::spawn(async move {
        loop {
            match env.get_provider_deal_state(&deal).await {
                Err(e) => {
                    ctx.trigger(ClientEvent::StatusRequestFailed { message: e });
                    return;
                }
                Ok(status) => match status.state {
                    StorageDealStatus::Rejecting
                    | StorageDealStatus::Failing
                    | StorageDealStatus::Error => {
                        ctx.trigger(ClientEvent::DealRejected {
                            reason: status.message,
                        });
                        return;
                    }
                    StorageDealStatus::Staged
                    | StorageDealStatus::AwaitingPreCommit
                    | StorageDealStatus::Sealing
                    | StorageDealStatus::Finalizing
                    | StorageDealStatus::Active
                    | StorageDealStatus::Expired => {
                        ctx.trigger(ClientEvent::DealAccepted {
                            publish_message: status.publish_cid,
                        });
                        return;
                    }
                    _ => task::sleep(POLL_INTERVAL).await,
                },
            }
        }
    });
    Ok(())
}

/// Confirms the publish message and learns the chain-allocated deal id.
/// Published deals hold the client's funds in market escrow, so the local
/// reservation is returned here.
async fn validate_deal_published<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDeal,
) -> Result<(), String> {
    match env.node().validate_published_deal(&deal).await {
        Err(e) => ctx.trigger(ClientEvent::DealPublishFailed {
            message: e.to_string(),
        }),
        Ok(deal_id) => {
            release_reserved_funds(ctx, env, &deal).await;
            ctx.trigger(ClientEvent::DealPublished { deal_id });
        }
    }
    Ok(())
}

async fn release_reserved_funds<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: &ClientDeal,
) {
    if !deal.funds_reserved.is_zero() {
        if let Err(e) = env
            .node()
            .release_funds(&deal.proposal().client, &deal.funds_reserved)
            .await
        {
            // nonfatal
            warn!("failed to release funds: {}", e);
        }
        ctx.trigger(ClientEvent::FundsReleased {
            amount: deal.funds_reserved.clone(),
        });
    }
}

async fn verify_deal_activated<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: Arc<E>,
    deal: ClientDeal,
) -> Result<(), String> {
    let ctx = ctx.clone();
    task::spawn(async move {
        let provider = deal.proposal().provider;
        match env
            .node()
            .wait_for_deal_sector_commit(&provider, deal.deal_id)
            .await
        {
            Err(e) => ctx.trigger(ClientEvent::DealActivationFailed {
                message: e.to_string(),
            }),
            Ok(()) => ctx.trigger(ClientEvent::DealActivated),
        }
    });
    Ok(())
}

async fn wait_for_deal_completion<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: Arc<E>,
    deal: ClientDeal,
) -> Result<(), String> {
    let ctx = ctx.clone();
    task::spawn(async move {
        match env.node().wait_for_deal_completion(deal.deal_id).await {
            Err(e) => ctx.trigger(ClientEvent::DealCompletionFailed {
                message: format!("deal completion err: {}", e),
            }),
            Ok(DealCompletion::Expired) => ctx.trigger(ClientEvent::DealExpired),
            Ok(DealCompletion::Slashed(epoch)) => ctx.trigger(ClientEvent::DealSlashed { epoch }),
        }
    });
    Ok(())
}

/// Returns any reserved funds before entering the terminal error state.
async fn fail_deal<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDeal,
) -> Result<(), String> {
    warn!("deal {} failed: {}", deal.proposal_cid, deal.message);

    release_reserved_funds(ctx, env, &deal).await;

    ctx.trigger(ClientEvent::Failed);
    Ok(())
}
