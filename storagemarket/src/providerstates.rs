// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Provider-side deal machine: the transition table, the event mutations
//! and one entry handler per non-terminal state.

use crate::events::ProviderEvent;
use crate::network::Response;
use crate::nodes::{DealCompletion, PreCommitStatus, StorageProviderNode};
use crate::providerutils::{self, load_block_locations, pad_reader};
use crate::types::{
    deal_duration_bounds, MinerDeal, PublishStorageDealsReturn, StorageAsk, StorageDealStatus,
};
use crate::DEAL_MAX_LABEL_SIZE;
use async_std::task;
use async_trait::async_trait;
use cid::Cid;
use datatransfer::ChannelId;
use filestore::FileStore;
use futures::future::BoxFuture;
use futures::FutureExt;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use log::{error, warn};
use num_traits::Zero;
use piecestore::{DealInfo, PieceStore};
use statemachine::{Ctx, Machine, Transition};
use std::collections::HashMap;
use std::io::Read;
use std::marker::PhantomData;
use std::sync::Arc;

/// Dependencies needed to process provider deals.
#[async_trait]
pub trait ProviderDealEnvironment: Send + Sync + 'static {
    fn address(&self) -> Address;
    fn node(&self) -> &dyn StorageProviderNode;
    async fn ask(&self) -> StorageAsk;
    fn file_store(&self) -> &FileStore;
    fn piece_store(&self) -> &dyn PieceStore;

    async fn restart_data_transfer(&self, channel_id: ChannelId) -> Result<(), String>;

    /// Regenerates the piece commitment for the transferred payload and
    /// stages block-location metadata, returning its path.
    async fn generate_piece_commitment(
        &self,
        store_id: Option<u64>,
        payload_cid: Cid,
    ) -> Result<(Cid, filestore::Path), String>;

    /// Streams the transferred payload out of the per-deal store.
    async fn piece_reader(
        &self,
        store_id: Option<u64>,
        payload_cid: Cid,
    ) -> Result<(Box<dyn Read + Send>, u64), String>;

    fn delete_store(&self, store_id: u64) -> Result<(), String>;

    async fn send_signed_response(&self, response: Response) -> Result<(), String>;
    async fn disconnect(&self, proposal_cid: Cid) -> Result<(), String>;

    /// Pluggable admission hook consulted after validation passes.
    async fn run_custom_decision_logic(&self, deal: &MinerDeal) -> Result<(bool, String), String>;

    fn tag_peer(&self, peer: libp2p_identity::PeerId, tag: &str);
    fn untag_peer(&self, peer: libp2p_identity::PeerId, tag: &str);
}

/// The provider deal machine over a concrete environment.
pub struct ProviderDealMachine<E> {
    _env: PhantomData<E>,
}

pub type ProviderCtx<E> = Ctx<ProviderDealMachine<E>>;

impl<E: ProviderDealEnvironment> Machine for ProviderDealMachine<E> {
    type Key = Cid;
    type State = StorageDealStatus;
    type Event = ProviderEvent;
    type Record = MinerDeal;
    type Environment = E;

    fn key(record: &MinerDeal) -> Cid {
        record.proposal_cid
    }

    fn state(record: &MinerDeal) -> StorageDealStatus {
        record.state
    }

    fn set_state(record: &mut MinerDeal, state: StorageDealStatus) {
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
        event: &ProviderEvent,
    ) -> Option<Transition<StorageDealStatus>> {
        use StorageDealStatus as S;
        use Transition::*;
        match event {
            ProviderEvent::Open => from(state, &[S::Unknown], To(S::Validating)),
            ProviderEvent::DealRejected { .. } => {
                from(state, &[S::Validating, S::AcceptWait], To(S::Rejecting))
            }
            ProviderEvent::RejectionSent => from(state, &[S::Rejecting], To(S::Failing)),
            ProviderEvent::SendResponseFailed { .. } => {
                from(state, &[S::AcceptWait, S::Rejecting], To(S::Failing))
            }
            ProviderEvent::DealDeciding => from(state, &[S::Validating], To(S::AcceptWait)),
            ProviderEvent::DataRequested => from(state, &[S::AcceptWait], To(S::WaitingForData)),
            ProviderEvent::DataTransferInitiated { .. } => {
                from(state, &[S::WaitingForData], To(S::Transferring))
            }
            ProviderEvent::DataTransferRestarted { .. } => {
                from(state, &[S::Transferring], JustRecord)
            }
            ProviderEvent::DataTransferRestartFailed { .. } => {
                from(state, &[S::Transferring], To(S::Failing))
            }
            ProviderEvent::DataTransferCompleted => {
                from(state, &[S::Transferring], To(S::VerifyData))
            }
            ProviderEvent::DataTransferFailed { .. } => {
                from(state, &[S::Transferring, S::WaitingForData], To(S::Failing))
            }
            ProviderEvent::VerifiedData { .. } => {
                from(state, &[S::VerifyData], To(S::ReserveProviderFunds))
            }
            ProviderEvent::DataVerificationFailed { .. } => {
                from(state, &[S::VerifyData], To(S::Failing))
            }
            ProviderEvent::FundsReserved { .. } => Some(JustRecord),
            ProviderEvent::FundsReleased { .. } => Some(JustRecord),
            ProviderEvent::FundingInitiated { .. } => {
                from(state, &[S::ReserveProviderFunds], To(S::ProviderFunding))
            }
            ProviderEvent::Funded => from(
                state,
                &[S::ReserveProviderFunds, S::ProviderFunding],
                To(S::Publish),
            ),
            ProviderEvent::NodeErrored { .. } => Some(To(S::Failing)),
            ProviderEvent::DealPublishInitiated { .. } => {
                from(state, &[S::Publish], To(S::Publishing))
            }
            ProviderEvent::DealPublished { .. } => from(state, &[S::Publishing], To(S::Staged)),
            ProviderEvent::DealPublishError { .. } => from(state, &[S::Publishing], To(S::Failing)),
            ProviderEvent::FileStoreErrored { .. } => from(
                state,
                &[S::Staged, S::Finalizing, S::Failing],
                To(S::Failing),
            ),
            ProviderEvent::DealHandoffFailed { .. } => from(state, &[S::Staged], To(S::Failing)),
            ProviderEvent::PieceStoreErrored { .. } => from(state, &[S::Staged], JustRecord),
            ProviderEvent::DealHandedOff => from(state, &[S::Staged], To(S::AwaitingPreCommit)),
            ProviderEvent::DealPrecommitFailed { .. } => {
                from(state, &[S::AwaitingPreCommit], To(S::Failing))
            }
            ProviderEvent::DealPrecommitted { .. } => {
                from(state, &[S::AwaitingPreCommit], To(S::Sealing))
            }
            ProviderEvent::DealActivationFailed { .. } => {
                from(state, &[S::Sealing], To(S::Failing))
            }
            ProviderEvent::DealActivated => from(
                state,
                &[S::AwaitingPreCommit, S::Sealing],
                To(S::Finalizing),
            ),
            ProviderEvent::Finalized => from(state, &[S::Finalizing], To(S::Active)),
            ProviderEvent::DealCompletionFailed { .. } => from(state, &[S::Active], To(S::Error)),
            ProviderEvent::DealSlashed { .. } => from(state, &[S::Active], To(S::Slashed)),
            ProviderEvent::DealExpired => from(state, &[S::Active], To(S::Expired)),
            ProviderEvent::Failed => from(state, &[S::Failing], To(S::Error)),
        }
    }

    fn apply(deal: &mut MinerDeal, event: &ProviderEvent) {
        match event {
            ProviderEvent::DealRejected { reason } => {
                deal.message = format!("deal rejected: {}", reason);
            }
            ProviderEvent::SendResponseFailed { message } => {
                deal.message = format!("sending response to deal: {}", message);
            }
            ProviderEvent::DataTransferInitiated { channel_id }
            | ProviderEvent::DataTransferRestarted { channel_id } => {
                deal.transfer_channel_id = Some(channel_id.clone());
            }
            ProviderEvent::DataTransferRestartFailed { message } => {
                deal.message = format!("restarting data transfer: {}", message);
            }
            ProviderEvent::DataTransferFailed { message } => {
                deal.message = format!("error transferring data: {}", message);
            }
            ProviderEvent::VerifiedData {
                piece_path,
                metadata_path,
            } => {
                deal.piece_path = piece_path.clone();
                deal.metadata_path = metadata_path.clone();
            }
            ProviderEvent::DataVerificationFailed {
                message,
                piece_path,
                metadata_path,
            } => {
                deal.message = format!("deal data verification failed: {}", message);
                deal.piece_path = piece_path.clone();
                deal.metadata_path = metadata_path.clone();
            }
            ProviderEvent::FundsReserved { amount } => {
                deal.funds_reserved = deal.funds_reserved.clone() + amount.clone();
            }
            ProviderEvent::FundsReleased { amount } => {
                deal.funds_reserved = deal.funds_reserved.clone() - amount.clone();
            }
            ProviderEvent::FundingInitiated { message_cid } => {
                deal.add_funds_cid = Some(*message_cid);
            }
            ProviderEvent::NodeErrored { message }
            | ProviderEvent::DealPublishError { message }
            | ProviderEvent::FileStoreErrored { message }
            | ProviderEvent::DealHandoffFailed { message }
            | ProviderEvent::DealPrecommitFailed { message }
            | ProviderEvent::DealActivationFailed { message }
            | ProviderEvent::DealCompletionFailed { message } => {
                deal.message = message.clone();
            }
            ProviderEvent::DealPublishInitiated { message_cid } => {
                deal.publish_cid = Some(*message_cid);
            }
            ProviderEvent::DealPublished { deal_id } => {
                deal.deal_id = *deal_id;
            }
            ProviderEvent::DealHandedOff => {
                if deal.fast_retrieval {
                    deal.available_for_retrieval = true;
                }
            }
            ProviderEvent::DealPrecommitted { sector_number } => {
                deal.sector_number = *sector_number;
            }
            _ => {}
        }
    }

    fn handle(
        env: Arc<E>,
        ctx: ProviderCtx<E>,
        deal: MinerDeal,
    ) -> BoxFuture<'static, Result<(), String>> {
        use StorageDealStatus as S;
        async move {
            match deal.state {
                S::Validating => validate_deal_proposal(&ctx, env.as_ref(), deal).await,
                S::AcceptWait => decide_on_proposal(&ctx, env.as_ref(), deal).await,
                S::Transferring => restart_data_transfer(&ctx, env, deal).await,
                S::VerifyData => verify_data(&ctx, env.as_ref(), deal).await,
                S::ReserveProviderFunds => reserve_provider_funds(&ctx, env.as_ref(), deal).await,
                S::ProviderFunding => wait_for_funding(&ctx, env.as_ref(), deal).await,
                S::Publish => publish_deal(&ctx, env.as_ref(), deal).await,
                S::Publishing => wait_for_publish(&ctx, env.as_ref(), deal).await,
                S::Staged => handoff_deal(&ctx, env.as_ref(), deal).await,
                S::AwaitingPreCommit => verify_deal_precommitted(&ctx, env, deal).await,
                S::Sealing => verify_deal_activated(&ctx, env, deal).await,
                S::Finalizing => cleanup_deal(&ctx, env.as_ref(), deal).await,
                S::Active => wait_for_deal_completion(&ctx, env, deal).await,
                S::Rejecting => reject_deal(&ctx, env.as_ref(), deal).await,
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

/// Runs the admission policy over a proposed deal. Every check failure
/// becomes a rejection carrying the check's reason.
async fn validate_deal_proposal<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    env.tag_peer(deal.client, &deal.proposal_cid.to_string());

    let reject = |reason: String| {
        ctx.trigger(ProviderEvent::DealRejected { reason });
    };

    let (tok, cur_epoch) = match env.node().get_chain_head().await {
        Ok(head) => head,
        Err(e) => {
            reject(format!("node error getting most recent state id: {}", e));
            return Ok(());
        }
    };

    if let Err(e) =
        providerutils::verify_proposal(env.node(), &deal.client_deal_proposal, &tok).await
    {
        reject(format!("verifying StorageDealProposal: {}", e));
        return Ok(());
    }

    let proposal = deal.proposal().clone();

    if proposal.provider != env.address() {
        reject("incorrect provider for deal".to_string());
        return Ok(());
    }

    if proposal.label.len() > DEAL_MAX_LABEL_SIZE {
        reject(format!(
            "deal label can be at most {} bytes, is {}",
            DEAL_MAX_LABEL_SIZE,
            proposal.label.len()
        ));
        return Ok(());
    }

    if let Err(e) = proposal.piece_size.validate() {
        reject(format!("proposal piece size is invalid: {}", e));
        return Ok(());
    }

    if !shared::is_piece_cid(&proposal.piece_cid) {
        reject("proposal PieceCID had wrong prefix".to_string());
        return Ok(());
    }

    if proposal.end_epoch <= proposal.start_epoch {
        reject("proposal end before proposal start".to_string());
        return Ok(());
    }

    if cur_epoch > proposal.start_epoch {
        reject("deal start epoch has already elapsed".to_string());
        return Ok(());
    }

    let (min_duration, max_duration) = deal_duration_bounds(proposal.piece_size);
    if proposal.duration() < min_duration || proposal.duration() > max_duration {
        reject(format!(
            "deal duration out of bounds (min, max, provided): {}, {}, {}",
            min_duration,
            max_duration,
            proposal.duration()
        ));
        return Ok(());
    }

    let (pc_min, pc_max) = match env
        .node()
        .deal_provider_collateral_bounds(proposal.piece_size, proposal.verified_deal)
        .await
    {
        Ok(bounds) => bounds,
        Err(e) => {
            reject(format!("node error getting collateral bounds: {}", e));
            return Ok(());
        }
    };
    if proposal.provider_collateral < pc_min {
        reject(format!(
            "proposed provider collateral below minimum: {} < {}",
            proposal.provider_collateral.atto(),
            pc_min.atto()
        ));
        return Ok(());
    }
    if proposal.provider_collateral > pc_max {
        reject(format!(
            "proposed provider collateral above maximum: {} > {}",
            proposal.provider_collateral.atto(),
            pc_max.atto()
        ));
        return Ok(());
    }

    let ask = env.ask().await;
    let ask_price = if proposal.verified_deal {
        ask.verified_price.clone()
    } else {
        ask.price.clone()
    };
    let min_price = TokenAmount::from_atto(
        ask_price.atto() * BigInt::from(proposal.piece_size.0) / BigInt::from(1u64 << 30),
    );
    if proposal.storage_price_per_epoch < min_price {
        reject(format!(
            "storage price per epoch less than asking price: {} < {}",
            proposal.storage_price_per_epoch.atto(),
            min_price.atto()
        ));
        return Ok(());
    }

    if proposal.piece_size.0 < ask.min_piece_size.0 {
        reject(format!(
            "piece size less than minimum required size: {} < {}",
            proposal.piece_size.0, ask.min_piece_size.0
        ));
        return Ok(());
    }
    if proposal.piece_size.0 > ask.max_piece_size.0 {
        reject(format!(
            "piece size more than maximum allowed size: {} > {}",
            proposal.piece_size.0, ask.max_piece_size.0
        ));
        return Ok(());
    }

    let client_market_balance = match env.node().get_balance(&proposal.client, &tok).await {
        Ok(balance) => balance,
        Err(e) => {
            reject(format!(
                "node error getting client market balance failed: {}",
                e
            ));
            return Ok(());
        }
    };
    // This doesn't guarantee the client won't withdraw or lock those funds,
    // but it's a decent first filter.
    if client_market_balance.available() < proposal.client_balance_requirement() {
        reject(format!(
            "clientMarketBalance.Available too small: {} < {}",
            client_market_balance.available().atto(),
            proposal.client_balance_requirement().atto()
        ));
        return Ok(());
    }

    if proposal.verified_deal {
        let data_cap = match env.node().get_data_cap(&proposal.client, &tok).await {
            Ok(cap) => cap,
            Err(e) => {
                reject(format!("node error fetching verified data cap: {}", e));
                return Ok(());
            }
        };
        let Some(data_cap) = data_cap else {
            reject(
                "node error fetching verified data cap: data cap missing -- client not verified"
                    .to_string(),
            );
            return Ok(());
        };
        if data_cap < BigInt::from(proposal.piece_size.0) {
            reject("verified deal DataCap too small for proposed piece size".to_string());
            return Ok(());
        }
    }

    ctx.trigger(ProviderEvent::DealDeciding);
    Ok(())
}

/// Consults the custom admission hook, then tells the client to send data.
async fn decide_on_proposal<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    match env.run_custom_decision_logic(&deal).await {
        Err(e) => {
            ctx.trigger(ProviderEvent::DealRejected {
                reason: format!("custom deal decision logic failed: {}", e),
            });
            return Ok(());
        }
        Ok((false, reason)) => {
            ctx.trigger(ProviderEvent::DealRejected { reason });
            return Ok(());
        }
        Ok((true, _)) => {}
    }

    if let Err(e) = env
        .send_signed_response(Response {
            state: StorageDealStatus::WaitingForData,
            message: String::new(),
            proposal: deal.proposal_cid,
            publish_message: None,
        })
        .await
    {
        ctx.trigger(ProviderEvent::SendResponseFailed { message: e });
        return Ok(());
    }

    if let Err(e) = env.disconnect(deal.proposal_cid).await {
        warn!("closing client connection: {}", e);
    }

    ctx.trigger(ProviderEvent::DataRequested);
    Ok(())
}

/// Resumes an interrupted inbound transfer. The restart call reads deal
/// state through the engine, so it runs off the handler task.
async fn restart_data_transfer<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: Arc<E>,
    deal: MinerDeal,
) -> Result<(), String> {
    let Some(channel_id) = deal.transfer_channel_id.clone() else {
        ctx.trigger(ProviderEvent::DataTransferRestartFailed {
            message: "channel id on provider deal is unset".to_string(),
        });
        return Ok(());
    };

    let ctx = ctx.clone();
    task::spawn(async move {
        if let Err(e) = env.restart_data_transfer(channel_id).await {
            ctx.trigger(ProviderEvent::DataTransferRestartFailed { message: e });
        }
    });
    Ok(())
}

/// Regenerates the piece commitment from the local store and compares it to
/// the proposal's.
async fn verify_data<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    let (piece_cid, metadata_path) = match env
        .generate_piece_commitment(deal.store_id, deal.data_ref.root)
        .await
    {
        Ok(generated) => generated,
        Err(e) => {
            ctx.trigger(ProviderEvent::DataVerificationFailed {
                message: format!("error generating CommP: {}", e),
                piece_path: String::new(),
                metadata_path: String::new(),
            });
            return Ok(());
        }
    };

    if piece_cid != deal.proposal().piece_cid {
        ctx.trigger(ProviderEvent::DataVerificationFailed {
            message: "proposal CommP doesn't match calculated CommP".to_string(),
            piece_path: String::new(),
            metadata_path,
        });
        return Ok(());
    }

    ctx.trigger(ProviderEvent::VerifiedData {
        piece_path: String::new(),
        metadata_path,
    });
    Ok(())
}

/// Reserves the provider collateral, waiting on chain only if a top-up
/// message was needed.
async fn reserve_provider_funds<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    let node = env.node();
    let proposal = deal.proposal();

    let (tok, _) = match node.get_chain_head().await {
        Ok(head) => head,
        Err(e) => {
            ctx.trigger(ProviderEvent::NodeErrored {
                message: format!("acquiring chain head: {}", e),
            });
            return Ok(());
        }
    };

    let worker = match node.get_miner_worker_address(&proposal.provider, &tok).await {
        Ok(addr) => addr,
        Err(e) => {
            ctx.trigger(ProviderEvent::NodeErrored {
                message: format!("looking up miner worker: {}", e),
            });
            return Ok(());
        }
    };

    let mcid = match node
        .reserve_funds(&worker, &proposal.provider, &proposal.provider_collateral)
        .await
    {
        Ok(mcid) => mcid,
        Err(e) => {
            ctx.trigger(ProviderEvent::NodeErrored {
                message: format!("reserving funds: {}", e),
            });
            return Ok(());
        }
    };

    ctx.trigger(ProviderEvent::FundsReserved {
        amount: proposal.provider_collateral.clone(),
    });

    // with no message sent the reservation was already satisfied
    match mcid {
        None => ctx.trigger(ProviderEvent::Funded),
        Some(mcid) => ctx.trigger(ProviderEvent::FundingInitiated { message_cid: mcid }),
    }
    Ok(())
}

/// Waits for the add-funds message to land on chain.
async fn wait_for_funding<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    let add_funds_cid = deal
        .add_funds_cid
        .ok_or_else(|| "no add funds message to wait for".to_string())?;
    match env.node().wait_for_message(&add_funds_cid).await {
        Err(e) => ctx.trigger(ProviderEvent::NodeErrored {
            message: format!("AddFunds errored: {}", e),
        }),
        Ok(receipt) if !receipt.exit_code.is_success() => {
            ctx.trigger(ProviderEvent::NodeErrored {
                message: format!("AddFunds exit code: {}", receipt.exit_code),
            })
        }
        Ok(_) => ctx.trigger(ProviderEvent::Funded),
    }
    Ok(())
}

async fn publish_deal<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    match env.node().publish_deals(&deal).await {
        Err(e) => ctx.trigger(ProviderEvent::NodeErrored {
            message: format!("publishing deal: {}", e),
        }),
        Ok(mcid) => ctx.trigger(ProviderEvent::DealPublishInitiated { message_cid: mcid }),
    }
    Ok(())
}

/// Waits for the publish message, extracts the allocated deal id and
/// returns the collateral reservation.
async fn wait_for_publish<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    let publish_cid = deal
        .publish_cid
        .ok_or_else(|| "no publish message to wait for".to_string())?;
    let receipt = match env.node().wait_for_message(&publish_cid).await {
        Ok(receipt) => receipt,
        Err(e) => {
            ctx.trigger(ProviderEvent::DealPublishError {
                message: format!("PublishStorageDeals errored: {}", e),
            });
            return Ok(());
        }
    };
    if !receipt.exit_code.is_success() {
        ctx.trigger(ProviderEvent::DealPublishError {
            message: format!("PublishStorageDeals exit code: {}", receipt.exit_code),
        });
        return Ok(());
    }
    let ret: PublishStorageDealsReturn =
        match fvm_ipld_encoding::from_slice(&receipt.return_data) {
            Ok(ret) => ret,
            Err(e) => {
                ctx.trigger(ProviderEvent::DealPublishError {
                    message: format!("PublishStorageDeals error unmarshalling result: {}", e),
                });
                return Ok(());
            }
        };
    let Some(deal_id) = ret.ids.first().copied() else {
        ctx.trigger(ProviderEvent::DealPublishError {
            message: "PublishStorageDeals returned no deal ids".to_string(),
        });
        return Ok(());
    };

    release_reserved_funds(ctx, env, &deal).await;

    ctx.trigger(ProviderEvent::DealPublished { deal_id });
    Ok(())
}

/// Hands the piece to the node for sealing and records retrieval metadata.
async fn handoff_deal<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    let packing = if !deal.piece_path.is_empty() {
        let file = match env.file_store().open(&deal.piece_path) {
            Ok(file) => file,
            Err(e) => {
                ctx.trigger(ProviderEvent::FileStoreErrored {
                    message: format!("reading piece at path {}: {}", deal.piece_path, e),
                });
                return Ok(());
            }
        };
        let size = file.size();
        let (reader, piece_size) = pad_reader(Box::new(file), size);
        env.node().on_deal_complete(&deal, piece_size, reader).await
    } else {
        let (reader, size) = match env.piece_reader(deal.store_id, deal.data_ref.root).await {
            Ok(got) => got,
            Err(e) => {
                ctx.trigger(ProviderEvent::DealHandoffFailed { message: e });
                return Ok(());
            }
        };
        let (reader, piece_size) = pad_reader(reader, size);
        env.node().on_deal_complete(&deal, piece_size, reader).await
    };

    let packing = match packing {
        Ok(packing) => packing,
        Err(e) => {
            ctx.trigger(ProviderEvent::DealHandoffFailed {
                message: e.to_string(),
            });
            return Ok(());
        }
    };

    if let Err(e) = record_piece(env, &deal, &packing) {
        error!("failed to register deal data for retrieval: {}", e);
        ctx.trigger(ProviderEvent::PieceStoreErrored { message: e });
    }

    ctx.trigger(ProviderEvent::DealHandedOff);
    Ok(())
}

fn record_piece<E: ProviderDealEnvironment>(
    env: &E,
    deal: &MinerDeal,
    packing: &crate::nodes::PackingResult,
) -> Result<(), String> {
    let block_locations = if !deal.metadata_path.is_empty() {
        load_block_locations(env.file_store(), &deal.metadata_path)
            .map_err(|e| format!("failed to load block locations: {}", e))?
    } else {
        let mut locations = HashMap::new();
        locations.insert(
            deal.data_ref.root,
            piecestore::BlockLocation {
                rel_offset: 0,
                block_size: 0,
            },
        );
        locations
    };

    let piece_cid = deal.proposal().piece_cid;
    env.piece_store()
        .add_piece_block_locations(&piece_cid, &block_locations)
        .map_err(|e| format!("failed to add piece block locations: {}", e))?;
    env.piece_store()
        .add_deal_for_piece(
            &piece_cid,
            DealInfo {
                deal_id: deal.deal_id,
                sector_id: packing.sector_number,
                offset: packing.offset,
                length: packing.size,
            },
        )
        .map_err(|e| format!("failed to add deal for piece: {}", e))?;
    Ok(())
}

/// Watches for the deal's sector pre-commit landing on chain.
async fn verify_deal_precommitted<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: Arc<E>,
    deal: MinerDeal,
) -> Result<(), String> {
    let ctx = ctx.clone();
    task::spawn(async move {
        let provider = deal.proposal().provider;
        match env
            .node()
            .wait_for_deal_sector_pre_commit(&provider, deal.deal_id)
            .await
        {
            Err(e) => ctx.trigger(ProviderEvent::DealPrecommitFailed {
                message: e.to_string(),
            }),
            // the pre-commit was missed or the deal activated while we were
            // away
            Ok(PreCommitStatus::AlreadyActive) => ctx.trigger(ProviderEvent::DealActivated),
            Ok(PreCommitStatus::PreCommitted(sector_number)) => {
                ctx.trigger(ProviderEvent::DealPrecommitted { sector_number })
            }
        }
    });
    Ok(())
}

/// Watches for the deal's sector commit landing on chain.
async fn verify_deal_activated<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: Arc<E>,
    deal: MinerDeal,
) -> Result<(), String> {
    let ctx = ctx.clone();
    task::spawn(async move {
        let provider = deal.proposal().provider;
        match env
            .node()
            .wait_for_deal_sector_commit(&provider, deal.deal_id, deal.sector_number)
            .await
        {
            Err(e) => ctx.trigger(ProviderEvent::DealActivationFailed {
                message: e.to_string(),
            }),
            Ok(()) => ctx.trigger(ProviderEvent::DealActivated),
        }
    });
    Ok(())
}

/// Clears staged files once the data sits in a sealed sector.
async fn cleanup_deal<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    if !deal.piece_path.is_empty() {
        if let Err(e) = env.file_store().delete(&deal.piece_path) {
            warn!("deleting piece at path {}: {}", deal.piece_path, e);
        }
    }
    if !deal.metadata_path.is_empty() {
        if let Err(e) = env.file_store().delete(&deal.metadata_path) {
            warn!("deleting piece at path {}: {}", deal.metadata_path, e);
        }
    }
    if let Some(store_id) = deal.store_id {
        if let Err(e) = env.delete_store(store_id) {
            warn!("deleting store {}: {}", store_id, e);
        }
    }
    ctx.trigger(ProviderEvent::Finalized);
    Ok(())
}

/// Subscribes to the deal's terminal chain outcome.
async fn wait_for_deal_completion<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: Arc<E>,
    deal: MinerDeal,
) -> Result<(), String> {
    // all the data has been committed, the connection no longer needs
    // protecting
    env.untag_peer(deal.client, &deal.proposal_cid.to_string());

    let ctx = ctx.clone();
    task::spawn(async move {
        match env.node().wait_for_deal_completion(deal.deal_id).await {
            Err(e) => ctx.trigger(ProviderEvent::DealCompletionFailed {
                message: format!("deal completion err: {}", e),
            }),
            Ok(DealCompletion::Expired) => ctx.trigger(ProviderEvent::DealExpired),
            Ok(DealCompletion::Slashed(epoch)) => {
                ctx.trigger(ProviderEvent::DealSlashed { epoch })
            }
        }
    });
    Ok(())
}

/// Sends the signed failure response before terminating the deal.
async fn reject_deal<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    if let Err(e) = env
        .send_signed_response(Response {
            state: StorageDealStatus::Failing,
            message: deal.message.clone(),
            proposal: deal.proposal_cid,
            publish_message: None,
        })
        .await
    {
        ctx.trigger(ProviderEvent::SendResponseFailed { message: e });
        return Ok(());
    }

    if let Err(e) = env.disconnect(deal.proposal_cid).await {
        warn!("closing client connection: {}", e);
    }

    ctx.trigger(ProviderEvent::RejectionSent);
    Ok(())
}

/// Releases every resource still held before entering the terminal error
/// state.
async fn fail_deal<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: MinerDeal,
) -> Result<(), String> {
    warn!("deal {} failed: {}", deal.proposal_cid, deal.message);

    env.untag_peer(deal.client, &deal.proposal_cid.to_string());

    if !deal.piece_path.is_empty() {
        if let Err(e) = env.file_store().delete(&deal.piece_path) {
            warn!("deleting piece at path {}: {}", deal.piece_path, e);
        }
    }
    if !deal.metadata_path.is_empty() {
        if let Err(e) = env.file_store().delete(&deal.metadata_path) {
            warn!("deleting piece at path {}: {}", deal.metadata_path, e);
        }
    }
    if let Some(store_id) = deal.store_id {
        if let Err(e) = env.delete_store(store_id) {
            warn!("deleting store id {}: {}", store_id, e);
        }
    }
    release_reserved_funds(ctx, env, &deal).await;

    ctx.trigger(ProviderEvent::Failed);
    Ok(())
}

async fn release_reserved_funds<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: &MinerDeal,
) {
    if !deal.funds_reserved.is_zero() {
        if let Err(e) = env
            .node()
            .release_funds(&deal.proposal().provider, &deal.funds_reserved)
            .await
        {
            // nonfatal
            warn!("failed to release funds: {}", e);
        }
        ctx.trigger(ProviderEvent::FundsReleased {
            amount: deal.funds_reserved.clone(),
        });
    }
}
