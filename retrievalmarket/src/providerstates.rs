// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Retrieval provider machine: admit a proposal against the ask, unseal
//! and charge for it, then meter data against interval payments.

use crate::events::ProviderEvent;
use crate::nodes::RetrievalProviderNode;
use crate::types::{
    Ask, DealResponse, DealStatus, ProviderDealIdentifier, ProviderDealState,
};
use async_trait::async_trait;
use datatransfer::ChannelId;
use futures::future::BoxFuture;
use futures::FutureExt;
use fvm_shared::econ::TokenAmount;
use log::warn;
use num_traits::Zero;
use piecestore::PieceInfo;
use statemachine::{Ctx, Machine, Transition};
use std::marker::PhantomData;
use std::sync::Arc;

/// Dependencies needed to process retrieval provider deals.
#[async_trait]
pub trait ProviderDealEnvironment: Send + Sync + 'static {
    fn node(&self) -> &dyn RetrievalProviderNode;

    async fn ask(&self) -> Ask;

    /// Locates the piece holding the payload, preferring `piece_cid` when
    /// the client pinned one. `Ok(None)` means the payload is unknown.
    async fn get_piece(
        &self,
        payload_cid: cid::Cid,
        piece_cid: Option<cid::Cid>,
    ) -> Result<Option<PieceInfo>, String>;

    /// Pluggable admission hook.
    async fn run_deal_decision_logic(
        &self,
        deal: &ProviderDealState,
    ) -> Result<(bool, String), String>;

    /// Sends a deal response as a voucher result on the transfer channel.
    async fn send_deal_response(
        &self,
        channel_id: ChannelId,
        response: &DealResponse,
        legacy: bool,
    ) -> Result<(), String>;

    /// Tells the transfer engine to start or resume sending payload data.
    async fn resume_data_transfer(&self, channel_id: ChannelId) -> Result<(), String>;
}

pub struct ProviderDealMachine<E> {
    _env: PhantomData<E>,
}

pub type ProviderCtx<E> = Ctx<ProviderDealMachine<E>>;

impl<E: ProviderDealEnvironment> Machine for ProviderDealMachine<E> {
    type Key = ProviderDealIdentifier;
    type State = DealStatus;
    type Event = ProviderEvent;
    type Record = ProviderDealState;
    type Environment = E;

    fn key(record: &ProviderDealState) -> ProviderDealIdentifier {
        record.identifier()
    }

    fn state(record: &ProviderDealState) -> DealStatus {
        record.status
    }

    fn set_state(record: &mut ProviderDealState, state: DealStatus) {
        record.status = state;
    }

    fn is_final(state: DealStatus) -> bool {
        matches!(
            state,
            DealStatus::Completed
                | DealStatus::Errored
                | DealStatus::Rejected
                | DealStatus::Cancelled
        )
    }

    fn plan(state: DealStatus, event: &ProviderEvent) -> Option<Transition<DealStatus>> {
        use DealStatus as S;
        use Transition::*;
        match event {
            ProviderEvent::Open => from(state, &[S::New], NoChange),
            ProviderEvent::DealRejected { .. } => from(state, &[S::New], To(S::Rejected)),
            ProviderEvent::DealNotFound { .. } => from(state, &[S::New], To(S::Rejected)),
            ProviderEvent::DealAccepted { .. } => from(state, &[S::New], To(S::DealReceived)),
            ProviderEvent::UnsealStarted => from(state, &[S::DealReceived], To(S::Unsealing)),
            ProviderEvent::UnsealError { .. } => from(state, &[S::Unsealing], To(S::Errored)),
            ProviderEvent::UnsealComplete => from(state, &[S::Unsealing], To(S::Unsealed)),
            ProviderEvent::BeginSending => from(state, &[S::Unsealed], To(S::Ongoing)),
            ProviderEvent::PaymentRequested { .. } => match state {
                S::Unsealed => Some(To(S::FundsNeededUnseal)),
                S::Ongoing => Some(To(S::FundsNeeded)),
                _ => None,
            },
            ProviderEvent::LastPaymentRequested { .. } => {
                from(state, &[S::BlocksComplete], To(S::FundsNeededLastPayment))
            }
            ProviderEvent::PaymentReceived { .. } => from(
                state,
                &[
                    S::FundsNeededUnseal,
                    S::FundsNeeded,
                    S::FundsNeededLastPayment,
                ],
                To(S::SendFunds),
            ),
            ProviderEvent::SaveVoucherFailed { .. } => from(state, &[S::SendFunds], To(S::Errored)),
            ProviderEvent::PaymentProcessed { .. } => from(state, &[S::SendFunds], To(S::Ongoing)),
            ProviderEvent::PartialPaymentProcessed { .. } => {
                from(state, &[S::SendFunds], To(S::FundsNeeded))
            }
            ProviderEvent::LastPaymentProcessed { .. } => {
                from(state, &[S::SendFunds], To(S::Finalizing))
            }
            ProviderEvent::BlocksSent { .. } => match state {
                // progress re-runs the interval check
                S::Ongoing => Some(NoChange),
                S::FundsNeeded | S::FundsNeededLastPayment | S::SendFunds => Some(JustRecord),
                _ => None,
            },
            ProviderEvent::AllBlocksSent => match state {
                S::Ongoing => Some(To(S::BlocksComplete)),
                S::FundsNeeded | S::FundsNeededLastPayment | S::SendFunds => Some(JustRecord),
                _ => None,
            },
            ProviderEvent::SendResponseFailed { .. } => Some(To(S::Errored)),
            ProviderEvent::Complete => from(state, &[S::BlocksComplete], To(S::Finalizing)),
            ProviderEvent::Finalized => from(state, &[S::Finalizing], To(S::Completed)),
            ProviderEvent::DataTransferErrored { .. } => Some(To(S::Errored)),
            ProviderEvent::ClientCancelled => Some(To(S::Cancelled)),
        }
    }

    fn apply(deal: &mut ProviderDealState, event: &ProviderEvent) {
        match event {
            ProviderEvent::DealRejected { reason } => {
                deal.message = format!("deal rejected: {}", reason);
            }
            ProviderEvent::DealNotFound { message } => {
                deal.message = format!("deal not found: {}", message);
            }
            ProviderEvent::DealAccepted { piece_info } => {
                deal.piece_info = Some(piece_info.clone());
            }
            ProviderEvent::UnsealError { message } => {
                deal.message = format!("unsealing piece: {}", message);
            }
            ProviderEvent::PaymentRequested { amount }
            | ProviderEvent::LastPaymentRequested { amount } => {
                deal.payment_owed = deal.payment_owed.clone() + amount.clone();
            }
            ProviderEvent::PaymentReceived {
                payment_channel,
                voucher,
            } => {
                deal.pending_payment = Some(crate::types::DealPayment {
                    id: deal.proposal.id,
                    payment_channel: *payment_channel,
                    payment_voucher: voucher.clone(),
                });
            }
            ProviderEvent::SaveVoucherFailed { message } => {
                deal.message = format!("saving payment voucher: {}", message);
            }
            ProviderEvent::PaymentProcessed { amount }
            | ProviderEvent::LastPaymentProcessed { amount } => {
                deal.funds_received = deal.funds_received.clone() + amount.clone();
                deal.payment_owed = TokenAmount::zero();
                deal.pending_payment = None;
                deal.current_interval += deal.proposal.params.payment_interval_increase;
            }
            ProviderEvent::PartialPaymentProcessed { amount } => {
                deal.funds_received = deal.funds_received.clone() + amount.clone();
                deal.payment_owed = if deal.payment_owed > *amount {
                    deal.payment_owed.clone() - amount.clone()
                } else {
                    TokenAmount::zero()
                };
                deal.pending_payment = None;
            }
            ProviderEvent::BlocksSent { total_sent } => {
                deal.total_sent = *total_sent;
            }
            ProviderEvent::AllBlocksSent => {
                deal.all_blocks_sent = true;
            }
            ProviderEvent::SendResponseFailed { message } => {
                deal.message = format!("sending deal response: {}", message);
            }
            ProviderEvent::DataTransferErrored { message } => {
                deal.message = format!("error generated by data transfer: {}", message);
            }
            ProviderEvent::ClientCancelled => {
                deal.message = "deal cancelled by client".to_string();
            }
            _ => {}
        }
    }

    fn handle(
        env: Arc<E>,
        ctx: ProviderCtx<E>,
        deal: ProviderDealState,
    ) -> BoxFuture<'static, Result<(), String>> {
        use DealStatus as S;
        async move {
            match deal.status {
                S::New => receive_deal(&ctx, env.as_ref(), deal).await,
                S::DealReceived => begin_unsealing(&ctx, deal).await,
                S::Unsealing => unseal_data(&ctx, env.as_ref(), deal).await,
                S::Unsealed => charge_for_unsealing(&ctx, env.as_ref(), deal).await,
                S::SendFunds => process_payment(&ctx, env.as_ref(), deal).await,
                S::Ongoing => ongoing(&ctx, env.as_ref(), deal).await,
                S::BlocksComplete => blocks_complete(&ctx, env.as_ref(), deal).await,
                S::Finalizing => finalize(&ctx, env.as_ref(), deal).await,
                _ => Ok(()),
            }
        }
        .boxed()
    }
}

fn from(
    state: DealStatus,
    allowed: &[DealStatus],
    transition: Transition<DealStatus>,
) -> Option<Transition<DealStatus>> {
    allowed.contains(&state).then_some(transition)
}

/// Admits or rejects a freshly proposed retrieval.
async fn receive_deal<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: ProviderDealState,
) -> Result<(), String> {
    let channel_id = deal
        .channel_id
        .clone()
        .ok_or_else(|| "proposed deal has no transfer channel".to_string())?;

    let reject = |event: ProviderEvent, response_status: DealStatus, message: String| {
        let response = DealResponse {
            status: response_status,
            id: deal.proposal.id,
            payment_owed: TokenAmount::zero(),
            message,
        };
        (event, response)
    };

    let piece = match env
        .get_piece(deal.proposal.payload_cid, deal.proposal.params.piece_cid)
        .await
    {
        Err(e) => {
            let (event, response) = reject(
                ProviderEvent::DealNotFound {
                    message: e.clone(),
                },
                DealStatus::DealNotFound,
                format!("deal not found: {}", e),
            );
            send_rejection(ctx, env, channel_id, deal.legacy_protocol, event, response).await;
            return Ok(());
        }
        Ok(None) => {
            let (event, response) = reject(
                ProviderEvent::DealNotFound {
                    message: "piece not found".to_string(),
                },
                DealStatus::DealNotFound,
                "deal not found: piece not found".to_string(),
            );
            send_rejection(ctx, env, channel_id, deal.legacy_protocol, event, response).await;
            return Ok(());
        }
        Ok(Some(piece)) => piece,
    };

    // the proposal must meet the provider's advertised terms
    let ask = env.ask().await;
    if let Err(reason) = check_deal_params(&deal, &ask) {
        let (event, response) = reject(
            ProviderEvent::DealRejected {
                reason: reason.clone(),
            },
            DealStatus::Rejected,
            format!("deal rejected: {}", reason),
        );
        send_rejection(ctx, env, channel_id, deal.legacy_protocol, event, response).await;
        return Ok(());
    }

    match env.run_deal_decision_logic(&deal).await {
        Err(e) => {
            let reason = format!("custom deal decision logic failed: {}", e);
            let (event, response) = reject(
                ProviderEvent::DealRejected {
                    reason: reason.clone(),
                },
                DealStatus::Rejected,
                format!("deal rejected: {}", reason),
            );
            send_rejection(ctx, env, channel_id, deal.legacy_protocol, event, response).await;
            return Ok(());
        }
        Ok((false, reason)) => {
            let (event, response) = reject(
                ProviderEvent::DealRejected {
                    reason: reason.clone(),
                },
                DealStatus::Rejected,
                format!("deal rejected: {}", reason),
            );
            send_rejection(ctx, env, channel_id, deal.legacy_protocol, event, response).await;
            return Ok(());
        }
        Ok((true, _)) => {}
    }

    let response = DealResponse {
        status: DealStatus::Accepted,
        id: deal.proposal.id,
        payment_owed: TokenAmount::zero(),
        message: String::new(),
    };
    if let Err(e) = env
        .send_deal_response(channel_id, &response, deal.legacy_protocol)
        .await
    {
        ctx.trigger(ProviderEvent::SendResponseFailed { message: e });
        return Ok(());
    }

    ctx.trigger(ProviderEvent::DealAccepted { piece_info: piece });
    Ok(())
}

fn check_deal_params(deal: &ProviderDealState, ask: &Ask) -> Result<(), String> {
    let params = deal.params();
    if params.price_per_byte < ask.price_per_byte {
        return Err(format!(
            "price per byte too low: {} < {}",
            params.price_per_byte.atto(),
            ask.price_per_byte.atto()
        ));
    }
    if params.payment_interval > ask.payment_interval {
        return Err(format!(
            "payment interval too large: {} > {}",
            params.payment_interval, ask.payment_interval
        ));
    }
    if params.payment_interval_increase > ask.payment_interval_increase {
        return Err(format!(
            "payment interval increase too large: {} > {}",
            params.payment_interval_increase, ask.payment_interval_increase
        ));
    }
    if params.unseal_price < ask.unseal_price {
        return Err(format!(
            "unseal price too small: {} < {}",
            params.unseal_price.atto(),
            ask.unseal_price.atto()
        ));
    }
    Ok(())
}

async fn send_rejection<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    channel_id: ChannelId,
    legacy: bool,
    event: ProviderEvent,
    response: DealResponse,
) {
    if let Err(e) = env.send_deal_response(channel_id, &response, legacy).await {
        warn!("sending rejection response: {}", e);
    }
    ctx.trigger(event);
}

async fn begin_unsealing<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    _deal: ProviderDealState,
) -> Result<(), String> {
    ctx.trigger(ProviderEvent::UnsealStarted);
    Ok(())
}

/// Unseals the sector region the piece sits in.
async fn unseal_data<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: ProviderDealState,
) -> Result<(), String> {
    let Some(piece_info) = deal.piece_info.clone() else {
        ctx.trigger(ProviderEvent::UnsealError {
            message: "no piece resolved for deal".to_string(),
        });
        return Ok(());
    };
    let Some(deal_info) = piece_info.deals.first() else {
        ctx.trigger(ProviderEvent::UnsealError {
            message: "piece has no deals on this provider".to_string(),
        });
        return Ok(());
    };
    match env
        .node()
        .unseal_sector(deal_info.sector_id, deal_info.offset, deal_info.length)
        .await
    {
        Err(e) => ctx.trigger(ProviderEvent::UnsealError {
            message: e.to_string(),
        }),
        Ok(()) => ctx.trigger(ProviderEvent::UnsealComplete),
    }
    Ok(())
}

/// Demands the unseal fee before any data flows, when one is set.
async fn charge_for_unsealing<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: ProviderDealState,
) -> Result<(), String> {
    let unseal_price = deal.params().unseal_price.clone();
    if unseal_price.is_zero() {
        ctx.trigger(ProviderEvent::BeginSending);
        return Ok(());
    }

    let channel_id = deal
        .channel_id
        .clone()
        .ok_or_else(|| "deal has no transfer channel".to_string())?;
    let response = DealResponse {
        status: DealStatus::FundsNeededUnseal,
        id: deal.proposal.id,
        payment_owed: unseal_price.clone(),
        message: String::new(),
    };
    if let Err(e) = env
        .send_deal_response(channel_id, &response, deal.legacy_protocol)
        .await
    {
        ctx.trigger(ProviderEvent::SendResponseFailed { message: e });
        return Ok(());
    }
    ctx.trigger(ProviderEvent::PaymentRequested {
        amount: unseal_price,
    });
    Ok(())
}

/// Redeems a received payment voucher against what is owed.
async fn process_payment<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: ProviderDealState,
) -> Result<(), String> {
    // the voucher to process is the most recent payment event's
    let Some(payment) = deal.pending_payment.clone() else {
        return Err("processing payment with no pending voucher".to_string());
    };

    let received = match env
        .node()
        .save_payment_voucher(
            &payment.payment_channel,
            &payment.payment_voucher,
            &deal.payment_owed,
        )
        .await
    {
        Err(e) => {
            ctx.trigger(ProviderEvent::SaveVoucherFailed {
                message: e.to_string(),
            });
            return Ok(());
        }
        Ok(received) => received,
    };

    if received < deal.payment_owed {
        // partial payment; keep waiting with an updated demand
        let channel_id = deal
            .channel_id
            .clone()
            .ok_or_else(|| "deal has no transfer channel".to_string())?;
        let still_owed = deal.payment_owed.clone() - received.clone();
        let response = DealResponse {
            status: DealStatus::FundsNeeded,
            id: deal.proposal.id,
            payment_owed: still_owed,
            message: String::new(),
        };
        if let Err(e) = env
            .send_deal_response(channel_id, &response, deal.legacy_protocol)
            .await
        {
            ctx.trigger(ProviderEvent::SendResponseFailed { message: e });
            return Ok(());
        }
        ctx.trigger(ProviderEvent::PartialPaymentProcessed { amount: received });
        return Ok(());
    }

    if deal.all_blocks_sent {
        ctx.trigger(ProviderEvent::LastPaymentProcessed { amount: received });
    } else {
        ctx.trigger(ProviderEvent::PaymentProcessed { amount: received });
    }
    Ok(())
}

/// Meters sent data against the interval and demands payment when the
/// unpaid window fills.
async fn ongoing<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: ProviderDealState,
) -> Result<(), String> {
    if let Some(channel_id) = deal.channel_id.clone() {
        // make sure the engine is not left paused after a payment
        if let Err(e) = env.resume_data_transfer(channel_id).await {
            warn!("deal {}: resuming data transfer: {}", deal.proposal.id, e);
        }
    }

    let owed = owed_for_data(&deal);
    if !owed.is_zero() && deal.total_sent >= deal.current_interval {
        let channel_id = deal
            .channel_id
            .clone()
            .ok_or_else(|| "deal has no transfer channel".to_string())?;
        let response = DealResponse {
            status: DealStatus::FundsNeeded,
            id: deal.proposal.id,
            payment_owed: owed.clone(),
            message: String::new(),
        };
        if let Err(e) = env
            .send_deal_response(channel_id, &response, deal.legacy_protocol)
            .await
        {
            ctx.trigger(ProviderEvent::SendResponseFailed { message: e });
            return Ok(());
        }
        ctx.trigger(ProviderEvent::PaymentRequested { amount: owed });
    }
    Ok(())
}

/// Everything has been sent; demand the outstanding balance or finish.
async fn blocks_complete<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: ProviderDealState,
) -> Result<(), String> {
    let owed = owed_for_data(&deal);
    if owed.is_zero() {
        ctx.trigger(ProviderEvent::Complete);
        return Ok(());
    }

    let channel_id = deal
        .channel_id
        .clone()
        .ok_or_else(|| "deal has no transfer channel".to_string())?;
    let response = DealResponse {
        status: DealStatus::FundsNeededLastPayment,
        id: deal.proposal.id,
        payment_owed: owed.clone(),
        message: String::new(),
    };
    if let Err(e) = env
        .send_deal_response(channel_id, &response, deal.legacy_protocol)
        .await
    {
        ctx.trigger(ProviderEvent::SendResponseFailed { message: e });
        return Ok(());
    }
    ctx.trigger(ProviderEvent::LastPaymentRequested { amount: owed });
    Ok(())
}

/// Confirms completion to the client.
async fn finalize<E: ProviderDealEnvironment>(
    ctx: &ProviderCtx<E>,
    env: &E,
    deal: ProviderDealState,
) -> Result<(), String> {
    let channel_id = deal
        .channel_id
        .clone()
        .ok_or_else(|| "deal has no transfer channel".to_string())?;
    let response = DealResponse {
        status: DealStatus::Completed,
        id: deal.proposal.id,
        payment_owed: TokenAmount::zero(),
        message: String::new(),
    };
    if let Err(e) = env
        .send_deal_response(channel_id, &response, deal.legacy_protocol)
        .await
    {
        ctx.trigger(ProviderEvent::SendResponseFailed { message: e });
        return Ok(());
    }
    ctx.trigger(ProviderEvent::Finalized);
    Ok(())
}

/// Charge for everything sent so far, minus what has been paid beyond the
/// unseal fee.
fn owed_for_data(deal: &ProviderDealState) -> TokenAmount {
    let params = deal.params();
    let total_charge = TokenAmount::from_atto(
        params.price_per_byte.atto() * deal.total_sent + params.unseal_price.atto(),
    );
    if total_charge > deal.funds_received {
        total_charge - deal.funds_received.clone()
    } else {
        TokenAmount::zero()
    }
}
