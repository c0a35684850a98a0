// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Retrieval client machine: propose over a pull channel, set up the
//! payment channel, answer payment requests with vouchers, verify
//! completion.

use crate::events::ClientEvent;
use crate::nodes::{RetrievalClientNode, VoucherError};
use crate::types::{ClientDealState, DealId, DealPayment, DealStatus, PaymentInfo};
use async_trait::async_trait;
use datatransfer::ChannelId;
use futures::future::BoxFuture;
use futures::FutureExt;
use fvm_shared::econ::TokenAmount;
use libp2p_identity::PeerId;
use log::warn;
use num_traits::Zero;
use statemachine::{Ctx, Machine, Transition};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::types::DealProposal;

/// States during which payment setup is still in flight; accounting events
/// arriving here accrue on the record without transitioning.
const PAYMENT_CHANNEL_CREATION_STATES: &[DealStatus] = &[
    DealStatus::WaitForAcceptance,
    DealStatus::WaitForAcceptanceLegacy,
    DealStatus::Accepted,
    DealStatus::PaymentChannelCreating,
    DealStatus::PaymentChannelAllocatingLane,
];

/// Dependencies needed to process retrieval client deals.
#[async_trait]
pub trait ClientDealEnvironment: Send + Sync + 'static {
    fn node(&self) -> &dyn RetrievalClientNode;

    /// Opens the pull channel carrying the proposal voucher.
    async fn open_data_transfer(
        &self,
        to: PeerId,
        proposal: &DealProposal,
        legacy: bool,
    ) -> Result<ChannelId, String>;

    async fn send_data_transfer_voucher(
        &self,
        channel_id: ChannelId,
        payment: &DealPayment,
        legacy: bool,
    ) -> Result<(), String>;

    /// Cancels the transfer channel.
    async fn close_data_transfer(&self, channel_id: ChannelId) -> Result<(), String>;
}

pub struct ClientDealMachine<E> {
    _env: PhantomData<E>,
}

pub type ClientCtx<E> = Ctx<ClientDealMachine<E>>;

impl<E: ClientDealEnvironment> Machine for ClientDealMachine<E> {
    type Key = DealId;
    type State = DealStatus;
    type Event = ClientEvent;
    type Record = ClientDealState;
    type Environment = E;

    fn key(record: &ClientDealState) -> DealId {
        record.proposal.id
    }

    fn state(record: &ClientDealState) -> DealStatus {
        record.status
    }

    fn set_state(record: &mut ClientDealState, state: DealStatus) {
        record.status = state;
    }

    fn is_final(state: DealStatus) -> bool {
        matches!(
            state,
            DealStatus::Completed
                | DealStatus::Errored
                | DealStatus::Rejected
                | DealStatus::Cancelled
                | DealStatus::DealNotFound
        )
    }

    fn plan(state: DealStatus, event: &ClientEvent) -> Option<Transition<DealStatus>> {
        use DealStatus as S;
        use Transition::*;
        match event {
            ClientEvent::Open => from(state, &[S::New], NoChange),
            ClientEvent::WriteDealProposalErrored { .. } => Some(To(S::Errored)),
            ClientEvent::DealProposed { .. } => match state {
                S::New => Some(To(S::WaitForAcceptance)),
                S::RetryLegacy => Some(To(S::WaitForAcceptanceLegacy)),
                _ => None,
            },
            ClientEvent::DealRejected { .. } => match state {
                S::WaitForAcceptance => Some(To(S::RetryLegacy)),
                S::WaitForAcceptanceLegacy => Some(To(S::Rejected)),
                _ => None,
            },
            ClientEvent::DealNotFound { .. } => from(
                state,
                &[S::WaitForAcceptance, S::WaitForAcceptanceLegacy],
                To(S::DealNotFound),
            ),
            ClientEvent::DealAccepted => from(
                state,
                &[S::WaitForAcceptance, S::WaitForAcceptanceLegacy],
                To(S::Accepted),
            ),
            ClientEvent::UnknownResponseReceived { .. } => Some(To(S::Failing)),
            ClientEvent::PaymentChannelErrored { .. } => from(
                state,
                &[
                    S::Accepted,
                    S::PaymentChannelCreating,
                    S::PaymentChannelAddingFunds,
                    S::CheckFunds,
                ],
                To(S::Failing),
            ),
            ClientEvent::PaymentChannelCreateInitiated { .. } => {
                from(state, &[S::Accepted], To(S::PaymentChannelCreating))
            }
            ClientEvent::PaymentChannelAddingFunds { .. } => match state {
                S::Accepted => Some(To(S::PaymentChannelAllocatingLane)),
                S::CheckFunds => Some(To(S::PaymentChannelAddingFunds)),
                _ => None,
            },
            ClientEvent::PaymentChannelReady { .. } => match state {
                // an already-funded channel skips the chain wait
                S::Accepted | S::PaymentChannelCreating => {
                    Some(To(S::PaymentChannelAllocatingLane))
                }
                S::PaymentChannelAddingFunds | S::CheckFunds => Some(To(S::Ongoing)),
                _ => None,
            },
            ClientEvent::AllocateLaneErrored { .. } => from(
                state,
                &[S::PaymentChannelAllocatingLane],
                To(S::Failing),
            ),
            ClientEvent::LaneAllocated { .. } => {
                from(state, &[S::PaymentChannelAllocatingLane], To(S::Ongoing))
            }
            ClientEvent::DataTransferError { .. } => Some(To(S::Errored)),
            ClientEvent::LastPaymentRequested { .. } => match state {
                S::Ongoing | S::FundsNeededLastPayment | S::FundsNeeded => {
                    Some(To(S::FundsNeededLastPayment))
                }
                S::BlocksComplete => Some(To(S::SendFundsLastPayment)),
                s if PAYMENT_CHANNEL_CREATION_STATES.contains(&s) => Some(JustRecord),
                _ => None,
            },
            ClientEvent::PaymentRequested { .. } => match state {
                S::Ongoing | S::BlocksComplete | S::FundsNeeded => Some(To(S::FundsNeeded)),
                s if PAYMENT_CHANNEL_CREATION_STATES.contains(&s) => Some(JustRecord),
                _ => None,
            },
            ClientEvent::UnsealPaymentRequested { .. } => from(
                state,
                &[S::WaitForAcceptance, S::WaitForAcceptanceLegacy],
                To(S::Accepted),
            ),
            ClientEvent::AllBlocksReceived => match state {
                S::Ongoing | S::BlocksComplete => Some(To(S::BlocksComplete)),
                S::FundsNeededLastPayment => Some(To(S::SendFundsLastPayment)),
                S::SendFunds | S::FundsNeeded => Some(JustRecord),
                s if PAYMENT_CHANNEL_CREATION_STATES.contains(&s) => Some(JustRecord),
                _ => None,
            },
            ClientEvent::BlocksReceived { .. } => match state {
                S::Ongoing | S::FundsNeeded | S::FundsNeededLastPayment => Some(NoChange),
                s if PAYMENT_CHANNEL_CREATION_STATES.contains(&s) => Some(JustRecord),
                _ => None,
            },
            ClientEvent::SendFunds => match state {
                S::FundsNeeded => Some(To(S::SendFunds)),
                S::FundsNeededLastPayment => Some(To(S::SendFundsLastPayment)),
                _ => None,
            },
            ClientEvent::FundsExpended { .. } => {
                from(state, &[S::CheckFunds], To(S::InsufficientFunds))
            }
            ClientEvent::BadPaymentRequested { .. } => from(
                state,
                &[S::SendFunds, S::SendFundsLastPayment],
                To(S::Failing),
            ),
            ClientEvent::CreateVoucherFailed { .. } => from(
                state,
                &[S::SendFunds, S::SendFundsLastPayment],
                To(S::Failing),
            ),
            ClientEvent::VoucherShortfall { .. } => from(
                state,
                &[S::SendFunds, S::SendFundsLastPayment],
                To(S::CheckFunds),
            ),
            ClientEvent::WriteDealPaymentErrored { .. } => Some(To(S::Errored)),
            ClientEvent::PaymentSent => match state {
                S::SendFunds => Some(To(S::Ongoing)),
                S::SendFundsLastPayment => Some(To(S::Finalizing)),
                _ => None,
            },
            ClientEvent::Complete => match state {
                S::Ongoing => Some(To(S::CheckComplete)),
                S::Finalizing => Some(To(S::Completed)),
                _ => None,
            },
            ClientEvent::CompleteVerified => from(state, &[S::CheckComplete], To(S::Completed)),
            ClientEvent::EarlyTermination => from(state, &[S::CheckComplete], To(S::Errored)),
            ClientEvent::CancelComplete => match state {
                S::Failing => Some(To(S::Errored)),
                S::Cancelling => Some(To(S::Cancelled)),
                _ => None,
            },
            ClientEvent::ProviderCancelled => match state {
                S::Failing | S::Cancelling => Some(JustRecord),
                _ => Some(To(S::Errored)),
            },
            ClientEvent::Cancel => Some(To(S::Cancelling)),
            ClientEvent::RecheckFunds => from(state, &[S::InsufficientFunds], To(S::CheckFunds)),
        }
    }

    fn apply(deal: &mut ClientDealState, event: &ClientEvent) {
        match event {
            ClientEvent::WriteDealProposalErrored { message } => {
                deal.message = format!("proposing deal: {}", message);
            }
            ClientEvent::DealProposed { channel_id } => {
                deal.channel_id = Some(channel_id.clone());
                deal.message = String::new();
            }
            ClientEvent::DealRejected { message } => {
                deal.message = format!("deal rejected: {}", message);
                deal.legacy_protocol = true;
            }
            ClientEvent::DealNotFound { message } => {
                deal.message = format!("deal not found: {}", message);
            }
            ClientEvent::UnknownResponseReceived { status } => {
                deal.message = format!("Unexpected deal response status: {}", status);
            }
            ClientEvent::PaymentChannelErrored { message } => {
                deal.message = format!("error from payment channel: {}", message);
            }
            ClientEvent::PaymentChannelCreateInitiated { message_cid } => {
                deal.wait_msg_cid = Some(*message_cid);
            }
            ClientEvent::PaymentChannelAddingFunds {
                message_cid,
                pay_ch,
            } => {
                deal.wait_msg_cid = Some(*message_cid);
                if deal.payment_info.is_none() {
                    deal.payment_info = Some(PaymentInfo {
                        pay_ch: *pay_ch,
                        lane: 0,
                    });
                }
            }
            ClientEvent::PaymentChannelReady { pay_ch } => {
                if deal.payment_info.is_none() {
                    deal.payment_info = Some(PaymentInfo {
                        pay_ch: *pay_ch,
                        lane: 0,
                    });
                }
                deal.wait_msg_cid = None;
                // clear any insufficient funds message
                deal.message = String::new();
            }
            ClientEvent::AllocateLaneErrored { message } => {
                deal.message = format!("allocating payment lane: {}", message);
            }
            ClientEvent::LaneAllocated { lane } => {
                if let Some(info) = deal.payment_info.as_mut() {
                    info.lane = *lane;
                }
            }
            ClientEvent::DataTransferError { message } => {
                deal.message = format!("error generated by data transfer: {}", message);
            }
            ClientEvent::LastPaymentRequested { payment_owed } => {
                deal.payment_requested = deal.payment_requested.clone() + payment_owed.clone();
                deal.last_payment_requested = true;
            }
            ClientEvent::PaymentRequested { payment_owed }
            | ClientEvent::UnsealPaymentRequested { payment_owed } => {
                deal.payment_requested = deal.payment_requested.clone() + payment_owed.clone();
            }
            ClientEvent::AllBlocksReceived => {
                deal.all_blocks_received = true;
            }
            ClientEvent::BlocksReceived { total_received } => {
                deal.total_received = *total_received;
            }
            ClientEvent::FundsExpended { shortfall } => {
                deal.message = format!(
                    "not enough current or pending funds in payment channel, shortfall of {}",
                    shortfall.atto()
                );
            }
            ClientEvent::BadPaymentRequested { message } => {
                deal.message = message.clone();
            }
            ClientEvent::CreateVoucherFailed { message } => {
                deal.message = format!("creating payment voucher: {}", message);
            }
            ClientEvent::WriteDealPaymentErrored { message } => {
                deal.message = format!("writing deal payment: {}", message);
            }
            ClientEvent::PaymentSent => {
                // paymentRequested = 0
                // fundsSpent = fundsSpent + paymentRequested
                // if paymentRequested / pricePerByte >= currentInterval
                // currentInterval = currentInterval + proposal.intervalIncrease
                // bytesPaidFor = bytesPaidFor + (paymentRequested / pricePerByte)
                deal.funds_spent = deal.funds_spent.clone() + deal.payment_requested.clone();

                let unseal_owed =
                    deal.params().unseal_price.clone() - deal.unseal_funds_paid.clone();
                let payment_for_unsealing = std::cmp::min(deal.payment_requested.clone(), unseal_owed);

                let price_per_byte = deal.params().price_per_byte.clone();
                let bytes_paid_for = if price_per_byte.is_zero() {
                    0
                } else {
                    let paid = (deal.payment_requested.atto() - payment_for_unsealing.atto())
                        / price_per_byte.atto();
                    u64::try_from(paid).unwrap_or(0)
                };
                if bytes_paid_for >= deal.current_interval {
                    deal.current_interval += deal.params().payment_interval_increase;
                }
                deal.bytes_paid_for += bytes_paid_for;
                deal.unseal_funds_paid =
                    deal.unseal_funds_paid.clone() + payment_for_unsealing;
                deal.payment_requested = TokenAmount::zero();
            }
            ClientEvent::EarlyTermination => {
                deal.message =
                    "Provider sent complete status without sending all data".to_string();
            }
            ClientEvent::ProviderCancelled => {
                if deal.status != DealStatus::Failing && deal.status != DealStatus::Cancelling {
                    deal.message = "Provider cancelled retrieval due to error".to_string();
                }
            }
            ClientEvent::Cancel => {
                deal.message = "Retrieval Cancelled".to_string();
            }
            _ => {}
        }
    }

    fn handle(
        env: Arc<E>,
        ctx: ClientCtx<E>,
        deal: ClientDealState,
    ) -> BoxFuture<'static, Result<(), String>> {
        use DealStatus as S;
        async move {
            match deal.status {
                S::New | S::RetryLegacy => propose_deal(&ctx, env.as_ref(), deal).await,
                S::Accepted => setup_payment_channel(&ctx, env.as_ref(), deal).await,
                S::PaymentChannelCreating | S::PaymentChannelAddingFunds => {
                    wait_payment_channel_ready(&ctx, env.as_ref(), deal).await
                }
                S::PaymentChannelAllocatingLane => allocate_lane(&ctx, env.as_ref(), deal).await,
                S::Ongoing => ongoing(&ctx, deal).await,
                S::FundsNeeded | S::FundsNeededLastPayment => {
                    process_payment_requested(&ctx, deal).await
                }
                S::SendFunds | S::SendFundsLastPayment => send_funds(&ctx, env.as_ref(), deal).await,
                S::CheckFunds => check_funds(&ctx, env.as_ref(), deal).await,
                S::Failing | S::Cancelling => cancel_deal(&ctx, env.as_ref(), deal).await,
                S::CheckComplete => check_complete(&ctx, deal).await,
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

/// Opens the pull channel with the proposal riding on it. Legacy providers
/// get the legacy voucher encoding.
async fn propose_deal<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDealState,
) -> Result<(), String> {
    match env
        .open_data_transfer(deal.sender, &deal.proposal, deal.legacy_protocol)
        .await
    {
        Err(e) => ctx.trigger(ClientEvent::WriteDealProposalErrored { message: e }),
        Ok(channel_id) => ctx.trigger(ClientEvent::DealProposed { channel_id }),
    }
    Ok(())
}

/// Starts payment channel setup; the node reports whether a create or
/// add-funds message is in flight.
async fn setup_payment_channel<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDealState,
) -> Result<(), String> {
    match env
        .node()
        .get_or_create_payment_channel(&deal.client_wallet, &deal.miner_wallet, &deal.total_funds)
        .await
    {
        Err(e) => ctx.trigger(ClientEvent::PaymentChannelErrored {
            message: e.to_string(),
        }),
        Ok((None, Some(message_cid))) => {
            ctx.trigger(ClientEvent::PaymentChannelCreateInitiated { message_cid })
        }
        Ok((Some(pay_ch), Some(message_cid))) => {
            ctx.trigger(ClientEvent::PaymentChannelAddingFunds {
                message_cid,
                pay_ch,
            })
        }
        Ok((Some(pay_ch), None)) => ctx.trigger(ClientEvent::PaymentChannelReady { pay_ch }),
        Ok((None, None)) => ctx.trigger(ClientEvent::PaymentChannelErrored {
            message: "node returned neither channel nor pending message".to_string(),
        }),
    }
    Ok(())
}

async fn wait_payment_channel_ready<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDealState,
) -> Result<(), String> {
    let message_cid = deal
        .wait_msg_cid
        .ok_or_else(|| "no payment channel message to wait for".to_string())?;
    match env.node().wait_for_payment_channel_ready(&message_cid).await {
        Err(e) => ctx.trigger(ClientEvent::PaymentChannelErrored {
            message: e.to_string(),
        }),
        Ok(pay_ch) => ctx.trigger(ClientEvent::PaymentChannelReady { pay_ch }),
    }
    Ok(())
}

async fn allocate_lane<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDealState,
) -> Result<(), String> {
    let pay_ch = deal
        .payment_info
        .as_ref()
        .map(|info| info.pay_ch)
        .ok_or_else(|| "allocating lane with no payment channel".to_string())?;
    match env.node().allocate_lane(&pay_ch).await {
        Err(e) => ctx.trigger(ClientEvent::AllocateLaneErrored {
            message: e.to_string(),
        }),
        Ok(lane) => ctx.trigger(ClientEvent::LaneAllocated { lane }),
    }
    Ok(())
}

/// Payments requested while the channel was being set up are routed now.
async fn ongoing<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    deal: ClientDealState,
) -> Result<(), String> {
    if deal.payment_requested.is_zero() {
        return Ok(());
    }
    if deal.last_payment_requested {
        ctx.trigger(ClientEvent::LastPaymentRequested {
            payment_owed: TokenAmount::zero(),
        });
    } else {
        ctx.trigger(ClientEvent::PaymentRequested {
            payment_owed: TokenAmount::zero(),
        });
    }
    Ok(())
}

/// Decides whether the requested payment is due yet.
async fn process_payment_requested<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    deal: ClientDealState,
) -> Result<(), String> {
    // pay when unsealing is owed, when the last payment was demanded, or
    // when the paid-for window has been consumed
    let unseal_owed = deal.params().unseal_price > deal.unseal_funds_paid;
    if unseal_owed
        || deal.last_payment_requested
        || deal.all_blocks_received
        || deal.total_received >= deal.current_interval
    {
        ctx.trigger(ClientEvent::SendFunds);
    }
    Ok(())
}

/// Creates and sends the voucher for everything currently owed.
async fn send_funds<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDealState,
) -> Result<(), String> {
    let Some(payment_info) = deal.payment_info.clone() else {
        return Err("sending funds with no payment channel".to_string());
    };

    // what the provider may legitimately demand at this point
    let retrieval_price = TokenAmount::from_atto(
        deal.params().price_per_byte.atto() * (deal.total_received - deal.bytes_paid_for),
    );
    let owed = retrieval_price
        + (deal.params().unseal_price.clone() - deal.unseal_funds_paid.clone());
    if deal.payment_requested > owed {
        ctx.trigger(ClientEvent::BadPaymentRequested {
            message: "too much money requested for bytes sent".to_string(),
        });
        return Ok(());
    }

    let voucher_amount = deal.funds_spent.clone() + deal.payment_requested.clone();
    let voucher = match env
        .node()
        .create_payment_voucher(&payment_info.pay_ch, &voucher_amount, payment_info.lane)
        .await
    {
        Ok(voucher) => voucher,
        Err(VoucherError::Shortfall(shortfall)) => {
            ctx.trigger(ClientEvent::VoucherShortfall { shortfall });
            return Ok(());
        }
        Err(e) => {
            ctx.trigger(ClientEvent::CreateVoucherFailed {
                message: e.to_string(),
            });
            return Ok(());
        }
    };

    let payment = DealPayment {
        id: deal.proposal.id,
        payment_channel: payment_info.pay_ch,
        payment_voucher: voucher,
    };
    let channel_id = deal
        .channel_id
        .clone()
        .ok_or_else(|| "sending payment with no open channel".to_string())?;
    if let Err(e) = env
        .send_data_transfer_voucher(channel_id, &payment, deal.legacy_protocol)
        .await
    {
        ctx.trigger(ClientEvent::WriteDealPaymentErrored { message: e });
        return Ok(());
    }

    ctx.trigger(ClientEvent::PaymentSent);
    Ok(())
}

/// Re-examines the channel after a shortfall or an external top-up.
async fn check_funds<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDealState,
) -> Result<(), String> {
    let Some(payment_info) = deal.payment_info.clone() else {
        return Err("checking funds with no payment channel".to_string());
    };
    let available = match env.node().check_available_funds(&payment_info.pay_ch).await {
        Ok(available) => available,
        Err(e) => {
            ctx.trigger(ClientEvent::PaymentChannelErrored {
                message: e.to_string(),
            });
            return Ok(());
        }
    };

    let unredeemed = available.confirmed_amt.clone() + available.pending_amt.clone()
        - available.voucher_redeemed_amt.clone();
    if deal.payment_requested > unredeemed {
        ctx.trigger(ClientEvent::FundsExpended {
            shortfall: deal.payment_requested.clone() - unredeemed,
        });
        return Ok(());
    }

    let confirmed_unredeemed =
        available.confirmed_amt - available.voucher_redeemed_amt;
    if deal.payment_requested > confirmed_unredeemed {
        match available.pending_wait_sentinel {
            Some(message_cid) => ctx.trigger(ClientEvent::PaymentChannelAddingFunds {
                message_cid,
                pay_ch: payment_info.pay_ch,
            }),
            None => ctx.trigger(ClientEvent::PaymentChannelErrored {
                message: "pending funds with no wait sentinel".to_string(),
            }),
        }
        return Ok(());
    }

    ctx.trigger(ClientEvent::PaymentChannelReady {
        pay_ch: payment_info.pay_ch,
    });
    Ok(())
}

/// Cancels the transfer channel, then finishes the failure or the user's
/// cancellation.
async fn cancel_deal<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    env: &E,
    deal: ClientDealState,
) -> Result<(), String> {
    if let Some(channel_id) = deal.channel_id.clone() {
        if let Err(e) = env.close_data_transfer(channel_id).await {
            warn!(
                "deal {}: closing data transfer channel: {}",
                deal.proposal.id, e
            );
        }
    }
    ctx.trigger(ClientEvent::CancelComplete);
    Ok(())
}

/// The provider claims completion; make sure every block actually arrived.
async fn check_complete<E: ClientDealEnvironment>(
    ctx: &ClientCtx<E>,
    deal: ClientDealState,
) -> Result<(), String> {
    if deal.all_blocks_received {
        ctx.trigger(ClientEvent::CompleteVerified);
    } else {
        ctx.trigger(ClientEvent::EarlyTermination);
    }
    Ok(())
}
