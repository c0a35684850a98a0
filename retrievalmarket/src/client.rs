// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The retrieval client: finds providers, queries availability, then runs
//! proposal, payment and verification through the client deal machine.

use crate::clientstates::{ClientDealEnvironment, ClientDealMachine};
use crate::events::ClientEvent;
use crate::migrations::client_migrations;
use crate::network::{Query, QueryResponse, RetrievalMarketNetwork};
use crate::nodes::RetrievalClientNode;
use crate::types::{
    ClientDealState, DealId, DealPayment, DealProposal, DealResponse, DealStatus, Params,
    QueryParams, RetrievalPeer, DEAL_PAYMENT_TYPE, DEAL_PROPOSAL_TYPE, DEAL_RESPONSE_TYPE,
};
use crate::PeerResolver;
use async_std::task;
use async_trait::async_trait;
use cid::Cid;
use datatransfer::{ChannelEvent, ChannelId, DataTransfer, Event, Voucher};
use db::{Store, StoredCounter};
use flo_stream::Subscriber;
use futures::StreamExt;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use libp2p_identity::PeerId;
use log::{debug, error};
use num_traits::Zero;
use statemachine::StateGroup;
use std::sync::Arc;

const CLIENT_DEALS_NS: &str = "/deals/client";
const DEAL_COUNTER_KEY: &str = "/retrieval/client/dealcounter";

struct ClientEnv {
    node: Arc<dyn RetrievalClientNode>,
    dt: Arc<dyn DataTransfer>,
}

#[async_trait]
impl ClientDealEnvironment for ClientEnv {
    fn node(&self) -> &dyn RetrievalClientNode {
        self.node.as_ref()
    }

    async fn open_data_transfer(
        &self,
        to: PeerId,
        proposal: &DealProposal,
        _legacy: bool,
    ) -> Result<ChannelId, String> {
        let voucher =
            Voucher::new(DEAL_PROPOSAL_TYPE, proposal).map_err(|e| e.to_string())?;
        self.dt
            .open_pull_channel(
                to,
                voucher,
                proposal.payload_cid,
                proposal.params.selector.clone(),
            )
            .await
            .map_err(|e| e.to_string())
    }

    async fn send_data_transfer_voucher(
        &self,
        channel_id: ChannelId,
        payment: &DealPayment,
        _legacy: bool,
    ) -> Result<(), String> {
        let voucher = Voucher::new(DEAL_PAYMENT_TYPE, payment).map_err(|e| e.to_string())?;
        self.dt
            .send_voucher(channel_id, voucher)
            .await
            .map_err(|e| e.to_string())
    }

    async fn close_data_transfer(&self, channel_id: ChannelId) -> Result<(), String> {
        self.dt
            .close_channel(channel_id)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Terms for a new retrieval.
pub struct RetrieveParams {
    pub payload_cid: Cid,
    pub params: Params,
    /// Upper bound on what this retrieval may spend.
    pub total_funds: TokenAmount,
    pub peer: RetrievalPeer,
    pub client_wallet: Address,
    pub miner_wallet: Address,
    pub store_id: Option<u64>,
}

/// The client side of the retrieval market.
pub struct RetrievalClient<DB: Store + Send + Sync + Clone + 'static> {
    deals: StateGroup<ClientDealMachine<ClientEnv>, DB>,
    net: Arc<dyn RetrievalMarketNetwork>,
    resolver: Arc<dyn PeerResolver>,
    counter: StoredCounter<DB>,
}

impl<DB: Store + Send + Sync + Clone + 'static> RetrievalClient<DB> {
    /// Migrates persisted deals, resumes their machines and wires the
    /// data-transfer adapter.
    pub async fn new(
        db: DB,
        node: Arc<dyn RetrievalClientNode>,
        net: Arc<dyn RetrievalMarketNetwork>,
        dt: Arc<dyn DataTransfer>,
        resolver: Arc<dyn PeerResolver>,
    ) -> Result<Self, statemachine::Error> {
        client_migrations().migrate(&db, CLIENT_DEALS_NS)?;

        let env = Arc::new(ClientEnv {
            node,
            dt: dt.clone(),
        });
        let deals = StateGroup::resume(db.clone(), CLIENT_DEALS_NS, env).await?;

        let events = dt.subscribe().await;
        task::spawn(data_transfer_subscriber(deals.clone(), events));

        Ok(RetrievalClient {
            deals,
            net,
            resolver,
            counter: StoredCounter::new(db, DEAL_COUNTER_KEY),
        })
    }

    /// Providers that may be able to serve the payload.
    pub fn find_providers(&self, payload_cid: &Cid) -> Vec<RetrievalPeer> {
        match self.resolver.get_peers(payload_cid) {
            Ok(peers) => peers,
            Err(e) => {
                error!("failed to get peers: {}", e);
                Vec::new()
            }
        }
    }

    /// Asks one provider whether and on what terms it can serve a payload.
    pub async fn query(
        &self,
        peer: &RetrievalPeer,
        payload_cid: Cid,
        params: QueryParams,
    ) -> Result<QueryResponse, String> {
        let mut stream = self
            .net
            .new_query_stream(peer.id)
            .await
            .map_err(|e| e.to_string())?;
        if let Err(e) = stream
            .write_query(Query {
                payload_cid,
                params,
            })
            .await
        {
            let _ = stream.close().await;
            return Err(e.to_string());
        }
        let response = stream.read_query_response().await.map_err(|e| e.to_string());
        let _ = stream.close().await;
        response
    }

    /// Starts a retrieval deal, returning the id it is tracked under.
    pub async fn retrieve(&self, params: RetrieveParams) -> Result<DealId, String> {
        let deal_id = self.counter.next().map_err(|e| e.to_string())?;
        let deal = ClientDealState {
            proposal: DealProposal {
                payload_cid: params.payload_cid,
                id: deal_id,
                params: params.params.clone(),
            },
            status: DealStatus::New,
            sender: params.peer.id,
            client_wallet: params.client_wallet,
            miner_wallet: params.miner_wallet,
            total_funds: params.total_funds,
            payment_info: None,
            total_received: 0,
            message: String::new(),
            bytes_paid_for: 0,
            current_interval: params.params.payment_interval,
            payment_requested: TokenAmount::zero(),
            funds_spent: TokenAmount::zero(),
            unseal_funds_paid: TokenAmount::zero(),
            wait_msg_cid: None,
            all_blocks_received: false,
            last_payment_requested: false,
            channel_id: None,
            legacy_protocol: false,
            store_id: params.store_id,
        };

        self.deals.begin(deal).await.map_err(|e| e.to_string())?;
        self.deals
            .send(&deal_id, ClientEvent::Open)
            .await
            .map_err(|e| e.to_string())?;
        Ok(deal_id)
    }

    /// Kicks every deal stalled on this channel's balance back into a funds
    /// check, typically after an external top-up landed.
    pub async fn try_restart_insufficient_funds(
        &self,
        payment_channel: Address,
    ) -> Result<(), String> {
        for deal in self.deals.list().await.map_err(|e| e.to_string())? {
            if deal.status == DealStatus::InsufficientFunds
                && deal
                    .payment_info
                    .as_ref()
                    .is_some_and(|info| info.pay_ch == payment_channel)
            {
                self.deals
                    .send(&deal.proposal.id, ClientEvent::RecheckFunds)
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    /// Cancels an in-progress retrieval.
    pub async fn cancel_deal(&self, deal_id: DealId) -> Result<(), String> {
        self.deals
            .send(&deal_id, ClientEvent::Cancel)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn get_deal(&self, deal_id: DealId) -> Result<ClientDealState, statemachine::Error> {
        self.deals.get(&deal_id).await
    }

    pub async fn list_deals(&self) -> Result<Vec<ClientDealState>, statemachine::Error> {
        self.deals.list().await
    }

    /// Subscribes to `(event, post-state)` notifications for every
    /// retrieval the client runs.
    pub async fn subscribe(&self) -> Subscriber<(ClientEvent, ClientDealState)> {
        self.deals.subscribe().await
    }
}

/// Routes transfer-engine events on retrieval pull channels into the
/// client machine.
async fn data_transfer_subscriber<DB: Store + Send + Sync + 'static>(
    deals: StateGroup<ClientDealMachine<ClientEnv>, DB>,
    mut events: Subscriber<ChannelEvent>,
) {
    while let Some(ChannelEvent {
        voucher, event, ..
    }) = events.next().await
    {
        let Ok(proposal) = voucher.decode::<DealProposal>(DEAL_PROPOSAL_TYPE) else {
            continue;
        };
        let deal_id = proposal.id;

        let machine_event = match event {
            Event::DataReceived { total_received } => {
                ClientEvent::BlocksReceived { total_received }
            }
            Event::FinishedTransferring => ClientEvent::AllBlocksReceived,
            Event::VoucherResultReceived(result) => {
                let Ok(response) = result.decode::<DealResponse>(DEAL_RESPONSE_TYPE) else {
                    debug!("deal {}: undecodable voucher result", deal_id);
                    continue;
                };
                response_event(response)
            }
            Event::Completed => ClientEvent::Complete,
            Event::Cancelled => ClientEvent::ProviderCancelled,
            Event::Errored(message) => ClientEvent::DataTransferError { message },
            Event::Opened
            | Event::Restarted
            | Event::DataSent { .. }
            | Event::VoucherReceived(_) => continue,
        };

        if let Err(e) = deals.send(&deal_id, machine_event).await {
            debug!(
                "data transfer event for unknown retrieval deal {}: {}",
                deal_id, e
            );
        }
    }
}

/// Maps a provider response to the event the table declares for its
/// status.
fn response_event(response: DealResponse) -> ClientEvent {
    match response.status {
        DealStatus::Accepted => ClientEvent::DealAccepted,
        DealStatus::Rejected => ClientEvent::DealRejected {
            message: response.message,
        },
        DealStatus::DealNotFound => ClientEvent::DealNotFound {
            message: response.message,
        },
        DealStatus::FundsNeededUnseal => ClientEvent::UnsealPaymentRequested {
            payment_owed: response.payment_owed,
        },
        DealStatus::FundsNeeded => ClientEvent::PaymentRequested {
            payment_owed: response.payment_owed,
        },
        DealStatus::FundsNeededLastPayment => ClientEvent::LastPaymentRequested {
            payment_owed: response.payment_owed,
        },
        DealStatus::Completed => ClientEvent::Complete,
        status => ClientEvent::UnknownResponseReceived { status },
    }
}
