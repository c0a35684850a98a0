// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The retrieval provider: answers availability queries and serves
//! retrievals proposed as vouchers on inbound pull channels.

use crate::askstore::AskStore;
use crate::events::ProviderEvent;
use crate::migrations::provider_migrations;
use crate::network::{
    QueryResponse, RetrievalMarketNetwork, RetrievalQueryStream, RetrievalReceiver,
};
use crate::nodes::RetrievalProviderNode;
use crate::providerstates::{ProviderDealEnvironment, ProviderDealMachine};
use crate::types::{
    Ask, DealPayment, DealProposal, DealResponse, DealStatus, ProviderDealIdentifier,
    ProviderDealState, QueryItemStatus, QueryResponseStatus, DEAL_PAYMENT_TYPE,
    DEAL_PROPOSAL_TYPE, DEAL_RESPONSE_TYPE,
};
use async_std::task;
use async_trait::async_trait;
use cid::Cid;
use datatransfer::{ChannelEvent, ChannelId, DataTransfer, Event, Voucher};
use db::Store;
use flo_stream::Subscriber;
use futures::StreamExt;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use log::{debug, error, warn};
use num_traits::Zero;
use piecestore::{PieceInfo, PieceStore};
use statemachine::StateGroup;
use std::sync::Arc;

const PROVIDER_DEALS_NS: &str = "/deals/provider";

/// Pluggable admission hook for retrievals.
pub type DealDecider =
    Arc<dyn Fn(&ProviderDealState) -> Result<(bool, String), String> + Send + Sync + 'static>;

pub(crate) struct ProviderEnv<DB> {
    node: Arc<dyn RetrievalProviderNode>,
    dt: Arc<dyn DataTransfer>,
    piece_store: Arc<dyn PieceStore>,
    ask_store: AskStore<DB>,
    decider: Option<DealDecider>,
}

#[async_trait]
impl<DB: Store + Send + Sync + 'static> ProviderDealEnvironment for ProviderEnv<DB> {
    fn node(&self) -> &dyn RetrievalProviderNode {
        self.node.as_ref()
    }

    async fn ask(&self) -> Ask {
        self.ask_store.get()
    }

    async fn get_piece(
        &self,
        payload_cid: Cid,
        piece_cid: Option<Cid>,
    ) -> Result<Option<PieceInfo>, String> {
        lookup_piece(self.piece_store.as_ref(), payload_cid, piece_cid)
    }

    async fn run_deal_decision_logic(
        &self,
        deal: &ProviderDealState,
    ) -> Result<(bool, String), String> {
        match &self.decider {
            None => Ok((true, String::new())),
            Some(decider) => decider(deal),
        }
    }

    async fn send_deal_response(
        &self,
        channel_id: ChannelId,
        response: &DealResponse,
        _legacy: bool,
    ) -> Result<(), String> {
        let voucher = Voucher::new(DEAL_RESPONSE_TYPE, response).map_err(|e| e.to_string())?;
        self.dt
            .send_voucher_result(channel_id, voucher)
            .await
            .map_err(|e| e.to_string())
    }

    async fn resume_data_transfer(&self, channel_id: ChannelId) -> Result<(), String> {
        self.dt
            .restart_channel(channel_id)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Finds the piece serving a payload, honoring a client-pinned piece cid.
fn lookup_piece(
    piece_store: &dyn PieceStore,
    payload_cid: Cid,
    piece_cid: Option<Cid>,
) -> Result<Option<PieceInfo>, String> {
    let cid_info = match piece_store.get_cid_info(&payload_cid) {
        Ok(info) => info,
        Err(piecestore::Error::NotFound) => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };
    for location in &cid_info.piece_block_locations {
        if piece_cid.is_some_and(|pinned| pinned != location.piece_cid) {
            continue;
        }
        match piece_store.get_piece_info(&location.piece_cid) {
            Ok(info) => return Ok(Some(info)),
            Err(piecestore::Error::NotFound) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(None)
}

/// The provider side of the retrieval market.
pub struct RetrievalProvider<DB: Store + Send + Sync + Clone + 'static> {
    env: Arc<ProviderEnv<DB>>,
    deals: StateGroup<ProviderDealMachine<ProviderEnv<DB>>, DB>,
    net: Arc<dyn RetrievalMarketNetwork>,
    miner: Address,
}

impl<DB: Store + Send + Sync + Clone + 'static> RetrievalProvider<DB> {
    /// Migrates persisted deals, resumes their machines and wires the
    /// data-transfer adapter. Call [`RetrievalProvider::start`] to serve
    /// queries.
    pub async fn new(
        db: DB,
        miner: Address,
        node: Arc<dyn RetrievalProviderNode>,
        net: Arc<dyn RetrievalMarketNetwork>,
        dt: Arc<dyn DataTransfer>,
        piece_store: Arc<dyn PieceStore>,
        decider: Option<DealDecider>,
    ) -> Result<Self, statemachine::Error> {
        provider_migrations().migrate(&db, PROVIDER_DEALS_NS)?;

        let ask_store = AskStore::new(db.clone())?;
        let env = Arc::new(ProviderEnv {
            node,
            dt: dt.clone(),
            piece_store,
            ask_store,
            decider,
        });
        let deals = StateGroup::resume(db, PROVIDER_DEALS_NS, env.clone()).await?;

        let events = dt.subscribe().await;
        task::spawn(data_transfer_subscriber(deals.clone(), events));

        Ok(RetrievalProvider {
            env,
            deals,
            net,
            miner,
        })
    }

    /// Begins answering availability queries.
    pub async fn start(self: &Arc<Self>) -> Result<(), String> {
        self.net
            .set_delegate(self.clone())
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn stop(&self) -> Result<(), String> {
        self.net
            .stop_handling_requests()
            .await
            .map_err(|e| e.to_string())
    }

    pub fn get_ask(&self) -> Ask {
        self.env.ask_store.get()
    }

    pub fn set_ask(&self, ask: Ask) {
        if let Err(e) = self.env.ask_store.set(ask) {
            warn!("error setting retrieval ask: {}", e);
        }
    }

    pub async fn get_deal(
        &self,
        identifier: &ProviderDealIdentifier,
    ) -> Result<ProviderDealState, statemachine::Error> {
        self.deals.get(identifier).await
    }

    pub async fn list_deals(&self) -> Result<Vec<ProviderDealState>, statemachine::Error> {
        self.deals.list().await
    }

    /// Subscribes to `(event, post-state)` notifications for every
    /// retrieval served.
    pub async fn subscribe(&self) -> Subscriber<(ProviderEvent, ProviderDealState)> {
        self.deals.subscribe().await
    }
}

#[async_trait]
impl<DB: Store + Send + Sync + Clone + 'static> RetrievalReceiver for RetrievalProvider<DB> {
    /// Answers availability and pricing for one payload; the connection
    /// lasts only for the exchange.
    async fn handle_query_stream(&self, mut stream: Box<dyn RetrievalQueryStream>) {
        let query = match stream.read_query().await {
            Ok(query) => query,
            Err(e) => {
                warn!("reading retrieval query: {}", e);
                return;
            }
        };

        let ask = self.env.ask_store.get();
        let mut answer = QueryResponse {
            status: QueryResponseStatus::Unavailable,
            piece_cid_found: QueryItemStatus::Unavailable,
            size: 0,
            payment_address: Address::new_id(0),
            min_price_per_byte: ask.price_per_byte,
            max_payment_interval: ask.payment_interval,
            max_payment_interval_increase: ask.payment_interval_increase,
            message: String::new(),
            unseal_price: ask.unseal_price,
        };

        match self.payment_address().await {
            Err(e) => {
                error!("retrieval query: lookup payment address: {}", e);
                answer.status = QueryResponseStatus::Error;
                answer.message = e;
            }
            Ok(payment_address) => {
                answer.payment_address = payment_address;
                match lookup_piece(
                    self.env.piece_store.as_ref(),
                    query.payload_cid,
                    query.params.piece_cid,
                ) {
                    Ok(Some(piece_info)) => {
                        if let Some(deal) = piece_info.deals.first() {
                            answer.status = QueryResponseStatus::Available;
                            answer.piece_cid_found = QueryItemStatus::Available;
                            answer.size = deal.length.0;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("retrieval query: piece lookup: {}", e);
                        answer.status = QueryResponseStatus::Error;
                        answer.message = e;
                    }
                }
            }
        }

        if let Err(e) = stream.write_query_response(answer).await {
            error!("retrieval query: writing response: {}", e);
        }
        let _ = stream.close().await;
    }
}

impl<DB: Store + Send + Sync + Clone + 'static> RetrievalProvider<DB> {
    async fn payment_address(&self) -> Result<Address, String> {
        let (tok, _) = self
            .env
            .node
            .get_chain_head()
            .await
            .map_err(|e| e.to_string())?;
        self.env
            .node
            .get_miner_worker_address(&self.miner, &tok)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Routes transfer-engine events into the provider machine; a pull channel
/// opening with a retrieval proposal voucher admits a new deal.
async fn data_transfer_subscriber<DB: Store + Send + Sync + 'static>(
    deals: StateGroup<ProviderDealMachine<ProviderEnv<DB>>, DB>,
    mut events: Subscriber<ChannelEvent>,
) {
    while let Some(ChannelEvent {
        channel_id,
        voucher,
        event,
    }) = events.next().await
    {
        let Ok(proposal) = voucher.decode::<DealProposal>(DEAL_PROPOSAL_TYPE) else {
            continue;
        };
        let key = ProviderDealIdentifier {
            receiver: channel_id.initiator,
            deal_id: proposal.id,
        };

        let machine_event = match event {
            Event::Opened => {
                if deals.contains(&key).await {
                    debug!("retrieval deal {} is already being tracked", key);
                    continue;
                }
                let deal = ProviderDealState {
                    current_interval: proposal.params.payment_interval,
                    proposal,
                    status: DealStatus::New,
                    receiver: channel_id.initiator,
                    channel_id: Some(channel_id),
                    piece_info: None,
                    total_sent: 0,
                    funds_received: TokenAmount::zero(),
                    payment_owed: TokenAmount::zero(),
                    pending_payment: None,
                    message: String::new(),
                    all_blocks_sent: false,
                    legacy_protocol: false,
                };
                if let Err(e) = deals.begin(deal).await {
                    error!("tracking new retrieval deal {}: {}", key, e);
                    continue;
                }
                ProviderEvent::Open
            }
            Event::VoucherReceived(received) => {
                let Ok(payment) = received.decode::<DealPayment>(DEAL_PAYMENT_TYPE) else {
                    debug!("deal {}: undecodable voucher", key);
                    continue;
                };
                ProviderEvent::PaymentReceived {
                    payment_channel: payment.payment_channel,
                    voucher: payment.payment_voucher,
                }
            }
            Event::DataSent { total_sent } => ProviderEvent::BlocksSent { total_sent },
            Event::FinishedTransferring | Event::Completed => ProviderEvent::AllBlocksSent,
            Event::Cancelled => ProviderEvent::ClientCancelled,
            Event::Errored(message) => ProviderEvent::DataTransferErrored { message },
            Event::Restarted
            | Event::DataReceived { .. }
            | Event::VoucherResultReceived(_) => continue,
        };

        if let Err(e) = deals.send(&key, machine_event).await {
            debug!(
                "data transfer event for unknown retrieval deal {}: {}",
                key, e
            );
        }
    }
}
