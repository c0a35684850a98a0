// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use async_std::task;
use async_trait::async_trait;
use cid::Cid;
use datatransfer::ChannelId;
use db::{MemoryDB, Store};
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use num_traits::Zero;
use parking_lot::Mutex;
use piecestore::{DealInfo, PieceInfo};
use retrievalmarket::{
    testutil::{make_voucher, TestProviderNode},
    Ask, DealProposal, DealResponse, DealStatus, Params, ProviderDealEnvironment,
    ProviderDealIdentifier, ProviderDealMachine, ProviderDealState, ProviderEvent,
};
use shared::testutil::{random_cid, random_peer, random_piece_cid};
use statemachine::StateGroup;
use std::sync::Arc;
use std::time::Duration;

const PROVIDER_NS: &str = "/deals/provider";

fn default_params() -> Params {
    Params {
        selector: None,
        piece_cid: None,
        price_per_byte: TokenAmount::from_atto(1000u64),
        payment_interval: 10_000,
        payment_interval_increase: 1_000,
        unseal_price: TokenAmount::from_atto(5000u64),
    }
}

fn permissive_ask() -> Ask {
    Ask {
        price_per_byte: TokenAmount::zero(),
        unseal_price: TokenAmount::zero(),
        payment_interval: u64::MAX,
        payment_interval_increase: u64::MAX,
    }
}

fn piece_fixture() -> PieceInfo {
    PieceInfo {
        piece_cid: random_piece_cid(),
        deals: vec![DealInfo {
            deal_id: 11,
            sector_id: 42,
            offset: PaddedPieceSize(0),
            length: PaddedPieceSize(1 << 20),
        }],
    }
}

fn make_deal(id: u64, status: DealStatus, params: Params) -> ProviderDealState {
    ProviderDealState {
        proposal: DealProposal {
            payload_cid: random_cid(),
            id,
            params: params.clone(),
        },
        status,
        receiver: random_peer(),
        channel_id: Some(ChannelId {
            initiator: random_peer(),
            responder: random_peer(),
            id,
        }),
        piece_info: None,
        total_sent: 0,
        funds_received: TokenAmount::zero(),
        payment_owed: TokenAmount::zero(),
        pending_payment: None,
        message: String::new(),
        current_interval: params.payment_interval,
        all_blocks_sent: false,
        legacy_protocol: false,
    }
}

struct FakeEnv {
    node: TestProviderNode,
    ask: Ask,
    piece: Option<PieceInfo>,
    reject_deal: bool,
    reject_reason: String,
    responses: Mutex<Vec<DealResponse>>,
    resumed: Mutex<Vec<ChannelId>>,
}

impl Default for FakeEnv {
    fn default() -> Self {
        FakeEnv {
            node: TestProviderNode::default(),
            ask: permissive_ask(),
            piece: Some(piece_fixture()),
            reject_deal: false,
            reject_reason: String::new(),
            responses: Mutex::new(Vec::new()),
            resumed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ProviderDealEnvironment for FakeEnv {
    fn node(&self) -> &dyn retrievalmarket::RetrievalProviderNode {
        &self.node
    }

    async fn ask(&self) -> Ask {
        self.ask.clone()
    }

    async fn get_piece(
        &self,
        _payload_cid: Cid,
        _piece_cid: Option<Cid>,
    ) -> Result<Option<PieceInfo>, String> {
        Ok(self.piece.clone())
    }

    async fn run_deal_decision_logic(
        &self,
        _deal: &ProviderDealState,
    ) -> Result<(bool, String), String> {
        Ok((!self.reject_deal, self.reject_reason.clone()))
    }

    async fn send_deal_response(
        &self,
        _channel_id: ChannelId,
        response: &DealResponse,
        _legacy: bool,
    ) -> Result<(), String> {
        self.responses.lock().push(response.clone());
        Ok(())
    }

    async fn resume_data_transfer(&self, channel_id: ChannelId) -> Result<(), String> {
        self.resumed.lock().push(channel_id);
        Ok(())
    }
}

type ProviderGroup = StateGroup<ProviderDealMachine<FakeEnv>, MemoryDB>;

async fn start_group(env: Arc<FakeEnv>, deal: ProviderDealState) -> ProviderGroup {
    let db = MemoryDB::default();
    db.write(
        format!("{}/{}", PROVIDER_NS, deal.identifier()),
        deal.marshal_cbor().unwrap(),
    )
    .unwrap();
    StateGroup::resume(db, PROVIDER_NS, env).await.unwrap()
}

async fn wait_for_status(
    group: &ProviderGroup,
    key: &ProviderDealIdentifier,
    want: DealStatus,
) -> ProviderDealState {
    for _ in 0..200 {
        let deal = group.get(key).await.unwrap();
        if deal.status == want {
            return deal;
        }
        task::sleep(Duration::from_millis(10)).await;
    }
    let deal = group.get(key).await.unwrap();
    panic!(
        "deal never reached {:?}; stuck in {:?} with message {:?}",
        want, deal.status, deal.message
    );
}

#[test]
fn full_paid_retrieval_flow() {
    task::block_on(async {
        let env = Arc::new(FakeEnv::default());
        let deal = make_deal(1, DealStatus::New, default_params());
        let key = deal.identifier();
        let pay_ch = Address::new_id(777);

        let group = start_group(env.clone(), deal).await;

        // admission unseals the piece and demands the unseal fee
        let deal = wait_for_status(&group, &key, DealStatus::FundsNeededUnseal).await;
        assert_eq!(deal.payment_owed, TokenAmount::from_atto(5000u64));
        assert_eq!(env.node.unsealed.lock().len(), 1);
        {
            let responses = env.responses.lock();
            assert_eq!(responses[0].status, DealStatus::Accepted);
            assert_eq!(responses[1].status, DealStatus::FundsNeededUnseal);
            assert_eq!(responses[1].payment_owed, TokenAmount::from_atto(5000u64));
        }

        // the client pays for unsealing and data starts to flow
        group
            .send(
                &key,
                ProviderEvent::PaymentReceived {
                    payment_channel: pay_ch,
                    voucher: make_voucher(5, 1, TokenAmount::from_atto(5000u64)),
                },
            )
            .await
            .unwrap();
        let deal = wait_for_status(&group, &key, DealStatus::Ongoing).await;
        assert_eq!(deal.funds_received, TokenAmount::from_atto(5000u64));
        assert!(deal.payment_owed.is_zero());
        assert_eq!(deal.current_interval, 11_000);

        // sent data crosses the interval, provider demands data payment
        group
            .send(&key, ProviderEvent::BlocksSent { total_sent: 11_000 })
            .await
            .unwrap();
        let deal = wait_for_status(&group, &key, DealStatus::FundsNeeded).await;
        assert_eq!(deal.payment_owed, TokenAmount::from_atto(11_000_000u64));

        group
            .send(
                &key,
                ProviderEvent::PaymentReceived {
                    payment_channel: pay_ch,
                    voucher: make_voucher(5, 2, TokenAmount::from_atto(11_005_000u64)),
                },
            )
            .await
            .unwrap();
        let deal = wait_for_status(&group, &key, DealStatus::Ongoing).await;
        assert_eq!(deal.funds_received, TokenAmount::from_atto(11_005_000u64));

        // the transfer finishes inside the next window, leaving a tail the
        // client still owes for
        group
            .send(&key, ProviderEvent::BlocksSent { total_sent: 11_500 })
            .await
            .unwrap();
        group.send(&key, ProviderEvent::AllBlocksSent).await.unwrap();
        let deal = wait_for_status(&group, &key, DealStatus::FundsNeededLastPayment).await;
        assert_eq!(deal.payment_owed, TokenAmount::from_atto(500_000u64));

        group
            .send(
                &key,
                ProviderEvent::PaymentReceived {
                    payment_channel: pay_ch,
                    voucher: make_voucher(5, 3, TokenAmount::from_atto(11_505_000u64)),
                },
            )
            .await
            .unwrap();
        let deal = wait_for_status(&group, &key, DealStatus::Completed).await;
        assert_eq!(deal.funds_received, TokenAmount::from_atto(11_505_000u64));

        // total received matches bytes times price plus the unseal fee
        assert_eq!(
            deal.funds_received,
            deal.params().total_payment(deal.total_sent)
        );
        assert_eq!(
            env.responses.lock().last().unwrap().status,
            DealStatus::Completed
        );
        assert_eq!(env.node.vouchers_saved.lock().len(), 3);
    })
}

#[test]
fn free_retrieval_skips_payment_states() {
    task::block_on(async {
        let env = Arc::new(FakeEnv::default());
        let mut params = default_params();
        params.price_per_byte = TokenAmount::zero();
        params.unseal_price = TokenAmount::zero();
        let deal = make_deal(2, DealStatus::New, params);
        let key = deal.identifier();

        let group = start_group(env.clone(), deal).await;
        wait_for_status(&group, &key, DealStatus::Ongoing).await;

        group
            .send(&key, ProviderEvent::BlocksSent { total_sent: 500 })
            .await
            .unwrap();
        group.send(&key, ProviderEvent::AllBlocksSent).await.unwrap();

        let deal = wait_for_status(&group, &key, DealStatus::Completed).await;
        assert!(deal.funds_received.is_zero());
        assert!(env.node.vouchers_saved.lock().is_empty());
    })
}

#[test]
fn unknown_payload_is_not_found() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.piece = None;
        let env = Arc::new(env);
        let deal = make_deal(3, DealStatus::New, default_params());
        let key = deal.identifier();

        let group = start_group(env.clone(), deal).await;
        let deal = wait_for_status(&group, &key, DealStatus::Rejected).await;
        assert_eq!(deal.message, "deal not found: piece not found");
        assert_eq!(
            env.responses.lock()[0].status,
            DealStatus::DealNotFound
        );
    })
}

#[test]
fn below_ask_terms_are_rejected() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.ask = Ask {
            price_per_byte: TokenAmount::from_atto(2_000u64),
            unseal_price: TokenAmount::zero(),
            payment_interval: u64::MAX,
            payment_interval_increase: u64::MAX,
        };
        let env = Arc::new(env);
        let deal = make_deal(4, DealStatus::New, default_params());
        let key = deal.identifier();

        let group = start_group(env.clone(), deal).await;
        let deal = wait_for_status(&group, &key, DealStatus::Rejected).await;
        assert_eq!(
            deal.message,
            "deal rejected: price per byte too low: 1000 < 2000"
        );
        assert_eq!(env.responses.lock()[0].status, DealStatus::Rejected);
    })
}

#[test]
fn unseal_failure_errors_deal() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.node.unseal_error = Some("sector corroded".to_string());
        let env = Arc::new(env);
        let deal = make_deal(5, DealStatus::New, default_params());
        let key = deal.identifier();

        let group = start_group(env.clone(), deal).await;
        let deal = wait_for_status(&group, &key, DealStatus::Errored).await;
        assert_eq!(deal.message, "unsealing piece: sector corroded");
    })
}

#[test]
fn client_cancel_is_terminal() {
    task::block_on(async {
        let env = Arc::new(FakeEnv::default());
        let deal = make_deal(6, DealStatus::New, default_params());
        let key = deal.identifier();

        let group = start_group(env, deal).await;
        wait_for_status(&group, &key, DealStatus::FundsNeededUnseal).await;

        group.send(&key, ProviderEvent::ClientCancelled).await.unwrap();
        let deal = wait_for_status(&group, &key, DealStatus::Cancelled).await;
        assert_eq!(deal.message, "deal cancelled by client");
    })
}
