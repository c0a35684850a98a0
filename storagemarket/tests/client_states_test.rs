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
use shared::testutil::{dummy_signature, random_cid, random_peer};
use statemachine::StateGroup;
use std::sync::Arc;
use std::time::Duration;
use storagemarket::{
    testutil::TestNode, ClientDeal, ClientDealEnvironment, ClientDealMachine, ClientDealProposal,
    ClientEvent, DataRef, DealProposal, DealStatusResponse, Response, SignedResponse,
    StorageDealStatus, EPOCHS_IN_DAY, TT_GRAPHSYNC,
};

const CLIENT_NS: &str = "/deals/client";

fn default_proposal() -> DealProposal {
    DealProposal {
        piece_cid: shared::piece_commitment_to_cid(&[7u8; 32]).unwrap(),
        piece_size: PaddedPieceSize(1 << 20),
        verified_deal: false,
        client: Address::new_id(100),
        provider: Address::new_id(200),
        label: String::new(),
        start_epoch: 200,
        end_epoch: 200 + EPOCHS_IN_DAY * 200,
        storage_price_per_epoch: TokenAmount::from_atto(10_000),
        provider_collateral: TokenAmount::from_atto(10_000),
        client_collateral: TokenAmount::zero(),
    }
}

fn make_deal(state: StorageDealStatus) -> ClientDeal {
    let signed = ClientDealProposal {
        proposal: default_proposal(),
        client_signature: dummy_signature(),
    };
    ClientDeal {
        proposal_cid: signed.cid().unwrap(),
        client_deal_proposal: signed,
        add_funds_cid: None,
        state,
        miner: random_peer(),
        miner_worker: Address::new_id(99),
        deal_id: 0,
        data_ref: DataRef {
            transfer_type: TT_GRAPHSYNC.to_string(),
            root: random_cid(),
            piece_cid: None,
            piece_size: 0,
        },
        message: String::new(),
        publish_message: None,
        funds_reserved: TokenAmount::zero(),
        transfer_channel_id: None,
        fast_retrieval: false,
        store_id: None,
    }
}

struct FakeClientEnv {
    node: TestNode,
    /// Response the fake provider sends to a proposal; `None` errors the
    /// write.
    response: Option<Box<dyn Fn(&ClientDeal) -> SignedResponse + Send + Sync>>,
    provider_state: StorageDealStatus,
    provider_publish_cid: Option<Cid>,
    open_transfer_error: Option<String>,

    opened_transfers: Mutex<Vec<Cid>>,
    restart_calls: Mutex<Vec<ChannelId>>,
}

impl Default for FakeClientEnv {
    fn default() -> Self {
        FakeClientEnv {
            node: TestNode::default(),
            response: Some(Box::new(|deal| SignedResponse {
                response: Response {
                    state: StorageDealStatus::WaitingForData,
                    message: String::new(),
                    proposal: deal.proposal_cid,
                    publish_message: None,
                },
                signature: dummy_signature(),
            })),
            provider_state: StorageDealStatus::Staged,
            provider_publish_cid: None,
            open_transfer_error: None,
            opened_transfers: Mutex::new(Vec::new()),
            restart_calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ClientDealEnvironment for FakeClientEnv {
    fn node(&self) -> &dyn storagemarket::StorageClientNode {
        &self.node
    }

    async fn propose_deal(&self, deal: &ClientDeal) -> Result<(SignedResponse, Vec<u8>), String> {
        match &self.response {
            None => Err("stream reset by peer".to_string()),
            Some(make_response) => {
                let signed = make_response(deal);
                let bz = signed.response.marshal_cbor().map_err(|e| e.to_string())?;
                Ok((signed, bz))
            }
        }
    }

    async fn open_data_transfer(&self, deal: &ClientDeal) -> Result<ChannelId, String> {
        if let Some(e) = &self.open_transfer_error {
            return Err(e.clone());
        }
        self.opened_transfers.lock().push(deal.proposal_cid);
        Ok(ChannelId {
            initiator: random_peer(),
            responder: deal.miner,
            id: 1,
        })
    }

    async fn restart_data_transfer(&self, channel_id: ChannelId) -> Result<(), String> {
        self.restart_calls.lock().push(channel_id);
        Ok(())
    }

    async fn get_provider_deal_state(
        &self,
        deal: &ClientDeal,
    ) -> Result<DealStatusResponse, String> {
        Ok(DealStatusResponse {
            state: self.provider_state,
            message: match self.provider_state {
                StorageDealStatus::Failing => "deal rejected: bad deal".to_string(),
                _ => String::new(),
            },
            proposal_cid: deal.proposal_cid,
            publish_cid: self.provider_publish_cid,
            deal_id: 1,
            signature: dummy_signature(),
        })
    }
}

type ClientGroup = StateGroup<ClientDealMachine<FakeClientEnv>, MemoryDB>;

async fn run_until(
    env: Arc<FakeClientEnv>,
    deal: ClientDeal,
    want: StorageDealStatus,
) -> (ClientGroup, ClientDeal) {
    let db = MemoryDB::default();
    db.write(
        format!("{}/{}", CLIENT_NS, deal.proposal_cid),
        deal.marshal_cbor().unwrap(),
    )
    .unwrap();
    let key = deal.proposal_cid;
    let group: ClientGroup = StateGroup::resume(db, CLIENT_NS, env).await.unwrap();
    let deal = wait_for_state(&group, &key, want).await;
    (group, deal)
}

async fn wait_for_state(group: &ClientGroup, key: &Cid, want: StorageDealStatus) -> ClientDeal {
    for _ in 0..200 {
        let deal = group.get(key).await.unwrap();
        if deal.state == want {
            return deal;
        }
        task::sleep(Duration::from_millis(10)).await;
    }
    let deal = group.get(key).await.unwrap();
    panic!(
        "deal never reached {:?}; stuck in {:?} with message {:?}",
        want, deal.state, deal.message
    );
}

#[test]
fn happy_path_reaches_expired() {
    task::block_on(async {
        let mut env = FakeClientEnv::default();
        env.provider_publish_cid = Some(random_cid());
        env.node.validate_published_deal_id = 77;
        let env = Arc::new(env);

        let deal = make_deal(StorageDealStatus::EnsureClientFunds);
        let key = deal.proposal_cid;

        // runs funding, proposal and transfer set-up, then waits on the
        // transfer completing
        let (group, _) = run_until(env.clone(), deal, StorageDealStatus::Transferring).await;
        assert_eq!(env.opened_transfers.lock().len(), 1);

        group
            .send(&key, ClientEvent::DataTransferComplete)
            .await
            .unwrap();

        let deal = wait_for_state(&group, &key, StorageDealStatus::Expired).await;
        assert_eq!(deal.deal_id, 77);
        assert_eq!(deal.publish_message, env.provider_publish_cid);
        assert!(deal.funds_reserved.is_zero());
        // reserved for collateral plus storage fee, then returned once the
        // published deal held them in escrow
        assert_eq!(env.node.reserved.lock().len(), 1);
        assert_eq!(env.node.released.lock().len(), 1);
    })
}

#[test]
fn funding_waits_for_add_funds_message() {
    task::block_on(async {
        let mut env = FakeClientEnv::default();
        env.node.reserve_funds_cid = Some(random_cid());
        let env = Arc::new(env);

        let deal = make_deal(StorageDealStatus::EnsureClientFunds);
        let (_group, deal) =
            run_until(env.clone(), deal, StorageDealStatus::Transferring).await;
        assert_eq!(deal.add_funds_cid, env.node.reserve_funds_cid);
        assert_eq!(
            env.node.waited_messages.lock().as_slice(),
            &[env.node.reserve_funds_cid.unwrap()]
        );
    })
}

#[test]
fn mismatched_response_fails_deal() {
    task::block_on(async {
        let other = random_cid();
        let mut env = FakeClientEnv::default();
        env.response = Some(Box::new(move |_| SignedResponse {
            response: Response {
                state: StorageDealStatus::WaitingForData,
                message: String::new(),
                proposal: other,
                publish_message: None,
            },
            signature: dummy_signature(),
        }));

        let deal = make_deal(StorageDealStatus::FundsEnsured);
        let (_group, deal) = run_until(Arc::new(env), deal, StorageDealStatus::Error).await;
        assert!(deal
            .message
            .starts_with("miner responded to a wrong proposal:"));
    })
}

#[test]
fn unexpected_response_state_fails_deal() {
    task::block_on(async {
        let mut env = FakeClientEnv::default();
        env.response = Some(Box::new(|deal| SignedResponse {
            response: Response {
                state: StorageDealStatus::Publishing,
                message: String::new(),
                proposal: deal.proposal_cid,
                publish_message: None,
            },
            signature: dummy_signature(),
        }));

        let deal = make_deal(StorageDealStatus::FundsEnsured);
        let (_group, deal) = run_until(Arc::new(env), deal, StorageDealStatus::Error).await;
        assert_eq!(
            deal.message,
            "unexpected deal status while waiting for data request: StorageDealPublishing"
        );
    })
}

#[test]
fn unverifiable_response_fails_deal() {
    task::block_on(async {
        let mut env = FakeClientEnv::default();
        env.node.verify_signature_fails = true;
        let deal = make_deal(StorageDealStatus::FundsEnsured);
        let (_group, deal) = run_until(Arc::new(env), deal, StorageDealStatus::Error).await;
        assert_eq!(deal.message, "unable to verify signature on deal response");
    })
}

#[test]
fn write_proposal_failure_is_terminal() {
    task::block_on(async {
        let mut env = FakeClientEnv::default();
        env.response = None;
        let deal = make_deal(StorageDealStatus::FundsEnsured);
        let (_group, deal) = run_until(Arc::new(env), deal, StorageDealStatus::Error).await;
        assert_eq!(
            deal.message,
            "sending proposal to storage provider failed: stream reset by peer"
        );
    })
}

#[test]
fn provider_rejection_surfaces_reason_and_releases_funds() {
    task::block_on(async {
        let mut env = FakeClientEnv::default();
        env.provider_state = StorageDealStatus::Failing;
        let env = Arc::new(env);

        let mut deal = make_deal(StorageDealStatus::CheckForDealAcceptance);
        deal.funds_reserved = TokenAmount::from_atto(1_000_000);
        let (_group, deal) = run_until(env.clone(), deal, StorageDealStatus::Error).await;
        assert_eq!(deal.message, "deal failed: deal rejected: bad deal");
        assert!(deal.funds_reserved.is_zero());
        assert_eq!(env.node.released.lock().len(), 1);
    })
}

#[test]
fn restart_resumes_push_transfer() {
    task::block_on(async {
        let env = Arc::new(FakeClientEnv::default());
        let chid = ChannelId {
            initiator: random_peer(),
            responder: random_peer(),
            id: 3,
        };
        let mut deal = make_deal(StorageDealStatus::Transferring);
        deal.transfer_channel_id = Some(chid.clone());

        let db = MemoryDB::default();
        db.write(
            format!("{}/{}", CLIENT_NS, deal.proposal_cid),
            deal.marshal_cbor().unwrap(),
        )
        .unwrap();
        let key = deal.proposal_cid;
        let group: ClientGroup = StateGroup::resume(db, CLIENT_NS, env.clone()).await.unwrap();

        task::sleep(Duration::from_millis(100)).await;
        assert_eq!(env.restart_calls.lock().as_slice(), &[chid]);
        assert_eq!(
            group.get(&key).await.unwrap().state,
            StorageDealStatus::Transferring
        );
    })
}

#[test]
fn slashed_deal_terminates_as_slashed() {
    task::block_on(async {
        let mut env = FakeClientEnv::default();
        env.node.deal_completion = storagemarket::DealCompletion::Slashed(12_000);
        let mut deal = make_deal(StorageDealStatus::Active);
        deal.deal_id = 8;
        let (_group, deal) = run_until(Arc::new(env), deal, StorageDealStatus::Slashed).await;
        assert_eq!(deal.deal_id, 8);
    })
}
