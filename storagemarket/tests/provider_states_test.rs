// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use async_std::task;
use async_trait::async_trait;
use cid::Cid;
use datatransfer::ChannelId;
use db::{MemoryDB, Store};
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use libp2p_identity::PeerId;
use num_traits::Zero;
use parking_lot::Mutex;
use piecestore::PieceStore;
use shared::testutil::{dummy_signature, random_cid, random_peer};
use statemachine::StateGroup;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use storagemarket::{
    testutil::TestNode, ClientDealProposal, DataRef, DealProposal, MinerDeal, ProviderDealEnvironment,
    ProviderDealMachine, ProviderEvent, PublishStorageDealsReturn, Response, StorageAsk,
    StorageDealStatus, EPOCHS_IN_DAY, TT_GRAPHSYNC,
};

const PROVIDER_NS: &str = "/deals/provider";

fn provider_addr() -> Address {
    Address::new_id(200)
}

fn client_addr() -> Address {
    Address::new_id(100)
}

fn default_piece_cid() -> Cid {
    shared::piece_commitment_to_cid(&[7u8; 32]).unwrap()
}

fn default_proposal() -> DealProposal {
    DealProposal {
        piece_cid: default_piece_cid(),
        piece_size: PaddedPieceSize(1 << 20),
        verified_deal: false,
        client: client_addr(),
        provider: provider_addr(),
        label: String::new(),
        start_epoch: 200,
        end_epoch: 200 + EPOCHS_IN_DAY * 200,
        storage_price_per_epoch: TokenAmount::from_atto(10_000),
        provider_collateral: TokenAmount::from_atto(10_000),
        client_collateral: TokenAmount::zero(),
    }
}

fn default_ask() -> StorageAsk {
    StorageAsk {
        price: TokenAmount::from_atto(10_000_000),
        verified_price: TokenAmount::from_atto(1_000_000),
        min_piece_size: PaddedPieceSize(256),
        max_piece_size: PaddedPieceSize(1 << 20),
        miner: provider_addr(),
        timestamp: 0,
        expiry: 100_000,
        seq_no: 0,
    }
}

fn make_deal(proposal: DealProposal, state: StorageDealStatus, client: PeerId) -> MinerDeal {
    let signed = ClientDealProposal {
        proposal,
        client_signature: dummy_signature(),
    };
    MinerDeal {
        proposal_cid: signed.cid().unwrap(),
        client_deal_proposal: signed,
        add_funds_cid: None,
        publish_cid: None,
        client,
        state,
        piece_path: String::new(),
        metadata_path: String::new(),
        message: String::new(),
        data_ref: DataRef {
            transfer_type: TT_GRAPHSYNC.to_string(),
            root: random_cid(),
            piece_cid: None,
            piece_size: 0,
        },
        funds_reserved: TokenAmount::zero(),
        available_for_retrieval: false,
        deal_id: 0,
        transfer_channel_id: None,
        sector_number: 0,
        store_id: None,
        fast_retrieval: false,
    }
}

struct FakeEnv {
    node: TestNode,
    address: Address,
    ask: StorageAsk,
    fs: filestore::FileStore,
    _fs_dir: tempfile::TempDir,
    piece_store: piecestore::DsPieceStore<MemoryDB>,
    commitment: Cid,
    generate_commp_error: Option<String>,
    piece_reader_data: Vec<u8>,
    send_response_error: Option<String>,
    restart_error: Option<String>,
    reject_deal: bool,
    reject_reason: String,
    decision_error: Option<String>,

    responses: Mutex<Vec<Response>>,
    disconnects: Mutex<Vec<Cid>>,
    restart_calls: Mutex<Vec<ChannelId>>,
    tags: Mutex<Vec<String>>,
    untags: Mutex<Vec<String>>,
    deleted_stores: Mutex<Vec<u64>>,
}

impl Default for FakeEnv {
    fn default() -> Self {
        let dir = tempfile::tempdir().unwrap();
        FakeEnv {
            node: TestNode::default(),
            address: provider_addr(),
            ask: default_ask(),
            fs: filestore::FileStore::new(dir.path()).unwrap(),
            _fs_dir: dir,
            piece_store: piecestore::DsPieceStore::new(MemoryDB::default()),
            commitment: default_piece_cid(),
            generate_commp_error: None,
            piece_reader_data: vec![3u8; 100],
            send_response_error: None,
            restart_error: None,
            reject_deal: false,
            reject_reason: String::new(),
            decision_error: None,
            responses: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            restart_calls: Mutex::new(Vec::new()),
            tags: Mutex::new(Vec::new()),
            untags: Mutex::new(Vec::new()),
            deleted_stores: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ProviderDealEnvironment for FakeEnv {
    fn address(&self) -> Address {
        self.address
    }

    fn node(&self) -> &dyn storagemarket::StorageProviderNode {
        &self.node
    }

    async fn ask(&self) -> StorageAsk {
        self.ask.clone()
    }

    fn file_store(&self) -> &filestore::FileStore {
        &self.fs
    }

    fn piece_store(&self) -> &dyn piecestore::PieceStore {
        &self.piece_store
    }

    async fn restart_data_transfer(&self, channel_id: ChannelId) -> Result<(), String> {
        self.restart_calls.lock().push(channel_id);
        match &self.restart_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn generate_piece_commitment(
        &self,
        _store_id: Option<u64>,
        _payload_cid: Cid,
    ) -> Result<(Cid, filestore::Path), String> {
        match &self.generate_commp_error {
            Some(e) => Err(e.clone()),
            None => Ok((self.commitment, String::new())),
        }
    }

    async fn piece_reader(
        &self,
        _store_id: Option<u64>,
        _payload_cid: Cid,
    ) -> Result<(Box<dyn Read + Send>, u64), String> {
        let data = self.piece_reader_data.clone();
        let size = data.len() as u64;
        Ok((Box::new(std::io::Cursor::new(data)), size))
    }

    fn delete_store(&self, store_id: u64) -> Result<(), String> {
        self.deleted_stores.lock().push(store_id);
        Ok(())
    }

    async fn send_signed_response(&self, response: Response) -> Result<(), String> {
        match &self.send_response_error {
            Some(e) => Err(e.clone()),
            None => {
                self.responses.lock().push(response);
                Ok(())
            }
        }
    }

    async fn disconnect(&self, proposal_cid: Cid) -> Result<(), String> {
        self.disconnects.lock().push(proposal_cid);
        Ok(())
    }

    async fn run_custom_decision_logic(&self, _deal: &MinerDeal) -> Result<(bool, String), String> {
        match &self.decision_error {
            Some(e) => Err(e.clone()),
            None => Ok((!self.reject_deal, self.reject_reason.clone())),
        }
    }

    fn tag_peer(&self, _peer: PeerId, tag: &str) {
        self.tags.lock().push(tag.to_string());
    }

    fn untag_peer(&self, _peer: PeerId, tag: &str) {
        self.untags.lock().push(tag.to_string());
    }
}

type ProviderGroup = StateGroup<ProviderDealMachine<FakeEnv>, MemoryDB>;

/// Persists the deal, resumes the machine over it (re-running the current
/// state's entry handler) and waits for it to settle in `want`.
async fn run_until(env: Arc<FakeEnv>, deal: MinerDeal, want: StorageDealStatus) -> (ProviderGroup, MinerDeal) {
    let db = MemoryDB::default();
    db.write(
        format!("{}/{}", PROVIDER_NS, deal.proposal_cid),
        deal.marshal_cbor().unwrap(),
    )
    .unwrap();
    let key = deal.proposal_cid;
    let group: ProviderGroup = StateGroup::resume(db, PROVIDER_NS, env).await.unwrap();
    let deal = wait_for_state(&group, &key, want).await;
    (group, deal)
}

async fn wait_for_state(group: &ProviderGroup, key: &Cid, want: StorageDealStatus) -> MinerDeal {
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

async fn expect_rejection(env: FakeEnv, proposal: DealProposal, message: &str) {
    let deal = make_deal(proposal, StorageDealStatus::Validating, random_peer());
    let (_group, deal) = run_until(Arc::new(env), deal, StorageDealStatus::Error).await;
    assert!(
        deal.message.contains(message),
        "expected message containing {:?}, got {:?}",
        message,
        deal.message
    );
}

#[test]
fn validate_succeeds_and_tags_peer() {
    task::block_on(async {
        let env = Arc::new(FakeEnv::default());
        let deal = make_deal(default_proposal(), StorageDealStatus::Validating, random_peer());
        let proposal_cid = deal.proposal_cid;
        // runs through acceptance and stops waiting for payload data
        let (_group, deal) =
            run_until(env.clone(), deal, StorageDealStatus::WaitingForData).await;
        assert_eq!(deal.message, "");
        assert_eq!(env.tags.lock().as_slice(), &[proposal_cid.to_string()]);
        // the client got a signed go-ahead and the stream was released
        let responses = env.responses.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].state, StorageDealStatus::WaitingForData);
        assert_eq!(env.disconnects.lock().len(), 1);
    })
}

#[test]
fn validate_rejects_bad_signature() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.node.verify_signature_fails = true;
        expect_rejection(
            env,
            default_proposal(),
            "deal rejected: verifying StorageDealProposal: could not verify signature",
        )
        .await;
    })
}

#[test]
fn validate_rejects_chain_head_error() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.node.chain_head_error = Some("couldn't get id".to_string());
        expect_rejection(
            env,
            default_proposal(),
            "deal rejected: node error getting most recent state id: couldn't get id",
        )
        .await;
    })
}

#[test]
fn validate_rejects_wrong_provider() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.address = Address::new_id(999);
        expect_rejection(
            env,
            default_proposal(),
            "deal rejected: incorrect provider for deal",
        )
        .await;
    })
}

#[test]
fn validate_rejects_price_below_ask() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.storage_price_per_epoch = TokenAmount::from_atto(5_000);
        expect_rejection(
            FakeEnv::default(),
            proposal,
            "deal rejected: storage price per epoch less than asking price: 5000 < 9765",
        )
        .await;
    })
}

#[test]
fn validate_rejects_piece_below_ask_minimum() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.piece_size = PaddedPieceSize(128);
        expect_rejection(
            FakeEnv::default(),
            proposal,
            "deal rejected: piece size less than minimum required size: 128 < 256",
        )
        .await;
    })
}

#[test]
fn validate_rejects_invalid_piece_size() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.piece_size = PaddedPieceSize(129);
        expect_rejection(
            FakeEnv::default(),
            proposal,
            "deal rejected: proposal piece size is invalid: padded piece size must be a power of 2",
        )
        .await;
    })
}

#[test]
fn validate_rejects_wrong_piece_cid_prefix() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.piece_cid = random_cid();
        expect_rejection(
            FakeEnv::default(),
            proposal,
            "deal rejected: proposal PieceCID had wrong prefix",
        )
        .await;
    })
}

#[test]
fn validate_rejects_end_before_start() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.start_epoch = 1000;
        proposal.end_epoch = 900;
        expect_rejection(
            FakeEnv::default(),
            proposal,
            "deal rejected: proposal end before proposal start",
        )
        .await;
    })
}

#[test]
fn validate_rejects_elapsed_start() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.start_epoch = 49;
        proposal.end_epoch = 49 + EPOCHS_IN_DAY * 200;
        expect_rejection(
            FakeEnv::default(),
            proposal,
            "deal rejected: deal start epoch has already elapsed",
        )
        .await;
    })
}

#[test]
fn validate_rejects_duration_too_short() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.start_epoch = 200;
        proposal.end_epoch = 200 + EPOCHS_IN_DAY * 180 - 1;
        expect_rejection(
            FakeEnv::default(),
            proposal,
            "deal duration out of bounds (min, max, provided): 518400, 1555200, 518399",
        )
        .await;
    })
}

#[test]
fn validate_rejects_duration_too_long() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.start_epoch = 200;
        proposal.end_epoch = 200 + EPOCHS_IN_DAY * 540 + 1;
        expect_rejection(FakeEnv::default(), proposal, "deal duration out of bounds").await;
    })
}

#[test]
fn validate_rejects_collateral_below_bounds() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.node.collateral_bounds = (
            TokenAmount::from_atto(20_000),
            TokenAmount::from_atto(40_000),
        );
        expect_rejection(
            env,
            default_proposal(),
            "deal rejected: proposed provider collateral below minimum: 10000 < 20000",
        )
        .await;
    })
}

#[test]
fn validate_rejects_label_too_long() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.label = "x".repeat(257);
        expect_rejection(
            FakeEnv::default(),
            proposal,
            "deal rejected: deal label can be at most 256 bytes, is 257",
        )
        .await;
    })
}

#[test]
fn validate_rejects_balance_error() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.node.get_balance_error = Some("could not get balance".to_string());
        expect_rejection(
            env,
            default_proposal(),
            "deal rejected: node error getting client market balance failed: could not get balance",
        )
        .await;
    })
}

#[test]
fn validate_rejects_insufficient_client_funds() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.node.client_market_balance = TokenAmount::from_atto(2_000_000 - 1);
        expect_rejection(
            env,
            default_proposal(),
            "deal rejected: clientMarketBalance.Available too small",
        )
        .await;
    })
}

#[test]
fn validate_verified_deal_requires_data_cap() {
    task::block_on(async {
        let mut proposal = default_proposal();
        proposal.verified_deal = true;

        // succeeds with a sufficient cap
        let mut env = FakeEnv::default();
        env.node.data_cap = Some(BigInt::from(1u64 << 20));
        let deal = make_deal(proposal.clone(), StorageDealStatus::Validating, random_peer());
        run_until(Arc::new(env), deal, StorageDealStatus::WaitingForData).await;

        // missing cap
        expect_rejection(
            FakeEnv::default(),
            proposal.clone(),
            "deal rejected: node error fetching verified data cap: data cap missing -- client not verified",
        )
        .await;

        // cap fetch failure
        let mut env = FakeEnv::default();
        env.node.get_data_cap_error = Some("failure getting data cap".to_string());
        expect_rejection(
            env,
            proposal.clone(),
            "deal rejected: node error fetching verified data cap: failure getting data cap",
        )
        .await;

        // cap too small
        let mut env = FakeEnv::default();
        env.node.data_cap = Some(BigInt::from((1u64 << 20) - 1));
        expect_rejection(
            env,
            proposal,
            "deal rejected: verified deal DataCap too small for proposed piece size",
        )
        .await;
    })
}

#[test]
fn custom_decision_rejection_reaches_client() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.reject_deal = true;
        env.reject_reason = "such deals are not accepted".to_string();
        let env = Arc::new(env);
        let deal = make_deal(default_proposal(), StorageDealStatus::AcceptWait, random_peer());
        let (_group, deal) = run_until(env.clone(), deal, StorageDealStatus::Error).await;
        assert_eq!(deal.message, "deal rejected: such deals are not accepted");
        let responses = env.responses.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].state, StorageDealStatus::Failing);
        assert_eq!(responses[0].message, deal.message);
    })
}

#[test]
fn happy_path_reaches_expired() {
    task::block_on(async {
        let deal_id = 99u64;
        let mut env = FakeEnv::default();
        env.node.wait_for_message_return = PublishStorageDealsReturn { ids: vec![deal_id] }
            .marshal_cbor()
            .unwrap();
        env.node.publish_deals_cid = Some(random_cid());
        let env = Arc::new(env);

        let deal = make_deal(default_proposal(), StorageDealStatus::Validating, random_peer());
        let key = deal.proposal_cid;
        let (group, deal) = run_until(env.clone(), deal, StorageDealStatus::WaitingForData).await;

        // payload arrives through the transfer engine
        let chid = ChannelId {
            initiator: random_peer(),
            responder: random_peer(),
            id: 1,
        };
        group
            .send(
                &key,
                ProviderEvent::DataTransferInitiated {
                    channel_id: chid.clone(),
                },
            )
            .await
            .unwrap();
        group
            .send(&key, ProviderEvent::DataTransferCompleted)
            .await
            .unwrap();

        let deal = wait_for_state(&group, &key, StorageDealStatus::Expired).await;
        assert_eq!(deal.deal_id, deal_id);
        assert_eq!(deal.message, "");
        // collateral was reserved once and released on publish
        assert!(deal.funds_reserved.is_zero());
        assert_eq!(env.node.reserved.lock().len(), 1);
        assert_eq!(env.node.released.lock().len(), 1);
        // the piece was registered for retrieval
        let info = env
            .piece_store
            .get_piece_info(&deal.proposal().piece_cid)
            .unwrap();
        assert_eq!(info.deals.len(), 1);
        assert_eq!(info.deals[0].deal_id, deal_id);
        // tagged on admission, untagged once active
        assert_eq!(env.tags.lock().len(), 1);
        assert_eq!(env.untags.lock().len(), 1);

        drop(deal);
        assert_eq!(group.list().await.unwrap().len(), 1);
    })
}

#[test]
fn funding_waits_for_add_funds_message() {
    task::block_on(async {
        let deal_id = 5u64;
        let mut env = FakeEnv::default();
        env.node.reserve_funds_cid = Some(random_cid());
        env.node.wait_for_message_return = PublishStorageDealsReturn { ids: vec![deal_id] }
            .marshal_cbor()
            .unwrap();
        let env = Arc::new(env);

        let deal = make_deal(
            default_proposal(),
            StorageDealStatus::ReserveProviderFunds,
            random_peer(),
        );
        let key = deal.proposal_cid;
        let (group, deal) = run_until(env.clone(), deal, StorageDealStatus::Expired).await;
        assert_eq!(deal.deal_id, deal_id);

        // the add-funds message and the publish message were both awaited
        let waited = env.node.waited_messages.lock();
        assert_eq!(waited.len(), 2);
        assert_eq!(waited[0], env.node.reserve_funds_cid.unwrap());
        drop(waited);
        let _ = group;
    })
}

#[test]
fn failed_publish_releases_funds() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.node.reserve_funds_cid = None;
        env.node.publish_deals_error = Some("not enough gas".to_string());
        let env = Arc::new(env);

        let deal = make_deal(
            default_proposal(),
            StorageDealStatus::ReserveProviderFunds,
            random_peer(),
        );
        let (_group, deal) = run_until(env.clone(), deal, StorageDealStatus::Error).await;
        assert_eq!(deal.message, "publishing deal: not enough gas");
        assert!(deal.funds_reserved.is_zero());
        assert_eq!(env.node.released.lock().len(), 1);
    })
}

#[test]
fn verify_data_mismatch_is_fatal() {
    task::block_on(async {
        let mut env = FakeEnv::default();
        env.commitment = shared::piece_commitment_to_cid(&[9u8; 32]).unwrap();
        let deal = make_deal(default_proposal(), StorageDealStatus::VerifyData, random_peer());
        let (_group, deal) = run_until(Arc::new(env), deal, StorageDealStatus::Error).await;
        assert_eq!(
            deal.message,
            "deal data verification failed: proposal CommP doesn't match calculated CommP"
        );
    })
}

#[test]
fn handoff_prefers_staged_piece_file() {
    task::block_on(async {
        let deal_id = 7u64;
        let mut env = FakeEnv::default();
        env.node.wait_for_message_return = PublishStorageDealsReturn { ids: vec![deal_id] }
            .marshal_cbor()
            .unwrap();

        // stage a piece file as data verification would have
        let mut staged = env.fs.create_temp().unwrap();
        std::io::Write::write_all(&mut staged, &[11u8; 64]).unwrap();
        let piece_path = staged.path().clone();
        drop(staged);

        let env = Arc::new(env);
        let mut deal = make_deal(default_proposal(), StorageDealStatus::Staged, random_peer());
        deal.piece_path = piece_path.clone();
        deal.deal_id = deal_id;
        let key = deal.proposal_cid;

        let (group, _) = run_until(env.clone(), deal, StorageDealStatus::Expired).await;

        // 64 payload bytes pad out to the 127-byte piece
        assert_eq!(*env.node.handed_off_bytes.lock(), 127);
        // the staged file was deleted during finalization
        assert!(matches!(
            env.fs.open(&piece_path),
            Err(filestore::Error::NotFound(_))
        ));
        let _ = group.get(&key).await.unwrap();
    })
}

#[test]
fn restart_resumes_transfer_exactly_once() {
    task::block_on(async {
        let env = Arc::new(FakeEnv::default());
        let chid = ChannelId {
            initiator: random_peer(),
            responder: random_peer(),
            id: 8,
        };
        let mut deal = make_deal(default_proposal(), StorageDealStatus::Transferring, random_peer());
        deal.transfer_channel_id = Some(chid.clone());

        let db = MemoryDB::default();
        db.write(
            format!("{}/{}", PROVIDER_NS, deal.proposal_cid),
            deal.marshal_cbor().unwrap(),
        )
        .unwrap();
        let key = deal.proposal_cid;
        let group: ProviderGroup = StateGroup::resume(db, PROVIDER_NS, env.clone())
            .await
            .unwrap();

        // the restart is scheduled off the handler task
        task::sleep(Duration::from_millis(100)).await;
        assert_eq!(env.restart_calls.lock().as_slice(), &[chid]);
        let deal = group.get(&key).await.unwrap();
        assert_eq!(deal.state, StorageDealStatus::Transferring);

        // the transfer completing still advances the deal
        group
            .send(&key, ProviderEvent::DataTransferCompleted)
            .await
            .unwrap();
        wait_for_state(&group, &key, StorageDealStatus::ReserveProviderFunds).await;
    })
}

#[test]
fn restart_without_channel_id_fails_deal() {
    task::block_on(async {
        let env = Arc::new(FakeEnv::default());
        let deal = make_deal(default_proposal(), StorageDealStatus::Transferring, random_peer());
        let (_group, deal) = run_until(env.clone(), deal, StorageDealStatus::Error).await;
        assert_eq!(
            deal.message,
            "restarting data transfer: channel id on provider deal is unset"
        );
        assert!(env.restart_calls.lock().is_empty());
    })
}

#[test]
fn fail_deal_cleans_up_resources() {
    task::block_on(async {
        let env = Arc::new(FakeEnv::default());
        let mut deal = make_deal(default_proposal(), StorageDealStatus::Failing, random_peer());
        deal.message = "deal rejected: it is a bad deal".to_string();
        deal.funds_reserved = TokenAmount::from_atto(10_000);
        deal.store_id = Some(4);
        let (_group, deal) = run_until(env.clone(), deal, StorageDealStatus::Error).await;

        assert_eq!(deal.message, "deal rejected: it is a bad deal");
        assert!(deal.funds_reserved.is_zero());
        assert_eq!(env.node.released.lock().len(), 1);
        assert_eq!(env.deleted_stores.lock().as_slice(), &[4]);
        assert_eq!(env.untags.lock().len(), 1);
    })
}
