// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The provider's signed ask, persisted across restarts and re-signed on
//! every update.

use crate::nodes::{NodeError, StorageProviderNode};
use crate::types::{SignedStorageAsk, StorageAsk};
use async_std::sync::RwLock;
use db::Store;
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use std::sync::Arc;
use thiserror::Error;

const ASK_KEY: &str = "/latest-ask";

/// Default unverified price: 0.0000000005 FIL per GiB per epoch.
pub const DEFAULT_PRICE: u64 = 500_000_000;
/// Verified deals default to a tenth of the unverified price.
pub const DEFAULT_VERIFIED_PRICE: u64 = 50_000_000;
pub const DEFAULT_MIN_PIECE_SIZE: u64 = 256;
pub const DEFAULT_MAX_PIECE_SIZE: u64 = 1 << 30;
/// How long a published ask stays valid.
pub const DEFAULT_ASK_DURATION: ChainEpoch = 180 * crate::types::EPOCHS_IN_DAY;

#[derive(Debug, Error)]
pub enum AskError {
    #[error("datastore: {0}")]
    Db(#[from] db::Error),
    #[error("encoding ask: {0}")]
    Encoding(String),
    #[error("node: {0}")]
    Node(#[from] NodeError),
}

impl From<fvm_ipld_encoding::Error> for AskError {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        AskError::Encoding(e.to_string())
    }
}

/// The provider's current ask, kept signed and durable.
pub struct StoredAsk<DB> {
    db: DB,
    actor: Address,
    node: Arc<dyn StorageProviderNode>,
    ask: RwLock<SignedStorageAsk>,
}

impl<DB: Store + Send + Sync> StoredAsk<DB> {
    /// Loads the persisted ask, or signs and stores a default one.
    pub async fn new(
        db: DB,
        actor: Address,
        node: Arc<dyn StorageProviderNode>,
    ) -> Result<Self, AskError> {
        let ask = match db.read(ASK_KEY)? {
            Some(bz) => SignedStorageAsk::unmarshal_cbor(&bz)?,
            None => {
                let ask = sign_ask(
                    node.as_ref(),
                    default_ask(actor, 0),
                )
                .await?;
                db.write(ASK_KEY, ask.marshal_cbor()?)?;
                ask
            }
        };
        Ok(StoredAsk {
            db,
            actor,
            node,
            ask: RwLock::new(ask),
        })
    }

    pub async fn get(&self) -> SignedStorageAsk {
        self.ask.read().await.clone()
    }

    pub async fn ask(&self) -> StorageAsk {
        self.ask.read().await.ask.clone()
    }

    /// Replaces the current ask, bumping its sequence number and re-signing.
    pub async fn set(
        &self,
        price: TokenAmount,
        verified_price: TokenAmount,
        duration: ChainEpoch,
        min_piece_size: PaddedPieceSize,
        max_piece_size: PaddedPieceSize,
    ) -> Result<(), AskError> {
        let (_, epoch) = self.node.get_chain_head().await?;
        let mut guard = self.ask.write().await;
        let ask = StorageAsk {
            price,
            verified_price,
            min_piece_size,
            max_piece_size,
            miner: self.actor,
            timestamp: epoch,
            expiry: epoch + duration,
            seq_no: guard.ask.seq_no + 1,
        };
        let signed = sign_ask(self.node.as_ref(), ask).await?;
        self.db.write(ASK_KEY, signed.marshal_cbor()?)?;
        *guard = signed;
        Ok(())
    }
}

fn default_ask(miner: Address, seq_no: u64) -> StorageAsk {
    StorageAsk {
        price: TokenAmount::from_atto(DEFAULT_PRICE),
        verified_price: TokenAmount::from_atto(DEFAULT_VERIFIED_PRICE),
        min_piece_size: PaddedPieceSize(DEFAULT_MIN_PIECE_SIZE),
        max_piece_size: PaddedPieceSize(DEFAULT_MAX_PIECE_SIZE),
        miner,
        timestamp: 0,
        expiry: DEFAULT_ASK_DURATION,
        seq_no,
    }
}

async fn sign_ask(
    node: &dyn StorageProviderNode,
    ask: StorageAsk,
) -> Result<SignedStorageAsk, AskError> {
    let (tok, _) = node.get_chain_head().await?;
    let worker = node.get_miner_worker_address(&ask.miner, &tok).await?;
    let bz = ask.marshal_cbor()?;
    let signature = node.sign_bytes(&worker, &bz).await?;
    Ok(SignedStorageAsk { ask, signature })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestNode;
    use async_std::task;
    use db::MemoryDB;

    #[test]
    fn creates_default_then_persists_updates() {
        task::block_on(async {
            let db = MemoryDB::default();
            let actor = Address::new_id(200);
            let node: Arc<dyn StorageProviderNode> = Arc::new(TestNode::default());

            let stored = StoredAsk::new(db.clone(), actor, node.clone()).await.unwrap();
            let ask = stored.ask().await;
            assert_eq!(ask.price, TokenAmount::from_atto(DEFAULT_PRICE));
            assert_eq!(ask.min_piece_size.0, DEFAULT_MIN_PIECE_SIZE);
            assert_eq!(ask.seq_no, 0);

            stored
                .set(
                    TokenAmount::from_atto(123u64),
                    TokenAmount::from_atto(12u64),
                    1000,
                    PaddedPieceSize(256),
                    PaddedPieceSize(1 << 20),
                )
                .await
                .unwrap();

            // a stored ask reopened over the same datastore keeps the update
            let reopened = StoredAsk::new(db, actor, node).await.unwrap();
            let ask = reopened.ask().await;
            assert_eq!(ask.price, TokenAmount::from_atto(123u64));
            assert_eq!(ask.seq_no, 1);
            assert_eq!(ask.expiry, 50 + 1000);
        })
    }
}
