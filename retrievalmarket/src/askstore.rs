// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::types::Ask;
use db::Store;
use fvm_ipld_encoding::Cbor;
use parking_lot::RwLock;

const ASK_KEY: &str = "/retrieval-ask";

/// The provider's retrieval pricing, persisted across restarts.
pub struct AskStore<DB> {
    db: DB,
    ask: RwLock<Ask>,
}

impl<DB: Store> AskStore<DB> {
    pub fn new(db: DB) -> Result<Self, db::Error> {
        let ask = match db.read(ASK_KEY)? {
            Some(bz) => Ask::unmarshal_cbor(&bz)
                .map_err(|e| db::Error::Other(format!("decoding stored ask: {}", e)))?,
            None => Ask::default(),
        };
        Ok(AskStore {
            db,
            ask: RwLock::new(ask),
        })
    }

    pub fn get(&self) -> Ask {
        self.ask.read().clone()
    }

    pub fn set(&self, ask: Ask) -> Result<(), db::Error> {
        let bz = ask
            .marshal_cbor()
            .map_err(|e| db::Error::Other(format!("encoding ask: {}", e)))?;
        self.db.write(ASK_KEY, bz)?;
        *self.ask.write() = ask;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryDB;
    use fvm_shared::econ::TokenAmount;

    #[test]
    fn ask_persists_across_reopen() {
        let db = MemoryDB::default();
        let store = AskStore::new(db.clone()).unwrap();
        assert_eq!(store.get(), Ask::default());

        let ask = Ask {
            price_per_byte: TokenAmount::from_atto(1000u64),
            unseal_price: TokenAmount::from_atto(5000u64),
            payment_interval: 10_000,
            payment_interval_increase: 1_000,
        };
        store.set(ask.clone()).unwrap();

        let reopened = AskStore::new(db).unwrap();
        assert_eq!(reopened.get(), ask);
    }
}
