// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{Error, Store};
use parking_lot::Mutex;

/// A persisted monotonic counter, used to hand out locally unique deal ids.
pub struct StoredCounter<DB> {
    db: DB,
    key: Vec<u8>,
    lock: Mutex<()>,
}

impl<DB: Store> StoredCounter<DB> {
    pub fn new(db: DB, key: &str) -> Self {
        StoredCounter {
            db,
            key: key.as_bytes().to_vec(),
            lock: Mutex::new(()),
        }
    }

    /// Returns the next value of the counter and durably advances it.
    pub fn next(&self) -> Result<u64, Error> {
        let _guard = self.lock.lock();
        let next = match self.db.read(&self.key)? {
            Some(bz) => {
                let arr: [u8; 8] = bz
                    .try_into()
                    .map_err(|_| Error::Other("stored counter corrupted".to_string()))?;
                u64::from_be_bytes(arr) + 1
            }
            None => 0,
        };
        self.db.write(&self.key, next.to_be_bytes())?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDB;

    #[test]
    fn counter_advances_and_persists() {
        let db = MemoryDB::default();
        let counter = StoredCounter::new(db.clone(), "/counter/deals");
        assert_eq!(counter.next().unwrap(), 0);
        assert_eq!(counter.next().unwrap(), 1);

        // a counter reopened over the same store resumes
        let counter = StoredCounter::new(db, "/counter/deals");
        assert_eq!(counter.next().unwrap(), 2);
    }
}
