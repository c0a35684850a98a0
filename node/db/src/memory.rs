// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{Error, Store};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A thread-safe `HashMap` wrapper.
#[derive(Debug, Default, Clone)]
pub struct MemoryDB {
    db: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl Store for MemoryDB {
    fn write<K, V>(&self, key: K, value: V) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.db
            .write()
            .insert(key.as_ref().to_vec(), value.as_ref().to_vec());
        Ok(())
    }

    fn delete<K>(&self, key: K) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
    {
        self.db.write().remove(key.as_ref());
        Ok(())
    }

    fn read<K>(&self, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.db.read().get(key.as_ref()).cloned())
    }

    fn exists<K>(&self, key: K) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.db.read().contains_key(key.as_ref()))
    }

    fn prefixed_keys<K>(&self, prefix: K) -> Result<Vec<Vec<u8>>, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self
            .db
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix.as_ref()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_db_write() {
        let db = MemoryDB::default();
        let key = [1u8];
        let value = [1u8];
        db.write(key, value).unwrap();
        assert!(db.exists(key).unwrap());
    }

    #[test]
    fn mem_db_read() {
        let db = MemoryDB::default();
        let key = [0u8];
        let value = [1u8];
        db.write(key, value).unwrap();
        let res = db.read(key).unwrap().unwrap();
        assert_eq!(value.as_ref(), res.as_slice());
    }

    #[test]
    fn mem_db_delete() {
        let db = MemoryDB::default();
        let key = [0u8];
        let value = [1u8];
        db.write(key, value).unwrap();
        db.delete(key).unwrap();
        assert!(!db.exists(key).unwrap());
        assert_eq!(db.read(key).unwrap(), None);
    }

    #[test]
    fn mem_db_prefixed_keys() {
        let db = MemoryDB::default();
        db.write(b"/deals/1", [0u8]).unwrap();
        db.write(b"/deals/2", [0u8]).unwrap();
        db.write(b"/asks/1", [0u8]).unwrap();
        let mut keys = db.prefixed_keys(b"/deals/").unwrap();
        keys.sort();
        assert_eq!(keys, vec![b"/deals/1".to_vec(), b"/deals/2".to_vec()]);
    }
}
