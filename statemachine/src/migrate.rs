// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::errors::Error;
use db::Store;

/// Rewrites one record from schema version `n` to `n + 1`.
pub type MigrationFn = fn(&[u8]) -> Result<Vec<u8>, Error>;

/// An in-order list of schema migrations for one datastore namespace.
/// Step `i` migrates version `i` records to version `i + 1`; the target
/// schema version is the number of steps.
pub struct Migrations {
    steps: Vec<MigrationFn>,
}

impl Migrations {
    pub fn new(steps: Vec<MigrationFn>) -> Self {
        Migrations { steps }
    }

    pub fn target_version(&self) -> u64 {
        self.steps.len() as u64
    }

    /// Brings every record under the namespace up to the target schema.
    /// Must complete before the state group over the namespace is resumed.
    pub fn migrate<DB: Store>(&self, db: &DB, ns: &str) -> Result<(), Error> {
        let version_key = format!("/versions{}", ns);
        let current = match db.read(&version_key)? {
            Some(bz) => {
                let arr: [u8; 8] = bz
                    .try_into()
                    .map_err(|_| Error::Other("corrupt schema version key".to_string()))?;
                u64::from_be_bytes(arr)
            }
            None => 0,
        };
        let target = self.target_version();
        if current > target {
            return Err(Error::UnsupportedSchema {
                actual: current,
                supported: target,
            });
        }

        let prefix = format!("{}/", ns);
        for version in current..target {
            let step = self.steps[version as usize];
            for key in db.prefixed_keys(&prefix)? {
                let Some(bz) = db.read(&key)? else {
                    continue;
                };
                db.write(&key, step(&bz)?)?;
            }
            db.write(&version_key, (version + 1).to_be_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryDB;

    fn append_byte(bz: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = bz.to_vec();
        out.push(0xff);
        Ok(out)
    }

    #[test]
    fn runs_pending_steps_once() {
        let db = MemoryDB::default();
        db.write("/deals/test/a", [1u8]).unwrap();
        db.write("/deals/test/b", [2u8]).unwrap();

        let migrations = Migrations::new(vec![append_byte]);
        migrations.migrate(&db, "/deals/test").unwrap();
        assert_eq!(db.read("/deals/test/a").unwrap().unwrap(), vec![1, 0xff]);

        // already at the target version, nothing rewritten
        migrations.migrate(&db, "/deals/test").unwrap();
        assert_eq!(db.read("/deals/test/a").unwrap().unwrap(), vec![1, 0xff]);
        assert_eq!(db.read("/deals/test/b").unwrap().unwrap(), vec![2, 0xff]);
    }

    #[test]
    fn rejects_newer_schema() {
        let db = MemoryDB::default();
        db.write("/versions/deals/test", 3u64.to_be_bytes()).unwrap();
        let migrations = Migrations::new(vec![append_byte]);
        let err = migrations.migrate(&db, "/deals/test").unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedSchema {
                actual: 3,
                supported: 1
            }
        ));
    }
}
