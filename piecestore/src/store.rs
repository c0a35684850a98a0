// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::types::{BlockLocation, CidInfo, DealInfo, PieceBlockLocation, PieceInfo};
use crate::{Error, PieceStore};
use cid::Cid;
use db::Store;
use fvm_ipld_encoding::Cbor;
use std::collections::HashMap;

const PIECE_PREFIX: &str = "/pieces";
const CID_INFO_PREFIX: &str = "/cid-infos";

/// Piece metadata persisted in a datastore, shared across deals.
pub struct DsPieceStore<DB> {
    db: DB,
}

impl<DB: Store> DsPieceStore<DB> {
    pub fn new(db: DB) -> Self {
        DsPieceStore { db }
    }

    fn piece_key(piece_cid: &Cid) -> String {
        format!("{}/{}", PIECE_PREFIX, piece_cid)
    }

    fn cid_info_key(payload_cid: &Cid) -> String {
        format!("{}/{}", CID_INFO_PREFIX, payload_cid)
    }

    fn mutate_piece_info(
        &self,
        piece_cid: &Cid,
        mutate: impl FnOnce(&mut PieceInfo),
    ) -> Result<(), Error> {
        let key = Self::piece_key(piece_cid);
        let mut info = match self.db.read(&key)? {
            Some(bz) => PieceInfo::unmarshal_cbor(&bz)?,
            None => PieceInfo {
                piece_cid: *piece_cid,
                deals: Vec::new(),
            },
        };
        mutate(&mut info);
        self.db.write(&key, info.marshal_cbor()?)?;
        Ok(())
    }

    fn mutate_cid_info(
        &self,
        payload_cid: &Cid,
        mutate: impl FnOnce(&mut CidInfo),
    ) -> Result<(), Error> {
        let key = Self::cid_info_key(payload_cid);
        let mut info = match self.db.read(&key)? {
            Some(bz) => CidInfo::unmarshal_cbor(&bz)?,
            None => CidInfo {
                cid: *payload_cid,
                piece_block_locations: Vec::new(),
            },
        };
        mutate(&mut info);
        self.db.write(&key, info.marshal_cbor()?)?;
        Ok(())
    }
}

impl<DB: Store + Send + Sync> PieceStore for DsPieceStore<DB> {
    fn add_deal_for_piece(&self, piece_cid: &Cid, deal_info: DealInfo) -> Result<(), Error> {
        self.mutate_piece_info(piece_cid, |info| {
            if !info.deals.contains(&deal_info) {
                info.deals.push(deal_info);
            }
        })
    }

    fn add_piece_block_locations(
        &self,
        piece_cid: &Cid,
        block_locations: &HashMap<Cid, BlockLocation>,
    ) -> Result<(), Error> {
        for (payload_cid, location) in block_locations {
            self.mutate_cid_info(payload_cid, |info| {
                let placement = PieceBlockLocation {
                    piece_cid: *piece_cid,
                    location: *location,
                };
                if !info.piece_block_locations.contains(&placement) {
                    info.piece_block_locations.push(placement);
                }
            })?;
        }
        Ok(())
    }

    fn get_piece_info(&self, piece_cid: &Cid) -> Result<PieceInfo, Error> {
        let bz = self
            .db
            .read(Self::piece_key(piece_cid))?
            .ok_or(Error::NotFound)?;
        Ok(PieceInfo::unmarshal_cbor(&bz)?)
    }

    fn get_cid_info(&self, payload_cid: &Cid) -> Result<CidInfo, Error> {
        let bz = self
            .db
            .read(Self::cid_info_key(payload_cid))?
            .ok_or(Error::NotFound)?;
        Ok(CidInfo::unmarshal_cbor(&bz)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryDB;
    use fvm_shared::piece::PaddedPieceSize;
    use shared::testutil::{random_cid, random_piece_cid};

    fn deal_info(deal_id: u64) -> DealInfo {
        DealInfo {
            deal_id,
            sector_id: 42,
            offset: PaddedPieceSize(0),
            length: PaddedPieceSize(1 << 20),
        }
    }

    #[test]
    fn deals_accumulate_per_piece() {
        let store = DsPieceStore::new(MemoryDB::default());
        let piece_cid = random_piece_cid();

        store.add_deal_for_piece(&piece_cid, deal_info(1)).unwrap();
        store.add_deal_for_piece(&piece_cid, deal_info(2)).unwrap();
        // duplicates are ignored
        store.add_deal_for_piece(&piece_cid, deal_info(2)).unwrap();

        let info = store.get_piece_info(&piece_cid).unwrap();
        assert_eq!(info.piece_cid, piece_cid);
        assert_eq!(info.deals.len(), 2);
    }

    #[test]
    fn block_locations_index_by_payload_cid() {
        let store = DsPieceStore::new(MemoryDB::default());
        let piece_cid = random_piece_cid();
        let payload_cid = random_cid();

        let mut locations = HashMap::new();
        locations.insert(
            payload_cid,
            BlockLocation {
                rel_offset: 0,
                block_size: 2048,
            },
        );
        store
            .add_piece_block_locations(&piece_cid, &locations)
            .unwrap();
        store
            .add_piece_block_locations(&piece_cid, &locations)
            .unwrap();

        let info = store.get_cid_info(&payload_cid).unwrap();
        assert_eq!(info.piece_block_locations.len(), 1);
        assert_eq!(info.piece_block_locations[0].piece_cid, piece_cid);
    }

    #[test]
    fn missing_piece_is_not_found() {
        let store = DsPieceStore::new(MemoryDB::default());
        assert!(matches!(
            store.get_piece_info(&random_piece_cid()),
            Err(Error::NotFound)
        ));
    }
}
