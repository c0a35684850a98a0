// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

/// Serde helpers encoding a libp2p `PeerId` as its raw multihash bytes,
/// for use with `#[serde(with = "peer_ser")]` on deal records.
pub mod peer_ser {
    use libp2p_identity::PeerId;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(pid: &PeerId, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&pid.to_bytes())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PeerId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bz = serde_bytes::ByteBuf::deserialize(deserializer)?;
        PeerId::from_bytes(&bz).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use libp2p_identity::PeerId;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper(#[serde(with = "super::peer_ser")] PeerId);

    #[test]
    fn peer_id_cbor_round_trip() {
        let pid = crate::testutil::random_peer();
        let bz = fvm_ipld_encoding::to_vec(&Wrapper(pid)).unwrap();
        let back: Wrapper = fvm_ipld_encoding::from_slice(&bz).unwrap();
        assert_eq!(back.0, pid);
    }
}
