// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::advertisement::{Advertisement, SignerCapabilities};
use crate::encoding::buffer_64;
use crate::error::Result;
use crate::types::{CompressedPublicKey, Multiaddr, PeerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    /// Received over the presence channel.
    Overlay,
    /// Loaded from durable storage at startup.
    Restored,
    /// Imported by an operator.
    Manual,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub advertisement: Advertisement,
    pub inserted_at: u64,
    pub source: EntrySource,
}

impl CacheEntry {
    pub fn peer_id(&self) -> &PeerId {
        &self.advertisement.peer_id
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.advertisement.is_expired_at(now_ms)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let record = StoredEntry {
            advertisement: StoredAdvertisement::from(&self.advertisement),
            inserted_at: self.inserted_at,
            source: self.source,
        };
        Ok(serde_json::to_vec(&record)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let record: StoredEntry = serde_json::from_slice(bytes)?;
        Ok(Self {
            advertisement: record.advertisement.into(),
            inserted_at: record.inserted_at,
            source: record.source,
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    advertisement: StoredAdvertisement,
    inserted_at: u64,
    source: EntrySource,
}

/// Persisted advertisement layout. Identical to the wire form except that
/// the signature is kept as a binary buffer object.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAdvertisement {
    id: String,
    protocol: String,
    peer_id: PeerId,
    public_key: CompressedPublicKey,
    multiaddrs: Vec<Multiaddr>,
    relay_addrs: Vec<Multiaddr>,
    #[serde(default)]
    webrtc_addr: Option<Multiaddr>,
    wallet_address: String,
    capabilities: SignerCapabilities,
    created_at: u64,
    expires_at: u64,
    #[serde(with = "buffer_64")]
    signature: [u8; 64],
}

impl From<&Advertisement> for StoredAdvertisement {
    fn from(ad: &Advertisement) -> Self {
        Self {
            id: ad.id.clone(),
            protocol: ad.protocol.clone(),
            peer_id: ad.peer_id.clone(),
            public_key: ad.public_key,
            multiaddrs: ad.multiaddrs.clone(),
            relay_addrs: ad.relay_addrs.clone(),
            webrtc_addr: ad.webrtc_addr.clone(),
            wallet_address: ad.wallet_address.clone(),
            capabilities: ad.capabilities.clone(),
            created_at: ad.created_at,
            expires_at: ad.expires_at,
            signature: ad.signature,
        }
    }
}

impl From<StoredAdvertisement> for Advertisement {
    fn from(s: StoredAdvertisement) -> Self {
        Self {
            id: s.id,
            protocol: s.protocol,
            peer_id: s.peer_id,
            public_key: s.public_key,
            multiaddrs: s.multiaddrs,
            relay_addrs: s.relay_addrs,
            webrtc_addr: s.webrtc_addr,
            wallet_address: s.wallet_address,
            capabilities: s.capabilities,
            created_at: s.created_at,
            expires_at: s.expires_at,
            signature: s.signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::tests::signed_advertisement;
    use crate::keys::SignerKeys;

    #[test]
    fn test_record_keeps_signature_as_buffer() {
        let keys = SignerKeys::generate();
        let entry = CacheEntry {
            advertisement: signed_advertisement(&keys, "peer-a"),
            inserted_at: 42,
            source: EntrySource::Overlay,
        };
        let bytes = entry.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["source"], "overlay");
        assert_eq!(value["insertedAt"], 42);
        assert_eq!(value["advertisement"]["signature"]["type"], "Buffer");

        let restored = CacheEntry::decode(&bytes).unwrap();
        assert_eq!(restored, entry);
        restored.advertisement.verify_signature().unwrap();
    }
}
