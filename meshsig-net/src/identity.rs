// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::advertisement::{Advertisement, SignerCapabilities};
use crate::error::{MeshSigError, Result};
use crate::keys::derive_address;
use crate::types::{CompressedPublicKey, Multiaddr, PeerId};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub public_key: CompressedPublicKey,
    pub address: String,
    pub peer_id: Option<PeerId>,
    pub multiaddrs: Vec<Multiaddr>,
    pub online: bool,
    pub last_seen: Option<u64>,
    pub capabilities: Option<SignerCapabilities>,
    pub stale: bool,
}

impl Identity {
    pub fn new(public_key: CompressedPublicKey) -> Self {
        Self {
            address: derive_address(&public_key),
            public_key,
            peer_id: None,
            multiaddrs: Vec::new(),
            online: false,
            last_seen: None,
            capabilities: None,
            stale: false,
        }
    }

    fn touch(&mut self, now_ms: u64) {
        self.last_seen = Some(now_ms);
        self.online = true;
        self.stale = false;
    }

    pub fn can_sign(&self, kind: &str, now_ms: u64) -> bool {
        !self.stale
            && self
                .capabilities
                .as_ref()
                .is_some_and(|c| c.supports(kind) && c.is_available_at(now_ms))
    }
}

/// Known identities keyed by public key. Entries are never removed, only
/// marked stale once they stop being seen.
pub struct IdentityRegistry {
    identities: BTreeMap<CompressedPublicKey, Identity>,
    stale_after: Duration,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self {
            identities: BTreeMap::new(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn insert(&mut self, public_key: CompressedPublicKey) -> &Identity {
        self.identities
            .entry(public_key)
            .or_insert_with(|| Identity::new(public_key))
    }

    /// Create or refresh the identity behind a verified advertisement.
    /// A peer ID held by another live identity is refused; one held by a
    /// stale identity is handed over.
    pub fn observe_advertisement(&mut self, ad: &Advertisement, now_ms: u64) -> Result<&Identity> {
        if let Some(holder) = self
            .identities
            .values_mut()
            .find(|i| i.public_key != ad.public_key && i.peer_id.as_ref() == Some(&ad.peer_id))
        {
            if !holder.stale {
                return Err(MeshSigError::Unauthorized(format!(
                    "{} already belongs to {}",
                    ad.peer_id, holder.public_key
                )));
            }
            debug!(peer_id = %ad.peer_id, previous = %holder.public_key, "Peer ID moved to a new key");
            holder.peer_id = None;
            holder.online = false;
        }
        let identity = self
            .identities
            .entry(ad.public_key)
            .or_insert_with(|| Identity::new(ad.public_key));
        identity.peer_id = Some(ad.peer_id.clone());
        identity.multiaddrs = ad.multiaddrs.clone();
        identity.capabilities = Some(ad.capabilities.clone());
        identity.touch(now_ms);
        Ok(identity)
    }

    pub fn mark_online(&mut self, peer_id: &PeerId, now_ms: u64) {
        if let Some(identity) = self.find_by_peer_mut(peer_id) {
            identity.touch(now_ms);
        }
    }

    pub fn mark_offline(&mut self, peer_id: &PeerId) {
        if let Some(identity) = self.find_by_peer_mut(peer_id) {
            identity.online = false;
        }
    }

    /// Flag identities not seen within the staleness window. Returns how
    /// many became stale on this pass.
    pub fn mark_stale(&mut self, now_ms: u64) -> usize {
        let threshold = self.stale_after.as_millis() as u64;
        let mut count = 0;
        for identity in self.identities.values_mut() {
            if identity.stale {
                continue;
            }
            let idle = identity
                .last_seen
                .map_or(true, |seen| now_ms.saturating_sub(seen) >= threshold);
            if idle {
                identity.stale = true;
                identity.online = false;
                count += 1;
            }
        }
        if count > 0 {
            debug!(count, "Marked identities stale");
        }
        count
    }

    pub fn get(&self, public_key: &CompressedPublicKey) -> Option<&Identity> {
        self.identities.get(public_key)
    }

    pub fn get_by_peer_id(&self, peer_id: &PeerId) -> Option<&Identity> {
        self.identities
            .values()
            .find(|i| i.peer_id.as_ref() == Some(peer_id))
    }

    fn find_by_peer_mut(&mut self, peer_id: &PeerId) -> Option<&mut Identity> {
        self.identities
            .values_mut()
            .find(|i| i.peer_id.as_ref() == Some(peer_id))
    }

    pub fn all(&self) -> Vec<&Identity> {
        self.identities.values().collect()
    }

    pub fn signers_for(&self, kind: &str, now_ms: u64) -> Vec<&Identity> {
        self.identities
            .values()
            .filter(|i| i.online && i.can_sign(kind, now_ms))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::tests::signed_advertisement;
    use crate::keys::SignerKeys;

    #[test]
    fn test_advertisement_creates_identity() {
        let keys = SignerKeys::generate();
        let ad = signed_advertisement(&keys, "peer-a");
        let mut registry = IdentityRegistry::new();

        let identity = registry.observe_advertisement(&ad, 1_000).unwrap();
        assert_eq!(identity.address, ad.wallet_address);
        assert_eq!(identity.peer_id, Some(PeerId::new("peer-a")));
        assert!(identity.online);
        assert_eq!(registry.signers_for("spend", 1_000).len(), 1);
        assert!(registry.signers_for("vote", 1_000).is_empty());
    }

    #[test]
    fn test_stale_identities_are_kept() {
        let keys = SignerKeys::generate();
        let ad = signed_advertisement(&keys, "peer-a");
        let mut registry = IdentityRegistry::new().with_stale_after(Duration::from_secs(10));
        registry.observe_advertisement(&ad, 1_000).unwrap();

        assert_eq!(registry.mark_stale(5_000), 0);
        assert_eq!(registry.mark_stale(11_000), 1);
        assert_eq!(registry.mark_stale(20_000), 0);

        let identity = registry.get(&keys.public_key()).unwrap();
        assert!(identity.stale);
        assert!(!identity.online);
        assert_eq!(registry.len(), 1);

        registry.mark_online(&PeerId::new("peer-a"), 21_000);
        assert!(!registry.get(&keys.public_key()).unwrap().stale);
    }

    #[test]
    fn test_peer_id_claimed_by_one_live_identity() {
        let owner = SignerKeys::generate();
        let intruder = SignerKeys::generate();
        let mut registry = IdentityRegistry::new().with_stale_after(Duration::from_secs(10));
        registry
            .observe_advertisement(&signed_advertisement(&owner, "peer-v"), 1_000)
            .unwrap();

        let claim = signed_advertisement(&intruder, "peer-v");
        assert!(matches!(
            registry.observe_advertisement(&claim, 2_000),
            Err(MeshSigError::Unauthorized(_))
        ));
        assert_eq!(
            registry.get_by_peer_id(&PeerId::new("peer-v")).unwrap().public_key,
            owner.public_key()
        );
        assert!(registry.get(&intruder.public_key()).is_none());

        registry.mark_stale(20_000);
        registry.observe_advertisement(&claim, 21_000).unwrap();
        assert_eq!(
            registry.get_by_peer_id(&PeerId::new("peer-v")).unwrap().public_key,
            intruder.public_key()
        );
        assert!(registry.get(&owner.public_key()).unwrap().peer_id.is_none());
    }

    #[test]
    fn test_explicit_insert_has_no_peer() {
        let keys = SignerKeys::generate();
        let mut registry = IdentityRegistry::new();
        let identity = registry.insert(keys.public_key()).clone();
        assert!(identity.peer_id.is_none());
        assert!(identity.address.starts_with("ms1"));
        assert!(registry.get_by_peer_id(&PeerId::new("peer-a")).is_none());
    }
}
