// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::encoding::hex_bytes_64;
use crate::error::{MeshSigError, Result};
use crate::keys::{derive_address, verify_digest, SignerKeys};
use crate::types::{now_ms, CompressedPublicKey, Multiaddr, PeerId};

pub const ADVERTISEMENT_PROTOCOL: &str = "meshsig/signer-advertisement/1";
pub const DEFAULT_ADVERTISEMENT_TTL: Duration = Duration::from_secs(600);

pub const MAX_ADDRS: usize = 16;
pub const MAX_TRANSACTION_KINDS: usize = 16;
pub const MAX_TRANSACTION_KIND_LENGTH: usize = 64;
pub const MAX_ID_LENGTH: usize = 128;

const SIGNING_DOMAIN_TAG: &[u8] = b"meshsig-advertisement-v1";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerCapabilities {
    pub transaction_kinds: Vec<String>,
    /// Fee charged per co-signature, in the chain's base unit.
    pub fee: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_from: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_until: Option<u64>,
}

impl SignerCapabilities {
    pub fn new(transaction_kinds: Vec<String>, fee: u64) -> Self {
        Self {
            transaction_kinds,
            fee,
            available_from: None,
            available_until: None,
        }
    }

    pub fn with_availability(mut self, from: u64, until: u64) -> Self {
        self.available_from = Some(from);
        self.available_until = Some(until);
        self
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.transaction_kinds.iter().any(|k| k == kind)
    }

    pub fn is_available_at(&self, now_ms: u64) -> bool {
        self.available_from.map_or(true, |from| now_ms >= from)
            && self.available_until.map_or(true, |until| now_ms < until)
    }
}

/// A signed, time-boxed claim of a peer's dialable addresses and signer
/// capabilities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    pub id: String,
    pub protocol: String,
    pub peer_id: PeerId,
    pub public_key: CompressedPublicKey,
    pub multiaddrs: Vec<Multiaddr>,
    pub relay_addrs: Vec<Multiaddr>,
    #[serde(default)]
    pub webrtc_addr: Option<Multiaddr>,
    pub wallet_address: String,
    pub capabilities: SignerCapabilities,
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(with = "hex_bytes_64")]
    pub signature: [u8; 64],
}

impl Advertisement {
    /// Digest covered by `signature`: every other field, length-prefixed.
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(SIGNING_DOMAIN_TAG);
        put_str(&mut hasher, &self.id);
        put_str(&mut hasher, &self.protocol);
        put_str(&mut hasher, self.peer_id.as_str());
        hasher.update(self.public_key.as_bytes());
        put_addrs(&mut hasher, &self.multiaddrs);
        put_addrs(&mut hasher, &self.relay_addrs);
        match &self.webrtc_addr {
            Some(addr) => {
                hasher.update([1u8]);
                put_str(&mut hasher, addr.as_str());
            }
            None => hasher.update([0u8]),
        }
        put_str(&mut hasher, &self.wallet_address);
        hasher.update((self.capabilities.transaction_kinds.len() as u32).to_be_bytes());
        for kind in &self.capabilities.transaction_kinds {
            put_str(&mut hasher, kind);
        }
        hasher.update(self.capabilities.fee.to_be_bytes());
        put_opt_u64(&mut hasher, self.capabilities.available_from);
        put_opt_u64(&mut hasher, self.capabilities.available_until);
        hasher.update(self.created_at.to_be_bytes());
        hasher.update(self.expires_at.to_be_bytes());
        hasher.finalize().into()
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }

    pub fn validate_structure(&self) -> Result<()> {
        if self.protocol != ADVERTISEMENT_PROTOCOL {
            return Err(MeshSigError::Protocol(format!(
                "Unexpected advertisement protocol '{}'",
                self.protocol
            )));
        }
        if self.id.is_empty() || self.id.len() > MAX_ID_LENGTH {
            return Err(MeshSigError::Protocol("Invalid advertisement id".into()));
        }
        if self.peer_id.as_str().is_empty() {
            return Err(MeshSigError::Protocol("Missing peer id".into()));
        }
        if self.expires_at <= self.created_at {
            return Err(MeshSigError::Protocol(
                "Advertisement expires before it was created".into(),
            ));
        }
        if self.multiaddrs.len() > MAX_ADDRS || self.relay_addrs.len() > MAX_ADDRS {
            return Err(MeshSigError::Protocol("Too many addresses".into()));
        }
        for addr in self
            .multiaddrs
            .iter()
            .chain(self.relay_addrs.iter())
            .chain(self.webrtc_addr.iter())
        {
            Multiaddr::parse(addr.as_str())?;
        }
        let kinds = &self.capabilities.transaction_kinds;
        if kinds.len() > MAX_TRANSACTION_KINDS
            || kinds.iter().any(|k| k.len() > MAX_TRANSACTION_KIND_LENGTH)
        {
            return Err(MeshSigError::Protocol("Invalid capabilities".into()));
        }
        if self.wallet_address != derive_address(&self.public_key) {
            return Err(MeshSigError::Protocol(
                "Wallet address does not match public key".into(),
            ));
        }
        Ok(())
    }

    pub fn verify_signature(&self) -> Result<()> {
        verify_digest(&self.public_key, &self.signing_digest(), &self.signature)
    }

    /// Full acceptance check: structure, expiry and signature.
    pub fn verify(&self, now_ms: u64) -> Result<()> {
        self.validate_structure()?;
        if self.is_expired_at(now_ms) {
            return Err(MeshSigError::Expired(format!(
                "advertisement {} from {} expired at {}",
                self.id, self.peer_id, self.expires_at
            )));
        }
        self.verify_signature()
    }

    /// Every address that embeds a circuit-relay or WebRTC segment.
    pub fn embedded_relay_or_webrtc_addrs(&self) -> impl Iterator<Item = &Multiaddr> {
        self.multiaddrs
            .iter()
            .filter(|a| a.is_circuit_relay() || a.is_webrtc())
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn put_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u32).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn put_addrs(hasher: &mut Sha256, addrs: &[Multiaddr]) {
    hasher.update((addrs.len() as u32).to_be_bytes());
    for addr in addrs {
        put_str(hasher, addr.as_str());
    }
}

fn put_opt_u64(hasher: &mut Sha256, value: Option<u64>) {
    match value {
        Some(v) => {
            hasher.update([1u8]);
            hasher.update(v.to_be_bytes());
        }
        None => hasher.update([0u8]),
    }
}

/// Builds and signs this peer's outgoing advertisement.
#[derive(Clone, Debug)]
pub struct AdvertisementBuilder {
    peer_id: PeerId,
    multiaddrs: Vec<Multiaddr>,
    relay_addrs: Vec<Multiaddr>,
    webrtc_addr: Option<Multiaddr>,
    capabilities: SignerCapabilities,
    ttl: Duration,
    created_at: Option<u64>,
}

impl AdvertisementBuilder {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            multiaddrs: Vec::new(),
            relay_addrs: Vec::new(),
            webrtc_addr: None,
            capabilities: SignerCapabilities::default(),
            ttl: DEFAULT_ADVERTISEMENT_TTL,
            created_at: None,
        }
    }

    pub fn multiaddrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.multiaddrs = addrs;
        self
    }

    pub fn relay_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.relay_addrs = addrs;
        self
    }

    pub fn webrtc_addr(mut self, addr: Option<Multiaddr>) -> Self {
        self.webrtc_addr = addr;
        self
    }

    pub fn capabilities(mut self, capabilities: SignerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Pin the creation time (milliseconds). Defaults to now.
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn sign(self, keys: &SignerKeys) -> Result<Advertisement> {
        if self.ttl.is_zero() {
            return Err(MeshSigError::Protocol(
                "Advertisement TTL must be positive".into(),
            ));
        }
        let created_at = self.created_at.unwrap_or_else(now_ms);
        let public_key = keys.public_key();
        let mut advertisement = Advertisement {
            id: hex::encode(rand::random::<[u8; 16]>()),
            protocol: ADVERTISEMENT_PROTOCOL.to_string(),
            peer_id: self.peer_id,
            public_key,
            multiaddrs: self.multiaddrs,
            relay_addrs: self.relay_addrs,
            webrtc_addr: self.webrtc_addr,
            wallet_address: derive_address(&public_key),
            capabilities: self.capabilities,
            created_at,
            expires_at: created_at.saturating_add(self.ttl.as_millis() as u64),
            signature: [0u8; 64],
        };
        advertisement.validate_structure()?;
        advertisement.signature = keys.sign_digest(&advertisement.signing_digest());
        Ok(advertisement)
    }
}
