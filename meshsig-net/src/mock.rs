// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory stand-ins for the networking stack and the MuSig2 library.
//!
//! [`MockNetwork`] connects any number of [`MockTransport`]s in one process:
//! dials resolve against registered listen addresses, pub/sub fans out to
//! every other subscriber in publish order, and individual addresses can be
//! scripted to fail. [`MockMusig`] is deterministic and offers no security.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::trace;

use crate::crypto::{
    AggregatedNonce, FinalSignature, KeyAggContext, MusigBackend, PartialSignature, PublicNonce,
    SecretNonce,
};
use crate::error::{MeshSigError, Result};
use crate::keys::SignerKeys;
use crate::transport::{Connection, InboundMessage, Transport};
use crate::types::{CompressedPublicKey, Multiaddr, PeerId};

const SUBSCRIPTION_CAPACITY: usize = 1024;

/// How a scripted address fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialFailure {
    Timeout,
    Rejected,
    Network,
    WebRtc,
    /// Never answers; only the caller's own timeout ends the dial.
    Hang,
}

impl DialFailure {
    fn into_error(self, addr: &Multiaddr) -> MeshSigError {
        match self {
            DialFailure::Timeout => MeshSigError::Timeout(format!("dial {addr}")),
            DialFailure::Rejected => MeshSigError::Rejected(format!("{addr} refused")),
            DialFailure::Network => MeshSigError::Network(format!("{addr} unreachable")),
            DialFailure::WebRtc => MeshSigError::WebRtcNegotiationFailed(format!("ICE failed for {addr}")),
            DialFailure::Hang => MeshSigError::Timeout(format!("dial {addr}")),
        }
    }
}

struct ScriptedFailure {
    failure: DialFailure,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Default)]
struct MockNode {
    online: bool,
    connections: HashMap<PeerId, Multiaddr>,
    subscriptions: HashMap<String, Vec<mpsc::Sender<InboundMessage>>>,
    relay_helper: bool,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, MockNode>,
    listeners: HashMap<Multiaddr, PeerId>,
    failures: HashMap<Multiaddr, ScriptedFailure>,
    dial_counts: HashMap<Multiaddr, usize>,
    relay_helper_calls: HashMap<PeerId, usize>,
    dial_delay: Duration,
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its transport.
    pub fn transport(&self, peer_id: impl Into<PeerId>) -> Arc<MockTransport> {
        let peer_id = peer_id.into();
        self.state
            .write()
            .nodes
            .entry(peer_id.clone())
            .or_insert_with(|| MockNode {
                online: true,
                ..MockNode::default()
            });
        Arc::new(MockTransport {
            network: self.clone(),
            peer_id,
        })
    }

    /// Make `addr` reach `peer_id`.
    pub fn listen(&self, peer_id: &PeerId, addr: &Multiaddr) {
        self.state
            .write()
            .listeners
            .insert(addr.clone(), peer_id.clone());
    }

    pub fn fail_addr(&self, addr: &Multiaddr, failure: DialFailure) {
        self.state.write().failures.insert(
            addr.clone(),
            ScriptedFailure {
                failure,
                remaining: None,
            },
        );
    }

    /// Fail the next `times` dials of `addr`, then behave normally.
    pub fn fail_addr_times(&self, addr: &Multiaddr, failure: DialFailure, times: usize) {
        self.state.write().failures.insert(
            addr.clone(),
            ScriptedFailure {
                failure,
                remaining: Some(times),
            },
        );
    }

    pub fn clear_failure(&self, addr: &Multiaddr) {
        self.state.write().failures.remove(addr);
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        self.state.write().dial_delay = delay;
    }

    /// Let the transport's relay helper reach `peer_id`.
    pub fn enable_relay_helper(&self, peer_id: &PeerId) {
        if let Some(node) = self.state.write().nodes.get_mut(peer_id) {
            node.relay_helper = true;
        }
    }

    pub fn dial_count(&self, addr: &Multiaddr) -> usize {
        self.state.read().dial_counts.get(addr).copied().unwrap_or(0)
    }

    pub fn total_dials(&self) -> usize {
        self.state.read().dial_counts.values().sum()
    }

    pub fn relay_helper_calls(&self, peer_id: &PeerId) -> usize {
        self.state
            .read()
            .relay_helper_calls
            .get(peer_id)
            .copied()
            .unwrap_or(0)
    }

    /// Take a node offline and drop every connection it had.
    pub fn set_offline(&self, peer_id: &PeerId) {
        let mut state = self.state.write();
        if let Some(node) = state.nodes.get_mut(peer_id) {
            node.online = false;
            node.connections.clear();
        }
        for node in state.nodes.values_mut() {
            node.connections.remove(peer_id);
        }
    }

    pub fn set_online(&self, peer_id: &PeerId) {
        if let Some(node) = self.state.write().nodes.get_mut(peer_id) {
            node.online = true;
        }
    }

    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.write();
        if let Some(node) = state.nodes.get_mut(a) {
            node.connections.remove(b);
        }
        if let Some(node) = state.nodes.get_mut(b) {
            node.connections.remove(a);
        }
    }

    fn link(state: &mut NetworkState, a: &PeerId, b: &PeerId, addr: &Multiaddr) {
        if let Some(node) = state.nodes.get_mut(a) {
            node.connections.insert(b.clone(), addr.clone());
        }
        if let Some(node) = state.nodes.get_mut(b) {
            node.connections.insert(a.clone(), addr.clone());
        }
    }
}

pub struct MockTransport {
    network: MockNetwork,
    peer_id: PeerId,
}

impl MockTransport {
    pub fn network(&self) -> &MockNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<PeerId> {
        let (delay, failure) = {
            let mut state = self.network.state.write();
            *state.dial_counts.entry(addr.clone()).or_default() += 1;
            let failure = match state.failures.get_mut(addr) {
                Some(scripted) => match scripted.remaining.as_mut() {
                    None => Some(scripted.failure),
                    Some(0) => None,
                    Some(n) => {
                        *n -= 1;
                        Some(scripted.failure)
                    }
                },
                None => None,
            };
            (state.dial_delay, failure)
        };
        trace!(from = %self.peer_id, addr = %addr, "Mock dial");

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(DialFailure::Hang) => std::future::pending::<()>().await,
            Some(failure) => return Err(failure.into_error(addr)),
            None => {}
        }

        let mut state = self.network.state.write();
        let remote = state
            .listeners
            .get(addr)
            .cloned()
            .ok_or_else(|| MeshSigError::Network(format!("No route to {addr}")))?;
        if !state.nodes.get(&remote).is_some_and(|n| n.online) {
            return Err(MeshSigError::Network(format!("{remote} is offline")));
        }
        MockNetwork::link(&mut state, &self.peer_id, &remote, addr);
        Ok(remote)
    }

    async fn list_connections(&self) -> Vec<Connection> {
        self.network
            .state
            .read()
            .nodes
            .get(&self.peer_id)
            .map(|node| {
                node.connections
                    .iter()
                    .map(|(peer_id, remote_addr)| Connection {
                        peer_id: peer_id.clone(),
                        remote_addr: remote_addr.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn relay_connect(&self, peer_id: &PeerId) -> Result<()> {
        let mut state = self.network.state.write();
        *state.relay_helper_calls.entry(peer_id.clone()).or_default() += 1;
        let reachable = state
            .nodes
            .get(peer_id)
            .is_some_and(|n| n.online && n.relay_helper);
        if !reachable {
            return Err(MeshSigError::NoRelayAddress(peer_id.to_string()));
        }
        let addr = Multiaddr::parse(&format!("/memory/relay/p2p-circuit/p2p/{peer_id}"))?;
        MockNetwork::link(&mut state, &self.peer_id, peer_id, &addr);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<InboundMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut state = self.network.state.write();
        let node = state
            .nodes
            .get_mut(&self.peer_id)
            .ok_or_else(|| MeshSigError::Transport(format!("{} is not registered", self.peer_id)))?;
        node.subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        // Fan-out happens under the write lock so a reply can never overtake
        // the message that caused it.
        let state = self.network.state.write();
        if !state.nodes.get(&self.peer_id).is_some_and(|n| n.online) {
            return Err(MeshSigError::Transport(format!("{} is offline", self.peer_id)));
        }
        let targets = state
            .nodes
            .iter()
            .filter(|(peer_id, node)| **peer_id != self.peer_id && node.online)
            .filter_map(|(_, node)| node.subscriptions.get(topic))
            .flatten();
        for tx in targets {
            let message = InboundMessage {
                from: self.peer_id.clone(),
                topic: topic.to_string(),
                data: data.clone(),
            };
            if let Err(e) = tx.try_send(message) {
                trace!(topic, error = %e, "Dropping message for slow or closed subscriber");
            }
        }
        Ok(())
    }
}

/// Deterministic MuSig2 stand-in. Partial signatures depend only on public
/// data, so aggregation can check each one.
#[derive(Clone, Debug, Default)]
pub struct MockMusig;

impl MockMusig {
    pub fn new() -> Self {
        Self
    }

    fn expected_partial(
        key_agg_ctx: &KeyAggContext,
        signer_index: usize,
        aggregated_nonce: &AggregatedNonce,
        message: &[u8],
    ) -> Result<[u8; 32]> {
        let key = key_agg_ctx
            .public_keys
            .get(signer_index)
            .ok_or_else(|| MeshSigError::Crypto(format!("No signer at index {signer_index}")))?;
        Ok(tagged_hash(
            b"partial",
            &[
                aggregated_nonce.as_bytes(),
                &key_agg_ctx.aggregated_key.as_bytes()[..],
                &key.as_bytes()[..],
                &(signer_index as u32).to_be_bytes()[..],
                message,
            ],
        ))
    }

    fn challenge(r: &[u8; 32], aggregated_key: &CompressedPublicKey, message: &[u8]) -> [u8; 32] {
        tagged_hash(b"challenge", &[&r[..], &aggregated_key.as_bytes()[..], message])
    }
}

fn tagged_hash(tag: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"meshsig-mock-musig/");
    hasher.update(tag);
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn nonce_bytes(seed: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(66);
    out.push(0x02);
    out.extend_from_slice(&tagged_hash(b"nonce-1", &[&seed[..]]));
    out.push(0x03);
    out.extend_from_slice(&tagged_hash(b"nonce-2", &[&seed[..]]));
    out
}

impl MusigBackend for MockMusig {
    fn aggregate_keys(&self, sorted_keys: &[CompressedPublicKey]) -> Result<KeyAggContext> {
        if sorted_keys.len() < 2 {
            return Err(MeshSigError::Crypto("Need at least two keys".into()));
        }
        if sorted_keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MeshSigError::Crypto("Keys must be sorted and distinct".into()));
        }
        let parts: Vec<&[u8]> = sorted_keys.iter().map(|k| k.as_bytes().as_slice()).collect();
        let seed = tagged_hash(b"keyagg", &parts);
        let aggregated_key = SignerKeys::from_secret_bytes(&seed)?.public_key();
        Ok(KeyAggContext {
            aggregated_key,
            public_keys: sorted_keys.to_vec(),
            state: seed.to_vec(),
        })
    }

    fn generate_nonce(
        &self,
        secret_key: &[u8; 32],
        aggregated_key: &CompressedPublicKey,
        message: &[u8],
    ) -> Result<(SecretNonce, PublicNonce)> {
        let entropy: [u8; 32] = rand::random();
        let seed = tagged_hash(
            b"secnonce",
            &[&entropy[..], &secret_key[..], &aggregated_key.as_bytes()[..], message],
        );
        let public = PublicNonce::from_bytes(nonce_bytes(&seed))?;
        Ok((SecretNonce::new(seed.to_vec()), public))
    }

    fn aggregate_nonces(&self, public_nonces: &[PublicNonce]) -> Result<AggregatedNonce> {
        if public_nonces.is_empty() {
            return Err(MeshSigError::Crypto("No nonces to aggregate".into()));
        }
        let parts: Vec<&[u8]> = public_nonces.iter().map(|n| n.as_bytes()).collect();
        AggregatedNonce::from_bytes(nonce_bytes(&tagged_hash(b"aggnonce", &parts)))
    }

    fn partial_sign(
        &self,
        secret_nonce: SecretNonce,
        secret_key: &[u8; 32],
        key_agg_ctx: &KeyAggContext,
        signer_index: usize,
        aggregated_nonce: &AggregatedNonce,
        message: &[u8],
    ) -> Result<PartialSignature> {
        if secret_nonce.as_bytes().len() != 32 {
            return Err(MeshSigError::Crypto("Malformed secret nonce".into()));
        }
        let signer = SignerKeys::from_secret_bytes(secret_key)?.public_key();
        if key_agg_ctx.public_keys.get(signer_index) != Some(&signer) {
            return Err(MeshSigError::Crypto(format!(
                "Secret key does not belong to signer {signer_index}"
            )));
        }
        let partial = Self::expected_partial(key_agg_ctx, signer_index, aggregated_nonce, message)?;
        PartialSignature::from_bytes(partial.to_vec())
    }

    fn aggregate_signatures(
        &self,
        partials: &[PartialSignature],
        aggregated_nonce: &AggregatedNonce,
        message: &[u8],
        key_agg_ctx: &KeyAggContext,
    ) -> Result<FinalSignature> {
        if partials.len() != key_agg_ctx.public_keys.len() {
            return Err(MeshSigError::Crypto(format!(
                "Expected {} partial signatures, got {}",
                key_agg_ctx.public_keys.len(),
                partials.len()
            )));
        }
        for (index, partial) in partials.iter().enumerate() {
            let expected = Self::expected_partial(key_agg_ctx, index, aggregated_nonce, message)?;
            if partial.as_bytes() != expected {
                return Err(MeshSigError::Crypto(format!(
                    "Invalid partial signature from signer {index}"
                )));
            }
        }
        let r = tagged_hash(b"r", &[aggregated_nonce.as_bytes()]);
        let s = Self::challenge(&r, &key_agg_ctx.aggregated_key, message);
        let mut signature = [0u8; 64];
        signature[..32].copy_from_slice(&r);
        signature[32..].copy_from_slice(&s);
        Ok(FinalSignature(signature))
    }

    fn verify(
        &self,
        signature: &FinalSignature,
        aggregated_key: &CompressedPublicKey,
        message: &[u8],
    ) -> Result<()> {
        let mut r = [0u8; 32];
        r.copy_from_slice(&signature.0[..32]);
        if signature.0[32..] != Self::challenge(&r, aggregated_key, message) {
            return Err(MeshSigError::Crypto("Signature verification failed".into()));
        }
        Ok(())
    }
}
