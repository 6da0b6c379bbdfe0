// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Seam to the underlying peer-to-peer stack.
//!
//! Implementations map their failures onto [`MeshSigError`]:
//! `Rejected` when the remote refused, `Timeout` when the dial did not
//! complete, `WebRtcNegotiationFailed` for ICE/SDP failures, `NoRelayAddress`
//! when a helper had nothing to try, and `Network` for everything else.
//!
//! [`MeshSigError`]: crate::error::MeshSigError

#![forbid(unsafe_code)]

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Multiaddr, PeerId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub peer_id: PeerId,
    pub remote_addr: Multiaddr,
}

#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub from: PeerId,
    pub topic: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Dial an address and return the authenticated remote peer.
    async fn dial(&self, addr: &Multiaddr) -> Result<PeerId>;

    /// Live connections as reported by the stack, not a cached view.
    async fn list_connections(&self) -> Vec<Connection>;

    /// Stack-provided relay discovery and reservation for a peer.
    async fn relay_connect(&self, peer_id: &PeerId) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<InboundMessage>>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;
}
