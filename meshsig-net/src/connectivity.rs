// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Connection establishment with a prioritized fallback chain.
//!
//! For a peer that is not already connected the manager tries, in order:
//!
//! 1. the advertised WebRTC address,
//! 2. each advertised relay address,
//! 3. a relay address learned through peer exchange (short-lived),
//! 4. the transport's own relay helper,
//! 5. any advertised multiaddr that embeds `/p2p-circuit` or `/webrtc`.
//!
//! The first step that succeeds wins. A failing or timed-out step never stops
//! the chain; only exhaustion is reported, as one aggregate error.
//!
//! Concurrent calls for the same peer share a single attempt.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::advertisement::Advertisement;
use crate::error::{MeshSigError, Result};
use crate::presence::PeerExchange;
use crate::transport::{Connection, Transport};
use crate::types::{now_ms, ConnectionType, Multiaddr, PeerId};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RELAY_HINT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub status: ConnectionState,
    pub connection_type: ConnectionType,
    pub last_attempt_at: Option<u64>,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            status: ConnectionState::Disconnected,
            connection_type: ConnectionType::None,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectivityConfig {
    pub step_timeout: Duration,
    pub relay_hint_ttl: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            relay_hint_ttl: DEFAULT_RELAY_HINT_TTL,
        }
    }
}

impl ConnectivityConfig {
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_relay_hint_ttl(mut self, ttl: Duration) -> Self {
        self.relay_hint_ttl = ttl;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay after the given failed attempt (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub success: bool,
    pub connection_type: ConnectionType,
    pub error: Option<MeshSigError>,
}

impl ConnectOutcome {
    fn connected(connection_type: ConnectionType) -> Self {
        Self {
            success: true,
            connection_type,
            error: None,
        }
    }

    fn failed(error: MeshSigError) -> Self {
        Self {
            success: false,
            connection_type: ConnectionType::None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<ConnectionType> {
        match self.error {
            None if self.success => Ok(self.connection_type),
            Some(e) => Err(e),
            None => Err(MeshSigError::Network("connection failed".into())),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ConnectivityEvent {
    StatusChanged {
        peer_id: PeerId,
        status: ConnectionStatus,
    },
    RelayHintLearned {
        peer_id: PeerId,
        relay_addr: Multiaddr,
    },
}

#[derive(Clone, Debug)]
struct RelayHint {
    addr: Multiaddr,
    expires_at: u64,
}

type InFlight = watch::Receiver<Option<ConnectOutcome>>;

enum Role {
    Leader(watch::Sender<Option<ConnectOutcome>>),
    Follower(InFlight),
}

pub struct ConnectivityManager {
    transport: Arc<dyn Transport>,
    config: ConnectivityConfig,
    statuses: RwLock<HashMap<PeerId, ConnectionStatus>>,
    in_flight: Mutex<HashMap<PeerId, InFlight>>,
    relay_hints: RwLock<HashMap<PeerId, RelayHint>>,
    event_tx: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectivityConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            config,
            statuses: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            relay_hints: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.event_tx.subscribe()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    pub fn status(&self, peer_id: &PeerId) -> ConnectionStatus {
        self.statuses
            .read()
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> HashMap<PeerId, ConnectionStatus> {
        self.statuses.read().clone()
    }

    /// Connected according to both the recorded status and the transport.
    pub async fn is_connected(&self, peer_id: &PeerId) -> bool {
        if self.status(peer_id).status != ConnectionState::Connected {
            return false;
        }
        self.live_connection(peer_id).await.is_some()
    }

    pub fn mark_disconnected(&self, peer_id: &PeerId) {
        let known = self.statuses.read().contains_key(peer_id);
        if !known {
            return;
        }
        self.update_status(peer_id, |s| {
            s.status = ConnectionState::Disconnected;
            s.connection_type = ConnectionType::None;
        });
    }

    /// Remember relay addresses gossiped by other peers.
    pub fn record_peer_exchange(&self, exchange: &PeerExchange, now_ms: u64) -> usize {
        let local = self.transport.local_peer_id();
        let expires_at = now_ms.saturating_add(self.config.relay_hint_ttl.as_millis() as u64);
        let mut learned = Vec::new();
        {
            let mut hints = self.relay_hints.write();
            for entry in &exchange.peers {
                if entry.peer_id == local {
                    continue;
                }
                let Some(addr) = entry.relay_addr.as_ref() else {
                    continue;
                };
                hints.insert(
                    entry.peer_id.clone(),
                    RelayHint {
                        addr: addr.clone(),
                        expires_at,
                    },
                );
                learned.push((entry.peer_id.clone(), addr.clone()));
            }
        }
        let count = learned.len();
        for (peer_id, relay_addr) in learned {
            let _ = self.event_tx.send(ConnectivityEvent::RelayHintLearned {
                peer_id,
                relay_addr,
            });
        }
        count
    }

    pub fn relay_hint(&self, peer_id: &PeerId, now_ms: u64) -> Option<Multiaddr> {
        self.relay_hints
            .read()
            .get(peer_id)
            .filter(|h| h.expires_at > now_ms)
            .map(|h| h.addr.clone())
    }

    pub fn prune_relay_hints(&self, now_ms: u64) -> usize {
        let mut hints = self.relay_hints.write();
        let before = hints.len();
        hints.retain(|_, h| h.expires_at > now_ms);
        before - hints.len()
    }

    /// Establish a connection to `peer_id` using its advertisement.
    pub async fn connect(&self, peer_id: &PeerId, advertisement: &Advertisement) -> ConnectOutcome {
        if &advertisement.peer_id != peer_id {
            return ConnectOutcome::failed(MeshSigError::Protocol(format!(
                "Advertisement for {} used to connect to {peer_id}",
                advertisement.peer_id
            )));
        }

        if let Some(connection) = self.live_connection(peer_id).await {
            let current = self.status(peer_id);
            let connection_type = if current.status == ConnectionState::Connected {
                current.connection_type
            } else {
                infer_connection_type(&connection.remote_addr)
            };
            if current.status != ConnectionState::Connected {
                self.update_status(peer_id, |s| {
                    s.status = ConnectionState::Connected;
                    s.connection_type = connection_type;
                    s.last_error = None;
                });
            }
            debug!(peer_id = %peer_id, %connection_type, "Already connected");
            return ConnectOutcome::connected(connection_type);
        }
        if self.status(peer_id).status == ConnectionState::Connected {
            debug!(peer_id = %peer_id, "Recorded connection is gone");
            self.mark_disconnected(peer_id);
        }

        let role = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(peer_id) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(peer_id.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                debug!(peer_id = %peer_id, "Joining in-flight connection attempt");
                match rx.wait_for(|outcome| outcome.is_some()).await {
                    Ok(outcome) => outcome
                        .clone()
                        .unwrap_or_else(|| ConnectOutcome::failed(MeshSigError::Cancelled)),
                    Err(_) => ConnectOutcome::failed(MeshSigError::Cancelled),
                }
            }
            Role::Leader(tx) => {
                let mut guard = AttemptGuard {
                    manager: self,
                    peer_id: peer_id.clone(),
                    tx: Some(tx),
                };
                self.update_status(peer_id, |s| {
                    s.status = ConnectionState::Connecting;
                    s.last_attempt_at = Some(now_ms());
                });

                let outcome = self.run_chain(peer_id, advertisement).await;

                self.update_status(peer_id, |s| {
                    if outcome.success {
                        s.status = ConnectionState::Connected;
                        s.connection_type = outcome.connection_type;
                        s.last_error = None;
                    } else {
                        s.status = ConnectionState::Failed;
                        s.connection_type = ConnectionType::None;
                        s.last_error = outcome.error.as_ref().map(|e| e.to_string());
                    }
                });
                guard.complete(outcome.clone());
                outcome
            }
        }
    }

    /// `connect` with exponential backoff between attempts. Stops early on
    /// success or on an error that retrying cannot fix.
    pub async fn connect_with_retry(
        &self,
        peer_id: &PeerId,
        advertisement: &Advertisement,
        policy: &RetryPolicy,
    ) -> ConnectOutcome {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = self.connect(peer_id, advertisement).await;
            if outcome.success {
                if attempt > 1 {
                    info!(peer_id = %peer_id, attempt, "Connected after retry");
                }
                return outcome;
            }
            let retryable = outcome.error.as_ref().is_some_and(|e| e.is_retryable());
            if !retryable || attempt >= max_attempts {
                warn!(
                    peer_id = %peer_id,
                    attempt,
                    error = ?outcome.error,
                    "Giving up on connection"
                );
                return outcome;
            }
            let delay = policy.delay_for(attempt);
            debug!(peer_id = %peer_id, attempt, ?delay, "Retrying connection");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn live_connection(&self, peer_id: &PeerId) -> Option<Connection> {
        self.transport
            .list_connections()
            .await
            .into_iter()
            .find(|c| &c.peer_id == peer_id)
    }

    async fn run_chain(&self, peer_id: &PeerId, ad: &Advertisement) -> ConnectOutcome {
        let mut failures: Vec<MeshSigError> = Vec::new();
        let mut had_candidate = false;
        let mut tried: HashSet<Multiaddr> = HashSet::new();

        if let Some(addr) = &ad.webrtc_addr {
            had_candidate = true;
            tried.insert(addr.clone());
            match self.dial_step(peer_id, addr).await {
                Ok(()) => return ConnectOutcome::connected(ConnectionType::Webrtc),
                Err(e) => failures.push(e),
            }
        }

        for addr in &ad.relay_addrs {
            if !tried.insert(addr.clone()) {
                continue;
            }
            had_candidate = true;
            match self.dial_step(peer_id, addr).await {
                Ok(()) => return ConnectOutcome::connected(ConnectionType::Relay),
                Err(e) => failures.push(e),
            }
        }

        if let Some(addr) = self.relay_hint(peer_id, now_ms()) {
            if tried.insert(addr.clone()) {
                had_candidate = true;
                match self.dial_step(peer_id, &addr).await {
                    Ok(()) => return ConnectOutcome::connected(ConnectionType::Relay),
                    Err(e) => failures.push(e),
                }
            }
        }

        let helper =
            tokio::time::timeout(self.config.step_timeout, self.transport.relay_connect(peer_id))
                .await;
        match helper {
            Ok(Ok(())) => return ConnectOutcome::connected(ConnectionType::Relay),
            Ok(Err(MeshSigError::NoRelayAddress(_))) => {
                debug!(peer_id = %peer_id, "Relay helper had no candidate");
            }
            Ok(Err(e)) => {
                had_candidate = true;
                debug!(peer_id = %peer_id, error = %e, "Relay helper failed");
                failures.push(e);
            }
            Err(_) => {
                had_candidate = true;
                failures.push(MeshSigError::Timeout(format!(
                    "relay helper for {peer_id} after {:?}",
                    self.config.step_timeout
                )));
            }
        }

        for addr in ad.embedded_relay_or_webrtc_addrs() {
            if !tried.insert(addr.clone()) {
                continue;
            }
            had_candidate = true;
            match self.dial_step(peer_id, addr).await {
                Ok(()) => return ConnectOutcome::connected(infer_connection_type(addr)),
                Err(e) => failures.push(e),
            }
        }

        ConnectOutcome::failed(aggregate_failure(peer_id, had_candidate, &failures))
    }

    async fn dial_step(&self, peer_id: &PeerId, addr: &Multiaddr) -> Result<()> {
        debug!(peer_id = %peer_id, addr = %addr, "Dialing");
        let result = tokio::time::timeout(self.config.step_timeout, self.transport.dial(addr)).await;
        match result {
            Ok(Ok(remote)) if &remote == peer_id => Ok(()),
            Ok(Ok(remote)) => Err(MeshSigError::Rejected(format!(
                "{addr} answered as {remote}, expected {peer_id}"
            ))),
            Ok(Err(e)) => {
                debug!(peer_id = %peer_id, addr = %addr, error = %e, "Dial failed");
                Err(e)
            }
            Err(_) => Err(MeshSigError::Timeout(format!(
                "dial {addr} after {:?}",
                self.config.step_timeout
            ))),
        }
    }

    fn update_status(&self, peer_id: &PeerId, f: impl FnOnce(&mut ConnectionStatus)) {
        let status = {
            let mut statuses = self.statuses.write();
            let status = statuses.entry(peer_id.clone()).or_default();
            f(status);
            status.clone()
        };
        let _ = self.event_tx.send(ConnectivityEvent::StatusChanged {
            peer_id: peer_id.clone(),
            status,
        });
    }
}

/// Resolves the shared attempt for a peer. Dropped without `complete`
/// (the connecting future was cancelled), it fails the attempt.
struct AttemptGuard<'a> {
    manager: &'a ConnectivityManager,
    peer_id: PeerId,
    tx: Option<watch::Sender<Option<ConnectOutcome>>>,
}

impl AttemptGuard<'_> {
    fn complete(&mut self, outcome: ConnectOutcome) {
        if let Some(tx) = self.tx.take() {
            self.manager.in_flight.lock().remove(&self.peer_id);
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_none() {
            return;
        }
        warn!(peer_id = %self.peer_id, "Connection attempt cancelled");
        self.manager.update_status(&self.peer_id, |s| {
            s.status = ConnectionState::Failed;
            s.connection_type = ConnectionType::None;
            s.last_error = Some(MeshSigError::Cancelled.to_string());
        });
        self.complete(ConnectOutcome::failed(MeshSigError::Cancelled));
    }
}

fn infer_connection_type(addr: &Multiaddr) -> ConnectionType {
    if addr.is_circuit_relay() {
        ConnectionType::Relay
    } else if addr.is_webrtc() {
        ConnectionType::Webrtc
    } else {
        ConnectionType::Direct
    }
}

fn aggregate_failure(peer_id: &PeerId, had_candidate: bool, failures: &[MeshSigError]) -> MeshSigError {
    if !had_candidate || failures.is_empty() {
        return MeshSigError::NoRelayAddress(peer_id.to_string());
    }
    let summary = failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    if failures
        .iter()
        .all(|e| matches!(e, MeshSigError::Rejected(_)))
    {
        MeshSigError::Rejected(format!("{peer_id}: {summary}"))
    } else if failures
        .iter()
        .any(|e| matches!(e, MeshSigError::Timeout(_)))
    {
        MeshSigError::Timeout(format!("{peer_id}: {summary}"))
    } else {
        MeshSigError::Network(format!("{peer_id}: {summary}"))
    }
}
