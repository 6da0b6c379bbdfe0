// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tracing::{debug, error, info, warn};

use crate::advertisement::{Advertisement, AdvertisementBuilder, SignerCapabilities, DEFAULT_ADVERTISEMENT_TTL};
use crate::cache::{DiscoveryCache, EntrySource};
use crate::connectivity::{
    ConnectionState, ConnectivityConfig, ConnectivityEvent, ConnectivityManager, RetryPolicy,
};
use crate::crypto::MusigBackend;
use crate::error::{MeshSigError, Result};
use crate::identity::{Identity, IdentityRegistry};
use crate::keys::SignerKeys;
use crate::presence::{PeerExchange, PeerExchangeEntry, PresenceMessage, PRESENCE_TOPIC, SESSION_TOPIC};
use crate::session::{SessionConfig, SessionCoordinator, SessionEvent, SessionMessage, SigningSession};
use crate::transport::{InboundMessage, Transport};
use crate::types::{now_ms, CompressedPublicKey, Multiaddr, PeerId};
use crate::verifier::{ParticipantVerifier, QuorumPolicy};

pub const DEFAULT_REANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const NODE_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub reannounce_interval: Duration,
    pub sweep_interval: Duration,
    pub advertisement_ttl: Duration,
    pub multiaddrs: Vec<Multiaddr>,
    pub relay_addrs: Vec<Multiaddr>,
    pub webrtc_addr: Option<Multiaddr>,
    pub capabilities: SignerCapabilities,
    pub connectivity: ConnectivityConfig,
    pub retry: RetryPolicy,
    pub quorum: QuorumPolicy,
    pub session: SessionConfig,
    /// Stop `run` and flush the cache on Ctrl-C or SIGTERM.
    pub handle_termination_signals: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            reannounce_interval: DEFAULT_REANNOUNCE_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            advertisement_ttl: DEFAULT_ADVERTISEMENT_TTL,
            multiaddrs: Vec::new(),
            relay_addrs: Vec::new(),
            webrtc_addr: None,
            capabilities: SignerCapabilities::default(),
            connectivity: ConnectivityConfig::default(),
            retry: RetryPolicy::default(),
            quorum: QuorumPolicy::default(),
            session: SessionConfig::default(),
            handle_termination_signals: true,
        }
    }
}

impl NodeConfig {
    pub fn with_reannounce_interval(mut self, interval: Duration) -> Self {
        self.reannounce_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_advertisement_ttl(mut self, ttl: Duration) -> Self {
        self.advertisement_ttl = ttl;
        self
    }

    pub fn with_multiaddrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.multiaddrs = addrs;
        self
    }

    pub fn with_relay_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.relay_addrs = addrs;
        self
    }

    pub fn with_webrtc_addr(mut self, addr: Option<Multiaddr>) -> Self {
        self.webrtc_addr = addr;
        self
    }

    pub fn with_capabilities(mut self, capabilities: SignerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_connectivity(mut self, connectivity: ConnectivityConfig) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_termination_signals(mut self, enabled: bool) -> Self {
        self.handle_termination_signals = enabled;
        self
    }
}

#[derive(Clone, Debug)]
pub enum MeshNodeEvent {
    PeerDiscovered {
        peer_id: PeerId,
        public_key: CompressedPublicKey,
    },
    PeerOffline {
        peer_id: PeerId,
    },
}

/// One participant in the signing mesh: presence, discovery, connectivity
/// and session coordination wired to a transport.
pub struct MeshNode {
    keys: SignerKeys,
    transport: Arc<dyn Transport>,
    cache: DiscoveryCache,
    identities: RwLock<IdentityRegistry>,
    connectivity: Arc<ConnectivityManager>,
    coordinator: SessionCoordinator,
    config: NodeConfig,
    event_tx: broadcast::Sender<MeshNodeEvent>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_rx: TokioMutex<Option<mpsc::Receiver<()>>>,
}

impl MeshNode {
    pub fn new(
        keys: SignerKeys,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn MusigBackend>,
        cache: DiscoveryCache,
        config: NodeConfig,
    ) -> Self {
        let local_peer_id = transport.local_peer_id();
        let connectivity = Arc::new(ConnectivityManager::new(
            transport.clone(),
            config.connectivity.clone(),
        ));
        let verifier = Arc::new(
            ParticipantVerifier::new(connectivity.clone(), cache.clone())
                .with_retry_policy(config.retry.clone()),
        );
        let coordinator = SessionCoordinator::new(
            local_peer_id,
            keys.clone(),
            backend,
            verifier,
            config.session.clone(),
        );
        let (event_tx, _) = broadcast::channel(NODE_EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Self {
            keys,
            transport,
            cache,
            identities: RwLock::new(IdentityRegistry::new()),
            connectivity,
            coordinator,
            config,
            event_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx: TokioMutex::new(Some(shutdown_rx)),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    pub fn public_key(&self) -> CompressedPublicKey {
        self.keys.public_key()
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityManager> {
        &self.connectivity
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshNodeEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.subscribe()
    }

    pub fn identity(&self, public_key: &CompressedPublicKey) -> Option<Identity> {
        self.identities.read().get(public_key).cloned()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.identities.read().all().into_iter().cloned().collect()
    }

    /// Online identities able to co-sign `kind` right now.
    pub fn signers_for(&self, kind: &str) -> Vec<Identity> {
        self.identities
            .read()
            .signers_for(kind, now_ms())
            .into_iter()
            .cloned()
            .collect()
    }

    /// Sender that stops [`run`](Self::run). Can be taken once.
    pub fn take_shutdown_handle(&self) -> Option<mpsc::Sender<()>> {
        self.shutdown_tx.lock().take()
    }

    pub fn advertisement(&self) -> Result<Advertisement> {
        AdvertisementBuilder::new(self.local_peer_id())
            .multiaddrs(self.config.multiaddrs.clone())
            .relay_addrs(self.config.relay_addrs.clone())
            .webrtc_addr(self.config.webrtc_addr.clone())
            .capabilities(self.config.capabilities.clone())
            .ttl(self.config.advertisement_ttl)
            .sign(&self.keys)
    }

    pub async fn announce(&self) -> Result<()> {
        let message = PresenceMessage::Advertisement(self.advertisement()?);
        self.transport
            .publish(PRESENCE_TOPIC, message.to_bytes()?)
            .await?;
        info!(peer_id = %self.local_peer_id(), "Announced presence");
        Ok(())
    }

    /// Gossip relay paths to the peers we are connected to.
    pub async fn share_peers(&self) -> Result<usize> {
        let now = now_ms();
        let peers: Vec<PeerExchangeEntry> = self
            .transport
            .list_connections()
            .await
            .into_iter()
            .filter_map(|connection| {
                let entry = self.cache.get(&connection.peer_id)?;
                let ad = &entry.advertisement;
                Some(PeerExchangeEntry {
                    peer_id: ad.peer_id.clone(),
                    multiaddrs: ad.multiaddrs.clone(),
                    relay_addr: ad.relay_addrs.first().cloned(),
                    last_seen: now,
                })
            })
            .take(crate::presence::MAX_PEER_EXCHANGE_ENTRIES)
            .collect();
        if peers.is_empty() {
            return Ok(0);
        }
        let count = peers.len();
        let message = PresenceMessage::PeerExchange(PeerExchange { peers });
        self.transport
            .publish(PRESENCE_TOPIC, message.to_bytes()?)
            .await?;
        debug!(count, "Shared peer relay paths");
        Ok(count)
    }

    /// Resolve participant public keys to peers through discovered
    /// identities. This node's own key maps to itself.
    pub fn resolve_participants(
        &self,
        public_keys: &[CompressedPublicKey],
    ) -> Result<Vec<(PeerId, CompressedPublicKey)>> {
        let local_key = self.public_key();
        let identities = self.identities.read();
        public_keys
            .iter()
            .map(|key| {
                if *key == local_key {
                    return Ok((self.local_peer_id(), *key));
                }
                identities
                    .get(key)
                    .and_then(|identity| identity.peer_id.clone())
                    .map(|peer_id| (peer_id, *key))
                    .ok_or_else(|| MeshSigError::PeerNotFound(key.to_hex()))
            })
            .collect()
    }

    /// Create a session, announce it and record this node's join.
    pub async fn start_session(
        &self,
        message: Vec<u8>,
        participants: Vec<(PeerId, CompressedPublicKey)>,
        policy: &QuorumPolicy,
    ) -> Result<SigningSession> {
        let session = self
            .coordinator
            .create_session(message, participants, policy)
            .await?;
        let announcement = self.coordinator.announcement(&session.id)?;
        self.publish_session(&[announcement]).await;
        let outbound = self.coordinator.join_local(&session.id)?;
        self.publish_session(&outbound).await;
        self.coordinator
            .get(&session.id)
            .ok_or_else(|| MeshSigError::SessionNotFound(session.id.clone()))
    }

    /// [`start_session`](Self::start_session) with the configured policy.
    pub async fn start_session_default(
        &self,
        message: Vec<u8>,
        participants: Vec<(PeerId, CompressedPublicKey)>,
    ) -> Result<SigningSession> {
        let policy = self.config.quorum.clone();
        self.start_session(message, participants, &policy).await
    }

    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let notice = self.coordinator.cancel_session(session_id)?;
        self.publish_session(&[notice]).await;
        Ok(())
    }

    pub async fn abort_session(&self, session_id: &str, reason: &str) -> Result<()> {
        let notice = self.coordinator.abort_session(session_id, reason)?;
        self.publish_session(&[notice]).await;
        Ok(())
    }

    pub async fn run(&self) -> Result<()> {
        if self.config.handle_termination_signals {
            self.run_until(termination_signal()).await
        } else {
            self.run_until(std::future::pending::<()>()).await
        }
    }

    /// Like [`run`](Self::run) but also stops when `stop` resolves. The
    /// discovery cache is flushed before returning on every exit path.
    pub async fn run_until<F>(&self, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        let mut shutdown_rx = self
            .shutdown_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| MeshSigError::Session("run() has already been started".into()))?;
        let mut presence = self.transport.subscribe(PRESENCE_TOPIC).await?;
        let mut sessions = self.transport.subscribe(SESSION_TOPIC).await?;
        let mut connectivity_events = self.connectivity.subscribe();

        self.announce().await?;

        let mut announce_interval = tokio::time::interval(self.config.reannounce_interval);
        announce_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        announce_interval.tick().await;

        let mut sweep_interval = tokio::time::interval(self.config.sweep_interval);
        sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep_interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                () = &mut stop => {
                    info!("Termination signal received");
                    break;
                }
                _ = announce_interval.tick() => {
                    if let Err(e) = self.announce().await {
                        warn!(error = %e, "Failed to re-announce");
                    }
                    if let Err(e) = self.share_peers().await {
                        warn!(error = %e, "Failed to share peers");
                    }
                }
                _ = sweep_interval.tick() => {
                    self.sweep(now_ms()).await;
                }
                message = presence.recv() => {
                    let Some(message) = message else {
                        info!("Presence subscription closed");
                        break;
                    };
                    if let Err(e) = self.handle_presence(&message) {
                        debug!(from = %message.from, error = %e, "Rejected presence message");
                    }
                }
                message = sessions.recv() => {
                    let Some(message) = message else {
                        info!("Session subscription closed");
                        break;
                    };
                    self.handle_session_message(message).await;
                }
                event = connectivity_events.recv() => {
                    match event {
                        Ok(event) => self.handle_connectivity_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Connectivity events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            error!("Connectivity event channel closed");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.cache.flush() {
            error!(error = %e, "Failed to flush discovery cache on shutdown");
        }
        Ok(())
    }

    fn handle_presence(&self, message: &InboundMessage) -> Result<()> {
        let now = now_ms();
        match PresenceMessage::parse(&message.data, now)? {
            PresenceMessage::Advertisement(ad) => {
                if ad.peer_id == self.local_peer_id() {
                    return Ok(());
                }
                let known = self.identities.read().get(&ad.public_key).is_some();
                self.cache.put(ad.clone(), EntrySource::Overlay)?;
                self.identities.write().observe_advertisement(&ad, now)?;
                if !known {
                    info!(peer_id = %ad.peer_id, public_key = %ad.public_key, "Discovered signer");
                    let _ = self.event_tx.send(MeshNodeEvent::PeerDiscovered {
                        peer_id: ad.peer_id,
                        public_key: ad.public_key,
                    });
                }
            }
            PresenceMessage::PeerExchange(exchange) => {
                let learned = self.connectivity.record_peer_exchange(&exchange, now);
                debug!(from = %message.from, learned, "Peer exchange received");
            }
        }
        Ok(())
    }

    async fn handle_session_message(&self, inbound: InboundMessage) {
        let message = match SessionMessage::from_bytes(&inbound.data) {
            Ok(m) => m,
            Err(e) => {
                debug!(from = %inbound.from, error = %e, "Malformed session message");
                return;
            }
        };
        let session_id = message.session_id().to_string();
        match self.coordinator.handle_message(&inbound.from, message) {
            Ok(outbound) => self.publish_session(&outbound).await,
            Err(MeshSigError::SessionNotFound(_)) => {
                debug!(session_id = %session_id, "Message for a session we are not in");
            }
            Err(e) => {
                warn!(session_id = %session_id, from = %inbound.from, error = %e, "Session message rejected");
            }
        }
        if let Some(notice) = self.coordinator.take_abort_notice(&session_id) {
            self.publish_session(&[notice]).await;
        }
    }

    async fn handle_connectivity_event(&self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::StatusChanged { peer_id, status } => match status.status {
                ConnectionState::Connected => {
                    self.identities.write().mark_online(&peer_id, now_ms());
                }
                ConnectionState::Disconnected => {
                    self.identities.write().mark_offline(&peer_id);
                    let _ = self.event_tx.send(MeshNodeEvent::PeerOffline {
                        peer_id: peer_id.clone(),
                    });
                    for session_id in self.coordinator.handle_participant_dropout(&peer_id) {
                        if let Some(notice) = self.coordinator.take_abort_notice(&session_id) {
                            self.publish_session(&[notice]).await;
                        }
                    }
                }
                ConnectionState::Connecting | ConnectionState::Failed => {}
            },
            ConnectivityEvent::RelayHintLearned { peer_id, relay_addr } => {
                debug!(peer_id = %peer_id, relay_addr = %relay_addr, "Relay hint learned");
            }
        }
    }

    /// Periodic maintenance: session expiry, cache and relay-hint pruning,
    /// identity staleness, and detection of connections the transport lost.
    pub async fn sweep(&self, now: u64) {
        let expired = self.coordinator.expire_due(now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired sessions");
        }
        match self.cache.prune_expired(now) {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "Pruned expired advertisements"),
            Err(e) => warn!(error = %e, "Failed to prune discovery cache"),
        }
        self.connectivity.prune_relay_hints(now);
        self.identities.write().mark_stale(now);

        let live: HashSet<PeerId> = self
            .transport
            .list_connections()
            .await
            .into_iter()
            .map(|c| c.peer_id)
            .collect();
        for (peer_id, status) in self.connectivity.statuses() {
            if status.status == ConnectionState::Connected && !live.contains(&peer_id) {
                info!(peer_id = %peer_id, "Connection lost");
                self.connectivity.mark_disconnected(&peer_id);
            }
        }
    }

    async fn publish_session(&self, messages: &[SessionMessage]) {
        for message in messages {
            let bytes = match message.to_bytes() {
                Ok(b) => b,
                Err(e) => {
                    error!(error = %e, "Failed to encode session message");
                    continue;
                }
            };
            if let Err(e) = self.transport.publish(SESSION_TOPIC, bytes).await {
                warn!(
                    session_id = %message.session_id(),
                    kind = message.message_type(),
                    error = %e,
                    "Failed to publish session message"
                );
            }
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix. Never resolves if no handler
/// could be installed.
async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!(error = %e, "Ctrl-C handler failed");
                            terminate.recv().await;
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
