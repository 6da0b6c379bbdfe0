// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

mod advertisement;
mod cache;
mod connectivity;
mod crypto;
mod encoding;
mod error;
mod identity;
mod keys;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
mod node;
mod presence;
mod session;
mod transport;
mod types;
mod verifier;

pub use advertisement::{
    Advertisement, AdvertisementBuilder, SignerCapabilities, ADVERTISEMENT_PROTOCOL,
    DEFAULT_ADVERTISEMENT_TTL, MAX_ADDRS, MAX_ID_LENGTH, MAX_TRANSACTION_KINDS,
    MAX_TRANSACTION_KIND_LENGTH,
};
pub use cache::{
    CacheEntry, CacheStore, DiscoveryCache, EntrySource, MemoryCacheStore, RedbCacheStore,
    DEFAULT_FLUSH_DEBOUNCE,
};
pub use connectivity::{
    ConnectOutcome, ConnectionState, ConnectionStatus, ConnectivityConfig, ConnectivityEvent,
    ConnectivityManager, RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RELAY_HINT_TTL, DEFAULT_STEP_TIMEOUT,
};
pub use crypto::{
    AggregatedNonce, FinalSignature, KeyAggContext, MusigBackend, PartialSignature, PublicNonce,
    SecretNonce, PARTIAL_SIGNATURE_LENGTH, PUBLIC_NONCE_LENGTH,
};
pub use error::{ConnectivityIssue, MeshSigError, Result};
pub use identity::{Identity, IdentityRegistry, DEFAULT_STALE_AFTER};
pub use keys::{derive_address, verify_digest, SignerKeys};
pub use node::{
    MeshNode, MeshNodeEvent, NodeConfig, DEFAULT_REANNOUNCE_INTERVAL, DEFAULT_SWEEP_INTERVAL,
};
pub use presence::{
    PeerExchange, PeerExchangeEntry, PresenceMessage, MAX_PEER_EXCHANGE_ENTRIES,
    MAX_PRESENCE_MESSAGE_SIZE, PRESENCE_TOPIC, SESSION_TOPIC,
};
pub use session::{
    AbortPayload, AnnouncePayload, AnnouncedParticipant, CancelPayload, JoinPayload,
    NoncePayload, Participant, PartialSignaturePayload, SessionConfig, SessionCoordinator,
    SessionEvent, SessionMessage, SessionPhase, SigningSession, DEFAULT_MAX_HISTORY,
    DEFAULT_SESSION_TTL, EARLY_TRAFFIC_TTL, MAX_MESSAGE_SIZE, MAX_PARTICIPANTS, MAX_SESSION_MESSAGE_SIZE,
};
pub use transport::{Connection, InboundMessage, Transport};
pub use types::{
    now_ms, CompressedPublicKey, ConnectionType, Multiaddr, PeerId, MAX_MULTIADDR_LENGTH,
};
pub use verifier::{
    ConnectivityReport, ParticipantVerifier, QuorumPolicy, DEFAULT_MIN_CONNECTED_PARTICIPANTS,
};
