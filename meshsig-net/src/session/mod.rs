// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Signing-session coordination.
//!
//! The coordinator owns every session this node takes part in and drives the
//! MuSig2 rounds through the [`MusigBackend`]. It never talks to the network
//! itself: each operation returns the [`SessionMessage`]s to broadcast.
//!
//! Nonces or partial signatures that arrive before this node has reached the
//! matching round are held back and applied once it gets there. Traffic for
//! a session whose announcement has not arrived yet is parked for a short
//! while and replayed when the announcement shows up.

#![forbid(unsafe_code)]

mod message;
mod state;

pub use message::{
    AbortPayload, AnnouncePayload, AnnouncedParticipant, CancelPayload, JoinPayload,
    NoncePayload, PartialSignaturePayload, SessionMessage, MAX_SESSION_MESSAGE_SIZE,
};
pub use state::{Participant, SessionPhase, SigningSession, MAX_MESSAGE_SIZE, MAX_PARTICIPANTS};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::crypto::{FinalSignature, KeyAggContext, MusigBackend, PartialSignature, PublicNonce, SecretNonce};
use crate::error::{MeshSigError, Result};
use crate::keys::SignerKeys;
use crate::types::{now_ms, CompressedPublicKey, PeerId};
use crate::verifier::{ParticipantVerifier, QuorumPolicy};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_HISTORY: usize = 1000;
const MAX_SESSION_ID_LENGTH: usize = 128;
const MAX_BUFFERED_PER_SESSION: usize = 2 * MAX_PARTICIPANTS;
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// How long traffic for an unannounced session is kept.
pub const EARLY_TRAFFIC_TTL: Duration = Duration::from_secs(60);
const MAX_EARLY_SESSIONS: usize = 64;
const MAX_EARLY_PER_SESSION: usize = 3 * MAX_PARTICIPANTS;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub session_ttl: Duration,
    pub max_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

impl SessionConfig {
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    Created {
        session_id: String,
        participants: usize,
        excluded: Vec<PeerId>,
    },
    PhaseChanged {
        session_id: String,
        from: SessionPhase,
        to: SessionPhase,
    },
    ParticipantJoined {
        session_id: String,
        peer_id: PeerId,
    },
    NonceReceived {
        session_id: String,
        peer_id: PeerId,
    },
    PartialSignatureReceived {
        session_id: String,
        peer_id: PeerId,
    },
    Completed {
        session_id: String,
        signature: FinalSignature,
    },
    Failed {
        session_id: String,
        error: String,
    },
    Cancelled {
        session_id: String,
    },
}

enum Buffered {
    Nonce(PeerId, PublicNonce),
    Partial(PeerId, PartialSignature),
}

struct SessionRecord {
    session: SigningSession,
    key_agg: Option<KeyAggContext>,
    secret_nonce: Option<SecretNonce>,
    buffered: Vec<Buffered>,
    /// Set when this node failed the session and peers have not been told.
    abort_pending: Option<String>,
}

impl SessionRecord {
    fn new(session: SigningSession) -> Self {
        Self {
            session,
            key_agg: None,
            secret_nonce: None,
            buffered: Vec::new(),
            abort_pending: None,
        }
    }
}

/// Bounded memory of finished session IDs.
struct SessionHistory {
    seen: HashSet<String>,
    order: VecDeque<String>,
    max_entries: usize,
}

impl SessionHistory {
    fn new(max_entries: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    fn record(&mut self, session_id: &str) {
        if self.seen.insert(session_id.to_string()) {
            self.order.push_back(session_id.to_string());
        }
        while self.seen.len() > self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn contains(&self, session_id: &str) -> bool {
        self.seen.contains(session_id)
    }
}

struct ParkedTraffic {
    first_seen: u64,
    messages: Vec<(PeerId, SessionMessage)>,
}

/// Messages that referenced a session before its announcement arrived.
#[derive(Default)]
struct EarlyTraffic {
    sessions: HashMap<String, ParkedTraffic>,
}

impl EarlyTraffic {
    fn park(&mut self, from: PeerId, message: SessionMessage, now_ms: u64) -> Result<()> {
        self.prune(now_ms);
        let session_id = message.session_id().to_string();
        if !self.sessions.contains_key(&session_id) && self.sessions.len() >= MAX_EARLY_SESSIONS {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|(_, parked)| parked.first_seen)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                self.sessions.remove(&oldest);
            }
        }
        let parked = self.sessions.entry(session_id).or_insert_with(|| ParkedTraffic {
            first_seen: now_ms,
            messages: Vec::new(),
        });
        if parked.messages.len() >= MAX_EARLY_PER_SESSION {
            return Err(MeshSigError::Protocol(
                "Too many messages for an unannounced session".into(),
            ));
        }
        parked.messages.push((from, message));
        Ok(())
    }

    fn take(&mut self, session_id: &str) -> Vec<(PeerId, SessionMessage)> {
        self.sessions
            .remove(session_id)
            .map(|parked| parked.messages)
            .unwrap_or_default()
    }

    fn prune(&mut self, now_ms: u64) {
        let ttl = EARLY_TRAFFIC_TTL.as_millis() as u64;
        self.sessions
            .retain(|_, parked| now_ms < parked.first_seen.saturating_add(ttl));
    }

    fn len(&self) -> usize {
        self.sessions.values().map(|p| p.messages.len()).sum()
    }
}

pub struct SessionCoordinator {
    local_peer_id: PeerId,
    keys: SignerKeys,
    backend: Arc<dyn MusigBackend>,
    verifier: Arc<ParticipantVerifier>,
    config: SessionConfig,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    history: Mutex<SessionHistory>,
    early: Mutex<EarlyTraffic>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionCoordinator {
    pub fn new(
        local_peer_id: PeerId,
        keys: SignerKeys,
        backend: Arc<dyn MusigBackend>,
        verifier: Arc<ParticipantVerifier>,
        config: SessionConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local_peer_id,
            keys,
            backend,
            verifier,
            history: Mutex::new(SessionHistory::new(config.max_history)),
            config,
            sessions: RwLock::new(HashMap::new()),
            early: Mutex::new(EarlyTraffic::default()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn get(&self, session_id: &str) -> Option<SigningSession> {
        self.sessions
            .read()
            .get(session_id)
            .map(|r| r.session.clone())
    }

    pub fn sessions(&self) -> Vec<SigningSession> {
        self.sessions
            .read()
            .values()
            .map(|r| r.session.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|r| !r.session.is_terminal())
            .count()
    }

    pub fn is_replay(&self, session_id: &str) -> bool {
        self.history.lock().contains(session_id)
    }

    /// Messages currently parked for sessions not yet announced.
    pub fn parked_count(&self) -> usize {
        self.early.lock().len()
    }

    /// Create a session led by this node. Connectivity to the other
    /// participants is verified first; under a strict policy any unreachable
    /// participant aborts creation and nothing is stored.
    pub async fn create_session(
        &self,
        message: Vec<u8>,
        participants: Vec<(PeerId, CompressedPublicKey)>,
        policy: &QuorumPolicy,
    ) -> Result<SigningSession> {
        let now = now_ms();
        let session_id = hex::encode(rand::random::<[u8; 32]>());
        let mut session = SigningSession::new(
            session_id.clone(),
            self.local_peer_id.clone(),
            participants,
            message,
            now,
            now.saturating_add(self.config.session_ttl.as_millis() as u64),
        )?;
        let local_key = self.keys.public_key();
        if session
            .participant(&self.local_peer_id)
            .is_some_and(|p| p.public_key != local_key)
        {
            return Err(MeshSigError::Session(
                "Local participant key does not match this node's key".into(),
            ));
        }

        let report = self
            .verifier
            .ensure_connected(&session.participant_ids(), true)
            .await;

        if !policy.is_satisfied(&report, true) {
            warn!(
                session_id = %session_id,
                unreachable = report.failed.len(),
                "Session creation blocked by connectivity"
            );
            return Err(MeshSigError::SessionCreationFailed {
                connectivity_issues: report.failed,
            });
        }

        if !report.failed.is_empty() {
            let unreachable: Vec<PeerId> = report.failed_peers().cloned().collect();
            if let Err(e) = session.exclude(&unreachable) {
                warn!(session_id = %session_id, error = %e, "Cannot proceed without unreachable participants");
                return Err(MeshSigError::SessionCreationFailed {
                    connectivity_issues: report.failed,
                });
            }
            info!(
                session_id = %session_id,
                excluded = unreachable.len(),
                "Proceeding without unreachable participants"
            );
        }

        session.transition(SessionPhase::KeyAggregation)?;
        let snapshot = session.clone();
        self.sessions
            .write()
            .insert(session_id.clone(), SessionRecord::new(session));

        self.emit(vec![
            SessionEvent::Created {
                session_id: session_id.clone(),
                participants: snapshot.participants.len(),
                excluded: snapshot.excluded.clone(),
            },
            SessionEvent::PhaseChanged {
                session_id: session_id.clone(),
                from: SessionPhase::Created,
                to: SessionPhase::KeyAggregation,
            },
        ]);
        info!(session_id = %session_id, participants = snapshot.participants.len(), "Session created");
        Ok(snapshot)
    }

    pub fn announcement(&self, session_id: &str) -> Result<SessionMessage> {
        let sessions = self.sessions.read();
        let record = sessions
            .get(session_id)
            .ok_or_else(|| MeshSigError::SessionNotFound(session_id.to_string()))?;
        Ok(SessionMessage::Announce(AnnouncePayload::from_session(
            &record.session,
        )))
    }

    /// Record this node's own join and return what to broadcast.
    pub fn join_local(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        let public_key = self.keys.public_key();
        let local = self.local_peer_id.clone();
        let mut outbound = vec![SessionMessage::Join(JoinPayload {
            session_id: session_id.to_string(),
            peer_id: local.clone(),
            public_key,
        })];
        outbound.extend(self.apply_join(session_id, &local, &public_key)?);
        Ok(outbound)
    }

    /// Entry point for a message received from `from` on the session topic.
    pub fn handle_message(&self, from: &PeerId, message: SessionMessage) -> Result<Vec<SessionMessage>> {
        if from == &self.local_peer_id {
            return Ok(Vec::new());
        }
        if message.sender() != from {
            return Err(MeshSigError::Unauthorized(format!(
                "{from} sent a {} on behalf of {}",
                message.message_type(),
                message.sender()
            )));
        }
        debug!(
            session_id = %message.session_id(),
            from = %from,
            kind = message.message_type(),
            "Session message"
        );

        let Some(message) = self.park_if_unannounced(from, message)? else {
            return Ok(Vec::new());
        };

        match message {
            SessionMessage::Announce(payload) => self.accept_announcement(payload),
            SessionMessage::Join(p) => self.apply_join(&p.session_id, &p.peer_id, &p.public_key),
            SessionMessage::Nonce(p) => self.apply_nonce(&p.session_id, p.peer_id, p.nonce),
            SessionMessage::PartialSignature(p) => {
                self.apply_partial(&p.session_id, p.peer_id, p.partial_signature)
            }
            SessionMessage::Abort(p) => {
                self.handle_abort(&p.session_id, &p.peer_id, &p.reason)?;
                Ok(Vec::new())
            }
            SessionMessage::Cancel(p) => {
                self.handle_cancel(&p.session_id, &p.peer_id)?;
                Ok(Vec::new())
            }
        }
    }

    /// Park anything but an announcement that names a session we have not
    /// seen. The check and the park happen under the sessions read lock so
    /// an announcement landing concurrently cannot miss the parked message.
    fn park_if_unannounced(&self, from: &PeerId, message: SessionMessage) -> Result<Option<SessionMessage>> {
        if matches!(message, SessionMessage::Announce(_)) {
            return Ok(Some(message));
        }
        let sessions = self.sessions.read();
        let session_id = message.session_id();
        if sessions.contains_key(session_id) {
            return Ok(Some(message));
        }
        if self.is_replay(session_id) {
            return Err(MeshSigError::SessionNotFound(session_id.to_string()));
        }
        if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LENGTH {
            return Err(MeshSigError::Protocol("Invalid session id".into()));
        }
        debug!(
            session_id = %session_id,
            from = %from,
            kind = message.message_type(),
            "Parking message for unannounced session"
        );
        self.early.lock().park(from.clone(), message, now_ms())?;
        Ok(None)
    }

    fn replay_parked(&self, session_id: &str) -> Vec<SessionMessage> {
        let parked = self.early.lock().take(session_id);
        let mut outbound = Vec::new();
        for (from, message) in parked {
            match self.handle_message(&from, message) {
                Ok(out) => outbound.extend(out),
                Err(e) => {
                    debug!(session_id = %session_id, from = %from, error = %e, "Parked message refused");
                }
            }
        }
        outbound
    }

    fn accept_announcement(&self, payload: AnnouncePayload) -> Result<Vec<SessionMessage>> {
        let session_id = payload.session_id.clone();
        if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LENGTH {
            return Err(MeshSigError::Protocol("Invalid session id".into()));
        }
        if self.is_replay(&session_id) {
            return Err(MeshSigError::ReplayDetected(session_id));
        }
        let local_key = self.keys.public_key();
        let ours = payload
            .participants
            .iter()
            .any(|p| p.peer_id == self.local_peer_id && p.public_key == local_key);
        if !ours {
            debug!(session_id = %session_id, "Ignoring session we are not part of");
            self.early.lock().take(&session_id);
            return Ok(Vec::new());
        }
        if payload.expires_at <= now_ms() {
            return Err(MeshSigError::SessionTimeout(session_id));
        }

        let mut session = SigningSession::new(
            session_id.clone(),
            payload.initiator,
            payload
                .participants
                .into_iter()
                .map(|p| (p.peer_id, p.public_key))
                .collect(),
            payload.message,
            payload.created_at,
            payload.expires_at,
        )?;
        session.excluded = payload.excluded;
        session.transition(SessionPhase::KeyAggregation)?;

        {
            let mut sessions = self.sessions.write();
            if let Some(existing) = sessions.get(&session_id) {
                let same = existing.session.message == session.message
                    && existing.session.sorted_public_keys() == session.sorted_public_keys()
                    && existing.session.initiator_peer_id == session.initiator_peer_id;
                if same {
                    return Ok(Vec::new());
                }
                return Err(MeshSigError::Session(format!(
                    "Conflicting announcement for session {session_id}"
                )));
            }
            sessions.insert(session_id.clone(), SessionRecord::new(session.clone()));
        }
        self.emit(vec![
            SessionEvent::Created {
                session_id: session_id.clone(),
                participants: session.participants.len(),
                excluded: session.excluded.clone(),
            },
            SessionEvent::PhaseChanged {
                session_id: session_id.clone(),
                from: SessionPhase::Created,
                to: SessionPhase::KeyAggregation,
            },
        ]);
        info!(session_id = %session_id, initiator = %session.initiator_peer_id, "Joined announced session");
        let mut outbound = self.join_local(&session_id)?;
        outbound.extend(self.replay_parked(&session_id));
        Ok(outbound)
    }

    fn apply_join(
        &self,
        session_id: &str,
        peer_id: &PeerId,
        public_key: &CompressedPublicKey,
    ) -> Result<Vec<SessionMessage>> {
        self.mutate(session_id, peer_id, |record, events| {
            let session = &mut record.session;
            if session.phase > SessionPhase::KeyAggregation {
                return match session.participant(peer_id) {
                    Some(p) if p.has_joined && &p.public_key == public_key => Ok(()),
                    _ => Err(MeshSigError::Protocol(format!(
                        "Unexpected join from {peer_id} in phase {}",
                        session.phase
                    ))),
                };
            }
            if session.record_join(peer_id, public_key)? {
                events.push(SessionEvent::ParticipantJoined {
                    session_id: session.id.clone(),
                    peer_id: peer_id.clone(),
                });
            }
            Ok(())
        })
    }

    fn apply_nonce(&self, session_id: &str, peer_id: PeerId, nonce: PublicNonce) -> Result<Vec<SessionMessage>> {
        let sender = peer_id.clone();
        self.mutate(session_id, &sender, |record, events| {
            let phase = record.session.phase;
            if phase < SessionPhase::NonceExchange {
                return buffer(record, Buffered::Nonce(peer_id, nonce));
            }
            if phase > SessionPhase::NonceExchange {
                return match record.session.participant(&peer_id) {
                    Some(p) if p.public_nonce.as_ref() == Some(&nonce) => Ok(()),
                    _ => Err(MeshSigError::Protocol(format!(
                        "Unexpected nonce from {peer_id} in phase {phase}"
                    ))),
                };
            }
            record_nonce(&mut record.session, peer_id, nonce, events)
        })
    }

    fn apply_partial(
        &self,
        session_id: &str,
        peer_id: PeerId,
        partial: PartialSignature,
    ) -> Result<Vec<SessionMessage>> {
        let sender = peer_id.clone();
        self.mutate(session_id, &sender, |record, events| {
            if record.session.phase < SessionPhase::Signing {
                return buffer(record, Buffered::Partial(peer_id, partial));
            }
            record_partial(&mut record.session, peer_id, partial, events)
        })
    }

    /// A participant gave up on the session.
    pub fn handle_abort(&self, session_id: &str, peer_id: &PeerId, reason: &str) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut sessions = self.sessions.write();
            let record = sessions
                .get_mut(session_id)
                .ok_or_else(|| MeshSigError::SessionNotFound(session_id.to_string()))?;
            if record.session.participant(peer_id).is_none() {
                return Err(MeshSigError::Unauthorized(format!(
                    "{peer_id} is not a participant of session {session_id}"
                )));
            }
            let cause = format!(
                "{} ({reason})",
                MeshSigError::ParticipantDropout {
                    session_id: session_id.to_string(),
                    peer_id: peer_id.to_string(),
                }
            );
            self.fail_record(record, &cause, false, &mut events);
        }
        self.emit(events);
        Ok(())
    }

    /// The initiator cancelled. Anyone else is refused and the session is
    /// left untouched.
    pub fn handle_cancel(&self, session_id: &str, peer_id: &PeerId) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut sessions = self.sessions.write();
            let record = sessions
                .get_mut(session_id)
                .ok_or_else(|| MeshSigError::SessionNotFound(session_id.to_string()))?;
            let from = record.session.phase;
            record.session.cancel(peer_id)?;
            record.secret_nonce = None;
            record.buffered.clear();
            self.history.lock().record(session_id);
            events.push(SessionEvent::PhaseChanged {
                session_id: session_id.to_string(),
                from,
                to: SessionPhase::Cancelled,
            });
            events.push(SessionEvent::Cancelled {
                session_id: session_id.to_string(),
            });
        }
        info!(session_id = %session_id, by = %peer_id, "Session cancelled");
        self.emit(events);
        Ok(())
    }

    /// Cancel a session this node initiated; returns the notice to broadcast.
    pub fn cancel_session(&self, session_id: &str) -> Result<SessionMessage> {
        let local = self.local_peer_id.clone();
        self.handle_cancel(session_id, &local)?;
        Ok(SessionMessage::Cancel(CancelPayload {
            session_id: session_id.to_string(),
            peer_id: local,
        }))
    }

    /// Fail a session locally and produce the abort notice for peers.
    pub fn abort_session(&self, session_id: &str, reason: &str) -> Result<SessionMessage> {
        let mut events = Vec::new();
        {
            let mut sessions = self.sessions.write();
            let record = sessions
                .get_mut(session_id)
                .ok_or_else(|| MeshSigError::SessionNotFound(session_id.to_string()))?;
            if record.session.is_terminal() {
                return Err(MeshSigError::Session(format!(
                    "Session {session_id} already finished"
                )));
            }
            self.fail_record(record, reason, false, &mut events);
        }
        self.emit(events);
        Ok(self.abort_message(session_id, reason))
    }

    /// Abort notice for a session this node failed on its own, at most once.
    pub fn take_abort_notice(&self, session_id: &str) -> Option<SessionMessage> {
        let reason = self
            .sessions
            .write()
            .get_mut(session_id)?
            .abort_pending
            .take()?;
        Some(self.abort_message(session_id, &reason))
    }

    fn abort_message(&self, session_id: &str, reason: &str) -> SessionMessage {
        let mut reason = reason.to_string();
        if reason.len() > message::MAX_REASON_LENGTH {
            let mut cut = message::MAX_REASON_LENGTH;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        SessionMessage::Abort(AbortPayload {
            session_id: session_id.to_string(),
            peer_id: self.local_peer_id.clone(),
            reason,
        })
    }

    /// Fail every active session that includes a peer we lost.
    pub fn handle_participant_dropout(&self, peer_id: &PeerId) -> Vec<String> {
        let mut events = Vec::new();
        let mut failed = Vec::new();
        {
            let mut sessions = self.sessions.write();
            for (session_id, record) in sessions.iter_mut() {
                if record.session.is_terminal() || record.session.participant(peer_id).is_none() {
                    continue;
                }
                let cause = MeshSigError::ParticipantDropout {
                    session_id: session_id.clone(),
                    peer_id: peer_id.to_string(),
                }
                .to_string();
                self.fail_record(record, &cause, true, &mut events);
                failed.push(session_id.clone());
            }
        }
        self.emit(events);
        failed
    }

    /// Fail sessions whose deadline passed and forget long-finished ones.
    /// Returns the IDs that timed out on this sweep.
    pub fn expire_due(&self, now_ms: u64) -> Vec<String> {
        let retention = self.config.session_ttl.as_millis() as u64;
        let mut events = Vec::new();
        let mut expired = Vec::new();
        {
            let mut sessions = self.sessions.write();
            for (session_id, record) in sessions.iter_mut() {
                if record.session.is_terminal() || !record.session.is_expired_at(now_ms) {
                    continue;
                }
                let cause = MeshSigError::SessionTimeout(session_id.clone()).to_string();
                self.fail_record(record, &cause, false, &mut events);
                expired.push(session_id.clone());
            }
            sessions.retain(|_, r| {
                !(r.session.is_terminal()
                    && now_ms >= r.session.expires_at.saturating_add(retention))
            });
        }
        self.early.lock().prune(now_ms);
        if !expired.is_empty() {
            warn!(count = expired.len(), "Sessions expired");
        }
        self.emit(events);
        expired
    }

    /// Apply `f` to a live session, then advance it as far as the collected
    /// state allows. Messages from non-participants are refused without
    /// touching the session; any other error fails it.
    fn mutate<F>(&self, session_id: &str, sender: &PeerId, f: F) -> Result<Vec<SessionMessage>>
    where
        F: FnOnce(&mut SessionRecord, &mut Vec<SessionEvent>) -> Result<()>,
    {
        let mut events = Vec::new();
        let result = {
            let mut sessions = self.sessions.write();
            let record = sessions
                .get_mut(session_id)
                .ok_or_else(|| MeshSigError::SessionNotFound(session_id.to_string()))?;
            if record.session.participant(sender).is_none() {
                return Err(MeshSigError::Unauthorized(format!(
                    "{sender} is not a participant of session {session_id}"
                )));
            }
            if record.session.is_terminal() {
                debug!(session_id = %session_id, phase = %record.session.phase, "Ignoring message for finished session");
                return Ok(Vec::new());
            }

            let result = f(record, &mut events).and_then(|()| self.advance(record, &mut events));
            if let Err(e) = &result {
                warn!(session_id = %session_id, phase = %record.session.phase, error = %e, "Session failed");
                self.fail_record(record, &e.to_string(), true, &mut events);
            }
            result
        };
        self.emit(events);
        result
    }

    fn advance(&self, record: &mut SessionRecord, events: &mut Vec<SessionEvent>) -> Result<Vec<SessionMessage>> {
        let SessionRecord {
            session,
            key_agg,
            secret_nonce,
            buffered,
            ..
        } = record;
        let mut outbound = Vec::new();

        loop {
            match session.phase {
                SessionPhase::KeyAggregation if session.all_joined() => {
                    let ctx = self.backend.aggregate_keys(&session.sorted_public_keys())?;
                    session.aggregated_public_key = Some(ctx.aggregated_key);
                    step(session, SessionPhase::KeysAggregated, events)?;
                    step(session, SessionPhase::NonceExchange, events)?;

                    let (secret, public) = self.backend.generate_nonce(
                        &self.keys.secret_bytes(),
                        &ctx.aggregated_key,
                        &session.message,
                    )?;
                    *key_agg = Some(ctx);
                    *secret_nonce = Some(secret);
                    record_nonce(session, self.local_peer_id.clone(), public.clone(), events)?;
                    outbound.push(SessionMessage::Nonce(NoncePayload {
                        session_id: session.id.clone(),
                        peer_id: self.local_peer_id.clone(),
                        nonce: public,
                    }));

                    for item in drain_buffered(buffered, |b| matches!(b, Buffered::Nonce(..))) {
                        if let Buffered::Nonce(peer_id, nonce) = item {
                            record_nonce(session, peer_id, nonce, events)?;
                        }
                    }
                }
                SessionPhase::NonceExchange if session.all_nonces() => {
                    let nonces = session.public_nonces().ok_or_else(|| {
                        MeshSigError::Session("Nonce set incomplete".into())
                    })?;
                    let aggregated_nonce = self.backend.aggregate_nonces(&nonces)?;
                    session.aggregated_nonce = Some(aggregated_nonce.clone());
                    step(session, SessionPhase::NoncesExchanged, events)?;
                    step(session, SessionPhase::Signing, events)?;

                    let ctx = key_agg.as_ref().ok_or_else(|| {
                        MeshSigError::Session("Missing key aggregation context".into())
                    })?;
                    let index = session.signer_index(&self.local_peer_id).ok_or_else(|| {
                        MeshSigError::Session("This node is not a participant".into())
                    })?;
                    let secret = secret_nonce.take().ok_or_else(|| {
                        MeshSigError::Session("Local nonce missing or already used".into())
                    })?;
                    let partial = self.backend.partial_sign(
                        secret,
                        &self.keys.secret_bytes(),
                        ctx,
                        index,
                        &aggregated_nonce,
                        &session.message,
                    )?;
                    record_partial(session, self.local_peer_id.clone(), partial.clone(), events)?;
                    outbound.push(SessionMessage::PartialSignature(PartialSignaturePayload {
                        session_id: session.id.clone(),
                        peer_id: self.local_peer_id.clone(),
                        partial_signature: partial,
                    }));

                    for item in drain_buffered(buffered, |b| matches!(b, Buffered::Partial(..))) {
                        if let Buffered::Partial(peer_id, partial) = item {
                            record_partial(session, peer_id, partial, events)?;
                        }
                    }
                }
                SessionPhase::Signing if session.all_partial_signatures() => {
                    let partials = session.partial_signatures().ok_or_else(|| {
                        MeshSigError::Session("Partial signature set incomplete".into())
                    })?;
                    let ctx = key_agg.as_ref().ok_or_else(|| {
                        MeshSigError::Session("Missing key aggregation context".into())
                    })?;
                    let aggregated_nonce = session.aggregated_nonce.clone().ok_or_else(|| {
                        MeshSigError::Session("Missing aggregated nonce".into())
                    })?;
                    let signature = self.backend.aggregate_signatures(
                        &partials,
                        &aggregated_nonce,
                        &session.message,
                        ctx,
                    )?;
                    self.backend
                        .verify(&signature, &ctx.aggregated_key, &session.message)?;
                    session.final_signature = Some(signature);
                    step(session, SessionPhase::Completed, events)?;
                    events.push(SessionEvent::Completed {
                        session_id: session.id.clone(),
                        signature,
                    });
                    self.history.lock().record(&session.id);
                    info!(session_id = %session.id, "Session completed");
                    break;
                }
                _ => break,
            }
        }
        Ok(outbound)
    }

    fn fail_record(
        &self,
        record: &mut SessionRecord,
        cause: &str,
        notify_peers: bool,
        events: &mut Vec<SessionEvent>,
    ) {
        let from = record.session.phase;
        if !record.session.fail(cause) {
            return;
        }
        record.secret_nonce = None;
        record.buffered.clear();
        if notify_peers {
            record.abort_pending = Some(cause.to_string());
        }
        self.history.lock().record(&record.session.id);
        events.push(SessionEvent::PhaseChanged {
            session_id: record.session.id.clone(),
            from,
            to: SessionPhase::Failed,
        });
        events.push(SessionEvent::Failed {
            session_id: record.session.id.clone(),
            error: record.session.error.clone().unwrap_or_default(),
        });
    }

    fn emit(&self, events: Vec<SessionEvent>) {
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }
}

fn step(session: &mut SigningSession, to: SessionPhase, events: &mut Vec<SessionEvent>) -> Result<()> {
    let from = session.phase;
    session.transition(to)?;
    events.push(SessionEvent::PhaseChanged {
        session_id: session.id.clone(),
        from,
        to,
    });
    Ok(())
}

fn record_nonce(
    session: &mut SigningSession,
    peer_id: PeerId,
    nonce: PublicNonce,
    events: &mut Vec<SessionEvent>,
) -> Result<()> {
    if session.record_nonce(&peer_id, nonce)? {
        events.push(SessionEvent::NonceReceived {
            session_id: session.id.clone(),
            peer_id,
        });
    }
    Ok(())
}

fn record_partial(
    session: &mut SigningSession,
    peer_id: PeerId,
    partial: PartialSignature,
    events: &mut Vec<SessionEvent>,
) -> Result<()> {
    if session.record_partial_signature(&peer_id, partial)? {
        events.push(SessionEvent::PartialSignatureReceived {
            session_id: session.id.clone(),
            peer_id,
        });
    }
    Ok(())
}

fn buffer(record: &mut SessionRecord, item: Buffered) -> Result<()> {
    if record.buffered.len() >= MAX_BUFFERED_PER_SESSION {
        return Err(MeshSigError::Protocol("Too many early messages".into()));
    }
    record.buffered.push(item);
    Ok(())
}

fn drain_buffered(buffered: &mut Vec<Buffered>, pick: impl Fn(&Buffered) -> bool) -> Vec<Buffered> {
    let (picked, rest): (Vec<_>, Vec<_>) = std::mem::take(buffered).into_iter().partition(|b| pick(b));
    *buffered = rest;
    picked
}
