// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{AggregatedNonce, FinalSignature, PartialSignature, PublicNonce};
use crate::encoding::hex_vec;
use crate::error::{MeshSigError, Result};
use crate::types::{CompressedPublicKey, PeerId};

pub const MAX_PARTICIPANTS: usize = 64;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Declaration order is protocol order; the terminal phases sort last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Created,
    KeyAggregation,
    KeysAggregated,
    NonceExchange,
    NoncesExchanged,
    Signing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The single forward step out of this phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::KeyAggregation),
            Self::KeyAggregation => Some(Self::KeysAggregated),
            Self::KeysAggregated => Some(Self::NonceExchange),
            Self::NonceExchange => Some(Self::NoncesExchanged),
            Self::NoncesExchanged => Some(Self::Signing),
            Self::Signing => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::Cancelled => None,
        }
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(to, Self::Failed | Self::Cancelled) || self.next() == Some(to)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::KeyAggregation => "KEY_AGGREGATION",
            Self::KeysAggregated => "KEYS_AGGREGATED",
            Self::NonceExchange => "NONCE_EXCHANGE",
            Self::NoncesExchanged => "NONCES_EXCHANGED",
            Self::Signing => "SIGNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub peer_id: PeerId,
    pub public_key: CompressedPublicKey,
    pub has_joined: bool,
    pub has_nonce: bool,
    pub has_partial_sig: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_nonce: Option<PublicNonce>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_signature: Option<PartialSignature>,
}

impl Participant {
    pub fn new(peer_id: PeerId, public_key: CompressedPublicKey) -> Self {
        Self {
            peer_id,
            public_key,
            has_joined: false,
            has_nonce: false,
            has_partial_sig: false,
            public_nonce: None,
            partial_signature: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningSession {
    pub id: String,
    pub phase: SessionPhase,
    pub initiator_peer_id: PeerId,
    /// Sorted by public key; a participant's position is its signer index.
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub excluded: Vec<PeerId>,
    pub aggregated_public_key: Option<CompressedPublicKey>,
    pub aggregated_nonce: Option<AggregatedNonce>,
    pub final_signature: Option<FinalSignature>,
    #[serde(with = "hex_vec")]
    pub message: Vec<u8>,
    pub created_at: u64,
    pub expires_at: u64,
    pub error: Option<String>,
}

impl SigningSession {
    pub fn new(
        id: String,
        initiator_peer_id: PeerId,
        participants: Vec<(PeerId, CompressedPublicKey)>,
        message: Vec<u8>,
        created_at: u64,
        expires_at: u64,
    ) -> Result<Self> {
        if participants.len() < 2 {
            return Err(MeshSigError::Session(
                "A signing session needs at least two participants".into(),
            ));
        }
        if participants.len() > MAX_PARTICIPANTS {
            return Err(MeshSigError::Session(format!(
                "Too many participants: {} (max {MAX_PARTICIPANTS})",
                participants.len()
            )));
        }
        if message.is_empty() || message.len() > MAX_MESSAGE_SIZE {
            return Err(MeshSigError::Session("Invalid message size".into()));
        }
        if expires_at <= created_at {
            return Err(MeshSigError::Session(
                "Session must expire after it is created".into(),
            ));
        }

        let mut participants: Vec<Participant> = participants
            .into_iter()
            .map(|(peer_id, public_key)| Participant::new(peer_id, public_key))
            .collect();
        participants.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        for pair in participants.windows(2) {
            if pair[0].public_key == pair[1].public_key {
                return Err(MeshSigError::Session(format!(
                    "Duplicate participant key {}",
                    pair[0].public_key
                )));
            }
        }
        for (i, p) in participants.iter().enumerate() {
            if participants[i + 1..].iter().any(|q| q.peer_id == p.peer_id) {
                return Err(MeshSigError::Session(format!(
                    "Duplicate participant peer {}",
                    p.peer_id
                )));
            }
        }
        if !participants.iter().any(|p| p.peer_id == initiator_peer_id) {
            return Err(MeshSigError::Session(
                "Initiator must be a participant".into(),
            ));
        }

        Ok(Self {
            id,
            phase: SessionPhase::Created,
            initiator_peer_id,
            participants,
            excluded: Vec::new(),
            aggregated_public_key: None,
            aggregated_nonce: None,
            final_signature: None,
            message,
            created_at,
            expires_at,
            error: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }

    pub fn participant(&self, peer_id: &PeerId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.peer_id == peer_id)
    }

    pub fn signer_index(&self, peer_id: &PeerId) -> Option<usize> {
        self.participants.iter().position(|p| &p.peer_id == peer_id)
    }

    pub fn participant_ids(&self) -> Vec<PeerId> {
        self.participants.iter().map(|p| p.peer_id.clone()).collect()
    }

    pub fn sorted_public_keys(&self) -> Vec<CompressedPublicKey> {
        self.participants.iter().map(|p| p.public_key).collect()
    }

    pub fn all_joined(&self) -> bool {
        self.participants.iter().all(|p| p.has_joined)
    }

    pub fn all_nonces(&self) -> bool {
        self.participants.iter().all(|p| p.has_nonce)
    }

    pub fn all_partial_signatures(&self) -> bool {
        self.participants.iter().all(|p| p.has_partial_sig)
    }

    /// Percent complete: joins weigh 33, nonces 33, partial signatures 34.
    pub fn progress(&self) -> u8 {
        if self.phase == SessionPhase::Completed {
            return 100;
        }
        let n = self.participants.len().max(1) as u64;
        let joined = self.participants.iter().filter(|p| p.has_joined).count() as u64;
        let nonces = self.participants.iter().filter(|p| p.has_nonce).count() as u64;
        let partials = self.participants.iter().filter(|p| p.has_partial_sig).count() as u64;
        ((joined * 33 + nonces * 33 + partials * 34) / n).min(100) as u8
    }

    pub fn transition(&mut self, to: SessionPhase) -> Result<()> {
        if !self.phase.can_transition_to(to) {
            return Err(MeshSigError::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Remove unreachable participants before key aggregation.
    pub fn exclude(&mut self, peers: &[PeerId]) -> Result<()> {
        if self.phase != SessionPhase::Created {
            return Err(MeshSigError::Session(format!(
                "Participants can only be excluded before key aggregation (phase {})",
                self.phase
            )));
        }
        if peers.contains(&self.initiator_peer_id) {
            return Err(MeshSigError::Session("Cannot exclude the initiator".into()));
        }
        let remaining = self
            .participants
            .iter()
            .filter(|p| !peers.contains(&p.peer_id))
            .count();
        if remaining < 2 {
            return Err(MeshSigError::Session(
                "Fewer than two participants would remain".into(),
            ));
        }
        let (keep, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut self.participants)
            .into_iter()
            .partition(|p| !peers.contains(&p.peer_id));
        self.participants = keep;
        self.excluded
            .extend(dropped.into_iter().map(|p| p.peer_id));
        Ok(())
    }

    fn participant_mut(&mut self, peer_id: &PeerId) -> Result<&mut Participant> {
        let session_id = self.id.clone();
        self.participants
            .iter_mut()
            .find(|p| &p.peer_id == peer_id)
            .ok_or_else(|| {
                MeshSigError::Unauthorized(format!(
                    "{peer_id} is not a participant of session {session_id}"
                ))
            })
    }

    fn expect_phase(&self, phase: SessionPhase, what: &str) -> Result<()> {
        if self.phase != phase {
            return Err(MeshSigError::Session(format!(
                "Cannot accept {what} in phase {}",
                self.phase
            )));
        }
        Ok(())
    }

    /// Returns `true` when the join is new.
    pub fn record_join(&mut self, peer_id: &PeerId, public_key: &CompressedPublicKey) -> Result<bool> {
        self.expect_phase(SessionPhase::KeyAggregation, "joins")?;
        let participant = self.participant_mut(peer_id)?;
        if &participant.public_key != public_key {
            return Err(MeshSigError::Unauthorized(format!(
                "{peer_id} joined with a different public key"
            )));
        }
        if participant.has_joined {
            return Ok(false);
        }
        participant.has_joined = true;
        Ok(true)
    }

    /// Returns `true` when the nonce is new; a repeat of the same nonce is
    /// ignored, a different one is an error.
    pub fn record_nonce(&mut self, peer_id: &PeerId, nonce: PublicNonce) -> Result<bool> {
        self.expect_phase(SessionPhase::NonceExchange, "nonces")?;
        let participant = self.participant_mut(peer_id)?;
        match &participant.public_nonce {
            Some(existing) if *existing == nonce => Ok(false),
            Some(_) => Err(MeshSigError::Protocol(format!(
                "{peer_id} sent a conflicting nonce"
            ))),
            None => {
                participant.public_nonce = Some(nonce);
                participant.has_nonce = true;
                Ok(true)
            }
        }
    }

    pub fn record_partial_signature(
        &mut self,
        peer_id: &PeerId,
        partial: PartialSignature,
    ) -> Result<bool> {
        self.expect_phase(SessionPhase::Signing, "partial signatures")?;
        let participant = self.participant_mut(peer_id)?;
        match &participant.partial_signature {
            Some(existing) if *existing == partial => Ok(false),
            Some(_) => Err(MeshSigError::Protocol(format!(
                "{peer_id} sent a conflicting partial signature"
            ))),
            None => {
                participant.partial_signature = Some(partial);
                participant.has_partial_sig = true;
                Ok(true)
            }
        }
    }

    pub fn public_nonces(&self) -> Option<Vec<PublicNonce>> {
        self.participants
            .iter()
            .map(|p| p.public_nonce.clone())
            .collect()
    }

    pub fn partial_signatures(&self) -> Option<Vec<PartialSignature>> {
        self.participants
            .iter()
            .map(|p| p.partial_signature.clone())
            .collect()
    }

    /// Move to `Failed`, recording the phase in which it happened. No-op on
    /// terminal sessions.
    pub fn fail(&mut self, cause: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.error = Some(format!("{}: {cause}", self.phase));
        self.phase = SessionPhase::Failed;
        true
    }

    pub fn cancel(&mut self, by: &PeerId) -> Result<()> {
        if by != &self.initiator_peer_id {
            return Err(MeshSigError::Unauthorized(format!(
                "Only the initiator may cancel session {}",
                self.id
            )));
        }
        self.transition(SessionPhase::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SignerKeys;

    fn session_of(n: usize) -> (SigningSession, Vec<(PeerId, CompressedPublicKey)>) {
        let members: Vec<(PeerId, CompressedPublicKey)> = (0..n)
            .map(|i| {
                (
                    PeerId::new(format!("peer-{i}")),
                    SignerKeys::generate().public_key(),
                )
            })
            .collect();
        let session = SigningSession::new(
            "s1".into(),
            members[0].0.clone(),
            members.clone(),
            b"spend".to_vec(),
            1_000,
            61_000,
        )
        .unwrap();
        (session, members)
    }

    #[test]
    fn test_participants_sorted_by_key() {
        let (session, _) = session_of(4);
        let keys = session.sorted_public_keys();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let (mut session, _) = session_of(2);
        assert!(session.transition(SessionPhase::NonceExchange).is_err());
        session.transition(SessionPhase::KeyAggregation).unwrap();
        session.transition(SessionPhase::KeysAggregated).unwrap();
        assert!(matches!(
            session.transition(SessionPhase::KeyAggregation),
            Err(MeshSigError::InvalidTransition { .. })
        ));
        session.transition(SessionPhase::Failed).unwrap();
        assert!(session.transition(SessionPhase::Cancelled).is_err());
        assert!(!session.fail("again"));
    }

    #[test]
    fn test_progress_weights() {
        let (mut session, members) = session_of(2);
        session.transition(SessionPhase::KeyAggregation).unwrap();
        assert_eq!(session.progress(), 0);
        for (peer, key) in &members {
            session.record_join(peer, key).unwrap();
        }
        assert_eq!(session.progress(), 33);
        session.transition(SessionPhase::KeysAggregated).unwrap();
        session.transition(SessionPhase::NonceExchange).unwrap();
        session
            .record_nonce(&members[0].0, PublicNonce::from_bytes(vec![1; 66]).unwrap())
            .unwrap();
        assert_eq!(session.progress(), 49);
    }

    #[test]
    fn test_conflicting_nonce_rejected_duplicate_ignored() {
        let (mut session, members) = session_of(2);
        session.phase = SessionPhase::NonceExchange;
        let nonce = PublicNonce::from_bytes(vec![1; 66]).unwrap();
        assert!(session.record_nonce(&members[0].0, nonce.clone()).unwrap());
        assert!(!session.record_nonce(&members[0].0, nonce).unwrap());
        let other = PublicNonce::from_bytes(vec![2; 66]).unwrap();
        assert!(matches!(
            session.record_nonce(&members[0].0, other),
            Err(MeshSigError::Protocol(_))
        ));
        assert!(matches!(
            session.record_nonce(
                &PeerId::new("stranger"),
                PublicNonce::from_bytes(vec![3; 66]).unwrap()
            ),
            Err(MeshSigError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_exclusion_before_aggregation_only() {
        let (mut session, members) = session_of(3);
        let unreachable = members[2].0.clone();
        session.exclude(std::slice::from_ref(&unreachable)).unwrap();
        assert_eq!(session.participants.len(), 2);
        assert_eq!(session.excluded, vec![unreachable]);

        session.transition(SessionPhase::KeyAggregation).unwrap();
        assert!(session.exclude(&[members[1].0.clone()]).is_err());
    }

    #[test]
    fn test_only_initiator_cancels() {
        let (mut session, members) = session_of(2);
        assert!(matches!(
            session.cancel(&members[1].0),
            Err(MeshSigError::Unauthorized(_))
        ));
        session.cancel(&members[0].0).unwrap();
        assert_eq!(session.phase, SessionPhase::Cancelled);
    }

    #[test]
    fn test_fail_records_phase() {
        let (mut session, _) = session_of(2);
        session.transition(SessionPhase::KeyAggregation).unwrap();
        assert!(session.fail("participant dropped"));
        assert_eq!(session.phase, SessionPhase::Failed);
        assert_eq!(
            session.error.as_deref(),
            Some("KEY_AGGREGATION: participant dropped")
        );
    }
}
