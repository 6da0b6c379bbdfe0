// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::crypto::{PartialSignature, PublicNonce};
use crate::encoding::hex_vec;
use crate::error::{MeshSigError, Result};
use crate::types::{CompressedPublicKey, PeerId};

use super::state::{SigningSession, MAX_MESSAGE_SIZE, MAX_PARTICIPANTS};

pub const MAX_SESSION_MESSAGE_SIZE: usize = 2 * MAX_MESSAGE_SIZE + 16 * 1024;
pub const MAX_REASON_LENGTH: usize = 256;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMessage {
    Announce(AnnouncePayload),
    Join(JoinPayload),
    Nonce(NoncePayload),
    PartialSignature(PartialSignaturePayload),
    Abort(AbortPayload),
    Cancel(CancelPayload),
}

impl SessionMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            SessionMessage::Announce(_) => "announce",
            SessionMessage::Join(_) => "join",
            SessionMessage::Nonce(_) => "nonce",
            SessionMessage::PartialSignature(_) => "partial_signature",
            SessionMessage::Abort(_) => "abort",
            SessionMessage::Cancel(_) => "cancel",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionMessage::Announce(p) => &p.session_id,
            SessionMessage::Join(p) => &p.session_id,
            SessionMessage::Nonce(p) => &p.session_id,
            SessionMessage::PartialSignature(p) => &p.session_id,
            SessionMessage::Abort(p) => &p.session_id,
            SessionMessage::Cancel(p) => &p.session_id,
        }
    }

    /// The peer the message claims to come from.
    pub fn sender(&self) -> &PeerId {
        match self {
            SessionMessage::Announce(p) => &p.initiator,
            SessionMessage::Join(p) => &p.peer_id,
            SessionMessage::Nonce(p) => &p.peer_id,
            SessionMessage::PartialSignature(p) => &p.peer_id,
            SessionMessage::Abort(p) => &p.peer_id,
            SessionMessage::Cancel(p) => &p.peer_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_SESSION_MESSAGE_SIZE {
            return Err(MeshSigError::Protocol(format!(
                "Session message too large: {} bytes",
                bytes.len()
            )));
        }
        let message: SessionMessage = serde_json::from_slice(bytes)?;
        if let SessionMessage::Announce(p) = &message {
            if p.participants.len() > MAX_PARTICIPANTS || p.message.len() > MAX_MESSAGE_SIZE {
                return Err(MeshSigError::Protocol("Session announcement too large".into()));
            }
        }
        if let SessionMessage::Abort(p) = &message {
            if p.reason.len() > MAX_REASON_LENGTH {
                return Err(MeshSigError::Protocol("Abort reason too long".into()));
            }
        }
        Ok(message)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncedParticipant {
    pub peer_id: PeerId,
    pub public_key: CompressedPublicKey,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    pub session_id: String,
    pub initiator: PeerId,
    pub participants: Vec<AnnouncedParticipant>,
    #[serde(default)]
    pub excluded: Vec<PeerId>,
    #[serde(with = "hex_vec")]
    pub message: Vec<u8>,
    pub created_at: u64,
    pub expires_at: u64,
}

impl AnnouncePayload {
    pub fn from_session(session: &SigningSession) -> Self {
        Self {
            session_id: session.id.clone(),
            initiator: session.initiator_peer_id.clone(),
            participants: session
                .participants
                .iter()
                .map(|p| AnnouncedParticipant {
                    peer_id: p.peer_id.clone(),
                    public_key: p.public_key,
                })
                .collect(),
            excluded: session.excluded.clone(),
            message: session.message.clone(),
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub session_id: String,
    pub peer_id: PeerId,
    pub public_key: CompressedPublicKey,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NoncePayload {
    pub session_id: String,
    pub peer_id: PeerId,
    pub nonce: PublicNonce,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartialSignaturePayload {
    pub session_id: String,
    pub peer_id: PeerId,
    pub partial_signature: PartialSignature,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AbortPayload {
    pub session_id: String,
    pub peer_id: PeerId,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    pub session_id: String,
    pub peer_id: PeerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_message_layout() {
        let msg = SessionMessage::Nonce(NoncePayload {
            session_id: "ab".repeat(32),
            peer_id: PeerId::new("peer-a"),
            nonce: PublicNonce::from_bytes(vec![7; 66]).unwrap(),
        });
        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "nonce");
        assert_eq!(value["peerId"], "peer-a");
        assert_eq!(value["nonce"].as_str().unwrap().len(), 132);

        let back = SessionMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.sender(), &PeerId::new("peer-a"));
    }

    #[test]
    fn test_malformed_nonce_rejected() {
        let json = r#"{"type":"nonce","sessionId":"s","peerId":"p","nonce":"abcd"}"#;
        assert!(SessionMessage::from_bytes(json.as_bytes()).is_err());
    }

    #[test]
    fn test_partial_signature_tag() {
        let msg = SessionMessage::PartialSignature(PartialSignaturePayload {
            session_id: "s".into(),
            peer_id: PeerId::new("p"),
            partial_signature: PartialSignature::from_bytes(vec![1; 32]).unwrap(),
        });
        assert_eq!(msg.message_type(), "partial_signature");
        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "partial_signature");
    }
}
