// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use thiserror::Error;

use crate::types::PeerId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectivityIssue {
    pub peer_id: PeerId,
    pub error: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshSigError {
    #[error("No dialable path advertised for peer {0}")]
    NoRelayAddress(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("WebRTC negotiation failed: {0}")]
    WebRtcNegotiationFailed(String),

    #[error("Advertisement signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Advertisement expired: {0}")]
    Expired(String),

    #[error("Session {0} timed out")]
    SessionTimeout(String),

    #[error("Participant {peer_id} dropped out of session {session_id}")]
    ParticipantDropout { session_id: String, peer_id: String },

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Replay detected: {0}")]
    ReplayDetected(String),

    #[error("Session creation blocked: {} participant(s) unreachable", connectivity_issues.len())]
    SessionCreationFailed {
        connectivity_issues: Vec<ConnectivityIssue>,
    },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl MeshSigError {
    /// Whether a connection attempt failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshSigError::Timeout(_)
                | MeshSigError::Network(_)
                | MeshSigError::WebRtcNegotiationFailed(_)
                | MeshSigError::Transport(_)
        )
    }
}

impl From<serde_json::Error> for MeshSigError {
    fn from(e: serde_json::Error) -> Self {
        MeshSigError::Json(e.to_string())
    }
}

impl From<redb::DatabaseError> for MeshSigError {
    fn from(e: redb::DatabaseError) -> Self {
        MeshSigError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for MeshSigError {
    fn from(e: redb::TransactionError) -> Self {
        MeshSigError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for MeshSigError {
    fn from(e: redb::TableError) -> Self {
        MeshSigError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for MeshSigError {
    fn from(e: redb::StorageError) -> Self {
        MeshSigError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for MeshSigError {
    fn from(e: redb::CommitError) -> Self {
        MeshSigError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshSigError>;
