// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MeshSigError, Result};

pub const MAX_MULTIADDR_LENGTH: usize = 512;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A transport address in multiaddr text form, e.g.
/// `/dns4/relay.example/tcp/443/wss/p2p/<relay>/p2p-circuit/p2p/<peer>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiaddr(String);

impl Multiaddr {
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() > MAX_MULTIADDR_LENGTH {
            return Err(MeshSigError::Protocol("Multiaddr too long".into()));
        }
        if !s.starts_with('/') || s.len() < 2 {
            return Err(MeshSigError::Protocol(format!(
                "Invalid multiaddr '{s}': must start with '/'"
            )));
        }
        if s[1..].split('/').any(|segment| segment.is_empty()) {
            return Err(MeshSigError::Protocol(format!(
                "Invalid multiaddr '{s}': empty segment"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn has_protocol(&self, protocol: &str) -> bool {
        self.0.split('/').any(|segment| segment == protocol)
    }

    pub fn is_circuit_relay(&self) -> bool {
        self.has_protocol("p2p-circuit")
    }

    pub fn is_webrtc(&self) -> bool {
        self.has_protocol("webrtc") || self.has_protocol("webrtc-direct")
    }

    /// The final `/p2p/<id>` component, if any.
    pub fn peer_id(&self) -> Option<PeerId> {
        let segments: Vec<&str> = self.0.split('/').collect();
        segments
            .windows(2)
            .filter(|w| w[0] == "p2p")
            .last()
            .map(|w| PeerId::new(w[1]))
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 33-byte SEC1 compressed secp256k1 public key, hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompressedPublicKey([u8; 33]);

impl CompressedPublicKey {
    pub fn from_bytes(bytes: [u8; 33]) -> Result<Self> {
        if bytes[0] != 0x02 && bytes[0] != 0x03 {
            return Err(MeshSigError::Crypto(
                "Compressed public key must start with 0x02 or 0x03".into(),
            ));
        }
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| MeshSigError::Crypto(format!("Invalid public key hex: {e}")))?;
        let arr: [u8; 33] = bytes
            .try_into()
            .map_err(|_| MeshSigError::Crypto("Public key must be 33 bytes".into()))?;
        Self::from_bytes(arr)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    pub fn x_only(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0[1..33]);
        out
    }
}

impl fmt::Debug for CompressedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompressedPublicKey({})", self.to_hex())
    }
}

impl fmt::Display for CompressedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for CompressedPublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CompressedPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Direct,
    Webrtc,
    Relay,
    None,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Direct => "direct",
            Self::Webrtc => "webrtc",
            Self::Relay => "relay",
            Self::None => "none",
        };
        f.write_str(s)
    }
}
