// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::advertisement::Advertisement;
use crate::error::{MeshSigError, Result};
use crate::types::{Multiaddr, PeerId};

pub const PRESENCE_TOPIC: &str = "meshsig/presence/1";
pub const SESSION_TOPIC: &str = "meshsig/sessions/1";

pub const MAX_PRESENCE_MESSAGE_SIZE: usize = 64 * 1024;
pub const MAX_PEER_EXCHANGE_ENTRIES: usize = 64;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PresenceMessage {
    Advertisement(Advertisement),
    PeerExchange(PeerExchange),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PeerExchange {
    pub peers: Vec<PeerExchangeEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerExchangeEntry {
    pub peer_id: PeerId,
    #[serde(default)]
    pub multiaddrs: Vec<Multiaddr>,
    #[serde(default)]
    pub relay_addr: Option<Multiaddr>,
    pub last_seen: u64,
}

impl PresenceMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            PresenceMessage::Advertisement(_) => "advertisement",
            PresenceMessage::PeerExchange(_) => "peer-exchange",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate an inbound message. Advertisements must carry the
    /// expected protocol, be unexpired at `now_ms` and verify.
    pub fn parse(bytes: &[u8], now_ms: u64) -> Result<Self> {
        if bytes.len() > MAX_PRESENCE_MESSAGE_SIZE {
            return Err(MeshSigError::Protocol(format!(
                "Presence message too large: {} bytes",
                bytes.len()
            )));
        }
        let message: PresenceMessage = serde_json::from_slice(bytes)?;
        match &message {
            PresenceMessage::Advertisement(ad) => ad.verify(now_ms)?,
            PresenceMessage::PeerExchange(exchange) => {
                if exchange.peers.len() > MAX_PEER_EXCHANGE_ENTRIES {
                    return Err(MeshSigError::Protocol(
                        "Too many peer-exchange entries".into(),
                    ));
                }
                for entry in &exchange.peers {
                    for addr in entry.multiaddrs.iter().chain(entry.relay_addr.iter()) {
                        Multiaddr::parse(addr.as_str())?;
                    }
                }
            }
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::tests::signed_advertisement;
    use crate::keys::SignerKeys;
    use crate::types::now_ms;

    #[test]
    fn test_advertisement_tag() {
        let keys = SignerKeys::generate();
        let msg = PresenceMessage::Advertisement(signed_advertisement(&keys, "peer-a"));
        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "advertisement");
        assert_eq!(value["protocol"], crate::advertisement::ADVERTISEMENT_PROTOCOL);

        let parsed = PresenceMessage::parse(&msg.to_bytes().unwrap(), now_ms()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_parse_rejects_foreign_protocol() {
        let keys = SignerKeys::generate();
        let msg = PresenceMessage::Advertisement(signed_advertisement(&keys, "peer-a"));
        let mut value: serde_json::Value =
            serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        value["protocol"] = "other/1".into();
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            PresenceMessage::parse(&bytes, now_ms()),
            Err(MeshSigError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_rejects_expired_and_forged() {
        let keys = SignerKeys::generate();
        let ad = signed_advertisement(&keys, "peer-a");
        let bytes = PresenceMessage::Advertisement(ad.clone()).to_bytes().unwrap();
        assert!(matches!(
            PresenceMessage::parse(&bytes, ad.expires_at),
            Err(MeshSigError::Expired(_))
        ));

        let mut forged = ad;
        forged.signature[0] ^= 0xff;
        let bytes = PresenceMessage::Advertisement(forged).to_bytes().unwrap();
        assert!(matches!(
            PresenceMessage::parse(&bytes, now_ms()),
            Err(MeshSigError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_peer_exchange_wire_format() {
        let json = r#"{"type":"peer-exchange","peers":[{"peerId":"peer-b","multiaddrs":["/ip4/192.0.2.7/tcp/4001"],"relayAddr":"/dns4/relay.example/tcp/443/wss/p2p/relay/p2p-circuit/p2p/peer-b","lastSeen":1700000000000}]}"#;
        let msg = PresenceMessage::parse(json.as_bytes(), now_ms()).unwrap();
        match msg {
            PresenceMessage::PeerExchange(exchange) => {
                assert_eq!(exchange.peers.len(), 1);
                assert_eq!(exchange.peers[0].peer_id, PeerId::new("peer-b"));
                assert!(exchange.peers[0].relay_addr.as_ref().unwrap().is_circuit_relay());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_oversized_message_rejected() {
        let bytes = vec![b' '; MAX_PRESENCE_MESSAGE_SIZE + 1];
        assert!(matches!(
            PresenceMessage::parse(&bytes, now_ms()),
            Err(MeshSigError::Protocol(_))
        ));
    }
}
