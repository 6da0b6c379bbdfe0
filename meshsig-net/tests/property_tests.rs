// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::Duration;

use meshsig_net::{
    now_ms, AbortPayload, AdvertisementBuilder, Multiaddr, PeerId, PresenceMessage, RetryPolicy,
    SessionMessage, SessionPhase, SignerCapabilities, SignerKeys, MAX_PRESENCE_MESSAGE_SIZE,
    MAX_SESSION_MESSAGE_SIZE,
};
use proptest::prelude::*;

const ALL_PHASES: [SessionPhase; 9] = [
    SessionPhase::Created,
    SessionPhase::KeyAggregation,
    SessionPhase::KeysAggregated,
    SessionPhase::NonceExchange,
    SessionPhase::NoncesExchanged,
    SessionPhase::Signing,
    SessionPhase::Completed,
    SessionPhase::Failed,
    SessionPhase::Cancelled,
];

fn segment() -> impl Strategy<Value = String> {
    "[a-z0-9.-]{1,12}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn session_message_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = SessionMessage::from_bytes(&data);
    }

    #[test]
    fn presence_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = PresenceMessage::parse(&data, now_ms());
    }

    #[test]
    fn oversized_messages_rejected_before_decoding(extra in 1usize..1024) {
        let session = vec![b' '; MAX_SESSION_MESSAGE_SIZE + extra];
        prop_assert!(SessionMessage::from_bytes(&session).is_err());
        let presence = vec![b' '; MAX_PRESENCE_MESSAGE_SIZE + extra];
        prop_assert!(PresenceMessage::parse(&presence, now_ms()).is_err());
    }

    #[test]
    fn abort_reason_length_enforced(len in 0usize..600) {
        let message = SessionMessage::Abort(AbortPayload {
            session_id: "s".into(),
            peer_id: PeerId::new("peer-a"),
            reason: "x".repeat(len),
        });
        let parsed = SessionMessage::from_bytes(&message.to_bytes().unwrap());
        prop_assert_eq!(parsed.is_ok(), len <= 256);
    }

    #[test]
    fn signature_bit_flip_detected(index in 0usize..64, bit in 0u8..8) {
        let ad = AdvertisementBuilder::new(PeerId::new("peer-a"))
            .capabilities(SignerCapabilities::new(vec!["transfer".into()], 7))
            .sign(&SignerKeys::generate())
            .unwrap();
        prop_assert!(ad.verify_signature().is_ok());

        let mut tampered = ad.clone();
        tampered.signature[index] ^= 1 << bit;
        prop_assert!(tampered.verify_signature().is_err());
    }

    #[test]
    fn signed_fields_are_bound(fee in any::<u64>(), ttl_secs in 1u64..3600) {
        let ad = AdvertisementBuilder::new(PeerId::new("peer-a"))
            .capabilities(SignerCapabilities::new(vec!["transfer".into()], 7))
            .ttl(Duration::from_secs(ttl_secs))
            .sign(&SignerKeys::generate())
            .unwrap();

        let mut repriced = ad.clone();
        repriced.capabilities.fee = fee;
        prop_assert_eq!(repriced.verify_signature().is_ok(), fee == 7);

        let mut extended = ad.clone();
        extended.expires_at += 1;
        prop_assert!(extended.verify_signature().is_err());

        let mut renamed = ad;
        renamed.peer_id = PeerId::new("peer-b");
        prop_assert!(renamed.verify_signature().is_err());
    }

    #[test]
    fn multiaddr_accepts_well_formed_paths(
        segments in prop::collection::vec(segment(), 1..8),
        peer in segment(),
    ) {
        let text = format!("/{}/p2p/{peer}", segments.join("/"));
        let addr = Multiaddr::parse(&text).unwrap();
        prop_assert_eq!(addr.as_str(), text.as_str());
        prop_assert_eq!(addr.peer_id(), Some(PeerId::new(peer)));
    }

    #[test]
    fn multiaddr_rejects_empty_segments(
        head in prop::collection::vec(segment(), 0..4),
        tail in prop::collection::vec(segment(), 0..4),
    ) {
        let text = format!("/{}//{}", head.join("/"), tail.join("/"));
        prop_assert!(Multiaddr::parse(&text).is_err());
        let unrooted = format!("{}/x", head.join("/"));
        prop_assume!(!unrooted.starts_with('/'));
        prop_assert!(Multiaddr::parse(&unrooted).is_err());
    }

    #[test]
    fn phase_transitions_only_move_forward(from in 0usize..9, to in 0usize..9) {
        let (from, to) = (ALL_PHASES[from], ALL_PHASES[to]);
        if from.can_transition_to(to) {
            prop_assert!(!from.is_terminal());
            prop_assert!(
                to == SessionPhase::Failed || to == SessionPhase::Cancelled || to > from
            );
        }
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    #[test]
    fn retry_delay_never_shrinks(base_ms in 1u64..10_000, attempt in 1u32..40) {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(base_ms));
        prop_assert!(policy.delay_for(attempt + 1) >= policy.delay_for(attempt));
        prop_assert_eq!(policy.delay_for(1), Duration::from_millis(base_ms));
    }
}
