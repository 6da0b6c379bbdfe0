// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use meshsig_net::mock::{MockMusig, MockNetwork};
use meshsig_net::{
    AdvertisementBuilder, CompressedPublicKey, ConnectionState, ConnectivityConfig,
    ConnectivityManager, DiscoveryCache, EntrySource, MeshSigError, Multiaddr, MusigBackend,
    PartialSignature, PartialSignaturePayload, ParticipantVerifier, PeerId, QuorumPolicy,
    RetryPolicy, SessionConfig, SessionCoordinator, SessionEvent, SessionMessage, SessionPhase,
    SignerKeys,
};

struct Member {
    peer_id: PeerId,
    public_key: CompressedPublicKey,
    coordinator: SessionCoordinator,
    connectivity: Arc<ConnectivityManager>,
}

/// Participants sharing one mock network. Every member knows every other
/// member's advertisement; only those listed as reachable accept dials.
fn mesh(n: usize, unreachable: &[usize]) -> Vec<Member> {
    let network = MockNetwork::new();
    let keys: Vec<SignerKeys> = (0..n).map(|_| SignerKeys::generate()).collect();
    let ads: Vec<_> = (0..n)
        .map(|i| {
            let peer_id = PeerId::new(format!("peer-{i}"));
            let addr = Multiaddr::parse(&format!(
                "/ip4/10.0.0.{i}/udp/9090/webrtc-direct/p2p/{peer_id}"
            ))
            .unwrap();
            network.transport(peer_id.clone());
            if !unreachable.contains(&i) {
                network.listen(&peer_id, &addr);
            }
            AdvertisementBuilder::new(peer_id)
                .webrtc_addr(Some(addr))
                .sign(&keys[i])
                .unwrap()
        })
        .collect();

    keys.into_iter()
        .enumerate()
        .map(|(i, keys)| {
            let peer_id = PeerId::new(format!("peer-{i}"));
            let cache = DiscoveryCache::in_memory();
            for (j, ad) in ads.iter().enumerate() {
                if j != i {
                    cache.put(ad.clone(), EntrySource::Overlay).unwrap();
                }
            }
            let connectivity = Arc::new(ConnectivityManager::new(
                network.transport(peer_id.clone()),
                ConnectivityConfig::default(),
            ));
            let verifier = Arc::new(
                ParticipantVerifier::new(connectivity.clone(), cache)
                    .with_retry_policy(RetryPolicy::default()),
            );
            Member {
                public_key: keys.public_key(),
                coordinator: SessionCoordinator::new(
                    peer_id.clone(),
                    keys,
                    Arc::new(MockMusig::new()),
                    verifier,
                    SessionConfig::default(),
                ),
                peer_id,
                connectivity,
            }
        })
        .collect()
}

fn roster(members: &[Member]) -> Vec<(PeerId, CompressedPublicKey)> {
    members
        .iter()
        .map(|m| (m.peer_id.clone(), m.public_key))
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Now,
    Later,
    Never,
}

/// Broadcast every message to every other member until the network is
/// quiet. `route` may defer a delivery until everything else has drained,
/// or drop it. Returns errors other than unknown-session ones.
fn pump(
    members: &[Member],
    initial: Vec<(PeerId, SessionMessage)>,
    route: impl Fn(&PeerId, &PeerId, &SessionMessage) -> Delivery,
) -> Vec<MeshSigError> {
    let mut queue: VecDeque<(PeerId, PeerId, SessionMessage)> = VecDeque::new();
    let mut held = Vec::new();
    let mut errors = Vec::new();

    let fan_out = |queue: &mut VecDeque<_>, from: &PeerId, msg: SessionMessage| {
        for member in members.iter().filter(|m| &m.peer_id != from) {
            queue.push_back((member.peer_id.clone(), from.clone(), msg.clone()));
        }
    };
    for (from, msg) in initial {
        fan_out(&mut queue, &from, msg);
    }

    let mut draining_held = false;
    loop {
        let Some((to, from, msg)) = queue.pop_front() else {
            if held.is_empty() {
                break;
            }
            draining_held = true;
            queue.extend(held.drain(..));
            continue;
        };
        match route(&to, &from, &msg) {
            Delivery::Never => continue,
            Delivery::Later if !draining_held => {
                held.push((to, from, msg));
                continue;
            }
            _ => {}
        }
        let member = members.iter().find(|m| m.peer_id == to).unwrap();
        match member.coordinator.handle_message(&from, msg) {
            Ok(outbound) => {
                for out in outbound {
                    fan_out(&mut queue, &to, out);
                }
            }
            Err(MeshSigError::SessionNotFound(_)) => {}
            Err(e) => errors.push(e),
        }
    }
    errors
}

async fn start(members: &[Member], policy: &QuorumPolicy) -> (String, Vec<(PeerId, SessionMessage)>) {
    let initiator = &members[0];
    let session = initiator
        .coordinator
        .create_session(b"transfer 5 to carol".to_vec(), roster(members), policy)
        .await
        .unwrap();
    let mut initial = vec![(
        initiator.peer_id.clone(),
        initiator.coordinator.announcement(&session.id).unwrap(),
    )];
    for msg in initiator.coordinator.join_local(&session.id).unwrap() {
        initial.push((initiator.peer_id.clone(), msg));
    }
    (session.id, initial)
}

#[tokio::test(start_paused = true)]
async fn test_three_participants_complete() {
    let members = mesh(3, &[]);
    let (id, initial) = start(&members, &QuorumPolicy::strict()).await;
    let errors = pump(&members, initial, |_, _, _| Delivery::Now);
    assert!(errors.is_empty(), "{errors:?}");

    let signatures: Vec<_> = members
        .iter()
        .map(|m| {
            let session = m.coordinator.get(&id).unwrap();
            assert_eq!(session.phase, SessionPhase::Completed);
            assert_eq!(session.progress(), 100);
            session.final_signature.unwrap()
        })
        .collect();
    assert!(signatures.windows(2).all(|w| w[0] == w[1]));

    let session = members[0].coordinator.get(&id).unwrap();
    MockMusig::new()
        .verify(
            &signatures[0],
            &session.aggregated_public_key.unwrap(),
            &session.message,
        )
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_strict_mode_blocks_creation() {
    let members = mesh(3, &[2]);
    let err = members[0]
        .coordinator
        .create_session(b"m".to_vec(), roster(&members), &QuorumPolicy::strict())
        .await
        .unwrap_err();

    let MeshSigError::SessionCreationFailed { connectivity_issues } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(connectivity_issues.len(), 1);
    assert_eq!(connectivity_issues[0].peer_id, members[2].peer_id);
    assert!(!connectivity_issues[0].error.is_empty());
    assert!(members[0].coordinator.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lenient_mode_excludes_unreachable() {
    let members = mesh(3, &[2]);
    let (id, initial) = start(&members, &QuorumPolicy::lenient(2)).await;

    let session = members[0].coordinator.get(&id).unwrap();
    assert_eq!(session.participants.len(), 2);
    assert_eq!(session.excluded, vec![members[2].peer_id.clone()]);
    assert_eq!(
        members[0].connectivity.status(&members[2].peer_id).status,
        ConnectionState::Failed
    );
    assert_eq!(
        members[0].connectivity.status(&members[1].peer_id).status,
        ConnectionState::Connected
    );

    let errors = pump(&members, initial, |_, _, _| Delivery::Now);
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(members[0].coordinator.get(&id).unwrap().phase, SessionPhase::Completed);
    assert_eq!(members[1].coordinator.get(&id).unwrap().phase, SessionPhase::Completed);
    assert!(members[2].coordinator.get(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_lenient_mode_still_needs_quorum() {
    let members = mesh(3, &[1, 2]);
    let err = members[0]
        .coordinator
        .create_session(b"m".to_vec(), roster(&members), &QuorumPolicy::lenient(2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MeshSigError::SessionCreationFailed { ref connectivity_issues } if connectivity_issues.len() == 2
    ));
}

#[tokio::test(start_paused = true)]
async fn test_expiry_during_nonce_exchange_fails_session() {
    let members = mesh(3, &[]);
    let (id, initial) = start(&members, &QuorumPolicy::strict()).await;
    let initiator = members[0].peer_id.clone();
    pump(&members, initial, |to, _, msg| {
        if to == &initiator && matches!(msg, SessionMessage::Nonce(_)) {
            Delivery::Never
        } else {
            Delivery::Now
        }
    });

    let coordinator = &members[0].coordinator;
    let session = coordinator.get(&id).unwrap();
    assert_eq!(session.phase, SessionPhase::NonceExchange);
    assert_eq!(session.participants.iter().filter(|p| p.has_nonce).count(), 1);

    let mut events = coordinator.subscribe();
    assert!(coordinator.expire_due(session.expires_at - 1).is_empty());
    assert_eq!(coordinator.expire_due(session.expires_at), vec![id.clone()]);

    let session = coordinator.get(&id).unwrap();
    assert_eq!(session.phase, SessionPhase::Failed);
    let error = session.error.unwrap();
    assert!(error.starts_with("NONCE_EXCHANGE:"), "{error}");
    assert!(error.contains("timed out"), "{error}");

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::Failed { ref session_id, .. } if *session_id == id) {
            failed = true;
        }
    }
    assert!(failed);
}

#[tokio::test(start_paused = true)]
async fn test_phases_advance_in_order() {
    let members = mesh(3, &[]);
    let mut events = members[1].coordinator.subscribe();
    let (id, initial) = start(&members, &QuorumPolicy::strict()).await;
    pump(&members, initial, |_, _, _| Delivery::Now);

    let mut phases = vec![SessionPhase::Created];
    let mut partials_before_completion = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::PhaseChanged { session_id, from, to } if session_id == id => {
                assert_eq!(phases.last(), Some(&from));
                phases.push(to);
            }
            SessionEvent::PartialSignatureReceived { .. } => {
                assert!(!phases.contains(&SessionPhase::Completed));
                partials_before_completion += 1;
            }
            _ => {}
        }
    }
    assert_eq!(
        phases,
        vec![
            SessionPhase::Created,
            SessionPhase::KeyAggregation,
            SessionPhase::KeysAggregated,
            SessionPhase::NonceExchange,
            SessionPhase::NoncesExchanged,
            SessionPhase::Signing,
            SessionPhase::Completed,
        ]
    );
    assert_eq!(partials_before_completion, 3);
}

#[tokio::test(start_paused = true)]
async fn test_early_nonces_are_held_until_keys_aggregate() {
    let members = mesh(3, &[]);
    let (id, initial) = start(&members, &QuorumPolicy::strict()).await;
    let late_joiner = members[1].peer_id.clone();
    let slow_receiver = members[2].peer_id.clone();

    let errors = pump(&members, initial, |to, from, msg| {
        if to == &slow_receiver && from == &late_joiner && matches!(msg, SessionMessage::Join(_)) {
            Delivery::Later
        } else {
            Delivery::Now
        }
    });
    assert!(errors.is_empty(), "{errors:?}");
    for member in &members {
        assert_eq!(member.coordinator.get(&id).unwrap().phase, SessionPhase::Completed);
    }
}

#[tokio::test(start_paused = true)]
async fn test_traffic_before_announcement_is_replayed() {
    let members = mesh(3, &[]);
    let (id, initial) = start(&members, &QuorumPolicy::strict()).await;
    let slow_receiver = members[2].peer_id.clone();

    let errors = pump(&members, initial, |to, _, msg| {
        if to == &slow_receiver && matches!(msg, SessionMessage::Announce(_)) {
            Delivery::Later
        } else {
            Delivery::Now
        }
    });
    assert!(errors.is_empty(), "{errors:?}");
    for member in &members {
        let session = member.coordinator.get(&id).unwrap();
        assert_eq!(session.phase, SessionPhase::Completed, "{}", member.peer_id);
        assert_eq!(member.coordinator.parked_count(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_forged_partial_signature_fails_session() {
    let members = mesh(2, &[]);
    let (id, initial) = start(&members, &QuorumPolicy::strict()).await;
    let initiator = members[0].peer_id.clone();
    pump(&members, initial, |to, _, msg| {
        if to == &initiator && matches!(msg, SessionMessage::PartialSignature(_)) {
            Delivery::Never
        } else {
            Delivery::Now
        }
    });
    assert_eq!(members[0].coordinator.get(&id).unwrap().phase, SessionPhase::Signing);

    let forged = SessionMessage::PartialSignature(PartialSignaturePayload {
        session_id: id.clone(),
        peer_id: members[1].peer_id.clone(),
        partial_signature: PartialSignature::from_bytes(vec![0; 32]).unwrap(),
    });
    let result = members[0].coordinator.handle_message(&members[1].peer_id, forged);
    assert!(matches!(result, Err(MeshSigError::Crypto(_))));

    let session = members[0].coordinator.get(&id).unwrap();
    assert_eq!(session.phase, SessionPhase::Failed);
    assert!(session.final_signature.is_none());
    assert!(matches!(
        members[0].coordinator.take_abort_notice(&id),
        Some(SessionMessage::Abort(_))
    ));
    assert!(members[0].coordinator.take_abort_notice(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_spoofed_sender_and_strangers_are_refused() {
    let members = mesh(3, &[]);
    let (id, initial) = start(&members, &QuorumPolicy::lenient(2)).await;
    let initiator = members[0].peer_id.clone();
    pump(&members, initial, |to, _, msg| {
        if to == &initiator && !matches!(msg, SessionMessage::Announce(_)) {
            Delivery::Never
        } else {
            Delivery::Now
        }
    });

    let spoofed = SessionMessage::Cancel(meshsig_net::CancelPayload {
        session_id: id.clone(),
        peer_id: initiator.clone(),
    });
    assert!(matches!(
        members[1].coordinator.handle_message(&members[2].peer_id, spoofed),
        Err(MeshSigError::Unauthorized(_))
    ));

    let stranger = PeerId::new("peer-stranger");
    let join = SessionMessage::Join(meshsig_net::JoinPayload {
        session_id: id.clone(),
        peer_id: stranger.clone(),
        public_key: SignerKeys::generate().public_key(),
    });
    assert!(matches!(
        members[0].coordinator.handle_message(&stranger, join),
        Err(MeshSigError::Unauthorized(_))
    ));
    assert_eq!(members[0].coordinator.get(&id).unwrap().phase, SessionPhase::KeyAggregation);
}

#[tokio::test(start_paused = true)]
async fn test_only_initiator_cancels() {
    let members = mesh(3, &[]);
    let (id, initial) = start(&members, &QuorumPolicy::strict()).await;
    pump(&members, initial, |_, _, msg| {
        if matches!(msg, SessionMessage::Nonce(_)) {
            Delivery::Never
        } else {
            Delivery::Now
        }
    });

    assert!(matches!(
        members[1].coordinator.cancel_session(&id),
        Err(MeshSigError::Unauthorized(_))
    ));
    assert_eq!(members[1].coordinator.get(&id).unwrap().phase, SessionPhase::NonceExchange);

    let notice = members[0].coordinator.cancel_session(&id).unwrap();
    let errors = pump(&members, vec![(members[0].peer_id.clone(), notice)], |_, _, _| Delivery::Now);
    assert!(errors.is_empty(), "{errors:?}");
    for member in &members {
        assert_eq!(member.coordinator.get(&id).unwrap().phase, SessionPhase::Cancelled);
    }
}

#[tokio::test(start_paused = true)]
async fn test_dropout_fails_session_and_notifies_peers() {
    let members = mesh(3, &[]);
    let (id, initial) = start(&members, &QuorumPolicy::strict()).await;
    pump(&members, initial, |_, _, msg| {
        if matches!(msg, SessionMessage::Nonce(_)) {
            Delivery::Never
        } else {
            Delivery::Now
        }
    });

    let failed = members[0]
        .coordinator
        .handle_participant_dropout(&members[2].peer_id);
    assert_eq!(failed, vec![id.clone()]);
    let session = members[0].coordinator.get(&id).unwrap();
    assert_eq!(session.phase, SessionPhase::Failed);
    assert!(session.error.unwrap().contains("dropped out"));

    let notice = members[0].coordinator.take_abort_notice(&id).unwrap();
    pump(&members, vec![(members[0].peer_id.clone(), notice)], |_, _, _| Delivery::Now);
    assert_eq!(members[1].coordinator.get(&id).unwrap().phase, SessionPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_completed_session_cannot_be_replayed() {
    let members = mesh(2, &[]);
    let (id, initial) = start(&members, &QuorumPolicy::strict()).await;
    let announcement = initial[0].clone();
    pump(&members, initial, |_, _, _| Delivery::Now);
    assert!(members[1].coordinator.is_replay(&id));

    let (from, msg) = announcement;
    assert!(matches!(
        members[1].coordinator.handle_message(&from, msg),
        Err(MeshSigError::ReplayDetected(_))
    ));
}
