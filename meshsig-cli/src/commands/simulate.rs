// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::time::{Duration, Instant};

use meshsig_net::mock::{MockMusig, MockNetwork};
use meshsig_net::{
    DiscoveryCache, FinalSignature, MeshNode, MeshSigError, Multiaddr, PeerId, SessionEvent, SignerKeys,
    MAX_PARTICIPANTS,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CliError, Result};
use crate::output::Output;

const SIM_REANNOUNCE_INTERVAL: Duration = Duration::from_millis(200);
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(10);
const SIGNING_DEADLINE: Duration = Duration::from_secs(60);
const SETTLE_DEADLINE: Duration = Duration::from_secs(5);

fn sim_node(network: &MockNetwork, cfg: &Config, index: usize, reachable: bool) -> Result<Arc<MeshNode>> {
    let peer_id = PeerId::new(format!("sim-{index}"));
    let webrtc = Multiaddr::parse(&format!(
        "/ip4/127.0.0.{}/udp/9090/webrtc-direct/p2p/{peer_id}",
        index + 1
    ))?;
    if reachable {
        network.listen(&peer_id, &webrtc);
    }
    let config = cfg
        .node()
        .with_multiaddrs(Vec::new())
        .with_relay_addrs(Vec::new())
        .with_webrtc_addr(Some(webrtc))
        .with_reannounce_interval(SIM_REANNOUNCE_INTERVAL);
    Ok(Arc::new(MeshNode::new(
        SignerKeys::generate(),
        network.transport(peer_id),
        Arc::new(MockMusig::new()),
        DiscoveryCache::in_memory(),
        config,
    )))
}

async fn wait_for_outcome(
    rx: &mut broadcast::Receiver<SessionEvent>,
    session_id: &str,
) -> Result<FinalSignature> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Completed { session_id: id, signature }) if id == session_id => {
                    return Ok(signature);
                }
                Ok(SessionEvent::Failed { session_id: id, error }) if id == session_id => {
                    return Err(CliError::Other(error));
                }
                Ok(SessionEvent::PhaseChanged { session_id: id, from, to }) if id == session_id => {
                    debug!(%from, %to, "phase changed");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CliError::Other("Session event channel closed".into()));
                }
            }
        }
    };
    tokio::time::timeout(SIGNING_DEADLINE, wait)
        .await
        .map_err(|_| CliError::Other("Signing did not finish in time".into()))?
}

/// Signers holding `signature` for the session once the stragglers have
/// processed the last partial signatures.
async fn wait_for_agreement(nodes: &[Arc<MeshNode>], session_id: &str, signature: &FinalSignature) -> usize {
    let agreeing = || {
        nodes
            .iter()
            .filter(|n| {
                n.coordinator()
                    .get(session_id)
                    .and_then(|s| s.final_signature)
                    .as_ref()
                    == Some(signature)
            })
            .count()
    };
    let expected = nodes
        .iter()
        .filter(|n| n.coordinator().get(session_id).is_some())
        .count();
    let started = Instant::now();
    while agreeing() < expected && started.elapsed() < SETTLE_DEADLINE {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    agreeing()
}

#[tracing::instrument(skip(out, cfg))]
pub fn cmd_simulate(
    out: &Output,
    cfg: &Config,
    participants: usize,
    unreachable: usize,
    message: &str,
) -> Result<()> {
    if !(2..=MAX_PARTICIPANTS).contains(&participants) {
        return Err(CliError::Other(format!(
            "participants must be between 2 and {MAX_PARTICIPANTS}"
        )));
    }
    if unreachable >= participants {
        return Err(CliError::Other(
            "at least the initiator must be reachable".into(),
        ));
    }

    out.header("Simulated signing mesh");
    out.field("Participants", &participants.to_string());
    out.field("Unreachable", &unreachable.to_string());
    let quorum = cfg.quorum();
    out.field(
        "Quorum",
        &if quorum.allow_partial_connectivity {
            format!("lenient (min {})", quorum.min_connected_participants)
        } else {
            "strict".to_string()
        },
    );

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::Other(format!("Runtime error: {e}")))?;

    rt.block_on(async {
        let network = MockNetwork::new();
        let nodes = (0..participants)
            .map(|i| sim_node(&network, cfg, i, i < participants - unreachable))
            .collect::<Result<Vec<_>>>()?;

        let mut shutdowns = Vec::new();
        let mut handles = Vec::new();
        for node in &nodes {
            if let Some(shutdown) = node.take_shutdown_handle() {
                shutdowns.push(shutdown);
            }
            let runner = node.clone();
            handles.push(tokio::spawn(async move { runner.run().await }));
        }

        let started = Instant::now();
        while nodes.iter().any(|n| n.identities().len() < participants - 1) {
            if started.elapsed() > DISCOVERY_DEADLINE {
                return Err(CliError::Other("Peers did not discover each other".into()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "mesh discovered");

        let initiator = &nodes[0];
        let keys: Vec<_> = nodes.iter().map(|n| n.public_key()).collect();
        let roster = initiator.resolve_participants(&keys)?;
        let mut events = initiator.subscribe_sessions();

        let result = match initiator
            .start_session(message.as_bytes().to_vec(), roster, &quorum)
            .await
        {
            Ok(session) => {
                out.field("Session", &session.id);
                for peer in &session.excluded {
                    out.warn(&format!("Excluded unreachable participant {peer}"));
                }
                match wait_for_outcome(&mut events, &session.id).await {
                    Ok(signature) => {
                        let agreeing = wait_for_agreement(&nodes, &session.id, &signature).await;
                        Ok((session.id, signature, agreeing))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(MeshSigError::SessionCreationFailed { connectivity_issues }) => {
                for issue in &connectivity_issues {
                    out.warn(&format!("{} unreachable: {}", issue.peer_id, issue.error));
                }
                Err(MeshSigError::SessionCreationFailed { connectivity_issues }.into())
            }
            Err(e) => Err(e.into()),
        };

        for node in nodes.iter().skip(1) {
            let status = initiator.connectivity().status(&node.local_peer_id());
            out.field(
                node.local_peer_id().as_str(),
                &format!("{:?} via {}", status.status, status.connection_type),
            );
        }

        for shutdown in shutdowns {
            let _ = shutdown.send(()).await;
        }
        for handle in handles {
            match handle.await {
                Ok(Err(e)) => warn!(error = %e, "node exited with error"),
                Err(e) => warn!(error = %e, "node task panicked"),
                Ok(Ok(())) => {}
            }
        }

        let (session_id, signature, agreeing) = result?;
        let aggregated_key = initiator
            .coordinator()
            .get(&session_id)
            .and_then(|s| s.aggregated_public_key)
            .map(|k| k.to_hex())
            .unwrap_or_default();
        out.newline();
        out.key_field("Aggregated key", &aggregated_key);
        out.key_field("Signature", &signature.to_hex());
        out.success(&format!("{agreeing} participant(s) produced this signature"));
        Ok(())
    })
}
