// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::DiscoveryCache;
use crate::connectivity::{ConnectOutcome, ConnectivityManager, RetryPolicy};
use crate::error::{ConnectivityIssue, MeshSigError};
use crate::types::PeerId;

pub const DEFAULT_MIN_CONNECTED_PARTICIPANTS: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuorumPolicy {
    pub allow_partial_connectivity: bool,
    /// Reachable participants required in lenient mode, counting this node
    /// when it participates.
    pub min_connected_participants: usize,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            allow_partial_connectivity: false,
            min_connected_participants: DEFAULT_MIN_CONNECTED_PARTICIPANTS,
        }
    }
}

impl QuorumPolicy {
    pub fn strict() -> Self {
        Self::default()
    }

    pub fn lenient(min_connected_participants: usize) -> Self {
        Self {
            allow_partial_connectivity: true,
            min_connected_participants,
        }
    }

    pub fn with_allow_partial_connectivity(mut self, allow: bool) -> Self {
        self.allow_partial_connectivity = allow;
        self
    }

    pub fn with_min_connected_participants(mut self, min: usize) -> Self {
        self.min_connected_participants = min;
        self
    }

    /// Whether a session may proceed given the report. `local_participant`
    /// counts this node toward the quorum.
    pub fn is_satisfied(&self, report: &ConnectivityReport, local_participant: bool) -> bool {
        if report.all_connected {
            return true;
        }
        if !self.allow_partial_connectivity {
            return false;
        }
        report.connected.len() + usize::from(local_participant) >= self.min_connected_participants
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectivityReport {
    pub all_connected: bool,
    pub connected: Vec<PeerId>,
    pub failed: Vec<ConnectivityIssue>,
}

impl ConnectivityReport {
    pub fn failed_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.failed.iter().map(|issue| &issue.peer_id)
    }
}

/// Brings every required participant to a connected state before a session
/// starts, reporting per-peer results.
pub struct ParticipantVerifier {
    connectivity: Arc<ConnectivityManager>,
    cache: DiscoveryCache,
    retry: RetryPolicy,
}

impl ParticipantVerifier {
    pub fn new(connectivity: Arc<ConnectivityManager>, cache: DiscoveryCache) -> Self {
        Self {
            connectivity,
            cache,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn ensure_connected(&self, peer_ids: &[PeerId], exclude_self: bool) -> ConnectivityReport {
        let local = self.connectivity.local_peer_id();
        let mut targets: Vec<PeerId> = Vec::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            if exclude_self && *peer_id == local {
                continue;
            }
            if !targets.contains(peer_id) {
                targets.push(peer_id.clone());
            }
        }

        let mut results: HashMap<PeerId, Result<(), MeshSigError>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for peer_id in &targets {
            if self.connectivity.is_connected(peer_id).await {
                debug!(peer_id = %peer_id, "Participant already connected");
                results.insert(peer_id.clone(), Ok(()));
                continue;
            }
            let Some(entry) = self.cache.get(peer_id) else {
                results.insert(
                    peer_id.clone(),
                    Err(MeshSigError::PeerNotFound(peer_id.to_string())),
                );
                continue;
            };

            let connectivity = self.connectivity.clone();
            let retry = self.retry.clone();
            let peer_id = peer_id.clone();
            tasks.spawn(async move {
                let outcome = connectivity
                    .connect_with_retry(&peer_id, &entry.advertisement, &retry)
                    .await;
                (peer_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer_id, outcome)) => {
                    results.insert(peer_id, outcome_result(outcome));
                }
                Err(e) => warn!(error = %e, "Connectivity task failed"),
            }
        }

        let mut report = ConnectivityReport::default();
        for peer_id in targets {
            match results.remove(&peer_id) {
                Some(Ok(())) => report.connected.push(peer_id),
                Some(Err(e)) => report.failed.push(ConnectivityIssue {
                    peer_id,
                    error: e.to_string(),
                }),
                None => report.failed.push(ConnectivityIssue {
                    peer_id,
                    error: "connectivity check aborted".into(),
                }),
            }
        }
        report.all_connected = report.failed.is_empty();

        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "Participant connectivity verified"
        );
        report
    }
}

fn outcome_result(outcome: ConnectOutcome) -> Result<(), MeshSigError> {
    outcome.into_result().map(|_| ())
}
