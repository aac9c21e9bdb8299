//! Primary Election
//!
//! Seed-based election: every candidate broadcasts a proposal carrying a
//! random seed and the lowest proposal wins. There is no quorum; an
//! established primary always wins over a new round, and two primaries
//! created by a partition converge as soon as either hears the other.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};

use super::membership::Membership;
use crate::error::Result;
use crate::messenger::{ClusterEvent, NodeMessage};

/// A candidacy for the primary role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionProposal {
    /// Candidate's advertised address
    pub candidate: String,
    pub seed: u64,
    /// Unix milliseconds
    pub started_at: i64,
}

impl ElectionProposal {
    /// A proposal with a fresh random seed
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            seed: rand::thread_rng().gen(),
            started_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl Ord for ElectionProposal {
    /// Lower seed wins, then earlier start, then the smaller address
    fn cmp(&self, other: &Self) -> Ordering {
        self.seed
            .cmp(&other.seed)
            .then(self.started_at.cmp(&other.started_at))
            .then_with(|| self.candidate.cmp(&other.candidate))
    }
}

impl PartialOrd for ElectionProposal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Answer to a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionResponse {
    /// The proposal became the responder's best-known proposal
    pub accepted: bool,
    /// Primary known to the responder
    pub current_primary: Option<String>,
    /// `current_primary` is healthy and wins over any new round
    pub established: bool,
    /// Responder's best-known proposal for the live round
    pub proposal: Option<ElectionProposal>,
}

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionState {
    /// No election has run yet
    Idle,
    /// Broadcasting a proposal
    Electing,
    /// Won an election
    Primary,
    /// Following a primary
    Replica,
}

/// How the coordinator reaches its peers
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver a proposal and return the peer's answer
    async fn propose(&self, address: &str, proposal: &ElectionProposal) -> Result<ElectionResponse>;

    /// Deliver any other message and return the peer's answer
    async fn send(&self, address: &str, message: NodeMessage) -> Result<NodeMessage>;
}

/// Election timing
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long a round collects answers
    pub window: Duration,
    /// Primary silence tolerated before an election
    pub heartbeat_timeout: Duration,
    /// Rounds retried with a fresh seed when nobody answers
    pub attempts: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(2),
            attempts: 3,
        }
    }
}

struct Round {
    best: ElectionProposal,
    expires_at: Instant,
}

/// Election coordinator
pub struct ElectionCoordinator {
    /// This node's ID
    node_id: String,
    /// This node's address
    address: String,
    state: RwLock<ElectionState>,
    /// Best-known proposal of the live round
    round: RwLock<Option<Round>>,
    /// Proposal the current primary won with
    primary_proposal: RwLock<Option<ElectionProposal>>,
    /// Set by step-down; skips proposing in the next round
    abstain: AtomicBool,
    config: ElectionConfig,
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
}

impl ElectionCoordinator {
    /// Create a new election coordinator
    pub fn new(
        node_id: impl Into<String>,
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        config: ElectionConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            address: membership.local_address().to_string(),
            state: RwLock::new(ElectionState::Idle),
            round: RwLock::new(None),
            primary_proposal: RwLock::new(None),
            abstain: AtomicBool::new(false),
            config,
            membership,
            transport,
        }
    }

    /// Get current state
    pub async fn state(&self) -> ElectionState {
        *self.state.read().await
    }

    pub async fn is_primary(&self) -> bool {
        self.state().await == ElectionState::Primary
    }

    /// Proposal the current primary was elected with
    pub async fn primary_proposal(&self) -> Option<ElectionProposal> {
        self.primary_proposal.read().await.clone()
    }

    /// True when no primary is known or the known primary went quiet
    pub async fn needs_election(&self) -> bool {
        match *self.state.read().await {
            ElectionState::Primary | ElectionState::Electing => return false,
            ElectionState::Idle | ElectionState::Replica => {}
        }

        match self.membership.primary().await {
            None => true,
            Some(primary) => {
                primary.address != self.address && !primary.is_healthy(self.config.heartbeat_timeout)
            }
        }
    }

    /// Record `proposal` as best-known if it beats the live round
    async fn consider(&self, proposal: &ElectionProposal) -> (bool, ElectionProposal) {
        let mut round = self.round.write().await;
        let now = Instant::now();

        if let Some(live) = round.as_ref().filter(|r| r.expires_at > now) {
            if live.best <= *proposal {
                return (false, live.best.clone());
            }
        }

        *round = Some(Round {
            best: proposal.clone(),
            expires_at: now + self.config.window,
        });
        (true, proposal.clone())
    }

    /// Best-known proposal of the live round
    async fn round_best(&self) -> Option<ElectionProposal> {
        let round = self.round.read().await;
        round
            .as_ref()
            .filter(|r| r.expires_at > Instant::now())
            .map(|r| r.best.clone())
    }

    /// Run an election and return the resulting primary address
    pub async fn run_election(&self) -> Result<Option<String>> {
        if self.abstain.swap(false, AtomicOrdering::SeqCst) {
            tracing::info!("Abstaining from this election after stepping down");
            *self.state.write().await = ElectionState::Replica;
            return Ok(None);
        }

        *self.state.write().await = ElectionState::Electing;

        for attempt in 1..=self.config.attempts {
            let proposal = ElectionProposal::new(&self.address);
            self.consider(&proposal).await;

            let peers = self.membership.peers().await;
            tracing::info!(
                "Starting election attempt {} with seed {} ({} peers)",
                attempt,
                proposal.seed,
                peers.len()
            );

            let requests = peers.iter().map(|peer| {
                let proposal = &proposal;
                async move {
                    match timeout(self.config.window, self.transport.propose(&peer.address, proposal)).await {
                        Ok(Ok(response)) => Some((peer.address.clone(), response)),
                        Ok(Err(e)) => {
                            tracing::debug!("Peer {} abstained: {}", peer.address, e);
                            None
                        }
                        Err(_) => {
                            tracing::debug!("Peer {} abstained: no answer in window", peer.address);
                            None
                        }
                    }
                }
            });
            let responses: Vec<(String, ElectionResponse)> =
                futures::future::join_all(requests).await.into_iter().flatten().collect();

            if responses.is_empty() && !peers.is_empty() && attempt < self.config.attempts {
                tracing::warn!("No peer answered election attempt {}, retrying", attempt);
                continue;
            }

            // A peer may have become primary while we were collecting answers
            if let ElectionState::Replica = *self.state.read().await {
                return Ok(self.membership.primary().await.map(|p| p.address));
            }

            for (responder, response) in &responses {
                if !response.established {
                    continue;
                }
                if let Some(primary) = &response.current_primary {
                    if primary != &self.address {
                        tracing::info!(
                            "{} reports established primary {}, following it",
                            responder,
                            primary
                        );
                        self.become_replica(primary, response.proposal.clone()).await;
                        return Ok(Some(primary.clone()));
                    }
                }
            }

            let mut winner = self.round_best().await.unwrap_or(proposal);
            for (_, response) in &responses {
                if let Some(theirs) = &response.proposal {
                    if *theirs < winner {
                        winner = theirs.clone();
                    }
                }
            }

            if winner.candidate == self.address {
                self.become_primary(winner).await;
                return Ok(Some(self.address.clone()));
            }

            let primary = winner.candidate.clone();
            tracing::info!("Election won by {} (seed {})", primary, winner.seed);
            self.become_replica(&primary, Some(winner)).await;
            return Ok(Some(primary));
        }

        *self.state.write().await = ElectionState::Idle;
        Ok(None)
    }

    /// Handle a proposal from another candidate
    pub async fn propose(&self, proposal: ElectionProposal) -> ElectionResponse {
        if self.is_primary().await && proposal.candidate != self.address {
            return ElectionResponse {
                accepted: false,
                current_primary: Some(self.address.clone()),
                established: true,
                proposal: self.primary_proposal().await,
            };
        }

        if let Some(primary) = self.membership.primary().await {
            if primary.address != proposal.candidate
                && primary.address != self.address
                && primary.is_healthy(self.config.heartbeat_timeout)
            {
                return ElectionResponse {
                    accepted: false,
                    current_primary: Some(primary.address),
                    established: true,
                    proposal: self.primary_proposal().await,
                };
            }
        }

        let (accepted, best) = self.consider(&proposal).await;
        if accepted {
            tracing::debug!(
                "Adopted proposal from {} (seed {})",
                proposal.candidate,
                proposal.seed
            );
        }

        ElectionResponse {
            accepted,
            current_primary: self.membership.primary().await.map(|p| p.address),
            established: false,
            proposal: Some(best),
        }
    }

    /// Apply a primary announcement or heartbeat.
    /// Returns true if the local node gave up the primary role.
    pub async fn observe_primary(
        &self,
        id: &str,
        address: &str,
        proposal: Option<ElectionProposal>,
    ) -> bool {
        if address == self.address {
            return false;
        }

        if self.is_primary().await {
            let mine = self.primary_proposal().await;
            let theirs_wins = match (&proposal, &mine) {
                (Some(theirs), Some(mine)) => theirs < mine,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => address < self.address.as_str(),
            };

            if !theirs_wins {
                tracing::warn!("Ignoring competing primary {} with a weaker proposal", address);
                return false;
            }

            tracing::warn!("Competing primary {} holds a better proposal, stepping down", address);
            self.membership.add(id, address).await;
            self.become_replica(address, proposal).await;
            return true;
        }

        self.membership.add(id, address).await;
        let known = self.membership.primary().await;
        if known.as_ref().map(|p| p.address.as_str()) != Some(address) {
            tracing::info!("Following primary {}", address);
        }
        self.become_replica(address, proposal).await;
        false
    }

    /// Apply a cluster event received from a peer
    pub async fn apply_event(&self, event: &ClusterEvent) -> bool {
        match event {
            ClusterEvent::Heartbeat { id, address, proposal }
            | ClusterEvent::PrimaryChanged { id, address, proposal } => {
                self.observe_primary(id, address, proposal.clone()).await
            }
            ClusterEvent::PrimaryStepDown { address } => {
                if self
                    .membership
                    .primary()
                    .await
                    .map(|p| &p.address == address)
                    .unwrap_or(false)
                {
                    tracing::info!("Primary {} stepped down", address);
                    self.membership.clear_primary().await;
                    *self.primary_proposal.write().await = None;
                }
                false
            }
            ClusterEvent::MemberJoined { id, address } => {
                self.membership.add(id, address).await;
                false
            }
            ClusterEvent::MemberLeft { address } => {
                let removed = self.membership.remove(address).await;
                if removed.map(|n| n.is_primary()).unwrap_or(false) {
                    *self.primary_proposal.write().await = None;
                }
                false
            }
        }
    }

    /// Give up the primary role and tell every peer
    pub async fn step_down(&self) -> Result<()> {
        if !self.is_primary().await {
            return Ok(());
        }

        *self.state.write().await = ElectionState::Replica;
        *self.primary_proposal.write().await = None;
        *self.round.write().await = None;
        self.membership.clear_primary().await;
        self.abstain.store(true, AtomicOrdering::SeqCst);

        tracing::info!("Stepping down from primary");
        self.broadcast(ClusterEvent::PrimaryStepDown {
            address: self.address.clone(),
        })
        .await;
        Ok(())
    }

    /// Event announcing the local node as primary
    pub async fn heartbeat(&self) -> Option<ClusterEvent> {
        if !self.is_primary().await {
            return None;
        }
        Some(ClusterEvent::Heartbeat {
            id: self.node_id.clone(),
            address: self.address.clone(),
            proposal: self.primary_proposal().await,
        })
    }

    /// Send an event to every peer, bounded by the election window
    pub async fn broadcast(&self, event: ClusterEvent) -> usize {
        let peers = self.membership.peers().await;
        let name = event.name();
        let sends = peers.iter().map(|peer| {
            let message = NodeMessage::Broadcast(event.clone());
            async move {
                match timeout(self.config.window, self.transport.send(&peer.address, message)).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        tracing::debug!("{} to {} failed: {}", name, peer.address, e);
                        false
                    }
                    Err(_) => false,
                }
            }
        });
        futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    async fn become_primary(&self, proposal: ElectionProposal) {
        *self.state.write().await = ElectionState::Primary;
        *self.primary_proposal.write().await = Some(proposal.clone());
        *self.round.write().await = None;
        self.membership.set_primary(Some(&self.node_id), &self.address).await;

        tracing::info!("Won election with seed {}, becoming PRIMARY", proposal.seed);

        self.broadcast(ClusterEvent::PrimaryChanged {
            id: self.node_id.clone(),
            address: self.address.clone(),
            proposal: Some(proposal),
        })
        .await;
    }

    async fn become_replica(&self, primary: &str, proposal: Option<ElectionProposal>) {
        *self.state.write().await = ElectionState::Replica;
        *self.primary_proposal.write().await = proposal;
        *self.round.write().await = None;
        self.membership.set_primary(None, primary).await;
    }
}
