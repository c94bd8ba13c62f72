//! Cluster coordination: membership view, remote delivery, housekeeping.
//!
//! The membership/leader-election transport itself (etcd, raft, ...) is an
//! external collaborator consumed behind the [`Cluster`] trait. The router
//! receives the cluster context explicitly at construction; there is no
//! process-wide singleton.

mod breaker;
mod endpoint;
mod housekeeper;
mod remote;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use endpoint::cluster_endpoint;
pub use housekeeper::{AllocationHousekeeper, HousekeeperConfig};
pub use remote::{HttpRemoteRouter, RemoteRouter};

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::RoutingError;

/// Network address of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member host name or address.
    pub host: String,
    /// Port of the member's cluster delivery endpoint.
    pub port: u16,
}

/// Read-only view of cluster membership plus lifecycle hooks.
///
/// `elect` and `join` are invoked once at router startup; failures there
/// are fatal. Everything else is consulted on the routing hot path and must
/// not block.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Allocation id of this node.
    fn local_allocation_id(&self) -> &str;

    /// Snapshot of current members by allocation id.
    fn members(&self) -> HashMap<String, Member>;

    /// Look up a single member by allocation id.
    fn member(&self, allocation_id: &str) -> Option<Member>;

    /// Whether this node currently holds cluster leadership.
    fn is_leader(&self) -> bool;

    /// Enter the leader election.
    async fn elect(&self) -> Result<(), RoutingError>;

    /// Join the cluster membership.
    async fn join(&self) -> Result<(), RoutingError>;

    /// Whether an allocation id refers to this node.
    fn is_local(&self, allocation_id: &str) -> bool {
        allocation_id == self.local_allocation_id()
    }
}

/// Fixed-membership cluster view.
///
/// Backs tests and single-process multi-node setups; real deployments plug
/// a coordination-service implementation in behind [`Cluster`].
#[derive(Debug, Default)]
pub struct StaticCluster {
    allocation_id: String,
    members: DashMap<String, Member>,
    leader: AtomicBool,
}

impl StaticCluster {
    /// Create a view for the given local allocation id.
    pub fn new(allocation_id: impl Into<String>) -> Self {
        Self {
            allocation_id: allocation_id.into(),
            members: DashMap::new(),
            leader: AtomicBool::new(false),
        }
    }

    /// Add or replace a member.
    pub fn add_member(&self, allocation_id: impl Into<String>, host: impl Into<String>, port: u16) {
        self.members.insert(
            allocation_id.into(),
            Member {
                host: host.into(),
                port,
            },
        );
    }

    /// Remove a member.
    pub fn remove_member(&self, allocation_id: &str) {
        self.members.remove(allocation_id);
    }

    /// Mark this node as leader or follower.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Relaxed);
    }
}

#[async_trait]
impl Cluster for StaticCluster {
    fn local_allocation_id(&self) -> &str {
        &self.allocation_id
    }

    fn members(&self) -> HashMap<String, Member> {
        self.members
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn member(&self, allocation_id: &str) -> Option<Member> {
        self.members.get(allocation_id).map(|m| m.value().clone())
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    async fn elect(&self) -> Result<(), RoutingError> {
        // Single-candidate election: the static view elects itself.
        self.set_leader(true);
        Ok(())
    }

    async fn join(&self) -> Result<(), RoutingError> {
        self.add_member(self.allocation_id.clone(), "127.0.0.1", 0);
        Ok(())
    }
}
