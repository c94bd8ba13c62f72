//! Stanza routing for the c2s layer.
//!
//! The router resolves a destination address to the set of live resource
//! records in the shared directory, applies the delivery policy (full
//! address, prioritized message delivery, or broadcast), and fans delivery
//! out per owning allocation: the local allocation goes through the
//! in-process [`ResourceRegistry`], every other allocation through the
//! remote delivery client.
//!
//! # Delivery policy
//!
//! 1. Optional validations: destination account exists, destination not on
//!    the sender's block list.
//! 2. Zero directory records for the user means `NotAuthenticated`.
//! 3. A full address targets exactly the record with the matching resource
//!    (`ResourceNotFound` if none). A bare-address message goes to the
//!    highest-priority records, unless the maximum priority is <= 0, in
//!    which case it broadcasts. Any other bare-address stanza broadcasts.
//! 4. Per-allocation branches run concurrently; every branch completes
//!    before the first error (if any) is returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jid::{FullJid, Jid};
use tracing::{error, info, instrument, warn};

use crate::cluster::{
    AllocationHousekeeper, BreakerConfig, Cluster, HousekeeperConfig, HttpRemoteRouter,
    RemoteRouter,
};
use crate::model::{ExtPresence, Resource};
use crate::registry::{DeliveryMode, Endpoint, ResourceRegistry};
use crate::storage::{
    AllocationRegistry, BlockListStore, MemoryStorage, PresenceStore, ResourceDirectory, UserStore,
};
use crate::types::{jid_matches, Stanza, Validations};
use crate::RoutingError;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// The local domain this node serves.
    pub domain: String,
    /// Allocation housekeeping tick interval (clustered mode only).
    pub housekeeping_interval: Duration,
    /// Per-request timeout for remote delivery.
    pub remote_timeout: Duration,
    /// Circuit breaker tuning for remote delivery.
    pub breaker: BreakerConfig,
}

impl RouterConfig {
    /// Create a configuration for the given domain.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            housekeeping_interval: Duration::from_secs(3),
            remote_timeout: Duration::from_secs(3),
            breaker: BreakerConfig::default(),
        }
    }
}

/// The stores the router consumes.
///
/// All of them are shared collaborators; the router never assumes it is
/// the only writer.
#[derive(Clone)]
pub struct RouterStores {
    /// User account existence checks.
    pub users: Arc<dyn UserStore>,
    /// Per-user block lists.
    pub block_lists: Arc<dyn BlockListStore>,
    /// The shared resource directory.
    pub directory: Arc<dyn ResourceDirectory>,
    /// The shared allocation registry.
    pub allocations: Arc<dyn AllocationRegistry>,
    /// Extended presence per full address.
    pub presences: Arc<dyn PresenceStore>,
}

impl RouterStores {
    /// Wire every store to one in-memory backend.
    pub fn in_memory(storage: Arc<MemoryStorage>) -> Self {
        Self {
            users: storage.clone(),
            block_lists: storage.clone(),
            directory: storage.clone(),
            allocations: storage.clone(),
            presences: storage,
        }
    }
}

/// The routing contract exposed to the session layer.
#[async_trait]
pub trait C2sRouter: Send + Sync {
    /// Route a stanza to its destination user.
    async fn route(&self, stanza: Stanza, validations: Validations) -> Result<(), RoutingError>;

    /// Bind a local endpoint: directory write plus local registry write.
    async fn bind(&self, endpoint: Endpoint) -> Result<(), RoutingError>;

    /// Unbind a local resource and delete its directory records.
    async fn unbind(&self, user: &str, resource: &str) -> Result<(), RoutingError>;

    /// Look up a locally-bound endpoint.
    fn lookup(&self, user: &str, resource: &str) -> Option<Arc<Endpoint>>;

    /// All locally-bound endpoints for a user.
    fn endpoints(&self, user: &str) -> Vec<Arc<Endpoint>>;

    /// Record a presence update for a locally-bound resource.
    async fn set_presence(
        &self,
        user: &str,
        resource: &str,
        presence: ExtPresence,
    ) -> Result<(), RoutingError>;

    /// Shut the router down, waiting up to `deadline` for background work.
    async fn shutdown(&self, deadline: Duration) -> Result<(), RoutingError>;
}

/// Delivery backend for one allocation's destination group.
///
/// Two variants exist: a local-only one for single-node deployments and a
/// cluster-aware decorator that forwards non-local groups to the remote
/// delivery client. Selected once at router construction.
#[async_trait]
trait AllocationRouter: Send + Sync {
    async fn route_to_allocation(
        &self,
        stanza: &Stanza,
        to: &[Jid],
        allocation_id: &str,
        mode: DeliveryMode,
    ) -> Result<(), RoutingError>;
}

struct LocalAllocationRouter {
    registry: Arc<ResourceRegistry>,
}

#[async_trait]
impl AllocationRouter for LocalAllocationRouter {
    async fn route_to_allocation(
        &self,
        stanza: &Stanza,
        to: &[Jid],
        _allocation_id: &str,
        mode: DeliveryMode,
    ) -> Result<(), RoutingError> {
        for jid in to {
            self.registry.deliver_to_address(stanza, jid, mode)?;
        }
        Ok(())
    }
}

struct ClusterAllocationRouter {
    local: LocalAllocationRouter,
    cluster: Arc<dyn Cluster>,
    remote: Arc<dyn RemoteRouter>,
}

#[async_trait]
impl AllocationRouter for ClusterAllocationRouter {
    async fn route_to_allocation(
        &self,
        stanza: &Stanza,
        to: &[Jid],
        allocation_id: &str,
        mode: DeliveryMode,
    ) -> Result<(), RoutingError> {
        if self.cluster.is_local(allocation_id) {
            return self
                .local
                .route_to_allocation(stanza, to, allocation_id, mode)
                .await;
        }
        self.remote.route(stanza, to, allocation_id, mode).await
    }
}

/// The c2s stanza router.
pub struct StanzaRouter {
    config: RouterConfig,
    stores: RouterStores,
    registry: Arc<ResourceRegistry>,
    backend: Arc<dyn AllocationRouter>,
    allocation_id: String,
    housekeeper: Option<AllocationHousekeeper>,
}

impl std::fmt::Debug for StanzaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StanzaRouter")
            .field("config", &self.config)
            .field("allocation_id", &self.allocation_id)
            .finish_non_exhaustive()
    }
}

impl StanzaRouter {
    /// Create a single-node router.
    ///
    /// Every directory record belongs to this node's (generated) allocation
    /// id; no housekeeper runs and directory entries are cleaned up
    /// synchronously on unbind.
    pub fn local(config: RouterConfig, stores: RouterStores) -> Self {
        let registry = Arc::new(ResourceRegistry::new());
        let backend = Arc::new(LocalAllocationRouter {
            registry: registry.clone(),
        });
        let allocation_id = uuid::Uuid::new_v4().to_string();

        info!(domain = %config.domain, allocation_id = %allocation_id, "Stanza router initialized (single node)");

        Self {
            config,
            stores,
            registry,
            backend,
            allocation_id,
            housekeeper: None,
        }
    }

    /// Create a cluster-aware router over the given cluster context, using
    /// the HTTP remote delivery transport.
    ///
    /// Registers this allocation in the directory, enters the leader
    /// election, joins the membership, and starts the allocation
    /// housekeeper. Lifecycle failures here are fatal.
    pub async fn clustered(
        config: RouterConfig,
        stores: RouterStores,
        cluster: Arc<dyn Cluster>,
    ) -> Result<Self, RoutingError> {
        let remote = Arc::new(HttpRemoteRouter::new(
            cluster.clone(),
            config.remote_timeout,
            config.breaker.clone(),
        )?);
        Self::clustered_with_remote(config, stores, cluster, remote).await
    }

    /// Create a cluster-aware router with a custom remote delivery
    /// transport.
    pub async fn clustered_with_remote(
        config: RouterConfig,
        stores: RouterStores,
        cluster: Arc<dyn Cluster>,
        remote: Arc<dyn RemoteRouter>,
    ) -> Result<Self, RoutingError> {
        let registry = Arc::new(ResourceRegistry::new());
        let allocation_id = cluster.local_allocation_id().to_string();

        stores.allocations.register_allocation(&allocation_id).await?;
        cluster.elect().await?;
        cluster.join().await?;

        let backend = Arc::new(ClusterAllocationRouter {
            local: LocalAllocationRouter {
                registry: registry.clone(),
            },
            cluster: cluster.clone(),
            remote,
        });
        let housekeeper = AllocationHousekeeper::start(
            cluster,
            stores.allocations.clone(),
            HousekeeperConfig {
                interval: config.housekeeping_interval,
            },
        );

        info!(domain = %config.domain, allocation_id = %allocation_id, "Stanza router initialized (clustered)");

        Ok(Self {
            config,
            stores,
            registry,
            backend,
            allocation_id,
            housekeeper: Some(housekeeper),
        })
    }

    /// The local resource registry, shared with the inbound cluster
    /// delivery endpoint.
    pub fn registry(&self) -> Arc<ResourceRegistry> {
        self.registry.clone()
    }

    /// This node's allocation id.
    pub fn allocation_id(&self) -> &str {
        &self.allocation_id
    }

    async fn is_blocked_jid(&self, to: &Jid, sender: &str) -> bool {
        match self.stores.block_lists.fetch_block_list_items(sender).await {
            Ok(items) => items.iter().any(|blocked| jid_matches(blocked, to)),
            Err(e) => {
                // Fail open: a broken block-list store must not make every
                // destination unreachable.
                error!(error = %e, "Failed to fetch block list items");
                false
            }
        }
    }

    async fn route_to_resources(
        &self,
        stanza: &Stanza,
        to: &Jid,
        mut resources: Vec<Resource>,
    ) -> Result<(), RoutingError> {
        if to.node().is_some() && to.resource().is_some() {
            return self.route_to_full_resource(stanza, to, &resources).await;
        }
        if stanza.is_message() && self.route_to_prioritized(stanza, &mut resources).await? {
            return Ok(());
        }
        self.route_to_all(stanza, &resources).await
    }

    /// Deliver to the single record whose resource matches the full
    /// destination address. First match wins.
    async fn route_to_full_resource(
        &self,
        stanza: &Stanza,
        to: &Jid,
        resources: &[Resource],
    ) -> Result<(), RoutingError> {
        let target = to.resource().map(|r| r.as_str());
        for record in resources {
            if record.jid.resource().map(|r| r.as_str()) != target {
                continue;
            }
            return self
                .backend
                .route_to_allocation(
                    stanza,
                    std::slice::from_ref(to),
                    &record.allocation_id,
                    DeliveryMode::Targeted,
                )
                .await;
        }
        Err(RoutingError::ResourceNotFound)
    }

    /// Deliver a bare-address message to the records sharing the maximum
    /// priority. Returns false when the maximum priority is <= 0, in which
    /// case the caller broadcasts instead.
    async fn route_to_prioritized(
        &self,
        stanza: &Stanza,
        resources: &mut Vec<Resource>,
    ) -> Result<bool, RoutingError> {
        resources.sort_by(|a, b| b.priority.cmp(&a.priority));
        let highest = resources[0].priority;
        if highest <= 0 {
            return Ok(false);
        }
        let prioritized: Vec<Resource> = resources
            .iter()
            .take_while(|record| record.priority == highest)
            .cloned()
            .collect();
        self.route_to_all(stanza, &prioritized).await?;
        Ok(true)
    }

    /// Group records by owning allocation and dispatch every group
    /// concurrently. All branches complete before the first error (in group
    /// iteration order) is returned, so a failing allocation never blocks
    /// delivery to its siblings.
    async fn route_to_all(
        &self,
        stanza: &Stanza,
        resources: &[Resource],
    ) -> Result<(), RoutingError> {
        let mut route_tbl: HashMap<String, Vec<Jid>> = HashMap::new();
        for record in resources {
            route_tbl
                .entry(record.allocation_id.clone())
                .or_default()
                .push(record.jid.clone());
        }

        let branches = route_tbl.into_iter().map(|(allocation_id, to_jids)| {
            let backend = self.backend.clone();
            let stanza = stanza.clone();
            async move {
                backend
                    .route_to_allocation(&stanza, &to_jids, &allocation_id, DeliveryMode::Broadcast)
                    .await
            }
        });

        let mut first_error = None;
        for result in futures::future::join_all(branches).await {
            if let Err(e) = result {
                warn!(error = %e, "Delivery branch failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl C2sRouter for StanzaRouter {
    #[instrument(skip(self, stanza), fields(stanza = stanza.name(), to = ?stanza.to()))]
    async fn route(&self, stanza: Stanza, validations: Validations) -> Result<(), RoutingError> {
        let to = stanza
            .to()
            .cloned()
            .ok_or_else(|| RoutingError::MalformedStanza("stanza has no destination".to_string()))?;
        let user = to.node().map(|n| n.as_str()).unwrap_or_default().to_string();

        if validations.contains(Validations::USER_EXISTENCE)
            && !self.stores.users.user_exists(&user).await?
        {
            return Err(RoutingError::NoSuchAccount);
        }
        if validations.contains(Validations::BLOCKED_DESTINATION) {
            if let Some(from) = stanza.from() {
                let sender = from.node().map(|n| n.as_str()).unwrap_or_default();
                if self.is_blocked_jid(&to, sender).await {
                    return Err(RoutingError::Blocked);
                }
            }
        }

        let resources = self
            .stores
            .directory
            .fetch_resources(&user, to.domain().as_str())
            .await?;
        if resources.is_empty() {
            return Err(RoutingError::NotAuthenticated);
        }
        self.route_to_resources(&stanza, &to, resources).await
    }

    async fn bind(&self, endpoint: Endpoint) -> Result<(), RoutingError> {
        let record = Resource {
            allocation_id: self.allocation_id.clone(),
            jid: Jid::from(endpoint.jid().clone()),
            priority: endpoint.priority(),
        };
        self.stores.directory.upsert_resource(&record).await?;

        let jid = endpoint.jid().clone();
        self.registry.bind(endpoint);
        info!(jid = %jid, "Bound c2s resource");
        Ok(())
    }

    async fn unbind(&self, user: &str, resource: &str) -> Result<(), RoutingError> {
        let removed = self.registry.unbind(user, resource);
        self.stores
            .directory
            .delete_resource(user, &self.config.domain, resource)
            .await?;

        let jid: FullJid = match removed {
            Some(endpoint) => endpoint.jid().clone(),
            None => format!("{}@{}/{}", user, self.config.domain, resource).parse()?,
        };
        self.stores.presences.delete_presence(&jid).await?;

        info!(user, resource, "Unbound c2s resource");
        Ok(())
    }

    fn lookup(&self, user: &str, resource: &str) -> Option<Arc<Endpoint>> {
        self.registry.lookup(user, resource)
    }

    fn endpoints(&self, user: &str) -> Vec<Arc<Endpoint>> {
        self.registry.endpoints_for_user(user)
    }

    async fn set_presence(
        &self,
        user: &str,
        resource: &str,
        presence: ExtPresence,
    ) -> Result<(), RoutingError> {
        let available = presence.is_available();
        let priority = presence.presence.priority;
        self.registry
            .update_presence(user, resource, available, priority);

        // Keep the shared directory in sync so remote nodes route on the
        // advertised priority.
        if let Some(endpoint) = self.registry.lookup(user, resource) {
            let record = Resource {
                allocation_id: self.allocation_id.clone(),
                jid: Jid::from(endpoint.jid().clone()),
                priority,
            };
            self.stores.directory.upsert_resource(&record).await?;
            self.stores
                .presences
                .upsert_presence(endpoint.jid(), &presence, &self.allocation_id)
                .await?;
        }
        Ok(())
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), RoutingError> {
        if let Some(housekeeper) = &self.housekeeper {
            housekeeper.shutdown(deadline).await?;
        }
        info!("Stanza router shut down");
        Ok(())
    }
}
