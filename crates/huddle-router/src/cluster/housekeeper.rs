//! Allocation housekeeping.
//!
//! A periodic, leader-gated task that reaps directory records left behind
//! by crashed nodes: any registered allocation absent from current cluster
//! membership is unregistered, cascading deletion of its resource records
//! and presences. Followers tick but no-op, so no two nodes delete
//! concurrently.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Cluster;
use crate::storage::AllocationRegistry;
use crate::RoutingError;

/// Housekeeper tuning.
#[derive(Debug, Clone)]
pub struct HousekeeperConfig {
    /// Tick interval. Each tick gets half of this as its deadline, so an
    /// unresponsive store cannot stall subsequent ticks indefinitely.
    pub interval: Duration,
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
        }
    }
}

/// Handle to the running housekeeping task.
pub struct AllocationHousekeeper {
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AllocationHousekeeper {
    /// Spawn the housekeeping loop.
    pub fn start(
        cluster: Arc<dyn Cluster>,
        allocations: Arc<dyn AllocationRegistry>,
        config: HousekeeperConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let tick_deadline = config.interval / 2;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First interval tick fires immediately; skip it so a freshly
            // started node does not reconcile before its peers have joined.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Reconciliation runs inline: a stop request is only
                        // observed between ticks, never mid-reconciliation.
                        if let Err(e) = reconcile(&cluster, &allocations, tick_deadline).await {
                            warn!(error = %e, "Housekeeping tick failed, retrying next tick");
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("Housekeeping loop stopped");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Request a stop and wait for the in-flight tick, if any, to finish.
    ///
    /// On deadline expiry the task is logically detached (never force-killed)
    /// and `DeadlineExceeded` is returned.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RoutingError> {
        self.shutdown.cancel();
        let handle = self.handle.lock().unwrap().take();
        match handle {
            Some(handle) => match tokio::time::timeout(deadline, handle).await {
                Ok(_) => Ok(()),
                Err(_) => {
                    warn!("Housekeeper shutdown deadline expired, detaching task");
                    Err(RoutingError::DeadlineExceeded)
                }
            },
            None => Ok(()),
        }
    }
}

/// One reconciliation pass. Leaders reap absent allocations; followers no-op.
async fn reconcile(
    cluster: &Arc<dyn Cluster>,
    allocations: &Arc<dyn AllocationRegistry>,
    deadline: Duration,
) -> Result<(), RoutingError> {
    if !cluster.is_leader() {
        return Ok(());
    }
    tokio::time::timeout(deadline, async {
        let allocation_ids = allocations.fetch_allocations().await?;
        let members = cluster.members();
        for allocation_id in allocation_ids {
            if members.contains_key(&allocation_id) {
                continue;
            }
            info!(allocation_id = %allocation_id, "Reaping allocation absent from cluster membership");
            allocations.unregister_allocation(&allocation_id).await?;
        }
        Ok::<(), RoutingError>(())
    })
    .await
    .map_err(|_| RoutingError::DeadlineExceeded)?
}
