//! Collaborator contracts for the shared resource directory.
//!
//! The directory is the cluster-wide source of truth for which allocation
//! owns which bound resource. It is concurrently written by every node, so
//! all mutations have upsert/delete semantics, never read-modify-write.
//! Implementations can be in-memory (single node, tests) or backed by a
//! shared database.

mod memory;

pub use memory::MemoryStorage;

use async_trait::async_trait;
use jid::{FullJid, Jid};
use thiserror::Error;

use crate::model::{CodecError, ExtPresence, Resource};

/// Storage backend failure.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store could not be reached or rejected the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored entity could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Directory of live resource records, shared across the cluster.
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    /// Insert or replace the record for a bound resource.
    async fn upsert_resource(&self, resource: &Resource) -> Result<(), StorageError>;

    /// Delete the record for a resource. No-op if absent.
    async fn delete_resource(
        &self,
        user: &str,
        domain: &str,
        resource: &str,
    ) -> Result<(), StorageError>;

    /// Fetch every record for a user at a domain.
    async fn fetch_resources(&self, user: &str, domain: &str)
        -> Result<Vec<Resource>, StorageError>;
}

/// Registry of live cluster allocations.
#[async_trait]
pub trait AllocationRegistry: Send + Sync {
    /// Register an allocation as live.
    async fn register_allocation(&self, allocation_id: &str) -> Result<(), StorageError>;

    /// Unregister an allocation, cascading deletion of every resource
    /// record and presence owned by it.
    async fn unregister_allocation(&self, allocation_id: &str) -> Result<(), StorageError>;

    /// Fetch the ids of all registered allocations.
    async fn fetch_allocations(&self) -> Result<Vec<String>, StorageError>;
}

/// Extended presence persisted per full address.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or replace the presence for a full address, tagged with the
    /// allocation that owns the connection.
    async fn upsert_presence(
        &self,
        jid: &FullJid,
        presence: &ExtPresence,
        allocation_id: &str,
    ) -> Result<(), StorageError>;

    /// Fetch the presence stored for a full address.
    async fn fetch_presence(&self, jid: &FullJid) -> Result<Option<ExtPresence>, StorageError>;

    /// Delete the presence stored for a full address. No-op if absent.
    async fn delete_presence(&self, jid: &FullJid) -> Result<(), StorageError>;
}

/// Per-user block lists, consumed by destination validation.
#[async_trait]
pub trait BlockListStore: Send + Sync {
    /// Fetch the JIDs a user has blocked.
    async fn fetch_block_list_items(&self, user: &str) -> Result<Vec<Jid>, StorageError>;
}

/// User account existence checks.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Whether an account exists for this user.
    async fn user_exists(&self, user: &str) -> Result<bool, StorageError>;
}
