//! In-memory storage backend.
//!
//! Suitable for single-node deployments and tests. Entities are kept in
//! their binary directory encoding, so this backend exercises the same
//! codec path a shared database would.

use async_trait::async_trait;
use dashmap::DashMap;
use jid::{FullJid, Jid};

use crate::model::{ExtPresence, Resource};

use super::{
    AllocationRegistry, BlockListStore, PresenceStore, ResourceDirectory, StorageError, UserStore,
};

/// In-memory implementation of every directory contract.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// `user:domain:resource` -> encoded `Resource`.
    resources: DashMap<String, Vec<u8>>,
    /// allocation id -> encoded `Allocation`.
    allocations: DashMap<String, Vec<u8>>,
    /// full JID -> (owning allocation id, encoded `ExtPresence`).
    presences: DashMap<String, (String, Vec<u8>)>,
    /// user -> blocked JIDs.
    block_lists: DashMap<String, Vec<Jid>>,
    /// registered account names.
    users: DashMap<String, ()>,
}

fn resource_key(user: &str, domain: &str, resource: &str) -> String {
    format!("{}:{}:{}", user, domain, resource)
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user account.
    pub fn add_user(&self, user: &str) {
        self.users.insert(user.to_string(), ());
    }

    /// Replace a user's block list.
    pub fn set_block_list(&self, user: &str, items: Vec<Jid>) {
        self.block_lists.insert(user.to_string(), items);
    }

    /// Number of stored resource records.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Number of stored presences.
    pub fn presence_count(&self) -> usize {
        self.presences.len()
    }
}

#[async_trait]
impl ResourceDirectory for MemoryStorage {
    async fn upsert_resource(&self, resource: &Resource) -> Result<(), StorageError> {
        let user = resource
            .jid
            .node()
            .map(|n| n.as_str().to_string())
            .unwrap_or_default();
        let res = resource
            .jid
            .resource()
            .map(|r| r.as_str().to_string())
            .unwrap_or_default();
        let key = resource_key(&user, resource.jid.domain().as_str(), &res);
        self.resources.insert(key, resource.to_bytes()?);
        Ok(())
    }

    async fn delete_resource(
        &self,
        user: &str,
        domain: &str,
        resource: &str,
    ) -> Result<(), StorageError> {
        self.resources.remove(&resource_key(user, domain, resource));
        Ok(())
    }

    async fn fetch_resources(
        &self,
        user: &str,
        domain: &str,
    ) -> Result<Vec<Resource>, StorageError> {
        let prefix = format!("{}:{}:", user, domain);
        let mut out = Vec::new();
        for entry in self.resources.iter() {
            if entry.key().starts_with(&prefix) {
                out.push(Resource::from_bytes(entry.value())?);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl AllocationRegistry for MemoryStorage {
    async fn register_allocation(&self, allocation_id: &str) -> Result<(), StorageError> {
        let allocation = crate::model::Allocation {
            id: allocation_id.to_string(),
        };
        self.allocations
            .insert(allocation_id.to_string(), allocation.to_bytes()?);
        Ok(())
    }

    async fn unregister_allocation(&self, allocation_id: &str) -> Result<(), StorageError> {
        self.allocations.remove(allocation_id);

        // Cascade: drop every resource record and presence owned by it.
        let mut stale = Vec::new();
        for entry in self.resources.iter() {
            let record = Resource::from_bytes(entry.value())?;
            if record.allocation_id == allocation_id {
                stale.push(entry.key().clone());
            }
        }
        for key in stale {
            self.resources.remove(&key);
        }
        self.presences.retain(|_, value| value.0 != allocation_id);
        Ok(())
    }

    async fn fetch_allocations(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .allocations
            .iter()
            .map(|entry| entry.key().clone())
            .collect())
    }
}

#[async_trait]
impl PresenceStore for MemoryStorage {
    async fn upsert_presence(
        &self,
        jid: &FullJid,
        presence: &ExtPresence,
        allocation_id: &str,
    ) -> Result<(), StorageError> {
        self.presences.insert(
            jid.to_string(),
            (allocation_id.to_string(), presence.to_bytes()?),
        );
        Ok(())
    }

    async fn fetch_presence(&self, jid: &FullJid) -> Result<Option<ExtPresence>, StorageError> {
        match self.presences.get(&jid.to_string()) {
            Some(entry) => Ok(Some(ExtPresence::from_bytes(&entry.value().1)?)),
            None => Ok(None),
        }
    }

    async fn delete_presence(&self, jid: &FullJid) -> Result<(), StorageError> {
        self.presences.remove(&jid.to_string());
        Ok(())
    }
}

#[async_trait]
impl BlockListStore for MemoryStorage {
    async fn fetch_block_list_items(&self, user: &str) -> Result<Vec<Jid>, StorageError> {
        Ok(self
            .block_lists
            .get(user)
            .map(|items| items.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl UserStore for MemoryStorage {
    async fn user_exists(&self, user: &str) -> Result<bool, StorageError> {
        Ok(self.users.contains_key(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::presence::{Presence, Type as PresenceType};

    fn record(jid: &str, allocation_id: &str, priority: i8) -> Resource {
        Resource {
            allocation_id: allocation_id.to_string(),
            jid: jid.parse().unwrap(),
            priority,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_fetch_resources() {
        let storage = MemoryStorage::new();
        storage
            .upsert_resource(&record("romeo@huddle.chat/balcony", "a1", 5))
            .await
            .unwrap();
        storage
            .upsert_resource(&record("romeo@huddle.chat/orchard", "a2", 1))
            .await
            .unwrap();
        storage
            .upsert_resource(&record("juliet@huddle.chat/chamber", "a1", 0))
            .await
            .unwrap();

        let resources = storage.fetch_resources("romeo", "huddle.chat").await.unwrap();
        assert_eq!(resources.len(), 2);

        let resources = storage.fetch_resources("juliet", "huddle.chat").await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].allocation_id, "a1");
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing() {
        let storage = MemoryStorage::new();
        storage
            .upsert_resource(&record("romeo@huddle.chat/balcony", "a1", 5))
            .await
            .unwrap();
        storage
            .upsert_resource(&record("romeo@huddle.chat/balcony", "a1", 7))
            .await
            .unwrap();

        let resources = storage.fetch_resources("romeo", "huddle.chat").await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].priority, 7);
    }

    #[tokio::test]
    async fn test_delete_resource() {
        let storage = MemoryStorage::new();
        storage
            .upsert_resource(&record("romeo@huddle.chat/balcony", "a1", 5))
            .await
            .unwrap();
        storage
            .delete_resource("romeo", "huddle.chat", "balcony")
            .await
            .unwrap();

        let resources = storage.fetch_resources("romeo", "huddle.chat").await.unwrap();
        assert!(resources.is_empty());

        // Deleting again is a no-op.
        storage
            .delete_resource("romeo", "huddle.chat", "balcony")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unregister_allocation_cascades() {
        let storage = MemoryStorage::new();
        storage.register_allocation("a1").await.unwrap();
        storage.register_allocation("a2").await.unwrap();
        storage
            .upsert_resource(&record("romeo@huddle.chat/balcony", "a1", 5))
            .await
            .unwrap();
        storage
            .upsert_resource(&record("romeo@huddle.chat/orchard", "a2", 1))
            .await
            .unwrap();

        let jid: FullJid = "romeo@huddle.chat/balcony".parse().unwrap();
        storage
            .upsert_presence(
                &jid,
                &ExtPresence::new(Presence::new(PresenceType::None)),
                "a1",
            )
            .await
            .unwrap();

        storage.unregister_allocation("a1").await.unwrap();

        let allocations = storage.fetch_allocations().await.unwrap();
        assert_eq!(allocations, vec!["a2".to_string()]);

        let resources = storage.fetch_resources("romeo", "huddle.chat").await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].allocation_id, "a2");

        assert!(storage.fetch_presence(&jid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_block_list_and_users() {
        let storage = MemoryStorage::new();
        assert!(!storage.user_exists("romeo").await.unwrap());
        storage.add_user("romeo");
        assert!(storage.user_exists("romeo").await.unwrap());

        assert!(storage
            .fetch_block_list_items("romeo")
            .await
            .unwrap()
            .is_empty());
        storage.set_block_list("romeo", vec!["tybalt@huddle.chat".parse().unwrap()]);
        let items = storage.fetch_block_list_items("romeo").await.unwrap();
        assert_eq!(items.len(), 1);
    }
}
