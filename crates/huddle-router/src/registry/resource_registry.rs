//! Resource registry implementation.
//!
//! Tracks locally-bound endpoints for stanza delivery.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::{FullJid, Jid};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::types::Stanza;
use crate::RoutingError;

/// A live, bound resource on this node.
///
/// Owns the outbound channel to the underlying session plus the presence
/// state the registry consults when deciding availability.
#[derive(Debug)]
pub struct Endpoint {
    jid: FullJid,
    sender: mpsc::Sender<Stanza>,
    /// Whether this resource is currently available (presence type != unavailable).
    available: AtomicBool,
    /// Last advertised priority for this resource (-128..127).
    priority: AtomicI8,
}

impl Endpoint {
    /// Create an endpoint for a freshly-bound session.
    ///
    /// Endpoints start unavailable with priority 0 until initial presence
    /// is received.
    pub fn new(jid: FullJid, sender: mpsc::Sender<Stanza>) -> Self {
        Self {
            jid,
            sender,
            available: AtomicBool::new(false),
            priority: AtomicI8::new(0),
        }
    }

    /// Full address of this endpoint.
    pub fn jid(&self) -> &FullJid {
        &self.jid
    }

    /// Local part of the address.
    pub fn user(&self) -> &str {
        self.jid.node().map(|n| n.as_str()).unwrap_or_default()
    }

    /// Resource name of the address.
    pub fn resource(&self) -> &str {
        self.jid.resource().as_str()
    }

    /// Whether this resource is currently available.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Last advertised presence priority.
    pub fn priority(&self) -> i8 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Update presence-derived state.
    pub fn set_presence(&self, available: bool, priority: i8) {
        self.available.store(available, Ordering::Relaxed);
        self.priority.store(priority, Ordering::Relaxed);
    }

    fn send(&self, stanza: Stanza) -> SendResult {
        match self.sender.try_send(stanza) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendResult::ChannelFull,
            Err(mpsc::error::TrySendError::Closed(_)) => SendResult::ChannelClosed,
        }
    }
}

/// How the destination of a delivery was addressed.
///
/// The distinction matters for full addresses: an exact delivery to a
/// resource that is not bound or not available is an addressing error,
/// while the same resource reached as one record of a bare-address fan-out
/// is simply skipped (the record is stale or the resource went away; the
/// rest of the fan-out must not be affected).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The sender named this exact full address.
    Targeted,
    /// The address is one record of a bare-address fan-out.
    Broadcast,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Targeted
    }
}

impl DeliveryMode {
    /// Wire parameter value for the cluster delivery endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Targeted => "targeted",
            DeliveryMode::Broadcast => "broadcast",
        }
    }
}

/// Result of handing a stanza to an endpoint's channel.
#[derive(Debug)]
pub enum SendResult {
    /// Stanza was queued for delivery.
    Sent,
    /// The channel to the session is full (backpressure).
    ChannelFull,
    /// The channel to the session is closed.
    ChannelClosed,
}

/// Registry of the endpoints bound on this node.
///
/// All operations are safe under concurrent bind/unbind/lookup from
/// multiple sessions; reads never block each other.
pub struct ResourceRegistry {
    endpoints: DashMap<(String, String), Arc<Endpoint>>,
}

impl ResourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
        }
    }

    /// Bind an endpoint.
    ///
    /// Idempotent per `(user, resource)`: if that resource is already bound
    /// the existing endpoint is kept and returned (first binder wins), so at
    /// most one live endpoint exists per resource.
    #[instrument(skip(self, endpoint), fields(jid = %endpoint.jid()))]
    pub fn bind(&self, endpoint: Endpoint) -> Arc<Endpoint> {
        let key = (endpoint.user().to_string(), endpoint.resource().to_string());
        match self.endpoints.entry(key) {
            Entry::Occupied(existing) => {
                debug!("Resource already bound, keeping existing endpoint");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                debug!("Bound new endpoint");
                let endpoint = Arc::new(endpoint);
                slot.insert(endpoint.clone());
                endpoint
            }
        }
    }

    /// Unbind a resource. No-op if it was not bound.
    #[instrument(skip(self))]
    pub fn unbind(&self, user: &str, resource: &str) -> Option<Arc<Endpoint>> {
        let removed = self
            .endpoints
            .remove(&(user.to_string(), resource.to_string()));
        if removed.is_some() {
            debug!("Unbound endpoint");
        } else {
            debug!("Resource was not bound");
        }
        removed.map(|(_, endpoint)| endpoint)
    }

    /// Look up the endpoint bound for `(user, resource)`.
    pub fn lookup(&self, user: &str, resource: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .get(&(user.to_string(), resource.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// All endpoints bound for a user.
    pub fn endpoints_for_user(&self, user: &str) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .filter(|entry| entry.key().0 == user)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Update presence-derived state for a bound resource.
    ///
    /// Returns true if the resource was found and updated.
    pub fn update_presence(&self, user: &str, resource: &str, available: bool, priority: i8) -> bool {
        match self.lookup(user, resource) {
            Some(endpoint) => {
                endpoint.set_presence(available, priority);
                true
            }
            None => false,
        }
    }

    /// Number of bound endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Deliver a stanza to a local address.
    ///
    /// A targeted full address names exactly the matching resource: if it
    /// is not bound or not available the delivery fails with
    /// `ResourceNotFound`. A full address reached in broadcast mode skips
    /// such a resource instead, so one stale fan-out record cannot fail its
    /// siblings. A bare address broadcasts to every available resource for
    /// the user; reaching nobody is not an error at this layer.
    #[instrument(skip(self, stanza), fields(stanza = stanza.name(), to = %to))]
    pub fn deliver_to_address(
        &self,
        stanza: &Stanza,
        to: &Jid,
        mode: DeliveryMode,
    ) -> Result<(), RoutingError> {
        let user = to.node().map(|n| n.as_str()).unwrap_or_default();
        match to.resource() {
            Some(resource) => {
                let endpoint = self
                    .lookup(user, resource.as_str())
                    .filter(|endpoint| endpoint.is_available());
                match (endpoint, mode) {
                    (Some(endpoint), _) => {
                        self.send_to(&endpoint, stanza.clone());
                        Ok(())
                    }
                    (None, DeliveryMode::Targeted) => Err(RoutingError::ResourceNotFound),
                    (None, DeliveryMode::Broadcast) => {
                        debug!("Skipping unavailable resource in fan-out");
                        Ok(())
                    }
                }
            }
            None => {
                for endpoint in self.endpoints_for_user(user) {
                    if !endpoint.is_available() {
                        continue;
                    }
                    self.send_to(&endpoint, stanza.clone());
                }
                Ok(())
            }
        }
    }

    /// Hand a stanza to an endpoint's channel, logging undeliverable ones.
    ///
    /// Stanza delivery is at-most-once; channel-level failures are dropped
    /// here rather than surfaced as routing errors.
    fn send_to(&self, endpoint: &Endpoint, stanza: Stanza) {
        match endpoint.send(stanza) {
            SendResult::Sent => {
                debug!(to = %endpoint.jid(), "Stanza queued for delivery");
            }
            SendResult::ChannelFull => {
                warn!(to = %endpoint.jid(), "Outbound channel full, stanza dropped");
            }
            SendResult::ChannelClosed => {
                debug!(to = %endpoint.jid(), "Outbound channel closed, unbinding stale endpoint");
                self.unbind(endpoint.user(), endpoint.resource());
            }
        }
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("endpoint_count", &self.endpoints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::message::Message;
    use xmpp_parsers::presence::{Presence, Type as PresenceType};

    fn endpoint(jid: &str) -> (Endpoint, mpsc::Receiver<Stanza>) {
        let (tx, rx) = mpsc::channel(16);
        (Endpoint::new(jid.parse().unwrap(), tx), rx)
    }

    fn message_to(to: &str) -> Stanza {
        Stanza::Message(Message::new(Some(to.parse().unwrap())))
    }

    fn presence_to(to: &str) -> Stanza {
        let mut presence = Presence::new(PresenceType::None);
        presence.to = Some(to.parse().unwrap());
        Stanza::Presence(presence)
    }

    #[test]
    fn test_bind_and_lookup_until_unbind() {
        let registry = ResourceRegistry::new();
        let (ep, _rx) = endpoint("romeo@huddle.chat/balcony");
        registry.bind(ep);

        assert!(registry.lookup("romeo", "balcony").is_some());
        assert_eq!(registry.endpoint_count(), 1);

        registry.unbind("romeo", "balcony");
        assert!(registry.lookup("romeo", "balcony").is_none());
        assert_eq!(registry.endpoint_count(), 0);
    }

    #[test]
    fn test_bind_is_idempotent_first_wins() {
        let registry = ResourceRegistry::new();
        let (first, mut rx1) = endpoint("romeo@huddle.chat/balcony");
        let (second, _rx2) = endpoint("romeo@huddle.chat/balcony");

        registry.bind(first);
        let live = registry.bind(second);
        assert_eq!(registry.endpoint_count(), 1);

        // The surviving endpoint is the first one: sending through the
        // registry reaches the first channel.
        live.set_presence(true, 0);
        registry
            .deliver_to_address(
                &message_to("romeo@huddle.chat/balcony"),
                &"romeo@huddle.chat/balcony".parse().unwrap(),
                DeliveryMode::Targeted,
            )
            .unwrap();
        assert!(rx1.try_recv().is_ok());
    }

    #[test]
    fn test_unbind_missing_is_noop() {
        let registry = ResourceRegistry::new();
        assert!(registry.unbind("romeo", "balcony").is_none());
    }

    #[test]
    fn test_deliver_full_address_requires_available() {
        let registry = ResourceRegistry::new();
        let (ep, mut rx) = endpoint("romeo@huddle.chat/balcony");
        registry.bind(ep);

        let to: Jid = "romeo@huddle.chat/balcony".parse().unwrap();

        // Unavailable until initial presence: full-address delivery fails.
        let err = registry
            .deliver_to_address(&message_to("romeo@huddle.chat/balcony"), &to, DeliveryMode::Targeted)
            .unwrap_err();
        assert!(matches!(err, RoutingError::ResourceNotFound));

        registry.update_presence("romeo", "balcony", true, 0);
        registry
            .deliver_to_address(&message_to("romeo@huddle.chat/balcony"), &to, DeliveryMode::Targeted)
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_mode_skips_unavailable_full_address() {
        let registry = ResourceRegistry::new();
        let (ep, mut rx) = endpoint("romeo@huddle.chat/balcony");
        registry.bind(ep);
        // Bound but never sent initial presence: a fan-out record for it is
        // skipped without error.
        let to: Jid = "romeo@huddle.chat/balcony".parse().unwrap();
        registry
            .deliver_to_address(
                &message_to("romeo@huddle.chat/balcony"),
                &to,
                DeliveryMode::Broadcast,
            )
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_mode_skips_unbound_full_address() {
        let registry = ResourceRegistry::new();
        let to: Jid = "romeo@huddle.chat/nowhere".parse().unwrap();
        registry
            .deliver_to_address(
                &message_to("romeo@huddle.chat/nowhere"),
                &to,
                DeliveryMode::Broadcast,
            )
            .unwrap();
    }

    #[test]
    fn test_deliver_full_address_unbound_resource() {
        let registry = ResourceRegistry::new();
        let to: Jid = "romeo@huddle.chat/nowhere".parse().unwrap();
        let err = registry
            .deliver_to_address(&message_to("romeo@huddle.chat/nowhere"), &to, DeliveryMode::Targeted)
            .unwrap_err();
        assert!(matches!(err, RoutingError::ResourceNotFound));
    }

    #[test]
    fn test_bare_broadcast_reaches_available_only() {
        let registry = ResourceRegistry::new();
        let (e1, mut rx1) = endpoint("romeo@huddle.chat/balcony");
        let (e2, mut rx2) = endpoint("romeo@huddle.chat/orchard");
        let (e3, mut rx3) = endpoint("romeo@huddle.chat/crypt");
        registry.bind(e1);
        registry.bind(e2);
        registry.bind(e3);

        registry.update_presence("romeo", "balcony", true, 1);
        registry.update_presence("romeo", "orchard", true, 8);
        registry.update_presence("romeo", "crypt", false, -1);

        let to: Jid = "romeo@huddle.chat".parse().unwrap();
        registry
            .deliver_to_address(&presence_to("romeo@huddle.chat"), &to, DeliveryMode::Broadcast)
            .unwrap();

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn test_bare_broadcast_to_nobody_succeeds() {
        let registry = ResourceRegistry::new();
        let to: Jid = "ghost@huddle.chat".parse().unwrap();
        registry
            .deliver_to_address(&presence_to("ghost@huddle.chat"), &to, DeliveryMode::Broadcast)
            .unwrap();
    }

    #[test]
    fn test_closed_channel_unbinds_stale_endpoint() {
        let registry = ResourceRegistry::new();
        let (ep, rx) = endpoint("romeo@huddle.chat/balcony");
        registry.bind(ep);
        registry.update_presence("romeo", "balcony", true, 0);
        drop(rx);

        let to: Jid = "romeo@huddle.chat".parse().unwrap();
        registry
            .deliver_to_address(&message_to("romeo@huddle.chat"), &to, DeliveryMode::Broadcast)
            .unwrap();
        assert_eq!(registry.endpoint_count(), 0);
    }

    #[test]
    fn test_update_presence_missing_resource_returns_false() {
        let registry = ResourceRegistry::new();
        assert!(!registry.update_presence("ghost", "nowhere", true, 1));
    }

    #[test]
    fn test_endpoints_for_user() {
        let registry = ResourceRegistry::new();
        let (e1, _r1) = endpoint("romeo@huddle.chat/balcony");
        let (e2, _r2) = endpoint("romeo@huddle.chat/orchard");
        let (e3, _r3) = endpoint("juliet@huddle.chat/chamber");
        registry.bind(e1);
        registry.bind(e2);
        registry.bind(e3);

        assert_eq!(registry.endpoints_for_user("romeo").len(), 2);
        assert_eq!(registry.endpoints_for_user("juliet").len(), 1);
        assert!(registry.endpoints_for_user("ghost").is_empty());
    }
}
