//! Local resource registry for in-process stanza delivery.
//!
//! This module tracks the endpoints bound on this node, keyed by
//! `(user, resource)`, and delivers stanzas to them through their outbound
//! channels.
//!
//! ```text
//! session (user1/res1) <-> ResourceRegistry <-> session (user2/res2)
//!        |                       |                      |
//!        v                       v                      v
//!  mpsc::Sender         DashMap<(user, resource),   mpsc::Sender
//!                            Arc<Endpoint>>
//! ```
//!
//! The registry is exclusively owned by its node: remote nodes never mutate
//! it, they reach it through the cluster delivery endpoint instead.

mod resource_registry;

pub use resource_registry::{DeliveryMode, Endpoint, ResourceRegistry, SendResult};
