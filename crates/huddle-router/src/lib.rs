//! Clustered XMPP stanza routing core.
//!
//! This crate routes c2s stanzas across a cluster of server nodes. Each
//! node (an *allocation*) keeps its connected resources in an in-process
//! [`registry::ResourceRegistry`] and publishes them to a shared resource
//! directory; the [`router::StanzaRouter`] resolves destination addresses
//! against the directory and delivers locally or over HTTP to the owning
//! allocation.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use huddle_router::router::{RouterConfig, RouterStores, StanzaRouter};
//! use huddle_router::storage::MemoryStorage;
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let router = StanzaRouter::local(
//!     RouterConfig::new("example.org"),
//!     RouterStores::in_memory(storage),
//! );
//! # let _ = router;
//! ```

pub mod cluster;
pub mod model;
pub mod registry;
pub mod router;
pub mod storage;

mod error;
mod types;

pub use error::RoutingError;
pub use router::{C2sRouter, RouterConfig, RouterStores, StanzaRouter};
pub use types::{jid_matches, Stanza, Validations};
