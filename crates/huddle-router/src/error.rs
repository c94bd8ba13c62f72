//! Error types for the stanza routing core.

use thiserror::Error;

use crate::model::CodecError;
use crate::storage::StorageError;

/// Errors surfaced by routing, delivery, and cluster housekeeping.
///
/// Validation and addressing failures (`NoSuchAccount`, `Blocked`,
/// `NotAuthenticated`, `ResourceNotFound`) are terminal for a stanza: the
/// session layer is expected to bounce a protocol error to the sender rather
/// than retry. Transport failures are transient and may be retried or logged
/// by the caller.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Destination account does not exist.
    #[error("account does not exist")]
    NoSuchAccount,

    /// Destination JID is on the sender's block list.
    #[error("destination jid is blocked")]
    Blocked,

    /// Destination user has no live resource anywhere in the cluster.
    #[error("user is not authenticated")]
    NotAuthenticated,

    /// Full address named a resource that is not bound (or not available).
    #[error("resource not found")]
    ResourceNotFound,

    /// Remote node unreachable or returned a non-success status.
    #[error("remote delivery failed: {0}")]
    Transport(String),

    /// Short-circuited by the circuit breaker before attempting delivery.
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// The operation was canceled before completion.
    ///
    /// Not raised by the router itself; reserved for [`Cluster`] and
    /// [`RemoteRouter`] implementations whose backends observe shutdown
    /// mid-call (a coordination client losing its session, for example).
    ///
    /// [`Cluster`]: crate::cluster::Cluster
    /// [`RemoteRouter`]: crate::cluster::RemoteRouter
    #[error("operation canceled")]
    Canceled,

    /// The caller's deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Cluster lifecycle failure (election, join). Fatal at startup.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Stanza could not be serialized or parsed.
    #[error("malformed stanza: {0}")]
    MalformedStanza(String),

    /// Malformed JID in a stanza or wire parameter.
    #[error("malformed jid: {0}")]
    Jid(#[from] jid::Error),

    /// Directory or block-list store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Binary entity codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
