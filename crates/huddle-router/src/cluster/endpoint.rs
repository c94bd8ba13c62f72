//! Inbound cluster delivery endpoint.
//!
//! The serving half of the remote delivery wire format: peers POST a
//! serialized stanza to `/route?to=<comma-joined addresses>&mode=<targeted|broadcast>`
//! and this node hands it to its local resource registry with the sender's
//! delivery mode, so stale broadcast records are skipped here exactly as
//! they are skipped locally. Any 2xx status is success from the sender's
//! perspective.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use jid::Jid;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::registry::{DeliveryMode, ResourceRegistry};
use crate::types::Stanza;
use crate::RoutingError;

#[derive(Debug, Deserialize)]
struct RouteParams {
    to: String,
    /// How the sender addressed these JIDs; absent means targeted.
    #[serde(default)]
    mode: DeliveryMode,
}

/// Build the axum router serving the cluster delivery endpoint.
pub fn cluster_endpoint(registry: Arc<ResourceRegistry>) -> Router {
    Router::new()
        .route("/route", post(route_handler))
        .with_state(registry)
}

async fn route_handler(
    State(registry): State<Arc<ResourceRegistry>>,
    Query(params): Query<RouteParams>,
    body: String,
) -> StatusCode {
    let stanza = match Stanza::from_xml(&body) {
        Ok(stanza) => stanza,
        Err(e) => {
            warn!(error = %e, "Rejected malformed stanza body");
            return StatusCode::BAD_REQUEST;
        }
    };

    let mut not_found = false;
    for part in params.to.split(',').filter(|s| !s.is_empty()) {
        let jid: Jid = match part.parse() {
            Ok(jid) => jid,
            Err(e) => {
                warn!(to = part, error = %e, "Rejected malformed destination address");
                return StatusCode::BAD_REQUEST;
            }
        };
        match registry.deliver_to_address(&stanza, &jid, params.mode) {
            Ok(()) => {
                debug!(to = %jid, stanza = stanza.name(), "Delivered inbound cluster stanza");
            }
            Err(RoutingError::ResourceNotFound) => {
                // The record the sender routed on is already stale.
                debug!(to = %jid, "Inbound cluster stanza for unbound resource");
                not_found = true;
            }
            Err(e) => {
                warn!(to = %jid, error = %e, "Inbound cluster delivery failed");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }

    if not_found {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Endpoint;
    use tokio::sync::mpsc;
    use xmpp_parsers::message::Message;

    fn bound_registry() -> (Arc<ResourceRegistry>, mpsc::Receiver<Stanza>) {
        let registry = Arc::new(ResourceRegistry::new());
        let (tx, rx) = mpsc::channel(16);
        registry.bind(Endpoint::new("romeo@huddle.chat/balcony".parse().unwrap(), tx));
        registry.update_presence("romeo", "balcony", true, 0);
        (registry, rx)
    }

    fn message_xml(to: &str) -> String {
        Stanza::Message(Message::new(Some(to.parse().unwrap())))
            .to_xml()
            .unwrap()
    }

    #[tokio::test]
    async fn test_inbound_delivery() {
        let (registry, mut rx) = bound_registry();
        let status = route_handler(
            State(registry),
            Query(RouteParams {
                to: "romeo@huddle.chat/balcony".to_string(),
                mode: DeliveryMode::Targeted,
            }),
            message_xml("romeo@huddle.chat/balcony"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (registry, _rx) = bound_registry();
        let status = route_handler(
            State(registry),
            Query(RouteParams {
                to: "romeo@huddle.chat/balcony".to_string(),
                mode: DeliveryMode::Targeted,
            }),
            "<not-xml".to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_broadcast_mode_tolerates_stale_records() {
        let (registry, mut rx) = bound_registry();
        // The sender's directory still lists a resource that is gone here;
        // the live sibling must still be served.
        let status = route_handler(
            State(registry),
            Query(RouteParams {
                to: "romeo@huddle.chat/balcony,romeo@huddle.chat/ghost".to_string(),
                mode: DeliveryMode::Broadcast,
            }),
            message_xml("romeo@huddle.chat"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unbound_resource_is_not_found() {
        let (registry, _rx) = bound_registry();
        let status = route_handler(
            State(registry),
            Query(RouteParams {
                to: "romeo@huddle.chat/nowhere".to_string(),
                mode: DeliveryMode::Targeted,
            }),
            message_xml("romeo@huddle.chat/nowhere"),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
