//! Remote stanza delivery to peer allocations.
//!
//! One request per (destination node, stanza): the stanza is serialized
//! once and sent with the full list of target addresses, so a multi-resource
//! fan-out to the same node costs a single round trip.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jid::Jid;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use super::breaker::{BreakerConfig, CircuitBreaker};
use super::Cluster;
use crate::registry::DeliveryMode;
use crate::types::Stanza;
use crate::RoutingError;

/// Delivers a stanza to resources owned by another cluster node.
#[async_trait]
pub trait RemoteRouter: Send + Sync {
    /// Deliver `stanza` to the given full addresses on allocation
    /// `allocation_id`. The mode is carried to the receiving node so it
    /// applies the same stale-record semantics as local delivery.
    async fn route(
        &self,
        stanza: &Stanza,
        to: &[Jid],
        allocation_id: &str,
        mode: DeliveryMode,
    ) -> Result<(), RoutingError>;
}

/// HTTP transport for remote delivery, wrapped by a circuit breaker.
pub struct HttpRemoteRouter {
    http: reqwest::Client,
    breaker: Mutex<CircuitBreaker>,
    cluster: Arc<dyn Cluster>,
}

impl HttpRemoteRouter {
    /// Create a remote router over the given membership view.
    pub fn new(
        cluster: Arc<dyn Cluster>,
        request_timeout: Duration,
        breaker: BreakerConfig,
    ) -> Result<Self, RoutingError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RoutingError::Transport(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            breaker: Mutex::new(CircuitBreaker::new(breaker)),
            cluster,
        })
    }

    fn check_breaker(&self) -> bool {
        self.breaker.lock().unwrap().allow_request()
    }

    fn record_success(&self) {
        self.breaker.lock().unwrap().record_success();
    }

    fn record_failure(&self) {
        self.breaker.lock().unwrap().record_failure();
    }
}

#[async_trait]
impl RemoteRouter for HttpRemoteRouter {
    async fn route(
        &self,
        stanza: &Stanza,
        to: &[Jid],
        allocation_id: &str,
        mode: DeliveryMode,
    ) -> Result<(), RoutingError> {
        let member = match self.cluster.member(allocation_id) {
            Some(member) => member,
            None => {
                // The owning node left the cluster; housekeeping will
                // reconcile its directory records. Retrying cannot help,
                // so this is not a delivery error.
                warn!(allocation_id, "Allocation not found in membership view");
                return Ok(());
            }
        };

        if !self.check_breaker() {
            debug!(allocation_id, "Circuit breaker open, short-circuiting delivery");
            return Err(RoutingError::BreakerOpen);
        }

        let body = stanza.to_xml()?;
        let to_param = to
            .iter()
            .map(|jid| jid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("http://{}:{}/route", member.host, member.port);

        match self
            .http
            .post(&url)
            .query(&[("to", to_param.as_str()), ("mode", mode.as_str())])
            .header(CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                self.record_success();
                debug!(allocation_id, to = %to_param, "Stanza delivered to remote allocation");
                Ok(())
            }
            // 404 is an addressing outcome, not a peer failure: the peer is
            // healthy but holds no matching resource for a targeted address.
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                self.record_success();
                Err(RoutingError::ResourceNotFound)
            }
            Ok(resp) => {
                self.record_failure();
                Err(RoutingError::Transport(format!(
                    "response status code: {}",
                    resp.status().as_u16()
                )))
            }
            Err(e) => {
                self.record_failure();
                if e.is_timeout() {
                    Err(RoutingError::DeadlineExceeded)
                } else {
                    Err(RoutingError::Transport(e.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticCluster;
    use xmpp_parsers::message::Message;

    fn test_stanza() -> Stanza {
        Stanza::Message(Message::new(Some("romeo@huddle.chat".parse().unwrap())))
    }

    #[tokio::test]
    async fn test_unknown_allocation_is_noop_success() {
        let cluster = Arc::new(StaticCluster::new("a1"));
        let remote =
            HttpRemoteRouter::new(cluster, Duration::from_secs(1), BreakerConfig::default())
                .unwrap();

        let to: Vec<Jid> = vec!["romeo@huddle.chat/balcony".parse().unwrap()];
        remote
            .route(&test_stanza(), &to, "gone", DeliveryMode::Broadcast)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let cluster = Arc::new(StaticCluster::new("a1"));
        cluster.add_member("a2", "203.0.113.1", 9);

        let remote = HttpRemoteRouter::new(
            cluster,
            Duration::from_secs(1),
            BreakerConfig {
                threshold: 1,
                cooldown: Duration::from_secs(600),
            },
        )
        .unwrap();
        remote.breaker.lock().unwrap().record_failure();

        let to: Vec<Jid> = vec!["romeo@huddle.chat/balcony".parse().unwrap()];
        let err = remote
            .route(&test_stanza(), &to, "a2", DeliveryMode::Targeted)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::BreakerOpen));
    }
}
