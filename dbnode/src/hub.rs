//! Notification bus carrying controller topology
//!
//! The orchestrator learns about cluster topology from [`ApiDetails`]
//! messages and asks for them with a [`DetailsRequest`]. Subscribers receive
//! a bounded broadcast queue they own, so handling happens on the
//! subscriber's task rather than the publisher's.

use crate::error::{NodeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Topic for controller address snapshots
pub const DETAILS_TOPIC: &str = "apiserver.details";

/// Topic for requests to republish the controller address snapshot
pub const DETAILS_REQUEST_TOPIC: &str = "apiserver.details-request";

/// Addresses of one controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiServer {
    pub id: String,
    /// Address reachable by other controllers (host:port)
    pub internal_address: String,
}

/// Snapshot of every controller, keyed by controller id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDetails {
    pub servers: BTreeMap<String, ApiServer>,
}

impl ApiDetails {
    /// Build a snapshot from `(controller id, internal address)` pairs
    pub fn from_addresses<I, K, V>(addresses: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let servers = addresses
            .into_iter()
            .map(|(id, addr)| {
                let id = id.into();
                let server = ApiServer {
                    id: id.clone(),
                    internal_address: addr.into(),
                };
                (id, server)
            })
            .collect();
        Self { servers }
    }

    /// Internal address of a controller, if known and non-empty
    pub fn internal_address(&self, controller_id: &str) -> Option<&str> {
        self.servers
            .get(controller_id)
            .map(|s| s.internal_address.as_str())
            .filter(|addr| !addr.is_empty())
    }
}

/// Ask publishers to send the current [`ApiDetails`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsRequest {
    pub requester: String,
    /// Only publishers in this process should answer
    pub local_only: bool,
}

/// Message published on the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubMessage {
    ApiDetails(ApiDetails),
    DetailsRequest(DetailsRequest),
}

impl HubMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            HubMessage::ApiDetails(_) => DETAILS_TOPIC,
            HubMessage::DetailsRequest(_) => DETAILS_REQUEST_TOPIC,
        }
    }
}

/// Publish/subscribe bus
#[async_trait]
pub trait Hub: Send + Sync {
    /// Publish a message, returning the number of subscribers reached
    async fn publish(&self, message: HubMessage) -> Result<usize>;

    /// Subscribe to every message published after this call
    fn subscribe(&self) -> broadcast::Receiver<HubMessage>;
}

/// In-process hub backed by a broadcast channel
pub struct LocalHub {
    tx: broadcast::Sender<HubMessage>,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Hub for LocalHub {
    async fn publish(&self, message: HubMessage) -> Result<usize> {
        debug!(topic = message.topic(), "Publishing hub message");
        // No subscribers is not an error for a bus
        Ok(self.tx.send(message).unwrap_or(0))
    }

    fn subscribe(&self) -> broadcast::Receiver<HubMessage> {
        self.tx.subscribe()
    }
}

/// Answer every [`DetailsRequest`] on `hub` with `details`.
///
/// Stands in for the API server publisher when a node runs on its own.
pub fn spawn_details_responder<H>(
    hub: std::sync::Arc<H>,
    details: ApiDetails,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<Result<()>>
where
    H: Hub + ?Sized + 'static,
{
    let mut rx = hub.subscribe();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                message = rx.recv() => message,
            };

            match message {
                Ok(HubMessage::DetailsRequest(req)) => {
                    debug!(requester = %req.requester, "Answering details request");
                    hub.publish(HubMessage::ApiDetails(details.clone())).await?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Details responder lagged behind the hub");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(NodeError::Internal("hub closed".to_string()));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_internal_address_lookup() {
        let details = ApiDetails::from_addresses([("0", "10.0.0.5:17070"), ("1", "")]);
        assert_eq!(details.internal_address("0"), Some("10.0.0.5:17070"));
        assert_eq!(details.internal_address("1"), None);
        assert_eq!(details.internal_address("2"), None);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = LocalHub::default();
        let reached = hub
            .publish(HubMessage::ApiDetails(ApiDetails::default()))
            .await
            .unwrap();
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn test_responder_answers_requests() {
        let hub = Arc::new(LocalHub::default());
        let details = ApiDetails::from_addresses([("0", "10.0.0.5:17070")]);
        let shutdown = CancellationToken::new();
        let responder = spawn_details_responder(hub.clone(), details.clone(), shutdown.clone());

        let mut rx = hub.subscribe();
        hub.publish(HubMessage::DetailsRequest(DetailsRequest {
            requester: "test".to_string(),
            local_only: true,
        }))
        .await
        .unwrap();

        // Our own request comes back first, then the answer
        assert!(matches!(rx.recv().await.unwrap(), HubMessage::DetailsRequest(_)));
        assert_eq!(rx.recv().await.unwrap(), HubMessage::ApiDetails(details));

        shutdown.cancel();
        responder.await.unwrap().unwrap();
    }
}
