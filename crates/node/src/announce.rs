//! Resource status announcements on the pub/sub bus.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::topics::resource_status_topic;
use common::{NodeId, ResourceId};
use resource_store::Resource;
use serde::{Deserialize, Serialize};
use transport::{Message, Publish};

/// Payload published on `nodes/<node>/resources/<id>/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub node_id: NodeId,
    pub resource_id: ResourceId,
    pub available: bool,
    pub under_maintenance: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&Resource> for ResourceStatus {
    fn from(resource: &Resource) -> Self {
        Self {
            node_id: resource.owner_node_id.clone(),
            resource_id: resource.id.clone(),
            available: resource.available,
            under_maintenance: resource.under_maintenance,
            updated_at: resource.updated_at,
        }
    }
}

/// Publishes availability changes made through this node.
///
/// Announcements are best effort: a failed publish is logged and never
/// fails the operation that caused it.
#[derive(Clone)]
pub struct StatusAnnouncer {
    node_id: NodeId,
    publisher: Option<Arc<dyn Publish>>,
}

impl StatusAnnouncer {
    pub fn new(node_id: NodeId, publisher: Arc<dyn Publish>) -> Self {
        Self {
            node_id,
            publisher: Some(publisher),
        }
    }

    /// An announcer that publishes nothing.
    pub fn disabled(node_id: NodeId) -> Self {
        Self {
            node_id,
            publisher: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.publisher.is_some()
    }

    pub async fn announce(&self, resource: &Resource) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        let topic = resource_status_topic(&self.node_id, &resource.id);
        let message = match Message::json(topic, &ResourceStatus::from(resource)) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(resource_id = %resource.id, error = %e, "Could not encode status");
                return;
            }
        };

        if let Err(e) = publisher.publish(message).await {
            metrics::counter!("node_status_announce_failures_total").increment(1);
            tracing::debug!(resource_id = %resource.id, error = %e, "Status not announced");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<Message>>);

    #[async_trait]
    impl Publish for Capture {
        async fn publish(&self, message: Message) -> transport::Result<()> {
            self.0.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn announces_on_resource_topic() {
        let capture = Arc::new(Capture::default());
        let announcer = StatusAnnouncer::new(NodeId::from("node-1"), capture.clone());

        let resource = Resource::new("R1", "Central", "Main St", "node-1").unavailable();
        announcer.announce(&resource).await;

        let sent = capture.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "nodes/node-1/resources/R1/status");
        let status: ResourceStatus = sent[0].decode().unwrap();
        assert!(!status.available);
        assert_eq!(status.resource_id, ResourceId::from("R1"));
    }

    #[tokio::test]
    async fn disabled_announcer_is_silent() {
        let announcer = StatusAnnouncer::disabled(NodeId::from("node-1"));
        assert!(!announcer.is_enabled());
        announcer
            .announce(&Resource::new("R1", "x", "y", "node-1"))
            .await;
    }
}
