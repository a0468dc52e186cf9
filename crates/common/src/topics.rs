//! Conventional topic names shared by nodes and clients.

use crate::types::{ClientId, NodeId, ResourceId};

/// Topic a node listens on for reservation requests it coordinates.
pub fn request_topic(node_id: &NodeId) -> String {
    format!("nodes/{node_id}/reservations/request")
}

/// Filter matching the request topic of every node.
pub const ALL_REQUEST_TOPICS: &str = "nodes/+/reservations/request";

/// Per-client topic carrying reservation responses.
pub fn response_topic(client_id: &ClientId) -> String {
    format!("responses/{client_id}")
}

/// Topic announcing availability changes of a resource.
pub fn resource_status_topic(node_id: &NodeId, resource_id: &ResourceId) -> String {
    format!("nodes/{node_id}/resources/{resource_id}/status")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        assert_eq!(
            request_topic(&NodeId::new("node-2")),
            "nodes/node-2/reservations/request"
        );
        assert_eq!(response_topic(&ClientId::new("car-1")), "responses/car-1");
        assert_eq!(
            resource_status_topic(&NodeId::new("n"), &ResourceId::new("R1")),
            "nodes/n/resources/R1/status"
        );
    }
}
