//! JSON payloads carried on the pub/sub topics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ClientId, NodeId, RequestId, ResourceRef};

/// A client's request to reserve one or more resources, published on the
/// target node's request topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequest {
    /// Correlation key; generated by the client when left empty.
    #[serde(default = "RequestId::generate")]
    pub request_id: RequestId,
    pub client_id: ClientId,
    /// The node expected to coordinate the request.
    pub target_node_id: NodeId,
    /// Legs in evaluation order.
    pub resource_refs: Vec<ResourceRef>,
    /// Requester data (vehicle attributes and the like), opaque to coordination.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Overall status reported to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Every leg was reserved and committed.
    Reserved,
    /// At least one leg could not be reserved; nothing is held.
    Unavailable,
    /// The request was malformed or could not be processed.
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Reserved => "reserved",
            ResponseStatus::Unavailable => "unavailable",
            ResponseStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer published on `responses/<client_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationResponse {
    pub request_id: RequestId,
    pub status: ResponseStatus,
    /// Leg-by-leg availability as observed by the saga, keyed by
    /// [`ResourceRef::key`] so equal resource IDs on different nodes stay apart.
    #[serde(default)]
    pub availability_map: BTreeMap<String, bool>,
    #[serde(default)]
    pub message: String,
}

impl ReservationResponse {
    /// Builds an error response for a request that never reached the saga.
    pub fn error(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Error,
            availability_map: BTreeMap::new(),
            message: message.into(),
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.status == ResponseStatus::Reserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_without_id_gets_one_generated() {
        let json = serde_json::json!({
            "client_id": "car-42",
            "target_node_id": "node-1",
            "resource_refs": [{"node_id": "node-1", "resource_id": "R1"}]
        });
        let req: ReservationRequest = serde_json::from_value(json).unwrap();
        assert!(!req.request_id.is_blank());
        assert_eq!(req.payload, serde_json::Value::Null);
        assert_eq!(req.resource_refs[0], ResourceRef::new("node-1", "R1"));
    }

    #[test]
    fn response_status_is_snake_case_on_the_wire() {
        let resp = ReservationResponse {
            request_id: RequestId::new("abc"),
            status: ResponseStatus::Unavailable,
            availability_map: BTreeMap::from([(ResourceRef::new("node-1", "R1").key(), false)]),
            message: "R1 is taken".to_string(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["availability_map"]["node-1/R1"], false);
    }

    #[test]
    fn error_response_has_empty_map() {
        let resp = ReservationResponse::error(RequestId::new("x"), "bad payload");
        assert_eq!(resp.status, ResponseStatus::Error);
        assert!(resp.availability_map.is_empty());
        assert!(!resp.is_reserved());
    }
}
