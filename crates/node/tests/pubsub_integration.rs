//! Reservation requests arriving over pub/sub, end to end through an
//! in-process broker.

use std::sync::Arc;
use std::time::Duration;

use common::topics::request_topic;
use common::{ClientId, NodeId, ReservationResponse, ResourceId, ResourceRef, ResponseStatus};
use correlator::{CorrelatorConfig, ReservationClient};
use node::AppState;
use node::announce::ResourceStatus;
use resource_store::{InMemoryResourceStore, Resource, ResourceStore};
use saga::{InMemoryPeerClient, SagaConfig};
use tokio::sync::mpsc;
use transport::{InMemoryBroker, Message, TopicFilter, TransportAdapter, TransportConfig};

const WAIT: Duration = Duration::from_secs(5);

fn config(client_id: &str, filters: &[&str]) -> TransportConfig {
    let mut config = TransportConfig::new(client_id);
    config.initial_backoff = Duration::from_millis(10);
    for f in filters {
        config = config.subscribe(TopicFilter::parse(f).unwrap());
    }
    config
}

async fn recv(rx: &mut mpsc::Receiver<Message>) -> Message {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("inbound closed")
}

struct Harness {
    broker: InMemoryBroker,
    store: InMemoryResourceStore,
    node: TransportAdapter,
}

/// Starts node-1 on the broker with a peer node-2 owning R2.
async fn start_node() -> Harness {
    let broker = InMemoryBroker::new();
    let store = InMemoryResourceStore::seeded([
        Resource::new("R1", "Central", "Main St", "node-1"),
        Resource::new("R1b", "Central B", "Main St", "node-1"),
    ])
    .await
    .unwrap();
    let peer_store =
        InMemoryResourceStore::seeded([Resource::new("R2", "North", "Hill Rd", "node-2")])
            .await
            .unwrap();
    let peers = InMemoryPeerClient::default();
    peers.add_peer("node-2", Arc::new(peer_store)).await;

    let node_id = NodeId::from("node-1");
    let (transport, inbound) = TransportAdapter::start(
        broker.clone(),
        config("node-1", &[&request_topic(&node_id)]),
    );
    transport.wait_connected(WAIT).await.unwrap();

    let state = Arc::new(
        AppState::new(
            SagaConfig::new(node_id),
            Arc::new(store.clone()),
            Arc::new(peers),
        )
        .with_transport(transport.clone()),
    );
    let dispatcher = node::request_dispatcher(state, Arc::new(transport.clone())).unwrap();
    tokio::spawn(dispatcher.run(inbound));

    Harness {
        broker,
        store,
        node: transport,
    }
}

async fn client(broker: &InMemoryBroker, id: &str) -> ReservationClient {
    ReservationClient::connect(
        broker.clone(),
        ClientId::from(id),
        CorrelatorConfig::default(),
        WAIT,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_request_over_pubsub_is_answered() {
    let h = start_node().await;
    let car = client(&h.broker, "car-1").await;

    let response = car
        .reserve(
            NodeId::from("node-1"),
            vec![ResourceRef::new("node-1", "R1"), ResourceRef::new("node-2", "R2")],
            serde_json::json!({"battery_kwh": 60}),
        )
        .await
        .unwrap();
    assert!(response.is_reserved());
    assert_eq!(response.availability_map.len(), 2);

    let again = car
        .reserve(
            NodeId::from("node-1"),
            vec![ResourceRef::new("node-1", "R1")],
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(again.status, ResponseStatus::Unavailable);
    assert!(!again.availability_map["node-1/R1"]);
    assert_eq!(car.pending_count(), 0);

    let stored = h.store.get_resource(&ResourceId::from("R1")).await.unwrap().unwrap();
    assert!(!stored.available);
    h.node.shutdown();
}

#[tokio::test]
async fn test_concurrent_clients_get_their_own_answers() {
    let h = start_node().await;
    let a = client(&h.broker, "car-a").await;
    let b = client(&h.broker, "car-b").await;

    let node = NodeId::from("node-1");
    let (ra, rb) = tokio::join!(
        a.reserve(node.clone(), vec![ResourceRef::new("node-1", "R1")], serde_json::Value::Null),
        b.reserve(node.clone(), vec![ResourceRef::new("node-1", "R1")], serde_json::Value::Null),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    // Exactly one of two racing clients wins the station.
    assert_ne!(ra.is_reserved(), rb.is_reserved());
}

#[tokio::test]
async fn test_invalid_request_gets_error_response() {
    let h = start_node().await;
    let (raw, mut inbound) =
        TransportAdapter::start(h.broker.clone(), config("car-9", &["responses/car-9"]));
    raw.wait_connected(WAIT).await.unwrap();

    // Addressed to the wrong node.
    raw.publish_json(
        "nodes/node-1/reservations/request",
        &serde_json::json!({
            "request_id": "r-wrong",
            "client_id": "car-9",
            "target_node_id": "node-7",
            "resource_refs": [{"node_id": "node-1", "resource_id": "R1"}],
        }),
    )
    .await
    .unwrap();
    let response: ReservationResponse = recv(&mut inbound).await.decode().unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.request_id.as_str(), "r-wrong");

    // Undecodable, but the reply address is readable.
    raw.publish(Message::new(
        "nodes/node-1/reservations/request",
        r#"{"request_id": "r-bad", "client_id": "car-9", "resource_refs": 5}"#,
    ))
    .await
    .unwrap();
    let response: ReservationResponse = recv(&mut inbound).await.decode().unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.request_id.as_str(), "r-bad");
    assert!(response.message.contains("Malformed"));

    assert!(h.store.get_resource(&ResourceId::from("R1")).await.unwrap().unwrap().available);
}

#[tokio::test]
async fn test_redelivered_request_gets_the_journaled_answer() {
    let h = start_node().await;
    let (raw, mut inbound) =
        TransportAdapter::start(h.broker.clone(), config("car-9", &["responses/car-9"]));
    raw.wait_connected(WAIT).await.unwrap();

    let request = serde_json::json!({
        "request_id": "r-again",
        "client_id": "car-9",
        "target_node_id": "node-1",
        "resource_refs": [{"node_id": "node-1", "resource_id": "R1"}],
    });
    raw.publish_json("nodes/node-1/reservations/request", &request)
        .await
        .unwrap();
    let first: ReservationResponse = recv(&mut inbound).await.decode().unwrap();
    assert!(first.is_reserved());

    // The same request again: answered from the journal, not re-run.
    raw.publish_json("nodes/node-1/reservations/request", &request)
        .await
        .unwrap();
    let second: ReservationResponse = recv(&mut inbound).await.decode().unwrap();
    assert_eq!(second.request_id.as_str(), "r-again");
    assert!(second.is_reserved());
    assert_eq!(second.availability_map, first.availability_map);

    let records = h
        .store
        .reservations_for_request(&common::RequestId::from("r-again"))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_reservation_is_announced() {
    let h = start_node().await;
    let (watcher, mut statuses) = TransportAdapter::start(
        h.broker.clone(),
        config("dashboard", &["nodes/node-1/resources/+/status"]),
    );
    watcher.wait_connected(WAIT).await.unwrap();

    let car = client(&h.broker, "car-1").await;
    let response = car
        .reserve(
            NodeId::from("node-1"),
            vec![ResourceRef::new("node-1", "R1b")],
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert!(response.is_reserved());

    let message = recv(&mut statuses).await;
    assert_eq!(message.topic, "nodes/node-1/resources/R1b/status");
    let status: ResourceStatus = message.decode().unwrap();
    assert!(!status.available);
}
