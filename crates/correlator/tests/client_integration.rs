use std::collections::BTreeMap;
use std::time::Duration;

use common::topics::{ALL_REQUEST_TOPICS, response_topic};
use common::{
    ClientId, NodeId, ReservationRequest, ReservationResponse, ResourceRef, ResponseStatus,
};
use correlator::{CorrelationError, CorrelatorConfig, ReservationClient};
use transport::{InMemoryBroker, TopicFilter, TransportAdapter, TransportConfig};

const CONNECT: Duration = Duration::from_secs(5);

/// A node stand-in that answers every request as reserved.
fn spawn_echo_node(broker: &InMemoryBroker) -> TransportAdapter {
    let config = TransportConfig::new("node-1")
        .subscribe(TopicFilter::parse(ALL_REQUEST_TOPICS).unwrap());
    let (adapter, mut inbound) = TransportAdapter::start(broker.clone(), config);
    let publisher = adapter.clone();
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let request: ReservationRequest = message.decode().unwrap();
            let availability_map: BTreeMap<_, _> = request
                .resource_refs
                .iter()
                .map(|r| (r.key(), true))
                .collect();
            let response = ReservationResponse {
                request_id: request.request_id.clone(),
                status: ResponseStatus::Reserved,
                availability_map,
                message: String::new(),
            };
            publisher
                .publish_json(&response_topic(&request.client_id), &response)
                .await
                .unwrap();
        }
    });
    adapter
}

#[tokio::test]
async fn client_receives_its_response() {
    let broker = InMemoryBroker::new();
    let node = spawn_echo_node(&broker);
    node.wait_connected(CONNECT).await.unwrap();

    let client = ReservationClient::connect(
        broker.clone(),
        ClientId::from("car-1"),
        CorrelatorConfig::default(),
        CONNECT,
    )
    .await
    .unwrap();

    let response = client
        .reserve(
            NodeId::from("node-1"),
            vec![ResourceRef::new("node-1", "R1")],
            serde_json::json!({"vehicle": "ev"}),
        )
        .await
        .unwrap();

    assert!(response.is_reserved());
    assert_eq!(response.availability_map.get("node-1/R1"), Some(&true));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_requests_each_get_their_own_response() {
    let broker = InMemoryBroker::new();
    let node = spawn_echo_node(&broker);
    node.wait_connected(CONNECT).await.unwrap();

    let client = std::sync::Arc::new(
        ReservationClient::connect(
            broker.clone(),
            ClientId::from("car-1"),
            CorrelatorConfig::default(),
            CONNECT,
        )
        .await
        .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..20 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let resource = format!("R{i}");
            let response = client
                .reserve(
                    NodeId::from("node-1"),
                    vec![ResourceRef::new("node-1", resource.as_str())],
                    serde_json::Value::Null,
                )
                .await
                .unwrap();
            assert!(response.availability_map.contains_key(&format!("node-1/{resource}")));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_without_leaking() {
    let broker = InMemoryBroker::new();
    let client = ReservationClient::connect(
        broker.clone(),
        ClientId::from("car-1"),
        CorrelatorConfig::default(),
        CONNECT,
    )
    .await
    .unwrap();

    let started = tokio::time::Instant::now();
    let request = ReservationRequest {
        request_id: "req-silent".into(),
        client_id: ClientId::from("car-1"),
        target_node_id: NodeId::from("node-9"),
        resource_refs: vec![ResourceRef::new("node-9", "R1")],
        payload: serde_json::Value::Null,
    };
    let err = client
        .send(request, Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, CorrelationError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn connect_fails_when_broker_is_offline() {
    let broker = InMemoryBroker::new();
    broker.set_offline(true).await;

    let result = ReservationClient::connect(
        broker.clone(),
        ClientId::from("car-1"),
        CorrelatorConfig::default(),
        Duration::from_millis(100),
    )
    .await;
    assert!(matches!(result, Err(CorrelationError::Transport(_))));
}
