use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{NodeId, RequestId, ResourceId};
use reqwest::Url;
use resource_store::{ReleaseOutcome, ReserveOutcome};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{
    ConfirmReply, Confirmation, PeerClient, PeerError, ReleaseBody, ReleaseReply, ReserveBody,
    ReserveReply,
};

/// Settings for [`HttpPeerClient`].
#[derive(Debug, Clone)]
pub struct HttpPeerConfig {
    /// Base URL of each known peer, e.g. `http://node-2:3000`.
    pub peers: HashMap<NodeId, String>,
    /// Per-call timeout. Must stay below the saga deadline.
    pub timeout: Duration,
    /// Extra attempts for release and confirm calls.
    pub retries: u32,
    /// Delay before the first retry; doubled for each further one.
    pub retry_backoff: Duration,
}

impl Default for HttpPeerConfig {
    fn default() -> Self {
        Self {
            peers: HashMap::new(),
            timeout: Duration::from_secs(2),
            retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl HttpPeerConfig {
    pub fn with_peer(mut self, node: impl Into<NodeId>, base_url: impl Into<String>) -> Self {
        self.peers.insert(node.into(), base_url.into());
        self
    }
}

/// Peer client speaking the node's HTTP peer RPC.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: reqwest::Client,
    config: HttpPeerConfig,
}

impl HttpPeerClient {
    pub fn new(config: HttpPeerConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpPeerConfig {
        &self.config
    }

    fn endpoint(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        action: &str,
    ) -> Result<Url, PeerError> {
        let base = self
            .config
            .peers
            .get(peer)
            .ok_or_else(|| PeerError::UnknownPeer(peer.clone()))?;

        let invalid = |reason: String| PeerError::Unreachable {
            node: peer.clone(),
            reason,
        };
        let mut url = Url::parse(base).map_err(|e| invalid(format!("bad base URL {base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| invalid(format!("base URL {base} cannot carry a path")))?
            .pop_if_empty()
            .extend(["resources", resource_id.as_str(), action]);
        Ok(url)
    }

    async fn post<B, T>(&self, peer: &NodeId, url: Url, body: &B) -> Result<T, PeerError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let map_send = |e: reqwest::Error| {
            if e.is_timeout() {
                PeerError::Timeout {
                    node: peer.clone(),
                    timeout: self.config.timeout,
                }
            } else {
                PeerError::Unreachable {
                    node: peer.clone(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(map_send)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PeerError::Rejected {
                node: peer.clone(),
                status: status.as_u16(),
                body,
            });
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                map_send(e)
            } else {
                PeerError::InvalidResponse {
                    node: peer.clone(),
                    reason: e.to_string(),
                }
            }
        })
    }

    /// Runs an idempotent call, retrying with exponential backoff.
    async fn with_retries<T, F, Fut>(&self, op: &'static str, peer: &NodeId, call: F) -> Result<T, PeerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, PeerError>>,
    {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(PeerError::UnknownPeer(node)) => return Err(PeerError::UnknownPeer(node)),
                Err(e) if attempt >= self.config.retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        op,
                        peer = %peer,
                        attempt,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Peer call failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

fn observe<T>(op: &'static str, started: Instant, result: &Result<T, PeerError>) {
    metrics::histogram!("peer_call_duration_seconds", "op" => op)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = result {
        metrics::counter!("peer_call_failures_total", "op" => op, "kind" => e.kind()).increment(1);
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    #[tracing::instrument(skip(self), fields(peer = %peer, resource_id = %resource_id, request_id = %request_id))]
    async fn check_and_reserve_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        request_id: &RequestId,
    ) -> Result<ReserveOutcome, PeerError> {
        let started = Instant::now();
        let url = self.endpoint(peer, resource_id, "reserve")?;
        let body = ReserveBody {
            request_id: Some(request_id.clone()),
        };
        let result = self
            .post::<_, ReserveReply>(peer, url, &body)
            .await
            .map(|reply| reply.outcome);
        observe("reserve", started, &result);
        result
    }

    #[tracing::instrument(skip(self), fields(peer = %peer, resource_id = %resource_id, request_id = %request_id))]
    async fn release_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        request_id: &RequestId,
    ) -> Result<ReleaseOutcome, PeerError> {
        let started = Instant::now();
        let url = self.endpoint(peer, resource_id, "release")?;
        let body = ReleaseBody {
            request_id: Some(request_id.clone()),
        };
        let result = self
            .with_retries("release", peer, || {
                self.post::<_, ReleaseReply>(peer, url.clone(), &body)
            })
            .await
            .map(|reply| reply.outcome);
        observe("release", started, &result);
        result
    }

    #[tracing::instrument(skip(self, confirmation), fields(peer = %peer, resource_id = %resource_id, request_id = %confirmation.request_id))]
    async fn confirm_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        confirmation: &Confirmation,
    ) -> Result<(), PeerError> {
        let started = Instant::now();
        let url = self.endpoint(peer, resource_id, "confirm")?;
        let result = self
            .with_retries("confirm", peer, || {
                self.post::<_, ConfirmReply>(peer, url.clone(), confirmation)
            })
            .await
            .map(|_| ());
        observe("confirm", started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpPeerClient {
        HttpPeerClient::new(
            HttpPeerConfig::default()
                .with_peer("node-2", "http://127.0.0.1:9")
                .with_peer("node-3", "http://peer-3:3000/api/"),
        )
        .unwrap()
    }

    #[test]
    fn endpoint_joins_and_escapes_segments() {
        let c = client();
        let url = c
            .endpoint(&NodeId::from("node-2"), &ResourceId::from("R 1"), "reserve")
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9/resources/R%201/reserve");

        let url = c
            .endpoint(&NodeId::from("node-3"), &ResourceId::from("R1"), "release")
            .unwrap();
        assert_eq!(url.as_str(), "http://peer-3:3000/api/resources/R1/release");
    }

    #[tokio::test]
    async fn unknown_peer_fails_without_calling() {
        let err = client()
            .check_and_reserve_remote(
                &NodeId::from("node-9"),
                &ResourceId::from("R1"),
                &RequestId::from("req-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable_after_retries() {
        let mut config = HttpPeerConfig::default().with_peer("node-2", "http://127.0.0.1:9");
        config.retries = 2;
        config.retry_backoff = Duration::from_millis(1);
        let c = HttpPeerClient::new(config).unwrap();

        let err = c
            .release_remote(
                &NodeId::from("node-2"),
                &ResourceId::from("R1"),
                &RequestId::from("req-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PeerError::Unreachable { .. } | PeerError::Timeout { .. }
        ));
        assert_eq!(err.node(), &NodeId::from("node-2"));
    }
}
