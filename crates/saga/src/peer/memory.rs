use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{NodeId, RequestId, ResourceId};
use resource_store::{ReleaseOutcome, ReserveOutcome, ResourceStore, StoreError};
use tokio::sync::RwLock;

use super::{
    Confirmation, PeerClient, PeerError, confirm_owned, release_owned, reserve_owned,
    status_for_store_error,
};

/// A call observed by [`InMemoryPeerClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    Reserve { peer: NodeId, resource_id: ResourceId },
    Release { peer: NodeId, resource_id: ResourceId },
    Confirm { peer: NodeId, resource_id: ResourceId },
}

impl PeerCall {
    pub fn peer(&self) -> &NodeId {
        match self {
            PeerCall::Reserve { peer, .. }
            | PeerCall::Release { peer, .. }
            | PeerCall::Confirm { peer, .. } => peer,
        }
    }
}

struct PeerSlot {
    store: Arc<dyn ResourceStore>,
    unreachable: bool,
    reject: bool,
    delay: Option<Duration>,
    fail_releases: bool,
    lose_reserve_replies: bool,
}

#[derive(Default)]
struct InMemoryPeerState {
    peers: HashMap<NodeId, PeerSlot>,
    calls: Vec<PeerCall>,
}

/// Peer client that calls other nodes' stores directly, for tests and
/// single-process setups.
///
/// Faults can be injected per peer: unreachable, rejecting every call,
/// slow (subject to the client's timeout), failing releases, or applying
/// reserves whose replies never arrive.
#[derive(Clone)]
pub struct InMemoryPeerClient {
    state: Arc<RwLock<InMemoryPeerState>>,
    timeout: Duration,
}

impl Default for InMemoryPeerClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl InMemoryPeerClient {
    /// Creates a client whose calls time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(InMemoryPeerState::default())),
            timeout,
        }
    }

    /// Registers a peer node backed by `store`.
    pub async fn add_peer(&self, node: impl Into<NodeId>, store: Arc<dyn ResourceStore>) {
        self.state.write().await.peers.insert(
            node.into(),
            PeerSlot {
                store,
                unreachable: false,
                reject: false,
                delay: None,
                fail_releases: false,
                lose_reserve_replies: false,
            },
        );
    }

    async fn configure(&self, node: &NodeId, f: impl FnOnce(&mut PeerSlot)) {
        if let Some(slot) = self.state.write().await.peers.get_mut(node) {
            f(slot);
        }
    }

    /// Makes every call to the peer fail as a network error.
    pub async fn set_unreachable(&self, node: &NodeId, unreachable: bool) {
        self.configure(node, |s| s.unreachable = unreachable).await;
    }

    /// Makes every call to the peer fail with an error status.
    pub async fn set_reject(&self, node: &NodeId, reject: bool) {
        self.configure(node, |s| s.reject = reject).await;
    }

    /// Delays every call to the peer. Delays beyond the timeout make the call
    /// time out without reaching the peer's store.
    pub async fn set_delay(&self, node: &NodeId, delay: Option<Duration>) {
        self.configure(node, |s| s.delay = delay).await;
    }

    /// Makes release calls to the peer fail.
    pub async fn set_fail_releases(&self, node: &NodeId, fail: bool) {
        self.configure(node, |s| s.fail_releases = fail).await;
    }

    /// Makes reserve calls to the peer take effect and then time out, as if
    /// the reply were lost on the way back.
    pub async fn set_lose_reserve_replies(&self, node: &NodeId, lose: bool) {
        self.configure(node, |s| s.lose_reserve_replies = lose).await;
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<PeerCall> {
        self.state.read().await.calls.clone()
    }

    /// Number of calls made to `node`.
    pub async fn call_count(&self, node: &NodeId) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.peer() == node)
            .count()
    }

    /// Records the call and returns the peer's store and delay, or the
    /// injected failure.
    async fn enter(
        &self,
        call: PeerCall,
        releasing: bool,
    ) -> Result<(Arc<dyn ResourceStore>, Option<Duration>), PeerError> {
        self.enter_slot(call, releasing)
            .await
            .map(|(store, delay, _)| (store, delay))
    }

    async fn enter_slot(
        &self,
        call: PeerCall,
        releasing: bool,
    ) -> Result<(Arc<dyn ResourceStore>, Option<Duration>, bool), PeerError> {
        let node = call.peer().clone();
        let mut state = self.state.write().await;
        state.calls.push(call);

        let slot = state
            .peers
            .get(&node)
            .ok_or_else(|| PeerError::UnknownPeer(node.clone()))?;

        if slot.unreachable || (releasing && slot.fail_releases) {
            return Err(PeerError::Unreachable {
                node,
                reason: "connection refused".to_string(),
            });
        }
        if slot.reject {
            return Err(PeerError::Rejected {
                node,
                status: 503,
                body: "service unavailable".to_string(),
            });
        }
        Ok((slot.store.clone(), slot.delay, slot.lose_reserve_replies))
    }

    async fn run<T, F>(&self, node: &NodeId, delay: Option<Duration>, op: F) -> Result<T, PeerError>
    where
        F: Future<Output = resource_store::Result<T>> + Send,
    {
        let call = async {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            op.await
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(rejected(node, &e)),
            Err(_) => Err(PeerError::Timeout {
                node: node.clone(),
                timeout: self.timeout,
            }),
        }
    }
}

fn rejected(node: &NodeId, error: &StoreError) -> PeerError {
    PeerError::Rejected {
        node: node.clone(),
        status: status_for_store_error(error),
        body: error.to_string(),
    }
}

#[async_trait]
impl PeerClient for InMemoryPeerClient {
    async fn check_and_reserve_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        request_id: &RequestId,
    ) -> Result<ReserveOutcome, PeerError> {
        let call = PeerCall::Reserve {
            peer: peer.clone(),
            resource_id: resource_id.clone(),
        };
        let (store, delay, lose_reply) = self.enter_slot(call, false).await?;
        let outcome = self
            .run(
                peer,
                delay,
                reserve_owned(store.as_ref(), resource_id, Some(request_id)),
            )
            .await?;
        if lose_reply {
            return Err(PeerError::Timeout {
                node: peer.clone(),
                timeout: self.timeout,
            });
        }
        Ok(outcome)
    }

    async fn release_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        request_id: &RequestId,
    ) -> Result<ReleaseOutcome, PeerError> {
        let call = PeerCall::Release {
            peer: peer.clone(),
            resource_id: resource_id.clone(),
        };
        let (store, delay) = self.enter(call, true).await?;
        self.run(
            peer,
            delay,
            release_owned(store.as_ref(), resource_id, Some(request_id)),
        )
        .await
    }

    async fn confirm_remote(
        &self,
        peer: &NodeId,
        resource_id: &ResourceId,
        confirmation: &Confirmation,
    ) -> Result<(), PeerError> {
        let call = PeerCall::Confirm {
            peer: peer.clone(),
            resource_id: resource_id.clone(),
        };
        let (store, delay) = self.enter(call, false).await?;
        self.run(
            peer,
            delay,
            confirm_owned(store.as_ref(), resource_id, confirmation.clone()),
        )
        .await
    }
}
