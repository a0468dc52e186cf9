//! The pending-correlation table.

use std::collections::HashMap;
use std::time::Duration;

use common::RequestId;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{CorrelationError, Result};

struct Pending<R> {
    tx: oneshot::Sender<R>,
    created_at: Instant,
    deadline: Instant,
}

/// What happened to a response handed to [`CorrelationTable::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Delivered to the waiting caller.
    Delivered,
    /// No entry for that ID: unknown, already resolved, or expired.
    Unmatched,
    /// The entry existed but its caller had already gone away.
    CallerGone,
}

/// Maps request IDs to the callers awaiting their response.
///
/// `register`, `resolve`, `expire` and `sweep` are the only mutators. Every
/// entry leaves the table through exactly one of them, so a caller observes
/// either its response or a timeout, never both.
pub struct CorrelationTable<R> {
    entries: HashMap<RequestId, Pending<R>>,
}

impl<R> Default for CorrelationTable<R> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<R> CorrelationTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry that expires after `timeout`. Refuses an ID that is
    /// already pending.
    pub fn register(
        &mut self,
        request_id: RequestId,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<R>> {
        if self.entries.contains_key(&request_id) {
            return Err(CorrelationError::DuplicateRequest(request_id));
        }

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.entries.insert(
            request_id,
            Pending {
                tx,
                created_at: now,
                deadline: now + timeout,
            },
        );
        Ok(rx)
    }

    /// Removes the entry and hands it the response.
    pub fn resolve(&mut self, request_id: &RequestId, response: R) -> Resolution {
        match self.entries.remove(request_id) {
            Some(pending) => match pending.tx.send(response) {
                Ok(()) => Resolution::Delivered,
                Err(_) => Resolution::CallerGone,
            },
            None => Resolution::Unmatched,
        }
    }

    /// Removes the entry without a response. Returns false if it was already
    /// gone.
    pub fn expire(&mut self, request_id: &RequestId) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Removes every entry whose deadline is at or before `now`, returning
    /// their IDs.
    pub fn sweep(&mut self, now: Instant) -> Vec<RequestId> {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.entries.contains_key(request_id)
    }

    /// How long the entry has been waiting.
    pub fn age(&self, request_id: &RequestId) -> Option<Duration> {
        self.entries
            .get(request_id)
            .map(|p| p.created_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_once() {
        let mut table = CorrelationTable::new();
        let id = RequestId::from("r1");
        let rx = table.register(id.clone(), Duration::from_secs(1)).unwrap();

        assert_eq!(table.resolve(&id, 7), Resolution::Delivered);
        assert_eq!(table.resolve(&id, 8), Resolution::Unmatched);
        assert_eq!(rx.await.unwrap(), 7);
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let mut table = CorrelationTable::<u32>::new();
        let id = RequestId::from("r1");
        let _rx = table.register(id.clone(), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            table.register(id, Duration::from_secs(1)),
            Err(CorrelationError::DuplicateRequest(_))
        ));
    }

    #[test]
    fn resolve_after_caller_dropped() {
        let mut table = CorrelationTable::new();
        let id = RequestId::from("r1");
        drop(table.register(id.clone(), Duration::from_secs(1)).unwrap());
        assert_eq!(table.resolve(&id, 1), Resolution::CallerGone);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let mut table = CorrelationTable::<u32>::new();
        let _a = table
            .register(RequestId::from("short"), Duration::from_secs(1))
            .unwrap();
        let _b = table
            .register(RequestId::from("long"), Duration::from_secs(10))
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = table.sweep(Instant::now());

        assert_eq!(expired, vec![RequestId::from("short")]);
        assert!(table.contains(&RequestId::from("long")));
        assert_eq!(
            table.age(&RequestId::from("long")),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn expire_reports_whether_entry_existed() {
        let mut table = CorrelationTable::<u32>::new();
        let id = RequestId::from("r1");
        let _rx = table.register(id.clone(), Duration::from_secs(1)).unwrap();
        assert!(table.expire(&id));
        assert!(!table.expire(&id));
    }
}
