//! `rid -> oneshot` correlation table for twin and DPS request/response
//! exchanges (spec §3, §9).
//!
//! Grounded on `spotflow::iothub::handlers::twins::TwinsMiddleware`'s
//! `Arc<Mutex<HashMap<String, ResponseType>>>` table: allocate a fresh
//! `uuid::Uuid::new_v4()` rid, insert before publishing, remove on whatever
//! completes the request first (response, drop, or cancellation), and
//! silently ignore a response whose rid is not present.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::error::ConnectionDroppedError;

/// Outcome delivered to a pending request's waiter.
#[derive(Debug, Clone)]
pub enum RequestOutcome<T> {
    Response(T),
    ConnectionDropped(ConnectionDroppedError),
}

/// A table of in-flight requests keyed by `rid`. Cloned handles share the
/// same underlying map.
pub struct PendingRequests<T> {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<RequestOutcome<T>>>>>,
}

// Implemented manually (rather than `#[derive(Clone)]`) so cloning a handle
// never requires `T: Clone` — only the shared `Arc` is cloned.
impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Send + 'static> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh rid, register a waiter for it, and return both the
    /// rid to publish with and a receiver to await.
    pub async fn register(&self) -> (String, oneshot::Receiver<RequestOutcome<T>>) {
        let rid = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(rid.clone(), tx);
        (rid, rx)
    }

    /// Complete the pending entry for `rid`, if any. Responses with an
    /// unrecognized rid are silently dropped per spec §4.4.
    pub async fn complete(&self, rid: &str, outcome: RequestOutcome<T>) {
        if let Some(tx) = self.inner.lock().await.remove(rid) {
            // The receiver may already be gone (caller cancelled); that's fine.
            let _ = tx.send(outcome);
        } else {
            log::warn!("ignoring response to unknown request `{rid}`");
        }
    }

    /// Remove the entry for `rid` without completing it, e.g. after the
    /// caller's await was cancelled.
    pub async fn remove(&self, rid: &str) {
        self.inner.lock().await.remove(rid);
    }

    /// Complete every pending entry with a connection-dropped outcome and
    /// clear the table (spec §5 "Connection-drop handling").
    pub async fn fail_all(&self, reason: ConnectionDroppedError) {
        let mut table = self.inner.lock().await;
        for (_, tx) in table.drain() {
            let _ = tx.send(RequestOutcome::ConnectionDropped(reason.clone()));
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_with_matching_rid_completes_waiter() {
        let table: PendingRequests<String> = PendingRequests::new();
        let (rid, rx) = table.register().await;
        table
            .complete(&rid, RequestOutcome::Response("ok".to_string()))
            .await;
        match rx.await.unwrap() {
            RequestOutcome::Response(s) => assert_eq!(s, "ok"),
            _ => panic!("expected Response"),
        }
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn response_with_unknown_rid_is_ignored() {
        let table: PendingRequests<String> = PendingRequests::new();
        let (_rid, _rx) = table.register().await;
        table
            .complete("does-not-exist", RequestOutcome::Response("ignored".to_string()))
            .await;
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn fail_all_completes_every_waiter_and_clears_table() {
        let table: PendingRequests<String> = PendingRequests::new();
        let (_rid1, rx1) = table.register().await;
        let (_rid2, rx2) = table.register().await;

        let reason = ConnectionDroppedError::new(anyhow::anyhow!("socket closed"));
        table.fail_all(reason).await;

        assert!(matches!(
            rx1.await.unwrap(),
            RequestOutcome::ConnectionDropped(_)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            RequestOutcome::ConnectionDropped(_)
        ));
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn remove_drops_entry_without_completing() {
        let table: PendingRequests<String> = PendingRequests::new();
        let (rid, _rx) = table.register().await;
        table.remove(&rid).await;
        assert_eq!(table.len().await, 0);
    }
}


