//! `rid -> oneshot` correlation table for twin and DPS request/response
//! exchanges.
//!
//! Allocate a fresh `uuid::Uuid::new_v4()` rid, insert before publishing,
//! remove on whatever completes the request first (response, drop, or
//! cancellation), and silently ignore a response whose rid is not present.
//!
//! `register()` hands back a `PendingResponse` rather than a bare
//! `oneshot::Receiver`: if the caller's await is cancelled (a `select!`
//! timeout, the caller's own future being dropped) before a response
//! arrives, the entry would otherwise sit in the table forever since
//! nothing else would ever remove it. `PendingResponse`'s `Drop` cleans up
//! that case; the table itself uses a plain `std::sync::Mutex` so that
//! cleanup can run synchronously.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

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
    /// rid to publish with and a response future to await.
    pub fn register(&self) -> (String, PendingResponse<T>) {
        let rid = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().insert(rid.clone(), tx);
        let response = PendingResponse {
            rid: rid.clone(),
            table: self.clone(),
            rx,
            done: false,
        };
        (rid, response)
    }

    /// Complete the pending entry for `rid`, if any. A response whose rid
    /// does not match a pending entry is silently dropped.
    pub fn complete(&self, rid: &str, outcome: RequestOutcome<T>) {
        if let Some(tx) = self.inner.lock().unwrap().remove(rid) {
            // The receiver may already be gone (caller cancelled); that's fine.
            let _ = tx.send(outcome);
        } else {
            log::warn!("ignoring response to unknown request `{rid}`");
        }
    }

    /// Remove the entry for `rid` without completing it, e.g. after the
    /// caller's await was cancelled.
    pub fn remove(&self, rid: &str) {
        self.inner.lock().unwrap().remove(rid);
    }

    /// Complete every pending entry with a connection-dropped outcome and
    /// clear the table.
    pub fn fail_all(&self, reason: ConnectionDroppedError) {
        let mut table = self.inner.lock().unwrap();
        for (_, tx) in table.drain() {
            let _ = tx.send(RequestOutcome::ConnectionDropped(reason.clone()));
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// A response future for a registered `rid`. Removes its table entry on
/// drop if it's dropped before resolving, so a cancelled await never
/// leaks an entry.
pub struct PendingResponse<T: Send + 'static> {
    rid: String,
    table: PendingRequests<T>,
    rx: oneshot::Receiver<RequestOutcome<T>>,
    done: bool,
}

impl<T: Send + 'static> Future for PendingResponse<T> {
    type Output = Result<RequestOutcome<T>, oneshot::error::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> Drop for PendingResponse<T> {
    fn drop(&mut self) {
        if !self.done {
            self.table.remove(&self.rid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_with_matching_rid_completes_waiter() {
        let table: PendingRequests<String> = PendingRequests::new();
        let (rid, rx) = table.register();
        table.complete(&rid, RequestOutcome::Response("ok".to_string()));
        match rx.await.unwrap() {
            RequestOutcome::Response(s) => assert_eq!(s, "ok"),
            _ => panic!("expected Response"),
        }
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn response_with_unknown_rid_is_ignored() {
        let table: PendingRequests<String> = PendingRequests::new();
        let (_rid, _rx) = table.register();
        table.complete("does-not-exist", RequestOutcome::Response("ignored".to_string()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_completes_every_waiter_and_clears_table() {
        let table: PendingRequests<String> = PendingRequests::new();
        let (_rid1, rx1) = table.register();
        let (_rid2, rx2) = table.register();

        let reason = ConnectionDroppedError::new(anyhow::anyhow!("socket closed"));
        table.fail_all(reason);

        assert!(matches!(
            rx1.await.unwrap(),
            RequestOutcome::ConnectionDropped(_)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            RequestOutcome::ConnectionDropped(_)
        ));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn remove_drops_entry_without_completing() {
        let table: PendingRequests<String> = PendingRequests::new();
        let (rid, _rx) = table.register();
        table.remove(&rid);
        assert_eq!(table.len(), 0);
    }
}
