//! Response correlation.
//!
//! A [`ResponseCorrelator`] is a handle to a single task that owns the map of
//! outstanding requests. Every mutation (register, settle, expire, cancel)
//! is a command processed in order by that task, so there is no shared map
//! and no lock around it. Each pending request is settled at most once: the
//! waiter is a oneshot channel that is consumed on settlement.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::types::ResponseMessage;
use crate::errors::RouterError;

type Settlement = Result<Value, RouterError>;

// ─── Commands ────────────────────────────────────────────────────────────────

enum Command {
    Register {
        id: String,
        timeout_ms: u64,
        responder: oneshot::Sender<Settlement>,
    },
    Response {
        response: ResponseMessage,
        ack: Option<oneshot::Sender<bool>>,
    },
    Discard {
        id: String,
        error: RouterError,
    },
    Expire {
        id: String,
        generation: u64,
        timeout_ms: u64,
    },
    CancelAll {
        reason: String,
        ack: oneshot::Sender<usize>,
    },
    PendingCount {
        ack: oneshot::Sender<usize>,
    },
}

// ─── PendingRequest ──────────────────────────────────────────────────────────

/// A request waiting for its response. Lives only inside the owner task.
struct PendingRequest {
    created_at: DateTime<Utc>,
    generation: u64,
    responder: oneshot::Sender<Settlement>,
    timeout_handle: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn settle(self, outcome: Settlement) {
        if let Some(handle) = self.timeout_handle {
            handle.abort();
        }
        // The waiter may have gone away; nothing left to deliver to.
        let _ = self.responder.send(outcome);
    }
}

// ─── ResponseCorrelator ──────────────────────────────────────────────────────

/// Handle to the task owning the pending-request map for one connection.
///
/// Must be created inside a Tokio runtime. The owner task exits once every
/// handle is dropped; outstanding waiters then resolve with `cancelled`.
#[derive(Clone)]
pub struct ResponseCorrelator {
    commands: mpsc::UnboundedSender<Command>,
}

impl ResponseCorrelator {
    /// Spawn the owner task and return a handle to it.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        // Timer tasks hold a sender; the owner keeps only a weak one so it
        // exits when every external handle is gone.
        tokio::spawn(run_owner(rx, tx.downgrade()));
        Self { commands: tx }
    }

    /// Record a pending request and return the future that settles it.
    ///
    /// If `id` is already pending, the earlier waiter is rejected with
    /// `superseded` before the new one is stored. A `timeout_ms` of zero
    /// installs no timeout.
    pub fn register(&self, id: &str, timeout_ms: u64) -> Result<PendingResponse, RouterError> {
        let (responder, rx) = oneshot::channel();
        self.send(Command::Register {
            id: id.to_string(),
            timeout_ms,
            responder,
        })?;
        Ok(PendingResponse { rx })
    }

    /// Route a response to its waiter.
    ///
    /// Returns `false` if nothing is pending under `response.id`; unsolicited
    /// messages share the wire format and are not an error.
    pub async fn handle_response(&self, response: ResponseMessage) -> bool {
        let (ack, rx) = oneshot::channel();
        if self
            .send(Command::Response {
                response,
                ack: Some(ack),
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Route a response without waiting for the outcome.
    pub fn dispatch_response(&self, response: ResponseMessage) {
        let _ = self.send(Command::Response {
            response,
            ack: None,
        });
    }

    /// Reject and remove a single pending request (e.g. its send failed).
    pub fn discard(&self, id: &str, error: RouterError) {
        let _ = self.send(Command::Discard {
            id: id.to_string(),
            error,
        });
    }

    /// Reject every outstanding request with `cancelled` tagged with `reason`.
    ///
    /// Returns the number of requests that were cancelled. Once this returns,
    /// no previously registered request can be resolved any more.
    pub async fn cancel_all(&self, reason: &str) -> usize {
        let (ack, rx) = oneshot::channel();
        if self
            .send(Command::CancelAll {
                reason: reason.to_string(),
                ack,
            })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        let (ack, rx) = oneshot::channel();
        if self.send(Command::PendingCount { ack }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn send(&self, command: Command) -> Result<(), RouterError> {
        self.commands
            .send(command)
            .map_err(|_| RouterError::Cancelled {
                reason: "response correlator stopped".into(),
            })
    }
}

impl Default for ResponseCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

// ─── PendingResponse ─────────────────────────────────────────────────────────

/// Future resolving to the settled outcome of one request.
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse {
    rx: oneshot::Receiver<Settlement>,
}

impl Future for PendingResponse {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RouterError::Cancelled {
                reason: "response correlator stopped".into(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ─── Owner Task ──────────────────────────────────────────────────────────────

async fn run_owner(
    mut commands: mpsc::UnboundedReceiver<Command>,
    timers: mpsc::WeakUnboundedSender<Command>,
) {
    let mut pending: HashMap<String, PendingRequest> = HashMap::new();
    let mut next_generation: u64 = 0;

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register {
                id,
                timeout_ms,
                responder,
            } => {
                if let Some(previous) = pending.remove(&id) {
                    tracing::debug!(request_id = %id, "superseding pending request");
                    previous.settle(Err(RouterError::Superseded {
                        request_id: id.clone(),
                    }));
                }

                next_generation += 1;
                let generation = next_generation;
                let timeout_handle = if timeout_ms > 0 {
                    timers.upgrade().map(|tx| {
                        let timer_id = id.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                            let _ = tx.send(Command::Expire {
                                id: timer_id,
                                generation,
                                timeout_ms,
                            });
                        })
                    })
                } else {
                    None
                };

                pending.insert(
                    id,
                    PendingRequest {
                        created_at: Utc::now(),
                        generation,
                        responder,
                        timeout_handle,
                    },
                );
            }

            Command::Response { response, ack } => {
                let matched = match pending.remove(&response.id) {
                    Some(entry) => {
                        entry.settle(response.into_result());
                        true
                    }
                    None => {
                        tracing::debug!(
                            request_id = %response.id,
                            "response does not match any pending request"
                        );
                        false
                    }
                };
                if let Some(ack) = ack {
                    let _ = ack.send(matched);
                }
            }

            Command::Discard { id, error } => {
                if let Some(entry) = pending.remove(&id) {
                    entry.settle(Err(error));
                }
            }

            Command::Expire {
                id,
                generation,
                timeout_ms,
            } => {
                // A stale timer for an entry that was replaced must not touch
                // the newer one.
                let is_current = pending
                    .get(&id)
                    .is_some_and(|entry| entry.generation == generation);
                if is_current {
                    if let Some(entry) = pending.remove(&id) {
                        let waited_ms = (Utc::now() - entry.created_at).num_milliseconds();
                        tracing::warn!(request_id = %id, timeout_ms, waited_ms, "request timed out");
                        entry.settle(Err(RouterError::Timeout {
                            request_id: id,
                            timeout_ms,
                        }));
                    }
                }
            }

            Command::CancelAll { reason, ack } => {
                let count = pending.len();
                for (_, entry) in pending.drain() {
                    entry.settle(Err(RouterError::Cancelled {
                        reason: reason.clone(),
                    }));
                }
                if count > 0 {
                    tracing::debug!(count, reason = %reason, "cancelled pending requests");
                }
                let _ = ack.send(count);
            }

            Command::PendingCount { ack } => {
                let _ = ack.send(pending.len());
            }
        }
    }

    for (_, entry) in pending.drain() {
        entry.settle(Err(RouterError::Cancelled {
            reason: "response correlator stopped".into(),
        }));
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn ok_response(id: &str, result: Value) -> ResponseMessage {
        ResponseMessage::success(id, result)
    }

    #[tokio::test]
    async fn test_unknown_response_returns_false() {
        let correlator = ResponseCorrelator::new();
        assert!(!correlator.handle_response(ok_response("never", json!(1))).await);
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_response_resolves_waiter() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.register("r1", 0).unwrap();

        assert!(correlator.handle_response(ok_response("r1", json!({"ok": true}))).await);
        assert_eq!(pending.await.unwrap(), json!({"ok": true}));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_error_response_rejects_waiter() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.register("r1", 0).unwrap();

        let failure = ResponseMessage::failure(
            "r1",
            &RouterError::InvalidParams {
                reason: "bad".into(),
            },
        );
        assert!(correlator.handle_response(failure).await);
        assert_eq!(pending.await.unwrap_err().code(), "invalid_params");
    }

    #[tokio::test]
    async fn test_settles_at_most_once() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.register("r1", 0).unwrap();

        assert!(correlator.handle_response(ok_response("r1", json!(1))).await);
        assert!(!correlator.handle_response(ok_response("r1", json!(2))).await);
        assert_eq!(pending.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_duplicate_id_supersedes_first() {
        let correlator = ResponseCorrelator::new();
        let first = correlator.register("dup", 0).unwrap();
        let second = correlator.register("dup", 0).unwrap();

        // The first waiter is rejected before anything can reach the second.
        let first_outcome = first.await;
        assert_eq!(first_outcome.unwrap_err().code(), "superseded");
        assert_eq!(correlator.pending_count().await, 1);

        assert!(correlator.handle_response(ok_response("dup", json!("new"))).await);
        assert_eq!(second.await.unwrap(), json!("new"));
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_removes_entry() {
        let correlator = ResponseCorrelator::new();
        let start = Instant::now();
        let pending = correlator.register("slow", 50).unwrap();

        let err = pending.await.unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(err.code(), "timeout");
        assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_waits_indefinitely() {
        let correlator = ResponseCorrelator::new();
        let pending = correlator.register("patient", 0).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(correlator.pending_count().await, 1);

        correlator.dispatch_response(ok_response("patient", json!("late")));
        assert_eq!(pending.await.unwrap(), json!("late"));
    }

    #[tokio::test]
    async fn test_timer_cleared_after_response() {
        let correlator = ResponseCorrelator::new();
        let first = correlator.register("r", 40).unwrap();
        assert!(correlator.handle_response(ok_response("r", json!(1))).await);
        assert_eq!(first.await.unwrap(), json!(1));

        // Re-use the id; the old timer must not expire the new entry.
        let second = correlator.register("r", 0).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(correlator.pending_count().await, 1);

        assert!(correlator.handle_response(ok_response("r", json!(2))).await);
        assert_eq!(second.await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_everything() {
        let correlator = ResponseCorrelator::new();
        let a = correlator.register("a", 0).unwrap();
        let b = correlator.register("b", 1_000).unwrap();

        assert_eq!(correlator.cancel_all("client disconnecting").await, 2);

        for pending in [a, b] {
            match pending.await.unwrap_err() {
                RouterError::Cancelled { reason } => assert_eq!(reason, "client disconnecting"),
                other => panic!("expected Cancelled, got {other:?}"),
            }
        }

        // Late responses find nothing.
        assert!(!correlator.handle_response(ok_response("a", json!(1))).await);
    }

    #[tokio::test]
    async fn test_discard_rejects_single_entry() {
        let correlator = ResponseCorrelator::new();
        let a = correlator.register("a", 0).unwrap();
        let _b = correlator.register("b", 0).unwrap();

        correlator.discard("a", RouterError::connection("srv", "broken pipe"));
        assert_eq!(a.await.unwrap_err().code(), "connection_error");
        assert_eq!(correlator.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_independent_timeouts() {
        let correlator = ResponseCorrelator::new();
        let short = correlator.register("short", 20).unwrap();
        let long = correlator.register("long", 0).unwrap();

        assert_eq!(short.await.unwrap_err().code(), "timeout");
        assert_eq!(correlator.pending_count().await, 1);

        assert!(correlator.handle_response(ok_response("long", json!(true))).await);
        assert_eq!(long.await.unwrap(), json!(true));
    }
}
