//! Matches result frames to outstanding calls.
//!
//! Each call gets a fresh id and exactly one terminal outcome: its result, its RPC error, a
//! timeout, or a transport-closed rejection. Late results for retired ids are handed back to
//! the caller of [`Correlator::resolve`] so the dispatcher can drop them.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::gateway::protocol::{Frame, RequestFrame, ResponseFrame};
use crate::gateway::transport::Connection;

/// Where call frames go. Implemented by [`Connection`]; tests plug in their own.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &Frame) -> Result<(), BridgeError>;
}

impl FrameSink for Connection {
    fn send_frame(&self, frame: &Frame) -> Result<(), BridgeError> {
        self.send(frame)
    }
}

type Reply = oneshot::Sender<Result<Value, BridgeError>>;

struct PendingCall {
    method: String,
    deadline: Instant,
    reply: Reply,
}

pub struct Correlator {
    next_id: Arc<AtomicU64>,
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Retires the pending entry when the call future completes or is dropped.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.take(self.id);
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::sharing(Arc::new(AtomicU64::new(0)))
    }

    /// Correlator drawing ids from a shared counter, so ids stay unique across connections.
    pub fn sharing(ids: Arc<AtomicU64>) -> Self {
        Self {
            next_id: ids,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Ids are never reused for the lifetime of the counter.
    fn next_id(&self) -> String {
        format!("c-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn take(&self, id: &str) -> Option<PendingCall> {
        self.pending.lock().ok().and_then(|mut g| g.remove(id))
    }

    /// Send `method` through `sink` and wait for its outcome, at most `timeout`.
    pub async fn call(
        &self,
        sink: &dyn FrameSink,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let id = self.next_id();
        let (tx, mut rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                id.clone(),
                PendingCall {
                    method: method.to_string(),
                    deadline: Instant::now() + timeout,
                    reply: tx,
                },
            );
        }
        let _guard = PendingGuard {
            correlator: self,
            id: &id,
        };

        sink.send_frame(&Frame::Req(RequestFrame::new(id.clone(), method, params)))?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::closed("call abandoned")),
            Err(_) => {
                if self.take(&id).is_some() {
                    log::debug!("call {} ({}) timed out", id, method);
                    return Err(BridgeError::Timeout {
                        method: method.to_string(),
                        after: timeout,
                    });
                }
                // The result was claimed right at the deadline; it is already in flight.
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(BridgeError::closed("call abandoned")),
                }
            }
        }
    }

    /// Complete the matching call. Returns the frame when no call is waiting for it.
    pub fn resolve(&self, res: ResponseFrame) -> Option<ResponseFrame> {
        let Some(call) = self.take(&res.id) else {
            return Some(res);
        };
        if Instant::now() > call.deadline {
            log::debug!("result for {} ({}) arrived at its deadline", res.id, call.method);
        }
        let _ = call.reply.send(res.into_result());
        None
    }

    /// Reject every outstanding call with [`BridgeError::TransportClosed`]. Returns how many.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingCall)> = match self.pending.lock() {
            Ok(mut g) => g.drain().collect(),
            Err(_) => return 0,
        };
        let n = drained.len();
        for (id, call) in drained {
            log::debug!("rejecting call {} ({}): {}", id, call.method, reason);
            let _ = call.reply.send(Err(BridgeError::closed(reason)));
        }
        n
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|g| g.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<RequestFrame>>,
        broken: bool,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: &Frame) -> Result<(), BridgeError> {
            if self.broken {
                return Err(BridgeError::closed("broken pipe"));
            }
            if let Frame::Req(req) = frame {
                self.frames.lock().unwrap().push(req.clone());
            }
            Ok(())
        }
    }

    impl RecordingSink {
        async fn wait_for_calls(&self, n: usize) -> Vec<RequestFrame> {
            for _ in 0..200 {
                let frames = self.frames.lock().unwrap().clone();
                if frames.len() >= n {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("expected {} calls to be sent", n);
        }
    }

    fn spawn_call(
        correlator: &Arc<Correlator>,
        sink: &Arc<RecordingSink>,
        method: &'static str,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<Result<Value, BridgeError>> {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            correlator
                .call(sink.as_ref(), method, json!({}), timeout)
                .await
        })
    }

    #[tokio::test]
    async fn resolves_matching_result() {
        let correlator = Arc::new(Correlator::new());
        let sink = Arc::new(RecordingSink::default());
        let call = spawn_call(&correlator, &sink, "ping", Duration::from_secs(5));

        let sent = sink.wait_for_calls(1).await;
        assert_eq!(sent[0].method, "ping");
        assert!(correlator
            .resolve(ResponseFrame::ok(sent[0].id.clone(), json!("pong")))
            .is_none());

        assert_eq!(call.await.unwrap(), Ok(json!("pong")));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_result_is_rpc_error() {
        let correlator = Arc::new(Correlator::new());
        let sink = Arc::new(RecordingSink::default());
        let call = spawn_call(&correlator, &sink, "agent", Duration::from_secs(5));

        let sent = sink.wait_for_calls(1).await;
        correlator.resolve(ResponseFrame::err(sent[0].id.clone(), "BAD_PARAMS", "no message"));

        assert_eq!(
            call.await.unwrap(),
            Err(BridgeError::Rpc {
                code: "BAD_PARAMS".into(),
                message: "no message".into()
            })
        );
    }

    #[tokio::test]
    async fn timeout_retires_call_and_late_result_is_returned() {
        let correlator = Arc::new(Correlator::new());
        let sink = Arc::new(RecordingSink::default());
        let started = Instant::now();
        let result = correlator
            .call(sink.as_ref(), "slow", json!({}), Duration::from_millis(50))
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(BridgeError::Timeout { ref method, .. }) if method == "slow"));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1000));
        assert_eq!(correlator.pending_count(), 0);

        let id = sink.frames.lock().unwrap()[0].id.clone();
        let late = ResponseFrame::ok(id, json!("too late"));
        assert_eq!(correlator.resolve(late.clone()), Some(late));
    }

    #[tokio::test]
    async fn fail_all_rejects_every_outstanding_call() {
        let correlator = Arc::new(Correlator::new());
        let sink = Arc::new(RecordingSink::default());
        let calls: Vec<_> = (0..5)
            .map(|_| spawn_call(&correlator, &sink, "wait", Duration::from_secs(30)))
            .collect();
        sink.wait_for_calls(5).await;

        assert_eq!(correlator.fail_all("gateway exited"), 5);
        for call in calls {
            let result = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .expect("call left pending")
                .unwrap();
            assert_eq!(result, Err(BridgeError::closed("gateway exited")));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let correlator = Arc::new(Correlator::new());
        let sink = Arc::new(RecordingSink::default());
        let calls: Vec<_> = (0..50)
            .map(|_| spawn_call(&correlator, &sink, "x", Duration::from_secs(30)))
            .collect();
        let sent = sink.wait_for_calls(50).await;
        let mut ids: Vec<_> = sent.iter().map(|f| f.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 50);
        correlator.fail_all("done");
        for call in calls {
            let _ = call.await;
        }
    }

    #[tokio::test]
    async fn shared_counter_never_repeats_ids() {
        let ids = Arc::new(AtomicU64::new(0));
        let sink = RecordingSink::default();
        for _ in 0..2 {
            let correlator = Correlator::sharing(ids.clone());
            let _ = correlator
                .call(&sink, "ping", json!({}), Duration::from_millis(1))
                .await;
        }
        let sent = sink.frames.lock().unwrap().clone();
        assert_eq!(sent[0].id, "c-1");
        assert_eq!(sent[1].id, "c-2");
    }

    #[tokio::test]
    async fn send_failure_is_transport_closed() {
        let correlator = Correlator::new();
        let sink = RecordingSink {
            broken: true,
            ..Default::default()
        };
        let result = correlator
            .call(&sink, "ping", json!({}), Duration::from_secs(5))
            .await;
        assert_eq!(result, Err(BridgeError::closed("broken pipe")));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_call_retires_its_id() {
        let correlator = Arc::new(Correlator::new());
        let sink = Arc::new(RecordingSink::default());
        let call = spawn_call(&correlator, &sink, "ping", Duration::from_secs(30));
        sink.wait_for_calls(1).await;
        assert_eq!(correlator.pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(correlator.pending_count(), 0);
    }
}
