//! RPC dispatcher: reads call frames from the session, runs each call on its
//! own task, and writes responses back through a single shared writer.
//!
//! Frames are read raw and decoded here rather than in the codec, so a
//! malformed body becomes an `invalid_request` response and the session
//! keeps going.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{JsonCodec, frame_codec, is_encode_error};
use crate::bridge::protocol::{CallEnvelope, CallId, Request, Response};
use crate::bridge::transport::{Session, SessionWriter};
use crate::call::{CallContext, CallError};
use crate::lifecycle::{Lifecycle, StopReason};
use crate::registry::{BoundMethod, Registry};

type ResponseWriter = Arc<tokio::sync::Mutex<FramedWrite<SessionWriter, JsonCodec<Response>>>>;

struct InFlight {
    /// Handed to the method through its `CallContext`.
    ctx: CancellationToken,
    /// Ends the call without waiting for the method to notice.
    abort: CancellationToken,
}

type InFlightCalls = Arc<StdMutex<HashMap<CallId, InFlight>>>;

/// Counters for one served session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Calls handed to a capability method.
    pub dispatched: usize,
    /// Dispatched calls that ran to a response.
    pub completed: usize,
    /// Dispatched calls dropped at the grace deadline.
    pub abandoned: usize,
    /// Frames answered with an error without dispatching.
    pub rejected: usize,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    lifecycle: Lifecycle,
    grace_period: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, lifecycle: Lifecycle) -> Self {
        Self {
            registry,
            lifecycle,
            grace_period: Duration::from_secs(5),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Serve calls until the host disconnects, the session fails, or the
    /// lifecycle enters `Stopping`. Then drain in-flight calls within the
    /// grace period and mark the lifecycle `Stopped`.
    pub async fn serve(&self, session: Session) -> DispatchSummary {
        let peer = session.peer().to_string();
        let (reader, writer) = session.into_split();
        let mut reader = FramedRead::new(reader, frame_codec());
        let writer: ResponseWriter =
            Arc::new(tokio::sync::Mutex::new(FramedWrite::new(writer, JsonCodec::new())));

        let stop = self.lifecycle.stop_token();
        let in_flight: InFlightCalls = Arc::new(StdMutex::new(HashMap::new()));
        let mut tasks = JoinSet::new();
        let mut summary = DispatchSummary::default();

        tracing::debug!(%peer, "Dispatch loop starting");

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    tracing::debug!("Stop requested, no longer reading calls");
                    break;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Call task failed");
                    }
                    summary.completed += 1;
                }

                frame = reader.next() => {
                    let bytes = match frame {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Session read failed");
                            self.lifecycle.request_stop(StopReason::TransportFault(e.to_string()));
                            break;
                        }
                        None => {
                            tracing::info!("Host closed the session");
                            self.lifecycle.request_stop(StopReason::PeerDisconnected);
                            break;
                        }
                    };

                    match serde_json::from_slice::<Request>(&bytes) {
                        Ok(Request::Call(envelope)) => {
                            match self.prepare_call(&envelope, &in_flight) {
                                Ok((method, ctx, abort)) => {
                                    summary.dispatched += 1;
                                    tasks.spawn(run_call(
                                        method,
                                        envelope,
                                        ctx,
                                        abort,
                                        Arc::clone(&writer),
                                        Arc::clone(&in_flight),
                                        self.lifecycle.clone(),
                                    ));
                                }
                                Err(err) => {
                                    summary.rejected += 1;
                                    tracing::debug!(
                                        call_id = envelope.id,
                                        capability = %envelope.capability,
                                        method = %envelope.method,
                                        kind = %err.kind,
                                        "Call rejected"
                                    );
                                    self.respond(&writer, err.into_response(envelope.id)).await;
                                }
                            }
                        }
                        Ok(Request::Cancel { id }) => {
                            let found = lock_calls(&in_flight).get(&id).map(|call| {
                                call.ctx.cancel();
                                call.abort.cancel();
                            });
                            match found {
                                Some(()) => tracing::debug!(call_id = id, "Cancel requested"),
                                None => {
                                    tracing::trace!(call_id = id, "Cancel for unknown call ignored")
                                }
                            }
                        }
                        Ok(Request::Shutdown) => {
                            tracing::info!("Shutdown requested by host");
                            let ack = tokio::time::timeout(
                                self.grace_period,
                                write_response(&writer, Response::ShuttingDown),
                            )
                            .await;
                            match ack {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    tracing::warn!(error = %e, "Shutdown acknowledgement failed")
                                }
                                Err(_) => tracing::warn!("Shutdown acknowledgement timed out"),
                            }
                            self.lifecycle.request_stop(StopReason::Requested);
                            break;
                        }
                        Err(e) => {
                            summary.rejected += 1;
                            let id = salvage_call_id(&bytes);
                            tracing::warn!(call_id = id, error = %e, "Malformed request frame");
                            let err = CallError::invalid_request(format!("malformed request: {e}"));
                            self.respond(&writer, err.into_response(id)).await;
                        }
                    }
                }
            }
        }

        drop(reader);
        let deadline = Instant::now() + self.grace_period;
        self.drain(&mut tasks, &mut summary, deadline).await;

        // An abandoned call may have left half a frame buffered for a host
        // that is not reading. Flushing it could block forever.
        if summary.abandoned == 0 {
            let closed = tokio::time::timeout_at(deadline, async {
                writer.lock().await.close().await
            })
            .await;
            match closed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::trace!(error = %e, "Session close failed"),
                Err(_) => tracing::warn!("Session close timed out, dropping it"),
            }
        }
        drop(writer);
        drop(tasks);

        self.lifecycle.mark_stopped();
        tracing::info!(
            dispatched = summary.dispatched,
            completed = summary.completed,
            abandoned = summary.abandoned,
            rejected = summary.rejected,
            "Dispatch finished"
        );
        summary
    }

    fn prepare_call(
        &self,
        envelope: &CallEnvelope,
        in_flight: &InFlightCalls,
    ) -> Result<(BoundMethod, CallContext, CancellationToken), CallError> {
        if self.lifecycle.state().is_stopping_or_stopped() {
            return Err(CallError::cancelled());
        }
        let method = self
            .registry
            .resolve(&envelope.capability, &envelope.method)?;

        let mut calls = lock_calls(in_flight);
        if calls.contains_key(&envelope.id) {
            return Err(CallError::invalid_request(format!(
                "call id {} is already in flight",
                envelope.id
            )));
        }
        let ctx_token = self.lifecycle.stop_token().child_token();
        let abort = CancellationToken::new();
        calls.insert(
            envelope.id,
            InFlight {
                ctx: ctx_token.clone(),
                abort: abort.clone(),
            },
        );
        let ctx = CallContext::new(envelope.id, ctx_token).with_timeout(envelope.deadline());
        Ok((method, ctx, abort))
    }

    /// Answer from the read loop. Gives up once a stop is requested, so a
    /// host that stopped reading cannot pin the loop.
    async fn respond(&self, writer: &ResponseWriter, response: Response) {
        let stop = self.lifecycle.stop_token();
        let response_id = response.call_id();
        let written = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::debug!(call_id = ?response_id, "Stopping, response dropped");
                return;
            }
            written = write_response(writer, response) => written,
        };
        if let Err(e) = written {
            tracing::error!(error = %e, "Failed to write response");
            self.lifecycle
                .request_stop(StopReason::TransportFault(e.to_string()));
        }
    }

    async fn drain(
        &self,
        tasks: &mut JoinSet<()>,
        summary: &mut DispatchSummary,
        deadline: Instant,
    ) {
        if tasks.is_empty() {
            return;
        }
        tracing::info!(
            in_flight = tasks.len(),
            grace_ms = self.grace_period.as_millis() as u64,
            "Waiting for in-flight calls"
        );

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Call task failed");
                }
                summary.completed += 1;
            }
        })
        .await;

        if drained.is_err() {
            summary.abandoned = tasks.len();
            tracing::warn!(
                abandoned = summary.abandoned,
                "Grace period elapsed, abandoning in-flight calls"
            );
            tasks.abort_all();
        }
    }
}

async fn run_call(
    method: BoundMethod,
    envelope: CallEnvelope,
    ctx: CallContext,
    abort: CancellationToken,
    writer: ResponseWriter,
    in_flight: InFlightCalls,
    lifecycle: Lifecycle,
) {
    let id = envelope.id;
    let deadline = ctx.deadline();
    tracing::trace!(
        call_id = id,
        capability = method.capability(),
        method = method.method(),
        "Call started"
    );

    let invocation = AssertUnwindSafe(method.invoke(envelope.payload, ctx)).catch_unwind();
    let bounded = async {
        match deadline {
            Some(at) => tokio::time::timeout_at(at, invocation)
                .await
                .unwrap_or_else(|_| Ok(Err(CallError::deadline_exceeded()))),
            None => invocation.await,
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = abort.cancelled() => Err(CallError::cancelled()),
        result = bounded => match result {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(&panic);
                tracing::error!(
                    call_id = id,
                    capability = method.capability(),
                    method = method.method(),
                    panic = %msg,
                    "Call panicked"
                );
                Err(CallError::internal(format!("call panicked: {msg}")))
            }
        },
    };

    // Free the id before answering so the host may reuse it right away.
    lock_calls(&in_flight).remove(&id);

    let response = match outcome {
        Ok(payload) => {
            tracing::trace!(call_id = id, method = method.method(), "Call succeeded");
            Response::Result { id, payload }
        }
        Err(err) => {
            tracing::debug!(
                call_id = id,
                method = method.method(),
                kind = %err.kind,
                error = %err.message,
                "Call failed"
            );
            err.into_response(id)
        }
    };

    if let Err(e) = write_response(&writer, response).await {
        tracing::error!(call_id = id, error = %e, "Failed to write response");
        lifecycle.request_stop(StopReason::TransportFault(e.to_string()));
    }
}

/// Write one frame. A response that cannot be encoded is replaced with an
/// `internal` error for the same call id.
async fn write_response(writer: &ResponseWriter, response: Response) -> io::Result<()> {
    let id = response.call_id();
    let mut w = writer.lock().await;
    match w.send(response).await {
        Err(e) if is_encode_error(&e) => {
            tracing::warn!(call_id = ?id, error = %e, "Response could not be encoded");
            let fallback = CallError::internal(format!("failed to encode response: {e}"))
                .into_response(id.unwrap_or(0));
            w.send(fallback).await
        }
        other => other,
    }
}

fn lock_calls(calls: &InFlightCalls) -> std::sync::MutexGuard<'_, HashMap<CallId, InFlight>> {
    calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Best-effort id from a frame that failed to decode as a request.
fn salvage_call_id(bytes: &[u8]) -> CallId {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
