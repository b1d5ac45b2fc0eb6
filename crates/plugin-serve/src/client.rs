//! Host-side client: connects to an announced plugin and multiplexes calls
//! over the session by call id.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{CallEnvelope, CallId, Request, Response};
use crate::bridge::transport::{self, Session, SessionReader, SessionWriter, TransportError};
use crate::call::CallError;
use crate::handshake::HandshakeRecord;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session write failed: {0}")]
    Io(#[from] io::Error),

    #[error("plugin closed the session")]
    Disconnected,

    #[error("call id {0} is already pending")]
    DuplicateId(CallId),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Call(#[from] CallError),
}

type CallReply = Result<serde_json::Value, CallError>;
type PendingCalls = Arc<StdMutex<HashMap<CallId, oneshot::Sender<CallReply>>>>;
type RequestWriter = Arc<tokio::sync::Mutex<FramedWrite<SessionWriter, JsonCodec<Request>>>>;

/// A call that has been sent and awaits its response.
#[derive(Debug)]
pub struct PendingCall {
    id: CallId,
    rx: oneshot::Receiver<CallReply>,
}

impl PendingCall {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub async fn wait(self) -> Result<serde_json::Value, ClientError> {
        match self.rx.await {
            Ok(reply) => reply.map_err(ClientError::Call),
            Err(_) => Err(ClientError::Disconnected),
        }
    }
}

pub struct PluginClient {
    writer: RequestWriter,
    pending: PendingCalls,
    shutdown_ack: Arc<StdMutex<Option<oneshot::Sender<()>>>>,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl PluginClient {
    /// Connect to the endpoint a plugin announced.
    pub async fn connect(record: &HandshakeRecord) -> Result<Self, ClientError> {
        let session = transport::connect(record.network, &record.address).await?;
        Ok(Self::from_session(session))
    }

    pub fn from_session(session: Session) -> Self {
        let (reader, writer) = session.into_split();
        let pending: PendingCalls = Arc::new(StdMutex::new(HashMap::new()));
        let shutdown_ack = Arc::new(StdMutex::new(None));

        let reader_task = tokio::spawn(read_responses(
            reader,
            Arc::clone(&pending),
            Arc::clone(&shutdown_ack),
        ));

        Self {
            writer: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                writer,
                JsonCodec::new(),
            ))),
            pending,
            shutdown_ack,
            next_id: AtomicU64::new(1),
            reader_task,
        }
    }

    pub fn next_call_id(&self) -> CallId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a call and return without waiting for its response.
    pub async fn start_call(&self, envelope: CallEnvelope) -> Result<PendingCall, ClientError> {
        let id = envelope.id;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&id) {
                return Err(ClientError::DuplicateId(id));
            }
            pending.insert(id, tx);
        }

        if let Err(e) = self.send(Request::Call(envelope)).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        Ok(PendingCall { id, rx })
    }

    pub async fn call<P: Serialize>(
        &self,
        capability: &str,
        method: &str,
        payload: P,
    ) -> Result<serde_json::Value, ClientError> {
        let envelope = CallEnvelope::new(
            self.next_call_id(),
            capability,
            method,
            serde_json::to_value(payload)?,
        );
        self.start_call(envelope).await?.wait().await
    }

    pub async fn call_with_deadline<P: Serialize>(
        &self,
        capability: &str,
        method: &str,
        payload: P,
        deadline: Duration,
    ) -> Result<serde_json::Value, ClientError> {
        let envelope = CallEnvelope::new(
            self.next_call_id(),
            capability,
            method,
            serde_json::to_value(payload)?,
        )
        .with_deadline(deadline);
        self.start_call(envelope).await?.wait().await
    }

    pub async fn cancel(&self, id: CallId) -> Result<(), ClientError> {
        self.send(Request::Cancel { id }).await
    }

    /// Ask the plugin to stop and wait for its acknowledgement.
    ///
    /// Returns once the plugin answers `shutting_down` or drops the session.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slot) = self.shutdown_ack.lock() {
            *slot = Some(tx);
        }
        self.send(Request::Shutdown).await?;
        match rx.await {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::debug!("Session closed before shutdown acknowledgement");
                Ok(())
            }
        }
    }

    /// Close our end of the session.
    pub async fn close(self) -> Result<(), ClientError> {
        let mut w = self.writer.lock().await;
        w.close().await?;
        Ok(())
    }

    async fn send(&self, request: Request) -> Result<(), ClientError> {
        let mut w = self.writer.lock().await;
        w.send(request).await?;
        Ok(())
    }
}

impl Drop for PluginClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_responses(
    reader: SessionReader,
    pending: PendingCalls,
    shutdown_ack: Arc<StdMutex<Option<oneshot::Sender<()>>>>,
) {
    let mut reader = FramedRead::new(reader, JsonCodec::<Response>::new());
    loop {
        let response = match reader.next().await {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Failed to read plugin response");
                break;
            }
            None => {
                tracing::debug!("Plugin closed the session");
                break;
            }
        };

        let (id, reply) = match response {
            Response::Result { id, payload } => (id, Ok(payload)),
            Response::Error { id, kind, message } => (id, Err(CallError::new(kind, message))),
            Response::ShuttingDown => {
                if let Some(tx) = shutdown_ack.lock().ok().and_then(|mut s| s.take()) {
                    let _ = tx.send(());
                }
                continue;
            }
        };

        match lock(&pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::warn!(call_id = id, "Response for unknown call"),
        }
    }

    // Dropping the senders fails every waiter with Disconnected.
    lock(&pending).clear();
    if let Ok(mut slot) = shutdown_ack.lock() {
        slot.take();
    }
}

fn lock(
    pending: &PendingCalls,
) -> std::sync::MutexGuard<'_, HashMap<CallId, oneshot::Sender<CallReply>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::bridge::protocol::ErrorKind;

    /// A fake plugin on the other end of an in-memory duplex.
    fn pair() -> (
        PluginClient,
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, JsonCodec<Request>>,
        FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, JsonCodec<Response>>,
    ) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_r, near_w) = tokio::io::split(near);
        let (far_r, far_w) = tokio::io::split(far);
        let client = PluginClient::from_session(Session::new(near_r, near_w, "duplex"));
        (
            client,
            FramedRead::new(far_r, JsonCodec::new()),
            FramedWrite::new(far_w, JsonCodec::new()),
        )
    }

    #[tokio::test]
    async fn responses_are_matched_by_id() {
        let (client, mut plugin_rx, mut plugin_tx) = pair();

        let a = client
            .start_call(CallEnvelope::new(1, "EchoPlugin", "Echo", json!("a")))
            .await
            .unwrap();
        let b = client
            .start_call(CallEnvelope::new(2, "EchoPlugin", "Echo", json!("b")))
            .await
            .unwrap();

        for _ in 0..2 {
            plugin_rx.next().await.unwrap().unwrap();
        }
        // Answer out of order.
        plugin_tx
            .send(Response::Result { id: 2, payload: json!("b") })
            .await
            .unwrap();
        plugin_tx
            .send(Response::Error {
                id: 1,
                kind: ErrorKind::Execution,
                message: "nope".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(b.wait().await.unwrap(), json!("b"));
        match a.wait().await {
            Err(ClientError::Call(err)) => assert_eq!(err, CallError::execution("nope")),
            other => panic!("expected call error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_pending_id_is_refused() {
        let (client, _plugin_rx, _plugin_tx) = pair();
        let _first = client
            .start_call(CallEnvelope::new(5, "X", "Y", json!(null)))
            .await
            .unwrap();
        let err = client
            .start_call(CallEnvelope::new(5, "X", "Y", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::DuplicateId(5)));
    }

    #[tokio::test]
    async fn disconnect_fails_pending_calls() {
        let (client, plugin_rx, plugin_tx) = pair();
        let pending = client
            .start_call(CallEnvelope::new(1, "X", "Y", json!(null)))
            .await
            .unwrap();

        drop(plugin_rx);
        drop(plugin_tx);

        assert!(matches!(pending.wait().await, Err(ClientError::Disconnected)));
    }

    #[tokio::test]
    async fn shutdown_waits_for_acknowledgement() {
        let (client, mut plugin_rx, mut plugin_tx) = pair();

        let plugin = tokio::spawn(async move {
            let req = plugin_rx.next().await.unwrap().unwrap();
            assert_eq!(req, Request::Shutdown);
            plugin_tx.send(Response::ShuttingDown).await.unwrap();
        });

        client.shutdown().await.unwrap();
        plugin.await.unwrap();
    }

    #[tokio::test]
    async fn call_ids_increase() {
        let (client, _rx, _tx) = pair();
        let first = client.next_call_id();
        assert_eq!(client.next_call_id(), first + 1);
    }
}
