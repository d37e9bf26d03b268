//! Duplex message relay between the front end and the runtime
//!
//! The relay owns the two WebSocket connections of one proxied pair. Every
//! front-end command is re-issued to the runtime under a fresh id and its
//! response routed back under the original one. Events flow from the runtime
//! to the front end. An [`Interceptor`] sees each command and event first and
//! may handle it itself instead of having it forwarded.

mod pump;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::cdp::{codec, CommandResult, MessageId, SessionId};
use crate::common::{Error, Result};

pub use pump::run;

/// Hooks run before default forwarding
///
/// Returning `Ok(true)` means the hook fully handled the message, including
/// sending any response. An `Err` is fatal to the whole relay.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Inspect a command coming from the front end
    async fn accept_command(
        &self,
        _relay: &Relay,
        _id: &MessageId,
        _method: &str,
        _params: &Value,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Inspect an event coming from the runtime
    async fn accept_event(
        &self,
        _relay: &Relay,
        _session: &SessionId,
        _method: &str,
        _params: &Value,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Interceptor that forwards everything unmodified
pub struct PassThrough;

impl Interceptor for PassThrough {}

/// Receiving ends of the per-socket outbound queues
pub struct OutboundQueues {
    pub frontend: mpsc::UnboundedReceiver<WsMessage>,
    pub runtime: mpsc::UnboundedReceiver<WsMessage>,
}

struct Inner {
    /// Command ids, shared by all sessions of this pair
    next_id: AtomicI64,
    /// Commands sent to the runtime and waiting for a response
    pending: DashMap<MessageId, oneshot::Sender<CommandResult>>,
    frontend: mpsc::UnboundedSender<WsMessage>,
    runtime: mpsc::UnboundedSender<WsMessage>,
}

/// Cheaply clonable handle used to talk to both peers
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Relay {
    /// Create a relay handle and the queues its writers drain
    pub fn channel() -> (Self, OutboundQueues) {
        let (frontend_tx, frontend_rx) = mpsc::unbounded_channel();
        let (runtime_tx, runtime_rx) = mpsc::unbounded_channel();

        let relay = Self {
            inner: Arc::new(Inner {
                next_id: AtomicI64::new(1),
                pending: DashMap::new(),
                frontend: frontend_tx,
                runtime: runtime_tx,
            }),
        };

        (
            relay,
            OutboundQueues {
                frontend: frontend_rx,
                runtime: runtime_rx,
            },
        )
    }

    fn next_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a command to the runtime and wait for its response
    ///
    /// Fails with [`Error::RuntimeDisconnected`] if the relay shuts down
    /// before the response arrives.
    pub async fn send_command(
        &self,
        session: &SessionId,
        method: &str,
        params: Value,
    ) -> Result<CommandResult> {
        let id = MessageId::new(session.clone(), self.next_id());
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);

        let message = match codec::encode_command(&id, method, params) {
            Ok(message) => message,
            Err(e) => {
                self.inner.pending.remove(&id);
                return Err(e);
            }
        };

        tracing::debug!(%id, method, "sending command to runtime");
        if self.inner.runtime.send(message).is_err() {
            self.inner.pending.remove(&id);
            return Err(Error::RuntimeDisconnected);
        }

        rx.await.map_err(|_| Error::RuntimeDisconnected)
    }

    /// Send an event to the front end
    pub fn send_event(&self, session: &SessionId, method: &str, params: Value) {
        tracing::debug!(%session, method, "sending event to front end");
        match codec::encode_event(session, method, params) {
            Ok(message) => self.enqueue_frontend(message),
            Err(e) => tracing::warn!(method, "failed to encode event: {}", e),
        }
    }

    /// Send a response to the front end
    pub fn send_response(&self, id: &MessageId, result: CommandResult) {
        if let Some(error) = result.error_text() {
            tracing::debug!(%id, error, "sending error response to front end");
        }
        match codec::encode_response(id, &result) {
            Ok(message) => self.enqueue_frontend(message),
            Err(e) => tracing::warn!(%id, "failed to encode response: {}", e),
        }
    }

    fn enqueue_frontend(&self, message: WsMessage) {
        if self.inner.frontend.send(message).is_err() {
            tracing::debug!("front end queue closed, dropping message");
        }
    }

    /// Deliver a runtime response to the command waiting for it
    ///
    /// Returns false if no command with that id is pending.
    pub(crate) fn complete(&self, id: &MessageId, result: CommandResult) -> bool {
        match self.inner.pending.remove(id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Fail every pending command
    pub(crate) fn fail_pending(&self) {
        self.inner.pending.clear();
    }

    /// Number of commands still waiting for a response
    pub fn pending_commands(&self) -> usize {
        self.inner.pending.len()
    }
}
