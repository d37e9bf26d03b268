//! Read loop driving one proxied connection pair

use std::sync::Arc;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

use crate::cdp::codec::{self, Frame};
use crate::cdp::Message;
use crate::common::{Error, Result};

use super::{Interceptor, Relay};

/// Outcome of reading one frame from a peer
enum Inbound {
    Message(Message),
    Closed,
    Skip,
}

fn read_frame(item: Option<std::result::Result<WsMessage, WsError>>) -> Result<Inbound> {
    match item {
        None => Ok(Inbound::Closed),
        Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Ok(Inbound::Closed),
        Some(Err(e)) => Err(e.into()),
        Some(Ok(frame)) => Ok(match codec::decode(frame)? {
            Frame::Message(message) => Inbound::Message(message),
            Frame::Close => Inbound::Closed,
            Frame::Ignored => Inbound::Skip,
        }),
    }
}

/// Drain an outbound queue into a socket, one write at a time
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut queue: mpsc::UnboundedReceiver<WsMessage>,
    peer: &'static str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = queue.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!(peer, "write failed: {}", e);
            return Err(e.into());
        }
    }
    Ok(())
}

/// Relay messages between `frontend` and `runtime` until either side closes
///
/// Commands and events are dispatched to concurrent handler tasks so a slow
/// interceptor never blocks the read loop. A failing handler or writer tears
/// down the pair; every command still waiting for a runtime response is then
/// failed.
#[tracing::instrument(skip_all)]
pub async fn run<F, R, I>(
    frontend: WebSocketStream<F>,
    runtime: WebSocketStream<R>,
    interceptor: Arc<I>,
) -> Result<()>
where
    F: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    I: Interceptor,
{
    let (relay, queues) = Relay::channel();
    let (frontend_sink, mut frontend_stream) = frontend.split();
    let (runtime_sink, mut runtime_stream) = runtime.split();

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(write_loop(frontend_sink, queues.frontend, "front end"));
    tasks.spawn(write_loop(runtime_sink, queues.runtime, "runtime"));

    let outcome = loop {
        tokio::select! {
            item = frontend_stream.next() => match read_frame(item) {
                Ok(Inbound::Message(message)) => {
                    on_frontend_message(&relay, &interceptor, &mut tasks, message)
                }
                Ok(Inbound::Skip) => {}
                Ok(Inbound::Closed) => {
                    tracing::info!("Front end closed the connection");
                    break Ok(());
                }
                Err(e) => break Err(e),
            },
            item = runtime_stream.next() => match read_frame(item) {
                Ok(Inbound::Message(message)) => {
                    on_runtime_message(&relay, &interceptor, &mut tasks, message)
                }
                Ok(Inbound::Skip) => {}
                Ok(Inbound::Closed) => {
                    tracing::info!("Runtime closed the connection");
                    break Ok(());
                }
                Err(e) => break Err(e),
            },
            Some(joined) = tasks.join_next() => match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Handler failed: {}", e);
                    break Err(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => break Err(Error::TaskFailed(e.to_string())),
            },
        }
    };

    tasks.abort_all();
    relay.fail_pending();
    outcome
}

fn on_frontend_message<I: Interceptor>(
    relay: &Relay,
    interceptor: &Arc<I>,
    tasks: &mut JoinSet<Result<()>>,
    message: Message,
) {
    match message {
        Message::Command { id, method, params } => {
            let relay = relay.clone();
            let interceptor = Arc::clone(interceptor);
            tasks.spawn(async move {
                if interceptor
                    .accept_command(&relay, &id, &method, &params)
                    .await?
                {
                    return Ok(());
                }
                let result = relay.send_command(&id.session, &method, params).await?;
                relay.send_response(&id, result);
                Ok(())
            });
        }
        Message::Response { id, .. } => {
            tracing::warn!(%id, "Ignoring response sent by the front end");
        }
        Message::Event { method, .. } => {
            tracing::warn!(method, "Ignoring event sent by the front end");
        }
    }
}

fn on_runtime_message<I: Interceptor>(
    relay: &Relay,
    interceptor: &Arc<I>,
    tasks: &mut JoinSet<Result<()>>,
    message: Message,
) {
    match message {
        Message::Response { id, result } => {
            if !relay.complete(&id, result) {
                tracing::warn!(%id, "Response for unknown command");
            }
        }
        Message::Event {
            session,
            method,
            params,
        } => {
            let relay = relay.clone();
            let interceptor = Arc::clone(interceptor);
            tasks.spawn(async move {
                if !interceptor
                    .accept_event(&relay, &session, &method, &params)
                    .await?
                {
                    relay.send_event(&session, &method, params);
                }
                Ok(())
            });
        }
        Message::Command { id, method, .. } => {
            tracing::warn!(%id, method, "Ignoring command sent by the runtime");
        }
    }
}
