//! Inspector protocol wire codec
//!
//! Every protocol message travels as one WebSocket text frame holding a JSON
//! object. Binary frames are accepted as UTF-8 text; ping/pong frames are
//! handled by the WebSocket layer and surface here as [`Frame::Ignored`].

use serde_json::Value;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::common::{Error, Result};

use super::types::{CommandResult, Message, MessageId, RawMessage, SessionId};

/// What a WebSocket frame turned out to be
#[derive(Debug)]
pub enum Frame {
    /// A protocol message
    Message(Message),
    /// The peer asked to close the connection
    Close,
    /// Control frames and anything else that carries no protocol message
    Ignored,
}

/// Decode a WebSocket frame
pub fn decode(frame: WsMessage) -> Result<Frame> {
    let text = match frame {
        WsMessage::Text(text) => text.as_str().to_string(),
        WsMessage::Binary(bytes) => String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Protocol(format!("Invalid UTF-8: {}", e)))?,
        WsMessage::Close(_) => return Ok(Frame::Close),
        _ => return Ok(Frame::Ignored),
    };

    tracing::trace!("<<< {}", text);
    let raw: RawMessage = serde_json::from_str(&text)
        .map_err(|e| Error::Protocol(format!("Invalid JSON message: {}", e)))?;
    Ok(Frame::Message(raw.into()))
}

fn encode(raw: &RawMessage) -> Result<WsMessage> {
    let json = serde_json::to_string(raw)?;
    tracing::trace!(">>> {}", json);
    Ok(WsMessage::text(json))
}

fn session_field(session: &SessionId) -> Option<String> {
    session.as_deref().map(str::to_string)
}

/// Encode a command addressed to the runtime
pub fn encode_command(id: &MessageId, method: &str, params: Value) -> Result<WsMessage> {
    encode(&RawMessage {
        id: Some(id.id),
        session_id: session_field(&id.session),
        method: Some(method.to_string()),
        params: Some(params),
        ..Default::default()
    })
}

/// Encode an event addressed to the front end
pub fn encode_event(session: &SessionId, method: &str, params: Value) -> Result<WsMessage> {
    encode(&RawMessage {
        session_id: session_field(session),
        method: Some(method.to_string()),
        params: Some(params),
        ..Default::default()
    })
}

/// Encode a response addressed to the front end
pub fn encode_response(id: &MessageId, result: &CommandResult) -> Result<WsMessage> {
    let (result, error) = match result {
        CommandResult::Ok(v) => (Some(v.clone()), None),
        CommandResult::Err(e) => (None, Some(e.clone())),
    };
    encode(&RawMessage {
        id: Some(id.id),
        session_id: session_field(&id.session),
        result,
        error,
        ..Default::default()
    })
}
