//! Inspector protocol message types
//!
//! Messages are JSON objects shaped as commands `{id, sessionId?, method, params}`,
//! responses `{id, sessionId?, result | error}` and events
//! `{sessionId?, method, params}`. Only the fields the proxy interprets are
//! typed; everything else rides along as a `Value`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::common::error::ProtocolError;

/// Identity of one inspector session
///
/// `None` is the implicit session used when the front end does not attach to
/// targets with flattened session ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SessionId(Option<String>);

impl SessionId {
    pub fn new(id: Option<String>) -> Self {
        Self(id.filter(|s| !s.is_empty()))
    }

    /// The implicit session
    pub fn implicit() -> Self {
        Self(None)
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(Some(id.to_string()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(id) => f.write_str(id),
            None => f.write_str("<implicit>"),
        }
    }
}

/// Correlation key of a command and its response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub session: SessionId,
    pub id: i64,
}

impl MessageId {
    pub fn new(session: SessionId, id: i64) -> Self {
        Self { session, id }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.id)
    }
}

/// Outcome of a command: a result payload or an error payload, never both
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Ok(Value),
    Err(Value),
}

impl CommandResult {
    /// Successful result with an empty object payload
    pub fn empty() -> Self {
        Self::Ok(json!({}))
    }

    /// Build from the `result`/`error` members of a response
    ///
    /// An error member wins when both are present.
    pub fn from_parts(result: Option<Value>, error: Option<Value>) -> Self {
        match (result, error) {
            (_, Some(error)) => Self::Err(error),
            (Some(result), None) => Self::Ok(result),
            (None, None) => Self::Ok(json!({})),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Self::Err(_))
    }

    /// The payload, whichever side it is on
    pub fn value(&self) -> &Value {
        match self {
            Self::Ok(v) | Self::Err(v) => v,
        }
    }

    /// Payload of a successful result
    pub fn ok_value(&self) -> Option<&Value> {
        match self {
            Self::Ok(v) => Some(v),
            Self::Err(_) => None,
        }
    }

    /// `result.value` of a successful `Runtime.evaluate` result
    pub fn runtime_value(&self) -> Option<&Value> {
        self.ok_value()
            .and_then(|v| v.get("result"))
            .and_then(|r| r.get("value"))
    }

    /// Human readable error message, if this is an error
    pub fn error_text(&self) -> Option<String> {
        match self {
            Self::Ok(_) => None,
            Self::Err(e) => Some(
                e.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string()),
            ),
        }
    }
}

impl From<&crate::common::Error> for CommandResult {
    fn from(e: &crate::common::Error) -> Self {
        Self::Err(ProtocolError::from(e).into())
    }
}

/// Any message as it appears on the wire
///
/// The shape decides the kind: an `id` with a `method` is a command, an `id`
/// without one is a response, and no `id` is an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// A classified inbound message
#[derive(Debug, Clone)]
pub enum Message {
    Command {
        id: MessageId,
        method: String,
        params: Value,
    },
    Response {
        id: MessageId,
        result: CommandResult,
    },
    Event {
        session: SessionId,
        method: String,
        params: Value,
    },
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Self {
        let session = SessionId::new(raw.session_id);
        let params = raw.params.unwrap_or_else(|| json!({}));
        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Message::Command {
                id: MessageId::new(session, id),
                method,
                params,
            },
            (Some(id), None) => Message::Response {
                id: MessageId::new(session, id),
                result: CommandResult::from_parts(raw.result, raw.error),
            },
            (None, method) => Message::Event {
                session,
                method: method.unwrap_or_default(),
                params,
            },
        }
    }
}

// === Typed parameters of intercepted methods ===

/// `Runtime.evaluate` parameters used for sandbox commands
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    pub expression: String,
    pub object_group: &'static str,
    pub include_command_line_api: bool,
    pub silent: bool,
    pub return_by_value: bool,
}

impl EvaluateParams {
    pub fn new(expression: String) -> Self {
        Self {
            expression,
            object_group: "mono_debugger",
            include_command_line_api: false,
            silent: false,
            return_by_value: true,
        }
    }
}

/// `Runtime.executionContextCreated` event
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionContextCreated {
    pub context: ExecutionContextDescription,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDescription {
    pub id: i64,
    #[serde(default)]
    pub aux_data: Option<Value>,
}

impl ExecutionContextDescription {
    /// Whether the context is the page's default context
    pub fn is_default(&self) -> bool {
        self.aux_data
            .as_ref()
            .and_then(|a| a.get("isDefault"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// `Runtime.consoleAPICalled` event
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleApiCalled {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl ConsoleApiCalled {
    /// String value of the n-th console argument
    pub fn arg_str(&self, n: usize) -> Option<&str> {
        self.args.get(n)?.get("value")?.as_str()
    }
}

/// `Debugger.paused` event, with call frames left untyped
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paused {
    #[serde(default)]
    pub call_frames: Vec<Value>,
}

impl Paused {
    /// Function name of the top call frame
    pub fn top_function(&self) -> Option<&str> {
        self.call_frames.first()?.get("functionName")?.as_str()
    }
}

/// `Debugger.setBreakpointByUrl` parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointByUrl {
    pub line_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// `Dotnet-test.setBreakpointByMethod` parameters
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointByMethod {
    pub assembly_name: Option<String>,
    pub type_name: Option<String>,
    pub method_name: Option<String>,
}

/// `Debugger.removeBreakpoint` parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveBreakpoint {
    pub breakpoint_id: String,
}

/// `Debugger.evaluateOnCallFrame` parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateOnCallFrame {
    pub call_frame_id: String,
    pub expression: String,
}

/// Parameters carrying a remote object id
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdParams {
    pub object_id: String,
}

/// `Debugger.getScriptSource` parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetScriptSource {
    pub script_id: String,
}

/// `Runtime.compileScript` parameters
#[derive(Debug, Clone, Deserialize)]
pub struct CompileScript {
    #[serde(default)]
    pub expression: String,
}

/// `Debugger.getPossibleBreakpoints` parameters
#[derive(Debug, Clone, Deserialize)]
pub struct GetPossibleBreakpoints {
    pub start: Value,
    #[serde(default)]
    pub end: Option<Value>,
}

/// `Debugger.scriptParsed` event, only the url matters
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptParsed {
    #[serde(default)]
    pub url: String,
}

/// Decode typed parameters, mapping failures to an invalid-arguments error
pub fn parse_params<T: serde::de::DeserializeOwned>(method: &str, params: &Value) -> crate::Result<T> {
    serde_json::from_value(params.clone())
        .map_err(|e| crate::Error::InvalidArguments(format!("{method}: {e}")))
}
