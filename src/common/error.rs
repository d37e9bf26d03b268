//! Error types for the debug proxy
//!
//! Errors fall into three tiers: per-module load failures (logged and
//! skipped by the store), per-command failures (answered with an error result
//! to the caller) and pump failures (fatal to the proxied connection pair).

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the debug proxy
#[derive(Error, Debug)]
pub enum Error {
    // === Connection Errors ===
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Runtime connection closed before the command completed")]
    RuntimeDisconnected,

    #[error("Handler task failed: {0}")]
    TaskFailed(String),

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid source id '{0}'")]
    InvalidSourceId(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Command '{method}' failed: {message}")]
    CommandFailed { method: String, message: String },

    // === Session Errors ===
    #[error("Invalid session '{0}'")]
    InvalidSession(String),

    #[error("No call stack available, the runtime is not paused")]
    NoCallStack,

    #[error("Could not find scope with id #{0}")]
    ScopeNotFound(u32),

    // === Metadata Errors ===
    #[error("Invalid module image: {0}")]
    Metadata(String),

    #[error("Failed to fetch '{url}': {error}")]
    Fetch { url: String, error: String },

    #[error("Assembly '{0}' not found")]
    AssemblyNotFound(String),

    #[error("Type '{0}' not found")]
    TypeNotFound(String),

    #[error("Method '{type_name}:{method}' not found")]
    MethodNotFound { type_name: String, method: String },

    // === Evaluation Errors ===
    #[error("Unable to evaluate expression: {0}")]
    Evaluation(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a command failed error
    pub fn command_failed(method: &str, message: &str) -> Self {
        Self::CommandFailed {
            method: method.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a metadata error
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata(message.into())
    }

    /// Create a method not found error
    pub fn method_not_found(type_name: &str, method: &str) -> Self {
        Self::MethodNotFound {
            type_name: type_name.to_string(),
            method: method.to_string(),
        }
    }

    /// Whether this error only concerns the command that produced it
    ///
    /// These are answered with an error result; anything else tears down the
    /// connection pair.
    pub fn is_command_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidSession(_)
                | Error::NoCallStack
                | Error::ScopeNotFound(_)
                | Error::InvalidSourceId(_)
                | Error::InvalidArguments(_)
                | Error::CommandFailed { .. }
                | Error::AssemblyNotFound(_)
                | Error::TypeNotFound(_)
                | Error::MethodNotFound { .. }
                | Error::Evaluation(_)
        )
    }
}

/// Serializable error payload for inspector-protocol error responses
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProtocolError {
    pub code: i64,
    pub message: String,
}

/// Generic server error code used by the inspector protocol
pub const SERVER_ERROR: i64 = -32000;
/// Invalid params error code
pub const INVALID_PARAMS: i64 = -32602;

impl From<&Error> for ProtocolError {
    fn from(e: &Error) -> Self {
        let code = match e {
            Error::InvalidArguments(_) | Error::InvalidSourceId(_) => INVALID_PARAMS,
            _ => SERVER_ERROR,
        };

        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<ProtocolError> for serde_json::Value {
    fn from(e: ProtocolError) -> Self {
        serde_json::json!({ "code": e.code, "message": e.message })
    }
}
