//! Source and breakpoint location model
//!
//! Locations exchanged with the front end are 0-based, as the browser
//! inspector expects. Sequence points in symbol files are 1-based; the
//! conversion happens once, when a [`SourceLocation`] is built from a point.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};

use crate::cdp::SetBreakpointByUrl;
use crate::common::{Error, Result};
use crate::store::{MethodInfo, SequencePoint, SourceFile};

/// Scheme of the script ids and urls given to managed documents
pub const SCHEME: &str = "dotnet://";

/// Stable identity of a document: `dotnet://{assembly}_{document}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId {
    pub assembly: u32,
    pub document: u32,
}

impl SourceId {
    pub fn new(assembly: u32, document: u32) -> Self {
        Self { assembly, document }
    }

    /// Whether a script id names a managed document
    pub fn is_source_id(script_id: &str) -> bool {
        script_id.starts_with(SCHEME)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}_{}", SCHEME, self.assembly, self.document)
    }
}

impl FromStr for SourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidSourceId(s.to_string());
        let rest = s.strip_prefix(SCHEME).ok_or_else(invalid)?;
        let (assembly, document) = rest.split_once('_').ok_or_else(invalid)?;
        Ok(Self {
            assembly: assembly.parse().map_err(|_| invalid())?,
            document: document.parse().map_err(|_| invalid())?,
        })
    }
}

/// Position in the managed code a location came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliLocation {
    pub assembly: String,
    pub method_token: u32,
    pub offset: u32,
}

/// A 0-based position in a managed document
///
/// Equality and hashing only look at the document, line and column.
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub id: SourceId,
    pub line: u32,
    pub column: u32,
    pub cli: Option<CliLocation>,
}

impl SourceLocation {
    pub fn new(id: SourceId, line: u32, column: u32) -> Self {
        Self {
            id,
            line,
            column,
            cli: None,
        }
    }

    /// Start of a sequence point inside `method`
    pub fn at_point(method: &MethodInfo, point: &SequencePoint) -> Self {
        Self {
            id: SourceId::new(method.assembly_id, point.document),
            line: point.start_line.saturating_sub(1),
            column: point.start_column.saturating_sub(1),
            cli: Some(CliLocation {
                assembly: method.assembly_name.clone(),
                method_token: method.token,
                offset: point.offset,
            }),
        }
    }

    /// End of a sequence point inside `method`
    pub fn at_point_end(method: &MethodInfo, point: &SequencePoint) -> Self {
        Self {
            line: point.end_line.saturating_sub(1),
            column: point.end_column.saturating_sub(1),
            ..Self::at_point(method, point)
        }
    }

    /// Inspector `Location` object
    pub fn as_location(&self) -> Value {
        json!({
            "scriptId": self.id.to_string(),
            "lineNumber": self.line,
            "columnNumber": self.column,
        })
    }

    /// Parse an inspector `Location`
    ///
    /// Returns `Ok(None)` for locations in ordinary scripts and an error for a
    /// managed script id that does not parse.
    pub fn from_protocol(location: &Value) -> Result<Option<Self>> {
        let Some(script_id) = location.get("scriptId").and_then(Value::as_str) else {
            return Ok(None);
        };
        if !SourceId::is_source_id(script_id) {
            return Ok(None);
        }
        let id = script_id.parse()?;
        let line = location
            .get("lineNumber")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let column = location
            .get("columnNumber")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        Ok(Some(Self::new(id, line, column)))
    }

    /// Whether this location lies within `[start, end]`
    pub fn is_between(&self, start: &SourceLocation, end: &SourceLocation) -> bool {
        (self.line, self.column) >= (start.line, start.column)
            && (self.line, self.column) <= (end.line, end.column)
    }
}

impl PartialEq for SourceLocation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.line == other.line && self.column == other.column
    }
}

impl Eq for SourceLocation {}

impl Hash for SourceLocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.line.hash(state);
        self.column.hash(state);
    }
}

/// State of one armed location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointState {
    Pending,
    Active,
    Disabled,
}

/// One concrete location a breakpoint request resolved to
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub request_id: String,
    pub location: SourceLocation,
    /// Id assigned by the sandbox once armed
    pub remote_id: Option<i64>,
    pub state: BreakpointState,
}

impl Breakpoint {
    pub fn new(request_id: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            request_id: request_id.into(),
            location,
            remote_id: None,
            state: BreakpointState::Pending,
        }
    }

    /// Parameters of the `Debugger.breakpointResolved` event for this location
    pub fn resolved_event(&self) -> Value {
        json!({
            "breakpointId": self.request_id,
            "location": self.location.as_location(),
        })
    }
}

/// A breakpoint as the front end asked for it
///
/// Keeps the original arguments so the request can be replayed against a new
/// execution context after a reload.
#[derive(Debug, Clone)]
pub struct BreakpointRequest {
    pub id: String,
    pub args: SetBreakpointByUrl,
    url_regex: Option<Regex>,
    /// Assembly and document name once matched against a loaded document
    pub assembly: Option<String>,
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    pub locations: Vec<Breakpoint>,
    /// Set while a resolution is in flight
    pub resolving: bool,
}

impl BreakpointRequest {
    pub fn new(id: impl Into<String>, args: SetBreakpointByUrl) -> Result<Self> {
        let url_regex = args
            .url_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::InvalidArguments(format!("urlRegex: {e}")))?;

        Ok(Self {
            id: id.into(),
            line: args.line_number,
            column: args.column_number.unwrap_or(0),
            args,
            url_regex,
            assembly: None,
            file: None,
            locations: Vec::new(),
            resolving: false,
        })
    }

    /// Whether the request targets `file`
    ///
    /// An exact url takes precedence; the regex is only consulted when the
    /// request has no url.
    pub fn is_match(&self, file: &SourceFile) -> bool {
        if let Some(url) = &self.args.url {
            return *url == file.url || *url == file.dotnet_url;
        }
        match &self.url_regex {
            Some(re) => re.is_match(&file.url) || re.is_match(&file.doc_url),
            None => false,
        }
    }

    /// Bind the request to the first matching document
    pub fn try_resolve<'a>(
        &mut self,
        mut sources: impl Iterator<Item = &'a Arc<SourceFile>>,
    ) -> bool {
        match sources.find(|file| self.is_match(file)) {
            Some(file) => {
                self.assembly = Some(file.assembly_name.clone());
                self.file = Some(file.debugger_file_name.clone());
                true
            }
            None => false,
        }
    }

    /// Copy of the request as the front end made it, before any resolution
    pub fn replay(&self) -> Self {
        Self {
            assembly: None,
            file: None,
            locations: Vec::new(),
            resolving: false,
            ..self.clone()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.assembly.is_some() && self.file.is_some()
    }

    /// Locations currently armed in the sandbox
    pub fn active(&self) -> impl Iterator<Item = &Breakpoint> {
        self.locations
            .iter()
            .filter(|bp| bp.state == BreakpointState::Active)
    }

    /// Response body of `Debugger.setBreakpointByUrl`
    pub fn as_response(&self) -> Value {
        json!({
            "breakpointId": self.id,
            "locations": self.locations.iter().map(|bp| bp.location.as_location()).collect::<Vec<_>>(),
        })
    }
}

/// One frame of a reconstructed managed call stack
#[derive(Debug, Clone)]
pub struct Frame {
    pub method: Arc<MethodInfo>,
    pub location: SourceLocation,
    /// Index used to address the frame's scope during this pause
    pub id: u32,
}

/// Remote object ids minted by the proxy and the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectId {
    /// Local scope of frame N
    Scope(u32),
    Object(String),
    Array(String),
    ValueType(String),
    /// Result of a function called on an object
    CallFunctionResult(String),
}

impl ObjectId {
    const PREFIX: &'static str = "dotnet:";

    /// Parse a `dotnet:{kind}:{value}` id; other ids are not ours
    pub fn parse(id: &str) -> Option<Self> {
        let rest = id.strip_prefix(Self::PREFIX)?;
        let (kind, value) = rest.split_once(':')?;
        let value = value.to_string();
        match kind {
            "scope" => value.parse().ok().map(ObjectId::Scope),
            "object" => Some(ObjectId::Object(value)),
            "array" => Some(ObjectId::Array(value)),
            "valuetype" => Some(ObjectId::ValueType(value)),
            "cfo_res" => Some(ObjectId::CallFunctionResult(value)),
            _ => None,
        }
    }

    pub fn scope(frame: u32) -> String {
        ObjectId::Scope(frame).to_string()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, value) = match self {
            ObjectId::Scope(n) => ("scope", n.to_string()),
            ObjectId::Object(v) => ("object", v.clone()),
            ObjectId::Array(v) => ("array", v.clone()),
            ObjectId::ValueType(v) => ("valuetype", v.clone()),
            ObjectId::CallFunctionResult(v) => ("cfo_res", v.clone()),
        };
        write!(f, "{}{}:{}", Self::PREFIX, kind, value)
    }
}
