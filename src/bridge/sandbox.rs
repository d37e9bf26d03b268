//! Commands evaluated inside the sandboxed runtime
//!
//! Every command is a JavaScript expression calling one of the runtime's
//! debugger entry points, sent as `Runtime.evaluate` with results returned by
//! value.

use serde_json::{json, Value};

use crate::cdp::{CommandResult, EvaluateParams, SessionId};
use crate::common::Result;
use crate::relay::Relay;
use crate::store::VarInfo;

/// Single-stepping mode understood by the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Into = 0,
    Out = 1,
    Over = 2,
}

impl StepKind {
    /// Step kind of a `Debugger.step*` method
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "Debugger.stepInto" => Some(StepKind::Into),
            "Debugger.stepOut" => Some(StepKind::Out),
            "Debugger.stepOver" => Some(StepKind::Over),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum SandboxCommand<'a> {
    GetCallStack,
    IsRuntimeReady,
    StartSingleStepping(StepKind),
    GetLoadedFiles,
    ClearAllBreakpoints,
    GetScopeVariables { scope: u32, vars: &'a [VarInfo] },
    SetBreakpoint { assembly: &'a str, method_token: u32, offset: u32 },
    RemoveBreakpoint(i64),
    GetDetails { object_id: &'a str, args: &'a Value },
    ReleaseObject(&'a str),
    CallFunctionOn(&'a Value),
}

impl SandboxCommand<'_> {
    pub fn expression(&self) -> String {
        match self {
            SandboxCommand::GetCallStack => "MONO.mono_wasm_get_call_stack()".to_string(),
            SandboxCommand::IsRuntimeReady => "MONO.mono_wasm_runtime_is_ready".to_string(),
            SandboxCommand::StartSingleStepping(kind) => {
                format!("MONO.mono_wasm_start_single_stepping ({})", *kind as i32)
            }
            SandboxCommand::GetLoadedFiles => "MONO.mono_wasm_get_loaded_files()".to_string(),
            SandboxCommand::ClearAllBreakpoints => {
                "MONO.mono_wasm_clear_all_breakpoints()".to_string()
            }
            SandboxCommand::GetScopeVariables { scope, vars } => {
                let ids: Vec<Value> = vars
                    .iter()
                    .map(|v| json!({"index": v.index, "name": v.name}))
                    .collect();
                format!(
                    "MONO.mono_wasm_get_variables({}, {})",
                    scope,
                    Value::Array(ids)
                )
            }
            SandboxCommand::SetBreakpoint {
                assembly,
                method_token,
                offset,
            } => format!(
                "MONO.mono_wasm_set_breakpoint ({}, {}, {})",
                Value::from(*assembly),
                method_token,
                offset
            ),
            SandboxCommand::RemoveBreakpoint(id) => {
                format!("MONO.mono_wasm_remove_breakpoint({})", id)
            }
            SandboxCommand::GetDetails { object_id, args } => {
                format!("MONO.mono_wasm_get_details({}, {})", Value::from(*object_id), args)
            }
            SandboxCommand::ReleaseObject(object_id) => {
                format!("MONO.mono_wasm_release_object({})", Value::from(*object_id))
            }
            SandboxCommand::CallFunctionOn(args) => {
                format!("MONO.mono_wasm_call_function_on ({})", args)
            }
        }
    }
}

/// Evaluate a sandbox command in `session`
///
/// An evaluation that throws inside the page comes back as a successful
/// `Runtime.evaluate` carrying `exceptionDetails`; it is reported as an error.
pub async fn send(relay: &Relay, session: &SessionId, command: SandboxCommand<'_>) -> Result<CommandResult> {
    let expression = command.expression();
    tracing::debug!(%session, expression, "sandbox command");

    let params = serde_json::to_value(EvaluateParams::new(expression))?;
    let result = relay.send_command(session, "Runtime.evaluate", params).await?;

    Ok(match result {
        CommandResult::Ok(value) => match value.get("exceptionDetails") {
            Some(details) => CommandResult::Err(details.clone()),
            None => CommandResult::Ok(value),
        },
        err => err,
    })
}
