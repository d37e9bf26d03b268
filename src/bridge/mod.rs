//! Debugging session bridge
//!
//! The bridge sits on the relay as its [`Interceptor`]. It tracks one
//! [`ExecutionContext`] per session, answers the inspector methods that
//! concern managed code from the debug metadata store and the sandbox, and
//! lets everything else pass through.

mod breakpoints;
mod context;
mod evaluate;
mod pause;
mod runtime;
pub mod sandbox;
mod scope;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::cdp::{CommandResult, MessageId, SessionId};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::relay::{Interceptor, Relay};
use crate::store::AssemblyLoader;

pub use context::ExecutionContext;
pub use evaluate::{ExpressionEvaluator, NoEvaluator};
pub use sandbox::{SandboxCommand, StepKind};

/// Interceptor translating between the front end and a managed runtime
pub struct Bridge {
    /// Contexts by session
    contexts: DashMap<SessionId, Arc<ExecutionContext>>,
    loader: Arc<dyn AssemblyLoader>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    config: Config,
    /// Counter for `by-method-N` breakpoint ids
    next_method_breakpoint: AtomicU32,
}

impl Bridge {
    pub fn new(config: Config, loader: Arc<dyn AssemblyLoader>) -> Self {
        Self {
            contexts: DashMap::new(),
            loader,
            evaluator: Arc::new(NoEvaluator),
            config,
            next_method_breakpoint: AtomicU32::new(0),
        }
    }

    /// Use `evaluator` for expressions that are not plain variable names
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Context of `session`, if one was established
    pub fn context(&self, session: &SessionId) -> Option<Arc<ExecutionContext>> {
        self.contexts.get(session).map(|c| Arc::clone(c.value()))
    }

    pub fn get_context(&self, session: &SessionId) -> Result<Arc<ExecutionContext>> {
        self.context(session)
            .ok_or_else(|| Error::InvalidSession(session.to_string()))
    }

    fn next_method_breakpoint_id(&self) -> String {
        let n = self.next_method_breakpoint.fetch_add(1, Ordering::SeqCst);
        format!("by-method-{n}")
    }

    async fn on_command(
        &self,
        relay: &Relay,
        ctx: &Arc<ExecutionContext>,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        match method {
            "Debugger.enable" => self.enable(relay, ctx, id, method, params).await,
            "Debugger.getScriptSource" => self.get_script_source(relay, ctx, id, method, params).await,
            "Runtime.compileScript" => self.compile_script(relay, id, method, params),
            "Debugger.getPossibleBreakpoints" => {
                self.get_possible_breakpoints(relay, ctx, id, method, params).await
            }
            "Debugger.setBreakpointByUrl" => {
                self.set_breakpoint_by_url(relay, ctx, id, method, params).await
            }
            "Debugger.removeBreakpoint" => {
                self.remove_breakpoint(relay, ctx, &id.session, method, params)
                    .await?;
                Ok(false)
            }
            "Debugger.resume" => {
                ctx.clear_state();
                Ok(false)
            }
            "Debugger.stepInto" | "Debugger.stepOut" | "Debugger.stepOver" => {
                self.step(relay, ctx, id, method).await
            }
            "Debugger.evaluateOnCallFrame" => {
                self.evaluate_on_call_frame(relay, ctx, id, method, params).await
            }
            "Runtime.getProperties" => self.get_properties(relay, ctx, id, method, params).await,
            "Runtime.releaseObject" => self.release_object(relay, id, method, params).await,
            "Runtime.callFunctionOn" => self.call_function_on(relay, id, method, params).await,
            "Dotnet-test.setBreakpointByMethod" => {
                self.set_breakpoint_by_method(relay, ctx, id, method, params).await
            }
            _ => Ok(false),
        }
    }

    /// Forward `Target.attachToTarget` and log which target was attached
    async fn attach_to_target(
        &self,
        relay: &Relay,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let result = relay.send_command(&id.session, method, params.clone()).await?;
        let attached = result
            .ok_value()
            .and_then(|v| v.get("sessionId"))
            .and_then(Value::as_str);
        tracing::info!(
            target_id = params.get("targetId").and_then(|v| v.as_str()),
            attached,
            "Attached to target"
        );
        relay.send_response(id, result);
        Ok(true)
    }
}

#[async_trait]
impl Interceptor for Bridge {
    async fn accept_command(
        &self,
        relay: &Relay,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        if method == "Target.attachToTarget" {
            return self.attach_to_target(relay, id, method, params).await;
        }

        let Some(ctx) = self.context(&id.session) else {
            return Ok(false);
        };

        match self.on_command(relay, &ctx, id, method, params).await {
            Ok(handled) => Ok(handled),
            Err(e) if e.is_command_error() => {
                tracing::debug!(%id, method, "Command failed: {}", e);
                relay.send_response(id, CommandResult::from(&e));
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn accept_event(
        &self,
        relay: &Relay,
        session: &SessionId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        match method {
            "Runtime.consoleAPICalled" => {
                self.on_console_api_called(relay, session, params).await?;
                Ok(false)
            }
            "Runtime.executionContextCreated" => {
                self.on_execution_context_created(relay, session, method, params)
                    .await
            }
            "Debugger.paused" => self.on_paused(relay, session, params).await,
            "Debugger.scriptParsed" => Ok(runtime::is_internal_script(params)),
            "Target.attachedToTarget" => {
                tracing::debug!(
                    %session,
                    attached = params.get("sessionId").and_then(|v| v.as_str()),
                    "Target attached"
                );
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

/// Whether a sandbox reply acknowledges the command
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}
