//! Pauses in managed code and stepping

use serde_json::{json, Value};

use crate::cdp::{CommandResult, MessageId, Paused, SessionId};
use crate::common::Result;
use crate::location::{Frame, ObjectId, SourceLocation};
use crate::relay::Relay;
use crate::store::DebugStore;

use super::sandbox::{self, SandboxCommand, StepKind};
use super::{Bridge, ExecutionContext};

/// Resolve one frame of the sandbox's call stack dump
///
/// Frames in methods or at offsets without source information yield `None`.
pub(super) fn resolve_frame(store: &DebugStore, id: u32, raw: &Value) -> Option<Frame> {
    let il_pos = raw.get("il_pos")?.as_u64()? as u32;
    let token = raw.get("method_token")?.as_u64()? as u32;
    let assembly = raw.get("assembly_name")?.as_str()?;

    let Some(method) = store.method_by_token(assembly, token) else {
        tracing::debug!(
            assembly,
            token,
            method = raw.get("method_name").and_then(|v| v.as_str()),
            "Frame in unknown method"
        );
        return None;
    };
    let Some(location) = method.location_by_il(il_pos) else {
        tracing::debug!(method = %method.name, il_pos, "Frame without source location");
        return None;
    };
    Some(Frame {
        method,
        location,
        id,
    })
}

/// Inspector call frame for a managed frame
pub(super) fn call_frame(store: &DebugStore, frame: &Frame) -> Value {
    let scope_id = ObjectId::scope(frame.id);
    let method = &frame.method;
    json!({
        "functionName": method.name,
        "callFrameId": scope_id,
        "functionLocation": method.start.as_ref().map(SourceLocation::as_location),
        "location": frame.location.as_location(),
        "url": store.to_url(Some(&frame.location)),
        "scopeChain": [{
            "type": "local",
            "object": {
                "type": "object",
                "className": "Object",
                "description": "Object",
                "objectId": scope_id,
            },
            "name": method.name,
            "startLocation": method.start.as_ref().map(SourceLocation::as_location),
            "endLocation": method.end.as_ref().map(SourceLocation::as_location),
        }],
    })
}

/// Whether a runtime call frame is sandbox internals
fn is_internal_frame(frame: &Value) -> bool {
    let name = frame.get("functionName").and_then(Value::as_str).unwrap_or("");
    let url = frame.get("url").and_then(Value::as_str).unwrap_or("");
    name.starts_with("wasm-function") || url.starts_with("wasm://wasm/")
}

impl Bridge {
    /// Rewrite a pause at the breakpoint trampoline into managed frames
    pub(super) async fn on_paused(
        &self,
        relay: &Relay,
        session: &SessionId,
        params: &Value,
    ) -> Result<bool> {
        let Ok(paused) = serde_json::from_value::<Paused>(params.clone()) else {
            return Ok(false);
        };
        if !paused.top_function().is_some_and(|f| self.config.is_trampoline(f)) {
            return Ok(false);
        }
        let Some(ctx) = self.context(session) else {
            return Ok(false);
        };
        let store = self.runtime_ready(relay, session, &ctx).await?;

        let result = sandbox::send(relay, session, SandboxCommand::GetCallStack).await?;
        let Some(dump) = result.runtime_value() else {
            tracing::warn!(%session, error = result.error_text(), "Failed to get call stack");
            return Ok(false);
        };
        let remote_breakpoint = dump.get("breakpoint_id").and_then(Value::as_i64);
        let raw_frames = dump
            .get("frames")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut frames = Vec::new();
        let mut call_frames = Vec::new();
        let mut expanded = false;
        for js_frame in paused.call_frames {
            let name = js_frame.get("functionName").and_then(Value::as_str).unwrap_or("");
            if self.config.is_trampoline(name) {
                if expanded {
                    continue;
                }
                expanded = true;
                for (index, raw) in raw_frames.iter().enumerate() {
                    if let Some(frame) = resolve_frame(&store, index as u32, raw) {
                        call_frames.push(call_frame(&store, &frame));
                        frames.push(frame);
                    }
                }
            } else if !is_internal_frame(&js_frame) {
                call_frames.push(js_frame);
            }
        }

        let hit_breakpoints: Vec<String> = match remote_breakpoint {
            Some(remote) => ctx
                .breakpoints
                .iter()
                .filter(|r| r.locations.iter().any(|bp| bp.remote_id == Some(remote)))
                .map(|r| r.id.clone())
                .collect(),
            None => Vec::new(),
        };

        tracing::debug!(
            %session,
            frames = frames.len(),
            hit = ?hit_breakpoints,
            "Paused in managed code"
        );
        ctx.set_call_stack(frames);

        relay.send_event(
            session,
            "Debugger.paused",
            json!({
                "callFrames": call_frames,
                "reason": "other",
                "data": null,
                "hitBreakpoints": hit_breakpoints,
            }),
        );
        Ok(true)
    }

    pub(super) async fn step(
        &self,
        relay: &Relay,
        ctx: &ExecutionContext,
        id: &MessageId,
        method: &str,
    ) -> Result<bool> {
        let Some(kind) = StepKind::from_method(method) else {
            return Ok(false);
        };
        let Some(stack) = ctx.call_stack() else {
            return Ok(false);
        };
        // Nothing to step out to
        if kind == StepKind::Out && stack.len() <= 1 {
            return Ok(false);
        }

        let session = &id.session;
        let result = sandbox::send(relay, session, SandboxCommand::StartSingleStepping(kind)).await?;
        if result.is_err() {
            relay.send_response(id, result);
            return Ok(true);
        }

        if result.runtime_value().and_then(Value::as_i64) == Some(0) {
            // No managed frame left to stop in
            ctx.clear_state();
            let out = relay.send_command(session, "Debugger.stepOut", json!({})).await?;
            relay.send_response(id, out);
            return Ok(true);
        }

        relay.send_response(id, CommandResult::empty());
        ctx.clear_state();
        let resumed = relay.send_command(session, "Debugger.resume", json!({})).await?;
        if let Some(error) = resumed.error_text() {
            tracing::warn!(%session, "Failed to resume after step: {}", error);
        }
        Ok(true)
    }
}
