//! Breakpoint resolution and arming

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::cdp::{
    parse_params, CommandResult, GetPossibleBreakpoints, MessageId, RemoveBreakpoint, SessionId,
    SetBreakpointByMethod, SetBreakpointByUrl,
};
use crate::common::{Error, Result};
use crate::location::{Breakpoint, BreakpointRequest, BreakpointState, SourceId, SourceLocation};
use crate::relay::Relay;
use crate::store::{AssemblyInfo, DebugStore, SourceFile};

use super::sandbox::{self, SandboxCommand};
use super::{is_truthy, Bridge, ExecutionContext};

/// Locations a request arms, at most one per document
///
/// Candidates must sit on the requested line and, unless the request's
/// column is 0, on the requested column. The leftmost candidate of each
/// document wins.
pub(super) fn select_locations(
    candidates: Vec<SourceLocation>,
    request: &BreakpointRequest,
) -> Vec<SourceLocation> {
    let mut best: BTreeMap<SourceId, SourceLocation> = BTreeMap::new();
    for location in candidates {
        if location.line != request.line
            || (request.column != 0 && location.column != request.column)
        {
            continue;
        }
        match best.get(&location.id) {
            Some(current) if current.column <= location.column => {}
            _ => {
                best.insert(location.id, location);
            }
        }
    }
    best.into_values().collect()
}

impl Bridge {
    pub(super) async fn set_breakpoint_by_url(
        &self,
        relay: &Relay,
        ctx: &ExecutionContext,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let args: SetBreakpointByUrl = parse_params(method, params)?;
        let session = &id.session;
        // Rejected before the browser sets anything
        let mut request = BreakpointRequest::new(String::new(), args)?;

        let response = relay.send_command(session, method, params.clone()).await?;
        if response.is_err() {
            relay.send_response(id, response);
            return Ok(true);
        }
        let browser = response.value();
        let bp_id = browser
            .get("breakpointId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::command_failed(method, "runtime returned no breakpointId"))?
            .to_string();
        let browser_locations = browser
            .get("locations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        request.id = bp_id.clone();
        let loaded = ctx.is_loaded();
        ctx.breakpoints.insert(bp_id.clone(), request);
        tracing::debug!(%session, breakpoint_id = %bp_id, loaded, "Breakpoint requested");

        if !loaded {
            // Resolution completes later and is reported through events
            relay.send_response(id, response.clone());
        }

        if self.is_runtime_ready(relay, session, ctx).await? {
            let store = self.runtime_ready(relay, session, ctx).await?;
            let sources = store.all_sources();
            self.resolve_breakpoint(relay, session, ctx, &store, &bp_id, &sources, !loaded)
                .await?;
        }

        if loaded {
            let mut body = ctx
                .breakpoints
                .get(&bp_id)
                .map(|r| r.as_response())
                .unwrap_or_else(|| json!({ "breakpointId": bp_id, "locations": [] }));
            if let Some(locations) = body["locations"].as_array_mut() {
                locations.extend(browser_locations);
            }
            relay.send_response(id, CommandResult::Ok(body));
        }
        Ok(true)
    }

    /// Resolve request `bp_id` against `sources` and arm what it lands on
    ///
    /// A request that already has locations, or is being resolved by another
    /// task, is left alone.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn resolve_breakpoint(
        &self,
        relay: &Relay,
        session: &SessionId,
        ctx: &ExecutionContext,
        store: &DebugStore,
        bp_id: &str,
        sources: &[Arc<SourceFile>],
        send_resolved: bool,
    ) -> Result<()> {
        let request = {
            let Some(mut entry) = ctx.breakpoints.get_mut(bp_id) else {
                return Ok(());
            };
            if !entry.locations.is_empty() || entry.resolving {
                return Ok(());
            }
            if !entry.try_resolve(sources.iter()) {
                return Ok(());
            }
            entry.resolving = true;
            entry.clone()
        };

        let locations = select_locations(store.find_breakpoint_locations(&request), &request);
        let armed = self
            .arm_locations(relay, session, &request, locations, send_resolved)
            .await;

        let orphaned = match ctx.breakpoints.get_mut(bp_id) {
            Some(mut entry) => {
                entry.resolving = false;
                if let Ok(armed) = &armed {
                    entry.locations.extend(armed.iter().cloned());
                }
                Vec::new()
            }
            // Removed while arming
            None => armed.as_ref().map(Vec::clone).unwrap_or_default(),
        };
        for mut bp in orphaned {
            self.disarm(relay, session, &mut bp).await?;
        }

        armed.map(|_| ())
    }

    async fn arm_locations(
        &self,
        relay: &Relay,
        session: &SessionId,
        request: &BreakpointRequest,
        locations: Vec<SourceLocation>,
        send_resolved: bool,
    ) -> Result<Vec<Breakpoint>> {
        let mut armed = Vec::new();
        for location in locations {
            let mut bp = Breakpoint::new(request.id.clone(), location);
            if !self.arm(relay, session, &mut bp).await? {
                continue;
            }
            if send_resolved {
                relay.send_event(session, "Debugger.breakpointResolved", bp.resolved_event());
            }
            armed.push(bp);
        }
        Ok(armed)
    }

    /// Ask the sandbox to arm `bp`; true once it is active
    async fn arm(&self, relay: &Relay, session: &SessionId, bp: &mut Breakpoint) -> Result<bool> {
        let Some(cli) = &bp.location.cli else {
            return Ok(false);
        };
        let result = sandbox::send(
            relay,
            session,
            SandboxCommand::SetBreakpoint {
                assembly: &cli.assembly,
                method_token: cli.method_token,
                offset: cli.offset,
            },
        )
        .await?;

        match result.runtime_value().and_then(Value::as_i64) {
            Some(remote_id) => {
                tracing::debug!(
                    %session,
                    breakpoint_id = %bp.request_id,
                    remote_id,
                    line = bp.location.line,
                    column = bp.location.column,
                    "Breakpoint armed"
                );
                bp.remote_id = Some(remote_id);
                bp.state = BreakpointState::Active;
                Ok(true)
            }
            None => {
                tracing::warn!(
                    %session,
                    breakpoint_id = %bp.request_id,
                    error = result.error_text(),
                    "Sandbox did not arm breakpoint"
                );
                Ok(false)
            }
        }
    }

    /// Ask the sandbox to disarm an active `bp`
    async fn disarm(&self, relay: &Relay, session: &SessionId, bp: &mut Breakpoint) -> Result<()> {
        let Some(remote_id) = bp.remote_id.filter(|_| bp.state == BreakpointState::Active) else {
            return Ok(());
        };
        let result = sandbox::send(relay, session, SandboxCommand::RemoveBreakpoint(remote_id)).await?;
        if is_truthy(result.runtime_value()) {
            bp.remote_id = None;
            bp.state = BreakpointState::Disabled;
        } else {
            tracing::warn!(%session, remote_id, "Sandbox did not disarm breakpoint");
        }
        Ok(())
    }

    /// Forget a request and disarm its active locations
    ///
    /// Returns the locations the request had, in their final state.
    pub(super) async fn remove_breakpoint(
        &self,
        relay: &Relay,
        ctx: &ExecutionContext,
        session: &SessionId,
        method: &str,
        params: &Value,
    ) -> Result<Vec<Breakpoint>> {
        let args: RemoveBreakpoint = parse_params(method, params)?;
        let Some((_, mut request)) = ctx.breakpoints.remove(&args.breakpoint_id) else {
            return Ok(Vec::new());
        };

        for bp in request.locations.iter_mut() {
            self.disarm(relay, session, bp).await?;
        }
        tracing::debug!(%session, breakpoint_id = %args.breakpoint_id, "Breakpoint removed");
        Ok(std::mem::take(&mut request.locations))
    }

    pub(super) async fn get_possible_breakpoints(
        &self,
        relay: &Relay,
        ctx: &ExecutionContext,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let args: GetPossibleBreakpoints = parse_params(method, params)?;

        let response = relay.send_command(&id.session, method, params.clone()).await?;
        let has_locations = response
            .ok_value()
            .and_then(|v| v.get("locations"))
            .and_then(Value::as_array)
            .is_some_and(|l| !l.is_empty());
        if has_locations {
            relay.send_response(id, response);
            return Ok(true);
        }

        let start = SourceLocation::from_protocol(&args.start)?;
        let end = args.end.as_ref().map(SourceLocation::from_protocol).transpose()?;
        let (start, end) = match (start, end) {
            (Some(start), None) => (start, None),
            (Some(start), Some(Some(end))) => (start, Some(end)),
            _ => {
                relay.send_response(id, response);
                return Ok(true);
            }
        };

        let store = self.runtime_ready(relay, &id.session, ctx).await?;
        let found = store.find_possible_breakpoints(&start, end.as_ref()).ok_or_else(|| {
            Error::InvalidArguments("start and end are in different documents".to_string())
        })?;
        let locations: Vec<Value> = found.iter().map(SourceLocation::as_location).collect();
        relay.send_response(id, CommandResult::Ok(json!({ "locations": locations })));
        Ok(true)
    }

    /// `Dotnet-test.setBreakpointByMethod`: break at the start of a method
    pub(super) async fn set_breakpoint_by_method(
        &self,
        relay: &Relay,
        ctx: &ExecutionContext,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let args: SetBreakpointByMethod = parse_params(method, params)?;
        let (Some(assembly_name), Some(type_name), Some(method_name)) =
            (args.assembly_name, args.type_name, args.method_name)
        else {
            return Err(Error::InvalidArguments(
                "assemblyName, typeName and methodName are required".to_string(),
            ));
        };
        let session = &id.session;

        let store = self.runtime_ready(relay, session, ctx).await?;
        let assembly = find_assembly(&store, &assembly_name)
            .ok_or_else(|| Error::AssemblyNotFound(assembly_name.clone()))?;
        let ty = assembly
            .type_by_name(&type_name)
            .ok_or_else(|| Error::TypeNotFound(type_name.clone()))?;
        let target = ty
            .method(&method_name)
            .ok_or_else(|| Error::method_not_found(&type_name, &method_name))?;
        let location = target.start.clone().ok_or_else(|| {
            Error::command_failed(method, &format!("{type_name}:{method_name} has no source location"))
        })?;

        let bp_id = self.next_method_breakpoint_id();
        let mut request = BreakpointRequest::new(
            bp_id.clone(),
            SetBreakpointByUrl {
                line_number: location.line,
                column_number: Some(location.column),
                url: Some(store.to_url(Some(&location))),
                ..Default::default()
            },
        )?;
        request.assembly = Some(assembly.name.clone());

        let mut bp = Breakpoint::new(bp_id.clone(), location);
        if !self.arm(relay, session, &mut bp).await? {
            return Err(Error::command_failed(
                method,
                &format!("could not set breakpoint in {type_name}:{method_name}"),
            ));
        }

        let resolved = bp.resolved_event();
        let location = bp.location.as_location();
        request.locations.push(bp);
        ctx.breakpoints.insert(bp_id.clone(), request);

        relay.send_event(session, "Debugger.breakpointResolved", resolved);
        relay.send_response(
            id,
            CommandResult::Ok(json!({ "breakpointId": bp_id, "locations": [location] })),
        );
        Ok(true)
    }
}

/// Assembly by name, trying the usual module extensions
fn find_assembly(store: &DebugStore, name: &str) -> Option<Arc<AssemblyInfo>> {
    store
        .get_assembly_by_name(name)
        .or_else(|| store.get_assembly_by_name(&format!("{name}.dll")))
        .or_else(|| store.get_assembly_by_name(&format!("{name}.exe")))
}
