//! Runtime readiness, store loading and managed script sources

use std::pin::pin;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::cdp::{
    parse_params, CommandResult, CompileScript, ConsoleApiCalled, ExecutionContextCreated,
    GetScriptSource, MessageId, ScriptParsed, SessionId,
};
use crate::common::{Error, Result};
use crate::location::SourceId;
use crate::relay::Relay;
use crate::store::{DebugStore, SourceFile};

use super::sandbox::{self, SandboxCommand};
use super::{Bridge, ExecutionContext};

/// First argument of the console message announcing the runtime
const READY_MARKER: &str = "mono_wasm_runtime_ready";
const READY_TOKEN: &str = "fe00e07a-5519-4dfe-b35a-f867dbaf2e28";

/// Whether a runtime `Debugger.scriptParsed` event is runtime plumbing the
/// front end should not see
pub(super) fn is_internal_script(params: &Value) -> bool {
    match serde_json::from_value::<ScriptParsed>(params.clone()) {
        Ok(script) => script.url.is_empty() || script.url.starts_with("wasm://"),
        Err(_) => false,
    }
}

impl Bridge {
    pub(super) async fn on_console_api_called(
        &self,
        relay: &Relay,
        session: &SessionId,
        params: &Value,
    ) -> Result<()> {
        let Ok(call) = serde_json::from_value::<ConsoleApiCalled>(params.clone()) else {
            return Ok(());
        };
        if call.kind != "debug"
            || call.arg_str(0) != Some(READY_MARKER)
            || call.arg_str(1) != Some(READY_TOKEN)
        {
            return Ok(());
        }
        let ctx = match self.get_context(session) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(%session, "Ignoring runtime ready marker: {}", e);
                return Ok(());
            }
        };

        if let Some(files) = call.arg_str(2) {
            match serde_json::from_str::<Vec<String>>(files) {
                Ok(files) => ctx.set_loaded_files(files),
                Err(e) => tracing::warn!(%session, "Ignoring malformed loaded files list: {}", e),
            }
        }

        self.runtime_ready(relay, session, &ctx).await?;
        Ok(())
    }

    pub(super) async fn on_execution_context_created(
        &self,
        relay: &Relay,
        session: &SessionId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let created = match serde_json::from_value::<ExecutionContextCreated>(params.clone()) {
            Ok(created) => created,
            Err(e) => {
                tracing::debug!(%session, "Unrecognized execution context: {}", e);
                return Ok(false);
            }
        };

        if !created.context.is_default() {
            relay.send_event(session, method, params.clone());
            return Ok(true);
        }

        let description = created.context;
        let ctx = match self.context(session) {
            Some(previous) => Arc::new(ExecutionContext::succeed(
                description.id,
                description.aux_data,
                &previous,
            )),
            None => Arc::new(ExecutionContext::new(description.id, description.aux_data)),
        };
        self.contexts.insert(session.clone(), Arc::clone(&ctx));
        relay.send_event(session, method, params.clone());
        tracing::info!(
            %session,
            context_id = ctx.id,
            breakpoints = ctx.breakpoints.len(),
            "Default execution context created"
        );

        if self.is_runtime_ready(relay, session, &ctx).await? {
            self.runtime_ready(relay, session, &ctx).await?;
        }
        Ok(true)
    }

    /// Whether the runtime finished starting, asking the sandbox if needed
    pub(super) async fn is_runtime_ready(
        &self,
        relay: &Relay,
        session: &SessionId,
        ctx: &ExecutionContext,
    ) -> Result<bool> {
        if ctx.is_ready() {
            return Ok(true);
        }
        let result = sandbox::send(relay, session, SandboxCommand::IsRuntimeReady).await?;
        Ok(result.runtime_value().and_then(Value::as_bool).unwrap_or(false))
    }

    /// Make the context ready, once
    ///
    /// Clears whatever breakpoints the sandbox still has, loads the store and
    /// tells the front end. Concurrent callers wait for the same outcome.
    pub(super) async fn runtime_ready(
        &self,
        relay: &Relay,
        session: &SessionId,
        ctx: &ExecutionContext,
    ) -> Result<Arc<DebugStore>> {
        ctx.ready
            .get_or_try_init(|| async {
                let cleared =
                    sandbox::send(relay, session, SandboxCommand::ClearAllBreakpoints).await?;
                if let Some(error) = cleared.error_text() {
                    tracing::warn!(%session, "Failed to clear breakpoints: {}", error);
                }

                let store = self.load_store(relay, session, ctx).await?;
                relay.send_event(session, "Mono.runtimeReady", json!({}));
                tracing::info!(%session, "Runtime ready");
                Ok::<_, Error>(store)
            })
            .await
            .map(Arc::clone)
    }

    /// Load every module of the runtime into a new store, once
    ///
    /// Each document is announced and breakpoint requests are resolved
    /// against it as soon as its module finishes loading.
    async fn load_store(
        &self,
        relay: &Relay,
        session: &SessionId,
        ctx: &ExecutionContext,
    ) -> Result<Arc<DebugStore>> {
        ctx.store
            .get_or_try_init(|| async {
                let urls = match ctx.take_loaded_files() {
                    Some(urls) => urls,
                    None => self.loaded_files(relay, session).await?,
                };
                tracing::debug!(%session, modules = urls.len(), "Loading store");

                let store = Arc::new(DebugStore::new(
                    Arc::clone(&self.loader),
                    self.config.store.symbol_extension.clone(),
                ));
                {
                    let mut sources = pin!(store.load(&urls));
                    while let Some(source) = sources.next().await {
                        self.announce_script(relay, session, ctx, &source);

                        let pending: Vec<String> =
                            ctx.breakpoints.iter().map(|e| e.key().clone()).collect();
                        for bp_id in pending {
                            self.resolve_breakpoint(
                                relay,
                                session,
                                ctx,
                                &store,
                                &bp_id,
                                std::slice::from_ref(&source),
                                true,
                            )
                            .await?;
                        }
                    }
                }
                Ok::<_, Error>(store)
            })
            .await
            .map(Arc::clone)
    }

    async fn loaded_files(&self, relay: &Relay, session: &SessionId) -> Result<Vec<String>> {
        let result = sandbox::send(relay, session, SandboxCommand::GetLoadedFiles).await?;
        if let Some(error) = result.error_text() {
            tracing::warn!(%session, "Failed to list loaded files: {}", error);
        }
        Ok(result
            .runtime_value()
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn announce_script(
        &self,
        relay: &Relay,
        session: &SessionId,
        ctx: &ExecutionContext,
        source: &SourceFile,
    ) {
        relay.send_event(
            session,
            "Debugger.scriptParsed",
            json!({
                "scriptId": source.id.to_string(),
                "url": source.url,
                "executionContextId": ctx.id,
                "executionContextAuxData": ctx.aux_data,
                "dotNetUrl": source.dotnet_url,
            }),
        );
    }

    pub(super) async fn enable(
        &self,
        relay: &Relay,
        ctx: &ExecutionContext,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let result = relay.send_command(&id.session, method, params.clone()).await?;
        if let Some(debugger_id) = result
            .ok_value()
            .and_then(|v| v.get("debuggerId"))
            .and_then(Value::as_str)
        {
            ctx.set_debugger_id(Some(debugger_id.to_string()));
        }

        if result.is_ok() && self.is_runtime_ready(relay, &id.session, ctx).await? {
            self.runtime_ready(relay, &id.session, ctx).await?;
        }
        relay.send_response(id, result);
        Ok(true)
    }

    pub(super) async fn get_script_source(
        &self,
        relay: &Relay,
        ctx: &ExecutionContext,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let args: GetScriptSource = parse_params(method, params)?;
        if !SourceId::is_source_id(&args.script_id) {
            return Ok(false);
        }
        let source_id: SourceId = args.script_id.parse()?;
        let store = self.runtime_ready(relay, &id.session, ctx).await?;

        let text = match store.get_file_by_id(&source_id) {
            None => format!("// Unable to find document {}", args.script_id),
            Some(file) => match self.read_source(&file).await {
                Ok(Some(text)) => text,
                Ok(None) => format!("// Unable to find document {}", file.doc_url),
                Err(e) => format!(
                    "// Unable to read document ({})\nLocal path: {}\nSourceLink path: {}\n",
                    e,
                    file.doc_url,
                    file.source_link_uri.as_deref().unwrap_or("")
                ),
            },
        };

        relay.send_response(id, CommandResult::Ok(json!({ "scriptSource": text })));
        Ok(true)
    }

    /// Text of a document from disk, or from its Source Link url
    async fn read_source(&self, file: &SourceFile) -> Result<Option<String>> {
        if let Some(path) = file.local_path().filter(|p| p.exists()) {
            return Ok(Some(tokio::fs::read_to_string(&path).await?));
        }
        match &file.source_link_uri {
            Some(uri) => self.loader.fetch_source(uri).await.map(Some),
            None => Ok(None),
        }
    }

    pub(super) fn compile_script(
        &self,
        relay: &Relay,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let args: CompileScript = parse_params(method, params)?;
        if !args.expression.starts_with("//dotnet:") {
            return Ok(false);
        }
        relay.send_response(id, CommandResult::empty());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_scripts() {
        assert!(is_internal_script(&json!({"scriptId": "1", "url": ""})));
        assert!(is_internal_script(&json!({"scriptId": "2", "url": "wasm://wasm/00a1b2"})));
        assert!(!is_internal_script(&json!({"scriptId": "3", "url": "http://h/app.js"})));
    }
}
