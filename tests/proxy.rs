//! End-to-end tests running the relay and bridge against a scripted browser

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use common::{eventually, Harness, Sandbox, HELPER_TOKEN, MAIN_TOKEN, PROGRAM_URL};
use debugproxy::bridge::ExpressionEvaluator;
use debugproxy::cdp::SessionId;
use debugproxy::location::Frame;
use debugproxy::Result;
use serde_json::{json, Value};

fn paused_in_trampoline() -> Value {
    json!({
        "reason": "other",
        "callFrames": [
            { "functionName": "mono_wasm_fire_bp", "url": "http://localhost/_framework/dotnet.js" },
            { "functionName": "wasm-function[1234]", "url": "" },
            { "functionName": "mono_interp_exec", "url": "wasm://wasm/00c7a3f2" },
            { "functionName": "onClick", "url": "http://localhost/app.js" },
        ],
    })
}

fn managed_stack() -> Value {
    json!({
        "breakpoint_id": 1,
        "frames": [
            { "il_pos": 8, "method_token": HELPER_TOKEN, "assembly_name": "app.dll", "method_name": "Helper" },
            { "il_pos": 0, "method_token": 0x0600_0099u32, "assembly_name": "app.dll", "method_name": "Unknown" },
            { "il_pos": 14, "method_token": MAIN_TOKEN, "assembly_name": "app.dll", "method_name": "Main" },
        ],
    })
}

/// Helper's `value` and `count`, plus an instance `this`
fn helper_variables_with_this() -> Value {
    json!([
        { "value": { "type": "number", "value": 7, "description": "7" } },
        { "value": { "type": "number", "value": 42, "description": "42" } },
        { "name": "this", "value": { "type": "object", "className": "App.Program", "objectId": "dotnet:object:5" } },
    ])
}

async fn pause_in_helper(h: &mut Harness, variables: Value) {
    {
        let mut sandbox = h.browser.sandbox.lock();
        sandbox.call_stack = managed_stack();
        sandbox.variables = variables;
    }
    h.browser.emit("Debugger.paused", paused_in_trampoline());
    h.frontend.event("Debugger.paused").await;
}

async fn evaluate(h: &mut Harness, expression: &str) -> Value {
    h.frontend
        .command(
            "Debugger.evaluateOnCallFrame",
            json!({ "callFrameId": "dotnet:scope:0", "expression": expression }),
        )
        .await
}

/// Evaluator answering with what it was given
struct EchoEvaluator;

#[async_trait]
impl ExpressionEvaluator for EchoEvaluator {
    async fn evaluate(&self, frame: &Frame, expression: &str, variables: &[Value]) -> Result<String> {
        Ok(format!(
            "{} over {} variables in {}",
            expression,
            variables.len(),
            frame.method.name
        ))
    }
}

#[tokio::test]
async fn test_commands_without_context_pass_through() {
    let mut h = Harness::start(Sandbox::default()).await;

    let response = h
        .frontend
        .command(
            "Debugger.setBreakpointByUrl",
            json!({ "lineNumber": 3, "url": "http://localhost/app.js" }),
        )
        .await;

    assert_eq!(
        response["result"]["breakpointId"],
        "1:3:0:http://localhost/app.js"
    );
    assert!(h.browser.evaluations("MONO.").is_empty());
    assert!(h.bridge.context(&SessionId::implicit()).is_none());
}

#[tokio::test]
async fn test_breakpoint_set_before_ready_resolves_when_runtime_starts() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;

    let response = h
        .frontend
        .command(
            "Debugger.setBreakpointByUrl",
            json!({ "lineNumber": 9, "url": PROGRAM_URL, "columnNumber": 0 }),
        )
        .await;
    let bp_id = response["result"]["breakpointId"].as_str().unwrap().to_string();
    assert_eq!(response["result"]["locations"], json!([]));
    assert!(h.browser.evaluations("MONO.mono_wasm_set_breakpoint").is_empty());

    h.make_ready().await;

    let resolved = h.frontend.event("Debugger.breakpointResolved").await;
    assert_eq!(resolved["params"]["breakpointId"], bp_id.as_str());
    assert_eq!(resolved["params"]["location"]["lineNumber"], 9);
    assert_eq!(resolved["params"]["location"]["columnNumber"], 4);
    assert!(h.frontend.received("Debugger.breakpointResolved").is_empty());

    let armed = h.browser.evaluations("MONO.mono_wasm_set_breakpoint");
    assert_eq!(
        armed,
        vec![format!(
            "MONO.mono_wasm_set_breakpoint (\"app.dll\", {}, 0)",
            MAIN_TOKEN
        )]
    );

    let ctx = h.bridge.context(&SessionId::implicit()).unwrap();
    let request = ctx.breakpoints.get(&bp_id).unwrap();
    assert_eq!(request.active().count(), 1);
    assert_eq!(request.locations[0].remote_id, Some(1));
}

#[tokio::test]
async fn test_scripts_announced_on_ready() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    let scripts: Vec<Value> = h.frontend.received("Debugger.scriptParsed");
    let urls: Vec<&str> = scripts
        .iter()
        .filter_map(|s| s["params"]["dotNetUrl"].as_str())
        .collect();
    assert_eq!(urls.len(), 2);
    assert!(urls.contains(&PROGRAM_URL));
    assert_eq!(h.frontend.received("Mono.runtimeReady").len(), 1);

    h.frontend.event("Debugger.scriptParsed").await;
    h.frontend.event("Debugger.scriptParsed").await;

    // Runtime plumbing scripts never reach the front end
    h.browser.emit(
        "Debugger.scriptParsed",
        json!({ "scriptId": "99", "url": "wasm://wasm/00c7a3f2" }),
    );
    h.browser.emit(
        "Debugger.scriptParsed",
        json!({ "scriptId": "100", "url": "http://localhost/app.js" }),
    );
    let parsed = h.frontend.event("Debugger.scriptParsed").await;
    assert_eq!(parsed["params"]["scriptId"], "100");
}

#[tokio::test]
async fn test_runtime_ready_runs_once() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;

    h.announce_ready();
    h.announce_ready();
    h.announce_ready();
    let enable = h.frontend.send("Debugger.enable", json!({})).await;

    for _ in 0..3 {
        h.frontend.event("Runtime.consoleAPICalled").await;
    }
    let enabled = h.frontend.response(enable).await;
    assert_eq!(enabled["result"]["debuggerId"], "debugger-1");

    assert_eq!(
        h.browser
            .evaluations("MONO.mono_wasm_clear_all_breakpoints")
            .len(),
        1
    );
    assert_eq!(h.loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(h.frontend.received("Mono.runtimeReady").len(), 1);
}

#[tokio::test]
async fn test_remove_breakpoint_disarms_its_location() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    // Main also has a point on line 11 of Generated.cs, which must not be armed
    let response = h
        .frontend
        .command(
            "Debugger.setBreakpointByUrl",
            json!({ "lineNumber": 10, "url": PROGRAM_URL }),
        )
        .await;
    let locations = response["result"]["locations"].as_array().unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0]["lineNumber"], 10);
    assert_eq!(locations[0]["columnNumber"], 8);
    assert!(locations[0]["scriptId"].as_str().unwrap().ends_with("_0"));
    assert_eq!(
        h.browser.evaluations("MONO.mono_wasm_set_breakpoint"),
        vec![format!(
            "MONO.mono_wasm_set_breakpoint (\"app.dll\", {}, 12)",
            MAIN_TOKEN
        )]
    );
    let bp_id = response["result"]["breakpointId"].as_str().unwrap().to_string();

    let removed = h
        .frontend
        .command("Debugger.removeBreakpoint", json!({ "breakpointId": bp_id }))
        .await;
    assert!(removed.get("error").is_none());

    assert_eq!(
        h.browser.evaluations("MONO.mono_wasm_remove_breakpoint"),
        vec!["MONO.mono_wasm_remove_breakpoint(1)".to_string()]
    );
    assert_eq!(h.browser.commands("Debugger.removeBreakpoint").len(), 1);
    let ctx = h.bridge.context(&SessionId::implicit()).unwrap();
    assert!(ctx.breakpoints.get(&bp_id).is_none());
}

#[tokio::test]
async fn test_paused_stack_keeps_only_resolvable_frames() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    let response = h
        .frontend
        .command(
            "Debugger.setBreakpointByUrl",
            json!({ "lineNumber": 19, "url": PROGRAM_URL }),
        )
        .await;
    let bp_id = response["result"]["breakpointId"].as_str().unwrap().to_string();

    h.browser.sandbox.lock().call_stack = managed_stack();
    h.browser.emit("Debugger.paused", paused_in_trampoline());
    let paused = h.frontend.event("Debugger.paused").await;

    let frames = paused["params"]["callFrames"].as_array().unwrap();
    let names: Vec<&str> = frames
        .iter()
        .filter_map(|f| f["functionName"].as_str())
        .collect();
    assert_eq!(names, vec!["Helper", "Main", "onClick"]);
    assert_eq!(frames[0]["callFrameId"], "dotnet:scope:0");
    assert_eq!(frames[1]["callFrameId"], "dotnet:scope:2");
    assert_eq!(frames[0]["location"]["lineNumber"], 20);
    assert_eq!(paused["params"]["hitBreakpoints"], json!([bp_id]));
    assert_eq!(paused["params"]["reason"], "other");
}

#[tokio::test]
async fn test_scope_queries_end_with_resume() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    {
        let mut sandbox = h.browser.sandbox.lock();
        sandbox.call_stack = managed_stack();
        sandbox.variables = json!([
            { "value": { "type": "number", "value": 7, "description": "7" } },
            { "value": { "type": "number", "value": 42, "description": "42" } },
        ]);
    }
    h.browser.emit("Debugger.paused", paused_in_trampoline());
    h.frontend.event("Debugger.paused").await;

    let properties = h
        .frontend
        .command(
            "Runtime.getProperties",
            json!({ "objectId": "dotnet:scope:0", "ownProperties": false }),
        )
        .await;
    let names: Vec<&str> = properties["result"]["result"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v["name"].as_str())
        .collect();
    assert_eq!(names, vec!["value", "count"]);
    assert_eq!(
        h.browser.evaluations("MONO.mono_wasm_get_variables"),
        vec![
            r#"MONO.mono_wasm_get_variables(0, [{"index":-1,"name":"value"},{"index":0,"name":"count"}])"#
                .to_string()
        ]
    );

    let evaluated = h
        .frontend
        .command(
            "Debugger.evaluateOnCallFrame",
            json!({ "callFrameId": "dotnet:scope:0", "expression": "count" }),
        )
        .await;
    assert_eq!(evaluated["result"]["result"]["value"], 42);

    h.frontend.command("Debugger.resume", json!({})).await;
    assert_eq!(h.browser.commands("Debugger.resume").len(), 1);

    let after = h
        .frontend
        .command(
            "Runtime.getProperties",
            json!({ "objectId": "dotnet:scope:0" }),
        )
        .await;
    let message = after["error"]["message"].as_str().unwrap();
    assert!(message.contains("No call stack"), "{message}");
}

#[tokio::test]
async fn test_step_over_resumes_runtime() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    h.browser.sandbox.lock().call_stack = managed_stack();
    h.browser.emit("Debugger.paused", paused_in_trampoline());
    h.frontend.event("Debugger.paused").await;

    let stepped = h.frontend.command("Debugger.stepOver", json!({})).await;
    assert_eq!(stepped["result"], json!({}));
    assert_eq!(
        h.browser.evaluations("MONO.mono_wasm_start_single_stepping"),
        vec!["MONO.mono_wasm_start_single_stepping (2)".to_string()]
    );

    let browser = &h.browser;
    eventually(|| browser.commands("Debugger.resume").len() == 1).await;
    assert!(browser.commands("Debugger.stepOver").is_empty());

    let ctx = h.bridge.context(&SessionId::implicit()).unwrap();
    assert!(ctx.call_stack().is_none());
}

#[tokio::test]
async fn test_step_without_managed_frame_falls_back_to_step_out() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    {
        let mut sandbox = h.browser.sandbox.lock();
        sandbox.call_stack = managed_stack();
        sandbox.step_status = 0;
    }
    h.browser.emit("Debugger.paused", paused_in_trampoline());
    h.frontend.event("Debugger.paused").await;

    let stepped = h.frontend.command("Debugger.stepInto", json!({})).await;
    assert!(stepped.get("error").is_none());
    assert_eq!(h.browser.commands("Debugger.stepOut").len(), 1);
    assert!(h.browser.commands("Debugger.resume").is_empty());
}

#[tokio::test]
async fn test_set_breakpoint_by_method() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    let response = h
        .frontend
        .command(
            "Dotnet-test.setBreakpointByMethod",
            json!({ "assemblyName": "app", "typeName": "App.Program", "methodName": "Helper" }),
        )
        .await;
    assert_eq!(response["result"]["breakpointId"], "by-method-0");
    assert_eq!(response["result"]["locations"][0]["lineNumber"], 19);
    assert_eq!(response["result"]["locations"][0]["columnNumber"], 4);

    let resolved = h.frontend.event("Debugger.breakpointResolved").await;
    assert_eq!(resolved["params"]["breakpointId"], "by-method-0");

    let missing = h
        .frontend
        .command(
            "Dotnet-test.setBreakpointByMethod",
            json!({ "assemblyName": "app", "typeName": "App.Program", "methodName": "Nope" }),
        )
        .await;
    assert!(missing["error"]["message"].is_string());

    let incomplete = h
        .frontend
        .command(
            "Dotnet-test.setBreakpointByMethod",
            json!({ "assemblyName": "app" }),
        )
        .await;
    assert!(incomplete["error"]["message"].is_string());
}

#[tokio::test]
async fn test_script_source_for_missing_document() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    let program = h
        .frontend
        .received("Debugger.scriptParsed")
        .into_iter()
        .find(|s| s["params"]["dotNetUrl"] == PROGRAM_URL)
        .unwrap();
    let script_id = program["params"]["scriptId"].as_str().unwrap().to_string();

    let source = h
        .frontend
        .command("Debugger.getScriptSource", json!({ "scriptId": script_id }))
        .await;
    let text = source["result"]["scriptSource"].as_str().unwrap();
    assert!(text.starts_with("// Unable to find document"), "{text}");
}

#[tokio::test]
async fn test_relay_stops_when_frontend_disconnects() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;

    let result = h.disconnect_frontend().await;
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_possible_breakpoints_in_managed_document() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    let program = h.frontend.event("Debugger.scriptParsed").await;
    let program = if program["params"]["dotNetUrl"] == PROGRAM_URL {
        program
    } else {
        h.frontend.event("Debugger.scriptParsed").await
    };
    let script_id = program["params"]["scriptId"].as_str().unwrap().to_string();

    let response = h
        .frontend
        .command(
            "Debugger.getPossibleBreakpoints",
            json!({
                "start": { "scriptId": script_id, "lineNumber": 9, "columnNumber": 0 },
                "end": { "scriptId": script_id, "lineNumber": 10, "columnNumber": 100 },
            }),
        )
        .await;
    let found: Vec<(u64, u64)> = response["result"]["locations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| {
            (
                l["lineNumber"].as_u64().unwrap(),
                l["columnNumber"].as_u64().unwrap(),
            )
        })
        .collect();
    assert_eq!(found, vec![(9, 4), (9, 21), (10, 8)]);

    let crossing = h
        .frontend
        .command(
            "Debugger.getPossibleBreakpoints",
            json!({
                "start": { "scriptId": script_id, "lineNumber": 9 },
                "end": { "scriptId": "dotnet://999_0", "lineNumber": 10 },
            }),
        )
        .await;
    assert!(crossing["error"]["message"].is_string());
}

#[tokio::test]
async fn test_locals_shadow_members_of_this() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    h.browser.sandbox.lock().details.insert(
        "dotnet:object:5".into(),
        json!([
            { "name": "count", "value": { "type": "number", "value": 99, "description": "99" } },
            { "name": "<Total>k__BackingField", "value": { "type": "number", "value": 3, "description": "3" } },
        ]),
    );
    pause_in_helper(&mut h, helper_variables_with_this()).await;

    let local = evaluate(&mut h, "count").await;
    assert_eq!(local["result"]["result"]["value"], 42);

    let member = evaluate(&mut h, "this.count").await;
    assert_eq!(member["result"]["result"]["value"], 99);

    let member_only = evaluate(&mut h, "Total").await;
    assert_eq!(member_only["result"]["result"]["value"], 3);

    let ctx = h.bridge.context(&SessionId::implicit()).unwrap();
    let cached = ctx.cached_local(0, "Total").unwrap();
    assert_eq!(cached["fromThis"], true);
    // The member found through `this.count` never replaces the local
    let count = ctx.cached_local(0, "count").unwrap();
    assert_eq!(count["value"]["value"], 42);
    assert!(count.get("fromThis").is_none());

    let local_again = evaluate(&mut h, "count").await;
    assert_eq!(local_again["result"]["result"]["value"], 42);
}

#[tokio::test]
async fn test_unknown_expression_goes_to_evaluator() {
    let mut h = Harness::start_with_evaluator(Sandbox::default(), Arc::new(EchoEvaluator)).await;
    h.create_context().await;
    h.make_ready().await;

    pause_in_helper(
        &mut h,
        json!([
            { "value": { "type": "number", "value": 7, "description": "7" } },
            { "value": { "type": "number", "value": 42, "description": "42" } },
        ]),
    )
    .await;

    let response = evaluate(&mut h, "count + 1").await;
    assert_eq!(
        response["result"]["result"],
        json!({ "type": "string", "value": "count + 1 over 2 variables in Helper" })
    );

    // Plain names never reach the evaluator
    let plain = evaluate(&mut h, "value").await;
    assert_eq!(plain["result"]["result"]["value"], 7);
}

#[tokio::test]
async fn test_unknown_expression_without_evaluator_fails() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;
    pause_in_helper(&mut h, json!([])).await;

    let response = evaluate(&mut h, "count + 1").await;
    let message = response["error"]["message"].as_str().unwrap();
    assert!(message.contains("count + 1"), "{message}");
}

#[tokio::test]
async fn test_value_types_cached_for_the_pause() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    h.browser.sandbox.lock().details.insert(
        "dotnet:valuetype:3".into(),
        json!([{ "name": "X", "value": { "type": "number", "value": 1, "description": "1" } }]),
    );
    pause_in_helper(&mut h, json!([])).await;

    let params = json!({ "objectId": "dotnet:valuetype:3" });
    let first = h.frontend.command("Runtime.getProperties", params.clone()).await;
    let second = h.frontend.command("Runtime.getProperties", params.clone()).await;
    assert_eq!(first["result"]["result"][0]["name"], "X");
    assert_eq!(first["result"], second["result"]);
    assert_eq!(h.browser.evaluations("MONO.mono_wasm_get_details").len(), 1);

    h.frontend.command("Debugger.resume", json!({})).await;
    h.frontend.command("Runtime.getProperties", params).await;
    assert_eq!(h.browser.evaluations("MONO.mono_wasm_get_details").len(), 2);
}

#[tokio::test]
async fn test_breakpoints_rearmed_after_reload() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    let response = h
        .frontend
        .command(
            "Debugger.setBreakpointByUrl",
            json!({ "lineNumber": 10, "url": PROGRAM_URL }),
        )
        .await;
    let bp_id = response["result"]["breakpointId"].as_str().unwrap().to_string();
    assert_eq!(h.browser.evaluations("MONO.mono_wasm_set_breakpoint").len(), 1);

    // A page reload brings a new default context on an already running runtime
    h.create_context_with_id(2).await;

    let resolved = h.frontend.event("Debugger.breakpointResolved").await;
    assert_eq!(resolved["params"]["breakpointId"], bp_id.as_str());
    assert_eq!(resolved["params"]["location"]["lineNumber"], 10);
    assert_eq!(resolved["params"]["location"]["columnNumber"], 8);

    let expected = format!("MONO.mono_wasm_set_breakpoint (\"app.dll\", {}, 12)", MAIN_TOKEN);
    assert_eq!(
        h.browser.evaluations("MONO.mono_wasm_set_breakpoint"),
        vec![expected.clone(), expected]
    );
    assert_eq!(
        h.browser
            .evaluations("MONO.mono_wasm_clear_all_breakpoints")
            .len(),
        2
    );
    assert_eq!(h.loader.loads.load(Ordering::SeqCst), 2);

    let ctx = h.bridge.context(&SessionId::implicit()).unwrap();
    assert_eq!(ctx.id, 2);
    let request = ctx.breakpoints.get(&bp_id).unwrap();
    assert_eq!(request.locations.len(), 1);
    assert_eq!(request.locations[0].remote_id, Some(2));
}

#[tokio::test]
async fn test_invalid_url_regex_never_reaches_browser() {
    let mut h = Harness::start(Sandbox::default()).await;
    h.create_context().await;
    h.make_ready().await;

    let response = h
        .frontend
        .command(
            "Debugger.setBreakpointByUrl",
            json!({ "lineNumber": 10, "urlRegex": "(" }),
        )
        .await;
    let message = response["error"]["message"].as_str().unwrap();
    assert!(message.contains("urlRegex"), "{message}");
    assert!(h.browser.commands("Debugger.setBreakpointByUrl").is_empty());

    let ctx = h.bridge.context(&SessionId::implicit()).unwrap();
    assert!(ctx.breakpoints.is_empty());
}

#[tokio::test]
async fn test_attach_to_target_relays_response() {
    let mut h = Harness::start(Sandbox::default()).await;

    let response = h
        .frontend
        .command(
            "Target.attachToTarget",
            json!({ "targetId": "T1", "flatten": true }),
        )
        .await;
    assert_eq!(response["result"]["sessionId"], "attached-1");
    let sent = h.browser.commands("Target.attachToTarget");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["params"]["targetId"], "T1");
}

#[tokio::test]
async fn test_ready_marker_before_context_is_ignored() {
    let mut h = Harness::start(Sandbox::default()).await;

    h.announce_ready();
    h.frontend.event("Runtime.consoleAPICalled").await;
    assert!(h.bridge.context(&SessionId::implicit()).is_none());

    // The relay keeps running
    let enabled = h.frontend.command("Debugger.enable", json!({})).await;
    assert_eq!(enabled["result"]["debuggerId"], "debugger-1");
    assert!(h.browser.evaluations("MONO.").is_empty());
}
