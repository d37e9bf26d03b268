//! Shared harness for the proxy integration tests
//!
//! A real relay and bridge run over in-memory WebSockets. The browser side is
//! a scripted fake that answers sandbox evaluations by expression, and modules
//! come from a static loader instead of the network.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use debugproxy::bridge::{Bridge, ExpressionEvaluator};
use debugproxy::common::config::Config;
use debugproxy::relay;
use debugproxy::store::{
    AssemblyBuilder, AssemblyInfo, AssemblyLoader, LocalScope, LocalVariable, MethodDef,
    ModuleRequest, SequencePoint, VarInfo,
};
use debugproxy::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

pub const READY_MARKER: &str = "mono_wasm_runtime_ready";
pub const READY_TOKEN: &str = "fe00e07a-5519-4dfe-b35a-f867dbaf2e28";
pub const PROGRAM_URL: &str = "dotnet://app.dll/Program.cs";
pub const MAIN_TOKEN: u32 = 0x0600_0001;
pub const HELPER_TOKEN: u32 = 0x0600_0002;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<DuplexStream>;

async fn ws_pair() -> (Socket, Socket) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
    (server, client)
}

/// `app.dll` with `App.Program.Main` and `App.Program.Helper`
///
/// Main has points on lines 10, 11 and 13 of Program.cs (1-based) and one
/// point on line 11 of Generated.cs. Helper starts on line 20 and has a
/// parameter, a local and a hidden local.
pub fn app_assembly(url: &str) -> AssemblyInfo {
    let mut b = AssemblyBuilder::new("app.dll", url);
    let program = b.add_document("Program.cs");
    let generated = b.add_document("Generated.cs");
    let ty = b.add_type("App.Program");

    b.add_method(
        ty,
        MethodDef::new(MAIN_TOKEN, "Main").with_points(vec![
            SequencePoint::new(0, program, (10, 5), (10, 20)),
            SequencePoint::new(6, program, (10, 22), (10, 30)),
            SequencePoint::new(12, program, (11, 9), (11, 15)),
            SequencePoint::new(16, generated, (11, 3), (11, 9)),
            SequencePoint::new(20, program, (13, 5), (13, 6)),
        ]),
    );

    let mut helper = MethodDef::new(HELPER_TOKEN, "Helper").with_points(vec![
        SequencePoint::new(0, program, (20, 5), (20, 30)),
        SequencePoint::new(8, program, (21, 9), (21, 20)),
    ]);
    helper.parameters.push(VarInfo {
        name: "value".into(),
        index: -1,
    });
    helper.scopes.push(LocalScope {
        start_offset: 0,
        end_offset: 0,
        locals: vec![
            LocalVariable {
                name: "count".into(),
                index: 0,
                hidden: false,
            },
            LocalVariable {
                name: "tmp".into(),
                index: 1,
                hidden: true,
            },
        ],
    });
    b.add_method(ty, helper);

    b.build()
}

/// Loader serving [`app_assembly`] for any `app.dll` url
#[derive(Default)]
pub struct StaticLoader {
    pub loads: AtomicUsize,
}

#[async_trait]
impl AssemblyLoader for StaticLoader {
    async fn load(&self, request: &ModuleRequest) -> Result<AssemblyInfo> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if request.url.ends_with("app.dll") {
            Ok(app_assembly(&request.url))
        } else {
            Err(Error::metadata(format!("no module at {}", request.url)))
        }
    }
}

/// Scripted sandbox behaviour of the fake browser
pub struct Sandbox {
    pub ready: bool,
    pub loaded_files: Vec<String>,
    pub call_stack: Value,
    pub variables: Value,
    pub step_status: i64,
    /// `mono_wasm_get_details` answers by object id
    pub details: HashMap<String, Value>,
    next_breakpoint: i64,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            ready: false,
            loaded_files: vec![
                "http://localhost/_framework/app.dll".into(),
                "http://localhost/_framework/app.pdb".into(),
                "http://localhost/_framework/dotnet.wasm".into(),
            ],
            call_stack: json!({"frames": []}),
            variables: json!([]),
            step_status: 1,
            details: HashMap::new(),
            next_breakpoint: 1,
        }
    }
}

fn evaluated(value: Value) -> Value {
    json!({ "result": { "type": "object", "value": value } })
}

impl Sandbox {
    fn answer(&mut self, method: &str, params: &Value) -> Value {
        match method {
            "Runtime.evaluate" => {
                let expression = params["expression"].as_str().unwrap_or("");
                if expression.starts_with("MONO.mono_wasm_runtime_is_ready") {
                    evaluated(json!(self.ready))
                } else if expression.starts_with("MONO.mono_wasm_get_loaded_files") {
                    evaluated(json!(self.loaded_files))
                } else if expression.starts_with("MONO.mono_wasm_set_breakpoint") {
                    let id = self.next_breakpoint;
                    self.next_breakpoint += 1;
                    evaluated(json!(id))
                } else if expression.starts_with("MONO.mono_wasm_remove_breakpoint") {
                    evaluated(json!(true))
                } else if expression.starts_with("MONO.mono_wasm_get_call_stack") {
                    evaluated(self.call_stack.clone())
                } else if expression.starts_with("MONO.mono_wasm_get_variables") {
                    evaluated(self.variables.clone())
                } else if expression.starts_with("MONO.mono_wasm_start_single_stepping") {
                    evaluated(json!(self.step_status))
                } else if expression.starts_with("MONO.mono_wasm_get_details") {
                    let members = self
                        .details
                        .iter()
                        .find(|(id, _)| expression.contains(&Value::from(id.as_str()).to_string()))
                        .map(|(_, members)| members.clone())
                        .unwrap_or_else(|| json!([]));
                    evaluated(members)
                } else {
                    json!({ "result": { "type": "undefined" } })
                }
            }
            "Debugger.enable" => json!({ "debuggerId": "debugger-1" }),
            "Debugger.setBreakpointByUrl" => json!({
                "breakpointId": format!(
                    "1:{}:{}:{}",
                    params["lineNumber"],
                    params["columnNumber"].as_u64().unwrap_or(0),
                    params["url"].as_str().unwrap_or("")
                ),
                "locations": [],
            }),
            "Debugger.getPossibleBreakpoints" => json!({ "locations": [] }),
            "Target.attachToTarget" => json!({ "sessionId": "attached-1" }),
            _ => json!({}),
        }
    }
}

/// Browser end of the runtime connection
pub struct FakeBrowser {
    pub sandbox: Arc<Mutex<Sandbox>>,
    log: Arc<Mutex<Vec<Value>>>,
    events: mpsc::UnboundedSender<Value>,
}

impl FakeBrowser {
    fn spawn(socket: Socket, sandbox: Sandbox) -> Self {
        let sandbox = Arc::new(Mutex::new(sandbox));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (events, mut events_rx) = mpsc::unbounded_channel::<Value>();

        let (mut sink, mut stream) = socket.split();
        let task_sandbox = Arc::clone(&sandbox);
        let task_log = Arc::clone(&log);
        tokio::spawn(async move {
            loop {
                let outgoing = tokio::select! {
                    Some(event) = events_rx.recv() => event,
                    frame = stream.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let command: Value = serde_json::from_str(text.as_str()).unwrap();
                            task_log.lock().push(command.clone());
                            let method = command["method"].as_str().unwrap_or("");
                            let result = task_sandbox.lock().answer(method, &command["params"]);
                            let mut response = json!({ "id": command["id"], "result": result });
                            if let Some(session) = command.get("sessionId") {
                                response["sessionId"] = session.clone();
                            }
                            response
                        }
                        Some(Ok(_)) => continue,
                        _ => break,
                    },
                };
                if sink.send(WsMessage::text(outgoing.to_string())).await.is_err() {
                    break;
                }
            }
        });

        Self {
            sandbox,
            log,
            events,
        }
    }

    /// Send an event on the implicit session
    pub fn emit(&self, method: &str, params: Value) {
        self.events
            .send(json!({ "method": method, "params": params }))
            .unwrap();
    }

    pub fn commands(&self, method: &str) -> Vec<Value> {
        self.log
            .lock()
            .iter()
            .filter(|c| c["method"] == method)
            .cloned()
            .collect()
    }

    /// Sandbox expressions evaluated so far that start with `prefix`
    pub fn evaluations(&self, prefix: &str) -> Vec<String> {
        self.commands("Runtime.evaluate")
            .iter()
            .filter_map(|c| c["params"]["expression"].as_str().map(str::to_string))
            .filter(|e| e.starts_with(prefix))
            .collect()
    }
}

/// Front-end end of the proxied connection
pub struct Frontend {
    socket: Socket,
    next_id: i64,
    events: VecDeque<Value>,
    responses: HashMap<i64, Value>,
}

impl Frontend {
    async fn recv(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for the proxy")
                .expect("proxy closed the connection")
                .expect("websocket error");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn pump_one(&mut self) {
        let message = self.recv().await;
        match message.get("id").and_then(Value::as_i64) {
            Some(id) => {
                self.responses.insert(id, message);
            }
            None => self.events.push_back(message),
        }
    }

    /// Send a command and return its id
    pub async fn send(&mut self, method: &str, params: Value) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        let message = json!({ "id": id, "method": method, "params": params });
        self.socket
            .send(WsMessage::text(message.to_string()))
            .await
            .unwrap();
        id
    }

    pub async fn response(&mut self, id: i64) -> Value {
        loop {
            if let Some(response) = self.responses.remove(&id) {
                return response;
            }
            self.pump_one().await;
        }
    }

    /// Send a command and wait for its response
    pub async fn command(&mut self, method: &str, params: Value) -> Value {
        let id = self.send(method, params).await;
        self.response(id).await
    }

    /// Next event named `method`, skipping past others
    pub async fn event(&mut self, method: &str) -> Value {
        loop {
            if let Some(pos) = self.events.iter().position(|e| e["method"] == method) {
                return self.events.remove(pos).unwrap_or_default();
            }
            self.pump_one().await;
        }
    }

    /// Events received so far and not yet taken, by name
    pub fn received(&self, method: &str) -> Vec<Value> {
        self.events
            .iter()
            .filter(|e| e["method"] == method)
            .cloned()
            .collect()
    }
}

pub struct Harness {
    pub frontend: Frontend,
    pub browser: FakeBrowser,
    pub bridge: Arc<Bridge>,
    pub loader: Arc<StaticLoader>,
    pump: JoinHandle<Result<()>>,
}

impl Harness {
    pub async fn start(sandbox: Sandbox) -> Self {
        let loader = Arc::new(StaticLoader::default());
        let bridge = Bridge::new(Config::default(), loader.clone());
        Self::with_bridge(sandbox, loader, bridge).await
    }

    /// Start with `evaluator` behind expressions that are not variable names
    pub async fn start_with_evaluator(
        sandbox: Sandbox,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        let loader = Arc::new(StaticLoader::default());
        let bridge = Bridge::new(Config::default(), loader.clone()).with_evaluator(evaluator);
        Self::with_bridge(sandbox, loader, bridge).await
    }

    async fn with_bridge(sandbox: Sandbox, loader: Arc<StaticLoader>, bridge: Bridge) -> Self {
        let (frontend_proxy, frontend) = ws_pair().await;
        let (browser, runtime_proxy) = ws_pair().await;

        let bridge = Arc::new(bridge);
        let pump = tokio::spawn(relay::run(frontend_proxy, runtime_proxy, Arc::clone(&bridge)));

        Self {
            frontend: Frontend {
                socket: frontend,
                next_id: 0,
                events: VecDeque::new(),
                responses: HashMap::new(),
            },
            browser: FakeBrowser::spawn(browser, sandbox),
            bridge,
            loader,
            pump,
        }
    }

    /// Announce the default execution context
    pub async fn create_context(&mut self) {
        self.create_context_with_id(1).await;
    }

    /// Announce a default execution context, as a page load does
    pub async fn create_context_with_id(&mut self, id: i64) {
        self.browser.emit(
            "Runtime.executionContextCreated",
            json!({ "context": { "id": id, "origin": "http://localhost", "auxData": { "isDefault": true, "frameId": "F1" } } }),
        );
        self.frontend.event("Runtime.executionContextCreated").await;
    }

    /// Send the runtime readiness marker
    pub fn announce_ready(&self) {
        self.browser.sandbox.lock().ready = true;
        self.browser.emit(
            "Runtime.consoleAPICalled",
            json!({
                "type": "debug",
                "args": [{ "type": "string", "value": READY_MARKER }, { "type": "string", "value": READY_TOKEN }],
                "executionContextId": 1,
            }),
        );
    }

    /// Announce readiness and wait for the marker to come through
    pub async fn make_ready(&mut self) {
        self.announce_ready();
        self.frontend.event("Runtime.consoleAPICalled").await;
    }

    /// Close the front-end socket and wait for the relay to wind down
    pub async fn disconnect_frontend(mut self) -> Result<()> {
        self.frontend.socket.close(None).await.unwrap();
        tokio::time::timeout(RECV_TIMEOUT, self.pump)
            .await
            .expect("relay did not stop")
            .expect("relay task panicked")
    }
}

/// Poll `check` until it holds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
