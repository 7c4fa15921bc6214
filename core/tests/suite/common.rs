//! Shared test infrastructure: a scripted fake kernel gateway and a mock
//! tool provider.
//!
//! The fake gateway speaks just enough of the kernel dialect to drive the
//! coordinator end to end: kernels are created over HTTP, `execute_request`
//! frames arrive on the channel socket, and each submission plays a
//! pre-loaded script of steps. A `CallTool` step performs a real `POST
//! /run` against the coordinator's Tool Service, exactly like generated
//! kernel-side code would.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::Request;
use wiremock::Respond;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_partial_json;
use wiremock::matchers::method;
use wiremock::matchers::path;

/// Installs a subscriber once so `RUST_LOG=debug` lights the suite up.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One step of a scripted submission. Steps run in order; the submission
/// ends with an `execute_reply` whose status reflects whether a step
/// raised.
pub enum Step {
    Stdout(String),
    Stderr(String),
    SleepMs(u64),
    /// A PNG display payload.
    Image(Vec<u8>),
    /// Call the coordinator's Tool Service the way generated kernel code
    /// does. On success prints the selected part of the result; on an error
    /// response "raises" `ToolCallError`, ending the submission with a
    /// kernel error whose traceback names the generated `run` call site.
    CallTool {
        provider: &'static str,
        tool: &'static str,
        args: Value,
        print: Print,
    },
    /// Block until the gateway receives an interrupt, then end the
    /// submission with a `KeyboardInterrupt` error.
    WaitInterrupt,
}

#[derive(Clone, Copy)]
pub enum Print {
    /// Print `result[field]` plus a newline.
    Field(&'static str),
    /// Print the raw string result plus a newline.
    Raw,
}

pub struct GatewayState {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    tool_service: Mutex<Option<(String, String)>>,
    kernels_created: Mutex<u32>,
    interrupts: watch::Sender<u32>,
}

pub struct FakeGateway {
    pub addr: SocketAddr,
    state: Arc<GatewayState>,
    _task: tokio::task::JoinHandle<()>,
}

impl FakeGateway {
    pub async fn start() -> FakeGateway {
        let (interrupts, _) = watch::channel(0u32);
        let state = Arc::new(GatewayState {
            scripts: Mutex::new(VecDeque::new()),
            tool_service: Mutex::new(None),
            kernels_created: Mutex::new(0),
            interrupts,
        });

        let app = Router::new()
            .route("/api/kernels", post(create_kernel))
            .route("/api/kernels/{id}", delete(delete_kernel))
            .route("/api/kernels/{id}/interrupt", post(interrupt_kernel))
            .route("/api/kernels/{id}/channels", get(channels))
            .with_state(state.clone());

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        FakeGateway { addr, state, _task: task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queues the script for the next submission.
    pub fn push_script(&self, steps: Vec<Step>) {
        self.state.scripts.lock().unwrap().push_back(steps);
    }

    /// Tells scripted `CallTool` steps where the Tool Service lives. Reads
    /// the same preamble file the kernel would import; call again after a
    /// reset to pick up the rotated secret.
    pub fn adopt_preamble(&self, workspace: &std::path::Path) {
        let (url, secret) = read_preamble(workspace);
        *self.state.tool_service.lock().unwrap() = Some((url, secret));
    }

    pub fn kernels_created(&self) -> u32 {
        *self.state.kernels_created.lock().unwrap()
    }

    pub fn interrupt_count(&self) -> u32 {
        *self.state.interrupts.borrow()
    }
}

/// Parses the service URL and bearer secret out of the generated preamble.
pub fn read_preamble(workspace: &std::path::Path) -> (String, String) {
    let source = std::fs::read_to_string(workspace.join("tools/_preamble.py")).unwrap();
    let pick = |prefix: &str| {
        source
            .lines()
            .find_map(|line| line.strip_prefix(prefix))
            .map(|rest| rest.trim_matches('"').to_string())
            .unwrap()
    };
    (
        pick("TOOL_SERVICE_URL = "),
        pick("TOOL_SERVICE_SECRET = "),
    )
}

async fn create_kernel(State(state): State<Arc<GatewayState>>) -> Response {
    let mut count = state.kernels_created.lock().unwrap();
    *count += 1;
    let id = format!("kernel-{count}");
    axum::Json(json!({"id": id})).into_response()
}

async fn delete_kernel(Path(_id): Path<String>) -> Response {
    axum::http::StatusCode::NO_CONTENT.into_response()
}

async fn interrupt_kernel(
    State(state): State<Arc<GatewayState>>,
    Path(_id): Path<String>,
) -> Response {
    state.interrupts.send_modify(|count| *count += 1);
    axum::http::StatusCode::NO_CONTENT.into_response()
}

async fn channels(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| kernel_socket(socket, state))
}

async fn kernel_socket(mut socket: WebSocket, state: Arc<GatewayState>) {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else { continue };
        let frame: Value = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        if frame["header"]["msg_type"].as_str() != Some("execute_request") {
            continue;
        }
        let msg_id = frame["header"]["msg_id"].as_str().unwrap_or_default().to_string();
        let code = frame["content"]["code"].as_str().unwrap_or_default().to_string();

        if code.contains("%colors") {
            send(&mut socket, reply_ok(&msg_id)).await;
            continue;
        }

        let script = state.scripts.lock().unwrap().pop_front().unwrap_or_default();
        play_script(&mut socket, &state, &msg_id, script).await;
    }
}

async fn play_script(
    socket: &mut WebSocket,
    state: &Arc<GatewayState>,
    msg_id: &str,
    script: Vec<Step>,
) {
    for step in script {
        match step {
            Step::Stdout(text) => send(socket, stream_msg(msg_id, "stdout", &text)).await,
            Step::Stderr(text) => send(socket, stream_msg(msg_id, "stderr", &text)).await,
            Step::SleepMs(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            Step::Image(bytes) => {
                let msg = json!({
                    "msg_type": "display_data",
                    "parent_header": {"msg_id": msg_id},
                    "content": {"data": {"image/png": BASE64.encode(&bytes)}},
                });
                send(socket, msg).await;
            }
            Step::CallTool { provider, tool, args, print } => {
                let (url, secret) = state
                    .tool_service
                    .lock()
                    .unwrap()
                    .clone()
                    .expect("test must call adopt_preamble before CallTool scripts");
                let response: Value = reqwest::Client::new()
                    .post(format!("{url}/run"))
                    .bearer_auth(secret)
                    .json(&json!({"provider": provider, "tool": tool, "args": args}))
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                if response["ok"].as_bool() == Some(true) {
                    let printed = match print {
                        Print::Field(field) => response["result"][field]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        Print::Raw => response["result"].as_str().unwrap_or_default().to_string(),
                    };
                    if !printed.is_empty() {
                        send(socket, stream_msg(msg_id, "stdout", &format!("{printed}\n"))).await;
                    }
                } else {
                    // Generated modules raise ToolCallError; the submission
                    // dies with a traceback through the `run` call site.
                    let kind = response["error"]["kind"].as_str().unwrap_or("internal_error");
                    let message = response["error"]["message"].as_str().unwrap_or_default();
                    let evalue = format!("{kind}: {message}");
                    let traceback = vec![
                        "Traceback (most recent call last):".to_string(),
                        "  File \"<ipython-input-1>\", line 2, in <module>".to_string(),
                        format!("  File \"tools/{provider}/{tool}.py\", line 27, in run"),
                        format!("ToolCallError: {evalue}"),
                    ];
                    let msg = json!({
                        "msg_type": "error",
                        "parent_header": {"msg_id": msg_id},
                        "content": {
                            "ename": "ToolCallError",
                            "evalue": evalue,
                            "traceback": traceback,
                        },
                    });
                    send(socket, msg).await;
                    send(socket, reply_error(msg_id)).await;
                    return;
                }
            }
            Step::WaitInterrupt => {
                // The interrupt may land before this step starts running
                // (zero-budget streams fire it immediately), so wait for
                // "any interrupt so far", not for the next edge.
                let mut rx = state.interrupts.subscribe();
                loop {
                    if *rx.borrow_and_update() > 0 {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
                let msg = json!({
                    "msg_type": "error",
                    "parent_header": {"msg_id": msg_id},
                    "content": {
                        "ename": "KeyboardInterrupt",
                        "evalue": "",
                        "traceback": ["KeyboardInterrupt"],
                    },
                });
                send(socket, msg).await;
                send(socket, reply_error(msg_id)).await;
                return;
            }
        }
    }
    send(socket, reply_ok(msg_id)).await;
}

async fn send(socket: &mut WebSocket, msg: Value) {
    let _ = socket.send(Message::Text(msg.to_string().into())).await;
}

fn stream_msg(msg_id: &str, name: &str, text: &str) -> Value {
    json!({
        "msg_type": "stream",
        "parent_header": {"msg_id": msg_id},
        "content": {"name": name, "text": text},
    })
}

fn reply_ok(msg_id: &str) -> Value {
    json!({
        "msg_type": "execute_reply",
        "parent_header": {"msg_id": msg_id},
        "content": {"status": "ok"},
    })
}

fn reply_error(msg_id: &str) -> Value {
    json!({
        "msg_type": "execute_reply",
        "parent_header": {"msg_id": msg_id},
        "content": {"status": "error"},
    })
}

/// Mounts a mock provider speaking the framed-HTTP transport: an `echo`
/// tool with a typed output schema and a `shout` tool without one.
pub async fn start_mock_provider() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "serverInfo": {"name": "mock-provider", "version": "0.0.1"}
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"tools": [
                {
                    "name": "echo",
                    "description": "Echo the input back.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"input": {"type": "string"}},
                        "required": ["input"]
                    },
                    "outputSchema": {
                        "type": "object",
                        "properties": {"echoed": {"type": "string"}},
                        "required": ["echoed"]
                    }
                },
                {
                    "name": "shout",
                    "description": "Uppercase the input.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"input": {"type": "string"}},
                        "required": ["input"]
                    }
                }
            ]}
        })))
        .mount(&server)
        .await;

    server
}

/// Responds to `tools/call` for the `echo` tool by echoing the `input`
/// argument back, mirroring a real provider.
pub struct EchoResponder;

impl Respond for EchoResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let id = body["id"].clone();
        let input = body["params"]["arguments"]["input"].as_str().unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "content": [{"type": "text", "text": format!("{{\"echoed\":\"{input}\"}}")}],
                "structuredContent": {"echoed": input}
            }
        }))
    }
}

pub async fn mount_echo_call(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(EchoResponder)
        .mount(server)
        .await;
}

pub fn provider_spec(server: &MockServer) -> pybox_core::ProviderSpec {
    pybox_core::ProviderSpec::Streamable {
        url: format!("{}/rpc", server.uri()),
        headers: std::collections::HashMap::new(),
        mode: Some(pybox_core::RemoteMode::Http),
    }
}

/// A host-side approval peer that answers every request the same way.
/// Counts the requests it saw.
pub struct AutoPeer {
    pub requests_seen: Arc<std::sync::atomic::AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl AutoPeer {
    pub async fn attach(addr: SocketAddr, secret: &str, accept: bool) -> AutoPeer {
        use futures::SinkExt;
        use futures::StreamExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = format!("ws://{addr}/approvals").into_client_request().unwrap();
        request.headers_mut().insert(
            tokio_tungstenite::tungstenite::http::header::AUTHORIZATION,
            format!("Bearer {secret}").parse().unwrap(),
        );
        let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        let (mut sink, mut stream) = ws.split();

        let requests_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = requests_seen.clone();
        let task = tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                let WsMessage::Text(text) = msg else { continue };
                let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else { continue };
                let Some(id) = frame["id"].as_str() else { continue };
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let decision = if accept { "accept" } else { "reject" };
                let reply = json!({"id": id, "decision": decision}).to_string();
                if sink.send(WsMessage::Text(reply.into())).await.is_err() {
                    break;
                }
            }
        });

        AutoPeer { requests_seen, task }
    }

    pub fn request_count(&self) -> usize {
        self.requests_seen.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Drop for AutoPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
