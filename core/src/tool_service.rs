//! The in-process HTTP endpoint the kernel calls to invoke tools.
//!
//! Bound to loopback with a random bearer secret; the generated preamble
//! module is how kernel code learns the address and secret. `/run` applies
//! the approval gate, validates arguments against the tool's declared input
//! schema, and dispatches to the provider session, retrying once over a
//! fresh session on transport failure. A single WebSocket peer receives
//! approval requests and sends decisions back.

use std::sync::Arc;
use std::sync::RwLock;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::routing::put;
use futures::SinkExt;
use futures::StreamExt;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use pybox_protocol::ApprovalDecision;
use pybox_protocol::ApprovalDecisionMsg;
use pybox_protocol::ApprovalRequestMsg;
use pybox_protocol::RunToolRequest;
use pybox_protocol::RunToolResponse;
use pybox_protocol::ToolCallErrorKind;

use crate::ExecutorErr;
use crate::approval::ApprovalChannel;
use crate::approval::ApprovalError;
use crate::registry::ProviderRegistry;

const SECRET_LEN: usize = 32;

struct ServiceState {
    registry: Arc<ProviderRegistry>,
    approvals: Arc<ApprovalChannel>,
    secret: RwLock<String>,
}

/// A running Tool Service. Dropping it without `shutdown` leaves the server
/// task to die with the runtime; prefer the explicit path.
pub struct ToolService {
    addr: std::net::SocketAddr,
    state: Arc<ServiceState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ToolService {
    pub async fn bind(
        registry: Arc<ProviderRegistry>,
        approvals: Arc<ApprovalChannel>,
    ) -> crate::Result<Self> {
        let state = Arc::new(ServiceState {
            registry,
            approvals,
            secret: RwLock::new(generate_secret()),
        });

        let app = Router::new()
            .route("/status", get(status))
            .route("/reset", put(reset))
            .route("/run", post(run))
            .route("/approvals", get(approvals_ws))
            .with_state(state.clone());

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| ExecutorErr::ToolService(format!("bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ExecutorErr::ToolService(format!("no local address: {e}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!("tool service terminated: {e}");
            }
        });

        info!(%addr, "tool service listening");
        Ok(ToolService { addr, state, shutdown_tx: Some(shutdown_tx), task })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn secret(&self) -> String {
        self.state
            .secret
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces the bearer secret, invalidating every caller that still
    /// holds the old one. Used by `reset`.
    pub fn rotate_secret(&self) -> String {
        let fresh = generate_secret();
        let mut secret = self.state.secret.write().unwrap_or_else(|e| e.into_inner());
        *secret = fresh.clone();
        fresh
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

fn authorized(state: &ServiceState, headers: &HeaderMap) -> bool {
    let expected = {
        let secret = state.secret.read().unwrap_or_else(|e| e.into_inner());
        format!("Bearer {}", *secret)
    };
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|supplied| supplied == expected)
}

async fn status(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"status": "ok"})).into_response()
}

async fn reset(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.registry.close_all().await;
    Json(json!({"reset": "success"})).into_response()
}

async fn run(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    Json(request): Json<RunToolRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(run_tool(&state, request).await).into_response()
}

/// The `/run` pipeline: approval, then schema validation, then dispatch
/// with a single retry over a fresh session on transport failure. Every
/// outcome is an HTTP 200 body; the kernel-side preamble raises from it.
async fn run_tool(state: &ServiceState, request: RunToolRequest) -> RunToolResponse {
    let RunToolRequest { provider, tool, args } = request;
    let call = format!("{provider}.{tool}");

    match state.approvals.request(&provider, &tool, args.clone()).await {
        Ok(true) => {}
        Ok(false) => {
            return RunToolResponse::failure(
                ToolCallErrorKind::ApprovalRejected,
                format!("approval for {call} denied"),
            );
        }
        Err(ApprovalError::Timeout) => {
            return RunToolResponse::failure(
                ToolCallErrorKind::ApprovalTimeout,
                format!("approval for {call} expired"),
            );
        }
        Err(ApprovalError::Cancelled) => {
            return RunToolResponse::failure(
                ToolCallErrorKind::ApprovalCancelled,
                format!("approval for {call} cancelled"),
            );
        }
        Err(ApprovalError::Disconnected) => {
            return RunToolResponse::failure(
                ToolCallErrorKind::InternalError,
                "approval channel not connected",
            );
        }
    }

    let session = match state.registry.session_for(&provider).await {
        Ok(session) => session,
        Err(e) => return startup_failure(e),
    };

    let Some(decl) = session.tool(&tool) else {
        return RunToolResponse::failure(
            ToolCallErrorKind::ValidationError,
            format!("provider `{provider}` declares no tool `{tool}`"),
        );
    };
    if let Err(e) = decl.input_schema.validate(&args) {
        return RunToolResponse::failure(ToolCallErrorKind::ValidationError, e.to_string());
    }

    let invoke_args = invoke_arguments(&args);
    match session.invoke(&tool, invoke_args.clone()).await {
        Ok(result) => RunToolResponse::success(result.into_payload()),
        Err(e) if e.invalidates_session() => {
            warn!(%call, "invocation failed ({e}); retrying on a fresh session");
            state.registry.discard(&provider, session.generation).await;

            let session = match state.registry.session_for(&provider).await {
                Ok(session) => session,
                Err(e) => return startup_failure(e),
            };
            match session.invoke(&tool, invoke_args).await {
                Ok(result) => RunToolResponse::success(result.into_payload()),
                Err(retry_err) => {
                    if retry_err.invalidates_session() {
                        state.registry.discard(&provider, session.generation).await;
                    }
                    provider_failure(retry_err)
                }
            }
        }
        Err(e) => provider_failure(e),
    }
}

fn invoke_arguments(args: &Value) -> Option<Value> {
    match args {
        Value::Null => None,
        other => Some(other.clone()),
    }
}

fn startup_failure(err: ExecutorErr) -> RunToolResponse {
    match &err {
        ExecutorErr::UnknownProvider(_) => {
            RunToolResponse::failure(ToolCallErrorKind::ValidationError, err.to_string())
        }
        ExecutorErr::Provider { .. } => {
            RunToolResponse::failure(ToolCallErrorKind::TransportError, err.to_string())
        }
        _ => RunToolResponse::failure(ToolCallErrorKind::InternalError, err.to_string()),
    }
}

fn provider_failure(err: pybox_provider_client::ProviderError) -> RunToolResponse {
    use pybox_provider_client::ProviderError;
    match err {
        ProviderError::Tool(message) => {
            RunToolResponse::failure(ToolCallErrorKind::ToolError, message)
        }
        other => RunToolResponse::failure(ToolCallErrorKind::TransportError, other.to_string()),
    }
}

async fn approvals_ws(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let outbound_rx = match state.approvals.attach_peer() {
        Ok(rx) => rx,
        Err(_) => {
            warn!("refusing second approval peer");
            return StatusCode::CONFLICT.into_response();
        }
    };
    ws.on_upgrade(move |socket| approval_socket(socket, state, outbound_rx))
}

/// Per-peer loop: forwards outbound approval requests to the socket and
/// feeds decisions back into the channel. Runs until either side closes.
async fn approval_socket(
    socket: WebSocket,
    state: Arc<ServiceState>,
    mut outbound_rx: mpsc::Receiver<ApprovalRequestMsg>,
) {
    let (mut sink, mut stream) = socket.split();

    let mut sink_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let frame = match serde_json::to_string(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("failed to serialize approval request: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ApprovalDecisionMsg>(&text) {
                        Ok(decision) => {
                            let accept = decision.decision == ApprovalDecision::Accept;
                            state.approvals.decide(&decision.id, accept);
                        }
                        Err(e) => debug!("ignoring malformed decision frame: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("approval socket read failed: {e}");
                    break;
                }
            },
            _ = &mut sink_task => break,
        }
    }

    state.approvals.detach_peer();
    sink_task.abort();
    info!("approval peer disconnected");
}
