//! The public surface: one executor per sandbox session.
//!
//! [`CodeExecutor::stream`] is the single hard method. It submits code to
//! the kernel and streams events to the host — output chunks, approval
//! requests for every tool call the code makes, and one terminal result —
//! while charging wall-clock time against an execution budget that pauses
//! whenever the host is deciding an approval.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use pybox_protocol::ApprovalDecision;
use pybox_protocol::ApprovalDecisionMsg;
use pybox_protocol::ApprovalRequestMsg;
use pybox_protocol::CodeExecutionChunk;
use pybox_protocol::CodeExecutionResult;
use pybox_protocol::ExecutionError;
use pybox_protocol::OutputStream;
use pybox_provider_client::DEFAULT_CONNECT_TIMEOUT;
use pybox_provider_client::ProviderSpec;

use crate::ExecutorErr;
use crate::Result;
use crate::approval::ApprovalChannel;
use crate::budget::ExecutionBudget;
use crate::codegen;
use crate::kernel::Fragment;
use crate::kernel::KernelClient;
use crate::kernel::KernelClientConfig;
use crate::kernel::KernelInterrupt;
use crate::registry::ProviderRegistry;
use crate::tool_service::ToolService;

/// Grace period between interrupting the kernel on budget expiry and
/// raising to the caller.
const INTERRUPT_GRACE: Duration = Duration::from_millis(200);

/// Capacity 1: the host consumes events as fast as it wants and the driver
/// back-pressures on it.
const EVENT_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone)]
pub struct CodeExecutorConfig {
    pub kernel: KernelClientConfig,
    /// Filesystem root shared with the kernel; generated tool modules and
    /// the preamble live under `tools/` here.
    pub workspace: PathBuf,
    /// Where inline images are persisted unless a stream overrides it.
    pub images_dir: PathBuf,
    /// How long `/run` waits for a host decision. `None` waits
    /// indefinitely.
    pub approval_timeout: Option<Duration>,
    /// Bound on provider session startup.
    pub provider_connect_timeout: Duration,
}

impl CodeExecutorConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let images_dir = workspace.join("images");
        CodeExecutorConfig {
            kernel: KernelClientConfig::default(),
            workspace,
            images_dir,
            approval_timeout: None,
            provider_connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Per-stream options.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Execution budget; `None` is unbounded.
    pub timeout: Option<Duration>,
    /// Emit output fragments as [`ExecEvent::Chunk`] in addition to
    /// accumulating them into the result.
    pub chunks: bool,
    /// Environment exported into the kernel before the code runs.
    pub kernel_env: HashMap<String, String>,
    /// Overrides the session images directory for this stream.
    pub images_dir: Option<PathBuf>,
}

/// One event on a [`ExecutionStream`].
pub enum ExecEvent {
    Chunk(CodeExecutionChunk),
    ApprovalRequest(ApprovalHandle),
    Result(CodeExecutionResult),
}

/// A pending approval surfaced to the host. Exactly one of
/// [`accept`](ApprovalHandle::accept) / [`reject`](ApprovalHandle::reject)
/// should be called; resolving one the coordinator already cancelled is a
/// no-op.
pub struct ApprovalHandle {
    pub provider: String,
    pub tool: String,
    pub args: Value,
    id: String,
    decisions: mpsc::Sender<ApprovalDecisionMsg>,
}

impl ApprovalHandle {
    pub async fn accept(&self) {
        self.decide(ApprovalDecision::Accept).await;
    }

    pub async fn reject(&self) {
        self.decide(ApprovalDecision::Reject).await;
    }

    async fn decide(&self, decision: ApprovalDecision) {
        let msg = ApprovalDecisionMsg { id: self.id.clone(), decision };
        if self.decisions.send(msg).await.is_err() {
            debug!(id = %self.id, "decision dropped; approval peer already gone");
        }
    }
}

/// The event stream of one `stream` call. Ends after the terminal
/// [`ExecEvent::Result`] or an error item.
pub struct ExecutionStream {
    rx: mpsc::Receiver<Result<ExecEvent>>,
    interrupt: KernelInterrupt,
    approvals: Arc<ApprovalChannel>,
}

impl ExecutionStream {
    pub async fn next(&mut self) -> Option<Result<ExecEvent>> {
        self.rx.recv().await
    }

    /// Cancels the execution: interrupts the kernel and cancels any
    /// in-flight approval. The stream still delivers its terminal item.
    pub async fn cancel(&self) {
        self.approvals.cancel_all();
        if let Err(e) = self.interrupt.interrupt().await {
            warn!("cancel could not interrupt the kernel: {e}");
        }
    }
}

impl futures::Stream for ExecutionStream {
    type Item = Result<ExecEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub struct CodeExecutor {
    config: CodeExecutorConfig,
    registry: Arc<ProviderRegistry>,
    approvals: Arc<ApprovalChannel>,
    service: ToolService,
    kernel: Arc<Mutex<KernelClient>>,
    interrupt: StdMutex<KernelInterrupt>,
}

impl CodeExecutor {
    /// Brings the session up: binds the Tool Service, writes the preamble
    /// into the workspace, and connects to the kernel gateway.
    pub async fn start(config: CodeExecutorConfig) -> Result<Self> {
        let registry = Arc::new(ProviderRegistry::new(config.provider_connect_timeout));
        let approvals = Arc::new(ApprovalChannel::new(config.approval_timeout));
        let service = ToolService::bind(registry.clone(), approvals.clone()).await?;
        codegen::write_preamble(&config.workspace, &service.base_url(), &service.secret())?;

        let kernel = KernelClient::connect(config.kernel.clone()).await?;
        let interrupt = kernel.interrupt_handle();
        info!("executor started");

        Ok(CodeExecutor {
            config,
            registry,
            approvals,
            service,
            kernel: Arc::new(Mutex::new(kernel)),
            interrupt: StdMutex::new(interrupt),
        })
    }

    /// Adds or replaces a provider spec. Idempotent.
    pub async fn register_provider(&self, name: &str, spec: ProviderSpec) {
        self.registry.register(name, spec).await;
    }

    pub async fn deregister_provider(&self, name: &str) {
        self.registry.deregister(name).await;
    }

    /// Starts the provider session if needed, lists its tools, and
    /// materializes the typed Python modules kernel code imports. Returns
    /// the generated module names.
    pub async fn generate_tool_api(&self, provider: &str) -> Result<Vec<String>> {
        let session = self.registry.session_for(provider).await?;
        let tools = session.tools_sorted();
        codegen::generate_provider(&self.config.workspace, provider, &tools)
    }

    /// Where the Tool Service listens; kernel-side code reads the same
    /// address from the generated preamble.
    pub fn tool_service_addr(&self) -> std::net::SocketAddr {
        self.service.local_addr()
    }

    /// Submits `code` and returns its event stream. Submissions are
    /// serialized; a second call waits until the first completes.
    pub async fn stream(&self, code: &str, opts: StreamOptions) -> Result<ExecutionStream> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let interrupt = self.interrupt.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let ctx = DriverCtx {
            code: code.to_string(),
            opts,
            kernel: self.kernel.clone(),
            approvals: self.approvals.clone(),
            service_url: self.service.base_url(),
            secret: self.service.secret(),
            default_images_dir: self.config.images_dir.clone(),
            interrupt: interrupt.clone(),
            events: events_tx,
        };
        tokio::spawn(drive(ctx));

        Ok(ExecutionStream {
            rx: events_rx,
            interrupt,
            approvals: self.approvals.clone(),
        })
    }

    /// Convenience over [`stream`](Self::stream): accepts every approval
    /// request on the host's behalf and returns the final result. A kernel
    /// error still arrives inside the result, not as `Err`.
    pub async fn execute(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<CodeExecutionResult> {
        let mut stream = self
            .stream(code, StreamOptions { timeout, ..StreamOptions::default() })
            .await?;
        while let Some(event) = stream.next().await {
            match event? {
                ExecEvent::ApprovalRequest(request) => request.accept().await,
                ExecEvent::Result(result) => return Ok(result),
                ExecEvent::Chunk(_) => {}
            }
        }
        Err(ExecutorErr::BadState("stream ended without a result".to_string()))
    }

    /// Interrupts any running stream, cancels pending approvals, tears down
    /// provider sessions, replaces the kernel, and rotates the Tool Service
    /// secret (rewriting the preamble). Registered specs and generated
    /// modules survive.
    pub async fn reset(&self) -> Result<()> {
        let interrupt = self.interrupt.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Err(e) = interrupt.interrupt().await {
            debug!("reset interrupt: {e}");
        }
        self.approvals.cancel_all();

        let mut kernel = self.kernel.lock().await;
        self.registry.close_all().await;
        kernel.reset().await?;
        {
            let mut handle = self.interrupt.lock().unwrap_or_else(|e| e.into_inner());
            *handle = kernel.interrupt_handle();
        }

        let secret = self.service.rotate_secret();
        codegen::write_preamble(&self.config.workspace, &self.service.base_url(), &secret)?;
        info!("executor reset");
        Ok(())
    }

    /// Releases everything: kernel, providers, Tool Service.
    pub async fn close(self) {
        self.approvals.cancel_all();
        self.registry.close_all().await;
        {
            let mut kernel = self.kernel.lock().await;
            kernel.disconnect().await;
        }
        self.service.shutdown().await;
        info!("executor closed");
    }
}

struct DriverCtx {
    code: String,
    opts: StreamOptions,
    kernel: Arc<Mutex<KernelClient>>,
    approvals: Arc<ApprovalChannel>,
    service_url: String,
    secret: String,
    default_images_dir: PathBuf,
    interrupt: KernelInterrupt,
    events: mpsc::Sender<Result<ExecEvent>>,
}

/// Drives one submission end to end. Every exit path cancels pending
/// approvals and emits exactly one terminal item.
async fn drive(ctx: DriverCtx) {
    let DriverCtx {
        code,
        opts,
        kernel,
        approvals,
        service_url,
        secret,
        default_images_dir,
        interrupt,
        events,
    } = ctx;

    // Serializes submissions: the next stream waits here until we finish.
    let mut kernel = kernel.lock_owned().await;

    // Attach the approval peer only once we own the kernel slot; the
    // previous stream's peer may still be detaching on the service side.
    let peer = match ApprovalPeer::connect(&service_url, &secret).await {
        Ok(peer) => peer,
        Err(e) => {
            let _ = events.send(Err(e)).await;
            return;
        }
    };
    let ApprovalPeer { mut requests_rx, decision_tx, mut decided_rx, task: peer_task } = peer;

    let full_code = match env_prologue(&opts.kernel_env) {
        Some(prologue) => format!("{prologue}{code}"),
        None => code,
    };
    let mut execution = match kernel.submit(&full_code).await {
        Ok(execution) => execution,
        Err(e) => {
            approvals.cancel_all();
            let _ = events.send(Err(e)).await;
            return;
        }
    };

    let images_dir = opts.images_dir.unwrap_or(default_images_dir);
    let mut budget = ExecutionBudget::new(opts.timeout);
    let mut text = String::new();
    let mut images: Vec<PathBuf> = Vec::new();
    let mut kernel_error: Option<ExecutionError> = None;

    let outcome: Result<()> = loop {
        tokio::select! {
            Some(_id) = decided_rx.recv() => {
                budget.resume();
            }

            Some(request) = requests_rx.recv() => {
                // The kernel is blocked inside the tool call right now;
                // stop charging the budget until the host decides.
                budget.pause();
                let handle = ApprovalHandle {
                    provider: request.provider,
                    tool: request.tool,
                    args: request.args,
                    id: request.id,
                    decisions: decision_tx.clone(),
                };
                if events.send(Ok(ExecEvent::ApprovalRequest(handle))).await.is_err() {
                    break cancel_on_host_gone(&approvals, &interrupt).await;
                }
            }

            fragment = execution.next_fragment() => {
                // Output while paused means the tool call concluded without
                // a host decision (approval timeout); resume the clock.
                if budget.is_paused() {
                    budget.resume();
                }
                match fragment {
                    Err(e) => break Err(e),
                    Ok(None) | Ok(Some(Fragment::Completed)) => break Ok(()),
                    Ok(Some(Fragment::Stdout(chunk))) => {
                        text.push_str(&chunk);
                        if opts.chunks {
                            let event = ExecEvent::Chunk(CodeExecutionChunk::Text {
                                stream: OutputStream::Stdout,
                                text: chunk,
                            });
                            if events.send(Ok(event)).await.is_err() {
                                break cancel_on_host_gone(&approvals, &interrupt).await;
                            }
                        }
                    }
                    Ok(Some(Fragment::Stderr(chunk))) => {
                        text.push_str(&chunk);
                        if opts.chunks {
                            let event = ExecEvent::Chunk(CodeExecutionChunk::Text {
                                stream: OutputStream::Stderr,
                                text: chunk,
                            });
                            if events.send(Ok(event)).await.is_err() {
                                break cancel_on_host_gone(&approvals, &interrupt).await;
                            }
                        }
                    }
                    Ok(Some(Fragment::Image { mime, data })) => {
                        match persist_image(&images_dir, &mime, &data).await {
                            Ok(path) => {
                                images.push(path.clone());
                                if opts.chunks {
                                    let event = ExecEvent::Chunk(CodeExecutionChunk::Image { path });
                                    if events.send(Ok(event)).await.is_err() {
                                        break cancel_on_host_gone(&approvals, &interrupt).await;
                                    }
                                }
                            }
                            Err(e) => break Err(e),
                        }
                    }
                    Ok(Some(Fragment::Error(err))) => {
                        kernel_error = Some(err);
                    }
                }
            }

            _ = sleep_until_expiry(&budget), if !budget.is_paused() => {
                let timeout = opts.timeout.unwrap_or_default();
                warn!(?timeout, "execution budget exhausted; interrupting kernel");
                if let Err(e) = interrupt.interrupt().await {
                    error!("interrupt after budget expiry failed: {e}");
                }
                tokio::time::sleep(INTERRUPT_GRACE).await;
                break Err(ExecutorErr::BudgetTimeout(timeout));
            }
        }
    };

    // No approval outlives its execution, and a late host decision on a
    // cancelled request must be a no-op.
    approvals.cancel_all();

    match outcome {
        Ok(()) => {
            let result = CodeExecutionResult {
                text: if text.is_empty() { None } else { Some(text) },
                images,
                error: kernel_error,
            };
            let _ = events.send(Ok(ExecEvent::Result(result))).await;
        }
        Err(e) => {
            let _ = events.send(Err(e)).await;
        }
    }

    peer_task.abort();
    drop(execution);
    drop(kernel);
}

/// The host dropped the stream mid-run: treat it as cancellation.
async fn cancel_on_host_gone(
    approvals: &Arc<ApprovalChannel>,
    interrupt: &KernelInterrupt,
) -> Result<()> {
    info!("event stream dropped; cancelling execution");
    approvals.cancel_all();
    if let Err(e) = interrupt.interrupt().await {
        warn!("cancel could not interrupt the kernel: {e}");
    }
    Ok(())
}

async fn sleep_until_expiry(budget: &ExecutionBudget) {
    match budget.remaining() {
        Some(remaining) => tokio::time::sleep(remaining).await,
        None => std::future::pending().await,
    }
}

fn env_prologue(kernel_env: &HashMap<String, String>) -> Option<String> {
    if kernel_env.is_empty() {
        return None;
    }
    // A JSON object of string pairs is also a Python dict literal.
    let dict = serde_json::to_string(kernel_env).ok()?;
    Some(format!("import os\nos.environ.update({dict})\n"))
}

async fn persist_image(images_dir: &Path, mime: &str, data: &[u8]) -> Result<PathBuf> {
    let ext = match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        _ => "bin",
    };
    tokio::fs::create_dir_all(images_dir)
        .await
        .map_err(|e| ExecutorErr::workspace(images_dir, e))?;
    let id = Uuid::new_v4().simple().to_string();
    let path = images_dir.join(format!("{}.{ext}", &id[..8]));
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| ExecutorErr::workspace(&path, e))?;
    Ok(path)
}

/// Host-side peer of the approval channel: a WebSocket client of the Tool
/// Service's `/approvals` endpoint, owned by the driver of one stream.
struct ApprovalPeer {
    requests_rx: mpsc::Receiver<ApprovalRequestMsg>,
    decision_tx: mpsc::Sender<ApprovalDecisionMsg>,
    decided_rx: mpsc::Receiver<String>,
    task: tokio::task::JoinHandle<()>,
}

impl ApprovalPeer {
    /// Attaches as the service's single approval peer. A `409 Conflict`
    /// means the previous stream's peer has not finished detaching yet;
    /// retried briefly since only one driver runs at a time.
    async fn connect(service_url: &str, secret: &str) -> Result<ApprovalPeer> {
        let ws_url = format!(
            "ws{}/approvals",
            service_url
                .strip_prefix("http")
                .unwrap_or(service_url)
        );
        let bearer = HeaderValue::from_str(&format!("Bearer {secret}"))
            .map_err(|e| ExecutorErr::ToolService(format!("unusable secret: {e}")))?;

        let mut attempts = 0u32;
        let ws = loop {
            let mut request = ws_url.clone().into_client_request().map_err(|e| {
                ExecutorErr::ToolService(format!("bad approvals URL `{ws_url}`: {e}"))
            })?;
            request.headers_mut().insert(AUTHORIZATION, bearer.clone());

            match connect_async(request).await {
                Ok((ws, _)) => break ws,
                Err(tokio_tungstenite::tungstenite::Error::Http(resp))
                    if resp.status() == 409 && attempts < 40 =>
                {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => {
                    return Err(ExecutorErr::ToolService(format!(
                        "approvals connect failed: {e}"
                    )));
                }
            }
        };
        let (mut sink, mut stream) = ws.split();

        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (decision_tx, mut decision_rx) = mpsc::channel::<ApprovalDecisionMsg>(16);
        let (decided_tx, decided_rx) = mpsc::channel::<String>(16);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<ApprovalRequestMsg>(text.as_str()) {
                                Ok(request) => {
                                    if requests_tx.send(request).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => debug!("ignoring malformed approval frame: {e}"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("approval peer socket failed: {e}");
                            break;
                        }
                    },
                    decision = decision_rx.recv() => match decision {
                        Some(msg) => {
                            let id = msg.id.clone();
                            let frame = match serde_json::to_string(&msg) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    error!("failed to serialize decision: {e}");
                                    continue;
                                }
                            };
                            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                                break;
                            }
                            let _ = decided_tx.send(id).await;
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                }
            }
        });

        Ok(ApprovalPeer { requests_rx, decision_tx, decided_rx, task })
    }
}
