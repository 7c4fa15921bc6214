//! Child-process transport: line-delimited JSON-RPC on the provider's
//! standard streams.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use pybox_wire::CallToolParams;
use pybox_wire::CallToolResult;
use pybox_wire::InitializeResult;
use pybox_wire::JsonRpcMessage;
use pybox_wire::ListToolsResult;
use pybox_wire::RequestId;
use pybox_wire::methods;

use crate::ProviderError;
use crate::tool_result_or_error;

/// Capacity of the bounded channel between the client API and the writer
/// task.
const CHANNEL_CAPACITY: usize = 128;

/// Protocol revision sent in the `initialize` handshake.
const PROTOCOL_VERSION: &str = "2025-06-18";

type PendingSender = oneshot::Sender<JsonRpcMessage>;

/// A provider running as a child process of the coordinator.
pub struct StdioProviderClient {
    /// Retain the child so it is reaped when the client is dropped. The
    /// runtime makes a best effort to reap after exit; `close` does it
    /// deterministically.
    child: Option<Child>,

    /// Channel for sending frames *to* the background writer task.
    outgoing_tx: mpsc::Sender<JsonRpcMessage>,

    /// Map of `request.id -> oneshot::Sender` used to dispatch responses
    /// back to the originating caller.
    pending: Arc<Mutex<HashMap<i64, PendingSender>>>,

    /// Monotonically increasing counter used to generate request IDs.
    id_counter: AtomicI64,
}

impl StdioProviderClient {
    /// Spawns `command` and establishes the session over its stdio. `env`
    /// must already have its variable references resolved; it is merged
    /// over the inherited allowlist.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: HashMap<String, String>,
    ) -> Result<Self, ProviderError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .env_clear()
            .envs(create_env_for_provider(env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // If the coordinator dies (including SIGKILL), provider children
        // must not outlive it.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::getppid() == 1 {
                    libc::raise(libc::SIGTERM);
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Transport("failed to capture child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Transport("failed to capture child stdout".to_string()))?;

        Ok(Self::from_transport(Some(child), stdin, stdout))
    }

    /// Builds a client over arbitrary byte streams. Production code goes
    /// through [`StdioProviderClient::spawn`]; tests drive the protocol over
    /// an in-memory duplex.
    pub fn from_transport<W, R>(child: Option<Child>, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);
        let pending: Arc<Mutex<HashMap<i64, PendingSender>>> = Arc::new(Mutex::new(HashMap::new()));

        // Writer task: serializes one frame per line onto the provider's
        // stdin. A write failure means the provider is gone; fail whatever
        // is in flight so callers see a transport error instead of hanging.
        tokio::spawn({
            let pending = pending.clone();
            let mut writer = writer;
            async move {
                while let Some(msg) = outgoing_rx.recv().await {
                    match serde_json::to_string(&msg) {
                        Ok(frame) => {
                            debug!("frame to provider: {frame}");
                            if writer.write_all(frame.as_bytes()).await.is_err() {
                                error!("failed to write frame to provider stdin");
                                break;
                            }
                            if writer.write_all(b"\n").await.is_err() {
                                error!("failed to write frame delimiter to provider stdin");
                                break;
                            }
                        }
                        Err(e) => error!("failed to serialize outgoing frame: {e}"),
                    }
                }
                let mut guard = pending.lock().await;
                guard.clear();
            }
        });

        // Reader task: parses line-delimited frames from the provider's
        // stdout and routes responses to the pending map.
        tokio::spawn({
            let pending = pending.clone();
            let mut lines = BufReader::new(reader).lines();
            async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("frame from provider: {line}");
                    match serde_json::from_str::<JsonRpcMessage>(&line) {
                        Ok(msg @ JsonRpcMessage::Response(_)) | Ok(msg @ JsonRpcMessage::Error(_)) => {
                            dispatch_to_pending(msg, &pending).await;
                        }
                        Ok(JsonRpcMessage::Notification(note)) => {
                            info!("provider notification: {}", note.method);
                        }
                        Ok(JsonRpcMessage::Request(req)) => {
                            // Server-initiated requests are not part of this
                            // client's protocol surface.
                            warn!("ignoring provider-initiated request: {}", req.method);
                        }
                        Err(e) => {
                            error!("failed to parse provider frame: {e}; line = {line}");
                        }
                    }
                }
                // EOF: the provider went away. Fail everything in flight so
                // callers see a transport error instead of hanging.
                let mut guard = pending.lock().await;
                guard.clear();
            }
        });

        Self {
            child,
            outgoing_tx,
            pending,
            id_counter: AtomicI64::new(1),
        }
    }

    /// Sends `initialize` and the `initialized` notification.
    pub async fn initialize(&self) -> Result<(), ProviderError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "pybox",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request(methods::INITIALIZE, Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ProviderError::Protocol(format!("malformed initialize result: {e}")))?;
        debug!(
            "provider initialized: protocol {} ({})",
            init.protocol_version,
            init.server_info.map(|i| i.name).unwrap_or_default()
        );
        self.notify(methods::INITIALIZED, None).await?;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, ProviderError> {
        let result = self.request(methods::LIST_TOOLS, None).await?;
        serde_json::from_value(result)
            .map_err(|e| ProviderError::Protocol(format!("malformed tools/list result: {e}")))
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ProviderError> {
        let params = CallToolParams { name: name.to_string(), arguments };
        let params = serde_json::to_value(params)
            .map_err(|e| ProviderError::Protocol(format!("unencodable tool arguments: {e}")))?;
        let result = self.request(methods::CALL_TOOL, Some(params)).await?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| ProviderError::Protocol(format!("malformed tools/call result: {e}")))?;
        tool_result_or_error(result)
    }

    /// Sends an arbitrary request and awaits its result. Waits
    /// indefinitely; callers bound the wait where a bound is wanted.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ProviderError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let message = JsonRpcMessage::request(id, method, params);

        let (tx, rx) = oneshot::channel();

        // Register in the pending map *before* sending so an immediate
        // response cannot be lost.
        {
            let mut guard = self.pending.lock().await;
            guard.insert(id, tx);
        }

        if self.outgoing_tx.send(message).await.is_err() {
            let mut guard = self.pending.lock().await;
            guard.remove(&id);
            return Err(ProviderError::Transport(
                "provider connection closed (writer task gone)".to_string(),
            ));
        }

        let msg = rx.await.map_err(|_| {
            ProviderError::Transport("provider connection closed before a reply arrived".to_string())
        })?;

        match msg {
            JsonRpcMessage::Response(resp) => Ok(resp.result),
            JsonRpcMessage::Error(err) if method == methods::CALL_TOOL => {
                // Tool-call errors from the provider are its own verdict on
                // the call, reported verbatim.
                Err(ProviderError::Tool(err.error.message))
            }
            JsonRpcMessage::Error(err) => Err(ProviderError::Protocol(format!(
                "provider returned error for `{method}`: code = {}, message = {}",
                err.error.code, err.error.message
            ))),
            other => Err(ProviderError::Protocol(format!(
                "unexpected frame in reply path: {other:?}"
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProviderError> {
        let message = JsonRpcMessage::notification(method, params);
        self.outgoing_tx.send(message).await.map_err(|_| {
            ProviderError::Transport("provider connection closed (writer task gone)".to_string())
        })
    }

    pub async fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!("provider child already gone: {e}");
            }
            let _ = child.wait().await;
        }
    }
}

impl Drop for StdioProviderClient {
    fn drop(&mut self) {
        // kill_on_drop already tags the process; this forces an immediate
        // reap when it has exited by now.
        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
    }
}

async fn dispatch_to_pending(
    msg: JsonRpcMessage,
    pending: &Arc<Mutex<HashMap<i64, PendingSender>>>,
) {
    let id = match &msg {
        JsonRpcMessage::Response(resp) => &resp.id,
        JsonRpcMessage::Error(err) => &err.id,
        _ => return,
    };
    let id = match id {
        RequestId::Integer(i) => *i,
        RequestId::String(_) => {
            // This client only ever generates integer IDs.
            error!("response with string ID has no matching pending request");
            return;
        }
    };

    let tx_opt = {
        let mut guard = pending.lock().await;
        guard.remove(&id)
    };
    match tx_opt {
        // Send errors mean the caller gave up; nothing to do.
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => warn!(id, "no pending request found for response"),
    }
}

/// Environment variables that are always inherited when spawning a
/// provider. Providers get a curated environment, not the coordinator's
/// whole one; anything else must be listed in the spec's `env` map.
#[rustfmt::skip]
#[cfg(unix)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "HOME",
    "LANG",
    "LC_ALL",
    "LOGNAME",
    "PATH",
    "SHELL",
    "TERM",
    "TMPDIR",
    "TZ",
    "USER",
];

#[cfg(windows)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "PATH",
    "PATHEXT",
    "TEMP",
    "TMP",
    "USERDOMAIN",
    "USERNAME",
    "USERPROFILE",
];

fn create_env_for_provider(extra_env: HashMap<String, String>) -> HashMap<String, String> {
    DEFAULT_ENV_VARS
        .iter()
        .filter_map(|var| match std::env::var(var) {
            Ok(value) => Some((var.to_string(), value)),
            Err(_) => None,
        })
        .chain(extra_env)
        .collect()
}
