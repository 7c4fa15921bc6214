//! Connects to the kernel gateway and drives one submission at a time.

use std::collections::VecDeque;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio::time::timeout;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::ExecutorErr;
use crate::Result;
use crate::kernel::messages::Fragment;
use crate::kernel::messages::Interpretation;
use crate::kernel::messages::WireMessage;
use crate::kernel::messages::error_from_content;
use crate::kernel::messages::execute_request;
use crate::kernel::messages::interpret;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct KernelClientConfig {
    /// HTTP base of the kernel gateway, e.g. `http://localhost:8888`.
    pub base_url: String,
    /// Ping cadence while waiting on the reply stream. Silence for twice
    /// this interval counts as lost liveness.
    pub heartbeat_interval: Duration,
    pub connect_retries: u32,
    pub retry_interval: Duration,
}

impl Default for KernelClientConfig {
    fn default() -> Self {
        KernelClientConfig {
            base_url: "http://localhost:8888".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            connect_retries: 10,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Interrupt endpoint handle, detachable from the client so the driver loop
/// can fire it while a submission stream is borrowed.
#[derive(Clone)]
pub struct KernelInterrupt {
    http: reqwest::Client,
    url: String,
}

impl KernelInterrupt {
    pub async fn interrupt(&self) -> Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| ExecutorErr::Kernel(format!("interrupt failed: {e}")))?;
        info!("kernel interrupted: {}", resp.status());
        Ok(())
    }
}

pub struct KernelClient {
    http: reqwest::Client,
    config: KernelClientConfig,
    session_id: String,
    kernel_id: String,
    ws_tx: SplitSink<WsStream, WsMessage>,
    ws_rx: SplitStream<WsStream>,
}

impl KernelClient {
    /// Creates a kernel on the gateway (with retries while the gateway
    /// boots), opens its channel socket, and disables traceback coloring so
    /// errors arrive clean.
    pub async fn connect(config: KernelClientConfig) -> Result<Self> {
        let http = reqwest::Client::new();
        let session_id = Uuid::new_v4().simple().to_string();
        let kernel_id = create_kernel(&http, &config).await?;

        let ws_url = channels_url(&config.base_url, &kernel_id, &session_id)?;
        let (ws, _) = connect_async(&ws_url)
            .await
            .map_err(|e| ExecutorErr::Kernel(format!("channel socket connect failed: {e}")))?;
        let (ws_tx, ws_rx) = ws.split();
        info!(%kernel_id, "connected to kernel");

        let mut client = KernelClient { http, config, session_id, kernel_id, ws_tx, ws_rx };
        client.init_kernel().await?;
        Ok(client)
    }

    async fn init_kernel(&mut self) -> Result<()> {
        let mut execution = self.submit("%colors nocolor").await?;
        while execution.next_fragment().await?.is_some() {}
        Ok(())
    }

    /// Submits code and returns the fragment stream for it. One submission
    /// is in flight at a time; the coordinator serializes callers.
    pub async fn submit(&mut self, code: &str) -> Result<Execution<'_>> {
        let msg_id = Uuid::new_v4().simple().to_string();
        let frame = execute_request(&self.session_id, &msg_id, code);
        self.ws_tx
            .send(WsMessage::Text(frame.to_string().into()))
            .await
            .map_err(|e| ExecutorErr::Kernel(format!("submit failed: {e}")))?;
        debug!(%msg_id, "submitted code to kernel");
        Ok(Execution {
            client: self,
            msg_id,
            pending: VecDeque::new(),
            saved_error: None,
            done: false,
            last_rx: Instant::now(),
        })
    }

    pub fn interrupt_handle(&self) -> KernelInterrupt {
        KernelInterrupt {
            http: self.http.clone(),
            url: format!("{}/api/kernels/{}/interrupt", self.config.base_url, self.kernel_id),
        }
    }

    /// Tears down the kernel and starts a fresh one. Variables do not
    /// survive; that is the point.
    pub async fn reset(&mut self) -> Result<()> {
        self.delete_kernel().await;
        self.kernel_id = create_kernel(&self.http, &self.config).await?;
        let ws_url = channels_url(&self.config.base_url, &self.kernel_id, &self.session_id)?;
        let (ws, _) = connect_async(&ws_url)
            .await
            .map_err(|e| ExecutorErr::Kernel(format!("channel socket reconnect failed: {e}")))?;
        let (ws_tx, ws_rx) = ws.split();
        self.ws_tx = ws_tx;
        self.ws_rx = ws_rx;
        info!(kernel_id = %self.kernel_id, "kernel reset");
        self.init_kernel().await
    }

    /// Closes the channel socket and deletes the kernel on the gateway.
    /// The client is unusable afterwards.
    pub async fn disconnect(&mut self) {
        let _ = self.ws_tx.close().await;
        self.delete_kernel().await;
    }

    async fn delete_kernel(&self) {
        let url = format!("{}/api/kernels/{}", self.config.base_url, self.kernel_id);
        match self.http.delete(&url).send().await {
            Ok(resp) => debug!("kernel deleted: {}", resp.status()),
            Err(e) => warn!("kernel delete failed: {e}"),
        }
    }
}

async fn create_kernel(http: &reqwest::Client, config: &KernelClientConfig) -> Result<String> {
    let url = format!("{}/api/kernels", config.base_url);
    let mut last_error = String::new();
    for attempt in 0..config.connect_retries {
        if attempt > 0 {
            tokio::time::sleep(config.retry_interval).await;
        }
        let result = async {
            let resp = http.post(&url).json(&json!({"name": "python"})).send().await?;
            let resp = resp.error_for_status()?;
            let body: serde_json::Value = resp.json().await?;
            Ok::<_, anyhow::Error>(body.get("id").and_then(serde_json::Value::as_str).map(str::to_string))
        }
        .await;
        match result {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => last_error = "gateway reply carried no kernel id".to_string(),
            Err(e) => last_error = e.to_string(),
        }
        debug!(attempt, "kernel create attempt failed: {last_error}");
    }
    Err(ExecutorErr::Kernel(format!("failed to create kernel: {last_error}")))
}

fn channels_url(base_url: &str, kernel_id: &str, session_id: &str) -> Result<String> {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ExecutorErr::Kernel(format!("unsupported gateway URL `{base_url}`")));
    };
    Ok(format!("{ws_base}/api/kernels/{kernel_id}/channels?session_id={session_id}"))
}

/// The reply stream of one submission.
///
/// Pulls messages off the shared channel socket, keeps only those parented
/// to this submission, and queues the derived fragments so a cancelled poll
/// never loses output.
pub struct Execution<'a> {
    client: &'a mut KernelClient,
    msg_id: String,
    pending: VecDeque<Fragment>,
    saved_error: Option<pybox_protocol::ExecutionError>,
    done: bool,
    last_rx: Instant,
}

impl Execution<'_> {
    /// Next fragment in kernel emission order; `None` after `Completed`.
    pub async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                if matches!(fragment, Fragment::Completed) {
                    self.done = true;
                }
                return Ok(Some(fragment));
            }
            if self.done {
                return Ok(None);
            }

            let heartbeat = self.client.config.heartbeat_interval;
            let msg = match timeout(heartbeat, self.client.ws_rx.next()).await {
                Ok(Some(Ok(msg))) => {
                    self.last_rx = Instant::now();
                    msg
                }
                Ok(Some(Err(e))) => {
                    return Err(ExecutorErr::Kernel(format!("channel socket failed: {e}")));
                }
                Ok(None) => {
                    return Err(ExecutorErr::Kernel("kernel disconnected".to_string()));
                }
                Err(_) => {
                    // Quiet interval: ping, and declare liveness lost after
                    // a second silent interval.
                    if self.last_rx.elapsed() >= heartbeat * 2 {
                        return Err(ExecutorErr::Kernel("kernel liveness lost".to_string()));
                    }
                    if self
                        .client
                        .ws_tx
                        .send(WsMessage::Ping(Vec::new().into()))
                        .await
                        .is_err()
                    {
                        return Err(ExecutorErr::Kernel("kernel disconnected".to_string()));
                    }
                    continue;
                }
            };

            let text = match &msg {
                WsMessage::Text(text) => text.as_str(),
                WsMessage::Close(_) => {
                    return Err(ExecutorErr::Kernel("kernel disconnected".to_string()));
                }
                // Pongs and control frames refresh `last_rx` above.
                _ => continue,
            };

            let wire: WireMessage = match serde_json::from_str(text) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!("skipping unparseable kernel message: {e}");
                    continue;
                }
            };
            if wire.parent_msg_id() != Some(self.msg_id.as_str()) {
                continue;
            }

            match interpret(&wire) {
                Interpretation::Outputs(outputs) => self.pending.extend(outputs),
                Interpretation::Error(err) => self.saved_error = Some(err),
                Interpretation::Reply { ok } => {
                    if !ok {
                        let err = self
                            .saved_error
                            .take()
                            .unwrap_or_else(|| error_from_content(&wire.content));
                        self.pending.push_back(Fragment::Error(err));
                    }
                    self.pending.push_back(Fragment::Completed);
                }
                Interpretation::Ignore => {}
            }
        }
    }
}
