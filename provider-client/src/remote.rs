//! Remote provider transports.
//!
//! Two dialects exist in the wild. The framed-HTTP one sends each JSON-RPC
//! message as its own POST and answers with a JSON body or a short-lived
//! SSE stream ending in the matching response. The long-poll one keeps a
//! persistent GET event stream open for all server frames and POSTs
//! requests to an endpoint the stream announces. When the spec carries no
//! transport hint we probe framed HTTP first and fall back to long-poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::header::ACCEPT;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::warn;

use pybox_wire::CallToolParams;
use pybox_wire::CallToolResult;
use pybox_wire::InitializeResult;
use pybox_wire::JsonRpcMessage;
use pybox_wire::ListToolsResult;
use pybox_wire::RequestId;
use pybox_wire::methods;

use crate::ProviderError;
use crate::spec::RemoteMode;
use crate::tool_result_or_error;

const PROTOCOL_VERSION: &str = "2025-06-18";

type PendingSender = oneshot::Sender<JsonRpcMessage>;

pub struct RemoteProviderClient {
    inner: RemoteInner,
}

enum RemoteInner {
    Http(HttpTransport),
    Sse(SseTransport),
}

impl RemoteProviderClient {
    pub async fn connect(
        url: &str,
        headers: &HashMap<String, String>,
        mode: Option<RemoteMode>,
    ) -> Result<Self, ProviderError> {
        let header_map = build_headers(headers)?;
        let http = reqwest::Client::new();

        let inner = match mode {
            Some(RemoteMode::Http) => {
                RemoteInner::Http(HttpTransport::connect(http, url, header_map).await?)
            }
            Some(RemoteMode::Sse) => {
                RemoteInner::Sse(SseTransport::connect(http, url, header_map).await?)
            }
            None => {
                // Probe framed HTTP; a 4xx on the handshake means the
                // endpoint speaks the long-poll dialect.
                match HttpTransport::connect(http.clone(), url, header_map.clone()).await {
                    Ok(transport) => RemoteInner::Http(transport),
                    Err(ProviderError::Protocol(reason)) => {
                        debug!("framed HTTP handshake rejected ({reason}); trying long-poll");
                        RemoteInner::Sse(SseTransport::connect(http, url, header_map).await?)
                    }
                    Err(other) => return Err(other),
                }
            }
        };

        Ok(RemoteProviderClient { inner })
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

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProviderError> {
        let msg = match &self.inner {
            RemoteInner::Http(t) => t.round_trip(method, params).await?,
            RemoteInner::Sse(t) => t.round_trip(method, params).await?,
        };
        unwrap_reply(msg, method)
    }

    pub async fn close(&mut self) {
        if let RemoteInner::Sse(t) = &mut self.inner {
            t.close();
        }
    }
}

fn unwrap_reply(msg: JsonRpcMessage, method: &str) -> Result<Value, ProviderError> {
    match msg {
        JsonRpcMessage::Response(resp) => Ok(resp.result),
        JsonRpcMessage::Error(err) if method == methods::CALL_TOOL => {
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

fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "pybox",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

fn check_initialize_result(result: Value) -> Result<(), ProviderError> {
    let init: InitializeResult = serde_json::from_value(result)
        .map_err(|e| ProviderError::Protocol(format!("malformed initialize result: {e}")))?;
    debug!(
        "provider initialized: protocol {} ({})",
        init.protocol_version,
        init.server_info.map(|i| i.name).unwrap_or_default()
    );
    Ok(())
}

fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap, ProviderError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|e| ProviderError::Protocol(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::try_from(value.as_str())
            .map_err(|e| ProviderError::Protocol(format!("invalid header value for `{name:?}`: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Framed HTTP: one POST per message.
struct HttpTransport {
    http: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    id_counter: AtomicI64,
}

impl HttpTransport {
    async fn connect(
        http: reqwest::Client,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Self, ProviderError> {
        let url = Url::parse(url)
            .map_err(|e| ProviderError::Protocol(format!("invalid provider URL `{url}`: {e}")))?;
        let transport = HttpTransport { http, url, headers, id_counter: AtomicI64::new(1) };
        let reply = transport
            .round_trip(methods::INITIALIZE, Some(initialize_params()))
            .await?;
        check_initialize_result(unwrap_reply(reply, methods::INITIALIZE)?)?;
        transport.send_notification(methods::INITIALIZED, None).await?;
        Ok(transport)
    }

    async fn round_trip(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcMessage, ProviderError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let message = JsonRpcMessage::request(id, method, params);

        let resp = self
            .http
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&message)
            .send()
            .await?;

        let status = resp.status();
        if status.is_client_error() {
            // Surfaced as a protocol error so transport auto-detection can
            // fall back without retry churn.
            return Err(ProviderError::Protocol(format!(
                "provider rejected `{method}` with status {status}"
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::Transport(format!(
                "provider answered `{method}` with status {status}"
            )));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            read_response_from_sse(resp, id).await
        } else {
            let body = resp.text().await?;
            serde_json::from_str::<JsonRpcMessage>(&body)
                .map_err(|e| ProviderError::Protocol(format!("malformed response frame: {e}")))
        }
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ProviderError> {
        let message = JsonRpcMessage::notification(method, params);
        let resp = self
            .http
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&message)
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != StatusCode::ACCEPTED {
            return Err(ProviderError::Transport(format!(
                "provider answered notification `{method}` with status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Reads a short-lived SSE body until the frame matching `id` arrives.
async fn read_response_from_sse(
    resp: reqwest::Response,
    id: i64,
) -> Result<JsonRpcMessage, ProviderError> {
    let mut stream = resp.bytes_stream().eventsource();
    while let Some(event) = stream.next().await {
        let event = event
            .map_err(|e| ProviderError::Transport(format!("response stream failed: {e}")))?;
        let msg = match serde_json::from_str::<JsonRpcMessage>(&event.data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("skipping unparseable stream event: {e}");
                continue;
            }
        };
        match &msg {
            JsonRpcMessage::Response(resp) if resp.id == RequestId::Integer(id) => return Ok(msg),
            JsonRpcMessage::Error(err) if err.id == RequestId::Integer(id) => return Ok(msg),
            _ => debug!("ignoring interim stream frame"),
        }
    }
    Err(ProviderError::Transport(
        "provider closed the response stream before replying".to_string(),
    ))
}

/// Long-poll: a persistent GET stream carries all server frames; requests
/// are POSTed to the endpoint announced by the stream's first event.
struct SseTransport {
    http: reqwest::Client,
    post_url: Url,
    headers: HeaderMap,
    pending: Arc<Mutex<HashMap<i64, PendingSender>>>,
    id_counter: AtomicI64,
    reader: JoinHandle<()>,
}

impl SseTransport {
    async fn connect(
        http: reqwest::Client,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Self, ProviderError> {
        let base = Url::parse(url)
            .map_err(|e| ProviderError::Protocol(format!("invalid provider URL `{url}`: {e}")))?;

        let resp = http
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ProviderError::Transport(format!(
                "provider answered event-channel open with status {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream().eventsource();

        // The first event names the endpoint to POST requests to.
        let endpoint = loop {
            match stream.next().await {
                Some(Ok(event)) if event.event == "endpoint" => break event.data,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ProviderError::Transport(format!("event channel failed: {e}")));
                }
                None => {
                    return Err(ProviderError::Protocol(
                        "event channel closed before announcing an endpoint".to_string(),
                    ));
                }
            }
        };
        let post_url = base
            .join(&endpoint)
            .map_err(|e| ProviderError::Protocol(format!("invalid endpoint `{endpoint}`: {e}")))?;

        let pending: Arc<Mutex<HashMap<i64, PendingSender>>> = Arc::new(Mutex::new(HashMap::new()));

        // Reader task: every server frame arrives on this stream; route
        // responses to the pending map.
        let reader = tokio::spawn({
            let pending = pending.clone();
            async move {
                while let Some(event) = stream.next().await {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            error!("event channel failed: {e}");
                            break;
                        }
                    };
                    match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                        Ok(msg @ JsonRpcMessage::Response(_))
                        | Ok(msg @ JsonRpcMessage::Error(_)) => {
                            let id = match &msg {
                                JsonRpcMessage::Response(r) => r.id.clone(),
                                JsonRpcMessage::Error(e) => e.id.clone(),
                                _ => unreachable!(),
                            };
                            let RequestId::Integer(id) = id else {
                                warn!("response with string ID has no pending request");
                                continue;
                            };
                            let tx_opt = {
                                let mut guard = pending.lock().await;
                                guard.remove(&id)
                            };
                            if let Some(tx) = tx_opt {
                                let _ = tx.send(msg);
                            }
                        }
                        Ok(_) => debug!("ignoring non-response frame on event channel"),
                        Err(e) => debug!("skipping unparseable event: {e}"),
                    }
                }
                // Stream gone: fail everything in flight.
                pending.lock().await.clear();
            }
        });

        let transport = SseTransport {
            http,
            post_url,
            headers,
            pending,
            id_counter: AtomicI64::new(1),
            reader,
        };

        let reply = transport
            .round_trip(methods::INITIALIZE, Some(initialize_params()))
            .await?;
        check_initialize_result(unwrap_reply(reply, methods::INITIALIZE)?)?;
        transport.post_notification(methods::INITIALIZED, None).await?;

        Ok(transport)
    }

    async fn round_trip(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcMessage, ProviderError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let message = JsonRpcMessage::request(id, method, params);

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending.lock().await;
            guard.insert(id, tx);
        }

        let resp = self
            .http
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .json(&message)
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::ACCEPTED => {}
            Ok(resp) => {
                self.pending.lock().await.remove(&id);
                return Err(ProviderError::Transport(format!(
                    "provider answered `{method}` with status {}",
                    resp.status()
                )));
            }
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(e.into());
            }
        }

        rx.await.map_err(|_| {
            ProviderError::Transport("event channel closed before a reply arrived".to_string())
        })
    }

    async fn post_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ProviderError> {
        let message = JsonRpcMessage::notification(method, params);
        let resp = self
            .http
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .json(&message)
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != StatusCode::ACCEPTED {
            return Err(ProviderError::Transport(format!(
                "provider answered notification `{method}` with status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.reader.abort();
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
