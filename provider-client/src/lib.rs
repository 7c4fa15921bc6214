//! An async client for external tool providers.
//!
//! The client is intentionally lightweight. It can:
//!   1. Spawn a provider as a child process and speak line-delimited
//!      JSON-RPC over its standard streams, or reach a remote provider over
//!      HTTP (one framed request per call, or a long-poll event stream).
//!   2. Pair requests with their responses by request ID.
//!   3. Offer convenience helpers for the `tools/list` and `tools/call`
//!      methods every provider supports.
//!
//! Failure taxonomy matters more than transport detail here: a
//! [`ProviderError::Transport`] means the session is dead and the caller
//! should rebuild it, a [`ProviderError::Tool`] is the provider's own error
//! reported verbatim, and a [`ProviderError::Protocol`] marks a frame the
//! session cannot recover from.

mod error;
mod remote;
mod spec;
mod stdio;

use std::time::Duration;

use serde_json::Value;

pub use error::ProviderError;
pub use remote::RemoteProviderClient;
pub use spec::ProviderSpec;
pub use spec::RemoteMode;
pub use stdio::StdioProviderClient;

use pybox_wire::CallToolResult;
use pybox_wire::ListToolsResult;

/// Default bound on the connect handshake (spawn/dial + `initialize` +
/// `tools/list`).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A live connection to one provider, independent of transport.
pub enum ProviderClient {
    Stdio(StdioProviderClient),
    Remote(RemoteProviderClient),
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderClient::Stdio(_) => f.write_str("ProviderClient::Stdio"),
            ProviderClient::Remote(_) => f.write_str("ProviderClient::Remote"),
        }
    }
}

impl ProviderClient {
    /// Connects according to the spec and completes the initialize
    /// handshake. The whole operation is bounded by `connect_timeout`.
    pub async fn connect(
        spec: &ProviderSpec,
        connect_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let connect = async {
            match spec {
                ProviderSpec::Stdio { command, args, env } => {
                    let client = StdioProviderClient::spawn(command, args, env.clone()).await?;
                    client.initialize().await?;
                    Ok(ProviderClient::Stdio(client))
                }
                ProviderSpec::Streamable { url, headers, mode } => {
                    let client = RemoteProviderClient::connect(url, headers, *mode).await?;
                    Ok(ProviderClient::Remote(client))
                }
            }
        };
        match tokio::time::timeout(connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::ConnectTimeout(connect_timeout)),
        }
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, ProviderError> {
        match self {
            ProviderClient::Stdio(client) => client.list_tools().await,
            ProviderClient::Remote(client) => client.list_tools().await,
        }
    }

    /// Invokes one tool. Reentrant: concurrent calls on one session are
    /// multiplexed by request ID. There is no intrinsic timeout; the
    /// coordinator bounds tool time through its execution budget.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, ProviderError> {
        match self {
            ProviderClient::Stdio(client) => client.call_tool(name, arguments).await,
            ProviderClient::Remote(client) => client.call_tool(name, arguments).await,
        }
    }

    /// Tears the session down. Idempotent; errors during teardown are
    /// logged, not returned.
    pub async fn close(&mut self) {
        match self {
            ProviderClient::Stdio(client) => client.close().await,
            ProviderClient::Remote(client) => client.close().await,
        }
    }
}

/// Interprets a `tools/call` result: a provider marking `isError` is a
/// tool-level failure and its text content is the verbatim message.
pub(crate) fn tool_result_or_error(result: CallToolResult) -> Result<CallToolResult, ProviderError> {
    if result.is_error.unwrap_or(false) {
        Err(ProviderError::Tool(result.text()))
    } else {
        Ok(result)
    }
}
