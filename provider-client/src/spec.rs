use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// How a remote provider frames its traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteMode {
    /// One HTTP POST per JSON-RPC message; the response body is JSON or a
    /// short-lived SSE stream that ends with the matching response.
    Http,
    /// A persistent GET event stream carries all server-to-client frames;
    /// requests are POSTed to the endpoint the stream announces.
    Sse,
}

/// Immutable descriptor for reaching one provider. The logical provider
/// name is the registry key, not part of the spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderSpec {
    /// A child process speaking line-delimited JSON-RPC on stdio. `env`
    /// values may contain `${VAR}` references; the registry resolves them
    /// against the coordinator's environment at session start.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// A remote HTTP endpoint. With `mode` absent the transport is
    /// auto-detected at connect time.
    Streamable {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<RemoteMode>,
    },
}
