use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;
use thiserror::Error;

/// Which kernel stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One streamed piece of execution output, emitted in kernel order when the
/// caller asked for chunked delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Display)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CodeExecutionChunk {
    Text {
        stream: OutputStream,
        text: String,
    },
    /// An inline image the kernel produced, already persisted under the
    /// session's images directory.
    Image {
        path: PathBuf,
    },
}

/// Error raised by code running in the kernel, delivered inside the terminal
/// result rather than as a stream failure: user code may well have caught
/// and re-raised, and the session stays usable either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{name}: {message}")]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
    pub traceback: Vec<String>,
}

/// Terminal event of one code submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionResult {
    /// Concatenated output text, `None` when the execution printed nothing.
    pub text: Option<String>,
    /// Images generated during execution, in emission order.
    pub images: Vec<PathBuf>,
    /// Set when the kernel raised.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

/// Kinds of tool call failure reported to the kernel in the `/run` response
/// body. The kernel-side preamble turns these into a raised `ToolCallError`
/// carrying the kind string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolCallErrorKind {
    /// Arguments did not match the tool's input schema. Never retried.
    ValidationError,
    /// The host rejected the call.
    ApprovalRejected,
    /// No decision arrived within the approval timeout.
    ApprovalTimeout,
    /// The surrounding execution was cancelled while the call waited.
    ApprovalCancelled,
    /// Provider connection or framing failure, after the one-shot retry
    /// against a fresh session also failed.
    TransportError,
    /// The provider reported a tool-level error; the message is verbatim.
    ToolError,
    /// Coordinator-side failure that fits none of the above.
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorBody {
    pub kind: ToolCallErrorKind,
    pub message: String,
}

/// Body of `POST /run` on the Tool Service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunToolRequest {
    pub provider: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// Response body of `POST /run`. Always delivered with HTTP 200: transport
/// status is reserved for infrastructure failures (bad secret, no route),
/// and everything tool-protocol-level travels in the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunToolResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorBody>,
}

impl RunToolResponse {
    pub fn success(result: Value) -> Self {
        RunToolResponse { ok: true, result: Some(result), error: None }
    }

    pub fn failure(kind: ToolCallErrorKind, message: impl Into<String>) -> Self {
        RunToolResponse {
            ok: false,
            result: None,
            error: Some(ToolErrorBody { kind, message: message.into() }),
        }
    }
}

/// Outbound frame on the approval channel: one message per pending tool
/// call, sent to the single attached host peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequestMsg {
    /// Server-chosen, unique within the session, never reused.
    pub id: String,
    pub provider: String,
    pub tool: String,
    pub args: Value,
    /// Creation time, milliseconds since the Unix epoch.
    pub ts: u64,
}

/// The host's verdict on a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalDecision {
    Accept,
    Reject,
}

/// Inbound frame on the approval channel. Unknown or already-settled `id`s
/// are silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecisionMsg {
    pub id: String,
    pub decision: ApprovalDecision,
}
