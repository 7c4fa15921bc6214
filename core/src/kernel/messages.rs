//! The gateway's message dialect, and its demultiplexing into fragments.
//!
//! Replies are JSON messages with a `msg_type`, a `parent_header` naming
//! the submission they answer, and a type-specific `content`. Only the
//! handful of types below matter; everything else (status churn, input
//! requests we disabled) is ignored.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use pybox_protocol::ExecutionError;

/// One typed piece of kernel output on the reply stream, in kernel emission
/// order.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Stdout(String),
    Stderr(String),
    /// Inline display payload; the coordinator persists the bytes.
    Image { mime: String, data: Vec<u8> },
    /// The kernel raised. Always followed by `Completed`.
    Error(ExecutionError),
    Completed,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub msg_type: Option<String>,
    #[serde(default)]
    pub header: Value,
    #[serde(default)]
    pub parent_header: Value,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl WireMessage {
    /// The gateway mirrors `msg_type` at the top level; fall back to the
    /// header for dialects that do not.
    pub fn msg_type(&self) -> &str {
        self.msg_type
            .as_deref()
            .or_else(|| self.header.get("msg_type").and_then(Value::as_str))
            .unwrap_or_default()
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }
}

/// What one reply message means for the current submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    /// Output fragments, possibly several (a display message can carry a
    /// text rendering and an image side by side).
    Outputs(Vec<Fragment>),
    /// The kernel reported a raised error; saved and surfaced when the
    /// matching reply arrives.
    Error(ExecutionError),
    /// `execute_reply`: the submission finished.
    Reply { ok: bool },
    Ignore,
}

pub fn interpret(msg: &WireMessage) -> Interpretation {
    match msg.msg_type() {
        "stream" => {
            let text = msg
                .content
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let fragment = match msg.content.get("name").and_then(Value::as_str) {
                Some("stderr") => Fragment::Stderr(text),
                _ => Fragment::Stdout(text),
            };
            Interpretation::Outputs(vec![fragment])
        }
        "error" => Interpretation::Error(error_from_content(&msg.content)),
        "execute_reply" => {
            let ok = msg.content.get("status").and_then(Value::as_str) != Some("error");
            Interpretation::Reply { ok }
        }
        "execute_result" | "display_data" => {
            let Some(data) = msg.content.get("data").and_then(Value::as_object) else {
                return Interpretation::Ignore;
            };
            let mut outputs = Vec::new();
            if let Some(text) = data.get("text/plain").and_then(Value::as_str) {
                outputs.push(Fragment::Stdout(text.to_string()));
            }
            if let Some(encoded) = data.get("image/png").and_then(Value::as_str) {
                match BASE64.decode(encoded.trim()) {
                    Ok(bytes) => outputs.push(Fragment::Image {
                        mime: "image/png".to_string(),
                        data: bytes,
                    }),
                    Err(e) => {
                        tracing::warn!("dropping undecodable image payload: {e}");
                    }
                }
            }
            if outputs.is_empty() {
                Interpretation::Ignore
            } else {
                Interpretation::Outputs(outputs)
            }
        }
        _ => Interpretation::Ignore,
    }
}

pub(crate) fn error_from_content(content: &Value) -> ExecutionError {
    ExecutionError {
        name: content
            .get("ename")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Error")
            .to_string(),
        message: content
            .get("evalue")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        traceback: content
            .get("traceback")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Builds an `execute_request` frame for the shell channel.
pub fn execute_request(session_id: &str, msg_id: &str, code: &str) -> Value {
    json!({
        "header": {
            "username": "",
            "version": "5.0",
            "session": session_id,
            "msg_id": msg_id,
            "msg_type": "execute_request",
        },
        "parent_header": {},
        "channel": "shell",
        "content": {
            "code": code,
            "silent": false,
            "store_history": false,
            "user_expressions": {},
            "allow_stdin": false,
        },
        "metadata": {},
        "buffers": [],
    })
}
