//! Defines the protocol between a host application and a pybox session.
//!
//! A session streams events for each code submission (output chunks,
//! approval requests, one terminal result) and serves the Tool Service wire
//! format that generated kernel-side modules call into. Everything here is
//! plain serializable data; the live handles that carry decisions back are
//! in `pybox-core`.

mod protocol;

pub use protocol::ApprovalDecision;
pub use protocol::ApprovalDecisionMsg;
pub use protocol::ApprovalRequestMsg;
pub use protocol::CodeExecutionChunk;
pub use protocol::CodeExecutionResult;
pub use protocol::ExecutionError;
pub use protocol::OutputStream;
pub use protocol::RunToolRequest;
pub use protocol::RunToolResponse;
pub use protocol::ToolCallErrorKind;
pub use protocol::ToolErrorBody;
