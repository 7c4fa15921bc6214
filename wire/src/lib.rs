//! Wire dialect spoken between the coordinator and tool providers.
//!
//! Providers declare their tools with JSON Schema-style input/output schemas
//! and execute them over JSON-RPC 2.0, either on the standard streams of a
//! child process or over HTTP. This crate holds the framing types, the
//! schema subset providers are allowed to use, and schema-based argument
//! validation. It deliberately contains no I/O.

mod jsonrpc;
mod schema;
mod tools;

pub use jsonrpc::JSONRPC_VERSION;
pub use jsonrpc::JsonRpcError;
pub use jsonrpc::JsonRpcErrorObject;
pub use jsonrpc::JsonRpcMessage;
pub use jsonrpc::JsonRpcNotification;
pub use jsonrpc::JsonRpcRequest;
pub use jsonrpc::JsonRpcResponse;
pub use jsonrpc::RequestId;
pub use schema::Schema;
pub use schema::SchemaError;
pub use tools::CallToolParams;
pub use tools::CallToolResult;
pub use tools::ContentBlock;
pub use tools::InitializeResult;
pub use tools::ListToolsResult;
pub use tools::ProviderInfo;
pub use tools::ToolDecl;

/// Method names of the provider protocol. Kept in one place so the client
/// and test fixtures cannot drift apart.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const LIST_TOOLS: &str = "tools/list";
    pub const CALL_TOOL: &str = "tools/call";
}
