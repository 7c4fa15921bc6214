//! Coordinator for a stateful Python code-execution sandbox.
//!
//! A [`CodeExecutor`] owns four long-lived subsystems and multiplexes them
//! under a single streaming call:
//!
//! * a persistent interactive kernel, reached through a Jupyter-compatible
//!   gateway ([`kernel`]),
//! * a registry of external tool providers with lazily started, cached
//!   sessions ([`registry`]),
//! * an in-process Tool Service the kernel calls back into to invoke tools
//!   ([`tool_service`]), and
//! * an approval channel that lets the host veto every individual tool
//!   invocation before it reaches a provider ([`approval`]).
//!
//! Generated, typed Python modules ([`codegen`]) are what kernel code
//! imports to reach the Tool Service.

pub mod approval;
pub mod budget;
pub mod codegen;
mod error;
pub mod executor;
pub mod kernel;
pub mod registry;
pub mod tool_service;
pub mod vars;

pub use error::ExecutorErr;
pub use error::Result;
pub use executor::CodeExecutor;
pub use executor::CodeExecutorConfig;
pub use executor::ExecEvent;
pub use executor::ExecutionStream;
pub use executor::StreamOptions;
pub use pybox_protocol::CodeExecutionChunk;
pub use pybox_protocol::CodeExecutionResult;
pub use pybox_protocol::ExecutionError;
pub use pybox_provider_client::ProviderSpec;
pub use pybox_provider_client::RemoteMode;
