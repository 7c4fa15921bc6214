use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecutorErr>;

/// Errors raised to the host from [`crate::CodeExecutor`].
///
/// Kernel-level Python errors are *not* here: they are delivered inside the
/// terminal `CodeExecutionResult`, because user code may legitimately raise
/// and the session stays healthy.
#[derive(Debug, Error)]
pub enum ExecutorErr {
    /// The execution budget elapsed while the kernel was running. Raised
    /// after the kernel interrupt completed.
    #[error("execution budget of {0:?} exhausted")]
    BudgetTimeout(Duration),

    /// Kernel liveness lost, or the kernel connection failed outright.
    #[error("kernel connection failed: {0}")]
    Kernel(String),

    /// The Tool Service could not be bound or served.
    #[error("tool service failed: {0}")]
    ToolService(String),

    /// Writing generated modules or the preamble into the shared workspace
    /// failed.
    #[error("workspace I/O error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A provider spec referenced environment variables that are not set in
    /// the coordinator's environment.
    #[error("unresolved environment variables for provider `{provider}`: {missing:?}")]
    UnresolvedEnv { provider: String, missing: Vec<String> },

    /// No spec is registered under the requested provider name.
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    /// Provider connect/list failure during an operation the host invoked
    /// directly (tool API generation).
    #[error("provider `{provider}` failed: {message}")]
    Provider { provider: String, message: String },

    /// The executor is not in a state that allows the call.
    #[error("{0}")]
    BadState(String),
}

impl ExecutorErr {
    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExecutorErr::Workspace { path: path.into(), source }
    }
}
