//! Client for the external Python kernel.
//!
//! The kernel is an opaque remote interpreter behind a Jupyter-compatible
//! gateway: kernels are created and interrupted over HTTP, and a WebSocket
//! carries code submissions and the typed reply stream. Kernel state
//! persists across submissions within one connection.

mod client;
mod messages;

pub use client::Execution;
pub use client::KernelClient;
pub use client::KernelClientConfig;
pub use client::KernelInterrupt;
pub use messages::Fragment;
pub use messages::Interpretation;
pub use messages::WireMessage;
pub use messages::execute_request;
pub use messages::interpret;
