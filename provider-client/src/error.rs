use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Connection-level failure: the session is dead and the next call
    /// should run against a fresh one.
    #[error("provider transport error: {0}")]
    Transport(String),

    /// The provider executed the tool and reported a tool-level error. The
    /// message is the provider's, verbatim.
    #[error("{0}")]
    Tool(String),

    /// The provider sent a frame this client cannot make sense of. Fatal to
    /// the session.
    #[error("provider protocol error: {0}")]
    Protocol(String),

    #[error("provider connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}

impl ProviderError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ProviderError::Transport(_) | ProviderError::ConnectTimeout(_))
    }

    /// Protocol errors also kill the session; callers discard it either way.
    pub fn invalidates_session(&self) -> bool {
        !matches!(self, ProviderError::Tool(_))
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}
