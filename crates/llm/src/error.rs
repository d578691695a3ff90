use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Error, Debug)]
pub enum LlmError {
    /// Connection refused/reset/timeout. The scanner pauses and retries
    /// the exact same call until the backend comes back.
    #[error("Lost connection to {backend}: {message}")]
    Transport { backend: &'static str, message: String },

    /// Bad response shape or bad JSON after all retries. The check
    /// produces no issues and the schedule moves on.
    #[error("Protocol error from {backend}: {message}")]
    Protocol { backend: &'static str, message: String },

    /// The request exceeded the model's loaded context window. Fatal
    /// for the batch; requires user intervention to fix.
    #[error("{0}")]
    ContextOverflow(String),

    #[error("{0}")]
    Startup(String),
}

impl LlmError {
    pub fn is_transport(&self) -> bool {
        matches!(self, LlmError::Transport { .. })
    }

    /// Map a reqwest failure onto the transport/protocol split.
    pub fn from_reqwest(backend: &'static str, err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() && err.status().is_none() {
            LlmError::Transport {
                backend,
                message: err.to_string(),
            }
        } else {
            LlmError::Protocol {
                backend,
                message: err.to_string(),
            }
        }
    }
}
