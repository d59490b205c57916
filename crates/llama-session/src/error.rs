//! Session errors and their boundary result codes.

use llama_engine::LlamaError;
use llama_kv::KvError;
use llama_sampling::SamplingError;

use crate::config::ConfigError;

/// Integer result codes returned by [`Host`](crate::Host) boundary operations.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    /// Model load, context init, or system prompt over capacity.
    pub const LOAD_FAILURE: i32 = 1;
    /// The engine failed to decode a batch, or the window had no room for it.
    pub const DECODE_FAILURE: i32 = 2;
    /// A required model or context is missing.
    pub const PRECONDITION_FAILURE: i32 = 3;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no model loaded")]
    ModelNotLoaded,

    #[error("session not prepared (call prepare first)")]
    NotPrepared,

    #[error("system prompt is {tokens} tokens, context allows {max}")]
    PromptTooLong { tokens: usize, max: usize },

    #[error("no logits available to sample from")]
    NoLogits,

    #[error("context full at position {position}: nothing left to discard below {usable}")]
    ContextFull { position: usize, usable: usize },

    #[error("engine error: {0}")]
    Engine(#[from] LlamaError),

    #[error("context window error: {0}")]
    Window(#[from] KvError),

    #[error("sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Boundary result code for this error.
    pub fn code(&self) -> i32 {
        match self {
            SessionError::ModelNotLoaded | SessionError::NotPrepared => {
                codes::PRECONDITION_FAILURE
            }
            SessionError::PromptTooLong { .. }
            | SessionError::Config(_)
            | SessionError::Engine(LlamaError::ModelLoad(_))
            | SessionError::Engine(LlamaError::ContextInit(_)) => codes::LOAD_FAILURE,
            SessionError::NoLogits
            | SessionError::ContextFull { .. }
            | SessionError::Window(_)
            | SessionError::Sampling(_)
            | SessionError::Engine(_) => codes::DECODE_FAILURE,
        }
    }

    pub fn is_precondition(&self) -> bool {
        self.code() == codes::PRECONDITION_FAILURE
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
