//! # llama-kv
//!
//! Context-window management for llama.rs.
//!
//! Supports:
//! - **Position bookkeeping**: [`ContextWindow`] tracks the system-prompt
//!   boundary, the next free position and the per-turn stop position
//! - **Context shift**: discards the older half of the post-system window and
//!   re-indexes the rest through any [`TokenMemory`](llama_engine::TokenMemory)
//! - **Token-position memory**: [`KvCells`], a cell store with the
//!   remove-range / shift-range semantics engines expose, used by the
//!   reference backend and by tests

mod cells;
mod window;

pub use cells::{KvCell, KvCells};
pub use window::{ContextWindow, Shift, OVERFLOW_HEADROOM};

/// Error type for context-window and cell operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("KV cache capacity exceeded: {seq_len} > {max}")]
    CapacityExceeded { seq_len: usize, max: usize },

    #[error("Negative position {0}")]
    NegativePosition(llama_engine::Pos),
}

pub type KvResult<T> = Result<T, KvError>;
