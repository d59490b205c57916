//! # llama-engine
//!
//! The "narrow waist" of the llama.rs stack. Defines the capability traits an
//! inference backend exposes to the session layer: model loading, a compute
//! context that tokenizes, decodes batches and yields logits, and the
//! token-position memory operations used for context shifting.
//!
//! Sessions never see tensors. They only ever talk to these traits, so the
//! context-window bookkeeping can be exercised against a fake engine without
//! a real model.
//!
//! ## Design Notes
//!
//! ### Ownership
//! A [`LlamaModel`] hands out owned [`LlamaContext`] boxes. Implementations
//! share model data internally (e.g. `Arc`) so a context never borrows from
//! the model handle that created it. Contexts take `&mut self` for every
//! stateful operation; a context belongs to exactly one session.
//!
//! ### Token Type
//! `TokenId`, `Pos` and `SeqId` are `i32` to line up with the C inference
//! engines these traits are modelled on.

mod batch;

pub use batch::{Batch, BatchEntry, BatchFull};

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Absolute position of a token inside a sequence.
pub type Pos = i32;

/// Sequence identifier inside the token-position memory.
pub type SeqId = i32;

/// Top-level error type for all engine operations.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Context initialization failed: {0}")]
    ContextInit(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Decode failed with status {code}")]
    Decode { code: i32 },
    #[error("Batch error: {0}")]
    Batch(#[from] BatchFull),
}

/// Specification for loading a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub path: PathBuf,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Parameters used to allocate a compute context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Context capacity in tokens.
    pub n_ctx: usize,
    /// Maximum tokens accepted by a single `decode` call.
    pub n_batch: usize,
    /// Physical micro-batch size.
    pub n_ubatch: usize,
    /// Threads used for single-token generation.
    pub n_threads: usize,
    /// Threads used for prompt processing.
    pub n_threads_batch: usize,
}

/// Process-wide backend: loads models and owns global resources.
pub trait LlamaBackend: Send + Sync {
    /// Load a model from disk given a specification.
    fn load_model(&self, spec: &ModelSpec) -> Result<Box<dyn LlamaModel>>;

    /// Short name of the compute backend, e.g. `CPU`.
    fn name(&self) -> String {
        String::from("unknown")
    }

    /// Human-readable description of backend capabilities.
    fn system_info(&self) -> String;

    /// Release backend-wide resources. Called once, after every model is gone.
    fn free(&self) {}
}

/// A loaded model.
pub trait LlamaModel: Send + Sync {
    /// Allocate a compute context for this model.
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn LlamaContext>>;

    /// Chat template source embedded in the model, if it ships one.
    fn chat_template(&self) -> Option<String>;

    /// Whether `token` marks the end of generation.
    fn is_eog(&self, token: TokenId) -> bool;

    /// Short model description (architecture, quantization, ...).
    fn description(&self) -> String;

    /// Size of the model weights in bytes.
    fn size_bytes(&self) -> u64;

    /// Number of model parameters.
    fn n_params(&self) -> u64;
}

/// Token-position memory of a context (the KV cache, from the outside).
///
/// Ranges are half-open `[p0, p1)`.
pub trait TokenMemory {
    /// Drop every cached position. `data` also zeroes the backing buffers.
    fn clear(&mut self, data: bool);

    /// Remove positions `[p0, p1)` of sequence `seq`. Returns false when the
    /// memory cannot perform a partial removal.
    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool;

    /// Add `delta` to every position of `seq` within `[p0, p1)`.
    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, delta: Pos);
}

/// A compute context: tokenizes, decodes batches and exposes logits.
pub trait LlamaContext: TokenMemory + Send {
    /// Context capacity in tokens.
    fn n_ctx(&self) -> usize;

    /// Maximum tokens accepted by a single `decode` call.
    fn n_batch(&self) -> usize;

    /// Convert text into token IDs.
    ///
    /// `add_special` prepends the model's BOS token, `parse_special` turns
    /// control-token text into control tokens instead of plain bytes.
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>>;

    /// Run the model over a batch, writing its positions into token memory.
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Logits of the last batch entry that requested them.
    fn logits(&self) -> Option<&[f32]>;

    /// Raw bytes of a single token. May be an incomplete UTF-8 sequence.
    fn token_to_piece(&self, token: TokenId) -> Vec<u8>;
}
