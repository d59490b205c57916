//! Session configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```toml
//! context_size = 4096
//! chat_template = "chatml"
//! stop_position = "new_tokens_only"
//!
//! [sampling]
//! temperature = 0.7
//! top_k = 40
//! ```

use std::path::{Path, PathBuf};

use llama_engine::ContextParams;
use llama_sampling::SamplingParams;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTEXT_SIZE: usize = 8192;
pub const DEFAULT_BATCH_SIZE: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the per-turn stop position is derived after a user prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPositionPolicy {
    /// `position after decode + prompt tokens + max new tokens`. The prompt
    /// is already included in the position, so it is counted twice.
    #[default]
    PromptCountedTwice,
    /// `position after decode + max new tokens`.
    NewTokensOnly,
}

impl StopPositionPolicy {
    pub fn stop_position(self, after_decode: usize, prompt_tokens: usize, n_predict: usize) -> usize {
        match self {
            StopPositionPolicy::PromptCountedTwice => after_decode + prompt_tokens + n_predict,
            StopPositionPolicy::NewTokensOnly => after_decode + n_predict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Context capacity in tokens.
    pub context_size: usize,
    /// Batch buffer capacity; also the engine's batch and micro-batch size.
    pub batch_size: usize,
    /// Positions kept free at the end of the context.
    pub overflow_headroom: usize,
    /// Worker threads for decoding. `None` picks a budget from the core count.
    pub threads: Option<usize>,
    /// Force a chat template family (`llama3`, `chatml`) instead of the
    /// model's own.
    pub chat_template: Option<String>,
    /// Invalidate the engine's token memory on long-term reset.
    pub clear_memory_on_reset: bool,
    pub stop_position: StopPositionPolicy,
    pub sampling: SamplingParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            overflow_headroom: llama_kv::OVERFLOW_HEADROOM,
            threads: None,
            chat_template: None,
            clear_memory_on_reset: true,
            stop_position: StopPositionPolicy::default(),
            sampling: SamplingParams::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded session config");
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        if self.overflow_headroom >= self.context_size {
            return Err(ConfigError::Invalid(format!(
                "overflow_headroom ({}) must be smaller than context_size ({})",
                self.overflow_headroom, self.context_size
            )));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid("threads must be > 0".into()));
        }
        if self.sampling.temperature <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "sampling.temperature must be > 0, got {}",
                self.sampling.temperature
            )));
        }
        Ok(())
    }

    /// Thread count to configure the engine with.
    pub fn n_threads(&self) -> usize {
        self.threads
            .unwrap_or_else(llama_runtime::default_thread_count)
    }

    pub fn context_params(&self) -> ContextParams {
        let n_threads = self.n_threads();
        ContextParams {
            n_ctx: self.context_size,
            n_batch: self.batch_size,
            n_ubatch: self.batch_size,
            n_threads,
            n_threads_batch: n_threads,
        }
    }
}
