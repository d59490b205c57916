//! # llama-session
//!
//! Single-conversation controller on top of the engine traits.
//!
//! ## Pieces
//! - [`BatchDecoder`]: splits token runs into batch-sized chunks, shifting
//!   the context window ahead of any chunk that would reach the headroom
//! - [`ChatSession`]: the turn state machine. System prompt, user prompt,
//!   token-by-token generation, resets
//! - [`Host`]: the boundary API with integer result codes
//! - [`SessionWorker`]: a `Host` on its own thread
//! - [`SessionConfig`]: TOML-loadable defaults (context size, batch size,
//!   headroom, sampler, stop-position policy)
//!
//! ## Example
//!
//! ```no_run
//! use llama_runtime::ReferenceBackend;
//! use llama_session::{Host, SessionConfig};
//!
//! let backend = ReferenceBackend::new().expect("cpu backend");
//! let mut host = Host::init(backend, SessionConfig::default());
//! assert_eq!(host.load_model("corpus.txt"), 0);
//! assert_eq!(host.prepare(), 0);
//! assert_eq!(host.process_system_prompt("You are helpful."), 0);
//! assert_eq!(host.process_user_prompt("Hi", 64), 0);
//! while let Some(fragment) = host.generate_next_token() {
//!     print!("{fragment}");
//! }
//! host.unload();
//! host.shutdown();
//! ```

mod bench;
mod config;
mod decoder;
mod error;
mod host;
mod session;
mod worker;

pub use bench::{BenchReport, Throughput};
pub use config::{
    ConfigError, SessionConfig, StopPositionPolicy, DEFAULT_BATCH_SIZE, DEFAULT_CONTEXT_SIZE,
};
pub use decoder::{BatchDecoder, SEQ_ID};
pub use error::{codes, Result, SessionError};
pub use host::{init_logging, Host};
pub use session::{ChatSession, SessionState, TurnEnd, UserTurn};
pub use worker::SessionWorker;
