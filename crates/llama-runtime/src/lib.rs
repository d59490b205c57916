//! # llama-runtime
//!
//! Runtime pieces that sit under a session: a deterministic reference
//! backend implementing the engine traits, compiled-backend and CPU feature
//! probing for `system_info`, the worker-thread budget, and telemetry hooks
//! (TTFT, tok/s, context shifts).

mod backend;
mod reference;
mod telemetry;
mod threads;

pub use backend::{system_info, Backend, BackendError, CpuFeature};
pub use reference::{special, ReferenceBackend, ReferenceContext, ReferenceModel, N_VOCAB};
pub use telemetry::{
    InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, TelemetryHook,
    TracingTelemetry,
};
pub use threads::{default_thread_count, thread_count_for, MAX_THREADS, MIN_THREADS};
