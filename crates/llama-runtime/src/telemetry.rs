//! Telemetry hooks for chat-turn performance measurement.
//!
//! Provides:
//! - [`InferenceMetrics`] — TTFT, tokens/sec, and turn summary
//! - [`TelemetryHook`] trait — callback interface for real-time reporting
//! - [`InferenceTimer`] — records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`] / [`TracingTelemetry`] — built-in hooks

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Aggregate metrics from one user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceMetrics {
    /// Time to first token in milliseconds (prompt processing latency).
    pub ttft_ms: f64,
    /// Tokens generated per second (excludes prompt processing).
    pub tokens_per_sec: f64,
    /// Prompt tokens decoded for the turn.
    pub prompt_tokens: usize,
    /// Tokens sampled during generation.
    pub generated_tokens: usize,
    /// Context shifts performed during the turn.
    pub context_shifts: usize,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: f64,
}

/// Callback trait for real-time inference telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called once the prompt is decoded and the first logits are ready.
    fn on_prefill_complete(&self, _ttft_ms: f64) {}

    /// Called after each generated token is decoded.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when the context window discarded `discarded` tokens.
    fn on_context_shift(&self, _discarded: usize, _current_position: usize) {}

    /// Called when a turn finishes with the full metrics summary.
    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

#[derive(Debug, Default)]
struct LogState {
    last: Option<InferenceMetrics>,
    shifts: usize,
    completed_turns: usize,
}

/// Collecting hook: keeps the last report and counters for inspection.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    state: Arc<Mutex<LogState>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        // A panicking hook cannot leave the counters half-written
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Metrics of the last completed turn.
    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.state().last.clone()
    }

    /// Context shifts seen since creation.
    pub fn shifts(&self) -> usize {
        self.state().shifts
    }

    /// Turns completed since creation.
    pub fn completed_turns(&self) -> usize {
        self.state().completed_turns
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_context_shift(&self, _discarded: usize, _current_position: usize) {
        self.state().shifts += 1;
    }

    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        let mut state = self.state();
        state.last = Some(metrics.clone());
        state.completed_turns += 1;
    }
}

/// Hook that reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_prefill_complete(&self, ttft_ms: f64) {
        tracing::debug!(ttft_ms, "prompt processed");
    }

    fn on_context_shift(&self, discarded: usize, current_position: usize) {
        tracing::info!(discarded, current_position, "context shifted");
    }

    fn on_generation_complete(&self, m: &InferenceMetrics) {
        tracing::info!(
            ttft_ms = m.ttft_ms,
            tokens_per_sec = m.tokens_per_sec,
            prompt_tokens = m.prompt_tokens,
            generated_tokens = m.generated_tokens,
            context_shifts = m.context_shifts,
            "turn complete"
        );
    }
}

/// Records timestamps during a turn to compute [`InferenceMetrics`].
///
/// Usage:
/// 1. Call [`InferenceTimer::new`] when the user prompt arrives
/// 2. Call [`mark_prefill_complete`](Self::mark_prefill_complete) after it is decoded
/// 3. Call [`mark_token`](Self::mark_token) after each generated token
/// 4. Call [`finish`](Self::finish) at end of turn
pub struct InferenceTimer {
    prompt_tokens: usize,
    start: Instant,
    prefill_end: Option<Instant>,
    token_count: usize,
    shifts: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl InferenceTimer {
    pub fn new(prompt_tokens: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            prompt_tokens,
            start: Instant::now(),
            prefill_end: None,
            token_count: 0,
            shifts: 0,
            hook,
        }
    }

    /// Fires `on_prefill_complete`.
    pub fn mark_prefill_complete(&mut self) {
        let now = Instant::now();
        self.prefill_end = Some(now);
        let ttft_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook.on_prefill_complete(ttft_ms);
    }

    /// Fires `on_token_generated`.
    pub fn mark_token(&mut self) {
        self.token_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_token_generated(self.token_count, elapsed_ms);
    }

    /// Count a shift that happened during this turn.
    pub fn mark_shift(&mut self) {
        self.shifts += 1;
    }

    pub fn generated_tokens(&self) -> usize {
        self.token_count
    }

    /// Finalize and return metrics. Fires `on_generation_complete`.
    pub fn finish(self) -> InferenceMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;

        let ttft_ms = self
            .prefill_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - ttft_ms;
        let tokens_per_sec = if decode_time_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = InferenceMetrics {
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            context_shifts: self.shifts,
            total_time_ms,
        };

        self.hook.on_generation_complete(&metrics);
        metrics
    }
}

impl std::fmt::Debug for InferenceTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceTimer")
            .field("prompt_tokens", &self.prompt_tokens)
            .field("token_count", &self.token_count)
            .field("shifts", &self.shifts)
            .finish_non_exhaustive()
    }
}
