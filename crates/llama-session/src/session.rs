//! The chat session state machine.
//!
//! A [`ChatSession`] owns everything a prepared model needs for one
//! conversation: the compute context, the batch buffer, the chat template,
//! the sampler, the context window counters, the transcript and the
//! per-turn streaming state. Operations are sequential; the session is
//! `Send` but never shared.

use std::fmt;
use std::sync::Arc;

use llama_engine::{LlamaContext, LlamaError, LlamaModel, TokenId, TokenMemory};
use llama_kv::{ContextWindow, Shift};
use llama_runtime::{InferenceTimer, TelemetryHook};
use llama_sampling::Sampler;
use llama_tokenizer::{ChatHistory, ChatTemplates, Role, TokenStream};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::decoder::BatchDecoder;
use crate::error::{Result, SessionError};

/// Lifecycle stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No model loaded.
    Unloaded,
    /// A model is loaded but no context exists yet.
    ModelLoaded,
    /// Context, batch, template and sampler are allocated.
    Prepared,
    /// System prompt decoded; ready for a user prompt.
    SystemPrimed,
    /// User prompt decoded; nothing generated yet this turn.
    AwaitingGeneration,
    /// At least one token generated this turn.
    Generating,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unloaded => "unloaded",
            SessionState::ModelLoaded => "model-loaded",
            SessionState::Prepared => "prepared",
            SessionState::SystemPrimed => "system-primed",
            SessionState::AwaitingGeneration => "awaiting-generation",
            SessionState::Generating => "generating",
        };
        f.write_str(name)
    }
}

/// Outcome of ingesting a user prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTurn {
    /// Prompt tokens actually decoded.
    pub prompt_tokens: usize,
    /// Tokens dropped from the end of an over-long prompt.
    pub skipped_tokens: usize,
    /// Absolute position at which generation stops for this turn.
    pub stop_generation_position: usize,
}

/// Why the last turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    /// The model produced an end-of-generation token.
    EndOfGeneration,
    /// The window reached the turn's stop position.
    StopPosition,
}

pub struct ChatSession {
    id: Uuid,
    config: SessionConfig,
    state: SessionState,
    window: ContextWindow,
    history: ChatHistory,
    stream: TokenStream,
    telemetry: Arc<dyn TelemetryHook>,
    timer: Option<InferenceTimer>,
    last_turn_end: Option<TurnEnd>,
    // Field order is drop order: sampler, template and batch go before the
    // context, the context before the model.
    sampler: Sampler,
    templates: ChatTemplates,
    decoder: BatchDecoder,
    ctx: Box<dyn LlamaContext>,
    model: Arc<dyn LlamaModel>,
}

impl ChatSession {
    /// Allocate a context on `model` and everything a conversation needs.
    pub fn new(
        model: Arc<dyn LlamaModel>,
        config: SessionConfig,
        telemetry: Arc<dyn TelemetryHook>,
    ) -> Result<Self> {
        config.validate()?;
        let params = config.context_params();
        let ctx = model.new_context(&params)?;

        let n_ctx = ctx.n_ctx();
        if n_ctx <= config.overflow_headroom {
            return Err(LlamaError::ContextInit(format!(
                "context of {n_ctx} tokens leaves no room past the {} token headroom",
                config.overflow_headroom
            ))
            .into());
        }

        let templates = ChatTemplates::from_model(
            model.chat_template().as_deref(),
            config.chat_template.as_deref(),
        );
        let batch_size = config.batch_size.min(ctx.n_batch()).max(1);
        let id = Uuid::new_v4();

        tracing::info!(
            session = %id,
            model = %model.description(),
            n_ctx,
            n_batch = batch_size,
            n_threads = params.n_threads,
            template = ?templates.kind(),
            "session prepared"
        );

        Ok(Self {
            id,
            window: ContextWindow::new(n_ctx, config.overflow_headroom),
            history: ChatHistory::default(),
            stream: TokenStream::new(),
            state: SessionState::Prepared,
            telemetry,
            timer: None,
            last_turn_end: None,
            sampler: Sampler::new(config.sampling.clone()),
            templates,
            decoder: BatchDecoder::new(batch_size),
            ctx,
            model,
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn stream(&self) -> &TokenStream {
        &self.stream
    }

    pub fn templates(&self) -> &ChatTemplates {
        &self.templates
    }

    pub fn model(&self) -> &Arc<dyn LlamaModel> {
        &self.model
    }

    pub fn context(&self) -> &dyn LlamaContext {
        self.ctx.as_ref()
    }

    pub fn last_turn_end(&self) -> Option<TurnEnd> {
        self.last_turn_end
    }

    /// Clear the transcript and position counters, and the engine's token
    /// memory when `clear_memory_on_reset` is set.
    pub fn reset_long_term(&mut self) {
        self.history.clear();
        self.window.reset();
        if self.config.clear_memory_on_reset {
            self.ctx.clear(false);
        }
        self.state = SessionState::Prepared;
    }

    /// Clear per-turn state: stop position, UTF-8 tail and assistant text.
    pub fn reset_short_term(&mut self) {
        self.window.clear_stop_generation_position();
        self.stream.reset();
        self.timer = None;
        self.last_turn_end = None;
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        let special = self.templates.was_explicit();
        Ok(self.ctx.tokenize(text, special, special)?)
    }

    fn report_shifts(&mut self, shifts: &[Shift]) {
        for shift in shifts {
            tracing::warn!(
                session = %self.id,
                discarded = shift.discarded,
                current_position = shift.current_position,
                "context window full, discarded oldest tokens"
            );
            self.telemetry
                .on_context_shift(shift.discarded, shift.current_position);
            if let Some(timer) = self.timer.as_mut() {
                timer.mark_shift();
            }
        }
    }

    /// Start a new conversation with `prompt` as its system message.
    ///
    /// Resets all long- and short-term state first. Returns the number of
    /// tokens decoded, which is also the new system-prompt boundary.
    pub fn process_system_prompt(&mut self, prompt: &str) -> Result<usize> {
        self.reset_long_term();
        self.reset_short_term();

        let formatted = self
            .history
            .format_and_append(&self.templates, Role::System, prompt);
        let tokens = self.tokenize(&formatted)?;

        let max = self.window.usable_capacity();
        if tokens.len() > max {
            tracing::error!(
                session = %self.id,
                tokens = tokens.len(),
                max,
                "system prompt exceeds context capacity"
            );
            return Err(SessionError::PromptTooLong {
                tokens: tokens.len(),
                max,
            });
        }

        let shifts =
            self.decoder
                .decode_in_chunks(self.ctx.as_mut(), &mut self.window, &tokens, false)?;
        self.report_shifts(&shifts);

        self.window.mark_system_prompt();
        self.state = SessionState::SystemPrimed;
        tracing::debug!(
            session = %self.id,
            tokens = tokens.len(),
            position = self.window.current_position(),
            "system prompt decoded"
        );
        Ok(tokens.len())
    }

    /// Decode a user message and open a generation turn of up to
    /// `n_predict` new tokens.
    ///
    /// A prompt longer than the room behind the system prompt is truncated
    /// at its tail.
    pub fn process_user_prompt(&mut self, prompt: &str, n_predict: usize) -> Result<UserTurn> {
        self.reset_short_term();

        let formatted = self
            .history
            .format_and_append(&self.templates, Role::User, prompt);
        let mut tokens = self.tokenize(&formatted)?;

        // The system prompt is never shifted out
        let max = self
            .window
            .usable_capacity()
            .saturating_sub(self.window.system_prompt_position());
        let skipped_tokens = tokens.len().saturating_sub(max);
        if skipped_tokens > 0 {
            tokens.truncate(max);
            tracing::warn!(
                session = %self.id,
                skipped = skipped_tokens,
                kept = max,
                "user prompt too long, truncated"
            );
        }

        self.timer = Some(InferenceTimer::new(
            tokens.len(),
            Arc::clone(&self.telemetry),
        ));

        let shifts =
            self.decoder
                .decode_in_chunks(self.ctx.as_mut(), &mut self.window, &tokens, true)?;
        self.report_shifts(&shifts);
        if let Some(timer) = self.timer.as_mut() {
            timer.mark_prefill_complete();
        }

        let stop = self.config.stop_position.stop_position(
            self.window.current_position(),
            tokens.len(),
            n_predict,
        );
        self.window.set_stop_generation_position(stop);
        self.state = SessionState::AwaitingGeneration;

        tracing::debug!(
            session = %self.id,
            tokens = tokens.len(),
            position = self.window.current_position(),
            stop,
            "user prompt decoded"
        );
        Ok(UserTurn {
            prompt_tokens: tokens.len(),
            skipped_tokens,
            stop_generation_position: stop,
        })
    }

    /// Produce the next fragment of the assistant reply.
    ///
    /// - `Ok(Some(text))`: a fragment; empty while a multi-byte character is
    ///   still incomplete
    /// - `Ok(None)`: the turn is over (end-of-generation token, stop
    ///   position, or no open turn)
    pub fn generate_next_token(&mut self) -> Result<Option<String>> {
        if !matches!(
            self.state,
            SessionState::AwaitingGeneration | SessionState::Generating
        ) {
            return Ok(None);
        }

        if self.window.needs_shift() {
            let shift = self.window.shift(self.ctx.as_mut());
            self.report_shifts(&[shift]);
        }

        if self.window.reached_stop() {
            self.end_turn(TurnEnd::StopPosition);
            return Ok(None);
        }

        let logits = self.ctx.logits().ok_or(SessionError::NoLogits)?;
        let token = self.sampler.sample(logits)?;
        self.sampler.accept(token);

        self.decoder
            .decode_single(self.ctx.as_mut(), &mut self.window, token)?;
        if let Some(timer) = self.timer.as_mut() {
            timer.mark_token();
        }
        self.state = SessionState::Generating;

        if self.model.is_eog(token) {
            self.end_turn(TurnEnd::EndOfGeneration);
            return Ok(None);
        }

        let piece = self.ctx.token_to_piece(token);
        let text = self.stream.emit(&piece);
        tracing::trace!(token, bytes = piece.len(), emitted = text.len(), "token");
        Ok(Some(text))
    }

    /// Close the open turn: the accumulated reply becomes an assistant
    /// message. Runs once per turn.
    fn end_turn(&mut self, reason: TurnEnd) {
        if !self.stream.pending().is_empty() {
            tracing::debug!(
                bytes = self.stream.pending().len(),
                "dropping incomplete UTF-8 tail at end of turn"
            );
        }
        let reply = self.stream.take_reply();
        self.history
            .format_and_append(&self.templates, Role::Assistant, &reply);

        self.window.clear_stop_generation_position();
        self.state = SessionState::SystemPrimed;
        self.last_turn_end = Some(reason);

        let generated = self.timer.take().map(|t| t.finish().generated_tokens);
        tracing::debug!(
            session = %self.id,
            ?reason,
            generated,
            reply_bytes = reply.len(),
            "turn ended"
        );
    }

    /// Reset all state and release the session's resources.
    pub fn close(mut self) {
        self.reset_long_term();
        self.reset_short_term();
        tracing::info!(session = %self.id, "session closed");
    }

    pub(crate) fn parts_mut(
        &mut self,
    ) -> (&mut dyn LlamaContext, &mut BatchDecoder, &SessionConfig) {
        (self.ctx.as_mut(), &mut self.decoder, &self.config)
    }
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("window", &self.window)
            .field("history_len", &self.history.len())
            .field("templates", &self.templates)
            .finish_non_exhaustive()
    }
}
