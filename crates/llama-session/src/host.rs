//! Boundary API with integer result codes.
//!
//! [`Host`] is the surface a host application drives: every operation
//! returns a result code (see [`codes`](crate::codes)) or a sentinel and
//! never panics or propagates an error. Failures are logged through
//! `tracing` instead.

use std::path::Path;
use std::sync::Arc;

use llama_engine::{LlamaBackend, LlamaModel, ModelSpec};
use llama_runtime::{TelemetryHook, TracingTelemetry};
use tracing_subscriber::EnvFilter;

use crate::bench::BenchReport;
use crate::config::SessionConfig;
use crate::error::{codes, Result, SessionError};
use crate::session::{ChatSession, SessionState, UserTurn};

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing when the application already installed one.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn to_code<T>(result: Result<T>) -> i32 {
    match result {
        Ok(_) => codes::SUCCESS,
        Err(e) => e.code(),
    }
}

pub struct Host<B: LlamaBackend> {
    config: SessionConfig,
    telemetry: Arc<dyn TelemetryHook>,
    // Dropped before the model it was created from.
    session: Option<ChatSession>,
    model: Option<Arc<dyn LlamaModel>>,
    backend: B,
    backend_freed: bool,
}

impl<B: LlamaBackend> Host<B> {
    /// Configure logging and take ownership of the backend.
    pub fn init(backend: B, config: SessionConfig) -> Self {
        init_logging();
        tracing::info!(backend = %backend.name(), "backend initialized");
        tracing::debug!(system_info = %backend.system_info());
        Self {
            config,
            telemetry: Arc::new(TracingTelemetry),
            session: None,
            model: None,
            backend,
            backend_freed: false,
        }
    }

    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replace the config used by the next [`prepare`](Self::prepare).
    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn session(&self) -> Option<&ChatSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        match (&self.model, &self.session) {
            (_, Some(session)) => session.state(),
            (Some(_), None) => SessionState::ModelLoaded,
            (None, None) => SessionState::Unloaded,
        }
    }

    pub fn system_info(&self) -> String {
        self.backend.system_info()
    }

    /// Load a model; 0 on success, 1 on failure.
    ///
    /// A model that is already loaded is unloaded first.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> i32 {
        let path = path.as_ref();
        if self.model.is_some() {
            tracing::warn!("a model is already loaded, unloading it first");
            self.unload();
        }

        match self.backend.load_model(&ModelSpec::new(path)) {
            Ok(model) => {
                tracing::info!(
                    path = %path.display(),
                    model = %model.description(),
                    params = model.n_params(),
                    "model loaded"
                );
                self.model = Some(Arc::from(model));
                codes::SUCCESS
            }
            Err(e) => {
                let e = SessionError::from(e);
                tracing::error!(path = %path.display(), "{e}");
                e.code()
            }
        }
    }

    /// Allocate context, batch, template and sampler for the loaded model.
    pub fn prepare(&mut self) -> i32 {
        to_code(self.try_prepare())
    }

    pub fn try_prepare(&mut self) -> Result<()> {
        let Some(model) = self.model.as_ref() else {
            tracing::error!("prepare called without a loaded model");
            return Err(SessionError::ModelNotLoaded);
        };

        // Release the previous context before allocating a new one
        if let Some(old) = self.session.take() {
            old.close();
        }

        match ChatSession::new(
            Arc::clone(model),
            self.config.clone(),
            Arc::clone(&self.telemetry),
        ) {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                tracing::error!(code = e.code(), "failed to prepare session: {e}");
                Err(e)
            }
        }
    }

    fn with_session<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut ChatSession) -> Result<T>,
    ) -> Result<T> {
        let result = match self.session.as_mut() {
            Some(session) => f(session),
            None if self.model.is_none() => Err(SessionError::ModelNotLoaded),
            None => Err(SessionError::NotPrepared),
        };
        if let Err(e) = &result {
            tracing::error!(op, code = e.code(), "{e}");
        }
        result
    }

    /// 0 on success, 1 if the prompt exceeds the context, 2 on decode
    /// failure, 3 without a prepared session.
    pub fn process_system_prompt(&mut self, prompt: &str) -> i32 {
        to_code(self.try_process_system_prompt(prompt))
    }

    pub fn try_process_system_prompt(&mut self, prompt: &str) -> Result<usize> {
        self.with_session("process_system_prompt", |s| s.process_system_prompt(prompt))
    }

    /// 0 on success (over-long prompts are truncated), 2 on decode failure,
    /// 3 without a prepared session.
    pub fn process_user_prompt(&mut self, prompt: &str, n_predict: usize) -> i32 {
        to_code(self.try_process_user_prompt(prompt, n_predict))
    }

    pub fn try_process_user_prompt(&mut self, prompt: &str, n_predict: usize) -> Result<UserTurn> {
        self.with_session("process_user_prompt", |s| {
            s.process_user_prompt(prompt, n_predict)
        })
    }

    /// Next fragment of the reply, or `None` at end of turn.
    ///
    /// Decode failures and a missing session also end the turn.
    pub fn generate_next_token(&mut self) -> Option<String> {
        self.with_session("generate_next_token", |s| s.generate_next_token())
            .ok()
            .flatten()
    }

    /// Run the benchmark on the prepared context.
    pub fn bench(&mut self, pp: usize, tg: usize, reps: usize) -> Result<BenchReport> {
        let backend = self.backend.name();
        self.with_session("bench", |s| s.bench(pp, tg, reps, &backend))
    }

    /// Release the session and the model, in that order.
    pub fn unload(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        if self.model.take().is_some() {
            tracing::info!("model unloaded");
        }
    }

    /// Release backend-wide resources. Only valid after [`unload`](Self::unload):
    /// returns 3 while a model is still loaded.
    pub fn shutdown(&mut self) -> i32 {
        if self.model.is_some() {
            tracing::error!("shutdown called while a model is loaded; unload first");
            return codes::PRECONDITION_FAILURE;
        }
        if !self.backend_freed {
            self.backend.free();
            self.backend_freed = true;
            tracing::info!("backend shut down");
        }
        codes::SUCCESS
    }
}

impl<B: LlamaBackend> Drop for Host<B> {
    fn drop(&mut self) {
        self.unload();
    }
}
