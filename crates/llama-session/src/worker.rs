//! One session on a dedicated thread.
//!
//! A [`SessionWorker`] owns a [`Host`] on its own OS thread and serializes
//! every operation through a bounded command channel. Each call blocks on a
//! per-command reply channel, so callers keep the sequential contract of
//! the session while the decode work runs off their thread. Workers share
//! nothing; run one per conversation.
//!
//! ```text
//! ┌────────────┐   Command + reply tx   ┌──────────────────┐
//! │   caller   │ ─────────────────────> │  session-worker  │
//! │            │ <───────────────────── │   owns: Host     │
//! └────────────┘        reply           └──────────────────┘
//! ```

use std::io;
use std::path::PathBuf;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use llama_engine::LlamaBackend;

use crate::bench::BenchReport;
use crate::error::codes;
use crate::host::Host;

/// Pending commands accepted before `send` blocks.
const COMMAND_QUEUE: usize = 16;

enum Command {
    LoadModel {
        path: PathBuf,
        reply: Sender<i32>,
    },
    Prepare {
        reply: Sender<i32>,
    },
    SystemPrompt {
        text: String,
        reply: Sender<i32>,
    },
    UserPrompt {
        text: String,
        n_predict: usize,
        reply: Sender<i32>,
    },
    NextToken {
        reply: Sender<Option<String>>,
    },
    Bench {
        pp: usize,
        tg: usize,
        reps: usize,
        reply: Sender<Result<BenchReport, String>>,
    },
    SystemInfo {
        reply: Sender<String>,
    },
    Unload {
        reply: Sender<()>,
    },
    Shutdown {
        reply: Sender<i32>,
    },
}

/// Handle to a session running on its own thread.
pub struct SessionWorker {
    cmd_tx: Option<Sender<Command>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SessionWorker {
    /// Move `host` onto a new `session-worker` thread.
    pub fn spawn<B>(host: Host<B>) -> io::Result<Self>
    where
        B: LlamaBackend + 'static,
    {
        let (cmd_tx, cmd_rx) = bounded::<Command>(COMMAND_QUEUE);
        let thread = thread::Builder::new()
            .name("session-worker".into())
            .spawn(move || worker_loop(host, cmd_rx))?;

        Ok(Self {
            cmd_tx: Some(cmd_tx),
            thread: Some(thread),
        })
    }

    fn call<R>(&self, make: impl FnOnce(Sender<R>) -> Command) -> Option<R> {
        let tx = self.cmd_tx.as_ref()?;
        let (reply_tx, reply_rx) = bounded(1);
        if tx.send(make(reply_tx)).is_err() {
            tracing::error!("session worker is gone");
            return None;
        }
        reply_rx.recv().ok()
    }

    pub fn load_model(&self, path: impl Into<PathBuf>) -> i32 {
        let path = path.into();
        self.call(|reply| Command::LoadModel { path, reply })
            .unwrap_or(codes::PRECONDITION_FAILURE)
    }

    pub fn prepare(&self) -> i32 {
        self.call(|reply| Command::Prepare { reply })
            .unwrap_or(codes::PRECONDITION_FAILURE)
    }

    pub fn process_system_prompt(&self, text: impl Into<String>) -> i32 {
        let text = text.into();
        self.call(|reply| Command::SystemPrompt { text, reply })
            .unwrap_or(codes::PRECONDITION_FAILURE)
    }

    pub fn process_user_prompt(&self, text: impl Into<String>, n_predict: usize) -> i32 {
        let text = text.into();
        self.call(|reply| Command::UserPrompt {
            text,
            n_predict,
            reply,
        })
        .unwrap_or(codes::PRECONDITION_FAILURE)
    }

    pub fn generate_next_token(&self) -> Option<String> {
        self.call(|reply| Command::NextToken { reply }).flatten()
    }

    pub fn bench(&self, pp: usize, tg: usize, reps: usize) -> Result<BenchReport, String> {
        self.call(|reply| Command::Bench { pp, tg, reps, reply })
            .unwrap_or_else(|| Err("session worker is gone".to_string()))
    }

    pub fn system_info(&self) -> Option<String> {
        self.call(|reply| Command::SystemInfo { reply })
    }

    pub fn unload(&self) {
        let _ = self.call(|reply| Command::Unload { reply });
    }

    /// Unload, release the backend and stop the thread.
    pub fn shutdown(mut self) -> i32 {
        self.unload();
        let code = self
            .call(|reply| Command::Shutdown { reply })
            .unwrap_or(codes::PRECONDITION_FAILURE);
        self.join();
        code
    }

    fn join(&mut self) {
        // Closing the channel ends the worker loop
        self.cmd_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("session worker panicked");
            }
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_loop<B: LlamaBackend>(mut host: Host<B>, cmd_rx: Receiver<Command>) {
    tracing::debug!("session worker started");
    for cmd in cmd_rx {
        // A caller that stopped waiting is not an error
        match cmd {
            Command::LoadModel { path, reply } => {
                let _ = reply.send(host.load_model(&path));
            }
            Command::Prepare { reply } => {
                let _ = reply.send(host.prepare());
            }
            Command::SystemPrompt { text, reply } => {
                let _ = reply.send(host.process_system_prompt(&text));
            }
            Command::UserPrompt {
                text,
                n_predict,
                reply,
            } => {
                let _ = reply.send(host.process_user_prompt(&text, n_predict));
            }
            Command::NextToken { reply } => {
                let _ = reply.send(host.generate_next_token());
            }
            Command::Bench { pp, tg, reps, reply } => {
                let result = host.bench(pp, tg, reps).map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            Command::SystemInfo { reply } => {
                let _ = reply.send(host.system_info());
            }
            Command::Unload { reply } => {
                host.unload();
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(host.shutdown());
            }
        }
    }
    host.unload();
    tracing::debug!("session worker stopped");
}
