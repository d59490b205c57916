//! # llama-cli
//!
//! Command-line front end for llama-session.
//!
//! Wires: config file + flags → [`Host`] → interactive chat loop, benchmark
//! table or backend feature report. The loops are generic over their input
//! and output so they can be driven from tests.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use llama_engine::LlamaBackend;
use llama_session::{codes, Host, SessionConfig};

/// llama-chat: on-device conversational completion
#[derive(Debug, Parser)]
#[command(name = "llama-chat", version)]
pub struct Cli {
    /// TOML session config; flags override its values.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Context window size in tokens.
    #[arg(long, global = true)]
    pub ctx_size: Option<usize>,

    /// Worker threads (defaults to available cores minus two, clamped to 2..=4).
    #[arg(short, long, global = true)]
    pub threads: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Chat with a model, one user message per input line.
    Chat {
        /// Model file to load.
        #[arg(short, long)]
        model: PathBuf,

        /// System prompt that opens the conversation.
        #[arg(short, long, default_value = "You are a helpful assistant.")]
        system: String,

        /// Maximum tokens generated per reply.
        #[arg(short = 'n', long, default_value_t = 256)]
        max_tokens: usize,

        /// Sampling temperature (must be > 0).
        #[arg(long)]
        temperature: Option<f32>,

        /// Seed for reproducible sampling.
        #[arg(long)]
        seed: Option<u64>,

        /// Chat template name or template text overriding the model's.
        #[arg(long)]
        chat_template: Option<String>,
    },
    /// Measure prompt-processing and generation throughput.
    Bench {
        #[arg(short, long)]
        model: PathBuf,

        /// Prompt tokens per repetition.
        #[arg(long, default_value_t = 512)]
        pp: usize,

        /// Generated tokens per repetition.
        #[arg(long, default_value_t = 128)]
        tg: usize,

        #[arg(short, long, default_value_t = 5)]
        reps: usize,

        /// Print JSON instead of a markdown table.
        #[arg(long)]
        json: bool,
    },
    /// Print the backend feature report and the effective configuration.
    Info,
}

impl Cli {
    /// Session config from `--config` (or defaults) with flag overrides applied.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_toml_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => SessionConfig::default(),
        };
        if let Some(n_ctx) = self.ctx_size {
            config.context_size = n_ctx;
        }
        if self.threads.is_some() {
            config.threads = self.threads;
        }
        if let Command::Chat {
            temperature,
            seed,
            chat_template,
            ..
        } = &self.command
        {
            if let Some(t) = temperature {
                config.sampling.temperature = *t;
            }
            if let Some(s) = seed {
                config.sampling.seed = *s;
            }
            if chat_template.is_some() {
                config.chat_template = chat_template.clone();
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn check(code: i32, op: &str) -> anyhow::Result<()> {
    match code {
        codes::SUCCESS => Ok(()),
        codes::LOAD_FAILURE => bail!("{op} failed: load or capacity error (code {code})"),
        codes::DECODE_FAILURE => bail!("{op} failed: decode error (code {code})"),
        _ => bail!("{op} failed (code {code})"),
    }
}

/// Load `model` and prepare a session on `host`.
pub fn open<B: LlamaBackend>(host: &mut Host<B>, model: &Path) -> anyhow::Result<()> {
    check(host.load_model(model), "load model")?;
    check(host.prepare(), "prepare")
}

/// Interactive loop: every non-empty line of `input` is a user turn whose
/// reply is streamed to `output`.
///
/// `/reset` restarts the conversation with the same system prompt and
/// `/quit` (or end of input) stops the loop. Returns the number of turns.
pub fn run_chat<B, R, W>(
    host: &mut Host<B>,
    system: &str,
    max_tokens: usize,
    input: R,
    mut output: W,
) -> anyhow::Result<usize>
where
    B: LlamaBackend,
    R: BufRead,
    W: Write,
{
    check(host.process_system_prompt(system), "system prompt")?;
    let mut turns = 0;

    for line in input.lines() {
        let line = line.context("reading input")?;
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/reset" => {
                check(host.process_system_prompt(system), "system prompt")?;
                writeln!(output, "[conversation reset]")?;
                continue;
            }
            _ => {}
        }

        check(host.process_user_prompt(line, max_tokens), "user prompt")?;
        while let Some(fragment) = host.generate_next_token() {
            output.write_all(fragment.as_bytes())?;
            output.flush()?;
        }
        writeln!(output)?;
        turns += 1;
    }

    tracing::info!(turns, "chat finished");
    Ok(turns)
}

/// Run the benchmark and render it as markdown or JSON.
pub fn run_bench<B: LlamaBackend>(
    host: &mut Host<B>,
    pp: usize,
    tg: usize,
    reps: usize,
    json: bool,
) -> anyhow::Result<String> {
    let report = host.bench(pp, tg, reps).context("bench")?;
    if json {
        Ok(report.to_json()?)
    } else {
        Ok(report.to_markdown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat() {
        let cli = Cli::try_parse_from([
            "llama-chat",
            "chat",
            "-m",
            "model.gguf",
            "-n",
            "32",
            "--temperature",
            "0.7",
        ])
        .unwrap();
        match cli.command {
            Command::Chat {
                ref model,
                max_tokens,
                temperature,
                ..
            } => {
                assert_eq!(model, Path::new("model.gguf"));
                assert_eq!(max_tokens, 32);
                assert_eq!(temperature, Some(0.7));
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn parses_bench_defaults() {
        let cli = Cli::try_parse_from(["llama-chat", "bench", "-m", "m"]).unwrap();
        match cli.command {
            Command::Bench {
                pp, tg, reps, json, ..
            } => {
                assert_eq!((pp, tg, reps, json), (512, 128, 5, false));
            }
            _ => panic!("expected bench"),
        }
    }

    #[test]
    fn chat_requires_model() {
        assert!(Cli::try_parse_from(["llama-chat", "chat"]).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "llama-chat",
            "--ctx-size",
            "2048",
            "-t",
            "3",
            "chat",
            "-m",
            "m",
            "--seed",
            "7",
        ])
        .unwrap();
        let config = cli.session_config().unwrap();
        assert_eq!(config.context_size, 2048);
        assert_eq!(config.threads, Some(3));
        assert_eq!(config.sampling.seed, 7);
        assert_eq!(config.batch_size, llama_session::DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn zero_temperature_fails_validation() {
        let cli =
            Cli::try_parse_from(["llama-chat", "chat", "-m", "m", "--temperature", "0"]).unwrap();
        assert!(cli.session_config().is_err());
    }

    #[test]
    fn check_maps_codes() {
        assert!(check(codes::SUCCESS, "x").is_ok());
        let err = check(codes::DECODE_FAILURE, "user prompt").unwrap_err();
        assert!(err.to_string().contains("decode"));
    }
}
