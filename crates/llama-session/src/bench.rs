//! Prompt-processing / token-generation benchmark.

use std::time::Instant;

use llama_engine::{LlamaContext, LlamaModel, TokenId, TokenMemory};
use llama_kv::ContextWindow;
use serde::Serialize;

use crate::error::Result;
use crate::session::ChatSession;

/// Token fed for every benchmark position.
const BENCH_TOKEN: TokenId = 0;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Mean and sample standard deviation of tokens/s over the repetitions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Throughput {
    pub avg: f64,
    pub std: f64,
}

impl Throughput {
    fn from_samples(samples: &[f64]) -> Self {
        let n = samples.len() as f64;
        if samples.is_empty() {
            return Self { avg: 0.0, std: 0.0 };
        }
        let avg = samples.iter().sum::<f64>() / n;
        let std = if samples.len() > 1 {
            let var = samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / (n - 1.0);
            var.sqrt()
        } else {
            0.0
        };
        Self { avg, std }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchReport {
    pub model: String,
    pub size_bytes: u64,
    pub n_params: u64,
    pub backend: String,
    pub pp: usize,
    pub tg: usize,
    pub reps: usize,
    pub pp_tokens_per_sec: Throughput,
    pub tg_tokens_per_sec: Throughput,
}

impl BenchReport {
    pub fn to_markdown(&self) -> String {
        let size = format!("{:.2} GiB", self.size_bytes as f64 / GIB);
        let params = format!("{:.2} B", self.n_params as f64 / 1e9);
        let mut out = String::new();
        out.push_str("| model | size | params | backend | test | t/s |\n");
        out.push_str("| --- | --- | --- | --- | --- | --- |\n");
        for (test, t) in [
            (format!("pp {}", self.pp), self.pp_tokens_per_sec),
            (format!("tg {}", self.tg), self.tg_tokens_per_sec),
        ] {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {:.2} ± {:.2} |\n",
                self.model, size, params, self.backend, test, t.avg, t.std
            ));
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn tokens_per_sec(tokens: usize, start: Instant) -> f64 {
    let secs = start.elapsed().as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

impl ChatSession {
    /// Time `pp` prompt tokens decoded in batches and `tg` tokens decoded
    /// one at a time, `reps` times each.
    ///
    /// Runs on scratch positions from zero, so the conversation is lost:
    /// the token memory is cleared and the session is reset afterwards.
    pub fn bench(&mut self, pp: usize, tg: usize, reps: usize, backend: &str) -> Result<BenchReport> {
        let model = self.model().description();
        let size_bytes = self.model().size_bytes();
        let n_params = self.model().n_params();

        let (ctx, decoder, config) = self.parts_mut();
        let headroom = config.overflow_headroom;
        let n_ctx = ctx.n_ctx();
        let usable = n_ctx - headroom;
        let pp = pp.min(usable.saturating_sub(1));
        let tg = tg.min(usable.saturating_sub(1));
        let reps = reps.max(1);

        let prompt = vec![BENCH_TOKEN; pp];
        let mut pp_samples = Vec::with_capacity(reps);
        let mut tg_samples = Vec::with_capacity(reps);

        let result = (|| -> Result<()> {
            for rep in 0..reps {
                ctx.clear(false);
                let mut window = ContextWindow::new(n_ctx, headroom);
                let start = Instant::now();
                decoder.decode_in_chunks(&mut *ctx, &mut window, &prompt, true)?;
                pp_samples.push(tokens_per_sec(pp, start));

                ctx.clear(false);
                let mut window = ContextWindow::new(n_ctx, headroom);
                let start = Instant::now();
                for _ in 0..tg {
                    decoder.decode_single(&mut *ctx, &mut window, BENCH_TOKEN)?;
                }
                tg_samples.push(tokens_per_sec(tg, start));
                tracing::debug!(rep, "bench repetition done");
            }
            Ok(())
        })();

        ctx.clear(false);
        self.reset_long_term();
        self.reset_short_term();
        result?;

        let report = BenchReport {
            model,
            size_bytes,
            n_params,
            backend: backend.to_string(),
            pp,
            tg,
            reps,
            pp_tokens_per_sec: Throughput::from_samples(&pp_samples),
            tg_tokens_per_sec: Throughput::from_samples(&tg_samples),
        };
        tracing::info!(
            pp = report.pp_tokens_per_sec.avg,
            tg = report.tg_tokens_per_sec.avg,
            "bench finished"
        );
        Ok(report)
    }
}
