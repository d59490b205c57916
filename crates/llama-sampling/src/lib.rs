//! # llama-sampling
//!
//! Picks the next token from a row of logits.
//!
//! Supports:
//! - Temperature scaling (near-zero temperature collapses to argmax)
//! - Top-k filtering
//! - Top-p (nucleus) filtering
//! - Repetition penalty over the last `penalty_last_n` accepted tokens
//! - Deterministic seeded RNG for reproducible generation

use std::collections::VecDeque;

use llama_engine::TokenId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplingError {
    #[error("invalid logits array")]
    InvalidLogits,
    #[error("temperature must be > 0, got {0}")]
    InvalidTemperature(f32),
    #[error("no valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Sampler settings, usually read from the `[sampling]` table of a
/// session config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub penalty_last_n: usize,
    pub seed: u64,
}

impl SamplingParams {
    pub const DEFAULT_TEMPERATURE: f32 = 0.3;
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: Self::DEFAULT_TEMPERATURE,
            top_k: None,
            top_p: None,
            repeat_penalty: None,
            penalty_last_n: 64,
            seed: 42,
        }
    }
}

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Zero state would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Stateful sampler: configuration, RNG and the window of accepted tokens.
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,
    rng: SeededRng,
    history: VecDeque<TokenId>,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let rng = SeededRng::new(params.seed);
        Self {
            params,
            rng,
            history: VecDeque::new(),
        }
    }

    /// Sampler with only the temperature changed from the defaults.
    pub fn with_temperature(temperature: f32) -> Self {
        Self::new(SamplingParams {
            temperature,
            ..SamplingParams::default()
        })
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Register a token as part of the generated sequence.
    pub fn accept(&mut self, token: TokenId) {
        if self.params.penalty_last_n == 0 {
            return;
        }
        if self.history.len() == self.params.penalty_last_n {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    /// Tokens currently considered by the repetition penalty, oldest first.
    pub fn history(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.history.iter().copied()
    }

    /// Forget accepted tokens and restart the RNG from the configured seed.
    pub fn reset(&mut self) {
        self.history.clear();
        self.rng = SeededRng::new(self.params.seed);
    }

    /// Sample a token id from a logits row.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        let temperature = self.params.temperature;
        if temperature <= 0.0 || temperature.is_nan() {
            return Err(SamplingError::InvalidTemperature(temperature));
        }

        let mut work_logits = logits.to_vec();

        // Positive logits are divided and negative ones multiplied, so a
        // repeated token always becomes less likely regardless of sign.
        if let Some(penalty) = self.params.repeat_penalty {
            for &token in &self.history {
                let Some(logit) = usize::try_from(token)
                    .ok()
                    .and_then(|i| work_logits.get_mut(i))
                else {
                    continue;
                };
                if *logit > 0.0 {
                    *logit /= penalty;
                } else {
                    *logit *= penalty;
                }
            }
        }

        if (temperature - 1.0).abs() > 1e-6 {
            for logit in &mut work_logits {
                *logit /= temperature;
            }
        }

        if let Some(k) = self.params.top_k {
            apply_top_k(&mut work_logits, k);
        }

        let probs = softmax(&work_logits);

        if temperature < 1e-3 {
            return to_token(argmax(&probs));
        }

        let probs = match self.params.top_p {
            Some(p) => apply_top_p(&probs, p),
            None => probs,
        };

        let index = self.sample_from_distribution(&probs)?;
        to_token(index)
    }

    fn sample_from_distribution(&mut self, probs: &[f32]) -> SamplingResult<usize> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;

        for (i, &prob) in probs.iter().enumerate() {
            cumsum += prob;
            if r < cumsum {
                return Ok(i);
            }
        }

        // Rounding left r above the total mass
        probs
            .iter()
            .rposition(|&p| p > 0.0)
            .ok_or(SamplingError::NoValidTokens)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(SamplingParams::default())
    }
}

fn to_token(index: usize) -> SamplingResult<TokenId> {
    TokenId::try_from(index).map_err(|_| SamplingError::InvalidLogits)
}

fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }

    let mut sorted = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let threshold = sorted[k - 1];
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

fn apply_top_p(probs: &[f32], p: f32) -> Vec<f32> {
    let mut sorted = probs.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0;
    let mut cutoff_prob = sorted.first().copied().unwrap_or(0.0);
    for &prob in &sorted {
        cumsum += prob;
        cutoff_prob = prob;
        if cumsum >= p {
            break;
        }
    }

    let mut result: Vec<f32> = probs
        .iter()
        .map(|&pr| if pr >= cutoff_prob { pr } else { 0.0 })
        .collect();

    let sum: f32 = result.iter().sum();
    if sum > 0.0 {
        for pr in &mut result {
            *pr /= sum;
        }
    }

    result
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();

    if sum > 0.0 && sum.is_finite() {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

fn argmax(probs: &[f32]) -> usize {
    probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rng_reproducible() {
        let mut rng1 = SeededRng::new(42);
        let mut rng2 = SeededRng::new(42);

        for _ in 0..100 {
            let v1 = rng1.next_f32();
            let v2 = rng2.next_f32();
            assert!((v1 - v2).abs() < 1e-6);
            assert!((0.0..1.0).contains(&v1));
        }
    }

    #[test]
    fn defaults_match_session_defaults() {
        let p = SamplingParams::default();
        assert!((p.temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(p.top_k, None);
        assert_eq!(p.penalty_last_n, 64);
    }

    #[test]
    fn softmax_uniform() {
        let probs = softmax(&[1.0, 1.0, 1.0]);
        assert!((probs[0] - 1.0 / 3.0).abs() < 1e-5);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn top_k_filtering() {
        let mut logits = vec![1.0, 10.0, 2.0, 0.5, 3.0];
        apply_top_k(&mut logits, 2);
        assert!(logits[1].is_finite());
        assert!(logits[4].is_finite());
        assert!(!logits[0].is_finite());
    }

    #[test]
    fn top_p_filtering() {
        let filtered = apply_top_p(&[0.5, 0.3, 0.15, 0.05], 0.8);
        assert!(filtered[0] > 0.0);
        assert!(filtered[1] > 0.0);
        assert_eq!(filtered[2], 0.0);
        assert_eq!(filtered[3], 0.0);
    }

    #[test]
    fn history_window_is_bounded() {
        let mut sampler = Sampler::new(SamplingParams {
            penalty_last_n: 3,
            ..SamplingParams::default()
        });
        for t in 0..5 {
            sampler.accept(t);
        }
        assert_eq!(sampler.history().collect::<Vec<_>>(), vec![2, 3, 4]);

        sampler.reset();
        assert_eq!(sampler.history().count(), 0);
    }

    #[test]
    fn penalty_last_n_zero_keeps_no_history() {
        let mut sampler = Sampler::new(SamplingParams {
            penalty_last_n: 0,
            ..SamplingParams::default()
        });
        sampler.accept(7);
        assert_eq!(sampler.history().count(), 0);
    }

    #[test]
    fn empty_logits() {
        let mut sampler = Sampler::default();
        assert_eq!(sampler.sample(&[]), Err(SamplingError::InvalidLogits));
    }
}
