//! Reference CPU backend: a byte-level bigram model.
//!
//! Loading a "model" trains next-token statistics from a UTF-8 text corpus.
//! Documents are separated by blank lines; each one is framed by `BOS` and
//! `EOS`. Output is deterministic for a given corpus and sampler seed, which
//! makes the backend usable both from the CLI and in integration tests.

use std::path::Path;
use std::sync::Arc;

use llama_engine::{
    Batch, ContextParams, LlamaBackend, LlamaContext, LlamaError, LlamaModel, ModelSpec, Pos,
    Result, SeqId, TokenId, TokenMemory,
};
use llama_kv::KvCells;

use crate::backend::{self, Backend, BackendError};

/// Vocabulary size: 256 byte tokens plus four control tokens.
pub const N_VOCAB: usize = 260;

/// Control token ids.
pub mod special {
    use llama_engine::TokenId;

    pub const BOS: TokenId = 256;
    pub const EOS: TokenId = 257;
    pub const IM_START: TokenId = 258;
    pub const IM_END: TokenId = 259;
}

const CONTROL_TEXT: [(&[u8], TokenId); 2] = [
    (b"<|im_start|>", special::IM_START),
    (b"<|im_end|>", special::IM_END),
];

const CHATML_TEMPLATE: &str = "{% for message in messages %}\
<|im_start|>{{ message['role'] }}\n{{ message['content'] }}<|im_end|>\n\
{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

/// Additive smoothing so unseen transitions keep a finite logit.
const SMOOTHING: f32 = 0.01;

fn tokenize_bytes(text: &str, add_bos: bool, parse_special: bool) -> Vec<TokenId> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::with_capacity(bytes.len() + usize::from(add_bos));
    if add_bos {
        tokens.push(special::BOS);
    }

    let mut i = 0;
    'scan: while i < bytes.len() {
        if parse_special {
            for (marker, token) in CONTROL_TEXT {
                if bytes[i..].starts_with(marker) {
                    tokens.push(token);
                    i += marker.len();
                    continue 'scan;
                }
            }
        }
        tokens.push(TokenId::from(bytes[i]));
        i += 1;
    }
    tokens
}

fn vocab_index(token: TokenId) -> Option<usize> {
    usize::try_from(token).ok().filter(|&t| t < N_VOCAB)
}

/// Log-probability table, one row of `N_VOCAB` logits per previous token.
#[derive(Debug)]
struct Bigram {
    logits: Vec<f32>,
    documents: usize,
}

impl Bigram {
    fn train(corpus: &str) -> Option<Self> {
        let mut counts = vec![0u32; N_VOCAB * N_VOCAB];
        let mut documents = 0;

        for doc in corpus.split("\n\n").map(str::trim).filter(|d| !d.is_empty()) {
            documents += 1;
            let mut prev = special::BOS as usize;
            for token in tokenize_bytes(doc, false, true) {
                let next = token as usize;
                counts[prev * N_VOCAB + next] += 1;
                prev = next;
            }
            counts[prev * N_VOCAB + special::EOS as usize] += 1;
        }

        if documents == 0 {
            return None;
        }

        let mut logits = vec![0.0f32; N_VOCAB * N_VOCAB];
        for (row_counts, row_logits) in counts
            .chunks_exact(N_VOCAB)
            .zip(logits.chunks_exact_mut(N_VOCAB))
        {
            let total: u32 = row_counts.iter().sum();
            let denom = total as f32 + SMOOTHING * N_VOCAB as f32;
            for (c, l) in row_counts.iter().zip(row_logits.iter_mut()) {
                *l = ((*c as f32 + SMOOTHING) / denom).ln();
            }
        }

        Some(Self { logits, documents })
    }

    fn row(&self, prev: usize) -> &[f32] {
        &self.logits[prev * N_VOCAB..(prev + 1) * N_VOCAB]
    }
}

/// Backend handle for the reference model.
#[derive(Debug, Clone)]
pub struct ReferenceBackend {
    backend: Backend,
}

impl ReferenceBackend {
    pub fn new() -> std::result::Result<Self, BackendError> {
        let backend = Backend::auto()?;
        tracing::debug!(%backend, "reference backend initialized");
        Ok(Self { backend })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Train a model from corpus text without touching the filesystem.
    pub fn model_from_text(&self, name: &str, corpus: &str) -> Result<ReferenceModel> {
        let bigram = Bigram::train(corpus)
            .ok_or_else(|| LlamaError::ModelLoad(format!("{name}: corpus contains no text")))?;
        tracing::info!(model = name, documents = bigram.documents, "bigram model trained");
        Ok(ReferenceModel {
            name: name.to_string(),
            bigram: Arc::new(bigram),
        })
    }

    fn read_corpus(path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map_err(|e| LlamaError::ModelLoad(format!("{}: {e}", path.display())))
    }
}

impl LlamaBackend for ReferenceBackend {
    fn load_model(&self, spec: &ModelSpec) -> Result<Box<dyn LlamaModel>> {
        let corpus = Self::read_corpus(&spec.path)?;
        let name = spec
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.path.display().to_string());
        Ok(Box::new(self.model_from_text(&name, &corpus)?))
    }

    fn name(&self) -> String {
        self.backend.to_string()
    }

    fn system_info(&self) -> String {
        backend::system_info()
    }

    fn free(&self) {
        tracing::debug!(backend = %self.backend, "reference backend freed");
    }
}

/// A trained bigram model.
#[derive(Debug, Clone)]
pub struct ReferenceModel {
    name: String,
    bigram: Arc<Bigram>,
}

impl ReferenceModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocate a context with its concrete type, for callers that need
    /// to inspect token memory.
    pub fn context(&self, params: &ContextParams) -> Result<ReferenceContext> {
        if params.n_ctx == 0 || params.n_batch == 0 {
            return Err(LlamaError::ContextInit(format!(
                "n_ctx ({}) and n_batch ({}) must be non-zero",
                params.n_ctx, params.n_batch
            )));
        }
        tracing::debug!(
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_threads = params.n_threads,
            "reference context created"
        );
        Ok(ReferenceContext {
            bigram: Arc::clone(&self.bigram),
            cells: KvCells::new(params.n_ctx),
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            logits: None,
        })
    }
}

impl LlamaModel for ReferenceModel {
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn LlamaContext>> {
        Ok(Box::new(self.context(params)?))
    }

    fn chat_template(&self) -> Option<String> {
        Some(CHATML_TEMPLATE.to_string())
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == special::EOS || token == special::IM_END
    }

    fn description(&self) -> String {
        format!("bigram {N_VOCAB}-vocab ({})", self.name)
    }

    fn size_bytes(&self) -> u64 {
        (self.bigram.logits.len() * std::mem::size_of::<f32>()) as u64
    }

    fn n_params(&self) -> u64 {
        self.bigram.logits.len() as u64
    }
}

/// Compute context of a [`ReferenceModel`].
#[derive(Debug)]
pub struct ReferenceContext {
    bigram: Arc<Bigram>,
    cells: KvCells,
    n_ctx: usize,
    n_batch: usize,
    logits: Option<Vec<f32>>,
}

impl ReferenceContext {
    /// Token-position memory backing this context.
    pub fn cells(&self) -> &KvCells {
        &self.cells
    }
}

impl TokenMemory for ReferenceContext {
    fn clear(&mut self, data: bool) {
        TokenMemory::clear(&mut self.cells, data);
        if data {
            self.logits = None;
        }
    }

    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        TokenMemory::seq_rm(&mut self.cells, seq, p0, p1)
    }

    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        TokenMemory::seq_add(&mut self.cells, seq, p0, p1, delta);
    }
}

impl LlamaContext for ReferenceContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_batch(&self) -> usize {
        self.n_batch
    }

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>> {
        Ok(tokenize_bytes(text, add_special, parse_special))
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        if batch.is_empty() || batch.len() > self.n_batch {
            tracing::warn!(len = batch.len(), n_batch = self.n_batch, "invalid batch size");
            return Err(LlamaError::Decode { code: -1 });
        }

        for entry in batch.iter() {
            if vocab_index(entry.token).is_none() {
                tracing::warn!(token = entry.token, "token outside vocabulary");
                return Err(LlamaError::Decode { code: -1 });
            }
            let in_context = usize::try_from(entry.pos).is_ok_and(|p| p < self.n_ctx);
            if !in_context {
                tracing::warn!(pos = entry.pos, n_ctx = self.n_ctx, "no KV slot for position");
                return Err(LlamaError::Decode { code: 1 });
            }
        }

        let mut last_output = None;
        for entry in batch.iter() {
            self.cells
                .insert(entry.seq_id, entry.pos, entry.token)
                .map_err(|err| {
                    tracing::warn!(%err, "KV insert failed");
                    LlamaError::Decode { code: 1 }
                })?;
            if entry.logits {
                last_output = vocab_index(entry.token);
            }
        }

        self.logits = last_output.map(|t| self.bigram.row(t).to_vec());
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        match u8::try_from(token) {
            Ok(byte) => vec![byte],
            // Control tokens have no text
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(corpus: &str) -> ReferenceModel {
        ReferenceBackend::new()
            .unwrap()
            .model_from_text("test", corpus)
            .unwrap()
    }

    fn params(n_ctx: usize, n_batch: usize) -> ContextParams {
        ContextParams {
            n_ctx,
            n_batch,
            n_ubatch: n_batch,
            n_threads: 2,
            n_threads_batch: 2,
        }
    }

    #[test]
    fn tokenize_parses_control_text_only_when_asked() {
        let with = tokenize_bytes("<|im_end|>a", true, true);
        assert_eq!(with, vec![special::BOS, special::IM_END, 97]);

        let without = tokenize_bytes("<|im_end|>", false, false);
        assert_eq!(without.len(), "<|im_end|>".len());
    }

    #[test]
    fn empty_corpus_fails_to_load() {
        let err = ReferenceBackend::new()
            .unwrap()
            .model_from_text("blank", "\n\n  \n")
            .unwrap_err();
        assert!(matches!(err, LlamaError::ModelLoad(_)));
    }

    #[test]
    fn most_likely_successor_follows_corpus() {
        let m = model("ab\n\nab\n\nab");
        let row = m.bigram.row(b'a' as usize);
        let best = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(best, b'b' as usize);

        let after_b = m.bigram.row(b'b' as usize);
        assert!(after_b[special::EOS as usize] > after_b[b'a' as usize]);
    }

    #[test]
    fn decode_rejects_empty_and_oversized_batches() {
        let mut ctx = model("hello").context(&params(16, 2)).unwrap();
        let empty = Batch::new(4);
        assert!(matches!(ctx.decode(&empty), Err(LlamaError::Decode { code: -1 })));

        let mut big = Batch::new(4);
        for p in 0..3 {
            big.add(104, p, 0, false).unwrap();
        }
        assert!(matches!(ctx.decode(&big), Err(LlamaError::Decode { code: -1 })));
    }

    #[test]
    fn decode_out_of_context_position_is_status_one() {
        let mut ctx = model("hello").context(&params(4, 4)).unwrap();
        let mut batch = Batch::new(4);
        batch.add(104, 4, 0, true).unwrap();
        assert!(matches!(ctx.decode(&batch), Err(LlamaError::Decode { code: 1 })));
        assert!(ctx.cells().is_empty());
    }

    #[test]
    fn logits_follow_last_requested_entry() {
        let mut ctx = model("hello").context(&params(16, 8)).unwrap();
        let mut batch = Batch::new(8);
        batch.add(104, 0, 0, false).unwrap();
        batch.add(101, 1, 0, true).unwrap();
        ctx.decode(&batch).unwrap();
        assert_eq!(ctx.logits().map(<[f32]>::len), Some(N_VOCAB));
        assert_eq!(ctx.cells().len(), 2);

        batch.clear();
        batch.add(108, 2, 0, false).unwrap();
        ctx.decode(&batch).unwrap();
        assert!(ctx.logits().is_none());
    }

    #[test]
    fn control_tokens_render_empty() {
        let ctx = model("x").context(&params(8, 8)).unwrap();
        assert_eq!(ctx.token_to_piece(special::IM_END), Vec::<u8>::new());
        assert_eq!(ctx.token_to_piece(0xE2), vec![0xE2]);
    }

    #[test]
    fn zero_sized_context_fails() {
        assert!(matches!(
            model("x").context(&params(0, 8)),
            Err(LlamaError::ContextInit(_))
        ));
    }
}
