//! Scripted fake engine shared by the session test suites.
//!
//! Text tokenizes to one token per byte. Every decode that requests a
//! logit makes the next scripted token the overwhelming favourite, so the
//! sampler reproduces the script exactly.
#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use llama_engine::{
    Batch, BatchEntry, ContextParams, LlamaBackend, LlamaContext, LlamaError, LlamaModel,
    ModelSpec, Pos, Result, SeqId, TokenId, TokenMemory,
};
use llama_kv::KvCells;

pub const BOS: TokenId = 256;
pub const EOG: TokenId = 257;
pub const N_VOCAB: usize = 260;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryOp {
    Clear,
    Remove { p0: Pos, p1: Pos },
    Add { p0: Pos, p1: Pos, delta: Pos },
}

#[derive(Debug, Default)]
pub struct EngineLog {
    pub decodes: Vec<Vec<BatchEntry>>,
    pub memory: Vec<MemoryOp>,
    pub tokenized: Vec<(String, bool)>,
    pub freed: bool,
}

#[derive(Debug, Clone)]
pub struct Script {
    /// Tokens the model "wants" to produce, in order.
    pub reply: Vec<TokenId>,
    /// Once the script runs out, keep producing this token.
    pub filler: TokenId,
    /// Zero-based decode call that fails with status 1.
    pub fail_decode_at: Option<usize>,
    pub template: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            reply: Vec::new(),
            filler: b'.' as TokenId,
            fail_decode_at: None,
            template: None,
        }
    }
}

impl Script {
    /// Reply `text` byte by byte, then end-of-generation.
    pub fn reply(text: &str) -> Self {
        let mut reply: Vec<TokenId> = text.bytes().map(TokenId::from).collect();
        reply.push(EOG);
        Self {
            reply,
            ..Self::default()
        }
    }

    /// Never emits end-of-generation.
    pub fn endless(filler: u8) -> Self {
        Self {
            filler: TokenId::from(filler),
            ..Self::default()
        }
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    pub fn failing_at(mut self, call: usize) -> Self {
        self.fail_decode_at = Some(call);
        self
    }
}

#[derive(Clone, Default)]
pub struct SharedLog(Arc<Mutex<EngineLog>>);

impl SharedLog {
    pub fn get(&self) -> MutexGuard<'_, EngineLog> {
        self.0.lock().unwrap()
    }

    pub fn decode_calls(&self) -> usize {
        self.get().decodes.len()
    }
}

pub struct FakeBackend {
    pub script: Script,
    pub log: SharedLog,
    pub fail_load: bool,
}

impl FakeBackend {
    pub fn new(script: Script) -> (Self, SharedLog) {
        let log = SharedLog::default();
        (
            Self {
                script,
                log: log.clone(),
                fail_load: false,
            },
            log,
        )
    }
}

impl LlamaBackend for FakeBackend {
    fn load_model(&self, spec: &ModelSpec) -> Result<Box<dyn LlamaModel>> {
        if self.fail_load {
            return Err(LlamaError::ModelLoad(format!(
                "{}: unsupported format",
                spec.path.display()
            )));
        }
        Ok(Box::new(FakeModel {
            script: self.script.clone(),
            log: self.log.clone(),
        }))
    }

    fn name(&self) -> String {
        "FAKE".into()
    }

    fn system_info(&self) -> String {
        "FAKE : SIMD = 0".into()
    }

    fn free(&self) {
        self.log.get().freed = true;
    }
}

pub struct FakeModel {
    pub script: Script,
    pub log: SharedLog,
}

impl FakeModel {
    pub fn context(&self, n_ctx: usize, n_batch: usize) -> FakeContext {
        FakeContext {
            script: self.script.clone(),
            log: self.log.clone(),
            cells: KvCells::new(n_ctx),
            n_ctx,
            n_batch,
            next: 0,
            logits: None,
        }
    }
}

impl LlamaModel for FakeModel {
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn LlamaContext>> {
        if params.n_ctx == 0 {
            return Err(LlamaError::ContextInit("n_ctx is zero".into()));
        }
        Ok(Box::new(self.context(params.n_ctx, params.n_batch)))
    }

    fn chat_template(&self) -> Option<String> {
        self.script.template.clone()
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOG
    }

    fn description(&self) -> String {
        "fake 260-vocab".into()
    }

    fn size_bytes(&self) -> u64 {
        1 << 20
    }

    fn n_params(&self) -> u64 {
        (N_VOCAB * N_VOCAB) as u64
    }
}

pub struct FakeContext {
    script: Script,
    pub log: SharedLog,
    pub cells: KvCells,
    n_ctx: usize,
    n_batch: usize,
    next: usize,
    logits: Option<Vec<f32>>,
}

impl FakeContext {
    fn favourite(&mut self) -> Vec<f32> {
        let token = self
            .script
            .reply
            .get(self.next)
            .copied()
            .unwrap_or(self.script.filler);
        self.next += 1;
        let mut row = vec![0.0; N_VOCAB];
        row[token as usize] = 100.0;
        row
    }
}

impl TokenMemory for FakeContext {
    fn clear(&mut self, data: bool) {
        self.log.get().memory.push(MemoryOp::Clear);
        TokenMemory::clear(&mut self.cells, data);
    }

    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        self.log.get().memory.push(MemoryOp::Remove { p0, p1 });
        TokenMemory::seq_rm(&mut self.cells, seq, p0, p1)
    }

    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        self.log.get().memory.push(MemoryOp::Add { p0, p1, delta });
        TokenMemory::seq_add(&mut self.cells, seq, p0, p1, delta);
    }
}

impl LlamaContext for FakeContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_batch(&self) -> usize {
        self.n_batch
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<TokenId>> {
        self.log.get().tokenized.push((text.to_string(), add_special));
        let mut tokens = Vec::new();
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(TokenId::from));
        Ok(tokens)
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        let call = {
            let mut log = self.log.get();
            log.decodes.push(batch.entries().to_vec());
            log.decodes.len() - 1
        };
        if self.script.fail_decode_at == Some(call) {
            return Err(LlamaError::Decode { code: 1 });
        }
        if batch.is_empty() || batch.len() > self.n_batch {
            return Err(LlamaError::Decode { code: -1 });
        }
        for e in batch.iter() {
            if e.pos < 0 || e.pos as usize >= self.n_ctx {
                return Err(LlamaError::Decode { code: 1 });
            }
        }
        for e in batch.iter() {
            self.cells
                .insert(e.seq_id, e.pos, e.token)
                .map_err(|_| LlamaError::Decode { code: 1 })?;
        }
        self.logits = if batch.n_outputs() > 0 {
            Some(self.favourite())
        } else {
            None
        };
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        u8::try_from(token).map(|b| vec![b]).unwrap_or_default()
    }
}
