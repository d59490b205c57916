//! Chunked decoding through a fixed-size batch.

use llama_engine::{Batch, LlamaContext, LlamaError, Pos, TokenId};
use llama_kv::{ContextWindow, Shift};

use crate::error::{Result, SessionError};

/// Sequence every session token is written to.
pub const SEQ_ID: llama_engine::SeqId = 0;

/// Owns the reusable batch buffer and feeds token runs to the engine.
#[derive(Debug)]
pub struct BatchDecoder {
    batch: Batch,
}

impl BatchDecoder {
    pub fn new(capacity: usize) -> Self {
        Self {
            batch: Batch::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.batch.capacity()
    }

    /// Decode `tokens` at the window's current position, one batch-sized
    /// chunk at a time.
    ///
    /// Before each chunk, if writing it would reach the headroom, the window
    /// is shifted first. A chunk that still does not fit below the usable
    /// capacity after the shift is cut to the room left, and the rest goes
    /// out with the next chunk. Positions are taken from the window after
    /// any shift, and the window advances after every successful chunk. Only
    /// the final token requests logits, and only when `compute_last_logit`
    /// is set.
    ///
    /// The first failing chunk aborts the call; later chunks are never sent.
    /// Returns the shifts that discarded tokens.
    pub fn decode_in_chunks(
        &mut self,
        ctx: &mut dyn LlamaContext,
        window: &mut ContextWindow,
        tokens: &[TokenId],
        compute_last_logit: bool,
    ) -> Result<Vec<Shift>> {
        let mut shifts = Vec::new();
        let last = tokens.len().saturating_sub(1);
        let chunk_size = self.batch.capacity().max(1);
        let usable = window.usable_capacity();

        let mut offset = 0;
        let mut chunk_index = 0;
        while offset < tokens.len() {
            let mut len = chunk_size.min(tokens.len() - offset);
            if window.would_overflow(len) {
                let shift = window.shift(&mut *ctx);
                if shift.discarded > 0 {
                    shifts.push(shift);
                }
            }

            let start = window.current_position();
            let room = usable.saturating_sub(start);
            if room == 0 {
                tracing::error!(position = start, usable, "no room left after shift");
                return Err(SessionError::ContextFull {
                    position: start,
                    usable,
                });
            }
            len = len.min(room);

            let chunk = &tokens[offset..offset + len];
            self.batch.clear();
            for (j, &token) in chunk.iter().enumerate() {
                let want_logit = compute_last_logit && offset + j == last;
                self.batch
                    .add(token, (start + j) as Pos, SEQ_ID, want_logit)
                    .map_err(LlamaError::from)?;
            }

            if let Err(err) = ctx.decode(&self.batch) {
                tracing::error!(
                    %err,
                    chunk = chunk_index,
                    position = start,
                    len,
                    "batch decode failed"
                );
                return Err(err.into());
            }
            window.advance(len)?;
            offset += len;
            chunk_index += 1;
        }

        Ok(shifts)
    }

    /// Decode one generated token at the current position with logits on.
    pub fn decode_single(
        &mut self,
        ctx: &mut dyn LlamaContext,
        window: &mut ContextWindow,
        token: TokenId,
    ) -> Result<()> {
        self.batch.clear();
        self.batch
            .add(token, window.current_position() as Pos, SEQ_ID, true)
            .map_err(LlamaError::from)?;
        ctx.decode(&self.batch)?;
        window.advance(1)?;
        Ok(())
    }
}
