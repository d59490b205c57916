//! Fixed-capacity decode batch.

use crate::{Pos, SeqId, TokenId};

/// Returned by [`Batch::add`] when the batch is already at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("batch is full (capacity {capacity})")]
pub struct BatchFull {
    pub capacity: usize,
}

/// One `(token, position, sequence, wants-logit)` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: Pos,
    pub seq_id: SeqId,
    pub logits: bool,
}

/// Reusable buffer of tokens submitted to the engine in one decode call.
///
/// Storage is allocated once; [`Batch::clear`] keeps it for the next chunk.
#[derive(Debug, Clone)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn add(&mut self, token: TokenId, pos: Pos, seq_id: SeqId, logits: bool) -> Result<(), BatchFull> {
        if self.entries.len() >= self.capacity {
            return Err(BatchFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(BatchEntry {
            token,
            pos,
            seq_id,
            logits,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries that requested logits.
    pub fn n_outputs(&self) -> usize {
        self.entries.iter().filter(|e| e.logits).count()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchEntry> {
        self.entries.iter()
    }
}
