//! Cell-based token-position memory.
//!
//! Each cell holds one `(sequence, position, token)` entry. Removing a range
//! frees cells; shifting a range rewrites their positions in place. This is
//! the bookkeeping half of a KV cache: it knows *where* tokens live, not the
//! tensors computed for them.

use llama_engine::{Pos, SeqId, TokenId, TokenMemory};

use crate::{KvError, KvResult};

/// A single occupied cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCell {
    pub seq_id: SeqId,
    pub pos: Pos,
    pub token: TokenId,
}

/// Fixed-capacity cell store.
///
/// # Invariants
/// - At most one cell per `(seq_id, pos)`
/// - `used <= capacity`
#[derive(Debug, Clone)]
pub struct KvCells {
    cells: Vec<Option<KvCell>>,
    used: usize,
}

/// Normalize a half-open range where negative bounds mean "unbounded".
fn bounds(p0: Pos, p1: Pos) -> (Pos, Pos) {
    let p0 = p0.max(0);
    let p1 = if p1 < 0 { Pos::MAX } else { p1 };
    (p0, p1)
}

impl KvCells {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![None; capacity],
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Store `token` at `(seq_id, pos)`, overwriting an existing entry.
    ///
    /// # Errors
    /// - `NegativePosition`: if `pos < 0`
    /// - `CapacityExceeded`: if every cell is occupied
    pub fn insert(&mut self, seq_id: SeqId, pos: Pos, token: TokenId) -> KvResult<()> {
        if pos < 0 {
            return Err(KvError::NegativePosition(pos));
        }

        let cell = KvCell { seq_id, pos, token };

        if let Some(existing) = self
            .cells
            .iter_mut()
            .flatten()
            .find(|c| c.seq_id == seq_id && c.pos == pos)
        {
            *existing = cell;
            return Ok(());
        }

        match self.cells.iter_mut().find(|c| c.is_none()) {
            Some(slot) => {
                *slot = Some(cell);
                self.used += 1;
                Ok(())
            }
            None => Err(KvError::CapacityExceeded {
                seq_len: self.used + 1,
                max: self.capacity(),
            }),
        }
    }

    /// Free every cell.
    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = None);
        self.used = 0;
    }

    /// Free cells of `seq_id` with positions in `[p0, p1)`. Returns how many
    /// cells were freed.
    pub fn seq_rm(&mut self, seq_id: SeqId, p0: Pos, p1: Pos) -> usize {
        let (p0, p1) = bounds(p0, p1);
        let mut removed = 0;
        for slot in &mut self.cells {
            if matches!(slot, Some(c) if c.seq_id == seq_id && c.pos >= p0 && c.pos < p1) {
                *slot = None;
                removed += 1;
            }
        }
        self.used -= removed;
        removed
    }

    /// Add `delta` to the position of every cell of `seq_id` in `[p0, p1)`.
    /// Cells pushed below position zero are freed.
    pub fn seq_add(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        if delta == 0 {
            return;
        }
        let (p0, p1) = bounds(p0, p1);
        for slot in &mut self.cells {
            let Some(cell) = slot else { continue };
            if cell.seq_id != seq_id || cell.pos < p0 || cell.pos >= p1 {
                continue;
            }
            cell.pos += delta;
            if cell.pos < 0 {
                *slot = None;
                self.used -= 1;
            }
        }
    }

    /// Occupied cells of `seq_id`, ordered by position.
    pub fn sequence(&self, seq_id: SeqId) -> Vec<KvCell> {
        let mut cells: Vec<KvCell> = self
            .cells
            .iter()
            .flatten()
            .filter(|c| c.seq_id == seq_id)
            .copied()
            .collect();
        cells.sort_by_key(|c| c.pos);
        cells
    }

    /// Highest occupied position of `seq_id`.
    pub fn max_pos(&self, seq_id: SeqId) -> Option<Pos> {
        self.cells
            .iter()
            .flatten()
            .filter(|c| c.seq_id == seq_id)
            .map(|c| c.pos)
            .max()
    }

    /// Token stored at `(seq_id, pos)`.
    pub fn token_at(&self, seq_id: SeqId, pos: Pos) -> Option<TokenId> {
        self.cells
            .iter()
            .flatten()
            .find(|c| c.seq_id == seq_id && c.pos == pos)
            .map(|c| c.token)
    }
}

impl TokenMemory for KvCells {
    fn clear(&mut self, _data: bool) {
        KvCells::clear(self);
    }

    fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        KvCells::seq_rm(self, seq, p0, p1);
        true
    }

    fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        KvCells::seq_add(self, seq, p0, p1, delta);
    }
}
