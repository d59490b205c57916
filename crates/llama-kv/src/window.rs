//! Position counters of the single active context window.

use llama_engine::{Pos, SeqId, TokenMemory};

/// Tokens of capacity kept free to avoid exact-boundary decode failures.
pub const OVERFLOW_HEADROOM: usize = 4;

const SEQ: SeqId = 0;

/// Result of a context shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    /// Tokens removed right after the system prompt.
    pub discarded: usize,
    /// Next free position after the shift.
    pub current_position: usize,
}

/// Absolute token positions of the active session.
///
/// # Invariants
/// - `system_prompt_position <= current_position <= capacity`
/// - `system_prompt_position` only moves on [`mark_system_prompt`](Self::mark_system_prompt)
///   and [`reset`](Self::reset), never during a shift
/// - `stop_generation_position` is `Some` only while a user turn is active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    capacity: usize,
    headroom: usize,
    system_prompt_position: usize,
    current_position: usize,
    stop_generation_position: Option<usize>,
}

impl ContextWindow {
    /// Create an empty window.
    ///
    /// # Panics
    /// If `headroom >= capacity`.
    pub fn new(capacity: usize, headroom: usize) -> Self {
        assert!(
            headroom < capacity,
            "ContextWindow requires headroom < capacity (got {headroom} >= {capacity})"
        );
        Self {
            capacity,
            headroom,
            system_prompt_position: 0,
            current_position: 0,
            stop_generation_position: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// Largest position count a single prompt may occupy.
    pub fn usable_capacity(&self) -> usize {
        self.capacity - self.headroom
    }

    pub fn system_prompt_position(&self) -> usize {
        self.system_prompt_position
    }

    pub fn current_position(&self) -> usize {
        self.current_position
    }

    pub fn stop_generation_position(&self) -> Option<usize> {
        self.stop_generation_position
    }

    /// True once `current_position` is within the headroom of capacity.
    pub fn needs_shift(&self) -> bool {
        self.current_position >= self.usable_capacity()
    }

    /// True if writing `upcoming` more tokens would reach the headroom.
    pub fn would_overflow(&self, upcoming: usize) -> bool {
        self.current_position + upcoming >= self.usable_capacity()
    }

    /// True when generation for the current turn must halt. Without an
    /// active turn there is nothing to generate.
    pub fn reached_stop(&self) -> bool {
        self.stop_generation_position
            .map_or(true, |stop| self.current_position >= stop)
    }

    /// Record `n` freshly decoded tokens.
    pub fn advance(&mut self, n: usize) -> crate::KvResult<()> {
        let next = self.current_position + n;
        if next > self.capacity {
            return Err(crate::KvError::CapacityExceeded {
                seq_len: next,
                max: self.capacity,
            });
        }
        self.current_position = next;
        Ok(())
    }

    /// Pin everything decoded so far as the never-discarded system prompt.
    pub fn mark_system_prompt(&mut self) {
        self.system_prompt_position = self.current_position;
    }

    pub fn set_stop_generation_position(&mut self, position: usize) {
        self.stop_generation_position = Some(position);
    }

    pub fn clear_stop_generation_position(&mut self) {
        self.stop_generation_position = None;
    }

    /// Zero every counter. Idempotent.
    pub fn reset(&mut self) {
        self.system_prompt_position = 0;
        self.current_position = 0;
        self.stop_generation_position = None;
    }

    /// Tokens the next shift would discard: the older half of the
    /// post-system-prompt window.
    pub fn discard_count(&self) -> usize {
        (self.current_position - self.system_prompt_position) / 2
    }

    /// Discard the older half of the post-system window and slide the rest
    /// down so it directly follows the system prompt.
    ///
    /// The retained range keeps its order and spacing. A window with nothing
    /// after the system prompt shifts by zero and leaves `memory` untouched.
    /// The stop position moves with the retained tokens so the turn keeps
    /// its remaining budget.
    pub fn shift<M: TokenMemory + ?Sized>(&mut self, memory: &mut M) -> Shift {
        let discarded = self.discard_count();
        if discarded == 0 {
            return Shift {
                discarded,
                current_position: self.current_position,
            };
        }

        let keep_from = self.system_prompt_position + discarded;
        memory.seq_rm(SEQ, self.system_prompt_position as Pos, keep_from as Pos);
        memory.seq_add(
            SEQ,
            keep_from as Pos,
            self.current_position as Pos,
            -(discarded as Pos),
        );

        self.current_position -= discarded;
        if let Some(stop) = self.stop_generation_position.as_mut() {
            *stop = stop.saturating_sub(discarded);
        }

        tracing::debug!(
            discarded,
            system_prompt_position = self.system_prompt_position,
            current_position = self.current_position,
            "context shifted"
        );

        Shift {
            discarded,
            current_position: self.current_position,
        }
    }
}
