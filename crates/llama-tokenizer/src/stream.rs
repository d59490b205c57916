//! UTF-8-safe incremental emission of generated text.
//!
//! Tokens decode to raw bytes, and a multi-byte character may be split
//! across several tokens. [`TokenStream`] holds bytes back until the
//! buffer is well-formed, so callers never see a partial character.

/// Strict structural UTF-8 check.
///
/// Every sequence must start with a `0xxxxxxx`, `110xxxxx`, `1110xxxx` or
/// `11110xxx` header and be followed by exactly 0, 1, 2 or 3 `10xxxxxx`
/// continuation bytes. Any other leading pattern, or a buffer that ends
/// mid-sequence, is invalid.
pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        let len = if lead & 0x80 == 0x00 {
            1
        } else if lead & 0xE0 == 0xC0 {
            2
        } else if lead & 0xF0 == 0xE0 {
            3
        } else if lead & 0xF8 == 0xF0 {
            4
        } else {
            return false;
        };
        i += 1;
        for _ in 1..len {
            match bytes.get(i) {
                Some(b) if b & 0xC0 == 0x80 => i += 1,
                _ => return false,
            }
        }
    }
    true
}

/// Per-turn streaming state: the pending UTF-8 tail and the assistant
/// reply emitted so far.
#[derive(Debug, Clone, Default)]
pub struct TokenStream {
    pending: Vec<u8>,
    reply: String,
    chunks: usize,
}

impl TokenStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the bytes of one token.
    ///
    /// Returns the whole buffer once it is well-formed (and appends it to
    /// the reply), or an empty string while a character is still incomplete.
    pub fn emit(&mut self, piece: &[u8]) -> String {
        self.pending.extend_from_slice(piece);
        if !is_valid_utf8(&self.pending) {
            return String::new();
        }

        let bytes = std::mem::take(&mut self.pending);
        // Structurally valid but not a scalar value (overlong, surrogate):
        // replace rather than drop.
        let text = String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
        self.reply.push_str(&text);
        if !text.is_empty() {
            self.chunks += 1;
        }
        text
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Assistant text emitted so far this turn.
    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// Number of non-empty chunks emitted this turn.
    pub fn chunks_emitted(&self) -> usize {
        self.chunks
    }

    /// Move the accumulated reply out, leaving it empty.
    pub fn take_reply(&mut self) -> String {
        std::mem::take(&mut self.reply)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.reply.clear();
        self.chunks = 0;
    }
}
