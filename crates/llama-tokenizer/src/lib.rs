//! # llama-tokenizer
//!
//! Text-side helpers that sit between a session and the engine's tokenizer.
//!
//! This crate provides:
//! - Role-tagged [`ChatMessage`]s and an append-only [`ChatHistory`]
//! - A [`ChatTemplate`] trait with Llama 3 and ChatML renderers, plus
//!   detection from a model-embedded template source
//! - Incremental formatting: render only the suffix a new message adds
//! - Streaming decoding with UTF-8 handling ([`TokenStream`])

mod chat;
mod stream;
mod template;

pub use chat::{ChatHistory, ChatMessage, Role};
pub use stream::{is_valid_utf8, TokenStream};
pub use template::{
    ChatMlTemplate, ChatTemplate, ChatTemplates, Llama3Template, TemplateKind, UnknownTemplate,
};
