//! Chat templates.
//!
//! Models ship their chat format as template source text. Rather than
//! interpreting arbitrary templates, the family is detected from the control
//! tokens the source mentions and rendered by a native implementation.

use std::fmt;
use std::str::FromStr;

use crate::chat::ChatMessage;

/// Control tokens used by Llama 3 instruction formatting.
pub mod llama3 {
    pub const START_HEADER: &str = "<|start_header_id|>";
    pub const END_HEADER: &str = "<|end_header_id|>";
    pub const EOT: &str = "<|eot_id|>";
}

/// Control tokens used by ChatML formatting.
pub mod chatml {
    pub const IM_START: &str = "<|im_start|>";
    pub const IM_END: &str = "<|im_end|>";
}

/// Renders a full conversation into prompt text.
pub trait ChatTemplate: Send + Sync {
    /// Render `messages`; `add_generation_prompt` appends the header that
    /// opens the assistant's reply.
    fn apply(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String;
}

/// Llama 3 instruction format.
///
/// ```text
/// <|start_header_id|>system<|end_header_id|>
///
/// {system_message}<|eot_id|><|start_header_id|>user<|end_header_id|>
///
/// {user_message}<|eot_id|><|start_header_id|>assistant<|end_header_id|>
///
/// ```
///
/// BOS is left to the tokenizer (`add_special`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Llama3Template;

impl ChatTemplate for Llama3Template {
    fn apply(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut output = String::new();
        for msg in messages {
            output.push_str(llama3::START_HEADER);
            output.push_str(msg.role.as_str());
            output.push_str(llama3::END_HEADER);
            output.push_str("\n\n");
            output.push_str(&msg.content);
            output.push_str(llama3::EOT);
        }
        if add_generation_prompt {
            output.push_str(llama3::START_HEADER);
            output.push_str("assistant");
            output.push_str(llama3::END_HEADER);
            output.push_str("\n\n");
        }
        output
    }
}

/// ChatML format (`<|im_start|>role\ncontent<|im_end|>\n`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatMlTemplate;

impl ChatTemplate for ChatMlTemplate {
    fn apply(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut output = String::new();
        for msg in messages {
            output.push_str(chatml::IM_START);
            output.push_str(msg.role.as_str());
            output.push('\n');
            output.push_str(&msg.content);
            output.push_str(chatml::IM_END);
            output.push('\n');
        }
        if add_generation_prompt {
            output.push_str(chatml::IM_START);
            output.push_str("assistant\n");
        }
        output
    }
}

/// Template families with a native renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Llama3,
    ChatMl,
}

/// Returned when a template name is not a known family.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chat template `{0}` (expected `llama3` or `chatml`)")]
pub struct UnknownTemplate(pub String);

impl TemplateKind {
    /// Guess the family from template source text.
    pub fn detect(source: &str) -> Option<Self> {
        if source.contains(llama3::START_HEADER) && source.contains(llama3::EOT) {
            Some(TemplateKind::Llama3)
        } else if source.contains(chatml::IM_START) {
            Some(TemplateKind::ChatMl)
        } else {
            None
        }
    }

    pub fn renderer(&self) -> Box<dyn ChatTemplate> {
        match self {
            TemplateKind::Llama3 => Box::new(Llama3Template),
            TemplateKind::ChatMl => Box::new(ChatMlTemplate),
        }
    }
}

impl FromStr for TemplateKind {
    type Err = UnknownTemplate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llama3" | "llama-3" => Ok(TemplateKind::Llama3),
            "chatml" => Ok(TemplateKind::ChatMl),
            other => Err(UnknownTemplate(other.to_string())),
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateKind::Llama3 => write!(f, "llama3"),
            TemplateKind::ChatMl => write!(f, "chatml"),
        }
    }
}

/// The chat-template handle of a prepared session.
///
/// `explicit` is `None` when the model ships no usable template; callers
/// then pass text through unformatted.
pub struct ChatTemplates {
    kind: Option<TemplateKind>,
    explicit: Option<Box<dyn ChatTemplate>>,
}

impl ChatTemplates {
    /// No explicit template: formatting is the identity.
    pub fn none() -> Self {
        Self {
            kind: None,
            explicit: None,
        }
    }

    pub fn explicit(kind: TemplateKind) -> Self {
        Self {
            kind: Some(kind),
            explicit: Some(kind.renderer()),
        }
    }

    /// Use a custom renderer.
    pub fn custom(template: Box<dyn ChatTemplate>) -> Self {
        Self {
            kind: None,
            explicit: Some(template),
        }
    }

    /// Resolve the template for a model.
    ///
    /// A configured `override_name` wins over the model's embedded source.
    /// Unknown names and unrecognised sources fall back to no template.
    pub fn from_model(source: Option<&str>, override_name: Option<&str>) -> Self {
        if let Some(name) = override_name {
            match name.parse::<TemplateKind>() {
                Ok(kind) => return Self::explicit(kind),
                Err(e) => tracing::warn!("{e}; falling back to the model template"),
            }
        }

        match source {
            Some(src) => match TemplateKind::detect(src) {
                Some(kind) => Self::explicit(kind),
                None => {
                    tracing::warn!("unrecognised chat template in model; prompts are sent unformatted");
                    Self::none()
                }
            },
            None => Self::none(),
        }
    }

    /// Whether prompts get formatted at all.
    pub fn was_explicit(&self) -> bool {
        self.explicit.is_some()
    }

    pub fn kind(&self) -> Option<TemplateKind> {
        self.kind
    }

    /// Render only what `new_message` adds on top of `history`.
    ///
    /// Without an explicit template this returns the message content.
    pub fn format_single(
        &self,
        history: &[ChatMessage],
        new_message: &ChatMessage,
        add_generation_prompt: bool,
    ) -> String {
        let Some(template) = self.explicit.as_deref() else {
            return new_message.content.clone();
        };

        let past = if history.is_empty() {
            String::new()
        } else {
            template.apply(history, false)
        };

        let mut output = String::new();
        // A trailing newline of the past rendering belongs to the new turn too.
        if add_generation_prompt && past.ends_with('\n') {
            output.push('\n');
        }

        let mut messages = history.to_vec();
        messages.push(new_message.clone());
        let full = template.apply(&messages, add_generation_prompt);
        output.push_str(full.get(past.len()..).unwrap_or_default());
        output
    }
}

impl fmt::Debug for ChatTemplates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatTemplates")
            .field("kind", &self.kind)
            .field("explicit", &self.was_explicit())
            .finish()
    }
}
