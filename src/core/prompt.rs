//! Chat message validation and combined-prompt assembly.
//!
//! The backend consumes one flat prompt per turn, so the message history is
//! rendered into a single block: an optional system section first, then the
//! remaining turns with role labels, separated by `---` lines.

use crate::core::outcome::UsageStats;
use minijinja::{context, Environment};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    /// Roles this gateway does not know are kept as-is rather than
    /// rejected.
    Other(String),
}

impl Role {
    pub fn from_wire(raw: &str) -> Role {
        match raw {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => Role::Other(other.to_string()),
        }
    }

    fn label(&self) -> String {
        match self {
            Role::System => "System".to_string(),
            Role::User => "User".to_string(),
            Role::Assistant => "Assistant".to_string(),
            Role::Tool => "Tool".to_string(),
            Role::Other(raw) => {
                let mut chars = raw.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => "Unknown".to_string(),
                }
            }
        }
    }
}

impl ChatMessage {
    fn as_jinja_value(&self) -> minijinja::Value {
        context! {
            role => self.role.label(),
            content => self.content.trim(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("'messages' array is missing or empty")]
    EmptyMessages,
    #[error("all messages are system messages; at least one user or assistant message is required")]
    OnlySystemMessages,
}

pub fn validate(messages: &[ChatMessage]) -> Result<(), ValidationError> {
    if messages.is_empty() {
        return Err(ValidationError::EmptyMessages);
    }
    if messages.iter().all(|m| m.role == Role::System) {
        return Err(ValidationError::OnlySystemMessages);
    }
    Ok(())
}

const COMBINED_PROMPT_TEMPLATE: &str = r"{%- if system %}System instructions:
{{ system }}{% endif -%}
{% for turn in turns %}{% if system or not loop.first %}
---
{% endif %}{{ turn.role }}:
{{ turn.content }}{%- endfor %}";

fn prompt_env() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(|| {
        let mut env = Environment::new();
        env.add_template("combined", COMBINED_PROMPT_TEMPLATE)
            .expect("combined prompt template must parse");
        env
    })
}

/// Renders the message history into the single prompt the backend types
/// into the session.
///
/// Only the first system message is honored, and only if it has content;
/// later system messages are dropped.
pub fn combine(messages: &[ChatMessage]) -> anyhow::Result<String> {
    let system = messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.trim())
        .filter(|content| !content.is_empty())
        .map(str::to_string);

    let turns: Vec<minijinja::Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(ChatMessage::as_jinja_value)
        .collect();

    let prompt = prompt_env()
        .get_template("combined")
        .expect("combined prompt template is registered")
        .render(context! { system => system, turns => turns })?;
    Ok(prompt)
}

/// Character-count token estimate: CJK text runs ~1.5 characters per token,
/// everything else ~4.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let cjk = text.chars().filter(|&c| is_cjk(c)).count();
    let other = text.chars().count() - cjk;
    let estimate = cjk as f64 / 1.5 + other as f64 / 4.0;
    (estimate as usize).max(1)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}' | '\u{3000}'..='\u{303f}' | '\u{ff00}'..='\u{ffef}')
}

pub fn usage(prompt: &str, completion: &str, reasoning: Option<&str>) -> UsageStats {
    let prompt_tokens = estimate_tokens(prompt);
    let completion_tokens =
        estimate_tokens(completion) + reasoning.map(estimate_tokens).unwrap_or(0);
    UsageStats {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}
