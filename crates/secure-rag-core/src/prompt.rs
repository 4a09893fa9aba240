//! Prompt construction for answer generation.
//!
//! A [`Prompt`] is a system instruction, a bounded slice of conversation
//! history, and a final user turn carrying the retrieved context and, when
//! some sub-questions went unanswered, an annotation explaining which.

use serde::{Deserialize, Serialize};

use crate::models::{PartialContext, PartialKind, Passage};

const BASE_INSTRUCTION: &str = "You are a helpful assistant for an organization's internal knowledge base. \
Answer the user's question using only the provided context. \
If the context does not contain the answer, say that you could not find it. \
Do not invent facts and do not reveal information that is not in the context.";

const CLEARANCE_BLOCKED_INSTRUCTION: &str = "Some parts of the question relate to documents the user is not cleared to access. \
Answer the parts you can from the context, and state plainly that the remaining parts could not be answered \
because they require a higher access level. Do not speculate about the restricted content.";

const UNSATISFIED_INSTRUCTION: &str = "Some parts of the question had no matching documents. \
Answer the parts you can from the context, and state that no information was found for the rest.";

/// Separator placed between passages in the context block.
const PASSAGE_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A fully assembled prompt, ready for an LLM provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    /// History followed by the final user turn.
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    /// A prompt with a single user turn.
    pub fn simple(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: vec![ChatMessage::user(user)],
        }
    }

    /// Flatten into a single text block for completion-style endpoints.
    pub fn to_plain_text(&self) -> String {
        let mut out = format!("System: {}\n\n", self.system);
        for m in &self.messages {
            let who = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            out.push_str(&format!("{}: {}\n\n", who, m.content));
        }
        out.push_str("Assistant:");
        out
    }
}

/// Select the system instruction for the partial-context classification.
pub fn system_instruction(partial: Option<&PartialContext>) -> String {
    let kind = partial.map(PartialContext::kind).unwrap_or(PartialKind::Complete);
    match kind {
        PartialKind::Complete => BASE_INSTRUCTION.to_string(),
        PartialKind::ClearanceBlocked => format!("{} {}", BASE_INSTRUCTION, CLEARANCE_BLOCKED_INSTRUCTION),
        PartialKind::Unsatisfied => format!("{} {}", BASE_INSTRUCTION, UNSATISFIED_INSTRUCTION),
        PartialKind::Mixed => format!(
            "{} {} {}",
            BASE_INSTRUCTION, CLEARANCE_BLOCKED_INSTRUCTION, UNSATISFIED_INSTRUCTION
        ),
    }
}

/// Concatenate passages into a numbered context block.
pub fn build_context(passages: &[Passage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| match p.metadata.title.as_deref() {
            Some(title) => format!("[{}] {}\n{}", i + 1, title, p.content),
            None => format!("[{}]\n{}", i + 1, p.content),
        })
        .collect::<Vec<_>>()
        .join(PASSAGE_SEPARATOR)
}

/// Describe the unanswered sub-questions, if any.
pub fn partial_annotation(partial: &PartialContext) -> Option<String> {
    if partial.is_complete() {
        return None;
    }
    let mut lines = Vec::new();
    if !partial.clearance_blocked.is_empty() {
        lines.push(format!(
            "Sub-questions requiring a higher access level: {}",
            partial.clearance_blocked.join("; ")
        ));
    }
    if !partial.unsatisfied.is_empty() {
        lines.push(format!(
            "Sub-questions with no matching documents: {}",
            partial.unsatisfied.join("; ")
        ));
    }
    Some(lines.join("\n"))
}

/// The most recent `max_messages` messages of a history, in order.
pub fn bounded_history(history: &[ChatMessage], max_messages: usize) -> &[ChatMessage] {
    let start = history.len().saturating_sub(max_messages);
    &history[start..]
}

/// Assemble the full prompt.
pub fn build_prompt(
    question: &str,
    passages: &[Passage],
    partial: Option<&PartialContext>,
    history: &[ChatMessage],
    max_history: usize,
) -> Prompt {
    let mut user = format!("Context:\n{}\n\n", build_context(passages));
    if let Some(note) = partial.and_then(partial_annotation) {
        user.push_str(&format!("Note:\n{}\n\n", note));
    }
    user.push_str(&format!("Question: {}", question));

    let mut messages = bounded_history(history, max_history).to_vec();
    messages.push(ChatMessage::user(user));

    Prompt {
        system: system_instruction(partial),
        messages,
    }
}
