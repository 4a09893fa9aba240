//! Conversation history.
//!
//! The pipeline reads recent turns to give the model conversational
//! context. Persisting turns is the caller's job.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use secure_rag_core::prompt::ChatMessage;
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait ConversationHistory: Send + Sync {
    /// Up to `limit` most recent messages of a conversation, oldest first.
    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;
}

/// In-memory history keyed by conversation id.
#[derive(Default)]
pub struct InMemoryHistory {
    conversations: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, conversation_id: &str, message: ChatMessage) -> Result<()> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|_| anyhow!("history lock poisoned"))?;
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }
}

#[async_trait]
impl ConversationHistory for InMemoryHistory {
    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let conversations = self
            .conversations
            .read()
            .map_err(|_| anyhow!("history lock poisoned"))?;
        let Some(messages) = conversations.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }
}
