//! Command implementations for the `srag` binary.

use anyhow::{Context, Result};
use futures::StreamExt;
use secure_rag_core::models::{Clearance, Passage, SecurityLevel};
use secure_rag_core::prompt::ChatMessage;
use secure_rag_core::store::memory::InMemoryPassageStore;
use secure_rag_core::store::{CacheBackend, Search};
use secure_rag_core::store::vector_cache::InMemoryCacheBackend;
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, EmbeddingProviderConfig};
use crate::history::{ConversationHistory, InMemoryHistory};
use crate::pipeline::{Answer, AnswerBody, Pipeline};

/// Print the resolved configuration. Performs no network calls.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Configuration OK");
    println!();
    println!(
        "retrieval   top_k={} rerank={} (top_k={}, threshold={}) concurrent={}",
        config.retrieval.top_k,
        config.retrieval.rerank_enabled,
        config.retrieval.rerank_top_k,
        config.retrieval.rerank_threshold,
        config.retrieval.concurrent_sub_queries
    );
    println!(
        "planner     decomposition={} max_sub_queries={}",
        config.planner.decomposition_enabled, config.planner.max_sub_queries
    );
    println!(
        "embedding   {}",
        match &config.embedding.provider {
            EmbeddingProviderConfig::Disabled => "disabled".to_string(),
            EmbeddingProviderConfig::OpenAi { model, dims, .. } => format!("openai:{} ({} dims)", model, dims),
            EmbeddingProviderConfig::Local { model, dims, .. } => format!("local:{} ({} dims)", model, dims),
            EmbeddingProviderConfig::Hashing { dims } => format!("hashing ({} dims)", dims),
        }
    );
    let cache_state = if !config.cache.enabled {
        "disabled"
    } else if !config.embedding.is_enabled() {
        "inactive (no embedding provider)"
    } else {
        "enabled"
    };
    println!(
        "cache       {} response(threshold={}, ttl={}s, encrypt={}) context(threshold={}, ttl={}s, encrypt={})",
        cache_state,
        config.cache.response.similarity_threshold,
        config.cache.response.ttl_secs,
        config.cache.response.encrypt,
        config.cache.context.similarity_threshold,
        config.cache.context.ttl_secs,
        config.cache.context.encrypt
    );
    println!("llm.default {}", config.llm.default.label());
    if let Some(internal) = &config.llm.internal {
        println!(
            "llm.internal {} (content >= {})",
            internal.label(),
            config.llm.internal_threshold
        );
    }
    if let Some(fallback) = &config.llm.fallback {
        match config.llm.fallback_max_level {
            Some(max) => println!("llm.fallback {} (content <= {})", fallback.label(), max),
            None => println!("llm.fallback {}", fallback.label()),
        }
    }
    Ok(())
}

/// Options for [`run_ask`].
pub struct AskOptions<'a> {
    pub question: &'a str,
    pub corpus: &'a Path,
    pub clearance: Clearance,
    pub conversation: Option<&'a str>,
    pub history: Option<&'a Path>,
    pub stream: bool,
    pub json: bool,
}

/// Load a JSON array of passages (`content`/`page_content` plus `metadata`).
pub fn load_corpus(path: &Path) -> Result<Vec<Passage>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid corpus JSON: {}", path.display()))
}

fn load_history(path: &Path) -> Result<Vec<ChatMessage>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid history JSON: {}", path.display()))
}

/// Answer one question against a corpus file. Returns whether the answer succeeded.
pub async fn run_ask(config: &Config, opts: AskOptions<'_>) -> Result<bool> {
    let passages = load_corpus(opts.corpus)?;
    tracing::info!(passages = passages.len(), "corpus loaded");
    let store: Arc<dyn Search> = Arc::new(InMemoryPassageStore::with_passages(passages));
    let cache: Arc<dyn CacheBackend> =
        Arc::new(InMemoryCacheBackend::new(config.cache.max_entries_per_tier));

    let history = Arc::new(InMemoryHistory::new());
    let conversation = opts.conversation.unwrap_or("cli");
    if let Some(path) = opts.history {
        for message in load_history(path)? {
            history.append(conversation, message)?;
        }
    }
    let history_reader: Arc<dyn ConversationHistory> = history;

    let pipeline = Pipeline::from_config(config, store, Some(cache), Some(history_reader))?;
    let answer = pipeline
        .answer(opts.question, &opts.clearance, Some(conversation), opts.stream)
        .await;

    if opts.json {
        print_json(answer).await
    } else {
        print_text(answer).await
    }
}

async fn print_text(answer: Answer) -> Result<bool> {
    let mut success = answer.success;
    let mut stdout = std::io::stdout();
    match answer.body {
        AnswerBody::Text(text) => println!("{}", text),
        AnswerBody::Stream(mut tokens) => {
            while let Some(token) = tokens.next().await {
                match token {
                    Ok(token) => {
                        write!(stdout, "{}", token)?;
                        stdout.flush()?;
                    }
                    Err(e) => {
                        println!();
                        eprintln!("error: {}", e);
                        success = false;
                        break;
                    }
                }
            }
            println!();
        }
    }

    if let Some(partial) = &answer.partial_context {
        if !partial.clearance_blocked.is_empty() {
            println!("\nNot answered (clearance): {}", partial.clearance_blocked.join("; "));
        }
        if !partial.unsatisfied.is_empty() {
            println!("Not answered (no data): {}", partial.unsatisfied.join("; "));
        }
    }

    if !answer.sources.is_empty() {
        println!("\nSources:");
        for (i, s) in answer.sources.iter().enumerate() {
            let score = s.score.map(|v| format!(" ({:.2})", v)).unwrap_or_default();
            println!("  [{}] {}{}", i + 1, s.document, score);
        }
    }
    if let Some(provider) = &answer.provider {
        let mut notes = Vec::new();
        if answer.used_fallback {
            notes.push("fallback");
        }
        if answer.from_cache {
            notes.push("cached");
        }
        if notes.is_empty() {
            eprintln!("provider: {}", provider);
        } else {
            eprintln!("provider: {} ({})", provider, notes.join(", "));
        }
    }
    Ok(success)
}

async fn print_json(answer: Answer) -> Result<bool> {
    let (text, stream_error) = match answer.body.collect_text().await {
        Ok(text) => (text, None),
        Err(e) => (String::new(), Some(e.to_string())),
    };
    let success = answer.success && stream_error.is_none();
    let out = json!({
        "request_id": answer.request_id,
        "success": success,
        "error": answer.error.map(|e| e.to_string()).or(stream_error),
        "answer": text,
        "sources": answer.sources,
        "partial_context": answer.partial_context,
        "blocked_departments": answer.blocked_departments,
        "provider": answer.provider,
        "used_fallback": answer.used_fallback,
        "from_cache": answer.from_cache,
        "strategy": answer.strategy,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(success)
}

/// Parse a security level given as a name or ordinal.
pub fn parse_level(raw: &str) -> Result<SecurityLevel, String> {
    SecurityLevel::parse(raw).ok_or_else(|| {
        format!(
            "invalid security level '{}': expected 1-4 or GENERAL, RESTRICTED, CONFIDENTIAL, HIGHLY_CONFIDENTIAL",
            raw
        )
    })
}
