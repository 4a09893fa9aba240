//! # Secure RAG
//!
//! A security-aware retrieval-augmented generation pipeline. Questions are
//! planned into search queries, passages are retrieved and filtered against
//! the requester's clearance, answers are generated by an LLM chosen by the
//! sensitivity of the content, and results are cached in an encrypted
//! two-tier semantic cache that never serves an entry to someone who could
//! not have seen its sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────┐   ┌────────────┐
//! │ Planner  │──▶│  Retrieval   │──▶│   Router   │──▶│  Answer    │
//! │ (decomp) │   │ (+classifier)│   │ (+fallback)│   │ (stream)   │
//! └──────────┘   └──────┬───────┘   └────────────┘   └─────┬──────┘
//!                       │                                  │
//!                       ▼                                  ▼
//!                ┌─────────────────────────────────────────────┐
//!                │     Semantic cache (context / response)     │
//!                └─────────────────────────────────────────────┘
//! ```
//!
//! Runtime-free logic (data model, classifier, merge, prompts, capability
//! traits) lives in the `secure-rag-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed request-path errors |
//! | [`telemetry`] | Logging setup |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | LLM providers |
//! | [`planner`] | Query planning and LLM decomposition |
//! | [`retrieval`] | Multi-query retrieval coordination |
//! | [`rerank`] | Embedding reranker |
//! | [`crypto`] | Cache payload encryption |
//! | [`cache`] | Two-tier semantic cache |
//! | [`router`] | Model selection and fallback |
//! | [`history`] | Conversation history |
//! | [`pipeline`] | End-to-end answering |
//! | [`commands`] | `srag` command implementations |

pub mod cache;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod embedding;
pub mod error;
pub mod history;
pub mod llm;
pub mod pipeline;
pub mod planner;
pub mod rerank;
pub mod retrieval;
pub mod router;
pub mod telemetry;
