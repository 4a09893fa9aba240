//! # secure-rag core
//!
//! Runtime-free logic for the security-aware retrieval pipeline: data
//! models, the security classifier, query normalization, merge and
//! partial-context classification, prompt building, source extraction,
//! capability traits, and in-memory reference backends.
//!
//! This crate contains no tokio, HTTP, or filesystem dependencies. Async
//! orchestration, timeouts, providers, and encryption live in the
//! `secure-rag` app crate.

pub mod embedding;
pub mod merge;
pub mod models;
pub mod prompt;
pub mod query;
pub mod security;
pub mod sources;
pub mod store;
