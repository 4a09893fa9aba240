//! Core data models used throughout secure-rag.
//!
//! These types represent the passages, clearances, and retrieval outcomes
//! that flow through the retrieval-and-generation pipeline. Passages are
//! created by the search capability for a single request and are only ever
//! filtered or reordered afterwards, never mutated in place.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Number of leading characters hashed when a passage carries no `chunk_id`.
const FINGERPRINT_CHARS: usize = 256;

/// Ordinal security classification shared by passages, clearances, and cache entries.
///
/// Ordering follows the ordinal: `General < Restricted < Confidential < HighlyConfidential`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    General = 1,
    Restricted = 2,
    Confidential = 3,
    HighlyConfidential = 4,
}

impl SecurityLevel {
    /// The ordinal value, `1..=4`.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Convert an ordinal into a level. Returns `None` outside `1..=4`.
    pub fn from_ordinal(n: i64) -> Option<Self> {
        match n {
            1 => Some(Self::General),
            2 => Some(Self::Restricted),
            3 => Some(Self::Confidential),
            4 => Some(Self::HighlyConfidential),
            _ => None,
        }
    }

    /// Parse a level from its name or ordinal.
    ///
    /// Accepts `"GENERAL"`, `"restricted"`, `"highly confidential"`,
    /// `"HIGHLY_CONFIDENTIAL"`, `"Highly-Confidential"`, and `"1"`..`"4"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let norm: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match norm.as_str() {
            "GENERAL" => Some(Self::General),
            "RESTRICTED" => Some(Self::Restricted),
            "CONFIDENTIAL" => Some(Self::Confidential),
            "HIGHLY_CONFIDENTIAL" => Some(Self::HighlyConfidential),
            other => other.parse::<i64>().ok().and_then(Self::from_ordinal),
        }
    }

    /// Canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "GENERAL",
            Self::Restricted => "RESTRICTED",
            Self::Confidential => "CONFIDENTIAL",
            Self::HighlyConfidential => "HIGHLY_CONFIDENTIAL",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security classification as resolved from passage metadata.
///
/// Only [`SecurityTag::Level`] can ever be allowed through the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityTag {
    Level(SecurityLevel),
    /// No `security_level` key was present.
    Unclassified,
    /// A `security_level` value was present but not recognized.
    Unrecognized(String),
}

impl SecurityTag {
    pub fn level(&self) -> Option<SecurityLevel> {
        match self {
            SecurityTag::Level(level) => Some(*level),
            _ => None,
        }
    }

    fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => SecurityTag::Unclassified,
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(SecurityLevel::from_ordinal)
                .map(SecurityTag::Level)
                .unwrap_or_else(|| SecurityTag::Unrecognized(n.to_string())),
            Some(Value::String(s)) => SecurityLevel::parse(s)
                .map(SecurityTag::Level)
                .unwrap_or_else(|| SecurityTag::Unrecognized(s.clone())),
            Some(other) => SecurityTag::Unrecognized(other.to_string()),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            SecurityTag::Level(level) => Value::from(level.ordinal()),
            SecurityTag::Unclassified => Value::Null,
            SecurityTag::Unrecognized(raw) => Value::String(raw.clone()),
        }
    }
}

/// Typed passage metadata.
///
/// Built from the loosely-typed metadata map a search backend returns via
/// [`PassageMetadata::from_map`]. Keys without a typed field are kept in
/// [`extra`](PassageMetadata::extra).
#[derive(Debug, Clone, PartialEq)]
pub struct PassageMetadata {
    pub chunk_id: Option<String>,
    pub security: SecurityTag,
    pub is_department_only: bool,
    pub department_id: Option<i64>,
    pub department_name: Option<String>,
    pub title: Option<String>,
    pub source: Option<String>,
    pub document_id: Option<String>,
    pub path: Option<String>,
    pub chunk_index: Option<i64>,
    pub score: Option<f64>,
    pub extra: Map<String, Value>,
}

impl Default for PassageMetadata {
    fn default() -> Self {
        Self {
            chunk_id: None,
            security: SecurityTag::Unclassified,
            is_department_only: false,
            department_id: None,
            department_name: None,
            title: None,
            source: None,
            document_id: None,
            path: None,
            chunk_index: None,
            score: None,
            extra: Map::new(),
        }
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn take_int(map: &mut Map<String, Value>, key: &str) -> Option<i64> {
    match map.remove(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn take_bool(map: &mut Map<String, Value>, key: &str) -> bool {
    match map.remove(key) {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

impl PassageMetadata {
    /// Parse a metadata map into typed fields.
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        let security = SecurityTag::from_value(map.get("security_level"));
        map.remove("security_level");
        let score = match map.remove("score") {
            Some(Value::Number(n)) => n.as_f64(),
            _ => None,
        };
        Self {
            chunk_id: take_string(&mut map, "chunk_id"),
            security,
            is_department_only: take_bool(&mut map, "is_department_only"),
            department_id: take_int(&mut map, "department_id"),
            department_name: take_string(&mut map, "department_name"),
            title: take_string(&mut map, "title"),
            source: take_string(&mut map, "source"),
            document_id: take_string(&mut map, "document_id"),
            path: take_string(&mut map, "path"),
            chunk_index: take_int(&mut map, "chunk_index"),
            score,
            extra: map,
        }
    }

    /// Convert back into a flat metadata map.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = self.extra.clone();
        map.insert("security_level".into(), self.security.to_value());
        map.insert("is_department_only".into(), Value::Bool(self.is_department_only));
        let optional: [(&str, Option<Value>); 9] = [
            ("chunk_id", self.chunk_id.clone().map(Value::from)),
            ("department_id", self.department_id.map(Value::from)),
            ("department_name", self.department_name.clone().map(Value::from)),
            ("title", self.title.clone().map(Value::from)),
            ("source", self.source.clone().map(Value::from)),
            ("document_id", self.document_id.clone().map(Value::from)),
            ("path", self.path.clone().map(Value::from)),
            ("chunk_index", self.chunk_index.map(Value::from)),
            ("score", self.score.map(Value::from)),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                map.insert(key.to_string(), v);
            }
        }
        map
    }

    /// Human-readable name of the owning department, if any.
    pub fn department_label(&self) -> Option<String> {
        self.department_name
            .clone()
            .or_else(|| self.department_id.map(|id| format!("department {}", id)))
    }
}

/// A retrieved unit of context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPassage", into = "RawPassage")]
pub struct Passage {
    pub content: String,
    pub metadata: PassageMetadata,
}

/// Wire shape of a passage: content plus a flat metadata map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPassage {
    #[serde(alias = "page_content")]
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl From<RawPassage> for Passage {
    fn from(raw: RawPassage) -> Self {
        Passage::new(raw.content, raw.metadata)
    }
}

impl From<Passage> for RawPassage {
    fn from(p: Passage) -> Self {
        RawPassage {
            metadata: p.metadata.to_map(),
            content: p.content,
        }
    }
}

impl Passage {
    pub fn new(content: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            content: content.into(),
            metadata: PassageMetadata::from_map(metadata),
        }
    }

    /// Resolved security level, `None` when unclassified or unrecognized.
    pub fn security_level(&self) -> Option<SecurityLevel> {
        self.metadata.security.level()
    }

    /// Identity used for deduplication.
    ///
    /// The `chunk_id` when present, otherwise a SHA-256 fingerprint of the
    /// first characters of the content.
    pub fn dedup_key(&self) -> String {
        match &self.metadata.chunk_id {
            Some(id) => id.clone(),
            None => {
                let head: String = self.content.chars().take(FINGERPRINT_CHARS).collect();
                format!("content:{:x}", Sha256::digest(head.as_bytes()))
            }
        }
    }
}

/// Highest resolved security level among the passages.
pub fn max_security_level(passages: &[Passage]) -> Option<SecurityLevel> {
    passages.iter().filter_map(Passage::security_level).max()
}

/// A requester's access rights, supplied once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clearance {
    pub org_level: SecurityLevel,
    pub department_id: Option<i64>,
    pub department_level: Option<SecurityLevel>,
}

impl Clearance {
    /// Organization-wide clearance without department membership.
    pub fn new(org_level: SecurityLevel) -> Self {
        Self {
            org_level,
            department_id: None,
            department_level: None,
        }
    }

    pub fn with_department(mut self, department_id: i64, level: SecurityLevel) -> Self {
        self.department_id = Some(department_id);
        self.department_level = Some(level);
        self
    }
}

/// How a question was turned into search queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    /// Deterministic normalization only.
    Preprocessed,
    /// The decomposer split the question into several sub-queries.
    Decomposed,
    /// The decomposer rewrote the question into a single query.
    LlmOptimized,
}

/// Output of the query planner. `primary` is always `all[0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub primary: String,
    pub all: Vec<String>,
    pub strategy: PlanStrategy,
}

impl QueryPlan {
    /// Build a plan from a non-empty list of queries.
    ///
    /// Returns `None` if `queries` is empty.
    pub fn new(queries: Vec<String>, strategy: PlanStrategy) -> Option<Self> {
        let primary = queries.first()?.clone();
        Some(Self {
            primary,
            all: queries,
            strategy,
        })
    }
}

/// Classification of decomposed sub-queries.
///
/// Every sub-query belongs to exactly one list. Lists keep sub-query order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialContext {
    pub satisfied: Vec<String>,
    pub clearance_blocked: Vec<String>,
    pub unsatisfied: Vec<String>,
}

/// Which kind of gap a [`PartialContext`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialKind {
    Complete,
    ClearanceBlocked,
    Unsatisfied,
    Mixed,
}

impl PartialContext {
    pub fn is_complete(&self) -> bool {
        self.clearance_blocked.is_empty() && self.unsatisfied.is_empty()
    }

    pub fn kind(&self) -> PartialKind {
        match (self.clearance_blocked.is_empty(), self.unsatisfied.is_empty()) {
            (true, true) => PartialKind::Complete,
            (false, true) => PartialKind::ClearanceBlocked,
            (true, false) => PartialKind::Unsatisfied,
            (false, false) => PartialKind::Mixed,
        }
    }

    /// All classified sub-queries.
    pub fn all_queries(&self) -> HashSet<&str> {
        self.satisfied
            .iter()
            .chain(&self.clearance_blocked)
            .chain(&self.unsatisfied)
            .map(String::as_str)
            .collect()
    }
}

/// Why a retrieval produced no usable passages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalFailure {
    NoDocuments,
    InsufficientClearance,
    NoClearance,
    RetrievalError,
}

impl fmt::Display for RetrievalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoDocuments => "no_documents",
            Self::InsufficientClearance => "insufficient_clearance",
            Self::NoClearance => "no_clearance",
            Self::RetrievalError => "retrieval_error",
        })
    }
}

/// Outcome of one coordinated retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub success: bool,
    pub passages: Vec<Passage>,
    pub max_security_level: Option<SecurityLevel>,
    pub error: Option<RetrievalFailure>,
    /// Department names that caused denials, sorted.
    pub blocked_departments: Vec<String>,
    pub partial_context: Option<PartialContext>,
}

impl RetrievalResult {
    pub fn found(passages: Vec<Passage>, partial_context: Option<PartialContext>) -> Self {
        Self {
            success: true,
            max_security_level: max_security_level(&passages),
            passages,
            error: None,
            blocked_departments: Vec::new(),
            partial_context,
        }
    }

    pub fn failed(error: RetrievalFailure) -> Self {
        Self {
            success: false,
            passages: Vec::new(),
            max_security_level: None,
            error: Some(error),
            blocked_departments: Vec::new(),
            partial_context: None,
        }
    }

    pub fn with_blocked_departments(mut self, departments: Vec<String>) -> Self {
        self.blocked_departments = departments;
        self
    }

    pub fn with_partial_context(mut self, partial: PartialContext) -> Self {
        self.partial_context = Some(partial);
        self
    }
}
