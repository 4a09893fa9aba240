//! Security classifier.
//!
//! Pure functions deciding whether a requester's [`Clearance`] grants access
//! to a [`Passage`] or to a cached entry described by a [`SecurityScope`].
//!
//! # Rules
//!
//! 1. A passage whose level is unclassified or unrecognized is skipped.
//! 2. `clearance.org_level < level` denies.
//! 3. Department-only passages additionally require a department level
//!    present and `>= level`, and a matching department id.
//! 4. Everything else is allowed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::{max_security_level, Clearance, Passage, PassageMetadata, SecurityLevel, SecurityTag};

/// Outcome of checking one passage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// Denied; carries the blocking department when the denial was departmental.
    Deny { department: Option<String> },
    /// Security level could not be resolved; the passage is excluded.
    Skip { raw_level: Option<String> },
}

/// Classify a passage's metadata against a clearance.
pub fn check_access(meta: &PassageMetadata, clearance: &Clearance) -> AccessDecision {
    let level = match &meta.security {
        SecurityTag::Level(level) => *level,
        SecurityTag::Unclassified => return AccessDecision::Skip { raw_level: None },
        SecurityTag::Unrecognized(raw) => {
            return AccessDecision::Skip {
                raw_level: Some(raw.clone()),
            }
        }
    };

    if clearance.org_level < level {
        return AccessDecision::Deny { department: None };
    }

    if meta.is_department_only {
        let dept_ok = match clearance.department_level {
            Some(dept_level) => {
                dept_level >= level
                    && clearance.department_id.is_some()
                    && clearance.department_id == meta.department_id
            }
            None => false,
        };
        if !dept_ok {
            return AccessDecision::Deny {
                department: meta.department_label(),
            };
        }
    }

    AccessDecision::Allow
}

/// `Allow(passage, clearance) -> (bool, blockedDepartmentName)`.
pub fn allow(passage: &Passage, clearance: &Clearance) -> (bool, Option<String>) {
    match check_access(&passage.metadata, clearance) {
        AccessDecision::Allow => (true, None),
        AccessDecision::Deny { department } => (false, department),
        AccessDecision::Skip { .. } => (false, None),
    }
}

/// Result of filtering a passage list.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    /// Allowed passages, in input order.
    pub accessible: Vec<Passage>,
    /// Department names that caused at least one denial.
    pub blocked_departments: BTreeSet<String>,
    /// Number of passages denied by clearance.
    pub denied: usize,
    /// `(dedup key, raw level)` of passages skipped for an unresolvable level.
    pub skipped: Vec<(String, Option<String>)>,
}

/// Apply the classifier to every passage, preserving order.
pub fn filter_passages(passages: Vec<Passage>, clearance: &Clearance) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    for passage in passages {
        match check_access(&passage.metadata, clearance) {
            AccessDecision::Allow => outcome.accessible.push(passage),
            AccessDecision::Deny { department } => {
                outcome.denied += 1;
                if let Some(d) = department {
                    outcome.blocked_departments.insert(d);
                }
            }
            AccessDecision::Skip { raw_level } => {
                outcome.skipped.push((passage.dedup_key(), raw_level));
            }
        }
    }
    outcome
}

/// Security metadata stored alongside a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityScope {
    /// Minimum level a requester needs to read the entry.
    pub min_security_level: SecurityLevel,
    pub is_departmental: bool,
    pub department_ids: Vec<i64>,
}

impl SecurityScope {
    /// Scope readable by every clearance.
    pub fn public() -> Self {
        Self {
            min_security_level: SecurityLevel::General,
            is_departmental: false,
            department_ids: Vec::new(),
        }
    }

    /// Derive the scope covering a set of passages.
    pub fn of(passages: &[Passage]) -> Self {
        let mut department_ids: Vec<i64> = passages
            .iter()
            .filter(|p| p.metadata.is_department_only)
            .filter_map(|p| p.metadata.department_id)
            .collect();
        department_ids.sort_unstable();
        department_ids.dedup();
        Self {
            min_security_level: max_security_level(passages).unwrap_or(SecurityLevel::General),
            is_departmental: passages.iter().any(|p| p.metadata.is_department_only),
            department_ids,
        }
    }

    /// Whether `clearance` may read an entry with this scope.
    ///
    /// A departmental entry is readable only by a member of every department
    /// it draws from, which in practice means entries spanning several
    /// departments are never shared.
    pub fn allows(&self, clearance: &Clearance) -> bool {
        if clearance.org_level < self.min_security_level {
            return false;
        }
        if !self.is_departmental {
            return true;
        }
        let Some(dept_level) = clearance.department_level else {
            return false;
        };
        if dept_level < self.min_security_level {
            return false;
        }
        match clearance.department_id {
            Some(id) => !self.department_ids.is_empty() && self.department_ids.iter().all(|d| *d == id),
            None => false,
        }
    }
}
