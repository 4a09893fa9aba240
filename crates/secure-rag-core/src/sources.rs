//! Source attribution for answers.

use serde::{Deserialize, Serialize};

use crate::models::{Passage, SecurityLevel};

/// A citation returned to the caller alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Human-readable document label.
    pub document: String,
    /// Relevance score clamped to `[0.0, 1.0]`.
    pub score: Option<f64>,
    pub chunk_index: Option<i64>,
    pub security_level: Option<SecurityLevel>,
}

/// Pick a label: `title` > `source` > `document_id` > `path` > `"Document"`.
pub fn document_label(passage: &Passage) -> String {
    let m = &passage.metadata;
    [&m.title, &m.source, &m.document_id, &m.path]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| "Document".to_string())
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

pub fn extract_sources(passages: &[Passage]) -> Vec<Source> {
    passages
        .iter()
        .map(|p| Source {
            document: document_label(p),
            score: p.metadata.score.map(clamp_score),
            chunk_index: p.metadata.chunk_index,
            security_level: p.security_level(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn passage(meta: Value) -> Passage {
        Passage::new("x", meta.as_object().cloned().unwrap())
    }

    #[test]
    fn test_label_precedence() {
        assert_eq!(
            document_label(&passage(json!({"title": "T", "source": "S", "path": "/p"}))),
            "T"
        );
        assert_eq!(document_label(&passage(json!({"source": "S", "path": "/p"}))), "S");
        assert_eq!(
            document_label(&passage(json!({"document_id": "D", "path": "/p"}))),
            "D"
        );
        assert_eq!(document_label(&passage(json!({"path": "/p"}))), "/p");
        assert_eq!(document_label(&passage(json!({}))), "Document");
    }

    #[test]
    fn test_scores_are_clamped() {
        let sources = extract_sources(&[
            passage(json!({"score": 1.7, "security_level": 2, "chunk_index": 4})),
            passage(json!({"score": -0.3})),
            passage(json!({})),
        ]);
        assert_eq!(sources[0].score, Some(1.0));
        assert_eq!(sources[0].chunk_index, Some(4));
        assert_eq!(sources[0].security_level, Some(SecurityLevel::Restricted));
        assert_eq!(sources[1].score, Some(0.0));
        assert_eq!(sources[2].score, None);
    }
}
