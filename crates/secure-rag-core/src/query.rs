//! Deterministic query normalization.
//!
//! Used by the query planner when decomposition is disabled, unavailable,
//! or fails. Always produces exactly one query.

/// Conversational lead-ins stripped from the start of a question.
const LEAD_INS: &[&str] = &[
    "can you please tell me",
    "could you please tell me",
    "can you tell me",
    "could you tell me",
    "please tell me",
    "i would like to know",
    "i want to know",
    "i'd like to know",
    "do you know",
    "can you explain",
    "could you explain",
    "please explain",
    "please",
];

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "of", "to", "in", "on", "for",
    "and", "or", "with", "about", "what", "which", "who", "whom", "how", "do", "does", "did",
    "can", "could", "would", "should", "i", "me", "my", "we", "our", "you", "your", "it", "its",
    "this", "that", "these", "those", "there", "please", "tell",
];

/// Queries with at most this many words keep their stop words.
const MIN_WORDS_FOR_TRIMMING: usize = 4;

/// Normalize a raw question into a single search query.
///
/// Collapses whitespace, strips conversational lead-ins and trailing
/// punctuation, and removes stop words from longer questions. Falls back to
/// the whitespace-collapsed question when trimming would leave nothing.
pub fn normalize_query(question: &str) -> String {
    let collapsed = question.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return collapsed;
    }

    let mut text = collapsed.as_str();
    for lead in LEAD_INS {
        let Some(head) = text.get(..lead.len()) else {
            continue;
        };
        let rest = &text[lead.len()..];
        if head.eq_ignore_ascii_case(lead) && rest.starts_with(&[' ', ','][..]) {
            text = rest.trim_start_matches(&[' ', ','][..]);
            break;
        }
    }
    let text = text.trim_end_matches(&['?', '!', '.', ' '][..]);

    let words: Vec<&str> = text.split(' ').filter(|w| !w.is_empty()).collect();
    if words.is_empty() {
        return collapsed.clone();
    }
    if words.len() <= MIN_WORDS_FOR_TRIMMING {
        return words.join(" ");
    }

    let kept: Vec<&str> = words
        .iter()
        .copied()
        .filter(|w| {
            let bare = w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'');
            !STOP_WORDS.contains(&bare.to_lowercase().as_str())
        })
        .collect();

    if kept.is_empty() {
        words.join(" ")
    } else {
        kept.join(" ")
    }
}
