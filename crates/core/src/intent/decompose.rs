//! Rule-based multi-intent decomposition.
//!
//! "delete unit X, then generate unit Y" splits on the sequencing connector
//! into two clauses. The split is accepted only when every clause opens with
//! a recognised action verb; otherwise the caller falls back to single-intent
//! classification.

use regex::Regex;
use std::sync::OnceLock;

use super::classifier::ClassifierVocabulary;
use super::{number, Intent, IntentKind};

fn connector_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\s*;\s*(?:and\s+then,?\s+|after\s+that,?\s+|afterwards,?\s+|then,?\s+|next,\s*)?|,?\s+and\s+then\s+|,?\s+after\s+that,?\s+|,?\s+afterwards,?\s+|,?\s+then\s+|,\s*next,\s*",
        )
        .expect("static connector pattern is valid")
    })
}

fn target_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"@([\p{L}\p{N}_\-]+)").expect("static pattern is valid"),
            Regex::new(r#""([^"]+)"|“([^”]+)”"#).expect("static pattern is valid"),
            Regex::new(r"(?i)\b(?:unit|section|chapter|phase)\s+([\p{L}\p{N}_\-]+)")
                .expect("static pattern is valid"),
        ]
    })
}

/// Words that may precede the action verb without changing the clause
const FILLERS: &[&str] = &["please", "also", "and", "now", "finally", "first", "then", "kindly"];

/// Split `utterance` into ordered intents, or `None` when it is not a
/// sequence of at least two actionable clauses.
pub fn decompose(utterance: &str, vocabulary: &ClassifierVocabulary) -> Option<Vec<Intent>> {
    let clauses: Vec<&str> = connector_pattern()
        .split(utterance.trim())
        .map(|c| c.trim_matches(|ch: char| ch.is_whitespace() || matches!(ch, '.' | ',' | '!')))
        .filter(|c| !c.is_empty())
        .collect();

    if clauses.len() < 2 {
        return None;
    }

    let mut intents = Vec::with_capacity(clauses.len());
    for clause in clauses {
        let kind = leading_action(clause, vocabulary)?;
        let mut intent = Intent::new(kind).with_operation(clause);
        if let Some(target) = clause_target(clause) {
            intent = intent.with_target(target);
        }
        intents.push(intent);
    }

    tracing::debug!(count = intents.len(), "Utterance decomposed");
    Some(number(intents))
}

/// Kind implied by the clause's first non-filler word
fn leading_action(clause: &str, vocabulary: &ClassifierVocabulary) -> Option<IntentKind> {
    clause
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .find(|w| !w.is_empty() && !FILLERS.contains(&w.as_str()))
        .and_then(|w| vocabulary.action_kind(&w))
}

fn clause_target(clause: &str) -> Option<String> {
    target_patterns().iter().find_map(|re| {
        re.captures(clause).and_then(|caps| {
            caps.iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().trim().to_string())
        })
    })
}
