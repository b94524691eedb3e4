//! # Unit References
//!
//! Extracts explicit content-unit references from an utterance and decides
//! which one a modification is aimed at.

use regex::Regex;
use std::sync::OnceLock;

/// One referenced unit name and where it appears in the utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceMention {
    pub name: String,
    /// Byte offset of the mention, `None` when only supplied out of band
    pub offset: Option<usize>,
}

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"@([\p{L}\p{N}_\-]+)").expect("static mention pattern is valid")
    })
}

/// Collect `@Name` mentions plus request-supplied references.
///
/// Textual mentions come first in utterance order; request references that
/// never appear in the text follow, in request order. Names are deduplicated
/// case-insensitively, keeping the earliest occurrence.
pub fn extract_mentions(utterance: &str, request_refs: &[String]) -> Vec<ReferenceMention> {
    let mut mentions: Vec<ReferenceMention> = Vec::new();
    let seen = |mentions: &[ReferenceMention], name: &str| {
        mentions.iter().any(|m| m.name.eq_ignore_ascii_case(name))
    };

    for caps in mention_pattern().captures_iter(utterance) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str().trim_end_matches('-');
        if !seen(mentions.as_slice(), name) {
            mentions.push(ReferenceMention {
                name: name.to_string(),
                offset: Some(whole.start()),
            });
        }
    }

    let mut unplaced = Vec::new();
    for reference in request_refs {
        let name = reference.trim().trim_start_matches('@');
        if name.is_empty() || seen(mentions.as_slice(), name) || seen(unplaced.as_slice(), name) {
            continue;
        }
        let mention = ReferenceMention {
            name: name.to_string(),
            offset: find_bare(utterance, name),
        };
        if mention.offset.is_some() {
            mentions.push(mention);
        } else {
            unplaced.push(mention);
        }
    }

    mentions.sort_by_key(|m| m.offset);
    mentions.extend(unplaced);
    mentions
}

/// Case-insensitive whole-word search for a bare unit name
fn find_bare(utterance: &str, name: &str) -> Option<usize> {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(name));
    Regex::new(&pattern)
        .ok()
        .and_then(|re| re.find(utterance))
        .map(|m| m.start())
}

/// Case-insensitive whole-word alternation over `words`, `None` when empty
pub(crate) fn word_pattern<I, S>(words: I) -> Option<Regex>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let alternatives: Vec<String> = words
        .into_iter()
        .map(|w| regex::escape(w.as_ref().trim()))
        .filter(|w| !w.is_empty())
        .collect();

    if alternatives.is_empty() {
        return None;
    }
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).ok()
}

/// Decides which of several referenced units an utterance targets
pub trait TargetStrategy: Send + Sync {
    /// Index into `mentions` of the target, `None` only when `mentions` is empty
    fn select_target(&self, utterance: &str, mentions: &[ReferenceMention]) -> Option<usize>;
}

/// Picks the reference that follows a modification verb most closely.
///
/// Without any verb-then-reference pair the last reference wins, matching
/// the object position of most imperative sentences.
#[derive(Debug, Clone)]
pub struct KeywordProximity {
    verbs: Option<Regex>,
}

impl KeywordProximity {
    pub fn new<I, S>(verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            verbs: word_pattern(verbs),
        }
    }
}

impl TargetStrategy for KeywordProximity {
    fn select_target(&self, utterance: &str, mentions: &[ReferenceMention]) -> Option<usize> {
        if mentions.is_empty() {
            return None;
        }

        let mut best: Option<(usize, usize)> = None;
        if let Some(verbs) = &self.verbs {
            for verb in verbs.find_iter(utterance) {
                let nearest = mentions
                    .iter()
                    .enumerate()
                    .filter_map(|(i, m)| m.offset.filter(|&o| o >= verb.end()).map(|o| (o - verb.end(), i)))
                    .min();
                if let Some(candidate) = nearest {
                    if best.map_or(true, |b| candidate.0 < b.0) {
                        best = Some(candidate);
                    }
                }
            }
        }

        best.map(|(_, i)| i).or(Some(mentions.len() - 1))
    }
}
