//! # Intent Classifier
//!
//! Turns an utterance plus session context into an ordered intent list.
//!
//! Precedence (first match wins for the kind):
//! 1. explicit unit references: `query` on explanation verbs or on a
//!    question without a rewrite verb, else `modify`
//! 2. an unanswered scripted question in an open phase: `phase_continue`
//!    (unless the utterance is itself a question)
//! 3. the LLM, with the unit graph as context
//!
//! References are resolved first: an unknown unit name turns the whole
//! utterance into one explanatory `chat` intent. Rule-based decomposition
//! runs next, before the chain. Classification never fails: every problem
//! degrades to a single `chat` intent.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::decompose::decompose;
use super::references::{extract_mentions, word_pattern, KeywordProximity, ReferenceMention, TargetStrategy};
use super::{number, Intent, IntentKind};
use crate::error::CoreError;
use crate::llm::{decode_structured, or_fallback, CompletionRequest, LlmClient, Message};
use crate::session::{SessionSnapshot, Speaker};

const CLASSIFIER_PROMPT: &str = r#"You route user messages in a content-production studio.
Return ONLY a JSON object: {"intents": [{"kind": "...", "target": "...", "operation": "..."}]}
List the actions in the order they must run. "target" is a unit name (or a phase name for advance_phase) or null.
Kinds:
- chat: conversation, no content change
- query: explain or inspect existing content
- modify: rewrite existing content
- generate: produce new content for a unit (or all units when target is null)
- edit: add, remove or move a unit
- phase_continue: answer the current phase's questions
- advance_phase: move to the next (or named) phase
- research: look something up on the web
- persona: manage audience personas
- evaluate: role-play an evaluation of the content
- skill: apply a writing skill"#;

/// Word lists that drive the rule-based parts of classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierVocabulary {
    /// Verbs that mark a rewrite; also the anchor words for target selection
    pub modify_verbs: Vec<String>,
    /// Understanding/explanation verbs that turn a reference into a query
    pub query_verbs: Vec<String>,
    pub generate_verbs: Vec<String>,
    /// Structural edits (add/remove/move)
    pub edit_verbs: Vec<String>,
    /// Leading words that make an utterance a question
    pub interrogatives: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl Default for ClassifierVocabulary {
    fn default() -> Self {
        Self {
            modify_verbs: words(&[
                "rewrite", "revise", "modify", "change", "update", "edit", "improve", "shorten",
                "expand", "polish", "fix", "rephrase", "tighten", "simplify", "refine",
            ]),
            query_verbs: words(&[
                "explain", "summarize", "summarise", "describe", "analyze", "analyse",
                "understand", "clarify", "compare", "mean",
            ]),
            generate_verbs: words(&["generate", "write", "draft", "create", "produce", "compose"]),
            edit_verbs: words(&["delete", "remove", "add", "insert", "move", "rename", "reorder"]),
            interrogatives: words(&[
                "what", "why", "how", "when", "where", "who", "which", "can", "could", "would",
                "should", "is", "are", "do", "does", "did", "will",
            ]),
        }
    }
}

impl ClassifierVocabulary {
    /// Kind implied by a leading action verb, if it is one
    pub fn action_kind(&self, word: &str) -> Option<IntentKind> {
        let word = word.trim().to_lowercase();
        let has = |list: &[String]| list.iter().any(|w| w.eq_ignore_ascii_case(&word));

        if has(&self.edit_verbs) {
            return Some(IntentKind::Edit);
        }
        if has(&self.generate_verbs) {
            return Some(IntentKind::Generate);
        }
        if has(&self.modify_verbs) {
            return Some(IntentKind::Modify);
        }
        if has(&self.query_verbs) {
            return Some(IntentKind::Query);
        }
        match word.as_str() {
            "research" | "search" | "lookup" => Some(IntentKind::Research),
            "evaluate" | "review" | "simulate" => Some(IntentKind::Evaluate),
            "advance" | "proceed" => Some(IntentKind::AdvancePhase),
            "continue" => Some(IntentKind::PhaseContinue),
            _ => None,
        }
    }

    /// Whether the utterance reads as a question
    pub fn is_interrogative(&self, utterance: &str) -> bool {
        let trimmed = utterance.trim();
        if trimmed.ends_with('?') {
            return true;
        }
        trimmed
            .split_whitespace()
            .next()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .is_some_and(|first| self.interrogatives.iter().any(|i| i.eq_ignore_ascii_case(first)))
    }
}

/// The shapes a model may answer with
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntentEnvelope {
    Wrapped { intents: Vec<RawIntent> },
    List(Vec<RawIntent>),
    Single(RawIntent),
}

impl Default for IntentEnvelope {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl IntentEnvelope {
    fn into_raw(self) -> Vec<RawIntent> {
        match self {
            Self::Wrapped { intents } | Self::List(intents) => intents,
            Self::Single(intent) => vec![intent],
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    kind: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    operation: Option<String>,
}

pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
    vocabulary: ClassifierVocabulary,
    strategy: Arc<dyn TargetStrategy>,
    query_verbs: Option<Regex>,
    modify_verbs: Option<Regex>,
    timeout: Duration,
}

impl IntentClassifier {
    /// Classifier with the default [`KeywordProximity`] target strategy
    pub fn new(llm: Arc<dyn LlmClient>, vocabulary: ClassifierVocabulary) -> Self {
        let strategy = Arc::new(KeywordProximity::new(&vocabulary.modify_verbs));
        Self {
            llm,
            query_verbs: word_pattern(&vocabulary.query_verbs),
            modify_verbs: word_pattern(&vocabulary.modify_verbs),
            vocabulary,
            strategy,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn TargetStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn vocabulary(&self) -> &ClassifierVocabulary {
        &self.vocabulary
    }

    /// Classify one utterance. The first intent is the active one; the rest
    /// form the pending queue. Never empty.
    #[tracing::instrument(skip_all, fields(project_id = %session.project_id()))]
    pub async fn classify(
        &self,
        utterance: &str,
        references: &[String],
        session: &SessionSnapshot,
    ) -> Vec<Intent> {
        let mentions = extract_mentions(utterance, references);
        let unknown: Vec<String> = mentions
            .iter()
            .filter(|m| session.units.by_name(&m.name).is_none())
            .map(|m| m.name.clone())
            .collect();
        if !unknown.is_empty() {
            let err = CoreError::ReferenceResolution {
                names: unknown.clone(),
            };
            tracing::warn!(error = %err, "Reference resolution failed, answering in chat");
            return vec![Intent::chat().with_operation(unknown_reference_note(&unknown, session))];
        }

        if let Some(intents) = decompose(utterance, &self.vocabulary) {
            return self.canonicalize(intents, session);
        }

        if !mentions.is_empty() {
            return vec![self.classify_referenced(utterance, &mentions, session)];
        }

        if session.phases.current_is_open()
            && session.pending_question().is_some()
            && !self.vocabulary.is_interrogative(utterance)
        {
            tracing::debug!(phase = ?session.current_phase(), "Answering scripted question");
            return vec![Intent::new(IntentKind::PhaseContinue).with_operation(utterance)];
        }

        self.classify_with_llm(utterance, session).await
    }

    fn classify_referenced(
        &self,
        utterance: &str,
        mentions: &[ReferenceMention],
        session: &SessionSnapshot,
    ) -> Intent {
        let matches = |re: &Option<Regex>| re.as_ref().is_some_and(|re| re.is_match(utterance));
        // a question about a unit reads it unless it asks for a rewrite
        let kind = if matches(&self.query_verbs)
            || (self.vocabulary.is_interrogative(utterance) && !matches(&self.modify_verbs))
        {
            IntentKind::Query
        } else {
            IntentKind::Modify
        };

        let index = self
            .strategy
            .select_target(utterance, mentions)
            .unwrap_or(mentions.len() - 1);
        let target = session
            .units
            .by_name(&mentions[index].name)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| mentions[index].name.clone());

        Intent::new(kind).with_target(target).with_operation(utterance)
    }

    async fn classify_with_llm(&self, utterance: &str, session: &SessionSnapshot) -> Vec<Intent> {
        let context = format!(
            "Current phase: {}\nContent units:\n{}",
            session.current_phase().unwrap_or("(all phases complete)"),
            session.units.summary()
        );

        let mut messages = vec![Message::system(CLASSIFIER_PROMPT), Message::system(context)];
        for entry in session.recent_transcript(6) {
            messages.push(match entry.speaker {
                Speaker::User => Message::user(&entry.content),
                Speaker::Assistant => Message::assistant(&entry.content),
            });
        }
        messages.push(Message::user(utterance));

        let request = CompletionRequest::new("classifier", messages);
        let completion = match tokio::time::timeout(self.timeout, self.llm.complete(&request)).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(e)) => return fallback(format!("classifier call failed: {:#}", e)),
            Err(_) => {
                return fallback(format!(
                    "classifier timed out after {}s",
                    self.timeout.as_secs()
                ))
            }
        };

        let raw = or_fallback(
            decode_structured::<IntentEnvelope>(&completion.payload()),
            "classifier",
            IntentEnvelope::default,
        )
        .into_raw();

        if raw.is_empty() {
            return fallback("model returned no usable intents".to_string());
        }

        let intents = raw
            .into_iter()
            .map(|r| {
                let mut intent = Intent::new(IntentKind::normalize(&r.kind));
                intent.target = r.target.map(|t| t.trim().to_string()).filter(|t| !t.is_empty() && t != "null");
                intent.operation = r.operation.filter(|o| !o.trim().is_empty());
                intent
            })
            .collect();

        self.canonicalize(intents, session)
    }

    /// Map targets onto existing unit names where they match and number the list
    fn canonicalize(&self, intents: Vec<Intent>, session: &SessionSnapshot) -> Vec<Intent> {
        let intents = intents
            .into_iter()
            .map(|mut intent| {
                if intent.kind != IntentKind::AdvancePhase {
                    if let Some(unit) = intent.target.as_deref().and_then(|t| session.units.by_name(t)) {
                        intent.target = Some(unit.name.clone());
                    }
                }
                intent
            })
            .collect();
        number(intents)
    }
}

fn fallback(reason: String) -> Vec<Intent> {
    let err = CoreError::ClassificationFallback { reason };
    tracing::warn!(error = %err, "Using default chat intent");
    vec![Intent::chat()]
}

fn unknown_reference_note(unknown: &[String], session: &SessionSnapshot) -> String {
    let known: Vec<&str> = session.units.units().iter().map(|u| u.name.as_str()).collect();
    let known = if known.is_empty() {
        "none yet".to_string()
    } else {
        known.join(", ")
    };
    format!(
        "The message references {} which does not exist in this project. Existing units: {}.",
        unknown.join(", "),
        known
    )
}
