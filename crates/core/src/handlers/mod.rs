//! # Standard Handlers
//!
//! The handlers a studio ships with, one per intent kind:
//!
//! - `conversation` - chat and query answers
//! - `modify` - rewrite one unit, flag its dependents for review
//! - `generate` - batch-by-batch generation of a planned unit set
//! - `phase` - scripted phase conversation and phase advancement
//! - `tool` - research, persona, evaluation, skill and structural edits via the registry

pub mod conversation;
pub mod generate;
pub mod modify;
pub mod phase;
pub mod tool;

pub use conversation::ConversationHandler;
pub use generate::GenerateHandler;
pub use modify::ModifyHandler;
pub use phase::{AdvanceHandler, PhaseHandler};
pub use tool::ToolHandler;

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::dispatch::{DispatchTable, Handler, HandlerContext};
use crate::graph::ContentUnit;
use crate::intent::IntentKind;
use crate::llm::Message;
use crate::session::{SessionSnapshot, Speaker};

/// One entry per intent kind; chat is the default arm
pub fn standard_table() -> DispatchTable {
    let conversation: Arc<dyn Handler> = Arc::new(ConversationHandler);
    let tool: Arc<dyn Handler> = Arc::new(ToolHandler);

    let mut table = DispatchTable::new(conversation.clone())
        .with(IntentKind::Chat, conversation.clone())
        .with(IntentKind::Query, conversation)
        .with(IntentKind::Modify, Arc::new(ModifyHandler))
        .with(IntentKind::Generate, Arc::new(GenerateHandler))
        .with(IntentKind::PhaseContinue, Arc::new(PhaseHandler))
        .with(IntentKind::AdvancePhase, Arc::new(AdvanceHandler));

    for kind in IntentKind::ALL {
        if kind.tool_name().is_some() {
            table.insert(kind, tool.clone());
        }
    }
    table
}

/// Phase and unit summary handed to every model call
pub(crate) fn project_context(session: &SessionSnapshot) -> String {
    format!(
        "Phases: {}\nCurrent phase: {}\nContent units:\n{}",
        session.phases.phase_order().join(" -> "),
        session.current_phase().unwrap_or("(all phases complete)"),
        session.units.summary()
    )
}

/// Recent transcript as chat messages, without the turn's own user message
pub(crate) fn history(session: &SessionSnapshot, window: usize, current: &str) -> Vec<Message> {
    let mut entries = session.recent_transcript(window + 1);
    if let Some((last, rest)) = entries.split_last() {
        if last.speaker == Speaker::User && last.content == current {
            entries = rest;
        }
    }
    let start = entries.len().saturating_sub(window);
    entries[start..]
        .iter()
        .map(|e| match e.speaker {
            Speaker::User => Message::user(&e.content),
            Speaker::Assistant => Message::assistant(&e.content),
        })
        .collect()
}

/// Mark completed dependents of `unit` as needing review, skipping `skip`.
/// Returns the names flagged.
pub(crate) async fn flag_dependents(
    unit: &ContentUnit,
    session: &SessionSnapshot,
    ctx: &HandlerContext,
    skip: &BTreeSet<String>,
) -> Result<Vec<String>> {
    let mut flagged = Vec::new();
    for id in session.units.dependents_of(&unit.id) {
        if skip.contains(&id) {
            continue;
        }
        let Some(dependent) = session.units.get(&id) else {
            continue;
        };
        if dependent.is_completed() && !dependent.needs_review {
            let mut dependent = dependent.clone();
            dependent.needs_review = true;
            dependent.touch();
            ctx.commit(&dependent).await?;
            flagged.push(dependent.name);
        }
    }
    if !flagged.is_empty() {
        tracing::info!(unit = %unit.name, flagged = ?flagged, "Dependents flagged for review");
    }
    Ok(flagged)
}
