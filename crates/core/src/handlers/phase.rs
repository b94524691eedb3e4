//! Phase conversation and phase advancement.
//!
//! The phase handler asks the model to continue the current phase and
//! expects `{reply, phase_complete, content}`. An incomplete phase asks the
//! human a question; a complete one commits its deliverable to a unit named
//! after the phase and reports completion for the autonomy gate.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{history, project_context};
use crate::dispatch::{Handler, HandlerContext, HandlerResult};
use crate::graph::UnitStatus;
use crate::intent::Intent;
use crate::llm::{decode_structured, or_fallback, CompletionRequest, Message};
use crate::phase::NextPhase;
use crate::session::SessionSnapshot;

const PHASE_PROMPT: &str = r#"You run one phase of a content-production pipeline.
Ask the user one question at a time until you have what the phase needs.
When the phase is done, write its deliverable.
Respond ONLY with JSON: {"reply": "...", "phase_complete": false, "content": null}
- reply: what you say to the user (a question while the phase is incomplete)
- phase_complete: true once the phase's work is finished
- content: the phase deliverable when complete, else null"#;

#[derive(Debug, Deserialize)]
struct PhaseReply {
    #[serde(default)]
    reply: String,
    #[serde(default)]
    phase_complete: bool,
    #[serde(default)]
    content: Option<String>,
}

pub struct PhaseHandler;

#[async_trait]
impl Handler for PhaseHandler {
    async fn handle(
        &self,
        intent: &Intent,
        session: &SessionSnapshot,
        ctx: &HandlerContext,
    ) -> Result<HandlerResult> {
        let Some(phase) = session.current_phase() else {
            return Ok(HandlerResult::reply("All phases are complete."));
        };
        let existing = session.units.by_name(phase);

        let mut messages = vec![
            Message::system(PHASE_PROMPT),
            Message::system(format!("Phase: {}", phase)),
            Message::system(project_context(session)),
        ];
        if let Some(unit) = existing.filter(|u| !u.content.trim().is_empty()) {
            messages.push(Message::system(format!(
                "Current {} deliverable:\n{}",
                phase, unit.content
            )));
        }
        messages.extend(history(session, ctx.config.transcript_window, &ctx.message));
        messages.push(Message::user(
            intent.operation.as_deref().unwrap_or(&ctx.message),
        ));

        let completion = ctx
            .llm
            .complete(&CompletionRequest::new("phase", messages))
            .await
            .with_context(|| format!("Phase '{}' completion failed", phase))?;

        let decoded = or_fallback(
            decode_structured::<PhaseReply>(&completion.payload()),
            "phase",
            || PhaseReply {
                reply: completion.text.trim().to_string(),
                phase_complete: false,
                content: None,
            },
        );
        ctx.token(&decoded.reply);

        if !decoded.phase_complete {
            return Ok(HandlerResult::reply(decoded.reply).asking());
        }

        let content = decoded
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let Some(content) = content else {
            return Ok(HandlerResult::reply(decoded.reply).completing_phase(false));
        };

        let mut unit = existing
            .cloned()
            .unwrap_or_else(|| session.units.declare(phase));
        ctx.overwrite(&mut unit, content, "phase").await?;
        unit.status = UnitStatus::Completed;
        unit.needs_review = false;
        ctx.commit(&unit).await?;

        Ok(HandlerResult::reply(decoded.reply)
            .with_unit(unit)
            .completing_phase(true))
    }
}

/// Validates the requested transition; the dispatcher applies it
pub struct AdvanceHandler;

#[async_trait]
impl Handler for AdvanceHandler {
    async fn handle(
        &self,
        intent: &Intent,
        session: &SessionSnapshot,
        _ctx: &HandlerContext,
    ) -> Result<HandlerResult> {
        let mut preview = session.phases.clone();
        let next = preview.advance(intent.target.as_deref())?;

        let output = match next {
            NextPhase::Phase(phase) => format!("Moving on to the {} phase.", phase),
            NextPhase::Terminal => "All phases are complete.".to_string(),
        };
        Ok(HandlerResult::reply(output).advancing(intent.target.clone()))
    }
}
