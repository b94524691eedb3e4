//! Rewrite of one existing unit.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;

use super::{flag_dependents, history, project_context};
use crate::dispatch::{Handler, HandlerContext, HandlerResult};
use crate::error::CoreError;
use crate::graph::UnitStatus;
use crate::intent::Intent;
use crate::llm::{CompletionRequest, Message};
use crate::session::SessionSnapshot;

const MODIFY_PROMPT: &str = "You revise one content unit. Apply the instruction and return the \
complete revised text only: no commentary, no markdown fences.";

pub struct ModifyHandler;

#[async_trait]
impl Handler for ModifyHandler {
    async fn handle(
        &self,
        intent: &Intent,
        session: &SessionSnapshot,
        ctx: &HandlerContext,
    ) -> Result<HandlerResult> {
        let target = intent
            .target
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("modify needs a target unit"))?;
        let mut unit = session
            .units
            .by_name(target)
            .cloned()
            .ok_or_else(|| CoreError::ReferenceResolution {
                names: vec![target.to_string()],
            })?;
        let instruction = intent.operation.as_deref().unwrap_or(&ctx.message);

        let mut messages = vec![
            Message::system(MODIFY_PROMPT),
            Message::system(project_context(session)),
            Message::system(format!("Current text of \"{}\":\n{}", unit.name, unit.content)),
        ];
        messages.extend(history(session, ctx.config.transcript_window, &ctx.message));
        messages.push(Message::user(instruction));

        let completion = ctx
            .stream(&CompletionRequest::new("modify", messages))
            .await
            .with_context(|| format!("Failed to rewrite '{}'", unit.name))?;
        let text = completion.text.trim();
        if text.is_empty() {
            anyhow::bail!("model returned no content for '{}'", unit.name);
        }

        ctx.overwrite(&mut unit, text.to_string(), "modify").await?;
        unit.status = UnitStatus::Completed;
        unit.needs_review = false;
        ctx.commit(&unit).await?;

        let flagged = flag_dependents(&unit, session, ctx, &BTreeSet::new()).await?;
        let output = if flagged.is_empty() {
            text.to_string()
        } else {
            format!("{}\n\nFlagged for review: {}", text, flagged.join(", "))
        };

        Ok(HandlerResult::reply(output).with_unit(unit))
    }
}
