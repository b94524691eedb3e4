//! Chat and query answers. No unit is written.

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{history, project_context};
use crate::dispatch::{Handler, HandlerContext, HandlerResult};
use crate::intent::{Intent, IntentKind};
use crate::llm::{CompletionRequest, Message};
use crate::session::SessionSnapshot;

const CHAT_PROMPT: &str = "You are the writing partner in a content-production studio. \
Answer conversationally and briefly. Do not rewrite project content unless asked.";

const QUERY_PROMPT: &str = "You explain content from the user's project. \
Base every statement on the unit text provided; say so when the text does not cover the question.";

pub struct ConversationHandler;

#[async_trait]
impl Handler for ConversationHandler {
    async fn handle(
        &self,
        intent: &Intent,
        session: &SessionSnapshot,
        ctx: &HandlerContext,
    ) -> Result<HandlerResult> {
        let prompt = match intent.kind {
            IntentKind::Query => QUERY_PROMPT,
            _ => CHAT_PROMPT,
        };
        let mut messages = vec![Message::system(prompt), Message::system(project_context(session))];

        if let Some(unit) = intent.target.as_deref().and_then(|t| session.units.by_name(t)) {
            let body = if unit.content.trim().is_empty() {
                "(empty)"
            } else {
                unit.content.as_str()
            };
            messages.push(Message::system(format!("Unit \"{}\":\n{}", unit.name, body)));
        }
        if let Some(op) = intent.operation.as_deref().filter(|op| *op != ctx.message) {
            messages.push(Message::system(format!("Instruction for this reply: {}", op)));
        }

        messages.extend(history(session, ctx.config.transcript_window, &ctx.message));
        messages.push(Message::user(&ctx.message));

        let completion = ctx
            .stream(&CompletionRequest::new(intent.kind.as_str(), messages))
            .await
            .with_context(|| format!("{} completion failed", intent.kind))?;

        Ok(HandlerResult::reply(completion.text.trim()))
    }
}
