//! Tool-backed intents: each kind maps to one registry entry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::dispatch::{Handler, HandlerContext, HandlerResult};
use crate::intent::{Intent, IntentKind};
use crate::session::SessionSnapshot;
use crate::tools::ToolArgs;

pub struct ToolHandler;

#[async_trait]
impl Handler for ToolHandler {
    async fn handle(
        &self,
        intent: &Intent,
        session: &SessionSnapshot,
        ctx: &HandlerContext,
    ) -> Result<HandlerResult> {
        let name = intent
            .kind
            .tool_name()
            .ok_or_else(|| anyhow::anyhow!("{} is not a tool-backed intent", intent.kind))?;

        let mut args = ToolArgs::new();
        args.insert("message".to_string(), Value::from(ctx.message.as_str()));
        if let Some(target) = &intent.target {
            args.insert("target".to_string(), Value::from(target.as_str()));
        }
        if let Some(operation) = &intent.operation {
            args.insert("operation".to_string(), Value::from(operation.as_str()));
        }
        if let Some(phase) = session.current_phase() {
            args.insert("phase".to_string(), Value::from(phase));
        }

        let output = ctx
            .tools
            .call(name, args, session.project_id())
            .await
            .with_context(|| format!("Tool '{}' failed", name))?;
        ctx.token(&output);

        let result = HandlerResult::reply(output);
        // structural edits change units behind the dispatcher's snapshot
        Ok(if intent.kind == IntentKind::Edit {
            result.reloading()
        } else {
            result
        })
    }
}
