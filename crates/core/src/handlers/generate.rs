//! Generation of a planned unit set.
//!
//! Batches run in order. Inside a batch, units are generated concurrently on
//! a `JoinSet`, bounded by a semaphore of `max_parallel_units`. Every unit is
//! committed on its own: `in_progress` before the model call, then
//! `completed` or `failed`. A failed batch stops the run; units committed
//! before the failure stay committed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{flag_dependents, project_context};
use crate::dispatch::{Handler, HandlerContext, HandlerResult};
use crate::graph::{BlockedUnit, ContentUnit, UnitStatus};
use crate::intent::Intent;
use crate::llm::{CompletionRequest, Message};
use crate::session::SessionSnapshot;

const GENERATE_PROMPT: &str = "You write one content unit of a larger piece. Use the dependency \
units as source material. Return only the unit's text: no preamble, no markdown fences.";

/// Everything one generation task needs, owned
struct UnitJob {
    unit: ContentUnit,
    dependencies: String,
    instruction: String,
    context: Arc<String>,
}

pub struct GenerateHandler;

#[async_trait]
impl Handler for GenerateHandler {
    async fn handle(
        &self,
        intent: &Intent,
        session: &SessionSnapshot,
        ctx: &HandlerContext,
    ) -> Result<HandlerResult> {
        let plan = ctx
            .plan
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generate intent arrived without a plan"))?;

        if plan.batches.is_empty() {
            let mut output = "Every unit is already complete.".to_string();
            if !plan.blocked.is_empty() {
                output = blocked_note(&plan.blocked, session);
            }
            return Ok(HandlerResult::reply(output));
        }

        let instruction = intent.operation.clone().unwrap_or_else(|| ctx.message.clone());
        let context = Arc::new(project_context(session));
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_parallel_units.max(1)));
        let mut units: HashMap<String, ContentUnit> = session
            .units
            .units()
            .iter()
            .map(|u| (u.id.clone(), u.clone()))
            .collect();
        let mut generated: Vec<ContentUnit> = Vec::new();
        let mut rewritten: Vec<ContentUnit> = Vec::new();

        for (index, batch) in plan.batches.iter().enumerate() {
            let jobs: Vec<UnitJob> = batch
                .iter()
                .filter_map(|id| units.get(id))
                .map(|unit| UnitJob {
                    dependencies: dependency_text(unit, &units),
                    unit: unit.clone(),
                    instruction: instruction.clone(),
                    context: context.clone(),
                })
                .collect();

            tracing::debug!(batch = index, units = jobs.len(), "Generating batch");

            let results = if jobs.len() == 1 {
                let mut jobs = jobs;
                let job = jobs.remove(0);
                let name = job.unit.name.clone();
                vec![(name, generate_unit(ctx, job, true).await)]
            } else {
                run_batch(ctx, jobs, semaphore.clone()).await
            };

            let mut failures = Vec::new();
            for (name, result) in results {
                match result {
                    Ok((unit, had_content)) => {
                        if had_content {
                            rewritten.push(unit.clone());
                        }
                        units.insert(unit.id.clone(), unit.clone());
                        generated.push(unit);
                    }
                    Err(e) => failures.push(format!("{}: {:#}", name, e)),
                }
            }
            if !failures.is_empty() {
                anyhow::bail!(
                    "generation stopped in batch {} of {}: {}",
                    index + 1,
                    plan.batches.len(),
                    failures.join("; ")
                );
            }
        }

        let planned: BTreeSet<String> = plan.batches.iter().flatten().cloned().collect();
        for unit in &rewritten {
            flag_dependents(unit, session, ctx, &planned).await?;
        }

        let mut output = match generated.as_slice() {
            [only] => only.content.clone(),
            many => format!(
                "Generated {} units: {}",
                many.len(),
                many.iter().map(|u| u.name.as_str()).collect::<Vec<_>>().join(", ")
            ),
        };
        if !plan.blocked.is_empty() {
            output = format!("{}\n\n{}", output, blocked_note(&plan.blocked, session));
        }

        let mut result = HandlerResult::reply(output);
        if let Some(last) = generated.pop() {
            result = result.with_unit(last);
        }
        Ok(result)
    }
}

/// Generate one batch concurrently. Results come back in completion order.
async fn run_batch(
    ctx: &HandlerContext,
    jobs: Vec<UnitJob>,
    semaphore: Arc<Semaphore>,
) -> Vec<(String, Result<(ContentUnit, bool)>)> {
    let mut join_set = JoinSet::new();
    for job in jobs {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            let name = job.unit.name.clone();
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => generate_unit(&ctx, job, false).await,
                Err(e) => Err(anyhow::Error::new(e)),
            };
            (name, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => results.push((
                "(unknown)".to_string(),
                Err(anyhow::anyhow!("Task panicked: {}", e)),
            )),
        }
    }
    results
}

/// Returns the committed unit and whether it replaced earlier content
async fn generate_unit(ctx: &HandlerContext, job: UnitJob, stream: bool) -> Result<(ContentUnit, bool)> {
    let mut unit = job.unit;
    let had_content = !unit.content.trim().is_empty();
    unit.status = UnitStatus::InProgress;
    unit.touch();
    ctx.commit(&unit).await?;

    let messages = vec![
        Message::system(GENERATE_PROMPT),
        Message::system(job.context.as_str()),
        Message::system(job.dependencies),
        Message::user(format!("Write the unit \"{}\". {}", unit.name, job.instruction)),
    ];
    let request = CompletionRequest::new("generate", messages);
    let reply = if stream {
        ctx.stream(&request).await
    } else {
        ctx.llm.complete(&request).await
    };

    let text = match reply {
        Ok(completion) if !completion.text.trim().is_empty() => completion.text.trim().to_string(),
        Ok(_) => return fail_unit(ctx, unit, anyhow::anyhow!("model returned no content")).await,
        Err(e) => return fail_unit(ctx, unit, e).await,
    };

    ctx.overwrite(&mut unit, text, "generate").await?;
    unit.status = UnitStatus::Completed;
    unit.needs_review = false;
    ctx.commit(&unit).await?;
    tracing::info!(unit = %unit.name, chars = unit.content.len(), "Unit generated");
    Ok((unit, had_content))
}

async fn fail_unit(ctx: &HandlerContext, mut unit: ContentUnit, err: anyhow::Error) -> Result<(ContentUnit, bool)> {
    tracing::warn!(unit = %unit.name, error = %err, "Unit generation failed");
    unit.status = UnitStatus::Failed;
    unit.touch();
    ctx.commit(&unit)
        .await
        .context("Failed to record unit failure")?;
    Err(err)
}

fn dependency_text(unit: &ContentUnit, units: &HashMap<String, ContentUnit>) -> String {
    if unit.depends_on.is_empty() {
        return "This unit has no dependencies.".to_string();
    }
    unit.depends_on
        .iter()
        .filter_map(|id| units.get(id))
        .map(|dep| format!("Dependency \"{}\":\n{}", dep.name, dep.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn blocked_note(blocked: &[BlockedUnit], session: &SessionSnapshot) -> String {
    let name = |id: &str| {
        session
            .units
            .get(id)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| id.to_string())
    };
    let lines: Vec<String> = blocked
        .iter()
        .map(|b| {
            let mut reasons = Vec::new();
            if !b.missing.is_empty() {
                reasons.push(format!("missing {}", b.missing.join(", ")));
            }
            if !b.blocked_by.is_empty() {
                let names: Vec<String> = b.blocked_by.iter().map(|id| name(id)).collect();
                reasons.push(format!("waits on {}", names.join(", ")));
            }
            format!("- {} ({})", name(&b.id), reasons.join("; "))
        })
        .collect();
    format!("Blocked, not generated:\n{}", lines.join("\n"))
}
