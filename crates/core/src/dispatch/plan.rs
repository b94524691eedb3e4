//! Generation planning: which units a `generate` intent may produce, in
//! which order, checked before the handler runs.

use std::collections::BTreeSet;

use crate::error::{CoreError, CoreResult};
use crate::graph::{resolve_order, ContentUnit, ContentUnitGraph, ExecutionPlan};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPlan {
    pub plan: ExecutionPlan,
    /// Unit declared because the target did not exist yet
    pub declared: Option<ContentUnit>,
}

/// Plan a generation request against the turn's graph snapshot.
///
/// With a target, the target's dependency subgraph must be acyclic and every
/// direct dependency completed; an unknown target is declared as a new unit.
/// Without a target, every non-completed unit is planned and units behind a
/// missing dependency are reported as blocked.
pub fn plan_generation(target: Option<&str>, graph: &ContentUnitGraph) -> CoreResult<GenerationPlan> {
    match target {
        Some(name) => plan_target(name, graph),
        None => plan_all(graph),
    }
}

fn plan_target(name: &str, graph: &ContentUnitGraph) -> CoreResult<GenerationPlan> {
    let Some(unit) = graph.by_name(name) else {
        let declared = graph.declare(name);
        tracing::info!(unit = %declared.name, "Declaring new unit for generation");
        return Ok(GenerationPlan {
            plan: single(&declared.id),
            declared: Some(declared),
        });
    };

    let closure = graph.dependency_closure(&unit.id);
    resolve_order(&graph.subgraph(&closure))?;

    let unmet: Vec<String> = unit
        .depends_on
        .iter()
        .filter_map(|dep| match graph.get(dep) {
            Some(d) if d.is_completed() => None,
            Some(d) => Some(d.name.clone()),
            None => Some(dep.clone()),
        })
        .collect();

    if !unmet.is_empty() {
        return Err(CoreError::PreconditionNotMet {
            target: unit.name.clone(),
            unmet,
        });
    }

    Ok(GenerationPlan {
        plan: single(&unit.id),
        declared: None,
    })
}

fn plan_all(graph: &ContentUnitGraph) -> CoreResult<GenerationPlan> {
    let mut plan = resolve_order(graph.units())?;
    let done: BTreeSet<String> = graph
        .units()
        .iter()
        .filter(|u| u.is_completed())
        .map(|u| u.id.clone())
        .collect();
    plan.blocked.retain(|b| !done.contains(&b.id));

    Ok(GenerationPlan {
        plan: plan.without(&done),
        declared: None,
    })
}

fn single(id: &str) -> ExecutionPlan {
    ExecutionPlan {
        batches: vec![vec![id.to_string()]],
        blocked: Vec::new(),
    }
}
