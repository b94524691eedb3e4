//! # Dependency Resolver
//!
//! Kahn's algorithm over a content-unit graph, grouping units into batches
//! whose dependencies are all satisfied by earlier batches.
//!
//! - Units inside a batch are sorted by id, so output is deterministic.
//! - Units with a dependency id missing from the input are blocked and
//!   reported, together with everything that transitively waits on them.
//! - Anything left after that sits on or behind a cycle and fails the call.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::ContentUnit;
use crate::error::CycleError;

/// Unit ids that may run concurrently at one scheduling step
pub type Batch = Vec<String>;

/// A unit that can never be scheduled because a dependency does not exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedUnit {
    pub id: String,
    /// Dependency ids that do not resolve to any unit in the input
    pub missing: Vec<String>,
    /// Dependencies that are themselves blocked
    pub blocked_by: Vec<String>,
}

/// Ordered batches plus the units that could not be placed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub batches: Vec<Batch>,
    pub blocked: Vec<BlockedUnit>,
}

impl ExecutionPlan {
    /// Total number of scheduled units
    pub fn unit_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Index of the batch containing `id`, if scheduled
    pub fn batch_of(&self, id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|u| u == id))
    }

    /// Drop already-completed units from the plan, keeping batch order
    pub fn without(mut self, done: &BTreeSet<String>) -> Self {
        for batch in &mut self.batches {
            batch.retain(|id| !done.contains(id));
        }
        self.batches.retain(|b| !b.is_empty());
        self
    }
}

/// Order `units` into dependency-respecting batches.
///
/// Fails with [`CycleError`] when some units can never reach in-degree zero
/// for a reason other than a missing dependency.
pub fn resolve_order(units: &[ContentUnit]) -> Result<ExecutionPlan, CycleError> {
    // BTreeMap keeps every iteration below sorted by id
    let mut deps: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for unit in units {
        deps.entry(unit.id.as_str())
            .or_default()
            .extend(unit.depends_on.iter().map(String::as_str));
    }

    let mut missing: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();

    for (&id, unit_deps) in &deps {
        let mut degree = 0;
        for &dep in unit_deps {
            if deps.contains_key(dep) {
                dependents.entry(dep).or_default().push(id);
                degree += 1;
            } else {
                missing.entry(id).or_default().push(dep.to_string());
            }
        }
        in_degree.insert(id, degree);
    }

    let mut batches: Vec<Batch> = Vec::new();
    let mut processed: BTreeSet<&str> = BTreeSet::new();
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|&(id, &d)| d == 0 && !missing.contains_key(id))
        .map(|(&id, _)| id)
        .collect();

    while !ready.is_empty() {
        ready.sort_unstable();
        let mut next = Vec::new();
        for &id in &ready {
            processed.insert(id);
            for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(d) = in_degree.get_mut(dependent) {
                    *d -= 1;
                    if *d == 0 && !missing.contains_key(dependent) {
                        next.push(dependent);
                    }
                }
            }
        }
        batches.push(ready.iter().map(|s| s.to_string()).collect());
        ready = next;
    }

    if processed.len() == deps.len() {
        return Ok(ExecutionPlan {
            batches,
            blocked: Vec::new(),
        });
    }

    // Units with a missing dependency are released virtually so that their
    // dependents can be told apart from genuine cycle members.
    let mut blocked: BTreeMap<&str, BlockedUnit> = BTreeMap::new();
    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|&(id, &d)| d == 0 && !processed.contains(id))
        .map(|(&id, _)| id)
        .collect();

    while let Some(id) = queue.pop() {
        let blocked_by: Vec<String> = deps[id]
            .iter()
            .filter(|dep| blocked.contains_key(*dep))
            .map(|dep| dep.to_string())
            .collect();
        blocked.insert(
            id,
            BlockedUnit {
                id: id.to_string(),
                missing: missing.get(id).cloned().unwrap_or_default(),
                blocked_by,
            },
        );
        for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    queue.push(dependent);
                }
            }
        }
    }

    let stuck: Vec<String> = deps
        .keys()
        .filter(|id| !processed.contains(*id) && !blocked.contains_key(*id))
        .map(|id| id.to_string())
        .collect();

    if !stuck.is_empty() {
        return Err(CycleError { members: stuck });
    }

    // A dependent may be released before all of its blocked parents were
    // visited; recompute blocked_by now that the set is final.
    let finished: BTreeSet<&str> = blocked.keys().copied().collect();
    let blocked = blocked
        .into_values()
        .map(|mut b| {
            b.blocked_by = deps[b.id.as_str()]
                .iter()
                .filter(|dep| finished.contains(*dep))
                .map(|dep| dep.to_string())
                .collect();
            b
        })
        .collect();

    Ok(ExecutionPlan { batches, blocked })
}
