//! # Content Unit Graph
//!
//! Named content units with optional dependency edges, scoped to one project.
//!
//! ## Architecture
//!
//! ```text
//! ContentUnitGraph (snapshot, read once per turn)
//!        │
//!        └── resolver::resolve_order → ExecutionPlan { batches, blocked }
//! ```

pub mod resolver;

pub use resolver::{resolve_order, Batch, BlockedUnit, ExecutionPlan};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Lifecycle of a content unit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// An addressable, independently generated piece of content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentUnit {
    pub id: String,
    pub project_id: String,
    /// Unique within the project
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: UnitStatus,
    /// Ids of units this one depends on
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub needs_review: bool,
    pub updated_at: DateTime<Utc>,
}

impl ContentUnit {
    /// Declare a new pending unit. The id is derived from the project and name.
    pub fn new(project_id: &str, name: &str) -> Self {
        Self {
            id: unit_id(project_id, name),
            project_id: project_id.to_string(),
            name: name.to_string(),
            parent_id: None,
            content: String::new(),
            status: UnitStatus::Pending,
            depends_on: Vec::new(),
            needs_review: false,
            updated_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn depending_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: UnitStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == UnitStatus::Completed
    }

    /// Touch the modification timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Derive a stable unit id from its project and name
pub fn unit_id(project_id: &str, name: &str) -> String {
    let slug: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}:{}", project_id, slug)
}

/// The units of one project, indexed by id and by name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentUnitGraph {
    pub project_id: String,
    units: Vec<ContentUnit>,
}

impl ContentUnitGraph {
    pub fn new(project_id: &str, units: Vec<ContentUnit>) -> Self {
        Self {
            project_id: project_id.to_string(),
            units,
        }
    }

    pub fn units(&self) -> &[ContentUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ContentUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Case-insensitive lookup by unit name
    pub fn by_name(&self, name: &str) -> Option<&ContentUnit> {
        let needle = name.trim();
        self.units
            .iter()
            .find(|u| u.name.eq_ignore_ascii_case(needle))
    }

    /// Insert or replace a unit (matched by id)
    pub fn upsert(&mut self, unit: ContentUnit) {
        match self.units.iter_mut().find(|u| u.id == unit.id) {
            Some(existing) => *existing = unit,
            None => self.units.push(unit),
        }
    }

    /// New pending unit named `name` whose id is not taken in this graph.
    ///
    /// Names that slug to an existing id ("Intro Part", "Intro_Part") get a
    /// numeric suffix so saving the new unit never replaces another one.
    pub fn declare(&self, name: &str) -> ContentUnit {
        let unit = ContentUnit::new(&self.project_id, name.trim());
        if self.get(&unit.id).is_none() {
            return unit;
        }
        let id = (2..)
            .map(|n| format!("{}-{}", unit.id, n))
            .find(|candidate| self.get(candidate).is_none())
            .unwrap_or_else(|| unit.id.clone());
        tracing::debug!(name = %unit.name, id = %id, "Unit id taken, using suffixed id");
        unit.with_id(id)
    }

    /// Replace the whole unit set (after a structural edit reload)
    pub fn replace_all(&mut self, units: Vec<ContentUnit>) {
        self.units = units;
    }

    /// Ids of `id` plus every unit it transitively depends on.
    ///
    /// Dependency ids that do not resolve are included so the resolver can
    /// report them as blocked.
    pub fn dependency_closure(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(unit) = self.get(&current) {
                stack.extend(unit.depends_on.iter().cloned());
            }
        }
        seen
    }

    /// Ids of every unit that transitively depends on `id` (excluding `id`)
    pub fn dependents_of(&self, id: &str) -> BTreeSet<String> {
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for unit in &self.units {
            for dep in &unit.depends_on {
                reverse.entry(dep.as_str()).or_default().push(unit.id.as_str());
            }
        }

        let mut found = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for &dependent in reverse.get(current).map(Vec::as_slice).unwrap_or(&[]) {
                if dependent != id && found.insert(dependent.to_string()) {
                    stack.push(dependent);
                }
            }
        }
        found
    }

    /// Units restricted to the given id set, in graph order
    pub fn subgraph(&self, ids: &BTreeSet<String>) -> Vec<ContentUnit> {
        self.units
            .iter()
            .filter(|u| ids.contains(&u.id))
            .cloned()
            .collect()
    }

    /// Compact textual summary used as LLM context
    pub fn summary(&self) -> String {
        if self.units.is_empty() {
            return "(no content units yet)".to_string();
        }
        self.units
            .iter()
            .map(|u| {
                let deps: Vec<&str> = u
                    .depends_on
                    .iter()
                    .map(|d| self.get(d).map(|x| x.name.as_str()).unwrap_or(d.as_str()))
                    .collect();
                if deps.is_empty() {
                    format!("- {} [{}]", u.name, u.status.as_str())
                } else {
                    format!(
                        "- {} [{}] depends on: {}",
                        u.name,
                        u.status.as_str(),
                        deps.join(", ")
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContentUnitGraph {
        ContentUnitGraph::new(
            "p1",
            vec![
                ContentUnit::new("p1", "Research").with_id("A"),
                ContentUnit::new("p1", "Outline").with_id("B").depending_on(["A"]),
                ContentUnit::new("p1", "Draft").with_id("C").depending_on(["B"]),
                ContentUnit::new("p1", "Cover").with_id("D"),
            ],
        )
    }

    #[test]
    fn test_unit_id_slug() {
        assert_eq!(unit_id("p1", "Market Research"), "p1:market-research");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&UnitStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(UnitStatus::from_str("completed"), UnitStatus::Completed);
        assert_eq!(UnitStatus::from_str("garbage"), UnitStatus::Pending);
    }

    #[test]
    fn test_lookup_by_name_ignores_case() {
        let graph = sample();
        assert_eq!(graph.by_name("outline").map(|u| u.id.as_str()), Some("B"));
        assert!(graph.by_name("Missing").is_none());
    }

    #[test]
    fn test_declare_avoids_taken_ids() {
        let graph = ContentUnitGraph::new(
            "p1",
            vec![
                ContentUnit::new("p1", "Intro Part"),
                ContentUnit::new("p1", "Intro-Part").with_id("p1:intro-part-2"),
            ],
        );
        let declared = graph.declare("Intro_Part");
        assert_eq!(declared.name, "Intro_Part");
        assert_eq!(declared.id, "p1:intro-part-3");

        assert_eq!(graph.declare("Conclusion").id, "p1:conclusion");
    }

    #[test]
    fn test_dependency_closure_and_dependents() {
        let graph = sample();
        let closure: Vec<_> = graph.dependency_closure("C").into_iter().collect();
        assert_eq!(closure, vec!["A", "B", "C"]);

        let dependents: Vec<_> = graph.dependents_of("A").into_iter().collect();
        assert_eq!(dependents, vec!["B", "C"]);
        assert!(graph.dependents_of("D").is_empty());
    }

    #[test]
    fn test_summary_names_dependencies() {
        let summary = sample().summary();
        assert!(summary.contains("- Outline [pending] depends on: Research"));
    }
}
