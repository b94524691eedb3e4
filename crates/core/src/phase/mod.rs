//! # Phase State Machine
//!
//! Ordered production phases, a monotonic status per phase and per-phase
//! autonomy flags that decide whether completion suspends for a human.
//!
//! ## Architecture
//!
//! ```text
//! P1 ──advance──> P2 ──advance──> P3 ──advance──> (terminal)
//!  │               ▲
//!  └──advance(P2)──┘   jump: old current completed, target in_progress
//!
//! complete_phase ──> autonomy[P] ? Continue : Suspend (waiting for human)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};

/// Status of one phase. Only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

/// Result of a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "phase")]
pub enum NextPhase {
    Phase(String),
    /// Past the last configured phase
    Terminal,
}

/// What the dispatcher should do after a phase completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutonomyGate {
    Continue,
    Suspend,
}

impl AutonomyGate {
    pub fn waiting_for_human(&self) -> bool {
        matches!(self, Self::Suspend)
    }
}

/// Per-project phase progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStateMachine {
    phase_order: Vec<String>,
    phase_status: BTreeMap<String, PhaseStatus>,
    /// `None` once the pipeline has moved past the last phase
    current_phase: Option<String>,
    autonomy: BTreeMap<String, bool>,
}

impl PhaseStateMachine {
    /// Fresh machine positioned on the first phase, every phase pending
    pub fn new<I, S>(phase_order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut phase_order: Vec<String> = phase_order.into_iter().map(Into::into).collect();
        let mut seen = std::collections::HashSet::new();
        phase_order.retain(|p| seen.insert(p.clone()));

        let phase_status = phase_order
            .iter()
            .map(|p| (p.clone(), PhaseStatus::Pending))
            .collect();

        Self {
            current_phase: phase_order.first().cloned(),
            phase_order,
            phase_status,
            autonomy: BTreeMap::new(),
        }
    }

    pub fn with_autonomy(mut self, phase: &str, autonomous: bool) -> Self {
        self.set_autonomy(phase, autonomous);
        self
    }

    /// Rebuild from persisted parts. Statuses and flags for phases not in
    /// `phase_order` are dropped; an unknown current phase falls back to the
    /// first non-completed phase.
    pub fn restore(
        phase_order: Vec<String>,
        phase_status: BTreeMap<String, PhaseStatus>,
        current_phase: Option<String>,
        autonomy: BTreeMap<String, bool>,
    ) -> Self {
        let mut machine = Self::new(phase_order);
        for (phase, status) in phase_status {
            if let Some(slot) = machine.phase_status.get_mut(&phase) {
                *slot = status;
            }
        }
        for (phase, flag) in autonomy {
            machine.set_autonomy(&phase, flag);
        }
        machine.current_phase = match current_phase {
            Some(p) if machine.contains(&p) => Some(p),
            _ => machine
                .phase_order
                .iter()
                .find(|p| machine.phase_status[*p] != PhaseStatus::Completed)
                .cloned(),
        };
        machine
    }

    pub fn phase_order(&self) -> &[String] {
        &self.phase_order
    }

    pub fn current(&self) -> Option<&str> {
        self.current_phase.as_deref()
    }

    pub fn contains(&self, phase: &str) -> bool {
        self.phase_status.contains_key(phase)
    }

    pub fn status(&self, phase: &str) -> Option<PhaseStatus> {
        self.phase_status.get(phase).copied()
    }

    pub fn statuses(&self) -> &BTreeMap<String, PhaseStatus> {
        &self.phase_status
    }

    /// Autonomy flag for `phase`; phases without a flag require a human
    pub fn is_autonomous(&self, phase: &str) -> bool {
        self.autonomy.get(phase).copied().unwrap_or(false)
    }

    pub fn autonomy(&self) -> &BTreeMap<String, bool> {
        &self.autonomy
    }

    pub fn set_autonomy(&mut self, phase: &str, autonomous: bool) {
        if self.contains(phase) {
            self.autonomy.insert(phase.to_string(), autonomous);
        }
    }

    /// Whether the current phase still has work to do
    pub fn current_is_open(&self) -> bool {
        self.current()
            .and_then(|p| self.status(p))
            .is_some_and(|s| s != PhaseStatus::Completed)
    }

    /// Phase after the current one, without moving
    pub fn peek_next(&self) -> NextPhase {
        let Some(index) = self.current_index() else {
            return NextPhase::Terminal;
        };
        match self.phase_order.get(index + 1) {
            Some(next) => NextPhase::Phase(next.clone()),
            None => NextPhase::Terminal,
        }
    }

    /// Move to `target`, or to the next phase by order.
    ///
    /// An unknown `target` fails with [`CoreError::UnknownPhase`] and leaves
    /// the machine untouched.
    pub fn advance(&mut self, target: Option<&str>) -> CoreResult<NextPhase> {
        let next = match target {
            Some(t) => {
                let name = self
                    .resolve_name(t)
                    .ok_or_else(|| CoreError::UnknownPhase(t.to_string()))?;
                NextPhase::Phase(name)
            }
            None => self.peek_next(),
        };

        if let Some(old) = self.current_phase.clone() {
            if matches!(&next, NextPhase::Phase(p) if *p == old) {
                return Ok(next);
            }
            self.promote(&old, PhaseStatus::Completed);
        }

        match &next {
            NextPhase::Phase(p) => {
                self.promote(p, PhaseStatus::InProgress);
                self.current_phase = Some(p.clone());
            }
            NextPhase::Terminal => self.current_phase = None,
        }

        tracing::info!(next = ?next, "Phase advanced");
        Ok(next)
    }

    /// Mark the current phase as started
    pub fn begin(&mut self) {
        if let Some(current) = self.current_phase.clone() {
            self.promote(&current, PhaseStatus::InProgress);
        }
    }

    /// Record that a handler finished work for the current phase and consult
    /// its autonomy flag.
    ///
    /// Output marks the phase completed; no output leaves it in progress. The
    /// gate depends only on the flag.
    pub fn complete_phase(&mut self, produced_output: bool) -> AutonomyGate {
        let Some(current) = self.current_phase.clone() else {
            return AutonomyGate::Suspend;
        };

        let status = if produced_output {
            PhaseStatus::Completed
        } else {
            PhaseStatus::InProgress
        };
        self.promote(&current, status);

        if self.is_autonomous(&current) {
            AutonomyGate::Continue
        } else {
            AutonomyGate::Suspend
        }
    }

    fn current_index(&self) -> Option<usize> {
        let current = self.current_phase.as_ref()?;
        self.phase_order.iter().position(|p| p == current)
    }

    /// Exact match first, then case-insensitive
    fn resolve_name(&self, name: &str) -> Option<String> {
        let name = name.trim();
        self.phase_order
            .iter()
            .find(|p| p.as_str() == name)
            .or_else(|| self.phase_order.iter().find(|p| p.eq_ignore_ascii_case(name)))
            .cloned()
    }

    /// Raise a phase's status; never lowers it
    fn promote(&mut self, phase: &str, status: PhaseStatus) {
        if let Some(slot) = self.phase_status.get_mut(phase) {
            if status > *slot {
                *slot = status;
            }
        }
    }
}
