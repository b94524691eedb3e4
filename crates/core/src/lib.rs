//! # Scriptorium Core
//!
//! The decision-and-scheduling core of Scriptorium: it decides what a user
//! message means, in which order the resulting work runs, and whether the
//! pipeline may move on without a human.
//!
//! ## Architecture
//!
//! - `intent/` - Utterance to ordered intents (rules first, then the LLM)
//! - `graph/` - Content units, their dependencies and the batch resolver
//! - `phase/` - Ordered phases with per-phase autonomy gates
//! - `dispatch/` - Turn execution, handler table, streaming events
//! - `handlers/` - Standard handlers (chat, modify, generate, phases, tools)
//! - `state/` - Project and session stores (in-memory and SQLite)
//! - `llm/` - LLM client seam and the radkit-backed implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scriptorium_core::{Dispatcher, StudioConfig, TurnRequest};
//!
//! let config = StudioConfig::load().await;
//! let dispatcher = Dispatcher::new(config, llm, projects, sessions);
//! let response = dispatcher.run_turn(TurnRequest::new("p1", "write the intro")).await;
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod handlers;
pub mod intent;
pub mod llm;
pub mod phase;
pub mod session;
pub mod state;
pub mod tools;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ConfigOverrides, StudioConfig};
pub use dispatch::{Dispatcher, TurnEvent, TurnEventKind};
pub use error::{CoreError, CoreResult, CycleError};
pub use graph::{resolve_order, ContentUnit, ContentUnitGraph, ExecutionPlan, UnitStatus};
pub use intent::{Intent, IntentClassifier, IntentKind};
pub use phase::{PhaseStateMachine, PhaseStatus};
pub use session::SessionKey;
pub use transport::{ErrorObject, TurnRequest, TurnResponse};
