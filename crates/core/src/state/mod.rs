//! # State
//!
//! Persistence collaborators. The core only talks to the [`ProjectStore`]
//! and [`SessionStore`] traits; this module ships an in-memory pair for
//! tests and a SQLite pair for production.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher ──> ProjectStore ─┬─ InMemoryProjectStore
//!     │                        └─ SqliteProjectStore ─┐
//!     └────────> SessionStore ─┬─ InMemorySessionStore │
//!                              └─ SqliteSessionStore ──┴─> StudioDb (.scriptorium/studio.db)
//! ```

pub mod db;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use db::StudioDb;
pub use memory::{InMemoryProjectStore, InMemorySessionStore, UnitSnapshot};
pub use sqlite::{SqliteProjectStore, SqliteSessionStore};
pub use store::{ProjectStore, SessionStore};
