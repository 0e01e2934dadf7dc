//! Task ledger and session store for Baton.
//!
//! The [`TaskLedger`] is the only place task state changes. It enforces the
//! lifecycle table, allows one writer per task at a time and hands readers
//! immutable snapshots. The [`SessionStore`] keeps append-only, versioned
//! session records and the translation records produced at the gateway.

/// Task ledger and lifecycle enforcement.
pub mod ledger;
/// Versioned session storage.
pub mod session_store;

pub use ledger::{TaskFilter, TaskLedger, TransitionPayload, TransitionRecord};
pub use session_store::{InMemorySessionStore, JsonlSessionStore, SessionStore};
