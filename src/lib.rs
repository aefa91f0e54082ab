//! tillsync: offline-first synchronization for point-of-sale terminals.
//!
//! The terminal works entirely against a local SQLite database; this
//! crate reconciles it with a PostgREST backend whenever connectivity
//! allows. The moving parts:
//!
//! - **Outbox**: every local mutation is journaled durably and uploaded
//!   with at-least-once semantics ([`store::outbox`]).
//! - **Watermarked pull**: each table tracks the newest `updated_at_iso`
//!   it has applied and fetches only newer rows ([`store::watermark`],
//!   [`engine::pull`]).
//! - **Tombstones**: deletes are soft markers that replicate like any
//!   other row update, never hard `DELETE`s.
//! - **FK ordering**: tables push and pull parents before children, with
//!   one-shot parent recovery on push and a bounded deferred-retry loop
//!   on pull ([`engine::tables`]).
//! - **Single-flight orchestration**: [`SyncEngine::run_cycle`] never
//!   overlaps itself and reports progress to subscribers.

pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod remote;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::SyncConfig;
pub use document::Document;
pub use engine::{CycleOutcome, SyncEngine, SyncStatus, SyncStep};
pub use error::{SyncError, SyncResult};
pub use store::outbox::{OutboxEntry, OutboxOp};
pub use store::LocalStore;
