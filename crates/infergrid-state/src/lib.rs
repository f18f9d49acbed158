//! infergrid-state: persisted and in-process state for InferGrid.
//!
//! # Architecture
//!
//! ```text
//!   API handlers ─┐                ┌─> EventBus (broadcast) ─> subscribers
//!   Reconciler  ──┼─> NodeRegistry ┤
//!   Health      ──┘   (RwLock map) └─> StateStore (redb)
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{tenant}/{provider}`, `{tenant}/{model}`,
//! `{tenant}:{hour}`) allow prefix scans for related records.
//!
//! `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).
//! `NodeRegistry` owns the live node set; callers get snapshots, never
//! references into the map.

pub mod clock;
pub mod error;
pub mod events;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, epoch_secs};
pub use error::{StateError, StateResult};
pub use events::{Event, EventBus, EventKind};
pub use registry::NodeRegistry;
pub use store::StateStore;
pub use types::*;
