//! World segment orchestration for Realm.
//!
//! A room's simulation runs against a *world segment*: a map or level the
//! hosting engine loads through its own primitive, exposed here as the
//! [`WorldBackend`] trait. That primitive is single-threaded and slow, so:
//!
//! - [`WorldSegmentLoader`] applies a [`LoadStrategy`] (none, single
//!   replace, additive overlay) on top of the backend and reports
//!   completion through a callback.
//! - [`SceneOrchestrator`] funnels every load and unload, for every room,
//!   through one FIFO queue with at most one task in flight, and tracks a
//!   per-room [`ScenePhase`] so conflicting requests fail with
//!   [`SceneError::Busy`].
//!
//! Completions come back as [`SceneCompletion`] values on a channel; the
//! owner of the orchestrator feeds them back via
//! [`SceneOrchestrator::complete`].

mod backend;
mod error;
mod loader;
mod orchestrator;
mod strategy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{LoadMode, SimulatedBackend, WorldBackend};
pub use error::SceneError;
pub use loader::WorldSegmentLoader;
pub use orchestrator::{
    SceneCompletion, SceneCompletions, SceneLoadTask, SceneOp, SceneOrchestrator,
    SceneOutcome, ScenePhase, SceneTaskId, SceneTicket,
};
pub use strategy::{LoadStrategy, SegmentInstance, WorldBinding};
