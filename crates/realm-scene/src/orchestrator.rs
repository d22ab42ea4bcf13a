//! Global FIFO queue of world segment loads and unloads.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use realm_protocol::RoomId;
use tokio::sync::mpsc;

use crate::{LoadStrategy, SceneError, WorldBackend, WorldBinding, WorldSegmentLoader};

// ---------------------------------------------------------------------------
// Tasks and outcomes
// ---------------------------------------------------------------------------

/// Identifies one queued scene task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SceneTaskId(pub u64);

impl fmt::Display for SceneTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scene-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneOp {
    Load {
        segment: String,
        strategy: LoadStrategy,
    },
    Unload {
        binding: WorldBinding,
    },
}

/// A unit of work in the queue. Consumed strictly in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneLoadTask {
    pub id: SceneTaskId,
    pub room: RoomId,
    pub op: SceneOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneOutcome {
    Loaded(WorldBinding),
    Unloaded,
    Failed(SceneError),
}

/// Reported on the completion channel when a started task finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneCompletion {
    pub task: SceneTaskId,
    pub room: RoomId,
    pub outcome: SceneOutcome,
}

/// Receiving side of the orchestrator's completion callback.
pub type SceneCompletions = mpsc::UnboundedReceiver<SceneCompletion>;

/// Result of asking for a load or unload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneTicket {
    /// Queued; a [`SceneCompletion`] for this task will follow.
    Queued(SceneTaskId),
    /// Finished synchronously (headless rooms). No completion follows.
    Completed(SceneOutcome),
}

/// Where a room is in its load/unload cycle.
///
/// ```text
/// Idle → LoadPending → Loading → Loaded → UnloadPending → Unloading → Idle
/// ```
///
/// A failed load returns the room to `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ScenePhase {
    #[default]
    Idle,
    LoadPending,
    Loading,
    Loaded,
    UnloadPending,
    Unloading,
}

impl ScenePhase {
    /// Returns `true` while a task for the room is queued or running.
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            Self::LoadPending | Self::Loading | Self::UnloadPending | Self::Unloading
        )
    }
}

// ---------------------------------------------------------------------------
// SceneOrchestrator
// ---------------------------------------------------------------------------

/// Serializes every world segment transition in the process.
///
/// Exactly one task runs at a time across all rooms. Tasks start in the
/// order they were requested; each finished task is reported on the
/// [`SceneCompletions`] channel returned by [`new`](Self::new), and the
/// owner must hand it back through [`complete`](Self::complete) before the
/// next queued task starts.
///
/// Started tasks cannot be cancelled. A caller that no longer wants a
/// loaded world waits for the completion and requests an unload.
pub struct SceneOrchestrator<B: WorldBackend> {
    loader: WorldSegmentLoader<B>,
    queue: VecDeque<SceneLoadTask>,
    in_flight: Option<SceneLoadTask>,
    phases: HashMap<RoomId, ScenePhase>,
    next_task: u64,
    completions: mpsc::UnboundedSender<SceneCompletion>,
}

impl<B: WorldBackend> SceneOrchestrator<B> {
    pub fn new(backend: B) -> (Self, SceneCompletions) {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            loader: WorldSegmentLoader::new(backend),
            queue: VecDeque::new(),
            in_flight: None,
            phases: HashMap::new(),
            next_task: 1,
            completions: tx,
        };
        (orchestrator, rx)
    }

    pub fn loader(&self) -> &WorldSegmentLoader<B> {
        &self.loader
    }

    /// Requests a load of `segment` for `room`.
    ///
    /// Headless rooms complete immediately without entering the queue.
    ///
    /// # Errors
    /// [`SceneError::Busy`] if the room is mid-transition or already loaded.
    pub fn request_load(
        &mut self,
        room: RoomId,
        segment: &str,
        strategy: LoadStrategy,
    ) -> Result<SceneTicket, SceneError> {
        if self.phase(room) != ScenePhase::Idle {
            return Err(SceneError::Busy(room));
        }

        if strategy == LoadStrategy::None {
            self.phases.insert(room, ScenePhase::Loaded);
            return Ok(SceneTicket::Completed(SceneOutcome::Loaded(WorldBinding::Headless)));
        }

        let id = self.enqueue(
            room,
            SceneOp::Load {
                segment: segment.to_owned(),
                strategy,
            },
        );
        self.phases.insert(room, ScenePhase::LoadPending);
        tracing::debug!(%room, task = %id, segment, %strategy, "scene load queued");
        self.pump();
        Ok(SceneTicket::Queued(id))
    }

    /// Requests an unload of the world `binding` refers to.
    ///
    /// # Errors
    /// [`SceneError::Busy`] if the room is mid-transition,
    /// [`SceneError::NotLoaded`] if nothing is loaded for it.
    pub fn request_unload(
        &mut self,
        room: RoomId,
        binding: WorldBinding,
    ) -> Result<SceneTicket, SceneError> {
        match self.phase(room) {
            ScenePhase::Loaded => {}
            ScenePhase::Idle => return Err(SceneError::NotLoaded(room)),
            _ => return Err(SceneError::Busy(room)),
        }

        if binding == WorldBinding::Headless {
            self.phases.insert(room, ScenePhase::Idle);
            return Ok(SceneTicket::Completed(SceneOutcome::Unloaded));
        }

        let id = self.enqueue(room, SceneOp::Unload { binding });
        self.phases.insert(room, ScenePhase::UnloadPending);
        tracing::debug!(%room, task = %id, "scene unload queued");
        self.pump();
        Ok(SceneTicket::Queued(id))
    }

    /// Records a finished task and starts the next one.
    ///
    /// # Panics
    /// If `completion` is not for the task currently in flight. Completions
    /// only come from this orchestrator's own callback, so a mismatch means
    /// they were replayed or mixed between orchestrators.
    pub fn complete(&mut self, completion: &SceneCompletion) {
        let running = self.in_flight.take();
        assert!(
            running.as_ref().is_some_and(|t| t.id == completion.task),
            "completion for {} does not match the running task {:?}",
            completion.task,
            running.map(|t| t.id),
        );

        let phase = match &completion.outcome {
            SceneOutcome::Loaded(_) => ScenePhase::Loaded,
            SceneOutcome::Unloaded | SceneOutcome::Failed(_) => ScenePhase::Idle,
        };
        self.phases.insert(completion.room, phase);

        match &completion.outcome {
            SceneOutcome::Failed(error) => {
                tracing::warn!(room = %completion.room, task = %completion.task, %error, "scene task failed");
            }
            _ => {
                tracing::debug!(room = %completion.room, task = %completion.task, ?phase, "scene task finished");
            }
        }

        self.pump();
    }

    pub fn phase(&self, room: RoomId) -> ScenePhase {
        self.phases.get(&room).copied().unwrap_or_default()
    }

    /// Returns `true` while a task for `room` is queued or running.
    pub fn is_busy(&self, room: RoomId) -> bool {
        self.phase(room).is_transitioning()
    }

    /// Forgets a room whose world is gone (destroyed rooms).
    ///
    /// # Panics
    /// If a task for the room is still queued or running.
    pub fn release(&mut self, room: RoomId) {
        assert!(
            !self.is_busy(room),
            "released room {room} while a scene task is outstanding"
        );
        self.phases.remove(&room);
    }

    /// Tasks not yet finished, including the running one.
    pub fn backlog(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    /// The task currently running, if any.
    pub fn in_flight(&self) -> Option<&SceneLoadTask> {
        self.in_flight.as_ref()
    }

    fn enqueue(&mut self, room: RoomId, op: SceneOp) -> SceneTaskId {
        let id = SceneTaskId(self.next_task);
        self.next_task += 1;
        self.queue.push_back(SceneLoadTask { id, room, op });
        id
    }

    fn pump(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(task) = self.queue.pop_front() else {
            return;
        };

        let (task_id, room) = (task.id, task.room);
        let done = self.completions.clone();
        match &task.op {
            SceneOp::Load { segment, strategy } => {
                self.phases.insert(room, ScenePhase::Loading);
                tracing::info!(%room, task = %task_id, segment, "loading world segment");
                self.loader.load(segment, *strategy, move |result| {
                    let outcome = match result {
                        Ok(binding) => SceneOutcome::Loaded(binding),
                        Err(e) => SceneOutcome::Failed(e),
                    };
                    let _ = done.send(SceneCompletion {
                        task: task_id,
                        room,
                        outcome,
                    });
                });
            }
            SceneOp::Unload { binding } => {
                self.phases.insert(room, ScenePhase::Unloading);
                tracing::info!(%room, task = %task_id, segment = ?binding.segment_name(), "unloading world segment");
                self.loader.unload(binding.clone(), move |result| {
                    let outcome = match result {
                        Ok(()) => SceneOutcome::Unloaded,
                        Err(e) => SceneOutcome::Failed(e),
                    };
                    let _ = done.send(SceneCompletion {
                        task: task_id,
                        room,
                        outcome,
                    });
                });
            }
        }
        self.in_flight = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedBackend;

    #[test]
    fn test_headless_load_and_unload_complete_synchronously() {
        let (mut scenes, _done) = SceneOrchestrator::new(SimulatedBackend::new());
        let room = RoomId(1);

        let ticket = scenes.request_load(room, "", LoadStrategy::None).unwrap();
        assert_eq!(ticket, SceneTicket::Completed(SceneOutcome::Loaded(WorldBinding::Headless)));
        assert_eq!(scenes.phase(room), ScenePhase::Loaded);
        assert_eq!(scenes.backlog(), 0);

        let ticket = scenes.request_unload(room, WorldBinding::Headless).unwrap();
        assert_eq!(ticket, SceneTicket::Completed(SceneOutcome::Unloaded));
        assert_eq!(scenes.phase(room), ScenePhase::Idle);
    }

    #[test]
    fn test_unload_without_load_is_not_loaded() {
        let (mut scenes, _done) = SceneOrchestrator::new(SimulatedBackend::new());
        let err = scenes.request_unload(RoomId(3), WorldBinding::Headless).unwrap_err();
        assert_eq!(err, SceneError::NotLoaded(RoomId(3)));
    }

    #[test]
    fn test_loaded_room_rejects_second_load() {
        let (mut scenes, _done) = SceneOrchestrator::new(SimulatedBackend::new());
        scenes.request_load(RoomId(1), "", LoadStrategy::None).unwrap();
        let err = scenes.request_load(RoomId(1), "Map", LoadStrategy::None).unwrap_err();
        assert_eq!(err, SceneError::Busy(RoomId(1)));
    }

    #[test]
    fn test_scene_phase_transitioning() {
        assert!(ScenePhase::LoadPending.is_transitioning());
        assert!(ScenePhase::Unloading.is_transitioning());
        assert!(!ScenePhase::Loaded.is_transitioning());
        assert!(!ScenePhase::Idle.is_transitioning());
    }
}
