//! Error types for world segment loading.

use realm_protocol::RoomId;

/// Errors raised by the loader, the orchestrator, or a backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SceneError {
    /// The room already has a load or unload queued or running.
    #[error("room {0} already has a scene transition in progress")]
    Busy(RoomId),

    /// An unload was requested for a room with nothing loaded.
    #[error("room {0} has no loaded world segment")]
    NotLoaded(RoomId),

    /// The backend could not load the segment.
    #[error("world segment {segment:?} failed to load: {reason}")]
    LoadFailed { segment: String, reason: String },

    /// The backend could not unload a segment instance.
    #[error("segment instance {instance} failed to unload: {reason}")]
    UnloadFailed { instance: u64, reason: String },
}
