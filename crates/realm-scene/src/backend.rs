//! The hosting engine's world loading primitive.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::{SceneError, SegmentInstance};

/// Whether a load replaces the engine's current world or overlays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadMode {
    Replace,
    Overlay,
}

/// Loads and unloads world segments in the hosting engine.
///
/// The orchestrator never calls into a backend concurrently, so
/// implementations may assume one operation at a time.
///
/// # Example
///
/// ```rust
/// use realm_scene::{LoadMode, SceneError, SegmentInstance, WorldBackend};
///
/// struct Noop;
///
/// impl WorldBackend for Noop {
///     async fn load_segment(
///         &self,
///         segment: &str,
///         _mode: LoadMode,
///     ) -> Result<SegmentInstance, SceneError> {
///         Ok(SegmentInstance { id: 1, segment: segment.to_owned() })
///     }
///
///     async fn unload_segment(&self, _instance: &SegmentInstance) -> Result<(), SceneError> {
///         Ok(())
///     }
/// }
/// ```
pub trait WorldBackend: Send + Sync + 'static {
    fn load_segment(
        &self,
        segment: &str,
        mode: LoadMode,
    ) -> impl Future<Output = Result<SegmentInstance, SceneError>> + Send;

    fn unload_segment(
        &self,
        instance: &SegmentInstance,
    ) -> impl Future<Output = Result<(), SceneError>> + Send;
}

/// A backend with no engine behind it: every load succeeds after an
/// optional fixed latency.
///
/// Useful for dedicated lobby servers whose rooms carry no real world.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    latency: Duration,
    next_instance: AtomicU64,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every load and unload by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            next_instance: AtomicU64::new(0),
        }
    }
}

impl WorldBackend for SimulatedBackend {
    async fn load_segment(
        &self,
        segment: &str,
        mode: LoadMode,
    ) -> Result<SegmentInstance, SceneError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let id = self.next_instance.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(segment, id, ?mode, "simulated segment loaded");
        Ok(SegmentInstance {
            id,
            segment: segment.to_owned(),
        })
    }

    async fn unload_segment(&self, instance: &SegmentInstance) -> Result<(), SceneError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        tracing::debug!(%instance, "simulated segment unloaded");
        Ok(())
    }
}
