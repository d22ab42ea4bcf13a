//! Strategy-aware world segment loader.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{LoadMode, LoadStrategy, SceneError, SegmentInstance, WorldBackend, WorldBinding};

/// What the loader believes is currently loaded.
#[derive(Debug, Default)]
struct LoadedSegments {
    /// The process-wide world under [`LoadStrategy::Single`].
    single: Option<SegmentInstance>,
    /// Additive instances by instance id.
    overlays: HashMap<u64, String>,
}

/// Applies a [`LoadStrategy`] on top of a [`WorldBackend`].
///
/// `load` and `unload` return immediately. Backend work runs on a spawned
/// task and its result is passed to `on_done`; under
/// [`LoadStrategy::None`] `on_done` runs before `load` returns.
///
/// The loader does not serialize calls itself. The orchestrator guarantees
/// at most one backend operation is in flight.
pub struct WorldSegmentLoader<B: WorldBackend> {
    backend: Arc<B>,
    loaded: Arc<Mutex<LoadedSegments>>,
}

impl<B: WorldBackend> WorldSegmentLoader<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            loaded: Arc::new(Mutex::new(LoadedSegments::default())),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Loads `segment` under `strategy`.
    ///
    /// [`LoadStrategy::Single`] first unloads whatever single world is
    /// active; a failure there is logged and the new load still proceeds.
    pub fn load<F>(&self, segment: &str, strategy: LoadStrategy, on_done: F)
    where
        F: FnOnce(Result<WorldBinding, SceneError>) + Send + 'static,
    {
        let mode = match strategy {
            LoadStrategy::None => {
                on_done(Ok(WorldBinding::Headless));
                return;
            }
            LoadStrategy::Single => LoadMode::Replace,
            LoadStrategy::Additive => LoadMode::Overlay,
        };

        let backend = Arc::clone(&self.backend);
        let loaded = Arc::clone(&self.loaded);
        let segment = segment.to_owned();

        tokio::spawn(async move {
            if mode == LoadMode::Replace {
                let previous = lock(&loaded).single.take();
                if let Some(previous) = previous {
                    if let Err(e) = backend.unload_segment(&previous).await {
                        tracing::warn!(
                            instance = %previous, error = %e,
                            "previous single segment failed to unload"
                        );
                    }
                }
            }

            let result = backend.load_segment(&segment, mode).await;
            if let Ok(instance) = &result {
                let mut loaded = lock(&loaded);
                match mode {
                    LoadMode::Replace => loaded.single = Some(instance.clone()),
                    LoadMode::Overlay => {
                        loaded.overlays.insert(instance.id, instance.segment.clone());
                    }
                }
            }

            on_done(result.map(|instance| WorldBinding::Segment { instance, strategy }));
        });
    }

    /// Unloads the world referenced by `binding`.
    ///
    /// Unloading something the loader no longer tracks (a single world that
    /// was already replaced, an unknown overlay) succeeds without touching
    /// the backend.
    pub fn unload<F>(&self, binding: WorldBinding, on_done: F)
    where
        F: FnOnce(Result<(), SceneError>) + Send + 'static,
    {
        let (instance, strategy) = match binding {
            WorldBinding::Headless
            | WorldBinding::Segment {
                strategy: LoadStrategy::None,
                ..
            } => {
                on_done(Ok(()));
                return;
            }
            WorldBinding::Segment { instance, strategy } => (instance, strategy),
        };

        let backend = Arc::clone(&self.backend);
        let loaded = Arc::clone(&self.loaded);

        tokio::spawn(async move {
            let tracked = {
                let mut loaded = lock(&loaded);
                match strategy {
                    LoadStrategy::Single => {
                        let current = loaded.single.as_ref().is_some_and(|s| s.id == instance.id);
                        if current {
                            loaded.single = None;
                        }
                        current
                    }
                    _ => loaded.overlays.remove(&instance.id).is_some(),
                }
            };

            let result = if tracked {
                backend.unload_segment(&instance).await
            } else {
                tracing::warn!(%instance, %strategy, "unload of untracked segment ignored");
                Ok(())
            };
            on_done(result);
        });
    }

    /// The single-strategy world currently loaded, if any.
    pub fn active_single(&self) -> Option<SegmentInstance> {
        lock(&self.loaded).single.clone()
    }

    /// Number of additive instances currently loaded.
    pub fn overlay_count(&self) -> usize {
        lock(&self.loaded).overlays.len()
    }
}

fn lock(loaded: &Mutex<LoadedSegments>) -> MutexGuard<'_, LoadedSegments> {
    loaded.lock().unwrap_or_else(PoisonError::into_inner)
}
