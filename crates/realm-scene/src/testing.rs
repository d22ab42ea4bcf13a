//! A hand-driven [`WorldBackend`] for tests.
//!
//! Every load and unload blocks until the test releases it with
//! [`ManualBackend::complete_next`] or [`ManualBackend::fail_next`], which
//! makes "the room is still loading" observable.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, oneshot};

use crate::{LoadMode, SceneError, SegmentInstance, WorldBackend};

/// A backend operation as the backend saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Load { segment: String, mode: LoadMode },
    Unload { instance: SegmentInstance },
}

struct PendingCall {
    call: BackendCall,
    release: oneshot::Sender<Result<(), String>>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<VecDeque<PendingCall>>,
    history: Mutex<Vec<BackendCall>>,
    arrived: Notify,
    next_instance: AtomicU64,
    auto: AtomicBool,
}

/// Cloneable handle: give one clone to the orchestrator, keep one to steer.
#[derive(Clone, Default)]
pub struct ManualBackend {
    shared: Arc<Shared>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, operations succeed as soon as they arrive.
    pub fn auto_complete(&self, enabled: bool) {
        self.shared.auto.store(enabled, Ordering::SeqCst);
    }

    /// Operations waiting for a decision, oldest first.
    pub fn pending(&self) -> Vec<BackendCall> {
        lock(&self.shared.pending).iter().map(|p| p.call.clone()).collect()
    }

    /// Every operation received so far, in arrival order.
    pub fn history(&self) -> Vec<BackendCall> {
        lock(&self.shared.history).clone()
    }

    /// Waits until at least `count` operations are pending.
    pub async fn wait_pending(&self, count: usize) {
        loop {
            let arrived = self.shared.arrived.notified();
            if lock(&self.shared.pending).len() >= count {
                return;
            }
            arrived.await;
        }
    }

    /// Lets the oldest pending operation succeed.
    pub fn complete_next(&self) -> Option<BackendCall> {
        self.release_next(Ok(()))
    }

    /// Makes the oldest pending operation fail with `reason`.
    pub fn fail_next(&self, reason: &str) -> Option<BackendCall> {
        self.release_next(Err(reason.to_owned()))
    }

    /// Waits for the next operation, then lets it succeed.
    pub async fn complete_when_ready(&self) -> BackendCall {
        self.wait_pending(1).await;
        match self.complete_next() {
            Some(call) => call,
            None => unreachable!("a pending call was just observed"),
        }
    }

    fn release_next(&self, outcome: Result<(), String>) -> Option<BackendCall> {
        let next = lock(&self.shared.pending).pop_front()?;
        let _ = next.release.send(outcome);
        Some(next.call)
    }

    fn arrive(&self, call: BackendCall) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.history).push(call.clone());
        if self.shared.auto.load(Ordering::SeqCst) {
            let _ = tx.send(Ok(()));
        } else {
            lock(&self.shared.pending).push_back(PendingCall { call, release: tx });
            self.shared.arrived.notify_waiters();
        }
        rx
    }
}

impl WorldBackend for ManualBackend {
    fn load_segment(
        &self,
        segment: &str,
        mode: LoadMode,
    ) -> impl Future<Output = Result<SegmentInstance, SceneError>> + Send {
        let segment = segment.to_owned();
        let decision = self.arrive(BackendCall::Load {
            segment: segment.clone(),
            mode,
        });
        let shared = Arc::clone(&self.shared);
        async move {
            match decision.await {
                Ok(Ok(())) => Ok(SegmentInstance {
                    id: shared.next_instance.fetch_add(1, Ordering::SeqCst) + 1,
                    segment,
                }),
                Ok(Err(reason)) => Err(SceneError::LoadFailed { segment, reason }),
                Err(_) => Err(SceneError::LoadFailed {
                    segment,
                    reason: "backend dropped".into(),
                }),
            }
        }
    }

    fn unload_segment(
        &self,
        instance: &SegmentInstance,
    ) -> impl Future<Output = Result<(), SceneError>> + Send {
        let id = instance.id;
        let decision = self.arrive(BackendCall::Unload {
            instance: instance.clone(),
        });
        async move {
            match decision.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(SceneError::UnloadFailed { instance: id, reason }),
                Err(_) => Err(SceneError::UnloadFailed {
                    instance: id,
                    reason: "backend dropped".into(),
                }),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
