//! Crash containment for runner calls.
//!
//! Every call gets its own freshly created [`SidecarChannel`] running on its
//! own task. Tasks are never restarted: by the time one ends its caller has
//! either received the result or failed over. A panic inside one task only
//! fails the caller that owns it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info};

use crate::channel::{SidecarChannel, SidecarRequest};
use crate::locator::ScriptLocator;
use crate::message::ProgressUpdate;
use crate::{Result, SidecarError};

/// Counters describing supervisor activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub spawned: u64,
    pub active: usize,
    pub crashed: u64,
    pub timed_out: u64,
}

#[derive(Debug)]
struct Inner {
    locator: ScriptLocator,
    cancellation_token: CancellationToken,
    spawned: AtomicU64,
    active: AtomicUsize,
    crashed: AtomicU64,
    timed_out: AtomicU64,
}

/// Spawns one isolated, temporary channel task per call.
#[derive(Debug, Clone)]
pub struct ChannelSupervisor {
    inner: Arc<Inner>,
}

struct ActiveGuard(Arc<Inner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ChannelSupervisor {
    pub fn new(locator: ScriptLocator) -> Self {
        Self::with_cancellation(locator, CancellationToken::new())
    }

    /// Create a supervisor whose calls are cancelled together with `token`.
    pub fn with_cancellation(locator: ScriptLocator, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                locator,
                cancellation_token: token,
                spawned: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                crashed: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
            }),
        }
    }

    pub fn locator(&self) -> &ScriptLocator {
        &self.inner.locator
    }

    /// Run one runner call on a fresh channel.
    pub async fn invoke(
        &self,
        request: SidecarRequest,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<Value> {
        let channel = SidecarChannel::new(self.inner.locator.clone());
        let script = request.script.clone();
        debug!(script = %script, "Starting isolated runner task");

        let result = self
            .run_isolated(async move { channel.invoke(request, progress).await })
            .await;

        if matches!(result, Err(SidecarError::Timeout { .. })) {
            self.inner.timed_out.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Run `task` on its own tokio task.
    ///
    /// Panics surface as [`SidecarError::Crashed`]; shutdown surfaces as
    /// [`SidecarError::Cancelled`]. Dropping the returned future aborts the
    /// task, which drops any child process it owns.
    pub async fn run_isolated<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.cancellation_token.is_cancelled() {
            return Err(SidecarError::Cancelled);
        }

        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.inner.clone());
        let token = self.inner.cancellation_token.child_token();

        let handle = AbortOnDropHandle::new(tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = token.cancelled() => Err(SidecarError::Cancelled),
                result = task => result,
            }
        }));

        match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                self.inner.crashed.fetch_add(1, Ordering::Relaxed);
                let reason = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "task aborted".to_string()
                };
                error!(reason = %reason, "Runner task crashed");
                Err(SidecarError::Crashed(reason))
            }
        }
    }

    /// Cancel every in-flight call and refuse new ones.
    pub fn shutdown(&self) {
        if !self.inner.cancellation_token.is_cancelled() {
            info!(
                active = self.inner.active.load(Ordering::SeqCst),
                "Shutting down channel supervisor"
            );
            self.inner.cancellation_token.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancellation_token.is_cancelled()
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            spawned: self.inner.spawned.load(Ordering::Relaxed),
            active: self.inner.active.load(Ordering::SeqCst),
            crashed: self.inner.crashed.load(Ordering::Relaxed),
            timed_out: self.inner.timed_out.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
