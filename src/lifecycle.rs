//! Process-wide start/stop/wait coordination.
//!
//! A [`Lifecycle`] owns a cancellation token and a task tracker. Long-running
//! components (the HTTP server, background work) register themselves with
//! [`Lifecycle::spawn`] and watch [`Lifecycle::child_token`]; whoever owns the
//! lifecycle calls [`Lifecycle::stop`] and then [`Lifecycle::wait`], which only
//! returns once every registered task has exited.
//!
//! # Example
//!
//! ```
//! use fetchkit_core::{Lifecycle, LifecycleState};
//!
//! # async fn example() {
//! let lifecycle = Lifecycle::new();
//! let token = lifecycle.child_token();
//! lifecycle.spawn("worker", async move {
//!     token.cancelled().await;
//! });
//!
//! lifecycle.stop();
//! lifecycle.wait().await;
//! assert_eq!(lifecycle.state(), LifecycleState::Stopped);
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Observable state of a [`Lifecycle`].
///
/// Transitions only go forward: `Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Work is being accepted.
    Running,
    /// Stop was signalled; dependents are winding down.
    Stopping,
    /// Every dependent has exited. Terminal.
    Stopped,
}

/// Coordinates stop signalling and shutdown waiting for dependent tasks.
///
/// Cloning is cheap; all clones control the same lifecycle.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    tracker: TaskTracker,
    state: watch::Sender<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Creates a lifecycle in the [`LifecycleState::Running`] state.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                state,
            }),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Returns a token cancelled when stop is signalled.
    ///
    /// Cancelling the child does not stop the lifecycle.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Resolves once stop has been signalled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Whether stop has been signalled.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Signals every dependent to stop.
    ///
    /// Only the first call moves the state to [`LifecycleState::Stopping`];
    /// later calls return `false` and change nothing.
    pub fn stop(&self) -> bool {
        let transitioned = self.inner.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Stopping;
                true
            } else {
                false
            }
        });

        if transitioned {
            info!(tasks = self.inner.tracker.len(), "lifecycle stopping");
            self.inner.token.cancel();
        }
        transitioned
    }

    /// Registers a dependent task.
    ///
    /// [`wait`](Self::wait) does not return until the task has exited, so the
    /// task must watch [`child_token`](Self::child_token) (or otherwise finish
    /// on its own) after [`stop`](Self::stop).
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.state() == LifecycleState::Stopped {
            warn!(task = name, "task registered after lifecycle stopped");
        }
        debug!(task = name, "registering lifecycle task");
        self.inner.tracker.spawn(async move {
            let output = task.await;
            debug!(task = name, "lifecycle task exited");
            output
        })
    }

    /// Registers a task that calls [`stop`](Self::stop) on Ctrl-C (and
    /// SIGTERM on Unix).
    pub fn stop_on_signal(&self) {
        let lifecycle = self.clone();
        self.spawn("signal-handler", async move {
            tokio::select! {
                () = lifecycle.cancelled() => {}
                () = shutdown_signal() => {
                    info!("shutdown signal received");
                    lifecycle.stop();
                }
            }
        });
    }

    /// Blocks until stop has been signalled and every registered task has
    /// exited, then moves to [`LifecycleState::Stopped`].
    pub async fn wait(&self) {
        self.inner.token.cancelled().await;

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let stopped = self.inner.state.send_if_modified(|state| {
            if *state == LifecycleState::Stopping {
                *state = LifecycleState::Stopped;
                true
            } else {
                false
            }
        });
        if stopped {
            info!("lifecycle stopped");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
