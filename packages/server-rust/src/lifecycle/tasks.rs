//! Background tasks sharing the server's lifetime.
//!
//! Every task receives a [`Lifetime`], a read-only view of the server's
//! cancellation token. Tasks are expected to return once it is cancelled.
//! The first task to fail (error or panic) cancels the token for everyone
//! and becomes the server's fatal cause.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::service::middleware::classify::panic_message;

// ---------------------------------------------------------------------------
// Lifetime
// ---------------------------------------------------------------------------

/// Read-only view of the shared cancellation token.
#[derive(Debug, Clone)]
pub struct Lifetime {
    token: CancellationToken,
}

impl Lifetime {
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the server starts shutting down.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// A token cancelled with the server that can also be cancelled on its
    /// own without affecting anything else.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

// ---------------------------------------------------------------------------
// BackgroundTask
// ---------------------------------------------------------------------------

/// Long-running work started with the server.
#[async_trait]
pub trait BackgroundTask: Send + 'static {
    /// Used in logs and task handles.
    fn name(&self) -> &str;

    /// Runs until the work is done or `lifetime` is cancelled. Returning
    /// `Ok` after cancellation is a clean stop.
    async fn run(&mut self, lifetime: Lifetime) -> anyhow::Result<()>;
}

/// A closure run as a background task.
pub struct FnTask<F> {
    name: String,
    body: Option<F>,
}

impl<F> FnTask<F> {
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body: Some(body),
        }
    }
}

#[async_trait]
impl<F, Fut> BackgroundTask for FnTask<F>
where
    F: FnOnce(Lifetime) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, lifetime: Lifetime) -> anyhow::Result<()> {
        let body = self
            .body
            .take()
            .ok_or_else(|| anyhow::anyhow!("task {} already ran", self.name))?;
        body(lifetime).await
    }
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Where a background task is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Registered; the server has not started it yet.
    Pending,
    Running,
    /// Returned `Ok`.
    Finished,
    /// Returned an error or panicked.
    Failed,
    /// Still running at the shutdown deadline.
    Aborted,
}

/// Observes one registered task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    state: Arc<ArcSwap<TaskState>>,
}

impl TaskHandle {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(ArcSwap::from_pointee(TaskState::Pending)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        **self.state.load()
    }

    fn set(&self, state: TaskState) {
        self.state.store(Arc::new(state));
    }
}

/// The failure that brought the server down.
#[derive(Debug, thiserror::Error)]
#[error("background task {task} failed")]
pub struct TaskFailure {
    pub task: String,
    #[source]
    pub source: anyhow::Error,
}

// ---------------------------------------------------------------------------
// TaskGroup
// ---------------------------------------------------------------------------

/// Structured group of background tasks on one cancellation token.
pub struct TaskGroup {
    token: CancellationToken,
    set: JoinSet<()>,
    handles: Vec<TaskHandle>,
    failure: Arc<Mutex<Option<TaskFailure>>>,
}

impl TaskGroup {
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            set: JoinSet::new(),
            handles: Vec::new(),
            failure: Arc::default(),
        }
    }

    /// Starts `task` on the runtime.
    pub fn spawn(&mut self, task: Box<dyn BackgroundTask>) -> TaskHandle {
        let handle = TaskHandle::new(task.name());
        self.spawn_with(task, handle.clone());
        handle
    }

    pub(crate) fn spawn_with(&mut self, mut task: Box<dyn BackgroundTask>, handle: TaskHandle) {
        let lifetime = Lifetime::new(self.token.clone());
        let token = self.token.clone();
        let failure = Arc::clone(&self.failure);
        self.handles.push(handle.clone());

        self.set.spawn(async move {
            handle.set(TaskState::Running);
            debug!(task = handle.name(), "Background task started");

            let outcome = match AssertUnwindSafe(task.run(lifetime)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(anyhow::anyhow!("panic: {}", panic_message(payload.as_ref()))),
            };

            match outcome {
                Ok(()) => {
                    handle.set(TaskState::Finished);
                    debug!(task = handle.name(), "Background task finished");
                }
                Err(source) => {
                    handle.set(TaskState::Failed);
                    error!(task = handle.name(), error = %format!("{source:#}"), "Background task failed");
                    failure.lock().get_or_insert(TaskFailure {
                        task: handle.name().to_string(),
                        source,
                    });
                    token.cancel();
                }
            }
        });
    }

    /// Number of tasks not yet joined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Waits for every task to return.
    ///
    /// # Errors
    ///
    /// Returns the first task failure, if any.
    pub async fn wait(&mut self) -> Result<(), TaskFailure> {
        while self.set.join_next().await.is_some() {}
        self.take_failure()
    }

    /// Waits for every task until `deadline`, then aborts the rest.
    ///
    /// # Errors
    ///
    /// Returns the first task failure, if any.
    pub async fn wait_until(&mut self, deadline: Instant) -> Result<(), TaskFailure> {
        let set = &mut self.set;
        let joined = tokio::time::timeout_at(deadline, async {
            while set.join_next().await.is_some() {}
        })
        .await;

        if joined.is_err() {
            warn!(
                remaining = self.set.len(),
                "Aborting background tasks still running at the shutdown deadline"
            );
            self.set.abort_all();
            while self.set.join_next().await.is_some() {}
            for handle in &self.handles {
                if handle.state() == TaskState::Running {
                    handle.set(TaskState::Aborted);
                }
            }
        }
        self.take_failure()
    }

    fn take_failure(&self) -> Result<(), TaskFailure> {
        match self.failure.lock().take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("running", &self.set.len())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
