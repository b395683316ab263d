//! Per-call cancellation context.
//!
//! A `CallContext` is a cancellation token plus an optional absolute
//! deadline. Derived contexts are children: cancelling a parent cancels every
//! descendant, and a child's deadline never exceeds its parent's. The context
//! remembers *why* it was cancelled so callers can tell a peer disconnect
//! (`Canceled`) from an elapsed deadline (`DeadlineExceeded`).

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Why a context stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

struct Inner {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<ContextError>,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn cancel_with(&self, cause: ContextError) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    /// Cancels with `DeadlineExceeded` if the deadline has elapsed.
    fn check_deadline(&self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                if !self.token.is_cancelled() {
                    self.cancel_with(ContextError::DeadlineExceeded);
                }
                true
            }
            _ => false,
        }
    }
}

/// Cancellation context carried by every call.
///
/// Cheap to clone; clones share the same cancellation state.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<Inner>,
}

impl CallContext {
    /// Root context with no deadline. Only `cancel()` ends it.
    #[must_use]
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                deadline: None,
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derives a child bounded by `deadline` (or the parent's, if earlier).
    ///
    /// The returned handle is the deferred cancel: dropping it cancels the
    /// child, releasing the bound on every exit path.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> (CallContext, DeadlineHandle) {
        let deadline = match self.inner.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        let child = Arc::new(Inner {
            token: self.inner.token.child_token(),
            deadline: Some(deadline),
            cause: OnceLock::new(),
            parent: Some(Arc::clone(&self.inner)),
        });
        let guard = DeadlineHandle {
            _guard: child.token.clone().drop_guard(),
        };
        (CallContext { inner: child }, guard)
    }

    /// Derives a child bounded by `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> (CallContext, DeadlineHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Effective deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancels this context and its descendants as a peer disconnect.
    ///
    /// Idempotent; a context never becomes live again.
    pub fn cancel(&self) {
        self.inner.cancel_with(ContextError::Canceled);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled() || self.inner.check_deadline()
    }

    /// `None` while live; otherwise why the context ended.
    ///
    /// A context cancelled through an ancestor reports the ancestor's cause.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        if !self.is_cancelled() {
            return None;
        }
        let mut node = Some(&self.inner);
        while let Some(inner) = node {
            if let Some(cause) = inner.cause.get() {
                return Some(*cause);
            }
            node = inner.parent.as_ref();
        }
        Some(ContextError::Canceled)
    }

    /// Resolves once the context is cancelled or its deadline elapses.
    pub async fn cancelled(&self) {
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.inner.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {
                        self.inner.check_deadline();
                    }
                }
            }
            None => self.inner.token.cancelled().await,
        }
    }

    /// Guard that cancels the context when dropped, unless disarmed.
    ///
    /// Transports hold one per request so a dropped response future (the
    /// peer went away) cancels the call.
    #[must_use]
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            ctx: Some(self.clone()),
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

/// Releases a derived deadline when dropped.
pub struct DeadlineHandle {
    _guard: DropGuard,
}

impl std::fmt::Debug for DeadlineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineHandle").finish_non_exhaustive()
    }
}

/// Cancels a context as `Canceled` on drop.
#[derive(Debug)]
pub struct CancelOnDrop {
    ctx: Option<CallContext>,
}

impl CancelOnDrop {
    /// Keeps the context live after the guard is dropped.
    pub fn disarm(mut self) {
        self.ctx = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.cancel();
        }
    }
}
