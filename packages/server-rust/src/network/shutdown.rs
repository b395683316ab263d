//! Per-port shutdown state with in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards for accurate in-flight request tracking.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

/// Process-wide drain order. Tickets let callers (and tests) check which
/// port started draining first.
static DRAIN_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a listen port.
///
/// State machine: Unbound -> Bound -> Draining -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Configured, no socket yet.
    Unbound,
    /// Socket bound; accepting once served.
    Bound,
    /// No new connections; in-flight requests finishing.
    Draining,
    Closed,
}

impl PortState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address a port ended up listening on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ArcSwap<PortState>,
    in_flight: AtomicU64,
    drain_ticket: OnceLock<u64>,
    local_addr: OnceLock<LocalAddr>,
    forced: CancellationToken,
}

/// Shared view of one port's shutdown progress.
///
/// Cheap to clone. The port owns the transitions; middleware holds a clone
/// for in-flight tracking, and callers may keep one to observe the port
/// after it has been handed to a server.
#[derive(Debug, Clone)]
pub struct PortStatus {
    inner: Arc<Inner>,
}

impl PortStatus {
    /// Creates a status in the `Unbound` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: ArcSwap::from_pointee(PortState::Unbound),
                in_flight: AtomicU64::new(0),
                drain_ticket: OnceLock::new(),
                local_addr: OnceLock::new(),
                forced: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> PortState {
        **self.inner.state.load()
    }

    pub(crate) fn set_bound(&self, addr: LocalAddr) {
        let _ = self.inner.local_addr.set(addr);
        self.inner.state.store(Arc::new(PortState::Bound));
    }

    /// Moves to `Draining` and stamps the drain ticket. Repeated calls keep
    /// the first ticket.
    pub(crate) fn begin_drain(&self) -> u64 {
        let ticket = *self
            .inner
            .drain_ticket
            .get_or_init(|| DRAIN_SEQUENCE.fetch_add(1, Ordering::SeqCst));
        if self.state() != PortState::Closed {
            self.inner.state.store(Arc::new(PortState::Draining));
        }
        ticket
    }

    pub(crate) fn set_closed(&self) {
        self.inner.state.store(Arc::new(PortState::Closed));
    }

    /// Position of this port in the process-wide drain order; `None` until
    /// it starts draining.
    #[must_use]
    pub fn drain_ticket(&self) -> Option<u64> {
        self.inner.drain_ticket.get().copied()
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<&LocalAddr> {
        self.inner.local_addr.get()
    }

    /// Creates an RAII guard that tracks an in-flight request.
    ///
    /// The in-flight counter is incremented on creation and decremented
    /// when the guard is dropped, even if the handler panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            status: self.clone(),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// Aborts every request still in flight.
    pub(crate) fn force(&self) {
        self.inner.forced.cancel();
    }

    /// Cancelled once the port gives up on graceful completion.
    #[must_use]
    pub fn forced(&self) -> CancellationToken {
        self.inner.forced.clone()
    }

    /// Waits for all in-flight requests to complete, up to the given timeout.
    ///
    /// Returns `false` if the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight_count() == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for PortStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    status: PortStatus,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.status.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_unbound() {
        let status = PortStatus::new();
        assert_eq!(status.state(), PortState::Unbound);
        assert_eq!(status.in_flight_count(), 0);
        assert!(status.drain_ticket().is_none());
        assert!(status.local_addr().is_none());
    }

    #[test]
    fn state_transitions_unbound_bound_draining_closed() {
        let status = PortStatus::new();
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        status.set_bound(LocalAddr::Tcp(addr));
        assert_eq!(status.state(), PortState::Bound);
        assert_eq!(status.local_addr(), Some(&LocalAddr::Tcp(addr)));

        status.begin_drain();
        assert_eq!(status.state(), PortState::Draining);

        status.set_closed();
        assert_eq!(status.state(), PortState::Closed);
        assert_eq!(status.state().to_string(), "closed");
    }

    #[test]
    fn drain_tickets_are_ordered_and_stable() {
        let first = PortStatus::new();
        let second = PortStatus::new();

        let a = first.begin_drain();
        let b = second.begin_drain();
        assert!(a < b);
        assert_eq!(first.begin_drain(), a);
        assert_eq!(first.drain_ticket(), Some(a));
    }

    #[test]
    fn draining_a_closed_port_keeps_it_closed() {
        let status = PortStatus::new();
        status.set_closed();
        status.begin_drain();
        assert_eq!(status.state(), PortState::Closed);
    }

    #[test]
    fn in_flight_guard_increments_and_decrements() {
        let status = PortStatus::new();

        let guard1 = status.in_flight_guard();
        let guard2 = status.clone().in_flight_guard();
        assert_eq!(status.in_flight_count(), 2);

        drop(guard1);
        assert_eq!(status.in_flight_count(), 1);

        drop(guard2);
        assert_eq!(status.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_drain_with_active_requests() {
        let status = PortStatus::new();
        let guard = status.in_flight_guard();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(status.wait_for_drain(Duration::from_secs(2)).await);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_timeout() {
        let status = PortStatus::new();
        let _guard = status.in_flight_guard();
        assert!(!status.wait_for_drain(Duration::from_millis(50)).await);
    }

    #[test]
    fn force_cancels_shared_token() {
        let status = PortStatus::new();
        let token = status.forced();
        assert!(!token.is_cancelled());
        status.force();
        assert!(token.is_cancelled());
    }

    #[test]
    fn unix_addresses_display_with_scheme() {
        let addr = LocalAddr::Unix(PathBuf::from("/tmp/app.sock"));
        assert_eq!(addr.to_string(), "unix:/tmp/app.sock");
    }
}
