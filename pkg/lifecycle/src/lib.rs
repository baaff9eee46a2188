mod coordinator;

use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
};

use thiserror::Error;
use tracing::warn;

pub use coordinator::{
    DEFAULT_DRAIN_POLL_INTERVAL, DEFAULT_DRAIN_TIMEOUT, DEFAULT_HARD_SHUTDOWN_TIMEOUT,
    DEFAULT_PRE_SHUTDOWN_DELAY, DrainConfig, ListenerControl, ShutdownCoordinator,
    ShutdownReport, StopError, StopReason, TerminationSignal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Stopped,
}

impl ShutdownPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Draining => 1,
            Self::Stopped => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Lifecycle hooks a transport invokes for every accepted connection.
///
/// Each `on_connection_opened` must be matched by exactly one
/// `on_connection_closed`, including abrupt resets, idle timeouts and
/// connections handed over to another protocol. [`ConnectionGuard`] enforces
/// the pairing through `Drop`.
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_opened(&self);
    fn on_connection_closed(&self);
}

/// Source of the live connection count consumed by the drain loop.
pub trait ConnectionCount: Send + Sync {
    fn live_connections(&self) -> Result<usize, CountError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CountError {
    #[error("connection count unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    live: AtomicUsize,
    opened_total: AtomicU64,
    unpaired_closes: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    /// Close events that arrived while the count was already zero.
    pub fn unpaired_closes(&self) -> u64 {
        self.unpaired_closes.load(Ordering::Relaxed)
    }
}

impl ConnectionObserver for ConnectionTracker {
    fn on_connection_opened(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.opened_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connection_closed(&self) {
        let decremented =
            self.live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                    live.checked_sub(1)
                });
        if decremented.is_err() {
            self.unpaired_closes.fetch_add(1, Ordering::Relaxed);
            warn!("connection close reported while no connections were live");
        }
    }
}

impl ConnectionCount for ConnectionTracker {
    fn live_connections(&self) -> Result<usize, CountError> {
        Ok(self.current_count())
    }
}

/// Emits the open event on construction and the close event on drop.
pub struct ConnectionGuard {
    observer: Arc<dyn ConnectionObserver>,
}

impl ConnectionGuard {
    pub fn open(observer: Arc<dyn ConnectionObserver>) -> Self {
        observer.on_connection_opened();
        Self { observer }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.observer.on_connection_closed();
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard").finish_non_exhaustive()
    }
}

/// Phase and live-connection count shared by the transport, the response
/// decorator, the readiness handler and the coordinator.
#[derive(Debug, Default)]
pub struct ShutdownState {
    phase: AtomicU8,
    connections: ConnectionTracker,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.phase().is_running()
    }

    /// `Running -> Draining`. Returns false when the phase had already moved on.
    pub fn begin_draining(&self) -> bool {
        self.transition(ShutdownPhase::Running, ShutdownPhase::Draining)
    }

    /// `Draining -> Stopped`. Only the first caller observes `true`.
    pub fn stop(&self) -> bool {
        self.transition(ShutdownPhase::Draining, ShutdownPhase::Stopped)
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        ConnectionGuard::open(Arc::clone(self) as Arc<dyn ConnectionObserver>)
    }

    fn transition(&self, from: ShutdownPhase, to: ShutdownPhase) -> bool {
        self.phase
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl ConnectionObserver for ShutdownState {
    fn on_connection_opened(&self) {
        self.connections.on_connection_opened();
    }

    fn on_connection_closed(&self) {
        self.connections.on_connection_closed();
    }
}

impl ConnectionCount for ShutdownState {
    fn live_connections(&self) -> Result<usize, CountError> {
        self.connections.live_connections()
    }
}
