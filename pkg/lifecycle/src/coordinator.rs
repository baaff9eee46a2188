use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{ConnectionCount, ShutdownPhase, ShutdownState};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_PRE_SHUTDOWN_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_HARD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl TerminationSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminated",
        }
    }
}

/// The listener side of shutdown: stop accepting, then wait for in-flight
/// requests up to `hard_timeout`.
pub trait ListenerControl: Send + Sync {
    fn shutdown(&self, hard_timeout: Duration) -> Result<(), StopError>;
}

impl<T: ListenerControl + ?Sized> ListenerControl for Arc<T> {
    fn shutdown(&self, hard_timeout: Duration) -> Result<(), StopError> {
        (**self).shutdown(hard_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopError {
    #[error("{abandoned} requests still in flight after {timeout:?}; abandoning them")]
    TimedOut { abandoned: usize, timeout: Duration },
    #[error("listener stop failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainConfig {
    pub graceful: bool,
    /// `None` disables the drain loop even when `graceful` is set.
    pub drain_timeout: Option<Duration>,
    pub pre_shutdown_delay: Duration,
    pub poll_interval: Duration,
    pub hard_timeout: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            graceful: false,
            drain_timeout: Some(DEFAULT_DRAIN_TIMEOUT),
            pre_shutdown_delay: DEFAULT_PRE_SHUTDOWN_DELAY,
            poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
            hard_timeout: DEFAULT_HARD_SHUTDOWN_TIMEOUT,
        }
    }
}

impl DrainConfig {
    pub fn drain_window(&self) -> Option<Duration> {
        if !self.graceful {
            return None;
        }
        self.drain_timeout.filter(|window| !window.is_zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ConnectionsDrained,
    DeadlineElapsed,
    DrainDisabled,
    AlreadyStopped,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionsDrained => "connections_drained",
            Self::DeadlineElapsed => "deadline_elapsed",
            Self::DrainDisabled => "drain_disabled",
            Self::AlreadyStopped => "already_stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub signal: Option<TerminationSignal>,
    pub reason: StopReason,
    pub drain_elapsed: Duration,
    pub stop_result: Result<(), StopError>,
}

pub struct ShutdownCoordinator<L> {
    state: Arc<ShutdownState>,
    counter: Arc<dyn ConnectionCount>,
    listener: L,
    config: DrainConfig,
}

impl<L: ListenerControl> ShutdownCoordinator<L> {
    pub fn new(state: Arc<ShutdownState>, listener: L, config: DrainConfig) -> Self {
        let counter = Arc::clone(&state) as Arc<dyn ConnectionCount>;
        Self {
            state,
            counter,
            listener,
            config,
        }
    }

    /// Replaces the live-count source read by the drain loop.
    pub fn with_connection_count(mut self, counter: Arc<dyn ConnectionCount>) -> Self {
        self.counter = counter;
        self
    }

    pub fn state(&self) -> &Arc<ShutdownState> {
        &self.state
    }

    /// Blocks until a termination signal arrives (or every sender is gone),
    /// then runs the shutdown sequence to completion.
    pub fn run(self, signals: mpsc::Receiver<TerminationSignal>) -> ShutdownReport {
        let signal = signals.recv().ok();
        match signal {
            Some(signal) => info!(signal = signal.as_str(), "received signal"),
            None => info!("termination channel closed; shutting down"),
        }
        self.shutdown(signal)
    }

    pub fn shutdown(&self, signal: Option<TerminationSignal>) -> ShutdownReport {
        if !self.state.begin_draining() {
            debug!(
                phase = self.state.phase().as_str(),
                "shutdown requested after the phase already advanced"
            );
        }

        let started_at = Instant::now();
        let reason = match self.config.drain_window() {
            Some(window) => {
                info!(deadline = ?window, "initiating graceful shutdown");
                self.drain(window)
            }
            None => {
                let delay = self.config.pre_shutdown_delay;
                if !delay.is_zero() {
                    info!(delay = ?delay, "sleeping before starting shutdown");
                    thread::sleep(delay);
                }
                if self.state.stop() {
                    StopReason::DrainDisabled
                } else {
                    StopReason::AlreadyStopped
                }
            }
        };
        let drain_elapsed = started_at.elapsed();

        info!(
            reason = reason.as_str(),
            drain_ms = drain_elapsed.as_millis() as u64,
            "shutting down server"
        );
        let stop_result = self.listener.shutdown(self.config.hard_timeout);
        match &stop_result {
            Ok(()) => info!("server exited properly"),
            Err(err) => warn!(%err, "server shutdown error"),
        }

        ShutdownReport {
            signal,
            reason,
            drain_elapsed,
            stop_result,
        }
    }

    // The poller and the deadline timer each wait on their own cancellation
    // channel and race on `ShutdownState::stop`; the loser's channel is
    // released when the winner's thread exits.
    fn drain(&self, deadline: Duration) -> StopReason {
        let state = self.state.as_ref();
        let counter = self.counter.as_ref();
        let poll_interval = self.config.poll_interval.max(MIN_DRAIN_POLL_INTERVAL);
        let (outcome_tx, outcome_rx) = mpsc::channel::<StopReason>();
        let (deadline_cancel_tx, deadline_cancel_rx) = mpsc::channel::<()>();
        let (poll_cancel_tx, poll_cancel_rx) = mpsc::channel::<()>();

        thread::scope(|scope| {
            let deadline_outcome = outcome_tx.clone();
            scope.spawn(move || {
                let _release_poller = poll_cancel_tx;
                if let Err(mpsc::RecvTimeoutError::Timeout) =
                    deadline_cancel_rx.recv_timeout(deadline)
                    && state.stop()
                {
                    warn!(
                        deadline = ?deadline,
                        live = state.connections().current_count(),
                        "graceful shutdown timeout reached, forcing exit"
                    );
                    let _ = deadline_outcome.send(StopReason::DeadlineElapsed);
                }
            });

            let poll_outcome = outcome_tx;
            scope.spawn(move || {
                let _release_deadline = deadline_cancel_tx;
                loop {
                    match poll_cancel_rx.recv_timeout(poll_interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                    }
                    if state.phase() != ShutdownPhase::Draining {
                        break;
                    }
                    match counter.live_connections() {
                        Ok(0) => {
                            if state.stop() {
                                info!("no active connections remaining");
                                let _ = poll_outcome.send(StopReason::ConnectionsDrained);
                            }
                            break;
                        }
                        Ok(live) => info!(live, "active connections remaining"),
                        Err(err) => {
                            warn!(%err, "failed to read live connection count; still waiting")
                        }
                    }
                }
            });
        });

        outcome_rx.try_recv().unwrap_or(StopReason::AlreadyStopped)
    }
}
