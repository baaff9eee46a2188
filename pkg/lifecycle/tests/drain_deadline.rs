use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

use lifecycle::{
    DrainConfig, ListenerControl, ShutdownCoordinator, ShutdownPhase, ShutdownState, StopError,
    StopReason, TerminationSignal,
};

#[derive(Default)]
struct FlagListener {
    stopped: AtomicBool,
}

impl ListenerControl for FlagListener {
    fn shutdown(&self, _hard_timeout: Duration) -> Result<(), StopError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn drain_config(deadline: Duration) -> DrainConfig {
    DrainConfig {
        graceful: true,
        drain_timeout: Some(deadline),
        pre_shutdown_delay: Duration::from_secs(10),
        poll_interval: Duration::from_millis(500),
        hard_timeout: Duration::from_secs(30),
    }
}

#[test]
fn idle_instance_stops_well_before_deadline() {
    let state = Arc::new(ShutdownState::new());
    let listener = Arc::new(FlagListener::default());
    let coordinator = ShutdownCoordinator::new(
        Arc::clone(&state),
        Arc::clone(&listener),
        drain_config(Duration::from_secs(5)),
    );
    let (tx, rx) = mpsc::channel();
    tx.send(TerminationSignal::Terminate)
        .expect("receiver should be alive");

    let started = Instant::now();
    let report = coordinator.run(rx);
    let elapsed = started.elapsed();

    assert_eq!(report.reason, StopReason::ConnectionsDrained);
    assert!(
        elapsed < Duration::from_millis(1_500),
        "idle drain took {elapsed:?}"
    );
    assert!(listener.stopped.load(Ordering::SeqCst));
    assert_eq!(state.phase(), ShutdownPhase::Stopped);
}

#[test]
fn connection_that_never_closes_is_forced_at_deadline() {
    let state = Arc::new(ShutdownState::new());
    let _never_closes = state.track_connection();
    let listener = Arc::new(FlagListener::default());
    let coordinator = ShutdownCoordinator::new(
        Arc::clone(&state),
        Arc::clone(&listener),
        drain_config(Duration::from_secs(2)),
    );

    let started = Instant::now();
    let report = coordinator.shutdown(Some(TerminationSignal::Terminate));
    let elapsed = started.elapsed();

    assert_eq!(report.reason, StopReason::DeadlineElapsed);
    assert!(elapsed >= Duration::from_secs(2), "stopped early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_800), "stopped late: {elapsed:?}");
    assert!(listener.stopped.load(Ordering::SeqCst));
    assert_eq!(state.connections().current_count(), 1);
}
