use std::{
    io,
    sync::{Arc, mpsc},
    thread,
};

use demo_server::{
    config::{ServerConfig, TransportRuntime},
    transport::{DemoRuntime, serve_http},
};
use latency::format_duration;
use lifecycle::{ShutdownReport, ShutdownState, TerminationSignal};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::{error, info, warn};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("demo-server configuration error: {err}");
            std::process::exit(2);
        }
    };

    let bind_addr = config.bind_addr.clone();
    println!("demo-server transport listening on http://{bind_addr}");
    println!(
        "demo-server transport runtime: {}",
        config.transport_runtime.as_str()
    );
    println!("demo-server transport workers: {}", config.http_workers);
    println!(
        "demo-server graceful shutdown: {} (drain timeout {}, hard timeout {})",
        config.drain.graceful,
        config
            .drain
            .drain_timeout
            .map(format_duration)
            .unwrap_or_else(|| "disabled".to_string()),
        format_duration(config.drain.hard_timeout)
    );
    println!("demo-server readiness endpoint: http://{bind_addr}/ready");
    println!("demo-server latency endpoint: http://{bind_addr}/sleep?min=50ms&max=1s");
    println!("demo-server status endpoint: http://{bind_addr}/status?code=200");
    for service in &config.proxy_services {
        println!(
            "demo-server proxy endpoint: http://{bind_addr}/{}/ -> {}",
            service.name, service.authority
        );
    }

    let signals = match forward_termination_signals() {
        Ok(signals) => signals,
        Err(err) => {
            eprintln!("demo-server failed to install signal handlers: {err}");
            std::process::exit(1);
        }
    };

    let state = Arc::new(ShutdownState::new());
    let runtime = DemoRuntime::shared(&config, state);
    let report = match config.transport_runtime {
        TransportRuntime::Std => {
            serve_http(runtime, &bind_addr, config.drain.clone(), signals).map_err(|e| e.to_string())
        }
        TransportRuntime::Axum => {
            #[cfg(feature = "async-transport")]
            {
                demo_server::transport_axum::serve_http_with_axum(
                    runtime,
                    &bind_addr,
                    config.http_workers,
                    config.drain.clone(),
                    signals,
                )
            }
            #[cfg(not(feature = "async-transport"))]
            {
                let _ = (runtime, signals);
                eprintln!(
                    "demo-server transport runtime 'axum' requires build feature 'async-transport'"
                );
                std::process::exit(2);
            }
        }
    };

    match report {
        Ok(report) => log_report(&report),
        Err(err) => {
            eprintln!("demo-server transport failed: {err}");
            std::process::exit(1);
        }
    }
}

/// Maps SIGINT and SIGTERM onto the coordinator's channel. Only the first
/// signal starts a shutdown; later ones are logged and ignored.
fn forward_termination_signals() -> io::Result<mpsc::Receiver<TerminationSignal>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("demo-signals".to_string())
        .spawn(move || {
            let mut delivered = false;
            for raw in signals.forever() {
                let signal = match raw {
                    SIGINT => TerminationSignal::Interrupt,
                    _ => TerminationSignal::Terminate,
                };
                if delivered {
                    warn!(signal = signal.as_str(), "already shutting down, ignoring signal");
                    continue;
                }
                delivered = tx.send(signal).is_ok();
            }
        })?;
    Ok(rx)
}

fn log_report(report: &ShutdownReport) {
    match &report.stop_result {
        Ok(()) => info!(
            reason = report.reason.as_str(),
            drain = %format_duration(report.drain_elapsed),
            "server stopped"
        ),
        Err(err) => error!(
            reason = report.reason.as_str(),
            drain = %format_duration(report.drain_elapsed),
            %err,
            "server stopped with errors"
        ),
    }
}
