use std::{
    io::{self, BufRead, BufReader, BufWriter},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use lifecycle::{
    DrainConfig, ListenerControl, ShutdownCoordinator, ShutdownReport, ShutdownState, StopError,
    TerminationSignal,
};
use tracing::{debug, error, info, warn};

use crate::config::{ProxyService, ServerConfig};

mod chunked;
mod decorator;
mod http;
mod proxy;
mod request;
mod routes;
mod server_runtime;
mod upstream;

pub use chunked::ChunkedReader;
pub use decorator::ConnectionCloseWriter;
pub use http::{BufferedResponse, Headers, ResponseWriter, WireResponse, status_reason};
pub use proxy::TRACE_HEADERS;
pub use server_runtime::{HttpServer, ServerHandle};
pub use upstream::{
    BodyFraming, ResponseHead, UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse,
    read_response_head,
};

#[cfg(feature = "async-transport")]
pub(crate) use http::backpressure_response_bytes;
pub(crate) use http::{HttpRequest, HttpResponse, write_backpressure_response};
pub(crate) use request::read_http_request;
pub(crate) use routes::handle_request;

pub const MAX_HTTP_BODY_BYTES: usize = 1024 * 1024;
pub(crate) const MAX_HEADER_BYTES: usize = 64 * 1024;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a request handler needs: the shared shutdown state, whether
/// responses are decorated while draining, and the proxy relay.
pub struct DemoRuntime {
    shutdown: Arc<ShutdownState>,
    graceful_shutdown: bool,
    idle_timeout: Duration,
    max_connections: usize,
    proxy_services: Vec<ProxyService>,
    upstream: UpstreamClient,
}

pub type SharedRuntime = Arc<DemoRuntime>;

impl DemoRuntime {
    pub fn new(config: &ServerConfig, shutdown: Arc<ShutdownState>) -> Self {
        Self {
            shutdown,
            graceful_shutdown: config.drain.graceful,
            idle_timeout: config.idle_timeout,
            max_connections: config.max_connections.max(1),
            proxy_services: config.proxy_services.clone(),
            upstream: UpstreamClient::new(config.upstream.clone()),
        }
    }

    pub fn shared(config: &ServerConfig, shutdown: Arc<ShutdownState>) -> SharedRuntime {
        Arc::new(Self::new(config, shutdown))
    }

    pub fn shutdown_state(&self) -> &Arc<ShutdownState> {
        &self.shutdown
    }

    pub fn graceful_shutdown(&self) -> bool {
        self.graceful_shutdown
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub(crate) fn proxy_service(&self, name: &str) -> Option<&ProxyService> {
        self.proxy_services
            .iter()
            .find(|service| service.name == name)
    }
}

/// Serves on `bind_addr` until a termination signal arrives, then runs the
/// shutdown sequence to completion and returns its report.
pub fn serve_http(
    runtime: SharedRuntime,
    bind_addr: &str,
    drain: DrainConfig,
    signals: mpsc::Receiver<TerminationSignal>,
) -> io::Result<ShutdownReport> {
    let server = HttpServer::bind(Arc::clone(&runtime), bind_addr)?;
    info!(addr = %server.local_addr()?, "transport listening");
    let handle = server.handle();
    let accept_loop = thread::Builder::new()
        .name("demo-http-accept".to_string())
        .spawn(move || server.serve())?;

    let coordinator =
        ShutdownCoordinator::new(Arc::clone(runtime.shutdown_state()), handle, drain);
    let report = coordinator.run(signals);

    match accept_loop.join() {
        Ok(result) => result?,
        Err(_) => return Err(io::Error::other("accept loop panicked")),
    }
    Ok(report)
}

/// Parses one raw request, routes it and returns the bytes that would go on
/// the wire.
pub fn handle_http_request_bytes(
    runtime: &SharedRuntime,
    raw_request: &[u8],
) -> Result<Vec<u8>, String> {
    let mut reader = raw_request;
    let request =
        read_http_request(&mut reader)?.ok_or_else(|| "missing request line".to_string())?;

    let mut response = WireResponse::for_request(Vec::new(), &request, false);
    handle_request(runtime, &request, &mut response).map_err(|e| e.to_string())?;
    response.finish().map_err(|e| e.to_string())?;
    Ok(response.into_inner())
}
