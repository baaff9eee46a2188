use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex, mpsc},
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderName, HeaderValue, Request, Response, StatusCode, Version},
    routing::any,
    serve::Listener,
};
use lifecycle::{
    ConnectionGuard, DrainConfig, ListenerControl, ShutdownCoordinator, ShutdownReport,
    ShutdownState, StopError, TerminationSignal,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::transport::{
    BufferedResponse, HttpRequest, HttpResponse, MAX_HTTP_BODY_BYTES, SharedRuntime,
    backpressure_response_bytes, handle_request,
};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

// Framing is recomputed by hyper from the collected body.
const SKIPPED_RESPONSE_HEADERS: [&str; 2] = ["content-length", "transfer-encoding"];

#[derive(Clone)]
struct AppState {
    runtime: SharedRuntime,
}

/// TCP listener that reports every accepted connection to a `ShutdownState`
/// until the connection is dropped.
pub struct TrackedListener {
    inner: TcpListener,
    state: Arc<ShutdownState>,
    max_connections: usize,
}

/// Accepted connection carrying its tracker registration.
pub struct TrackedStream {
    inner: TcpStream,
    _connection: ConnectionGuard,
}

impl TrackedListener {
    pub async fn bind(
        bind_addr: &str,
        state: Arc<ShutdownState>,
        max_connections: usize,
    ) -> io::Result<Self> {
        let inner = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            inner,
            state,
            max_connections: max_connections.max(1),
        })
    }
}

impl Listener for TrackedListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, peer) = match self.inner.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "transport accept error");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            let connection = self.state.track_connection();
            let live = self.state.connections().current_count();
            if live > self.max_connections {
                warn!(%peer, live, limit = self.max_connections, "connection limit reached, rejecting");
                tokio::spawn(reject(stream, connection));
                continue;
            }
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, %err, "failed to set TCP_NODELAY");
            }
            return (
                TrackedStream {
                    inner: stream,
                    _connection: connection,
                },
                peer,
            );
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

async fn reject(mut stream: TcpStream, connection: ConnectionGuard) {
    let written = match backpressure_response_bytes() {
        Ok(bytes) => stream.write_all(&bytes).await,
        Err(err) => Err(err),
    };
    if let Err(err) = written {
        debug!(%err, "transport backpressure response failed");
    }
    let _ = stream.shutdown().await;
    drop(connection);
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Stops the axum server from the shutdown coordinator's thread. Hyper closes
/// idle keep-alive connections itself once the stop is requested.
pub struct AxumServerHandle {
    state: Arc<ShutdownState>,
    stop: watch::Sender<bool>,
    finished: Mutex<mpsc::Receiver<Result<(), String>>>,
}

impl ListenerControl for AxumServerHandle {
    fn shutdown(&self, hard_timeout: Duration) -> Result<(), StopError> {
        let _ = self.stop.send(true);
        let finished = self
            .finished
            .lock()
            .map_err(|_| StopError::Failed("server status channel poisoned".to_string()))?;
        match finished.recv_timeout(hard_timeout) {
            Ok(result) => result.map_err(StopError::Failed),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(StopError::TimedOut {
                abandoned: self.state.connections().current_count(),
                timeout: hard_timeout,
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(StopError::Failed(
                "axum server exited without reporting".to_string(),
            )),
        }
    }
}

pub fn serve_http_with_axum(
    runtime: SharedRuntime,
    bind_addr: &str,
    worker_threads: usize,
    drain: DrainConfig,
    signals: mpsc::Receiver<TerminationSignal>,
) -> Result<ShutdownReport, String> {
    let worker_threads = worker_threads.max(1);
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;

    let state = Arc::clone(runtime.shutdown_state());
    let listener = tokio_runtime
        .block_on(TrackedListener::bind(
            bind_addr,
            Arc::clone(&state),
            runtime.max_connections(),
        ))
        .map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("failed to read local address: {e}"))?;
    info!(addr = %local_addr, worker_threads, "axum transport listening");

    let (stop_tx, stop_rx) = watch::channel(false);
    let (finished_tx, finished_rx) = mpsc::channel();
    let app = router(runtime);
    tokio_runtime.spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(stop_requested(stop_rx))
            .await
            .map_err(|e| format!("axum server failed: {e}"));
        let _ = finished_tx.send(result);
    });

    let handle = AxumServerHandle {
        state: Arc::clone(&state),
        stop: stop_tx,
        finished: Mutex::new(finished_rx),
    };
    let report = ShutdownCoordinator::new(state, handle, drain).run(signals);
    tokio_runtime.shutdown_background();
    Ok(report)
}

fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .fallback(any(dispatch))
        .with_state(AppState { runtime })
        .layer(axum::extract::DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES))
}

async fn stop_requested(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    let method = request.method().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let version = match request.version() {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
    .to_string();

    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let body = match to_bytes(request.into_body(), MAX_HTTP_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return response_from_transport(HttpResponse::bad_request(&format!(
                "request body error: {err}"
            )));
        }
    };

    let request = HttpRequest {
        method,
        target,
        version,
        headers,
        body,
    };

    // Handlers sleep and call upstreams synchronously.
    let runtime = Arc::clone(&state.runtime);
    let handled = tokio::task::spawn_blocking(move || {
        let mut response = BufferedResponse::new();
        let outcome = handle_request(&runtime, &request, &mut response);
        (response, outcome)
    })
    .await;

    match handled {
        Ok((response, Ok(()))) => response_from_buffer(response),
        Ok((_, Err(err))) => {
            warn!(%err, "handler failed while writing its response");
            response_from_transport(HttpResponse::bad_gateway("response relay failed"))
        }
        Err(err) => {
            warn!(%err, "handler task failed");
            response_from_transport(HttpResponse::error_with_status(
                500,
                "internal server error",
            ))
        }
    }
}

fn response_from_buffer(response: BufferedResponse) -> Response<Body> {
    let (status, headers, body) = response.into_parts();
    let mut out = Response::new(Body::from(body));
    *out.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in headers.iter() {
        if SKIPPED_RESPONSE_HEADERS
            .iter()
            .any(|skipped| name.eq_ignore_ascii_case(skipped))
        {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().append(name, value);
            }
            _ => debug!(name, "dropping unrepresentable response header"),
        }
    }
    out
}

fn response_from_transport(response: HttpResponse) -> Response<Body> {
    let mut buffered = BufferedResponse::new();
    match response.write_to(&mut buffered) {
        Ok(()) => response_from_buffer(buffered),
        Err(_) => {
            let mut out = Response::new(Body::empty());
            *out.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::transport::DemoRuntime;
    use axum::http::header::{CONNECTION, CONTENT_TYPE};

    fn sample_state(graceful: bool) -> AppState {
        let mut config = ServerConfig::default();
        config.drain.graceful = graceful;
        AppState {
            runtime: DemoRuntime::shared(&config, Arc::new(ShutdownState::new())),
        }
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), MAX_HTTP_BODY_BYTES)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn dispatch_ready_returns_ok_while_running() {
        let response = dispatch(State(sample_state(true)), get("/ready")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONNECTION).is_none());
        assert_eq!(body_text(response).await, "OK");
    }

    #[tokio::test]
    async fn dispatch_ready_reports_unavailable_with_close_once_draining() {
        let state = sample_state(true);
        state.runtime.shutdown_state().begin_draining();

        let response = dispatch(State(state), get("/ready")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn dispatch_status_marks_connection_close_while_draining() {
        let state = sample_state(true);
        state.runtime.shutdown_state().begin_draining();

        let response = dispatch(State(state), get("/status?code=418")).await;

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers().get_all(CONNECTION).iter().count(), 1);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_text(response).await, "Returned status code 418\n");
    }

    #[tokio::test]
    async fn dispatch_leaves_connection_alone_without_graceful_shutdown() {
        let state = sample_state(false);
        state.runtime.shutdown_state().begin_draining();

        let response = dispatch(State(state), get("/status?code=200")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONNECTION).is_none());
    }

    #[tokio::test]
    async fn dispatch_sleep_reports_sampled_delay() {
        let response = dispatch(State(sample_state(true)), get("/sleep?min=1ms&max=1ms")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("last-modified").is_some());
        assert_eq!(body_text(response).await, "Slept for 1ms\n");
    }

    #[tokio::test]
    async fn dispatch_unknown_path_is_not_found() {
        let response = dispatch(State(sample_state(true)), get("/missing")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "404 page not found\n");
    }

    #[tokio::test]
    async fn tracked_listener_counts_connections_until_dropped() {
        let state = Arc::new(ShutdownState::new());
        let mut listener = TrackedListener::bind("127.0.0.1:0", Arc::clone(&state), 8)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await;
        assert_eq!(state.connections().current_count(), 1);

        drop(accepted);
        drop(client);
        assert_eq!(state.connections().current_count(), 0);
    }

    #[tokio::test]
    async fn tracked_listener_rejects_connections_over_the_limit() {
        use tokio::io::AsyncReadExt;

        let state = Arc::new(ShutdownState::new());
        let mut listener = TrackedListener::bind("127.0.0.1:0", Arc::clone(&state), 1)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _first_client = TcpStream::connect(addr).await.unwrap();
        let (_first, _) = listener.accept().await;

        let mut second_client = TcpStream::connect(addr).await.unwrap();
        let accept_more = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut raw = Vec::new();
        second_client.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        accept_more.abort();
    }
}
