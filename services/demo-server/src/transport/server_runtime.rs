use super::*;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct ListenerState {
    closing: AtomicBool,
    in_flight: AtomicUsize,
}

impl ListenerState {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Counts a request as in flight unless the listener is closing. The
    /// counter is raised before `closing` is read, so a concurrent
    /// [`ServerHandle`] stop either waits for this request or refuses it.
    fn begin_request(&self) -> Option<InFlightRequest<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let request = InFlightRequest {
            in_flight: &self.in_flight,
        };
        if self.is_closing() {
            return None;
        }
        Some(request)
    }
}

struct InFlightRequest<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for InFlightRequest<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Ready,
    PeerClosed,
    IdleTimeout,
    ListenerClosed,
}

/// Keep-alive HTTP/1.1 server with one thread per connection. Every accepted
/// connection is reported to the runtime's `ShutdownState` for as long as its
/// thread lives, rejected ones included.
pub struct HttpServer {
    listener: TcpListener,
    runtime: SharedRuntime,
    control: Arc<ListenerState>,
}

/// Stops an [`HttpServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    control: Arc<ListenerState>,
}

impl HttpServer {
    pub fn bind(runtime: SharedRuntime, bind_addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            runtime,
            control: Arc::new(ListenerState::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Accepts until a [`ServerHandle`] stops the listener. Connection threads
    /// still serving a request at that point are not joined.
    pub fn serve(self) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        debug!(%local_addr, "accept loop started");
        while !self.control.is_closing() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%err, "transport accept error");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
        drop(self.listener);
        info!(%local_addr, "listener closed");
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let connection = self.runtime.shutdown_state().track_connection();
        let live = self.runtime.shutdown_state().connections().current_count();
        if live > self.runtime.max_connections() {
            warn!(
                %peer,
                live,
                limit = self.runtime.max_connections(),
                "connection limit reached, rejecting"
            );
            let rejected = stream
                .set_nonblocking(false)
                .and_then(|()| write_backpressure_response(&stream, SOCKET_TIMEOUT));
            if let Err(err) = rejected {
                debug!(%peer, %err, "transport backpressure response failed");
            }
            return;
        }

        let runtime = Arc::clone(&self.runtime);
        let control = Arc::clone(&self.control);
        let spawned = thread::Builder::new()
            .name("demo-http-conn".to_string())
            .spawn(move || {
                let _connection = connection;
                if let Err(err) = handle_connection(&runtime, &control, &stream) {
                    debug!(%peer, %err, "connection ended with error");
                }
            });
        if let Err(err) = spawned {
            error!(%peer, %err, "failed to spawn connection thread");
        }
    }
}

impl ServerHandle {
    pub fn in_flight(&self) -> usize {
        self.control.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.control.is_closing()
    }
}

impl ListenerControl for ServerHandle {
    /// Closes the listener and every idle keep-alive connection, then waits
    /// for in-flight requests to finish.
    fn shutdown(&self, hard_timeout: Duration) -> Result<(), StopError> {
        self.control.closing.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + hard_timeout;
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StopError::TimedOut {
                    abandoned: in_flight,
                    timeout: hard_timeout,
                });
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
    }
}

fn handle_connection(
    runtime: &DemoRuntime,
    control: &ListenerState,
    stream: &TcpStream,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;
    let mut reader = BufReader::new(stream);

    loop {
        match wait_for_request(&mut reader, stream, runtime.idle_timeout(), control)? {
            WaitOutcome::Ready => {}
            outcome => {
                debug!(?outcome, "closing keep-alive connection");
                return Ok(());
            }
        }

        let Some(_in_flight) = control.begin_request() else {
            debug!("listener closed before the request was read");
            return Ok(());
        };
        stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        let request = match read_http_request(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!(%err, "rejecting malformed request");
                let mut response = WireResponse::new(BufWriter::new(stream)).close_after(true);
                HttpResponse::bad_request(&err).write_to(&mut response)?;
                return response.finish();
            }
        };

        let mut response =
            WireResponse::for_request(BufWriter::new(stream), &request, control.is_closing());
        handle_request(runtime, &request, &mut response)?;
        response.finish()?;
        if response.closes_connection() {
            return Ok(());
        }
    }
}

fn wait_for_request(
    reader: &mut BufReader<&TcpStream>,
    stream: &TcpStream,
    idle_timeout: Duration,
    control: &ListenerState,
) -> io::Result<WaitOutcome> {
    if !reader.buffer().is_empty() {
        return Ok(WaitOutcome::Ready);
    }
    stream.set_read_timeout(Some(IDLE_POLL_INTERVAL))?;
    let idle_since = Instant::now();
    loop {
        if control.is_closing() {
            return Ok(WaitOutcome::ListenerClosed);
        }
        match reader.fill_buf() {
            Ok(buffer) if buffer.is_empty() => return Ok(WaitOutcome::PeerClosed),
            Ok(_) => return Ok(WaitOutcome::Ready),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                if !idle_timeout.is_zero() && idle_since.elapsed() >= idle_timeout {
                    return Ok(WaitOutcome::IdleTimeout);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}
