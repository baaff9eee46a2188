use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use demo_server::{
    config::ServerConfig,
    transport::{
        BodyFraming, ChunkedReader, DemoRuntime, HttpServer, ResponseHead, ServerHandle,
        SharedRuntime, read_response_head,
    },
};
use lifecycle::{
    DrainConfig, ListenerControl, ShutdownCoordinator, ShutdownPhase, ShutdownState, StopError,
    StopReason, TerminationSignal,
};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningServer {
    addr: SocketAddr,
    runtime: SharedRuntime,
    handle: ServerHandle,
    accept_loop: JoinHandle<io::Result<()>>,
}

impl RunningServer {
    fn start(graceful: bool, max_connections: usize) -> Self {
        let mut config = ServerConfig::default();
        config.drain.graceful = graceful;
        config.max_connections = max_connections;
        config.proxy_services = Vec::new();
        let runtime = DemoRuntime::shared(&config, Arc::new(ShutdownState::new()));
        let server = HttpServer::bind(Arc::clone(&runtime), "127.0.0.1:0")
            .expect("loopback bind should succeed");
        let addr = server.local_addr().expect("bound listener has an address");
        let handle = server.handle();
        let accept_loop = thread::spawn(move || server.serve());
        Self {
            addr,
            runtime,
            handle,
            accept_loop,
        }
    }

    fn state(&self) -> &ShutdownState {
        self.runtime.shutdown_state()
    }

    fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.addr).expect("server should accept");
        stream
            .set_read_timeout(Some(CLIENT_TIMEOUT))
            .expect("read timeout");
        Client {
            reader: BufReader::new(stream),
        }
    }

    fn join(self) {
        self.accept_loop
            .join()
            .expect("accept loop should not panic")
            .expect("accept loop should exit cleanly");
    }
}

struct Client {
    reader: BufReader<TcpStream>,
}

struct Reply {
    head: ResponseHead,
    body: String,
}

impl Client {
    fn send(&mut self, method: &str, target: &str) -> Reply {
        let request = format!("{method} {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        self.reader
            .get_mut()
            .write_all(request.as_bytes())
            .expect("request should be written");
        self.read_reply(method)
    }

    fn read_reply(&mut self, method: &str) -> Reply {
        let head = read_response_head(&mut self.reader).expect("response head");
        let mut body = Vec::new();
        match head.body_framing(method) {
            BodyFraming::Empty => {}
            BodyFraming::Length(length) => {
                body.resize(length as usize, 0);
                self.reader.read_exact(&mut body).expect("sized body");
            }
            BodyFraming::Chunked => {
                ChunkedReader::new(&mut self.reader)
                    .read_to_end(&mut body)
                    .expect("chunked body");
            }
            BodyFraming::UntilClose => {
                self.reader.read_to_end(&mut body).expect("close-delimited body");
            }
        }
        Reply {
            head,
            body: String::from_utf8(body).expect("response body should be UTF-8"),
        }
    }

    fn closed_by_server(&mut self) -> bool {
        match self.reader.fill_buf() {
            Ok(buffer) => buffer.is_empty(),
            Err(err) => err.kind() == io::ErrorKind::ConnectionReset,
        }
    }
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn drain_config(deadline: Duration) -> DrainConfig {
    DrainConfig {
        graceful: true,
        drain_timeout: Some(deadline),
        pre_shutdown_delay: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        hard_timeout: Duration::from_secs(2),
    }
}

#[test]
fn keep_alive_connection_is_reused_while_running() {
    let server = RunningServer::start(true, 16);
    let mut client = server.connect();

    for _ in 0..3 {
        let reply = client.send("GET", "/status?code=200");
        assert_eq!(reply.head.status, 200);
        assert!(reply.head.keeps_alive());
        assert_eq!(reply.head.headers.count("connection"), 0);
        assert_eq!(reply.body, "Returned status code 200\n");
    }
    assert!(wait_until(Duration::from_secs(1), || {
        server.state().connections().current_count() == 1
    }));
    assert_eq!(server.state().connections().opened_total(), 1);

    server.handle.shutdown(Duration::from_secs(1)).expect("idle stop");
    server.join();
}

#[test]
fn draining_closes_reused_connections_after_one_more_response() {
    let server = RunningServer::start(true, 16);
    let mut client = server.connect();

    let before = client.send("GET", "/sleep?min=1ms&max=1ms");
    assert_eq!(before.head.headers.count("connection"), 0);

    server.state().begin_draining();
    let during = client.send("GET", "/sleep?min=1ms&max=1ms");
    assert_eq!(during.head.status, 200);
    assert_eq!(during.head.headers.count("connection"), 1);
    assert!(during.head.headers.has_token("connection", "close"));
    assert_eq!(during.body, "Slept for 1ms\n");
    assert!(client.closed_by_server());

    assert!(wait_until(Duration::from_secs(1), || {
        server.state().connections().current_count() == 0
    }));
    server.handle.shutdown(Duration::from_secs(1)).expect("idle stop");
    server.join();
}

#[test]
fn draining_without_graceful_shutdown_keeps_connections_open() {
    let server = RunningServer::start(false, 16);
    let mut client = server.connect();

    server.state().begin_draining();
    let reply = client.send("GET", "/status?code=204");
    assert_eq!(reply.head.status, 204);
    assert!(reply.head.keeps_alive());

    let again = client.send("GET", "/status?code=200");
    assert_eq!(again.head.status, 200);

    server.handle.shutdown(Duration::from_secs(1)).expect("idle stop");
    server.join();
}

#[test]
fn readiness_flips_on_the_same_connection() {
    let server = RunningServer::start(true, 16);
    let mut client = server.connect();

    let ready = client.send("GET", "/ready");
    assert_eq!(ready.head.status, 200);
    assert_eq!(ready.body, "OK");

    server.state().begin_draining();
    let unready = client.send("GET", "/ready");
    assert_eq!(unready.head.status, 503);
    assert!(unready.head.headers.has_token("connection", "close"));
    assert_eq!(unready.body, "");
    assert!(client.closed_by_server());

    server.handle.shutdown(Duration::from_secs(1)).expect("idle stop");
    server.join();
}

#[test]
fn stopping_the_listener_closes_idle_keep_alive_connections() {
    let server = RunningServer::start(true, 16);
    let mut client = server.connect();
    client.send("GET", "/status?code=200");

    server
        .handle
        .shutdown(Duration::from_secs(1))
        .expect("no request is in flight");

    assert!(client.closed_by_server());
    assert!(wait_until(Duration::from_secs(1), || {
        server.state().connections().current_count() == 0
    }));
    let addr = server.addr;
    server.join();
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
}

#[test]
fn in_flight_request_finishes_before_the_listener_stops() {
    let server = RunningServer::start(true, 16);
    let mut client = server.connect();
    client
        .reader
        .get_mut()
        .write_all(b"GET /sleep?min=300ms&max=300ms HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .expect("request should be written");
    assert!(wait_until(Duration::from_secs(2), || server.handle.in_flight() == 1));

    let started = Instant::now();
    server
        .handle
        .shutdown(Duration::from_secs(2))
        .expect("the sleep ends before the hard timeout");
    assert!(started.elapsed() >= Duration::from_millis(100));

    let reply = client.read_reply("GET");
    assert_eq!(reply.head.status, 200);
    assert_eq!(reply.body, "Slept for 300ms\n");
    assert!(client.closed_by_server());
    server.join();
}

#[test]
fn hard_timeout_abandons_slow_requests() {
    let server = RunningServer::start(true, 16);
    let mut client = server.connect();
    client
        .reader
        .get_mut()
        .write_all(b"GET /sleep?min=2s&max=2s HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .expect("request should be written");
    assert!(wait_until(Duration::from_secs(2), || server.handle.in_flight() == 1));

    let result = server.handle.shutdown(Duration::from_millis(100));

    assert_eq!(
        result,
        Err(StopError::TimedOut {
            abandoned: 1,
            timeout: Duration::from_millis(100),
        })
    );
    server.join();
}

#[test]
fn connections_over_the_limit_get_a_backpressure_response() {
    let server = RunningServer::start(true, 1);
    let mut first = server.connect();
    assert_eq!(first.send("GET", "/ready").head.status, 200);

    let mut second = server.connect();
    let rejected = second.read_reply("GET");
    assert_eq!(rejected.head.status, 503);
    assert!(rejected.head.headers.has_token("connection", "close"));
    assert!(rejected.body.contains("connection limit reached"));
    assert!(second.closed_by_server());

    assert_eq!(first.send("GET", "/ready").head.status, 200);
    server.handle.shutdown(Duration::from_secs(1)).expect("idle stop");
    server.join();
}

#[test]
fn coordinator_stops_promptly_once_connections_drain() {
    let server = RunningServer::start(true, 16);
    let mut client = server.connect();
    client.send("GET", "/status?code=200");

    let coordinator = ShutdownCoordinator::new(
        Arc::clone(server.runtime.shutdown_state()),
        server.handle.clone(),
        drain_config(Duration::from_secs(10)),
    );
    let shutdown = thread::spawn(move || coordinator.shutdown(Some(TerminationSignal::Terminate)));

    assert!(wait_until(Duration::from_secs(1), || {
        server.state().phase() != ShutdownPhase::Running
    }));
    let reply = client.send("GET", "/status?code=200");
    assert!(reply.head.headers.has_token("connection", "close"));
    assert!(client.closed_by_server());

    let report = shutdown.join().expect("coordinator should not panic");
    assert_eq!(report.reason, StopReason::ConnectionsDrained);
    assert!(report.drain_elapsed < Duration::from_secs(5));
    assert_eq!(report.stop_result, Ok(()));
    assert_eq!(server.state().phase(), ShutdownPhase::Stopped);
    server.join();
}

#[test]
fn coordinator_gives_up_on_silent_keep_alive_connections_at_the_deadline() {
    let server = RunningServer::start(true, 16);
    let mut client = server.connect();
    client.send("GET", "/status?code=200");

    let coordinator = ShutdownCoordinator::new(
        Arc::clone(server.runtime.shutdown_state()),
        server.handle.clone(),
        drain_config(Duration::from_millis(200)),
    );
    let report = coordinator.shutdown(Some(TerminationSignal::Interrupt));

    assert_eq!(report.reason, StopReason::DeadlineElapsed);
    assert!(report.drain_elapsed >= Duration::from_millis(200));
    assert_eq!(report.stop_result, Ok(()));
    assert!(client.closed_by_server());
    server.join();
}
