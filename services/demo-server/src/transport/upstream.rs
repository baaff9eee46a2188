use std::{
    collections::HashMap,
    fmt::Write as _,
    io::{self, BufRead, BufReader, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::Mutex,
    time::Instant,
};

use thiserror::Error;
use tracing::debug;

use super::{ChunkedReader, Headers};
use crate::config::UpstreamConfig;

const MAX_RESPONSE_HEAD_BYTES: u64 = 64 * 1024;
const MAX_INTERIM_RESPONSES: usize = 8;
const USER_AGENT: &str = "demo-server-proxy/0.1";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        source: io::Error,
    },
    #[error("failed to send request to {authority}: {source}")]
    Send {
        authority: String,
        source: io::Error,
    },
    #[error("failed to read response from {authority}: {source}")]
    Receive {
        authority: String,
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl ResponseHead {
    pub fn body_framing(&self, request_method: &str) -> BodyFraming {
        if request_method == "HEAD"
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return BodyFraming::Empty;
        }
        if self.headers.has_token("transfer-encoding", "chunked") {
            return BodyFraming::Chunked;
        }
        match self
            .headers
            .get("content-length")
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            Some(0) => BodyFraming::Empty,
            Some(length) => BodyFraming::Length(length),
            None => BodyFraming::UntilClose,
        }
    }

    /// Whether the peer will accept another request on this connection.
    pub fn keeps_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        self.version == "HTTP/1.1" || self.headers.has_token("connection", "keep-alive")
    }
}

/// Reads a status line and header block. Malformed input is reported as
/// `InvalidData`.
pub fn read_response_head<R: BufRead>(reader: &mut R) -> io::Result<ResponseHead> {
    let mut limited = (&mut *reader).take(MAX_RESPONSE_HEAD_BYTES);

    let mut status_line = String::new();
    if limited.read_line(&mut status_line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before a response arrived",
        ));
    }
    let status_line = status_line.trim_end_matches(['\r', '\n']);
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(invalid_data(format!("malformed status line {status_line:?}")));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..=999).contains(code))
        .ok_or_else(|| invalid_data(format!("malformed status code in {status_line:?}")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Headers::new();
    loop {
        let mut line = String::new();
        if limited.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside the response header block",
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid_data(format!("malformed response header {line:?}")))?;
        headers.append(name.trim(), value.trim());
    }

    Ok(ResponseHead {
        version: version.to_string(),
        status,
        reason,
        headers,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub method: String,
    pub authority: String,
    pub path_and_query: String,
    pub headers: Headers,
}

struct IdleConnection {
    reader: BufReader<TcpStream>,
    idle_since: Instant,
}

/// Keep-alive client for the proxy relay. Idle connections are pooled per
/// authority. A request that fails on a reused connection is reported, never
/// replayed.
pub struct UpstreamClient {
    config: UpstreamConfig,
    idle: Mutex<HashMap<String, Vec<IdleConnection>>>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn idle_connections(&self, authority: &str) -> usize {
        self.idle
            .lock()
            .map(|idle| idle.get(authority).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse<'_>, UpstreamError> {
        let authority = request.authority.as_str();
        let (mut reader, reused) = match self.checkout(authority) {
            Some(reader) => (reader, true),
            None => (self.connect(authority)?, false),
        };
        debug!(authority, reused, method = %request.method, "relaying request upstream");

        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {USER_AGENT}\r\n",
            request.method, request.path_and_query, request.authority
        );
        for (name, value) in request.headers.iter() {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        if !matches!(request.method.as_str(), "GET" | "HEAD" | "OPTIONS" | "DELETE") {
            head.push_str("Content-Length: 0\r\n");
        }
        head.push_str("\r\n");

        let send_error = |source: io::Error| UpstreamError::Send {
            authority: authority.to_string(),
            source,
        };
        reader
            .get_mut()
            .write_all(head.as_bytes())
            .map_err(send_error)?;
        reader.get_mut().flush().map_err(send_error)?;

        let receive_error = |source: io::Error| UpstreamError::Receive {
            authority: authority.to_string(),
            source,
        };
        let mut interim = 0usize;
        let head = loop {
            let head = read_response_head(&mut reader).map_err(receive_error)?;
            if !(100..200).contains(&head.status) || head.status == 101 {
                break head;
            }
            interim += 1;
            if interim > MAX_INTERIM_RESPONSES {
                return Err(receive_error(invalid_data(
                    "too many interim responses".to_string(),
                )));
            }
        };

        let reusable = head.keeps_alive();
        let body = match head.body_framing(&request.method) {
            BodyFraming::Empty => {
                if reusable {
                    self.release(authority, reader);
                }
                None
            }
            BodyFraming::Length(length) => Some(UpstreamBody::Length(reader.take(length))),
            BodyFraming::Chunked => Some(UpstreamBody::Chunked(ChunkedReader::new(reader))),
            BodyFraming::UntilClose => Some(UpstreamBody::UntilClose(reader)),
        };

        Ok(UpstreamResponse {
            client: self,
            authority: authority.to_string(),
            head,
            body,
            reusable,
        })
    }

    fn checkout(&self, authority: &str) -> Option<BufReader<TcpStream>> {
        let mut idle = self.idle.lock().ok()?;
        let pool = idle.get_mut(authority)?;
        while let Some(connection) = pool.pop() {
            if connection.idle_since.elapsed() >= self.config.idle_timeout {
                debug!(authority, "dropping expired upstream connection");
                continue;
            }
            if connection_looks_open(connection.reader.get_ref()) {
                return Some(connection.reader);
            }
            debug!(authority, "dropping upstream connection closed by peer");
        }
        None
    }

    fn release(&self, authority: &str, reader: BufReader<TcpStream>) {
        // Unread bytes mean the upstream misframed its response.
        if !reader.buffer().is_empty() {
            return;
        }
        let Ok(mut idle) = self.idle.lock() else {
            return;
        };
        let idle_timeout = self.config.idle_timeout;
        let pool = idle.entry(authority.to_string()).or_default();
        pool.retain(|connection| connection.idle_since.elapsed() < idle_timeout);
        if pool.len() < self.config.max_idle_per_host {
            pool.push(IdleConnection {
                reader,
                idle_since: Instant::now(),
            });
        }
    }

    fn connect(&self, authority: &str) -> Result<BufReader<TcpStream>, UpstreamError> {
        let connect_error = |source: io::Error| UpstreamError::Connect {
            authority: authority.to_string(),
            source,
        };
        let dial = if authority.contains(':') {
            authority.to_string()
        } else {
            format!("{authority}:80")
        };
        let mut last_error = None;
        for addr in dial.to_socket_addrs().map_err(connect_error)? {
            match TcpStream::connect_timeout(&addr, self.config.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.config.timeout)).map_err(connect_error)?;
                    stream.set_write_timeout(Some(self.config.timeout)).map_err(connect_error)?;
                    stream.set_nodelay(true).map_err(connect_error)?;
                    return Ok(BufReader::new(stream));
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(connect_error(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "authority resolved to no addresses")
        })))
    }
}

enum UpstreamBody {
    Length(io::Take<BufReader<TcpStream>>),
    Chunked(ChunkedReader<BufReader<TcpStream>>),
    UntilClose(BufReader<TcpStream>),
}

/// Upstream status and headers plus a streaming body. A keep-alive
/// connection goes back to the pool once its body has been read to the end.
pub struct UpstreamResponse<'a> {
    client: &'a UpstreamClient,
    authority: String,
    head: ResponseHead,
    body: Option<UpstreamBody>,
    reusable: bool,
}

impl UpstreamResponse<'_> {
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> u16 {
        self.head.status
    }

    fn finish_body(&mut self) {
        let Some(body) = self.body.take() else {
            return;
        };
        if !self.reusable {
            return;
        }
        match body {
            UpstreamBody::Length(reader) => self.client.release(&self.authority, reader.into_inner()),
            UpstreamBody::Chunked(reader) => {
                if reader.is_done() {
                    self.client.release(&self.authority, reader.into_inner());
                }
            }
            UpstreamBody::UntilClose(_) => {}
        }
    }
}

impl Read for UpstreamResponse<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let read = match self.body.as_mut() {
            None => return Ok(0),
            Some(UpstreamBody::Length(reader)) => {
                let expected = reader.limit();
                let read = reader.read(buf)?;
                if read == 0 && expected > 0 {
                    self.body = None;
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "upstream body ended before its content-length",
                    ));
                }
                read
            }
            Some(UpstreamBody::Chunked(reader)) => reader.read(buf)?,
            Some(UpstreamBody::UntilClose(reader)) => reader.read(buf)?,
        };
        if read == 0 {
            self.finish_body();
        }
        Ok(read)
    }
}

fn connection_looks_open(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let open = matches!(
        stream.peek(&mut probe),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock
    );
    stream.set_nonblocking(false).is_ok() && open
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
