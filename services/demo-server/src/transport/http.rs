use std::{
    collections::HashMap,
    fmt::Write as _,
    io::{self, Read, Write},
    net::TcpStream,
    time::Duration,
};

use chrono::Utc;
use tracing::{debug, warn};

const BACKPRESSURE_CONNECTION_LIMIT_MESSAGE: &str =
    "service unavailable: connection limit reached";
const COPY_BUFFER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) body: Vec<u8>,
}

impl HttpRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub(crate) fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    pub(crate) fn is_legacy_version(&self) -> bool {
        self.version == "HTTP/1.0"
    }

    /// Whether the client asked for the connection to end after this exchange.
    pub(crate) fn wants_close(&self) -> bool {
        let has_token = |token: &str| {
            self.header("connection").is_some_and(|value| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
        };
        if has_token("close") {
            return true;
        }
        self.is_legacy_version() && !has_token("keep-alive")
    }
}

/// Response header list that keeps insertion order and matches names
/// case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of lines carrying `name`.
    pub fn count(&self, name: &str) -> usize {
        self.entries
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .any(|(_, value)| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
    }

    /// Replaces every existing value of `name`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sink a handler writes its response into.
///
/// Headers may change until the status line is committed, either explicitly
/// through `write_header` or implicitly (as `200`) by the first body write.
/// Later header changes are not sent.
pub trait ResponseWriter {
    fn headers_mut(&mut self) -> &mut Headers;
    fn write_header(&mut self, status: u16) -> io::Result<()>;
    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;

    /// Streams `source` into the body until it is exhausted.
    fn copy_from(&mut self, source: &mut dyn Read) -> io::Result<u64> {
        let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
        let mut copied = 0u64;
        loop {
            let read = match source.read(&mut buffer) {
                Ok(0) => return Ok(copied),
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            self.write_body(&buffer[..read])?;
            copied += read as u64;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
    Finished,
}

/// Writes an HTTP/1.1 response straight onto a connection. Bodies are framed
/// by `Content-Length` when the handler set one and chunked otherwise.
pub struct WireResponse<W: Write> {
    out: W,
    headers: Headers,
    status: Option<u16>,
    framing: Framing,
    head_only: bool,
    legacy_client: bool,
    closes: bool,
}

impl<W: Write> WireResponse<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            headers: Headers::new(),
            status: None,
            framing: Framing::Empty,
            head_only: false,
            legacy_client: false,
            closes: false,
        }
    }

    pub(crate) fn for_request(out: W, request: &HttpRequest, closing: bool) -> Self {
        Self::new(out)
            .head_only(request.is_head())
            .legacy_client(request.is_legacy_version())
            .close_after(closing || request.wants_close())
    }

    /// Suppresses the body, as for a response to `HEAD`.
    pub fn head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    /// HTTP/1.0 peers get close-delimited bodies instead of chunked ones.
    pub fn legacy_client(mut self, legacy_client: bool) -> Self {
        self.legacy_client = legacy_client;
        self
    }

    /// Announces `Connection: close` and ends the connection afterwards.
    pub fn close_after(mut self, close: bool) -> Self {
        self.closes = close;
        self
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_committed(&self) -> bool {
        self.status.is_some()
    }

    /// True once the committed headers (or a framing failure) mean the
    /// connection cannot carry another request.
    pub fn closes_connection(&self) -> bool {
        self.closes
    }

    pub fn finish(&mut self) -> io::Result<()> {
        if self.status.is_none() {
            if !self.headers.contains("content-length") {
                self.headers.set("Content-Length", "0");
            }
            self.commit(200)?;
        }
        match self.framing {
            Framing::Chunked => self.out.write_all(b"0\r\n\r\n")?,
            Framing::Length(remaining) if remaining > 0 => {
                warn!(remaining, "response body ended before its content-length");
                self.closes = true;
            }
            Framing::UntilClose => self.closes = true,
            _ => {}
        }
        self.framing = Framing::Finished;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn commit(&mut self, status: u16) -> io::Result<()> {
        let informational = (100..200).contains(&status);
        let bodyless = self.head_only || informational || status == 204 || status == 304;
        if informational || status == 204 {
            self.headers.remove("content-length");
        }

        self.framing = if bodyless {
            Framing::Empty
        } else if let Some(length) = self
            .headers
            .get("content-length")
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            Framing::Length(length)
        } else if self.legacy_client {
            self.headers.remove("content-length");
            self.closes = true;
            Framing::UntilClose
        } else {
            self.headers.remove("content-length");
            self.headers.set("Transfer-Encoding", "chunked");
            Framing::Chunked
        };
        if bodyless {
            self.headers.remove("transfer-encoding");
        }

        // A lone interim status leaves the client waiting for a final one.
        if informational || self.headers.has_token("connection", "close") {
            self.closes = true;
        }
        if self.closes {
            if !self.headers.has_token("connection", "close") {
                self.headers.set("Connection", "close");
            }
        } else if self.legacy_client {
            self.headers.set("Connection", "keep-alive");
        }
        if !self.headers.contains("date") {
            self.headers.set("Date", http_date());
        }

        let mut head = match status_reason(status) {
            Some(reason) => format!("HTTP/1.1 {status} {reason}\r\n"),
            None => format!("HTTP/1.1 {status} status code {status}\r\n"),
        };
        for (name, value) in self.headers.iter() {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("\r\n");
        self.out.write_all(head.as_bytes())?;
        self.status = Some(status);
        Ok(())
    }
}

impl<W: Write> ResponseWriter for WireResponse<W> {
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_header(&mut self, status: u16) -> io::Result<()> {
        if let Some(committed) = self.status {
            debug!(committed, status, "superfluous write_header call ignored");
            return Ok(());
        }
        self.commit(status)
    }

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.status.is_none() {
            self.commit(200)?;
        }
        if chunk.is_empty() {
            return Ok(());
        }
        match self.framing {
            Framing::Empty => Ok(()),
            Framing::Length(remaining) => {
                let len = chunk.len() as u64;
                if len > remaining {
                    self.closes = true;
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "response body exceeds its content-length",
                    ));
                }
                self.out.write_all(chunk)?;
                self.framing = Framing::Length(remaining - len);
                Ok(())
            }
            Framing::Chunked => {
                write!(self.out, "{:x}\r\n", chunk.len())?;
                self.out.write_all(chunk)?;
                self.out.write_all(b"\r\n")
            }
            Framing::UntilClose => self.out.write_all(chunk),
            Framing::Finished => Err(io::Error::other("response already finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Collects a response in memory, for transports that hand a finished
/// response to their own framing layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferedResponse {
    status: Option<u16>,
    headers: Headers,
    committed_headers: Option<Headers>,
    body: Vec<u8>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    pub fn headers(&self) -> &Headers {
        self.committed_headers.as_ref().unwrap_or(&self.headers)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (u16, Headers, Vec<u8>) {
        let status = self.status.unwrap_or(200);
        let headers = self.committed_headers.unwrap_or(self.headers);
        (status, headers, self.body)
    }
}

impl ResponseWriter for BufferedResponse {
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_header(&mut self, status: u16) -> io::Result<()> {
        if self.status.is_none() {
            self.status = Some(status);
            self.committed_headers = Some(self.headers.clone());
        }
        Ok(())
    }

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_header(200)?;
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) content_type: &'static str,
    pub(crate) body: String,
}

impl HttpResponse {
    pub(crate) fn ok_plain(body: String) -> Self {
        Self::with_status(200, body)
    }

    pub(crate) fn with_status(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body,
        }
    }

    pub(crate) fn bad_request(message: &str) -> Self {
        Self::error_with_status(400, message)
    }

    pub(crate) fn not_found(message: &str) -> Self {
        Self::error_with_status(404, message)
    }

    pub(crate) fn method_not_allowed(message: &str) -> Self {
        Self::error_with_status(405, message)
    }

    pub(crate) fn bad_gateway(message: &str) -> Self {
        Self::error_with_status(502, message)
    }

    pub(crate) fn service_unavailable(message: &str) -> Self {
        Self::error_with_status(503, message)
    }

    pub(crate) fn error_with_status(status: u16, message: &str) -> Self {
        Self::with_status(status, format!("{message}\n"))
    }

    pub(crate) fn write_to(&self, writer: &mut dyn ResponseWriter) -> io::Result<()> {
        let headers = writer.headers_mut();
        headers.set("Content-Type", self.content_type);
        if self.status >= 400 {
            headers.set("X-Content-Type-Options", "nosniff");
        }
        headers.set("Content-Length", self.body.len().to_string());
        writer.write_header(self.status)?;
        writer.write_body(self.body.as_bytes())
    }
}

pub(crate) fn backpressure_rejection_response() -> HttpResponse {
    HttpResponse::service_unavailable(BACKPRESSURE_CONNECTION_LIMIT_MESSAGE)
}

pub(crate) fn backpressure_response_bytes() -> io::Result<Vec<u8>> {
    let mut response = WireResponse::new(Vec::new()).close_after(true);
    backpressure_rejection_response().write_to(&mut response)?;
    response.finish()?;
    Ok(response.into_inner())
}

pub(crate) fn write_backpressure_response(
    mut stream: &TcpStream,
    socket_timeout: Duration,
) -> io::Result<()> {
    stream.set_write_timeout(Some(socket_timeout))?;
    stream.write_all(&backpressure_response_bytes()?)?;
    stream.flush()
}

/// RFC 7231 IMF-fixdate, as used by `Date` and `Last-Modified`.
pub(crate) fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn status_reason(status: u16) -> Option<&'static str> {
    let reason = match status {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        421 => "Misdirected Request",
        422 => "Unprocessable Entity",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => return None,
    };
    Some(reason)
}
