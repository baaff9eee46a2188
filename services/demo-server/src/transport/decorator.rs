use std::io::{self, Read};

use lifecycle::ShutdownState;

use super::{Headers, ResponseWriter};

/// Adds `Connection: close` to a response once shutdown has begun, so a
/// client does not send its next request over a connection that is about to
/// go away. The phase is read when the header block is committed, which
/// happens on the first `write_header`, `write_body` or `copy_from` call.
pub struct ConnectionCloseWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    state: &'a ShutdownState,
    header_committed: bool,
}

impl<'a> ConnectionCloseWriter<'a> {
    pub fn new(inner: &'a mut dyn ResponseWriter, state: &'a ShutdownState) -> Self {
        Self {
            inner,
            state,
            header_committed: false,
        }
    }

    fn inject_header(&mut self) {
        if self.header_committed {
            return;
        }
        self.header_committed = true;
        if !self.state.is_running() {
            self.inner.headers_mut().set("Connection", "close");
        }
    }
}

impl ResponseWriter for ConnectionCloseWriter<'_> {
    fn headers_mut(&mut self) -> &mut Headers {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: u16) -> io::Result<()> {
        self.inject_header();
        self.inner.write_header(status)
    }

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.inject_header();
        self.inner.write_body(chunk)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn copy_from(&mut self, source: &mut dyn Read) -> io::Result<u64> {
        self.inject_header();
        self.inner.copy_from(source)
    }
}
