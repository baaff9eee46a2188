use std::io::{self, BufRead, Read};

const MAX_CHUNK_LINE_BYTES: u64 = 4 * 1024;
const MAX_TRAILER_LINES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Done,
}

/// Decodes a `Transfer-Encoding: chunked` body. Reading stops exactly at the
/// end of the trailer section, so the underlying reader is left positioned at
/// the next message on a persistent connection.
#[derive(Debug)]
pub struct ChunkedReader<R> {
    inner: R,
    state: ChunkState,
}

impl<R: BufRead> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: ChunkState::Size,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let read = (&mut self.inner)
            .take(MAX_CHUNK_LINE_BYTES)
            .read_line(&mut line)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunked body ended early",
            ));
        }
        if !line.ends_with('\n') {
            return Err(invalid_data("chunk line too long"));
        }
        Ok(line)
    }

    fn read_chunk_size(&mut self) -> io::Result<u64> {
        let line = self.read_line()?;
        let size = line
            .split(';')
            .next()
            .map(str::trim)
            .unwrap_or_default();
        u64::from_str_radix(size, 16).map_err(|_| invalid_data("invalid chunk size"))
    }

    fn skip_trailers(&mut self) -> io::Result<()> {
        for _ in 0..MAX_TRAILER_LINES {
            if self.read_line()?.trim().is_empty() {
                return Ok(());
            }
        }
        Err(invalid_data("too many chunked trailer lines"))
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let size = self.read_chunk_size()?;
                    if size == 0 {
                        self.skip_trailers()?;
                        self.state = ChunkState::Done;
                    } else {
                        self.state = ChunkState::Data(size);
                    }
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(0);
                    }
                    let max = buf
                        .len()
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let read = self.inner.read(&mut buf[..max])?;
                    if read == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "chunk data ended early",
                        ));
                    }
                    let remaining = remaining - read as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining)
                    };
                    return Ok(read);
                }
                ChunkState::DataEnd => {
                    let line = self.read_line()?;
                    if !line.trim().is_empty() {
                        return Err(invalid_data("missing CRLF after chunk data"));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Done => return Ok(0),
            }
        }
    }
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chunks_and_leaves_the_next_message_unread() {
        let wire = b"5\r\nhello\r\n7;ext=1\r\n, world\r\n0\r\nX-Trailer: yes\r\n\r\nGET /next";
        let mut reader = ChunkedReader::new(&wire[..]);
        let mut body = String::new();
        reader.read_to_string(&mut body).expect("body should decode");
        assert_eq!(body, "hello, world");
        assert!(reader.is_done());

        let mut rest = String::new();
        reader
            .into_inner()
            .read_to_string(&mut rest)
            .expect("rest should read");
        assert_eq!(rest, "GET /next");
    }

    #[test]
    fn rejects_bad_sizes_and_truncated_data() {
        let mut body = Vec::new();
        let err = ChunkedReader::new(&b"zz\r\nhello\r\n0\r\n\r\n"[..])
            .read_to_end(&mut body)
            .expect_err("size should be rejected");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = ChunkedReader::new(&b"a\r\nshort"[..])
            .read_to_end(&mut body)
            .expect_err("truncated chunk should fail");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
