//! Collaborator seams for HTTP/1 parsing and WebSocket framing.
//!
//! The byte-level codecs live outside this crate; this module fixes the
//! interfaces the runtime consumes. An HTTP parser is a callback-table
//! state machine: the connection shell feeds it raw bytes through
//! [`RequestParser::execute`] and polls [`is_finished`] /
//! [`has_error`](RequestParser::has_error), while the parser reports
//! structure through its [`ParserEvents`] sink. Buffer and body caps come
//! from configuration (`http.request.buffer_size` and friends).
//!
//! [`HttpConnection`] is the thin pump tying a stream to a parser: read,
//! execute, compact the unconsumed tail, enforce the caps, then drain the
//! body by content length.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::config::Config;
use crate::net::TcpStream;

/// Structure events emitted by an HTTP/1 request parser.
pub trait ParserEvents {
    /// Request method.
    fn on_method(&mut self, method: &[u8]);
    /// Full request target.
    fn on_uri(&mut self, uri: &[u8]);
    /// Path component.
    fn on_path(&mut self, path: &[u8]);
    /// Query component.
    fn on_query(&mut self, query: &[u8]);
    /// Fragment component.
    fn on_fragment(&mut self, fragment: &[u8]);
    /// HTTP version.
    fn on_version(&mut self, version: &[u8]);
    /// One header field.
    fn on_header(&mut self, name: &[u8], value: &[u8]);
    /// Header section complete.
    fn on_headers_done(&mut self);
    /// Response reason phrase (response parsers).
    fn on_reason(&mut self, reason: &[u8]) {
        let _ = reason;
    }
    /// Response status code (response parsers).
    fn on_status(&mut self, status: u16) {
        let _ = status;
    }
    /// Chunk-size line (chunked bodies).
    fn on_chunk_size(&mut self, size: usize) {
        let _ = size;
    }
    /// Final zero-length chunk.
    fn on_last_chunk(&mut self) {}
}

/// Byte-by-byte HTTP request parser, driven by the connection shell.
pub trait RequestParser: Send {
    /// Consumes up to `data.len()` bytes, returning how many were
    /// consumed. `is_chunk` selects the chunked-body sub-machine.
    fn execute(&mut self, data: &[u8], is_chunk: bool) -> usize;

    /// Whether a complete request head has been parsed.
    fn is_finished(&self) -> bool;

    /// Whether the input violated the protocol.
    fn has_error(&self) -> bool;

    /// Declared body length, once the head is parsed.
    fn content_length(&self) -> Option<usize>;
}

/// WebSocket framing collaborator.
pub trait WsFraming: Send {
    /// Turns an HTTP upgrade request head into the handshake response
    /// bytes.
    fn handshake(&mut self, request_head: &[u8]) -> io::Result<Vec<u8>>;

    /// Encodes one frame.
    fn send_frame(&mut self, opcode: u8, payload: &[u8], fin: bool) -> Vec<u8>;

    /// Decodes the next complete message from buffered bytes, if any.
    fn recv_message(&mut self, buffered: &mut Vec<u8>) -> Option<(u8, Vec<u8>)>;
}

/// Buffer and body caps for HTTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpCaps {
    /// Request head buffer size.
    pub request_buffer_size: usize,
    /// Request body cap.
    pub request_max_body_size: usize,
    /// Response head buffer size.
    pub response_buffer_size: usize,
    /// Response body cap.
    pub response_max_body_size: usize,
}

impl HttpCaps {
    /// Reads the caps from configuration.
    #[must_use]
    pub fn from_config(config: &Arc<Config>) -> Self {
        Self {
            request_buffer_size: config.get_or("http.request.buffer_size", 4096),
            request_max_body_size: config.get_or("http.request.max_body_size", 64 << 20),
            response_buffer_size: config.get_or("http.response.buffer_size", 4096),
            response_max_body_size: config.get_or("http.response.max_body_size", 64 << 20),
        }
    }
}

/// One HTTP/1 connection: a stream plus the configured caps.
#[derive(Debug)]
pub struct HttpConnection {
    stream: TcpStream,
    caps: HttpCaps,
}

impl HttpConnection {
    /// Wraps an accepted (or dialed) stream.
    #[must_use]
    pub fn new(stream: TcpStream, caps: HttpCaps) -> Self {
        Self { stream, caps }
    }

    /// The underlying stream.
    #[must_use]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Applies a keep-alive read deadline.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.stream.set_read_timeout(timeout);
    }

    /// Pumps stream bytes through `parser` until the request head is
    /// complete, then reads the declared body. Returns the body bytes;
    /// parsed structure lands in the parser's event sink.
    pub async fn recv_request<P: RequestParser>(&self, parser: &mut P) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.caps.request_buffer_size];
        let mut filled = 0usize;

        loop {
            if filled == buffer.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head exceeds buffer",
                ));
            }
            let n = self.stream.read(&mut buffer[filled..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "remote closed before request completed",
                ));
            }
            filled += n;

            let consumed = parser.execute(&buffer[..filled], false);
            if parser.has_error() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "malformed request",
                ));
            }
            // Move the unconsumed tail to the front for the next round.
            buffer.copy_within(consumed..filled, 0);
            filled -= consumed;

            if parser.is_finished() {
                break;
            }
        }

        let body_len = parser.content_length().unwrap_or(0);
        if body_len > self.caps.request_max_body_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request body exceeds cap",
            ));
        }
        let mut body = Vec::with_capacity(body_len);
        body.extend_from_slice(&buffer[..filled.min(body_len)]);
        if body.len() < body_len {
            let mut rest = vec![0u8; body_len - body.len()];
            self.stream.read_exact(&mut rest).await?;
            body.extend_from_slice(&rest);
        }
        trace!(body = body.len(), "request received");
        Ok(body)
    }

    /// Sends a response head plus body, honoring the response caps.
    pub async fn send_response(&self, head: &[u8], body: &[u8]) -> io::Result<()> {
        if body.len() > self.caps.response_max_body_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response body exceeds cap",
            ));
        }
        self.stream.write_exact(head).await?;
        self.stream.write_exact(body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct HeadCountingParser {
        consumed_total: usize,
        finished: bool,
        error: bool,
        body_len: Option<usize>,
    }

    impl RequestParser for HeadCountingParser {
        fn execute(&mut self, data: &[u8], _is_chunk: bool) -> usize {
            // Pretend the head ends at the first blank line.
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                self.finished = true;
                self.consumed_total += pos + 4;
                pos + 4
            } else {
                self.consumed_total += data.len();
                data.len()
            }
        }

        fn is_finished(&self) -> bool {
            self.finished
        }

        fn has_error(&self) -> bool {
            self.error
        }

        fn content_length(&self) -> Option<usize> {
            self.body_len
        }
    }

    #[test]
    fn caps_come_from_config() {
        let config = Arc::new(Config::new());
        config.set("http.request.buffer_size", "1024");
        let caps = HttpCaps::from_config(&config);
        assert_eq!(caps.request_buffer_size, 1024);
        assert_eq!(caps.request_max_body_size, 64 << 20);
    }

    #[test]
    fn mock_parser_splits_head() {
        let mut parser = HeadCountingParser::default();
        let consumed = parser.execute(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nBODY", false);
        assert!(parser.is_finished());
        assert_eq!(consumed, 27);
    }
}
