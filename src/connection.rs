// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use mio::Token;
use quick_error::quick_error;

use crate::codec::parser::{ParseError, ParseStatus, RequestParser};
use crate::codec::{MAX_HEADERS_SIZE, MAX_REQUEST_LINE_SIZE};
use crate::config::ServerConfig;

quick_error! {
    /// Why a connection can no longer be serviced.
    #[derive(Debug)]
    pub enum ConnectionError {
        Io(err: io::Error) {
            from()
            display("i/o error: {}", err)
        }
        /// The read buffer outgrew the request-size ceiling. The engine
        /// answers 413 and closes.
        RequestTooLarge {
            display("request exceeds the configured size ceiling")
        }
    }
}

/// Result of one [`ConnectionContext::read_available`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many new bytes landed in the read buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The peer closed its end.
    Eof,
}

/// Result of one [`ConnectionContext::write_pending`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write buffer is empty.
    Flushed,
    /// Bytes remain; the channel stopped accepting for now.
    Pending,
}

/// Owns one connection's state: the channel, the buffers, the parser, the
/// keep-alive flag and the loop registration.
///
/// Exactly one thread mutates a context at any time: the loop thread for
/// the event-driven engines, a single pooled worker for the threaded one.
/// The engines enforce that by ownership, not by locking.
pub struct ConnectionContext<S> {
    stream: S,
    token: Option<Token>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    parser: RequestParser,
    keep_alive: bool,
    last_activity: Instant,
    read_chunk_size: usize,
    write_buffer_size: usize,
    max_request_size: usize,
}

impl<S: Read + Write> ConnectionContext<S> {
    /// Wraps a freshly accepted channel. `token` is the loop registration
    /// key, absent for the blocking engine.
    pub fn new(stream: S, token: Option<Token>, config: &ServerConfig) -> ConnectionContext<S> {
        ConnectionContext {
            stream,
            token,
            read_buf: Vec::with_capacity(config.read_buffer_size),
            write_buf: Vec::with_capacity(config.write_buffer_size),
            write_pos: 0,
            parser: RequestParser::with_max_body_size(config.max_body_size),
            keep_alive: true,
            last_activity: Instant::now(),
            read_chunk_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            // Everything a legal request can occupy, with room for the
            // blank lines.
            max_request_size: config.max_body_size + MAX_REQUEST_LINE_SIZE + MAX_HEADERS_SIZE + 16,
        }
    }

    /// Reads whatever the channel has into the read buffer without
    /// blocking (one `read` call; level-triggered readiness re-arms for
    /// the rest).
    pub fn read_available(&mut self) -> Result<ReadOutcome, ConnectionError> {
        let old_len = self.read_buf.len();
        self.read_buf.resize(old_len + self.read_chunk_size, 0);

        loop {
            match self.stream.read(&mut self.read_buf[old_len..]) {
                Ok(0) => {
                    self.read_buf.truncate(old_len);
                    return Ok(ReadOutcome::Eof);
                }
                Ok(n) => {
                    self.read_buf.truncate(old_len + n);
                    self.last_activity = Instant::now();
                    if self.read_buf.len() > self.max_request_size {
                        return Err(ConnectionError::RequestTooLarge);
                    }
                    return Ok(ReadOutcome::Data(n));
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    self.read_buf.truncate(old_len);
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(err) => {
                    self.read_buf.truncate(old_len);
                    return Err(err.into());
                }
            }
        }
    }

    /// Advances the parser over the buffered bytes.
    pub fn try_parse(&mut self) -> Result<ParseStatus, ParseError> {
        self.parser.poll(&mut self.read_buf)
    }

    /// Queues serialized response bytes for writing. If the response does
    /// not fit the standing buffer, a one-shot buffer sized
    /// `length + 1 KiB` takes its place; it is discarded after the flush.
    pub fn queue_response(&mut self, bytes: &[u8]) {
        if self.write_buf.is_empty() && bytes.len() > self.write_buf.capacity() {
            self.write_buf = Vec::with_capacity(bytes.len() + 1024);
            self.write_pos = 0;
        }
        self.write_buf.extend_from_slice(bytes);
    }

    /// Writes as much of the write buffer as the channel accepts.
    pub fn write_pending(&mut self) -> Result<WriteOutcome, ConnectionError> {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => {
                    return Err(ConnectionError::Io(io::Error::new(
                        ErrorKind::WriteZero,
                        "channel refused the response bytes",
                    )))
                }
                Ok(n) => {
                    self.write_pos += n;
                    self.last_activity = Instant::now();
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    return Ok(WriteOutcome::Pending)
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.write_pos = 0;
        self.write_buf.clear();
        // A one-shot buffer does not outlive its response.
        if self.write_buf.capacity() > self.write_buffer_size {
            self.write_buf = Vec::with_capacity(self.write_buffer_size);
        }
        Ok(WriteOutcome::Flushed)
    }

    /// Prepares the context for the next request on a kept-alive
    /// connection. Bytes already buffered for it survive; the engine must
    /// only call this once the previous response is fully flushed.
    pub fn reset_for_next_request(&mut self) {
        debug_assert!(!self.has_pending_write());
        self.parser.reset();
        self.write_buf.clear();
        self.write_pos = 0;
        self.last_activity = Instant::now();
    }

    #[inline]
    pub fn has_pending_write(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }

    /// True if unconsumed bytes are sitting in the read buffer.
    #[inline]
    pub fn has_buffered_input(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// True when an EOF now would cut a request short.
    pub fn mid_request(&self) -> bool {
        self.parser.mid_request() || self.has_buffered_input()
    }

    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    #[inline]
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Time since the last byte moved in either direction.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Tears the context down, releasing the buffers and handing the
    /// channel back so the caller can deregister it before dropping it
    /// (which closes the socket).
    pub fn close(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{self, ErrorKind, Read, Write};

    use super::{ConnectionContext, ConnectionError, ReadOutcome, WriteOutcome};
    use crate::codec::parser::ParseStatus;
    use crate::config::ServerConfig;

    // Scripted in-memory channel.
    struct MockStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        write_cap_per_call: usize,
        reject_writes_once: bool,
    }

    impl MockStream {
        fn new() -> MockStream {
            MockStream {
                reads: VecDeque::new(),
                written: Vec::new(),
                write_cap_per_call: usize::MAX,
                reject_writes_once: false,
            }
        }

        fn push_read(&mut self, bytes: &[u8]) {
            self.reads.push_back(Ok(bytes.to_vec()));
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(err)) => Err(err),
                None => Err(ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.reject_writes_once {
                self.reject_writes_once = false;
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_cap_per_call);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn ctx_with(stream: MockStream) -> ConnectionContext<MockStream> {
        ConnectionContext::new(stream, None, &ServerConfig::default())
    }

    #[test]
    fn read_appends_and_parses() {
        let mut stream = MockStream::new();
        stream.push_read(b"GET /x HTTP/1.1\r\n");
        stream.push_read(b"\r\n");
        let mut ctx = ctx_with(stream);

        assert!(matches!(ctx.read_available().unwrap(), ReadOutcome::Data(_)));
        assert!(matches!(
            ctx.try_parse().unwrap(),
            ParseStatus::NeedMoreData
        ));
        assert!(ctx.mid_request());

        assert!(matches!(ctx.read_available().unwrap(), ReadOutcome::Data(_)));
        match ctx.try_parse().unwrap() {
            ParseStatus::Complete(request) => assert_eq!(request.path(), "/x"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!ctx.mid_request());
        assert_eq!(ctx.read_available().unwrap(), ReadOutcome::WouldBlock);
    }

    #[test]
    fn eof_is_reported() {
        let mut stream = MockStream::new();
        stream.reads.push_back(Ok(Vec::new()));
        let mut ctx = ctx_with(stream);
        assert_eq!(ctx.read_available().unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn oversized_requests_trip_the_ceiling() {
        let mut config = ServerConfig::default();
        config.max_body_size = 1024;
        let mut stream = MockStream::new();
        // More than body ceiling + line/header allowance in one burst.
        for _ in 0..5 {
            stream.push_read(&vec![b'a'; 8 * 1024]);
        }
        let mut ctx = ConnectionContext::new(stream, None, &config);

        let mut tripped = false;
        for _ in 0..5 {
            match ctx.read_available() {
                Ok(_) => {}
                Err(ConnectionError::RequestTooLarge) => {
                    tripped = true;
                    break;
                }
                Err(other) => panic!("unexpected: {}", other),
            }
        }
        assert!(tripped);
    }

    #[test]
    fn writes_flush_fully_when_the_channel_accepts() {
        let mut ctx = ctx_with(MockStream::new());
        ctx.queue_response(b"HTTP/1.1 200 OK\r\n\r\n");
        assert!(ctx.has_pending_write());
        assert_eq!(ctx.write_pending().unwrap(), WriteOutcome::Flushed);
        assert!(!ctx.has_pending_write());
        assert_eq!(ctx.stream_mut().written, b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[test]
    fn partial_writes_stay_pending_and_resume() {
        let mut stream = MockStream::new();
        stream.write_cap_per_call = 4;
        stream.reject_writes_once = true;
        let mut ctx = ctx_with(stream);
        ctx.queue_response(b"0123456789");

        assert_eq!(ctx.write_pending().unwrap(), WriteOutcome::Pending);
        // Channel opens up: 4-byte slices until done.
        assert_eq!(ctx.write_pending().unwrap(), WriteOutcome::Flushed);
        assert_eq!(ctx.stream_mut().written, b"0123456789");
    }

    #[test]
    fn oversized_responses_use_a_one_shot_buffer() {
        let config = ServerConfig::default();
        let big = vec![b'z'; config.write_buffer_size * 2];
        let mut ctx = ctx_with(MockStream::new());

        ctx.queue_response(&big);
        assert_eq!(ctx.write_pending().unwrap(), WriteOutcome::Flushed);
        // The one-shot buffer was discarded after the flush.
        assert!(ctx.write_buf.capacity() <= config.write_buffer_size);
        assert_eq!(ctx.stream_mut().written.len(), big.len());
    }

    #[test]
    fn close_releases_the_channel() {
        let mut stream = MockStream::new();
        stream.push_read(b"x");
        let ctx = ctx_with(stream);
        // The stream comes back out; buffers and parser state die with
        // the context.
        let mut stream = ctx.close();
        let mut byte = [0u8; 1];
        assert_eq!(stream.read(&mut byte).unwrap(), 1);
    }

    #[test]
    fn reset_preserves_buffered_input() {
        let mut stream = MockStream::new();
        stream.push_read(b"GET /a HTTP/1.1\r\n\r\nGET");
        let mut ctx = ctx_with(stream);
        ctx.read_available().unwrap();
        assert!(matches!(
            ctx.try_parse().unwrap(),
            ParseStatus::Complete(_)
        ));
        assert!(ctx.has_buffered_input());

        ctx.reset_for_next_request();
        assert!(ctx.has_buffered_input());
    }
}
