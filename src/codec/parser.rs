// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::mem;
use std::str;

use quick_error::quick_error;

use super::{DEFAULT_MAX_BODY_SIZE, MAX_HEADERS_NUM, MAX_HEADERS_SIZE, MAX_REQUEST_LINE_SIZE};
use crate::headers::{self, Headers};
use crate::request::{HttpVersion, Method, Request};

quick_error! {
    /// Why a byte stream failed to parse as an HTTP/1.x request.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ParseError {
        UriTooLong {
            display("request line exceeds {} bytes", MAX_REQUEST_LINE_SIZE)
        }
        HeadersTooLarge {
            display("header section exceeds {} bytes", MAX_HEADERS_SIZE)
        }
        PayloadTooLarge {
            display("declared body length exceeds the configured ceiling")
        }
        Malformed {
            display("malformed request")
        }
        MethodNotRecognized {
            display("unrecognized method token")
        }
        UnsupportedVersion {
            display("unsupported HTTP version")
        }
    }
}

impl ParseError {
    /// The status code and reason an engine should answer with before
    /// closing the connection.
    pub fn http_status(&self) -> (u16, &'static str) {
        match *self {
            ParseError::UriTooLong => (414, "URI Too Long"),
            ParseError::HeadersTooLarge => (431, "Request Header Fields Too Large"),
            ParseError::PayloadTooLarge => (413, "Payload Too Large"),
            ParseError::Malformed => (400, "Bad Request"),
            ParseError::MethodNotRecognized => (400, "Bad Request"),
            ParseError::UnsupportedVersion => (505, "HTTP Version Not Supported"),
        }
    }
}

/// Outcome of one [`RequestParser::poll`] call.
#[derive(Debug, PartialEq)]
pub enum ParseStatus {
    /// The buffer does not contain a full request yet; feed more bytes and
    /// call again.
    NeedMoreData,
    /// One request was parsed and its bytes consumed from the buffer. Bytes
    /// past the request (the start of the next one on a keep-alive
    /// connection) are left in place.
    Complete(Request),
}

// The parser is a state machine.
enum ParserState {
    // A panic happened during processing. Any further call will panic.
    Poisoned,

    // The buffer doesn't contain the full request line yet.
    RequestLine,

    // The request line has been parsed, the header section is incomplete.
    Headers {
        method: Method,
        raw_target: String,
        version: HttpVersion,
    },

    // Headers are parsed; up to `remaining` body bytes are still to come.
    Body {
        method: Method,
        raw_target: String,
        version: HttpVersion,
        headers: Headers,
        remaining: usize,
        body: Vec<u8>,
    },

    // A previous call failed. The same error is reported again on every
    // call until `reset`.
    Failed(ParseError),
}

/// Incremental HTTP/1.x request parser.
///
/// The engine owns a growing read buffer and calls [`poll`](Self::poll)
/// whenever new bytes arrive. The parser consumes bytes from the front of
/// the buffer as it advances through the request line, the headers and the
/// body, and preserves its position between calls.
pub struct RequestParser {
    state: ParserState,
    // How far the current delimiter search has scanned, so bytes are not
    // rescanned when the buffer grows.
    scanned: usize,
    max_body_size: usize,
}

impl Default for RequestParser {
    fn default() -> RequestParser {
        RequestParser::new()
    }
}

impl RequestParser {
    /// Builds a parser with the default body ceiling
    /// ([`DEFAULT_MAX_BODY_SIZE`]).
    pub fn new() -> RequestParser {
        RequestParser::with_max_body_size(DEFAULT_MAX_BODY_SIZE)
    }

    /// Builds a parser with a custom body ceiling. The hard default is the
    /// upper bound; configurations can only lower it.
    pub fn with_max_body_size(max_body_size: usize) -> RequestParser {
        RequestParser {
            state: ParserState::RequestLine,
            scanned: 0,
            max_body_size: max_body_size.min(DEFAULT_MAX_BODY_SIZE),
        }
    }

    /// True while a request is partially parsed. An EOF in this situation
    /// is a short read, not a clean close.
    pub fn mid_request(&self) -> bool {
        !matches!(self.state, ParserState::RequestLine) || self.scanned > 0
    }

    /// Forgets any partial progress. Used when a connection is recycled.
    pub fn reset(&mut self) {
        self.state = ParserState::RequestLine;
        self.scanned = 0;
    }

    /// Advances the parse over the bytes currently in `buffer`.
    ///
    /// Consumed bytes are drained from the front of the buffer. Once a call
    /// has returned an error, every later call returns the same error until
    /// [`reset`](Self::reset).
    pub fn poll(&mut self, buffer: &mut Vec<u8>) -> Result<ParseStatus, ParseError> {
        loop {
            match mem::replace(&mut self.state, ParserState::Poisoned) {
                ParserState::Poisoned => {
                    panic!("poisoned request parser");
                }

                ParserState::RequestLine => {
                    let off = self.scanned.saturating_sub(1);
                    let rn = buffer[off..]
                        .windows(2)
                        .position(|w| w == b"\r\n")
                        .map(|p| off + p);

                    let rn = match rn {
                        Some(rn) => rn,
                        None => {
                            if buffer.len() > MAX_REQUEST_LINE_SIZE + 1 {
                                return Err(self.fail(ParseError::UriTooLong));
                            }
                            self.state = ParserState::RequestLine;
                            self.scanned = buffer.len();
                            return Ok(ParseStatus::NeedMoreData);
                        }
                    };

                    if rn > MAX_REQUEST_LINE_SIZE {
                        return Err(self.fail(ParseError::UriTooLong));
                    }

                    let (method, raw_target, version) = parse_request_line(&buffer[..rn])
                        .map_err(|err| self.fail(err))?;

                    buffer.drain(..rn + 2);
                    self.scanned = 0;
                    self.state = ParserState::Headers {
                        method,
                        raw_target,
                        version,
                    };
                }

                ParserState::Headers {
                    method,
                    raw_target,
                    version,
                } => {
                    // An immediate blank line means the header section is
                    // empty.
                    let section_end = if buffer.starts_with(b"\r\n") {
                        Some(0)
                    } else {
                        let off = self.scanned.saturating_sub(3);
                        buffer[off..]
                            .windows(4)
                            .position(|w| w == b"\r\n\r\n")
                            .map(|p| off + p + 2)
                    };

                    let section_end = match section_end {
                        Some(end) => end,
                        None => {
                            if buffer.len() > MAX_HEADERS_SIZE + 1 {
                                return Err(self.fail(ParseError::HeadersTooLarge));
                            }
                            self.state = ParserState::Headers {
                                method,
                                raw_target,
                                version,
                            };
                            self.scanned = buffer.len();
                            return Ok(ParseStatus::NeedMoreData);
                        }
                    };

                    if section_end > MAX_HEADERS_SIZE {
                        return Err(self.fail(ParseError::HeadersTooLarge));
                    }

                    let parsed = parse_header_section(&buffer[..section_end + 2])
                        .map_err(|err| self.fail(err))?;

                    buffer.drain(..section_end + 2);
                    self.scanned = 0;

                    // Chunked bodies are not supported.
                    if parsed.contains("Transfer-Encoding") {
                        return Err(self.fail(ParseError::Malformed));
                    }

                    let content_length = match parsed.first("Content-Length") {
                        Some(value) => value
                            .trim()
                            .parse::<usize>()
                            .map_err(|_| self.fail(ParseError::Malformed))?,
                        None => 0,
                    };
                    if content_length > self.max_body_size {
                        return Err(self.fail(ParseError::PayloadTooLarge));
                    }

                    self.state = ParserState::Body {
                        method,
                        raw_target,
                        version,
                        headers: parsed,
                        remaining: content_length,
                        body: Vec::with_capacity(content_length.min(64 * 1024)),
                    };
                }

                ParserState::Body {
                    method,
                    raw_target,
                    version,
                    headers,
                    mut remaining,
                    mut body,
                } => {
                    let take = remaining.min(buffer.len());
                    body.extend_from_slice(&buffer[..take]);
                    buffer.drain(..take);
                    remaining -= take;

                    if remaining > 0 {
                        self.state = ParserState::Body {
                            method,
                            raw_target,
                            version,
                            headers,
                            remaining,
                            body,
                        };
                        return Ok(ParseStatus::NeedMoreData);
                    }

                    self.state = ParserState::RequestLine;
                    self.scanned = 0;
                    let request = Request::new(method, raw_target, version, headers, body);
                    return Ok(ParseStatus::Complete(request));
                }

                ParserState::Failed(err) => {
                    self.state = ParserState::Failed(err.clone());
                    return Err(err);
                }
            }
        }
    }

    fn fail(&mut self, err: ParseError) -> ParseError {
        self.state = ParserState::Failed(err.clone());
        err
    }
}

// Parses the request line of the request, e.g. `GET /index HTTP/1.1`.
// Exactly three whitespace-separated tokens are required.
fn parse_request_line(line: &[u8]) -> Result<(Method, String, HttpVersion), ParseError> {
    let line = str::from_utf8(line).map_err(|_| ParseError::Malformed)?;

    let mut tokens = line.split_ascii_whitespace();
    let (method, target, version) = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Err(ParseError::Malformed),
    };
    if tokens.next().is_some() {
        return Err(ParseError::Malformed);
    }

    let method = Method::parse(method).ok_or(ParseError::MethodNotRecognized)?;
    let version = parse_http_version(version)?;
    Ok((method, target.to_owned(), version))
}

// Parses an `HTTP/1.x` version token.
fn parse_http_version(token: &str) -> Result<HttpVersion, ParseError> {
    let rest = token.strip_prefix("HTTP/").ok_or(ParseError::Malformed)?;
    let mut chars = rest.chars();
    match (chars.next(), chars.next(), chars.next(), chars.next()) {
        (Some('1'), Some('.'), Some(minor), None) if minor.is_ascii_digit() => {
            Ok(HttpVersion(1, minor as u8 - b'0'))
        }
        _ => Err(ParseError::UnsupportedVersion),
    }
}

// Parses a full header section, `section` being the header lines plus the
// final blank line.
fn parse_header_section(section: &[u8]) -> Result<Headers, ParseError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
    let parsed = match httparse::parse_headers(section, &mut slots) {
        Ok(httparse::Status::Complete((_, parsed))) => parsed,
        Ok(httparse::Status::Partial) | Err(_) => return Err(ParseError::Malformed),
    };

    let mut headers = Headers::new();
    for header in parsed {
        if !headers::is_valid_name(header.name) {
            return Err(ParseError::Malformed);
        }
        let value = str::from_utf8(header.value).map_err(|_| ParseError::Malformed)?;
        headers.append(header.name, value.trim());
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::{ParseError, ParseStatus, RequestParser};
    use crate::request::{HttpVersion, Method};

    fn buf(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    fn parse_one(parser: &mut RequestParser, buffer: &mut Vec<u8>) -> crate::Request {
        match parser.poll(buffer) {
            Ok(ParseStatus::Complete(request)) => request,
            other => panic!("expected a complete request, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn parses_a_simple_get() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"GET /hello?name=Alice HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let request = parse_one(&mut parser, &mut buffer);

        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.path(), "/hello");
        assert_eq!(request.query("name"), Some("Alice"));
        assert_eq!(request.version(), HttpVersion::HTTP_11);
        assert_eq!(request.headers().first("host"), Some("localhost"));
        assert!(request.body().is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn parses_incrementally_byte_by_byte() {
        let raw = b"POST /echo HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi";
        let mut parser = RequestParser::new();
        let mut buffer = Vec::new();

        for (i, byte) in raw.iter().enumerate() {
            buffer.push(*byte);
            match parser.poll(&mut buffer).unwrap() {
                ParseStatus::NeedMoreData => assert!(i + 1 < raw.len()),
                ParseStatus::Complete(request) => {
                    assert_eq!(i + 1, raw.len());
                    assert_eq!(request.body(), b"hi");
                    return;
                }
            }
        }
        panic!("request never completed");
    }

    #[test]
    fn empty_header_section_is_accepted() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"GET / HTTP/1.1\r\n\r\n");
        let request = parse_one(&mut parser, &mut buffer);
        assert!(request.headers().is_empty());
    }

    #[test]
    fn surplus_bytes_stay_in_the_buffer() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let first = parse_one(&mut parser, &mut buffer);
        assert_eq!(first.path(), "/a");

        let second = parse_one(&mut parser, &mut buffer);
        assert_eq!(second.path(), "/b");
        assert!(buffer.is_empty());
    }

    #[test]
    fn body_honors_content_length_exactly() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcdefgh");
        let request = parse_one(&mut parser, &mut buffer);
        assert_eq!(request.body(), b"abcde");
        assert_eq!(buffer, b"fgh");
    }

    #[test]
    fn request_line_at_the_limit_is_accepted() {
        // "GET " + path + " HTTP/1.1" must come to exactly 8192 bytes.
        let path_len = 8192 - "GET ".len() - " HTTP/1.1".len();
        let path = format!("/{}", "a".repeat(path_len - 1));
        let raw = format!("GET {} HTTP/1.1\r\n\r\n", path);

        let mut parser = RequestParser::new();
        let mut buffer = buf(raw.as_bytes());
        let request = parse_one(&mut parser, &mut buffer);
        assert_eq!(request.path().len(), path_len);
    }

    #[test]
    fn request_line_one_byte_over_is_rejected() {
        let path_len = 8193 - "GET ".len() - " HTTP/1.1".len();
        let path = format!("/{}", "a".repeat(path_len - 1));
        let raw = format!("GET {} HTTP/1.1\r\n\r\n", path);

        let mut parser = RequestParser::new();
        let mut buffer = buf(raw.as_bytes());
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::UriTooLong));
    }

    #[test]
    fn unterminated_oversized_request_line_is_rejected_early() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(&vec![b'a'; 9000]);
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::UriTooLong));
    }

    #[test]
    fn header_section_at_the_limit_is_accepted() {
        // One header line, sized so the section (line + CRLF) is 8192 bytes.
        let value_len = 8192 - "X-Big: ".len() - 2;
        let raw = format!(
            "GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n",
            "v".repeat(value_len)
        );

        let mut parser = RequestParser::new();
        let mut buffer = buf(raw.as_bytes());
        let request = parse_one(&mut parser, &mut buffer);
        assert_eq!(request.headers().first("x-big").map(str::len), Some(value_len));
    }

    #[test]
    fn header_section_one_byte_over_is_rejected() {
        let value_len = 8193 - "X-Big: ".len() - 2;
        let raw = format!(
            "GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n",
            "v".repeat(value_len)
        );

        let mut parser = RequestParser::new();
        let mut buffer = buf(raw.as_bytes());
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::HeadersTooLarge));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(
            parser.poll(&mut buffer),
            Err(ParseError::MethodNotRecognized)
        );
    }

    #[test]
    fn version_must_be_http_1x() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"GET / HTTP/2.0\r\n\r\n");
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::UnsupportedVersion));

        let mut parser = RequestParser::new();
        let mut buffer = buf(b"GET / FTP/1.1\r\n\r\n");
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::Malformed));

        let mut parser = RequestParser::new();
        let mut buffer = buf(b"GET / HTTP/1.0\r\n\r\n");
        let request = parse_one(&mut parser, &mut buffer);
        assert_eq!(request.version(), HttpVersion::HTTP_10);
    }

    #[test]
    fn request_line_needs_exactly_three_tokens() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"GET /\r\n\r\n");
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::Malformed));

        let mut parser = RequestParser::new();
        let mut buffer = buf(b"GET / HTTP/1.1 extra\r\n\r\n");
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::Malformed));
    }

    #[test]
    fn declared_body_over_the_ceiling_is_rejected() {
        let mut parser = RequestParser::with_max_body_size(16);
        let mut buffer = buf(b"POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n");
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::PayloadTooLarge));
    }

    #[test]
    fn garbage_content_length_is_malformed() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n");
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::Malformed));
    }

    #[test]
    fn chunked_transfer_encoding_is_malformed() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::Malformed));
    }

    #[test]
    fn duplicate_headers_keep_their_order() {
        let mut parser = RequestParser::new();
        let mut buffer =
            buf(b"GET / HTTP/1.1\r\nAccept: a\r\nHost: h\r\nAccept: b\r\n\r\n");
        let request = parse_one(&mut parser, &mut buffer);
        let values: Vec<&str> = request.headers().all("accept").collect();
        assert_eq!(values, ["a", "b"]);
    }

    #[test]
    fn invalid_header_name_is_malformed() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"GET / HTTP/1.1\r\nBad@Name: x\r\n\r\n");
        assert_eq!(parser.poll(&mut buffer), Err(ParseError::Malformed));
    }

    #[test]
    fn errors_are_sticky_until_reset() {
        let mut parser = RequestParser::new();
        let mut buffer = buf(b"BREW / HTTP/1.1\r\n\r\n");
        assert!(parser.poll(&mut buffer).is_err());
        assert_eq!(
            parser.poll(&mut buffer),
            Err(ParseError::MethodNotRecognized)
        );

        parser.reset();
        let mut buffer = buf(b"GET / HTTP/1.1\r\n\r\n");
        assert!(parser.poll(&mut buffer).is_ok());
    }

    #[test]
    fn mid_request_tracks_partial_progress() {
        let mut parser = RequestParser::new();
        assert!(!parser.mid_request());

        let mut buffer = buf(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab");
        assert!(matches!(
            parser.poll(&mut buffer).unwrap(),
            ParseStatus::NeedMoreData
        ));
        assert!(parser.mid_request());

        buffer.extend_from_slice(b"cd");
        parse_one(&mut parser, &mut buffer);
        assert!(!parser.mid_request());
    }
}
