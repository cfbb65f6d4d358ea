// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use chrono::Utc;

use crate::response::Response;

/// Per-exchange context the serializer needs beyond the response itself.
#[derive(Debug, Clone)]
pub struct SerializeOptions<'a> {
    /// Value reflected in the `Connection` header.
    pub keep_alive: bool,
    /// True when answering a HEAD request: the body bytes are omitted from
    /// the wire while `Content-Length` still describes them.
    pub head_only: bool,
    /// Value of the auto-supplied `Server` header.
    pub server_name: &'a str,
}

impl Default for SerializeOptions<'static> {
    fn default() -> SerializeOptions<'static> {
        SerializeOptions {
            keep_alive: true,
            head_only: false,
            server_name: crate::SERVER_NAME,
        }
    }
}

/// Commits a response to wire bytes.
///
/// This is the sealing step: `Content-Length` is computed from the body
/// (and suppressed for 204/304), `Server`, `Date` and a default
/// `Content-Type` are supplied when the response lacks them, and
/// `Connection` reflects the keep-alive decision. `Content-Length`,
/// `Connection` and `Transfer-Encoding` entries in the response's own
/// header list are ignored; they are owned by this layer.
pub fn serialize_response(response: &Response, options: &SerializeOptions<'_>) -> Vec<u8> {
    let mut itoa_buf = itoa::Buffer::new();
    let suppress_body = response.status_code == 204 || response.status_code == 304;

    let mut out = Vec::with_capacity(128 + response.body.len());
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(itoa_buf.format(response.status_code).as_bytes());
    out.push(b' ');
    out.extend_from_slice(response.reason_phrase().as_bytes());
    out.extend_from_slice(b"\r\n");

    let mut found_server = false;
    let mut found_date = false;
    let mut found_content_type = false;
    for (name, value) in response.headers.iter() {
        // These are too low-level to take from the handler.
        if name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Connection")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
        {
            continue;
        }

        found_server |= name.eq_ignore_ascii_case("Server");
        found_date |= name.eq_ignore_ascii_case("Date");
        found_content_type |= name.eq_ignore_ascii_case("Content-Type");

        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !found_server {
        out.extend_from_slice(b"Server: ");
        out.extend_from_slice(options.server_name.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !found_date {
        out.extend_from_slice(b"Date: ");
        out.extend_from_slice(http_date().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !found_content_type && !response.body.is_empty() && !suppress_body {
        out.extend_from_slice(b"Content-Type: text/plain; charset=UTF-8\r\n");
    }

    if !suppress_body {
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(itoa_buf.format(response.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(if options.keep_alive {
        b"Connection: keep-alive\r\n".as_slice()
    } else {
        b"Connection: close\r\n".as_slice()
    });

    out.extend_from_slice(b"\r\n");

    if !suppress_body && !options.head_only {
        out.extend_from_slice(&response.body);
    }
    out
}

// The `Date` header value, RFC 7231 fixed-length format.
fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::{serialize_response, SerializeOptions};
    use crate::response::Response;

    fn text_of(bytes: &[u8]) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn head_and_body(bytes: &[u8]) -> (String, Vec<u8>) {
        let pos = bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("no header terminator");
        (text_of(&bytes[..pos + 2]), bytes[pos + 4..].to_vec())
    }

    #[test]
    fn supplies_server_date_length_and_type() {
        let out = serialize_response(&Response::empty(200), &SerializeOptions::default());
        let (head, body) = head_and_body(&out);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Server: Trireme/1.0\r\n"));
        assert!(head.contains("Date: "));
        assert!(head.contains("Content-Length: 0\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        // No default Content-Type for an empty body.
        assert!(!head.contains("Content-Type"));
        assert!(body.is_empty());
    }

    #[test]
    fn default_content_type_for_nonempty_bodies() {
        let mut response = Response::empty(200);
        response.body = b"x".to_vec();
        let out = serialize_response(&response, &SerializeOptions::default());
        let (head, _) = head_and_body(&out);
        assert!(head.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
    }

    #[test]
    fn explicit_server_header_wins() {
        let response = Response::empty(200).with_header("Server", "custom");
        let out = serialize_response(&response, &SerializeOptions::default());
        let (head, _) = head_and_body(&out);
        assert!(head.contains("Server: custom\r\n"));
        assert!(!head.contains("Server: Trireme/1.0"));
    }

    #[test]
    fn handler_supplied_content_length_is_ignored() {
        let response = Response::text("four").with_header("Content-Length", "999");
        let out = serialize_response(&response, &SerializeOptions::default());
        let (head, body) = head_and_body(&out);
        assert!(head.contains("Content-Length: 4\r\n"));
        assert!(!head.contains("999"));
        assert_eq!(body, b"four");
    }

    #[test]
    fn no_content_responses_carry_no_length_or_body() {
        let mut response = Response::empty(204);
        response.body = b"ignored".to_vec();
        let out = serialize_response(&response, &SerializeOptions::default());
        let (head, body) = head_and_body(&out);
        assert!(!head.contains("Content-Length"));
        assert!(body.is_empty());
    }

    #[test]
    fn head_only_keeps_length_but_drops_body() {
        let options = SerializeOptions {
            head_only: true,
            ..SerializeOptions::default()
        };
        let out = serialize_response(&Response::text("hello"), &options);
        let (head, body) = head_and_body(&out);
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(body.is_empty());
    }

    #[test]
    fn connection_header_reflects_keep_alive() {
        let options = SerializeOptions {
            keep_alive: false,
            ..SerializeOptions::default()
        };
        let out = serialize_response(&Response::empty(200), &options);
        let (head, _) = head_and_body(&out);
        assert!(head.contains("Connection: close\r\n"));
    }

    #[test]
    fn serialized_request_parses_back() {
        // Round trip: the serialized bytes must be readable by any HTTP/1.1
        // peer, which our own parser approximates for header syntax.
        let response = Response::text("payload").with_header("X-Marker", "yes");
        let out = serialize_response(&response, &SerializeOptions::default());
        let (head, body) = head_and_body(&out);

        for line in head.lines().skip(1) {
            let (name, value) = line.split_once(':').expect("bad header line");
            assert!(crate::headers::is_valid_name(name));
            assert!(!value.is_empty());
        }
        assert_eq!(body, b"payload");
    }
}
