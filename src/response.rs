// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::borrow::Cow;

use crate::headers::Headers;

/// Contains a prototype of a response.
///
/// A `Response` is freely mutable while the handler builds it; it is sealed
/// when the serializer commits it to bytes. At commit time `Content-Length`
/// is set to the body length (unless the status is 204 or 304), and `Date`,
/// `Server` and a default `Content-Type` are supplied if absent.
#[derive(Debug)]
pub struct Response {
    /// The status code to return to the client.
    pub status_code: u16,

    /// Overrides the standard reason phrase for the status code.
    pub reason: Option<Cow<'static, str>>,

    /// Headers to return in the response.
    ///
    /// `Content-Length`, `Connection` and `Transfer-Encoding` are managed by
    /// the serializer and are ignored if present in this list.
    pub headers: Headers,

    /// The body of the response, sent verbatim after the headers.
    pub body: Vec<u8>,
}

impl Response {
    /// Builds an empty response with the given status code.
    ///
    /// # Example
    ///
    /// ```
    /// use trireme::Response;
    /// let response = Response::empty(204);
    /// assert_eq!(response.status_code, 204);
    /// ```
    #[inline]
    pub fn empty(status_code: u16) -> Response {
        Response {
            status_code,
            reason: None,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Builds a `Response` that outputs plain text.
    ///
    /// # Example
    ///
    /// ```
    /// use trireme::Response;
    /// let response = Response::text("hello world");
    /// ```
    #[inline]
    pub fn text<S>(text: S) -> Response
    where
        S: Into<String>,
    {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain; charset=UTF-8");
        Response {
            status_code: 200,
            reason: None,
            headers,
            body: text.into().into_bytes(),
        }
    }

    /// Builds a `Response` that outputs HTML.
    ///
    /// # Example
    ///
    /// ```
    /// use trireme::Response;
    /// let response = Response::html("<p>hello <strong>world</strong></p>");
    /// ```
    #[inline]
    pub fn html<S>(content: S) -> Response
    where
        S: Into<String>,
    {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/html; charset=UTF-8");
        Response {
            status_code: 200,
            reason: None,
            headers,
            body: content.into().into_bytes(),
        }
    }

    /// Builds a `Response` that outputs JSON.
    ///
    /// Serialization failures (which only happen for types whose `Serialize`
    /// implementation can fail, e.g. maps with non-string keys) turn into a
    /// 500 response carrying the error message.
    ///
    /// # Example
    ///
    /// ```
    /// use trireme::Response;
    ///
    /// #[derive(serde::Serialize)]
    /// struct Greeting { message: &'static str }
    ///
    /// let response = Response::json(&Greeting { message: "hi" });
    /// assert_eq!(response.status_code, 200);
    /// ```
    pub fn json<T>(content: &T) -> Response
    where
        T: serde::Serialize,
    {
        match serde_json::to_vec(content) {
            Ok(body) => {
                let mut headers = Headers::new();
                headers.append("Content-Type", "application/json");
                Response {
                    status_code: 200,
                    reason: None,
                    headers,
                    body,
                }
            }
            Err(err) => Response::text(err.to_string()).with_status_code(500),
        }
    }

    /// Changes the status code of the response.
    ///
    /// # Example
    ///
    /// ```
    /// use trireme::Response;
    /// let response = Response::text("gone").with_status_code(410);
    /// ```
    #[inline]
    pub fn with_status_code(mut self, code: u16) -> Response {
        self.status_code = code;
        self
    }

    /// Appends a header to the response.
    #[inline]
    pub fn with_header<N, V>(mut self, name: N, value: V) -> Response
    where
        N: Into<String>,
        V: Into<String>,
    {
        self.headers.append(name, value);
        self
    }

    /// The reason phrase that will appear on the status line.
    pub fn reason_phrase(&self) -> &str {
        match self.reason {
            Some(ref reason) => reason,
            None => default_reason_phrase(self.status_code),
        }
    }

    /// Returns true if the status code of this `Response` indicates success.
    ///
    /// This is the range [200-399].
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status_code >= 200 && self.status_code < 400
    }

    /// Shortcut for `!response.is_success()`.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }
}

/// Returns the phrase corresponding to a status code.
pub fn default_reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",
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
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        499 => "Client Closed Request",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
