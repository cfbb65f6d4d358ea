// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::collections::HashMap;
use std::fmt;

use crate::codec::query::parse_query;
use crate::headers::Headers;

/// The HTTP methods the framework understands.
///
/// A request line carrying any other token is rejected by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
}

impl Method {
    /// Every supported method, in a stable order.
    pub const ALL: [Method; 7] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Head,
        Method::Options,
        Method::Patch,
    ];

    /// Parses a request-line token. Matching is case-sensitive, as the
    /// grammar requires.
    pub fn parse(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            "PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP version (usually 1.0 or 1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpVersion(pub u8, pub u8);

impl HttpVersion {
    pub const HTTP_10: HttpVersion = HttpVersion(1, 0);
    pub const HTTP_11: HttpVersion = HttpVersion(1, 1);
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.0, self.1)
    }
}

/// A value in the request's attribute bag.
///
/// The bag carries data downstream between the router, middlewares and the
/// handler: captured path parameters are stored as [`AttributeValue::Text`]
/// under `path.<name>`, and the whole parameter mapping as
/// [`AttributeValue::Map`] under `path.parameters`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Text(String),
    Map(HashMap<String, String>),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(text) => Some(text),
            AttributeValue::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, String>> {
        match self {
            AttributeValue::Text(_) => None,
            AttributeValue::Map(map) => Some(map),
        }
    }
}

/// A parsed HTTP request.
///
/// Everything except the attribute bag is frozen once the parser has built
/// the value. The body length always equals the declared `Content-Length`
/// (zero when the header is absent); the parser does not hand over requests
/// that violate this.
#[derive(PartialEq)]
pub struct Request {
    method: Method,
    raw_target: String,
    path: String,
    version: HttpVersion,
    headers: Headers,
    body: Vec<u8>,
    query: Vec<(String, String)>,
    attributes: HashMap<String, AttributeValue>,
}

impl Request {
    pub(crate) fn new(
        method: Method,
        raw_target: String,
        version: HttpVersion,
        headers: Headers,
        body: Vec<u8>,
    ) -> Request {
        let (path, query) = match raw_target.find('?') {
            Some(pos) => (
                raw_target[..pos].to_owned(),
                parse_query(&raw_target[pos + 1..]),
            ),
            None => (raw_target.clone(), Vec::new()),
        };

        Request {
            method,
            raw_target,
            path,
            version,
            headers,
            body,
            query,
            attributes: HashMap::new(),
        }
    }

    /// Builds a request out of thin air, as if it had been parsed off a
    /// socket. Meant for tests and doc examples.
    ///
    /// # Example
    ///
    /// ```
    /// use trireme::{Method, Request};
    ///
    /// let request = Request::fake(Method::Get, "/hello?name=Alice", vec![], vec![]);
    /// assert_eq!(request.path(), "/hello");
    /// assert_eq!(request.query("name"), Some("Alice"));
    /// ```
    pub fn fake(
        method: Method,
        raw_target: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Request {
        Request::new(
            method,
            raw_target.to_owned(),
            HttpVersion::HTTP_11,
            headers.into_iter().collect(),
            body,
        )
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The target exactly as it appeared on the request line, query string
    /// included.
    #[inline]
    pub fn raw_target(&self) -> &str {
        &self.raw_target
    }

    /// The path component of the target, without the query string.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// First value of the given query parameter.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All query parameters in the order they appeared.
    #[inline]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    /// Reads an attribute from the bag.
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Stores an attribute in the bag, replacing any previous value.
    pub fn set_attribute<K>(&mut self, key: K, value: AttributeValue)
    where
        K: Into<String>,
    {
        self.attributes.insert(key.into(), value);
    }

    /// Shortcut for the captured path parameter `name`.
    ///
    /// # Example
    ///
    /// ```
    /// use trireme::{AttributeValue, Method, Request};
    ///
    /// let mut request = Request::fake(Method::Get, "/users/42", vec![], vec![]);
    /// request.set_attribute("path.id", AttributeValue::Text("42".to_owned()));
    /// assert_eq!(request.path_param("id"), Some("42"));
    /// ```
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(&format!("path.{}", name))
            .and_then(|v| v.as_text())
    }

    /// Whether the connection should be kept open after this exchange.
    ///
    /// HTTP/1.1 defaults to keep-alive unless the request says
    /// `Connection: close`; HTTP/1.0 defaults to close unless the request
    /// says `Connection: keep-alive`. The request headers govern, never the
    /// response.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            HttpVersion(1, 0) => self.headers.has_value("Connection", "keep-alive"),
            _ => !self.headers.has_value("Connection", "close"),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &self.raw_target)
            .field("version", &self.version)
            .field("headers", &self.headers.len())
            .field("body", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeValue, HttpVersion, Method, Request};
    use crate::headers::Headers;

    #[test]
    fn method_tokens_round_trip() {
        for method in Method::ALL {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("BREW"), None);
        assert_eq!(Method::parse("get"), None);
    }

    #[test]
    fn target_splits_into_path_and_query() {
        let rq = Request::fake(Method::Get, "/hello?name=Alice&x=1", vec![], vec![]);
        assert_eq!(rq.path(), "/hello");
        assert_eq!(rq.raw_target(), "/hello?name=Alice&x=1");
        assert_eq!(rq.query("name"), Some("Alice"));
        assert_eq!(rq.query("x"), Some("1"));
        assert_eq!(rq.query("missing"), None);
    }

    #[test]
    fn keep_alive_follows_version_and_connection_header() {
        let mk = |version, connection: Option<&str>| {
            let mut headers = Headers::new();
            if let Some(value) = connection {
                headers.append("Connection", value);
            }
            Request::new(Method::Get, "/".to_owned(), version, headers, Vec::new())
        };

        assert!(mk(HttpVersion::HTTP_11, None).is_keep_alive());
        assert!(!mk(HttpVersion::HTTP_11, Some("close")).is_keep_alive());
        assert!(mk(HttpVersion::HTTP_11, Some("Keep-Alive")).is_keep_alive());
        assert!(!mk(HttpVersion::HTTP_10, None).is_keep_alive());
        assert!(mk(HttpVersion::HTTP_10, Some("keep-alive")).is_keep_alive());
    }

    #[test]
    fn attribute_bag_stores_text_and_maps() {
        let mut rq = Request::fake(Method::Get, "/users/7", vec![], vec![]);
        rq.set_attribute("path.id", AttributeValue::Text("7".to_owned()));
        assert_eq!(rq.path_param("id"), Some("7"));
        assert_eq!(rq.path_param("other"), None);

        let map: std::collections::HashMap<_, _> =
            [("id".to_owned(), "7".to_owned())].into_iter().collect();
        rq.set_attribute("path.parameters", AttributeValue::Map(map));
        let stored = rq.attribute("path.parameters").unwrap().as_map().unwrap();
        assert_eq!(stored.get("id").map(String::as_str), Some("7"));
    }
}
