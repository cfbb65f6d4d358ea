// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Drives real sockets against all three engines: the same router, the
//! same raw HTTP bytes, engine-by-engine identical expectations.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use trireme::{handler, EngineKind, Response, Router, Server, ServerConfig};

const ENGINES: [EngineKind; 3] = [
    EngineKind::Threaded,
    EngineKind::Hybrid,
    EngineKind::EventLoop,
];

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default()
        .with_port(0)
        .with_request_timeout(Duration::from_millis(400))
        .with_idle_timeout(Duration::from_secs(2));
    // Keep teardown fast even when a test deliberately wedges a worker.
    config.shutdown_timeout = Duration::from_millis(300);
    config
}

fn test_router() -> Router {
    let mut router = Router::new();
    router
        .get("/hello", handler::sync(|rq| {
            let name = rq.query("name").unwrap_or("world").to_owned();
            Response::text(format!("Hello, {}!", name))
        }))
        .unwrap();
    router
        .post("/echo", handler::sync(|rq| {
            Response::text(String::from_utf8_lossy(rq.body()).into_owned())
        }))
        .unwrap();
    router
        .get(r"/users/{id:\d+}", handler::sync(|rq| {
            Response::text(format!("user {}", rq.path_param("id").unwrap_or("?")))
        }))
        .unwrap();
    router
        .get("/never", handler::future_fn(|_rq| futures::future::pending()))
        .unwrap();
    router
}

fn start_engine(kind: EngineKind, config: ServerConfig) -> (Box<dyn Server>, SocketAddr) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut server = trireme::serve(kind, config, test_router()).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

fn for_each_engine(test: impl Fn(EngineKind, SocketAddr)) {
    for kind in ENGINES {
        let (mut server, addr) = start_engine(kind, test_config());
        test(kind, addr);
        server.stop().unwrap();
    }
}

struct TestClient {
    stream: TcpStream,
}

#[derive(Debug)]
struct RawResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl TestClient {
    fn connect(addr: SocketAddr) -> TestClient {
        let stream = TcpStream::connect(addr).expect("connect failed");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        TestClient { stream }
    }

    fn send(&mut self, raw: &str) {
        self.stream.write_all(raw.as_bytes()).expect("send failed");
    }

    /// Reads exactly one response off the wire.
    fn read_response(&mut self) -> RawResponse {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            let n = self.stream.read(&mut chunk).expect("read failed");
            assert!(n > 0, "connection closed before a full response arrived");
            buffer.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8(buffer[..header_end].to_vec()).unwrap();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().expect("empty response");
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .expect("no status code")
            .parse()
            .expect("bad status code");
        let headers: Vec<(String, String)> = lines
            .map(|line| {
                let (name, value) = line.split_once(':').expect("bad header line");
                (name.trim().to_owned(), value.trim().to_owned())
            })
            .collect();

        let content_length: usize = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, v)| v.parse().expect("bad content length"))
            .unwrap_or(0);

        let mut body = buffer[header_end + 4..].to_vec();
        while body.len() < content_length {
            let n = self.stream.read(&mut chunk).expect("body read failed");
            assert!(n > 0, "connection closed mid-body");
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(content_length);

        RawResponse {
            status,
            headers,
            body,
        }
    }

    /// True if the server has closed the connection.
    fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0))
    }
}

fn get(addr: SocketAddr, target: &str) -> RawResponse {
    let mut client = TestClient::connect(addr);
    client.send(&format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        target
    ));
    client.read_response()
}

#[test]
fn hello_reads_its_query_parameter() {
    for_each_engine(|kind, addr| {
        let response = get(addr, "/hello?name=Alice");
        assert_eq!(response.status, 200, "engine {}", kind);
        assert_eq!(response.body_text(), "Hello, Alice!");
        assert_eq!(
            response.header("Content-Type"),
            Some("text/plain; charset=UTF-8")
        );
        assert!(response.header("Date").is_some());
        assert_eq!(response.header("Server"), Some("Trireme/1.0"));
    });
}

#[test]
fn echo_returns_the_posted_body() {
    for_each_engine(|kind, addr| {
        let mut client = TestClient::connect(addr);
        client.send(
            "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi",
        );
        let response = client.read_response();
        assert_eq!(response.status, 200, "engine {}", kind);
        assert_eq!(response.body_text(), "hi");
        assert_eq!(response.header("Content-Length"), Some("2"));
    });
}

#[test]
fn path_parameters_capture_digits_only() {
    for_each_engine(|kind, addr| {
        let hit = get(addr, "/users/42");
        assert_eq!(hit.status, 200, "engine {}", kind);
        assert!(hit.body_text().contains("42"));

        let miss = get(addr, "/users/abc");
        assert_eq!(miss.status, 404, "engine {}", kind);
    });
}

#[test]
fn health_reports_json_status() {
    for_each_engine(|kind, addr| {
        let response = get(addr, "/health");
        assert_eq!(response.status, 200, "engine {}", kind);
        let payload: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(payload["status"], "UP");
        assert!(payload["activeConnections"].is_number());
    });
}

#[test]
fn keep_alive_reuses_the_connection_in_order() {
    for_each_engine(|kind, addr| {
        let mut client = TestClient::connect(addr);

        client.send("GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let first = client.read_response();
        assert_eq!(first.status, 200, "engine {}", kind);
        assert_eq!(first.body_text(), "Hello, world!");
        assert_eq!(first.header("Connection"), Some("keep-alive"));

        client.send("GET /info HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let second = client.read_response();
        assert_eq!(second.status, 200, "engine {}", kind);
        assert_eq!(second.header("Connection"), Some("keep-alive"));
        let payload: serde_json::Value = serde_json::from_slice(&second.body).unwrap();
        assert_eq!(payload["engine"], kind.as_str());
        assert_eq!(payload["port"], addr.port());
    });
}

#[test]
fn connection_close_is_honored_after_one_response() {
    for_each_engine(|kind, addr| {
        let mut client = TestClient::connect(addr);
        client.send("GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        let response = client.read_response();
        assert_eq!(response.status, 200, "engine {}", kind);
        assert_eq!(response.header("Connection"), Some("close"));
        assert!(client.at_eof(), "engine {} kept the connection open", kind);
    });
}

#[test]
fn http_10_defaults_to_close() {
    for_each_engine(|kind, addr| {
        let mut client = TestClient::connect(addr);
        client.send("GET /hello HTTP/1.0\r\nHost: localhost\r\n\r\n");
        let response = client.read_response();
        assert_eq!(response.status, 200, "engine {}", kind);
        assert_eq!(response.header("Connection"), Some("close"));
        assert!(client.at_eof(), "engine {} kept the connection open", kind);
    });
}

#[test]
fn wrong_method_gets_405_with_allow() {
    for_each_engine(|kind, addr| {
        let mut client = TestClient::connect(addr);
        client.send("DELETE /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        let response = client.read_response();
        assert_eq!(response.status, 405, "engine {}", kind);
        assert_eq!(response.header("Allow"), Some("GET"));
    });
}

#[test]
fn unknown_method_token_gets_400_and_close() {
    for_each_engine(|kind, addr| {
        let mut client = TestClient::connect(addr);
        client.send("BREW /hello HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let response = client.read_response();
        assert_eq!(response.status, 400, "engine {}", kind);
        assert_eq!(response.header("Connection"), Some("close"));
        assert!(client.at_eof(), "engine {} kept the connection open", kind);
    });
}

#[test]
fn unsupported_version_gets_505() {
    for_each_engine(|kind, addr| {
        let mut client = TestClient::connect(addr);
        client.send("GET /hello HTTP/2.0\r\nHost: localhost\r\n\r\n");
        let response = client.read_response();
        assert_eq!(response.status, 505, "engine {}", kind);
        assert!(client.at_eof(), "engine {} kept the connection open", kind);
    });
}

#[test]
fn head_omits_the_body_but_keeps_its_length() {
    for_each_engine(|kind, addr| {
        let mut client = TestClient::connect(addr);
        client.send("HEAD /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");

        // Read headers only; Content-Length describes the suppressed body.
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            let n = client.stream.read(&mut chunk).expect("read failed");
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
        let head = String::from_utf8_lossy(&buffer);
        assert!(head.starts_with("HTTP/1.1 200 "), "engine {}", kind);
        assert!(
            head.contains("Content-Length: 13\r\n"),
            "engine {}: {}",
            kind,
            head
        );
        let body_start = buffer.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert!(buffer[body_start..].is_empty(), "engine {} sent a body", kind);
        assert!(client.at_eof());
    });
}

#[test]
fn slow_handlers_get_408_on_the_async_engines() {
    for kind in [EngineKind::Hybrid, EngineKind::EventLoop] {
        let (mut server, addr) = start_engine(kind, test_config());
        let mut client = TestClient::connect(addr);
        client.send("GET /never HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let response = client.read_response();
        assert_eq!(response.status, 408, "engine {}", kind);
        assert_eq!(response.header("Connection"), Some("close"));
        assert!(client.at_eof(), "engine {} kept the connection open", kind);
        server.stop().unwrap();
    }
}

#[test]
fn hybrid_rejects_admissions_beyond_the_ceiling() {
    let config = test_config().with_max_async_contexts(0);
    let (mut server, addr) = start_engine(EngineKind::Hybrid, config);

    let mut client = TestClient::connect(addr);
    client.send("GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 503);
    assert_eq!(response.header("Retry-After"), Some("1"));
    assert!(client.at_eof(), "503 must close the connection");

    server.stop().unwrap();
}

#[test]
fn metrics_count_requests_and_responses() {
    for_each_engine(|kind, addr| {
        let _ = get(addr, "/hello");
        let response = get(addr, "/metrics");
        assert_eq!(response.status, 200, "engine {}", kind);
        let payload: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert!(payload["totalRequests"].as_u64().unwrap() >= 2);
        assert!(payload["totalResponses"].as_u64().unwrap() >= 1);
        assert!(payload["totalConnections"].as_u64().unwrap() >= 2);
    });
}

#[test]
fn oversized_request_lines_get_414() {
    for_each_engine(|kind, addr| {
        let mut client = TestClient::connect(addr);
        let long_path = "a".repeat(9000);
        client.send(&format!(
            "GET /{} HTTP/1.1\r\nHost: localhost\r\n\r\n",
            long_path
        ));
        let response = client.read_response();
        assert_eq!(response.status, 414, "engine {}", kind);
        assert!(client.at_eof());
    });
}

#[test]
fn handler_errors_surface_as_500_with_message() {
    for kind in ENGINES {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut router = Router::new();
        router
            .get("/boom", handler::sync_fallible(|_| {
                Err(trireme::HandlerError::Thrown("kaboom".to_owned()))
            }))
            .unwrap();
        let mut server = trireme::serve(kind, test_config(), router).unwrap();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let response = get(addr, "/boom");
        assert_eq!(response.status, 500, "engine {}", kind);
        assert_eq!(response.body_text(), "kaboom");

        server.stop().unwrap();
    }
}
