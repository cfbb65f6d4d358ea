// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The three server engines and what they share.
//!
//! Every engine composes the same parts (codec, router, connection
//! contexts, metrics) and differs only in its concurrency architecture.
//! [`ThreadedServer`](threaded::ThreadedServer) blocks, one pooled worker
//! per connection. [`HybridServer`](hybrid::HybridServer) multiplexes
//! readiness on a selector and runs handlers on pools.
//! [`EventLoopServer`](evented::EventLoopServer) does everything on a
//! single readiness loop.

pub mod evented;
pub mod hybrid;
pub mod threaded;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use quick_error::quick_error;
use socket2::{Domain, Protocol, Socket, Type};

use crate::codec::parser::ParseError;
use crate::codec::serializer::{serialize_response, SerializeOptions};
use crate::config::ConfigError;
use crate::response::Response;
use crate::router::PatternError;

quick_error! {
    /// Why an engine failed to start or stop.
    #[derive(Debug)]
    pub enum ServerError {
        /// Binding or listening on the configured address failed.
        Bind(err: io::Error) {
            display("could not bind listener: {}", err)
        }
        Io(err: io::Error) {
            from()
            display("i/o error: {}", err)
        }
        Config(err: ConfigError) {
            from()
            display("{}", err)
        }
        /// Installing the built-in routes collided with the route table.
        Route(err: PatternError) {
            from()
            display("built-in route registration failed: {}", err)
        }
        /// `start` on an engine that is running, or that already ran once;
        /// engines are single-use.
        AlreadyRunning {
            display("server already running")
        }
        /// `stop` on an engine that never started.
        NotRunning {
            display("server not running")
        }
    }
}

/// The common surface of the three engines.
pub trait Server: Send {
    /// Binds the listener and starts serving in background threads.
    fn start(&mut self) -> Result<(), ServerError>;

    /// Stops accepting, lets in-flight work finish within the configured
    /// shutdown timeout, then closes every connection.
    fn stop(&mut self) -> Result<(), ServerError>;

    /// The bound address, once started. Useful with port 0.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn engine_name(&self) -> &'static str;
}

/// Which engine a launcher asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Threaded,
    Hybrid,
    EventLoop,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match *self {
            EngineKind::Threaded => "threaded",
            EngineKind::Hybrid => "hybrid",
            EngineKind::EventLoop => "eventloop",
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<EngineKind, String> {
        match raw {
            "threaded" => Ok(EngineKind::Threaded),
            "hybrid" => Ok(EngineKind::Hybrid),
            "eventloop" => Ok(EngineKind::EventLoop),
            other => Err(format!("unknown engine: {:?}", other)),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Binds a listener with an explicit backlog, which std does not expose.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(socket.into())
}

// The minimal response an engine sends before giving up on a connection.
pub(crate) fn error_response(status: u16, message: &str) -> Response {
    Response::text(message).with_status_code(status)
}

// Serialized form of the response to a parse failure. Always closes.
pub(crate) fn parse_error_bytes(err: &ParseError, server_name: &str) -> Vec<u8> {
    let (status, reason) = err.http_status();
    serialize_response(
        &error_response(status, reason),
        &SerializeOptions {
            keep_alive: false,
            head_only: false,
            server_name,
        },
    )
}
