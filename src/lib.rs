// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! One hull, three banks of oars.
//!
//! Trireme is a didactic HTTP/1.1 framework: the same request/response
//! types, the same incremental parser, the same priority router and
//! middleware chain, driven by three interchangeable server engines so the
//! concurrency architectures can be compared on equal footing.
//!
//! - [`ThreadedServer`](server::threaded::ThreadedServer): blocking I/O,
//!   one pooled worker per connection.
//! - [`HybridServer`](server::hybrid::HybridServer): a readiness selector
//!   for accept/read/write, handler execution on worker pools, an
//!   asynchronous context bridging the handoffs.
//! - [`EventLoopServer`](server::evented::EventLoopServer): a
//!   single-threaded readiness loop end to end; handlers return futures
//!   and must never block the loop.
//!
//! # Example
//!
//! ```no_run
//! use trireme::{handler, EngineKind, Response, Router, ServerConfig};
//!
//! let mut router = Router::new();
//! router.get("/hello", handler::sync(|request| {
//!     let name = request.query("name").unwrap_or("world");
//!     Response::text(format!("Hello, {}!", name))
//! })).unwrap();
//!
//! let mut server = trireme::serve(
//!     EngineKind::EventLoop,
//!     ServerConfig::default(),
//!     router,
//! ).unwrap();
//! server.start().unwrap();
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod event_loop;
pub mod handler;
pub mod headers;
pub mod log;
pub mod metrics;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod service;
pub mod task_pool;

pub use crate::codec::parser::{ParseError, ParseStatus, RequestParser};
pub use crate::config::{ConfigError, ServerConfig};
pub use crate::connection::ConnectionContext;
pub use crate::event_loop::{EventLoop, LoopHandle};
pub use crate::handler::{Handler, HandlerError, HandlerFuture, HandlerResult};
pub use crate::headers::Headers;
pub use crate::log::RequestLogger;
pub use crate::metrics::{Metrics, MetricsSink, MetricsSnapshot};
pub use crate::request::{AttributeValue, HttpVersion, Method, Request};
pub use crate::response::Response;
pub use crate::router::{
    Middleware, Next, PatternError, ResourceHandlers, RouteError, RouteMatch, Router,
};
pub use crate::server::{EngineKind, Server, ServerError};
pub use crate::task_pool::TaskPool;

/// Default value of the `Server` response header.
pub const SERVER_NAME: &str = "Trireme/1.0";

/// Builds the requested engine around a configured router.
///
/// The engine is returned stopped; call [`Server::start`] to bind and
/// serve. A launcher maps the result like this: bind failures exit 1,
/// argument errors (unknown engine, bad config keys) exit 2.
pub fn serve(
    kind: EngineKind,
    config: ServerConfig,
    router: Router,
) -> Result<Box<dyn Server>, ServerError> {
    Ok(match kind {
        EngineKind::Threaded => {
            Box::new(server::threaded::ThreadedServer::new(config, router))
        }
        EngineKind::Hybrid => Box::new(server::hybrid::HybridServer::new(config, router)?),
        EngineKind::EventLoop => {
            Box::new(server::evented::EventLoopServer::new(config, router)?)
        }
    })
}
