// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Maps `(method, path)` pairs to handlers.
//!
//! Routes are tried in descending priority order (ties broken by
//! registration order); the first whose compiled pattern matches the whole
//! path wins. Matched handlers run inside the installed middleware chain.

pub mod middleware;
pub mod pattern;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

pub use self::middleware::{Middleware, MiddlewareChain, Next};
pub use self::pattern::{heuristic_priority, Pattern, PatternError};

use crate::handler::Handler;
use crate::request::{AttributeValue, Method, Request};
use crate::response::Response;

/// One registered route.
struct Route {
    method: Method,
    pattern: Pattern,
    handler: Arc<dyn Handler>,
    priority: i32,
    seq: u64,
}

/// A successful lookup: the winning route's handler plus the path
/// parameters its pattern captured.
pub struct RouteMatch {
    pub handler: Arc<dyn Handler>,
    pub params: Vec<(String, String)>,
    pub pattern: String,
}

/// Why a lookup produced no handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No route's pattern matches the path under any method.
    NotFound,
    /// Routes match the path, but none under the requested method. The
    /// payload lists the methods that do match, for the `Allow` header.
    MethodNotAllowed(Vec<Method>),
}

/// Handlers for the five standard REST operations on a resource. Missing
/// handlers simply yield fewer routes.
///
/// # Example
///
/// ```
/// use trireme::{handler, ResourceHandlers, Response, Router};
///
/// let mut router = Router::new();
/// router.resource("/users", ResourceHandlers::new()
///     .index(handler::sync(|_| Response::text("all users")))
///     .show(handler::sync(|rq| {
///         Response::text(format!("user {}", rq.path_param("id").unwrap_or("?")))
///     }))).unwrap();
/// ```
#[derive(Default)]
pub struct ResourceHandlers {
    index: Option<Arc<dyn Handler>>,
    show: Option<Arc<dyn Handler>>,
    create: Option<Arc<dyn Handler>>,
    update: Option<Arc<dyn Handler>>,
    delete: Option<Arc<dyn Handler>>,
}

impl ResourceHandlers {
    pub fn new() -> ResourceHandlers {
        ResourceHandlers::default()
    }

    /// `GET <base>`: list the collection.
    pub fn index(mut self, handler: impl Handler) -> Self {
        self.index = Some(Arc::new(handler));
        self
    }

    /// `GET <base>/{id}`: fetch one element.
    pub fn show(mut self, handler: impl Handler) -> Self {
        self.show = Some(Arc::new(handler));
        self
    }

    /// `POST <base>`: create an element.
    pub fn create(mut self, handler: impl Handler) -> Self {
        self.create = Some(Arc::new(handler));
        self
    }

    /// `PUT <base>/{id}`: replace an element.
    pub fn update(mut self, handler: impl Handler) -> Self {
        self.update = Some(Arc::new(handler));
        self
    }

    /// `DELETE <base>/{id}`: remove an element.
    pub fn delete(mut self, handler: impl Handler) -> Self {
        self.delete = Some(Arc::new(handler));
        self
    }
}

/// The routing table. Filled before the server starts, immutable afterwards
/// (engines hold it behind an `Arc`).
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    next_seq: u64,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    /// Registers a route with an explicit priority. Higher priorities are
    /// tried first; equal priorities keep registration order.
    pub fn add_route(
        &mut self,
        method: Method,
        pattern: &str,
        priority: i32,
        handler: impl Handler,
    ) -> Result<(), PatternError> {
        let pattern = Pattern::compile(pattern)?;
        self.push_route(method, pattern, priority, Arc::new(handler));
        Ok(())
    }

    /// Registers a `GET` route with priority 0.
    pub fn get(&mut self, pattern: &str, handler: impl Handler) -> Result<(), PatternError> {
        self.add_route(Method::Get, pattern, 0, handler)
    }

    /// Registers a `POST` route with priority 0.
    pub fn post(&mut self, pattern: &str, handler: impl Handler) -> Result<(), PatternError> {
        self.add_route(Method::Post, pattern, 0, handler)
    }

    /// Registers a `PUT` route with priority 0.
    pub fn put(&mut self, pattern: &str, handler: impl Handler) -> Result<(), PatternError> {
        self.add_route(Method::Put, pattern, 0, handler)
    }

    /// Registers a `DELETE` route with priority 0.
    pub fn delete(&mut self, pattern: &str, handler: impl Handler) -> Result<(), PatternError> {
        self.add_route(Method::Delete, pattern, 0, handler)
    }

    /// Registers the same handler for every supported method.
    pub fn all(&mut self, pattern: &str, handler: impl Handler) -> Result<(), PatternError> {
        let compiled = Pattern::compile(pattern)?;
        let handler: Arc<dyn Handler> = Arc::new(handler);
        for method in Method::ALL {
            self.push_route(method, compiled.clone(), 0, handler.clone());
        }
        Ok(())
    }

    /// Registers the standard REST routes for `base`; see
    /// [`ResourceHandlers`].
    pub fn resource(
        &mut self,
        base: &str,
        handlers: ResourceHandlers,
    ) -> Result<(), PatternError> {
        let base = base.trim_end_matches('/');
        let element = format!("{}/{{id}}", base);

        let mut add = |method: Method,
                       pattern: &str,
                       handler: Option<Arc<dyn Handler>>|
         -> Result<(), PatternError> {
            if let Some(handler) = handler {
                let pattern = Pattern::compile(pattern)?;
                self.push_route(method, pattern, 0, handler);
            }
            Ok(())
        };

        add(Method::Get, base, handlers.index)?;
        add(Method::Get, &element, handlers.show)?;
        add(Method::Post, base, handlers.create)?;
        add(Method::Put, &element, handlers.update)?;
        add(Method::Delete, &element, handlers.delete)?;
        Ok(())
    }

    /// Installs a middleware at the end of the chain. The first installed
    /// middleware runs first.
    pub fn middleware(&mut self, middleware: impl Middleware) {
        Arc::make_mut(&mut self.middlewares).push(Arc::new(middleware));
    }

    fn push_route(
        &mut self,
        method: Method,
        pattern: Pattern,
        priority: i32,
        handler: Arc<dyn Handler>,
    ) {
        self.routes.push(Route {
            method,
            pattern,
            handler,
            priority,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        self.routes
            .sort_by_key(|route| (Reverse(route.priority), route.seq));
    }

    /// Selects the route for `(method, path)`.
    pub fn lookup(&self, method: Method, path: &str) -> Result<RouteMatch, RouteError> {
        let mut allowed: Vec<Method> = Vec::new();

        for route in &self.routes {
            if let Some(params) = route.pattern.matches(path) {
                if route.method == method {
                    return Ok(RouteMatch {
                        handler: route.handler.clone(),
                        params,
                        pattern: route.pattern.source().to_owned(),
                    });
                }
                if !allowed.contains(&route.method) {
                    allowed.push(route.method);
                }
            }
        }

        if allowed.is_empty() {
            Err(RouteError::NotFound)
        } else {
            Err(RouteError::MethodNotAllowed(allowed))
        }
    }

    /// Looks the request up, stores the captured path parameters in its
    /// attribute bag, and runs the middleware chain around the matched
    /// handler.
    ///
    /// The returned future always yields a response: lookup failures become
    /// 404/405 (the latter with an `Allow` header), and errors anywhere in
    /// the chain become a 500 whose body is the error message.
    pub fn dispatch(&self, mut request: Request) -> BoxFuture<'static, Response> {
        let route_match = match self.lookup(request.method(), request.path()) {
            Ok(m) => m,
            Err(RouteError::NotFound) => {
                return future::ready(Response::text("Not Found").with_status_code(404)).boxed();
            }
            Err(RouteError::MethodNotAllowed(allowed)) => {
                let allow = allowed
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                return future::ready(
                    Response::text("Method Not Allowed")
                        .with_status_code(405)
                        .with_header("Allow", allow),
                )
                .boxed();
            }
        };

        for (name, value) in &route_match.params {
            request.set_attribute(
                format!("path.{}", name),
                AttributeValue::Text(value.clone()),
            );
        }
        let map: HashMap<String, String> = route_match.params.iter().cloned().collect();
        request.set_attribute("path.parameters", AttributeValue::Map(map));

        let chain = MiddlewareChain::new(self.middlewares.clone(), route_match.handler);
        chain
            .invoke(request)
            .map(|result| match result {
                Ok(response) => response,
                Err(err) => Response::text(err.to_string()).with_status_code(500),
            })
            .boxed()
    }
}
