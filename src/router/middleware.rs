// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::sync::Arc;

use crate::handler::{Handler, HandlerFuture};
use crate::request::Request;

/// A handler decorator.
///
/// Middlewares run in installation order around the matched handler. Each
/// one receives the request and a [`Next`]; calling [`Next::run`] passes
/// control onwards, returning without calling it short-circuits the chain
/// with the middleware's own response.
///
/// Closures of the right shape implement this trait directly:
///
/// ```
/// use trireme::{Next, Request, Router};
///
/// let mut router = Router::new();
/// router.middleware(|mut request: Request, next: Next| {
///     request.set_attribute(
///         "traced",
///         trireme::AttributeValue::Text("yes".to_owned()),
///     );
///     next.run(request)
/// });
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, request: Request, next: Next) -> HandlerFuture;
}

impl<F> Middleware for F
where
    F: Fn(Request, Next) -> HandlerFuture + Send + Sync + 'static,
{
    fn handle(&self, request: Request, next: Next) -> HandlerFuture {
        self(request, next)
    }
}

/// An ordered sequence of middlewares plus the terminal handler.
///
/// The execution index advances monotonically: position `i` runs middleware
/// `i`, position `len` runs the terminal handler, and advancing past that
/// is an invariant violation.
pub struct MiddlewareChain {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    terminal: Arc<dyn Handler>,
}

impl MiddlewareChain {
    pub fn new(
        middlewares: Arc<Vec<Arc<dyn Middleware>>>,
        terminal: Arc<dyn Handler>,
    ) -> MiddlewareChain {
        MiddlewareChain {
            middlewares,
            terminal,
        }
    }

    /// Runs the whole chain for one request.
    pub fn invoke(&self, request: Request) -> HandlerFuture {
        Next {
            middlewares: self.middlewares.clone(),
            index: 0,
            terminal: self.terminal.clone(),
        }
        .run(request)
    }
}

/// Continuation handed to each middleware.
pub struct Next {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    index: usize,
    terminal: Arc<dyn Handler>,
}

impl Next {
    /// Advances the chain by one position.
    ///
    /// Consuming `self` makes re-running the same position impossible; a
    /// position past the terminal handler cannot be constructed, and
    /// reaching one anyway is a bug worth aborting on.
    pub fn run(self, request: Request) -> HandlerFuture {
        if self.index < self.middlewares.len() {
            let middleware = self.middlewares[self.index].clone();
            let next = Next {
                middlewares: self.middlewares,
                index: self.index + 1,
                terminal: self.terminal,
            };
            middleware.handle(request, next)
        } else if self.index == self.middlewares.len() {
            self.terminal.call(request)
        } else {
            panic!("middleware chain advanced past its end");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{MiddlewareChain, Middleware, Next};
    use crate::handler::{self, HandlerFuture};
    use crate::request::{Method, Request};
    use crate::response::Response;

    fn rq() -> Request {
        Request::fake(Method::Get, "/", vec![], vec![])
    }

    fn run(chain: &MiddlewareChain) -> Response {
        futures::executor::block_on(chain.invoke(rq())).unwrap()
    }

    fn tagging(tag: &'static str) -> Arc<dyn Middleware> {
        Arc::new(move |request: Request, next: Next| -> HandlerFuture {
            Box::pin(async move {
                let mut response = next.run(request).await?;
                response.body.extend_from_slice(tag.as_bytes());
                Ok(response)
            })
        })
    }

    #[test]
    fn middlewares_run_first_installed_first() {
        // Each middleware appends its tag after the handler ran, so the
        // first installed appends last: the body reads inner-to-outer.
        let chain = MiddlewareChain::new(
            Arc::new(vec![tagging("1"), tagging("2")]),
            Arc::new(handler::sync(|_| Response::text("h"))),
        );
        assert_eq!(run(&chain).body, b"h21");
    }

    #[test]
    fn empty_chain_calls_the_terminal_handler() {
        let chain = MiddlewareChain::new(
            Arc::new(Vec::new()),
            Arc::new(handler::sync(|_| Response::text("terminal"))),
        );
        assert_eq!(run(&chain).body, b"terminal");
    }

    #[test]
    fn short_circuit_skips_the_rest() {
        let stopper: Arc<dyn Middleware> =
            Arc::new(|_request: Request, _next: Next| -> HandlerFuture {
                Box::pin(async { Ok(Response::text("blocked").with_status_code(403)) })
            });
        let chain = MiddlewareChain::new(
            Arc::new(vec![stopper, tagging("unreachable")]),
            Arc::new(handler::sync(|_| Response::text("handler"))),
        );
        let response = run(&chain);
        assert_eq!(response.status_code, 403);
        assert_eq!(response.body, b"blocked");
    }

    #[test]
    fn middleware_sees_and_mutates_the_request_bag() {
        let setter: Arc<dyn Middleware> =
            Arc::new(|mut request: Request, next: Next| -> HandlerFuture {
                request.set_attribute(
                    "user",
                    crate::request::AttributeValue::Text("alice".to_owned()),
                );
                next.run(request)
            });
        let chain = MiddlewareChain::new(
            Arc::new(vec![setter]),
            Arc::new(handler::sync(|request| {
                let user = request
                    .attribute("user")
                    .and_then(|v| v.as_text())
                    .unwrap_or("nobody")
                    .to_owned();
                Response::text(user)
            })),
        );
        assert_eq!(run(&chain).body, b"alice");
    }
}
