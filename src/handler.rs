// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The handler contract shared by every engine.
//!
//! A handler maps a request to a future of a response. Engines differ only
//! in *where* that future is driven: on the worker that owns the connection
//! (threaded), on an I/O pool (hybrid), or on the loop thread itself
//! (event-loop). Handlers must not retain the request after the future
//! completes.

use std::error::Error;
use std::future::Future;

use futures::future::{self, BoxFuture, FutureExt};
use quick_error::quick_error;

use crate::request::Request;
use crate::response::Response;

quick_error! {
    /// Why a handler failed to produce a response.
    #[derive(Debug)]
    pub enum HandlerError {
        /// The handler itself reported an error. The message ends up in the
        /// plain-text body of a 500 response.
        Thrown(message: String) {
            display("{}", message)
            from(err: Box<dyn Error + Send + Sync>) -> (err.to_string())
            from(message: &'static str) -> (message.to_owned())
            from()
        }
        /// The per-request deadline elapsed before the future completed.
        TimedOut {
            display("handler timed out")
        }
        /// The connection went away while the handler was still running.
        Cancelled {
            display("handler cancelled")
        }
    }
}

impl HandlerError {
    /// The status code an engine answers with when the connection is still
    /// writable.
    pub fn http_status(&self) -> u16 {
        match *self {
            HandlerError::Thrown(_) => 500,
            HandlerError::TimedOut => 408,
            HandlerError::Cancelled => 499,
        }
    }
}

/// What a handler future resolves to.
pub type HandlerResult = Result<Response, HandlerError>;

/// The future a handler hands back to the engine.
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// A request handler.
///
/// Usually built through [`sync`], [`sync_fallible`] or [`future_fn`]
/// rather than implemented by hand.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request) -> HandlerFuture;
}

/// Wraps an infallible synchronous closure into a handler whose future is
/// already complete.
///
/// # Example
///
/// ```
/// use trireme::{handler, Response};
///
/// let hello = handler::sync(|_request| Response::text("hello world"));
/// # let _ = hello;
/// ```
pub fn sync<F>(f: F) -> impl Handler
where
    F: Fn(Request) -> Response + Send + Sync + 'static,
{
    SyncHandler(f)
}

/// Like [`sync`], for closures that can fail. The error becomes a 500
/// response with the error message as body.
pub fn sync_fallible<F>(f: F) -> impl Handler
where
    F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
{
    FallibleHandler(f)
}

/// Wraps a closure returning a future. This is the native shape for the
/// event-loop engine, where the future is polled on the loop thread while
/// other connections make progress.
///
/// # Example
///
/// ```
/// use trireme::{handler, Response};
///
/// let echo = handler::future_fn(|request: trireme::Request| async move {
///     let body = request.body().to_vec();
///     Ok(Response::text(String::from_utf8_lossy(&body).into_owned()))
/// });
/// # let _ = echo;
/// ```
pub fn future_fn<F, Fut>(f: F) -> impl Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FutureHandler(f)
}

struct SyncHandler<F>(F);

impl<F> Handler for SyncHandler<F>
where
    F: Fn(Request) -> Response + Send + Sync + 'static,
{
    fn call(&self, request: Request) -> HandlerFuture {
        future::ready(Ok((self.0)(request))).boxed()
    }
}

struct FallibleHandler<F>(F);

impl<F> Handler for FallibleHandler<F>
where
    F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
{
    fn call(&self, request: Request) -> HandlerFuture {
        future::ready((self.0)(request)).boxed()
    }
}

struct FutureHandler<F>(F);

impl<F, Fut> Handler for FutureHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, request: Request) -> HandlerFuture {
        (self.0)(request).boxed()
    }
}
