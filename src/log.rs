// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::time::{Duration, Instant};

use futures::future::FutureExt;

use crate::handler::HandlerFuture;
use crate::request::Request;
use crate::router::{Middleware, Next};

/// Middleware that writes one access-log line per request through the
/// `log` crate (target `trireme::access`): method, target, elapsed time,
/// status code. Successful responses log at info level, error responses
/// and failed chains at warn.
///
/// # Example
///
/// ```
/// use trireme::{RequestLogger, Router};
///
/// let mut router = Router::new();
/// router.middleware(RequestLogger);
/// ```
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn handle(&self, request: Request, next: Next) -> HandlerFuture {
        let started = Instant::now();
        let line = format!("{} {}", request.method(), request.raw_target());

        next.run(request)
            .map(move |result| {
                let elapsed = format_time(started.elapsed());
                match &result {
                    Ok(response) if response.is_error() => log::warn!(
                        target: "trireme::access",
                        "{} - {} - {}",
                        line,
                        elapsed,
                        response.status_code
                    ),
                    Ok(response) => log::info!(
                        target: "trireme::access",
                        "{} - {} - {}",
                        line,
                        elapsed,
                        response.status_code
                    ),
                    Err(err) => log::warn!(
                        target: "trireme::access",
                        "{} - {} - failed: {}",
                        line,
                        elapsed,
                        err
                    ),
                }
                result
            })
            .boxed()
    }
}

fn format_time(duration: Duration) -> String {
    let duration_in_ns = duration.as_nanos();

    if duration_in_ns < 1_000 {
        format!("{}ns", duration_in_ns)
    } else if duration_in_ns < 1_000_000 {
        format!("{:.1}us", duration_in_ns as f64 / 1_000.0)
    } else if duration_in_ns < 1_000_000_000 {
        format!("{:.1}ms", duration_in_ns as f64 / 1_000_000.0)
    } else {
        format!("{:.1}s", duration_in_ns as f64 / 1_000_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{format_time, RequestLogger};
    use crate::handler;
    use crate::request::{Method, Request};
    use crate::response::Response;
    use crate::router::Router;

    #[test]
    fn elapsed_times_pick_a_sensible_unit() {
        assert_eq!(format_time(Duration::from_nanos(120)), "120ns");
        assert_eq!(format_time(Duration::from_micros(3)), "3.0us");
        assert_eq!(format_time(Duration::from_millis(250)), "250.0ms");
        assert_eq!(format_time(Duration::from_secs(2)), "2.0s");
    }

    #[test]
    fn logger_passes_the_response_through_untouched() {
        let mut router = Router::new();
        router.middleware(RequestLogger);
        router
            .get("/x", handler::sync(|_| Response::text("body")))
            .unwrap();

        let request = Request::fake(Method::Get, "/x", vec![], vec![]);
        let response = futures::executor::block_on(router.dispatch(request));
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"body");
    }

    #[test]
    fn error_responses_also_pass_through_untouched() {
        let mut router = Router::new();
        router.middleware(RequestLogger);
        router
            .get("/gone", handler::sync(|_| Response::text("gone").with_status_code(410)))
            .unwrap();

        let request = Request::fake(Method::Get, "/gone", vec![], vec![]);
        let response = futures::executor::block_on(router.dispatch(request));
        assert_eq!(response.status_code, 410);
        assert_eq!(response.body, b"gone");
    }
}
