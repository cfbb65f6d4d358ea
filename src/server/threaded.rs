// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Blocking-I/O reference engine: one accept thread, one pooled worker per
//! connection for as long as it lives.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::codec::parser::ParseStatus;
use crate::codec::serializer::{serialize_response, SerializeOptions};
use crate::config::ServerConfig;
use crate::connection::{ConnectionContext, ConnectionError, ReadOutcome, WriteOutcome};
use crate::metrics::Metrics;
use crate::request::Method;
use crate::response::Response;
use crate::router::Router;
use crate::service::{self, ServerInfo};
use crate::task_pool::TaskPool;

use super::{bind_listener, error_response, parse_error_bytes, Server, ServerError};

/// Thread-per-request engine.
///
/// The accept loop runs on its own thread; each accepted connection is
/// handed to a bounded worker pool and stays pinned to its worker until it
/// closes. Reads block with the configured idle timeout between keep-alive
/// requests.
pub struct ThreadedServer {
    config: ServerConfig,
    router: Option<Router>,
    metrics: Arc<Metrics>,
    state: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    pool: TaskPool,
}

impl ThreadedServer {
    pub fn new(config: ServerConfig, router: Router) -> ThreadedServer {
        ThreadedServer {
            config,
            router: Some(router),
            metrics: Arc::new(Metrics::new()),
            state: None,
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }
}

impl Server for ThreadedServer {
    fn start(&mut self) -> Result<(), ServerError> {
        if self.state.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let mut router = self.router.take().ok_or(ServerError::AlreadyRunning)?;

        let addr = self.config.effective_addr()?;
        let listener = bind_listener(addr, self.config.backlog).map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        let pool = TaskPool::bounded(
            "trireme-worker",
            self.config.core_workers,
            self.config.max_workers,
            self.config.max_workers * 4,
        )?;

        service::install_builtin_routes(
            &mut router,
            self.metrics.clone(),
            ServerInfo {
                name: self.config.server_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                engine: self.engine_name().to_owned(),
                port: local_addr.port(),
                backlog: self.config.backlog,
                read_buffer_size: self.config.read_buffer_size,
                write_buffer_size: self.config.write_buffer_size,
            },
            Some({
                let pool = pool.clone();
                Arc::new(move || serde_json::json!({ "workerPool": pool.stats() }))
            }),
        )?;
        let router = Arc::new(router);

        let running = Arc::new(AtomicBool::new(true));
        let accept_thread = {
            let running = running.clone();
            let metrics = self.metrics.clone();
            let config = self.config.clone();
            let pool = pool.clone();
            thread::Builder::new()
                .name("trireme-accept".to_owned())
                .spawn(move || {
                    accept_loop(listener, running, pool, router, metrics, config)
                })?
        };

        log::info!("threaded engine listening on {}", local_addr);
        self.state = Some(Running {
            local_addr,
            running,
            accept_thread: Some(accept_thread),
            pool,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServerError> {
        let mut state = self.state.take().ok_or(ServerError::NotRunning)?;
        state.running.store(false, Ordering::SeqCst);
        // A throwaway connection unblocks the accept call.
        let _ = TcpStream::connect(state.local_addr);
        if let Some(thread) = state.accept_thread.take() {
            let _ = thread.join();
        }
        state.pool.shutdown(self.config.shutdown_timeout);
        log::info!("threaded engine stopped");
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.as_ref().map(|s| s.local_addr)
    }

    fn engine_name(&self) -> &'static str {
        "threaded"
    }
}

fn accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    pool: TaskPool,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    config: ServerConfig,
) {
    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok((stream, _peer)) => stream,
            Err(err) => {
                if running.load(Ordering::SeqCst) {
                    log::warn!("accept failed: {}", err);
                    metrics.error();
                }
                continue;
            }
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }

        metrics.connection_opened();
        let router = router.clone();
        let metrics = metrics.clone();
        let config = config.clone();
        pool.spawn(move || {
            handle_connection(stream, &router, &metrics, &config);
            metrics.connection_closed();
        });
    }
}

// Drives one connection until it closes: read, parse, dispatch, write,
// then loop for keep-alive or return.
fn handle_connection(
    stream: TcpStream,
    router: &Router,
    metrics: &Metrics,
    config: &ServerConfig,
) {
    let _ = stream.set_nodelay(true);
    if stream.set_read_timeout(Some(config.idle_timeout)).is_err()
        || stream.set_write_timeout(Some(config.idle_timeout)).is_err()
    {
        metrics.error();
        return;
    }
    let mut ctx = ConnectionContext::new(stream, None, config);

    loop {
        match ctx.read_available() {
            Ok(ReadOutcome::Data(_)) => {}
            Ok(ReadOutcome::WouldBlock) => {
                // Idle timeout expired.
                if ctx.mid_request() {
                    metrics.error();
                }
                return;
            }
            Ok(ReadOutcome::Eof) => {
                if ctx.mid_request() {
                    metrics.error();
                }
                return;
            }
            Err(ConnectionError::RequestTooLarge) => {
                metrics.error();
                let response = error_response(413, "Payload Too Large");
                let _ = write_response(&mut ctx, &response, false, false, config);
                return;
            }
            Err(ConnectionError::Io(err)) => {
                log::debug!("read failed: {}", err);
                metrics.error();
                return;
            }
        }

        // Consume every complete request already buffered before blocking
        // on the socket again.
        loop {
            let request = match ctx.try_parse() {
                Ok(ParseStatus::NeedMoreData) => break,
                Ok(ParseStatus::Complete(request)) => request,
                Err(err) => {
                    metrics.error();
                    let bytes = parse_error_bytes(&err, &config.server_name);
                    ctx.queue_response(&bytes);
                    let _ = flush(&mut ctx);
                    return;
                }
            };

            metrics.request_received();
            let keep_alive = request.is_keep_alive();
            let head_only = request.method() == Method::Head;
            ctx.set_keep_alive(keep_alive);

            // The worker drives the handler future to completion; the
            // connection is pinned to this thread anyway.
            let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
                futures::executor::block_on(router.dispatch(request))
            }));
            let response = match dispatched {
                Ok(response) => response,
                Err(_) => error_response(500, "handler panicked"),
            };
            if response.status_code >= 500 {
                metrics.error();
            }

            if write_response(&mut ctx, &response, keep_alive, head_only, config).is_err() {
                metrics.error();
                return;
            }
            metrics.response_written();

            if !keep_alive {
                return;
            }
            ctx.reset_for_next_request();
        }
    }
}

fn write_response(
    ctx: &mut ConnectionContext<TcpStream>,
    response: &Response,
    keep_alive: bool,
    head_only: bool,
    config: &ServerConfig,
) -> Result<(), ConnectionError> {
    let bytes = serialize_response(
        response,
        &SerializeOptions {
            keep_alive,
            head_only,
            server_name: &config.server_name,
        },
    );
    ctx.queue_response(&bytes);
    flush(ctx)
}

fn flush(ctx: &mut ConnectionContext<TcpStream>) -> Result<(), ConnectionError> {
    match ctx.write_pending()? {
        WriteOutcome::Flushed => Ok(()),
        // On a blocking socket this means the write timeout expired.
        WriteOutcome::Pending => Err(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timed out",
        ))),
    }
}
