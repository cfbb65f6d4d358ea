// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Hybrid engine: a readiness selector owns accept, read and write; the
//! handler runs on the `io` pool; the completion stage serializes on the
//! `fast` pool and posts the bytes back to the selector, which flips
//! write-interest on. An asynchronous context carries each request across
//! the handoffs and races the handler against its deadline.

use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};

use crate::codec::parser::ParseStatus;
use crate::codec::serializer::{serialize_response, SerializeOptions};
use crate::config::ServerConfig;
use crate::connection::{ConnectionContext, ConnectionError, ReadOutcome, WriteOutcome};
use crate::event_loop::{EventLoop, IoAction, IoHandler, LoopCtx, LoopHandle, RegisterError, RunningLoop};
use crate::metrics::Metrics;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::router::Router;
use crate::service::{self, ServerInfo};
use crate::task_pool::TaskPool;

use super::{bind_listener, error_response, parse_error_bytes, Server, ServerError};

/// Selector + worker-pool engine.
pub struct HybridServer {
    config: ServerConfig,
    router: Option<Router>,
    metrics: Arc<Metrics>,
    io_pool: TaskPool,
    cpu_pool: TaskPool,
    fast_pool: TaskPool,
    state: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    event_loop: RunningLoop,
}

impl HybridServer {
    pub fn new(config: ServerConfig, router: Router) -> io::Result<HybridServer> {
        let io_pool = TaskPool::fixed("trireme-io", config.io_pool_size)?;
        let cpu_pool = TaskPool::fixed("trireme-cpu", config.cpu_pool_size)?;
        let fast_pool = TaskPool::fixed("trireme-fast", config.fast_pool_size)?;
        Ok(HybridServer {
            config,
            router: Some(router),
            metrics: Arc::new(Metrics::new()),
            io_pool,
            cpu_pool,
            fast_pool,
            state: None,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// The computation pool handlers may offload CPU-bound work to.
    pub fn cpu_pool(&self) -> TaskPool {
        self.cpu_pool.clone()
    }
}

impl Server for HybridServer {
    fn start(&mut self) -> Result<(), ServerError> {
        if self.state.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let mut router = self.router.take().ok_or(ServerError::AlreadyRunning)?;

        let addr = self.config.effective_addr()?;
        let std_listener = bind_listener(addr, self.config.backlog).map_err(ServerError::Bind)?;
        std_listener.set_nonblocking(true).map_err(ServerError::Bind)?;
        let listener = TcpListener::from_std(std_listener);
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

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
                let (io, cpu, fast) = (
                    self.io_pool.clone(),
                    self.cpu_pool.clone(),
                    self.fast_pool.clone(),
                );
                Arc::new(move || {
                    serde_json::json!({
                        "ioPool": io.stats(),
                        "cpuPool": cpu.stats(),
                        "fastPool": fast.stats(),
                    })
                })
            }),
        )?;

        let event_loop = EventLoop::new(self.metrics.clone(), self.config.task_drain_limit)?;
        let event_loop = event_loop.spawn()?;

        let shared = Arc::new(Shared {
            router: Arc::new(router),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            handle: event_loop.handle(),
            io_pool: self.io_pool.clone(),
            fast_pool: self.fast_pool.clone(),
            outstanding: Arc::new(AtomicUsize::new(0)),
        });

        event_loop
            .handle()
            .register(listener, Interest::READABLE, move |listener, _token, _ctx| {
                Box::new(AcceptHandler { listener, shared })
            })
            .map_err(|err| match err {
                RegisterError::Io(err) => ServerError::Bind(err),
                RegisterError::Timeout => ServerError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "event loop did not accept the listener registration",
                )),
            })?;

        log::info!("hybrid engine listening on {}", local_addr);
        self.state = Some(Running {
            local_addr,
            event_loop,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServerError> {
        let mut state = self.state.take().ok_or(ServerError::NotRunning)?;
        state.event_loop.stop(self.config.shutdown_timeout);
        self.io_pool.shutdown(self.config.shutdown_timeout);
        self.cpu_pool.shutdown(self.config.shutdown_timeout);
        self.fast_pool.shutdown(self.config.shutdown_timeout);
        log::info!("hybrid engine stopped");
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.as_ref().map(|s| s.local_addr)
    }

    fn engine_name(&self) -> &'static str {
        "hybrid"
    }
}

struct Shared {
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    config: ServerConfig,
    handle: LoopHandle,
    io_pool: TaskPool,
    fast_pool: TaskPool,
    outstanding: Arc<AtomicUsize>,
}

struct AcceptHandler {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl IoHandler for AcceptHandler {
    fn ready(&mut self, ctx: &mut LoopCtx<'_>, readable: bool, _writable: bool) -> IoAction {
        if !readable {
            return IoAction::Continue;
        }
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    self.shared.metrics.connection_opened();
                    let shared = self.shared.clone();
                    let registered =
                        ctx.register(stream, Interest::READABLE, move |stream, token, _ctx| {
                            Box::new(ClientHandler::new(stream, token, shared))
                                as Box<dyn IoHandler>
                        });
                    if let Err(err) = registered {
                        log::warn!("could not register connection from {}: {}", peer, err);
                        self.shared.metrics.error();
                        self.shared.metrics.connection_closed();
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    self.shared.metrics.error();
                    break;
                }
            }
        }
        IoAction::Continue
    }

    fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.listener);
    }
}

// Carries one request across the selector → io pool → fast pool → selector
// round trip. Whoever settles it first (completion, deadline, connection
// teardown) owns the outcome; everyone else drops theirs.
struct AsyncContext {
    token: Token,
    settled: AtomicBool,
    keep_alive: bool,
    head_only: bool,
}

impl AsyncContext {
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }
}

// Message from the fast pool: serialized response, ready for the wire.
// Carries its context so a late delivery to a recycled token is detected
// and dropped instead of corrupting an unrelated connection.
struct ResponseReady {
    actx: Arc<AsyncContext>,
    bytes: Vec<u8>,
    close_after: bool,
}

// Message from the deadline timer.
struct HandlerTimedOut {
    actx: Arc<AsyncContext>,
}

enum Phase {
    Reading,
    InFlight { actx: Arc<AsyncContext> },
    Writing { close_after: bool },
}

struct ClientHandler {
    token: Token,
    ctx: ConnectionContext<TcpStream>,
    shared: Arc<Shared>,
    phase: Phase,
}

impl ClientHandler {
    fn new(stream: TcpStream, token: Token, shared: Arc<Shared>) -> ClientHandler {
        let ctx = ConnectionContext::new(stream, Some(token), &shared.config);
        ClientHandler {
            token,
            ctx,
            shared,
            phase: Phase::Reading,
        }
    }

    fn set_interest(&mut self, lctx: &mut LoopCtx<'_>, interest: Interest) -> io::Result<()> {
        let token = self.token;
        lctx.registry().reregister(self.ctx.stream_mut(), token, interest)
    }

    // Parses buffered bytes. Only legal while `Phase::Reading`; during an
    // in-flight request or a pending write the bytes just accumulate, which
    // keeps responses in request order.
    fn advance_reading(&mut self, lctx: &mut LoopCtx<'_>) -> IoAction {
        match self.ctx.try_parse() {
            Ok(ParseStatus::NeedMoreData) => IoAction::Continue,
            Ok(ParseStatus::Complete(request)) => self.begin_request(lctx, request),
            Err(err) => {
                self.shared.metrics.error();
                let bytes = parse_error_bytes(&err, &self.shared.config.server_name);
                self.queue_and_flush(lctx, bytes, true, false)
            }
        }
    }

    fn begin_request(&mut self, lctx: &mut LoopCtx<'_>, request: Request) -> IoAction {
        self.shared.metrics.request_received();
        let keep_alive = request.is_keep_alive();
        let head_only = request.method() == Method::Head;
        self.ctx.set_keep_alive(keep_alive);

        // Admission control: beyond the ceiling the user handler is never
        // invoked.
        let outstanding = &self.shared.outstanding;
        let ceiling = self.shared.config.max_async_contexts;
        let admitted = loop {
            let current = outstanding.load(Ordering::SeqCst);
            if current >= ceiling {
                break false;
            }
            if outstanding
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break true;
            }
        };
        if !admitted {
            self.shared
                .metrics
                .rejected_admissions
                .fetch_add(1, Ordering::Relaxed);
            let response =
                error_response(503, "Service Unavailable").with_header("Retry-After", "1");
            return self.respond_now(lctx, &response, true, false);
        }

        let actx = Arc::new(AsyncContext {
            token: self.token,
            settled: AtomicBool::new(false),
            keep_alive,
            head_only,
        });
        self.phase = Phase::InFlight { actx: actx.clone() };

        // Deadline timer: first settler wins the connection.
        {
            let shared = self.shared.clone();
            let actx = actx.clone();
            lctx.schedule(self.shared.config.request_timeout, move |lctx| {
                if actx.settle() {
                    shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                    shared.metrics.error();
                    let token = actx.token;
                    lctx.deliver(token, Box::new(HandlerTimedOut { actx }));
                }
            });
        }

        // Handler invocation on the io pool; completion staged on the fast
        // pool, which serializes and posts the bytes back to the selector.
        let shared = self.shared.clone();
        let pool = self.shared.io_pool.clone();
        pool.spawn(move || {
            let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
                futures::executor::block_on(shared.router.dispatch(request))
            }));
            let response = match dispatched {
                Ok(response) => response,
                Err(_) => error_response(500, "handler panicked"),
            };

            if !actx.settle() {
                // Timed out or cancelled; the response has no taker.
                return;
            }
            shared.outstanding.fetch_sub(1, Ordering::SeqCst);

            let fast = shared.fast_pool.clone();
            fast.spawn(move || {
                if response.status_code >= 500 {
                    shared.metrics.error();
                }
                let bytes = serialize_response(
                    &response,
                    &SerializeOptions {
                        keep_alive: actx.keep_alive,
                        head_only: actx.head_only,
                        server_name: &shared.config.server_name,
                    },
                );
                let close_after = !actx.keep_alive;
                let token = actx.token;
                shared.handle.submit(move |lctx| {
                    lctx.deliver(
                        token,
                        Box::new(ResponseReady {
                            actx,
                            bytes,
                            close_after,
                        }),
                    );
                });
            });
        });

        IoAction::Continue
    }

    fn respond_now(
        &mut self,
        lctx: &mut LoopCtx<'_>,
        response: &Response,
        close_after: bool,
        drop_read_interest: bool,
    ) -> IoAction {
        let bytes = serialize_response(
            response,
            &SerializeOptions {
                keep_alive: !close_after,
                head_only: false,
                server_name: &self.shared.config.server_name,
            },
        );
        self.queue_and_flush(lctx, bytes, close_after, drop_read_interest)
    }

    // Queues response bytes and pushes as much as the channel takes. A
    // partial write leaves write-interest armed; read-interest is only
    // dropped on the 413 path.
    fn queue_and_flush(
        &mut self,
        lctx: &mut LoopCtx<'_>,
        bytes: Vec<u8>,
        close_after: bool,
        drop_read_interest: bool,
    ) -> IoAction {
        self.ctx.queue_response(&bytes);
        self.phase = Phase::Writing { close_after };

        match self.ctx.write_pending() {
            Ok(WriteOutcome::Flushed) => self.finish_response(lctx),
            Ok(WriteOutcome::Pending) => {
                let interest = if drop_read_interest {
                    Interest::WRITABLE
                } else {
                    Interest::READABLE | Interest::WRITABLE
                };
                if self.set_interest(lctx, interest).is_err() {
                    return IoAction::Close;
                }
                IoAction::Continue
            }
            Err(err) => {
                log::debug!("write failed on {:?}: {}", self.token, err);
                self.shared.metrics.error();
                IoAction::Close
            }
        }
    }

    // The response hit the wire in full: account for it, then either close
    // or recycle the connection for the next request.
    fn finish_response(&mut self, lctx: &mut LoopCtx<'_>) -> IoAction {
        let close_after = matches!(self.phase, Phase::Writing { close_after: true });
        self.shared.metrics.response_written();
        if close_after {
            return IoAction::Close;
        }

        self.ctx.reset_for_next_request();
        self.phase = Phase::Reading;
        if self.set_interest(lctx, Interest::READABLE).is_err() {
            return IoAction::Close;
        }
        // The client may have sent the next request already.
        self.advance_reading(lctx)
    }

    // True when `candidate` is the context of the request currently in
    // flight on this connection.
    fn in_flight_is(&self, candidate: &Arc<AsyncContext>) -> bool {
        match &self.phase {
            Phase::InFlight { actx } => Arc::ptr_eq(actx, candidate),
            _ => false,
        }
    }

    fn on_eof(&mut self) -> IoAction {
        let clean = matches!(self.phase, Phase::Reading)
            && !self.ctx.mid_request()
            && !self.ctx.has_pending_write();
        if !clean {
            self.shared.metrics.error();
        }
        IoAction::Close
    }
}

impl IoHandler for ClientHandler {
    fn ready(&mut self, lctx: &mut LoopCtx<'_>, readable: bool, writable: bool) -> IoAction {
        if writable && self.ctx.has_pending_write() {
            match self.ctx.write_pending() {
                Ok(WriteOutcome::Flushed) => {
                    if matches!(self.phase, Phase::Writing { .. }) {
                        match self.finish_response(lctx) {
                            IoAction::Continue => {}
                            IoAction::Close => return IoAction::Close,
                        }
                    }
                }
                Ok(WriteOutcome::Pending) => {}
                Err(err) => {
                    log::debug!("write failed on {:?}: {}", self.token, err);
                    self.shared.metrics.error();
                    return IoAction::Close;
                }
            }
        }

        if readable {
            match self.ctx.read_available() {
                Ok(ReadOutcome::Data(_)) => {
                    if matches!(self.phase, Phase::Reading) {
                        return self.advance_reading(lctx);
                    }
                    // In flight or writing: bytes buffered, parsing waits
                    // until the previous response is fully flushed.
                }
                Ok(ReadOutcome::WouldBlock) => {}
                Ok(ReadOutcome::Eof) => return self.on_eof(),
                Err(ConnectionError::RequestTooLarge) => {
                    self.shared.metrics.error();
                    let response = error_response(413, "Payload Too Large");
                    return self.respond_now(lctx, &response, true, true);
                }
                Err(ConnectionError::Io(err)) => {
                    log::debug!("read failed on {:?}: {}", self.token, err);
                    self.shared.metrics.error();
                    return IoAction::Close;
                }
            }
        }

        IoAction::Continue
    }

    fn message(
        &mut self,
        lctx: &mut LoopCtx<'_>,
        message: Box<dyn std::any::Any + Send>,
    ) -> IoAction {
        match message.downcast::<ResponseReady>() {
            Ok(ready) => {
                let ResponseReady {
                    actx,
                    bytes,
                    close_after,
                } = *ready;
                if !self.in_flight_is(&actx) {
                    return IoAction::Continue;
                }
                self.queue_and_flush(lctx, bytes, close_after, false)
            }
            Err(message) => match message.downcast::<HandlerTimedOut>() {
                Ok(timed_out) => {
                    if !self.in_flight_is(&timed_out.actx) {
                        return IoAction::Continue;
                    }
                    let response = error_response(408, "Request Timeout");
                    self.respond_now(lctx, &response, true, false)
                }
                Err(_) => IoAction::Continue,
            },
        }
    }

    fn close(&mut self, registry: &Registry) {
        if let Phase::InFlight { actx } = &self.phase {
            if actx.settle() {
                // Cancelled before the handler finished.
                self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                self.shared.metrics.error();
            }
        }
        let _ = registry.deregister(self.ctx.stream_mut());
        self.shared.metrics.connection_closed();
    }
}
