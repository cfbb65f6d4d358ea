// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Single-threaded engine: one readiness loop runs accept, read, parse,
//! dispatch and write. Handlers execute on the loop thread and must return
//! a future without blocking; while a future is pending the loop serves
//! every other connection. A future's waker re-enters the loop through the
//! task queue, so completions are funnelled back to the single thread that
//! owns all connection state. CPU-bound work belongs on the shared
//! computation pool.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::ArcWake;
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

/// Event-loop engine.
pub struct EventLoopServer {
    config: ServerConfig,
    router: Option<Router>,
    metrics: Arc<Metrics>,
    cpu_pool: TaskPool,
    state: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    event_loop: RunningLoop,
}

impl EventLoopServer {
    pub fn new(config: ServerConfig, router: Router) -> io::Result<EventLoopServer> {
        let cpu_pool = TaskPool::fixed("trireme-cpu", config.cpu_pool_size)?;
        Ok(EventLoopServer {
            config,
            router: Some(router),
            metrics: Arc::new(Metrics::new()),
            cpu_pool,
            state: None,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// The pool handlers should offload CPU-bound work to; its completions
    /// wake the handler future, which re-enters the loop.
    ///
    /// ```
    /// use trireme::{handler, Response, Router, ServerConfig};
    /// use trireme::server::evented::EventLoopServer;
    ///
    /// let server = EventLoopServer::new(ServerConfig::default(), Router::new()).unwrap();
    /// let pool = server.cpu_pool();
    /// let mut router = Router::new();
    /// router.get("/fib", handler::future_fn(move |_rq| {
    ///     let work = pool.offload(|| (1u64..=20).product::<u64>());
    ///     async move {
    ///         let value = work.await.map_err(|_| "computation dropped")?;
    ///         Ok(Response::text(value.to_string()))
    ///     }
    /// })).unwrap();
    /// ```
    pub fn cpu_pool(&self) -> TaskPool {
        self.cpu_pool.clone()
    }
}

impl Server for EventLoopServer {
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
                let cpu = self.cpu_pool.clone();
                Arc::new(move || serde_json::json!({ "cpuPool": cpu.stats() }))
            }),
        )?;

        let event_loop = EventLoop::new(self.metrics.clone(), self.config.task_drain_limit)?;
        let event_loop = event_loop.spawn()?;

        let shared = Arc::new(Shared {
            router: Arc::new(router),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            handle: event_loop.handle(),
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

        log::info!("event-loop engine listening on {}", local_addr);
        self.state = Some(Running {
            local_addr,
            event_loop,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServerError> {
        let mut state = self.state.take().ok_or(ServerError::NotRunning)?;
        state.event_loop.stop(self.config.shutdown_timeout);
        self.cpu_pool.shutdown(self.config.shutdown_timeout);
        log::info!("event-loop engine stopped");
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.as_ref().map(|s| s.local_addr)
    }

    fn engine_name(&self) -> &'static str {
        "eventloop"
    }
}

struct Shared {
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    config: ServerConfig,
    handle: LoopHandle,
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

// Wakes a pending handler future by re-entering the loop: the wake posts a
// task, the task delivers a poll request to the connection's handler. The
// generation stamp keeps wakes from a finished request away from a newer
// one on the same recycled token.
struct PollWaker {
    handle: LoopHandle,
    token: Token,
    generation: u64,
}

impl ArcWake for PollWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let token = arc_self.token;
        let generation = arc_self.generation;
        arc_self.handle.submit(move |lctx| {
            lctx.deliver(token, Box::new(PollRequest { generation }));
        });
    }
}

struct PollRequest {
    generation: u64,
}

struct Deadline {
    generation: u64,
}

enum Phase {
    Reading,
    InFlight {
        future: BoxFuture<'static, Response>,
        keep_alive: bool,
        head_only: bool,
    },
    Writing {
        close_after: bool,
    },
}

// Generations are process-unique so that a wake or deadline surviving a
// closed connection can never match a request on a recycled token.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

struct ClientHandler {
    token: Token,
    ctx: ConnectionContext<TcpStream>,
    shared: Arc<Shared>,
    phase: Phase,
    // Stamp of the request currently owning this connection; stale wakes
    // and deadlines carry an older value.
    generation: u64,
}

impl ClientHandler {
    fn new(stream: TcpStream, token: Token, shared: Arc<Shared>) -> ClientHandler {
        let ctx = ConnectionContext::new(stream, Some(token), &shared.config);
        ClientHandler {
            token,
            ctx,
            shared,
            phase: Phase::Reading,
            generation: 0,
        }
    }

    fn set_interest(&mut self, lctx: &mut LoopCtx<'_>, interest: Interest) -> io::Result<()> {
        let token = self.token;
        lctx.registry().reregister(self.ctx.stream_mut(), token, interest)
    }

    fn poll_future(&self, future: &mut BoxFuture<'static, Response>) -> Poll<Response> {
        let waker = futures::task::waker(Arc::new(PollWaker {
            handle: self.shared.handle.clone(),
            token: self.token,
            generation: self.generation,
        }));
        let mut cx = Context::from_waker(&waker);
        future.as_mut().poll(&mut cx)
    }

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

    // Invokes the handler on the loop thread. The returned future is
    // polled once right away; if it is not ready the loop moves on and the
    // future's waker brings us back here.
    fn begin_request(&mut self, lctx: &mut LoopCtx<'_>, request: Request) -> IoAction {
        self.shared.metrics.request_received();
        let keep_alive = request.is_keep_alive();
        let head_only = request.method() == Method::Head;
        self.ctx.set_keep_alive(keep_alive);
        self.generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);

        let mut future = self.shared.router.dispatch(request);
        match self.poll_future(&mut future) {
            Poll::Ready(response) => self.complete(lctx, response, keep_alive, head_only),
            Poll::Pending => {
                self.phase = Phase::InFlight {
                    future,
                    keep_alive,
                    head_only,
                };
                let token = self.token;
                let generation = self.generation;
                lctx.schedule(self.shared.config.request_timeout, move |lctx| {
                    lctx.deliver(token, Box::new(Deadline { generation }));
                });
                IoAction::Continue
            }
        }
    }

    // The handler future resolved: seal the response and arm the write
    // path. Runs on the loop thread, which is the only place response
    // bytes ever reach a connection.
    fn complete(
        &mut self,
        lctx: &mut LoopCtx<'_>,
        response: Response,
        keep_alive: bool,
        head_only: bool,
    ) -> IoAction {
        if response.status_code >= 500 {
            self.shared.metrics.error();
        }
        let bytes = serialize_response(
            &response,
            &SerializeOptions {
                keep_alive,
                head_only,
                server_name: &self.shared.config.server_name,
            },
        );
        self.queue_and_flush(lctx, bytes, !keep_alive, false)
    }

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
        self.advance_reading(lctx)
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
                }
                Ok(ReadOutcome::WouldBlock) => {}
                Ok(ReadOutcome::Eof) => return self.on_eof(),
                Err(ConnectionError::RequestTooLarge) => {
                    self.shared.metrics.error();
                    let response = error_response(413, "Payload Too Large");
                    let bytes = serialize_response(
                        &response,
                        &SerializeOptions {
                            keep_alive: false,
                            head_only: false,
                            server_name: &self.shared.config.server_name,
                        },
                    );
                    return self.queue_and_flush(lctx, bytes, true, true);
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
        match message.downcast::<PollRequest>() {
            Ok(poll_request) => {
                if poll_request.generation != self.generation {
                    return IoAction::Continue;
                }
                let phase = mem::replace(&mut self.phase, Phase::Reading);
                if let Phase::InFlight {
                    mut future,
                    keep_alive,
                    head_only,
                } = phase
                {
                    match self.poll_future(&mut future) {
                        Poll::Ready(response) => {
                            self.complete(lctx, response, keep_alive, head_only)
                        }
                        Poll::Pending => {
                            self.phase = Phase::InFlight {
                                future,
                                keep_alive,
                                head_only,
                            };
                            IoAction::Continue
                        }
                    }
                } else {
                    self.phase = phase;
                    IoAction::Continue
                }
            }
            Err(message) => match message.downcast::<Deadline>() {
                Ok(deadline) => {
                    if deadline.generation != self.generation
                        || !matches!(self.phase, Phase::InFlight { .. })
                    {
                        return IoAction::Continue;
                    }
                    // Dropping the future cancels the handler.
                    self.phase = Phase::Reading;
                    self.shared.metrics.error();
                    let response = error_response(408, "Request Timeout");
                    let bytes = serialize_response(
                        &response,
                        &SerializeOptions {
                            keep_alive: false,
                            head_only: false,
                            server_name: &self.shared.config.server_name,
                        },
                    );
                    self.queue_and_flush(lctx, bytes, true, false)
                }
                Err(_) => IoAction::Continue,
            },
        }
    }

    fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(self.ctx.stream_mut());
        self.shared.metrics.connection_closed();
    }
}
