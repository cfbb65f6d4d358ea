// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Single-threaded readiness loop.
//!
//! One dedicated thread blocks on a mio [`Poll`], dispatches readiness to
//! registered handlers, fires due timers, and drains a lock-free task queue
//! that any thread may push to. Everything that touches a registration,
//! including the connection state the handlers own, happens on the loop
//! thread; the outside world gets in through [`LoopHandle::submit`].

use std::any::Any;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use quick_error::quick_error;
use slab::Slab;

use crate::metrics::Metrics;

/// Token reserved for the loop's own waker; never handed to a handler.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on how long one iteration may block in the multiplexer.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a cross-thread registration waits for the loop to pick it up.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// A callable unit queued from any thread and executed on the loop thread.
pub type LoopTask = Box<dyn FnOnce(&mut LoopCtx<'_>) + Send + 'static>;

/// What a handler wants done with its registration after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAction {
    Continue,
    Close,
}

/// Per-registration callback target. Implementations own their channel and
/// are only ever called on the loop thread.
pub trait IoHandler: Send + 'static {
    /// The channel is ready. `readable` includes read-closed (EOF).
    fn ready(&mut self, ctx: &mut LoopCtx<'_>, readable: bool, writable: bool) -> IoAction;

    /// A message posted through [`LoopCtx::deliver`] arrived. This is how
    /// work finished on other threads reaches the connection that asked
    /// for it.
    fn message(&mut self, _ctx: &mut LoopCtx<'_>, _message: Box<dyn Any + Send>) -> IoAction {
        IoAction::Continue
    }

    /// The registration is going away: deregister the channel and release
    /// resources. Called on [`IoAction::Close`], on handler panic, and for
    /// every survivor at loop shutdown.
    fn close(&mut self, registry: &Registry);
}

quick_error! {
    /// Why a cross-thread registration failed.
    #[derive(Debug)]
    pub enum RegisterError {
        /// The loop did not process the registration within the timeout;
        /// it is stopped, or an iteration is taking pathologically long.
        Timeout {
            display("event loop did not register the channel in time")
        }
        Io(err: io::Error) {
            from()
            display("registration failed: {}", err)
        }
    }
}

// (deadline, task), min-ordered by deadline then submission order.
struct ScheduledTask {
    deadline: Instant,
    seq: u64,
    task: LoopTask,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for ScheduledTask {}
impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTask {
    // Reversed so the BinaryHeap (a max-heap) pops the earliest deadline.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Slot {
    handler: Option<Box<dyn IoHandler>>,
}

/// The readiness loop. Build it, register nothing or everything, then
/// [`spawn`](Self::spawn) it onto its dedicated thread.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    handlers: Slab<Slot>,
    timers: BinaryHeap<ScheduledTask>,
    tasks: Arc<SegQueue<LoopTask>>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    task_drain_limit: usize,
    timer_seq: u64,
}

impl EventLoop {
    pub fn new(metrics: Arc<Metrics>, task_drain_limit: usize) -> io::Result<EventLoop> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(EventLoop {
            poll,
            events: Events::with_capacity(1024),
            handlers: Slab::new(),
            timers: BinaryHeap::new(),
            tasks: Arc::new(SegQueue::new()),
            waker: Arc::new(waker),
            running: Arc::new(AtomicBool::new(true)),
            metrics,
            task_drain_limit,
            timer_seq: 0,
        })
    }

    /// A cloneable, `Send` handle for talking to the loop from outside.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tasks: self.tasks.clone(),
            waker: self.waker.clone(),
            running: self.running.clone(),
        }
    }

    /// Moves the loop onto its own thread.
    pub fn spawn(mut self) -> io::Result<RunningLoop> {
        let handle = self.handle();
        let (exit_tx, exit_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("trireme-loop".to_owned())
            .spawn(move || {
                self.run();
                let _ = exit_tx.send(());
            })?;
        Ok(RunningLoop {
            handle,
            thread: Some(thread),
            exit_rx,
        })
    }

    /// Runs the loop on the current thread until [`LoopHandle::stop`].
    ///
    /// Each iteration, in order: block on the multiplexer (at most
    /// [`MAX_POLL_TIMEOUT`], less when a timer is due sooner), dispatch
    /// every ready registration, fire due timers, then drain up to the
    /// configured number of queued tasks.
    pub fn run(&mut self) {
        log::debug!("event loop running");
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let timeout = self
                .timers
                .peek()
                .map(|t| t.deadline.saturating_duration_since(now).min(MAX_POLL_TIMEOUT))
                .unwrap_or(MAX_POLL_TIMEOUT);

            let select_started = Instant::now();
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("multiplexer failure, stopping loop: {}", err);
                    self.metrics.error();
                    break;
                }
            }
            self.metrics.select_time_micros.fetch_add(
                select_started.elapsed().as_micros() as u64,
                Ordering::Relaxed,
            );
            self.metrics.loop_iterations.fetch_add(1, Ordering::Relaxed);

            // Drain the ready set first; each key is removed from it by
            // virtue of this collect + the next poll round.
            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .filter(|event| event.token() != WAKER_TOKEN)
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                    )
                })
                .collect();
            self.metrics
                .loop_events
                .fetch_add(ready.len() as u64, Ordering::Relaxed);

            for (token, readable, writable) in ready {
                let mut ctx = loop_ctx(self);
                drive_handler(&mut ctx, token, HandlerCall::Ready { readable, writable });
            }

            // Fire scheduled tasks whose deadline has passed.
            let now = Instant::now();
            loop {
                match self.timers.peek() {
                    Some(timer) if timer.deadline <= now => {}
                    _ => break,
                }
                let timer = match self.timers.pop() {
                    Some(timer) => timer,
                    None => break,
                };
                self.metrics.timers_fired.fetch_add(1, Ordering::Relaxed);
                let mut ctx = loop_ctx(self);
                run_task(&mut ctx, timer.task);
            }

            // Bounded task drain keeps iteration latency bounded even when
            // producers outpace the loop.
            for _ in 0..self.task_drain_limit {
                let task = match self.tasks.pop() {
                    Some(task) => task,
                    None => break,
                };
                self.metrics.tasks_executed.fetch_add(1, Ordering::Relaxed);
                let mut ctx = loop_ctx(self);
                run_task(&mut ctx, task);
            }
        }
        self.shutdown();
    }

    // Closes every registration and discards pending work.
    fn shutdown(&mut self) {
        log::debug!(
            "event loop stopping; closing {} registrations",
            self.handlers.len()
        );
        let registry = self.poll.registry();
        for (_, slot) in self.handlers.iter_mut() {
            if let Some(mut handler) = slot.handler.take() {
                handler.close(registry);
            }
        }
        self.handlers.clear();
        while self.tasks.pop().is_some() {}
        self.timers.clear();
    }
}

// Builds a LoopCtx over the loop's (disjoint) fields.
fn loop_ctx(event_loop: &mut EventLoop) -> LoopCtx<'_> {
    LoopCtx {
        registry: event_loop.poll.registry(),
        handlers: &mut event_loop.handlers,
        timers: &mut event_loop.timers,
        timer_seq: &mut event_loop.timer_seq,
        tasks: &event_loop.tasks,
        waker: &event_loop.waker,
        running: &event_loop.running,
        metrics: &event_loop.metrics,
    }
}

// One callback into a handler.
enum HandlerCall {
    Ready { readable: bool, writable: bool },
    Message(Box<dyn Any + Send>),
}

// Takes the handler out of its slot, runs the call on it, and applies the
// resulting action. A panicking handler is treated as `Close`: the key is
// cancelled, the channel closed, the registration removed.
fn drive_handler(ctx: &mut LoopCtx<'_>, token: Token, call: HandlerCall) -> bool {
    let mut handler = match ctx.handlers.get_mut(token.0).and_then(|s| s.handler.take()) {
        Some(handler) => handler,
        None => return false,
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match call {
        HandlerCall::Ready { readable, writable } => handler.ready(ctx, readable, writable),
        HandlerCall::Message(message) => handler.message(ctx, message),
    }));
    let action = match outcome {
        Ok(action) => action,
        Err(_) => {
            log::error!("handler for {:?} panicked; closing its channel", token);
            ctx.metrics.error();
            IoAction::Close
        }
    };

    match action {
        IoAction::Continue => {
            if let Some(slot) = ctx.handlers.get_mut(token.0) {
                slot.handler = Some(handler);
            }
            true
        }
        IoAction::Close => {
            handler.close(ctx.registry);
            if ctx.handlers.contains(token.0) {
                ctx.handlers.remove(token.0);
            }
            true
        }
    }
}

fn run_task(ctx: &mut LoopCtx<'_>, task: LoopTask) {
    if panic::catch_unwind(AssertUnwindSafe(|| task(ctx))).is_err() {
        log::error!("loop task panicked");
        ctx.metrics.error();
    }
}

/// The loop's services, as seen from code running on the loop thread.
pub struct LoopCtx<'a> {
    registry: &'a Registry,
    handlers: &'a mut Slab<Slot>,
    timers: &'a mut BinaryHeap<ScheduledTask>,
    timer_seq: &'a mut u64,
    tasks: &'a SegQueue<LoopTask>,
    waker: &'a Waker,
    running: &'a AtomicBool,
    metrics: &'a Arc<Metrics>,
}

impl<'a> LoopCtx<'a> {
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.metrics
    }

    /// Registers a channel and installs its handler. `make` receives the
    /// registered source and the allocated token, and may itself use the
    /// context (an accept handler registering a fresh connection does).
    pub fn register<S, F>(
        &mut self,
        mut source: S,
        interest: Interest,
        make: F,
    ) -> io::Result<Token>
    where
        S: Source,
        F: for<'b> FnOnce(S, Token, &mut LoopCtx<'b>) -> Box<dyn IoHandler>,
    {
        let token = Token(self.handlers.insert(Slot { handler: None }));
        if let Err(err) = self.registry.register(&mut source, token, interest) {
            self.handlers.remove(token.0);
            return Err(err);
        }
        let handler = make(source, token, self);
        if let Some(slot) = self.handlers.get_mut(token.0) {
            slot.handler = Some(handler);
        }
        Ok(token)
    }

    /// Queues a task for a later point of this or a following iteration.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(&mut LoopCtx<'_>) + Send + 'static,
    {
        self.tasks.push(Box::new(task));
        let _ = self.waker.wake();
    }

    /// Schedules a task to run once `delay` has elapsed.
    pub fn schedule<F>(&mut self, delay: Duration, task: F)
    where
        F: FnOnce(&mut LoopCtx<'_>) + Send + 'static,
    {
        *self.timer_seq += 1;
        self.timers.push(ScheduledTask {
            deadline: Instant::now() + delay,
            seq: *self.timer_seq,
            task: Box::new(task),
        });
    }

    /// Posts a message to the handler registered under `token`. Returns
    /// false when the registration is gone; the sender's work is then
    /// simply dropped.
    pub fn deliver(&mut self, token: Token, message: Box<dyn Any + Send>) -> bool {
        drive_handler(self, token, HandlerCall::Message(message))
    }

    /// Cancels a registration: the handler's `close` runs and the slot is
    /// freed. Must not be called by the handler on itself; handlers return
    /// [`IoAction::Close`] instead.
    pub fn close(&mut self, token: Token) {
        if let Some(mut handler) = self.handlers.get_mut(token.0).and_then(|s| s.handler.take()) {
            handler.close(self.registry);
        }
        if self.handlers.contains(token.0) {
            self.handlers.remove(token.0);
        }
    }

    /// Asks the loop to exit after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Cloneable, `Send` handle to a loop.
#[derive(Clone)]
pub struct LoopHandle {
    tasks: Arc<SegQueue<LoopTask>>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
}

impl LoopHandle {
    /// Pushes a task onto the queue and wakes the multiplexer. Tasks
    /// submitted from one thread run in submission order; across threads
    /// only queue happens-before ordering applies.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(&mut LoopCtx<'_>) + Send + 'static,
    {
        self.tasks.push(Box::new(task));
        let _ = self.waker.wake();
    }

    /// Schedules `task` to run on the loop after `delay`, by way of a
    /// submitted task that files the timer.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce(&mut LoopCtx<'_>) + Send + 'static,
    {
        self.submit(move |ctx| ctx.schedule(delay, task));
    }

    /// Registers a channel from outside the loop thread: the registration
    /// is deferred onto the loop and awaited, with [`REGISTER_TIMEOUT`].
    ///
    /// Calling this *from* the loop thread would deadlock; loop-side code
    /// uses [`LoopCtx::register`] directly.
    pub fn register<S, F>(
        &self,
        source: S,
        interest: Interest,
        make: F,
    ) -> Result<Token, RegisterError>
    where
        S: Source + Send + 'static,
        F: for<'b> FnOnce(S, Token, &mut LoopCtx<'b>) -> Box<dyn IoHandler> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.submit(move |ctx| {
            let _ = tx.send(ctx.register(source, interest, make));
        });
        match rx.recv_timeout(REGISTER_TIMEOUT) {
            Ok(result) => result.map_err(RegisterError::Io),
            Err(_) => Err(RegisterError::Timeout),
        }
    }

    /// Asks the loop to exit; returns immediately.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// A loop that has been moved onto its thread.
pub struct RunningLoop {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
    exit_rx: mpsc::Receiver<()>,
}

impl RunningLoop {
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Stops the loop and waits up to `timeout` for its thread to finish.
    /// Returns false if the thread had to be abandoned.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.handle.stop();
        match self.exit_rx.recv_timeout(timeout) {
            Ok(()) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            Err(_) => {
                log::warn!("event loop thread did not stop within {:?}", timeout);
                false
            }
        }
    }
}
