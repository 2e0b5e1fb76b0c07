// crates/bacnet-rs/src/runtime.rs
//! The cooperative run loop: one thread advances timers, moves frames
//! between the director and the stack, and drains deferred functions.
//! Everything above the socket runs here, so none of the protocol state
//! needs locking.

use crate::comm::{Layer, LayerCtx, Stack};
use crate::pdu::Pdu;
use crate::task::{TaskManager, TimerTarget};
use crate::udp::UdpDirector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use log::{debug, error, info, warn};

/// Default upper bound on one trip through the loop, in milliseconds.
pub const DEFAULT_SPIN_MS: u64 = 1000;

type DeferredFn<A> = Box<dyn FnOnce(&mut Stack<A>, &mut TaskManager, u64) + Send>;

/// Owns a stack, its director and the clock, and runs them.
pub struct Runtime<A: Layer> {
    stack: Stack<A>,
    director: UdpDirector,
    tasks: TaskManager,
    deferred: Vec<DeferredFn<A>>,
    started: Instant,
    spin_ms: u64,
    stop_flag: Arc<AtomicBool>,
    dump_flag: Arc<AtomicBool>,
}

impl<A: Layer> Runtime<A> {
    pub fn new(mut stack: Stack<A>, director: UdpDirector) -> Self {
        let mut tasks = TaskManager::new();
        stack.start(&mut tasks, 0);
        Runtime {
            stack,
            director,
            tasks,
            deferred: Vec::new(),
            started: Instant::now(),
            spin_ms: DEFAULT_SPIN_MS,
            stop_flag: Arc::new(AtomicBool::new(false)),
            dump_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_spin_ms(&mut self, spin_ms: u64) {
        self.spin_ms = spin_ms.max(1);
    }

    /// Milliseconds since the runtime was created.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// A handle that stops the loop when set, usable from any thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    /// Queue a function to run on the loop thread, after the current
    /// pass. Functions queued while draining run on the next pass.
    pub fn defer(
        &mut self,
        function: impl FnOnce(&mut Stack<A>, &mut TaskManager, u64) + Send + 'static,
    ) {
        self.deferred.push(Box::new(function));
    }

    /// Run a closure against the application element, then flush
    /// whatever it produced to the wire.
    pub fn with_app<R>(&mut self, f: impl FnOnce(&mut A, &mut LayerCtx) -> R) -> R {
        let now_ms = self.now_ms();
        let result = self.stack.with_app(&mut self.tasks, now_ms, f);
        self.flush_outbound(now_ms);
        result
    }

    pub fn stack_mut(&mut self) -> &mut Stack<A> {
        &mut self.stack
    }

    fn flush_outbound(&mut self, now_ms: u64) {
        for pdu in self.stack.take_outbound() {
            self.director.send(pdu, &mut self.tasks, now_ms);
        }
    }

    fn dispatch_timer(&mut self, target: TimerTarget, token: u64, now_ms: u64) {
        match target {
            TimerTarget::Director => self.director.timer_expired(token),
            other => self
                .stack
                .timer_expired(other, token, &mut self.tasks, now_ms),
        }
    }

    fn drain_deferred(&mut self, now_ms: u64) {
        // snapshot so functions queued while draining wait a pass
        let functions = core::mem::take(&mut self.deferred);
        for function in functions {
            function(&mut self.stack, &mut self.tasks, now_ms);
        }
    }

    /// Make one pass over due timers and deferred functions without
    /// touching the socket.
    pub fn run_once(&mut self) {
        let now_ms = self.now_ms();
        while let Some((target, token)) = self.tasks.pop_due(now_ms) {
            self.dispatch_timer(target, token, now_ms);
        }
        self.drain_deferred(now_ms);
        self.flush_outbound(now_ms);
    }

    /// Install process-wide signal handlers: SIGTERM stops the loop,
    /// SIGUSR1 dumps diagnostics. Only sensible on the main thread;
    /// worker threads run without them.
    fn install_signal_handlers(&self) {
        if thread::current().name() != Some("main") {
            warn!("not the main thread, no signal handlers installed");
            return;
        }
        if let Err(err) =
            signal_hook::flag::register(signal_hook::consts::SIGTERM, self.stop_flag.clone())
        {
            warn!("SIGTERM handler not installed: {}", err);
        }
        if let Err(err) =
            signal_hook::flag::register(signal_hook::consts::SIGUSR1, self.dump_flag.clone())
        {
            warn!("SIGUSR1 handler not installed: {}", err);
        }
    }

    fn dump_state(&mut self) {
        warn!("---------- runtime state");
        warn!("    uptime: {} ms", self.now_ms());
        warn!("    pending timers: {}", self.tasks.len());
        warn!("    next deadline: {:?}", self.tasks.next_deadline());
        warn!("    deferred functions: {}", self.deferred.len());
    }

    /// Run until stopped. Each pass executes due timers, ships outbound
    /// frames, blocks on the socket for the computed delta, and drains
    /// the deferred queue.
    pub fn run(&mut self) {
        self.install_signal_handlers();
        info!("runtime started");

        while !self.stop_flag.load(Ordering::Relaxed) {
            if self.dump_flag.swap(false, Ordering::Relaxed) {
                self.dump_state();
            }

            let now_ms = self.now_ms();
            while let Some((target, token)) = self.tasks.pop_due(now_ms) {
                self.dispatch_timer(target, token, now_ms);
            }
            self.flush_outbound(now_ms);

            // sleep no longer than the next deadline, and barely at all
            // while deferred work is pending
            let mut delta = self.spin_ms;
            if let Some(deadline) = self.tasks.next_deadline() {
                delta = delta.min(deadline.saturating_sub(now_ms));
            }
            if !self.deferred.is_empty() {
                delta = delta.min(1);
            }

            if let Some(pdu) = self.director.poll(delta.max(1), &mut self.tasks, now_ms) {
                self.receive(pdu);
            }

            let now_ms = self.now_ms();
            self.drain_deferred(now_ms);
            self.flush_outbound(now_ms);
        }

        info!("runtime stopped");
        debug!("{} timers still pending", self.tasks.len());
    }

    /// Queue an inbound datagram for delivery on the next pass.
    fn receive(&mut self, pdu: Pdu) {
        self.defer(move |stack, tasks, now_ms| stack.receive(pdu, tasks, now_ms));
    }
}
