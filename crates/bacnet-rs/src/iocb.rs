// crates/bacnet-rs/src/iocb.rs
//! I/O control blocks: the handles an application holds while a
//! confirmed request is in flight.
//!
//! An IOCB moves through IDLE, PENDING, ACTIVE and then exactly one of
//! COMPLETED or ABORTED; the completion signal fires once. Controllers
//! serialise the blocks: a queue controller runs one block at a time and
//! keeps the rest in a priority queue.

use crate::error::BacnetError;
use crate::pdu::Address;
use crate::services::ServiceMessage;
use crate::task::TimerHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use log::{debug, trace};

static NEXT_IOCB_ID: AtomicU64 = AtomicU64::new(1);

/// IOCB lifecycle states, in their total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoState {
    Idle,
    Pending,
    Active,
    Completed,
    Aborted,
}

impl IoState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IoState::Completed | IoState::Aborted)
    }
}

/// Why an IOCB aborted.
#[derive(Debug, Clone)]
pub enum IocbError {
    /// The block's own deadline passed.
    Timeout,
    /// The peer answered with an error, reject or abort.
    Response(ServiceMessage),
    /// The request never left this device.
    Local(BacnetError),
}

pub type IocbRef = Arc<Iocb>;
type Callback = Box<dyn FnOnce(&Iocb) + Send>;

struct IocbState {
    io_state: IoState,
    request: Option<ServiceMessage>,
    response: Option<ServiceMessage>,
    error: Option<IocbError>,
    callbacks: Vec<Callback>,
    timeout: Option<TimerHandle>,
}

/// One in-flight request. Shared between the application thread(s) and
/// the protocol loop; the loop completes it, anyone may wait on it.
pub struct Iocb {
    id: u64,
    destination: Address,
    priority: u8,
    state: Mutex<IocbState>,
    complete: Condvar,
}

impl Iocb {
    pub fn new(destination: Address, request: ServiceMessage) -> IocbRef {
        Self::with_priority(destination, request, 0)
    }

    /// Lower priority numbers run first.
    pub fn with_priority(destination: Address, request: ServiceMessage, priority: u8) -> IocbRef {
        Arc::new(Iocb {
            id: NEXT_IOCB_ID.fetch_add(1, Ordering::Relaxed),
            destination,
            priority,
            state: Mutex::new(IocbState {
                io_state: IoState::Idle,
                request: Some(request),
                response: None,
                error: None,
                callbacks: Vec::new(),
                timeout: None,
            }),
            complete: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn io_state(&self) -> IoState {
        self.state.lock().unwrap().io_state
    }

    pub fn response(&self) -> Option<ServiceMessage> {
        self.state.lock().unwrap().response.clone()
    }

    pub fn error(&self) -> Option<IocbError> {
        self.state.lock().unwrap().error.clone()
    }

    /// A copy of the request for (re)transmission.
    pub fn request(&self) -> Option<ServiceMessage> {
        self.state.lock().unwrap().request.clone()
    }

    /// Run `callback` when the block finishes. A block that has already
    /// finished runs it immediately.
    pub fn add_callback(&self, callback: impl FnOnce(&Iocb) + Send + 'static) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.io_state.is_terminal() {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Block the calling thread until the block finishes. Only sensible
    /// from a thread other than the protocol loop.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.io_state.is_terminal() {
            state = self.complete.wait(state).unwrap();
        }
    }

    pub(crate) fn set_timeout_handle(&self, handle: TimerHandle) {
        self.state.lock().unwrap().timeout = Some(handle);
    }

    pub(crate) fn take_timeout_handle(&self) -> Option<TimerHandle> {
        self.state.lock().unwrap().timeout.take()
    }

    /// States only move forward.
    fn advance(state: &mut IocbState, new_state: IoState) -> Result<(), BacnetError> {
        if new_state < state.io_state {
            return Err(BacnetError::InvalidState("IOCB state moved backwards"));
        }
        state.io_state = new_state;
        Ok(())
    }

    pub(crate) fn mark_pending(&self) -> Result<(), BacnetError> {
        Self::advance(&mut self.state.lock().unwrap(), IoState::Pending)
    }

    pub(crate) fn mark_active(&self) -> Result<(), BacnetError> {
        let mut state = self.state.lock().unwrap();
        if state.io_state > IoState::Pending {
            return Err(BacnetError::InvalidState("IOCB activated twice"));
        }
        Self::advance(&mut state, IoState::Active)
    }

    /// Finish successfully. Finishing an already-finished block is a
    /// no-op, so the completion signal fires exactly once.
    pub(crate) fn complete(&self, response: Option<ServiceMessage>) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.io_state.is_terminal() {
                return;
            }
            state.io_state = IoState::Completed;
            state.response = response;
            core::mem::take(&mut state.callbacks)
        };
        trace!("iocb {} completed", self.id);
        self.complete.notify_all();
        for callback in callbacks {
            callback(self);
        }
    }

    /// Finish in failure.
    pub(crate) fn abort(&self, error: IocbError) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.io_state.is_terminal() {
                return;
            }
            state.io_state = IoState::Aborted;
            state.error = Some(error);
            core::mem::take(&mut state.callbacks)
        };
        debug!("iocb {} aborted", self.id);
        self.complete.notify_all();
        for callback in callbacks {
            callback(self);
        }
    }
}

impl core::fmt::Debug for Iocb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Iocb")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("priority", &self.priority)
            .field("io_state", &self.io_state())
            .finish()
    }
}

/// Priority-ordered queue of pending blocks; FIFO within one priority.
#[derive(Debug, Default)]
pub struct IoQueue {
    items: Vec<(u8, IocbRef)>,
}

impl IoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Queue a block. It must already be pending.
    pub fn put(&mut self, iocb: IocbRef) -> Result<(), BacnetError> {
        if iocb.io_state() != IoState::Pending {
            return Err(BacnetError::InvalidState("only pending IOCBs can queue"));
        }
        let priority = iocb.priority();
        let at = self.items.partition_point(|(p, _)| *p <= priority);
        self.items.insert(at, (priority, iocb));
        Ok(())
    }

    pub fn get(&mut self) -> Option<IocbRef> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0).1)
        }
    }

    pub fn remove(&mut self, id: u64) {
        self.items.retain(|(_, iocb)| iocb.id() != id);
    }

    /// Abort everything still queued.
    pub fn abort_all(&mut self, error: &BacnetError) {
        for (_, iocb) in self.items.drain(..) {
            iocb.abort(IocbError::Local(*error));
        }
    }
}

/// Controller activity states. WAITING throttles between requests when
/// a wait time is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Active,
    Waiting,
}

/// Serialises blocks toward one destination: at most one active at a
/// time, the rest queued by priority.
#[derive(Debug, Default)]
pub struct IoqController {
    state: ControllerState,
    active: Option<IocbRef>,
    queue: IoQueue,
    wait_time_ms: u64,
}

impl IoqController {
    pub fn new(wait_time_ms: u64) -> Self {
        IoqController {
            wait_time_ms,
            ..Self::default()
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn active(&self) -> Option<&IocbRef> {
        self.active.as_ref()
    }

    pub fn is_idle_and_empty(&self) -> bool {
        self.state == ControllerState::Idle && self.active.is_none() && self.queue.is_empty()
    }

    /// Accept a block. Returns it when the controller is free and the
    /// caller should launch it now; otherwise it queues.
    pub fn request_io(&mut self, iocb: IocbRef) -> Result<Option<IocbRef>, BacnetError> {
        iocb.mark_pending()?;
        if self.state != ControllerState::Idle {
            trace!("controller busy, iocb {} queued", iocb.id());
            self.queue.put(iocb)?;
            return Ok(None);
        }
        Ok(Some(iocb))
    }

    /// The caller has launched this block.
    pub fn active_io(&mut self, iocb: IocbRef) -> Result<(), BacnetError> {
        iocb.mark_active()?;
        self.state = ControllerState::Active;
        self.active = Some(iocb);
        Ok(())
    }

    /// Finish the active block successfully. Returns true when the
    /// controller should throttle before the next launch.
    pub fn complete_io(
        &mut self,
        iocb: &IocbRef,
        response: Option<ServiceMessage>,
    ) -> Result<bool, BacnetError> {
        match &self.active {
            Some(active) if active.id() == iocb.id() => {}
            _ => return Err(BacnetError::InvalidState("not the current IOCB")),
        }
        iocb.complete(response);
        self.active = None;
        if self.wait_time_ms > 0 {
            self.state = ControllerState::Waiting;
            Ok(true)
        } else {
            self.state = ControllerState::Idle;
            Ok(false)
        }
    }

    /// Abort a block, active or queued.
    pub fn abort_io(&mut self, iocb: &IocbRef, error: IocbError) {
        iocb.abort(error);
        self.queue.remove(iocb.id());
        if let Some(active) = &self.active {
            if active.id() == iocb.id() {
                self.active = None;
                self.state = ControllerState::Idle;
            }
        }
    }

    /// The configured wait time elapsed.
    pub fn wait_elapsed(&mut self) {
        if self.state == ControllerState::Waiting {
            self.state = ControllerState::Idle;
        }
    }

    pub fn wait_time_ms(&self) -> u64 {
        self.wait_time_ms
    }

    /// The next block to launch, when the controller is free.
    pub fn next_io(&mut self) -> Option<IocbRef> {
        if self.state != ControllerState::Idle {
            return None;
        }
        self.queue.get()
    }
}
