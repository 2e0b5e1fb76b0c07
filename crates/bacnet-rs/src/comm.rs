// crates/bacnet-rs/src/comm.rs
//! The layered messaging framework.
//!
//! A stack is an application element on top of an ordered list of layers.
//! Traffic moves down through `indication` and up through `confirmation`;
//! a layer sitting in the middle plays both roles. Emissions are queued
//! and drained one dispatch at a time, so a handler always sees the stack
//! in a consistent state and never re-enters another layer.

use crate::apdu::Apdu;
use crate::device::{CommunicationControl, DeviceConfig, DeviceInfoCache};
use crate::error::BacnetError;
use crate::pdu::{Address, Pdu};
use crate::services::ServiceMessage;
use crate::task::{TaskManager, TimerHandle, TimerTarget};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{error, trace, warn};

/// A typed APDU together with its addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduMessage {
    pub source: Option<Address>,
    pub destination: Option<Address>,
    /// Set on upstream traffic that belongs to a transaction this device
    /// is serving, so the application can tell a peer's abort of its own
    /// request apart from a response to ours.
    pub server_transaction: bool,
    pub apdu: Apdu,
}

impl ApduMessage {
    pub fn to_destination(destination: Address, apdu: Apdu) -> Self {
        ApduMessage {
            source: None,
            destination: Some(destination),
            server_transaction: false,
            apdu,
        }
    }

    pub fn from_source(source: Address, apdu: Apdu) -> Self {
        ApduMessage {
            source: Some(source),
            destination: None,
            server_transaction: false,
            apdu,
        }
    }
}

/// What flows across a binding. The kind changes as traffic moves through
/// the stack: raw octets below the transaction registry, typed APDUs
/// between the registry and the service access point, decoded services
/// above it.
#[derive(Debug)]
pub enum Sdu {
    Data(Pdu),
    Apdu(ApduMessage),
    Service(ServiceMessage),
}

impl Sdu {
    pub fn expect_data(self) -> Result<Pdu, BacnetError> {
        match self {
            Sdu::Data(pdu) => Ok(pdu),
            _ => Err(BacnetError::Configuration(
                "layer expected raw data at this binding",
            )),
        }
    }

    pub fn expect_apdu(self) -> Result<ApduMessage, BacnetError> {
        match self {
            Sdu::Apdu(message) => Ok(message),
            _ => Err(BacnetError::Configuration(
                "layer expected an APDU at this binding",
            )),
        }
    }

    pub fn expect_service(self) -> Result<ServiceMessage, BacnetError> {
        match self {
            Sdu::Service(message) => Ok(message),
            _ => Err(BacnetError::Configuration(
                "layer expected a service message at this binding",
            )),
        }
    }
}

/// Where a dispatch is headed.
#[derive(Debug)]
enum Target {
    App,
    LayerIndication(usize),
    LayerConfirmation(usize),
    Wire,
}

#[derive(Debug)]
struct Dispatch {
    target: Target,
    sdu: Sdu,
}

/// The position of the element currently being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    App,
    Layer(usize),
}

/// State shared by every element of one stack: the local configuration,
/// the administrative communication switch, and the peer capability
/// cache used by the segmentation machines.
#[derive(Debug, Default)]
pub struct SharedState {
    pub config: DeviceConfig,
    pub dcc: CommunicationControl,
    pub device_info: DeviceInfoCache,
}

/// Handed to an element while it is being dispatched; the only way to
/// emit traffic or manage timers.
pub struct LayerCtx<'a> {
    slot: Slot,
    depth: usize,
    queue: &'a mut VecDeque<Dispatch>,
    tasks: &'a mut TaskManager,
    pub shared: &'a mut SharedState,
    now_ms: u64,
}

impl LayerCtx<'_> {
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Emit toward the wire. From the bottom layer this leaves the stack.
    pub fn send_down(&mut self, sdu: Sdu) {
        let target = match self.slot {
            Slot::App => {
                if self.depth == 0 {
                    Target::Wire
                } else {
                    Target::LayerIndication(0)
                }
            }
            Slot::Layer(i) => {
                if i + 1 < self.depth {
                    Target::LayerIndication(i + 1)
                } else {
                    Target::Wire
                }
            }
        };
        self.queue.push_back(Dispatch { target, sdu });
    }

    /// Emit toward the application.
    pub fn send_up(&mut self, sdu: Sdu) {
        let target = match self.slot {
            Slot::App => {
                warn!("application emitted upstream traffic, dropped");
                return;
            }
            Slot::Layer(0) => Target::App,
            Slot::Layer(i) => Target::LayerConfirmation(i - 1),
        };
        self.queue.push_back(Dispatch { target, sdu });
    }

    /// Install a timer addressed back to the current element.
    pub fn start_timer(&mut self, token: u64, delay_ms: u64) -> TimerHandle {
        let target = match self.slot {
            Slot::App => TimerTarget::App,
            Slot::Layer(i) => TimerTarget::Layer(i),
        };
        self.tasks.install(self.now_ms + delay_ms, target, token)
    }

    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.tasks.cancel(handle);
    }
}

/// One element of a protocol stack. Downstream traffic arrives through
/// `indication`, upstream traffic through `confirmation`.
pub trait Layer {
    /// Invoked once when the stack starts running.
    fn startup(&mut self, _ctx: &mut LayerCtx) {}

    fn indication(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError>;

    fn confirmation(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError>;

    /// A timer installed by this element expired. Stale tokens must be
    /// ignored.
    fn timer_expired(&mut self, _token: u64, _ctx: &mut LayerCtx) {}
}

/// An application element bound on top of a list of layers.
///
/// `A` is the concrete top element so callers keep typed access to it;
/// the layers below are trait objects bound in order, top first.
pub struct Stack<A> {
    app: A,
    layers: Vec<Box<dyn Layer + Send>>,
    queue: VecDeque<Dispatch>,
    shared: SharedState,
    outbound: Vec<Pdu>,
}

impl<A: Layer> Stack<A> {
    /// Pair the application with the layers below it, top first. An empty
    /// layer list is a configuration error: an application cannot be
    /// bound to nothing.
    pub fn bind(
        app: A,
        layers: Vec<Box<dyn Layer + Send>>,
        config: DeviceConfig,
    ) -> Result<Self, BacnetError> {
        config.validate()?;
        if layers.is_empty() {
            return Err(BacnetError::Configuration(
                "a stack needs at least one layer below the application",
            ));
        }
        Ok(Stack {
            app,
            layers,
            queue: VecDeque::new(),
            shared: SharedState {
                config,
                dcc: CommunicationControl::Enable,
                device_info: DeviceInfoCache::new(),
            },
            outbound: Vec::new(),
        })
    }

    pub fn shared(&mut self) -> &mut SharedState {
        &mut self.shared
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    /// Run a closure against the application element with a live dispatch
    /// context, then drain whatever it emitted.
    pub fn with_app<R>(
        &mut self,
        tasks: &mut TaskManager,
        now_ms: u64,
        f: impl FnOnce(&mut A, &mut LayerCtx) -> R,
    ) -> R {
        let result = {
            let Stack {
                app,
                layers,
                queue,
                shared,
                ..
            } = self;
            let mut ctx = LayerCtx {
                slot: Slot::App,
                depth: layers.len(),
                queue,
                tasks,
                shared,
                now_ms,
            };
            f(app, &mut ctx)
        };
        self.pump(tasks, now_ms);
        result
    }

    /// Give every element its startup hook, top down.
    pub fn start(&mut self, tasks: &mut TaskManager, now_ms: u64) {
        let depth = self.layers.len();
        {
            let Stack {
                app,
                layers,
                queue,
                shared,
                ..
            } = self;
            let mut ctx = LayerCtx {
                slot: Slot::App,
                depth,
                queue,
                tasks,
                shared,
                now_ms,
            };
            app.startup(&mut ctx);
            for (i, layer) in layers.iter_mut().enumerate() {
                ctx.slot = Slot::Layer(i);
                layer.startup(&mut ctx);
            }
        }
        self.pump(tasks, now_ms);
    }

    /// Inject a datagram from the wire at the bottom of the stack.
    pub fn receive(&mut self, pdu: Pdu, tasks: &mut TaskManager, now_ms: u64) {
        let bottom = self.layers.len() - 1;
        self.queue.push_back(Dispatch {
            target: Target::LayerConfirmation(bottom),
            sdu: Sdu::Data(pdu),
        });
        self.pump(tasks, now_ms);
    }

    /// Route a fired timer to the element that installed it.
    pub fn timer_expired(
        &mut self,
        target: TimerTarget,
        token: u64,
        tasks: &mut TaskManager,
        now_ms: u64,
    ) {
        {
            let Stack {
                app,
                layers,
                queue,
                shared,
                ..
            } = self;
            let depth = layers.len();
            match target {
                TimerTarget::App => {
                    let mut ctx = LayerCtx {
                        slot: Slot::App,
                        depth,
                        queue,
                        tasks,
                        shared,
                        now_ms,
                    };
                    app.timer_expired(token, &mut ctx);
                }
                TimerTarget::Layer(i) if i < depth => {
                    let mut ctx = LayerCtx {
                        slot: Slot::Layer(i),
                        depth,
                        queue,
                        tasks,
                        shared,
                        now_ms,
                    };
                    layers[i].timer_expired(token, &mut ctx);
                }
                other => warn!("timer for unknown target {:?}, dropped", other),
            }
        }
        self.pump(tasks, now_ms);
    }

    /// Frames waiting to leave through the director.
    pub fn take_outbound(&mut self) -> Vec<Pdu> {
        core::mem::take(&mut self.outbound)
    }

    /// Drain the dispatch queue. Errors from a handler are local: they
    /// are logged and the rest of the queue keeps draining.
    fn pump(&mut self, tasks: &mut TaskManager, now_ms: u64) {
        while let Some(Dispatch { target, sdu }) = self.queue.pop_front() {
            let Stack {
                app,
                layers,
                queue,
                shared,
                outbound,
            } = self;
            let depth = layers.len();
            trace!("dispatch {:?}", target);
            let result = match target {
                Target::Wire => {
                    match sdu {
                        Sdu::Data(pdu) => outbound.push(pdu),
                        other => error!("non-data SDU reached the wire: {:?}", other),
                    }
                    Ok(())
                }
                Target::App => {
                    let mut ctx = LayerCtx {
                        slot: Slot::App,
                        depth,
                        queue,
                        tasks,
                        shared,
                        now_ms,
                    };
                    app.confirmation(sdu, &mut ctx)
                }
                Target::LayerIndication(i) => {
                    let mut ctx = LayerCtx {
                        slot: Slot::Layer(i),
                        depth,
                        queue,
                        tasks,
                        shared,
                        now_ms,
                    };
                    layers[i].indication(sdu, &mut ctx)
                }
                Target::LayerConfirmation(i) => {
                    let mut ctx = LayerCtx {
                        slot: Slot::Layer(i),
                        depth,
                        queue,
                        tasks,
                        shared,
                        now_ms,
                    };
                    layers[i].confirmation(sdu, &mut ctx)
                }
            };
            if let Err(err) = result {
                error!("dispatch error: {}", err);
            }
        }
    }
}
