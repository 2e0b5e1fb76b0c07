// crates/bacnet-rs/src/app.rs
//! The application shell on top of a stack: a small object store, a
//! service handler registry, and the per-destination controller that
//! serialises outbound confirmed requests.

use crate::appservice::asap::ApplicationServiceAccessPoint;
use crate::appservice::smap::StateMachineAccessPoint;
use crate::bvll::{BipForeign, BipNormal};
use crate::comm::{Layer, LayerCtx, Sdu, Stack};
use crate::device::{CommunicationControl, DeviceConfig};
use crate::error::BacnetError;
use crate::iocb::{Iocb, IocbError, IocbRef, IoqController};
use crate::npdu::NetworkAccessPoint;
use crate::pdu::Address;
use crate::primitives::{object_type, ObjectId};
use crate::services::{
    property_id, DccEnableDisable, ErrorInfo, IAm, PropertyValue, ReadPropertyAck,
    ReadPropertyRequest, ServiceBody, ServiceMessage, WhoIs, WritePropertyRequest,
};
use crate::types::{confirmed_service, error_class, error_code, unconfirmed_service};
use std::collections::BTreeMap;
use log::{debug, error, info, trace, warn};

/// A local object: an identifier, a name, and a bag of properties.
#[derive(Debug, Clone)]
pub struct BacnetObject {
    pub identifier: ObjectId,
    pub name: String,
    properties: BTreeMap<u32, PropertyValue>,
}

impl BacnetObject {
    pub fn new(identifier: ObjectId, name: impl Into<String>) -> Self {
        BacnetObject {
            identifier,
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, property: u32, value: PropertyValue) -> Self {
        self.properties.insert(property, value);
        self
    }

    pub fn read(&self, property: u32) -> Option<PropertyValue> {
        match property {
            property_id::OBJECT_IDENTIFIER => {
                Some(PropertyValue::ObjectIdentifier(self.identifier))
            }
            property_id::OBJECT_NAME => Some(PropertyValue::CharacterString(self.name.clone())),
            _ => self.properties.get(&property).cloned(),
        }
    }

    pub fn write(&mut self, property: u32, value: PropertyValue) {
        self.properties.insert(property, value);
    }
}

/// What the protocol loop reports back into an IOCB.
enum Outcome {
    Success(Option<ServiceMessage>),
    Failure(ServiceMessage),
}

/// What an application timer was armed for.
enum AppTimer {
    IocbDeadline(IocbRef),
    QueueWait(Address),
    DccRestore,
}

type ConfirmedHandler =
    fn(&mut Application, &ServiceMessage, &mut LayerCtx) -> Result<ServiceBody, ErrorInfo>;
type UnconfirmedHandler = fn(&mut Application, &ServiceMessage, &mut LayerCtx);

/// The top element of a device stack.
pub struct Application {
    objects: BTreeMap<ObjectId, BacnetObject>,
    object_names: BTreeMap<String, ObjectId>,
    confirmed_handlers: BTreeMap<u8, ConfirmedHandler>,
    unconfirmed_handlers: BTreeMap<u8, UnconfirmedHandler>,
    /// One controller per destination; confirmed requests to one peer go
    /// out strictly one at a time.
    queues: BTreeMap<Address, IoqController>,
    timers: BTreeMap<u64, AppTimer>,
    next_timer_token: u64,
}

impl Application {
    pub fn new() -> Result<Self, BacnetError> {
        let mut app = Application {
            objects: BTreeMap::new(),
            object_names: BTreeMap::new(),
            confirmed_handlers: BTreeMap::new(),
            unconfirmed_handlers: BTreeMap::new(),
            queues: BTreeMap::new(),
            timers: BTreeMap::new(),
            next_timer_token: 0,
        };
        app.register_confirmed(confirmed_service::READ_PROPERTY, Self::do_read_property)?;
        app.register_confirmed(confirmed_service::WRITE_PROPERTY, Self::do_write_property)?;
        app.register_confirmed(
            confirmed_service::DEVICE_COMMUNICATION_CONTROL,
            Self::do_device_communication_control,
        )?;
        app.register_unconfirmed(unconfirmed_service::WHO_IS, Self::do_who_is)?;
        app.register_unconfirmed(unconfirmed_service::I_AM, Self::do_i_am)?;
        Ok(app)
    }

    /// Register a confirmed service handler. One handler per choice.
    pub fn register_confirmed(
        &mut self,
        service: u8,
        handler: ConfirmedHandler,
    ) -> Result<(), BacnetError> {
        if self.confirmed_handlers.insert(service, handler).is_some() {
            return Err(BacnetError::Configuration(
                "confirmed service already registered",
            ));
        }
        Ok(())
    }

    /// Register an unconfirmed service handler. One handler per choice.
    pub fn register_unconfirmed(
        &mut self,
        service: u8,
        handler: UnconfirmedHandler,
    ) -> Result<(), BacnetError> {
        if self.unconfirmed_handlers.insert(service, handler).is_some() {
            return Err(BacnetError::Configuration(
                "unconfirmed service already registered",
            ));
        }
        Ok(())
    }

    // --- object store ---

    pub fn add_object(&mut self, object: BacnetObject) -> Result<(), BacnetError> {
        if object.name.is_empty() {
            return Err(BacnetError::Configuration("object name required"));
        }
        if object.identifier.instance > ObjectId::MAX_INSTANCE {
            return Err(BacnetError::Configuration("invalid object instance"));
        }
        if self.objects.contains_key(&object.identifier) {
            return Err(BacnetError::Configuration("object identifier already used"));
        }
        if self.object_names.contains_key(&object.name) {
            return Err(BacnetError::Configuration("object name already used"));
        }
        self.object_names
            .insert(object.name.clone(), object.identifier);
        self.objects.insert(object.identifier, object);
        Ok(())
    }

    pub fn delete_object(&mut self, identifier: ObjectId) -> Result<(), BacnetError> {
        let object = self
            .objects
            .remove(&identifier)
            .ok_or(BacnetError::Configuration("no such object"))?;
        self.object_names.remove(&object.name);
        Ok(())
    }

    pub fn object(&self, identifier: ObjectId) -> Option<&BacnetObject> {
        self.objects.get(&identifier)
    }

    pub fn object_mut(&mut self, identifier: ObjectId) -> Option<&mut BacnetObject> {
        self.objects.get_mut(&identifier)
    }

    pub fn object_by_name(&self, name: &str) -> Option<&BacnetObject> {
        self.object_names.get(name).and_then(|id| self.objects.get(id))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    // --- unconfirmed initiations ---

    /// Broadcast a Who-Is, optionally filtered to an instance range.
    pub fn who_is(
        &mut self,
        destination: Option<Address>,
        low_limit: Option<u32>,
        high_limit: Option<u32>,
        ctx: &mut LayerCtx,
    ) {
        let body = ServiceBody::WhoIs(WhoIs {
            low_limit,
            high_limit,
        });
        let destination = destination.unwrap_or(Address::LocalBroadcast);
        ctx.send_down(Sdu::Service(ServiceMessage::request(destination, body)));
    }

    /// Announce this device to the local broadcast domain.
    pub fn i_am(&mut self, ctx: &mut LayerCtx) {
        let config = &ctx.shared.config;
        let body = ServiceBody::IAm(IAm {
            device_identifier: ObjectId::new(object_type::DEVICE, config.device_identifier),
            max_apdu_length_accepted: config.max_apdu_length_accepted as u32,
            segmentation_supported: config.segmentation_supported,
            vendor_id: config.vendor_identifier as u32,
        });
        ctx.send_down(Sdu::Service(ServiceMessage::request(
            Address::LocalBroadcast,
            body,
        )));
    }

    // --- IOCB handling ---

    fn alloc_timer(&mut self, what: AppTimer) -> u64 {
        self.next_timer_token += 1;
        self.timers.insert(self.next_timer_token, what);
        self.next_timer_token
    }

    /// Submit a block. It is queued behind any other block for the same
    /// destination and launched as soon as the destination is free.
    pub fn request_io(
        &mut self,
        iocb: IocbRef,
        deadline_ms: Option<u64>,
        ctx: &mut LayerCtx,
    ) -> Result<(), BacnetError> {
        if let Some(delay_ms) = deadline_ms {
            let token = self.alloc_timer(AppTimer::IocbDeadline(iocb.clone()));
            let handle = ctx.start_timer(token, delay_ms);
            iocb.set_timeout_handle(handle);
        }

        let destination = iocb.destination().clone();
        let queue = self.queues.entry(destination).or_default();
        match queue.request_io(iocb)? {
            Some(launch) => self.launch_io(launch, ctx),
            None => Ok(()),
        }
    }

    /// Push the block's request down the stack and mark it active. An
    /// unconfirmed request has nothing to wait for and completes as soon
    /// as it is on its way.
    fn launch_io(&mut self, iocb: IocbRef, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let peer = iocb.destination().clone();
        let request = iocb.request();

        {
            let queue = self
                .queues
                .get_mut(&peer)
                .ok_or(BacnetError::InternalError("launch without a queue"))?;
            queue.active_io(iocb.clone())?;
        }

        match request {
            Some(message) => {
                let confirmed = matches!(
                    message.body,
                    ServiceBody::ReadProperty(_)
                        | ServiceBody::WriteProperty(_)
                        | ServiceBody::DeviceCommunicationControl(_)
                );
                trace!("launching iocb {} to {}", iocb.id(), peer);
                ctx.send_down(Sdu::Service(message));
                if !confirmed {
                    self.complete_request(&peer, Outcome::Success(None), ctx);
                }
                Ok(())
            }
            None => {
                warn!("iocb {} has no request, aborted", iocb.id());
                self.complete_request(
                    &peer,
                    Outcome::Failure(ServiceMessage {
                        source: Some(peer.clone()),
                        destination: None,
                        invoke_id: None,
                        server_transaction: false,
                        body: ServiceBody::Abort {
                            reason: crate::types::AbortReason::Other,
                            server: false,
                        },
                    }),
                    ctx,
                );
                Ok(())
            }
        }
    }

    /// Resolve the active block for `peer`, then start the next one.
    fn complete_request(&mut self, peer: &Address, outcome: Outcome, ctx: &mut LayerCtx) {
        let (throttle, wait_ms) = {
            let Some(queue) = self.queues.get_mut(peer) else {
                debug!("no request queue for {}", peer);
                return;
            };
            let Some(active) = queue.active().cloned() else {
                debug!("no active request for {}", peer);
                return;
            };
            if let Some(handle) = active.take_timeout_handle() {
                ctx.cancel_timer(handle);
            }
            let throttle = match outcome {
                Outcome::Success(response) => {
                    queue.complete_io(&active, response).unwrap_or_else(|err| {
                        error!("completion failed: {}", err);
                        false
                    })
                }
                Outcome::Failure(response) => {
                    queue.abort_io(&active, IocbError::Response(response));
                    false
                }
            };
            (throttle, queue.wait_time_ms())
        };

        if throttle {
            let token = self.alloc_timer(AppTimer::QueueWait(peer.clone()));
            ctx.start_timer(token, wait_ms);
        } else {
            self.kick_queue(peer, ctx);
        }
    }

    /// Launch the next queued block, and drop the queue once it is idle
    /// and empty.
    fn kick_queue(&mut self, peer: &Address, ctx: &mut LayerCtx) {
        let next = match self.queues.get_mut(peer) {
            Some(queue) => queue.next_io(),
            None => return,
        };
        if let Some(next) = next {
            if let Err(err) = self.launch_io(next, ctx) {
                error!("launching next request failed: {}", err);
            }
        }
        if self
            .queues
            .get(peer)
            .map(|queue| queue.is_idle_and_empty())
            .unwrap_or(false)
        {
            trace!("request queue for {} drained", peer);
            self.queues.remove(peer);
        }
    }

    // --- server-side service handlers ---

    fn do_read_property(
        &mut self,
        message: &ServiceMessage,
        _ctx: &mut LayerCtx,
    ) -> Result<ServiceBody, ErrorInfo> {
        let ServiceBody::ReadProperty(request) = &message.body else {
            return Err(ErrorInfo::new(
                error_class::SERVICES,
                error_code::OPERATIONAL_PROBLEM,
            ));
        };
        let object = self
            .objects
            .get(&request.object_identifier)
            .ok_or(ErrorInfo::new(
                error_class::OBJECT,
                error_code::UNKNOWN_OBJECT,
            ))?;
        if request.property_array_index.is_some() {
            return Err(ErrorInfo::new(
                error_class::PROPERTY,
                error_code::VALUE_OUT_OF_RANGE,
            ));
        }
        let value = object
            .read(request.property_identifier)
            .ok_or(ErrorInfo::new(
                error_class::PROPERTY,
                error_code::UNKNOWN_PROPERTY,
            ))?;
        Ok(ServiceBody::ReadPropertyAck(ReadPropertyAck {
            object_identifier: request.object_identifier,
            property_identifier: request.property_identifier,
            property_array_index: None,
            value,
        }))
    }

    fn do_write_property(
        &mut self,
        message: &ServiceMessage,
        _ctx: &mut LayerCtx,
    ) -> Result<ServiceBody, ErrorInfo> {
        let ServiceBody::WriteProperty(request) = &message.body else {
            return Err(ErrorInfo::new(
                error_class::SERVICES,
                error_code::OPERATIONAL_PROBLEM,
            ));
        };
        let object = self
            .objects
            .get_mut(&request.object_identifier)
            .ok_or(ErrorInfo::new(
                error_class::OBJECT,
                error_code::UNKNOWN_OBJECT,
            ))?;
        if matches!(
            request.property_identifier,
            property_id::OBJECT_IDENTIFIER | property_id::OBJECT_NAME
        ) {
            return Err(ErrorInfo::new(
                error_class::PROPERTY,
                error_code::WRITE_ACCESS_DENIED,
            ));
        }
        object.write(request.property_identifier, request.value.clone());
        Ok(ServiceBody::SimpleAck {
            service: confirmed_service::WRITE_PROPERTY,
        })
    }

    fn do_device_communication_control(
        &mut self,
        message: &ServiceMessage,
        ctx: &mut LayerCtx,
    ) -> Result<ServiceBody, ErrorInfo> {
        let ServiceBody::DeviceCommunicationControl(request) = &message.body else {
            return Err(ErrorInfo::new(
                error_class::SERVICES,
                error_code::OPERATIONAL_PROBLEM,
            ));
        };

        ctx.shared.dcc = match request.enable_disable {
            DccEnableDisable::Enable => CommunicationControl::Enable,
            DccEnableDisable::Disable => CommunicationControl::Disable,
            DccEnableDisable::DisableInitiation => CommunicationControl::DisableInitiation,
        };
        info!("communication control set to {:?}", ctx.shared.dcc);

        if let Some(minutes) = request.time_duration_minutes {
            if minutes > 0 && ctx.shared.dcc != CommunicationControl::Enable {
                let token = self.alloc_timer(AppTimer::DccRestore);
                ctx.start_timer(token, minutes as u64 * 60_000);
            }
        }
        Ok(ServiceBody::SimpleAck {
            service: confirmed_service::DEVICE_COMMUNICATION_CONTROL,
        })
    }

    fn do_who_is(&mut self, message: &ServiceMessage, ctx: &mut LayerCtx) {
        let ServiceBody::WhoIs(who_is) = &message.body else {
            return;
        };
        if who_is.matches(ctx.shared.config.device_identifier) {
            trace!("who-is matches, announcing");
            self.i_am(ctx);
        }
    }

    fn do_i_am(&mut self, message: &ServiceMessage, ctx: &mut LayerCtx) {
        let (ServiceBody::IAm(i_am), Some(source)) = (&message.body, &message.source) else {
            return;
        };
        debug!(
            "device {} at {}",
            i_am.device_identifier.instance, source
        );
        ctx.shared.device_info.iam_device_info(
            i_am.device_identifier.instance,
            source.clone(),
            i_am.max_apdu_length_accepted as usize,
            i_am.segmentation_supported,
            i_am.vendor_id as u16,
        );
    }

    /// Dispatch an inbound confirmed request to its registered handler
    /// and send whatever it decides back to the peer.
    fn dispatch_confirmed(
        &mut self,
        service: u8,
        message: ServiceMessage,
        ctx: &mut LayerCtx,
    ) {
        let response_body = match self.confirmed_handlers.get(&service).copied() {
            None => ServiceBody::Reject {
                reason: crate::types::RejectReason::UnrecognizedService,
            },
            Some(handler) => match handler(self, &message, ctx) {
                Ok(body) => body,
                Err(error) => ServiceBody::ErrorResponse { service, error },
            },
        };
        ctx.send_down(Sdu::Service(ServiceMessage::response_to(
            &message,
            response_body,
        )));
    }

    fn dispatch_unconfirmed(&mut self, service: u8, message: ServiceMessage, ctx: &mut LayerCtx) {
        match self.unconfirmed_handlers.get(&service).copied() {
            Some(handler) => handler(self, &message, ctx),
            None => debug!("no handler for unconfirmed service {}", service),
        }
    }
}

impl Layer for Application {
    fn indication(&mut self, _sdu: Sdu, _ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        Err(BacnetError::Configuration(
            "nothing is bound above the application",
        ))
    }

    /// Decoded services coming up the stack: peer requests to answer and
    /// responses resolving our own requests.
    fn confirmation(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let message = sdu.expect_service()?;
        let source = message
            .source
            .clone()
            .ok_or(BacnetError::Decoding("service without source"))?;

        match message.body {
            ServiceBody::ReadProperty(_) => {
                self.dispatch_confirmed(confirmed_service::READ_PROPERTY, message, ctx)
            }
            ServiceBody::WriteProperty(_) => {
                self.dispatch_confirmed(confirmed_service::WRITE_PROPERTY, message, ctx)
            }
            ServiceBody::DeviceCommunicationControl(_) => self.dispatch_confirmed(
                confirmed_service::DEVICE_COMMUNICATION_CONTROL,
                message,
                ctx,
            ),
            ServiceBody::WhoIs(_) => {
                self.dispatch_unconfirmed(unconfirmed_service::WHO_IS, message, ctx)
            }
            ServiceBody::IAm(_) => {
                self.dispatch_unconfirmed(unconfirmed_service::I_AM, message, ctx)
            }
            ServiceBody::SimpleAck { .. } | ServiceBody::ReadPropertyAck(_) => {
                self.complete_request(&source, Outcome::Success(Some(message)), ctx)
            }
            ServiceBody::ErrorResponse { .. } | ServiceBody::Reject { .. } => {
                self.complete_request(&source, Outcome::Failure(message), ctx)
            }
            ServiceBody::Abort { .. } => {
                if message.server_transaction {
                    // the peer gave up on a request it sent us
                    debug!("transaction from {} aborted", source);
                } else {
                    self.complete_request(&source, Outcome::Failure(message), ctx)
                }
            }
        }
        Ok(())
    }

    fn timer_expired(&mut self, token: u64, ctx: &mut LayerCtx) {
        match self.timers.remove(&token) {
            Some(AppTimer::IocbDeadline(iocb)) => {
                let peer = iocb.destination().clone();
                debug!("iocb {} deadline passed", iocb.id());
                if let Some(queue) = self.queues.get_mut(&peer) {
                    queue.abort_io(&iocb, IocbError::Timeout);
                    self.kick_queue(&peer, ctx);
                } else {
                    iocb.abort(IocbError::Timeout);
                }
            }
            Some(AppTimer::QueueWait(peer)) => {
                if let Some(queue) = self.queues.get_mut(&peer) {
                    queue.wait_elapsed();
                }
                self.kick_queue(&peer, ctx);
            }
            Some(AppTimer::DccRestore) => {
                info!("communication control duration elapsed, re-enabling");
                ctx.shared.dcc = CommunicationControl::Enable;
            }
            None => trace!("stale application timer, ignored"),
        }
    }
}

/// Helper: an IOCB reading one property from a peer.
pub fn read_property_iocb(destination: Address, object: ObjectId, property: u32) -> IocbRef {
    Iocb::new(
        destination.clone(),
        ServiceMessage::request(
            destination,
            ServiceBody::ReadProperty(ReadPropertyRequest {
                object_identifier: object,
                property_identifier: property,
                property_array_index: None,
            }),
        ),
    )
}

/// Helper: an IOCB writing one property on a peer.
pub fn write_property_iocb(
    destination: Address,
    object: ObjectId,
    property: u32,
    value: PropertyValue,
) -> IocbRef {
    Iocb::new(
        destination.clone(),
        ServiceMessage::request(
            destination,
            ServiceBody::WriteProperty(WritePropertyRequest {
                object_identifier: object,
                property_identifier: property,
                property_array_index: None,
                value,
                priority: None,
            }),
        ),
    )
}

/// Assemble a normal on-subnet BACnet/IP device stack.
pub fn bip_simple_stack(
    config: DeviceConfig,
    local_address: Address,
) -> Result<Stack<Application>, BacnetError> {
    let layers: Vec<Box<dyn Layer + Send>> = vec![
        Box::new(ApplicationServiceAccessPoint::new()),
        Box::new(StateMachineAccessPoint::new()),
        Box::new(NetworkAccessPoint::new()),
        Box::new(BipNormal::new(local_address)),
    ];
    Stack::bind(Application::new()?, layers, config)
}

/// Assemble a foreign-device stack that registers with a BBMD.
pub fn bip_foreign_stack(
    config: DeviceConfig,
    bbmd_address: Address,
    ttl_seconds: u16,
) -> Result<Stack<Application>, BacnetError> {
    let layers: Vec<Box<dyn Layer + Send>> = vec![
        Box::new(ApplicationServiceAccessPoint::new()),
        Box::new(StateMachineAccessPoint::new()),
        Box::new(NetworkAccessPoint::new()),
        Box::new(BipForeign::new(bbmd_address, ttl_seconds)),
    ];
    Stack::bind(Application::new()?, layers, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analog_input() -> BacnetObject {
        BacnetObject::new(ObjectId::new(object_type::ANALOG_INPUT, 1), "ai-1")
            .with_property(property_id::PRESENT_VALUE, PropertyValue::Real(20.5))
    }

    #[test]
    fn test_object_store_dual_index() {
        let mut app = Application::new().unwrap();
        app.add_object(analog_input()).unwrap();

        assert!(app.object(ObjectId::new(object_type::ANALOG_INPUT, 1)).is_some());
        assert!(app.object_by_name("ai-1").is_some());
        assert!(matches!(
            app.add_object(analog_input()),
            Err(BacnetError::Configuration(_))
        ));

        app.delete_object(ObjectId::new(object_type::ANALOG_INPUT, 1))
            .unwrap();
        assert!(app.object_by_name("ai-1").is_none());
        assert_eq!(app.object_count(), 0);
    }

    #[test]
    fn test_intrinsic_properties() {
        let object = analog_input();
        assert_eq!(
            object.read(property_id::OBJECT_NAME),
            Some(PropertyValue::CharacterString("ai-1".into()))
        );
        assert_eq!(
            object.read(property_id::OBJECT_IDENTIFIER),
            Some(PropertyValue::ObjectIdentifier(ObjectId::new(
                object_type::ANALOG_INPUT,
                1
            )))
        );
        assert_eq!(
            object.read(property_id::PRESENT_VALUE),
            Some(PropertyValue::Real(20.5))
        );
        assert_eq!(object.read(property_id::OBJECT_LIST), None);
    }

    #[test]
    fn test_duplicate_handler_registration_fails() {
        let mut app = Application::new().unwrap();
        assert!(matches!(
            app.register_confirmed(confirmed_service::READ_PROPERTY, Application::do_read_property),
            Err(BacnetError::Configuration(_))
        ));
        assert!(matches!(
            app.register_unconfirmed(unconfirmed_service::WHO_IS, Application::do_who_is),
            Err(BacnetError::Configuration(_))
        ));
        // a fresh choice is fine
        app.register_confirmed(confirmed_service::REINITIALIZE_DEVICE, |_, _, _| {
            Err(ErrorInfo::new(
                error_class::SERVICES,
                error_code::OPERATIONAL_PROBLEM,
            ))
        })
        .unwrap();
    }
}
