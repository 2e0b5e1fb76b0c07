// crates/bacnet-rs/src/appservice/asap.rs
//! The application service access point: translates typed service
//! messages into APDUs on the way down and APDUs into typed services on
//! the way up. A malformed confirmed request is answered with a Reject;
//! malformed unconfirmed traffic has no response channel and is dropped.

use crate::apdu::{
    AbortPdu, Apdu, ComplexAck, ConfirmedRequest, ErrorPdu, RejectPdu, SimpleAck,
    UnconfirmedRequest,
};
use crate::comm::{ApduMessage, Layer, LayerCtx, Sdu};
use crate::error::BacnetError;
use crate::pdu::Pdu;
use crate::services::{
    DccRequest, ErrorInfo, IAm, ReadPropertyAck, ReadPropertyRequest, ServiceBody, ServiceMessage,
    WhoIs, WritePropertyRequest,
};
use crate::types::{
    confirmed_service, error_class, error_code, unconfirmed_service, RejectReason,
};
use log::{debug, trace, warn};

/// Map a service decode failure to the reject reason put on the wire.
fn reject_reason_for(err: BacnetError) -> RejectReason {
    match err {
        BacnetError::InvalidTag => RejectReason::InvalidTag,
        BacnetError::Decoding(_) => RejectReason::MissingRequiredParameter,
        BacnetError::InvalidEnumValue => RejectReason::UndefinedEnumeration,
        _ => RejectReason::Other,
    }
}

#[derive(Debug, Default)]
pub struct ApplicationServiceAccessPoint;

impl ApplicationServiceAccessPoint {
    pub fn new() -> Self {
        ApplicationServiceAccessPoint
    }
}

impl Layer for ApplicationServiceAccessPoint {
    /// A service from the application, bound for a peer.
    fn indication(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let message = sdu.expect_service()?;
        let destination = message
            .destination
            .clone()
            .ok_or(BacnetError::Configuration("service without destination"))?;

        let config = &ctx.shared.config;
        let confirmed = |service: u8, data: Pdu| {
            Apdu::ConfirmedRequest(ConfirmedRequest {
                segmented: false,
                more_follows: false,
                segmented_response_accepted: config.segmentation_supported.can_receive(),
                max_segments_accepted: config.max_segments_accepted,
                max_apdu_length_accepted: config.max_apdu_length_accepted,
                invoke_id: message.invoke_id,
                sequence_number: None,
                window_size: None,
                service,
                data: data.into_octets(),
            })
        };
        let response_invoke_id = message
            .invoke_id
            .ok_or(BacnetError::Configuration("response without invoke ID"));

        let apdu = match &message.body {
            ServiceBody::WhoIs(who_is) => {
                let mut data = Pdu::new();
                who_is.encode(&mut data);
                Apdu::UnconfirmedRequest(UnconfirmedRequest {
                    service: unconfirmed_service::WHO_IS,
                    data: data.into_octets(),
                })
            }
            ServiceBody::IAm(i_am) => {
                let mut data = Pdu::new();
                i_am.encode(&mut data);
                Apdu::UnconfirmedRequest(UnconfirmedRequest {
                    service: unconfirmed_service::I_AM,
                    data: data.into_octets(),
                })
            }
            ServiceBody::ReadProperty(request) => {
                let mut data = Pdu::new();
                request.encode(&mut data);
                confirmed(confirmed_service::READ_PROPERTY, data)
            }
            ServiceBody::WriteProperty(request) => {
                let mut data = Pdu::new();
                request.encode(&mut data);
                confirmed(confirmed_service::WRITE_PROPERTY, data)
            }
            ServiceBody::DeviceCommunicationControl(request) => {
                let mut data = Pdu::new();
                request.encode(&mut data);
                confirmed(confirmed_service::DEVICE_COMMUNICATION_CONTROL, data)
            }
            ServiceBody::ReadPropertyAck(ack) => {
                let mut data = Pdu::new();
                ack.encode(&mut data);
                Apdu::ComplexAck(ComplexAck::new(
                    response_invoke_id?,
                    confirmed_service::READ_PROPERTY,
                    data.into_octets(),
                ))
            }
            ServiceBody::SimpleAck { service } => Apdu::SimpleAck(SimpleAck {
                invoke_id: response_invoke_id?,
                service: *service,
            }),
            ServiceBody::ErrorResponse { service, error } => {
                let mut data = Pdu::new();
                error.encode(&mut data);
                Apdu::Error(ErrorPdu {
                    invoke_id: response_invoke_id?,
                    service: *service,
                    data: data.into_octets(),
                })
            }
            ServiceBody::Reject { reason } => Apdu::Reject(RejectPdu {
                invoke_id: response_invoke_id?,
                reason: *reason,
            }),
            ServiceBody::Abort { reason, server } => Apdu::Abort(AbortPdu {
                server: *server,
                invoke_id: response_invoke_id?,
                reason: *reason,
            }),
        };

        trace!("service out to {}: {:?}", destination, apdu.apdu_type());
        ctx.send_down(Sdu::Apdu(ApduMessage::to_destination(destination, apdu)));
        Ok(())
    }

    /// An APDU from the transaction layer, bound for the application.
    fn confirmation(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let message = sdu.expect_apdu()?;
        let source = message
            .source
            .clone()
            .ok_or(BacnetError::Decoding("upstream APDU without source"))?;
        let server_transaction = message.server_transaction;

        match message.apdu {
            Apdu::ConfirmedRequest(request) => {
                let invoke_id = request.invoke_id;
                let mut data = Pdu::with_data(request.data);
                let decoded = match request.service {
                    confirmed_service::READ_PROPERTY => {
                        ReadPropertyRequest::decode(&mut data).map(ServiceBody::ReadProperty)
                    }
                    confirmed_service::WRITE_PROPERTY => {
                        WritePropertyRequest::decode(&mut data).map(ServiceBody::WriteProperty)
                    }
                    confirmed_service::DEVICE_COMMUNICATION_CONTROL => {
                        DccRequest::decode(&mut data)
                            .map(ServiceBody::DeviceCommunicationControl)
                    }
                    service => {
                        debug!("no decoder for confirmed service {}", service);
                        let reject = Apdu::Reject(RejectPdu {
                            invoke_id: invoke_id.unwrap_or(0),
                            reason: RejectReason::UnrecognizedService,
                        });
                        ctx.send_down(Sdu::Apdu(ApduMessage::to_destination(source, reject)));
                        return Ok(());
                    }
                };

                match decoded {
                    Ok(body) => ctx.send_up(Sdu::Service(ServiceMessage {
                        source: Some(source),
                        destination: None,
                        invoke_id,
                        server_transaction,
                        body,
                    })),
                    Err(err) => {
                        debug!("confirmed request decode failed: {}", err);
                        let reject = Apdu::Reject(RejectPdu {
                            invoke_id: invoke_id.unwrap_or(0),
                            reason: reject_reason_for(err),
                        });
                        ctx.send_down(Sdu::Apdu(ApduMessage::to_destination(source, reject)));
                    }
                }
            }
            Apdu::UnconfirmedRequest(request) => {
                let mut data = Pdu::with_data(request.data);
                let decoded = match request.service {
                    unconfirmed_service::WHO_IS => WhoIs::decode(&mut data).map(ServiceBody::WhoIs),
                    unconfirmed_service::I_AM => IAm::decode(&mut data).map(ServiceBody::IAm),
                    service => {
                        debug!("no decoder for unconfirmed service {}, dropped", service);
                        return Ok(());
                    }
                };
                match decoded {
                    Ok(body) => ctx.send_up(Sdu::Service(ServiceMessage {
                        source: Some(source),
                        destination: None,
                        invoke_id: None,
                        server_transaction,
                        body,
                    })),
                    // nobody to tell; unconfirmed traffic has no reply path
                    Err(err) => debug!("unconfirmed request decode failed: {}", err),
                }
            }
            Apdu::SimpleAck(ack) => {
                ctx.send_up(Sdu::Service(ServiceMessage {
                    source: Some(source),
                    destination: None,
                    invoke_id: Some(ack.invoke_id),
                    server_transaction,
                    body: ServiceBody::SimpleAck {
                        service: ack.service,
                    },
                }));
            }
            Apdu::ComplexAck(ack) => {
                let invoke_id = Some(ack.invoke_id);
                let service = ack.service;
                let mut data = Pdu::with_data(ack.data);
                let body = match service {
                    confirmed_service::READ_PROPERTY => match ReadPropertyAck::decode(&mut data) {
                        Ok(ack) => ServiceBody::ReadPropertyAck(ack),
                        Err(err) => {
                            // a garbled ack still resolves the transaction
                            warn!("complex ack decode failed: {}", err);
                            ServiceBody::ErrorResponse {
                                service,
                                error: ErrorInfo::new(
                                    error_class::COMMUNICATION,
                                    error_code::INVALID_TAG,
                                ),
                            }
                        }
                    },
                    service => {
                        debug!("no decoder for complex ack service {}, dropped", service);
                        return Ok(());
                    }
                };
                ctx.send_up(Sdu::Service(ServiceMessage {
                    source: Some(source),
                    destination: None,
                    invoke_id,
                    server_transaction,
                    body,
                }));
            }
            Apdu::Error(error) => {
                let mut data = Pdu::with_data(error.data);
                let info = ErrorInfo::decode(&mut data).unwrap_or(ErrorInfo::new(0, 0));
                ctx.send_up(Sdu::Service(ServiceMessage {
                    source: Some(source),
                    destination: None,
                    invoke_id: Some(error.invoke_id),
                    server_transaction,
                    body: ServiceBody::ErrorResponse {
                        service: error.service,
                        error: info,
                    },
                }));
            }
            Apdu::Reject(reject) => {
                ctx.send_up(Sdu::Service(ServiceMessage {
                    source: Some(source),
                    destination: None,
                    invoke_id: Some(reject.invoke_id),
                    server_transaction,
                    body: ServiceBody::Reject {
                        reason: reject.reason,
                    },
                }));
            }
            Apdu::Abort(abort) => {
                ctx.send_up(Sdu::Service(ServiceMessage {
                    source: Some(source),
                    destination: None,
                    invoke_id: Some(abort.invoke_id),
                    server_transaction,
                    body: ServiceBody::Abort {
                        reason: abort.reason,
                        server: abort.server,
                    },
                }));
            }
            Apdu::SegmentAck(_) => {
                warn!("segment ack reached the service access point, dropped");
            }
        }
        Ok(())
    }
}
