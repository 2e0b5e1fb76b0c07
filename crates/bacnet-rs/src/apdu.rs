// crates/bacnet-rs/src/apdu.rs
//! APDU wire codecs, including the segmentation control fields.
//!
//! Layout per APDU type (ASHRAE 135, Clause 20.1): the high nibble of the
//! first octet carries the type, the low nibble the per-type flags. All
//! multi-octet integers are big-endian.

use crate::error::BacnetError;
use crate::pdu::Pdu;
use crate::types::{
    decode_max_apdu_length_accepted, decode_max_segments_accepted, encode_max_apdu_length_accepted,
    encode_max_segments_accepted, AbortReason, ApduType, RejectReason,
};
use alloc::vec::Vec;
use core::convert::TryFrom;

/// A confirmed service request, possibly one segment of a larger one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedRequest {
    pub segmented: bool,
    pub more_follows: bool,
    pub segmented_response_accepted: bool,
    /// Decoded segment count the sender will accept; `None` is
    /// unspecified or more than 64.
    pub max_segments_accepted: Option<u8>,
    /// Decoded maximum APDU length in octets.
    pub max_apdu_length_accepted: usize,
    /// Assigned by the transaction registry when the application leaves it
    /// unset.
    pub invoke_id: Option<u8>,
    pub sequence_number: Option<u8>,
    pub window_size: Option<u8>,
    pub service: u8,
    pub data: Vec<u8>,
}

impl ConfirmedRequest {
    pub fn new(service: u8, data: Vec<u8>) -> Self {
        ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: false,
            max_segments_accepted: None,
            max_apdu_length_accepted: 1024,
            invoke_id: None,
            sequence_number: None,
            window_size: None,
            service,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconfirmedRequest {
    pub service: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleAck {
    pub invoke_id: u8,
    pub service: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexAck {
    pub segmented: bool,
    pub more_follows: bool,
    pub invoke_id: u8,
    pub sequence_number: Option<u8>,
    pub window_size: Option<u8>,
    pub service: u8,
    pub data: Vec<u8>,
}

impl ComplexAck {
    pub fn new(invoke_id: u8, service: u8, data: Vec<u8>) -> Self {
        ComplexAck {
            segmented: false,
            more_follows: false,
            invoke_id,
            sequence_number: None,
            window_size: None,
            service,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentAck {
    /// Negative acknowledgement: a segment arrived out of order.
    pub negative_ack: bool,
    /// Set when the sender of this ack is the server of the transaction.
    pub server: bool,
    pub invoke_id: u8,
    pub sequence_number: u8,
    pub actual_window_size: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPdu {
    pub invoke_id: u8,
    pub service: u8,
    /// Encoded error class and code; decoded at the service layer.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectPdu {
    pub invoke_id: u8,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortPdu {
    /// Set when the sender of this abort is the server of the transaction.
    pub server: bool,
    pub invoke_id: u8,
    pub reason: AbortReason,
}

/// A decoded APDU of any of the eight types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    ConfirmedRequest(ConfirmedRequest),
    UnconfirmedRequest(UnconfirmedRequest),
    SimpleAck(SimpleAck),
    ComplexAck(ComplexAck),
    SegmentAck(SegmentAck),
    Error(ErrorPdu),
    Reject(RejectPdu),
    Abort(AbortPdu),
}

impl Apdu {
    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest(_) => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest(_) => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck(_) => ApduType::SimpleAck,
            Apdu::ComplexAck(_) => ApduType::ComplexAck,
            Apdu::SegmentAck(_) => ApduType::SegmentAck,
            Apdu::Error(_) => ApduType::Error,
            Apdu::Reject(_) => ApduType::Reject,
            Apdu::Abort(_) => ApduType::Abort,
        }
    }

    /// The invoke ID carried by this APDU, when the type has one.
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest(request) => request.invoke_id,
            Apdu::UnconfirmedRequest(_) => None,
            Apdu::SimpleAck(ack) => Some(ack.invoke_id),
            Apdu::ComplexAck(ack) => Some(ack.invoke_id),
            Apdu::SegmentAck(ack) => Some(ack.invoke_id),
            Apdu::Error(error) => Some(error.invoke_id),
            Apdu::Reject(reject) => Some(reject.invoke_id),
            Apdu::Abort(abort) => Some(abort.invoke_id),
        }
    }

    /// Serialize into the tail of `pdu`.
    pub fn encode(&self, pdu: &mut Pdu) -> Result<(), BacnetError> {
        match self {
            Apdu::ConfirmedRequest(request) => {
                let mut octet0 = (ApduType::ConfirmedRequest as u8) << 4;
                if request.segmented {
                    octet0 |= 0x08;
                }
                if request.more_follows {
                    octet0 |= 0x04;
                }
                if request.segmented_response_accepted {
                    octet0 |= 0x02;
                }
                pdu.put(octet0);
                pdu.put(
                    (encode_max_segments_accepted(request.max_segments_accepted) << 4)
                        | encode_max_apdu_length_accepted(request.max_apdu_length_accepted),
                );
                pdu.put(request.invoke_id.ok_or(BacnetError::InternalError(
                    "encoding a confirmed request without an invoke ID",
                ))?);
                if request.segmented {
                    pdu.put(request.sequence_number.unwrap_or(0));
                    pdu.put(request.window_size.unwrap_or(1));
                }
                pdu.put(request.service);
                pdu.put_data(&request.data);
            }
            Apdu::UnconfirmedRequest(request) => {
                pdu.put((ApduType::UnconfirmedRequest as u8) << 4);
                pdu.put(request.service);
                pdu.put_data(&request.data);
            }
            Apdu::SimpleAck(ack) => {
                pdu.put((ApduType::SimpleAck as u8) << 4);
                pdu.put(ack.invoke_id);
                pdu.put(ack.service);
            }
            Apdu::ComplexAck(ack) => {
                let mut octet0 = (ApduType::ComplexAck as u8) << 4;
                if ack.segmented {
                    octet0 |= 0x08;
                }
                if ack.more_follows {
                    octet0 |= 0x04;
                }
                pdu.put(octet0);
                pdu.put(ack.invoke_id);
                if ack.segmented {
                    pdu.put(ack.sequence_number.unwrap_or(0));
                    pdu.put(ack.window_size.unwrap_or(1));
                }
                pdu.put(ack.service);
                pdu.put_data(&ack.data);
            }
            Apdu::SegmentAck(ack) => {
                let mut octet0 = (ApduType::SegmentAck as u8) << 4;
                if ack.negative_ack {
                    octet0 |= 0x02;
                }
                if ack.server {
                    octet0 |= 0x01;
                }
                pdu.put(octet0);
                pdu.put(ack.invoke_id);
                pdu.put(ack.sequence_number);
                pdu.put(ack.actual_window_size);
            }
            Apdu::Error(error) => {
                pdu.put((ApduType::Error as u8) << 4);
                pdu.put(error.invoke_id);
                pdu.put(error.service);
                pdu.put_data(&error.data);
            }
            Apdu::Reject(reject) => {
                pdu.put((ApduType::Reject as u8) << 4);
                pdu.put(reject.invoke_id);
                pdu.put(reject.reason.to_wire());
            }
            Apdu::Abort(abort) => {
                let mut octet0 = (ApduType::Abort as u8) << 4;
                if abort.server {
                    octet0 |= 0x01;
                }
                pdu.put(octet0);
                pdu.put(abort.invoke_id);
                pdu.put(abort.reason.to_wire());
            }
        }
        Ok(())
    }

    /// Parse an APDU from the remaining octets of `pdu`.
    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        let octet0 = pdu.get()?;
        let apdu_type = ApduType::try_from(octet0 >> 4)?;

        match apdu_type {
            ApduType::ConfirmedRequest => {
                let segmented = octet0 & 0x08 != 0;
                let more_follows = octet0 & 0x04 != 0;
                let segmented_response_accepted = octet0 & 0x02 != 0;
                let caps = pdu.get()?;
                let invoke_id = pdu.get()?;
                let (sequence_number, window_size) = if segmented {
                    (Some(pdu.get()?), Some(pdu.get()?))
                } else {
                    (None, None)
                };
                let service = pdu.get()?;
                Ok(Apdu::ConfirmedRequest(ConfirmedRequest {
                    segmented,
                    more_follows,
                    segmented_response_accepted,
                    max_segments_accepted: decode_max_segments_accepted(caps >> 4),
                    max_apdu_length_accepted: decode_max_apdu_length_accepted(caps)
                        .ok_or(BacnetError::InvalidEnumValue)?,
                    invoke_id: Some(invoke_id),
                    sequence_number,
                    window_size,
                    service,
                    data: pdu.get_data(pdu.remaining())?,
                }))
            }
            ApduType::UnconfirmedRequest => Ok(Apdu::UnconfirmedRequest(UnconfirmedRequest {
                service: pdu.get()?,
                data: pdu.get_data(pdu.remaining())?,
            })),
            ApduType::SimpleAck => Ok(Apdu::SimpleAck(SimpleAck {
                invoke_id: pdu.get()?,
                service: pdu.get()?,
            })),
            ApduType::ComplexAck => {
                let segmented = octet0 & 0x08 != 0;
                let more_follows = octet0 & 0x04 != 0;
                let invoke_id = pdu.get()?;
                let (sequence_number, window_size) = if segmented {
                    (Some(pdu.get()?), Some(pdu.get()?))
                } else {
                    (None, None)
                };
                let service = pdu.get()?;
                Ok(Apdu::ComplexAck(ComplexAck {
                    segmented,
                    more_follows,
                    invoke_id,
                    sequence_number,
                    window_size,
                    service,
                    data: pdu.get_data(pdu.remaining())?,
                }))
            }
            ApduType::SegmentAck => Ok(Apdu::SegmentAck(SegmentAck {
                negative_ack: octet0 & 0x02 != 0,
                server: octet0 & 0x01 != 0,
                invoke_id: pdu.get()?,
                sequence_number: pdu.get()?,
                actual_window_size: pdu.get()?,
            })),
            ApduType::Error => Ok(Apdu::Error(ErrorPdu {
                invoke_id: pdu.get()?,
                service: pdu.get()?,
                data: pdu.get_data(pdu.remaining())?,
            })),
            ApduType::Reject => Ok(Apdu::Reject(RejectPdu {
                invoke_id: pdu.get()?,
                reason: RejectReason::from_wire(pdu.get()?),
            })),
            ApduType::Abort => Ok(Apdu::Abort(AbortPdu {
                server: octet0 & 0x01 != 0,
                invoke_id: pdu.get()?,
                reason: AbortReason::from_wire(pdu.get()?),
            })),
        }
    }
}
