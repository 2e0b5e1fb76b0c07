// crates/bacnet-rs/src/services.rs
//! Typed bodies for the services the engine implements, and their codecs.
//!
//! The application layer speaks these; the application service access
//! point translates them to and from APDUs.

use crate::error::BacnetError;
use crate::pdu::{Address, Pdu};
use crate::primitives::{
    decode_application_enumerated, decode_application_object_id, decode_application_unsigned,
    decode_context_enumerated, decode_context_object_id, decode_context_unsigned, decode_tag,
    encode_application_boolean, encode_application_character_string, encode_application_enumerated,
    encode_application_null, encode_application_object_id, encode_application_octet_string,
    encode_application_real, encode_application_unsigned, encode_closing_tag,
    encode_context_character_string, encode_context_enumerated, encode_context_object_id,
    encode_context_unsigned, encode_opening_tag, expect_closing_tag, expect_opening_tag,
    next_is_context, peek_tag, application_tag, ObjectId, TagClass, TagContent,
};
use crate::types::{AbortReason, RejectReason, Segmentation};
use alloc::string::String;
use alloc::vec::Vec;
use core::convert::TryFrom;

/// Property identifiers used by the engine.
pub mod property_id {
    pub const MAX_APDU_LENGTH_ACCEPTED: u32 = 62;
    pub const OBJECT_IDENTIFIER: u32 = 75;
    pub const OBJECT_LIST: u32 = 76;
    pub const OBJECT_NAME: u32 = 77;
    pub const PRESENT_VALUE: u32 = 85;
    pub const SEGMENTATION_SUPPORTED: u32 = 107;
    pub const VENDOR_IDENTIFIER: u32 = 120;
}

/// A primitive property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Real(f32),
    OctetString(Vec<u8>),
    CharacterString(String),
    Enumerated(u32),
    ObjectIdentifier(ObjectId),
}

impl PropertyValue {
    pub fn encode(&self, pdu: &mut Pdu) {
        match self {
            PropertyValue::Null => encode_application_null(pdu),
            PropertyValue::Boolean(value) => encode_application_boolean(pdu, *value),
            PropertyValue::Unsigned(value) => encode_application_unsigned(pdu, *value),
            PropertyValue::Real(value) => encode_application_real(pdu, *value),
            PropertyValue::OctetString(value) => encode_application_octet_string(pdu, value),
            PropertyValue::CharacterString(value) => {
                encode_application_character_string(pdu, value)
            }
            PropertyValue::Enumerated(value) => encode_application_enumerated(pdu, *value),
            PropertyValue::ObjectIdentifier(value) => encode_application_object_id(pdu, *value),
        }
    }

    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        let tag = peek_tag(pdu).ok_or(BacnetError::InvalidTag)?;
        if tag.class != TagClass::Application {
            return Err(BacnetError::InvalidTag);
        }
        match tag.number {
            application_tag::NULL => {
                decode_tag(pdu)?;
                Ok(PropertyValue::Null)
            }
            application_tag::BOOLEAN => {
                // the value rides in the L/V/T field of the tag itself
                let tag = decode_tag(pdu)?;
                match tag.content {
                    TagContent::Value(v) => Ok(PropertyValue::Boolean(v != 0)),
                    _ => Err(BacnetError::InvalidTag),
                }
            }
            application_tag::UNSIGNED_INT => {
                Ok(PropertyValue::Unsigned(decode_application_unsigned(pdu)?))
            }
            application_tag::REAL => Ok(PropertyValue::Real(
                crate::primitives::decode_application_real(pdu)?,
            )),
            application_tag::OCTET_STRING => Ok(PropertyValue::OctetString(
                crate::primitives::decode_application_octet_string(pdu)?,
            )),
            application_tag::CHARACTER_STRING => Ok(PropertyValue::CharacterString(
                crate::primitives::decode_application_character_string(pdu)?,
            )),
            application_tag::ENUMERATED => Ok(PropertyValue::Enumerated(
                decode_application_enumerated(pdu)?,
            )),
            application_tag::OBJECT_ID => Ok(PropertyValue::ObjectIdentifier(
                decode_application_object_id(pdu)?,
            )),
            _ => Err(BacnetError::InvalidTag),
        }
    }
}

/// Who-Is, with an optional device instance range filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WhoIs {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
}

impl WhoIs {
    pub fn matches(&self, device_instance: u32) -> bool {
        match (self.low_limit, self.high_limit) {
            (Some(low), Some(high)) => device_instance >= low && device_instance <= high,
            // a half-open filter is malformed; treat it as no filter
            _ => true,
        }
    }

    pub fn encode(&self, pdu: &mut Pdu) {
        if let (Some(low), Some(high)) = (self.low_limit, self.high_limit) {
            encode_context_unsigned(pdu, 0, low);
            encode_context_unsigned(pdu, 1, high);
        }
    }

    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        if pdu.is_empty() {
            return Ok(WhoIs::default());
        }
        let low_limit = Some(decode_context_unsigned(pdu, 0)?);
        let high_limit = Some(decode_context_unsigned(pdu, 1)?);
        Ok(WhoIs {
            low_limit,
            high_limit,
        })
    }
}

/// I-Am device announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAm {
    pub device_identifier: ObjectId,
    pub max_apdu_length_accepted: u32,
    pub segmentation_supported: Segmentation,
    pub vendor_id: u32,
}

impl IAm {
    pub fn encode(&self, pdu: &mut Pdu) {
        encode_application_object_id(pdu, self.device_identifier);
        encode_application_unsigned(pdu, self.max_apdu_length_accepted);
        encode_application_enumerated(pdu, self.segmentation_supported as u32);
        encode_application_unsigned(pdu, self.vendor_id);
    }

    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        let device_identifier = decode_application_object_id(pdu)?;
        let max_apdu_length_accepted = decode_application_unsigned(pdu)?;
        let segmentation = decode_application_enumerated(pdu)?;
        let vendor_id = decode_application_unsigned(pdu)?;
        Ok(IAm {
            device_identifier,
            max_apdu_length_accepted,
            segmentation_supported: Segmentation::try_from(segmentation as u8)?,
            vendor_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object_identifier: ObjectId,
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
}

impl ReadPropertyRequest {
    pub fn encode(&self, pdu: &mut Pdu) {
        encode_context_object_id(pdu, 0, self.object_identifier);
        encode_context_unsigned(pdu, 1, self.property_identifier);
        if let Some(index) = self.property_array_index {
            encode_context_unsigned(pdu, 2, index);
        }
    }

    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        let object_identifier = decode_context_object_id(pdu, 0)?;
        let property_identifier = decode_context_unsigned(pdu, 1)?;
        let property_array_index = if next_is_context(pdu, 2) {
            Some(decode_context_unsigned(pdu, 2)?)
        } else {
            None
        };
        Ok(ReadPropertyRequest {
            object_identifier,
            property_identifier,
            property_array_index,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub object_identifier: ObjectId,
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
    pub value: PropertyValue,
}

impl ReadPropertyAck {
    pub fn encode(&self, pdu: &mut Pdu) {
        encode_context_object_id(pdu, 0, self.object_identifier);
        encode_context_unsigned(pdu, 1, self.property_identifier);
        if let Some(index) = self.property_array_index {
            encode_context_unsigned(pdu, 2, index);
        }
        encode_opening_tag(pdu, 3);
        self.value.encode(pdu);
        encode_closing_tag(pdu, 3);
    }

    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        let object_identifier = decode_context_object_id(pdu, 0)?;
        let property_identifier = decode_context_unsigned(pdu, 1)?;
        let property_array_index = if next_is_context(pdu, 2) {
            Some(decode_context_unsigned(pdu, 2)?)
        } else {
            None
        };
        expect_opening_tag(pdu, 3)?;
        let value = PropertyValue::decode(pdu)?;
        expect_closing_tag(pdu, 3)?;
        Ok(ReadPropertyAck {
            object_identifier,
            property_identifier,
            property_array_index,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyRequest {
    pub object_identifier: ObjectId,
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
    pub value: PropertyValue,
    pub priority: Option<u8>,
}

impl WritePropertyRequest {
    pub fn encode(&self, pdu: &mut Pdu) {
        encode_context_object_id(pdu, 0, self.object_identifier);
        encode_context_unsigned(pdu, 1, self.property_identifier);
        if let Some(index) = self.property_array_index {
            encode_context_unsigned(pdu, 2, index);
        }
        encode_opening_tag(pdu, 3);
        self.value.encode(pdu);
        encode_closing_tag(pdu, 3);
        if let Some(priority) = self.priority {
            encode_context_unsigned(pdu, 4, priority as u32);
        }
    }

    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        let object_identifier = decode_context_object_id(pdu, 0)?;
        let property_identifier = decode_context_unsigned(pdu, 1)?;
        let property_array_index = if next_is_context(pdu, 2) {
            Some(decode_context_unsigned(pdu, 2)?)
        } else {
            None
        };
        expect_opening_tag(pdu, 3)?;
        let value = PropertyValue::decode(pdu)?;
        expect_closing_tag(pdu, 3)?;
        let priority = if next_is_context(pdu, 4) {
            Some(decode_context_unsigned(pdu, 4)? as u8)
        } else {
            None
        };
        Ok(WritePropertyRequest {
            object_identifier,
            property_identifier,
            property_array_index,
            value,
            priority,
        })
    }
}

/// DeviceCommunicationControl enable/disable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DccEnableDisable {
    Enable = 0,
    Disable = 1,
    DisableInitiation = 2,
}

impl TryFrom<u8> for DccEnableDisable {
    type Error = BacnetError;
    fn try_from(value: u8) -> Result<Self, BacnetError> {
        match value {
            0 => Ok(Self::Enable),
            1 => Ok(Self::Disable),
            2 => Ok(Self::DisableInitiation),
            _ => Err(BacnetError::InvalidEnumValue),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DccRequest {
    /// Minutes until communication is automatically re-enabled.
    pub time_duration_minutes: Option<u16>,
    pub enable_disable: DccEnableDisable,
    pub password: Option<String>,
}

impl DccRequest {
    pub fn encode(&self, pdu: &mut Pdu) {
        if let Some(minutes) = self.time_duration_minutes {
            encode_context_unsigned(pdu, 0, minutes as u32);
        }
        encode_context_enumerated(pdu, 1, self.enable_disable as u32);
        if let Some(password) = &self.password {
            encode_context_character_string(pdu, 2, password);
        }
    }

    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        let time_duration_minutes = if next_is_context(pdu, 0) {
            Some(decode_context_unsigned(pdu, 0)? as u16)
        } else {
            None
        };
        let enable_disable = DccEnableDisable::try_from(decode_context_enumerated(pdu, 1)? as u8)?;
        // the password is not checked; consume it if present
        let password = None;
        if next_is_context(pdu, 2) {
            let tag = decode_tag(pdu)?;
            pdu.get_data(tag.length())?;
        }
        Ok(DccRequest {
            time_duration_minutes,
            enable_disable,
            password,
        })
    }
}

/// Error class and code carried by an Error PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorInfo {
    pub class: u32,
    pub code: u32,
}

impl ErrorInfo {
    pub fn new(class: u32, code: u32) -> Self {
        ErrorInfo { class, code }
    }

    pub fn encode(&self, pdu: &mut Pdu) {
        encode_application_enumerated(pdu, self.class);
        encode_application_enumerated(pdu, self.code);
    }

    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        Ok(ErrorInfo {
            class: decode_application_enumerated(pdu)?,
            code: decode_application_enumerated(pdu)?,
        })
    }
}

/// A decoded service, as seen above the application service access point.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceBody {
    WhoIs(WhoIs),
    IAm(IAm),
    ReadProperty(ReadPropertyRequest),
    ReadPropertyAck(ReadPropertyAck),
    WriteProperty(WritePropertyRequest),
    DeviceCommunicationControl(DccRequest),
    SimpleAck {
        service: u8,
    },
    ErrorResponse {
        service: u8,
        error: ErrorInfo,
    },
    Reject {
        reason: RejectReason,
    },
    Abort {
        reason: AbortReason,
        /// Whether the abort came from (or is sent by) the server side.
        server: bool,
    },
}

/// A service body together with addressing and transaction identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMessage {
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub invoke_id: Option<u8>,
    /// Set on upstream traffic belonging to a transaction this device is
    /// serving rather than one it initiated.
    pub server_transaction: bool,
    pub body: ServiceBody,
}

impl ServiceMessage {
    pub fn request(destination: Address, body: ServiceBody) -> Self {
        ServiceMessage {
            source: None,
            destination: Some(destination),
            invoke_id: None,
            server_transaction: false,
            body,
        }
    }

    /// A response to a confirmed request: addressed back to its source,
    /// carrying its invoke ID.
    pub fn response_to(request: &ServiceMessage, body: ServiceBody) -> Self {
        ServiceMessage {
            source: None,
            destination: request.source.clone(),
            invoke_id: request.invoke_id,
            server_transaction: false,
            body,
        }
    }
}
