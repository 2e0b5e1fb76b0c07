// crates/bacnet-rs/src/types.rs

use crate::error::BacnetError;
use core::convert::TryFrom;

// --- Protocol Constants (ASHRAE 135, Annex J) ---

/// BVLL type octet for BACnet/IP: every Annex J datagram starts with it.
pub const BVLL_TYPE_BACNET_IP: u8 = 0x81;

/// Default BACnet/IP UDP port (47808).
pub const BACNET_IP_DEFAULT_PORT: u16 = 0xBAC0;

/// NPDU protocol version (ASHRAE 135, Clause 6.2.1).
pub const NPDU_PROTOCOL_VERSION: u8 = 0x01;

/// DNET value addressing every network (global broadcast).
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

// --- Core Protocol Identifiers ---

/// The eight APDU types (ASHRAE 135, Clause 20.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl TryFrom<u8> for ApduType {
    type Error = BacnetError;
    fn try_from(value: u8) -> Result<Self, BacnetError> {
        match value {
            0 => Ok(Self::ConfirmedRequest),
            1 => Ok(Self::UnconfirmedRequest),
            2 => Ok(Self::SimpleAck),
            3 => Ok(Self::ComplexAck),
            4 => Ok(Self::SegmentAck),
            5 => Ok(Self::Error),
            6 => Ok(Self::Reject),
            7 => Ok(Self::Abort),
            v => Err(BacnetError::InvalidApduType(v)),
        }
    }
}

/// Confirmed service choices used by the engine itself. The dispatch
/// registry accepts any `u8` choice; these are the ones with built-in
/// semantics (DCC gating, mandatory services).
pub mod confirmed_service {
    pub const READ_PROPERTY: u8 = 12;
    pub const WRITE_PROPERTY: u8 = 15;
    pub const DEVICE_COMMUNICATION_CONTROL: u8 = 17;
    pub const REINITIALIZE_DEVICE: u8 = 20;
}

/// Unconfirmed service choices with built-in semantics.
pub mod unconfirmed_service {
    pub const I_AM: u8 = 0;
    pub const WHO_IS: u8 = 8;
}

/// Segmentation capability advertised by a device (BACnetSegmentation,
/// ASHRAE 135, Clause 21). The wire values are the enumerated ones from
/// the standard, used as-is in I-Am.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Segmentation {
    SegmentedBoth = 0,
    SegmentedTransmit = 1,
    SegmentedReceive = 2,
    #[default]
    NoSegmentation = 3,
}

impl Segmentation {
    /// True if a device with this capability may send segmented APDUs.
    pub fn can_transmit(self) -> bool {
        matches!(self, Self::SegmentedTransmit | Self::SegmentedBoth)
    }

    /// True if a device with this capability may receive segmented APDUs.
    pub fn can_receive(self) -> bool {
        matches!(self, Self::SegmentedReceive | Self::SegmentedBoth)
    }
}

impl TryFrom<u8> for Segmentation {
    type Error = BacnetError;
    fn try_from(value: u8) -> Result<Self, BacnetError> {
        match value {
            0 => Ok(Self::SegmentedBoth),
            1 => Ok(Self::SegmentedTransmit),
            2 => Ok(Self::SegmentedReceive),
            3 => Ok(Self::NoSegmentation),
            _ => Err(BacnetError::InvalidEnumValue),
        }
    }
}

/// Reject reasons (BACnetRejectReason, ASHRAE 135, Clause 18.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Other,
    BufferOverflow,
    InconsistentParameters,
    InvalidParameterDataType,
    InvalidTag,
    MissingRequiredParameter,
    ParameterOutOfRange,
    TooManyArguments,
    UndefinedEnumeration,
    UnrecognizedService,
    Proprietary(u8),
}

impl RejectReason {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Other => 0,
            Self::BufferOverflow => 1,
            Self::InconsistentParameters => 2,
            Self::InvalidParameterDataType => 3,
            Self::InvalidTag => 4,
            Self::MissingRequiredParameter => 5,
            Self::ParameterOutOfRange => 6,
            Self::TooManyArguments => 7,
            Self::UndefinedEnumeration => 8,
            Self::UnrecognizedService => 9,
            Self::Proprietary(v) => v,
        }
    }

    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => Self::Other,
            1 => Self::BufferOverflow,
            2 => Self::InconsistentParameters,
            3 => Self::InvalidParameterDataType,
            4 => Self::InvalidTag,
            5 => Self::MissingRequiredParameter,
            6 => Self::ParameterOutOfRange,
            7 => Self::TooManyArguments,
            8 => Self::UndefinedEnumeration,
            9 => Self::UnrecognizedService,
            v => Self::Proprietary(v),
        }
    }
}

/// Abort reasons (BACnetAbortReason, ASHRAE 135, Clause 18.9).
/// `ServerTimeout` and `NoResponse` live in the vendor range (>= 64).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Other,
    BufferOverflow,
    InvalidApduInThisState,
    PreemptedByHigherPriorityTask,
    SegmentationNotSupported,
    WindowSizeOutOfRange,
    ApplicationExceededReplyTime,
    OutOfResources,
    ApduTooLong,
    ServerTimeout,
    NoResponse,
    Proprietary(u8),
}

impl AbortReason {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Other => 0,
            Self::BufferOverflow => 1,
            Self::InvalidApduInThisState => 2,
            Self::PreemptedByHigherPriorityTask => 3,
            Self::SegmentationNotSupported => 4,
            Self::WindowSizeOutOfRange => 7,
            Self::ApplicationExceededReplyTime => 8,
            Self::OutOfResources => 9,
            Self::ApduTooLong => 11,
            Self::ServerTimeout => 64,
            Self::NoResponse => 65,
            Self::Proprietary(v) => v,
        }
    }

    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => Self::Other,
            1 => Self::BufferOverflow,
            2 => Self::InvalidApduInThisState,
            3 => Self::PreemptedByHigherPriorityTask,
            4 => Self::SegmentationNotSupported,
            7 => Self::WindowSizeOutOfRange,
            8 => Self::ApplicationExceededReplyTime,
            9 => Self::OutOfResources,
            11 => Self::ApduTooLong,
            64 => Self::ServerTimeout,
            65 => Self::NoResponse,
            v => Self::Proprietary(v),
        }
    }
}

// --- Error class / code constants (BACnetErrorClass / BACnetErrorCode) ---

pub mod error_class {
    pub const DEVICE: u32 = 0;
    pub const OBJECT: u32 = 1;
    pub const PROPERTY: u32 = 2;
    pub const SERVICES: u32 = 5;
    pub const COMMUNICATION: u32 = 7;
}

pub mod error_code {
    pub const OTHER: u32 = 0;
    pub const INVALID_DATA_TYPE: u32 = 9;
    pub const OPERATIONAL_PROBLEM: u32 = 25;
    pub const UNKNOWN_OBJECT: u32 = 31;
    pub const VALUE_OUT_OF_RANGE: u32 = 37;
    pub const WRITE_ACCESS_DENIED: u32 = 40;
    pub const UNKNOWN_PROPERTY: u32 = 52;
    pub const INVALID_TAG: u32 = 57;
}

// --- max-segments-accepted / max-APDU-length-accepted field codecs ---
//
// Both fields share one octet of a ConfirmedRequest header: the segment
// count in bits 6..4 and the length code in bits 3..0.
// (Reference: ASHRAE 135, Clause 20.1.2.4 and 20.1.2.5)

/// Encode a maximum segment count into the 3-bit wire field.
/// `None` means unspecified (or more than 64).
pub fn encode_max_segments_accepted(max_segments: Option<u8>) -> u8 {
    match max_segments {
        None => 0,
        Some(n) if n <= 2 => 1,
        Some(n) if n <= 4 => 2,
        Some(n) if n <= 8 => 3,
        Some(n) if n <= 16 => 4,
        Some(n) if n <= 32 => 5,
        Some(n) if n <= 64 => 6,
        Some(_) => 7,
    }
}

/// Decode the 3-bit wire field into a segment count. Both 0 (unspecified)
/// and 7 (more than 64) decode to `None`.
pub fn decode_max_segments_accepted(value: u8) -> Option<u8> {
    match value & 0x07 {
        1 => Some(2),
        2 => Some(4),
        3 => Some(8),
        4 => Some(16),
        5 => Some(32),
        6 => Some(64),
        _ => None,
    }
}

/// Encode a maximum APDU length into the 4-bit wire field, picking the
/// largest table entry that does not exceed the given length.
pub fn encode_max_apdu_length_accepted(max_apdu: usize) -> u8 {
    if max_apdu >= 1476 {
        5
    } else if max_apdu >= 1024 {
        4
    } else if max_apdu >= 480 {
        3
    } else if max_apdu >= 206 {
        2
    } else if max_apdu >= 128 {
        1
    } else {
        0
    }
}

/// Decode the 4-bit wire field into an APDU length in octets.
pub fn decode_max_apdu_length_accepted(value: u8) -> Option<usize> {
    match value & 0x0F {
        0 => Some(50),
        1 => Some(128),
        2 => Some(206),
        3 => Some(480),
        4 => Some(1024),
        5 => Some(1476),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apdu_type_try_from() {
        assert_eq!(ApduType::try_from(4), Ok(ApduType::SegmentAck));
        assert!(matches!(
            ApduType::try_from(8),
            Err(BacnetError::InvalidApduType(8))
        ));
    }

    #[test]
    fn test_segmentation_capabilities() {
        assert!(Segmentation::SegmentedBoth.can_transmit());
        assert!(Segmentation::SegmentedBoth.can_receive());
        assert!(Segmentation::SegmentedTransmit.can_transmit());
        assert!(!Segmentation::SegmentedTransmit.can_receive());
        assert!(!Segmentation::NoSegmentation.can_transmit());
        assert!(!Segmentation::NoSegmentation.can_receive());
    }

    #[test]
    fn test_max_segments_field_roundtrip() {
        assert_eq!(encode_max_segments_accepted(None), 0);
        assert_eq!(encode_max_segments_accepted(Some(2)), 1);
        assert_eq!(encode_max_segments_accepted(Some(64)), 6);
        assert_eq!(encode_max_segments_accepted(Some(200)), 7);
        assert_eq!(decode_max_segments_accepted(0), None);
        assert_eq!(decode_max_segments_accepted(1), Some(2));
        assert_eq!(decode_max_segments_accepted(6), Some(64));
        assert_eq!(decode_max_segments_accepted(7), None);
    }

    #[test]
    fn test_max_apdu_field_roundtrip() {
        assert_eq!(encode_max_apdu_length_accepted(1024), 4);
        assert_eq!(encode_max_apdu_length_accepted(1476), 5);
        assert_eq!(encode_max_apdu_length_accepted(50), 0);
        // In-between values pick the largest entry that still fits.
        assert_eq!(encode_max_apdu_length_accepted(1000), 3);
        assert_eq!(decode_max_apdu_length_accepted(4), Some(1024));
        assert_eq!(decode_max_apdu_length_accepted(15), None);
    }

    #[test]
    fn test_reject_and_abort_reason_wire_values() {
        assert_eq!(RejectReason::UnrecognizedService.to_wire(), 9);
        assert_eq!(
            RejectReason::from_wire(9),
            RejectReason::UnrecognizedService
        );
        assert_eq!(RejectReason::from_wire(200), RejectReason::Proprietary(200));
        assert_eq!(AbortReason::SegmentationNotSupported.to_wire(), 4);
        assert_eq!(AbortReason::from_wire(65), AbortReason::NoResponse);
        assert_eq!(AbortReason::from_wire(11), AbortReason::ApduTooLong);
    }
}
