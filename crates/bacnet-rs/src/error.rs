// crates/bacnet-rs/src/error.rs

use core::fmt;

/// Defines a portable, descriptive Error type for the BACnet stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacnetError {
    /// A read ran past the end of a PDU buffer.
    Decoding(&'static str),
    /// An underlying I/O error occurred.
    IoError,
    /// A received BVLL frame is fundamentally invalid (wrong type octet, bad length).
    InvalidBvllFrame,
    /// A received NPDU is fundamentally invalid (wrong version, truncated headers).
    InvalidNpdu,
    /// A value in the frame is not a valid APDU type.
    InvalidApduType(u8),
    /// A value in a frame is not a valid enum variant (segmentation, BVLL function).
    InvalidEnumValue,
    /// A textual address could not be parsed.
    InvalidAddress(&'static str),
    /// An application tag did not match what the service decoder expected.
    InvalidTag,
    /// The stack was assembled or used incorrectly. Fatal at setup, never at runtime.
    Configuration(&'static str),
    /// All 256 invoke IDs are in use for the destination.
    NoInvokeIdAvailable,
    /// The application supplied an invoke ID that is already bound to a transaction.
    InvokeIdInUse(u8),
    /// A state machine was driven with an event that is illegal in its current state.
    InvalidState(&'static str),
    /// A device information record was released more times than it was acquired.
    ReferenceCount,
    /// Internal logic error.
    InternalError(&'static str),
}

impl fmt::Display for BacnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoding(s) => write!(f, "Decoding error: {}", s),
            Self::IoError => write!(f, "Underlying I/O error"),
            Self::InvalidBvllFrame => write!(f, "Invalid BVLL frame"),
            Self::InvalidNpdu => write!(f, "Invalid NPDU"),
            Self::InvalidApduType(v) => write!(f, "Invalid APDU type: {:#04x}", v),
            Self::InvalidEnumValue => write!(f, "Invalid enum value in frame"),
            Self::InvalidAddress(s) => write!(f, "Invalid address: {}", s),
            Self::InvalidTag => write!(f, "Unexpected application or context tag"),
            Self::Configuration(s) => write!(f, "Configuration error: {}", s),
            Self::NoInvokeIdAvailable => write!(f, "No available invoke ID"),
            Self::InvokeIdInUse(id) => write!(f, "Invoke ID {} already in use", id),
            Self::InvalidState(s) => write!(f, "Invalid state transition: {}", s),
            Self::ReferenceCount => write!(f, "Device info reference count underflow"),
            Self::InternalError(s) => write!(f, "Internal error: {}", s),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BacnetError {}

impl From<&'static str> for BacnetError {
    fn from(s: &'static str) -> Self {
        BacnetError::InternalError(s)
    }
}
