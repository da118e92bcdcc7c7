//! Errors reported by this crate
//!
//! Protocol-level problems with received frames never reach the user as an
//! error. The engine logs them and drops the frame. The types here describe
//! why that happened, and the failures that can occur when the caller asks
//! for something directly.

use core::fmt::Debug;

use thiserror::Error;


/// A frame could not be encoded or decoded
#[derive(Error, Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// The frame control bytes don't match any known addressing mode
    #[error("unknown frame control: {0:#04x}")]
    UnknownFrameControl(u8),

    /// The frame ends before its addressing header does
    #[error("frame header truncated")]
    HeaderTruncated,

    /// The function code doesn't name a known message type
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// The payload is shorter than the message type requires
    #[error("payload too short: need {required} bytes, got {actual}")]
    PayloadTooShort {
        /// Bytes required by the message type
        required: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// The message type can't be carried by the addressing mode it arrived in
    #[error("message type not allowed in this addressing mode")]
    WrongAddressingMode,

    /// A broadcast table doesn't fit into a single frame
    #[error("broadcast table too large: {0} entries")]
    TableTooLarge(usize),

    /// Serializing or deserializing the message payload failed
    #[error("payload serialization failed")]
    Serialization,

    /// Reading or writing the addressing header failed
    #[error("header codec failed")]
    Codec,
}

impl From<ssmarshal::Error> for FrameError {
    fn from(_: ssmarshal::Error) -> Self {
        FrameError::Serialization
    }
}

impl From<byte::Error> for FrameError {
    fn from(error: byte::Error) -> Self {
        match error {
            byte::Error::Incomplete => FrameError::HeaderTruncated,
            _ => FrameError::Codec,
        }
    }
}


/// A device could not be added to the [`DeviceTable`]
///
/// [`DeviceTable`]: ../table/struct.DeviceTable.html
#[derive(Error, Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddError {
    /// An active device with the same short address is already registered
    #[error("an active device already uses short address {0:#06x}")]
    DuplicateActive(u16),

    /// A device with the same identity is already registered
    #[error("device already present")]
    AlreadyPresent,

    /// All slots of the table are in use
    #[error("device table full")]
    TableFull,
}


/// A [`DeviceHandle`] no longer refers to a record in the table
///
/// [`DeviceHandle`]: ../table/struct.DeviceHandle.html
#[derive(Error, Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("stale device handle")]
pub struct StaleHandle;


/// A textual EUI-64 identity could not be parsed
#[derive(Error, Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseAddressError {
    /// The string doesn't contain exactly eight groups
    #[error("expected 8 colon separated bytes")]
    WrongLength,

    /// A group isn't a two-digit hexadecimal number
    #[error("invalid hex byte at position {0}")]
    InvalidByte(usize),
}


/// An error that can occur while the engine talks to the radio
#[derive(Error, Debug)]
pub enum Error<E: Debug> {
    /// The radio driver reported an error
    #[error("radio error: {0:?}")]
    Radio(E),

    /// An outgoing frame could not be encoded
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

#[cfg(feature = "defmt")]
impl<E> defmt::Format for Error<E>
    where E: Debug
{
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::Radio(_) => defmt::write!(f, "Radio"),
            Error::Frame(error) => defmt::write!(f, "Frame({})", error),
        }
    }
}
