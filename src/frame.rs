//! Encoding and decoding of ranging frames
//!
//! All frames have the same fixed length of [`FRAME_LEN`] bytes. They start
//! with one of three IEEE 802.15.4 style addressing headers, selected by the
//! frame control bytes:
//!
//! 1. Blink: `0xC5`, sequence number, 8-byte sender identity, 2-byte sender
//!    short address. Blinks carry no function code.
//! 2. Long address: `0x41 0xCC`, sequence number, PAN id, 8-byte recipient
//!    identity, 2-byte sender short address. Only used for
//!    [`MessageType::RangingInit`].
//! 3. Short address: `0x41 0x88`, sequence number, PAN id, 2-byte recipient
//!    short address, 2-byte sender short address. Used for everything else.
//!
//! In the latter two cases, the function code byte follows the header
//! immediately, and the message payload follows the function code. All
//! multi-byte fields are little-endian.
//!
//! Decoding validates the payload length against
//! [`MessageType::min_payload_len`] for every message type, so the handlers
//! can read their fixed fields without further checks.

use core::num::Wrapping;

use byte::{
    BytesExt as _,
    TryRead,
    TryWrite,
    LE,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    error::FrameError,
    mac::{ExtendedAddress, PanId, ShortAddress},
};


/// Total length of every frame
pub const FRAME_LEN: usize = 35;

/// A buffer that holds a complete frame
pub type FrameBuffer = [u8; FRAME_LEN];

/// The broadcast short address
pub const BROADCAST_SHORT: ShortAddress = ShortAddress(0xffff);

/// The broadcast identity
pub const BROADCAST_EXTENDED: ExtendedAddress = ExtendedAddress(0xffff_ffff_ffff_ffff);

/// Frame control byte of blink frames
const FC_BLINK: u8 = 0xC5;

/// First frame control byte of data frames
const FC_DATA: u8 = 0x41;

/// Second frame control byte, long destination and short source address
const FC_LONG: u8 = 0xCC;

/// Second frame control byte, short destination and source address
const FC_SHORT: u8 = 0x88;

/// Length of the blink header
pub const BLINK_HEADER_LEN: usize = 12;

/// Length of the long address header, without the function code
pub const LONG_HEADER_LEN: usize = 15;

/// Length of the short address header, without the function code
pub const SHORT_HEADER_LEN: usize = 9;

/// Payload space left in a short address frame
pub const SHORT_PAYLOAD_LEN: usize = FRAME_LEN - SHORT_HEADER_LEN - 1;


/// The function code of a frame
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageType {
    /// Tag asks an anchor to start an exchange
    Poll        = 0,
    /// Anchor answers a poll
    PollAck     = 1,
    /// Tag reports its timestamps
    Range       = 2,
    /// Anchor reports the computed range
    RangeReport = 3,
    /// Tag announces itself
    Blink       = 4,
    /// Anchor introduces itself to a blinking tag
    RangingInit = 5,
    /// Anchor rejects an implausible measurement
    RangeFailed = 255,
}

impl MessageType {
    /// The minimum number of payload bytes a message of this type carries
    ///
    /// This is the single place that defines how long a payload must be. It
    /// is checked for every frame in [`Frame::decode`].
    pub fn min_payload_len(&self) -> usize {
        match self {
            // count, reply delay
            MessageType::Poll => 3,
            // three timestamps
            MessageType::Range => 15,
            // range, receive power
            MessageType::RangeReport => 8,
            MessageType::PollAck
            | MessageType::Blink
            | MessageType::RangingInit
            | MessageType::RangeFailed => 0,
        }
    }
}


/// The addressing part of a frame header
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Addressing {
    /// A blink, which is always broadcast
    Blink {
        /// Identity of the sender
        source: ExtendedAddress,
        /// Short address of the sender
        source_short: ShortAddress,
    },

    /// Long recipient identity, short sender address
    Long {
        /// The network
        pan_id: PanId,
        /// Identity of the recipient
        destination: ExtendedAddress,
        /// Short address of the sender
        source: ShortAddress,
    },

    /// Short recipient and sender addresses
    Short {
        /// The network
        pan_id: PanId,
        /// Short address of the recipient
        destination: ShortAddress,
        /// Short address of the sender
        source: ShortAddress,
    },
}

impl Addressing {
    /// The sender's short address
    pub fn source_short(&self) -> ShortAddress {
        match *self {
            Addressing::Blink { source_short, .. } => source_short,
            Addressing::Long { source, .. } => source,
            Addressing::Short { source, .. } => source,
        }
    }

    /// Whether the frame is meant for a node with the given addresses
    ///
    /// Blinks and broadcasts are meant for everyone.
    pub fn is_for(&self, address: ExtendedAddress, short_address: ShortAddress) -> bool {
        match *self {
            Addressing::Blink { .. } => true,
            Addressing::Long { destination, .. } => {
                destination == address || destination == BROADCAST_EXTENDED
            }
            Addressing::Short { destination, .. } => {
                destination == short_address || destination == BROADCAST_SHORT
            }
        }
    }

    /// Whether the frame is addressed to everyone
    pub fn is_broadcast(&self) -> bool {
        match *self {
            Addressing::Blink { .. } => true,
            Addressing::Long { destination, .. } => destination == BROADCAST_EXTENDED,
            Addressing::Short { destination, .. } => destination == BROADCAST_SHORT,
        }
    }
}


/// A frame header, including the sequence number
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    /// Sequence number
    pub sequence: u8,

    /// Source and destination
    pub addressing: Addressing,
}

impl Header {
    /// Length of the encoded header, without the function code
    pub fn encoded_len(&self) -> usize {
        match self.addressing {
            Addressing::Blink { .. } => BLINK_HEADER_LEN,
            Addressing::Long { .. } => LONG_HEADER_LEN,
            Addressing::Short { .. } => SHORT_HEADER_LEN,
        }
    }
}

impl<'a> TryRead<'a> for Header {
    fn try_read(bytes: &'a [u8], _: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;

        let fc1: u8 = bytes.read_with(offset, LE)?;
        let addressing = match fc1 {
            FC_BLINK => {
                let sequence: u8 = bytes.read_with(offset, LE)?;
                let source: u64 = bytes.read_with(offset, LE)?;
                let source_short: u16 = bytes.read_with(offset, LE)?;

                let header = Header {
                    sequence,
                    addressing: Addressing::Blink {
                        source: ExtendedAddress(source),
                        source_short: ShortAddress(source_short),
                    },
                };
                return Ok((header, *offset));
            }
            FC_DATA => {
                bytes.read_with::<u8>(offset, LE)?
            }
            _ => {
                return Err(byte::Error::BadInput { err: "unknown frame control" });
            }
        };

        let sequence: u8 = bytes.read_with(offset, LE)?;
        let pan_id = PanId(bytes.read_with(offset, LE)?);

        let addressing = match addressing {
            FC_LONG => {
                let destination: u64 = bytes.read_with(offset, LE)?;
                let source: u16 = bytes.read_with(offset, LE)?;
                Addressing::Long {
                    pan_id,
                    destination: ExtendedAddress(destination),
                    source: ShortAddress(source),
                }
            }
            FC_SHORT => {
                let destination: u16 = bytes.read_with(offset, LE)?;
                let source: u16 = bytes.read_with(offset, LE)?;
                Addressing::Short {
                    pan_id,
                    destination: ShortAddress(destination),
                    source: ShortAddress(source),
                }
            }
            _ => {
                return Err(byte::Error::BadInput { err: "unknown frame control" });
            }
        };

        Ok((Header { sequence, addressing }, *offset))
    }
}

impl TryWrite for Header {
    fn try_write(self, bytes: &mut [u8], _: ()) -> byte::Result<usize> {
        let offset = &mut 0;

        match self.addressing {
            Addressing::Blink { source, source_short } => {
                bytes.write_with(offset, FC_BLINK, LE)?;
                bytes.write_with(offset, self.sequence, LE)?;
                bytes.write_with(offset, source.0, LE)?;
                bytes.write_with(offset, source_short.0, LE)?;
            }
            Addressing::Long { pan_id, destination, source } => {
                bytes.write_with(offset, FC_DATA, LE)?;
                bytes.write_with(offset, FC_LONG, LE)?;
                bytes.write_with(offset, self.sequence, LE)?;
                bytes.write_with(offset, pan_id.0, LE)?;
                bytes.write_with(offset, destination.0, LE)?;
                bytes.write_with(offset, source.0, LE)?;
            }
            Addressing::Short { pan_id, destination, source } => {
                bytes.write_with(offset, FC_DATA, LE)?;
                bytes.write_with(offset, FC_SHORT, LE)?;
                bytes.write_with(offset, self.sequence, LE)?;
                bytes.write_with(offset, pan_id.0, LE)?;
                bytes.write_with(offset, destination.0, LE)?;
                bytes.write_with(offset, source.0, LE)?;
            }
        }

        Ok(*offset)
    }
}


/// A decoded frame
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Frame<'a> {
    /// The addressing header
    pub header: Header,

    /// The function code, [`MessageType::Blink`] for blinks
    pub message_type: MessageType,

    /// Everything after the function code
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decodes a received frame
    ///
    /// Rejects unknown frame control bytes and function codes, message types
    /// sent with the wrong addressing mode, and payloads that are too short
    /// for their message type.
    pub fn decode(bytes: &'a [u8]) -> Result<Self, FrameError> {
        match bytes {
            [FC_BLINK, ..] => (),
            [FC_DATA, FC_LONG, ..] | [FC_DATA, FC_SHORT, ..] => (),
            [FC_DATA] | [] => return Err(FrameError::HeaderTruncated),
            [FC_DATA, fc2, ..] => return Err(FrameError::UnknownFrameControl(*fc2)),
            [fc1, ..] => return Err(FrameError::UnknownFrameControl(*fc1)),
        }

        let offset = &mut 0;
        let header: Header = bytes.read_with(offset, ())?;

        let message_type = match header.addressing {
            Addressing::Blink { .. } => MessageType::Blink,
            _ => {
                let code: u8 = bytes.read_with(offset, LE)?;
                let message_type = MessageType::try_from_primitive(code)
                    .map_err(|_| FrameError::UnknownMessageType(code))?;

                let is_long = matches!(header.addressing, Addressing::Long { .. });
                let wants_long = message_type == MessageType::RangingInit;
                if message_type == MessageType::Blink || is_long != wants_long {
                    return Err(FrameError::WrongAddressingMode);
                }

                message_type
            }
        };

        let payload = &bytes[*offset..];
        let required = message_type.min_payload_len();
        if payload.len() < required {
            return Err(FrameError::PayloadTooShort {
                required,
                actual: payload.len(),
            });
        }

        Ok(Frame {
            header,
            message_type,
            payload,
        })
    }
}


/// Writes frame headers for a node
///
/// Knows the node's own addresses and network, and numbers the frames.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    sequence: Wrapping<u8>,
    pan_id: PanId,
    address: ExtendedAddress,
    short_address: ShortAddress,
}

impl FrameCodec {
    /// Creates a codec for a node with the given addresses
    pub fn new(address: ExtendedAddress, short_address: ShortAddress, pan_id: PanId) -> Self {
        FrameCodec {
            sequence: Wrapping(0),
            pan_id,
            address,
            short_address,
        }
    }

    /// The node's identity
    pub fn address(&self) -> ExtendedAddress {
        self.address
    }

    /// The node's short address
    pub fn short_address(&self) -> ShortAddress {
        self.short_address
    }

    /// The network the node is part of
    pub fn pan_id(&self) -> PanId {
        self.pan_id
    }

    /// Writes a blink frame into `buffer`
    ///
    /// Returns the number of bytes written.
    pub fn encode_blink(&mut self, buffer: &mut FrameBuffer) -> Result<usize, FrameError> {
        let header = Header {
            sequence: self.next_sequence(),
            addressing: Addressing::Blink {
                source: self.address,
                source_short: self.short_address,
            },
        };
        self.encode(buffer, header, None)
    }

    /// Writes a long address header and function code into `buffer`
    ///
    /// Returns the offset of the payload.
    pub fn encode_long(
        &mut self,
        buffer: &mut FrameBuffer,
        destination: ExtendedAddress,
        message_type: MessageType,
    ) -> Result<usize, FrameError> {
        let header = Header {
            sequence: self.next_sequence(),
            addressing: Addressing::Long {
                pan_id: self.pan_id,
                destination,
                source: self.short_address,
            },
        };
        self.encode(buffer, header, Some(message_type))
    }

    /// Writes a short address header and function code into `buffer`
    ///
    /// Returns the offset of the payload.
    pub fn encode_short(
        &mut self,
        buffer: &mut FrameBuffer,
        destination: ShortAddress,
        message_type: MessageType,
    ) -> Result<usize, FrameError> {
        let header = Header {
            sequence: self.next_sequence(),
            addressing: Addressing::Short {
                pan_id: self.pan_id,
                destination,
                source: self.short_address,
            },
        };
        self.encode(buffer, header, Some(message_type))
    }

    fn encode(
        &self,
        buffer: &mut FrameBuffer,
        header: Header,
        message_type: Option<MessageType>,
    ) -> Result<usize, FrameError> {
        buffer.fill(0);

        let offset = &mut 0;
        buffer.write_with(offset, header, ())?;
        if let Some(message_type) = message_type {
            buffer.write_with(offset, u8::from(message_type), LE)?;
        }

        Ok(*offset)
    }

    fn next_sequence(&mut self) -> u8 {
        let sequence = self.sequence.0;
        self.sequence += Wrapping(1);
        sequence
    }
}
