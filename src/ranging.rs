//! Implementation of double-sided two-way ranging
//!
//! This ranging technique is described in the DW1000 user manual, section 12.3.
//! This module uses three messages for a range measurement, as described in
//! section 12.3.2, plus a report that carries the result back.
//!
//! An exchange between a tag and an anchor looks like this:
//! 1. Tags discover anchors by broadcasting blinks. An anchor that hears a
//!    blink answers with a [`RangingInit`].
//! 2. The tag sends a [`Poll`] to one of the anchors it knows.
//! 3. The anchor answers with a [`PollAck`], sent after a fixed reply delay.
//! 4. The tag sends a [`Range`], containing the times the poll was sent and
//!    the acknowledgement received, as well as the time the range message
//!    itself is going to be sent.
//! 5. The anchor now knows all six timestamps, computes the time of flight
//!    with [`compute_time_of_flight`], and answers with a [`RangeReport`],
//!    or with [`RangeFailed`] if the result is implausible.
//!
//! The broadcast variants [`BroadcastPoll`] and [`BroadcastRange`] carry a
//! table with one entry per anchor, so several anchors can take part in the
//! same exchange, each replying in its own time slot.
//!
//! Please note that the raw time of flight is biased depending on the signal
//! level. See [`range_bias`] for a correction.
//!
//! [`range_bias`]: ../range_bias/index.html

use heapless::Vec;
use serde::{Deserialize, Serialize};

use byte::{BytesExt as _, TryRead, TryWrite, LE};

use crate::{
    device::Timestamps,
    error::FrameError,
    frame::{Frame, FrameBuffer, FrameCodec, MessageType, SHORT_PAYLOAD_LEN},
    mac::{ExtendedAddress, ShortAddress},
    time::{Instant, METERS_PER_TICK, TIMESTAMP_LEN},
};


/// Ranges outside of `0..=MAX_RANGE_M` meters are rejected
pub const MAX_RANGE_M: f32 = 300.0;


/// Implemented by all ranging messages with a fixed payload
pub trait Message: Sized + for<'de> Deserialize<'de> + Serialize {
    /// The function code that identifies the message
    const TYPE: MessageType;

    /// The length of the encoded payload
    ///
    /// This can't be derived from `size_of`, as timestamps take up 5 bytes on
    /// the wire.
    const LEN: usize;

    /// Decodes the payload of a received frame
    ///
    /// Returns `Ok(None)`, if the frame is not of the right type. The payload
    /// length has already been checked by [`Frame::decode`].
    fn decode(frame: &Frame) -> Result<Option<Self>, FrameError> {
        if frame.message_type != Self::TYPE {
            return Ok(None);
        }

        let (payload, _) = ssmarshal::deserialize::<Self>(frame.payload)?;
        Ok(Some(payload))
    }

    /// Writes a complete short address frame containing this message
    fn encode_short(
        &self,
        codec: &mut FrameCodec,
        buffer: &mut FrameBuffer,
        destination: ShortAddress,
    ) -> Result<(), FrameError> {
        let offset = codec.encode_short(buffer, destination, Self::TYPE)?;
        ssmarshal::serialize(&mut buffer[offset..], self)?;
        Ok(())
    }

    /// Writes a complete long address frame containing this message
    fn encode_long(
        &self,
        codec: &mut FrameCodec,
        buffer: &mut FrameBuffer,
        destination: ExtendedAddress,
    ) -> Result<(), FrameError> {
        let offset = codec.encode_long(buffer, destination, Self::TYPE)?;
        ssmarshal::serialize(&mut buffer[offset..], self)?;
        Ok(())
    }
}


/// Ranging poll, sent by a tag to a single anchor
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(C)]
pub struct Poll {
    /// Number of anchors addressed, always 1
    pub count: u8,

    /// The reply delay the tag would like the anchor to use, in µs
    pub reply_delay_us: u16,
}

impl Poll {
    /// Creates a poll for a single anchor
    pub fn new(reply_delay_us: u16) -> Self {
        Poll { count: 1, reply_delay_us }
    }
}

impl Message for Poll {
    const TYPE: MessageType = MessageType::Poll;
    const LEN: usize = 3;
}


/// Acknowledges a poll
///
/// Carries no data. The interesting part is when it is sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(C)]
pub struct PollAck {}

impl Message for PollAck {
    const TYPE: MessageType = MessageType::PollAck;
    const LEN: usize = 0;
}


/// The tag's timestamps of an exchange
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(C)]
pub struct Range {
    /// When the poll was sent, in tag time
    pub poll_sent: Instant,

    /// When the acknowledgement was received, in tag time
    pub poll_ack_received: Instant,

    /// When this message is going to be sent, in tag time
    pub range_sent: Instant,
}

impl Range {
    /// Creates a range message from the tag's view of an exchange
    pub fn new(timestamps: &Timestamps) -> Self {
        Range {
            poll_sent: timestamps.poll_sent,
            poll_ack_received: timestamps.poll_ack_received,
            range_sent: timestamps.range_sent,
        }
    }
}

impl Message for Range {
    const TYPE: MessageType = MessageType::Range;
    const LEN: usize = 3 * TIMESTAMP_LEN;
}


/// The result of an exchange, sent by the anchor
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[repr(C)]
pub struct RangeReport {
    /// The measured range, in meters
    pub range: f32,

    /// Receive power of the range message, in dBm
    pub rx_power: f32,
}

impl Message for RangeReport {
    const TYPE: MessageType = MessageType::RangeReport;
    const LEN: usize = 8;
}


/// Tells the tag that the exchange produced no usable result
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(C)]
pub struct RangeFailed {}

impl Message for RangeFailed {
    const TYPE: MessageType = MessageType::RangeFailed;
    const LEN: usize = 0;
}


/// Introduces an anchor to a tag that blinked
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(C)]
pub struct RangingInit {}

impl Message for RangingInit {
    const TYPE: MessageType = MessageType::RangingInit;
    const LEN: usize = 0;
}


/// Length of one entry in a broadcast poll
const POLL_ENTRY_LEN: usize = 4;

/// Length of one entry in a broadcast range message
const RANGE_ENTRY_LEN: usize = 2 + 3 * TIMESTAMP_LEN;

/// Maximum number of entries in a broadcast poll
pub const MAX_POLL_ENTRIES: usize = (SHORT_PAYLOAD_LEN - 1) / POLL_ENTRY_LEN;

/// Maximum number of entries in a broadcast range message
pub const MAX_RANGE_ENTRIES: usize = (SHORT_PAYLOAD_LEN - 1) / RANGE_ENTRY_LEN;


/// One anchor's slot in a broadcast poll
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollEntry {
    /// The anchor
    pub short_address: ShortAddress,

    /// When the anchor should reply, in µs after receiving the poll
    pub reply_delay_us: u16,
}

impl<'a> TryRead<'a> for PollEntry {
    fn try_read(bytes: &'a [u8], _: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;
        let short_address = ShortAddress(bytes.read_with(offset, LE)?);
        let reply_delay_us = bytes.read_with(offset, LE)?;

        Ok((PollEntry { short_address, reply_delay_us }, *offset))
    }
}

impl TryWrite for PollEntry {
    fn try_write(self, bytes: &mut [u8], _: ()) -> byte::Result<usize> {
        let offset = &mut 0;
        bytes.write_with(offset, self.short_address.0, LE)?;
        bytes.write_with(offset, self.reply_delay_us, LE)?;
        Ok(*offset)
    }
}


/// One anchor's timestamps in a broadcast range message
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RangeEntry {
    /// The anchor
    pub short_address: ShortAddress,

    /// The tag's timestamps of the exchange with that anchor
    pub range: Range,
}

impl<'a> TryRead<'a> for RangeEntry {
    fn try_read(bytes: &'a [u8], _: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;
        let short_address = ShortAddress(bytes.read_with(offset, LE)?);
        let range = Range {
            poll_sent: read_instant(bytes, offset)?,
            poll_ack_received: read_instant(bytes, offset)?,
            range_sent: read_instant(bytes, offset)?,
        };

        Ok((RangeEntry { short_address, range }, *offset))
    }
}

impl TryWrite for RangeEntry {
    fn try_write(self, bytes: &mut [u8], _: ()) -> byte::Result<usize> {
        let offset = &mut 0;
        bytes.write_with(offset, self.short_address.0, LE)?;
        for instant in [self.range.poll_sent, self.range.poll_ack_received, self.range.range_sent] {
            for octet in instant.to_bytes() {
                bytes.write_with(offset, octet, LE)?;
            }
        }
        Ok(*offset)
    }
}

fn read_instant(bytes: &[u8], offset: &mut usize) -> byte::Result<Instant> {
    let mut raw = [0; TIMESTAMP_LEN];
    for octet in raw.iter_mut() {
        *octet = bytes.read_with(offset, LE)?;
    }
    Ok(Instant::from_bytes(raw))
}


/// A poll addressed to several anchors at once
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BroadcastPoll {
    /// One entry per anchor
    pub entries: Vec<PollEntry, MAX_POLL_ENTRIES>,
}

impl BroadcastPoll {
    /// Decodes the payload of a broadcast poll
    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let entries = decode_table(frame.payload, POLL_ENTRY_LEN)?;
        Ok(BroadcastPoll { entries })
    }

    /// Writes a complete frame containing this message
    pub fn encode(
        &self,
        codec: &mut FrameCodec,
        buffer: &mut FrameBuffer,
        destination: ShortAddress,
    ) -> Result<(), FrameError> {
        let offset = codec.encode_short(buffer, destination, MessageType::Poll)?;
        encode_table(&mut buffer[offset..], &self.entries)
    }

    /// Returns the entry for the given anchor
    pub fn entry_for(&self, short_address: ShortAddress) -> Option<&PollEntry> {
        self.entries.iter().find(|entry| entry.short_address == short_address)
    }
}


/// Range timestamps for several anchors at once
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BroadcastRange {
    /// One entry per anchor
    pub entries: Vec<RangeEntry, MAX_RANGE_ENTRIES>,
}

impl BroadcastRange {
    /// Decodes the payload of a broadcast range message
    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let entries = decode_table(frame.payload, RANGE_ENTRY_LEN)?;
        Ok(BroadcastRange { entries })
    }

    /// Writes a complete frame containing this message
    pub fn encode(
        &self,
        codec: &mut FrameCodec,
        buffer: &mut FrameBuffer,
        destination: ShortAddress,
    ) -> Result<(), FrameError> {
        let offset = codec.encode_short(buffer, destination, MessageType::Range)?;
        encode_table(&mut buffer[offset..], &self.entries)
    }

    /// Returns the entry for the given anchor
    pub fn entry_for(&self, short_address: ShortAddress) -> Option<&RangeEntry> {
        self.entries.iter().find(|entry| entry.short_address == short_address)
    }
}

fn decode_table<'a, T, const N: usize>(payload: &'a [u8], entry_len: usize)
    -> Result<Vec<T, N>, FrameError>
    where T: TryRead<'a>
{
    let offset = &mut 0;
    let count: u8 = payload.read_with(offset, LE)?;
    let count = count as usize;

    let required = 1 + count * entry_len;
    if payload.len() < required {
        return Err(FrameError::PayloadTooShort {
            required,
            actual: payload.len(),
        });
    }

    let mut entries = Vec::new();
    for _ in 0..count {
        let entry = payload.read_with(offset, ())?;
        entries.push(entry).map_err(|_| FrameError::TableTooLarge(count))?;
    }

    Ok(entries)
}

fn encode_table<T>(payload: &mut [u8], entries: &[T]) -> Result<(), FrameError>
    where T: TryWrite + Copy
{
    let offset = &mut 0;
    payload.write_with(offset, entries.len() as u8, LE)?;
    for entry in entries {
        payload.write_with(offset, *entry, ())?;
    }
    Ok(())
}


/// Time of flight in DW1000 system time ticks
///
/// Negative values are possible, if the antenna delays are badly calibrated
/// or the nodes are very close to each other.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeOfFlight(pub i64);

impl TimeOfFlight {
    /// Converts into a distance in meters
    pub fn to_meters(self) -> f32 {
        self.0 as f32 * METERS_PER_TICK
    }
}

/// Returned from [`compute_time_of_flight`] in case of an error
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ComputeDistanceError {
    /// All round-trip and reply times are zero
    SumIsZero,

    /// The time of flight doesn't fit into 64 bits
    TimeOfFlightTooLarge,
}

/// Computes the time of flight from the six timestamps of an exchange
///
/// Uses the asymmetric formula from the DW1000 user manual, section 12.3.2,
/// which doesn't require the reply delays on both sides to be equal. All
/// differences are taken with wraparound of the 40-bit timer.
pub fn compute_time_of_flight(timestamps: &Timestamps)
    -> Result<TimeOfFlight, ComputeDistanceError>
{
    // `round` is the time from sending a message to receiving the answer,
    // `reply` the time from receiving a message to sending the answer.
    let round1 = timestamps.poll_ack_received.duration_since(timestamps.poll_sent).value() as i128;
    let reply1 = timestamps.poll_ack_sent.duration_since(timestamps.poll_received).value() as i128;
    let round2 = timestamps.range_received.duration_since(timestamps.poll_ack_sent).value() as i128;
    let reply2 = timestamps.range_sent.duration_since(timestamps.poll_ack_received).value() as i128;

    // 40-bit values, so neither the products nor the sum can overflow.
    let sum = round1 + round2 + reply1 + reply2;
    if sum == 0 {
        return Err(ComputeDistanceError::SumIsZero);
    }

    let time_of_flight = (round1 * round2 - reply1 * reply2) / sum;
    i64::try_from(time_of_flight)
        .map(TimeOfFlight)
        .map_err(|_| ComputeDistanceError::TimeOfFlightTooLarge)
}

/// Exponential moving average with a window of `window` samples
///
/// The weight of the new value is `2 / (window + 1)`. Windows below 2 are
/// treated as 2.
pub fn filter_value(value: f32, previous: f32, window: u16) -> f32 {
    let k = 2.0 / (window.max(2) as f32 + 1.0);
    value * k + previous * (1.0 - k)
}

/// Whether a range in meters is worth keeping
pub fn is_plausible_distance(meters: f32) -> bool {
    (0.0..=MAX_RANGE_M).contains(&meters)
}
