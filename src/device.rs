//! Per-peer state
//!
//! Every node the engine has heard from gets a [`Device`] record in the
//! [`DeviceTable`]. The record holds the peer's addresses, the timestamps of
//! the ongoing exchange, the last measurement, and the bookkeeping required
//! to detect inactivity.
//!
//! [`DeviceTable`]: ../table/struct.DeviceTable.html

use core::fmt;

use rand_core::RngCore;

use crate::{
    configs::DEFAULT_REPLY_DELAY_US,
    error::ParseAddressError,
    frame::MessageType,
    mac::{ExtendedAddress, ShortAddress},
    time::Instant,
};


/// A device is inactive after this long without activity, in ms
pub const INACTIVITY_TIME_MS: u32 = 2_000;

/// A device stuck in [`TagState::Ranging`] for this long is reset, in ms
pub const RANGING_TIMEOUT_MS: u32 = 500;

/// High byte of random short addresses picked by anchors
pub const ANCHOR_SHORT_PREFIX: u16 = 0x1200;

/// High byte of random short addresses picked by tags
pub const TAG_SHORT_PREFIX: u16 = 0x9800;


/// A fixed-point number with two decimal digits
///
/// Stores the value multiplied by 100 in an `i16`, covering
/// -327.68 to 327.67. Conversion from `f32` rounds to the nearest step
/// (halfway cases away from zero) and saturates at the ends of the range.
/// `NaN` becomes zero.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Centi(i16);

impl Centi {
    /// Zero
    pub const ZERO: Centi = Centi(0);

    /// Creates an instance from the scaled representation
    pub const fn from_raw(raw: i16) -> Self {
        Centi(raw)
    }

    /// Converts a float, rounding and saturating as described above
    pub fn from_f32(value: f32) -> Self {
        #[allow(unused_imports)]
        use micromath::F32Ext;

        // `as` saturates and maps NaN to 0.
        Centi((value * 100.0).round() as i16)
    }

    /// Returns the value as a float
    pub fn to_f32(self) -> f32 {
        self.0 as f32 / 100.0
    }

    /// Returns the scaled representation
    pub fn raw(self) -> i16 {
        self.0
    }
}

impl fmt::Display for Centi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}


/// Whether a peer is currently part of a ranging exchange
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TagState {
    /// Available for the next exchange
    #[default]
    Idle,

    /// An exchange is in progress
    Ranging,
}


/// The six timestamps of a double-sided two-way ranging exchange
///
/// On the tag, all fields are in the tag's clock. On the anchor,
/// `poll_received`, `poll_ack_sent` and `range_received` are local, while
/// `poll_sent`, `poll_ack_received` and `range_sent` hold the tag's values as
/// reported in the range message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timestamps {
    /// Poll left the tag
    pub poll_sent: Instant,
    /// Poll arrived at the anchor
    pub poll_received: Instant,
    /// Poll acknowledgement left the anchor
    pub poll_ack_sent: Instant,
    /// Poll acknowledgement arrived at the tag
    pub poll_ack_received: Instant,
    /// Range message left the tag
    pub range_sent: Instant,
    /// Range message arrived at the anchor
    pub range_received: Instant,
}


/// Everything the engine knows about a peer
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Device {
    address: u64,
    short_address: u16,

    active: bool,
    tag_state: TagState,
    last_state_change_ms: u32,
    last_activity_ms: u32,

    /// Timestamps of the current exchange
    pub timestamps: Timestamps,

    /// Last measured range, in meters
    pub range: Centi,
    /// Receive power of the last measurement, in dBm
    pub rx_power: Centi,
    /// First path power of the last measurement, in dBm
    pub first_path_power: Centi,
    /// Receive quality of the last measurement
    pub quality: Centi,

    /// The message type the next frame from this peer must have
    pub expected_message: MessageType,
    /// Delay between receiving a frame from this peer and replying, in µs
    pub reply_delay_us: u16,

    pub(crate) index: usize,
    pub(crate) id: u32,
}

impl Device {
    /// Creates a record for a peer whose addresses are known
    pub fn new(address: ExtendedAddress, short_address: ShortAddress, now_ms: u32) -> Self {
        Device {
            address: address.0,
            short_address: short_address.0,
            active: true,
            tag_state: TagState::Idle,
            last_state_change_ms: now_ms,
            last_activity_ms: now_ms,
            timestamps: Timestamps::default(),
            range: Centi::ZERO,
            rx_power: Centi::ZERO,
            first_path_power: Centi::ZERO,
            quality: Centi::ZERO,
            expected_message: MessageType::Poll,
            reply_delay_us: DEFAULT_REPLY_DELAY_US,
            index: 0,
            id: 0,
        }
    }

    /// Creates a record for a peer known only by its short address
    ///
    /// The identity is left at zero.
    pub fn from_short_address(short_address: ShortAddress, now_ms: u32) -> Self {
        Device::new(ExtendedAddress(0), short_address, now_ms)
    }

    /// Creates a record with a random short address
    ///
    /// The low byte is random, the high byte is `prefix`, usually
    /// [`ANCHOR_SHORT_PREFIX`] or [`TAG_SHORT_PREFIX`].
    pub fn with_random_short_address<R>(
        address: ExtendedAddress,
        prefix: u16,
        rng: &mut R,
        now_ms: u32,
    ) -> Self
        where R: RngCore
    {
        let low = (rng.next_u32() & 0xff) as u16;
        Device::new(address, ShortAddress((prefix & 0xff00) | low), now_ms)
    }

    /// The peer's 8-byte identity
    pub fn address(&self) -> ExtendedAddress {
        ExtendedAddress(self.address)
    }

    /// The peer's short address
    pub fn short_address(&self) -> ShortAddress {
        ShortAddress(self.short_address)
    }

    /// Position of this record in its table
    pub fn index(&self) -> usize {
        self.index
    }

    /// Compares the 8-byte identity
    pub fn is_address_equal(&self, other: &Device) -> bool {
        self.address == other.address
    }

    /// Compares the short address
    pub fn is_short_address_equal(&self, other: &Device) -> bool {
        self.short_address == other.short_address
    }

    /// Whether the device counts as present
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_inactive(&mut self) {
        self.active = false;
    }

    /// Records that the peer was heard from, which also reactivates it
    pub fn note_activity(&mut self, now_ms: u32) {
        self.last_activity_ms = now_ms;
        self.active = true;
    }

    /// Time of the last activity, in ms
    pub fn last_activity_ms(&self) -> u32 {
        self.last_activity_ms
    }

    /// Whether more than [`INACTIVITY_TIME_MS`] passed since the last activity
    pub fn is_inactive(&self, now_ms: u32) -> bool {
        now_ms.wrapping_sub(self.last_activity_ms) > INACTIVITY_TIME_MS
    }

    /// Whether the device is stuck in [`TagState::Ranging`]
    pub fn is_ranging_stuck(&self, now_ms: u32) -> bool {
        self.tag_state == TagState::Ranging
            && now_ms.wrapping_sub(self.last_activity_ms) > RANGING_TIMEOUT_MS
    }

    /// The current ranging state
    pub fn tag_state(&self) -> TagState {
        self.tag_state
    }

    /// Changes the ranging state and stamps the time of the change
    pub fn set_tag_state(&mut self, state: TagState, now_ms: u32) {
        self.tag_state = state;
        self.last_state_change_ms = now_ms;
    }

    /// Time of the last ranging state change, in ms
    pub fn last_state_change_ms(&self) -> u32 {
        self.last_state_change_ms
    }
}


/// Parses an identity written as eight colon separated hex bytes
///
/// The first byte in the string is the least significant one, matching the
/// order in which the identity appears on the air.
///
/// ``` rust
/// use dw1000_ranging::device::parse_extended_address;
///
/// let address = parse_extended_address("7D:00:22:EA:82:60:3B:9C").unwrap();
/// assert_eq!(address.0, 0x9C3B_6082_EA22_007D);
/// ```
pub fn parse_extended_address(text: &str) -> Result<ExtendedAddress, ParseAddressError> {
    let mut value = 0u64;
    let mut count = 0;

    for (i, group) in text.split(':').enumerate() {
        if i >= 8 {
            return Err(ParseAddressError::WrongLength);
        }
        if group.len() != 2 {
            return Err(ParseAddressError::InvalidByte(i));
        }
        let byte = u8::from_str_radix(group, 16)
            .map_err(|_| ParseAddressError::InvalidByte(i))?;

        value |= (byte as u64) << (8 * i);
        count += 1;
    }

    if count != 8 {
        return Err(ParseAddressError::WrongLength);
    }

    Ok(ExtendedAddress(value))
}

/// Derives the default short address from an identity
///
/// Uses the two least significant bytes.
pub fn short_address_from(address: ExtendedAddress) -> ShortAddress {
    ShortAddress(address.0 as u16)
}

/// Whether the short address carries the anchor prefix
pub fn is_likely_anchor(short_address: ShortAddress) -> bool {
    short_address.0 & 0xff00 == ANCHOR_SHORT_PREFIX
}

/// Whether the short address carries the tag prefix
pub fn is_likely_tag(short_address: ShortAddress) -> bool {
    short_address.0 & 0xff00 == TAG_SHORT_PREFIX
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn centi_rounds_and_saturates() {
        assert_eq!(Centi::from_f32(6.666_7).raw(), 667);
        assert_eq!(Centi::from_f32(-1.005_1).raw(), -101);
        assert_eq!(Centi::from_f32(400.0).raw(), i16::MAX);
        assert_eq!(Centi::from_f32(-400.0).raw(), i16::MIN);
        assert_eq!(Centi::from_f32(f32::NAN), Centi::ZERO);
        assert_eq!(Centi::from_raw(1234).to_f32(), 12.34);
    }

    #[test]
    fn inactivity_is_strictly_after_timeout() {
        let device = Device::from_short_address(ShortAddress(0x1234), 1_000);

        assert!(!device.is_inactive(1_000 + INACTIVITY_TIME_MS));
        assert!(device.is_inactive(1_000 + INACTIVITY_TIME_MS + 1));
    }

    #[test]
    fn inactivity_survives_clock_wrap() {
        let device = Device::from_short_address(ShortAddress(0x1234), u32::MAX - 10);

        assert!(!device.is_inactive(100));
        assert!(device.is_inactive(INACTIVITY_TIME_MS));
    }

    #[test]
    fn note_activity_reactivates() {
        let mut device = Device::from_short_address(ShortAddress(0x1234), 0);
        device.set_inactive();
        assert!(!device.is_active());

        device.note_activity(5_000);
        assert!(device.is_active());
        assert_eq!(device.last_activity_ms(), 5_000);
    }

    #[test]
    fn set_tag_state_stamps_time() {
        let mut device = Device::from_short_address(ShortAddress(0x1234), 0);
        device.set_tag_state(TagState::Ranging, 42);

        assert_eq!(device.tag_state(), TagState::Ranging);
        assert_eq!(device.last_state_change_ms(), 42);
        assert!(!device.is_ranging_stuck(RANGING_TIMEOUT_MS));
        assert!(device.is_ranging_stuck(RANGING_TIMEOUT_MS + 1));
    }

    #[test]
    fn random_short_address_keeps_prefix() {
        let mut rng = StepRng::new(0xab, 1);
        let device = Device::with_random_short_address(
            ExtendedAddress(1),
            TAG_SHORT_PREFIX,
            &mut rng,
            0,
        );

        assert_eq!(device.short_address(), ShortAddress(0x98ab));
        assert!(is_likely_tag(device.short_address()));
        assert!(!is_likely_anchor(device.short_address()));
    }

    #[test]
    fn address_comparisons() {
        let a = Device::new(ExtendedAddress(1), ShortAddress(7), 0);
        let b = Device::new(ExtendedAddress(2), ShortAddress(7), 0);

        assert!(a.is_short_address_equal(&b));
        assert!(!a.is_address_equal(&b));
    }

    #[test]
    fn parses_identity_text() {
        let address = parse_extended_address("7D:00:22:EA:82:60:3B:9C").unwrap();

        assert_eq!(short_address_from(address), ShortAddress(0x007d));
        assert_eq!(
            parse_extended_address("7D:00:22"),
            Err(ParseAddressError::WrongLength),
        );
        assert_eq!(
            parse_extended_address("7D:00:22:EA:82:60:3B:9C:01"),
            Err(ParseAddressError::WrongLength),
        );
        assert_eq!(
            parse_extended_address("7D:00:2G:EA:82:60:3B:9C"),
            Err(ParseAddressError::InvalidByte(2)),
        );
    }

    #[test]
    fn centi_display() {
        extern crate std;
        use std::string::ToString;

        assert_eq!(Centi::from_raw(-5).to_string(), "-0.05");
        assert_eq!(Centi::from_raw(1234).to_string(), "12.34");
    }
}
