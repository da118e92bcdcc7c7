//! Time-related types based on the DW1000's system time
//!
//! The radio counts time in units of 1 / (128 * 499.2 MHz), roughly 15.65 ps,
//! in a 40-bit register that rolls over about every 17.2 seconds. All ranging
//! timestamps live in that domain.


use core::fmt;
use core::ops::Add;

use serde::{
    de::{Deserialize, Deserializer},
    ser::{Serialize, Serializer},
};


/// The maximum value of 40-bit system time stamps.
pub const TIME_MAX: u64 = 0xffffffffff;

/// Number of bytes a timestamp occupies inside a frame payload
pub const TIMESTAMP_LEN: usize = 5;

/// System time ticks per microsecond (128 * 499.2)
const TICKS_PER_MICRO_X10: u64 = 638_976;

/// Distance light travels during one system time tick, in meters
///
/// 299_792_458 m/s divided by 63.8976 GHz.
pub const METERS_PER_TICK: f32 = 0.004_691_764;

/// The DW1000 ignores the low 9 bits of a delayed transmission time
const DELAYED_TX_MASK: u64 = !0x1ff;


/// A point in DW1000 system time
///
/// You can get the current DW1000 system time through [`Radio::sys_time`].
///
/// Internally uses the same 40-bit timestamps that the DW1000 uses. On the
/// wire, an instant is five little-endian bytes.
///
/// [`Radio::sys_time`]: ../radio/trait.Radio.html#tymethod.sys_time
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Instant(u64);

impl Instant {
    /// The zero instant, used for timestamps that haven't been captured yet
    pub const ZERO: Instant = Instant(0);

    /// Creates an instant from a raw timestamp
    ///
    /// Returns `None`, if `value` doesn't fit into 40 bits.
    ///
    /// ``` rust
    /// use dw1000_ranging::time::{Instant, TIME_MAX};
    ///
    /// assert!(Instant::new(TIME_MAX).is_some());
    /// assert!(Instant::new(TIME_MAX + 1).is_none());
    /// ```
    pub fn new(value: u64) -> Option<Self> {
        if value > TIME_MAX {
            return None;
        }
        Some(Instant(value))
    }

    /// Creates an instance from any 64-bit value, dropping the upper bits
    pub fn wrapping(value: u64) -> Self {
        Instant(value & TIME_MAX)
    }

    /// The raw timestamp, never more than [`TIME_MAX`]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, across at most one rollover of the timer
    ///
    /// The timer wraps about every 17 seconds, so the numerical order of two
    /// timestamps says nothing about which one came first. The caller has to
    /// know that `earlier` really is earlier.
    ///
    /// ``` rust
    /// use dw1000_ranging::time::{Instant, TIME_MAX};
    ///
    /// let before_rollover = Instant::wrapping(TIME_MAX - 20);
    /// let after_rollover = Instant::wrapping(29);
    ///
    /// assert_eq!(after_rollover.duration_since(before_rollover).value(), 50);
    /// ```
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.wrapping_sub(earlier.0) & TIME_MAX)
    }

    /// Rounds down to a time the transmitter can actually be scheduled at
    ///
    /// Delayed transmissions ignore the low 9 bits of the requested time, so
    /// any timestamp announced for such a transmission must be aligned first.
    pub fn align_to_delayed_tx(self) -> Self {
        Instant(self.0 & DELAYED_TX_MASK)
    }

    /// Decodes the five little-endian bytes used inside frames
    pub fn from_bytes(bytes: [u8; TIMESTAMP_LEN]) -> Self {
        let mut value = 0u64;
        for (i, byte) in bytes.iter().enumerate() {
            value |= (*byte as u64) << (8 * i);
        }
        Instant(value)
    }

    /// Encodes into the five little-endian bytes used inside frames
    pub fn to_bytes(self) -> [u8; TIMESTAMP_LEN] {
        let mut bytes = [0; TIMESTAMP_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (self.0 >> (8 * i)) as u8;
        }
        bytes
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        // Two 40-bit values, the sum fits.
        Instant::wrapping(self.value() + rhs.value())
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#012x}", self.0)
    }
}

// Timestamps travel as 5 raw bytes, not as the 8 bytes of the inner `u64`.
impl Serialize for Instant {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where S: Serializer
    {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Instant {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where D: Deserializer<'de>
    {
        <[u8; TIMESTAMP_LEN]>::deserialize(deserializer).map(Instant::from_bytes)
    }
}


/// The time between two instants, in system time ticks
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Duration(u64);

impl Duration {
    /// Creates a duration from a number of ticks
    ///
    /// Returns `None`, if `value` doesn't fit into 40 bits.
    pub fn new(value: u64) -> Option<Self> {
        if value > TIME_MAX {
            return None;
        }
        Some(Duration(value))
    }

    /// Creates an instance of `Duration` from a number of microseconds
    ///
    /// # Example
    ///
    /// ``` rust
    /// use dw1000_ranging::time::Duration;
    ///
    /// assert_eq!(Duration::from_micros(10).value(), 638_976);
    /// ```
    ///
    /// Durations longer than the timer period wrap around.
    pub fn from_micros(micros: u32) -> Self {
        // Can't overflow: 2^32 * 638_976 < 2^52.
        Duration((micros as u64 * TICKS_PER_MICRO_X10 / 10) & TIME_MAX)
    }

    /// The number of ticks, never more than [`TIME_MAX`]
    pub fn value(&self) -> u64 {
        self.0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_little_endian() {
        let instant = Instant::new(0x01_2345_6789).unwrap();

        assert_eq!(instant.to_bytes(), [0x89, 0x67, 0x45, 0x23, 0x01]);
        assert_eq!(Instant::from_bytes(instant.to_bytes()), instant);
    }

    #[test]
    fn addition_wraps_at_forty_bits() {
        let instant = Instant::new(TIME_MAX - 9).unwrap();
        let later = instant + Duration::new(20).unwrap();

        assert_eq!(later.value(), 10);
        assert_eq!(later.duration_since(instant).value(), 20);
    }

    #[test]
    fn delayed_tx_alignment_clears_low_bits() {
        let instant = Instant::new(0x1234_5fff).unwrap();
        assert_eq!(instant.align_to_delayed_tx().value(), 0x1234_5e00);
    }

    #[test]
    fn serializes_as_five_bytes() {
        let instant = Instant::new(0xab_cdef_0123).unwrap();
        let mut buf = [0; 8];

        let len = ssmarshal::serialize(&mut buf, &instant).unwrap();
        assert_eq!(len, TIMESTAMP_LEN);

        let (decoded, _) = ssmarshal::deserialize::<Instant>(&buf[..len]).unwrap();
        assert_eq!(decoded, instant);
    }
}
