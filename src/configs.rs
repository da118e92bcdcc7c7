//! Configuration structs for the radio and the ranging protocol
//!
//! [`RadioMode`] describes the physical layer settings the radio is configured
//! with when the engine starts. [`RangingConfig`] holds the protocol timing and
//! filtering parameters, which can also be changed at runtime through the
//! engine's setters.

use serde::{Deserialize, Serialize};


/// Default delay between receiving a message and sending the reply, in µs
pub const DEFAULT_REPLY_DELAY_US: u16 = 10_000;

/// Default period after which a silent radio gets re-armed, in ms
pub const DEFAULT_RESET_PERIOD_MS: u32 = 1_000;

/// Default interval of the scheduling tick, in ms
pub const DEFAULT_TICK_INTERVAL_MS: u32 = 60;

/// Default window of the exponential range filter
pub const DEFAULT_FILTER_WINDOW: u16 = 15;

/// Default network (PAN) identifier
pub const DEFAULT_NETWORK_ID: u16 = 0xDECA;


/// Data rate of the payload
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitRate {
    /// 110 kbps, for the longest range
    Kbps110,
    /// 850 kbps
    Kbps850,
    /// 6.8 Mbps
    #[default]
    Kbps6800,
}

/// Pulse repetition frequency
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PulseRepetitionFrequency {
    /// 16 MHz
    #[default]
    Mhz16,
    /// 64 MHz, which improves the timestamp accuracy
    Mhz64,
}

/// Length of the preamble, in symbols
///
/// Long preambles help at long range and low bitrates, at the cost of air
/// time.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PreambleLength {
    /// 64 symbols, 6.8 Mbps only
    Bits64,
    /// 128 symbols
    #[default]
    Bits128,
    /// 256 symbols
    Bits256,
    /// 512 symbols
    Bits512,
    /// 1024 symbols
    Bits1024,
    /// 1536 symbols, 110 kbps only
    Bits1536,
    /// 2048 symbols, 110 kbps only
    Bits2048,
    /// 4096 symbols, 110 kbps only
    Bits4096,
}

/// The UWB channels the DW1000 supports
///
/// Channels 4 and 7 are the wide ones, with more than 1 GHz of bandwidth.
/// All others have 499.2 MHz.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UwbChannel {
    /// 3494.4 MHz
    Channel1,
    /// 3993.6 MHz
    Channel2,
    /// 4492.8 MHz
    Channel3,
    /// 3993.6 MHz, wide
    Channel4,
    /// 6489.6 MHz
    #[default]
    Channel5,
    /// 6489.6 MHz, wide
    Channel7,
}

impl UwbChannel {
    /// Whether the channel has a bandwidth of about 500 Mhz
    pub fn is_narrow(&self) -> bool {
        !matches!(self, UwbChannel::Channel4 | UwbChannel::Channel7)
    }
}


/// Physical layer settings shared by all nodes of a network
///
/// All nodes that want to range with each other must use the same mode. The
/// associated constants are the commonly used combinations, trading range
/// against air time and power.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RadioMode {
    /// The bitrate of all transmissions
    pub bitrate: BitRate,
    /// The pulse repetition frequency
    pub pulse_repetition_frequency: PulseRepetitionFrequency,
    /// The length of the preamble
    pub preamble_length: PreambleLength,
    /// The channel all nodes use
    pub channel: UwbChannel,
}

impl RadioMode {
    const fn new(
        bitrate: BitRate,
        pulse_repetition_frequency: PulseRepetitionFrequency,
        preamble_length: PreambleLength,
    ) -> Self {
        RadioMode {
            bitrate,
            pulse_repetition_frequency,
            preamble_length,
            channel: UwbChannel::Channel5,
        }
    }

    /// 110 kbps, 16 MHz PRF, 2048 bit preamble
    pub const LONGDATA_RANGE_LOWPOWER: RadioMode = RadioMode::new(
        BitRate::Kbps110,
        PulseRepetitionFrequency::Mhz16,
        PreambleLength::Bits2048,
    );

    /// 6.8 Mbps, 16 MHz PRF, 128 bit preamble
    pub const SHORTDATA_FAST_LOWPOWER: RadioMode = RadioMode::new(
        BitRate::Kbps6800,
        PulseRepetitionFrequency::Mhz16,
        PreambleLength::Bits128,
    );

    /// 6.8 Mbps, 16 MHz PRF, 1024 bit preamble
    pub const LONGDATA_FAST_LOWPOWER: RadioMode = RadioMode::new(
        BitRate::Kbps6800,
        PulseRepetitionFrequency::Mhz16,
        PreambleLength::Bits1024,
    );

    /// 6.8 Mbps, 64 MHz PRF, 128 bit preamble
    pub const SHORTDATA_FAST_ACCURACY: RadioMode = RadioMode::new(
        BitRate::Kbps6800,
        PulseRepetitionFrequency::Mhz64,
        PreambleLength::Bits128,
    );

    /// 6.8 Mbps, 64 MHz PRF, 1024 bit preamble
    pub const LONGDATA_FAST_ACCURACY: RadioMode = RadioMode::new(
        BitRate::Kbps6800,
        PulseRepetitionFrequency::Mhz64,
        PreambleLength::Bits1024,
    );

    /// 110 kbps, 64 MHz PRF, 2048 bit preamble
    pub const LONGDATA_RANGE_ACCURACY: RadioMode = RadioMode::new(
        BitRate::Kbps110,
        PulseRepetitionFrequency::Mhz64,
        PreambleLength::Bits2048,
    );

    /// Returns the same mode on a different channel
    pub const fn with_channel(self, channel: UwbChannel) -> Self {
        RadioMode { channel, ..self }
    }
}


/// Timing and filtering parameters of the ranging protocol
#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RangingConfig {
    /// Delay between receiving a message and sending the reply, in µs
    ///
    /// A tag announces this delay in its polls, and uses it when scheduling
    /// its range message.
    pub reply_delay_us: u16,

    /// Re-arm the radio if nothing was sent or received for this long, in ms
    pub reset_period_ms: u32,

    /// Base interval of the scheduling tick, in ms
    pub tick_interval_ms: u32,

    /// Smooth new ranges with an exponential moving average
    pub range_filter: bool,

    /// Window of the moving average. Values below 2 are raised to 2.
    pub range_filter_window: u16,

    /// The network (PAN) identifier
    pub network_id: u16,

    /// Subtract the signal level dependent range bias before storing a range
    pub range_bias_correction: bool,
}

impl Default for RangingConfig {
    fn default() -> Self {
        RangingConfig {
            reply_delay_us: DEFAULT_REPLY_DELAY_US,
            reset_period_ms: DEFAULT_RESET_PERIOD_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            range_filter: false,
            range_filter_window: DEFAULT_FILTER_WINDOW,
            network_id: DEFAULT_NETWORK_ID,
            range_bias_correction: false,
        }
    }
}

impl RangingConfig {
    /// The filter window, never less than 2
    pub fn filter_window(&self) -> u16 {
        self.range_filter_window.max(2)
    }
}
