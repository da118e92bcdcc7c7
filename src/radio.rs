//! The interface between the ranging engine and the radio hardware
//!
//! The engine doesn't talk to the DW1000 directly. Instead, it uses the
//! following pieces, which the user provides:
//!
//! 1. A [`Radio`], which wraps the actual driver. It configures the
//!    transceiver, sends and receives raw frames, and reports the hardware
//!    timestamps of the last transmission and reception.
//! 2. A shared [`EventFlags`] instance. The radio's interrupt handler (or
//!    driver callback) signals completed transmissions and receptions through
//!    it. The engine consumes those signals from its loop.
//! 3. A [`Clock`], providing a monotonic millisecond counter for all protocol
//!    timeouts.

use core::fmt::Debug;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    configs::RadioMode,
    mac::{ExtendedAddress, PanId, ShortAddress},
    time::{Duration, Instant},
};


/// Specifies when to send a frame
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendTime {
    /// Send the frame right away
    Now,

    /// Send the frame at the given system time
    ///
    /// The time is already aligned to the resolution of the transmitter, see
    /// [`Instant::align_to_delayed_tx`].
    Delayed(Instant),
}


/// Signal quality figures of the last received frame
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxQuality {
    /// Estimated receive signal power, in dBm
    pub rx_power: f32,

    /// Estimated power of the first path, in dBm
    pub first_path_power: f32,

    /// Receive quality indicator
    pub quality: f32,
}


/// A DW1000 driver, as seen by the ranging engine
///
/// Implementations are expected to report completion of transmissions and
/// receptions through [`EventFlags`]. None of the methods may block for an
/// extended amount of time.
pub trait Radio {
    /// The error type of the driver
    type Error: Debug;

    /// Configures identity, addresses, network and physical layer settings
    fn configure(
        &mut self,
        address: ExtendedAddress,
        short_address: ShortAddress,
        pan_id: PanId,
        mode: &RadioMode,
    ) -> Result<(), Self::Error>;

    /// Arms the receiver
    ///
    /// If `continuous` is set, the receiver re-arms itself after every
    /// received frame.
    fn start_receive(&mut self, continuous: bool) -> Result<(), Self::Error>;

    /// Returns the current system time
    fn sys_time(&mut self) -> Result<Instant, Self::Error>;

    /// Returns the configured transmit antenna delay
    ///
    /// The hardware adds this delay to the scheduled transmission time when it
    /// captures the transmit timestamp.
    fn tx_antenna_delay(&mut self) -> Result<Duration, Self::Error>;

    /// Transmits a complete frame
    fn send(&mut self, frame: &[u8], send_time: SendTime) -> Result<(), Self::Error>;

    /// Returns the timestamp of the last completed transmission
    fn tx_timestamp(&mut self) -> Result<Instant, Self::Error>;

    /// Returns the timestamp of the last received frame
    fn rx_timestamp(&mut self) -> Result<Instant, Self::Error>;

    /// Copies the last received frame into `buffer`
    ///
    /// Returns the number of bytes written. Frames longer than the buffer are
    /// truncated.
    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error>;

    /// Returns signal quality figures of the last received frame
    fn rx_quality(&mut self) -> Result<RxQuality, Self::Error>;
}


/// Completion signals, raised from interrupt context and consumed by the loop
///
/// Each signal is a single flag, not a queue. If the same event happens twice
/// before the engine gets to it, the engine sees it once. The protocol
/// tolerates this: a lost intermediate completion is recovered by the
/// inactivity and stuck-ranging timeouts.
///
/// Can be placed in a `static`, so an interrupt handler can reach it:
///
/// ``` rust
/// use dw1000_ranging::radio::EventFlags;
///
/// static EVENTS: EventFlags = EventFlags::new();
///
/// // in the interrupt handler
/// EVENTS.signal_received();
///
/// // in the main loop
/// assert!(EVENTS.take_received());
/// assert!(!EVENTS.take_received());
/// ```
#[derive(Debug, Default)]
pub struct EventFlags {
    sent: AtomicBool,
    received: AtomicBool,
}

impl EventFlags {
    /// Creates a new instance with no pending events
    pub const fn new() -> Self {
        EventFlags {
            sent: AtomicBool::new(false),
            received: AtomicBool::new(false),
        }
    }

    /// Signals that a transmission has completed
    pub fn signal_sent(&self) {
        self.sent.store(true, Ordering::Release);
    }

    /// Signals that a frame has been received
    pub fn signal_received(&self) {
        self.received.store(true, Ordering::Release);
    }

    /// Clears the sent signal, returning whether it was set
    pub fn take_sent(&self) -> bool {
        self.sent.swap(false, Ordering::AcqRel)
    }

    /// Clears the received signal, returning whether it was set
    pub fn take_received(&self) -> bool {
        self.received.swap(false, Ordering::AcqRel)
    }

    /// Whether a sent or received signal is waiting to be consumed
    pub fn is_pending(&self) -> bool {
        self.sent.load(Ordering::Acquire) || self.received.load(Ordering::Acquire)
    }
}


/// A monotonic millisecond clock
///
/// The counter may wrap around. All comparisons use wrapping arithmetic, so
/// only the difference between two readings matters.
pub trait Clock {
    /// Returns the current time in milliseconds
    fn now_ms(&self) -> u32;
}
