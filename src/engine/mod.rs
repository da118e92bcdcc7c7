//! The ranging protocol engine
//!
//! The entry point to this API is [`RangingEngine::builder`]. The builder
//! collects the radio, a clock, a random number generator, the shared
//! [`EventFlags`], and optionally a [`Handler`] and a [`RangingConfig`].
//! Starting it as an anchor or a tag configures the radio and yields a
//! [`RangingEngine`].
//!
//! From then on, the user calls [`RangingEngine::run_once`] in a loop, more
//! often than the tick interval. Each call does the following, in order:
//!
//! 1. If neither a send nor a receive completion is pending and nothing
//!    happened for the reset period, the receiver is re-armed.
//! 2. If the tick interval has passed, the scheduler runs. A tag polls the
//!    next idle anchor (or blinks, if it knows too few), and both roles sweep
//!    the device table for inactive peers.
//! 3. A pending send completion is consumed, and the transmit timestamp is
//!    stored with the peer the frame went to.
//! 4. A pending receive completion is consumed, and the frame is handled
//!    according to the role.
//!
//! Nothing in here blocks. Problems with received frames are logged and the
//! frame is dropped. Only errors of the radio itself, and failures to encode
//! an outgoing frame, are returned to the caller.

use core::fmt;

use rand_core::RngCore;

use crate::{
    configs::{RadioMode, RangingConfig, DEFAULT_REPLY_DELAY_US},
    device::{short_address_from, Device, TagState, ANCHOR_SHORT_PREFIX, TAG_SHORT_PREFIX},
    error::{Error, StaleHandle},
    frame::{Frame, FrameBuffer, FrameCodec, MessageType, BROADCAST_SHORT, FRAME_LEN},
    mac::{ExtendedAddress, PanId, ShortAddress},
    radio::{Clock, EventFlags, Radio, SendTime},
    ranging::{
        BroadcastPoll,
        BroadcastRange,
        PollEntry,
        Range,
        RangeEntry,
    },
    table::{DeviceHandle, DeviceTable},
    time::{Duration, Instant},
    MAX_DEVICES,
};

pub use self::handler::Handler;

mod anchor;
mod handler;
mod tag;


/// The role of a node, fixed once the engine is started
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Fixed reference point, answers ranging requests
    Anchor,

    /// Mobile node, initiates ranging with the anchors it knows
    Tag,
}


/// Collects everything a [`RangingEngine`] needs
pub struct Builder<'e, RADIO, CLOCK, RNG, HANDLER> {
    radio: RADIO,
    clock: CLOCK,
    rng: RNG,
    events: &'e EventFlags,
    handler: HANDLER,
    config: RangingConfig,
}

impl<'e, RADIO, CLOCK, RNG, HANDLER> Builder<'e, RADIO, CLOCK, RNG, HANDLER>
    where
        RADIO: Radio,
        CLOCK: Clock,
        RNG: RngCore,
        HANDLER: Handler,
{
    /// Sets the handler that gets notified about ranges and devices
    pub fn handler<H>(self, handler: H) -> Builder<'e, RADIO, CLOCK, RNG, H>
        where H: Handler
    {
        Builder {
            radio: self.radio,
            clock: self.clock,
            rng: self.rng,
            events: self.events,
            handler,
            config: self.config,
        }
    }

    /// Replaces the default configuration
    pub fn config(mut self, config: RangingConfig) -> Self {
        self.config = config;
        self
    }

    /// Configures the radio and starts the engine as an anchor
    ///
    /// If `random_short_address` is set, the short address gets a random low
    /// byte and the anchor prefix as its high byte. Otherwise, it's derived
    /// from `address`.
    pub fn start_as_anchor(
        self,
        address: ExtendedAddress,
        mode: RadioMode,
        random_short_address: bool,
    )
        -> Result<RangingEngine<'e, RADIO, CLOCK, RNG, HANDLER>, Error<RADIO::Error>>
    {
        self.start(Role::Anchor, address, mode, random_short_address)
    }

    /// Configures the radio and starts the engine as a tag
    ///
    /// If `random_short_address` is set, the short address gets a random low
    /// byte and the tag prefix as its high byte. Otherwise, it's derived from
    /// `address`.
    pub fn start_as_tag(
        self,
        address: ExtendedAddress,
        mode: RadioMode,
        random_short_address: bool,
    )
        -> Result<RangingEngine<'e, RADIO, CLOCK, RNG, HANDLER>, Error<RADIO::Error>>
    {
        self.start(Role::Tag, address, mode, random_short_address)
    }

    fn start(
        mut self,
        role: Role,
        address: ExtendedAddress,
        mode: RadioMode,
        random_short_address: bool,
    )
        -> Result<RangingEngine<'e, RADIO, CLOCK, RNG, HANDLER>, Error<RADIO::Error>>
    {
        let now = self.clock.now_ms();

        let short_address = if random_short_address {
            let prefix = match role {
                Role::Anchor => ANCHOR_SHORT_PREFIX,
                Role::Tag => TAG_SHORT_PREFIX,
            };
            Device::with_random_short_address(address, prefix, &mut self.rng, now)
                .short_address()
        }
        else {
            short_address_from(address)
        };
        let pan_id = PanId(self.config.network_id);

        self.radio
            .configure(address, short_address, pan_id, &mode)
            .map_err(Error::Radio)?;
        self.radio.start_receive(true).map_err(Error::Radio)?;

        info!("started as {} with short address {=u16:#x}", role, short_address.0);

        Ok(RangingEngine {
            radio: self.radio,
            clock: self.clock,
            rng: self.rng,
            events: self.events,
            handler: self.handler,
            role,
            mode,
            tick_interval_ms: self.config.tick_interval_ms,
            config: self.config,
            codec: FrameCodec::new(address, short_address, pan_id),
            devices: DeviceTable::new(),
            buffer: [0; FRAME_LEN],
            last_sent: None,
            last_tick_ms: now,
            last_activity_ms: now,
            rotation: 0,
        })
    }
}


/// The ranging protocol state machine
///
/// Owns the radio and the device table. See the [module documentation] for
/// how to drive it.
///
/// [module documentation]: index.html
pub struct RangingEngine<'e, RADIO, CLOCK, RNG, HANDLER> {
    radio: RADIO,
    clock: CLOCK,
    rng: RNG,
    events: &'e EventFlags,
    handler: HANDLER,

    role: Role,
    mode: RadioMode,
    config: RangingConfig,
    codec: FrameCodec,
    devices: DeviceTable<MAX_DEVICES>,
    buffer: FrameBuffer,

    /// Type and recipient of the frame most recently handed to the radio
    last_sent: Option<(MessageType, ShortAddress)>,

    last_tick_ms: u32,
    tick_interval_ms: u32,
    last_activity_ms: u32,
    rotation: usize,
}

impl<'e, RADIO, CLOCK, RNG> RangingEngine<'e, RADIO, CLOCK, RNG, ()>
    where
        RADIO: Radio,
        CLOCK: Clock,
        RNG: RngCore,
{
    /// Starts building an engine
    pub fn builder(radio: RADIO, clock: CLOCK, rng: RNG, events: &'e EventFlags)
        -> Builder<'e, RADIO, CLOCK, RNG, ()>
    {
        Builder {
            radio,
            clock,
            rng,
            events,
            handler: (),
            config: RangingConfig::default(),
        }
    }
}

impl<'e, RADIO, CLOCK, RNG, HANDLER> RangingEngine<'e, RADIO, CLOCK, RNG, HANDLER>
    where
        RADIO: Radio,
        CLOCK: Clock,
        RNG: RngCore,
        HANDLER: Handler,
{
    /// Runs one iteration of the protocol
    ///
    /// Must be called more often than the tick interval.
    pub fn run_once(&mut self) -> Result<(), Error<RADIO::Error>> {
        let now = self.clock.now_ms();

        self.check_for_reset(now)?;

        if now.wrapping_sub(self.last_tick_ms) > self.tick_interval_ms {
            self.last_tick_ms = now;
            self.tick(now)?;
        }

        if self.events.take_sent() {
            self.handle_sent(now)?;
        }

        if self.events.take_received() {
            self.handle_received(now)?;
        }

        Ok(())
    }

    /// Sends a poll to every known anchor at once
    ///
    /// Each anchor gets its own reply slot, `(2i + 1)` times the default
    /// reply delay after the poll. The tick interval is widened accordingly,
    /// until the next unicast poll restores it.
    pub fn transmit_poll_broadcast(&mut self) -> Result<(), Error<RADIO::Error>> {
        let now = self.clock.now_ms();
        self.widen_tick_interval();

        let mut poll = BroadcastPoll::default();
        for (i, device) in self.devices.iter_mut().enumerate() {
            let slot = (2 * i as u32 + 1) * DEFAULT_REPLY_DELAY_US as u32;
            let reply_delay_us = match u16::try_from(slot) {
                Ok(reply_delay_us) => reply_delay_us,
                Err(_) => {
                    warn!("no reply slot left for device {=usize}", i);
                    break;
                }
            };

            let entry = PollEntry {
                short_address: device.short_address(),
                reply_delay_us,
            };
            if poll.entries.push(entry).is_err() {
                warn!("broadcast poll full at device {=usize}", i);
                break;
            }

            device.reply_delay_us = reply_delay_us;
            device.expected_message = MessageType::PollAck;
            device.set_tag_state(TagState::Ranging, now);
        }

        poll.encode(&mut self.codec, &mut self.buffer, BROADCAST_SHORT)?;
        self.transmit(MessageType::Poll, BROADCAST_SHORT, SendTime::Now, now)
    }

    /// Sends the range timestamps for every known anchor at once
    ///
    /// Only as many anchors as fit into a single frame are included.
    pub fn transmit_range_broadcast(&mut self) -> Result<(), Error<RADIO::Error>> {
        let now = self.clock.now_ms();
        self.widen_tick_interval();

        let (tx_time, range_sent) = self.schedule(DEFAULT_REPLY_DELAY_US as u32)?;

        let mut message = BroadcastRange::default();
        for device in self.devices.iter_mut() {
            device.timestamps.range_sent = range_sent;

            let entry = RangeEntry {
                short_address: device.short_address(),
                range: Range::new(&device.timestamps),
            };
            if message.entries.push(entry).is_err() {
                warn!("broadcast range full, skipping {=u16:#x}", device.short_address().0);
            }
        }

        message.encode(&mut self.codec, &mut self.buffer, BROADCAST_SHORT)?;
        self.transmit(MessageType::Range, BROADCAST_SHORT, SendTime::Delayed(tx_time), now)
    }

    /// Sets the delay between receiving a message and replying, in µs
    pub fn set_reply_delay(&mut self, reply_delay_us: u16) {
        self.config.reply_delay_us = reply_delay_us;
    }

    /// Sets the period after which a silent radio is re-armed, in ms
    pub fn set_reset_period(&mut self, reset_period_ms: u32) {
        self.config.reset_period_ms = reset_period_ms;
    }

    /// Enables or disables smoothing of new ranges
    pub fn enable_range_filter(&mut self, enable: bool) {
        self.config.range_filter = enable;
    }

    /// Sets the window of the range filter. Values below 2 are raised to 2.
    pub fn set_range_filter_window(&mut self, window: u16) {
        self.config.range_filter_window = window.max(2);
    }

    /// The current configuration
    pub fn config(&self) -> &RangingConfig {
        &self.config
    }

    /// The role the engine was started with
    pub fn role(&self) -> Role {
        self.role
    }

    /// This node's identity
    pub fn address(&self) -> ExtendedAddress {
        self.codec.address()
    }

    /// This node's short address
    pub fn short_address(&self) -> ShortAddress {
        self.codec.short_address()
    }

    /// The current tick interval, in ms
    pub fn tick_interval_ms(&self) -> u32 {
        self.tick_interval_ms
    }

    /// Returns the device at `index`
    pub fn device(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    /// Returns the device with the given short address
    pub fn device_by_short_address(&self, short_address: ShortAddress) -> Option<&Device> {
        self.devices.by_short_address(short_address)
    }

    /// Returns the device a handle refers to
    pub fn resolve(&self, handle: DeviceHandle) -> Result<&Device, StaleHandle> {
        self.devices.resolve(handle)
    }

    /// The table of known devices
    pub fn devices(&self) -> &DeviceTable<MAX_DEVICES> {
        &self.devices
    }

    /// The table of known devices
    ///
    /// Records can be removed through this. Handles held elsewhere stay valid
    /// or report [`StaleHandle`].
    pub fn devices_mut(&mut self) -> &mut DeviceTable<MAX_DEVICES> {
        &mut self.devices
    }

    /// The handler passed to the builder
    pub fn handler(&self) -> &HANDLER {
        &self.handler
    }

    /// The handler passed to the builder
    pub fn handler_mut(&mut self) -> &mut HANDLER {
        &mut self.handler
    }

    fn check_for_reset(&mut self, now: u32) -> Result<(), Error<RADIO::Error>> {
        if self.events.is_pending() {
            return Ok(());
        }

        if now.wrapping_sub(self.last_activity_ms) > self.config.reset_period_ms {
            debug!("no activity for {=u32} ms, resetting", now.wrapping_sub(self.last_activity_ms));
            if self.role == Role::Anchor {
                self.radio.start_receive(true).map_err(Error::Radio)?;
            }
            self.last_activity_ms = now;
        }

        Ok(())
    }

    fn tick(&mut self, now: u32) -> Result<(), Error<RADIO::Error>> {
        if self.role == Role::Tag {
            self.schedule_next(now)?;
        }

        let handler = &mut self.handler;
        self.devices.check_for_inactive_devices(now, |device| {
            handler.inactive_device(device)
        });

        Ok(())
    }

    fn handle_sent(&mut self, now: u32) -> Result<(), Error<RADIO::Error>> {
        self.last_activity_ms = now;

        if let Some((message_type, destination)) = self.last_sent {
            let tx_time = self.radio.tx_timestamp().map_err(Error::Radio)?;
            trace!("sent {} at {}", message_type, tx_time);

            let role = self.role;
            let stamp = |device: &mut Device| match message_type {
                MessageType::Poll => device.timestamps.poll_sent = tx_time,
                MessageType::Range => device.timestamps.range_sent = tx_time,
                MessageType::PollAck if role == Role::Anchor => {
                    device.timestamps.poll_ack_sent = tx_time
                }
                _ => (),
            };

            if destination == BROADCAST_SHORT {
                self.devices.iter_mut().for_each(stamp);
            }
            else if let Some(device) = self.devices.by_short_address_mut(destination) {
                stamp(device);
            }
        }

        self.radio.start_receive(true).map_err(Error::Radio)
    }

    fn handle_received(&mut self, now: u32) -> Result<(), Error<RADIO::Error>> {
        self.last_activity_ms = now;

        let mut bytes = [0; FRAME_LEN];
        let len = self.radio.read_frame(&mut bytes).map_err(Error::Radio)?;
        let rx_time = self.radio.rx_timestamp().map_err(Error::Radio)?;

        let frame = match Frame::decode(&bytes[..len.min(FRAME_LEN)]) {
            Ok(frame) => frame,
            Err(error) => {
                debug!("dropping malformed frame: {}", error);
                return Ok(());
            }
        };

        let addressing = frame.header.addressing;
        if !addressing.is_for(self.codec.address(), self.codec.short_address()) {
            trace!("dropping frame for someone else");
            return Ok(());
        }
        if addressing.source_short() == self.codec.short_address() {
            return Ok(());
        }

        trace!("received {}", frame.message_type);

        match (self.role, frame.message_type) {
            (Role::Anchor, MessageType::Blink) => self.handle_blink(&frame, now),
            (Role::Tag, MessageType::RangingInit) => self.handle_ranging_init(&frame, now),
            (_, MessageType::Blink) | (_, MessageType::RangingInit) => Ok(()),
            _ => self.handle_message(&frame, rx_time, now),
        }
    }

    /// Handles the messages of a running exchange
    fn handle_message(&mut self, frame: &Frame, rx_time: Instant, now: u32)
        -> Result<(), Error<RADIO::Error>>
    {
        let source = frame.header.addressing.source_short();

        if self.devices.by_short_address(source).is_none() {
            let first_contact = matches!(
                frame.message_type,
                MessageType::Poll | MessageType::PollAck | MessageType::Range
            );
            if !first_contact {
                debug!("dropping {} from unknown device {=u16:#x}", frame.message_type, source.0);
                return Ok(());
            }

            let device = Device::from_short_address(source, now);
            if let Err(error) = self.devices.add_device(device, true, now) {
                warn!("can't add device {=u16:#x}: {}", source.0, error);
                return Ok(());
            }
        }

        if let Some(device) = self.devices.by_short_address_mut(source) {
            device.note_activity(now);
        }

        match self.role {
            Role::Anchor => self.handle_anchor_message(frame, source, rx_time, now),
            Role::Tag => self.handle_tag_message(frame, source, rx_time, now),
        }
    }

    /// Computes when a delayed reply is sent, and its transmit timestamp
    ///
    /// Returns the time to pass to the radio, and the time the frame will
    /// actually leave the antenna.
    fn schedule(&mut self, delay_us: u32) -> Result<(Instant, Instant), Error<RADIO::Error>> {
        let sys_time = self.radio.sys_time().map_err(Error::Radio)?;
        let antenna_delay = self.radio.tx_antenna_delay().map_err(Error::Radio)?;

        let tx_time = (sys_time + Duration::from_micros(delay_us)).align_to_delayed_tx();
        Ok((tx_time, tx_time + antenna_delay))
    }

    /// Sends the frame in the buffer and remembers where it went
    fn transmit(
        &mut self,
        message_type: MessageType,
        destination: ShortAddress,
        send_time: SendTime,
        now: u32,
    )
        -> Result<(), Error<RADIO::Error>>
    {
        self.radio.send(&self.buffer, send_time).map_err(Error::Radio)?;
        self.last_sent = Some((message_type, destination));
        self.last_activity_ms = now;
        Ok(())
    }

    fn widen_tick_interval(&mut self) {
        let count = self.devices.len() as u32;
        self.tick_interval_ms = self.config.tick_interval_ms
            + count * 3 * DEFAULT_REPLY_DELAY_US as u32 / 1000;
    }
}

// Can't be derived without putting requirements on the type parameters.
impl<'e, RADIO, CLOCK, RNG, HANDLER> fmt::Debug for RangingEngine<'e, RADIO, CLOCK, RNG, HANDLER> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RangingEngine {{ role: {:?}, devices: {}, .. }}", self.role, self.devices.len())
    }
}
