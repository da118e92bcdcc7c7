use rand_core::RngCore;

use crate::{
    device::{Centi, Device},
    error::Error,
    frame::{Addressing, Frame, MessageType},
    mac::{ExtendedAddress, ShortAddress},
    radio::{Clock, Radio, SendTime},
    range_bias::get_range_bias_cm,
    ranging::{
        compute_time_of_flight,
        filter_value,
        is_plausible_distance,
        BroadcastPoll,
        BroadcastRange,
        Message as _,
        Poll,
        PollAck,
        Range,
        RangeFailed,
        RangeReport,
        RangingInit,
    },
    time::Instant,
};

use super::{Handler, RangingEngine};


/// Upper bound of the random delay added before answering a blink, in µs
const RANGING_INIT_JITTER_US: u32 = 600;


impl<'e, RADIO, CLOCK, RNG, HANDLER> RangingEngine<'e, RADIO, CLOCK, RNG, HANDLER>
    where
        RADIO: Radio,
        CLOCK: Clock,
        RNG: RngCore,
        HANDLER: Handler,
{
    /// Answers a blink with a ranging init, registering the tag if necessary
    pub(super) fn handle_blink(&mut self, frame: &Frame, now: u32)
        -> Result<(), Error<RADIO::Error>>
    {
        let (address, short_address) = match frame.header.addressing {
            Addressing::Blink { source, source_short } => (source, source_short),
            _ => return Ok(()),
        };

        match self.devices.by_short_address_mut(short_address) {
            Some(device) if device.is_active() => {
                device.note_activity(now);
                return Ok(());
            }
            Some(device) => {
                debug!("tag {=u16:#x} is back", short_address.0);
                device.note_activity(now);
            }
            None => {
                let device = Device::new(address, short_address, now);
                let handle = match self.devices.add_device(device, false, now) {
                    Ok(insertion) => insertion.handle(),
                    Err(error) => {
                        warn!("ignoring blink from {=u16:#x}: {}", short_address.0, error);
                        return Ok(());
                    }
                };

                if let Ok(device) = self.devices.resolve(handle) {
                    self.handler.blink_device(device);
                }
            }
        }

        self.transmit_ranging_init(address, short_address, now)
    }

    /// Handles the messages an anchor receives from a known tag
    pub(super) fn handle_anchor_message(
        &mut self,
        frame: &Frame,
        source: ShortAddress,
        rx_time: Instant,
        now: u32,
    )
        -> Result<(), Error<RADIO::Error>>
    {
        match frame.message_type {
            MessageType::Poll => self.handle_poll(frame, source, rx_time, now),
            MessageType::Range => self.handle_range(frame, source, rx_time, now),
            message_type => {
                trace!("anchor ignores {}", message_type);
                Ok(())
            }
        }
    }

    fn handle_poll(&mut self, frame: &Frame, source: ShortAddress, rx_time: Instant, now: u32)
        -> Result<(), Error<RADIO::Error>>
    {
        let reply_delay_us = if frame.header.addressing.is_broadcast() {
            let poll = match BroadcastPoll::decode(frame) {
                Ok(poll) => poll,
                Err(error) => {
                    debug!("dropping broadcast poll: {}", error);
                    return Ok(());
                }
            };
            match poll.entry_for(self.codec.short_address()) {
                Some(entry) => entry.reply_delay_us,
                None => return Ok(()),
            }
        }
        else {
            match Poll::decode(frame) {
                Ok(Some(_)) => self.config.reply_delay_us,
                _ => return Ok(()),
            }
        };

        // A poll always starts a new exchange, whatever was expected before.
        let device = match self.devices.by_short_address_mut(source) {
            Some(device) => device,
            None => return Ok(()),
        };
        device.timestamps.poll_received = rx_time;
        device.expected_message = MessageType::Range;
        device.reply_delay_us = reply_delay_us;

        let (tx_time, _) = self.schedule(reply_delay_us as u32)?;
        PollAck {}.encode_short(&mut self.codec, &mut self.buffer, source)?;
        self.transmit(MessageType::PollAck, source, SendTime::Delayed(tx_time), now)
    }

    fn handle_range(&mut self, frame: &Frame, source: ShortAddress, rx_time: Instant, now: u32)
        -> Result<(), Error<RADIO::Error>>
    {
        let range = if frame.header.addressing.is_broadcast() {
            BroadcastRange::decode(frame)
                .ok()
                .and_then(|message| {
                    message.entry_for(self.codec.short_address()).map(|entry| entry.range)
                })
        }
        else {
            Range::decode(frame).ok().flatten()
        };
        let range = match range {
            Some(range) => range,
            None => return Ok(()),
        };

        let device = match self.devices.by_short_address_mut(source) {
            Some(device) => device,
            None => return Ok(()),
        };
        if device.expected_message != MessageType::Range {
            debug!("unexpected range from {=u16:#x}", source.0);
            return Ok(());
        }
        device.expected_message = MessageType::Poll;

        device.timestamps.range_received = rx_time;
        device.timestamps.poll_sent = range.poll_sent;
        device.timestamps.poll_ack_received = range.poll_ack_received;
        device.timestamps.range_sent = range.range_sent;

        let time_of_flight = match compute_time_of_flight(&device.timestamps) {
            Ok(time_of_flight) => time_of_flight,
            Err(error) => {
                warn!("can't compute range to {=u16:#x}: {}", source.0, error);
                return self.transmit_range_failed(source, now);
            }
        };
        let previous = device.range;

        let quality = self.radio.rx_quality().map_err(Error::Radio)?;

        let mut meters = time_of_flight.to_meters();
        if self.config.range_bias_correction {
            meters -= get_range_bias_cm(quality.rx_power, &self.mode) / 100.0;
        }

        if !is_plausible_distance(meters) {
            debug!("implausible range to {=u16:#x}", source.0);
            return self.transmit_range_failed(source, now);
        }

        if self.config.range_filter && previous > Centi::ZERO {
            meters = filter_value(meters, previous.to_f32(), self.config.filter_window());
        }
        debug!("range to {=u16:#x}: {=f32} m", source.0, meters);

        if let Some(device) = self.devices.by_short_address_mut(source) {
            device.range = Centi::from_f32(meters);
            device.rx_power = Centi::from_f32(quality.rx_power);
            device.first_path_power = Centi::from_f32(quality.first_path_power);
            device.quality = Centi::from_f32(quality.quality);
        }

        let report = RangeReport {
            range: meters,
            rx_power: quality.rx_power,
        };
        let (tx_time, _) = self.schedule(self.config.reply_delay_us as u32)?;
        report.encode_short(&mut self.codec, &mut self.buffer, source)?;
        self.transmit(MessageType::RangeReport, source, SendTime::Delayed(tx_time), now)?;

        if let Some(device) = self.devices.by_short_address(source) {
            self.handler.new_range(device);
        }

        Ok(())
    }

    fn transmit_range_failed(&mut self, destination: ShortAddress, now: u32)
        -> Result<(), Error<RADIO::Error>>
    {
        RangeFailed {}.encode_short(&mut self.codec, &mut self.buffer, destination)?;
        self.transmit(MessageType::RangeFailed, destination, SendTime::Now, now)
    }

    /// Introduces this anchor to a tag
    ///
    /// Sent as a delayed transmission, one reply delay after the blink plus a
    /// random jitter of up to 600 µs. The reply delay keeps the engine from
    /// blocking while it waits, and the jitter keeps blinks answered by
    /// several anchors at the same time from colliding.
    fn transmit_ranging_init(
        &mut self,
        address: ExtendedAddress,
        short_address: ShortAddress,
        now: u32,
    )
        -> Result<(), Error<RADIO::Error>>
    {
        let jitter_us = self.rng.next_u32() % RANGING_INIT_JITTER_US;
        let delay_us = self.config.reply_delay_us as u32 + jitter_us;

        let (tx_time, _) = self.schedule(delay_us)?;
        RangingInit {}.encode_long(&mut self.codec, &mut self.buffer, address)?;
        self.transmit(MessageType::RangingInit, short_address, SendTime::Delayed(tx_time), now)
    }
}
