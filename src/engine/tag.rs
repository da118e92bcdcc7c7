use rand_core::RngCore;

use crate::{
    device::{Centi, Device, TagState},
    error::Error,
    frame::{Frame, MessageType, BROADCAST_SHORT},
    mac::ShortAddress,
    radio::{Clock, Radio, SendTime},
    ranging::{Message as _, Poll, Range, RangeReport},
    time::Instant,
};

use super::{Handler, RangingEngine};


impl<'e, RADIO, CLOCK, RNG, HANDLER> RangingEngine<'e, RADIO, CLOCK, RNG, HANDLER>
    where
        RADIO: Radio,
        CLOCK: Clock,
        RNG: RngCore,
        HANDLER: Handler,
{
    /// Registers the anchor that sent a ranging init
    pub(super) fn handle_ranging_init(&mut self, frame: &Frame, now: u32)
        -> Result<(), Error<RADIO::Error>>
    {
        let source = frame.header.addressing.source_short();
        self.last_activity_ms = now;

        if let Some(device) = self.devices.by_short_address_mut(source) {
            device.set_tag_state(TagState::Idle, now);
            device.note_activity(now);
            return Ok(());
        }

        let device = Device::from_short_address(source, now);
        let handle = match self.devices.add_device(device, true, now) {
            Ok(insertion) => insertion.handle(),
            Err(error) => {
                warn!("can't add anchor {=u16:#x}: {}", source.0, error);
                return Ok(());
            }
        };

        if let Ok(device) = self.devices.resolve_mut(handle) {
            device.set_tag_state(TagState::Idle, now);
            info!("new anchor {=u16:#x}", source.0);
            self.handler.new_device(device);
        }

        Ok(())
    }

    /// Handles the messages a tag receives from a known anchor
    pub(super) fn handle_tag_message(
        &mut self,
        frame: &Frame,
        source: ShortAddress,
        rx_time: Instant,
        now: u32,
    )
        -> Result<(), Error<RADIO::Error>>
    {
        let device = match self.devices.by_short_address_mut(source) {
            Some(device) => device,
            None => return Ok(()),
        };

        match frame.message_type {
            MessageType::PollAck if device.expected_message == MessageType::PollAck => {
                device.timestamps.poll_ack_received = rx_time;
                device.expected_message = MessageType::RangeReport;
                self.transmit_range(source, now)
            }
            MessageType::RangeReport if device.expected_message == MessageType::RangeReport => {
                let report = match RangeReport::decode(frame) {
                    Ok(Some(report)) => report,
                    _ => return Ok(()),
                };

                device.range = Centi::from_f32(report.range);
                device.rx_power = Centi::from_f32(report.rx_power);
                device.set_tag_state(TagState::Idle, now);

                self.handler.new_range(device);
                Ok(())
            }
            MessageType::RangeFailed if device.expected_message == MessageType::RangeReport => {
                debug!("ranging with {=u16:#x} failed", source.0);
                device.expected_message = MessageType::PollAck;
                device.set_tag_state(TagState::Idle, now);
                Ok(())
            }
            message_type => {
                trace!("tag ignores {} from {=u16:#x}", message_type, source.0);
                Ok(())
            }
        }
    }

    /// Polls the next idle anchor, or blinks if too few anchors are known
    pub(super) fn schedule_next(&mut self, now: u32) -> Result<(), Error<RADIO::Error>> {
        let count = self.devices.len();
        if count <= 1 {
            return self.transmit_blink(now);
        }

        for _ in 0..count {
            self.rotation = (self.rotation + 1) % count;

            let device = match self.devices.get_mut(self.rotation) {
                Some(device) => device,
                None => continue,
            };
            if device.tag_state() != TagState::Idle {
                continue;
            }

            device.set_tag_state(TagState::Ranging, now);
            device.expected_message = MessageType::PollAck;
            let short_address = device.short_address();

            return self.transmit_poll(short_address, now);
        }

        trace!("no idle anchor");
        Ok(())
    }

    fn transmit_poll(&mut self, destination: ShortAddress, now: u32)
        -> Result<(), Error<RADIO::Error>>
    {
        let reply_delay_us = self.config.reply_delay_us;
        self.tick_interval_ms = self.config.tick_interval_ms;

        if let Some(device) = self.devices.by_short_address_mut(destination) {
            device.reply_delay_us = reply_delay_us;
        }

        Poll::new(reply_delay_us).encode_short(&mut self.codec, &mut self.buffer, destination)?;
        self.transmit(MessageType::Poll, destination, SendTime::Now, now)
    }

    fn transmit_range(&mut self, destination: ShortAddress, now: u32)
        -> Result<(), Error<RADIO::Error>>
    {
        let (tx_time, range_sent) = self.schedule(self.config.reply_delay_us as u32)?;

        let range = match self.devices.by_short_address_mut(destination) {
            Some(device) => {
                device.timestamps.range_sent = range_sent;
                Range::new(&device.timestamps)
            }
            None => return Ok(()),
        };

        range.encode_short(&mut self.codec, &mut self.buffer, destination)?;
        self.transmit(MessageType::Range, destination, SendTime::Delayed(tx_time), now)
    }

    fn transmit_blink(&mut self, now: u32) -> Result<(), Error<RADIO::Error>> {
        self.codec.encode_blink(&mut self.buffer)?;
        self.transmit(MessageType::Blink, BROADCAST_SHORT, SendTime::Now, now)
    }
}
