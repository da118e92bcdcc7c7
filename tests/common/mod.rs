#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    vec::Vec,
};

use dw1000_ranging::{
    frame::{Frame, MessageType},
    mac::{ExtendedAddress, PanId, ShortAddress},
    Clock,
    Device,
    Duration,
    EventFlags,
    Handler,
    Instant,
    RadioMode,
    Radio,
    RangingConfig,
    RangingEngine,
    Role,
    RxQuality,
    SendTime,
};
use rand::rngs::mock::StepRng;


pub type Engine<'e> = RangingEngine<'e, MockRadio, MockClock, StepRng, Recorder>;


#[derive(Debug)]
pub struct MockError;


/// A frame the engine handed to the radio
#[derive(Clone, Debug)]
pub struct Sent {
    pub frame: Vec<u8>,
    pub send_time: SendTime,
    pub tx_time: Instant,
}

impl Sent {
    pub fn decode(&self) -> Frame {
        Frame::decode(&self.frame).unwrap()
    }

    pub fn message_type(&self) -> MessageType {
        self.decode().message_type
    }
}


#[derive(Debug, Default)]
pub struct MockState {
    pub configured: Option<(ExtendedAddress, ShortAddress, PanId)>,
    pub sys_time: u64,
    pub antenna_delay: u64,
    pub receive_armed: usize,
    pub inbox: VecDeque<(Vec<u8>, Instant, RxQuality)>,
    pub outbox: Vec<Sent>,
    current: Option<(Vec<u8>, Instant, RxQuality)>,
    last_tx: Instant,
}


/// Records everything the engine does with the radio
#[derive(Clone, Debug, Default)]
pub struct MockRadio(pub Rc<RefCell<MockState>>);

impl MockRadio {
    pub fn deliver(&self, frame: &[u8], rx_time: u64) {
        self.deliver_with_quality(frame, rx_time, RxQuality {
            rx_power: -80.0,
            first_path_power: -82.0,
            quality: 5.0,
        });
    }

    pub fn deliver_with_quality(&self, frame: &[u8], rx_time: u64, quality: RxQuality) {
        self.0.borrow_mut().inbox.push_back((
            frame.to_vec(),
            Instant::wrapping(rx_time),
            quality,
        ));
    }

    pub fn take_sent(&self) -> Vec<Sent> {
        self.0.borrow_mut().outbox.drain(..).collect()
    }

    pub fn set_sys_time(&self, value: u64) {
        self.0.borrow_mut().sys_time = value;
    }

    pub fn set_antenna_delay(&self, value: u64) {
        self.0.borrow_mut().antenna_delay = value;
    }

    pub fn receive_armed(&self) -> usize {
        self.0.borrow().receive_armed
    }
}

impl Radio for MockRadio {
    type Error = MockError;

    fn configure(
        &mut self,
        address: ExtendedAddress,
        short_address: ShortAddress,
        pan_id: PanId,
        _: &RadioMode,
    ) -> Result<(), Self::Error> {
        self.0.borrow_mut().configured = Some((address, short_address, pan_id));
        Ok(())
    }

    fn start_receive(&mut self, _: bool) -> Result<(), Self::Error> {
        self.0.borrow_mut().receive_armed += 1;
        Ok(())
    }

    fn sys_time(&mut self) -> Result<Instant, Self::Error> {
        Ok(Instant::wrapping(self.0.borrow().sys_time))
    }

    fn tx_antenna_delay(&mut self) -> Result<Duration, Self::Error> {
        Duration::new(self.0.borrow().antenna_delay).ok_or(MockError)
    }

    fn send(&mut self, frame: &[u8], send_time: SendTime) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();

        let scheduled = match send_time {
            SendTime::Now => Instant::wrapping(state.sys_time),
            SendTime::Delayed(time) => time,
        };
        let tx_time = Instant::wrapping(scheduled.value() + state.antenna_delay);

        state.last_tx = tx_time;
        state.outbox.push(Sent {
            frame: frame.to_vec(),
            send_time,
            tx_time,
        });
        Ok(())
    }

    fn tx_timestamp(&mut self) -> Result<Instant, Self::Error> {
        Ok(self.0.borrow().last_tx)
    }

    fn rx_timestamp(&mut self) -> Result<Instant, Self::Error> {
        self.0.borrow().current.as_ref().map(|(_, time, _)| *time).ok_or(MockError)
    }

    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        let mut state = self.0.borrow_mut();
        let current = state.inbox.pop_front().ok_or(MockError)?;

        let len = current.0.len().min(buffer.len());
        buffer[..len].copy_from_slice(&current.0[..len]);
        state.current = Some(current);

        Ok(len)
    }

    fn rx_quality(&mut self) -> Result<RxQuality, Self::Error> {
        self.0.borrow().current.as_ref().map(|(_, _, quality)| *quality).ok_or(MockError)
    }
}


#[derive(Clone, Debug, Default)]
pub struct MockClock(pub Rc<Cell<u32>>);

impl MockClock {
    pub fn advance(&self, ms: u32) {
        self.0.set(self.0.get().wrapping_add(ms));
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u32 {
        self.0.get()
    }
}


/// Remembers the short address of every device passed to a callback
#[derive(Debug, Default)]
pub struct Recorder {
    pub new_ranges: Vec<(u16, f32)>,
    pub blinks: Vec<u16>,
    pub new_devices: Vec<u16>,
    pub inactive: Vec<u16>,
}

impl Handler for Recorder {
    fn new_range(&mut self, device: &Device) {
        self.new_ranges.push((device.short_address().0, device.range.to_f32()));
    }

    fn blink_device(&mut self, device: &Device) {
        self.blinks.push(device.short_address().0);
    }

    fn new_device(&mut self, device: &Device) {
        self.new_devices.push(device.short_address().0);
    }

    fn inactive_device(&mut self, device: &Device) {
        self.inactive.push(device.short_address().0);
    }
}


/// An engine together with handles to its radio and clock
pub struct Node<'e> {
    pub engine: Engine<'e>,
    pub radio: MockRadio,
    pub clock: MockClock,
    pub events: &'e EventFlags,
}

impl<'e> Node<'e> {
    pub fn start(role: Role, address: u64, events: &'e EventFlags, config: RangingConfig)
        -> Self
    {
        let radio = MockRadio::default();
        let clock = MockClock::default();

        let builder = RangingEngine::builder(
                radio.clone(),
                clock.clone(),
                StepRng::new(7, 13),
                events,
            )
            .handler(Recorder::default())
            .config(config);

        let address = ExtendedAddress(address);
        let engine = match role {
            Role::Anchor => builder.start_as_anchor(address, RadioMode::default(), false),
            Role::Tag => builder.start_as_tag(address, RadioMode::default(), false),
        };

        Node {
            engine: engine.unwrap(),
            radio,
            clock,
            events,
        }
    }

    /// Hands a frame to the engine, as if the radio had just received it
    pub fn receive(&mut self, frame: &[u8], rx_time: u64) {
        self.radio.deliver(frame, rx_time);
        self.events.signal_received();
        self.engine.run_once().unwrap();
    }

    /// Reports completion of the last transmission to the engine
    pub fn complete_send(&mut self) {
        self.events.signal_sent();
        self.engine.run_once().unwrap();
    }

    /// Advances the clock past the tick interval and runs the engine
    pub fn tick(&mut self) {
        self.clock.advance(self.engine.tick_interval_ms() + 1);
        self.engine.run_once().unwrap();
    }

    /// Takes the single frame the engine sent since the last call
    pub fn sent_one(&self) -> Sent {
        let mut sent = self.radio.take_sent();
        assert_eq!(sent.len(), 1, "expected exactly one frame, got {:?}", sent);
        sent.remove(0)
    }

    pub fn short_address(&self) -> u16 {
        self.engine.short_address().0
    }
}
