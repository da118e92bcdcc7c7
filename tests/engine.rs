mod common;

use dw1000_ranging::{
    configs::DEFAULT_REPLY_DELAY_US,
    device::INACTIVITY_TIME_MS,
    frame::{Addressing, FrameCodec, MessageType, BROADCAST_SHORT, FRAME_LEN},
    mac::{ExtendedAddress, PanId, ShortAddress},
    ranging::{
        BroadcastPoll,
        BroadcastRange,
        Message as _,
        Poll,
        PollEntry,
        PollAck,
        Range,
        RangeEntry,
        RangeFailed,
        RangeReport,
        RangingInit,
    },
    Duration,
    EventFlags,
    Instant,
    RangingConfig,
    Role,
    SendTime,
    TagState,
};
use pretty_assertions::assert_eq;

use common::{Node, Sent};


const ANCHOR: u64 = 0x0102_0304_0506_1201;
const TAG: u64 = 0x0a0b_0c0d_0e0f_9801;

const ANCHOR_SHORT: u16 = 0x1201;
const TAG_SHORT: u16 = 0x9801;

/// Flight time of roughly 10 meters, in ticks
const TEN_METERS: i64 = 2131;


fn at(value: i64) -> Instant {
    Instant::wrapping(value as u64)
}

fn destination(sent: &Sent) -> u16 {
    match sent.decode().header.addressing {
        Addressing::Short { destination, .. } => destination.0,
        addressing => panic!("unexpected addressing: {:?}", addressing),
    }
}

fn codec(address: u64) -> FrameCodec {
    FrameCodec::new(ExtendedAddress(address), ShortAddress(address as u16), PanId(0xDECA))
}

/// Introduces a made-up anchor to a tag
fn introduce_anchor(tag: &mut Node, short_address: u16) {
    let mut anchor = codec(0x1111_0000_0000_0000 | short_address as u64);
    let mut buffer = [0; FRAME_LEN];
    RangingInit {}
        .encode_long(&mut anchor, &mut buffer, ExtendedAddress(TAG))
        .unwrap();

    tag.receive(&buffer, 1_000);
}

/// Runs a complete exchange between a made-up tag and an anchor engine
///
/// Both sides share the same time base, and the frames take `flight` ticks to
/// arrive. Returns the anchor's answer to the range message.
fn exchange(anchor: &mut Node, tag: &mut FrameCodec, flight: i64) -> Sent {
    let mut buffer = [0; FRAME_LEN];
    let poll_sent = 50_000_000;

    Poll::new(DEFAULT_REPLY_DELAY_US)
        .encode_short(tag, &mut buffer, ShortAddress(ANCHOR_SHORT))
        .unwrap();
    anchor.radio.set_sys_time((poll_sent + flight + 1_000) as u64);
    anchor.receive(&buffer, (poll_sent + flight) as u64);

    let ack = anchor.sent_one();
    assert_eq!(ack.message_type(), MessageType::PollAck);
    anchor.complete_send();

    let poll_ack_received = ack.tx_time.value() as i64 + flight;
    let range_sent = poll_ack_received + 700_000;
    let range = Range {
        poll_sent: at(poll_sent),
        poll_ack_received: at(poll_ack_received),
        range_sent: at(range_sent),
    };
    range.encode_short(tag, &mut buffer, ShortAddress(ANCHOR_SHORT)).unwrap();
    anchor.receive(&buffer, (range_sent + flight) as u64);

    let answer = anchor.sent_one();
    anchor.complete_send();
    answer
}


#[test]
fn tag_and_anchor_measure_distance() {
    let anchor_events = EventFlags::new();
    let tag_events = EventFlags::new();
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &anchor_events, RangingConfig::default());
    let mut tag = Node::start(Role::Tag, TAG, &tag_events, RangingConfig::default());
    anchor.radio.set_antenna_delay(100);
    tag.radio.set_antenna_delay(100);

    assert_eq!(anchor.short_address(), ANCHOR_SHORT);
    assert_eq!(tag.short_address(), TAG_SHORT);

    // Knowing no anchor, the tag blinks.
    tag.tick();
    let blink = tag.sent_one();
    assert_eq!(blink.message_type(), MessageType::Blink);
    tag.complete_send();

    // A second anchor, which stays silent, is known first.
    introduce_anchor(&mut tag, 0x1202);

    anchor.receive(&blink.frame, 1_000);
    assert_eq!(anchor.engine.handler().blinks, [TAG_SHORT]);

    let init = anchor.sent_one();
    assert_eq!(init.message_type(), MessageType::RangingInit);
    assert!(matches!(init.send_time, SendTime::Delayed(_)));
    anchor.complete_send();

    tag.receive(&init.frame, 2_000);
    assert_eq!(tag.engine.handler().new_devices, [0x1202, ANCHOR_SHORT]);

    // Poll
    tag.radio.set_sys_time(10_000_000);
    tag.tick();
    let poll = tag.sent_one();
    assert_eq!(poll.message_type(), MessageType::Poll);
    assert_eq!(destination(&poll), ANCHOR_SHORT);
    tag.complete_send();

    // Poll acknowledgement
    let poll_received = poll.tx_time.value() as i64 + TEN_METERS;
    anchor.radio.set_sys_time(poll_received as u64 + 5_000);
    anchor.receive(&poll.frame, poll_received as u64);
    let ack = anchor.sent_one();
    assert_eq!(ack.message_type(), MessageType::PollAck);
    assert_eq!(destination(&ack), TAG_SHORT);
    anchor.complete_send();

    // Range
    let ack_received = ack.tx_time.value() as i64 + TEN_METERS;
    tag.radio.set_sys_time(ack_received as u64 + 5_000);
    tag.receive(&ack.frame, ack_received as u64);
    let range = tag.sent_one();
    assert_eq!(range.message_type(), MessageType::Range);
    tag.complete_send();

    let message = Range::decode(&range.decode()).unwrap().unwrap();
    assert_eq!(message.poll_sent, poll.tx_time);
    assert_eq!(message.poll_ack_received, at(ack_received));
    assert_eq!(message.range_sent, range.tx_time);

    // Range report
    let range_received = range.tx_time.value() as i64 + TEN_METERS;
    anchor.radio.set_sys_time(range_received as u64 + 5_000);
    anchor.receive(&range.frame, range_received as u64);
    let report = anchor.sent_one();
    assert_eq!(report.message_type(), MessageType::RangeReport);
    anchor.complete_send();

    let new_ranges = &anchor.engine.handler().new_ranges;
    assert_eq!(new_ranges.len(), 1);
    assert_eq!(new_ranges[0].0, TAG_SHORT);
    assert!((new_ranges[0].1 - 10.0).abs() < 0.02);

    tag.receive(&report.frame, range_received as u64 + 700_000);

    let new_ranges = &tag.engine.handler().new_ranges;
    assert_eq!(new_ranges.len(), 1);
    assert_eq!(new_ranges[0].0, ANCHOR_SHORT);
    assert!((new_ranges[0].1 - 10.0).abs() < 0.02);

    let device = tag.engine.device_by_short_address(ShortAddress(ANCHOR_SHORT)).unwrap();
    assert_eq!(device.tag_state(), TagState::Idle);
}

#[test]
fn implausible_distances_are_rejected() {
    let events = EventFlags::new();
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &events, RangingConfig::default());
    let mut tag = codec(TAG);

    let answer = exchange(&mut anchor, &mut tag, TEN_METERS);
    assert_eq!(answer.message_type(), MessageType::RangeReport);

    let report = RangeReport::decode(&answer.decode()).unwrap().unwrap();
    assert!((report.range - 10.0).abs() < 0.01);
    assert_eq!(report.rx_power, -80.0);

    // About -5 m and 400 m
    for flight in [-1_066, 85_256] {
        let answer = exchange(&mut anchor, &mut tag, flight);
        assert_eq!(answer.message_type(), MessageType::RangeFailed);
        assert_eq!(answer.send_time, SendTime::Now);
    }

    let device = anchor.engine.device_by_short_address(ShortAddress(TAG_SHORT)).unwrap();
    assert_eq!(device.range.raw(), 1000);
    assert_eq!(anchor.engine.handler().new_ranges.len(), 1);
}

#[test]
fn range_filter_smooths_measurements() {
    let events = EventFlags::new();
    let config = RangingConfig {
        range_filter: true,
        range_filter_window: 2,
        ..RangingConfig::default()
    };
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &events, config);
    let mut tag = codec(TAG);

    exchange(&mut anchor, &mut tag, TEN_METERS);
    exchange(&mut anchor, &mut tag, 2 * TEN_METERS);

    // 2/3 of the new value, 1/3 of the previous one
    let ranges = &anchor.engine.handler().new_ranges;
    assert_eq!(ranges.len(), 2);
    assert!((ranges[0].1 - 10.0).abs() < 0.02);
    assert!((ranges[1].1 - 16.66).abs() < 0.05);
}

#[test]
fn range_bias_depends_on_signal_level() {
    let events = EventFlags::new();
    let config = RangingConfig {
        range_bias_correction: true,
        ..RangingConfig::default()
    };
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &events, config);
    let mut tag = codec(TAG);

    // At -80 dBm, the raw range is 1.55 cm short.
    exchange(&mut anchor, &mut tag, TEN_METERS);

    let device = anchor.engine.device_by_short_address(ShortAddress(TAG_SHORT)).unwrap();
    assert_eq!(device.range.raw(), 1001);
    assert_eq!(device.rx_power.raw(), -8000);
    assert_eq!(device.first_path_power.raw(), -8200);
}

#[test]
fn anchor_answers_broadcast_messages_in_its_slot() {
    let events = EventFlags::new();
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &events, RangingConfig::default());
    let mut tag = codec(TAG);
    let mut buffer = [0; FRAME_LEN];

    let mut poll = BroadcastPoll::default();
    poll.entries.push(PollEntry {
        short_address: ShortAddress(0x1200),
        reply_delay_us: 10_000,
    }).unwrap();
    poll.entries.push(PollEntry {
        short_address: ShortAddress(ANCHOR_SHORT),
        reply_delay_us: 30_000,
    }).unwrap();
    poll.encode(&mut tag, &mut buffer, BROADCAST_SHORT).unwrap();

    let sys_time = 20_000_000;
    anchor.radio.set_sys_time(sys_time);
    anchor.receive(&buffer, sys_time - 1_000);

    let ack = anchor.sent_one();
    let expected = (Instant::wrapping(sys_time) + Duration::from_micros(30_000))
        .align_to_delayed_tx();
    assert_eq!(ack.send_time, SendTime::Delayed(expected));
    anchor.complete_send();

    let poll_sent = sys_time as i64 - 1_000 - TEN_METERS;
    let poll_ack_received = ack.tx_time.value() as i64 + TEN_METERS;
    let range_sent = poll_ack_received + 600_000;

    let mut message = BroadcastRange::default();
    message.entries.push(RangeEntry {
        short_address: ShortAddress(ANCHOR_SHORT),
        range: Range {
            poll_sent: at(poll_sent),
            poll_ack_received: at(poll_ack_received),
            range_sent: at(range_sent),
        },
    }).unwrap();
    message.encode(&mut tag, &mut buffer, BROADCAST_SHORT).unwrap();
    anchor.receive(&buffer, (range_sent + TEN_METERS) as u64);

    let report = anchor.sent_one();
    assert_eq!(report.message_type(), MessageType::RangeReport);
    assert!((anchor.engine.handler().new_ranges[0].1 - 10.0).abs() < 0.02);
}

#[test]
fn tag_polls_anchors_round_robin() {
    let events = EventFlags::new();
    let mut tag = Node::start(Role::Tag, TAG, &events, RangingConfig::default());

    for short_address in [0x1201, 0x1202, 0x1203] {
        introduce_anchor(&mut tag, short_address);
    }

    let mut polled = Vec::new();
    for _ in 0..3 {
        tag.tick();
        let poll = tag.sent_one();
        assert_eq!(poll.message_type(), MessageType::Poll);
        polled.push(destination(&poll));
        tag.complete_send();
    }
    assert_eq!(polled, [0x1202, 0x1203, 0x1201]);

    // Everyone is busy.
    tag.tick();
    assert!(tag.radio.take_sent().is_empty());
}

#[test]
fn tag_with_one_anchor_keeps_blinking() {
    let events = EventFlags::new();
    let mut tag = Node::start(Role::Tag, TAG, &events, RangingConfig::default());
    introduce_anchor(&mut tag, ANCHOR_SHORT);

    tag.tick();
    assert_eq!(tag.sent_one().message_type(), MessageType::Blink);
}

#[test]
fn tag_broadcasts_poll_to_all_anchors() {
    let events = EventFlags::new();
    let mut tag = Node::start(Role::Tag, TAG, &events, RangingConfig::default());
    for short_address in [0x1201, 0x1202, 0x1203, 0x1204] {
        introduce_anchor(&mut tag, short_address);
    }

    tag.radio.set_sys_time(3_000_000);
    tag.engine.transmit_poll_broadcast().unwrap();
    let poll = tag.sent_one();
    assert_eq!(destination(&poll), BROADCAST_SHORT.0);

    // The fourth slot would be 70 ms, which doesn't fit.
    let message = BroadcastPoll::decode(&poll.decode()).unwrap();
    let slots: Vec<_> = message.entries
        .iter()
        .map(|entry| (entry.short_address.0, entry.reply_delay_us))
        .collect();
    assert_eq!(slots, [(0x1201, 10_000), (0x1202, 30_000), (0x1203, 50_000)]);

    assert_eq!(tag.engine.tick_interval_ms(), 60 + 4 * 30);

    tag.complete_send();
    for device in tag.engine.devices().iter().take(3) {
        assert_eq!(device.tag_state(), TagState::Ranging);
        assert_eq!(device.expected_message, MessageType::PollAck);
    }
    for device in tag.engine.devices().iter() {
        assert_eq!(device.timestamps.poll_sent, poll.tx_time);
    }

    // A regular poll restores the tick interval.
    tag.tick();
    assert_eq!(tag.sent_one().message_type(), MessageType::Poll);
    assert_eq!(tag.engine.tick_interval_ms(), 60);
}

#[test]
fn tag_broadcasts_range() {
    let events = EventFlags::new();
    let mut tag = Node::start(Role::Tag, TAG, &events, RangingConfig::default());
    introduce_anchor(&mut tag, 0x1201);
    introduce_anchor(&mut tag, 0x1202);

    tag.radio.set_sys_time(4_000_000);
    tag.engine.transmit_range_broadcast().unwrap();
    let sent = tag.sent_one();
    assert_eq!(destination(&sent), BROADCAST_SHORT.0);

    let expected = (Instant::wrapping(4_000_000) + Duration::from_micros(DEFAULT_REPLY_DELAY_US as u32))
        .align_to_delayed_tx();
    assert_eq!(sent.send_time, SendTime::Delayed(expected));

    let message = BroadcastRange::decode(&sent.decode()).unwrap();
    assert_eq!(message.entries.len(), 1);
    assert_eq!(message.entries[0].short_address, ShortAddress(0x1201));
    assert_eq!(message.entries[0].range.range_sent, expected);
}

#[test]
fn inactive_devices_are_reported_once() {
    let anchor_events = EventFlags::new();
    let tag_events = EventFlags::new();
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &anchor_events, RangingConfig::default());
    let mut tag = Node::start(Role::Tag, TAG, &tag_events, RangingConfig::default());

    tag.tick();
    let blink = tag.sent_one();
    anchor.receive(&blink.frame, 1_000);
    anchor.sent_one();
    anchor.complete_send();

    anchor.clock.advance(INACTIVITY_TIME_MS);
    anchor.tick();
    anchor.tick();
    assert_eq!(anchor.engine.handler().inactive, [TAG_SHORT]);

    let device = anchor.engine.device_by_short_address(ShortAddress(TAG_SHORT)).unwrap();
    assert!(!device.is_active());

    // The tag comes back. It's welcomed again, but not reported as new.
    anchor.receive(&blink.frame, 2_000);
    assert_eq!(anchor.sent_one().message_type(), MessageType::RangingInit);
    assert_eq!(anchor.engine.handler().blinks, [TAG_SHORT]);
    assert_eq!(anchor.engine.devices().len(), 1);

    let device = anchor.engine.device_by_short_address(ShortAddress(TAG_SHORT)).unwrap();
    assert!(device.is_active());
}

#[test]
fn stuck_ranging_is_reset() {
    let events = EventFlags::new();
    let mut tag = Node::start(Role::Tag, TAG, &events, RangingConfig::default());
    introduce_anchor(&mut tag, 0x1201);
    introduce_anchor(&mut tag, 0x1202);

    tag.tick();
    tag.sent_one();
    let device = tag.engine.device(1).unwrap();
    assert_eq!(device.tag_state(), TagState::Ranging);

    // No answer for longer than the ranging timeout
    tag.clock.advance(500);
    tag.tick();
    tag.radio.take_sent();

    let device = tag.engine.device(1).unwrap();
    assert_eq!(device.tag_state(), TagState::Idle);
}

#[test]
fn range_failed_returns_anchor_to_idle() {
    let events = EventFlags::new();
    let mut tag = Node::start(Role::Tag, TAG, &events, RangingConfig::default());
    introduce_anchor(&mut tag, 0x1201);
    introduce_anchor(&mut tag, 0x1202);

    tag.tick();
    assert_eq!(destination(&tag.sent_one()), 0x1202);
    tag.complete_send();

    let mut anchor = codec(0x1111_0000_0000_1202);
    let mut buffer = [0; FRAME_LEN];
    PollAck {}
        .encode_short(&mut anchor, &mut buffer, ShortAddress(TAG_SHORT))
        .unwrap();
    tag.radio.set_sys_time(2_000_000);
    tag.receive(&buffer, 2_000_000);
    assert_eq!(tag.sent_one().message_type(), MessageType::Range);
    tag.complete_send();

    let device = tag.engine.device(1).unwrap();
    assert_eq!(device.expected_message, MessageType::RangeReport);
    assert_eq!(device.tag_state(), TagState::Ranging);

    RangeFailed {}
        .encode_short(&mut anchor, &mut buffer, ShortAddress(TAG_SHORT))
        .unwrap();
    tag.receive(&buffer, 3_000_000);

    let device = tag.engine.device(1).unwrap();
    assert_eq!(device.expected_message, MessageType::PollAck);
    assert_eq!(device.tag_state(), TagState::Idle);
    assert!(tag.engine.handler().new_ranges.is_empty());
    assert!(tag.radio.take_sent().is_empty());
}

#[test]
fn ranging_init_from_known_anchor_returns_it_to_idle() {
    let events = EventFlags::new();
    let mut tag = Node::start(Role::Tag, TAG, &events, RangingConfig::default());
    introduce_anchor(&mut tag, 0x1201);
    introduce_anchor(&mut tag, 0x1202);

    tag.tick();
    assert_eq!(destination(&tag.sent_one()), 0x1202);
    assert_eq!(tag.engine.device(1).unwrap().tag_state(), TagState::Ranging);

    introduce_anchor(&mut tag, 0x1202);

    let device = tag.engine.device(1).unwrap();
    assert_eq!(device.tag_state(), TagState::Idle);
    assert_eq!(tag.engine.devices().len(), 2);
    assert_eq!(tag.engine.handler().new_devices, [0x1201, 0x1202]);
}

#[test]
fn frames_for_other_nodes_are_ignored() {
    let events = EventFlags::new();
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &events, RangingConfig::default());
    let mut tag = codec(TAG);
    let mut buffer = [0; FRAME_LEN];

    Poll::new(DEFAULT_REPLY_DELAY_US)
        .encode_short(&mut tag, &mut buffer, ShortAddress(0x1299))
        .unwrap();
    anchor.receive(&buffer, 1_000);

    assert!(anchor.radio.take_sent().is_empty());
    assert!(anchor.engine.devices().is_empty());
}

#[test]
fn malformed_frames_are_dropped() {
    let events = EventFlags::new();
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &events, RangingConfig::default());
    let mut tag = codec(TAG);
    let mut buffer = [0; FRAME_LEN];

    // Unknown frame control, truncated header
    anchor.receive(&[0x42, 0x88, 0x00], 1_000);
    anchor.receive(&[0x41, 0x88, 0x00, 0xCA], 1_000);

    // Unknown function code
    let offset = tag
        .encode_short(&mut buffer, ShortAddress(ANCHOR_SHORT), MessageType::Poll)
        .unwrap();
    buffer[offset - 1] = 0x42;
    anchor.receive(&buffer, 1_000);

    // Range with truncated payload
    let offset = tag
        .encode_short(&mut buffer, ShortAddress(ANCHOR_SHORT), MessageType::Range)
        .unwrap();
    anchor.receive(&buffer[..offset + 4], 1_000);

    // Range report from someone the anchor doesn't know
    RangeReport { range: 1.0, rx_power: -70.0 }
        .encode_short(&mut tag, &mut buffer, ShortAddress(ANCHOR_SHORT))
        .unwrap();
    anchor.receive(&buffer, 1_000);

    assert!(anchor.radio.take_sent().is_empty());
    assert!(anchor.engine.devices().is_empty());
}

#[test]
fn unexpected_messages_are_ignored() {
    let events = EventFlags::new();
    let mut tag = Node::start(Role::Tag, TAG, &events, RangingConfig::default());
    introduce_anchor(&mut tag, ANCHOR_SHORT);

    // No poll was sent, so no acknowledgement is expected.
    let mut anchor = codec(ANCHOR);
    let mut buffer = [0; FRAME_LEN];
    PollAck {}
        .encode_short(&mut anchor, &mut buffer, ShortAddress(TAG_SHORT))
        .unwrap();
    tag.receive(&buffer, 1_000);

    assert!(tag.radio.take_sent().is_empty());
}

#[test]
fn watchdog_rearms_anchor_receiver() {
    let anchor_events = EventFlags::new();
    let tag_events = EventFlags::new();
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &anchor_events, RangingConfig::default());
    let mut tag = Node::start(Role::Tag, TAG, &tag_events, RangingConfig::default());
    assert_eq!(anchor.radio.receive_armed(), 1);
    assert_eq!(tag.radio.receive_armed(), 1);

    anchor.clock.advance(999);
    anchor.engine.run_once().unwrap();
    assert_eq!(anchor.radio.receive_armed(), 1);

    anchor.clock.advance(2);
    anchor.engine.run_once().unwrap();
    assert_eq!(anchor.radio.receive_armed(), 2);

    // Tags only stamp the activity.
    tag.clock.advance(1_001);
    tag.engine.run_once().unwrap();
    assert_eq!(tag.radio.receive_armed(), 1);
}

#[test]
fn received_frames_hold_off_watchdog() {
    let events = EventFlags::new();
    let mut anchor = Node::start(Role::Anchor, ANCHOR, &events, RangingConfig::default());
    let mut tag = codec(TAG);
    let mut buffer = [0; FRAME_LEN];

    Poll::new(DEFAULT_REPLY_DELAY_US)
        .encode_short(&mut tag, &mut buffer, ShortAddress(0x1299))
        .unwrap();
    for _ in 0..3 {
        anchor.clock.advance(400);
        anchor.receive(&buffer, 1_000);
    }

    anchor.clock.advance(400);
    anchor.engine.run_once().unwrap();
    assert_eq!(anchor.radio.receive_armed(), 1);

    anchor.clock.advance(601);
    anchor.engine.run_once().unwrap();
    assert_eq!(anchor.radio.receive_armed(), 2);
}

#[test]
fn sent_event_rearms_receiver() {
    let events = EventFlags::new();
    let mut tag = Node::start(Role::Tag, TAG, &events, RangingConfig::default());

    tag.tick();
    tag.sent_one();
    tag.complete_send();

    assert_eq!(tag.radio.receive_armed(), 2);
}
