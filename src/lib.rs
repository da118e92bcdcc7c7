//! Double-sided two-way ranging between DW1000 anchors and tags
//!
//! This crate implements the protocol layer on top of a DW1000 driver. Anchors
//! are fixed reference points, tags are the mobile nodes whose distance to
//! the anchors is measured. Tags discover anchors by blinking, then range with
//! each known anchor in turn. The anchor computes the distance from the six
//! timestamps of an exchange and reports it back.
//!
//! The driver itself is abstracted behind the [`Radio`] trait, so this crate
//! has no hardware dependencies. See the [`engine`] module for how to set up
//! and drive a [`RangingEngine`].


#![no_std]

#![deny(missing_docs)]


#[macro_use]
mod macros;

pub mod configs;
pub mod device;
pub mod engine;
pub mod error;
pub mod frame;
pub mod radio;
pub mod range_bias;
pub mod ranging;
pub mod table;
pub mod time;


pub use ieee802154::mac;

pub use crate::{
    configs::{RadioMode, RangingConfig},
    device::{Centi, Device, TagState, Timestamps},
    engine::{Builder, Handler, RangingEngine, Role},
    error::{AddError, Error, FrameError, StaleHandle},
    frame::MessageType,
    radio::{Clock, EventFlags, Radio, RxQuality, SendTime},
    table::{DeviceHandle, DeviceTable, Insertion},
    time::{Duration, Instant},
};


/// The number of peers the engine can keep track of
pub const MAX_DEVICES: usize = 4;
