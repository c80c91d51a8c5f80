//! A BLE link layer controller.
//!
//! The controller runs the advertising role of the Bluetooth Low Energy link layer on top of a
//! [`Radio`](phy::Radio) and a microsecond [`Timer`](time::Timer) supplied by the platform. It
//! is runtime agnostic: interrupt handlers call [`LinkLayer::on_radio_event`] and
//! [`LinkLayer::on_alarm`], and one task runs [`LinkLayer::run`].
#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod codec;
mod cursor;

pub mod config;
mod error;
pub mod event;
pub mod link;
pub mod phy;
pub mod pool;
pub mod sched;
pub mod time;

pub use codec::Error as CodecError;
pub use config::{Config, ControllerConfig};
pub use error::{Error, Param, Status};
pub use event::{ConnectionComplete, HostEvent, LeConnRole};
pub use link::address::{AddrKind, Address, BdAddr};
pub use link::adv::{AdvKind, AdvParams};
pub use link::{LinkLayer, LlState, LlStats, RadioEvent};
pub use pool::{Packet, PacketPool};
pub use time::{Alarm, Ticks};
