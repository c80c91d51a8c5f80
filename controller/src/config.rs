//! Controller configuration.
//!
//! Hardware is bundled through the [`Config`] trait, per-device settings are passed in
//! [`ControllerConfig`], and queue and table sizes are set at compile time.
//!
//! Compile-time settings can be set in two ways:
//!
//! - Via Cargo features: enable a feature like `<name>-<value>`. `name` must be in lowercase and
//!   use dashes instead of underscores. For example `event-queue-size-16`. Only a selection of values
//!   is available, check `Cargo.toml` for the list.
//! - Via environment variables at build time: set the variable named `TROUBLE_CONTROLLER_<value>`. For example
//!   `TROUBLE_CONTROLLER_WHITELIST_SIZE=16 cargo build`. You can also set them in the `[env]` section of `.cargo/config.toml`.
//!   Any value can be set, unlike with Cargo features.
//!
//! Environment variables take precedence over Cargo features. If two Cargo features are enabled for the same setting
//! with different values, compilation fails.

use embassy_sync::blocking_mutex::raw::RawMutex;
use rand_core::RngCore;

use crate::link::address::BdAddr;
use crate::phy::Radio;
use crate::time::Timer;

mod raw {
    #![allow(unused)]
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}

/// Link layer event queue size.
///
/// Number of completions and received PDUs that can be in flight between interrupt context
/// and the link layer task.
///
/// Default: 8.
pub const EVENT_QUEUE_SIZE: usize = raw::EVENT_QUEUE_SIZE;

/// Host event queue size.
///
/// Default: 4.
pub const HOST_EVENT_QUEUE_SIZE: usize = raw::HOST_EVENT_QUEUE_SIZE;

/// Maximum number of items the scheduler can hold at once.
///
/// Default: 8.
pub const SCHED_MAX_ITEMS: usize = raw::SCHED_MAX_ITEMS;

/// Number of whitelist entries.
///
/// Default: 8.
pub const WHITELIST_SIZE: usize = raw::WHITELIST_SIZE;

/// Number of resolving list entries.
///
/// Default: 4.
pub const RESOLVING_LIST_SIZE: usize = raw::RESOLVING_LIST_SIZE;

/// Maximum number of simultaneous connections.
///
/// Default: 1.
pub const MAX_CONNECTIONS: usize = raw::MAX_CONNECTIONS;

/// How many times the advertiser searches forward for a free schedule slot after an
/// advertising event before giving up and retrying from the task.
///
/// Default: 16.
pub const ADV_RESCHEDULE_MAX_ATTEMPTS: usize = raw::ADV_RESCHEDULE_MAX_ATTEMPTS;

/// Trait for controller hardware configuration.
///
/// This trait defines the types used throughout the link layer to access the hardware and to
/// protect state shared between interrupt handlers and the link layer task.
///
/// Every application must define a type implementing this trait and supply it to the
/// [`LinkLayer`](crate::link::LinkLayer).
pub trait Config {
    /// Mutex guarding link layer state.
    ///
    /// Use `CriticalSectionRawMutex` when the radio and timer interrupts call into the link layer.
    type Mutex: RawMutex;

    /// A time source with microsecond resolution.
    type Timer: Timer;

    /// The BLE radio.
    type Radio: Radio;

    /// Random number source used for advertising jitter and private addresses.
    type Rng: RngCore;
}

/// Per-device controller settings.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Public device address.
    pub public_address: BdAddr,
    /// Transmit power in dBm, railed to what the radio supports.
    pub tx_power: i8,
    /// Whether LL privacy (resolvable private addresses) is supported.
    pub privacy: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            public_address: BdAddr::new([0; 6]),
            tx_power: 0,
            privacy: true,
        }
    }
}
