//! Events passed from interrupt context to the link layer task, and from the link layer to
//! the host.

pub use bt_hci::param::LeConnRole;

use crate::link::address::{Address, BdAddr};
use crate::pool::Packet;
use crate::Status;

/// Work posted by interrupt handlers for the link layer task.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug)]
pub enum LlEvent<'d> {
    /// The advertising PDU on the current channel is finished.
    AdvEventDone {
        /// Advertiser epoch at the time the event was posted.
        epoch: u32,
    },
    /// A PDU was received while advertising.
    RxPdu {
        /// The PDU, header included, with reception details in its metadata.
        packet: Packet<'d>,
        epoch: u32,
    },
}

/// A connection was established.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionComplete {
    pub status: Status,
    pub handle: u16,
    /// Local role in the connection.
    pub role: LeConnRole,
    /// Peer address. For a resolved peer this is its identity address.
    pub peer: Address,
    /// Local resolvable private address used for the connection, if any.
    pub local_rpa: Option<BdAddr>,
    /// Resolvable private address the peer connected with, if it was resolved.
    pub peer_rpa: Option<BdAddr>,
    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub supervision_timeout: u16,
    /// Master clock accuracy index.
    pub clock_accuracy: u8,
}

/// Events reported to the host.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    ConnectionComplete(ConnectionComplete),
    /// High duty cycle directed advertising ended without a connection.
    DirectedAdvertisingTimeout,
    /// A scan response was sent to `scanner`.
    ScanRequest { scanner: Address },
    DisconnectionComplete { handle: u16, reason: u8 },
}

impl HostEvent {
    /// HCI status carried by the event.
    pub fn status(&self) -> Status {
        match self {
            HostEvent::ConnectionComplete(c) => c.status,
            HostEvent::DirectedAdvertisingTimeout => Status::ADV_TIMEOUT,
            _ => Status::SUCCESS,
        }
    }
}
