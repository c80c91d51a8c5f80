//! Connection state.
//!
//! The advertiser hands over to this module once a connect request has been accepted. Only
//! connection setup and teardown are tracked here; connection events are not run.

use super::address::{Address, BdAddr};
use super::pdu::ConnectRequest;
use crate::event::LeConnRole;
use crate::time::Ticks;
use crate::Error;

/// Connection interval unit and transmit window unit.
const UNIT_1250_USECS: u32 = 1250;

/// A connection handed over by the advertiser.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub handle: u16,
    pub role: LeConnRole,
    /// Peer identity, or the address it used on air when it was not resolved.
    pub peer: Address,
    pub peer_rpa: Option<BdAddr>,
    pub local_rpa: Option<BdAddr>,
    pub access_address: u32,
    pub crc_init: u32,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    pub channel_map: [u8; 5],
    pub hop: u8,
    pub sca: u8,
    /// Start of the transmit window for the first connection event.
    pub first_anchor: Ticks,
    /// Transmit window size in microseconds.
    pub window: u32,
}

impl Connection {
    /// Connection interval in microseconds.
    pub fn interval_usecs(&self) -> u32 {
        self.interval as u32 * UNIT_1250_USECS
    }
}

/// Check the LL data of a connect request.
pub fn validate_connect_request(req: &ConnectRequest) -> bool {
    if !(5..=16).contains(&req.hop) {
        return false;
    }
    if !(6..=3200).contains(&req.interval) || req.latency > 499 || !(10..=3200).contains(&req.timeout) {
        return false;
    }
    // The supervision timeout must cover at least two effective connection intervals.
    let timeout_us = req.timeout as u64 * 10_000;
    let min_us = (1 + req.latency as u64) * req.interval as u64 * UNIT_1250_USECS as u64 * 2;
    if timeout_us <= min_us {
        return false;
    }
    if req.win_size < 1 || req.win_size > 8 || req.win_size as u16 >= req.interval {
        return false;
    }
    if req.win_offset > req.interval {
        return false;
    }
    req.used_channels() >= 2
}

/// Connection table with `N` slots. The slot index is the connection handle.
pub struct ConnectionManager<const N: usize> {
    slots: [Option<Connection>; N],
}

impl<const N: usize> Default for ConnectionManager<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ConnectionManager<N> {
    pub const fn new() -> Self {
        Self { slots: [None; N] }
    }

    /// Start a connection in the peripheral role.
    ///
    /// `conn_req_end` is the tick at which the connect request ended on air. Returns `None` if
    /// the LL data is unacceptable or no slot is free.
    pub fn slave_start(
        &mut self,
        req: &ConnectRequest,
        conn_req_end: Ticks,
        peer: Address,
        peer_rpa: Option<BdAddr>,
        local_rpa: Option<BdAddr>,
    ) -> Option<&Connection> {
        if !validate_connect_request(req) {
            debug!("[conn] rejecting connect request {:?}", req);
            return None;
        }
        let idx = self.slots.iter().position(|s| s.is_none())?;
        let first_anchor = conn_req_end.add_micros(UNIT_1250_USECS + req.win_offset as u32 * UNIT_1250_USECS);
        let conn = Connection {
            handle: idx as u16,
            role: LeConnRole::Peripheral,
            peer,
            peer_rpa,
            local_rpa,
            access_address: req.access_address,
            crc_init: req.crc_init,
            interval: req.interval,
            latency: req.latency,
            timeout: req.timeout,
            channel_map: req.channel_map,
            hop: req.hop,
            sca: req.sca,
            first_anchor,
            window: req.win_size as u32 * UNIT_1250_USECS,
        };
        info!("[conn] connection {} established, interval {}", idx, req.interval);
        self.slots[idx] = Some(conn);
        self.slots[idx].as_ref()
    }

    pub fn get(&self, handle: u16) -> Option<&Connection> {
        self.slots.get(handle as usize).and_then(|s| s.as_ref())
    }

    /// Tear down a connection.
    pub fn disconnect(&mut self, handle: u16) -> Result<Connection, Error> {
        self.slots
            .get_mut(handle as usize)
            .and_then(|s| s.take())
            .ok_or(Error::UnknownConnection)
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots = [None; N];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> ConnectRequest {
        ConnectRequest {
            access_address: 0xAF9A_9357,
            crc_init: 0x12_3456,
            win_size: 2,
            win_offset: 4,
            interval: 40,
            latency: 0,
            timeout: 100,
            channel_map: [0xFF, 0xFF, 0xFF, 0xFF, 0x1F],
            hop: 9,
            sca: 0,
        }
    }

    #[test]
    fn connect_request_validation() {
        assert!(validate_connect_request(&req()));
        assert!(!validate_connect_request(&ConnectRequest { hop: 4, ..req() }));
        assert!(!validate_connect_request(&ConnectRequest { hop: 17, ..req() }));
        assert!(!validate_connect_request(&ConnectRequest { interval: 5, ..req() }));
        assert!(!validate_connect_request(&ConnectRequest { latency: 500, ..req() }));
        // 40 * 1.25 ms * 2 = 100 ms is not below 100 ms.
        assert!(!validate_connect_request(&ConnectRequest { timeout: 10, ..req() }));
        assert!(!validate_connect_request(&ConnectRequest { win_size: 0, ..req() }));
        assert!(!validate_connect_request(&ConnectRequest {
            channel_map: [0x01, 0, 0, 0, 0xE0],
            ..req()
        }));
        assert!(validate_connect_request(&ConnectRequest {
            channel_map: [0x03, 0, 0, 0, 0],
            ..req()
        }));
    }

    #[test]
    fn slave_start_and_disconnect() {
        let mut conns: ConnectionManager<1> = ConnectionManager::new();
        let peer = Address::public([1, 2, 3, 4, 5, 6]);
        let conn = *conns.slave_start(&req(), Ticks(10_000), peer, None, None).unwrap();
        assert_eq!(conn.handle, 0);
        assert_eq!(conn.role, LeConnRole::Peripheral);
        assert_eq!(conn.first_anchor, Ticks(10_000 + 1250 + 4 * 1250));
        assert_eq!(conn.window, 2500);
        assert_eq!(conn.interval_usecs(), 50_000);

        assert!(conns.slave_start(&req(), Ticks(0), peer, None, None).is_none());
        assert_eq!(conns.disconnect(0).unwrap().peer, peer);
        assert_eq!(conns.disconnect(0), Err(Error::UnknownConnection));
        assert!(conns.is_empty());
    }
}
