//! Advertising state machine.
//!
//! An advertising event sends one PDU on each enabled advertising channel, lowest channel
//! first. Each PDU owns a schedule item; once it is finished (transmitted, answered, or timed
//! out waiting for a request) the interrupt handler posts [`LlEvent::AdvEventDone`] and the link
//! layer task moves the item to the next channel or to the next event.
//!
//! Completions carry the advertiser epoch. The epoch changes whenever advertising is enabled or
//! disabled, so completions that were already queued when advertising stopped are ignored.

pub use bt_hci::param::AdvKind;

use heapless::Vec;
use rand_core::RngCore;

use super::address::{
    is_random_kind, is_rpa, is_valid_random_address, own_addr_kind, peer_addr_kind, uses_rpa, AddrKind, Address,
    BdAddr,
};
use super::pdu::{AdvPdu, PduHeader, PduType, CONNECT_REQ_LEN, MAX_ADV_DATA_LEN};
use super::{Inner, LlState, Queues};
use crate::codec::{check_len, Decode, Encode, Error as CodecError, FixedSize, Type};
use crate::config::{Config, ADV_RESCHEDULE_MAX_ATTEMPTS};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::event::{ConnectionComplete, HostEvent, LlEvent};
use crate::fmt::Bytes;
use crate::phy::{
    tx_duration_usecs, RxFlags, RxInfo, RxStart, Transition, ADV_CHANNEL_FIRST, MAX_PDU_LEN, XCVR_PROC_DELAY_USECS,
    XCVR_TX_SCHED_DELAY_USECS,
};
use crate::pool::{Packet, Pool};
use crate::sched::{ItemId, SchedError, SchedItem, SchedKind};
use crate::time::{Alarm, Ticks, Timer};
use crate::{Error, Param, Status};

/// Advertising interval unit.
pub const ADV_ITVL_USECS: u32 = 625;

/// Smallest interval for connectable advertising.
pub const ADV_ITVL_MIN: u16 = 0x0020;

/// Smallest interval for scannable and non-connectable advertising.
pub const ADV_ITVL_NONCONN_MIN: u16 = 0x00A0;

pub const ADV_ITVL_MAX: u16 = 0x4000;

pub const ADV_ITVL_DEFAULT: u16 = 0x0800;

/// All three advertising channels.
pub const ADV_CHANMASK_DEFAULT: u8 = 0x07;

/// PDU interval of high duty cycle directed advertising.
pub const ADV_PDU_ITVL_HD_USECS: u32 = 3750;

/// How long high duty cycle directed advertising lasts without a connection.
pub const ADV_DIRECT_HD_USECS: u32 = 1_280_000;

/// Random delay added to every advertising interval is below this.
pub const ADV_DELAY_MAX_USECS: u32 = 10_000;

/// Radio time reserved after an undirected scannable PDU for a request and our response.
const SCHED_ADV_MAX_USECS: u32 = 852;

/// Radio time reserved after a directed PDU for a connect request.
const SCHED_DIRECT_ADV_MAX_USECS: u32 = 502;

/// Advertising type from its HCI encoding.
pub fn adv_kind(raw: u8) -> Result<AdvKind, Error> {
    Ok(match raw {
        0 => AdvKind::AdvInd,
        1 => AdvKind::AdvDirectIndHigh,
        2 => AdvKind::AdvScanInd,
        3 => AdvKind::AdvNonconnInd,
        4 => AdvKind::AdvDirectIndLow,
        _ => return Err(Error::InvalidParams(Param::AdvertisingType)),
    })
}

pub fn is_directed(kind: AdvKind) -> bool {
    matches!(kind, AdvKind::AdvDirectIndHigh | AdvKind::AdvDirectIndLow)
}

fn accepts_scan_req(kind: AdvKind) -> bool {
    matches!(kind, AdvKind::AdvInd | AdvKind::AdvScanInd)
}

fn accepts_connect_req(kind: AdvKind) -> bool {
    matches!(kind, AdvKind::AdvInd | AdvKind::AdvDirectIndHigh | AdvKind::AdvDirectIndLow)
}

/// HCI LE Set Advertising Parameters command parameters.
///
/// Fields hold the raw HCI values; they are checked by
/// [`LinkLayer::set_advertising_parameters`](super::LinkLayer::set_advertising_parameters).
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvParams {
    /// Minimum interval in 0.625 ms units.
    pub interval_min: u16,
    /// Maximum interval in 0.625 ms units.
    pub interval_max: u16,
    pub adv_type: u8,
    pub own_addr_type: u8,
    pub peer_addr_type: u8,
    pub peer_addr: BdAddr,
    /// Bit 0, 1 and 2 enable channel 37, 38 and 39.
    pub channel_map: u8,
    /// Bit 0 filters scan requests, bit 1 connect requests through the whitelist.
    pub filter_policy: u8,
}

impl Default for AdvParams {
    fn default() -> Self {
        Self {
            interval_min: ADV_ITVL_DEFAULT,
            interval_max: ADV_ITVL_DEFAULT,
            adv_type: AdvKind::AdvInd as u8,
            own_addr_type: 0,
            peer_addr_type: 0,
            peer_addr: BdAddr::new([0; 6]),
            channel_map: ADV_CHANMASK_DEFAULT,
            filter_policy: 0,
        }
    }
}

impl FixedSize for AdvParams {
    const SIZE: usize = 15;
}

impl Encode for AdvParams {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(self.interval_min)?;
        w.write(self.interval_max)?;
        w.write(self.adv_type)?;
        w.write(self.own_addr_type)?;
        w.write(self.peer_addr_type)?;
        w.write(self.peer_addr)?;
        w.write(self.channel_map)?;
        w.write(self.filter_policy)?;
        Ok(())
    }
}

impl Decode<'_> for AdvParams {
    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        check_len(src, Self::SIZE)?;
        let mut r = ReadCursor::new(src);
        Ok(Self {
            interval_min: r.read()?,
            interval_max: r.read()?,
            adv_type: r.read()?,
            own_addr_type: r.read()?,
            peer_addr_type: r.read()?,
            peer_addr: r.read()?,
            channel_map: r.read()?,
            filter_policy: r.read()?,
        })
    }
}

/// Advertising context.
pub struct Advertiser {
    adv_type: AdvKind,
    interval_min: u16,
    interval_max: u16,
    own_addr: AddrKind,
    peer: Address,
    chanmask: u8,
    filter_policy: u8,
    adv_data: Vec<u8, MAX_ADV_DATA_LEN>,
    scan_rsp_data: Vec<u8, MAX_ADV_DATA_LEN>,

    enabled: bool,
    epoch: u32,
    chan: u8,
    adva: BdAddr,
    tx_add: bool,
    inita: BdAddr,
    rx_add: bool,
    itvl_usecs: u32,
    event_start: Ticks,
    pdu_start: Ticks,
    hd_end: Ticks,
    sched_id: Option<ItemId>,

    rpa_force: bool,
    rpa_elapsed_us: u64,
    rpa_last: Ticks,
    peer_rpa: Option<BdAddr>,
}

impl Default for Advertiser {
    fn default() -> Self {
        Self::new()
    }
}

impl Advertiser {
    pub fn new() -> Self {
        Self {
            adv_type: AdvKind::AdvInd,
            interval_min: ADV_ITVL_DEFAULT,
            interval_max: ADV_ITVL_DEFAULT,
            own_addr: AddrKind::PUBLIC,
            peer: Address::public([0; 6]),
            chanmask: ADV_CHANMASK_DEFAULT,
            filter_policy: 0,
            adv_data: Vec::new(),
            scan_rsp_data: Vec::new(),
            enabled: false,
            epoch: 0,
            chan: ADV_CHANNEL_FIRST,
            adva: BdAddr::new([0; 6]),
            tx_add: false,
            inita: BdAddr::new([0; 6]),
            rx_add: false,
            itvl_usecs: 0,
            event_start: Ticks(0),
            pdu_start: Ticks(0),
            hd_end: Ticks(0),
            sched_id: None,
            rpa_force: false,
            rpa_elapsed_us: 0,
            rpa_last: Ticks(0),
            peer_rpa: None,
        }
    }

    /// Validate and store advertising parameters.
    ///
    /// `privacy` tells whether resolvable private own addresses are supported. On error nothing
    /// changes.
    pub fn set_params(&mut self, p: &AdvParams, privacy: bool) -> Result<(), Error> {
        if self.enabled {
            return Err(Error::CommandDisallowed);
        }

        let adv_type = adv_kind(p.adv_type)?;
        let (min_itvl, itvl_min, itvl_max) = match adv_type {
            AdvKind::AdvDirectIndHigh => (0, 0, 0),
            AdvKind::AdvInd | AdvKind::AdvDirectIndLow => (ADV_ITVL_MIN, p.interval_min, p.interval_max),
            AdvKind::AdvScanInd | AdvKind::AdvNonconnInd => (ADV_ITVL_NONCONN_MIN, p.interval_min, p.interval_max),
        };
        if itvl_min > itvl_max || itvl_min < min_itvl || itvl_max > ADV_ITVL_MAX {
            return Err(Error::InvalidParams(Param::Interval));
        }

        let own_addr = own_addr_kind(p.own_addr_type).ok_or(Error::InvalidParams(Param::OwnAddressType))?;
        let peer_kind = peer_addr_kind(p.peer_addr_type).ok_or(Error::InvalidParams(Param::PeerAddressType))?;
        if uses_rpa(own_addr) && !privacy {
            return Err(Error::Unsupported);
        }

        if p.channel_map & !ADV_CHANMASK_DEFAULT != 0 || p.channel_map == 0 {
            return Err(Error::InvalidParams(Param::ChannelMap));
        }

        let filter_policy = if is_directed(adv_type) { 0 } else { p.filter_policy };
        if filter_policy > 3 {
            return Err(Error::InvalidParams(Param::FilterPolicy));
        }

        self.adv_type = adv_type;
        self.interval_min = itvl_min;
        self.interval_max = itvl_max;
        self.own_addr = own_addr;
        self.peer = Address {
            kind: peer_kind,
            addr: p.peer_addr,
        };
        self.chanmask = p.channel_map;
        self.filter_policy = filter_policy;
        if uses_rpa(own_addr) {
            self.rpa_force = true;
        }
        Ok(())
    }

    /// Set the advertising data. Takes effect with the next PDU.
    pub fn set_adv_data(&mut self, data: &[u8]) -> Result<(), Error> {
        self.adv_data = Vec::from_slice(data).map_err(|_| Error::InvalidParams(Param::DataLength))?;
        Ok(())
    }

    /// Set the scan response data. Takes effect with the next scan request.
    pub fn set_scan_rsp_data(&mut self, data: &[u8]) -> Result<(), Error> {
        self.scan_rsp_data = Vec::from_slice(data).map_err(|_| Error::InvalidParams(Param::DataLength))?;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn adv_type(&self) -> AdvKind {
        self.adv_type
    }

    pub fn filter_policy(&self) -> u8 {
        self.filter_policy
    }

    /// Channel of the current or next PDU.
    pub fn channel(&self) -> u8 {
        self.chan
    }

    /// Advertiser address currently sent on air.
    pub fn adva(&self) -> BdAddr {
        self.adva
    }

    /// Whether the whitelist may change. It may not while advertising filters through it.
    pub fn can_change_whitelist(&self) -> bool {
        !(self.enabled && self.filter_policy != 0)
    }

    /// Local resolvable private address currently used.
    pub fn local_rpa(&self) -> Option<BdAddr> {
        (uses_rpa(self.own_addr) && self.tx_add && is_rpa(&self.adva)).then_some(self.adva)
    }

    /// Resolvable private address of the last peer that connected.
    pub fn peer_rpa(&self) -> Option<BdAddr> {
        self.peer_rpa
    }

    /// Advertising interval in microseconds.
    pub fn interval_usecs(&self) -> u32 {
        if self.adv_type == AdvKind::AdvDirectIndHigh {
            ADV_PDU_ITVL_HD_USECS
        } else {
            self.interval_max as u32 * ADV_ITVL_USECS
        }
    }

    /// First channel of every advertising event.
    pub fn first_chan(&self) -> u8 {
        ADV_CHANNEL_FIRST + self.chanmask.trailing_zeros() as u8
    }

    /// Last channel of every advertising event.
    pub fn final_chan(&self) -> u8 {
        ADV_CHANNEL_FIRST + 7 - self.chanmask.leading_zeros() as u8
    }

    /// Channel after the current one. Only valid before the final channel.
    fn next_chan(&self) -> u8 {
        let mut chan = self.chan + 1;
        if self.chanmask & (1 << (chan - ADV_CHANNEL_FIRST)) == 0 {
            chan += 1;
        }
        chan
    }

    /// Move to the start of the next advertising event.
    fn next_event<R: RngCore>(&mut self, rng: &mut R) {
        let mut itvl = self.itvl_usecs;
        if self.adv_type != AdvKind::AdvDirectIndHigh {
            itvl += rng.next_u32() % ADV_DELAY_MAX_USECS;
        }
        self.event_start = self.event_start.add_micros(itvl);
        self.pdu_start = self.event_start;
    }

    /// The PDU sent on every channel.
    pub fn pdu(&self) -> AdvPdu<'_> {
        match self.adv_type {
            AdvKind::AdvInd => AdvPdu::AdvInd {
                adva: self.adva,
                data: &self.adv_data,
            },
            AdvKind::AdvDirectIndHigh | AdvKind::AdvDirectIndLow => AdvPdu::AdvDirectInd {
                adva: self.adva,
                inita: self.inita,
            },
            AdvKind::AdvScanInd => AdvPdu::AdvScanInd {
                adva: self.adva,
                data: &self.adv_data,
            },
            AdvKind::AdvNonconnInd => AdvPdu::AdvNonconnInd {
                adva: self.adva,
                data: &self.adv_data,
            },
        }
    }

    pub fn pdu_header(&self) -> PduHeader {
        let rx_add = is_directed(self.adv_type) && self.rx_add;
        self.pdu().header(self.tx_add, rx_add)
    }

    /// Radio time needed by one PDU and its responses.
    fn max_usecs(&self) -> u32 {
        let air = tx_duration_usecs(self.pdu().size());
        match self.adv_type {
            AdvKind::AdvDirectIndHigh | AdvKind::AdvDirectIndLow => air + SCHED_DIRECT_ADV_MAX_USECS,
            AdvKind::AdvInd | AdvKind::AdvScanInd => air + SCHED_ADV_MAX_USECS,
            AdvKind::AdvNonconnInd => air,
        }
    }

    /// Schedule window for the PDU starting on air at `pdu_start`.
    fn sched_window(&self) -> (Ticks, Ticks) {
        (
            self.pdu_start.sub_micros(XCVR_TX_SCHED_DELAY_USECS),
            self.pdu_start.add_micros(self.max_usecs()),
        )
    }
}

/// What happened to a received request.
enum Request {
    /// Not for us or filtered out.
    Drop,
    /// A connect request passed the filters.
    Matched,
    /// A scan response is on its way.
    ScanRsp,
}

fn build_packet<'d>(pool: &'d dyn Pool, header: PduHeader, pdu: &AdvPdu<'_>) -> Option<Packet<'d>> {
    let mut buf = [0u8; 6 + MAX_ADV_DATA_LEN];
    let len = pdu.size();
    pdu.encode(buf.get_mut(..len)?).ok()?;
    let mut packet = Packet::from_slice(pool, &buf[..len]).ok()?;
    packet.meta.tx_header = header.flags();
    Some(packet)
}

impl<'d, C: Config> Inner<'d, C> {
    /// Identity address used as AdvA, and whether it is random.
    fn own_identity(&self) -> (BdAddr, bool) {
        if !is_random_kind(self.adv.own_addr) {
            (self.public_addr, false)
        } else {
            (self.random_addr.unwrap_or(BdAddr::new([0; 6])), true)
        }
    }

    /// Start advertising with the stored parameters.
    ///
    /// A random own address must be valid unless a local IRK for the peer lets a resolvable
    /// private address stand in for it.
    pub(super) fn adv_enable(&mut self) -> Result<(), Error> {
        if self.adv.enabled {
            return Err(Error::CommandDisallowed);
        }
        let own_rpa = uses_rpa(self.adv.own_addr) && self.resolv.has_local_irk(&self.adv.peer);
        if is_random_kind(self.adv.own_addr) && !own_rpa {
            match self.random_addr {
                Some(addr) if is_valid_random_address(&addr) => {}
                _ => return Err(Error::CommandDisallowed),
            }
        }

        let (adva, tx_add) = self.own_identity();
        self.adv.adva = adva;
        self.adv.tx_add = tx_add;
        if is_directed(self.adv.adv_type) {
            self.adv.inita = self.adv.peer.addr;
            self.adv.rx_add = self.adv.peer.is_random();
        }

        let now = self.timer.now();
        self.adv.rpa_force = true;
        self.adv_chk_rpa(now);

        self.adv.itvl_usecs = self.adv.interval_usecs();
        self.adv.chan = self.adv.first_chan();

        let end = now.add_micros(self.adv.max_usecs() + XCVR_TX_SCHED_DELAY_USECS);
        let (id, item) = self
            .sched
            .insert_first_fit(SchedItem::new(now, end, SchedKind::Advertising))
            .map_err(|e| {
                warn!("[adv] unable to schedule: {:?}", e);
                Error::MemCapacity
            })?;
        self.adv.sched_id = Some(id);
        self.adv.event_start = item.start.add_micros(XCVR_TX_SCHED_DELAY_USECS);
        self.adv.pdu_start = self.adv.event_start;
        self.adv.hd_end = self.adv.event_start.add_micros(ADV_DIRECT_HD_USECS);
        self.adv.enabled = true;
        self.adv.epoch = self.adv.epoch.wrapping_add(1);
        info!("[adv] enabled {:?} on channel {}", self.adv.adv_type, self.adv.chan);
        Ok(())
    }

    /// Stop advertising. Stopping while disabled has no effect.
    pub(super) fn adv_disable(&mut self) {
        if !self.adv.enabled {
            return;
        }
        if let Some(id) = self.adv.sched_id.take() {
            self.sched.remove(id);
        }
        if self.state == LlState::Advertising {
            self.phy.disable();
            self.timer.clear_alarm(Alarm::WaitForResponse);
            self.state = self.idle_state();
        }
        self.adv.enabled = false;
        self.adv.epoch = self.adv.epoch.wrapping_add(1);
        info!("[adv] disabled");
    }

    /// Start the PDU of the schedule item `id`. Runs from the scheduler alarm.
    pub(super) fn adv_tx_start(&mut self, id: ItemId, item: SchedItem, q: &Queues<'_, 'd, C::Mutex>) {
        if !self.adv.enabled || self.adv.sched_id != Some(id) {
            self.sched.finish(id);
            return;
        }
        let now = self.timer.now();

        if let Err(e) = self.phy.set_channel(self.adv.chan, 0, 0) {
            warn!("[adv] bad channel {}: {:?}", self.adv.chan, e);
            self.adv_tx_done(q);
            return;
        }
        if self
            .phy
            .set_tx_start(item.start.add_micros(XCVR_PROC_DELAY_USECS), now)
            .is_err()
        {
            self.stats.adv_late_starts += 1;
            self.adv_tx_done(q);
            return;
        }

        self.phy.encrypt_disable();
        if self.resolv.is_enabled() {
            let irks = self.resolv.peer_irks();
            if let Err(e) = self.phy.resolv_list_enable(&irks) {
                warn!("[adv] address resolution unavailable: {:?}", e);
            }
        } else {
            self.phy.resolv_list_disable();
        }

        let transition = if self.adv.adv_type == AdvKind::AdvNonconnInd {
            Transition::None
        } else {
            Transition::TxRx
        };

        let Some(packet) = build_packet(self.pool, self.adv.pdu_header(), &self.adv.pdu()) else {
            self.stats.no_bufs += 1;
            self.phy.disable();
            self.adv_tx_done(q);
            return;
        };

        self.phy.set_txend_notify(transition == Transition::None);
        if let Err(e) = self.phy.transmit(&packet, transition) {
            debug!("[adv] transmit failed: {:?}", e);
            self.adv_tx_done(q);
            return;
        }
        self.state = LlState::Advertising;
        self.stats.adv_txg += 1;
    }

    /// The PDU on the current channel is over.
    pub(super) fn adv_tx_done(&mut self, q: &Queues<'_, 'd, C::Mutex>) {
        let epoch = self.adv.epoch;
        self.post(q, LlEvent::AdvEventDone { epoch });
        self.state = self.idle_state();
        if let Some(id) = self.adv.sched_id {
            self.sched.finish(id);
        }
        self.timer.clear_alarm(Alarm::WaitForResponse);
    }

    /// A PDU header arrived after our advertising PDU.
    pub(super) fn adv_rx_isr_start(&mut self, start: &RxStart, q: &Queues<'_, 'd, C::Mutex>) {
        self.timer.clear_alarm(Alarm::WaitForResponse);
        let accept = match PduType::try_from(start.pdu_type()) {
            Ok(PduType::ScanReq) => accepts_scan_req(self.adv.adv_type),
            Ok(PduType::ConnectReq) => accepts_connect_req(self.adv.adv_type),
            _ => false,
        };
        if accept {
            self.phy.accept_rx();
        } else {
            self.phy.reject_rx();
            self.adv_tx_done(q);
        }
    }

    /// A PDU accepted by [`Inner::adv_rx_isr_start`] ended.
    pub(super) fn adv_rx_isr_end(&mut self, mut info: RxInfo, q: &Queues<'_, 'd, C::Mutex>) {
        let mut buf = [0u8; MAX_PDU_LEN];
        let raw = self.phy.rx_pdu();
        let len = raw.len();
        buf[..len].copy_from_slice(raw);
        let pdu = &buf[..len];

        let outcome = match Packet::from_slice(self.pool, pdu) {
            Err(_) => {
                self.stats.no_bufs += 1;
                self.adv_tx_done(q);
                Request::Drop
            }
            Ok(mut packet) => {
                let is_request = matches!(
                    pdu.first().map(|b| PduType::try_from(b & 0x0F)),
                    Some(Ok(PduType::ScanReq | PduType::ConnectReq))
                );
                let outcome = if info.flags.contains(RxFlags::CRC_OK) && is_request {
                    self.adv_rx_req(pdu, &mut info)
                } else {
                    Request::Drop
                };
                packet.meta.rx = info;
                let epoch = self.adv.epoch;
                self.post(q, LlEvent::RxPdu { packet, epoch });
                outcome
            }
        };

        match outcome {
            Request::ScanRsp => {}
            Request::Matched => self.state = self.idle_state(),
            Request::Drop => {
                self.state = self.idle_state();
                self.phy.disable();
            }
        }
    }

    /// Filter a scan or connect request and answer scan requests.
    ///
    /// At most one scan response goes out per advertising PDU. The response is sent without a
    /// receive window after it, and the end of its transmission finishes the PDU, so further
    /// scan requests on the same channel are not heard.
    fn adv_rx_req(&mut self, pdu: &[u8], info: &mut RxInfo) -> Request {
        let Ok((header, body)) = AdvPdu::parse(pdu) else {
            return Request::Drop;
        };
        let (scan, peer, adva) = match body {
            AdvPdu::ScanReq { scana, adva } => (true, scana, adva),
            AdvPdu::ConnectReq { inita, adva, .. } => (false, inita, adva),
            _ => return Request::Drop,
        };
        if adva != self.adv.adva || header.rx_add != self.adv.tx_add {
            return Request::Drop;
        }

        let filter_bit = if scan { 0x01 } else { 0x02 };
        let chk_wl = self.adv.filter_policy & filter_bit != 0;
        let mut peer_addr = peer;
        let mut peer_random = header.tx_add;

        if header.tx_add && is_rpa(&peer) && self.resolv.is_enabled() {
            let idx = match info.resolved {
                Some(idx) => {
                    self.resolv.set_peer_rpa(idx as usize, peer);
                    Some(idx as usize)
                }
                None => self.resolv.resolve(&peer),
            };
            match idx.and_then(|i| self.resolv.entry(i).map(|e| (i, e.identity))) {
                Some((idx, identity)) => {
                    info.flags.insert(RxFlags::RESOLVED);
                    info.resolved = Some(idx as u8);
                    if chk_wl {
                        peer_addr = identity.addr;
                        peer_random = identity.is_random();
                    }
                }
                None if chk_wl => return Request::Drop,
                None => {}
            }
        }

        if chk_wl && !self.whitelist.contains(&peer_addr, peer_random) {
            return Request::Drop;
        }
        info.flags.insert(RxFlags::DEVMATCH);

        if !scan {
            return Request::Matched;
        }

        let rsp = AdvPdu::ScanRsp {
            adva: self.adv.adva,
            data: &self.adv.scan_rsp_data,
        };
        let Some(packet) = build_packet(self.pool, rsp.header(self.adv.tx_add, false), &rsp) else {
            self.stats.no_bufs += 1;
            return Request::Drop;
        };
        self.phy.set_txend_notify(true);
        match self.phy.transmit(&packet, Transition::None) {
            Ok(()) => {
                info.flags.insert(RxFlags::SCAN_RSP_TXD);
                self.stats.scan_rsp_txg += 1;
                Request::ScanRsp
            }
            Err(_) => Request::Drop,
        }
    }

    /// Process a PDU received while advertising. Runs in the link layer task.
    pub(super) fn adv_rx_pkt_in(&mut self, packet: Packet<'d>, epoch: u32, q: &Queues<'_, 'd, C::Mutex>) {
        if !self.adv.enabled || epoch != self.adv.epoch {
            return;
        }
        let info = packet.meta.rx;
        let mut buf = [0u8; MAX_PDU_LEN];
        let pdu = packet.read_into(&mut buf).unwrap_or(&[]);
        trace!("[adv] rx {:?}", Bytes(pdu));

        let mut done = true;
        if info.flags.contains(RxFlags::CRC_OK) {
            match pdu.first().map(|b| PduType::try_from(b & 0x0F)) {
                Some(Ok(PduType::ConnectReq)) => done = !self.adv_conn_req_rxd(pdu, &info, q),
                Some(Ok(PduType::ScanReq)) if info.flags.contains(RxFlags::SCAN_RSP_TXD) => {
                    // The end of the scan response finishes this PDU.
                    done = false;
                    if let Ok((header, AdvPdu::ScanReq { scana, .. })) = AdvPdu::parse(pdu) {
                        let scanner = Address::from_pdu(scana, header.tx_add);
                        self.notify(q, HostEvent::ScanRequest { scanner });
                    }
                }
                _ => {}
            }
        }
        if done {
            self.adv_event_done(epoch, q);
        }
    }

    /// Handle a connect request that passed the interrupt filters. Returns `true` if a
    /// connection was started.
    fn adv_conn_req_rxd(&mut self, pdu: &[u8], info: &RxInfo, q: &Queues<'_, 'd, C::Mutex>) -> bool {
        if !info.flags.contains(RxFlags::DEVMATCH) {
            return false;
        }
        let Ok((header, AdvPdu::ConnectReq { inita, lldata, .. })) = AdvPdu::parse(pdu) else {
            return false;
        };

        let identity = if info.flags.contains(RxFlags::RESOLVED) {
            info.resolved
                .and_then(|idx| self.resolv.entry(idx as usize))
                .map(|e| e.identity)
        } else {
            None
        };

        if is_directed(self.adv.adv_type) {
            let (addr, random) = match identity {
                Some(id) => (id.addr, id.is_random()),
                None => (inita, header.tx_add),
            };
            if addr != self.adv.peer.addr || random != self.adv.peer.is_random() {
                return false;
            }
        }

        let (peer, peer_rpa) = match identity {
            Some(id) => {
                let kind = if id.is_random() {
                    AddrKind::RESOLVABLE_PRIVATE_OR_RANDOM
                } else {
                    AddrKind::RESOLVABLE_PRIVATE_OR_PUBLIC
                };
                (Address { kind, addr: id.addr }, Some(inita))
            }
            None => (Address::from_pdu(inita, header.tx_add), None),
        };
        let local_rpa = self.adv.local_rpa();
        let end = info.start.add_micros(tx_duration_usecs(CONNECT_REQ_LEN as usize));

        let Some(conn) = self.conns.slave_start(&lldata, end, peer, peer_rpa, local_rpa).copied() else {
            return false;
        };

        self.adv.peer_rpa = peer_rpa;
        self.adv_disable();
        self.state = LlState::Connection;
        self.notify(
            q,
            HostEvent::ConnectionComplete(ConnectionComplete {
                status: Status::SUCCESS,
                handle: conn.handle,
                role: conn.role,
                peer: conn.peer,
                local_rpa: conn.local_rpa,
                peer_rpa: conn.peer_rpa,
                interval: conn.interval,
                latency: conn.latency,
                supervision_timeout: conn.timeout,
                clock_accuracy: conn.sca,
            }),
        );
        true
    }

    /// Move to the next channel or event. Runs in the link layer task.
    pub(super) fn adv_event_done(&mut self, epoch: u32, q: &Queues<'_, 'd, C::Mutex>) {
        if !self.adv.enabled || epoch != self.adv.epoch {
            trace!("[adv] ignoring stale completion");
            return;
        }
        let Some(id) = self.adv.sched_id else {
            return;
        };
        self.sched.finish(id);

        let now = self.timer.now();
        if self.adv.chan == self.adv.final_chan() {
            self.adv.chan = self.adv.first_chan();
            self.adv.next_event(&mut self.rng);
            while self.adv.pdu_start.sub_micros(XCVR_TX_SCHED_DELAY_USECS).is_before(now) {
                self.adv.next_event(&mut self.rng);
            }
        } else {
            self.adv.chan = self.adv.next_chan();
            self.adv.pdu_start = now.add_micros(XCVR_TX_SCHED_DELAY_USECS);
        }

        if self.adv_hd_expired(q) {
            return;
        }

        self.adv_chk_rpa(now);

        for _ in 0..ADV_RESCHEDULE_MAX_ATTEMPTS {
            let (start, end) = self.adv.sched_window();
            match self.sched.reschedule(id, start, end, now) {
                Ok(()) => return,
                Err(SchedError::InPast | SchedError::Conflict) => {
                    // Give up the rest of this event.
                    self.adv.chan = self.adv.first_chan();
                    self.adv.next_event(&mut self.rng);
                    if self.adv_hd_expired(q) {
                        return;
                    }
                }
                Err(e) => {
                    error!("[adv] schedule item lost: {:?}", e);
                    self.adv_disable();
                    return;
                }
            }
        }

        warn!("[adv] no room in schedule, retrying");
        self.stats.adv_resched_fail += 1;
        self.adv.chan = self.adv.final_chan();
        let epoch = self.adv.epoch;
        self.post(q, LlEvent::AdvEventDone { epoch });
    }

    /// Stop high duty cycle directed advertising once its time is up.
    fn adv_hd_expired(&mut self, q: &Queues<'_, 'd, C::Mutex>) -> bool {
        if self.adv.adv_type != AdvKind::AdvDirectIndHigh || self.adv.pdu_start.is_before(self.adv.hd_end) {
            return false;
        }
        info!("[adv] directed advertising timeout");
        self.adv_disable();
        self.notify(q, HostEvent::DirectedAdvertisingTimeout);
        true
    }

    /// Generate new resolvable private addresses when the RPA timeout passed.
    fn adv_chk_rpa(&mut self, now: Ticks) {
        if !uses_rpa(self.adv.own_addr) {
            return;
        }
        self.adv.rpa_elapsed_us += now.raw().wrapping_sub(self.adv.rpa_last.raw()) as u64;
        self.adv.rpa_last = now;
        if !self.adv.rpa_force && self.adv.rpa_elapsed_us < self.resolv.rpa_timeout().as_micros() {
            return;
        }
        self.adv.rpa_force = false;
        self.adv.rpa_elapsed_us = 0;

        let peer = self.adv.peer;
        match self.resolv.gen_rpa(&peer, true, &mut self.rng) {
            Some(rpa) => {
                self.adv.adva = rpa;
                self.adv.tx_add = true;
            }
            None => {
                let (addr, random) = self.own_identity();
                self.adv.adva = addr;
                self.adv.tx_add = random;
            }
        }
        if is_directed(self.adv.adv_type) {
            match self.resolv.gen_rpa(&peer, false, &mut self.rng) {
                Some(rpa) => {
                    self.adv.inita = rpa;
                    self.adv.rx_add = true;
                }
                None => {
                    self.adv.inita = peer.addr;
                    self.adv.rx_add = peer.is_random();
                }
            }
        }
        debug!("[adv] advertiser address {:?}", self.adv.adva);
    }
}
