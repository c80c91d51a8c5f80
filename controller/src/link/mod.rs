//! The link layer.
//!
//! [`LinkLayer`] owns all controller state behind one blocking mutex. It is driven from three
//! places:
//!
//! - the radio and timer interrupt handlers, through [`LinkLayer::on_radio_event`] and
//!   [`LinkLayer::on_alarm`];
//! - the link layer task, through [`LinkLayer::run`] or [`LinkLayer::poll`];
//! - the host, through the command methods.
//!
//! Interrupt handlers never block. Work that does not fit in interrupt context is posted to an
//! event queue and finished by the task.
use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::{Channel, TrySendError};

pub mod address;
pub mod adv;
pub mod conn;
pub mod pdu;
pub mod resolv;
pub mod whitelist;

use address::{is_valid_random_address, Address, AddrKind, BdAddr};
use adv::{AdvParams, Advertiser};
use conn::{Connection, ConnectionManager};
use resolv::ResolvingList;
use whitelist::Whitelist;

use crate::config::{
    Config, ControllerConfig, EVENT_QUEUE_SIZE, HOST_EVENT_QUEUE_SIZE, MAX_CONNECTIONS, RESOLVING_LIST_SIZE,
    SCHED_MAX_ITEMS, WHITELIST_SIZE,
};
use crate::event::{HostEvent, LlEvent};
use crate::phy::{Phy, PhyState, PhyStats};
use crate::pool::Pool;
use crate::sched::{SchedKind, Scheduler};
use crate::time::{Alarm, Timer};
use crate::{Error, Param};

/// Link layer state.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlState {
    Standby,
    /// An advertising PDU owns the radio.
    Advertising,
    /// At least one connection is open and the radio is not advertising.
    Connection,
}

/// Link layer statistics.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LlStats {
    /// Advertising PDUs handed to the radio.
    pub adv_txg: u32,
    /// Scan responses handed to the radio.
    pub scan_rsp_txg: u32,
    /// Advertising PDUs skipped because their start time had passed.
    pub adv_late_starts: u32,
    /// Advertising events that found no free schedule window.
    pub adv_resched_fail: u32,
    /// Packets not sent or received for lack of pool blocks.
    pub no_bufs: u32,
    /// Link layer events that found the event queue full.
    pub evq_full: u32,
    /// Host events dropped on a full queue.
    pub host_evq_full: u32,
}

/// Hardware events reported by the radio interrupt handler.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    /// A transmission ended.
    TxEnd,
    /// The access address and PDU header of a reception arrived.
    RxStart,
    /// A reception ended.
    RxEnd,
}

/// The queues leaving the locked state.
pub(crate) struct Queues<'q, 'd, M: RawMutex> {
    pub(crate) events: &'q Channel<M, LlEvent<'d>, EVENT_QUEUE_SIZE>,
    pub(crate) host: &'q Channel<M, HostEvent, HOST_EVENT_QUEUE_SIZE>,
}

pub(crate) struct Inner<'d, C: Config> {
    phy: Phy<C::Radio>,
    timer: C::Timer,
    rng: C::Rng,
    pool: &'d dyn Pool,
    sched: Scheduler<SCHED_MAX_ITEMS>,
    adv: Advertiser,
    conns: ConnectionManager<MAX_CONNECTIONS>,
    whitelist: Whitelist<WHITELIST_SIZE>,
    resolv: ResolvingList<RESOLVING_LIST_SIZE>,
    state: LlState,
    stats: LlStats,
    public_addr: BdAddr,
    random_addr: Option<BdAddr>,
    privacy: bool,
    /// Epoch of an advertising completion that found the event queue full.
    pending_done: Option<u32>,
}

impl<'d, C: Config> Inner<'d, C> {
    /// State to return to when the radio is released.
    fn idle_state(&self) -> LlState {
        if self.conns.is_empty() {
            LlState::Standby
        } else {
            LlState::Connection
        }
    }

    /// Queue work for the task. A completion that does not fit is kept and posted again once
    /// the task frees a slot; other events are dropped.
    fn post(&mut self, q: &Queues<'_, 'd, C::Mutex>, event: LlEvent<'d>) {
        if let Err(TrySendError::Full(event)) = q.events.try_send(event) {
            self.stats.evq_full += 1;
            match event {
                LlEvent::AdvEventDone { epoch } => {
                    warn!("[link] event queue full, deferring completion");
                    self.pending_done = Some(epoch);
                }
                _ => warn!("[link] event queue full"),
            }
        }
    }

    fn notify(&mut self, q: &Queues<'_, 'd, C::Mutex>, event: HostEvent) {
        if q.host.try_send(event).is_err() {
            warn!("[link] host event queue full, dropping {:?}", event);
            self.stats.host_evq_full += 1;
        }
    }

    /// Arm the scheduler alarm for the next item.
    fn refresh_alarm(&mut self) {
        match self.sched.next_start() {
            Some(at) => self.timer.set_alarm(Alarm::Scheduler, at),
            None => self.timer.clear_alarm(Alarm::Scheduler),
        }
    }

    /// The PHY stopped without a completion while advertising.
    fn radio_lost(&mut self, q: &Queues<'_, 'd, C::Mutex>) {
        if self.state == LlState::Advertising && self.phy.state() == PhyState::Idle {
            self.adv_tx_done(q);
        }
    }

    fn radio_event(&mut self, event: RadioEvent, q: &Queues<'_, 'd, C::Mutex>) {
        let now = self.timer.now();
        match event {
            RadioEvent::TxEnd => {
                let end = self.phy.on_tx_end(now);
                if let Some(deadline) = end.wfr_deadline {
                    self.timer.set_alarm(Alarm::WaitForResponse, deadline);
                }
                if end.notify && self.state == LlState::Advertising {
                    self.adv_tx_done(q);
                }
            }
            RadioEvent::RxStart => match self.phy.on_rx_start(now) {
                Some(start) if self.state == LlState::Advertising => self.adv_rx_isr_start(&start, q),
                Some(_) => self.phy.reject_rx(),
                None => self.radio_lost(q),
            },
            RadioEvent::RxEnd => match self.phy.on_rx_end() {
                Some(info) if self.state == LlState::Advertising => self.adv_rx_isr_end(info, q),
                Some(_) => self.phy.disable(),
                None => self.radio_lost(q),
            },
        }
    }

    fn alarm(&mut self, alarm: Alarm, q: &Queues<'_, 'd, C::Mutex>) {
        match alarm {
            Alarm::Scheduler => {
                let now = self.timer.now();
                if let Some((id, item)) = self.sched.pop_expired(now) {
                    match item.kind {
                        SchedKind::Advertising => self.adv_tx_start(id, item, q),
                        kind => {
                            warn!("[link] no handler for {:?}", kind);
                            self.sched.finish(id);
                        }
                    }
                }
            }
            Alarm::WaitForResponse => {
                if self.phy.on_wfr_expired() && self.state == LlState::Advertising {
                    self.adv_tx_done(q);
                }
            }
        }
    }

    fn process(&mut self, event: LlEvent<'d>, q: &Queues<'_, 'd, C::Mutex>) {
        match event {
            LlEvent::AdvEventDone { epoch } => self.adv_event_done(epoch, q),
            LlEvent::RxPdu { packet, epoch } => self.adv_rx_pkt_in(packet, epoch, q),
        }
        if let Some(epoch) = self.pending_done.take() {
            self.post(q, LlEvent::AdvEventDone { epoch });
        }
    }

    /// Resolving list changes are not allowed while it is used on air.
    fn resolv_change_allowed(&self) -> Result<(), Error> {
        if self.resolv.is_enabled() && self.adv.is_enabled() {
            Err(Error::CommandDisallowed)
        } else {
            Ok(())
        }
    }
}

/// Whitelist and resolving list entries carry identity addresses only.
fn identity_kind(addr: &Address) -> Result<bool, Error> {
    if addr.kind == AddrKind::PUBLIC {
        Ok(false)
    } else if addr.kind == AddrKind::RANDOM {
        Ok(true)
    } else {
        Err(Error::InvalidParams(Param::PeerAddressType))
    }
}

/// A BLE link layer controller.
pub struct LinkLayer<'d, C: Config> {
    inner: Mutex<C::Mutex, RefCell<Inner<'d, C>>>,
    events: Channel<C::Mutex, LlEvent<'d>, EVENT_QUEUE_SIZE>,
    host_events: Channel<C::Mutex, HostEvent, HOST_EVENT_QUEUE_SIZE>,
}

impl<'d, C: Config> LinkLayer<'d, C> {
    /// Create a link layer in standby.
    ///
    /// `pool` supplies the packet buffers for every PDU sent or received.
    pub fn new(config: ControllerConfig, radio: C::Radio, timer: C::Timer, rng: C::Rng, pool: &'d dyn Pool) -> Self {
        let mut phy = Phy::new(radio);
        let power = phy.set_tx_power(config.tx_power);
        info!("[link] public address {:?}, tx power {} dBm", config.public_address, power);
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                phy,
                timer,
                rng,
                pool,
                sched: Scheduler::new(),
                adv: Advertiser::new(),
                conns: ConnectionManager::new(),
                whitelist: Whitelist::new(),
                resolv: ResolvingList::new(),
                state: LlState::Standby,
                stats: LlStats::default(),
                public_addr: config.public_address,
                random_addr: None,
                privacy: config.privacy,
                pending_done: None,
            })),
            events: Channel::new(),
            host_events: Channel::new(),
        }
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut Inner<'d, C>, &Queues<'_, 'd, C::Mutex>) -> R) -> R {
        let q = Queues {
            events: &self.events,
            host: &self.host_events,
        };
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let r = f(&mut inner, &q);
            inner.refresh_alarm();
            r
        })
    }

    fn with<R>(&self, f: impl FnOnce(&Inner<'d, C>) -> R) -> R {
        self.inner.lock(|inner| f(&inner.borrow()))
    }

    // Interrupt entry points

    /// Handle a radio interrupt.
    pub fn on_radio_event(&self, event: RadioEvent) {
        self.with_mut(|inner, q| inner.radio_event(event, q))
    }

    /// Handle an expired alarm.
    pub fn on_alarm(&self, alarm: Alarm) {
        self.with_mut(|inner, q| inner.alarm(alarm, q))
    }

    /// Access the radio, for example to acknowledge its interrupt.
    pub fn with_radio<R>(&self, f: impl FnOnce(&mut C::Radio) -> R) -> R {
        self.inner.lock(|inner| f(inner.borrow_mut().phy.radio_mut()))
    }

    // Task entry points

    /// Run the link layer task. Never returns.
    pub async fn run(&self) {
        loop {
            let event = self.events.receive().await;
            self.with_mut(|inner, q| inner.process(event, q));
        }
    }

    /// Process all pending link layer events without waiting. Returns the number processed.
    pub fn poll(&self) -> usize {
        let mut n = 0;
        while let Ok(event) = self.events.try_receive() {
            self.with_mut(|inner, q| inner.process(event, q));
            n += 1;
        }
        n
    }

    /// Wait for the next event for the host.
    pub async fn next_host_event(&self) -> HostEvent {
        self.host_events.receive().await
    }

    /// Take the next event for the host, if any.
    pub fn try_host_event(&self) -> Option<HostEvent> {
        self.host_events.try_receive().ok()
    }

    // Advertising

    /// LE Set Advertising Parameters.
    pub fn set_advertising_parameters(&self, params: &AdvParams) -> Result<(), Error> {
        self.with_mut(|inner, _| {
            let privacy = inner.privacy;
            inner.adv.set_params(params, privacy)
        })
    }

    /// LE Set Advertising Data.
    pub fn set_advertising_data(&self, data: &[u8]) -> Result<(), Error> {
        self.with_mut(|inner, _| inner.adv.set_adv_data(data))
    }

    /// LE Set Scan Response Data.
    pub fn set_scan_response_data(&self, data: &[u8]) -> Result<(), Error> {
        self.with_mut(|inner, _| inner.adv.set_scan_rsp_data(data))
    }

    /// LE Set Advertising Enable. Enabling while already advertising is disallowed; disabling twice
    /// has no effect.
    pub fn set_advertising_enable(&self, enable: bool) -> Result<(), Error> {
        self.with_mut(|inner, _| {
            if enable {
                inner.adv_enable()
            } else {
                inner.adv_disable();
                Ok(())
            }
        })
    }

    /// LE Read Advertising Physical Channel Tx Power, in dBm.
    pub fn read_advertising_tx_power(&self) -> i8 {
        self.with(|inner| inner.phy.tx_power())
    }

    /// LE Set Random Address.
    pub fn set_random_address(&self, addr: BdAddr) -> Result<(), Error> {
        self.with_mut(|inner, _| {
            if inner.adv.is_enabled() {
                return Err(Error::CommandDisallowed);
            }
            if !is_valid_random_address(&addr) {
                return Err(Error::InvalidParams(Param::Address));
            }
            inner.random_addr = Some(addr);
            Ok(())
        })
    }

    // Whitelist

    pub fn whitelist_add(&self, addr: Address) -> Result<(), Error> {
        let random = identity_kind(&addr)?;
        self.with_mut(|inner, _| {
            if !inner.adv.can_change_whitelist() {
                return Err(Error::CommandDisallowed);
            }
            inner.whitelist.add(addr.addr, random)
        })
    }

    /// Remove a device. Removing a device not on the list has no effect.
    pub fn whitelist_remove(&self, addr: Address) -> Result<(), Error> {
        let random = identity_kind(&addr)?;
        self.with_mut(|inner, _| {
            if !inner.adv.can_change_whitelist() {
                return Err(Error::CommandDisallowed);
            }
            inner.whitelist.remove(addr.addr, random);
            Ok(())
        })
    }

    pub fn whitelist_clear(&self) -> Result<(), Error> {
        self.with_mut(|inner, _| {
            if !inner.adv.can_change_whitelist() {
                return Err(Error::CommandDisallowed);
            }
            inner.whitelist.clear();
            Ok(())
        })
    }

    /// Number of devices the whitelist can hold.
    pub fn whitelist_size(&self) -> usize {
        self.with(|inner| inner.whitelist.capacity())
    }

    // Resolving list

    /// Add a device by identity address and IRKs. A zero IRK disables privacy in that direction.
    pub fn resolving_list_add(&self, identity: Address, peer_irk: [u8; 16], local_irk: [u8; 16]) -> Result<(), Error> {
        self.with_mut(|inner, _| {
            inner.resolv_change_allowed()?;
            inner.resolv.add(identity, peer_irk, local_irk)
        })
    }

    pub fn resolving_list_remove(&self, identity: &Address) -> Result<(), Error> {
        self.with_mut(|inner, _| {
            inner.resolv_change_allowed()?;
            inner.resolv.remove(identity)
        })
    }

    pub fn resolving_list_clear(&self) -> Result<(), Error> {
        self.with_mut(|inner, _| {
            inner.resolv_change_allowed()?;
            inner.resolv.clear();
            Ok(())
        })
    }

    /// Number of devices the resolving list can hold.
    pub fn resolving_list_size(&self) -> usize {
        self.with(|inner| inner.resolv.capacity())
    }

    /// LE Set Address Resolution Enable.
    pub fn set_address_resolution_enable(&self, enable: bool) -> Result<(), Error> {
        self.with_mut(|inner, _| {
            if inner.adv.is_enabled() {
                return Err(Error::CommandDisallowed);
            }
            inner.resolv.set_enabled(enable);
            Ok(())
        })
    }

    /// LE Set Resolvable Private Address Timeout, in seconds.
    pub fn set_rpa_timeout(&self, secs: u16) -> Result<(), Error> {
        self.with_mut(|inner, _| inner.resolv.set_rpa_timeout(secs))
    }

    /// LE Read Local Resolvable Address for the device `identity`.
    pub fn read_local_rpa(&self, identity: &Address) -> Result<Option<BdAddr>, Error> {
        self.with(|inner| {
            inner.resolv.find(identity).ok_or(Error::UnknownConnection)?;
            Ok(inner.resolv.local_rpa(identity))
        })
    }

    /// LE Read Peer Resolvable Address of the device `identity`.
    pub fn read_peer_rpa(&self, identity: &Address) -> Result<Option<BdAddr>, Error> {
        self.with(|inner| {
            inner.resolv.find(identity).ok_or(Error::UnknownConnection)?;
            Ok(inner.resolv.peer_rpa(identity))
        })
    }

    /// Resolvable private address the advertiser is currently sending.
    pub fn adv_local_rpa(&self) -> Option<BdAddr> {
        self.with(|inner| inner.adv.local_rpa())
    }

    /// Resolvable private address of the last peer that connected to the advertiser.
    pub fn adv_peer_rpa(&self) -> Option<BdAddr> {
        self.with(|inner| inner.adv.peer_rpa())
    }

    // Connections

    pub fn connection(&self, handle: u16) -> Option<Connection> {
        self.with(|inner| inner.conns.get(handle).copied())
    }

    /// Disconnect. Reports [`HostEvent::DisconnectionComplete`].
    pub fn disconnect(&self, handle: u16, reason: u8) -> Result<(), Error> {
        self.with_mut(|inner, q| {
            inner.conns.disconnect(handle)?;
            info!("[link] connection {} closed, reason {:#x}", handle, reason);
            if inner.state != LlState::Advertising {
                inner.state = inner.idle_state();
            }
            inner.notify(q, HostEvent::DisconnectionComplete { handle, reason });
            Ok(())
        })
    }

    // Status

    /// Return to standby and forget all configuration except the public address.
    pub fn reset(&self) {
        self.with_mut(|inner, q| {
            inner.adv_disable();
            inner.sched.clear();
            inner.adv = Advertiser::new();
            inner.conns.clear();
            inner.whitelist.clear();
            inner.resolv = ResolvingList::new();
            inner.phy.reset();
            inner.state = LlState::Standby;
            inner.random_addr = None;
            inner.stats = LlStats::default();
            inner.pending_done = None;
            inner.timer.clear_alarm(Alarm::WaitForResponse);
            while q.events.try_receive().is_ok() {}
            while q.host.try_receive().is_ok() {}
        });
        info!("[link] reset");
    }

    pub fn state(&self) -> LlState {
        self.with(|inner| inner.state)
    }

    pub fn stats(&self) -> LlStats {
        self.with(|inner| inner.stats)
    }

    pub fn phy_stats(&self) -> PhyStats {
        self.with(|inner| inner.phy.stats())
    }
}
