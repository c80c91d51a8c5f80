//! Physical layer driver.
//!
//! [`Phy`] owns the [`Radio`] and implements the link layer's view of it: channel selection,
//! transmit and receive arming with optional scheduled start, the transmit to receive turnaround,
//! encryption and address resolution offload, and the bookkeeping done in the radio interrupt.
//!
//! Interrupt handling does not call back into the link layer. Each `on_*` handler updates the
//! PHY state and returns what happened, and the caller decides what to do next.

use crate::pool::Packet;
use crate::time::Ticks;

/// Access address used on the advertising channels.
pub const ADV_ACCESS_ADDRESS: u32 = 0x8E89_BED6;

/// CRC initialization value used on the advertising channels.
pub const ADV_CRC_INIT: u32 = 0x55_5555;

/// CRC polynomial `x^24 + x^10 + x^9 + x^6 + x^4 + x^3 + x + 1`, with the `x^24` term implied.
pub const CRC_POLY: u32 = 0x00_065B;

/// Number of RF channels.
pub const NUM_CHANNELS: u8 = 40;

/// First advertising channel index.
pub const ADV_CHANNEL_FIRST: u8 = 37;

/// Inter frame space in microseconds.
pub const T_IFS_USECS: u32 = 150;

/// Time from a scheduled radio event to the start of the transmission, covering radio ramp up.
pub const XCVR_TX_START_DELAY_USECS: u32 = 140;

/// Interrupt and processing latency budgeted before a radio event.
pub const XCVR_PROC_DELAY_USECS: u32 = 100;

/// Lead time needed between deciding to transmit and the scheduled transmission.
pub const XCVR_TX_SCHED_DELAY_USECS: u32 = XCVR_TX_START_DELAY_USECS + XCVR_PROC_DELAY_USECS;

/// Time allowed after the inter frame space for the access address of a response to arrive.
pub const WFR_MARGIN_USECS: u32 = 40 + 32;

/// Largest PDU, including the two byte header.
pub const MAX_PDU_LEN: usize = 2 + 255;

/// Largest payload the CCM engine accepts.
pub const MAX_ENCRYPTED_PAYLOAD: usize = 27;

/// Largest unencrypted data channel payload.
pub const MAX_DATA_PAYLOAD: usize = 251;

/// Air time in microseconds of a PDU with `payload_len` bytes on the 1M PHY.
///
/// Preamble (1), access address (4), header (2) and CRC (3) are included.
pub const fn tx_duration_usecs(payload_len: usize) -> u32 {
    ((payload_len + 10) * 8) as u32
}

/// RF center frequency in MHz of channel `chan`, or `None` if it does not exist.
pub const fn channel_freq_mhz(chan: u8) -> Option<u16> {
    match chan {
        0..=10 => Some(2404 + 2 * chan as u16),
        11..=36 => Some(2404 + 2 * (chan as u16 + 1)),
        37 => Some(2402),
        38 => Some(2426),
        39 => Some(2480),
        _ => None,
    }
}

/// Returns `true` for the three primary advertising channels.
pub const fn is_adv_channel(chan: u8) -> bool {
    chan >= ADV_CHANNEL_FIRST && chan < NUM_CHANNELS
}

/// Driver state.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyState {
    Idle,
    Rx,
    Tx,
}

/// What the radio does after a transmission ends.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Go idle.
    None,
    /// Turn around and listen for a response one inter frame space later.
    TxRx,
}

/// Hardware radio state.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Disabled,
    Rx,
    Tx,
}

/// Flags describing a received PDU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxFlags(u8);

bitflags::bitflags! {
    impl RxFlags: u8 {
        const CRC_OK = 1 << 0;
        const MIC_FAILURE = 1 << 1;
        /// The sender passed address and filter policy checks.
        const DEVMATCH = 1 << 2;
        /// A scan response was transmitted for this PDU.
        const SCAN_RSP_TXD = 1 << 3;
        /// The sender address was resolved with the resolving list.
        const RESOLVED = 1 << 4;
    }
}

/// Reception details attached to every received PDU.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxInfo {
    pub flags: RxFlags,
    pub channel: u8,
    pub rssi: i8,
    /// Tick at which the access address was received.
    pub start: Ticks,
    /// Resolving list index matched by the address resolution engine.
    pub resolved: Option<u8>,
}

/// Radio programming for a channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub channel: u8,
    pub freq_mhz: u16,
    pub access_address: u32,
    pub crc_init: u32,
    /// Data whitening seed.
    pub whitening_iv: u8,
}

/// CCM encryption parameters.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcmParams {
    /// Session key.
    pub key: [u8; 16],
    /// Initialization vector.
    pub iv: [u8; 8],
    /// Packet counter, 39 bits.
    pub pkt_counter: u64,
    /// Direction bit.
    pub master_to_slave: bool,
}

/// Result of the hardware reception.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RadioRxStatus {
    pub crc_ok: bool,
    pub rssi: i8,
    /// Only meaningful with encryption enabled.
    pub mic_ok: bool,
    /// Matching IRK index when address resolution is enabled.
    pub resolved: Option<u8>,
}

/// Trait for radio hardware.
///
/// The implementation programs the transceiver and reports hardware events to
/// [`LinkLayer::on_radio_event`](crate::link::LinkLayer::on_radio_event) from its interrupt
/// handler.
pub trait Radio {
    /// Lowest supported transmit power in dBm.
    const MIN_TX_POWER: i8;
    /// Highest supported transmit power in dBm.
    const MAX_TX_POWER: i8;

    /// Current hardware state.
    fn state(&self) -> RadioState;

    /// Program frequency, whitening, access address and CRC init.
    fn configure(&mut self, config: &ChannelConfig);

    /// Set transmit power. The value is within the supported range.
    fn set_tx_power(&mut self, dbm: i8);

    /// Transmit `pdu` (header and payload). Starts at `at`, or one inter frame space after the
    /// current reception when `None`. With `then_rx` the radio enters receive after the
    /// transmission ends.
    fn start_tx(&mut self, pdu: &[u8], at: Option<Ticks>, then_rx: bool);

    /// Start receiving at `at`, or immediately when `None`.
    fn start_rx(&mut self, at: Option<Ticks>);

    /// Stop any ongoing activity.
    fn disable(&mut self);

    /// Bytes received so far, starting with the PDU header.
    fn rx_buffer(&self) -> &[u8];

    /// Outcome of the last completed reception.
    fn rx_status(&self) -> RadioRxStatus;

    /// Enable CCM on transmitted and received PDUs, or disable it with `None`.
    fn set_encryption(&mut self, ccm: Option<&CcmParams>);

    /// Enable resolution of received addresses against `irks`, or disable it with `None`.
    fn set_address_resolution(&mut self, irks: Option<&[[u8; 16]]>);
}

/// PHY errors.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyError {
    InvalidParam,
    /// Radio is not idle.
    Busy,
    /// Scheduled transmit time already passed, or the radio was still transmitting.
    TxLate,
    /// Scheduled receive time already passed.
    RxLate,
    /// Encryption and address resolution cannot be enabled together.
    OffloadConflict,
}

/// PHY statistics.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PhyStats {
    pub phy_isrs: u32,
    pub tx_good: u32,
    pub tx_fail: u32,
    pub tx_late: u32,
    pub tx_bytes: u32,
    pub rx_starts: u32,
    pub rx_aborts: u32,
    pub rx_valid: u32,
    pub rx_crc_err: u32,
    pub rx_late: u32,
    pub radio_state_errs: u32,
    pub rx_hw_err: u32,
    pub tx_hw_err: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offload {
    None,
    Encrypt(CcmParams),
    Resolve,
}

/// Outcome of a transmit end interrupt.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxEnd {
    /// The link layer asked to be told about the end of this transmission.
    pub notify: bool,
    /// The PHY is now listening; a response must start before this deadline.
    pub wfr_deadline: Option<Ticks>,
}

/// Header of a PDU whose reception just started.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxStart {
    pub header: u8,
    pub len: u8,
    pub channel: u8,
}

impl RxStart {
    pub const fn pdu_type(&self) -> u8 {
        self.header & 0x0F
    }
}

/// The PHY driver.
pub struct Phy<R: Radio> {
    radio: R,
    state: PhyState,
    channel: u8,
    access_address: u32,
    crc_init: u32,
    transition: Transition,
    offload: Offload,
    rx_started: bool,
    txend_notify: bool,
    tx_at: Option<Ticks>,
    rx_at: Option<Ticks>,
    tx_len: usize,
    tx_power: i8,
    tx_buf: [u8; MAX_PDU_LEN],
    rx_info: RxInfo,
    stats: PhyStats,
}

impl<R: Radio> Phy<R> {
    /// Create the driver. The radio is disabled.
    pub fn new(mut radio: R) -> Self {
        radio.disable();
        radio.set_encryption(None);
        radio.set_address_resolution(None);
        Self {
            radio,
            state: PhyState::Idle,
            channel: ADV_CHANNEL_FIRST,
            access_address: ADV_ACCESS_ADDRESS,
            crc_init: ADV_CRC_INIT,
            transition: Transition::None,
            offload: Offload::None,
            rx_started: false,
            txend_notify: false,
            tx_at: None,
            rx_at: None,
            tx_len: 0,
            tx_power: 0,
            tx_buf: [0; MAX_PDU_LEN],
            rx_info: RxInfo::default(),
            stats: PhyStats::default(),
        }
    }

    /// Return the driver to its initial state, keeping statistics.
    pub fn reset(&mut self) {
        self.disable();
        self.encrypt_disable();
        self.resolv_list_disable();
        self.rx_info = RxInfo::default();
    }

    pub fn state(&self) -> PhyState {
        self.state
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn access_address(&self) -> u32 {
        self.access_address
    }

    pub fn stats(&self) -> PhyStats {
        self.stats
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Select the channel for the next operation.
    ///
    /// Advertising channels always use the advertising access address and CRC init.
    pub fn set_channel(&mut self, chan: u8, access_address: u32, crc_init: u32) -> Result<(), PhyError> {
        let freq_mhz = channel_freq_mhz(chan).ok_or(PhyError::InvalidParam)?;
        let (access_address, crc_init) = if is_adv_channel(chan) {
            (ADV_ACCESS_ADDRESS, ADV_CRC_INIT)
        } else {
            (access_address, crc_init & 0x00FF_FFFF)
        };
        self.channel = chan;
        self.access_address = access_address;
        self.crc_init = crc_init;
        self.radio.configure(&ChannelConfig {
            channel: chan,
            freq_mhz,
            access_address,
            crc_init,
            whitening_iv: chan,
        });
        Ok(())
    }

    /// Start the next transmission at `at`.
    pub fn set_tx_start(&mut self, at: Ticks, now: Ticks) -> Result<(), PhyError> {
        if !at.is_after(now) {
            self.stats.tx_late += 1;
            self.disable();
            return Err(PhyError::TxLate);
        }
        self.tx_at = Some(at);
        Ok(())
    }

    /// Start the next reception at `at`.
    pub fn set_rx_start(&mut self, at: Ticks, now: Ticks) -> Result<(), PhyError> {
        if !at.is_after(now) {
            self.stats.rx_late += 1;
            self.disable();
            return Err(PhyError::RxLate);
        }
        self.rx_at = Some(at);
        Ok(())
    }

    /// Ask for [`TxEnd::notify`] on the end of the next transmission.
    pub fn set_txend_notify(&mut self, notify: bool) {
        self.txend_notify = notify;
    }

    /// Transmit `packet` using the header byte stored in its metadata.
    pub fn transmit(&mut self, packet: &Packet<'_>, transition: Transition) -> Result<(), PhyError> {
        if self.radio.state() == RadioState::Tx {
            self.disable();
            self.stats.tx_late += 1;
            return Err(PhyError::TxLate);
        }
        if self.state != PhyState::Idle {
            self.disable();
            self.stats.radio_state_errs += 1;
            return Err(PhyError::Busy);
        }

        let len = packet.len();
        let max = match self.offload {
            Offload::Encrypt(_) => MAX_ENCRYPTED_PAYLOAD,
            _ => MAX_PDU_LEN - 2,
        };
        if len > max {
            self.stats.tx_fail += 1;
            return Err(PhyError::InvalidParam);
        }

        self.tx_buf[0] = packet.meta.tx_header;
        self.tx_buf[1] = len as u8;
        if packet.copy_to(0, &mut self.tx_buf[2..2 + len]).is_err() {
            self.stats.tx_fail += 1;
            return Err(PhyError::InvalidParam);
        }

        if let Offload::Encrypt(ccm) = &self.offload {
            self.radio.set_encryption(Some(ccm));
        }

        self.tx_len = len + 2;
        self.transition = transition;
        self.state = PhyState::Tx;
        self.radio
            .start_tx(&self.tx_buf[..self.tx_len], self.tx_at.take(), transition == Transition::TxRx);
        trace!("[phy] tx chan {} len {}", self.channel, len);
        Ok(())
    }

    /// Start listening.
    pub fn receive(&mut self) -> Result<(), PhyError> {
        if self.state != PhyState::Idle || self.radio.state() != RadioState::Disabled {
            self.disable();
            self.stats.radio_state_errs += 1;
            return Err(PhyError::Busy);
        }
        self.state = PhyState::Rx;
        self.rx_started = false;
        self.radio.start_rx(self.rx_at.take());
        Ok(())
    }

    /// Stop the radio and go idle.
    pub fn disable(&mut self) {
        self.radio.disable();
        self.state = PhyState::Idle;
        self.transition = Transition::None;
        self.rx_started = false;
        self.txend_notify = false;
        self.tx_at = None;
        self.rx_at = None;
    }

    /// Handle the end of a transmission.
    pub fn on_tx_end(&mut self, now: Ticks) -> TxEnd {
        self.stats.phy_isrs += 1;
        if self.state != PhyState::Tx {
            self.stats.radio_state_errs += 1;
            return TxEnd::default();
        }

        self.stats.tx_good += 1;
        self.stats.tx_bytes += self.tx_len as u32;

        let notify = core::mem::take(&mut self.txend_notify);
        match core::mem::replace(&mut self.transition, Transition::None) {
            Transition::TxRx => {
                self.state = PhyState::Rx;
                self.rx_started = false;
                TxEnd {
                    notify,
                    wfr_deadline: Some(now.add_micros(T_IFS_USECS + WFR_MARGIN_USECS)),
                }
            }
            Transition::None => {
                self.state = PhyState::Idle;
                TxEnd {
                    notify,
                    wfr_deadline: None,
                }
            }
        }
    }

    /// Handle the reception of an access address and PDU header.
    pub fn on_rx_start(&mut self, now: Ticks) -> Option<RxStart> {
        self.stats.phy_isrs += 1;
        self.stats.rx_starts += 1;
        if self.state != PhyState::Rx || self.rx_started {
            self.stats.radio_state_errs += 1;
            return None;
        }
        let buf = self.radio.rx_buffer();
        if buf.len() < 2 {
            self.stats.rx_hw_err += 1;
            self.disable();
            return None;
        }
        self.rx_info = RxInfo {
            flags: RxFlags::empty(),
            channel: self.channel,
            rssi: 0,
            start: now,
            resolved: None,
        };
        Some(RxStart {
            header: buf[0],
            len: buf[1],
            channel: self.channel,
        })
    }

    /// Continue the reception reported by [`Phy::on_rx_start`].
    pub fn accept_rx(&mut self) {
        self.rx_started = true;
    }

    /// Abort the reception reported by [`Phy::on_rx_start`].
    pub fn reject_rx(&mut self) {
        self.stats.rx_aborts += 1;
        self.disable();
    }

    /// Handle the end of a reception. The PHY is idle afterwards, ready to turn around.
    pub fn on_rx_end(&mut self) -> Option<RxInfo> {
        self.stats.phy_isrs += 1;
        if self.state != PhyState::Rx || !self.rx_started {
            self.stats.radio_state_errs += 1;
            return None;
        }
        let status = self.radio.rx_status();
        let mut info = self.rx_info;
        info.rssi = status.rssi;
        if status.crc_ok {
            self.stats.rx_valid += 1;
            info.flags.insert(RxFlags::CRC_OK);
            match self.offload {
                Offload::Encrypt(_) => {
                    if !status.mic_ok {
                        info.flags.insert(RxFlags::MIC_FAILURE);
                    }
                }
                Offload::Resolve => {
                    if let Some(idx) = status.resolved {
                        info.resolved = Some(idx);
                        info.flags.insert(RxFlags::RESOLVED);
                    }
                }
                Offload::None => {}
            }
        } else {
            self.stats.rx_crc_err += 1;
        }
        self.rx_info = info;
        self.rx_started = false;
        self.state = PhyState::Idle;
        Some(info)
    }

    /// The last received PDU, header included.
    pub fn rx_pdu(&self) -> &[u8] {
        let buf = self.radio.rx_buffer();
        if buf.len() < 2 {
            return &[];
        }
        let len = (2 + buf[1] as usize).min(buf.len());
        &buf[..len]
    }

    /// Handle expiry of the wait-for-response alarm.
    ///
    /// Returns `true` if the PHY was still waiting for a response and has been disabled.
    pub fn on_wfr_expired(&mut self) -> bool {
        if self.state == PhyState::Rx && !self.rx_started {
            self.disable();
            true
        } else {
            false
        }
    }

    pub fn encrypt_enable(&mut self, params: CcmParams) {
        self.offload = Offload::Encrypt(params);
        self.radio.set_address_resolution(None);
        self.radio.set_encryption(Some(&params));
    }

    /// Set the CCM packet counter and direction used for the next operation.
    pub fn encrypt_set_pkt_counter(&mut self, counter: u64, master_to_slave: bool) {
        if let Offload::Encrypt(ccm) = &mut self.offload {
            ccm.pkt_counter = counter & 0x7F_FFFF_FFFF;
            ccm.master_to_slave = master_to_slave;
        }
    }

    pub fn encrypt_disable(&mut self) {
        if let Offload::Encrypt(_) = self.offload {
            self.offload = Offload::None;
        }
        self.radio.set_encryption(None);
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.offload, Offload::Encrypt(_))
    }

    /// Resolve received addresses against `irks` in hardware.
    pub fn resolv_list_enable(&mut self, irks: &[[u8; 16]]) -> Result<(), PhyError> {
        if self.is_encrypted() {
            return Err(PhyError::OffloadConflict);
        }
        self.offload = Offload::Resolve;
        self.radio.set_address_resolution(Some(irks));
        Ok(())
    }

    pub fn resolv_list_disable(&mut self) {
        if let Offload::Resolve = self.offload {
            self.offload = Offload::None;
        }
        self.radio.set_address_resolution(None);
    }

    /// Largest data channel payload for the current offload configuration.
    pub fn max_data_payload(&self) -> usize {
        if self.is_encrypted() {
            MAX_ENCRYPTED_PAYLOAD
        } else {
            MAX_DATA_PAYLOAD
        }
    }

    /// Set the transmit power, railed to the radio range. Returns the applied power.
    pub fn set_tx_power(&mut self, dbm: i8) -> i8 {
        let dbm = dbm.clamp(R::MIN_TX_POWER, R::MAX_TX_POWER);
        self.tx_power = dbm;
        self.radio.set_tx_power(dbm);
        dbm
    }

    pub fn tx_power(&self) -> i8 {
        self.tx_power
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use heapless::Vec;

    use super::*;
    use crate::pool::PacketPool;

    #[derive(Default)]
    pub(crate) struct TestRadio {
        pub state: Option<RadioState>,
        pub config: Option<ChannelConfig>,
        pub sent: Vec<(u8, Vec<u8, 64>, Option<Ticks>, bool), 8>,
        pub rx: Vec<u8, 64>,
        pub status: RadioRxStatus,
        pub ccm: Option<CcmParams>,
        pub aar: bool,
        pub power: i8,
    }

    impl Radio for TestRadio {
        const MIN_TX_POWER: i8 = -40;
        const MAX_TX_POWER: i8 = 4;

        fn state(&self) -> RadioState {
            self.state.unwrap_or(RadioState::Disabled)
        }

        fn configure(&mut self, config: &ChannelConfig) {
            self.config = Some(*config);
        }

        fn set_tx_power(&mut self, dbm: i8) {
            self.power = dbm;
        }

        fn start_tx(&mut self, pdu: &[u8], at: Option<Ticks>, then_rx: bool) {
            let chan = self.config.map(|c| c.channel).unwrap_or(0);
            self.sent
                .push((chan, Vec::from_slice(pdu).unwrap(), at, then_rx))
                .unwrap();
            self.state = Some(RadioState::Tx);
        }

        fn start_rx(&mut self, _at: Option<Ticks>) {
            self.state = Some(RadioState::Rx);
        }

        fn disable(&mut self) {
            self.state = Some(RadioState::Disabled);
        }

        fn rx_buffer(&self) -> &[u8] {
            &self.rx
        }

        fn rx_status(&self) -> RadioRxStatus {
            self.status
        }

        fn set_encryption(&mut self, ccm: Option<&CcmParams>) {
            self.ccm = ccm.copied();
        }

        fn set_address_resolution(&mut self, irks: Option<&[[u8; 16]]>) {
            self.aar = irks.is_some();
        }
    }

    #[test]
    fn channel_table() {
        assert_eq!(channel_freq_mhz(0), Some(2404));
        assert_eq!(channel_freq_mhz(10), Some(2424));
        assert_eq!(channel_freq_mhz(11), Some(2428));
        assert_eq!(channel_freq_mhz(36), Some(2478));
        assert_eq!(channel_freq_mhz(37), Some(2402));
        assert_eq!(channel_freq_mhz(38), Some(2426));
        assert_eq!(channel_freq_mhz(39), Some(2480));
        assert_eq!(channel_freq_mhz(40), None);
    }

    #[test]
    fn advertising_channel_forces_access_address() {
        let mut phy = Phy::new(TestRadio::default());
        phy.set_channel(38, 0x1234_5678, 0xABCDEF).unwrap();
        let cfg = phy.radio().config.unwrap();
        assert_eq!(cfg.access_address, ADV_ACCESS_ADDRESS);
        assert_eq!(cfg.crc_init, ADV_CRC_INIT);
        assert_eq!(cfg.freq_mhz, 2426);
        assert_eq!(cfg.whitening_iv, 38);

        phy.set_channel(5, 0x1234_5678, 0xABCDEF).unwrap();
        assert_eq!(phy.radio().config.unwrap().access_address, 0x1234_5678);
        assert_eq!(phy.set_channel(40, 0, 0), Err(PhyError::InvalidParam));
        assert_eq!(phy.channel(), 5);
    }

    #[test]
    fn tx_then_rx_turnaround() {
        let pool: PacketPool<CriticalSectionRawMutex, 40, 2> = PacketPool::new();
        let mut phy = Phy::new(TestRadio::default());
        phy.set_channel(37, 0, 0).unwrap();
        let mut p = Packet::from_slice(&pool, &[1, 2, 3]).unwrap();
        p.meta.tx_header = 0x40;

        phy.set_tx_start(Ticks(1000), Ticks(900)).unwrap();
        phy.transmit(&p, Transition::TxRx).unwrap();
        assert_eq!(phy.state(), PhyState::Tx);
        let (chan, pdu, at, then_rx) = &phy.radio().sent[0];
        assert_eq!(*chan, 37);
        assert_eq!(pdu.as_slice(), &[0x40, 3, 1, 2, 3]);
        assert_eq!(*at, Some(Ticks(1000)));
        assert!(*then_rx);

        // Second transmit while the radio is busy is late.
        assert_eq!(phy.transmit(&p, Transition::None), Err(PhyError::TxLate));
        assert_eq!(phy.state(), PhyState::Idle);
        assert_eq!(phy.stats().tx_late, 1);

        phy.transmit(&p, Transition::TxRx).unwrap();
        let end = phy.on_tx_end(Ticks(2000));
        assert_eq!(end.wfr_deadline, Some(Ticks(2000 + T_IFS_USECS + WFR_MARGIN_USECS)));
        assert!(!end.notify);
        assert_eq!(phy.state(), PhyState::Rx);
        assert_eq!(phy.stats().tx_good, 1);

        assert!(phy.on_wfr_expired());
        assert_eq!(phy.state(), PhyState::Idle);
    }

    #[test]
    fn late_start_disables() {
        let mut phy = Phy::new(TestRadio::default());
        assert_eq!(phy.set_tx_start(Ticks(10), Ticks(10)), Err(PhyError::TxLate));
        assert_eq!(phy.set_rx_start(Ticks(5), Ticks(10)), Err(PhyError::RxLate));
        let stats = phy.stats();
        assert_eq!(stats.tx_late, 1);
        assert_eq!(stats.rx_late, 1);
        assert_eq!(phy.radio().state(), RadioState::Disabled);
    }

    #[test]
    fn receive_path() {
        let mut phy = Phy::new(TestRadio::default());
        phy.set_channel(39, 0, 0).unwrap();
        phy.receive().unwrap();
        assert_eq!(phy.receive(), Err(PhyError::Busy));
        assert_eq!(phy.stats().radio_state_errs, 1);

        phy.receive().unwrap();
        phy.radio_mut().rx = Vec::from_slice(&[0x03, 12, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]).unwrap();
        let start = phy.on_rx_start(Ticks(77)).unwrap();
        assert_eq!(start.pdu_type(), 3);
        assert_eq!(start.channel, 39);
        phy.accept_rx();
        phy.radio_mut().status = RadioRxStatus {
            crc_ok: true,
            rssi: -40,
            ..Default::default()
        };
        let info = phy.on_rx_end().unwrap();
        assert!(info.flags.contains(RxFlags::CRC_OK));
        assert_eq!(info.rssi, -40);
        assert_eq!(info.start, Ticks(77));
        assert_eq!(phy.rx_pdu().len(), 14);
        assert_eq!(phy.state(), PhyState::Idle);
        assert_eq!(phy.stats().rx_valid, 1);
    }

    #[test]
    fn offloads_are_exclusive() {
        let mut phy = Phy::new(TestRadio::default());
        phy.resolv_list_enable(&[[1; 16]]).unwrap();
        assert!(phy.radio().aar);
        phy.encrypt_enable(CcmParams {
            key: [0; 16],
            iv: [0; 8],
            pkt_counter: 0,
            master_to_slave: false,
        });
        assert!(!phy.radio().aar);
        assert_eq!(phy.resolv_list_enable(&[[1; 16]]), Err(PhyError::OffloadConflict));
        assert_eq!(phy.max_data_payload(), MAX_ENCRYPTED_PAYLOAD);
        phy.encrypt_disable();
        assert_eq!(phy.max_data_payload(), MAX_DATA_PAYLOAD);
        assert!(phy.radio().ccm.is_none());
    }

    #[test]
    fn rx_flags() {
        let mut flags = RxFlags::CRC_OK | RxFlags::DEVMATCH;
        assert!(flags.contains(RxFlags::CRC_OK));
        assert!(!flags.contains(RxFlags::CRC_OK | RxFlags::RESOLVED));
        flags.insert(RxFlags::SCAN_RSP_TXD);
        flags.remove(RxFlags::DEVMATCH);
        assert_eq!(flags.bits(), 0b1001);
        assert_eq!(RxFlags::default(), RxFlags::empty());
        assert_eq!(RxFlags::from_bits(0x20), None);
    }

    #[test]
    fn tx_power_is_railed() {
        let mut phy = Phy::new(TestRadio::default());
        assert_eq!(phy.set_tx_power(10), 4);
        assert_eq!(phy.set_tx_power(-100), -40);
        assert_eq!(phy.radio().power, -40);
    }
}
