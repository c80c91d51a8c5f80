use std::cell::{Cell, RefCell};
use std::rc::Rc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use rand_chacha::{ChaCha12Core, ChaCha12Rng};
use rand_core::SeedableRng;
use trouble_controller::codec::{Encode, Type};
use trouble_controller::link::pdu::AdvPdu;
use trouble_controller::phy::{CcmParams, ChannelConfig, Radio, RadioRxStatus, RadioState};
use trouble_controller::time::Timer;
use trouble_controller::{Alarm, BdAddr, Config, ControllerConfig, LinkLayer, PacketPool, RadioEvent, Ticks};

pub const PUBLIC_ADDR: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

pub type TestPool = PacketPool<CriticalSectionRawMutex, 64, 8>;
pub type Ll<'d> = LinkLayer<'d, TestConfig>;

pub struct TestConfig;

impl Config for TestConfig {
    type Mutex = CriticalSectionRawMutex;
    type Timer = MockTimer;
    type Radio = MockRadio;
    type Rng = ChaCha12Rng;
}

/// A PDU handed to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub channel: u8,
    pub pdu: Vec<u8>,
    pub at: Option<Ticks>,
    pub then_rx: bool,
}

pub struct MockRadio {
    pub state: RadioState,
    pub config: Option<ChannelConfig>,
    pub sent: Vec<Sent>,
    pub rx: Vec<u8>,
    pub status: RadioRxStatus,
    pub irks: Option<Vec<[u8; 16]>>,
    pub power: i8,
}

impl MockRadio {
    fn new() -> Self {
        Self {
            state: RadioState::Disabled,
            config: None,
            sent: Vec::new(),
            rx: Vec::new(),
            status: RadioRxStatus::default(),
            irks: None,
            power: 0,
        }
    }
}

impl Radio for MockRadio {
    const MIN_TX_POWER: i8 = -20;
    const MAX_TX_POWER: i8 = 8;

    fn state(&self) -> RadioState {
        self.state
    }

    fn configure(&mut self, config: &ChannelConfig) {
        self.config = Some(*config);
    }

    fn set_tx_power(&mut self, dbm: i8) {
        self.power = dbm;
    }

    fn start_tx(&mut self, pdu: &[u8], at: Option<Ticks>, then_rx: bool) {
        self.sent.push(Sent {
            channel: self.config.map(|c| c.channel).unwrap_or(0),
            pdu: pdu.to_vec(),
            at,
            then_rx,
        });
        self.state = RadioState::Tx;
    }

    fn start_rx(&mut self, _at: Option<Ticks>) {
        self.state = RadioState::Rx;
    }

    fn disable(&mut self) {
        self.state = RadioState::Disabled;
    }

    fn rx_buffer(&self) -> &[u8] {
        &self.rx
    }

    fn rx_status(&self) -> RadioRxStatus {
        self.status
    }

    fn set_encryption(&mut self, _ccm: Option<&CcmParams>) {}

    fn set_address_resolution(&mut self, irks: Option<&[[u8; 16]]>) {
        self.irks = irks.map(|irks| irks.to_vec());
    }
}

/// The test clock, shared with the timer owned by the link layer.
#[derive(Clone, Default)]
pub struct Clock {
    now: Rc<Cell<u32>>,
    alarms: Rc<RefCell<[Option<Ticks>; 2]>>,
}

fn slot(alarm: Alarm) -> usize {
    match alarm {
        Alarm::Scheduler => 0,
        Alarm::WaitForResponse => 1,
    }
}

impl Clock {
    pub fn now(&self) -> Ticks {
        Ticks(self.now.get())
    }

    pub fn set(&self, at: Ticks) {
        self.now.set(at.raw());
    }

    pub fn advance(&self, us: u32) {
        self.now.set(self.now.get().wrapping_add(us));
    }

    pub fn alarm(&self, alarm: Alarm) -> Option<Ticks> {
        self.alarms.borrow()[slot(alarm)]
    }

    fn take_alarm(&self, alarm: Alarm) -> Option<Ticks> {
        self.alarms.borrow_mut()[slot(alarm)].take()
    }
}

pub struct MockTimer(Clock);

impl Timer for MockTimer {
    fn now(&self) -> Ticks {
        self.0.now()
    }

    fn set_alarm(&mut self, alarm: Alarm, at: Ticks) {
        self.0.alarms.borrow_mut()[slot(alarm)] = Some(at);
    }

    fn clear_alarm(&mut self, alarm: Alarm) {
        self.0.alarms.borrow_mut()[slot(alarm)] = None;
    }
}

#[allow(unused)]
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn setup(pool: &TestPool) -> (Ll<'_>, Clock) {
    init_logger();
    let clock = Clock::default();
    clock.set(Ticks(10_000));
    let config = ControllerConfig {
        public_address: BdAddr::new(PUBLIC_ADDR),
        tx_power: 0,
        privacy: true,
    };
    let rng: ChaCha12Rng = ChaCha12Core::seed_from_u64(1).into();
    let ll = LinkLayer::new(config, MockRadio::new(), MockTimer(clock.clone()), rng, pool);
    (ll, clock)
}

/// Jump to the scheduler alarm and fire it. Returns `false` if no alarm is armed.
#[allow(unused)]
pub fn fire_scheduler(ll: &Ll<'_>, clock: &Clock) -> bool {
    let Some(at) = clock.take_alarm(Alarm::Scheduler) else {
        return false;
    };
    if at.is_after(clock.now()) {
        clock.set(at);
    }
    ll.on_alarm(Alarm::Scheduler);
    true
}

/// Let the wait-for-response alarm expire.
#[allow(unused)]
pub fn expire_wfr(ll: &Ll<'_>, clock: &Clock) {
    let at = clock.take_alarm(Alarm::WaitForResponse).expect("no response window");
    clock.set(at);
    ll.on_alarm(Alarm::WaitForResponse);
}

/// The last PDU handed to the radio.
#[allow(unused)]
pub fn last_sent(ll: &Ll<'_>) -> Option<Sent> {
    ll.with_radio(|r| r.sent.last().cloned())
}

#[allow(unused)]
pub fn sent(ll: &Ll<'_>) -> Vec<Sent> {
    ll.with_radio(|r| r.sent.clone())
}

/// Finish the transmission of the last PDU on air.
#[allow(unused)]
pub fn end_tx(ll: &Ll<'_>, clock: &Clock) {
    let last = last_sent(ll).expect("nothing sent");
    let air = trouble_controller::phy::tx_duration_usecs(last.pdu.len() - 2);
    match last.at {
        Some(at) => clock.set(at.add_micros(trouble_controller::phy::XCVR_TX_START_DELAY_USECS + air)),
        None => clock.advance(trouble_controller::phy::T_IFS_USECS + air),
    }
    ll.with_radio(|r| {
        r.state = if last.then_rx {
            RadioState::Rx
        } else {
            RadioState::Disabled
        }
    });
    ll.on_radio_event(RadioEvent::TxEnd);
}

/// Receive `pdu` in the response window opened by the last transmission.
#[allow(unused)]
pub fn receive(ll: &Ll<'_>, clock: &Clock, pdu: &[u8], crc_ok: bool) {
    clock.advance(trouble_controller::phy::T_IFS_USECS);
    ll.with_radio(|r| {
        r.rx = pdu.to_vec();
        r.status = RadioRxStatus {
            crc_ok,
            ..Default::default()
        };
    });
    ll.on_radio_event(RadioEvent::RxStart);
    clock.advance(trouble_controller::phy::tx_duration_usecs(pdu.len() - 2));
    ll.with_radio(|r| r.state = RadioState::Disabled);
    ll.on_radio_event(RadioEvent::RxEnd);
}

/// Run one advertising PDU with no response. Returns what went on air, if anything.
#[allow(unused)]
pub fn advertise_once(ll: &Ll<'_>, clock: &Clock) -> Option<Sent> {
    let before = ll.with_radio(|r| r.sent.len());
    assert!(fire_scheduler(ll, clock), "nothing scheduled");
    let sent = ll.with_radio(|r| r.sent.get(before).cloned());
    if let Some(s) = &sent {
        end_tx(ll, clock);
        if s.then_rx {
            expire_wfr(ll, clock);
        }
    }
    ll.poll();
    sent
}

/// Encode an advertising channel PDU with its header.
#[allow(unused)]
pub fn encode_pdu(pdu: &AdvPdu<'_>, tx_add: bool, rx_add: bool) -> Vec<u8> {
    let header = pdu.header(tx_add, rx_add);
    let mut out = vec![0u8; 2 + pdu.size()];
    out[0] = header.flags();
    out[1] = header.len;
    pdu.encode(&mut out[2..]).unwrap();
    out
}
