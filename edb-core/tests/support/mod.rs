#![allow(dead_code)]

use std::collections::VecDeque;

use edb_core::channel::{Channel, Reading};
use edb_core::config::ADC_MAX_READING;
use edb_core::hal::{
    AnalogFrontEnd, Delay, DigitalPins, Edge, Level, Link, Pin, PinMode, PwmActuator, Transport,
    TransportError, TxPolicy,
};
use edb_core::protocol::{Frame, Response, TargetMessage};

/// Every observable call made against [`MockBoard`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoardEvent {
    Output(Pin, Level),
    Direction(Pin, PinMode),
    EdgeEnabled(Pin, Edge),
    EdgeDisabled(Pin),
    Sample(Channel),
    ScanConfigured(usize),
    ScanStarted,
    ScanStopped,
    ScanIdle,
    Period(u16),
    DutyCycle(u16),
    PwmStarted,
    PwmStopped,
    Delay(u32),
}

/// Board with a crude storage-capacitor model.
///
/// The capacitor reading climbs by `charge_rate` per sample while the charge
/// pin is high and falls by `discharge_rate` per sample while the discharge
/// pin is an output. While the PWM runs, each delay settles the capacitor at
/// twice the duty cycle. A non-empty `cap_script` overrides the model.
///
/// The charge pin and the PWM share one output as on the board: starting the
/// PWM releases a forced-high charge pin and forcing the pin high stops the
/// PWM.
pub struct MockBoard {
    pub events: Vec<BoardEvent>,
    pub cap: Reading,
    pub cap_script: VecDeque<Reading>,
    pub charge_rate: u16,
    pub discharge_rate: u16,
    pub other_channels: Reading,
    pub period: u16,
    pub duty: u16,
    pub pwm_running: bool,
    charge_forced: bool,
    scan: Vec<Channel>,
    scanning: bool,
}

impl MockBoard {
    pub fn new(cap: Reading) -> Self {
        Self {
            events: Vec::new(),
            cap,
            cap_script: VecDeque::new(),
            charge_rate: 5,
            discharge_rate: 7,
            other_channels: 1_234,
            period: 2_047,
            duty: 0,
            pwm_running: false,
            charge_forced: false,
            scan: Vec::new(),
            scanning: false,
        }
    }

    pub fn with_script(cap: Reading, script: &[Reading]) -> Self {
        let mut board = Self::new(cap);
        board.cap_script = script.iter().copied().collect();
        board
    }

    pub fn level(&self, pin: Pin) -> Level {
        if pin == Pin::Charge {
            return Level::from(self.charge_forced);
        }
        self.events
            .iter()
            .rev()
            .find_map(|event| match event {
                BoardEvent::Output(p, level) if *p == pin => Some(*level),
                _ => None,
            })
            .unwrap_or(Level::Low)
    }

    pub fn mode(&self, pin: Pin) -> PinMode {
        self.events
            .iter()
            .rev()
            .find_map(|event| match event {
                BoardEvent::Direction(p, mode) if *p == pin => Some(*mode),
                _ => None,
            })
            .unwrap_or(PinMode::Input)
    }

    pub fn edge_armed(&self, pin: Pin) -> bool {
        self.events
            .iter()
            .rev()
            .find_map(|event| match event {
                BoardEvent::EdgeEnabled(p, _) if *p == pin => Some(true),
                BoardEvent::EdgeDisabled(p) if *p == pin => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn scanning(&self) -> bool {
        self.scanning
    }

    pub fn scan_sequence(&self) -> &[Channel] {
        &self.scan
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Events recorded after `mark`, for checking a single operation.
    pub fn events_since(&self, mark: usize) -> &[BoardEvent] {
        &self.events[mark..]
    }

    fn convert(&mut self, channel: Channel) -> Reading {
        if channel != Channel::CapVoltage {
            return self.other_channels;
        }

        if let Some(next) = self.cap_script.pop_front() {
            self.cap = next;
            return next;
        }

        if self.level(Pin::Charge) == Level::High {
            self.cap = self.cap.saturating_add(self.charge_rate).min(ADC_MAX_READING);
        }
        if self.mode(Pin::Discharge) == PinMode::Output {
            self.cap = self.cap.saturating_sub(self.discharge_rate);
        }
        self.cap
    }
}

impl AnalogFrontEnd for MockBoard {
    fn sample_blocking(&mut self, channel: Channel) -> Reading {
        self.events.push(BoardEvent::Sample(channel));
        self.convert(channel)
    }

    fn configure_scan(&mut self, channels: &[Channel]) {
        self.scan = channels.to_vec();
        self.events.push(BoardEvent::ScanConfigured(channels.len()));
    }

    fn start_scan(&mut self) {
        self.scanning = true;
        self.events.push(BoardEvent::ScanStarted);
    }

    fn stop_scan(&mut self) {
        self.scanning = false;
        self.events.push(BoardEvent::ScanStopped);
    }

    fn wait_scan_idle(&mut self) {
        self.events.push(BoardEvent::ScanIdle);
    }

    fn last_result(&mut self, slot: usize) -> Option<Reading> {
        if !self.scanning {
            return None;
        }
        let channel = *self.scan.get(slot)?;
        Some(self.convert(channel))
    }
}

impl PwmActuator for MockBoard {
    fn period(&self) -> u16 {
        self.period
    }

    fn set_period(&mut self, period: u16) {
        self.period = period;
        self.events.push(BoardEvent::Period(period));
    }

    fn duty_cycle(&self) -> u16 {
        self.duty
    }

    fn set_duty_cycle(&mut self, duty: u16) {
        self.duty = duty;
        self.events.push(BoardEvent::DutyCycle(duty));
    }

    fn start(&mut self) {
        self.pwm_running = true;
        self.charge_forced = false;
        self.events.push(BoardEvent::PwmStarted);
    }

    fn stop(&mut self) {
        self.pwm_running = false;
        self.events.push(BoardEvent::PwmStopped);
    }
}

impl DigitalPins for MockBoard {
    fn set_output(&mut self, pin: Pin, level: Level) {
        if pin == Pin::Charge {
            self.charge_forced = level == Level::High;
            if self.charge_forced {
                self.pwm_running = false;
            }
        }
        self.events.push(BoardEvent::Output(pin, level));
    }

    fn set_direction(&mut self, pin: Pin, mode: PinMode) {
        self.events.push(BoardEvent::Direction(pin, mode));
    }

    fn enable_edge_interrupt(&mut self, pin: Pin, edge: Edge) {
        self.events.push(BoardEvent::EdgeEnabled(pin, edge));
    }

    fn disable_edge_interrupt(&mut self, pin: Pin) {
        self.events.push(BoardEvent::EdgeDisabled(pin));
    }
}

impl Delay for MockBoard {
    fn delay_cycles(&mut self, cycles: u32) {
        self.events.push(BoardEvent::Delay(cycles));
        if self.pwm_running {
            self.cap = self.duty.saturating_mul(2).min(ADC_MAX_READING);
        }
    }
}

/// Message captured by [`MockTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sent {
    pub link: Link,
    pub frame: Frame,
    pub policy: TxPolicy,
}

/// Transport that records frames and can simulate a full queue.
#[derive(Default)]
pub struct MockTransport {
    pub sent: Vec<Sent>,
    /// Droppable messages are refused once this many messages are queued.
    pub capacity: Option<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sent: Vec::new(),
            capacity: Some(capacity),
        }
    }

    pub fn host_responses(&self) -> Vec<Response> {
        self.sent
            .iter()
            .filter(|sent| sent.link == Link::Host)
            .map(|sent| Response::decode(&sent.frame).expect("host frame decodes"))
            .collect()
    }

    pub fn target_messages(&self) -> Vec<TargetMessage> {
        self.sent
            .iter()
            .filter(|sent| sent.link == Link::Target)
            .map(|sent| TargetMessage::decode(&sent.frame).expect("target frame decodes"))
            .collect()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }
}

impl Transport for MockTransport {
    fn send(
        &mut self,
        link: Link,
        descriptor: u8,
        payload: &[u8],
        policy: TxPolicy,
    ) -> Result<(), TransportError> {
        if policy == TxPolicy::DropIfBusy
            && self.capacity.is_some_and(|capacity| self.sent.len() >= capacity)
        {
            return Err(TransportError::QueueFull);
        }
        let frame = Frame::new(descriptor, payload).map_err(|_| TransportError::PayloadTooLong)?;
        self.sent.push(Sent {
            link,
            frame,
            policy,
        });
        Ok(())
    }
}

/// Small deterministic generator for property-style loops.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) as u32
    }

    pub fn below(&mut self, bound: u32) -> u32 {
        self.next_u32() % bound
    }
}
