//! Simulated board, links, and target used by the emulator.
//!
//! The storage capacitor is a single count value on the ADC scale. Charging
//! and discharging move it by a fixed step per conversion, the running target
//! drains it by a small load, and a running PWM settles it at a level
//! proportional to the duty cycle after each delay.

use std::collections::VecDeque;

use edb_core::channel::{Channel, Reading};
use edb_core::config::{ADC_MAX_READING, MAX_SCAN_SLOTS};
use edb_core::hal::{
    AnalogFrontEnd, Delay, DigitalPins, Edge, Level, Link, Pin, PinMode, PwmActuator, Transport,
    TransportError, TxPolicy,
};
use edb_core::protocol::{Frame, TargetMessage};

/// PWM period the simulated timer starts with; one duty count moves the
/// settled level by one ADC count.
pub const SIM_PWM_PERIOD: u16 = ADC_MAX_READING;

const PIN_COUNT: usize = 8;

const fn pin_index(pin: Pin) -> usize {
    match pin {
        Pin::Signal => 0,
        Pin::Charge => 1,
        Pin::Discharge => 2,
        Pin::LedRed => 3,
        Pin::LedGreen => 4,
        Pin::ScopeTrigger => 5,
        Pin::State0 => 6,
        Pin::State1 => 7,
    }
}

pub struct SimBoard {
    cap: u32,
    /// Fixed readings for the channels the model does not track.
    pub boost: Reading,
    pub regulated: Reading,
    pub rectified: Reading,
    pub charge_step: u32,
    pub discharge_step: u32,
    /// Counts drained per conversion while the target runs.
    pub load: u32,
    pub target_running: bool,
    levels: [Level; PIN_COUNT],
    modes: [PinMode; PIN_COUNT],
    armed: Option<Edge>,
    pending_pulse: bool,
    sequence: Vec<Channel>,
    scanning: bool,
    period: u16,
    duty: u16,
    pwm_running: bool,
    elapsed_cycles: u64,
    conversions: u64,
}

impl SimBoard {
    pub fn new(cap: Reading) -> Self {
        Self {
            cap: u32::from(cap),
            boost: 3_100,
            regulated: 2_480,
            rectified: 1_520,
            charge_step: 12,
            discharge_step: 9,
            load: 1,
            target_running: true,
            levels: [Level::Low; PIN_COUNT],
            modes: [PinMode::Input; PIN_COUNT],
            armed: None,
            pending_pulse: false,
            sequence: Vec::new(),
            scanning: false,
            period: SIM_PWM_PERIOD,
            duty: 0,
            pwm_running: false,
            elapsed_cycles: 0,
            conversions: 0,
        }
    }

    pub fn cap(&self) -> Reading {
        Reading::try_from(self.cap).unwrap_or(ADC_MAX_READING)
    }

    pub fn set_cap(&mut self, cap: Reading) {
        self.cap = u32::from(cap.min(ADC_MAX_READING));
    }

    pub fn level(&self, pin: Pin) -> Level {
        self.levels[pin_index(pin)]
    }

    pub fn mode(&self, pin: Pin) -> PinMode {
        self.modes[pin_index(pin)]
    }

    pub fn edge_armed(&self) -> bool {
        self.armed == Some(Edge::Rising)
    }

    pub fn pwm_running(&self) -> bool {
        self.pwm_running
    }

    pub fn scanning(&self) -> bool {
        self.scanning
    }

    pub fn elapsed_cycles(&self) -> u64 {
        self.elapsed_cycles
    }

    pub fn conversions(&self) -> u64 {
        self.conversions
    }

    /// Returns `true` once for each completed pulse on the signal line.
    pub fn take_pulse(&mut self) -> bool {
        std::mem::take(&mut self.pending_pulse)
    }

    fn injected(&self) -> Reading {
        if self.level(Pin::Charge) == Level::High || self.pwm_running {
            self.regulated
        } else {
            0
        }
    }

    fn convert(&mut self, channel: Channel) -> Reading {
        self.conversions += 1;
        if channel == Channel::CapVoltage {
            self.step_capacitor();
        }
        match channel {
            Channel::CapVoltage => self.cap(),
            Channel::BoostVoltage => self.boost,
            Channel::RegVoltage => self.regulated,
            Channel::RectVoltage => self.rectified,
            Channel::InjectedVoltage => self.injected(),
        }
    }

    fn step_capacitor(&mut self) {
        if self.level(Pin::Charge) == Level::High {
            self.cap += self.charge_step;
        }
        if self.mode(Pin::Discharge) == PinMode::Output {
            self.cap = self.cap.saturating_sub(self.discharge_step);
        }
        if self.target_running {
            self.cap = self.cap.saturating_sub(self.load);
        }
        self.cap = self.cap.min(u32::from(ADC_MAX_READING));
    }

    fn settled_level(&self) -> u32 {
        let period = u32::from(self.period.max(1));
        u32::from(self.duty.min(self.period)) * u32::from(ADC_MAX_READING) / period
    }
}

impl AnalogFrontEnd for SimBoard {
    fn sample_blocking(&mut self, channel: Channel) -> Reading {
        self.convert(channel)
    }

    fn configure_scan(&mut self, channels: &[Channel]) {
        self.sequence = channels.iter().copied().take(MAX_SCAN_SLOTS).collect();
    }

    fn start_scan(&mut self) {
        self.scanning = !self.sequence.is_empty();
    }

    fn stop_scan(&mut self) {
        self.scanning = false;
    }

    fn wait_scan_idle(&mut self) {}

    fn last_result(&mut self, slot: usize) -> Option<Reading> {
        if !self.scanning {
            return None;
        }
        let channel = *self.sequence.get(slot)?;
        Some(self.convert(channel))
    }
}

impl PwmActuator for SimBoard {
    fn period(&self) -> u16 {
        self.period
    }

    fn set_period(&mut self, period: u16) {
        self.period = period;
    }

    fn duty_cycle(&self) -> u16 {
        self.duty
    }

    fn set_duty_cycle(&mut self, duty: u16) {
        self.duty = duty;
    }

    fn start(&mut self) {
        self.pwm_running = true;
        // The timer takes the charge pin back from a forced level.
        self.levels[pin_index(Pin::Charge)] = Level::Low;
    }

    fn stop(&mut self) {
        self.pwm_running = false;
    }
}

impl DigitalPins for SimBoard {
    fn set_output(&mut self, pin: Pin, level: Level) {
        if pin == Pin::Charge && level == Level::High {
            self.pwm_running = false;
        }
        self.levels[pin_index(pin)] = level;
    }

    fn set_direction(&mut self, pin: Pin, mode: PinMode) {
        // A high level driven onto the signal line starts a pulse.
        if pin == Pin::Signal && mode == PinMode::Output && self.level(Pin::Signal) == Level::High {
            self.pending_pulse = true;
        }
        self.modes[pin_index(pin)] = mode;
    }

    fn enable_edge_interrupt(&mut self, pin: Pin, edge: Edge) {
        if pin == Pin::Signal {
            self.armed = Some(edge);
        }
    }

    fn disable_edge_interrupt(&mut self, pin: Pin) {
        if pin == Pin::Signal {
            self.armed = None;
        }
    }
}

impl Delay for SimBoard {
    fn delay_cycles(&mut self, cycles: u32) {
        self.elapsed_cycles += u64::from(cycles);
        if self.pwm_running {
            self.cap = self.settled_level();
        }
    }
}

/// Frames queued by the executor, split by link.
pub struct SimLink {
    host: VecDeque<Frame>,
    target: VecDeque<Frame>,
    capacity: usize,
    pub dropped: u32,
}

impl SimLink {
    pub fn new(capacity: usize) -> Self {
        Self {
            host: VecDeque::new(),
            target: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn drain_host(&mut self) -> Vec<Frame> {
        self.host.drain(..).collect()
    }

    pub fn drain_target(&mut self) -> Vec<Frame> {
        self.target.drain(..).collect()
    }
}

impl Transport for SimLink {
    fn send(
        &mut self,
        link: Link,
        descriptor: u8,
        payload: &[u8],
        policy: TxPolicy,
    ) -> Result<(), TransportError> {
        let frame = Frame::new(descriptor, payload).map_err(|_| TransportError::PayloadTooLong)?;
        let queue = match link {
            Link::Host => &mut self.host,
            Link::Target => &mut self.target,
        };
        if policy == TxPolicy::DropIfBusy && queue.len() >= self.capacity {
            self.dropped += 1;
            return Err(TransportError::QueueFull);
        }
        queue.push_back(frame);
        Ok(())
    }
}

/// Execution state of the simulated target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetMode {
    Running,
    Suspended,
    /// Acknowledged an exit request; waiting for the resume pulse.
    Resuming,
}

impl TargetMode {
    pub const fn label(self) -> &'static str {
        match self {
            TargetMode::Running => "running",
            TargetMode::Suspended => "suspended",
            TargetMode::Resuming => "resuming",
        }
    }
}

/// Target firmware model: enters its debug loop on a signal pulse, answers
/// an exit request, and resumes on the final pulse. Every transition into or
/// out of the debug loop is acknowledged with a rising edge on the signal line.
pub struct SimTarget {
    mode: TargetMode,
    interrupts: u32,
}

impl SimTarget {
    pub const fn new() -> Self {
        Self {
            mode: TargetMode::Running,
            interrupts: 0,
        }
    }

    pub const fn mode(&self) -> TargetMode {
        self.mode
    }

    pub const fn interrupts(&self) -> u32 {
        self.interrupts
    }

    /// Handles a pulse on the signal line. Returns `true` when the target
    /// acknowledges with a rising edge.
    pub fn on_pulse(&mut self) -> bool {
        match self.mode {
            TargetMode::Running => {
                self.interrupts += 1;
                self.mode = TargetMode::Suspended;
                true
            }
            TargetMode::Resuming => {
                self.mode = TargetMode::Running;
                false
            }
            TargetMode::Suspended => false,
        }
    }

    /// Handles a message from the debugger.
    pub fn on_message(&mut self, message: TargetMessage) -> bool {
        match (message, self.mode) {
            (TargetMessage::ExitDebug, TargetMode::Suspended) => {
                self.mode = TargetMode::Resuming;
                true
            }
            (TargetMessage::ExitDebug, _) => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.mode == TargetMode::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charging_raises_the_capacitor_per_conversion() {
        let mut board = SimBoard::new(1_000);
        board.target_running = false;
        board.set_output(Pin::Charge, Level::High);
        board.sample_blocking(Channel::CapVoltage);
        assert_eq!(board.sample_blocking(Channel::CapVoltage), 1_024);
        assert_eq!(board.sample_blocking(Channel::InjectedVoltage), board.regulated);
    }

    #[test]
    fn discharge_path_only_bleeds_while_driven() {
        let mut board = SimBoard::new(1_000);
        board.target_running = false;
        board.set_direction(Pin::Discharge, PinMode::Output);
        assert_eq!(board.sample_blocking(Channel::CapVoltage), 991);
        board.set_direction(Pin::Discharge, PinMode::Input);
        assert_eq!(board.sample_blocking(Channel::CapVoltage), 991);
    }

    #[test]
    fn running_pwm_settles_after_a_delay() {
        let mut board = SimBoard::new(0);
        board.set_duty_cycle(1_500);
        board.start();
        board.delay_cycles(100);
        assert_eq!(board.cap(), 1_500);
        assert_eq!(board.elapsed_cycles(), 100);
    }

    #[test]
    fn signal_pulse_is_reported_once() {
        let mut board = SimBoard::new(0);
        board.set_output(Pin::Signal, Level::High);
        board.set_direction(Pin::Signal, PinMode::Output);
        board.set_output(Pin::Signal, Level::Low);
        board.set_direction(Pin::Signal, PinMode::Input);
        assert!(board.take_pulse());
        assert!(!board.take_pulse());
    }

    #[test]
    fn target_acknowledges_entry_and_exit() {
        let mut target = SimTarget::new();
        assert!(target.on_pulse());
        assert_eq!(target.mode(), TargetMode::Suspended);
        assert!(!target.on_pulse());

        assert!(target.on_message(TargetMessage::ExitDebug));
        assert_eq!(target.mode(), TargetMode::Resuming);
        assert!(!target.on_pulse());
        assert!(target.is_running());
        assert_eq!(target.interrupts(), 1);
    }

    #[test]
    fn exit_request_is_ignored_while_running() {
        let mut target = SimTarget::new();
        assert!(!target.on_message(TargetMessage::ExitDebug));
        assert!(target.is_running());
    }

    #[test]
    fn droppable_frames_respect_link_capacity() {
        let mut link = SimLink::new(1);
        link.send(Link::Host, 0x85, &[0; 4], TxPolicy::DropIfBusy)
            .unwrap();
        assert_eq!(
            link.send(Link::Host, 0x85, &[0; 4], TxPolicy::DropIfBusy),
            Err(TransportError::QueueFull)
        );
        link.send(Link::Host, 0x88, &[0x06], TxPolicy::Force).unwrap();
        assert_eq!(link.drain_host().len(), 2);
        assert_eq!(link.dropped, 1);
    }

    #[test]
    fn charge_pin_and_pwm_share_one_output() {
        let mut board = SimBoard::new(0);
        board.start();
        board.set_output(Pin::Charge, Level::High);
        assert!(!board.pwm_running());

        board.start();
        assert_eq!(board.level(Pin::Charge), Level::Low);
        assert!(board.pwm_running());
    }
}
