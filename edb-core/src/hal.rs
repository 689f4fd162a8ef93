//! Peripheral and transport abstractions consumed by the debugger core.
//!
//! The core never touches registers. Firmware implements these traits over the
//! Embassy drivers, the emulator implements them over a simulated target, and
//! the tests implement them over scripted mocks. Every call is blocking from the
//! caller's point of view; the core expects an operation to be complete when the
//! method returns.

use core::fmt;

use crate::channel::{Channel, Reading};

/// Digital lines driven or watched by the debugger.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Pin {
    /// Bidirectional line shared with the target's debug interrupt.
    Signal,
    /// Continuous power injection (charge source).
    Charge,
    /// Open-drain bleed path (discharge sink); active while configured as output.
    Discharge,
    /// Red status LED, lit for the duration of a debug session.
    LedRed,
    /// Green status LED.
    LedGreen,
    /// Oscilloscope trigger output.
    ScopeTrigger,
    /// Session state indicator, bit 0.
    State0,
    /// Session state indicator, bit 1.
    State1,
}

/// Output level for a digital pin.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value { Level::High } else { Level::Low }
    }
}

/// Pin direction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PinMode {
    /// High impedance.
    Input,
    /// Driven at the last level set with [`DigitalPins::set_output`].
    Output,
}

/// Edge that fires a pin interrupt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Edge {
    Rising,
    Falling,
}

/// ADC with a single-shot path and a multi-channel scan sequencer.
pub trait AnalogFrontEnd {
    /// Performs a blocking single conversion of `channel`.
    fn sample_blocking(&mut self, channel: Channel) -> Reading;

    /// Programs the scan sequence. Only called while the scan is stopped.
    fn configure_scan(&mut self, channels: &[Channel]);

    /// Starts continuous scanning of the configured sequence.
    fn start_scan(&mut self);

    /// Requests the scan to stop.
    fn stop_scan(&mut self);

    /// Blocks until the sequencer reports idle.
    fn wait_scan_idle(&mut self);

    /// Latest conversion stored for a scan slot, `None` if no scan is running
    /// or the slot is not part of the sequence.
    fn last_result(&mut self, slot: usize) -> Option<Reading>;
}

/// PWM actuator driving the power injection stage.
pub trait PwmActuator {
    /// Counter top value; a duty cycle equal to it keeps the output high.
    fn period(&self) -> u16;

    fn set_period(&mut self, period: u16);

    fn duty_cycle(&self) -> u16;

    fn set_duty_cycle(&mut self, duty: u16);

    fn start(&mut self);

    fn stop(&mut self);
}

/// Digital pin control plus the interrupt mask for watched pins.
pub trait DigitalPins {
    fn set_output(&mut self, pin: Pin, level: Level);

    fn set_direction(&mut self, pin: Pin, mode: PinMode);

    /// Arms a single-fire edge interrupt on `pin`.
    fn enable_edge_interrupt(&mut self, pin: Pin, edge: Edge);

    /// Masks the edge interrupt on `pin`.
    fn disable_edge_interrupt(&mut self, pin: Pin);
}

/// Busy-wait delay expressed in core clock cycles.
pub trait Delay {
    fn delay_cycles(&mut self, cycles: u32);
}

/// Everything the core needs from a board.
pub trait Board: AnalogFrontEnd + PwmActuator + DigitalPins + Delay {}

impl<T> Board for T where T: AnalogFrontEnd + PwmActuator + DigitalPins + Delay {}

/// Serial links the debugger talks on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Link {
    /// Host PC (USB CDC).
    Host,
    /// Target device (UART).
    Target,
}

/// Queuing policy for an outgoing message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxPolicy {
    /// Must be delivered; may displace droppable traffic.
    Force,
    /// Discard if the link is busy.
    DropIfBusy,
}

/// Errors returned by a [`Transport`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportError {
    /// The outgoing queue had no room for the message.
    QueueFull,
    /// The payload exceeds the frame limit.
    PayloadTooLong,
    /// The link is not connected.
    LinkDown,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::QueueFull => f.write_str("transmit queue full"),
            TransportError::PayloadTooLong => f.write_str("payload exceeds frame limit"),
            TransportError::LinkDown => f.write_str("link down"),
        }
    }
}

/// Message-oriented transmit path shared by the host and target links.
pub trait Transport {
    /// Frames and queues a message on `link`.
    fn send(
        &mut self,
        link: Link,
        descriptor: u8,
        payload: &[u8],
        policy: TxPolicy,
    ) -> Result<(), TransportError>;
}
