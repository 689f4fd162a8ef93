//! STM32G0 board adapter implementing the debugger HAL traits.
//!
//! The ADC scan sequencer is serviced in software: `configure_scan` records
//! the slot order and `last_result` converts the slot's channel on demand
//! while a scan is running. The charge line doubles as the PWM output, so
//! driving it high runs the timer at full duty and driving it low disables it.

#![cfg(target_os = "none")]

use edb_core::channel::{Channel, Reading};
use edb_core::config::{CHANNEL_COUNT, DEFAULT_PWM_DUTY, DEFAULT_PWM_PERIOD, MAX_SCAN_SLOTS};
use edb_core::hal::{AnalogFrontEnd, Delay, DigitalPins, Edge, Level, Pin, PinMode, PwmActuator};
use embassy_stm32::adc::{Adc, AnyAdcChannel, SampleTime};
use embassy_stm32::gpio::{Flex, Level as GpioLevel, Output, Pull, Speed};
use embassy_stm32::peripherals::{ADC1, TIM3};
use embassy_stm32::timer::simple_pwm::SimplePwm;
use heapless::Vec;

use crate::signal::SignalLatch;

/// Analog inputs in [`Channel`] index order.
pub type AnalogInputs = [AnyAdcChannel<ADC1>; CHANNEL_COUNT];

/// Output-only lines owned by the board.
pub struct StatusOutputs {
    pub led_red: Output<'static>,
    pub led_green: Output<'static>,
    pub scope_trigger: Output<'static>,
    pub state0: Output<'static>,
    pub state1: Output<'static>,
}

pub struct EdbBoard {
    adc: Adc<'static, ADC1>,
    inputs: AnalogInputs,
    sequence: Vec<Channel, MAX_SCAN_SLOTS>,
    scanning: bool,
    pwm: SimplePwm<'static, TIM3>,
    period: u16,
    duty: u16,
    pwm_running: bool,
    charge_forced: bool,
    signal: Flex<'static>,
    discharge: Flex<'static>,
    outputs: StatusOutputs,
    latch: &'static SignalLatch,
}

impl EdbBoard {
    pub fn new(
        mut adc: Adc<'static, ADC1>,
        inputs: AnalogInputs,
        pwm: SimplePwm<'static, TIM3>,
        mut signal: Flex<'static>,
        mut discharge: Flex<'static>,
        outputs: StatusOutputs,
        latch: &'static SignalLatch,
    ) -> Self {
        adc.set_sample_time(SampleTime::CYCLES12_5);
        signal.set_as_input(Pull::None);
        discharge.set_low();
        discharge.set_as_input(Pull::None);

        let mut board = Self {
            adc,
            inputs,
            sequence: Vec::new(),
            scanning: false,
            pwm,
            period: DEFAULT_PWM_PERIOD,
            duty: DEFAULT_PWM_DUTY,
            pwm_running: false,
            charge_forced: false,
            signal,
            discharge,
            outputs,
            latch,
        };
        board.apply_pwm();
        board
    }

    fn convert(&mut self, channel: Channel) -> Reading {
        self.adc
            .blocking_read(&mut self.inputs[channel.as_index()])
    }

    /// Maps the logical duty cycle onto the timer's compare range.
    fn hardware_duty(&self) -> u16 {
        let max = u32::from(self.pwm.max_duty_cycle());
        let period = u32::from(self.period.max(1));
        let scaled = u32::from(self.duty.min(self.period)) * max / period;
        u16::try_from(scaled).unwrap_or(u16::MAX)
    }

    fn apply_pwm(&mut self) {
        let duty = if self.charge_forced {
            self.pwm.max_duty_cycle()
        } else {
            self.hardware_duty()
        };
        let enabled = self.charge_forced || self.pwm_running;

        let mut channel = self.pwm.ch1();
        channel.set_duty_cycle(duty);
        if enabled {
            channel.enable();
        } else {
            channel.disable();
        }
    }

    fn output(&mut self, pin: Pin) -> Option<&mut Output<'static>> {
        match pin {
            Pin::LedRed => Some(&mut self.outputs.led_red),
            Pin::LedGreen => Some(&mut self.outputs.led_green),
            Pin::ScopeTrigger => Some(&mut self.outputs.scope_trigger),
            Pin::State0 => Some(&mut self.outputs.state0),
            Pin::State1 => Some(&mut self.outputs.state1),
            Pin::Signal | Pin::Charge | Pin::Discharge => None,
        }
    }
}

impl AnalogFrontEnd for EdbBoard {
    fn sample_blocking(&mut self, channel: Channel) -> Reading {
        self.convert(channel)
    }

    fn configure_scan(&mut self, channels: &[Channel]) {
        self.sequence.clear();
        for channel in channels.iter().take(MAX_SCAN_SLOTS) {
            // Capacity is bounded by the `take` above.
            let _ = self.sequence.push(*channel);
        }
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

impl PwmActuator for EdbBoard {
    fn period(&self) -> u16 {
        self.period
    }

    fn set_period(&mut self, period: u16) {
        self.period = period;
        self.apply_pwm();
    }

    fn duty_cycle(&self) -> u16 {
        self.duty
    }

    fn set_duty_cycle(&mut self, duty: u16) {
        self.duty = duty;
        self.apply_pwm();
    }

    fn start(&mut self) {
        self.pwm_running = true;
        self.charge_forced = false;
        self.apply_pwm();
    }

    fn stop(&mut self) {
        self.pwm_running = false;
        self.apply_pwm();
    }
}

impl DigitalPins for EdbBoard {
    fn set_output(&mut self, pin: Pin, level: Level) {
        let level = match level {
            Level::Low => GpioLevel::Low,
            Level::High => GpioLevel::High,
        };
        match pin {
            Pin::Signal => self.signal.set_level(level),
            Pin::Discharge => self.discharge.set_level(level),
            Pin::Charge => {
                self.charge_forced = level == GpioLevel::High;
                if self.charge_forced {
                    self.pwm_running = false;
                }
                self.apply_pwm();
            }
            other => {
                if let Some(output) = self.output(other) {
                    output.set_level(level);
                }
            }
        }
    }

    fn set_direction(&mut self, pin: Pin, mode: PinMode) {
        let flex = match pin {
            Pin::Signal => &mut self.signal,
            Pin::Discharge => &mut self.discharge,
            _ => return,
        };
        match mode {
            PinMode::Input => flex.set_as_input(Pull::None),
            PinMode::Output => flex.set_as_output(Speed::Low),
        }
    }

    fn enable_edge_interrupt(&mut self, pin: Pin, edge: Edge) {
        if pin == Pin::Signal && edge == Edge::Rising {
            self.latch.arm();
        } else {
            defmt::warn!("hw: edge interrupt unsupported on {}", pin_label(pin));
        }
    }

    fn disable_edge_interrupt(&mut self, pin: Pin) {
        if pin == Pin::Signal {
            self.latch.disarm();
        }
    }
}

impl Delay for EdbBoard {
    fn delay_cycles(&mut self, cycles: u32) {
        cortex_m::asm::delay(cycles);
    }
}

const fn pin_label(pin: Pin) -> &'static str {
    match pin {
        Pin::Signal => "signal",
        Pin::Charge => "charge",
        Pin::Discharge => "discharge",
        Pin::LedRed => "led-red",
        Pin::LedGreen => "led-green",
        Pin::ScopeTrigger => "scope",
        Pin::State0 => "state0",
        Pin::State1 => "state1",
    }
}

