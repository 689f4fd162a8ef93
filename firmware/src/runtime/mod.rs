use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::adc::{Adc, AdcChannel};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::{Flex, Level, Output, OutputType, Pull, Speed};
use embassy_stm32::time::khz;
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};

use crate::hw::{EdbBoard, StatusOutputs};
use crate::link::{LinkQueues, Outbox};
use crate::signal::{ControlEventQueue, SignalLatch};
use edb_core::config::EdbConfig;
use edb_core::dispatch::CommandExecutor;

mod control_task;
mod signal_task;
mod target_link_task;
mod usb_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

/// Carrier frequency of the power injection PWM.
const PWM_FREQUENCY_KHZ: u32 = 20;

pub(super) static LINK_QUEUES: LinkQueues = LinkQueues::new();
pub(super) static CONTROL_EVENTS: ControlEventQueue = ControlEventQueue::new();
pub(super) static SIGNAL_LATCH: SignalLatch = SignalLatch::new();

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        ADC1,
        PA0,
        PA1,
        PA4,
        PA5,
        PA7,
        TIM3,
        PA6,
        PA8,
        EXTI8,
        PB3,
        PB4,
        PB5,
        PB6,
        PB7,
        PB8,
        PB9,
        USB,
        PA11,
        PA12,
        USART5,
        PB0,
        PB1,
        ..
    } = hal::init(config);

    // Order follows `Channel::as_index`.
    let inputs = [
        PA0.degrade_adc(),
        PA1.degrade_adc(),
        PA4.degrade_adc(),
        PA5.degrade_adc(),
        PA7.degrade_adc(),
    ];

    let pwm = SimplePwm::new(
        TIM3,
        Some(PwmPin::new(PA6, OutputType::PushPull)),
        None,
        None,
        None,
        khz(PWM_FREQUENCY_KHZ),
        CountingMode::EdgeAlignedUp,
    );

    let outputs = StatusOutputs {
        led_red: Output::new(PB5, Level::Low, Speed::Low),
        led_green: Output::new(PB6, Level::High, Speed::Low),
        scope_trigger: Output::new(PB7, Level::Low, Speed::Low),
        state0: Output::new(PB8, Level::Low, Speed::Low),
        state1: Output::new(PB9, Level::Low, Speed::Low),
    };

    let board = EdbBoard::new(
        Adc::new(ADC1),
        inputs,
        pwm,
        Flex::new(PB3),
        Flex::new(PB4),
        outputs,
        &SIGNAL_LATCH,
    );
    let executor = CommandExecutor::new(board, Outbox::new(), EdbConfig::default());

    spawner
        .spawn(control_task::run(
            executor,
            LINK_QUEUES.host_rx_receiver(),
            &CONTROL_EVENTS,
            &LINK_QUEUES,
        ))
        .expect("failed to spawn control task");

    spawner
        .spawn(signal_task::run(
            ExtiInput::new(PA8, EXTI8, Pull::None),
            &SIGNAL_LATCH,
            &CONTROL_EVENTS,
        ))
        .expect("failed to spawn signal task");

    spawner
        .spawn(usb_task::run(
            USB,
            PA12,
            PA11,
            LINK_QUEUES.host_rx_sender(),
            LINK_QUEUES.host_tx_receiver(),
        ))
        .expect("failed to spawn USB task");

    spawner
        .spawn(target_link_task::run(
            LINK_QUEUES.target_tx_receiver(),
            USART5,
            PB0,
            PB1,
        ))
        .expect("failed to spawn target link task");

    core::future::pending::<()>().await;
}
