use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::usart::{BufferedUart, Config as UartConfig, DataBits, Parity, StopBits};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;

use crate::link::{FrameReceiver, LINK_QUEUE_DEPTH};
use edb_core::config::MAX_FRAME_LEN;

const TARGET_UART_BUFFER_SIZE: usize = MAX_FRAME_LEN * LINK_QUEUE_DEPTH;
const TARGET_UART_BAUD: u32 = 115_200;

static mut UART_TX_BUFFER: [u8; TARGET_UART_BUFFER_SIZE] = [0; TARGET_UART_BUFFER_SIZE];
static mut UART_RX_BUFFER: [u8; TARGET_UART_BUFFER_SIZE] = [0; TARGET_UART_BUFFER_SIZE];

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART3_4_5_6_LPUART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART5>;
});

/// Forwards debugger-to-target frames onto the target UART.
#[embassy_executor::task]
pub async fn run(
    frames: FrameReceiver<'static>,
    usart: Peri<'static, hal::peripherals::USART5>,
    tx_pin: Peri<'static, hal::peripherals::PB0>,
    rx_pin: Peri<'static, hal::peripherals::PB1>,
) -> ! {
    let mut config = UartConfig::default();
    config.baudrate = TARGET_UART_BAUD;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;

    let mut uart = unsafe {
        BufferedUart::new(
            usart,
            rx_pin,
            tx_pin,
            &mut UART_TX_BUFFER,
            &mut UART_RX_BUFFER,
            UartIrqs,
            config,
        )
        .expect("failed to initialize target UART")
    };

    defmt::info!("target-link: UART ready at {} baud", TARGET_UART_BAUD);

    loop {
        let frame = frames.receive().await;
        if frame.is_empty() {
            continue;
        }

        if uart.write_all(frame.as_slice()).await.is_err() || uart.flush().await.is_err() {
            defmt::warn!("target-link: UART write error, frame len={}", frame.len());
            Timer::after(Duration::from_millis(5)).await;
        }
    }
}
