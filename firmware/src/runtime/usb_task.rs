use embassy_futures::join::join;
use embassy_futures::select::{Either3, select3};
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_usb::driver::EndpointError;
use static_cell::StaticCell;

use crate::link::{FrameReceiver, HostChunk, HostRxSender};
use crate::usb::{self, UsbDeviceStrings};
use edb_core::protocol::FrameBytes;

embassy_stm32::bind_interrupts!(struct UsbIrqs {
    USB_UCPD1_2 => embassy_stm32::usb::InterruptHandler<hal::peripherals::USB>;
});

static USB_STORAGE: StaticCell<usb::UsbDeviceStorage> = StaticCell::new();

#[embassy_executor::task]
pub async fn run(
    usb: Peri<'static, hal::peripherals::USB>,
    dp: Peri<'static, hal::peripherals::PA12>,
    dm: Peri<'static, hal::peripherals::PA11>,
    host_rx: HostRxSender<'static>,
    host_tx: FrameReceiver<'static>,
) -> ! {
    let storage = USB_STORAGE.init(usb::UsbDeviceStorage::new());
    let driver = embassy_stm32::usb::Driver::new(usb, UsbIrqs, dp, dm);

    let mut host = usb::HostDevice::new(driver, storage, UsbDeviceStrings::default());
    let usb::HostPort {
        sender,
        receiver,
        control,
    } = host.take_port().expect("host CDC interface unavailable");

    let mut device = host.device;
    join(
        device.run(),
        run_host_interface(sender, receiver, control, host_rx, host_tx),
    )
    .await;
    loop {
        core::future::pending::<()>().await;
    }
}

async fn run_host_interface<D>(
    mut sender: embassy_usb::class::cdc_acm::Sender<'static, D>,
    mut receiver: embassy_usb::class::cdc_acm::Receiver<'static, D>,
    control: embassy_usb::class::cdc_acm::ControlChanged<'static>,
    host_rx: HostRxSender<'static>,
    host_tx: FrameReceiver<'static>,
) -> !
where
    D: embassy_usb::driver::Driver<'static>,
{
    let mut ingress = [0u8; usb::MAX_PACKET_SIZE as usize];
    let mut pending_tx: Option<FrameBytes> = None;

    loop {
        join(receiver.wait_connection(), sender.wait_connection()).await;
        wait_for_dtr(&control, &mut sender).await;
        pending_tx.take();

        defmt::info!("usb: host link connected");

        loop {
            match select3(
                receiver.read_packet(&mut ingress),
                async {
                    let frame = match pending_tx.take() {
                        Some(frame) => frame,
                        None => host_tx.receive().await,
                    };
                    let result = sender.write_packet(frame.as_slice()).await;
                    if result.is_err() {
                        pending_tx = Some(frame);
                    }
                    result
                },
                control.control_changed(),
            )
            .await
            {
                Either3::First(Ok(count)) => {
                    if count == 0 {
                        continue;
                    }

                    let mut chunk = HostChunk::new();
                    if chunk.extend_from_slice(&ingress[..count]).is_err() {
                        defmt::warn!("usb: dropping host packet len={} (overflow)", count);
                        continue;
                    }

                    host_rx.send(chunk).await;
                }
                Either3::First(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: host interface disabled");
                    break;
                }
                Either3::First(Err(_)) => {
                    defmt::warn!("usb: host read error");
                }
                Either3::Second(Ok(())) => {}
                Either3::Second(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: host write disabled");
                    break;
                }
                Either3::Second(Err(_)) => {
                    defmt::warn!("usb: host write error");
                }
                Either3::Third(()) => {
                    if !sender.dtr() {
                        defmt::warn!("usb: host dropped DTR");
                        pending_tx.take();
                        break;
                    }
                }
            }
        }
    }
}

async fn wait_for_dtr<D>(
    control: &embassy_usb::class::cdc_acm::ControlChanged<'static>,
    sender: &mut embassy_usb::class::cdc_acm::Sender<'static, D>,
) where
    D: embassy_usb::driver::Driver<'static>,
{
    while !sender.dtr() {
        control.control_changed().await;
    }
}
