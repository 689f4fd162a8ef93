use embassy_stm32::exti::ExtiInput;

use crate::signal::{ControlEvent, ControlEventQueue, SignalLatch};

/// Watches the sense input tied to the target signal line and forwards
/// rising edges to the control task while the latch is armed.
#[embassy_executor::task]
pub async fn run(
    mut sense: ExtiInput<'static>,
    latch: &'static SignalLatch,
    events: &'static ControlEventQueue,
) -> ! {
    loop {
        latch.wait_armed().await;
        sense.wait_for_rising_edge().await;

        if latch.accept_edge() {
            events.send(ControlEvent::TargetSignal).await;
        } else {
            defmt::debug!(
                "signal: edge ignored while disarmed (total={})",
                latch.ignored_edges()
            );
        }
    }
}
