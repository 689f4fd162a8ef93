use embassy_futures::select::{Either3, select3};
use embassy_time::{Duration, Instant, Ticker};

use edb_core::dispatch::{CommandError, CommandExecutor, CommandOutcome};
use edb_core::hal::TxPolicy;
use edb_core::protocol::{Frame, FrameAssembler};
use edb_core::session::SignalDisposition;

use crate::hw::EdbBoard;
use crate::link::{HostRxReceiver, LinkQueues, Outbox};
use crate::signal::{ControlEvent, ControlEventQueue};
use crate::telemetry::{ControlRecord, TelemetryRecorder};

/// Interval between scan passes that stream logged channels.
const SCAN_PERIOD: Duration = Duration::from_millis(10);

pub type Executor = CommandExecutor<EdbBoard, Outbox>;

/// Owns the command executor and serializes every operation on it: host
/// frames, target signal edges, and periodic log streaming.
#[embassy_executor::task]
pub async fn run(
    mut executor: Executor,
    host_rx: HostRxReceiver<'static>,
    events: &'static ControlEventQueue,
    queues: &'static LinkQueues,
) -> ! {
    let mut control = ControlLoop {
        assembler: FrameAssembler::new(),
        telemetry: TelemetryRecorder::new(),
        discarded: 0,
    };
    let mut ticker = Ticker::every(SCAN_PERIOD);

    defmt::info!("control: ready, session={}", executor.session_state().label());

    loop {
        match select3(host_rx.receive(), events.receive(), ticker.next()).await {
            Either3::First(chunk) => {
                for byte in chunk {
                    if let Some(frame) = control.assembler.push(byte) {
                        control.handle_frame(&mut executor, &frame);
                    }
                }
                control.note_discarded();
            }
            Either3::Second(ControlEvent::TargetSignal) => {
                control.handle_signal(&mut executor);
            }
            Either3::Third(()) => {
                if let Err(error) = executor.on_scan_complete(timestamp_millis()) {
                    defmt::warn!("control: log stream failed: {}", error_label(&error));
                }
            }
        }

        flush_outbox(&mut executor, queues, &mut control.telemetry).await;
    }
}

struct ControlLoop {
    assembler: FrameAssembler,
    telemetry: TelemetryRecorder,
    discarded: u32,
}

impl ControlLoop {
    fn handle_frame(&mut self, executor: &mut Executor, frame: &Frame) {
        match executor.handle_frame(frame) {
            Ok(executed) => match executed.outcome {
                CommandOutcome::Session(transition) => {
                    self.telemetry.record(transition, Instant::now());
                }
                CommandOutcome::Ramp(report) => {
                    self.telemetry.record(report, Instant::now());
                }
                CommandOutcome::Regulation(report) => {
                    self.telemetry.record(report, Instant::now());
                }
                CommandOutcome::Done => {}
            },
            Err(error) => match error.reject_reason() {
                Some(reason) => {
                    self.telemetry.record(
                        ControlRecord::CommandRejected {
                            command: frame.descriptor(),
                            reason,
                        },
                        Instant::now(),
                    );
                }
                None => {
                    defmt::warn!(
                        "control: dropped frame 0x{:02x}: {}",
                        frame.descriptor(),
                        error_label(&error)
                    );
                }
            },
        }
    }

    fn handle_signal(&mut self, executor: &mut Executor) {
        match executor.on_target_signal() {
            Ok(SignalDisposition::Transitioned(transition)) => {
                self.telemetry.record(transition, Instant::now());
            }
            Ok(SignalDisposition::Ignored(state)) => {
                defmt::debug!("control: target signal ignored in {}", state.label());
            }
            Err(error) => {
                defmt::warn!("control: signal report failed: {}", error_label(&error));
            }
        }
    }

    fn note_discarded(&mut self) {
        let total = self.assembler.discarded();
        let fresh = total.wrapping_sub(self.discarded);
        self.discarded = total;
        if fresh > 0 {
            self.telemetry
                .record(ControlRecord::FrameDropped { bytes: fresh }, Instant::now());
        }
    }
}

/// Moves staged messages onto the link channels. Forced messages wait for
/// room; droppable ones are discarded when the channel is full.
async fn flush_outbox(
    executor: &mut Executor,
    queues: &'static LinkQueues,
    telemetry: &mut TelemetryRecorder,
) {
    let outbox = executor.transport_mut();
    let mut dropped = outbox.take_dropped();

    while let Some(message) = outbox.pop() {
        let sender = queues.sender_for(message.link);
        match message.policy {
            TxPolicy::Force => sender.send(message.bytes).await,
            TxPolicy::DropIfBusy => {
                if sender.try_send(message.bytes).is_err() {
                    dropped = dropped.saturating_add(1);
                }
            }
        }
    }

    if dropped > 0 {
        telemetry.record(ControlRecord::MessagesDropped { count: dropped }, Instant::now());
    }
}

fn timestamp_millis() -> u32 {
    let millis = Instant::now().as_millis() % (u64::from(u32::MAX) + 1);
    u32::try_from(millis).unwrap_or(u32::MAX)
}

const fn error_label(error: &CommandError) -> &'static str {
    match error {
        CommandError::Mux(_) => "scan capacity",
        CommandError::Regulation(_) => "regulation",
        CommandError::Session(_) => "session",
        CommandError::Transport(_) => "transport",
        CommandError::Protocol(_) => "protocol",
    }
}
