mod support;

use edb_core::channel::Channel;
use edb_core::config::EdbConfig;
use edb_core::dispatch::{CommandError, CommandExecutor, CommandOutcome};
use edb_core::hal::{Level, Link, Pin, TxPolicy};
use edb_core::protocol::{
    Frame, FrameAssembler, HostCommand, ProtocolError, RejectReason, Response, descriptor,
};
use edb_core::regulation::Direction;
use edb_core::session::{SessionError, SessionEvent, SessionState, SignalDisposition};

use support::{MockBoard, MockTransport};

type Executor = CommandExecutor<MockBoard, MockTransport>;

fn executor(cap: u16) -> Executor {
    CommandExecutor::new(MockBoard::new(cap), MockTransport::new(), EdbConfig::default())
}

/// Encodes commands into a byte stream and runs every frame it yields.
fn run_bytes(executor: &mut Executor, commands: &[HostCommand]) {
    let mut assembler = FrameAssembler::new();
    for command in commands {
        for byte in command.encode().encode() {
            if let Some(frame) = assembler.push(byte) {
                executor.handle_frame(&frame).unwrap();
            }
        }
    }
}

#[test]
fn get_reading_replies_with_channel_and_value() {
    let mut executor = executor(2_345);
    let executed = executor
        .execute(HostCommand::GetReading(Channel::CapVoltage))
        .unwrap();

    let expected = Response::Reading {
        channel: Channel::CapVoltage,
        reading: 2_345,
    };
    assert_eq!(executed.response, Some(expected));
    assert_eq!(executor.transport().host_responses(), vec![expected]);
    assert_eq!(executor.transport().sent[0].policy, TxPolicy::Force);
}

#[test]
fn debug_round_trip_over_frames() {
    let mut executor = executor(2_500);
    run_bytes(&mut executor, &[HostCommand::EnterDebug]);
    assert_eq!(executor.session_state(), SessionState::Entering);
    assert!(executor.transport().sent.is_empty());

    let disposition = executor.on_target_signal().unwrap();
    assert!(matches!(disposition, SignalDisposition::Transitioned(_)));

    executor.board_mut().cap = 2_900;
    run_bytes(&mut executor, &[HostCommand::ExitDebug]);
    assert_eq!(executor.session_state(), SessionState::Exiting);

    executor.on_target_signal().unwrap();
    assert_eq!(executor.session_state(), SessionState::Idle);

    let responses = executor.transport().host_responses();
    assert_eq!(responses[0], Response::DebugEntered { saved: 2_500 });
    let Response::DebugExited { saved, restored } = responses[1] else {
        panic!("expected exit report, got {:?}", responses[1]);
    };
    assert_eq!(saved, 2_500);
    assert!(restored <= 2_500);

    let target_frames: Vec<_> = executor
        .transport()
        .sent
        .iter()
        .filter(|sent| sent.link == Link::Target)
        .collect();
    assert_eq!(target_frames.len(), 1);
    assert_eq!(target_frames[0].frame.descriptor(), descriptor::TARGET_EXIT_DEBUG);
}

#[test]
fn rejected_commands_are_answered() {
    let mut executor = executor(2_000);
    let error = executor.execute(HostCommand::ExitDebug).unwrap_err();
    assert!(matches!(error, CommandError::Session(_)));

    assert_eq!(
        executor.transport().host_responses(),
        vec![Response::Rejected {
            command: descriptor::EXIT_DEBUG,
            reason: RejectReason::InvalidTransition,
        }]
    );
    assert_eq!(executor.session_state(), SessionState::Idle);
}

#[test]
fn unknown_frames_are_dropped_silently() {
    let mut executor = executor(2_000);
    let frame = Frame::new(0x1D, &[1, 2]).unwrap();
    assert_eq!(
        executor.handle_frame(&frame).unwrap_err(),
        CommandError::Protocol(ProtocolError::UnknownDescriptor(0x1D))
    );
    assert!(executor.transport().sent.is_empty());
    assert!(executor.board().events.is_empty());
}

#[test]
fn logging_streams_timestamped_batches() {
    let mut executor = executor(1_500);
    executor.execute(HostCommand::BeginLog(Channel::CapVoltage)).unwrap();
    executor.execute(HostCommand::BeginLog(Channel::RectVoltage)).unwrap();
    assert_eq!(
        executor.mux().active(),
        &[Channel::CapVoltage, Channel::RectVoltage]
    );
    executor.transport_mut().clear();

    let batch = executor.on_scan_complete(40).unwrap().unwrap();
    assert_eq!(batch.timestamp, 40);
    assert_eq!(batch.samples.len(), 2);
    let second = executor.on_scan_complete(40).unwrap().unwrap();
    assert_eq!(second.timestamp, 41);

    let responses = executor.transport().host_responses();
    assert_eq!(
        &responses[..3],
        &[
            Response::LogTime { timestamp: 40 },
            Response::LogReading {
                channel: Channel::CapVoltage,
                reading: 1_500,
            },
            Response::LogReading {
                channel: Channel::RectVoltage,
                reading: 1_234,
            },
        ]
    );
    assert!(
        executor
            .transport()
            .sent
            .iter()
            .all(|sent| sent.policy == TxPolicy::DropIfBusy)
    );

    executor.execute(HostCommand::EndLog(Channel::CapVoltage)).unwrap();
    executor.execute(HostCommand::EndLog(Channel::RectVoltage)).unwrap();
    assert!(executor.mux().is_empty());
    assert!(!executor.board().scanning());
    assert_eq!(executor.on_scan_complete(90).unwrap(), None);
}

#[test]
fn busy_link_drops_log_samples_without_error() {
    let mut board_executor = CommandExecutor::<_, _>::new(
        MockBoard::new(1_000),
        MockTransport::with_capacity(2),
        EdbConfig::default(),
    );
    board_executor
        .execute(HostCommand::BeginLog(Channel::BoostVoltage))
        .unwrap();

    // The ack fills one slot; the timestamp takes the other and the sample is dropped.
    let batch = board_executor.on_scan_complete(5).unwrap();
    assert!(batch.is_some());
    assert_eq!(board_executor.transport().sent.len(), 2);
}

#[test]
fn charge_and_discharge_report_the_crossing_reading() {
    let mut executor = executor(1_000);
    let executed = executor.execute(HostCommand::Charge(1_100)).unwrap();
    let CommandOutcome::Ramp(report) = executed.outcome else {
        panic!("expected ramp outcome");
    };
    assert!(report.reading >= 1_100);
    assert_eq!(
        executed.response,
        Some(Response::Ramped {
            direction: Direction::Charge,
            reading: report.reading,
        })
    );

    let executed = executor.execute(HostCommand::Discharge(900)).unwrap();
    let CommandOutcome::Ramp(report) = executed.outcome else {
        panic!("expected ramp outcome");
    };
    assert!(report.reading <= 900);
    assert!(executor.mux().is_empty());
}

#[test]
fn set_voltage_regulates_and_keeps_logged_channel() {
    let mut executor = executor(0);
    executor.execute(HostCommand::BeginLog(Channel::CapVoltage)).unwrap();

    let executed = executor
        .execute(HostCommand::SetVoltage {
            channel: Channel::CapVoltage,
            target: 2_000,
        })
        .unwrap();
    assert_eq!(
        executed.response,
        Some(Response::VoltageSet {
            channel: Channel::CapVoltage,
            reading: 2_000,
        })
    );
    assert!(executor.mux().is_active(Channel::CapVoltage));
    assert!(executor.board().pwm_running);
}

#[test]
fn scope_trigger_precedes_session_commands() {
    let mut executor = executor(2_000);
    executor.execute(HostCommand::EnterDebug).unwrap();
    assert_eq!(
        executor.board().events[0],
        support::BoardEvent::Output(Pin::ScopeTrigger, Level::High)
    );

    let mut quiet = CommandExecutor::<_, _>::new(
        MockBoard::new(2_000),
        MockTransport::new(),
        EdbConfig {
            auto_scope_trigger: false,
            ..EdbConfig::default()
        },
    );
    quiet.execute(HostCommand::EnterDebug).unwrap();
    assert!(
        !quiet
            .board()
            .events
            .contains(&support::BoardEvent::Output(Pin::ScopeTrigger, Level::High))
    );
}

#[test]
fn pwm_commands_drive_the_actuator() {
    let mut executor = executor(0);
    executor.execute(HostCommand::SetPwmDutyCycle(5_000)).unwrap();
    assert_eq!(executor.board().duty, 2_047);

    executor.execute(HostCommand::SetPwmPeriod(1_024)).unwrap();
    assert_eq!(executor.board().period, 1_023);
    assert_eq!(executor.board().duty, 1_023);

    executor.execute(HostCommand::PwmOn).unwrap();
    assert!(executor.board().pwm_running);

    executor.execute(HostCommand::PwmHigh).unwrap();
    assert!(!executor.board().pwm_running);
    assert_eq!(executor.board().level(Pin::Charge), Level::High);

    executor.execute(HostCommand::PwmOff).unwrap();
    assert_eq!(executor.board().level(Pin::Charge), Level::Low);

    let acks = executor.transport().host_responses();
    assert_eq!(acks.len(), 5);
    assert!(acks.iter().all(|ack| matches!(ack, Response::Ack { .. })));
}

#[test]
fn session_state_query_and_reset() {
    let mut executor = executor(2_000);
    executor.execute(HostCommand::EnterDebug).unwrap();
    let executed = executor.execute(HostCommand::GetSessionState).unwrap();
    assert_eq!(
        executed.response,
        Some(Response::SessionState(SessionState::Entering))
    );

    executor.execute(HostCommand::Reset).unwrap();
    assert_eq!(executor.session_state(), SessionState::Idle);
    assert_eq!(executor.board().level(Pin::Charge), Level::Low);
    assert_eq!(
        executor.on_target_signal().unwrap(),
        SignalDisposition::Ignored(SessionState::Idle)
    );
}

#[test]
fn reset_after_regulation_turns_injection_off() {
    let mut executor = executor(0);
    executor
        .execute(HostCommand::SetVoltage {
            channel: Channel::CapVoltage,
            target: 1_500,
        })
        .unwrap();
    assert!(executor.board().pwm_running);

    executor.execute(HostCommand::EnterDebug).unwrap();
    executor.execute(HostCommand::Reset).unwrap();

    assert_eq!(executor.session_state(), SessionState::Idle);
    assert!(!executor.board().pwm_running);
    assert_eq!(executor.board().level(Pin::Charge), Level::Low);
}

#[test]
fn actuator_commands_are_refused_during_a_session() {
    let mut executor = executor(2_000);
    executor.execute(HostCommand::EnterDebug).unwrap();
    executor.on_target_signal().unwrap();
    assert_eq!(executor.session_state(), SessionState::Debug);
    executor.transport_mut().clear();

    let refused = [
        HostCommand::SetVoltage {
            channel: Channel::CapVoltage,
            target: 1_500,
        },
        HostCommand::PwmOn,
        HostCommand::PwmOff,
        HostCommand::PwmHigh,
    ];
    for command in refused {
        assert_eq!(
            executor.execute(command).unwrap_err(),
            CommandError::Session(SessionError::InvalidTransition {
                state: SessionState::Debug,
                event: SessionEvent::Actuate,
            })
        );
    }

    // Continuous injection from the debug entry is untouched.
    assert_eq!(executor.board().level(Pin::Charge), Level::High);
    assert!(!executor.board().pwm_running);

    let responses = executor.transport().host_responses();
    assert_eq!(responses.len(), refused.len());
    for (response, command) in responses.iter().zip(refused) {
        assert_eq!(
            *response,
            Response::Rejected {
                command: command.descriptor(),
                reason: RejectReason::InvalidTransition,
            }
        );
    }

    // Timer settings only take effect once the actuator runs again.
    executor.execute(HostCommand::SetPwmDutyCycle(300)).unwrap();
    assert_eq!(executor.board().duty, 300);
}
