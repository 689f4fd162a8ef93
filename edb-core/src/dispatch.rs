//! Command executor tying the core components to a board and a transport.
//!
//! [`CommandExecutor`] is the single owner of the debugger's mutable state: the
//! scan multiplexer, the logging mask, the debug session and the regulation
//! settings, plus the board and transport they act through. Host commands map
//! one-to-one onto its methods. Replies are queued on the host link with
//! [`TxPolicy::Force`] and also returned to the caller; streamed log samples
//! use [`TxPolicy::DropIfBusy`].

use core::fmt;

use crate::channel::{Channel, Reading};
use crate::config::{EdbConfig, MAX_SCAN_SLOTS};
use crate::hal::{Board, Level, Link, Pin, Transport, TransportError, TxPolicy};
use crate::mux::{MuxError, ScanMultiplexer};
use crate::protocol::{Frame, HostCommand, ProtocolError, RejectReason, Response};
use crate::regulation::{
    Direction, RampReport, RegulationError, RegulationReport, VoltageRegulator,
};
use crate::session::{
    DebugSession, SessionError, SessionReport, SessionState, SignalDisposition, Transition,
};
use crate::telemetry::{LogBatch, LogStream};

/// Errors surfaced by the executor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandError {
    Mux(MuxError),
    Regulation(RegulationError),
    Session(SessionError),
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl CommandError {
    /// Reason reported to the host for errors that reject a command.
    #[must_use]
    pub const fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            CommandError::Mux(MuxError::CapacityExceeded { .. })
            | CommandError::Regulation(RegulationError::Mux(_)) => {
                Some(RejectReason::CapacityExceeded)
            }
            CommandError::Regulation(RegulationError::BudgetExhausted { .. }) => {
                Some(RejectReason::BudgetExhausted)
            }
            CommandError::Session(SessionError::InvalidTransition { .. }) => {
                Some(RejectReason::InvalidTransition)
            }
            CommandError::Session(SessionError::Transport(_)) | CommandError::Transport(_) => {
                Some(RejectReason::LinkBusy)
            }
            CommandError::Protocol(_) => None,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Mux(error) => write!(f, "{error}"),
            CommandError::Regulation(error) => write!(f, "{error}"),
            CommandError::Session(error) => write!(f, "{error}"),
            CommandError::Transport(error) => write!(f, "{error}"),
            CommandError::Protocol(error) => write!(f, "{error}"),
        }
    }
}

impl From<MuxError> for CommandError {
    fn from(error: MuxError) -> Self {
        Self::Mux(error)
    }
}

impl From<RegulationError> for CommandError {
    fn from(error: RegulationError) -> Self {
        Self::Regulation(error)
    }
}

impl From<SessionError> for CommandError {
    fn from(error: SessionError) -> Self {
        Self::Session(error)
    }
}

impl From<TransportError> for CommandError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

impl From<ProtocolError> for CommandError {
    fn from(error: ProtocolError) -> Self {
        Self::Protocol(error)
    }
}

/// Structured result of one executed command, for callers that log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandOutcome {
    /// Session state changed.
    Session(Transition),
    Ramp(RampReport),
    Regulation(RegulationReport),
    /// Command completed without a report.
    Done,
}

/// What the executor did with a command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Executed {
    pub outcome: CommandOutcome,
    /// Reply queued for the host, if the command has one.
    pub response: Option<Response>,
}

impl Executed {
    const fn reply(outcome: CommandOutcome, response: Response) -> Self {
        Self {
            outcome,
            response: Some(response),
        }
    }

    const fn silent(outcome: CommandOutcome) -> Self {
        Self {
            outcome,
            response: None,
        }
    }
}

/// Owns the debugger state and runs host commands against a board.
pub struct CommandExecutor<B, T, const N: usize = MAX_SCAN_SLOTS> {
    board: B,
    transport: T,
    mux: ScanMultiplexer<N>,
    log: LogStream,
    session: DebugSession,
    regulator: VoltageRegulator,
    auto_scope_trigger: bool,
}

impl<B, T, const N: usize> CommandExecutor<B, T, N>
where
    B: Board,
    T: Transport,
{
    #[must_use]
    pub fn new(board: B, transport: T, config: EdbConfig) -> Self {
        Self {
            board,
            transport,
            mux: ScanMultiplexer::new(),
            log: LogStream::new(),
            session: DebugSession::new(config.session),
            regulator: VoltageRegulator::new(config.regulation),
            auto_scope_trigger: config.auto_scope_trigger,
        }
    }

    #[must_use]
    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[must_use]
    pub fn mux(&self) -> &ScanMultiplexer<N> {
        &self.mux
    }

    #[must_use]
    pub fn log_stream(&self) -> &LogStream {
        &self.log
    }

    #[must_use]
    pub fn session(&self) -> &DebugSession {
        &self.session
    }

    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Decodes and executes a host frame.
    ///
    /// Frames that fail to decode return [`CommandError::Protocol`] and leave
    /// every piece of state untouched; nothing is sent to the host.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Protocol`] for undecodable frames and any error
    /// [`Self::execute`] returns.
    pub fn handle_frame(&mut self, frame: &Frame) -> Result<Executed, CommandError> {
        let command = HostCommand::decode(frame)?;
        self.execute(command)
    }

    /// Executes a host command.
    ///
    /// Rejected commands are answered with [`Response::Rejected`] before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns the scan, regulation, session or transport error that stopped
    /// the command.
    pub fn execute(&mut self, command: HostCommand) -> Result<Executed, CommandError> {
        match self.run(command) {
            Ok(executed) => {
                if let Some(response) = executed.response {
                    self.reply(&response)?;
                }
                Ok(executed)
            }
            Err(error) => {
                if let Some(reason) = error.reject_reason() {
                    // Best effort: the original error is more useful than a full queue.
                    let _ = self.reply(&Response::Rejected {
                        command: command.descriptor(),
                        reason,
                    });
                }
                Err(error)
            }
        }
    }

    /// Delivers a target signal to the session and reports the transition.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Transport`] when the report cannot be queued;
    /// the transition itself has already happened.
    pub fn on_target_signal(&mut self) -> Result<SignalDisposition, CommandError> {
        let disposition = self.session.on_target_signal(
            &mut self.board,
            &mut self.mux,
            self.log.mask(),
            &self.regulator,
        );

        if let SignalDisposition::Transitioned(Transition {
            report: Some(report),
            ..
        }) = disposition
        {
            let response = match report {
                SessionReport::Entered { saved } => Response::DebugEntered { saved },
                SessionReport::Exited { saved, restored } => {
                    Response::DebugExited { saved, restored }
                }
            };
            self.reply(&response)?;
        }

        Ok(disposition)
    }

    /// Streams the logged channels after a scan pass.
    ///
    /// Samples that do not fit in the outgoing queue are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Transport`] for link failures other than a
    /// full queue.
    pub fn on_scan_complete(&mut self, timestamp: u32) -> Result<Option<LogBatch>, CommandError> {
        let Some(batch) = self
            .log
            .on_scan_complete(&mut self.board, &self.mux, timestamp)
        else {
            return Ok(None);
        };

        self.stream(&Response::LogTime {
            timestamp: batch.timestamp,
        })?;
        for sample in &batch.samples {
            self.stream(&Response::LogReading {
                channel: sample.channel,
                reading: sample.reading,
            })?;
        }

        Ok(Some(batch))
    }

    fn run(&mut self, command: HostCommand) -> Result<Executed, CommandError> {
        let descriptor = command.descriptor();
        let ack = Response::Ack {
            command: descriptor,
        };

        match command {
            HostCommand::GetReading(channel) => {
                let reading = self.mux.read(channel, &mut self.board);
                Ok(Executed::reply(
                    CommandOutcome::Done,
                    Response::Reading { channel, reading },
                ))
            }
            HostCommand::SetVoltage { channel, target } => {
                self.session.claim_actuator()?;
                let report = self.regulator.regulate(
                    &mut self.board,
                    &mut self.mux,
                    self.log.mask(),
                    channel,
                    target,
                )?;
                Ok(Executed::reply(
                    CommandOutcome::Regulation(report),
                    Response::VoltageSet {
                        channel,
                        reading: report.reading,
                    },
                ))
            }
            HostCommand::EnterDebug => {
                self.pulse_scope_if_enabled();
                let transition = self.session.enter_debug(&mut self.board)?;
                Ok(Executed::silent(CommandOutcome::Session(transition)))
            }
            HostCommand::ExitDebug => {
                self.pulse_scope_if_enabled();
                let transition = self
                    .session
                    .exit_debug(&mut self.board, &mut self.transport)?;
                Ok(Executed::silent(CommandOutcome::Session(transition)))
            }
            HostCommand::Reset => {
                let transition = self.session.reset(&mut self.board);
                Ok(Executed::reply(CommandOutcome::Session(transition), ack))
            }
            HostCommand::BeginLog(channel) => {
                self.begin_log(channel)?;
                Ok(Executed::reply(CommandOutcome::Done, ack))
            }
            HostCommand::EndLog(channel) => {
                self.end_log(channel);
                Ok(Executed::reply(CommandOutcome::Done, ack))
            }
            HostCommand::Charge(target) => self.ramp(target, Direction::Charge),
            HostCommand::Discharge(target) => self.ramp(target, Direction::Discharge),
            HostCommand::TriggerScope => {
                self.pulse_scope();
                Ok(Executed::reply(CommandOutcome::Done, ack))
            }
            HostCommand::PwmOn => {
                self.session.claim_actuator()?;
                self.board.start();
                Ok(Executed::reply(CommandOutcome::Done, ack))
            }
            HostCommand::PwmOff => {
                self.session.claim_actuator()?;
                self.board.stop();
                self.board.set_output(Pin::Charge, Level::Low);
                Ok(Executed::reply(CommandOutcome::Done, ack))
            }
            HostCommand::PwmHigh => {
                self.session.claim_actuator()?;
                self.board.stop();
                self.board.set_output(Pin::Charge, Level::High);
                Ok(Executed::reply(CommandOutcome::Done, ack))
            }
            HostCommand::SetPwmPeriod(counts) => {
                let period = counts.saturating_sub(1);
                self.board.set_period(period);
                if self.board.duty_cycle() > period {
                    self.board.set_duty_cycle(period);
                }
                Ok(Executed::reply(CommandOutcome::Done, ack))
            }
            HostCommand::SetPwmDutyCycle(duty) => {
                let duty = duty.min(self.board.period());
                self.board.set_duty_cycle(duty);
                Ok(Executed::reply(CommandOutcome::Done, ack))
            }
            HostCommand::GetSessionState => Ok(Executed::reply(
                CommandOutcome::Done,
                Response::SessionState(self.session.state()),
            )),
        }
    }

    fn ramp(&mut self, target: Reading, direction: Direction) -> Result<Executed, CommandError> {
        self.pulse_scope_if_enabled();
        let report = self.regulator.ramp(
            &mut self.board,
            &mut self.mux,
            self.log.mask(),
            Channel::CapVoltage,
            target,
            direction,
        )?;
        Ok(Executed::reply(
            CommandOutcome::Ramp(report),
            Response::Ramped {
                direction,
                reading: report.reading,
            },
        ))
    }

    fn begin_log(&mut self, channel: Channel) -> Result<(), CommandError> {
        let newly_active = !self.mux.is_active(channel);
        self.mux.activate(channel)?;
        self.log.begin(channel);
        if newly_active {
            self.mux.commit(&mut self.board);
        }
        Ok(())
    }

    fn end_log(&mut self, channel: Channel) {
        if self.log.end(channel) && self.mux.deactivate(channel).is_some() {
            self.mux.commit(&mut self.board);
        }
    }

    fn pulse_scope_if_enabled(&mut self) {
        if self.auto_scope_trigger {
            self.pulse_scope();
        }
    }

    fn pulse_scope(&mut self) {
        self.board.set_output(Pin::ScopeTrigger, Level::High);
        self.board.set_output(Pin::ScopeTrigger, Level::Low);
    }

    fn reply(&mut self, response: &Response) -> Result<(), TransportError> {
        let frame = response.encode();
        self.transport.send(
            Link::Host,
            frame.descriptor(),
            frame.payload(),
            TxPolicy::Force,
        )
    }

    fn stream(&mut self, response: &Response) -> Result<(), TransportError> {
        let frame = response.encode();
        match self.transport.send(
            Link::Host,
            frame.descriptor(),
            frame.payload(),
            TxPolicy::DropIfBusy,
        ) {
            Ok(()) | Err(TransportError::QueueFull) => Ok(()),
            Err(error) => Err(error),
        }
    }
}
