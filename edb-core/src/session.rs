//! Debug session state machine.
//!
//! A session moves `Idle -> Entering -> Debug -> Exiting -> Idle`. The host
//! drives the `Entering` and `Exiting` edges; the target acknowledges each of
//! them by raising the shared signal line, which the board reports through a
//! single-fire edge interrupt. The capacitor voltage captured on entry is
//! restored on exit so the target resumes with the energy it was interrupted at.
//!
//! The interrupt is masked whenever it fires and only re-armed by the two
//! transitions that wait for the target. A signal that arrives in any other
//! state is ignored without touching the board.

use core::fmt;

use crate::channel::{Channel, ChannelSet, Reading};
use crate::config::SessionConfig;
use crate::hal::{Board, Edge, Level, Link, Pin, PinMode, Transport, TransportError, TxPolicy};
use crate::mux::ScanMultiplexer;
use crate::protocol::TargetMessage;
use crate::regulation::{Direction, RegulationError, VoltageRegulator};

/// Session phases.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SessionState {
    #[default]
    Idle,
    Entering,
    Debug,
    Exiting,
}

impl SessionState {
    /// Two-bit encoding used on the state pins and the wire.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Entering => 1,
            SessionState::Debug => 2,
            SessionState::Exiting => 3,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SessionState::Idle),
            1 => Some(SessionState::Entering),
            2 => Some(SessionState::Debug),
            3 => Some(SessionState::Exiting),
            _ => None,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Entering => "entering",
            SessionState::Debug => "debug",
            SessionState::Exiting => "exiting",
        }
    }

    /// Returns `true` while the target is held in (or moving through) a session.
    #[must_use]
    pub const fn in_session(self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Inputs to the state machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    EnterDebug,
    ExitDebug,
    Reset,
    TargetSignal,
    /// Host command that drives the power actuator directly.
    Actuate,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionEvent::EnterDebug => "enter-debug",
            SessionEvent::ExitDebug => "exit-debug",
            SessionEvent::Reset => "reset",
            SessionEvent::TargetSignal => "target-signal",
            SessionEvent::Actuate => "actuate",
        };
        f.write_str(label)
    }
}

/// Data reported to the host when the target acknowledges a transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionReport {
    /// Target is suspended; `saved` is the captured capacitor level.
    Entered { saved: Reading },
    /// Target resumed; `restored` is the capacitor level after the discharge.
    Exited { saved: Reading, restored: Reading },
}

/// Accepted state change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub report: Option<SessionReport>,
}

/// Result of delivering a target signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignalDisposition {
    Transitioned(Transition),
    /// The signal was not expected in this state.
    Ignored(SessionState),
}

/// Errors raised by the state machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionError {
    /// The event is not accepted in the current state.
    InvalidTransition {
        state: SessionState,
        event: SessionEvent,
    },
    /// The exit request could not be queued for the target.
    Transport(TransportError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidTransition { state, event } => {
                write!(f, "{event} not accepted while {state}")
            }
            SessionError::Transport(error) => write!(f, "target link: {error}"),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

/// Owns the session state and the saved energy level.
#[derive(Clone, Debug, Default)]
pub struct DebugSession {
    state: SessionState,
    saved_energy: Option<Reading>,
    config: SessionConfig,
}

impl DebugSession {
    #[must_use]
    pub const fn new(config: SessionConfig) -> Self {
        Self {
            state: SessionState::Idle,
            saved_energy: None,
            config,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Capacitor level captured on entry, present only during a session.
    #[must_use]
    pub const fn saved_energy(&self) -> Option<Reading> {
        self.saved_energy
    }

    /// Captures the energy level and asks the target to enter debug mode.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] unless the session is idle.
    pub fn enter_debug<B>(&mut self, board: &mut B) -> Result<Transition, SessionError>
    where
        B: Board + ?Sized,
    {
        self.expect(SessionState::Idle, SessionEvent::EnterDebug)?;

        board.set_output(Pin::LedRed, Level::High);
        self.saved_energy = Some(board.sample_blocking(Channel::CapVoltage));
        pulse_signal(board);
        board.enable_edge_interrupt(Pin::Signal, Edge::Rising);

        Ok(self.move_to(board, SessionState::Entering, None))
    }

    /// Asks the target to leave debug mode.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] outside the debug state and
    /// [`SessionError::Transport`] when the exit request cannot be queued.
    pub fn exit_debug<B, T>(
        &mut self,
        board: &mut B,
        transport: &mut T,
    ) -> Result<Transition, SessionError>
    where
        B: Board + ?Sized,
        T: Transport + ?Sized,
    {
        self.expect(SessionState::Debug, SessionEvent::ExitDebug)?;

        let message = TargetMessage::ExitDebug;
        transport.send(
            Link::Target,
            message.descriptor(),
            &[],
            TxPolicy::Force,
        )?;
        board.enable_edge_interrupt(Pin::Signal, Edge::Rising);

        Ok(self.move_to(board, SessionState::Exiting, None))
    }

    /// Handles the target's acknowledgment on the signal line.
    pub fn on_target_signal<B, const N: usize>(
        &mut self,
        board: &mut B,
        mux: &mut ScanMultiplexer<N>,
        logged: ChannelSet,
        regulator: &VoltageRegulator,
    ) -> SignalDisposition
    where
        B: Board + ?Sized,
    {
        match self.state {
            SessionState::Entering => {
                board.disable_edge_interrupt(Pin::Signal);
                board.stop();
                board.set_output(Pin::Charge, Level::High);

                let saved = self.saved_energy.unwrap_or_default();
                let report = SessionReport::Entered { saved };
                SignalDisposition::Transitioned(self.move_to(
                    board,
                    SessionState::Debug,
                    Some(report),
                ))
            }
            SessionState::Exiting => {
                board.disable_edge_interrupt(Pin::Signal);
                board.stop();
                board.set_output(Pin::Charge, Level::Low);

                let saved = self.saved_energy.take().unwrap_or_default();
                let restored = match regulator.ramp(
                    board,
                    mux,
                    logged,
                    Channel::CapVoltage,
                    saved,
                    Direction::Discharge,
                ) {
                    Ok(report) => report.reading,
                    Err(RegulationError::BudgetExhausted { reading, .. }) => reading,
                    Err(RegulationError::Mux(_)) => board.sample_blocking(Channel::CapVoltage),
                };

                pulse_signal(board);
                board.set_output(Pin::LedRed, Level::Low);

                let report = SessionReport::Exited { saved, restored };
                SignalDisposition::Transitioned(self.move_to(
                    board,
                    SessionState::Idle,
                    Some(report),
                ))
            }
            SessionState::Idle | SessionState::Debug => SignalDisposition::Ignored(self.state),
        }
    }

    /// Forces the session back to idle from any state with power injection
    /// off.
    pub fn reset<B>(&mut self, board: &mut B) -> Transition
    where
        B: Board + ?Sized,
    {
        board.stop();
        board.set_output(Pin::Charge, Level::Low);
        board.disable_edge_interrupt(Pin::Signal);
        board.set_output(Pin::LedRed, Level::Low);
        self.saved_energy = None;

        self.move_to(board, SessionState::Idle, None)
    }

    /// Checks that a host command may drive the power actuator. The session
    /// owns injection from entry until the target has resumed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] while a session is active.
    pub const fn claim_actuator(&self) -> Result<(), SessionError> {
        if self.state.in_session() {
            Err(SessionError::InvalidTransition {
                state: self.state,
                event: SessionEvent::Actuate,
            })
        } else {
            Ok(())
        }
    }

    fn expect(&self, state: SessionState, event: SessionEvent) -> Result<(), SessionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                state: self.state,
                event,
            })
        }
    }

    fn move_to<B>(
        &mut self,
        board: &mut B,
        to: SessionState,
        report: Option<SessionReport>,
    ) -> Transition
    where
        B: Board + ?Sized,
    {
        let from = self.state;
        self.state = to;

        if self.config.state_pins {
            let code = to.code();
            board.set_output(Pin::State0, Level::from(code & 0b01 != 0));
            board.set_output(Pin::State1, Level::from(code & 0b10 != 0));
        }

        Transition { from, to, report }
    }
}

/// Pulses the signal line low and returns it to high impedance.
pub fn pulse_signal<B>(board: &mut B)
where
    B: Board + ?Sized,
{
    board.set_output(Pin::Signal, Level::High);
    board.set_direction(Pin::Signal, PinMode::Output);
    board.set_output(Pin::Signal, Level::Low);
    board.set_direction(Pin::Signal, PinMode::Input);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_round_trip() {
        for state in [
            SessionState::Idle,
            SessionState::Entering,
            SessionState::Debug,
            SessionState::Exiting,
        ] {
            assert_eq!(SessionState::from_code(state.code()), Some(state));
        }
        assert_eq!(SessionState::from_code(4), None);
    }

    #[test]
    fn only_idle_is_outside_a_session() {
        assert!(!SessionState::Idle.in_session());
        assert!(SessionState::Entering.in_session());
        assert!(SessionState::Exiting.in_session());
    }

    #[test]
    fn invalid_transition_renders_event_and_state() {
        let error = SessionError::InvalidTransition {
            state: SessionState::Debug,
            event: SessionEvent::EnterDebug,
        };
        let mut rendered = heapless::String::<64>::new();
        core::fmt::write(&mut rendered, format_args!("{error}")).unwrap();
        assert_eq!(rendered.as_str(), "enter-debug not accepted while debug");
    }

    #[test]
    fn actuator_is_free_only_outside_a_session() {
        let mut session = DebugSession::new(SessionConfig::new());
        assert_eq!(session.claim_actuator(), Ok(()));

        session.state = SessionState::Debug;
        assert_eq!(
            session.claim_actuator(),
            Err(SessionError::InvalidTransition {
                state: SessionState::Debug,
                event: SessionEvent::Actuate,
            })
        );
    }
}
