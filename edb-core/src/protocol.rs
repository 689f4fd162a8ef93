//! Wire protocol shared by the host link and the target link.
//!
//! Every message travels in a frame: the `0xF0` sync byte, a descriptor, a
//! payload length and up to [`MAX_PAYLOAD_LEN`] payload bytes. Integers are
//! little-endian and channels are sent as their index. Descriptor ranges keep
//! the three message families apart:
//!
//! | Range | Direction |
//! |---|---|
//! | `0x01..=0x1F` | host to debugger ([`HostCommand`]) |
//! | `0x40..=0x5F` | debugger to target ([`TargetMessage`]) |
//! | `0x80..=0x9F` | debugger to host ([`Response`]) |
//!
//! Payloads are decoded with `winnow` binary parsers; a frame is only accepted
//! when its payload is consumed exactly.

#![allow(clippy::module_name_repetitions)]

use core::fmt;

use heapless::Vec;
use winnow::ModalResult;
use winnow::binary::{le_u16, le_u32, u8 as byte};
use winnow::combinator::empty;
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;

use crate::channel::{Channel, Reading};
use crate::config::{FRAME_SYNC, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
use crate::regulation::Direction;
use crate::session::SessionState;

/// Descriptor bytes for every message family.
pub mod descriptor {
    pub const GET_READING: u8 = 0x01;
    pub const SET_VOLTAGE: u8 = 0x02;
    pub const ENTER_DEBUG: u8 = 0x03;
    pub const EXIT_DEBUG: u8 = 0x04;
    pub const RESET: u8 = 0x05;
    pub const BEGIN_LOG: u8 = 0x06;
    pub const END_LOG: u8 = 0x07;
    pub const CHARGE: u8 = 0x08;
    pub const DISCHARGE: u8 = 0x09;
    pub const TRIGGER_SCOPE: u8 = 0x0A;
    pub const PWM_ON: u8 = 0x0B;
    pub const PWM_OFF: u8 = 0x0C;
    pub const PWM_HIGH: u8 = 0x0D;
    pub const SET_PWM_PERIOD: u8 = 0x0E;
    pub const SET_PWM_DUTY_CYCLE: u8 = 0x0F;
    pub const GET_SESSION_STATE: u8 = 0x10;
    /// Alias of [`PWM_OFF`] kept for older host tools.
    pub const RELEASE_POWER: u8 = 0x11;
    /// Alias of [`PWM_OFF`] kept for older host tools.
    pub const PWM_LOW: u8 = 0x12;

    pub const TARGET_EXIT_DEBUG: u8 = 0x40;

    pub const READING: u8 = 0x80;
    pub const VOLTAGE_SET: u8 = 0x81;
    pub const DEBUG_ENTERED: u8 = 0x82;
    pub const DEBUG_EXITED: u8 = 0x83;
    pub const RAMPED: u8 = 0x84;
    pub const LOG_TIME: u8 = 0x85;
    pub const LOG_READING: u8 = 0x86;
    pub const SESSION_STATE: u8 = 0x87;
    pub const ACK: u8 = 0x88;
    pub const REJECTED: u8 = 0x89;
}

/// Errors raised while framing or decoding messages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtocolError {
    /// The descriptor does not name a message of the expected family.
    UnknownDescriptor(u8),
    /// The payload did not match the message layout.
    MalformedPayload { descriptor: u8 },
    /// The payload carried bytes past the end of the message.
    TrailingBytes { descriptor: u8 },
    /// The payload exceeds [`MAX_PAYLOAD_LEN`].
    PayloadTooLong,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownDescriptor(descriptor) => {
                write!(f, "unknown descriptor 0x{descriptor:02x}")
            }
            ProtocolError::MalformedPayload { descriptor } => {
                write!(f, "malformed payload for 0x{descriptor:02x}")
            }
            ProtocolError::TrailingBytes { descriptor } => {
                write!(f, "trailing bytes after 0x{descriptor:02x}")
            }
            ProtocolError::PayloadTooLong => f.write_str("payload exceeds frame limit"),
        }
    }
}

/// Payload buffer for a single frame.
pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

/// Encoded frame bytes.
pub type FrameBytes = Vec<u8, MAX_FRAME_LEN>;

/// Descriptor plus payload, without the framing bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    descriptor: u8,
    payload: Payload,
}

impl Frame {
    /// Builds a frame, rejecting oversize payloads.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLong`] past the payload limit.
    pub fn new(descriptor: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let payload = Vec::from_slice(payload).map_err(|_| ProtocolError::PayloadTooLong)?;
        Ok(Self {
            descriptor,
            payload,
        })
    }

    /// Builds a frame from a payload known to fit.
    fn short(descriptor: u8, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_PAYLOAD_LEN);
        Self {
            descriptor,
            payload: Vec::from_slice(&payload[..len]).unwrap_or_default(),
        }
    }

    #[must_use]
    pub const fn descriptor(&self) -> u8 {
        self.descriptor
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialises the frame including sync and length bytes.
    #[must_use]
    pub fn encode(&self) -> FrameBytes {
        let mut out = FrameBytes::new();
        // Capacity covers the header plus a full payload.
        let _ = encode_frame(self.descriptor, &self.payload, &mut out);
        out
    }
}

/// Writes a framed message into `out`, replacing its contents.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLong`] past the payload limit.
pub fn encode_frame(
    descriptor: u8,
    payload: &[u8],
    out: &mut FrameBytes,
) -> Result<(), ProtocolError> {
    let length = u8::try_from(payload.len())
        .ok()
        .filter(|len| usize::from(*len) <= MAX_PAYLOAD_LEN)
        .ok_or(ProtocolError::PayloadTooLong)?;

    out.clear();
    out.extend_from_slice(&[FRAME_SYNC, descriptor, length])
        .and_then(|()| out.extend_from_slice(payload))
        .map_err(|_| ProtocolError::PayloadTooLong)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum AssemblerState {
    Sync,
    Descriptor,
    Length,
    Payload,
}

/// Incremental frame decoder over a byte stream.
///
/// Bytes outside a frame are discarded until the next sync byte. A length
/// byte above the payload limit abandons the frame and resynchronises.
#[derive(Clone, Debug)]
pub struct FrameAssembler {
    state: AssemblerState,
    descriptor: u8,
    expected: usize,
    payload: Payload,
    discarded: u32,
}

impl FrameAssembler {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AssemblerState::Sync,
            descriptor: 0,
            expected: 0,
            payload: Vec::new(),
            discarded: 0,
        }
    }

    /// Number of bytes dropped while hunting for a frame.
    #[must_use]
    pub const fn discarded(&self) -> u32 {
        self.discarded
    }

    /// Returns `true` when no frame is partially assembled.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == AssemblerState::Sync
    }

    /// Drops any partial frame.
    pub fn reset(&mut self) {
        self.state = AssemblerState::Sync;
        self.payload.clear();
    }

    /// Feeds one byte; returns a frame when it completes one.
    pub fn push(&mut self, value: u8) -> Option<Frame> {
        match self.state {
            AssemblerState::Sync => {
                if value == FRAME_SYNC {
                    self.state = AssemblerState::Descriptor;
                } else {
                    self.discarded = self.discarded.saturating_add(1);
                }
                None
            }
            AssemblerState::Descriptor => {
                if value == FRAME_SYNC {
                    self.discarded = self.discarded.saturating_add(1);
                } else {
                    self.descriptor = value;
                    self.state = AssemblerState::Length;
                }
                None
            }
            AssemblerState::Length => {
                let expected = usize::from(value);
                if expected > MAX_PAYLOAD_LEN {
                    self.discarded = self.discarded.saturating_add(3);
                    self.reset();
                    return None;
                }
                self.expected = expected;
                self.payload.clear();
                if expected == 0 {
                    return Some(self.finish());
                }
                self.state = AssemblerState::Payload;
                None
            }
            AssemblerState::Payload => {
                let _ = self.payload.push(value);
                if self.payload.len() == self.expected {
                    Some(self.finish())
                } else {
                    None
                }
            }
        }
    }

    fn finish(&mut self) -> Frame {
        self.state = AssemblerState::Sync;
        let payload = core::mem::take(&mut self.payload);
        Frame {
            descriptor: self.descriptor,
            payload,
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests accepted from the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostCommand {
    GetReading(Channel),
    SetVoltage { channel: Channel, target: Reading },
    EnterDebug,
    ExitDebug,
    Reset,
    BeginLog(Channel),
    EndLog(Channel),
    Charge(Reading),
    Discharge(Reading),
    TriggerScope,
    PwmOn,
    /// Stops the actuator; also sent as "release power" and "PWM low".
    PwmOff,
    /// Stops the actuator and holds the charge source on.
    PwmHigh,
    /// Sets the actuator period in timer counts.
    SetPwmPeriod(u16),
    SetPwmDutyCycle(u16),
    GetSessionState,
}

impl HostCommand {
    #[must_use]
    pub const fn descriptor(&self) -> u8 {
        match self {
            HostCommand::GetReading(_) => descriptor::GET_READING,
            HostCommand::SetVoltage { .. } => descriptor::SET_VOLTAGE,
            HostCommand::EnterDebug => descriptor::ENTER_DEBUG,
            HostCommand::ExitDebug => descriptor::EXIT_DEBUG,
            HostCommand::Reset => descriptor::RESET,
            HostCommand::BeginLog(_) => descriptor::BEGIN_LOG,
            HostCommand::EndLog(_) => descriptor::END_LOG,
            HostCommand::Charge(_) => descriptor::CHARGE,
            HostCommand::Discharge(_) => descriptor::DISCHARGE,
            HostCommand::TriggerScope => descriptor::TRIGGER_SCOPE,
            HostCommand::PwmOn => descriptor::PWM_ON,
            HostCommand::PwmOff => descriptor::PWM_OFF,
            HostCommand::PwmHigh => descriptor::PWM_HIGH,
            HostCommand::SetPwmPeriod(_) => descriptor::SET_PWM_PERIOD,
            HostCommand::SetPwmDutyCycle(_) => descriptor::SET_PWM_DUTY_CYCLE,
            HostCommand::GetSessionState => descriptor::GET_SESSION_STATE,
        }
    }

    /// Encodes the command as a frame.
    #[must_use]
    pub fn encode(&self) -> Frame {
        let descriptor = self.descriptor();
        match *self {
            HostCommand::GetReading(channel)
            | HostCommand::BeginLog(channel)
            | HostCommand::EndLog(channel) => Frame::short(descriptor, &[channel.code()]),
            HostCommand::SetVoltage { channel, target } => {
                let [lo, hi] = target.to_le_bytes();
                Frame::short(descriptor, &[channel.code(), lo, hi])
            }
            HostCommand::Charge(value)
            | HostCommand::Discharge(value)
            | HostCommand::SetPwmPeriod(value)
            | HostCommand::SetPwmDutyCycle(value) => Frame::short(descriptor, &value.to_le_bytes()),
            HostCommand::EnterDebug
            | HostCommand::ExitDebug
            | HostCommand::Reset
            | HostCommand::TriggerScope
            | HostCommand::PwmOn
            | HostCommand::PwmOff
            | HostCommand::PwmHigh
            | HostCommand::GetSessionState => Frame::short(descriptor, &[]),
        }
    }

    /// Decodes a host frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for unknown descriptors and malformed
    /// payloads.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let descriptor = frame.descriptor();
        let payload = frame.payload();
        let unit = |command: HostCommand| {
            parse_payload(descriptor, payload, empty).map(|()| command)
        };

        match descriptor {
            descriptor::GET_READING => {
                parse_payload(descriptor, payload, channel).map(HostCommand::GetReading)
            }
            descriptor::SET_VOLTAGE => parse_payload(descriptor, payload, (channel, reading))
                .map(|(channel, target)| HostCommand::SetVoltage { channel, target }),
            descriptor::ENTER_DEBUG => unit(HostCommand::EnterDebug),
            descriptor::EXIT_DEBUG => unit(HostCommand::ExitDebug),
            descriptor::RESET => unit(HostCommand::Reset),
            descriptor::BEGIN_LOG => {
                parse_payload(descriptor, payload, channel).map(HostCommand::BeginLog)
            }
            descriptor::END_LOG => {
                parse_payload(descriptor, payload, channel).map(HostCommand::EndLog)
            }
            descriptor::CHARGE => parse_payload(descriptor, payload, reading).map(HostCommand::Charge),
            descriptor::DISCHARGE => {
                parse_payload(descriptor, payload, reading).map(HostCommand::Discharge)
            }
            descriptor::TRIGGER_SCOPE => unit(HostCommand::TriggerScope),
            descriptor::PWM_ON => unit(HostCommand::PwmOn),
            descriptor::PWM_OFF | descriptor::RELEASE_POWER | descriptor::PWM_LOW => {
                unit(HostCommand::PwmOff)
            }
            descriptor::PWM_HIGH => unit(HostCommand::PwmHigh),
            descriptor::SET_PWM_PERIOD => {
                parse_payload(descriptor, payload, reading).map(HostCommand::SetPwmPeriod)
            }
            descriptor::SET_PWM_DUTY_CYCLE => {
                parse_payload(descriptor, payload, reading).map(HostCommand::SetPwmDutyCycle)
            }
            descriptor::GET_SESSION_STATE => unit(HostCommand::GetSessionState),
            other => Err(ProtocolError::UnknownDescriptor(other)),
        }
    }
}

/// Messages sent to the target over its link.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TargetMessage {
    /// Ask the target to leave debug mode and resume.
    ExitDebug,
}

impl TargetMessage {
    #[must_use]
    pub const fn descriptor(self) -> u8 {
        match self {
            TargetMessage::ExitDebug => descriptor::TARGET_EXIT_DEBUG,
        }
    }

    #[must_use]
    pub fn encode(self) -> Frame {
        Frame::short(self.descriptor(), &[])
    }

    /// Decodes a target-link frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for unknown descriptors and malformed
    /// payloads.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.descriptor() {
            descriptor::TARGET_EXIT_DEBUG => {
                parse_payload(frame.descriptor(), frame.payload(), empty)
                    .map(|()| TargetMessage::ExitDebug)
            }
            other => Err(ProtocolError::UnknownDescriptor(other)),
        }
    }
}

/// Reason attached to a [`Response::Rejected`] reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RejectReason {
    /// The session state does not accept the command.
    InvalidTransition,
    /// No scan slot was free for the channel.
    CapacityExceeded,
    /// A ramp or search gave up before reaching its target.
    BudgetExhausted,
    /// The outgoing queue had no room.
    LinkBusy,
}

impl RejectReason {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            RejectReason::InvalidTransition => 1,
            RejectReason::CapacityExceeded => 2,
            RejectReason::BudgetExhausted => 3,
            RejectReason::LinkBusy => 4,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(RejectReason::InvalidTransition),
            2 => Some(RejectReason::CapacityExceeded),
            3 => Some(RejectReason::BudgetExhausted),
            4 => Some(RejectReason::LinkBusy),
            _ => None,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            RejectReason::InvalidTransition => "invalid-transition",
            RejectReason::CapacityExceeded => "capacity-exceeded",
            RejectReason::BudgetExhausted => "budget-exhausted",
            RejectReason::LinkBusy => "link-busy",
        }
    }
}

/// Messages sent to the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Response {
    Reading { channel: Channel, reading: Reading },
    VoltageSet { channel: Channel, reading: Reading },
    DebugEntered { saved: Reading },
    DebugExited { saved: Reading, restored: Reading },
    Ramped { direction: Direction, reading: Reading },
    LogTime { timestamp: u32 },
    LogReading { channel: Channel, reading: Reading },
    SessionState(SessionState),
    Ack { command: u8 },
    Rejected { command: u8, reason: RejectReason },
}

impl Response {
    #[must_use]
    pub const fn descriptor(&self) -> u8 {
        match self {
            Response::Reading { .. } => descriptor::READING,
            Response::VoltageSet { .. } => descriptor::VOLTAGE_SET,
            Response::DebugEntered { .. } => descriptor::DEBUG_ENTERED,
            Response::DebugExited { .. } => descriptor::DEBUG_EXITED,
            Response::Ramped { .. } => descriptor::RAMPED,
            Response::LogTime { .. } => descriptor::LOG_TIME,
            Response::LogReading { .. } => descriptor::LOG_READING,
            Response::SessionState(_) => descriptor::SESSION_STATE,
            Response::Ack { .. } => descriptor::ACK,
            Response::Rejected { .. } => descriptor::REJECTED,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Frame {
        let descriptor = self.descriptor();
        match *self {
            Response::Reading { channel, reading }
            | Response::VoltageSet { channel, reading }
            | Response::LogReading { channel, reading } => {
                let [lo, hi] = reading.to_le_bytes();
                Frame::short(descriptor, &[channel.code(), lo, hi])
            }
            Response::DebugEntered { saved } => Frame::short(descriptor, &saved.to_le_bytes()),
            Response::DebugExited { saved, restored } => {
                let [s0, s1] = saved.to_le_bytes();
                let [r0, r1] = restored.to_le_bytes();
                Frame::short(descriptor, &[s0, s1, r0, r1])
            }
            Response::Ramped { direction, reading } => {
                let [lo, hi] = reading.to_le_bytes();
                Frame::short(descriptor, &[direction_code(direction), lo, hi])
            }
            Response::LogTime { timestamp } => Frame::short(descriptor, &timestamp.to_le_bytes()),
            Response::SessionState(state) => Frame::short(descriptor, &[state.code()]),
            Response::Ack { command } => Frame::short(descriptor, &[command]),
            Response::Rejected { command, reason } => {
                Frame::short(descriptor, &[command, reason.code()])
            }
        }
    }

    /// Decodes a host response frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for unknown descriptors and malformed
    /// payloads.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let descriptor = frame.descriptor();
        let payload = frame.payload();

        match descriptor {
            descriptor::READING => parse_payload(descriptor, payload, (channel, reading))
                .map(|(channel, reading)| Response::Reading { channel, reading }),
            descriptor::VOLTAGE_SET => parse_payload(descriptor, payload, (channel, reading))
                .map(|(channel, reading)| Response::VoltageSet { channel, reading }),
            descriptor::DEBUG_ENTERED => parse_payload(descriptor, payload, reading)
                .map(|saved| Response::DebugEntered { saved }),
            descriptor::DEBUG_EXITED => parse_payload(descriptor, payload, (reading, reading))
                .map(|(saved, restored)| Response::DebugExited { saved, restored }),
            descriptor::RAMPED => parse_payload(descriptor, payload, (direction, reading))
                .map(|(direction, reading)| Response::Ramped { direction, reading }),
            descriptor::LOG_TIME => parse_payload(descriptor, payload, timestamp)
                .map(|timestamp| Response::LogTime { timestamp }),
            descriptor::LOG_READING => parse_payload(descriptor, payload, (channel, reading))
                .map(|(channel, reading)| Response::LogReading { channel, reading }),
            descriptor::SESSION_STATE => {
                parse_payload(descriptor, payload, session_state).map(Response::SessionState)
            }
            descriptor::ACK => {
                parse_payload(descriptor, payload, byte).map(|command| Response::Ack { command })
            }
            descriptor::REJECTED => parse_payload(descriptor, payload, (byte, reject_reason))
                .map(|(command, reason)| Response::Rejected { command, reason }),
            other => Err(ProtocolError::UnknownDescriptor(other)),
        }
    }
}

const fn direction_code(direction: Direction) -> u8 {
    match direction {
        Direction::Charge => 0,
        Direction::Discharge => 1,
    }
}

type Input<'a> = &'a [u8];

fn parse_payload<'a, O, P>(descriptor: u8, mut input: Input<'a>, mut parser: P) -> Result<O, ProtocolError>
where
    P: Parser<Input<'a>, O, ErrMode<ContextError>>,
{
    let value = parser
        .parse_next(&mut input)
        .map_err(|_| ProtocolError::MalformedPayload { descriptor })?;
    if input.is_empty() {
        Ok(value)
    } else {
        Err(ProtocolError::TrailingBytes { descriptor })
    }
}

fn channel(input: &mut Input<'_>) -> ModalResult<Channel> {
    byte.verify_map(Channel::from_index).parse_next(input)
}

fn reading(input: &mut Input<'_>) -> ModalResult<Reading> {
    le_u16.parse_next(input)
}

fn timestamp(input: &mut Input<'_>) -> ModalResult<u32> {
    le_u32.parse_next(input)
}

fn session_state(input: &mut Input<'_>) -> ModalResult<SessionState> {
    byte.verify_map(SessionState::from_code).parse_next(input)
}

fn reject_reason(input: &mut Input<'_>) -> ModalResult<RejectReason> {
    byte.verify_map(RejectReason::from_code).parse_next(input)
}

fn direction(input: &mut Input<'_>) -> ModalResult<Direction> {
    byte.verify_map(|code| match code {
        0 => Some(Direction::Charge),
        1 => Some(Direction::Discharge),
        _ => None,
    })
    .parse_next(input)
}
