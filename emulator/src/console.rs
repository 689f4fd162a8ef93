//! Console grammar for the emulator REPL.
//!
//! Lines are parsed with `winnow` into [`ConsoleCommand`] values. Most commands
//! map directly onto a [`HostCommand`] that the session encodes into a wire
//! frame; the rest drive the simulation itself. Voltages are given in volts
//! (`2.4` or `2.4V`) and converted to ADC counts.

use std::fmt;

use edb_core::channel::Channel;
use edb_core::config::millivolts_to_counts;
use edb_core::protocol::HostCommand;
use winnow::ascii::{dec_uint, digit1, space0, space1};
use winnow::combinator::{eof, fail, opt, preceded};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::{one_of, take_while};

pub const HELP_TOPICS: &[(&str, &str)] = &[
    ("sense", "sense <channel>              - read a channel once"),
    ("set", "set <channel> <volts>        - regulate a channel to a voltage"),
    ("charge", "charge <volts>               - charge the capacitor to a voltage"),
    ("discharge", "discharge <volts>            - discharge the capacitor to a voltage"),
    ("int", "int                          - interrupt the target into debug mode"),
    ("cont", "cont                         - restore energy and resume the target"),
    ("reset", "reset                        - abort the session and release power"),
    ("log", "log <begin|end> <channel>    - start or stop streaming a channel"),
    ("stream", "stream [passes]              - run scan passes and stream samples"),
    ("scope", "scope                        - pulse the scope trigger"),
    ("pwm", "pwm <on|off|high|period <n>|duty <n>> - drive the actuator"),
    ("state", "state                        - query the session state"),
    ("status", "status                       - show the simulated board"),
    ("help", "help [topic]                 - show help for a command"),
];

/// Parsed console line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Command sent to the debugger over the host link.
    Device(HostCommand),
    /// Runs scan passes so logged channels stream.
    Stream { passes: u32 },
    /// Prints the simulated board state.
    Status,
    Help(Option<String>),
}

/// Parse failure with the byte offset it occurred at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleError {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message.replace('\n', "; ");
        if message.is_empty() {
            write!(f, "at column {}", self.offset + 1)
        } else {
            write!(f, "at column {}: {message}", self.offset + 1)
        }
    }
}

/// Parses one console line.
pub fn parse_line(line: &str) -> Result<ConsoleCommand, ConsoleError> {
    command.parse(line.trim()).map_err(|error| ConsoleError {
        offset: error.offset(),
        message: error.inner().to_string(),
    })
}

fn command(input: &mut &str) -> ModalResult<ConsoleCommand> {
    let keyword = word.parse_next(input)?.to_ascii_lowercase();
    let parsed = match keyword.as_str() {
        "sense" => device(preceded(space1, channel).map(HostCommand::GetReading), input)?,
        "set" => device(
            (preceded(space1, channel), preceded(space1, counts))
                .map(|(channel, target)| HostCommand::SetVoltage { channel, target }),
            input,
        )?,
        "charge" => device(preceded(space1, counts).map(HostCommand::Charge), input)?,
        "discharge" => device(preceded(space1, counts).map(HostCommand::Discharge), input)?,
        "int" => ConsoleCommand::Device(HostCommand::EnterDebug),
        "cont" => ConsoleCommand::Device(HostCommand::ExitDebug),
        "reset" => ConsoleCommand::Device(HostCommand::Reset),
        "scope" => ConsoleCommand::Device(HostCommand::TriggerScope),
        "state" => ConsoleCommand::Device(HostCommand::GetSessionState),
        "log" => device(preceded(space1, log_action), input)?,
        "pwm" => device(preceded(space1, pwm_action), input)?,
        "stream" => {
            let passes = opt(preceded(space1, dec_uint::<_, u32, _>)).parse_next(input)?;
            ConsoleCommand::Stream {
                passes: passes.unwrap_or(1),
            }
        }
        "status" => ConsoleCommand::Status,
        "help" => {
            let topic = opt(preceded(space1, word)).parse_next(input)?;
            ConsoleCommand::Help(topic.map(str::to_ascii_lowercase))
        }
        _ => fail
            .context(StrContext::Label("command"))
            .parse_next(input)?,
    };

    (space0, eof)
        .context(StrContext::Expected(StrContextValue::Description("end of line")))
        .parse_next(input)?;
    Ok(parsed)
}

fn device<'s>(
    mut parser: impl Parser<&'s str, HostCommand, ErrMode<ContextError>>,
    input: &mut &'s str,
) -> ModalResult<ConsoleCommand> {
    parser.parse_next(input).map(ConsoleCommand::Device)
}

fn word<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        .parse_next(input)
}

fn channel(input: &mut &str) -> ModalResult<Channel> {
    word.verify_map(Channel::from_label)
        .context(StrContext::Label("channel"))
        .context(StrContext::Expected(StrContextValue::Description(
            "vcap, vboost, vreg, vrect or vinj",
        )))
        .parse_next(input)
}

/// Parses a voltage such as `2`, `2.45` or `2.45V` into millivolts.
fn millivolts(input: &mut &str) -> ModalResult<u32> {
    (
        digit1.try_map(str::parse::<u32>),
        opt(preceded('.', digit1)),
        opt(one_of(['v', 'V'])),
    )
        .verify_map(|(whole, fraction, _): (u32, Option<&str>, Option<char>)| {
            let mut millis = 0u32;
            let mut scale = 100u32;
            for digit in fraction.unwrap_or_default().bytes().take(3) {
                millis += u32::from(digit - b'0') * scale;
                scale /= 10;
            }
            whole.checked_mul(1_000)?.checked_add(millis)
        })
        .context(StrContext::Expected(StrContextValue::Description(
            "voltage in volts",
        )))
        .parse_next(input)
}

fn counts(input: &mut &str) -> ModalResult<u16> {
    millivolts.map(millivolts_to_counts).parse_next(input)
}

fn log_action(input: &mut &str) -> ModalResult<HostCommand> {
    let action = word.parse_next(input)?.to_ascii_lowercase();
    let channel = preceded(space1, channel).parse_next(input)?;
    match action.as_str() {
        "begin" | "start" => Ok(HostCommand::BeginLog(channel)),
        "end" | "stop" => Ok(HostCommand::EndLog(channel)),
        _ => fail
            .context(StrContext::Expected(StrContextValue::Description(
                "begin or end",
            )))
            .parse_next(input),
    }
}

fn pwm_action(input: &mut &str) -> ModalResult<HostCommand> {
    let action = word.parse_next(input)?.to_ascii_lowercase();
    match action.as_str() {
        "on" => Ok(HostCommand::PwmOn),
        "off" => Ok(HostCommand::PwmOff),
        "high" => Ok(HostCommand::PwmHigh),
        "period" => preceded(space1, dec_uint::<_, u16, _>)
            .map(HostCommand::SetPwmPeriod)
            .parse_next(input),
        "duty" => preceded(space1, dec_uint::<_, u16, _>)
            .map(HostCommand::SetPwmDutyCycle)
            .parse_next(input),
        _ => fail
            .context(StrContext::Expected(StrContextValue::Description(
                "on, off, high, period or duty",
            )))
            .parse_next(input),
    }
}

/// Comma-separated list of help topics.
pub fn help_topic_list() -> String {
    HELP_TOPICS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}
