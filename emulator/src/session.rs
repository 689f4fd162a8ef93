use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant as HostInstant};

use edb_core::channel::Reading;
use edb_core::config::{EdbConfig, IterationBudget, RegulationConfig, counts_to_millivolts};
use edb_core::dispatch::{CommandError, CommandExecutor};
use edb_core::hal::{Level, Pin, PinMode, PwmActuator};
use edb_core::protocol::{Frame, FrameAssembler, HostCommand, Response, TargetMessage};
use edb_core::session::SignalDisposition;

use crate::console::{self, ConsoleCommand, HELP_TOPICS};
use crate::sim::{SimBoard, SimLink, SimTarget};

/// Capacitor reading the simulated board powers up with.
const INITIAL_CAP: Reading = 2_200;
/// Host link depth before streamed samples are dropped.
const HOST_LINK_DEPTH: usize = 64;
/// Poll limit for ramps; a stuck ramp reports instead of hanging the console.
const RAMP_BUDGET: u32 = 20_000;
/// Step limit for the duty-cycle search.
const SEARCH_BUDGET: u32 = 4_096;
/// Handshake rounds between the debugger and the simulated target per command.
const MAX_HANDSHAKE_ROUNDS: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranscriptProfile {
    Debug,
    Regulate,
    Stream,
}

impl TranscriptProfile {
    pub fn log_path(self) -> &'static str {
        match self {
            TranscriptProfile::Debug => "transcripts/emulator-debug.log",
            TranscriptProfile::Regulate => "transcripts/emulator-regulate.log",
            TranscriptProfile::Stream => "transcripts/emulator-stream.log",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            TranscriptProfile::Debug => "EDB emulator debug session transcript",
            TranscriptProfile::Regulate => "EDB emulator regulation transcript",
            TranscriptProfile::Stream => "EDB emulator streaming transcript",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        if tag.eq_ignore_ascii_case("debug") {
            Ok(Self::Debug)
        } else if tag.eq_ignore_ascii_case("regulate") {
            Ok(Self::Regulate)
        } else if tag.eq_ignore_ascii_case("stream") {
            Ok(Self::Stream)
        } else {
            Err(format!("Unknown transcript profile `{tag}`"))
        }
    }
}

pub fn emulator_config() -> EdbConfig {
    EdbConfig {
        regulation: RegulationConfig {
            ramp_budget: IterationBudget::Limited(RAMP_BUDGET),
            search_budget: IterationBudget::Limited(SEARCH_BUDGET),
            ..RegulationConfig::new()
        },
        ..EdbConfig::new()
    }
}

pub struct Session {
    executor: CommandExecutor<SimBoard, SimLink>,
    target: SimTarget,
    assembler: FrameAssembler,
    transcript: TranscriptLogger,
    started_at: HostInstant,
}

impl Session {
    pub fn new(profile: TranscriptProfile) -> io::Result<Self> {
        let transcript = TranscriptLogger::new(profile)?;
        let executor = CommandExecutor::new(
            SimBoard::new(INITIAL_CAP),
            SimLink::new(HOST_LINK_DEPTH),
            emulator_config(),
        );

        Ok(Self {
            executor,
            target: SimTarget::new(),
            assembler: FrameAssembler::new(),
            transcript,
            started_at: HostInstant::now(),
        })
    }

    pub fn board(&self) -> &SimBoard {
        self.executor.board()
    }

    pub fn board_mut(&mut self) -> &mut SimBoard {
        self.executor.board_mut()
    }

    pub fn target(&self) -> &SimTarget {
        &self.target
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        self.transcript
            .append_line(elapsed, TranscriptRole::Host, trimmed)?;

        let lines = match console::parse_line(trimmed) {
            Ok(ConsoleCommand::Device(command)) => self.run_device_command(command),
            Ok(ConsoleCommand::Stream { passes }) => self.run_stream(passes),
            Ok(ConsoleCommand::Status) => self.describe_status(),
            Ok(ConsoleCommand::Help(topic)) => describe_help(topic.as_deref()),
            Err(error) => vec![format!("ERR syntax {error}")],
        };

        self.record_output(self.started_at.elapsed(), &lines)?;
        Ok(lines)
    }

    /// Sends the command through the wire codec and the executor, then lets
    /// the simulated target answer any handshake it started.
    fn run_device_command(&mut self, command: HostCommand) -> Vec<String> {
        let mut lines = Vec::new();
        for byte in command.encode().encode() {
            let Some(frame) = self.assembler.push(byte) else {
                continue;
            };
            if let Err(error) = self.executor.handle_frame(&frame) {
                lines.push(describe_error(&error));
            }
        }

        lines.extend(self.run_target());
        lines.extend(self.drain_host());
        // Rejections arrive as frames; keep the detailed reason after them.
        lines.sort_by_key(|line| line.starts_with("  "));
        lines
    }

    fn run_stream(&mut self, passes: u32) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..passes {
            let timestamp = elapsed_millis(self.started_at.elapsed());
            match self.executor.on_scan_complete(timestamp) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    lines.push("OK stream idle (no channels logged)".to_string());
                    break;
                }
                Err(error) => lines.push(describe_error(&error)),
            }
        }
        lines.extend(self.drain_host());
        let dropped = std::mem::take(&mut self.executor.transport_mut().dropped);
        if dropped > 0 {
            lines.push(format!("WARN host link busy, dropped {dropped} frames"));
        }
        lines
    }

    fn run_target(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..MAX_HANDSHAKE_ROUNDS {
            let mut acknowledged = false;
            if self.executor.board_mut().take_pulse() {
                acknowledged |= self.target.on_pulse();
            }
            for frame in self.executor.transport_mut().drain_target() {
                match TargetMessage::decode(&frame) {
                    Ok(message) => acknowledged |= self.target.on_message(message),
                    Err(error) => lines.push(format!("  target dropped frame: {error}")),
                }
            }
            let running = self.target.is_running();
            self.executor.board_mut().target_running = running;

            if !acknowledged || !self.executor.board().edge_armed() {
                break;
            }

            match self.executor.on_target_signal() {
                Ok(SignalDisposition::Transitioned(transition)) => lines.push(format!(
                    "  session {} -> {} (target {})",
                    transition.from,
                    transition.to,
                    self.target.mode().label()
                )),
                Ok(SignalDisposition::Ignored(state)) => {
                    lines.push(format!("  target signal ignored while {state}"));
                }
                Err(error) => lines.push(describe_error(&error)),
            }
        }
        lines
    }

    fn drain_host(&mut self) -> Vec<String> {
        self.executor
            .transport_mut()
            .drain_host()
            .iter()
            .map(describe_frame)
            .collect()
    }

    fn describe_status(&self) -> Vec<String> {
        let board = self.executor.board();
        let session = self.executor.session();
        let saved = session
            .saved_energy()
            .map_or_else(|| "-".to_string(), format_reading);
        vec![
            format!(
                "board cap={} charge={} discharge={} pwm={} duty={}/{}",
                format_reading(board.cap()),
                level_label(board.level(Pin::Charge)),
                if board.mode(Pin::Discharge) == PinMode::Output {
                    "on"
                } else {
                    "off"
                },
                if board.pwm_running() { "on" } else { "off" },
                board.duty_cycle(),
                board.period(),
            ),
            format!(
                "scan {} active=[{}] logged={}",
                if board.scanning() { "running" } else { "stopped" },
                self.executor
                    .mux()
                    .active()
                    .iter()
                    .map(|channel| channel.label())
                    .collect::<Vec<_>>()
                    .join(","),
                self.executor.log_stream().mask().len(),
            ),
            format!("session {} saved={saved}", session.state()),
            format!(
                "target {} interrupts={} conversions={}",
                self.target.mode().label(),
                self.target.interrupts(),
                board.conversions(),
            ),
        ]
    }

    fn record_output(&mut self, elapsed: Duration, lines: &[String]) -> io::Result<()> {
        for line in lines {
            self.transcript
                .append_line(elapsed, TranscriptRole::Emulator, line)?;
        }
        Ok(())
    }
}

fn describe_help(topic: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();
    match topic {
        Some(target) => {
            if let Some((_, detail)) = HELP_TOPICS.iter().find(|(name, _)| *name == target) {
                lines.push((*detail).to_string());
            } else {
                lines.push(format!("No help available for `{target}`."));
                lines.push(format!("Available topics: {}", console::help_topic_list()));
            }
        }
        None => {
            lines.push("Available commands:".to_string());
            for (_, detail) in HELP_TOPICS {
                lines.push(format!("  {detail}"));
            }
            lines.push("Type `help <topic>` for a specific command.".to_string());
        }
    }
    lines
}

fn describe_error(error: &CommandError) -> String {
    format!("  detail: {error}")
}

fn describe_frame(frame: &Frame) -> String {
    match Response::decode(frame) {
        Ok(response) => describe_response(&response),
        Err(error) => format!("ERR undecodable response: {error}"),
    }
}

pub fn describe_response(response: &Response) -> String {
    match *response {
        Response::Reading { channel, reading } => {
            format!("OK sense {channel}={}", format_reading(reading))
        }
        Response::VoltageSet { channel, reading } => {
            format!("OK set {channel}={}", format_reading(reading))
        }
        Response::DebugEntered { saved } => {
            format!("OK debug entered saved={}", format_reading(saved))
        }
        Response::DebugExited { saved, restored } => format!(
            "OK debug exited saved={} restored={}",
            format_reading(saved),
            format_reading(restored)
        ),
        Response::Ramped { direction, reading } => {
            format!("OK {} reached {}", direction.label(), format_reading(reading))
        }
        Response::LogTime { timestamp } => format!("LOG t={timestamp}ms"),
        Response::LogReading { channel, reading } => {
            format!("LOG   {channel}={}", format_reading(reading))
        }
        Response::SessionState(state) => format!("OK state {state}"),
        Response::Ack { command } => format!("OK ack 0x{command:02x}"),
        Response::Rejected { command, reason } => {
            format!("ERR rejected 0x{command:02x} {}", reason.label())
        }
    }
}

fn format_reading(reading: Reading) -> String {
    let millivolts = counts_to_millivolts(reading);
    format!("{reading} ({}.{:03}V)", millivolts / 1_000, millivolts % 1_000)
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::Low => "low",
        Level::High => "high",
    }
}

fn elapsed_millis(elapsed: Duration) -> u32 {
    u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX)
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(profile: TranscriptProfile) -> io::Result<Self> {
        let path = Path::new(profile.log_path());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };

        logger.write_header(profile)?;
        Ok(logger)
    }

    fn write_header(&mut self, profile: TranscriptProfile) -> io::Result<()> {
        writeln!(self.writer, "# {}", profile.header())?;
        writeln!(
            self.writer,
            "# Timestamps are milliseconds since session start"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EDB <",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edb_core::channel::Channel;
    use edb_core::config::millivolts_to_counts;
    use edb_core::protocol::RejectReason;
    use edb_core::session::SessionState;

    fn session() -> Session {
        Session::new(TranscriptProfile::Debug).unwrap()
    }

    #[test]
    fn debug_round_trip_restores_saved_energy() {
        let mut session = session();
        let saved = session.board().cap();

        let lines = session.handle_command("int").unwrap();
        assert!(lines.iter().any(|line| line.starts_with("OK debug entered")));
        assert_eq!(session.executor.session_state(), SessionState::Debug);
        assert!(!session.target().is_running());

        let lines = session.handle_command("charge 2.9").unwrap();
        assert!(lines.iter().any(|line| line.starts_with("OK charge reached")));
        assert!(session.board().cap() >= millivolts_to_counts(2_900));

        let lines = session.handle_command("cont").unwrap();
        assert!(lines.iter().any(|line| line.starts_with("OK debug exited")));
        assert_eq!(session.executor.session_state(), SessionState::Idle);
        assert!(session.target().is_running());
        assert!(session.board().cap() <= saved);
        assert_eq!(session.board().level(Pin::LedRed), Level::Low);
    }

    #[test]
    fn out_of_order_exit_is_rejected() {
        let mut session = session();
        let lines = session.handle_command("cont").unwrap();
        assert_eq!(
            lines[0],
            describe_response(&Response::Rejected {
                command: HostCommand::ExitDebug.descriptor(),
                reason: RejectReason::InvalidTransition,
            })
        );
        assert!(lines[1].starts_with("  detail:"));
    }

    #[test]
    fn set_voltage_converges_on_the_simulated_plant() {
        let mut session = session();
        let target = millivolts_to_counts(2_000);
        let lines = session.handle_command("set vcap 2.0").unwrap();
        assert!(lines[0].starts_with("OK set vcap="), "{lines:?}");
        assert!(session.board().pwm_running());
        assert!(session.board().cap().abs_diff(target) <= 2);
    }

    #[test]
    fn streaming_emits_timestamped_samples() {
        let mut session = session();
        session.handle_command("log begin vcap").unwrap();
        session.handle_command("log begin vboost").unwrap();

        let lines = session.handle_command("stream 2").unwrap();
        let stamps = lines.iter().filter(|line| line.starts_with("LOG t=")).count();
        assert_eq!(stamps, 2);
        assert_eq!(lines.iter().filter(|line| line.contains("vboost=")).count(), 2);

        session.handle_command("log end vcap").unwrap();
        session.handle_command("log end vboost").unwrap();
        let lines = session.handle_command("stream").unwrap();
        assert_eq!(lines, vec!["OK stream idle (no channels logged)".to_string()]);
        assert!(!session.board().scanning());
    }

    #[test]
    fn syntax_errors_do_not_reach_the_debugger() {
        let mut session = session();
        let lines = session.handle_command("sense vfoo").unwrap();
        assert!(lines[0].starts_with("ERR syntax"));
        assert_eq!(session.board().conversions(), 0);
    }

    #[test]
    fn sense_reports_fixed_channels() {
        let mut session = session();
        let lines = session.handle_command("sense vrect").unwrap();
        assert_eq!(lines, vec![describe_response(&Response::Reading {
            channel: Channel::RectVoltage,
            reading: session.board().rectified,
        })]);
    }
}
