//! Control telemetry ring buffer and logging helpers.
//!
//! The recorder keeps a fixed-capacity history of session transitions,
//! regulation results, and link drops with the elapsed time between
//! successive records. Every record is mirrored to defmt on target and to
//! stdout on the host.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use edb_core::channel::{Channel, Reading};
use edb_core::protocol::RejectReason;
use edb_core::regulation::{Direction, RampReport, RegulationReport};
use edb_core::session::{SessionState, Transition};
use embassy_time::{Duration, Instant};
use heapless::HistoryBuf;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

pub type TelemetryRing = HistoryBuf<TelemetryRecord, TELEMETRY_RING_CAPACITY>;

/// Monotonic identifier assigned to each record.
pub type RecordId = u32;

/// Event captured by the control task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRecord {
    Session {
        from: SessionState,
        to: SessionState,
    },
    Ramp {
        channel: Channel,
        direction: Direction,
        reading: Reading,
        polls: u32,
    },
    Regulation {
        channel: Channel,
        target: Reading,
        reading: Reading,
        duty_cycle: u16,
    },
    CommandRejected {
        command: u8,
        reason: RejectReason,
    },
    /// Bytes discarded by the frame assembler while hunting for sync.
    FrameDropped { bytes: u32 },
    /// Outbound messages refused or evicted by the outbox.
    MessagesDropped { count: u32 },
}

impl From<Transition> for ControlRecord {
    fn from(transition: Transition) -> Self {
        Self::Session {
            from: transition.from,
            to: transition.to,
        }
    }
}

impl From<RampReport> for ControlRecord {
    fn from(report: RampReport) -> Self {
        Self::Ramp {
            channel: report.channel,
            direction: report.direction,
            reading: report.reading,
            polls: report.polls,
        }
    }
}

impl From<RegulationReport> for ControlRecord {
    fn from(report: RegulationReport) -> Self {
        Self::Regulation {
            channel: report.channel,
            target: report.target,
            reading: report.reading,
            duty_cycle: report.duty_cycle,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub id: RecordId,
    pub timestamp: Instant,
    pub elapsed_since_previous: Option<Duration>,
    pub event: ControlRecord,
}

pub struct TelemetryRecorder {
    ring: TelemetryRing,
    last_record_at: Option<Instant>,
    next_id: RecordId,
}

impl TelemetryRecorder {
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            last_record_at: None,
            next_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> impl Iterator<Item = &TelemetryRecord> + '_ {
        self.ring.oldest_ordered()
    }

    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.ring.recent()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Records an event, stamping the elapsed time since the previous record
    /// and emitting a log line.
    pub fn record(&mut self, event: impl Into<ControlRecord>, timestamp: Instant) -> RecordId {
        let event = event.into();
        let elapsed = self
            .last_record_at
            .map(|previous| timestamp.saturating_duration_since(previous));
        self.last_record_at = Some(timestamp);

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            elapsed_since_previous: elapsed,
            event,
        });

        log_record(&event, timestamp.as_micros(), elapsed.map(|delta| delta.as_micros()));
        id
    }
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn log_record(event: &ControlRecord, timestamp_us: u64, delta_us: Option<u64>) {
    let delta = delta_us.unwrap_or(0);
    match *event {
        ControlRecord::Session { from, to } => emit_log(
            "session",
            from.label(),
            to.label(),
            0,
            timestamp_us,
            delta,
        ),
        ControlRecord::Ramp {
            channel,
            direction,
            reading,
            ..
        } => emit_log(
            "ramp",
            channel.label(),
            direction.label(),
            u32::from(reading),
            timestamp_us,
            delta,
        ),
        ControlRecord::Regulation {
            channel, reading, ..
        } => emit_log(
            "regulate",
            channel.label(),
            "settled",
            u32::from(reading),
            timestamp_us,
            delta,
        ),
        ControlRecord::CommandRejected { command, reason } => emit_log(
            "reject",
            reason.label(),
            "command",
            u32::from(command),
            timestamp_us,
            delta,
        ),
        ControlRecord::FrameDropped { bytes } => {
            emit_log("link", "host", "discarded", bytes, timestamp_us, delta);
        }
        ControlRecord::MessagesDropped { count } => {
            emit_log("link", "outbox", "dropped", count, timestamp_us, delta);
        }
    }
}

#[cfg(target_os = "none")]
fn emit_log(
    kind: &'static str,
    subject: &'static str,
    detail: &'static str,
    value: u32,
    timestamp_us: u64,
    delta_us: u64,
) {
    defmt::info!(
        "telemetry:{} {} {} value={} t={}us Δ={}us",
        kind,
        subject,
        detail,
        value,
        timestamp_us,
        delta_us
    );
}

#[cfg(not(target_os = "none"))]
fn emit_log(
    kind: &'static str,
    subject: &'static str,
    detail: &'static str,
    value: u32,
    timestamp_us: u64,
    delta_us: u64,
) {
    println!(
        "telemetry:{kind} {subject} {detail} value={value} t={timestamp_us}us Δ={delta_us}us"
    );
}
