#![no_std]

// Shared logic for the energy-aware debugger (EDB) control core.
//
// This crate stays portable across MCU firmware and host tooling by avoiding the
// Rust standard library. Hardware access is expressed through the traits in
// [`hal`]; the firmware and the emulator provide the concrete boards.

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod hal;
pub mod mux;
pub mod protocol;
pub mod regulation;
pub mod session;
pub mod telemetry;

pub use channel::{ALL_CHANNELS, Channel, ChannelSet, Reading};
pub use config::{EdbConfig, IterationBudget, RegulationConfig, SessionConfig};
pub use dispatch::{CommandError, CommandExecutor};
pub use mux::{MuxError, ScanMultiplexer};
pub use regulation::{Direction, RegulationError, VoltageRegulator};
pub use session::{DebugSession, SessionError, SessionState};
