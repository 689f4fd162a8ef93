//! Compile-time constants and runtime tunables for the debugger core.
//!
//! Constants describe the board the firmware was designed around: a 12-bit ADC
//! referenced to the 3.3 V rail, a five-entry scan sequencer, and a core clock of
//! 21.921792 MHz that every settle delay is expressed in. The runtime structs
//! group the knobs that callers may override (regulation margins, iteration
//! budgets, indicator pins) while keeping defaults aligned with the board.

use crate::channel::Reading;

/// Number of analog channels known to the debugger.
pub const CHANNEL_COUNT: usize = 5;

/// Hardware limit on simultaneously scanned channels.
pub const MAX_SCAN_SLOTS: usize = 5;

/// ADC full-scale count (exclusive upper bound of a reading).
pub const ADC_FULL_SCALE: u16 = 4096;

/// Largest reading the ADC can return.
pub const ADC_MAX_READING: Reading = ADC_FULL_SCALE - 1;

/// ADC reference voltage in millivolts.
pub const ADC_REFERENCE_MILLIVOLTS: u32 = 3_300;

/// Core clock frequency used to express busy-wait delays.
pub const CORE_CLOCK_HZ: u32 = 21_921_792;

/// Core clock cycles per millisecond, rounded up.
pub const CYCLES_PER_MS: u32 = CORE_CLOCK_HZ.div_ceil(1_000);

/// Default actuator counter top value (a 1024-step PWM cycle).
pub const DEFAULT_PWM_PERIOD: u16 = 1_024 - 1;

/// Default actuator duty cycle programmed at start-up.
pub const DEFAULT_PWM_DUTY: u16 = 512;

/// Amount the regulation seed duty cycle is biased downward.
pub const DEFAULT_SEED_MARGIN: u16 = 40;

/// Default comparison band (in counts) considered "on target".
pub const DEFAULT_TOLERANCE: u16 = 1;

/// Default settle delay before and between regulation steps.
pub const DEFAULT_SETTLE_MS: u32 = 40;

/// Target-side power-on threshold (2.1 V) used by tooling as a sane floor.
pub const TARGET_ON_THRESHOLD: Reading = 2_607;

/// Sync byte that opens every link frame.
pub const FRAME_SYNC: u8 = 0xF0;

/// Largest payload carried by a single link frame.
pub const MAX_PAYLOAD_LEN: usize = 16;

/// Largest encoded frame: sync, descriptor, length and payload.
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD_LEN + 3;

/// Converts a millivolt value into ADC counts, rounding up and clamping to the
/// ADC range.
#[must_use]
pub const fn millivolts_to_counts(millivolts: u32) -> Reading {
    let scaled = (millivolts as u64 * ADC_FULL_SCALE as u64).div_ceil(ADC_REFERENCE_MILLIVOLTS as u64);
    if scaled > ADC_MAX_READING as u64 {
        ADC_MAX_READING
    } else {
        #[allow(clippy::cast_possible_truncation)]
        {
            scaled as Reading
        }
    }
}

/// Converts ADC counts back into millivolts (rounded down).
#[must_use]
pub const fn counts_to_millivolts(counts: Reading) -> u32 {
    counts as u32 * ADC_REFERENCE_MILLIVOLTS / ADC_FULL_SCALE as u32
}

/// Converts milliseconds into core clock cycles, saturating on overflow.
#[must_use]
pub const fn millis_to_cycles(millis: u32) -> u32 {
    millis.saturating_mul(CYCLES_PER_MS)
}

/// Bound on the number of polls or steps a blocking loop may take.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum IterationBudget {
    /// Loop until the exit criterion holds.
    #[default]
    Unbounded,
    /// Give up after the given number of iterations.
    Limited(u32),
}

impl IterationBudget {
    /// Returns `true` when another iteration may run after `completed` ones.
    #[must_use]
    pub const fn allows(self, completed: u32) -> bool {
        match self {
            IterationBudget::Unbounded => true,
            IterationBudget::Limited(limit) => completed < limit,
        }
    }
}

/// Tunables for threshold ramps and the duty-cycle search.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegulationConfig {
    /// Full-scale ADC count used to derive the seed duty cycle.
    pub adc_full_scale: u16,
    /// Downward bias applied to the seed duty cycle.
    pub seed_margin: u16,
    /// Accepted deviation (counts) around the target.
    pub tolerance: u16,
    /// Delay before the first regulation step, in core clock cycles.
    pub initial_settle_cycles: u32,
    /// Delay before each subsequent regulation step, in core clock cycles.
    pub step_settle_cycles: u32,
    /// Poll limit for charge/discharge ramps.
    pub ramp_budget: IterationBudget,
    /// Step limit for the duty-cycle search.
    pub search_budget: IterationBudget,
}

impl RegulationConfig {
    /// Defaults matching the board's timing and ADC resolution.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            adc_full_scale: ADC_FULL_SCALE,
            seed_margin: DEFAULT_SEED_MARGIN,
            tolerance: DEFAULT_TOLERANCE,
            initial_settle_cycles: millis_to_cycles(DEFAULT_SETTLE_MS),
            step_settle_cycles: millis_to_cycles(DEFAULT_SETTLE_MS),
            ramp_budget: IterationBudget::Unbounded,
            search_budget: IterationBudget::Unbounded,
        }
    }

    /// Returns a copy with both loops capped at `limit` iterations.
    #[must_use]
    pub const fn with_budget(mut self, limit: u32) -> Self {
        self.ramp_budget = IterationBudget::Limited(limit);
        self.search_budget = IterationBudget::Limited(limit);
        self
    }
}

impl Default for RegulationConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Debug session options.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SessionConfig {
    /// Mirror the session state onto the two state indicator pins.
    pub state_pins: bool,
}

impl SessionConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self { state_pins: true }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate configuration handed to the command executor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EdbConfig {
    pub regulation: RegulationConfig,
    pub session: SessionConfig,
    /// Pulse the scope trigger before session and ramp commands.
    pub auto_scope_trigger: bool,
}

impl EdbConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regulation: RegulationConfig::new(),
            session: SessionConfig::new(),
            auto_scope_trigger: true,
        }
    }
}

impl Default for EdbConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_per_ms_rounds_up() {
        assert_eq!(CYCLES_PER_MS, 21_922);
        assert_eq!(millis_to_cycles(40), 876_880);
        assert_eq!(millis_to_cycles(u32::MAX), u32::MAX);
    }

    #[test]
    fn millivolt_conversion_matches_host_tooling() {
        // ceil(2.1 * 4096 / 3.3) == 2607
        assert_eq!(millivolts_to_counts(2_100), TARGET_ON_THRESHOLD);
        assert_eq!(millivolts_to_counts(0), 0);
        assert_eq!(millivolts_to_counts(3_300), ADC_MAX_READING);
        assert_eq!(millivolts_to_counts(10_000), ADC_MAX_READING);
        assert_eq!(counts_to_millivolts(2_048), 1_650);
    }

    #[test]
    fn iteration_budget_limits() {
        assert!(IterationBudget::Unbounded.allows(u32::MAX));
        assert!(IterationBudget::Limited(3).allows(2));
        assert!(!IterationBudget::Limited(3).allows(3));
        assert!(!IterationBudget::Limited(0).allows(0));
    }

    #[test]
    fn defaults_follow_board_timing() {
        let config = EdbConfig::default();
        assert_eq!(config.regulation.seed_margin, 40);
        assert_eq!(config.regulation.tolerance, 1);
        assert_eq!(config.regulation.initial_settle_cycles, 40 * CYCLES_PER_MS);
        assert_eq!(config.regulation.search_budget, IterationBudget::Unbounded);
        assert!(config.session.state_pins);
        let capped = RegulationConfig::new().with_budget(7);
        assert_eq!(capped.ramp_budget, IterationBudget::Limited(7));
    }
}
