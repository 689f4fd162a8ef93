//! Closed-loop voltage control: threshold ramps and the duty-cycle search.
//!
//! Both operations block the caller until the measured voltage satisfies the
//! exit criterion. They borrow the measured channel from the scan multiplexer
//! for the duration of the loop and hand it back afterwards unless the channel
//! is also being streamed to the host.

use core::cmp::Ordering;
use core::fmt;

use crate::channel::{Channel, ChannelSet, Reading};
use crate::config::RegulationConfig;
use crate::hal::{Board, Level, Pin, PinMode};
use crate::mux::{MuxError, ScanMultiplexer};

/// Direction of a threshold ramp.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Source current until the reading reaches the target from below.
    Charge,
    /// Sink current until the reading reaches the target from above.
    Discharge,
}

impl Direction {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Direction::Charge => "charge",
            Direction::Discharge => "discharge",
        }
    }

    const fn reached(self, reading: Reading, target: Reading) -> bool {
        match self {
            Direction::Charge => reading >= target,
            Direction::Discharge => reading <= target,
        }
    }
}

/// Outcome of a completed ramp.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RampReport {
    pub channel: Channel,
    pub direction: Direction,
    /// First reading that crossed the threshold.
    pub reading: Reading,
    /// Number of samples taken.
    pub polls: u32,
}

/// Outcome of a converged duty-cycle search.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegulationReport {
    pub channel: Channel,
    pub target: Reading,
    /// Reading that fell inside the tolerance band.
    pub reading: Reading,
    /// Duty cycle the actuator was left running at.
    pub duty_cycle: u16,
    /// Number of settle-and-sample steps taken.
    pub steps: u32,
}

/// Errors raised by the regulation controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegulationError {
    /// The measured channel could not be added to the scan.
    Mux(MuxError),
    /// The iteration budget ran out before the criterion held.
    BudgetExhausted {
        reading: Reading,
        /// Duty cycle left on the actuator (duty-cycle search only).
        duty: Option<u16>,
    },
}

impl fmt::Display for RegulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegulationError::Mux(error) => write!(f, "{error}"),
            RegulationError::BudgetExhausted {
                reading,
                duty: Some(duty),
            } => write!(
                f,
                "iteration budget exhausted at reading {reading} (duty {duty})"
            ),
            RegulationError::BudgetExhausted {
                reading,
                duty: None,
            } => write!(f, "iteration budget exhausted at reading {reading}"),
        }
    }
}

impl From<MuxError> for RegulationError {
    fn from(error: MuxError) -> Self {
        Self::Mux(error)
    }
}

/// Compares `reading` against `target` with a symmetric tolerance band.
///
/// Band edges that would fall outside the `u16` range are treated as open, so
/// a target near zero never reports `Less` and a target near `u16::MAX` never
/// reports `Greater`.
#[must_use]
pub fn compare_with_tolerance(reading: Reading, target: Reading, tolerance: u16) -> Ordering {
    if target
        .checked_sub(tolerance)
        .is_some_and(|low| reading < low)
    {
        Ordering::Less
    } else if target
        .checked_add(tolerance)
        .is_some_and(|high| reading > high)
    {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Seed duty cycle for a target reading, biased down by `margin`.
#[must_use]
pub fn seed_duty_cycle(target: Reading, period: u16, full_scale: u16, margin: u16) -> u16 {
    let scaled = u32::from(target) * u32::from(period) / u32::from(full_scale.max(1));
    u16::try_from(scaled)
        .unwrap_or(period)
        .min(period)
        .saturating_sub(margin)
}

/// Stateless controller parameterised by a [`RegulationConfig`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct VoltageRegulator {
    config: RegulationConfig,
}

impl VoltageRegulator {
    #[must_use]
    pub const fn new(config: RegulationConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &RegulationConfig {
        &self.config
    }

    /// Drives the charge source or discharge sink until `channel` crosses
    /// `target`, then releases it.
    ///
    /// # Errors
    ///
    /// Returns [`RegulationError::Mux`] when `channel` cannot be scanned and
    /// [`RegulationError::BudgetExhausted`] when the poll budget runs out; the
    /// source or sink is released either way.
    pub fn ramp<B, const N: usize>(
        &self,
        board: &mut B,
        mux: &mut ScanMultiplexer<N>,
        logged: ChannelSet,
        channel: Channel,
        target: Reading,
        direction: Direction,
    ) -> Result<RampReport, RegulationError>
    where
        B: Board + ?Sized,
    {
        borrow_channel(board, mux, channel)?;

        engage(board, direction);
        let mut polls = 0u32;
        let outcome = loop {
            let reading = mux.read(channel, board);
            polls = polls.saturating_add(1);

            if direction.reached(reading, target) {
                break Ok(RampReport {
                    channel,
                    direction,
                    reading,
                    polls,
                });
            }

            if !self.config.ramp_budget.allows(polls) {
                break Err(RegulationError::BudgetExhausted {
                    reading,
                    duty: None,
                });
            }
        };
        release(board, direction);

        return_channel(board, mux, logged, channel);
        outcome
    }

    /// Searches for the actuator duty cycle that holds `channel` at `target`
    /// and leaves the actuator running at it.
    ///
    /// # Errors
    ///
    /// Returns [`RegulationError::Mux`] when `channel` cannot be scanned and
    /// [`RegulationError::BudgetExhausted`] when the step budget runs out,
    /// with the actuator left running at the last duty cycle.
    pub fn regulate<B, const N: usize>(
        &self,
        board: &mut B,
        mux: &mut ScanMultiplexer<N>,
        logged: ChannelSet,
        channel: Channel,
        target: Reading,
    ) -> Result<RegulationReport, RegulationError>
    where
        B: Board + ?Sized,
    {
        borrow_channel(board, mux, channel)?;

        let period = board.period();
        let mut duty = seed_duty_cycle(
            target,
            period,
            self.config.adc_full_scale,
            self.config.seed_margin,
        );
        board.set_duty_cycle(duty);
        board.start();
        board.delay_cycles(self.config.initial_settle_cycles);

        let mut steps = 0u32;
        let outcome = loop {
            board.delay_cycles(self.config.step_settle_cycles);
            let reading = mux.read(channel, board);
            steps = steps.saturating_add(1);

            match compare_with_tolerance(reading, target, self.config.tolerance) {
                Ordering::Equal => {
                    break Ok(RegulationReport {
                        channel,
                        target,
                        reading,
                        duty_cycle: duty,
                        steps,
                    });
                }
                Ordering::Less => duty = duty.saturating_add(1).min(period),
                Ordering::Greater => duty = duty.saturating_sub(1),
            }
            board.set_duty_cycle(duty);

            if !self.config.search_budget.allows(steps) {
                break Err(RegulationError::BudgetExhausted {
                    reading,
                    duty: Some(duty),
                });
            }
        };

        return_channel(board, mux, logged, channel);
        outcome
    }
}

fn borrow_channel<B, const N: usize>(
    board: &mut B,
    mux: &mut ScanMultiplexer<N>,
    channel: Channel,
) -> Result<(), MuxError>
where
    B: Board + ?Sized,
{
    if !mux.is_active(channel) {
        mux.activate(channel)?;
        mux.commit(board);
    }
    Ok(())
}

fn return_channel<B, const N: usize>(
    board: &mut B,
    mux: &mut ScanMultiplexer<N>,
    logged: ChannelSet,
    channel: Channel,
) where
    B: Board + ?Sized,
{
    if !logged.contains(channel) && mux.deactivate(channel).is_some() {
        mux.commit(board);
    }
}

fn engage<B: Board + ?Sized>(board: &mut B, direction: Direction) {
    match direction {
        Direction::Charge => board.set_output(Pin::Charge, Level::High),
        Direction::Discharge => {
            board.set_output(Pin::Discharge, Level::Low);
            board.set_direction(Pin::Discharge, PinMode::Output);
        }
    }
}

fn release<B: Board + ?Sized>(board: &mut B, direction: Direction) {
    match direction {
        Direction::Charge => board.set_output(Pin::Charge, Level::Low),
        Direction::Discharge => board.set_direction(Pin::Discharge, PinMode::Input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_band_is_symmetric() {
        assert_eq!(compare_with_tolerance(1_998, 2_000, 1), Ordering::Less);
        assert_eq!(compare_with_tolerance(1_999, 2_000, 1), Ordering::Equal);
        assert_eq!(compare_with_tolerance(2_001, 2_000, 1), Ordering::Equal);
        assert_eq!(compare_with_tolerance(2_002, 2_000, 1), Ordering::Greater);
    }

    #[test]
    fn tolerance_band_never_wraps() {
        assert_eq!(compare_with_tolerance(0, 0, 1), Ordering::Equal);
        assert_eq!(compare_with_tolerance(0, 1, 2), Ordering::Equal);
        assert_eq!(compare_with_tolerance(u16::MAX, u16::MAX, 1), Ordering::Equal);
        assert_eq!(
            compare_with_tolerance(u16::MAX, u16::MAX - 1, 4),
            Ordering::Equal
        );
        assert_eq!(compare_with_tolerance(0, u16::MAX, 1), Ordering::Less);
        assert_eq!(compare_with_tolerance(u16::MAX, 0, 1), Ordering::Greater);
    }

    #[test]
    fn seed_is_scaled_and_biased() {
        assert_eq!(seed_duty_cycle(2_048, 1_023, 4_096, 40), 511 - 40);
        assert_eq!(seed_duty_cycle(100, 1_023, 4_096, 40), 0);
        assert_eq!(seed_duty_cycle(u16::MAX, 1_023, 4_096, 0), 1_023);
        assert_eq!(seed_duty_cycle(1_000, 1_023, 0, 0), 1_023);
    }

    #[test]
    fn ramp_directions_use_inclusive_thresholds() {
        assert!(Direction::Charge.reached(2_000, 2_000));
        assert!(!Direction::Charge.reached(1_999, 2_000));
        assert!(Direction::Discharge.reached(1_000, 1_000));
        assert!(!Direction::Discharge.reached(1_001, 1_000));
    }
}
