//! Scan slot bookkeeping for the multiplexed ADC.
//!
//! The ADC sequencer converts an ordered list of channels; results land in slot
//! registers indexed by position. [`ScanMultiplexer`] owns that list and keeps a
//! per-channel index table in lockstep with it so a channel's slot can be looked
//! up in constant time. The list never has gaps: removing a channel shifts every
//! later entry one slot to the left and the index table follows.
//!
//! Mutations only touch the bookkeeping. [`ScanMultiplexer::commit`] is the single
//! path that pushes the sequence to the hardware, always stopping the scan and
//! waiting for the sequencer to go idle before reprogramming it.

use core::fmt;

use heapless::Vec;

use crate::channel::{ALL_CHANNELS, Channel, Reading};
use crate::config::{CHANNEL_COUNT, MAX_SCAN_SLOTS};
use crate::hal::AnalogFrontEnd;

/// Errors raised by the multiplexer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MuxError {
    /// Every scan slot is in use.
    CapacityExceeded { channel: Channel },
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::CapacityExceeded { channel } => {
                write!(f, "no free scan slot for {channel}")
            }
        }
    }
}

/// Fixed-capacity slot map of actively scanned channels.
#[derive(Clone, Debug)]
pub struct ScanMultiplexer<const N: usize = MAX_SCAN_SLOTS> {
    slots: Vec<Channel, N>,
    index: [Option<u8>; CHANNEL_COUNT],
}

impl<const N: usize> ScanMultiplexer<N> {
    /// Creates a multiplexer with no active channels.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: [None; CHANNEL_COUNT],
        }
    }

    /// Adds `channel` to the scan list and returns its slot.
    ///
    /// Already-active channels keep their slot.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::CapacityExceeded`] when every slot is taken; the
    /// scan list is unchanged.
    pub fn activate(&mut self, channel: Channel) -> Result<usize, MuxError> {
        if let Some(slot) = self.slot_of(channel) {
            return Ok(slot);
        }

        let slot = self.slots.len();
        let code = u8::try_from(slot).map_err(|_| MuxError::CapacityExceeded { channel })?;
        self.slots
            .push(channel)
            .map_err(|_| MuxError::CapacityExceeded { channel })?;
        self.index[channel.as_index()] = Some(code);
        Ok(slot)
    }

    /// Removes `channel` from the scan list, compacting later slots.
    ///
    /// Returns the slot the channel occupied, or `None` if it was inactive.
    pub fn deactivate(&mut self, channel: Channel) -> Option<usize> {
        let removed = self.slot_of(channel)?;
        self.slots.remove(removed);
        self.index[channel.as_index()] = None;

        for entry in self.index.iter_mut().flatten() {
            if usize::from(*entry) > removed {
                *entry -= 1;
            }
        }

        Some(removed)
    }

    /// Pushes the current sequence to the ADC.
    ///
    /// The scan is always stopped and drained first. With no active channels the
    /// sequencer is left idle.
    pub fn commit<A: AnalogFrontEnd + ?Sized>(&self, adc: &mut A) {
        adc.stop_scan();
        adc.wait_scan_idle();

        if self.slots.is_empty() {
            return;
        }

        adc.configure_scan(&self.slots);
        adc.start_scan();
    }

    /// Slot currently assigned to `channel`.
    #[must_use]
    pub fn slot_of(&self, channel: Channel) -> Option<usize> {
        self.index[channel.as_index()].map(usize::from)
    }

    #[must_use]
    pub fn is_active(&self, channel: Channel) -> bool {
        self.index[channel.as_index()].is_some()
    }

    /// Active channels in slot order.
    #[must_use]
    pub fn active(&self) -> &[Channel] {
        &self.slots
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Latest scan result for `channel`, if it is active and the scan produced one.
    pub fn latest<A: AnalogFrontEnd + ?Sized>(&self, channel: Channel, adc: &mut A) -> Option<Reading> {
        let slot = self.slot_of(channel)?;
        adc.last_result(slot)
    }

    /// Reads `channel` from the scan when possible, falling back to a
    /// single-shot conversion.
    pub fn read<A: AnalogFrontEnd + ?Sized>(&self, channel: Channel, adc: &mut A) -> Reading {
        match self.latest(channel, adc) {
            Some(reading) => reading,
            None => adc.sample_blocking(channel),
        }
    }

    /// Checks that the slot list and index table agree.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let positions_match = self
            .slots
            .iter()
            .enumerate()
            .all(|(slot, channel)| self.slot_of(*channel) == Some(slot));
        let tracked = ALL_CHANNELS
            .iter()
            .filter(|channel| self.is_active(**channel))
            .count();
        positions_match && tracked == self.slots.len()
    }
}

impl<const N: usize> Default for ScanMultiplexer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingAdc {
        calls: Vec<AdcCall, 16>,
        running: bool,
        sequence: Vec<Channel, 8>,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum AdcCall {
        Stop,
        WaitIdle,
        Configure(usize),
        Start,
    }

    impl AnalogFrontEnd for RecordingAdc {
        fn sample_blocking(&mut self, channel: Channel) -> Reading {
            1_000 + u16::from(channel.code())
        }

        fn configure_scan(&mut self, channels: &[Channel]) {
            self.sequence.clear();
            self.sequence.extend_from_slice(channels).unwrap();
            self.calls.push(AdcCall::Configure(channels.len())).unwrap();
        }

        fn start_scan(&mut self) {
            self.running = true;
            self.calls.push(AdcCall::Start).unwrap();
        }

        fn stop_scan(&mut self) {
            self.running = false;
            self.calls.push(AdcCall::Stop).unwrap();
        }

        fn wait_scan_idle(&mut self) {
            self.calls.push(AdcCall::WaitIdle).unwrap();
        }

        fn last_result(&mut self, slot: usize) -> Option<Reading> {
            if !self.running {
                return None;
            }
            self.sequence
                .get(slot)
                .map(|channel| 2_000 + u16::from(channel.code()))
        }
    }

    #[test]
    fn activate_is_idempotent() {
        let mut mux: ScanMultiplexer = ScanMultiplexer::new();
        assert_eq!(mux.activate(Channel::RegVoltage), Ok(0));
        assert_eq!(mux.activate(Channel::CapVoltage), Ok(1));
        assert_eq!(mux.activate(Channel::RegVoltage), Ok(0));
        assert_eq!(mux.len(), 2);
        assert!(mux.is_consistent());
    }

    #[test]
    fn capacity_exceeded_leaves_state_untouched() {
        let mut mux = ScanMultiplexer::<2>::new();
        mux.activate(Channel::CapVoltage).unwrap();
        mux.activate(Channel::BoostVoltage).unwrap();

        assert_eq!(
            mux.activate(Channel::RectVoltage),
            Err(MuxError::CapacityExceeded {
                channel: Channel::RectVoltage
            })
        );
        assert_eq!(mux.active(), &[Channel::CapVoltage, Channel::BoostVoltage]);
        assert!(!mux.is_active(Channel::RectVoltage));
        assert!(mux.is_consistent());
    }

    #[test]
    fn deactivate_compacts_later_slots() {
        let mut mux: ScanMultiplexer = ScanMultiplexer::new();
        for channel in ALL_CHANNELS {
            mux.activate(channel).unwrap();
        }

        assert_eq!(mux.deactivate(Channel::BoostVoltage), Some(1));
        assert_eq!(
            mux.active(),
            &[
                Channel::CapVoltage,
                Channel::RegVoltage,
                Channel::RectVoltage,
                Channel::InjectedVoltage
            ]
        );
        assert_eq!(mux.slot_of(Channel::CapVoltage), Some(0));
        assert_eq!(mux.slot_of(Channel::RegVoltage), Some(1));
        assert_eq!(mux.slot_of(Channel::InjectedVoltage), Some(3));
        assert_eq!(mux.slot_of(Channel::BoostVoltage), None);
        assert!(mux.is_consistent());

        assert_eq!(mux.deactivate(Channel::BoostVoltage), None);
        assert_eq!(mux.len(), 4);
    }

    #[test]
    fn commit_stops_before_reprogramming() {
        let mut adc = RecordingAdc::default();
        let mut mux: ScanMultiplexer = ScanMultiplexer::new();
        mux.activate(Channel::CapVoltage).unwrap();
        mux.activate(Channel::RectVoltage).unwrap();
        mux.commit(&mut adc);

        assert_eq!(
            adc.calls.as_slice(),
            &[
                AdcCall::Stop,
                AdcCall::WaitIdle,
                AdcCall::Configure(2),
                AdcCall::Start
            ]
        );
        assert_eq!(mux.latest(Channel::RectVoltage, &mut adc), Some(2_003));
    }

    #[test]
    fn commit_with_no_channels_leaves_scan_idle() {
        let mut adc = RecordingAdc::default();
        let mut mux: ScanMultiplexer = ScanMultiplexer::new();
        mux.activate(Channel::CapVoltage).unwrap();
        mux.commit(&mut adc);
        mux.deactivate(Channel::CapVoltage);
        adc.calls.clear();
        mux.commit(&mut adc);

        assert_eq!(adc.calls.as_slice(), &[AdcCall::Stop, AdcCall::WaitIdle]);
        assert!(!adc.running);
    }

    #[test]
    fn read_falls_back_to_single_shot() {
        let mut adc = RecordingAdc::default();
        let mut mux: ScanMultiplexer = ScanMultiplexer::new();
        assert_eq!(mux.read(Channel::BoostVoltage, &mut adc), 1_001);

        mux.activate(Channel::BoostVoltage).unwrap();
        mux.commit(&mut adc);
        assert_eq!(mux.read(Channel::BoostVoltage, &mut adc), 2_001);
    }
}
