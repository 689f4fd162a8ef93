//! Streaming of scanned channel readings to the host.
//!
//! The logging mask selects which channels are reported every time the scan
//! completes. Logged channels hold a scan slot for as long as they are in the
//! mask; the executor keeps the multiplexer in sync with [`LogStream`].

use heapless::Vec;

use crate::channel::{Channel, ChannelSet, Reading};
use crate::config::CHANNEL_COUNT;
use crate::hal::AnalogFrontEnd;
use crate::mux::ScanMultiplexer;

/// One streamed reading.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LogSample {
    pub channel: Channel,
    pub reading: Reading,
}

/// Readings captured from one scan pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogBatch {
    /// Milliseconds timestamp, strictly greater than the previous batch's.
    pub timestamp: u32,
    pub samples: Vec<LogSample, CHANNEL_COUNT>,
}

/// Tracks the logging mask and stamps outgoing batches.
#[derive(Clone, Debug, Default)]
pub struct LogStream {
    mask: ChannelSet,
    last_timestamp: Option<u32>,
}

impl LogStream {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mask: ChannelSet::empty(),
            last_timestamp: None,
        }
    }

    /// Channels currently streamed.
    #[must_use]
    pub const fn mask(&self) -> ChannelSet {
        self.mask
    }

    #[must_use]
    pub const fn is_logging(&self, channel: Channel) -> bool {
        self.mask.contains(channel)
    }

    /// Adds `channel` to the mask; returns `false` if it was already logged.
    pub fn begin(&mut self, channel: Channel) -> bool {
        self.mask.insert(channel)
    }

    /// Removes `channel` from the mask; returns `false` if it was not logged.
    pub fn end(&mut self, channel: Channel) -> bool {
        self.mask.remove(channel)
    }

    /// Stops streaming every channel.
    pub fn clear(&mut self) {
        self.mask = ChannelSet::empty();
    }

    /// Collects the latest scan results for every logged channel.
    ///
    /// Returns `None` when nothing is logged or none of the logged channels has
    /// a scan result yet.
    pub fn on_scan_complete<A, const N: usize>(
        &mut self,
        adc: &mut A,
        mux: &ScanMultiplexer<N>,
        timestamp: u32,
    ) -> Option<LogBatch>
    where
        A: AnalogFrontEnd + ?Sized,
    {
        if self.mask.is_empty() {
            return None;
        }

        let mut samples = Vec::new();
        for channel in self.mask.iter() {
            if let Some(reading) = mux.latest(channel, adc) {
                // Capacity equals the channel count, so this never overflows.
                let _ = samples.push(LogSample { channel, reading });
            }
        }

        if samples.is_empty() {
            return None;
        }

        let timestamp = match self.last_timestamp {
            Some(previous) if timestamp <= previous => previous.saturating_add(1),
            _ => timestamp,
        };
        self.last_timestamp = Some(timestamp);

        Some(LogBatch { timestamp, samples })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScanStub {
        running: bool,
        sequence: Vec<Channel, CHANNEL_COUNT>,
    }

    impl AnalogFrontEnd for ScanStub {
        fn sample_blocking(&mut self, _channel: Channel) -> Reading {
            0
        }

        fn configure_scan(&mut self, channels: &[Channel]) {
            self.sequence.clear();
            self.sequence.extend_from_slice(channels).unwrap();
        }

        fn start_scan(&mut self) {
            self.running = true;
        }

        fn stop_scan(&mut self) {
            self.running = false;
        }

        fn wait_scan_idle(&mut self) {}

        fn last_result(&mut self, slot: usize) -> Option<Reading> {
            if !self.running {
                return None;
            }
            self.sequence
                .get(slot)
                .map(|channel| 100 * (u16::from(channel.code()) + 1))
        }
    }

    fn stub() -> ScanStub {
        ScanStub {
            running: false,
            sequence: Vec::new(),
        }
    }

    #[test]
    fn empty_mask_produces_no_batch() {
        let mut adc = stub();
        let mux: ScanMultiplexer = ScanMultiplexer::new();
        let mut stream = LogStream::new();
        assert!(stream.on_scan_complete(&mut adc, &mux, 10).is_none());
    }

    #[test]
    fn batch_contains_logged_channels_only() {
        let mut adc = stub();
        let mut mux: ScanMultiplexer = ScanMultiplexer::new();
        mux.activate(Channel::CapVoltage).unwrap();
        mux.activate(Channel::RegVoltage).unwrap();
        mux.commit(&mut adc);

        let mut stream = LogStream::new();
        assert!(stream.begin(Channel::RegVoltage));
        assert!(!stream.begin(Channel::RegVoltage));

        let batch = stream.on_scan_complete(&mut adc, &mux, 5).unwrap();
        assert_eq!(batch.timestamp, 5);
        assert_eq!(
            batch.samples.as_slice(),
            &[LogSample {
                channel: Channel::RegVoltage,
                reading: 300
            }]
        );
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut adc = stub();
        let mut mux: ScanMultiplexer = ScanMultiplexer::new();
        mux.activate(Channel::CapVoltage).unwrap();
        mux.commit(&mut adc);

        let mut stream = LogStream::new();
        stream.begin(Channel::CapVoltage);

        let stamps: Vec<u32, 4> = [7, 7, 3, 20]
            .into_iter()
            .map(|now| stream.on_scan_complete(&mut adc, &mux, now).unwrap().timestamp)
            .collect();
        assert_eq!(stamps.as_slice(), &[7, 8, 9, 20]);
    }
}
