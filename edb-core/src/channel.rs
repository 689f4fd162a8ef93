//! Analog channels sampled by the debugger.

use core::fmt;

use crate::config::CHANNEL_COUNT;

/// Raw 12-bit ADC count.
pub type Reading = u16;

/// Analog inputs wired to the debugger's ADC.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Channel {
    /// Target storage capacitor voltage.
    CapVoltage,
    /// Target boost converter output.
    BoostVoltage,
    /// Target regulator output.
    RegVoltage,
    /// Target rectifier output.
    RectVoltage,
    /// Debugger power injection rail.
    InjectedVoltage,
}

/// Every channel in index order.
pub const ALL_CHANNELS: [Channel; CHANNEL_COUNT] = [
    Channel::CapVoltage,
    Channel::BoostVoltage,
    Channel::RegVoltage,
    Channel::RectVoltage,
    Channel::InjectedVoltage,
];

impl Channel {
    /// Position of the channel in [`ALL_CHANNELS`]; also its wire encoding.
    #[must_use]
    pub const fn as_index(self) -> usize {
        match self {
            Channel::CapVoltage => 0,
            Channel::BoostVoltage => 1,
            Channel::RegVoltage => 2,
            Channel::RectVoltage => 3,
            Channel::InjectedVoltage => 4,
        }
    }

    /// Resolves a wire-encoded channel index.
    #[must_use]
    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Channel::CapVoltage),
            1 => Some(Channel::BoostVoltage),
            2 => Some(Channel::RegVoltage),
            3 => Some(Channel::RectVoltage),
            4 => Some(Channel::InjectedVoltage),
            _ => None,
        }
    }

    /// Wire encoding of the channel.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn code(self) -> u8 {
        self.as_index() as u8
    }

    /// Short operator-facing label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Channel::CapVoltage => "vcap",
            Channel::BoostVoltage => "vboost",
            Channel::RegVoltage => "vreg",
            Channel::RectVoltage => "vrect",
            Channel::InjectedVoltage => "vinj",
        }
    }

    /// Looks up a channel by its label (case-insensitive).
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        ALL_CHANNELS
            .iter()
            .copied()
            .find(|channel| channel.label().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Compact set of channels backed by a bitmask.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ChannelSet(u8);

impl ChannelSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the raw bitmask (bit `n` is the channel with index `n`).
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, channel: Channel) -> bool {
        self.0 & (1 << channel.as_index()) != 0
    }

    /// Adds a channel, returning `true` when it was not already present.
    pub fn insert(&mut self, channel: Channel) -> bool {
        let present = self.contains(channel);
        self.0 |= 1 << channel.as_index();
        !present
    }

    /// Removes a channel, returning `true` when it was present.
    pub fn remove(&mut self, channel: Channel) -> bool {
        let present = self.contains(channel);
        self.0 &= !(1 << channel.as_index());
        present
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates the members in index order.
    pub fn iter(self) -> impl Iterator<Item = Channel> {
        ALL_CHANNELS
            .into_iter()
            .filter(move |channel| self.contains(*channel))
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        let mut set = Self::empty();
        for channel in iter {
            set.insert(channel);
        }
        set
    }
}
