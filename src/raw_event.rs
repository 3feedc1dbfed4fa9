use std::collections::BTreeMap;
use std::fmt;

/// Number of cells in one channel of the DRS4 switched capacitor array.
pub const NUM_CELLS: usize = 1024;

/// Number of input channels on a DT5742 (two groups of eight).
pub const NUM_CHANNELS: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn new(channel: u8) -> Result<Self, RawEventError> {
        if channel >= NUM_CHANNELS {
            return Err(RawEventError::ChannelOutOfRange { channel });
        }
        Ok(Self(channel))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// Bit of this channel in a digitizer channel mask.
    pub fn mask_bit(self) -> u16 {
        1 << self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RawEventError {
    #[error("Channel {channel} out of range (digitizer has 16 channels)")]
    ChannelOutOfRange { channel: u8 },

    #[error("Channel {channel} delivered {len} samples, expected 1024")]
    WrongSampleCount { channel: ChannelId, len: usize },

    #[error("First cell {first_cell} out of range (must be below 1024)")]
    FirstCellOutOfRange { first_cell: usize },

    #[error("Event carries no channel data")]
    NoChannels,
}

/// Physical cell that buffer position `position` was sampled by, given the
/// rotation pointer reported for the capture.
#[inline]
pub fn aligned_index(position: usize, first_cell: usize) -> usize {
    (position + first_cell) % NUM_CELLS
}

/// A sample tagged with the physical cell that recorded it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedSample {
    pub cell: usize,
    pub amplitude: f32,
}

/// One trigger's capture, as delivered by a waveform source.
///
/// The shape is checked once on construction: every channel carries exactly
/// [`NUM_CELLS`] samples and `first_cell` lies inside the capacitor array.
/// Consumers can index without re-validating.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    channels: BTreeMap<ChannelId, Vec<f32>>,
    first_cell: usize,
    trigger_tag: u32,
}

impl RawEvent {
    pub fn new(
        channels: BTreeMap<ChannelId, Vec<f32>>,
        first_cell: usize,
        trigger_tag: u32,
    ) -> Result<Self, RawEventError> {
        if channels.is_empty() {
            return Err(RawEventError::NoChannels);
        }
        if first_cell >= NUM_CELLS {
            return Err(RawEventError::FirstCellOutOfRange { first_cell });
        }
        if let Some((&channel, samples)) = channels.iter().find(|(_, s)| s.len() != NUM_CELLS) {
            return Err(RawEventError::WrongSampleCount {
                channel,
                len: samples.len(),
            });
        }

        Ok(Self {
            channels,
            first_cell,
            trigger_tag,
        })
    }

    /// Convenience constructor for a capture of a single channel.
    pub fn single_channel(
        channel: ChannelId,
        samples: Vec<f32>,
        first_cell: usize,
        trigger_tag: u32,
    ) -> Result<Self, RawEventError> {
        Self::new(BTreeMap::from([(channel, samples)]), first_cell, trigger_tag)
    }

    pub fn first_cell(&self) -> usize {
        self.first_cell
    }

    pub fn trigger_tag(&self) -> u32 {
        self.trigger_tag
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.keys().copied()
    }

    /// Samples of `channel` in capture order (buffer position 0 first).
    pub fn samples(&self, channel: ChannelId) -> Option<&[f32]> {
        self.channels.get(&channel).map(Vec::as_slice)
    }

    /// Samples of `channel` paired with the physical cell that recorded them.
    pub fn aligned_samples(
        &self,
        channel: ChannelId,
    ) -> Option<impl Iterator<Item = AlignedSample> + '_> {
        let first_cell = self.first_cell;
        self.samples(channel).map(move |samples| {
            samples
                .iter()
                .enumerate()
                .map(move |(position, &amplitude)| AlignedSample {
                    cell: aligned_index(position, first_cell),
                    amplitude,
                })
        })
    }
}
