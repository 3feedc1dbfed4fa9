use crate::raw_event::{ChannelId, RawEvent, RawEventError};

/// Sampling frequencies supported by the DRS4 chip of the DT5742.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingFrequency {
    #[default]
    MHz750,
    MHz1000,
    MHz2500,
    MHz5000,
}

impl SamplingFrequency {
    pub fn to_mhz(&self) -> u32 {
        match self {
            SamplingFrequency::MHz750 => 750,
            SamplingFrequency::MHz1000 => 1000,
            SamplingFrequency::MHz2500 => 2500,
            SamplingFrequency::MHz5000 => 5000,
        }
    }

    pub fn from_mhz(mhz: u32) -> Option<Self> {
        match mhz {
            750 => Some(SamplingFrequency::MHz750),
            1000 => Some(SamplingFrequency::MHz1000),
            2500 => Some(SamplingFrequency::MHz2500),
            5000 => Some(SamplingFrequency::MHz5000),
            _ => None,
        }
    }

    pub fn hz(&self) -> f64 {
        f64::from(self.to_mhz()) * 1e6
    }

    /// Time between two consecutive cells, in seconds.
    ///
    /// Kept as `f64`: periods are fractions of a nanosecond, below the
    /// resolution of [`std::time::Duration`].
    pub fn sample_period_secs(&self) -> f64 {
        1.0 / self.hz()
    }
}

/// What to ask the digitizer for on a single blocking acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionRequest {
    pub channel_mask: u16,
    pub sampling: SamplingFrequency,
    pub trigger_count: usize,
}

impl AcquisitionRequest {
    pub fn new(channels: &[ChannelId], sampling: SamplingFrequency, trigger_count: usize) -> Self {
        let channel_mask = channels.iter().fold(0u16, |mask, ch| mask | ch.mask_bit());
        Self {
            channel_mask,
            sampling,
            trigger_count,
        }
    }

    pub fn includes(&self, channel: ChannelId) -> bool {
        self.channel_mask & channel.mask_bit() != 0
    }

    pub fn with_trigger_count(&self, trigger_count: usize) -> Self {
        Self {
            trigger_count,
            ..self.clone()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source returned no events for the trigger request")]
    AcquisitionEmpty,

    #[error("Source delivered a malformed event: {0}")]
    MalformedEvent(#[from] RawEventError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    /// Whether the caller can simply try again on the next iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::AcquisitionEmpty)
    }
}

/// Anything that can trigger the digitizer and download the captured events.
///
/// Calls are blocking request/response: no new trigger is issued while a
/// download is outstanding. A source may legitimately return an empty
/// sequence when nothing was captured.
pub trait WaveformSource {
    fn acquire(&mut self, request: &AcquisitionRequest) -> Result<Vec<RawEvent>, SourceError>;
}

impl<S: WaveformSource + ?Sized> WaveformSource for Box<S> {
    fn acquire(&mut self, request: &AcquisitionRequest) -> Result<Vec<RawEvent>, SourceError> {
        (**self).acquire(request)
    }
}

/// Acquire and turn an empty result into [`SourceError::AcquisitionEmpty`].
pub fn acquire_events<S: WaveformSource + ?Sized>(
    source: &mut S,
    request: &AcquisitionRequest,
) -> Result<Vec<RawEvent>, SourceError> {
    let events = source.acquire(request)?;
    if events.is_empty() {
        return Err(SourceError::AcquisitionEmpty);
    }
    log::debug!(
        "Acquired {} events (requested {})",
        events.len(),
        request.trigger_count
    );
    Ok(events)
}
