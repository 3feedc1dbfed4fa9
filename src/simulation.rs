//! Software stand-ins for the digitizer and the reference pulser.
//!
//! The two share the pulser's output level, so a sweep driven through
//! [`SimulatedPulser`] shows up in the events of the linked
//! [`SimulatedDigitizer`].
use crate::pulser::{Pulser, PulserError};
use crate::raw_event::{aligned_index, ChannelId, RawEvent, NUM_CELLS, NUM_CHANNELS};
use crate::waveform_source::{AcquisitionRequest, SourceError, WaveformSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FirstCellMode {
    /// Uniformly random start cell per trigger, like the real DRS4.
    Rotating,
    Fixed(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSettings {
    /// ADC counts per volt of a perfect cell.
    pub nominal_gain: f64,
    /// Relative per-cell gain spread.
    pub gain_spread: f64,
    /// ADC reading of a perfect cell at 0 V.
    pub nominal_offset: f64,
    /// Absolute per-cell offset spread, in counts.
    pub offset_spread: f64,
    /// Half width of the uniform noise added to every sample, in counts.
    pub noise: f64,
    pub first_cell: FirstCellMode,
    /// Height in volts of a negative pulse placed in every event, if any.
    pub pulse_volts: Option<f64>,
    /// Probability that an acquisition comes back empty.
    pub empty_probability: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            nominal_gain: 4096.0,
            gain_spread: 0.02,
            nominal_offset: 2048.0,
            offset_spread: 30.0,
            noise: 2.0,
            first_cell: FirstCellMode::Rotating,
            pulse_volts: None,
            empty_probability: 0.0,
        }
    }
}

/// Output level shared between a simulated pulser and digitizer.
#[derive(Debug, Clone, Default)]
struct SharedLevel(Arc<AtomicU64>);

impl SharedLevel {
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn set(&self, volts: f64) {
        self.0.store(volts.to_bits(), Ordering::Release);
    }
}

/// Understands the handful of commands a DC sweep sends.
#[derive(Debug, Clone)]
pub struct SimulatedPulser {
    level: SharedLevel,
    commands: Vec<String>,
}

impl SimulatedPulser {
    pub fn level(&self) -> f64 {
        self.level.get()
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

impl Pulser for SimulatedPulser {
    fn send_command(&mut self, command: &str) -> Result<String, PulserError> {
        log::trace!("Simulated pulser <- {}", command);
        let unknown = || PulserError::CommandFailed {
            command: command.to_string(),
            status: "unknown command".to_string(),
            stderr: String::new(),
        };

        match command.split_once(' ') {
            Some(("DCOFFS", value)) => {
                let volts: f64 = value.trim().parse().map_err(|_| unknown())?;
                self.level.set(volts);
            }
            Some(("WAVE" | "ARBLOAD", _)) => {}
            _ => return Err(unknown()),
        }
        self.commands.push(command.to_string());
        Ok(String::new())
    }
}

/// A DRS4 digitizer with a known, slightly different linear response per cell.
#[derive(Debug)]
pub struct SimulatedDigitizer {
    settings: SimulationSettings,
    /// `(gain, offset)` per physical cell.
    response: Vec<(f64, f64)>,
    level: SharedLevel,
    rng: StdRng,
    trigger_tag: u32,
}

impl SimulatedDigitizer {
    pub fn new(settings: SimulationSettings, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let response = (0..NUM_CELLS)
            .map(|_| {
                let gain = settings.nominal_gain
                    * (1.0 + spread(&mut rng, settings.gain_spread));
                let offset = settings.nominal_offset + spread(&mut rng, settings.offset_spread);
                (gain, offset)
            })
            .collect();

        Self {
            settings,
            response,
            level: SharedLevel::default(),
            rng,
            trigger_tag: 0,
        }
    }

    /// A pulser whose output level this digitizer sees.
    pub fn pulser(&self) -> SimulatedPulser {
        SimulatedPulser {
            level: self.level.clone(),
            commands: Vec::new(),
        }
    }

    /// True `(gain, offset)` of `cell`.
    pub fn cell_response(&self, cell: usize) -> Option<(f64, f64)> {
        self.response.get(cell).copied()
    }

    fn next_event(&mut self, channels: &[ChannelId]) -> Result<RawEvent, SourceError> {
        let first_cell = match self.settings.first_cell {
            FirstCellMode::Rotating => self.rng.gen_range(0..NUM_CELLS),
            FirstCellMode::Fixed(cell) => cell,
        };
        let pulse_at = self.rng.gen_range(200..800);
        let level = self.level.get();
        let pulse_volts = self.settings.pulse_volts;

        let mut data = BTreeMap::new();
        for &channel in channels {
            let samples = (0..NUM_CELLS)
                .map(|position| {
                    let (gain, offset) = self.response[aligned_index(position, first_cell)];
                    let noise = spread(&mut self.rng, self.settings.noise);
                    let volts = input_volts(level, pulse_volts, position, pulse_at);
                    (gain * volts + offset + noise) as f32
                })
                .collect();
            data.insert(channel, samples);
        }

        let event = RawEvent::new(data, first_cell, self.trigger_tag)?;
        self.trigger_tag = self.trigger_tag.wrapping_add(1);
        Ok(event)
    }
}

fn input_volts(level: f64, pulse_volts: Option<f64>, position: usize, pulse_at: usize) -> f64 {
    let Some(height) = pulse_volts else {
        return level;
    };
    // Triangular pulse 10 samples wide.
    let distance = position.abs_diff(pulse_at) as f64;
    level - height * (1.0 - distance / 5.0).max(0.0)
}

fn spread(rng: &mut StdRng, half_width: f64) -> f64 {
    if half_width > 0.0 {
        rng.gen_range(-half_width..half_width)
    } else {
        0.0
    }
}

impl WaveformSource for SimulatedDigitizer {
    fn acquire(&mut self, request: &AcquisitionRequest) -> Result<Vec<RawEvent>, SourceError> {
        if self.settings.empty_probability > 0.0
            && self.rng.gen_bool(self.settings.empty_probability.min(1.0))
        {
            return Ok(Vec::new());
        }

        let channels: Vec<ChannelId> = (0..NUM_CHANNELS)
            .filter_map(|n| ChannelId::new(n).ok())
            .filter(|&ch| request.includes(ch))
            .collect();

        (0..request.trigger_count)
            .map(|_| self.next_event(&channels))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform_source::SamplingFrequency;

    fn noiseless() -> SimulationSettings {
        SimulationSettings {
            noise: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_pulser_drives_digitizer_level() {
        let mut digitizer = SimulatedDigitizer::new(noiseless(), 7);
        let mut pulser = digitizer.pulser();
        pulser.configure_dc_output().unwrap();
        pulser.set_dc_offset(0.125).unwrap();
        assert_eq!(pulser.level(), 0.125);

        let ch = ChannelId::new(2).unwrap();
        let request = AcquisitionRequest::new(&[ch], SamplingFrequency::MHz750, 4);
        let events = digitizer.acquire(&request).unwrap();
        assert_eq!(events.len(), 4);

        for event in &events {
            for sample in event.aligned_samples(ch).unwrap() {
                let (gain, offset) = digitizer.cell_response(sample.cell).unwrap();
                let expected = (gain * 0.125 + offset) as f32;
                assert!((sample.amplitude - expected).abs() < 1e-3);
            }
        }
        assert_eq!(events[3].trigger_tag(), 3);
    }

    #[test]
    fn test_unknown_commands_fail() {
        let digitizer = SimulatedDigitizer::new(noiseless(), 1);
        let mut pulser = digitizer.pulser();
        assert!(pulser.send_command("OUTPUT ON").is_err());
        assert!(pulser.send_command("DCOFFS abc").is_err());
        assert!(pulser.commands().is_empty());
    }

    #[test]
    fn test_fixed_first_cell_and_channel_mask() {
        let settings = SimulationSettings {
            first_cell: FirstCellMode::Fixed(100),
            ..noiseless()
        };
        let mut digitizer = SimulatedDigitizer::new(settings, 3);
        let channels = [ChannelId::new(0).unwrap(), ChannelId::new(5).unwrap()];
        let request = AcquisitionRequest::new(&channels, SamplingFrequency::MHz5000, 2);

        let events = digitizer.acquire(&request).unwrap();
        assert!(events.iter().all(|e| e.first_cell() == 100));
        assert_eq!(events[0].channel_ids().collect::<Vec<_>>(), channels.to_vec());
    }

    #[test]
    fn test_empty_acquisitions() {
        let settings = SimulationSettings {
            empty_probability: 1.0,
            ..noiseless()
        };
        let mut digitizer = SimulatedDigitizer::new(settings, 3);
        let request = AcquisitionRequest::new(&[ChannelId::new(0).unwrap()], SamplingFrequency::MHz750, 2);
        assert!(digitizer.acquire(&request).unwrap().is_empty());
    }
}
