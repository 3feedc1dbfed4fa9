use crate::calibration_model::CalibrationModel;
use crate::raw_event::{aligned_index, ChannelId, RawEvent, NUM_CELLS};
use std::sync::Arc;

/// Linear map of a voltage window onto an unsigned ADC code range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcScale {
    pub min_volts: f64,
    pub max_volts: f64,
    pub bits: u32,
}

impl AdcScale {
    /// 1 Vpp input range of the DT5742 on a 12 bit code.
    pub const DT5742: Self = Self {
        min_volts: -0.5,
        max_volts: 0.5,
        bits: 12,
    };

    pub fn max_code(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    /// Code for `volts`, clamped to the ends of the range instead of wrapping.
    pub fn to_code(&self, volts: f64) -> u32 {
        let max_code = f64::from(self.max_code());
        let fraction = (volts - self.min_volts) / (self.max_volts - self.min_volts);
        (fraction * max_code).round().clamp(0.0, max_code) as u32
    }
}

impl Default for AdcScale {
    fn default() -> Self {
        Self::DT5742
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OutputUnit {
    /// Applied voltage recovered by the calibration.
    #[default]
    Normalized,
    /// Recovered voltage re-encoded on a fixed ADC scale.
    AdcCounts(AdcScale),
}

impl OutputUnit {
    pub fn label(&self) -> &'static str {
        match self {
            OutputUnit::Normalized => "V",
            OutputUnit::AdcCounts(_) => "ADC",
        }
    }
}

/// What to do with a sample recorded by a cell without usable calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidCellPolicy {
    /// Store NaN for that sample and carry on.
    #[default]
    Sentinel,
    /// Refuse to correct the waveform.
    Abort,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CorrectionError {
    #[error("Cell {cell} has no usable calibration")]
    InvalidCellCalibration { cell: usize },

    #[error("Event {trigger_tag} carries no data for channel {channel}")]
    MissingChannel { channel: ChannelId, trigger_tag: u32 },

    #[error("Sample recorded by cell {cell} is not a finite number")]
    NonFiniteSample { cell: usize },
}

/// Calibrated waveform in physical cell order.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedWaveform {
    pub channel: ChannelId,
    pub trigger_tag: u32,
    pub first_cell: usize,
    pub unit: OutputUnit,
    /// Index `i` holds the sample recorded by cell `i`.
    pub samples: Vec<f64>,
    /// Samples replaced by NaN because their cell was unusable or the raw
    /// value was not finite.
    pub invalid_samples: usize,
}

impl CalibratedWaveform {
    /// Samples rotated back into capture order (buffer position 0 first).
    pub fn capture_order(&self) -> Vec<f64> {
        (0..NUM_CELLS)
            .map(|position| self.samples[aligned_index(position, self.first_cell)])
            .collect()
    }
}

/// Apply the inverse per-cell calibration to one channel of `event`.
pub fn correct(
    event: &RawEvent,
    model: &CalibrationModel,
    channel: ChannelId,
    unit: OutputUnit,
    policy: InvalidCellPolicy,
) -> Result<CalibratedWaveform, CorrectionError> {
    #[cfg(feature = "cpu-profiling")]
    let _zone = tracy_client::Client::running()
        .map(|client| client.span(tracy_client::span_location!("correct"), 0));

    let aligned = event
        .aligned_samples(channel)
        .ok_or(CorrectionError::MissingChannel {
            channel,
            trigger_tag: event.trigger_tag(),
        })?;

    let mut samples = vec![f64::NAN; NUM_CELLS];
    let mut invalid_samples = 0;

    for sample in aligned {
        let normalized = model
            .cell(sample.cell)
            .and_then(|calibration| calibration.invert(f64::from(sample.amplitude)));

        samples[sample.cell] = match (normalized, policy) {
            (Some(volts), _) if volts.is_finite() => match unit {
                OutputUnit::Normalized => volts,
                OutputUnit::AdcCounts(scale) => f64::from(scale.to_code(volts)),
            },
            (_, InvalidCellPolicy::Sentinel) => {
                invalid_samples += 1;
                f64::NAN
            }
            (Some(_), InvalidCellPolicy::Abort) => {
                return Err(CorrectionError::NonFiniteSample { cell: sample.cell });
            }
            (None, InvalidCellPolicy::Abort) => {
                return Err(CorrectionError::InvalidCellCalibration { cell: sample.cell });
            }
        };
    }

    Ok(CalibratedWaveform {
        channel,
        trigger_tag: event.trigger_tag(),
        first_cell: event.first_cell(),
        unit,
        samples,
        invalid_samples,
    })
}

/// A loaded model together with the caller's output choices.
#[derive(Debug, Clone)]
pub struct WaveformCorrector {
    model: Arc<CalibrationModel>,
    unit: OutputUnit,
    policy: InvalidCellPolicy,
}

impl WaveformCorrector {
    pub fn new(model: Arc<CalibrationModel>) -> Self {
        Self {
            model,
            unit: OutputUnit::default(),
            policy: InvalidCellPolicy::default(),
        }
    }

    pub fn with_unit(mut self, unit: OutputUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_policy(mut self, policy: InvalidCellPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn model(&self) -> &Arc<CalibrationModel> {
        &self.model
    }

    pub fn correct(
        &self,
        event: &RawEvent,
        channel: ChannelId,
    ) -> Result<CalibratedWaveform, CorrectionError> {
        correct(event, &self.model, channel, self.unit, self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration_model::CellCalibration;

    fn ch(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    /// Per-cell slope and intercept that differ from cell to cell.
    fn cell_response(cell: usize) -> CellCalibration {
        CellCalibration::new(
            48.0 + (cell % 7) as f32 * 0.5,
            2000.0 + (cell % 13) as f32 * 3.0,
            1.0,
        )
    }

    fn varied_model() -> CalibrationModel {
        CalibrationModel::new((0..NUM_CELLS).map(cell_response).collect()).unwrap()
    }

    #[test]
    fn test_recovers_applied_voltage_under_rotation() {
        let model = varied_model();
        let applied = 0.21;
        let first_cell = 777;

        let raw: Vec<f32> = (0..NUM_CELLS)
            .map(|p| {
                let c = cell_response(aligned_index(p, first_cell));
                (f64::from(c.slope) * applied + f64::from(c.intercept)) as f32
            })
            .collect();
        let event = RawEvent::single_channel(ch(0), raw, first_cell, 3).unwrap();

        let waveform = correct(&event, &model, ch(0), OutputUnit::Normalized, InvalidCellPolicy::Abort)
            .unwrap();
        assert_eq!(waveform.invalid_samples, 0);
        for volts in &waveform.samples {
            assert!((volts - applied).abs() < 1e-4, "got {volts}");
        }
    }

    #[test]
    fn test_correction_does_not_touch_the_event() {
        let model = varied_model();
        let raw: Vec<f32> = (0..NUM_CELLS).map(|p| 1900.0 + (p % 50) as f32).collect();
        let event = RawEvent::single_channel(ch(2), raw.clone(), 512, 1).unwrap();

        let first = correct(&event, &model, ch(2), OutputUnit::Normalized, InvalidCellPolicy::Sentinel)
            .unwrap();
        let second = correct(&event, &model, ch(2), OutputUnit::Normalized, InvalidCellPolicy::Sentinel)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(event.samples(ch(2)).unwrap(), raw.as_slice());
    }

    #[test]
    fn test_output_is_cell_indexed() {
        let model = CalibrationModel::uniform(CellCalibration::new(1.0, 0.0, 1.0)).unwrap();
        let raw: Vec<f32> = (0..NUM_CELLS).map(|p| p as f32).collect();
        let event = RawEvent::single_channel(ch(0), raw, 1000, 0).unwrap();

        let waveform = correct(&event, &model, ch(0), OutputUnit::Normalized, InvalidCellPolicy::Abort)
            .unwrap();
        // Buffer position 24 was recorded by cell 0.
        assert_eq!(waveform.samples[0], 24.0);
        assert_eq!(waveform.samples[1000], 0.0);
        assert_eq!(waveform.capture_order()[0], 0.0);
        assert_eq!(waveform.capture_order()[24], 24.0);
    }

    #[test]
    fn test_adc_counts_clamp_at_both_ends() {
        let scale = AdcScale::DT5742;
        assert_eq!(scale.max_code(), 4095);
        assert_eq!(scale.to_code(1.0), 4095);
        assert_eq!(scale.to_code(-2.0), 0);
        assert_eq!(scale.to_code(0.0), 2048);
        assert_eq!(scale.to_code(-0.5), 0);
        assert_eq!(scale.to_code(0.5), 4095);
    }

    #[test]
    fn test_invalid_cell_policies() {
        let mut cells = vec![CellCalibration::new(1.0, 0.0, 1.0); NUM_CELLS];
        cells[10] = CellCalibration::INVALID;
        let model = CalibrationModel::new(cells).unwrap();
        let event = RawEvent::single_channel(ch(0), vec![5.0; NUM_CELLS], 0, 0).unwrap();

        let waveform = correct(&event, &model, ch(0), OutputUnit::Normalized, InvalidCellPolicy::Sentinel)
            .unwrap();
        assert!(waveform.samples[10].is_nan());
        assert_eq!(waveform.samples[11], 5.0);
        assert_eq!(waveform.invalid_samples, 1);

        assert_eq!(
            correct(&event, &model, ch(0), OutputUnit::Normalized, InvalidCellPolicy::Abort),
            Err(CorrectionError::InvalidCellCalibration { cell: 10 })
        );
    }

    #[test]
    fn test_non_finite_samples_follow_the_policy() {
        let model = CalibrationModel::uniform(CellCalibration::new(50.0, 2048.0, 1.0)).unwrap();
        let mut raw = vec![2048.0; NUM_CELLS];
        raw[7] = f32::NAN;
        raw[8] = f32::INFINITY;
        let event = RawEvent::single_channel(ch(0), raw, 0, 0).unwrap();
        let adc = OutputUnit::AdcCounts(AdcScale::DT5742);

        let waveform = correct(&event, &model, ch(0), adc, InvalidCellPolicy::Sentinel).unwrap();
        assert!(waveform.samples[7].is_nan());
        assert!(waveform.samples[8].is_nan());
        assert_eq!(waveform.samples[9], 2048.0);
        assert_eq!(waveform.invalid_samples, 2);

        assert_eq!(
            correct(&event, &model, ch(0), adc, InvalidCellPolicy::Abort),
            Err(CorrectionError::NonFiniteSample { cell: 7 })
        );
    }

    #[test]
    fn test_missing_channel() {
        let model = CalibrationModel::uniform(CellCalibration::new(1.0, 0.0, 1.0)).unwrap();
        let event = RawEvent::single_channel(ch(0), vec![0.0; NUM_CELLS], 0, 9).unwrap();
        let corrector = WaveformCorrector::new(Arc::new(model));
        assert_eq!(
            corrector.correct(&event, ch(3)),
            Err(CorrectionError::MissingChannel { channel: ch(3), trigger_tag: 9 })
        );
    }

    #[test]
    fn test_corrector_applies_unit() {
        let model = CalibrationModel::uniform(CellCalibration::new(50.0, 2048.0, 1.0)).unwrap();
        let event = RawEvent::single_channel(ch(1), vec![2048.0; NUM_CELLS], 0, 0).unwrap();
        let corrector = WaveformCorrector::new(Arc::new(model))
            .with_unit(OutputUnit::AdcCounts(AdcScale::DT5742))
            .with_policy(InvalidCellPolicy::Abort);

        let waveform = corrector.correct(&event, ch(1)).unwrap();
        assert!(waveform.samples.iter().all(|&code| code == 2048.0));
        assert_eq!(waveform.unit.label(), "ADC");
    }
}
