use crate::waveform_source::SamplingFrequency;
use std::f64::consts::PI;
use std::ops::Range;

/// Samples 49..973 avoid the edges of the DRS4 buffer where the readout is
/// least reliable.
pub const DEFAULT_CANDIDATE_WINDOW: Range<usize> = 49..973;

/// Centre of a 12 bit code, used by [`adc_to_millivolts`].
const ADC_MIDSCALE: f64 = 2048.0;
const ADC_FULL_SCALE: f64 = 4096.0;

/// Uncalibrated display conversion: 12 bit code centred at 2048 onto a 1 V span.
pub fn adc_to_millivolts(code: f64) -> f64 {
    (code - ADC_MIDSCALE) / ADC_FULL_SCALE * 1000.0
}

/// Largest minus smallest finite value, `None` when there is none.
fn swing(samples: &[f64]) -> Option<f64> {
    let mut finite = samples.iter().copied().filter(|s| s.is_finite());
    let first = finite.next()?;
    let (min, max) = finite.fold((first, first), |(lo, hi), s| (lo.min(s), hi.max(s)));
    Some(max - min)
}

fn clamp_range(range: &Range<usize>, len: usize) -> Range<usize> {
    let start = range.start.min(len);
    start..range.end.min(len).max(start)
}

/// Gate that keeps only waveforms with a genuine pulse in their central window.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakToPeakFilter {
    pub window: Range<usize>,
    /// Minimum swing, in the unit of the samples.
    pub threshold: f64,
}

impl PeakToPeakFilter {
    pub fn new(threshold: f64) -> Self {
        Self {
            window: DEFAULT_CANDIDATE_WINDOW,
            threshold,
        }
    }

    pub fn with_window(mut self, window: Range<usize>) -> Self {
        self.window = window;
        self
    }

    pub fn peak_to_peak(&self, samples: &[f64]) -> Option<f64> {
        swing(&samples[clamp_range(&self.window, samples.len())])
    }

    pub fn accepts(&self, samples: &[f64]) -> bool {
        self.peak_to_peak(samples)
            .is_some_and(|ptp| ptp >= self.threshold)
    }
}

/// Baseline and the sample indices it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub level: f64,
    /// Empty when every candidate sample was masked and the whole window was used.
    pub used: Vec<usize>,
}

/// Median baseline over a candidate window, masking pulses.
///
/// Every sliding window whose peak-to-peak exceeds `ptp_threshold` marks a
/// pulse; the samples from `pre_margin` before to `post_margin` after its
/// start are excluded.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineEstimator {
    pub window: Range<usize>,
    pub window_size: usize,
    pub ptp_threshold: f64,
    pub pre_margin: usize,
    pub post_margin: usize,
}

impl Default for BaselineEstimator {
    fn default() -> Self {
        Self {
            window: DEFAULT_CANDIDATE_WINDOW,
            window_size: 20,
            ptp_threshold: 5.0,
            pre_margin: 30,
            post_margin: 150,
        }
    }
}

impl BaselineEstimator {
    pub fn estimate(&self, samples: &[f64]) -> Option<Baseline> {
        let region = clamp_range(&self.window, samples.len());
        if region.is_empty() {
            return None;
        }

        let mut excluded = vec![false; samples.len()];
        let last_start = region.end.saturating_sub(self.window_size);
        for start in region.start..last_start {
            let exceeds = swing(&samples[start..start + self.window_size])
                .is_some_and(|ptp| ptp > self.ptp_threshold);
            if exceeds {
                let from = start.saturating_sub(self.pre_margin);
                let to = (start + self.post_margin).min(samples.len());
                excluded[from..to].iter_mut().for_each(|e| *e = true);
            }
        }

        let used: Vec<usize> = region
            .clone()
            .filter(|&i| !excluded[i] && samples[i].is_finite())
            .collect();

        if used.is_empty() {
            log::debug!("Baseline window fully masked, using all {} candidates", region.len());
            let level = median(samples[region].iter().copied())?;
            return Some(Baseline { level, used });
        }

        let level = median(used.iter().map(|&i| samples[i]))?;
        Some(Baseline { level, used })
    }

    /// Subtract the estimated baseline in place, returning it.
    pub fn subtract(&self, samples: &mut [f64]) -> Option<f64> {
        let baseline = self.estimate(samples)?;
        samples.iter_mut().for_each(|s| *s -= baseline.level);
        Some(baseline.level)
    }
}

/// Cutoff of the display noise filter.
pub const DEFAULT_LOWPASS_CUTOFF_HZ: f64 = 200e6;
pub const DEFAULT_LOWPASS_ORDER: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FilterDesignError {
    #[error("Filter order must be between 1 and 20, got {0}")]
    InvalidOrder(usize),

    #[error("Cutoff {cutoff_hz} Hz is not between 0 and the Nyquist frequency {nyquist_hz} Hz")]
    CutoffOutOfRange { cutoff_hz: f64, nyquist_hz: f64 },
}

/// Second order section, `a0` normalized to 1, run in direct form II transposed.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
}

impl Biquad {
    fn dc_gain(&self) -> f64 {
        (self.b[0] + self.b[1] + self.b[2]) / (1.0 + self.a[0] + self.a[1])
    }

    /// State after an infinitely long constant `input`.
    fn steady_state(&self, input: f64) -> [f64; 2] {
        let output = self.dc_gain() * input;
        [output - self.b[0] * input, self.b[2] * input - self.a[1] * output]
    }

    fn run(&self, samples: &mut [f64], mut state: [f64; 2]) {
        for sample in samples.iter_mut() {
            let input = *sample;
            let output = self.b[0] * input + state[0];
            state[0] = self.b[1] * input - self.a[0] * output + state[1];
            state[1] = self.b[2] * input - self.a[1] * output;
            *sample = output;
        }
    }
}

/// Butterworth low-pass applied forward and backward, so pulses keep their
/// timing.
///
/// Edges are padded with an odd reflection and every section starts in its
/// steady state for the first sample, which keeps a constant input constant.
#[derive(Debug, Clone, PartialEq)]
pub struct LowPassFilter {
    sections: Vec<Biquad>,
    order: usize,
    pub cutoff_hz: f64,
    pub sample_rate_hz: f64,
}

impl LowPassFilter {
    pub fn new(order: usize, cutoff_hz: f64, sampling: SamplingFrequency) -> Result<Self, FilterDesignError> {
        let sample_rate_hz = sampling.hz();
        let nyquist_hz = sample_rate_hz / 2.0;
        if order == 0 || order > 20 {
            return Err(FilterDesignError::InvalidOrder(order));
        }
        if !(cutoff_hz > 0.0 && cutoff_hz < nyquist_hz) {
            return Err(FilterDesignError::CutoffOutOfRange { cutoff_hz, nyquist_hz });
        }

        // Bilinear transform with the cutoff pre-warped.
        let k = (PI * cutoff_hz / sample_rate_hz).tan();
        let mut sections = Vec::with_capacity(order.div_ceil(2));
        for pole in 0..order {
            let theta = PI * (2 * pole + order + 1) as f64 / (2 * order) as f64;
            let (sin, cos) = theta.sin_cos();
            if sin > 1e-12 {
                // One section per conjugate pair.
                let q = -1.0 / (2.0 * cos);
                let norm = 1.0 / (1.0 + k / q + k * k);
                let b0 = k * k * norm;
                sections.push(Biquad {
                    b: [b0, 2.0 * b0, b0],
                    a: [2.0 * (k * k - 1.0) * norm, (1.0 - k / q + k * k) * norm],
                });
            } else if sin.abs() <= 1e-12 {
                let norm = 1.0 / (1.0 + k);
                sections.push(Biquad {
                    b: [k * norm, k * norm, 0.0],
                    a: [(k - 1.0) * norm, 0.0],
                });
            }
        }

        Ok(Self {
            sections,
            order,
            cutoff_hz,
            sample_rate_hz,
        })
    }

    /// 4th order at 200 MHz.
    pub fn for_sampling(sampling: SamplingFrequency) -> Result<Self, FilterDesignError> {
        Self::new(DEFAULT_LOWPASS_ORDER, DEFAULT_LOWPASS_CUTOFF_HZ, sampling)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    fn run_cascade(&self, samples: &mut [f64]) {
        let Some(&first) = samples.first() else {
            return;
        };
        let mut input = first;
        for section in &self.sections {
            section.run(samples, section.steady_state(input));
            input *= section.dc_gain();
        }
    }

    /// Zero-phase filtered copy of `samples` in capture order.
    ///
    /// Non-finite samples are bridged with the nearest preceding finite value
    /// while filtering and come back as NaN.
    pub fn filter(&self, samples: &[f64]) -> Vec<f64> {
        let Some(first_finite) = samples.iter().copied().find(|s| s.is_finite()) else {
            return samples.to_vec();
        };
        let mut held = first_finite;
        let bridged: Vec<f64> = samples
            .iter()
            .map(|&s| {
                if s.is_finite() {
                    held = s;
                }
                held
            })
            .collect();

        let n = bridged.len();
        let pad = (3 * (self.order + 1)).min(n - 1);
        let (head, tail) = (bridged[0], bridged[n - 1]);
        let mut extended = Vec::with_capacity(n + 2 * pad);
        extended.extend((1..=pad).rev().map(|i| 2.0 * head - bridged[i]));
        extended.extend_from_slice(&bridged);
        extended.extend((1..=pad).map(|i| 2.0 * tail - bridged[n - 1 - i]));

        self.run_cascade(&mut extended);
        extended.reverse();
        self.run_cascade(&mut extended);
        extended.reverse();

        extended[pad..pad + n]
            .iter()
            .zip(samples)
            .map(|(&filtered, raw)| if raw.is_finite() { filtered } else { f64::NAN })
            .collect()
    }
}

fn median(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut values: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
