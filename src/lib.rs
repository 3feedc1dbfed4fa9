//! # DT5742 Calib
//!
//! Per-cell voltage calibration and waveform correction for CAEN DT5742
//! digitizers built on the DRS4 switched capacitor array.
//!
//! Every one of the 1024 capacitor cells has its own gain and offset. This
//! library sweeps a reference pulser through known DC levels, averages what
//! each physical cell reads at each level, fits a line per cell and uses the
//! inverse of that line to correct later waveforms.
//!
//! ## Features
//!
//! - **Cell alignment**: samples are re-indexed from buffer position to physical cell using the event's `first_cell`
//! - **Calibration sweeps**: strictly sequential set, settle, acquire with a hard pulser voltage ceiling
//! - **Per-cell fitting**: least squares with validity flags instead of silent division by zero
//! - **Persistence**: keyed Parquet tables through `polars`, validated on load
//! - **Correction**: normalized volts or re-encoded 12 bit ADC codes, cell-indexed output
//! - **Live acquisition**: worker thread, single-slot latest frame, cooperative cancellation
//! - **Sinks**: tab separated text and columnar Parquet, optionally gated by peak-to-peak swing
//!
//! ## Examples
//!
//! ### Calibrating against a simulated digitizer
//!
//! ```rust
//! use dt5742_calib::simulation::{SimulatedDigitizer, SimulationSettings};
//! use dt5742_calib::{
//!     fit_model, AcquisitionRequest, CalibrationAggregator, ChannelId, SamplingFrequency,
//!     SweepController, SweepPlan,
//! };
//! use std::time::Duration;
//!
//! let settings = SimulationSettings { noise: 0.0, ..Default::default() };
//! let mut digitizer = SimulatedDigitizer::new(settings, 42);
//! let mut pulser = digitizer.pulser();
//!
//! let channel = ChannelId::new(1)?;
//! let plan = SweepPlan::new(-0.3, 0.3, 0.1)
//!     .settle_time(Duration::ZERO)
//!     .events_per_step(8);
//! let request = AcquisitionRequest::new(&[channel], SamplingFrequency::MHz750, 8);
//!
//! let mut aggregator = CalibrationAggregator::new(channel);
//! SweepController::new(plan, request).run(&mut pulser, &mut digitizer, &mut aggregator, None)?;
//!
//! let outcome = fit_model(&aggregator.finish())?;
//! println!("{} cells calibrated", outcome.model.valid_cells());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Correcting an event
//!
//! ```rust
//! use dt5742_calib::{
//!     CalibrationModel, CellCalibration, ChannelId, InvalidCellPolicy, OutputUnit, RawEvent,
//!     WaveformCorrector,
//! };
//! use std::sync::Arc;
//!
//! let model = CalibrationModel::uniform(CellCalibration::new(50.0, 2048.0, 1.0))?;
//! let corrector = WaveformCorrector::new(Arc::new(model))
//!     .with_unit(OutputUnit::Normalized)
//!     .with_policy(InvalidCellPolicy::Abort);
//!
//! let channel = ChannelId::new(1)?;
//! let event = RawEvent::single_channel(channel, vec![2098.0; 1024], 300, 0)?;
//! let waveform = corrector.correct(&event, channel)?;
//! assert!((waveform.samples[0] - 1.0).abs() < 1e-6);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Live acquisition
//!
//! ```rust,no_run
//! use dt5742_calib::session::{AcquisitionSession, ModelHandle, SessionSettings};
//! use dt5742_calib::simulation::{SimulatedDigitizer, SimulationSettings};
//! use dt5742_calib::{calibration_store, AcquisitionRequest, ChannelId, SamplingFrequency};
//! use std::path::Path;
//!
//! let model = calibration_store::load(Path::new("calibration/calibration.parquet"))?;
//! let channel = ChannelId::new(1)?;
//! let request = AcquisitionRequest::new(&[channel], SamplingFrequency::MHz750, 1);
//!
//! let source = SimulatedDigitizer::new(SimulationSettings::default(), 1);
//! let handle = AcquisitionSession::new(source, ModelHandle::new(model), SessionSettings::new(channel, request))
//!     .spawn();
//!
//! if let Some(frame) = handle.latest() {
//!     println!("event {} on {}", frame.meta.event_number, frame.meta.channel);
//! }
//! println!("{:?}", handle.status());
//! handle.stop()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod aggregator;
pub mod calibration_model;
pub mod calibration_store;
pub mod config;
pub mod corrector;
pub mod fitter;
pub mod pulser;
pub mod raw_event;
pub mod session;
pub mod simulation;
pub mod sinks;
pub mod sweep;
pub mod waveform_filters;
pub mod waveform_source;

// Re-export the main types for convenience
pub use raw_event::{aligned_index, ChannelId, RawEvent, RawEventError, NUM_CELLS, NUM_CHANNELS};

pub use waveform_source::{AcquisitionRequest, SamplingFrequency, SourceError, WaveformSource};

pub use pulser::{CommandPulser, Pulser, PulserError};

pub use aggregator::{CalibrationAggregator, CellSeries, CellSeriesTable};

pub use fitter::{fit_model, FitError, FitOutcome};

pub use calibration_model::{CalibrationModel, CellCalibration, ModelError};

pub use calibration_store::{MalformedCalibrationFile, StoreError};

pub use corrector::{
    correct, AdcScale, CalibratedWaveform, CorrectionError, InvalidCellPolicy, OutputUnit,
    WaveformCorrector,
};

pub use sweep::{SweepController, SweepError, SweepPlan, SweepReport};

pub use config::{ConfigError, RunConfig};
