use crate::aggregator::{AggregateError, CalibrationAggregator};
use crate::pulser::{Pulser, PulserError};
use crate::session::CancellationToken;
use crate::waveform_source::{acquire_events, AcquisitionRequest, SourceError, WaveformSource};
use std::thread;
use std::time::Duration;

/// Largest DC level the reference pulser may be asked for, in volts.
///
/// Protects the digitizer input; applies to the magnitude of each setpoint
/// independently of the requested sweep bounds.
pub const DEFAULT_PULSER_CEILING_VOLTS: f64 = 0.5;

/// Default time the pulser output is given to stabilize after a change.
pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_millis(100);

/// Setpoints are rounded to 1 nV.
const SETPOINTS_PER_VOLT: f64 = 1e9;

/// Longest sweep a plan may describe.
pub const MAX_SETPOINTS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CeilingPolicy {
    /// Refuse the whole plan if any setpoint exceeds the ceiling.
    #[default]
    Reject,
    /// Drop the setpoints beyond the ceiling and sweep the rest.
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageCeiling {
    pub volts: f64,
    pub policy: CeilingPolicy,
}

impl Default for VoltageCeiling {
    fn default() -> Self {
        Self {
            volts: DEFAULT_PULSER_CEILING_VOLTS,
            policy: CeilingPolicy::Reject,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Invalid sweep plan: {0}")]
    InvalidPlan(&'static str),

    #[error("Setpoint {requested} V exceeds the pulser ceiling of {ceiling} V")]
    CeilingExceeded { requested: f64, ceiling: f64 },

    #[error("Pulser command failed at step {step} ({volts} V): {source}")]
    ExternalCommandFailure {
        step: usize,
        volts: f64,
        #[source]
        source: PulserError,
    },

    #[error("Acquisition failed at step {step} ({volts} V): {source}")]
    Acquisition {
        step: usize,
        volts: f64,
        #[source]
        source: SourceError,
    },

    #[error("Could not aggregate event: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("Sweep cancelled before step {step}")]
    Cancelled { step: usize },
}

/// An ordered DC sweep of the reference pulser.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub v_min: f64,
    pub v_max: f64,
    pub v_step: f64,
    pub settle_time: Duration,
    pub events_per_step: usize,
    pub ceiling: VoltageCeiling,
}

impl SweepPlan {
    pub fn new(v_min: f64, v_max: f64, v_step: f64) -> Self {
        Self {
            v_min,
            v_max,
            v_step,
            settle_time: DEFAULT_SETTLE_TIME,
            events_per_step: 1024,
            ceiling: VoltageCeiling::default(),
        }
    }

    pub fn settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    pub fn events_per_step(mut self, events_per_step: usize) -> Self {
        self.events_per_step = events_per_step;
        self
    }

    pub fn ceiling(mut self, ceiling: VoltageCeiling) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// `v_min, v_min + step, ...` up to and including `v_max`, after the
    /// ceiling policy has been applied.
    pub fn setpoints(&self) -> Result<Vec<f64>, SweepError> {
        if !self.v_min.is_finite() || !self.v_max.is_finite() {
            return Err(SweepError::InvalidPlan("sweep bounds must be finite"));
        }
        if !self.v_step.is_finite() || self.v_step <= 0.0 {
            return Err(SweepError::InvalidPlan("step must be a positive number"));
        }
        if self.v_step * SETPOINTS_PER_VOLT < 1.0 {
            return Err(SweepError::InvalidPlan("step is below the 1 nV setpoint resolution"));
        }
        if self.v_min > self.v_max {
            return Err(SweepError::InvalidPlan("v_min is above v_max"));
        }
        if self.events_per_step == 0 {
            return Err(SweepError::InvalidPlan("events_per_step must be at least 1"));
        }
        if !self.ceiling.volts.is_finite() || self.ceiling.volts < 0.0 {
            return Err(SweepError::InvalidPlan("ceiling must be a non-negative number"));
        }

        // Index based, so rounding errors do not accumulate along the sweep.
        let span = (self.v_max - self.v_min) / self.v_step;
        let count = (span + 1e-9).floor() + 1.0;
        if count > MAX_SETPOINTS as f64 {
            return Err(SweepError::InvalidPlan("sweep has more than 100000 setpoints"));
        }
        let steps = count as usize;

        let mut setpoints = Vec::with_capacity(steps);
        for i in 0..steps {
            let v = self.v_min + i as f64 * self.v_step;
            let v = (v * SETPOINTS_PER_VOLT).round() / SETPOINTS_PER_VOLT;
            // Normalize -0.0 so the pulser never sees "DCOFFS -0".
            let v = if v == 0.0 { 0.0 } else { v };

            if v.abs() > self.ceiling.volts {
                match self.ceiling.policy {
                    CeilingPolicy::Reject => {
                        return Err(SweepError::CeilingExceeded {
                            requested: v,
                            ceiling: self.ceiling.volts,
                        })
                    }
                    CeilingPolicy::Truncate => {
                        log::warn!(
                            "Dropping setpoint {} V above the {} V pulser ceiling",
                            v,
                            self.ceiling.volts
                        );
                        continue;
                    }
                }
            }
            setpoints.push(v);
        }

        if setpoints.is_empty() {
            return Err(SweepError::InvalidPlan("no setpoint left below the pulser ceiling"));
        }
        Ok(setpoints)
    }
}

/// What a completed sweep did.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SweepReport {
    /// Setpoints that contributed events, in sweep order.
    pub completed: Vec<f64>,
    /// Setpoints where the source delivered nothing.
    pub skipped: Vec<f64>,
    pub events: usize,
}

/// Steps the pulser through a [`SweepPlan`] and feeds each step's events to
/// an aggregator.
///
/// Strictly sequential: set voltage, settle, acquire, next. The settle time
/// is part of the measurement and is never shortened.
#[derive(Debug, Clone)]
pub struct SweepController {
    plan: SweepPlan,
    request: AcquisitionRequest,
}

impl SweepController {
    pub fn new(plan: SweepPlan, request: AcquisitionRequest) -> Self {
        let request = request.with_trigger_count(plan.events_per_step);
        Self { plan, request }
    }

    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    #[tracing::instrument(skip_all, fields(channel = %aggregator.channel()))]
    pub fn run<P, S>(
        &self,
        pulser: &mut P,
        source: &mut S,
        aggregator: &mut CalibrationAggregator,
        cancel: Option<&CancellationToken>,
    ) -> Result<SweepReport, SweepError>
    where
        P: Pulser + ?Sized,
        S: WaveformSource + ?Sized,
    {
        let setpoints = self.plan.setpoints()?;
        log::info!(
            "Starting sweep over {} setpoints ({} V to {} V), {} events each",
            setpoints.len(),
            setpoints[0],
            setpoints[setpoints.len() - 1],
            self.plan.events_per_step
        );

        let mut report = SweepReport::default();

        for (step, &volts) in setpoints.iter().enumerate() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                log::info!("Sweep cancelled before step {}", step);
                return Err(SweepError::Cancelled { step });
            }

            log::debug!("Step {}: setting pulser to {} V", step, volts);
            pulser
                .set_dc_offset(volts)
                .map_err(|source| SweepError::ExternalCommandFailure { step, volts, source })?;

            thread::sleep(self.plan.settle_time);

            let events = match acquire_events(source, &self.request) {
                Ok(events) => events,
                Err(SourceError::AcquisitionEmpty) => {
                    log::warn!("No events at {} V, skipping step {}", volts, step);
                    report.skipped.push(volts);
                    continue;
                }
                Err(source) => return Err(SweepError::Acquisition { step, volts, source }),
            };

            for event in &events {
                aggregator.push_event(volts, event)?;
            }
            report.events += events.len();
            report.completed.push(volts);
        }

        log::info!(
            "Sweep finished: {} steps, {} skipped, {} events",
            report.completed.len(),
            report.skipped.len(),
            report.events
        );
        Ok(report)
    }
}
