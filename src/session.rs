//! Live acquisition: one worker owns the source, a front end polls the
//! newest corrected frame.
use crate::calibration_model::CalibrationModel;
use crate::calibration_store::{self, StoreError};
use crate::corrector::{
    correct, CalibratedWaveform, CorrectionError, InvalidCellPolicy, OutputUnit,
};
use crate::raw_event::ChannelId;
use crate::sinks::{SinkError, WaveformMeta, WaveformSink};
use crate::waveform_source::{acquire_events, AcquisitionRequest, SourceError, WaveformSource};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared stop flag, polled once per acquisition iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Single-slot handoff: publishing overwrites, nothing is ever queued.
#[derive(Debug)]
pub struct LatestSlot<T>(Arc<Mutex<Option<T>>>);

impl<T> Clone for LatestSlot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning whether an unread value was dropped.
    pub fn publish(&self, value: T) -> bool {
        lock(&self.0).replace(value).is_some()
    }

    /// Remove and return the newest value.
    pub fn take(&self) -> Option<T> {
        lock(&self.0).take()
    }
}

impl<T: Clone> LatestSlot<T> {
    /// Copy of the newest value, left in place for other readers.
    pub fn latest(&self) -> Option<T> {
        lock(&self.0).clone()
    }
}

/// The model in use by a session. Reloading swaps the whole reference;
/// corrections in flight keep the model they started with.
#[derive(Debug, Clone)]
pub struct ModelHandle(Arc<Mutex<Arc<CalibrationModel>>>);

impl ModelHandle {
    pub fn new(model: CalibrationModel) -> Self {
        Self(Arc::new(Mutex::new(Arc::new(model))))
    }

    pub fn current(&self) -> Arc<CalibrationModel> {
        Arc::clone(&lock(&self.0))
    }

    pub fn replace(&self, model: CalibrationModel) {
        *lock(&self.0) = Arc::new(model);
        log::info!("Calibration model replaced");
    }

    /// Load and swap in a model file. A malformed file leaves the current
    /// model untouched.
    pub fn reload(&self, path: &Path) -> Result<(), StoreError> {
        let model = calibration_store::load(path)?;
        self.replace(model);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Calibration unusable, recalibrate: {0}")]
    CalibrationUnusable(String),

    #[error("Source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Could not correct event: {0}")]
    Correction(CorrectionError),

    #[error("Sink failed: {0}")]
    Sink(#[from] SinkError),

    #[error("Acquisition worker panicked")]
    WorkerPanicked,
}

impl From<CorrectionError> for SessionError {
    fn from(error: CorrectionError) -> Self {
        match error {
            CorrectionError::InvalidCellCalibration { .. } => {
                SessionError::CalibrationUnusable(error.to_string())
            }
            CorrectionError::MissingChannel { .. } | CorrectionError::NonFiniteSample { .. } => {
                SessionError::Correction(error)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub channel: ChannelId,
    pub request: AcquisitionRequest,
    pub unit: OutputUnit,
    pub policy: InvalidCellPolicy,
    /// Pause after a cycle that produced no data.
    pub retry_delay: Duration,
}

impl SessionSettings {
    pub fn new(channel: ChannelId, request: AcquisitionRequest) -> Self {
        Self {
            channel,
            request,
            unit: OutputUnit::default(),
            policy: InvalidCellPolicy::default(),
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// One corrected waveform ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredFrame {
    pub meta: WaveformMeta,
    pub waveform: CalibratedWaveform,
}

/// What the last acquisition cycle produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Nothing captured this cycle; try again.
    NoData,
    Acquired { events: usize, latest: AcquiredFrame },
}

/// State a front end shows to the user.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionStatus {
    #[default]
    Starting,
    Running { events: u64 },
    /// Transient; the worker keeps retrying.
    NoData,
    /// Blocking; the worker has stopped until a new calibration is loaded.
    CalibrationUnusable(String),
    Failed(String),
    Stopped,
}

/// Acquisition state of one digitizer: the source, the model and the sink.
pub struct AcquisitionSession<S> {
    source: S,
    model: ModelHandle,
    settings: SessionSettings,
    sink: Option<Box<dyn WaveformSink + Send>>,
    events: u64,
}

impl<S: WaveformSource> AcquisitionSession<S> {
    pub fn new(source: S, model: ModelHandle, settings: SessionSettings) -> Self {
        Self {
            source,
            model,
            settings,
            sink: None,
            events: 0,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn WaveformSink + Send>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// One blocking acquisition, corrected and handed to the sink.
    pub fn step(&mut self) -> Result<StepOutcome, SessionError> {
        let raw_events = match acquire_events(&mut self.source, &self.settings.request) {
            Ok(events) => events,
            Err(error) if error.is_transient() => return Ok(StepOutcome::NoData),
            Err(error) => return Err(error.into()),
        };

        let model = self.model.current();
        if model.valid_cells() == 0 {
            return Err(SessionError::CalibrationUnusable(
                "no cell has a valid calibration".to_string(),
            ));
        }

        let mut latest = None;
        for raw in &raw_events {
            let waveform = correct(
                raw,
                &model,
                self.settings.channel,
                self.settings.unit,
                self.settings.policy,
            )?;
            let meta = WaveformMeta::for_waveform(self.events, &waveform);
            if let Some(sink) = self.sink.as_mut() {
                sink.consume(&waveform, &meta)?;
            }
            self.events += 1;
            latest = Some(AcquiredFrame { meta, waveform });
        }

        match latest {
            Some(latest) => Ok(StepOutcome::Acquired {
                events: raw_events.len(),
                latest,
            }),
            None => Ok(StepOutcome::NoData),
        }
    }

    fn finish_sink(&mut self) -> Result<(), SessionError> {
        if let Some(sink) = self.sink.as_mut() {
            sink.finish()?;
        }
        Ok(())
    }
}

/// How a worker ended.
pub struct SessionExit<S> {
    pub session: AcquisitionSession<S>,
    /// Set when the worker stopped on its own because of an error.
    pub error: Option<SessionError>,
}

impl<S: WaveformSource + Send + 'static> AcquisitionSession<S> {
    /// Move the session onto its own acquisition thread.
    pub fn spawn(self) -> SessionHandle<S> {
        let cancel = CancellationToken::new();
        let latest = LatestSlot::new();
        let status = LatestSlot::new();
        status.publish(SessionStatus::Starting);
        let model = self.model.clone();

        let worker = {
            let cancel = cancel.clone();
            let latest = latest.clone();
            let status = status.clone();
            thread::spawn(move || run_worker(self, &cancel, &latest, &status))
        };

        SessionHandle {
            cancel,
            latest,
            status,
            model,
            worker,
        }
    }
}

fn run_worker<S: WaveformSource>(
    mut session: AcquisitionSession<S>,
    cancel: &CancellationToken,
    latest: &LatestSlot<AcquiredFrame>,
    status: &LatestSlot<SessionStatus>,
) -> SessionExit<S> {
    let span = tracing::info_span!("acquisition_session", channel = %session.settings.channel);
    let _entered = span.enter();
    log::info!("Acquisition session started on {}", session.settings.channel);

    let mut error = None;
    while !cancel.is_cancelled() {
        match session.step() {
            Ok(StepOutcome::Acquired { latest: frame, .. }) => {
                latest.publish(frame);
                status.publish(SessionStatus::Running {
                    events: session.events,
                });
            }
            Ok(StepOutcome::NoData) => {
                log::debug!("No data this cycle, retrying");
                status.publish(SessionStatus::NoData);
                thread::sleep(session.settings.retry_delay);
            }
            Err(SessionError::CalibrationUnusable(reason)) => {
                log::error!("Stopping acquisition, calibration unusable: {}", reason);
                status.publish(SessionStatus::CalibrationUnusable(reason.clone()));
                error = Some(SessionError::CalibrationUnusable(reason));
                break;
            }
            Err(e) => {
                log::error!("Stopping acquisition: {}", e);
                status.publish(SessionStatus::Failed(e.to_string()));
                error = Some(e);
                break;
            }
        }
    }

    if let Err(e) = session.finish_sink() {
        log::error!("Could not finish sink: {}", e);
        error.get_or_insert(e);
    }
    if error.is_none() {
        status.publish(SessionStatus::Stopped);
    }
    log::info!("Acquisition session stopped after {} events", session.events);
    SessionExit { session, error }
}

/// Front end side of a running session.
pub struct SessionHandle<S> {
    cancel: CancellationToken,
    latest: LatestSlot<AcquiredFrame>,
    status: LatestSlot<SessionStatus>,
    model: ModelHandle,
    worker: JoinHandle<SessionExit<S>>,
}

impl<S> SessionHandle<S> {
    /// Newest completed frame, if any arrived since the session started.
    pub fn latest(&self) -> Option<AcquiredFrame> {
        self.latest.latest()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.latest().unwrap_or_default()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Swap the model used for the next acquisition cycle.
    pub fn reload_model(&self, model: CalibrationModel) {
        self.model.replace(model);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Request cancellation and wait for the worker to hand the session back.
    pub fn stop(self) -> Result<SessionExit<S>, SessionError> {
        self.cancel.cancel();
        self.worker.join().map_err(|_| SessionError::WorkerPanicked)
    }
}
