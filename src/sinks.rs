//! Destinations for calibrated waveforms.
//!
//! A sink receives cell-indexed waveforms together with their metadata and
//! owns its serialization; nothing upstream depends on the output format.
use crate::corrector::CalibratedWaveform;
use crate::raw_event::ChannelId;
use crate::waveform_filters::PeakToPeakFilter;
use crate::waveform_source::SamplingFrequency;
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Bookkeeping that travels with every waveform handed to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformMeta {
    pub event_number: u64,
    pub channel: ChannelId,
    pub trigger_tag: u32,
    pub first_cell: usize,
    pub timestamp: DateTime<Utc>,
}

impl WaveformMeta {
    pub fn for_waveform(event_number: u64, waveform: &CalibratedWaveform) -> Self {
        Self {
            event_number,
            channel: waveform.channel,
            trigger_tag: waveform.trigger_tag,
            first_cell: waveform.first_cell,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data frame error: {0}")]
    Polars(#[from] PolarsError),
}

pub trait WaveformSink {
    fn consume(&mut self, waveform: &CalibratedWaveform, meta: &WaveformMeta) -> Result<(), SinkError>;

    /// Flush whatever is buffered. Called once when the stream ends.
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: WaveformSink + ?Sized> WaveformSink for Box<S> {
    fn consume(&mut self, waveform: &CalibratedWaveform, meta: &WaveformMeta) -> Result<(), SinkError> {
        (**self).consume(waveform, meta)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        (**self).finish()
    }
}

fn waveform_frame(waveform: &CalibratedWaveform, sample_period: f64) -> PolarsResult<DataFrame> {
    let cells: Vec<u32> = (0..waveform.samples.len() as u32).collect();
    let times: Vec<f64> = cells.iter().map(|&c| f64::from(c) * sample_period).collect();
    let amplitude = format!("Amplitude ({})", waveform.unit.label());

    DataFrame::new(vec![
        Column::new("Cell".into(), cells),
        Column::new("Time (s)".into(), times),
        Column::new(amplitude.into(), waveform.samples.clone()),
    ])
}

/// Appends one tab separated block per waveform to a text file.
///
/// ```text
/// # Event 12 CH1 trigger 3456 2026-01-01T00:00:00+00:00
/// Cell	Time (s)	Amplitude (V)
/// 0	0.0	0.0012
/// ...
/// ```
pub struct TextSink {
    path: PathBuf,
    writer: BufWriter<File>,
    sample_period: f64,
}

impl TextSink {
    pub fn create(path: impl Into<PathBuf>, sampling: SamplingFrequency) -> Result<Self, SinkError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!("Writing waveforms to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            sample_period: sampling.sample_period_secs(),
        })
    }

    /// A new file named `waveforms_<YYYYmmddHHMMSS>.txt` inside `dir`.
    pub fn timestamped(dir: &Path, sampling: SamplingFrequency) -> Result<Self, SinkError> {
        fs::create_dir_all(dir)?;
        let file_name = format!("waveforms_{}.txt", Utc::now().format("%Y%m%d%H%M%S"));
        Self::create(dir.join(file_name), sampling)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WaveformSink for TextSink {
    fn consume(&mut self, waveform: &CalibratedWaveform, meta: &WaveformMeta) -> Result<(), SinkError> {
        writeln!(
            self.writer,
            "# Event {} {} trigger {} {}",
            meta.event_number,
            meta.channel,
            meta.trigger_tag,
            meta.timestamp.to_rfc3339()
        )?;
        let mut df = waveform_frame(waveform, self.sample_period)?;
        CsvWriter::new(&mut self.writer)
            .include_header(true)
            .with_separator(b'\t')
            .finish(&mut df)?;
        writeln!(self.writer)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ColumnarRows {
    event: Vec<u64>,
    channel: Vec<u32>,
    trigger_tag: Vec<u32>,
    first_cell: Vec<u32>,
    timestamp_us: Vec<i64>,
    cell: Vec<u32>,
    amplitude: Vec<f64>,
}

/// Buffers every sample as a row and writes a single Parquet file on finish.
pub struct ColumnarSink {
    path: PathBuf,
    rows: ColumnarRows,
    waveforms: usize,
}

impl ColumnarSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rows: ColumnarRows::default(),
            waveforms: 0,
        }
    }

    pub fn buffered_waveforms(&self) -> usize {
        self.waveforms
    }
}

impl WaveformSink for ColumnarSink {
    fn consume(&mut self, waveform: &CalibratedWaveform, meta: &WaveformMeta) -> Result<(), SinkError> {
        let rows = &mut self.rows;
        let timestamp_us = meta.timestamp.timestamp_micros();
        for (cell, &amplitude) in waveform.samples.iter().enumerate() {
            rows.event.push(meta.event_number);
            rows.channel.push(u32::from(meta.channel.index()));
            rows.trigger_tag.push(meta.trigger_tag);
            rows.first_cell.push(meta.first_cell as u32);
            rows.timestamp_us.push(timestamp_us);
            rows.cell.push(cell as u32);
            rows.amplitude.push(amplitude);
        }
        self.waveforms += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if self.waveforms == 0 {
            log::debug!("Nothing buffered, leaving {} untouched", self.path.display());
            return Ok(());
        }
        let rows = std::mem::take(&mut self.rows);
        let mut df = df!(
            "event" => rows.event,
            "channel" => rows.channel,
            "trigger_tag" => rows.trigger_tag,
            "first_cell" => rows.first_cell,
            "timestamp_us" => rows.timestamp_us,
            "cell" => rows.cell,
            "amplitude" => rows.amplitude,
        )?;
        let file = File::create(&self.path)?;
        ParquetWriter::new(file).finish(&mut df)?;
        log::info!(
            "Wrote {} waveforms ({} rows) to {}",
            self.waveforms,
            df.height(),
            self.path.display()
        );
        self.waveforms = 0;
        Ok(())
    }
}

/// Drops waveforms that fail a peak-to-peak gate before they reach `inner`.
pub struct GatedSink<S> {
    inner: S,
    filter: PeakToPeakFilter,
    rejected: usize,
}

impl<S: WaveformSink> GatedSink<S> {
    pub fn new(inner: S, filter: PeakToPeakFilter) -> Self {
        Self {
            inner,
            filter,
            rejected: 0,
        }
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: WaveformSink> WaveformSink for GatedSink<S> {
    fn consume(&mut self, waveform: &CalibratedWaveform, meta: &WaveformMeta) -> Result<(), SinkError> {
        if !self.filter.accepts(&waveform.samples) {
            self.rejected += 1;
            log::trace!("Event {} below peak-to-peak threshold", meta.event_number);
            return Ok(());
        }
        self.inner.consume(waveform, meta)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrector::OutputUnit;
    use crate::raw_event::NUM_CELLS;

    fn waveform(level: f64, pulse: bool) -> CalibratedWaveform {
        let mut samples = vec![level; NUM_CELLS];
        if pulse {
            samples[500] = level - 0.2;
        }
        CalibratedWaveform {
            channel: ChannelId::new(1).unwrap(),
            trigger_tag: 42,
            first_cell: 17,
            unit: OutputUnit::Normalized,
            samples,
            invalid_samples: 0,
        }
    }

    /// Collects event numbers only.
    #[derive(Default)]
    struct Recording(Vec<u64>, bool);

    impl WaveformSink for Recording {
        fn consume(&mut self, _: &CalibratedWaveform, meta: &WaveformMeta) -> Result<(), SinkError> {
            self.0.push(meta.event_number);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), SinkError> {
            self.1 = true;
            Ok(())
        }
    }

    #[test]
    fn test_text_sink_appends_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waves.txt");
        let mut sink = TextSink::create(&path, SamplingFrequency::MHz1000).unwrap();

        for event in 0..2 {
            let w = waveform(0.25, false);
            sink.consume(&w, &WaveformMeta::for_waveform(event, &w)).unwrap();
        }
        sink.finish().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# Event 0 CH1 trigger 42 "));
        assert_eq!(lines[1], "Cell\tTime (s)\tAmplitude (V)");
        assert!(lines[2].starts_with("0\t0"));
        assert!(lines[2].ends_with("\t0.25"));
        assert!(text.contains("# Event 1 CH1"));
        assert_eq!(text.matches("# Event").count(), 2);
    }

    #[test]
    fn test_timestamped_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TextSink::timestamped(&dir.path().join("run"), SamplingFrequency::default()).unwrap();
        let name = sink.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("waveforms_") && name.ends_with(".txt"));
        assert_eq!(name.len(), "waveforms_20260101000000.txt".len());
        assert!(sink.path().exists());
    }

    #[test]
    fn test_columnar_sink_writes_parquet_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waves.parquet");
        let mut sink = ColumnarSink::new(&path);

        for event in 0..3 {
            let w = waveform(event as f64, false);
            sink.consume(&w, &WaveformMeta::for_waveform(event, &w)).unwrap();
        }
        assert_eq!(sink.buffered_waveforms(), 3);
        assert!(!path.exists());
        sink.finish().unwrap();

        let df = ParquetReader::new(File::open(&path).unwrap()).finish().unwrap();
        assert_eq!(df.height(), 3 * NUM_CELLS);
        let amplitude = df.column("amplitude").unwrap().f64().unwrap();
        assert_eq!(amplitude.get(2 * NUM_CELLS), Some(2.0));
        let first_cell = df.column("first_cell").unwrap().u32().unwrap();
        assert_eq!(first_cell.get(0), Some(17));
    }

    #[test]
    fn test_columnar_sink_finish_twice_keeps_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waves.parquet");
        let mut sink = ColumnarSink::new(&path);

        sink.finish().unwrap();
        assert!(!path.exists());

        let w = waveform(1.0, false);
        sink.consume(&w, &WaveformMeta::for_waveform(0, &w)).unwrap();
        sink.finish().unwrap();
        sink.finish().unwrap();

        let df = ParquetReader::new(File::open(&path).unwrap()).finish().unwrap();
        assert_eq!(df.height(), NUM_CELLS);
    }

    #[test]
    fn test_gate_filters_before_inner_sink() {
        let mut sink = GatedSink::new(Recording::default(), PeakToPeakFilter::new(0.1));
        for (event, pulse) in [(0, true), (1, false), (2, true)] {
            let w = waveform(0.0, pulse);
            sink.consume(&w, &WaveformMeta::for_waveform(event, &w)).unwrap();
        }
        sink.finish().unwrap();

        assert_eq!(sink.rejected(), 1);
        let inner = sink.into_inner();
        assert_eq!(inner.0, vec![0, 2]);
        assert!(inner.1);
    }
}
