// Live acquisition example
//
// Loads a calibration table, runs acquisition on a worker thread against the
// simulated digitizer and prints the newest corrected, low-pass filtered
// frame a few times per second. Waveforms can be written to a text file or a
// Parquet table.

use clap::Parser;
use dt5742_calib::calibration_store;
use dt5742_calib::session::{AcquisitionSession, ModelHandle, SessionSettings, SessionStatus};
use dt5742_calib::simulation::{SimulatedDigitizer, SimulationSettings};
use dt5742_calib::sinks::{ColumnarSink, GatedSink, TextSink, WaveformSink};
use dt5742_calib::waveform_filters::{BaselineEstimator, LowPassFilter, PeakToPeakFilter};
use dt5742_calib::{Pulser, RunConfig};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "live_acquisition")]
#[command(version = "0.1")]
#[command(about = "Acquire, correct and display DT5742 waveforms")]
struct Args {
    /// Run configuration (TOML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Calibration table, defaults to the one named by the configuration
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// How long to acquire, in seconds
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// DC level of the simulated pulser, in volts
    #[arg(long, default_value_t = 0.0)]
    level: f64,

    /// Height of the simulated pulse, in volts
    #[arg(long, default_value_t = 0.2)]
    pulse: f64,

    /// Append waveforms to a timestamped text file in this directory
    #[arg(long)]
    text_dir: Option<PathBuf>,

    /// Write waveforms to this Parquet file when stopping
    #[arg(long, conflicts_with = "text_dir")]
    parquet: Option<PathBuf>,

    /// Only store waveforms whose peak-to-peak swing reaches this value
    #[arg(long)]
    min_swing: Option<f64>,

    /// Show the corrected samples without the 200 MHz low-pass filter
    #[arg(long)]
    unfiltered: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn gated(sink: Box<dyn WaveformSink + Send>, min_swing: Option<f64>) -> Box<dyn WaveformSink + Send> {
    match min_swing {
        Some(threshold) => Box::new(GatedSink::new(sink, PeakToPeakFilter::new(threshold))),
        None => sink,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let config = match &args.config {
        Some(path) => RunConfig::load_from(path)?,
        None => RunConfig::default(),
    };
    let model_path = args.model.clone().unwrap_or_else(|| config.model_path());
    let model = calibration_store::load(&model_path)?;
    println!("✓ Loaded calibration from {} ({} valid cells)", model_path.display(), model.valid_cells());

    let channel = config.primary_channel()?;
    let mut settings = SessionSettings::new(channel, config.acquisition_request()?);
    settings.unit = config.output_unit();
    settings.policy = config.invalid_cell_policy();
    settings.retry_delay = config.retry_delay();

    let simulation = SimulationSettings {
        pulse_volts: Some(args.pulse),
        empty_probability: 0.05,
        ..Default::default()
    };
    let digitizer = SimulatedDigitizer::new(simulation, 5742);
    let mut pulser = digitizer.pulser();
    pulser.configure_dc_output()?;
    pulser.set_dc_offset(args.level)?;

    let mut session = AcquisitionSession::new(digitizer, ModelHandle::new(model), settings);
    if let Some(dir) = &args.text_dir {
        let sink = TextSink::timestamped(dir, config.sampling()?)?;
        println!("✓ Writing waveforms to {}", sink.path().display());
        session = session.with_sink(gated(Box::new(sink), args.min_swing));
    } else if let Some(path) = &args.parquet {
        session = session.with_sink(gated(Box::new(ColumnarSink::new(path)), args.min_swing));
    }

    println!("Acquiring on {} for {} s\n", channel, args.duration);
    let handle = session.spawn();
    let baseline = BaselineEstimator::default();
    let lowpass = if args.unfiltered {
        None
    } else {
        Some(LowPassFilter::for_sampling(config.sampling()?)?)
    };
    let start = Instant::now();

    while start.elapsed() < Duration::from_secs(args.duration) {
        std::thread::sleep(Duration::from_millis(250));

        match handle.status() {
            SessionStatus::CalibrationUnusable(reason) => {
                eprintln!("\nCalibration unusable, recalibrate: {}", reason);
                break;
            }
            SessionStatus::Failed(reason) => {
                eprintln!("\nAcquisition failed: {}", reason);
                break;
            }
            SessionStatus::NoData => {
                print!("\r(no data this cycle)                                   ");
            }
            _ => {}
        }

        if let Some(frame) = handle.latest() {
            let mut samples = frame.waveform.capture_order();
            let level = baseline.subtract(&mut samples).unwrap_or(f64::NAN);
            if let Some(lowpass) = &lowpass {
                samples = lowpass.filter(&samples);
            }
            let peak = samples
                .iter()
                .copied()
                .filter(|s| s.is_finite())
                .fold(f64::INFINITY, f64::min);
            print!(
                "\r[event {:6}] first cell {:4} | baseline {:8.4} {} | peak {:8.4} | {} invalid",
                frame.meta.event_number,
                frame.meta.first_cell,
                level,
                frame.waveform.unit.label(),
                peak,
                frame.waveform.invalid_samples
            );
        }
        io::stdout().flush()?;
    }

    let exit = handle.stop()?;
    println!("\n\n✓ Stopped after {} events", exit.session.events());
    if let Some(error) = exit.error {
        eprintln!("Worker stopped with: {}", error);
    }
    Ok(())
}
