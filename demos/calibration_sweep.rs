// Calibration sweep example
//
// Runs a full DC sweep against the simulated digitizer, fits every cell and
// writes the calibration table. Sweep and output settings come from a TOML
// run configuration.

use clap::Parser;
use dt5742_calib::calibration_store;
use dt5742_calib::simulation::{SimulatedDigitizer, SimulationSettings};
use dt5742_calib::{fit_model, CalibrationAggregator, Pulser, RunConfig, SweepController};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "calibration_sweep")]
#[command(version = "0.1")]
#[command(about = "Sweep the pulser, fit every DRS4 cell and save the calibration")]
struct Args {
    /// Run configuration (TOML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the output directory of the configuration
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Override the number of events per voltage step
    #[arg(short, long)]
    events: Option<usize>,

    /// Seed of the simulated digitizer's cell response
    #[arg(long, default_value_t = 5742)]
    seed: u64,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
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

    let mut config = match &args.config {
        Some(path) => RunConfig::load_from(path)?,
        None => RunConfig::default(),
    };
    if let Some(output) = args.output {
        config.output.directory = output;
    }
    if let Some(events) = args.events {
        config.sweep.events_per_step = events;
    }
    config.validate()?;

    let channel = config.primary_channel()?;
    let plan = config.sweep_plan();
    let setpoints = plan.setpoints()?;

    println!("DT5742 Calibration Sweep");
    println!("========================");
    println!("Channel: {}", channel);
    println!(
        "Sweep: {} V to {} V, {} steps, {} events each",
        setpoints[0],
        setpoints[setpoints.len() - 1],
        setpoints.len(),
        plan.events_per_step
    );
    println!("Settle time: {:?}\n", plan.settle_time);

    let mut digitizer = SimulatedDigitizer::new(SimulationSettings::default(), args.seed);
    let mut pulser = digitizer.pulser();
    pulser.configure_dc_output()?;

    let mut aggregator = CalibrationAggregator::new(channel);
    let controller = SweepController::new(plan, config.acquisition_request()?);
    let report = controller.run(&mut pulser, &mut digitizer, &mut aggregator, None)?;
    println!(
        "✓ Sweep done: {} steps, {} skipped, {} events",
        report.completed.len(),
        report.skipped.len(),
        report.events
    );

    let curves = aggregator.finish();
    std::fs::create_dir_all(&config.output.directory)?;
    if let Some(path) = config.curves_path() {
        calibration_store::save_curves(&curves, &path)?;
        println!("✓ Curves saved to {}", path.display());
    }

    let outcome = fit_model(&curves)?;
    for failure in outcome.failures.iter().take(10) {
        println!("  cell {:4}: {}", failure.cell, failure.error);
    }

    let model_path = config.model_path();
    calibration_store::save(&outcome.model, &model_path)?;
    println!("✓ Calibration saved to {}", model_path.display());

    let summary = calibration_store::summarize(&outcome.model)?;
    println!("\nValid cells:       {}", summary.valid_cells);
    if let (Some(slope), Some(intercept), Some(quality)) = (
        summary.mean_slope,
        summary.mean_intercept,
        summary.worst_fit_quality,
    ) {
        println!("Mean slope:        {:.2} ADC/V", slope);
        println!("Mean intercept:    {:.2} ADC", intercept);
        println!("Worst fit quality: {:.6}", quality);
    }

    Ok(())
}
