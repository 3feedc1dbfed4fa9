// Calibration table inspection example
//
// Validates a stored calibration table and prints its summary, the cells
// that failed to calibrate and a few per-cell entries.

use clap::Parser;
use dt5742_calib::{calibration_store, StoreError};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "inspect_calibration")]
#[command(version = "0.1")]
#[command(about = "Validate and summarize a DT5742 calibration table")]
struct Args {
    /// Calibration table written by calibration_sweep
    path: PathBuf,

    /// Print this many cells starting at --first
    #[arg(short, long, default_value_t = 8)]
    count: usize,

    /// First cell to print
    #[arg(short, long, default_value_t = 0)]
    first: usize,

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

    let model = match calibration_store::load(&args.path) {
        Ok(model) => model,
        Err(StoreError::Malformed(reason)) => {
            eprintln!("✗ {} is not a usable calibration: {}", args.path.display(), reason);
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };

    let summary = calibration_store::summarize(&model)?;
    println!("Calibration {}", args.path.display());
    println!("Valid cells: {} / {}", summary.valid_cells, model.cells().len());
    if let Some(slope) = summary.mean_slope {
        println!("Mean slope: {:.3}", slope);
    }
    if let Some(intercept) = summary.mean_intercept {
        println!("Mean intercept: {:.3}", intercept);
    }
    if let Some(quality) = summary.worst_fit_quality {
        println!("Worst fit quality: {:.6}", quality);
    }

    let invalid: Vec<usize> = model.invalid_cells().collect();
    if !invalid.is_empty() {
        println!("Invalid cells: {:?}", invalid);
    }

    println!("\n cell      slope   intercept   quality  valid");
    for (cell, calibration) in model
        .cells()
        .iter()
        .enumerate()
        .skip(args.first)
        .take(args.count)
    {
        println!(
            "{:5} {:10.4} {:11.4} {:9.6}  {}",
            cell, calibration.slope, calibration.intercept, calibration.fit_quality, calibration.valid
        );
    }

    Ok(())
}
