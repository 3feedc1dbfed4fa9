//! Persistence of calibration models and calibration curves.
//!
//! A model is written as a keyed table with one row per cell:
//!
//! | column        | type    |
//! |---------------|---------|
//! | `cell`        | string  |
//! | `slope`       | f32     |
//! | `intercept`   | f32     |
//! | `fit_quality` | f32     |
//! | `valid`       | bool    |
//!
//! The table is stored as Parquet, which keeps the `f32` values bit for bit.
//! Loading is strict: anything other than exactly the keys `"0"..="1023"`
//! with finite values is rejected.

use crate::aggregator::CellSeries;
use crate::calibration_model::{CalibrationModel, CellCalibration, ModelError};
use crate::raw_event::NUM_CELLS;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;

const CELL_COLUMN: &str = "cell";
const SLOPE_COLUMN: &str = "slope";
const INTERCEPT_COLUMN: &str = "intercept";
const QUALITY_COLUMN: &str = "fit_quality";
const VALID_COLUMN: &str = "valid";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MalformedCalibrationFile {
    #[error("Column '{0}' is missing")]
    MissingColumn(&'static str),

    #[error("Column '{column}' has type {found}, expected {expected}")]
    WrongColumnType {
        column: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("Column '{column}' has no value in row {row}")]
    NullValue { column: &'static str, row: usize },

    #[error("Key '{0}' is not a cell index between 0 and 1023")]
    InvalidKey(String),

    #[error("Cell {0} appears more than once")]
    DuplicateKey(usize),

    #[error("{count} cells are missing, first missing cell is {first}")]
    MissingKeys { count: usize, first: usize },

    #[error("Cell {cell} has a non-finite {field}")]
    NonFinite { cell: usize, field: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data frame error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Malformed calibration file: {0}")]
    Malformed(#[from] MalformedCalibrationFile),
}

/// Tabular form of a model, one row per cell.
pub fn model_to_frame(model: &CalibrationModel) -> PolarsResult<DataFrame> {
    let cells = model.cells();
    df!(
        CELL_COLUMN => (0..cells.len()).map(|c| c.to_string()).collect::<Vec<_>>(),
        SLOPE_COLUMN => cells.iter().map(|c| c.slope).collect::<Vec<f32>>(),
        INTERCEPT_COLUMN => cells.iter().map(|c| c.intercept).collect::<Vec<f32>>(),
        QUALITY_COLUMN => cells.iter().map(|c| c.fit_quality).collect::<Vec<f32>>(),
        VALID_COLUMN => cells.iter().map(|c| c.valid).collect::<Vec<bool>>(),
    )
}

pub fn save(model: &CalibrationModel, destination: &Path) -> Result<(), StoreError> {
    model.check_finite().map_err(malformed)?;
    let mut df = model_to_frame(model)?;
    let file = File::create(destination)?;
    ParquetWriter::new(file).finish(&mut df)?;
    log::info!(
        "Saved calibration of {} cells ({} valid) to {}",
        NUM_CELLS,
        model.valid_cells(),
        destination.display()
    );
    Ok(())
}

pub fn load(source: &Path) -> Result<CalibrationModel, StoreError> {
    let file = File::open(source)?;
    let df = ParquetReader::new(file).finish()?;
    let model = model_from_frame(&df)?;
    log::info!(
        "Loaded calibration from {} ({} valid cells)",
        source.display(),
        model.valid_cells()
    );
    Ok(model)
}

fn typed_column<'a>(
    df: &'a DataFrame,
    name: &'static str,
    expected: &DataType,
    expected_name: &'static str,
) -> Result<&'a Column, MalformedCalibrationFile> {
    let column = df
        .column(name)
        .map_err(|_| MalformedCalibrationFile::MissingColumn(name))?;
    if column.dtype() != expected {
        return Err(MalformedCalibrationFile::WrongColumnType {
            column: name,
            expected: expected_name,
            found: column.dtype().to_string(),
        });
    }
    Ok(column)
}

fn required<T>(value: Option<T>, column: &'static str, row: usize) -> Result<T, MalformedCalibrationFile> {
    value.ok_or(MalformedCalibrationFile::NullValue { column, row })
}

fn parse_key(key: &str) -> Result<usize, MalformedCalibrationFile> {
    // Plain decimal only: "+1" or "01" would alias another key.
    let canonical = !key.is_empty()
        && key.bytes().all(|b| b.is_ascii_digit())
        && (key == "0" || !key.starts_with('0'));
    match key.parse::<usize>() {
        Ok(cell) if canonical && cell < NUM_CELLS => Ok(cell),
        _ => Err(MalformedCalibrationFile::InvalidKey(key.to_string())),
    }
}

/// Validate a keyed table and rebuild the model from it.
pub fn model_from_frame(df: &DataFrame) -> Result<CalibrationModel, StoreError> {
    let keys = typed_column(df, CELL_COLUMN, &DataType::String, "string")?.str()?;
    let slopes = typed_column(df, SLOPE_COLUMN, &DataType::Float32, "f32")?.f32()?;
    let intercepts = typed_column(df, INTERCEPT_COLUMN, &DataType::Float32, "f32")?.f32()?;
    let qualities = typed_column(df, QUALITY_COLUMN, &DataType::Float32, "f32")?.f32()?;
    let valid = typed_column(df, VALID_COLUMN, &DataType::Boolean, "bool")?.bool()?;

    let mut cells: Vec<Option<CellCalibration>> = vec![None; NUM_CELLS];

    let rows = keys
        .into_iter()
        .zip(slopes)
        .zip(intercepts)
        .zip(qualities)
        .zip(valid)
        .enumerate();

    for (row, ((((key, slope), intercept), fit_quality), valid)) in rows {
        let cell = parse_key(required(key, CELL_COLUMN, row)?)?;
        let calibration = CellCalibration {
            slope: required(slope, SLOPE_COLUMN, row)?,
            intercept: required(intercept, INTERCEPT_COLUMN, row)?,
            fit_quality: required(fit_quality, QUALITY_COLUMN, row)?,
            valid: required(valid, VALID_COLUMN, row)?,
        };
        if cells[cell].replace(calibration).is_some() {
            return Err(MalformedCalibrationFile::DuplicateKey(cell).into());
        }
    }

    let missing: Vec<usize> = cells
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_none())
        .map(|(cell, _)| cell)
        .collect();
    if let Some(&first) = missing.first() {
        return Err(MalformedCalibrationFile::MissingKeys {
            count: missing.len(),
            first,
        }
        .into());
    }

    let cells = cells.into_iter().flatten().collect();
    CalibrationModel::new(cells).map_err(malformed)
}

fn malformed(error: ModelError) -> StoreError {
    let malformed = match error {
        ModelError::NonFinite { cell, field } => MalformedCalibrationFile::NonFinite { cell, field },
        ModelError::WrongCellCount(count) => MalformedCalibrationFile::MissingKeys {
            count: NUM_CELLS.saturating_sub(count),
            first: count,
        },
    };
    StoreError::from(malformed)
}

/// Aggregate figures of a model, for reports.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSummary {
    pub valid_cells: usize,
    pub mean_slope: Option<f64>,
    pub mean_intercept: Option<f64>,
    pub worst_fit_quality: Option<f64>,
}

pub fn summarize(model: &CalibrationModel) -> PolarsResult<CalibrationSummary> {
    let stats = model_to_frame(model)?
        .lazy()
        .filter(col(VALID_COLUMN).and(col(SLOPE_COLUMN).neq(lit(0.0f32))))
        .select([
            col(SLOPE_COLUMN).cast(DataType::Float64).mean().alias("mean_slope"),
            col(INTERCEPT_COLUMN).cast(DataType::Float64).mean().alias("mean_intercept"),
            col(QUALITY_COLUMN).cast(DataType::Float64).min().alias("worst_fit_quality"),
        ])
        .collect()?;

    let first = |name: &str| -> PolarsResult<Option<f64>> { Ok(stats.column(name)?.f64()?.get(0)) };

    Ok(CalibrationSummary {
        valid_cells: model.valid_cells(),
        mean_slope: first("mean_slope")?,
        mean_intercept: first("mean_intercept")?,
        worst_fit_quality: first("worst_fit_quality")?,
    })
}

/// Long table of the averaged calibration curves, one row per `(cell, voltage)`.
pub fn curves_to_frame(table: &[CellSeries]) -> PolarsResult<DataFrame> {
    let rows = table.iter().map(|s| s.points.len()).sum();
    let mut cells = Vec::with_capacity(rows);
    let mut voltages = Vec::with_capacity(rows);
    let mut amplitudes = Vec::with_capacity(rows);
    let mut samples = Vec::with_capacity(rows);

    for series in table {
        for point in &series.points {
            cells.push(series.cell as u32);
            voltages.push(point.voltage);
            amplitudes.push(point.mean_amplitude);
            samples.push(point.samples);
        }
    }

    df!(
        CELL_COLUMN => cells,
        "voltage" => voltages,
        "mean_amplitude" => amplitudes,
        "samples" => samples,
    )
}

/// Keep the fit input next to the model for offline inspection.
pub fn save_curves(table: &[CellSeries], destination: &Path) -> Result<(), StoreError> {
    let mut df = curves_to_frame(table)?;
    let file = File::create(destination)?;
    ParquetWriter::new(file).finish(&mut df)?;
    log::debug!("Saved {} curve points to {}", df.height(), destination.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::SeriesPoint;

    fn sample_model() -> CalibrationModel {
        let cells = (0..NUM_CELLS)
            .map(|cell| {
                if cell % 97 == 0 {
                    CellCalibration::INVALID
                } else {
                    // Values without a short decimal form, to catch lossy encodings.
                    CellCalibration::new(
                        50.0 + (cell as f32) / 3.0,
                        2048.0 - (cell as f32) / 7.0,
                        0.999_9 - (cell as f32) * 1e-7,
                    )
                }
            })
            .collect();
        CalibrationModel::new(cells).unwrap()
    }

    fn write_frame(mut df: DataFrame, path: &Path) {
        let file = File::create(path).unwrap();
        ParquetWriter::new(file).finish(&mut df).unwrap();
    }

    fn malformed(result: Result<CalibrationModel, StoreError>) -> MalformedCalibrationFile {
        match result {
            Err(StoreError::Malformed(m)) => m,
            other => panic!("Expected a malformed file error, got {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.parquet");
        let model = sample_model();

        save(&model, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded, model);
        for (a, b) in loaded.cells().iter().zip(model.cells()) {
            assert_eq!(a.slope.to_bits(), b.slope.to_bits());
            assert_eq!(a.intercept.to_bits(), b.intercept.to_bits());
            assert_eq!(a.valid, b.valid);
        }
    }

    #[test]
    fn test_non_finite_model_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nan.parquet");
        let mut cells = vec![CellCalibration::new(1.0, 0.0, 1.0); NUM_CELLS];
        cells[5].slope = f32::NAN;

        let result = save(&CalibrationModel::unchecked(cells), &path);
        assert!(matches!(
            result,
            Err(StoreError::Malformed(MalformedCalibrationFile::NonFinite { cell: 5, field: "slope" }))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_row_order_does_not_matter() {
        let model = sample_model();
        let df = model_to_frame(&model).unwrap().reverse();
        assert_eq!(model_from_frame(&df).unwrap(), model);
    }

    #[test]
    fn test_missing_cell_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.parquet");
        let df = model_to_frame(&sample_model()).unwrap().slice(0, 1000);
        write_frame(df, &path);

        assert_eq!(
            malformed(load(&path)),
            MalformedCalibrationFile::MissingKeys { count: 24, first: 1000 }
        );
    }

    #[test]
    fn test_unknown_and_duplicate_keys_are_rejected() {
        let mut df = model_to_frame(&sample_model()).unwrap();
        let mut keys: Vec<String> = (0..NUM_CELLS).map(|c| c.to_string()).collect();
        keys[5] = "1024".to_string();
        df.with_column(Column::new(CELL_COLUMN.into(), keys.clone())).unwrap();
        assert_eq!(
            malformed(model_from_frame(&df)),
            MalformedCalibrationFile::InvalidKey("1024".to_string())
        );

        keys[5] = "6".to_string();
        df.with_column(Column::new(CELL_COLUMN.into(), keys.clone())).unwrap();
        assert_eq!(malformed(model_from_frame(&df)), MalformedCalibrationFile::DuplicateKey(6));

        keys[5] = "05".to_string();
        df.with_column(Column::new(CELL_COLUMN.into(), keys)).unwrap();
        assert_eq!(
            malformed(model_from_frame(&df)),
            MalformedCalibrationFile::InvalidKey("05".to_string())
        );
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        let mut df = model_to_frame(&sample_model()).unwrap();
        let mut slopes: Vec<f32> = sample_model().cells().iter().map(|c| c.slope).collect();
        slopes[42] = f32::NAN;
        df.with_column(Column::new(SLOPE_COLUMN.into(), slopes)).unwrap();

        assert_eq!(
            malformed(model_from_frame(&df)),
            MalformedCalibrationFile::NonFinite { cell: 42, field: "slope" }
        );
    }

    #[test]
    fn test_wrong_schema_is_rejected() {
        let df = model_to_frame(&sample_model()).unwrap().drop(VALID_COLUMN).unwrap();
        assert_eq!(
            malformed(model_from_frame(&df)),
            MalformedCalibrationFile::MissingColumn(VALID_COLUMN)
        );

        let mut df = model_to_frame(&sample_model()).unwrap();
        let wide: Vec<f64> = vec![1.0; NUM_CELLS];
        df.with_column(Column::new(SLOPE_COLUMN.into(), wide)).unwrap();
        assert!(matches!(
            malformed(model_from_frame(&df)),
            MalformedCalibrationFile::WrongColumnType { column: SLOPE_COLUMN, .. }
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load(&dir.path().join("nope.parquet")), Err(StoreError::Io(_))));
    }

    #[test]
    fn test_summary_ignores_invalid_cells() {
        let mut cells = vec![CellCalibration::new(50.0, 2000.0, 0.99); NUM_CELLS];
        cells[0] = CellCalibration::new(60.0, 2100.0, 0.5);
        cells[1] = CellCalibration::INVALID;
        let model = CalibrationModel::new(cells).unwrap();

        let summary = summarize(&model).unwrap();
        assert_eq!(summary.valid_cells, NUM_CELLS - 1);
        let expected_slope = (60.0 + 50.0 * 1022.0) / 1023.0;
        assert!((summary.mean_slope.unwrap() - expected_slope).abs() < 1e-9);
        assert!((summary.worst_fit_quality.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_curves_are_saved_in_long_form() {
        let table: Vec<CellSeries> = (0..3)
            .map(|cell| CellSeries {
                cell,
                points: vec![
                    SeriesPoint { voltage: -0.1, mean_amplitude: 1.0, samples: 4 },
                    SeriesPoint { voltage: 0.1, mean_amplitude: 2.0, samples: 4 },
                ],
            })
            .collect();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curves.parquet");
        save_curves(&table, &path).unwrap();

        let df = ParquetReader::new(File::open(&path).unwrap()).finish().unwrap();
        assert_eq!(df.height(), 6);
        assert_eq!(df.get_column_names().len(), 4);
    }
}
