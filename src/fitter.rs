use crate::aggregator::CellSeries;
use crate::calibration_model::{CalibrationModel, CellCalibration, ModelError};
use crate::raw_event::NUM_CELLS;

/// Least-squares line through a cell's calibration curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Pearson correlation coefficient between voltage and amplitude.
    pub correlation: f64,
    /// Standard error of the slope estimate.
    pub slope_std_err: f64,
    pub points: usize,
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq)]
pub enum FitError {
    #[error("Need at least 2 points for a linear fit, got {0}")]
    InsufficientPoints(usize),

    #[error("All voltages are identical, slope is undefined")]
    InsufficientVariance,

    #[error("Fitted slope {0} cannot be inverted")]
    DegenerateSlope(f64),
}

/// Ordinary least squares fit of `amplitude = slope * voltage + intercept`.
///
/// Uses centered sums so that large ADC offsets do not cancel out the
/// variance terms.
pub fn fit_linear(series: &[(f64, f64)]) -> Result<LinearFit, FitError> {
    let n = series.len();
    if n < 2 {
        return Err(FitError::InsufficientPoints(n));
    }

    let count = n as f64;
    let mean_v = series.iter().map(|&(v, _)| v).sum::<f64>() / count;
    let mean_a = series.iter().map(|&(_, a)| a).sum::<f64>() / count;

    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for &(v, a) in series {
        let dv = v - mean_v;
        let da = a - mean_a;
        sxx += dv * dv;
        sxy += dv * da;
        syy += da * da;
    }

    if sxx <= 0.0 || !sxx.is_finite() {
        return Err(FitError::InsufficientVariance);
    }

    let slope = sxy / sxx;
    let intercept = mean_a - slope * mean_v;

    let correlation = if syy > 0.0 {
        (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    let slope_std_err = if n > 2 {
        ((1.0 - correlation * correlation).max(0.0) * syy / sxx / (count - 2.0)).sqrt()
    } else {
        0.0
    };

    Ok(LinearFit {
        slope,
        intercept,
        correlation,
        slope_std_err,
        points: n,
    })
}

/// Fit one cell and narrow the result to the stored precision.
pub fn fit_cell(series: &CellSeries) -> Result<CellCalibration, FitError> {
    let fit = fit_linear(&series.as_pairs())?;

    let slope = fit.slope as f32;
    if slope == 0.0 || !slope.is_finite() {
        return Err(FitError::DegenerateSlope(fit.slope));
    }
    let intercept = fit.intercept as f32;
    if !intercept.is_finite() {
        return Err(FitError::DegenerateSlope(fit.slope));
    }

    Ok(CellCalibration::new(slope, intercept, fit.correlation as f32))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellFailure {
    pub cell: usize,
    pub error: FitError,
}

/// Result of fitting a whole sweep.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub model: CalibrationModel,
    /// Cells stored as invalid, with the reason.
    pub failures: Vec<CellFailure>,
}

/// Fit every cell independently.
///
/// A cell whose fit fails is stored as invalid and listed in
/// [`FitOutcome::failures`]; it never affects its neighbours.
pub fn fit_model(table: &[CellSeries]) -> Result<FitOutcome, ModelError> {
    if table.len() != NUM_CELLS {
        return Err(ModelError::WrongCellCount(table.len()));
    }

    let mut failures = Vec::new();
    let cells = table
        .iter()
        .enumerate()
        .map(|(cell, series)| match fit_cell(series) {
            Ok(calibration) => calibration,
            Err(error) => {
                log::warn!("Calibration of cell {} failed: {}", cell, error);
                failures.push(CellFailure { cell, error });
                CellCalibration::INVALID
            }
        })
        .collect();

    let model = CalibrationModel::new(cells)?;
    log::info!(
        "Fitted {} cells, {} invalid",
        model.valid_cells(),
        failures.len()
    );
    Ok(FitOutcome { model, failures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::SeriesPoint;

    fn series(cell: usize, pairs: &[(f64, f64)]) -> CellSeries {
        CellSeries {
            cell,
            points: pairs
                .iter()
                .map(|&(voltage, mean_amplitude)| SeriesPoint {
                    voltage,
                    mean_amplitude,
                    samples: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn test_recovers_exact_line() {
        let pairs: Vec<(f64, f64)> = [-0.4, -0.2, 0.0, 0.1, 0.25, 0.4]
            .iter()
            .map(|&v| (v, 3.0 * v + 100.0))
            .collect();

        let fit = fit_linear(&pairs).unwrap();
        assert!((fit.slope - 3.0).abs() < 1e-9);
        assert!((fit.intercept - 100.0).abs() < 1e-9);
        assert!((fit.correlation - 1.0).abs() < 1e-9);
        assert!(fit.slope_std_err < 1e-6);
        assert_eq!(fit.points, 6);
    }

    #[test]
    fn test_noisy_line_has_lower_correlation() {
        let pairs = [(0.0, 1.0), (1.0, 2.5), (2.0, 2.9), (3.0, 4.6)];
        let fit = fit_linear(&pairs).unwrap();
        assert!(fit.correlation < 1.0 && fit.correlation > 0.9);
        assert!(fit.slope_std_err > 0.0);
    }

    #[test]
    fn test_identical_voltages_fail_with_insufficient_variance() {
        let pairs = [(0.15, 10.0), (0.15, 11.0), (0.15, 12.0)];
        assert_eq!(fit_linear(&pairs), Err(FitError::InsufficientVariance));
    }

    #[test]
    fn test_single_point_is_insufficient() {
        assert_eq!(fit_linear(&[(0.1, 1.0)]), Err(FitError::InsufficientPoints(1)));
        assert_eq!(fit_linear(&[]), Err(FitError::InsufficientPoints(0)));
    }

    #[test]
    fn test_flat_response_is_degenerate() {
        let flat = series(0, &[(0.0, 5.0), (0.1, 5.0), (0.2, 5.0)]);
        assert!(matches!(fit_cell(&flat), Err(FitError::DegenerateSlope(_))));
    }

    #[test]
    fn test_zero_variance_cell_is_isolated() {
        let good: Vec<(f64, f64)> = [-0.3, 0.0, 0.3].iter().map(|&v| (v, 50.0 * v + 2048.0)).collect();
        let mut table: Vec<CellSeries> = (0..NUM_CELLS).map(|cell| series(cell, &good)).collect();
        table[7] = series(7, &[(0.1, 2000.0), (0.1, 2010.0)]);

        let outcome = fit_model(&table).unwrap();
        assert_eq!(
            outcome.failures,
            vec![CellFailure { cell: 7, error: FitError::InsufficientVariance }]
        );
        assert!(!outcome.model.cell(7).unwrap().valid);
        assert_eq!(outcome.model.valid_cells(), NUM_CELLS - 1);

        let neighbour = outcome.model.cell(8).unwrap();
        assert!(neighbour.valid);
        assert!((neighbour.slope - 50.0).abs() < 1e-3);
        assert!((neighbour.intercept - 2048.0).abs() < 1e-3);
    }

    #[test]
    fn test_table_must_cover_every_cell() {
        assert!(fit_model(&[]).is_err());
    }
}
