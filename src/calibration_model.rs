use crate::raw_event::NUM_CELLS;

/// Linear response of one capacitor cell: `raw = slope * volts + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellCalibration {
    pub slope: f32,
    pub intercept: f32,
    /// Pearson correlation of the calibration fit.
    pub fit_quality: f32,
    pub valid: bool,
}

impl CellCalibration {
    /// Placeholder stored for cells whose fit failed.
    pub const INVALID: Self = Self {
        slope: 0.0,
        intercept: 0.0,
        fit_quality: 0.0,
        valid: false,
    };

    pub fn new(slope: f32, intercept: f32, fit_quality: f32) -> Self {
        Self {
            slope,
            intercept,
            fit_quality,
            valid: true,
        }
    }

    /// Whether the entry can be inverted without dividing by zero.
    pub fn is_usable(&self) -> bool {
        self.valid && self.slope != 0.0 && self.slope.is_finite() && self.intercept.is_finite()
    }

    /// Applied voltage that produced `raw`, or `None` when the cell is unusable.
    pub fn invert(&self, raw: f64) -> Option<f64> {
        if !self.is_usable() {
            return None;
        }
        Some((raw - f64::from(self.intercept)) / f64::from(self.slope))
    }

    fn first_non_finite_field(&self) -> Option<&'static str> {
        if !self.slope.is_finite() {
            Some("slope")
        } else if !self.intercept.is_finite() {
            Some("intercept")
        } else if !self.fit_quality.is_finite() {
            Some("fit_quality")
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Calibration model needs exactly 1024 cells, got {0}")]
    WrongCellCount(usize),

    #[error("Cell {cell} has a non-finite {field}")]
    NonFinite { cell: usize, field: &'static str },
}

/// Per-cell calibration of one channel, covering the whole capacitor array.
///
/// Built once from a sweep and never modified; a newer calibration run
/// replaces the model as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationModel {
    cells: Vec<CellCalibration>,
}

impl CalibrationModel {
    pub fn new(cells: Vec<CellCalibration>) -> Result<Self, ModelError> {
        if cells.len() != NUM_CELLS {
            return Err(ModelError::WrongCellCount(cells.len()));
        }
        let model = Self { cells };
        model.check_finite()?;
        Ok(model)
    }

    /// Model where every cell shares the same response.
    pub fn uniform(calibration: CellCalibration) -> Result<Self, ModelError> {
        Self::new(vec![calibration; NUM_CELLS])
    }

    /// Skips validation, so code that guards against bad models can be tested.
    #[cfg(test)]
    pub(crate) fn unchecked(cells: Vec<CellCalibration>) -> Self {
        Self { cells }
    }

    /// First cell holding a NaN or infinite value, if any.
    pub fn check_finite(&self) -> Result<(), ModelError> {
        for (cell, calibration) in self.cells.iter().enumerate() {
            if let Some(field) = calibration.first_non_finite_field() {
                return Err(ModelError::NonFinite { cell, field });
            }
        }
        Ok(())
    }

    pub fn cell(&self, cell: usize) -> Option<&CellCalibration> {
        self.cells.get(cell)
    }

    pub fn cells(&self) -> &[CellCalibration] {
        &self.cells
    }

    pub fn valid_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.is_usable()).count()
    }

    pub fn invalid_cells(&self) -> impl Iterator<Item = usize> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_usable())
            .map(|(cell, _)| cell)
    }
}
