//! # Model inputs
//!
//! Defines a light-weight container for the per-area observation table:
//! outcome, covariates, hierarchical geographic codes, and planar centroids.
//!
//! # Examples
//!
//! ```
//! use faer::Mat;
//! use spatial_multilevel::AreaTable;
//!
//! fn idx_to_f64(idx: usize) -> f64 {
//!     f64::from(u32::try_from(idx).unwrap_or(u32::MAX))
//! }
//!
//! let covariates = Mat::from_fn(2, 2, |i, j| if j == 0 { 1.0 } else { idx_to_f64(i) });
//! let outcome = Mat::from_fn(2, 1, |i, _| idx_to_f64(i));
//! let codes = vec!["10100100001".to_string(), "10100100002".to_string()];
//! let centroids = vec![[0.0, 0.0], [1.0, 0.5]];
//! let table = AreaTable::new(outcome, covariates, codes, centroids);
//!
//! assert!(table.validate().is_ok());
//! ```

use faer::Mat;
use thiserror::Error;

/// Errors returned when validating the area observation table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AreaInputError {
    #[error("covariate matrix must have at least one column")]
    EmptyDesign,
    #[error("outcome must be a single column matrix")]
    InvalidOutcomeShape,
    #[error("covariate rows ({rows}) must match outcome rows ({len})")]
    DimensionMismatch { rows: usize, len: usize },
    #[error("geographic code count ({codes}) must match outcome rows ({rows})")]
    CodeCountMismatch { codes: usize, rows: usize },
    #[error("centroid count ({centroids}) must match outcome rows ({rows})")]
    CentroidCountMismatch { centroids: usize, rows: usize },
    #[error("covariate matrix contains non-finite values")]
    NonFiniteDesign,
    #[error("outcome contains non-finite values")]
    NonFiniteOutcome,
    #[error("centroid {index} contains non-finite coordinates")]
    NonFiniteCentroid { index: usize },
}

/// Per-area observation table for the hierarchical spatial model.
///
/// One row per area: a scalar outcome, a covariate row, a fixed-width
/// geographic code, and a planar centroid used for neighbor search.
#[derive(Debug, Clone)]
pub struct AreaTable {
    pub outcome: Mat<f64>,
    pub covariates: Mat<f64>,
    pub geo_codes: Vec<String>,
    pub centroids: Vec<[f64; 2]>,
}

impl AreaTable {
    #[must_use]
    pub const fn new(
        outcome: Mat<f64>,
        covariates: Mat<f64>,
        geo_codes: Vec<String>,
        centroids: Vec<[f64; 2]>,
    ) -> Self {
        Self {
            outcome,
            covariates,
            geo_codes,
            centroids,
        }
    }

    /// Number of areas (rows).
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcome.nrows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcome.nrows() == 0
    }

    /// Number of covariate columns.
    #[must_use]
    pub fn covariate_count(&self) -> usize {
        self.covariates.ncols()
    }

    /// Validate shapes and values across all four columns of the table.
    ///
    /// # Errors
    ///
    /// Returns `AreaInputError` if any part of the table is malformed.
    pub fn validate(&self) -> Result<(), AreaInputError> {
        if self.covariates.ncols() == 0 {
            return Err(AreaInputError::EmptyDesign);
        }
        if self.outcome.ncols() != 1 {
            return Err(AreaInputError::InvalidOutcomeShape);
        }
        if self.covariates.nrows() != self.outcome.nrows() {
            return Err(AreaInputError::DimensionMismatch {
                rows: self.covariates.nrows(),
                len: self.outcome.nrows(),
            });
        }
        if self.geo_codes.len() != self.outcome.nrows() {
            return Err(AreaInputError::CodeCountMismatch {
                codes: self.geo_codes.len(),
                rows: self.outcome.nrows(),
            });
        }
        if self.centroids.len() != self.outcome.nrows() {
            return Err(AreaInputError::CentroidCountMismatch {
                centroids: self.centroids.len(),
                rows: self.outcome.nrows(),
            });
        }
        if !matrix_is_finite(&self.covariates) {
            return Err(AreaInputError::NonFiniteDesign);
        }
        if !matrix_is_finite(&self.outcome) {
            return Err(AreaInputError::NonFiniteOutcome);
        }
        for (index, centroid) in self.centroids.iter().enumerate() {
            if !(centroid[0].is_finite() && centroid[1].is_finite()) {
                return Err(AreaInputError::NonFiniteCentroid { index });
            }
        }
        Ok(())
    }
}

fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}
