//! Core public types for the CAR model module.

use crate::graph::GraphError;
use crate::hierarchy::HierarchyError;
use crate::inference::{InferenceError, SamplerSchedule};
use crate::input::AreaInputError;
use thiserror::Error;

/// Errors returned by CAR configuration, validation, and fitting.
#[derive(Debug, Error)]
pub enum CarError {
    #[error(transparent)]
    InvalidInput(#[from] AreaInputError),
    #[error(transparent)]
    InvalidGraph(#[from] GraphError),
    #[error(transparent)]
    InvalidHierarchy(#[from] HierarchyError),
    #[error(transparent)]
    InvalidSchedule(#[from] InferenceError),
    #[error("invalid CAR prior configuration")]
    InvalidPriorConfig,
    #[error("target acceptance probability must lie strictly between 0 and 1")]
    InvalidTargetAccept,
    #[error("divergence threshold must be positive and finite")]
    InvalidDivergenceThreshold,
    #[error("maximum tree depth must be positive")]
    InvalidTreeDepth,
    #[error("graph node count ({nodes}) must match table rows ({rows})")]
    GraphSizeMismatch { nodes: usize, rows: usize },
    #[error("multi-chain workflows require at least {min} chains; found {found}")]
    InvalidChainCount { min: usize, found: usize },
    #[error("multi-chain seed stride must be positive")]
    InvalidSeedStride,
    #[error("only {finished} of the required {min} chains completed")]
    TooFewChains { min: usize, finished: usize },
    #[error("log density is non-finite at the initial position after {attempts} restarts")]
    NonFiniteStart { attempts: usize },
    #[error("posterior density evaluated to a non-finite value")]
    NonFiniteDensity,
    #[error("each chain must retain at least {minimum} draws; found {found}")]
    InsufficientChainDraws { minimum: usize, found: usize },
    #[error("posterior dimensions differ across chains")]
    InconsistentChainDimensions,
    #[error("a chain worker panicked")]
    ChainPanicked,
}

/// Sampler configuration for CAR fitting.
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    /// Adaptation iterations discarded before retention.
    pub warmup_iterations: usize,
    /// Retained sampling iterations.
    pub sampling_iterations: usize,
    /// Acceptance probability targeted by step-size adaptation.
    pub target_accept: f64,
    /// Energy-error threshold above which a leapfrog step is divergent.
    pub divergence_threshold: f64,
    /// Maximum NUTS tree doublings per transition.
    pub max_tree_depth: usize,
    /// RNG seed for reproducibility.
    pub seed: u64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            warmup_iterations: 1_000,
            sampling_iterations: 1_000,
            target_accept: 0.8,
            divergence_threshold: 1_000.0,
            max_tree_depth: 10,
            seed: 42,
        }
    }
}

impl FitOptions {
    /// # Errors
    ///
    /// Returns `CarError` if any option is out of range.
    pub fn validate(&self) -> Result<(), CarError> {
        self.schedule().validate()?;
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(CarError::InvalidTargetAccept);
        }
        if !(self.divergence_threshold.is_finite() && self.divergence_threshold > 0.0) {
            return Err(CarError::InvalidDivergenceThreshold);
        }
        if self.max_tree_depth == 0 {
            return Err(CarError::InvalidTreeDepth);
        }
        Ok(())
    }

    #[must_use]
    pub const fn schedule(&self) -> SamplerSchedule {
        SamplerSchedule {
            warmup_iterations: self.warmup_iterations,
            sampling_iterations: self.sampling_iterations,
        }
    }
}

/// Multi-chain orchestration settings.
#[derive(Debug, Clone, Copy)]
pub struct MultiChainOptions {
    /// Number of independent chains; at least two are required.
    pub chains: usize,
    /// Seed offset between consecutive chains.
    pub seed_stride: u64,
}

impl Default for MultiChainOptions {
    fn default() -> Self {
        Self {
            chains: 4,
            seed_stride: 1,
        }
    }
}

impl MultiChainOptions {
    /// # Errors
    ///
    /// Returns `CarError` if fewer than two chains are requested or the
    /// stride is zero.
    pub const fn validate(&self) -> Result<(), CarError> {
        if self.chains < 2 {
            return Err(CarError::InvalidChainCount {
                min: 2,
                found: self.chains,
            });
        }
        if self.seed_stride == 0 {
            return Err(CarError::InvalidSeedStride);
        }
        Ok(())
    }
}

/// Per-chain sampler diagnostics reported after fitting.
#[derive(Debug, Clone, Copy)]
pub struct ChainDiagnostics {
    pub chain_index: usize,
    /// Step size frozen at the end of warmup.
    pub step_size: f64,
    /// Mean acceptance probability over the sampling phase.
    pub mean_accept_prob: f64,
    /// Divergent transitions during the sampling phase.
    pub divergences: usize,
    /// Whether the chain stopped early through cooperative cancellation.
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_options_defaults_are_valid() {
        assert!(FitOptions::default().validate().is_ok());
    }

    #[test]
    fn fit_options_reject_bad_target_accept() {
        let options = FitOptions {
            target_accept: 1.0,
            ..FitOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(CarError::InvalidTargetAccept)
        ));
    }

    #[test]
    fn fit_options_reject_bad_divergence_threshold() {
        let options = FitOptions {
            divergence_threshold: 0.0,
            ..FitOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(CarError::InvalidDivergenceThreshold)
        ));
    }

    #[test]
    fn multi_chain_options_require_two_chains() {
        let options = MultiChainOptions {
            chains: 1,
            ..MultiChainOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(CarError::InvalidChainCount { min: 2, found: 1 })
        ));
    }

    #[test]
    fn multi_chain_options_require_positive_stride() {
        let options = MultiChainOptions {
            seed_stride: 0,
            ..MultiChainOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(CarError::InvalidSeedStride)
        ));
    }
}
