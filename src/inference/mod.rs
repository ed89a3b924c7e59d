//! Reusable inference and MCMC utility types.

use thiserror::Error;

/// Errors for generic sampler schedule configuration.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InferenceError {
    #[error("sampling iterations must be positive")]
    InvalidSampling,
    #[error("warmup iterations must be positive when adaptation is enabled")]
    InvalidWarmup,
}

/// Warmup-then-sample schedule shared by all samplers in the crate.
#[derive(Debug, Clone, Copy)]
pub struct SamplerSchedule {
    /// Adaptation iterations discarded before retention.
    pub warmup_iterations: usize,
    /// Retained sampling iterations.
    pub sampling_iterations: usize,
}

impl Default for SamplerSchedule {
    fn default() -> Self {
        Self {
            warmup_iterations: 1_000,
            sampling_iterations: 1_000,
        }
    }
}

impl SamplerSchedule {
    /// # Errors
    ///
    /// Returns `InferenceError` if schedule values are invalid.
    pub const fn validate(self) -> Result<(), InferenceError> {
        if self.sampling_iterations == 0 {
            return Err(InferenceError::InvalidSampling);
        }
        if self.warmup_iterations == 0 {
            return Err(InferenceError::InvalidWarmup);
        }
        Ok(())
    }

    /// Total iterations the chain will run.
    #[must_use]
    pub const fn total_iterations(self) -> usize {
        self.warmup_iterations + self.sampling_iterations
    }
}

/// Acceptance-statistic accumulator for a single chain.
///
/// Tracks the mean Metropolis acceptance probability rather than a boolean
/// accept count, which is the quantity step-size adaptation targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptanceStats {
    accept_prob_sum: f64,
    steps: usize,
    divergences: usize,
}

impl AcceptanceStats {
    /// Record one transition's acceptance probability and divergence flag.
    pub fn record(&mut self, accept_prob: f64, divergent: bool) {
        self.accept_prob_sum += accept_prob.clamp(0.0, 1.0);
        self.steps += 1;
        if divergent {
            self.divergences += 1;
        }
    }

    /// Mean acceptance probability in `[0, 1]`, or `0` if nothing was recorded.
    #[must_use]
    pub fn mean_accept_prob(self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.accept_prob_sum / usize_to_f64(self.steps)
        }
    }

    /// Number of divergent transitions recorded.
    #[must_use]
    pub const fn divergence_count(self) -> usize {
        self.divergences
    }

    /// Number of transitions recorded.
    #[must_use]
    pub const fn step_count(self) -> usize {
        self.steps
    }
}

fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_validation_rejects_zero_sampling() {
        let schedule = SamplerSchedule {
            sampling_iterations: 0,
            ..SamplerSchedule::default()
        };
        assert_eq!(schedule.validate(), Err(InferenceError::InvalidSampling));
    }

    #[test]
    fn schedule_totals_both_phases() {
        let schedule = SamplerSchedule {
            warmup_iterations: 200,
            sampling_iterations: 300,
        };
        assert_eq!(schedule.total_iterations(), 500);
    }

    #[test]
    fn acceptance_stats_track_mean_and_divergences() {
        let mut stats = AcceptanceStats::default();
        stats.record(1.0, false);
        stats.record(0.5, true);
        assert!((stats.mean_accept_prob() - 0.75).abs() < 1.0e-12);
        assert_eq!(stats.divergence_count(), 1);
        assert_eq!(stats.step_count(), 2);
    }
}
