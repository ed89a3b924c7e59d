//! Ordered draw storage and posterior summaries.

use num_traits::ToPrimitive;

use super::params::ParameterLayout;
use super::types::CarError;

/// Append-only record of one chain's sampling phase.
///
/// Draws are stored row-major in a flat buffer; per-iteration sampler
/// statistics are kept in parallel vectors of the same length.
#[derive(Debug, Clone)]
pub struct Trace {
    parameter_count: usize,
    draws: Vec<f64>,
    log_density: Vec<f64>,
    accept_prob: Vec<f64>,
    divergent: Vec<bool>,
    tree_depth: Vec<usize>,
    energy: Vec<f64>,
}

impl Trace {
    #[must_use]
    pub const fn new(parameter_count: usize) -> Self {
        Self {
            parameter_count,
            draws: Vec::new(),
            log_density: Vec::new(),
            accept_prob: Vec::new(),
            divergent: Vec::new(),
            tree_depth: Vec::new(),
            energy: Vec::new(),
        }
    }

    /// Append one retained draw and its sampler statistics.
    ///
    /// # Panics
    ///
    /// Panics if `position` does not match the trace's parameter count.
    pub fn push(
        &mut self,
        position: &[f64],
        log_density: f64,
        accept_prob: f64,
        divergent: bool,
        tree_depth: usize,
        energy: f64,
    ) {
        assert_eq!(position.len(), self.parameter_count, "draw length mismatch");
        self.draws.extend_from_slice(position);
        self.log_density.push(log_density);
        self.accept_prob.push(accept_prob);
        self.divergent.push(divergent);
        self.tree_depth.push(tree_depth);
        self.energy.push(energy);
    }

    #[must_use]
    pub const fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    /// Number of retained draws.
    #[must_use]
    pub fn draw_count(&self) -> usize {
        self.log_density.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log_density.is_empty()
    }

    /// Draw `index` as a parameter slice.
    #[must_use]
    pub fn draw(&self, index: usize) -> &[f64] {
        let start = index * self.parameter_count;
        &self.draws[start..start + self.parameter_count]
    }

    /// The series of one parameter across all draws.
    #[must_use]
    pub fn parameter_series(&self, parameter: usize) -> Vec<f64> {
        (0..self.draw_count())
            .map(|i| self.draws[i * self.parameter_count + parameter])
            .collect()
    }

    #[must_use]
    pub fn log_density(&self) -> &[f64] {
        &self.log_density
    }

    #[must_use]
    pub fn accept_prob(&self) -> &[f64] {
        &self.accept_prob
    }

    #[must_use]
    pub fn divergent(&self) -> &[bool] {
        &self.divergent
    }

    #[must_use]
    pub fn tree_depth(&self) -> &[usize] {
        &self.tree_depth
    }

    #[must_use]
    pub fn energy(&self) -> &[f64] {
        &self.energy
    }

    /// Number of divergent draws in the trace.
    #[must_use]
    pub fn divergence_count(&self) -> usize {
        self.divergent.iter().filter(|&&flag| flag).count()
    }

    /// Fraction of draws with a finite log-density.
    #[must_use]
    pub fn finite_density_fraction(&self) -> f64 {
        if self.log_density.is_empty() {
            return 0.0;
        }
        let finite = self
            .log_density
            .iter()
            .filter(|value| value.is_finite())
            .count();
        usize_to_f64(finite) / usize_to_f64(self.log_density.len())
    }
}

/// Mean, spread, and central quantiles for one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub std_dev: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
}

/// Summarize every parameter over the pooled draws of all chains.
///
/// # Errors
///
/// Returns `CarError` if no draws are available or chains disagree on the
/// parameter count.
pub fn summarize_posterior(
    traces: &[Trace],
    layout: &ParameterLayout,
) -> Result<Vec<ParameterSummary>, CarError> {
    let parameter_count = layout.len();
    if traces
        .iter()
        .any(|trace| trace.parameter_count() != parameter_count)
    {
        return Err(CarError::InconsistentChainDimensions);
    }
    let total_draws = traces.iter().map(Trace::draw_count).sum::<usize>();
    if total_draws == 0 {
        return Err(CarError::InsufficientChainDraws {
            minimum: 1,
            found: 0,
        });
    }

    let mut summaries = Vec::with_capacity(parameter_count);
    let mut pooled = Vec::with_capacity(total_draws);
    for parameter in 0..parameter_count {
        pooled.clear();
        for trace in traces {
            for i in 0..trace.draw_count() {
                pooled.push(trace.draw(i)[parameter]);
            }
        }
        summaries.push(summarize_scalar(
            layout.parameter_name(parameter),
            &pooled,
        ));
    }
    Ok(summaries)
}

fn summarize_scalar(name: String, values: &[f64]) -> ParameterSummary {
    let count = usize_to_f64(values.len());
    let mean = values.iter().sum::<f64>() / count;
    let variance = if values.len() > 1 {
        values
            .iter()
            .map(|value| {
                let centered = value - mean;
                centered * centered
            })
            .sum::<f64>()
            / (count - 1.0)
    } else {
        0.0
    };
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    ParameterSummary {
        name,
        mean,
        std_dev: variance.max(0.0).sqrt(),
        q025: percentile(&sorted, 0.025),
        q50: percentile(&sorted, 0.5),
        q975: percentile(&sorted, 0.975),
    }
}

/// Linear-interpolation percentile over a sorted slice.
#[must_use]
pub fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }
    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0);
    let upper = position.ceil().to_usize().unwrap_or(last);
    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}
