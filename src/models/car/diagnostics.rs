//! Between-chain convergence diagnostics: split R-hat, effective sample
//! size, and divergence counts.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use super::params::ParameterLayout;
use super::trace::Trace;
use super::types::CarError;

/// Advisory pass/fail thresholds for the convergence rollup.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceThresholds {
    /// Maximum acceptable split R-hat.
    pub rhat_limit: f64,
    /// Minimum acceptable effective sample size.
    pub ess_minimum: f64,
}

impl Default for ConvergenceThresholds {
    fn default() -> Self {
        Self {
            rhat_limit: 1.01,
            ess_minimum: 400.0,
        }
    }
}

/// Split R-hat and ESS for one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterConvergence {
    pub name: String,
    pub rhat: f64,
    pub ess: f64,
    pub converged: bool,
}

/// Convergence assessment over all completed chains.
///
/// `converged` is advisory: it reports whether every parameter passed the
/// thresholds, it never aborts a run.
#[derive(Debug, Clone)]
pub struct ConvergenceReport {
    pub parameters: Vec<ParameterConvergence>,
    pub total_divergences: usize,
    pub converged: bool,
}

/// Assess convergence of every parameter across chains.
///
/// Chains are truncated to a common even length before splitting.
///
/// # Errors
///
/// Returns `CarError` with fewer than two chains, mismatched parameter
/// counts, or too few draws per chain.
pub fn summarize_convergence(
    traces: &[Trace],
    layout: &ParameterLayout,
    thresholds: &ConvergenceThresholds,
) -> Result<ConvergenceReport, CarError> {
    if traces.len() < 2 {
        return Err(CarError::InvalidChainCount {
            min: 2,
            found: traces.len(),
        });
    }
    let parameter_count = layout.len();
    if traces
        .iter()
        .any(|trace| trace.parameter_count() != parameter_count)
    {
        return Err(CarError::InconsistentChainDimensions);
    }
    let min_draws = traces.iter().map(Trace::draw_count).min().unwrap_or(0);
    let used = min_draws - (min_draws % 2);
    if used < 4 {
        return Err(CarError::InsufficientChainDraws {
            minimum: 4,
            found: used,
        });
    }

    let mut parameters = Vec::with_capacity(parameter_count);
    for parameter in 0..parameter_count {
        let chains = traces
            .iter()
            .map(|trace| {
                let mut series = trace.parameter_series(parameter);
                series.truncate(used);
                series
            })
            .collect::<Vec<_>>();
        let rhat = split_rhat(&chains)?;
        let ess = effective_sample_size(&chains);
        let converged = rhat < thresholds.rhat_limit && ess >= thresholds.ess_minimum;
        parameters.push(ParameterConvergence {
            name: layout.parameter_name(parameter),
            rhat,
            ess,
            converged,
        });
    }

    let total_divergences = traces.iter().map(Trace::divergence_count).sum();
    let converged = parameters.iter().all(|parameter| parameter.converged);
    Ok(ConvergenceReport {
        parameters,
        total_divergences,
        converged,
    })
}

/// Split R-hat over equal-length scalar chains: each chain is halved and the
/// potential scale reduction is computed over the half-chains.
///
/// # Errors
///
/// Returns `CarError` with fewer than two chains or fewer than four draws
/// per chain.
pub fn split_rhat(chains: &[Vec<f64>]) -> Result<f64, CarError> {
    if chains.len() < 2 {
        return Err(CarError::InvalidChainCount {
            min: 2,
            found: chains.len(),
        });
    }
    let n = chains.first().map_or(0, Vec::len);
    if n < 4 || !n.is_multiple_of(2) {
        return Err(CarError::InsufficientChainDraws {
            minimum: 4,
            found: n,
        });
    }
    if chains.iter().any(|chain| chain.len() != n) {
        return Err(CarError::InconsistentChainDimensions);
    }

    let half = n / 2;
    let mut split = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        split.push(chain[..half].to_vec());
        split.push(chain[half..].to_vec());
    }
    Ok(rhat_scalar(&split))
}

fn rhat_scalar(chains: &[Vec<f64>]) -> f64 {
    let n = usize_to_f64(chains[0].len());
    let m = usize_to_f64(chains.len());

    let chain_means = chains
        .iter()
        .map(|chain| chain.iter().sum::<f64>() / n)
        .collect::<Vec<_>>();
    let grand_mean = chain_means.iter().sum::<f64>() / m;
    let between = n
        * chain_means
            .iter()
            .map(|mean| {
                let centered = mean - grand_mean;
                centered * centered
            })
            .sum::<f64>()
        / (m - 1.0);
    let within = chains
        .iter()
        .zip(&chain_means)
        .map(|(chain, &mean)| sample_variance(chain, mean))
        .sum::<f64>()
        / m;

    if !(within.is_finite() && within > 0.0 && between.is_finite()) {
        return 1.0;
    }
    let var_plus = ((n - 1.0) / n).mul_add(within, between / n);
    if !var_plus.is_finite() || var_plus <= 0.0 {
        return 1.0;
    }
    (var_plus / within).sqrt().max(1.0)
}

/// Effective sample size via variogram autocorrelation estimates and the
/// Geyer initial monotone sequence, over split half-chains.
#[must_use]
pub fn effective_sample_size(chains: &[Vec<f64>]) -> f64 {
    let n_full = chains.first().map_or(0, Vec::len);
    if chains.len() < 2 || n_full < 4 {
        return 0.0;
    }
    let half = n_full / 2;
    let split = chains
        .iter()
        .flat_map(|chain| [chain[..half].to_vec(), chain[half..half * 2].to_vec()])
        .collect::<Vec<_>>();

    let m = usize_to_f64(split.len());
    let n = usize_to_f64(half);
    let total_draws = m * n;

    let means = split
        .iter()
        .map(|chain| chain.iter().sum::<f64>() / n)
        .collect::<Vec<_>>();
    let grand_mean = means.iter().sum::<f64>() / m;
    let between = n
        * means
            .iter()
            .map(|mean| {
                let centered = mean - grand_mean;
                centered * centered
            })
            .sum::<f64>()
        / (m - 1.0);
    let within = split
        .iter()
        .zip(&means)
        .map(|(chain, &mean)| sample_variance(chain, mean))
        .sum::<f64>()
        / m;
    let var_plus = ((n - 1.0) / n).mul_add(within, between / n);
    if !var_plus.is_finite() || var_plus < 1.0e-30 {
        return total_draws;
    }

    // Variogram autocorrelations: rho_t = 1 - V_t / (2 var_plus).
    let mut rho = Vec::with_capacity(half - 1);
    for lag in 1..half {
        let mut sum = 0.0;
        let mut count = 0usize;
        for chain in &split {
            for i in 0..half - lag {
                let diff = chain[i] - chain[i + lag];
                sum = diff.mul_add(diff, sum);
                count += 1;
            }
        }
        if count == 0 {
            break;
        }
        let variogram = sum / usize_to_f64(count);
        rho.push((1.0 - variogram / (2.0 * var_plus)).clamp(-1.0, 1.0));
        // Stop once a consecutive pair sum turns negative.
        let k = rho.len();
        if k >= 2 && k.is_multiple_of(2) && rho[k - 2] + rho[k - 1] < 0.0 {
            break;
        }
    }

    // Geyer initial monotone sequence over paired sums.
    let mut pair_sums: Vec<f64> = Vec::new();
    let mut i = 0;
    while i + 1 < rho.len() {
        let pair = rho[i] + rho[i + 1];
        if pair < 0.0 {
            break;
        }
        pair_sums.push(pair);
        i += 2;
    }
    for k in 1..pair_sums.len() {
        if pair_sums[k] > pair_sums[k - 1] {
            pair_sums[k] = pair_sums[k - 1];
        }
    }

    let tau = 2.0f64.mul_add(pair_sums.iter().sum::<f64>(), 1.0);
    if !tau.is_finite() || tau <= 0.0 {
        return total_draws;
    }
    (total_draws / tau).clamp(1.0, total_draws)
}

/// Render the report as a terminal table, flagging failed rows.
#[must_use]
pub fn render_convergence_table(report: &ConvergenceReport) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            ["parameter", "split R-hat", "ESS", "status"]
                .iter()
                .map(|header| Cell::new(*header))
                .collect::<Vec<_>>(),
        );
    for parameter in &report.parameters {
        let status = if parameter.converged { "ok" } else { "check" };
        let mut row = vec![
            Cell::new(&parameter.name),
            Cell::new(format!("{:.4}", parameter.rhat)),
            Cell::new(format!("{:.0}", parameter.ess)),
            Cell::new(status),
        ];
        if !parameter.converged {
            row = row.into_iter().map(|cell| cell.fg(Color::Red)).collect();
        }
        table.add_row(row);
    }
    table.add_row(vec![
        Cell::new("divergences"),
        Cell::new(report.total_divergences.to_string()),
        Cell::new(""),
        Cell::new(if report.total_divergences == 0 {
            "ok"
        } else {
            "check"
        }),
    ]);
    table
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values
        .iter()
        .map(|value| {
            let centered = value - mean;
            centered * centered
        })
        .sum::<f64>()
        / usize_to_f64(values.len() - 1)
}

fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn gaussian_chain(seed: u64, shift: f64, len: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len)
            .map(|_| shift + rng.sample::<f64, _>(StandardNormal))
            .collect()
    }

    fn random_walk_chain(seed: u64, len: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut position = 0.0;
        (0..len)
            .map(|_| {
                position += 0.1 * rng.sample::<f64, _>(StandardNormal);
                position
            })
            .collect()
    }

    #[test]
    fn rhat_is_near_one_for_well_mixed_chains() {
        let chains = vec![
            gaussian_chain(1, 0.0, 1_000),
            gaussian_chain(2, 0.0, 1_000),
            gaussian_chain(3, 0.0, 1_000),
        ];
        let rhat = split_rhat(&chains).expect("rhat");
        assert!(rhat < 1.01, "rhat {rhat}");
    }

    #[test]
    fn rhat_detects_disagreeing_chains() {
        let chains = vec![
            gaussian_chain(1, 0.0, 500),
            gaussian_chain(2, 5.0, 500),
        ];
        let rhat = split_rhat(&chains).expect("rhat");
        assert!(rhat > 1.5, "rhat {rhat}");
    }

    #[test]
    fn rhat_requires_two_chains_and_enough_draws() {
        assert!(matches!(
            split_rhat(&[gaussian_chain(1, 0.0, 100)]),
            Err(CarError::InvalidChainCount { min: 2, found: 1 })
        ));
        assert!(matches!(
            split_rhat(&[vec![1.0, 2.0], vec![1.0, 2.0]]),
            Err(CarError::InsufficientChainDraws { .. })
        ));
    }

    #[test]
    fn ess_of_independent_draws_is_close_to_total() {
        let chains = vec![gaussian_chain(4, 0.0, 1_000), gaussian_chain(5, 0.0, 1_000)];
        let ess = effective_sample_size(&chains);
        assert!(ess > 1_000.0, "ess {ess}");
    }

    #[test]
    fn ess_of_random_walk_is_small() {
        let chains = vec![random_walk_chain(6, 1_000), random_walk_chain(7, 1_000)];
        let ess = effective_sample_size(&chains);
        assert!(ess < 200.0, "ess {ess}");
    }

    #[test]
    fn convergence_report_flags_disagreeing_parameter() {
        let layout = ParameterLayout::new(0, 0, 0, 0, 0);
        let mut first = Trace::new(layout.len());
        let mut second = Trace::new(layout.len());
        let noise_a = gaussian_chain(8, 0.0, 600);
        let noise_b = gaussian_chain(9, 0.0, 600);
        for i in 0..600 {
            // One parameter disagrees across chains, the rest mix well.
            let mut row_a = [0.0; 6];
            let mut row_b = [0.0; 6];
            for slot in 0..6 {
                row_a[slot] = noise_a[i] + usize_to_f64(slot);
                row_b[slot] = noise_b[i] + usize_to_f64(slot);
            }
            row_b[5] += 4.0;
            first.push(&row_a, -1.0, 0.9, false, 2, 0.0);
            second.push(&row_b, -1.0, 0.9, i % 200 == 0, 2, 0.0);
        }
        let report = summarize_convergence(
            &[first, second],
            &layout,
            &ConvergenceThresholds::default(),
        )
        .expect("report");
        assert!(!report.converged);
        assert!(report.parameters[0].converged);
        assert!(!report.parameters[5].converged);
        assert_eq!(report.total_divergences, 3);
    }

    #[test]
    fn convergence_requires_two_chains() {
        let layout = ParameterLayout::new(0, 0, 0, 0, 0);
        let trace = Trace::new(layout.len());
        let err = summarize_convergence(&[trace], &layout, &ConvergenceThresholds::default())
            .expect_err("single chain should fail");
        assert!(matches!(err, CarError::InvalidChainCount { min: 2, found: 1 }));
    }

    #[test]
    fn render_table_includes_every_parameter_row() {
        let report = ConvergenceReport {
            parameters: vec![
                ParameterConvergence {
                    name: "beta[0]".to_string(),
                    rhat: 1.002,
                    ess: 812.0,
                    converged: true,
                },
                ParameterConvergence {
                    name: "logit_rho".to_string(),
                    rhat: 1.08,
                    ess: 55.0,
                    converged: false,
                },
            ],
            total_divergences: 1,
            converged: false,
        };
        let rendered = render_convergence_table(&report).to_string();
        assert!(rendered.contains("beta[0]"));
        assert!(rendered.contains("logit_rho"));
        assert!(rendered.contains("divergences"));
    }
}
