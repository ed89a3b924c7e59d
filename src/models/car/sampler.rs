//! NUTS sampler and multi-chain orchestration for the CAR model.
//!
//! One chain is a classic warmup-then-sample loop: leapfrog dynamics inside
//! a doubling no-U-turn tree, dual-averaging step-size adaptation toward the
//! target acceptance probability, and a diagonal mass matrix estimated from
//! warmup draws. Chains are independent; the orchestrator fans them out over
//! scoped threads with per-chain seeds and checks a shared cancellation flag
//! between iterations only, never inside a trajectory.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::graph::{SpatialWeights, SpatialWeightsBuilder};
use crate::hierarchy::{HierarchyIndex, HierarchyLayout};
use crate::inference::AcceptanceStats;
use crate::input::AreaTable;

use super::diagnostics::{ConvergenceReport, ConvergenceThresholds, summarize_convergence};
use super::params::ParameterLayout;
use super::posterior::CarPosterior;
use super::priors::PriorConfig;
use super::trace::{ParameterSummary, Trace, summarize_posterior};
use super::types::{CarError, ChainDiagnostics, FitOptions, MultiChainOptions};

/// Restart budget for a chain whose initial position has no finite density.
const MAX_INIT_RESTARTS: usize = 100;

/// Phase-space point: position, momentum, and the cached potential surface.
#[derive(Debug, Clone)]
pub struct HmcPoint {
    /// Position in unconstrained space.
    pub position: Vec<f64>,
    /// Momentum.
    pub momentum: Vec<f64>,
    /// Potential energy, the negated joint log-density.
    pub potential: f64,
    /// Gradient of the potential.
    pub grad_potential: Vec<f64>,
}

impl HmcPoint {
    /// Kinetic energy `0.5 * p' M^-1 p` under a diagonal mass matrix.
    #[must_use]
    pub fn kinetic_energy(&self, inv_mass: &[f64]) -> f64 {
        self.momentum
            .iter()
            .zip(inv_mass)
            .map(|(&p, &m)| p * p * m)
            .sum::<f64>()
            * 0.5
    }

    /// Total Hamiltonian `H = U(q) + K(p)`.
    #[must_use]
    pub fn hamiltonian(&self, inv_mass: &[f64]) -> f64 {
        self.potential + self.kinetic_energy(inv_mass)
    }
}

/// Leapfrog integrator over the CAR posterior.
#[derive(Debug)]
pub struct Leapfrog<'a, 'b> {
    posterior: &'a CarPosterior<'b>,
    step_size: f64,
    inv_mass: Vec<f64>,
}

impl<'a, 'b> Leapfrog<'a, 'b> {
    #[must_use]
    pub const fn new(posterior: &'a CarPosterior<'b>, step_size: f64, inv_mass: Vec<f64>) -> Self {
        Self {
            posterior,
            step_size,
            inv_mass,
        }
    }

    pub fn set_step_size(&mut self, step_size: f64) {
        self.step_size = step_size;
    }

    #[must_use]
    pub const fn step_size(&self) -> f64 {
        self.step_size
    }

    #[must_use]
    pub fn inv_mass(&self) -> &[f64] {
        &self.inv_mass
    }

    /// Potential surface at `position`. A non-finite density becomes an
    /// infinite potential, so the surrounding leaf is rejected as divergent
    /// instead of aborting the chain.
    fn surface(&self, position: &[f64]) -> (f64, Vec<f64>) {
        match self.posterior.log_density_and_gradient(position) {
            Ok((log_density, gradient)) => {
                (-log_density, gradient.iter().map(|g| -g).collect())
            }
            Err(_) => (f64::INFINITY, vec![0.0; position.len()]),
        }
    }

    /// Phase-space point at `position` with zeroed momentum.
    ///
    /// # Errors
    ///
    /// Returns `CarError::NonFiniteDensity` when the density is non-finite
    /// at `position`; chain setup retries from a fresh jitter.
    pub fn init_point(&self, position: Vec<f64>) -> Result<HmcPoint, CarError> {
        let (log_density, gradient) = self.posterior.log_density_and_gradient(&position)?;
        let momentum = vec![0.0; position.len()];
        Ok(HmcPoint {
            position,
            momentum,
            potential: -log_density,
            grad_potential: gradient.iter().map(|g| -g).collect(),
        })
    }

    /// One leapfrog step: half-kick, drift, half-kick.
    pub fn step_with_eps(&self, point: &mut HmcPoint, eps: f64) {
        let n = point.position.len();
        for i in 0..n {
            point.momentum[i] = (0.5 * eps).mul_add(-point.grad_potential[i], point.momentum[i]);
        }
        for i in 0..n {
            point.position[i] =
                (eps * self.inv_mass[i]).mul_add(point.momentum[i], point.position[i]);
        }
        let (potential, grad_potential) = self.surface(&point.position);
        point.potential = potential;
        point.grad_potential = grad_potential;
        for i in 0..n {
            point.momentum[i] = (0.5 * eps).mul_add(-point.grad_potential[i], point.momentum[i]);
        }
    }

    /// One step in the given direction, `+1` forward or `-1` backward.
    pub fn step_dir(&self, point: &mut HmcPoint, direction: i32) {
        debug_assert!(direction == 1 || direction == -1);
        self.step_with_eps(point, self.step_size * f64::from(direction));
    }

    /// `steps` forward leapfrog steps.
    #[must_use]
    pub fn integrate(&self, mut point: HmcPoint, steps: usize) -> HmcPoint {
        for _ in 0..steps {
            self.step_with_eps(&mut point, self.step_size);
        }
        point
    }
}

/// Outcome of one NUTS transition.
#[derive(Debug, Clone)]
struct NutsTransition {
    position: Vec<f64>,
    potential: f64,
    grad_potential: Vec<f64>,
    depth: usize,
    divergent: bool,
    accept_prob: f64,
    energy: f64,
}

/// Selected sample within a tree, kept alongside its own Hamiltonian.
#[derive(Debug, Clone)]
struct TreeProposal {
    position: Vec<f64>,
    potential: f64,
    grad_potential: Vec<f64>,
    energy: f64,
}

/// Doubling-tree bookkeeping: both edges, the running proposal, and the
/// slice/turning state.
struct NutsTree {
    left: HmcPoint,
    right: HmcPoint,
    proposal: TreeProposal,
    log_sum_weight: f64,
    leapfrog_count: usize,
    sum_accept_prob: f64,
    divergent: bool,
    turning: bool,
}

/// No-U-turn criterion on the displacement between tree edges, weighted by
/// the inverse mass.
fn is_turning(displacement: &[f64], p_left: &[f64], p_right: &[f64], inv_mass: &[f64]) -> bool {
    let dot_left = displacement
        .iter()
        .zip(p_left)
        .zip(inv_mass)
        .map(|((&d, &p), &m)| d * p * m)
        .sum::<f64>();
    let dot_right = displacement
        .iter()
        .zip(p_right)
        .zip(inv_mass)
        .map(|((&d, &p), &m)| d * p * m)
        .sum::<f64>();
    dot_left < 0.0 || dot_right < 0.0
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

/// Single-node tree: one leapfrog step from `from`.
fn build_leaf(
    integrator: &Leapfrog<'_, '_>,
    from: &HmcPoint,
    direction: i32,
    log_slice: f64,
    h0: f64,
    options: &FitOptions,
) -> NutsTree {
    let mut point = from.clone();
    integrator.step_dir(&mut point, direction);

    let h = point.hamiltonian(integrator.inv_mass());
    let energy_error = h - h0;
    let divergent = !energy_error.is_finite() || energy_error.abs() > options.divergence_threshold;
    // Slice criterion: a leaf stays live when log_u <= -H.
    let log_weight = if log_slice <= -h {
        0.0
    } else {
        f64::NEG_INFINITY
    };
    let accept_prob = if energy_error.is_finite() {
        (-energy_error).exp().min(1.0)
    } else {
        0.0
    };

    NutsTree {
        proposal: TreeProposal {
            position: point.position.clone(),
            potential: point.potential,
            grad_potential: point.grad_potential.clone(),
            energy: h,
        },
        left: point.clone(),
        right: point,
        log_sum_weight: log_weight,
        leapfrog_count: 1,
        sum_accept_prob: accept_prob,
        divergent,
        turning: false,
    }
}

/// Recursively build a balanced subtree of the given depth.
#[allow(clippy::too_many_arguments)]
fn build_tree(
    integrator: &Leapfrog<'_, '_>,
    from: &HmcPoint,
    depth: usize,
    direction: i32,
    log_slice: f64,
    h0: f64,
    options: &FitOptions,
    rng: &mut StdRng,
) -> NutsTree {
    if depth == 0 {
        return build_leaf(integrator, from, direction, log_slice, h0, options);
    }

    let mut inner = build_tree(
        integrator,
        from,
        depth - 1,
        direction,
        log_slice,
        h0,
        options,
        rng,
    );
    if inner.divergent || inner.turning {
        return inner;
    }

    let edge = if direction > 0 {
        inner.right.clone()
    } else {
        inner.left.clone()
    };
    let outer = build_tree(
        integrator,
        &edge,
        depth - 1,
        direction,
        log_slice,
        h0,
        options,
        rng,
    );

    merge_into(&mut inner, outer, direction, integrator.inv_mass(), rng);
    inner
}

/// Fold `outer` into `inner`: multinomial proposal swap, edge update, and
/// the full-tree U-turn check.
fn merge_into(
    inner: &mut NutsTree,
    outer: NutsTree,
    direction: i32,
    inv_mass: &[f64],
    rng: &mut StdRng,
) {
    let combined = log_sum_exp(inner.log_sum_weight, outer.log_sum_weight);
    let take_outer = (outer.log_sum_weight - combined).exp();
    if rng.random::<f64>() < take_outer {
        inner.proposal = outer.proposal;
    }
    inner.log_sum_weight = combined;
    inner.leapfrog_count += outer.leapfrog_count;
    inner.sum_accept_prob += outer.sum_accept_prob;
    inner.divergent = inner.divergent || outer.divergent;

    if direction > 0 {
        inner.right = outer.right;
    } else {
        inner.left = outer.left;
    }

    let displacement = inner
        .right
        .position
        .iter()
        .zip(&inner.left.position)
        .map(|(&r, &l)| r - l)
        .collect::<Vec<_>>();
    inner.turning = inner.turning
        || outer.turning
        || is_turning(
            &displacement,
            &inner.left.momentum,
            &inner.right.momentum,
            inv_mass,
        );
}

fn sample_momentum(point: &mut HmcPoint, inv_mass: &[f64], rng: &mut StdRng) {
    for (p, &m) in point.momentum.iter_mut().zip(inv_mass) {
        let sigma = (1.0 / m).sqrt();
        *p = sigma * rng.sample::<f64, _>(StandardNormal);
    }
}

/// One NUTS transition from `current`.
fn nuts_transition(
    integrator: &Leapfrog<'_, '_>,
    current: &HmcPoint,
    options: &FitOptions,
    rng: &mut StdRng,
) -> NutsTransition {
    let inv_mass = integrator.inv_mass().to_vec();
    let mut point = current.clone();
    sample_momentum(&mut point, &inv_mass, rng);

    let h0 = point.hamiltonian(&inv_mass);
    // Slice variable u ~ Uniform(0, exp(-H0)), kept in log space.
    let log_slice = rng.random::<f64>().ln() - h0;

    let mut tree = NutsTree {
        proposal: TreeProposal {
            position: point.position.clone(),
            potential: point.potential,
            grad_potential: point.grad_potential.clone(),
            energy: h0,
        },
        left: point.clone(),
        right: point,
        log_sum_weight: 0.0,
        leapfrog_count: 0,
        sum_accept_prob: 0.0,
        divergent: false,
        turning: false,
    };

    let mut depth = 0;
    let mut depth_reached = 0;
    while depth <= options.max_tree_depth {
        depth_reached = depth;
        let direction = if rng.random::<bool>() { 1 } else { -1 };
        let edge = if direction > 0 {
            tree.right.clone()
        } else {
            tree.left.clone()
        };
        let subtree = build_tree(
            integrator, &edge, depth, direction, log_slice, h0, options, rng,
        );
        merge_into(&mut tree, subtree, direction, &inv_mass, rng);
        if tree.divergent || tree.turning {
            break;
        }
        depth += 1;
    }

    let accept_prob = tree.sum_accept_prob / usize_to_f64(tree.leapfrog_count.max(1));
    NutsTransition {
        position: tree.proposal.position,
        potential: tree.proposal.potential,
        grad_potential: tree.proposal.grad_potential,
        depth: depth_reached,
        divergent: tree.divergent,
        accept_prob,
        energy: tree.proposal.energy,
    }
}

/// Dual-averaging step-size adaptation toward the target acceptance rate.
#[derive(Debug, Clone)]
struct DualAveraging {
    target_accept: f64,
    mu: f64,
    log_step: f64,
    log_avg_step: f64,
    h_bar: f64,
    iteration: usize,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(target_accept: f64, initial_step: f64) -> Self {
        Self {
            target_accept,
            mu: (10.0 * initial_step).ln(),
            log_step: initial_step.ln(),
            log_avg_step: initial_step.ln(),
            h_bar: 0.0,
            iteration: 0,
        }
    }

    fn update(&mut self, accept_prob: f64) {
        self.iteration += 1;
        let m = usize_to_f64(self.iteration);
        let eta = 1.0 / (m + Self::T0);
        self.h_bar = (1.0 - eta)
            .mul_add(self.h_bar, eta * (self.target_accept - accept_prob.clamp(0.0, 1.0)));
        self.log_step = m.sqrt().mul_add(-self.h_bar / Self::GAMMA, self.mu);
        let weight = m.powf(-Self::KAPPA);
        self.log_avg_step = weight.mul_add(self.log_step, (1.0 - weight) * self.log_avg_step);
    }

    fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    fn adapted_step_size(&self) -> f64 {
        self.log_avg_step.exp()
    }
}

/// Welford accumulator for the per-coordinate posterior variance.
#[derive(Debug, Clone)]
struct WelfordVariance {
    count: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl WelfordVariance {
    fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    fn update(&mut self, sample: &[f64]) {
        self.count += 1;
        let count = usize_to_f64(self.count);
        for i in 0..sample.len() {
            let delta = sample[i] - self.mean[i];
            self.mean[i] += delta / count;
            self.m2[i] = delta.mul_add(sample[i] - self.mean[i], self.m2[i]);
        }
    }

    const fn count(&self) -> usize {
        self.count
    }

    fn variance(&self) -> Vec<f64> {
        if self.count < 2 {
            return vec![1.0; self.mean.len()];
        }
        let denom = usize_to_f64(self.count - 1);
        self.m2.iter().map(|&m| m / denom).collect()
    }
}

/// Doubling search for a step size with roughly 50% one-step acceptance.
fn find_reasonable_step_size(
    posterior: &CarPosterior<'_>,
    point: &HmcPoint,
    inv_mass: &[f64],
    rng: &mut StdRng,
) -> f64 {
    let integrator = Leapfrog::new(posterior, 1.0, inv_mass.to_vec());
    let mut start = point.clone();
    sample_momentum(&mut start, inv_mass, rng);
    let h0 = start.hamiltonian(inv_mass);

    let mut step = 1.0;
    let probe = |step: f64| -> f64 {
        let mut moved = start.clone();
        integrator.step_with_eps(&mut moved, step);
        let delta = h0 - moved.hamiltonian(inv_mass);
        if delta.is_finite() {
            delta
        } else {
            f64::NEG_INFINITY
        }
    };
    let mut delta = probe(step);
    let direction: f64 = if delta > 0.5f64.ln() { 1.0 } else { -1.0 };
    for _ in 0..50 {
        if direction * delta <= -direction * std::f64::consts::LN_2 {
            break;
        }
        step *= 2.0f64.powf(direction);
        delta = probe(step);
    }
    step.clamp(1.0e-10, 1.0e3)
}

/// Result of one chain: the retained trace plus sampler diagnostics.
#[derive(Debug, Clone)]
pub struct ChainRun {
    pub trace: Trace,
    pub diagnostics: ChainDiagnostics,
}

impl ChainRun {
    /// A chain counts as complete when it retained the full sampling phase.
    #[must_use]
    pub fn is_complete(&self, options: &FitOptions) -> bool {
        !self.diagnostics.cancelled && self.trace.draw_count() == options.sampling_iterations
    }
}

/// Run one chain to completion or cancellation.
fn run_chain(
    posterior: &CarPosterior<'_>,
    options: &FitOptions,
    chain_index: usize,
    seed: u64,
    cancel: &AtomicBool,
) -> Result<ChainRun, CarError> {
    let layout = posterior.layout();
    let dim = layout.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut inv_mass = vec![1.0; dim];

    // The start position must have a finite density; re-jitter a bounded
    // number of times before giving up on the chain.
    let mut integrator = Leapfrog::new(posterior, 1.0, inv_mass.clone());
    let mut current = None;
    for _ in 0..MAX_INIT_RESTARTS {
        let candidate = layout.initial_position(&mut rng);
        if let Ok(point) = integrator.init_point(candidate) {
            current = Some(point);
            break;
        }
    }
    let mut current = current.ok_or(CarError::NonFiniteStart {
        attempts: MAX_INIT_RESTARTS,
    })?;

    let initial_step = find_reasonable_step_size(posterior, &current, &inv_mass, &mut rng);
    integrator.set_step_size(initial_step);
    let mut adaptation = DualAveraging::new(options.target_accept, initial_step);
    debug!("chain {chain_index}: initial step size {initial_step:.3e}");

    // Warmup in three phases: step size only, step size plus variance
    // collection, then re-adaptation under the estimated mass matrix.
    let warmup = options.warmup_iterations;
    let phase1_end = warmup * 15 / 100;
    let phase2_end = warmup * 90 / 100;
    let mut welford = WelfordVariance::new(dim);
    let mut cancelled = false;

    for iteration in 0..warmup {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            break;
        }
        let transition = nuts_transition(&integrator, &current, options, &mut rng);
        current.position = transition.position;
        current.potential = transition.potential;
        current.grad_potential = transition.grad_potential;

        adaptation.update(transition.accept_prob);
        integrator.set_step_size(adaptation.current_step_size());
        if iteration >= phase1_end && iteration < phase2_end {
            welford.update(&current.position);
        }
        if iteration + 1 == phase2_end && welford.count() >= 10 {
            let variance = welford.variance();
            let count = usize_to_f64(welford.count());
            let alpha = count / (count + 5.0);
            for i in 0..dim {
                inv_mass[i] = alpha.mul_add(variance[i], 1.0e-3 * (1.0 - alpha)).max(1.0e-10);
            }
            integrator = Leapfrog::new(posterior, integrator.step_size(), inv_mass.clone());
            let restart_step =
                find_reasonable_step_size(posterior, &current, &inv_mass, &mut rng);
            integrator.set_step_size(restart_step);
            adaptation = DualAveraging::new(options.target_accept, restart_step);
            debug!("chain {chain_index}: mass matrix updated, step size reset to {restart_step:.3e}");
        }
    }

    let step_size = adaptation.adapted_step_size();
    integrator.set_step_size(step_size);

    let mut trace = Trace::new(dim);
    let mut stats = AcceptanceStats::default();
    if !cancelled {
        for _ in 0..options.sampling_iterations {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }
            let transition = nuts_transition(&integrator, &current, options, &mut rng);
            current.position = transition.position;
            current.potential = transition.potential;
            current.grad_potential = transition.grad_potential;

            stats.record(transition.accept_prob, transition.divergent);
            trace.push(
                &current.position,
                -current.potential,
                transition.accept_prob,
                transition.divergent,
                transition.depth,
                transition.energy,
            );
        }
    }

    let divergences = stats.divergence_count();
    if divergences > 0 {
        warn!("chain {chain_index}: {divergences} divergent transitions after warmup");
    }
    Ok(ChainRun {
        trace,
        diagnostics: ChainDiagnostics {
            chain_index,
            step_size,
            mean_accept_prob: stats.mean_accept_prob(),
            divergences,
            cancelled,
        },
    })
}

/// Completed fit: per-chain traces and diagnostics, pooled summaries, and
/// the convergence report over completed chains.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub traces: Vec<Trace>,
    pub summaries: Vec<ParameterSummary>,
    pub convergence: ConvergenceReport,
    pub chains: Vec<ChainDiagnostics>,
}

/// The one fixed model family of the crate: Gaussian outcome, three nested
/// intercept levels, and a proper CAR spatial effect on the k-NN graph.
#[derive(Debug, Clone)]
pub struct CarModel {
    table: AreaTable,
    weights: SpatialWeights,
    hierarchy: HierarchyIndex,
    priors: PriorConfig,
}

impl CarModel {
    /// Assemble the model: validate the table, build the neighbor graph from
    /// the centroids, and index the geographic hierarchy.
    ///
    /// # Errors
    ///
    /// Returns `CarError` when the table, graph, hierarchy, or priors are
    /// invalid.
    pub fn new(
        table: AreaTable,
        neighbor_count: usize,
        layout: HierarchyLayout,
        priors: PriorConfig,
    ) -> Result<Self, CarError> {
        table.validate()?;
        if !priors.is_valid() {
            return Err(CarError::InvalidPriorConfig);
        }
        let hierarchy = HierarchyIndex::build(&table.geo_codes, layout)?;
        let weights = SpatialWeightsBuilder::new(neighbor_count).build(&table.centroids)?;
        if weights.node_count() != table.len() {
            return Err(CarError::GraphSizeMismatch {
                nodes: weights.node_count(),
                rows: table.len(),
            });
        }
        Ok(Self {
            table,
            weights,
            hierarchy,
            priors,
        })
    }

    #[must_use]
    pub const fn weights(&self) -> &SpatialWeights {
        &self.weights
    }

    #[must_use]
    pub const fn hierarchy(&self) -> &HierarchyIndex {
        &self.hierarchy
    }

    #[must_use]
    pub const fn priors(&self) -> PriorConfig {
        self.priors
    }

    /// Layout of the flat parameter vector implied by the data.
    #[must_use]
    pub fn parameter_layout(&self) -> ParameterLayout {
        ParameterLayout::new(
            self.table.covariate_count(),
            self.hierarchy.region_count(),
            self.hierarchy.subregion_count(),
            self.hierarchy.district_count(),
            self.hierarchy.leaf_count(),
        )
    }

    /// Posterior evaluator bound to this model's data.
    #[must_use]
    pub fn posterior(&self) -> CarPosterior<'_> {
        CarPosterior::new(
            &self.table.covariates,
            &self.table.outcome,
            &self.weights,
            &self.hierarchy,
            self.priors,
        )
    }

    /// Fit with independent parallel chains.
    ///
    /// # Errors
    ///
    /// Returns `CarError` for invalid options or when fewer than two chains
    /// complete.
    pub fn fit(
        &self,
        options: &FitOptions,
        multi_chain: &MultiChainOptions,
    ) -> Result<FitReport, CarError> {
        self.fit_with_cancel(options, multi_chain, &AtomicBool::new(false))
    }

    /// Fit with cooperative cancellation: the flag is checked between
    /// iterations, a cancelled chain yields a truncated trace, and the run
    /// fails unless at least two chains complete.
    ///
    /// # Errors
    ///
    /// Returns `CarError` for invalid options, a failed chain, or fewer than
    /// two completed chains.
    pub fn fit_with_cancel(
        &self,
        options: &FitOptions,
        multi_chain: &MultiChainOptions,
        cancel: &AtomicBool,
    ) -> Result<FitReport, CarError> {
        options.validate()?;
        multi_chain.validate()?;

        let posterior = self.posterior();
        let runs = sample_chains(&posterior, options, multi_chain, cancel)?;

        let completed = runs
            .iter()
            .filter(|run| run.is_complete(options))
            .cloned()
            .collect::<Vec<_>>();
        if completed.len() < 2 {
            return Err(CarError::TooFewChains {
                min: 2,
                finished: completed.len(),
            });
        }

        let layout = posterior.layout();
        let completed_traces = completed
            .iter()
            .map(|run| run.trace.clone())
            .collect::<Vec<_>>();
        let summaries = summarize_posterior(&completed_traces, &layout)?;
        let convergence = summarize_convergence(
            &completed_traces,
            &layout,
            &ConvergenceThresholds::default(),
        )?;

        Ok(FitReport {
            traces: runs.iter().map(|run| run.trace.clone()).collect(),
            summaries,
            convergence,
            chains: runs.into_iter().map(|run| run.diagnostics).collect(),
        })
    }
}

/// Fan the chains out over scoped threads, one seed per chain.
fn sample_chains(
    posterior: &CarPosterior<'_>,
    options: &FitOptions,
    multi_chain: &MultiChainOptions,
    cancel: &AtomicBool,
) -> Result<Vec<ChainRun>, CarError> {
    let mut runs = Vec::with_capacity(multi_chain.chains);
    std::thread::scope(|scope| -> Result<(), CarError> {
        let mut handles = Vec::with_capacity(multi_chain.chains);
        for index in 0..multi_chain.chains {
            let index_u64 = u64::try_from(index).unwrap_or(u64::MAX);
            let seed = options
                .seed
                .wrapping_add(index_u64.saturating_mul(multi_chain.seed_stride));
            handles.push(scope.spawn(move || run_chain(posterior, options, index, seed, cancel)));
        }
        for handle in handles {
            let run = handle.join().map_err(|_| CarError::ChainPanicked)??;
            runs.push(run);
        }
        Ok(())
    })?;
    Ok(runs)
}

fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}
