//! Hierarchical Gaussian model with a conditional autoregressive (CAR)
//! spatial effect.
//!
//! The module fits exactly one model family: a Gaussian outcome with fixed
//! effects, three nested geographic intercept levels, and a proper CAR
//! spatial field over the k-nearest-neighbor graph, sampled with multi-chain
//! NUTS.

pub mod diagnostics;
pub mod params;
pub mod posterior;
pub mod priors;
pub mod sampler;
pub mod trace;
pub mod types;

pub use diagnostics::{
    ConvergenceReport, ConvergenceThresholds, ParameterConvergence, effective_sample_size,
    render_convergence_table, split_rhat, summarize_convergence,
};
pub use params::{ConstrainedState, ParameterLayout};
pub use posterior::CarPosterior;
pub use priors::PriorConfig;
pub use sampler::{CarModel, ChainRun, FitReport, HmcPoint, Leapfrog};
pub use trace::{ParameterSummary, Trace, summarize_posterior};
pub use types::{CarError, ChainDiagnostics, FitOptions, MultiChainOptions};
