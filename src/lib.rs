#![forbid(unsafe_code)]

//! # `spatial_multilevel`
//!
//! Hierarchical Bayesian inference for area-level outcomes with nested
//! geographic intercepts and a conditional autoregressive (CAR) spatial
//! effect, sampled with multi-chain NUTS.
//!
//! The crate was initially developed for small-area health and demographic
//! analyses, but the API is intentionally domain-agnostic: any table of
//! outcomes with fixed-width geographic codes and planar centroids fits.

pub mod graph;
pub mod hierarchy;
pub mod inference;
pub mod input;
pub mod models;

pub use graph::{GraphError, KdTree, SpatialWeights, SpatialWeightsBuilder};
pub use hierarchy::{HierarchyError, HierarchyIndex, HierarchyLayout};
pub use inference::{AcceptanceStats, InferenceError, SamplerSchedule};
pub use input::{AreaInputError, AreaTable};

pub use models::car::{
    CarError, CarModel, CarPosterior, ChainDiagnostics, ChainRun, ConstrainedState,
    ConvergenceReport, ConvergenceThresholds, FitOptions, FitReport, HmcPoint, Leapfrog,
    MultiChainOptions, ParameterConvergence, ParameterLayout, ParameterSummary, PriorConfig,
    Trace, effective_sample_size, render_convergence_table, split_rhat, summarize_convergence,
    summarize_posterior,
};
