//! Flat unconstrained parameter vector layout for the CAR model.
//!
//! The sampler works on one contiguous `Vec<f64>` ordered as
//! `[beta | u_region | u_subregion | u_district | phi | log scales | logit rho]`.
//! Scales live on the log scale and `rho` on the logit scale, so every
//! coordinate is unconstrained; the constrained view is recovered with
//! [`ParameterLayout::constrained`].

use std::ops::Range;

use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

use super::priors::sigmoid;

/// Number of scalar parameters after the block sections: five log scales
/// plus the logit mixing weight.
const TAIL_LEN: usize = 6;

/// Index map for the flat unconstrained parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    pub coefficients: usize,
    pub regions: usize,
    pub subregions: usize,
    pub districts: usize,
    pub leaves: usize,
}

impl ParameterLayout {
    #[must_use]
    pub const fn new(
        coefficients: usize,
        regions: usize,
        subregions: usize,
        districts: usize,
        leaves: usize,
    ) -> Self {
        Self {
            coefficients,
            regions,
            subregions,
            districts,
            leaves,
        }
    }

    /// Total length of the flat vector.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.coefficients + self.regions + self.subregions + self.districts + self.leaves + TAIL_LEN
    }

    /// Always `false`: the tail scalars are present for every layout.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn beta(&self) -> Range<usize> {
        0..self.coefficients
    }

    #[must_use]
    pub const fn region_effects(&self) -> Range<usize> {
        let start = self.coefficients;
        start..start + self.regions
    }

    #[must_use]
    pub const fn subregion_effects(&self) -> Range<usize> {
        let start = self.coefficients + self.regions;
        start..start + self.subregions
    }

    #[must_use]
    pub const fn district_effects(&self) -> Range<usize> {
        let start = self.coefficients + self.regions + self.subregions;
        start..start + self.districts
    }

    #[must_use]
    pub const fn spatial_effects(&self) -> Range<usize> {
        let start = self.coefficients + self.regions + self.subregions + self.districts;
        start..start + self.leaves
    }

    const fn tail_start(&self) -> usize {
        self.coefficients + self.regions + self.subregions + self.districts + self.leaves
    }

    #[must_use]
    pub const fn log_region_sd(&self) -> usize {
        self.tail_start()
    }

    #[must_use]
    pub const fn log_subregion_sd(&self) -> usize {
        self.tail_start() + 1
    }

    #[must_use]
    pub const fn log_district_sd(&self) -> usize {
        self.tail_start() + 2
    }

    #[must_use]
    pub const fn log_spatial_sd(&self) -> usize {
        self.tail_start() + 3
    }

    #[must_use]
    pub const fn log_noise_sd(&self) -> usize {
        self.tail_start() + 4
    }

    #[must_use]
    pub const fn logit_rho(&self) -> usize {
        self.tail_start() + 5
    }

    /// Human-readable name for the parameter at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range for the layout.
    #[must_use]
    pub fn parameter_name(&self, index: usize) -> String {
        assert!(index < self.len(), "parameter index out of range");
        if self.beta().contains(&index) {
            return format!("beta[{index}]");
        }
        if self.region_effects().contains(&index) {
            return format!("u_region[{}]", index - self.region_effects().start);
        }
        if self.subregion_effects().contains(&index) {
            return format!("u_subregion[{}]", index - self.subregion_effects().start);
        }
        if self.district_effects().contains(&index) {
            return format!("u_district[{}]", index - self.district_effects().start);
        }
        if self.spatial_effects().contains(&index) {
            return format!("phi[{}]", index - self.spatial_effects().start);
        }
        match index - self.tail_start() {
            0 => "log_sigma_region".to_string(),
            1 => "log_sigma_subregion".to_string(),
            2 => "log_sigma_district".to_string(),
            3 => "log_tau".to_string(),
            4 => "log_sigma_noise".to_string(),
            _ => "logit_rho".to_string(),
        }
    }

    /// Random starting position: small Gaussian jitter on every block and a
    /// mild negative offset on the log scales so chains start with modest
    /// variances.
    #[must_use]
    pub fn initial_position(&self, rng: &mut StdRng) -> Vec<f64> {
        let mut position = (0..self.len())
            .map(|_| 0.1 * rng.sample::<f64, _>(StandardNormal))
            .collect::<Vec<_>>();
        for index in self.log_region_sd()..=self.log_noise_sd() {
            position[index] -= 0.5;
        }
        position[self.logit_rho()] = 0.4 * (rng.random::<f64>() - 0.5);
        position
    }

    /// Constrained view of an unconstrained position.
    ///
    /// # Panics
    ///
    /// Panics if `position` does not match the layout length.
    #[must_use]
    pub fn constrained(&self, position: &[f64]) -> ConstrainedState {
        assert_eq!(position.len(), self.len(), "position length mismatch");
        ConstrainedState {
            beta: position[self.beta()].to_vec(),
            region_effects: position[self.region_effects()].to_vec(),
            subregion_effects: position[self.subregion_effects()].to_vec(),
            district_effects: position[self.district_effects()].to_vec(),
            spatial_effects: position[self.spatial_effects()].to_vec(),
            sigma_region: position[self.log_region_sd()].exp(),
            sigma_subregion: position[self.log_subregion_sd()].exp(),
            sigma_district: position[self.log_district_sd()].exp(),
            tau: position[self.log_spatial_sd()].exp(),
            sigma_noise: position[self.log_noise_sd()].exp(),
            rho: sigmoid(position[self.logit_rho()]),
        }
    }
}

/// Natural-scale parameter values extracted from a flat position.
#[derive(Debug, Clone)]
pub struct ConstrainedState {
    pub beta: Vec<f64>,
    pub region_effects: Vec<f64>,
    pub subregion_effects: Vec<f64>,
    pub district_effects: Vec<f64>,
    pub spatial_effects: Vec<f64>,
    pub sigma_region: f64,
    pub sigma_subregion: f64,
    pub sigma_district: f64,
    pub tau: f64,
    pub sigma_noise: f64,
    pub rho: f64,
}
