//! Prior specifications and log-density helpers for the CAR model.
//!
//! All scale parameters carry half-normal priors and are sampled on the log
//! scale; the helpers below fold the change-of-variable Jacobian into both
//! the density and its derivative so the sampler only ever sees an
//! unconstrained coordinate. The spatial mixing weight `rho` carries a Beta
//! prior handled the same way on the logit scale.

use statrs::function::gamma::ln_gamma;

/// Hyperparameters for the CAR model prior set.
#[derive(Debug, Clone, Copy)]
pub struct PriorConfig {
    /// Variance for the Normal(0, variance) prior on fixed-effect coefficients.
    pub coefficient_variance: f64,
    /// Half-normal scale for the region intercept standard deviation.
    pub region_scale: f64,
    /// Half-normal scale for the subregion intercept standard deviation.
    pub subregion_scale: f64,
    /// Half-normal scale for the district intercept standard deviation.
    pub district_scale: f64,
    /// Half-normal scale for the CAR spatial standard deviation `tau`.
    pub spatial_scale: f64,
    /// Half-normal scale for the observation noise standard deviation.
    pub noise_scale: f64,
    /// First shape parameter of the Beta prior on `rho`.
    pub rho_shape_a: f64,
    /// Second shape parameter of the Beta prior on `rho`.
    pub rho_shape_b: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            coefficient_variance: 100.0,
            region_scale: 1.0,
            subregion_scale: 1.0,
            district_scale: 1.0,
            spatial_scale: 1.0,
            noise_scale: 1.0,
            rho_shape_a: 2.0,
            rho_shape_b: 2.0,
        }
    }
}

impl PriorConfig {
    /// Whether all prior hyperparameters are numerically valid.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.coefficient_variance > 0.0
            && self.region_scale > 0.0
            && self.subregion_scale > 0.0
            && self.district_scale > 0.0
            && self.spatial_scale > 0.0
            && self.noise_scale > 0.0
            && self.rho_shape_a > 0.0
            && self.rho_shape_b > 0.0
    }
}

/// Log-density for `Normal(0, variance)`.
#[must_use]
pub fn log_zero_mean_normal_density(value: f64, variance: f64) -> f64 {
    if variance <= 0.0 {
        return f64::NEG_INFINITY;
    }
    -0.5 * (std::f64::consts::TAU.ln() + variance.ln() + value * value / variance)
}

/// Derivative of [`log_zero_mean_normal_density`] with respect to `value`.
#[must_use]
pub fn d_log_zero_mean_normal_density(value: f64, variance: f64) -> f64 {
    -value / variance
}

/// Log-density for a half-normal scale evaluated at `log_sigma`, including
/// the `log` change-of-variable Jacobian.
///
/// For `t = ln(sigma)` and half-normal scale `s`:
/// `lp(t) = 0.5 ln(2 / pi) - ln(s) - exp(2t) / (2 s^2) + t`.
#[must_use]
pub fn log_half_normal_log_scale(log_sigma: f64, scale: f64) -> f64 {
    if scale <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let sigma_sq = (2.0 * log_sigma).exp();
    0.5f64.mul_add(
        (2.0 / std::f64::consts::PI).ln(),
        -scale.ln() - sigma_sq / (2.0 * scale * scale) + log_sigma,
    )
}

/// Derivative of [`log_half_normal_log_scale`] with respect to `log_sigma`.
#[must_use]
pub fn d_log_half_normal_log_scale(log_sigma: f64, scale: f64) -> f64 {
    let sigma_sq = (2.0 * log_sigma).exp();
    1.0 - sigma_sq / (scale * scale)
}

/// Log-density for a `Beta(a, b)` variable evaluated at `logit_rho`,
/// including the sigmoid Jacobian.
///
/// With `rho = sigmoid(l)` the Jacobian `ln(rho (1 - rho))` absorbs the
/// `-1` in both Beta exponents:
/// `lp(l) = a ln(rho) + b ln(1 - rho) - ln B(a, b)`.
#[must_use]
pub fn log_beta_logit_scale(logit_rho: f64, shape_a: f64, shape_b: f64) -> f64 {
    if shape_a <= 0.0 || shape_b <= 0.0 {
        return f64::NEG_INFINITY;
    }
    // ln(rho) and ln(1 - rho) via softplus for stability at large |l|.
    let log_rho = -softplus(-logit_rho);
    let log_one_minus_rho = -softplus(logit_rho);
    shape_a.mul_add(
        log_rho,
        shape_b.mul_add(log_one_minus_rho, -ln_beta(shape_a, shape_b)),
    )
}

/// Derivative of [`log_beta_logit_scale`] with respect to `logit_rho`.
#[must_use]
pub fn d_log_beta_logit_scale(logit_rho: f64, shape_a: f64, shape_b: f64) -> f64 {
    let rho = sigmoid(logit_rho);
    (shape_a + shape_b).mul_add(-rho, shape_a)
}

/// Numerically stable sigmoid.
#[must_use]
pub fn sigmoid(value: f64) -> f64 {
    if value >= 0.0 {
        1.0 / (1.0 + (-value).exp())
    } else {
        let expv = value.exp();
        expv / (1.0 + expv)
    }
}

fn softplus(value: f64) -> f64 {
    if value > 30.0 {
        value
    } else {
        value.exp().ln_1p()
    }
}

fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn finite_difference<F: Fn(f64) -> f64>(f: F, at: f64) -> f64 {
        let h = 1.0e-6;
        (f(at + h) - f(at - h)) / (2.0 * h)
    }

    #[test]
    fn prior_defaults_are_valid() {
        assert!(PriorConfig::default().is_valid());
    }

    #[test]
    fn invalid_scale_is_rejected() {
        let config = PriorConfig {
            spatial_scale: 0.0,
            ..PriorConfig::default()
        };
        assert!(!config.is_valid());
    }

    #[test]
    fn half_normal_gradient_matches_finite_difference() {
        for &log_sigma in &[-1.5, -0.2, 0.0, 0.7] {
            let analytic = d_log_half_normal_log_scale(log_sigma, 1.3);
            let numeric = finite_difference(|t| log_half_normal_log_scale(t, 1.3), log_sigma);
            assert_relative_eq!(analytic, numeric, epsilon = 1.0e-6);
        }
    }

    #[test]
    fn beta_logit_gradient_matches_finite_difference() {
        for &logit_rho in &[-2.0, -0.3, 0.0, 1.4] {
            let analytic = d_log_beta_logit_scale(logit_rho, 2.0, 3.0);
            let numeric = finite_difference(|l| log_beta_logit_scale(l, 2.0, 3.0), logit_rho);
            assert_relative_eq!(analytic, numeric, epsilon = 1.0e-6);
        }
    }

    #[test]
    fn beta_logit_density_integrates_symmetric_case() {
        // Beta(1, 1) on the logit scale is the standard logistic density.
        let at_zero = log_beta_logit_scale(0.0, 1.0, 1.0);
        assert_relative_eq!(at_zero.exp(), 0.25, epsilon = 1.0e-12);
    }

    #[test]
    fn sigmoid_saturates_without_overflow() {
        assert_relative_eq!(sigmoid(800.0), 1.0);
        assert_relative_eq!(sigmoid(-800.0), 0.0);
        assert_relative_eq!(sigmoid(0.0), 0.5);
    }
}
