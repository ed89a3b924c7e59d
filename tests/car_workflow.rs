use faer::Mat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spatial_multilevel::{
    AreaTable, CarError, CarModel, FitOptions, HierarchyLayout, MultiChainOptions, PriorConfig,
    render_convergence_table,
};

fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Synthetic table with the deterministic nesting
/// district = leaf mod `districts`, subregion = district mod `subregions`,
/// region = subregion mod `regions`, so every child has a single parent.
fn simulate_table(
    leaves: usize,
    regions: usize,
    subregions: usize,
    districts: usize,
    intercept: f64,
    slope: f64,
    noise_sd: f64,
    seed: u64,
) -> AreaTable {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut region_effects = Vec::with_capacity(regions);
    for _ in 0..regions {
        region_effects.push(0.3 * sample_standard_normal(&mut rng));
    }
    let mut subregion_effects = Vec::with_capacity(subregions);
    for _ in 0..subregions {
        subregion_effects.push(0.2 * sample_standard_normal(&mut rng));
    }
    let mut district_effects = Vec::with_capacity(districts);
    for _ in 0..districts {
        district_effects.push(0.2 * sample_standard_normal(&mut rng));
    }

    let mut geo_codes = Vec::with_capacity(leaves);
    let mut centroids = Vec::with_capacity(leaves);
    let mut covariate = Vec::with_capacity(leaves);
    let mut outcome = Vec::with_capacity(leaves);
    for leaf in 0..leaves {
        let district = leaf % districts;
        let subregion = district % subregions;
        let region = subregion % regions;
        geo_codes.push(format!("{region}{subregion:02}{district:03}{leaf:05}"));

        let col = leaf % 25;
        let row = leaf / 25;
        centroids.push([
            usize_to_f64(col) + 0.13 * (usize_to_f64(leaf) * 0.7).sin(),
            usize_to_f64(row) + 0.13 * (usize_to_f64(leaf) * 1.3).cos(),
        ]);

        let x = sample_standard_normal(&mut rng);
        covariate.push(x);
        let mean = intercept
            + slope * x
            + region_effects[region]
            + subregion_effects[subregion]
            + district_effects[district];
        outcome.push(mean + noise_sd * sample_standard_normal(&mut rng));
    }

    AreaTable::new(
        Mat::from_fn(leaves, 1, |row, _| outcome[row]),
        Mat::from_fn(leaves, 2, |row, col| {
            if col == 0 { 1.0 } else { covariate[row] }
        }),
        geo_codes,
        centroids,
    )
}

#[test]
fn full_workflow_on_synthetic_areas_converges() {
    let table = simulate_table(500, 2, 5, 25, 1.5, -0.8, 0.5, 20_240_901);
    let model = CarModel::new(
        table,
        4,
        HierarchyLayout::default(),
        PriorConfig::default(),
    )
    .expect("model assembly should succeed");

    let options = FitOptions {
        warmup_iterations: 500,
        sampling_iterations: 500,
        seed: 7,
        ..FitOptions::default()
    };
    let multi_chain = MultiChainOptions {
        chains: 2,
        ..MultiChainOptions::default()
    };

    let report = model.fit(&options, &multi_chain).expect("fit should succeed");

    assert_eq!(report.traces.len(), 2);
    for trace in &report.traces {
        assert_eq!(trace.draw_count(), 500);
        assert!(
            trace.finite_density_fraction() >= 0.95,
            "finite fraction {} below 0.95",
            trace.finite_density_fraction()
        );
    }

    let layout = model.parameter_layout();
    assert_eq!(layout.coefficients, 2);
    assert_eq!(layout.regions, 2);
    assert_eq!(layout.subregions, 5);
    assert_eq!(layout.districts, 25);
    assert_eq!(layout.leaves, 500);
    assert_eq!(report.summaries.len(), layout.len());

    for coefficient in 0..layout.coefficients {
        let convergence = &report.convergence.parameters[coefficient];
        assert!(
            convergence.rhat < 1.01,
            "{} has split R-hat {}",
            convergence.name,
            convergence.rhat
        );
    }

    let rendered = render_convergence_table(&report.convergence).to_string();
    assert!(rendered.contains("beta[0]"));
    assert!(rendered.contains("split R-hat"));
}

#[test]
fn fit_recovers_fixed_effects_on_dense_data() {
    let intercept = 2.0;
    let slope = -1.2;
    let table = simulate_table(300, 2, 4, 12, intercept, slope, 0.3, 55);
    let model = CarModel::new(
        table,
        4,
        HierarchyLayout::default(),
        PriorConfig::default(),
    )
    .expect("model assembly should succeed");

    let options = FitOptions {
        warmup_iterations: 400,
        sampling_iterations: 400,
        seed: 99,
        ..FitOptions::default()
    };
    let multi_chain = MultiChainOptions {
        chains: 2,
        ..MultiChainOptions::default()
    };

    let report = model.fit(&options, &multi_chain).expect("fit should succeed");

    // The intercept is confounded with the group intercepts, so only the
    // slope gets a tight check.
    let slope_summary = &report.summaries[1];
    assert_eq!(slope_summary.name, "beta[1]");
    assert!(
        (slope_summary.mean - slope).abs() < 0.15,
        "slope mean {} far from {slope}",
        slope_summary.mean
    );
    assert!(
        slope_summary.q025 < slope && slope < slope_summary.q975,
        "true slope outside the 95% interval [{}, {}]",
        slope_summary.q025,
        slope_summary.q975
    );

    let intercept_summary = &report.summaries[0];
    assert!((intercept_summary.mean - intercept).abs() < 0.6);
}

#[test]
fn fit_rejects_single_chain_requests() {
    let table = simulate_table(60, 2, 3, 6, 0.0, 0.5, 0.4, 3);
    let model = CarModel::new(
        table,
        3,
        HierarchyLayout::default(),
        PriorConfig::default(),
    )
    .expect("model assembly should succeed");

    let options = FitOptions {
        warmup_iterations: 50,
        sampling_iterations: 50,
        ..FitOptions::default()
    };
    let multi_chain = MultiChainOptions {
        chains: 1,
        ..MultiChainOptions::default()
    };

    let error = model
        .fit(&options, &multi_chain)
        .expect_err("one chain must be rejected");
    assert!(matches!(error, CarError::InvalidChainCount { found: 1, .. }));
}

#[test]
fn inconsistent_parent_codes_fail_model_assembly() {
    let mut table = simulate_table(40, 2, 3, 6, 0.0, 0.5, 0.4, 11);
    // District "002" already maps to subregion "02"; point one of its leaves
    // at a different subregion segment.
    table.geo_codes[2] = "10000200002".to_string();
    let error = CarModel::new(
        table,
        3,
        HierarchyLayout::default(),
        PriorConfig::default(),
    )
    .expect_err("conflicting parents must be rejected");
    assert!(matches!(error, CarError::InvalidHierarchy(_)));
}
