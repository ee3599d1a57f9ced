use std::cell::Cell;
use std::sync::Mutex;

use approx::assert_relative_eq;
use hdfe::data::Table;
use hdfe::fixed_effects::FixedEffect;
use hdfe::formulation::{FeTerm, Formulation};
use hdfe::solving::{FixedEffectSolver, Precision, SolverMethod};
use hdfe::{
    AlternatingProjections, EstimationOptions, FixedEffectModel, FixedEffectModelResult, HdfeError,
    Save, SolverOptions, SolverSummary, VcovMethod,
};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Simulated panel `y = 2 x + α_g + ε` with six groups of ten rows.
fn grouped_panel(seed: u64) -> Table {
    let n = 60;
    let mut rng = SmallRng::seed_from_u64(seed);
    let alpha = [1.0, -2.0, 0.5, 3.0, -1.0, 2.0];
    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    let mut w = Vec::with_capacity(n);
    let mut groups = Vec::with_capacity(n);
    let mut dummies = vec![vec![0.0; n]; 5];
    for i in 0..n {
        let g = i % 6;
        let xi: f64 = StandardNormal.sample(&mut rng);
        let noise: f64 = StandardNormal.sample(&mut rng);
        x.push(xi + alpha[g]);
        y.push(2.0 * x[i] + alpha[g] + 0.5 * noise);
        w.push(rng.gen_range(0.5..2.0));
        groups.push(format!("g{g}"));
        if g > 0 {
            dummies[g - 1][i] = 1.0;
        }
    }
    let mut builder = Table::builder()
        .numeric("y", y)
        .numeric("x", x)
        .numeric("w", w)
        .numeric("one", vec![1.0; n])
        .categorical("g", groups);
    for (index, dummy) in dummies.into_iter().enumerate() {
        builder = builder.numeric(format!("d{}", index + 1), dummy);
    }
    builder.build().unwrap()
}

fn fit(
    formulation: Formulation,
    table: &Table,
    vcov: &VcovMethod,
    options: &EstimationOptions,
) -> FixedEffectModelResult {
    FixedEffectModel::new(formulation)
        .unwrap()
        .fit(table, vcov, options)
        .unwrap()
}

#[test]
fn two_identical_rows_absorb_one_group() {
    let table = Table::builder()
        .numeric("y", vec![1.0, 1.0])
        .numeric("x", vec![1.0, 2.0])
        .categorical("id", ["1", "1"])
        .build()
        .unwrap();
    let result = fit(
        Formulation::new("y").exogenous(["x"]).fixed_effect(FeTerm::new("id")),
        &table,
        &VcovMethod::Simple,
        &EstimationOptions::default(),
    );
    assert_eq!(result.nobs, 2);
    assert_eq!(result.singletons_dropped, 0);
    assert_eq!(result.dof_fes, 1);
    assert_eq!(result.dof_residual, 1);
    assert_relative_eq!(result.coef[0], 0.0, epsilon = 1e-12);
}

#[test]
fn absorbed_fixed_effect_matches_dummy_regression() {
    let table = grouped_panel(17);
    let options = EstimationOptions::default();
    let absorbed = fit(
        Formulation::new("y").exogenous(["x"]).fixed_effect(FeTerm::new("g")),
        &table,
        &VcovMethod::Simple,
        &options,
    );
    let dummies = fit(
        Formulation::new("y").exogenous(["x", "d1", "d2", "d3", "d4", "d5"]),
        &table,
        &VcovMethod::Simple,
        &options,
    );
    let beta = absorbed.coefficient("x").unwrap();
    assert_relative_eq!(beta, dummies.coefficient("x").unwrap(), epsilon = 1e-9);
    assert!((beta - 2.0).abs() < 0.5);
    // Same residual degrees of freedom, so the standard errors agree as well.
    assert_eq!(absorbed.dof_residual, dummies.dof_residual);
    assert_relative_eq!(absorbed.stderror()[0], dummies.stderror()[1], epsilon = 1e-9);
    assert_relative_eq!(absorbed.r2, dummies.r2, epsilon = 1e-9);
    assert!(absorbed.r2_within.unwrap() < absorbed.r2);
    assert!(absorbed.converged());
}

#[test]
fn unit_weights_reproduce_unweighted_estimates() {
    let table = grouped_panel(5);
    let formulation = Formulation::new("y").exogenous(["x", "d1"]);
    let unweighted = fit(formulation.clone(), &table, &VcovMethod::Robust, &EstimationOptions::default());
    let weighted = fit(
        formulation,
        &table,
        &VcovMethod::Robust,
        &EstimationOptions::default().with_weights("one"),
    );
    assert_relative_eq!(unweighted.coef, weighted.coef, epsilon = 1e-12);
    assert_relative_eq!(unweighted.vcov, weighted.vcov, epsilon = 1e-12);
}

#[test]
fn weights_give_weighted_least_squares() {
    let table = grouped_panel(9);
    let result = fit(
        Formulation::new("y").exogenous(["x"]),
        &table,
        &VcovMethod::Simple,
        &EstimationOptions::default().with_weights("w"),
    );
    let mask = vec![true; table.row_count()];
    let x = table.numeric_vector("x", &mask).unwrap();
    let y = table.numeric_vector("y", &mask).unwrap();
    let w = table.numeric_vector("w", &mask).unwrap();
    let mut design = DMatrix::from_element(x.len(), 2, 1.0);
    design.set_column(1, &x);
    let weighted_cross = design.transpose() * DMatrix::from_diagonal(&w) * &design;
    let weighted_rhs = design.transpose() * y.component_mul(&w);
    let expected = weighted_cross.lu().solve(&weighted_rhs).unwrap();
    assert_relative_eq!(result.coef, expected, epsilon = 1e-9);
}

#[test]
fn two_way_fixed_effects_match_dummies() {
    let n = 48;
    let mut rng = SmallRng::seed_from_u64(23);
    let mut builder = Table::builder();
    let mut y = Vec::with_capacity(n);
    let mut x = Vec::with_capacity(n);
    let mut firm = Vec::with_capacity(n);
    let mut year = Vec::with_capacity(n);
    let mut firm_dummies = vec![vec![0.0; n]; 7];
    let mut year_dummies = vec![vec![0.0; n]; 5];
    for i in 0..n {
        let (f, t) = (i % 8, i / 8);
        let xi: f64 = StandardNormal.sample(&mut rng);
        let noise: f64 = StandardNormal.sample(&mut rng);
        x.push(xi + 0.3 * t as f64);
        y.push(1.5 * x[i] + f as f64 - 0.5 * t as f64 + noise);
        firm.push(format!("f{f}"));
        year.push(format!("{}", 2000 + t));
        if f > 0 {
            firm_dummies[f - 1][i] = 1.0;
        }
        if t > 0 {
            year_dummies[t - 1][i] = 1.0;
        }
    }
    let mut names = vec!["x".to_string()];
    for (index, dummy) in firm_dummies.into_iter().enumerate() {
        names.push(format!("f{index}"));
        builder = builder.numeric(format!("f{index}"), dummy);
    }
    for (index, dummy) in year_dummies.into_iter().enumerate() {
        names.push(format!("t{index}"));
        builder = builder.numeric(format!("t{index}"), dummy);
    }
    let table = builder
        .numeric("y", y)
        .numeric("x", x)
        .categorical("firm", firm)
        .categorical("year", year)
        .build()
        .unwrap();

    let options = EstimationOptions::default().with_tolerance(1e-12);
    let absorbed = fit(
        Formulation::new("y")
            .exogenous(["x"])
            .fixed_effect(FeTerm::new("firm"))
            .fixed_effect(FeTerm::new("year")),
        &table,
        &VcovMethod::Simple,
        &options,
    );
    let dummies = fit(Formulation::new("y").exogenous(names), &table, &VcovMethod::Simple, &options);
    assert_relative_eq!(
        absorbed.coefficient("x").unwrap(),
        dummies.coefficient("x").unwrap(),
        epsilon = 1e-8
    );
    assert!(absorbed.converged());
    assert!(absorbed.iterations() > 1);

    let parallel = fit(
        Formulation::new("y")
            .exogenous(["x"])
            .fixed_effect(FeTerm::new("firm"))
            .fixed_effect(FeTerm::new("year")),
        &table,
        &VcovMethod::Simple,
        &options.clone().with_method(SolverMethod::Parallel),
    );
    assert_eq!(parallel.coef, absorbed.coef);

    let single = fit(
        Formulation::new("y")
            .exogenous(["x"])
            .fixed_effect(FeTerm::new("firm"))
            .fixed_effect(FeTerm::new("year")),
        &table,
        &VcovMethod::Simple,
        &EstimationOptions::default()
            .with_tolerance(1e-5)
            .with_precision(Precision::Single),
    );
    assert_relative_eq!(single.coef[0], absorbed.coef[0], epsilon = 1e-3);
}

#[test]
fn fixed_effect_nested_in_cluster_costs_one_degree_of_freedom() {
    let n = 100;
    let mut rng = SmallRng::seed_from_u64(41);
    let mut y = Vec::with_capacity(n);
    let mut x = Vec::with_capacity(n);
    let mut firm = Vec::with_capacity(n);
    let mut state = Vec::with_capacity(n);
    for i in 0..n {
        let f = i % 10;
        let xi: f64 = StandardNormal.sample(&mut rng);
        let noise: f64 = StandardNormal.sample(&mut rng);
        x.push(xi);
        y.push(xi + f as f64 + noise);
        firm.push(format!("firm{f}"));
        state.push(if f < 4 { "north" } else if f < 7 { "south" } else { "west" });
    }
    let table = Table::builder()
        .numeric("y", y)
        .numeric("x", x)
        .categorical("firm", firm)
        .categorical("state", state)
        .build()
        .unwrap();
    let formulation = Formulation::new("y").exogenous(["x"]).fixed_effect(FeTerm::new("firm"));
    let options = EstimationOptions::default();

    let clustered = fit(formulation.clone(), &table, &VcovMethod::cluster(["state"]), &options);
    assert_eq!(clustered.dof_fes, 1);
    assert_eq!(clustered.dof_residual, n - 1 - 1);
    assert_eq!(clustered.dof_tstat, 2);
    assert_eq!(clustered.nclusters, vec![("state".to_string(), 3)]);

    let robust = fit(formulation.clone(), &table, &VcovMethod::Robust, &options);
    assert_eq!(robust.dof_fes, 10);
    assert_eq!(robust.dof_residual, n - 1 - 10);
    assert_relative_eq!(robust.coef, clustered.coef, epsilon = 1e-12);

    // Nesting in one of several cluster variables is enough.
    let two_way = fit(formulation, &table, &VcovMethod::cluster(["firm", "state"]), &options);
    assert_eq!(two_way.dof_fes, 1);
    assert_eq!(two_way.nclusters.len(), 2);
    let se = two_way.stderror();
    assert!(se[0].is_finite() && se[0] > 0.0);
}

#[test]
fn collinear_columns_are_zeroed_with_nan_covariance() {
    let table = Table::builder()
        .numeric("y", vec![1.0, 2.5, 2.0, 4.5, 5.0, 5.5])
        .numeric("x1", vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
        .numeric("x2", vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0])
        .numeric("x3", vec![1.0, 0.0, 1.0, 0.0, 1.0, 1.0])
        .build()
        .unwrap();
    let result = fit(
        Formulation::new("y").exogenous(["x1", "x2", "x3"]),
        &table,
        &VcovMethod::Robust,
        &EstimationOptions::default(),
    );
    assert_eq!(result.basecoef, vec![true, true, false, true]);
    assert_eq!(result.basecoef.iter().filter(|kept| **kept).count(), result.dof);
    assert_eq!(result.coef[2], 0.0);
    for i in 0..4 {
        assert!(result.vcov[(2, i)].is_nan());
        assert!(result.vcov[(i, 2)].is_nan());
    }
    assert!(result.vcov[(1, 1)].is_finite());
    assert!(result.stderror()[2].is_nan());
}

#[test]
fn saved_fixed_effects_and_residuals_reconstruct_the_response() {
    let table = grouped_panel(3);
    let mut subset = vec![Some(true); table.row_count()];
    subset[4] = Some(false);
    subset[9] = None;
    let options = EstimationOptions::default()
        .with_weights("w")
        .with_subset(subset)
        .with_save(Save::Both);
    let result = fit(
        Formulation::new("y").exogenous(["x"]).fixed_effect(FeTerm::new("g")),
        &table,
        &VcovMethod::Simple,
        &options,
    );
    assert_eq!(result.nobs, table.row_count() - 2);
    let residuals = result.augmented.residuals.as_ref().unwrap();
    let effects = result.augmented.fixed_effect("fe_g").unwrap();
    assert_eq!(residuals.len(), table.row_count());
    assert_eq!(residuals[4], None);
    assert_eq!(effects[9], None);

    let y = table.numeric("y").unwrap();
    let x = table.numeric("x").unwrap();
    let beta = result.coefficient("x").unwrap();
    for i in 0..table.row_count() {
        if !result.esample[i] {
            continue;
        }
        let rebuilt = beta * x[i].unwrap() + effects[i].unwrap() + residuals[i].unwrap();
        assert_relative_eq!(rebuilt, y[i].unwrap(), epsilon = 1e-9);
    }
}

#[test]
fn strong_and_irrelevant_instruments() {
    let n = 200;
    let mut rng = SmallRng::seed_from_u64(99);
    let mut y = Vec::with_capacity(n);
    let mut x = Vec::with_capacity(n);
    let mut z = Vec::with_capacity(n);
    for _ in 0..n {
        let zi: f64 = StandardNormal.sample(&mut rng);
        let u: f64 = StandardNormal.sample(&mut rng);
        let v: f64 = StandardNormal.sample(&mut rng);
        let xi = zi + v + 0.5 * u;
        z.push(zi);
        x.push(xi);
        y.push(1.0 + 2.0 * xi + u);
    }
    let table = Table::builder()
        .numeric("y", y)
        .numeric("x", x)
        .numeric("z", z)
        .build()
        .unwrap();
    let strong = fit(
        Formulation::new("y").instrumented(["x"], ["z"]),
        &table,
        &VcovMethod::Robust,
        &EstimationOptions::default(),
    );
    assert!(strong.p_kp.unwrap() < 0.05);
    assert!(strong.f_kp.unwrap() > 10.0);
    assert!((strong.coefficient("x").unwrap() - 2.0).abs() < 0.3);

    // Within each (+1, -1) pair of z, x moves by 0.1, so the excluded
    // first-stage coefficient is 0.05 and r = n θ² is about 0.005.
    let weak = Table::builder()
        .numeric("y", vec![2.0, 1.0, 0.5, -1.0, 3.0, 1.5, -0.5, -2.0])
        .numeric(
            "x",
            vec![3.05, 2.95, -0.95, -1.05, 2.05, 1.95, -1.95, -2.05],
        )
        .numeric("z", vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0])
        .build()
        .unwrap();
    let result = fit(
        Formulation::new("y").instrumented(["x"], ["z"]),
        &weak,
        &VcovMethod::Simple,
        &EstimationOptions::default(),
    );
    assert!(result.p_kp.unwrap() > 0.5);

    let skipped = fit(
        Formulation::new("y").instrumented(["x"], ["z"]),
        &table,
        &VcovMethod::Simple,
        &EstimationOptions::default().with_first_stage(false),
    );
    assert!(skipped.f_kp.is_none() && skipped.p_kp.is_none());
}

#[test]
fn singletons_are_dropped_before_estimation() {
    let table = Table::builder()
        .numeric("y", vec![1.0, 2.0, 3.0, 4.0, 5.0, 7.0])
        .numeric("x", vec![0.5, 1.0, 2.0, 2.5, 3.0, 1.0])
        .categorical("id", ["a", "a", "b", "b", "b", "c"])
        .build()
        .unwrap();
    let formulation = Formulation::new("y").exogenous(["x"]).fixed_effect(FeTerm::new("id"));
    let result = fit(formulation.clone(), &table, &VcovMethod::Simple, &EstimationOptions::default());
    assert_eq!(result.singletons_dropped, 1);
    assert_eq!(result.esample, vec![true, true, true, true, true, false]);
    assert_eq!(result.nobs, 5);

    let kept = fit(
        formulation,
        &table,
        &VcovMethod::Simple,
        &EstimationOptions::default().with_drop_singletons(false),
    );
    assert_eq!(kept.nobs, 6);
    assert_relative_eq!(kept.coef, result.coef, epsilon = 1e-10);
}

#[test]
fn invalid_inputs_are_reported() {
    let table = Table::builder()
        .numeric("y", vec![1.0, 2.0, 3.0])
        .numeric("x", vec![1.0, f64::INFINITY, 0.0])
        .numeric("z", vec![1.0, 0.0, 2.0])
        .build()
        .unwrap();
    let model = FixedEffectModel::new(Formulation::new("y").exogenous(["x"])).unwrap();
    let err = model
        .fit(&table, &VcovMethod::Simple, &EstimationOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        HdfeError::NonFiniteValue {
            block: "exogenous regressors"
        }
    ));

    let err = model
        .fit(
            &table,
            &VcovMethod::Simple,
            &EstimationOptions::default().with_subset(vec![Some(true)]),
        )
        .unwrap_err();
    assert!(matches!(err, HdfeError::LengthMismatch { .. }));

    let err = FixedEffectModel::new(Formulation::new("y").instrumented(["x", "z"], ["z"]))
        .unwrap_err();
    assert!(matches!(
        err,
        HdfeError::NotIdentified {
            instruments: 1,
            endogenous: 2
        }
    ));

    let err = model
        .fit(&table, &VcovMethod::Simple, &EstimationOptions::default().with_weights("w"))
        .unwrap_err();
    assert!(matches!(err, HdfeError::UnknownColumn { .. }));
}

#[test]
fn repeated_estimation_is_deterministic() {
    let table = grouped_panel(11);
    let formulation = Formulation::new("y").exogenous(["x"]).fixed_effect(FeTerm::new("g"));
    let options = EstimationOptions::default().with_method(SolverMethod::Parallel);
    let first = fit(formulation.clone(), &table, &VcovMethod::Robust, &options);
    let second = fit(formulation, &table, &VcovMethod::Robust, &options);
    assert_eq!(first.coef, second.coef);
    assert_eq!(first.vcov, second.vcov);
}

/// Wraps the default solver and counts how often it is called.
struct CountingSolver {
    inner: AlternatingProjections,
    calls: Cell<usize>,
}

impl FixedEffectSolver for CountingSolver {
    fn residualize(
        &self,
        columns: Vec<DVector<f64>>,
        fixed_effects: &[FixedEffect],
        sqrt_weights: &DVector<f64>,
    ) -> hdfe::Result<(Vec<DVector<f64>>, SolverSummary)> {
        self.calls.set(self.calls.get() + 1);
        self.inner.residualize(columns, fixed_effects, sqrt_weights)
    }

    fn recover(
        &self,
        column: &DVector<f64>,
        fixed_effects: &[FixedEffect],
        sqrt_weights: &DVector<f64>,
    ) -> hdfe::Result<(Vec<DVector<f64>>, SolverSummary)> {
        self.calls.set(self.calls.get() + 1);
        self.inner.recover(column, fixed_effects, sqrt_weights)
    }
}

#[test]
fn solver_can_be_substituted() {
    let table = grouped_panel(13);
    let solver = CountingSolver {
        inner: AlternatingProjections::new(SolverOptions::default()),
        calls: Cell::new(0),
    };
    let model = FixedEffectModel::new(
        Formulation::new("y").exogenous(["x"]).fixed_effect(FeTerm::new("g")),
    )
    .unwrap();
    let options = EstimationOptions::default().with_save(Save::FixedEffects);
    let custom = model
        .fit_with_solver(&table, &VcovMethod::Simple, &options, &solver)
        .unwrap();
    assert_eq!(solver.calls.get(), 2);
    let default = model.fit(&table, &VcovMethod::Simple, &options).unwrap();
    assert_eq!(custom.coef, default.coef);
}

/// Collects every log record emitted while the tests run.
struct CapturedLog;

static MESSAGES: Mutex<Vec<String>> = Mutex::new(Vec::new());
static CAPTURED_LOG: CapturedLog = CapturedLog;

impl log::Log for CapturedLog {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        if let Ok(mut messages) = MESSAGES.lock() {
            messages.push(format!("{} {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

fn captured_warnings_containing(needle: &str) -> usize {
    MESSAGES
        .lock()
        .unwrap()
        .iter()
        .filter(|message| message.starts_with("WARN") && message.contains(needle))
        .count()
}

/// Solves exactly but reports that it ran out of iterations.
struct StalledSolver {
    inner: AlternatingProjections,
    iterations: usize,
}

impl StalledSolver {
    fn stalled(&self) -> SolverSummary {
        SolverSummary {
            iterations: self.iterations,
            converged: false,
        }
    }
}

impl FixedEffectSolver for StalledSolver {
    fn residualize(
        &self,
        columns: Vec<DVector<f64>>,
        fixed_effects: &[FixedEffect],
        sqrt_weights: &DVector<f64>,
    ) -> hdfe::Result<(Vec<DVector<f64>>, SolverSummary)> {
        let (columns, _) = self.inner.residualize(columns, fixed_effects, sqrt_weights)?;
        Ok((columns, self.stalled()))
    }

    fn recover(
        &self,
        column: &DVector<f64>,
        fixed_effects: &[FixedEffect],
        sqrt_weights: &DVector<f64>,
    ) -> hdfe::Result<(Vec<DVector<f64>>, SolverSummary)> {
        let (effects, _) = self.inner.recover(column, fixed_effects, sqrt_weights)?;
        Ok((effects, self.stalled()))
    }
}

#[test]
fn non_convergence_of_any_solver_is_warned_and_estimation_proceeds() {
    let _ = log::set_logger(&CAPTURED_LOG);
    log::set_max_level(log::LevelFilter::Trace);

    let table = grouped_panel(17);
    let solver = StalledSolver {
        inner: AlternatingProjections::new(SolverOptions::default()),
        iterations: 4_242,
    };
    let model = FixedEffectModel::new(
        Formulation::new("y").exogenous(["x"]).fixed_effect(FeTerm::new("g")),
    )
    .unwrap();
    let options = EstimationOptions::default().with_save(Save::FixedEffects);
    let result = model
        .fit_with_solver(&table, &VcovMethod::Simple, &options, &solver)
        .unwrap();
    assert!(!result.converged());
    assert_eq!(result.iterations(), 4_242);
    assert!(result.coef.iter().all(|value| value.is_finite()));

    assert!(captured_warnings_containing("convergence not achieved in 4242 iterations") >= 1);
    assert!(captured_warnings_containing("recovery did not converge in 4242 iterations") >= 1);
}

#[test]
fn options_round_trip_through_json() {
    let options = EstimationOptions::default()
        .with_weights("w")
        .with_save(Save::Both)
        .with_method(SolverMethod::Parallel)
        .with_dof_add(2);
    let encoded = serde_json::to_string(&options).unwrap();
    let decoded: EstimationOptions = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, options);

    let partial: EstimationOptions =
        serde_json::from_str(r#"{"drop_singletons": false, "solver": {"precision": "single"}}"#)
            .unwrap();
    assert!(!partial.drop_singletons);
    assert_eq!(partial.solver.precision, Precision::Single);
    assert_eq!(partial.solver.max_iterations, 10_000);
    assert_eq!(partial.save, Save::None);

    let vcov: VcovMethod = serde_json::from_str(r#"{"cluster": ["firm", "year"]}"#).unwrap();
    assert_eq!(vcov, VcovMethod::cluster(["firm", "year"]));
}
