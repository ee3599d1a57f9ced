//! Estimation pipeline for OLS and IV models with absorbed fixed effects.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::basis::{basis, joint_basis, restrict_columns};
use crate::data::Table;
use crate::demean::AlternatingProjections;
use crate::error::{HdfeError, Result};
use crate::fixed_effects::FixedEffect;
use crate::formulation::Formulation;
use crate::options::EstimationOptions;
use crate::ranktest::rank_test;
use crate::result::{
    expand_coefficients, expand_covariance, scatter, AugmentedData, FixedEffectModelResult,
};
use crate::sample::{select_sample, SampleRequest};
use crate::solving::{FixedEffectSolver, SolverSummary};
use crate::two_stage::{self, hcat};
use crate::vcov::{wald_test, VcovData, VcovMethod};

/// A linear model `y ~ exogenous + (endogenous ~ instruments) + fixed effects`.
#[derive(Clone, Debug)]
pub struct FixedEffectModel {
    formulation: Formulation,
}

impl FixedEffectModel {
    /// Validates the formulation and creates a model.
    pub fn new(formulation: Formulation) -> Result<Self> {
        let endogenous = formulation.endogenous_columns().len();
        let instruments = formulation.instrument_columns().len();
        if endogenous == 0 && instruments > 0 {
            return Err(HdfeError::invalid(
                "instruments were given without endogenous regressors",
            ));
        }
        if instruments < endogenous {
            return Err(HdfeError::NotIdentified {
                instruments,
                endogenous,
            });
        }
        Ok(Self { formulation })
    }

    pub fn formulation(&self) -> &Formulation {
        &self.formulation
    }

    /// Estimates the model with the default alternating projections solver.
    pub fn fit(
        &self,
        table: &Table,
        vcov: &VcovMethod,
        options: &EstimationOptions,
    ) -> Result<FixedEffectModelResult> {
        let solver = AlternatingProjections::new(options.solver.clone());
        self.fit_with_solver(table, vcov, options, &solver)
    }

    /// Estimates the model, absorbing fixed effects with `solver`.
    pub fn fit_with_solver<S: FixedEffectSolver + ?Sized>(
        &self,
        table: &Table,
        vcov: &VcovMethod,
        options: &EstimationOptions,
        solver: &S,
    ) -> Result<FixedEffectModelResult> {
        // Sample selection over every table row.
        let all_fes = self
            .formulation
            .fixed_effects()
            .iter()
            .map(|term| FixedEffect::from_term(table, term))
            .collect::<Result<Vec<_>>>()?;
        let request = SampleRequest {
            formulation: &self.formulation,
            weights: options.weights.as_deref(),
            subset: options.subset.as_deref(),
            clusters: vcov.cluster_columns(),
            drop_singletons: options.drop_singletons,
        };
        let selection = select_sample(table, &request, &all_fes)?;
        let esample = selection.mask.clone();
        let nobs = selection.nobs();

        let has_fe_intercept = self.formulation.fixed_effects_imply_intercept();
        let formulation = if has_fe_intercept {
            self.formulation.without_intercept()
        } else {
            self.formulation.clone()
        };
        let has_intercept = formulation.has_intercept();
        let centered = has_intercept || has_fe_intercept;

        let fes: Vec<FixedEffect> = all_fes.iter().map(|fe| fe.restrict(&esample)).collect();
        let estimator = vcov.resolve(table, &esample)?;

        let weights = match &options.weights {
            Some(column) => table.numeric_vector(column, &esample)?,
            None => DVector::from_element(nobs, 1.0),
        };
        let sqrt_weights = weights.map(f64::sqrt);

        // Design matrices on the original scale.
        let original = Design::extract(&formulation, table, &esample)?;
        original.check_finite()?;
        let tss_total = total_sum_of_squares(&original.y, &weights, centered);
        let reference = original.weighted_norms(&weights);

        // Absorb the fixed effects.
        let (mut design, summary) = if fes.is_empty() {
            (original.clone(), SolverSummary::trivial())
        } else {
            let (columns, summary) = solver.residualize(original.columns(), &fes, &sqrt_weights)?;
            if !summary.converged {
                warn!(
                    "convergence not achieved in {} iterations (tolerance {}); try increasing \
                     max_iterations or decreasing the tolerance",
                    summary.iterations, options.solver.tolerance
                );
            }
            (original.with_columns(columns), summary)
        };
        design.check_finite()?;
        let tss_partial = total_sum_of_squares(&design.y, &weights, centered);
        design.scale_rows(&sqrt_weights);

        // Drop collinear columns.
        let reduced = design.reduce(&reference)?;
        let n_kept = reduced.positions.len();
        debug!(
            "{} of {} regressors kept after collinearity checks",
            n_kept,
            original.n_regressors()
        );

        let instrumented = formulation
            .has_iv()
            .then_some((&reduced.endogenous, &reduced.instruments));
        let fit = two_stage::fit(&design.y, &reduced.exogenous, instrumented)?;

        // Degrees of freedom and covariance.
        let dof_fes = estimator.dof_absorbed(&fes);
        let dof_residual = nobs
            .saturating_sub(n_kept + dof_fes + options.dof_add)
            .max(1);
        let dof_tstat = estimator.dof_tstat(dof_residual);
        let vcov_data = VcovData {
            model_matrix: &fit.hat,
            cross: &fit.cross,
            residuals: &fit.residuals,
            dof_residual,
        };
        let covariance = estimator.covariance(&vcov_data);

        let intercept_kept = has_intercept && reduced.positions.first() == Some(&0);
        let (f_stat, p_value) =
            wald_test(&fit.coefficients, &covariance, intercept_kept, dof_residual);

        let rss = fit.residuals.norm_squared();
        let r2 = 1.0 - rss / tss_total;
        let adjr2 = 1.0
            - rss / tss_total * (nobs - usize::from(centered)) as f64 / dof_residual as f64;
        let r2_within = (!fes.is_empty()).then(|| 1.0 - rss / tss_partial);

        let (f_kp, p_kp) = match (&fit.first_stage, options.first_stage) {
            (Some(first), true) if reduced.endogenous.ncols() > 0 => {
                let dof = nobs.saturating_sub(n_kept + dof_fes);
                let test = rank_test(
                    &first.endogenous_residuals,
                    &first.instrument_residuals,
                    &first.excluded_coefficients(),
                    &estimator,
                    dof,
                );
                (
                    Some(test.map_or(f64::NAN, |t| t.f_statistic)),
                    Some(test.map_or(f64::NAN, |t| t.p_value)),
                )
            }
            _ => (None, None),
        };

        // Report in the original column order.
        let total = original.n_regressors();
        let (coefficients, covariance) =
            original_order(&reduced.positions, &fit.coefficients, &covariance);
        let mut basecoef = vec![false; total];
        for position in &reduced.positions {
            basecoef[*position] = true;
        }
        let coef = expand_coefficients(&coefficients, &basecoef);
        let vcov_full = expand_covariance(&covariance, &basecoef);

        let mut augmented = AugmentedData::default();
        if options.save.residuals() {
            let residuals = fit.residuals.component_div(&sqrt_weights);
            augmented.residuals = Some(scatter(&residuals, &esample));
        }
        if options.save.fixed_effects() && !fes.is_empty() {
            let fitted = original.regressors() * &coef;
            let (effects, recovery) =
                solver.recover(&(&original.y - fitted), &fes, &sqrt_weights)?;
            if !recovery.converged {
                warn!(
                    "fixed effect recovery did not converge in {} iterations (tolerance {})",
                    recovery.iterations, options.solver.tolerance
                );
            }
            augmented.fixed_effects = formulation
                .fixed_effects()
                .iter()
                .zip(&effects)
                .map(|(term, values)| (term.key(), scatter(values, &esample)))
                .collect();
        }

        let nclusters = vcov
            .cluster_columns()
            .iter()
            .cloned()
            .zip(estimator.nclusters())
            .collect();

        Ok(FixedEffectModelResult {
            coef,
            vcov: vcov_full,
            coef_names: formulation.coef_names(),
            basecoef,
            response_name: formulation.response().to_string(),
            esample,
            nobs,
            dof: n_kept,
            dof_fes,
            dof_residual,
            dof_tstat,
            has_intercept,
            has_fe_intercept,
            r2,
            adjr2,
            r2_within,
            f_stat,
            p_value,
            f_kp,
            p_kp,
            nclusters,
            singletons_dropped: selection.singletons_dropped,
            solver: summary,
            augmented,
        })
    }
}

/// Response and regressor blocks, row-aligned to the estimation sample.
#[derive(Clone, Debug)]
struct Design {
    y: DVector<f64>,
    exogenous: DMatrix<f64>,
    endogenous: DMatrix<f64>,
    instruments: DMatrix<f64>,
}

/// Blocks after collinear columns are removed.
struct ReducedDesign {
    exogenous: DMatrix<f64>,
    endogenous: DMatrix<f64>,
    instruments: DMatrix<f64>,
    /// Original coefficient position of each reduced regressor, exogenous first.
    positions: Vec<usize>,
}

impl Design {
    fn extract(formulation: &Formulation, table: &Table, mask: &[bool]) -> Result<Self> {
        Ok(Self {
            y: formulation.response_vector(table, mask)?,
            exogenous: formulation.exogenous_matrix(table, mask)?,
            endogenous: formulation.endogenous_matrix(table, mask)?,
            instruments: formulation.instrument_matrix(table, mask)?,
        })
    }

    fn n_regressors(&self) -> usize {
        self.exogenous.ncols() + self.endogenous.ncols()
    }

    /// `[exogenous | endogenous]`, in coefficient order.
    fn regressors(&self) -> DMatrix<f64> {
        hcat(&self.exogenous, &self.endogenous)
    }

    fn check_finite(&self) -> Result<()> {
        let blocks: [(&'static str, &[f64]); 4] = [
            ("response", self.y.as_slice()),
            ("exogenous regressors", self.exogenous.as_slice()),
            ("endogenous regressors", self.endogenous.as_slice()),
            ("instruments", self.instruments.as_slice()),
        ];
        for (block, values) in blocks {
            if values.iter().any(|value| !value.is_finite()) {
                return Err(HdfeError::NonFiniteValue { block });
            }
        }
        Ok(())
    }

    /// Every column, response first, for the fixed-effect solver.
    fn columns(&self) -> Vec<DVector<f64>> {
        let mut columns = vec![self.y.clone()];
        for block in [&self.exogenous, &self.endogenous, &self.instruments] {
            columns.extend(block.column_iter().map(|column| column.into_owned()));
        }
        columns
    }

    /// Rebuilds the design from columns laid out as in [`Design::columns`].
    fn with_columns(&self, columns: Vec<DVector<f64>>) -> Self {
        let n = self.y.len();
        let mut columns = columns.into_iter();
        let mut take = |count: usize| -> DMatrix<f64> {
            let block: Vec<DVector<f64>> = columns.by_ref().take(count).collect();
            if block.is_empty() {
                DMatrix::zeros(n, 0)
            } else {
                DMatrix::from_columns(&block)
            }
        };
        let y = take(1).column(0).into_owned();
        Self {
            y,
            exogenous: take(self.exogenous.ncols()),
            endogenous: take(self.endogenous.ncols()),
            instruments: take(self.instruments.ncols()),
        }
    }

    /// Weighted squared norms of each regressor block.
    fn weighted_norms(&self, weights: &DVector<f64>) -> [Vec<f64>; 3] {
        let norms = |block: &DMatrix<f64>| -> Vec<f64> {
            block
                .column_iter()
                .map(|column| column.component_mul(&column).dot(weights))
                .collect()
        };
        [
            norms(&self.exogenous),
            norms(&self.endogenous),
            norms(&self.instruments),
        ]
    }

    fn scale_rows(&mut self, sqrt_weights: &DVector<f64>) {
        self.y.component_mul_assign(sqrt_weights);
        for block in [&mut self.exogenous, &mut self.endogenous, &mut self.instruments] {
            for mut column in block.column_iter_mut() {
                column.component_mul_assign(sqrt_weights);
            }
        }
    }

    /// Removes collinear columns. With instruments, endogenous regressors are
    /// reduced first, then checked jointly after the exogenous regressors and
    /// instruments; endogenous columns found collinear at that stage are
    /// treated as exogenous.
    fn reduce(&self, reference: &[Vec<f64>; 3]) -> Result<ReducedDesign> {
        let [ref_exo, ref_endo, ref_z] = reference;
        let mut exo_positions: Vec<usize> = (0..self.exogenous.ncols()).collect();

        if self.endogenous.ncols() == 0 && self.instruments.ncols() == 0 {
            let keep = basis(&self.exogenous, Some(ref_exo.as_slice()));
            return Ok(ReducedDesign {
                exogenous: restrict_columns(&self.exogenous, &keep),
                endogenous: DMatrix::zeros(self.y.len(), 0),
                instruments: DMatrix::zeros(self.y.len(), 0),
                positions: select(&exo_positions, &keep),
            });
        }

        let keep_endo = basis(&self.endogenous, Some(ref_endo.as_slice()));
        let offset = self.exogenous.ncols();
        let mut endo_positions: Vec<usize> = select(
            &(offset..offset + self.endogenous.ncols()).collect::<Vec<_>>(),
            &keep_endo,
        );
        let mut endogenous = restrict_columns(&self.endogenous, &keep_endo);
        let mut ref_endo = select(ref_endo, &keep_endo);
        let mut exogenous = self.exogenous.clone();
        let mut ref_exo = ref_exo.clone();

        let mut flags = joint(&exogenous, &self.instruments, &endogenous, &ref_exo, ref_z, &ref_endo);
        if flags[2].iter().any(|kept| !kept) {
            let moved: Vec<bool> = flags[2].iter().map(|kept| !kept).collect();
            info!(
                "endogenous regressors collinear with the instruments, recategorized as exogenous: {:?}",
                select(&endo_positions, &moved)
            );
            exogenous = hcat(&exogenous, &restrict_columns(&endogenous, &moved));
            exo_positions.extend(select(&endo_positions, &moved));
            ref_exo.extend(select(&ref_endo, &moved));
            endogenous = restrict_columns(&endogenous, &flags[2]);
            endo_positions = select(&endo_positions, &flags[2]);
            ref_endo = select(&ref_endo, &flags[2]);
            flags = joint(&exogenous, &self.instruments, &endogenous, &ref_exo, ref_z, &ref_endo);
        }

        let instruments = restrict_columns(&self.instruments, &flags[1]);
        let endogenous = restrict_columns(&endogenous, &flags[2]);
        if instruments.ncols() < endogenous.ncols() {
            return Err(HdfeError::NotIdentified {
                instruments: instruments.ncols(),
                endogenous: endogenous.ncols(),
            });
        }
        let mut positions = select(&exo_positions, &flags[0]);
        positions.extend(select(&endo_positions, &flags[2]));
        Ok(ReducedDesign {
            exogenous: restrict_columns(&exogenous, &flags[0]),
            endogenous,
            instruments,
            positions,
        })
    }
}

fn joint(
    exogenous: &DMatrix<f64>,
    instruments: &DMatrix<f64>,
    endogenous: &DMatrix<f64>,
    ref_exo: &[f64],
    ref_z: &[f64],
    ref_endo: &[f64],
) -> Vec<Vec<bool>> {
    let reference: Vec<f64> = ref_exo.iter().chain(ref_z).chain(ref_endo).copied().collect();
    joint_basis(&[exogenous, instruments, endogenous], Some(&reference))
}

fn select<T: Clone>(values: &[T], keep: &[bool]) -> Vec<T> {
    values
        .iter()
        .zip(keep)
        .filter(|(_, kept)| **kept)
        .map(|(value, _)| value.clone())
        .collect()
}

/// Reorders reduced estimates by increasing original position.
fn original_order(
    positions: &[usize],
    coefficients: &DVector<f64>,
    covariance: &DMatrix<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let mut order: Vec<usize> = (0..positions.len()).collect();
    order.sort_by_key(|index| positions[*index]);
    let coefficients = DVector::from_iterator(order.len(), order.iter().map(|i| coefficients[*i]));
    let covariance =
        DMatrix::from_fn(order.len(), order.len(), |i, j| covariance[(order[i], order[j])]);
    (coefficients, covariance)
}

/// Weighted total sum of squares, centered on the weighted mean when the model
/// has an intercept.
fn total_sum_of_squares(y: &DVector<f64>, weights: &DVector<f64>, centered: bool) -> f64 {
    let mean = if centered {
        y.dot(weights) / weights.sum()
    } else {
        0.0
    };
    y.iter()
        .zip(weights.iter())
        .map(|(value, weight)| weight * (value - mean) * (value - mean))
        .sum()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::formulation::FeTerm;

    fn panel() -> Table {
        Table::builder()
            .numeric("y", vec![1.0, 2.5, 2.0, 5.0, 4.5, 7.0, 3.0, 6.5])
            .numeric("x", vec![0.0, 1.0, 0.5, 2.0, 1.5, 3.0, 0.7, 2.6])
            .categorical("id", ["a", "a", "b", "b", "c", "c", "d", "d"])
            .build()
            .unwrap()
    }

    #[test]
    fn total_sum_of_squares_is_weighted() {
        let y = DVector::from_vec(vec![1.0, 4.0]);
        let w = DVector::from_vec(vec![1.0, 2.0]);
        assert_relative_eq!(total_sum_of_squares(&y, &w, true), 1.0 * 4.0 + 2.0 * 1.0);
        assert_relative_eq!(total_sum_of_squares(&y, &w, false), 1.0 + 32.0);
    }

    #[test]
    fn original_order_undoes_recategorization() {
        let coefficients = DVector::from_vec(vec![10.0, 30.0, 20.0]);
        let covariance = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 3.0, 2.0]));
        let (c, v) = original_order(&[0, 2, 1], &coefficients, &covariance);
        assert_eq!(c.as_slice(), &[10.0, 20.0, 30.0]);
        assert_eq!(v[(1, 1)], 2.0);
        assert_eq!(v[(2, 2)], 3.0);
    }

    #[test]
    fn fixed_effects_remove_the_intercept() {
        let model = FixedEffectModel::new(
            Formulation::new("y").exogenous(["x"]).fixed_effect(FeTerm::new("id")),
        )
        .unwrap();
        let result = model
            .fit(&panel(), &VcovMethod::Simple, &EstimationOptions::default())
            .unwrap();
        assert!(result.has_fe_intercept);
        assert!(!result.has_intercept);
        assert_eq!(result.coef_names, vec!["x".to_string()]);
        assert_eq!(result.dof_fes, 4);
        assert_eq!(result.dof_residual, 8 - 1 - 4);
        assert!(result.r2_within.is_some());
    }

    #[test]
    fn instruments_without_endogenous_regressors_are_rejected() {
        let formulation = Formulation::new("y").instrumented(Vec::<String>::new(), ["z"]);
        assert!(matches!(
            FixedEffectModel::new(formulation),
            Err(HdfeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn endogenous_collinear_with_instruments_becomes_exogenous() {
        // x2 duplicates the instrument z2, so it is treated as exogenous and
        // z2 is dropped; the model is still identified by z1.
        let table = Table::builder()
            .numeric("y", vec![1.0, 3.0, 2.0, 6.0, 5.0, 8.0, 7.0, 11.0])
            .numeric("x1", vec![0.2, 1.1, 0.9, 2.3, 1.8, 3.2, 2.9, 4.1])
            .numeric("x2", vec![1.0, 0.0, 2.0, 1.0, 3.0, 1.0, 0.0, 2.0])
            .numeric("z1", vec![0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0])
            .numeric("z2", vec![1.0, 0.0, 2.0, 1.0, 3.0, 1.0, 0.0, 2.0])
            .build()
            .unwrap();
        let model =
            FixedEffectModel::new(Formulation::new("y").instrumented(["x1", "x2"], ["z1", "z2"]))
                .unwrap();
        assert!(model.formulation().has_iv());
        let result = model
            .fit(&table, &VcovMethod::Simple, &EstimationOptions::default())
            .unwrap();
        assert_eq!(
            result.coef_names,
            vec!["(Intercept)".to_string(), "x1".to_string(), "x2".to_string()]
        );
        assert_eq!(result.basecoef, vec![true, true, true]);
        for value in result.coef.iter() {
            assert!(value.is_finite());
        }
    }

    #[test]
    fn rank_test_is_skipped_when_every_endogenous_regressor_is_recategorized() {
        let table = Table::builder()
            .numeric("y", vec![1.0, 3.0, 2.0, 6.0, 5.0, 8.0, 7.0, 11.0])
            .numeric("z", vec![0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0])
            .build()
            .unwrap();
        let iv = FixedEffectModel::new(Formulation::new("y").instrumented(["z"], ["z"]))
            .unwrap()
            .fit(&table, &VcovMethod::Simple, &EstimationOptions::default())
            .unwrap();
        assert_eq!(iv.f_kp, None);
        assert_eq!(iv.p_kp, None);

        let ols = FixedEffectModel::new(Formulation::new("y").exogenous(["z"]))
            .unwrap()
            .fit(&table, &VcovMethod::Simple, &EstimationOptions::default())
            .unwrap();
        assert_relative_eq!(iv.coef, ols.coef, epsilon = 1e-10);
    }
}
