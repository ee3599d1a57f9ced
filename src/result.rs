//! Result assembly: mapping reduced estimates back to the original columns.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::error::{HdfeError, Result};
use crate::solving::SolverSummary;

/// Places the reduced coefficients at the kept positions, zero elsewhere.
pub fn expand_coefficients(reduced: &DVector<f64>, keep: &[bool]) -> DVector<f64> {
    let mut full = DVector::zeros(keep.len());
    for (target, source) in kept_positions(keep).enumerate() {
        full[source] = reduced[target];
    }
    full
}

/// Places the reduced covariance at the kept rows and columns, NaN elsewhere.
pub fn expand_covariance(reduced: &DMatrix<f64>, keep: &[bool]) -> DMatrix<f64> {
    let mut full = DMatrix::from_element(keep.len(), keep.len(), f64::NAN);
    let positions: Vec<usize> = kept_positions(keep).collect();
    for (i, row) in positions.iter().enumerate() {
        for (j, column) in positions.iter().enumerate() {
            full[(*row, *column)] = reduced[(i, j)];
        }
    }
    full
}

fn kept_positions(keep: &[bool]) -> impl Iterator<Item = usize> + '_ {
    keep.iter()
        .enumerate()
        .filter_map(|(index, kept)| kept.then_some(index))
}

/// Per-row outputs requested through [`Save`](crate::options::Save), aligned
/// with the rows of the input table (`None` outside the estimation sample).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AugmentedData {
    /// Residuals on the original (unweighted) scale.
    pub residuals: Option<Vec<Option<f64>>>,
    /// One `(name, values)` pair per fixed-effect term.
    pub fixed_effects: Vec<(String, Vec<Option<f64>>)>,
}

impl AugmentedData {
    pub fn is_empty(&self) -> bool {
        self.residuals.is_none() && self.fixed_effects.is_empty()
    }

    /// Recovered fixed effect values for the term named `name` (e.g. `fe_firm`).
    pub fn fixed_effect(&self, name: &str) -> Option<&[Option<f64>]> {
        self.fixed_effects
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, values)| values.as_slice())
    }
}

/// Scatters sample-aligned values into a vector over every table row.
pub(crate) fn scatter(values: &DVector<f64>, mask: &[bool]) -> Vec<Option<f64>> {
    let mut sample = values.iter();
    mask.iter()
        .map(|keep| if *keep { sample.next().copied() } else { None })
        .collect()
}

/// Outcome of a fixed-effect OLS or IV estimation.
#[derive(Clone, Debug, Serialize)]
pub struct FixedEffectModelResult {
    /// One coefficient per original column, zero where the column was dropped.
    pub coef: DVector<f64>,
    /// Covariance matrix; rows and columns of dropped columns are NaN.
    pub vcov: DMatrix<f64>,
    pub coef_names: Vec<String>,
    /// `true` for columns that were kept by the collinearity check.
    pub basecoef: Vec<bool>,
    pub response_name: String,
    /// Rows of the input table used for estimation.
    pub esample: Vec<bool>,
    pub nobs: usize,
    /// Number of kept regressors.
    pub dof: usize,
    /// Degrees of freedom absorbed by the fixed effects.
    pub dof_fes: usize,
    pub dof_residual: usize,
    /// Degrees of freedom of the t distribution used for inference.
    pub dof_tstat: usize,
    pub has_intercept: bool,
    pub has_fe_intercept: bool,
    pub r2: f64,
    pub adjr2: f64,
    /// Within R², present when fixed effects are absorbed.
    pub r2_within: Option<f64>,
    pub f_stat: f64,
    pub p_value: f64,
    /// Kleibergen–Paap F statistic, present for instrumented models.
    pub f_kp: Option<f64>,
    pub p_kp: Option<f64>,
    /// Clusters per cluster column, empty unless clustering.
    pub nclusters: Vec<(String, usize)>,
    pub singletons_dropped: usize,
    pub solver: SolverSummary,
    pub augmented: AugmentedData,
}

impl FixedEffectModelResult {
    pub fn iterations(&self) -> usize {
        self.solver.iterations
    }

    pub fn converged(&self) -> bool {
        self.solver.converged
    }

    /// Coefficient of the column named `name`.
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coef_names
            .iter()
            .position(|candidate| candidate == name)
            .map(|index| self.coef[index])
    }

    /// Standard errors, NaN for dropped columns.
    pub fn stderror(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.coef.len(),
            (0..self.coef.len()).map(|i| self.vcov[(i, i)].sqrt()),
        )
    }

    pub fn t_statistics(&self) -> DVector<f64> {
        self.coef.component_div(&self.stderror())
    }

    /// Two-sided p-values from a Student t with `dof_tstat` degrees of freedom.
    pub fn p_values(&self) -> Result<DVector<f64>> {
        let t = self.reference_distribution()?;
        Ok(self
            .t_statistics()
            .map(|value| 2.0 * (1.0 - t.cdf(value.abs()))))
    }

    /// Confidence intervals at `level` (e.g. 0.95), one `(lower, upper)` per coefficient.
    pub fn confint(&self, level: f64) -> Result<Vec<(f64, f64)>> {
        if !(level > 0.0 && level < 1.0) {
            return Err(HdfeError::invalid(format!(
                "confidence level must lie in (0, 1), got {level}"
            )));
        }
        let t = self.reference_distribution()?;
        let scale = t.inverse_cdf(1.0 - (1.0 - level) / 2.0);
        Ok(self
            .coef
            .iter()
            .zip(self.stderror().iter())
            .map(|(coef, se)| (coef - scale * se, coef + scale * se))
            .collect())
    }

    fn reference_distribution(&self) -> Result<StudentsT> {
        StudentsT::new(0.0, 1.0, self.dof_tstat.max(1) as f64)
            .map_err(|err| HdfeError::invalid(format!("t distribution: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn result(coef: Vec<f64>, vcov: DMatrix<f64>) -> FixedEffectModelResult {
        let k = coef.len();
        FixedEffectModelResult {
            coef: DVector::from_vec(coef),
            vcov,
            coef_names: (0..k).map(|i| format!("x{i}")).collect(),
            basecoef: vec![true; k],
            response_name: "y".to_string(),
            esample: vec![true; 30],
            nobs: 30,
            dof: k,
            dof_fes: 0,
            dof_residual: 28,
            dof_tstat: 28,
            has_intercept: false,
            has_fe_intercept: false,
            r2: 0.5,
            adjr2: 0.48,
            r2_within: None,
            f_stat: 1.0,
            p_value: 0.3,
            f_kp: None,
            p_kp: None,
            nclusters: Vec::new(),
            singletons_dropped: 0,
            solver: SolverSummary::trivial(),
            augmented: AugmentedData::default(),
        }
    }

    #[test]
    fn dropped_columns_are_zero_and_nan() {
        let keep = [true, false, true];
        let coef = expand_coefficients(&DVector::from_vec(vec![1.5, -2.0]), &keep);
        assert_eq!(coef.as_slice(), &[1.5, 0.0, -2.0]);

        let reduced = DMatrix::from_row_slice(2, 2, &[1.0, 0.1, 0.1, 2.0]);
        let vcov = expand_covariance(&reduced, &keep);
        assert_eq!(vcov[(0, 0)], 1.0);
        assert_eq!(vcov[(2, 0)], 0.1);
        assert_eq!(vcov[(2, 2)], 2.0);
        for i in 0..3 {
            assert!(vcov[(1, i)].is_nan());
            assert!(vcov[(i, 1)].is_nan());
        }
    }

    #[test]
    fn scatter_follows_the_mask() {
        let values = DVector::from_vec(vec![1.0, 2.0]);
        assert_eq!(
            scatter(&values, &[false, true, false, true]),
            vec![None, Some(1.0), None, Some(2.0)]
        );
    }

    #[test]
    fn inference_helpers_use_student_t() {
        let fit = result(vec![2.0, 0.0], DMatrix::from_row_slice(2, 2, &[0.25, 0.0, 0.0, 1.0]));
        assert_relative_eq!(fit.stderror()[0], 0.5);
        assert_relative_eq!(fit.t_statistics()[0], 4.0);
        let p = fit.p_values().unwrap();
        assert!(p[0] < 0.001);
        assert_relative_eq!(p[1], 1.0, epsilon = 1e-12);

        let intervals = fit.confint(0.95).unwrap();
        // t(28) 97.5% quantile.
        assert_relative_eq!(intervals[0].1 - 2.0, 0.5 * 2.048_407, epsilon = 1e-4);
        assert!(fit.confint(1.5).is_err());
        assert_eq!(fit.coefficient("x0"), Some(2.0));
        assert_eq!(fit.coefficient("missing"), None);
    }
}
