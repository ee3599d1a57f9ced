//! Covariance estimators, absorbed degrees of freedom and the joint Wald test.
//!
//! All sandwich estimators share one "meat" routine: for a model matrix `X`
//! (`n × p`) and residual matrix `R` (`n × m`), the per-row scores are the
//! `p·m` products `x_ij r_ik`, and the meat is the (clustered) cross product
//! of those scores with the small-sample factor applied. The coefficient
//! covariance of a regression is then `(X'X)⁻¹ S (X'X)⁻¹`.

use log::debug;
use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor};

use crate::data::Table;
use crate::error::{HdfeError, Result};
use crate::fixed_effects::{FixedEffect, Groups};

/// Variance estimator requested by the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcovMethod {
    /// Homoskedastic errors.
    #[default]
    Simple,
    /// Heteroskedasticity-robust (HC1) errors.
    Robust,
    /// Cluster-robust errors, multi-way when several columns are named.
    Cluster(Vec<String>),
}

impl VcovMethod {
    /// Cluster-robust estimator over the named grouping columns.
    pub fn cluster<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        VcovMethod::Cluster(columns.into_iter().map(Into::into).collect())
    }

    /// Columns that must be observed for the estimator to be computed.
    pub fn cluster_columns(&self) -> &[String] {
        match self {
            VcovMethod::Cluster(columns) => columns,
            _ => &[],
        }
    }

    /// Binds the estimator to the estimation sample.
    pub fn resolve(&self, table: &Table, mask: &[bool]) -> Result<CovarianceEstimator> {
        match self {
            VcovMethod::Simple => Ok(CovarianceEstimator::Simple),
            VcovMethod::Robust => Ok(CovarianceEstimator::Robust),
            VcovMethod::Cluster(columns) => {
                if columns.is_empty() {
                    return Err(HdfeError::invalid(
                        "cluster-robust covariance needs at least one cluster column",
                    ));
                }
                let mut clusters = Vec::with_capacity(columns.len());
                for column in columns {
                    let groups = Groups::from_table(table, &[column])?.restrict(mask);
                    if groups.n_groups() < 2 {
                        return Err(HdfeError::invalid(format!(
                            "cluster column `{column}` has {} cluster(s) in the sample, at least 2 are needed",
                            groups.n_groups()
                        )));
                    }
                    debug!("cluster `{column}`: {} clusters", groups.n_groups());
                    clusters.push(groups);
                }
                Ok(CovarianceEstimator::Cluster(clusters))
            }
        }
    }
}

/// What a covariance estimator consumes from a fitted regression.
#[derive(Clone, Copy, Debug)]
pub struct VcovData<'a> {
    /// Regressors used for inference (the hat matrix for 2SLS).
    pub model_matrix: &'a DMatrix<f64>,
    /// Cholesky factor of `model_matrix' model_matrix`.
    pub cross: &'a Cholesky<f64, Dyn>,
    pub residuals: &'a DVector<f64>,
    pub dof_residual: usize,
}

/// A [`VcovMethod`] bound to the estimation sample.
#[derive(Clone, Debug)]
pub enum CovarianceEstimator {
    Simple,
    Robust,
    /// One grouping per cluster column, restricted to the sample.
    Cluster(Vec<Groups>),
}

impl CovarianceEstimator {
    pub fn is_cluster(&self) -> bool {
        matches!(self, CovarianceEstimator::Cluster(_))
    }

    /// Number of clusters per cluster column (empty unless clustering).
    pub fn nclusters(&self) -> Vec<usize> {
        match self {
            CovarianceEstimator::Cluster(clusters) => {
                clusters.iter().map(Groups::n_groups).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Degrees of freedom absorbed by the fixed effects.
    ///
    /// A fixed effect nested in a cluster variable costs a single degree of
    /// freedom under clustering; any other costs one per realized level.
    pub fn dof_absorbed(&self, fixed_effects: &[FixedEffect]) -> usize {
        fixed_effects
            .iter()
            .map(|fe| match self {
                CovarianceEstimator::Cluster(clusters)
                    if clusters.iter().any(|c| fe.groups().is_nested_in(c)) =>
                {
                    1
                }
                _ => fe.n_groups(),
            })
            .sum()
    }

    /// Degrees of freedom of the t (and confidence interval) reference distribution.
    pub fn dof_tstat(&self, dof_residual: usize) -> usize {
        match self {
            CovarianceEstimator::Cluster(clusters) => clusters
                .iter()
                .map(Groups::n_groups)
                .min()
                .map_or(dof_residual, |g| g.saturating_sub(1).max(1)),
            _ => dof_residual,
        }
    }

    /// Coefficient covariance matrix of a fitted regression.
    pub fn covariance(&self, data: &VcovData<'_>) -> DMatrix<f64> {
        let inverse = data.cross.inverse();
        match self {
            CovarianceEstimator::Simple => {
                let sigma2 = data.residuals.norm_squared() / data.dof_residual as f64;
                inverse * sigma2
            }
            CovarianceEstimator::Robust | CovarianceEstimator::Cluster(_) => {
                let residuals = DMatrix::from_column_slice(
                    data.residuals.len(),
                    1,
                    data.residuals.as_slice(),
                );
                let meat = self.meat(data.model_matrix, &residuals, data.dof_residual);
                let sandwich = &inverse * meat * &inverse;
                if self.is_cluster() {
                    nearest_psd(symmetrize(sandwich))
                } else {
                    symmetrize(sandwich)
                }
            }
        }
    }

    /// Scaled cross product of the scores `x_ij r_ik`; score column `k·p + j`
    /// pairs residual column `k` with model column `j`.
    ///
    /// The simple estimator has no meat of its own and is treated as robust.
    pub fn meat(
        &self,
        model: &DMatrix<f64>,
        residuals: &DMatrix<f64>,
        dof_residual: usize,
    ) -> DMatrix<f64> {
        let n = model.nrows();
        let scores = scores(model, residuals);
        match self {
            CovarianceEstimator::Simple | CovarianceEstimator::Robust => {
                scores.transpose() * &scores * (n as f64 / dof_residual as f64)
            }
            CovarianceEstimator::Cluster(clusters) => {
                let width = scores.ncols();
                let mut meat = DMatrix::zeros(width, width);
                // Inclusion-exclusion over every non-empty set of cluster columns.
                for combination in 1usize..(1 << clusters.len()) {
                    let mut groups: Option<Groups> = None;
                    for (index, cluster) in clusters.iter().enumerate() {
                        if combination & (1 << index) != 0 {
                            groups = Some(match groups {
                                Some(current) => current.intersect(cluster),
                                None => cluster.clone(),
                            });
                        }
                    }
                    let Some(groups) = groups else {
                        continue;
                    };
                    let summed = sum_within(&scores, &groups);
                    let contribution = summed.transpose() * &summed;
                    if combination.count_ones() % 2 == 1 {
                        meat += contribution;
                    } else {
                        meat -= contribution;
                    }
                }
                let g = clusters
                    .iter()
                    .map(Groups::n_groups)
                    .min()
                    .unwrap_or(2) as f64;
                meat * ((n as f64 - 1.0) / dof_residual as f64 * g / (g - 1.0))
            }
        }
    }
}

fn scores(model: &DMatrix<f64>, residuals: &DMatrix<f64>) -> DMatrix<f64> {
    let p = model.ncols();
    let mut scores = DMatrix::zeros(model.nrows(), p * residuals.ncols());
    for (k, residual) in residuals.column_iter().enumerate() {
        for (j, column) in model.column_iter().enumerate() {
            scores
                .column_mut(k * p + j)
                .copy_from(&column.component_mul(&residual));
        }
    }
    scores
}

fn sum_within(scores: &DMatrix<f64>, groups: &Groups) -> DMatrix<f64> {
    let mut summed = DMatrix::zeros(groups.n_groups(), scores.ncols());
    for (i, code) in groups.refs().iter().enumerate() {
        if let Some(code) = code {
            let mut row = summed.row_mut(*code as usize);
            row += scores.row(i);
        }
    }
    summed
}

fn symmetrize(matrix: DMatrix<f64>) -> DMatrix<f64> {
    (&matrix + matrix.transpose()) * 0.5
}

/// Clips negative eigenvalues, which multi-way clustering can produce.
fn nearest_psd(matrix: DMatrix<f64>) -> DMatrix<f64> {
    if matrix.iter().any(|value| !value.is_finite()) {
        return matrix;
    }
    let Some(eigen) = SymmetricEigen::try_new(matrix.clone(), f64::EPSILON, 1_000) else {
        return matrix;
    };
    if eigen.eigenvalues.iter().all(|value| *value >= 0.0) {
        return matrix;
    }
    let clipped = eigen.eigenvalues.map(|value| value.max(0.0));
    &eigen.eigenvectors * DMatrix::from_diagonal(&clipped) * eigen.eigenvectors.transpose()
}

/// Joint Wald test that every non-intercept coefficient is zero.
///
/// Returns `(F, p)`; both are NaN when the test is undefined (no slope
/// coefficients, or a singular covariance block).
pub fn wald_test(
    coefficients: &DVector<f64>,
    covariance: &DMatrix<f64>,
    has_intercept: bool,
    dof_residual: usize,
) -> (f64, f64) {
    let start = usize::from(has_intercept).min(coefficients.len());
    let k = coefficients.len() - start;
    if k == 0 {
        return (f64::NAN, f64::NAN);
    }
    let c = coefficients.rows(start, k).into_owned();
    let v = covariance.view((start, start), (k, k)).into_owned();
    let statistic = match v.lu().solve(&c) {
        Some(solved) => c.dot(&solved) / k as f64,
        None => f64::NAN,
    };
    if !statistic.is_finite() {
        return (statistic, f64::NAN);
    }
    let p_value = FisherSnedecor::new(k.max(1) as f64, dof_residual.max(1) as f64)
        .map(|distribution| 1.0 - distribution.cdf(statistic))
        .unwrap_or(f64::NAN);
    (statistic, p_value)
}
