//! Kleibergen–Paap rank test of the first-stage instrument matrix.
//!
//! With `k` endogenous regressors and `l ≥ k` excluded instruments, the test
//! asks whether the `l × k` matrix of first-stage coefficients on the excluded
//! instruments has rank `k − 1` (underidentification). The coefficient matrix
//! is normalized by the Cholesky factors of the partialled-out instrument and
//! endogenous cross products, and the statistic is built from the part of its
//! singular value decomposition associated with the smallest singular value.
//!
//! # References
//!
//! - Kleibergen & Paap (2006), "Generalized reduced rank tests using the
//!   singular value decomposition."

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::vcov::CovarianceEstimator;

/// Outcome of the rank test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RankTest {
    /// Wald statistic `r_kp`.
    pub statistic: f64,
    /// `r_kp` divided by the number of excluded instruments.
    pub f_statistic: f64,
    /// Upper tail of the chi-squared distribution with `degrees_of_freedom`.
    pub p_value: f64,
    pub degrees_of_freedom: usize,
}

/// Runs the rank test.
///
/// `endogenous` holds the first-stage residuals of the endogenous regressors,
/// `instruments` the excluded instruments partialled out of the exogenous
/// regressors, and `pi` the `l × k` first-stage coefficients on the excluded
/// instruments. `dof` is the residual degrees of freedom used to scale the
/// robust and clustered meat. Returns `None` when there is nothing to test or
/// when a factorization fails.
pub fn rank_test(
    endogenous: &DMatrix<f64>,
    instruments: &DMatrix<f64>,
    pi: &DMatrix<f64>,
    estimator: &CovarianceEstimator,
    dof: usize,
) -> Option<RankTest> {
    let k = endogenous.ncols();
    let l = instruments.ncols();
    let n = endogenous.nrows();
    if k == 0 || l < k || pi.shape() != (l, k) {
        return None;
    }

    let g = Cholesky::new(endogenous.transpose() * endogenous)?
        .l()
        .transpose();
    let f = Cholesky::new(instruments.transpose() * instruments)?
        .l()
        .transpose();
    // theta = F (G' \ Pi')'
    let scaled = g.transpose().solve_lower_triangular(&pi.transpose())?;
    let theta = &f * scaled.transpose();

    let (u, vt) = full_svd(&theta)?;

    let q = l - k + 1;
    let u_sub = u.view((k - 1, k - 1), (q, q)).into_owned();
    let u_tail = u.columns(k - 1, q).into_owned();
    let a_qq = if u_sub.iter().all(|value| *value == 0.0) {
        u_tail
    } else {
        let root = symmetric_sqrt(&(&u_sub * u_sub.transpose()))?;
        u_tail * u_sub.lu().solve(&root)?
    };

    let vt_sub = vt[(k - 1, k - 1)];
    let sign = if vt_sub == 0.0 { 1.0 } else { vt_sub.signum() };
    let b_qq = DMatrix::from_fn(1, k, |_, j| vt[(j, k - 1)] * sign);

    let kronv = b_qq.kronecker(&a_qq.transpose());
    let vec_theta = DVector::from_column_slice(theta.as_slice());
    let lambda = &kronv * vec_theta;

    let vlab = match estimator {
        CovarianceEstimator::Simple => {
            Cholesky::new(&kronv * kronv.transpose() / n as f64)?
        }
        _ => {
            let kron_factor = g.kronecker(&f).transpose();
            let meat = estimator.meat(instruments, endogenous, dof.max(1));
            let inner = kron_factor.solve_lower_triangular(&meat)?;
            let vhat = kron_factor.solve_lower_triangular(&inner.transpose())?;
            Cholesky::new(&kronv * vhat * kronv.transpose())?
        }
    };

    let statistic = lambda.dot(&vlab.solve(&lambda));
    let p_value = ChiSquared::new(q as f64)
        .map(|distribution| 1.0 - distribution.cdf(statistic))
        .unwrap_or(f64::NAN);
    Some(RankTest {
        statistic,
        f_statistic: statistic / l as f64,
        p_value,
        degrees_of_freedom: q,
    })
}

/// Full SVD `theta = U Σ V'` with singular values in decreasing order and
/// `U` completed to an `l × l` orthonormal basis.
fn full_svd(theta: &DMatrix<f64>) -> Option<(DMatrix<f64>, DMatrix<f64>)> {
    let (l, k) = theta.shape();
    let svd = theta.clone().svd(true, true);
    let thin_u = svd.u?;
    let thin_vt = svd.v_t?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|a, b| {
        svd.singular_values[*b]
            .partial_cmp(&svd.singular_values[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut u = DMatrix::zeros(l, l);
    let mut vt = DMatrix::zeros(k, k);
    for (target, source) in order.iter().enumerate() {
        u.column_mut(target).copy_from(&thin_u.column(*source));
        vt.row_mut(target).copy_from(&thin_vt.row(*source));
    }

    if l > k {
        // The orthogonal complement of the thin U spans the eigenvectors of
        // I - UU' with eigenvalue one.
        let thin = u.columns(0, k).into_owned();
        let complement = DMatrix::identity(l, l) - &thin * thin.transpose();
        let eigen = SymmetricEigen::try_new(complement, f64::EPSILON, 10_000)?;
        let mut directions: Vec<usize> = (0..l).collect();
        directions.sort_by(|a, b| {
            eigen.eigenvalues[*b]
                .partial_cmp(&eigen.eigenvalues[*a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (offset, source) in directions.iter().take(l - k).enumerate() {
            u.column_mut(k + offset)
                .copy_from(&eigen.eigenvectors.column(*source));
        }
    }
    Some((u, vt))
}

/// Principal square root of a symmetric positive semidefinite matrix.
fn symmetric_sqrt(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let eigen = SymmetricEigen::try_new(matrix.clone(), f64::EPSILON, 10_000)?;
    let roots = eigen.eigenvalues.map(|value| value.max(0.0).sqrt());
    Some(&eigen.eigenvectors * DMatrix::from_diagonal(&roots) * eigen.eigenvectors.transpose())
}
