//! Least squares and two-stage least squares on (reweighted) design matrices.
//!
//! Every matrix passed here has already been multiplied row-wise by the square
//! root of the observation weights, so weighted least squares reduces to
//! ordinary least squares on the transformed data.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};

use crate::error::{HdfeError, Result};

/// Coefficients of the regression of every column of `target` on `regressors`,
/// obtained from the normal equations through a Cholesky factorization.
pub fn project(
    regressors: &DMatrix<f64>,
    target: &DMatrix<f64>,
    context: &'static str,
) -> Result<DMatrix<f64>> {
    if regressors.ncols() == 0 {
        return Ok(DMatrix::zeros(0, target.ncols()));
    }
    let cross = regressors.transpose() * regressors;
    let cholesky = Cholesky::new(cross).ok_or_else(|| HdfeError::singular(context))?;
    Ok(cholesky.solve(&(regressors.transpose() * target)))
}

/// Residuals of `target` after projecting on `regressors`.
pub fn partial_out(
    regressors: &DMatrix<f64>,
    target: &DMatrix<f64>,
    context: &'static str,
) -> Result<DMatrix<f64>> {
    if regressors.ncols() == 0 {
        return Ok(target.clone());
    }
    let coefficients = project(regressors, target, context)?;
    Ok(target - regressors * coefficients)
}

/// Column-wise concatenation `[left | right]`.
pub fn hcat(left: &DMatrix<f64>, right: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(left.nrows(), left.ncols() + right.ncols());
    out.columns_mut(0, left.ncols()).copy_from(left);
    out.columns_mut(left.ncols(), right.ncols()).copy_from(right);
    out
}

/// First-stage quantities of a 2SLS regression.
#[derive(Clone, Debug)]
pub struct FirstStage {
    /// Coefficients of the endogenous regressors on `[Xexo | Z]`.
    pub coefficients: DMatrix<f64>,
    /// Fitted endogenous regressors.
    pub fitted: DMatrix<f64>,
    /// Endogenous regressors minus their fitted values.
    pub endogenous_residuals: DMatrix<f64>,
    /// Excluded instruments partialled out of the exogenous regressors.
    pub instrument_residuals: DMatrix<f64>,
}

impl FirstStage {
    /// First-stage coefficients on the excluded instruments only.
    pub fn excluded_coefficients(&self) -> DMatrix<f64> {
        let l = self.instrument_residuals.ncols();
        let rows = self.coefficients.nrows();
        self.coefficients.rows(rows - l, l).into_owned()
    }
}

/// Projects the endogenous regressors on exogenous regressors and instruments.
pub fn first_stage(
    exogenous: &DMatrix<f64>,
    endogenous: &DMatrix<f64>,
    instruments: &DMatrix<f64>,
) -> Result<FirstStage> {
    if instruments.ncols() < endogenous.ncols() {
        return Err(HdfeError::NotIdentified {
            instruments: instruments.ncols(),
            endogenous: endogenous.ncols(),
        });
    }
    let full = hcat(exogenous, instruments);
    let coefficients = project(&full, endogenous, "first stage Z'Z")?;
    let fitted = &full * &coefficients;
    let endogenous_residuals = endogenous - &fitted;
    let instrument_residuals = partial_out(exogenous, instruments, "exogenous X'X")?;
    Ok(FirstStage {
        coefficients,
        fitted,
        endogenous_residuals,
        instrument_residuals,
    })
}

/// Outcome of the (second-stage) least squares fit.
#[derive(Clone, Debug)]
pub struct StageFit {
    /// Coefficients aligned with the columns of `hat`.
    pub coefficients: DVector<f64>,
    /// `y - X b` with the actual, unprojected regressors.
    pub residuals: DVector<f64>,
    /// Regressors used for inference: `[Xexo | fitted Xendo]`, or `Xexo` alone.
    pub hat: DMatrix<f64>,
    /// Cholesky factor of `hat' hat`.
    pub cross: Cholesky<f64, Dyn>,
    /// Present only for instrumented models.
    pub first_stage: Option<FirstStage>,
}

/// Estimates `y` on `[Xexo | Xendo]`, instrumenting `Xendo` by `Z` when given.
pub fn fit(
    y: &DVector<f64>,
    exogenous: &DMatrix<f64>,
    instrumented: Option<(&DMatrix<f64>, &DMatrix<f64>)>,
) -> Result<StageFit> {
    let (hat, regressors, first) = match instrumented {
        Some((endogenous, instruments)) => {
            let first = first_stage(exogenous, endogenous, instruments)?;
            let hat = hcat(exogenous, &first.fitted);
            let regressors = hcat(exogenous, endogenous);
            (hat, regressors, Some(first))
        }
        None => (exogenous.clone(), exogenous.clone(), None),
    };

    let cross = Cholesky::new(hat.transpose() * &hat)
        .ok_or_else(|| HdfeError::singular("X'X of the regression"))?;
    let coefficients = cross.solve(&(hat.transpose() * y));
    let residuals = y - &regressors * &coefficients;

    Ok(StageFit {
        coefficients,
        residuals,
        hat,
        cross,
        first_stage: first,
    })
}
