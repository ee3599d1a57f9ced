//! Weighted method of alternating projections (MAP) for absorbing fixed effects.
//!
//! Each fixed effect `g` with interaction `x` spans the columns
//! `{ 1[g_i = k] x_i }`. Projecting a column `v` on that span under weights
//! `w` subtracts, within each group `k`,
//!
//! ```text
//! b_k = Σ_{i∈k} w_i x_i v_i / Σ_{i∈k} w_i x_i²
//! ```
//!
//! times `x_i`. Groups of one fixed effect are disjoint, so a single effect is
//! absorbed exactly in one sweep; with several effects the sweeps alternate
//! until the change over a sweep is small relative to the input column. Summing the
//! `b_k` across sweeps yields the fixed-effect estimates themselves.
//!
//! # References
//!
//! - Gaure (2013), "OLS with multiple high dimensional category variables."
//! - Correia (2017), "Linear Models with High-Dimensional Fixed Effects."

use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::{HdfeError, Result};
use crate::fixed_effects::FixedEffect;
use crate::solving::{FixedEffectSolver, Precision, SolverMethod, SolverOptions, SolverSummary};

/// Scalar types the sweeps can run in.
trait SolverFloat:
    Copy
    + Send
    + Sync
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + AddAssign
    + SubAssign
{
    const ZERO: Self;
    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl SolverFloat for f64 {
    const ZERO: Self = 0.0;
    fn from_f64(value: f64) -> Self {
        value
    }
    fn to_f64(self) -> f64 {
        self
    }
}

impl SolverFloat for f32 {
    const ZERO: Self = 0.0;
    fn from_f64(value: f64) -> Self {
        value as f32
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
}

/// One fixed effect laid out for repeated projections.
struct Dimension<T> {
    refs: Vec<u32>,
    interaction: Vec<T>,
    /// `w_i x_i`, the numerator weight of row `i`.
    scale: Vec<T>,
    /// `1 / Σ w x²` per group, zero for groups with no weight.
    inv_denominator: Vec<T>,
    sums: Vec<T>,
}

impl<T: SolverFloat> Dimension<T> {
    fn new(fe: &FixedEffect, weights: &[f64]) -> Result<Self> {
        let n = weights.len();
        let n_groups = fe.n_groups();
        let mut refs = Vec::with_capacity(n);
        let mut interaction = Vec::with_capacity(n);
        let mut scale = Vec::with_capacity(n);
        let mut denominator = vec![0.0f64; n_groups];
        for (i, weight) in weights.iter().enumerate() {
            let code = fe.groups().level(i).ok_or_else(|| {
                HdfeError::invalid("fixed effect has a missing level inside the sample")
            })?;
            let x = fe.interaction_at(i);
            refs.push(code);
            interaction.push(T::from_f64(x));
            scale.push(T::from_f64(weight * x));
            denominator[code as usize] += weight * x * x;
        }
        let inv_denominator = denominator
            .into_iter()
            .map(|d| if d > 0.0 { T::from_f64(1.0 / d) } else { T::ZERO })
            .collect();
        Ok(Self {
            refs,
            interaction,
            scale,
            inv_denominator,
            sums: vec![T::ZERO; n_groups],
        })
    }

    /// Projects `column` off this dimension in place, adding the group
    /// coefficients to `coefficients` when provided.
    fn project(&mut self, column: &mut [T], coefficients: Option<&mut [T]>) {
        self.sums.iter_mut().for_each(|s| *s = T::ZERO);
        for ((code, scale), value) in self.refs.iter().zip(&self.scale).zip(column.iter()) {
            self.sums[*code as usize] += *scale * *value;
        }
        for (sum, inv) in self.sums.iter_mut().zip(&self.inv_denominator) {
            *sum = *sum * *inv;
        }
        for ((code, x), value) in self.refs.iter().zip(&self.interaction).zip(column.iter_mut()) {
            *value -= self.sums[*code as usize] * *x;
        }
        if let Some(coefficients) = coefficients {
            for (total, step) in coefficients.iter_mut().zip(&self.sums) {
                *total += *step;
            }
        }
    }
}

/// Default [`FixedEffectSolver`]: weighted alternating projections.
#[derive(Clone, Debug, Default)]
pub struct AlternatingProjections {
    options: SolverOptions,
}

impl AlternatingProjections {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    fn check_lengths(
        &self,
        n: usize,
        fixed_effects: &[FixedEffect],
        sqrt_weights: &DVector<f64>,
    ) -> Result<Vec<f64>> {
        if sqrt_weights.len() != n {
            return Err(HdfeError::length_mismatch("solver weights", n, sqrt_weights.len()));
        }
        for fe in fixed_effects {
            if fe.len() != n {
                return Err(HdfeError::length_mismatch("fixed effect rows", n, fe.len()));
            }
        }
        Ok(sqrt_weights.iter().map(|s| s * s).collect())
    }

    fn residualize_in<T: SolverFloat>(
        &self,
        columns: Vec<DVector<f64>>,
        fixed_effects: &[FixedEffect],
        weights: &[f64],
    ) -> Result<(Vec<DVector<f64>>, SolverSummary)> {
        let weights_t: Vec<T> = weights.iter().map(|w| T::from_f64(*w)).collect();

        // Projections keep per-group scratch sums, so every column gets its own layout.
        let solve = |column: DVector<f64>| -> Result<(DVector<f64>, SolverSummary)> {
            let mut dims = build_dimensions::<T>(fixed_effects, weights)?;
            let mut values: Vec<T> = column.iter().map(|v| T::from_f64(*v)).collect();
            let summary = sweep_until_converged(&mut dims, &weights_t, &mut values, None, &self.options);
            let out = DVector::from_iterator(values.len(), values.into_iter().map(T::to_f64));
            Ok((out, summary))
        };

        let solved: Vec<Result<(DVector<f64>, SolverSummary)>> = match self.options.method {
            SolverMethod::Cpu => columns.into_iter().map(solve).collect(),
            SolverMethod::Parallel => columns.into_par_iter().map(solve).collect(),
        };

        let mut residuals = Vec::with_capacity(solved.len());
        let mut summary = SolverSummary::trivial();
        for entry in solved {
            let (column, column_summary) = entry?;
            residuals.push(column);
            summary = summary.merge(column_summary);
        }
        Ok((residuals, summary))
    }

    fn recover_in<T: SolverFloat>(
        &self,
        column: &DVector<f64>,
        fixed_effects: &[FixedEffect],
        weights: &[f64],
    ) -> Result<(Vec<DVector<f64>>, SolverSummary)> {
        let mut dims = build_dimensions::<T>(fixed_effects, weights)?;
        let weights_t: Vec<T> = weights.iter().map(|w| T::from_f64(*w)).collect();
        let mut values: Vec<T> = column.iter().map(|v| T::from_f64(*v)).collect();
        let mut coefficients: Vec<Vec<T>> = fixed_effects
            .iter()
            .map(|fe| vec![T::ZERO; fe.n_groups()])
            .collect();
        let summary = sweep_until_converged(
            &mut dims,
            &weights_t,
            &mut values,
            Some(&mut coefficients),
            &self.options,
        );

        let effects = dims
            .iter()
            .zip(&coefficients)
            .map(|(dim, coefs)| {
                DVector::from_iterator(
                    dim.refs.len(),
                    dim.refs
                        .iter()
                        .zip(&dim.interaction)
                        .map(|(code, x)| (coefs[*code as usize] * *x).to_f64()),
                )
            })
            .collect();
        Ok((effects, summary))
    }
}

impl FixedEffectSolver for AlternatingProjections {
    fn residualize(
        &self,
        columns: Vec<DVector<f64>>,
        fixed_effects: &[FixedEffect],
        sqrt_weights: &DVector<f64>,
    ) -> Result<(Vec<DVector<f64>>, SolverSummary)> {
        if fixed_effects.is_empty() || columns.is_empty() {
            return Ok((columns, SolverSummary::trivial()));
        }
        let n = sqrt_weights.len();
        for column in &columns {
            if column.len() != n {
                return Err(HdfeError::length_mismatch("solver column", n, column.len()));
            }
        }
        let weights = self.check_lengths(n, fixed_effects, sqrt_weights)?;
        let (residuals, summary) = match self.options.precision {
            Precision::Double => self.residualize_in::<f64>(columns, fixed_effects, &weights)?,
            Precision::Single => self.residualize_in::<f32>(columns, fixed_effects, &weights)?,
        };
        Ok((residuals, summary))
    }

    fn recover(
        &self,
        column: &DVector<f64>,
        fixed_effects: &[FixedEffect],
        sqrt_weights: &DVector<f64>,
    ) -> Result<(Vec<DVector<f64>>, SolverSummary)> {
        if fixed_effects.is_empty() {
            return Ok((Vec::new(), SolverSummary::trivial()));
        }
        let n = column.len();
        let weights = self.check_lengths(n, fixed_effects, sqrt_weights)?;
        let (effects, summary) = match self.options.precision {
            Precision::Double => self.recover_in::<f64>(column, fixed_effects, &weights)?,
            Precision::Single => self.recover_in::<f32>(column, fixed_effects, &weights)?,
        };
        Ok((effects, summary))
    }
}

fn build_dimensions<T: SolverFloat>(
    fixed_effects: &[FixedEffect],
    weights: &[f64],
) -> Result<Vec<Dimension<T>>> {
    fixed_effects
        .iter()
        .map(|fe| Dimension::new(fe, weights))
        .collect()
}

fn sweep_until_converged<T: SolverFloat>(
    dims: &mut [Dimension<T>],
    weights: &[T],
    column: &mut [T],
    mut coefficients: Option<&mut Vec<Vec<T>>>,
    options: &SolverOptions,
) -> SolverSummary {
    if dims.len() == 1 {
        let coefs = coefficients.as_deref_mut().map(|c| c[0].as_mut_slice());
        dims[0].project(column, coefs);
        return SolverSummary {
            iterations: 1,
            converged: true,
        };
    }

    let tolerance = options.tolerance * options.tolerance;
    let scale: f64 = column
        .iter()
        .zip(weights)
        .map(|(value, weight)| weight.to_f64() * value.to_f64() * value.to_f64())
        .sum();
    let mut previous = column.to_vec();
    for iteration in 1..=options.max_iterations.max(1) {
        previous.copy_from_slice(column);
        for (d, dim) in dims.iter_mut().enumerate() {
            let coefs = coefficients.as_deref_mut().map(|c| c[d].as_mut_slice());
            dim.project(column, coefs);
        }

        let change: f64 = previous
            .iter()
            .zip(column.iter())
            .zip(weights)
            .map(|((before, after), weight)| {
                let delta = (*before - *after).to_f64();
                weight.to_f64() * delta * delta
            })
            .sum();
        if change <= tolerance * scale {
            return SolverSummary {
                iterations: iteration,
                converged: true,
            };
        }
    }
    SolverSummary {
        iterations: options.max_iterations.max(1),
        converged: false,
    }
}
