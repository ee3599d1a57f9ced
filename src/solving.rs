//! Fixed-effect solver contract, configuration and diagnostics.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fixed_effects::FixedEffect;

/// How the solver distributes work across columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    /// Residualize columns one after another on the calling thread.
    #[default]
    Cpu,
    /// Residualize columns concurrently on the rayon thread pool.
    Parallel,
}

/// Floating-point precision used inside the solver iterations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Double,
    Single,
}

/// Configuration for the iterative fixed-effect solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub method: SolverMethod,
    /// Relative tolerance on the change of a column over one sweep.
    pub tolerance: f64,
    /// Maximum number of sweeps per column.
    pub max_iterations: usize,
    pub precision: Precision,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            method: SolverMethod::Cpu,
            tolerance: 1e-6,
            max_iterations: 10_000,
            precision: Precision::Double,
        }
    }
}

/// Diagnostics returned alongside residualized columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverSummary {
    /// Largest number of sweeps used by any column.
    pub iterations: usize,
    /// Whether every column met the tolerance.
    pub converged: bool,
}

impl SolverSummary {
    /// Summary for inputs that need no iteration (no fixed effects, no columns).
    pub fn trivial() -> Self {
        Self {
            iterations: 0,
            converged: true,
        }
    }

    /// Combines the diagnostics of independently solved columns.
    pub fn merge(self, other: SolverSummary) -> SolverSummary {
        SolverSummary {
            iterations: self.iterations.max(other.iterations),
            converged: self.converged && other.converged,
        }
    }
}

/// Removes the component of numeric columns explained by fixed effects.
///
/// Implementations solve a weighted least squares problem per column, where
/// `sqrt_weights` holds the square roots of the observation weights. Non
/// convergence is reported through [`SolverSummary`], never as an error; the
/// estimation pipeline logs it as a warning.
pub trait FixedEffectSolver {
    /// Returns each column minus its projection on the fixed effects.
    fn residualize(
        &self,
        columns: Vec<DVector<f64>>,
        fixed_effects: &[FixedEffect],
        sqrt_weights: &DVector<f64>,
    ) -> Result<(Vec<DVector<f64>>, SolverSummary)>;

    /// Returns, for each fixed effect, the per-row contribution of that effect
    /// to the best fit of `column`.
    fn recover(
        &self,
        column: &DVector<f64>,
        fixed_effects: &[FixedEffect],
        sqrt_weights: &DVector<f64>,
    ) -> Result<(Vec<DVector<f64>>, SolverSummary)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_merge_conservatively() {
        let a = SolverSummary {
            iterations: 3,
            converged: true,
        };
        let b = SolverSummary {
            iterations: 7,
            converged: false,
        };
        let merged = a.merge(b);
        assert_eq!(merged.iterations, 7);
        assert!(!merged.converged);
        assert_eq!(SolverSummary::trivial().merge(a), a);
    }
}
