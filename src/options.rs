//! Configuration structures for an estimation run.

use serde::{Deserialize, Serialize};

use crate::solving::{Precision, SolverMethod, SolverOptions};

/// Per-row outputs to keep alongside the estimates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Save {
    #[default]
    None,
    Residuals,
    FixedEffects,
    Both,
}

impl Save {
    pub fn residuals(self) -> bool {
        matches!(self, Save::Residuals | Save::Both)
    }

    pub fn fixed_effects(self) -> bool {
        matches!(self, Save::FixedEffects | Save::Both)
    }
}

/// Aggregated configuration used by [`FixedEffectModel::fit`](crate::FixedEffectModel::fit).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationOptions {
    /// Settings of the fixed-effect solver.
    pub solver: SolverOptions,
    /// Name of a numeric column of observation weights.
    pub weights: Option<String>,
    /// Row selection over the whole table; missing entries count as `false`.
    pub subset: Option<Vec<Option<bool>>>,
    /// Whether to drop observations alone in a fixed-effect group.
    pub drop_singletons: bool,
    pub save: Save,
    /// Extra degrees of freedom to remove from the residual degrees of freedom.
    pub dof_add: usize,
    /// Whether to compute the first-stage rank test of instrumented models.
    pub first_stage: bool,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            solver: SolverOptions::default(),
            weights: None,
            subset: None,
            drop_singletons: true,
            save: Save::None,
            dof_add: 0,
            first_stage: true,
        }
    }
}

impl EstimationOptions {
    /// Override the solver settings while preserving other defaults.
    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_method(mut self, method: SolverMethod) -> Self {
        self.solver.method = method;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.solver.precision = precision;
        self
    }

    /// Set the solver tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.solver.tolerance = tolerance;
        self
    }

    /// Set the maximum number of solver sweeps; at least one is always run.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.solver.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_weights<S: Into<String>>(mut self, column: S) -> Self {
        self.weights = Some(column.into());
        self
    }

    pub fn with_subset(mut self, subset: Vec<Option<bool>>) -> Self {
        self.subset = Some(subset);
        self
    }

    pub fn with_drop_singletons(mut self, drop_singletons: bool) -> Self {
        self.drop_singletons = drop_singletons;
        self
    }

    pub fn with_save(mut self, save: Save) -> Self {
        self.save = save;
        self
    }

    pub fn with_dof_add(mut self, dof_add: usize) -> Self {
        self.dof_add = dof_add;
        self
    }

    pub fn with_first_stage(mut self, first_stage: bool) -> Self {
        self.first_stage = first_stage;
        self
    }
}
