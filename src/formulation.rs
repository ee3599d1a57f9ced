//! Lightweight model specification.
//!
//! Terms are plain column names: this type does not parse formulas or build
//! interactions between regressors. It records which columns play which role
//! so that the estimator can extract response, regressor and instrument
//! matrices from a [`Table`] restricted to the estimation sample.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::Table;
use crate::error::Result;

/// Name used for the intercept coefficient.
pub const INTERCEPT_NAME: &str = "(Intercept)";

/// A fixed-effect term: one or more categorical columns, optionally
/// interacted with a numeric column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeTerm {
    groups: Vec<String>,
    interaction: Option<String>,
}

impl FeTerm {
    /// Absorbs the categorical column `group`.
    pub fn new<S: Into<String>>(group: S) -> Self {
        Self {
            groups: vec![group.into()],
            interaction: None,
        }
    }

    /// Absorbs the interaction of several categorical columns as one grouping.
    pub fn combined<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
            interaction: None,
        }
    }

    /// Interacts the group effect with a numeric column (a group-specific slope).
    pub fn interacted_with<S: Into<String>>(mut self, column: S) -> Self {
        self.interaction = Some(column.into());
        self
    }

    /// Categorical columns forming the grouping.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Numeric interaction column, if any.
    pub fn interaction(&self) -> Option<&str> {
        self.interaction.as_deref()
    }

    /// Label used when saving recovered fixed effects, e.g. `fe_firm&year`.
    pub fn key(&self) -> String {
        let mut key = format!("fe_{}", self.groups.join("&"));
        if let Some(interaction) = &self.interaction {
            key.push('&');
            key.push_str(interaction);
        }
        key
    }

    /// Every column referenced by the term.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .map(String::as_str)
            .chain(self.interaction.as_deref())
    }
}

/// Represents the roles of the table columns in a regression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Formulation {
    response: String,
    exogenous: Vec<String>,
    endogenous: Vec<String>,
    instruments: Vec<String>,
    fixed_effects: Vec<FeTerm>,
    intercept: bool,
}

impl Formulation {
    /// Starts a specification `response ~ 1`.
    pub fn new<S: Into<String>>(response: S) -> Self {
        Self {
            response: response.into(),
            exogenous: Vec::new(),
            endogenous: Vec::new(),
            instruments: Vec::new(),
            fixed_effects: Vec::new(),
            intercept: true,
        }
    }

    /// Adds exogenous regressors.
    pub fn exogenous<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exogenous.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Adds endogenous regressors together with their excluded instruments.
    pub fn instrumented<I, J, S, T>(mut self, endogenous: I, instruments: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        self.endogenous
            .extend(endogenous.into_iter().map(Into::into));
        self.instruments
            .extend(instruments.into_iter().map(Into::into));
        self
    }

    /// Adds a fixed-effect term.
    pub fn fixed_effect(mut self, term: FeTerm) -> Self {
        self.fixed_effects.push(term);
        self
    }

    /// Returns a copy of this specification without the intercept.
    pub fn without_intercept(&self) -> Self {
        Self {
            intercept: false,
            ..self.clone()
        }
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn exogenous_columns(&self) -> &[String] {
        &self.exogenous
    }

    pub fn endogenous_columns(&self) -> &[String] {
        &self.endogenous
    }

    pub fn instrument_columns(&self) -> &[String] {
        &self.instruments
    }

    pub fn fixed_effects(&self) -> &[FeTerm] {
        &self.fixed_effects
    }

    pub fn has_intercept(&self) -> bool {
        self.intercept
    }

    /// Whether the model is estimated by two-stage least squares.
    pub fn has_iv(&self) -> bool {
        !self.endogenous.is_empty() || !self.instruments.is_empty()
    }

    /// Whether some fixed-effect term is a pure group absorption, which makes
    /// an explicit intercept collinear.
    pub fn fixed_effects_imply_intercept(&self) -> bool {
        self.fixed_effects
            .iter()
            .any(|term| term.interaction().is_none())
    }

    /// Every column that must be non-missing for a row to enter the sample.
    pub fn required_columns(&self) -> Vec<&str> {
        let mut columns = vec![self.response.as_str()];
        columns.extend(self.exogenous.iter().map(String::as_str));
        columns.extend(self.endogenous.iter().map(String::as_str));
        columns.extend(self.instruments.iter().map(String::as_str));
        for term in &self.fixed_effects {
            columns.extend(term.columns());
        }
        columns
    }

    /// Coefficient names in reporting order: intercept, exogenous, endogenous.
    pub fn coef_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(1 + self.exogenous.len() + self.endogenous.len());
        if self.intercept {
            names.push(INTERCEPT_NAME.to_string());
        }
        names.extend(self.exogenous.iter().cloned());
        names.extend(self.endogenous.iter().cloned());
        names
    }

    /// Extracts the response over the masked rows.
    pub fn response_vector(&self, table: &Table, mask: &[bool]) -> Result<DVector<f64>> {
        table.numeric_vector(&self.response, mask)
    }

    /// Extracts the exogenous model matrix, including the intercept column.
    pub fn exogenous_matrix(&self, table: &Table, mask: &[bool]) -> Result<DMatrix<f64>> {
        let columns = table.numeric_matrix(&self.exogenous, mask)?;
        if !self.intercept {
            return Ok(columns);
        }
        Ok(columns.insert_column(0, 1.0))
    }

    /// Extracts the endogenous regressors.
    pub fn endogenous_matrix(&self, table: &Table, mask: &[bool]) -> Result<DMatrix<f64>> {
        table.numeric_matrix(&self.endogenous, mask)
    }

    /// Extracts the excluded instruments.
    pub fn instrument_matrix(&self, table: &Table, mask: &[bool]) -> Result<DMatrix<f64>> {
        table.numeric_matrix(&self.instruments, mask)
    }
}
