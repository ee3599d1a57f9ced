//! Categorical groupings used as absorbed fixed effects and as cluster variables.

use std::collections::HashMap;

use nalgebra::DVector;

use crate::data::{Column, Table};
use crate::error::{HdfeError, Result};
use crate::formulation::FeTerm;

/// Dense integer coding of a categorical grouping over some set of rows.
///
/// `refs[i]` is the 0-based level of row `i`; levels are numbered in order of
/// first appearance. Missing rows are coded as `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Groups {
    refs: Vec<Option<u32>>,
    n_groups: usize,
}

impl Groups {
    /// Builds a grouping from arbitrary hashable labels.
    pub fn from_labels<T, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = Option<T>>,
        T: std::hash::Hash + Eq,
    {
        let mut levels: HashMap<T, u32> = HashMap::new();
        let mut refs = Vec::new();
        for label in labels {
            let code = label.map(|label| {
                let next = levels.len() as u32;
                *levels.entry(label).or_insert(next)
            });
            refs.push(code);
        }
        Self {
            n_groups: levels.len(),
            refs,
        }
    }

    /// Builds the grouping formed by one or more table columns.
    ///
    /// Numeric columns are grouped by exact value.
    pub fn from_table<S: AsRef<str>>(table: &Table, columns: &[S]) -> Result<Self> {
        if columns.is_empty() {
            return Err(HdfeError::invalid("a grouping needs at least one column"));
        }
        let mut grouping: Option<Groups> = None;
        for name in columns {
            let next = match table.column(name.as_ref())? {
                Column::Categorical(labels) => {
                    Groups::from_labels(labels.iter().map(|label| label.as_deref()))
                }
                Column::Numeric(values) => {
                    Groups::from_labels(values.iter().map(|value| value.map(|v| (v + 0.0).to_bits())))
                }
            };
            grouping = Some(match grouping {
                Some(current) => current.intersect(&next),
                None => next,
            });
        }
        grouping.ok_or_else(|| HdfeError::invalid("a grouping needs at least one column"))
    }

    /// Number of rows covered by the coding.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Returns `true` if the coding covers no rows.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Number of distinct levels in the coding.
    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    /// Level of row `index`.
    pub fn level(&self, index: usize) -> Option<u32> {
        self.refs[index]
    }

    pub fn refs(&self) -> &[Option<u32>] {
        &self.refs
    }

    /// Cross-classification of two groupings over the same rows.
    pub fn intersect(&self, other: &Groups) -> Groups {
        Groups::from_labels(
            self.refs
                .iter()
                .zip(&other.refs)
                .map(|(a, b)| a.zip(*b)),
        )
    }

    /// Restricts the coding to the rows selected by `mask`, renumbering levels
    /// so that only realized levels are counted.
    pub fn restrict(&self, mask: &[bool]) -> Groups {
        Groups::from_labels(
            self.refs
                .iter()
                .zip(mask)
                .filter(|(_, keep)| **keep)
                .map(|(code, _)| *code),
        )
    }

    /// Returns `true` when every level of `self` lies inside a single level of
    /// `outer`, i.e. the grouping is nested within `outer`.
    pub fn is_nested_in(&self, outer: &Groups) -> bool {
        let mut parent: Vec<Option<u32>> = vec![None; self.n_groups];
        for (inner_code, outer_code) in self.refs.iter().zip(&outer.refs) {
            let (Some(inner), Some(container)) = (inner_code, outer_code) else {
                continue;
            };
            match parent[*inner as usize] {
                None => parent[*inner as usize] = Some(*container),
                Some(existing) if existing != *container => return false,
                Some(_) => {}
            }
        }
        true
    }

    /// Row counts per level.
    pub fn group_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.n_groups];
        for code in self.refs.iter().flatten() {
            sizes[*code as usize] += 1;
        }
        sizes
    }
}

/// A fixed effect to absorb: a grouping plus a per-row interaction weight.
///
/// Without an interaction the weight is the constant 1 vector and the effect is
/// a set of group intercepts; with one, it is a set of group-specific slopes.
#[derive(Clone, Debug)]
pub struct FixedEffect {
    groups: Groups,
    interaction: Option<DVector<f64>>,
}

impl FixedEffect {
    /// Creates a pure group-intercept fixed effect.
    pub fn new(groups: Groups) -> Self {
        Self {
            groups,
            interaction: None,
        }
    }

    /// Creates a fixed effect whose level is multiplied by `interaction` row by row.
    pub fn with_interaction(groups: Groups, interaction: DVector<f64>) -> Result<Self> {
        if interaction.len() != groups.len() {
            return Err(HdfeError::length_mismatch(
                "fixed effect interaction",
                groups.len(),
                interaction.len(),
            ));
        }
        Ok(Self {
            groups,
            interaction: Some(interaction),
        })
    }

    /// Builds the fixed effect described by `term` over every table row.
    ///
    /// Rows with a missing interaction value get a weight of zero; they are
    /// removed by sample selection before the effect is absorbed.
    pub fn from_term(table: &Table, term: &FeTerm) -> Result<Self> {
        let groups = Groups::from_table(table, term.groups())?;
        match term.interaction() {
            None => Ok(Self::new(groups)),
            Some(column) => {
                let values = table.numeric(column)?;
                let weights = DVector::from_iterator(
                    values.len(),
                    values.iter().map(|value| value.unwrap_or(0.0)),
                );
                Self::with_interaction(groups, weights)
            }
        }
    }

    pub fn groups(&self) -> &Groups {
        &self.groups
    }

    /// Interaction weight of row `index` (1 when there is no interaction).
    pub fn interaction_at(&self, index: usize) -> f64 {
        self.interaction
            .as_ref()
            .map_or(1.0, |weights| weights[index])
    }

    /// Whether this effect absorbs group intercepts (and therefore the constant).
    pub fn implies_intercept(&self) -> bool {
        self.interaction.is_none()
    }

    /// Number of realized levels.
    pub fn n_groups(&self) -> usize {
        self.groups.n_groups()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Derives the fixed effect over the rows selected by `mask`.
    pub fn restrict(&self, mask: &[bool]) -> FixedEffect {
        let interaction = self.interaction.as_ref().map(|weights| {
            let kept: Vec<f64> = weights
                .iter()
                .zip(mask)
                .filter(|(_, keep)| **keep)
                .map(|(value, _)| *value)
                .collect();
            DVector::from_vec(kept)
        });
        FixedEffect {
            groups: self.groups.restrict(mask),
            interaction,
        }
    }
}
