//! Estimation-sample selection: missing values, weights, subsets and singletons.

use log::{debug, info};

use crate::data::Table;
use crate::error::{HdfeError, Result};
use crate::fixed_effects::{FixedEffect, Groups};
use crate::formulation::Formulation;

/// Outcome of sample selection.
#[derive(Clone, Debug)]
pub struct SampleSelection {
    /// One entry per table row, `true` where the row is used.
    pub mask: Vec<bool>,
    /// Number of rows removed because they were alone in a fixed-effect group.
    pub singletons_dropped: usize,
}

impl SampleSelection {
    /// Number of selected rows.
    pub fn nobs(&self) -> usize {
        self.mask.iter().filter(|keep| **keep).count()
    }
}

/// Inputs of sample selection other than the table itself.
#[derive(Clone, Copy, Debug)]
pub struct SampleRequest<'a> {
    pub formulation: &'a Formulation,
    pub weights: Option<&'a str>,
    pub subset: Option<&'a [Option<bool>]>,
    pub clusters: &'a [String],
    pub drop_singletons: bool,
}

/// Computes the estimation sample.
///
/// `fixed_effects` must be built over every table row; they are only used to
/// detect singleton groups.
pub fn select_sample(
    table: &Table,
    request: &SampleRequest<'_>,
    fixed_effects: &[FixedEffect],
) -> Result<SampleSelection> {
    let n = table.row_count();
    let mut required: Vec<&str> = request.formulation.required_columns();
    required.extend(request.clusters.iter().map(String::as_str));
    let mut mask = table.complete_cases(&required)?;

    if let Some(name) = request.weights {
        let weights = table.numeric(name)?;
        for (keep, weight) in mask.iter_mut().zip(weights) {
            *keep &= matches!(weight, Some(w) if *w > 0.0);
        }
    }

    if let Some(subset) = request.subset {
        if subset.len() != n {
            return Err(HdfeError::length_mismatch("subset vector", n, subset.len()));
        }
        for (keep, selected) in mask.iter_mut().zip(subset) {
            *keep &= selected.unwrap_or(false);
        }
    }

    let mut singletons_dropped = 0;
    if request.drop_singletons && !fixed_effects.is_empty() {
        singletons_dropped = drop_singletons(&mut mask, fixed_effects);
        if singletons_dropped > 0 {
            info!("{singletons_dropped} observations detected as singletons, dropping them");
        }
    }

    let selection = SampleSelection {
        mask,
        singletons_dropped,
    };
    if selection.nobs() == 0 {
        return Err(HdfeError::EmptySample);
    }
    debug!("estimation sample: {} of {} rows", selection.nobs(), n);
    Ok(selection)
}

/// Iteratively removes rows whose fixed-effect group contains a single
/// selected row, until no fixed effect has singletons left.
///
/// Returns the number of rows removed.
pub fn drop_singletons(mask: &mut [bool], fixed_effects: &[FixedEffect]) -> usize {
    let mut total = 0;
    loop {
        let mut cleared = 0;
        for fe in fixed_effects {
            cleared += drop_singletons_once(mask, fe.groups());
        }
        total += cleared;
        if cleared == 0 {
            return total;
        }
    }
}

fn drop_singletons_once(mask: &mut [bool], groups: &Groups) -> usize {
    let mut counts = vec![0usize; groups.n_groups()];
    for (keep, code) in mask.iter().zip(groups.refs()) {
        if let (true, Some(code)) = (*keep, code) {
            counts[*code as usize] += 1;
        }
    }
    let mut cleared = 0;
    for (keep, code) in mask.iter_mut().zip(groups.refs()) {
        if let (true, Some(code)) = (*keep, code) {
            if counts[*code as usize] == 1 {
                *keep = false;
                cleared += 1;
            }
        }
    }
    cleared
}
