//! Detection of linearly dependent columns.
//!
//! Columns are scanned left to right with the sweep operator on the cross
//! product `X'X`. When column `j` is reached, its diagonal entry equals the
//! residual sum of squares of `j` on the columns kept so far; the column is
//! dropped when that residual is negligible relative to its reference scale.

use log::debug;
use nalgebra::DMatrix;

/// Returns one flag per column of `x`, `true` when the column is kept.
///
/// `reference` optionally supplies the squared norms against which collinearity
/// is judged (for instance norms before fixed effects were absorbed, so that a
/// column fully explained by the fixed effects is dropped even when rounding
/// leaves a residual). Defaults to the diagonal of `X'X`.
pub fn basis(x: &DMatrix<f64>, reference: Option<&[f64]>) -> Vec<bool> {
    let mut cross = x.transpose() * x;
    let k = cross.ncols();
    let tolerances: Vec<f64> = (0..k)
        .map(|j| {
            let scale = reference.map_or(cross[(j, j)], |r| r[j]);
            scale.max(1.0) * f64::EPSILON.sqrt()
        })
        .collect();

    let mut keep = vec![false; k];
    for j in 0..k {
        let pivot = cross[(j, j)];
        if pivot.abs() < tolerances[j] || !pivot.is_finite() {
            debug!("column {j} is collinear with earlier columns and is dropped");
            continue;
        }
        sweep(&mut cross, j);
        keep[j] = true;
    }
    keep
}

/// Joint basis of several matrices sharing rows, checked in the given order.
///
/// Returns the flags split back per matrix.
pub fn joint_basis(blocks: &[&DMatrix<f64>], reference: Option<&[f64]>) -> Vec<Vec<bool>> {
    let rows = blocks.first().map_or(0, |b| b.nrows());
    let total: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut stacked = DMatrix::zeros(rows, total);
    let mut offset = 0;
    for block in blocks {
        stacked
            .columns_mut(offset, block.ncols())
            .copy_from(*block);
        offset += block.ncols();
    }
    let flags = basis(&stacked, reference);
    let mut out = Vec::with_capacity(blocks.len());
    let mut offset = 0;
    for block in blocks {
        out.push(flags[offset..offset + block.ncols()].to_vec());
        offset += block.ncols();
    }
    out
}

/// Returns a copy of `x` holding only the columns flagged in `keep`.
pub fn restrict_columns(x: &DMatrix<f64>, keep: &[bool]) -> DMatrix<f64> {
    let columns: Vec<usize> = keep
        .iter()
        .enumerate()
        .filter_map(|(j, kept)| kept.then_some(j))
        .collect();
    x.select_columns(columns.iter())
}

/// Sweeps the symmetric matrix `a` on pivot `j` in place.
fn sweep(a: &mut DMatrix<f64>, j: usize) {
    let n = a.nrows();
    let d = a[(j, j)];
    for l in 0..n {
        a[(j, l)] /= d;
    }
    for i in 0..n {
        if i == j {
            continue;
        }
        let b = a[(i, j)];
        if b == 0.0 {
            continue;
        }
        for l in 0..n {
            a[(i, l)] -= b * a[(j, l)];
        }
        a[(i, j)] = -b / d;
    }
    a[(j, j)] = 1.0 / d;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_columns_are_all_kept() {
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        assert_eq!(basis(&x, None), vec![true, true]);
    }

    #[test]
    fn earliest_duplicate_is_kept() {
        let x = DMatrix::from_row_slice(
            4,
            4,
            &[
                1.0, 2.0, 2.0, 5.0, //
                1.0, 3.0, 3.0, 7.0, //
                1.0, 5.0, 5.0, 11.0, //
                1.0, 4.0, 4.0, 9.0,
            ],
        );
        // Column 3 equals 1 + 2 * column 1.
        let keep = basis(&x, None);
        assert_eq!(keep, vec![true, true, false, false]);
        let reduced = restrict_columns(&x, &keep);
        assert_eq!(reduced.ncols(), keep.iter().filter(|k| **k).count());
        assert_eq!(reduced.column(1), x.column(1));
    }

    #[test]
    fn zero_columns_are_dropped() {
        let x = DMatrix::from_row_slice(3, 2, &[0.0, 1.0, 0.0, 2.0, 0.0, 4.0]);
        assert_eq!(basis(&x, None), vec![false, true]);
    }

    #[test]
    fn reference_scale_catches_absorbed_columns() {
        // A column of norm ~1e3 before absorption that is left with a small residual.
        let x = DMatrix::from_row_slice(3, 1, &[1e-3, -2e-3, 1e-3]);
        assert_eq!(basis(&x, None), vec![true]);
        assert_eq!(basis(&x, Some(&[3e6])), vec![false]);
    }

    #[test]
    fn joint_basis_splits_flags_per_block() {
        let exo = DMatrix::from_row_slice(3, 1, &[1.0, 1.0, 1.0]);
        let z = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        let flags = joint_basis(&[&exo, &z], None);
        assert_eq!(flags, vec![vec![true], vec![true, false]]);
    }
}
