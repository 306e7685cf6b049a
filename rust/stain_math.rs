//! Small fixed-size kernels on 3×3 stain matrices, plus row-wise helpers for
//! `N × 3` point arrays.
//!
//! A [`StainMatrix`] stores one stain per row and the R, G, B optical density
//! components in the columns.

use crate::optical_density::OD_MIN;
use ndarray::{Array2, Axis};
use rayon::prelude::*;

pub type StainVector = [f64; 3];
pub type StainMatrix = [[f64; 3]; 3];

/// Direction used to fill an unused stain slot before inversion.
pub const DEFAULT_REPLACEMENT: StainVector = [1.0, 1.0, 1.0];

const ZERO_TOLERANCE: f64 = 1e-12;

#[inline]
pub fn norm(v: &StainVector) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

#[inline]
pub fn dot(a: &StainVector, b: &StainVector) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn cross(a: &StainVector, b: &StainVector) -> StainVector {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
pub fn is_zero_row(v: &StainVector) -> bool {
    v.iter().all(|x| x.abs() < ZERO_TOLERANCE)
}

/// Unit vector along `v`; zero-norm input is returned unchanged.
pub fn normalize_vector(v: &StainVector) -> StainVector {
    let n = norm(v);
    if n < ZERO_TOLERANCE {
        return *v;
    }
    [v[0] / n, v[1] / n, v[2] / n]
}

/// Normalize every row; zero rows stay zero.
pub fn normalize_rows(m: &StainMatrix) -> StainMatrix {
    [
        normalize_vector(&m[0]),
        normalize_vector(&m[1]),
        normalize_vector(&m[2]),
    ]
}

/// Replace every all-zero row by `replacement` (default `(1, 1, 1)`),
/// normalized. Non-zero rows are left untouched.
pub fn convert_zero_rows_to_unitary(
    m: &StainMatrix,
    replacement: Option<StainVector>,
) -> StainMatrix {
    let unit = normalize_vector(&replacement.unwrap_or(DEFAULT_REPLACEMENT));
    let mut out = *m;
    for row in out.iter_mut() {
        if is_zero_row(row) {
            *row = unit;
        }
    }
    out
}

/// Fill zero rows so the matrix can be inverted. The first zero row takes
/// the normalized default direction. Any further zero row takes the
/// normalized cross product of the other two rows, falling back to the
/// default direction when that product vanishes.
pub fn fill_empty_rows(m: &StainMatrix) -> StainMatrix {
    let unit = normalize_vector(&DEFAULT_REPLACEMENT);
    let empty: Vec<usize> = (0..3).filter(|&i| is_zero_row(&m[i])).collect();
    let mut out = *m;
    for (n, &i) in empty.iter().enumerate() {
        if n == 0 {
            out[i] = unit;
            continue;
        }
        let c = cross(&out[(i + 1) % 3], &out[(i + 2) % 3]);
        out[i] = if is_zero_row(&c) { unit } else { normalize_vector(&c) };
    }
    out
}

pub fn determinant(m: &StainMatrix) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Closed-form inverse via cofactors.
///
/// A matrix whose determinant magnitude is below [`OD_MIN`] yields the zero
/// matrix.
pub fn invert_3x3(m: &StainMatrix) -> StainMatrix {
    let det = determinant(m);
    if det.abs() < OD_MIN {
        return [[0.0; 3]; 3];
    }
    let inv_det = 1.0 / det;
    [
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ]
}

/// `m · v` with `v` as a column vector.
#[inline]
pub fn multiply_matrix_vector(m: &StainMatrix, v: &StainVector) -> StainVector {
    [dot(&m[0], v), dot(&m[1], v), dot(&m[2], v)]
}

/// `v · m` with `v` as a row vector.
#[inline]
pub fn multiply_vector_matrix(v: &StainVector, m: &StainMatrix) -> StainVector {
    [
        v[0] * m[0][0] + v[1] * m[1][0] + v[2] * m[2][0],
        v[0] * m[0][1] + v[1] * m[1][1] + v[2] * m[2][1],
        v[0] * m[0][2] + v[1] * m[1][2] + v[2] * m[2][2],
    ]
}

pub fn transpose(m: &StainMatrix) -> StainMatrix {
    [
        [m[0][0], m[1][0], m[2][0]],
        [m[0][1], m[1][1], m[2][1]],
        [m[0][2], m[1][2], m[2][2]],
    ]
}

/// Fill an empty third row with the normalized cross product of the first
/// two. Other matrices are returned unchanged.
pub fn complement_stain_matrix(m: &StainMatrix) -> StainMatrix {
    if !is_zero_row(&m[2]) || is_zero_row(&m[0]) || is_zero_row(&m[1]) {
        return *m;
    }
    let mut third = normalize_vector(&cross(&normalize_vector(&m[0]), &normalize_vector(&m[1])));
    if third.iter().sum::<f64>() < 0.0 {
        third = third.map(|x| -x);
    }
    let mut out = *m;
    out[2] = third;
    out
}

/// Number of stain slots in use: rows up to and including the last non-zero
/// one. Zero rows before it are empty slots and still count.
pub fn stain_count(m: &StainMatrix) -> usize {
    m.iter().rposition(|row| !is_zero_row(row)).map_or(0, |last| last + 1)
}

/// Build a stain matrix from up to three vectors, zero-filling the rest.
pub fn stain_matrix_from_vectors(vectors: &[StainVector]) -> StainMatrix {
    let mut m = [[0.0; 3]; 3];
    for (row, v) in m.iter_mut().zip(vectors.iter()) {
        *row = *v;
    }
    m
}

/// Normalize each row of an `N × C` array; zero rows stay zero.
pub fn normalize_array_rows(m: &Array2<f64>) -> Array2<f64> {
    let mut result = m.clone();
    result
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let n = row.dot(&row).sqrt();
            if n > ZERO_TOLERANCE {
                row.mapv_inplace(|x| x / n);
            } else {
                row.fill(0.0);
            }
        });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    const HE: StainMatrix = [
        [0.650, 0.704, 0.286],
        [0.268, 0.570, 0.776],
        [0.0, 0.0, 0.0],
    ];

    #[test]
    fn inverse_times_matrix_is_identity() {
        let m = convert_zero_rows_to_unitary(&HE, None);
        let inv = invert_3x3(&m);
        for (i, row) in m.iter().enumerate() {
            let r = multiply_vector_matrix(row, &inv);
            for (j, &v) in r.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(v, expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn singular_matrix_inverts_to_zero() {
        let m = [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 1.0, 0.0]];
        assert_eq!(invert_3x3(&m), [[0.0; 3]; 3]);
    }

    #[test]
    fn zero_row_substitution_keeps_other_rows() {
        let out = convert_zero_rows_to_unitary(&HE, None);
        assert_eq!(out[0], HE[0]);
        assert_eq!(out[1], HE[1]);
        let s = 1.0 / 3f64.sqrt();
        for v in out[2] {
            assert_abs_diff_eq!(v, s, epsilon = 1e-12);
        }

        let custom = convert_zero_rows_to_unitary(&HE, Some([0.0, 0.0, 2.0]));
        assert_eq!(custom[2], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn two_empty_rows_stay_invertible() {
        let gap = [[0.0; 3], normalize_vector(&HE[1]), [0.0; 3]];
        // Plain substitution puts the same row in both slots.
        assert_eq!(invert_3x3(&convert_zero_rows_to_unitary(&gap, None)), [[0.0; 3]; 3]);

        let filled = fill_empty_rows(&gap);
        assert_eq!(filled[1], gap[1]);
        assert_abs_diff_eq!(norm(&filled[2]), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dot(&filled[2], &filled[0]), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dot(&filled[2], &filled[1]), 0.0, epsilon = 1e-12);
        assert!(determinant(&filled).abs() > 0.1);

        // One empty row behaves like plain substitution.
        assert_eq!(fill_empty_rows(&HE), convert_zero_rows_to_unitary(&HE, None));
    }

    #[test]
    fn normalize_skips_zero_rows() {
        let n = normalize_rows(&[[3.0, 0.0, 4.0], [0.0; 3], [0.0, 2.0, 0.0]]);
        assert_abs_diff_eq!(n[0][0], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(n[0][2], 0.8, epsilon = 1e-12);
        assert_eq!(n[1], [0.0; 3]);
        assert_eq!(n[2], [0.0, 1.0, 0.0]);
    }

    #[test]
    fn matrix_vector_orders_differ_by_transpose() {
        let m = [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 10.0]];
        let v = [1.0, -1.0, 2.0];
        assert_eq!(multiply_vector_matrix(&v, &m), multiply_matrix_vector(&transpose(&m), &v));
        assert_eq!(multiply_matrix_vector(&m, &v), [5.0, 11.0, 19.0]);
    }

    #[test]
    fn complement_is_orthogonal_unit_row() {
        let c = complement_stain_matrix(&HE);
        assert_abs_diff_eq!(norm(&c[2]), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dot(&c[2], &normalize_vector(&HE[0])), 0.0, epsilon = 1e-12);
        assert_eq!(stain_count(&HE), 2);
        assert_eq!(stain_count(&c), 3);
    }

    #[test]
    fn stain_count_keeps_empty_leading_slots() {
        let gap = [[0.0; 3], HE[1], [0.0; 3]];
        assert_eq!(stain_count(&gap), 2);
        assert_eq!(stain_count(&[[0.0; 3]; 3]), 0);
        assert_eq!(stain_count(&[HE[0], [0.0; 3], HE[1]]), 3);
    }

    #[test]
    fn normalize_array_rows_keeps_zero_rows() {
        let m = array![[3.0, 4.0, 0.0], [0.0, 0.0, 0.0]];
        let n = normalize_array_rows(&m);
        assert_abs_diff_eq!(n[[0, 1]], 0.8, epsilon = 1e-12);
        assert_eq!(n.row(1).sum(), 0.0);
    }
}
