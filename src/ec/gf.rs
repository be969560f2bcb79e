//! GF(2^8) arithmetic
//!
//! Thin layer over the `galois_8` field of `reed-solomon-erasure`. The slice
//! multiply-accumulate is the only kernel the compute engine needs; the
//! dense [`Matrix`] type is used to build and invert coding matrices.

use reed_solomon_erasure::galois_8;

use crate::error::{Error, Result};

// =============================================================================
// Kernel
// =============================================================================

/// Overwrite `target` with `Σ coefs[i] · inputs[i]` over GF(2^8).
///
/// Addition is XOR. All inputs must have the same length as `target`.
pub fn linear_combination(target: &mut [u8], inputs: &[&[u8]], coefs: &[u8]) {
    debug_assert_eq!(inputs.len(), coefs.len());
    target.fill(0);
    for (input, &coef) in inputs.iter().zip(coefs) {
        if coef != 0 {
            galois_8::mul_slice_xor(coef, input, target);
        }
    }
}

/// Multiply two field elements.
#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    galois_8::mul(a, b)
}

/// Multiplicative inverse of a non-zero element.
#[inline]
pub fn inv(a: u8) -> u8 {
    galois_8::div(1, a)
}

// =============================================================================
// Matrix
// =============================================================================

/// Dense row-major matrix over GF(2^8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    /// All-zero matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    /// Identity matrix.
    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1);
        }
        m
    }

    /// Build from row vectors. Every row must have the same length.
    pub fn from_rows(rows: &[Vec<u8>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(Error::InvalidEcConfig("ragged matrix rows".into()));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data: rows.concat(),
        })
    }

    /// Systematic generator for an `n = k + m` code: identity on top of a
    /// Cauchy block. Any `k` of its rows form an invertible matrix.
    pub fn systematic_cauchy(n: usize, k: usize) -> Result<Self> {
        if k == 0 || n < k {
            return Err(Error::InvalidEcConfig(format!(
                "need 0 < k <= n, got n={}, k={}",
                n, k
            )));
        }
        if n > 256 {
            return Err(Error::InvalidEcConfig(
                "n must be <= 256 for GF(2^8)".into(),
            ));
        }

        let mut m = Self::zeros(n, k);
        for i in 0..k {
            m.set(i, i, 1);
        }
        for i in k..n {
            for j in 0..k {
                // x_i = i, y_j = j; i != j so x_i + y_j is never zero
                m.set(i, j, inv((i as u8) ^ (j as u8)));
            }
        }
        Ok(m)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: u8) {
        self.data[r * self.cols + c] = v;
    }

    /// One row as a slice.
    pub fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// New matrix made of the given rows, in order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut out = Self::zeros(rows.len(), self.cols);
        for (i, &r) in rows.iter().enumerate() {
            out.data[i * self.cols..(i + 1) * self.cols].copy_from_slice(self.row(r));
        }
        out
    }

    /// Matrix product `self · rhs`.
    pub fn mul(&self, rhs: &Matrix) -> Result<Matrix> {
        if self.cols != rhs.rows {
            return Err(Error::InvalidEcConfig(format!(
                "cannot multiply {}x{} by {}x{}",
                self.rows, self.cols, rhs.rows, rhs.cols
            )));
        }
        let mut out = Self::zeros(self.rows, rhs.cols);
        for r in 0..self.rows {
            for c in 0..rhs.cols {
                let mut acc = 0u8;
                for i in 0..self.cols {
                    acc ^= mul(self.get(r, i), rhs.get(i, c));
                }
                out.set(r, c, acc);
            }
        }
        Ok(out)
    }

    /// Gauss-Jordan inverse.
    pub fn invert(&self) -> Result<Matrix> {
        if self.rows != self.cols {
            return Err(Error::SingularMatrix(format!(
                "{}x{} matrix is not square",
                self.rows, self.cols
            )));
        }
        let n = self.rows;
        let mut work = self.clone();
        let mut out = Self::identity(n);

        for col in 0..n {
            let pivot = (col..n)
                .find(|&r| work.get(r, col) != 0)
                .ok_or_else(|| Error::SingularMatrix(format!("no pivot in column {}", col)))?;
            if pivot != col {
                work.swap_rows(pivot, col);
                out.swap_rows(pivot, col);
            }

            let scale = inv(work.get(col, col));
            work.scale_row(col, scale);
            out.scale_row(col, scale);

            for r in 0..n {
                let factor = work.get(r, col);
                if r != col && factor != 0 {
                    work.add_scaled_row(r, col, factor);
                    out.add_scaled_row(r, col, factor);
                }
            }
        }
        Ok(out)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        for c in 0..self.cols {
            self.data.swap(a * self.cols + c, b * self.cols + c);
        }
    }

    fn scale_row(&mut self, r: usize, factor: u8) {
        for c in 0..self.cols {
            let v = self.get(r, c);
            self.set(r, c, mul(v, factor));
        }
    }

    /// row[dst] += factor · row[src]
    fn add_scaled_row(&mut self, dst: usize, src: usize, factor: u8) {
        for c in 0..self.cols {
            let v = self.get(dst, c) ^ mul(self.get(src, c), factor);
            self.set(dst, c, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_linear_combination_matches_scalar_math() {
        let a = [1u8, 2, 3, 250];
        let b = [9u8, 0, 77, 1];
        let mut out = [0xffu8; 4];

        linear_combination(&mut out, &[&a, &b], &[3, 7]);

        for i in 0..4 {
            assert_eq!(out[i], mul(a[i], 3) ^ mul(b[i], 7));
        }
    }

    #[test]
    fn test_linear_combination_overwrites_target() {
        let a = [5u8; 8];
        let mut out = [0xaau8; 8];
        linear_combination(&mut out, &[&a], &[0]);
        assert_eq!(out, [0u8; 8]);
    }

    #[test]
    fn test_invert_roundtrip() {
        let g = Matrix::systematic_cauchy(6, 4).unwrap();
        let sub = g.select_rows(&[1, 2, 4, 5]);
        let inv = sub.invert().unwrap();

        assert_eq!(sub.mul(&inv).unwrap(), Matrix::identity(4));
        assert_eq!(inv.mul(&sub).unwrap(), Matrix::identity(4));
    }

    #[test]
    fn test_any_k_rows_invertible() {
        let (n, k) = (6, 3);
        let g = Matrix::systematic_cauchy(n, k).unwrap();
        for a in 0..n {
            for b in a + 1..n {
                for c in b + 1..n {
                    assert!(g.select_rows(&[a, b, c]).invert().is_ok());
                }
            }
        }
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let m = Matrix::from_rows(&[vec![1, 2], vec![1, 2]]).unwrap();
        assert_matches!(m.invert(), Err(Error::SingularMatrix(_)));
    }

    #[test]
    fn test_generator_shape_checks() {
        assert!(Matrix::systematic_cauchy(3, 0).is_err());
        assert!(Matrix::systematic_cauchy(2, 3).is_err());
        assert!(Matrix::systematic_cauchy(300, 4).is_err());
        assert!(Matrix::from_rows(&[vec![1], vec![1, 2]]).is_err());
    }
}
