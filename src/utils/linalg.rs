//! Host-side symmetric eigendecompositions for damped factor powers
//!
//! Factor matrices are small (layer fan-in or fan-out), so their spectral
//! functions are evaluated on the host with nalgebra and uploaded back.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

fn from_row_major(data: &[f64], n: usize) -> DMatrix<f64> {
    DMatrix::from_row_slice(n, n, data)
}

fn to_row_major(m: &DMatrix<f64>) -> Vec<f64> {
    let mut out = Vec::with_capacity(m.nrows() * m.ncols());
    for i in 0..m.nrows() {
        for j in 0..m.ncols() {
            out.push(m[(i, j)]);
        }
    }
    out
}

fn damped(cov: &[f64], n: usize, damping: f64) -> DMatrix<f64> {
    let mut m = from_row_major(cov, n);
    for i in 0..n {
        m[(i, i)] += damping;
    }
    m
}

/// `V f(Λ) Vᵀ` for a symmetric matrix with eigenpairs `(Λ, V)`.
fn spectral_map(m: DMatrix<f64>, f: impl Fn(f64) -> f64) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(m);
    let mapped = DVector::from_iterator(
        eigen.eigenvalues.len(),
        eigen.eigenvalues.iter().map(|&v| f(v)),
    );
    let diag = DMatrix::from_diagonal(&mapped);
    &eigen.eigenvectors * diag * eigen.eigenvectors.transpose()
}

/// `(cov + damping·I)^exp`, row-major.
pub(crate) fn damped_matpower(cov: &[f64], n: usize, damping: f64, exp: f64) -> Vec<f64> {
    let m = damped(cov, n, damping);
    if exp == 1.0 {
        return to_row_major(&m);
    }
    to_row_major(&spectral_map(m, |v| v.powf(exp)))
}

/// Option-1 series quantities: `L = C0^{-1/2} U` and `ψ`, where
/// `C0^{-1/2} sym(C1) C0^{-1/2} = U diag(ψ) Uᵀ`.
pub(crate) fn series_option1(
    cov: &[f64],
    cov_dt1: &[f64],
    n: usize,
    damping: f64,
) -> (Vec<f64>, Vec<f64>) {
    let c0_inv_sqrt = spectral_map(damped(cov, n, damping), |v| v.powf(-0.5));
    let c1 = from_row_major(cov_dt1, n);
    let c1_sym = (&c1 + c1.transpose()) * 0.5;
    let hpsi = &c0_inv_sqrt * c1_sym * &c0_inv_sqrt;
    let eigen = SymmetricEigen::new(hpsi);
    let l = &c0_inv_sqrt * &eigen.eigenvectors;
    (to_row_major(&l), eigen.eigenvalues.iter().copied().collect())
}

/// Option-2 series quantities `(P, K, μ)`: `P = C1ᵀ C0⁻¹`, and with
/// `Ψ̂ = C0^{-1/2} C1 C0^{-1/2}`, `Ψ̂ Ψ̂ᵀ = E diag(μ) Eᵀ`, `K = C0^{-1/2} E`.
pub(crate) fn series_option2(
    cov: &[f64],
    cov_dt1: &[f64],
    n: usize,
    damping: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let c0 = damped(cov, n, damping);
    let c0_inv = spectral_map(c0.clone(), |v| 1.0 / v);
    let c0_inv_sqrt = spectral_map(c0, |v| v.powf(-0.5));
    let c1 = from_row_major(cov_dt1, n);

    let p = c1.transpose() * &c0_inv;
    let hpsi = &c0_inv_sqrt * &c1 * &c0_inv_sqrt;
    let eigen = SymmetricEigen::new(&hpsi * hpsi.transpose());
    let k = &c0_inv_sqrt * &eigen.eigenvectors;
    (
        to_row_major(&p),
        to_row_major(&k),
        eigen.eigenvalues.iter().copied().collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_damped_inverse() {
        // [[2, 1], [1, 2]] + 1·I = [[3, 1], [1, 3]], inverse = [[3, -1], [-1, 3]] / 8
        let inv = damped_matpower(&[2.0, 1.0, 1.0, 2.0], 2, 1.0, -1.0);
        let expected = [0.375, -0.125, -0.125, 0.375];
        for (a, b) in inv.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-10, "{a} vs {b}");
        }
    }

    #[test]
    fn test_exp_one_is_damped_matrix() {
        let m = damped_matpower(&[1.0, 0.5, 0.5, 4.0], 2, 0.25, 1.0);
        assert_eq!(m, vec![1.25, 0.5, 0.5, 4.25]);
    }

    #[test]
    fn test_option1_whitens_cov() {
        // Lᵀ C0 L = I since L = C0^{-1/2} U with U orthogonal.
        let cov = [2.0, 0.3, 0.3, 1.0];
        let dt1 = [0.4, 0.1, -0.2, 0.3];
        let (l, psi) = series_option1(&cov, &dt1, 2, 0.1);
        assert_eq!(psi.len(), 2);
        let l = from_row_major(&l, 2);
        let c0 = damped(&cov, 2, 0.1);
        let ident = l.transpose() * c0 * l;
        assert!((ident[(0, 0)] - 1.0).abs() < 1e-9);
        assert!((ident[(1, 1)] - 1.0).abs() < 1e-9);
        assert!(ident[(0, 1)].abs() < 1e-9);
    }

    #[test]
    fn test_option2_zero_lag_is_trivial() {
        let cov = [1.0, 0.0, 0.0, 1.0];
        let (p, _k, mu) = series_option2(&cov, &[0.0; 4], 2, 0.0);
        assert!(p.iter().all(|v| v.abs() < 1e-12));
        assert!(mu.iter().all(|v| v.abs() < 1e-12));
    }
}
