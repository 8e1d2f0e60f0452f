//! Miscellaneous linear-algebra tools.
//!
//! Superoperators act on row-major vectorized matrices, i.e. `X` of shape
//! `(n, n)` is flattened to `vec(X)` of length `n²` in standard (C) order. In
//! this convention `vec(A X B) = (A ⊗ Bᵀ) vec(X)`.

use ndarray::{ self as nd, linalg::kron, Ix2 };
use ndarray_linalg::{ error::LinalgError, Inverse };
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };

/// Conjugate transpose of a matrix.
pub fn dagger<S>(a: &nd::ArrayBase<S, Ix2>) -> nd::Array2<C64>
where S: nd::Data<Elem = C64>
{
    a.t().mapv(|ak| ak.conj())
}

/// Complex identity matrix.
pub fn eye(n: usize) -> nd::Array2<C64> {
    nd::Array2::from_diag_elem(n, C64::one())
}

/// Trace of a square matrix.
pub fn trace<S>(a: &nd::ArrayBase<S, Ix2>) -> C64
where S: nd::Data<Elem = C64>
{
    a.diag().iter().fold(C64::zero(), |acc, ak| acc + ak)
}

/// Superoperator for the map `X ↦ A X B`.
pub fn sprepost<S, T>(a: &nd::ArrayBase<S, Ix2>, b: &nd::ArrayBase<T, Ix2>)
    -> nd::Array2<C64>
where
    S: nd::Data<Elem = C64>,
    T: nd::Data<Elem = C64>,
{
    kron(a, &b.t())
}

/// Superoperator for the map `X ↦ A X`.
pub fn spre<S>(a: &nd::ArrayBase<S, Ix2>) -> nd::Array2<C64>
where S: nd::Data<Elem = C64>
{
    kron(a, &eye(a.nrows()))
}

/// Superoperator for the map `X ↦ X B`.
pub fn spost<S>(b: &nd::ArrayBase<S, Ix2>) -> nd::Array2<C64>
where S: nd::Data<Elem = C64>
{
    kron(&eye(b.nrows()), &b.t())
}

/// Return `true` if all elements of `a` are finite.
pub fn all_finite<S, D>(a: &nd::ArrayBase<S, D>) -> bool
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    a.iter().all(|ak| ak.re.is_finite() && ak.im.is_finite())
}

/// Expectation value of `e` in the state `y`, which is either a ket of shape
/// `(n, 1)` or a density matrix of shape `(n, n)`.
pub fn expect<S, T>(e: &nd::ArrayBase<S, Ix2>, y: &nd::ArrayBase<T, Ix2>) -> C64
where
    S: nd::Data<Elem = C64>,
    T: nd::Data<Elem = C64>,
{
    if y.ncols() == 1 {
        let ey = e.dot(y);
        y.iter().zip(ey.iter())
            .fold(C64::zero(), |acc, (yk, eyk)| acc + yk.conj() * eyk)
    } else {
        // tr(E ρ) without forming the product
        e.outer_iter().enumerate()
            .map(|(i, ei)| {
                ei.iter().zip(y.column(i))
                    .fold(C64::zero(), |acc, (eij, yji)| acc + eij * yji)
            })
            .fold(C64::zero(), |acc, x| acc + x)
    }
}

/// Convert a batch of kets `(b, n, 1)` to density matrices `(b, n, n)`; batches
/// of density matrices are returned unchanged.
pub fn todm(y: nd::Array3<C64>) -> nd::Array3<C64> {
    if y.shape()[2] != 1 { return y; }
    let (b, n, _) = y.dim();
    let mut rho: nd::Array3<C64> = nd::Array3::zeros((b, n, n));
    nd::Zip::from(rho.outer_iter_mut()).and(y.outer_iter())
        .for_each(|mut rhok, psik| {
            rhok.assign(&psik.dot(&dagger(&psik)));
        });
    rho
}

/// Padé(13, 13) coefficients for the matrix exponential, normalized so that
/// the first is 1 (Higham 2005).
const PADE_COEFFS: [f64; 14] = [
    1.0,
    0.5,
    0.12,
    1.833_333_333_333_333_4e-2,
    1.992_753_623_188_405_8e-3,
    1.630_434_782_608_696e-4,
    1.035_196_687_401_6e-5,
    5.175_983_437_008_01e-7,
    2.043_151_356_652_5e-8,
    6.306_022_705_717_593e-10,
    1.483_770_048_404_14e-11,
    2.529_153_491_597_966e-13,
    2.810_170_546_219_962_4e-15,
    1.544_049_750_670_309e-17,
];

// largest 1-norm for which Padé(13, 13) is accurate to double precision
const THETA_13: f64 = 5.371_920_351_148_152;

fn norm_1<S>(a: &nd::ArrayBase<S, Ix2>) -> f64
where S: nd::Data<Elem = C64>
{
    a.columns().into_iter()
        .map(|col| col.iter().map(|ak| ak.norm()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Matrix exponential via scaling and squaring with a Padé(13, 13)
/// approximant.
///
/// *Panics if `a` is not square*.
pub fn expm<S>(a: &nd::ArrayBase<S, Ix2>) -> Result<nd::Array2<C64>, LinalgError>
where S: nd::Data<Elem = C64>
{
    let n = a.nrows();
    assert_eq!(n, a.ncols(), "expm requires a square matrix");
    let norm = norm_1(a);
    let s: i32
        = if norm > THETA_13 {
            (norm / THETA_13).log2().ceil() as i32
        } else {
            0
        };
    let a = a.mapv(|ak| ak / 2.0_f64.powi(s));
    let b = |k: usize| C64::from(PADE_COEFFS[k]);
    let id = eye(n);
    let a2 = a.dot(&a);
    let a4 = a2.dot(&a2);
    let a6 = a2.dot(&a4);
    let w1 = &a6 * b(13) + &a4 * b(11) + &a2 * b(9);
    let w2
        = w1.dot(&a6) + &a6 * b(7) + &a4 * b(5) + &a2 * b(3) + &id * b(1);
    let u = a.dot(&w2);
    let z1 = &a6 * b(12) + &a4 * b(10) + &a2 * b(8);
    let v
        = z1.dot(&a6) + &a6 * b(6) + &a4 * b(4) + &a2 * b(2) + &id * b(0);
    // exp(A) ≈ (V - U)⁻¹ (V + U)
    let mut r = (&v - &u).inv()?.dot(&(&v + &u));
    for _ in 0..s {
        r = r.dot(&r);
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_diff(a: &nd::Array2<C64>, b: &nd::Array2<C64>) -> f64 {
        (a - b).iter().map(|x| x.norm()).fold(0.0, f64::max)
    }

    #[test]
    fn expm_rotation() {
        let theta = 0.7;
        let a = nd::array![
            [C64::zero(), C64::new(0.0, -theta)],
            [C64::new(0.0, -theta), C64::zero()],
        ];
        let u = expm(&a).unwrap();
        let expected = nd::array![
            [C64::from(theta.cos()), C64::new(0.0, -theta.sin())],
            [C64::new(0.0, -theta.sin()), C64::from(theta.cos())],
        ];
        assert!(max_diff(&u, &expected) < 1e-13);
    }

    #[test]
    fn expm_large_norm_is_scaled() {
        let a = nd::array![
            [C64::from(30.0), C64::zero()],
            [C64::zero(), C64::from(-30.0)],
        ];
        let r = expm(&a).unwrap();
        assert!((r[[0, 0]].re - 30.0_f64.exp()).abs() / 30.0_f64.exp() < 1e-12);
        assert!((r[[1, 1]].re - (-30.0_f64).exp()).abs() < 1e-20);
        assert!(r[[0, 1]].norm() < 1e-12);
    }

    #[test]
    fn sprepost_matches_products() {
        let a = nd::array![
            [C64::new(1.0, 2.0), C64::new(0.5, 0.0)],
            [C64::new(0.0, -1.0), C64::new(3.0, 1.0)],
        ];
        let b = nd::array![
            [C64::new(0.0, 1.0), C64::new(2.0, 0.0)],
            [C64::new(1.0, 1.0), C64::new(-1.0, 0.0)],
        ];
        let x = nd::array![
            [C64::new(0.3, 0.0), C64::new(0.1, 0.2)],
            [C64::new(0.1, -0.2), C64::new(0.7, 0.0)],
        ];
        let vx = x.clone().into_shape(4).unwrap();
        let lhs = sprepost(&a, &b).dot(&vx);
        let rhs = a.dot(&x).dot(&b).into_shape(4).unwrap();
        assert!((&lhs - &rhs).iter().all(|d| d.norm() < 1e-14));
        let lhs = (spre(&a) + spost(&b)).dot(&vx);
        let rhs = (a.dot(&x) + x.dot(&b)).into_shape(4).unwrap();
        assert!((&lhs - &rhs).iter().all(|d| d.norm() < 1e-14));
    }

    #[test]
    fn expectation_values() {
        let sz = nd::array![
            [C64::one(), C64::zero()],
            [C64::zero(), -C64::one()],
        ];
        let psi = nd::array![[C64::from(0.6)], [C64::from(0.8)]];
        assert!((expect(&sz, &psi) - C64::from(0.36 - 0.64)).norm() < 1e-14);
        let rho = todm(psi.clone().insert_axis(nd::Axis(0)));
        let rho = rho.index_axis(nd::Axis(0), 0);
        assert!((expect(&sz, &rho) - C64::from(0.36 - 0.64)).norm() < 1e-14);
        assert!((trace(&rho) - C64::one()).norm() < 1e-14);
    }
}
