//! Action of the matrix exponential on a vector or a batch of vectors, without
//! ever forming the exponential itself.
//!
//! The generator is first shifted by `μ = tr(A)/N` so that the series runs on
//! a better-conditioned matrix, then split into `s` equal pieces so that a
//! truncated Taylor series of `exp(A/s)` is accurate to the requested
//! tolerance; the series is applied `s` times in succession and the result is
//! rescaled by `exp(μ)`.
//!
//! See Al-Mohy & Higham (2011), "Computing the Action of the Matrix
//! Exponential, with an Application to Exponential Integrators", SIAM J. Sci.
//! Comput. 33(2), 488, §3.1 for the shift.

use ndarray as nd;
use num_complex::Complex64 as C64;
use serde::Deserialize;
use tracing::{ debug, trace };
use crate::{
    error::{ ExpmError, ExpmResult },
    operator::{ Norms, Operator, SquareOps },
};

/// Default truncation tolerance, `2^-53`.
pub const DEFAULT_TOLERANCE: f64 = f64::EPSILON / 2.0;

// Unit roundoff scale and the point at which the peak series term is
// considered large enough that further growth does not matter.
const PRECISION: f64 = 1e-16;
const PEAK_CAP: f64 = 1e16;

/// Largest number of pieces an operator will be split into.
pub const MAX_SCALE: usize = 1 << 20;

/// Positive bound on the truncation error of the series approximation.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Deserialize)]
#[serde(try_from = "f64")]
pub struct Tolerance(f64);

impl Default for Tolerance {
    fn default() -> Self { Self(DEFAULT_TOLERANCE) }
}

impl TryFrom<f64> for Tolerance {
    type Error = ExpmError;

    fn try_from(tol: f64) -> ExpmResult<Self> { Self::new(tol) }
}

impl Tolerance {
    /// Create a new `Tolerance`.
    ///
    /// Fails if `tol` is not finite or lies below the working precision of
    /// `1e-16`, which no amount of splitting can beat.
    pub fn new(tol: f64) -> ExpmResult<Self> {
        (tol.is_finite() && tol >= PRECISION).then_some(Self(tol))
            .ok_or(ExpmError::InvalidTolerance(tol))
    }

    /// Use `tol` if given, otherwise [`DEFAULT_TOLERANCE`].
    pub fn or_default(tol: Option<f64>) -> ExpmResult<Self> {
        tol.map(Self::new).unwrap_or_else(|| Ok(Self::default()))
    }

    /// Return the underlying value.
    pub fn value(&self) -> f64 { self.0 }
}

/// Estimate the largest term `x^k / k!` of the exponential series for an
/// operator of norm `x`, saturating at `PEAK_CAP`.
fn peak_term(x: f64) -> f64 {
    let mut peak: f64 = 1.0;
    for k in 1..(x.floor() as usize) {
        peak *= x / k as f64;
        if peak >= PEAK_CAP {
            break;
        }
    }
    peak
}

/// Find the number of pieces `s` into which an operator of ∞-norm `norm` must
/// be split so that the peak series term of each piece, taken at unit
/// roundoff, falls below `tol`.
///
/// The peak term only shrinks as `s` grows, so the smallest such `s` is found
/// by bisection over `1..=min(floor(norm) + 1, MAX_SCALE)`. Fails with
/// [`ExpmError::ToleranceUnreachable`] if even the largest allowed `s` is not
/// enough, and with [`ExpmError::NumericalOverflow`] if `norm` is not finite.
pub fn scale_factor(norm: f64, tol: Tolerance) -> ExpmResult<usize> {
    if !norm.is_finite() {
        return Err(ExpmError::NumericalOverflow { stage: "norm estimate" });
    }
    if norm == 0.0 {
        return Ok(1);
    }
    let bound = (norm.floor() + 1.0).min(MAX_SCALE as f64) as usize;
    let fits = |s: usize| PRECISION * peak_term(norm / s as f64) <= tol.value();
    if !fits(bound) {
        return Err(ExpmError::ToleranceUnreachable { tol: tol.value(), bound });
    }
    let (mut lo, mut hi) = (1, bound);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if fits(mid) { hi = mid; } else { lo = mid + 1; }
    }
    Ok(lo)
}

/// Upper bound on the number of series terms for a piece of norm `x` applied
/// to vectors of ∞-norm `b_norm`.
fn term_bound(x: f64, b_norm: f64) -> usize {
    64 + 8 * x.ceil() as usize + 4 * b_norm.max(1.0).log10().ceil() as usize
}

/// Compute `exp(A) B` for a batch `B` whose columns are independent vectors.
///
/// Fails if `A` is not square, if `B` does not have `N` rows, if the series
/// cannot meet `tol` within its iteration bound, or if any non-finite value is
/// produced.
pub fn expm_multiply<S>(
    a: &Operator,
    b: &nd::ArrayBase<S, nd::Ix2>,
    tol: Tolerance,
) -> ExpmResult<nd::Array2<C64>>
where S: nd::Data<Elem = C64>
{
    let n = a.dim()?;
    if b.nrows() != n {
        return Err(ExpmError::shape(
            "state batch rows", n, b.nrows()));
    }
    if n == 0 {
        return Ok(b.to_owned());
    }
    let mu: C64 = a.trace() / n as f64;
    let eta: C64 = mu.exp();
    let a = a.shifted(mu);
    let a_norm = a.inf_norm();
    trace!(dim = n, mu = %mu, norm = a_norm, "shifted generator");
    if !a_norm.is_finite() || !eta.is_finite() {
        return Err(ExpmError::NumericalOverflow { stage: "trace shift" });
    }
    if a_norm == 0.0 {
        return finite(b.mapv(|x| x * eta), "trace shift");
    }

    let s = scale_factor(a_norm, tol)?;
    let sf = s as f64;
    let mut c1 = b.inf_norm();
    let bound = term_bound(a_norm / sf, c1);
    let mut f: nd::Array2<C64> = b.to_owned();
    let mut term: nd::Array2<C64> = b.to_owned();
    let mut m: usize = 0;
    loop {
        let coeff = sf * (m + 1) as f64;
        term = a.dot(&term)?;
        term.mapv_inplace(|x| x / coeff);
        let c2 = term.inf_norm();
        if !c2.is_finite() {
            return Err(ExpmError::NumericalOverflow { stage: "series truncation" });
        }
        f += &term;
        m += 1;
        if c1 + c2 < tol.value() {
            break;
        }
        if m >= bound {
            return Err(ExpmError::ToleranceUnreachable { tol: tol.value(), bound });
        }
        c1 = c2;
    }
    for _ in 1..s {
        term.assign(&f);
        for j in 0..m {
            let coeff = sf * (j + 1) as f64;
            term = a.dot(&term)?;
            term.mapv_inplace(|x| x / coeff);
            f += &term;
        }
    }
    debug!(dim = n, batch = b.ncols(), scale = s, terms = m, "exponential action");
    f.mapv_inplace(|x| x * eta);
    finite(f, "accumulation")
}

/// Compute `exp(A) v` for a single vector.
///
/// See [`expm_multiply`].
pub fn expm_multiply_vec<S>(
    a: &Operator,
    v: &nd::ArrayBase<S, nd::Ix1>,
    tol: Tolerance,
) -> ExpmResult<nd::Array1<C64>>
where S: nd::Data<Elem = C64>
{
    let b = v.view().insert_axis(nd::Axis(1));
    expm_multiply(a, &b, tol)
        .map(|f| f.index_axis_move(nd::Axis(1), 0))
}

pub(crate) fn finite<D>(x: nd::Array<C64, D>, stage: &'static str)
    -> ExpmResult<nd::Array<C64, D>>
where D: nd::Dimension
{
    x.iter().all(|z| z.is_finite()).then_some(())
        .ok_or(ExpmError::NumericalOverflow { stage })
        .map(|_| x)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray_linalg::{ Eig, Eigh, Solve, UPLO };
    use rand::{ Rng, SeedableRng, rngs::StdRng };
    use crate::sparse::CsrMatrix;

    fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

    fn assert_close<D>(a: &nd::Array<C64, D>, b: &nd::Array<C64, D>, tol: f64)
    where D: nd::Dimension
    {
        assert_eq!(a.shape(), b.shape());
        for (k, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!(
                (x - y).norm() < tol,
                "mismatch at flat index {}: {} vs {} (diff={:e})",
                k, x, y, (x - y).norm(),
            );
        }
    }

    fn random_matrix(rng: &mut StdRng, n: usize, scale: f64)
        -> nd::Array2<C64>
    {
        nd::Array2::from_shape_fn(
            (n, n),
            |_| c(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)) * scale,
        )
    }

    fn random_vector(rng: &mut StdRng, n: usize) -> nd::Array1<C64> {
        nd::Array1::from_shape_fn(
            n, |_| c(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
    }

    #[test]
    fn rotation_generator() {
        let a = Operator::from(nd::array![
            [c(0.0, 0.0), c(1.0, 0.0)],
            [c(-1.0, 0.0), c(0.0, 0.0)],
        ]);
        let v = nd::array![c(1.0, 0.0), c(0.0, 0.0)];
        let tol = Tolerance::new(1e-12).unwrap();
        let w = expm_multiply_vec(&a, &v, tol).unwrap();
        let expected = nd::array![c(1.0_f64.cos(), 0.0), c(-1.0_f64.sin(), 0.0)];
        assert_close(&w, &expected, 1e-8);
    }

    #[test]
    fn zero_generator_is_identity() {
        let a = Operator::from(nd::Array2::<C64>::zeros((3, 3)));
        let v = nd::array![c(1.0, 2.0), c(-3.0, 0.5), c(0.0, 1.0)];
        let w = expm_multiply_vec(&a, &v, Tolerance::default()).unwrap();
        assert_eq!(w, v);
        let s = Operator::from(CsrMatrix::zeros((3, 3)));
        let w = expm_multiply_vec(&s, &v, Tolerance::default()).unwrap();
        assert_eq!(w, v);
    }

    // exp(A) v = V exp(Λ) V⁻¹ v
    fn eigen_action(a: &nd::Array2<C64>, v: &nd::Array1<C64>) -> nd::Array1<C64> {
        let (vals, vecs) = a.eig().unwrap();
        let coeffs = vecs.solve(v).unwrap();
        vecs.dot(&(coeffs * vals.mapv(|l| l.exp())))
    }

    #[test]
    fn matches_eigendecomposition() {
        let mut rng = StdRng::seed_from_u64(10546);
        for &(n, scale) in [(2, 0.3), (4, 1.0), (6, 2.0)].iter() {
            let a = random_matrix(&mut rng, n, scale);
            let v = random_vector(&mut rng, n);
            let expected = eigen_action(&a, &v);
            let w = expm_multiply_vec(&Operator::from(a), &v, Tolerance::default())
                .unwrap();
            let tol = 1e-9 * expected.inf_norm().max(1.0);
            assert_close(&w, &expected, tol);
        }
    }

    #[test]
    fn unitary_evolution_with_large_norm() {
        let mut rng = StdRng::seed_from_u64(2718);
        let h = random_matrix(&mut rng, 6, 10.0);
        let h = &h + &h.t().mapv(|x| x.conj());
        let a = h.mapv(|x| -C64::i() * x);
        let v = random_vector(&mut rng, 6);
        let (energies, vecs) = h.eigh(UPLO::Lower).unwrap();
        let phases = energies.mapv(|e| C64::from_polar(1.0, -e));
        let coeffs = vecs.t().mapv(|x| x.conj()).dot(&v);
        let expected = vecs.dot(&(coeffs * phases));
        let w = expm_multiply_vec(&Operator::from(a), &v, Tolerance::default())
            .unwrap();
        assert_close(&w, &expected, 1e-9);
        let norm_in: f64 = v.iter().map(|x| x.norm_sqr()).sum();
        let norm_out: f64 = w.iter().map(|x| x.norm_sqr()).sum();
        assert!((norm_in - norm_out).abs() < 1e-9);
    }

    #[test]
    fn trace_shift_is_compensated() {
        // exp(diag(1 + i, 2)) acting on a uniform vector
        let a = Operator::from(nd::array![
            [c(1.0, 1.0), c(0.0, 0.0)],
            [c(0.0, 0.0), c(2.0, 0.0)],
        ]);
        let v = nd::array![c(1.0, 0.0), c(1.0, 0.0)];
        let w = expm_multiply_vec(&a, &v, Tolerance::default()).unwrap();
        let expected = nd::array![c(1.0, 1.0).exp(), c(2.0, 0.0).exp()];
        assert_close(&w, &expected, 1e-12);
    }

    #[test]
    fn sparse_matches_dense() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut a = random_matrix(&mut rng, 8, 2.0);
        a.iter_mut().enumerate()
            .filter(|(k, _)| k % 3 != 0)
            .for_each(|(_, x)| { *x = C64::new(0.0, 0.0); });
        let b: nd::Array2<C64>
            = nd::Array2::from_shape_fn((8, 3), |_| c(rng.gen_range(-1.0..1.0), 0.0));
        let dense = expm_multiply(&Operator::from(a.clone()), &b, Tolerance::default())
            .unwrap();
        let sparse = expm_multiply(
            &Operator::from(CsrMatrix::from_dense(&a)), &b, Tolerance::default())
            .unwrap();
        assert_close(&dense, &sparse, 1e-12);
    }

    #[test]
    fn batch_columns_are_independent() {
        let mut rng = StdRng::seed_from_u64(99);
        let a = Operator::from(random_matrix(&mut rng, 4, 1.5));
        let b: nd::Array2<C64>
            = nd::Array2::from_shape_fn((4, 3), |_| c(rng.gen_range(-1.0..1.0), 0.0));
        let batch = expm_multiply(&a, &b, Tolerance::default()).unwrap();
        for (k, col) in b.columns().into_iter().enumerate() {
            let single = expm_multiply_vec(&a, &col, Tolerance::default()).unwrap();
            assert_close(&single, &batch.column(k).to_owned(), 1e-10);
        }
    }

    #[test]
    fn deterministic() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = Operator::from(random_matrix(&mut rng, 5, 4.0));
        let v = random_vector(&mut rng, 5);
        let w1 = expm_multiply_vec(&a, &v, Tolerance::default()).unwrap();
        let w2 = expm_multiply_vec(&a, &v, Tolerance::default()).unwrap();
        assert_eq!(w1, w2);
    }

    #[test]
    fn scale_factor_grows_with_norm() {
        let tol = Tolerance::default();
        assert_eq!(scale_factor(0.0, tol).unwrap(), 1);
        assert_eq!(scale_factor(1.5, tol).unwrap(), 1);
        let s_small = scale_factor(10.0, tol).unwrap();
        let s_large = scale_factor(100.0, tol).unwrap();
        assert!(s_small > 1);
        assert!(s_large > s_small);
        assert!(s_large <= 101);
    }

    #[test]
    fn scale_factor_is_smallest_sufficient() {
        let tol = Tolerance::default();
        for &norm in [0.5, 3.0, 17.5, 250.0, 4096.0].iter() {
            let s = scale_factor(norm, tol).unwrap();
            assert!(PRECISION * peak_term(norm / s as f64) <= tol.value());
            if s > 1 {
                assert!(PRECISION * peak_term(norm / (s - 1) as f64) > tol.value());
            }
        }
    }

    #[test]
    fn huge_norm_is_unreachable() {
        let tol = Tolerance::default();
        for &norm in [1e10, 1e20, 1e300].iter() {
            assert!(matches!(
                scale_factor(norm, tol),
                Err(ExpmError::ToleranceUnreachable { bound: MAX_SCALE, .. }),
            ));
        }
        let a = Operator::from(nd::array![
            [c(1e20, 0.0), c(0.0, 0.0)],
            [c(0.0, 0.0), c(-1e20, 0.0)],
        ]);
        let v = nd::array![c(1.0, 0.0), c(0.0, 0.0)];
        assert!(matches!(
            expm_multiply_vec(&a, &v, tol),
            Err(ExpmError::ToleranceUnreachable { .. }),
        ));
    }

    #[test]
    fn tolerance_below_precision_is_rejected() {
        assert!(matches!(Tolerance::new(1e-20), Err(ExpmError::InvalidTolerance(_))));
        assert!(Tolerance::new(1e-16).is_ok());
        assert!(Tolerance::new(DEFAULT_TOLERANCE).is_ok());
    }

    #[test]
    fn rejects_bad_shapes_and_tolerances() {
        let a = Operator::from(nd::Array2::<C64>::zeros((2, 3)));
        let v = nd::array![c(1.0, 0.0), c(0.0, 0.0)];
        assert!(matches!(
            expm_multiply_vec(&a, &v, Tolerance::default()),
            Err(ExpmError::Shape { .. }),
        ));
        let a = Operator::from(nd::Array2::<C64>::zeros((3, 3)));
        assert!(matches!(
            expm_multiply_vec(&a, &v, Tolerance::default()),
            Err(ExpmError::Shape { .. }),
        ));
        assert!(matches!(Tolerance::new(0.0), Err(ExpmError::InvalidTolerance(_))));
        assert!(Tolerance::new(f64::NAN).is_err());
        assert_eq!(Tolerance::or_default(None).unwrap().value(), 2.0_f64.powi(-53));
    }

    #[test]
    fn overflow_is_reported() {
        let a = Operator::from(nd::array![
            [c(1e300, 0.0), c(1e300, 0.0)],
            [c(f64::INFINITY, 0.0), c(0.0, 0.0)],
        ]);
        let v = nd::array![c(1.0, 0.0), c(1.0, 0.0)];
        assert!(matches!(
            expm_multiply_vec(&a, &v, Tolerance::default()),
            Err(ExpmError::NumericalOverflow { .. }),
        ));
        let a = Operator::from(nd::array![
            [c(800.0, 0.0), c(0.0, 0.0)],
            [c(0.0, 0.0), c(800.0, 0.0)],
        ]);
        assert!(matches!(
            expm_multiply_vec(&a, &v, Tolerance::default()),
            Err(ExpmError::NumericalOverflow { .. }),
        ));
    }
}
