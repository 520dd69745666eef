//! Explicit dense matrix exponential by scaling and squaring with diagonal
//! Padé approximants of degree 3, 5, 7, 9, or 13.
//!
//! See Higham (2005), "The Scaling and Squaring Method for the Matrix
//! Exponential Revisited", SIAM J. Matrix Anal. Appl. 26(4), 1179.

use ndarray as nd;
use num_complex::Complex64 as C64;
use ndarray_linalg::{ FactorizeInto, Solve };
use num_traits::One;
use tracing::debug;
use crate::{
    action::finite,
    error::{ ExpmError, ExpmResult },
    operator::{ Norms, Operator },
};

/// Degree of the diagonal Padé approximant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PadeOrder {
    P3,
    P5,
    P7,
    P9,
    P13,
}

// Backward-error thresholds θ_m on the 1-norm.
const THETA_3: f64 = 1.495585217958292e-2;
const THETA_5: f64 = 2.539398330063230e-1;
const THETA_7: f64 = 9.504178996162932e-1;
const THETA_9: f64 = 2.097847961257068e0;
const THETA_13: f64 = 5.371920351148152e0;

const B_3: [f64; 4] = [120.0, 60.0, 12.0, 1.0];

const B_5: [f64; 6] = [30240.0, 15120.0, 3360.0, 420.0, 30.0, 1.0];

const B_7: [f64; 8] = [
    17297280.0, 8648640.0, 1995840.0, 277200.0, 25200.0, 1512.0, 56.0, 1.0,
];

const B_9: [f64; 10] = [
    17643225600.0, 8821612800.0, 2075673600.0, 302702400.0, 30270240.0,
    2162160.0, 110880.0, 3960.0, 90.0, 1.0,
];

const B_13: [f64; 14] = [
    64764752532480000.0, 32382376266240000.0, 7771770303897600.0,
    1187353796428800.0, 129060195264000.0, 10559470521600.0, 670442572800.0,
    33522128640.0, 1323241920.0, 40840800.0, 960960.0, 16380.0, 182.0, 1.0,
];

impl PadeOrder {
    /// Polynomial degree of numerator and denominator.
    pub fn degree(self) -> usize {
        match self {
            Self::P3 => 3,
            Self::P5 => 5,
            Self::P7 => 7,
            Self::P9 => 9,
            Self::P13 => 13,
        }
    }

    /// Largest 1-norm for which this order alone reaches unit roundoff.
    pub fn theta(self) -> f64 {
        match self {
            Self::P3 => THETA_3,
            Self::P5 => THETA_5,
            Self::P7 => THETA_7,
            Self::P9 => THETA_9,
            Self::P13 => THETA_13,
        }
    }

    fn coeffs(self) -> &'static [f64] {
        match self {
            Self::P3 => &B_3,
            Self::P5 => &B_5,
            Self::P7 => &B_7,
            Self::P9 => &B_9,
            Self::P13 => &B_13,
        }
    }

    /// Choose the approximant and the number of squarings for a matrix of
    /// 1-norm `norm`.
    ///
    /// The smallest order whose threshold exceeds `norm` is used unscaled;
    /// past `θ13`, order 13 is used with `s = ceil(log2(norm / θ13))`
    /// squarings.
    pub fn select(norm: f64) -> (Self, u32) {
        [Self::P3, Self::P5, Self::P7, Self::P9, Self::P13].into_iter()
            .find(|p| norm < p.theta())
            .map(|p| (p, 0))
            .unwrap_or_else(|| {
                let s = (norm / THETA_13).log2().ceil().max(0.0) as u32;
                (Self::P13, s)
            })
    }
}

fn real(x: f64) -> C64 { C64::new(x, 0.0) }

/// Return `Σ_k b[offset + 2k] A^{2k}` given the even powers
/// `[I, A², A⁴, ...]`.
fn even_sum(powers: &[nd::Array2<C64>], b: &[f64], offset: usize)
    -> nd::Array2<C64>
{
    let n = powers[0].nrows();
    powers.iter()
        .zip(b.iter().skip(offset).step_by(2))
        .fold(nd::Array2::zeros((n, n)), |mut acc, (p, bk)| {
            acc.scaled_add(real(*bk), p);
            acc
        })
}

/// Compute the odd and even parts `(U, V)` of the Padé numerator, so that
/// `r(A) = (V - U)⁻¹ (V + U)`.
fn pade_uv(a: &nd::Array2<C64>, order: PadeOrder)
    -> (nd::Array2<C64>, nd::Array2<C64>)
{
    let n = a.nrows();
    let b = order.coeffs();
    let eye: nd::Array2<C64> = nd::Array2::from_diag_elem(n, C64::one());
    let a2 = a.dot(a);
    match order {
        PadeOrder::P13 => {
            let a4 = a2.dot(&a2);
            let a6 = a4.dot(&a2);
            let low = [eye, a2, a4];
            let hi_u = even_sum(&low[1..], &b[9..], 0);
            let hi_u = a6.dot(&(&hi_u + &(&a6 * real(b[13]))));
            let u = a.dot(&(hi_u + even_sum(&low, b, 1) + &a6 * real(b[7])));
            let hi_v = even_sum(&low[1..], &b[8..], 0);
            let hi_v = a6.dot(&(&hi_v + &(&a6 * real(b[12]))));
            let v = hi_v + even_sum(&low, b, 0) + &a6 * real(b[6]);
            (u, v)
        },
        _ => {
            let npow = order.degree() / 2 + 1;
            let mut powers: Vec<nd::Array2<C64>> = Vec::with_capacity(npow);
            powers.push(eye);
            powers.push(a2);
            while powers.len() < npow {
                let next = powers[powers.len() - 1].dot(&powers[1]);
                powers.push(next);
            }
            let u = a.dot(&even_sum(&powers, b, 1));
            let v = even_sum(&powers, b, 0);
            (u, v)
        },
    }
}

/// Solve `L X = R` for `X` through an LU factorization of `L`.
///
/// Fails with [`ExpmError::Singular`] if `L` cannot be factorized or the
/// solution is not finite.
fn solve(lhs: nd::Array2<C64>, rhs: nd::Array2<C64>)
    -> ExpmResult<nd::Array2<C64>>
{
    let lu = lhs.factorize_into().map_err(|_| ExpmError::Singular)?;
    let mut x: nd::Array2<C64> = nd::Array2::zeros(rhs.raw_dim());
    for (r_j, mut x_j) in rhs.columns().into_iter().zip(x.columns_mut()) {
        let sol = lu.solve(&r_j).map_err(|_| ExpmError::Singular)?;
        x_j.assign(&sol);
    }
    let all_finite = x.iter().all(|z| z.is_finite());
    all_finite.then_some(x).ok_or(ExpmError::Singular)
}

/// Compute `exp(A)` as an explicit dense matrix.
///
/// Fails if `A` is not square, if its norm is not finite, if the Padé
/// denominator is singular, or if the result overflows.
pub fn expm<S>(a: &nd::ArrayBase<S, nd::Ix2>) -> ExpmResult<nd::Array2<C64>>
where S: nd::Data<Elem = C64>
{
    let (n, m) = a.dim();
    if n != m {
        return Err(ExpmError::shape(
            "exponent", "a square matrix", format!("{}x{}", n, m)));
    }
    match n {
        0 => return Ok(nd::Array2::zeros((0, 0))),
        1 => return finite(a.mapv(|x| x.exp()), "scalar exponential"),
        _ => { },
    }
    let norm = a.one_norm();
    if !norm.is_finite() {
        return Err(ExpmError::NumericalOverflow { stage: "norm estimate" });
    }
    let (order, squarings) = PadeOrder::select(norm);
    debug!(dim = n, norm, order = order.degree(), squarings, "dense exponential");
    let scaled: nd::Array2<C64>
        = a.mapv(|x| x * 2.0_f64.powi(-(squarings as i32)));
    let (u, v) = pade_uv(&scaled, order);
    let mut r = solve(&v - &u, &v + &u)?;
    for _ in 0..squarings {
        r = r.dot(&r);
    }
    finite(r, "squaring")
}

/// Compute `exp(A)` for an operator in either storage format, returning a
/// dense matrix.
pub fn expm_operator(a: &Operator) -> ExpmResult<nd::Array2<C64>> {
    match a {
        Operator::Dense(d) => expm(d),
        Operator::Sparse(s) => expm(&s.to_dense()),
    }
}
