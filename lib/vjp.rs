//! Approximate reverse-mode rule for the dense matrix exponential.
//!
//! The derivative of `exp(A)` along the elementary direction `E_ij` is taken
//! to be `E_ij exp(A)`, which is exact only when `A` commutes with `E_ij`
//! (e.g. `A ∝ I`) and otherwise has first-order error in `‖A‖`. Use
//! [`derivative_action`][crate::frechet::derivative_action] when exact
//! derivatives are needed.

use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    error::{ ExpmError, ExpmResult },
    expm::expm,
};

/// Map `dL/dexp(A)` to `dL/dA` given `exp(A)`.
///
/// Computes `dL/dA[i, j] = Σ_k G[i, k] exp(A)[j, k]` row by row, without
/// forming the `N² × N²` Jacobian and without conjugation. Fails if the two
/// matrices are not square and of equal shape.
pub fn expm_vjp<S, T>(
    grad: &nd::ArrayBase<S, nd::Ix2>,
    exp_a: &nd::ArrayBase<T, nd::Ix2>,
) -> ExpmResult<nd::Array2<C64>>
where
    S: nd::Data<Elem = C64>,
    T: nd::Data<Elem = C64>,
{
    let (n, m) = exp_a.dim();
    if n != m {
        return Err(ExpmError::shape(
            "exponential", "a square matrix", format!("{}x{}", n, m)));
    }
    if grad.dim() != (n, n) {
        return Err(ExpmError::shape(
            "output gradient",
            format!("{}x{}", n, n),
            format!("{}x{}", grad.nrows(), grad.ncols()),
        ));
    }
    let mut out: nd::Array2<C64> = nd::Array2::zeros((n, n));
    for (g_i, mut out_i) in grad.rows().into_iter().zip(out.rows_mut()) {
        for (e_j, o_ij) in exp_a.rows().into_iter().zip(out_i.iter_mut()) {
            *o_ij = g_i.dot(&e_j);
        }
    }
    Ok(out)
}

/// Dense exponential as an explicit differentiable primitive.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExpmPrimitive;

impl ExpmPrimitive {
    /// Compute `exp(A)` and keep what the backward pass needs.
    pub fn forward<S>(a: &nd::ArrayBase<S, nd::Ix2>)
        -> ExpmResult<(nd::Array2<C64>, ExpmPullback)>
    where S: nd::Data<Elem = C64>
    {
        let exp_a = expm(a)?;
        Ok((exp_a.clone(), ExpmPullback { exp_a }))
    }
}

/// Backward pass of [`ExpmPrimitive`].
#[derive(Clone, Debug)]
pub struct ExpmPullback {
    exp_a: nd::Array2<C64>,
}

impl ExpmPullback {
    /// The forward value `exp(A)`.
    pub fn value(&self) -> &nd::Array2<C64> { &self.exp_a }

    /// Map `dL/dexp(A)` to `dL/dA`; see [`expm_vjp`].
    pub fn pullback<S>(&self, grad: &nd::ArrayBase<S, nd::Ix2>)
        -> ExpmResult<nd::Array2<C64>>
    where S: nd::Data<Elem = C64>
    {
        expm_vjp(grad, &self.exp_a)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{ Rng, SeedableRng, rngs::StdRng };

    fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

    fn random_matrix(rng: &mut StdRng, n: usize, scale: f64) -> nd::Array2<C64> {
        nd::Array2::from_shape_fn(
            (n, n),
            |_| c(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)) * scale,
        )
    }

    fn elementary(n: usize, i: usize, j: usize) -> nd::Array2<C64> {
        let mut e = nd::Array2::zeros((n, n));
        e[[i, j]] = c(1.0, 0.0);
        e
    }

    // L(M) = Σ G ⊙ M, holomorphic in M
    fn contract(g: &nd::Array2<C64>, m: &nd::Array2<C64>) -> C64 {
        g.iter().zip(m.iter()).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn exact_for_multiples_of_identity() {
        let mut rng = StdRng::seed_from_u64(21);
        let n = 3;
        let a: nd::Array2<C64> = nd::Array2::from_diag_elem(n, c(0.4, -0.7));
        let g = random_matrix(&mut rng, n, 1.0);
        let (_, pb) = ExpmPrimitive::forward(&a).unwrap();
        let grad = pb.pullback(&g).unwrap();
        let h = 1e-6;
        for i in 0..n {
            for j in 0..n {
                let e = elementary(n, i, j) * c(h, 0.0);
                let plus = contract(&g, &expm(&(&a + &e)).unwrap());
                let minus = contract(&g, &expm(&(&a - &e)).unwrap());
                let fd = (plus - minus) / (2.0 * h);
                assert!((grad[[i, j]] - fd).norm() < 1e-7, "({}, {})", i, j);
            }
        }
    }

    #[test]
    fn scalar_case_is_exact() {
        let a = nd::array![[c(0.3, 1.1)]];
        let g = nd::array![[c(-0.5, 2.0)]];
        let (value, pb) = ExpmPrimitive::forward(&a).unwrap();
        assert_eq!(pb.value(), &value);
        let grad = pb.pullback(&g).unwrap();
        assert!((grad[[0, 0]] - g[[0, 0]] * c(0.3, 1.1).exp()).norm() < 1e-14);
    }

    #[test]
    fn matches_elementary_contraction() {
        let mut rng = StdRng::seed_from_u64(22);
        let n = 4;
        let a = random_matrix(&mut rng, n, 1.0);
        let g = random_matrix(&mut rng, n, 1.0);
        let exp_a = expm(&a).unwrap();
        let grad = expm_vjp(&g, &exp_a).unwrap();
        for i in 0..n {
            for j in 0..n {
                let brute = contract(&g, &elementary(n, i, j).dot(&exp_a));
                assert!((grad[[i, j]] - brute).norm() < 1e-13);
            }
        }
    }

    #[test]
    fn approximation_error_is_small_for_small_norm() {
        let mut rng = StdRng::seed_from_u64(23);
        let n = 3;
        let a = random_matrix(&mut rng, n, 1e-3);
        let g = random_matrix(&mut rng, n, 1.0);
        let (_, pb) = ExpmPrimitive::forward(&a).unwrap();
        let approx = pb.pullback(&g).unwrap();
        let mut exact: nd::Array2<C64> = nd::Array2::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                let mut block: nd::Array2<C64> = nd::Array2::zeros((2 * n, 2 * n));
                block.slice_mut(nd::s![..n, ..n]).assign(&a);
                block.slice_mut(nd::s![n.., n..]).assign(&a);
                block[[i, n + j]] = c(1.0, 0.0);
                let l = expm(&block).unwrap().slice(nd::s![..n, n..]).to_owned();
                exact[[i, j]] = contract(&g, &l);
            }
        }
        let err: f64 = (&approx - &exact).iter().map(|x| x.norm_sqr()).sum::<f64>().sqrt();
        let size: f64 = exact.iter().map(|x| x.norm_sqr()).sum::<f64>().sqrt();
        assert!(err / size < 1e-2, "relative error {:e}", err / size);
    }

    #[test]
    fn rejects_mismatched_gradient() {
        let exp_a: nd::Array2<C64> = nd::Array2::from_diag_elem(3, c(1.0, 0.0));
        let g: nd::Array2<C64> = nd::Array2::zeros((2, 2));
        assert!(matches!(expm_vjp(&g, &exp_a), Err(ExpmError::Shape { .. })));
    }
}
