//! Directional derivatives of `exp(A) v` along a set of control directions,
//! obtained from a single exponential action of a block upper-triangular
//! augmented operator.
//!
//! For controls `E_0, ..., E_{K-1}` the augmented operator is
//! ```text
//! ⎡ A           E_0     ⎤
//! ⎢    A        E_1     ⎥
//! ⎢       ⋱     ⋮       ⎥
//! ⎢          A  E_{K-1} ⎥
//! ⎣             A       ⎦
//! ```
//! and its exponential applied to `[0, ..., 0, v]` carries the Fréchet
//! derivative `L(A, E_k) v` in block `k` and `exp(A) v` in the last block.

use ndarray as nd;
use num_complex::Complex64 as C64;
use tracing::{ debug, trace };
use crate::{
    action::{ Tolerance, expm_multiply_vec },
    error::{ ExpmError, ExpmResult },
    executor::{ BatchExecutor, try_map_batch },
    operator::Operator,
    sparse::CsrMatrix,
};

fn check_controls(n: usize, controls: &[Operator]) -> ExpmResult<()> {
    controls.iter().enumerate()
        .try_for_each(|(k, e)| {
            (e.shape() == (n, n)).then_some(())
                .ok_or_else(|| ExpmError::shape(
                    "control",
                    format!("{}x{}", n, n),
                    format!("{}x{} (control {})", e.shape().0, e.shape().1, k),
                ))
        })
}

/// Build the `(K + 1) N × (K + 1) N` augmented operator for generator `a` and
/// `K` control directions.
///
/// The result has the storage format of `a`; controls are converted if
/// necessary. Fails if `a` is not square or any control differs in shape.
pub fn augmented_operator(a: &Operator, controls: &[Operator])
    -> ExpmResult<Operator>
{
    let n = a.dim()?;
    check_controls(n, controls)?;
    let k = controls.len();
    match a {
        Operator::Dense(a) => {
            let mut aug: nd::Array2<C64> = nd::Array2::zeros(((k + 1) * n, (k + 1) * n));
            for i in 0..=k {
                aug.slice_mut(nd::s![i * n..(i + 1) * n, i * n..(i + 1) * n])
                    .assign(a);
            }
            for (i, e) in controls.iter().enumerate() {
                let mut block
                    = aug.slice_mut(nd::s![i * n..(i + 1) * n, k * n..(k + 1) * n]);
                match e {
                    Operator::Dense(e) => block.assign(e),
                    Operator::Sparse(e) => {
                        e.iter().for_each(|(r, c, x)| { block[[r, c]] = x; });
                    },
                }
            }
            Ok(Operator::Dense(aug))
        },
        Operator::Sparse(a) => {
            let controls: Vec<CsrMatrix>
                = controls.iter().map(|e| e.to_sparse()).collect();
            let grid: Vec<Vec<Option<&CsrMatrix>>>
                = (0..=k)
                .map(|i| {
                    (0..=k)
                        .map(|j| {
                            if i == j {
                                Some(a)
                            } else if j == k {
                                Some(&controls[i])
                            } else {
                                None
                            }
                        })
                        .collect()
                })
                .collect();
            CsrMatrix::from_blocks(&grid).map(Operator::Sparse)
        },
    }
}

/// Stack `K` zero blocks on top of `v`.
pub fn augmented_state<S>(v: &nd::ArrayBase<S, nd::Ix1>, k: usize)
    -> nd::Array1<C64>
where S: nd::Data<Elem = C64>
{
    let n = v.len();
    let mut aug: nd::Array1<C64> = nd::Array1::zeros((k + 1) * n);
    aug.slice_mut(nd::s![k * n..]).assign(v);
    aug
}

/// Compute `exp(A) v` and the directional derivatives `L(A, E_k) v` for every
/// control `E_k`.
///
/// The returned vector has length `K + 1`: element `0` is `exp(A) v` and
/// element `k + 1` is the derivative along `controls[k]`. Fails on any shape
/// mismatch or any error of the underlying exponential action.
pub fn derivative_action<S>(
    a: &Operator,
    controls: &[Operator],
    tol: Tolerance,
    v: &nd::ArrayBase<S, nd::Ix1>,
) -> ExpmResult<Vec<nd::Array1<C64>>>
where S: nd::Data<Elem = C64>
{
    let n = a.dim()?;
    if v.len() != n {
        return Err(ExpmError::shape("state", n, v.len()));
    }
    let k = controls.len();
    if k == 0 {
        return expm_multiply_vec(a, v, tol).map(|w| vec![w]);
    }
    let aug = augmented_operator(a, controls)?;
    trace!(dim = n, controls = k, augmented_dim = (k + 1) * n, "augmented operator");
    let w = expm_multiply_vec(&aug, &augmented_state(v, k), tol)?;
    let states: Vec<nd::Array1<C64>>
        = std::iter::once(k).chain(0..k)
        .map(|b| w.slice(nd::s![b * n..(b + 1) * n]).to_owned())
        .collect();
    Ok(states)
}

/// A single input to [`derivative_action_batch`].
#[derive(Clone, Debug)]
pub struct DerivativeTask<'a> {
    pub generator: &'a Operator,
    pub controls: &'a [Operator],
    pub state: nd::ArrayView1<'a, C64>,
}

/// A single input to [`action_batch`].
#[derive(Clone, Debug)]
pub struct ActionTask<'a> {
    pub generator: &'a Operator,
    pub state: nd::ArrayView1<'a, C64>,
}

/// Run [`derivative_action`] on every task.
///
/// Outputs are in task order. Batches of fewer than two tasks run on the
/// calling thread; larger batches are handed to `executor`. The first failing
/// task by index aborts the batch with [`ExpmError::BatchItem`].
pub fn derivative_action_batch<E>(
    tasks: Vec<DerivativeTask<'_>>,
    tol: Tolerance,
    executor: &E,
) -> ExpmResult<Vec<Vec<nd::Array1<C64>>>>
where E: BatchExecutor
{
    debug!(batch = tasks.len(), workers = executor.workers(), "derivative action batch");
    try_map_batch(
        executor,
        tasks,
        |_, task| derivative_action(task.generator, task.controls, tol, &task.state),
    )
}

/// Run [`expm_multiply_vec`] on every task.
///
/// Ordering, dispatch, and failure behave as in [`derivative_action_batch`].
pub fn action_batch<E>(
    tasks: Vec<ActionTask<'_>>,
    tol: Tolerance,
    executor: &E,
) -> ExpmResult<Vec<nd::Array1<C64>>>
where E: BatchExecutor
{
    debug!(batch = tasks.len(), workers = executor.workers(), "action batch");
    try_map_batch(
        executor,
        tasks,
        |_, task| expm_multiply_vec(task.generator, &task.state, tol),
    )
}
