//! Time-integrated target-state infidelity and its gradient with respect to
//! piecewise-constant control amplitudes.
//!
//! The system is advanced in `T` steps, `ψ_i(t + 1) = exp(A_t) ψ_i(t)`, with
//! generators affine in the controls, `∂A_t/∂u_k(t) = E_k`. The infidelity is
//! accumulated at every step `t = 1..=T` and its gradient is computed by one
//! adjoint sweep backward in time, in which every step propagates the adjoint
//! states and evaluates all `K` directional derivatives with a single
//! augmented exponential action per state.

use ndarray as nd;
use num_complex::Complex64 as C64;
use tracing::{ debug, trace };
use crate::{
    action::Tolerance,
    error::{ ExpmError, ExpmResult },
    executor::BatchExecutor,
    frechet::{ ActionTask, DerivativeTask, action_batch, derivative_action_batch },
    operator::Operator,
    sparse::CsrMatrix,
};

/// `⟨a|b⟩`, conjugate-linear in the first argument.
pub fn braket<S, T>(a: &nd::ArrayBase<S, nd::Ix1>, b: &nd::ArrayBase<T, nd::Ix1>)
    -> C64
where
    S: nd::Data<Elem = C64>,
    T: nd::Data<Elem = C64>,
{
    a.iter().zip(b.iter()).map(|(x, y)| x.conj() * y).sum()
}

/// Build piecewise-constant generators `A_t = A_0 + Σ_k u[k, t] E_k`.
///
/// `amplitudes` has shape `K × T`. The generators share the storage format of
/// `drift`. Fails if any control differs in shape from `drift` or if the
/// number of amplitude rows differs from the number of controls.
pub fn piecewise_generators<S>(
    drift: &Operator,
    controls: &[Operator],
    amplitudes: &nd::ArrayBase<S, nd::Ix2>,
) -> ExpmResult<Vec<Operator>>
where S: nd::Data<Elem = f64>
{
    let n = drift.dim()?;
    if amplitudes.nrows() != controls.len() {
        return Err(ExpmError::shape(
            "amplitude rows", controls.len(), amplitudes.nrows()));
    }
    if let Some(k) = controls.iter().position(|e| e.shape() != (n, n)) {
        return Err(ExpmError::shape(
            "control", format!("{}x{}", n, n),
            format!("{}x{} (control {})", controls[k].shape().0, controls[k].shape().1, k),
        ));
    }
    let sparse_controls: Vec<CsrMatrix>
        = if drift.is_sparse() {
            controls.iter().map(|e| e.to_sparse()).collect()
        } else {
            Vec::new()
        };
    amplitudes.columns().into_iter()
        .map(|u_t| {
            match drift {
                Operator::Dense(a0) => {
                    let mut a = a0.clone();
                    for (e, u) in controls.iter().zip(u_t.iter()) {
                        match e {
                            Operator::Dense(e) => a.scaled_add(C64::from(*u), e),
                            Operator::Sparse(e) => {
                                e.iter().for_each(|(i, j, x)| { a[[i, j]] += x * *u; });
                            },
                        }
                    }
                    Ok(Operator::Dense(a))
                },
                Operator::Sparse(a0) => {
                    let triplets
                        = a0.iter()
                        .chain(
                            sparse_controls.iter().zip(u_t.iter())
                            .flat_map(|(e, u)| e.iter().map(move |(i, j, x)| (i, j, x * *u)))
                        )
                        .collect::<Vec<_>>();
                    CsrMatrix::from_triplets((n, n), triplets).map(Operator::Sparse)
                },
            }
        })
        .collect()
}

/// Cost value and gradients from [`TargetStateInfidelityTime::evaluate`].
#[derive(Clone, Debug)]
pub struct CostGradient {
    /// Total cost.
    pub cost: f64,
    /// Infidelity contribution of each step `t = 1..=T`, before the
    /// multiplier.
    pub step_infidelity: nd::Array1<f64>,
    /// `∂C/∂u_k(t)`, shape `K × T`.
    pub gradient: nd::Array2<f64>,
    /// `ψ_i(T)` for every state.
    pub final_states: Vec<nd::Array1<C64>>,
}

/// Infidelity of a set of evolved states with a set of target states, summed
/// over every time step.
///
/// With `S` states and `T` steps, the phase-sensitive form is
/// ```text
/// C = m (1 - Σ_t |Σ_i ⟨τ_i|ψ_i(t)⟩|² / (S² T))
/// ```
/// and the form that ignores the relative phase between states is
/// ```text
/// C = m (1 - Σ_t Σ_i |⟨τ_i|ψ_i(t)⟩|² / (S T))
/// ```
#[derive(Clone, Debug)]
pub struct TargetStateInfidelityTime {
    targets: Vec<nd::Array1<C64>>,
    cost_multiplier: f64,
    neglect_relative_phase: bool,
}

impl TargetStateInfidelityTime {
    /// Create a new cost.
    ///
    /// Fails if `targets` is empty or the targets differ in length.
    pub fn new(targets: Vec<nd::Array1<C64>>) -> ExpmResult<Self> {
        let n = targets.first().map(|t| t.len())
            .ok_or_else(|| ExpmError::shape("targets", "at least one state", 0))?;
        if let Some(t) = targets.iter().find(|t| t.len() != n) {
            return Err(ExpmError::shape("target", n, t.len()));
        }
        Ok(Self { targets, cost_multiplier: 1.0, neglect_relative_phase: false })
    }

    /// Set the overall multiplier `m` (default 1).
    pub fn with_multiplier(mut self, cost_multiplier: f64) -> Self {
        self.cost_multiplier = cost_multiplier;
        self
    }

    /// Ignore the relative phase between states (default `false`).
    pub fn neglect_relative_phase(mut self, neglect: bool) -> Self {
        self.neglect_relative_phase = neglect;
        self
    }

    pub fn targets(&self) -> &[nd::Array1<C64>] { &self.targets }

    // normalization constant c
    fn normalization(&self, steps: usize) -> f64 {
        let s = self.targets.len() as f64;
        if self.neglect_relative_phase {
            1.0 / (s * steps as f64)
        } else {
            1.0 / (s * s * steps as f64)
        }
    }

    // per-state weights w_{i,t} and the step fidelity sum
    fn weights(&self, states: &[nd::Array1<C64>]) -> (Vec<C64>, f64) {
        let overlaps: Vec<C64>
            = self.targets.iter().zip(states)
            .map(|(tau, psi)| braket(tau, psi))
            .collect();
        if self.neglect_relative_phase {
            let fid: f64 = overlaps.iter().map(|o| o.norm_sqr()).sum();
            (overlaps, fid)
        } else {
            let f: C64 = overlaps.iter().sum();
            (vec![f; overlaps.len()], f.norm_sqr())
        }
    }

    /// Evolve `initial` under `generators` and return the cost and its
    /// gradient with respect to the control amplitudes multiplying
    /// `controls`.
    ///
    /// Every batch of independent exponential actions (one per state, at every
    /// step in both directions) is dispatched through `executor`. Fails if
    /// there are no steps, if the number or length of initial states does not
    /// match the targets, or on any error of the underlying actions.
    pub fn evaluate<E>(
        &self,
        generators: &[Operator],
        controls: &[Operator],
        initial: &[nd::Array1<C64>],
        tol: Tolerance,
        executor: &E,
    ) -> ExpmResult<CostGradient>
    where E: BatchExecutor
    {
        let n = self.targets[0].len();
        let steps = generators.len();
        if steps == 0 {
            return Err(ExpmError::shape("generators", "at least one time step", 0));
        }
        if initial.len() != self.targets.len() {
            return Err(ExpmError::shape(
                "initial states", self.targets.len(), initial.len()));
        }
        if let Some(psi) = initial.iter().find(|psi| psi.len() != n) {
            return Err(ExpmError::shape("initial state", n, psi.len()));
        }
        let c = self.normalization(steps);
        let m = self.cost_multiplier;

        // forward sweep
        let mut trajectory: Vec<Vec<nd::Array1<C64>>> = Vec::with_capacity(steps + 1);
        let mut weights: Vec<Vec<C64>> = Vec::with_capacity(steps + 1);
        let mut step_infidelity: nd::Array1<f64> = nd::Array1::zeros(steps);
        trajectory.push(initial.to_vec());
        weights.push(Vec::new());
        for (t, a_t) in generators.iter().enumerate() {
            let tasks: Vec<ActionTask>
                = trajectory[t].iter()
                .map(|psi| ActionTask { generator: a_t, state: psi.view() })
                .collect();
            let next = action_batch(tasks, tol, executor)?;
            let (w, fid) = self.weights(&next);
            step_infidelity[t] = 1.0 - c * steps as f64 * fid;
            trace!(step = t + 1, infidelity = step_infidelity[t], "forward step");
            weights.push(w);
            trajectory.push(next);
        }
        let cost = m * step_infidelity.sum() / steps as f64;

        // adjoint sweep
        let adj_gens: Vec<Operator> = generators.iter().map(|a| a.adjoint()).collect();
        let adj_controls: Vec<Operator> = controls.iter().map(|e| e.adjoint()).collect();
        let mut gradient: nd::Array2<f64> = nd::Array2::zeros((controls.len(), steps));
        let mut lambda: Vec<nd::Array1<C64>>
            = self.targets.iter().zip(&weights[steps])
            .map(|(tau, w)| tau * *w)
            .collect();
        for s in (0..steps).rev() {
            let tasks: Vec<DerivativeTask>
                = lambda.iter()
                .map(|l| DerivativeTask {
                    generator: &adj_gens[s],
                    controls: &adj_controls,
                    state: l.view(),
                })
                .collect();
            let outputs = derivative_action_batch(tasks, tol, executor)?;
            for (out, psi) in outputs.iter().zip(&trajectory[s]) {
                for (k, g) in gradient.column_mut(s).iter_mut().enumerate() {
                    *g += -2.0 * m * c * braket(&out[k + 1], psi).re;
                }
            }
            if s == 0 {
                break;
            }
            lambda = outputs.into_iter()
                .zip(self.targets.iter().zip(&weights[s]))
                .map(|(mut out, (tau, w))| {
                    let mut l = out.swap_remove(0);
                    l.scaled_add(*w, tau);
                    l
                })
                .collect();
        }
        debug!(
            steps,
            states = self.targets.len(),
            controls = controls.len(),
            cost,
            "target state infidelity",
        );
        let final_states = trajectory.pop().unwrap_or_default();
        Ok(CostGradient { cost, step_infidelity, gradient, final_states })
    }
}
