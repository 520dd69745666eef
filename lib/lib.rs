//! Matrix exponentials for quantum propagators and their derivatives.
//!
//! - [`action`]: `exp(A) v` by a scaled, truncated Taylor series, without
//!   forming `exp(A)`.
//! - [`frechet`]: `exp(A) v` together with the directional derivatives
//!   `L(A, E_k) v` from one action of an augmented block operator.
//! - [`expm`]: explicit dense `exp(A)` by Padé scaling and squaring.
//! - [`vjp`]: an approximate reverse-mode rule for [`expm::expm`].
//! - [`cost`]: target-state infidelity with adjoint gradients over
//!   piecewise-constant controls.
//!
//! Operators are stored densely or as CSR matrices ([`operator::Operator`]);
//! batched calls run on an explicitly passed executor ([`executor`]).

pub mod error;
pub mod sparse;
pub mod operator;
pub mod action;
pub mod executor;
pub mod frechet;
pub mod expm;
pub mod vjp;
pub mod cost;
pub mod config;

pub use crate::{
    action::{ DEFAULT_TOLERANCE, Tolerance, expm_multiply, expm_multiply_vec },
    config::{ PropagatorConfig, Threads },
    cost::{ CostGradient, TargetStateInfidelityTime },
    error::{ ExpmError, ExpmResult },
    executor::{ BatchExecutor, Executor, Inline, ThreadPool },
    expm::expm,
    frechet::{ derivative_action, derivative_action_batch, action_batch },
    operator::Operator,
    sparse::CsrMatrix,
    vjp::{ ExpmPrimitive, ExpmPullback, expm_vjp },
};
