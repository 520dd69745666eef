//! Square complex operators in either dense or sparse storage, and the norm
//! estimates used to pick truncation orders and scaling factors.
//!
//! Storage format is fixed when an [`Operator`] is constructed; every
//! operation below dispatches on the variant tag and never modifies its input.

use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };
use crate::{
    error::{ ExpmError, ExpmResult },
    sparse::CsrMatrix,
};

/* Norms **********************************************************************/

/// Induced matrix norms, treating 1D arrays as column vectors.
pub trait Norms {
    /// Maximum absolute column sum.
    fn one_norm(&self) -> f64;

    /// Maximum absolute row sum.
    fn inf_norm(&self) -> f64;
}

/// Quantities defined only for square matrices.
pub trait SquareOps: Norms + Sized {
    /// Sum of the main diagonal.
    fn trace(&self) -> C64;

    /// The identity of the same dimension and storage format.
    fn identity_like(&self) -> Self;
}

// Like `f64::max`, but NaN wins so that norms never hide non-finite entries.
fn nan_max(acc: f64, x: f64) -> f64 {
    if acc.is_nan() || x.is_nan() { f64::NAN } else { acc.max(x) }
}

impl<S> Norms for nd::ArrayBase<S, nd::Ix1>
where S: nd::Data<Elem = C64>
{
    fn one_norm(&self) -> f64 { self.iter().map(|x| x.norm()).sum() }

    fn inf_norm(&self) -> f64 {
        self.iter().map(|x| x.norm()).fold(0.0, nan_max)
    }
}

impl<S> Norms for nd::ArrayBase<S, nd::Ix2>
where S: nd::Data<Elem = C64>
{
    fn one_norm(&self) -> f64 {
        self.columns().into_iter()
            .map(|col| col.iter().map(|x| x.norm()).sum::<f64>())
            .fold(0.0, nan_max)
    }

    fn inf_norm(&self) -> f64 {
        self.rows().into_iter()
            .map(|row| row.iter().map(|x| x.norm()).sum::<f64>())
            .fold(0.0, nan_max)
    }
}

impl SquareOps for nd::Array2<C64> {
    fn trace(&self) -> C64 { self.diag().sum() }

    fn identity_like(&self) -> Self {
        nd::Array2::from_diag_elem(self.nrows(), C64::one())
    }
}

impl Norms for CsrMatrix {
    fn one_norm(&self) -> f64 {
        let mut colsums: Vec<f64> = vec![0.0; self.ncols()];
        self.iter().for_each(|(_, j, x)| { colsums[j] += x.norm(); });
        colsums.into_iter().fold(0.0, nan_max)
    }

    fn inf_norm(&self) -> f64 {
        (0..self.nrows())
            .map(|i| self.row(i).map(|(_, x)| x.norm()).sum::<f64>())
            .fold(0.0, nan_max)
    }
}

impl SquareOps for CsrMatrix {
    fn trace(&self) -> C64 { self.diagonal().sum() }

    fn identity_like(&self) -> Self { CsrMatrix::eye(self.nrows()) }
}

/* Operator *******************************************************************/

/// A complex matrix with its storage format resolved at construction.
#[derive(Clone, Debug, PartialEq)]
pub enum Operator {
    Dense(nd::Array2<C64>),
    Sparse(CsrMatrix),
}

impl From<nd::Array2<C64>> for Operator {
    fn from(a: nd::Array2<C64>) -> Self { Self::Dense(a) }
}

impl From<CsrMatrix> for Operator {
    fn from(a: CsrMatrix) -> Self { Self::Sparse(a) }
}

impl Norms for Operator {
    fn one_norm(&self) -> f64 {
        match self {
            Self::Dense(a) => a.one_norm(),
            Self::Sparse(a) => a.one_norm(),
        }
    }

    fn inf_norm(&self) -> f64 {
        match self {
            Self::Dense(a) => a.inf_norm(),
            Self::Sparse(a) => a.inf_norm(),
        }
    }
}

impl SquareOps for Operator {
    fn trace(&self) -> C64 {
        match self {
            Self::Dense(a) => a.trace(),
            Self::Sparse(a) => a.trace(),
        }
    }

    fn identity_like(&self) -> Self {
        match self {
            Self::Dense(a) => Self::Dense(a.identity_like()),
            Self::Sparse(a) => Self::Sparse(a.identity_like()),
        }
    }
}

impl Operator {
    /// Return `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Self::Dense(a) => a.dim(),
            Self::Sparse(a) => a.shape(),
        }
    }

    /// Return the dimension `N` of a square operator.
    ///
    /// Fails if `self` is not square.
    pub fn dim(&self) -> ExpmResult<usize> {
        let (r, c) = self.shape();
        (r == c).then_some(r)
            .ok_or_else(|| ExpmError::shape(
                "operator", "a square matrix", format!("{}x{}", r, c)))
    }

    /// Return `true` if `self` is stored sparsely.
    pub fn is_sparse(&self) -> bool { matches!(self, Self::Sparse(_)) }

    /// Copy into dense storage.
    pub fn to_dense(&self) -> nd::Array2<C64> {
        match self {
            Self::Dense(a) => a.clone(),
            Self::Sparse(a) => a.to_dense(),
        }
    }

    /// Copy into sparse storage.
    pub fn to_sparse(&self) -> CsrMatrix {
        match self {
            Self::Dense(a) => CsrMatrix::from_dense(a),
            Self::Sparse(a) => a.clone(),
        }
    }

    /// Compute the product with a batch of column vectors.
    ///
    /// Fails with [`ExpmError::Shape`] if `b.nrows()` does not match the number
    /// of columns of `self`.
    pub fn dot<S>(&self, b: &nd::ArrayBase<S, nd::Ix2>) -> ExpmResult<nd::Array2<C64>>
    where S: nd::Data<Elem = C64>
    {
        match self {
            Self::Dense(a) if a.ncols() != b.nrows() => {
                Err(ExpmError::shape("right-hand rows", a.ncols(), b.nrows()))
            },
            Self::Dense(a) => Ok(a.dot(b)),
            Self::Sparse(a) => a.dot(b),
        }
    }

    /// Multiply every entry by `c`.
    pub fn scaled(&self, c: C64) -> Self {
        match self {
            Self::Dense(a) => Self::Dense(a * c),
            Self::Sparse(a) => Self::Sparse(a.scaled(c)),
        }
    }

    /// Return `self - mu I`.
    pub fn shifted(&self, mu: C64) -> Self {
        if mu.is_zero() {
            return self.clone();
        }
        match self {
            Self::Dense(a) => {
                let mut a = a.clone();
                a.diag_mut().iter_mut().for_each(|x| { *x -= mu; });
                Self::Dense(a)
            },
            Self::Sparse(a) => Self::Sparse(a.add_diag(-mu)),
        }
    }

    /// Return the conjugate transpose.
    pub fn adjoint(&self) -> Self {
        match self {
            Self::Dense(a) => Self::Dense(a.t().mapv(|x| x.conj())),
            Self::Sparse(a) => Self::Sparse(a.adjoint()),
        }
    }
}
