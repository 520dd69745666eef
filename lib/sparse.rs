//! Compressed-sparse-row storage for complex square operators.
//!
//! Only the handful of operations needed to drive the exponential-action
//! engine are provided: products with dense column batches, diagonal access,
//! scaling and shifting, conjugate transposition, and block assembly.

use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };
use rustc_hash::FxHashMap as HashMap;
use crate::error::{ ExpmError, ExpmResult };

/// A complex matrix in CSR format.
///
/// The non-zero entries of row `i` are `data[indptr[i]..indptr[i + 1]]`, with
/// column indices `indices[indptr[i]..indptr[i + 1]]` sorted in increasing
/// order.
#[derive(Clone, Debug, PartialEq)]
pub struct CsrMatrix {
    shape: (usize, usize),
    data: Vec<C64>,
    indices: Vec<usize>,
    indptr: Vec<usize>,
}

impl CsrMatrix {
    /// Create a new matrix from raw CSR buffers.
    ///
    /// Fails if the buffers are inconsistent with each other or with `shape`,
    /// or if column indices within a row are not strictly increasing.
    pub fn new(
        shape: (usize, usize),
        data: Vec<C64>,
        indices: Vec<usize>,
        indptr: Vec<usize>,
    ) -> ExpmResult<Self>
    {
        let (nrows, ncols) = shape;
        if indptr.len() != nrows + 1 {
            return Err(ExpmError::shape(
                "CSR indptr", nrows + 1, indptr.len()));
        }
        if data.len() != indices.len() {
            return Err(ExpmError::shape(
                "CSR data/indices", data.len(), indices.len()));
        }
        if indptr[0] != 0 || indptr[nrows] != data.len() {
            return Err(ExpmError::shape(
                "CSR indptr bounds",
                format!("0..{}", data.len()),
                format!("{}..{}", indptr[0], indptr[nrows]),
            ));
        }
        for (start, end) in indptr.iter().tuple_windows() {
            if start > end || *end > indices.len() {
                return Err(ExpmError::shape(
                    "CSR indptr ordering", "non-decreasing", "decreasing"));
            }
            let row = &indices[*start..*end];
            if row.iter().any(|j| *j >= ncols) {
                return Err(ExpmError::shape(
                    "CSR column index", format!("< {}", ncols), "out of range"));
            }
            if row.iter().tuple_windows().any(|(a, b)| a >= b) {
                return Err(ExpmError::shape(
                    "CSR row indices", "strictly increasing", "unsorted"));
            }
        }
        Ok(Self { shape, data, indices, indptr })
    }

    /// Create a matrix with no stored entries.
    pub fn zeros(shape: (usize, usize)) -> Self {
        Self {
            shape,
            data: Vec::new(),
            indices: Vec::new(),
            indptr: vec![0; shape.0 + 1],
        }
    }

    /// Create the `n × n` identity.
    pub fn eye(n: usize) -> Self {
        Self {
            shape: (n, n),
            data: vec![C64::one(); n],
            indices: (0..n).collect(),
            indptr: (0..=n).collect(),
        }
    }

    /// Assemble a matrix from `(row, col, value)` triplets.
    ///
    /// Duplicate entries are summed. Fails if any index lies outside `shape`.
    pub fn from_triplets<I>(shape: (usize, usize), triplets: I)
        -> ExpmResult<Self>
    where I: IntoIterator<Item = (usize, usize, C64)>
    {
        let (nrows, ncols) = shape;
        let triplets: Vec<(usize, usize, C64)> = triplets.into_iter().collect();
        for &(i, j, _) in triplets.iter() {
            if i >= nrows || j >= ncols {
                return Err(ExpmError::shape(
                    "triplet index",
                    format!("< ({}, {})", nrows, ncols),
                    format!("({}, {})", i, j),
                ));
            }
        }
        Ok(Self::assemble(shape, triplets))
    }

    // Indices must already be known to lie within `shape`.
    fn assemble<I>(shape: (usize, usize), triplets: I) -> Self
    where I: IntoIterator<Item = (usize, usize, C64)>
    {
        let nrows = shape.0;
        let mut rows: Vec<HashMap<usize, C64>>
            = (0..nrows).map(|_| HashMap::default()).collect();
        for (i, j, x) in triplets.into_iter() {
            *rows[i].entry(j).or_insert_with(C64::zero) += x;
        }
        let mut data: Vec<C64> = Vec::new();
        let mut indices: Vec<usize> = Vec::new();
        let mut indptr: Vec<usize> = Vec::with_capacity(nrows + 1);
        indptr.push(0);
        for row in rows.into_iter() {
            for (j, x) in row.into_iter().sorted_by_key(|(j, _)| *j) {
                indices.push(j);
                data.push(x);
            }
            indptr.push(data.len());
        }
        Self { shape, data, indices, indptr }
    }

    /// Convert a dense matrix, dropping exact zeros.
    pub fn from_dense<S>(a: &nd::ArrayBase<S, nd::Ix2>) -> Self
    where S: nd::Data<Elem = C64>
    {
        let mut data: Vec<C64> = Vec::new();
        let mut indices: Vec<usize> = Vec::new();
        let mut indptr: Vec<usize> = Vec::with_capacity(a.nrows() + 1);
        indptr.push(0);
        for row in a.rows() {
            for (j, x) in row.iter().enumerate() {
                if !x.is_zero() {
                    indices.push(j);
                    data.push(*x);
                }
            }
            indptr.push(data.len());
        }
        Self { shape: a.dim(), data, indices, indptr }
    }

    /// Convert to a dense matrix.
    pub fn to_dense(&self) -> nd::Array2<C64> {
        let mut a: nd::Array2<C64> = nd::Array2::zeros(self.shape);
        self.iter().for_each(|(i, j, x)| { a[[i, j]] = x; });
        a
    }

    /// Return the `(rows, cols)` shape.
    pub fn shape(&self) -> (usize, usize) { self.shape }

    /// Return the number of rows.
    pub fn nrows(&self) -> usize { self.shape.0 }

    /// Return the number of columns.
    pub fn ncols(&self) -> usize { self.shape.1 }

    /// Return the number of stored entries.
    pub fn nnz(&self) -> usize { self.data.len() }

    /// Iterate over the stored entries of row `i` as `(col, value)` pairs.
    ///
    /// *Panics* if `i` is out of bounds.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, C64)> + '_ {
        let range = self.indptr[i]..self.indptr[i + 1];
        self.indices[range.clone()].iter().copied()
            .zip(self.data[range].iter().copied())
    }

    /// Iterate over all stored entries as `(row, col, value)` triplets in
    /// row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, C64)> + '_ {
        (0..self.nrows())
            .flat_map(move |i| self.row(i).map(move |(j, x)| (i, j, x)))
    }

    /// Return the main diagonal.
    pub fn diagonal(&self) -> nd::Array1<C64> {
        let n = self.nrows().min(self.ncols());
        (0..n)
            .map(|i| {
                self.row(i)
                    .find_map(|(j, x)| (j == i).then_some(x))
                    .unwrap_or_else(C64::zero)
            })
            .collect()
    }

    /// Compute the product with a dense matrix whose columns are independent
    /// vectors.
    ///
    /// Fails with [`ExpmError::Shape`] if `b.nrows() != self.ncols()`.
    pub fn dot<S>(&self, b: &nd::ArrayBase<S, nd::Ix2>) -> ExpmResult<nd::Array2<C64>>
    where S: nd::Data<Elem = C64>
    {
        if b.nrows() != self.ncols() {
            return Err(ExpmError::shape("right-hand rows", self.ncols(), b.nrows()));
        }
        let mut out: nd::Array2<C64> = nd::Array2::zeros((self.nrows(), b.ncols()));
        for (i, mut out_i) in out.rows_mut().into_iter().enumerate() {
            for (j, x) in self.row(i) {
                out_i.scaled_add(x, &b.row(j));
            }
        }
        Ok(out)
    }

    /// Multiply every entry by `c`.
    pub fn scaled(&self, c: C64) -> Self {
        let mut out = self.clone();
        out.data.iter_mut().for_each(|x| { *x *= c; });
        out
    }

    /// Return `self + c I`.
    pub fn add_diag(&self, c: C64) -> Self {
        let n = self.nrows().min(self.ncols());
        let triplets
            = self.iter()
            .chain((0..n).map(|i| (i, i, c)));
        Self::assemble(self.shape, triplets)
    }

    /// Return the conjugate transpose.
    pub fn adjoint(&self) -> Self {
        let (nrows, ncols) = self.shape;
        let mut counts: Vec<usize> = vec![0; ncols + 1];
        self.indices.iter().for_each(|j| { counts[j + 1] += 1; });
        for j in 0..ncols {
            counts[j + 1] += counts[j];
        }
        let indptr = counts.clone();
        let mut next = counts;
        let mut data: Vec<C64> = vec![C64::zero(); self.nnz()];
        let mut indices: Vec<usize> = vec![0; self.nnz()];
        for (i, j, x) in self.iter() {
            let k = next[j];
            data[k] = x.conj();
            indices[k] = i;
            next[j] += 1;
        }
        Self { shape: (ncols, nrows), data, indices, indptr }
    }

    /// Assemble a block matrix from a grid of optional blocks, where `None`
    /// stands for an all-zero block.
    ///
    /// Every block row and every block column must contain at least one
    /// `Some` block to fix its extent, and all blocks sharing a block row
    /// (column) must agree in height (width).
    pub fn from_blocks(blocks: &[Vec<Option<&CsrMatrix>>])
        -> ExpmResult<Self>
    {
        let nbr = blocks.len();
        let nbc = blocks.first().map(|row| row.len()).unwrap_or(0);
        if blocks.iter().any(|row| row.len() != nbc) {
            return Err(ExpmError::shape(
                "block grid", format!("{} block columns", nbc), "ragged rows"));
        }
        let heights: Vec<usize>
            = blocks.iter()
            .map(|row| row.iter().flatten().map(|b| b.nrows()).next())
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(|| ExpmError::shape(
                "block grid", "a block in every row", "empty block row"))?;
        let widths: Vec<usize>
            = (0..nbc)
            .map(|c| blocks.iter().filter_map(|row| row[c]).map(|b| b.ncols()).next())
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(|| ExpmError::shape(
                "block grid", "a block in every column", "empty block column"))?;
        let row_offsets: Vec<usize>
            = heights.iter()
            .scan(0, |acc, h| { let off = *acc; *acc += h; Some(off) })
            .collect();
        let col_offsets: Vec<usize>
            = widths.iter()
            .scan(0, |acc, w| { let off = *acc; *acc += w; Some(off) })
            .collect();
        let mut triplets: Vec<(usize, usize, C64)> = Vec::new();
        for (r, c) in (0..nbr).cartesian_product(0..nbc) {
            if let Some(b) = blocks[r][c] {
                if b.shape() != (heights[r], widths[c]) {
                    return Err(ExpmError::shape(
                        "block",
                        format!("{}x{}", heights[r], widths[c]),
                        format!("{}x{} at ({}, {})", b.nrows(), b.ncols(), r, c),
                    ));
                }
                triplets.extend(
                    b.iter()
                    .map(|(i, j, x)| (row_offsets[r] + i, col_offsets[c] + j, x))
                );
            }
        }
        let shape: (usize, usize)
            = (heights.iter().sum(), widths.iter().sum());
        Ok(Self::assemble(shape, triplets))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

    fn sample() -> CsrMatrix {
        CsrMatrix::from_triplets(
            (3, 3),
            [
                (0, 0, c(1.0, 0.0)),
                (0, 2, c(0.0, 2.0)),
                (1, 1, c(-3.0, 0.0)),
                (2, 0, c(4.0, 1.0)),
                (2, 0, c(1.0, -1.0)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn triplets_sum_duplicates() {
        let a = sample();
        assert_eq!(a.nnz(), 4);
        assert_eq!(a.to_dense()[[2, 0]], c(5.0, 0.0));
    }

    #[test]
    fn dense_round_trip() {
        let a = sample();
        assert_eq!(CsrMatrix::from_dense(&a.to_dense()), a);
    }

    #[test]
    fn rejects_bad_buffers() {
        let res = CsrMatrix::new(
            (2, 2),
            vec![c(1.0, 0.0), c(2.0, 0.0)],
            vec![1, 0],
            vec![0, 2, 2],
        );
        assert!(matches!(res, Err(ExpmError::Shape { .. })));
        let res = CsrMatrix::new((2, 2), vec![], vec![], vec![0, 0]);
        assert!(matches!(res, Err(ExpmError::Shape { .. })));
    }

    #[test]
    fn dot_matches_dense() {
        let a = sample();
        let b: nd::Array2<C64>
            = nd::Array2::from_shape_fn((3, 2), |(i, j)| c(i as f64, j as f64 - 1.0));
        let expected = a.to_dense().dot(&b);
        assert_eq!(a.dot(&b).unwrap(), expected);
        let wrong: nd::Array2<C64> = nd::Array2::zeros((2, 2));
        assert!(matches!(a.dot(&wrong), Err(ExpmError::Shape { .. })));
    }

    #[test]
    fn adjoint_is_conjugate_transpose() {
        let a = sample();
        let expected = a.to_dense().t().mapv(|x| x.conj());
        assert_eq!(a.adjoint().to_dense(), expected);
    }

    #[test]
    fn diagonal_and_shift() {
        let a = sample();
        assert_eq!(
            a.diagonal(),
            nd::array![c(1.0, 0.0), c(-3.0, 0.0), C64::zero()],
        );
        let shifted = a.add_diag(c(0.0, 1.0));
        assert_eq!(
            shifted.diagonal(),
            nd::array![c(1.0, 1.0), c(-3.0, 1.0), c(0.0, 1.0)],
        );
    }

    #[test]
    fn block_assembly() {
        let a = sample();
        let e = CsrMatrix::eye(3);
        let blocks = vec![
            vec![Some(&a), Some(&e)],
            vec![None, Some(&a)],
        ];
        let m = CsrMatrix::from_blocks(&blocks).unwrap();
        assert_eq!(m.shape(), (6, 6));
        let dense = m.to_dense();
        assert_eq!(dense[[0, 2]], c(0.0, 2.0));
        assert_eq!(dense[[1, 4]], c(1.0, 0.0));
        assert_eq!(dense[[5, 3]], c(5.0, 0.0));
        assert_eq!(dense[[3, 0]], C64::zero());
    }
}
