//! Error taxonomy shared by every numerical routine in the crate.

use thiserror::Error;

/// Errors that can occur while computing exponentials, their actions, or their
/// derivatives.
#[derive(Debug, Error)]
pub enum ExpmError {
    /// Dimensions of an operator, control, state, or gradient do not agree.
    #[error("shape mismatch in {what}: expected {expected}, found {found}")]
    Shape {
        what: &'static str,
        expected: String,
        found: String,
    },

    /// A series term, intermediate, or final result was NaN or infinite.
    #[error("non-finite values encountered during {stage}")]
    NumericalOverflow { stage: &'static str },

    /// The requested tolerance cannot be met within the internally derived
    /// iteration bound.
    #[error("tolerance {tol:e} unreachable within {bound} iterations")]
    ToleranceUnreachable { tol: f64, bound: usize },

    /// A single item of a batch failed; the whole batch is aborted.
    #[error("batch item {index} failed")]
    BatchItem {
        index: usize,
        #[source]
        source: Box<ExpmError>,
    },

    /// Tolerances must be positive and finite.
    #[error("invalid tolerance {0}: must be positive and finite")]
    InvalidTolerance(f64),

    /// The Padé denominator could not be inverted.
    #[error("Padé denominator is numerically singular")]
    Singular,

    /// Configuration could not be read or validated.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ExpmError {
    pub(crate) fn shape<E, F>(what: &'static str, expected: E, found: F)
        -> Self
    where
        E: std::fmt::Display,
        F: std::fmt::Display,
    {
        Self::Shape {
            what,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Attach a batch index to `self`.
    pub fn at_index(self, index: usize) -> Self {
        Self::BatchItem { index, source: Box::new(self) }
    }
}

/// Shorthand result type for this crate.
pub type ExpmResult<T> = Result<T, ExpmError>;
