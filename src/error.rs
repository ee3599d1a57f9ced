use thiserror::Error;

/// Unified error type for `hdfe` operations.
#[derive(Debug, Error)]
pub enum HdfeError {
    /// Raised when an option or argument is malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Human-readable description of the problem.
        message: String,
    },

    /// Raised when provided vectors or columns have incompatible lengths.
    #[error("length mismatch in {context}: expected {expected} but found {found}")]
    LengthMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required length, usually the number of table rows.
        expected: usize,
        /// The length that was actually supplied.
        found: usize,
    },

    /// Raised when a formulation or option references a column the table lacks.
    #[error("column `{name}` does not exist in the table")]
    UnknownColumn { name: String },

    /// Raised when a column is used in a role that requires another type.
    #[error("column `{name}` must be {expected}")]
    WrongColumnType {
        name: String,
        expected: &'static str,
    },

    /// Raised when no observation survives sample selection.
    #[error("sample is empty after removing missing values, weights, subset and singletons")]
    EmptySample,

    /// Raised when there are fewer instruments than endogenous regressors.
    #[error(
        "model not identified: {instruments} instruments for {endogenous} endogenous regressors"
    )]
    NotIdentified {
        instruments: usize,
        endogenous: usize,
    },

    /// Raised when a block of the design contains infinite or NaN values.
    #[error("some observations for the {block} are not finite")]
    NonFiniteValue { block: &'static str },

    /// Raised when linear algebra operations encounter a singular system.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },
}

impl HdfeError {
    /// Helper to format an [`InvalidArgument`](HdfeError::InvalidArgument) error.
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Helper to format a [`LengthMismatch`](HdfeError::LengthMismatch) error.
    pub fn length_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::LengthMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    /// Helper for references to absent columns.
    pub fn unknown_column<S: Into<String>>(name: S) -> Self {
        Self::UnknownColumn { name: name.into() }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, HdfeError>;
