use thiserror::Error;

use crate::parse::ParseError;

pub type Result<T, E = ExpressionError> = std::result::Result<T, E>;

/// Structural and lookup failures.
///
/// Numeric edge cases (division by zero, logarithm of a non-positive value)
/// never show up here: operators resolve them to sentinel values.
#[derive(Error, Debug)]
pub enum ExpressionError {
    #[error("unresolved reference `{name}`")]
    UnresolvedReference { name: String },

    #[error("operator `{operator}` expects {expected} argument(s) but got {actual}")]
    ArityMismatch {
        operator: String,
        expected: usize,
        actual: usize,
    },

    #[error("unknown operator `{0}`")]
    UnknownOperator(String),

    #[error("operator `{operator}` cannot combine shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        operator: String,
        lhs: (usize, usize),
        rhs: (usize, usize),
    },

    #[error("cyclic dependency between expressions {names:?}")]
    CyclicDependency { names: Vec<String> },

    #[error("expression `{0}` is already registered")]
    DuplicateName(String),

    #[error("a fraction named `{0}` is already in the task")]
    DuplicateFraction(String),

    #[error("operator `{operator}` is malformed: {reason}")]
    InvalidOperator { operator: String, reason: String },

    #[error("expression `{0}` not found")]
    NotFound(String),

    #[error(transparent)]
    Parse(#[from] Box<ParseError>),
}

impl From<ParseError> for ExpressionError {
    fn from(e: ParseError) -> Self {
        Self::Parse(Box::new(e))
    }
}
