//! Expression evaluation engine for ion-microprobe (SHRIMP) data reduction.
//!
//! Derived quantities (ratios, logs, geochronology formulas) are written as
//! formulas, parsed into immutable expression trees and evaluated over the
//! measured fractions of a task. Each node produces a 2-D array: one row per
//! fraction for per-fraction trees, or a single array for summary trees that
//! aggregate the whole selection.
//!
//! Numeric edge cases never abort a calculation: a NaN quotient is `0`, and
//! the logarithm of a non-positive value is `0`. Structural problems
//! (unresolved names, wrong argument counts, cyclic references between
//! expressions) are reported as [`ExpressionError`]s.
//!
//! With the `rayon` feature, operands, fractions and independent expressions
//! are evaluated in parallel.
//!
//! # Example
//!
//! ```rust
//! use shrimp_expr::*;
//!
//! let mut task = TaskContext::new()
//!     .with_fraction(Fraction::unknown("spot-1").with_value("206Pb", 12.0).with_value("238U", 4.0)).unwrap()
//!     .with_fraction(Fraction::unknown("spot-2").with_value("206Pb", 3.0).with_value("238U", 0.0)).unwrap();
//!
//! task.register(Expression::parse("ratio", "[\"206Pb\"] / [\"238U\"]").unwrap()).unwrap();
//! task.register(Expression::parse_summary("meanRatio", "average(ratio)").unwrap()).unwrap();
//!
//! let report = task.evaluate_all().unwrap();
//! assert!(report.is_complete());
//! assert_eq!(task.result("ratio").unwrap().to_array().to_rows(), vec![vec![3.0], vec![0.0]]);
//! assert_eq!(task.result("meanRatio").unwrap().to_array(), Array2D::scalar(1.5));
//! ```

mod array;
mod error;
mod evaluate;
mod expression;
mod fraction;
pub mod numeric;
pub mod operation;
mod parse;
mod registry;
pub mod serialization;
mod task;

/// Uses the [`pest`] parsing expression grammar language.
///
/// ```text
#[doc = include_str!("grammar.pest")]
/// ```
pub mod grammar_doc {}

pub use array::Array2D;
pub use error::{ExpressionError, Result};
pub use evaluate::{ExpressionResult, Scope};
pub use expression::{EvaluationMode, Expression, ExpressionTree, Node, Operation};
pub use fraction::Fraction;
pub use operation::{Notation, Operator};
pub use parse::{parse_formula, parse_variable_names, ParseError};
pub use registry::{ExpressionRegistry, RegistrationMode};
pub use serialization::OperatorDescriptor;
pub use task::{EvaluationReport, TaskContext};
