//! Built-in operators and the process-wide catalog they are registered in.
//!
//! Every operator shares one contract: it receives its children's evaluated
//! arrays and returns a new array. Adding an operator means adding a table
//! entry with [`register_operator`]; the tree evaluator never changes.

use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use once_cell::sync::Lazy;

#[cfg(feature = "rayon")]
use rayon::prelude::{IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::array::Array2D;
use crate::error::{ExpressionError, Result};
use crate::numeric::{self, checked_ln, checked_sqrt, divide_with_zero_for_nan_result, or_zero};

pub const PRECEDENCE_COMPARISON: u8 = 1;
pub const PRECEDENCE_ADDITIVE: u8 = 2;
pub const PRECEDENCE_MULTIPLICATIVE: u8 = 3;
pub const PRECEDENCE_UNARY: u8 = 4;
pub const PRECEDENCE_POWER: u8 = 5;
/// Function calls, constants and variables.
pub const PRECEDENCE_ATOM: u8 = 6;

/// Evaluation rule: children's outputs in, operator output out.
pub type EvalFn = fn(&Operator, &[Array2D]) -> Result<Array2D>;

/// How an operator is written in a formula.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notation {
    /// `lhs <symbol> rhs`
    Infix(&'static str),
    /// `<symbol>operand`
    Prefix(&'static str),
    /// `name(arg, ...)`
    Function,
}

/// Immutable operator metadata plus its evaluation rule.
#[derive(Clone, Debug)]
pub struct Operator {
    pub name: &'static str,
    pub argument_count: usize,
    pub precedence: u8,
    /// Per-fraction output shape.
    pub row_count: usize,
    pub col_count: usize,
    pub labels_for_output_values: &'static [&'static [&'static str]],
    pub labels_for_input_values: &'static [&'static str],
    pub definition: &'static str,
    pub notation: Notation,
    pub eval_fn: EvalFn,
}

impl Operator {
    pub fn evaluate(&self, child_outputs: &[Array2D]) -> Result<Array2D> {
        if child_outputs.len() != self.argument_count {
            return Err(self.arity_mismatch(child_outputs.len()));
        }
        (self.eval_fn)(self, child_outputs)
    }

    fn validate(&self) -> Result<()> {
        let required = match self.notation {
            Notation::Infix(_) => 2,
            Notation::Prefix(_) => 1,
            Notation::Function => return Ok(()),
        };
        if self.argument_count != required {
            return Err(ExpressionError::InvalidOperator {
                operator: self.name.to_string(),
                reason: format!(
                    "{:?} notation takes {required} argument(s), not {}",
                    self.notation, self.argument_count
                ),
            });
        }
        Ok(())
    }

    pub(crate) fn arity_mismatch(&self, actual: usize) -> ExpressionError {
        ExpressionError::ArityMismatch {
            operator: self.name.to_string(),
            expected: self.argument_count,
            actual,
        }
    }

    /// The declared shape filled with zeros; what every operator returns when
    /// it has no data to work on.
    pub fn placeholder(&self) -> Array2D {
        Array2D::zeros(self.row_count, self.col_count)
    }

    /// Composes an already-rendered (and, where needed, parenthesized) list of
    /// children into formula text.
    ///
    /// # Panics
    ///
    /// If `children` is shorter than the notation needs.
    pub fn render_formula(&self, children: &[String]) -> String {
        match self.notation {
            Notation::Infix(symbol) => format!("{} {symbol} {}", children[0], children[1]),
            Notation::Prefix(symbol) => format!("{symbol}{}", children[0]),
            Notation::Function => format!("{}({})", self.name, children.join(", ")),
        }
    }

    /// Presentation MathML counterpart of [`Operator::render_formula`].
    pub fn render_mathml(&self, children: &[String]) -> String {
        match self.notation {
            Notation::Infix("/") => {
                format!("<mfrac>{}{}</mfrac>", children[0], children[1])
            }
            Notation::Infix("^") => {
                format!("<msup>{}{}</msup>", children[0], children[1])
            }
            Notation::Infix(symbol) => format!(
                "<mrow>{}<mo>{}</mo>{}</mrow>",
                children[0],
                mathml_symbol(symbol),
                children[1]
            ),
            Notation::Prefix(symbol) => {
                format!("<mrow><mo>{}</mo>{}</mrow>", mathml_symbol(symbol), children[0])
            }
            Notation::Function => format!(
                "<mrow><mi>{}</mi><mfenced>{}</mfenced></mrow>",
                self.name,
                children.concat()
            ),
        }
    }
}

fn mathml_symbol(symbol: &str) -> &str {
    match symbol {
        "*" => "&times;",
        "-" => "&minus;",
        "<" => "&lt;",
        ">" => "&gt;",
        "<=" => "&le;",
        ">=" => "&ge;",
        "==" => "=",
        "!=" => "&ne;",
        other => other,
    }
}

static CATALOG: Lazy<RwLock<IndexMap<&'static str, Arc<Operator>>>> = Lazy::new(|| {
    RwLock::new(
        builtin_operators()
            .into_iter()
            .map(|op| (op.name, Arc::new(op)))
            .collect(),
    )
});

/// Looks up a registered operator by name.
pub fn lookup(name: &str) -> Option<Arc<Operator>> {
    CATALOG
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
}

/// Looks up a registered operator, failing with `UnknownOperator`.
pub fn require(name: &str) -> Result<Arc<Operator>> {
    lookup(name).ok_or_else(|| ExpressionError::UnknownOperator(name.to_string()))
}

/// Adds (or replaces) a catalog entry. Trees built before a replacement keep
/// the operator they were built with.
///
/// Fails with `InvalidOperator` when the notation cannot render the declared
/// argument count: infix needs two arguments, prefix one.
pub fn register_operator(operator: Operator) -> Result<Option<Arc<Operator>>> {
    operator.validate()?;
    log::debug!("registering operator `{}`", operator.name);
    Ok(CATALOG
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(operator.name, Arc::new(operator)))
}

/// Snapshot of every registered operator, in registration order.
pub fn operators() -> Vec<Arc<Operator>> {
    CATALOG
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect()
}

const NUMBER: &[&str] = &["number"];
const TWO_NUMBERS: &[&str] = &["number1", "number2"];
const VALUES: &[&str] = &["values"];

fn infix(
    name: &'static str,
    symbol: &'static str,
    precedence: u8,
    output_label: &'static [&'static [&'static str]],
    definition: &'static str,
    eval_fn: EvalFn,
) -> Operator {
    Operator {
        name,
        argument_count: 2,
        precedence,
        row_count: 1,
        col_count: 1,
        labels_for_output_values: output_label,
        labels_for_input_values: TWO_NUMBERS,
        definition,
        notation: Notation::Infix(symbol),
        eval_fn,
    }
}

fn function(
    name: &'static str,
    inputs: &'static [&'static str],
    outputs: &'static [&'static [&'static str]],
    definition: &'static str,
    eval_fn: EvalFn,
) -> Operator {
    Operator {
        name,
        argument_count: inputs.len(),
        precedence: PRECEDENCE_ATOM,
        row_count: outputs.len(),
        col_count: outputs.first().map_or(0, |row| row.len()),
        labels_for_output_values: outputs,
        labels_for_input_values: inputs,
        definition,
        notation: Notation::Function,
        eval_fn,
    }
}

fn builtin_operators() -> Vec<Operator> {
    vec![
        // Arithmetic.
        infix(
            "add",
            "+",
            PRECEDENCE_ADDITIVE,
            &[&["sum"]],
            "Adds two numbers",
            |op, args| binary(op, args, |a, b| a + b),
        ),
        infix(
            "subtract",
            "-",
            PRECEDENCE_ADDITIVE,
            &[&["difference"]],
            "Subtracts the second number from the first",
            |op, args| binary(op, args, |a, b| a - b),
        ),
        infix(
            "multiply",
            "*",
            PRECEDENCE_MULTIPLICATIVE,
            &[&["product"]],
            "Multiplies two numbers",
            |op, args| binary(op, args, |a, b| a * b),
        ),
        infix(
            "divide",
            "/",
            PRECEDENCE_MULTIPLICATIVE,
            &[&["quotient"]],
            "Divides the first number by the second, returning 0 where the result is undefined",
            |op, args| binary(op, args, divide_with_zero_for_nan_result),
        ),
        infix(
            "pow",
            "^",
            PRECEDENCE_POWER,
            &[&["power"]],
            "Raises the first number to the power of the second",
            |op, args| binary(op, args, f64::powf),
        ),
        Operator {
            name: "neg",
            argument_count: 1,
            precedence: PRECEDENCE_UNARY,
            row_count: 1,
            col_count: 1,
            labels_for_output_values: &[&["negation"]],
            labels_for_input_values: NUMBER,
            definition: "Negates a number",
            notation: Notation::Prefix("-"),
            eval_fn: |op, args| unary(op, args, |x| -x),
        },
        // Comparisons yield 1.0 for true and 0.0 for false.
        infix(
            "lt",
            "<",
            PRECEDENCE_COMPARISON,
            &[&["isLess"]],
            "1 if the first number is less than the second, else 0",
            |op, args| binary(op, args, |a, b| truth(a < b)),
        ),
        infix(
            "le",
            "<=",
            PRECEDENCE_COMPARISON,
            &[&["isLessOrEqual"]],
            "1 if the first number is at most the second, else 0",
            |op, args| binary(op, args, |a, b| truth(a <= b)),
        ),
        infix(
            "gt",
            ">",
            PRECEDENCE_COMPARISON,
            &[&["isGreater"]],
            "1 if the first number is greater than the second, else 0",
            |op, args| binary(op, args, |a, b| truth(a > b)),
        ),
        infix(
            "ge",
            ">=",
            PRECEDENCE_COMPARISON,
            &[&["isGreaterOrEqual"]],
            "1 if the first number is at least the second, else 0",
            |op, args| binary(op, args, |a, b| truth(a >= b)),
        ),
        infix(
            "eq",
            "==",
            PRECEDENCE_COMPARISON,
            &[&["isEqual"]],
            "1 if the numbers are equal, else 0",
            |op, args| binary(op, args, |a, b| truth(a == b)),
        ),
        infix(
            "ne",
            "!=",
            PRECEDENCE_COMPARISON,
            &[&["isNotEqual"]],
            "1 if the numbers differ, else 0",
            |op, args| binary(op, args, |a, b| truth(a != b)),
        ),
        // Element-wise functions.
        function(
            "ln",
            NUMBER,
            &[&["natLog"]],
            "Returns the natural logarithm of a number",
            |op, args| unary(op, args, |x| or_zero(checked_ln(x))),
        ),
        function(
            "exp",
            NUMBER,
            &[&["exponential"]],
            "Returns e raised to the power of a number",
            |op, args| unary(op, args, f64::exp),
        ),
        function(
            "sqrt",
            NUMBER,
            &[&["squareRoot"]],
            "Returns the non-negative square root of a number",
            |op, args| unary(op, args, |x| or_zero(checked_sqrt(x))),
        ),
        function(
            "abs",
            NUMBER,
            &[&["absoluteValue"]],
            "Returns the absolute value of a number",
            |op, args| unary(op, args, f64::abs),
        ),
        // Aggregates reduce every element of their input.
        function(
            "sum",
            VALUES,
            &[&["sum"]],
            "Returns the sum of the values",
            |op, args| aggregate(op, args, |v| v.iter().sum()),
        ),
        function(
            "count",
            VALUES,
            &[&["count"]],
            "Returns the number of values",
            |op, args| aggregate(op, args, |v| v.len() as f64),
        ),
        function(
            "average",
            VALUES,
            &[&["mean"]],
            "Returns the arithmetic mean of the values",
            |op, args| aggregate(op, args, numeric::mean),
        ),
        function(
            "stdev",
            VALUES,
            &[&["stdDev"]],
            "Returns the sample standard deviation of the values",
            |op, args| aggregate(op, args, numeric::sample_std_dev),
        ),
        function(
            "max",
            VALUES,
            &[&["max"]],
            "Returns the largest of the values",
            |op, args| aggregate(op, args, |v| v.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        ),
        function(
            "min",
            VALUES,
            &[&["min"]],
            "Returns the smallest of the values",
            |op, args| aggregate(op, args, |v| v.iter().copied().fold(f64::INFINITY, f64::min)),
        ),
        function(
            "wtdav",
            &["values", "oneSigmaAbsUnct"],
            &[&["wtdAv", "wtdAvOneSigmaAbs", "mswd"]],
            "Returns the inverse-variance weighted mean of the values, its one-sigma uncertainty and the MSWD",
            |op, args| {
                let (values, sigmas) = (&args[0], &args[1]);
                if values.is_empty() || sigmas.is_empty() {
                    return Ok(op.placeholder());
                }
                let wm = numeric::weighted_mean(values.values(), sigmas.values());
                Ok(Array2D::from_vec(1, 3, vec![wm.mean, wm.sigma, wm.mswd]))
            },
        ),
        // Lookups.
        function(
            "if",
            &["condition", "valueIfTrue", "valueIfFalse"],
            &[&["value"]],
            "Returns the second argument where the condition is non-zero, else the third",
            |op, args| {
                broadcast(op, [&args[0], &args[1], &args[2]], |[cond, yes, no]| {
                    if cond != 0.0 && !cond.is_nan() {
                        yes
                    } else {
                        no
                    }
                })
            },
        ),
        function(
            "index",
            &["array", "row", "column"],
            &[&["value"]],
            "Returns the element of an array at a zero-based row and column, or 0 if out of range",
            |op, args| {
                let (Some(row), Some(col)) = (args[1].get(0, 0), args[2].get(0, 0)) else {
                    return Ok(op.placeholder());
                };
                let value = (row >= 0.0 && col >= 0.0)
                    .then(|| args[0].get(row as usize, col as usize))
                    .flatten()
                    .unwrap_or(0.0);
                Ok(Array2D::scalar(value))
            },
        ),
    ]
}

fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn unary(op: &Operator, args: &[Array2D], f: fn(f64) -> f64) -> Result<Array2D> {
    broadcast(op, [&args[0]], |[x]| f(x))
}

fn binary(op: &Operator, args: &[Array2D], f: fn(f64, f64) -> f64) -> Result<Array2D> {
    broadcast(op, [&args[0], &args[1]], |[a, b]| f(a, b))
}

fn broadcast_dim(op: &Operator, lhs: (usize, usize), rhs: (usize, usize)) -> Result<(usize, usize)> {
    let dim = |a: usize, b: usize| match (a, b) {
        _ if a == b => Some(a),
        (1, _) => Some(b),
        (_, 1) => Some(a),
        _ => None,
    };
    match (dim(lhs.0, rhs.0), dim(lhs.1, rhs.1)) {
        (Some(rows), Some(cols)) => Ok((rows, cols)),
        _ => Err(ExpressionError::ShapeMismatch {
            operator: op.name.to_string(),
            lhs,
            rhs,
        }),
    }
}

/// Applies `f` element-wise, stretching any dimension of size 1 to match the
/// other inputs.
fn broadcast<const N: usize>(
    op: &Operator,
    inputs: [&Array2D; N],
    f: impl Fn([f64; N]) -> f64 + Send + Sync,
) -> Result<Array2D> {
    if inputs.iter().any(|a| a.is_empty()) {
        return Ok(op.placeholder());
    }
    let mut shape = inputs[0].shape();
    for input in &inputs[1..] {
        shape = broadcast_dim(op, shape, input.shape())?;
    }
    let (rows, cols) = shape;
    let element = |i: usize| f(inputs.map(|a| a.broadcast_get(i / cols, i % cols)));

    let mut output = Vec::with_capacity(rows * cols);
    #[cfg(feature = "rayon")]
    {
        output.par_extend((0..rows * cols).into_par_iter().map(element));
    }
    #[cfg(not(feature = "rayon"))]
    {
        output.extend((0..rows * cols).map(element));
    }
    Ok(Array2D::from_vec(rows, cols, output))
}

/// Reduces every element of the single input to one value.
fn aggregate(op: &Operator, args: &[Array2D], f: fn(&[f64]) -> f64) -> Result<Array2D> {
    let values = &args[0];
    if values.is_empty() {
        return Ok(op.placeholder());
    }
    Ok(Array2D::scalar(f(values.values())))
}
