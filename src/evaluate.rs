use std::collections::HashMap;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

#[cfg(feature = "rayon")]
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use crate::array::Array2D;
use crate::error::{ExpressionError, Result};
use crate::expression::{EvaluationMode, ExpressionTree, Node};
use crate::fraction::Fraction;

/// A cached expression result.
#[derive(Clone, Debug, PartialEq)]
pub enum ExpressionResult {
    /// One array for the whole selection (summary trees, named constants,
    /// parameter values).
    Summary(Array2D),
    /// One row per fraction, keyed by fraction name.
    PerFraction(IndexMap<String, Vec<f64>>),
}

impl ExpressionResult {
    /// Stacks per-fraction rows in evaluation order (see
    /// [`Array2D::stack_rows`]).
    pub fn to_array(&self) -> Array2D {
        match self {
            Self::Summary(array) => array.clone(),
            Self::PerFraction(rows) => {
                let rows: Vec<&[f64]> = rows.values().map(Vec::as_slice).collect();
                Array2D::stack_rows(&rows)
            }
        }
    }

    /// The row computed for `fraction`, if this is a per-fraction result that
    /// covered it.
    pub fn row(&self, fraction: &str) -> Option<&[f64]> {
        match self {
            Self::Summary(_) => None,
            Self::PerFraction(rows) => rows.get(fraction).map(Vec::as_slice),
        }
    }
}

/// Everything a variable reference can bind to besides the fractions being
/// evaluated.
#[derive(Clone, Copy, Debug)]
pub struct Scope<'a> {
    /// Quantity names measured on any fraction of the task, so that a field
    /// reference over an empty selection still resolves (to no rows).
    pub quantities: &'a IndexSet<String>,
    /// Fresh results of named expressions.
    pub results: &'a HashMap<String, Arc<ExpressionResult>>,
    /// Named expressions that failed in this pass. A reference to one of them
    /// is unresolved even if a parameter has the same name.
    pub failed: &'a IndexSet<String>,
    pub parameters: &'a IndexMap<String, f64>,
}

impl ExpressionTree {
    /// Calculates the tree over `fractions`.
    ///
    /// In per-fraction mode each fraction contributes one row; in summary mode
    /// the root's output is returned as is.
    pub fn evaluate<F: AsRef<Fraction> + Sync>(
        &self,
        fractions: &[F],
        scope: &Scope,
    ) -> Result<Array2D> {
        Ok(self.evaluate_result(fractions, scope)?.to_array())
    }

    /// Like [`ExpressionTree::evaluate`], keeping per-fraction rows keyed by
    /// fraction name.
    pub fn evaluate_result<F: AsRef<Fraction> + Sync>(
        &self,
        fractions: &[F],
        scope: &Scope,
    ) -> Result<ExpressionResult> {
        match self.mode() {
            EvaluationMode::Summary => Ok(ExpressionResult::Summary(
                self.root().evaluate(fractions, scope)?,
            )),
            EvaluationMode::PerFraction => {
                let evaluate_one = |fraction: &F| -> Result<(String, Vec<f64>)> {
                    let output = self.root().evaluate(std::slice::from_ref(fraction), scope)?;
                    Ok((fraction.as_ref().name().to_string(), output.values().to_vec()))
                };

                #[cfg(feature = "rayon")]
                let rows = fractions
                    .par_iter()
                    .map(evaluate_one)
                    .collect::<Result<Vec<_>>>()?;
                #[cfg(not(feature = "rayon"))]
                let rows = fractions
                    .iter()
                    .map(evaluate_one)
                    .collect::<Result<Vec<_>>>()?;

                Ok(ExpressionResult::PerFraction(rows.into_iter().collect()))
            }
        }
    }
}

impl Node {
    /// Calculates this node over `fractions`, one row per fraction for
    /// fraction quantities.
    pub fn evaluate<F: AsRef<Fraction> + Sync>(
        &self,
        fractions: &[F],
        scope: &Scope,
    ) -> Result<Array2D> {
        match self {
            Self::Constant(value) => Ok(Array2D::scalar(*value)),
            Self::Variable(name) => resolve_variable(name, fractions, scope),
            Self::Operation(op) => {
                // Children are independent, so they may run in parallel.
                #[cfg(feature = "rayon")]
                let outputs = op
                    .children()
                    .par_iter()
                    .map(|child| child.evaluate(fractions, scope))
                    .collect::<Result<Vec<_>>>()?;
                #[cfg(not(feature = "rayon"))]
                let outputs = op
                    .children()
                    .iter()
                    .map(|child| child.evaluate(fractions, scope))
                    .collect::<Result<Vec<_>>>()?;

                op.operator().evaluate(&outputs)
            }
        }
    }
}

const NO_VALUES: &[f64] = &[];

/// Fraction fields first, then named expressions, then task parameters.
fn resolve_variable<F: AsRef<Fraction>>(
    name: &str,
    fractions: &[F],
    scope: &Scope,
) -> Result<Array2D> {
    let is_quantity = scope.quantities.contains(name)
        || fractions.iter().any(|f| f.as_ref().get(name).is_some());
    if is_quantity {
        let rows: Vec<&[f64]> = fractions
            .iter()
            .map(|f| {
                let f = f.as_ref();
                f.get(name).unwrap_or_else(|| {
                    log::warn!("fraction `{}` has no `{name}`; using zeros", f.name());
                    NO_VALUES
                })
            })
            .collect();
        let array = Array2D::stack_rows(&rows);
        if array.is_empty() {
            return Ok(Array2D::zeros(rows.len(), 1));
        }
        return Ok(array);
    }

    if scope.failed.contains(name) {
        return Err(ExpressionError::UnresolvedReference {
            name: name.to_string(),
        });
    }

    if let Some(result) = scope.results.get(name) {
        return Ok(match result.as_ref() {
            ExpressionResult::Summary(array) => array.clone(),
            // Over no fractions, every row is in play.
            ExpressionResult::PerFraction(_) if fractions.is_empty() => result.to_array(),
            ExpressionResult::PerFraction(by_fraction) => {
                let width = by_fraction.values().map(Vec::len).max().unwrap_or(1);
                let rows: Vec<&[f64]> = fractions
                    .iter()
                    .map(|f| {
                        let f = f.as_ref();
                        by_fraction.get(f.name()).map(Vec::as_slice).unwrap_or_else(|| {
                            log::warn!(
                                "expression `{name}` has no value for fraction `{}`; using zeros",
                                f.name()
                            );
                            NO_VALUES
                        })
                    })
                    .collect();
                let array = Array2D::stack_rows(&rows);
                if array.is_empty() {
                    Array2D::zeros(rows.len(), width)
                } else {
                    array
                }
            }
        });
    }

    if let Some(value) = scope.parameters.get(name) {
        return Ok(Array2D::scalar(*value));
    }

    Err(ExpressionError::UnresolvedReference {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_formula;
    use pretty_assertions::assert_eq;

    struct Bindings {
        quantities: IndexSet<String>,
        results: HashMap<String, Arc<ExpressionResult>>,
        failed: IndexSet<String>,
        parameters: IndexMap<String, f64>,
    }

    impl Bindings {
        fn new() -> Self {
            Self {
                quantities: IndexSet::new(),
                results: HashMap::new(),
                failed: IndexSet::new(),
                parameters: IndexMap::new(),
            }
        }

        fn scope(&self) -> Scope<'_> {
            Scope {
                quantities: &self.quantities,
                results: &self.results,
                failed: &self.failed,
                parameters: &self.parameters,
            }
        }
    }

    fn node(formula: &str) -> Node {
        parse_formula(formula).unwrap()
    }

    #[test]
    fn ln_of_e_is_one() {
        let fractions = [Fraction::unknown("spot-1").with_value("number", std::f64::consts::E)];
        let bindings = Bindings::new();
        let output = node("ln(number)").evaluate(&fractions, &bindings.scope()).unwrap();
        assert_eq!(output.shape(), (1, 1));
        assert!((output.values()[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn division_by_zero_is_zero() {
        let fractions = [Fraction::unknown("spot-1")
            .with_value("num", 5.0)
            .with_value("den", 0.0)];
        let bindings = Bindings::new();
        let output = node("num / den").evaluate(&fractions, &bindings.scope()).unwrap();
        assert_eq!(output.to_rows(), vec![vec![0.0]]);
    }

    #[test]
    fn constant_is_one_by_one() {
        let bindings = Bindings::new();
        let output = Node::constant(4.5)
            .evaluate::<Fraction>(&[], &bindings.scope())
            .unwrap();
        assert_eq!(output, Array2D::scalar(4.5));
    }

    #[test]
    fn per_scan_sequences_become_columns() {
        let fractions = [
            Fraction::unknown("a").with_values("ratio", vec![1.0, 2.0, 3.0]),
            Fraction::unknown("b").with_values("ratio", vec![4.0, 5.0, 6.0]),
        ];
        let bindings = Bindings::new();
        let output = node("ratio * 2").evaluate(&fractions, &bindings.scope()).unwrap();
        assert_eq!(output.to_rows(), vec![vec![2.0, 4.0, 6.0], vec![8.0, 10.0, 12.0]]);
    }

    #[test]
    fn resolution_order() {
        let fractions = [Fraction::unknown("a").with_value("x", 1.0)];
        let mut bindings = Bindings::new();
        bindings.parameters.insert("x".into(), 100.0);
        bindings.parameters.insert("lambda238".into(), 1.55125e-10);
        bindings
            .results
            .insert("x".into(), Arc::new(ExpressionResult::Summary(Array2D::scalar(10.0))));
        bindings
            .results
            .insert("y".into(), Arc::new(ExpressionResult::Summary(Array2D::scalar(10.0))));
        bindings.parameters.insert("y".into(), 100.0);

        let scope = bindings.scope();
        // Fraction field shadows expression and parameter.
        assert_eq!(node("x").evaluate(&fractions, &scope).unwrap(), Array2D::scalar(1.0));
        // Expression shadows parameter.
        assert_eq!(node("y").evaluate(&fractions, &scope).unwrap(), Array2D::scalar(10.0));
        assert_eq!(
            node("lambda238").evaluate(&fractions, &scope).unwrap(),
            Array2D::scalar(1.55125e-10)
        );
    }

    #[test]
    fn unresolved_reference() {
        let bindings = Bindings::new();
        let err = node("1 + missing")
            .evaluate::<Fraction>(&[], &bindings.scope())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::UnresolvedReference { name } if name == "missing"));
    }

    #[test]
    fn empty_selection_yields_placeholders() {
        let mut bindings = Bindings::new();
        bindings.quantities.insert("x".into());
        let tree = ExpressionTree::summary(node("average(x)"));
        let output = tree.evaluate::<Fraction>(&[], &bindings.scope()).unwrap();
        assert_eq!(output, Array2D::scalar(0.0));
        let output = node("ln(x)").evaluate::<Fraction>(&[], &bindings.scope()).unwrap();
        assert_eq!(output, Array2D::scalar(0.0));
    }

    #[test]
    fn summary_and_per_fraction_modes() {
        let fractions = [
            Fraction::unknown("a").with_values("r", vec![1.0, 3.0]),
            Fraction::unknown("b").with_values("r", vec![5.0, 7.0]),
        ];
        let bindings = Bindings::new();
        let scope = bindings.scope();

        let per_fraction = ExpressionTree::new(node("average(r)"));
        let result = per_fraction.evaluate_result(&fractions, &scope).unwrap();
        assert_eq!(result.row("a"), Some(&[2.0][..]));
        assert_eq!(result.to_array().to_rows(), vec![vec![2.0], vec![6.0]]);

        let summary = ExpressionTree::summary(node("average(r)"));
        assert_eq!(summary.evaluate(&fractions, &scope).unwrap(), Array2D::scalar(4.0));
    }

    #[test]
    fn per_fraction_reference_picks_matching_row() {
        let fractions = [Fraction::unknown("a"), Fraction::unknown("b")];
        let mut bindings = Bindings::new();
        let rows: IndexMap<String, Vec<f64>> =
            [("b".to_string(), vec![20.0]), ("a".to_string(), vec![10.0])].into_iter().collect();
        bindings
            .results
            .insert("ratio".into(), Arc::new(ExpressionResult::PerFraction(rows)));

        let scope = bindings.scope();
        let output = ExpressionTree::new(node("ratio + 1"))
            .evaluate(&fractions, &scope)
            .unwrap();
        assert_eq!(output.to_rows(), vec![vec![11.0], vec![21.0]]);

        let missing = [Fraction::unknown("c")];
        let output = node("ratio").evaluate(&missing, &scope).unwrap();
        assert_eq!(output.to_rows(), vec![vec![0.0]]);
    }

    #[test]
    fn fraction_subsets_by_reference() {
        let all = vec![
            Fraction::reference_material("std-1").with_value("x", 2.0),
            Fraction::unknown("spot-1").with_value("x", 3.0),
        ];
        let references: Vec<&Fraction> = all.iter().filter(|f| f.is_reference_material()).collect();
        let bindings = Bindings::new();
        let output = node("x").evaluate(&references, &bindings.scope()).unwrap();
        assert_eq!(output, Array2D::scalar(2.0));
    }

    #[test]
    fn uneven_scan_counts_do_not_dilute_summaries() {
        let fractions = [
            Fraction::unknown("a").with_values("r", vec![1.0, 1.0, 1.0]),
            Fraction::unknown("b").with_values("r", vec![1.0, 1.0]),
        ];
        let bindings = Bindings::new();
        let scope = bindings.scope();
        let summary = |formula| ExpressionTree::summary(node(formula));

        assert_eq!(summary("average(r)").evaluate(&fractions, &scope).unwrap(), Array2D::scalar(1.0));
        assert_eq!(summary("count(r)").evaluate(&fractions, &scope).unwrap(), Array2D::scalar(5.0));
        assert_eq!(summary("min(r)").evaluate(&fractions, &scope).unwrap(), Array2D::scalar(1.0));

        let mut bindings = Bindings::new();
        let rows: IndexMap<String, Vec<f64>> =
            [("a".to_string(), vec![2.0, 2.0, 2.0]), ("b".to_string(), vec![2.0, 2.0])]
                .into_iter()
                .collect();
        bindings
            .results
            .insert("scans".into(), Arc::new(ExpressionResult::PerFraction(rows)));
        let output = summary("stdev(scans)").evaluate(&fractions, &bindings.scope()).unwrap();
        assert_eq!(output, Array2D::scalar(0.0));
    }

    #[test]
    fn failed_expression_is_not_replaced_by_a_parameter() {
        let mut bindings = Bindings::new();
        bindings.parameters.insert("ratio".into(), 7.0);
        bindings.failed.insert("ratio".into());
        let err = node("ratio * 2")
            .evaluate::<Fraction>(&[], &bindings.scope())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::UnresolvedReference { name } if name == "ratio"));
    }
}
