use std::sync::Arc;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::operation::{self, Notation, Operator, PRECEDENCE_ATOM, PRECEDENCE_UNARY};
use crate::parse::parse_formula;
use crate::serialization::NodeRepr;

/// One node of an expression tree. Immutable once built: an edit builds a new
/// tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NodeRepr", into = "NodeRepr")]
pub enum Node {
    // Literal, evaluates to `[[value]]`.
    Constant(f64),

    // Fraction quantity, named expression or task parameter.
    Variable(String),

    Operation(Operation),
}

/// An operator applied to exactly `argument_count` children.
#[derive(Clone, Debug)]
pub struct Operation {
    operator: Arc<Operator>,
    children: Vec<Node>,
}

impl Operation {
    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    fn wraps(&self, child: &Node) -> bool {
        self.operator.notation != Notation::Function && child.precedence() < self.operator.precedence
    }

    /// Like [`Operation::wraps`], also wrapping an equal-precedence operand on
    /// the side the parser would not group it with: the right operand of a
    /// left-associative operator, the left operand of `^`.
    fn wraps_for_source(&self, position: usize, child: &Node) -> bool {
        if self.wraps(child) {
            return true;
        }
        let Notation::Infix(symbol) = self.operator.notation else {
            return false;
        };
        let against_grouping = if symbol == "^" { 0 } else { 1 };
        position == against_grouping && child.precedence() == self.operator.precedence
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.operator.name == other.operator.name && self.children == other.children
    }
}

impl Node {
    pub fn constant(value: f64) -> Self {
        Self::Constant(value)
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    /// Builds an operation from the catalog entry called `operator`.
    pub fn operation(operator: &str, children: Vec<Node>) -> Result<Self> {
        Self::with_operator(operation::require(operator)?, children)
    }

    /// Fails with `ArityMismatch` unless `children` matches the operator's
    /// argument count.
    pub fn with_operator(operator: Arc<Operator>, children: Vec<Node>) -> Result<Self> {
        if children.len() != operator.argument_count {
            return Err(operator.arity_mismatch(children.len()));
        }
        Ok(Self::Operation(Operation { operator, children }))
    }

    /// Display precedence. A negative constant prints with a leading minus and
    /// so ranks like a negation.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Constant(value) if value.is_sign_negative() => PRECEDENCE_UNARY,
            Self::Constant(_) | Self::Variable(_) => PRECEDENCE_ATOM,
            Self::Operation(op) => op.operator.precedence,
        }
    }

    /// Every variable name in the tree, in first-occurrence order.
    pub fn references(&self) -> IndexSet<String> {
        let mut names = IndexSet::new();
        self.collect_references(&mut names);
        names
    }

    fn collect_references(&self, names: &mut IndexSet<String>) {
        match self {
            Self::Constant(_) => {}
            Self::Variable(name) => {
                names.insert(name.clone());
            }
            Self::Operation(op) => {
                for child in &op.children {
                    child.collect_references(names);
                }
            }
        }
    }

    /// Formula text. A child is parenthesized iff its precedence is strictly
    /// lower than that of the infix or prefix operator above it.
    pub fn to_formula_string(&self) -> String {
        match self {
            Self::Constant(value) => value.to_string(),
            Self::Variable(name) if is_plain_identifier(name) => name.clone(),
            Self::Variable(name) => format!("[\"{name}\"]"),
            Self::Operation(op) => {
                let children: Vec<String> = op
                    .children
                    .iter()
                    .map(|child| {
                        let rendered = child.to_formula_string();
                        if op.wraps(child) {
                            format!("({rendered})")
                        } else {
                            rendered
                        }
                    })
                    .collect();
                op.operator.render_formula(&children)
            }
        }
    }

    /// Formula text that parses back to this exact tree. Differs from
    /// [`Node::to_formula_string`] only where operands of equal precedence
    /// would otherwise regroup, e.g. `a - (b - c)`.
    pub fn to_source_string(&self) -> String {
        match self {
            Self::Operation(op) => {
                let children: Vec<String> = op
                    .children
                    .iter()
                    .enumerate()
                    .map(|(position, child)| {
                        let rendered = child.to_source_string();
                        if op.wraps_for_source(position, child) {
                            format!("({rendered})")
                        } else {
                            rendered
                        }
                    })
                    .collect();
                op.operator.render_formula(&children)
            }
            _ => self.to_formula_string(),
        }
    }

    /// Presentation MathML fragment, parenthesized like
    /// [`Node::to_formula_string`].
    pub fn to_mathml(&self) -> String {
        match self {
            Self::Constant(value) => format!("<mn>{value}</mn>"),
            Self::Variable(name) => format!("<mi>{}</mi>", escape_markup(name)),
            Self::Operation(op) => {
                let children: Vec<String> = op
                    .children
                    .iter()
                    .map(|child| {
                        let rendered = child.to_mathml();
                        if op.wraps(child) {
                            format!("<mfenced>{rendered}</mfenced>")
                        } else {
                            rendered
                        }
                    })
                    .collect();
                op.operator.render_mathml(&children)
            }
        }
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_markup(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Whether a tree runs once per fraction or once over the whole selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvaluationMode {
    /// Each fraction is evaluated on its own and contributes one row.
    #[default]
    PerFraction,
    /// Aggregates see every selected fraction at once.
    Summary,
}

/// Root of an expression: a node plus how to run it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpressionTree {
    root: Node,
    #[serde(default)]
    mode: EvaluationMode,
}

impl ExpressionTree {
    pub fn new(root: Node) -> Self {
        Self {
            root,
            mode: EvaluationMode::PerFraction,
        }
    }

    pub fn summary(root: Node) -> Self {
        Self {
            root,
            mode: EvaluationMode::Summary,
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn mode(&self) -> EvaluationMode {
        self.mode
    }

    pub fn references(&self) -> IndexSet<String> {
        self.root.references()
    }

    pub fn to_formula_string(&self) -> String {
        self.root.to_formula_string()
    }

    /// Complete `<math>` element.
    pub fn to_mathml(&self) -> String {
        format!(
            "<math xmlns=\"http://www.w3.org/1998/Math/MathML\">{}</math>",
            self.root.to_mathml()
        )
    }
}

/// A named formula with its tree and metadata, as owned by the registry.
///
/// Field order is the persisted order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expression {
    name: String,
    source_formula: String,
    is_named_constant: bool,
    // Absent from files written before these flags existed.
    #[serde(default)]
    is_reference_material_value: bool,
    #[serde(default)]
    is_parameter_value: bool,
    expression_tree: ExpressionTree,
    notes: String,
}

impl Expression {
    /// Wraps a programmatically built tree; the source text is rendered from
    /// it with [`Node::to_source_string`], so it parses back to the same tree.
    pub fn new(name: impl Into<String>, tree: ExpressionTree) -> Self {
        Self {
            name: name.into(),
            source_formula: tree.root().to_source_string(),
            is_named_constant: false,
            is_reference_material_value: false,
            is_parameter_value: false,
            expression_tree: tree,
            notes: String::new(),
        }
    }

    /// Parses `source` into a per-fraction tree.
    pub fn parse(name: impl Into<String>, source: &str) -> Result<Self> {
        let mut expression = Self::new(name, ExpressionTree::new(parse_formula(source)?));
        expression.source_formula = source.to_string();
        Ok(expression)
    }

    /// Like [`Expression::parse`], for a summary tree.
    pub fn parse_summary(name: impl Into<String>, source: &str) -> Result<Self> {
        let mut expression = Self::new(name, ExpressionTree::summary(parse_formula(source)?));
        expression.source_formula = source.to_string();
        Ok(expression)
    }

    /// Replaces the source text and rebuilds the tree from it, keeping the
    /// evaluation mode. On a parse failure nothing changes.
    pub fn edit_source(&mut self, source: &str) -> Result<()> {
        let root = parse_formula(source)?;
        self.expression_tree = ExpressionTree {
            root,
            mode: self.expression_tree.mode,
        };
        self.source_formula = source.to_string();
        Ok(())
    }

    pub fn with_named_constant(mut self, value: bool) -> Self {
        self.is_named_constant = value;
        self
    }

    pub fn with_reference_material_value(mut self, value: bool) -> Self {
        self.is_reference_material_value = value;
        self
    }

    pub fn with_parameter_value(mut self, value: bool) -> Self {
        self.is_parameter_value = value;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_formula(&self) -> &str {
        &self.source_formula
    }

    pub fn tree(&self) -> &ExpressionTree {
        &self.expression_tree
    }

    pub fn is_named_constant(&self) -> bool {
        self.is_named_constant
    }

    pub fn is_reference_material_value(&self) -> bool {
        self.is_reference_material_value
    }

    pub fn is_parameter_value(&self) -> bool {
        self.is_parameter_value
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    /// Named constants and parameter values are computed once for the task,
    /// without fraction data.
    pub fn is_task_wide(&self) -> bool {
        self.is_named_constant || self.is_parameter_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExpressionError;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn op(name: &str, children: Vec<Node>) -> Node {
        Node::operation(name, children).unwrap()
    }

    fn var(name: &str) -> Node {
        Node::variable(name)
    }

    #[test]
    fn arity_is_checked_at_construction() {
        let err = Node::operation("divide", vec![var("a")]).unwrap_err();
        assert!(matches!(
            err,
            ExpressionError::ArityMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
        assert!(matches!(
            Node::operation("frobnicate", vec![]),
            Err(ExpressionError::UnknownOperator(_))
        ));
    }

    #[test]
    fn parenthesizes_only_lower_precedence_children() {
        let sum = op("add", vec![var("a"), var("b")]);
        let product = op("multiply", vec![sum.clone(), var("c")]);
        assert_eq!(product.to_formula_string(), "(a + b) * c");

        let product = op("multiply", vec![var("a"), var("b")]);
        let sum = op("add", vec![product, var("c")]);
        assert_eq!(sum.to_formula_string(), "a * b + c");

        // Equal precedence is never wrapped.
        let inner = op("subtract", vec![var("b"), var("c")]);
        assert_eq!(op("subtract", vec![var("a"), inner]).to_formula_string(), "a - b - c");

        // Function arguments are already delimited.
        let ln = op("ln", vec![op("add", vec![var("a"), Node::constant(1.0)])]);
        assert_eq!(ln.to_formula_string(), "ln(a + 1)");
    }

    #[test]
    fn negation_and_negative_constants() {
        let neg_square = op("neg", vec![op("pow", vec![var("x"), Node::constant(2.0)])]);
        assert_eq!(neg_square.to_formula_string(), "-x ^ 2");
        let square_of_neg = op("pow", vec![op("neg", vec![var("x")]), Node::constant(2.0)]);
        assert_eq!(square_of_neg.to_formula_string(), "(-x) ^ 2");
        let negative_base = op("pow", vec![Node::constant(-3.0), Node::constant(2.0)]);
        assert_eq!(negative_base.to_formula_string(), "(-3) ^ 2");
    }

    #[test]
    fn bracketed_variable_names() {
        let ratio = op("divide", vec![var("206/238"), var("Pb206")]);
        assert_eq!(ratio.to_formula_string(), "[\"206/238\"] / Pb206");
    }

    #[test]
    fn mathml() {
        let tree = ExpressionTree::new(op("ln", vec![var("number")]));
        assert_eq!(
            tree.to_mathml(),
            "<math xmlns=\"http://www.w3.org/1998/Math/MathML\">\
             <mrow><mi>ln</mi><mfenced><mi>number</mi></mfenced></mrow></math>"
        );
        let wrapped = op("multiply", vec![op("add", vec![var("a"), var("b")]), var("c")]);
        assert_eq!(
            wrapped.to_mathml(),
            "<mrow><mfenced><mrow><mi>a</mi><mo>+</mo><mi>b</mi></mrow></mfenced>\
             <mo>&times;</mo><mi>c</mi></mrow>"
        );
    }

    #[test]
    fn references_in_first_occurrence_order() {
        let node = op(
            "add",
            vec![var("b"), op("multiply", vec![var("a"), var("b")])],
        );
        let names: Vec<_> = node.references().into_iter().collect();
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn editing_source_rebuilds_tree() {
        let mut expression = Expression::parse_summary("mean", "average(x)").unwrap();
        expression.edit_source("average(y)").unwrap();
        assert_eq!(expression.source_formula(), "average(y)");
        assert_eq!(expression.tree().mode(), EvaluationMode::Summary);
        assert!(expression.tree().references().contains("y"));

        assert!(expression.edit_source("average(").is_err());
        assert_eq!(expression.source_formula(), "average(y)");
    }

    #[test]
    fn programmatic_expression_renders_source() {
        let tree = ExpressionTree::new(op("divide", vec![var("num"), var("den")]));
        let expression = Expression::new("ratio", tree).with_notes("counts ratio");
        assert_eq!(expression.source_formula(), "num / den");
        assert_eq!(expression.notes(), "counts ratio");
        assert!(!expression.is_task_wide());
        assert!(expression.with_parameter_value(true).is_task_wide());
    }

    #[rstest]
    #[case("a - (b - c)")]
    #[case("a / (b * c)")]
    #[case("(a ^ b) ^ c")]
    #[case("a - b - c")]
    #[case("2 ^ 3 ^ 2")]
    #[case("-(a - b) * (c + d)")]
    fn generated_source_parses_back_to_the_same_tree(#[case] formula: &str) {
        let tree = ExpressionTree::new(parse_formula(formula).unwrap());
        let expression = Expression::new("generated", tree.clone());
        assert_eq!(expression.source_formula(), formula);
        assert_eq!(parse_formula(expression.source_formula()).unwrap(), *tree.root());
    }
}
