//! Shapes presented to an external marshaller.
//!
//! [`Expression`](crate::Expression) and [`ExpressionTree`](crate::ExpressionTree)
//! derive their serde impls directly; nodes go through [`NodeRepr`] so that an
//! operation is persisted by operator name and re-validated against the
//! catalog on the way back in.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ExpressionError, Result};
use crate::expression::Node;
use crate::operation::Operator;

/// Persisted form of a [`Node`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeRepr {
    Constant { value: f64 },
    Variable { name: String },
    Operation { operator: String, children: Vec<NodeRepr> },
}

impl From<Node> for NodeRepr {
    fn from(node: Node) -> Self {
        match node {
            Node::Constant(value) => Self::Constant { value },
            Node::Variable(name) => Self::Variable { name },
            Node::Operation(op) => Self::Operation {
                operator: op.operator().name.to_string(),
                children: op.children().iter().cloned().map(Self::from).collect(),
            },
        }
    }
}

impl TryFrom<NodeRepr> for Node {
    type Error = ExpressionError;

    fn try_from(repr: NodeRepr) -> Result<Self> {
        match repr {
            NodeRepr::Constant { value } => Ok(Node::Constant(value)),
            NodeRepr::Variable { name } => Ok(Node::Variable(name)),
            NodeRepr::Operation { operator, children } => {
                let children = children
                    .into_iter()
                    .map(Node::try_from)
                    .collect::<Result<Vec<_>>>()?;
                Node::operation(&operator, children)
            }
        }
    }
}

/// What an operator exposes for persistence and display.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorDescriptor {
    pub name: &'static str,
    pub argument_count: usize,
    pub row_count: usize,
    pub col_count: usize,
    pub labels_for_output_values: &'static [&'static [&'static str]],
    pub labels_for_input_values: &'static [&'static str],
    pub definition: &'static str,
}

impl Operator {
    pub fn descriptor(&self) -> OperatorDescriptor {
        OperatorDescriptor {
            name: self.name,
            argument_count: self.argument_count,
            row_count: self.row_count,
            col_count: self.col_count,
            labels_for_output_values: self.labels_for_output_values,
            labels_for_input_values: self.labels_for_input_values,
            definition: self.definition,
        }
    }
}

impl fmt::Display for OperatorDescriptor {
    /// `ln(number) -> [1 x 1] natLog: Returns the natural logarithm of a number`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outputs: Vec<String> = self
            .labels_for_output_values
            .iter()
            .map(|row| row.join(", "))
            .collect();
        write!(
            f,
            "{}({}) -> [{} x {}] {}: {}",
            self.name,
            self.labels_for_input_values.join(", "),
            self.row_count,
            self.col_count,
            outputs.join("; "),
            self.definition
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{EvaluationMode, Expression, ExpressionTree};
    use crate::operation::require;
    use pretty_assertions::assert_eq;

    #[test]
    fn expression_fields_in_contract_order() {
        let expression = Expression::parse("ratio", "num / den")
            .unwrap()
            .with_named_constant(true)
            .with_notes("note");
        let json = serde_json::to_string(&expression).unwrap();
        let keys = [
            "\"name\"",
            "\"sourceFormula\"",
            "\"isNamedConstant\"",
            "\"isReferenceMaterialValue\"",
            "\"isParameterValue\"",
            "\"expressionTree\"",
            "\"notes\"",
        ];
        let positions: Vec<usize> = keys.iter().map(|k| json.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{json}");

        let back: Expression = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expression);
    }

    #[test]
    fn legacy_flags_default_to_false() {
        let json = r#"{
            "name": "old",
            "sourceFormula": "ln(number)",
            "isNamedConstant": true,
            "expressionTree": {
                "root": {"operation": {"operator": "ln", "children": [{"variable": {"name": "number"}}]}}
            },
            "notes": ""
        }"#;
        let expression: Expression = serde_json::from_str(json).unwrap();
        assert!(!expression.is_reference_material_value());
        assert!(!expression.is_parameter_value());
        assert!(expression.is_named_constant());
        assert_eq!(expression.tree().mode(), EvaluationMode::PerFraction);
        assert_eq!(expression.tree().to_formula_string(), "ln(number)");
    }

    #[test]
    fn only_one_legacy_flag_present() {
        let json = r#"{
            "name": "partial",
            "sourceFormula": "1",
            "isNamedConstant": false,
            "isParameterValue": true,
            "expressionTree": {"root": {"constant": {"value": 1.0}}, "mode": "summary"},
            "notes": "n"
        }"#;
        let expression: Expression = serde_json::from_str(json).unwrap();
        assert!(!expression.is_reference_material_value());
        assert!(expression.is_parameter_value());
        assert_eq!(expression.tree().mode(), EvaluationMode::Summary);
    }

    #[test]
    fn persisted_operations_are_validated() {
        let unknown = r#"{"operation": {"operator": "nope", "children": []}}"#;
        let err = serde_json::from_str::<Node>(unknown).unwrap_err();
        assert!(err.to_string().contains("unknown operator `nope`"), "{err}");

        let wrong_arity = r#"{"operation": {"operator": "ln", "children": []}}"#;
        let err = serde_json::from_str::<Node>(wrong_arity).unwrap_err();
        assert!(err.to_string().contains("expects 1 argument(s) but got 0"), "{err}");
    }

    #[test]
    fn tree_survives_persistence() {
        let tree = ExpressionTree::summary(
            Node::operation(
                "wtdav",
                vec![Node::variable("206/238"), Node::constant(0.5)],
            )
            .unwrap(),
        );
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["mode"], "summary");
        assert_eq!(json["root"]["operation"]["operator"], "wtdav");
        let back: ExpressionTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn operator_descriptor() {
        let descriptor = require("wtdav").unwrap().descriptor();
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["argumentCount"], 2);
        assert_eq!(json["rowCount"], 1);
        assert_eq!(json["colCount"], 3);
        assert_eq!(json["labelsForOutputValues"][0][2], "mswd");
        assert_eq!(json["labelsForInputValues"][1], "oneSigmaAbsUnct");

        assert_eq!(
            require("ln").unwrap().descriptor().to_string(),
            "ln(number) -> [1 x 1] natLog: Returns the natural logarithm of a number"
        );
    }
}
