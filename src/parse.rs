use indexmap::IndexSet;
use once_cell::sync::Lazy;
use pest::error::ErrorVariant;
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;

use crate::error::Result;
use crate::expression::Node;

#[derive(Parser)]
#[grammar = "grammar.pest"] // relative to project `src`
struct FormulaParser;

pub type ParseError = pest::error::Error<Rule>;

static PRATT_PARSER: Lazy<PrattParser<Rule>> = Lazy::new(|| {
    use Assoc::*;
    use Rule::*;

    PrattParser::new()
        .op(Op::infix(lt, Left)
            | Op::infix(le, Left)
            | Op::infix(gt, Left)
            | Op::infix(ge, Left)
            | Op::infix(eq, Left)
            | Op::infix(ne, Left))
        .op(Op::infix(add, Left) | Op::infix(subtract, Left))
        .op(Op::infix(multiply, Left) | Op::infix(divide, Left))
        .op(Op::prefix(neg))
        .op(Op::infix(power, Right))
});

/// Parses formula text such as `ln(["206/238"]) * 2` into a tree.
///
/// Function names are looked up in the operation catalog, so an unknown
/// function or a wrong number of arguments fails here rather than at
/// evaluation time.
pub fn parse_formula(input: &str) -> Result<Node> {
    let mut pairs = FormulaParser::parse(Rule::calculation, input)?;
    match pairs.next() {
        Some(expr) if expr.as_rule() == Rule::expr => climb(expr.into_inner()),
        _ => Err(custom_error(input, "expected an expression").into()),
    }
}

/// Every variable name in `input`, without building a tree.
pub fn parse_variable_names(input: &str) -> Result<IndexSet<String>> {
    Ok(FormulaParser::parse(Rule::calculation, input)?
        .flatten()
        .filter_map(|p| match p.as_rule() {
            Rule::variable | Rule::quoted_name => Some(p.as_str().to_string()),
            _ => None,
        })
        .collect())
}

fn custom_error(input: &str, message: &str) -> ParseError {
    ParseError::new_from_pos(
        ErrorVariant::CustomError {
            message: message.to_string(),
        },
        pest::Position::from_start(input),
    )
}

fn climb(pairs: Pairs<Rule>) -> Result<Node> {
    PRATT_PARSER
        .map_primary(primary)
        .map_prefix(|op: Pair<Rule>, operand: Result<Node>| match op.as_rule() {
            Rule::neg => Node::operation("neg", vec![operand?]),
            x => unreachable!("unexpected prefix operator {x:?}"),
        })
        .map_infix(|lhs: Result<Node>, op: Pair<Rule>, rhs: Result<Node>| {
            let name = match op.as_rule() {
                Rule::add => "add",
                Rule::subtract => "subtract",
                Rule::multiply => "multiply",
                Rule::divide => "divide",
                Rule::power => "pow",
                Rule::lt => "lt",
                Rule::le => "le",
                Rule::gt => "gt",
                Rule::ge => "ge",
                Rule::eq => "eq",
                Rule::ne => "ne",
                x => unreachable!("unexpected infix operator {x:?}"),
            };
            Node::operation(name, vec![lhs?, rhs?])
        })
        .parse(pairs)
}

fn primary(pair: Pair<Rule>) -> Result<Node> {
    match pair.as_rule() {
        Rule::expr => climb(pair.into_inner()),
        Rule::number => {
            let span = pair.as_span();
            let value = pair.as_str().parse::<f64>().map_err(|e| {
                ParseError::new_from_span(
                    ErrorVariant::CustomError {
                        message: format!("invalid number: {e}"),
                    },
                    span,
                )
            })?;
            Ok(Node::constant(value))
        }
        Rule::variable => Ok(Node::variable(pair.as_str())),
        Rule::quoted_variable => {
            let name = pair
                .into_inner()
                .flatten()
                .find(|p| p.as_rule() == Rule::quoted_name)
                .map_or("", |p| p.as_str());
            Ok(Node::variable(name))
        }
        Rule::function_call => {
            let mut inner = pair.into_inner();
            let name = inner.next().map_or("", |p| p.as_str());
            let arguments = inner
                .map(|arg| climb(arg.into_inner()))
                .collect::<Result<Vec<_>>>()?;
            Node::operation(name, arguments)
        }
        x => unreachable!("unexpected primary rule {x:?}"),
    }
}
