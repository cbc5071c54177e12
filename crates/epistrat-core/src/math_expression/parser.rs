//! Conversion from evalexpr's operator tree to [`Expr`]

use super::MathExpressionError;
use super::ast::{BinaryOperator, Expr, UnaryOperator};
use evalexpr::{Node, Operator, Value};

/// Convert a parsed evalexpr tree into an [`Expr`]
pub(super) fn convert_tree(tree: &Node) -> Result<Expr, MathExpressionError> {
    convert_node(tree)
}

fn binary(node: &Node, op: BinaryOperator) -> Result<Expr, MathExpressionError> {
    match node.children() {
        [left, right] => Ok(Expr::binary(op, convert_node(left)?, convert_node(right)?)),
        children => Err(MathExpressionError::InvalidExpression(format!(
            "{:?} requires exactly 2 operands, got {}",
            op,
            children.len()
        ))),
    }
}

fn unary(node: &Node, op: UnaryOperator) -> Result<Expr, MathExpressionError> {
    match node.children() {
        [operand] => Ok(Expr::unary(op, convert_node(operand)?)),
        children => Err(MathExpressionError::InvalidExpression(format!(
            "{:?} requires exactly 1 operand, got {}",
            op,
            children.len()
        ))),
    }
}

/// Function arguments arrive as `RootNode -> Tuple -> [args]` for several
/// arguments and as a single expression otherwise.
fn function_arguments(node: &Node) -> Result<Vec<Expr>, MathExpressionError> {
    match node.children() {
        [] => Ok(Vec::new()),
        [child] => {
            let inner = match (child.operator(), child.children()) {
                (Operator::RootNode, [grandchild]) => grandchild,
                _ => child,
            };
            if matches!(inner.operator(), Operator::Tuple) {
                inner.children().iter().map(convert_node).collect()
            } else {
                Ok(vec![convert_node(child)?])
            }
        }
        children => children.iter().map(convert_node).collect(),
    }
}

fn convert_node(node: &Node) -> Result<Expr, MathExpressionError> {
    match node.operator() {
        Operator::RootNode => match node.children() {
            [child] => convert_node(child),
            _ => Err(MathExpressionError::InvalidExpression(
                "Expression must contain exactly one term".to_string(),
            )),
        },

        Operator::Const { value } => match value {
            Value::Float(f) => Ok(Expr::Constant(*f)),
            Value::Int(i) => Ok(Expr::Constant(*i as f64)),
            Value::Boolean(b) => Ok(Expr::Constant(if *b { 1.0 } else { 0.0 })),
            _ => Err(MathExpressionError::InvalidExpression(
                "Unsupported constant type".to_string(),
            )),
        },

        Operator::VariableIdentifierRead { identifier } => Ok(Expr::Variable(identifier.clone())),

        Operator::Add => binary(node, BinaryOperator::Add),
        Operator::Sub => binary(node, BinaryOperator::Sub),
        Operator::Mul => binary(node, BinaryOperator::Mul),
        Operator::Div => binary(node, BinaryOperator::Div),
        Operator::Mod => binary(node, BinaryOperator::Mod),
        Operator::Exp => binary(node, BinaryOperator::Pow),
        Operator::Lt => binary(node, BinaryOperator::Lt),
        Operator::Gt => binary(node, BinaryOperator::Gt),
        Operator::Leq => binary(node, BinaryOperator::Le),
        Operator::Geq => binary(node, BinaryOperator::Ge),
        Operator::Eq => binary(node, BinaryOperator::Eq),
        Operator::Neq => binary(node, BinaryOperator::Ne),
        Operator::And => binary(node, BinaryOperator::And),
        Operator::Or => binary(node, BinaryOperator::Or),

        Operator::Neg => unary(node, UnaryOperator::Neg),
        Operator::Not => unary(node, UnaryOperator::Not),

        Operator::FunctionIdentifier { identifier } => {
            let mut args = function_arguments(node)?;
            if identifier == "if" {
                if args.len() != 3 {
                    return Err(MathExpressionError::InvalidExpression(format!(
                        "if requires exactly 3 arguments, got {}",
                        args.len()
                    )));
                }
                let else_branch = args.pop().unwrap_or_default();
                let then_branch = args.pop().unwrap_or_default();
                let condition = args.pop().unwrap_or_default();
                return Ok(Expr::if_then_else(condition, then_branch, else_branch));
            }
            Expr::call(identifier, args)
        }

        Operator::Tuple => match node.children() {
            [child] => convert_node(child),
            children => Err(MathExpressionError::InvalidExpression(format!(
                "Unexpected tuple with {} elements in expression",
                children.len()
            ))),
        },

        other => Err(MathExpressionError::InvalidExpression(format!(
            "Unsupported operator: {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(formula: &str) -> Expr {
        let tree = evalexpr::build_operator_tree(formula).unwrap();
        convert_tree(&tree).unwrap()
    }

    #[test]
    fn test_parse_constant() {
        assert!(matches!(parse("3.14"), Expr::Constant(_)));
    }

    #[test]
    fn test_parse_variable() {
        assert!(matches!(parse("beta"), Expr::Variable(_)));
    }

    #[test]
    fn test_parse_binary_op() {
        if let Expr::BinaryOp { op, .. } = parse("beta * t") {
            assert_eq!(op, BinaryOperator::Mul);
        } else {
            panic!("Expected BinaryOp");
        }
    }

    #[test]
    fn test_parse_multi_argument_function() {
        match parse("math::atan2(1, t)") {
            Expr::Call { args, .. } => assert_eq!(args.len(), 2),
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_if() {
        assert!(matches!(parse("if(t > 1, 2, 3)"), Expr::IfThenElse { .. }));
    }

    #[test]
    fn test_assignment_is_unsupported() {
        let tree = evalexpr::build_operator_tree("a = 1").unwrap();
        assert!(convert_tree(&tree).is_err());
    }
}
