//! AST for parsed formulas

use super::{MathExpressionContext, MathExpressionError, SPECIAL_VAR_E, SPECIAL_VAR_PI, SPECIAL_VAR_T};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Neg,
    Not,
}

/// Functions callable from formulas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFunction {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Exp,
    Ln,
    Log2,
    Log10,
    Pow,
    Sqrt,
    Cbrt,
    Hypot,
    Abs,
    Floor,
    Ceil,
    Round,
    Min,
    Max,
}

impl MathFunction {
    /// Resolve an evalexpr function identifier, with or without the `math::` namespace
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        let name = identifier.strip_prefix("math::").unwrap_or(identifier);
        let function = match name {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "asin" => Self::Asin,
            "acos" => Self::Acos,
            "atan" => Self::Atan,
            "atan2" => Self::Atan2,
            "sinh" => Self::Sinh,
            "cosh" => Self::Cosh,
            "tanh" => Self::Tanh,
            "asinh" => Self::Asinh,
            "acosh" => Self::Acosh,
            "atanh" => Self::Atanh,
            "exp" => Self::Exp,
            "ln" => Self::Ln,
            "log2" => Self::Log2,
            "log10" => Self::Log10,
            "pow" => Self::Pow,
            "sqrt" => Self::Sqrt,
            "cbrt" => Self::Cbrt,
            "hypot" => Self::Hypot,
            "abs" => Self::Abs,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "round" => Self::Round,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        };
        Some(function)
    }

    /// Expected argument count, `None` for variadic functions
    fn arity(self) -> Option<usize> {
        match self {
            Self::Atan2 | Self::Pow | Self::Hypot => Some(2),
            Self::Min | Self::Max => None,
            _ => Some(1),
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Self::Sin => args[0].sin(),
            Self::Cos => args[0].cos(),
            Self::Tan => args[0].tan(),
            Self::Asin => args[0].asin(),
            Self::Acos => args[0].acos(),
            Self::Atan => args[0].atan(),
            Self::Atan2 => args[0].atan2(args[1]),
            Self::Sinh => args[0].sinh(),
            Self::Cosh => args[0].cosh(),
            Self::Tanh => args[0].tanh(),
            Self::Asinh => args[0].asinh(),
            Self::Acosh => args[0].acosh(),
            Self::Atanh => args[0].atanh(),
            Self::Exp => args[0].exp(),
            Self::Ln => args[0].ln(),
            Self::Log2 => args[0].log2(),
            Self::Log10 => args[0].log10(),
            Self::Pow => args[0].powf(args[1]),
            Self::Sqrt => args[0].sqrt(),
            Self::Cbrt => args[0].cbrt(),
            Self::Hypot => args[0].hypot(args[1]),
            Self::Abs => args[0].abs(),
            Self::Floor => args[0].floor(),
            Self::Ceil => args[0].ceil(),
            Self::Round => args[0].round(),
            Self::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(f64),
    Variable(String),
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expr>,
    },
    BinaryOp {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: MathFunction,
        args: Vec<Expr>,
    },
    IfThenElse {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
}

impl Default for Expr {
    fn default() -> Self {
        Expr::Constant(0.0)
    }
}

fn truthy(value: f64) -> bool {
    value != 0.0
}

fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

impl Expr {
    pub fn binary(op: BinaryOperator, left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOperator, operand: Expr) -> Self {
        Expr::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn if_then_else(condition: Expr, then_branch: Expr, else_branch: Expr) -> Self {
        Expr::IfThenElse {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        }
    }

    /// Build a call node, checking the function name and argument count
    pub fn call(identifier: &str, args: Vec<Expr>) -> Result<Self, MathExpressionError> {
        let function = MathFunction::from_identifier(identifier)
            .ok_or_else(|| MathExpressionError::UnknownFunction(identifier.to_string()))?;
        let valid = match function.arity() {
            Some(expected) => args.len() == expected,
            None => !args.is_empty(),
        };
        if !valid {
            return Err(MathExpressionError::InvalidExpression(format!(
                "{} called with {} arguments",
                identifier,
                args.len()
            )));
        }
        Ok(Expr::Call { function, args })
    }

    pub fn evaluate(&self, context: &MathExpressionContext, t: f64) -> Result<f64, MathExpressionError> {
        match self {
            Expr::Constant(value) => Ok(*value),
            Expr::Variable(name) => match name.as_str() {
                SPECIAL_VAR_T => Ok(t),
                SPECIAL_VAR_PI => Ok(std::f64::consts::PI),
                SPECIAL_VAR_E => Ok(std::f64::consts::E),
                _ => context
                    .get_parameter(name)
                    .ok_or_else(|| MathExpressionError::VariableNotFound(name.clone())),
            },
            Expr::UnaryOp { op, operand } => {
                let value = operand.evaluate(context, t)?;
                Ok(match op {
                    UnaryOperator::Neg => -value,
                    UnaryOperator::Not => flag(!truthy(value)),
                })
            }
            Expr::BinaryOp { op, left, right } => {
                let a = left.evaluate(context, t)?;
                let b = right.evaluate(context, t)?;
                Ok(match op {
                    BinaryOperator::Add => a + b,
                    BinaryOperator::Sub => a - b,
                    BinaryOperator::Mul => a * b,
                    BinaryOperator::Div => a / b,
                    BinaryOperator::Mod => a % b,
                    BinaryOperator::Pow => a.powf(b),
                    BinaryOperator::Lt => flag(a < b),
                    BinaryOperator::Gt => flag(a > b),
                    BinaryOperator::Le => flag(a <= b),
                    BinaryOperator::Ge => flag(a >= b),
                    BinaryOperator::Eq => flag(a == b),
                    BinaryOperator::Ne => flag(a != b),
                    BinaryOperator::And => flag(truthy(a) && truthy(b)),
                    BinaryOperator::Or => flag(truthy(a) || truthy(b)),
                })
            }
            Expr::Call { function, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.evaluate(context, t))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(function.apply(&values))
            }
            Expr::IfThenElse {
                condition,
                then_branch,
                else_branch,
            } => {
                if truthy(condition.evaluate(context, t)?) {
                    then_branch.evaluate(context, t)
                } else {
                    else_branch.evaluate(context, t)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_function_is_rejected() {
        assert!(matches!(
            Expr::call("frobnicate", vec![Expr::Constant(1.0)]),
            Err(MathExpressionError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_arity_is_checked() {
        assert!(Expr::call("math::sin", vec![]).is_err());
        assert!(Expr::call("math::atan2", vec![Expr::Constant(1.0)]).is_err());
        assert!(Expr::call("max", vec![Expr::Constant(1.0)]).is_ok());
    }

    #[test]
    fn test_if_only_evaluates_taken_branch() {
        let expr = Expr::if_then_else(
            Expr::Constant(1.0),
            Expr::Constant(2.0),
            Expr::Variable("missing".to_string()),
        );
        let context = MathExpressionContext::new();
        assert_eq!(expr.evaluate(&context, 0.0).unwrap(), 2.0);
    }
}
