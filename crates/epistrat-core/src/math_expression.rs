//! # Formula Language for Time-Variant Functions
//!
//! Time-variant parameters may be written as formulas of the model time `t`,
//! e.g. `contact_rate * (1 + 0.2 * sin(2 * pi * t / 365))`. Formulas are parsed
//! once with evalexpr and converted to a small AST that is evaluated on every
//! derivative call.
//!
//! ## Special Variables
//!
//! - `t` - Model time
//! - `pi` - Mathematical constant π
//! - `e` - Mathematical constant e
//!
//! Any other identifier must name a constant model parameter.
//!
//! ## Supported Operators
//!
//! - Arithmetic: `+`, `-`, `*`, `/`, `%` (modulo), `^` or `**` (power)
//! - Comparison: `<`, `>`, `<=`, `>=`, `==`, `!=`
//! - Logical: `&&` (and), `||` (or), `!` (not)
//!
//! ## Supported Functions
//!
//! `sin`, `cos`, `tan`, `asin`, `acos`, `atan`, `atan2`, `sinh`, `cosh`, `tanh`,
//! `exp`, `ln`, `log` (natural), `log2`, `log10`, `pow`, `sqrt`, `cbrt`, `hypot`,
//! `abs`, `floor`, `ceil`, `round`, `min`, `max` and `if(cond, a, b)`.
//!
//! ## Example
//! ```rust
//! use epistrat_core::{MathExpression, MathExpressionContext};
//!
//! let expr = MathExpression::new("beta * (1 + sin(2 * pi * t / 365))").unwrap();
//! let mut context = MathExpressionContext::new();
//! context.set_parameter("beta", 0.3);
//! let value = expr.evaluate(&context, 91.25).unwrap();
//! assert!((value - 0.6).abs() < 1e-6);
//! ```

mod ast;
mod parser;

pub use ast::{BinaryOperator, Expr, MathFunction, UnaryOperator};

use evalexpr::{EvalexprError, Node, build_operator_tree};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub(crate) const SPECIAL_VAR_T: &str = "t";
pub(crate) const SPECIAL_VAR_PI: &str = "pi";
pub(crate) const SPECIAL_VAR_E: &str = "e";

/// Errors that can occur while parsing or evaluating a formula
#[derive(Debug, thiserror::Error)]
pub enum MathExpressionError {
    #[error("Parse error: {0}")]
    EvalError(#[from] EvalexprError),
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),
}

/// Named constants visible to formulas
#[derive(Debug, Clone, Default)]
pub struct MathExpressionContext {
    parameters: HashMap<String, f64>,
}

impl MathExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter value
    pub fn set_parameter(&mut self, name: impl Into<String>, value: f64) {
        self.parameters.insert(name.into(), value);
    }

    /// Set multiple parameters
    pub fn set_parameters(&mut self, parameters: impl IntoIterator<Item = (String, f64)>) {
        self.parameters.extend(parameters);
    }

    pub fn get_parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }
}

/// Preprocesses a formula by adding the `math::` prefix to functions that evalexpr
/// only exposes under that namespace, and converting `**` to `^`.
///
/// `min`, `max`, `floor`, `ceil`, `round` and `if` are evalexpr built-ins and are
/// left untouched.
fn preprocess_formula(formula: &str) -> String {
    // Longer names first so "asin" is handled before "sin"
    const MATH_FUNCTIONS: &[&str] = &[
        "asinh", "acosh", "atanh", "asin", "acos", "atan2", "atan", "sinh", "cosh", "tanh", "sin",
        "cos", "tan", "log10", "log2", "ln", "cbrt", "sqrt", "hypot", "exp", "abs", "pow",
    ];

    let mut result = formula.replace("**", "^");

    // evalexpr's math::log takes a base argument; a bare log(x) is the natural log
    result = replace_call(&result, "log(", "ln(");

    for func in MATH_FUNCTIONS {
        let pattern = format!("{}(", func);
        let replacement = format!("math::{}(", func);
        result = replace_call(&result, &pattern, &replacement);
    }

    result
}

/// Replace `pattern` where it starts a function call that is not already namespaced
fn replace_call(source: &str, pattern: &str, replacement: &str) -> String {
    let mut output = String::with_capacity(source.len());
    let mut remaining = source;

    while let Some(pos) = remaining.find(pattern) {
        let is_valid_boundary = remaining[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric() && c != '_' && c != ':');

        output.push_str(&remaining[..pos]);
        if is_valid_boundary {
            output.push_str(replacement);
        } else {
            output.push_str(pattern);
        }
        remaining = &remaining[pos + pattern.len()..];
    }
    output.push_str(remaining);
    output
}

fn collect_variables(node: &Node) -> BTreeSet<String> {
    node.iter_variable_identifiers()
        .filter(|ident| *ident != SPECIAL_VAR_T && *ident != SPECIAL_VAR_PI && *ident != SPECIAL_VAR_E)
        .map(str::to_string)
        .collect()
}

/// A parsed formula of the model time.
///
/// The formula is preprocessed and parsed once during construction.
#[derive(Debug, Clone, Serialize)]
pub struct MathExpression {
    /// The formula as written by the user
    pub formula: String,
    #[serde(skip)]
    expr: Expr,
    #[serde(skip)]
    variables: BTreeSet<String>,
}

impl<'de> Deserialize<'de> for MathExpression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct MathExpressionData {
            formula: String,
        }

        let data = MathExpressionData::deserialize(deserializer)?;
        MathExpression::new(data.formula).map_err(serde::de::Error::custom)
    }
}

impl MathExpression {
    /// Parse a formula
    pub fn new(formula: impl Into<String>) -> Result<Self, MathExpressionError> {
        let formula = formula.into();
        let preprocessed = preprocess_formula(&formula);
        let tree = build_operator_tree(&preprocessed)?;
        let expr = parser::convert_tree(&tree)?;
        let variables = collect_variables(&tree);
        Ok(Self {
            formula,
            expr,
            variables,
        })
    }

    /// Evaluate the formula at time `t`
    pub fn evaluate(
        &self,
        context: &MathExpressionContext,
        t: f64,
    ) -> Result<f64, MathExpressionError> {
        self.expr.evaluate(context, t)
    }

    /// Check that every identifier used by the formula is available in the context
    pub fn validate(&self, context: &MathExpressionContext) -> Result<(), MathExpressionError> {
        match self.variables.iter().find(|name| !context.contains(name)) {
            Some(missing) => Err(MathExpressionError::VariableNotFound(missing.clone())),
            None => Ok(()),
        }
    }

    /// Identifiers used by the formula, excluding the special variables
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(String::as_str)
    }

    pub fn ast(&self) -> &Expr {
        &self.expr
    }
}
