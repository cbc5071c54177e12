//! Functions of time that parameter values can refer to by name.

use crate::error::ConfigurationError;
use crate::math_expression::{MathExpression, MathExpressionContext, MathExpressionError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type TimeFunction = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Piecewise-linear interpolation through `(time, value)` breakpoints, held flat
/// outside the breakpoint range
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScaleUpData")]
pub struct ScaleUp {
    times: Vec<f64>,
    values: Vec<f64>,
}

#[derive(Deserialize)]
struct ScaleUpData {
    times: Vec<f64>,
    values: Vec<f64>,
}

impl TryFrom<ScaleUpData> for ScaleUp {
    type Error = ConfigurationError;

    fn try_from(data: ScaleUpData) -> Result<Self, Self::Error> {
        ScaleUp::new(data.times, data.values)
    }
}

impl ScaleUp {
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Result<Self, ConfigurationError> {
        if times.is_empty() || times.len() != values.len() {
            return Err(ConfigurationError::InvalidScaleUp(format!(
                "need matching non-empty breakpoints, got {} times and {} values",
                times.len(),
                values.len()
            )));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ConfigurationError::InvalidScaleUp(
                "breakpoint times must be strictly increasing".to_string(),
            ));
        }
        Ok(Self { times, values })
    }

    pub fn evaluate(&self, t: f64) -> f64 {
        let last = self.times.len() - 1;
        if t <= self.times[0] {
            return self.values[0];
        }
        if t >= self.times[last] {
            return self.values[last];
        }
        // First breakpoint strictly after t; t lies in [times[upper-1], times[upper])
        let upper = self.times.partition_point(|&x| x <= t);
        let (t0, t1) = (self.times[upper - 1], self.times[upper]);
        let (v0, v1) = (self.values[upper - 1], self.values[upper]);
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }
}

/// A function of time
#[derive(Clone)]
pub enum TimeVariant {
    Formula(MathExpression),
    Function(TimeFunction),
    ScaleUp(ScaleUp),
}

impl fmt::Debug for TimeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Formula(expr) => f.debug_tuple("Formula").field(&expr.formula).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
            Self::ScaleUp(scale_up) => f.debug_tuple("ScaleUp").field(scale_up).finish(),
        }
    }
}

impl TimeVariant {
    pub fn formula(formula: &str) -> Result<Self, MathExpressionError> {
        Ok(Self::Formula(MathExpression::new(formula)?))
    }

    pub fn function(f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Self::Function(Arc::new(f))
    }

    pub fn evaluate(&self, context: &MathExpressionContext, t: f64) -> Result<f64, MathExpressionError> {
        match self {
            Self::Formula(expr) => expr.evaluate(context, t),
            Self::Function(f) => Ok(f(t)),
            Self::ScaleUp(scale_up) => Ok(scale_up.evaluate(t)),
        }
    }

    /// Check the formula only refers to known constants
    pub fn validate(&self, context: &MathExpressionContext) -> Result<(), MathExpressionError> {
        match self {
            Self::Formula(expr) => expr.validate(context),
            Self::Function(_) | Self::ScaleUp(_) => Ok(()),
        }
    }
}

/// Declarative time-variant definitions for JSON model files
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeVariantDefinition {
    Formula(String),
    ScaleUp(ScaleUp),
}

impl TryFrom<TimeVariantDefinition> for TimeVariant {
    type Error = MathExpressionError;

    fn try_from(definition: TimeVariantDefinition) -> Result<Self, Self::Error> {
        match definition {
            TimeVariantDefinition::Formula(formula) => TimeVariant::formula(&formula),
            TimeVariantDefinition::ScaleUp(scale_up) => Ok(TimeVariant::ScaleUp(scale_up)),
        }
    }
}

/// Named time-variant functions
#[derive(Clone, Debug, Default)]
pub struct TimeVariantTable {
    entries: IndexMap<String, TimeVariant>,
}

impl TimeVariantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a function
    pub fn insert(&mut self, name: impl Into<String>, function: TimeVariant) {
        self.entries.insert(name.into(), function);
    }

    pub fn get(&self, name: &str) -> Option<&TimeVariant> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.get_index_of(name)
    }

    pub fn get_index(&self, index: usize) -> Option<(&String, &TimeVariant)> {
        self.entries.get_index(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TimeVariant)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_up_interpolates_and_holds() {
        let scale_up = ScaleUp::new(vec![0.0, 10.0, 20.0], vec![0.0, 1.0, 0.5]).unwrap();
        assert_eq!(scale_up.evaluate(-5.0), 0.0);
        assert!((scale_up.evaluate(5.0) - 0.5).abs() < 1e-12);
        assert_eq!(scale_up.evaluate(10.0), 1.0);
        assert!((scale_up.evaluate(15.0) - 0.75).abs() < 1e-12);
        assert_eq!(scale_up.evaluate(30.0), 0.5);
    }

    #[test]
    fn test_scale_up_rejects_bad_breakpoints() {
        assert!(ScaleUp::new(vec![0.0, 1.0], vec![1.0]).is_err());
        assert!(ScaleUp::new(vec![1.0, 0.0], vec![1.0, 2.0]).is_err());
        assert!(ScaleUp::new(vec![], vec![]).is_err());
    }

    #[test]
    fn test_definition_from_json() {
        let definition: TimeVariantDefinition =
            serde_json::from_str(r#"{"scale_up": {"times": [0, 1], "values": [2, 4]}}"#).unwrap();
        let variant = TimeVariant::try_from(definition).unwrap();
        let context = MathExpressionContext::new();
        assert!((variant.evaluate(&context, 0.5).unwrap() - 3.0).abs() < 1e-12);

        let definition: TimeVariantDefinition =
            serde_json::from_str(r#"{"formula": "2 * t"}"#).unwrap();
        let variant = TimeVariant::try_from(definition).unwrap();
        assert!((variant.evaluate(&context, 1.5).unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_closure_variant() {
        let variant = TimeVariant::function(|t| t * t);
        let context = MathExpressionContext::new();
        assert_eq!(variant.evaluate(&context, 3.0).unwrap(), 9.0);
        assert!(variant.validate(&context).is_ok());
    }
}
