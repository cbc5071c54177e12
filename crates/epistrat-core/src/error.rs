//! Error types shared by every stage of model construction and evaluation

use crate::math_expression::MathExpressionError;

/// Fatal problems detected while building, stratifying or preparing a model
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid identifier '{0}': must be non-empty and must not contain 'X'")]
    InvalidIdentifier(String),
    #[error("stratification '{0}' has already been applied")]
    DuplicateStratification(String),
    #[error("stratification '{0}' has no strata")]
    EmptyStrata(String),
    #[error("stratum '{stratum}' is listed twice in stratification '{stratification}'")]
    DuplicateStratum {
        stratification: String,
        stratum: String,
    },
    #[error("stratum '{stratum}' is not part of stratification '{stratification}'")]
    UnknownStratum {
        stratification: String,
        stratum: String,
    },
    #[error("unknown stratification '{0}'")]
    UnknownStratification(String),
    #[error("unknown compartment '{0}'")]
    UnknownCompartment(String),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("unknown time-variant function '{0}'")]
    UnknownTimeVariant(String),
    #[error("name '{0}' is not a valid stratified name")]
    MalformedName(String),
    #[error("parameter '{0}' is defined twice")]
    DuplicateParameter(String),
    #[error("parameter name '{0}' is reserved")]
    ReservedParameter(String),
    #[error("compartment '{0}' is defined twice")]
    DuplicateCompartment(String),
    #[error("invalid proportions for stratification '{stratification}': {reason}")]
    InvalidProportions {
        stratification: String,
        reason: String,
    },
    #[error("invalid age strata: {0}")]
    InvalidAgeStrata(String),
    #[error("universal death rate adjustments require a full stratification, '{0}' is partial")]
    PartialUniversalDeath(String),
    #[error("mixing matrix for '{stratification}' must be {expected}x{expected}, got {rows}x{cols}")]
    MixingMatrixShape {
        stratification: String,
        expected: usize,
        rows: usize,
        cols: usize,
    },
    #[error("mixing matrix for '{0}' requires a full stratification")]
    PartialMixing(String),
    #[error("infection flow from '{compartment}' matches {matches} mixing categories")]
    MixingCategory { compartment: String, matches: usize },
    #[error("flow '{flow}' is invalid: {reason}")]
    InvalidFlow { flow: String, reason: String },
    #[error("custom flow function '{0}' has not been registered")]
    MissingCustomFunction(String),
    #[error("requested times must be sorted in increasing order")]
    UnsortedTimes,
    #[error("initial conditions sum to {requested}, exceeding the starting population {available}")]
    InitialPopulationExceeded { requested: f64, available: f64 },
    #[error("invalid target proportions for '{stratification}': {reason}")]
    InvalidTargetProportions {
        stratification: String,
        reason: String,
    },
    #[error("invalid adjustment for '{parameter}': {reason}")]
    InvalidAdjustment { parameter: String, reason: String },
    #[error("dynamic mixing matrix must be {expected}x{expected}, got {rows}x{cols}")]
    DynamicMixingShape {
        expected: usize,
        rows: usize,
        cols: usize,
    },
    #[error("invalid scale-up function: {0}")]
    InvalidScaleUp(String),
    #[error("invalid model definition: {0}")]
    Definition(#[from] serde_json::Error),
    #[error("invalid solver configuration: {0}")]
    Solver(String),
}

/// Failures while evaluating derivatives or integrating
#[derive(Debug, thiserror::Error)]
pub enum NumericalError {
    #[error("compartment '{compartment}' is negative ({value}) at time {time}")]
    NegativeCompartment {
        time: f64,
        compartment: String,
        value: f64,
    },
    #[error("mixing category {category} has zero population but non-zero infectious population at time {time}")]
    ZeroMixingDenominator { time: f64, category: usize },
    #[error("target proportions for '{stratification}' are invalid at time {time}: {reason}")]
    InvalidTargetProportions {
        time: f64,
        stratification: String,
        reason: String,
    },
    #[error("equilibration flow into '{compartment}' is not finite at time {time}")]
    NonFiniteEquilibration { time: f64, compartment: String },
    #[error("derivative of '{compartment}' is not finite at time {time}")]
    NonFiniteDerivative { time: f64, compartment: String },
    #[error("step size underflow at time {time}")]
    StepSizeUnderflow { time: f64 },
    #[error("exceeded {max_steps} steps before reaching time {time}")]
    StepBudgetExceeded { time: f64, max_steps: usize },
}

/// Queries against results that name something that does not exist
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("no compartment named '{0}'")]
    Compartment(String),
    #[error("no derived output named '{0}'")]
    DerivedOutput(String),
    #[error("no parameter named '{0}'")]
    Parameter(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("numerical error: {0}")]
    Numerical(#[from] NumericalError),
    #[error("lookup error: {0}")]
    Lookup(#[from] LookupError),
    #[error("expression error: {0}")]
    Expression(#[from] MathExpressionError),
}

pub type Result<T, E = ModelError> = std::result::Result<T, E>;
