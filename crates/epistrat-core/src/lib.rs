//! Data model and leaf engines for stratified compartmental models.

pub mod error;
pub mod math_expression;
pub mod mixing;
pub mod names;
pub mod resolver;
pub mod time_variant;
pub mod types;

pub use error::{ConfigurationError, LookupError, ModelError, NumericalError, Result};
pub use math_expression::{MathExpression, MathExpressionContext, MathExpressionError};
pub use mixing::{
    ALL_POPULATION, ALL_STRAINS, DynamicMixing, InfectiousnessLevels, MixingEngine, MixingState,
    MixingStructure, matrix_from_rows,
};
pub use names::{Name, OVERWRITE_SUFFIX, SEPARATOR, StratumRef, validate_identifier};
pub use resolver::{
    ComposedParameter, DEFAULT_CACHE_CAPACITY, MortalityTable, ParamId, ParameterResolver,
};
pub use time_variant::{ScaleUp, TimeFunction, TimeVariant, TimeVariantDefinition, TimeVariantTable};
pub use types::compartments::CompartmentStore;
pub use types::flows::{Flow, FlowKind, FlowRegistry, FlowType};
pub use types::parameters::{
    CRUDE_BIRTH_RATE, ENTRY_FRACTION, ParameterTable, ParameterValue, UNIVERSAL_DEATH_RATE,
};
pub use types::stratification::{
    AGE_STRATIFICATION, ALL_RESTRICTION, AdjustmentRequest, ResolvedAdjustment,
    STRAIN_STRATIFICATION, Stratification, StratificationRegistry, StratificationRequest,
};
