//! Stratified compartmental ODE models.
//!
//! Build a [`StratifiedModel`], apply any number of stratifications with
//! [`StratifiedModel::stratify`], freeze it with
//! [`StratifiedModel::prepare_to_run`] and integrate the resulting
//! [`PreparedModel`].

mod derivative;
pub mod equilibration;
pub mod model;
pub mod outputs;
pub mod prepared;
pub mod solver;
mod stratify;

pub use equilibration::{EQUILIBRATION_PARAMETER, EquilibrationTarget, STRATA_EQUILIBRATION_FACTOR};
pub use model::{
    BirthApproach, CustomFlowFn, FlowRequest, ModelDefinition, OutputConnection, RunOptions,
    StateView, StratifiedModel,
};
pub use outputs::{DerivedOutputContext, DerivedOutputFn, ModelResults, TOTAL_DEATHS, death_output_name};
pub use prepared::PreparedModel;
pub use solver::{
    DormandPrince, DormandPrinceConfig, Integrator, OdeSystem, RungeKutta4, RungeKutta4Config,
};

pub use epistrat_core::{
    AdjustmentRequest, ConfigurationError, LookupError, ModelError, Name, NumericalError,
    ParameterValue, ScaleUp, StratificationRequest, TimeVariant, TimeVariantDefinition,
};
