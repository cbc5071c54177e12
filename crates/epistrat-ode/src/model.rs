//! Model construction: the mutable build phase before `prepare_to_run`.

use crate::equilibration::EquilibrationTarget;
use crate::outputs::DerivedOutputFn;
use epistrat_core::{
    CRUDE_BIRTH_RATE, CompartmentStore, ConfigurationError, DEFAULT_CACHE_CAPACITY, DynamicMixing,
    ENTRY_FRACTION, Flow, FlowKind, FlowRegistry, FlowType, InfectiousnessLevels, MixingStructure,
    ModelError, MortalityTable, Name, ParameterTable, ParameterValue, StratificationRegistry,
    StratumRef, TimeVariant, TimeVariantDefinition, TimeVariantTable, UNIVERSAL_DEATH_RATE,
    validate_identifier,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// How births enter the model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BirthApproach {
    #[default]
    #[serde(rename = "no_birth")]
    NoBirth,
    /// Births replace all deaths in the same evaluation
    #[serde(rename = "replace_deaths")]
    ReplaceDeaths,
    /// Births at `crude_birth_rate × N`
    #[serde(rename = "add_crude_birth_rate", alias = "add_crude")]
    AddCrudeBirthRate,
}

/// A flow as requested at build time, before any stratification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    pub parameter: String,
    #[serde(alias = "origin")]
    pub source: String,
    #[serde(default, alias = "to")]
    pub target: Option<String>,
    /// Registered custom function, for `customised_flows`
    #[serde(default)]
    pub function: Option<String>,
}

impl FlowRequest {
    fn new(flow_type: FlowType, parameter: &str, source: &str, target: Option<&str>) -> Self {
        Self {
            flow_type,
            parameter: parameter.to_string(),
            source: source.to_string(),
            target: target.map(str::to_string),
            function: None,
        }
    }

    pub fn standard(parameter: &str, source: &str, target: &str) -> Self {
        Self::new(FlowType::Standard, parameter, source, Some(target))
    }

    pub fn infection_frequency(parameter: &str, source: &str, target: &str) -> Self {
        Self::new(FlowType::InfectionFrequency, parameter, source, Some(target))
    }

    pub fn infection_density(parameter: &str, source: &str, target: &str) -> Self {
        Self::new(FlowType::InfectionDensity, parameter, source, Some(target))
    }

    pub fn death(parameter: &str, source: &str) -> Self {
        Self::new(FlowType::CompartmentDeath, parameter, source, None)
    }

    pub fn custom(parameter: &str, source: &str, target: &str, function: &str) -> Self {
        Self {
            function: Some(function.to_string()),
            ..Self::new(FlowType::Custom, parameter, source, Some(target))
        }
    }

    fn label(&self) -> String {
        match &self.target {
            Some(target) => format!("{} {} -> {}", self.parameter, self.source, target),
            None => format!("{} {} -> death", self.parameter, self.source),
        }
    }
}

/// A named tracker of the rate of transition flows between two stems
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputConnection {
    #[serde(alias = "origin")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
    /// Stratum tokens the source compartment must carry, e.g. `["age_0"]`
    #[serde(default)]
    pub source_condition: Vec<String>,
    #[serde(default)]
    pub target_condition: Vec<String>,
}

/// Options controlling a prepared model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Compartment values below `-negative_tolerance` are a numerical error
    pub negative_tolerance: f64,
    /// Bound on memoised `(parameter, time)` values; zero disables memoisation
    pub cache_capacity: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            negative_tolerance: 1e-6,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl RunOptions {
    pub fn with_negative_tolerance(mut self, tolerance: f64) -> Self {
        self.negative_tolerance = tolerance;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

fn default_infectious() -> Vec<String> {
    vec!["infectious".to_string()]
}

/// Everything needed to build an unstratified model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub times: Vec<f64>,
    pub compartments: Vec<String>,
    #[serde(default)]
    pub initial_conditions: IndexMap<String, f64>,
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterValue>,
    #[serde(default)]
    pub time_variants: IndexMap<String, TimeVariantDefinition>,
    #[serde(default)]
    pub flows: Vec<FlowRequest>,
    #[serde(default = "default_infectious")]
    pub infectious_compartments: Vec<String>,
    #[serde(default)]
    pub birth_approach: BirthApproach,
    pub entry_compartment: String,
    pub starting_population: f64,
    #[serde(default)]
    pub output_connections: IndexMap<String, OutputConnection>,
    #[serde(default)]
    pub death_output_categories: Vec<Vec<String>>,
    #[serde(default)]
    pub options: RunOptions,
}

impl ModelDefinition {
    pub fn new<S: Into<String>>(
        times: Vec<f64>,
        compartments: impl IntoIterator<Item = S>,
        entry_compartment: &str,
        starting_population: f64,
    ) -> Self {
        Self {
            times,
            compartments: compartments.into_iter().map(Into::into).collect(),
            initial_conditions: IndexMap::new(),
            parameters: IndexMap::new(),
            time_variants: IndexMap::new(),
            flows: Vec::new(),
            infectious_compartments: default_infectious(),
            birth_approach: BirthApproach::NoBirth,
            entry_compartment: entry_compartment.to_string(),
            starting_population,
            output_connections: IndexMap::new(),
            death_output_categories: Vec::new(),
            options: RunOptions::default(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_initial_condition(mut self, compartment: &str, value: f64) -> Self {
        self.initial_conditions.insert(compartment.to_string(), value);
        self
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn with_time_variant(mut self, name: &str, definition: TimeVariantDefinition) -> Self {
        self.time_variants.insert(name.to_string(), definition);
        self
    }

    pub fn with_flow(mut self, flow: FlowRequest) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn with_infectious_compartments<S: Into<String>>(mut self, stems: impl IntoIterator<Item = S>) -> Self {
        self.infectious_compartments = stems.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_birth_approach(mut self, approach: BirthApproach) -> Self {
        self.birth_approach = approach;
        self
    }

    pub fn with_output_connection(mut self, name: &str, connection: OutputConnection) -> Self {
        self.output_connections.insert(name.to_string(), connection);
        self
    }

    pub fn with_death_output_category<S: Into<String>>(mut self, tokens: impl IntoIterator<Item = S>) -> Self {
        self.death_output_categories
            .push(tokens.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

/// Read-only view of the state handed to custom flow functions
pub struct StateView<'a> {
    index: &'a HashMap<String, usize>,
    values: &'a [f64],
}

impl<'a> StateView<'a> {
    pub(crate) fn new(index: &'a HashMap<String, usize>, values: &'a [f64]) -> Self {
        Self { index, values }
    }

    /// Value of a compartment by its full name
    pub fn get(&self, compartment: &str) -> Option<f64> {
        self.index.get(compartment).map(|&i| self.values[i])
    }

    pub fn values(&self) -> &[f64] {
        self.values
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

/// Multiplier on a custom flow, from time and the current state
pub type CustomFlowFn = Arc<dyn Fn(f64, &StateView<'_>) -> f64 + Send + Sync>;

/// A model in its build phase; stratify it, then call `prepare_to_run`
pub struct StratifiedModel {
    pub(crate) times: Vec<f64>,
    pub(crate) stems: Vec<String>,
    pub(crate) compartments: CompartmentStore,
    pub(crate) flows: FlowRegistry,
    pub(crate) parameters: ParameterTable,
    pub(crate) time_variants: TimeVariantTable,
    pub(crate) registry: StratificationRegistry,
    pub(crate) mortality: MortalityTable,
    pub(crate) mixing: MixingStructure,
    pub(crate) infectiousness: InfectiousnessLevels,
    pub(crate) equilibrations: Vec<EquilibrationTarget>,
    pub(crate) strains: Vec<(String, StratumRef)>,
    pub(crate) infectious_stems: Vec<String>,
    pub(crate) birth_approach: BirthApproach,
    pub(crate) custom_functions: HashMap<String, CustomFlowFn>,
    pub(crate) output_connections: IndexMap<String, OutputConnection>,
    pub(crate) death_output_categories: Vec<Vec<String>>,
    pub(crate) derived_outputs: IndexMap<String, DerivedOutputFn>,
    pub(crate) dynamic_mixing: Option<DynamicMixing>,
    pub(crate) options: RunOptions,
}

impl StratifiedModel {
    /// Validate a definition and build the unstratified model
    pub fn new(definition: ModelDefinition) -> Result<Self, ModelError> {
        let ModelDefinition {
            times,
            compartments: stems,
            initial_conditions,
            parameters: parameter_values,
            time_variants: time_variant_definitions,
            flows: flow_requests,
            infectious_compartments,
            birth_approach,
            entry_compartment,
            starting_population,
            output_connections,
            death_output_categories,
            options,
        } = definition;

        if times.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigurationError::UnsortedTimes.into());
        }
        for stem in &stems {
            validate_identifier(stem)?;
        }
        let known_stem = |stem: &str| -> Result<(), ConfigurationError> {
            if stems.iter().any(|s| s == stem) {
                Ok(())
            } else {
                Err(ConfigurationError::UnknownCompartment(stem.to_string()))
            }
        };
        known_stem(&entry_compartment)?;
        for stem in &infectious_compartments {
            known_stem(stem)?;
        }

        let mut time_variants = TimeVariantTable::new();
        for (name, definition) in time_variant_definitions {
            time_variants.insert(name, TimeVariant::try_from(definition)?);
        }

        let mut parameters = ParameterTable::new();
        for (name, value) in parameter_values {
            validate_identifier(&name)?;
            if name == ENTRY_FRACTION {
                return Err(ConfigurationError::ReservedParameter(name).into());
            }
            parameters.insert(Name::new(name), value)?;
        }
        for default in [UNIVERSAL_DEATH_RATE, CRUDE_BIRTH_RATE] {
            if !parameters.contains(&Name::new(default)) {
                parameters.set(Name::new(default), ParameterValue::Constant(0.0));
            }
        }
        parameters.set(Name::new(ENTRY_FRACTION), ParameterValue::Constant(1.0));

        let requested: f64 = initial_conditions.values().sum();
        if requested > starting_population {
            return Err(ConfigurationError::InitialPopulationExceeded {
                requested,
                available: starting_population,
            }
            .into());
        }
        for stem in initial_conditions.keys() {
            known_stem(stem)?;
        }
        let mut compartments = CompartmentStore::new();
        for stem in &stems {
            let mut value = initial_conditions.get(stem).copied().unwrap_or(0.0);
            if *stem == entry_compartment {
                value += starting_population - requested;
            }
            compartments.add(Name::new(stem.clone()), value)?;
        }

        let mut flows = FlowRegistry::new();
        for request in flow_requests {
            known_stem(&request.source)?;
            if !parameters.contains(&Name::new(request.parameter.as_str())) {
                return Err(ConfigurationError::UnknownParameter(request.parameter).into());
            }
            let kind = match request.flow_type {
                FlowType::Standard => FlowKind::Standard,
                FlowType::InfectionFrequency => FlowKind::InfectionFrequency,
                FlowType::InfectionDensity => FlowKind::InfectionDensity,
                FlowType::CompartmentDeath => FlowKind::CompartmentDeath,
                FlowType::Custom => match &request.function {
                    Some(function) => FlowKind::Custom {
                        function: function.clone(),
                    },
                    None => {
                        return Err(ConfigurationError::InvalidFlow {
                            flow: request.label(),
                            reason: "custom flows need a function".to_string(),
                        }
                        .into());
                    }
                },
            };
            let parameter = Name::new(request.parameter.as_str());
            let source = Name::new(request.source.as_str());
            let flow = match (&kind, &request.target) {
                (FlowKind::CompartmentDeath, None) => Flow::death(parameter, source, 0),
                (FlowKind::CompartmentDeath, Some(_)) => {
                    return Err(ConfigurationError::InvalidFlow {
                        flow: request.label(),
                        reason: "death flows have no target".to_string(),
                    }
                    .into());
                }
                (_, Some(target)) => {
                    known_stem(target)?;
                    Flow::transition(kind.clone(), parameter, source, Name::new(target.as_str()), 0)
                }
                (_, None) => {
                    return Err(ConfigurationError::InvalidFlow {
                        flow: request.label(),
                        reason: "transition flows need a target".to_string(),
                    }
                    .into());
                }
            };
            flows.push(flow);
        }
        flows.push(Flow::entry(
            Name::new(ENTRY_FRACTION),
            Name::new(entry_compartment.as_str()),
            0,
        ));

        for connection in output_connections.values() {
            known_stem(&connection.source)?;
            known_stem(&connection.target)?;
        }

        let mortality_base = parameters
            .get(&Name::new(UNIVERSAL_DEATH_RATE))
            .cloned()
            .unwrap_or(ParameterValue::Constant(0.0));

        info!(
            compartments = compartments.len(),
            flows = flows.len(),
            parameters = parameters.len(),
            "built unstratified model"
        );

        Ok(Self {
            times,
            stems,
            compartments,
            flows,
            parameters,
            time_variants,
            registry: StratificationRegistry::default(),
            mortality: MortalityTable::new(mortality_base),
            mixing: MixingStructure::new(),
            infectiousness: InfectiousnessLevels::new(),
            equilibrations: Vec::new(),
            strains: Vec::new(),
            infectious_stems: infectious_compartments,
            birth_approach,
            custom_functions: HashMap::new(),
            output_connections,
            death_output_categories,
            derived_outputs: IndexMap::new(),
            dynamic_mixing: None,
            options,
        })
    }

    /// Build from a JSON [`ModelDefinition`]
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        Self::new(ModelDefinition::from_json(json)?)
    }

    /// Add or replace a named time-variant function
    pub fn add_time_variant(&mut self, name: &str, function: TimeVariant) {
        debug!(name, "registering time-variant function");
        self.time_variants.insert(name, function);
    }

    /// Register the function a custom flow refers to
    pub fn add_custom_flow_function(
        &mut self,
        name: &str,
        function: impl Fn(f64, &StateView<'_>) -> f64 + Send + Sync + 'static,
    ) {
        self.custom_functions.insert(name.to_string(), Arc::new(function));
    }

    /// Register a derived output, computed after integration in registration order
    pub fn add_derived_output(
        &mut self,
        name: &str,
        function: impl Fn(&crate::outputs::DerivedOutputContext<'_>, usize) -> Result<f64, ModelError>
        + Send
        + Sync
        + 'static,
    ) {
        self.derived_outputs.insert(name.to_string(), Arc::new(function));
    }

    /// Replace the combined mixing matrix with a function of time
    pub fn set_dynamic_mixing(
        &mut self,
        function: impl Fn(f64) -> ndarray::Array2<f64> + Send + Sync + 'static,
    ) {
        self.dynamic_mixing = Some(Arc::new(function));
    }

    /// Compartments carrying every token in `tokens` get infectiousness `value`,
    /// replacing any stratum-level multipliers
    pub fn add_infectiousness_override(&mut self, tokens: &[&str], value: f64) -> Result<(), ModelError> {
        let strata = tokens
            .iter()
            .map(|token| {
                self.registry
                    .find_token(token)
                    .ok_or_else(|| ConfigurationError::MalformedName(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.infectiousness.add_override(strata, value);
        Ok(())
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Full textual compartment names in model order
    pub fn compartment_names(&self) -> Vec<String> {
        self.compartments
            .names()
            .iter()
            .map(|name| name.render(&self.registry))
            .collect()
    }

    pub fn compartment_values(&self) -> &[f64] {
        self.compartments.values()
    }

    /// Current value of a compartment by its full textual name
    pub fn compartment_value(&self, name: &str) -> Option<f64> {
        let name = Name::parse(name, &self.registry).ok()?;
        self.compartments.value(&name)
    }

    pub fn compartments(&self) -> &CompartmentStore {
        &self.compartments
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    /// Flows that will be applied when the model runs
    pub fn active_flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.at_level(self.registry.len())
    }

    pub fn parameters(&self) -> &ParameterTable {
        &self.parameters
    }

    /// Parameter value by full textual name
    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        let name = Name::parse(name, &self.registry).ok()?;
        self.parameters.get(&name)
    }

    pub fn registry(&self) -> &StratificationRegistry {
        &self.registry
    }

    pub fn mixing(&self) -> &MixingStructure {
        &self.mixing
    }

    pub fn mortality(&self) -> &MortalityTable {
        &self.mortality
    }

    pub fn equilibrations(&self) -> &[EquilibrationTarget] {
        &self.equilibrations
    }

    pub fn render(&self, name: &Name) -> String {
        name.render(&self.registry)
    }

    pub fn is_stem(&self, stem: &str) -> bool {
        self.stems.iter().any(|s| s == stem)
    }
}
