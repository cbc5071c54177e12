//! Freezing a built model into index tables for repeated evaluation.
//!
//! `prepare_to_run` consumes the builder, so no further stratification can
//! happen once parameter functions, mixing categories and infectious pools have
//! been computed.

use crate::equilibration::{ChangeFlow, PreparedEquilibration};
use crate::model::{BirthApproach, CustomFlowFn, RunOptions, StratifiedModel};
use crate::outputs::DerivedOutputFn;
use epistrat_core::{
    CRUDE_BIRTH_RATE, ConfigurationError, FlowKind, MathExpressionContext, MixingEngine,
    ModelError, Name, ParamId, ParameterResolver, StratificationRegistry, StratumRef,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::{info, instrument};

/// How a transition's per-capita rate is scaled
#[derive(Clone)]
pub(crate) enum TransitionKind {
    Standard,
    Infection {
        force_index: usize,
        pool: usize,
        density: bool,
    },
    Custom(CustomFlowFn),
}

#[derive(Clone)]
pub(crate) struct PreparedTransition {
    pub kind: TransitionKind,
    pub parameter: ParamId,
    pub source: usize,
    pub target: usize,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PreparedDeath {
    pub parameter: ParamId,
    pub source: usize,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PreparedEntry {
    pub parameter: ParamId,
    pub target: usize,
}

/// A model ready to be integrated
pub struct PreparedModel {
    pub(crate) times: Vec<f64>,
    pub(crate) names: Vec<Name>,
    pub(crate) labels: Vec<String>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) initial_values: Vec<f64>,
    pub(crate) registry: StratificationRegistry,
    pub(crate) resolver: ParameterResolver,
    pub(crate) mixing: MixingEngine,
    pub(crate) transitions: Vec<PreparedTransition>,
    pub(crate) deaths: Vec<PreparedDeath>,
    pub(crate) entries: Vec<PreparedEntry>,
    /// Population-wide death rate, per compartment
    pub(crate) mortality: Vec<ParamId>,
    pub(crate) crude_birth_rate: ParamId,
    pub(crate) birth_approach: BirthApproach,
    pub(crate) equilibrations: Vec<PreparedEquilibration>,
    /// Output name and the transitions it sums
    pub(crate) output_connections: Vec<(String, Vec<usize>)>,
    /// Output name and the compartments whose deaths it sums
    pub(crate) death_outputs: Vec<(String, Vec<usize>)>,
    pub(crate) derived_outputs: IndexMap<String, DerivedOutputFn>,
    pub(crate) options: RunOptions,
}

impl StratifiedModel {
    fn tokens_to_strata(&self, tokens: &[String]) -> Result<Vec<StratumRef>, ConfigurationError> {
        tokens
            .iter()
            .map(|token| {
                self.registry
                    .find_token(token)
                    .ok_or_else(|| ConfigurationError::MalformedName(token.clone()))
            })
            .collect()
    }

    /// Compose every parameter function and index table the evaluator needs
    #[instrument(skip_all)]
    pub fn prepare_to_run(self) -> Result<PreparedModel, ModelError> {
        let names: Vec<Name> = self.compartments.names().to_vec();
        let labels: Vec<String> = names.iter().map(|name| name.render(&self.registry)).collect();
        let index: HashMap<String, usize> = labels
            .iter()
            .enumerate()
            .map(|(i, label)| (label.clone(), i))
            .collect();
        let position = |name: &Option<Name>| -> Result<usize, ConfigurationError> {
            let name = name
                .as_ref()
                .ok_or_else(|| ConfigurationError::UnknownCompartment("<none>".to_string()))?;
            self.compartments
                .index_of(name)
                .ok_or_else(|| ConfigurationError::UnknownCompartment(name.render(&self.registry)))
        };

        let mut context = MathExpressionContext::new();
        context.set_parameters(self.parameters.root_constants());
        let mut resolver = ParameterResolver::new(&self.time_variants, context, self.options.cache_capacity)?;

        let mixing = MixingEngine::new(
            &self.mixing,
            &names,
            &self.infectious_stems,
            &self.strains,
            &self.infectiousness,
            self.dynamic_mixing.clone(),
        );

        let mut transitions = Vec::new();
        let mut deaths = Vec::new();
        let mut entries = Vec::new();
        let mut change_flows: Vec<Vec<ChangeFlow>> = vec![Vec::new(); self.equilibrations.len()];
        for flow in self.active_flows() {
            match &flow.kind {
                FlowKind::Entry => entries.push(PreparedEntry {
                    parameter: resolver.register(&flow.parameter, &self.parameters)?,
                    target: position(&flow.target)?,
                }),
                FlowKind::CompartmentDeath => deaths.push(PreparedDeath {
                    parameter: resolver.register(&flow.parameter, &self.parameters)?,
                    source: position(&flow.source)?,
                }),
                FlowKind::StrataChange { equilibration } => {
                    let stratification = self
                        .equilibrations
                        .get(*equilibration)
                        .map(|target| target.stratification)
                        .ok_or_else(|| ConfigurationError::InvalidFlow {
                            flow: flow.parameter.to_string(),
                            reason: "unknown equilibration".to_string(),
                        })?;
                    let stratum = flow
                        .source
                        .as_ref()
                        .and_then(|source| source.stratum_of(stratification))
                        .ok_or_else(|| ConfigurationError::InvalidFlow {
                            flow: flow.parameter.to_string(),
                            reason: "source is not stratified".to_string(),
                        })?;
                    change_flows[*equilibration].push(ChangeFlow {
                        source: position(&flow.source)?,
                        target: position(&flow.target)?,
                        stratum,
                    });
                }
                FlowKind::Standard
                | FlowKind::InfectionFrequency
                | FlowKind::InfectionDensity
                | FlowKind::Custom { .. } => {
                    let kind = match &flow.kind {
                        FlowKind::InfectionFrequency | FlowKind::InfectionDensity => {
                            let source = flow.source.as_ref().ok_or_else(|| {
                                ConfigurationError::UnknownCompartment("<none>".to_string())
                            })?;
                            TransitionKind::Infection {
                                force_index: mixing.force_index(source)?,
                                pool: mixing.pool_index(flow.strain),
                                density: flow.kind == FlowKind::InfectionDensity,
                            }
                        }
                        FlowKind::Custom { function } => TransitionKind::Custom(
                            self.custom_functions
                                .get(function)
                                .cloned()
                                .ok_or_else(|| ConfigurationError::MissingCustomFunction(function.clone()))?,
                        ),
                        _ => TransitionKind::Standard,
                    };
                    transitions.push(PreparedTransition {
                        kind,
                        parameter: resolver.register(&flow.parameter, &self.parameters)?,
                        source: position(&flow.source)?,
                        target: position(&flow.target)?,
                    });
                }
            }
        }

        let mortality = names
            .iter()
            .map(|name| resolver.register_mortality(name, &self.mortality))
            .collect::<Result<Vec<_>, _>>()?;
        let crude_birth_rate = resolver.register(&Name::new(CRUDE_BIRTH_RATE), &self.parameters)?;

        let equilibrations = self
            .equilibrations
            .iter()
            .zip(change_flows)
            .map(|(target, flows)| {
                PreparedEquilibration::new(target, &names, flows, &self.registry, &mut resolver)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut output_connections = Vec::with_capacity(self.output_connections.len());
        for (output, connection) in &self.output_connections {
            let source_strata = self.tokens_to_strata(&connection.source_condition)?;
            let target_strata = self.tokens_to_strata(&connection.target_condition)?;
            let matching = transitions
                .iter()
                .enumerate()
                .filter(|(_, flow)| {
                    let (source, target) = (&names[flow.source], &names[flow.target]);
                    source.stem() == connection.source
                        && target.stem() == connection.target
                        && source.has_all(&source_strata)
                        && target.has_all(&target_strata)
                })
                .map(|(i, _)| i)
                .collect();
            output_connections.push((output.clone(), matching));
        }

        let mut death_outputs = vec![(crate::outputs::TOTAL_DEATHS.to_string(), (0..names.len()).collect())];
        for category in &self.death_output_categories {
            let strata = self.tokens_to_strata(category)?;
            let members = (0..names.len()).filter(|&i| names[i].has_all(&strata)).collect();
            death_outputs.push((crate::outputs::death_output_name(category), members));
        }

        info!(
            compartments = names.len(),
            transitions = transitions.len(),
            deaths = deaths.len(),
            entries = entries.len(),
            equilibrations = equilibrations.len(),
            parameters = resolver.len(),
            categories = mixing.category_count(),
            "prepared model"
        );

        Ok(PreparedModel {
            times: self.times,
            initial_values: self.compartments.values().to_vec(),
            names,
            labels,
            index,
            registry: self.registry,
            resolver,
            mixing,
            transitions,
            deaths,
            entries,
            mortality,
            crude_birth_rate,
            birth_approach: self.birth_approach,
            equilibrations,
            output_connections,
            death_outputs,
            derived_outputs: self.derived_outputs,
            options: self.options,
        })
    }
}

impl PreparedModel {
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Full textual compartment names in state-vector order
    pub fn compartment_names(&self) -> &[String] {
        &self.labels
    }

    pub fn compartment_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn initial_values(&self) -> &[f64] {
        &self.initial_values
    }

    pub fn registry(&self) -> &StratificationRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &ParameterResolver {
        &self.resolver
    }

    pub fn mixing(&self) -> &MixingEngine {
        &self.mixing
    }

    /// Value of a parameter used by some flow, by full textual name
    pub fn parameter_value(&self, name: &str, time: f64) -> Result<f64, ModelError> {
        let name = Name::parse(name, &self.registry)?;
        self.resolver.resolve_name(&name, time)
    }

    /// Population-wide death rate of one compartment at `time`
    pub fn mortality_rate(&self, compartment: &str, time: f64) -> Result<f64, ModelError> {
        let index = self
            .compartment_index(compartment)
            .ok_or_else(|| epistrat_core::LookupError::Compartment(compartment.to_string()))?;
        self.resolver.resolve(self.mortality[index], time)
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }
}
