//! Running a prepared model and reading back its time series.

use crate::prepared::PreparedModel;
use crate::solver::{DormandPrince, Integrator};
use epistrat_core::{LookupError, ModelError};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// Name of the death output covering every compartment
pub const TOTAL_DEATHS: &str = "total_deaths";

/// `total_deathsX<token>X<token>...` for a category of strata tokens
pub fn death_output_name(category: &[String]) -> String {
    let mut name = TOTAL_DEATHS.to_string();
    for token in category {
        name.push(epistrat_core::SEPARATOR);
        name.push_str(token);
    }
    name
}

/// A derived output, evaluated at each output time index
pub type DerivedOutputFn =
    Arc<dyn Fn(&DerivedOutputContext<'_>, usize) -> Result<f64, ModelError> + Send + Sync>;

/// What a derived output function can see: the solved trajectory and every
/// output computed before it
pub struct DerivedOutputContext<'a> {
    times: &'a [f64],
    index: &'a HashMap<String, usize>,
    values: &'a [Vec<f64>],
    derived: &'a IndexMap<String, Vec<f64>>,
}

impl<'a> DerivedOutputContext<'a> {
    pub fn times(&self) -> &[f64] {
        self.times
    }

    /// Compartment value at output index `step`
    pub fn compartment(&self, name: &str, step: usize) -> Result<f64, ModelError> {
        let index = self
            .index
            .get(name)
            .ok_or_else(|| LookupError::Compartment(name.to_string()))?;
        Ok(self.values[step][*index])
    }

    /// Full state at output index `step`
    pub fn state(&self, step: usize) -> &[f64] {
        &self.values[step]
    }

    /// Sum of the compartments whose names satisfy `predicate`
    pub fn sum_compartments(&self, step: usize, predicate: impl Fn(&str) -> bool) -> f64 {
        self.index
            .iter()
            .filter(|(name, _)| predicate(name))
            .map(|(_, &i)| self.values[step][i])
            .sum()
    }

    /// Value of an earlier output at index `step`
    pub fn derived(&self, name: &str, step: usize) -> Result<f64, ModelError> {
        let series = self
            .derived
            .get(name)
            .ok_or_else(|| LookupError::DerivedOutput(name.to_string()))?;
        Ok(series[step])
    }
}

/// Compartment and derived-output series of one run, indexed by the requested times
#[derive(Debug, Clone, Serialize)]
pub struct ModelResults {
    times: Vec<f64>,
    compartments: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    /// State vector per output time
    values: Vec<Vec<f64>>,
    derived_outputs: IndexMap<String, Vec<f64>>,
}

impl ModelResults {
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn compartment_names(&self) -> &[String] {
        &self.compartments
    }

    /// State vector per output time
    pub fn outputs(&self) -> &[Vec<f64>] {
        &self.values
    }

    pub fn compartment_series(&self, name: &str) -> Result<Vec<f64>, ModelError> {
        let index = self
            .index
            .get(name)
            .copied()
            .ok_or_else(|| LookupError::Compartment(name.to_string()))?;
        Ok(self.values.iter().map(|state| state[index]).collect())
    }

    pub fn derived_output_series(&self, name: &str) -> Result<&[f64], ModelError> {
        self.derived_outputs
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| LookupError::DerivedOutput(name.to_string()).into())
    }

    pub fn derived_output_names(&self) -> impl Iterator<Item = &str> {
        self.derived_outputs.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl PreparedModel {
    fn compute_outputs(&self, values: &[Vec<f64>]) -> Result<IndexMap<String, Vec<f64>>, ModelError> {
        let mut derived: IndexMap<String, Vec<f64>> = IndexMap::new();
        for (name, _) in &self.output_connections {
            derived.insert(name.clone(), Vec::with_capacity(values.len()));
        }
        for (name, _) in &self.death_outputs {
            derived.insert(name.clone(), Vec::with_capacity(values.len()));
        }

        for (state, &time) in values.iter().zip(&self.times) {
            if !self.output_connections.is_empty() {
                let flows = self.transition_flows(state, time)?;
                for (name, members) in &self.output_connections {
                    let total = members.iter().map(|&i| flows[i]).sum();
                    if let Some(series) = derived.get_mut(name) {
                        series.push(total);
                    }
                }
            }
            let deaths = self.death_flows(state, time)?;
            for (name, members) in &self.death_outputs {
                let total = members.iter().map(|&i| deaths[i]).sum();
                if let Some(series) = derived.get_mut(name) {
                    series.push(total);
                }
            }
        }

        for (name, function) in &self.derived_outputs {
            let series = {
                let context = DerivedOutputContext {
                    times: &self.times,
                    index: &self.index,
                    values,
                    derived: &derived,
                };
                (0..values.len())
                    .map(|step| function(&context, step))
                    .collect::<Result<Vec<_>, _>>()?
            };
            derived.insert(name.clone(), series);
        }
        Ok(derived)
    }

    /// Integrate over the requested times and compute every derived output
    #[instrument(skip_all)]
    pub fn integrate<I: Integrator>(&self, integrator: &I) -> Result<ModelResults, ModelError> {
        self.resolver.clear_cache();
        let values = integrator.integrate(self, &self.initial_values, &self.times)?;
        let derived_outputs = self.compute_outputs(&values)?;
        info!(
            times = self.times.len(),
            compartments = self.labels.len(),
            derived_outputs = derived_outputs.len(),
            cached_parameters = self.resolver.cached_entries(),
            "integrated model"
        );
        Ok(ModelResults {
            times: self.times.clone(),
            compartments: self.labels.clone(),
            index: self.index.clone(),
            values,
            derived_outputs,
        })
    }

    /// Integrate with the default adaptive solver
    pub fn run(&self) -> Result<ModelResults, ModelError> {
        self.integrate(&DormandPrince::default())
    }
}
