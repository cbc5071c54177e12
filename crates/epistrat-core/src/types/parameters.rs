use crate::error::ConfigurationError;
use crate::names::Name;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Rate applied to each person per unit time when no other value is given
pub const UNIVERSAL_DEATH_RATE: &str = "universal_death_rate";
/// Births per person per unit time for the `add_crude_birth_rate` approach
pub const CRUDE_BIRTH_RATE: &str = "crude_birth_rate";
/// Fraction of births entering a stratified entry compartment
pub const ENTRY_FRACTION: &str = "entry_fraction";

/// A parameter is either a number or the name of a time-variant function
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Constant(f64),
    TimeVariant(String),
}

impl ParameterValue {
    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Self::Constant(value) => Some(*value),
            Self::TimeVariant(_) => None,
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Constant(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(name: &str) -> Self {
        Self::TimeVariant(name.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(name: String) -> Self {
        Self::TimeVariant(name)
    }
}

/// Parameter values keyed by stratified name, plus the set of names whose values
/// replace rather than multiply the values of their ancestors
#[derive(Clone, Debug, Default)]
pub struct ParameterTable {
    values: IndexMap<Name, ParameterValue>,
    overwrites: HashSet<Name>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new parameter; names are never redefined
    pub fn insert(&mut self, name: Name, value: ParameterValue) -> Result<(), ConfigurationError> {
        if self.values.contains_key(&name) {
            return Err(ConfigurationError::DuplicateParameter(name.to_string()));
        }
        self.values.insert(name, value);
        Ok(())
    }

    /// Add or replace a parameter
    pub fn set(&mut self, name: Name, value: ParameterValue) {
        self.values.insert(name, value);
    }

    pub fn get(&self, name: &Name) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.values.contains_key(name)
    }

    pub fn has_stem(&self, stem: &str) -> bool {
        self.values.keys().any(|name| name.stem() == stem)
    }

    pub fn mark_overwrite(&mut self, name: Name) {
        self.overwrites.insert(name);
    }

    pub fn is_overwrite(&self, name: &Name) -> bool {
        self.overwrites.contains(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &ParameterValue)> {
        self.values.iter()
    }

    /// Unstratified parameters with constant values, used as formula variables
    pub fn root_constants(&self) -> impl Iterator<Item = (String, f64)> + '_ {
        self.values.iter().filter_map(|(name, value)| {
            if name.is_stratified() {
                return None;
            }
            value.as_constant().map(|v| (name.stem().to_string(), v))
        })
    }
}
