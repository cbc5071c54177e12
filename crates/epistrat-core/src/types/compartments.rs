use crate::error::ConfigurationError;
use crate::names::{Name, StratumRef};
use std::collections::HashMap;

/// Ordered compartments and their current values
#[derive(Clone, Debug, Default)]
pub struct CompartmentStore {
    names: Vec<Name>,
    values: Vec<f64>,
    index: HashMap<Name, usize>,
}

impl CompartmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: Name, value: f64) -> Result<usize, ConfigurationError> {
        if self.index.contains_key(&name) {
            return Err(ConfigurationError::DuplicateCompartment(name.to_string()));
        }
        let position = self.names.len();
        self.index.insert(name.clone(), position);
        self.names.push(name);
        self.values.push(value);
        Ok(position)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[Name] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn index_of(&self, name: &Name) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.index.contains_key(name)
    }

    pub fn value(&self, name: &Name) -> Option<f64> {
        self.index_of(name).map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, f64)> {
        self.names.iter().zip(self.values.iter().copied())
    }

    /// Positions of the compartments with the given stem
    pub fn with_stem<'a>(&'a self, stem: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.names
            .iter()
            .enumerate()
            .filter(move |(_, name)| name.stem() == stem)
            .map(|(i, _)| i)
    }

    /// Positions of the compartments carrying every given stratum
    pub fn with_strata<'a>(&'a self, strata: &'a [StratumRef]) -> impl Iterator<Item = usize> + 'a {
        self.names
            .iter()
            .enumerate()
            .filter(move |(_, name)| name.has_all(strata))
            .map(|(i, _)| i)
    }

    /// Distinct stems in first-seen order
    pub fn stems(&self) -> Vec<&str> {
        let mut stems: Vec<&str> = Vec::new();
        for name in &self.names {
            if !stems.contains(&name.stem()) {
                stems.push(name.stem());
            }
        }
        stems
    }

    /// Replace every compartment whose stem is in `stems` with one child per
    /// stratum holding `value × proportion`. Children are appended after the
    /// untouched compartments, in the order of their parents. Returns the
    /// names that were split.
    pub fn split(&mut self, stems: &[String], strata: &[(StratumRef, f64)]) -> Vec<Name> {
        let mut kept_names = Vec::with_capacity(self.names.len());
        let mut kept_values = Vec::with_capacity(self.values.len());
        let mut children = Vec::new();
        let mut split = Vec::new();

        for (name, value) in self.names.drain(..).zip(self.values.drain(..)) {
            if stems.iter().any(|stem| stem == name.stem()) {
                for (stratum, proportion) in strata {
                    children.push((name.with_stratum(*stratum), value * proportion));
                }
                split.push(name);
            } else {
                kept_names.push(name);
                kept_values.push(value);
            }
        }

        for (name, value) in children {
            kept_names.push(name);
            kept_values.push(value);
        }

        self.names = kept_names;
        self.values = kept_values;
        self.index = self
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        split
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sir() -> CompartmentStore {
        let mut store = CompartmentStore::new();
        store.add(Name::new("susceptible"), 900.0).unwrap();
        store.add(Name::new("infectious"), 100.0).unwrap();
        store.add(Name::new("recovered"), 0.0).unwrap();
        store
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut store = sir();
        assert!(store.add(Name::new("infectious"), 1.0).is_err());
    }

    #[test]
    fn test_split_preserves_total_and_order() {
        let mut store = sir();
        let low = StratumRef::new(0, 0);
        let high = StratumRef::new(0, 1);
        let split = store.split(
            &["infectious".to_string(), "recovered".to_string()],
            &[(low, 0.8), (high, 0.2)],
        );
        assert_eq!(split, vec![Name::new("infectious"), Name::new("recovered")]);
        assert_eq!(store.len(), 5);
        assert_eq!(store.names()[0], Name::new("susceptible"));
        assert_eq!(store.value(&Name::new("infectious").with_stratum(low)), Some(80.0));
        assert_eq!(store.value(&Name::new("infectious").with_stratum(high)), Some(20.0));
        assert!(!store.contains(&Name::new("infectious")));
        assert!((store.total() - 1000.0).abs() < 1e-9);
        assert_eq!(store.with_stem("infectious").count(), 2);
        assert_eq!(store.with_strata(&[high]).count(), 2);
        assert_eq!(store.stems(), vec!["susceptible", "infectious", "recovered"]);
    }
}
