//! Composition of stratified parameters into functions of time.
//!
//! A stratified parameter such as `contact_rateXage_5Xrisk_high` is the product
//! of its own value and the values of each ancestor (`contact_rateXage_5`,
//! `contact_rate`). The walk from the most specific name toward the stem stops
//! at the first name in the overwrite set, whose value then replaces everything
//! above it. Constant factors are folded together when a parameter is
//! registered, leaving only time-variant factors to evaluate per call.

use crate::error::{ConfigurationError, LookupError, ModelError};
use crate::math_expression::MathExpressionContext;
use crate::names::{Name, StratumRef};
use crate::time_variant::{TimeVariant, TimeVariantTable};
use crate::types::parameters::{ParameterTable, ParameterValue, UNIVERSAL_DEATH_RATE};
use lru::LruCache;
use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// Handle to a registered parameter
pub type ParamId = usize;

/// Default bound on memoised `(parameter, time)` evaluations
pub const DEFAULT_CACHE_CAPACITY: usize = 1 << 17;

/// A product of constant and time-variant factors
#[derive(Clone, Debug, PartialEq)]
pub struct ComposedParameter {
    /// Contributing names, most specific first
    components: Vec<Name>,
    scale: f64,
    time_variants: Vec<usize>,
}

impl ComposedParameter {
    fn new() -> Self {
        Self {
            components: Vec::new(),
            scale: 1.0,
            time_variants: Vec::new(),
        }
    }

    pub fn components(&self) -> &[Name] {
        &self.components
    }

    pub fn is_constant(&self) -> bool {
        self.time_variants.is_empty()
    }
}

/// Population-wide death rate and its per-stratum adjustments
#[derive(Clone, Debug, PartialEq)]
pub struct MortalityTable {
    base: ParameterValue,
    adjustments: HashMap<StratumRef, (ParameterValue, bool)>,
}

impl MortalityTable {
    pub fn new(base: ParameterValue) -> Self {
        Self {
            base,
            adjustments: HashMap::new(),
        }
    }

    pub fn base(&self) -> &ParameterValue {
        &self.base
    }

    /// Multiplier (or, with `overwrite`, replacement) for members of `stratum`
    pub fn adjust(&mut self, stratum: StratumRef, value: ParameterValue, overwrite: bool) {
        self.adjustments.insert(stratum, (value, overwrite));
    }

    pub fn adjustment(&self, stratum: StratumRef) -> Option<&(ParameterValue, bool)> {
        self.adjustments.get(&stratum)
    }

    pub fn adjustments(&self) -> impl Iterator<Item = (&StratumRef, &(ParameterValue, bool))> {
        self.adjustments.iter()
    }
}

/// Frozen parameter functions for one prepared model
pub struct ParameterResolver {
    parameters: Vec<ComposedParameter>,
    by_name: HashMap<Name, ParamId>,
    mortality_by_compartment: HashMap<Name, ParamId>,
    time_variants: Vec<TimeVariant>,
    time_variant_index: HashMap<String, usize>,
    context: MathExpressionContext,
    cache: Option<RefCell<LruCache<(ParamId, u64), f64>>>,
}

impl ParameterResolver {
    /// Check every time-variant against the formula context and take ownership
    /// of the table
    pub fn new(
        time_variants: &TimeVariantTable,
        context: MathExpressionContext,
        cache_capacity: usize,
    ) -> Result<Self, ModelError> {
        let mut functions = Vec::with_capacity(time_variants.len());
        let mut time_variant_index = HashMap::with_capacity(time_variants.len());
        for (index, (name, function)) in time_variants.iter().enumerate() {
            function.validate(&context)?;
            functions.push(function.clone());
            time_variant_index.insert(name.clone(), index);
        }

        let cache = NonZeroUsize::new(cache_capacity).map(|cap| RefCell::new(LruCache::new(cap)));

        Ok(Self {
            parameters: Vec::new(),
            by_name: HashMap::new(),
            mortality_by_compartment: HashMap::new(),
            time_variants: functions,
            time_variant_index,
            context,
            cache,
        })
    }

    fn push_factor(
        &self,
        composed: &mut ComposedParameter,
        value: &ParameterValue,
    ) -> Result<(), ConfigurationError> {
        match value {
            ParameterValue::Constant(v) => composed.scale *= v,
            ParameterValue::TimeVariant(name) => {
                let index = self
                    .time_variant_index
                    .get(name)
                    .copied()
                    .ok_or_else(|| ConfigurationError::UnknownTimeVariant(name.clone()))?;
                composed.time_variants.push(index);
            }
        }
        Ok(())
    }

    fn push(&mut self, composed: ComposedParameter) -> ParamId {
        self.parameters.push(composed);
        self.parameters.len() - 1
    }

    /// Compose a transition parameter by walking from `name` toward its stem
    pub fn register(&mut self, name: &Name, table: &ParameterTable) -> Result<ParamId, ConfigurationError> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }

        let mut composed = ComposedParameter::new();
        for component in name.truncations() {
            let value = table
                .get(&component)
                .ok_or_else(|| ConfigurationError::UnknownParameter(component.to_string()))?;
            self.push_factor(&mut composed, value)?;
            let stop = table.is_overwrite(&component);
            composed.components.push(component);
            if stop {
                break;
            }
        }

        let id = self.push(composed);
        self.by_name.insert(name.clone(), id);
        Ok(id)
    }

    /// Compose the population-wide death rate for one compartment, walking its
    /// strata from the most recent back to the unstratified rate
    pub fn register_mortality(
        &mut self,
        compartment: &Name,
        mortality: &MortalityTable,
    ) -> Result<ParamId, ConfigurationError> {
        if let Some(&id) = self.mortality_by_compartment.get(compartment) {
            return Ok(id);
        }

        let mut composed = ComposedParameter::new();
        let mut overwritten = false;
        for (depth, stratum) in compartment.strata().iter().enumerate().rev() {
            if let Some((value, overwrite)) = mortality.adjustment(*stratum) {
                self.push_factor(&mut composed, value)?;
                composed.components.push(Name::from_parts(
                    UNIVERSAL_DEATH_RATE,
                    compartment.strata()[..=depth].to_vec(),
                ));
                if *overwrite {
                    overwritten = true;
                    break;
                }
            }
        }
        if !overwritten {
            self.push_factor(&mut composed, mortality.base())?;
            composed.components.push(Name::new(UNIVERSAL_DEATH_RATE));
        }

        let id = self.push(composed);
        self.mortality_by_compartment.insert(compartment.clone(), id);
        Ok(id)
    }

    /// Register a single value that is not part of the stratified parameter tree
    pub fn register_value(&mut self, label: Name, value: &ParameterValue) -> Result<ParamId, ConfigurationError> {
        let mut composed = ComposedParameter::new();
        self.push_factor(&mut composed, value)?;
        composed.components.push(label);
        Ok(self.push(composed))
    }

    pub fn id_of(&self, name: &Name) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    pub fn mortality_id(&self, compartment: &Name) -> Option<ParamId> {
        self.mortality_by_compartment.get(compartment).copied()
    }

    pub fn composed(&self, id: ParamId) -> Option<&ComposedParameter> {
        self.parameters.get(id)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Value of a registered parameter at time `t`
    pub fn resolve(&self, id: ParamId, t: f64) -> Result<f64, ModelError> {
        let composed = self
            .parameters
            .get(id)
            .ok_or_else(|| LookupError::Parameter(format!("#{}", id)))?;
        if composed.is_constant() {
            return Ok(composed.scale);
        }

        let key = (id, t.to_bits());
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.borrow_mut().get(&key) {
                return Ok(*value);
            }
        }

        let mut value = composed.scale;
        for &index in &composed.time_variants {
            value *= self.time_variants[index].evaluate(&self.context, t)?;
        }

        if let Some(cache) = &self.cache {
            cache.borrow_mut().put(key, value);
        }
        Ok(value)
    }

    /// Value of a registered parameter by name
    pub fn resolve_name(&self, name: &Name, t: f64) -> Result<f64, ModelError> {
        let id = self
            .id_of(name)
            .ok_or_else(|| LookupError::Parameter(name.to_string()))?;
        self.resolve(id, t)
    }

    /// Forget memoised values, e.g. between independent runs
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.borrow_mut().clear();
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.borrow().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a() -> StratumRef {
        StratumRef::new(0, 0)
    }

    fn b() -> StratumRef {
        StratumRef::new(1, 1)
    }

    fn chain(overwrite_middle: bool) -> ParameterTable {
        let mut table = ParameterTable::new();
        let p = Name::new("p");
        let pa = p.with_stratum(a());
        let pab = pa.with_stratum(b());
        table.insert(p, 2.0.into()).unwrap();
        table.insert(pa.clone(), 3.0.into()).unwrap();
        table.insert(pab, 5.0.into()).unwrap();
        if overwrite_middle {
            table.mark_overwrite(pa);
        }
        table
    }

    fn resolver(time_variants: &TimeVariantTable) -> ParameterResolver {
        ParameterResolver::new(time_variants, MathExpressionContext::new(), 16).unwrap()
    }

    #[test]
    fn test_composition_multiplies_ancestors() {
        let table = chain(false);
        let mut resolver = resolver(&TimeVariantTable::new());
        let name = Name::new("p").with_stratum(a()).with_stratum(b());
        let id = resolver.register(&name, &table).unwrap();
        assert_eq!(resolver.resolve(id, 0.0).unwrap(), 30.0);
        assert_eq!(resolver.composed(id).unwrap().components().len(), 3);
    }

    #[test]
    fn test_overwrite_stops_walk() {
        let table = chain(true);
        let mut resolver = resolver(&TimeVariantTable::new());
        let name = Name::new("p").with_stratum(a()).with_stratum(b());
        let id = resolver.register(&name, &table).unwrap();
        assert_eq!(resolver.resolve(id, 7.0).unwrap(), 15.0);
        assert_eq!(
            resolver.composed(id).unwrap().components().last(),
            Some(&Name::new("p").with_stratum(a()))
        );
    }

    #[test]
    fn test_missing_component_is_configuration_error() {
        let mut table = ParameterTable::new();
        table
            .insert(Name::new("q").with_stratum(a()), 1.0.into())
            .unwrap();
        let mut resolver = resolver(&TimeVariantTable::new());
        let result = resolver.register(&Name::new("q").with_stratum(a()), &table);
        assert!(matches!(result, Err(ConfigurationError::UnknownParameter(_))));
    }

    #[test]
    fn test_time_variant_component_is_cached() {
        let mut time_variants = TimeVariantTable::new();
        time_variants.insert("ramp", TimeVariant::function(|t| t));
        let mut table = ParameterTable::new();
        table.insert(Name::new("p"), 2.0.into()).unwrap();
        table
            .insert(Name::new("p").with_stratum(a()), "ramp".into())
            .unwrap();

        let mut resolver = resolver(&time_variants);
        let id = resolver
            .register(&Name::new("p").with_stratum(a()), &table)
            .unwrap();
        assert_eq!(resolver.resolve(id, 4.0).unwrap(), 8.0);
        assert_eq!(resolver.resolve(id, 4.0).unwrap(), 8.0);
        assert_eq!(resolver.cached_entries(), 1);
        resolver.clear_cache();
        assert_eq!(resolver.cached_entries(), 0);
    }

    #[test]
    fn test_unknown_time_variant_rejected() {
        let mut table = ParameterTable::new();
        table.insert(Name::new("p"), "missing".into()).unwrap();
        let mut resolver = resolver(&TimeVariantTable::new());
        assert!(matches!(
            resolver.register(&Name::new("p"), &table),
            Err(ConfigurationError::UnknownTimeVariant(_))
        ));
    }

    #[test]
    fn test_mortality_walk() {
        let mut mortality = MortalityTable::new(0.01.into());
        mortality.adjust(a(), 2.0.into(), false);
        mortality.adjust(b(), 0.5.into(), true);
        let mut resolver = resolver(&TimeVariantTable::new());

        let only_a = Name::new("s").with_stratum(a());
        let id = resolver.register_mortality(&only_a, &mortality).unwrap();
        assert!((resolver.resolve(id, 0.0).unwrap() - 0.02).abs() < 1e-15);

        let both = only_a.with_stratum(b());
        let id = resolver.register_mortality(&both, &mortality).unwrap();
        assert_eq!(resolver.resolve(id, 0.0).unwrap(), 0.5);

        let neither = Name::new("s");
        let id = resolver.register_mortality(&neither, &mortality).unwrap();
        assert_eq!(resolver.resolve(id, 0.0).unwrap(), 0.01);
    }
}
