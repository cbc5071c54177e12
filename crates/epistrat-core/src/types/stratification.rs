use crate::error::ConfigurationError;
use crate::names::{OVERWRITE_SUFFIX, STRATUM_JOINER, StratumRef, validate_identifier};
use crate::types::parameters::ParameterValue;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// Name of the stratification that gets ageing flows
pub const AGE_STRATIFICATION: &str = "age";
/// Name of the stratification whose strata tag infection flows with a strain
pub const STRAIN_STRATIFICATION: &str = "strain";
/// Restriction key applying target proportions to the whole population
pub const ALL_RESTRICTION: &str = "all";

/// Tolerance on proportions that must sum to one
const PROPORTION_TOLERANCE: f64 = 1e-9;

/// A stratification that has been applied to the model
#[derive(Debug, Clone, PartialEq)]
pub struct Stratification {
    pub name: String,
    pub strata: Vec<String>,
    /// Stems that were split
    pub compartments: Vec<String>,
    /// Whether every compartment stem was split
    pub full: bool,
}

impl Stratification {
    pub fn new<S, C>(
        name: impl Into<String>,
        strata: impl IntoIterator<Item = S>,
        compartments: impl IntoIterator<Item = C>,
        full: bool,
    ) -> Self
    where
        S: Into<String>,
        C: Into<String>,
    {
        Self {
            name: name.into(),
            strata: strata.into_iter().map(Into::into).collect(),
            compartments: compartments.into_iter().map(Into::into).collect(),
            full,
        }
    }

    pub fn stratum_index(&self, stratum: &str) -> Option<usize> {
        self.strata.iter().position(|s| s == stratum)
    }

    pub fn stratifies(&self, stem: &str) -> bool {
        self.compartments.iter().any(|c| c == stem)
    }

    pub fn is_age(&self) -> bool {
        self.name == AGE_STRATIFICATION
    }

    pub fn is_strain(&self) -> bool {
        self.name == STRAIN_STRATIFICATION
    }
}

/// Every stratification applied so far, in application order
#[derive(Debug, Clone, Default)]
pub struct StratificationRegistry {
    stratifications: Vec<Stratification>,
}

impl StratificationRegistry {
    /// Check a stratification could be registered
    pub fn validate(&self, stratification: &Stratification) -> Result<(), ConfigurationError> {
        validate_identifier(&stratification.name)?;
        if self.index_of(&stratification.name).is_some() {
            return Err(ConfigurationError::DuplicateStratification(
                stratification.name.clone(),
            ));
        }
        validate_strata(&stratification.name, &stratification.strata)
    }

    /// Validate and append a stratification, returning its index
    pub fn register(&mut self, stratification: Stratification) -> Result<usize, ConfigurationError> {
        self.validate(&stratification)?;
        self.stratifications.push(stratification);
        Ok(self.stratifications.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.stratifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stratifications.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Stratification> {
        self.stratifications.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stratifications.iter().position(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stratification> {
        self.stratifications.iter()
    }

    /// Reference to a named stratum
    pub fn stratum(&self, stratification: &str, stratum: &str) -> Result<StratumRef, ConfigurationError> {
        let index = self
            .index_of(stratification)
            .ok_or_else(|| ConfigurationError::UnknownStratification(stratification.to_string()))?;
        let position = self.stratifications[index]
            .stratum_index(stratum)
            .ok_or_else(|| ConfigurationError::UnknownStratum {
                stratification: stratification.to_string(),
                stratum: stratum.to_string(),
            })?;
        Ok(StratumRef::new(index, position))
    }

    /// Label of a stratum reference
    pub fn stratum_label(&self, stratum: StratumRef) -> Option<&str> {
        self.get(stratum.stratification)?
            .strata
            .get(stratum.stratum)
            .map(String::as_str)
    }

    /// Resolve a `stratification_stratum` token. Longer stratification names are
    /// tried first so `age_group_1` prefers `age_group` over `age`.
    pub fn find_token(&self, token: &str) -> Option<StratumRef> {
        let mut candidates: Vec<(usize, &Stratification)> =
            self.stratifications.iter().enumerate().collect();
        candidates.sort_by(|a, b| b.1.name.len().cmp(&a.1.name.len()));
        candidates.into_iter().find_map(|(index, strat)| {
            let rest = token.strip_prefix(strat.name.as_str())?;
            let stratum = rest.strip_prefix(STRATUM_JOINER)?;
            strat
                .stratum_index(stratum)
                .map(|position| StratumRef::new(index, position))
        })
    }
}

fn validate_strata(stratification: &str, strata: &[String]) -> Result<(), ConfigurationError> {
    if strata.is_empty() {
        return Err(ConfigurationError::EmptyStrata(stratification.to_string()));
    }
    let mut seen = BTreeSet::new();
    for stratum in strata {
        validate_identifier(stratum)?;
        if !seen.insert(stratum.as_str()) {
            return Err(ConfigurationError::DuplicateStratum {
                stratification: stratification.to_string(),
                stratum: stratum.clone(),
            });
        }
    }
    Ok(())
}

/// Strata may be given as strings or numbers in JSON (`[0, 5, 15]` for ages)
fn stratum_label<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Label {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(match Label::deserialize(deserializer)? {
        Label::Text(text) => text,
        Label::Integer(value) => value.to_string(),
        Label::Float(value) => value.to_string(),
    })
}

fn stratum_labels<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "stratum_label")] String);

    let labels = Vec::<Wrapped>::deserialize(deserializer)?;
    Ok(labels.into_iter().map(|w| w.0).collect())
}

/// Stratum-specific values for one parameter.
///
/// Keys are strata. A key of the form `<stratum>W` marks its value as an
/// overwrite; strata can also be listed in `overwrite` explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    #[serde(default)]
    pub overwrite: Vec<String>,
    #[serde(flatten)]
    pub values: IndexMap<String, ParameterValue>,
}

impl AdjustmentRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, stratum: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.values.insert(stratum.into(), value.into());
        self
    }

    pub fn with_overwrite(mut self, stratum: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        let stratum = stratum.into();
        self.values.insert(stratum.clone(), value.into());
        self.overwrite.push(stratum);
        self
    }

    /// Resolve keys against the strata being applied
    pub fn resolve(
        &self,
        parameter: &str,
        strata: &[String],
    ) -> Result<ResolvedAdjustment, ConfigurationError> {
        let position = |stratum: &str| strata.iter().position(|s| s == stratum);
        let mut resolved = ResolvedAdjustment::default();

        for (key, value) in &self.values {
            let (index, overwrite) = match position(key) {
                Some(index) => (index, false),
                None => match key
                    .strip_suffix(OVERWRITE_SUFFIX)
                    .and_then(|stripped| position(stripped))
                {
                    Some(index) => (index, true),
                    None => {
                        return Err(ConfigurationError::InvalidAdjustment {
                            parameter: parameter.to_string(),
                            reason: format!("'{}' is not a stratum", key),
                        });
                    }
                },
            };
            if resolved.values.insert(index, value.clone()).is_some() {
                return Err(ConfigurationError::InvalidAdjustment {
                    parameter: parameter.to_string(),
                    reason: format!("stratum '{}' is adjusted twice", strata[index]),
                });
            }
            if overwrite {
                resolved.overwrite.insert(index);
            }
        }

        for stratum in &self.overwrite {
            let index = position(stratum)
                .filter(|index| resolved.values.contains_key(index))
                .ok_or_else(|| ConfigurationError::InvalidAdjustment {
                    parameter: parameter.to_string(),
                    reason: format!("overwrite stratum '{}' has no value", stratum),
                })?;
            resolved.overwrite.insert(index);
        }

        Ok(resolved)
    }
}

/// An adjustment with keys resolved to stratum positions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedAdjustment {
    pub values: IndexMap<usize, ParameterValue>,
    pub overwrite: BTreeSet<usize>,
}

/// Everything one call to `stratify` needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StratificationRequest {
    pub name: String,
    #[serde(deserialize_with = "stratum_labels")]
    pub strata: Vec<String>,
    /// Stems to split; empty means all of them
    #[serde(default)]
    pub compartments: Vec<String>,
    /// Initial split of compartment values
    #[serde(default)]
    pub proportions: IndexMap<String, f64>,
    /// Split of births across strata
    #[serde(default)]
    pub entry_proportions: IndexMap<String, ParameterValue>,
    /// Parameter key to stratum-specific values
    #[serde(default)]
    pub adjustments: IndexMap<String, AdjustmentRequest>,
    /// Relative infectiousness of each stratum
    #[serde(default)]
    pub infectiousness_adjustments: IndexMap<String, f64>,
    /// Square matrix, row and column order following `strata`
    #[serde(default)]
    pub mixing_matrix: Option<Vec<Vec<f64>>>,
    /// Restriction (`all` or a stratum token) to stratum to target proportion
    #[serde(default)]
    pub target_proportions: IndexMap<String, IndexMap<String, ParameterValue>>,
}

impl StratificationRequest {
    pub fn new<S: Into<String>>(name: impl Into<String>, strata: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            strata: strata.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse a request from JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_compartments<S: Into<String>>(mut self, compartments: impl IntoIterator<Item = S>) -> Self {
        self.compartments = compartments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_proportion(mut self, stratum: impl Into<String>, proportion: f64) -> Self {
        self.proportions.insert(stratum.into(), proportion);
        self
    }

    pub fn with_entry_proportion(mut self, stratum: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.entry_proportions.insert(stratum.into(), value.into());
        self
    }

    pub fn with_adjustment(mut self, parameter: impl Into<String>, adjustment: AdjustmentRequest) -> Self {
        self.adjustments.insert(parameter.into(), adjustment);
        self
    }

    pub fn with_infectiousness(mut self, stratum: impl Into<String>, level: f64) -> Self {
        self.infectiousness_adjustments.insert(stratum.into(), level);
        self
    }

    pub fn with_mixing_matrix(mut self, matrix: Vec<Vec<f64>>) -> Self {
        self.mixing_matrix = Some(matrix);
        self
    }

    pub fn with_target_proportion(
        mut self,
        restriction: impl Into<String>,
        stratum: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Self {
        self.target_proportions
            .entry(restriction.into())
            .or_default()
            .insert(stratum.into(), value.into());
        self
    }

    /// Proportion of each stratum, in strata order.
    ///
    /// Listed proportions must sum to at most one; unlisted strata share the
    /// remainder equally. When every stratum is listed the sum must be one.
    pub fn all_proportions(&self) -> Result<Vec<f64>, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidProportions {
            stratification: self.name.clone(),
            reason,
        };

        if let Some(unknown) = self
            .proportions
            .keys()
            .find(|key| !self.strata.contains(key))
        {
            return Err(invalid(format!("'{}' is not a stratum", unknown)));
        }
        if let Some((key, value)) = self
            .proportions
            .iter()
            .find(|(_, value)| !value.is_finite() || **value < 0.0)
        {
            return Err(invalid(format!("'{}' has invalid proportion {}", key, value)));
        }

        let listed: f64 = self.proportions.values().sum();
        if listed > 1.0 + PROPORTION_TOLERANCE {
            return Err(invalid(format!("proportions sum to {}", listed)));
        }

        let unlisted = self.strata.len() - self.proportions.len();
        if unlisted == 0 {
            if (listed - 1.0).abs() > PROPORTION_TOLERANCE {
                return Err(invalid(format!(
                    "all strata listed but proportions sum to {}",
                    listed
                )));
            }
            return Ok(self.strata.iter().map(|s| self.proportions[s]).collect());
        }

        let share = (1.0 - listed).max(0.0) / unlisted as f64;
        Ok(self
            .strata
            .iter()
            .map(|s| self.proportions.get(s).copied().unwrap_or(share))
            .collect())
    }
}
