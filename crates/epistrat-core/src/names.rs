//! Stratified names.
//!
//! Every compartment and parameter carries a stem plus an ordered list of
//! stratum tokens, one per stratification applied to it. The textual form joins
//! the stem and each `stratification_stratum` token with `X`:
//!
//! `infectiousXage_0Xrisk_high`
//!
//! Internally names stay structured ([`Name`]); the string form is only produced
//! for display and output keys and parsed back through [`Name::parse`].

use crate::error::ConfigurationError;
use crate::types::stratification::StratificationRegistry;
use std::fmt;

/// Separates the stem from each stratum token
pub const SEPARATOR: char = 'X';
/// Joins a stratification name to one of its strata inside a token
pub const STRATUM_JOINER: char = '_';
/// Suffix on an adjustment key marking the value as an overwrite
pub const OVERWRITE_SUFFIX: char = 'W';

/// Reject identifiers that would make the textual encoding ambiguous
pub fn validate_identifier(value: &str) -> Result<(), ConfigurationError> {
    if value.is_empty() || value.contains(SEPARATOR) {
        return Err(ConfigurationError::InvalidIdentifier(value.to_string()));
    }
    Ok(())
}

/// One stratum of one registered stratification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StratumRef {
    pub stratification: usize,
    pub stratum: usize,
}

impl StratumRef {
    pub fn new(stratification: usize, stratum: usize) -> Self {
        Self {
            stratification,
            stratum,
        }
    }

    /// Token text, e.g. `age_5`
    pub fn render(&self, registry: &StratificationRegistry) -> String {
        match registry.get(self.stratification) {
            Some(strat) => match strat.strata.get(self.stratum) {
                Some(stratum) => format!("{}{}{}", strat.name, STRATUM_JOINER, stratum),
                None => format!("{}{}#{}", strat.name, STRATUM_JOINER, self.stratum),
            },
            None => format!("#{}{}#{}", self.stratification, STRATUM_JOINER, self.stratum),
        }
    }
}

/// A stem with the stratum tokens appended by successive stratifications
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    stem: String,
    strata: Vec<StratumRef>,
}

impl Name {
    pub fn new(stem: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            strata: Vec::new(),
        }
    }

    pub fn from_parts(stem: impl Into<String>, strata: Vec<StratumRef>) -> Self {
        Self {
            stem: stem.into(),
            strata,
        }
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn strata(&self) -> &[StratumRef] {
        &self.strata
    }

    /// Number of stratum tokens
    pub fn depth(&self) -> usize {
        self.strata.len()
    }

    pub fn is_stratified(&self) -> bool {
        !self.strata.is_empty()
    }

    /// A copy of this name with one more token appended
    pub fn with_stratum(&self, stratum: StratumRef) -> Self {
        let mut strata = Vec::with_capacity(self.strata.len() + 1);
        strata.extend_from_slice(&self.strata);
        strata.push(stratum);
        Self {
            stem: self.stem.clone(),
            strata,
        }
    }

    /// Same strata under a different stem
    pub fn with_stem(&self, stem: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            strata: self.strata.clone(),
        }
    }

    /// Which stratum of `stratification` this name belongs to, if any
    pub fn stratum_of(&self, stratification: usize) -> Option<usize> {
        self.strata
            .iter()
            .find(|s| s.stratification == stratification)
            .map(|s| s.stratum)
    }

    pub fn has_stratum(&self, stratum: StratumRef) -> bool {
        self.strata.contains(&stratum)
    }

    pub fn has_all(&self, strata: &[StratumRef]) -> bool {
        strata.iter().all(|s| self.has_stratum(*s))
    }

    /// Whether `other` is this name or a further-stratified descendant of it
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.stem == other.stem && other.strata.starts_with(&self.strata)
    }

    /// This name followed by each ancestor, dropping one trailing token at a time
    /// down to the bare stem
    pub fn truncations(&self) -> impl Iterator<Item = Name> + '_ {
        (0..=self.strata.len())
            .rev()
            .map(move |len| Name::from_parts(self.stem.clone(), self.strata[..len].to_vec()))
    }

    /// Textual form, e.g. `infectiousXage_0Xrisk_high`
    pub fn render(&self, registry: &StratificationRegistry) -> String {
        let mut text = self.stem.clone();
        for stratum in &self.strata {
            text.push(SEPARATOR);
            text.push_str(&stratum.render(registry));
        }
        text
    }

    /// Parse the textual form against the registered stratifications
    pub fn parse(text: &str, registry: &StratificationRegistry) -> Result<Self, ConfigurationError> {
        let mut parts = text.split(SEPARATOR);
        let stem = match parts.next() {
            Some(stem) if !stem.is_empty() => stem,
            _ => return Err(ConfigurationError::MalformedName(text.to_string())),
        };
        let strata = parts
            .map(|token| {
                registry
                    .find_token(token)
                    .ok_or_else(|| ConfigurationError::MalformedName(text.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_parts(stem, strata))
    }
}

impl fmt::Display for Name {
    /// Debug-oriented form using indices; use [`Name::render`] for the real text
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stem)?;
        for stratum in &self.strata {
            write!(f, "{}#{}_#{}", SEPARATOR, stratum.stratification, stratum.stratum)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::stratification::Stratification;
    use proptest::prelude::*;

    fn registry() -> StratificationRegistry {
        let mut registry = StratificationRegistry::default();
        registry
            .register(Stratification::new("age", ["0", "5", "15"], ["susceptible"], true))
            .unwrap();
        registry
            .register(Stratification::new("risk", ["low", "high"], ["infectious"], false))
            .unwrap();
        registry
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("susceptible").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("eXposed").is_err());
    }

    #[test]
    fn test_render_and_parse() {
        let registry = registry();
        let name = Name::new("infectious")
            .with_stratum(StratumRef::new(0, 1))
            .with_stratum(StratumRef::new(1, 1));
        assert_eq!(name.render(&registry), "infectiousXage_5Xrisk_high");
        assert_eq!(Name::parse("infectiousXage_5Xrisk_high", &registry).unwrap(), name);
    }

    #[test]
    fn test_parse_rejects_unknown_tokens() {
        let registry = registry();
        assert!(Name::parse("infectiousXage_7", &registry).is_err());
        assert!(Name::parse("infectiousXcolour_red", &registry).is_err());
        assert!(Name::parse("Xage_0", &registry).is_err());
    }

    #[test]
    fn test_prefix_and_truncations() {
        let root = Name::new("beta");
        let child = root.with_stratum(StratumRef::new(0, 0));
        let grandchild = child.with_stratum(StratumRef::new(1, 1));
        assert!(root.is_prefix_of(&grandchild));
        assert!(child.is_prefix_of(&grandchild));
        assert!(!grandchild.is_prefix_of(&child));
        assert!(!Name::new("gamma").is_prefix_of(&grandchild));

        let chain: Vec<Name> = grandchild.truncations().collect();
        assert_eq!(chain, vec![grandchild.clone(), child, root]);
    }

    #[test]
    fn test_stratum_of() {
        let name = Name::new("s").with_stratum(StratumRef::new(1, 0));
        assert_eq!(name.stratum_of(1), Some(0));
        assert_eq!(name.stratum_of(0), None);
    }

    proptest! {
        #[test]
        fn parse_inverts_render(age in 0usize..3, risk in proptest::option::of(0usize..2)) {
            let registry = registry();
            let mut name = Name::new("compartment").with_stratum(StratumRef::new(0, age));
            if let Some(risk) = risk {
                name = name.with_stratum(StratumRef::new(1, risk));
            }
            let text = name.render(&registry);
            prop_assert_eq!(Name::parse(&text, &registry).unwrap(), name);
        }
    }
}
