//! The stratification algorithm.
//!
//! A request is validated completely against the current model before anything
//! is changed, then applied in order: register the stratification, split
//! compartments, add ageing flows, rework every flow of the previous round,
//! record mortality, mixing and infectiousness adjustments, and finally add the
//! equilibration flows.

use crate::equilibration::{EQUILIBRATION_PARAMETER, EquilibrationTarget};
use crate::model::StratifiedModel;
use epistrat_core::{
    ALL_RESTRICTION, ConfigurationError, Flow, FlowKind, ModelError, Name,
    ParameterValue, ResolvedAdjustment, Stratification, StratificationRequest, StratumRef,
    UNIVERSAL_DEATH_RATE, matrix_from_rows,
};
use ndarray::Array2;
use tracing::{debug, info, instrument, warn};

/// A fully validated request, ready to apply
struct StratificationPlan {
    stratification: Stratification,
    proportions: Vec<f64>,
    entry_fractions: Vec<ParameterValue>,
    adjustments: Vec<(Name, ResolvedAdjustment)>,
    mortality: Option<ResolvedAdjustment>,
    infectiousness: Vec<(usize, f64)>,
    mixing_matrix: Option<Array2<f64>>,
    targets: Vec<(Option<StratumRef>, Vec<ParameterValue>)>,
    /// Ageing parameter names and rates between adjacent age strata
    ageing: Vec<(String, f64)>,
}

impl StratificationPlan {
    fn strata_count(&self) -> usize {
        self.stratification.strata.len()
    }

    /// Most specific adjustment whose key is an ancestor of `parameter`.
    ///
    /// Keys are compared token by token rather than as raw strings: a key
    /// matches when its stem equals the parameter's stem and its strata are a
    /// leading run of the parameter's strata. `contact_rateXage_0` matches
    /// `contact_rateXage_0Xrisk_high` but neither `contact_rate_2` nor
    /// `contact_rateXage_05`. The key with the most strata wins.
    fn adjustment_for(&self, parameter: &Name) -> Option<&ResolvedAdjustment> {
        self.adjustments
            .iter()
            .filter(|(key, _)| key.is_prefix_of(parameter))
            .max_by_key(|(key, _)| key.depth())
            .map(|(_, adjustment)| adjustment)
    }

    fn stratifies(&self, compartment: Option<&Name>) -> bool {
        compartment.is_some_and(|name| self.stratification.stratifies(name.stem()))
    }
}

fn age_value(stratum: &str) -> Result<f64, ConfigurationError> {
    stratum
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| {
            ConfigurationError::InvalidAgeStrata(format!("'{}' is not a number", stratum))
        })
}

impl StratifiedModel {
    /// Apply one stratification to the model
    #[instrument(skip_all, fields(stratification = %request.name))]
    pub fn stratify(&mut self, request: StratificationRequest) -> Result<(), ModelError> {
        let plan = self.plan(request)?;
        self.apply(plan)
    }

    fn check_time_variant(&self, value: &ParameterValue) -> Result<(), ConfigurationError> {
        match value {
            ParameterValue::TimeVariant(name) if !self.time_variants.contains(name) => {
                Err(ConfigurationError::UnknownTimeVariant(name.clone()))
            }
            _ => Ok(()),
        }
    }

    fn plan(&self, mut request: StratificationRequest) -> Result<StratificationPlan, ModelError> {
        let name = request.name.clone();
        let is_age = name == epistrat_core::AGE_STRATIFICATION;

        let stems: Vec<String> = if request.compartments.is_empty() {
            self.stems.clone()
        } else {
            for stem in &request.compartments {
                if !self.is_stem(stem) {
                    return Err(ConfigurationError::UnknownCompartment(stem.clone()).into());
                }
            }
            request.compartments.clone()
        };
        let full = self.stems.iter().all(|stem| stems.contains(stem));

        let mut ageing = Vec::new();
        if is_age {
            let mut ages = request
                .strata
                .iter()
                .map(|stratum| Ok((age_value(stratum)?, stratum.clone())))
                .collect::<Result<Vec<_>, ConfigurationError>>()?;
            ages.sort_by(|a, b| a.0.total_cmp(&b.0));
            if !ages.iter().any(|(age, _)| *age == 0.0) {
                return Err(ConfigurationError::InvalidAgeStrata(
                    "age strata must include 0".to_string(),
                )
                .into());
            }
            if !full {
                return Err(ConfigurationError::InvalidAgeStrata(
                    "age stratification must apply to every compartment".to_string(),
                )
                .into());
            }
            for pair in ages.windows(2) {
                let (lower, upper) = (&pair[0], &pair[1]);
                let parameter = format!("ageing{}to{}", lower.1, upper.1);
                if self.parameters.has_stem(&parameter) {
                    return Err(ConfigurationError::DuplicateParameter(parameter).into());
                }
                ageing.push((parameter, 1.0 / (upper.0 - lower.0)));
            }
            request.strata = ages.into_iter().map(|(_, stratum)| stratum).collect();
        }

        let stratification = Stratification::new(name.clone(), request.strata.clone(), stems, full);
        self.registry.validate(&stratification)?;
        let strata = &stratification.strata;
        let unknown_stratum = |stratum: &str| ConfigurationError::UnknownStratum {
            stratification: name.clone(),
            stratum: stratum.to_string(),
        };

        let proportions = request.all_proportions()?;

        for (stratum, value) in &request.entry_proportions {
            if !strata.contains(stratum) {
                return Err(unknown_stratum(stratum).into());
            }
            self.check_time_variant(value)?;
        }
        let entry_fractions = strata
            .iter()
            .map(|stratum| {
                if is_age {
                    let newborn = age_value(stratum).map(|age| age == 0.0).unwrap_or(false);
                    ParameterValue::Constant(if newborn { 1.0 } else { 0.0 })
                } else {
                    request
                        .entry_proportions
                        .get(stratum)
                        .cloned()
                        .unwrap_or(ParameterValue::Constant(1.0 / strata.len() as f64))
                }
            })
            .collect();

        let mut adjustments = Vec::new();
        let mut mortality = None;
        for (key, adjustment) in &request.adjustments {
            let resolved = adjustment.resolve(key, strata)?;
            for value in resolved.values.values() {
                self.check_time_variant(value)?;
            }
            if key == UNIVERSAL_DEATH_RATE {
                if !full {
                    return Err(ConfigurationError::PartialUniversalDeath(name.clone()).into());
                }
                mortality = Some(resolved);
                continue;
            }
            let parameter = Name::parse(key, &self.registry)?;
            if !self.parameters.has_stem(parameter.stem()) {
                return Err(ConfigurationError::UnknownParameter(key.clone()).into());
            }
            adjustments.push((parameter, resolved));
        }

        let mut infectiousness = Vec::new();
        for (stratum, level) in &request.infectiousness_adjustments {
            let index = stratification
                .stratum_index(stratum)
                .ok_or_else(|| unknown_stratum(stratum))?;
            infectiousness.push((index, *level));
        }

        let mixing_matrix = match &request.mixing_matrix {
            Some(rows) => {
                if !full {
                    return Err(ConfigurationError::PartialMixing(name.clone()).into());
                }
                Some(matrix_from_rows(&name, rows, strata.len())?)
            }
            None => None,
        };

        let mut targets = Vec::new();
        for (restriction, values) in &request.target_proportions {
            targets.push(self.plan_targets(&stratification, restriction, values)?);
        }

        Ok(StratificationPlan {
            stratification,
            proportions,
            entry_fractions,
            adjustments,
            mortality,
            infectiousness,
            mixing_matrix,
            targets,
            ageing,
        })
    }

    fn plan_targets(
        &self,
        stratification: &Stratification,
        restriction: &str,
        values: &indexmap::IndexMap<String, ParameterValue>,
    ) -> Result<(Option<StratumRef>, Vec<ParameterValue>), ModelError> {
        let invalid = |reason: String| ConfigurationError::InvalidTargetProportions {
            stratification: stratification.name.clone(),
            reason,
        };

        let restriction_ref = if restriction == ALL_RESTRICTION {
            None
        } else {
            let stratum = self
                .registry
                .find_token(restriction)
                .ok_or_else(|| invalid(format!("unknown restriction '{}'", restriction)))?;
            Some(stratum)
        };

        let strata = &stratification.strata;
        if let Some(unknown) = values.keys().find(|key| !strata.contains(key)) {
            return Err(ConfigurationError::UnknownStratum {
                stratification: stratification.name.clone(),
                stratum: unknown.clone(),
            }
            .into());
        }

        let leading = &strata[..strata.len() - 1];
        let mut targets = Vec::with_capacity(leading.len());
        let mut constant_total = 0.0;
        for stratum in leading {
            let value = values
                .get(stratum)
                .ok_or_else(|| invalid(format!("no target for stratum '{}'", stratum)))?;
            self.check_time_variant(value)?;
            if let Some(constant) = value.as_constant() {
                if constant < 0.0 {
                    return Err(invalid(format!("negative target for '{}'", stratum)).into());
                }
                constant_total += constant;
            }
            targets.push(value.clone());
        }
        if constant_total > 1.0 {
            return Err(invalid(format!("targets sum to {}", constant_total)).into());
        }
        if let Some(last) = strata.last().filter(|last| values.contains_key(*last)) {
            warn!(stratum = %last, "ignoring target for the last stratum, it takes the remainder");
        }

        Ok((restriction_ref, targets))
    }

    fn apply(&mut self, plan: StratificationPlan) -> Result<(), ModelError> {
        let previous_level = self.registry.len();
        let index = self.registry.register(plan.stratification.clone())?;
        let level = self.registry.len();
        let stratum_refs: Vec<StratumRef> = (0..plan.strata_count())
            .map(|s| StratumRef::new(index, s))
            .collect();

        let shares: Vec<(StratumRef, f64)> = stratum_refs
            .iter()
            .copied()
            .zip(plan.proportions.iter().copied())
            .collect();
        let split = self
            .compartments
            .split(&plan.stratification.compartments, &shares);

        for (pair, (parameter, rate)) in stratum_refs.windows(2).zip(&plan.ageing) {
            self.parameters
                .insert(Name::new(parameter.as_str()), ParameterValue::Constant(*rate))?;
            for compartment in &split {
                self.flows.push(Flow::transition(
                    FlowKind::Standard,
                    Name::new(parameter.as_str()),
                    compartment.with_stratum(pair[0]),
                    compartment.with_stratum(pair[1]),
                    level,
                ));
            }
        }

        let previous = self.flows.snapshot_level(previous_level);
        let mut reworked = 0usize;
        for flow in previous {
            let new_flows = self.stratify_flow(&flow, &plan, &stratum_refs, level)?;
            reworked += new_flows.len();
            for new_flow in new_flows {
                self.flows.push(new_flow);
            }
        }

        if let Some(mortality) = &plan.mortality {
            for (stratum, value) in &mortality.values {
                let overwrite = mortality.overwrite.contains(stratum);
                self.mortality
                    .adjust(stratum_refs[*stratum], value.clone(), overwrite);
            }
        }

        if let Some(matrix) = plan.mixing_matrix.clone() {
            self.mixing.combine(index, matrix);
        }

        for (stratum, multiplier) in &plan.infectiousness {
            self.infectiousness
                .set_level(stratum_refs[*stratum], *multiplier);
        }

        for (restriction, targets) in &plan.targets {
            let equilibration = self.equilibrations.len();
            self.equilibrations.push(EquilibrationTarget {
                stratification: index,
                restriction: *restriction,
                targets: targets.clone(),
            });
            let restricted = split
                .iter()
                .filter(|compartment| restriction.map_or(true, |r| compartment.has_stratum(r)));
            for compartment in restricted {
                for pair in stratum_refs.windows(2) {
                    self.flows.push(Flow {
                        kind: FlowKind::StrataChange { equilibration },
                        parameter: Name::new(EQUILIBRATION_PARAMETER),
                        source: Some(compartment.with_stratum(pair[0])),
                        target: Some(compartment.with_stratum(pair[1])),
                        implement: level,
                        strain: None,
                    });
                }
            }
        }

        if plan.stratification.is_strain() {
            self.strains = stratum_refs
                .iter()
                .zip(&plan.stratification.strata)
                .map(|(stratum, label)| (label.clone(), *stratum))
                .collect();
        }

        info!(
            strata = plan.strata_count(),
            full = plan.stratification.full,
            compartments = self.compartments.len(),
            flows = reworked,
            "applied stratification"
        );
        Ok(())
    }

    /// Parameter for the flow clone belonging to `stratum`
    fn adjusted_parameter(
        &mut self,
        parameter: &Name,
        stratum: usize,
        stratum_ref: StratumRef,
        plan: &StratificationPlan,
        split_by_default: bool,
    ) -> Name {
        if let Some(adjustment) = plan.adjustment_for(parameter) {
            return match adjustment.values.get(&stratum) {
                Some(value) => {
                    let adjusted = parameter.with_stratum(stratum_ref);
                    debug!(
                        parameter = %self.render(&adjusted),
                        overwrite = adjustment.overwrite.contains(&stratum),
                        "adjusting parameter"
                    );
                    self.parameters.set(adjusted.clone(), value.clone());
                    if adjustment.overwrite.contains(&stratum) {
                        self.parameters.mark_overwrite(adjusted.clone());
                    }
                    adjusted
                }
                None => parameter.clone(),
            };
        }

        if split_by_default {
            let adjusted = parameter.with_stratum(stratum_ref);
            debug!(parameter = %self.render(&adjusted), "splitting parameter into equal parts");
            self.parameters.set(
                adjusted.clone(),
                ParameterValue::Constant(1.0 / plan.strata_count() as f64),
            );
            return adjusted;
        }

        debug!(parameter = %self.render(parameter), "retaining existing parameter");
        parameter.clone()
    }

    fn stratify_flow(
        &mut self,
        flow: &Flow,
        plan: &StratificationPlan,
        stratum_refs: &[StratumRef],
        level: usize,
    ) -> Result<Vec<Flow>, ModelError> {
        let source_split = plan.stratifies(flow.source.as_ref());
        let target_split = plan.stratifies(flow.target.as_ref());
        let pass_through = || Flow {
            implement: level,
            ..flow.clone()
        };

        let extend = |compartment: &Option<Name>, split: bool, stratum: StratumRef| {
            compartment.as_ref().map(|name| {
                if split {
                    name.with_stratum(stratum)
                } else {
                    name.clone()
                }
            })
        };

        let mut new_flows = Vec::new();
        match &flow.kind {
            FlowKind::Entry => {
                if !target_split {
                    return Ok(vec![pass_through()]);
                }
                for (stratum, stratum_ref) in stratum_refs.iter().enumerate() {
                    let parameter = flow.parameter.with_stratum(*stratum_ref);
                    self.parameters
                        .set(parameter.clone(), plan.entry_fractions[stratum].clone());
                    new_flows.push(Flow {
                        parameter,
                        target: extend(&flow.target, true, *stratum_ref),
                        implement: level,
                        ..flow.clone()
                    });
                }
            }
            FlowKind::StrataChange { .. } => {
                if !source_split {
                    return Ok(vec![pass_through()]);
                }
                for stratum_ref in stratum_refs {
                    new_flows.push(Flow {
                        source: extend(&flow.source, true, *stratum_ref),
                        target: extend(&flow.target, target_split, *stratum_ref),
                        implement: level,
                        ..flow.clone()
                    });
                }
            }
            FlowKind::CompartmentDeath => {
                if !source_split {
                    return Ok(vec![pass_through()]);
                }
                for (stratum, stratum_ref) in stratum_refs.iter().enumerate() {
                    let parameter =
                        self.adjusted_parameter(&flow.parameter, stratum, *stratum_ref, plan, false);
                    new_flows.push(Flow {
                        parameter,
                        source: extend(&flow.source, true, *stratum_ref),
                        implement: level,
                        ..flow.clone()
                    });
                }
            }
            FlowKind::Standard
            | FlowKind::InfectionFrequency
            | FlowKind::InfectionDensity
            | FlowKind::Custom { .. } => {
                if !source_split && !target_split {
                    return Ok(vec![pass_through()]);
                }
                let split_by_default = target_split && !source_split;
                for (stratum, stratum_ref) in stratum_refs.iter().enumerate() {
                    let parameter = self.adjusted_parameter(
                        &flow.parameter,
                        stratum,
                        *stratum_ref,
                        plan,
                        split_by_default,
                    );
                    let strain = if plan.stratification.is_strain() {
                        Some(*stratum_ref)
                    } else {
                        flow.strain
                    };
                    new_flows.push(Flow {
                        kind: flow.kind.clone(),
                        parameter,
                        source: extend(&flow.source, source_split, *stratum_ref),
                        target: extend(&flow.target, target_split, *stratum_ref),
                        implement: level,
                        strain,
                    });
                }
            }
        }
        Ok(new_flows)
    }
}
