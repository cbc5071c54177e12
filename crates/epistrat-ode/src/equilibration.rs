//! Flows that pull a population's distribution across strata toward targets.
//!
//! For each adjacent pair of strata `(i, i+1)` the cumulative current
//! proportion up to `i` is compared with the cumulative target. If the current
//! value is above target, population moves from stratum `i` to `i+1` at
//! `ln(current / target) / K` per person; otherwise it moves back at
//! `ln((1 - current) / (1 - target)) / K` per person of stratum `i+1`.

use epistrat_core::{
    ConfigurationError, ModelError, Name, NumericalError, ParamId, ParameterResolver,
    ParameterValue, StratificationRegistry, StratumRef,
};

/// Placeholder parameter name carried by equilibration flows
pub const EQUILIBRATION_PARAMETER: &str = "strata_change";
/// Equilibration time constant K
pub const STRATA_EQUILIBRATION_FACTOR: f64 = 0.01;
/// Proportions are kept this far from 0 and 1 before taking logarithms
const PROPORTION_FLOOR: f64 = 1e-12;
/// Slack allowed on target proportions summing to one
const TARGET_TOLERANCE: f64 = 1e-9;

/// Target proportions for one stratification within one restriction
#[derive(Clone, Debug, PartialEq)]
pub struct EquilibrationTarget {
    pub stratification: usize,
    /// Stratum of an earlier stratification the targets apply within, or everyone
    pub restriction: Option<StratumRef>,
    /// Targets for every stratum but the last
    pub targets: Vec<ParameterValue>,
}

/// A change flow between adjacent strata
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ChangeFlow {
    pub source: usize,
    pub target: usize,
    /// Stratum of the source compartment
    pub stratum: usize,
}

pub(crate) struct PreparedEquilibration {
    label: String,
    /// Restricted compartments carrying each stratum
    members: Vec<Vec<usize>>,
    targets: Vec<ParamId>,
    flows: Vec<ChangeFlow>,
}

fn clamp_proportion(value: f64) -> f64 {
    value.clamp(PROPORTION_FLOOR, 1.0 - PROPORTION_FLOOR)
}

impl PreparedEquilibration {
    pub(crate) fn new(
        target: &EquilibrationTarget,
        compartments: &[Name],
        flows: Vec<ChangeFlow>,
        registry: &StratificationRegistry,
        resolver: &mut ParameterResolver,
    ) -> Result<Self, ConfigurationError> {
        let stratification = registry
            .get(target.stratification)
            .ok_or_else(|| ConfigurationError::UnknownStratification(format!("#{}", target.stratification)))?;
        let label = match target.restriction {
            Some(restriction) => format!("{} within {}", stratification.name, restriction.render(registry)),
            None => stratification.name.clone(),
        };

        let members = (0..stratification.strata.len())
            .map(|stratum| {
                let stratum = StratumRef::new(target.stratification, stratum);
                compartments
                    .iter()
                    .enumerate()
                    .filter(|(_, name)| target.restriction.map_or(true, |r| name.has_stratum(r)))
                    .filter(|(_, name)| name.has_stratum(stratum))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();

        let targets = target
            .targets
            .iter()
            .zip(&stratification.strata)
            .map(|(value, stratum)| {
                let label = Name::new(format!("target_{}_{}", stratification.name, stratum));
                resolver.register_value(label, value)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            label,
            members,
            targets,
            flows,
        })
    }

    fn cumulative_targets(&self, resolver: &ParameterResolver, time: f64) -> Result<Vec<f64>, ModelError> {
        let invalid = |reason: String| NumericalError::InvalidTargetProportions {
            time,
            stratification: self.label.clone(),
            reason,
        };

        let mut cumulative = Vec::with_capacity(self.targets.len());
        let mut running = 0.0;
        for &id in &self.targets {
            let value = resolver.resolve(id, time)?;
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!("target {} is not a valid proportion", value)).into());
            }
            running += value;
            cumulative.push(running);
        }
        if running > 1.0 + TARGET_TOLERANCE {
            return Err(invalid(format!("targets sum to {}", running)).into());
        }
        Ok(cumulative)
    }

    /// Add the equilibration flows to `out`
    pub(crate) fn apply(
        &self,
        values: &[f64],
        time: f64,
        resolver: &ParameterResolver,
        names: &[String],
        out: &mut [f64],
    ) -> Result<(), ModelError> {
        if self.flows.is_empty() {
            return Ok(());
        }

        let totals: Vec<f64> = self
            .members
            .iter()
            .map(|members| members.iter().map(|&i| values[i]).sum())
            .collect();
        let total: f64 = totals.iter().sum();
        if total <= 0.0 {
            return Ok(());
        }
        let mut running = 0.0;
        let current: Vec<f64> = totals
            .iter()
            .map(|value| {
                running += value / total;
                running
            })
            .collect();
        let targets = self.cumulative_targets(resolver, time)?;

        for flow in &self.flows {
            let (Some(&current), Some(&target)) = (current.get(flow.stratum), targets.get(flow.stratum)) else {
                continue;
            };
            let (current, target) = (clamp_proportion(current), clamp_proportion(target));
            let (take, give, numerator, denominator) = if current > target {
                (flow.source, flow.target, current, target)
            } else {
                (flow.target, flow.source, 1.0 - current, 1.0 - target)
            };

            let net = (numerator / denominator).ln() / STRATA_EQUILIBRATION_FACTOR * values[take];
            if !net.is_finite() {
                return Err(NumericalError::NonFiniteEquilibration {
                    time,
                    compartment: names[take].clone(),
                }
                .into());
            }
            out[take] -= net;
            out[give] += net;
        }
        Ok(())
    }
}
