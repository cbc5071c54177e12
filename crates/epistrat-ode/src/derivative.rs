//! The right-hand side of the model's ODE system.

use crate::model::{BirthApproach, StateView};
use crate::prepared::{PreparedModel, PreparedTransition, TransitionKind};
use crate::solver::OdeSystem;
use epistrat_core::{MixingState, ModelError, NumericalError};

impl PreparedModel {
    fn check_state(&self, values: &[f64], time: f64) -> Result<(), NumericalError> {
        let tolerance = self.options.negative_tolerance;
        match values.iter().position(|value| *value < -tolerance) {
            Some(i) => Err(NumericalError::NegativeCompartment {
                time,
                compartment: self.labels[i].clone(),
                value: values[i],
            }),
            None => Ok(()),
        }
    }

    fn needs_mixing(&self) -> bool {
        self.transitions
            .iter()
            .any(|flow| matches!(flow.kind, TransitionKind::Infection { .. }))
    }

    pub(crate) fn mixing_state(&self, values: &[f64], time: f64) -> Result<Option<MixingState>, ModelError> {
        if self.needs_mixing() {
            Ok(Some(self.mixing.evaluate(values, time)?))
        } else {
            Ok(None)
        }
    }

    /// Population moved per unit time by one transition
    pub(crate) fn transition_flow(
        &self,
        flow: &PreparedTransition,
        values: &[f64],
        time: f64,
        state: Option<&MixingState>,
    ) -> Result<f64, ModelError> {
        let mut rate = self.resolver.resolve(flow.parameter, time)?;
        match &flow.kind {
            TransitionKind::Standard => {}
            TransitionKind::Infection {
                force_index,
                pool,
                density,
            } => {
                rate *= match state {
                    Some(state) => self
                        .mixing
                        .infection_multiplier(state, *pool, *force_index, *density)?,
                    None => 0.0,
                };
            }
            TransitionKind::Custom(function) => {
                rate *= function(time, &StateView::new(&self.index, values));
            }
        }
        Ok(rate * values[flow.source])
    }

    /// Current rate of every transition, in preparation order
    pub(crate) fn transition_flows(&self, values: &[f64], time: f64) -> Result<Vec<f64>, ModelError> {
        let state = self.mixing_state(values, time)?;
        self.transitions
            .iter()
            .map(|flow| self.transition_flow(flow, values, time, state.as_ref()))
            .collect()
    }

    /// Deaths per unit time out of each compartment, from compartment-death
    /// flows and population-wide mortality together
    pub(crate) fn death_flows(&self, values: &[f64], time: f64) -> Result<Vec<f64>, ModelError> {
        let mut deaths = vec![0.0; values.len()];
        for flow in &self.deaths {
            deaths[flow.source] += self.resolver.resolve(flow.parameter, time)? * values[flow.source];
        }
        for (i, &id) in self.mortality.iter().enumerate() {
            deaths[i] += self.resolver.resolve(id, time)? * values[i];
        }
        Ok(deaths)
    }

    fn total_births(&self, values: &[f64], time: f64, total_deaths: f64) -> Result<f64, ModelError> {
        Ok(match self.birth_approach {
            BirthApproach::NoBirth => 0.0,
            BirthApproach::AddCrudeBirthRate => {
                let population: f64 = values.iter().sum();
                self.resolver.resolve(self.crude_birth_rate, time)? * population
            }
            BirthApproach::ReplaceDeaths => total_deaths,
        })
    }

    /// Write the derivative of `values` at `time` into `out`
    pub fn derivative(&self, values: &[f64], time: f64, out: &mut [f64]) -> Result<(), ModelError> {
        self.check_state(values, time)?;
        out.fill(0.0);

        let state = self.mixing_state(values, time)?;
        for flow in &self.transitions {
            let amount = self.transition_flow(flow, values, time, state.as_ref())?;
            out[flow.source] -= amount;
            out[flow.target] += amount;
        }

        let deaths = self.death_flows(values, time)?;
        let mut total_deaths = 0.0;
        for (i, amount) in deaths.iter().enumerate() {
            out[i] -= amount;
            total_deaths += amount;
        }

        let births = self.total_births(values, time, total_deaths)?;
        if births != 0.0 {
            for entry in &self.entries {
                out[entry.target] += births * self.resolver.resolve(entry.parameter, time)?;
            }
        }

        for equilibration in &self.equilibrations {
            equilibration.apply(values, time, &self.resolver, &self.labels, out)?;
        }

        if let Some(i) = out.iter().position(|value| !value.is_finite()) {
            return Err(NumericalError::NonFiniteDerivative {
                time,
                compartment: self.labels[i].clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Allocating form of [`PreparedModel::derivative`]
    pub fn get_derivative(&self, values: &[f64], time: f64) -> Result<Vec<f64>, ModelError> {
        let mut out = vec![0.0; values.len()];
        self.derivative(values, time, &mut out)?;
        Ok(out)
    }
}

impl OdeSystem for PreparedModel {
    fn dimension(&self) -> usize {
        self.names.len()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), ModelError> {
        self.derivative(y, t, dydt)
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{BirthApproach, FlowRequest, ModelDefinition, StratifiedModel};
    use epistrat_core::{ModelError, NumericalError};

    fn sir(birth_approach: BirthApproach) -> ModelDefinition {
        ModelDefinition::new(vec![0.0, 1.0], ["susceptible", "infectious", "recovered"], "susceptible", 1000.0)
            .with_initial_condition("infectious", 100.0)
            .with_parameter("contact_rate", 0.5)
            .with_parameter("recovery_rate", 0.1)
            .with_parameter("universal_death_rate", 0.02)
            .with_parameter("crude_birth_rate", 0.03)
            .with_flow(FlowRequest::infection_frequency("contact_rate", "susceptible", "infectious"))
            .with_flow(FlowRequest::standard("recovery_rate", "infectious", "recovered"))
            .with_birth_approach(birth_approach)
    }

    #[test]
    fn test_sir_derivative() {
        let model = StratifiedModel::new(sir(BirthApproach::NoBirth)).unwrap();
        let prepared = model.prepare_to_run().unwrap();
        let values = [900.0, 100.0, 0.0];
        let out = prepared.get_derivative(&values, 0.0).unwrap();

        let infection = 0.5 * 900.0 * 100.0 / 1000.0;
        let recovery = 0.1 * 100.0;
        assert!((out[0] - (-infection - 0.02 * 900.0)).abs() < 1e-9);
        assert!((out[1] - (infection - recovery - 0.02 * 100.0)).abs() < 1e-9);
        assert!((out[2] - recovery).abs() < 1e-9);
    }

    #[test]
    fn test_replace_deaths_conserves_population() {
        let prepared = StratifiedModel::new(sir(BirthApproach::ReplaceDeaths))
            .unwrap()
            .prepare_to_run()
            .unwrap();
        let out = prepared.get_derivative(&[900.0, 100.0, 0.0], 0.0).unwrap();
        assert!(out.iter().sum::<f64>().abs() < 1e-9);
    }

    #[test]
    fn test_crude_birth_rate() {
        let prepared = StratifiedModel::new(sir(BirthApproach::AddCrudeBirthRate))
            .unwrap()
            .prepare_to_run()
            .unwrap();
        let out = prepared.get_derivative(&[900.0, 100.0, 0.0], 0.0).unwrap();
        let expected = (0.03 - 0.02) * 1000.0;
        assert!((out.iter().sum::<f64>() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_negative_compartment_reported() {
        let prepared = StratifiedModel::new(sir(BirthApproach::NoBirth))
            .unwrap()
            .prepare_to_run()
            .unwrap();
        assert!(prepared.get_derivative(&[900.0, 100.0, -1e-9], 0.0).is_ok());
        match prepared.get_derivative(&[900.0, 100.0, -1.0], 2.5) {
            Err(ModelError::Numerical(NumericalError::NegativeCompartment { time, compartment, .. })) => {
                assert_eq!(time, 2.5);
                assert_eq!(compartment, "recovered");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_custom_flow_uses_state() {
        let definition = ModelDefinition::new(vec![0.0, 1.0], ["susceptible", "vaccinated"], "susceptible", 100.0)
            .with_parameter("vaccination_rate", 0.2)
            .with_flow(FlowRequest::custom(
                "vaccination_rate",
                "susceptible",
                "vaccinated",
                "capacity",
            ));
        let mut model = StratifiedModel::new(definition).unwrap();
        model.add_custom_flow_function("capacity", |_, state| {
            let vaccinated = state.get("vaccinated").unwrap_or(0.0);
            if vaccinated > 50.0 { 0.0 } else { 1.0 }
        });
        let prepared = model.prepare_to_run().unwrap();
        let out = prepared.get_derivative(&[100.0, 0.0], 0.0).unwrap();
        assert!((out[1] - 20.0).abs() < 1e-9);
        let out = prepared.get_derivative(&[40.0, 60.0], 0.0).unwrap();
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_missing_custom_function_rejected() {
        let definition = ModelDefinition::new(vec![0.0], ["a", "b"], "a", 1.0)
            .with_parameter("rate", 1.0)
            .with_flow(FlowRequest::custom("rate", "a", "b", "unregistered"));
        let model = StratifiedModel::new(definition).unwrap();
        assert!(matches!(
            model.prepare_to_run(),
            Err(ModelError::Configuration(epistrat_core::ConfigurationError::MissingCustomFunction(_)))
        ));
    }

    #[test]
    fn test_density_infection() {
        let definition = ModelDefinition::new(vec![0.0], ["susceptible", "infectious"], "susceptible", 100.0)
            .with_initial_condition("infectious", 10.0)
            .with_parameter("beta", 0.01)
            .with_flow(FlowRequest::infection_density("beta", "susceptible", "infectious"));
        let prepared = StratifiedModel::new(definition).unwrap().prepare_to_run().unwrap();
        let out = prepared.get_derivative(&[90.0, 10.0], 0.0).unwrap();
        assert!((out[1] - 0.01 * 90.0 * 10.0).abs() < 1e-9);
    }
}
