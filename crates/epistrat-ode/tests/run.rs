use epistrat_ode::{
    ConfigurationError, DormandPrince, DormandPrinceConfig, FlowRequest, ModelDefinition,
    ModelError, ModelResults, NumericalError, OutputConnection, RunOptions, RungeKutta4,
    RungeKutta4Config, ScaleUp, StratificationRequest, StratifiedModel, TimeVariant, TimeVariantDefinition,
};

fn sir() -> ModelDefinition {
    ModelDefinition::new(
        vec![0.0, 1.0],
        ["susceptible", "infectious", "recovered"],
        "susceptible",
        1000.0,
    )
    .with_initial_condition("infectious", 100.0)
    .with_parameter("contact_rate", 0.5)
    .with_parameter("recovery_rate", 0.1)
    .with_flow(FlowRequest::infection_frequency("contact_rate", "susceptible", "infectious"))
    .with_flow(FlowRequest::standard("recovery_rate", "infectious", "recovered"))
}

fn susceptible_only(times: Vec<f64>) -> ModelDefinition {
    ModelDefinition::new(times, ["susceptible", "infectious"], "susceptible", 1000.0)
}

fn assert_never_negative(results: &ModelResults) {
    let tolerance = RunOptions::default().negative_tolerance;
    for (step, state) in results.outputs().iter().enumerate() {
        for (name, value) in results.compartment_names().iter().zip(state) {
            assert!(*value >= -tolerance, "{} is {} at output {}", name, value, step);
        }
    }
}

fn two_way_split(proportion_a: f64, target_a: f64) -> StratificationRequest {
    StratificationRequest::new("vaccination", ["a", "b"])
        .with_compartments(["susceptible"])
        .with_proportion("a", proportion_a)
        .with_proportion("b", 1.0 - proportion_a)
        .with_target_proportion("all", "a", target_a)
}

#[test]
fn test_risk_stratified_sir_matches_unstratified() {
    let unstratified = StratifiedModel::new(sir()).unwrap().prepare_to_run().unwrap();
    let base = unstratified
        .get_derivative(unstratified.initial_values(), 0.0)
        .unwrap();
    let infectious = unstratified.compartment_index("infectious").unwrap();

    let mut model = StratifiedModel::new(sir()).unwrap();
    model
        .stratify(
            StratificationRequest::new("risk", ["low", "high"])
                .with_compartments(["infectious", "recovered"])
                .with_proportion("low", 0.8)
                .with_proportion("high", 0.2),
        )
        .unwrap();
    let prepared = model.prepare_to_run().unwrap();
    assert_eq!(prepared.compartment_names().len(), 5);

    let y0 = prepared.initial_values().to_vec();
    let index = |name: &str| prepared.compartment_index(name).unwrap();
    assert!((y0[index("infectiousXrisk_low")] - 80.0).abs() < 1e-12);
    assert!((y0[index("infectiousXrisk_high")] - 20.0).abs() < 1e-12);

    let out = prepared.get_derivative(&y0, 0.0).unwrap();
    let total_infectious = out[index("infectiousXrisk_low")] + out[index("infectiousXrisk_high")];
    assert!((total_infectious - base[infectious]).abs() < 1e-9);

    // one Euler step
    let dt = 0.1;
    let stepped: f64 = ["infectiousXrisk_low", "infectiousXrisk_high"]
        .iter()
        .map(|name| y0[index(name)] + dt * out[index(name)])
        .sum();
    let expected = 100.0 + dt * base[infectious];
    assert!((stepped - expected).abs() < 1e-9);
}

#[test]
fn test_stratified_run_tracks_unstratified_run() {
    let times: Vec<f64> = (0..=20).map(f64::from).collect();
    let mut definition = sir();
    definition.times = times.clone();

    let unstratified = StratifiedModel::new(definition.clone())
        .unwrap()
        .prepare_to_run()
        .unwrap()
        .run()
        .unwrap();

    let mut model = StratifiedModel::new(definition).unwrap();
    model
        .stratify(StratificationRequest::new("risk", ["low", "high"]).with_proportion("low", 0.7))
        .unwrap();
    let stratified = model.prepare_to_run().unwrap().run().unwrap();

    let total = unstratified.compartment_series("infectious").unwrap();
    let low = stratified.compartment_series("infectiousXrisk_low").unwrap();
    let high = stratified.compartment_series("infectiousXrisk_high").unwrap();
    for step in 0..times.len() {
        assert!((low[step] + high[step] - total[step]).abs() < 1e-3 * total[step].max(1.0));
    }
}

#[test]
fn test_equilibration_moves_population_toward_target() {
    let mut model = StratifiedModel::new(susceptible_only(vec![0.0, 0.5, 1.0])).unwrap();
    model
        .stratify(
            StratificationRequest::new("vaccination", ["a", "b"])
                .with_compartments(["susceptible"])
                .with_proportion("a", 1.0)
                .with_proportion("b", 0.0)
                .with_target_proportion("all", "a", 0.3),
        )
        .unwrap();
    assert_eq!(model.equilibrations().len(), 1);
    let prepared = model.prepare_to_run().unwrap();
    let a = prepared.compartment_index("susceptibleXvaccination_a").unwrap();
    let b = prepared.compartment_index("susceptibleXvaccination_b").unwrap();

    let out = prepared.get_derivative(prepared.initial_values(), 0.0).unwrap();
    assert!(out[a] < 0.0);
    assert!(out[b] > 0.0);
    assert!((out[a] + out[b]).abs() < 1e-6 * out[b]);

    let results = prepared
        .integrate(&RungeKutta4::new(RungeKutta4Config::default().with_max_step(0.001)))
        .unwrap();
    let series_a = results.compartment_series("susceptibleXvaccination_a").unwrap();
    let series_b = results.compartment_series("susceptibleXvaccination_b").unwrap();
    for step in 0..3 {
        assert!(series_a[step] >= 0.0);
        assert!(series_b[step] >= 0.0);
        assert!((series_a[step] + series_b[step] - 1000.0).abs() < 1e-6);
    }
    assert!((series_a[2] / 1000.0 - 0.3).abs() < 1e-6);
}

#[test]
fn test_default_run_reaches_equilibration_target() {
    let times: Vec<f64> = (0..=10).map(f64::from).collect();
    let mut model = StratifiedModel::new(susceptible_only(times)).unwrap();
    model.stratify(two_way_split(1.0, 0.3)).unwrap();
    let results = model.prepare_to_run().unwrap().run().unwrap();

    assert_never_negative(&results);
    let a = results.compartment_series("susceptibleXvaccination_a").unwrap();
    let b = results.compartment_series("susceptibleXvaccination_b").unwrap();
    assert!(a[1] < a[0]);
    for step in 0..a.len() {
        assert!((a[step] + b[step] - 1000.0).abs() < 1e-6);
    }
    assert!((a[10] / 1000.0 - 0.3).abs() < 1e-4, "final proportion {}", a[10] / 1000.0);

    // starting below the target moves population the other way
    let mut model = StratifiedModel::new(susceptible_only(vec![0.0, 5.0, 10.0])).unwrap();
    model.stratify(two_way_split(0.1, 0.4)).unwrap();
    let results = model.prepare_to_run().unwrap().run().unwrap();
    assert_never_negative(&results);
    let a = results.compartment_series("susceptibleXvaccination_a").unwrap();
    assert!(a[1] > a[0]);
    assert!((a[2] / 1000.0 - 0.4).abs() < 1e-4, "final proportion {}", a[2] / 1000.0);
}

#[test]
fn test_default_run_empties_zero_target_stratum() {
    let mut model = StratifiedModel::new(susceptible_only(vec![0.0, 1.0, 10.0])).unwrap();
    model.stratify(two_way_split(0.5, 0.0)).unwrap();
    let results = model.prepare_to_run().unwrap().run().unwrap();

    assert_never_negative(&results);
    let a = results.compartment_series("susceptibleXvaccination_a").unwrap();
    let b = results.compartment_series("susceptibleXvaccination_b").unwrap();
    assert!(a[2] / 1000.0 < 1e-6, "stratum a still holds {}", a[2]);
    assert!((a[2] + b[2] - 1000.0).abs() < 1e-6);
}

#[test]
fn test_default_run_fast_epidemic_exhausts_susceptibles() {
    let definition = ModelDefinition::new(
        (0..=20).map(|i| f64::from(i) * 10.0).collect(),
        ["susceptible", "infectious", "recovered"],
        "susceptible",
        1e6,
    )
    .with_initial_condition("infectious", 10.0)
    .with_parameter("contact_rate", 3.0)
    .with_parameter("recovery_rate", 0.1)
    .with_flow(FlowRequest::infection_frequency("contact_rate", "susceptible", "infectious"))
    .with_flow(FlowRequest::standard("recovery_rate", "infectious", "recovered"));
    let results = StratifiedModel::new(definition)
        .unwrap()
        .prepare_to_run()
        .unwrap()
        .run()
        .unwrap();

    assert_never_negative(&results);
    for state in results.outputs() {
        assert!((state.iter().sum::<f64>() - 1e6).abs() < 1e-3);
    }
    let susceptible = results.compartment_series("susceptible").unwrap();
    let recovered = results.compartment_series("recovered").unwrap();
    assert!(susceptible[20] < 1.0, "susceptible left {}", susceptible[20]);
    assert!(recovered[20] > 0.999e6);
}

#[test]
fn test_restricted_equilibration_leaves_other_strata_alone() {
    let mut model = StratifiedModel::new(susceptible_only(vec![0.0, 1.0])).unwrap();
    model
        .stratify(StratificationRequest::new("risk", ["low", "high"]))
        .unwrap();
    model
        .stratify(
            StratificationRequest::new("vaccination", ["a", "b"])
                .with_compartments(["susceptible"])
                .with_proportion("a", 1.0)
                .with_proportion("b", 0.0)
                .with_target_proportion("risk_low", "a", 0.5),
        )
        .unwrap();
    let prepared = model.prepare_to_run().unwrap();
    let out = prepared.get_derivative(prepared.initial_values(), 0.0).unwrap();
    let d = |name: &str| out[prepared.compartment_index(name).unwrap()];

    assert!(d("susceptibleXrisk_lowXvaccination_a") < 0.0);
    assert!(d("susceptibleXrisk_lowXvaccination_b") > 0.0);
    assert_eq!(d("susceptibleXrisk_highXvaccination_a"), 0.0);
    assert_eq!(d("susceptibleXrisk_highXvaccination_b"), 0.0);
}

#[test]
fn test_invalid_targets_rejected() {
    let base = || {
        StratificationRequest::new("vaccination", ["a", "b", "c"]).with_compartments(["susceptible"])
    };
    let requests = [
        base().with_target_proportion("all", "a", 0.3),
        base()
            .with_target_proportion("all", "a", 0.8)
            .with_target_proportion("all", "b", 0.4),
        base()
            .with_target_proportion("all", "a", -0.1)
            .with_target_proportion("all", "b", 0.4),
        base()
            .with_target_proportion("risk_low", "a", 0.1)
            .with_target_proportion("risk_low", "b", 0.1),
    ];
    for request in requests {
        let mut model = StratifiedModel::new(susceptible_only(vec![0.0])).unwrap();
        assert!(matches!(
            model.stratify(request),
            Err(ModelError::Configuration(ConfigurationError::InvalidTargetProportions { .. }))
        ));
    }
}

#[test]
fn test_heterogeneous_mixing_force_of_infection() {
    let mut model = StratifiedModel::new(sir()).unwrap();
    model
        .stratify(
            StratificationRequest::new("location", ["urban", "rural"])
                .with_mixing_matrix(vec![vec![0.9, 0.1], vec![0.2, 0.8]]),
        )
        .unwrap();
    let prepared = model.prepare_to_run().unwrap();
    let index = |name: &str| prepared.compartment_index(name).unwrap();

    let mut values = vec![0.0; prepared.compartment_names().len()];
    values[index("susceptibleXlocation_urban")] = 400.0;
    values[index("infectiousXlocation_urban")] = 100.0;
    values[index("susceptibleXlocation_rural")] = 450.0;
    values[index("infectiousXlocation_rural")] = 50.0;
    let out = prepared.get_derivative(&values, 0.0).unwrap();

    let urban_force = 0.9 * 100.0 / 500.0 + 0.1 * 50.0 / 500.0;
    let rural_force = 0.2 * 100.0 / 500.0 + 0.8 * 50.0 / 500.0;
    assert!((out[index("susceptibleXlocation_urban")] + 0.5 * 400.0 * urban_force).abs() < 1e-9);
    assert!((out[index("susceptibleXlocation_rural")] + 0.5 * 450.0 * rural_force).abs() < 1e-9);

    // an empty category contributes nothing
    values[index("susceptibleXlocation_rural")] = 0.0;
    values[index("infectiousXlocation_rural")] = 0.0;
    assert!(prepared.get_derivative(&values, 0.0).is_ok());

    // a category that sums to zero while holding infectious people cannot be mixed
    values[index("susceptibleXlocation_rural")] = -1e-7;
    values[index("infectiousXlocation_rural")] = 1e-7;
    assert!(matches!(
        prepared.get_derivative(&values, 0.0),
        Err(ModelError::Numerical(NumericalError::ZeroMixingDenominator { .. }))
    ));
}

#[test]
fn test_dynamic_mixing_shape_checked() {
    let mut model = StratifiedModel::new(sir()).unwrap();
    model.set_dynamic_mixing(|_| ndarray::Array2::from_elem((2, 2), 1.0));
    let prepared = model.prepare_to_run().unwrap();
    assert!(matches!(
        prepared.get_derivative(prepared.initial_values(), 0.0),
        Err(ModelError::Configuration(ConfigurationError::DynamicMixingShape { .. }))
    ));

    let mut model = StratifiedModel::new(sir()).unwrap();
    model.set_dynamic_mixing(|t| ndarray::Array2::from_elem((1, 1), if t < 5.0 { 1.0 } else { 0.0 }));
    let prepared = model.prepare_to_run().unwrap();
    let late = prepared.get_derivative(prepared.initial_values(), 10.0).unwrap();
    let s = prepared.compartment_index("susceptible").unwrap();
    assert_eq!(late[s], 0.0);
}

#[test]
fn test_time_variant_parameters() {
    let definition = sir()
        .with_parameter("seasonal_contact", "seasonal")
        .with_parameter("scaled_recovery", "ramp")
        .with_time_variant(
            "seasonal",
            TimeVariantDefinition::Formula("contact_rate * (1 + 0.1 * t)".to_string()),
        )
        .with_time_variant(
            "ramp",
            TimeVariantDefinition::ScaleUp(ScaleUp::new(vec![0.0, 10.0], vec![0.0, 1.0]).unwrap()),
        )
        .with_flow(FlowRequest::standard("seasonal_contact", "susceptible", "recovered"))
        .with_flow(FlowRequest::standard("scaled_recovery", "infectious", "recovered"));
    let mut model = StratifiedModel::new(definition).unwrap();
    model.add_time_variant("unused", TimeVariant::function(|t| t * t));
    let prepared = model.prepare_to_run().unwrap();

    assert!((prepared.parameter_value("seasonal_contact", 2.0).unwrap() - 0.6).abs() < 1e-12);
    assert!((prepared.parameter_value("scaled_recovery", 5.0).unwrap() - 0.5).abs() < 1e-12);
    assert!((prepared.parameter_value("scaled_recovery", 50.0).unwrap() - 1.0).abs() < 1e-12);
}

#[test]
fn test_unknown_time_variant_reported_at_prepare() {
    let definition = sir()
        .with_parameter("seasonal_contact", "missing")
        .with_flow(FlowRequest::standard("seasonal_contact", "susceptible", "recovered"));
    let model = StratifiedModel::new(definition).unwrap();
    assert!(matches!(
        model.prepare_to_run(),
        Err(ModelError::Configuration(ConfigurationError::UnknownTimeVariant(_)))
    ));
}

#[test]
fn test_solvers_agree_with_exponential_decay() {
    let times: Vec<f64> = (0..=10).map(f64::from).collect();
    let definition = ModelDefinition::new(times.clone(), ["infectious", "recovered"], "infectious", 1000.0)
        .with_infectious_compartments(["infectious"])
        .with_parameter("recovery_rate", 0.3)
        .with_flow(FlowRequest::standard("recovery_rate", "infectious", "recovered"));
    let prepared = StratifiedModel::new(definition).unwrap().prepare_to_run().unwrap();

    let rk4 = prepared
        .integrate(&RungeKutta4::new(RungeKutta4Config::default().with_max_step(0.01)))
        .unwrap();
    let dopri = prepared
        .integrate(&DormandPrince::new(DormandPrinceConfig::default().with_tolerances(1e-10, 1e-10)))
        .unwrap();
    for (label, results) in [("rk4", rk4), ("dopri", dopri)] {
        let infectious = results.compartment_series("infectious").unwrap();
        let recovered = results.compartment_series("recovered").unwrap();
        for (step, t) in times.iter().enumerate() {
            let expected = 1000.0 * (-0.3 * t).exp();
            assert!((infectious[step] - expected).abs() < 1e-4, "{} at t={}", label, t);
            assert!((infectious[step] + recovered[step] - 1000.0).abs() < 1e-6);
        }
    }
}

#[test]
fn test_negative_state_aborts_run() {
    let definition = ModelDefinition::new(vec![0.0, 10.0], ["infectious", "recovered"], "infectious", 1.0)
        .with_parameter("recovery_rate", 500.0)
        .with_flow(FlowRequest::standard("recovery_rate", "infectious", "recovered"));
    let prepared = StratifiedModel::new(definition).unwrap().prepare_to_run().unwrap();
    // one coarse step overshoots far below zero and may not be shortened
    let result = prepared.integrate(&RungeKutta4::new(
        RungeKutta4Config::default().with_max_step(1.0).with_min_step(1.0),
    ));
    assert!(matches!(
        result,
        Err(ModelError::Numerical(NumericalError::NegativeCompartment { .. }))
    ));
}

#[test]
fn test_output_connections_with_conditions() {
    let definition = sir().with_output_connection(
        "incidence_low",
        OutputConnection {
            source: "susceptible".to_string(),
            target: "infectious".to_string(),
            source_condition: Vec::new(),
            target_condition: vec!["risk_low".to_string()],
        },
    )
    .with_death_output_category(["risk_high"]);
    let mut model = StratifiedModel::new(definition.with_parameter("universal_death_rate", 0.01)).unwrap();
    model
        .stratify(
            StratificationRequest::new("risk", ["low", "high"])
                .with_compartments(["infectious", "recovered"])
                .with_proportion("low", 0.8)
                .with_proportion("high", 0.2),
        )
        .unwrap();
    let results = model.prepare_to_run().unwrap().run().unwrap();

    let incidence = results.derived_output_series("incidence_low").unwrap();
    let expected = 0.25 * 900.0 * 100.0 / 1000.0;
    assert!((incidence[0] - expected).abs() < 1e-9);

    let high_deaths = results.derived_output_series("total_deathsXrisk_high").unwrap();
    assert!((high_deaths[0] - 0.01 * 20.0).abs() < 1e-12);
    let deaths = results.derived_output_series("total_deaths").unwrap();
    assert!((deaths[0] - 0.01 * 1000.0).abs() < 1e-9);
}
