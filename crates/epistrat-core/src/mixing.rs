//! Heterogeneous mixing between population categories.
//!
//! Each stratification that supplies a mixing matrix multiplies the category
//! set by its strata and the matrix by Kronecker product, so after `age` (n
//! strata) then `location` (m strata) there are n·m categories ordered
//! `age_0Xlocation_a, age_0Xlocation_b, ...` and the matrix is `kron(M_age, M_loc)`.

use crate::error::{ConfigurationError, ModelError, NumericalError};
use crate::names::{Name, SEPARATOR, StratumRef};
use crate::types::stratification::StratificationRegistry;
use ndarray::{Array2, linalg::kron};
use std::collections::HashMap;
use std::sync::Arc;

/// Label of the single category used when no mixing matrix was supplied
pub const ALL_POPULATION: &str = "all_population";
/// Label of the infectious pool combining every strain
pub const ALL_STRAINS: &str = "all_strains";

/// Replacement matrix computed from time, registered by the caller
pub type DynamicMixing = Arc<dyn Fn(f64) -> Array2<f64> + Send + Sync>;

/// Convert nested rows to a square matrix of the expected order
pub fn matrix_from_rows(
    stratification: &str,
    rows: &[Vec<f64>],
    expected: usize,
) -> Result<Array2<f64>, ConfigurationError> {
    let shape_error = |cols: usize| ConfigurationError::MixingMatrixShape {
        stratification: stratification.to_string(),
        expected,
        rows: rows.len(),
        cols,
    };
    let cols = rows.first().map_or(0, Vec::len);
    if rows.len() != expected || rows.iter().any(|row| row.len() != expected) {
        return Err(shape_error(cols));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((expected, expected), flat).map_err(|_| shape_error(cols))
}

/// Mixing categories and combined matrix accumulated across stratifications
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MixingStructure {
    categories: Vec<Vec<StratumRef>>,
    matrix: Option<Array2<f64>>,
}

impl MixingStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the matrix of a newly applied stratification
    pub fn combine(&mut self, stratification: usize, matrix: Array2<f64>) {
        let strata = matrix.nrows();
        match self.matrix.take() {
            None => {
                self.categories = (0..strata)
                    .map(|s| vec![StratumRef::new(stratification, s)])
                    .collect();
                self.matrix = Some(matrix);
            }
            Some(existing) => {
                self.categories = self
                    .categories
                    .iter()
                    .flat_map(|category| {
                        (0..strata).map(move |s| {
                            let mut extended = category.clone();
                            extended.push(StratumRef::new(stratification, s));
                            extended
                        })
                    })
                    .collect();
                self.matrix = Some(kron(&existing, &matrix));
            }
        }
    }

    pub fn is_heterogeneous(&self) -> bool {
        self.matrix.is_some()
    }

    /// Category definitions; a single empty category when mixing is homogeneous
    pub fn categories(&self) -> Vec<Vec<StratumRef>> {
        if self.matrix.is_some() {
            self.categories.clone()
        } else {
            vec![Vec::new()]
        }
    }

    /// Combined matrix, `[[1]]` when mixing is homogeneous
    pub fn matrix(&self) -> Array2<f64> {
        self.matrix
            .clone()
            .unwrap_or_else(|| Array2::from_elem((1, 1), 1.0))
    }

    pub fn category_names(&self, registry: &StratificationRegistry) -> Vec<String> {
        if self.matrix.is_none() {
            return vec![ALL_POPULATION.to_string()];
        }
        self.categories
            .iter()
            .map(|category| {
                category
                    .iter()
                    .map(|stratum| stratum.render(registry))
                    .collect::<Vec<_>>()
                    .join(&SEPARATOR.to_string())
            })
            .collect()
    }
}

/// Relative infectiousness by stratum, with compartment-level overrides
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InfectiousnessLevels {
    levels: HashMap<StratumRef, f64>,
    overrides: Vec<(Vec<StratumRef>, f64)>,
}

impl InfectiousnessLevels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_level(&mut self, stratum: StratumRef, level: f64) {
        self.levels.insert(stratum, level);
    }

    /// Compartments carrying all of `strata` get exactly `value`
    pub fn add_override(&mut self, strata: Vec<StratumRef>, value: f64) {
        self.overrides.push((strata, value));
    }

    pub fn multiplier(&self, compartment: &Name) -> f64 {
        let mut multiplier: f64 = compartment
            .strata()
            .iter()
            .filter_map(|stratum| self.levels.get(stratum))
            .product();
        for (strata, value) in &self.overrides {
            if compartment.has_all(strata) {
                multiplier = *value;
            }
        }
        multiplier
    }
}

#[derive(Clone, Debug)]
struct InfectiousPool {
    label: String,
    strain: Option<StratumRef>,
    /// Per category, infectious compartments and their infectiousness
    members: Vec<Vec<(usize, f64)>>,
}

/// Populations needed by infection flows at one evaluation
#[derive(Clone, Debug, Default)]
pub struct MixingState {
    time: f64,
    matrix: Option<Array2<f64>>,
    denominators: Vec<f64>,
    infectious: Vec<Vec<f64>>,
}

impl MixingState {
    pub fn denominators(&self) -> &[f64] {
        &self.denominators
    }

    pub fn infectious(&self, pool: usize) -> Option<&[f64]> {
        self.infectious.get(pool).map(Vec::as_slice)
    }
}

/// Frozen category membership and infectious pools for a prepared model
#[derive(Clone)]
pub struct MixingEngine {
    matrix: Array2<f64>,
    dynamic: Option<DynamicMixing>,
    categories: Vec<Vec<StratumRef>>,
    category_members: Vec<Vec<usize>>,
    pools: Vec<InfectiousPool>,
}

impl MixingEngine {
    /// Precompute category membership and infectious index sets.
    ///
    /// Pool 0 combines every strain; one further pool is added per strain.
    pub fn new(
        structure: &MixingStructure,
        compartments: &[Name],
        infectious_stems: &[String],
        strains: &[(String, StratumRef)],
        infectiousness: &InfectiousnessLevels,
        dynamic: Option<DynamicMixing>,
    ) -> Self {
        let categories = structure.categories();
        let category_members: Vec<Vec<usize>> = categories
            .iter()
            .map(|category| {
                compartments
                    .iter()
                    .enumerate()
                    .filter(|(_, name)| name.has_all(category))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();

        let is_infectious = |name: &Name| infectious_stems.iter().any(|stem| stem == name.stem());
        let pool_members = |strain: Option<StratumRef>| -> Vec<Vec<(usize, f64)>> {
            category_members
                .iter()
                .map(|members| {
                    members
                        .iter()
                        .map(|&i| (i, &compartments[i]))
                        .filter(|(_, name)| is_infectious(name))
                        .filter(|(_, name)| strain.map_or(true, |s| name.has_stratum(s)))
                        .map(|(i, name)| (i, infectiousness.multiplier(name)))
                        .collect()
                })
                .collect()
        };

        let mut pools = vec![InfectiousPool {
            label: ALL_STRAINS.to_string(),
            strain: None,
            members: pool_members(None),
        }];
        for (label, strain) in strains {
            pools.push(InfectiousPool {
                label: label.clone(),
                strain: Some(*strain),
                members: pool_members(Some(*strain)),
            });
        }

        Self {
            matrix: structure.matrix(),
            dynamic,
            categories,
            category_members,
            pools,
        }
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn pool_labels(&self) -> impl Iterator<Item = &str> {
        self.pools.iter().map(|pool| pool.label.as_str())
    }

    /// The unique category whose strata all appear in `source`
    pub fn force_index(&self, source: &Name) -> Result<usize, ConfigurationError> {
        let matches: Vec<usize> = self
            .categories
            .iter()
            .enumerate()
            .filter(|(_, category)| source.has_all(category))
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [index] => Ok(*index),
            _ => Err(ConfigurationError::MixingCategory {
                compartment: source.to_string(),
                matches: matches.len(),
            }),
        }
    }

    /// Pool for a flow's strain, falling back to the combined pool
    pub fn pool_index(&self, strain: Option<StratumRef>) -> usize {
        strain
            .and_then(|strain| self.pools.iter().position(|pool| pool.strain == Some(strain)))
            .unwrap_or(0)
    }

    /// Infectiousness-weighted infectious population of one pool in one category
    pub fn infectious_population(&self, pool: usize, category: usize, values: &[f64]) -> f64 {
        self.pools
            .get(pool)
            .and_then(|pool| pool.members.get(category))
            .map_or(0.0, |members| {
                members.iter().map(|&(i, weight)| values[i] * weight).sum()
            })
    }

    /// Compute denominators and infectious populations for the current state
    pub fn evaluate(&self, values: &[f64], time: f64) -> Result<MixingState, ModelError> {
        let matrix = match &self.dynamic {
            Some(dynamic) => {
                let matrix = dynamic(time);
                let expected = self.categories.len();
                if matrix.dim() != (expected, expected) {
                    return Err(ConfigurationError::DynamicMixingShape {
                        expected,
                        rows: matrix.nrows(),
                        cols: matrix.ncols(),
                    }
                    .into());
                }
                Some(matrix)
            }
            None => None,
        };

        let denominators = self
            .category_members
            .iter()
            .map(|members| members.iter().map(|&i| values[i]).sum())
            .collect();
        let infectious = (0..self.pools.len())
            .map(|pool| {
                (0..self.categories.len())
                    .map(|category| self.infectious_population(pool, category, values))
                    .collect()
            })
            .collect();

        Ok(MixingState {
            time,
            matrix,
            denominators,
            infectious,
        })
    }

    /// Mixing-weighted infectious pressure on category `force_index`.
    ///
    /// Frequency-dependent flows divide each category's infectious population
    /// by its total; density-dependent flows use it directly.
    pub fn infection_multiplier(
        &self,
        state: &MixingState,
        pool: usize,
        force_index: usize,
        density: bool,
    ) -> Result<f64, NumericalError> {
        let matrix = state.matrix.as_ref().unwrap_or(&self.matrix);
        let infectious = match state.infectious.get(pool) {
            Some(infectious) => infectious,
            None => return Ok(0.0),
        };

        let mut total = 0.0;
        for (category, &infected) in infectious.iter().enumerate() {
            let weight = matrix[[force_index, category]];
            if density {
                total += weight * infected;
                continue;
            }
            let denominator = state.denominators[category];
            if denominator == 0.0 {
                if infected != 0.0 {
                    return Err(NumericalError::ZeroMixingDenominator {
                        time: state.time,
                        category,
                    });
                }
                continue;
            }
            total += weight * infected / denominator;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::stratification::Stratification;
    use ndarray::array;

    #[test]
    fn test_matrix_shape_checked() {
        assert!(matrix_from_rows("age", &[vec![1.0, 0.0], vec![0.0, 1.0]], 2).is_ok());
        assert!(matches!(
            matrix_from_rows("age", &[vec![1.0, 0.0]], 2),
            Err(ConfigurationError::MixingMatrixShape { rows: 1, .. })
        ));
        assert!(matrix_from_rows("age", &[vec![1.0], vec![0.0, 1.0]], 2).is_err());
    }

    #[test]
    fn test_combine_is_kronecker_product() {
        let m1 = array![[1.0, 2.0], [3.0, 4.0]];
        let m2 = array![[0.5, 0.0, 1.0], [0.0, 1.0, 0.0], [2.0, 0.0, 1.0]];
        let mut structure = MixingStructure::new();
        structure.combine(0, m1.clone());
        structure.combine(1, m2.clone());

        let combined = structure.matrix();
        assert_eq!(combined.dim(), (6, 6));
        for i in 0..2 {
            for j in 0..2 {
                for k in 0..3 {
                    for l in 0..3 {
                        assert_eq!(combined[[i * 3 + k, j * 3 + l]], m1[[i, j]] * m2[[k, l]]);
                    }
                }
            }
        }
        assert_eq!(structure.categories().len(), 6);
        assert_eq!(
            structure.categories()[4],
            vec![StratumRef::new(0, 1), StratumRef::new(1, 1)]
        );
    }

    #[test]
    fn test_category_names() {
        let mut registry = StratificationRegistry::default();
        registry
            .register(Stratification::new("age", ["0", "5"], ["s"], true))
            .unwrap();
        let mut structure = MixingStructure::new();
        assert_eq!(structure.category_names(&registry), vec![ALL_POPULATION]);
        structure.combine(0, Array2::eye(2));
        assert_eq!(structure.category_names(&registry), vec!["age_0", "age_5"]);
    }

    fn two_group_engine() -> (MixingEngine, Vec<Name>) {
        let young = StratumRef::new(0, 0);
        let old = StratumRef::new(0, 1);
        let compartments = vec![
            Name::new("s").with_stratum(young),
            Name::new("s").with_stratum(old),
            Name::new("i").with_stratum(young),
            Name::new("i").with_stratum(old),
        ];
        let mut structure = MixingStructure::new();
        structure.combine(0, array![[0.9, 0.1], [0.2, 0.8]]);
        let mut levels = InfectiousnessLevels::new();
        levels.set_level(old, 0.5);
        let engine = MixingEngine::new(
            &structure,
            &compartments,
            &["i".to_string()],
            &[],
            &levels,
            None,
        );
        (engine, compartments)
    }

    #[test]
    fn test_frequency_dependent_multiplier() {
        let (engine, compartments) = two_group_engine();
        let values = [90.0, 80.0, 10.0, 20.0];
        let state = engine.evaluate(&values, 0.0).unwrap();
        assert_eq!(state.denominators(), &[100.0, 100.0]);
        // old infectious are half as infectious
        assert_eq!(state.infectious(0).unwrap(), &[10.0, 10.0]);

        let force = engine.force_index(&compartments[0]).unwrap();
        let multiplier = engine.infection_multiplier(&state, 0, force, false).unwrap();
        assert!((multiplier - (0.9 * 0.1 + 0.1 * 0.1)).abs() < 1e-12);

        let density = engine.infection_multiplier(&state, 0, force, true).unwrap();
        assert!((density - (0.9 * 10.0 + 0.1 * 10.0)).abs() < 1e-12);
    }

    #[test]
    fn test_zero_denominator() {
        let (engine, compartments) = two_group_engine();
        let force = engine.force_index(&compartments[1]).unwrap();

        let empty_old = [100.0, 0.0, 0.0, 0.0];
        let state = engine.evaluate(&empty_old, 1.0).unwrap();
        assert_eq!(engine.infection_multiplier(&state, 0, force, false).unwrap(), 0.0);

        let negative_balance = [100.0, -5.0, 0.0, 5.0];
        let state = engine.evaluate(&negative_balance, 2.0).unwrap();
        assert!(matches!(
            engine.infection_multiplier(&state, 0, force, false),
            Err(NumericalError::ZeroMixingDenominator { category: 1, .. })
        ));
    }

    #[test]
    fn test_force_index_requires_unique_category() {
        let (engine, _) = two_group_engine();
        assert!(engine.force_index(&Name::new("s")).is_err());
    }

    #[test]
    fn test_homogeneous_mixing_single_category() {
        let compartments = vec![Name::new("s"), Name::new("i")];
        let engine = MixingEngine::new(
            &MixingStructure::new(),
            &compartments,
            &["i".to_string()],
            &[],
            &InfectiousnessLevels::new(),
            None,
        );
        assert_eq!(engine.category_count(), 1);
        assert_eq!(engine.force_index(&compartments[0]).unwrap(), 0);
        let state = engine.evaluate(&[75.0, 25.0], 0.0).unwrap();
        assert_eq!(engine.infection_multiplier(&state, 0, 0, false).unwrap(), 0.25);
    }

    #[test]
    fn test_override_replaces_multiplier() {
        let young = StratumRef::new(0, 0);
        let vaccinated = StratumRef::new(1, 0);
        let mut levels = InfectiousnessLevels::new();
        levels.set_level(young, 2.0);
        levels.set_level(vaccinated, 0.5);
        let name = Name::new("i").with_stratum(young).with_stratum(vaccinated);
        assert_eq!(levels.multiplier(&name), 1.0);
        levels.add_override(vec![young, vaccinated], 0.1);
        assert_eq!(levels.multiplier(&name), 0.1);
    }

    #[test]
    fn test_dynamic_matrix_shape_checked() {
        let compartments = vec![Name::new("s"), Name::new("i")];
        let dynamic: DynamicMixing = Arc::new(|_| Array2::eye(2));
        let engine = MixingEngine::new(
            &MixingStructure::new(),
            &compartments,
            &["i".to_string()],
            &[],
            &InfectiousnessLevels::new(),
            Some(dynamic),
        );
        assert!(matches!(
            engine.evaluate(&[1.0, 1.0], 0.0),
            Err(ModelError::Configuration(ConfigurationError::DynamicMixingShape { .. }))
        ));
    }
}
