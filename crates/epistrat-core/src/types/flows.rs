use crate::names::{Name, StratumRef};
use serde::{Deserialize, Serialize};

/// Flow types accepted when building a model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowType {
    #[serde(rename = "standard_flows")]
    Standard,
    #[serde(rename = "infection_frequency")]
    InfectionFrequency,
    #[serde(rename = "infection_density")]
    InfectionDensity,
    #[serde(rename = "compartment_death")]
    CompartmentDeath,
    #[serde(rename = "customised_flows")]
    Custom,
}

/// What a flow record does in the derivative
#[derive(Clone, Debug, PartialEq)]
pub enum FlowKind {
    Standard,
    InfectionFrequency,
    InfectionDensity,
    CompartmentDeath,
    /// Births into `target`, scaled by the resolved entry fraction
    Entry,
    /// Equilibration between adjacent strata of one stratification
    StrataChange { equilibration: usize },
    /// Rate multiplied by a registered function of time and state
    Custom { function: String },
}

impl FlowKind {
    pub fn is_infection(&self) -> bool {
        matches!(self, Self::InfectionFrequency | Self::InfectionDensity)
    }

    /// Moves population from a source to a target
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            Self::Standard | Self::InfectionFrequency | Self::InfectionDensity | Self::Custom { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Standard => "standard_flows",
            Self::InfectionFrequency => "infection_frequency",
            Self::InfectionDensity => "infection_density",
            Self::CompartmentDeath => "compartment_death",
            Self::Entry => "entry",
            Self::StrataChange { .. } => "strata_change",
            Self::Custom { .. } => "customised_flows",
        }
    }
}

/// One flow record
#[derive(Clone, Debug, PartialEq)]
pub struct Flow {
    pub kind: FlowKind,
    pub parameter: Name,
    pub source: Option<Name>,
    pub target: Option<Name>,
    /// Number of stratifications applied when the flow was created
    pub implement: usize,
    pub strain: Option<StratumRef>,
}

impl Flow {
    pub fn transition(kind: FlowKind, parameter: Name, source: Name, target: Name, implement: usize) -> Self {
        Self {
            kind,
            parameter,
            source: Some(source),
            target: Some(target),
            implement,
            strain: None,
        }
    }

    pub fn death(parameter: Name, source: Name, implement: usize) -> Self {
        Self {
            kind: FlowKind::CompartmentDeath,
            parameter,
            source: Some(source),
            target: None,
            implement,
            strain: None,
        }
    }

    pub fn entry(parameter: Name, target: Name, implement: usize) -> Self {
        Self {
            kind: FlowKind::Entry,
            parameter,
            source: None,
            target: Some(target),
            implement,
            strain: None,
        }
    }
}

/// Every flow record ever created, tagged by implement level
#[derive(Clone, Debug, Default)]
pub struct FlowRegistry {
    flows: Vec<Flow>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, flow: Flow) -> usize {
        self.flows.push(flow);
        self.flows.len() - 1
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Flow> {
        self.flows.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.iter()
    }

    /// Flows created at exactly `level`
    pub fn at_level(&self, level: usize) -> impl Iterator<Item = &Flow> {
        self.flows.iter().filter(move |flow| flow.implement == level)
    }

    /// Clones of the flows at `level`, for a stratification round to rework
    pub fn snapshot_level(&self, level: usize) -> Vec<Flow> {
        self.at_level(level).cloned().collect()
    }
}
