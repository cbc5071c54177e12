pub mod compartments;
pub mod flows;
pub mod parameters;
pub mod stratification;
