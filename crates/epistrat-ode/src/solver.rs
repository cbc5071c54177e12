//! ODE integrators driving a prepared model.
//!
//! - [`RungeKutta4`]: classical fixed-step fourth-order method, with the
//!   step capped at `max_step` between requested times.
//! - [`DormandPrince`]: adaptive Dormand–Prince 4(5) pair with error control.
//!
//! Both return the state exactly at every requested time; steps are shortened
//! to land on each one. A trial state the system rejects as negative is
//! retried with a shorter step, and only reported once the step cannot shrink
//! further.

use epistrat_core::{ConfigurationError, ModelError, NumericalError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Right-hand side of an ODE system `dy/dt = f(t, y)`
pub trait OdeSystem {
    /// Number of state variables
    fn dimension(&self) -> usize;

    /// Evaluate `f(t, y)` into `dydt`; both slices have length `dimension()`
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), ModelError>;
}

/// Integrates an [`OdeSystem`] from `times[0]`, returning one state per time
pub trait Integrator {
    fn integrate<S: OdeSystem + ?Sized>(
        &self,
        system: &S,
        y0: &[f64],
        times: &[f64],
    ) -> Result<Vec<Vec<f64>>, ModelError>;
}

fn check_inputs<S: OdeSystem + ?Sized>(system: &S, y0: &[f64], times: &[f64]) -> Result<(), ConfigurationError> {
    if y0.len() != system.dimension() {
        return Err(ConfigurationError::Solver(format!(
            "initial state has {} values, system has {}",
            y0.len(),
            system.dimension()
        )));
    }
    if times.iter().any(|t| !t.is_finite()) {
        return Err(ConfigurationError::Solver("requested times must be finite".to_string()));
    }
    if times.windows(2).any(|w| w[1] < w[0]) {
        return Err(ConfigurationError::UnsortedTimes);
    }
    Ok(())
}

/// Whether `error` came from a trial state a shorter step can avoid, such as
/// a stage overshooting a compartment below zero
fn is_step_rejection(error: &ModelError) -> bool {
    matches!(
        error,
        ModelError::Numerical(NumericalError::NegativeCompartment { .. })
    )
}

/// Step multiplier after a rejected trial state
const REJECTION_SHRINK: f64 = 0.25;

/// Settings for [`RungeKutta4`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RungeKutta4Config {
    /// Largest internal step between requested times
    pub max_step: f64,
    /// Steps are halved down to this size when a trial state is rejected
    pub min_step: f64,
}

impl Default for RungeKutta4Config {
    fn default() -> Self {
        Self {
            max_step: 0.1,
            min_step: 1e-10,
        }
    }
}

impl RungeKutta4Config {
    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_min_step(mut self, min_step: f64) -> Self {
        self.min_step = min_step;
        self
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.max_step.is_finite() && self.max_step > 0.0) {
            return Err(ConfigurationError::Solver("max_step must be finite and > 0".to_string()));
        }
        if !(self.min_step.is_finite() && self.min_step > 0.0) {
            return Err(ConfigurationError::Solver("min_step must be finite and > 0".to_string()));
        }
        Ok(())
    }
}

/// Classical fourth-order Runge–Kutta with a fixed maximum step
#[derive(Debug, Clone, Default)]
pub struct RungeKutta4 {
    config: RungeKutta4Config,
}

impl RungeKutta4 {
    pub fn new(config: RungeKutta4Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RungeKutta4Config {
        &self.config
    }
}

struct Rk4Stages {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    /// `f` at the end of the step, the next step's `k1`
    k_next: Vec<f64>,
    y_tmp: Vec<f64>,
    y_new: Vec<f64>,
}

impl Rk4Stages {
    fn new(n: usize) -> Self {
        Self {
            k1: vec![0.0; n],
            k2: vec![0.0; n],
            k3: vec![0.0; n],
            k4: vec![0.0; n],
            k_next: vec![0.0; n],
            y_tmp: vec![0.0; n],
            y_new: vec![0.0; n],
        }
    }

    /// One step of size `h` from `(t, y)` with `k1` already evaluated. The end
    /// state is evaluated too, so an accepted state has passed the system's checks.
    fn attempt<S: OdeSystem + ?Sized>(&mut self, system: &S, t: f64, y: &[f64], h: f64) -> Result<(), ModelError> {
        let n = y.len();
        let Self {
            k1,
            k2,
            k3,
            k4,
            k_next,
            y_tmp,
            y_new,
        } = self;

        for i in 0..n {
            y_tmp[i] = y[i] + 0.5 * h * k1[i];
        }
        system.rhs(t + 0.5 * h, y_tmp.as_slice(), k2.as_mut_slice())?;
        for i in 0..n {
            y_tmp[i] = y[i] + 0.5 * h * k2[i];
        }
        system.rhs(t + 0.5 * h, y_tmp.as_slice(), k3.as_mut_slice())?;
        for i in 0..n {
            y_tmp[i] = y[i] + h * k3[i];
        }
        system.rhs(t + h, y_tmp.as_slice(), k4.as_mut_slice())?;
        for i in 0..n {
            y_new[i] = y[i] + h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
        }
        system.rhs(t + h, y_new.as_slice(), k_next.as_mut_slice())
    }
}

impl Integrator for RungeKutta4 {
    fn integrate<S: OdeSystem + ?Sized>(
        &self,
        system: &S,
        y0: &[f64],
        times: &[f64],
    ) -> Result<Vec<Vec<f64>>, ModelError> {
        check_inputs(system, y0, times)?;
        self.config.validate()?;
        let Some(&t0) = times.first() else {
            return Ok(Vec::new());
        };

        let mut stages = Rk4Stages::new(y0.len());
        let mut t = t0;
        let mut y = y0.to_vec();
        let mut solution = Vec::with_capacity(times.len());
        solution.push(y.clone());
        system.rhs(t, &y, &mut stages.k1)?;
        let mut steps = 0usize;
        let mut rejected = 0usize;

        for &t_out in &times[1..] {
            let span = t_out - t;
            if span > 0.0 {
                let count = (span / self.config.max_step).ceil().max(1.0);
                let nominal = span / count;
                let mut h = nominal;
                while t < t_out {
                    let remaining = t_out - t;
                    // absorbs rounding left over from summing equal steps
                    let lands = h >= remaining * (1.0 - 1e-9);
                    let step = if lands { remaining } else { h };
                    match stages.attempt(system, t, &y, step) {
                        Ok(()) => {
                            y.copy_from_slice(&stages.y_new);
                            std::mem::swap(&mut stages.k1, &mut stages.k_next);
                            t = if lands { t_out } else { t + step };
                            steps += 1;
                            h = nominal;
                        }
                        Err(error) if is_step_rejection(&error) => {
                            rejected += 1;
                            if 0.5 * step < self.config.min_step {
                                return Err(error);
                            }
                            h = 0.5 * step;
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
            t = t_out;
            solution.push(y.clone());
        }

        debug!(steps, rejected, "runge-kutta integration finished");
        Ok(solution)
    }
}

/// Settings for [`DormandPrince`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DormandPrinceConfig {
    /// Relative tolerance
    pub rtol: f64,
    /// Absolute tolerance
    pub atol: f64,
    /// Initial step size; zero picks one from the first interval
    pub h0: f64,
    pub h_min: f64,
    pub h_max: f64,
    /// Step attempts allowed across the whole run
    pub max_steps: usize,
}

impl Default for DormandPrinceConfig {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-9,
            h0: 0.0,
            h_min: 1e-14,
            h_max: f64::INFINITY,
            max_steps: 100_000,
        }
    }
}

impl DormandPrinceConfig {
    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_initial_step(mut self, h0: f64) -> Self {
        self.h0 = h0;
        self
    }

    pub fn with_step_bounds(mut self, h_min: f64, h_max: f64) -> Self {
        self.h_min = h_min;
        self.h_max = h_max;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.rtol.is_finite() || self.rtol <= 0.0 {
            return Err(ConfigurationError::Solver("rtol must be finite and > 0".to_string()));
        }
        if !self.atol.is_finite() || self.atol <= 0.0 {
            return Err(ConfigurationError::Solver("atol must be finite and > 0".to_string()));
        }
        if self.h_min <= 0.0 || self.h_max < self.h_min {
            return Err(ConfigurationError::Solver("step bounds must satisfy 0 < h_min <= h_max".to_string()));
        }
        if self.max_steps == 0 {
            return Err(ConfigurationError::Solver("max_steps must be > 0".to_string()));
        }
        Ok(())
    }

    fn initial_step(&self, span: f64) -> f64 {
        if self.h0 > 0.0 {
            self.h0
        } else {
            (span * 1e-3).max(self.h_min).min(self.h_max)
        }
    }
}

// Dormand–Prince coefficients
const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 4th-order weights
const B1: f64 = 5179.0 / 57600.0;
const B3: f64 = 7571.0 / 16695.0;
const B4: f64 = 393.0 / 640.0;
const B5: f64 = -92097.0 / 339200.0;
const B6: f64 = 187.0 / 2100.0;
const B7: f64 = 1.0 / 40.0;

// 5th-order weights, used to advance
const BH1: f64 = 35.0 / 384.0;
const BH3: f64 = 500.0 / 1113.0;
const BH4: f64 = 125.0 / 192.0;
const BH5: f64 = -2187.0 / 6784.0;
const BH6: f64 = 11.0 / 84.0;

const E1: f64 = BH1 - B1;
const E3: f64 = BH3 - B3;
const E4: f64 = BH4 - B4;
const E5: f64 = BH5 - B5;
const E6: f64 = BH6 - B6;
const E7: f64 = -B7;

/// Adaptive Dormand–Prince 4(5)
#[derive(Debug, Clone, Default)]
pub struct DormandPrince {
    config: DormandPrinceConfig,
}

struct Stages {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    k7: Vec<f64>,
    y_tmp: Vec<f64>,
    y_new: Vec<f64>,
}

impl Stages {
    fn new(n: usize) -> Self {
        Self {
            k1: vec![0.0; n],
            k2: vec![0.0; n],
            k3: vec![0.0; n],
            k4: vec![0.0; n],
            k5: vec![0.0; n],
            k6: vec![0.0; n],
            k7: vec![0.0; n],
            y_tmp: vec![0.0; n],
            y_new: vec![0.0; n],
        }
    }

    /// Attempt one step of size `h` from `(t, y)`, with `k1 = f(t, y)` already
    /// evaluated. Leaves the candidate in `y_new` and returns the error norm.
    fn attempt<S: OdeSystem + ?Sized>(
        &mut self,
        system: &S,
        config: &DormandPrinceConfig,
        t: f64,
        y: &[f64],
        h: f64,
    ) -> Result<f64, ModelError> {
        let n = y.len();
        let Self {
            k1,
            k2,
            k3,
            k4,
            k5,
            k6,
            k7,
            y_tmp,
            y_new,
        } = self;

        for i in 0..n {
            y_tmp[i] = y[i] + h * A21 * k1[i];
        }
        system.rhs(t + h / 5.0, y_tmp.as_slice(), k2.as_mut_slice())?;

        for i in 0..n {
            y_tmp[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
        }
        system.rhs(t + 3.0 * h / 10.0, y_tmp.as_slice(), k3.as_mut_slice())?;

        for i in 0..n {
            y_tmp[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
        }
        system.rhs(t + 4.0 * h / 5.0, y_tmp.as_slice(), k4.as_mut_slice())?;

        for i in 0..n {
            y_tmp[i] = y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
        }
        system.rhs(t + 8.0 * h / 9.0, y_tmp.as_slice(), k5.as_mut_slice())?;

        for i in 0..n {
            y_tmp[i] = y[i] + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
        }
        system.rhs(t + h, y_tmp.as_slice(), k6.as_mut_slice())?;

        for i in 0..n {
            y_new[i] = y[i] + h * (BH1 * k1[i] + BH3 * k3[i] + BH4 * k4[i] + BH5 * k5[i] + BH6 * k6[i]);
        }

        // FSAL
        system.rhs(t + h, y_new.as_slice(), k7.as_mut_slice())?;

        let mut err_norm = 0.0;
        for i in 0..n {
            let ei = h * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i]);
            let sc = config.atol + config.rtol * y[i].abs().max(y_new[i].abs());
            err_norm += (ei / sc) * (ei / sc);
        }
        if n == 0 {
            return Ok(0.0);
        }
        Ok((err_norm / n as f64).sqrt())
    }
}

impl DormandPrince {
    pub fn new(config: DormandPrinceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DormandPrinceConfig {
        &self.config
    }
}

impl Integrator for DormandPrince {
    fn integrate<S: OdeSystem + ?Sized>(
        &self,
        system: &S,
        y0: &[f64],
        times: &[f64],
    ) -> Result<Vec<Vec<f64>>, ModelError> {
        self.config.validate()?;
        check_inputs(system, y0, times)?;
        let (Some(&t0), Some(&t_end)) = (times.first(), times.last()) else {
            return Ok(Vec::new());
        };

        let config = &self.config;
        let n = y0.len();
        let mut stages = Stages::new(n);
        let mut t = t0;
        let mut y = y0.to_vec();
        let mut h = config.initial_step(t_end - t0);
        let mut solution = Vec::with_capacity(times.len());
        solution.push(y.clone());

        system.rhs(t, &y, &mut stages.k1)?;
        let mut attempts = 0usize;
        let mut rejected = 0usize;

        for &t_out in &times[1..] {
            while t < t_out {
                if attempts >= config.max_steps {
                    return Err(NumericalError::StepBudgetExceeded {
                        time: t,
                        max_steps: config.max_steps,
                    }
                    .into());
                }
                attempts += 1;

                let remaining = t_out - t;
                let lands = h >= remaining;
                let step = if lands { remaining } else { h };
                let err_norm = match stages.attempt(system, config, t, &y, step) {
                    Ok(err_norm) => err_norm,
                    Err(error) if is_step_rejection(&error) => {
                        rejected += 1;
                        if step <= config.h_min {
                            return Err(error);
                        }
                        h = (step * REJECTION_SHRINK).max(config.h_min);
                        continue;
                    }
                    Err(error) => return Err(error),
                };

                if err_norm <= 1.0 {
                    t = if lands { t_out } else { t + step };
                    y.copy_from_slice(&stages.y_new);
                    std::mem::swap(&mut stages.k1, &mut stages.k7);
                } else {
                    rejected += 1;
                    if step <= config.h_min {
                        return Err(NumericalError::StepSizeUnderflow { time: t }.into());
                    }
                }

                let factor = if err_norm == 0.0 {
                    5.0
                } else {
                    (0.9 * err_norm.powf(-0.2)).clamp(0.2, 5.0)
                };
                // a shortened landing step should not shrink the next one
                let basis = if lands && err_norm <= 1.0 { h.max(step) } else { step };
                h = (basis * factor).max(config.h_min).min(config.h_max);
            }
            solution.push(y.clone());
        }

        debug!(attempts, rejected, "dormand-prince integration finished");
        Ok(solution)
    }
}
