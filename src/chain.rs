//! Draw-by-draw chain drivers for the two sampling algorithms.

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::mass_matrix::{DiagMassMatrix, RunningVariance};
use crate::model::Density;
use crate::nuts::{init_point, transition, PhasePoint};
use crate::sampler::{DrawStats, RunError};
use crate::stepsize::{DualAverage, DualAverageSettings};

/// Anything that can produce one draw after another.
pub(crate) trait Chain {
    fn dim(&self) -> usize;

    /// Produce the next draw: parameter values in model order plus
    /// per-iteration diagnostics. `Err` means the run cannot continue.
    fn draw(&mut self) -> Result<(Box<[f64]>, DrawStats), RunError>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NutsChainOptions {
    pub num_warmup: u64,
    pub max_depth: u64,
    pub max_energy_error: f64,
    pub adapt_step_size: bool,
    pub adapt_mass_matrix: bool,
}

/// Mass matrix refreshes start once this many warmup draws accumulated.
const FIRST_MASS_UPDATE: u64 = 100;
const MASS_UPDATE_FREQ: u64 = 50;

/// Adaptive HMC with no-u-turn trajectories.
pub(crate) struct NutsChain<'a> {
    density: &'a dyn Density,
    rng: SmallRng,
    mass: DiagMassMatrix,
    step: DualAverage,
    variance: RunningVariance,
    options: NutsChainOptions,
    state: PhasePoint,
    frozen_step: f64,
    draw_count: u64,
}

impl<'a> NutsChain<'a> {
    /// Initialize the chain at `position`. Fails if the density cannot be
    /// evaluated there, which ends the run before it starts.
    pub fn new<R: RngCore>(
        density: &'a dyn Density,
        position: &[f64],
        options: NutsChainOptions,
        rng: &mut R,
    ) -> Result<NutsChain<'a>, RunError> {
        let state = init_point(density, position).map_err(RunError::BadInit)?;
        let dim = density.dim();
        let settings = DualAverageSettings::default();
        Ok(NutsChain {
            density,
            rng: SmallRng::from_rng(rng),
            mass: DiagMassMatrix::new(dim),
            step: DualAverage::new(settings, settings.initial_step),
            variance: RunningVariance::new(dim),
            options,
            state,
            frozen_step: settings.initial_step,
            draw_count: 0,
        })
    }

    fn adapt(&mut self, accept_prob: f64, position: &[f64]) {
        if self.options.adapt_step_size {
            self.step.advance(accept_prob);
        }
        if self.options.adapt_mass_matrix {
            self.variance.add_sample(position);
            let n = self.draw_count + 1;
            if n >= FIRST_MASS_UPDATE && n % MASS_UPDATE_FREQ == 0 {
                if let Some(variance) = self.variance.estimate() {
                    self.mass.update(&variance);
                    let current = self.step.current();
                    self.step.restart(current);
                }
            }
        }
        if self.draw_count + 1 == self.options.num_warmup {
            self.frozen_step = if self.options.adapt_step_size {
                self.step.adapted()
            } else {
                self.step.current()
            };
        }
    }
}

impl Chain for NutsChain<'_> {
    fn dim(&self) -> usize {
        self.density.dim()
    }

    fn draw(&mut self) -> Result<(Box<[f64]>, DrawStats), RunError> {
        let warmup = self.draw_count < self.options.num_warmup;
        let step_size = if warmup {
            self.step.current()
        } else {
            self.frozen_step
        };

        let result = transition(
            self.density,
            &self.mass,
            self.state.clone(),
            step_size,
            self.options.max_depth,
            self.options.max_energy_error,
            &mut self.rng,
        )
        .map_err(RunError::Density)?;

        if warmup {
            self.adapt(result.accept_prob, &result.point.position);
        }

        let stats = DrawStats {
            logp: result.point.logp,
            step_size,
            depth: result.depth,
            n_steps: result.n_leapfrog,
            divergent: result.divergent,
            numeric_rejection: result.numeric_rejection,
            energy: result.energy,
            accept_prob: result.accept_prob,
        };
        let values = result.point.position.clone().into_boxed_slice();

        self.state = result.point;
        self.draw_count += 1;
        Ok((values, stats))
    }
}

/// Evaluates the model at fixed parameter values without proposing moves.
pub(crate) struct FixedParamChain<'a> {
    density: &'a dyn Density,
    values: Vec<f64>,
}

impl<'a> FixedParamChain<'a> {
    pub fn new(density: &'a dyn Density, position: &[f64]) -> FixedParamChain<'a> {
        FixedParamChain {
            density,
            values: position.to_vec(),
        }
    }
}

impl Chain for FixedParamChain<'_> {
    fn dim(&self) -> usize {
        self.density.dim()
    }

    fn draw(&mut self) -> Result<(Box<[f64]>, DrawStats), RunError> {
        let mut gradient = vec![0.0; self.values.len()];
        let (logp, numeric_rejection) =
            match self.density.logp_gradient(&self.values, &mut gradient) {
                Ok(logp) => (logp, false),
                Err(err) if err.is_recoverable() => (f64::NAN, true),
                Err(err) => return Err(RunError::Density(err)),
            };

        let stats = DrawStats {
            logp,
            step_size: 0.0,
            depth: 0,
            n_steps: 0,
            divergent: false,
            numeric_rejection,
            energy: f64::NAN,
            accept_prob: 1.0,
        };
        Ok((self.values.clone().into_boxed_slice(), stats))
    }
}
