//! Sampling configuration, draws, callback sinks and the run loop.
//!
//! [`run_chain`] is the synchronous core of the invoker: it owns one run
//! from initialization to a terminal state, streaming draws and progress
//! messages through the supplied sinks and polling the interrupt flag at
//! every iteration boundary. Cancellation and per-iteration numeric
//! failures are normal outcomes here, not errors: the run always produces
//! a summary, and only the summary's status tells them apart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::chain::{Chain, FixedParamChain, NutsChain, NutsChainOptions};
use crate::model::{DensityError, ModelInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Evaluate at the bound parameter values without proposing moves.
    FixedParam,
    /// Adaptive HMC with no-u-turn trajectories.
    Nuts,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub algorithm: Algorithm,
    /// Defaults to the model's construction seed when absent.
    pub seed: Option<u64>,
    pub num_warmup: u64,
    pub num_draws: u64,
    pub adapt_step_size: bool,
    pub adapt_mass_matrix: bool,
    /// Keep every `thin`-th sampling iteration; zero behaves as one.
    pub thin: u64,
    /// Progress message interval in iterations; zero silences progress.
    pub refresh: u64,
    pub max_depth: u64,
    pub max_energy_error: f64,
}

impl SamplerConfig {
    /// Iterations one run of this configuration performs, warmup included.
    pub fn total_iterations(&self) -> u64 {
        match self.algorithm {
            Algorithm::FixedParam => self.num_draws,
            Algorithm::Nuts => self.num_warmup + self.num_draws,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> SamplerConfig {
        SamplerConfig {
            algorithm: Algorithm::Nuts,
            seed: None,
            num_warmup: 1000,
            num_draws: 1000,
            adapt_step_size: true,
            adapt_mass_matrix: true,
            thin: 1,
            refresh: 100,
            max_depth: 10,
            max_energy_error: 1000.0,
        }
    }
}

/// Per-iteration diagnostics attached to every draw.
#[derive(Debug, Clone, Copy)]
pub struct DrawStats {
    pub logp: f64,
    pub step_size: f64,
    pub depth: u64,
    pub n_steps: u64,
    pub divergent: bool,
    /// The iteration hit a recoverable density failure and was rejected.
    pub numeric_rejection: bool,
    pub energy: f64,
    pub accept_prob: f64,
}

/// One sampler output record, immutable once emitted.
#[derive(Debug, Clone)]
pub struct Draw {
    /// Global iteration index, warmup included, zero based.
    pub iteration: u64,
    pub warmup: bool,
    /// Parameter values in model order.
    pub values: Box<[f64]>,
    pub stats: DrawStats,
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("initialization failed: {0}")]
    BadInit(DensityError),
    #[error("model evaluation failed beyond recovery: {0}")]
    Density(DensityError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Ordered stream of leveled progress and warning messages.
pub trait LogSink: Send {
    fn message(&mut self, level: LogLevel, text: &str);
}

/// Ordered stream of draws, delivered as they are produced.
pub trait DrawSink: Send {
    fn append(&mut self, draw: &Draw);

    /// Whether warmup draws should be forwarded too. They are never part
    /// of the returned chain either way.
    fn wants_warmup(&self) -> bool {
        false
    }
}

pub struct NullLog;

impl LogSink for NullLog {
    fn message(&mut self, _level: LogLevel, _text: &str) {}
}

#[derive(Default)]
pub struct MemoryLog {
    pub messages: Vec<(LogLevel, String)>,
}

impl LogSink for MemoryLog {
    fn message(&mut self, level: LogLevel, text: &str) {
        self.messages.push((level, text.to_string()));
    }
}

/// Clonable log sink that can be read from outside a running worker.
#[derive(Clone, Default)]
pub struct SharedLog {
    messages: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl SharedLog {
    pub fn new() -> SharedLog {
        SharedLog::default()
    }

    /// Remove and return all messages accumulated so far.
    pub fn drain(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut *self.messages.lock().expect("Poisoned log lock"))
    }
}

impl LogSink for SharedLog {
    fn message(&mut self, level: LogLevel, text: &str) {
        self.messages
            .lock()
            .expect("Poisoned log lock")
            .push((level, text.to_string()));
    }
}

pub struct NullDraws;

impl DrawSink for NullDraws {
    fn append(&mut self, _draw: &Draw) {}
}

#[derive(Default)]
pub struct MemoryDraws {
    pub draws: Vec<Draw>,
    pub keep_warmup: bool,
}

impl DrawSink for MemoryDraws {
    fn append(&mut self, draw: &Draw) {
        self.draws.push(draw.clone());
    }

    fn wants_warmup(&self) -> bool {
        self.keep_warmup
    }
}

/// Cooperative cancellation, polled at iteration boundaries.
#[derive(Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> InterruptFlag {
        InterruptFlag::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    WarmingUp,
    Sampling,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::WarmingUp => "warmup",
            RunPhase::Sampling => "sampling",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed(String),
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed(_) => "failed",
        }
    }
}

/// Observable state of a live run.
#[derive(Debug, Clone)]
pub struct RunProgress {
    pub phase: RunPhase,
    /// Completed iterations, warmup included.
    pub iteration: u64,
    pub total: u64,
    pub divergences: u64,
}

impl RunProgress {
    pub fn new(total: u64) -> RunProgress {
        RunProgress {
            phase: RunPhase::Idle,
            iteration: 0,
            total,
            divergences: 0,
        }
    }
}

/// Final record of one run. Partial results are valid output: a cancelled
/// or failed run still carries everything collected before the stop.
#[derive(Debug)]
pub struct RunSummary {
    pub status: RunStatus,
    pub param_names: Vec<String>,
    /// Post-warmup draws, thinned.
    pub draws: Vec<Draw>,
    pub warmup_iterations: u64,
    pub sample_iterations: u64,
    pub divergences: u64,
}

/// The callback sinks one run consumes. They are borrowed, not owned: the
/// invoker decides their lifetime.
pub struct RunSinks<'a> {
    pub logger: &'a mut dyn LogSink,
    pub writer: &'a mut dyn DrawSink,
    pub interrupt: &'a InterruptFlag,
    pub progress: Option<&'a Mutex<RunProgress>>,
}

impl<'a> RunSinks<'a> {
    fn publish(&self, phase: RunPhase, iteration: u64, total: u64, divergences: u64) {
        if let Some(cell) = self.progress {
            *cell.lock().expect("Poisoned progress lock") = RunProgress {
                phase,
                iteration,
                total,
                divergences,
            };
        }
    }
}

/// Drive one run to a terminal state.
pub fn run_chain(
    instance: &ModelInstance,
    config: &SamplerConfig,
    mut sinks: RunSinks<'_>,
) -> RunSummary {
    let seed = config.seed.unwrap_or_else(|| instance.seed());
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let param_names = instance.param_names().to_vec();
    let initial = instance.initial_position();

    let num_warmup = match config.algorithm {
        Algorithm::FixedParam => 0,
        Algorithm::Nuts => config.num_warmup,
    };
    let num_draws = config.num_draws;
    let total = num_warmup + num_draws;
    let thin = config.thin.max(1);

    let mut draws: Vec<Draw> = Vec::with_capacity(num_draws.min(4096) as usize);
    let mut divergences = 0u64;
    let mut warmup_done = 0u64;
    let mut samples_done = 0u64;

    let mut chain: Box<dyn Chain + '_> = match config.algorithm {
        Algorithm::FixedParam => Box::new(FixedParamChain::new(instance.density(), &initial)),
        Algorithm::Nuts => {
            let options = NutsChainOptions {
                num_warmup,
                max_depth: config.max_depth,
                max_energy_error: config.max_energy_error,
                adapt_step_size: config.adapt_step_size,
                adapt_mass_matrix: config.adapt_mass_matrix,
            };
            match NutsChain::new(instance.density(), &initial, options, &mut rng) {
                Ok(chain) => Box::new(chain),
                Err(err) => {
                    sinks
                        .logger
                        .message(LogLevel::Error, &format!("Unable to start sampling: {err}"));
                    return RunSummary {
                        status: RunStatus::Failed(err.to_string()),
                        param_names,
                        draws: Vec::new(),
                        warmup_iterations: 0,
                        sample_iterations: 0,
                        divergences: 0,
                    };
                }
            }
        }
    };

    let forward_warmup = sinks.writer.wants_warmup();
    let mut status = RunStatus::Completed;

    for global in 0..total {
        if sinks.interrupt.is_interrupted() {
            sinks
                .logger
                .message(LogLevel::Info, "Sampling cancelled by host request");
            status = RunStatus::Cancelled;
            break;
        }

        let in_warmup = global < num_warmup;
        let phase = if in_warmup {
            RunPhase::WarmingUp
        } else {
            RunPhase::Sampling
        };

        let (values, stats) = match chain.draw() {
            Ok(draw) => draw,
            Err(err) => {
                sinks
                    .logger
                    .message(LogLevel::Error, &format!("Sampling aborted: {err}"));
                status = RunStatus::Failed(err.to_string());
                break;
            }
        };

        if stats.numeric_rejection {
            sinks.logger.message(
                LogLevel::Warn,
                &format!(
                    "Iteration {}: log density could not be evaluated; proposal rejected",
                    global + 1
                ),
            );
        }

        let draw = Draw {
            iteration: global,
            warmup: in_warmup,
            values,
            stats,
        };

        if in_warmup {
            warmup_done += 1;
            if forward_warmup {
                sinks.writer.append(&draw);
            }
        } else {
            samples_done += 1;
            if stats.divergent {
                divergences += 1;
            }
            if (samples_done - 1) % thin == 0 {
                sinks.writer.append(&draw);
                draws.push(draw);
            }
        }

        if config.refresh > 0 && (global == 0 || (global + 1) % config.refresh == 0 || global + 1 == total)
        {
            let pct = (global + 1) * 100 / total.max(1);
            let tag = if in_warmup { "(Warmup)" } else { "(Sampling)" };
            sinks.logger.message(
                LogLevel::Info,
                &format!("Iteration: {:>4} / {} [{:>3}%]  {}", global + 1, total, pct, tag),
            );
        }

        sinks.publish(phase, global + 1, total, divergences);
    }

    if status == RunStatus::Completed && total > 0 {
        sinks
            .logger
            .message(LogLevel::Info, "Sampling completed normally");
    }

    RunSummary {
        status,
        param_names,
        draws,
        warmup_iterations: warmup_done,
        sample_iterations: samples_done,
        divergences,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LocationScaleUnit, ModelInstance, NormalMeanUnit};
    use crate::var_context::{VarContext, VarValues};
    use pretty_assertions::assert_eq;

    fn instance(unit_is_location_scale: bool, extra: Vec<(&str, Vec<f64>)>) -> ModelInstance {
        let mut triples = vec![(
            "y".to_string(),
            VarValues::Real(vec![0.4, 0.6, 0.5].into()),
            vec![3],
        )];
        for (name, values) in extra {
            let dims = vec![values.len()];
            triples.push((name.to_string(), VarValues::Real(values.into()), dims));
        }
        let context = Arc::new(VarContext::build(triples).unwrap());
        if unit_is_location_scale {
            ModelInstance::new(&LocationScaleUnit, context, 42).unwrap()
        } else {
            ModelInstance::new(&NormalMeanUnit, context, 42).unwrap()
        }
    }

    fn sinks<'a>(
        logger: &'a mut MemoryLog,
        writer: &'a mut MemoryDraws,
        interrupt: &'a InterruptFlag,
    ) -> RunSinks<'a> {
        RunSinks {
            logger,
            writer,
            interrupt,
            progress: None,
        }
    }

    #[test]
    fn fixed_param_returns_exactly_the_bound_values() {
        let instance = instance(true, vec![("mu", vec![0.0]), ("sigma", vec![1.0])]);
        let config = SamplerConfig {
            algorithm: Algorithm::FixedParam,
            num_draws: 10,
            refresh: 0,
            ..SamplerConfig::default()
        };

        let mut logger = MemoryLog::default();
        let mut writer = MemoryDraws::default();
        let interrupt = InterruptFlag::new();
        let summary = run_chain(&instance, &config, sinks(&mut logger, &mut writer, &interrupt));

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.draws.len(), 10);
        assert_eq!(summary.warmup_iterations, 0);
        assert_eq!(summary.param_names, vec!["mu".to_string(), "sigma".to_string()]);
        for draw in summary.draws.iter() {
            assert_eq!(draw.values.as_ref(), &[0.0, 1.0]);
            assert!(!draw.warmup);
        }
        // The writer saw every draw, in order.
        assert_eq!(writer.draws.len(), 10);
    }

    #[test]
    fn nuts_run_completes_with_requested_draw_count() {
        let instance = instance(false, vec![]);
        let config = SamplerConfig {
            algorithm: Algorithm::Nuts,
            num_warmup: 50,
            num_draws: 25,
            refresh: 0,
            ..SamplerConfig::default()
        };

        let mut logger = MemoryLog::default();
        let mut writer = MemoryDraws::default();
        let interrupt = InterruptFlag::new();
        let summary = run_chain(&instance, &config, sinks(&mut logger, &mut writer, &interrupt));

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.draws.len(), 25);
        assert_eq!(summary.warmup_iterations, 50);
        assert_eq!(summary.sample_iterations, 25);
        assert!(summary.draws.iter().all(|d| d.values[0].is_finite()));
        // Warmup draws are not forwarded unless the sink opts in.
        assert_eq!(writer.draws.len(), 25);
    }

    #[test]
    fn warmup_forwarding_is_opt_in() {
        let instance = instance(false, vec![]);
        let config = SamplerConfig {
            algorithm: Algorithm::Nuts,
            num_warmup: 20,
            num_draws: 10,
            refresh: 0,
            ..SamplerConfig::default()
        };

        let mut logger = MemoryLog::default();
        let mut writer = MemoryDraws {
            keep_warmup: true,
            ..MemoryDraws::default()
        };
        let interrupt = InterruptFlag::new();
        let summary = run_chain(&instance, &config, sinks(&mut logger, &mut writer, &interrupt));

        assert_eq!(writer.draws.len(), 30);
        assert!(writer.draws[0].warmup);
        // The returned chain still excludes warmup.
        assert_eq!(summary.draws.len(), 10);
    }

    #[test]
    fn interruption_before_start_yields_cancelled_and_no_draws() {
        let instance = instance(false, vec![]);
        let config = SamplerConfig {
            algorithm: Algorithm::Nuts,
            num_warmup: 100,
            num_draws: 100,
            refresh: 0,
            ..SamplerConfig::default()
        };

        let mut logger = MemoryLog::default();
        let mut writer = MemoryDraws::default();
        let interrupt = InterruptFlag::new();
        interrupt.interrupt();
        let summary = run_chain(&instance, &config, sinks(&mut logger, &mut writer, &interrupt));

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(summary.draws.is_empty());
        assert!(logger
            .messages
            .iter()
            .any(|(_, text)| text.contains("cancelled")));
    }

    #[test]
    fn thinning_keeps_every_nth_draw() {
        let instance = instance(true, vec![("mu", vec![0.0]), ("sigma", vec![1.0])]);
        let config = SamplerConfig {
            algorithm: Algorithm::FixedParam,
            num_draws: 10,
            thin: 3,
            refresh: 0,
            ..SamplerConfig::default()
        };

        let mut logger = MemoryLog::default();
        let mut writer = MemoryDraws::default();
        let interrupt = InterruptFlag::new();
        let summary = run_chain(&instance, &config, sinks(&mut logger, &mut writer, &interrupt));

        // Iterations 0, 3, 6, 9 are kept.
        assert_eq!(summary.draws.len(), 4);
        assert_eq!(summary.sample_iterations, 10);
    }

    #[test]
    fn refresh_messages_follow_the_iteration_format() {
        let instance = instance(true, vec![("mu", vec![0.0]), ("sigma", vec![1.0])]);
        let config = SamplerConfig {
            algorithm: Algorithm::FixedParam,
            num_draws: 4,
            refresh: 2,
            ..SamplerConfig::default()
        };

        let mut logger = MemoryLog::default();
        let mut writer = MemoryDraws::default();
        let interrupt = InterruptFlag::new();
        run_chain(&instance, &config, sinks(&mut logger, &mut writer, &interrupt));

        let progress: Vec<&String> = logger
            .messages
            .iter()
            .filter(|(level, text)| *level == LogLevel::Info && text.starts_with("Iteration:"))
            .map(|(_, text)| text)
            .collect();
        assert!(progress[0].contains("1 / 4"));
        assert!(progress.iter().any(|text| text.contains("(Sampling)")));
    }
}
