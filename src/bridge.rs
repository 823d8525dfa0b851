//! The bridge service object: process-scoped state behind the boundary.
//!
//! One `Bridge` owns everything a host session touches: the table of
//! compiled units, the model/context/run registries and the sampling
//! worker pool. It is passed by reference into every entry point rather
//! than living in a language-level global, and tearing it down releases
//! every remaining native object.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use thiserror::Error;

use crate::invoker::{RunHandle, RunPoll, SamplingPool};
use crate::marshal::ArgumentError;
use crate::model::{CompiledModel, ModelInstance};
use crate::registry::{ModelEntry, Registry, RegistryError};
use crate::sampler::{
    DrawSink, LogLevel, LogSink, NullDraws, RunSummary, SamplerConfig, SharedLog,
};
use crate::var_context::{ContextError, VarContext, VarValues};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("model handle {0} is busy with an active sampling run")]
    Busy(u64),
    #[error("unknown compiled unit {0:?}")]
    UnknownUnit(String),
    #[error("run {0} has not finished")]
    RunActive(u64),
}

impl BridgeError {
    /// Stable atom the host matches on.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Argument(_) => "bad_argument",
            BridgeError::Context(_) => "validation_error",
            BridgeError::Registry(_) => "not_found",
            BridgeError::Busy(_) => "busy",
            BridgeError::UnknownUnit(_) => "unknown_unit",
            BridgeError::RunActive(_) => "run_active",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// Threads in the dedicated sampling pool.
    pub worker_threads: usize,
}

impl Default for BridgeConfig {
    fn default() -> BridgeConfig {
        BridgeConfig { worker_threads: 4 }
    }
}

/// A registered run: the handle plus, for entry-point runs, the pull-based
/// log the host drains.
pub struct RunEntry {
    handle: RunHandle,
    log: Option<SharedLog>,
}

impl RunEntry {
    pub fn handle(&self) -> &RunHandle {
        &self.handle
    }
}

pub struct Bridge {
    units: RwLock<HashMap<String, Arc<dyn CompiledModel>>>,
    models: Registry<ModelEntry>,
    contexts: Registry<VarContext>,
    runs: Registry<RunEntry>,
    pool: SamplingPool,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Bridge> {
        Ok(Bridge {
            units: RwLock::new(HashMap::new()),
            models: Registry::new(),
            contexts: Registry::new(),
            runs: Registry::new(),
            pool: SamplingPool::new(config.worker_threads)?,
        })
    }

    /// Make a compiled unit available under its own name, the way a
    /// statically linked model library announces itself at load time.
    pub fn register_unit(&self, unit: Arc<dyn CompiledModel>) {
        let name = unit.name().to_string();
        self.units
            .write()
            .expect("Poisoned unit table lock")
            .insert(name, unit);
    }

    pub fn unit(&self, name: &str) -> Result<Arc<dyn CompiledModel>, BridgeError> {
        self.units
            .read()
            .expect("Poisoned unit table lock")
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownUnit(name.to_string()))
    }

    /// Build and register a standalone variable context.
    pub fn new_var_context(
        &self,
        triples: impl IntoIterator<Item = (String, VarValues, Vec<usize>)>,
    ) -> Result<u64, BridgeError> {
        let context = VarContext::build(triples)?;
        Ok(self.contexts.insert(context))
    }

    pub fn var_context(&self, handle: u64) -> Result<Arc<VarContext>, BridgeError> {
        Ok(self.contexts.resolve(handle)?)
    }

    pub fn release_var_context(&self, handle: u64) -> Result<(), BridgeError> {
        self.contexts.release(handle)?;
        Ok(())
    }

    /// Instantiate a unit against a context and register the instance.
    ///
    /// Registration happens only after the instance is fully constructed;
    /// a failed build leaves no trace behind.
    pub fn new_model(
        &self,
        unit_name: &str,
        context: Arc<VarContext>,
        seed: u64,
    ) -> Result<u64, BridgeError> {
        let unit = self.unit(unit_name)?;
        let instance = ModelInstance::new(unit.as_ref(), context, seed)?;
        Ok(self.models.insert(ModelEntry::new(instance)))
    }

    pub fn release_model(&self, handle: u64) -> Result<(), BridgeError> {
        self.models.release(handle)?;
        Ok(())
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    /// Start an asynchronous run with an internal log the host polls via
    /// [`Bridge::run_logs`].
    pub fn run_sample(&self, model_handle: u64, config: SamplerConfig) -> Result<u64, BridgeError> {
        let log = SharedLog::new();
        self.start_run(
            model_handle,
            config,
            Box::new(log.clone()),
            Box::new(NullDraws),
            Some(log),
        )
    }

    /// Start an asynchronous run streaming into caller-supplied sinks.
    pub fn run_sample_with_sinks(
        &self,
        model_handle: u64,
        config: SamplerConfig,
        logger: Box<dyn LogSink>,
        writer: Box<dyn DrawSink>,
    ) -> Result<u64, BridgeError> {
        self.start_run(model_handle, config, logger, writer, None)
    }

    fn start_run(
        &self,
        model_handle: u64,
        config: SamplerConfig,
        logger: Box<dyn LogSink>,
        writer: Box<dyn DrawSink>,
        log: Option<SharedLog>,
    ) -> Result<u64, BridgeError> {
        let entry = self.models.resolve(model_handle)?;
        let permit =
            ModelEntry::try_acquire(&entry).ok_or(BridgeError::Busy(model_handle))?;
        let handle = self.pool.spawn_run(permit, config, logger, writer);
        Ok(self.runs.insert(RunEntry { handle, log }))
    }

    pub fn run(&self, run_id: u64) -> Result<Arc<RunEntry>, BridgeError> {
        Ok(self.runs.resolve(run_id)?)
    }

    pub fn poll_run(&self, run_id: u64) -> Result<RunPoll, BridgeError> {
        Ok(self.runs.resolve(run_id)?.handle.poll())
    }

    pub fn interrupt_run(&self, run_id: u64) -> Result<(), BridgeError> {
        self.runs.resolve(run_id)?.handle.interrupt();
        Ok(())
    }

    /// Messages logged by the run since the last drain.
    pub fn run_logs(&self, run_id: u64) -> Result<Vec<(LogLevel, String)>, BridgeError> {
        let entry = self.runs.resolve(run_id)?;
        Ok(entry.log.as_ref().map(|log| log.drain()).unwrap_or_default())
    }

    /// Take the summary of a terminal run and drop the run entry.
    pub fn collect_run(&self, run_id: u64) -> Result<RunSummary, BridgeError> {
        let entry = self.runs.resolve(run_id)?;
        if !entry.handle.is_finished() {
            return Err(BridgeError::RunActive(run_id));
        }
        let summary = entry
            .handle
            .take_summary()
            .ok_or(BridgeError::Registry(RegistryError::NotFound(run_id)))?;
        let _ = self.runs.release(run_id);
        Ok(summary)
    }

    /// Interrupt every live run and drop all registrations. In-flight
    /// workers keep their own references and wind down cooperatively.
    pub fn shutdown(&self) {
        for (_, entry) in self.runs.snapshot() {
            entry.handle.interrupt();
        }
        self.runs.clear();
        self.models.clear();
        self.contexts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LocationScaleUnit, NormalMeanUnit};
    use crate::sampler::Algorithm;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn bridge() -> Bridge {
        let bridge = Bridge::new(BridgeConfig { worker_threads: 2 }).unwrap();
        bridge.register_unit(Arc::new(NormalMeanUnit));
        bridge.register_unit(Arc::new(LocationScaleUnit));
        bridge
    }

    fn data_context() -> Arc<VarContext> {
        Arc::new(
            VarContext::build([(
                "y".to_string(),
                VarValues::Real(vec![0.3, 0.7].into()),
                vec![2],
            )])
            .unwrap(),
        )
    }

    #[test]
    fn model_handles_are_unique_and_release_is_final() {
        let bridge = bridge();
        let first = bridge.new_model("normal_mean", data_context(), 1).unwrap();
        let second = bridge.new_model("normal_mean", data_context(), 2).unwrap();
        assert_ne!(first, second);

        bridge.release_model(first).unwrap();
        assert!(matches!(
            bridge.release_model(first),
            Err(BridgeError::Registry(RegistryError::NotFound(_)))
        ));

        let third = bridge.new_model("normal_mean", data_context(), 3).unwrap();
        assert_ne!(third, first);
    }

    #[test]
    fn unknown_units_fail_without_registration() {
        let bridge = bridge();
        let before = bridge.model_count();
        let err = bridge
            .new_model("no_such_unit", data_context(), 1)
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_unit");
        assert_eq!(bridge.model_count(), before);
    }

    #[test]
    fn failed_construction_registers_nothing() {
        let bridge = bridge();
        let empty = Arc::new(VarContext::default());
        let err = bridge.new_model("normal_mean", empty, 1).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(bridge.model_count(), 0);
    }

    #[test]
    fn second_run_on_same_handle_is_busy_until_the_first_finishes() {
        let bridge = bridge();
        let model = bridge.new_model("normal_mean", data_context(), 7).unwrap();

        let long = SamplerConfig {
            algorithm: Algorithm::Nuts,
            num_warmup: 100_000,
            num_draws: 100_000,
            refresh: 0,
            ..SamplerConfig::default()
        };
        let run = bridge.run_sample(model, long).unwrap();

        let err = bridge.run_sample(model, long).unwrap_err();
        assert_eq!(err.kind(), "busy");

        bridge.interrupt_run(run).unwrap();
        assert!(bridge
            .run(run)
            .unwrap()
            .handle()
            .wait_timeout(Duration::from_secs(30)));

        // The lease is back; a new run starts cleanly.
        let short = SamplerConfig {
            algorithm: Algorithm::FixedParam,
            num_draws: 1,
            refresh: 0,
            ..SamplerConfig::default()
        };
        let second = bridge.run_sample(model, short).unwrap();
        assert!(bridge
            .run(second)
            .unwrap()
            .handle()
            .wait_timeout(Duration::from_secs(30)));
    }

    #[test]
    fn collect_removes_the_run_entry() {
        let bridge = bridge();
        let model = bridge.new_model("normal_mean", data_context(), 7).unwrap();
        let config = SamplerConfig {
            algorithm: Algorithm::FixedParam,
            num_draws: 3,
            refresh: 0,
            ..SamplerConfig::default()
        };
        let run = bridge.run_sample(model, config).unwrap();
        assert!(bridge
            .run(run)
            .unwrap()
            .handle()
            .wait_timeout(Duration::from_secs(30)));

        let summary = bridge.collect_run(run).unwrap();
        assert_eq!(summary.draws.len(), 3);
        assert!(matches!(
            bridge.collect_run(run),
            Err(BridgeError::Registry(RegistryError::NotFound(_)))
        ));
    }

    #[test]
    fn released_models_survive_inflight_runs() {
        let bridge = bridge();
        let model = bridge.new_model("normal_mean", data_context(), 7).unwrap();
        let config = SamplerConfig {
            algorithm: Algorithm::Nuts,
            num_warmup: 50_000,
            num_draws: 50_000,
            refresh: 0,
            ..SamplerConfig::default()
        };
        let run = bridge.run_sample(model, config).unwrap();

        // Handle is gone immediately; the worker keeps its own reference.
        bridge.release_model(model).unwrap();
        assert!(matches!(
            bridge.run_sample(model, config),
            Err(BridgeError::Registry(RegistryError::NotFound(_)))
        ));

        bridge.interrupt_run(run).unwrap();
        assert!(bridge
            .run(run)
            .unwrap()
            .handle()
            .wait_timeout(Duration::from_secs(30)));
        let summary = bridge.collect_run(run).unwrap();
        assert_eq!(summary.status.as_str(), "cancelled");
    }
}
