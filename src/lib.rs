//! Native bridge exposing Hamiltonian MCMC sampling to a managed host
//! runtime.
//!
//! The host hands over a compiled probability model, a dataset and a
//! sampling configuration; the bridge builds the native objects, tracks
//! them behind opaque integer handles and drives the sampler on a
//! dedicated worker pool, streaming draws and log messages back through
//! callback sinks. Entry points never block the host scheduler and never
//! let a native failure escape as anything but a typed error value.

pub(crate) mod chain;
pub(crate) mod mass_matrix;
pub(crate) mod nuts;
pub(crate) mod stepsize;

pub mod bridge;
pub mod entry;
pub mod invoker;
pub mod marshal;
pub mod model;
pub mod registry;
pub mod sampler;
pub mod storage;
pub mod term;
pub mod var_context;

pub use bridge::{Bridge, BridgeConfig, BridgeError};
pub use entry::{dispatch, ENTRY_POINTS};
pub use invoker::{RunHandle, RunPoll, SamplingPool};
pub use marshal::ArgumentError;
pub use model::{CompiledModel, Density, DensityError, LocationScaleUnit, ModelInstance, NormalMeanUnit};
pub use registry::{ModelEntry, Registry, RegistryError, RunPermit};
pub use sampler::{
    run_chain, Algorithm, Draw, DrawSink, DrawStats, InterruptFlag, LogLevel, LogSink, MemoryDraws,
    MemoryLog, NullDraws, NullLog, RunPhase, RunProgress, RunSinks, RunStatus, RunSummary,
    SamplerConfig, SharedLog,
};
pub use storage::ArrowDrawSink;
pub use term::Term;
pub use var_context::{ContextError, VarContext, VarEntry, VarValues};
