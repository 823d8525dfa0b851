//! Asynchronous dispatch of sampling runs.
//!
//! Long-running native work must never execute on the host's own
//! scheduling resources. Runs are spawned onto a dedicated thread pool and
//! observed through a [`RunHandle`]: the caller returns immediately and
//! polls, waits or interrupts from any thread while the worker streams
//! progress into shared state and delivers the summary over a channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::registry::RunPermit;
use crate::sampler::{
    run_chain, DrawSink, InterruptFlag, LogSink, RunProgress, RunSinks, RunStatus, RunSummary,
    SamplerConfig,
};

/// Dedicated worker pool for sampling invocations, sized independently of
/// anything the host schedules on.
pub struct SamplingPool {
    pool: ThreadPool,
}

impl SamplingPool {
    pub fn new(num_threads: usize) -> Result<SamplingPool> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("mcmc-bridge-worker-{}", i))
            .build()
            .context("Could not start sampling thread pool")?;
        Ok(SamplingPool { pool })
    }

    /// Start one run and return its handle without blocking.
    ///
    /// The permit is the exclusive lease on the model; it is dropped in
    /// the worker once the run reaches a terminal state, panics included,
    /// so the model becomes claimable again exactly when the run is over.
    pub fn spawn_run(
        &self,
        permit: RunPermit,
        config: SamplerConfig,
        mut logger: Box<dyn LogSink>,
        mut writer: Box<dyn DrawSink>,
    ) -> RunHandle {
        let interrupt = InterruptFlag::new();
        let progress = Arc::new(Mutex::new(RunProgress::new(config.total_iterations())));
        let (sender, receiver) = channel();

        let worker_interrupt = interrupt.clone();
        let worker_progress = Arc::clone(&progress);
        self.pool.spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                run_chain(
                    permit.instance(),
                    &config,
                    RunSinks {
                        logger: logger.as_mut(),
                        writer: writer.as_mut(),
                        interrupt: &worker_interrupt,
                        progress: Some(worker_progress.as_ref()),
                    },
                )
            }));
            let summary = result.unwrap_or_else(|_| {
                failed_summary("sampling worker panicked".to_string())
            });
            drop(permit);
            let _ = sender.send(summary);
        });

        RunHandle {
            interrupt,
            progress,
            receiver: Mutex::new(receiver),
            terminal: Mutex::new(Terminal::default()),
        }
    }
}

fn failed_summary(message: String) -> RunSummary {
    RunSummary {
        status: RunStatus::Failed(message),
        param_names: Vec::new(),
        draws: Vec::new(),
        warmup_iterations: 0,
        sample_iterations: 0,
        divergences: 0,
    }
}

#[derive(Debug, Clone)]
pub enum RunPoll {
    Running(RunProgress),
    Finished(RunStatus),
}

#[derive(Default)]
struct Terminal {
    status: Option<RunStatus>,
    summary: Option<RunSummary>,
}

impl Terminal {
    fn store(&mut self, summary: RunSummary) {
        self.status = Some(summary.status.clone());
        self.summary = Some(summary);
    }
}

/// Host-side reference to one asynchronous run.
pub struct RunHandle {
    interrupt: InterruptFlag,
    progress: Arc<Mutex<RunProgress>>,
    receiver: Mutex<Receiver<RunSummary>>,
    terminal: Mutex<Terminal>,
}

impl RunHandle {
    /// Request cooperative cancellation; takes effect at the next
    /// iteration boundary. Idempotent.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn progress(&self) -> RunProgress {
        self.progress.lock().expect("Poisoned progress lock").clone()
    }

    /// Non-blocking status check.
    pub fn poll(&self) -> RunPoll {
        self.pump();
        let terminal = self.terminal.lock().expect("Poisoned run lock");
        match &terminal.status {
            Some(status) => RunPoll::Finished(status.clone()),
            None => RunPoll::Running(self.progress()),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.poll(), RunPoll::Finished(_))
    }

    /// Block up to `timeout` for the run to reach a terminal state.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_finished() {
            return true;
        }
        let outcome = {
            let receiver = self.receiver.lock().expect("Poisoned run lock");
            receiver.recv_timeout(timeout)
        };
        match outcome {
            Ok(summary) => {
                self.terminal
                    .lock()
                    .expect("Poisoned run lock")
                    .store(summary);
                true
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.store_missing();
                true
            }
            // Another waiter may have consumed the summary meanwhile.
            Err(RecvTimeoutError::Timeout) => self.is_finished(),
        }
    }

    /// Remove the summary once terminal; `None` if the run is still live
    /// or the summary was already taken.
    pub fn take_summary(&self) -> Option<RunSummary> {
        self.pump();
        self.terminal
            .lock()
            .expect("Poisoned run lock")
            .summary
            .take()
    }

    fn pump(&self) {
        let mut terminal = self.terminal.lock().expect("Poisoned run lock");
        if terminal.status.is_some() {
            return;
        }
        // try_lock: a blocked waiter already owns the receiver and will
        // store the summary itself.
        let Ok(receiver) = self.receiver.try_lock() else {
            return;
        };
        match receiver.try_recv() {
            Ok(summary) => terminal.store(summary),
            Err(TryRecvError::Disconnected) => {
                terminal.store(failed_summary("sampling worker disappeared".to_string()))
            }
            Err(TryRecvError::Empty) => {}
        }
    }

    fn store_missing(&self) {
        let mut terminal = self.terminal.lock().expect("Poisoned run lock");
        if terminal.status.is_none() {
            terminal.store(failed_summary("sampling worker disappeared".to_string()));
        }
    }
}
