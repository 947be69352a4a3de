//! Background compilation and the hooks the interpreter talks to.
//!
//! Jobs run on a dedicated tokio runtime's blocking pool. A job's only
//! channel back to the interpreter is the state table: it publishes once
//! and the interpreter reads the slot without locking.
//!
//! `close()` and publication are serialized through a gate: a job checks
//! for closure and publishes under a read guard, `close()` takes the write
//! guard before cancelling what is still pending. A cancelled function
//! therefore never turns Ready or Failed afterwards.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::jit::api::{CompiledFunction, JitCompiler, JitError};
use crate::jit::events::{JitEvent, JitEventSink, TracingEventSink};
use crate::jit::state::{JitHandle, JitState, JitStateTable, JobStatus, StartOutcome};
use crate::vm::{CompiledCode, JitHooks};

const DEFAULT_WORKERS: usize = 2;

pub struct AsyncJit {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
}

/// State the compile jobs need.
struct Shared {
    compiler: Arc<dyn JitCompiler>,
    table: JitStateTable,
    events: Arc<dyn JitEventSink>,
    closed: AtomicBool,
    /// Read-held while starting or publishing a job, write-held by close
    gate: RwLock<()>,
    /// Compilation runs actually performed
    runs: AtomicUsize,
}

impl AsyncJit {
    pub fn new(compiler: Arc<dyn JitCompiler>, function_count: usize) -> io::Result<Self> {
        Self::with_options(
            compiler,
            function_count,
            DEFAULT_WORKERS,
            Arc::new(TracingEventSink),
        )
    }

    pub fn with_options(
        compiler: Arc<dyn JitCompiler>,
        function_count: usize,
        workers: usize,
        events: Arc<dyn JitEventSink>,
    ) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers.max(1))
            .thread_name("iris-jit")
            .build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                compiler,
                table: JitStateTable::new(function_count),
                events,
                closed: AtomicBool::new(false),
                gate: RwLock::new(()),
                runs: AtomicUsize::new(0),
            }),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Start compiling `func_index` unless it already started.
    ///
    /// Returns the in-flight job's handle, or `None` when the function is
    /// already Ready or Failed, or the JIT is closed.
    pub fn ensure_compilation(&self, func_index: usize) -> Option<JitHandle> {
        let _gate = self.shared.gate.read();
        if self.is_closed() {
            return None;
        }
        match self.shared.table.try_start(func_index) {
            StartOutcome::Started(handle) => {
                self.spawn_job(func_index);
                Some(handle)
            }
            StartOutcome::InFlight(handle) => Some(handle),
            StartOutcome::Resolved(_) => None,
        }
    }

    /// Compile and wait for the result. Returns the state the function
    /// ended up in; Compiling means the JIT was closed first.
    pub fn compile_blocking(&self, func_index: usize) -> JitState {
        match self.ensure_compilation(func_index).map(|h| h.wait()) {
            Some(JobStatus::Finished(state)) => state,
            Some(JobStatus::Cancelled) | Some(JobStatus::Pending) | None => self.state(func_index),
        }
    }

    pub fn compiled(&self, func_index: usize) -> Option<CompiledFunction> {
        self.shared.table.compiled(func_index)
    }

    pub fn state(&self, func_index: usize) -> JitState {
        self.shared.table.state(func_index)
    }

    pub fn table(&self) -> &JitStateTable {
        &self.shared.table
    }

    /// Compilation runs performed so far.
    pub fn compile_runs(&self) -> usize {
        self.shared.runs.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop the scheduler and abandon in-flight jobs. Already published
    /// results stay valid; abandoned functions stay Compiling forever.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        // Wait out any job that is publishing right now
        let _gate = self.shared.gate.write();
        let cancelled = self.shared.table.cancel_pending();
        debug!(target: "iris::jit", cancelled, "jit closed");
    }

    fn spawn_job(&self, func_index: usize) {
        let guard = self.runtime.lock();
        let Some(runtime) = guard.as_ref() else {
            // close() is waiting on the gate and will cancel this job
            return;
        };
        let shared = Arc::clone(&self.shared);
        drop(runtime.spawn_blocking(move || shared.run_job(func_index)));
    }
}

impl Shared {
    fn run_job(&self, func_index: usize) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.events.emit(&JitEvent::CompilationStarted { func_index });
        self.runs.fetch_add(1, Ordering::AcqRel);

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.compiler.compile(func_index)))
            .unwrap_or_else(|payload| Err(JitError::Panicked(panic_message(payload))));

        // An abandoned job never publishes.
        let _gate = self.gate.read();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match result {
            Ok(code) => {
                if self.table.publish_ready(func_index, code) {
                    self.events
                        .emit(&JitEvent::CompilationSucceeded { func_index });
                }
            }
            Err(error) => {
                if self.table.mark_failed(func_index) {
                    self.events
                        .emit(&JitEvent::CompilationFailed { func_index, error });
                }
            }
        }
        self.table.finish_job(func_index);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for AsyncJit {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Hooks adapter
// ============================================================================

/// Connects an [`AsyncJit`] to the interpreter.
///
/// Calls are counted per function; reaching the threshold queues a
/// compile. The interpreter never waits on the JIT.
pub struct AsyncJitAdapter {
    jit: Arc<AsyncJit>,
    threshold: u32,
    call_counts: Vec<AtomicU32>,
}

impl AsyncJitAdapter {
    pub fn new(jit: Arc<AsyncJit>, threshold: u32) -> Self {
        let function_count = jit.table().len();
        Self {
            jit,
            threshold: threshold.max(1),
            call_counts: (0..function_count).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn jit(&self) -> &Arc<AsyncJit> {
        &self.jit
    }

    pub fn call_count(&self, func_index: usize) -> u32 {
        self.call_counts
            .get(func_index)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl JitHooks for AsyncJitAdapter {
    fn get_compiled(&self, func_index: usize) -> Option<Arc<dyn CompiledCode>> {
        self.jit.compiled(func_index)
    }

    fn notify_call(&self, func_index: usize) {
        let Some(counter) = self.call_counts.get(func_index) else {
            return;
        };
        let calls = counter.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        if calls >= self.threshold && self.jit.state(func_index) == JitState::NotCompiled {
            self.jit.ensure_compilation(func_index);
        }
    }
}
