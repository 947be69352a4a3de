//! JIT compilation infrastructure for iris.
//!
//! Compilation happens off the interpreter thread:
//! - `provider` exposes per-function bytecode and metadata
//! - `lowering` turns it into the instruction list an emitter consumes
//! - `baseline` and `vm_emitter` produce executable artifacts
//! - `state` tracks each function's lifecycle and publishes artifacts
//! - `async_jit` schedules jobs and plugs into the VM through hooks
//!
//! This module is only compiled when the `jit` feature is enabled.

pub mod api;
pub mod async_jit;
pub mod baseline;
pub mod events;
pub mod handlers;
pub mod lowering;
pub mod pipeline;
pub mod provider;
pub mod state;
pub mod vm_emitter;

pub use api::{BytecodeProvider, CompiledFunction, FunctionMeta, JitCompiler, JitError};
pub use async_jit::{AsyncJit, AsyncJitAdapter};
pub use baseline::BaselineCodeEmitter;
pub use events::{JitEvent, JitEventSink, NoopEventSink, TracingEventSink};
pub use lowering::{BytecodeLowering, LoweredFunction, Lowering, OptimizingLowering};
pub use pipeline::{CodeEmitter, PipelineJitCompiler};
pub use provider::{InMemoryBytecodeProvider, ProgramFunctionProvider};
pub use state::{JitHandle, JitState, JitStateTable, JobStatus, StartOutcome};
pub use vm_emitter::VmIntegratedCodeEmitter;
