//! Iris - a stack bytecode virtual machine with a background JIT.
//!
//! This library provides the interpreter, heap and garbage collector,
//! the program file format, and the asynchronous JIT pipeline.

pub mod config;
#[cfg(feature = "jit")]
pub mod jit;
pub mod runtime;
pub mod vm;

// Re-export commonly used types
pub use config::{EmitterKind, JitMode, RuntimeConfig};
pub use runtime::{Engine, EngineError, run_program};
pub use vm::{BytecodeProgram, FunctionInfo, Instr, OpCode, RunResult, Value, Vm, VmError};
