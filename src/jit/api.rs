//! Interfaces shared by the compilation pipeline and the orchestrator.

use std::sync::Arc;

use thiserror::Error;

use crate::vm::verifier::VerifyError;
use crate::vm::{CompiledCode, Instr, OpCode};

/// A published, executable artifact for one function.
pub type CompiledFunction = Arc<dyn CompiledCode>;

/// Per-function metadata handed to the lowering and emitting stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionMeta {
    pub name: String,
    pub arity: usize,
    pub locals_count: usize,
    /// Maximum operand-stack height the body can reach
    pub stack_limit: usize,
    /// Global slots addressed anywhere in the program
    pub globals_count: usize,
    /// Where the body starts in the whole-program instruction stream
    pub start_ip: usize,
    pub returns_value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JitError {
    #[error("function index {0} out of bounds")]
    FunctionOutOfBounds(usize),
    #[error("unsupported opcode in compiled code: {0}")]
    UnsupportedOpcode(OpCode),
    #[error("missing operand for {op} at {pc}")]
    MissingOperand { op: OpCode, pc: usize },
    #[error("jump at {pc} targets {target}, outside function {func_index}")]
    JumpOutOfFunction {
        func_index: usize,
        pc: usize,
        target: i64,
    },
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),
    #[error("compiler panicked: {0}")]
    Panicked(String),
}

/// Read-only view of a program's functions. Implementations must be
/// safe to share with background compile threads.
pub trait BytecodeProvider: Send + Sync {
    fn function_count(&self) -> usize;

    /// The function's instructions, with jump targets relative to the
    /// first instruction of the body.
    fn function_bytecode(&self, func_index: usize) -> Result<Vec<Instr>, JitError>;

    fn function_meta(&self, func_index: usize) -> Result<FunctionMeta, JitError>;

    fn const_pool(&self) -> &[i64];
}

/// The single operation the orchestrator needs from a compiler.
pub trait JitCompiler: Send + Sync {
    fn compile(&self, func_index: usize) -> Result<CompiledFunction, JitError>;
}
