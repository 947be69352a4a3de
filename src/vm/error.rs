//! Runtime error taxonomy for the interpreter and compiled code.

use std::fmt;

use thiserror::Error;

use super::heap::HeapAddr;
use super::ops::{Instr, OpCode};
use super::value::Value;

/// Which variable space an index addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Local,
    Global,
    Field,
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarKind::Local => write!(f, "local"),
            VarKind::Global => write!(f, "global"),
            VarKind::Field => write!(f, "field"),
        }
    }
}

/// Fatal execution errors. None of these are recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("stack underflow in {0}")]
    StackUnderflow(OpCode),
    #[error("missing operand for {0}")]
    MissingOperand(OpCode),
    #[error("unsupported opcode in compiled code: {0}")]
    UnsupportedOpcode(OpCode),
    #[error("division by zero")]
    DivisionByZero,
    #[error("array index {index} out of bounds (size {size})")]
    ArrayOutOfBounds { index: i64, size: usize },
    #[error("invalid heap reference: {0}")]
    InvalidHeapReference(HeapAddr),
    #[error("invalid {kind} index {index} (size {size})")]
    InvalidVariableIndex {
        kind: VarKind,
        index: i64,
        size: usize,
    },
    #[error("cannot convert {0:?} to int")]
    InvalidConversion(Value),
    #[error("{op}: expected {expected}, found {found}")]
    TypeMismatch {
        op: OpCode,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid function index {0}")]
    InvalidFunction(i64),
    #[error("invalid jump target {0}")]
    InvalidJumpTarget(i64),
    #[error("{op}: negative size {size}")]
    NegativeSize { op: OpCode, size: i64 },
    #[error("{op}: size {size} exceeds the allocation limit {limit}")]
    AllocationTooLarge { op: OpCode, size: i64, limit: usize },
    #[error("HALT reached inside compiled function {0}")]
    HaltInCompiledCode(usize),
    #[error("{instr} at ip {ip}: {source}")]
    Trap {
        ip: usize,
        instr: Instr,
        #[source]
        source: Box<VmError>,
    },
}

impl VmError {
    /// The underlying error with any instruction context stripped.
    pub fn root(&self) -> &VmError {
        match self {
            VmError::Trap { source, .. } => source.root(),
            other => other,
        }
    }

    /// Attach instruction context unless an inner frame already did.
    pub fn at(self, ip: usize, instr: Instr) -> VmError {
        match self {
            trap @ VmError::Trap { .. } => trap,
            other => VmError::Trap {
                ip,
                instr,
                source: Box::new(other),
            },
        }
    }
}
