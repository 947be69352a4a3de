pub mod bytecode;
mod error;
mod gc;
mod heap;
mod hooks;
mod ops;
mod value;
pub mod verifier;
mod vm;

pub use error::{VarKind, VmError};
pub use gc::{CollectionReport, GarbageCollector, GcStats};
pub use heap::{Heap, HeapAddr, HeapObject};
pub use hooks::{CompiledCode, JitHooks};
pub use ops::{Instr, OpCode};
pub use value::{Value, eval_binary, eval_unary};
pub use vm::{CallFrame, OutputSink, RunResult, Vm};

use serde::{Deserialize, Serialize};

/// Metadata for one function in a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub start_ip: usize,
    pub param_count: usize,
    pub local_count: usize,
    pub returns_value: bool,
}

impl FunctionInfo {
    pub fn new(
        name: impl Into<String>,
        start_ip: usize,
        param_count: usize,
        local_count: usize,
        returns_value: bool,
    ) -> Self {
        Self {
            name: name.into(),
            start_ip,
            param_count,
            local_count,
            returns_value,
        }
    }

    /// Slots needed for the frame: parameters always fit.
    pub fn frame_size(&self) -> usize {
        self.local_count.max(self.param_count)
    }
}

/// A validated, resolved program: one instruction stream, a constant
/// pool, and the function table indexing into the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytecodeProgram {
    pub instructions: Vec<Instr>,
    #[serde(default)]
    pub const_pool: Vec<i64>,
    #[serde(default)]
    pub functions: Vec<FunctionInfo>,
}

impl BytecodeProgram {
    pub fn new(instructions: Vec<Instr>, functions: Vec<FunctionInfo>) -> Self {
        Self {
            instructions,
            const_pool: Vec::new(),
            functions,
        }
    }

    pub fn function(&self, func_index: usize) -> Option<&FunctionInfo> {
        self.functions.get(func_index)
    }

    /// The function whose body starts at ip 0, if any. Its frame layout
    /// is used for the entry frame.
    pub fn entry_function(&self) -> Option<usize> {
        self.functions.iter().position(|f| f.start_ip == 0)
    }

    /// One past the last instruction of a function's body: the nearest
    /// later function start, or the end of the stream.
    pub fn function_end(&self, func_index: usize) -> Option<usize> {
        let start = self.function(func_index)?.start_ip;
        let end = self
            .functions
            .iter()
            .map(|f| f.start_ip)
            .filter(|ip| *ip > start)
            .min()
            .unwrap_or(self.instructions.len());
        Some(end.min(self.instructions.len()))
    }

    /// The instructions of a function's body, jump targets untouched.
    pub fn function_body(&self, func_index: usize) -> Option<&[Instr]> {
        let start = self.function(func_index)?.start_ip;
        let end = self.function_end(func_index)?;
        self.instructions.get(start..end)
    }

    /// Number of global slots the program addresses.
    pub fn globals_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| matches!(i.op, OpCode::LoadGlobal | OpCode::StoreGlobal))
            .filter_map(|i| i.operand)
            .filter_map(|idx| usize::try_from(idx).ok())
            .map(|idx| idx + 1)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BytecodeProgram {
        BytecodeProgram::new(
            vec![
                Instr::with(OpCode::Call, 1),
                Instr::new(OpCode::Halt),
                Instr::with(OpCode::LoadGlobal, 3),
                Instr::new(OpCode::Ret),
            ],
            vec![
                FunctionInfo::new("main", 0, 0, 1, false),
                FunctionInfo::new("g", 2, 0, 0, true),
            ],
        )
    }

    #[test]
    fn test_function_bounds() {
        let program = sample();
        assert_eq!(program.function_end(0), Some(2));
        assert_eq!(program.function_end(1), Some(4));
        assert_eq!(program.function_body(1).map(|b| b.len()), Some(2));
        assert_eq!(program.function_body(5), None);
    }

    #[test]
    fn test_entry_and_globals() {
        let program = sample();
        assert_eq!(program.entry_function(), Some(0));
        assert_eq!(program.globals_count(), 4);
    }
}
