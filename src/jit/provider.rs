//! Bytecode providers: where the pipeline gets function bodies from.

use std::sync::Arc;

use crate::jit::api::{BytecodeProvider, FunctionMeta, JitError};
use crate::vm::verifier;
use crate::vm::{BytecodeProgram, Instr};

/// Extracts function bodies from a finalized whole-program stream.
///
/// Absolute jump targets are rewritten relative to the body start, so
/// everything downstream of the provider sees one convention.
pub struct ProgramFunctionProvider {
    program: Arc<BytecodeProgram>,
    globals_count: usize,
}

impl ProgramFunctionProvider {
    pub fn new(program: Arc<BytecodeProgram>) -> Self {
        let globals_count = program.globals_count();
        Self {
            program,
            globals_count,
        }
    }

    pub fn program(&self) -> &Arc<BytecodeProgram> {
        &self.program
    }
}

impl BytecodeProvider for ProgramFunctionProvider {
    fn function_count(&self) -> usize {
        self.program.functions.len()
    }

    fn function_bytecode(&self, func_index: usize) -> Result<Vec<Instr>, JitError> {
        let info = self
            .program
            .function(func_index)
            .ok_or(JitError::FunctionOutOfBounds(func_index))?;
        let body = self
            .program
            .function_body(func_index)
            .ok_or(JitError::FunctionOutOfBounds(func_index))?;
        let start = info.start_ip as i64;
        let len = body.len() as i64;

        body.iter()
            .enumerate()
            .map(|(pc, instr)| {
                if !instr.op.is_jump() {
                    return Ok(*instr);
                }
                let target = instr
                    .operand
                    .ok_or(JitError::MissingOperand { op: instr.op, pc })?;
                let relative = target - start;
                if !(0..=len).contains(&relative) {
                    return Err(JitError::JumpOutOfFunction {
                        func_index,
                        pc,
                        target,
                    });
                }
                Ok(Instr::with(instr.op, relative))
            })
            .collect()
    }

    fn function_meta(&self, func_index: usize) -> Result<FunctionMeta, JitError> {
        let info = self
            .program
            .function(func_index)
            .ok_or(JitError::FunctionOutOfBounds(func_index))?;
        let body = self.function_bytecode(func_index)?;
        let stack_limit = verifier::analyze(&body, &self.program.functions)?;
        Ok(FunctionMeta {
            name: info.name.clone(),
            arity: info.param_count,
            locals_count: info.frame_size(),
            stack_limit,
            globals_count: self.globals_count,
            start_ip: info.start_ip,
            returns_value: info.returns_value,
        })
    }

    fn const_pool(&self) -> &[i64] {
        &self.program.const_pool
    }
}

/// Hand-assembled function bodies, already function-relative.
#[derive(Debug, Default)]
pub struct InMemoryBytecodeProvider {
    functions: Vec<(FunctionMeta, Vec<Instr>)>,
    const_pool: Vec<i64>,
}

impl InMemoryBytecodeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function; returns its index.
    pub fn add_function(&mut self, meta: FunctionMeta, code: Vec<Instr>) -> usize {
        self.functions.push((meta, code));
        self.functions.len() - 1
    }

    pub fn with_const_pool(mut self, const_pool: Vec<i64>) -> Self {
        self.const_pool = const_pool;
        self
    }
}

impl BytecodeProvider for InMemoryBytecodeProvider {
    fn function_count(&self) -> usize {
        self.functions.len()
    }

    fn function_bytecode(&self, func_index: usize) -> Result<Vec<Instr>, JitError> {
        self.functions
            .get(func_index)
            .map(|(_, code)| code.clone())
            .ok_or(JitError::FunctionOutOfBounds(func_index))
    }

    fn function_meta(&self, func_index: usize) -> Result<FunctionMeta, JitError> {
        self.functions
            .get(func_index)
            .map(|(meta, _)| meta.clone())
            .ok_or(JitError::FunctionOutOfBounds(func_index))
    }

    fn const_pool(&self) -> &[i64] {
        &self.const_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{FunctionInfo, OpCode};

    fn program() -> Arc<BytecodeProgram> {
        // main: call abs(-4); print; halt
        // abs(x): if x < 0 { ret -x } ret x
        Arc::new(BytecodeProgram {
            instructions: vec![
                Instr::with(OpCode::PushI64, -4),
                Instr::with(OpCode::Call, 0),
                Instr::new(OpCode::PrintI64),
                Instr::new(OpCode::Halt),
                Instr::with(OpCode::LoadLocal, 0),
                Instr::with(OpCode::PushI64, 0),
                Instr::new(OpCode::CmpLt),
                Instr::with(OpCode::JmpIfFalse, 11),
                Instr::with(OpCode::LoadLocal, 0),
                Instr::new(OpCode::Neg),
                Instr::new(OpCode::Ret),
                Instr::with(OpCode::LoadLocal, 0),
                Instr::new(OpCode::Ret),
            ],
            const_pool: vec![17],
            functions: vec![FunctionInfo::new("abs", 4, 1, 1, true)],
        })
    }

    #[test]
    fn test_jump_targets_become_relative() {
        let provider = ProgramFunctionProvider::new(program());
        let body = provider.function_bytecode(0).unwrap();
        assert_eq!(body.len(), 9);
        assert_eq!(body[3], Instr::with(OpCode::JmpIfFalse, 7));
        assert_eq!(provider.const_pool(), &[17]);
    }

    #[test]
    fn test_meta() {
        let provider = ProgramFunctionProvider::new(program());
        let meta = provider.function_meta(0).unwrap();
        assert_eq!(meta.arity, 1);
        assert_eq!(meta.locals_count, 1);
        assert_eq!(meta.start_ip, 4);
        assert_eq!(meta.stack_limit, 2);
        assert!(meta.returns_value);
    }

    #[test]
    fn test_jump_outside_function_is_rejected() {
        let mut program = (*program()).clone();
        program.instructions[7] = Instr::with(OpCode::JmpIfFalse, 1);
        let provider = ProgramFunctionProvider::new(Arc::new(program));
        assert!(matches!(
            provider.function_bytecode(0),
            Err(JitError::JumpOutOfFunction { pc: 3, target: 1, .. })
        ));
    }

    #[test]
    fn test_out_of_bounds() {
        let provider = ProgramFunctionProvider::new(program());
        assert_eq!(
            provider.function_meta(3),
            Err(JitError::FunctionOutOfBounds(3))
        );
        let empty = InMemoryBytecodeProvider::new();
        assert_eq!(
            empty.function_bytecode(0),
            Err(JitError::FunctionOutOfBounds(0))
        );
    }
}
