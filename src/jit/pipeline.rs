//! Lowering + emission composed into a [`JitCompiler`].

use std::sync::Arc;

use tracing::trace;

use crate::config::{EmitterKind, RuntimeConfig};
use crate::jit::api::{BytecodeProvider, CompiledFunction, JitCompiler, JitError};
use crate::jit::baseline::BaselineCodeEmitter;
use crate::jit::lowering::{BytecodeLowering, LoweredFunction, Lowering, OptimizingLowering};
use crate::jit::provider::ProgramFunctionProvider;
use crate::jit::vm_emitter::VmIntegratedCodeEmitter;
use crate::vm::BytecodeProgram;

/// Turns a lowered function into an executable artifact.
pub trait CodeEmitter: Send + Sync {
    fn emit(&self, function: LoweredFunction) -> Result<CompiledFunction, JitError>;
}

pub struct PipelineJitCompiler {
    lowering: Box<dyn Lowering>,
    emitter: Box<dyn CodeEmitter>,
}

impl PipelineJitCompiler {
    pub fn new(lowering: impl Lowering + 'static, emitter: impl CodeEmitter + 'static) -> Self {
        Self {
            lowering: Box::new(lowering),
            emitter: Box::new(emitter),
        }
    }

    /// The pipeline selected by `config` over a whole program.
    pub fn for_program(program: Arc<BytecodeProgram>, config: &RuntimeConfig) -> Self {
        let provider: Arc<dyn BytecodeProvider> = Arc::new(ProgramFunctionProvider::new(program));
        Self::with_provider(provider, config)
    }

    pub fn with_provider(provider: Arc<dyn BytecodeProvider>, config: &RuntimeConfig) -> Self {
        let lowering: Box<dyn Lowering> = if config.jit_optimize {
            Box::new(OptimizingLowering::new(provider))
        } else {
            Box::new(BytecodeLowering::new(provider))
        };
        let emitter: Box<dyn CodeEmitter> = match config.jit_emitter {
            EmitterKind::Baseline => Box::new(BaselineCodeEmitter::new()),
            EmitterKind::VmIntegrated => Box::new(VmIntegratedCodeEmitter::new()),
        };
        Self { lowering, emitter }
    }
}

impl JitCompiler for PipelineJitCompiler {
    fn compile(&self, func_index: usize) -> Result<CompiledFunction, JitError> {
        let lowered = self.lowering.lower(func_index)?;
        trace!(
            target: "iris::jit",
            func_index,
            name = %lowered.meta.name,
            instructions = lowered.instructions.len(),
            "lowered"
        );
        self.emitter.emit(lowered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{FunctionInfo, Instr, OpCode, Value, Vm};

    fn program() -> Arc<BytecodeProgram> {
        Arc::new(BytecodeProgram::new(
            vec![
                Instr::with(OpCode::Call, 0),
                Instr::new(OpCode::Halt),
                Instr::with(OpCode::PushI64, 2),
                Instr::with(OpCode::PushI64, 3),
                Instr::new(OpCode::Mul),
                Instr::new(OpCode::Ret),
                Instr::with(OpCode::PushI64, 1),
                Instr::new(OpCode::AllocArr),
                Instr::new(OpCode::Ret),
            ],
            vec![
                FunctionInfo::new("six", 2, 0, 0, true),
                FunctionInfo::new("array", 6, 0, 0, true),
            ],
        ))
    }

    #[test]
    fn test_compile_and_execute() {
        let compiler = PipelineJitCompiler::for_program(program(), &RuntimeConfig::default());
        let code = compiler.compile(0).unwrap();

        let mut vm = Vm::new();
        vm.run(program()).unwrap();
        code.execute(&mut vm).unwrap();
        assert_eq!(vm.stack().last(), Some(&Value::Int(6)));
    }

    #[test]
    fn test_baseline_rejects_heap_function() {
        let config = RuntimeConfig {
            jit_emitter: EmitterKind::Baseline,
            ..RuntimeConfig::default()
        };
        let compiler = PipelineJitCompiler::for_program(program(), &config);
        assert!(compiler.compile(0).is_ok());
        assert_eq!(
            compiler.compile(1).err(),
            Some(JitError::UnsupportedOpcode(OpCode::AllocArr))
        );
    }

    #[test]
    fn test_unknown_function() {
        let compiler = PipelineJitCompiler::for_program(program(), &RuntimeConfig::default());
        assert_eq!(compiler.compile(9).err(), Some(JitError::FunctionOutOfBounds(9)));
    }
}
