//! Wires configuration, the VM and the JIT together for one run.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, RuntimeConfig};
#[cfg(feature = "jit")]
use crate::jit::{AsyncJit, AsyncJitAdapter, JitState, PipelineJitCompiler, TracingEventSink};
use crate::vm::{BytecodeProgram, RunResult, Vm, VmError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("runtime error: {0}")]
    Vm(#[from] VmError),
    #[error("failed to start JIT workers: {0}")]
    JitSetup(#[source] io::Error),
}

/// What one run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    pub result: RunResult,
    /// CALLs served by compiled code
    pub compiled_calls: u64,
    /// Functions that reached Ready before the JIT was closed
    pub compiled_functions: usize,
}

pub struct Engine {
    config: RuntimeConfig,
}

impl Engine {
    pub fn new(config: RuntimeConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run `program`, printing to stdout.
    pub fn run(&self, program: Arc<BytecodeProgram>) -> Result<RunResult, EngineError> {
        self.execute(program, |line| println!("{}", line))
            .map(|execution| execution.result)
    }

    /// Run `program` with a custom output sink. The JIT, if any, is
    /// closed before this returns, whether or not the run succeeded.
    pub fn execute(
        &self,
        program: Arc<BytecodeProgram>,
        output: impl FnMut(&str) + 'static,
    ) -> Result<Execution, EngineError> {
        let mut vm = Vm::with_config(&self.config).with_output(output);
        let jit = self.attach_jit(&mut vm, &program)?;

        let outcome = vm.run(program);
        let compiled_functions = jit.map(|jit| jit.finish()).unwrap_or(0);

        Ok(Execution {
            result: outcome?,
            compiled_calls: vm.compiled_calls(),
            compiled_functions,
        })
    }

    #[cfg(feature = "jit")]
    fn attach_jit(
        &self,
        vm: &mut Vm,
        program: &Arc<BytecodeProgram>,
    ) -> Result<Option<JitSession>, EngineError> {
        if !self.config.jit_mode.is_enabled() || program.functions.is_empty() {
            return Ok(None);
        }
        let compiler = PipelineJitCompiler::for_program(Arc::clone(program), &self.config);
        let jit = AsyncJit::with_options(
            Arc::new(compiler),
            program.functions.len(),
            self.config.jit_workers,
            Arc::new(TracingEventSink),
        )
        .map_err(EngineError::JitSetup)?;
        let jit = Arc::new(jit);
        vm.set_jit_hooks(Some(Arc::new(AsyncJitAdapter::new(
            Arc::clone(&jit),
            self.config.jit_threshold,
        ))));
        debug!(
            target: "iris::jit",
            functions = program.functions.len(),
            emitter = ?self.config.jit_emitter,
            "jit attached"
        );
        Ok(Some(JitSession { jit }))
    }

    #[cfg(not(feature = "jit"))]
    fn attach_jit(
        &self,
        _vm: &mut Vm,
        _program: &Arc<BytecodeProgram>,
    ) -> Result<Option<JitSession>, EngineError> {
        if self.config.jit_mode.is_enabled() {
            debug!(target: "iris::vm", "built without the jit feature; interpreting only");
        }
        Ok(None)
    }
}

#[cfg(feature = "jit")]
struct JitSession {
    jit: Arc<AsyncJit>,
}

#[cfg(feature = "jit")]
impl JitSession {
    fn finish(self) -> usize {
        self.jit.close();
        self.jit.table().count(JitState::Ready)
    }
}

#[cfg(not(feature = "jit"))]
struct JitSession;

#[cfg(not(feature = "jit"))]
impl JitSession {
    fn finish(self) -> usize {
        0
    }
}

/// Run `program` under `config`, printing to stdout.
pub fn run_program(
    program: Arc<BytecodeProgram>,
    config: &RuntimeConfig,
) -> Result<RunResult, EngineError> {
    Engine::new(config.clone())?.run(program)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::config::{EmitterKind, JitMode};
    use crate::vm::{FunctionInfo, Instr, OpCode, Value};

    fn fib_program(n: i64) -> Arc<BytecodeProgram> {
        Arc::new(BytecodeProgram::new(
            vec![
                Instr::with(OpCode::PushI64, n),
                Instr::with(OpCode::Call, 0),
                Instr::new(OpCode::PrintI64),
                Instr::new(OpCode::Halt),
                // fib(n)
                Instr::with(OpCode::LoadLocal, 0),
                Instr::with(OpCode::PushI64, 2),
                Instr::new(OpCode::CmpLt),
                Instr::with(OpCode::JmpIfFalse, 10),
                Instr::with(OpCode::LoadLocal, 0),
                Instr::new(OpCode::Ret),
                Instr::with(OpCode::LoadLocal, 0),
                Instr::with(OpCode::PushI64, 1),
                Instr::new(OpCode::Sub),
                Instr::with(OpCode::Call, 0),
                Instr::with(OpCode::LoadLocal, 0),
                Instr::with(OpCode::PushI64, 2),
                Instr::new(OpCode::Sub),
                Instr::with(OpCode::Call, 0),
                Instr::new(OpCode::Add),
                Instr::new(OpCode::Ret),
            ],
            vec![FunctionInfo::new("fib", 4, 1, 1, true)],
        ))
    }

    fn execute(config: RuntimeConfig, program: Arc<BytecodeProgram>) -> (Execution, Vec<String>) {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&lines);
        let execution = Engine::new(config)
            .unwrap()
            .execute(program, move |line| sink.borrow_mut().push(line.to_string()))
            .unwrap();
        let output = lines.borrow().clone();
        (execution, output)
    }

    #[test]
    fn test_interpreter_only() {
        let config = RuntimeConfig {
            jit_mode: JitMode::Off,
            ..RuntimeConfig::default()
        };
        let (execution, output) = execute(config, fib_program(15));
        assert_eq!(output, vec!["610"]);
        assert_eq!(execution.result.exit_code, 0);
        assert_eq!(execution.compiled_calls, 0);
        assert_eq!(execution.compiled_functions, 0);
    }

    #[test]
    fn test_jit_does_not_change_output() {
        for emitter in [EmitterKind::Baseline, EmitterKind::VmIntegrated] {
            let config = RuntimeConfig {
                jit_mode: JitMode::On,
                jit_emitter: emitter,
                ..RuntimeConfig::default()
            };
            let (execution, output) = execute(config, fib_program(18));
            assert_eq!(output, vec!["2584"], "emitter {:?}", emitter);
            assert_eq!(execution.result.exit_code, 0);
        }
    }

    #[test]
    fn test_runtime_error_still_closes_jit() {
        let program = Arc::new(BytecodeProgram::new(
            vec![
                Instr::with(OpCode::Call, 0),
                Instr::new(OpCode::Halt),
                Instr::with(OpCode::PushI64, 1),
                Instr::with(OpCode::PushI64, 0),
                Instr::new(OpCode::Div),
                Instr::new(OpCode::Ret),
            ],
            vec![FunctionInfo::new("boom", 2, 0, 0, true)],
        ));
        let err = Engine::new(RuntimeConfig::default())
            .unwrap()
            .execute(program, |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Vm(ref e) if e.root() == &VmError::DivisionByZero
        ));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = RuntimeConfig {
            jit_workers: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_run_program_returns_entry_value() {
        let program = Arc::new(BytecodeProgram::new(
            vec![Instr::with(OpCode::PushI64, 3), Instr::new(OpCode::Ret)],
            vec![FunctionInfo::new("main", 0, 0, 0, true)],
        ));
        let result = run_program(program, &RuntimeConfig::default()).unwrap();
        assert_eq!(result.value, Some(Value::Int(3)));
    }
}
