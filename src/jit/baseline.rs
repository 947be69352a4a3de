//! Baseline backend: handler dispatch over an isolated context.
//!
//! Functions that call other functions or touch the heap are rejected at
//! emit time and stay interpreted.

use std::sync::Arc;

use crate::jit::api::{CompiledFunction, JitError};
use crate::jit::handlers::{BASELINE_HANDLERS, ExecutionContext, Step};
use crate::jit::lowering::LoweredFunction;
use crate::jit::pipeline::CodeEmitter;
use crate::vm::{CompiledCode, Instr, OpCode, Value, Vm, VmError};

#[derive(Debug, Default, Clone, Copy)]
pub struct BaselineCodeEmitter;

impl BaselineCodeEmitter {
    pub fn new() -> Self {
        Self
    }
}

impl CodeEmitter for BaselineCodeEmitter {
    fn emit(&self, function: LoweredFunction) -> Result<CompiledFunction, JitError> {
        let len = function.instructions.len();
        for (pc, instr) in function.instructions.iter().enumerate() {
            if !BASELINE_HANDLERS.supports(instr.op) {
                return Err(JitError::UnsupportedOpcode(instr.op));
            }
            check_operand(function.func_index, pc, instr, len)?;
        }
        let ips = (0..len)
            .map(|pc| function.meta.start_ip + function.origin(pc))
            .collect();
        Ok(Arc::new(BaselineFunction {
            func_index: function.func_index,
            ips,
            arity: function.meta.arity,
            locals_count: function.meta.locals_count.max(function.meta.arity),
            stack_limit: function.meta.stack_limit,
            code: function.instructions,
        }))
    }
}

/// Reject instructions that could only fail at runtime for structural
/// reasons: missing operands and jumps leaving the body.
pub(crate) fn check_operand(
    func_index: usize,
    pc: usize,
    instr: &Instr,
    len: usize,
) -> Result<(), JitError> {
    if instr.op.requires_operand() && instr.operand.is_none() {
        return Err(JitError::MissingOperand { op: instr.op, pc });
    }
    if instr.op.is_jump() {
        let target = instr.operand.unwrap_or(-1);
        if !(0..=len as i64).contains(&target) {
            return Err(JitError::JumpOutOfFunction {
                func_index,
                pc,
                target,
            });
        }
    }
    Ok(())
}

struct BaselineFunction {
    func_index: usize,
    /// Program ip each instruction was lowered from, for error reports
    ips: Vec<usize>,
    arity: usize,
    locals_count: usize,
    stack_limit: usize,
    code: Vec<Instr>,
}

impl BaselineFunction {
    fn run(&self, ctx: &mut ExecutionContext) -> Result<(), VmError> {
        let mut ip = 0;
        // Running off the end returns like RET_VOID
        while let Some(instr) = self.code.get(ip) {
            let step = BASELINE_HANDLERS
                .dispatch(ctx, instr)
                .map_err(|e| e.at(self.ips[ip], *instr))?;
            match step {
                Step::Next => ip += 1,
                Step::Jump(target) => ip = target,
                Step::Exit => break,
            }
        }
        Ok(())
    }
}

impl CompiledCode for BaselineFunction {
    fn execute(&self, vm: &mut Vm) -> Result<(), VmError> {
        let mut locals = vec![Value::Int(0); self.locals_count];
        for slot in (0..self.arity).rev() {
            locals[slot] = vm.pop(OpCode::Call)?;
        }

        let mut ctx = ExecutionContext::new(
            self.func_index,
            locals,
            vm.globals().to_vec(),
            vm.config().max_globals,
            self.stack_limit,
        );
        let result = self.run(&mut ctx);

        for line in &ctx.output {
            vm.print(line);
        }
        result?;

        for &slot in &ctx.dirty_globals {
            vm.store_global(slot as i64, ctx.globals[slot])?;
        }
        if let Some(value) = ctx.return_value {
            vm.push(value);
        }
        Ok(())
    }
}
