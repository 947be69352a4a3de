//! VM-integrated backend.
//!
//! The artifact runs on the live VM: it pushes a real call frame, keeps
//! its operands on the VM stack, allocates on the VM heap and re-enters
//! the VM for CALL. Instructions are decoded once at emit time.

use std::sync::Arc;

use crate::jit::api::{CompiledFunction, JitError};
use crate::jit::baseline::check_operand;
use crate::jit::lowering::LoweredFunction;
use crate::jit::pipeline::CodeEmitter;
use crate::vm::{CompiledCode, Instr, OpCode, Value, Vm, VmError, eval_binary};

#[derive(Debug, Default, Clone, Copy)]
pub struct VmIntegratedCodeEmitter;

impl VmIntegratedCodeEmitter {
    pub fn new() -> Self {
        Self
    }
}

impl CodeEmitter for VmIntegratedCodeEmitter {
    fn emit(&self, function: LoweredFunction) -> Result<CompiledFunction, JitError> {
        let len = function.instructions.len();
        let mut ops = Vec::with_capacity(len);
        for (pc, instr) in function.instructions.iter().enumerate() {
            check_operand(function.func_index, pc, instr, len)?;
            ops.push(decode(instr));
        }
        let ips = (0..len)
            .map(|pc| function.meta.start_ip + function.origin(pc))
            .collect();
        Ok(Arc::new(VmFunction {
            func_index: function.func_index,
            code: function.instructions,
            ips,
            ops,
        }))
    }
}

/// Pre-decoded instruction. Operands were validated by the emitter.
#[derive(Debug, Clone, Copy)]
enum Op {
    Push(Value),
    LoadLocal(i64),
    StoreLocal(i64),
    Binary(OpCode),
    /// Everything without control flow goes through the VM directly
    Data(Instr),
    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    Call(usize),
    Ret,
    RetVoid,
    Halt,
}

fn decode(instr: &Instr) -> Op {
    let operand = instr.operand.unwrap_or(0);
    let target = usize::try_from(operand).unwrap_or(0);
    match instr.op {
        OpCode::PushI64 => Op::Push(Value::Int(operand)),
        OpCode::PushTrue => Op::Push(Value::Bool(true)),
        OpCode::PushFalse => Op::Push(Value::Bool(false)),
        OpCode::LoadLocal => Op::LoadLocal(operand),
        OpCode::StoreLocal => Op::StoreLocal(operand),
        op if op.is_binary() => Op::Binary(op),
        OpCode::Jmp => Op::Jump(target),
        OpCode::JmpIfFalse => Op::JumpIfFalse(target),
        OpCode::JmpIfTrue => Op::JumpIfTrue(target),
        // A negative function index is caught by the VM at call time
        OpCode::Call => Op::Call(usize::try_from(operand).unwrap_or(usize::MAX)),
        OpCode::Ret => Op::Ret,
        OpCode::RetVoid => Op::RetVoid,
        OpCode::Halt => Op::Halt,
        _ => Op::Data(*instr),
    }
}

struct VmFunction {
    func_index: usize,
    code: Vec<Instr>,
    /// Program ip each instruction was lowered from, for error reports
    ips: Vec<usize>,
    ops: Vec<Op>,
}

enum Flow {
    Next,
    Jump(usize),
    Done,
}

impl VmFunction {
    fn step(&self, vm: &mut Vm, op: Op) -> Result<Flow, VmError> {
        match op {
            Op::Push(value) => vm.push(value),
            Op::LoadLocal(index) => {
                let value = vm.load_local(index)?;
                vm.push(value);
            }
            Op::StoreLocal(index) => {
                let value = vm.pop(OpCode::StoreLocal)?;
                vm.store_local(index, value)?;
            }
            Op::Binary(op) => {
                let right = vm.pop(op)?;
                let left = vm.pop(op)?;
                vm.push(eval_binary(op, left, right)?);
            }
            Op::Data(instr) => vm.exec_data_op(instr)?,
            Op::Jump(target) => return Ok(Flow::Jump(target)),
            Op::JumpIfFalse(target) => {
                if !vm.pop(OpCode::JmpIfFalse)?.to_bool() {
                    return Ok(Flow::Jump(target));
                }
            }
            Op::JumpIfTrue(target) => {
                if vm.pop(OpCode::JmpIfTrue)?.to_bool() {
                    return Ok(Flow::Jump(target));
                }
            }
            Op::Call(callee) => {
                vm.call_function(callee)?;
                if vm.is_stopped() {
                    return Ok(Flow::Done);
                }
            }
            Op::Ret => {
                let value = vm.pop(OpCode::Ret)?;
                vm.leave_frame(OpCode::Ret, Some(value))?;
                return Ok(Flow::Done);
            }
            Op::RetVoid => {
                vm.leave_frame(OpCode::RetVoid, None)?;
                return Ok(Flow::Done);
            }
            Op::Halt => return Err(VmError::HaltInCompiledCode(self.func_index)),
        }
        Ok(Flow::Next)
    }
}

impl CompiledCode for VmFunction {
    fn execute(&self, vm: &mut Vm) -> Result<(), VmError> {
        let return_ip = vm.ip();
        vm.enter_frame(self.func_index, return_ip)?;

        let mut pc = 0;
        while let Some(&op) = self.ops.get(pc) {
            vm.maybe_collect();
            let flow = self
                .step(vm, op)
                .map_err(|e| e.at(self.ips[pc], self.code[pc]))?;
            match flow {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = target,
                Flow::Done => return Ok(()),
            }
        }

        // Running off the end returns like RET_VOID
        vm.leave_frame(OpCode::RetVoid, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::api::FunctionMeta;

    #[test]
    fn test_decode_specializes_hot_ops() {
        assert!(matches!(
            decode(&Instr::with(OpCode::PushI64, 3)),
            Op::Push(Value::Int(3))
        ));
        assert!(matches!(decode(&Instr::new(OpCode::Add)), Op::Binary(OpCode::Add)));
        assert!(matches!(decode(&Instr::new(OpCode::LoadArr)), Op::Data(_)));
        assert!(matches!(decode(&Instr::with(OpCode::Call, 2)), Op::Call(2)));
    }

    #[test]
    fn test_rejects_missing_operand() {
        let function = LoweredFunction::new(
            1,
            FunctionMeta {
                name: "f".into(),
                arity: 0,
                locals_count: 0,
                stack_limit: 1,
                globals_count: 0,
                start_ip: 0,
                returns_value: false,
            },
            vec![Instr::new(OpCode::LoadLocal)],
        );
        assert!(matches!(
            VmIntegratedCodeEmitter::new().emit(function),
            Err(JitError::MissingOperand {
                op: OpCode::LoadLocal,
                pc: 0
            })
        ));
    }

    #[test]
    fn test_accepts_heap_and_call() {
        let function = LoweredFunction::new(
            0,
            FunctionMeta {
                name: "f".into(),
                arity: 0,
                locals_count: 0,
                stack_limit: 2,
                globals_count: 0,
                start_ip: 0,
                returns_value: true,
            },
            vec![
                Instr::with(OpCode::PushI64, 2),
                Instr::new(OpCode::AllocArr),
                Instr::with(OpCode::Call, 0),
                Instr::new(OpCode::Ret),
            ],
        );
        assert!(VmIntegratedCodeEmitter::new().emit(function).is_ok());
    }
}
