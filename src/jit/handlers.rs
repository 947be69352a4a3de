//! Opcode handler table for the baseline backend.
//!
//! Handlers run against an [`ExecutionContext`] that owns its own operand
//! stack, locals and globals; nothing here can reach the VM's heap or
//! call stack. The table is a plain array indexed by opcode.

use once_cell::sync::Lazy;

use crate::vm::{Instr, OpCode, VarKind, VmError, Value, eval_binary, eval_unary};

/// What the dispatch loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Next,
    Jump(usize),
    Exit,
}

pub type Handler = fn(&mut ExecutionContext, &Instr) -> Result<Step, VmError>;

/// Isolated state for one execution of a baseline-compiled function.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    pub func_index: usize,
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
    pub globals: Vec<Value>,
    /// Growth limit for `globals`, the VM's `max_globals`
    pub max_globals: usize,
    /// Global slots written during this execution
    pub dirty_globals: Vec<usize>,
    pub return_value: Option<Value>,
    /// Lines printed, in order
    pub output: Vec<String>,
}

impl ExecutionContext {
    pub fn new(
        func_index: usize,
        locals: Vec<Value>,
        globals: Vec<Value>,
        max_globals: usize,
        stack_limit: usize,
    ) -> Self {
        Self {
            func_index,
            stack: Vec::with_capacity(stack_limit),
            locals,
            globals,
            max_globals,
            ..Self::default()
        }
    }

    fn pop(&mut self, op: OpCode) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow(op))
    }
}

pub struct HandlerTable {
    handlers: [Option<Handler>; OpCode::COUNT],
}

/// Shared table for every baseline artifact.
pub static BASELINE_HANDLERS: Lazy<HandlerTable> = Lazy::new(HandlerTable::baseline);

impl HandlerTable {
    pub fn empty() -> Self {
        Self {
            handlers: [None; OpCode::COUNT],
        }
    }

    /// Everything that needs neither the heap nor other functions.
    pub fn baseline() -> Self {
        let mut table = Self::empty();
        table.register(OpCode::PushI64, push_i64);
        table.register(OpCode::PushTrue, push_true);
        table.register(OpCode::PushFalse, push_false);
        table.register(OpCode::Pop, pop);
        table.register(OpCode::Dup, dup);
        for op in OpCode::ALL.into_iter().filter(|op| op.is_binary()) {
            table.register(op, binary);
        }
        table.register(OpCode::Neg, unary);
        table.register(OpCode::Not, unary);
        table.register(OpCode::Jmp, jmp);
        table.register(OpCode::JmpIfFalse, jmp_if);
        table.register(OpCode::JmpIfTrue, jmp_if);
        table.register(OpCode::LoadLocal, load_local);
        table.register(OpCode::StoreLocal, store_local);
        table.register(OpCode::LoadGlobal, load_global);
        table.register(OpCode::StoreGlobal, store_global);
        table.register(OpCode::PrintI64, print_i64);
        table.register(OpCode::PrintBool, print_bool);
        table.register(OpCode::Ret, ret);
        table.register(OpCode::RetVoid, ret_void);
        table.register(OpCode::Halt, halt);
        table
    }

    pub fn register(&mut self, op: OpCode, handler: Handler) {
        self.handlers[op.index()] = Some(handler);
    }

    pub fn supports(&self, op: OpCode) -> bool {
        self.handlers[op.index()].is_some()
    }

    pub fn dispatch(&self, ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
        match self.handlers[instr.op.index()] {
            Some(handler) => handler(ctx, instr),
            None => Err(VmError::UnsupportedOpcode(instr.op)),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn push_i64(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    ctx.stack.push(Value::Int(instr.operand()?));
    Ok(Step::Next)
}

fn push_true(ctx: &mut ExecutionContext, _: &Instr) -> Result<Step, VmError> {
    ctx.stack.push(Value::Bool(true));
    Ok(Step::Next)
}

fn push_false(ctx: &mut ExecutionContext, _: &Instr) -> Result<Step, VmError> {
    ctx.stack.push(Value::Bool(false));
    Ok(Step::Next)
}

fn pop(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    ctx.pop(instr.op)?;
    Ok(Step::Next)
}

fn dup(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let top = *ctx.stack.last().ok_or(VmError::StackUnderflow(instr.op))?;
    ctx.stack.push(top);
    Ok(Step::Next)
}

fn binary(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let right = ctx.pop(instr.op)?;
    let left = ctx.pop(instr.op)?;
    ctx.stack.push(eval_binary(instr.op, left, right)?);
    Ok(Step::Next)
}

fn unary(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let operand = ctx.pop(instr.op)?;
    ctx.stack.push(eval_unary(instr.op, operand)?);
    Ok(Step::Next)
}

fn jmp(_: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    Ok(Step::Jump(instr.target()?))
}

fn jmp_if(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let target = instr.target()?;
    let cond = ctx.pop(instr.op)?.to_bool();
    let taken = if instr.op == OpCode::JmpIfTrue { cond } else { !cond };
    Ok(if taken { Step::Jump(target) } else { Step::Next })
}

fn slot(index: i64, size: usize, kind: VarKind) -> Result<usize, VmError> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < size)
        .ok_or(VmError::InvalidVariableIndex { kind, index, size })
}

fn load_local(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let i = slot(instr.operand()?, ctx.locals.len(), VarKind::Local)?;
    ctx.stack.push(ctx.locals[i]);
    Ok(Step::Next)
}

fn store_local(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let i = slot(instr.operand()?, ctx.locals.len(), VarKind::Local)?;
    ctx.locals[i] = ctx.pop(instr.op)?;
    Ok(Step::Next)
}

fn load_global(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let i = slot(instr.operand()?, ctx.globals.len(), VarKind::Global)?;
    ctx.stack.push(ctx.globals[i]);
    Ok(Step::Next)
}

fn store_global(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let index = instr.operand()?;
    let value = ctx.pop(instr.op)?;
    let i = slot(index, ctx.max_globals, VarKind::Global)?;
    if i >= ctx.globals.len() {
        ctx.globals.resize(i + 1, Value::Int(0));
    }
    ctx.globals[i] = value;
    ctx.dirty_globals.push(i);
    Ok(Step::Next)
}

fn print_i64(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let value = ctx.pop(instr.op)?.to_int()?;
    ctx.output.push(value.to_string());
    Ok(Step::Next)
}

fn print_bool(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    let value = ctx.pop(instr.op)?.to_bool();
    ctx.output.push(value.to_string());
    Ok(Step::Next)
}

fn ret(ctx: &mut ExecutionContext, instr: &Instr) -> Result<Step, VmError> {
    ctx.return_value = Some(ctx.pop(instr.op)?);
    Ok(Step::Exit)
}

fn ret_void(_: &mut ExecutionContext, _: &Instr) -> Result<Step, VmError> {
    Ok(Step::Exit)
}

fn halt(ctx: &mut ExecutionContext, _: &Instr) -> Result<Step, VmError> {
    Err(VmError::HaltInCompiledCode(ctx.func_index))
}
