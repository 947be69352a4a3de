//! Lowering: provider bytecode to the per-function form the emitters take.
//!
//! The optimizing variant runs two peephole passes, constant folding and
//! dead push elimination. Both passes remap jump targets, and neither
//! merges away an instruction that some jump lands on.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use crate::jit::api::{BytecodeProvider, FunctionMeta, JitError};
use crate::vm::{Instr, OpCode, Value, eval_binary, eval_unary};

/// A function ready for code emission. Jump targets are relative to the
/// first instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweredFunction {
    pub func_index: usize,
    pub meta: FunctionMeta,
    pub instructions: Vec<Instr>,
    /// For each instruction, the body offset of the provider instruction
    /// it came from. Folded pushes map to their first operand.
    pub origins: Vec<usize>,
}

impl LoweredFunction {
    /// Unoptimized lowering: every instruction is its own origin.
    pub fn new(func_index: usize, meta: FunctionMeta, instructions: Vec<Instr>) -> Self {
        let origins = (0..instructions.len()).collect();
        Self {
            func_index,
            meta,
            instructions,
            origins,
        }
    }

    /// Body offset in the source bytecode for lowered `pc`.
    pub fn origin(&self, pc: usize) -> usize {
        self.origins.get(pc).copied().unwrap_or(pc)
    }
}

pub trait Lowering: Send + Sync {
    fn lower(&self, func_index: usize) -> Result<LoweredFunction, JitError>;
}

/// Straight copy of the provider's bytecode.
pub struct BytecodeLowering {
    provider: Arc<dyn BytecodeProvider>,
}

impl BytecodeLowering {
    pub fn new(provider: Arc<dyn BytecodeProvider>) -> Self {
        Self { provider }
    }
}

impl Lowering for BytecodeLowering {
    fn lower(&self, func_index: usize) -> Result<LoweredFunction, JitError> {
        let meta = self.provider.function_meta(func_index)?;
        let instructions = self.provider.function_bytecode(func_index)?;
        Ok(LoweredFunction::new(func_index, meta, instructions))
    }
}

/// Lowering followed by constant folding and dead-code elimination.
pub struct OptimizingLowering {
    base: BytecodeLowering,
}

impl OptimizingLowering {
    pub fn new(provider: Arc<dyn BytecodeProvider>) -> Self {
        Self {
            base: BytecodeLowering::new(provider),
        }
    }
}

impl Lowering for OptimizingLowering {
    fn lower(&self, func_index: usize) -> Result<LoweredFunction, JitError> {
        let mut lowered = self.base.lower(func_index)?;
        let before = lowered.instructions.len();
        let (instructions, origins) = optimize_mapped(&lowered.instructions);
        lowered.instructions = instructions;
        lowered.origins = origins;
        trace!(
            target: "iris::jit",
            func_index,
            before,
            after = lowered.instructions.len(),
            "optimized"
        );
        Ok(lowered)
    }
}

/// Both passes, folding first.
pub fn optimize(code: &[Instr]) -> Vec<Instr> {
    optimize_mapped(code).0
}

/// Both passes, also returning each output instruction's offset in `code`.
pub fn optimize_mapped(code: &[Instr]) -> (Vec<Instr>, Vec<usize>) {
    let folded = fold_pass(code);
    let folded_code: Vec<Instr> = folded.iter().map(|s| s.instr).collect();
    eliminate_pass(&folded_code)
        .into_iter()
        .map(|slot| (slot.instr, folded[slot.origin].origin))
        .unzip()
}

// ============================================================================
// Passes
// ============================================================================

/// An output instruction plus the index of the original instruction it
/// starts at.
#[derive(Clone, Copy)]
struct Slot {
    instr: Instr,
    origin: usize,
}

/// Collapse constant pushes followed by an operator into one push.
/// Folds that would fail at runtime (division by zero, type errors) are
/// left in place so the error still happens when executed.
pub fn fold_constants(code: &[Instr]) -> Vec<Instr> {
    instructions(fold_pass(code))
}

fn fold_pass(code: &[Instr]) -> Vec<Slot> {
    let targets = jump_targets(code);
    let mut out: Vec<Slot> = Vec::with_capacity(code.len());

    for (origin, instr) in code.iter().enumerate() {
        out.push(Slot {
            instr: *instr,
            origin,
        });
        // Folding may enable another fold further left: ((1 + 2) * 3)
        while let Some(folded) = try_fold_tail(&out, &targets) {
            let (consumed, instr) = folded;
            let origin = out[out.len() - consumed].origin;
            out.truncate(out.len() - consumed);
            out.push(Slot { instr, origin });
        }
    }

    remap(code.len(), out)
}

fn try_fold_tail(out: &[Slot], targets: &HashSet<usize>) -> Option<(usize, Instr)> {
    let n = out.len();
    let last = out.last()?;
    let op = last.instr.op;

    if op.is_binary() && n >= 3 {
        let (left, right) = (&out[n - 3], &out[n - 2]);
        if targets.contains(&right.origin) || targets.contains(&last.origin) {
            return None;
        }
        let value = eval_binary(op, constant(&left.instr)?, constant(&right.instr)?).ok()?;
        return Some((3, push_constant(value)?));
    }
    if op.is_unary() && n >= 2 {
        let operand = &out[n - 2];
        if targets.contains(&last.origin) {
            return None;
        }
        let value = eval_unary(op, constant(&operand.instr)?).ok()?;
        return Some((2, push_constant(value)?));
    }
    None
}

/// Remove value-producing pushes (and DUP) that are immediately popped.
pub fn eliminate_dead_code(code: &[Instr]) -> Vec<Instr> {
    instructions(eliminate_pass(code))
}

fn eliminate_pass(code: &[Instr]) -> Vec<Slot> {
    let targets = jump_targets(code);
    let mut out: Vec<Slot> = Vec::with_capacity(code.len());

    for (origin, instr) in code.iter().enumerate() {
        let dead_pair = instr.op == OpCode::Pop
            && !targets.contains(&origin)
            && out
                .last()
                .is_some_and(|prev| prev.instr.op.is_constant_push() || prev.instr.op == OpCode::Dup);
        if dead_pair {
            out.pop();
            continue;
        }
        out.push(Slot {
            instr: *instr,
            origin,
        });
    }

    remap(code.len(), out)
}

fn constant(instr: &Instr) -> Option<Value> {
    match instr.op {
        OpCode::PushI64 => instr.operand.map(Value::Int),
        OpCode::PushTrue => Some(Value::Bool(true)),
        OpCode::PushFalse => Some(Value::Bool(false)),
        _ => None,
    }
}

fn push_constant(value: Value) -> Option<Instr> {
    match value {
        Value::Int(n) => Some(Instr::with(OpCode::PushI64, n)),
        Value::Bool(true) => Some(Instr::new(OpCode::PushTrue)),
        Value::Bool(false) => Some(Instr::new(OpCode::PushFalse)),
        Value::Ref(_) => None,
    }
}

fn jump_targets(code: &[Instr]) -> HashSet<usize> {
    code.iter()
        .filter(|i| i.op.is_jump())
        .filter_map(|i| i.operand)
        .filter_map(|t| usize::try_from(t).ok())
        .collect()
}

/// Rewrite jump operands from original indices to output indices. A
/// target whose instruction was removed lands on the next survivor.
fn remap(original_len: usize, out: Vec<Slot>) -> Vec<Slot> {
    let origins: Vec<usize> = out.iter().map(|s| s.origin).collect();
    out.into_iter()
        .map(|slot| {
            let instr = slot.instr;
            let instr = match instr.operand {
                Some(target) if instr.op.is_jump() => {
                    let new_target = usize::try_from(target)
                        .ok()
                        .filter(|t| *t <= original_len)
                        .map(|t| origins.partition_point(|origin| *origin < t) as i64)
                        .unwrap_or(target);
                    Instr::with(instr.op, new_target)
                }
                _ => instr,
            };
            Slot { instr, ..slot }
        })
        .collect()
}

fn instructions(slots: Vec<Slot>) -> Vec<Instr> {
    slots.into_iter().map(|s| s.instr).collect()
}
