//! Stack-depth verification for function bodies.
//!
//! Runs an abstract interpretation of operand-stack height over a
//! function-relative body, checking that:
//! - No instruction pops more than the stack holds
//! - Every path reaching an instruction agrees on the stack height
//! - Jump targets stay inside the body
//! - No path runs past the last instruction
//!
//! The maximum height seen is the body's stack limit.

use std::collections::VecDeque;

use thiserror::Error;

use super::{FunctionInfo, Instr, OpCode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("stack underflow at pc {pc}: {op} needs {required}, stack has {actual}")]
    StackUnderflow {
        pc: usize,
        op: OpCode,
        required: usize,
        actual: usize,
    },
    #[error("stack height mismatch at pc {pc}: expected {expected}, found {actual}")]
    StackHeightMismatch {
        pc: usize,
        expected: usize,
        actual: usize,
    },
    #[error("jump at pc {pc} targets {target}, outside a body of {len} instructions")]
    InvalidJumpTarget { pc: usize, target: i64, len: usize },
    #[error("missing operand for {op} at pc {pc}")]
    MissingOperand { pc: usize, op: OpCode },
    #[error("call at pc {pc} to unknown function {index}")]
    UnknownFunction { pc: usize, index: i64 },
    #[error("control leaves the body after pc {pc} without RET, RET_VOID or HALT")]
    FallsOffEnd { pc: usize },
}

/// Verify `body` and return its maximum operand-stack height.
///
/// Jump operands must already be relative to the body start. Every
/// reachable path must end in RET, RET_VOID or HALT: the interpreter would
/// carry on into whatever follows the body, which compiled code cannot.
pub fn analyze(body: &[Instr], functions: &[FunctionInfo]) -> Result<usize, VerifyError> {
    let len = body.len();
    if len == 0 {
        return Ok(0);
    }

    // Stack height on entry to each instruction (None = not yet reached)
    let mut heights: Vec<Option<usize>> = vec![None; len];
    let mut worklist: VecDeque<usize> = VecDeque::new();
    let mut max_height = 0;

    // Parameters live in locals, so bodies start with an empty stack
    heights[0] = Some(0);
    worklist.push_back(0);

    while let Some(pc) = worklist.pop_front() {
        let Some(height) = heights[pc] else {
            continue;
        };
        let instr = &body[pc];
        let (pops, pushes) = stack_effect(pc, instr, functions)?;

        if height < pops {
            return Err(VerifyError::StackUnderflow {
                pc,
                op: instr.op,
                required: pops,
                actual: height,
            });
        }
        let after = height - pops + pushes;
        max_height = max_height.max(after).max(height);

        for succ in successors(pc, instr, len)? {
            if succ == len {
                return Err(VerifyError::FallsOffEnd { pc });
            }
            match heights[succ] {
                None => {
                    heights[succ] = Some(after);
                    worklist.push_back(succ);
                }
                Some(existing) if existing != after => {
                    return Err(VerifyError::StackHeightMismatch {
                        pc: succ,
                        expected: existing,
                        actual: after,
                    });
                }
                Some(_) => {}
            }
        }
    }

    Ok(max_height)
}

fn successors(pc: usize, instr: &Instr, len: usize) -> Result<Vec<usize>, VerifyError> {
    let target = || -> Result<usize, VerifyError> {
        let raw = instr.operand.ok_or(VerifyError::MissingOperand { pc, op: instr.op })?;
        usize::try_from(raw)
            .ok()
            .filter(|t| *t <= len)
            .ok_or(VerifyError::InvalidJumpTarget {
                pc,
                target: raw,
                len,
            })
    };
    Ok(match instr.op {
        OpCode::Jmp => vec![target()?],
        OpCode::JmpIfFalse | OpCode::JmpIfTrue => vec![pc + 1, target()?],
        OpCode::Ret | OpCode::RetVoid | OpCode::Halt => vec![],
        _ => vec![pc + 1],
    })
}

/// Get the stack effect of an instruction: (pops, pushes)
fn stack_effect(
    pc: usize,
    instr: &Instr,
    functions: &[FunctionInfo],
) -> Result<(usize, usize), VerifyError> {
    if instr.op.requires_operand() && instr.operand.is_none() {
        return Err(VerifyError::MissingOperand { pc, op: instr.op });
    }
    let effect = match instr.op {
        OpCode::PushI64 | OpCode::PushTrue | OpCode::PushFalse => (0, 1),
        OpCode::Pop => (1, 0),
        OpCode::Dup => (1, 2),
        op if op.is_binary() => (2, 1),
        op if op.is_unary() => (1, 1),
        OpCode::Jmp => (0, 0),
        OpCode::JmpIfFalse | OpCode::JmpIfTrue => (1, 0),
        OpCode::LoadLocal | OpCode::LoadGlobal => (0, 1),
        OpCode::StoreLocal | OpCode::StoreGlobal => (1, 0),
        OpCode::Call => {
            let index = instr.operand.unwrap_or(-1);
            let callee = usize::try_from(index)
                .ok()
                .and_then(|i| functions.get(i))
                .ok_or(VerifyError::UnknownFunction { pc, index })?;
            (callee.param_count, usize::from(callee.returns_value))
        }
        OpCode::Ret => (1, 0),
        OpCode::RetVoid | OpCode::Halt => (0, 0),
        OpCode::AllocArr => (1, 1),
        OpCode::LoadArr => (2, 1),
        OpCode::StoreArr => (3, 0),
        OpCode::AllocStruct | OpCode::New => (1, 1),
        OpCode::LoadField => (1, 1),
        OpCode::StoreField => (2, 0),
        OpCode::PrintI64 | OpCode::PrintBool => (1, 0),
        // binary and unary opcodes are covered by the guards above
        _ => (0, 0),
    };
    Ok(effect)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(n: i64) -> Instr {
        Instr::with(OpCode::PushI64, n)
    }

    #[test]
    fn test_simple_body() {
        let body = vec![push(1), push(2), Instr::new(OpCode::Add), Instr::new(OpCode::Ret)];
        assert_eq!(analyze(&body, &[]), Ok(2));
    }

    #[test]
    fn test_underflow() {
        let body = vec![push(1), Instr::new(OpCode::Add)];
        assert!(matches!(
            analyze(&body, &[]),
            Err(VerifyError::StackUnderflow {
                pc: 1,
                op: OpCode::Add,
                required: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_loop_with_consistent_height() {
        // i = 0; while i < 3 { i = i + 1 }; ret void
        let body = vec![
            push(0),
            Instr::with(OpCode::StoreLocal, 0),
            Instr::with(OpCode::LoadLocal, 0),
            push(3),
            Instr::new(OpCode::CmpLt),
            Instr::with(OpCode::JmpIfFalse, 11),
            Instr::with(OpCode::LoadLocal, 0),
            push(1),
            Instr::new(OpCode::Add),
            Instr::with(OpCode::StoreLocal, 0),
            Instr::with(OpCode::Jmp, 2),
            Instr::new(OpCode::RetVoid),
        ];
        assert_eq!(analyze(&body, &[]), Ok(2));
    }

    #[test]
    fn test_height_mismatch() {
        let body = vec![
            Instr::new(OpCode::PushTrue),
            Instr::with(OpCode::JmpIfTrue, 3),
            push(1),
            Instr::new(OpCode::RetVoid),
        ];
        assert!(matches!(
            analyze(&body, &[]),
            Err(VerifyError::StackHeightMismatch { pc: 3, .. })
        ));
    }

    #[test]
    fn test_falling_off_the_end() {
        let body = vec![push(1), Instr::new(OpCode::PrintI64)];
        assert_eq!(analyze(&body, &[]), Err(VerifyError::FallsOffEnd { pc: 1 }));

        // A jump to one past the end leaves the body too
        let body = vec![
            Instr::new(OpCode::PushTrue),
            Instr::with(OpCode::JmpIfTrue, 3),
            Instr::new(OpCode::RetVoid),
        ];
        assert_eq!(analyze(&body, &[]), Err(VerifyError::FallsOffEnd { pc: 1 }));

        // An unreachable tail without a terminator is fine
        let body = vec![Instr::new(OpCode::RetVoid), push(1)];
        assert_eq!(analyze(&body, &[]), Ok(0));
    }

    #[test]
    fn test_jump_out_of_body() {
        let body = vec![Instr::with(OpCode::Jmp, 9)];
        assert!(matches!(
            analyze(&body, &[]),
            Err(VerifyError::InvalidJumpTarget { target: 9, .. })
        ));
    }

    #[test]
    fn test_call_uses_callee_signature() {
        let functions = vec![FunctionInfo::new("add", 0, 2, 2, true)];
        let body = vec![push(1), push(2), Instr::with(OpCode::Call, 0), Instr::new(OpCode::Ret)];
        assert_eq!(analyze(&body, &functions), Ok(2));

        let unknown = vec![Instr::with(OpCode::Call, 3)];
        assert!(matches!(
            analyze(&unknown, &functions),
            Err(VerifyError::UnknownFunction { index: 3, .. })
        ));
    }
}
