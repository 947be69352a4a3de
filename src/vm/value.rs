use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::VmError;
use super::heap::HeapAddr;
use super::ops::OpCode;

/// A tagged runtime value.
///
/// - Int: 64-bit signed integer
/// - Bool: true/false
/// - Ref: address of a heap object (array or struct)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Ref(HeapAddr),
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl Value {
    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Ref(_))
    }

    /// Numeric view. Booleans coerce to 0/1; references do not convert.
    pub fn to_int(&self) -> Result<i64, VmError> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Ref(_) => Err(VmError::InvalidConversion(*self)),
        }
    }

    /// Truthiness: nonzero ints, `true`, and every reference are true.
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Bool(b) => *b,
            Value::Ref(_) => true,
        }
    }

    pub fn as_addr(&self) -> Option<HeapAddr> {
        match self {
            Value::Ref(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Ref(_) => "ref",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Ref(addr) => write!(f, "<ref {}>", addr),
        }
    }
}

// ============================================================
// Shared operator semantics
// ============================================================
//
// The interpreter, both emitters and the constant folder evaluate
// operators through these two functions so every engine agrees on
// results. Arithmetic yields `Int`, comparisons and logic yield `Bool`.

/// Evaluate a binary operator. `left` is the operand pushed first.
pub fn eval_binary(op: OpCode, left: Value, right: Value) -> Result<Value, VmError> {
    let value = match op {
        OpCode::Add => Value::Int(left.to_int()?.wrapping_add(right.to_int()?)),
        OpCode::Sub => Value::Int(left.to_int()?.wrapping_sub(right.to_int()?)),
        OpCode::Mul => Value::Int(left.to_int()?.wrapping_mul(right.to_int()?)),
        OpCode::Div => {
            let divisor = right.to_int()?;
            if divisor == 0 {
                return Err(VmError::DivisionByZero);
            }
            Value::Int(left.to_int()?.wrapping_div(divisor))
        }
        OpCode::Mod => {
            let divisor = right.to_int()?;
            if divisor == 0 {
                return Err(VmError::DivisionByZero);
            }
            Value::Int(left.to_int()?.wrapping_rem(divisor))
        }
        OpCode::CmpEq => Value::Bool(values_equal(left, right)?),
        OpCode::CmpNe => Value::Bool(!values_equal(left, right)?),
        OpCode::CmpLt => Value::Bool(left.to_int()? < right.to_int()?),
        OpCode::CmpLe => Value::Bool(left.to_int()? <= right.to_int()?),
        OpCode::CmpGt => Value::Bool(left.to_int()? > right.to_int()?),
        OpCode::CmpGe => Value::Bool(left.to_int()? >= right.to_int()?),
        OpCode::And => Value::Bool(left.to_bool() && right.to_bool()),
        OpCode::Or => Value::Bool(left.to_bool() || right.to_bool()),
        other => return Err(VmError::UnsupportedOpcode(other)),
    };
    Ok(value)
}

/// Evaluate a unary operator.
pub fn eval_unary(op: OpCode, operand: Value) -> Result<Value, VmError> {
    match op {
        OpCode::Neg => Ok(Value::Int(operand.to_int()?.wrapping_neg())),
        OpCode::Not => Ok(Value::Bool(!operand.to_bool())),
        other => Err(VmError::UnsupportedOpcode(other)),
    }
}

// References compare by identity; everything else numerically.
fn values_equal(left: Value, right: Value) -> Result<bool, VmError> {
    match (left, right) {
        (Value::Ref(a), Value::Ref(b)) => Ok(a == b),
        (Value::Ref(_), _) | (_, Value::Ref(_)) => Ok(false),
        _ => Ok(left.to_int()? == right.to_int()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coercions() {
        assert_eq!(Value::Bool(true).to_int(), Ok(1));
        assert_eq!(Value::Bool(false).to_int(), Ok(0));
        assert!(Value::Int(-3).to_bool());
        assert!(!Value::Int(0).to_bool());
        assert!(Value::Ref(0).to_bool());
        assert!(matches!(
            Value::Ref(4).to_int(),
            Err(VmError::InvalidConversion(Value::Ref(4)))
        ));
    }

    #[test]
    fn test_operand_order() {
        assert_eq!(
            eval_binary(OpCode::Sub, Value::Int(10), Value::Int(3)),
            Ok(Value::Int(7))
        );
        assert_eq!(
            eval_binary(OpCode::CmpLt, Value::Int(1), Value::Int(2)),
            Ok(Value::Bool(true))
        );
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            eval_binary(OpCode::Div, Value::Int(1), Value::Int(0)),
            Err(VmError::DivisionByZero)
        );
        assert_eq!(
            eval_binary(OpCode::Mod, Value::Int(1), Value::Int(0)),
            Err(VmError::DivisionByZero)
        );
    }

    #[test]
    fn test_logic_uses_truthiness() {
        assert_eq!(
            eval_binary(OpCode::And, Value::Int(5), Value::Bool(true)),
            Ok(Value::Bool(true))
        );
        assert_eq!(eval_unary(OpCode::Not, Value::Int(0)), Ok(Value::Bool(true)));
        assert_eq!(eval_unary(OpCode::Neg, Value::Int(4)), Ok(Value::Int(-4)));
    }

    #[test]
    fn test_reference_equality() {
        assert_eq!(
            eval_binary(OpCode::CmpEq, Value::Ref(1), Value::Ref(1)),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            eval_binary(OpCode::CmpEq, Value::Ref(1), Value::Int(1)),
            Ok(Value::Bool(false))
        );
    }
}
