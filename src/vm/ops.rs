use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::VmError;

/// Bytecode operations for the iris VM.
///
/// Each instruction is an opcode plus an optional signed 64-bit operand.
/// Jump operands are absolute indices into the program's instruction
/// stream; once a function body is extracted for compilation they become
/// relative to the body's first instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum OpCode {
    // ========================================
    // Constants & Stack Manipulation
    // ========================================
    PushI64,
    PushTrue,
    PushFalse,
    Pop,
    Dup,

    // ========================================
    // Arithmetic
    // ========================================
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,

    // ========================================
    // Comparison
    // ========================================
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,

    // ========================================
    // Logic
    // ========================================
    And,
    Or,
    Not,

    // ========================================
    // Control Flow
    // ========================================
    Jmp,
    JmpIfFalse,
    JmpIfTrue,

    // ========================================
    // Variables
    // ========================================
    LoadLocal,
    StoreLocal,
    LoadGlobal,
    StoreGlobal,

    // ========================================
    // Functions
    // ========================================
    Call,
    Ret,
    RetVoid,

    // ========================================
    // Heap
    // ========================================
    AllocArr,    // [size] -> [ref]
    LoadArr,     // [ref, index] -> [value]
    StoreArr,    // [ref, index, value] -> []
    AllocStruct, // operand = type index; [field_count] -> [ref]
    LoadField,   // operand = field index; [ref] -> [value]
    StoreField,  // operand = field index; [ref, value] -> []
    New,         // synonym for ALLOC_STRUCT

    // ========================================
    // Output & Termination
    // ========================================
    PrintI64,
    PrintBool,
    Halt,
}

impl OpCode {
    /// Every opcode, in discriminant order.
    pub const ALL: [OpCode; 40] = [
        OpCode::PushI64,
        OpCode::PushTrue,
        OpCode::PushFalse,
        OpCode::Pop,
        OpCode::Dup,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::Neg,
        OpCode::CmpEq,
        OpCode::CmpNe,
        OpCode::CmpLt,
        OpCode::CmpLe,
        OpCode::CmpGt,
        OpCode::CmpGe,
        OpCode::And,
        OpCode::Or,
        OpCode::Not,
        OpCode::Jmp,
        OpCode::JmpIfFalse,
        OpCode::JmpIfTrue,
        OpCode::LoadLocal,
        OpCode::StoreLocal,
        OpCode::LoadGlobal,
        OpCode::StoreGlobal,
        OpCode::Call,
        OpCode::Ret,
        OpCode::RetVoid,
        OpCode::AllocArr,
        OpCode::LoadArr,
        OpCode::StoreArr,
        OpCode::AllocStruct,
        OpCode::LoadField,
        OpCode::StoreField,
        OpCode::New,
        OpCode::PrintI64,
        OpCode::PrintBool,
        OpCode::Halt,
    ];

    pub const COUNT: usize = OpCode::Halt as usize + 1;

    pub fn from_u8(byte: u8) -> Option<OpCode> {
        OpCode::ALL.get(byte as usize).copied().filter(|op| *op as u8 == byte)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Opcodes that cannot execute without an operand.
    pub fn requires_operand(self) -> bool {
        matches!(
            self,
            OpCode::PushI64
                | OpCode::Jmp
                | OpCode::JmpIfFalse
                | OpCode::JmpIfTrue
                | OpCode::LoadLocal
                | OpCode::StoreLocal
                | OpCode::LoadGlobal
                | OpCode::StoreGlobal
                | OpCode::Call
                | OpCode::AllocStruct
                | OpCode::LoadField
                | OpCode::StoreField
                | OpCode::New
        )
    }

    pub fn is_jump(self) -> bool {
        matches!(self, OpCode::Jmp | OpCode::JmpIfFalse | OpCode::JmpIfTrue)
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::CmpEq
                | OpCode::CmpNe
                | OpCode::CmpLt
                | OpCode::CmpLe
                | OpCode::CmpGt
                | OpCode::CmpGe
                | OpCode::And
                | OpCode::Or
        )
    }

    pub fn is_unary(self) -> bool {
        matches!(self, OpCode::Neg | OpCode::Not)
    }

    /// Pushes of a value known at compile time.
    pub fn is_constant_push(self) -> bool {
        matches!(self, OpCode::PushI64 | OpCode::PushTrue | OpCode::PushFalse)
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::PushI64 => "PUSH_I64",
            OpCode::PushTrue => "PUSH_TRUE",
            OpCode::PushFalse => "PUSH_FALSE",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Neg => "NEG",
            OpCode::CmpEq => "CMP_EQ",
            OpCode::CmpNe => "CMP_NE",
            OpCode::CmpLt => "CMP_LT",
            OpCode::CmpLe => "CMP_LE",
            OpCode::CmpGt => "CMP_GT",
            OpCode::CmpGe => "CMP_GE",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Not => "NOT",
            OpCode::Jmp => "JMP",
            OpCode::JmpIfFalse => "JMP_IF_FALSE",
            OpCode::JmpIfTrue => "JMP_IF_TRUE",
            OpCode::LoadLocal => "LOAD_LOCAL",
            OpCode::StoreLocal => "STORE_LOCAL",
            OpCode::LoadGlobal => "LOAD_GLOBAL",
            OpCode::StoreGlobal => "STORE_GLOBAL",
            OpCode::Call => "CALL",
            OpCode::Ret => "RET",
            OpCode::RetVoid => "RET_VOID",
            OpCode::AllocArr => "ALLOC_ARR",
            OpCode::LoadArr => "LOAD_ARR",
            OpCode::StoreArr => "STORE_ARR",
            OpCode::AllocStruct => "ALLOC_STRUCT",
            OpCode::LoadField => "LOAD_FIELD",
            OpCode::StoreField => "STORE_FIELD",
            OpCode::New => "NEW",
            OpCode::PrintI64 => "PRINT_I64",
            OpCode::PrintBool => "PRINT_BOOL",
            OpCode::Halt => "HALT",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single instruction: opcode plus optional operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instr {
    pub op: OpCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<i64>,
}

impl Instr {
    pub const fn new(op: OpCode) -> Self {
        Self { op, operand: None }
    }

    pub const fn with(op: OpCode, operand: i64) -> Self {
        Self {
            op,
            operand: Some(operand),
        }
    }

    /// The operand, or `MissingOperand` naming this opcode.
    pub fn operand(&self) -> Result<i64, VmError> {
        self.operand.ok_or(VmError::MissingOperand(self.op))
    }

    /// The operand as a non-negative index (jump targets, function indices).
    pub fn target(&self) -> Result<usize, VmError> {
        let raw = self.operand()?;
        usize::try_from(raw).map_err(|_| VmError::InvalidJumpTarget(raw))
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Some(operand) => write!(f, "{} {}", self.op, operand),
            None => write!(f, "{}", self.op),
        }
    }
}
