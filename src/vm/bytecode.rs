//! Program persistence.
//!
//! Binary format (all integers little-endian):
//! - Magic: "IRIS" (4 bytes)
//! - Version: u32
//! - Constant pool: u32 count + i64 values
//! - Functions: u32 count + (name, start_ip, param_count, local_count, returns_value)
//! - Instructions: u32 count + (u8 opcode, u8 has_operand, [i64 operand])
//!
//! Programs also serialize to JSON through serde.

use std::io::{self, Read, Write};
use std::path::Path;

use thiserror::Error;

use super::{BytecodeProgram, FunctionInfo, Instr, OpCode};

/// Magic bytes for iris bytecode files
pub const MAGIC: &[u8; 4] = b"IRIS";

/// Current bytecode format version
pub const VERSION: u32 = 1;

/// Error type for bytecode operations
#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid opcode: {0}")]
    InvalidOpcode(u8),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("{field} {value} does not fit the u32 encoding")]
    TooLarge { field: &'static str, value: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON program: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a program to bytes
pub fn serialize(program: &BytecodeProgram) -> Result<Vec<u8>, BytecodeError> {
    let mut buf = Vec::new();
    write_program(&mut buf, program)?;
    Ok(buf)
}

/// Deserialize a program from bytes
pub fn deserialize(data: &[u8]) -> Result<BytecodeProgram, BytecodeError> {
    let mut cursor = io::Cursor::new(data);
    read_program(&mut cursor)
}

pub fn to_json(program: &BytecodeProgram) -> Result<String, BytecodeError> {
    Ok(serde_json::to_string_pretty(program)?)
}

pub fn from_json(json: &str) -> Result<BytecodeProgram, BytecodeError> {
    Ok(serde_json::from_str(json)?)
}

/// Write a program to a file. `.json` paths use JSON, everything else
/// the binary format.
pub fn write_file(path: &Path, program: &BytecodeProgram) -> Result<(), BytecodeError> {
    let bytes = if is_json(path) {
        to_json(program)?.into_bytes()
    } else {
        serialize(program)?
    };
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Read a program written by [`write_file`].
pub fn read_file(path: &Path) -> Result<BytecodeProgram, BytecodeError> {
    let bytes = std::fs::read(path)?;
    if is_json(path) {
        let text = String::from_utf8(bytes).map_err(|_| BytecodeError::InvalidUtf8)?;
        from_json(&text)
    } else {
        deserialize(&bytes)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Write a program to a writer
pub fn write_program<W: Write>(w: &mut W, program: &BytecodeProgram) -> Result<(), BytecodeError> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;

    write_len(w, "constant count", program.const_pool.len())?;
    for value in &program.const_pool {
        write_i64(w, *value)?;
    }

    write_len(w, "function count", program.functions.len())?;
    for func in &program.functions {
        write_function(w, func)?;
    }

    write_len(w, "instruction count", program.instructions.len())?;
    for instr in &program.instructions {
        write_instr(w, instr)?;
    }

    Ok(())
}

/// Read a program from a reader
pub fn read_program<R: Read>(r: &mut R) -> Result<BytecodeProgram, BytecodeError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    if &magic != MAGIC {
        return Err(BytecodeError::InvalidMagic);
    }

    let version = read_u32(r)?;
    if version != VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }

    let const_count = read_u32(r)? as usize;
    let mut const_pool = Vec::with_capacity(const_count.min(4096));
    for _ in 0..const_count {
        const_pool.push(read_i64(r)?);
    }

    let func_count = read_u32(r)? as usize;
    let mut functions = Vec::with_capacity(func_count.min(4096));
    for _ in 0..func_count {
        functions.push(read_function(r)?);
    }

    let instr_count = read_u32(r)? as usize;
    let mut instructions = Vec::with_capacity(instr_count.min(1 << 16));
    for _ in 0..instr_count {
        instructions.push(read_instr(r)?);
    }

    Ok(BytecodeProgram {
        instructions,
        const_pool,
        functions,
    })
}

fn write_function<W: Write>(w: &mut W, func: &FunctionInfo) -> Result<(), BytecodeError> {
    write_string(w, &func.name)?;
    write_len(w, "start_ip", func.start_ip)?;
    write_len(w, "param_count", func.param_count)?;
    write_len(w, "local_count", func.local_count)?;
    w.write_all(&[u8::from(func.returns_value)])?;
    Ok(())
}

fn read_function<R: Read>(r: &mut R) -> Result<FunctionInfo, BytecodeError> {
    let name = read_string(r)?;
    let start_ip = read_u32(r)? as usize;
    let param_count = read_u32(r)? as usize;
    let local_count = read_u32(r)? as usize;
    let returns_value = read_u8(r)? != 0;
    Ok(FunctionInfo {
        name,
        start_ip,
        param_count,
        local_count,
        returns_value,
    })
}

fn write_instr<W: Write>(w: &mut W, instr: &Instr) -> io::Result<()> {
    w.write_all(&[instr.op as u8])?;
    match instr.operand {
        Some(operand) => {
            w.write_all(&[1])?;
            write_i64(w, operand)
        }
        None => w.write_all(&[0]),
    }
}

fn read_instr<R: Read>(r: &mut R) -> Result<Instr, BytecodeError> {
    let byte = read_u8(r)?;
    let op = OpCode::from_u8(byte).ok_or(BytecodeError::InvalidOpcode(byte))?;
    let operand = match read_u8(r)? {
        0 => None,
        _ => Some(read_i64(r)?),
    };
    Ok(Instr { op, operand })
}

// Helper functions for reading/writing primitives

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// A count or index stored as u32; refuses values that would truncate.
fn write_len<W: Write>(w: &mut W, field: &'static str, value: usize) -> Result<(), BytecodeError> {
    let encoded = u32::try_from(value).map_err(|_| BytecodeError::TooLarge { field, value })?;
    write_u32(w, encoded)?;
    Ok(())
}

fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<(), BytecodeError> {
    write_len(w, "name length", s.len())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, BytecodeError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, BytecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, BytecodeError> {
    let len = read_u32(r)? as usize;
    let mut buf = Vec::new();
    r.take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    if buf.len() != len {
        return Err(BytecodeError::UnexpectedEof);
    }
    String::from_utf8(buf).map_err(|_| BytecodeError::InvalidUtf8)
}
