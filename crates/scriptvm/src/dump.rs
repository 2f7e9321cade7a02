// SPDX-License-Identifier: MIT

//! Textual bytecode disassembler, gated behind the `bytecode-dump` feature
//! (spec §6 "Configuration toggles", `BU_ENABLE_BYTECODE_DUMP`).
//!
//! This is a diagnostics-only facility: the spec requires no persisted
//! binary format, so [`disassemble`] works directly against an in-memory
//! [`Chunk`] and produces one line per instruction (opcode name plus
//! decoded operands), matching the reference interpreter's debug dumper.

#[cfg(test)]
mod dump_test;

use std::fmt::Write as _;

use crate::bytecode::{op, Chunk};

/// Operand width an opcode reads, used to decide how many bytes to skip
/// to the next instruction and how to render the operand.
enum Operand {
    None,
    U8,
    U16,
    I16,
    /// `CLOSURE`'s operand is a `u16` constant index followed by one
    /// `(u8, u8)` pair per upvalue; the pair count isn't encoded in the
    /// instruction stream itself, so the disassembler can only show the
    /// constant index and stop there (same limitation the reference
    /// dumper has without a companion function table).
    ConstU16,
    /// `TRY`'s operand is two `u16`s (catch ip, finally ip).
    U16U16,
    /// `INVOKE`'s operand is a `u16` method-name constant followed by a
    /// `u8` argument count.
    U16U8,
    /// `SUPER_INVOKE`'s operand is a `u16` method-name constant, a `u8`
    /// argument count, then a `u16` owner-class constant.
    U16U8U16,
}

fn operand_of(opcode: u8) -> Operand {
    match opcode {
        op::CONSTANT
        | op::GET_GLOBAL
        | op::SET_GLOBAL
        | op::DEFINE_GLOBAL
        | op::JUMP
        | op::JUMP_IF_FALSE
        | op::LOOP
        | op::DEFINE_ARRAY
        | op::DEFINE_MAP
        | op::GET_PROPERTY
        | op::SET_PROPERTY => Operand::U16,
        op::GOSUB => Operand::I16,
        op::GET_LOCAL
        | op::SET_LOCAL
        | op::GET_PRIVATE
        | op::SET_PRIVATE
        | op::CALL
        | op::ARRAY_PUSH
        | op::PRINT
        | op::DISCARD
        | op::GET_UPVALUE
        | op::SET_UPVALUE => Operand::U8,
        op::INVOKE => Operand::U16U8,
        op::SUPER_INVOKE => Operand::U16U8U16,
        op::CLOSURE => Operand::ConstU16,
        op::TRY => Operand::U16U16,
        _ => Operand::None,
    }
}

/// Disassemble `chunk` into one line per instruction:
/// `<offset> <line> <OPCODE> [operand]`. Unknown opcodes render as
/// `??? <byte>` rather than aborting the dump.
#[must_use]
pub fn disassemble(chunk: &Chunk) -> String {
    let mut out = String::new();
    let mut offset = 0usize;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }
    if !chunk.constants.is_empty() {
        let _ = writeln!(out, "\nconstants:");
        for (i, c) in chunk.constants.iter().enumerate() {
            let _ = writeln!(out, "  {i:04} {c:?}");
        }
    }
    out
}

/// Disassemble exactly one instruction at `offset`, appending its line to
/// `out`, and return the offset of the next instruction.
fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let code = chunk.read_u8(offset);
    let line = chunk.line_at(offset);
    let same_line = offset > 0 && chunk.line_at(offset - 1) == line;
    let line_col = if same_line {
        "   |".to_string()
    } else {
        format!("{line:4}")
    };
    let name = op::name(code).unwrap_or("???");
    let _ = write!(out, "{offset:04} {line_col} {name}");

    let next = match operand_of(code) {
        Operand::None => offset + 1,
        Operand::U8 => {
            let v = chunk.read_u8(offset + 1);
            let _ = write!(out, " {v}");
            offset + 2
        }
        Operand::U16 => {
            let v = chunk.read_u16(offset + 1);
            let _ = write!(out, " {v}");
            offset + 3
        }
        Operand::I16 => {
            let v = chunk.read_i16(offset + 1);
            let _ = write!(out, " {v}");
            offset + 3
        }
        Operand::ConstU16 => {
            let v = chunk.read_u16(offset + 1);
            let _ = write!(out, " const={v}");
            offset + 3
        }
        Operand::U16U16 => {
            let a = chunk.read_u16(offset + 1);
            let b = chunk.read_u16(offset + 3);
            let _ = write!(out, " catch={a} finally={b}");
            offset + 5
        }
        Operand::U16U8 => {
            let name = chunk.read_u16(offset + 1);
            let argc = chunk.read_u8(offset + 3);
            let _ = write!(out, " name={name} argc={argc}");
            offset + 4
        }
        Operand::U16U8U16 => {
            let name = chunk.read_u16(offset + 1);
            let argc = chunk.read_u8(offset + 3);
            let owner = chunk.read_u16(offset + 4);
            let _ = write!(out, " name={name} argc={argc} owner={owner}");
            offset + 6
        }
    };
    out.push('\n');
    next
}
