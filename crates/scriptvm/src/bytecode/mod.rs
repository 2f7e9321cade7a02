// SPDX-License-Identifier: MIT

//! Opcode numbering and the bytecode [`Chunk`] container.
//!
//! The numbering in [`op`] matches the reference interpreter's `Opcode`
//! enum byte for byte, `OP_RESERVED_41` included: it names the slot a
//! single-fiber build leaves unused when fiber/yield bytecode is compiled
//! out, and keeping the gap means a disassembler trained on either
//! implementation reads the same stream.


use crate::value::Value;

/// Opcode byte values. Grouped and numbered exactly as the reference
/// interpreter's `Opcode` enum.
#[allow(clippy::unreadable_literal)]
pub mod op {
    // Literals (0-3)
    pub const CONSTANT: u8 = 0;
    pub const NIL: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const FALSE: u8 = 3;

    // Stack (4-7)
    pub const POP: u8 = 4;
    pub const HALT: u8 = 5;
    pub const NOT: u8 = 6;
    pub const DUP: u8 = 7;

    // Arithmetic (8-13)
    pub const ADD: u8 = 8;
    pub const SUBTRACT: u8 = 9;
    pub const MULTIPLY: u8 = 10;
    pub const DIVIDE: u8 = 11;
    pub const NEGATE: u8 = 12;
    pub const MODULO: u8 = 13;

    // Bitwise (14-19)
    pub const BITWISE_AND: u8 = 14;
    pub const BITWISE_OR: u8 = 15;
    pub const BITWISE_XOR: u8 = 16;
    pub const BITWISE_NOT: u8 = 17;
    pub const SHIFT_LEFT: u8 = 18;
    pub const SHIFT_RIGHT: u8 = 19;

    // Comparisons (20-25)
    pub const EQUAL: u8 = 20;
    pub const NOT_EQUAL: u8 = 21;
    pub const GREATER: u8 = 22;
    pub const GREATER_EQUAL: u8 = 23;
    pub const LESS: u8 = 24;
    pub const LESS_EQUAL: u8 = 25;

    // Variables (26-32)
    pub const GET_LOCAL: u8 = 26;
    pub const SET_LOCAL: u8 = 27;
    pub const GET_GLOBAL: u8 = 28;
    pub const SET_GLOBAL: u8 = 29;
    pub const DEFINE_GLOBAL: u8 = 30;
    pub const GET_PRIVATE: u8 = 31;
    pub const SET_PRIVATE: u8 = 32;

    // Control flow (33-37)
    pub const JUMP: u8 = 33;
    pub const JUMP_IF_FALSE: u8 = 34;
    pub const LOOP: u8 = 35;
    pub const GOSUB: u8 = 36;
    pub const RETURN_SUB: u8 = 37;

    // Functions (38-43)
    pub const CALL: u8 = 38;
    pub const RETURN: u8 = 39;
    /// Fast-path opcode for `array.push(value)`.
    pub const ARRAY_PUSH: u8 = 40;
    /// Reserved legacy opcode; single-fiber builds disable fiber/yield
    /// bytecode and leave this slot unassigned.
    pub const RESERVED_41: u8 = 41;
    pub const FRAME: u8 = 42;
    pub const EXIT: u8 = 43;

    // Collections (44-45)
    pub const DEFINE_ARRAY: u8 = 44;
    pub const DEFINE_MAP: u8 = 45;

    // Properties (46-49)
    pub const GET_PROPERTY: u8 = 46;
    pub const SET_PROPERTY: u8 = 47;
    pub const GET_INDEX: u8 = 48;
    pub const SET_INDEX: u8 = 49;

    // Methods (50-51)
    pub const INVOKE: u8 = 50;
    pub const SUPER_INVOKE: u8 = 51;

    // I/O (52-53)
    pub const PRINT: u8 = 52;
    pub const FUNC_LEN: u8 = 53;

    // Foreach / stack shuffling / exceptions (54-64)
    pub const ITER_NEXT: u8 = 54;
    pub const ITER_VALUE: u8 = 55;
    pub const COPY2: u8 = 56;
    pub const SWAP: u8 = 57;
    pub const DISCARD: u8 = 58;
    pub const TRY: u8 = 59;
    pub const POP_TRY: u8 = 60;
    pub const THROW: u8 = 61;
    pub const ENTER_CATCH: u8 = 62;
    pub const ENTER_FINALLY: u8 = 63;
    pub const EXIT_FINALLY: u8 = 64;

    // Math unary (65-78)
    pub const SIN: u8 = 65;
    pub const COS: u8 = 66;
    pub const TAN: u8 = 67;
    pub const ASIN: u8 = 68;
    pub const ACOS: u8 = 69;
    pub const ATAN: u8 = 70;
    pub const SQRT: u8 = 71;
    pub const ABS: u8 = 72;
    pub const LOG: u8 = 73;
    pub const FLOOR: u8 = 74;
    pub const CEIL: u8 = 75;
    pub const DEG: u8 = 76;
    pub const RAD: u8 = 77;
    pub const EXP: u8 = 78;

    // Math binary (79-80)
    pub const ATAN2: u8 = 79;
    pub const POW: u8 = 80;

    pub const CLOCK: u8 = 81;

    // Buffers / closures (82-87)
    pub const NEW_BUFFER: u8 = 82;
    pub const FREE: u8 = 83;
    pub const CLOSURE: u8 = 84;
    pub const GET_UPVALUE: u8 = 85;
    pub const SET_UPVALUE: u8 = 86;
    pub const CLOSE_UPVALUE: u8 = 87;

    // Multi-return (88)
    pub const RETURN_N: u8 = 88;

    // Type reference (89)
    pub const TYPE: u8 = 89;

    // Process utilities (90-91)
    pub const PROC: u8 = 90;
    pub const GET_ID: u8 = 91;

    /// Human-readable name for disassembly; `None` for unassigned bytes.
    #[must_use]
    pub fn name(code: u8) -> Option<&'static str> {
        Some(match code {
            CONSTANT => "CONSTANT",
            NIL => "NIL",
            TRUE => "TRUE",
            FALSE => "FALSE",
            POP => "POP",
            HALT => "HALT",
            NOT => "NOT",
            DUP => "DUP",
            ADD => "ADD",
            SUBTRACT => "SUBTRACT",
            MULTIPLY => "MULTIPLY",
            DIVIDE => "DIVIDE",
            NEGATE => "NEGATE",
            MODULO => "MODULO",
            BITWISE_AND => "BITWISE_AND",
            BITWISE_OR => "BITWISE_OR",
            BITWISE_XOR => "BITWISE_XOR",
            BITWISE_NOT => "BITWISE_NOT",
            SHIFT_LEFT => "SHIFT_LEFT",
            SHIFT_RIGHT => "SHIFT_RIGHT",
            EQUAL => "EQUAL",
            NOT_EQUAL => "NOT_EQUAL",
            GREATER => "GREATER",
            GREATER_EQUAL => "GREATER_EQUAL",
            LESS => "LESS",
            LESS_EQUAL => "LESS_EQUAL",
            GET_LOCAL => "GET_LOCAL",
            SET_LOCAL => "SET_LOCAL",
            GET_GLOBAL => "GET_GLOBAL",
            SET_GLOBAL => "SET_GLOBAL",
            DEFINE_GLOBAL => "DEFINE_GLOBAL",
            GET_PRIVATE => "GET_PRIVATE",
            SET_PRIVATE => "SET_PRIVATE",
            JUMP => "JUMP",
            JUMP_IF_FALSE => "JUMP_IF_FALSE",
            LOOP => "LOOP",
            GOSUB => "GOSUB",
            RETURN_SUB => "RETURN_SUB",
            CALL => "CALL",
            RETURN => "RETURN",
            ARRAY_PUSH => "ARRAY_PUSH",
            RESERVED_41 => "RESERVED_41",
            FRAME => "FRAME",
            EXIT => "EXIT",
            DEFINE_ARRAY => "DEFINE_ARRAY",
            DEFINE_MAP => "DEFINE_MAP",
            GET_PROPERTY => "GET_PROPERTY",
            SET_PROPERTY => "SET_PROPERTY",
            GET_INDEX => "GET_INDEX",
            SET_INDEX => "SET_INDEX",
            INVOKE => "INVOKE",
            SUPER_INVOKE => "SUPER_INVOKE",
            PRINT => "PRINT",
            FUNC_LEN => "FUNC_LEN",
            ITER_NEXT => "ITER_NEXT",
            ITER_VALUE => "ITER_VALUE",
            COPY2 => "COPY2",
            SWAP => "SWAP",
            DISCARD => "DISCARD",
            TRY => "TRY",
            POP_TRY => "POP_TRY",
            THROW => "THROW",
            ENTER_CATCH => "ENTER_CATCH",
            ENTER_FINALLY => "ENTER_FINALLY",
            EXIT_FINALLY => "EXIT_FINALLY",
            SIN => "SIN",
            COS => "COS",
            TAN => "TAN",
            ASIN => "ASIN",
            ACOS => "ACOS",
            ATAN => "ATAN",
            SQRT => "SQRT",
            ABS => "ABS",
            LOG => "LOG",
            FLOOR => "FLOOR",
            CEIL => "CEIL",
            DEG => "DEG",
            RAD => "RAD",
            EXP => "EXP",
            ATAN2 => "ATAN2",
            POW => "POW",
            CLOCK => "CLOCK",
            NEW_BUFFER => "NEW_BUFFER",
            FREE => "FREE",
            CLOSURE => "CLOSURE",
            GET_UPVALUE => "GET_UPVALUE",
            SET_UPVALUE => "SET_UPVALUE",
            CLOSE_UPVALUE => "CLOSE_UPVALUE",
            RETURN_N => "RETURN_N",
            TYPE => "TYPE",
            PROC => "PROC",
            GET_ID => "GET_ID",
            _ => return None,
        })
    }
}

/// A compiled unit of bytecode: the instruction stream, a parallel
/// source-line table, and the constant pool the stream indexes into.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<i32>,
    pub constants: Vec<Value>,
}

impl Chunk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one instruction byte, recording its source line.
    pub fn write_u8(&mut self, byte: u8, line: i32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Append a big-endian 16-bit operand.
    pub fn write_u16(&mut self, value: u16, line: i32) {
        let bytes = value.to_be_bytes();
        self.write_u8(bytes[0], line);
        self.write_u8(bytes[1], line);
    }

    /// Append a signed, big-endian 16-bit operand (used by `GOSUB`).
    pub fn write_i16(&mut self, value: i16, line: i32) {
        self.write_u16(value as u16, line);
    }

    /// Add `value` to the constant pool and return its index.
    ///
    /// # Panics
    /// Panics if the pool already holds `u16::MAX` constants — a chunk
    /// cannot index a larger pool with the 16-bit `CONSTANT` operand.
    pub fn add_constant(&mut self, value: Value) -> u16 {
        assert!(
            self.constants.len() < usize::from(u16::MAX),
            "constant pool exhausted"
        );
        self.constants.push(value);
        (self.constants.len() - 1) as u16
    }

    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    #[must_use]
    pub fn read_i16(&self, offset: usize) -> i16 {
        self.read_u16(offset) as i16
    }

    #[must_use]
    pub fn line_at(&self, offset: usize) -> i32 {
        self.lines.get(offset).copied().unwrap_or(-1)
    }

    #[must_use]
    pub fn constant(&self, index: u16) -> &Value {
        &self.constants[index as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}
