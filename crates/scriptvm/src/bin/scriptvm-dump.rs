// SPDX-License-Identifier: MIT

//! Standalone disassembler binary, built only with `--features bytecode-dump`.
//!
//! There is no persisted chunk format to load (spec §6): the core never
//! serialises bytecode to disk, it only ever holds chunks an in-process
//! compiler front end just built. Given a file path, this binary treats
//! its bytes as a raw opcode stream (no constant pool, no line table) and
//! disassembles it as-is; given no argument, it disassembles a small
//! built-in sample chunk so the tool is useful without a front end on
//! hand.

use scriptvm::bytecode::{op, Chunk};
use scriptvm::dump::disassemble;
use scriptvm::value::Value;

fn sample_chunk() -> Chunk {
    // return 3 + 0.5
    let mut chunk = Chunk::new();
    let three = chunk.add_constant(Value::Int(3));
    let half = chunk.add_constant(Value::Double(0.5));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(three, 1);
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(half, 1);
    chunk.write_u8(op::ADD, 1);
    chunk.write_u8(op::RETURN_N, 1);
    chunk.write_u8(1, 1);
    chunk
}

fn main() {
    let mut args = std::env::args().skip(1);
    let chunk = match args.next() {
        Some(path) => match std::fs::read(&path) {
            Ok(bytes) => Chunk {
                lines: vec![-1; bytes.len()],
                code: bytes,
                constants: Vec::new(),
            },
            Err(err) => {
                eprintln!("scriptvm-dump: cannot read '{path}': {err}");
                std::process::exit(1);
            }
        },
        None => sample_chunk(),
    };

    print!("{}", disassemble(&chunk));
}
