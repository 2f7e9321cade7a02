// SPDX-License-Identifier: MIT

//! Error taxonomy for the interpreter.
//!
//! [`RuntimeError`] values are *catchable*: they synthesise a script-visible
//! error value and enter the `try`/`catch`/`finally` machinery in
//! [`crate::vm`]. [`FatalError`] values are invariant violations — a corrupt
//! opcode, an unrecognised callee kind, heap corruption — that terminate the
//! offending process outright without giving script code a chance to catch
//! them.

#[cfg(test)]
mod mod_test;

use thiserror::Error;

/// A recoverable condition discovered by the interpreter. Every variant can
/// be caught by a script `try`/`catch` block.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("operator '{op}' does not support {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {index} out of range for {kind} of length {len}")]
    IndexOutOfRange {
        kind: &'static str,
        index: i64,
        len: usize,
    },
    #[error("undefined property '{name}' on {kind}")]
    UndefinedProperty { kind: &'static str, name: String },
    #[error("key '{key}' not found in map")]
    MapKeyNotFound { key: String },
    #[error("value stack overflow (capacity {capacity})")]
    StackOverflow { capacity: usize },
    #[error("call-frame stack overflow (capacity {capacity})")]
    CallFrameOverflow { capacity: usize },
    #[error("'{name}' is not callable")]
    NotCallable { name: String },
    #[error("expected {expected} argument(s), got {got}")]
    ArityMismatch { expected: i32, got: usize },
    #[error("uncaught exception: {message}")]
    Uncaught { message: String },
    #[error("{message}")]
    Host { message: String },
}

/// An invariant violation. These never enter the exception machinery; the
/// owning process is torn down immediately.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FatalError {
    #[error("invalid opcode {opcode} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    #[error("instruction pointer {ip} out of bounds (chunk length {len})")]
    IpOutOfBounds { ip: usize, len: usize },
    #[error("constant index {index} out of bounds (pool size {len})")]
    ConstantOutOfBounds { index: u16, len: usize },
    #[error("unrecognised callee kind '{kind}'")]
    UnknownCalleeKind { kind: &'static str },
    #[error("heap consistency failure: {message}")]
    HeapCorruption { message: String },
    #[error("gosub stack underflow or overflow")]
    GosubStack,
    #[error("try-handler stack underflow or overflow")]
    TryHandlerStack,
}

/// Either flavor of failure a process's execution can end in.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VmError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}
