// SPDX-License-Identifier: MIT

//! Metadata for callable units: script functions and process blueprints.
//!
//! A [`Function`] owns its [`Chunk`](crate::bytecode::Chunk) and describes
//! how a closure built over it should capture its upvalues. A
//! [`ProcessDef`] is the immutable template the process model clones when
//! a `CALL` targets a process blueprint (see [`crate::process`]).

#[cfg(test)]
mod mod_test;

use crate::bytecode::Chunk;
use crate::pool::StringId;

/// Describes how one upvalue slot of a closure built over this function is
/// populated when the `CLOSURE` instruction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueSource {
    /// Capture the enclosing frame's local at this slot index.
    Local(u8),
    /// Capture an existing upvalue of the enclosing closure at this index.
    Enclosing(u8),
}

/// A compiled function: arity, its upvalue capture plan, and its chunk.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: Option<StringId>,
    pub arity: u8,
    pub upvalues: Vec<UpvalueSource>,
    pub chunk: Chunk,
}

impl Function {
    #[must_use]
    pub fn new(name: Option<StringId>, arity: u8, chunk: Chunk) -> Self {
        Self {
            name,
            arity,
            upvalues: Vec::new(),
            chunk,
        }
    }

    #[must_use]
    pub fn upvalue_count(&self) -> usize {
        self.upvalues.len()
    }
}

/// Maps a declared process-definition argument to the private slot it is
/// copied into when the process is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateArgMapping {
    pub arg_index: u8,
    pub private_slot: u8,
}

/// Immutable template a process instance is cloned from. Produced by the
/// (external) compiler; the runtime only reads it.
#[derive(Debug, Clone)]
pub struct ProcessDef {
    pub name: StringId,
    pub root: crate::value::FunctionId,
    pub private_args: Vec<PrivateArgMapping>,
}

impl ProcessDef {
    #[must_use]
    pub fn new(name: StringId, root: crate::value::FunctionId) -> Self {
        Self {
            name,
            root,
            private_args: Vec::new(),
        }
    }
}
