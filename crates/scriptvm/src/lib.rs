// SPDX-License-Identifier: MIT

//! # scriptvm
//!
//! A bytecode virtual machine for an embeddable, dynamically-typed,
//! class-aware scripting language. The interpreter cooperatively
//! multiplexes many lightweight script-defined "processes", each owning an
//! independent call stack and a fixed block of per-instance private slots.
//!
//! This crate is the CORE runtime only: it registers chunks a compiler
//! front end produced and runs them. It does not parse source text — see
//! [`Vm::define_function`] and friends for how a front end publishes
//! compiled units into the runtime.
//!
//! Layout, leaves first:
//! - [`arena`]: bump allocator backing short-lived host-side scratch
//!   buffers.
//! - [`pool`]: the string interning pool.
//! - [`value`]: the tagged [`value::Value`] union and its handle types.
//! - [`object`]: heap object bodies (array, map, buffer, struct/class
//!   instances, closures, upvalues).
//! - [`gc`]: the managed heap and its mark-and-sweep collector.
//! - [`bytecode`]: opcode numbering and the [`bytecode::Chunk`] container.
//! - [`dump`] (feature `bytecode-dump`): textual disassembler for
//!   diagnostics; no persisted binary format is required by the core.
//! - [`function`]: compiled function and process-blueprint metadata.
//! - [`class`]: script class/struct blueprints and method resolution.
//! - [`process`]: the per-instance execution context.
//! - [`error`]: the runtime/fatal error taxonomy.
//! - [`vm`]: the opcode dispatch loop.
//! - [`host`]: the native function/class/struct/process registration
//!   surface and the re-entrant host↔script call protocol.
//! - [`scheduler`]: process spawning, the driver tick, and signal
//!   primitives.

pub mod arena;
pub mod bytecode;
pub mod class;
#[cfg(feature = "bytecode-dump")]
pub mod dump;
pub mod error;
pub mod function;
pub mod gc;
pub mod host;
pub mod object;
pub mod pool;
pub mod process;
pub mod scheduler;
pub mod value;
pub mod vm;

pub use error::{FatalError, RuntimeError, VmError};
pub use process::{Process, ProcessState};
pub use value::Value;
pub use vm::{ProcessOutcome, Vm};
