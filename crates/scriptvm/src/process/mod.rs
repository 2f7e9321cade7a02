// SPDX-License-Identifier: MIT

//! The process/frame model: per-instance execution context cloned from a
//! [`ProcessDef`](crate::function::ProcessDef) blueprint.
//!
//! A [`Process`] owns everything `run_process` touches while it has
//! control: a value stack, a call-frame stack, a small subroutine
//! return-address stack for `GOSUB`/`RETURN_SUB`, a try-handler stack for
//! the exception protocol, and the 28 private slots scripts and host
//! bindings share (see [`private`]).

#[cfg(test)]
mod mod_test;

use crate::pool::StringId;
use crate::value::{ClosureId, FunctionId, ProcessDefId, ProcessId, Value};

/// Number of private slots every process carries.
pub const MAX_PRIVATES: usize = 28;
/// Capacity of the per-process value stack.
pub const STACK_MAX: usize = 1024;
/// Capacity of the per-process call-frame stack.
pub const FRAMES_MAX: usize = 1024;
/// Capacity of the per-process `GOSUB` return-address stack.
pub const GOSUB_MAX: usize = 16;
/// Capacity of the per-process try-handler stack.
pub const TRY_MAX: usize = 8;

/// Named private-slot indices agreed between the core and hosting
/// bindings. Slots beyond [`GROUP`] are reserved for binding-specific use
/// and have no core-assigned name.
pub mod private {
    pub const X: u8 = 0;
    pub const Y: u8 = 1;
    pub const Z: u8 = 2;
    pub const GRAPH: u8 = 3;
    pub const ANGLE: u8 = 4;
    pub const SIZE: u8 = 5;
    pub const FLAGS: u8 = 6;
    pub const ID: u8 = 7;
    pub const FATHER: u8 = 8;
    pub const RED: u8 = 9;
    pub const GREEN: u8 = 10;
    pub const BLUE: u8 = 11;
    pub const ALPHA: u8 = 12;
    pub const TAG: u8 = 13;
    pub const STATE: u8 = 14;
    pub const SPEED: u8 = 15;
    pub const GROUP: u8 = 16;

    /// `id` and `father` are assigned at spawn time and rejected on script
    /// writes.
    #[must_use]
    pub const fn is_read_only(slot: u8) -> bool {
        slot == ID || slot == FATHER
    }
}

/// Lifecycle state of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Suspended,
    Frozen,
    Dead,
}

/// One activation record on a process's call-frame stack.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub function: FunctionId,
    pub closure: Option<ClosureId>,
    pub ip: usize,
    /// Index into the owning process's value stack where this frame's
    /// slot window begins. Slot 0 holds the callee (or, for a method
    /// call, the receiver).
    pub base: usize,
    /// Number of arguments this call was actually made with, read back by
    /// `OP_FUNC_LEN`.
    pub arg_count: u8,
}

/// One entry on a process's try-handler stack, pushed by `OP_TRY` and
/// popped by `OP_POP_TRY` or after `OP_EXIT_FINALLY` drains it.
#[derive(Debug, Clone)]
pub struct TryHandler {
    pub catch_ip: Option<usize>,
    pub finally_ip: Option<usize>,
    pub stack_restore: usize,
    /// Number of call frames present when `OP_TRY` pushed this handler.
    /// Unwinding back to it must pop every frame called since, the same
    /// way a normal return pops exactly one.
    pub frame_depth: usize,
    pub in_finally: bool,
    pub catch_consumed: bool,
    pub pending_error: Option<Value>,
    pub pending_returns: Vec<Value>,
}

impl TryHandler {
    #[must_use]
    pub fn new(
        catch_ip: Option<usize>,
        finally_ip: Option<usize>,
        stack_restore: usize,
        frame_depth: usize,
    ) -> Self {
        Self {
            catch_ip,
            finally_ip,
            stack_restore,
            frame_depth,
            in_finally: false,
            catch_consumed: false,
            pending_error: None,
            pending_returns: Vec::new(),
        }
    }

    /// Snapshot used while unwinding: the handler stays on the process's
    /// try-stack (so `catch_consumed`/`in_finally` mutations made through
    /// it are visible), while the caller works from a cheap copy.
    #[must_use]
    pub fn clone_for_unwind(&self) -> Self {
        self.clone()
    }
}

/// A runtime clone of a [`ProcessDef`](crate::function::ProcessDef)
/// blueprint: the execution context `run_process` advances.
#[derive(Debug, Clone)]
pub struct Process {
    pub id: ProcessId,
    pub blueprint: ProcessDefId,
    pub state: ProcessState,
    pub privates: [Value; MAX_PRIVATES],
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub gosub_stack: Vec<usize>,
    pub try_stack: Vec<TryHandler>,
    pub name: Option<StringId>,
    pub exit_code: i32,
}

impl Process {
    #[must_use]
    pub fn new(id: ProcessId, blueprint: ProcessDefId) -> Self {
        Self {
            id,
            blueprint,
            state: ProcessState::Running,
            privates: [Value::Nil; MAX_PRIVATES],
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(8),
            gosub_stack: Vec::new(),
            try_stack: Vec::new(),
            name: None,
            exit_code: 0,
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !matches!(self.state, ProcessState::Dead)
    }

    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        matches!(self.state, ProcessState::Running)
    }

    /// Current value-stack depth, used as the "stack top" the spec
    /// refers to while execution is outside the inner loop.
    #[must_use]
    pub fn stack_top(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, value: Value) -> Result<(), crate::error::RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(crate::error::RuntimeError::StackOverflow {
                capacity: STACK_MAX,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    /// Peek `distance` entries below the current top (0 = top).
    #[must_use]
    pub fn peek(&self, distance: usize) -> Value {
        let len = self.stack.len();
        self.stack
            .get(len - 1 - distance)
            .copied()
            .unwrap_or(Value::Nil)
    }

    pub fn push_frame(&mut self, frame: CallFrame) -> Result<(), crate::error::FatalError> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(crate::error::FatalError::HeapCorruption {
                message: "call-frame stack overflow".to_string(),
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Read a private slot by index. Out-of-range reads return nil rather
    /// than faulting, matching property access on dead processes.
    #[must_use]
    pub fn get_private(&self, slot: u8) -> Value {
        self.privates
            .get(slot as usize)
            .copied()
            .unwrap_or(Value::Nil)
    }

    /// Write a private slot. Writes to a dead process, an out-of-range
    /// slot, or a read-only slot are silently ignored.
    pub fn set_private(&mut self, slot: u8, value: Value) {
        if !self.is_alive() || private::is_read_only(slot) {
            return;
        }
        if let Some(cell) = self.privates.get_mut(slot as usize) {
            *cell = value;
        }
    }

    /// Write a private slot unconditionally, bypassing the alive/read-only
    /// guards in [`set_private`](Self::set_private). Used only at spawn
    /// time to seed arguments mapped onto otherwise read-only slots.
    pub fn set_private_unchecked(&mut self, slot: u8, value: Value) {
        if let Some(cell) = self.privates.get_mut(slot as usize) {
            *cell = value;
        }
    }
}
