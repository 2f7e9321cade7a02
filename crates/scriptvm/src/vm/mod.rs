// SPDX-License-Identifier: MIT

//! The opcode dispatch loop and the runtime state it operates over.
//!
//! [`Vm`] bundles every piece of state a running process can reach: the
//! managed heap, the string pool, the global-variable array, the compiled
//! function table, the class/struct registries, process blueprints, and
//! the native registries the host embedding layer populates. It also owns
//! the table of live process instances, so that [`Vm::collect_garbage`]
//! can enumerate every root the collector is required to see (see spec
//! §4.4): this is the one place the teacher's realm-style "shared state
//! reachable from every process" pattern reappears, generalized from a
//! seL4 IPC registry to a plain owned `Vec<Process>`.
//!
//! [`Vm::run_process`] drives one process until it yields a frame
//! (`OP_FRAME`), finishes (return from its root frame or `OP_EXIT`), hits
//! a call-boundary marker set by a re-entrant host call, or faults.

#[cfg(test)]
mod mod_test;

use std::time::Instant;

use crate::arena::Arena;
use crate::bytecode::op;
use crate::class::{ClassRegistry, StructRegistry};
use crate::error::{FatalError, RuntimeError, VmError};
use crate::function::{Function, ProcessDef, UpvalueSource};
use crate::gc::Heap;
use crate::object::{
    Array, Buffer, Closure, ClassInstance, ElementType, Map, NativeClassInstance,
    NativeStructInstance, StructInstance, Upvalue,
};
use crate::pool::StringPool;
use crate::process::{private, CallFrame, Process, ProcessState, TryHandler};
use crate::value::{
    ClassId, ClassInstanceId, ClosureId, FunctionId, ModuleRef, NativeClassId,
    NativeClassInstanceId, NativeFnId, NativeProcessId, NativeStructId, ProcessDefId, ProcessId,
    StructDefId, UpvalueId, Value,
};

/// Outcome of driving a process with [`Vm::run_process`].
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The process finished: returned from its root frame, or hit
    /// `OP_EXIT`. Carries the return value (or exit code, as an integer
    /// value, for `OP_EXIT`).
    Done(Value),
    /// The process executed `OP_FRAME` and is yielding control back to
    /// the scheduler for this tick. Carries the driver hint integer.
    Frame(i64),
    /// A re-entrant host call (`callFunction`/`callMethod`/`callProcess`)
    /// reached its call-boundary marker. Carries the top-of-stack result.
    CallReturn(Value),
}

/// A registered native function: `fn(vm, process, args) -> Result<returns>`.
/// `arity < 0` disables arity checking, matching `registerNative`'s
/// contract.
pub type NativeFn = fn(&mut Vm, &mut Process, &[Value]) -> Result<Vec<Value>, RuntimeError>;

#[derive(Clone, Copy)]
pub struct NativeFnEntry {
    pub func: NativeFn,
    pub arity: i32,
}

/// Host-supplied module function, reached through `OP_CALL` on a
/// [`Value::ModuleRef`].
pub type ModuleFn = fn(&mut Vm, &mut Process, &[Value]) -> Result<Vec<Value>, RuntimeError>;

/// Opaque payload constructor/destructor pair for a native class.
pub type NativeClassCtor =
    fn(&mut Vm, &mut Process, &[Value]) -> Result<crate::object::NativeUserData, RuntimeError>;
pub type NativeClassDtor = fn(&mut crate::object::NativeUserData);
pub type NativeMethodFn = fn(
    &mut Vm,
    &mut Process,
    &mut crate::object::NativeUserData,
    &[Value],
) -> Result<Vec<Value>, RuntimeError>;

pub struct NativeClassEntry {
    pub name: crate::pool::StringId,
    pub ctor: NativeClassCtor,
    pub dtor: Option<NativeClassDtor>,
    pub arg_count: i32,
    pub persistent: bool,
    pub methods: std::collections::HashMap<crate::pool::StringId, NativeMethodFn>,
    pub properties: std::collections::HashMap<crate::pool::StringId, NativeProperty>,
}

/// Getter/setter pair backing a native property (spec §4.6 property
/// access on a class instance whose ancestor is a native class, and on a
/// direct native-class instance). `setter` is `None` for a read-only
/// property.
pub type NativePropertyGetter = fn(&Vm, &crate::object::NativeUserData) -> Value;
pub type NativePropertySetter = fn(&mut Vm, &mut crate::object::NativeUserData, Value);

#[derive(Clone, Copy)]
pub struct NativeProperty {
    pub getter: NativePropertyGetter,
    pub setter: Option<NativePropertySetter>,
}

/// Primitive marshalling type for one field of a native struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativePrimitive {
    U8,
    I32,
    U32,
    F32,
    F64,
}

impl NativePrimitive {
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            NativePrimitive::U8 => 1,
            NativePrimitive::I32 | NativePrimitive::U32 | NativePrimitive::F32 => 4,
            NativePrimitive::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NativeFieldDesc {
    pub offset: usize,
    pub ty: NativePrimitive,
    pub read_only: bool,
}

pub struct NativeStructEntry {
    pub name: crate::pool::StringId,
    pub size: usize,
    pub ctor: fn(&mut Vm, &mut Process, &mut [u8], &[Value]) -> Result<(), RuntimeError>,
    pub dtor: Option<fn(&mut [u8])>,
    pub persistent: bool,
    pub fields: std::collections::HashMap<crate::pool::StringId, NativeFieldDesc>,
}

/// A host callback running with privileged access to the current
/// process's private slots (DIV-style built-ins).
pub type NativeProcessFn =
    fn(&mut Vm, &mut Process, &[Value]) -> Result<Vec<Value>, RuntimeError>;

#[derive(Clone, Copy)]
pub struct NativeProcessEntry {
    pub func: NativeProcessFn,
    pub arity: i32,
}

/// Every registry the host embedding layer populates.
#[derive(Default)]
pub struct NativeRegistry {
    pub fns: Vec<NativeFnEntry>,
    pub fn_names: Vec<crate::pool::StringId>,
    pub modules: Vec<Vec<ModuleFn>>,
    pub module_names: Vec<crate::pool::StringId>,
    pub classes: Vec<NativeClassEntry>,
    pub structs: Vec<NativeStructEntry>,
    pub processes: Vec<NativeProcessEntry>,
}

/// Optional embedder hooks fired on process spawn/teardown.
#[derive(Default)]
pub struct VmHooks {
    pub on_create: Option<fn(&mut Vm, ProcessId)>,
    pub on_destroy: Option<fn(&mut Vm, ProcessId, i32)>,
}

/// All interpreter-owned state: heap, string pool, globals, code tables,
/// registries, and the live process list.
pub struct Vm {
    pub heap: Heap,
    pub pool: StringPool,
    pub globals: Vec<Value>,
    pub global_names: Vec<crate::pool::StringId>,
    pub functions: Vec<Function>,
    pub classes: ClassRegistry,
    pub structs: StructRegistry,
    pub process_defs: Vec<ProcessDef>,
    pub natives: NativeRegistry,
    pub hooks: VmHooks,
    pub processes: Vec<Process>,
    /// Bulk allocator for short-lived host-side scratch buffers (e.g. the
    /// zero-filled byte-exact region a native struct constructor runs
    /// against before its contents are copied into the heap, see
    /// `crate::host`).
    pub arena: Arena,
    open_upvalues: Vec<UpvalueId>,
    next_process_id: u32,
    started_at: Instant,
    /// When set, `run_process` returns `CallReturn` as soon as the named
    /// process's frame count drops to this value, implementing the
    /// `stopOnCallReturn` re-entrant call boundary (spec §4.9/§5).
    pub(crate) call_boundary: Option<(ProcessId, usize)>,
    /// Controls how much detail an uncaught exception logs (spec §7):
    /// a single concise line when `false`, that line plus a per-frame
    /// stack trace (function name and source line) when `true`. Defaults
    /// to the host crate's own debug/release build.
    pub debug_mode: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: Heap::new(),
            pool: StringPool::new(),
            globals: Vec::new(),
            global_names: Vec::new(),
            functions: Vec::new(),
            classes: ClassRegistry::new(),
            structs: StructRegistry::new(),
            process_defs: Vec::new(),
            natives: NativeRegistry::default(),
            hooks: VmHooks::default(),
            processes: Vec::new(),
            arena: Arena::new(),
            open_upvalues: Vec::new(),
            next_process_id: 1,
            started_at: Instant::now(),
            call_boundary: None,
            debug_mode: cfg!(debug_assertions),
        }
    }

    /// Override the default debug/release stack-trace verbosity (spec §7).
    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.debug_mode = enabled;
    }

    /// Render a per-frame stack trace for `process_index`'s current call
    /// stack: one line per frame, innermost first, naming the function and
    /// its current source line. Used only when [`debug_mode`](Self::debug_mode)
    /// is set (spec §7, "in debug mode: per-frame function name and source
    /// line").
    fn format_stack_trace(&self, process_index: usize) -> String {
        let mut out = String::new();
        for frame in self.processes[process_index].frames.iter().rev() {
            let func = &self.functions[frame.function.index() as usize];
            let name = func
                .name
                .map_or_else(|| "<anonymous>".to_string(), |id| self.pool.as_str(id).to_string());
            let line = func.chunk.line_at(frame.ip);
            out.push_str(&format!("  at {name} (line {line})\n"));
        }
        out
    }

    // ---- process table -----------------------------------------------------

    #[must_use]
    pub fn find_process_index(&self, id: ProcessId) -> Option<usize> {
        self.processes.iter().position(|p| p.id == id)
    }

    #[must_use]
    pub fn find_process(&self, id: ProcessId) -> Option<&Process> {
        self.processes.iter().find(|p| p.id == id)
    }

    /// Clone `def_id`'s root function into a freshly allocated process,
    /// copy `args` per its private-slot mapping (remaining args become
    /// stack locals of the root frame), bind `id`/`father`, fire
    /// `on_create`, and append it to the alive list.
    pub fn spawn_process(
        &mut self,
        def_id: ProcessDefId,
        father: ProcessId,
        args: &[Value],
    ) -> Result<ProcessId, FatalError> {
        let def = self
            .process_defs
            .get(def_id.index() as usize)
            .ok_or(FatalError::HeapCorruption {
                message: "spawn of unknown process blueprint".to_string(),
            })?
            .clone();

        let id = ProcessId(self.next_process_id);
        self.next_process_id += 1;

        let mut process = Process::new(id, def_id);
        process.name = Some(def.name);
        process.privates[usize::from(private::ID)] = Value::Int(id.0 as i32);
        process.privates[usize::from(private::FATHER)] = Value::Int(father.0 as i32);

        let mut stack_args = Vec::new();
        for (i, &arg) in args.iter().enumerate() {
            let slot = def
                .private_args
                .iter()
                .find(|m| usize::from(m.arg_index) == i)
                .map(|m| m.private_slot);
            match slot {
                Some(private_slot) => process.set_private_unchecked(private_slot, arg),
                None => stack_args.push(arg),
            }
        }

        process.push(Value::Function(def.root)).map_err(|_| {
            FatalError::HeapCorruption {
                message: "new process stack overflow before root frame".to_string(),
            }
        })?;
        for arg in &stack_args {
            process
                .push(*arg)
                .map_err(|_| FatalError::HeapCorruption {
                    message: "new process stack overflow copying arguments".to_string(),
                })?;
        }
        process.push_frame(CallFrame {
            function: def.root,
            closure: None,
            ip: 0,
            base: 0,
            arg_count: stack_args.len() as u8,
        })?;

        self.processes.push(process);
        if let Some(hook) = self.hooks.on_create {
            hook(self, id);
        }
        Ok(id)
    }

    // ---- garbage collection -------------------------------------------------

    /// Run a full mark-and-sweep cycle over every root the collector is
    /// required to see: every process's stack and privates, the globals
    /// array, every VM-wide open upvalue, and class field defaults.
    pub fn collect_garbage(&mut self) {
        for idx in 0..self.processes.len() {
            let values: Vec<Value> = self.processes[idx]
                .stack
                .iter()
                .copied()
                .chain(self.processes[idx].privates.iter().copied())
                .chain(
                    self.processes[idx]
                        .frames
                        .iter()
                        .filter_map(|f| f.closure.map(Value::Closure)),
                )
                .chain(
                    self.processes[idx]
                        .try_stack
                        .iter()
                        .flat_map(|h| h.pending_error.into_iter().chain(h.pending_returns.clone())),
                )
                .collect();
            for v in values {
                self.heap.mark_value(v);
            }
        }
        for &g in &self.globals {
            self.heap.mark_value(g);
        }
        for &uv in &self.open_upvalues.clone() {
            self.heap.mark_upvalue_root(uv);
        }
        for class in self.classes.iter() {
            for field in &class.fields {
                if let Some(default) = field.default {
                    self.heap.mark_value(default);
                }
            }
        }
        let natives = &self.natives;
        let stats = self.heap.sweep_dtors(
            |inst| {
                if let Some(dtor) = natives
                    .classes
                    .get(inst.class.index() as usize)
                    .and_then(|c| c.dtor)
                {
                    dtor(&mut inst.data);
                }
            },
            |inst| {
                if let Some(dtor) = natives
                    .structs
                    .get(inst.def.index() as usize)
                    .and_then(|s| s.dtor)
                {
                    dtor(&mut inst.bytes);
                }
            },
        );
        log::debug!(
            "gc: freed {} objects, {} -> {} bytes",
            stats.freed,
            stats.bytes_allocated_before,
            stats.bytes_allocated_after
        );
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    // ---- dispatch loop ------------------------------------------------------

    /// Drive `process` until it yields a frame, finishes, hits a call
    /// boundary, or faults. `process` must already be present in
    /// `self.processes` at `process_index` (its position is needed to
    /// detect the call boundary without an extra lookup per instruction).
    pub fn run_process(&mut self, process_index: usize) -> Result<ProcessOutcome, VmError> {
        loop {
            if self.processes[process_index].frames.is_empty() {
                let ret = self.processes[process_index].pop();
                return Ok(ProcessOutcome::Done(ret));
            }

            let step = self.step(process_index);
            match step {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(VmError::Runtime(err)) => {
                    if let Some(outcome) = self.unwind(process_index, err.clone())? {
                        return Ok(outcome);
                    }
                }
                Err(VmError::Fatal(err)) => {
                    log::error!("process {} faulted: {}", self.processes[process_index].id, err);
                    self.processes[process_index].state = ProcessState::Dead;
                    return Err(VmError::Fatal(err));
                }
            }

            if let Some((pid, frame_floor)) = self.call_boundary {
                let process = &self.processes[process_index];
                if process.id == pid && process.frames.len() <= frame_floor {
                    self.call_boundary = None;
                    let value = self.processes[process_index].peek(0);
                    return Ok(ProcessOutcome::CallReturn(value));
                }
            }
        }
    }

    /// Execute exactly one instruction. Returns `Some(outcome)` when the
    /// process should stop being driven this tick (frame yield or done),
    /// `None` to keep dispatching.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self, pi: usize) -> Result<Option<ProcessOutcome>, VmError> {
        let frame_idx = self.processes[pi].frames.len() - 1;
        let func_id = self.processes[pi].frames[frame_idx].function;
        let ip = self.processes[pi].frames[frame_idx].ip;
        let base = self.processes[pi].frames[frame_idx].base;

        let opcode = self.read_u8(func_id, ip);
        let mut next_ip = ip + 1;

        macro_rules! operand_u8 {
            () => {{
                let v = self.read_u8(func_id, next_ip);
                next_ip += 1;
                v
            }};
        }
        macro_rules! operand_u16 {
            () => {{
                let v = self.read_u16(func_id, next_ip);
                next_ip += 2;
                v
            }};
        }
        macro_rules! operand_i16 {
            () => {{
                let v = self.read_i16(func_id, next_ip);
                next_ip += 2;
                v
            }};
        }

        macro_rules! commit_ip {
            () => {
                self.processes[pi].frames[frame_idx].ip = next_ip;
            };
        }

        match opcode {
            op::CONSTANT => {
                let idx = operand_u16!();
                let v = self.functions[func_id.index() as usize].chunk.constant(idx);
                let v = *v;
                commit_ip!();
                self.push_checked(pi, v)?;
            }
            op::NIL => {
                commit_ip!();
                self.push_checked(pi, Value::Nil)?;
            }
            op::TRUE => {
                commit_ip!();
                self.push_checked(pi, Value::Bool(true))?;
            }
            op::FALSE => {
                commit_ip!();
                self.push_checked(pi, Value::Bool(false))?;
            }
            op::POP => {
                commit_ip!();
                self.processes[pi].pop();
            }
            op::HALT => {
                commit_ip!();
                self.processes[pi].state = ProcessState::Dead;
                return Ok(Some(ProcessOutcome::Done(Value::Nil)));
            }
            op::NOT => {
                commit_ip!();
                let v = self.processes[pi].pop();
                self.push_checked(pi, Value::Bool(!crate::value::is_truthy(&v)))?;
            }
            op::DUP => {
                commit_ip!();
                let v = self.processes[pi].peek(0);
                self.push_checked(pi, v)?;
            }
            op::ADD | op::SUBTRACT | op::MULTIPLY | op::DIVIDE | op::MODULO => {
                commit_ip!();
                self.binary_arith(pi, opcode)?;
            }
            op::NEGATE => {
                commit_ip!();
                let v = self.processes[pi].pop();
                let result = match v.as_f64() {
                    Some(n) if v.is_integral() => Value::Int(-(n as i32)),
                    Some(n) => Value::Double(-n),
                    None => {
                        return Err(RuntimeError::TypeMismatch {
                            op: "-",
                            lhs: v.type_name(),
                            rhs: v.type_name(),
                        }
                        .into())
                    }
                };
                self.push_checked(pi, result)?;
            }
            op::BITWISE_AND
            | op::BITWISE_OR
            | op::BITWISE_XOR
            | op::SHIFT_LEFT
            | op::SHIFT_RIGHT => {
                commit_ip!();
                self.binary_bitwise(pi, opcode)?;
            }
            op::BITWISE_NOT => {
                commit_ip!();
                let v = self.processes[pi].pop();
                let i = Self::as_i32(&v)?;
                self.push_checked(pi, Value::Int(!i))?;
            }
            op::EQUAL | op::NOT_EQUAL => {
                commit_ip!();
                let b = self.processes[pi].pop();
                let a = self.processes[pi].pop();
                let eq = crate::value::values_equal(&a, &b);
                self.push_checked(pi, Value::Bool(if opcode == op::EQUAL { eq } else { !eq }))?;
            }
            op::GREATER | op::GREATER_EQUAL | op::LESS | op::LESS_EQUAL => {
                commit_ip!();
                self.comparison(pi, opcode)?;
            }
            op::GET_LOCAL => {
                let slot = operand_u8!();
                commit_ip!();
                let v = self.processes[pi].stack[base + usize::from(slot)];
                self.push_checked(pi, v)?;
            }
            op::SET_LOCAL => {
                let slot = operand_u8!();
                commit_ip!();
                let v = self.processes[pi].peek(0);
                self.processes[pi].stack[base + usize::from(slot)] = v;
            }
            op::GET_GLOBAL => {
                let idx = operand_u16!();
                commit_ip!();
                let v = self.globals.get(idx as usize).copied().unwrap_or(Value::Nil);
                self.push_checked(pi, v)?;
            }
            op::SET_GLOBAL => {
                let idx = operand_u16!();
                commit_ip!();
                let v = self.processes[pi].peek(0);
                self.ensure_global_slot(idx as usize);
                self.globals[idx as usize] = v;
            }
            op::DEFINE_GLOBAL => {
                let idx = operand_u16!();
                commit_ip!();
                let v = self.processes[pi].pop();
                self.ensure_global_slot(idx as usize);
                self.globals[idx as usize] = v;
            }
            op::GET_PRIVATE => {
                let slot = operand_u8!();
                commit_ip!();
                let v = self.processes[pi].get_private(slot);
                self.push_checked(pi, v)?;
            }
            op::SET_PRIVATE => {
                let slot = operand_u8!();
                commit_ip!();
                let v = self.processes[pi].peek(0);
                self.processes[pi].set_private(slot, v);
            }
            op::JUMP => {
                let offset = operand_u16!();
                next_ip += offset as usize;
                commit_ip!();
            }
            op::JUMP_IF_FALSE => {
                let offset = operand_u16!();
                commit_ip!();
                let cond = self.processes[pi].peek(0);
                if !crate::value::is_truthy(&cond) {
                    self.processes[pi].frames[frame_idx].ip += offset as usize;
                }
            }
            op::LOOP => {
                let offset = operand_u16!();
                commit_ip!();
                self.processes[pi].frames[frame_idx].ip -= offset as usize;
            }
            op::GOSUB => {
                let offset = operand_i16!();
                commit_ip!();
                let ret_addr = self.processes[pi].frames[frame_idx].ip;
                if self.processes[pi].gosub_stack.len() >= crate::process::GOSUB_MAX {
                    return Err(FatalError::GosubStack.into());
                }
                self.processes[pi].gosub_stack.push(ret_addr);
                let target = (ret_addr as i64 + i64::from(offset)) as usize;
                self.processes[pi].frames[frame_idx].ip = target;
            }
            op::RETURN_SUB => {
                commit_ip!();
                let target = self
                    .processes[pi]
                    .gosub_stack
                    .pop()
                    .ok_or(FatalError::GosubStack)?;
                self.processes[pi].frames[frame_idx].ip = target;
            }
            op::CALL => {
                let arg_count = operand_u8!();
                commit_ip!();
                if let Some(outcome) = self.call_value(pi, arg_count as usize)? {
                    return Ok(Some(outcome));
                }
            }
            op::RETURN => {
                commit_ip!();
                let value = self.processes[pi].pop();
                self.do_return(pi, vec![value])?;
            }
            op::RETURN_N => {
                let n = operand_u8!();
                commit_ip!();
                let mut values = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    values.push(self.processes[pi].pop());
                }
                values.reverse();
                self.do_return(pi, values)?;
            }
            op::ARRAY_PUSH => {
                let local = operand_u8!();
                commit_ip!();
                let value = self.processes[pi].pop();
                let array_val = self.processes[pi].stack[base + usize::from(local)];
                if let Value::Array(id) = array_val {
                    if let Some(arr) = self.heap.arrays.get_mut(id.0) {
                        arr.elements.push(value);
                    }
                } else {
                    return Err(RuntimeError::TypeMismatch {
                        op: "push",
                        lhs: array_val.type_name(),
                        rhs: "value",
                    }
                    .into());
                }
            }
            op::FRAME => {
                commit_ip!();
                let hint = self.processes[pi].pop();
                let hint = hint.as_f64().unwrap_or(0.0) as i64;
                return Ok(Some(ProcessOutcome::Frame(hint)));
            }
            op::EXIT => {
                commit_ip!();
                let code = self.processes[pi].pop();
                let code_i32 = code.as_f64().map_or(0, |n| n as i32);
                self.processes[pi].exit_code = code_i32;
                self.processes[pi].frames.clear();
                return Ok(Some(ProcessOutcome::Done(Value::Int(code_i32))));
            }
            op::DEFINE_ARRAY => {
                let count = operand_u16!();
                commit_ip!();
                let mut elems = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    elems.push(self.processes[pi].pop());
                }
                elems.reverse();
                self.maybe_collect();
                let id = self.heap.alloc_array(elems);
                self.push_checked(pi, Value::Array(id))?;
            }
            op::DEFINE_MAP => {
                let count = operand_u16!();
                commit_ip!();
                let mut map = Map::new();
                for _ in 0..count {
                    let value = self.processes[pi].pop();
                    let key = self.processes[pi].pop();
                    if let Value::String(key_id) = key {
                        map.set(key_id, value);
                    }
                }
                self.maybe_collect();
                let id = self.heap.alloc_map(map);
                self.push_checked(pi, Value::Map(id))?;
            }
            op::GET_PROPERTY => {
                let name_idx = operand_u16!();
                commit_ip!();
                let name = self.constant_string(func_id, name_idx);
                let receiver = self.processes[pi].pop();
                let value = self.get_property(receiver, &name)?;
                self.push_checked(pi, value)?;
            }
            op::SET_PROPERTY => {
                let name_idx = operand_u16!();
                commit_ip!();
                let name = self.constant_string(func_id, name_idx);
                let value = self.processes[pi].pop();
                let receiver = self.processes[pi].pop();
                self.set_property(receiver, &name, value)?;
                self.push_checked(pi, value)?;
            }
            op::GET_INDEX => {
                commit_ip!();
                let index = self.processes[pi].pop();
                let receiver = self.processes[pi].pop();
                let value = self.get_index(receiver, index)?;
                self.push_checked(pi, value)?;
            }
            op::SET_INDEX => {
                commit_ip!();
                let value = self.processes[pi].pop();
                let index = self.processes[pi].pop();
                let receiver = self.processes[pi].pop();
                self.set_index(receiver, index, value)?;
                self.push_checked(pi, value)?;
            }
            op::INVOKE => {
                let name_idx = operand_u16!();
                let arg_count = operand_u8!();
                commit_ip!();
                let name = self.constant_string(func_id, name_idx);
                if let Some(outcome) = self.invoke(pi, &name, arg_count as usize, None)? {
                    return Ok(Some(outcome));
                }
            }
            op::SUPER_INVOKE => {
                let name_idx = operand_u16!();
                let arg_count = operand_u8!();
                let owner_idx = operand_u16!();
                commit_ip!();
                let name = self.constant_string(func_id, name_idx);
                let owner = match self.functions[func_id.index() as usize]
                    .chunk
                    .constant(owner_idx)
                {
                    Value::Class(id) => *id,
                    _ => {
                        return Err(FatalError::HeapCorruption {
                            message: "SUPER_INVOKE owner constant is not a class".to_string(),
                        }
                        .into())
                    }
                };
                if let Some(outcome) = self.invoke(pi, &name, arg_count as usize, Some(owner))? {
                    return Ok(Some(outcome));
                }
            }
            op::PRINT => {
                let count = operand_u8!();
                commit_ip!();
                let mut parts = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    parts.push(self.processes[pi].pop());
                }
                parts.reverse();
                let line: Vec<String> = parts.iter().map(|v| self.to_display_string(v)).collect();
                log::info!(target: "scriptvm::print", "{}", line.join(" "));
            }
            op::FUNC_LEN => {
                commit_ip!();
                let n = self.processes[pi].frames[frame_idx].arg_count;
                self.push_checked(pi, Value::Int(i32::from(n)))?;
            }
            op::ITER_NEXT => {
                let array_local = operand_u8!();
                let index_local = operand_u8!();
                commit_ip!();
                let array_val = self.processes[pi].stack[base + usize::from(array_local)];
                let idx_val = self.processes[pi].stack[base + usize::from(index_local)];
                let len = self.array_len(array_val)?;
                let idx = idx_val.as_f64().unwrap_or(0.0) as i64;
                let has_next = idx < len as i64;
                if has_next {
                    self.processes[pi].stack[base + usize::from(index_local)] =
                        Value::Int((idx + 1) as i32);
                }
                self.push_checked(pi, Value::Bool(has_next))?;
            }
            op::ITER_VALUE => {
                let array_local = operand_u8!();
                let index_local = operand_u8!();
                commit_ip!();
                let array_val = self.processes[pi].stack[base + usize::from(array_local)];
                let idx_val = self.processes[pi].stack[base + usize::from(index_local)];
                let idx = idx_val.as_f64().unwrap_or(0.0) as i64 - 1;
                let value = self.get_index(array_val, Value::Int(idx as i32))?;
                self.push_checked(pi, value)?;
            }
            op::COPY2 => {
                commit_ip!();
                let a = self.processes[pi].peek(1);
                let b = self.processes[pi].peek(0);
                self.push_checked(pi, a)?;
                self.push_checked(pi, b)?;
            }
            op::SWAP => {
                commit_ip!();
                let len = self.processes[pi].stack.len();
                self.processes[pi].stack.swap(len - 1, len - 2);
            }
            op::DISCARD => {
                let n = operand_u8!();
                commit_ip!();
                for _ in 0..n {
                    self.processes[pi].pop();
                }
            }
            op::TRY => {
                let catch_off = operand_u16!();
                let finally_off = operand_u16!();
                commit_ip!();
                let catch_ip = if catch_off == u16::MAX {
                    None
                } else {
                    Some(next_ip + catch_off as usize)
                };
                let finally_ip = if finally_off == u16::MAX {
                    None
                } else {
                    Some(next_ip + finally_off as usize)
                };
                let restore = self.processes[pi].stack.len();
                if self.processes[pi].try_stack.len() >= crate::process::TRY_MAX {
                    return Err(FatalError::TryHandlerStack.into());
                }
                let frame_depth = self.processes[pi].frames.len();
                self.processes[pi]
                    .try_stack
                    .push(TryHandler::new(catch_ip, finally_ip, restore, frame_depth));
            }
            op::POP_TRY => {
                commit_ip!();
                self.processes[pi].try_stack.pop();
            }
            op::THROW => {
                commit_ip!();
                let err_value = self.processes[pi].pop();
                let message = self.to_display_string(&err_value);
                return Err(RuntimeError::Uncaught { message }.into());
            }
            op::ENTER_CATCH => {
                commit_ip!();
            }
            op::ENTER_FINALLY => {
                commit_ip!();
            }
            op::EXIT_FINALLY => {
                commit_ip!();
                let handler = self
                    .processes[pi]
                    .try_stack
                    .pop()
                    .ok_or(FatalError::TryHandlerStack)?;
                if let Some(err) = handler.pending_error {
                    let message = self.to_display_string(&err);
                    return Err(RuntimeError::Uncaught { message }.into());
                }
                if !handler.pending_returns.is_empty() {
                    self.do_return(pi, handler.pending_returns)?;
                }
            }
            op::SIN | op::COS | op::TAN | op::ASIN | op::ACOS | op::ATAN | op::SQRT | op::ABS
            | op::LOG | op::FLOOR | op::CEIL | op::DEG | op::RAD | op::EXP => {
                commit_ip!();
                self.math_unary(pi, opcode)?;
            }
            op::ATAN2 | op::POW => {
                commit_ip!();
                self.math_binary(pi, opcode)?;
            }
            op::CLOCK => {
                commit_ip!();
                let secs = self.started_at.elapsed().as_secs_f64();
                self.push_checked(pi, Value::Double(secs))?;
            }
            op::NEW_BUFFER => {
                let elem_tag = operand_u8!();
                let count = operand_u16!();
                commit_ip!();
                let element_type = Self::element_type_from_tag(elem_tag)?;
                self.maybe_collect();
                let id = self.heap.alloc_buffer(Buffer::new(element_type, count as usize));
                self.push_checked(pi, Value::Buffer(id))?;
            }
            op::FREE => {
                commit_ip!();
                self.processes[pi].pop();
            }
            op::CLOSURE => {
                let const_idx = operand_u16!();
                let target = match self.functions[func_id.index() as usize]
                    .chunk
                    .constant(const_idx)
                {
                    Value::Function(id) => *id,
                    _ => {
                        return Err(FatalError::HeapCorruption {
                            message: "CLOSURE constant is not a function".to_string(),
                        }
                        .into())
                    }
                };
                let sources = self.functions[target.index() as usize].upvalues.clone();
                let mut upvalues = Vec::with_capacity(sources.len());
                for source in sources {
                    let kind = operand_u8!();
                    let index = operand_u8!();
                    let _ = kind;
                    let uv_id = match source {
                        UpvalueSource::Local(slot) => {
                            self.capture_upvalue(pi, base + usize::from(slot))
                        }
                        UpvalueSource::Enclosing(_) => {
                            let enclosing = self.processes[pi].frames[frame_idx]
                                .closure
                                .and_then(|cid| self.heap.closures.get(cid.0))
                                .map(|c| c.upvalues[index as usize]);
                            enclosing.ok_or(FatalError::HeapCorruption {
                                message: "CLOSURE referenced a missing enclosing upvalue"
                                    .to_string(),
                            })?
                        }
                    };
                    upvalues.push(uv_id);
                }
                commit_ip!();
                self.maybe_collect();
                let id = self.heap.alloc_closure(Closure {
                    function: target,
                    upvalues,
                });
                self.push_checked(pi, Value::Closure(id))?;
            }
            op::GET_UPVALUE => {
                let slot = operand_u8!();
                commit_ip!();
                let closure_id = self.processes[pi].frames[frame_idx].closure;
                let value = self.read_upvalue(closure_id, slot)?;
                self.push_checked(pi, value)?;
            }
            op::SET_UPVALUE => {
                let slot = operand_u8!();
                commit_ip!();
                let value = self.processes[pi].peek(0);
                let closure_id = self.processes[pi].frames[frame_idx].closure;
                self.write_upvalue(closure_id, slot, value)?;
            }
            op::CLOSE_UPVALUE => {
                commit_ip!();
                let top = self.processes[pi].stack.len() - 1;
                self.close_upvalues_from(pi, top);
                self.processes[pi].pop();
            }
            op::TYPE => {
                let name_idx = operand_u16!();
                commit_ip!();
                let name = self.constant_string(func_id, name_idx);
                let def_idx = self
                    .process_defs
                    .iter()
                    .position(|d| self.pool.as_str(d.name) == name.as_str());
                let value = def_idx.map_or(Value::Nil, |i| Value::ProcessDef(ProcessDefId(i as u32)));
                self.push_checked(pi, value)?;
            }
            op::PROC => {
                commit_ip!();
                let id_val = self.processes[pi].pop();
                let raw = id_val.as_f64().unwrap_or(-1.0) as i32;
                let pid = ProcessId(raw as u32);
                let value = if self.find_process(pid).is_some() {
                    Value::Process(pid)
                } else {
                    Value::Nil
                };
                self.push_checked(pi, value)?;
            }
            op::GET_ID => {
                let blueprint_idx = operand_u16!();
                commit_ip!();
                let def_id = ProcessDefId(u32::from(blueprint_idx));
                let found = self
                    .processes
                    .iter()
                    .find(|p| p.blueprint == def_id)
                    .map(|p| Value::Int(p.id.0 as i32))
                    .unwrap_or(Value::Nil);
                self.push_checked(pi, found)?;
            }
            op::RESERVED_41 => {
                commit_ip!();
                return Err(RuntimeError::Host {
                    message: "OP_RESERVED_41 (legacy fiber slot) is not supported".to_string(),
                }
                .into());
            }
            other => {
                return Err(FatalError::InvalidOpcode {
                    opcode: other,
                    offset: ip,
                }
                .into())
            }
        }
        Ok(None)
    }

    // ---- helpers: chunk access ----------------------------------------------

    fn read_u8(&self, func: FunctionId, ip: usize) -> u8 {
        self.functions[func.index() as usize].chunk.read_u8(ip)
    }

    fn read_u16(&self, func: FunctionId, ip: usize) -> u16 {
        self.functions[func.index() as usize].chunk.read_u16(ip)
    }

    fn read_i16(&self, func: FunctionId, ip: usize) -> i16 {
        self.functions[func.index() as usize].chunk.read_i16(ip)
    }

    fn constant_string_id(&self, func: FunctionId, idx: u16) -> crate::pool::StringId {
        match self.functions[func.index() as usize].chunk.constant(idx) {
            Value::String(id) => *id,
            _ => crate::pool::StringId(0),
        }
    }

    /// Resolve a `u16` constant-pool operand to the string it names. Copies
    /// out of the pool so the borrow doesn't outlive mutations made while
    /// resolving properties/methods against it.
    fn constant_string(&self, func: FunctionId, idx: u16) -> String {
        let id = self.constant_string_id(func, idx);
        self.pool.as_str(id).to_string()
    }

    pub(crate) fn push_checked(&mut self, pi: usize, value: Value) -> Result<(), VmError> {
        self.processes[pi].push(value).map_err(VmError::from)
    }

    /// Run `f` with unobstructed mutable access to both the whole `Vm` and
    /// one of its own processes at once.
    ///
    /// Native callbacks take `&mut Vm` and `&mut Process` as separate
    /// arguments, but `Process` lives inside `Vm::processes`, so calling
    /// one directly would borrow `self` twice. This lifts the process out
    /// of the vector for the duration of the call and puts it back
    /// afterward, preserving its position even if `f` spawns or kills other
    /// processes in the meantime.
    fn with_process<R>(
        &mut self,
        pi: usize,
        f: impl FnOnce(&mut Vm, &mut Process, &[Value]) -> R,
        args: &[Value],
    ) -> R {
        let mut process = self.processes.remove(pi);
        let result = f(self, &mut process, args);
        self.processes.insert(pi, process);
        result
    }

    fn ensure_global_slot(&mut self, idx: usize) {
        if self.globals.len() <= idx {
            self.globals.resize(idx + 1, Value::Nil);
        }
    }

    // ---- arithmetic -----------------------------------------------------------

    fn as_i32(v: &Value) -> Result<i32, VmError> {
        match v.as_f64() {
            Some(n) => Ok(n as i32),
            None => Err(RuntimeError::TypeMismatch {
                op: "bitwise",
                lhs: v.type_name(),
                rhs: v.type_name(),
            }
            .into()),
        }
    }

    fn binary_arith(&mut self, pi: usize, opcode: u8) -> Result<(), VmError> {
        let b = self.processes[pi].pop();
        let a = self.processes[pi].pop();

        if opcode == op::ADD && (a.is_string() || b.is_string()) {
            let left = self.to_display_string(&a);
            let right = self.to_display_string(&b);
            let left_id = self.pool.intern(&left);
            let right_id = self.pool.intern(&right);
            let id = self.pool.concat(left_id, right_id);
            self.push_checked(pi, Value::String(id))?;
            return Ok(());
        }

        let (Some(lhs), Some(rhs)) = (a.as_f64(), b.as_f64()) else {
            return Err(RuntimeError::TypeMismatch {
                op: Self::arith_name(opcode),
                lhs: a.type_name(),
                rhs: b.type_name(),
            }
            .into());
        };

        if opcode == op::DIVIDE && rhs == 0.0 {
            return Err(RuntimeError::DivisionByZero.into());
        }
        if opcode == op::MODULO && rhs == 0.0 {
            return Err(RuntimeError::DivisionByZero.into());
        }

        let result_f = match opcode {
            op::ADD => lhs + rhs,
            op::SUBTRACT => lhs - rhs,
            op::MULTIPLY => lhs * rhs,
            op::DIVIDE => lhs / rhs,
            op::MODULO => lhs % rhs,
            _ => unreachable!(),
        };

        let value = if a.is_integral() && b.is_integral() && opcode != op::DIVIDE {
            Value::Int(result_f as i32)
        } else {
            Value::Double(result_f)
        };
        self.push_checked(pi, value)
    }

    fn arith_name(opcode: u8) -> &'static str {
        match opcode {
            op::ADD => "+",
            op::SUBTRACT => "-",
            op::MULTIPLY => "*",
            op::DIVIDE => "/",
            op::MODULO => "%",
            _ => "?",
        }
    }

    fn binary_bitwise(&mut self, pi: usize, opcode: u8) -> Result<(), VmError> {
        let b = self.processes[pi].pop();
        let a = self.processes[pi].pop();
        let lhs = Self::as_i32(&a)?;
        let rhs = Self::as_i32(&b)?;
        let result = match opcode {
            op::BITWISE_AND => lhs & rhs,
            op::BITWISE_OR => lhs | rhs,
            op::BITWISE_XOR => lhs ^ rhs,
            op::SHIFT_LEFT => lhs.wrapping_shl(rhs as u32),
            op::SHIFT_RIGHT => lhs.wrapping_shr(rhs as u32),
            _ => unreachable!(),
        };
        self.push_checked(pi, Value::Int(result))
    }

    fn comparison(&mut self, pi: usize, opcode: u8) -> Result<(), VmError> {
        let b = self.processes[pi].pop();
        let a = self.processes[pi].pop();
        let (Some(lhs), Some(rhs)) = (a.as_f64(), b.as_f64()) else {
            return Err(RuntimeError::TypeMismatch {
                op: "compare",
                lhs: a.type_name(),
                rhs: b.type_name(),
            }
            .into());
        };
        let result = match opcode {
            op::GREATER => lhs > rhs,
            op::GREATER_EQUAL => lhs >= rhs,
            op::LESS => lhs < rhs,
            op::LESS_EQUAL => lhs <= rhs,
            _ => unreachable!(),
        };
        self.push_checked(pi, Value::Bool(result))
    }

    fn math_unary(&mut self, pi: usize, opcode: u8) -> Result<(), VmError> {
        let v = self.processes[pi].pop();
        let n = v.as_f64().ok_or(RuntimeError::TypeMismatch {
            op: "math",
            lhs: v.type_name(),
            rhs: v.type_name(),
        })?;
        let result = match opcode {
            op::SIN => n.sin(),
            op::COS => n.cos(),
            op::TAN => n.tan(),
            op::ASIN => n.asin(),
            op::ACOS => n.acos(),
            op::ATAN => n.atan(),
            op::SQRT => n.sqrt(),
            op::ABS => n.abs(),
            op::LOG => n.ln(),
            op::FLOOR => n.floor(),
            op::CEIL => n.ceil(),
            op::DEG => n.to_degrees(),
            op::RAD => n.to_radians(),
            op::EXP => n.exp(),
            _ => unreachable!(),
        };
        self.push_checked(pi, Value::Double(result))
    }

    fn math_binary(&mut self, pi: usize, opcode: u8) -> Result<(), VmError> {
        let b = self.processes[pi].pop();
        let a = self.processes[pi].pop();
        let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
            return Err(RuntimeError::TypeMismatch {
                op: "math",
                lhs: a.type_name(),
                rhs: b.type_name(),
            }
            .into());
        };
        let result = match opcode {
            op::ATAN2 => x.atan2(y),
            op::POW => x.powf(y),
            _ => unreachable!(),
        };
        self.push_checked(pi, Value::Double(result))
    }

    fn array_len(&self, v: Value) -> Result<usize, VmError> {
        match v {
            Value::Array(id) => Ok(self
                .heap
                .arrays
                .get(id.0)
                .map(|a| a.elements.len())
                .unwrap_or(0)),
            _ => Err(RuntimeError::TypeMismatch {
                op: "iterate",
                lhs: v.type_name(),
                rhs: "array",
            }
            .into()),
        }
    }

    fn element_type_from_tag(tag: u8) -> Result<ElementType, VmError> {
        Ok(match tag {
            0 => ElementType::U8,
            1 => ElementType::I16,
            2 => ElementType::U16,
            3 => ElementType::I32,
            4 => ElementType::U32,
            5 => ElementType::F32,
            6 => ElementType::F64,
            other => {
                return Err(FatalError::HeapCorruption {
                    message: format!("unknown buffer element tag {other}"),
                }
                .into())
            }
        })
    }

    fn to_display_string(&self, v: &Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Byte(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Double(d) => d.to_string(),
            Value::String(id) => self.pool.as_str(*id).to_string(),
            Value::Process(id) => {
                let name = self
                    .find_process(*id)
                    .and_then(|p| p.name)
                    .map(|n| self.pool.as_str(n).to_string())
                    .unwrap_or_default();
                format!("<process:{} {name}>", id.0)
            }
            other => format!("<{}>", other.type_name()),
        }
    }

    // ---- property / index access ---------------------------------------------

    fn get_property(&mut self, receiver: Value, name: &str) -> Result<Value, VmError> {
        match receiver {
            Value::String(id) => {
                if name == "length" {
                    Ok(Value::Int(self.pool.len(id) as i32))
                } else {
                    Err(RuntimeError::UndefinedProperty {
                        kind: "string",
                        name: name.to_string(),
                    }
                    .into())
                }
            }
            Value::Process(id) => {
                if let Some(index) = Self::private_index_by_name(name) {
                    Ok(self.find_process(id).map_or(Value::Nil, |p| p.get_private(index)))
                } else {
                    Err(RuntimeError::UndefinedProperty {
                        kind: "process",
                        name: name.to_string(),
                    }
                    .into())
                }
            }
            Value::StructInstance(id) => {
                let inst = self
                    .heap
                    .structs
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling struct instance".to_string(),
                    })?;
                let def = self.structs.get(inst.def).ok_or(FatalError::HeapCorruption {
                    message: "dangling struct def".to_string(),
                })?;
                let name_id = self.pool.intern(name);
                let idx = def.field_index(name_id).ok_or(RuntimeError::UndefinedProperty {
                    kind: "struct instance",
                    name: name.to_string(),
                })?;
                Ok(inst.fields[idx])
            }
            Value::ClassInstance(id) => {
                let inst = self
                    .heap
                    .classes
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling class instance".to_string(),
                    })?;
                let def = self.classes.get(inst.class).ok_or(FatalError::HeapCorruption {
                    message: "dangling class def".to_string(),
                })?;
                let name_id = self.pool.intern(name);
                if let Some(idx) = def.field_index(name_id) {
                    return Ok(inst.fields[idx]);
                }
                if let Some(native_id) = self.native_superclass_of(inst.class) {
                    if let Some(getter) = self
                        .natives
                        .classes
                        .get(native_id.index() as usize)
                        .and_then(|c| c.properties.get(&name_id))
                        .map(|p| p.getter)
                    {
                        let data = &self
                            .heap
                            .classes
                            .get(id.0)
                            .ok_or(FatalError::HeapCorruption {
                                message: "dangling class instance".to_string(),
                            })?
                            .native_data;
                        if let Some(data) = data {
                            return Ok(getter(self, data));
                        }
                    }
                }
                Err(RuntimeError::UndefinedProperty {
                    kind: "class instance",
                    name: name.to_string(),
                }
                .into())
            }
            Value::NativeClassInstance(id) => {
                let class_id = self
                    .heap
                    .native_classes
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling native class instance".to_string(),
                    })?
                    .class;
                let name_id = self.pool.intern(name);
                let getter = self
                    .natives
                    .classes
                    .get(class_id.index() as usize)
                    .and_then(|c| c.properties.get(&name_id))
                    .map(|p| p.getter)
                    .ok_or(RuntimeError::UndefinedProperty {
                        kind: "native class instance",
                        name: name.to_string(),
                    })?;
                let data = &self
                    .heap
                    .native_classes
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling native class instance".to_string(),
                    })?
                    .data;
                Ok(getter(self, data))
            }
            Value::NativeStructInstance(id) => {
                let inst = self
                    .heap
                    .native_structs
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling native struct instance".to_string(),
                    })?;
                let name_id = self.pool.intern(name);
                let field = self
                    .natives
                    .structs
                    .get(inst.def.index() as usize)
                    .and_then(|s| s.fields.get(&name_id))
                    .copied()
                    .ok_or(RuntimeError::UndefinedProperty {
                        kind: "native struct instance",
                        name: name.to_string(),
                    })?;
                Ok(read_native_field(&inst.bytes, field.offset, field.ty))
            }
            Value::Map(id) => {
                let map = self.heap.maps.get(id.0).ok_or(FatalError::HeapCorruption {
                    message: "dangling map".to_string(),
                })?;
                let key_id = self.pool.intern(name);
                map.entries.get(&key_id).copied().ok_or_else(|| {
                    RuntimeError::MapKeyNotFound {
                        key: name.to_string(),
                    }
                    .into()
                })
            }
            _ => Err(RuntimeError::UndefinedProperty {
                kind: receiver.type_name(),
                name: name.to_string(),
            }
            .into()),
        }
    }

    fn set_property(&mut self, receiver: Value, name: &str, value: Value) -> Result<(), VmError> {
        match receiver {
            Value::Process(id) => {
                if let Some(index) = Self::private_index_by_name(name) {
                    if private::is_read_only(index) {
                        return Ok(());
                    }
                    if let Some(pidx) = self.find_process_index(id) {
                        self.processes[pidx].set_private(index, value);
                    }
                    Ok(())
                } else {
                    Err(RuntimeError::UndefinedProperty {
                        kind: "process",
                        name: name.to_string(),
                    }
                    .into())
                }
            }
            Value::StructInstance(id) => {
                let name_id = self.pool.intern(name);
                let def_id = self
                    .heap
                    .structs
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling struct instance".to_string(),
                    })?
                    .def;
                let idx = self
                    .structs
                    .get(def_id)
                    .and_then(|d| d.field_index(name_id))
                    .ok_or(RuntimeError::UndefinedProperty {
                        kind: "struct instance",
                        name: name.to_string(),
                    })?;
                if let Some(inst) = self.heap.structs.get_mut(id.0) {
                    inst.fields[idx] = value;
                }
                Ok(())
            }
            Value::ClassInstance(id) => {
                let name_id = self.pool.intern(name);
                let class_id = self
                    .heap
                    .classes
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling class instance".to_string(),
                    })?
                    .class;
                if let Some(idx) = self.classes.get(class_id).and_then(|d| d.field_index(name_id)) {
                    if let Some(inst) = self.heap.classes.get_mut(id.0) {
                        inst.fields[idx] = value;
                    }
                    return Ok(());
                }
                if let Some(native_id) = self.native_superclass_of(class_id) {
                    if let Some(setter) = self
                        .natives
                        .classes
                        .get(native_id.index() as usize)
                        .and_then(|c| c.properties.get(&name_id))
                        .and_then(|p| p.setter)
                    {
                        let taken = self
                            .heap
                            .classes
                            .get_mut(id.0)
                            .and_then(|inst| inst.native_data.take());
                        if let Some(mut data) = taken {
                            setter(self, &mut data, value);
                            if let Some(inst) = self.heap.classes.get_mut(id.0) {
                                inst.native_data = Some(data);
                            }
                        }
                        return Ok(());
                    }
                }
                Err(RuntimeError::UndefinedProperty {
                    kind: "class instance",
                    name: name.to_string(),
                }
                .into())
            }
            Value::NativeClassInstance(id) => {
                let name_id = self.pool.intern(name);
                let class_id = self
                    .heap
                    .native_classes
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling native class instance".to_string(),
                    })?
                    .class;
                let setter = self
                    .natives
                    .classes
                    .get(class_id.index() as usize)
                    .and_then(|c| c.properties.get(&name_id))
                    .and_then(|p| p.setter)
                    .ok_or(RuntimeError::UndefinedProperty {
                        kind: "native class instance",
                        name: name.to_string(),
                    })?;
                let taken = self
                    .heap
                    .native_classes
                    .get_mut(id.0)
                    .map(|inst| std::mem::replace(&mut inst.data, Box::new(())));
                if let Some(mut data) = taken {
                    setter(self, &mut data, value);
                    if let Some(inst) = self.heap.native_classes.get_mut(id.0) {
                        inst.data = data;
                    }
                }
                Ok(())
            }
            Value::NativeStructInstance(id) => {
                let name_id = self.pool.intern(name);
                let def_id = self
                    .heap
                    .native_structs
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling native struct instance".to_string(),
                    })?
                    .def;
                let field = self
                    .natives
                    .structs
                    .get(def_id.index() as usize)
                    .and_then(|s| s.fields.get(&name_id))
                    .copied()
                    .ok_or(RuntimeError::UndefinedProperty {
                        kind: "native struct instance",
                        name: name.to_string(),
                    })?;
                if field.read_only {
                    return Ok(());
                }
                if let Some(inst) = self.heap.native_structs.get_mut(id.0) {
                    write_native_field(&mut inst.bytes, field.offset, field.ty, value);
                }
                Ok(())
            }
            Value::Map(id) => {
                let key_id = self.pool.intern(name);
                if let Some(map) = self.heap.maps.get_mut(id.0) {
                    map.set(key_id, value);
                }
                Ok(())
            }
            _ => Err(RuntimeError::UndefinedProperty {
                kind: receiver.type_name(),
                name: name.to_string(),
            }
            .into()),
        }
    }

    fn private_index_by_name(name: &str) -> Option<u8> {
        Some(match name {
            "x" => private::X,
            "y" => private::Y,
            "z" => private::Z,
            "graph" => private::GRAPH,
            "angle" => private::ANGLE,
            "size" => private::SIZE,
            "flags" => private::FLAGS,
            "id" => private::ID,
            "father" => private::FATHER,
            "red" => private::RED,
            "green" => private::GREEN,
            "blue" => private::BLUE,
            "alpha" => private::ALPHA,
            "tag" => private::TAG,
            "state" => private::STATE,
            "speed" => private::SPEED,
            "group" => private::GROUP,
            _ => return None,
        })
    }

    fn get_index(&self, receiver: Value, index: Value) -> Result<Value, VmError> {
        match receiver {
            Value::Array(id) => {
                let arr = self
                    .heap
                    .arrays
                    .get(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling array".to_string(),
                    })?;
                let idx = index.as_f64().unwrap_or(0.0) as i64;
                let real = arr.resolve_read_index(idx).ok_or(RuntimeError::IndexOutOfRange {
                    kind: "array",
                    index: idx,
                    len: arr.elements.len(),
                })?;
                Ok(arr.elements[real])
            }
            Value::Map(id) => {
                let map = self.heap.maps.get(id.0).ok_or(FatalError::HeapCorruption {
                    message: "dangling map".to_string(),
                })?;
                if let Value::String(key) = index {
                    Ok(map.entries.get(&key).copied().unwrap_or(Value::Nil))
                } else {
                    Ok(Value::Nil)
                }
            }
            Value::Buffer(id) => {
                let buf = self.heap.buffers.get(id.0).ok_or(FatalError::HeapCorruption {
                    message: "dangling buffer".to_string(),
                })?;
                let idx = index.as_f64().unwrap_or(0.0) as usize;
                read_buffer_element(buf, idx)
            }
            Value::String(id) => {
                let idx = index.as_f64().unwrap_or(0.0) as i64;
                Ok(self.pool.bytes(id).get(idx.max(0) as usize).map_or(Value::Nil, |&b| {
                    Value::Byte(b)
                }))
            }
            _ => Err(RuntimeError::TypeMismatch {
                op: "index",
                lhs: receiver.type_name(),
                rhs: index.type_name(),
            }
            .into()),
        }
    }

    fn set_index(&mut self, receiver: Value, index: Value, value: Value) -> Result<(), VmError> {
        match receiver {
            Value::Array(id) => {
                let idx = index.as_f64().unwrap_or(0.0) as i64;
                let arr = self
                    .heap
                    .arrays
                    .get_mut(id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling array".to_string(),
                    })?;
                let len = arr.elements.len() as i64;
                let real = if idx < 0 { len + idx } else { idx };
                if real < 0 || real >= len {
                    return Err(RuntimeError::IndexOutOfRange {
                        kind: "array",
                        index: idx,
                        len: arr.elements.len(),
                    }
                    .into());
                }
                arr.elements[real as usize] = value;
                Ok(())
            }
            Value::Map(id) => {
                if let Value::String(key) = index {
                    if let Some(map) = self.heap.maps.get_mut(id.0) {
                        map.set(key, value);
                    }
                }
                Ok(())
            }
            Value::Buffer(id) => {
                let idx = index.as_f64().unwrap_or(0.0) as usize;
                if let Some(buf) = self.heap.buffers.get_mut(id.0) {
                    write_buffer_element(buf, idx, value)?;
                }
                Ok(())
            }
            _ => Err(RuntimeError::TypeMismatch {
                op: "index-assign",
                lhs: receiver.type_name(),
                rhs: index.type_name(),
            }
            .into()),
        }
    }

    // ---- calls -----------------------------------------------------------------

    pub(crate) fn call_value(&mut self, pi: usize, arg_count: usize) -> Result<Option<ProcessOutcome>, VmError> {
        let callee_slot = self.processes[pi].stack.len() - arg_count - 1;
        let callee = self.processes[pi].stack[callee_slot];
        match callee {
            Value::Function(func_id) => {
                self.push_script_frame(pi, func_id, None, callee_slot, arg_count)?;
                Ok(None)
            }
            Value::Closure(closure_id) => {
                let func_id = self
                    .heap
                    .closures
                    .get(closure_id.0)
                    .ok_or(FatalError::HeapCorruption {
                        message: "dangling closure".to_string(),
                    })?
                    .function;
                self.push_script_frame(pi, func_id, Some(closure_id), callee_slot, arg_count)?;
                Ok(None)
            }
            Value::NativeFn(id) => {
                self.call_native_fn(pi, id, callee_slot, arg_count)?;
                Ok(None)
            }
            Value::ModuleRef(module_ref) => {
                self.call_module_fn(pi, module_ref, callee_slot, arg_count)?;
                Ok(None)
            }
            Value::StructDef(def_id) => {
                self.construct_struct(pi, def_id, callee_slot, arg_count)?;
                Ok(None)
            }
            Value::Class(class_id) => self.construct_class(pi, class_id, callee_slot, arg_count),
            Value::ProcessDef(def_id) => {
                let args: Vec<Value> =
                    self.processes[pi].stack[callee_slot + 1..].to_vec();
                let father = self.processes[pi].id;
                let new_id = self.spawn_process(def_id, father, &args)?;
                self.processes[pi].stack.truncate(callee_slot);
                self.push_checked(pi, Value::Process(new_id))?;
                Ok(None)
            }
            Value::NativeClass(class_id) => {
                self.construct_native_class(pi, class_id, callee_slot)?;
                Ok(None)
            }
            Value::NativeStruct(struct_id) => {
                self.construct_native_struct(pi, struct_id, callee_slot)?;
                Ok(None)
            }
            Value::NativeProcess(id) => {
                self.call_native_process(pi, id, callee_slot, arg_count)?;
                Ok(None)
            }
            other => Err(RuntimeError::NotCallable {
                name: other.type_name().to_string(),
            }
            .into()),
        }
    }

    /// Invoke a registered native class's constructor and wrap the
    /// returned opaque payload in a `NativeClassInstance` value.
    fn construct_native_class(
        &mut self,
        pi: usize,
        class_id: NativeClassId,
        callee_slot: usize,
    ) -> Result<(), VmError> {
        let entry_idx = class_id.index() as usize;
        let (ctor, arg_count_expected, persistent) = {
            let entry = self.natives.classes.get(entry_idx).ok_or(FatalError::HeapCorruption {
                message: "dangling native class id".to_string(),
            })?;
            (entry.ctor, entry.arg_count, entry.persistent)
        };
        let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
        if arg_count_expected >= 0 && arg_count_expected as usize != args.len() {
            return Err(RuntimeError::ArityMismatch {
                expected: arg_count_expected,
                got: args.len(),
            }
            .into());
        }
        self.processes[pi].stack.truncate(callee_slot);
        let data = self.with_process(pi, |vm, process, args| ctor(vm, process, args), &args)?;
        self.maybe_collect();
        let id = self
            .heap
            .alloc_native_class_instance(NativeClassInstance { class: class_id, data }, persistent);
        self.push_checked(pi, Value::NativeClassInstance(id))
    }

    /// Raw-allocate a native struct's byte-exact, zero-filled payload
    /// through the arena (spec §4.3: buffers and native structs raw-allocate
    /// their data), run the registered constructor against it, then copy
    /// the result into the heap-owned instance and release the scratch
    /// region. The constructor runs against a detached scratch buffer
    /// rather than a slice borrowed straight out of the arena, since the
    /// arena lives on `self` alongside the `Vm` the constructor also needs.
    fn construct_native_struct(
        &mut self,
        pi: usize,
        struct_id: NativeStructId,
        callee_slot: usize,
    ) -> Result<(), VmError> {
        let entry_idx = struct_id.index() as usize;
        let (ctor, size, persistent) = {
            let entry = self.natives.structs.get(entry_idx).ok_or(FatalError::HeapCorruption {
                message: "dangling native struct id".to_string(),
            })?;
            (entry.ctor, entry.size, entry.persistent)
        };
        let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
        self.processes[pi].stack.truncate(callee_slot);

        let (block, offset) = self.arena.allocate(size);
        self.arena.slice_mut(block, offset, size).fill(0);
        let mut scratch = vec![0u8; size];

        let mut process = self.processes.remove(pi);
        let result = ctor(self, &mut process, &mut scratch, &args);
        self.processes.insert(pi, process);
        self.arena.slice_mut(block, offset, size).copy_from_slice(&scratch);
        self.arena.free(block, offset, size);
        result?;

        self.maybe_collect();
        let id = self.heap.alloc_native_struct_instance(
            NativeStructInstance { def: struct_id, bytes: scratch },
            persistent,
        );
        self.push_checked(pi, Value::NativeStructInstance(id))
    }

    fn call_native_process(
        &mut self,
        pi: usize,
        id: NativeProcessId,
        callee_slot: usize,
        arg_count: usize,
    ) -> Result<(), VmError> {
        let entry = *self
            .natives
            .processes
            .get(id.index() as usize)
            .ok_or(FatalError::HeapCorruption {
                message: "dangling native process id".to_string(),
            })?;
        if entry.arity >= 0 && entry.arity as usize != arg_count {
            return Err(RuntimeError::ArityMismatch {
                expected: entry.arity,
                got: arg_count,
            }
            .into());
        }
        let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
        self.processes[pi].stack.truncate(callee_slot);
        let mut results = self.with_process(pi, |vm, process, args| (entry.func)(vm, process, args), &args)?;
        if results.is_empty() {
            results.push(Value::Nil);
        }
        for v in results {
            self.push_checked(pi, v)?;
        }
        Ok(())
    }

    pub(crate) fn push_script_frame(
        &mut self,
        pi: usize,
        func_id: FunctionId,
        closure: Option<ClosureId>,
        callee_slot: usize,
        arg_count: usize,
    ) -> Result<(), VmError> {
        let arity = self.functions[func_id.index() as usize].arity as usize;
        if arity != arg_count {
            return Err(RuntimeError::ArityMismatch {
                expected: arity as i32,
                got: arg_count,
            }
            .into());
        }
        self.processes[pi].push_frame(CallFrame {
            function: func_id,
            closure,
            ip: 0,
            base: callee_slot,
            arg_count: arg_count as u8,
        })?;
        Ok(())
    }

    fn call_native_fn(
        &mut self,
        pi: usize,
        id: NativeFnId,
        callee_slot: usize,
        arg_count: usize,
    ) -> Result<(), VmError> {
        let entry = *self
            .natives
            .fns
            .get(id.index() as usize)
            .ok_or(FatalError::HeapCorruption {
                message: "dangling native function id".to_string(),
            })?;
        if entry.arity >= 0 && entry.arity as usize != arg_count {
            return Err(RuntimeError::ArityMismatch {
                expected: entry.arity,
                got: arg_count,
            }
            .into());
        }
        let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
        self.processes[pi].stack.truncate(callee_slot);
        let mut results = self.with_process(pi, |vm, process, args| (entry.func)(vm, process, args), &args)?;
        if results.is_empty() {
            results.push(Value::Nil);
        }
        for v in results {
            self.push_checked(pi, v)?;
        }
        Ok(())
    }

    fn call_module_fn(
        &mut self,
        pi: usize,
        module_ref: ModuleRef,
        callee_slot: usize,
        arg_count: usize,
    ) -> Result<(), VmError> {
        let func = *self
            .natives
            .modules
            .get(module_ref.module_id as usize)
            .and_then(|m| m.get(module_ref.func_id as usize))
            .ok_or(FatalError::HeapCorruption {
                message: "dangling module function reference".to_string(),
            })?;
        let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
        self.processes[pi].stack.truncate(callee_slot);
        let _ = arg_count;
        let mut results = self.with_process(pi, |vm, process, args| func(vm, process, args), &args)?;
        if results.is_empty() {
            results.push(Value::Nil);
        }
        for v in results {
            self.push_checked(pi, v)?;
        }
        Ok(())
    }

    fn construct_struct(
        &mut self,
        pi: usize,
        def_id: StructDefId,
        callee_slot: usize,
        arg_count: usize,
    ) -> Result<(), VmError> {
        let field_count = self
            .structs
            .get(def_id)
            .ok_or(FatalError::HeapCorruption {
                message: "dangling struct def".to_string(),
            })?
            .field_count();
        let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
        let mut fields = vec![Value::Nil; field_count];
        for (i, v) in args.iter().take(field_count).enumerate() {
            fields[i] = *v;
        }
        let _ = arg_count;
        self.maybe_collect();
        let id = self.heap.alloc_struct_instance(StructInstance { def: def_id, fields });
        self.processes[pi].stack.truncate(callee_slot);
        self.push_checked(pi, Value::StructInstance(id))
    }

    /// Walk a class's script superclass chain looking for the ancestor
    /// (there is at most one, layered at the root of the chain) that
    /// extends a native class.
    fn native_superclass_of(&self, class_id: ClassId) -> Option<NativeClassId> {
        let mut current = Some(class_id);
        while let Some(cid) = current {
            let def = self.classes.get(cid)?;
            if let Some(native) = def.native_superclass {
                return Some(native);
            }
            current = def.superclass;
        }
        None
    }

    fn construct_class(
        &mut self,
        pi: usize,
        class_id: ClassId,
        callee_slot: usize,
        arg_count: usize,
    ) -> Result<Option<ProcessOutcome>, VmError> {
        let def = self.classes.get(class_id).ok_or(FatalError::HeapCorruption {
            message: "dangling class def".to_string(),
        })?;
        let fields = def.default_fields();
        let init_name = self.pool.intern("init");
        let init = self.classes.resolve_method(class_id, init_name);
        let native_superclass = self.native_superclass_of(class_id);

        // A native superclass's constructor runs eagerly, against the same
        // arguments the script constructor call was made with, before any
        // script `init` body sees the instance. It never consumes the
        // arguments off the stack — the script constructor still receives
        // them.
        let native_data = match native_superclass {
            Some(native_id) => {
                let entry_idx = native_id.index() as usize;
                let (ctor, persistent) = {
                    let entry =
                        self.natives
                            .classes
                            .get(entry_idx)
                            .ok_or(FatalError::HeapCorruption {
                                message: "dangling native superclass id".to_string(),
                            })?;
                    (entry.ctor, entry.persistent)
                };
                let _ = persistent;
                let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
                let data = self.with_process(pi, |vm, process, args| ctor(vm, process, args), &args)?;
                Some(data)
            }
            None => None,
        };

        self.maybe_collect();
        let id = self.heap.alloc_class_instance(ClassInstance {
            class: class_id,
            fields,
            native_data,
        });

        self.processes[pi].stack[callee_slot] = Value::ClassInstance(id);
        match init {
            Some(func_id) => {
                self.push_script_frame(pi, func_id, None, callee_slot, arg_count)?;
                Ok(None)
            }
            None => {
                self.processes[pi].stack.truncate(callee_slot + 1);
                Ok(None)
            }
        }
    }

    pub(crate) fn invoke(
        &mut self,
        pi: usize,
        name: &str,
        arg_count: usize,
        owner: Option<ClassId>,
    ) -> Result<Option<ProcessOutcome>, VmError> {
        let callee_slot = self.processes[pi].stack.len() - arg_count - 1;
        let receiver = self.processes[pi].stack[callee_slot];

        if let Value::ClassInstance(id) = receiver {
            let class_of_instance = self
                .heap
                .classes
                .get(id.0)
                .ok_or(FatalError::HeapCorruption {
                    message: "dangling class instance".to_string(),
                })?
                .class;
            let start = match owner {
                Some(owner_class) => self.classes.get(owner_class).and_then(|c| c.superclass),
                None => Some(class_of_instance),
            };
            if let Some(start_class) = start {
                let name_id = self.pool.intern(name);
                if let Some(func_id) = self.classes.resolve_method(start_class, name_id) {
                    self.push_script_frame(pi, func_id, None, callee_slot, arg_count)?;
                    return Ok(None);
                }
            }
            if let Some(native_id) = self.native_superclass_of(class_of_instance) {
                if self.invoke_native_class_method(pi, id, native_id, name, callee_slot, arg_count)? {
                    return Ok(None);
                }
            }
        }

        if let Value::NativeClassInstance(id) = receiver {
            let class_id = self
                .heap
                .native_classes
                .get(id.0)
                .ok_or(FatalError::HeapCorruption {
                    message: "dangling native class instance".to_string(),
                })?
                .class;
            if self.invoke_native_instance_method(pi, id, class_id, name, callee_slot, arg_count)? {
                return Ok(None);
            }
        }

        let value = self.invoke_builtin_method(receiver, name, pi, callee_slot, arg_count)?;
        self.processes[pi].stack.truncate(callee_slot);
        self.push_checked(pi, value)?;
        Ok(None)
    }

    /// Dispatch a method call against a `ClassInstance` whose ancestry
    /// includes a native superclass, once script method resolution has
    /// already failed. Returns `false` (leaving the stack untouched) if the
    /// native class has no such method, so the caller can fall through to
    /// the built-in method table.
    fn invoke_native_class_method(
        &mut self,
        pi: usize,
        instance_id: ClassInstanceId,
        native_id: NativeClassId,
        name: &str,
        callee_slot: usize,
        arg_count: usize,
    ) -> Result<bool, VmError> {
        let name_id = self.pool.intern(name);
        let method = self
            .natives
            .classes
            .get(native_id.index() as usize)
            .and_then(|c| c.methods.get(&name_id))
            .copied();
        let Some(method) = method else {
            return Ok(false);
        };

        let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
        let _ = arg_count;
        self.processes[pi].stack.truncate(callee_slot);

        let mut data = self
            .heap
            .classes
            .get_mut(instance_id.0)
            .and_then(|inst| inst.native_data.take())
            .ok_or(FatalError::HeapCorruption {
                message: "native superclass instance missing payload".to_string(),
            })?;
        let mut process = self.processes.remove(pi);
        let result = method(self, &mut process, &mut data, &args);
        self.processes.insert(pi, process);
        if let Some(inst) = self.heap.classes.get_mut(instance_id.0) {
            inst.native_data = Some(data);
        }

        let mut results = result?;
        if results.is_empty() {
            results.push(Value::Nil);
        }
        for v in results {
            self.push_checked(pi, v)?;
        }
        Ok(true)
    }

    /// Dispatch a method call directly against a `NativeClassInstance`
    /// receiver (no script class wraps it).
    fn invoke_native_instance_method(
        &mut self,
        pi: usize,
        instance_id: NativeClassInstanceId,
        class_id: NativeClassId,
        name: &str,
        callee_slot: usize,
        arg_count: usize,
    ) -> Result<bool, VmError> {
        let name_id = self.pool.intern(name);
        let method = self
            .natives
            .classes
            .get(class_id.index() as usize)
            .and_then(|c| c.methods.get(&name_id))
            .copied();
        let Some(method) = method else {
            return Ok(false);
        };

        let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
        let _ = arg_count;
        self.processes[pi].stack.truncate(callee_slot);

        let mut data = self
            .heap
            .native_classes
            .get_mut(instance_id.0)
            .map(|inst| std::mem::replace(&mut inst.data, Box::new(())))
            .ok_or(FatalError::HeapCorruption {
                message: "dangling native class instance".to_string(),
            })?;
        let mut process = self.processes.remove(pi);
        let result = method(self, &mut process, &mut data, &args);
        self.processes.insert(pi, process);
        if let Some(inst) = self.heap.native_classes.get_mut(instance_id.0) {
            inst.data = data;
        }

        let mut results = result?;
        if results.is_empty() {
            results.push(Value::Nil);
        }
        for v in results {
            self.push_checked(pi, v)?;
        }
        Ok(true)
    }

    fn invoke_builtin_method(
        &mut self,
        receiver: Value,
        name: &str,
        pi: usize,
        callee_slot: usize,
        arg_count: usize,
    ) -> Result<Value, VmError> {
        let args: Vec<Value> = self.processes[pi].stack[callee_slot + 1..].to_vec();
        let _ = arg_count;
        match receiver {
            Value::Array(id) => self.invoke_array_method(id, name, &args),
            Value::Map(id) => self.invoke_map_method(id, name, &args),
            Value::String(id) => self.invoke_string_method(id, name, &args),
            Value::Buffer(id) => self.invoke_buffer_method(id, name, &args),
            _ => Err(RuntimeError::UndefinedProperty {
                kind: receiver.type_name(),
                name: name.to_string(),
            }
            .into()),
        }
    }

    fn invoke_array_method(
        &mut self,
        id: crate::value::ArrayId,
        name: &str,
        args: &[Value],
    ) -> Result<Value, VmError> {
        match name {
            "push" => {
                if let Some(arr) = self.heap.arrays.get_mut(id.0) {
                    arr.elements.extend_from_slice(args);
                }
                Ok(Value::Nil)
            }
            "pop" => Ok(self
                .heap
                .arrays
                .get_mut(id.0)
                .and_then(|a| a.elements.pop())
                .unwrap_or(Value::Nil)),
            "length" => Ok(Value::Int(
                self.heap.arrays.get(id.0).map(|a| a.elements.len()).unwrap_or(0) as i32,
            )),
            "insert" => {
                let idx = args.first().and_then(Value::as_f64).unwrap_or(0.0) as usize;
                let value = args.get(1).copied().unwrap_or(Value::Nil);
                if let Some(arr) = self.heap.arrays.get_mut(id.0) {
                    let idx = idx.min(arr.elements.len());
                    arr.elements.insert(idx, value);
                }
                Ok(Value::Nil)
            }
            "remove" => {
                let idx = args.first().and_then(Value::as_f64).unwrap_or(0.0) as i64;
                if let Some(arr) = self.heap.arrays.get_mut(id.0) {
                    if let Some(real) = arr.resolve_read_index(idx) {
                        return Ok(arr.elements.remove(real));
                    }
                }
                Ok(Value::Nil)
            }
            "has" => {
                let needle = args.first().copied().unwrap_or(Value::Nil);
                Ok(Value::Bool(
                    self.heap
                        .arrays
                        .get(id.0)
                        .map(|a| a.elements.iter().any(|v| crate::value::values_equal(v, &needle)))
                        .unwrap_or(false),
                ))
            }
            "copy" => {
                let elements = self.heap.arrays.get(id.0).map(|a| a.elements.clone()).unwrap_or_default();
                self.maybe_collect();
                Ok(Value::Array(self.heap.alloc_array(elements)))
            }
            "fill" => {
                let value = args.first().copied().unwrap_or(Value::Nil);
                if let Some(arr) = self.heap.arrays.get_mut(id.0) {
                    arr.elements.fill(value);
                }
                Ok(Value::Array(id))
            }
            "slice" => {
                let len = self.heap.arrays.get(id.0).map(|a| a.elements.len()).unwrap_or(0) as i64;
                let start = args.first().and_then(Value::as_f64).unwrap_or(0.0) as i64;
                let end = args.get(1).and_then(Value::as_f64).unwrap_or(len as f64) as i64;
                let start = if start < 0 { len + start } else { start }.clamp(0, len);
                let end = if end < 0 { len + end } else { end }.clamp(start, len);
                let elements = self
                    .heap
                    .arrays
                    .get(id.0)
                    .map(|a| a.elements[start as usize..end as usize].to_vec())
                    .unwrap_or_default();
                self.maybe_collect();
                Ok(Value::Array(self.heap.alloc_array(elements)))
            }
            "concat" => {
                let mut elements = self.heap.arrays.get(id.0).map(|a| a.elements.clone()).unwrap_or_default();
                if let Some(Value::Array(other)) = args.first() {
                    if let Some(other_arr) = self.heap.arrays.get(other.0) {
                        elements.extend_from_slice(&other_arr.elements);
                    }
                }
                self.maybe_collect();
                Ok(Value::Array(self.heap.alloc_array(elements)))
            }
            _ => Err(RuntimeError::UndefinedProperty {
                kind: "array",
                name: name.to_string(),
            }
            .into()),
        }
    }

    fn invoke_map_method(
        &mut self,
        id: crate::value::MapId,
        name: &str,
        args: &[Value],
    ) -> Result<Value, VmError> {
        match name {
            "has" => {
                if let Value::String(key) = args.first().copied().unwrap_or(Value::Nil) {
                    Ok(Value::Bool(
                        self.heap.maps.get(id.0).map(|m| m.entries.contains_key(&key)).unwrap_or(false),
                    ))
                } else {
                    Ok(Value::Bool(false))
                }
            }
            "keys" => {
                let keys: Vec<Value> = self
                    .heap
                    .maps
                    .get(id.0)
                    .map(|m| m.entries.keys().map(|&k| Value::String(k)).collect())
                    .unwrap_or_default();
                self.maybe_collect();
                Ok(Value::Array(self.heap.alloc_array(keys)))
            }
            "values" => {
                let values: Vec<Value> = self
                    .heap
                    .maps
                    .get(id.0)
                    .map(|m| m.entries.values().copied().collect())
                    .unwrap_or_default();
                self.maybe_collect();
                Ok(Value::Array(self.heap.alloc_array(values)))
            }
            "length" => Ok(Value::Int(
                self.heap.maps.get(id.0).map(|m| m.entries.len()).unwrap_or(0) as i32,
            )),
            _ => Err(RuntimeError::UndefinedProperty {
                kind: "map",
                name: name.to_string(),
            }
            .into()),
        }
    }

    fn invoke_string_method(
        &mut self,
        id: crate::pool::StringId,
        name: &str,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let arg_string = |vm: &Self, v: &Value| -> crate::pool::StringId {
            if let Value::String(s) = v {
                *s
            } else {
                vm.pool.create(b"")
            }
        };
        match name {
            "length" => Ok(Value::Int(self.pool.len(id) as i32)),
            "upper" => Ok(Value::String(self.pool.upper(id))),
            "lower" => Ok(Value::String(self.pool.lower(id))),
            "trim" => Ok(Value::String(self.pool.trim(id))),
            "concat" => {
                let other = arg_string(self, args.first().unwrap_or(&Value::Nil));
                Ok(Value::String(self.pool.concat(id, other)))
            }
            "split" => {
                let sep = arg_string(self, args.first().unwrap_or(&Value::Nil));
                let pieces: Vec<Value> = self.pool.split(id, sep).into_iter().map(Value::String).collect();
                self.maybe_collect();
                Ok(Value::Array(self.heap.alloc_array(pieces)))
            }
            "find" | "indexOf" => {
                let needle = arg_string(self, args.first().unwrap_or(&Value::Nil));
                Ok(Value::Int(self.pool.index_of(id, needle, 0) as i32))
            }
            "at" => {
                let idx = args.first().and_then(Value::as_f64).unwrap_or(0.0) as i64;
                Ok(self.pool.at(id, idx).map_or(Value::Nil, Value::String))
            }
            "substring" => {
                let start = args.first().and_then(Value::as_f64).unwrap_or(0.0) as usize;
                let end = args
                    .get(1)
                    .and_then(Value::as_f64)
                    .map_or(self.pool.len(id), |v| v as usize);
                Ok(Value::String(self.pool.substring(id, start, end)))
            }
            "replace" => {
                let old = arg_string(self, args.first().unwrap_or(&Value::Nil));
                let new = arg_string(self, args.get(1).unwrap_or(&Value::Nil));
                Ok(Value::String(self.pool.replace(id, old, new)))
            }
            "startsWith" => {
                let prefix = arg_string(self, args.first().unwrap_or(&Value::Nil));
                Ok(Value::Bool(self.pool.starts_with(id, prefix)))
            }
            "endsWith" => {
                let suffix = arg_string(self, args.first().unwrap_or(&Value::Nil));
                Ok(Value::Bool(self.pool.ends_with(id, suffix)))
            }
            "contains" | "has" => {
                let needle = arg_string(self, args.first().unwrap_or(&Value::Nil));
                Ok(Value::Bool(self.pool.contains(id, needle)))
            }
            "repeat" => {
                let count = args.first().and_then(Value::as_f64).unwrap_or(0.0) as usize;
                Ok(Value::String(self.pool.repeat(id, count)))
            }
            _ => Err(RuntimeError::UndefinedProperty {
                kind: "string",
                name: name.to_string(),
            }
            .into()),
        }
    }

    fn invoke_buffer_method(
        &mut self,
        id: crate::value::BufferId,
        name: &str,
        args: &[Value],
    ) -> Result<Value, VmError> {
        match name {
            "seek" => {
                let pos = args.first().and_then(Value::as_f64).unwrap_or(0.0) as usize;
                if let Some(buf) = self.heap.buffers.get_mut(id.0) {
                    buf.seek(pos);
                }
                Ok(Value::Nil)
            }
            "tell" => Ok(Value::Int(
                self.heap.buffers.get(id.0).map(|b| b.cursor).unwrap_or(0) as i32,
            )),
            "fill" => {
                let value = args.first().copied().unwrap_or(Value::Nil);
                if let Some(buf) = self.heap.buffers.get_mut(id.0) {
                    let count = buf.count;
                    for i in 0..count {
                        write_buffer_element(buf, i, value)?;
                    }
                }
                Ok(Value::Buffer(id))
            }
            "writeByte" => {
                let byte = args.first().and_then(Value::as_f64).unwrap_or(0.0) as u8;
                let buf = self.heap.buffers.get_mut(id.0).ok_or(FatalError::HeapCorruption {
                    message: "dangling buffer".to_string(),
                })?;
                if buf.cursor + 1 > buf.byte_len() {
                    return Err(RuntimeError::IndexOutOfRange {
                        kind: "buffer",
                        index: buf.cursor as i64,
                        len: buf.byte_len(),
                    }
                    .into());
                }
                buf.data[buf.cursor] = byte;
                buf.cursor += 1;
                Ok(Value::Buffer(id))
            }
            "readByte" => {
                let buf = self.heap.buffers.get_mut(id.0).ok_or(FatalError::HeapCorruption {
                    message: "dangling buffer".to_string(),
                })?;
                if buf.cursor + 1 > buf.byte_len() {
                    return Err(RuntimeError::IndexOutOfRange {
                        kind: "buffer",
                        index: buf.cursor as i64,
                        len: buf.byte_len(),
                    }
                    .into());
                }
                let value = buf.data[buf.cursor];
                buf.cursor += 1;
                Ok(Value::Byte(value))
            }
            // `save(filename)` persists raw buffer bytes to disk; genuinely a
            // file-io concern, not a core VM one, so it only exists with that
            // feature enabled.
            #[cfg(feature = "file-io")]
            "save" => {
                let Some(Value::String(path_id)) = args.first().copied() else {
                    return Err(RuntimeError::TypeMismatch {
                        op: "save",
                        lhs: "buffer",
                        rhs: "nil",
                    }
                    .into());
                };
                let path = self.pool.as_str(path_id).to_string();
                let bytes = self.heap.buffers.get(id.0).map(|b| b.data.clone()).unwrap_or_default();
                std::fs::write(&path, bytes).map_err(|err| RuntimeError::Host {
                    message: format!("save() failed writing '{path}': {err}"),
                })?;
                Ok(Value::Buffer(id))
            }
            _ => Err(RuntimeError::UndefinedProperty {
                kind: "buffer",
                name: name.to_string(),
            }
            .into()),
        }
    }

    // ---- return / exceptions ----------------------------------------------------

    fn do_return(&mut self, pi: usize, mut values: Vec<Value>) -> Result<(), VmError> {
        // `finally` blocks in this frame must run before the frame actually
        // pops: if any try handler belonging to this frame has an
        // unexecuted finally, stash the return and jump there instead.
        let current_depth = self.processes[pi].frames.len();
        if let Some(pos) = self.processes[pi]
            .try_stack
            .iter()
            .rposition(|h| !h.in_finally && h.finally_ip.is_some() && h.frame_depth == current_depth)
        {
            let frame_idx = self.processes[pi].frames.len() - 1;
            let finally_ip = {
                let handler = &mut self.processes[pi].try_stack[pos];
                handler.in_finally = true;
                handler.pending_returns = values;
                handler.finally_ip.unwrap()
            };
            self.processes[pi].frames[frame_idx].ip = finally_ip;
            return Ok(());
        }

        let frame = self.processes[pi].frames.pop().ok_or(FatalError::HeapCorruption {
            message: "return with no active frame".to_string(),
        })?;
        self.close_upvalues_from(pi, frame.base);
        self.processes[pi].stack.truncate(frame.base);
        let value = values.pop().unwrap_or(Value::Nil);
        self.push_checked(pi, value)?;
        Ok(())
    }

    /// On an uncaught-at-this-point runtime error, walk the try-handler
    /// stack top-down per spec §4.8. Returns `Some(Done(...))`-style
    /// outcome only when the process terminates with no handler left.
    fn unwind(&mut self, pi: usize, err: RuntimeError) -> Result<Option<ProcessOutcome>, VmError> {
        let message = err.to_string();
        loop {
            let Some(pos) = self.processes[pi]
                .try_stack
                .iter()
                .rposition(|h| !h.in_finally)
            else {
                // Every remaining handler is already draining its finally;
                // carry the error forward into the innermost one.
                if let Some(handler) = self.processes[pi].try_stack.last_mut() {
                    handler.pending_error = Some(Value::String(
                        self.pool.intern(&message),
                    ));
                    return Ok(None);
                }
                if self.debug_mode {
                    let trace = self.format_stack_trace(pi);
                    log::warn!(
                        "uncaught exception in process {}: {message}\n{trace}",
                        self.processes[pi].id
                    );
                } else {
                    log::warn!("uncaught exception in process {}: {message}", self.processes[pi].id);
                }
                self.processes[pi].state = ProcessState::Dead;
                self.processes[pi].frames.clear();
                return Ok(Some(ProcessOutcome::Done(Value::Nil)));
            };

            let handler = self.processes[pi].try_stack[pos].clone_for_unwind();
            self.close_upvalues_from(pi, handler.stack_restore);
            self.processes[pi].stack.truncate(handler.stack_restore);
            // Pop every frame called since this handler was installed -
            // unwinding to it is like a return from each of them in turn.
            self.processes[pi].frames.truncate(handler.frame_depth);
            let frame_idx = handler.frame_depth.checked_sub(1).ok_or(FatalError::TryHandlerStack)?;

            if let Some(catch_ip) = handler.catch_ip {
                if !handler.catch_consumed {
                    self.processes[pi].try_stack[pos].catch_consumed = true;
                    let err_id = self.pool.intern(&message);
                    self.push_checked(pi, Value::String(err_id))?;
                    self.processes[pi].frames[frame_idx].ip = catch_ip;
                    return Ok(None);
                }
            }
            if let Some(finally_ip) = handler.finally_ip {
                let err_id = self.pool.intern(&message);
                self.processes[pi].try_stack[pos].in_finally = true;
                self.processes[pi].try_stack[pos].pending_error = Some(Value::String(err_id));
                self.processes[pi].frames[frame_idx].ip = finally_ip;
                return Ok(None);
            }
            self.processes[pi].try_stack.remove(pos);
        }
    }

    // ---- upvalues ----------------------------------------------------------------

    fn capture_upvalue(&mut self, pi: usize, stack_slot: usize) -> UpvalueId {
        for &existing in &self.open_upvalues {
            if let Some(Upvalue::Open { process, slot }) = self.heap.upvalues.get(existing.0) {
                if *process == self.processes[pi].id && *slot == stack_slot {
                    return existing;
                }
            }
        }
        let id = self.heap.alloc_upvalue(Upvalue::Open {
            process: self.processes[pi].id,
            slot: stack_slot,
        });
        self.open_upvalues.push(id);
        id
    }

    fn read_upvalue(&self, closure: Option<ClosureId>, slot: u8) -> Result<Value, VmError> {
        let closure = closure.ok_or(FatalError::HeapCorruption {
            message: "GET_UPVALUE outside a closure frame".to_string(),
        })?;
        let uv_id = self
            .heap
            .closures
            .get(closure.0)
            .and_then(|c| c.upvalues.get(slot as usize).copied())
            .ok_or(FatalError::HeapCorruption {
                message: "upvalue slot out of range".to_string(),
            })?;
        match self.heap.upvalues.get(uv_id.0) {
            Some(Upvalue::Closed(v)) => Ok(*v),
            Some(Upvalue::Open { process, slot }) => {
                let owner = self.find_process(*process).ok_or(FatalError::HeapCorruption {
                    message: "open upvalue's owning process is gone".to_string(),
                })?;
                Ok(owner.stack[*slot])
            }
            None => Err(FatalError::HeapCorruption {
                message: "dangling upvalue".to_string(),
            }
            .into()),
        }
    }

    fn write_upvalue(&mut self, closure: Option<ClosureId>, slot: u8, value: Value) -> Result<(), VmError> {
        let closure = closure.ok_or(FatalError::HeapCorruption {
            message: "SET_UPVALUE outside a closure frame".to_string(),
        })?;
        let uv_id = self
            .heap
            .closures
            .get(closure.0)
            .and_then(|c| c.upvalues.get(slot as usize).copied())
            .ok_or(FatalError::HeapCorruption {
                message: "upvalue slot out of range".to_string(),
            })?;
        let target = match self.heap.upvalues.get(uv_id.0) {
            Some(Upvalue::Open { process, slot }) => Some((*process, *slot)),
            Some(Upvalue::Closed(_)) => None,
            None => {
                return Err(FatalError::HeapCorruption {
                    message: "dangling upvalue".to_string(),
                }
                .into())
            }
        };
        match target {
            Some((owner_id, stack_slot)) => {
                if let Some(idx) = self.find_process_index(owner_id) {
                    self.processes[idx].stack[stack_slot] = value;
                }
            }
            None => {
                if let Some(slot_ref) = self.heap.upvalues.get_mut(uv_id.0) {
                    *slot_ref = Upvalue::Closed(value);
                }
            }
        }
        Ok(())
    }

    /// Close every open upvalue anchored at or above `from` in the current
    /// process's stack: copy the live value into the upvalue's own slot
    /// and rebind it so later reads/writes no longer touch the stack.
    fn close_upvalues_from(&mut self, pi: usize, from: usize) {
        let pid = self.processes[pi].id;
        let mut still_open = Vec::with_capacity(self.open_upvalues.len());
        for uv_id in self.open_upvalues.drain(..) {
            let should_close = matches!(
                self.heap.upvalues.get(uv_id.0),
                Some(Upvalue::Open { process, slot }) if *process == pid && *slot >= from
            );
            if should_close {
                if let Some(Upvalue::Open { slot, .. }) = self.heap.upvalues.get(uv_id.0).cloned() {
                    let value = self.processes[pi].stack[slot];
                    if let Some(slot_ref) = self.heap.upvalues.get_mut(uv_id.0) {
                        *slot_ref = Upvalue::Closed(value);
                    }
                }
            } else {
                still_open.push(uv_id);
            }
        }
        self.open_upvalues = still_open;
    }
}

/// Read one typed field out of a native struct's raw byte storage.
fn read_native_field(bytes: &[u8], offset: usize, ty: NativePrimitive) -> Value {
    let size = ty.size();
    let Some(field) = bytes.get(offset..offset + size) else {
        return Value::Nil;
    };
    match ty {
        NativePrimitive::U8 => Value::Byte(field[0]),
        NativePrimitive::I32 => Value::Int(i32::from_le_bytes(field.try_into().unwrap())),
        NativePrimitive::U32 => Value::UInt(u32::from_le_bytes(field.try_into().unwrap())),
        NativePrimitive::F32 => Value::Float(f32::from_le_bytes(field.try_into().unwrap())),
        NativePrimitive::F64 => Value::Double(f64::from_le_bytes(field.try_into().unwrap())),
    }
}

/// Write one typed field into a native struct's raw byte storage.
fn write_native_field(bytes: &mut [u8], offset: usize, ty: NativePrimitive, value: Value) {
    let size = ty.size();
    if offset + size > bytes.len() {
        return;
    }
    let n = value.as_f64().unwrap_or(0.0);
    let encoded: Vec<u8> = match ty {
        NativePrimitive::U8 => vec![n as u8],
        NativePrimitive::I32 => (n as i32).to_le_bytes().to_vec(),
        NativePrimitive::U32 => (n as u32).to_le_bytes().to_vec(),
        NativePrimitive::F32 => (n as f32).to_le_bytes().to_vec(),
        NativePrimitive::F64 => n.to_le_bytes().to_vec(),
    };
    bytes[offset..offset + size].copy_from_slice(&encoded);
}

fn read_buffer_element(buf: &Buffer, index: usize) -> Result<Value, VmError> {
    let size = buf.element_type.size();
    let offset = index * size;
    if offset + size > buf.data.len() {
        return Err(RuntimeError::IndexOutOfRange {
            kind: "buffer",
            index: index as i64,
            len: buf.count,
        }
        .into());
    }
    let bytes = &buf.data[offset..offset + size];
    Ok(match buf.element_type {
        ElementType::U8 => Value::Byte(bytes[0]),
        ElementType::I16 => Value::Int(i16::from_le_bytes([bytes[0], bytes[1]]) as i32),
        ElementType::U16 => Value::Int(u16::from_le_bytes([bytes[0], bytes[1]]) as i32),
        ElementType::I32 => Value::Int(i32::from_le_bytes(bytes.try_into().unwrap())),
        ElementType::U32 => Value::UInt(u32::from_le_bytes(bytes.try_into().unwrap())),
        ElementType::F32 => Value::Float(f32::from_le_bytes(bytes.try_into().unwrap())),
        ElementType::F64 => Value::Double(f64::from_le_bytes(bytes.try_into().unwrap())),
    })
}

fn write_buffer_element(buf: &mut Buffer, index: usize, value: Value) -> Result<(), VmError> {
    let size = buf.element_type.size();
    let offset = index * size;
    if offset + size > buf.data.len() {
        return Err(RuntimeError::IndexOutOfRange {
            kind: "buffer",
            index: index as i64,
            len: buf.count,
        }
        .into());
    }
    let n = value.as_f64().unwrap_or(0.0);
    let bytes: Vec<u8> = match buf.element_type {
        ElementType::U8 => vec![n as u8],
        ElementType::I16 => (n as i16).to_le_bytes().to_vec(),
        ElementType::U16 => (n as u16).to_le_bytes().to_vec(),
        ElementType::I32 => (n as i32).to_le_bytes().to_vec(),
        ElementType::U32 => (n as u32).to_le_bytes().to_vec(),
        ElementType::F32 => (n as f32).to_le_bytes().to_vec(),
        ElementType::F64 => n.to_le_bytes().to_vec(),
    };
    buf.data[offset..offset + size].copy_from_slice(&bytes);
    Ok(())
}
