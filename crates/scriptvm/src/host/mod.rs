// SPDX-License-Identifier: MIT

//! The host embedding boundary: native function/class/struct/process
//! registration, stack manipulation helpers, and the re-entrant
//! host-to-script call protocol (spec §4.9, §6, §9 "re-entrant host/script
//! calls").
//!
//! Everything a host binding needs to extend the language lives here:
//! [`Vm::register_native`] and friends publish callable surfaces a script
//! can reach by name; [`Vm::call_function`]/[`Vm::call_method`]/
//! [`Vm::call_process`] let host code call back *into* script from a
//! native callback, re-entering [`Vm::run_process`] behind a
//! `stopOnCallReturn` boundary so a nested call returns to its caller
//! without running past it into whatever frame originally called the
//! native function.
//!
//! The external compiler front end itself is out of this crate's scope
//! (spec §1); [`Frontend`] is the narrow contract [`Vm::compile`] expects
//! it to satisfy, and [`CompiledUnit`] is the table of functions,
//! blueprints, and global names it must hand back (spec §6, "global name
//! table").

#[cfg(test)]
mod mod_test;

use crate::class::{ClassDef, StructDef};
use crate::error::{RuntimeError, VmError};
use crate::function::{Function, ProcessDef};
use crate::pool::StringId;
use crate::process::Process;
use crate::value::{
    FunctionId, ModuleRef, NativeClassId, NativeFnId, NativeProcessId, NativeStructId,
    ProcessDefId, ProcessId, Value,
};
use crate::vm::{
    ModuleFn, NativeClassCtor, NativeClassDtor, NativeClassEntry, NativeFieldDesc, NativeFn,
    NativeFnEntry, NativeMethodFn, NativePrimitive, NativeProcessEntry, NativeProcessFn,
    NativeProperty, NativePropertyGetter, NativePropertySetter, NativeStructEntry, ProcessOutcome,
    Vm,
};

/// Everything an external compiler front end publishes for one compiled
/// translation unit: functions, process/class/struct blueprints, and the
/// global-name table the runtime stores for diagnostics and by-name
/// `get_global`/`set_global` lookups.
#[derive(Debug, Clone, Default)]
pub struct CompiledUnit {
    pub functions: Vec<Function>,
    pub process_defs: Vec<ProcessDef>,
    pub classes: Vec<ClassDef>,
    pub structs: Vec<StructDef>,
    /// One entry per global slot this unit defines, in index order.
    pub globals: Vec<StringId>,
}

/// The contract an external lexer/parser/compiler front end satisfies so
/// [`Vm::compile`] can publish its output. The core does not implement a
/// front end (spec §1, "deliberately out of scope") — this trait is the
/// seam a real one plugs into.
pub trait Frontend {
    fn compile(&mut self, vm: &mut Vm, source: &str) -> Result<CompiledUnit, String>;
}

impl Vm {
    /// Invoke `frontend` against `source` and publish the resulting
    /// functions, blueprints, and global names into this VM. Returns the
    /// published unit so a caller can locate its entry point (e.g. the
    /// index of a freshly defined `main` process blueprint).
    pub fn compile(
        &mut self,
        frontend: &mut dyn Frontend,
        source: &str,
    ) -> Result<CompiledUnit, String> {
        let unit = frontend.compile(self, source)?;
        self.publish(unit.clone());
        Ok(unit)
    }

    /// Append a [`CompiledUnit`]'s tables into this VM's function,
    /// process/class/struct registries, and global-name table. Exposed
    /// separately from [`compile`](Self::compile) so a host that already
    /// has compiled output (e.g. a cached build) can publish it directly.
    pub fn publish(&mut self, unit: CompiledUnit) {
        self.functions.extend(unit.functions);
        self.process_defs.extend(unit.process_defs);
        for class in unit.classes {
            self.classes.register(class);
        }
        for def in unit.structs {
            self.structs.register(def);
        }
        for name in unit.globals {
            self.global_names.push(name);
            self.globals.push(Value::Nil);
        }
    }

    // ---- global table --------------------------------------------------------

    fn bind_global(&mut self, name: StringId, value: Value) {
        if let Some(idx) = self.global_names.iter().position(|&n| n == name) {
            self.globals[idx] = value;
        } else {
            self.global_names.push(name);
            self.globals.push(value);
        }
    }

    /// Look up a global by its source name, for embedder diagnostics and
    /// `setGlobal`/`getGlobal` (spec §6).
    #[must_use]
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let id = self.pool.find(name)?;
        let idx = self.global_names.iter().position(|&n| n == id)?;
        self.globals.get(idx).copied()
    }

    /// Write (or define) a global by source name.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let id = self.pool.intern(name);
        self.bind_global(id, value);
    }

    // ---- native registration --------------------------------------------------

    /// Register a global native function. `arity < 0` disables arity
    /// checking (spec §4.9).
    pub fn register_native(&mut self, name: &str, func: NativeFn, arity: i32) -> NativeFnId {
        let id = NativeFnId(self.natives.fns.len() as u32);
        self.natives.fns.push(NativeFnEntry { func, arity });
        let name_id = self.pool.intern(name);
        self.natives.fn_names.push(name_id);
        self.bind_global(name_id, Value::NativeFn(id));
        id
    }

    /// Register a native callback with privileged access to the current
    /// process's private slots (spec §4.6 CALL on a native process).
    pub fn register_native_process(
        &mut self,
        name: &str,
        func: NativeProcessFn,
        arity: i32,
    ) -> NativeProcessId {
        let id = NativeProcessId(self.natives.processes.len() as u32);
        self.natives.processes.push(NativeProcessEntry { func, arity });
        let name_id = self.pool.intern(name);
        self.bind_global(name_id, Value::NativeProcess(id));
        id
    }

    /// Register a native class surface usable from script. `persistent`
    /// excludes its instances from GC reclamation (spec §4.9).
    pub fn register_native_class(
        &mut self,
        name: &str,
        ctor: NativeClassCtor,
        dtor: Option<NativeClassDtor>,
        arg_count: i32,
        persistent: bool,
    ) -> NativeClassId {
        let name_id = self.pool.intern(name);
        let id = NativeClassId(self.natives.classes.len() as u32);
        self.natives.classes.push(NativeClassEntry {
            name: name_id,
            ctor,
            dtor,
            arg_count,
            persistent,
            methods: std::collections::HashMap::new(),
            properties: std::collections::HashMap::new(),
        });
        self.bind_global(name_id, Value::NativeClass(id));
        id
    }

    /// Attach a method to a previously registered native class.
    pub fn add_native_method(&mut self, class: NativeClassId, name: &str, method: NativeMethodFn) {
        let name_id = self.pool.intern(name);
        if let Some(entry) = self.natives.classes.get_mut(class.index() as usize) {
            entry.methods.insert(name_id, method);
        }
    }

    /// Attach a getter/setter property to a previously registered native
    /// class. `setter = None` makes the property read-only.
    pub fn add_native_property(
        &mut self,
        class: NativeClassId,
        name: &str,
        getter: NativePropertyGetter,
        setter: Option<NativePropertySetter>,
    ) {
        let name_id = self.pool.intern(name);
        if let Some(entry) = self.natives.classes.get_mut(class.index() as usize) {
            entry.properties.insert(name_id, NativeProperty { getter, setter });
        }
    }

    /// Register a native struct: a fixed-size, byte-exact payload
    /// constructed and destroyed by host callbacks and marshalled through
    /// field descriptors (spec §4.9, §9 "native struct marshalling").
    pub fn register_native_struct(
        &mut self,
        name: &str,
        size: usize,
        ctor: fn(&mut Vm, &mut Process, &mut [u8], &[Value]) -> Result<(), RuntimeError>,
        dtor: Option<fn(&mut [u8])>,
        persistent: bool,
    ) -> NativeStructId {
        let name_id = self.pool.intern(name);
        let id = NativeStructId(self.natives.structs.len() as u32);
        self.natives.structs.push(NativeStructEntry {
            name: name_id,
            size,
            ctor,
            dtor,
            persistent,
            fields: std::collections::HashMap::new(),
        });
        self.bind_global(name_id, Value::NativeStruct(id));
        id
    }

    /// Describe one field of a previously registered native struct: its
    /// byte offset, primitive marshalling type, and read-only flag.
    pub fn add_struct_field(
        &mut self,
        def: NativeStructId,
        name: &str,
        offset: usize,
        ty: NativePrimitive,
        read_only: bool,
    ) {
        let name_id = self.pool.intern(name);
        if let Some(entry) = self.natives.structs.get_mut(def.index() as usize) {
            entry
                .fields
                .insert(name_id, NativeFieldDesc { offset, ty, read_only });
        }
    }

    /// Start a named module; functions are attached to the returned
    /// builder with [`add_module_function`](Self::add_module_function).
    /// Module references are packed as `moduleId:funcId` (spec §4.9).
    pub fn add_module(&mut self, name: &str) -> ModuleBuilder {
        let name_id = self.pool.intern(name);
        let module_id = self.natives.modules.len() as u16;
        self.natives.modules.push(Vec::new());
        self.natives.module_names.push(name_id);
        ModuleBuilder { module_id }
    }

    /// Attach a function to a module started with [`add_module`](Self::add_module)
    /// and bind it as a global callable by `name`.
    pub fn add_module_function(
        &mut self,
        module: &ModuleBuilder,
        name: &str,
        func: ModuleFn,
    ) -> ModuleRef {
        let funcs = &mut self.natives.modules[module.module_id as usize];
        let func_id = funcs.len() as u16;
        funcs.push(func);
        let module_ref = ModuleRef {
            module_id: module.module_id,
            func_id,
        };
        let name_id = self.pool.intern(name);
        self.bind_global(name_id, Value::ModuleRef(module_ref));
        module_ref
    }

    // ---- re-entrant host -> script calls ---------------------------------------

    /// Call a script function by id from host code, re-entering
    /// [`run_process`](Self::run_process) and returning once this specific
    /// call completes (spec §4.9 `callFunction`, §5 re-entrancy).
    pub fn call_function(
        &mut self,
        process_index: usize,
        func: FunctionId,
        args: &[Value],
    ) -> Result<Value, VmError> {
        self.call_callable(process_index, Value::Function(func), args)
    }

    /// As [`call_function`](Self::call_function), looking the callable up
    /// by its global name first.
    pub fn call_function_by_name(
        &mut self,
        process_index: usize,
        name: &str,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let callee = self
            .get_global(name)
            .ok_or_else(|| RuntimeError::NotCallable {
                name: name.to_string(),
            })?;
        self.call_callable(process_index, callee, args)
    }

    /// Call a method on `receiver` by name from host code (spec §4.9
    /// `callMethod`), re-entering the interpreter the same way
    /// [`call_function`](Self::call_function) does.
    pub fn call_method(
        &mut self,
        process_index: usize,
        receiver: Value,
        name: &str,
        args: &[Value],
    ) -> Result<Value, VmError> {
        self.push_checked(process_index, receiver)?;
        for &arg in args {
            self.push_checked(process_index, arg)?;
        }
        let frame_depth = self.processes[process_index].frames.len();
        self.invoke(process_index, name, args.len(), None)?;
        self.drive_to_boundary(process_index, frame_depth)
    }

    /// Spawn `def` and drive it to completion synchronously, returning its
    /// result to host code (spec §4.9 `callProcess`). Unlike a script-level
    /// `CALL` on a process blueprint, which hands a running [`ProcessId`]
    /// back to the caller and lets the scheduler drive it tick by tick,
    /// this is a blocking host entry point: it keeps calling
    /// [`run_process`](Self::run_process) — resuming across any number of
    /// `OP_FRAME` yields — until the spawned process finishes.
    pub fn call_process(&mut self, def: ProcessDefId, args: &[Value]) -> Result<Value, VmError> {
        let new_id = self
            .spawn_process(def, ProcessId(0), args)
            .map_err(VmError::Fatal)?;
        let idx = self
            .find_process_index(new_id)
            .expect("just-spawned process must be present in the process table");
        loop {
            match self.run_process(idx)? {
                ProcessOutcome::Done(value) | ProcessOutcome::CallReturn(value) => {
                    return Ok(value)
                }
                ProcessOutcome::Frame(_) => {}
            }
        }
    }

    fn call_callable(
        &mut self,
        process_index: usize,
        callee: Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        self.push_checked(process_index, callee)?;
        for &arg in args {
            self.push_checked(process_index, arg)?;
        }
        let frame_depth = self.processes[process_index].frames.len();
        self.call_value(process_index, args.len())?;
        self.drive_to_boundary(process_index, frame_depth)
    }

    /// Shared tail of every re-entrant host call: if the call completed
    /// without pushing a frame (a native function, a built-in method, a
    /// struct/native-class/native-struct construction with no script
    /// `init`), its single result is already sitting on top of the stack.
    /// Otherwise a script frame is running and we must set the
    /// `stopOnCallReturn` boundary and keep driving until it unwinds back
    /// past `frame_depth`.
    fn drive_to_boundary(
        &mut self,
        process_index: usize,
        frame_depth: usize,
    ) -> Result<Value, VmError> {
        if self.processes[process_index].frames.len() <= frame_depth {
            return Ok(self.processes[process_index].pop());
        }
        let pid = self.processes[process_index].id;
        self.call_boundary = Some((pid, frame_depth));
        loop {
            match self.run_process(process_index)? {
                ProcessOutcome::CallReturn(value) | ProcessOutcome::Done(value) => {
                    return Ok(value)
                }
                ProcessOutcome::Frame(_) => {}
            }
        }
    }
}

/// Handle returned by [`Vm::add_module`]; attach functions to it with
/// [`Vm::add_module_function`].
pub struct ModuleBuilder {
    module_id: u16,
}

impl ModuleBuilder {
    #[must_use]
    pub const fn id(&self) -> u16 {
        self.module_id
    }
}

// ---- stack helpers (spec §4.9) -------------------------------------------------

impl Process {
    /// Current stack depth, as the host's `getTop`.
    #[must_use]
    pub fn top(&self) -> usize {
        self.stack.len()
    }

    /// Truncate or pad the stack to exactly `top` slots, the host's
    /// `setTop`. Padding fills with nil.
    pub fn set_top(&mut self, top: usize) {
        self.stack.resize(top, Value::Nil);
    }

    /// Insert `value` at `index`, shifting everything at and above it up
    /// by one slot.
    pub fn stack_insert(&mut self, index: usize, value: Value) {
        let index = index.min(self.stack.len());
        self.stack.insert(index, value);
    }

    /// Remove and return the value at `index`, shifting everything above
    /// it down by one slot. Out-of-range returns nil without mutating.
    pub fn stack_remove(&mut self, index: usize) -> Value {
        if index < self.stack.len() {
            self.stack.remove(index)
        } else {
            Value::Nil
        }
    }

    /// Rotate the top `count` stack slots by `amount` (positive moves the
    /// top element down, negative moves it up), the host's `rotate`.
    pub fn rotate(&mut self, count: usize, amount: isize) {
        let len = self.stack.len();
        if count == 0 || count > len {
            return;
        }
        let start = len - count;
        let shift = amount.rem_euclid(count as isize) as usize;
        if shift == 0 {
            return;
        }
        self.stack[start..].rotate_right(shift);
    }
}

/// Typed getter: numeric coercion of a value to `i32`, for native callback
/// argument marshalling.
#[must_use]
pub fn as_int(v: &Value) -> Option<i32> {
    v.as_f64().map(|f| f as i32)
}

/// Typed getter: numeric coercion of a value to `f64`.
#[must_use]
pub fn as_double(v: &Value) -> Option<f64> {
    v.as_f64()
}

/// Typed getter: `bool` via the value's truthiness rule.
#[must_use]
pub fn as_bool(v: &Value) -> bool {
    crate::value::is_truthy(v)
}

/// Typed getter: a pooled string's id, if `v` is a string.
#[must_use]
pub fn as_string(v: &Value) -> Option<StringId> {
    match *v {
        Value::String(id) => Some(id),
        _ => None,
    }
}
