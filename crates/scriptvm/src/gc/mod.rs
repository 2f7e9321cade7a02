// SPDX-License-Identifier: MIT

//! The managed heap and its mark-and-sweep collector.
//!
//! Every heap object kind lives in its own [`Table`]: a vector of slots plus
//! a free list of reusable indices. This replaces the reference
//! implementation's intrusive linked list of `GCObject`s with an owned,
//! per-kind vector — the collector still has to reach every live object and
//! reclaim exactly the unreachable ones, it just does so by walking typed
//! tables instead of a linked list of tagged pointers.
//!
//! Collection runs in two passes driven by the interpreter, which alone
//! knows where the live roots are (process stacks, privates, globals, open
//! upvalues):
//! 1. [`Heap::mark_value`] for every root value, which transitively marks
//!    everything that value's object can reach.
//! 2. [`Heap::sweep`], which reclaims every object whose slot was not
//!    marked during this cycle and clears the mark bit on survivors.


use crate::object::{
    Array, Buffer, Closure, ClassInstance, Map, NativeClassInstance, NativeStructInstance,
    StructInstance, Upvalue,
};
use crate::value::{
    ArrayId, BufferId, ClassInstanceId, ClosureId, MapId, NativeClassInstanceId,
    NativeStructInstanceId, StructInstanceId, UpvalueId, Value,
};

/// Default growth factor applied to `next_gc` after a sweep (must be >= 1.5
/// per the collector's growth policy).
pub const GROWTH_FACTOR: f64 = 2.0;

/// Initial allocation threshold before the first collection is considered.
pub const INITIAL_NEXT_GC: usize = 1024 * 1024;

struct Slot<T> {
    value: Option<T>,
    marked: bool,
    persistent: bool,
}

/// A typed object table: a vector of slots plus a free list of indices
/// available for reuse.
pub struct Table<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live_count: usize,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live_count: 0,
        }
    }
}

impl<T> Table<T> {
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    fn insert(&mut self, value: T, persistent: bool) -> u32 {
        self.live_count += 1;
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Slot {
                value: Some(value),
                marked: false,
                persistent,
            };
            idx
        } else {
            self.slots.push(Slot {
                value: Some(value),
                marked: false,
                persistent,
            });
            (self.slots.len() - 1) as u32
        }
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots
            .get_mut(id as usize)
            .and_then(|s| s.value.as_mut())
    }

    /// Mark `id` as reachable. Returns `true` the first time this object is
    /// marked during the current cycle, so callers can push it for
    /// transitive propagation exactly once.
    fn mark(&mut self, id: u32) -> bool {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            if slot.value.is_some() && !slot.marked {
                slot.marked = true;
                return true;
            }
        }
        false
    }

    /// Reclaim every unmarked, non-persistent slot. Returns the number of
    /// objects freed.
    fn sweep(&mut self) -> usize {
        self.sweep_with(|_| {})
    }

    /// As [`sweep`](Self::sweep), but `on_reclaim` runs against each value
    /// immediately before it is dropped — the hook a type-specific
    /// destructor (spec §4.4 sweep phase) attaches through.
    fn sweep_with<F: FnMut(&mut T)>(&mut self, mut on_reclaim: F) -> usize {
        let mut freed = 0;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.is_none() {
                continue;
            }
            if slot.persistent {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                if let Some(v) = slot.value.as_mut() {
                    on_reclaim(v);
                }
                slot.value = None;
                self.free.push(idx as u32);
                freed += 1;
                self.live_count -= 1;
            }
        }
        freed
    }
}

/// Counts produced by a completed collection cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub freed: usize,
    pub bytes_allocated_before: usize,
    pub bytes_allocated_after: usize,
}

/// The managed heap: one [`Table`] per object kind, plus allocation
/// accounting used to decide when to collect.
#[derive(Default)]
pub struct Heap {
    pub arrays: Table<Array>,
    pub maps: Table<Map>,
    pub buffers: Table<Buffer>,
    pub structs: Table<StructInstance>,
    pub classes: Table<ClassInstance>,
    pub native_classes: Table<NativeClassInstance>,
    pub native_structs: Table<NativeStructInstance>,
    pub closures: Table<Closure>,
    pub upvalues: Table<Upvalue>,
    bytes_allocated: usize,
    next_gc: usize,
}

/// Rough per-object accounting sizes, used only to decide when to collect.
fn base_cost<T>() -> usize {
    std::mem::size_of::<T>() + 16
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_gc: INITIAL_NEXT_GC,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    #[must_use]
    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// Allocation sites call this before allocating; when it returns `true`
    /// the interpreter must run a collection (after writing its working
    /// `ip`/`stackTop` back to the frame, see `vm` module docs).
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated >= self.next_gc
    }

    pub fn alloc_array(&mut self, elements: Vec<Value>) -> ArrayId {
        self.bytes_allocated += base_cost::<Array>() + elements.capacity() * 16;
        ArrayId(self.arrays.insert(Array { elements }, false))
    }

    pub fn alloc_map(&mut self, map: Map) -> MapId {
        self.bytes_allocated += base_cost::<Map>() + map.entries.len() * 32;
        MapId(self.maps.insert(map, false))
    }

    pub fn alloc_buffer(&mut self, buffer: Buffer) -> BufferId {
        self.bytes_allocated += base_cost::<Buffer>() + buffer.byte_len();
        BufferId(self.buffers.insert(buffer, false))
    }

    pub fn alloc_struct_instance(&mut self, instance: StructInstance) -> StructInstanceId {
        self.bytes_allocated += base_cost::<StructInstance>() + instance.fields.len() * 16;
        StructInstanceId(self.structs.insert(instance, false))
    }

    pub fn alloc_class_instance(&mut self, instance: ClassInstance) -> ClassInstanceId {
        self.bytes_allocated += base_cost::<ClassInstance>() + instance.fields.len() * 16;
        ClassInstanceId(self.classes.insert(instance, false))
    }

    pub fn alloc_native_class_instance(
        &mut self,
        instance: NativeClassInstance,
        persistent: bool,
    ) -> NativeClassInstanceId {
        self.bytes_allocated += base_cost::<NativeClassInstance>();
        NativeClassInstanceId(self.native_classes.insert(instance, persistent))
    }

    pub fn alloc_native_struct_instance(
        &mut self,
        instance: NativeStructInstance,
        persistent: bool,
    ) -> NativeStructInstanceId {
        self.bytes_allocated += base_cost::<NativeStructInstance>() + instance.bytes.len();
        NativeStructInstanceId(self.native_structs.insert(instance, persistent))
    }

    pub fn alloc_closure(&mut self, closure: Closure) -> ClosureId {
        self.bytes_allocated += base_cost::<Closure>() + closure.upvalues.len() * 4;
        ClosureId(self.closures.insert(closure, false))
    }

    pub fn alloc_upvalue(&mut self, upvalue: Upvalue) -> UpvalueId {
        self.bytes_allocated += base_cost::<Upvalue>();
        UpvalueId(self.upvalues.insert(upvalue, false))
    }

    /// Mark `value` and transitively everything it can reach.
    pub fn mark_value(&mut self, value: Value) {
        let mut worklist = vec![value];
        self.drain_worklist(&mut worklist);
    }

    /// Mark a VM-wide open upvalue directly, even when no closure currently
    /// references it (still captured by a live local, not yet closed over).
    pub fn mark_upvalue_root(&mut self, id: UpvalueId) {
        let mut worklist = Vec::new();
        self.mark_upvalue(id, &mut worklist);
        self.drain_worklist(&mut worklist);
    }

    fn drain_worklist(&mut self, worklist: &mut Vec<Value>) {
        while let Some(v) = worklist.pop() {
            match v {
                Value::Array(id) => {
                    if self.arrays.mark(id.0) {
                        if let Some(arr) = self.arrays.get(id.0) {
                            worklist.extend(arr.elements.iter().copied());
                        }
                    }
                }
                Value::Map(id) => {
                    if self.maps.mark(id.0) {
                        if let Some(m) = self.maps.get(id.0) {
                            worklist.extend(m.entries.values().copied());
                        }
                    }
                }
                Value::Buffer(id) => {
                    self.buffers.mark(id.0);
                }
                Value::StructInstance(id) => {
                    if self.structs.mark(id.0) {
                        if let Some(s) = self.structs.get(id.0) {
                            worklist.extend(s.fields.iter().copied());
                        }
                    }
                }
                Value::ClassInstance(id) => {
                    if self.classes.mark(id.0) {
                        if let Some(c) = self.classes.get(id.0) {
                            worklist.extend(c.fields.iter().copied());
                        }
                    }
                }
                Value::NativeClassInstance(id) => {
                    self.native_classes.mark(id.0);
                }
                Value::NativeStructInstance(id) => {
                    self.native_structs.mark(id.0);
                }
                Value::Closure(id) => {
                    if self.closures.mark(id.0) {
                        if let Some(c) = self.closures.get(id.0) {
                            for &uv in &c.upvalues {
                                self.mark_upvalue(uv, worklist);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn mark_upvalue(&mut self, id: UpvalueId, worklist: &mut Vec<Value>) {
        if self.upvalues.mark(id.0) {
            if let Some(Upvalue::Closed(v)) = self.upvalues.get(id.0) {
                worklist.push(*v);
            }
        }
    }

    /// Run the sweep phase and resize the collection threshold. Callers run
    /// root enumeration (calling `mark_value` for every root) before this.
    /// Native-class and native-struct instances run no destructor hook;
    /// use [`sweep_dtors`](Self::sweep_dtors) when the host has registered
    /// any.
    pub fn sweep(&mut self) -> GcStats {
        self.sweep_dtors(|_| {}, |_| {})
    }

    /// As [`sweep`](Self::sweep), but `on_native_class`/`on_native_struct`
    /// run against each reclaimed native instance immediately before its
    /// payload is dropped, so the host's registered destructor callback
    /// (spec §4.9 `registerNativeClass`/`registerNativeStruct`) sees a
    /// still-valid payload exactly once per instance.
    pub fn sweep_dtors<FC, FS>(&mut self, on_native_class: FC, on_native_struct: FS) -> GcStats
    where
        FC: FnMut(&mut NativeClassInstance),
        FS: FnMut(&mut NativeStructInstance),
    {
        let before = self.bytes_allocated;
        let mut freed = 0;
        freed += self.arrays.sweep();
        freed += self.maps.sweep();
        freed += self.buffers.sweep();
        freed += self.structs.sweep();
        freed += self.classes.sweep();
        freed += self.native_classes.sweep_with(on_native_class);
        freed += self.native_structs.sweep_with(on_native_struct);
        freed += self.closures.sweep();
        freed += self.upvalues.sweep();

        self.recompute_bytes_allocated();
        self.next_gc = ((self.bytes_allocated as f64) * GROWTH_FACTOR) as usize;
        self.next_gc = self.next_gc.max(INITIAL_NEXT_GC);

        GcStats {
            freed,
            bytes_allocated_before: before,
            bytes_allocated_after: self.bytes_allocated,
        }
    }

    fn recompute_bytes_allocated(&mut self) {
        let mut total = 0usize;
        for slot in &self.arrays.slots {
            if let Some(a) = &slot.value {
                total += base_cost::<Array>() + a.elements.capacity() * 16;
            }
        }
        for slot in &self.maps.slots {
            if let Some(m) = &slot.value {
                total += base_cost::<Map>() + m.entries.len() * 32;
            }
        }
        for slot in &self.buffers.slots {
            if let Some(b) = &slot.value {
                total += base_cost::<Buffer>() + b.byte_len();
            }
        }
        for slot in &self.structs.slots {
            if let Some(s) = &slot.value {
                total += base_cost::<StructInstance>() + s.fields.len() * 16;
            }
        }
        for slot in &self.classes.slots {
            if let Some(c) = &slot.value {
                total += base_cost::<ClassInstance>() + c.fields.len() * 16;
            }
        }
        for slot in &self.native_classes.slots {
            if slot.value.is_some() {
                total += base_cost::<NativeClassInstance>();
            }
        }
        for slot in &self.native_structs.slots {
            if let Some(n) = &slot.value {
                total += base_cost::<NativeStructInstance>() + n.bytes.len();
            }
        }
        for slot in &self.closures.slots {
            if let Some(c) = &slot.value {
                total += base_cost::<Closure>() + c.upvalues.len() * 4;
            }
        }
        for slot in &self.upvalues.slots {
            if slot.value.is_some() {
                total += base_cost::<Upvalue>();
            }
        }
        self.bytes_allocated = total;
    }
}
