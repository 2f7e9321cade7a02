// SPDX-License-Identifier: MIT

//! Script-level class and struct blueprints.
//!
//! A [`ClassDef`] carries everything method resolution and instance
//! construction need: its field layout, its method table, and the single
//! inheritance chain (an optional script superclass layered over an
//! optional native superclass). A [`StructDef`] is simpler — a fixed,
//! unordered-at-the-source but declaration-ordered tuple of named fields
//! with no inheritance.
//!
//! Native blueprints (registered by the host, not the compiler) live in
//! [`crate::host`] since they carry host-owned constructor/destructor
//! callbacks rather than script method bodies.

#[cfg(test)]
mod mod_test;

use crate::pool::StringId;
use crate::value::{ClassId, FunctionId, NativeClassId, StructDefId};
use crate::Value;
use std::collections::HashMap;

/// A field declared on a class, with its optional default-value constant.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: StringId,
    pub default: Option<Value>,
}

/// Script class blueprint: name, field layout, methods, and ancestry.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: StringId,
    pub fields: Vec<FieldDecl>,
    pub methods: HashMap<StringId, FunctionId>,
    pub superclass: Option<ClassId>,
    pub native_superclass: Option<NativeClassId>,
}

impl ClassDef {
    #[must_use]
    pub fn new(name: StringId) -> Self {
        Self {
            name,
            fields: Vec::new(),
            methods: HashMap::new(),
            superclass: None,
            native_superclass: None,
        }
    }

    #[must_use]
    pub fn field_index(&self, name: StringId) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// The distinguished constructor method, if declared.
    #[must_use]
    pub fn init(&self, init_name: StringId) -> Option<FunctionId> {
        self.methods.get(&init_name).copied()
    }

    /// Default field values in declaration order, for a freshly constructed
    /// instance before any constructor body runs.
    #[must_use]
    pub fn default_fields(&self) -> Vec<Value> {
        self.fields
            .iter()
            .map(|f| f.default.unwrap_or(Value::Nil))
            .collect()
    }
}

/// A registry of script class blueprints, indexed by [`ClassId`].
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    classes: Vec<ClassDef>,
}

impl ClassRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: ClassDef) -> ClassId {
        self.classes.push(def);
        ClassId((self.classes.len() - 1) as u32)
    }

    #[must_use]
    pub fn get(&self, id: ClassId) -> Option<&ClassDef> {
        self.classes.get(id.index() as usize)
    }

    /// Resolve a method name by walking the script superclass chain
    /// starting at `id`. Does not fall back to any native superclass; the
    /// interpreter checks that separately once this returns `None`.
    #[must_use]
    pub fn resolve_method(&self, id: ClassId, name: StringId) -> Option<FunctionId> {
        let mut current = Some(id);
        while let Some(cid) = current {
            let def = self.get(cid)?;
            if let Some(func) = def.methods.get(&name) {
                return Some(*func);
            }
            current = def.superclass;
        }
        None
    }

    /// Iterate every registered class, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.iter()
    }
}

/// Struct blueprint: a fixed, declaration-ordered tuple of named fields.
#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: StringId,
    pub field_names: Vec<StringId>,
}

impl StructDef {
    #[must_use]
    pub fn new(name: StringId) -> Self {
        Self {
            name,
            field_names: Vec::new(),
        }
    }

    #[must_use]
    pub fn field_index(&self, name: StringId) -> Option<usize> {
        self.field_names.iter().position(|&n| n == name)
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.field_names.len()
    }
}

/// A registry of struct blueprints, indexed by [`StructDefId`].
#[derive(Debug, Clone, Default)]
pub struct StructRegistry {
    structs: Vec<StructDef>,
}

impl StructRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: StructDef) -> StructDefId {
        self.structs.push(def);
        StructDefId((self.structs.len() - 1) as u32)
    }

    #[must_use]
    pub fn get(&self, id: StructDefId) -> Option<&StructDef> {
        self.structs.get(id.index() as usize)
    }
}
