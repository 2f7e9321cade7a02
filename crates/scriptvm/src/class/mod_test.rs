// SPDX-License-Identifier: MIT

use super::*;
use crate::pool::StringId;

#[test]
fn method_resolution_walks_the_superclass_chain() {
    let mut registry = ClassRegistry::new();
    let method_name = StringId(1);

    let mut base = ClassDef::new(StringId(0));
    base.methods.insert(method_name, FunctionId(7));
    let base_id = registry.register(base);

    let mut derived = ClassDef::new(StringId(2));
    derived.superclass = Some(base_id);
    let derived_id = registry.register(derived);

    assert_eq!(
        registry.resolve_method(derived_id, method_name),
        Some(FunctionId(7))
    );
}

#[test]
fn an_override_on_the_subclass_wins_over_the_superclass() {
    let mut registry = ClassRegistry::new();
    let method_name = StringId(1);

    let mut base = ClassDef::new(StringId(0));
    base.methods.insert(method_name, FunctionId(1));
    let base_id = registry.register(base);

    let mut derived = ClassDef::new(StringId(2));
    derived.superclass = Some(base_id);
    derived.methods.insert(method_name, FunctionId(2));
    let derived_id = registry.register(derived);

    assert_eq!(
        registry.resolve_method(derived_id, method_name),
        Some(FunctionId(2))
    );
}

#[test]
fn default_fields_fall_back_to_nil() {
    let mut def = ClassDef::new(StringId(0));
    def.fields.push(FieldDecl {
        name: StringId(1),
        default: Some(Value::Int(42)),
    });
    def.fields.push(FieldDecl {
        name: StringId(2),
        default: None,
    });
    assert_eq!(def.default_fields(), vec![Value::Int(42), Value::Nil]);
}

#[test]
fn struct_field_index_looks_up_by_name() {
    let mut def = StructDef::new(StringId(0));
    def.field_names.push(StringId(1));
    def.field_names.push(StringId(2));
    assert_eq!(def.field_index(StringId(2)), Some(1));
    assert_eq!(def.field_index(StringId(9)), None);
    assert_eq!(def.field_count(), 2);
}
