// SPDX-License-Identifier: MIT

use super::*;
use crate::bytecode::Chunk;
use crate::value::FunctionId;

#[test]
fn new_function_starts_with_no_upvalues() {
    let f = Function::new(None, 2, Chunk::new());
    assert_eq!(f.upvalue_count(), 0);
    assert_eq!(f.arity, 2);
}

#[test]
fn upvalue_sources_distinguish_local_from_enclosing() {
    let mut f = Function::new(None, 0, Chunk::new());
    f.upvalues.push(UpvalueSource::Local(1));
    f.upvalues.push(UpvalueSource::Enclosing(0));
    assert_eq!(f.upvalue_count(), 2);
    assert_eq!(f.upvalues[0], UpvalueSource::Local(1));
    assert_eq!(f.upvalues[1], UpvalueSource::Enclosing(0));
}

#[test]
fn process_def_starts_with_no_private_argument_mappings() {
    let def = ProcessDef::new(crate::pool::StringId(0), FunctionId(0));
    assert!(def.private_args.is_empty());
}
