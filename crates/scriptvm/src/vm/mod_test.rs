// SPDX-License-Identifier: MIT

//! End-to-end scenarios driving real bytecode through [`Vm::run_process`],
//! each one built by hand the way a compiler's code generator would,
//! since the front end that would normally emit these chunks is an
//! external collaborator this crate does not implement.

use super::*;
use crate::bytecode::{op, Chunk};
use crate::function::{Function, ProcessDef, UpvalueSource};
use crate::process::private;
use crate::scheduler::{Signal, SignalTarget};

fn push_function(vm: &mut Vm, func: Function) -> FunctionId {
    vm.functions.push(func);
    FunctionId((vm.functions.len() - 1) as u32)
}

fn push_process_def(vm: &mut Vm, name: &str, root: FunctionId) -> ProcessDefId {
    let name_id = vm.pool.intern(name);
    vm.process_defs.push(ProcessDef::new(name_id, root));
    ProcessDefId((vm.process_defs.len() - 1) as u32)
}

/// Patch a big-endian u16 operand already written into `chunk.code` at
/// byte offset `at` (used for forward-reference jump targets computed
/// only after the jumped-to code has been emitted).
fn patch_u16(chunk: &mut Chunk, at: usize, value: u16) {
    let bytes = value.to_be_bytes();
    chunk.code[at] = bytes[0];
    chunk.code[at + 1] = bytes[1];
}

/// Spawn `def` as the sole root process and drive it to completion,
/// asserting it never yields a frame or faults.
fn run_to_completion(vm: &mut Vm, def: ProcessDefId) -> Value {
    let pid = vm.spawn_process(def, ProcessId(0), &[]).unwrap();
    let idx = vm.find_process_index(pid).unwrap();
    match vm.run_process(idx).expect("process should not fault") {
        ProcessOutcome::Done(v) => v,
        other => panic!("expected the process to finish, got {other:?}"),
    }
}

#[test]
fn arithmetic_coercion_widens_to_double() {
    // return 3 + 0.5;
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    let three = chunk.add_constant(Value::Int(3));
    let half = chunk.add_constant(Value::Double(0.5));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(three, 1);
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(half, 1);
    chunk.write_u8(op::ADD, 1);
    chunk.write_u8(op::RETURN, 1);

    let root = push_function(&mut vm, Function::new(None, 0, chunk));
    let def = push_process_def(&mut vm, "main", root);

    assert_eq!(run_to_completion(&mut vm, def), Value::Double(3.5));
}

#[test]
fn string_concatenation_formats_the_non_string_operand() {
    // return "score=" + 100;
    let mut vm = Vm::new();
    let prefix = vm.pool.intern("score=");
    let mut chunk = Chunk::new();
    let prefix_const = chunk.add_constant(Value::String(prefix));
    let hundred = chunk.add_constant(Value::Int(100));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(prefix_const, 1);
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(hundred, 1);
    chunk.write_u8(op::ADD, 1);
    chunk.write_u8(op::RETURN, 1);

    let root = push_function(&mut vm, Function::new(None, 0, chunk));
    let def = push_process_def(&mut vm, "main", root);

    match run_to_completion(&mut vm, def) {
        Value::String(id) => assert_eq!(vm.pool.as_str(id), "score=100"),
        other => panic!("expected a string, got {other:?}"),
    }
}

/// Build the `make(n) { return fn() { n = n + 1; return n; }; }` inner
/// closure and its enclosing `make` function, wired so `CLOSURE` captures
/// `make`'s argument (frame slot 1, since slot 0 holds the callee).
fn build_make_function(vm: &mut Vm) -> FunctionId {
    let mut inner_chunk = Chunk::new();
    let one = inner_chunk.add_constant(Value::Int(1));
    inner_chunk.write_u8(op::GET_UPVALUE, 1);
    inner_chunk.write_u8(0, 1);
    inner_chunk.write_u8(op::CONSTANT, 1);
    inner_chunk.write_u16(one, 1);
    inner_chunk.write_u8(op::ADD, 1);
    inner_chunk.write_u8(op::SET_UPVALUE, 1);
    inner_chunk.write_u8(0, 1);
    inner_chunk.write_u8(op::RETURN, 1);
    let mut inner = Function::new(None, 0, inner_chunk);
    inner.upvalues.push(UpvalueSource::Local(1));
    let inner_id = push_function(vm, inner);

    let mut make_chunk = Chunk::new();
    let inner_const = make_chunk.add_constant(Value::Function(inner_id));
    make_chunk.write_u8(op::CLOSURE, 1);
    make_chunk.write_u16(inner_const, 1);
    make_chunk.write_u8(1, 1); // capture an enclosing local...
    make_chunk.write_u8(1, 1); // ...at slot 1 (make's argument n)
    make_chunk.write_u8(op::RETURN, 1);
    push_function(vm, Function::new(None, 1, make_chunk))
}

#[test]
fn closure_capture_mutates_across_calls() {
    // var c = make(10); c(); c(); return c();
    let mut vm = Vm::new();
    let make_id = build_make_function(&mut vm);

    let mut chunk = Chunk::new();
    let make_const = chunk.add_constant(Value::Function(make_id));
    let ten = chunk.add_constant(Value::Int(10));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(make_const, 1);
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(ten, 1);
    chunk.write_u8(op::CALL, 1);
    chunk.write_u8(1, 1); // c = make(10)

    for _ in 0..2 {
        chunk.write_u8(op::GET_LOCAL, 1);
        chunk.write_u8(1, 1);
        chunk.write_u8(op::CALL, 1);
        chunk.write_u8(0, 1);
        chunk.write_u8(op::POP, 1);
    }
    chunk.write_u8(op::GET_LOCAL, 1);
    chunk.write_u8(1, 1);
    chunk.write_u8(op::CALL, 1);
    chunk.write_u8(0, 1);
    chunk.write_u8(op::RETURN, 1);

    let root = push_function(&mut vm, Function::new(None, 0, chunk));
    let def = push_process_def(&mut vm, "main", root);

    assert_eq!(run_to_completion(&mut vm, def), Value::Int(13));
}

#[test]
fn two_closures_from_separate_make_calls_do_not_share_state() {
    // var c1 = make(10); c1(); c1(); var c2 = make(10); return c1() + c2();
    let mut vm = Vm::new();
    let make_id = build_make_function(&mut vm);

    let mut chunk = Chunk::new();
    let make_const = chunk.add_constant(Value::Function(make_id));
    let ten = chunk.add_constant(Value::Int(10));

    // c1 = make(10) -> local slot 1
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(make_const, 1);
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(ten, 1);
    chunk.write_u8(op::CALL, 1);
    chunk.write_u8(1, 1);

    // c1(); (discarded, advances n to 11)
    chunk.write_u8(op::GET_LOCAL, 1);
    chunk.write_u8(1, 1);
    chunk.write_u8(op::CALL, 1);
    chunk.write_u8(0, 1);
    chunk.write_u8(op::POP, 1);

    // c2 = make(10) -> local slot 2
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(make_const, 1);
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(ten, 1);
    chunk.write_u8(op::CALL, 1);
    chunk.write_u8(1, 1);

    // return c1() + c2();  (c1 -> 12, c2 -> 11, sum 23)
    chunk.write_u8(op::GET_LOCAL, 1);
    chunk.write_u8(1, 1);
    chunk.write_u8(op::CALL, 1);
    chunk.write_u8(0, 1);
    chunk.write_u8(op::GET_LOCAL, 1);
    chunk.write_u8(2, 1);
    chunk.write_u8(op::CALL, 1);
    chunk.write_u8(0, 1);
    chunk.write_u8(op::ADD, 1);
    chunk.write_u8(op::RETURN, 1);

    let root = push_function(&mut vm, Function::new(None, 0, chunk));
    let def = push_process_def(&mut vm, "main", root);

    assert_eq!(run_to_completion(&mut vm, def), Value::Int(23));
}

#[test]
fn try_finally_runs_on_the_return_path() {
    // var log = [];
    // def f() { try { return 1; } finally { log.push(2); } }
    // var r = f(); return log[0] + r;
    let mut vm = Vm::new();
    let push_name = vm.pool.intern("push");

    let mut f_chunk = Chunk::new();
    f_chunk.write_u8(op::TRY, 1);
    let try_operands_at = f_chunk.code.len();
    f_chunk.write_u16(0, 1); // catch offset patched to MAX (no catch)
    f_chunk.write_u16(0, 1); // finally offset patched below
    let after_try_header = f_chunk.code.len();

    let one = f_chunk.add_constant(Value::Int(1));
    f_chunk.write_u8(op::CONSTANT, 1);
    f_chunk.write_u16(one, 1);
    f_chunk.write_u8(op::RETURN, 1);

    let finally_start = f_chunk.code.len();
    f_chunk.write_u8(op::ENTER_FINALLY, 1);
    f_chunk.write_u8(op::GET_GLOBAL, 1);
    f_chunk.write_u16(0, 1); // global 0 = log
    let two = f_chunk.add_constant(Value::Int(2));
    f_chunk.write_u8(op::CONSTANT, 1);
    f_chunk.write_u16(two, 1);
    let push_const = f_chunk.add_constant(Value::String(push_name));
    f_chunk.write_u8(op::INVOKE, 1);
    f_chunk.write_u16(push_const, 1);
    f_chunk.write_u8(1, 1);
    f_chunk.write_u8(op::POP, 1);
    f_chunk.write_u8(op::EXIT_FINALLY, 1);

    patch_u16(&mut f_chunk, try_operands_at, u16::MAX);
    patch_u16(
        &mut f_chunk,
        try_operands_at + 2,
        (finally_start - after_try_header) as u16,
    );

    let f_id = push_function(&mut vm, Function::new(None, 0, f_chunk));

    let mut chunk = Chunk::new();
    chunk.write_u8(op::DEFINE_ARRAY, 1);
    chunk.write_u16(0, 1);
    chunk.write_u8(op::DEFINE_GLOBAL, 1);
    chunk.write_u16(0, 1); // global 0 = log = []

    let f_const = chunk.add_constant(Value::Function(f_id));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(f_const, 1);
    chunk.write_u8(op::CALL, 1);
    chunk.write_u8(0, 1); // r = f() -> local slot 1

    chunk.write_u8(op::GET_GLOBAL, 1);
    chunk.write_u16(0, 1);
    let zero = chunk.add_constant(Value::Int(0));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(zero, 1);
    chunk.write_u8(op::GET_INDEX, 1);
    chunk.write_u8(op::GET_LOCAL, 1);
    chunk.write_u8(1, 1);
    chunk.write_u8(op::ADD, 1);
    chunk.write_u8(op::RETURN, 1);

    let root = push_function(&mut vm, Function::new(None, 0, chunk));
    let def = push_process_def(&mut vm, "main", root);

    assert_eq!(run_to_completion(&mut vm, def), Value::Int(3));
}

#[test]
fn exception_unwinds_through_multiple_frames_to_a_try_catch() {
    // def a() { throw "oops"; }
    // def b() { a(); }
    // try { b(); } catch (e) { return e; }
    let mut vm = Vm::new();
    let oops = vm.pool.intern("oops");

    let mut a_chunk = Chunk::new();
    let oops_const = a_chunk.add_constant(Value::String(oops));
    a_chunk.write_u8(op::CONSTANT, 1);
    a_chunk.write_u16(oops_const, 1);
    a_chunk.write_u8(op::THROW, 1);
    let a_id = push_function(&mut vm, Function::new(None, 0, a_chunk));

    let mut b_chunk = Chunk::new();
    let a_const = b_chunk.add_constant(Value::Function(a_id));
    b_chunk.write_u8(op::CONSTANT, 1);
    b_chunk.write_u16(a_const, 1);
    b_chunk.write_u8(op::CALL, 1);
    b_chunk.write_u8(0, 1);
    b_chunk.write_u8(op::NIL, 1);
    b_chunk.write_u8(op::RETURN, 1);
    let b_id = push_function(&mut vm, Function::new(None, 0, b_chunk));

    let mut chunk = Chunk::new();
    chunk.write_u8(op::TRY, 1);
    let try_operands_at = chunk.code.len();
    chunk.write_u16(0, 1);
    chunk.write_u16(u16::MAX, 1); // no finally
    let after_try_header = chunk.code.len();

    let b_const = chunk.add_constant(Value::Function(b_id));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(b_const, 1);
    chunk.write_u8(op::CALL, 1);
    chunk.write_u8(0, 1);
    chunk.write_u8(op::POP, 1);
    chunk.write_u8(op::POP_TRY, 1);
    chunk.write_u8(op::NIL, 1);
    chunk.write_u8(op::RETURN, 1);

    let catch_start = chunk.code.len();
    chunk.write_u8(op::ENTER_CATCH, 1);
    chunk.write_u8(op::RETURN, 1);

    patch_u16(
        &mut chunk,
        try_operands_at,
        (catch_start - after_try_header) as u16,
    );

    let root = push_function(&mut vm, Function::new(None, 0, chunk));
    let def = push_process_def(&mut vm, "main", root);

    match run_to_completion(&mut vm, def) {
        Value::String(id) => assert_eq!(vm.pool.as_str(id), "oops"),
        other => panic!("expected the caught string, got {other:?}"),
    }
}

#[test]
fn frame_yields_five_times_without_growing_alive_processes() {
    // loop { frame; x = x + 1; }
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();

    let zero = chunk.add_constant(Value::Int(0));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(zero, 1);
    chunk.write_u8(op::SET_PRIVATE, 1);
    chunk.write_u8(private::X, 1);
    chunk.write_u8(op::POP, 1);

    let loop_start = chunk.code.len();
    let hint = chunk.add_constant(Value::Int(0));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(hint, 1);
    chunk.write_u8(op::FRAME, 1);
    chunk.write_u8(op::GET_PRIVATE, 1);
    chunk.write_u8(private::X, 1);
    let one = chunk.add_constant(Value::Int(1));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(one, 1);
    chunk.write_u8(op::ADD, 1);
    chunk.write_u8(op::SET_PRIVATE, 1);
    chunk.write_u8(private::X, 1);
    chunk.write_u8(op::POP, 1);
    chunk.write_u8(op::LOOP, 1);
    let loop_offset_at = chunk.code.len();
    chunk.write_u16(0, 1);
    let after_loop = chunk.code.len();
    patch_u16(&mut chunk, loop_offset_at, (after_loop - loop_start) as u16);

    let root = push_function(&mut vm, Function::new(None, 0, chunk));
    let def = push_process_def(&mut vm, "ticker", root);

    let pid = vm.spawn_process(def, ProcessId(0), &[]).unwrap();
    let idx = vm.find_process_index(pid).unwrap();

    for tick in 1..=5 {
        match vm.run_process(idx).unwrap() {
            ProcessOutcome::Frame(_) => {}
            other => panic!("tick {tick}: expected a frame yield, got {other:?}"),
        }
    }

    assert_eq!(vm.processes.len(), 1);
    assert_eq!(
        vm.processes[idx].get_private(private::X),
        Value::Int(5)
    );
}

#[test]
fn signal_by_blueprint_only_kills_matching_processes() {
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    chunk.write_u8(op::HALT, 1);
    let root = push_function(&mut vm, Function::new(None, 0, chunk));

    let enemy_def = push_process_def(&mut vm, "enemy", root);
    let player_def = push_process_def(&mut vm, "player", root);

    let e1 = vm.spawn_process(enemy_def, ProcessId(0), &[]).unwrap();
    let e2 = vm.spawn_process(enemy_def, ProcessId(0), &[]).unwrap();
    let player = vm.spawn_process(player_def, ProcessId(0), &[]).unwrap();

    vm.signal(SignalTarget::Blueprint(enemy_def), Signal::Kill);

    assert!(!vm.exists(e1));
    assert!(!vm.exists(e2));
    assert!(vm.exists(player));
    assert_eq!(
        vm.find_process(player).unwrap().state,
        ProcessState::Running
    );
}

#[test]
fn gc_reclaims_a_self_referential_array_with_no_remaining_root() {
    let mut vm = Vm::new();
    let id = vm.heap.alloc_array(vec![Value::Nil]);
    vm.heap.arrays.get_mut(id.0).unwrap().elements[0] = Value::Array(id);

    assert_eq!(vm.heap.arrays.live_count(), 1);
    vm.collect_garbage();

    assert_eq!(vm.heap.arrays.live_count(), 0);
    assert!(vm.heap.arrays.get(id.0).is_none());
}

#[test]
fn division_by_zero_is_a_catchable_runtime_error() {
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    let one = chunk.add_constant(Value::Int(1));
    let zero = chunk.add_constant(Value::Int(0));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(one, 1);
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(zero, 1);
    chunk.write_u8(op::DIVIDE, 1);
    chunk.write_u8(op::RETURN, 1);

    let root = push_function(&mut vm, Function::new(None, 0, chunk));
    let def = push_process_def(&mut vm, "main", root);
    let pid = vm.spawn_process(def, ProcessId(0), &[]).unwrap();
    let idx = vm.find_process_index(pid).unwrap();

    match vm.run_process(idx).unwrap() {
        ProcessOutcome::Done(_) => {}
        other => panic!("expected the uncaught division to end the process, got {other:?}"),
    }
    assert!(!vm.exists(pid));
}

#[test]
fn reserved_opcode_41_is_a_catchable_runtime_error_not_a_fault() {
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    chunk.write_u8(op::RESERVED_41, 1);

    let root = push_function(&mut vm, Function::new(None, 0, chunk));
    let def = push_process_def(&mut vm, "main", root);
    let pid = vm.spawn_process(def, ProcessId(0), &[]).unwrap();
    let idx = vm.find_process_index(pid).unwrap();

    // No handler is installed, so the process still dies - but via the
    // catchable-error path (ERROR), never FatalError.
    assert!(matches!(
        vm.run_process(idx),
        Ok(ProcessOutcome::Done(_))
    ));
}
