// SPDX-License-Identifier: MIT

use super::*;
use crate::bytecode::{op, Chunk};
use crate::function::{Function, ProcessDef};
use crate::value::FunctionId;

/// A VM with one registered blueprint whose root frame immediately halts.
fn halting_vm() -> (Vm, ProcessDefId) {
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    chunk.write_u8(op::HALT, 1);

    let name = vm.pool.intern("main");
    vm.functions.push(Function::new(Some(name), 0, chunk));
    let func_id = FunctionId((vm.functions.len() - 1) as u32);

    let def_name = vm.pool.intern("root");
    vm.process_defs.push(ProcessDef::new(def_name, func_id));
    let def_id = ProcessDefId((vm.process_defs.len() - 1) as u32);

    (vm, def_id)
}

/// A blueprint whose root frame loops on `FRAME` forever (never halts on
/// its own), for tests that need a process to stay alive across ticks.
fn framing_vm() -> (Vm, ProcessDefId) {
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    let const_idx = chunk.add_constant(Value::Int(0));
    chunk.write_u8(op::CONSTANT, 1);
    chunk.write_u16(const_idx, 1);
    chunk.write_u8(op::FRAME, 1);
    chunk.write_u8(op::LOOP, 1);
    chunk.write_u16(7, 1);

    let name = vm.pool.intern("loop");
    vm.functions.push(Function::new(Some(name), 0, chunk));
    let func_id = FunctionId((vm.functions.len() - 1) as u32);

    let def_name = vm.pool.intern("ticker");
    vm.process_defs.push(ProcessDef::new(def_name, func_id));
    let def_id = ProcessDefId((vm.process_defs.len() - 1) as u32);

    (vm, def_id)
}

#[test]
fn tick_reaps_a_process_that_halts() {
    let (mut vm, def_id) = halting_vm();
    let pid = vm.spawn_process(def_id, ProcessId(0), &[]).unwrap();

    let events = vm.tick();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].process, pid);
    assert!(matches!(events[0].outcome, TickOutcome::Done(_)));
    assert!(!vm.exists(pid));
    assert_eq!(vm.processes.len(), 0);
}

#[test]
fn tick_keeps_a_framing_process_alive_across_ticks() {
    let (mut vm, def_id) = framing_vm();
    let pid = vm.spawn_process(def_id, ProcessId(0), &[]).unwrap();

    for _ in 0..3 {
        let events = vm.tick();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].outcome, TickOutcome::Frame(_)));
    }
    assert!(vm.exists(pid));
}

#[test]
fn frozen_processes_are_skipped_by_tick() {
    let (mut vm, def_id) = framing_vm();
    let pid = vm.spawn_process(def_id, ProcessId(0), &[]).unwrap();
    vm.signal(SignalTarget::Process(pid), Signal::Freeze);

    let events = vm.tick();
    assert!(events.is_empty());
    assert!(vm.exists(pid));
}

#[test]
fn hide_and_freeze_both_land_on_the_frozen_state() {
    let (mut vm, def_id) = framing_vm();
    let pid = vm.spawn_process(def_id, ProcessId(0), &[]).unwrap();

    vm.signal(SignalTarget::Process(pid), Signal::Hide);
    assert_eq!(vm.find_process(pid).unwrap().state, ProcessState::Frozen);

    vm.signal(SignalTarget::Process(pid), Signal::Show);
    assert_eq!(vm.find_process(pid).unwrap().state, ProcessState::Running);
}

#[test]
fn kill_signal_reaps_immediately() {
    let (mut vm, def_id) = framing_vm();
    let pid = vm.spawn_process(def_id, ProcessId(0), &[]).unwrap();

    vm.signal(SignalTarget::Process(pid), Signal::Kill);
    assert!(!vm.exists(pid));
    assert_eq!(vm.processes.len(), 0);
}

#[test]
fn signal_all_targets_every_live_process() {
    let (mut vm, def_id) = framing_vm();
    let a = vm.spawn_process(def_id, ProcessId(0), &[]).unwrap();
    let b = vm.spawn_process(def_id, ProcessId(0), &[]).unwrap();

    vm.signal(SignalTarget::All, Signal::Freeze);
    assert_eq!(vm.find_process(a).unwrap().state, ProcessState::Frozen);
    assert_eq!(vm.find_process(b).unwrap().state, ProcessState::Frozen);
}

#[test]
fn get_ids_filters_by_blueprint() {
    let (mut vm, def_id) = framing_vm();

    let mut other_chunk = Chunk::new();
    other_chunk.write_u8(op::FRAME, 1);
    other_chunk.write_u8(op::LOOP, 1);
    other_chunk.write_u16(4, 1);
    let other_name = vm.pool.intern("other_loop");
    vm.functions.push(Function::new(Some(other_name), 0, other_chunk));
    let other_func_id = FunctionId((vm.functions.len() - 1) as u32);
    let other_def_name = vm.pool.intern("other_ticker");
    vm.process_defs
        .push(ProcessDef::new(other_def_name, other_func_id));
    let other_def_id = ProcessDefId((vm.process_defs.len() - 1) as u32);

    let a = vm.spawn_process(def_id, ProcessId(0), &[]).unwrap();
    let b = vm.spawn_process(other_def_id, ProcessId(0), &[]).unwrap();

    assert_eq!(vm.get_ids(Some(def_id)), vec![a]);
    assert_eq!(vm.get_ids(Some(other_def_id)), vec![b]);
    assert_eq!(vm.count_processes(None), 2);
}
