// SPDX-License-Identifier: MIT

use super::*;
use crate::value::ProcessDefId;

fn fresh() -> Process {
    Process::new(ProcessId(1), ProcessDefId(0))
}

#[test]
fn id_and_father_are_read_only_from_script() {
    let mut p = fresh();
    p.set_private(private::ID, Value::Int(99));
    p.set_private(private::FATHER, Value::Int(1));
    assert_eq!(p.get_private(private::ID), Value::Nil);
    assert_eq!(p.get_private(private::FATHER), Value::Nil);
}

#[test]
fn ordinary_private_slots_round_trip() {
    let mut p = fresh();
    p.set_private(private::X, Value::Double(4.5));
    assert_eq!(p.get_private(private::X), Value::Double(4.5));
}

#[test]
fn writes_to_a_dead_process_are_silently_ignored() {
    let mut p = fresh();
    p.state = ProcessState::Dead;
    p.set_private(private::X, Value::Int(1));
    assert_eq!(p.get_private(private::X), Value::Nil);
}

#[test]
fn reads_on_out_of_range_slots_return_nil_rather_than_panicking() {
    let p = fresh();
    assert_eq!(p.get_private(200), Value::Nil);
}

#[test]
fn stack_push_respects_capacity() {
    let mut p = fresh();
    for _ in 0..STACK_MAX {
        p.push(Value::Nil).unwrap();
    }
    assert!(p.push(Value::Nil).is_err());
}

#[test]
fn peek_reads_below_the_top_without_popping() {
    let mut p = fresh();
    p.push(Value::Int(1)).unwrap();
    p.push(Value::Int(2)).unwrap();
    assert_eq!(p.peek(0), Value::Int(2));
    assert_eq!(p.peek(1), Value::Int(1));
    assert_eq!(p.stack_top(), 2);
}

#[test]
fn is_schedulable_only_when_running() {
    let mut p = fresh();
    assert!(p.is_schedulable());
    p.state = ProcessState::Frozen;
    assert!(!p.is_schedulable());
    assert!(p.is_alive());
    p.state = ProcessState::Dead;
    assert!(!p.is_alive());
}
