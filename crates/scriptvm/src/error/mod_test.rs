// SPDX-License-Identifier: MIT

use super::*;

#[test]
fn runtime_error_messages_are_concise() {
    let err = RuntimeError::DivisionByZero;
    assert_eq!(err.to_string(), "division by zero");
}

#[test]
fn index_out_of_range_reports_its_fields() {
    let err = RuntimeError::IndexOutOfRange {
        kind: "array",
        index: -9,
        len: 3,
    };
    assert_eq!(
        err.to_string(),
        "index -9 out of range for array of length 3"
    );
}

#[test]
fn vm_error_wraps_both_kinds() {
    let runtime: VmError = RuntimeError::DivisionByZero.into();
    let fatal: VmError = FatalError::GosubStack.into();
    assert!(matches!(runtime, VmError::Runtime(_)));
    assert!(matches!(fatal, VmError::Fatal(_)));
}
