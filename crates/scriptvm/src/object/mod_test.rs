// SPDX-License-Identifier: MIT

use super::*;

#[test]
fn array_resolve_read_index_negative_counts_from_end() {
    let arr = Array {
        elements: vec![Value::Int(1), Value::Int(2), Value::Int(3)],
    };
    assert_eq!(arr.resolve_read_index(-1), Some(2));
    assert_eq!(arr.resolve_read_index(0), Some(0));
    assert_eq!(arr.resolve_read_index(3), None);
    assert_eq!(arr.resolve_read_index(-4), None);
}

#[test]
fn map_set_nil_removes_key() {
    let mut map = Map::new();
    let key = StringId(0);
    map.set(key, Value::Int(5));
    assert!(map.entries.contains_key(&key));
    map.set(key, Value::Nil);
    assert!(!map.entries.contains_key(&key));
}

#[test]
fn buffer_seek_clamps_to_byte_len() {
    let mut buf = Buffer::new(ElementType::I32, 4);
    assert_eq!(buf.byte_len(), 16);
    buf.seek(1000);
    assert_eq!(buf.cursor, 16);
}

#[test]
fn element_type_sizes() {
    assert_eq!(ElementType::U8.size(), 1);
    assert_eq!(ElementType::I16.size(), 2);
    assert_eq!(ElementType::I32.size(), 4);
    assert_eq!(ElementType::F64.size(), 8);
}
