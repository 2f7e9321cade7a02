// SPDX-License-Identifier: MIT

use super::*;

#[test]
fn create_dedupes_identical_content() {
    let mut pool = StringPool::new();
    let a = pool.create(b"hello");
    let b = pool.create(b"hello");
    assert_eq!(a, b);
    assert_eq!(pool.count(), 1);
}

#[test]
fn create_distinguishes_different_content() {
    let mut pool = StringPool::new();
    let a = pool.create(b"hello");
    let b = pool.create(b"world");
    assert_ne!(a, b);
}

#[test]
fn long_strings_round_trip() {
    let mut pool = StringPool::new();
    let long = "x".repeat(200);
    let id = pool.create(long.as_bytes());
    assert_eq!(pool.as_str(id), long);
}

#[test]
fn inline_and_heap_boundary_round_trip() {
    let mut pool = StringPool::new();
    for len in [0, 1, INLINE_CAP, INLINE_CAP + 1, INLINE_CAP * 4] {
        let s = "a".repeat(len);
        let id = pool.create(s.as_bytes());
        assert_eq!(pool.as_str(id), s);
    }
}

#[test]
fn concat_produces_pooled_result() {
    let mut pool = StringPool::new();
    let a = pool.create(b"score=");
    let b = pool.create(b"100");
    let c = pool.concat(a, b);
    assert_eq!(pool.as_str(c), "score=100");
}

#[test]
fn upper_lower_round_trip() {
    let mut pool = StringPool::new();
    let s = pool.create(b"MixedCase");
    let upper = pool.upper(s);
    let lower = pool.lower(s);
    assert_eq!(pool.as_str(upper), "MIXEDCASE");
    assert_eq!(pool.as_str(lower), "mixedcase");
}

#[test]
fn substring_clamps_to_bounds() {
    let mut pool = StringPool::new();
    let s = pool.create(b"hello world");
    let sub = pool.substring(s, 6, 100);
    assert_eq!(pool.as_str(sub), "world");
}

#[test]
fn index_of_missing_returns_negative_one() {
    let mut pool = StringPool::new();
    let s = pool.create(b"hello");
    let needle = pool.create(b"xyz");
    assert_eq!(pool.index_of(s, needle, 0), -1);
}

#[test]
fn at_negative_index_counts_from_end() {
    let mut pool = StringPool::new();
    let s = pool.create(b"hello");
    let last = pool.at(s, -1).expect("in range");
    assert_eq!(pool.as_str(last), "o");
}

#[test]
fn split_on_separator() {
    let mut pool = StringPool::new();
    let s = pool.create(b"a,b,c");
    let sep = pool.create(b",");
    let parts = pool.split(s, sep);
    let strs: Vec<&str> = parts.iter().map(|&id| pool.as_str(id)).collect();
    assert_eq!(strs, vec!["a", "b", "c"]);
}

#[test]
fn fnv1a_matches_known_vector() {
    // FNV-1a of the empty string is the offset basis.
    assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
}
