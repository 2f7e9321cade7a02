// SPDX-License-Identifier: MIT

//! String interning pool.
//!
//! All script-visible strings are deduplicated here: identical byte content
//! always resolves to the same [`StringId`]. Short strings are stored inline
//! in the pooled record (no extra heap allocation); longer strings own a
//! boxed byte buffer. The pool never frees individual strings before the
//! interpreter that owns it is dropped.

#[cfg(test)]
mod mod_test;

use std::collections::HashMap;
use std::fmt;

/// Strings up to this length are stored inline in the pooled record.
const INLINE_CAP: usize = 23;

/// Handle to an interned string. Stable for the pool's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StringId(pub u32);

impl StringId {
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone)]
enum Bytes {
    Inline { buf: [u8; INLINE_CAP], len: u8 },
    Heap(Box<[u8]>),
}

impl Bytes {
    fn new(bytes: &[u8]) -> Self {
        if bytes.len() <= INLINE_CAP {
            let mut buf = [0u8; INLINE_CAP];
            buf[..bytes.len()].copy_from_slice(bytes);
            Bytes::Inline {
                buf,
                len: bytes.len() as u8,
            }
        } else {
            Bytes::Heap(bytes.into())
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Bytes::Inline { buf, len } => &buf[..*len as usize],
            Bytes::Heap(b) => b,
        }
    }
}

/// A single entry in the pool: content, its FNV-1a hash, and insertion index.
struct PooledString {
    bytes: Bytes,
    hash: u64,
    index: u32,
}

/// FNV-1a hash, matching the reference implementation's string hashing.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash
}

/// Deduplicating interner for script strings.
///
/// `create` returns the same [`StringId`] for byte-identical input every
/// time; every derived operation (concat, case conversion, slicing, ...)
/// produces a fresh pooled string via `create`.
#[derive(Default)]
pub struct StringPool {
    strings: Vec<PooledString>,
    index: HashMap<Vec<u8>, StringId>,
}

impl StringPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            strings: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Intern `bytes`, returning the existing handle if this content was
    /// already pooled, or allocating a new entry otherwise.
    pub fn create(&mut self, bytes: &[u8]) -> StringId {
        if let Some(&id) = self.index.get(bytes) {
            return id;
        }
        let idx = self.strings.len() as u32;
        let id = StringId(idx);
        self.strings.push(PooledString {
            bytes: Bytes::new(bytes),
            hash: fnv1a(bytes),
            index: idx,
        });
        self.index.insert(bytes.to_vec(), id);
        id
    }

    /// Intern a `&str`.
    pub fn intern(&mut self, s: &str) -> StringId {
        self.create(s.as_bytes())
    }

    /// Look up a previously interned string without allocating a new
    /// entry. Used by the host embedding API's by-name lookups (spec §6).
    #[must_use]
    pub fn find(&self, s: &str) -> Option<StringId> {
        self.index.get(s.as_bytes()).copied()
    }

    #[must_use]
    pub fn bytes(&self, id: StringId) -> &[u8] {
        self.strings[id.0 as usize].bytes.as_slice()
    }

    #[must_use]
    pub fn as_str(&self, id: StringId) -> &str {
        std::str::from_utf8(self.bytes(id)).unwrap_or("")
    }

    #[must_use]
    pub fn hash_of(&self, id: StringId) -> u64 {
        self.strings[id.0 as usize].hash
    }

    #[must_use]
    pub fn len(&self, id: StringId) -> usize {
        self.bytes(id).len()
    }

    #[must_use]
    pub fn insertion_index(&self, id: StringId) -> u32 {
        self.strings[id.0 as usize].index
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.strings.len()
    }

    // ---- derived string algebra -------------------------------------------------

    pub fn concat(&mut self, a: StringId, b: StringId) -> StringId {
        let mut buf = self.bytes(a).to_vec();
        buf.extend_from_slice(self.bytes(b));
        self.create(&buf)
    }

    pub fn upper(&mut self, s: StringId) -> StringId {
        let upper = self.as_str(s).to_uppercase();
        self.create(upper.as_bytes())
    }

    pub fn lower(&mut self, s: StringId) -> StringId {
        let lower = self.as_str(s).to_lowercase();
        self.create(lower.as_bytes())
    }

    /// Byte-range substring `[start, end)`. Clamps to the string's length.
    pub fn substring(&mut self, s: StringId, start: usize, end: usize) -> StringId {
        let bytes = self.bytes(s);
        let start = start.min(bytes.len());
        let end = end.clamp(start, bytes.len());
        let slice = bytes[start..end].to_vec();
        self.create(&slice)
    }

    pub fn replace(&mut self, s: StringId, old: StringId, new: StringId) -> StringId {
        let haystack = self.as_str(s).to_string();
        let old_str = self.as_str(old).to_string();
        let new_str = self.as_str(new).to_string();
        if old_str.is_empty() {
            return s;
        }
        let replaced = haystack.replace(&old_str, &new_str);
        self.create(replaced.as_bytes())
    }

    pub fn trim(&mut self, s: StringId) -> StringId {
        let trimmed = self.as_str(s).trim().to_string();
        self.create(trimmed.as_bytes())
    }

    #[must_use]
    pub fn contains(&self, s: StringId, needle: StringId) -> bool {
        self.as_str(s).contains(self.as_str(needle))
    }

    #[must_use]
    pub fn starts_with(&self, s: StringId, prefix: StringId) -> bool {
        self.bytes(s).starts_with(self.bytes(prefix))
    }

    #[must_use]
    pub fn ends_with(&self, s: StringId, suffix: StringId) -> bool {
        self.bytes(s).ends_with(self.bytes(suffix))
    }

    /// Single-character string at a byte index, or `None` if out of range.
    pub fn at(&mut self, s: StringId, index: i64) -> Option<StringId> {
        let bytes = self.bytes(s).to_vec();
        let idx = if index < 0 {
            bytes.len() as i64 + index
        } else {
            index
        };
        if idx < 0 || idx as usize >= bytes.len() {
            return None;
        }
        Some(self.create(&bytes[idx as usize..=idx as usize]))
    }

    /// Find `needle` in `s` starting at byte offset `start`; `-1` if absent.
    #[must_use]
    pub fn index_of(&self, s: StringId, needle: StringId, start: usize) -> i64 {
        let haystack = self.bytes(s);
        let needle_bytes = self.bytes(needle);
        if start > haystack.len() {
            return -1;
        }
        match haystack[start..]
            .windows(needle_bytes.len().max(1))
            .position(|w| w == needle_bytes)
        {
            Some(p) if !needle_bytes.is_empty() => (p + start) as i64,
            _ => {
                if needle_bytes.is_empty() {
                    start as i64
                } else {
                    -1
                }
            }
        }
    }

    pub fn repeat(&mut self, s: StringId, count: usize) -> StringId {
        let repeated = self.as_str(s).repeat(count);
        self.create(repeated.as_bytes())
    }

    /// Split on `sep`, returning a vector of pooled pieces.
    pub fn split(&mut self, s: StringId, sep: StringId) -> Vec<StringId> {
        let haystack = self.as_str(s).to_string();
        let sep_str = self.as_str(sep).to_string();
        if sep_str.is_empty() {
            return vec![s];
        }
        haystack
            .split(sep_str.as_str())
            .map(|piece| self.create(piece.as_bytes()))
            .collect()
    }
}
