use std::sync::atomic::{AtomicU64, Ordering};

use crate::Address;

/// Per-analysis source of fresh symbol and context ids, so independent runs
/// stay reproducible and reentrant.
#[derive(Debug, Default)]
pub struct IdGen(AtomicU64);

impl IdGen {
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// An opaque unknown quantity plus a signed displacement from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol {
    id: u64,
    offset: i64,
}

impl Symbol {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Repr {
    Concrete(u64),
    Symbolic(Symbol),
}

/// A machine word: either a concrete 64-bit integer or a symbolic unknown,
/// tagged with the instruction that produced it and its size in bytes.
///
/// Two symbolic values with the same id denote the same unknown in every
/// context; concrete and symbolic values never compare equal.
#[derive(Debug, Clone, Copy)]
pub struct Value {
    source: Option<Address>,
    size: usize,
    repr: Repr,
}

impl Value {
    pub fn concrete(source: impl Into<Option<Address>>, value: u64) -> Self {
        Self::concrete_sized(source, value, 8)
    }

    pub fn concrete_sized(source: impl Into<Option<Address>>, value: u64, size: usize) -> Self {
        Self {
            source: source.into(),
            size,
            repr: Repr::Concrete(value),
        }
    }

    /// A brand-new unknown.
    pub fn fresh(ids: &IdGen, source: impl Into<Option<Address>>, size: usize) -> Self {
        Self::symbolic(source, size, 0, ids.next_id())
    }

    pub fn symbolic(source: impl Into<Option<Address>>, size: usize, offset: i64, id: u64) -> Self {
        Self {
            source: source.into(),
            size,
            repr: Repr::Symbolic(Symbol { id, offset }),
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self.repr, Repr::Symbolic(_))
    }

    /// Concrete payload; only meaningful when `!is_symbolic()`.
    pub fn value(&self) -> u64 {
        match self.repr {
            Repr::Concrete(v) => v,
            Repr::Symbolic(s) => {
                debug_assert!(false, "value() on symbolic");
                s.id
            }
        }
    }

    /// Symbol payload; only meaningful when `is_symbolic()`.
    pub fn symbol(&self) -> Symbol {
        match self.repr {
            Repr::Symbolic(s) => s,
            Repr::Concrete(v) => {
                debug_assert!(false, "symbol() on concrete");
                Symbol { id: v, offset: 0 }
            }
        }
    }

    /// The word folded to a memory key: a concrete address stays itself, a
    /// symbolic address hashes to its id plus displacement.
    pub fn raw_address_value(&self) -> u64 {
        match self.repr {
            Repr::Concrete(v) => v,
            Repr::Symbolic(s) => s.id.wrapping_add(s.offset as u64),
        }
    }

    /// Hash payload used for context deduplication.
    pub(crate) fn hash_payload(&self) -> u64 {
        match self.repr {
            Repr::Concrete(v) => v,
            Repr::Symbolic(s) => s.id,
        }
    }

    pub fn source(&self) -> Option<Address> {
        self.source
    }

    pub fn set_source(&mut self, source: Address) {
        self.source = Some(source);
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }
}
