use super::{IdGen, Value};
use crate::Address;

/// All previously written values whose intervals overlap a read.
#[derive(Debug, Default)]
pub struct MemoryValues {
    pub entries: Vec<(u64, Value)>,
}

impl MemoryValues {
    /// Collapses the set for emulation: a single write that exactly covers
    /// the read wins, anything else degrades to a fresh unknown.
    pub fn into_value(
        self,
        ids: &IdGen,
        source: Address,
        address: u64,
        size: usize,
    ) -> Value {
        match self.entries.as_slice() {
            [(at, value)] if *at == address && value.size() == size => *value,
            _ => Value::fresh(ids, source, size),
        }
    }
}

/// Sparse memory keyed by concrete or hashed-symbolic address.
///
/// Like the register file this is persistent: children clone it cheaply and
/// writes never disturb the parent's view.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    cells: imbl::OrdMap<u64, Value>,
}

// Largest store the interpreter records; bounds the backward overlap scan.
const MAX_STORE_SIZE: u64 = 64;

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects every write overlapping `[address, address + size)`.
    pub fn get(&self, address: u64, size: usize) -> MemoryValues {
        let lo = address.saturating_sub(MAX_STORE_SIZE - 1);
        let hi = address.saturating_add(size as u64);
        let entries = self
            .cells
            .range(lo..hi)
            .filter(|(at, value)| at.wrapping_add(value.size() as u64) > address)
            .map(|(at, value)| (*at, *value))
            .collect();
        MemoryValues { entries }
    }

    pub fn set(&mut self, address: u64, value: Value) {
        self.cells.insert(address, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_read_returns_the_written_value() {
        let ids = IdGen::default();
        let mut memory = Memory::new();
        memory.set(0x100, Value::concrete(Some(1), 42));
        let values = memory.get(0x100, 8);
        assert_eq!(values.entries.len(), 1);
        let value = values.into_value(&ids, 2, 0x100, 8);
        assert!(!value.is_symbolic());
        assert_eq!(value.value(), 42);
    }

    #[test]
    fn overlapping_reads_collect_multiple_writes() {
        let mut memory = Memory::new();
        memory.set(0x100, Value::concrete(Some(1), 1));
        memory.set(0x104, Value::concrete_sized(Some(2), 2, 4));
        assert_eq!(memory.get(0x100, 8).entries.len(), 2);
        assert_eq!(memory.get(0x106, 2).entries.len(), 1);
        assert_eq!(memory.get(0x108, 8).entries.len(), 0);
    }

    #[test]
    fn partial_overlap_degrades_to_fresh_symbolic() {
        let ids = IdGen::default();
        let mut memory = Memory::new();
        memory.set(0x100, Value::concrete(Some(1), 42));
        let value = memory.get(0x104, 4).into_value(&ids, 9, 0x104, 4);
        assert!(value.is_symbolic());
        assert_eq!(value.source(), Some(9));
    }

    #[test]
    fn children_share_structure_with_parents() {
        let mut parent = Memory::new();
        parent.set(0x10, Value::concrete(Some(1), 1));
        let mut child = parent.clone();
        child.set(0x20, Value::concrete(Some(2), 2));
        assert_eq!(parent.get(0x20, 8).entries.len(), 0);
        assert_eq!(child.get(0x10, 8).entries.len(), 1);
    }
}
