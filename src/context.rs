use std::collections::BTreeMap;

use iced_x86::Register;

use crate::virt::{hash_combine, registers, IdGen, Memory, MemoryValues, Registers, Value};
use crate::Address;

/// Whether a child context crosses a call boundary. A `Caller` child records
/// its parent as the caller; any other child inherits the parent's caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRole {
    Default,
    Caller,
}

/// One abstract program state reaching an instruction: the tracked register
/// file plus sparse memory.
///
/// `hash` is maintained incrementally: every `set_register` folds the old
/// value, the new value and (on first assignment) the register itself, so
/// contexts with identical observable state collide on purpose and get
/// deduplicated by the store.
#[derive(Debug, Clone)]
pub struct Context {
    hash: u64,
    id: u64,
    caller_id: u64,
    registers: Registers,
    memory: Memory,
}

impl Context {
    /// Entry state: every tracked register is a fresh unknown sourced at the
    /// function entry.
    pub fn new(ids: &IdGen, source: Address) -> Self {
        let mut context = Self {
            hash: 0,
            id: ids.next_id(),
            caller_id: 0,
            registers: Registers::new(),
            memory: Memory::new(),
        };
        for reg in registers::tracked() {
            context.set_register(reg, Value::fresh(ids, source, 8));
        }
        context
    }

    pub fn make_child(&self, ids: &IdGen, role: ParentRole) -> Self {
        Self {
            hash: self.hash,
            id: ids.next_id(),
            caller_id: match role {
                ParentRole::Caller => self.id,
                ParentRole::Default => self.caller_id,
            },
            registers: self.registers.clone(),
            memory: self.memory.clone(),
        }
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn caller_id(&self) -> u64 {
        self.caller_id
    }

    pub fn get_register(&self, reg: Register) -> Option<Value> {
        self.registers.get(reg)
    }

    pub fn set_register(&mut self, reg: Register, value: Value) {
        if !registers::is_tracked(reg) {
            return;
        }
        if let Some(old) = self.get_register(reg) {
            hash_combine(&mut self.hash, old.source().unwrap_or(0) as u64);
            hash_combine(&mut self.hash, old.hash_payload());
            // The register itself is hashed only on its first assignment.
        } else {
            hash_combine(&mut self.hash, reg as u64);
        }
        hash_combine(&mut self.hash, value.hash_payload());
        hash_combine(&mut self.hash, value.source().unwrap_or(0) as u64);
        self.registers.set(reg, value);
    }

    pub fn get_memory(&self, address: u64, size: usize) -> MemoryValues {
        self.memory.get(address, size)
    }

    pub fn set_memory(&mut self, address: u64, value: Value) {
        self.memory.set(address, value);
    }
}

/// Working set of contexts flowing into an instruction, deduplicated and
/// ordered by hash.
#[derive(Debug, Default)]
pub struct Contexts {
    by_hash: BTreeMap<u64, Context>,
}

impl Contexts {
    /// No-op when a context with the same hash is already present.
    pub fn insert(&mut self, context: Context) {
        self.by_hash.entry(context.hash()).or_insert(context);
    }

    pub fn pop(&mut self) -> Option<Context> {
        self.by_hash.pop_first().map(|(_, context)| context)
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Context> {
        self.by_hash.values()
    }
}

/// Per-function store: every context observed at every instruction address,
/// hash-ordered with duplicates discarded.
#[derive(Debug, Default)]
pub struct FloContexts {
    map: BTreeMap<Address, BTreeMap<u64, Context>>,
}

impl FloContexts {
    /// Inserts and returns the stored context; a duplicate hash at the same
    /// address returns the previously stored one.
    pub fn emplace(&mut self, address: Address, context: Context) -> &Context {
        self.map
            .entry(address)
            .or_default()
            .entry(context.hash())
            .or_insert(context)
    }

    pub fn at(&self, address: Address) -> impl Iterator<Item = &Context> {
        self.map.get(&address).into_iter().flat_map(|bag| bag.values())
    }

    pub fn count(&self, address: Address) -> usize {
        self.map.get(&address).map_or(0, |bag| bag.len())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_writes_collide_on_hash() {
        let ids = IdGen::default();
        let base = Context::new(&ids, 0);
        let value = Value::concrete(Some(4), 7);

        let mut a = base.make_child(&ids, ParentRole::Default);
        a.set_register(Register::RAX, value);
        let mut b = base.make_child(&ids, ParentRole::Default);
        b.set_register(Register::RAX, value);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.id(), b.id());

        let mut c = base.make_child(&ids, ParentRole::Default);
        c.set_register(Register::RAX, Value::concrete(Some(4), 8));
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn children_read_through_and_write_locally() {
        let ids = IdGen::default();
        let mut parent = Context::new(&ids, 0);
        parent.set_register(Register::RBX, Value::concrete(Some(1), 11));
        parent.set_memory(0x40, Value::concrete(Some(1), 22));

        let mut child = parent.make_child(&ids, ParentRole::Default);
        assert_eq!(child.get_register(Register::RBX).map(|v| v.value()), Some(11));
        assert_eq!(child.get_memory(0x40, 8).entries.len(), 1);

        child.set_register(Register::RBX, Value::concrete(Some(2), 33));
        assert_eq!(parent.get_register(Register::RBX).map(|v| v.value()), Some(11));
    }

    #[test]
    fn caller_role_stamps_parent_id() {
        let ids = IdGen::default();
        let parent = Context::new(&ids, 0);
        let child = parent.make_child(&ids, ParentRole::Caller);
        assert_eq!(child.caller_id(), parent.id());
        let grandchild = child.make_child(&ids, ParentRole::Default);
        assert_eq!(grandchild.caller_id(), parent.id());
    }

    #[test]
    fn flo_contexts_deduplicate_per_address() {
        let ids = IdGen::default();
        let mut store = FloContexts::default();
        let base = Context::new(&ids, 0);
        let dup = base.clone();
        store.emplace(0x10, base);
        store.emplace(0x10, dup);
        assert_eq!(store.count(0x10), 1);

        let mut contexts = Contexts::default();
        let again = store.at(0x10).next().cloned().unwrap();
        let sibling = again.clone();
        contexts.insert(again);
        contexts.insert(sibling);
        assert_eq!(contexts.len(), 1);
    }
}
