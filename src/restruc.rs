use std::collections::{BTreeMap, HashMap, HashSet};

use iced_x86::{Instruction, Mnemonic, OpKind, Register};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::binary::Image;
use crate::flo::Flo;
use crate::recontex::{self, Recontex};
use crate::reflo::Reflo;
use crate::struc::{Signedness, Struc, StrucId, StrucStore};
use crate::virt::{self, registers, Value};
use crate::Address;

// Root identity of a cluster: the base value's symbol id and displacement.
type RootKey = (u64, i64);

/// One recovered struct inside a function: the root value anchoring it, the
/// instructions that dereference it and the registers that carried the base.
#[derive(Debug)]
pub struct StrucDomain {
    pub struc: StrucId,
    pub root: Value,
    pub relevant_instructions: BTreeMap<Address, Instruction>,
    pub base_regs: BTreeMap<Address, Vec<Register>>,
}

#[derive(Debug, Default)]
pub struct FloDomain {
    pub strucs: HashMap<RootKey, StrucDomain>,
}

impl FloDomain {
    pub fn is_empty(&self) -> bool {
        self.strucs.is_empty()
    }
}

/// Struct recoverer: clusters non-stack memory accesses by their root
/// symbolic pointer, synthesizes a struct per cluster and links structs
/// through pointer fields within and across functions.
pub struct Restruc<'a> {
    image: &'a Image,
    domains: Mutex<BTreeMap<Address, FloDomain>>,
    strucs: Mutex<StrucStore>,
}

impl<'a> Restruc<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            domains: Mutex::new(BTreeMap::new()),
            strucs: Mutex::new(StrucStore::default()),
        }
    }

    pub fn analyze(&self, pool: &rayon::ThreadPool, reflo: &Reflo, recontex: &Recontex) {
        pool.install(|| {
            reflo
                .flos()
                .par_iter()
                .for_each(|(_, flo)| self.analyze_flo(recontex, flo));
        });
        pool.install(|| {
            reflo
                .flos()
                .par_iter()
                .for_each(|(_, flo)| self.inter_link_flo_strucs(reflo, recontex, flo));
        });
    }

    pub fn strucs_count(&self) -> usize {
        self.strucs.lock().live().count()
    }

    /// Renders every recovered struct definition, ordered by name.
    pub fn dump(&self, out: &mut String) {
        self.strucs.lock().dump(out);
    }

    fn analyze_flo(&self, recontex: &Recontex, flo: &Flo) {
        let Some(flo_contexts) = recontex.flo_contexts(flo) else {
            return;
        };
        let mut groups: HashMap<RootKey, StrucDomain> = HashMap::new();
        for (&address, instruction) in flo.disassembly() {
            if !has_nonstack_memory_access(instruction) {
                continue;
            }
            let base = instruction.memory_base();
            if base == Register::None || base == Register::RIP {
                continue;
            }
            for context in flo_contexts.at(address) {
                let address_value = Recontex::memory_address(instruction, context);
                if !address_value.is_symbolic() {
                    continue;
                }
                let Some(root) = context.get_register(base) else {
                    continue;
                };
                if !root.is_symbolic() {
                    continue;
                }
                let key = (root.symbol().id(), root.symbol().offset());
                let group = groups.entry(key).or_insert_with(|| StrucDomain {
                    struc: 0,
                    root,
                    relevant_instructions: BTreeMap::new(),
                    base_regs: BTreeMap::new(),
                });
                group.relevant_instructions.insert(address, *instruction);
                let bag = group.base_regs.entry(address).or_default();
                if !bag.contains(&base) {
                    bag.push(base);
                }
            }
        }
        if groups.is_empty() {
            return;
        }
        let domain = self.create_flo_strucs(flo, groups);
        debug!(
            "{:#010x}: {} struct(s) recovered",
            self.va(flo.entry_point),
            domain.strucs.len()
        );
        self.domains.lock().insert(flo.entry_point, domain);
    }

    /// Synthesizes one struct per cluster, then links clusters whose root
    /// was itself loaded from another cluster's field.
    fn create_flo_strucs(
        &self,
        flo: &Flo,
        groups: HashMap<RootKey, StrucDomain>,
    ) -> FloDomain {
        let mut store = self.strucs.lock();
        let mut domain = FloDomain::default();
        for (key, mut group) in groups {
            let id = store.insert(Struc::new(self.generate_struc_name(flo, &group.root)));
            group.struc = id;
            for instruction in group.relevant_instructions.values() {
                Self::add_struc_field(&mut store, flo, id, instruction);
            }
            domain.strucs.insert(key, group);
        }
        self.intra_link_flo_strucs(&mut store, &domain);
        domain
    }

    /// A cluster whose root value was produced by a load belonging to
    /// another cluster is that cluster's pointee: the loading field becomes
    /// a typed pointer.
    fn intra_link_flo_strucs(&self, store: &mut StrucStore, domain: &FloDomain) {
        for (key, pointee) in &domain.strucs {
            let Some(source) = pointee.root.source() else {
                continue;
            };
            for (other_key, other) in &domain.strucs {
                if other_key == key {
                    continue;
                }
                let Some(instruction) = other.relevant_instructions.get(&source) else {
                    continue;
                };
                let displacement = instruction.memory_displacement64() as i64;
                if displacement < 0 {
                    continue;
                }
                store
                    .get_mut(other.struc)
                    .add_pointer_field(displacement as u64, 1, Some(pointee.struc));
            }
        }
    }

    fn add_struc_field(store: &mut StrucStore, flo: &Flo, struc: StrucId, instruction: &Instruction) {
        let memory_size = instruction.memory_size();
        let size = recontex::element_size(memory_size);
        if size == 0 {
            return;
        }
        let displacement = instruction.memory_displacement64() as i64;
        if displacement < 0 {
            return;
        }
        let offset = displacement as u64;
        let count = Self::field_count(flo, instruction);
        let struc = store.get_mut(struc);
        if recontex::is_float_access(memory_size) {
            if matches!(size, 2 | 4 | 8 | 10) {
                struc.add_float_field(offset, size, count);
            }
        } else if matches!(size, 1 | 2 | 4 | 8) {
            struc.add_int_field(offset, size, signedness_of(instruction.mnemonic()), count);
        }
    }

    /// Array heuristic: an indexed access bounded by `cmp index, N` followed
    /// by a less-than jump is an array of N elements.
    fn field_count(flo: &Flo, instruction: &Instruction) -> usize {
        let Some(index) = registers::canonical(instruction.memory_index()) else {
            return 1;
        };
        let disassembly: Vec<(&Address, &Instruction)> = flo.disassembly().iter().collect();
        for pair in disassembly.windows(2) {
            let (_, compare) = pair[0];
            let (_, jump) = pair[1];
            if compare.mnemonic() != Mnemonic::Cmp
                || compare.op_kind(0) != OpKind::Register
                || registers::canonical(compare.op_register(0)) != Some(index)
                || !recontex::is_immediate(compare.op_kind(1))
            {
                continue;
            }
            if !Flo::is_conditional_jump(jump) || !is_less_than_jump(jump.mnemonic()) {
                continue;
            }
            let (bound, _) = recontex::immediate_value(compare, 1);
            if bound as i64 > 0 {
                return bound as usize;
            }
        }
        1
    }

    /// Links a function's root structs to the structs its callers pass in,
    /// via argument registers or stack argument slots.
    fn inter_link_flo_strucs(&self, reflo: &Reflo, recontex: &Recontex, flo: &Flo) {
        let links: Vec<(StrucId, Value, Vec<Register>)> = {
            let domains = self.domains.lock();
            let Some(domain) = domains
                .get(&flo.entry_point)
                .filter(|domain| !domain.is_empty())
            else {
                return;
            };
            domain
                .strucs
                .values()
                .map(|sd| {
                    let mut regs = Vec::new();
                    for reg in sd.base_regs.values().flatten() {
                        if !regs.contains(reg) {
                            regs.push(*reg);
                        }
                    }
                    (sd.struc, sd.root, regs)
                })
                .collect()
        };
        for (struc, root, base_regs) in links {
            let mut visited = HashSet::new();
            if root.source() == Some(flo.entry_point) {
                // The root is an untouched entry value: an argument register.
                for reg in base_regs {
                    if registers::ARGUMENT_REGISTERS.contains(&reg) {
                        self.link_via_register(reflo, recontex, flo, struc, reg, &mut visited);
                    }
                }
            } else if let Some(argument) = self.stack_argument_of_root(recontex, flo, &root) {
                self.link_via_stack(reflo, recontex, flo, struc, argument, &mut visited);
            }
        }
    }

    /// If the root was loaded from a stack argument slot, its number.
    fn stack_argument_of_root(
        &self,
        recontex: &Recontex,
        flo: &Flo,
        root: &Value,
    ) -> Option<u32> {
        let source = root.source()?;
        let instruction = flo.instruction(source)?;
        if !has_memory_access(instruction) {
            return None;
        }
        recontex.contexts_at(flo, source).find_map(|context| {
            let address_value = Recontex::memory_address(instruction, context);
            if address_value.is_symbolic() {
                return None;
            }
            let address = address_value.value();
            if !virt::points_to_stack(address) {
                return None;
            }
            virt::stack_argument_number(address)
        })
    }

    fn link_via_register(
        &self,
        reflo: &Reflo,
        recontex: &Recontex,
        flo: &Flo,
        struc: StrucId,
        reg: Register,
        visited: &mut HashSet<Address>,
    ) {
        for caller in reflo.flos().values() {
            for call in caller.calls().values() {
                if call.dst != flo.entry_point || !visited.insert(call.src) {
                    continue;
                }
                for context in recontex.contexts_at(caller, call.src) {
                    let Some(value) = context.get_register(reg) else {
                        continue;
                    };
                    if value.is_symbolic() {
                        self.link_value(reflo, recontex, caller, struc, &value, Some(reg), visited);
                    }
                }
            }
        }
    }

    fn link_via_stack(
        &self,
        reflo: &Reflo,
        recontex: &Recontex,
        flo: &Flo,
        struc: StrucId,
        argument: u32,
        visited: &mut HashSet<Address>,
    ) {
        for caller in reflo.flos().values() {
            for call in caller.calls().values() {
                if call.dst != flo.entry_point || !visited.insert(call.src) {
                    continue;
                }
                for context in recontex.contexts_at(caller, call.src) {
                    let Some(rsp) = context.get_register(Register::RSP) else {
                        continue;
                    };
                    if rsp.is_symbolic() {
                        continue;
                    }
                    let slot = rsp.value().wrapping_add(8 * argument as u64);
                    for (_, value) in context.get_memory(slot, 8).entries {
                        if value.is_symbolic() {
                            self.link_value(reflo, recontex, caller, struc, &value, None, visited);
                        }
                    }
                }
            }
        }
    }

    /// Connects the callee-side struct to whatever `value` denotes in the
    /// caller: a root of the caller's own cluster, a pointer field loaded
    /// from one, or an argument the caller merely forwards.
    fn link_value(
        &self,
        reflo: &Reflo,
        recontex: &Recontex,
        caller: &Flo,
        struc: StrucId,
        value: &Value,
        reg: Option<Register>,
        visited: &mut HashSet<Address>,
    ) {
        let key = (value.symbol().id(), value.symbol().offset());
        let as_root = {
            let domains = self.domains.lock();
            domains
                .get(&caller.entry_point)
                .and_then(|domain| domain.strucs.get(&key))
                .map(|sd| sd.struc)
        };
        if let Some(dst) = as_root {
            self.strucs.lock().merge(dst, struc);
            return;
        }
        let Some(source) = value.source() else {
            return;
        };
        let as_field = {
            let domains = self.domains.lock();
            domains.get(&caller.entry_point).and_then(|domain| {
                domain.strucs.values().find_map(|sd| {
                    sd.relevant_instructions
                        .get(&source)
                        .map(|instruction| (sd.struc, instruction.memory_displacement64() as i64))
                })
            })
        };
        if let Some((dst, displacement)) = as_field {
            if displacement >= 0 {
                self.strucs
                    .lock()
                    .merge_struc_field_at_offset(dst, displacement as u64, struc);
            }
            return;
        }
        if source == caller.entry_point {
            if let Some(reg) = reg {
                if registers::ARGUMENT_REGISTERS.contains(&reg) {
                    self.link_via_register(reflo, recontex, caller, struc, reg, visited);
                }
            }
        }
    }

    /// Deterministic name from the owning function, the root's defining
    /// instruction and the root symbol.
    fn generate_struc_name(&self, flo: &Flo, root: &Value) -> String {
        let entry_va = self.va(flo.entry_point);
        let source_va = root.source().map(|source| self.va(source)).unwrap_or(0);
        format!(
            "Struc_{:08x}_{:08x}_{:x}",
            entry_va,
            source_va,
            root.symbol().id()
        )
    }

    fn va(&self, address: Address) -> u32 {
        self.image.raw_to_virtual(address).unwrap_or_default()
    }
}

fn memory_operand_index(instruction: &Instruction) -> Option<u32> {
    (0..instruction.op_count()).find(|&i| instruction.op_kind(i) == OpKind::Memory)
}

fn has_memory_access(instruction: &Instruction) -> bool {
    memory_operand_index(instruction).is_some()
}

/// A memory operand not based or indexed on the stack pointer.
fn has_nonstack_memory_access(instruction: &Instruction) -> bool {
    has_memory_access(instruction)
        && registers::canonical(instruction.memory_base()) != Some(Register::RSP)
        && registers::canonical(instruction.memory_index()) != Some(Register::RSP)
}

fn is_less_than_jump(mnemonic: Mnemonic) -> bool {
    matches!(mnemonic, Mnemonic::Jb | Mnemonic::Jl)
}

fn signedness_of(mnemonic: Mnemonic) -> Signedness {
    match mnemonic {
        Mnemonic::Movsx | Mnemonic::Movsxd | Mnemonic::Imul | Mnemonic::Idiv => Signedness::Signed,
        _ => Signedness::Unsigned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn recover(code: &[u8]) -> (String, usize) {
        let image = testutil::image_with_code(code).unwrap();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let mut reflo = Reflo::new(&image);
        reflo.analyze(&pool).unwrap();
        let mut recontex = Recontex::new(&image);
        recontex.analyze(&pool, &mut reflo);
        let restruc = Restruc::new(&image);
        restruc.analyze(&pool, &reflo, &recontex);
        let mut out = String::new();
        restruc.dump(&mut out);
        let count = restruc.strucs_count();
        (out, count)
    }

    #[test]
    fn empty_main_recovers_nothing() {
        // xor eax, eax; ret
        let (out, count) = recover(&[0x31, 0xC0, 0xC3]);
        assert_eq!(count, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn single_field_read_yields_one_struct_with_padding() {
        // mov rax, [rcx+0x10]; ret
        let (out, count) = recover(&[0x48, 0x8B, 0x41, 0x10, 0xC3]);
        assert_eq!(count, 1);
        assert!(out.contains("char _padding_0000[0x0010];"));
        assert!(out.contains("uint64_t field_0010;"));
    }

    #[test]
    fn float_access_wins_over_int_at_same_slot() {
        // mov eax, [rcx+4]; movss xmm0, [rcx+4]; ret
        let code = [
            0x8B, 0x41, 0x04, // mov eax, [rcx+4]
            0xF3, 0x0F, 0x10, 0x41, 0x04, // movss xmm0, [rcx+4]
            0xC3, // ret
        ];
        let (out, count) = recover(&code);
        assert_eq!(count, 1);
        assert!(out.contains("float field_0004;"));
        assert!(!out.contains("uint32_t field_0004"));
    }

    #[test]
    fn pointer_chain_links_two_structs() {
        // mov rbx, [rcx+8]; mov edx, [rbx]; ret
        let code = [
            0x48, 0x8B, 0x59, 0x08, // mov rbx, [rcx+8]
            0x8B, 0x13, // mov edx, [rbx]
            0xC3, // ret
        ];
        let (out, count) = recover(&code);
        assert_eq!(count, 2);
        assert!(out.contains("* field_0008;"));
        assert!(out.contains("uint32_t field_0000;"));
        // The pointer field displaced the 8-byte integer read of the slot.
        assert!(!out.contains("uint64_t field_0008;"));
    }

    #[test]
    fn argument_passing_merges_caller_and_callee_structs() {
        // entry: mov rax, [rcx+0x10]; call callee; ret
        // callee: mov rax, [rcx]; mov rdx, [rcx+8]; ret
        let code = [
            0x48, 0x8B, 0x41, 0x10, // mov rax, [rcx+0x10]
            0xE8, 0x01, 0x00, 0x00, 0x00, // call +1
            0xC3, // ret
            0x48, 0x8B, 0x01, // callee: mov rax, [rcx]
            0x48, 0x8B, 0x51, 0x08, // mov rdx, [rcx+8]
            0xC3, // ret
        ];
        let (out, count) = recover(&code);
        assert_eq!(count, 1);
        assert!(out.contains("uint64_t field_0000;"));
        assert!(out.contains("uint64_t field_0008;"));
        assert!(out.contains("uint64_t field_0010;"));
        assert!(!out.contains("_padding_"));
    }

    #[test]
    fn bounded_indexed_access_becomes_an_array() {
        // xor edx, edx
        // loop: mov eax, [rcx+rdx*4]; inc rdx; cmp rdx, 4; jl loop
        // ret
        let code = [
            0x31, 0xD2, // xor edx, edx
            0x8B, 0x04, 0x91, // mov eax, [rcx+rdx*4]
            0x48, 0xFF, 0xC2, // inc rdx
            0x48, 0x83, 0xFA, 0x04, // cmp rdx, 4
            0x7C, 0xF4, // jl -12
            0xC3, // ret
        ];
        let (out, count) = recover(&code);
        assert_eq!(count, 1);
        assert!(out.contains("uint32_t field_0000[4];"));
    }

    #[test]
    fn stack_based_accesses_are_ignored() {
        // mov rax, [rsp+8]; mov rax, [rax+0x10]... keep it simple:
        // mov rax, [rsp+0x28]; ret
        let (out, count) = recover(&[0x48, 0x8B, 0x44, 0x24, 0x28, 0xC3]);
        assert_eq!(count, 0);
        assert!(out.is_empty());
    }
}
