use std::collections::BTreeMap;

use iced_x86::{
    Instruction, InstructionInfoFactory, MemorySize, Mnemonic, OpAccess, OpKind, Register,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::binary::Image;
use crate::context::{Context, Contexts, FloContexts, ParentRole};
use crate::coverage::{OptimalCoverage, Path, PathStep};
use crate::flo::Flo;
use crate::reflo::Reflo;
use crate::virt::{
    self, hash_combine, registers, IdGen, Value, MAGIC_STACK_VALUE, MAGIC_STACK_VALUE_MASK,
};
use crate::Address;

/// Cursor over one enumerated path's branch decisions.
#[derive(Debug, Clone)]
struct PathCursor<'p> {
    steps: &'p [PathStep],
    at: usize,
}

impl<'p> PathCursor<'p> {
    fn new(path: &'p Path) -> Self {
        Self { steps: path, at: 0 }
    }

    fn current(&self) -> Option<&PathStep> {
        self.steps.get(self.at)
    }

    fn advance(&mut self) {
        if self.at < self.steps.len() {
            self.at += 1;
        }
    }
}

/// Symbolic interpreter: propagates abstract contexts along every enumerated
/// path of every flo, emulating a restricted x86-64 subset, and records the
/// per-instruction context multimap.
pub struct Recontex<'a> {
    image: &'a Image,
    ids: IdGen,
    contexts: BTreeMap<Address, FloContexts>,
}

impl<'a> Recontex<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            ids: IdGen::default(),
            contexts: BTreeMap::new(),
        }
    }

    pub fn analyze(&mut self, pool: &rayon::ThreadPool, reflo: &mut Reflo) {
        let results = Mutex::new(Vec::new());
        pool.install(|| {
            reflo.flos().par_iter().for_each(|(&entry_point, flo)| {
                let Some(coverage) = OptimalCoverage::analyze(flo) else {
                    debug!(
                        "optimal coverage for {:#010x} cannot be calculated",
                        self.va(entry_point)
                    );
                    results.lock().push((entry_point, FloContexts::default(), vec![]));
                    return;
                };
                let mut flo_contexts = FloContexts::default();
                let cursors = coverage.paths().iter().map(PathCursor::new).collect();
                let contexts = self.initial_contexts(flo);
                self.analyze_flo(flo, &mut flo_contexts, cursors, contexts, flo.entry_point);
                let cycles: Vec<_> = coverage.loops().collect();
                results.lock().push((entry_point, flo_contexts, cycles));
            });
        });
        for (entry_point, flo_contexts, cycles) in results.into_inner() {
            self.contexts.insert(entry_point, flo_contexts);
            if let Some(flo) = reflo.flo_mut(entry_point) {
                for (src, dst) in cycles {
                    flo.add_cycle(src, dst);
                }
            }
        }
    }

    pub fn flo_contexts(&self, flo: &Flo) -> Option<&FloContexts> {
        self.contexts.get(&flo.entry_point)
    }

    pub fn contexts_at<'s>(
        &'s self,
        flo: &Flo,
        address: Address,
    ) -> impl Iterator<Item = &'s Context> + 's {
        self.contexts
            .get(&flo.entry_point)
            .into_iter()
            .flat_map(move |flo_contexts| flo_contexts.at(address))
    }

    /// Single entry state: every tracked register fresh symbolic, RSP seeded
    /// with the concrete stack magic so frame arithmetic stays concrete.
    fn initial_contexts(&self, flo: &Flo) -> Contexts {
        let mut context = Context::new(&self.ids, flo.entry_point);
        context.set_register(
            Register::RSP,
            Value::concrete(flo.entry_point, MAGIC_STACK_VALUE << 32),
        );
        let mut contexts = Contexts::default();
        contexts.insert(context);
        contexts
    }

    /// Walks the disassembly from `address`, splitting the path set at each
    /// branch into the paths that take it and the paths that skip it.
    fn analyze_flo(
        &self,
        flo: &Flo,
        flo_contexts: &mut FloContexts,
        mut paths: Vec<PathCursor>,
        mut contexts: Contexts,
        mut address: Address,
    ) {
        let Some((&last, last_instruction)) = flo.disassembly().iter().next_back() else {
            return;
        };
        let end = last + last_instruction.len();
        while address < end {
            if contexts.is_empty() {
                // A context set must never drain mid-path.
                debug_assert!(false, "empty context set at {:#x}", address);
                return;
            }
            let Some(instruction) = flo.instruction(address) else {
                return;
            };
            trace!(
                "{:5}/{:<5} {:#x}",
                contexts.len(),
                flo_contexts.count(address),
                address
            );
            contexts = self.propagate(flo_contexts, address, instruction, contexts);
            if contexts.is_empty() {
                return;
            }
            if Flo::is_any_jump(instruction) {
                if paths.iter().all(|path| path.current().is_none()) {
                    return;
                }
                let (take, mut skip): (Vec<PathCursor>, Vec<PathCursor>) =
                    paths.into_iter().partition(|path| {
                        path.current()
                            .is_some_and(|step| step.jump == address && step.take)
                    });
                if !skip.is_empty() {
                    for path in &mut skip {
                        if path.current().is_some_and(|step| step.jump == address) {
                            path.advance();
                        }
                    }
                    self.analyze_flo(
                        flo,
                        flo_contexts,
                        skip,
                        self.make_children(&contexts),
                        address + instruction.len(),
                    );
                }
                if take.is_empty() {
                    return;
                }
                let Some(target) = Flo::jump_target(instruction) else {
                    return;
                };
                paths = take;
                for path in &mut paths {
                    path.advance();
                }
                address = target;
                continue;
            }
            if instruction.mnemonic() == Mnemonic::Ret {
                return;
            }
            address += instruction.len();
        }
    }

    /// Emplaces every incoming context at `address` (deduplicated by hash),
    /// then emulates the instruction on a child of each stored context.
    fn propagate(
        &self,
        flo_contexts: &mut FloContexts,
        address: Address,
        instruction: &Instruction,
        mut contexts: Contexts,
    ) -> Contexts {
        let role = if instruction.mnemonic() == Mnemonic::Call {
            ParentRole::Caller
        } else {
            ParentRole::Default
        };
        let mut out = Contexts::default();
        while let Some(context) = contexts.pop() {
            let stored = flo_contexts.emplace(address, context);
            let mut child = stored.make_child(&self.ids, role);
            self.emulate(address, instruction, &mut child);
            out.insert(child);
        }
        out
    }

    fn make_children(&self, contexts: &Contexts) -> Contexts {
        let mut children = Contexts::default();
        for context in contexts.iter() {
            children.insert(context.make_child(&self.ids, ParentRole::Default));
        }
        children
    }

    // Sub-register discipline: writes to 8- and 16-bit destinations leave
    // the high bits alone; 32-bit destinations zero-extend.
    fn emulate(&self, address: Address, instruction: &Instruction, context: &mut Context) {
        match instruction.mnemonic() {
            Mnemonic::Mov | Mnemonic::Movzx | Mnemonic::Movsx | Mnemonic::Movsxd => {
                self.emulate_binary(instruction, context, address, &|dst, src| {
                    let mut mask = u64::MAX;
                    if dst.size() < 8 {
                        mask = (1u64 << (dst.size() * 8)) - 1;
                    }
                    if !dst.is_symbolic() && !src.is_symbolic() && dst.size() < 4 {
                        Value::concrete_sized(
                            src.source(),
                            (dst.value() & !mask) | (src.value() & mask),
                            dst.size(),
                        )
                    } else if !src.is_symbolic() {
                        Value::concrete_sized(src.source(), src.value() & mask, dst.size())
                    } else {
                        *src
                    }
                });
            }
            Mnemonic::Add => self.emulate_arith(instruction, context, address, u64::wrapping_add),
            Mnemonic::Sub => self.emulate_arith(instruction, context, address, u64::wrapping_sub),
            Mnemonic::Or => self.emulate_arith(instruction, context, address, |a, b| a | b),
            Mnemonic::And => self.emulate_arith(instruction, context, address, |a, b| a & b),
            Mnemonic::Xor => self.emulate_arith(instruction, context, address, |a, b| a ^ b),
            Mnemonic::Imul => self.emulate_arith(instruction, context, address, u64::wrapping_mul),
            Mnemonic::Lea => self.emulate_lea(instruction, context, address),
            Mnemonic::Push => self.emulate_push(instruction, context, address),
            Mnemonic::Pop => self.emulate_pop(instruction, context, address),
            Mnemonic::Call => {
                // Assume RSP is unchanged across the call and only volatile
                // registers are clobbered.
                for &reg in registers::VOLATILE.iter() {
                    context.set_register(reg, Value::fresh(&self.ids, address, 8));
                }
            }
            Mnemonic::Ret => {
                if let Some(rsp) = context.get_register(Register::RSP) {
                    if !rsp.is_symbolic() {
                        context.set_register(
                            Register::RSP,
                            Value::concrete(address, rsp.value().wrapping_add(8)),
                        );
                    }
                }
            }
            Mnemonic::Inc => self.emulate_inc(instruction, context, address, 1),
            Mnemonic::Dec => self.emulate_inc(instruction, context, address, -1),
            _ => self.emulate_generic(instruction, context, address),
        }
    }

    fn emulate_binary(
        &self,
        instruction: &Instruction,
        context: &mut Context,
        address: Address,
        callback: &dyn Fn(&Value, &Value) -> Value,
    ) {
        let mut dst = self.operand(instruction, 0, context, address);
        let mut src = None;
        let mut immediate = None;
        let op_count = instruction.op_count();
        if op_count >= 2 {
            src = Some(self.operand(instruction, 1, context, address));
        }
        if op_count >= 3 && is_immediate(instruction.op_kind(2)) {
            immediate = Some(self.operand(instruction, 2, context, address).value);
        }

        let same_register_xor = instruction.mnemonic() == Mnemonic::Xor
            && dst.reg.is_some()
            && dst.reg == src.as_ref().and_then(|operand| operand.reg);
        if same_register_xor {
            // xor r, r: a known zero from here on.
            let size = src.as_ref().map_or(dst.value.size(), |s| s.value.size());
            dst.value = Value::concrete_sized(address, 0, size);
        } else if op_count >= 3 {
            dst.value = match (immediate, &src) {
                // Three-operand form writes dst from the remaining two.
                (Some(immediate), Some(src)) => callback(&src.value, &immediate),
                _ => Value::fresh(&self.ids, address, dst.value.size()),
            };
        } else if let Some(src) = src {
            dst.value = callback(&dst.value, &src.value);
        } else {
            dst.value = Value::fresh(&self.ids, address, dst.value.size());
        }
        dst.value.set_source(address);
        self.write_operand(context, &dst);
    }

    fn emulate_arith(
        &self,
        instruction: &Instruction,
        context: &mut Context,
        address: Address,
        action: fn(u64, u64) -> u64,
    ) {
        let ids = &self.ids;
        self.emulate_binary(instruction, context, address, &move |dst, src| {
            if !dst.is_symbolic() && !src.is_symbolic() {
                let mut mask = u64::MAX;
                if dst.size() < 8 {
                    mask = (1u64 << (dst.size() * 8)) - 1;
                }
                let result = action(dst.value(), src.value());
                if dst.size() < 4 {
                    Value::concrete_sized(
                        src.source(),
                        (dst.value() & !mask) | (result & mask),
                        dst.size(),
                    )
                } else {
                    Value::concrete_sized(src.source(), result & mask, dst.size())
                }
            } else if dst.is_symbolic() && !src.is_symbolic() {
                // Symbolic base, concrete shift: slide the offset.
                Value::symbolic(
                    src.source(),
                    dst.size(),
                    action(dst.symbol().offset() as u64, src.value()) as i64,
                    dst.symbol().id(),
                )
            } else {
                Value::fresh(ids, src.source(), dst.size())
            }
        });
    }

    fn emulate_lea(&self, instruction: &Instruction, context: &mut Context, address: Address) {
        if instruction.op_kind(0) != OpKind::Register {
            return;
        }
        let mut value = Self::memory_address(instruction, context);
        value.set_source(address);
        value.set_size(instruction.op_register(0).size());
        context.set_register(instruction.op_register(0), value);
    }

    fn emulate_push(&self, instruction: &Instruction, context: &mut Context, address: Address) {
        let Some(rsp) = context.get_register(Register::RSP) else {
            return;
        };
        if rsp.is_symbolic() {
            return;
        }
        let new_rsp = rsp.value().wrapping_sub(8);
        let mut operand = self.operand(instruction, 0, context, address);
        operand.value.set_source(address);
        context.set_register(Register::RSP, Value::concrete(address, new_rsp));
        context.set_memory(new_rsp, operand.value);
    }

    fn emulate_pop(&self, instruction: &Instruction, context: &mut Context, address: Address) {
        let Some(rsp) = context.get_register(Register::RSP) else {
            return;
        };
        if rsp.is_symbolic() {
            return;
        }
        context.set_register(
            Register::RSP,
            Value::concrete(address, rsp.value().wrapping_add(8)),
        );
        let mut value = context
            .get_memory(rsp.value(), 8)
            .into_value(&self.ids, address, rsp.value(), 8);
        value.set_source(address);
        let target = self.operand(instruction, 0, context, address);
        self.write_operand(
            context,
            &Operand {
                value,
                reg: target.reg,
                address: target.address,
            },
        );
    }

    fn emulate_inc(
        &self,
        instruction: &Instruction,
        context: &mut Context,
        address: Address,
        delta: i64,
    ) {
        let mut dst = self.operand(instruction, 0, context, address);
        dst.value = if !dst.value.is_symbolic() {
            Value::concrete(address, dst.value.value().wrapping_add(delta as u64))
        } else {
            Value::symbolic(
                address,
                8,
                dst.value.symbol().offset().wrapping_add(delta),
                dst.value.symbol().id(),
            )
        };
        self.write_operand(context, &dst);
    }

    /// Everything outside the emulated subset: written operands become fresh
    /// unknowns of their element size.
    fn emulate_generic(&self, instruction: &Instruction, context: &mut Context, address: Address) {
        let mut factory = InstructionInfoFactory::new();
        let info = factory.info(instruction);
        for i in 0..instruction.op_count() {
            let access = info.op_access(i);
            if !matches!(
                access,
                OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
            ) {
                continue;
            }
            match instruction.op_kind(i) {
                OpKind::Register => {
                    let reg = instruction.op_register(i);
                    context.set_register(reg, Value::fresh(&self.ids, address, reg.size()));
                }
                OpKind::Memory => {
                    let key = Self::memory_address(instruction, context).raw_address_value();
                    let size = element_size(instruction.memory_size()).max(1);
                    context.set_memory(key, Value::fresh(&self.ids, address, size));
                }
                _ => {}
            }
        }
    }

    fn write_operand(&self, context: &mut Context, operand: &Operand) {
        if let Some(reg) = operand.reg {
            context.set_register(reg, operand.value);
        } else if let Some(address) = operand.address {
            context.set_memory(address, operand.value);
        }
    }

    fn operand(
        &self,
        instruction: &Instruction,
        index: u32,
        context: &Context,
        source: Address,
    ) -> Operand {
        match instruction.op_kind(index) {
            OpKind::Register => {
                let reg = instruction.op_register(index);
                let size = reg.size();
                let value = match context.get_register(reg) {
                    Some(mut value) => {
                        value.set_size(size);
                        value
                    }
                    None => Value::fresh(&self.ids, source, size),
                };
                Operand {
                    value,
                    reg: Some(reg),
                    address: None,
                }
            }
            OpKind::Memory => {
                let key = Self::memory_address(instruction, context).raw_address_value();
                let size = element_size(instruction.memory_size());
                let value = if size > 0 {
                    context
                        .get_memory(key, size)
                        .into_value(&self.ids, source, key, size)
                } else {
                    Value::fresh(&self.ids, source, size)
                };
                Operand {
                    value,
                    reg: None,
                    address: Some(key),
                }
            }
            kind if is_immediate(kind) => {
                let (value, size) = immediate_value(instruction, index);
                Operand {
                    value: Value::concrete_sized(source, value, size),
                    reg: None,
                    address: None,
                }
            }
            _ => Operand {
                value: Value::fresh(&self.ids, source, 8),
                reg: None,
                address: None,
            },
        }
    }

    /// Effective address of a memory operand under `context`: concrete when
    /// base and index resolve, otherwise a symbolic value whose id hashes the
    /// unresolved parts. RSP-based addresses get the stack tag.
    pub fn memory_address(instruction: &Instruction, context: &Context) -> Value {
        let mut symbolic = false;
        let mut value = 0u64;
        let mut symbol = 0u64;

        let base = instruction.memory_base();
        if base != Register::None && base != Register::RIP {
            match context.get_register(base) {
                Some(reg) if !reg.is_symbolic() => value = value.wrapping_add(reg.value()),
                _ => symbolic = true,
            }
            if let Some(reg) = context.get_register(base) {
                if reg.is_symbolic() {
                    if let Some(slot) = registers::canonical(base) {
                        hash_combine(&mut symbol, slot as u64);
                    }
                    hash_combine(&mut symbol, reg.symbol().id());
                    hash_combine(&mut symbol, reg.symbol().offset() as u64);
                }
            }
        }
        let index = instruction.memory_index();
        if index != Register::None {
            let scale = instruction.memory_index_scale() as u64;
            match context.get_register(index) {
                Some(reg) if !reg.is_symbolic() => {
                    value = value.wrapping_add(reg.value().wrapping_mul(scale));
                }
                _ => symbolic = true,
            }
            if let Some(reg) = context.get_register(index) {
                if reg.is_symbolic() {
                    if let Some(slot) = registers::canonical(index) {
                        hash_combine(&mut symbol, slot as u64);
                    }
                    hash_combine(&mut symbol, reg.symbol().id());
                    hash_combine(&mut symbol, reg.symbol().offset() as u64);
                }
            }
            hash_combine(&mut symbol, scale);
        }
        let displacement = instruction.memory_displacement64();
        value = value.wrapping_add(displacement);
        hash_combine(&mut symbol, displacement);
        if element_size(instruction.memory_size()) == 0 {
            hash_combine(&mut symbol, 1);
        }
        if symbolic {
            if registers::canonical(base) == Some(Register::RSP) {
                symbol = MAGIC_STACK_VALUE_MASK | (symbol & 0xFFFF_FFFF);
            }
            Value::symbolic(None, 8, 0, symbol)
        } else {
            Value::concrete(None, value)
        }
    }

    /// Whether `reg` holds a stack address in any context reaching `address`.
    pub fn points_to_stack(
        reg: Register,
        address: Address,
        flo_contexts: &FloContexts,
    ) -> bool {
        if registers::canonical(reg) == Some(Register::RSP) {
            return true;
        }
        flo_contexts.at(address).any(|context| {
            context
                .get_register(reg)
                .is_some_and(|value| !value.is_symbolic() && virt::points_to_stack(value.value()))
        })
    }

    fn va(&self, address: Address) -> u32 {
        self.image.raw_to_virtual(address).unwrap_or_default()
    }
}

struct Operand {
    value: Value,
    reg: Option<Register>,
    address: Option<u64>,
}

pub(crate) fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

pub(crate) fn immediate_value(instruction: &Instruction, index: u32) -> (u64, usize) {
    match instruction.op_kind(index) {
        OpKind::Immediate8 => (instruction.immediate8() as u64, 1),
        OpKind::Immediate8_2nd => (instruction.immediate8_2nd() as u64, 1),
        OpKind::Immediate16 => (instruction.immediate16() as u64, 2),
        OpKind::Immediate32 => (instruction.immediate32() as u64, 4),
        OpKind::Immediate64 => (instruction.immediate64(), 8),
        OpKind::Immediate8to16 => (instruction.immediate8to16() as i64 as u64, 2),
        OpKind::Immediate8to32 => (instruction.immediate8to32() as i64 as u64, 4),
        OpKind::Immediate8to64 => (instruction.immediate8to64() as u64, 8),
        OpKind::Immediate32to64 => (instruction.immediate32to64() as u64, 8),
        _ => (0, 8),
    }
}

/// Element size in bytes of a memory access; 0 for unsized operands (LEA).
pub fn element_size(memory_size: MemorySize) -> usize {
    memory_size.element_type().size()
}

/// Whether a memory access reads or writes floating-point elements.
pub fn is_float_access(memory_size: MemorySize) -> bool {
    matches!(
        memory_size.element_type(),
        MemorySize::Float16
            | MemorySize::Float32
            | MemorySize::Float64
            | MemorySize::Float80
            | MemorySize::Float128
            | MemorySize::BFloat16
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn run(code: &[u8]) -> (crate::binary::Image, Address, Vec<(Address, FloContexts)>) {
        let image = testutil::image_with_code(code).unwrap();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let mut reflo = Reflo::new(&image);
        reflo.analyze(&pool).unwrap();
        let entry = image.entry_point();
        let mut recontex = Recontex::new(&image);
        recontex.analyze(&pool, &mut reflo);
        let contexts = std::mem::take(&mut recontex.contexts).into_iter().collect();
        (image, entry, contexts)
    }

    fn contexts_for<'c>(
        contexts: &'c [(Address, FloContexts)],
        entry: Address,
    ) -> &'c FloContexts {
        &contexts.iter().find(|(at, _)| *at == entry).unwrap().1
    }

    #[test]
    fn xor_zeroes_propagate_forward() {
        // xor eax, eax; mov rbx, rax; ret
        let code = [0x31, 0xC0, 0x48, 0x89, 0xC3, 0xC3];
        let (_, entry, contexts) = run(&code);
        let flo_contexts = contexts_for(&contexts, entry);
        // At the RET, RBX carries the concrete zero produced by the xor.
        let context = flo_contexts.at(entry + 5).next().unwrap();
        let rbx = context.get_register(Register::RBX).unwrap();
        assert!(!rbx.is_symbolic());
        assert_eq!(rbx.value(), 0);
    }

    #[test]
    fn push_pop_round_trips_through_memory() {
        // mov rax, 0x11223344; push rax; pop rbx; ret
        let code = [
            0x48, 0xC7, 0xC0, 0x44, 0x33, 0x22, 0x11, // mov rax, 0x11223344
            0x50, // push rax
            0x5B, // pop rbx
            0xC3, // ret
        ];
        let (_, entry, contexts) = run(&code);
        let flo_contexts = contexts_for(&contexts, entry);
        let context = flo_contexts.at(entry + 9).next().unwrap();
        let rbx = context.get_register(Register::RBX).unwrap();
        assert!(!rbx.is_symbolic());
        assert_eq!(rbx.value(), 0x11223344);
        // RSP is back at the entry seed.
        let rsp = context.get_register(Register::RSP).unwrap();
        assert_eq!(rsp.value(), MAGIC_STACK_VALUE << 32);
    }

    #[test]
    fn call_clobbers_volatile_and_preserves_nonvolatile() {
        // entry: mov rbx, 1; mov rax, 2; call callee; ret / callee: ret
        let code = [
            0x48, 0xC7, 0xC3, 0x01, 0x00, 0x00, 0x00, // mov rbx, 1
            0x48, 0xC7, 0xC0, 0x02, 0x00, 0x00, 0x00, // mov rax, 2
            0xE8, 0x01, 0x00, 0x00, 0x00, // call +1
            0xC3, // ret
            0xC3, // callee: ret
        ];
        let (_, entry, contexts) = run(&code);
        let flo_contexts = contexts_for(&contexts, entry);
        let context = flo_contexts.at(entry + 19).next().unwrap();
        let rbx = context.get_register(Register::RBX).unwrap();
        assert!(!rbx.is_symbolic());
        assert_eq!(rbx.value(), 1);
        let rax = context.get_register(Register::RAX).unwrap();
        assert!(rax.is_symbolic());
    }

    #[test]
    fn add_slides_symbolic_offsets() {
        // add rcx, 0x10; mov rax, [rcx+8]; ret
        let code = [
            0x48, 0x83, 0xC1, 0x10, // add rcx, 0x10
            0x48, 0x8B, 0x41, 0x08, // mov rax, [rcx+8]
            0xC3, // ret
        ];
        let (_, entry, contexts) = run(&code);
        let flo_contexts = contexts_for(&contexts, entry);
        let at_load = flo_contexts.at(entry + 4).next().unwrap();
        let rcx = at_load.get_register(Register::RCX).unwrap();
        assert!(rcx.is_symbolic());
        assert_eq!(rcx.symbol().offset(), 0x10);
    }

    #[test]
    fn stack_addresses_carry_the_magic_tag() {
        // mov rax, [rsp+0x28]; ret
        let code = [0x48, 0x8B, 0x44, 0x24, 0x28, 0xC3];
        let (_, entry, contexts) = run(&code);
        let flo_contexts = contexts_for(&contexts, entry);
        let context = flo_contexts.at(entry).next().unwrap();
        let rsp = context.get_register(Register::RSP).unwrap();
        assert!(virt::points_to_stack(rsp.value()));
        assert_eq!(
            virt::stack_argument_number(rsp.value().wrapping_add(0x28)),
            Some(4)
        );
        assert!(Recontex::points_to_stack(Register::RSP, entry, flo_contexts));
    }

    #[test]
    fn contexts_deduplicate_at_join_points() {
        // +0: nop
        // +1: jz +5
        // +3: xor eax, eax
        // +5: ret  (two paths join here)
        let code = [0x90, 0x74, 0x02, 0x31, 0xC0, 0xC3];
        let (_, entry, contexts) = run(&code);
        let flo_contexts = contexts_for(&contexts, entry);
        // Hashes at the join must be pairwise distinct.
        let hashes: Vec<u64> = flo_contexts.at(entry + 5).map(|c| c.hash()).collect();
        let mut deduped = hashes.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(hashes.len(), deduped.len());
        assert_eq!(flo_contexts.at(entry + 5).count(), 2);
    }
}
