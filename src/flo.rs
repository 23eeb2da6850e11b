use std::collections::{BTreeMap, BTreeSet};

use iced_x86::{FlowControl, Instruction, Mnemonic, OpKind};

use crate::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpType {
    Inner,
    Outer,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct Jump {
    pub dst: Address,
    pub src: Address,
}

#[derive(Debug, Clone, Copy)]
pub struct Call {
    pub dst: Address,
    pub src: Address,
    pub ret: Address,
}

/// A single recovered function: its disassembly plus classified jumps.
///
/// Built instruction by instruction by Reflo; immutable afterwards except
/// for the back-edges Recontex records.
#[derive(Debug, Default)]
pub struct Flo {
    pub entry_point: Address,
    disassembly: BTreeMap<Address, Instruction>,
    // Jump maps are keyed by destination; several sources may share one.
    inner_jumps: BTreeMap<Address, Vec<Jump>>,
    outer_jumps: BTreeMap<Address, Vec<Jump>>,
    unknown_jumps: BTreeMap<Address, Vec<Jump>>,
    calls: BTreeMap<Address, Call>,
    cycles: BTreeSet<(Address, Address)>,
    pub has_ret: bool,
}

impl Flo {
    pub fn new(entry_point: Address) -> Self {
        Self {
            entry_point,
            ..Default::default()
        }
    }

    pub fn is_any_jump(instruction: &Instruction) -> bool {
        matches!(
            instruction.flow_control(),
            FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::ConditionalBranch
        )
    }

    pub fn is_conditional_jump(instruction: &Instruction) -> bool {
        instruction.flow_control() == FlowControl::ConditionalBranch
    }

    /// Destination of a direct near branch or call; `None` for indirect ones.
    pub fn jump_target(instruction: &Instruction) -> Option<Address> {
        match instruction.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Some(instruction.near_branch_target() as Address)
            }
            _ => None,
        }
    }

    pub fn disassembly(&self) -> &BTreeMap<Address, Instruction> {
        &self.disassembly
    }

    pub fn instruction(&self, address: Address) -> Option<&Instruction> {
        self.disassembly.get(&address)
    }

    pub fn inner_jumps(&self) -> &BTreeMap<Address, Vec<Jump>> {
        &self.inner_jumps
    }

    pub fn outer_jumps(&self) -> &BTreeMap<Address, Vec<Jump>> {
        &self.outer_jumps
    }

    pub fn unknown_jumps(&self) -> &BTreeMap<Address, Vec<Jump>> {
        &self.unknown_jumps
    }

    pub fn calls(&self) -> &BTreeMap<Address, Call> {
        &self.calls
    }

    pub fn cycles(&self) -> &BTreeSet<(Address, Address)> {
        &self.cycles
    }

    pub fn add_cycle(&mut self, src: Address, dst: Address) {
        self.cycles.insert((src, dst));
    }

    pub fn add_instruction(&mut self, address: Address, instruction: Instruction) {
        self.disassembly.entry(address).or_insert(instruction);
    }

    /// An address is inside once it is disassembled or targeted by a known
    /// inner jump.
    pub fn is_inside(&self, address: Address) -> bool {
        self.disassembly.contains_key(&address) || self.inner_jumps.contains_key(&address)
    }

    /// Complete means fully explored: nothing unknown remains and a RET was
    /// seen. Functions ending in an outer (tail) jump never become complete
    /// and are accepted as-is by the driver.
    pub fn is_complete(&self) -> bool {
        !self.disassembly.is_empty() && self.unknown_jumps.is_empty() && self.has_ret
    }

    /// Classifies one decoded instruction and returns the next address to
    /// decode, or `None` when this branch of the walk terminates.
    pub fn analyze(&mut self, mut outer: Option<&mut Flo>, address: Address) -> Option<Address> {
        let Some(&instruction) = self.disassembly.get(&address) else {
            return None;
        };
        let next = address + instruction.len();
        self.visit(address, outer.as_deref_mut());

        if instruction.mnemonic() == Mnemonic::Call {
            // Assume calls always return; indirect ones are simply not recorded.
            if let Some(dst) = Self::jump_target(&instruction) {
                self.add_call(dst, address, next);
            }
            return Some(next);
        }
        if instruction.mnemonic() == Mnemonic::Ret {
            self.has_ret = true;
            return self.is_inside(next).then_some(next);
        }
        if Self::is_any_jump(&instruction) {
            let unconditional = !Self::is_conditional_jump(&instruction);
            let Some(dst) = Self::jump_target(&instruction) else {
                // Indirect jump: nothing to classify, and no fallthrough for
                // the unconditional case.
                return (!unconditional).then_some(next);
            };
            let jump_type = self.get_jump_type(dst, next);
            self.add_jump(jump_type, dst, address);
            if unconditional {
                return match jump_type {
                    // The fallthrough is reachable only if some earlier
                    // unknown jump targeted it.
                    JumpType::Unknown => self
                        .promote_unknown_jump(next, JumpType::Inner)
                        .then_some(next),
                    JumpType::Inner => (dst >= next).then_some(next),
                    JumpType::Outer => None,
                };
            }
            return Some(next);
        }
        Some(next)
    }

    pub fn get_jump_type(&self, dst: Address, next: Address) -> JumpType {
        // Jump with offset zero, i.e. no jump at all.
        if dst == next {
            return JumpType::Inner;
        }
        // The function's very first instruction is a jump: a thunk.
        if self.disassembly.len() == 1 {
            return JumpType::Outer;
        }
        if self.disassembly.contains_key(&dst) {
            return JumpType::Inner;
        }
        if dst < self.entry_point {
            return JumpType::Outer;
        }
        JumpType::Unknown
    }

    pub fn add_jump(&mut self, jump_type: JumpType, dst: Address, src: Address) {
        let map = match jump_type {
            JumpType::Inner => &mut self.inner_jumps,
            JumpType::Outer => &mut self.outer_jumps,
            JumpType::Unknown => &mut self.unknown_jumps,
        };
        map.entry(dst).or_default().push(Jump { dst, src });
    }

    fn add_call(&mut self, dst: Address, src: Address, ret: Address) {
        self.calls.entry(src).or_insert(Call { dst, src, ret });
    }

    /// Reclassifies every unknown jump targeting `dst`. Returns whether
    /// anything was promoted.
    pub fn promote_unknown_jump(&mut self, dst: Address, new_type: JumpType) -> bool {
        match self.unknown_jumps.remove(&dst) {
            Some(jumps) => {
                for jump in jumps {
                    self.add_jump(new_type, jump.dst, jump.src);
                }
                true
            }
            None => false,
        }
    }

    fn visit(&mut self, address: Address, outer: Option<&mut Flo>) {
        self.promote_unknown_jump(address, JumpType::Inner);
        if let Some(outer) = outer {
            outer.promote_unknown_jump(address, JumpType::Inner);
        }
    }

    /// A speculative sub-graph can fold into its outer graph once complete,
    /// or once its first instruction is contiguous with the outer's last.
    pub fn can_merge_with(&self, outer: &Flo) -> bool {
        if self.is_complete() {
            return true;
        }
        let (Some((&first, _)), Some((&last, last_instruction))) = (
            self.disassembly.iter().next(),
            outer.disassembly.iter().next_back(),
        ) else {
            return false;
        };
        first == last + last_instruction.len()
    }

    pub fn merge(&mut self, other: Flo) {
        for (address, instruction) in other.disassembly {
            self.disassembly.entry(address).or_insert(instruction);
        }
        merge_jumps(&mut self.inner_jumps, other.inner_jumps);
        merge_jumps(&mut self.outer_jumps, other.outer_jumps);
        merge_jumps(&mut self.unknown_jumps, other.unknown_jumps);
        for (src, call) in other.calls {
            self.calls.entry(src).or_insert(call);
        }
        self.has_ret |= other.has_ret;
    }
}

// Multimap merge that keeps at most one jump per (dst, src) pair.
fn merge_jumps(dst: &mut BTreeMap<Address, Vec<Jump>>, src: BTreeMap<Address, Vec<Jump>>) {
    for (target, jumps) in src {
        let bag = dst.entry(target).or_default();
        for jump in jumps {
            if !bag.iter().any(|existing| existing.src == jump.src) {
                bag.push(jump);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    // Decode-and-step driver matching Reflo's fill loop: instructions enter
    // the map one at a time, in walk order.
    fn walk(flo: &mut Flo, code: &[u8], base: Address) {
        let mut decoder = Decoder::with_ip(64, code, base as u64, DecoderOptions::NONE);
        let mut next = Some(base);
        while let Some(address) = next {
            if address < base || address >= base + code.len() {
                break;
            }
            decoder.set_position(address - base).unwrap();
            decoder.set_ip(address as u64);
            let instruction = decoder.decode();
            flo.add_instruction(address, instruction);
            next = flo.analyze(None, address);
        }
    }

    #[test]
    fn classifies_first_instruction_jump_as_outer() {
        let mut flo = Flo::new(0x100);
        // jmp +0x20
        walk(&mut flo, &[0xEB, 0x20], 0x100);
        assert!(flo.outer_jumps().contains_key(&0x122));
        assert_eq!(flo.disassembly().len(), 1);
    }

    #[test]
    fn promotes_unknown_jump_on_visit() {
        let mut flo = Flo::new(0x100);
        // nop; jz 0x104; nop; ret
        walk(&mut flo, &[0x90, 0x74, 0x01, 0x90, 0xC3], 0x100);
        assert!(flo.unknown_jumps().is_empty());
        assert!(flo.inner_jumps().contains_key(&0x104));
        assert!(flo.has_ret);
        assert!(flo.is_complete());
        assert_eq!(flo.disassembly().len(), 4);
    }

    #[test]
    fn records_direct_calls_with_return_site() {
        let mut flo = Flo::new(0x100);
        // nop; call +0x10; ret
        walk(&mut flo, &[0x90, 0xE8, 0x10, 0x00, 0x00, 0x00, 0xC3], 0x100);
        let call = flo.calls().get(&0x101).copied().unwrap();
        assert_eq!(call.dst, 0x116);
        assert_eq!(call.ret, 0x106);
        assert!(flo.has_ret);
    }

    #[test]
    fn backward_unconditional_jump_terminates() {
        let mut flo = Flo::new(0x100);
        // nop; nop; jmp 0x100
        walk(&mut flo, &[0x90, 0x90, 0xEB, 0xFC], 0x100);
        assert!(flo.inner_jumps().contains_key(&0x100));
        assert_eq!(flo.disassembly().len(), 3);
        assert!(!flo.has_ret);
    }

    #[test]
    fn merge_keeps_sources_unique() {
        let mut a = Flo::new(0x100);
        a.add_jump(JumpType::Inner, 0x110, 0x100);
        let mut b = Flo::new(0x200);
        b.add_jump(JumpType::Inner, 0x110, 0x100);
        b.add_jump(JumpType::Inner, 0x110, 0x104);
        a.merge(b);
        assert_eq!(a.inner_jumps()[&0x110].len(), 2);
    }
}
