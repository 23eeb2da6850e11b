use iced_x86::Register;

use super::Value;

/// Callee-clobbered registers under the x64 Windows ABI; reset to fresh
/// unknowns across CALL.
pub const VOLATILE: [Register; 13] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::ZMM0,
    Register::ZMM1,
    Register::ZMM2,
    Register::ZMM3,
    Register::ZMM4,
    Register::ZMM5,
];

pub const NONVOLATILE: [Register; 19] = [
    Register::RBX,
    Register::RBP,
    Register::RSP,
    Register::RDI,
    Register::RSI,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::ZMM6,
    Register::ZMM7,
    Register::ZMM8,
    Register::ZMM9,
    Register::ZMM10,
    Register::ZMM11,
    Register::ZMM12,
    Register::ZMM13,
    Register::ZMM14,
    Register::ZMM15,
];

/// First four integer argument registers of the x64 Windows calling
/// convention, in argument order.
pub const ARGUMENT_REGISTERS: [Register; 4] =
    [Register::RCX, Register::RDX, Register::R8, Register::R9];

/// Maps any sub-register onto its tracked full-width slot (AL -> RAX,
/// XMM3 -> ZMM3). Returns `None` for untracked registers such as RIP,
/// segments and flags.
pub fn canonical(reg: Register) -> Option<Register> {
    if reg == Register::None {
        return None;
    }
    let full = reg.full_register();
    if VOLATILE.contains(&full) || NONVOLATILE.contains(&full) {
        Some(full)
    } else {
        None
    }
}

pub fn is_tracked(reg: Register) -> bool {
    canonical(reg).is_some()
}

pub fn tracked() -> impl Iterator<Item = Register> {
    VOLATILE.into_iter().chain(NONVOLATILE)
}

/// The tracked register file. A child context clones it; `imbl`'s structural
/// sharing keeps the clone O(1) and reads see the ancestor chain.
#[derive(Debug, Clone, Default)]
pub struct Registers {
    slots: imbl::HashMap<u32, Value>,
}

impl Registers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reg: Register) -> Option<Value> {
        let slot = canonical(reg)?;
        self.slots.get(&(slot as u32)).copied()
    }

    /// Writes the full-width slot; untracked registers are ignored.
    pub fn set(&mut self, reg: Register, value: Value) {
        if let Some(slot) = canonical(reg) {
            self.slots.insert(slot as u32, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::IdGen;

    #[test]
    fn sub_registers_share_a_slot() {
        let ids = IdGen::default();
        let mut regs = Registers::new();
        regs.set(Register::EAX, Value::concrete(None, 7));
        assert_eq!(regs.get(Register::RAX).map(|v| v.value()), Some(7));
        assert_eq!(regs.get(Register::AL).map(|v| v.value()), Some(7));

        regs.set(Register::XMM2, Value::fresh(&ids, 0usize, 16));
        assert!(regs.get(Register::ZMM2).is_some());
    }

    #[test]
    fn untracked_registers_are_ignored() {
        let mut regs = Registers::new();
        regs.set(Register::RIP, Value::concrete(None, 1));
        assert!(regs.get(Register::RIP).is_none());
        assert_eq!(canonical(Register::RIP), None);
        assert_eq!(canonical(Register::None), None);
    }

    #[test]
    fn volatile_and_nonvolatile_partition_the_tracked_set() {
        for reg in VOLATILE {
            assert!(!NONVOLATILE.contains(&reg));
        }
        assert_eq!(tracked().count(), VOLATILE.len() + NONVOLATILE.len());
    }
}
