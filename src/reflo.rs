use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use iced_x86::{Decoder, DecoderOptions, Instruction};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::binary::Image;
use crate::error::Error;
use crate::flo::{Flo, JumpType};
use crate::Address;

/// Control-flow reconstructor: discovers functions and their instruction
/// graphs by recursive disassembly from the image entry point, following
/// calls and outer jumps.
pub struct Reflo<'a> {
    image: &'a Image,
    flos: BTreeMap<Address, Flo>,
    abandoned: BTreeSet<Address>,
}

impl<'a> Reflo<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            flos: BTreeMap::new(),
            abandoned: BTreeSet::new(),
        }
    }

    pub fn image(&self) -> &Image {
        self.image
    }

    pub fn flos(&self) -> &BTreeMap<Address, Flo> {
        &self.flos
    }

    pub fn flo_mut(&mut self, entry_point: Address) -> Option<&mut Flo> {
        self.flos.get_mut(&entry_point)
    }

    /// The flo whose disassembly contains `address`, if any.
    pub fn flo_by_address(&self, address: Address) -> Option<&Flo> {
        self.flos
            .range(..=address)
            .next_back()
            .map(|(_, flo)| flo)
            .filter(|flo| flo.disassembly().contains_key(&address))
    }

    /// Raw bounds `[lowest entry, end of highest instruction)` over all
    /// analyzed functions, as virtual addresses.
    pub fn analyzed_va_bounds(&self) -> Option<(u32, u32)> {
        let first = *self.flos.keys().next()?;
        let (last, instruction) = self
            .flos
            .values()
            .filter_map(|flo| flo.disassembly().iter().next_back())
            .max_by_key(|(&address, _)| address)?;
        let lo = self.image.raw_to_virtual(first).ok()?;
        let hi = self
            .image
            .raw_to_virtual(last + instruction.len() - 1)
            .ok()?
            + 1;
        Some((lo, hi))
    }

    /// Drains the worklist: each round analyzes the current frontier of
    /// unseen entry points in parallel, then queues every call and outer
    /// jump destination the round discovered.
    pub fn analyze(&mut self, pool: &rayon::ThreadPool) -> Result<()> {
        let mut frontier = vec![self.image.entry_point()];
        while !frontier.is_empty() {
            frontier.sort_unstable();
            frontier.dedup();
            frontier.retain(|entry| {
                !self.flos.contains_key(entry) && !self.abandoned.contains(entry)
            });

            let results: Vec<(Address, Result<Option<Flo>>)> = pool.install(|| {
                frontier
                    .par_iter()
                    .map(|&entry| (entry, self.create_flo(entry)))
                    .collect()
            });

            let mut next = Vec::new();
            for (entry, result) in results {
                match result {
                    Ok(Some(flo)) => {
                        next.extend(flo.calls().values().map(|call| call.dst));
                        next.extend(flo.outer_jumps().keys().copied());
                        self.flos.insert(entry, flo);
                    }
                    Ok(None) => {
                        self.abandoned.insert(entry);
                    }
                    Err(error) => return Err(error),
                }
            }
            next.retain(|&dst| self.image.section_bounds(dst).is_ok());
            frontier = next;
        }
        debug!(
            "discovered {} functions, {} abandoned",
            self.flos.len(),
            self.abandoned.len()
        );
        Ok(())
    }

    /// Builds one function's cfgraph. `Ok(None)` means the function was
    /// abandoned for an analysis-local reason.
    fn create_flo(&self, entry_point: Address) -> Result<Option<Flo>> {
        let mut flo = Flo::new(entry_point);
        loop {
            match self.fill_flo(&mut flo) {
                Ok(()) => {}
                // A decode failure on reachable code is fatal; running off
                // the section only abandons this function.
                Err(error)
                    if error
                        .downcast_ref::<Error>()
                        .is_some_and(|e| matches!(e, Error::Decode(_))) =>
                {
                    return Err(error);
                }
                Err(error) => {
                    warn!(
                        "abandoning function {:#010x}: {}",
                        self.va(entry_point),
                        error
                    );
                    return Ok(None);
                }
            }
            if flo.is_complete() {
                break;
            }
            if flo.unknown_jumps().is_empty() {
                // Nothing left to resolve: the function ends in an outer
                // jump instead of a RET.
                break;
            }
            self.resolve_incomplete(&mut flo)?;
        }
        if flo.disassembly().is_empty() {
            return Ok(None);
        }
        Ok(Some(flo))
    }

    /// Linear decode-and-step from where the walk last stopped.
    fn fill_flo(&self, flo: &mut Flo) -> Result<()> {
        let (begin, end) = self.image.section_bounds(flo.entry_point)?;
        let mut next = match flo.disassembly().iter().next_back() {
            // Re-analyzing the last instruction picks up promotions that a
            // merged sub-graph may have made possible.
            Some((&address, _)) => Some(address),
            None => Some(flo.entry_point),
        };
        while let Some(address) = next {
            if address < begin || address >= end {
                return Err(Error::RawAddressOutOfRange(address).into());
            }
            let instruction = self.decode(begin, end, address)?;
            flo.add_instruction(address, instruction);
            next = flo.analyze(None, address);
        }
        Ok(())
    }

    /// Resolves unknown jumps by speculatively disassembling from each
    /// destination. A sub-graph contiguous with the outer graph is merged
    /// back (the jump was inner after all); anything else proves the jump
    /// outer.
    fn resolve_incomplete(&self, flo: &mut Flo) -> Result<()> {
        while let Some((&dst, _)) = flo.unknown_jumps().iter().next() {
            let Ok((begin, end)) = self.image.section_bounds(dst) else {
                flo.promote_unknown_jump(dst, JumpType::Outer);
                continue;
            };
            let mut sub = Flo::new(dst);
            let mut next = Some(dst);
            let mut can_merge = false;
            while let Some(address) = next {
                if address < begin || address >= end {
                    break;
                }
                let Ok(instruction) = self.decode(begin, end, address) else {
                    // Speculative target was not code.
                    break;
                };
                sub.add_instruction(address, instruction);
                next = sub.analyze(Some(&mut *flo), address);
                if sub.can_merge_with(flo) {
                    can_merge = true;
                    break;
                }
            }
            if can_merge {
                flo.merge(sub);
                break;
            }
            flo.promote_unknown_jump(dst, JumpType::Outer);
        }
        Ok(())
    }

    fn decode(&self, begin: Address, end: Address, address: Address) -> Result<Instruction> {
        let mut decoder = Decoder::with_ip(
            64,
            &self.image.bytes()[begin..end],
            begin as u64,
            DecoderOptions::NONE,
        );
        decoder.set_position(address - begin)?;
        decoder.set_ip(address as u64);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(Error::Decode(self.va(address)).into());
        }
        Ok(instruction)
    }

    fn va(&self, address: Address) -> u32 {
        self.image.raw_to_virtual(address).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn analyze(code: &[u8]) -> (crate::binary::Image, BTreeMap<Address, Flo>) {
        let image = testutil::image_with_code(code).unwrap();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let mut reflo = Reflo::new(&image);
        reflo.analyze(&pool).unwrap();
        let flos = std::mem::take(&mut reflo.flos);
        (image, flos)
    }

    #[test]
    fn immediate_ret_is_one_complete_function() {
        // xor eax, eax; ret
        let (image, flos) = analyze(&[0x31, 0xC0, 0xC3]);
        assert_eq!(flos.len(), 1);
        let flo = &flos[&image.entry_point()];
        assert!(flo.has_ret);
        assert!(flo.is_complete());
        assert_eq!(flo.disassembly().len(), 2);
        assert!(flo.calls().is_empty());
        assert!(flo.inner_jumps().is_empty());
    }

    #[test]
    fn call_destinations_become_functions() {
        // entry: call +2; ret; pad; callee: xor eax, eax; ret
        let code = [
            0xE8, 0x02, 0x00, 0x00, 0x00, // call 0x1007
            0xC3, // ret
            0x90, // pad
            0x31, 0xC0, // xor eax, eax
            0xC3, // ret
        ];
        let (image, flos) = analyze(&code);
        assert_eq!(flos.len(), 2);
        let entry = image.entry_point();
        assert!(flos.contains_key(&entry));
        assert!(flos.contains_key(&(entry + 7)));
    }

    #[test]
    fn unknown_jump_resolves_by_merging_contiguous_subgraph() {
        // nop; jmp 0x405; int3; int3; ret
        let code = [0x90, 0xEB, 0x02, 0xCC, 0xCC, 0xC3];
        let (image, flos) = analyze(&code);
        let flo = &flos[&image.entry_point()];
        assert!(flo.is_complete());
        assert!(flo.inner_jumps().contains_key(&(image.entry_point() + 5)));
        // The int3 padding was never disassembled.
        assert!(!flo.disassembly().contains_key(&(image.entry_point() + 3)));
        assert!(flo.has_ret);
    }

    #[test]
    fn tail_jump_creates_sibling_function() {
        // entry: jmp +3 -> sibling; pad; sibling: xor eax, eax; ret
        let code = [0xEB, 0x03, 0xCC, 0xCC, 0xCC, 0x31, 0xC0, 0xC3];
        let (image, flos) = analyze(&code);
        assert_eq!(flos.len(), 2);
        let entry_flo = &flos[&image.entry_point()];
        assert!(!entry_flo.has_ret);
        assert!(entry_flo.outer_jumps().contains_key(&(image.entry_point() + 5)));
        assert!(flos[&(image.entry_point() + 5)].has_ret);
    }

    #[test]
    fn analyzed_bounds_cover_all_functions() {
        let code = [0xE8, 0x02, 0x00, 0x00, 0x00, 0xC3, 0x90, 0x31, 0xC0, 0xC3];
        let image = testutil::image_with_code(&code).unwrap();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let mut reflo = Reflo::new(&image);
        reflo.analyze(&pool).unwrap();
        let (lo, hi) = reflo.analyzed_va_bounds().unwrap();
        assert_eq!(lo, testutil::CODE_VA);
        assert_eq!(hi, testutil::CODE_VA + code.len() as u32);
    }
}
