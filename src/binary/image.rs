use std::path::Path;

use anyhow::{Context, Result};
use goblin::pe::header::COFF_MACHINE_X86_64;
use goblin::pe::PE;

use crate::error::Error;
use crate::Address;

/// A section header, reduced to the fields address translation needs.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
}

/// The loaded PE image: raw file bytes plus the section table indexed both
/// by virtual address and by raw file offset.
///
/// Throughout the analysis an [`Address`] is a raw offset into `bytes`;
/// virtual addresses appear only at the display boundary.
pub struct Image {
    bytes: Vec<u8>,
    sections: Vec<Section>,
    // Section indices ordered for upper-bound lookup.
    by_va: Vec<usize>,
    by_raw: Vec<usize>,
    entry_point: Address,
}

impl Image {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())
            .with_context(|| format!("failed to read file: {}", path.as_ref().display()))?;
        Self::parse(bytes)
    }

    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let pe = PE::parse(&bytes).map_err(Error::Pe)?;
        let machine = pe.header.coff_header.machine;
        if machine != COFF_MACHINE_X86_64 {
            return Err(Error::UnsupportedMachine(machine).into());
        }

        let sections: Vec<Section> = pe
            .sections
            .iter()
            .map(|s| Section {
                name: s.name().unwrap_or_default().to_string(),
                virtual_address: s.virtual_address,
                virtual_size: s.virtual_size,
                pointer_to_raw_data: s.pointer_to_raw_data,
                size_of_raw_data: s.size_of_raw_data,
            })
            .collect();

        let mut by_va: Vec<usize> = (0..sections.len()).collect();
        by_va.sort_by_key(|&i| sections[i].virtual_address);
        let mut by_raw: Vec<usize> = (0..sections.len()).collect();
        by_raw.sort_by_key(|&i| sections[i].pointer_to_raw_data);

        let entry_va = pe.entry as u32;
        let mut image = Self {
            bytes,
            sections,
            by_va,
            by_raw,
            entry_point: 0,
        };
        image.entry_point = image.virtual_to_raw(entry_va)?;
        Ok(image)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Raw offset of the entry point instruction.
    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    fn section_by_va(&self, va: u32) -> Result<&Section, Error> {
        let upper = self
            .by_va
            .partition_point(|&i| self.sections[i].virtual_address <= va);
        if upper == 0 {
            return Err(Error::VirtualAddressOutOfRange(va));
        }
        let section = &self.sections[self.by_va[upper - 1]];
        if va >= section.virtual_address + section.virtual_size.max(section.size_of_raw_data) {
            return Err(Error::VirtualAddressOutOfRange(va));
        }
        Ok(section)
    }

    fn section_by_raw(&self, addr: Address) -> Result<&Section, Error> {
        let upper = self
            .by_raw
            .partition_point(|&i| self.sections[i].pointer_to_raw_data as Address <= addr);
        if upper == 0 {
            return Err(Error::RawAddressOutOfRange(addr));
        }
        let section = &self.sections[self.by_raw[upper - 1]];
        if addr >= (section.pointer_to_raw_data + section.size_of_raw_data) as Address {
            return Err(Error::RawAddressOutOfRange(addr));
        }
        Ok(section)
    }

    pub fn virtual_to_raw(&self, va: u32) -> Result<Address, Error> {
        let section = self.section_by_va(va)?;
        Ok((va - section.virtual_address + section.pointer_to_raw_data) as Address)
    }

    pub fn raw_to_virtual(&self, addr: Address) -> Result<u32, Error> {
        let section = self.section_by_raw(addr)?;
        Ok(addr as u32 - section.pointer_to_raw_data + section.virtual_address)
    }

    /// Raw `[begin, end)` bounds of the section containing `addr`.
    pub fn section_bounds(&self, addr: Address) -> Result<(Address, Address), Error> {
        let section = self.section_by_raw(addr)?;
        let begin = section.pointer_to_raw_data as Address;
        Ok((begin, begin + section.size_of_raw_data as Address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn parses_minimal_pe() {
        let image = testutil::image_with_code(&[0x31, 0xC0, 0xC3]).unwrap();
        assert_eq!(image.entry_point(), testutil::CODE_RAW as Address);
        assert_eq!(image.bytes()[image.entry_point()], 0x31);
    }

    #[test]
    fn translates_between_va_and_raw() {
        let image = testutil::image_with_code(&[0xC3]).unwrap();
        let raw = image.virtual_to_raw(testutil::CODE_VA).unwrap();
        assert_eq!(raw, testutil::CODE_RAW as Address);
        assert_eq!(image.raw_to_virtual(raw).unwrap(), testutil::CODE_VA);
    }

    #[test]
    fn rejects_addresses_outside_sections() {
        let image = testutil::image_with_code(&[0xC3]).unwrap();
        assert!(image.virtual_to_raw(0).is_err());
        assert!(image.raw_to_virtual(0).is_err());
        assert!(image.section_bounds(usize::MAX).is_err());
    }

    #[test]
    fn rejects_non_amd64() {
        let mut bytes = testutil::build_pe(&[0xC3]);
        // Patch the COFF machine field to i386.
        let pe_offset = u32::from_le_bytes(bytes[0x3C..0x40].try_into().unwrap()) as usize;
        bytes[pe_offset + 4..pe_offset + 6].copy_from_slice(&0x014Cu16.to_le_bytes());
        assert!(Image::parse(bytes).is_err());
    }

    #[test]
    fn section_bounds_cover_code() {
        let image = testutil::image_with_code(&[0x90, 0x90, 0xC3]).unwrap();
        let (begin, end) = image.section_bounds(image.entry_point()).unwrap();
        assert!(begin <= image.entry_point());
        assert!(end > image.entry_point() + 2);
    }
}
