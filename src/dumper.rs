use std::fmt::Write;

use iced_x86::{Formatter, Instruction, NasmFormatter};

use crate::binary::Image;
use crate::flo::Flo;
use crate::virt::Value;

/// Renders disassembly and abstract values for the debug dumps.
pub struct Dumper {
    formatter: NasmFormatter,
    buffer: String,
}

impl Dumper {
    pub fn new() -> Self {
        Self {
            formatter: NasmFormatter::new(),
            buffer: String::new(),
        }
    }

    pub fn dump_flo(&mut self, out: &mut String, image: &Image, flo: &Flo) {
        let entry_va = image.raw_to_virtual(flo.entry_point).unwrap_or_default();
        let _ = writeln!(out, "{:08x}:", entry_va);
        for (&address, instruction) in flo.disassembly() {
            let va = image.raw_to_virtual(address).unwrap_or_default();
            self.dump_instruction(out, va, instruction);
        }
        out.push('\n');
    }

    pub fn dump_instruction(&mut self, out: &mut String, va: u32, instruction: &Instruction) {
        self.buffer.clear();
        self.formatter.format(instruction, &mut self.buffer);
        let _ = writeln!(out, "{:08x}    {}", va, self.buffer);
    }

    pub fn dump_value(out: &mut String, value: &Value) {
        if value.is_symbolic() {
            let symbol = value.symbol();
            let _ = write!(out, "[{:016x}+{:04x}]", symbol.id(), symbol.offset());
        } else {
            let _ = write!(out, " {:016x}      ", value.value());
        }
    }
}

impl Default for Dumper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::{IdGen, Value};

    #[test]
    fn values_render_as_concrete_or_symbolic() {
        let mut out = String::new();
        Dumper::dump_value(&mut out, &Value::concrete(None, 0x1234));
        assert!(out.contains("0000000000001234"));

        let ids = IdGen::default();
        let mut out = String::new();
        Dumper::dump_value(&mut out, &Value::fresh(&ids, 0usize, 8));
        assert!(out.starts_with('['));
        assert!(out.ends_with(']'));
    }

    #[test]
    fn instructions_render_with_va_column() {
        use iced_x86::{Decoder, DecoderOptions};
        let mut decoder = Decoder::with_ip(64, &[0x31, 0xC0], 0x1000, DecoderOptions::NONE);
        let instruction = decoder.decode();
        let mut dumper = Dumper::new();
        let mut out = String::new();
        dumper.dump_instruction(&mut out, 0x1000, &instruction);
        assert!(out.starts_with("00001000    "));
        assert!(out.contains("eax"));
    }
}
