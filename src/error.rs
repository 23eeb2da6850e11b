use crate::Address;

/// Errors that abort the run or a single function's recovery.
///
/// `UnsupportedMachine` and `Pe` surface at the top level before any analysis
/// starts. Address-translation failures are analysis-local: the function that
/// tripped them is abandoned and the rest of the run continues.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported machine type {0:#06x}, expected AMD64")]
    UnsupportedMachine(u16),

    #[error("virtual address {0:#010x} outside any section")]
    VirtualAddressOutOfRange(u32),

    #[error("raw address {0:#x} outside any section")]
    RawAddressOutOfRange(Address),

    #[error("instruction decode failed at {0:#010x}")]
    Decode(u32),

    #[error(transparent)]
    Pe(#[from] goblin::error::Error),
}
