pub mod binary;
pub mod context;
pub mod coverage;
pub mod dumper;
pub mod error;
pub mod flo;
pub mod recontex;
pub mod reflo;
pub mod restruc;
pub mod struc;
pub mod virt;

#[cfg(test)]
pub(crate) mod testutil;

/// Raw offset into the loaded image's file bytes; doubles as the identity of
/// the instruction decoded there.
pub type Address = usize;
