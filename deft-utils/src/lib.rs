//! Low-level primitives shared by the deft back-ends: bit manipulation,
//! little-endian field access and per-architecture instruction encoders.
//! Nothing in this crate knows about symbols, sections or layout.

pub mod arm32;
pub mod bit_misc;
pub mod elf;
pub mod ppc64;
