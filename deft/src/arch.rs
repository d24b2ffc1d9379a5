use crate::apply::DynRelWriter;
use crate::context::Context;
use crate::elf::DynamicRelocationKind;
use crate::elf::Rel;
use crate::error::Result;
use crate::layout::InputFile;
use crate::layout::InputSection;
use crate::layout::OutputSection;
use crate::layout::Thunk;
use crate::symbol::Symbol;
use crate::symbol::SymbolId;
use anyhow::bail;
use object::elf::EM_ARM;
use object::elf::EM_PPC64;
use std::borrow::Cow;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Arm32,
    Ppc64V2,
}

impl TryFrom<u16> for Architecture {
    type Error = crate::error::Error;

    fn try_from(arch: u16) -> Result<Self, Self::Error> {
        match arch {
            EM_ARM => Ok(Self::Arm32),
            EM_PPC64 => Ok(Self::Ppc64V2),
            _ => bail!("Unsupported architecture: 0x{:x}", arch),
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arch = match self {
            Architecture::Arm32 => "arm32",
            Architecture::Ppc64V2 => "ppc64le",
        };
        write!(f, "{arch}")
    }
}

/// One relocation back-end. The relocation-type numbering is private to each
/// architecture, so everything here dispatches on the raw `u32` and no
/// attempt is made to unify the two sets.
pub trait Arch {
    /// Bytes per address-sized word, which is also the GOT entry size.
    const WORD_BYTES: u64;

    /// Size of one record in `.rel.dyn`: `Elf32_Rel` or `Elf64_Rela`.
    const DYNREL_SIZE: u64;

    /// Whether dynamic relocations carry explicit addends. When they don't,
    /// the addend lives in the relocated field and must always be written.
    const IS_RELA: bool;

    const PLT_HDR_SIZE: u64;
    const PLT_ENTRY_SIZE: u64;
    const PLTGOT_ENTRY_SIZE: u64;

    const THUNK_SIZE: u64;
    const THUNK_HDR_SIZE: u64;

    /// Offset the dynamic thread vector points past the start of each
    /// module's TLS block.
    const TLS_DTV_OFFSET: u64;

    fn elf_header_arch_magic() -> u16;

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str>;

    fn dynamic_rel_type(kind: DynamicRelocationKind) -> u32;

    /// Encodes one dynamic relocation record. REL-format architectures ignore
    /// `addend`; it lives in the relocated field instead.
    fn write_dynrel(out: &mut [u8], place: u64, r_type: u32, dynsym: u32, addend: i64);

    /// Walks an allocated section's relocations, flagging referenced symbols
    /// with the dynamic metadata they need. Returns the number of dynamic
    /// relocations the section will emit when applied.
    fn scan_section(
        ctx: &Context,
        file_name: &str,
        symbols: &[SymbolId],
        section: &InputSection,
    ) -> Result<u32>;

    /// Patches an allocated section whose raw bytes have already been copied
    /// to `out`, pushing dynamic relocations through `dynrel` as the policy
    /// tables dictate.
    fn apply_alloc(
        ctx: &Context,
        file: &InputFile,
        section: &InputSection,
        out: &mut [u8],
        dynrel: &mut DynRelWriter,
    ) -> Result;

    /// Patches a non-allocated (debug) section. Only data-form relocations
    /// are valid here, and references to discarded targets get tombstones.
    fn apply_nonalloc(
        ctx: &Context,
        file: &InputFile,
        section: &InputSection,
        out: &mut [u8],
    ) -> Result;

    fn write_plt_header(ctx: &Context, out: &mut [u8]);

    fn write_plt_entry(ctx: &Context, out: &mut [u8], sym: &Symbol);

    fn write_pltgot_entry(ctx: &Context, out: &mut [u8], sym: &Symbol);

    /// Materializes one range-extension thunk. `out` covers the thunk's
    /// header (if any) and all of its entries.
    fn write_thunk(ctx: &Context, osec: &OutputSection, thunk: &Thunk, out: &mut [u8]) -> Result;

    /// Applies a relocation inside `.eh_frame`, whose records the surrounding
    /// linker rewrites itself. `value` is the already-resolved S + A.
    fn apply_eh_frame_reloc(
        ctx: &Context,
        rel: &Rel,
        section_addr: u64,
        offset: u64,
        value: u64,
        loc: &mut [u8],
    ) -> Result;
}
