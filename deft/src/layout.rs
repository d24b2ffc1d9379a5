//! The layout products the engine consumes: input sections with their
//! relocation lists, output sections with their final addresses, and the
//! range-extension thunks that layout reserved space for.

use crate::arch::Arch;
use crate::elf::Rel;
use crate::error::Result;
use crate::symbol::SymbolId;
use anyhow::Context as _;
use deft_utils::elf::SectionFlags;
use deft_utils::elf::shf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u32);

impl FileId {
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSectionId(u32);

impl OutputSectionId {
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId(u32);

impl FragmentId {
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Where an output section (or synthetic table) landed: its virtual address
/// and its offset/length in the output file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionLayout {
    pub address: u64,
    pub file_offset: u64,
    pub size: u64,
}

impl SectionLayout {
    pub fn new(address: u64, file_offset: u64, size: u64) -> Self {
        Self {
            address,
            file_offset,
            size,
        }
    }
}

/// An input object file: its symbol list (mapping relocation symbol indices
/// to the global symbol table) and the sections it contributes.
#[derive(Debug)]
pub struct InputFile {
    pub name: String,
    pub symbols: Vec<SymbolId>,
    pub sections: Vec<InputSection>,

    /// Total number of dynamic relocations this file's sections will emit.
    /// Produced by the scan phase.
    pub num_dynrel: u32,

    /// Byte offset of this file's slice of `.rel.dyn`, assigned once all
    /// files have been scanned. Slices of different files are disjoint.
    pub reldyn_offset: u64,
}

impl InputFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: Vec::new(),
            sections: Vec::new(),
            num_dynrel: 0,
            reldyn_offset: 0,
        }
    }
}

/// Points a branch relocation at its entry in a range-extension thunk.
#[derive(Debug, Clone, Copy)]
pub struct ThunkRef {
    pub thunk_idx: u32,
    pub sym_idx: u32,
}

/// A reference into a merged section: the fragment the relocation's target
/// was folded into and the addend relative to it.
#[derive(Debug, Clone, Copy)]
pub struct MergedRef {
    pub fragment: FragmentId,
    pub addend: i64,
}

/// A fragment of a merged section (string deduplication output). Dead
/// fragments drive tombstone writes in non-allocated sections.
#[derive(Debug, Clone, Copy)]
pub struct Fragment {
    pub address: u64,
    pub is_alive: bool,
}

#[derive(Debug)]
pub struct InputSection {
    pub name: String,
    pub flags: SectionFlags,
    pub output_section: OutputSectionId,

    /// Position within the output section. The section's bytes have already
    /// been copied there when the apply phase runs.
    pub offset: u64,
    pub size: u64,

    pub rels: Vec<Rel>,

    /// Per-relocation thunk assignments, parallel to `rels`. Left empty when
    /// layout decided no branch in this section can overflow.
    pub range_extn: Vec<Option<ThunkRef>>,

    /// Per-relocation merged-fragment references, parallel to `rels`. Left
    /// empty for sections that don't reference merged data.
    pub merged_refs: Vec<Option<MergedRef>>,

    /// Byte offset of this section's dynamic relocations within the owning
    /// file's `.rel.dyn` slice. Produced by the scan phase.
    pub reldyn_offset: u64,

    /// Number of dynamic relocations this section emits. Produced by the
    /// scan phase.
    pub num_dynrel: u32,
}

impl InputSection {
    pub fn new(name: impl Into<String>, flags: SectionFlags, output_section: OutputSectionId) -> Self {
        Self {
            name: name.into(),
            flags,
            output_section,
            offset: 0,
            size: 0,
            rels: Vec::new(),
            range_extn: Vec::new(),
            merged_refs: Vec::new(),
            reldyn_offset: 0,
            num_dynrel: 0,
        }
    }

    #[must_use]
    pub fn is_alloc(&self) -> bool {
        self.flags.contains(shf::ALLOC)
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(shf::WRITE)
    }

    pub fn thunk_ref(&self, rel_index: usize) -> Option<ThunkRef> {
        self.range_extn.get(rel_index).copied().flatten()
    }

    pub fn merged_ref(&self, rel_index: usize) -> Option<MergedRef> {
        self.merged_refs.get(rel_index).copied().flatten()
    }

    /// The section bytes starting at the relocation site.
    pub fn loc_mut<'out>(&self, out: &'out mut [u8], rel: &Rel) -> Result<&'out mut [u8]> {
        out.get_mut(rel.offset as usize..).with_context(|| {
            format!(
                "Relocation offset 0x{:x} is outside section `{}`",
                rel.offset, self.name
            )
        })
    }
}

/// A range-extension thunk reserved by layout: one stub per target symbol,
/// materialized by the thunk writer after addresses are final.
#[derive(Debug)]
pub struct Thunk {
    /// Byte offset of the thunk within its output section.
    pub offset: u64,
    pub symbols: Vec<SymbolId>,
}

impl Thunk {
    pub fn new(offset: u64, symbols: Vec<SymbolId>) -> Self {
        Self { offset, symbols }
    }

    pub fn size_in_bytes<A: Arch>(&self) -> u64 {
        A::THUNK_HDR_SIZE + self.symbols.len() as u64 * A::THUNK_SIZE
    }
}

#[derive(Debug)]
pub struct OutputSection {
    pub name: String,
    pub sh_type: u32,
    pub layout: SectionLayout,
    pub thunks: Vec<Thunk>,
}

impl OutputSection {
    pub fn new(name: impl Into<String>, sh_type: u32, layout: SectionLayout) -> Self {
        Self {
            name: name.into(),
            sh_type,
            layout,
            thunks: Vec::new(),
        }
    }

    /// The address of thunk entry `sym_idx` within thunk `thunk_idx`.
    pub fn thunk_entry_addr<A: Arch>(&self, r: ThunkRef) -> u64 {
        let thunk = &self.thunks[r.thunk_idx as usize];
        self.layout.address
            + thunk.offset
            + A::THUNK_HDR_SIZE
            + u64::from(r.sym_idx) * A::THUNK_SIZE
    }
}
