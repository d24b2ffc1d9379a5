use crate::arch::Arch;
use crate::context::Context;
use crate::layout::FileId;
use bitflags::bitflags;
use std::sync::atomic;
use std::sync::atomic::AtomicU16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Capability bits recorded against each symbol while scanning
    /// relocations. They tell the surrounding linker what dynamic metadata
    /// (GOT slots, PLT entries, copy relocations) to allocate before the
    /// apply phase runs. Bits are only ever set, never cleared, and are final
    /// once scanning completes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SymbolFlags: u16 {
        /// A GOT entry holding the symbol's address is needed.
        const NEEDS_GOT = 1 << 0;

        /// A PLT entry is needed.
        const NEEDS_PLT = 1 << 1;

        /// A canonical PLT entry is needed: the address of the PLT stub
        /// becomes the symbol's address, so that function pointers compare
        /// equal across modules.
        const NEEDS_CPLT = 1 << 2;

        /// The symbol's data has to be copied out of the shared object that
        /// defines it.
        const NEEDS_COPYREL = 1 << 3;

        /// A GOT entry holding the symbol's TP-relative offset is needed
        /// (initial-exec TLS).
        const NEEDS_GOTTP = 1 << 4;

        /// A pair of GOT entries for the general-dynamic TLS model is needed.
        const NEEDS_TLSGD = 1 << 5;

        /// A pair of GOT entries holding a TLS descriptor is needed.
        const NEEDS_TLSDESC = 1 << 6;
    }
}

/// [`SymbolFlags`] with atomic bit-OR updates, so that the scan phase can run
/// across input files in parallel. All stores are monotone set-once bit sets,
/// which is why relaxed ordering suffices.
pub struct AtomicSymbolFlags {
    value: AtomicU16,
}

impl AtomicSymbolFlags {
    pub fn empty() -> Self {
        Self {
            value: AtomicU16::new(0),
        }
    }

    pub fn get(&self) -> SymbolFlags {
        SymbolFlags::from_bits_retain(self.value.load(atomic::Ordering::Relaxed))
    }

    pub fn or_assign(&self, flags: SymbolFlags) {
        // fetch_or needs exclusive access to the cache line holding the
        // atomic. Most relocations reference symbols whose bits are already
        // set, so check first and skip the write when there's nothing to do.
        let current_bits = self.value.load(atomic::Ordering::Relaxed);
        if current_bits & flags.bits() == flags.bits() {
            return;
        }
        self.value.fetch_or(flags.bits(), atomic::Ordering::Relaxed);
    }
}

impl std::fmt::Debug for AtomicSymbolFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.get(), f)
    }
}

/// A resolved symbol. Resolution, visibility processing and address
/// assignment all happen in the surrounding linker; the engine reads the
/// result and contributes only the capability flags.
#[derive(Debug)]
pub struct Symbol {
    pub name: String,

    /// The file that defines the symbol. `None` for unresolved references,
    /// which the scanner reports as undefined-symbol errors.
    pub file: Option<FileId>,

    /// Final virtual address. On ARM32 the low bit is set for Thumb
    /// functions; it is an attribute of the value and is never written to the
    /// output machine code.
    pub value: u64,

    /// `st_type` from the defining symbol table entry.
    pub st_type: u8,

    pub is_imported: bool,
    pub is_absolute: bool,

    /// An undefined weak symbol that stayed undefined and didn't get a
    /// dynamic symbol either. Branches to it are rewritten to fall through.
    pub is_weak_undef: bool,

    /// The defining section was discarded, so non-allocated references to
    /// this symbol get a tombstone value.
    pub origin_dead: bool,

    /// The three-bit st_other field of PPC64 symbols, encoding the distance
    /// between the global and local entry points.
    pub ppc_local_entry: u8,

    /// Index in `.dynsym`, for symbols that have one.
    pub dynsym_idx: u32,

    pub got_idx: Option<u32>,
    pub gotplt_idx: Option<u32>,
    pub plt_idx: Option<u32>,
    pub pltgot_idx: Option<u32>,
    pub gottp_idx: Option<u32>,
    pub tlsgd_idx: Option<u32>,
    pub tlsdesc_idx: Option<u32>,

    pub flags: AtomicSymbolFlags,
}

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: None,
            value: 0,
            st_type: object::elf::STT_NOTYPE,
            is_imported: false,
            is_absolute: false,
            is_weak_undef: false,
            origin_dead: false,
            ppc_local_entry: 0,
            dynsym_idx: 0,
            got_idx: None,
            gotplt_idx: None,
            plt_idx: None,
            pltgot_idx: None,
            gottp_idx: None,
            tlsgd_idx: None,
            tlsdesc_idx: None,
            flags: AtomicSymbolFlags::empty(),
        }
    }

    #[must_use]
    pub fn is_ifunc(&self) -> bool {
        self.st_type == object::elf::STT_GNU_IFUNC
    }

    #[must_use]
    pub fn has_got(&self) -> bool {
        self.got_idx.is_some()
    }

    #[must_use]
    pub fn has_plt(&self) -> bool {
        self.plt_idx.is_some() || self.pltgot_idx.is_some()
    }

    #[must_use]
    pub fn has_tlsdesc(&self) -> bool {
        self.tlsdesc_idx.is_some()
    }

    pub fn got_addr<A: Arch>(&self, ctx: &Context) -> u64 {
        ctx.got.address + u64::from(self.expect_slot(self.got_idx, "GOT")) * A::WORD_BYTES
    }

    pub fn gotplt_addr<A: Arch>(&self, ctx: &Context) -> u64 {
        ctx.gotplt.address + u64::from(self.expect_slot(self.gotplt_idx, ".got.plt")) * A::WORD_BYTES
    }

    /// The address of the symbol's PLT stub: either a regular `.plt` entry or
    /// a `.plt.got` entry for symbols that only need the GOT form.
    pub fn plt_addr<A: Arch>(&self, ctx: &Context) -> u64 {
        if let Some(idx) = self.plt_idx {
            ctx.plt.address + A::PLT_HDR_SIZE + u64::from(idx) * A::PLT_ENTRY_SIZE
        } else {
            ctx.pltgot.address
                + u64::from(self.expect_slot(self.pltgot_idx, ".plt.got")) * A::PLTGOT_ENTRY_SIZE
        }
    }

    pub fn gottp_addr<A: Arch>(&self, ctx: &Context) -> u64 {
        ctx.got.address + u64::from(self.expect_slot(self.gottp_idx, "GOT-TP")) * A::WORD_BYTES
    }

    pub fn tlsgd_addr<A: Arch>(&self, ctx: &Context) -> u64 {
        ctx.got.address + u64::from(self.expect_slot(self.tlsgd_idx, "TLSGD")) * A::WORD_BYTES
    }

    pub fn tlsdesc_addr<A: Arch>(&self, ctx: &Context) -> u64 {
        ctx.got.address + u64::from(self.expect_slot(self.tlsdesc_idx, "TLSDESC")) * A::WORD_BYTES
    }

    #[track_caller]
    fn expect_slot(&self, slot: Option<u32>, kind: &str) -> u32 {
        slot.unwrap_or_else(|| {
            panic!(
                "Symbol `{}` has no {kind} slot, but one was promised by the scan phase",
                self.name
            )
        })
    }
}
