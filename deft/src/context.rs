//! The read-only view of link state the engine runs against. The surrounding
//! linker builds all of this (resolution, layout, table sizing); the engine
//! contributes symbol capability flags, `.rel.dyn` cursors and output bytes.

use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::layout::Fragment;
use crate::layout::OutputSection;
use crate::layout::SectionLayout;
use crate::symbol::Symbol;
use crate::symbol::SymbolId;
use anyhow::Context as _;
use std::sync::atomic::AtomicBool;

/// What kind of output file is being produced. This picks the row in the
/// absolute/PC-relative relocation policy tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    SharedObject,
    PositionIndependentExecutable,
    PositionDependentExecutable,
}

impl OutputKind {
    #[must_use]
    pub fn is_shared_object(self) -> bool {
        matches!(self, OutputKind::SharedObject)
    }

    #[must_use]
    pub fn is_executable(self) -> bool {
        !self.is_shared_object()
    }

    pub(crate) fn policy_row(self) -> usize {
        match self {
            OutputKind::SharedObject => 0,
            OutputKind::PositionIndependentExecutable => 1,
            OutputKind::PositionDependentExecutable => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub output_kind: OutputKind,

    /// Pre-apply dynamic relocations to the output image as well as emitting
    /// them. REL-format architectures always apply them, since that's where
    /// the addend lives.
    pub apply_dynamic_relocs: bool,

    /// Whether copy relocations may be used to resolve direct references to
    /// data in shared objects (`-z copyreloc`).
    pub allow_copy_relocs: bool,

    /// Whether TLS descriptors against non-imported symbols may be relaxed
    /// to their static form in executables.
    pub relax_tlsdesc: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            output_kind: OutputKind::PositionDependentExecutable,
            apply_dynamic_relocs: true,
            allow_copy_relocs: true,
            relax_tlsdesc: true,
        }
    }
}

pub struct Context {
    pub options: LinkOptions,

    pub symbols: Vec<Symbol>,
    pub fragments: Vec<Fragment>,
    pub output_sections: Vec<OutputSection>,

    pub got: SectionLayout,
    pub gotplt: SectionLayout,
    pub plt: SectionLayout,
    pub pltgot: SectionLayout,
    pub reldyn: Option<SectionLayout>,

    /// Symbols with `.plt` / `.plt.got` entries, in slot order.
    pub plt_symbols: Vec<SymbolId>,
    pub pltgot_symbols: Vec<SymbolId>,

    /// GOT slot of the single per-module TLSLD (module id, 0) pair, if the
    /// scan phase requested one.
    pub tlsld_got_idx: Option<u32>,

    /// PPC64 TOC pointer value: the address of `.got` plus 0x8000.
    pub toc_value: u64,

    /// Start of the TLS initialization image.
    pub tls_begin: u64,

    /// The thread pointer value, from which `TPREL` offsets are measured.
    pub tp_addr: u64,

    /// Set during scanning when any section uses local-dynamic TLS. Written
    /// with relaxed stores: many writers, same value.
    pub needs_tlsld: AtomicBool,

    pub diagnostics: Diagnostics,
}

impl Context {
    pub fn new(options: LinkOptions) -> Self {
        Self {
            options,
            symbols: Vec::new(),
            fragments: Vec::new(),
            output_sections: Vec::new(),
            got: SectionLayout::default(),
            gotplt: SectionLayout::default(),
            plt: SectionLayout::default(),
            pltgot: SectionLayout::default(),
            reldyn: None,
            plt_symbols: Vec::new(),
            pltgot_symbols: Vec::new(),
            tlsld_got_idx: None,
            toc_value: 0,
            tls_begin: 0,
            tp_addr: 0,
            needs_tlsld: AtomicBool::new(false),
            diagnostics: Diagnostics::new(),
        }
    }

    /// Resolves a relocation's symbol index through the owning file's symbol
    /// list.
    pub fn symbol_from(&self, file_symbols: &[SymbolId], local_index: u32) -> Result<&Symbol> {
        let id = file_symbols
            .get(local_index as usize)
            .with_context(|| format!("Relocation references out-of-range symbol index {local_index}"))?;
        Ok(&self.symbols[id.as_usize()])
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.as_usize()]
    }

    /// Address of the TLSLD (module id, 0) GOT pair.
    pub fn tlsld_addr(&self, word_bytes: u64) -> u64 {
        let idx = self
            .tlsld_got_idx
            .expect("local-dynamic TLS was used, but no TLSLD GOT slot was allocated");
        self.got.address + u64::from(idx) * word_bytes
    }

    /// Address of the process-wide TLSDESC trampoline, which sits at the head
    /// of the first thunk area (ARM32 only).
    pub fn tls_trampoline_addr(&self) -> u64 {
        self.output_sections
            .iter()
            .find_map(|osec| {
                osec.thunks
                    .first()
                    .map(|thunk| osec.layout.address + thunk.offset)
            })
            .expect("TLSDESC call with no thunk area to host the TLS trampoline")
    }

    /// Whether a TLS descriptor against `sym` can be relaxed to a static
    /// TP-relative value.
    pub fn relax_tlsdesc(&self, sym: &Symbol) -> bool {
        self.options.relax_tlsdesc
            && self.options.output_kind.is_executable()
            && !sym.is_imported
    }
}
