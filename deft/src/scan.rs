//! The relocation scan phase.
//!
//! Scanning walks every allocated input section's relocations and records,
//! against each referenced symbol, what dynamic metadata the apply phase will
//! need: GOT slots, PLT entries, TLS slots, copy relocations. It also counts
//! the dynamic relocations each section will emit so that `.rel.dyn` can be
//! sized and partitioned before applying starts.
//!
//! Absolute and PC-relative data relocations don't map to a single decision;
//! what to do depends on the kind of output being produced and on where the
//! symbol lives. Those classes are driven by small policy tables indexed by
//! output kind and symbol kind.

use crate::arch::Arch;
use crate::context::Context;
use crate::elf::Rel;
use crate::error::Result;
use crate::layout::InputFile;
use crate::layout::InputSection;
use crate::symbol::Symbol;
use crate::symbol::SymbolFlags;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::borrow::Cow;

/// What the policy tables tell us to do with one absolute or PC-relative
/// relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    /// The value is a link-time constant; nothing to record.
    None,

    /// The relocation cannot be represented in this kind of output.
    Error,

    /// Resolve by copying the symbol's data into the output.
    CopyRel,

    /// Like `CopyRel`, but fall back to a dynamic relocation when the section
    /// is writable anyway (or copy relocations are disabled).
    DynCopyRel,

    /// A PLT entry resolves the reference.
    Plt,

    /// A canonical PLT entry: its address becomes the symbol's address.
    CanonicalPlt,

    /// Like `CanonicalPlt`, but emit a dynamic relocation when the section is
    /// writable anyway.
    DynCanonicalPlt,

    /// Emit a symbolic dynamic relocation.
    DynRel,

    /// Emit a base-relative dynamic relocation.
    BaseRel,

    /// The symbol is an ifunc; emit an irelative dynamic relocation.
    IfuncDynRel,
}

pub type PolicyTable = [[ScanAction; 4]; 3];

/// Decision table for address-sized absolute relocations (`R_ARM_ABS32`,
/// `R_PPC64_ADDR64`). These can always be punted to the dynamic loader, so
/// position-independent output prefers a dynamic relocation over an error.
pub const DYN_ABSREL_TABLE: PolicyTable = {
    use ScanAction::*;
    [
        // Absolute  Local    Imported data  Imported code
        [None, BaseRel, DynRel, DynRel],           // Shared object
        [None, BaseRel, DynRel, DynRel],           // Position-independent exec
        [None, None, DynCopyRel, DynCanonicalPlt], // Position-dependent exec
    ]
};

/// Decision table for absolute relocations narrower than a pointer
/// (`R_ARM_MOVT_ABS` and friends). The dynamic loader can't relocate a
/// partial field, so position-independent output has to reject these.
pub const ABSREL_TABLE: PolicyTable = {
    use ScanAction::*;
    [
        // Absolute  Local    Imported data  Imported code
        [None, Error, Error, Error],         // Shared object
        [None, Error, Error, Error],         // Position-independent exec
        [None, None, CopyRel, CanonicalPlt], // Position-dependent exec
    ]
};

/// Decision table for PC-relative data relocations. The value is a link-time
/// constant as long as the target stays within the same module.
pub const PCREL_TABLE: PolicyTable = {
    use ScanAction::*;
    [
        // Absolute  Local    Imported data  Imported code
        [Error, None, Error, Plt],            // Shared object
        [Error, None, CopyRel, Plt],          // Position-independent exec
        [Error, None, CopyRel, CanonicalPlt], // Position-dependent exec
    ]
};

pub(crate) fn get_rel_action(ctx: &Context, sym: &Symbol, table: &PolicyTable) -> ScanAction {
    let column = if sym.is_absolute {
        0
    } else if !sym.is_imported {
        1
    } else if sym.st_type != object::elf::STT_FUNC {
        2
    } else {
        3
    };
    table[ctx.options.output_kind.policy_row()][column]
}

/// Like [`get_rel_action`], but for address-sized absolute relocations. An
/// ifunc can't be referenced directly: the slot gets an irelative dynamic
/// relocation no matter what the table says. The override lives here, and
/// not in the narrow/PC-relative paths, because only address-sized slots can
/// hold one.
pub(crate) fn get_absrel_action(ctx: &Context, sym: &Symbol, table: &PolicyTable) -> ScanAction {
    if sym.is_ifunc() {
        return ScanAction::IfuncDynRel;
    }
    get_rel_action(ctx, sym, table)
}

/// Per-section scan state shared by the architecture back-ends.
pub(crate) struct SectionScan<'a> {
    ctx: &'a Context,
    file_name: &'a str,
    section_name: &'a str,
    writable: bool,
    rel_name: fn(u32) -> Cow<'static, str>,
    pub(crate) num_dynrel: u32,
}

impl<'a> SectionScan<'a> {
    pub(crate) fn new(
        ctx: &'a Context,
        file_name: &'a str,
        section: &'a InputSection,
        rel_name: fn(u32) -> Cow<'static, str>,
    ) -> Self {
        Self {
            ctx,
            file_name,
            section_name: &section.name,
            writable: section.is_writable(),
            rel_name,
            num_dynrel: 0,
        }
    }

    /// Scans an address-sized absolute relocation.
    pub(crate) fn scan_absrel(&mut self, sym: &Symbol, rel: &Rel, table: &PolicyTable) {
        self.apply_action(get_absrel_action(self.ctx, sym, table), sym, rel);
    }

    /// Scans a narrow-absolute or PC-relative relocation.
    pub(crate) fn scan_rel(&mut self, sym: &Symbol, rel: &Rel, table: &PolicyTable) {
        self.apply_action(get_rel_action(self.ctx, sym, table), sym, rel);
    }

    fn apply_action(&mut self, action: ScanAction, sym: &Symbol, rel: &Rel) {
        use ScanAction::*;
        match action {
            None => {}
            Error => self.error(
                rel,
                format!("cannot be used against symbol `{}`; recompile with -fPIC", sym.name),
            ),
            CopyRel => self.copyrel(sym, rel),
            DynCopyRel => {
                if self.writable || !self.ctx.options.allow_copy_relocs {
                    self.dynrel();
                } else {
                    self.copyrel(sym, rel);
                }
            }
            Plt => sym.flags.or_assign(SymbolFlags::NEEDS_PLT),
            CanonicalPlt => sym.flags.or_assign(SymbolFlags::NEEDS_CPLT),
            DynCanonicalPlt => {
                if self.writable {
                    self.dynrel();
                } else {
                    sym.flags.or_assign(SymbolFlags::NEEDS_CPLT);
                }
            }
            DynRel | BaseRel | IfuncDynRel => self.dynrel(),
        }
    }

    pub(crate) fn undefined(&self, sym: &Symbol) {
        // A weak reference is allowed to stay unresolved.
        if sym.is_weak_undef {
            return;
        }
        self.ctx
            .diagnostics
            .undefined_symbol(self.file_name, self.section_name, &sym.name);
    }

    pub(crate) fn unknown_relocation(&self, rel: &Rel) {
        self.ctx.diagnostics.unknown_relocation(
            self.file_name,
            self.section_name,
            &(self.rel_name)(rel.r_type),
        );
    }

    fn copyrel(&mut self, sym: &Symbol, rel: &Rel) {
        if !self.ctx.options.allow_copy_relocs {
            self.error(
                rel,
                format!("requires a copy relocation against `{}`, which was disabled", sym.name),
            );
            return;
        }
        sym.flags.or_assign(SymbolFlags::NEEDS_COPYREL);
    }

    fn dynrel(&mut self) {
        self.num_dynrel += 1;
    }

    fn error(&self, rel: &Rel, message: String) {
        self.ctx.diagnostics.error(format!(
            "{}:({}): relocation {} {message}",
            self.file_name,
            self.section_name,
            (self.rel_name)(rel.r_type),
        ));
    }
}

/// Scans every allocated section of every file, in parallel across files.
/// Symbol flag updates are atomic bit-ORs, so no further synchronization is
/// needed; running this twice is a no-op apart from re-reporting errors.
#[tracing::instrument(skip_all, name = "Scan relocations")]
pub fn scan_relocations<A: Arch>(ctx: &Context, files: &mut [InputFile]) -> Result {
    files
        .par_iter_mut()
        .try_for_each(|file| scan_file::<A>(ctx, file))
}

fn scan_file<A: Arch>(ctx: &Context, file: &mut InputFile) -> Result {
    let InputFile {
        name,
        symbols,
        sections,
        num_dynrel,
        ..
    } = file;

    let mut file_dynrels = 0u32;
    for section in sections.iter_mut() {
        if !section.is_alloc() {
            continue;
        }
        section.reldyn_offset = u64::from(file_dynrels) * A::DYNREL_SIZE;
        section.num_dynrel = A::scan_section(ctx, name, symbols, section)?;
        file_dynrels += section.num_dynrel;
    }
    *num_dynrel = file_dynrels;
    Ok(())
}

/// Gives each file its slice of `.rel.dyn` once every file has been scanned.
/// `base` is the offset where input-section relocations start; the
/// surrounding linker places GOT- and PLT-driven relocations before it.
/// Returns the end offset.
pub fn assign_reldyn_offsets<A: Arch>(files: &mut [InputFile], base: u64) -> u64 {
    let mut offset = base;
    for file in files {
        file.reldyn_offset = offset;
        offset += u64::from(file.num_dynrel) * A::DYNREL_SIZE;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LinkOptions;
    use crate::context::OutputKind;

    fn sym(name: &str) -> Symbol {
        Symbol::new(name)
    }

    fn ctx_for(kind: OutputKind) -> Context {
        Context::new(LinkOptions {
            output_kind: kind,
            ..LinkOptions::default()
        })
    }

    #[test]
    fn test_action_columns() {
        let ctx = ctx_for(OutputKind::SharedObject);

        let mut absolute = sym("abs");
        absolute.is_absolute = true;
        assert_eq!(
            get_rel_action(&ctx, &absolute, &DYN_ABSREL_TABLE),
            ScanAction::None
        );

        let local = sym("local");
        assert_eq!(
            get_rel_action(&ctx, &local, &DYN_ABSREL_TABLE),
            ScanAction::BaseRel
        );

        let mut data = sym("imported_data");
        data.is_imported = true;
        data.st_type = object::elf::STT_OBJECT;
        assert_eq!(
            get_rel_action(&ctx, &data, &DYN_ABSREL_TABLE),
            ScanAction::DynRel
        );

        let mut func = sym("imported_func");
        func.is_imported = true;
        func.st_type = object::elf::STT_FUNC;
        assert_eq!(get_rel_action(&ctx, &func, &PCREL_TABLE), ScanAction::Plt);

        let mut ifunc = sym("resolver");
        ifunc.st_type = object::elf::STT_GNU_IFUNC;
        assert_eq!(
            get_absrel_action(&ctx, &ifunc, &DYN_ABSREL_TABLE),
            ScanAction::IfuncDynRel
        );
        // The override only applies to address-sized slots; elsewhere the
        // ifunc is just a local symbol.
        assert_eq!(get_rel_action(&ctx, &ifunc, &PCREL_TABLE), ScanAction::None);
    }

    #[test]
    fn test_pde_prefers_copy_relocations() {
        let ctx = ctx_for(OutputKind::PositionDependentExecutable);
        let mut data = sym("imported_data");
        data.is_imported = true;
        data.st_type = object::elf::STT_OBJECT;
        assert_eq!(
            get_rel_action(&ctx, &data, &DYN_ABSREL_TABLE),
            ScanAction::DynCopyRel
        );
        assert_eq!(get_rel_action(&ctx, &data, &PCREL_TABLE), ScanAction::CopyRel);
        assert_eq!(get_rel_action(&ctx, &data, &ABSREL_TABLE), ScanAction::CopyRel);
    }

    #[test]
    fn test_narrow_absolute_rejected_when_relocatable() {
        let ctx = ctx_for(OutputKind::PositionIndependentExecutable);
        let local = sym("local");
        assert_eq!(get_rel_action(&ctx, &local, &ABSREL_TABLE), ScanAction::Error);
    }
}
