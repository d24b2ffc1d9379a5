//! The 64-bit little-endian PowerPC back-end (ELFv2 ABI).
//!
//! PPC64 has no cheap PC-relative addressing, so position-independent code
//! keeps the address of `.got + 0x8000` in r2 (the TOC pointer) and reaches
//! everything through signed 16-bit offsets from it. Functions carry two
//! entry points: the global one recomputes r2 from r12, then falls through
//! to the local one, which assumes r2 is already correct. Calls that leave
//! the module must therefore go through a stub that loads the destination
//! into r12, and the caller's r2 has to be restored afterwards from its
//! stack save slot. That shapes everything here: `.plt` is only used for
//! lazy resolution, every PLT call goes through a range-extension thunk that
//! reads `.got.plt` directly, and `R_PPC64_REL24` patches the following nop
//! into the r2 restore.

use crate::apply::DynRelWriter;
use crate::apply::apply_dyn_absrel;
use crate::apply::resolve_fragment;
use crate::apply::tombstone_value;
use crate::arch::Arch;
use crate::context::Context;
use crate::elf::DynamicRelocationKind;
use crate::elf::Rel;
use crate::error::Result;
use crate::layout::InputFile;
use crate::layout::InputSection;
use crate::layout::OutputSection;
use crate::layout::Thunk;
use crate::scan::DYN_ABSREL_TABLE;
use crate::scan::PolicyTable;
use crate::scan::ScanAction;
use crate::scan::SectionScan;
use crate::symbol::Symbol;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use anyhow::bail;
use deft_utils::bit_misc::bits;
use deft_utils::bit_misc::read_u16_le;
use deft_utils::bit_misc::read_u32_le;
use deft_utils::bit_misc::sign_extend;
use deft_utils::bit_misc::write_u16_le;
use deft_utils::bit_misc::write_u32_le;
use deft_utils::bit_misc::write_u64_le;
use deft_utils::elf::R_PPC64_PLTCALL;
use deft_utils::elf::R_PPC64_PLTSEQ;
use deft_utils::elf::ppc64_rel_type_to_string;
use deft_utils::ppc64::ha;
use deft_utils::ppc64::hi;
use deft_utils::ppc64::higha;
use deft_utils::ppc64::lo;
use object::elf::*;
use std::borrow::Cow;

pub struct Ppc64V2;

const NOP: u32 = 0x6000_0000;

/// `ld r2, 24(r1)`: restores the caller's TOC pointer after an external
/// call.
const TOC_RESTORE: u32 = 0xe841_0018;

/// `.toc` is a compiler-generated GOT-like section; no user code addresses
/// its values directly, so copy relocations and canonical PLTs are never the
/// right answer for it.
const TOC_TABLE: PolicyTable = {
    use ScanAction::*;
    [
        // Absolute  Local    Imported data  Imported code
        [None, BaseRel, DynRel, DynRel], // Shared object
        [None, BaseRel, DynRel, DynRel], // Position-independent exec
        [None, None, DynRel, DynRel],    // Position-dependent exec
    ]
};

const PLT_HDR: [u32; 15] = [
    // Save the return address and get our own address into r11.
    0x7c08_02a6, // mflr    r0
    0x429f_0005, // bcl     1f
    0x7d68_02a6, // 1: mflr r11
    0x7c08_03a6, // mtlr    r0
    // Compute the PLT entry index from r12 (set by the entry's bl).
    0xe80b_002c, // ld      r0, 44(r11)
    0x7d8b_6050, // subf    r12, r11, r12
    0x7d60_5a14, // add     r11, r0, r11
    0x380c_ffcc, // addi    r0, r12, -52
    0x7800_f082, // rldicl  r0, r0, 62, 2
    // Load .got.plt[0] and .got.plt[1] and branch to .got.plt[0].
    0xe98b_0000, // ld      r12, 0(r11)
    0x7d89_03a6, // mtctr   r12
    0xe96b_0008, // ld      r11, 8(r11)
    0x4e80_0420, // bctr
    // .quad .got.plt - .plt - 8, filled in below
    0x0000_0000,
    0x0000_0000,
];

/// Thunk used when the destination has a PLT entry: save the caller's r2,
/// load the destination out of the GOT and branch. Once the dynamic loader
/// has filled `.got.plt`, this skips `.plt` entirely.
const PLT_THUNK: [u32; 5] = [
    0xf841_0018, // std   r2, 24(r1)
    0x3d82_0000, // addis r12, r2, <ha>
    0xe98c_0000, // ld    r12, <lo>(r12)
    0x7d89_03a6, // mtctr r12
    0x4e80_0420, // bctr
];

/// Thunk for a local destination: build its absolute address from the TOC
/// pointer and jump to its local entry point.
const LOCAL_THUNK: [u32; 5] = [
    0x3d82_0000, // addis r12, r2,  <ha>
    0x398c_0000, // addi  r12, r12, <lo>
    0x7d89_03a6, // mtctr r12
    0x4e80_0420, // bctr
    0x6000_0000, // nop
];

const _ASSERTS: () = {
    assert!(PLT_HDR.len() * 4 == Ppc64V2::PLT_HDR_SIZE as usize);
    assert!(PLT_THUNK.len() * 4 == Ppc64V2::THUNK_SIZE as usize);
    assert!(LOCAL_THUNK.len() * 4 == Ppc64V2::THUNK_SIZE as usize);
};

/// Decodes the three-bit local-entry field: the distance from a function's
/// global entry point to its local one.
fn local_entry_offset(sym: &Symbol) -> Result<u64> {
    match sym.ppc_local_entry {
        0 | 1 => Ok(0),
        7 => bail!("{}: local entry offset 7 is reserved", sym.name),
        value => Ok(1 << value),
    }
}

impl Arch for Ppc64V2 {
    const WORD_BYTES: u64 = 8;
    const DYNREL_SIZE: u64 = 24;
    const IS_RELA: bool = true;
    const PLT_HDR_SIZE: u64 = 60;
    const PLT_ENTRY_SIZE: u64 = 4;
    const PLTGOT_ENTRY_SIZE: u64 = 4;
    const THUNK_SIZE: u64 = 20;
    const THUNK_HDR_SIZE: u64 = 0;
    const TLS_DTV_OFFSET: u64 = 0x8000;

    fn elf_header_arch_magic() -> u16 {
        EM_PPC64
    }

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
        ppc64_rel_type_to_string(r_type)
    }

    fn dynamic_rel_type(kind: DynamicRelocationKind) -> u32 {
        match kind {
            DynamicRelocationKind::Relative => R_PPC64_RELATIVE,
            DynamicRelocationKind::Absolute => R_PPC64_ADDR64,
            DynamicRelocationKind::Irelative => R_PPC64_IRELATIVE,
        }
    }

    fn write_dynrel(out: &mut [u8], place: u64, r_type: u32, dynsym: u32, addend: i64) {
        // Elf64_Rela.
        write_u64_le(out, place);
        write_u64_le(&mut out[8..], (u64::from(dynsym) << 32) | u64::from(r_type));
        write_u64_le(&mut out[16..], addend as u64);
    }

    fn scan_section(
        ctx: &Context,
        file_name: &str,
        symbols: &[SymbolId],
        section: &InputSection,
    ) -> Result<u32> {
        let mut scan = SectionScan::new(ctx, file_name, section, Self::rel_type_to_string);

        for rel in &section.rels {
            if rel.r_type == R_PPC64_NONE {
                continue;
            }

            let sym = ctx.symbol_from(symbols, rel.sym)?;
            if sym.file.is_none() {
                scan.undefined(sym);
                continue;
            }

            if sym.is_ifunc() {
                sym.flags
                    .or_assign(SymbolFlags::NEEDS_GOT | SymbolFlags::NEEDS_PLT);
            }

            match rel.r_type {
                R_PPC64_ADDR64 => {
                    if section.name == ".toc" {
                        scan.scan_absrel(sym, rel, &TOC_TABLE);
                    } else {
                        scan.scan_absrel(sym, rel, &DYN_ABSREL_TABLE);
                    }
                }
                R_PPC64_GOT_TPREL16_HA => sym.flags.or_assign(SymbolFlags::NEEDS_GOTTP),
                R_PPC64_REL24 => {
                    if sym.is_imported {
                        sym.flags.or_assign(SymbolFlags::NEEDS_PLT);
                    }
                }
                R_PPC64_PLT16_HA => sym.flags.or_assign(SymbolFlags::NEEDS_GOT),
                R_PPC64_GOT_TLSGD16_HA => sym.flags.or_assign(SymbolFlags::NEEDS_TLSGD),
                R_PPC64_GOT_TLSLD16_HA => ctx
                    .needs_tlsld
                    .store(true, std::sync::atomic::Ordering::Relaxed),
                R_PPC64_REL64
                | R_PPC64_TOC16_HA
                | R_PPC64_TOC16_LO
                | R_PPC64_TOC16_LO_DS
                | R_PPC64_TOC16_DS
                | R_PPC64_REL16_HA
                | R_PPC64_REL16_LO
                | R_PPC64_PLT16_HI
                | R_PPC64_PLT16_LO
                | R_PPC64_PLT16_LO_DS
                | R_PPC64_PLTSEQ
                | R_PPC64_PLTCALL
                | R_PPC64_TPREL16_HA
                | R_PPC64_TPREL16_LO
                | R_PPC64_GOT_TPREL16_LO_DS
                | R_PPC64_GOT_TLSGD16_LO
                | R_PPC64_GOT_TLSLD16_LO
                | R_PPC64_TLS
                | R_PPC64_TLSGD
                | R_PPC64_TLSLD
                | R_PPC64_DTPREL16_HA
                | R_PPC64_DTPREL16_LO => {}
                _ => bail!(
                    "{file_name}:({}): unknown relocation: {}",
                    section.name,
                    Self::rel_type_to_string(rel.r_type),
                ),
            }
        }
        Ok(scan.num_dynrel)
    }

    fn apply_alloc(
        ctx: &Context,
        file: &InputFile,
        section: &InputSection,
        out: &mut [u8],
        dynrel: &mut DynRelWriter,
    ) -> Result {
        let osec = &ctx.output_sections[section.output_section.as_usize()];
        let section_addr = osec.layout.address + section.offset;
        let toc = ctx.toc_value as i64;

        for (i, rel) in section.rels.iter().enumerate() {
            if rel.r_type == R_PPC64_NONE {
                continue;
            }

            let sym = ctx.symbol_from(&file.symbols, rel.sym)?;
            let loc = section.loc_mut(out, rel)?;

            let s = sym.value as i64;
            let a = rel.addend;
            let p = (section_addr + rel.offset) as i64;

            let check = |val: i64, lo: i64, hi: i64| -> Result {
                if val < lo || hi <= val {
                    bail!(
                        "{}:({}): relocation {} against `{}` out of range: {val} is not in [{lo}, {hi})",
                        file.name,
                        section.name,
                        Self::rel_type_to_string(rel.r_type),
                        sym.name,
                    );
                }
                Ok(())
            };

            match rel.r_type {
                R_PPC64_ADDR64 => {
                    let table = if section.name == ".toc" {
                        &TOC_TABLE
                    } else {
                        &DYN_ABSREL_TABLE
                    };
                    apply_dyn_absrel::<Self>(
                        ctx,
                        sym,
                        section.is_writable(),
                        loc,
                        s as u64,
                        a,
                        p as u64,
                        dynrel,
                        table,
                    )?;
                }
                R_PPC64_TOC16_HA => write_u16_le(loc, ha((s + a - toc) as u64) as u16),
                R_PPC64_TOC16_LO => write_u16_le(loc, (s + a - toc) as u16),
                R_PPC64_TOC16_DS | R_PPC64_TOC16_LO_DS => {
                    // The low two bits of the half-word are part of the
                    // DS-form opcode.
                    let field = read_u16_le(loc) | ((s + a - toc) as u16 & 0xfffc);
                    write_u16_le(loc, field);
                }
                R_PPC64_REL24 => {
                    let mut val = s + a - p + local_entry_offset(sym)? as i64;

                    // Calls through the PLT always go via a thunk, as do
                    // direct calls whose displacement overflows.
                    if sym.has_plt() || sign_extend(val as u64, 25) as i64 != val {
                        let r = section
                            .thunk_ref(i)
                            .expect("branch needs a thunk, but none was assigned during layout");
                        val = osec.thunk_entry_addr::<Self>(r) as i64 + a - p;
                    }

                    check(val, -(1 << 25), 1 << 25)?;
                    let insn = read_u32_le(loc) | ((bits(val as u64, 25, 2) as u32) << 2);
                    write_u32_le(loc, insn);

                    // An external call clobbers r2. If the compiler left the
                    // usual nop after the bl, patch it into the restore from
                    // the caller's r2 save slot.
                    if sym.has_plt() && loc.len() >= 8 && read_u32_le(&loc[4..]) == NOP {
                        write_u32_le(&mut loc[4..], TOC_RESTORE);
                    }
                }
                R_PPC64_REL64 => write_u64_le(loc, (s + a - p) as u64),
                R_PPC64_REL16_HA => write_u16_le(loc, ha((s + a - p) as u64) as u16),
                R_PPC64_REL16_LO => write_u16_le(loc, (s + a - p) as u16),
                R_PPC64_PLT16_HA => {
                    write_u16_le(loc, ha((sym.got_addr::<Self>(ctx) as i64 - toc) as u64) as u16);
                }
                R_PPC64_PLT16_HI => {
                    write_u16_le(loc, hi((sym.got_addr::<Self>(ctx) as i64 - toc) as u64) as u16);
                }
                R_PPC64_PLT16_LO => {
                    write_u16_le(loc, lo((sym.got_addr::<Self>(ctx) as i64 - toc) as u64) as u16);
                }
                R_PPC64_PLT16_LO_DS => {
                    let val = (sym.got_addr::<Self>(ctx) as i64 - toc) as u16 & 0xfffc;
                    write_u16_le(loc, read_u16_le(loc) | val);
                }
                R_PPC64_GOT_TPREL16_HA => {
                    write_u16_le(loc, ha((sym.gottp_addr::<Self>(ctx) as i64 - toc) as u64) as u16);
                }
                R_PPC64_GOT_TPREL16_LO_DS => {
                    let val = (sym.gottp_addr::<Self>(ctx) as i64 - toc) as u16 & 0xfffc;
                    write_u16_le(loc, read_u16_le(loc) | val);
                }
                R_PPC64_GOT_TLSGD16_HA => {
                    write_u16_le(loc, ha((sym.tlsgd_addr::<Self>(ctx) as i64 - toc) as u64) as u16);
                }
                R_PPC64_GOT_TLSGD16_LO => {
                    write_u16_le(loc, (sym.tlsgd_addr::<Self>(ctx) as i64 - toc) as u16);
                }
                R_PPC64_GOT_TLSLD16_HA => {
                    let tlsld = ctx.tlsld_addr(Self::WORD_BYTES) as i64;
                    write_u16_le(loc, ha((tlsld - toc) as u64) as u16);
                }
                R_PPC64_GOT_TLSLD16_LO => {
                    let tlsld = ctx.tlsld_addr(Self::WORD_BYTES) as i64;
                    write_u16_le(loc, (tlsld - toc) as u16);
                }
                R_PPC64_DTPREL16_HA => {
                    let val = s + a - ctx.tls_begin as i64 - Self::TLS_DTV_OFFSET as i64;
                    write_u16_le(loc, ha(val as u64) as u16);
                }
                R_PPC64_DTPREL16_LO => {
                    let val = s + a - ctx.tls_begin as i64 - Self::TLS_DTV_OFFSET as i64;
                    write_u16_le(loc, val as u16);
                }
                R_PPC64_TPREL16_HA => {
                    write_u16_le(loc, ha((s + a - ctx.tp_addr as i64) as u64) as u16);
                }
                R_PPC64_TPREL16_LO => write_u16_le(loc, (s + a - ctx.tp_addr as i64) as u16),
                R_PPC64_PLTSEQ | R_PPC64_PLTCALL | R_PPC64_TLS | R_PPC64_TLSGD | R_PPC64_TLSLD => {}
                _ => bail!(
                    "{}:({}): unknown relocation: {}",
                    file.name,
                    section.name,
                    Self::rel_type_to_string(rel.r_type),
                ),
            }
        }
        Ok(())
    }

    fn apply_nonalloc(
        ctx: &Context,
        file: &InputFile,
        section: &InputSection,
        out: &mut [u8],
    ) -> Result {
        for (i, rel) in section.rels.iter().enumerate() {
            if rel.r_type == R_PPC64_NONE {
                continue;
            }

            let sym = ctx.symbol_from(&file.symbols, rel.sym)?;
            let loc = section.loc_mut(out, rel)?;

            if sym.file.is_none() {
                if !sym.is_weak_undef {
                    ctx.diagnostics
                        .undefined_symbol(&file.name, &section.name, &sym.name);
                }
                continue;
            }

            let frag = resolve_fragment(ctx, section, i);
            let s = frag.map_or(sym.value, |(frag, _)| frag.address) as i64;
            let a = frag.map_or(rel.addend, |(_, addend)| addend);

            match rel.r_type {
                R_PPC64_ADDR64 => {
                    if let Some(val) = tombstone_value(&section.name, sym, frag.map(|(f, _)| f)) {
                        write_u64_le(loc, val);
                    } else {
                        write_u64_le(loc, (s + a) as u64);
                    }
                }
                R_PPC64_ADDR32 => {
                    let val = s + a;
                    if val < 0 || val >= 1 << 32 {
                        bail!(
                            "{}:({}): relocation R_PPC64_ADDR32 against `{}` out of range: \
                             {val} is not in [0, {})",
                            file.name,
                            section.name,
                            sym.name,
                            1_i64 << 32,
                        );
                    }
                    write_u32_le(loc, val as u32);
                }
                R_PPC64_DTPREL64 => {
                    let val = s + a - ctx.tls_begin as i64 - Self::TLS_DTV_OFFSET as i64;
                    write_u64_le(loc, val as u64);
                }
                _ => bail!(
                    "{}:({}): invalid relocation for non-allocated sections: {}",
                    file.name,
                    section.name,
                    Self::rel_type_to_string(rel.r_type),
                ),
            }
        }
        Ok(())
    }

    fn write_plt_header(ctx: &Context, out: &mut [u8]) {
        for (i, insn) in PLT_HDR.iter().enumerate() {
            write_u32_le(&mut out[i * 4..], *insn);
        }
        let offset = ctx.gotplt.address as i64 - ctx.plt.address as i64 - 8;
        write_u64_le(&mut out[52..], offset as u64);
    }

    fn write_plt_entry(ctx: &Context, out: &mut [u8], sym: &Symbol) {
        // bl plt0. The PLT header recovers the entry index from r12.
        let displacement = ctx.plt.address as i64 - sym.plt_addr::<Self>(ctx) as i64;
        write_u32_le(out, 0x4b00_0000 | (displacement as u32 & 0x00ff_ffff));
    }

    fn write_pltgot_entry(_ctx: &Context, out: &mut [u8], _sym: &Symbol) {
        // Nothing jumps here at runtime: every PLT call goes through a range
        // extension thunk, which reads the destination from the GOT itself.
        write_u32_le(out, NOP);
    }

    fn write_thunk(ctx: &Context, _osec: &OutputSection, thunk: &Thunk, out: &mut [u8]) -> Result {
        let toc = ctx.toc_value as i64;

        for (i, &sym_id) in thunk.symbols.iter().enumerate() {
            let sym = ctx.symbol(sym_id);
            let entry = &mut out[i * Self::THUNK_SIZE as usize..];

            let mut insns;
            if sym.has_plt() {
                let got = if sym.has_got() {
                    sym.got_addr::<Self>(ctx)
                } else {
                    sym.gotplt_addr::<Self>(ctx)
                };
                let val = (got as i64 - toc) as u64;
                insns = PLT_THUNK;
                insns[1] |= higha(val) as u32;
                insns[2] |= lo(val) as u32;
            } else {
                let val = (sym.value as i64 + local_entry_offset(sym)? as i64 - toc) as u64;
                insns = LOCAL_THUNK;
                insns[0] |= higha(val) as u32;
                insns[1] |= lo(val) as u32;
            }

            for (j, insn) in insns.iter().enumerate() {
                write_u32_le(&mut entry[j * 4..], *insn);
            }
        }
        Ok(())
    }

    fn apply_eh_frame_reloc(
        _ctx: &Context,
        rel: &Rel,
        section_addr: u64,
        offset: u64,
        value: u64,
        loc: &mut [u8],
    ) -> Result {
        match rel.r_type {
            R_PPC64_NONE => {}
            R_PPC64_ADDR64 => write_u64_le(loc, value),
            R_PPC64_REL32 => {
                write_u32_le(loc, value.wrapping_sub(section_addr + offset) as u32);
            }
            R_PPC64_REL64 => write_u64_le(loc, value.wrapping_sub(section_addr + offset)),
            _ => bail!(
                "Unsupported relocation in .eh_frame: {}",
                Self::rel_type_to_string(rel.r_type),
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply_relocations;
    use crate::context::LinkOptions;
    use crate::context::OutputKind;
    use crate::layout::FileId;
    use crate::layout::OutputSectionId;
    use crate::layout::SectionLayout;
    use crate::layout::ThunkRef;
    use crate::scan::assign_reldyn_offsets;
    use crate::scan::scan_relocations;
    use crate::synthetic::write_plt;
    use crate::thunk::write_thunks;
    use deft_utils::bit_misc::read_u64_le;
    use deft_utils::elf::SectionFlags;
    use deft_utils::elf::shf;

    const TEXT_ADDR: u64 = 0x1000_0000;
    const GOT_ADDR: u64 = 0x2000_0000;

    struct Link {
        ctx: Context,
        files: Vec<InputFile>,
        buf: Vec<u8>,
    }

    impl Link {
        fn run(&mut self) {
            scan_relocations::<Ppc64V2>(&self.ctx, &mut self.files).unwrap();
            assign_reldyn_offsets::<Ppc64V2>(&mut self.files, 0);
            apply_relocations::<Ppc64V2>(&self.ctx, &self.files, &mut self.buf).unwrap();
        }

        fn text_section(&mut self) -> &mut InputSection {
            &mut self.files[0].sections[0]
        }
    }

    fn defined(name: &str, value: u64) -> Symbol {
        let mut sym = Symbol::new(name);
        sym.file = Some(FileId::from_usize(0));
        sym.value = value;
        sym
    }

    fn link_with(
        section_bytes: &[u8],
        rels: Vec<Rel>,
        syms: Vec<Symbol>,
        kind: OutputKind,
    ) -> Link {
        let mut ctx = Context::new(LinkOptions {
            output_kind: kind,
            ..LinkOptions::default()
        });
        ctx.symbols = syms;
        ctx.got = SectionLayout::new(GOT_ADDR, 0x10_0000, 0x100);
        ctx.toc_value = GOT_ADDR + 0x8000;
        ctx.output_sections.push(OutputSection::new(
            ".text",
            SHT_PROGBITS,
            SectionLayout::new(TEXT_ADDR, 0, section_bytes.len() as u64),
        ));

        let mut section = InputSection::new(
            ".text",
            SectionFlags::empty().with(shf::ALLOC).with(shf::EXECINSTR),
            OutputSectionId::from_usize(0),
        );
        section.size = section_bytes.len() as u64;
        section.rels = rels;

        let mut file = InputFile::new("test.o");
        file.symbols = (0..ctx.symbols.len()).map(SymbolId::from_usize).collect();
        file.sections.push(section);

        Link {
            ctx,
            files: vec![file],
            buf: section_bytes.to_vec(),
        }
    }

    #[test]
    fn test_rel24_direct_call_uses_local_entry() {
        // bl followed by the usual nop. The callee's local entry point is 8
        // bytes past its global one (ppc_local_entry = 3).
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x4800_0001_u32.to_le_bytes());
        bytes.extend_from_slice(&NOP.to_le_bytes());
        let mut callee = defined("callee", TEXT_ADDR + 0x1000);
        callee.ppc_local_entry = 3;

        let mut link = link_with(
            &bytes,
            vec![Rel::new(0, R_PPC64_REL24, 0)],
            vec![callee],
            OutputKind::PositionDependentExecutable,
        );
        link.run();

        // val = 0x1000 + 8.
        assert_eq!(read_u32_le(&link.buf), 0x4800_0001 | 0x1008);
        // The callee is local; the nop stays.
        assert_eq!(read_u32_le(&link.buf[4..]), NOP);
    }

    #[test]
    fn test_rel24_to_plt_goes_via_thunk_and_restores_toc() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x4800_0001_u32.to_le_bytes());
        bytes.extend_from_slice(&NOP.to_le_bytes());

        let mut external = defined("external", 0);
        external.is_imported = true;
        external.st_type = STT_FUNC;
        external.plt_idx = Some(0);
        external.gotplt_idx = Some(0);

        let mut link = link_with(
            &bytes,
            vec![Rel::new(0, R_PPC64_REL24, 0)],
            vec![external],
            OutputKind::PositionDependentExecutable,
        );
        link.ctx.output_sections[0]
            .thunks
            .push(Thunk::new(0x100, vec![SymbolId::from_usize(0)]));
        link.text_section().range_extn = vec![Some(ThunkRef {
            thunk_idx: 0,
            sym_idx: 0,
        })];
        link.run();

        // The branch targets the thunk at .text + 0x100.
        assert_eq!(read_u32_le(&link.buf), 0x4800_0001 | 0x100);
        // The nop after the bl becomes ld r2, 24(r1).
        assert_eq!(read_u32_le(&link.buf[4..]), TOC_RESTORE);
        assert_eq!(
            link.ctx.symbols[0].flags.get(),
            SymbolFlags::NEEDS_PLT
        );
    }

    #[test]
    fn test_toc16_halves() {
        // addis r, r2, 0; addi r, r, 0 — immediates at offsets 2 and 6.
        let bytes = [0u8; 8];
        let value = GOT_ADDR + 0x1_2345;
        let mut link = link_with(
            &bytes,
            vec![
                Rel::new(2, R_PPC64_TOC16_HA, 0),
                Rel::new(6, R_PPC64_TOC16_LO, 0),
            ],
            vec![defined("toc_entry", value)],
            OutputKind::PositionDependentExecutable,
        );
        link.run();

        // S - TOC = 0x12345 - 0x8000 = 0xa345; ha carries the sign of lo.
        assert_eq!(read_u16_le(&link.buf[2..]), 1);
        assert_eq!(read_u16_le(&link.buf[6..]), 0xa345);
        // addis reconstructs: (1 << 16) + sign_extend(0xa345) = 0xa345.
        let rebuilt = (1_i64 << 16) + i64::from(read_u16_le(&link.buf[6..]) as i16);
        assert_eq!(rebuilt, 0xa345);
    }

    #[test]
    fn test_toc_addr64_in_pie_emits_relative_dynrel() {
        let bytes = [0u8; 8];
        let mut link = link_with(
            &bytes,
            vec![Rel::new(0, R_PPC64_ADDR64, 0).with_addend(0x10)],
            vec![defined("local", 0x1234_5678)],
            OutputKind::PositionIndependentExecutable,
        );
        link.text_section().name = ".toc".to_owned();
        link.text_section().flags = SectionFlags::empty().with(shf::ALLOC).with(shf::WRITE);
        link.ctx.reldyn = Some(SectionLayout::new(0x3000_0000, 0x200, 24));
        link.buf.resize(0x218, 0);
        link.run();

        assert_eq!(link.files[0].num_dynrel, 1);
        // In place: S + A. Record: R_PPC64_RELATIVE at P with addend S + A.
        assert_eq!(read_u64_le(&link.buf), 0x1234_5688);
        assert_eq!(read_u64_le(&link.buf[0x200..]), TEXT_ADDR);
        assert_eq!(read_u64_le(&link.buf[0x208..]), u64::from(R_PPC64_RELATIVE));
        assert_eq!(read_u64_le(&link.buf[0x210..]), 0x1234_5688);
    }

    #[test]
    fn test_plt_header_and_entry() {
        let mut ctx = Context::new(LinkOptions::default());
        ctx.plt = SectionLayout::new(0x2000_0000, 0x500, 64);
        ctx.gotplt = SectionLayout::new(0x2100_0000, 0x600, 24);
        let mut sym = defined("external", 0);
        sym.plt_idx = Some(0);
        ctx.symbols.push(sym);
        ctx.plt_symbols.push(SymbolId::from_usize(0));

        let mut buf = vec![0; 0x700];
        write_plt::<Ppc64V2>(&ctx, &mut buf).unwrap();

        assert_eq!(read_u32_le(&buf[0x500..]), 0x7c08_02a6);
        // The trailing literal: .got.plt - .plt - 8.
        assert_eq!(read_u64_le(&buf[0x500 + 52..]), 0x2100_0000 - 0x2000_0000 - 8);
        // The entry is a bl back to plt0: displacement -60.
        assert_eq!(read_u32_le(&buf[0x500 + 60..]), 0x4bff_ffc4);
    }

    #[test]
    fn test_thunks() {
        let mut ctx = Context::new(LinkOptions::default());
        ctx.got = SectionLayout::new(GOT_ADDR, 0x10_0000, 0x100);
        ctx.gotplt = SectionLayout::new(GOT_ADDR + 0x1000, 0x10_1000, 0x100);
        ctx.toc_value = GOT_ADDR + 0x8000;
        ctx.output_sections.push(OutputSection::new(
            ".text",
            SHT_PROGBITS,
            SectionLayout::new(TEXT_ADDR, 0, 0x200),
        ));

        let mut external = defined("external", 0);
        external.plt_idx = Some(0);
        external.gotplt_idx = Some(2);
        ctx.symbols.push(external);
        let mut local = defined("local_fn", TEXT_ADDR + 0x40);
        local.ppc_local_entry = 3;
        ctx.symbols.push(local);

        ctx.output_sections[0].thunks.push(Thunk::new(
            0x100,
            vec![SymbolId::from_usize(0), SymbolId::from_usize(1)],
        ));

        let mut buf = vec![0; 0x200];
        write_thunks::<Ppc64V2>(&ctx, &mut buf).unwrap();

        // Entry 0 is a PLT thunk reading .got.plt[2]:
        // offset = gotplt + 16 - toc = 0x1010 - 0x8000 = -0x6ff0.
        let val = (GOT_ADDR + 0x1000 + 16).wrapping_sub(GOT_ADDR + 0x8000);
        assert_eq!(read_u32_le(&buf[0x100..]), 0xf841_0018);
        assert_eq!(
            read_u32_le(&buf[0x104..]),
            0x3d82_0000 | higha(val) as u32
        );
        assert_eq!(read_u32_le(&buf[0x108..]), 0xe98c_0000 | lo(val) as u32);
        assert_eq!(read_u32_le(&buf[0x10c..]), 0x7d89_03a6);
        assert_eq!(read_u32_le(&buf[0x110..]), 0x4e80_0420);

        // Entry 1 builds the local entry point address from the TOC.
        let val = (TEXT_ADDR + 0x40 + 8).wrapping_sub(GOT_ADDR + 0x8000);
        assert_eq!(
            read_u32_le(&buf[0x114..]),
            0x3d82_0000 | higha(val) as u32
        );
        assert_eq!(read_u32_le(&buf[0x118..]), 0x398c_0000 | lo(val) as u32);
        assert_eq!(read_u32_le(&buf[0x124..]), NOP);
    }

    #[test]
    fn test_reserved_local_entry_is_fatal() {
        let bytes = 0x4800_0001_u32.to_le_bytes();
        let mut bad = defined("bad", TEXT_ADDR + 0x10);
        bad.ppc_local_entry = 7;
        let mut link = link_with(
            &bytes,
            vec![Rel::new(0, R_PPC64_REL24, 0)],
            vec![bad],
            OutputKind::PositionDependentExecutable,
        );
        scan_relocations::<Ppc64V2>(&link.ctx, &mut link.files).unwrap();
        let result = apply_relocations::<Ppc64V2>(&link.ctx, &link.files, &mut link.buf);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_relocation_is_fatal() {
        let mut link = link_with(
            &[0; 4],
            vec![Rel::new(0, 0xf00, 0)],
            vec![defined("x", 0)],
            OutputKind::PositionDependentExecutable,
        );
        let result = scan_relocations::<Ppc64V2>(&link.ctx, &mut link.files);
        assert!(result.is_err());
    }

    #[test]
    fn test_nonalloc_addr32_range_check() {
        let mut link = link_with(
            &[0; 4],
            vec![Rel::new(0, R_PPC64_ADDR32, 0)],
            vec![defined("huge", 1 << 32)],
            OutputKind::PositionDependentExecutable,
        );
        link.text_section().flags = SectionFlags::empty();
        let result = apply_relocations::<Ppc64V2>(&link.ctx, &link.files, &mut link.buf);
        assert!(result.is_err());
    }

    #[test]
    fn test_tprel_and_dtprel_halves() {
        let bytes = [0u8; 8];
        let mut link = link_with(
            &bytes,
            vec![
                Rel::new(0, R_PPC64_TPREL16_LO, 0),
                Rel::new(2, R_PPC64_DTPREL16_LO, 0),
            ],
            vec![defined("tls_var", 0x4000_1000)],
            OutputKind::PositionDependentExecutable,
        );
        link.ctx.tp_addr = 0x4000_0f00;
        link.ctx.tls_begin = 0x4000_0000;
        link.run();

        assert_eq!(read_u16_le(&link.buf), 0x100);
        // S - tls_begin - 0x8000 = 0x1000 - 0x8000.
        assert_eq!(read_u16_le(&link.buf[2..]), (0x1000_u16).wrapping_sub(0x8000));
    }

    #[test]
    fn test_eh_frame_relocs() {
        let mut loc = [0u8; 8];
        let rel = Rel::new(0, R_PPC64_REL32, 0);
        let ctx = Context::new(LinkOptions::default());
        Ppc64V2::apply_eh_frame_reloc(&ctx, &rel, 0x1000, 0x10, 0x3000, &mut loc).unwrap();
        assert_eq!(read_u32_le(&loc), 0x3000 - 0x1010);

        let bad = Rel::new(0, R_PPC64_REL24, 0);
        assert!(Ppc64V2::apply_eh_frame_reloc(&ctx, &bad, 0, 0, 0, &mut loc).is_err());
    }
}
