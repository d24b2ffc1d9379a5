//! The 32-bit ARM back-end.
//!
//! ARM32 is awkward in two ways that shape everything here. First, there are
//! two instruction encodings, ARM and Thumb, selected by the low bit of a
//! code address. A branch can only switch encodings through an instruction
//! that supports interworking (BX/BLX), so plain branches to the other
//! encoding are re-routed through a range-extension thunk that lands in ARM
//! mode. Second, the psABI uses REL-format relocations: addends live in the
//! relocated fields themselves and have to be decoded before patching.

use crate::apply::DynRelWriter;
use crate::apply::apply_dyn_absrel;
use crate::apply::tombstone_value;
use crate::apply::resolve_fragment;
use crate::arch::Arch;
use crate::context::Context;
use crate::debug_assert_bail;
use crate::elf::DynamicRelocationKind;
use crate::elf::Rel;
use crate::error::Result;
use crate::layout::InputFile;
use crate::layout::InputSection;
use crate::layout::OutputSection;
use crate::layout::Thunk;
use crate::scan::ABSREL_TABLE;
use crate::scan::DYN_ABSREL_TABLE;
use crate::scan::PCREL_TABLE;
use crate::scan::SectionScan;
use crate::symbol::Symbol;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolId;
use anyhow::bail;
use deft_utils::arm32::NOP_ARM;
use deft_utils::arm32::NOP_T2;
use deft_utils::arm32::in_place_addend;
use deft_utils::arm32::write_mov_imm;
use deft_utils::arm32::write_thm_b_imm;
use deft_utils::arm32::write_thm_bl_bit;
use deft_utils::arm32::write_thm_mov_imm;
use deft_utils::bit_misc::align_to;
use deft_utils::bit_misc::bit;
use deft_utils::bit_misc::bits;
use deft_utils::bit_misc::read_u16_le;
use deft_utils::bit_misc::read_u32_le;
use deft_utils::bit_misc::sign_extend;
use deft_utils::bit_misc::write_u16_le;
use deft_utils::bit_misc::write_u32_le;
use deft_utils::elf::R_ARM_BASE_PREL;
use deft_utils::elf::R_ARM_GOT_BREL;
use deft_utils::elf::R_ARM_THM_CALL;
use deft_utils::elf::R_ARM_THM_JUMP11;
use deft_utils::elf::arm32_rel_type_to_string;
use object::elf::*;
use std::borrow::Cow;

pub struct Arm32;

const PLT_HDR: [u32; 8] = [
    0xe52d_e004, // push {lr}
    0xe59f_e004, // ldr lr, [pc, #4]
    0xe08f_e00e, // add lr, pc, lr
    0xe5be_f008, // ldr pc, [lr, #8]!
    0x0000_0000, // offset to .got.plt, filled in below
    0xe320_f000, // nop
    0xe320_f000, // nop
    0xe320_f000, // nop
];

const PLT_ENTRY: [u32; 4] = [
    0xe59f_c004, // ldr ip, [pc, #4]
    0xe08c_c00f, // add ip, ip, pc
    0xe59c_f000, // ldr pc, [ip]
    0x0000_0000, // offset to the GOT slot, filled in below
];

/// The TLSDESC trampoline at the head of every thunk area. TLSDESC call
/// sites branch here with the descriptor offset in r0 and the return address
/// in lr; the trampoline forms the descriptor's address and tail-calls its
/// resolver.
const TLS_TRAMPOLINE: [u32; 3] = [
    0xe08e_0000, // add r0, lr, r0
    0xe590_1004, // ldr r1, [r0, #4]
    0xe12f_ff11, // bx  r1
];

/// A thunk entry. The first four bytes are Thumb: they move past the mode
/// switch so that Thumb-encoded branches, which can't interwork, can target
/// offset +0 while everything else targets the ARM code at +4.
const THUNK_ENTRY: [u8; 20] = [
    0xfc, 0x46, // mov  ip, pc
    0x60, 0x47, // bx   ip
    0x04, 0xc0, 0x9f, 0xe5, // ldr  ip, [pc, #4]
    0x0f, 0xc0, 0x8c, 0xe0, // add  ip, ip, pc
    0x1c, 0xff, 0x2f, 0xe1, // bx   ip
    0x00, 0x00, 0x00, 0x00, // target address literal, filled in below
];

const _ASSERTS: () = {
    assert!(PLT_HDR.len() * 4 == Arm32::PLT_HDR_SIZE as usize);
    assert!(PLT_ENTRY.len() * 4 == Arm32::PLT_ENTRY_SIZE as usize);
    assert!(TLS_TRAMPOLINE.len() * 4 == Arm32::THUNK_HDR_SIZE as usize);
    assert!(THUNK_ENTRY.len() == Arm32::THUNK_SIZE as usize);
};

impl Arch for Arm32 {
    const WORD_BYTES: u64 = 4;
    const DYNREL_SIZE: u64 = 8;
    const IS_RELA: bool = false;
    const PLT_HDR_SIZE: u64 = 32;
    const PLT_ENTRY_SIZE: u64 = 16;
    const PLTGOT_ENTRY_SIZE: u64 = 16;
    const THUNK_SIZE: u64 = 20;
    const THUNK_HDR_SIZE: u64 = 12;
    const TLS_DTV_OFFSET: u64 = 0;

    fn elf_header_arch_magic() -> u16 {
        EM_ARM
    }

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
        arm32_rel_type_to_string(r_type)
    }

    fn dynamic_rel_type(kind: DynamicRelocationKind) -> u32 {
        match kind {
            DynamicRelocationKind::Relative => R_ARM_RELATIVE,
            DynamicRelocationKind::Absolute => R_ARM_ABS32,
            DynamicRelocationKind::Irelative => R_ARM_IRELATIVE,
        }
    }

    fn write_dynrel(out: &mut [u8], place: u64, r_type: u32, dynsym: u32, _addend: i64) {
        // Elf32_Rel. The addend stays in the relocated field.
        write_u32_le(out, place as u32);
        write_u32_le(&mut out[4..], (dynsym << 8) | (r_type & 0xff));
    }

    fn scan_section(
        ctx: &Context,
        file_name: &str,
        symbols: &[SymbolId],
        section: &InputSection,
    ) -> Result<u32> {
        let mut scan = SectionScan::new(ctx, file_name, section, Self::rel_type_to_string);

        for rel in &section.rels {
            if rel.r_type == R_ARM_NONE || rel.r_type == R_ARM_V4BX {
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
                R_ARM_ABS32 | R_ARM_TARGET1 => scan.scan_absrel(sym, rel, &DYN_ABSREL_TABLE),
                R_ARM_MOVT_ABS | R_ARM_THM_MOVT_ABS => scan.scan_rel(sym, rel, &ABSREL_TABLE),
                R_ARM_CALL | R_ARM_JUMP24 | R_ARM_THM_CALL | R_ARM_THM_JUMP24 => {
                    if sym.is_imported {
                        sym.flags.or_assign(SymbolFlags::NEEDS_PLT);
                    }
                }
                R_ARM_GOT_PREL | R_ARM_GOT_BREL | R_ARM_TARGET2 => {
                    sym.flags.or_assign(SymbolFlags::NEEDS_GOT);
                }
                R_ARM_MOVT_PREL | R_ARM_THM_MOVT_PREL | R_ARM_PREL31 => {
                    scan.scan_rel(sym, rel, &PCREL_TABLE);
                }
                R_ARM_TLS_GD32 => sym.flags.or_assign(SymbolFlags::NEEDS_TLSGD),
                R_ARM_TLS_LDM32 => ctx
                    .needs_tlsld
                    .store(true, std::sync::atomic::Ordering::Relaxed),
                R_ARM_TLS_IE32 => sym.flags.or_assign(SymbolFlags::NEEDS_GOTTP),
                R_ARM_TLS_GOTDESC => {
                    if !ctx.relax_tlsdesc(sym) {
                        sym.flags.or_assign(SymbolFlags::NEEDS_TLSDESC);
                    }
                }
                R_ARM_REL32 | R_ARM_BASE_PREL | R_ARM_THM_JUMP11 | R_ARM_THM_JUMP19
                | R_ARM_MOVW_ABS_NC | R_ARM_MOVW_PREL_NC | R_ARM_THM_MOVW_ABS_NC
                | R_ARM_THM_MOVW_PREL_NC | R_ARM_TLS_LDO32 | R_ARM_TLS_LE32 | R_ARM_TLS_CALL
                | R_ARM_THM_TLS_CALL => {}
                _ => scan.unknown_relocation(rel),
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
        let fits = |val: i64, sign_bit: u32| sign_extend(val as u64, sign_bit) as i64 == val;

        for (i, rel) in section.rels.iter().enumerate() {
            if rel.r_type == R_ARM_NONE || rel.r_type == R_ARM_V4BX {
                continue;
            }

            let sym = ctx.symbol_from(&file.symbols, rel.sym)?;
            let loc = section.loc_mut(out, rel)?;

            let s = sym.value as i64;
            let a = in_place_addend(loc, rel.r_type);
            let p = (section_addr + rel.offset) as i64;
            let t = sym.value & 1;

            // The ARM-mode entry of the thunk assigned to this branch, 4
            // bytes past the Thumb prologue. BL/BLX sites use it even from
            // Thumb code, since BLX needs an ARM destination; only plain
            // Thumb branches enter at +0.
            let arm_thunk_addr = |i: usize| {
                let r = section
                    .thunk_ref(i)
                    .expect("branch needs a thunk, but none was assigned during layout");
                osec.thunk_entry_addr::<Self>(r) as i64 + 4
            };
            let thumb_thunk_addr = |i: usize| arm_thunk_addr(i) - 4;

            let check = |val: i64, lo: i64, hi: i64| {
                if val < lo || hi <= val {
                    ctx.diagnostics.error(format!(
                        "{}:({}): relocation {} against `{}` out of range: {val} is not in [{lo}, {hi})",
                        file.name,
                        section.name,
                        Self::rel_type_to_string(rel.r_type),
                        sym.name,
                    ));
                }
            };

            match rel.r_type {
                R_ARM_ABS32 | R_ARM_TARGET1 => {
                    apply_dyn_absrel::<Self>(
                        ctx,
                        sym,
                        section.is_writable(),
                        loc,
                        s as u64,
                        a,
                        p as u64,
                        dynrel,
                        &DYN_ABSREL_TABLE,
                    )?;
                }
                R_ARM_REL32 => write_u32_le(loc, (s + a - p) as u32),
                R_ARM_BASE_PREL => write_u32_le(loc, (ctx.got.address as i64 + a - p) as u32),
                R_ARM_GOT_PREL | R_ARM_TARGET2 => {
                    write_u32_le(loc, (sym.got_addr::<Self>(ctx) as i64 + a - p) as u32);
                }
                R_ARM_GOT_BREL => {
                    let g = sym.got_addr::<Self>(ctx) - ctx.got.address;
                    write_u32_le(loc, (g as i64 + a) as u32);
                }
                R_ARM_THM_CALL => {
                    // BL or BLX, one bit apart. The target encoding picks
                    // which: BL stays in Thumb, BLX switches to ARM.
                    if sym.is_weak_undef {
                        // A call to an undefined weak symbol just falls
                        // through to the next instruction.
                        write_u32_le(loc, NOP_T2);
                    } else {
                        let val = s + a - p;
                        if fits(val, 24) {
                            if t != 0 {
                                write_thm_b_imm(loc, val as u32);
                                write_thm_bl_bit(loc, true);
                            } else {
                                write_thm_b_imm(loc, align_to(val as u64, 4) as u32);
                                write_thm_bl_bit(loc, false);
                            }
                        } else {
                            let val = arm_thunk_addr(i) + a - p;
                            write_thm_b_imm(loc, align_to(val as u64, 4) as u32);
                            write_thm_bl_bit(loc, false);
                        }
                    }
                }
                R_ARM_CALL => {
                    let insn = read_u32_le(loc);
                    let is_bl = insn & 0xff00_0000 == 0xeb00_0000;
                    let is_blx = insn & 0xfe00_0000 == 0xfa00_0000;
                    if !is_bl && !is_blx {
                        ctx.diagnostics.error(format!(
                            "{}:({}): R_ARM_CALL refers neither BL nor BLX",
                            file.name, section.name,
                        ));
                    }

                    if sym.is_weak_undef {
                        write_u32_le(loc, NOP_ARM);
                    } else {
                        let val = s + a - p;
                        if fits(val, 25) {
                            if t != 0 {
                                // BLX; the H bit carries bit 1 of the
                                // displacement.
                                let h = bit(val as u64, 1) as u32;
                                write_u32_le(
                                    loc,
                                    0xfa00_0000 | (h << 24) | bits(val as u64, 25, 2) as u32,
                                );
                            } else {
                                write_u32_le(loc, 0xeb00_0000 | bits(val as u64, 25, 2) as u32);
                            }
                        } else {
                            let val = arm_thunk_addr(i) + a - p;
                            write_u32_le(loc, 0xeb00_0000 | bits(val as u64, 25, 2) as u32);
                        }
                    }
                }
                R_ARM_JUMP24 => {
                    if sym.is_weak_undef {
                        write_u32_le(loc, NOP_ARM);
                    } else {
                        // B can't switch mode, so a Thumb destination always
                        // goes through the thunk.
                        let mut val = s + a - p;
                        if t != 0 || !fits(val, 25) {
                            val = arm_thunk_addr(i) + a - p;
                        }
                        let insn = read_u32_le(loc) & 0xff00_0000;
                        write_u32_le(loc, insn | bits(val as u64, 25, 2) as u32);
                    }
                }
                R_ARM_THM_JUMP24 => {
                    if sym.is_weak_undef {
                        write_u32_le(loc, NOP_T2);
                    } else {
                        let mut val = s + a - p;
                        if t == 0 || !fits(val, 24) {
                            val = thumb_thunk_addr(i) + a - p;
                        }
                        write_thm_b_imm(loc, val as u32);
                    }
                }
                R_ARM_THM_JUMP11 => {
                    debug_assert_bail!(
                        t != 0,
                        "R_ARM_THM_JUMP11 against ARM-encoded `{}`",
                        sym.name
                    );
                    let val = s + a - p;
                    let insn = read_u16_le(loc) & 0xf800;
                    write_u16_le(loc, insn | bits(val as u64, 11, 1) as u16);
                }
                R_ARM_THM_JUMP19 => {
                    let val = s + a - p;
                    check(val, -(1 << 20), 1 << 20);
                    // sign:J2:J1:imm6:imm11:'0'
                    let sign = bit(val as u64, 20) as u16;
                    let j2 = bit(val as u64, 19) as u16;
                    let j1 = bit(val as u64, 18) as u16;
                    let imm6 = bits(val as u64, 17, 12) as u16;
                    let imm11 = bits(val as u64, 11, 1) as u16;
                    let hw0 = read_u16_le(loc) & 0xfbc0;
                    let hw1 = read_u16_le(&loc[2..]) & 0xd000;
                    write_u16_le(loc, hw0 | (sign << 10) | imm6);
                    write_u16_le(&mut loc[2..], hw1 | (j1 << 13) | (j2 << 11) | imm11);
                }
                R_ARM_MOVW_ABS_NC => write_mov_imm(loc, ((s + a) | t as i64) as u32),
                R_ARM_MOVW_PREL_NC => write_mov_imm(loc, (((s + a) | t as i64) - p) as u32),
                R_ARM_MOVT_ABS => write_mov_imm(loc, ((s + a) >> 16) as u32),
                R_ARM_MOVT_PREL => write_mov_imm(loc, ((s + a - p) >> 16) as u32),
                R_ARM_THM_MOVW_ABS_NC => write_thm_mov_imm(loc, ((s + a) | t as i64) as u32),
                R_ARM_THM_MOVW_PREL_NC => {
                    write_thm_mov_imm(loc, (((s + a) | t as i64) - p) as u32);
                }
                R_ARM_THM_MOVT_ABS => write_thm_mov_imm(loc, ((s + a) >> 16) as u32),
                R_ARM_THM_MOVT_PREL => write_thm_mov_imm(loc, ((s + a - p) >> 16) as u32),
                R_ARM_PREL31 => {
                    let val = s + a - p;
                    check(val, -(1 << 30), 1 << 30);
                    let insn = read_u32_le(loc) & 0x8000_0000;
                    write_u32_le(loc, insn | (val as u32 & 0x7fff_ffff));
                }
                R_ARM_TLS_GD32 => {
                    write_u32_le(loc, (sym.tlsgd_addr::<Self>(ctx) as i64 + a - p) as u32);
                }
                R_ARM_TLS_LDM32 => {
                    write_u32_le(loc, (ctx.tlsld_addr(Self::WORD_BYTES) as i64 + a - p) as u32);
                }
                R_ARM_TLS_LDO32 => write_u32_le(loc, (s + a - ctx.tls_begin as i64) as u32),
                R_ARM_TLS_IE32 => {
                    write_u32_le(loc, (sym.gottp_addr::<Self>(ctx) as i64 + a - p) as u32);
                }
                R_ARM_TLS_LE32 => write_u32_le(loc, (s + a - ctx.tp_addr as i64) as u32),
                R_ARM_TLS_GOTDESC => {
                    if sym.has_tlsdesc() {
                        // The addend is odd when the paired TLS_CALL is
                        // Thumb-encoded; the descriptor offset is measured
                        // from the return address either way.
                        let adjust = if a & 1 != 0 { 6 } else { 4 };
                        let desc = sym.tlsdesc_addr::<Self>(ctx) as i64;
                        write_u32_le(loc, (desc - p + a - adjust) as u32);
                    } else {
                        write_u32_le(loc, (s - ctx.tp_addr as i64) as u32);
                    }
                }
                R_ARM_TLS_CALL => {
                    if sym.has_tlsdesc() {
                        // BL to the TLSDESC trampoline.
                        let val = ctx.tls_trampoline_addr() as i64 + a - p - 8;
                        write_u32_le(loc, 0xeb00_0000 | bits(val as u64, 25, 2) as u32);
                    } else {
                        // The descriptor was relaxed; the call becomes a nop.
                        write_u32_le(loc, NOP_ARM);
                    }
                }
                R_ARM_THM_TLS_CALL => {
                    if sym.has_tlsdesc() {
                        let val = ctx.tls_trampoline_addr() as i64 + a - p;
                        write_thm_b_imm(loc, align_to(val as u64, 4) as u32);
                        write_thm_bl_bit(loc, false);
                    } else {
                        write_u32_le(loc, NOP_T2);
                    }
                }
                _ => {
                    ctx.diagnostics.unknown_relocation(
                        &file.name,
                        &section.name,
                        &Self::rel_type_to_string(rel.r_type),
                    );
                }
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
            if rel.r_type == R_ARM_NONE {
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
            let a = frag.map_or_else(|| in_place_addend(loc, rel.r_type), |(_, addend)| addend);

            match rel.r_type {
                R_ARM_ABS32 => {
                    if let Some(val) = tombstone_value(&section.name, sym, frag.map(|(f, _)| f)) {
                        write_u32_le(loc, val as u32);
                    } else {
                        write_u32_le(loc, (s + a) as u32);
                    }
                }
                R_ARM_TLS_LDO32 => {
                    if let Some(val) = tombstone_value(&section.name, sym, frag.map(|(f, _)| f)) {
                        write_u32_le(loc, val as u32);
                    } else {
                        write_u32_le(loc, (s + a - ctx.tls_begin as i64) as u32);
                    }
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
        let offset = ctx.gotplt.address as i64 - ctx.plt.address as i64 - 16;
        write_u32_le(&mut out[16..], offset as u32);
    }

    fn write_plt_entry(ctx: &Context, out: &mut [u8], sym: &Symbol) {
        for (i, insn) in PLT_ENTRY.iter().enumerate() {
            write_u32_le(&mut out[i * 4..], *insn);
        }
        let offset = sym.gotplt_addr::<Self>(ctx) as i64 - sym.plt_addr::<Self>(ctx) as i64 - 12;
        write_u32_le(&mut out[12..], offset as u32);
    }

    fn write_pltgot_entry(ctx: &Context, out: &mut [u8], sym: &Symbol) {
        for (i, insn) in PLT_ENTRY.iter().enumerate() {
            write_u32_le(&mut out[i * 4..], *insn);
        }
        let offset = sym.got_addr::<Self>(ctx) as i64 - sym.plt_addr::<Self>(ctx) as i64 - 12;
        write_u32_le(&mut out[12..], offset as u32);
    }

    fn write_thunk(ctx: &Context, osec: &OutputSection, thunk: &Thunk, out: &mut [u8]) -> Result {
        for (i, insn) in TLS_TRAMPOLINE.iter().enumerate() {
            write_u32_le(&mut out[i * 4..], *insn);
        }

        let base = osec.layout.address + thunk.offset + Self::THUNK_HDR_SIZE;
        for (i, &sym_id) in thunk.symbols.iter().enumerate() {
            let sym = ctx.symbol(sym_id);
            let entry = &mut out[(Self::THUNK_HDR_SIZE + i as u64 * Self::THUNK_SIZE) as usize..];
            entry[..THUNK_ENTRY.len()].copy_from_slice(&THUNK_ENTRY);

            // The literal feeds `add ip, ip, pc` at entry +8, where pc reads
            // as entry +16. The Thumb bit of the target survives into `bx`.
            let entry_addr = base + i as u64 * Self::THUNK_SIZE;
            write_u32_le(&mut entry[16..], (sym.value as i64 - entry_addr as i64 - 16) as u32);
        }
        Ok(())
    }

    fn apply_eh_frame_reloc(
        _ctx: &Context,
        _rel: &Rel,
        _section_addr: u64,
        _offset: u64,
        _value: u64,
        _loc: &mut [u8],
    ) -> Result {
        // ARM32 doesn't use .eh_frame; unwind data lives in .ARM.exidx and
        // .ARM.extab, which are handled by the exidx pass.
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
    use deft_utils::elf::SectionFlags;
    use deft_utils::elf::shf;

    const TEXT_ADDR: u64 = 0x1_0000;

    struct Link {
        ctx: Context,
        files: Vec<InputFile>,
        buf: Vec<u8>,
    }

    impl Link {
        fn run(&mut self) {
            scan_relocations::<Arm32>(&self.ctx, &mut self.files).unwrap();
            assign_reldyn_offsets::<Arm32>(&mut self.files, 0);
            apply_relocations::<Arm32>(&self.ctx, &self.files, &mut self.buf).unwrap();
        }

        fn text_section(&mut self) -> &mut InputSection {
            &mut self.files[0].sections[0]
        }
    }

    fn text_flags() -> SectionFlags {
        SectionFlags::empty().with(shf::ALLOC).with(shf::EXECINSTR)
    }

    fn defined(name: &str, value: u64) -> Symbol {
        let mut sym = Symbol::new(name);
        sym.file = Some(FileId::from_usize(0));
        sym.value = value;
        sym
    }

    /// One input file with a single `.text` section at the start of the
    /// output buffer.
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
        ctx.output_sections.push(OutputSection::new(
            ".text",
            SHT_PROGBITS,
            SectionLayout::new(TEXT_ADDR, 0, section_bytes.len() as u64),
        ));

        let mut section = InputSection::new(".text", text_flags(), OutputSectionId::from_usize(0));
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
    fn test_arm_to_thumb_call_becomes_blx() {
        // bl with an in-place addend of -8, calling a Thumb function.
        let bl = 0xebff_fffe_u32.to_le_bytes();
        let mut link = link_with(
            &bl,
            vec![Rel::new(0, R_ARM_CALL, 0)],
            vec![defined("thumb_fn", 0x2_0001)],
            OutputKind::PositionDependentExecutable,
        );
        link.run();
        assert_eq!(read_u32_le(&link.buf), 0xfa00_3ffe);
        assert!(!link.ctx.diagnostics.has_errors());
    }

    #[test]
    fn test_thm_call_to_weak_undef_becomes_nop() {
        // Thumb bl with zero displacement.
        let bl = [0x00, 0xf0, 0x00, 0xf8];
        let mut weak = Symbol::new("maybe");
        weak.is_weak_undef = true;
        let mut link = link_with(
            &bl,
            vec![Rel::new(0, R_ARM_THM_CALL, 0)],
            vec![weak],
            OutputKind::PositionDependentExecutable,
        );
        link.run();
        assert_eq!(link.buf, [0xaf, 0xf3, 0x00, 0x80]);
        assert!(!link.ctx.diagnostics.has_errors());
    }

    #[test]
    fn test_movw_keeps_thumb_bit() {
        // movw r0, #0. Taking the address of a Thumb function must yield the
        // LSB-set value.
        let movw = 0xe300_0000_u32.to_le_bytes();
        let mut link = link_with(
            &movw,
            vec![Rel::new(0, R_ARM_MOVW_ABS_NC, 0)],
            vec![defined("thumb_fn", 0x8001)],
            OutputKind::PositionDependentExecutable,
        );
        link.run();
        assert_eq!(read_u32_le(&link.buf), 0xe308_0001);
    }

    #[test]
    fn test_jump24_to_thumb_goes_via_thunk() {
        // b with an in-place addend of -8. B can't switch mode, so even a
        // reachable Thumb target is re-routed through the thunk's ARM entry.
        let b = 0xeaff_fffe_u32.to_le_bytes();
        let mut link = link_with(
            &b,
            vec![Rel::new(0, R_ARM_JUMP24, 0)],
            vec![defined("thumb_fn", 0x2_0001)],
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
        // Thunk entry starts at 0x1010c; its ARM entry is 4 bytes in.
        // val = 0x10110 - 8 - 0x10000 = 0x108.
        assert_eq!(read_u32_le(&link.buf), 0xea00_0042);
    }

    #[test]
    fn test_scan_flags_are_monotonic() {
        let mut imported = defined("puts", 0);
        imported.is_imported = true;
        imported.st_type = STT_FUNC;
        let syms = vec![
            defined("data", 0x4000),
            imported,
            defined("tls_a", 0x100),
            defined("tls_b", 0x104),
            defined("tls_c", 0x108),
        ];
        let rels = vec![
            Rel::new(0, R_ARM_GOT_BREL, 0),
            Rel::new(4, R_ARM_THM_CALL, 1),
            Rel::new(8, R_ARM_TLS_GD32, 2),
            Rel::new(12, R_ARM_TLS_LDM32, 3),
            Rel::new(16, R_ARM_TLS_IE32, 4),
            Rel::new(20, 0xff, 0),
        ];
        let mut link = link_with(
            &[0; 24],
            rels,
            syms,
            OutputKind::PositionDependentExecutable,
        );
        scan_relocations::<Arm32>(&link.ctx, &mut link.files).unwrap();

        let flags_of = |link: &Link, i: usize| link.ctx.symbols[i].flags.get();
        assert_eq!(flags_of(&link, 0), SymbolFlags::NEEDS_GOT);
        assert_eq!(flags_of(&link, 1), SymbolFlags::NEEDS_PLT);
        assert_eq!(flags_of(&link, 2), SymbolFlags::NEEDS_TLSGD);
        assert_eq!(flags_of(&link, 4), SymbolFlags::NEEDS_GOTTP);
        assert!(link.ctx.needs_tlsld.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(link.ctx.diagnostics.take_errors().len(), 1);

        // Scanning again changes nothing.
        scan_relocations::<Arm32>(&link.ctx, &mut link.files).unwrap();
        assert_eq!(flags_of(&link, 0), SymbolFlags::NEEDS_GOT);
        assert_eq!(flags_of(&link, 1), SymbolFlags::NEEDS_PLT);
        assert_eq!(link.files[0].num_dynrel, 0);
    }

    #[test]
    fn test_abs32_in_pie_emits_relative_dynrel() {
        // A word with an in-place addend of 4.
        let word = 4_u32.to_le_bytes();
        let mut link = link_with(
            &word,
            vec![Rel::new(0, R_ARM_ABS32, 0)],
            vec![defined("local", 0x1_2345)],
            OutputKind::PositionIndependentExecutable,
        );
        link.ctx.reldyn = Some(SectionLayout::new(0x3000, 0x200, 8));
        link.buf.resize(0x208, 0);
        link.run();

        assert_eq!(link.files[0].num_dynrel, 1);
        // In-place value is S + A; the record is R_ARM_RELATIVE at P.
        assert_eq!(read_u32_le(&link.buf), 0x1_2349);
        assert_eq!(read_u32_le(&link.buf[0x200..]), TEXT_ADDR as u32);
        assert_eq!(read_u32_le(&link.buf[0x204..]), R_ARM_RELATIVE);
    }

    #[test]
    fn test_got_prel() {
        let word = 0_u32.to_le_bytes();
        let mut got_user = defined("val", 0x4000);
        got_user.got_idx = Some(2);
        let mut link = link_with(
            &word,
            vec![Rel::new(0, object::elf::R_ARM_GOT_PREL, 0)],
            vec![got_user],
            OutputKind::PositionDependentExecutable,
        );
        link.ctx.got = SectionLayout::new(0x3_0000, 0x300, 0x10);
        link.run();
        // GOT + G + A - P = 0x30008 - 0x10000.
        assert_eq!(read_u32_le(&link.buf), 0x2_0008);
    }

    #[test]
    fn test_plt_writers() {
        let mut ctx = Context::new(LinkOptions::default());
        ctx.plt = SectionLayout::new(0x5000, 0x500, 48);
        ctx.gotplt = SectionLayout::new(0x6000, 0x600, 12);
        let mut sym = defined("ext", 0);
        sym.plt_idx = Some(0);
        sym.gotplt_idx = Some(0);
        ctx.symbols.push(sym);
        ctx.plt_symbols.push(SymbolId::from_usize(0));

        let mut buf = vec![0; 0x700];
        write_plt::<Arm32>(&ctx, &mut buf).unwrap();

        // Header preamble and its .got.plt offset literal.
        assert_eq!(read_u32_le(&buf[0x500..]), 0xe52d_e004);
        assert_eq!(read_u32_le(&buf[0x500 + 16..]), 0x6000 - 0x5000 - 16);
        // First entry at header end; literal points at .got.plt[0].
        assert_eq!(read_u32_le(&buf[0x520..]), 0xe59f_c004);
        assert_eq!(read_u32_le(&buf[0x520 + 12..]), 0x6000 - 0x5020 - 12);
    }

    #[test]
    fn test_thunk_writer() {
        let mut ctx = Context::new(LinkOptions::default());
        ctx.output_sections.push(OutputSection::new(
            ".text",
            SHT_PROGBITS,
            SectionLayout::new(TEXT_ADDR, 0, 0x200),
        ));
        ctx.symbols.push(defined("far_thumb", 0x2_0001));
        ctx.output_sections[0]
            .thunks
            .push(Thunk::new(0x100, vec![SymbolId::from_usize(0)]));

        let mut buf = vec![0; 0x200];
        write_thunks::<Arm32>(&ctx, &mut buf).unwrap();

        // The TLSDESC trampoline heads the thunk area.
        assert_eq!(read_u32_le(&buf[0x100..]), 0xe08e_0000);
        assert_eq!(ctx.tls_trampoline_addr(), TEXT_ADDR + 0x100);
        // Entry 0: Thumb mode-switch prologue, then the ARM springboard.
        assert_eq!(&buf[0x10c..0x110], &[0xfc, 0x46, 0x60, 0x47]);
        // Literal = S - entry - 16 = 0x20001 - 0x1010c - 16.
        assert_eq!(read_u32_le(&buf[0x10c + 16..]), 0xfee5);
    }

    #[test]
    fn test_nonalloc_tombstones() {
        let mut dead = defined("discarded", 0x4000);
        dead.origin_dead = true;
        let live = defined("kept", 0x4000);

        let mut link = link_with(
            &[0; 8],
            vec![Rel::new(0, R_ARM_ABS32, 0), Rel::new(4, R_ARM_ABS32, 1)],
            vec![dead, live],
            OutputKind::PositionDependentExecutable,
        );
        link.text_section().name = ".debug_info".to_owned();
        link.text_section().flags = SectionFlags::empty();
        apply_relocations::<Arm32>(&link.ctx, &link.files, &mut link.buf).unwrap();

        assert_eq!(read_u32_le(&link.buf), u32::MAX);
        assert_eq!(read_u32_le(&link.buf[4..]), 0x4000);
    }

    #[test]
    fn test_nonalloc_rejects_code_relocations() {
        let mut link = link_with(
            &[0; 4],
            vec![Rel::new(0, R_ARM_CALL, 0)],
            vec![defined("f", 0x4000)],
            OutputKind::PositionDependentExecutable,
        );
        link.text_section().flags = SectionFlags::empty();
        let result = apply_relocations::<Arm32>(&link.ctx, &link.files, &mut link.buf);
        assert!(result.is_err());
    }
}
