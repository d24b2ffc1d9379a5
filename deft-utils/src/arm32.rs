//! Instruction-level encoders for the 32-bit ARM back-end.
//!
//! ARM32 carries immediates in several awkward shapes: MOVW/MOVT split a
//! 16-bit value into imm4/imm12 (ARM) or imm4/i/imm3/imm8 (Thumb2), and the
//! Thumb2 branch family scrambles a 25-bit displacement across two half-words
//! with the J1/J2 bits stored inverted relative to the sign. The psABI also
//! uses REL-format relocations, so addends have to be decoded back out of
//! these same fields.

use crate::bit_misc::bit;
use crate::bit_misc::bits;
use crate::bit_misc::read_u16_le;
use crate::bit_misc::read_u32_le;
use crate::bit_misc::sign_extend;
use crate::bit_misc::write_u16_le;
use crate::bit_misc::write_u32_le;
use crate::elf::R_ARM_BASE_PREL;
use crate::elf::R_ARM_GOT_BREL;
use crate::elf::R_ARM_THM_CALL;
use crate::elf::R_ARM_THM_JUMP11;

/// `nop` in the ARM encoding.
pub const NOP_ARM: u32 = 0xe320_f000;

/// `nop.w` in the Thumb2 encoding. The two half-words land in ascending
/// address order, so as a single little-endian word the second half-word
/// occupies the high bits.
pub const NOP_T2: u32 = 0x8000_f3af;

/// Patches the 16-bit immediate of an ARM MOVW/MOVT instruction. The
/// condition and opcode fields (mask `0xfff0_f000`) are preserved.
pub fn write_mov_imm(loc: &mut [u8], value: u32) {
    let imm12 = bits(value.into(), 11, 0) as u32;
    let imm4 = bits(value.into(), 15, 12) as u32;
    let insn = read_u32_le(loc) & 0xfff0_f000;
    write_u32_le(loc, insn | (imm4 << 16) | imm12);
}

/// Patches the 16-bit immediate of a Thumb2 MOVW/MOVT instruction, which is
/// split as imm4:i:imm3:imm8 across the two half-words.
pub fn write_thm_mov_imm(loc: &mut [u8], value: u32) {
    let imm4 = bits(value.into(), 15, 12) as u16;
    let i = bit(value.into(), 11) as u16;
    let imm3 = bits(value.into(), 10, 8) as u16;
    let imm8 = bits(value.into(), 7, 0) as u16;
    let hw0 = read_u16_le(loc) & 0xfbf0;
    let hw1 = read_u16_le(&loc[2..]) & 0x8f00;
    write_u16_le(loc, hw0 | (i << 10) | imm4);
    write_u16_le(&mut loc[2..], hw1 | (imm3 << 12) | imm8);
}

/// Patches the 25-bit displacement of a Thumb2 B.W/BL/BLX instruction.
/// J1 and J2 are stored inverted relative to the sign bit. Bit 12 of the
/// second half-word distinguishes BL from BLX and is preserved; use
/// [`write_thm_bl_bit`] to rewrite it.
pub fn write_thm_b_imm(loc: &mut [u8], value: u32) {
    let value = u64::from(value);
    let sign = bit(value, 24) as u16;
    let i1 = bit(value, 23) as u16;
    let i2 = bit(value, 22) as u16;
    let j1 = (i1 ^ 1) ^ sign;
    let j2 = (i2 ^ 1) ^ sign;
    let imm10 = bits(value, 21, 12) as u16;
    let imm11 = bits(value, 11, 1) as u16;
    let hw0 = read_u16_le(loc) & 0xf800;
    let hw1 = read_u16_le(&loc[2..]) & 0xd000;
    write_u16_le(loc, hw0 | (sign << 10) | imm10);
    write_u16_le(&mut loc[2..], hw1 | (j1 << 13) | (j2 << 11) | imm11);
}

/// Decodes the displacement encoded by [`write_thm_b_imm`], sign bits and
/// all. The result occupies the low 25 bits.
#[must_use]
pub fn thm_b_imm(loc: &[u8]) -> u64 {
    let hw0 = u64::from(read_u16_le(loc));
    let hw1 = u64::from(read_u16_le(&loc[2..]));
    let sign = bit(hw0, 10);
    let j1 = bit(hw1, 13);
    let j2 = bit(hw1, 11);
    let i1 = (j1 ^ sign) ^ 1;
    let i2 = (j2 ^ sign) ^ 1;
    let imm10 = bits(hw0, 9, 0);
    let imm11 = bits(hw1, 10, 0);
    (sign << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1)
}

/// Rewrites a Thumb2 BL into a BLX or back without disturbing the encoded
/// displacement.
pub fn write_thm_bl_bit(loc: &mut [u8], is_bl: bool) {
    let hw1 = read_u16_le(&loc[2..]);
    let hw1 = if is_bl { hw1 | 0x1000 } else { hw1 & !0x1000 };
    write_u16_le(&mut loc[2..], hw1);
}

/// Reads the implicit addend stored in the relocated field itself. ARM32 uses
/// REL-format relocations, so this is where addends live. Relocation types
/// whose fields carry no addend decode as zero.
#[must_use]
pub fn in_place_addend(loc: &[u8], r_type: u32) -> i64 {
    use object::elf::*;

    match r_type {
        R_ARM_ABS32 | R_ARM_REL32 | R_ARM_TARGET1 | R_ARM_TARGET2 | R_ARM_BASE_PREL
        | R_ARM_GOT_PREL | R_ARM_GOT_BREL | R_ARM_TLS_GD32 | R_ARM_TLS_LDM32 | R_ARM_TLS_LDO32
        | R_ARM_TLS_IE32 | R_ARM_TLS_LE32 | R_ARM_TLS_GOTDESC => {
            i64::from(read_u32_le(loc) as i32)
        }
        R_ARM_THM_JUMP11 => (sign_extend(u64::from(read_u16_le(loc)), 10) as i64) << 1,
        R_ARM_CALL | R_ARM_JUMP24 | R_ARM_TLS_CALL => {
            (sign_extend(u64::from(read_u32_le(loc)), 23) as i64) << 2
        }
        R_ARM_THM_CALL | R_ARM_THM_JUMP24 | R_ARM_THM_TLS_CALL => {
            sign_extend(thm_b_imm(loc), 24) as i64
        }
        R_ARM_PREL31 => sign_extend(u64::from(read_u32_le(loc)), 30) as i64,
        R_ARM_MOVW_ABS_NC | R_ARM_MOVW_PREL_NC | R_ARM_MOVT_ABS | R_ARM_MOVT_PREL => {
            let insn = u64::from(read_u32_le(loc));
            let imm12 = bits(insn, 11, 0);
            let imm4 = bits(insn, 19, 16);
            sign_extend((imm4 << 12) | imm12, 15) as i64
        }
        R_ARM_THM_MOVW_ABS_NC | R_ARM_THM_MOVW_PREL_NC | R_ARM_THM_MOVT_ABS
        | R_ARM_THM_MOVT_PREL => {
            let hw0 = u64::from(read_u16_le(loc));
            let hw1 = u64::from(read_u16_le(&loc[2..]));
            let imm4 = bits(hw0, 3, 0);
            let i = bit(hw0, 10);
            let imm3 = bits(hw1, 14, 12);
            let imm8 = bits(hw1, 7, 0);
            sign_extend((imm4 << 12) | (i << 11) | (imm3 << 8) | imm8, 15) as i64
        }
        _ => 0,
    }
}
