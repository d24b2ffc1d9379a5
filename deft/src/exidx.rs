//! `.ARM.exidx` post-processing.
//!
//! Exception-index entries are 8-byte pairs of a self-relative 31-bit
//! function address and an unwind value. The unwinder binary-searches the
//! table, so entries must be sorted by the function address they describe.
//! Input order isn't address order once sections have been shuffled by
//! layout, so after everything else is written we rewrite the table: make
//! the addresses section-relative, sort, and make them self-relative again.

use crate::apply::section_slice;
use crate::context::Context;
use crate::error::Result;
use anyhow::bail;
use deft_utils::bit_misc::read_u32_le;
use deft_utils::bit_misc::sign_extend;
use deft_utils::bit_misc::write_u32_le;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSliceMut;

pub const EXIDX_CANTUNWIND: u32 = 1;

#[derive(Clone, Copy)]
struct Entry {
    /// Function address, section-relative while we work on the table.
    addr: i64,
    /// `EXIDX_CANTUNWIND`, an inline compact unwind record (top bit set), or
    /// a 31-bit relative pointer into `.ARM.extab` (top bit clear).
    val: u32,
}

/// Whether `val` is a relative `.ARM.extab` reference that has to be
/// rebased along with the entry.
fn is_relative(val: u32) -> bool {
    val != EXIDX_CANTUNWIND && val & 0x8000_0000 == 0
}

/// Sorts the `.ARM.exidx` output section by function address. Running this a
/// second time is a no-op.
#[tracing::instrument(skip_all, name = "Fix up .ARM.exidx")]
pub fn fixup_exidx(ctx: &Context, buf: &mut [u8]) -> Result {
    let Some(osec) = ctx
        .output_sections
        .iter()
        .find(|osec| osec.sh_type == object::elf::SHT_ARM_EXIDX)
    else {
        return Ok(());
    };

    if osec.layout.size % 8 != 0 {
        bail!("Invalid .ARM.exidx section size: 0x{:x}", osec.layout.size);
    }

    let data = section_slice(buf, &osec.layout)?;

    let mut entries: Vec<Entry> = data
        .chunks_exact(8)
        .map(|pair| Entry {
            addr: sign_extend(u64::from(read_u32_le(pair)), 30) as i64,
            val: read_u32_le(&pair[4..]),
        })
        .collect();

    // Addresses are relative to the entries themselves. Translate them to be
    // section-relative so that sorting doesn't change their meaning.
    entries.par_iter_mut().enumerate().for_each(|(i, entry)| {
        let offset = 8 * i as i64;
        entry.addr += offset;
        if is_relative(entry.val) {
            entry.val = 0x7fff_ffff & entry.val.wrapping_add(offset as u32);
        }
    });

    entries.par_sort_unstable_by_key(|entry| entry.addr);

    // Translate back to self-relative form at each entry's new position.
    entries.par_iter_mut().enumerate().for_each(|(i, entry)| {
        let offset = 8 * i as i64;
        entry.addr = i64::from(0x7fff_ffff & (entry.addr - offset) as u32);
        if is_relative(entry.val) {
            entry.val = 0x7fff_ffff & entry.val.wrapping_sub(offset as u32);
        }
    });

    for (pair, entry) in data.chunks_exact_mut(8).zip(entries) {
        write_u32_le(pair, entry.addr as u32);
        write_u32_le(&mut pair[4..], entry.val);
    }
    Ok(())
}
