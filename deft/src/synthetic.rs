//! Writers for the synthetic PLT sections. The tables were sized and their
//! entries assigned to symbols before this runs; all that's left is to
//! materialize the stub bytes.

use crate::apply::section_slice;
use crate::arch::Arch;
use crate::context::Context;
use crate::error::Result;
use anyhow::ensure;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSliceMut;

/// Writes the PLT header and one entry per symbol in `ctx.plt_symbols`.
#[tracing::instrument(skip_all, name = "Write PLT")]
pub fn write_plt<A: Arch>(ctx: &Context, buf: &mut [u8]) -> Result {
    if ctx.plt_symbols.is_empty() {
        return Ok(());
    }
    let plt = section_slice(buf, &ctx.plt)?;
    ensure!(
        plt.len() as u64
            == A::PLT_HDR_SIZE + ctx.plt_symbols.len() as u64 * A::PLT_ENTRY_SIZE,
        ".plt size doesn't match the number of PLT symbols"
    );

    let (header, entries) = plt.split_at_mut(A::PLT_HDR_SIZE as usize);
    A::write_plt_header(ctx, header);

    entries
        .par_chunks_exact_mut(A::PLT_ENTRY_SIZE as usize)
        .zip(ctx.plt_symbols.par_iter())
        .for_each(|(out, &sym)| A::write_plt_entry(ctx, out, ctx.symbol(sym)));
    Ok(())
}

/// Writes the `.plt.got` entries: stubs for symbols that already have a
/// regular GOT entry and therefore skip `.got.plt`.
#[tracing::instrument(skip_all, name = "Write PLT-GOT")]
pub fn write_pltgot<A: Arch>(ctx: &Context, buf: &mut [u8]) -> Result {
    if ctx.pltgot_symbols.is_empty() {
        return Ok(());
    }
    let pltgot = section_slice(buf, &ctx.pltgot)?;
    ensure!(
        pltgot.len() as u64 == ctx.pltgot_symbols.len() as u64 * A::PLTGOT_ENTRY_SIZE,
        ".plt.got size doesn't match the number of PLT-GOT symbols"
    );

    pltgot
        .par_chunks_exact_mut(A::PLTGOT_ENTRY_SIZE as usize)
        .zip(ctx.pltgot_symbols.par_iter())
        .for_each(|(out, &sym)| A::write_pltgot_entry(ctx, out, ctx.symbol(sym)));
    Ok(())
}
