//! Materializes range-extension thunks. Layout decided where each thunk
//! lives and which symbols it serves; this pass fills in the stub bytes once
//! every address is final.

use crate::arch::Arch;
use crate::context::Context;
use crate::error::Result;
use crate::layout::OutputSection;
use crate::layout::Thunk;
use crate::slice::take_prefix_mut;
use anyhow::Context as _;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;

struct ThunkJob<'a, 'out> {
    osec: &'a OutputSection,
    thunk: &'a Thunk,
    out: &'out mut [u8],
}

/// Writes every thunk in every output section, in parallel across thunks.
/// Thunk regions are disjoint from each other and from the input sections
/// patched by the apply phase, so each job owns its slice outright.
#[tracing::instrument(skip_all, name = "Write thunks")]
pub fn write_thunks<A: Arch>(ctx: &Context, buf: &mut [u8]) -> Result {
    let mut regions: Vec<(u64, &OutputSection, &Thunk)> = ctx
        .output_sections
        .iter()
        .flat_map(|osec| {
            osec.thunks
                .iter()
                .map(move |thunk| (osec.layout.file_offset + thunk.offset, osec, thunk))
        })
        .collect();
    regions.sort_unstable_by_key(|&(offset, ..)| offset);

    let mut jobs = Vec::with_capacity(regions.len());
    let mut rest = buf;
    let mut pos = 0u64;
    for (offset, osec, thunk) in regions {
        let padding = offset
            .checked_sub(pos)
            .context("Overlapping thunks; layout must keep them disjoint")?;
        take_prefix_mut(&mut rest, padding as usize);
        let size = thunk.size_in_bytes::<A>();
        jobs.push(ThunkJob {
            osec,
            thunk,
            out: take_prefix_mut(&mut rest, size as usize),
        });
        pos = offset + size;
    }

    jobs.into_par_iter()
        .try_for_each(|job| A::write_thunk(ctx, job.osec, job.thunk, job.out))
}
