//! The relocation apply phase.
//!
//! By the time this runs, every input section's raw bytes have been copied to
//! their final position in the output buffer and all addresses are final.
//! Applying walks each section's relocations once and patches machine code in
//! place, pushing dynamic relocations into the section's pre-reserved slice
//! of `.rel.dyn` as the policy tables dictate.
//!
//! Sections are processed in parallel. Each job owns two disjoint mutable
//! slices of the output buffer (its content and its `.rel.dyn` slice), carved
//! out up front, so the parallel loop needs no synchronization at all.

use crate::arch::Arch;
use crate::context::Context;
use crate::debug_assert_bail;
use crate::elf::DynamicRelocationKind;
use crate::error::Result;
use crate::layout::Fragment;
use crate::layout::InputFile;
use crate::layout::InputSection;
use crate::layout::SectionLayout;
use crate::scan::PolicyTable;
use crate::scan::ScanAction;
use crate::scan::get_absrel_action;
use crate::slice::try_take_prefix_mut;
use crate::symbol::Symbol;
use anyhow::Context as _;
use deft_utils::bit_misc::write_u32_le;
use deft_utils::bit_misc::write_u64_le;
use rayon::iter::IntoParallelIterator;
use rayon::iter::ParallelIterator;

/// Cursor into an input section's slice of `.rel.dyn`. Advanced exactly once
/// per relocation that emits a dynamic relocation; the scan phase counted
/// those, so the slice is exhausted exactly when the section is done.
pub struct DynRelWriter<'out> {
    out: &'out mut [u8],
}

impl<'out> DynRelWriter<'out> {
    pub fn new(out: &'out mut [u8]) -> Self {
        Self { out }
    }

    pub(crate) fn emit<A: Arch>(
        &mut self,
        place: u64,
        kind: DynamicRelocationKind,
        dynsym: u32,
        addend: i64,
    ) -> Result {
        let entry = try_take_prefix_mut(&mut self.out, A::DYNREL_SIZE as usize)
            .context("Insufficient .rel.dyn allocation")?;
        A::write_dynrel(entry, place, A::dynamic_rel_type(kind), dynsym, addend);
        Ok(())
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.out.is_empty()
    }
}

pub(crate) fn write_word<A: Arch>(loc: &mut [u8], value: u64) {
    if A::WORD_BYTES == 4 {
        write_u32_le(loc, value as u32);
    } else {
        write_u64_le(loc, value);
    }
}

/// Applies an address-sized absolute relocation the way the policy table
/// says: write the link-time value, emit a dynamic relocation, or both. The
/// decisions here mirror the scan phase exactly; that is what keeps the
/// `.rel.dyn` cursor in step.
pub(crate) fn apply_dyn_absrel<A: Arch>(
    ctx: &Context,
    sym: &Symbol,
    writable: bool,
    loc: &mut [u8],
    s: u64,
    a: i64,
    p: u64,
    dynrel: &mut DynRelWriter,
    table: &PolicyTable,
) -> Result {
    let value = s.wrapping_add_signed(a);
    let apply_dynamic = ctx.options.apply_dynamic_relocs || !A::IS_RELA;

    match get_absrel_action(ctx, sym, table) {
        ScanAction::None | ScanAction::CopyRel | ScanAction::CanonicalPlt => {
            write_word::<A>(loc, value);
        }
        ScanAction::BaseRel => {
            dynrel.emit::<A>(p, DynamicRelocationKind::Relative, 0, value as i64)?;
            if apply_dynamic {
                write_word::<A>(loc, value);
            }
        }
        ScanAction::DynCopyRel => {
            if !writable && ctx.options.allow_copy_relocs {
                write_word::<A>(loc, value);
            } else {
                dynrel.emit::<A>(p, DynamicRelocationKind::Absolute, sym.dynsym_idx, a)?;
                if apply_dynamic {
                    write_word::<A>(loc, a as u64);
                }
            }
        }
        ScanAction::DynCanonicalPlt => {
            if !writable {
                write_word::<A>(loc, value);
            } else {
                dynrel.emit::<A>(p, DynamicRelocationKind::Absolute, sym.dynsym_idx, a)?;
                if apply_dynamic {
                    write_word::<A>(loc, a as u64);
                }
            }
        }
        ScanAction::DynRel => {
            dynrel.emit::<A>(p, DynamicRelocationKind::Absolute, sym.dynsym_idx, a)?;
            if apply_dynamic {
                write_word::<A>(loc, a as u64);
            }
        }
        ScanAction::IfuncDynRel => {
            dynrel.emit::<A>(p, DynamicRelocationKind::Irelative, 0, value as i64)?;
            if apply_dynamic {
                write_word::<A>(loc, value);
            }
        }
        action @ (ScanAction::Error | ScanAction::Plt) => {
            unreachable!("absolute relocation policy returned {action:?}")
        }
    }
    Ok(())
}

/// The sentinel written over references to discarded targets in `.debug_*`
/// sections. Dead references resolve to 0 in the list-structured sections,
/// where 0 already terminates entries, and to -1 elsewhere.
pub(crate) fn tombstone_value(
    section_name: &str,
    sym: &Symbol,
    frag: Option<&Fragment>,
) -> Option<u64> {
    let dead = match frag {
        Some(frag) => !frag.is_alive,
        None => sym.origin_dead,
    };
    if !dead || !section_name.starts_with(".debug") {
        return None;
    }
    if section_name == ".debug_loc" || section_name == ".debug_ranges" {
        Some(0)
    } else {
        Some(!0)
    }
}

/// Resolves a relocation's merged-fragment reference, if it has one,
/// yielding the (S, A) pair to relocate against.
pub(crate) fn resolve_fragment<'a>(
    ctx: &'a Context,
    section: &InputSection,
    rel_index: usize,
) -> Option<(&'a Fragment, i64)> {
    let merged = section.merged_ref(rel_index)?;
    Some((&ctx.fragments[merged.fragment.as_usize()], merged.addend))
}

/// The slice of the output buffer backing a synthetic section.
pub(crate) fn section_slice<'out>(
    buf: &'out mut [u8],
    layout: &SectionLayout,
) -> Result<&'out mut [u8]> {
    let start = layout.file_offset as usize;
    let end = start + layout.size as usize;
    buf.get_mut(start..end).with_context(|| {
        format!("Section at 0x{start:x}..0x{end:x} extends past the end of the output buffer")
    })
}

struct ApplyJob<'a, 'out> {
    file: &'a InputFile,
    section: &'a InputSection,
    out: &'out mut [u8],
    reldyn: Option<&'out mut [u8]>,
}

/// Patches every input section, in parallel. Allocated sections may emit
/// dynamic relocations; non-allocated sections get tombstone handling
/// instead. Per-section errors were already buffered by the scan phase where
/// possible; errors returned here are fatal.
#[tracing::instrument(skip_all, name = "Apply relocations")]
pub fn apply_relocations<A: Arch>(ctx: &Context, files: &[InputFile], buf: &mut [u8]) -> Result {
    let jobs = split_into_jobs::<A>(ctx, files, buf)?;

    jobs.into_par_iter().try_for_each(|job| {
        let (file, section) = (job.file, job.section);
        apply_section::<A>(ctx, job).with_context(|| {
            format!("Failed to apply relocations in {}:({})", file.name, section.name)
        })
    })
}

fn apply_section<A: Arch>(ctx: &Context, job: ApplyJob) -> Result {
    if job.section.is_alloc() {
        let mut dynrel = DynRelWriter::new(job.reldyn.unwrap_or_default());
        A::apply_alloc(ctx, job.file, job.section, job.out, &mut dynrel)?;
        debug_assert_bail!(
            dynrel.is_exhausted(),
            "Section {}:({}) emitted fewer dynamic relocations than the scan phase counted",
            job.file.name,
            job.section.name
        );
        Ok(())
    } else {
        A::apply_nonalloc(ctx, job.file, job.section, job.out)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Content,
    RelDyn,
}

struct Region {
    offset: u64,
    size: u64,
    file: usize,
    section: usize,
    kind: RegionKind,
}

/// Carves the output buffer into one content slice per input section plus
/// one `.rel.dyn` slice per section that emits dynamic relocations. Layout
/// guarantees the regions are disjoint; overlap is a fatal contract
/// violation.
fn split_into_jobs<'a, 'out, A: Arch>(
    ctx: &'a Context,
    files: &'a [InputFile],
    buf: &'out mut [u8],
) -> Result<Vec<ApplyJob<'a, 'out>>> {
    let mut regions = Vec::new();
    for (file_idx, file) in files.iter().enumerate() {
        for (section_idx, section) in file.sections.iter().enumerate() {
            let osec = ctx
                .output_sections
                .get(section.output_section.as_usize())
                .with_context(|| {
                    format!("Section {}:({}) has no output section", file.name, section.name)
                })?;
            regions.push(Region {
                offset: osec.layout.file_offset + section.offset,
                size: section.size,
                file: file_idx,
                section: section_idx,
                kind: RegionKind::Content,
            });

            if section.is_alloc() && section.num_dynrel > 0 {
                let reldyn = ctx.reldyn.as_ref().context(
                    "Sections emit dynamic relocations, but no .rel.dyn was allocated",
                )?;
                regions.push(Region {
                    offset: reldyn.file_offset + file.reldyn_offset + section.reldyn_offset,
                    size: u64::from(section.num_dynrel) * A::DYNREL_SIZE,
                    file: file_idx,
                    section: section_idx,
                    kind: RegionKind::RelDyn,
                });
            }
        }
    }
    regions.sort_unstable_by_key(|r| (r.offset, r.offset + r.size));

    let mut content: Vec<Vec<Option<&'out mut [u8]>>> = files
        .iter()
        .map(|file| file.sections.iter().map(|_| None).collect())
        .collect();
    let mut reldyn: Vec<Vec<Option<&'out mut [u8]>>> = files
        .iter()
        .map(|file| file.sections.iter().map(|_| None).collect())
        .collect();

    let mut rest = buf;
    let mut pos = 0u64;
    for region in regions {
        let padding = region
            .offset
            .checked_sub(pos)
            .context("Overlapping write regions; layout must keep sections disjoint")?;
        try_take_prefix_mut(&mut rest, padding as usize)
            .context("Write region starts past the end of the output buffer")?;
        let slice = try_take_prefix_mut(&mut rest, region.size as usize)
            .context("Write region extends past the end of the output buffer")?;
        match region.kind {
            RegionKind::Content => content[region.file][region.section] = Some(slice),
            RegionKind::RelDyn => reldyn[region.file][region.section] = Some(slice),
        }
        pos = region.offset + region.size;
    }

    let mut jobs = Vec::new();
    for (file_idx, file) in files.iter().enumerate() {
        for (section_idx, section) in file.sections.iter().enumerate() {
            let out = content[file_idx][section_idx]
                .take()
                .expect("every section was given a content slice");
            jobs.push(ApplyJob {
                file,
                section,
                out,
                reldyn: reldyn[file_idx][section_idx].take(),
            });
        }
    }
    Ok(jobs)
}
