//! Offset optimizer.
//!
//! After all rewrites the image's segments still sit at their overlay
//! positions. This stage computes the final write plan: dense, page-aligned
//! file offsets assigned in segment iteration order, an `__EXTRA_OBJC`
//! segment materialized for synthesized ObjC data, and every tracked
//! linkedit offset field rewritten for the linkedit segment's final home.

use zerocopy::FromBytes;

use crate::arch::{is_arm64_family, Pointer};
use crate::error::{Error, Result};
use crate::macho::{RawSection, RawSegment, SegmentInfo};
use crate::provider::LinkeditTracker;
use crate::util::align_up;

use super::{ExtractionContext, EXTRA_SEGMENT_NAME};

/// VM_PROT_READ | VM_PROT_WRITE
const PROT_RW: u32 = 0x3;

/// One run of bytes in the output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProcedure {
    /// Offset in the output file.
    pub write_offset: u64,
    /// Number of bytes.
    pub size: u64,
    /// Where the bytes come from.
    pub source: WriteSource,
}

/// Source of a write procedure's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    /// The image overlay buffer, at this offset.
    Image {
        /// Buffer offset of the first byte.
        offset: usize,
    },
    /// The extra-data region, from its start.
    ExtraData,
}

/// Returns the page alignment for the cache architecture.
fn page_alignment(arch: &str) -> u64 {
    if is_arm64_family(arch) {
        0x4000
    } else {
        0x1000
    }
}

/// Appends the `__EXTRA_OBJC` segment command for the extra-data region.
///
/// The command is inserted after the `__LINKEDIT` segment command through
/// the linkedit tracker, whose header-space check is the hard limit.
fn materialize_extra_segment<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    tracker: &mut LinkeditTracker,
) -> Result<()> {
    let Some(extra) = ctx.extra_data.as_ref() else {
        return Ok(());
    };
    if extra.is_empty() {
        return Ok(());
    }

    let page = page_alignment(ctx.cache.architecture());
    let mut command = P::RawSegment::default();
    command.set_name(EXTRA_SEGMENT_NAME);
    command.set_vmaddr(extra.base_addr());
    command.set_vmsize(align_up(extra.data().len() as u64, page));
    command.set_fileoff(0); // assigned by the sweep below
    command.set_filesize(extra.data().len() as u64);
    command.set_maxprot(PROT_RW);
    command.set_initprot(PROT_RW);
    command.set_nsects(0);

    let linkedit_cmd_offset = ctx
        .image
        .segment("__LINKEDIT")
        .map(|seg| seg.command_offset)
        .ok_or_else(|| Error::SegmentNotFound {
            name: "__LINKEDIT".into(),
        })?;

    let mut bytes = vec![0u8; P::RawSegment::SIZE];
    bytes.copy_from_slice(zerocopy::IntoBytes::as_bytes(&command));
    let inserted =
        tracker.insert_load_command(&mut ctx.image, Some(linkedit_cmd_offset), &bytes)?;
    if !inserted {
        return Err(Error::InsufficientLoadCommandSpace {
            needed: P::RawSegment::SIZE,
            available: ctx.image.header_space_available(),
        });
    }

    ctx.activity.info(&format!(
        "materialized {} ({} bytes)",
        EXTRA_SEGMENT_NAME,
        extra.data().len()
    ));
    Ok(())
}

/// Assigns dense output offsets and builds the write plan.
pub fn optimize_offsets<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
) -> Result<Vec<WriteProcedure>> {
    ctx.activity.info("optimizing file offsets");

    let mut tracker = ctx.linkedit_tracker.take();
    if let Some(tracker) = tracker.as_mut() {
        materialize_extra_segment(ctx, tracker)?;
    } else if ctx.extra_data.is_some() {
        ctx.activity
            .warn("extra data dropped: linkedit optimizer did not run");
        ctx.extra_data = None;
    }

    let page = page_alignment(ctx.cache.architecture());

    // Snapshot segments before mutating their commands.
    struct SegPlan<P: Pointer> {
        command: P::RawSegment,
        command_offset: usize,
        section_offsets: Vec<usize>,
        buffer_off: Option<usize>,
        is_linkedit: bool,
        is_extra: bool,
    }
    let plans: Vec<SegPlan<P>> = ctx
        .image
        .segments()
        .map(|seg: &SegmentInfo<P>| {
            let name = seg.name().to_string();
            SegPlan {
                command: seg.command,
                command_offset: seg.command_offset,
                section_offsets: seg.sections.iter().map(|s| s.struct_offset).collect(),
                buffer_off: ctx.image.addr_to_offset(seg.command.vmaddr()),
                is_linkedit: name == "__LINKEDIT",
                is_extra: name == EXTRA_SEGMENT_NAME,
            }
        })
        .collect();

    let mut procedures = Vec::with_capacity(plans.len());
    let mut cursor = 0u64;

    for mut plan in plans {
        let filesize = plan.command.filesize();
        if filesize == 0 && !plan.is_extra {
            // Zerofill-only segments occupy no file bytes.
            plan.command.set_fileoff(0);
            ctx.image.write_struct(plan.command_offset, &plan.command)?;
            continue;
        }

        if plan.is_extra {
            procedures.push(WriteProcedure {
                write_offset: cursor,
                size: filesize,
                source: WriteSource::ExtraData,
            });
        } else {
            let buffer_off = plan.buffer_off.ok_or_else(|| {
                Error::parse(plan.command_offset, "segment has no materialized bytes")
            })?;
            procedures.push(WriteProcedure {
                write_offset: cursor,
                size: filesize,
                source: WriteSource::Image { offset: buffer_off },
            });
        }

        let delta = cursor as i64 - plan.command.fileoff() as i64;
        plan.command.set_fileoff(cursor);
        ctx.image.write_struct(plan.command_offset, &plan.command)?;

        // Shift the segment's section offsets by the same delta.
        for struct_offset in plan.section_offsets {
            let mut section = P::RawSection::read_from_prefix(&ctx.image.data[struct_offset..])
                .map_err(|_| Error::parse(struct_offset, "failed to re-read section"))?
                .0;
            if section.offset() != 0 {
                section.set_offset((section.offset() as i64 + delta) as u32);
                ctx.image.write_struct(struct_offset, &section)?;
            }
        }

        if plan.is_linkedit {
            if let Some(tracker) = tracker.as_mut() {
                tracker.change_base_fileoff(&mut ctx.image, cursor)?;
            }
        }

        cursor = align_up(cursor + filesize, page);
    }

    ctx.linkedit_tracker = tracker;
    ctx.image.reparse_load_commands()?;
    Ok(procedures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment_per_arch() {
        assert_eq!(page_alignment("arm64e"), 0x4000);
        assert_eq!(page_alignment("arm64_32"), 0x4000);
        assert_eq!(page_alignment("x86_64"), 0x1000);
    }

    #[test]
    fn test_write_plan_shape() {
        let proc_a = WriteProcedure {
            write_offset: 0,
            size: 0x400,
            source: WriteSource::Image { offset: 0 },
        };
        let proc_b = WriteProcedure {
            write_offset: 0x4000,
            size: 0x200,
            source: WriteSource::ExtraData,
        };
        // Offsets are monotonic and non-overlapping by construction.
        assert!(proc_a.write_offset + proc_a.size <= proc_b.write_offset);
    }
}
