//! Slide info processing.
//!
//! Cache pointers are packed with ASLR slide data (and authentication bits
//! on arm64e). This stage walks every slide page overlapping the image,
//! writes plain pointers back into the image, and registers each slot with
//! the pointer tracker for the later stages.
//!
//! Version support: v1 (oldest 32-bit caches), v2 (arm64 and 32-bit), v3
//! (arm64e), v5 (arm64e, iOS 18+). v1 only occurs with 32-bit pointers and
//! v3/v5 only with 64-bit pointers; a mismatch is fatal for the image, as is
//! an unknown version.

use zerocopy::FromBytes;

use crate::arch::Pointer;
use crate::dyld::*;
use crate::error::{Error, Result};
use crate::macho::RawSegment;
use crate::provider::{AuthData, MappingSlideInfo};
use crate::util;

use super::ExtractionContext;

/// Un-slides every pointer of the image and fills the pointer tracker.
///
/// The tracker owns the cache's slide-mapping list; this stage walks the
/// mappings that overlap the image's segments.
pub fn process_slide_info<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Result<()> {
    ctx.activity.info("processing slide info");

    let mappings: Vec<MappingSlideInfo> = ctx
        .pointer_tracker
        .slide_mappings()
        .iter()
        .filter(|mapping| {
            ctx.image.segments().any(|seg| {
                let seg_start = seg.command.vmaddr();
                let seg_end = seg_start + seg.command.vmsize();
                seg_start < mapping.vm_addr + mapping.size && seg_end > mapping.vm_addr
            })
        })
        .cloned()
        .collect();

    if mappings.is_empty() {
        ctx.activity.warn("no slide mappings overlap the image");
    }

    for mapping in mappings {
        let cache_data = ctx.cache.file_data(mapping.file_index);
        let slide_offset = mapping.slide_info_offset as usize;
        if slide_offset + 4 > cache_data.len() {
            return Err(Error::InvalidSlideInfo {
                offset: mapping.slide_info_offset,
                reason: "slide info header out of bounds".into(),
            });
        }

        match mapping.slide_version {
            1 if !P::IS_64 => process_v1(ctx, cache_data, slide_offset, &mapping)?,
            2 => process_v2(ctx, cache_data, slide_offset, &mapping)?,
            3 if P::IS_64 => process_v3(ctx, cache_data, slide_offset, &mapping)?,
            5 if P::IS_64 => process_v5(ctx, cache_data, slide_offset, &mapping)?,
            1 | 3 | 5 => {
                return Err(Error::SlideWidthMismatch {
                    version: mapping.slide_version,
                    width: P::SIZE as u32 * 8,
                });
            }
            version => return Err(Error::UnsupportedSlideVersion(version)),
        }
    }

    Ok(())
}

/// Returns the page index range of `mapping` covered by one segment.
fn segment_page_range(
    seg_vmaddr: u64,
    seg_vmsize: u64,
    mapping: &MappingSlideInfo,
    page_size: u64,
    page_count: usize,
) -> std::ops::Range<usize> {
    let start = (seg_vmaddr.saturating_sub(mapping.vm_addr)) / page_size;
    let end = util::align_up(
        seg_vmaddr + seg_vmsize - mapping.vm_addr,
        page_size,
    ) / page_size;
    (start as usize).min(page_count)..(end as usize).min(page_count)
}

/// Registers a slot and rewrites it inside the image. Slots whose decoded
/// target falls outside the cache are warned about and left unchanged.
fn commit_slot<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    addr: u64,
    new_value: u64,
    auth: Option<AuthData>,
) -> Result<()> {
    if new_value != 0 && !ctx.cache.contains_addr(new_value) {
        ctx.activity.warn(format!(
            "pointer at {addr:#x} decodes to {new_value:#x}, outside the cache; left unchanged"
        ));
        return Ok(());
    }
    if let Some(offset) = ctx.image.addr_to_offset(addr) {
        ctx.image.write_ptr(offset, new_value)?;
    }
    ctx.pointer_tracker.add(addr, new_value, auth);
    Ok(())
}

// =============================================================================
// v1
// =============================================================================

/// v1 pages carry a bitmap of slid slots; the stored values are already
/// plain pointers, so the slots only need tracking.
fn process_v1<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    cache_data: &[u8],
    slide_offset: usize,
    mapping: &MappingSlideInfo,
) -> Result<()> {
    let info = DyldCacheSlideInfo1::read_from_prefix(&cache_data[slide_offset..])
        .map_err(|_| Error::InvalidSlideInfo {
            offset: slide_offset as u64,
            reason: "failed to parse slide info v1".into(),
        })?
        .0;

    const PAGE_SIZE: u64 = 4096;
    let toc_offset = slide_offset + info.toc_offset as usize;
    let entries_offset = slide_offset + info.entries_offset as usize;
    let entry_size = info.entries_size as usize;

    let segments: Vec<(u64, u64)> = ctx
        .image
        .segments()
        .map(|s| (s.command.vmaddr(), s.command.vmsize()))
        .collect();

    for (seg_vmaddr, seg_vmsize) in segments {
        if seg_vmaddr >= mapping.vm_addr + mapping.size
            || seg_vmaddr + seg_vmsize <= mapping.vm_addr
        {
            continue;
        }
        let pages =
            segment_page_range(seg_vmaddr, seg_vmsize, mapping, PAGE_SIZE, info.toc_count as usize);
        for page_idx in pages {
            let Some(toc_bytes) = cache_data.get(toc_offset + page_idx * 2..) else {
                continue;
            };
            let toc_entry = util::read_u16_le(toc_bytes) as usize;
            let Some(entry) = cache_data.get(entries_offset + toc_entry * entry_size..) else {
                continue;
            };
            let page_addr = mapping.vm_addr + page_idx as u64 * PAGE_SIZE;

            for (byte_idx, &byte) in entry.iter().take(entry_size).enumerate() {
                if byte == 0 {
                    continue;
                }
                for bit in 0..8 {
                    if byte & (1 << bit) == 0 {
                        continue;
                    }
                    let addr = page_addr + (byte_idx as u64 * 8 + bit as u64) * 4;
                    let value = match ctx.image.addr_to_offset(addr) {
                        Some(offset) => ctx.image.read_ptr(offset)?,
                        None => continue,
                    };
                    ctx.pointer_tracker.add(addr, value, None);
                }
            }
        }
    }

    Ok(())
}

// =============================================================================
// v2
// =============================================================================

fn process_v2<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    cache_data: &[u8],
    slide_offset: usize,
    mapping: &MappingSlideInfo,
) -> Result<()> {
    let info = DyldCacheSlideInfo2::read_from_prefix(&cache_data[slide_offset..])
        .map_err(|_| Error::InvalidSlideInfo {
            offset: slide_offset as u64,
            reason: "failed to parse slide info v2".into(),
        })?
        .0;

    let page_size = info.page_size as u64;
    let page_starts = slide_offset + info.page_starts_offset as usize;
    let page_extras = slide_offset + info.page_extras_offset as usize;

    let segments: Vec<(u64, u64)> = ctx
        .image
        .segments()
        .map(|s| (s.command.vmaddr(), s.command.vmsize()))
        .collect();

    for (seg_vmaddr, seg_vmsize) in segments {
        if seg_vmaddr >= mapping.vm_addr + mapping.size
            || seg_vmaddr + seg_vmsize <= mapping.vm_addr
        {
            continue;
        }
        let pages = segment_page_range(
            seg_vmaddr,
            seg_vmsize,
            mapping,
            page_size,
            info.page_starts_count as usize,
        );
        for page_idx in pages {
            let page = util::read_u16_le(&cache_data[page_starts + page_idx * 2..]);
            let page_addr = mapping.vm_addr + page_idx as u64 * page_size;

            if page == DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE {
                continue;
            }
            if page & DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA != 0 {
                // Chained page starts in the extras table.
                let mut chain = (page & 0x3FFF) as usize;
                loop {
                    let extra = util::read_u16_le(&cache_data[page_extras + chain * 2..]);
                    let start = ((extra & 0x3FFF) as u64) * 4;
                    rebase_v2_page(ctx, &info, page_addr, start)?;
                    if extra & DYLD_CACHE_SLIDE_PAGE_ATTR_END != 0 {
                        break;
                    }
                    chain += 1;
                }
            } else {
                rebase_v2_page(ctx, &info, page_addr, page as u64 * 4)?;
            }
        }
    }

    Ok(())
}

fn rebase_v2_page<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    info: &DyldCacheSlideInfo2,
    page_addr: u64,
    mut page_offset: u64,
) -> Result<()> {
    let delta_mask = info.delta_mask;
    let delta_shift = info.delta_shift();
    let value_mask = info.value_mask();
    let value_add = info.value_add;

    loop {
        let addr = page_addr + page_offset;
        let raw = match ctx.image.addr_to_offset(addr) {
            Some(offset) => ctx.image.read_ptr(offset)?,
            None => break,
        };

        let delta = (raw & delta_mask) >> delta_shift;
        let mut new_value = raw & value_mask;
        if new_value != 0 {
            new_value = new_value.wrapping_add(value_add);
        }

        commit_slot(ctx, addr, new_value, None)?;

        if delta == 0 {
            break;
        }
        page_offset += delta;
    }

    Ok(())
}

// =============================================================================
// v3
// =============================================================================

fn process_v3<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    cache_data: &[u8],
    slide_offset: usize,
    mapping: &MappingSlideInfo,
) -> Result<()> {
    let info = DyldCacheSlideInfo3::read_from_prefix(&cache_data[slide_offset..])
        .map_err(|_| Error::InvalidSlideInfo {
            offset: slide_offset as u64,
            reason: "failed to parse slide info v3".into(),
        })?
        .0;

    let page_size = info.page_size as u64;
    let page_starts = slide_offset + std::mem::size_of::<DyldCacheSlideInfo3>();

    let segments: Vec<(u64, u64)> = ctx
        .image
        .segments()
        .map(|s| (s.command.vmaddr(), s.command.vmsize()))
        .collect();

    for (seg_vmaddr, seg_vmsize) in segments {
        if seg_vmaddr >= mapping.vm_addr + mapping.size
            || seg_vmaddr + seg_vmsize <= mapping.vm_addr
        {
            continue;
        }
        let pages = segment_page_range(
            seg_vmaddr,
            seg_vmsize,
            mapping,
            page_size,
            info.page_starts_count as usize,
        );
        for page_idx in pages {
            let page = util::read_u16_le(&cache_data[page_starts + page_idx * 2..]);
            if page == DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
                continue;
            }
            let page_addr = mapping.vm_addr + page_idx as u64 * page_size;
            rebase_v3_page(ctx, info.auth_value_add, page_addr + page as u64 * 8)?;
        }
    }

    Ok(())
}

fn rebase_v3_page<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    auth_value_add: u64,
    mut addr: u64,
) -> Result<()> {
    loop {
        let raw = match ctx.image.addr_to_offset(addr) {
            Some(offset) => ctx.image.read_u64(offset)?,
            None => break,
        };

        let ptr = SlidePointer3(raw);
        let delta = ptr.offset_to_next() * 8;

        let (new_value, auth) = if ptr.is_auth() {
            (
                ptr.auth_offset() + auth_value_add,
                Some(AuthData {
                    diversity: ptr.auth_diversity(),
                    has_addr_div: ptr.auth_has_addr_div(),
                    key: ptr.auth_key(),
                }),
            )
        } else {
            (ptr.plain_value(), None)
        };

        commit_slot(ctx, addr, new_value, auth)?;

        if delta == 0 {
            break;
        }
        addr += delta;
    }

    Ok(())
}

// =============================================================================
// v5
// =============================================================================

fn process_v5<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    cache_data: &[u8],
    slide_offset: usize,
    mapping: &MappingSlideInfo,
) -> Result<()> {
    let info = DyldCacheSlideInfo5::read_from_prefix(&cache_data[slide_offset..])
        .map_err(|_| Error::InvalidSlideInfo {
            offset: slide_offset as u64,
            reason: "failed to parse slide info v5".into(),
        })?
        .0;

    let page_size = info.page_size as u64;
    let page_starts = slide_offset + std::mem::size_of::<DyldCacheSlideInfo5>();

    let segments: Vec<(u64, u64)> = ctx
        .image
        .segments()
        .map(|s| (s.command.vmaddr(), s.command.vmsize()))
        .collect();

    for (seg_vmaddr, seg_vmsize) in segments {
        if seg_vmaddr >= mapping.vm_addr + mapping.size
            || seg_vmaddr + seg_vmsize <= mapping.vm_addr
        {
            continue;
        }
        let pages = segment_page_range(
            seg_vmaddr,
            seg_vmsize,
            mapping,
            page_size,
            info.page_starts_count as usize,
        );
        for page_idx in pages {
            let page = util::read_u16_le(&cache_data[page_starts + page_idx * 2..]);
            if page == DYLD_CACHE_SLIDE_V5_PAGE_ATTR_NO_REBASE {
                continue;
            }
            let page_addr = mapping.vm_addr + page_idx as u64 * page_size;
            rebase_v5_page(ctx, info.value_add, page_addr + page as u64 * 8)?;
        }
    }

    Ok(())
}

fn rebase_v5_page<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    value_add: u64,
    mut addr: u64,
) -> Result<()> {
    loop {
        let raw = match ctx.image.addr_to_offset(addr) {
            Some(offset) => ctx.image.read_u64(offset)?,
            None => break,
        };

        let ptr = SlidePointer5(raw);
        let delta = ptr.offset_to_next() * 8;

        let (new_value, auth) = if ptr.is_auth() {
            (
                ptr.runtime_offset() + value_add,
                Some(AuthData {
                    diversity: ptr.auth_diversity(),
                    has_addr_div: ptr.auth_has_addr_div(),
                    key: if ptr.auth_key_is_da() { 2 } else { 0 },
                }),
            )
        } else {
            (
                ptr.runtime_offset() + value_add + ((ptr.high8() as u64) << 56),
                None,
            )
        };

        commit_slot(ctx, addr, new_value, auth)?;

        if delta == 0 {
            break;
        }
        addr += delta;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Pointer64;
    use crate::dyld::test_support::{build_cache, TestMapping};
    use crate::macho::test_support::minimal_dylib;
    use crate::macho::ImageView;
    use crate::provider::Accelerator;
    use zerocopy::IntoBytes;

    const BASE: u64 = 0x1_8000_0000;

    fn v3_blob() -> Vec<u8> {
        let info = DyldCacheSlideInfo3 {
            version: 3,
            page_size: 0x1000,
            page_starts_count: 1,
            _pad: 0,
            auth_value_add: BASE,
        };
        let mut blob = info.as_bytes().to_vec();
        blob.extend_from_slice(&0u16.to_le_bytes());
        blob
    }

    fn slid_image() -> Vec<u8> {
        let mut image = minimal_dylib();
        // Plain packed pointer chained to the next slot.
        let plain = (1u64 << 51) | 0x1_8000_0123;
        image[0x400..0x408].copy_from_slice(&plain.to_le_bytes());
        // Authenticated packed pointer, end of chain.
        let auth = (1u64 << 63) | (1u64 << 48) | (0xBEEFu64 << 32) | 0x123;
        image[0x408..0x410].copy_from_slice(&auth.to_le_bytes());
        image
    }

    fn test_ctx<'a>(
        cache: &'a crate::dyld::CacheView,
        accel: &'a mut Accelerator,
    ) -> ExtractionContext<'a, Pointer64> {
        let view = ImageView::<Pointer64>::build(cache, BASE).unwrap();
        ExtractionContext::new(
            cache,
            view,
            accel,
            "/usr/lib/libtest.dylib".into(),
            BASE,
            false,
            0,
        )
    }

    #[test]
    fn test_v3_unslide_and_idempotence() {
        let image = slid_image();
        let cache = build_cache(
            "slide-v3",
            "arm64e",
            &image,
            BASE,
            "/usr/lib/libtest.dylib",
            &[
                TestMapping {
                    vm_addr: BASE,
                    size: 0x400,
                    image_off: 0,
                    slide_info: Vec::new(),
                },
                TestMapping {
                    vm_addr: BASE + 0x400,
                    size: 0x200,
                    image_off: 0x400,
                    slide_info: v3_blob(),
                },
                TestMapping {
                    vm_addr: BASE + 0x600,
                    size: 0x400,
                    image_off: 0x600,
                    slide_info: Vec::new(),
                },
            ],
        );

        let mut accel = Accelerator::new();
        let mut ctx = test_ctx(&cache, &mut accel);
        process_slide_info(&mut ctx).unwrap();

        // Both slots decode to the same plain target.
        assert_eq!(ctx.image.read_u64(0x400).unwrap(), 0x1_8000_0123);
        assert_eq!(ctx.image.read_u64(0x408).unwrap(), 0x1_8000_0123);

        // Tracker carries both, with auth bits on the second.
        let first = ctx.pointer_tracker.get(BASE + 0x400).unwrap();
        assert_eq!(first.target, 0x1_8000_0123);
        assert!(first.auth.is_none());
        let second = ctx.pointer_tracker.get(BASE + 0x408).unwrap();
        assert_eq!(second.target, 0x1_8000_0123);
        let auth = second.auth.unwrap();
        assert_eq!(auth.diversity, 0xBEEF);
        assert!(auth.has_addr_div);

        // Running again on the un-slid image changes nothing.
        let snapshot = ctx.image.data.clone();
        let tracked_before = ctx.pointer_tracker.pointers().clone();
        process_slide_info(&mut ctx).unwrap();
        assert_eq!(ctx.image.data, snapshot);
        assert_eq!(*ctx.pointer_tracker.pointers(), tracked_before);
    }

    #[test]
    fn test_unknown_version_is_fatal() {
        let image = minimal_dylib();
        let mut bad_blob = v3_blob();
        bad_blob[0] = 9; // unsupported version
        let cache = build_cache(
            "slide-bad",
            "arm64e",
            &image,
            BASE,
            "/usr/lib/libtest.dylib",
            &[TestMapping {
                vm_addr: BASE,
                size: image.len() as u64,
                image_off: 0,
                slide_info: bad_blob,
            }],
        );

        let mut accel = Accelerator::new();
        let mut ctx = test_ctx(&cache, &mut accel);
        assert!(matches!(
            process_slide_info(&mut ctx),
            Err(Error::UnsupportedSlideVersion(9))
        ));
    }

    #[test]
    fn test_v1_on_64_bit_is_width_mismatch() {
        let image = minimal_dylib();
        let mut blob = v3_blob();
        blob[0] = 1;
        let cache = build_cache(
            "slide-v1-64",
            "arm64e",
            &image,
            BASE,
            "/usr/lib/libtest.dylib",
            &[TestMapping {
                vm_addr: BASE,
                size: image.len() as u64,
                image_off: 0,
                slide_info: blob,
            }],
        );

        let mut accel = Accelerator::new();
        let mut ctx = test_ctx(&cache, &mut accel);
        assert!(matches!(
            process_slide_info(&mut ctx),
            Err(Error::SlideWidthMismatch { version: 1, .. })
        ));
    }
}
