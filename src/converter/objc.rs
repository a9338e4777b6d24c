//! Objective-C metadata fixer.
//!
//! The cache builder uniques selectors into a cache-wide pool, points
//! selector references and method names at it, and consolidates protocol
//! and class metadata. This stage reverses those optimizations so the
//! structures look compiler-emitted again: selector references get
//! per-image strings, out-of-image structures are copied into an extra-data
//! region, and relative ("small") method lists are expanded back into the
//! absolute form.

use std::collections::HashMap;

use crate::arch::Pointer;
use crate::error::{Error, Result};
use crate::macho::{RawSection, RawSegment};
use crate::provider::ExtraData;
use crate::util::{align_up, cstr_at};

use super::ExtractionContext;

// =============================================================================
// Flags and layout
// =============================================================================

/// Image has been optimized by dyld.
pub const OBJC_IMAGE_OPTIMIZED_BY_DYLD: u32 = 1 << 3;

/// Method list uses the relative (small) encoding.
pub const METHOD_LIST_RELATIVE_FLAG: u32 = 0x8000_0000;
/// Method list name offsets point directly at selector strings.
pub const METHOD_LIST_DIRECT_SEL_FLAG: u32 = 0x4000_0000;
/// Method list selectors are uniqued against the cache pool.
pub const METHOD_LIST_UNIQUED_FLAG: u32 = 0x2000_0000;
/// Bits of `entsize_and_flags` that are flags rather than entry size.
pub const METHOD_LIST_FLAGS_MASK: u32 = 0xFFFF_0003;

/// Size of one relative method entry.
const SMALL_METHOD_SIZE: u64 = 12;

/// libobjc opt-data (`objc_opt_t`) version that introduced the shared
/// selector base for relative method names.
const OBJC_OPT_REL_METHOD_BASE_VERSION: u32 = 16;

/// Offset of `relativeMethodSelectorBaseAddressOffset` within `objc_opt_t`:
/// the version/flags pair plus eight 32-bit table offsets.
const OBJC_OPT_REL_METHOD_BASE_FIELD: u64 = 40;

/// Top bits stripped from tagged class/data pointers.
fn strip_tag<P: Pointer>(value: u64) -> u64 {
    if P::IS_64 {
        value & 0x0000_FFFF_FFFF_FFFF
    } else {
        value
    }
}

// =============================================================================
// Fixer state
// =============================================================================

struct ObjcFixer {
    local_selectors: HashMap<Vec<u8>, u64>,
    copied_method_lists: HashMap<u64, u64>,
    copied_protocols: HashMap<u64, u64>,
    /// Base address for relative method names, when libobjc publishes one.
    rel_method_sel_base: Option<u64>,
    fixed_lists: u32,
    localized_selectors: u32,
}

impl ObjcFixer {
    fn new() -> Self {
        Self {
            local_selectors: HashMap::new(),
            copied_method_lists: HashMap::new(),
            copied_protocols: HashMap::new(),
            rel_method_sel_base: None,
            fixed_lists: 0,
            localized_selectors: 0,
        }
    }
}

// =============================================================================
// Method-name storage detection
// =============================================================================

/// Finds a named section of an image straight from the cache bytes.
fn find_cache_section<P: Pointer>(
    cache: &crate::dyld::CacheView,
    image_addr: u64,
    name: &str,
) -> Option<(u64, u64)> {
    use crate::macho::{LoadCommand, RawMachHeader};
    use zerocopy::FromBytes;

    let header_bytes = cache.data_at_addr(image_addr, P::RawHeader::SIZE).ok()?;
    let header = P::RawHeader::read_from_bytes(header_bytes).ok()?;
    let bytes = cache
        .data_at_addr(image_addr, P::RawHeader::SIZE + header.sizeofcmds() as usize)
        .ok()?;

    let mut offset = P::RawHeader::SIZE;
    for _ in 0..header.ncmds() {
        if offset + LoadCommand::SIZE > bytes.len() {
            return None;
        }
        let cmd = crate::util::read_u32_le(&bytes[offset..]);
        let cmdsize = crate::util::read_u32_le(&bytes[offset + 4..]) as usize;
        if cmdsize < LoadCommand::SIZE || offset + cmdsize > bytes.len() {
            return None;
        }
        if cmd == P::RawSegment::CMD {
            let seg = P::RawSegment::read_from_prefix(&bytes[offset..]).ok()?.0;
            let mut sect_off = offset + P::RawSegment::SIZE;
            for _ in 0..seg.nsects() {
                let sect = P::RawSection::read_from_prefix(&bytes[sect_off..]).ok()?.0;
                if sect.name() == name {
                    return Some((sect.addr(), sect.size()));
                }
                sect_off += P::RawSection::SIZE;
            }
        }
        offset += cmdsize;
    }
    None
}

/// Detects how the cache stores relative method names.
///
/// Starting with libobjc opt data version 16, a small method entry's name
/// offset is relative to a published base address (the start of the shared
/// selector pool) rather than to the entry field itself. The base is the
/// `__objc_opt_ro` section's address plus the
/// `relativeMethodSelectorBaseAddressOffset` field of `objc_opt_t`.
/// Cache-wide, so the answer is memoized in the accelerator.
fn detect_method_name_storage<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Option<u64> {
    if let Some(cached) = ctx.accelerator.relative_method_sel_base {
        return cached;
    }

    let base = rel_method_sel_base::<P>(ctx.cache);
    if base.is_none() {
        ctx.activity
            .debug("no relative-method selector base published by libobjc");
    }
    ctx.accelerator.relative_method_sel_base = Some(base);
    base
}

fn rel_method_sel_base<P: Pointer>(cache: &crate::dyld::CacheView) -> Option<u64> {
    let libobjc = cache
        .images
        .iter()
        .find(|img| img.path.contains("/libobjc."))?;
    let (sect_addr, sect_size) = find_cache_section::<P>(cache, libobjc.address, "__objc_opt_ro")?;

    let version = crate::util::read_u32_le(cache.data_at_addr(sect_addr, 4).ok()?);
    if version < OBJC_OPT_REL_METHOD_BASE_VERSION
        || sect_size < OBJC_OPT_REL_METHOD_BASE_FIELD + 8
    {
        return None;
    }

    let base_offset = crate::util::read_u64_le(
        cache
            .data_at_addr(sect_addr + OBJC_OPT_REL_METHOD_BASE_FIELD, 8)
            .ok()?,
    );
    (base_offset != 0).then(|| sect_addr + base_offset)
}

// =============================================================================
// Memory helpers
// =============================================================================

/// Reads a pointer-sized value at a vm address, from the image when the
/// address is materialized there, otherwise through the tracker's slot
/// decoding against the cache.
fn read_ptr_anywhere<P: Pointer>(ctx: &ExtractionContext<P>, addr: u64) -> Option<u64> {
    if let Some(offset) = ctx.image.addr_to_offset(addr) {
        return ctx.image.read_ptr(offset).ok();
    }
    ctx.pointer_tracker.slide_at::<P>(ctx.cache, addr)
}

/// Reads a u32 at a vm address from image or cache.
fn read_u32_anywhere<P: Pointer>(ctx: &ExtractionContext<P>, addr: u64) -> Option<u32> {
    if let Some(offset) = ctx.image.addr_to_offset(addr) {
        return ctx.image.read_u32(offset).ok();
    }
    ctx.cache
        .data_at_addr(addr, 4)
        .ok()
        .map(crate::util::read_u32_le)
}

/// Writes a pointer slot inside the image or the extra-data region, and
/// registers it with the tracker.
fn write_ptr_slot<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    addr: u64,
    value: u64,
) -> Result<()> {
    if let Some(offset) = ctx.image.addr_to_offset(addr) {
        ctx.image.write_ptr(offset, value)?;
    } else if let Some(extra) = ctx.extra_data.as_mut() {
        if extra.contains_addr(addr) {
            let mut bytes = vec![0u8; P::SIZE as usize];
            P::write_ptr(&mut bytes, value);
            extra.write_at(addr, &bytes);
        }
    }
    ctx.pointer_tracker.add(addr, value, None);
    Ok(())
}

/// Reads a selector string at a cache address, memoized cache-wide.
fn selector_bytes<P: Pointer>(ctx: &mut ExtractionContext<P>, addr: u64) -> Option<Vec<u8>> {
    if let Some(bytes) = ctx.accelerator.selectors.get(&addr) {
        return Some(bytes.clone());
    }
    // Selector strings are short; read a bounded window.
    let len = [256usize, 64, 16, 4, 1]
        .iter()
        .copied()
        .find(|&len| ctx.cache.data_at_addr(addr, len).is_ok())?;
    let data = ctx.cache.data_at_addr(addr, len).ok()?;
    let bytes = data[..crate::util::memchr_null(data)].to_vec();
    ctx.accelerator.selectors.insert(addr, bytes.clone());
    Some(bytes)
}

/// Returns an in-image address for the selector at `sel_addr`, allocating a
/// copy of the string in extra data when the cache pool is not reachable
/// from this image.
fn localize_selector<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut ObjcFixer,
    sel_addr: u64,
) -> Option<u64> {
    if ctx.image.contains_addr(sel_addr) {
        return Some(sel_addr);
    }
    let bytes = selector_bytes(ctx, sel_addr)?;
    if let Some(&local) = fixer.local_selectors.get(&bytes) {
        return Some(local);
    }
    let local = ctx.extra_data.as_mut()?.add_cstr(&bytes);
    fixer.local_selectors.insert(bytes, local);
    fixer.localized_selectors += 1;
    Some(local)
}

// =============================================================================
// Method lists
// =============================================================================

/// Fixes the method list at `addr`.
///
/// Returns the address the owner field should hold afterwards: the original
/// address for in-place fixes, or the extra-data copy for lists that lived
/// outside the image or needed expansion.
fn fix_method_list<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut ObjcFixer,
    addr: u64,
) -> Result<Option<u64>> {
    let addr = strip_tag::<P>(addr);
    if addr == 0 {
        return Ok(None);
    }
    if let Some(&copied) = fixer.copied_method_lists.get(&addr) {
        return Ok(Some(copied));
    }

    let Some(entsize_and_flags) = read_u32_anywhere(ctx, addr) else {
        return Ok(None);
    };
    let Some(count) = read_u32_anywhere(ctx, addr + 4) else {
        return Ok(None);
    };
    let entsize = (entsize_and_flags & !METHOD_LIST_FLAGS_MASK) as u64;
    let relative = entsize_and_flags & METHOD_LIST_RELATIVE_FLAG != 0;

    if relative {
        if entsize != SMALL_METHOD_SIZE {
            ctx.activity.warn(format!(
                "unknown method list format at {addr:#x} (entsize {entsize})"
            ));
            return Ok(None);
        }
        let new_addr = expand_small_method_list(ctx, fixer, addr, entsize_and_flags, count)?;
        if let Some(new_addr) = new_addr {
            fixer.copied_method_lists.insert(addr, new_addr);
            fixer.fixed_lists += 1;
        }
        return Ok(new_addr);
    }

    if entsize != P::SIZE * 3 {
        ctx.activity.warn(format!(
            "unknown method list format at {addr:#x} (entsize {entsize})"
        ));
        return Ok(None);
    }

    if ctx.image.contains_addr(addr) {
        fix_large_method_list_in_place(ctx, fixer, addr, entsize_and_flags, count)?;
        fixer.fixed_lists += 1;
        Ok(Some(addr))
    } else {
        let new_addr = copy_large_method_list(ctx, fixer, addr, count)?;
        if let Some(new_addr) = new_addr {
            fixer.copied_method_lists.insert(addr, new_addr);
            fixer.fixed_lists += 1;
        }
        Ok(new_addr)
    }
}

/// Expands a relative method list into an absolute one in extra data.
fn expand_small_method_list<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut ObjcFixer,
    list_addr: u64,
    entsize_and_flags: u32,
    count: u32,
) -> Result<Option<u64>> {
    let direct_sel = entsize_and_flags & METHOD_LIST_DIRECT_SEL_FLAG != 0;

    let mut entries: Vec<(u64, u64, u64)> = Vec::with_capacity(count as usize);
    for i in 0..count as u64 {
        let entry_addr = list_addr + 8 + i * SMALL_METHOD_SIZE;

        let read_rel = |ctx: &ExtractionContext<P>, field: u64| -> Option<u64> {
            let off = read_u32_anywhere(ctx, field)? as i32 as i64;
            Some(field.wrapping_add(off as u64))
        };

        let Some(name_off) = read_u32_anywhere(ctx, entry_addr) else {
            return Ok(None);
        };
        let Some(types_addr) = read_rel(ctx, entry_addr + 4) else {
            return Ok(None);
        };
        let Some(imp_addr) = read_rel(ctx, entry_addr + 8) else {
            return Ok(None);
        };

        // Name offsets count from libobjc's published selector base when
        // the cache has one (opt data v16+) and reach the selector string
        // directly. Without a base they are self-relative: straight to the
        // string with the direct-sel flag, through a selector-reference
        // slot otherwise.
        let name_off = name_off as i32 as i64;
        let sel_addr = if let Some(base) = fixer.rel_method_sel_base {
            base.wrapping_add(name_off as u64)
        } else {
            let name_target = entry_addr.wrapping_add(name_off as u64);
            if direct_sel {
                name_target
            } else {
                match read_ptr_anywhere(ctx, name_target) {
                    Some(addr) => addr,
                    None => {
                        ctx.activity.warn(format!(
                            "unknown method list format at {list_addr:#x} (bad selref)"
                        ));
                        return Ok(None);
                    }
                }
            }
        };

        let Some(sel_local) = localize_selector(ctx, fixer, sel_addr) else {
            ctx.activity.warn(format!(
                "unable to localize selector for method list at {list_addr:#x}"
            ));
            return Ok(None);
        };

        entries.push((sel_local, types_addr, imp_addr));
    }

    // Emit the absolute form: header plus three pointers per entry.
    let entry_size = (P::SIZE * 3) as u32;
    let total = 8 + entries.len() * entry_size as usize;
    let mut bytes = vec![0u8; total];
    crate::util::write_u32_le(&mut bytes[0..4], entry_size);
    crate::util::write_u32_le(&mut bytes[4..8], count);
    for (i, (name, types, imp)) in entries.iter().enumerate() {
        let base = 8 + i * entry_size as usize;
        P::write_ptr(&mut bytes[base..], *name);
        P::write_ptr(&mut bytes[base + P::SIZE as usize..], *types);
        P::write_ptr(&mut bytes[base + P::SIZE as usize * 2..], *imp);
    }

    let Some(extra) = ctx.extra_data.as_mut() else {
        return Ok(None);
    };
    let new_addr = extra.add_bytes(&bytes, 8);

    // Track the pointers of the new entries.
    for (i, (name, types, imp)) in entries.iter().enumerate() {
        let base = new_addr + 8 + i as u64 * entry_size as u64;
        ctx.pointer_tracker.add(base, *name, None);
        ctx.pointer_tracker.add(base + P::SIZE, *types, None);
        ctx.pointer_tracker.add(base + P::SIZE * 2, *imp, None);
    }

    Ok(Some(new_addr))
}

/// Localizes selector pointers of an in-image absolute method list and
/// clears the cache-optimization flags.
fn fix_large_method_list_in_place<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut ObjcFixer,
    list_addr: u64,
    entsize_and_flags: u32,
    count: u32,
) -> Result<()> {
    for i in 0..count as u64 {
        let name_field = list_addr + 8 + i * P::SIZE * 3;
        let Some(sel_addr) = read_ptr_anywhere(ctx, name_field) else {
            continue;
        };
        if sel_addr == 0 || ctx.image.contains_addr(sel_addr) {
            continue;
        }
        if let Some(local) = localize_selector(ctx, fixer, sel_addr) {
            write_ptr_slot(ctx, name_field, local)?;
        }
    }

    let cleared =
        entsize_and_flags & !(METHOD_LIST_DIRECT_SEL_FLAG | METHOD_LIST_UNIQUED_FLAG);
    if cleared != entsize_and_flags {
        if let Some(offset) = ctx.image.addr_to_offset(list_addr) {
            ctx.image.write_u32(offset, cleared)?;
        }
    }
    Ok(())
}

/// Copies an out-of-image absolute method list into extra data.
fn copy_large_method_list<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut ObjcFixer,
    list_addr: u64,
    count: u32,
) -> Result<Option<u64>> {
    let entry_size = P::SIZE * 3;
    let mut entries: Vec<(u64, u64, u64)> = Vec::with_capacity(count as usize);
    for i in 0..count as u64 {
        let base = list_addr + 8 + i * entry_size;
        let (Some(name), Some(types), Some(imp)) = (
            read_ptr_anywhere(ctx, base),
            read_ptr_anywhere(ctx, base + P::SIZE),
            read_ptr_anywhere(ctx, base + P::SIZE * 2),
        ) else {
            return Ok(None);
        };
        let name = match localize_selector(ctx, fixer, name) {
            Some(local) => local,
            None => name,
        };
        entries.push((name, types, imp));
    }

    let total = 8 + entries.len() * entry_size as usize;
    let mut bytes = vec![0u8; total];
    crate::util::write_u32_le(&mut bytes[0..4], entry_size as u32);
    crate::util::write_u32_le(&mut bytes[4..8], count);
    for (i, (name, types, imp)) in entries.iter().enumerate() {
        let base = 8 + i * entry_size as usize;
        P::write_ptr(&mut bytes[base..], *name);
        P::write_ptr(&mut bytes[base + P::SIZE as usize..], *types);
        P::write_ptr(&mut bytes[base + P::SIZE as usize * 2..], *imp);
    }

    let Some(extra) = ctx.extra_data.as_mut() else {
        return Ok(None);
    };
    let new_addr = extra.add_bytes(&bytes, 8);
    for (i, (name, types, imp)) in entries.iter().enumerate() {
        let base = new_addr + 8 + i as u64 * entry_size;
        ctx.pointer_tracker.add(base, *name, None);
        ctx.pointer_tracker.add(base + P::SIZE, *types, None);
        ctx.pointer_tracker.add(base + P::SIZE * 2, *imp, None);
    }
    Ok(Some(new_addr))
}

// =============================================================================
// Protocols
// =============================================================================

/// Protocol field offsets in pointer units: name 1, protocols 2, then four
/// method lists, then instance properties.
const PROTO_NAME: u64 = 1;
const PROTO_PROTOCOLS: u64 = 2;
const PROTO_METHOD_LISTS: [u64; 4] = [3, 4, 5, 6];

/// Fixes the protocol at `addr`, copying it into extra data when it lives
/// outside the image. Returns the address to reference it by.
fn fix_protocol<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut ObjcFixer,
    addr: u64,
    depth: usize,
) -> Result<Option<u64>> {
    let addr = strip_tag::<P>(addr);
    if addr == 0 || depth > 8 {
        return Ok(None);
    }
    if let Some(&copied) = fixer.copied_protocols.get(&addr) {
        return Ok(Some(copied));
    }

    let in_image = ctx.image.contains_addr(addr);
    let proto_addr = if in_image {
        addr
    } else {
        // Copy the raw struct first so nested fixes can patch the copy.
        // protocol_t is 8 pointers plus size/flags and the extended-types
        // pointer.
        let struct_size = (P::SIZE * 8 + 8 + P::SIZE) as usize;
        let Ok(bytes) = ctx.cache.data_at_addr(addr, struct_size) else {
            return Ok(None);
        };
        let mut copy = bytes.to_vec();
        // Un-slide each pointer field of the copy.
        for field in 0..8u64 {
            if let Some(value) =
                ctx.pointer_tracker.slide_at::<P>(ctx.cache, addr + field * P::SIZE)
            {
                P::write_ptr(&mut copy[(field * P::SIZE) as usize..], value);
            }
        }
        let Some(extra) = ctx.extra_data.as_mut() else {
            return Ok(None);
        };
        let new_addr = extra.add_bytes(&copy, 8);
        fixer.copied_protocols.insert(addr, new_addr);
        new_addr
    };
    if in_image {
        fixer.copied_protocols.insert(addr, addr);
    }

    // Name.
    if let Some(name_addr) = read_ptr_anywhere(ctx, proto_addr + PROTO_NAME * P::SIZE) {
        if name_addr != 0 && !ctx.image.contains_addr(name_addr) {
            if let Some(local) = localize_selector(ctx, fixer, name_addr) {
                write_ptr_slot(ctx, proto_addr + PROTO_NAME * P::SIZE, local)?;
            }
        }
    }

    // Nested protocol list.
    if let Some(list_addr) = read_ptr_anywhere(ctx, proto_addr + PROTO_PROTOCOLS * P::SIZE) {
        if list_addr != 0 {
            if let Some(new_list) = fix_protocol_list(ctx, fixer, list_addr, depth + 1)? {
                if new_list != list_addr {
                    write_ptr_slot(ctx, proto_addr + PROTO_PROTOCOLS * P::SIZE, new_list)?;
                }
            }
        }
    }

    // The four method lists.
    for field in PROTO_METHOD_LISTS {
        let field_addr = proto_addr + field * P::SIZE;
        if let Some(list_addr) = read_ptr_anywhere(ctx, field_addr) {
            if list_addr != 0 {
                if let Some(new_list) = fix_method_list(ctx, fixer, list_addr)? {
                    if new_list != strip_tag::<P>(list_addr) {
                        write_ptr_slot(ctx, field_addr, new_list)?;
                    }
                }
            }
        }
    }

    Ok(Some(proto_addr))
}

/// Fixes a `protocol_list_t`. Returns the address to reference it by:
/// out-of-image lists are copied into extra data.
fn fix_protocol_list<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut ObjcFixer,
    addr: u64,
    depth: usize,
) -> Result<Option<u64>> {
    let addr = strip_tag::<P>(addr);
    if addr == 0 || depth > 8 {
        return Ok(None);
    }

    let Some(count) = read_ptr_anywhere(ctx, addr) else {
        return Ok(None);
    };
    if count > 0x1000 {
        ctx.activity
            .warn(format!("implausible protocol list at {addr:#x}"));
        return Ok(None);
    }

    let in_image = ctx.image.contains_addr(addr);
    let list_addr = if in_image {
        addr
    } else {
        let size = ((count + 1) * P::SIZE) as usize;
        let Ok(bytes) = ctx.cache.data_at_addr(addr, size) else {
            return Ok(None);
        };
        let mut copy = bytes.to_vec();
        for i in 0..count {
            if let Some(value) = ctx
                .pointer_tracker
                .slide_at::<P>(ctx.cache, addr + (i + 1) * P::SIZE)
            {
                P::write_ptr(&mut copy[((i + 1) * P::SIZE) as usize..], value);
            }
        }
        let Some(extra) = ctx.extra_data.as_mut() else {
            return Ok(None);
        };
        extra.add_bytes(&copy, 8)
    };

    for i in 0..count {
        let slot = list_addr + (i + 1) * P::SIZE;
        if let Some(proto_addr) = read_ptr_anywhere(ctx, slot) {
            if proto_addr != 0 {
                if let Some(new_proto) = fix_protocol(ctx, fixer, proto_addr, depth + 1)? {
                    if new_proto != strip_tag::<P>(proto_addr) {
                        write_ptr_slot(ctx, slot, new_proto)?;
                    }
                }
            }
        }
    }

    Ok(Some(list_addr))
}

// =============================================================================
// Classes and categories
// =============================================================================

fn fix_class<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut ObjcFixer,
    class_addr: u64,
    depth: usize,
) -> Result<()> {
    let class_addr = strip_tag::<P>(class_addr);
    if class_addr == 0 || depth > 4 || !ctx.image.contains_addr(class_addr) {
        return Ok(());
    }

    // Metaclass via isa.
    if depth == 0 {
        if let Some(isa) = read_ptr_anywhere(ctx, class_addr) {
            fix_class(ctx, fixer, isa, depth + 1)?;
        }
    }

    // class_ro_t through the data field (low bits carry Swift flags).
    let data_field = class_addr + 4 * P::SIZE;
    let Some(data_ptr) = read_ptr_anywhere(ctx, data_field) else {
        return Ok(());
    };
    let ro_addr = strip_tag::<P>(data_ptr) & !0x7;
    if ro_addr == 0 || !ctx.image.contains_addr(ro_addr) {
        return Ok(());
    }

    let ro_header = if P::IS_64 { 16u64 } else { 12 };
    let name_field = ro_addr + ro_header + P::SIZE;
    let methods_field = ro_addr + ro_header + 2 * P::SIZE;
    let protocols_field = ro_addr + ro_header + 3 * P::SIZE;

    if let Some(name_addr) = read_ptr_anywhere(ctx, name_field) {
        if name_addr != 0 && !ctx.image.contains_addr(name_addr) {
            if let Some(local) = localize_selector(ctx, fixer, name_addr) {
                write_ptr_slot(ctx, name_field, local)?;
            }
        }
    }

    if let Some(methods) = read_ptr_anywhere(ctx, methods_field) {
        if methods != 0 {
            if let Some(new_list) = fix_method_list(ctx, fixer, methods)? {
                if new_list != strip_tag::<P>(methods) {
                    write_ptr_slot(ctx, methods_field, new_list)?;
                }
            }
        }
    }

    if let Some(protocols) = read_ptr_anywhere(ctx, protocols_field) {
        if protocols != 0 {
            if let Some(new_list) = fix_protocol_list(ctx, fixer, protocols, 0)? {
                if new_list != strip_tag::<P>(protocols) {
                    write_ptr_slot(ctx, protocols_field, new_list)?;
                }
            }
        }
    }

    Ok(())
}

fn fix_category<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut ObjcFixer,
    cat_addr: u64,
) -> Result<()> {
    let cat_addr = strip_tag::<P>(cat_addr);
    if cat_addr == 0 || !ctx.image.contains_addr(cat_addr) {
        return Ok(());
    }

    let name_field = cat_addr;
    if let Some(name_addr) = read_ptr_anywhere(ctx, name_field) {
        if name_addr != 0 && !ctx.image.contains_addr(name_addr) {
            if let Some(local) = localize_selector(ctx, fixer, name_addr) {
                write_ptr_slot(ctx, name_field, local)?;
            }
        }
    }

    for field in [2u64, 3] {
        let field_addr = cat_addr + field * P::SIZE;
        if let Some(list) = read_ptr_anywhere(ctx, field_addr) {
            if list != 0 {
                if let Some(new_list) = fix_method_list(ctx, fixer, list)? {
                    if new_list != strip_tag::<P>(list) {
                        write_ptr_slot(ctx, field_addr, new_list)?;
                    }
                }
            }
        }
    }

    let protocols_field = cat_addr + 4 * P::SIZE;
    if let Some(list) = read_ptr_anywhere(ctx, protocols_field) {
        if list != 0 {
            if let Some(new_list) = fix_protocol_list(ctx, fixer, list, 0)? {
                if new_list != strip_tag::<P>(list) {
                    write_ptr_slot(ctx, protocols_field, new_list)?;
                }
            }
        }
    }

    Ok(())
}

// =============================================================================
// Sections
// =============================================================================

fn pointer_section_addrs<P: Pointer>(
    ctx: &ExtractionContext<P>,
    name: &str,
) -> Vec<u64> {
    let mut slots = Vec::new();
    for seg in ctx.image.segments() {
        for sect in &seg.sections {
            if sect.section.name() == name {
                let count = sect.section.size() / P::SIZE;
                for i in 0..count {
                    slots.push(sect.section.addr() + i * P::SIZE);
                }
            }
        }
    }
    slots
}

fn fix_selrefs<P: Pointer>(ctx: &mut ExtractionContext<P>, fixer: &mut ObjcFixer) -> Result<()> {
    for slot in pointer_section_addrs(ctx, "__objc_selrefs") {
        let Some(target) = read_ptr_anywhere(ctx, slot) else {
            continue;
        };
        if target == 0 || ctx.image.contains_addr(target) {
            continue;
        }
        if let Some(local) = localize_selector(ctx, fixer, target) {
            write_ptr_slot(ctx, slot, local)?;
        }
    }
    Ok(())
}

fn fix_protorefs<P: Pointer>(ctx: &mut ExtractionContext<P>, fixer: &mut ObjcFixer) -> Result<()> {
    for slot in pointer_section_addrs(ctx, "__objc_protorefs") {
        let Some(target) = read_ptr_anywhere(ctx, slot) else {
            continue;
        };
        if target == 0 {
            continue;
        }
        if let Some(new_proto) = fix_protocol(ctx, fixer, target, 0)? {
            if new_proto != strip_tag::<P>(target) {
                write_ptr_slot(ctx, slot, new_proto)?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Entry point
// =============================================================================

/// Restores the image's Objective-C metadata.
pub fn fix_objc<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Result<()> {
    let Some(info_sect) = ctx.image.section_anywhere("__objc_imageinfo") else {
        ctx.activity.debug("no ObjC image info, skipping");
        return Ok(());
    };
    let info_addr = info_sect.section.addr();
    let Some(info_offset) = ctx.image.addr_to_offset(info_addr) else {
        return Ok(());
    };

    let flags = ctx.image.read_u32(info_offset + 4)?;
    if flags & OBJC_IMAGE_OPTIMIZED_BY_DYLD == 0 {
        ctx.activity.debug("ObjC not optimized by dyld, skipping");
        return Ok(());
    }

    ctx.activity.info("fixing ObjC metadata");

    // Extra data begins past the last segment, page aligned.
    let data_end = ctx
        .image
        .segments()
        .map(|seg| seg.command.vmaddr() + seg.command.vmsize())
        .max()
        .ok_or_else(|| Error::SegmentNotFound {
            name: "__TEXT".into(),
        })?;
    ctx.extra_data = Some(ExtraData::new(align_up(data_end, 0x4000)));

    let mut fixer = ObjcFixer::new();
    fixer.rel_method_sel_base = detect_method_name_storage(ctx);

    fix_selrefs(ctx, &mut fixer)?;

    for list_name in ["__objc_classlist", "__objc_nlclslist"] {
        for slot in pointer_section_addrs(ctx, list_name) {
            if let Some(class_addr) = read_ptr_anywhere(ctx, slot) {
                if class_addr != 0 {
                    if ctx.image.contains_addr(strip_tag::<P>(class_addr)) {
                        fix_class(ctx, &mut fixer, class_addr, 0)?;
                    } else {
                        ctx.activity.warn(format!(
                            "class pointer at {slot:#x} points outside of image"
                        ));
                    }
                }
            }
        }
    }

    for list_name in ["__objc_catlist", "__objc_nlcatlist"] {
        for slot in pointer_section_addrs(ctx, list_name) {
            if let Some(cat_addr) = read_ptr_anywhere(ctx, slot) {
                if cat_addr != 0 {
                    fix_category(ctx, &mut fixer, cat_addr)?;
                }
            }
        }
    }

    for slot in pointer_section_addrs(ctx, "__objc_protolist") {
        if let Some(proto_addr) = read_ptr_anywhere(ctx, slot) {
            if proto_addr != 0 {
                if let Some(new_proto) = fix_protocol(ctx, &mut fixer, proto_addr, 0)? {
                    if new_proto != strip_tag::<P>(proto_addr) {
                        write_ptr_slot(ctx, slot, new_proto)?;
                    }
                }
            }
        }
    }

    fix_protorefs(ctx, &mut fixer)?;

    // Drop the region again when nothing was synthesized.
    if ctx
        .extra_data
        .as_ref()
        .map(|extra| extra.is_empty())
        .unwrap_or(true)
    {
        ctx.extra_data = None;
    }

    // The metadata now stands on its own.
    let flags = ctx.image.read_u32(info_offset + 4)?;
    ctx.image
        .write_u32(info_offset + 4, flags & !OBJC_IMAGE_OPTIMIZED_BY_DYLD)?;

    ctx.activity.info(&format!(
        "fixed {} method lists, localized {} selectors",
        fixer.fixed_lists, fixer.localized_selectors
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Pointer32, Pointer64};
    use crate::dyld::test_support::{build_cache, TestMapping};
    use crate::macho::test_support::minimal_dylib;

    const BASE: u64 = 0x1_8000_0000;

    /// Rebrands the minimal dylib as libobjc: its one section becomes
    /// `__objc_opt_ro` carrying opt data with the given version and
    /// relative-method base offset.
    fn libobjc_image(version: u32, base_offset: u64) -> Vec<u8> {
        let mut image = minimal_dylib();
        // The section struct sits right after the header and segment
        // command: sectname at +0, addr at +32, size at +40.
        let sect = 32 + 72;
        image[sect..sect + 16].copy_from_slice(b"__objc_opt_ro\0\0\0");
        image[sect + 40..sect + 48].copy_from_slice(&0x60u64.to_le_bytes());
        // Opt data lives at the section address (BASE + 0x400).
        image[0x400..0x404].copy_from_slice(&version.to_le_bytes());
        image[0x400 + OBJC_OPT_REL_METHOD_BASE_FIELD as usize
            ..0x400 + OBJC_OPT_REL_METHOD_BASE_FIELD as usize + 8]
            .copy_from_slice(&base_offset.to_le_bytes());
        image
    }

    fn base_for(tag: &str, version: u32, base_offset: u64) -> Option<u64> {
        let image = libobjc_image(version, base_offset);
        let cache = build_cache(
            tag,
            "arm64e",
            &image,
            BASE,
            "/usr/lib/libobjc.A.dylib",
            &[TestMapping {
                vm_addr: BASE,
                size: image.len() as u64,
                image_off: 0,
                slide_info: Vec::new(),
            }],
        );
        rel_method_sel_base::<Pointer64>(&cache)
    }

    #[test]
    fn test_rel_method_base_detection() {
        // Opt data v16 with a base offset publishes the base address.
        assert_eq!(
            base_for("objc-opt-v16", 16, 0x200),
            Some(BASE + 0x400 + 0x200)
        );
    }

    #[test]
    fn test_rel_method_base_absent() {
        // Pre-v16 opt data and a zero offset both mean self-relative names.
        assert_eq!(base_for("objc-opt-v15", 15, 0x200), None);
        assert_eq!(base_for("objc-opt-zero", 16, 0), None);
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(OBJC_IMAGE_OPTIMIZED_BY_DYLD, 0x08);
        assert_eq!(METHOD_LIST_RELATIVE_FLAG, 0x8000_0000);
        assert_eq!(METHOD_LIST_DIRECT_SEL_FLAG, 0x4000_0000);
        assert_eq!(METHOD_LIST_UNIQUED_FLAG, 0x2000_0000);
    }

    #[test]
    fn test_flag_clearing_preserves_entsize() {
        let original: u32 = METHOD_LIST_DIRECT_SEL_FLAG | METHOD_LIST_UNIQUED_FLAG | 0x18;
        let cleared = original & !(METHOD_LIST_DIRECT_SEL_FLAG | METHOD_LIST_UNIQUED_FLAG);
        assert_eq!(cleared, 0x18);
    }

    #[test]
    fn test_strip_tag() {
        assert_eq!(
            strip_tag::<Pointer64>(0xFF80_0001_8000_1234),
            0x0000_0001_8000_1234
        );
        assert_eq!(strip_tag::<Pointer32>(0x8000_1234), 0x8000_1234);
    }
}
