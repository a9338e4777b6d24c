//! Stub fixer.
//!
//! The cache builder rewires stubs to bypass lazy binding: optimized stubs
//! branch straight into other images, and symbol pointers hold resolved
//! addresses in the shared region. This stage names every symbol pointer,
//! rewrites optimized stubs back into their pointer-loading form, repoints
//! pointer slots at their own image's stubs or helpers, retargets callsites
//! that branch out of the image, and back-fills symbol entries for redacted
//! indirect-table slots.
//!
//! Stub instruction shapes are arm64-family specific; x86-64 stubs
//! (`jmpq *(rip)`) already load through pointer slots the slide stage
//! un-slid, so only the pointer scan and the redacted back-fill run there.

use std::collections::HashMap;

use zerocopy::{FromBytes, IntoBytes};

use crate::arch::{arm64, is_arm64_family, Pointer};
use crate::dyld::{parse_bind_info, BindRecord};
use crate::error::Result;
use crate::macho::{
    is_indirect_sentinel, RawNlist, RawSection, RawSegment, S_LAZY_SYMBOL_POINTERS,
    S_NON_LAZY_SYMBOL_POINTERS, S_SYMBOL_STUBS, SECTION_TYPE,
};
use crate::provider::Symbolizer;
use crate::util::cstr_at;

use super::ExtractionContext;

/// Stub-binder prologue size at the head of `__stub_helper`.
const STUB_BINDER_SIZE: u64 = 0x18;
/// Size of one regular stub-helper entry.
const REG_HELPER_SIZE: u64 = 0xC;

/// Classification of a symbol-pointer section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PtrSectionKind {
    Lazy,
    NonLazy,
    NonLazyAuth,
}

#[derive(Debug, Clone)]
struct PtrSection {
    kind: PtrSectionKind,
    addr: u64,
    size: u64,
    indirect_index: u32,
}

#[derive(Debug, Clone)]
struct StubSection {
    addr: u64,
    size: u64,
    stub_size: u32,
    indirect_index: u32,
}

/// Per-image stub fixing state.
struct StubFixer {
    symbolizer: Symbolizer,

    // Pointer caches: symbol name to slot addresses, and the reverse.
    lazy_ptrs: HashMap<String, Vec<u64>>,
    non_lazy_ptrs: HashMap<String, Vec<u64>>,
    auth_ptrs: HashMap<String, Vec<u64>>,
    ptr_names: HashMap<u64, String>,

    // Stub map: symbol name to stub address, and the reverse.
    stub_map: HashMap<String, u64>,
    stub_names: HashMap<u64, String>,

    bind_records: HashMap<u64, BindRecord>,
}

impl StubFixer {
    fn new(symbolizer: Symbolizer) -> Self {
        Self {
            symbolizer,
            lazy_ptrs: HashMap::new(),
            non_lazy_ptrs: HashMap::new(),
            auth_ptrs: HashMap::new(),
            ptr_names: HashMap::new(),
            stub_map: HashMap::new(),
            stub_names: HashMap::new(),
            bind_records: HashMap::new(),
        }
    }

    fn cache_pointer(&mut self, kind: PtrSectionKind, name: &str, addr: u64) {
        let map = match kind {
            PtrSectionKind::Lazy => &mut self.lazy_ptrs,
            PtrSectionKind::NonLazy => &mut self.non_lazy_ptrs,
            PtrSectionKind::NonLazyAuth => &mut self.auth_ptrs,
        };
        map.entry(name.to_string()).or_default().push(addr);
        self.ptr_names.entry(addr).or_insert_with(|| name.to_string());
    }

    fn pointer_for(&self, kind: PtrSectionKind, name: &str) -> Option<u64> {
        let map = match kind {
            PtrSectionKind::Lazy => &self.lazy_ptrs,
            PtrSectionKind::NonLazy => &self.non_lazy_ptrs,
            PtrSectionKind::NonLazyAuth => &self.auth_ptrs,
        };
        map.get(name).and_then(|addrs| addrs.first().copied())
    }
}

// =============================================================================
// Section gathering
// =============================================================================

fn ptr_section_kind<P: Pointer>(section: &P::RawSection) -> Option<PtrSectionKind> {
    let is_auth = section.name().contains("auth");
    match section.section_type() {
        S_LAZY_SYMBOL_POINTERS => Some(PtrSectionKind::Lazy),
        S_NON_LAZY_SYMBOL_POINTERS if is_auth => Some(PtrSectionKind::NonLazyAuth),
        S_NON_LAZY_SYMBOL_POINTERS => Some(PtrSectionKind::NonLazy),
        _ => None,
    }
}

fn collect_ptr_sections<P: Pointer>(ctx: &ExtractionContext<P>) -> Vec<PtrSection> {
    let mut out = Vec::new();
    for seg in ctx.image.segments() {
        for sect in &seg.sections {
            if let Some(kind) = ptr_section_kind::<P>(&sect.section) {
                out.push(PtrSection {
                    kind,
                    addr: sect.section.addr(),
                    size: sect.section.size(),
                    indirect_index: sect.section.reserved1(),
                });
            }
        }
    }
    out
}

fn collect_stub_sections<P: Pointer>(ctx: &ExtractionContext<P>) -> Vec<StubSection> {
    let mut out = Vec::new();
    for seg in ctx.image.segments() {
        for sect in &seg.sections {
            if sect.section.section_type() == S_SYMBOL_STUBS && sect.section.reserved2() > 0 {
                out.push(StubSection {
                    addr: sect.section.addr(),
                    size: sect.section.size(),
                    stub_size: sect.section.reserved2(),
                    indirect_index: sect.section.reserved1(),
                });
            }
        }
    }
    out
}

/// Starting around iOS 16 the cache builder stops setting the section type
/// on `__got`/`__auth_got`; restore it so the scans below see them.
fn preflight_sections<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Result<()> {
    let fixes: Vec<(usize, P::RawSection)> = ctx
        .image
        .segments()
        .flat_map(|seg| seg.sections.iter())
        .filter(|sect| {
            let name = sect.section.name();
            (name == "__got" || name == "__auth_got")
                && sect.section.flags() & SECTION_TYPE == 0
        })
        .map(|sect| {
            let mut fixed = sect.section;
            fixed.set_flags(fixed.flags() | S_NON_LAZY_SYMBOL_POINTERS);
            (sect.struct_offset, fixed)
        })
        .collect();

    for (offset, section) in fixes {
        ctx.image.write_struct(offset, &section)?;
    }
    if !ctx.image.load_commands.is_empty() {
        ctx.image.reparse_load_commands()?;
    }
    Ok(())
}

// =============================================================================
// Instruction reading and chain resolution
// =============================================================================

/// Reads up to `count` instruction words at a cache address.
fn read_words<P: Pointer>(
    ctx: &ExtractionContext<P>,
    addr: u64,
    count: usize,
) -> Option<Vec<u32>> {
    let mut len = count * 4;
    let bytes = loop {
        match ctx.cache.data_at_addr(addr, len) {
            Ok(bytes) => break bytes,
            Err(_) if len > 4 => len -= 4,
            Err(_) => return None,
        }
    };
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Resolves one stub at `addr` to its target, chasing pointer slots through
/// the tracker.
fn resolve_stub<P: Pointer>(
    ctx: &ExtractionContext<P>,
    addr: u64,
) -> Option<(u64, arm64::StubKind)> {
    let words = read_words(ctx, addr, 4)?;
    let (kind, target) = arm64::classify_stub(&words, addr)?;
    let target = match target {
        arm64::StubTarget::Direct(target) => target,
        arm64::StubTarget::PointerSlot(slot) => {
            ctx.pointer_tracker.slide_at::<P>(ctx.cache, slot)?
        }
    };
    Some((target, kind))
}

/// Follows a chain of stubs to the final target, memoized across images.
fn resolve_stub_chain<P: Pointer>(ctx: &mut ExtractionContext<P>, addr: u64) -> u64 {
    if let Some(&target) = ctx.accelerator.resolved_stub_chains.get(&addr) {
        return target;
    }

    let mut target = addr;
    // A stub chain is at most a few hops; the bound guards corrupt chains.
    for _ in 0..64 {
        let next = match resolve_stub(ctx, target) {
            Some((next, _)) => next,
            None => match read_words(ctx, target, 50)
                .and_then(|words| arm64::resolver_data(&words, target))
            {
                Some((next, _)) => next,
                None => break,
            },
        };
        if next == target {
            break;
        }
        target = next;
    }

    ctx.accelerator.resolved_stub_chains.insert(addr, target);
    target
}

// =============================================================================
// Symbol pointer scanning
// =============================================================================

/// Looks up the symbol name an indirect-table entry references.
fn indirect_entry_name<P: Pointer>(
    ctx: &ExtractionContext<P>,
    index: u64,
) -> Option<String> {
    let (symtab, _) = ctx.image.symtab()?;
    let (dysymtab, _) = ctx.image.dysymtab()?;
    if index >= dysymtab.nindirectsyms as u64 {
        return None;
    }

    let entry_off = ctx
        .image
        .linkedit_offset(dysymtab.indirectsymoff as u64 + index * 4)?;
    let entry = ctx.image.read_u32(entry_off).ok()?;
    if entry == 0 || is_indirect_sentinel(entry) || entry >= symtab.nsyms {
        return None;
    }

    let nlist_off = ctx
        .image
        .linkedit_offset(symtab.symoff as u64 + entry as u64 * P::RawNlist::SIZE as u64)?;
    let nlist =
        P::RawNlist::read_from_bytes(ctx.image.read_at(nlist_off, P::RawNlist::SIZE).ok()?)
            .ok()?;

    let name_off = ctx
        .image
        .linkedit_offset(symtab.stroff as u64 + nlist.strx() as u64)?;
    let name = cstr_at(&ctx.image.data, name_off)?;
    if name.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(name).into_owned())
}

fn read_bind_records<P: Pointer>(
    ctx: &ExtractionContext<P>,
    fixer: &mut StubFixer,
) -> Result<()> {
    let Some((dyld_info, _)) = ctx.image.dyld_info() else {
        return Ok(());
    };

    let segment_bases: Vec<u64> = ctx
        .image
        .segments()
        .map(|seg| seg.command.vmaddr())
        .collect();

    let mut blobs = Vec::new();
    if dyld_info.weak_bind_size > 0 {
        blobs.push((dyld_info.weak_bind_off, dyld_info.weak_bind_size));
    }
    if dyld_info.lazy_bind_size > 0 {
        blobs.push((dyld_info.lazy_bind_off, dyld_info.lazy_bind_size));
    }

    for (off, size) in blobs {
        let Some(data_off) = ctx.image.linkedit_offset(off as u64) else {
            continue;
        };
        let data = ctx.image.read_at(data_off, size as usize)?;
        match parse_bind_info(data, P::SIZE) {
            Ok(records) => {
                for record in records {
                    let Some(&base) = segment_bases.get(record.segment_index as usize) else {
                        continue;
                    };
                    fixer
                        .bind_records
                        .insert(base + record.segment_offset, record);
                }
            }
            Err(e) => ctx
                .activity
                .warn(format!("error while parsing bind info: {e}")),
        }
    }
    Ok(())
}

/// Names every slot of every symbol-pointer section.
fn scan_symbol_pointers<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut StubFixer,
) -> Result<()> {
    for section in collect_ptr_sections(ctx) {
        let count = section.size / P::SIZE;
        for i in 0..count {
            let ptr_addr = section.addr + i * P::SIZE;

            if let Some(record) = fixer.bind_records.get(&ptr_addr) {
                let name = record.symbol_name.clone();
                fixer.cache_pointer(section.kind, &name, ptr_addr);
                continue;
            }

            if let Some(name) = indirect_entry_name(ctx, section.indirect_index as u64 + i) {
                fixer.cache_pointer(section.kind, &name, ptr_addr);
                continue;
            }

            // Chase the pointer's target through any stubs it goes through,
            // memoizing per slot across images.
            let mut target = ctx
                .accelerator
                .symbol_pointer_targets
                .get(&ptr_addr)
                .copied();
            if target.is_none() {
                let slid = ctx.pointer_tracker.slide_at::<P>(ctx.cache, ptr_addr);
                target = slid.map(|t| resolve_stub_chain(ctx, t));
                if let Some(target) = target {
                    ctx.accelerator
                        .symbol_pointer_targets
                        .insert(ptr_addr, target);
                }
            }
            if let Some(target) = target {
                if let Some(set) = fixer.symbolizer.symbolize(target) {
                    let names: Vec<String> =
                        set.names().iter().map(|n| n.name.clone()).collect();
                    for name in names {
                        fixer.cache_pointer(section.kind, &name, ptr_addr);
                    }
                    continue;
                }
                ctx.activity.warn(format!(
                    "unable to symbolize pointer at {ptr_addr:#x} targeting {target:#x}"
                ));
            }
        }
    }
    Ok(())
}

// =============================================================================
// arm64 fixes
// =============================================================================

/// Repoints lazy-bind pointer slots at their stub-helper entries.
fn fix_stub_helpers<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    _fixer: &mut StubFixer,
) -> Result<()> {
    let Some(helper) = ctx.image.section("__TEXT", "__stub_helper") else {
        return Ok(());
    };
    let helper_addr_start = helper.section.addr();
    let helper_end = helper_addr_start + helper.section.size();

    let Some((dyld_info, _)) = ctx.image.dyld_info() else {
        return Ok(());
    };
    if dyld_info.lazy_bind_size == 0 {
        ctx.activity
            .warn("unable to fix stub helpers without lazy bind info");
        return Ok(());
    }
    let Some(lazy_off) = ctx.image.linkedit_offset(dyld_info.lazy_bind_off as u64) else {
        return Ok(());
    };
    let lazy_size = dyld_info.lazy_bind_size as usize;

    let segment_bases: Vec<u64> = ctx
        .image
        .segments()
        .map(|seg| seg.command.vmaddr())
        .collect();

    let mut helper_addr = helper_addr_start + STUB_BINDER_SIZE;
    while helper_addr < helper_end {
        let words = match helper_offset_words(ctx, helper_addr) {
            Some(words) => words,
            None => break,
        };

        if let Some(bind_off) = arm64::stub_helper_data(&words) {
            let bind_off = bind_off as usize;
            if bind_off < lazy_size {
                let data = ctx.image.read_at(lazy_off + bind_off, lazy_size - bind_off)?;
                match parse_bind_info(data, P::SIZE) {
                    Ok(records) if !records.is_empty() => {
                        let record = &records[0];
                        if let Some(&base) = segment_bases.get(record.segment_index as usize) {
                            let slot_addr = base + record.segment_offset;
                            if let Some(offset) = ctx.image.addr_to_offset(slot_addr) {
                                ctx.image.write_ptr(offset, helper_addr)?;
                                ctx.pointer_tracker.add(slot_addr, helper_addr, None);
                            }
                        }
                    }
                    _ => ctx.activity.warn(format!(
                        "invalid lazy bind data for helper at {helper_addr:#x}"
                    )),
                }
            }
            helper_addr += REG_HELPER_SIZE;
            continue;
        }

        if let Some((target, size)) = read_words(ctx, helper_addr, 50)
            .and_then(|words| arm64::resolver_data(&words, helper_addr))
        {
            if !ctx.image.contains_addr(target) {
                ctx.activity.warn(format!(
                    "stub resolver at {helper_addr:#x} points outside of image"
                ));
            }
            helper_addr += size;
            continue;
        }

        ctx.activity.warn(format!(
            "unknown stub helper format at {helper_addr:#x}"
        ));
        helper_addr += REG_HELPER_SIZE;
    }

    Ok(())
}

fn helper_offset_words<P: Pointer>(
    ctx: &ExtractionContext<P>,
    addr: u64,
) -> Option<Vec<u32>> {
    let offset = ctx.image.addr_to_offset(addr)?;
    let bytes = ctx.image.read_at(offset, 12).ok()?;
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Rewrites every stub to load through a pointer slot in this image.
fn fix_stub_sections<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut StubFixer,
) -> Result<()> {
    for section in collect_stub_sections(ctx) {
        let count = section.size / section.stub_size as u64;
        for i in 0..count {
            let stub_addr = section.addr + i * section.stub_size as u64;

            let Some((stub_target, kind)) = resolve_stub(ctx, stub_addr) else {
                ctx.activity
                    .warn(format!("unknown stub format at {stub_addr:#x}, zero-filled"));
                if let Some(offset) = ctx.image.addr_to_offset(stub_addr) {
                    let zeros = vec![0u8; section.stub_size as usize];
                    ctx.image.write_at(offset, &zeros)?;
                }
                continue;
            };

            let name = symbolize_stub(ctx, fixer, &section, i, stub_addr, kind);
            let Some(name) = name else {
                ctx.activity
                    .warn(format!("unable to symbolize stub at {stub_addr:#x}"));
                continue;
            };

            fixer.stub_map.entry(name.clone()).or_insert(stub_addr);
            fixer.stub_names.insert(stub_addr, name.clone());

            fix_one_stub(ctx, fixer, &section, stub_addr, stub_target, kind, &name)?;
        }
    }
    Ok(())
}

fn symbolize_stub<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &StubFixer,
    section: &StubSection,
    index: u64,
    stub_addr: u64,
    kind: arm64::StubKind,
) -> Option<String> {
    // Through the indirect table.
    if let Some(name) = indirect_entry_name(ctx, section.indirect_index as u64 + index) {
        return Some(name);
    }

    // Through the stub's own pointer slot, when it has one.
    if matches!(kind, arm64::StubKind::Normal | arm64::StubKind::AuthNormal) {
        let words = read_words(ctx, stub_addr, 4)?;
        if let Some((_, arm64::StubTarget::PointerSlot(slot))) =
            arm64::classify_stub(&words, stub_addr)
        {
            if let Some(name) = fixer.ptr_names.get(&slot) {
                return Some(name.clone());
            }
        }
    }

    // Through the final target of the chain.
    let target = resolve_stub_chain(ctx, stub_addr);
    fixer
        .symbolizer
        .symbolize(target)
        .and_then(|set| set.preferred())
        .map(|sym| sym.name.clone())
}

fn fix_one_stub<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut StubFixer,
    section: &StubSection,
    stub_addr: u64,
    stub_target: u64,
    kind: arm64::StubKind,
    name: &str,
) -> Result<()> {
    match kind {
        arm64::StubKind::Normal => {}

        arm64::StubKind::Optimized => {
            if let Some(slot) = fixer.pointer_for(PtrSectionKind::Lazy, name) {
                write_stub(ctx, stub_addr, &arm64::write_normal_stub(stub_addr, slot))?;
            } else if section.stub_size == 0x10 {
                // Older caches: optimized auth stubs resemble regular stubs.
                if let Some(slot) = fixer.pointer_for(PtrSectionKind::NonLazyAuth, name) {
                    write_stub(ctx, stub_addr, &arm64::write_normal_auth_stub(stub_addr, slot))?;
                    repoint_slot(ctx, slot, stub_addr)?;
                } else {
                    warn_no_pointer(ctx, stub_addr, name);
                }
            } else if let Some(slot) = fixer.pointer_for(PtrSectionKind::NonLazy, name) {
                write_stub(ctx, stub_addr, &arm64::write_normal_stub(stub_addr, slot))?;
            } else {
                warn_no_pointer(ctx, stub_addr, name);
            }
        }

        arm64::StubKind::AuthNormal => {
            let words = read_words(ctx, stub_addr, 4).unwrap_or_default();
            let slot = match arm64::classify_stub(&words, stub_addr) {
                Some((_, arm64::StubTarget::PointerSlot(slot))) => slot,
                _ => return Ok(()),
            };
            if ctx.image.contains_addr(slot) {
                repoint_slot(ctx, slot, stub_addr)?;
            } else if let Some(own_slot) = fixer.pointer_for(PtrSectionKind::NonLazyAuth, name) {
                write_stub(
                    ctx,
                    stub_addr,
                    &arm64::write_normal_auth_stub(stub_addr, own_slot),
                )?;
                repoint_slot(ctx, own_slot, stub_addr)?;
            } else {
                warn_no_pointer(ctx, stub_addr, name);
            }
        }

        arm64::StubKind::AuthOptimized => {
            if let Some(slot) = fixer.pointer_for(PtrSectionKind::NonLazyAuth, name) {
                write_stub(ctx, stub_addr, &arm64::write_normal_auth_stub(stub_addr, slot))?;
                repoint_slot(ctx, slot, stub_addr)?;
            } else {
                warn_no_pointer(ctx, stub_addr, name);
            }
        }

        arm64::StubKind::AuthResolver => {
            if !ctx.image.contains_addr(stub_target) {
                ctx.activity
                    .warn(format!("unable to fix auth stub resolver at {stub_addr:#x}"));
            }
        }
    }
    Ok(())
}

fn write_stub<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    stub_addr: u64,
    bytes: &[u8],
) -> Result<()> {
    if let Some(offset) = ctx.image.addr_to_offset(stub_addr) {
        ctx.image.write_at(offset, bytes)?;
    }
    Ok(())
}

fn repoint_slot<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    slot: u64,
    stub_addr: u64,
) -> Result<()> {
    if let Some(offset) = ctx.image.addr_to_offset(slot) {
        ctx.image.write_ptr(offset, stub_addr)?;
    }
    ctx.pointer_tracker.add(slot, stub_addr, None);
    Ok(())
}

fn warn_no_pointer<P: Pointer>(ctx: &ExtractionContext<P>, stub_addr: u64, name: &str) {
    ctx.activity.warn(format!(
        "unable to find a pointer for stub at {stub_addr:#x} with possible name {name}"
    ));
}

/// Retargets `b`/`bl` callsites that branch out of the image at the image's
/// own stub for the same symbol.
fn fix_callsites<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut StubFixer,
) -> Result<()> {
    let Some(text) = ctx.image.section("__TEXT", "__text") else {
        ctx.activity.warn("unable to find __text section");
        return Ok(());
    };
    let text_addr = text.section.addr();
    let text_size = text.section.size();

    let mut sect_off = 0u64;
    while sect_off + 4 <= text_size {
        let addr = text_addr + sect_off;
        let offset = match ctx.image.addr_to_offset(addr) {
            Some(offset) => offset,
            None => break,
        };
        let instr = ctx.image.read_u32(offset)?;

        if !arm64::is_branch(instr) && !arm64::is_bl(instr) {
            sect_off += 4;
            continue;
        }

        let target = arm64::decode_branch26(instr, addr);
        if ctx.image.contains_addr(target) {
            sect_off += 4;
            continue;
        }

        let final_target = resolve_stub_chain(ctx, target);
        let stub = fixer
            .symbolizer
            .symbolize(final_target)
            .and_then(|set| set.preferred())
            .and_then(|sym| fixer.stub_map.get(&sym.name).copied());

        match stub {
            Some(stub_addr) => {
                let link = arm64::is_bl(instr);
                let fixed = arm64::encode_branch26(addr, stub_addr, link);
                ctx.image.write_u32(offset, fixed)?;
            }
            None => {
                // Data words in __text can match the branch filter; they
                // typically follow an unconditional branch, so skip those.
                let prev = if sect_off >= 4 {
                    ctx.image.read_u32(offset - 4).unwrap_or(0)
                } else {
                    0
                };
                if !(arm64::is_branch(prev) || arm64::is_bl(prev) || (prev >> 24) == 0xD6) {
                    ctx.activity.warn(format!(
                        "unable to fix branch at {addr:#x} targeting {target:#x}"
                    ));
                }
            }
        }

        sect_off += 4;
    }

    Ok(())
}

// =============================================================================
// Redacted indirect back-fill
// =============================================================================

/// Fills the trailing nlist slots the linkedit optimizer reserved with
/// synthesized import symbols for every redacted indirect entry, and points
/// those entries at the new symbols.
fn fix_indirect_symbols<P: Pointer>(
    ctx: &mut ExtractionContext<P>,
    fixer: &mut StubFixer,
) -> Result<()> {
    if ctx.redacted_indirect_count == 0 {
        return Ok(());
    }
    let Some((symtab, symtab_cmd_off)) = ctx.image.symtab() else {
        return Ok(());
    };
    let Some((dysymtab, dysymtab_cmd_off)) = ctx.image.dysymtab() else {
        return Ok(());
    };

    // Collect (indirect_index, name) pairs for zeroed entries.
    let mut fills: Vec<(u64, String)> = Vec::new();
    let mut lookup = |index: u64, named: Option<&String>, what: &str, addr: u64| {
        if let Some(name) = named {
            fills.push((index, name.clone()));
        } else {
            ctx.activity.warn(format!(
                "unable to symbolize {what} at {addr:#x} for redacted indirect entry {index}"
            ));
        }
    };

    for section in collect_ptr_sections(ctx) {
        let count = section.size / P::SIZE;
        for i in 0..count {
            let index = section.indirect_index as u64 + i;
            if !indirect_entry_is_zero(ctx, &dysymtab, index)? {
                continue;
            }
            let ptr_addr = section.addr + i * P::SIZE;
            lookup(index, fixer.ptr_names.get(&ptr_addr), "pointer", ptr_addr);
        }
    }
    for section in collect_stub_sections(ctx) {
        let count = section.size / section.stub_size as u64;
        for i in 0..count {
            let index = section.indirect_index as u64 + i;
            if !indirect_entry_is_zero(ctx, &dysymtab, index)? {
                continue;
            }
            let stub_addr = section.addr + i * section.stub_size as u64;
            lookup(index, fixer.stub_names.get(&stub_addr), "stub", stub_addr);
        }
    }

    if fills.is_empty() {
        return Ok(());
    }
    let fill_count = fills.len().min(ctx.redacted_indirect_count as usize);
    let fills = &fills[..fill_count];

    // Grow the string-pool region for the new names.
    let added_strings: u32 = fills.iter().map(|(_, name)| name.len() as u32 + 1).sum();
    let stroff_field = symtab_cmd_off + 16;
    let Some(tracker) = ctx.linkedit_tracker.as_mut() else {
        ctx.activity
            .warn("cannot back-fill redacted symbols: linkedit optimizer did not run");
        return Ok(());
    };
    let grew = tracker.resize_linkedit_data(
        &mut ctx.image,
        stroff_field,
        symtab.strsize + added_strings,
    )?;
    if !grew {
        ctx.activity
            .warn("no linkedit space to back-fill redacted symbols");
        return Ok(());
    }

    // Write the nlist entries into the reserved slots and the names into the
    // extended string pool.
    let mut entry_index = symtab.nsyms;
    let mut strx = symtab.strsize;
    for (indirect_index, name) in fills {
        let nlist_off = ctx
            .image
            .linkedit_offset(symtab.symoff as u64 + entry_index as u64 * P::RawNlist::SIZE as u64)
            .ok_or_else(|| crate::error::Error::SymbolTableNotFound)?;
        let mut nlist = P::RawNlist::default();
        nlist.set_strx(strx);
        nlist.set_n_type(1);
        ctx.image.write_at(nlist_off, nlist.as_bytes())?;

        let name_off = ctx
            .image
            .linkedit_offset(symtab.stroff as u64 + strx as u64)
            .ok_or_else(|| crate::error::Error::SymbolTableNotFound)?;
        ctx.image.write_at(name_off, name.as_bytes())?;
        ctx.image.write_at(name_off + name.len(), &[0])?;

        let entry_off = ctx
            .image
            .linkedit_offset(dysymtab.indirectsymoff as u64 + indirect_index * 4)
            .ok_or_else(|| crate::error::Error::SymbolTableNotFound)?;
        ctx.image.write_u32(entry_off, entry_index)?;

        entry_index += 1;
        strx += name.len() as u32 + 1;
    }

    // Update the symbol counts and sizes.
    let new_count = fills.len() as u32;
    let mut new_symtab = symtab;
    new_symtab.nsyms += new_count;
    new_symtab.strsize += added_strings;
    ctx.image.write_struct(symtab_cmd_off, &new_symtab)?;

    let mut new_dysymtab = dysymtab;
    new_dysymtab.nundefsym += new_count;
    ctx.image.write_struct(dysymtab_cmd_off, &new_dysymtab)?;

    // The string region grew; the linkedit segment covers up to its end.
    let Some(tracker) = ctx.linkedit_tracker.as_ref() else {
        return Ok(());
    };
    let new_size = (tracker.tracked_end() - tracker.linkedit_start()) as u64;
    let Some((seg_off, mut seg_cmd)) = ctx
        .image
        .segment("__LINKEDIT")
        .map(|seg| (seg.command_offset, seg.command))
    else {
        return Ok(());
    };
    seg_cmd.set_vmsize(new_size);
    seg_cmd.set_filesize(new_size);
    ctx.image.write_struct(seg_off, &seg_cmd)?;
    ctx.image.reparse_load_commands()?;

    ctx.activity.info(&format!(
        "back-filled {} redacted indirect symbols",
        fills.len()
    ));
    Ok(())
}

fn indirect_entry_is_zero<P: Pointer>(
    ctx: &ExtractionContext<P>,
    dysymtab: &crate::macho::DysymtabCommand,
    index: u64,
) -> Result<bool> {
    if index >= dysymtab.nindirectsyms as u64 {
        return Ok(false);
    }
    let Some(offset) = ctx
        .image
        .linkedit_offset(dysymtab.indirectsymoff as u64 + index * 4)
    else {
        return Ok(false);
    };
    Ok(ctx.image.read_u32(offset)? == 0)
}

// =============================================================================
// Entry point
// =============================================================================

/// Fixes stubs, pointer sections, callsites, and redacted indirect entries.
pub fn fix_stubs<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Result<()> {
    ctx.activity.info("fixing stubs");

    let symbolizer = Symbolizer::build(ctx.cache, &ctx.image, ctx.accelerator, &ctx.activity);
    let mut fixer = StubFixer::new(symbolizer);

    preflight_sections(ctx)?;
    read_bind_records(ctx, &mut fixer)?;
    scan_symbol_pointers(ctx, &mut fixer)?;

    if is_arm64_family(ctx.cache.architecture()) {
        fix_stub_helpers(ctx, &mut fixer)?;
        fix_stub_sections(ctx, &mut fixer)?;
        fix_callsites(ctx, &mut fixer)?;
    }

    fix_indirect_symbols(ctx, &mut fixer)?;

    ctx.symbolizer = Some(fixer.symbolizer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Pointer64;
    use crate::macho::Section64;

    #[test]
    fn test_ptr_section_kind() {
        let mut sect = Section64::default();
        sect.flags = S_LAZY_SYMBOL_POINTERS;
        sect.sectname = *b"__la_symbol_ptr\0";
        assert_eq!(
            ptr_section_kind::<Pointer64>(&sect),
            Some(PtrSectionKind::Lazy)
        );

        sect.flags = S_NON_LAZY_SYMBOL_POINTERS;
        sect.sectname = *b"__auth_got\0\0\0\0\0\0";
        assert_eq!(
            ptr_section_kind::<Pointer64>(&sect),
            Some(PtrSectionKind::NonLazyAuth)
        );

        sect.sectname = *b"__got\0\0\0\0\0\0\0\0\0\0\0";
        assert_eq!(
            ptr_section_kind::<Pointer64>(&sect),
            Some(PtrSectionKind::NonLazy)
        );

        sect.flags = 0;
        assert_eq!(ptr_section_kind::<Pointer64>(&sect), None);
    }

    #[test]
    fn test_pointer_cache_prefers_first() {
        let mut fixer = StubFixer::new(Symbolizer::default());
        fixer.cache_pointer(PtrSectionKind::Lazy, "_malloc", 0x1000);
        fixer.cache_pointer(PtrSectionKind::Lazy, "_malloc", 0x1008);
        assert_eq!(fixer.pointer_for(PtrSectionKind::Lazy, "_malloc"), Some(0x1000));
        assert_eq!(fixer.pointer_for(PtrSectionKind::NonLazy, "_malloc"), None);
        assert_eq!(fixer.ptr_names.get(&0x1000).unwrap(), "_malloc");
    }
}
