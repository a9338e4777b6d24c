//! Linkedit optimizer.
//!
//! The cache merges every image's `__LINKEDIT` into shared pools. This stage
//! rebuilds a compact per-image linkedit in a fixed region order: binding
//! info, weak binding, lazy binding, export info, symbol entries, function
//! starts, data-in-code, the indirect symbol table, and the string pool.
//! Every region is 8-byte aligned and registered with the linkedit tracker
//! at its final location so later shifts keep the load commands honest.
//!
//! Symbol entries are laid out as: one `<redacted>` placeholder (when the
//! indirect table has zeroed entries), public locals, locals recovered from
//! the symbols sub-cache, exported, imported, then empty trailing slots the
//! stub fixer can back-fill for redacted indirect entries.

use std::collections::BTreeMap;
use std::collections::HashMap;

use zerocopy::{FromBytes, IntoBytes};

use crate::arch::Pointer;
use crate::dyld::{
    DyldCacheLocalSymbolsEntry, DyldCacheLocalSymbolsEntry64, DyldCacheLocalSymbolsInfo,
};
use crate::error::{Error, Result};
use crate::macho::{
    is_indirect_sentinel, DyldInfoCommand, DysymtabCommand, LinkeditDataCommand,
    RawNlist, RawSegment, SymtabCommand, LC_ATOM_INFO, LC_BUILD_VERSION, LC_CODE_SIGNATURE,
    LC_DATA_IN_CODE, LC_DYLD_CHAINED_FIXUPS, LC_DYLD_ENVIRONMENT, LC_DYLD_EXPORTS_TRIE,
    LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_DYLIB_CODE_SIGN_DRS, LC_DYSYMTAB,
    LC_ENCRYPTION_INFO, LC_ENCRYPTION_INFO_64, LC_FILESET_ENTRY, LC_FUNCTION_STARTS,
    LC_FVMFILE, LC_IDENT, LC_IDFVMLIB, LC_ID_DYLIB, LC_ID_DYLINKER, LC_LAZY_LOAD_DYLIB,
    LC_LINKER_OPTIMIZATION_HINT, LC_LINKER_OPTION, LC_LOADFVMLIB, LC_LOAD_DYLIB,
    LC_LOAD_DYLINKER, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_MAIN, LC_NOTE,
    LC_PREBIND_CKSUM, LC_PREBOUND_DYLIB, LC_REEXPORT_DYLIB, LC_ROUTINES, LC_ROUTINES_64,
    LC_RPATH, LC_SEGMENT, LC_SEGMENT_64, LC_SEGMENT_SPLIT_INFO, LC_SOURCE_VERSION,
    LC_SUB_CLIENT, LC_SUB_FRAMEWORK, LC_SUB_LIBRARY, LC_SUB_UMBRELLA, LC_SYMSEG, LC_SYMTAB,
    LC_THREAD, LC_TWOLEVEL_HINTS, LC_UNIXTHREAD, LC_UUID, LC_VERSION_MIN_IPHONEOS,
    LC_VERSION_MIN_MACOSX, LC_VERSION_MIN_TVOS, LC_VERSION_MIN_WATCHOS,
};
use crate::provider::{LinkeditTracker, TrackedData, REDACTED_SYMBOL_NAME};
use crate::util::{align_up, cstr_at};

use super::ExtractionContext;

// =============================================================================
// String pool
// =============================================================================

/// De-duplicating, append-only string pool for the rebuilt string table.
///
/// Offset 0 always holds the empty-string sentinel. Offsets are assigned in
/// insertion order and never move; [`StringPool::write`] lays the strings
/// out in ascending offset order, so the emitted table is byte-identical
/// across runs.
#[derive(Debug)]
pub struct StringPool {
    pool: HashMap<Vec<u8>, u32>,
    length: u32,
}

impl StringPool {
    /// Creates a pool holding only the empty-string sentinel.
    pub fn new() -> Self {
        let mut pool = HashMap::new();
        pool.insert(Vec::new(), 0);
        Self { pool, length: 1 }
    }

    /// Interns a string (without trailing NUL) and returns its offset.
    pub fn add(&mut self, s: &[u8]) -> u32 {
        let s = match s.last() {
            Some(0) => &s[..s.len() - 1],
            _ => s,
        };
        if let Some(&offset) = self.pool.get(s) {
            return offset;
        }
        let offset = self.length;
        self.pool.insert(s.to_vec(), offset);
        self.length += s.len() as u32 + 1;
        offset
    }

    /// Current pool size in bytes.
    pub fn size(&self) -> u32 {
        self.length
    }

    /// Emits the pool: strings at their issued offsets, NUL separated.
    pub fn write(&self) -> Vec<u8> {
        let mut ordered: BTreeMap<u32, &[u8]> = BTreeMap::new();
        for (s, &offset) in &self.pool {
            ordered.insert(offset, s.as_slice());
        }
        let mut out = vec![0u8; self.length as usize];
        for (offset, s) in ordered {
            out[offset as usize..offset as usize + s.len()].copy_from_slice(s);
        }
        out
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Load-command validation
// =============================================================================

/// Classifies every load command before the rebuild, warning about
/// commands that may reference linkedit data this stage does not handle.
fn check_load_commands<P: Pointer>(ctx: &ExtractionContext<P>) {
    for lc in &ctx.image.load_commands {
        let cmd = lc.cmd();
        match cmd {
            // No linkedit data.
            LC_SEGMENT | LC_SEGMENT_64 | LC_IDFVMLIB | LC_LOADFVMLIB | LC_ID_DYLIB
            | LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB
            | LC_LAZY_LOAD_DYLIB | LC_SUB_FRAMEWORK | LC_SUB_CLIENT | LC_SUB_UMBRELLA
            | LC_SUB_LIBRARY | LC_PREBOUND_DYLIB | LC_ID_DYLINKER | LC_LOAD_DYLINKER
            | LC_DYLD_ENVIRONMENT | LC_THREAD | LC_UNIXTHREAD | LC_ROUTINES | LC_ROUTINES_64
            | LC_PREBIND_CKSUM | LC_UUID | LC_RPATH | LC_VERSION_MIN_MACOSX
            | LC_VERSION_MIN_IPHONEOS | LC_VERSION_MIN_WATCHOS | LC_VERSION_MIN_TVOS
            | LC_BUILD_VERSION | LC_LINKER_OPTION | LC_IDENT | LC_FVMFILE | LC_MAIN
            | LC_SOURCE_VERSION | LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64
            | LC_FILESET_ENTRY => {}

            // Linkedit data handled by this stage.
            LC_SYMTAB | LC_DYSYMTAB | LC_DYLD_EXPORTS_TRIE | LC_FUNCTION_STARTS
            | LC_DATA_IN_CODE | LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {}

            // Known commands whose linkedit payloads are not rebuilt.
            LC_TWOLEVEL_HINTS | LC_CODE_SIGNATURE | LC_SEGMENT_SPLIT_INFO
            | LC_DYLIB_CODE_SIGN_DRS | LC_LINKER_OPTIMIZATION_HINT | LC_DYLD_CHAINED_FIXUPS
            | LC_SYMSEG | LC_NOTE | LC_ATOM_INFO => {
                ctx.activity.warn(format!(
                    "unhandled load command {cmd:#x} may reference linkedit data"
                ));
            }

            _ => {
                ctx.activity.warn(format!(
                    "unknown load command {cmd:#x} may reference linkedit data"
                ));
            }
        }
    }
}

// =============================================================================
// Optimizer
// =============================================================================

struct LinkeditOptimizer<P: Pointer> {
    new_linkedit: Vec<u8>,
    string_pool: StringPool,
    old_to_new_symbol_index: HashMap<u32, u32>,
    symbol_count: u32,
    redacted_count: u32,

    symtab: Option<(SymtabCommand, usize)>,
    dysymtab: Option<(DysymtabCommand, usize)>,
    dyld_info: Option<(DyldInfoCommand, usize)>,
    export_trie: Option<(LinkeditDataCommand, usize)>,
    function_starts: Option<(LinkeditDataCommand, usize)>,
    data_in_code: Option<(LinkeditDataCommand, usize)>,

    // Region offsets relative to the linkedit start, with sizes.
    new_bind: Option<(u32, u32)>,
    new_weak_bind: Option<(u32, u32)>,
    new_lazy_bind: Option<(u32, u32)>,
    new_export: Option<(u32, u32)>,
    new_symbols: Option<(u32, u32)>,
    new_function_starts: Option<(u32, u32)>,
    new_data_in_code: Option<(u32, u32)>,
    new_indirect: Option<(u32, u32)>,
    new_strings: Option<(u32, u32)>,
    string_table_size: u32,

    new_local_index: u32,
    new_local_count: u32,
    new_extdef_index: u32,
    new_extdef_count: u32,
    new_undef_index: u32,
    new_undef_count: u32,

    _pointer: std::marker::PhantomData<P>,
}

impl<P: Pointer> LinkeditOptimizer<P> {
    fn new(ctx: &ExtractionContext<P>) -> Self {
        Self {
            new_linkedit: Vec::new(),
            string_pool: StringPool::new(),
            old_to_new_symbol_index: HashMap::new(),
            symbol_count: 0,
            redacted_count: 0,
            symtab: ctx.image.symtab(),
            dysymtab: ctx.image.dysymtab(),
            dyld_info: ctx.image.dyld_info(),
            export_trie: ctx.image.linkedit_data_command(LC_DYLD_EXPORTS_TRIE),
            function_starts: ctx.image.linkedit_data_command(LC_FUNCTION_STARTS),
            data_in_code: ctx.image.linkedit_data_command(LC_DATA_IN_CODE),
            new_bind: None,
            new_weak_bind: None,
            new_lazy_bind: None,
            new_export: None,
            new_symbols: None,
            new_function_starts: None,
            new_data_in_code: None,
            new_indirect: None,
            new_strings: None,
            string_table_size: 0,
            new_local_index: 0,
            new_local_count: 0,
            new_extdef_index: 0,
            new_extdef_count: 0,
            new_undef_index: 0,
            new_undef_count: 0,
            _pointer: std::marker::PhantomData,
        }
    }

    /// Reads old linkedit bytes cited by a load-command offset.
    fn old_data<'i>(
        ctx: &'i ExtractionContext<P>,
        cited: u32,
        size: u32,
    ) -> Result<&'i [u8]> {
        if size == 0 {
            return Ok(&[]);
        }
        let offset = ctx
            .image
            .linkedit_offset(cited as u64)
            .ok_or_else(|| Error::parse(cited as usize, "linkedit offset outside segment"))?;
        ctx.image.read_at(offset, size as usize)
    }

    fn align_cursor(&mut self) {
        let aligned = align_up(self.new_linkedit.len() as u64, 8) as usize;
        self.new_linkedit.resize(aligned, 0);
    }

    /// Appends a blob, returning `(relative_offset, aligned_size)`.
    fn append_region(&mut self, data: &[u8]) -> (u32, u32) {
        self.align_cursor();
        let offset = self.new_linkedit.len() as u32;
        self.new_linkedit.extend_from_slice(data);
        self.align_cursor();
        let size = self.new_linkedit.len() as u32 - offset;
        (offset, size)
    }

    // =========================================================================
    // Region copies
    // =========================================================================

    fn copy_binding_info(&mut self, ctx: &ExtractionContext<P>) -> Result<()> {
        let Some((info, _)) = self.dyld_info else {
            return Ok(());
        };
        if info.bind_size > 0 {
            let data = Self::old_data(ctx, info.bind_off, info.bind_size)?.to_vec();
            self.new_bind = Some(self.append_region(&data));
        }
        if info.weak_bind_size > 0 {
            let data = Self::old_data(ctx, info.weak_bind_off, info.weak_bind_size)?.to_vec();
            self.new_weak_bind = Some(self.append_region(&data));
        }
        if info.lazy_bind_size > 0 {
            let data = Self::old_data(ctx, info.lazy_bind_off, info.lazy_bind_size)?.to_vec();
            self.new_lazy_bind = Some(self.append_region(&data));
        }
        Ok(())
    }

    fn copy_export_info(&mut self, ctx: &ExtractionContext<P>) -> Result<()> {
        let source = if let Some((trie, _)) = self.export_trie {
            Some((trie.dataoff, trie.datasize))
        } else if let Some((info, _)) = self.dyld_info {
            Some((info.export_off, info.export_size))
        } else {
            None
        };
        if let Some((off, size)) = source {
            if size > 0 {
                let data = Self::old_data(ctx, off, size)?.to_vec();
                self.new_export = Some(self.append_region(&data));
            }
        }
        Ok(())
    }

    /// Scans the indirect table for zeroed entries and prepends the
    /// `<redacted>` placeholder symbol when any exist.
    fn search_redacted_symbols(&mut self, ctx: &mut ExtractionContext<P>) -> Result<()> {
        let Some((dysymtab, _)) = self.dysymtab else {
            return Ok(());
        };
        for index in 0..dysymtab.nindirectsyms {
            let entry_bytes =
                Self::old_data(ctx, dysymtab.indirectsymoff + index * 4, 4)?;
            if crate::util::read_u32_le(entry_bytes) == 0 {
                self.redacted_count += 1;
            }
        }

        if self.redacted_count > 0 {
            let strx = self.string_pool.add(REDACTED_SYMBOL_NAME.as_bytes());
            let mut nlist = P::RawNlist::default();
            nlist.set_strx(strx);
            nlist.set_n_type(1);
            self.new_linkedit.extend_from_slice(nlist.as_bytes());
            self.symbol_count += 1;

            ctx.has_redacted_indirect = true;
            ctx.redacted_indirect_count = self.redacted_count;
        }
        Ok(())
    }

    /// Copies a contiguous range of old symbol entries, re-interning names.
    /// Returns the number copied. `skip_redacted_names` drops entries whose
    /// name is literally `<redacted>`.
    fn copy_symbol_range(
        &mut self,
        ctx: &ExtractionContext<P>,
        start: u32,
        count: u32,
        skip_redacted_names: bool,
    ) -> Result<u32> {
        let Some((symtab, _)) = self.symtab else {
            return Ok(0);
        };
        let mut copied = 0;
        for index in start..start + count {
            let nlist_off = symtab.symoff as u64 + index as u64 * P::RawNlist::SIZE as u64;
            let bytes = Self::old_data(ctx, nlist_off as u32, P::RawNlist::SIZE as u32)?;
            let mut nlist = P::RawNlist::read_from_bytes(bytes)
                .map_err(|_| Error::parse(nlist_off as usize, "failed to parse nlist"))?;

            let name_off = symtab.stroff as u64 + nlist.strx() as u64;
            let name = ctx
                .image
                .linkedit_offset(name_off)
                .and_then(|off| cstr_at(&ctx.image.data, off))
                .unwrap_or(b"");

            if skip_redacted_names && name == REDACTED_SYMBOL_NAME.as_bytes() {
                continue;
            }

            let name = name.to_vec();
            nlist.set_strx(self.string_pool.add(&name));
            self.new_linkedit.extend_from_slice(nlist.as_bytes());

            self.old_to_new_symbol_index.insert(index, self.symbol_count);
            self.symbol_count += 1;
            copied += 1;
        }
        Ok(copied)
    }

    /// Imports the image's stripped locals from the symbols sub-cache.
    fn copy_redacted_locals(&mut self, ctx: &ExtractionContext<P>) -> Result<u32> {
        let Some(symbols_file) = ctx.cache.symbols_cache() else {
            return Ok(0);
        };
        let info_offset = symbols_file.header.local_symbols_offset as usize;
        if info_offset == 0 {
            return Ok(0);
        }
        let symbols_data = symbols_file.data();
        let Some(info_bytes) = symbols_data.get(info_offset..) else {
            return Ok(0);
        };
        let Ok((info, _)) = DyldCacheLocalSymbolsInfo::read_from_prefix(info_bytes) else {
            return Ok(0);
        };

        let text_vmaddr = ctx
            .image
            .segment("__TEXT")
            .map(|seg| seg.command.vmaddr())
            .ok_or_else(|| Error::SegmentNotFound {
                name: "__TEXT".into(),
            })?;

        let entries_start = info_offset + info.entries_offset as usize;
        let found = if ctx.cache.uses_64bit_local_symbol_entries() {
            let image_offset = text_vmaddr - ctx.cache.shared_region_start();
            let entry_size = std::mem::size_of::<DyldCacheLocalSymbolsEntry64>();
            (0..info.entries_count as usize).find_map(|i| {
                let offset = entries_start + i * entry_size;
                let entry =
                    DyldCacheLocalSymbolsEntry64::read_from_prefix(symbols_data.get(offset..)?)
                        .ok()?
                        .0;
                (entry.dylib_offset == image_offset)
                    .then_some((entry.nlist_start_index, entry.nlist_count))
            })
        } else {
            let image_offset = ctx
                .cache
                .convert_addr(text_vmaddr)
                .map(|(_, off)| off)
                .unwrap_or(0) as u32;
            let entry_size = std::mem::size_of::<DyldCacheLocalSymbolsEntry>();
            (0..info.entries_count as usize).find_map(|i| {
                let offset = entries_start + i * entry_size;
                let entry =
                    DyldCacheLocalSymbolsEntry::read_from_prefix(symbols_data.get(offset..)?)
                        .ok()?
                        .0;
                (entry.dylib_offset == image_offset)
                    .then_some((entry.nlist_start_index, entry.nlist_count))
            })
        };

        let Some((nlist_start, nlist_count)) = found else {
            ctx.activity
                .warn("no redacted-symbols entry for image in symbols subcache");
            return Ok(0);
        };

        let nlist_base = info_offset + info.nlist_offset as usize;
        let strings_base = info_offset + info.strings_offset as usize;

        let mut copied = 0;
        for i in 0..nlist_count as usize {
            let offset = nlist_base + (nlist_start as usize + i) * P::RawNlist::SIZE;
            let Some(bytes) = symbols_data.get(offset..offset + P::RawNlist::SIZE) else {
                break;
            };
            let mut nlist = P::RawNlist::read_from_bytes(bytes)
                .map_err(|_| Error::parse(offset, "failed to parse local symbols nlist"))?;

            let name = cstr_at(symbols_data, strings_base + nlist.strx() as usize)
                .unwrap_or(b"")
                .to_vec();
            nlist.set_strx(self.string_pool.add(&name));
            self.new_linkedit.extend_from_slice(nlist.as_bytes());
            self.symbol_count += 1;
            copied += 1;
        }
        Ok(copied)
    }

    fn copy_symbol_entries(&mut self, ctx: &mut ExtractionContext<P>) -> Result<()> {
        self.align_cursor();
        let region_start = self.new_linkedit.len() as u32;

        self.search_redacted_symbols(ctx)?;

        // Locals: public first, then the recovered redacted ones.
        self.new_local_index = self.symbol_count;
        if let Some((dysymtab, _)) = self.dysymtab {
            self.new_local_count =
                self.copy_symbol_range(ctx, dysymtab.ilocalsym, dysymtab.nlocalsym, true)?;
        }
        self.new_local_count += self.copy_redacted_locals(ctx)?;

        // Exported, then imported.
        self.new_extdef_index = self.symbol_count;
        if let Some((dysymtab, _)) = self.dysymtab {
            self.new_extdef_count =
                self.copy_symbol_range(ctx, dysymtab.iextdefsym, dysymtab.nextdefsym, false)?;
        }

        self.new_undef_index = self.symbol_count;
        if let Some((dysymtab, _)) = self.dysymtab {
            self.new_undef_count =
                self.copy_symbol_range(ctx, dysymtab.iundefsym, dysymtab.nundefsym, false)?;
        }

        // Trailing slots the stub fixer can fill for redacted entries.
        let trailing = self.redacted_count as usize * P::RawNlist::SIZE;
        self.new_linkedit
            .resize(self.new_linkedit.len() + trailing, 0);

        self.align_cursor();
        let region_size = self.new_linkedit.len() as u32 - region_start;
        self.new_symbols = Some((region_start, region_size));
        Ok(())
    }

    fn copy_function_starts(&mut self, ctx: &ExtractionContext<P>) -> Result<()> {
        let Some((cmd, _)) = self.function_starts else {
            return Ok(());
        };
        if cmd.datasize > 0 {
            let data = Self::old_data(ctx, cmd.dataoff, cmd.datasize)?.to_vec();
            self.new_function_starts = Some(self.append_region(&data));
        }
        Ok(())
    }

    fn copy_data_in_code(&mut self, ctx: &ExtractionContext<P>) -> Result<()> {
        let Some((cmd, _)) = self.data_in_code else {
            return Ok(());
        };
        if cmd.datasize > 0 {
            let data = Self::old_data(ctx, cmd.dataoff, cmd.datasize)?.to_vec();
            self.new_data_in_code = Some(self.append_region(&data));
        }
        Ok(())
    }

    fn copy_indirect_symbol_table(&mut self, ctx: &ExtractionContext<P>) -> Result<()> {
        let Some((dysymtab, _)) = self.dysymtab else {
            return Ok(());
        };
        if dysymtab.nindirectsyms == 0 {
            return Ok(());
        }

        let mut table = Vec::with_capacity(dysymtab.nindirectsyms as usize * 4);
        for index in 0..dysymtab.nindirectsyms {
            let entry_bytes = Self::old_data(ctx, dysymtab.indirectsymoff + index * 4, 4)?;
            let entry = crate::util::read_u32_le(entry_bytes);
            let mapped = remap_indirect_entry(entry, &self.old_to_new_symbol_index);
            let mapped = match mapped {
                Some(value) => value,
                None => {
                    ctx.activity.warn(format!(
                        "indirect entry {index} references unmapped symbol {entry}"
                    ));
                    crate::macho::INDIRECT_SYMBOL_LOCAL
                }
            };
            table.extend_from_slice(&mapped.to_le_bytes());
        }
        self.new_indirect = Some(self.append_region(&table));
        Ok(())
    }

    fn copy_string_pool(&mut self) {
        let table = self.string_pool.write();
        self.string_table_size = table.len() as u32;
        self.new_strings = Some(self.append_region(&table));
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Writes the rebuilt linkedit into the image, updates every load
    /// command, and registers all regions with the tracker.
    fn commit(
        self,
        ctx: &mut ExtractionContext<P>,
        tracker: &mut LinkeditTracker,
    ) -> Result<()> {
        let (le_start, le_capacity) = ctx
            .image
            .linkedit_span()
            .ok_or_else(|| Error::SegmentNotFound {
                name: "__LINKEDIT".into(),
            })?;
        if self.new_linkedit.len() > le_capacity {
            return Err(Error::buffer_too_small(self.new_linkedit.len(), le_capacity));
        }

        let le_fileoff = ctx
            .image
            .segment("__LINKEDIT")
            .map(|seg| seg.command.fileoff())
            .unwrap_or(le_start as u64);

        ctx.image.write_at(le_start, &self.new_linkedit)?;

        let cursor = self.new_linkedit.len() as u64;
        let track = |tracker: &mut LinkeditTracker,
                         offset_field: usize,
                         region: Option<(u32, u32)>| {
            if let Some((rel, size)) = region {
                tracker.track(TrackedData {
                    offset_field,
                    data_off: le_start + rel as usize,
                    data_size: size,
                });
            }
        };

        // Update the segment command first: vmsize == filesize == cursor.
        let (seg_cmd_offset, mut seg_cmd) = ctx
            .image
            .segment("__LINKEDIT")
            .map(|seg| (seg.command_offset, seg.command))
            .ok_or_else(|| Error::SegmentNotFound {
                name: "__LINKEDIT".into(),
            })?;
        seg_cmd.set_vmsize(cursor);
        seg_cmd.set_filesize(cursor);
        ctx.image.write_struct(seg_cmd_offset, &seg_cmd)?;

        // dyld info: bind/weak/lazy/export offsets.
        if let Some((mut info, offset)) = self.dyld_info {
            let field = |rel: Option<(u32, u32)>| rel.map(|(r, _)| le_fileoff as u32 + r);
            info.rebase_off = 0;
            info.rebase_size = 0;
            if let Some(value) = field(self.new_bind) {
                info.bind_off = value;
                track(tracker, offset + 16, self.new_bind);
            }
            if let Some(value) = field(self.new_weak_bind) {
                info.weak_bind_off = value;
                track(tracker, offset + 24, self.new_weak_bind);
            }
            if let Some(value) = field(self.new_lazy_bind) {
                info.lazy_bind_off = value;
                track(tracker, offset + 32, self.new_lazy_bind);
            }
            if self.export_trie.is_none() {
                if let Some(value) = field(self.new_export) {
                    info.export_off = value;
                    track(tracker, offset + 40, self.new_export);
                }
            } else {
                // The trie command owns the relocated blob.
                info.export_off = 0;
                info.export_size = 0;
            }
            ctx.image.write_struct(offset, &info)?;
        }

        // Export trie command, when that was the export source.
        if let Some((mut trie, offset)) = self.export_trie {
            if let Some((rel, size)) = self.new_export {
                trie.dataoff = le_fileoff as u32 + rel;
                trie.datasize = size.min(trie.datasize);
                track(tracker, offset + 8, self.new_export);
            } else {
                trie.dataoff = 0;
                trie.datasize = 0;
            }
            ctx.image.write_struct(offset, &trie)?;
        }

        // Symbol table command.
        if let Some((mut symtab, offset)) = self.symtab {
            if let Some((rel, _)) = self.new_symbols {
                symtab.symoff = le_fileoff as u32 + rel;
                track(tracker, offset + 8, self.new_symbols);
            }
            symtab.nsyms = self.symbol_count;
            if let Some((rel, _)) = self.new_strings {
                symtab.stroff = le_fileoff as u32 + rel;
                track(tracker, offset + 16, self.new_strings);
            }
            symtab.strsize = self.string_table_size;
            ctx.image.write_struct(offset, &symtab)?;
        }

        // Dynamic symbol table command.
        if let Some((mut dysymtab, offset)) = self.dysymtab {
            dysymtab.ilocalsym = self.new_local_index;
            dysymtab.nlocalsym = self.new_local_count;
            dysymtab.iextdefsym = self.new_extdef_index;
            dysymtab.nextdefsym = self.new_extdef_count;
            dysymtab.iundefsym = self.new_undef_index;
            dysymtab.nundefsym = self.new_undef_count;
            dysymtab.tocoff = 0;
            dysymtab.ntoc = 0;
            dysymtab.modtaboff = 0;
            dysymtab.nmodtab = 0;
            dysymtab.extrefsymoff = 0;
            dysymtab.nextrefsyms = 0;
            if let Some((rel, _)) = self.new_indirect {
                dysymtab.indirectsymoff = le_fileoff as u32 + rel;
                track(tracker, offset + 56, self.new_indirect);
            }
            dysymtab.extreloff = 0;
            dysymtab.nextrel = 0;
            dysymtab.locreloff = 0;
            dysymtab.nlocrel = 0;
            ctx.image.write_struct(offset, &dysymtab)?;
        }

        // Function starts and data-in-code.
        if let Some((mut cmd, offset)) = self.function_starts {
            if let Some((rel, size)) = self.new_function_starts {
                cmd.dataoff = le_fileoff as u32 + rel;
                cmd.datasize = size.min(cmd.datasize);
                track(tracker, offset + 8, self.new_function_starts);
            } else {
                cmd.dataoff = 0;
                cmd.datasize = 0;
            }
            ctx.image.write_struct(offset, &cmd)?;
        }
        if let Some((mut cmd, offset)) = self.data_in_code {
            if let Some((rel, size)) = self.new_data_in_code {
                cmd.dataoff = le_fileoff as u32 + rel;
                cmd.datasize = size.min(cmd.datasize);
                track(tracker, offset + 8, self.new_data_in_code);
            } else {
                cmd.dataoff = 0;
                cmd.datasize = 0;
            }
            ctx.image.write_struct(offset, &cmd)?;
        }

        ctx.image.reparse_load_commands()?;

        ctx.activity.info(&format!(
            "linkedit rebuilt: {} symbols, {} bytes",
            self.symbol_count,
            cursor
        ));
        Ok(())
    }
}

/// Remaps one indirect-table entry through the old-to-new symbol index map.
///
/// Sentinels (`ABS`, `LOCAL`, both) and zeroed (redacted) entries pass
/// through unchanged; the lookup is only performed for real indices.
fn remap_indirect_entry(entry: u32, map: &HashMap<u32, u32>) -> Option<u32> {
    if entry == 0 || is_indirect_sentinel(entry) {
        return Some(entry);
    }
    map.get(&entry).copied()
}

/// Rebuilds the image's `__LINKEDIT` segment.
pub fn optimize_linkedit<P: Pointer>(ctx: &mut ExtractionContext<P>) -> Result<()> {
    ctx.activity.info("optimizing linkedit");

    check_load_commands(ctx);

    let mut tracker = LinkeditTracker::new(&ctx.image)?;

    let mut optimizer = LinkeditOptimizer::new(ctx);
    optimizer.copy_binding_info(ctx)?;
    optimizer.copy_export_info(ctx)?;
    optimizer.copy_symbol_entries(ctx)?;
    optimizer.copy_function_starts(ctx)?;
    optimizer.copy_data_in_code(ctx)?;
    optimizer.copy_indirect_symbol_table(ctx)?;
    optimizer.copy_string_pool();
    optimizer.commit(ctx, &mut tracker)?;

    ctx.linkedit_tracker = Some(tracker);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Pointer64;
    use crate::dyld::test_support::{build_cache, TestMapping};
    use crate::macho::{
        DysymtabCommand, ImageView, MachHeader64, Nlist64, RawNlist as _, RawSection, Section64,
        SegmentCommand64, SymtabCommand, INDIRECT_SYMBOL_ABS, LC_SYMTAB,
    };
    use crate::provider::Accelerator;
    use zerocopy::IntoBytes;

    const BASE: u64 = 0x1_8000_0000;

    /// Builds a dylib with three symbols (a local and an exported sharing
    /// the name `_dup`, plus an undefined `_malloc`) and an indirect table
    /// holding two redacted entries and one sentinel.
    fn symbol_image() -> Vec<u8> {
        let mut data = vec![0u8; 0xA00];

        let mut text_seg = SegmentCommand64::default();
        RawSegment::set_name(&mut text_seg, "__TEXT");
        text_seg.vmaddr = BASE;
        text_seg.vmsize = 0x400;
        text_seg.filesize = 0x400;
        text_seg.nsects = 1;
        text_seg.cmdsize = (SegmentCommand64::SIZE + Section64::SIZE) as u32;

        let mut text_sect = Section64::default();
        text_sect.sectname = *b"__text\0\0\0\0\0\0\0\0\0\0";
        text_sect.segname = *b"__TEXT\0\0\0\0\0\0\0\0\0\0";
        text_sect.addr = BASE + 0x400;
        text_sect.size = 0;
        text_sect.offset = 0x400;

        let mut data_seg = SegmentCommand64::default();
        RawSegment::set_name(&mut data_seg, "__DATA");
        data_seg.vmaddr = BASE + 0x400;
        data_seg.vmsize = 0x200;
        data_seg.fileoff = 0x400;
        data_seg.filesize = 0x200;

        let mut le_seg = SegmentCommand64::default();
        RawSegment::set_name(&mut le_seg, "__LINKEDIT");
        le_seg.vmaddr = BASE + 0x600;
        le_seg.vmsize = 0x400;
        le_seg.fileoff = 0x600;
        le_seg.filesize = 0x400;

        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: 0x600,
            nsyms: 3,
            stroff: 0x700,
            strsize: 0x20,
        };

        let dysymtab = DysymtabCommand {
            cmd: crate::macho::LC_DYSYMTAB,
            cmdsize: DysymtabCommand::SIZE as u32,
            ilocalsym: 0,
            nlocalsym: 1,
            iextdefsym: 1,
            nextdefsym: 1,
            iundefsym: 2,
            nundefsym: 1,
            tocoff: 0,
            ntoc: 0,
            modtaboff: 0,
            nmodtab: 0,
            extrefsymoff: 0,
            nextrefsyms: 0,
            indirectsymoff: 0x680,
            nindirectsyms: 4,
            extreloff: 0,
            nextrel: 0,
            locreloff: 0,
            nlocrel: 0,
        };

        let sizeofcmds = text_seg.cmdsize
            + data_seg.cmdsize
            + le_seg.cmdsize
            + symtab.cmdsize
            + dysymtab.cmdsize;

        let header = MachHeader64 {
            magic: crate::macho::MH_MAGIC_64,
            cputype: crate::macho::CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: crate::macho::MH_DYLIB,
            ncmds: 5,
            sizeofcmds,
            flags: 0,
            reserved: 0,
        };

        let mut off = 0usize;
        for bytes in [
            header.as_bytes(),
            text_seg.as_bytes(),
            text_sect.as_bytes(),
            data_seg.as_bytes(),
            le_seg.as_bytes(),
            symtab.as_bytes(),
            dysymtab.as_bytes(),
        ] {
            data[off..off + bytes.len()].copy_from_slice(bytes);
            off += bytes.len();
        }

        // Symbol entries: local `_dup`, exported `_dup`, undefined `_malloc`.
        let syms = [
            Nlist64 {
                n_strx: 1,
                n_type: 0x0E,
                n_sect: 1,
                n_desc: 0,
                n_value: BASE + 0x410,
            },
            Nlist64 {
                n_strx: 6,
                n_type: 0x0F,
                n_sect: 1,
                n_desc: 0,
                n_value: BASE + 0x418,
            },
            Nlist64 {
                n_strx: 11,
                n_type: 0x01,
                n_sect: 0,
                n_desc: 0,
                n_value: 0,
            },
        ];
        for (i, sym) in syms.iter().enumerate() {
            let off = 0x600 + i * Nlist64::SIZE;
            data[off..off + Nlist64::SIZE].copy_from_slice(sym.as_bytes());
        }

        // Indirect table: redacted, `_malloc`, sentinel, redacted.
        for (i, entry) in [0u32, 2, INDIRECT_SYMBOL_ABS, 0].iter().enumerate() {
            data[0x680 + i * 4..0x680 + i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
        }

        // String table.
        data[0x700..0x713].copy_from_slice(b"\0_dup\0_dup\0_malloc\0");

        data
    }

    #[test]
    fn test_rebuild_with_redacted_and_dedup() {
        let image = symbol_image();
        let cache = build_cache(
            "linkedit-rebuild",
            "arm64e",
            &image,
            BASE,
            "/usr/lib/libtest.dylib",
            &[TestMapping {
                vm_addr: BASE,
                size: image.len() as u64,
                image_off: 0,
                slide_info: Vec::new(),
            }],
        );

        let mut accel = Accelerator::new();
        let view = ImageView::<Pointer64>::build(&cache, BASE).unwrap();
        let mut ctx = ExtractionContext::new(
            &cache,
            view,
            &mut accel,
            "/usr/lib/libtest.dylib".into(),
            BASE,
            false,
            0,
        );

        optimize_linkedit(&mut ctx).unwrap();

        // Redacted detection: two zeroed indirect entries.
        assert!(ctx.has_redacted_indirect);
        assert_eq!(ctx.redacted_indirect_count, 2);

        let (symtab, _) = ctx.image.symtab().unwrap();
        let (dysymtab, _) = ctx.image.dysymtab().unwrap();

        // Placeholder + local + exported + imported.
        assert_eq!(symtab.nsyms, 4);
        assert_eq!(dysymtab.ilocalsym, 1);
        assert_eq!(dysymtab.nlocalsym, 1);
        assert_eq!(dysymtab.iextdefsym, 2);
        assert_eq!(dysymtab.iundefsym, 3);

        let read_name = |strx: u32| -> Vec<u8> {
            let off = ctx
                .image
                .linkedit_offset(symtab.stroff as u64 + strx as u64)
                .unwrap();
            crate::util::cstr_at(&ctx.image.data, off).unwrap().to_vec()
        };
        let read_nlist = |index: u32| -> Nlist64 {
            let off = ctx
                .image
                .linkedit_offset(symtab.symoff as u64 + index as u64 * Nlist64::SIZE as u64)
                .unwrap();
            Nlist64::read_from_bytes(ctx.image.read_at(off, Nlist64::SIZE).unwrap()).unwrap()
        };

        // Symbol zero is the redacted placeholder.
        let placeholder = read_nlist(0);
        assert_eq!(read_name(placeholder.strx()), b"<redacted>");

        // Duplicate names intern to one string-pool copy.
        let local = read_nlist(1);
        let exported = read_nlist(2);
        assert_eq!(read_name(local.strx()), b"_dup");
        assert_eq!(local.strx(), exported.strx());

        // Indirect remap: zeros and sentinels pass through, real indices
        // remap into the new table.
        let indirect_off = ctx
            .image
            .linkedit_offset(dysymtab.indirectsymoff as u64)
            .unwrap();
        let entries: Vec<u32> = (0..4)
            .map(|i| ctx.image.read_u32(indirect_off + i * 4).unwrap())
            .collect();
        assert_eq!(entries[0], 0);
        assert_eq!(entries[1], 3); // old index 2 (_malloc) moved to 3
        assert_eq!(entries[2], INDIRECT_SYMBOL_ABS);
        assert_eq!(entries[3], 0);
        for &entry in &entries {
            if entry != 0 && !is_indirect_sentinel(entry) {
                assert!(entry < symtab.nsyms);
            }
        }

        // Layout invariants: symbols below strings, all inside the segment.
        let seg = ctx.image.segment("__LINKEDIT").unwrap();
        assert_eq!(seg.command.vmsize, seg.command.filesize);
        assert!(symtab.symoff as u64 + (symtab.nsyms as u64) * 16 <= symtab.stroff as u64);
        assert!(
            (symtab.stroff + symtab.strsize) as u64
                <= seg.command.fileoff + seg.command.filesize
        );
    }

    #[test]
    fn test_string_pool_sentinel_and_dedup() {
        let mut pool = StringPool::new();
        assert_eq!(pool.size(), 1);

        let a = pool.add(b"_malloc");
        let b = pool.add(b"_free");
        let c = pool.add(b"_malloc");
        assert_eq!(a, 1);
        assert_eq!(a, c);
        assert_ne!(a, b);

        // Null-terminated input interns the same as bare input.
        assert_eq!(pool.add(b"_free\0"), b);
    }

    #[test]
    fn test_string_pool_write_is_deterministic() {
        let build = || {
            let mut pool = StringPool::new();
            pool.add(b"_c");
            pool.add(b"_a");
            pool.add(b"_b");
            pool.write()
        };
        assert_eq!(build(), build());

        let out = build();
        assert_eq!(out[0], 0);
        assert_eq!(&out[1..4], b"_c\0");
        assert_eq!(&out[4..7], b"_a\0");
        assert_eq!(&out[7..10], b"_b\0");
    }

    #[test]
    fn test_string_pool_empty_string_reuses_sentinel() {
        let mut pool = StringPool::new();
        assert_eq!(pool.add(b""), 0);
        assert_eq!(pool.add(b"\0"), 0);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_remap_sentinels_pass_through() {
        use crate::macho::{INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL};
        let mut map = HashMap::new();
        map.insert(7u32, 3u32);

        assert_eq!(remap_indirect_entry(0, &map), Some(0));
        assert_eq!(
            remap_indirect_entry(INDIRECT_SYMBOL_ABS, &map),
            Some(INDIRECT_SYMBOL_ABS)
        );
        assert_eq!(
            remap_indirect_entry(INDIRECT_SYMBOL_LOCAL, &map),
            Some(INDIRECT_SYMBOL_LOCAL)
        );
        assert_eq!(
            remap_indirect_entry(INDIRECT_SYMBOL_ABS | INDIRECT_SYMBOL_LOCAL, &map),
            Some(INDIRECT_SYMBOL_ABS | INDIRECT_SYMBOL_LOCAL)
        );
        assert_eq!(remap_indirect_entry(7, &map), Some(3));
        assert_eq!(remap_indirect_entry(9, &map), None);
    }
}
