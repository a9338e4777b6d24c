//! Address symbolication from nlists and dependency exports.
//!
//! The stub fixer needs to name arbitrary cache addresses: a chased stub
//! chain ends at a function in some dependency, and the only ways to name it
//! are the image's own symbol table and the export tries of the image's
//! dependency graph (re-exports included). Dependency exports are parsed
//! once per dylib and cached in the [`Accelerator`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use zerocopy::FromBytes;

use crate::arch::Pointer;
use crate::dyld::{
    CacheView, ExportTrieParser, EXPORT_SYMBOL_FLAGS_REEXPORT,
};
use crate::error::Result;
use crate::macho::{
    DyldInfoCommand, DylibCommand, ImageView, LinkeditDataCommand, LoadCommand, RawMachHeader,
    RawNlist, RawSegment, LC_DYLD_EXPORTS_TRIE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_ID_DYLIB,
    LC_LAZY_LOAD_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB,
};
use crate::provider::{Accelerator, ActivityLogger, CachedExport, ExportsByName};
use crate::util;

// =============================================================================
// Symbolic sets
// =============================================================================

/// One candidate name for an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicName {
    /// Symbol name.
    pub name: String,
    /// Export flags, `None` for names from the image's own symbol table.
    pub flags: Option<u64>,
    /// Ordinal of the dependency that exported the name, `None` for nlists.
    pub ordinal: Option<u32>,
}

impl SymbolicName {
    /// True for names carried by a re-export entry.
    pub fn is_reexport(&self) -> bool {
        matches!(self.flags, Some(f) if f & EXPORT_SYMBOL_FLAGS_REEXPORT != 0)
    }

    /// Preference group: own-symtab names rank below export names, and
    /// re-exports below direct exports.
    fn group(&self) -> u8 {
        match (self.ordinal, self.flags) {
            (None, _) => 0,
            (Some(_), None) => 1,
            (Some(_), Some(_)) if self.is_reexport() => 2,
            (Some(_), Some(_)) => 3,
        }
    }
}

/// All names known for one address.
#[derive(Debug, Clone, Default)]
pub struct SymbolicSet {
    names: Vec<SymbolicName>,
}

impl SymbolicSet {
    /// Adds a name, ignoring exact duplicates.
    pub fn add(&mut self, name: SymbolicName) {
        if !self.names.contains(&name) {
            self.names.push(name);
        }
    }

    /// All names.
    pub fn names(&self) -> &[SymbolicName] {
        &self.names
    }

    /// The preferred name: highest group, plainest flags, lowest ordinal.
    pub fn preferred(&self) -> Option<&SymbolicName> {
        self.names.iter().max_by(|a, b| {
            (a.group(), std::cmp::Reverse(a.flags.unwrap_or(u64::MAX)), std::cmp::Reverse(a.ordinal.unwrap_or(u32::MAX)), &a.name)
                .cmp(&(
                    b.group(),
                    std::cmp::Reverse(b.flags.unwrap_or(u64::MAX)),
                    std::cmp::Reverse(b.ordinal.unwrap_or(u32::MAX)),
                    &b.name,
                ))
        })
    }
}

// =============================================================================
// Dependency export reading
// =============================================================================

/// A dependency image parsed just deep enough to read its exports.
struct DepImage {
    addr: u64,
    export_blob: Option<(u64, u32)>,
    deps: Vec<(String, u32)>,
}

/// Parses the header and load commands of an image straight out of the
/// cache, without building an [`ImageView`].
fn parse_dep_image<P: Pointer>(cache: &CacheView, addr: u64) -> Result<DepImage> {
    let header_bytes = cache.data_at_addr(addr, P::RawHeader::SIZE)?;
    let header = P::RawHeader::read_from_prefix(header_bytes)
        .map_err(|_| crate::error::Error::InvalidMachoMagic(0))?
        .0;

    let cmds_len = P::RawHeader::SIZE + header.sizeofcmds() as usize;
    let bytes = cache.data_at_addr(addr, cmds_len)?;

    let mut linkedit: Option<(u64, u64)> = None; // (vmaddr, fileoff)
    let mut dyld_info: Option<DyldInfoCommand> = None;
    let mut export_trie: Option<LinkeditDataCommand> = None;
    let mut deps = Vec::new();

    let mut offset = P::RawHeader::SIZE;
    for _ in 0..header.ncmds() {
        if offset + LoadCommand::SIZE > bytes.len() {
            break;
        }
        let cmd = util::read_u32_le(&bytes[offset..]);
        let cmdsize = util::read_u32_le(&bytes[offset + 4..]) as usize;
        if cmdsize < LoadCommand::SIZE || offset + cmdsize > bytes.len() {
            break;
        }
        match cmd {
            c if c == P::RawSegment::CMD => {
                if let Ok((seg, _)) = P::RawSegment::read_from_prefix(&bytes[offset..]) {
                    if seg.name() == "__LINKEDIT" {
                        linkedit = Some((seg.vmaddr(), seg.fileoff()));
                    }
                }
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                if let Ok((info, _)) = DyldInfoCommand::read_from_prefix(&bytes[offset..]) {
                    dyld_info = Some(info);
                }
            }
            LC_DYLD_EXPORTS_TRIE => {
                if let Ok((lc, _)) = LinkeditDataCommand::read_from_prefix(&bytes[offset..]) {
                    export_trie = Some(lc);
                }
            }
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB | LC_ID_DYLIB => {
                if let Ok((dylib, _)) = DylibCommand::read_from_prefix(&bytes[offset..]) {
                    if dylib.cmd != LC_ID_DYLIB {
                        let name = util::cstr_at(
                            &bytes[offset..offset + cmdsize],
                            dylib.dylib.name_offset as usize,
                        )
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default();
                        deps.push((name, cmd));
                    }
                }
            }
            _ => {}
        }
        offset += cmdsize;
    }

    // Locate the export blob through the linkedit segment's vm mapping.
    let export_blob = linkedit.and_then(|(le_vmaddr, le_fileoff)| {
        let (off, size) = if let Some(trie) = export_trie {
            (trie.dataoff as u64, trie.datasize)
        } else if let Some(info) = dyld_info {
            (info.export_off as u64, info.export_size)
        } else {
            return None;
        };
        if size == 0 || off < le_fileoff {
            return None;
        }
        Some((le_vmaddr + (off - le_fileoff), size))
    });

    Ok(DepImage {
        addr,
        export_blob,
        deps,
    })
}

/// Reads and flattens one dylib's exports, following re-exports recursively.
/// Results are cached in the accelerator by install path.
fn exports_for_dylib<P: Pointer>(
    cache: &CacheView,
    accelerator: &mut Accelerator,
    path: &str,
    visiting: &mut HashSet<String>,
    activity: &ActivityLogger,
) -> Arc<ExportsByName> {
    if let Some(cached) = accelerator.exports.get(path) {
        return Arc::clone(cached);
    }
    if !visiting.insert(path.to_string()) {
        // Dependency cycle; return an empty set rather than recursing.
        return Arc::new(ExportsByName::new());
    }

    let result = exports_for_dylib_uncached::<P>(cache, accelerator, path, visiting, activity);
    visiting.remove(path);

    let arc = Arc::new(result);
    accelerator
        .exports
        .insert(path.to_string(), Arc::clone(&arc));
    arc
}

fn exports_for_dylib_uncached<P: Pointer>(
    cache: &CacheView,
    accelerator: &mut Accelerator,
    path: &str,
    visiting: &mut HashSet<String>,
    activity: &ActivityLogger,
) -> ExportsByName {
    let mut out = ExportsByName::new();

    let Some(image) = cache.image_by_path(path) else {
        activity.warn(format!("unable to find image with path {path}"));
        return out;
    };

    let dep = match parse_dep_image::<P>(cache, image.address) {
        Ok(dep) => dep,
        Err(e) => {
            activity.warn(format!("unable to parse dependency {path}: {e}"));
            return out;
        }
    };

    let raw_exports = match dep.export_blob {
        Some((blob_addr, blob_size)) => match cache.data_at_addr(blob_addr, blob_size as usize) {
            Ok(bytes) => match ExportTrieParser::new(bytes).parse_all() {
                Ok(exports) => exports,
                Err(e) => {
                    activity.warn(format!("unable to read exports for {path}: {e}"));
                    Vec::new()
                }
            },
            Err(e) => {
                activity.warn(format!("unable to map export blob for {path}: {e}"));
                Vec::new()
            }
        },
        // Some images have no exports at all.
        None => Vec::new(),
    };

    let mut reexports: HashMap<u32, Vec<crate::dyld::ExportInfo>> = HashMap::new();
    for export in raw_exports {
        if export.is_reexport() {
            if let Some(ordinal) = export.reexport_ordinal {
                reexports.entry(ordinal).or_default().push(export);
            }
            continue;
        }
        if export.address == 0 {
            // Entries like __objc_empty_vtable carry no address.
            continue;
        }
        let resolver = export
            .resolver_address
            .map(|r| dep.addr.wrapping_add(r));
        out.insert(
            export.name.clone(),
            CachedExport {
                name: export.name,
                address: dep.addr + export.address,
                flags: export.flags,
                resolver,
            },
        );
    }

    // Resolve re-exported names through the ordinal's own export set.
    for (ordinal, entries) in reexports {
        let Some((dep_path, _)) = dep.deps.get(ordinal as usize - 1) else {
            activity.warn(format!(
                "re-export ordinal {ordinal} out of range in {path}"
            ));
            continue;
        };
        let parent = exports_for_dylib::<P>(cache, accelerator, dep_path, visiting, activity);
        if parent.is_empty() {
            continue;
        }
        for entry in entries {
            let import_name = entry
                .reexport_name
                .as_deref()
                .unwrap_or(entry.name.as_str());
            if let Some(found) = parent.get(import_name) {
                out.insert(
                    entry.name.clone(),
                    CachedExport {
                        name: entry.name,
                        address: found.address,
                        flags: entry.flags,
                        resolver: None,
                    },
                );
            } else {
                activity.warn(format!(
                    "unable to find parent export {import_name} for re-export {}",
                    entry.name
                ));
            }
        }
    }

    // Whole-library re-exports surface every symbol of the dependency.
    for (dep_path, cmd) in &dep.deps {
        if *cmd == LC_REEXPORT_DYLIB {
            let sub = exports_for_dylib::<P>(cache, accelerator, dep_path, visiting, activity);
            for (name, export) in sub.iter() {
                out.entry(name.clone()).or_insert_with(|| export.clone());
            }
        }
    }

    out
}

// =============================================================================
// Symbolizer
// =============================================================================

/// Address to symbolic-set map for one image.
#[derive(Debug, Default)]
pub struct Symbolizer {
    symbols: HashMap<u64, SymbolicSet>,
}

impl Symbolizer {
    /// Builds the symbolizer from the image's own symbol table plus its
    /// dependency exports.
    pub fn build<P: Pointer>(
        cache: &CacheView,
        image: &ImageView<P>,
        accelerator: &mut Accelerator,
        activity: &ActivityLogger,
    ) -> Self {
        let mut symbolizer = Self::default();
        symbolizer.enumerate_own_symbols(image, activity);
        symbolizer.enumerate_exports::<P>(cache, image, accelerator, activity);
        symbolizer
    }

    /// Returns the symbolic set for an address.
    pub fn symbolize(&self, addr: u64) -> Option<&SymbolicSet> {
        self.symbols.get(&addr)
    }

    /// Registers one name for an address.
    pub fn add(&mut self, addr: u64, name: SymbolicName) {
        self.symbols.entry(addr).or_default().add(name);
    }

    fn enumerate_own_symbols<P: Pointer>(
        &mut self,
        image: &ImageView<P>,
        activity: &ActivityLogger,
    ) {
        let Some((symtab, _)) = image.symtab() else {
            return;
        };
        for index in 0..symtab.nsyms {
            let Some(nlist_off) = image.linkedit_offset(
                symtab.symoff as u64 + index as u64 * P::RawNlist::SIZE as u64,
            ) else {
                continue;
            };
            let Ok(bytes) = image.read_at(nlist_off, P::RawNlist::SIZE) else {
                continue;
            };
            let Ok(nlist) = P::RawNlist::read_from_bytes(bytes) else {
                continue;
            };
            if nlist.value() == 0 {
                continue;
            }

            let name = image
                .linkedit_offset(symtab.stroff as u64 + nlist.strx() as u64)
                .and_then(|off| util::cstr_at(&image.data, off))
                .map(|b| String::from_utf8_lossy(b).into_owned());
            let Some(name) = name else {
                continue;
            };

            if !image.contains_addr(nlist.value()) {
                activity.debug(&format!(
                    "symbol {} has address {:#x} outside the image",
                    name,
                    nlist.value()
                ));
            }

            self.add(
                nlist.value(),
                SymbolicName {
                    name,
                    flags: None,
                    ordinal: None,
                },
            );
        }
    }

    fn enumerate_exports<P: Pointer>(
        &mut self,
        cache: &CacheView,
        image: &ImageView<P>,
        accelerator: &mut Accelerator,
        activity: &ActivityLogger,
    ) {
        let mut visiting = HashSet::new();
        for (ordinal0, (path, _cmd)) in image.dependencies().iter().enumerate() {
            let exports =
                exports_for_dylib::<P>(cache, accelerator, path, &mut visiting, activity);
            let ordinal = ordinal0 as u32 + 1;
            for export in exports.values() {
                self.add(
                    export.address,
                    SymbolicName {
                        name: export.name.clone(),
                        flags: Some(export.flags),
                        ordinal: Some(ordinal),
                    },
                );
                if let Some(resolver) = export.resolver {
                    self.add(
                        resolver,
                        SymbolicName {
                            name: export.name.clone(),
                            flags: Some(export.flags),
                            ordinal: Some(ordinal),
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nm(name: &str, flags: Option<u64>, ordinal: Option<u32>) -> SymbolicName {
        SymbolicName {
            name: name.into(),
            flags,
            ordinal,
        }
    }

    #[test]
    fn test_preferred_prefers_exports_over_nlists() {
        let mut set = SymbolicSet::default();
        set.add(nm("_local_alias", None, None));
        set.add(nm("_exported", Some(0), Some(1)));
        assert_eq!(set.preferred().unwrap().name, "_exported");
    }

    #[test]
    fn test_preferred_prefers_plain_flags_and_low_ordinal() {
        let mut set = SymbolicSet::default();
        set.add(nm("_weak", Some(4), Some(1)));
        set.add(nm("_plain", Some(0), Some(1)));
        assert_eq!(set.preferred().unwrap().name, "_plain");

        let mut set = SymbolicSet::default();
        set.add(nm("_later", Some(0), Some(3)));
        set.add(nm("_earlier", Some(0), Some(1)));
        assert_eq!(set.preferred().unwrap().name, "_earlier");
    }

    #[test]
    fn test_preferred_ranks_reexports_below_direct() {
        let mut set = SymbolicSet::default();
        set.add(nm("_reexported", Some(EXPORT_SYMBOL_FLAGS_REEXPORT), Some(1)));
        set.add(nm("_direct", Some(0), Some(2)));
        assert_eq!(set.preferred().unwrap().name, "_direct");
    }

    #[test]
    fn test_dedup() {
        let mut set = SymbolicSet::default();
        set.add(nm("_a", None, None));
        set.add(nm("_a", None, None));
        assert_eq!(set.names().len(), 1);
    }
}
