//! Cache view: the dyld shared cache and its files.
//!
//! A split cache (iOS 15+ / macOS 12+) is a set of sibling files: the
//! primary, numbered sub-caches, and a `.symbols` file. Each sibling is a
//! complete cache file with its own header and mapping table, so the model
//! here is one [`CacheFile`] per file and a [`CacheView`] that strings them
//! together. An address resolves by asking each file in turn for a hit in
//! its own table; the file holding the stripped local symbols is found by
//! matching the primary header's `symbol_file_uuid` against the siblings.

use std::fs::File;
use std::mem::offset_of;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use zerocopy::FromBytes;

use super::structs::*;
use crate::error::{Error, Result};
use crate::util;

// =============================================================================
// Image entry
// =============================================================================

/// One dylib recorded in the cache's image table.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Virtual address of the mach header.
    pub address: u64,
    /// Install path, e.g. "/usr/lib/libSystem.B.dylib".
    pub path: String,
}

impl ImageEntry {
    /// Returns the basename of the install path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path or basename contains the filter string.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

// =============================================================================
// Cache file
// =============================================================================

/// A single memory-mapped cache file: the primary or any sibling.
#[derive(Debug)]
pub struct CacheFile {
    mmap: Mmap,
    /// Path the file was mapped from.
    pub path: PathBuf,
    /// The file's own cache header.
    pub header: DyldCacheHeader,
    mappings: Vec<DyldCacheMappingInfo>,
}

impl CacheFile {
    /// Maps one cache file and validates just enough to trust the header:
    /// the file must cover a full header and start with the `dyld` magic.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?;

        if mmap.len() < std::mem::size_of::<DyldCacheHeader>() {
            return Err(Error::parse(0, "cache file is too small for a header"));
        }
        if &mmap[..4] != DYLD_CACHE_MAGIC_PREFIX {
            return Err(Error::InvalidMagic([mmap[0], mmap[1], mmap[2], mmap[3]]));
        }
        let header = DyldCacheHeader::read_from_prefix(&mmap)
            .map_err(|_| Error::parse(0, "failed to read cache header"))?
            .0;

        // The basic mapping table exists in every header revision and is
        // all that address translation needs; the extended
        // mapping-and-slide table is the pointer tracker's concern.
        let table = header.mapping_offset as usize;
        let entry_size = std::mem::size_of::<DyldCacheMappingInfo>();
        let mut mappings = Vec::with_capacity(header.mapping_count as usize);
        for i in 0..header.mapping_count as usize {
            let at = table + i * entry_size;
            let bytes = mmap
                .get(at..at + entry_size)
                .ok_or_else(|| Error::parse(at, "mapping table out of bounds"))?;
            let info = DyldCacheMappingInfo::read_from_bytes(bytes)
                .map_err(|_| Error::parse(at, "failed to read mapping"))?;
            mappings.push(info);
        }

        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            header,
            mappings,
        })
    }

    /// The file's mapped bytes.
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Converts a virtual address to an offset in this file, by linear
    /// search of the file's own mapping table.
    pub fn offset_of_addr(&self, addr: u64) -> Option<u64> {
        for mapping in &self.mappings {
            if addr >= mapping.address && addr < mapping.address + mapping.size {
                return Some(addr - mapping.address + mapping.file_offset);
            }
        }
        None
    }

    /// The sibling files this header names: `(file_suffix, uuid)` pairs
    /// from the sub-cache array.
    ///
    /// Suffix-bearing array entries arrived in the same header revision as
    /// `cache_sub_type`, so field presence picks the entry format; older
    /// arrays imply ".1", ".2", ...
    fn sibling_file_list(&self) -> Result<Vec<(String, [u8; 16])>> {
        if !self.header.has_subcaches() {
            return Ok(Vec::new());
        }

        let has_suffix_entries = self
            .header
            .contains_field(offset_of!(DyldCacheHeader, cache_sub_type));
        let entry_size = if has_suffix_entries {
            std::mem::size_of::<DyldSubcacheEntry2>()
        } else {
            std::mem::size_of::<DyldSubcacheEntry>()
        };

        let table = self.header.sub_cache_array_offset as usize;
        let mut siblings = Vec::with_capacity(self.header.sub_cache_array_count as usize);
        for i in 0..self.header.sub_cache_array_count as usize {
            let at = table + i * entry_size;
            let bytes = self
                .mmap
                .get(at..at + entry_size)
                .ok_or_else(|| Error::parse(at, "sub-cache array out of bounds"))?;
            if has_suffix_entries {
                let entry = DyldSubcacheEntry2::read_from_bytes(bytes)
                    .map_err(|_| Error::parse(at, "failed to read sub-cache entry"))?;
                siblings.push((entry.suffix_str().to_string(), entry.uuid));
            } else {
                let entry = DyldSubcacheEntry::read_from_bytes(bytes)
                    .map_err(|_| Error::parse(at, "failed to read sub-cache entry"))?;
                siblings.push((format!(".{}", i + 1), entry.uuid));
            }
        }
        Ok(siblings)
    }
}

// =============================================================================
// Cache view
// =============================================================================

/// Read-only view over all files of one dyld shared cache.
#[derive(Debug)]
pub struct CacheView {
    /// The primary cache file.
    pub primary: CacheFile,
    /// Sibling files, the `.symbols` file included when present.
    pub subcaches: Vec<CacheFile>,
    /// The image table, parsed from the primary.
    pub images: Vec<ImageEntry>,
}

impl CacheView {
    /// Opens the primary cache file at `path` plus every sibling its header
    /// names, verifying each sibling's UUID against the array entry.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let primary = CacheFile::open(path)?;

        let mut expected = primary.sibling_file_list()?;
        if primary.header.has_symbols_file() {
            expected.push((".symbols".to_string(), primary.header.symbol_file_uuid));
        }

        let mut subcaches = Vec::with_capacity(expected.len());
        for (suffix, uuid) in expected {
            let sub_path = sibling_path(path, &suffix);
            if suffix == ".symbols" && !sub_path.exists() {
                // The symbols file is the one optional sibling; going
                // without it only loses redacted local symbols.
                continue;
            }
            let sub = CacheFile::open(&sub_path).map_err(|e| match e {
                Error::FileOpen { path, .. } => Error::SubcacheNotFound { path },
                other => other,
            })?;
            if sub.header.uuid != uuid {
                return Err(Error::SubcacheUuidMismatch {
                    path: sub_path,
                    expected: uuid_to_string(&uuid),
                    actual: uuid_to_string(&sub.header.uuid),
                });
            }
            subcaches.push(sub);
        }

        let images = read_image_table(&primary)?;

        Ok(Self {
            primary,
            subcaches,
            images,
        })
    }

    /// All files, the primary first. Positions match the file index
    /// [`Self::convert_addr`] reports.
    pub fn files(&self) -> impl Iterator<Item = &CacheFile> {
        std::iter::once(&self.primary).chain(self.subcaches.iter())
    }

    /// The mapped bytes of the file at `index` (0 = primary).
    pub fn file_data(&self, index: usize) -> &[u8] {
        match index {
            0 => self.primary.data(),
            i => self
                .subcaches
                .get(i - 1)
                .map(|file| file.data())
                .unwrap_or(&[]),
        }
    }

    /// Converts a virtual address into `(file_index, file_offset)` by
    /// asking each file in turn.
    pub fn convert_addr(&self, addr: u64) -> Option<(usize, u64)> {
        for (index, file) in self.files().enumerate() {
            if let Some(offset) = file.offset_of_addr(addr) {
                return Some((index, offset));
            }
        }
        None
    }

    /// Returns true if any file maps the address.
    pub fn contains_addr(&self, addr: u64) -> bool {
        self.convert_addr(addr).is_some()
    }

    /// Returns `len` bytes at a virtual address.
    pub fn data_at_addr(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let (index, offset) = self
            .convert_addr(addr)
            .ok_or(Error::AddressNotFound { addr })?;
        let data = self.file_data(index);
        let offset = offset as usize;
        if offset + len > data.len() {
            return Err(Error::buffer_too_small(offset + len, data.len()));
        }
        Ok(&data[offset..offset + len])
    }

    /// The architecture string from the primary header.
    pub fn architecture(&self) -> &str {
        self.primary.header.architecture()
    }

    /// The shared region start address, zero on headers too old to carry it.
    pub fn shared_region_start(&self) -> u64 {
        if self
            .primary
            .header
            .contains_field(offset_of!(DyldCacheHeader, shared_region_start))
        {
            self.primary.header.shared_region_start
        } else {
            0
        }
    }

    /// The file holding stripped local symbols: the primary itself for a
    /// single-file cache, otherwise the sibling whose UUID matches the
    /// primary's `symbol_file_uuid`. Callers still have to check the
    /// returned file's `local_symbols_offset`.
    pub fn symbols_cache(&self) -> Option<&CacheFile> {
        if self.subcaches.is_empty() {
            return Some(&self.primary);
        }
        let uuid = self.primary.header.symbol_file_uuid;
        self.subcaches.iter().find(|file| file.header.uuid == uuid)
    }

    /// Returns true if local-symbol entries use the 64-bit vm-offset format.
    pub fn uses_64bit_local_symbol_entries(&self) -> bool {
        self.primary.header.has_symbols_file()
    }

    /// Returns an iterator over all images.
    pub fn images(&self) -> impl Iterator<Item = &ImageEntry> {
        self.images.iter()
    }

    /// Finds an image by path or basename substring.
    pub fn find_image(&self, name: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|img| img.matches_filter(name))
    }

    /// Finds the image entry for an exact install path.
    pub fn image_by_path(&self, path: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|img| img.path == path)
    }
}

/// Builds a sibling file path: the primary's file name plus a suffix.
fn sibling_path(main: &Path, suffix: &str) -> PathBuf {
    let name = main.file_name().and_then(|n| n.to_str()).unwrap_or("");
    main.with_file_name(format!("{name}{suffix}"))
}

/// Parses the image table out of the primary file.
///
/// Newer caches moved the table past the Rosetta fields; field presence in
/// the header selects the location.
fn read_image_table(primary: &CacheFile) -> Result<Vec<ImageEntry>> {
    let header = &primary.header;
    let data = primary.data();

    let uses_newer_table = header.contains_field(offset_of!(DyldCacheHeader, images_offset))
        && header.images_offset != 0;
    let (table, count) = if uses_newer_table {
        (header.images_offset as usize, header.images_count as usize)
    } else {
        (
            header.images_offset_old as usize,
            header.images_count_old as usize,
        )
    };

    let entry_size = std::mem::size_of::<DyldCacheImageInfo>();
    let mut images = Vec::with_capacity(count);
    for i in 0..count {
        let at = table + i * entry_size;
        let bytes = data
            .get(at..at + entry_size)
            .ok_or_else(|| Error::parse(at, "image table out of bounds"))?;
        let info = DyldCacheImageInfo::read_from_bytes(bytes)
            .map_err(|_| Error::parse(at, "failed to read image info"))?;
        let path = util::cstr_at(data, info.path_file_offset as usize)
            .ok_or_else(|| Error::parse(info.path_file_offset as usize, "bad image path"))?;
        images.push(ImageEntry {
            address: info.address,
            path: String::from_utf8_lossy(path).into_owned(),
        });
    }
    Ok(images)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builds single-file synthetic caches on disk for tests across the
    //! crate: one image, both mapping tables, optional slide info.

    use super::*;
    use std::io::Write as _;
    use zerocopy::{FromZeros, IntoBytes};

    /// One mapping of the synthetic cache, covering `[vm_addr, vm_addr+size)`
    /// with bytes taken from `image[image_off..]`.
    pub struct TestMapping {
        /// Mapped virtual address.
        pub vm_addr: u64,
        /// Mapped size.
        pub size: u64,
        /// Offset of the mapped bytes within the image buffer.
        pub image_off: u64,
        /// Raw slide-info bytes, empty for none.
        pub slide_info: Vec<u8>,
    }

    /// Writes a one-image cache file and opens it.
    ///
    /// Layout: header, basic mappings, extended mappings, image info, path
    /// string, the image bytes at 0x1000, then any slide-info blobs.
    pub fn build_cache(
        tag: &str,
        arch: &str,
        image: &[u8],
        image_base: u64,
        image_path: &str,
        mappings: &[TestMapping],
    ) -> CacheView {
        const IMAGE_FILE_OFF: u64 = 0x1000;

        let header_size = std::mem::size_of::<DyldCacheHeader>();
        let basic_size = std::mem::size_of::<DyldCacheMappingInfo>();
        let extended_size = std::mem::size_of::<DyldCacheMappingAndSlideInfo>();
        let basic_off = header_size;
        let extended_off = basic_off + mappings.len() * basic_size;
        let images_off = extended_off + mappings.len() * extended_size;
        let path_off = images_off + std::mem::size_of::<DyldCacheImageInfo>();

        let mut header = DyldCacheHeader::new_zeroed();
        let magic = format!("dyld_v1  {arch}");
        header.magic[..magic.len().min(16)]
            .copy_from_slice(&magic.as_bytes()[..magic.len().min(16)]);
        header.mapping_offset = basic_off as u32;
        header.mapping_count = mappings.len() as u32;
        header.mapping_with_slide_offset = extended_off as u32;
        header.mapping_with_slide_count = mappings.len() as u32;
        header.images_offset_old = images_off as u32;
        header.images_count_old = 1;
        header.shared_region_start = image_base;

        let image_info = DyldCacheImageInfo {
            address: image_base,
            mod_time: 0,
            inode: 0,
            path_file_offset: path_off as u32,
            pad: 0,
        };

        let mut file = vec![0u8; IMAGE_FILE_OFF as usize + image.len()];
        let mut slide_cursor = file.len();
        let mut basic_entries = Vec::with_capacity(mappings.len());
        let mut extended_entries = Vec::with_capacity(mappings.len());
        for m in mappings {
            let (slide_off, slide_size) = if m.slide_info.is_empty() {
                (0u64, 0u64)
            } else {
                let off = slide_cursor;
                file.extend_from_slice(&m.slide_info);
                slide_cursor = file.len();
                (off as u64, m.slide_info.len() as u64)
            };
            basic_entries.push(DyldCacheMappingInfo {
                address: m.vm_addr,
                size: m.size,
                file_offset: IMAGE_FILE_OFF + m.image_off,
                max_prot: 3,
                init_prot: 3,
            });
            extended_entries.push(DyldCacheMappingAndSlideInfo {
                address: m.vm_addr,
                size: m.size,
                file_offset: IMAGE_FILE_OFF + m.image_off,
                slide_info_file_offset: slide_off,
                slide_info_file_size: slide_size,
                flags: 0,
                max_prot: 3,
                init_prot: 3,
            });
        }

        file[..header_size].copy_from_slice(header.as_bytes());
        for (i, entry) in basic_entries.iter().enumerate() {
            let at = basic_off + i * basic_size;
            file[at..at + basic_size].copy_from_slice(entry.as_bytes());
        }
        for (i, entry) in extended_entries.iter().enumerate() {
            let at = extended_off + i * extended_size;
            file[at..at + extended_size].copy_from_slice(entry.as_bytes());
        }
        file[images_off..images_off + std::mem::size_of::<DyldCacheImageInfo>()]
            .copy_from_slice(image_info.as_bytes());
        file[path_off..path_off + image_path.len()].copy_from_slice(image_path.as_bytes());
        file[IMAGE_FILE_OFF as usize..IMAGE_FILE_OFF as usize + image.len()]
            .copy_from_slice(image);

        let path = std::env::temp_dir().join(format!(
            "dscex-test-{}-{}",
            std::process::id(),
            tag
        ));
        let mut out = std::fs::File::create(&path).expect("create test cache");
        out.write_all(&file).expect("write test cache");
        out.flush().expect("flush test cache");

        CacheView::open(&path).expect("open test cache")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_image_entry_filter() {
        let img = ImageEntry {
            address: 0x1_8000_0000,
            path: "/usr/lib/libSystem.B.dylib".into(),
        };
        assert_eq!(img.basename(), "libSystem.B.dylib");
        assert!(img.matches_filter("libSystem"));
        assert!(img.matches_filter("/usr/lib"));
        assert!(!img.matches_filter("UIKit"));
    }

    #[test]
    fn test_sibling_path() {
        let main = Path::new("/tmp/dyld_shared_cache_arm64e");
        assert_eq!(
            sibling_path(main, ".01"),
            Path::new("/tmp/dyld_shared_cache_arm64e.01")
        );
        assert_eq!(
            sibling_path(main, ".symbols"),
            Path::new("/tmp/dyld_shared_cache_arm64e.symbols")
        );
    }

    #[test]
    fn test_open_synthetic_cache() {
        let image = crate::macho::test_support::minimal_dylib();
        let base = 0x1_8000_0000u64;
        let cache = build_cache(
            "cache-open",
            "arm64e",
            &image,
            base,
            "/usr/lib/libtest.dylib",
            &[TestMapping {
                vm_addr: base,
                size: image.len() as u64,
                image_off: 0,
                slide_info: Vec::new(),
            }],
        );

        assert_eq!(cache.architecture(), "arm64e");
        assert_eq!(cache.images.len(), 1);
        assert_eq!(cache.images[0].path, "/usr/lib/libtest.dylib");
        assert_eq!(cache.images[0].address, base);
        assert!(cache.subcaches.is_empty());

        // Address translation reaches the image bytes.
        let (file_index, off) = cache.convert_addr(base).unwrap();
        assert_eq!(file_index, 0);
        assert_eq!(off, 0x1000);
        let bytes = cache.data_at_addr(base, 4).unwrap();
        assert_eq!(crate::util::read_u32_le(bytes), crate::macho::MH_MAGIC_64);

        assert!(cache.convert_addr(base - 1).is_none());
        assert!(!cache.contains_addr(base + image.len() as u64));
        assert!(cache.find_image("libtest").is_some());

        // Single-file caches answer local-symbol lookups from the primary.
        let symbols = cache.symbols_cache().unwrap();
        assert_eq!(symbols.header.local_symbols_offset, 0);
        assert_eq!(cache.shared_region_start(), base);
    }
}
