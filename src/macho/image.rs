//! Writable per-image view of a Mach-O inside the cache.
//!
//! An [`ImageView`] copies one image's segments out of the read-only cache
//! into an owned buffer, so the pipeline's mutations can never leak into
//! other images' runs. Segment bytes are placed densely; every segment
//! command's `fileoff` (and its sections' `offset`s) is rewritten to the
//! buffer position at construction, so from the pipeline's point of view the
//! buffer is already a coherent file image. The original cache file offsets
//! are kept per segment so pre-rebuild linkedit offsets can still be
//! resolved.

use std::collections::HashMap;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::arch::Pointer;
use crate::dyld::CacheView;
use crate::error::{Error, Result};
use crate::util;

use super::constants::*;
use super::structs::*;

// =============================================================================
// Parsed command info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo<P: Pointer> {
    /// The segment command.
    pub command: P::RawSegment,
    /// Buffer offset of the segment command.
    pub command_offset: usize,
    /// Sections in this segment.
    pub sections: Vec<SectionInfo<P>>,
}

impl<P: Pointer> SegmentInfo<P> {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo<P>> {
        self.sections.iter().find(|s| s.section.name() == name)
    }
}

/// Parsed section information.
#[derive(Debug, Clone)]
pub struct SectionInfo<P: Pointer> {
    /// The section structure.
    pub section: P::RawSection,
    /// Buffer offset of the section structure.
    pub struct_offset: usize,
}

/// Parsed load command information.
#[derive(Debug, Clone)]
pub enum LoadCommandInfo<P: Pointer> {
    /// A segment command with its sections.
    Segment(SegmentInfo<P>),
    /// LC_SYMTAB
    Symtab {
        /// Parsed command.
        command: SymtabCommand,
        /// Buffer offset of the command.
        offset: usize,
    },
    /// LC_DYSYMTAB
    Dysymtab {
        /// Parsed command.
        command: DysymtabCommand,
        /// Buffer offset of the command.
        offset: usize,
    },
    /// LC_DYLD_INFO / LC_DYLD_INFO_ONLY
    DyldInfo {
        /// Parsed command.
        command: DyldInfoCommand,
        /// Buffer offset of the command.
        offset: usize,
    },
    /// linkedit_data_command family
    LinkeditData {
        /// Parsed command.
        command: LinkeditDataCommand,
        /// Buffer offset of the command.
        offset: usize,
    },
    /// Dylib reference commands
    Dylib {
        /// Parsed command.
        command: DylibCommand,
        /// Referenced install path.
        name: String,
        /// Buffer offset of the command.
        offset: usize,
    },
    /// Anything the pipeline does not interpret.
    Other {
        /// Load command value.
        cmd: u32,
        /// Command size.
        cmdsize: u32,
        /// Buffer offset of the command.
        offset: usize,
    },
}

impl<P: Pointer> LoadCommandInfo<P> {
    /// Returns the buffer offset of the command.
    pub fn offset(&self) -> usize {
        match self {
            LoadCommandInfo::Segment(s) => s.command_offset,
            LoadCommandInfo::Symtab { offset, .. } => *offset,
            LoadCommandInfo::Dysymtab { offset, .. } => *offset,
            LoadCommandInfo::DyldInfo { offset, .. } => *offset,
            LoadCommandInfo::LinkeditData { offset, .. } => *offset,
            LoadCommandInfo::Dylib { offset, .. } => *offset,
            LoadCommandInfo::Other { offset, .. } => *offset,
        }
    }

    /// Returns the load command value.
    pub fn cmd(&self) -> u32 {
        match self {
            LoadCommandInfo::Segment(_) => P::RawSegment::CMD,
            LoadCommandInfo::Symtab { command, .. } => command.cmd,
            LoadCommandInfo::Dysymtab { command, .. } => command.cmd,
            LoadCommandInfo::DyldInfo { command, .. } => command.cmd,
            LoadCommandInfo::LinkeditData { command, .. } => command.cmd,
            LoadCommandInfo::Dylib { command, .. } => command.cmd,
            LoadCommandInfo::Other { cmd, .. } => *cmd,
        }
    }
}

/// Where one segment's bytes live in the view's buffer.
#[derive(Debug, Clone)]
pub struct SegmentSpan {
    /// Segment name.
    pub name: String,
    /// Virtual memory address.
    pub vmaddr: u64,
    /// Virtual memory size.
    pub vmsize: u64,
    /// Bytes materialized in the buffer.
    pub filesize: u64,
    /// The segment's file offset in the original cache file.
    pub orig_fileoff: u64,
    /// Offset of the segment's bytes in the buffer.
    pub buffer_off: usize,
}

// =============================================================================
// ImageView
// =============================================================================

/// A writable overlay of one Mach-O image.
#[derive(Debug)]
pub struct ImageView<P: Pointer> {
    /// The mach header (kept in sync with the buffer via [`Self::sync_header`]).
    pub header: P::RawHeader,
    /// The image bytes. Offset 0 is the mach header.
    pub data: Vec<u8>,
    /// Parsed load commands.
    pub load_commands: Vec<LoadCommandInfo<P>>,
    spans: Vec<SegmentSpan>,
    segment_indices: HashMap<String, usize>,
}

impl<P: Pointer> ImageView<P> {
    /// Builds a view for the image whose mach header is at `image_addr`,
    /// copying its segment bytes out of the cache.
    pub fn build(cache: &CacheView, image_addr: u64) -> Result<Self> {
        let header_bytes = cache.data_at_addr(image_addr, P::RawHeader::SIZE)?;
        let header = P::RawHeader::read_from_bytes(header_bytes)
            .map_err(|_| Error::InvalidMachoMagic(0))?;
        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic()));
        }

        let cmds_size = P::RawHeader::SIZE + header.sizeofcmds() as usize;
        let cmds_bytes = cache.data_at_addr(image_addr, cmds_size)?;

        // First pass over the raw commands: learn the segment layout.
        struct RawSeg {
            vmaddr: u64,
            vmsize: u64,
            fileoff: u64,
            filesize: u64,
            name: String,
        }
        let mut raw_segs: Vec<RawSeg> = Vec::with_capacity(8);
        let mut offset = P::RawHeader::SIZE;
        for _ in 0..header.ncmds() {
            if offset + LoadCommand::SIZE > cmds_bytes.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }
            let cmd = util::read_u32_le(&cmds_bytes[offset..]);
            let cmdsize = util::read_u32_le(&cmds_bytes[offset + 4..]) as usize;
            if cmdsize < LoadCommand::SIZE || offset + cmdsize > cmds_bytes.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }
            if cmd == P::RawSegment::CMD {
                let seg = P::RawSegment::read_from_prefix(&cmds_bytes[offset..])
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;
                raw_segs.push(RawSeg {
                    vmaddr: seg.vmaddr(),
                    vmsize: seg.vmsize(),
                    fileoff: seg.fileoff(),
                    filesize: seg.filesize(),
                    name: seg.name().to_string(),
                });
            }
            offset += cmdsize;
        }

        if raw_segs.is_empty() || raw_segs[0].vmaddr != image_addr {
            return Err(Error::parse(
                0,
                "image's first segment does not contain the mach header",
            ));
        }

        // Second pass: lay segments out densely and copy their bytes.
        let mut spans: Vec<SegmentSpan> = Vec::with_capacity(raw_segs.len());
        let mut cursor = 0usize;
        for seg in &raw_segs {
            if seg.filesize == 0 {
                spans.push(SegmentSpan {
                    name: seg.name.clone(),
                    vmaddr: seg.vmaddr,
                    vmsize: seg.vmsize,
                    filesize: 0,
                    orig_fileoff: seg.fileoff,
                    buffer_off: cursor,
                });
                continue;
            }
            cursor = util::align_up(cursor as u64, 8) as usize;
            spans.push(SegmentSpan {
                name: seg.name.clone(),
                vmaddr: seg.vmaddr,
                vmsize: seg.vmsize,
                filesize: seg.filesize,
                orig_fileoff: seg.fileoff,
                buffer_off: cursor,
            });
            cursor += seg.filesize as usize;
        }

        let mut data = vec![0u8; cursor];
        for span in &spans {
            if span.filesize == 0 {
                continue;
            }
            let src = cache.data_at_addr(span.vmaddr, span.filesize as usize)?;
            data[span.buffer_off..span.buffer_off + span.filesize as usize].copy_from_slice(src);
        }

        let mut view = Self {
            header,
            data,
            load_commands: Vec::new(),
            spans,
            segment_indices: HashMap::new(),
        };
        view.reparse_load_commands()?;
        view.rehome_file_offsets()?;
        Ok(view)
    }

    /// Creates a view over an already-assembled buffer whose segment
    /// commands carry buffer-relative file offsets. Used by tests and by
    /// synthetic images.
    pub fn from_buffer(data: Vec<u8>) -> Result<Self> {
        if data.len() < P::RawHeader::SIZE {
            return Err(Error::buffer_too_small(P::RawHeader::SIZE, data.len()));
        }
        let header = P::RawHeader::read_from_prefix(&data)
            .map_err(|_| Error::InvalidMachoMagic(0))?
            .0;
        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic()));
        }

        let mut view = Self {
            header,
            data,
            load_commands: Vec::new(),
            spans: Vec::new(),
            segment_indices: HashMap::new(),
        };
        view.reparse_load_commands()?;
        view.spans = view
            .segments()
            .map(|seg| SegmentSpan {
                name: seg.name().to_string(),
                vmaddr: seg.command.vmaddr(),
                vmsize: seg.command.vmsize(),
                filesize: seg.command.filesize(),
                orig_fileoff: seg.command.fileoff(),
                buffer_off: seg.command.fileoff() as usize,
            })
            .collect();
        Ok(view)
    }

    /// Rewrites segment and section file offsets to buffer positions.
    fn rehome_file_offsets(&mut self) -> Result<()> {
        let updates: Vec<(usize, u64, u64)> = self
            .segments()
            .map(|seg| {
                let span = self
                    .spans
                    .iter()
                    .find(|s| s.vmaddr == seg.command.vmaddr())
                    .expect("span exists for every segment");
                (seg.command_offset, span.buffer_off as u64, seg.command.vmaddr())
            })
            .collect();

        for (cmd_offset, buffer_off, vmaddr) in updates {
            let mut seg = P::RawSegment::read_from_prefix(&self.data[cmd_offset..])
                .map_err(|_| Error::parse(cmd_offset, "failed to re-read segment command"))?
                .0;
            seg.set_fileoff(buffer_off);
            self.write_struct(cmd_offset, &seg)?;

            let mut sect_offset = cmd_offset + P::RawSegment::SIZE;
            for _ in 0..seg.nsects() {
                let mut sect = P::RawSection::read_from_prefix(&self.data[sect_offset..])
                    .map_err(|_| Error::parse(sect_offset, "failed to re-read section"))?
                    .0;
                if sect.offset() != 0 {
                    let delta = sect.addr().wrapping_sub(vmaddr);
                    sect.set_offset((buffer_off + delta) as u32);
                    self.write_struct(sect_offset, &sect)?;
                }
                sect_offset += P::RawSection::SIZE;
            }
        }

        self.reparse_load_commands()
    }

    /// Re-parses the load command region from the buffer.
    ///
    /// Must be called after any raw edit that changes command layout
    /// (insertion, removal, or field rewrite outside the typed helpers).
    pub fn reparse_load_commands(&mut self) -> Result<()> {
        self.header = P::RawHeader::read_from_prefix(&self.data)
            .map_err(|_| Error::InvalidMachoMagic(0))?
            .0;
        self.load_commands.clear();
        self.segment_indices.clear();

        let mut offset = P::RawHeader::SIZE;
        let end = P::RawHeader::SIZE + self.header.sizeofcmds() as usize;
        for _ in 0..self.header.ncmds() {
            if offset + LoadCommand::SIZE > end || offset + LoadCommand::SIZE > self.data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }
            let cmd = util::read_u32_le(&self.data[offset..]);
            let cmdsize = util::read_u32_le(&self.data[offset + 4..]);
            if (cmdsize as usize) < LoadCommand::SIZE
                || offset + cmdsize as usize > self.data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let info = self.parse_one_command(cmd, cmdsize, offset)?;
            if let LoadCommandInfo::Segment(ref seg) = info {
                self.segment_indices
                    .insert(seg.name().to_string(), self.load_commands.len());
            }
            self.load_commands.push(info);
            offset += cmdsize as usize;
        }
        Ok(())
    }

    fn parse_one_command(
        &self,
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    ) -> Result<LoadCommandInfo<P>> {
        let bytes = &self.data[offset..offset + cmdsize as usize];
        match cmd {
            c if c == P::RawSegment::CMD => {
                let seg = P::RawSegment::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;
                let mut sections = Vec::with_capacity(seg.nsects() as usize);
                let mut sect_offset = offset + P::RawSegment::SIZE;
                for _ in 0..seg.nsects() {
                    let sect = P::RawSection::read_from_prefix(&self.data[sect_offset..])
                        .map_err(|_| Error::parse(sect_offset, "failed to parse section"))?
                        .0;
                    sections.push(SectionInfo {
                        section: sect,
                        struct_offset: sect_offset,
                    });
                    sect_offset += P::RawSection::SIZE;
                }
                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    command: seg,
                    command_offset: offset,
                    sections,
                }))
            }
            LC_SYMTAB => {
                let command = SymtabCommand::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(offset, "failed to parse symtab command"))?
                    .0;
                Ok(LoadCommandInfo::Symtab { command, offset })
            }
            LC_DYSYMTAB => {
                let command = DysymtabCommand::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(offset, "failed to parse dysymtab command"))?
                    .0;
                Ok(LoadCommandInfo::Dysymtab { command, offset })
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                let command = DyldInfoCommand::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(offset, "failed to parse dyld info command"))?
                    .0;
                Ok(LoadCommandInfo::DyldInfo { command, offset })
            }
            LC_CODE_SIGNATURE | LC_SEGMENT_SPLIT_INFO | LC_FUNCTION_STARTS | LC_DATA_IN_CODE
            | LC_DYLD_EXPORTS_TRIE | LC_DYLD_CHAINED_FIXUPS | LC_LINKER_OPTIMIZATION_HINT
            | LC_DYLIB_CODE_SIGN_DRS | LC_ATOM_INFO => {
                let command = LinkeditDataCommand::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(offset, "failed to parse linkedit data command"))?
                    .0;
                Ok(LoadCommandInfo::LinkeditData { command, offset })
            }
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB | LC_ID_DYLIB => {
                let command = DylibCommand::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(offset, "failed to parse dylib command"))?
                    .0;
                let name_offset = command.dylib.name_offset as usize;
                let name = util::cstr_at(bytes, name_offset)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Ok(LoadCommandInfo::Dylib {
                    command,
                    name,
                    offset,
                })
            }
            _ => Ok(LoadCommandInfo::Other {
                cmd,
                cmdsize,
                offset,
            }),
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo<P>> {
        self.segment_indices.get(name).and_then(|&idx| {
            if let LoadCommandInfo::Segment(ref seg) = self.load_commands[idx] {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo<P>> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns a section by segment and section name.
    pub fn section(&self, segment: &str, section: &str) -> Option<&SectionInfo<P>> {
        self.segment(segment)?.section(section)
    }

    /// Returns a section by name in any segment.
    pub fn section_anywhere(&self, section: &str) -> Option<&SectionInfo<P>> {
        self.segments().find_map(|seg| seg.section(section))
    }

    /// Returns the symbol table command and its buffer offset.
    pub fn symtab(&self) -> Option<(SymtabCommand, usize)> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Symtab { command, offset } = lc {
                Some((*command, *offset))
            } else {
                None
            }
        })
    }

    /// Returns the dynamic symbol table command and its buffer offset.
    pub fn dysymtab(&self) -> Option<(DysymtabCommand, usize)> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Dysymtab { command, offset } = lc {
                Some((*command, *offset))
            } else {
                None
            }
        })
    }

    /// Returns the dyld info command and its buffer offset.
    pub fn dyld_info(&self) -> Option<(DyldInfoCommand, usize)> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::DyldInfo { command, offset } = lc {
                Some((*command, *offset))
            } else {
                None
            }
        })
    }

    /// Returns a linkedit_data command of the given type and its buffer offset.
    pub fn linkedit_data_command(&self, cmd: u32) -> Option<(LinkeditDataCommand, usize)> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::LinkeditData { command, offset } = lc {
                if command.cmd == cmd {
                    return Some((*command, *offset));
                }
            }
            None
        })
    }

    /// Returns the install paths of dependency dylibs (not the image's own id).
    pub fn dependencies(&self) -> Vec<(String, u32)> {
        self.load_commands
            .iter()
            .filter_map(|lc| {
                if let LoadCommandInfo::Dylib { command, name, .. } = lc {
                    if command.cmd != LC_ID_DYLIB {
                        return Some((name.clone(), command.cmd));
                    }
                }
                None
            })
            .collect()
    }

    // =========================================================================
    // Address translation
    // =========================================================================

    /// Converts a virtual address into a buffer offset.
    ///
    /// Only materialized bytes resolve; addresses inside a zerofill tail
    /// return `None`.
    pub fn addr_to_offset(&self, addr: u64) -> Option<usize> {
        self.spans
            .iter()
            .find(|s| addr >= s.vmaddr && addr < s.vmaddr + s.filesize)
            .map(|s| s.buffer_off + (addr - s.vmaddr) as usize)
    }

    /// Converts a buffer offset into a virtual address.
    pub fn offset_to_addr(&self, offset: usize) -> Option<u64> {
        self.spans
            .iter()
            .find(|s| {
                offset >= s.buffer_off && (offset as u64) < s.buffer_off as u64 + s.filesize
            })
            .map(|s| s.vmaddr + (offset - s.buffer_off) as u64)
    }

    /// Returns true if the address lies within any segment's vm range.
    pub fn contains_addr(&self, addr: u64) -> bool {
        self.spans
            .iter()
            .any(|s| addr >= s.vmaddr && addr < s.vmaddr + s.vmsize)
    }

    /// Translates a pre-rebuild linkedit file offset (cache-relative, as
    /// cited by the original load commands) into a buffer offset.
    pub fn old_linkedit_offset(&self, cited: u64) -> Option<usize> {
        let span = self.spans.iter().find(|s| s.name == "__LINKEDIT")?;
        if cited < span.orig_fileoff || cited >= span.orig_fileoff + span.filesize {
            return None;
        }
        Some(span.buffer_off + (cited - span.orig_fileoff) as usize)
    }

    /// Translates a linkedit file offset cited by a load command into a
    /// buffer offset, accepting both post-rebuild (buffer-relative) and
    /// original (cache-relative) citations. The two offset spaces never
    /// overlap in practice: buffer offsets are bounded by the image size
    /// while original linkedit offsets sit deep inside the cache file.
    pub fn linkedit_offset(&self, cited: u64) -> Option<usize> {
        let span = self.spans.iter().find(|s| s.name == "__LINKEDIT")?;
        let current_fileoff = self
            .segment("__LINKEDIT")
            .map(|seg| seg.command.fileoff())
            .unwrap_or(span.buffer_off as u64);
        if cited >= current_fileoff && cited < current_fileoff + span.filesize {
            return Some(span.buffer_off + (cited - current_fileoff) as usize);
        }
        self.old_linkedit_offset(cited)
    }

    /// Returns the buffer span of the `__LINKEDIT` segment as
    /// `(buffer_offset, capacity)`. Capacity is the byte count materialized
    /// at construction, which is also the rebuild space limit.
    pub fn linkedit_span(&self) -> Option<(usize, usize)> {
        self.spans
            .iter()
            .find(|s| s.name == "__LINKEDIT")
            .map(|s| (s.buffer_off, s.filesize as usize))
    }

    /// Returns the header space available between the end of the load
    /// commands and the `__text` section.
    pub fn header_space_available(&self) -> usize {
        let text_start = self
            .section("__TEXT", "__text")
            .map(|s| s.section.offset() as usize)
            .unwrap_or(usize::MAX);
        let used = P::RawHeader::SIZE + self.header.sizeofcmds() as usize;
        text_start.saturating_sub(used)
    }

    // =========================================================================
    // Raw access
    // =========================================================================

    /// Reads `len` bytes at the given buffer offset.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if offset + len > self.data.len() {
            return Err(Error::buffer_too_small(offset + len, self.data.len()));
        }
        Ok(&self.data[offset..offset + len])
    }

    /// Reads a u32 at the given buffer offset.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        Ok(util::read_u32_le(self.read_at(offset, 4)?))
    }

    /// Reads a u64 at the given buffer offset.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        Ok(util::read_u64_le(self.read_at(offset, 8)?))
    }

    /// Reads a pointer-sized value at the given buffer offset.
    pub fn read_ptr(&self, offset: usize) -> Result<u64> {
        Ok(P::read_ptr(self.read_at(offset, P::SIZE as usize)?))
    }

    /// Writes bytes at the given buffer offset.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.data.len() {
            return Err(Error::buffer_too_small(offset + bytes.len(), self.data.len()));
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Writes a u32 at the given buffer offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Writes a u64 at the given buffer offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Writes a pointer-sized value at the given buffer offset.
    pub fn write_ptr(&mut self, offset: usize, value: u64) -> Result<()> {
        if offset + P::SIZE as usize > self.data.len() {
            return Err(Error::buffer_too_small(
                offset + P::SIZE as usize,
                self.data.len(),
            ));
        }
        P::write_ptr(&mut self.data[offset..], value);
        Ok(())
    }

    /// Writes a structure at the given buffer offset.
    pub fn write_struct<T: IntoBytes + Immutable>(
        &mut self,
        offset: usize,
        value: &T,
    ) -> Result<()> {
        self.write_at(offset, value.as_bytes())
    }

    /// Writes the in-memory header back into the buffer.
    pub fn sync_header(&mut self) -> Result<()> {
        let header = self.header;
        self.write_struct(0, &header)
    }

    /// Total size of all parsed load commands.
    pub fn load_commands_size(&self) -> usize {
        self.load_commands
            .iter()
            .map(|lc| match lc {
                LoadCommandInfo::Segment(s) => s.command.cmdsize() as usize,
                LoadCommandInfo::Symtab { command, .. } => command.cmdsize as usize,
                LoadCommandInfo::Dysymtab { command, .. } => command.cmdsize as usize,
                LoadCommandInfo::DyldInfo { command, .. } => command.cmdsize as usize,
                LoadCommandInfo::LinkeditData { command, .. } => command.cmdsize as usize,
                LoadCommandInfo::Dylib { command, .. } => command.cmdsize as usize,
                LoadCommandInfo::Other { cmdsize, .. } => *cmdsize as usize,
            })
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders for synthetic in-memory images used across the crate's tests.

    use super::*;
    use crate::arch::Pointer64;

    /// Builds a minimal 64-bit dylib buffer: __TEXT with a __text section,
    /// __DATA, and __LINKEDIT, laid out contiguously.
    pub fn minimal_dylib() -> Vec<u8> {
        minimal_dylib_with(0x400, 0x200, 0x400)
    }

    /// Builds a minimal 64-bit dylib with the given segment file sizes.
    /// The load-command region is padded so that __text starts at 0x400.
    pub fn minimal_dylib_with(
        text_size: u64,
        data_size: u64,
        linkedit_size: u64,
    ) -> Vec<u8> {
        let base: u64 = 0x1_8000_0000;
        let text_fileoff = 0u64;
        let data_fileoff = text_size;
        let le_fileoff = text_size + data_size;
        let total = (text_size + data_size + linkedit_size) as usize;

        let mut data = vec![0u8; total];

        let mut text_seg = SegmentCommand64::default();
        RawSegment::set_name(&mut text_seg, "__TEXT");
        text_seg.vmaddr = base;
        text_seg.vmsize = text_size;
        text_seg.fileoff = text_fileoff;
        text_seg.filesize = text_size;
        text_seg.nsects = 1;
        text_seg.cmdsize = (SegmentCommand64::SIZE + Section64::SIZE) as u32;

        let mut text_sect = Section64::default();
        text_sect.sectname = *b"__text\0\0\0\0\0\0\0\0\0\0";
        text_sect.segname = *b"__TEXT\0\0\0\0\0\0\0\0\0\0";
        text_sect.addr = base + 0x400;
        text_sect.size = text_size - 0x400;
        text_sect.offset = 0x400;

        let mut data_seg = SegmentCommand64::default();
        RawSegment::set_name(&mut data_seg, "__DATA");
        data_seg.vmaddr = base + text_size;
        data_seg.vmsize = data_size;
        data_seg.fileoff = data_fileoff;
        data_seg.filesize = data_size;

        let mut le_seg = SegmentCommand64::default();
        RawSegment::set_name(&mut le_seg, "__LINKEDIT");
        le_seg.vmaddr = base + text_size + data_size;
        le_seg.vmsize = linkedit_size;
        le_seg.fileoff = le_fileoff;
        le_seg.filesize = linkedit_size;

        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: le_fileoff as u32,
            nsyms: 0,
            stroff: le_fileoff as u32,
            strsize: 0,
        };

        let sizeofcmds = text_seg.cmdsize
            + data_seg.cmdsize
            + le_seg.cmdsize
            + symtab.cmdsize;

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds: 4,
            sizeofcmds,
            flags: 0,
            reserved: 0,
        };

        let mut off = 0usize;
        data[off..off + 32].copy_from_slice(header.as_bytes());
        off += 32;
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(text_seg.as_bytes());
        off += SegmentCommand64::SIZE;
        data[off..off + Section64::SIZE].copy_from_slice(text_sect.as_bytes());
        off += Section64::SIZE;
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(data_seg.as_bytes());
        off += SegmentCommand64::SIZE;
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(le_seg.as_bytes());
        off += SegmentCommand64::SIZE;
        data[off..off + SymtabCommand::SIZE].copy_from_slice(symtab.as_bytes());

        data
    }

    /// Parses a minimal dylib buffer into an `ImageView<Pointer64>`.
    pub fn minimal_view() -> ImageView<Pointer64> {
        ImageView::from_buffer(minimal_dylib()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::arch::Pointer64;

    #[test]
    fn test_parse_minimal() {
        let view = minimal_view();
        assert_eq!(view.header.ncmds, 4);
        assert!(view.segment("__TEXT").is_some());
        assert!(view.segment("__DATA").is_some());
        assert!(view.segment("__LINKEDIT").is_some());
        assert!(view.symtab().is_some());
        assert!(view.section("__TEXT", "__text").is_some());
    }

    #[test]
    fn test_addr_translation() {
        let view = minimal_view();
        let base = 0x1_8000_0000u64;
        assert_eq!(view.addr_to_offset(base), Some(0));
        assert_eq!(view.addr_to_offset(base + 0x100), Some(0x100));
        assert_eq!(view.offset_to_addr(0x100), Some(base + 0x100));
        assert!(view.contains_addr(base + 0x400));
        assert!(!view.contains_addr(base + 0x10_0000));
    }

    #[test]
    fn test_header_space() {
        let view = minimal_view();
        let used = 32 + view.header.sizeofcmds as usize;
        assert_eq!(view.header_space_available(), 0x400 - used);
    }

    #[test]
    fn test_read_write_primitives() {
        let mut view = minimal_view();
        view.write_u64(0x500, 0xDEAD_BEEF_CAFE_F00D).unwrap();
        assert_eq!(view.read_u64(0x500).unwrap(), 0xDEAD_BEEF_CAFE_F00D);
        view.write_ptr(0x508, 0x1_8000_0040).unwrap();
        assert_eq!(view.read_ptr(0x508).unwrap(), 0x1_8000_0040);
        assert!(view.read_u32(view.data.len()).is_err());
    }

    #[test]
    fn test_linkedit_span() {
        let view = minimal_view();
        let (off, cap) = view.linkedit_span().unwrap();
        assert_eq!(off, 0x600);
        assert_eq!(cap, 0x400);
    }

    #[test]
    fn test_from_buffer_rejects_bad_magic() {
        let mut data = minimal_dylib();
        data[0] = 0;
        assert!(ImageView::<Pointer64>::from_buffer(data).is_err());
    }
}
