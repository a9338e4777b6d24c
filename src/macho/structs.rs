//! Mach-O binary structures.
//!
//! Raw on-disk layouts for both pointer widths, plus accessor traits that
//! normalize the width-specific fields to `u64` so the pipeline can stay
//! generic over the pointer kind.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;

fn name_from_bytes(bytes: &[u8; 16]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(16);
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

fn name_to_bytes(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

// =============================================================================
// Accessor traits
// =============================================================================

/// Width-normalized view of a mach header.
pub trait RawMachHeader:
    FromBytes + IntoBytes + KnownLayout + Immutable + Copy + std::fmt::Debug
{
    /// Size of the header in bytes.
    const SIZE: usize;
    /// Expected magic for this width.
    const MAGIC: u32;

    /// Magic number.
    fn magic(&self) -> u32;
    /// CPU type.
    fn cputype(&self) -> u32;
    /// CPU subtype.
    fn cpusubtype(&self) -> u32;
    /// File type.
    fn filetype(&self) -> u32;
    /// Number of load commands.
    fn ncmds(&self) -> u32;
    /// Sets the number of load commands.
    fn set_ncmds(&mut self, v: u32);
    /// Size of the load command region.
    fn sizeofcmds(&self) -> u32;
    /// Sets the size of the load command region.
    fn set_sizeofcmds(&mut self, v: u32);
    /// Header flags.
    fn flags(&self) -> u32;
    /// Sets the header flags.
    fn set_flags(&mut self, v: u32);
    /// Sets the `reserved` field. Returns false when the width has none.
    fn set_reserved(&mut self, v: u32) -> bool;
    /// Returns the `reserved` field, if the width has one.
    fn reserved(&self) -> Option<u32>;

    /// Returns true if the magic matches this width.
    #[inline]
    fn is_valid(&self) -> bool {
        self.magic() == Self::MAGIC
    }

    /// Returns true if this is an ARM64e binary (pointer authentication).
    #[inline]
    fn is_arm64e(&self) -> bool {
        self.cputype() == CPU_TYPE_ARM64 && (self.cpusubtype() & 0xFF) == CPU_SUBTYPE_ARM64E
    }
}

/// Width-normalized view of a segment command.
pub trait RawSegment:
    FromBytes + IntoBytes + KnownLayout + Immutable + Copy + Default + std::fmt::Debug
{
    /// Size of the command in bytes (without trailing sections).
    const SIZE: usize;
    /// The load command value (`LC_SEGMENT` or `LC_SEGMENT_64`).
    const CMD: u32;
    /// Size of one trailing section entry.
    const SECTION_SIZE: usize;

    /// Command size field.
    fn cmdsize(&self) -> u32;
    /// Sets the command size field.
    fn set_cmdsize(&mut self, v: u32);
    /// Segment name.
    fn name(&self) -> &str;
    /// Sets the segment name.
    fn set_name(&mut self, name: &str);
    /// Virtual memory address.
    fn vmaddr(&self) -> u64;
    /// Sets the virtual memory address.
    fn set_vmaddr(&mut self, v: u64);
    /// Virtual memory size.
    fn vmsize(&self) -> u64;
    /// Sets the virtual memory size.
    fn set_vmsize(&mut self, v: u64);
    /// File offset.
    fn fileoff(&self) -> u64;
    /// Sets the file offset.
    fn set_fileoff(&mut self, v: u64);
    /// File size.
    fn filesize(&self) -> u64;
    /// Sets the file size.
    fn set_filesize(&mut self, v: u64);
    /// Maximum protection.
    fn maxprot(&self) -> u32;
    /// Sets the maximum protection.
    fn set_maxprot(&mut self, v: u32);
    /// Initial protection.
    fn initprot(&self) -> u32;
    /// Sets the initial protection.
    fn set_initprot(&mut self, v: u32);
    /// Number of sections.
    fn nsects(&self) -> u32;
    /// Sets the number of sections.
    fn set_nsects(&mut self, v: u32);
}

/// Width-normalized view of a section entry.
pub trait RawSection:
    FromBytes + IntoBytes + KnownLayout + Immutable + Copy + Default + std::fmt::Debug
{
    /// Size of a section entry in bytes.
    const SIZE: usize;

    /// Section name.
    fn name(&self) -> &str;
    /// Segment name.
    fn segment_name(&self) -> &str;
    /// Virtual memory address.
    fn addr(&self) -> u64;
    /// Size in bytes.
    fn size(&self) -> u64;
    /// Sets the size.
    fn set_size(&mut self, v: u64);
    /// File offset.
    fn offset(&self) -> u32;
    /// Sets the file offset.
    fn set_offset(&mut self, v: u32);
    /// Section flags.
    fn flags(&self) -> u32;
    /// Sets the section flags.
    fn set_flags(&mut self, v: u32);
    /// Indirect symbol table start index (stubs and pointer sections).
    fn reserved1(&self) -> u32;
    /// Stub entry size (stub sections).
    fn reserved2(&self) -> u32;

    /// Returns the section type bits.
    #[inline]
    fn section_type(&self) -> u32 {
        self.flags() & SECTION_TYPE
    }
}

/// Width-normalized view of an nlist symbol entry.
pub trait RawNlist:
    FromBytes + IntoBytes + KnownLayout + Immutable + Copy + Default + std::fmt::Debug
{
    /// Size of an entry in bytes.
    const SIZE: usize;

    /// String table index.
    fn strx(&self) -> u32;
    /// Sets the string table index.
    fn set_strx(&mut self, v: u32);
    /// Type flag.
    fn n_type(&self) -> u8;
    /// Sets the type flag.
    fn set_n_type(&mut self, v: u8);
    /// Section number.
    fn n_sect(&self) -> u8;
    /// Description field.
    fn n_desc(&self) -> u16;
    /// Symbol value.
    fn value(&self) -> u64;
    /// Sets the symbol value.
    fn set_value(&mut self, v: u64);

    /// Returns true if this is a debugging (stab) entry.
    #[inline]
    fn is_debug(&self) -> bool {
        (self.n_type() & N_STAB) != 0
    }

    /// Returns true if this symbol is external.
    #[inline]
    fn is_external(&self) -> bool {
        (self.n_type() & N_EXT) != 0
    }
}

// =============================================================================
// 64-bit layouts
// =============================================================================

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number (MH_MAGIC_64)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

impl RawMachHeader for MachHeader64 {
    const SIZE: usize = 32;
    const MAGIC: u32 = MH_MAGIC_64;

    fn magic(&self) -> u32 {
        self.magic
    }
    fn cputype(&self) -> u32 {
        self.cputype
    }
    fn cpusubtype(&self) -> u32 {
        self.cpusubtype
    }
    fn filetype(&self) -> u32 {
        self.filetype
    }
    fn ncmds(&self) -> u32 {
        self.ncmds
    }
    fn set_ncmds(&mut self, v: u32) {
        self.ncmds = v;
    }
    fn sizeofcmds(&self) -> u32 {
        self.sizeofcmds
    }
    fn set_sizeofcmds(&mut self, v: u32) {
        self.sizeofcmds = v;
    }
    fn flags(&self) -> u32 {
        self.flags
    }
    fn set_flags(&mut self, v: u32) {
        self.flags = v;
    }
    fn set_reserved(&mut self, v: u32) -> bool {
        self.reserved = v;
        true
    }
    fn reserved(&self) -> Option<u32> {
        Some(self.reserved)
    }
}

/// 64-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Amount of file to map
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl Default for SegmentCommand64 {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT_64,
            cmdsize: <Self as RawSegment>::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }
}

impl RawSegment for SegmentCommand64 {
    const SIZE: usize = 72;
    const CMD: u32 = LC_SEGMENT_64;
    const SECTION_SIZE: usize = 80;

    fn cmdsize(&self) -> u32 {
        self.cmdsize
    }
    fn set_cmdsize(&mut self, v: u32) {
        self.cmdsize = v;
    }
    fn name(&self) -> &str {
        name_from_bytes(&self.segname)
    }
    fn set_name(&mut self, name: &str) {
        self.segname = name_to_bytes(name);
    }
    fn vmaddr(&self) -> u64 {
        self.vmaddr
    }
    fn set_vmaddr(&mut self, v: u64) {
        self.vmaddr = v;
    }
    fn vmsize(&self) -> u64 {
        self.vmsize
    }
    fn set_vmsize(&mut self, v: u64) {
        self.vmsize = v;
    }
    fn fileoff(&self) -> u64 {
        self.fileoff
    }
    fn set_fileoff(&mut self, v: u64) {
        self.fileoff = v;
    }
    fn filesize(&self) -> u64 {
        self.filesize
    }
    fn set_filesize(&mut self, v: u64) {
        self.filesize = v;
    }
    fn maxprot(&self) -> u32 {
        self.maxprot
    }
    fn set_maxprot(&mut self, v: u32) {
        self.maxprot = v;
    }
    fn initprot(&self) -> u32 {
        self.initprot
    }
    fn set_initprot(&mut self, v: u32) {
        self.initprot = v;
    }
    fn nsects(&self) -> u32 {
        self.nsects
    }
    fn set_nsects(&mut self, v: u32) {
        self.nsects = v;
    }
}

/// 64-bit section entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (indirect symbol index for pointer/stub sections)
    pub reserved1: u32,
    /// Reserved (stub size for stub sections)
    pub reserved2: u32,
    /// Reserved
    pub reserved3: u32,
}

impl Default for Section64 {
    fn default() -> Self {
        Self {
            sectname: [0u8; 16],
            segname: [0u8; 16],
            addr: 0,
            size: 0,
            offset: 0,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }
    }
}

impl RawSection for Section64 {
    const SIZE: usize = 80;

    fn name(&self) -> &str {
        name_from_bytes(&self.sectname)
    }
    fn segment_name(&self) -> &str {
        name_from_bytes(&self.segname)
    }
    fn addr(&self) -> u64 {
        self.addr
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn set_size(&mut self, v: u64) {
        self.size = v;
    }
    fn offset(&self) -> u32 {
        self.offset
    }
    fn set_offset(&mut self, v: u32) {
        self.offset = v;
    }
    fn flags(&self) -> u32 {
        self.flags
    }
    fn set_flags(&mut self, v: u32) {
        self.flags = v;
    }
    fn reserved1(&self) -> u32 {
        self.reserved1
    }
    fn reserved2(&self) -> u32 {
        self.reserved2
    }
}

/// 64-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// Index into string table
    pub n_strx: u32,
    /// Type flag
    pub n_type: u8,
    /// Section number or NO_SECT
    pub n_sect: u8,
    /// Flags
    pub n_desc: u16,
    /// Value
    pub n_value: u64,
}

impl RawNlist for Nlist64 {
    const SIZE: usize = 16;

    fn strx(&self) -> u32 {
        self.n_strx
    }
    fn set_strx(&mut self, v: u32) {
        self.n_strx = v;
    }
    fn n_type(&self) -> u8 {
        self.n_type
    }
    fn set_n_type(&mut self, v: u8) {
        self.n_type = v;
    }
    fn n_sect(&self) -> u8 {
        self.n_sect
    }
    fn n_desc(&self) -> u16 {
        self.n_desc
    }
    fn value(&self) -> u64 {
        self.n_value
    }
    fn set_value(&mut self, v: u64) {
        self.n_value = v;
    }
}

// =============================================================================
// 32-bit layouts
// =============================================================================

/// 32-bit Mach-O header. No `reserved` field.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader32 {
    /// Magic number (MH_MAGIC)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
}

impl RawMachHeader for MachHeader32 {
    const SIZE: usize = 28;
    const MAGIC: u32 = MH_MAGIC;

    fn magic(&self) -> u32 {
        self.magic
    }
    fn cputype(&self) -> u32 {
        self.cputype
    }
    fn cpusubtype(&self) -> u32 {
        self.cpusubtype
    }
    fn filetype(&self) -> u32 {
        self.filetype
    }
    fn ncmds(&self) -> u32 {
        self.ncmds
    }
    fn set_ncmds(&mut self, v: u32) {
        self.ncmds = v;
    }
    fn sizeofcmds(&self) -> u32 {
        self.sizeofcmds
    }
    fn set_sizeofcmds(&mut self, v: u32) {
        self.sizeofcmds = v;
    }
    fn flags(&self) -> u32 {
        self.flags
    }
    fn set_flags(&mut self, v: u32) {
        self.flags = v;
    }
    fn set_reserved(&mut self, _v: u32) -> bool {
        false
    }
    fn reserved(&self) -> Option<u32> {
        None
    }
}

/// 32-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand32 {
    /// LC_SEGMENT
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u32,
    /// Virtual memory size
    pub vmsize: u32,
    /// File offset
    pub fileoff: u32,
    /// Amount of file to map
    pub filesize: u32,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl Default for SegmentCommand32 {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT,
            cmdsize: <Self as RawSegment>::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }
}

impl RawSegment for SegmentCommand32 {
    const SIZE: usize = 56;
    const CMD: u32 = LC_SEGMENT;
    const SECTION_SIZE: usize = 68;

    fn cmdsize(&self) -> u32 {
        self.cmdsize
    }
    fn set_cmdsize(&mut self, v: u32) {
        self.cmdsize = v;
    }
    fn name(&self) -> &str {
        name_from_bytes(&self.segname)
    }
    fn set_name(&mut self, name: &str) {
        self.segname = name_to_bytes(name);
    }
    fn vmaddr(&self) -> u64 {
        self.vmaddr as u64
    }
    fn set_vmaddr(&mut self, v: u64) {
        self.vmaddr = v as u32;
    }
    fn vmsize(&self) -> u64 {
        self.vmsize as u64
    }
    fn set_vmsize(&mut self, v: u64) {
        self.vmsize = v as u32;
    }
    fn fileoff(&self) -> u64 {
        self.fileoff as u64
    }
    fn set_fileoff(&mut self, v: u64) {
        self.fileoff = v as u32;
    }
    fn filesize(&self) -> u64 {
        self.filesize as u64
    }
    fn set_filesize(&mut self, v: u64) {
        self.filesize = v as u32;
    }
    fn maxprot(&self) -> u32 {
        self.maxprot
    }
    fn set_maxprot(&mut self, v: u32) {
        self.maxprot = v;
    }
    fn initprot(&self) -> u32 {
        self.initprot
    }
    fn set_initprot(&mut self, v: u32) {
        self.initprot = v;
    }
    fn nsects(&self) -> u32 {
        self.nsects
    }
    fn set_nsects(&mut self, v: u32) {
        self.nsects = v;
    }
}

/// 32-bit section entry. No `reserved3` field.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section32 {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u32,
    /// Size in bytes
    pub size: u32,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (indirect symbol index for pointer/stub sections)
    pub reserved1: u32,
    /// Reserved (stub size for stub sections)
    pub reserved2: u32,
}

impl Default for Section32 {
    fn default() -> Self {
        Self {
            sectname: [0u8; 16],
            segname: [0u8; 16],
            addr: 0,
            size: 0,
            offset: 0,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
        }
    }
}

impl RawSection for Section32 {
    const SIZE: usize = 68;

    fn name(&self) -> &str {
        name_from_bytes(&self.sectname)
    }
    fn segment_name(&self) -> &str {
        name_from_bytes(&self.segname)
    }
    fn addr(&self) -> u64 {
        self.addr as u64
    }
    fn size(&self) -> u64 {
        self.size as u64
    }
    fn set_size(&mut self, v: u64) {
        self.size = v as u32;
    }
    fn offset(&self) -> u32 {
        self.offset
    }
    fn set_offset(&mut self, v: u32) {
        self.offset = v;
    }
    fn flags(&self) -> u32 {
        self.flags
    }
    fn set_flags(&mut self, v: u32) {
        self.flags = v;
    }
    fn reserved1(&self) -> u32 {
        self.reserved1
    }
    fn reserved2(&self) -> u32 {
        self.reserved2
    }
}

/// 32-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist32 {
    /// Index into string table
    pub n_strx: u32,
    /// Type flag
    pub n_type: u8,
    /// Section number or NO_SECT
    pub n_sect: u8,
    /// Flags
    pub n_desc: u16,
    /// Value
    pub n_value: u32,
}

impl RawNlist for Nlist32 {
    const SIZE: usize = 12;

    fn strx(&self) -> u32 {
        self.n_strx
    }
    fn set_strx(&mut self, v: u32) {
        self.n_strx = v;
    }
    fn n_type(&self) -> u8 {
        self.n_type
    }
    fn set_n_type(&mut self, v: u8) {
        self.n_type = v;
    }
    fn n_sect(&self) -> u8 {
        self.n_sect
    }
    fn n_desc(&self) -> u16 {
        self.n_desc
    }
    fn value(&self) -> u64 {
        self.n_value as u64
    }
    fn set_value(&mut self, v: u64) {
        self.n_value = v as u32;
    }
}

// =============================================================================
// Width-independent commands
// =============================================================================

/// Generic load command header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// Type of load command
    pub cmd: u32,
    /// Size of load command
    pub cmdsize: u32,
}

impl LoadCommand {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

/// Symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Symbol table offset
    pub symoff: u32,
    /// Number of symbol table entries
    pub nsyms: u32,
    /// String table offset
    pub stroff: u32,
    /// String table size in bytes
    pub strsize: u32,
}

impl SymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

/// Dynamic symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DysymtabCommand {
    /// LC_DYSYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Index of local symbols
    pub ilocalsym: u32,
    /// Number of local symbols
    pub nlocalsym: u32,
    /// Index of externally defined symbols
    pub iextdefsym: u32,
    /// Number of externally defined symbols
    pub nextdefsym: u32,
    /// Index of undefined symbols
    pub iundefsym: u32,
    /// Number of undefined symbols
    pub nundefsym: u32,
    /// File offset to table of contents
    pub tocoff: u32,
    /// Number of entries in table of contents
    pub ntoc: u32,
    /// File offset to module table
    pub modtaboff: u32,
    /// Number of module table entries
    pub nmodtab: u32,
    /// Offset to referenced symbol table
    pub extrefsymoff: u32,
    /// Number of referenced symbol table entries
    pub nextrefsyms: u32,
    /// File offset to the indirect symbol table
    pub indirectsymoff: u32,
    /// Number of indirect symbol table entries
    pub nindirectsyms: u32,
    /// Offset to external relocation entries
    pub extreloff: u32,
    /// Number of external relocation entries
    pub nextrel: u32,
    /// Offset to local relocation entries
    pub locreloff: u32,
    /// Number of local relocation entries
    pub nlocrel: u32,
}

impl DysymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 80;
}

/// Dyld info command (compressed LINKEDIT information).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldInfoCommand {
    /// LC_DYLD_INFO or LC_DYLD_INFO_ONLY
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset to rebase info
    pub rebase_off: u32,
    /// Size of rebase info
    pub rebase_size: u32,
    /// File offset to binding info
    pub bind_off: u32,
    /// Size of binding info
    pub bind_size: u32,
    /// File offset to weak binding info
    pub weak_bind_off: u32,
    /// Size of weak binding info
    pub weak_bind_size: u32,
    /// File offset to lazy binding info
    pub lazy_bind_off: u32,
    /// Size of lazy binding info
    pub lazy_bind_size: u32,
    /// File offset to export info
    pub export_off: u32,
    /// Size of export info
    pub export_size: u32,
}

impl DyldInfoCommand {
    /// Size of this command.
    pub const SIZE: usize = 48;
}

/// Generic linkedit data command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LinkeditDataCommand {
    /// Command type (LC_FUNCTION_STARTS, LC_DATA_IN_CODE, ...)
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset
    pub dataoff: u32,
    /// Size
    pub datasize: u32,
}

impl LinkeditDataCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

/// Dylib reference shared by several load commands.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Dylib {
    /// Library path offset within the command
    pub name_offset: u32,
    /// Library build timestamp
    pub timestamp: u32,
    /// Library current version
    pub current_version: u32,
    /// Library compatibility version
    pub compatibility_version: u32,
}

/// Dylib load command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DylibCommand {
    /// LC_LOAD_DYLIB, LC_ID_DYLIB, ...
    pub cmd: u32,
    /// Total size (includes path string)
    pub cmdsize: u32,
    /// Library identification
    pub dylib: Dylib,
}

impl DylibCommand {
    /// Minimum size of this command (without path string).
    pub const SIZE: usize = 24;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<MachHeader64>(), 32);
        assert_eq!(std::mem::size_of::<MachHeader32>(), 28);
        assert_eq!(std::mem::size_of::<SegmentCommand64>(), 72);
        assert_eq!(std::mem::size_of::<SegmentCommand32>(), 56);
        assert_eq!(std::mem::size_of::<Section64>(), 80);
        assert_eq!(std::mem::size_of::<Section32>(), 68);
        assert_eq!(std::mem::size_of::<Nlist64>(), 16);
        assert_eq!(std::mem::size_of::<Nlist32>(), 12);
        assert_eq!(std::mem::size_of::<SymtabCommand>(), 24);
        assert_eq!(std::mem::size_of::<DysymtabCommand>(), 80);
        assert_eq!(std::mem::size_of::<DyldInfoCommand>(), 48);
        assert_eq!(std::mem::size_of::<LinkeditDataCommand>(), 16);
    }

    #[test]
    fn test_segment_name_round_trip() {
        let mut seg = SegmentCommand64::default();
        seg.set_name("__TEXT");
        assert_eq!(RawSegment::name(&seg), "__TEXT");

        let mut seg32 = SegmentCommand32::default();
        seg32.set_name("__LINKEDIT");
        assert_eq!(RawSegment::name(&seg32), "__LINKEDIT");
    }

    #[test]
    fn test_width_normalized_accessors() {
        let mut seg = SegmentCommand32::default();
        seg.set_vmaddr(0x4000_0000);
        seg.set_filesize(0x1000);
        assert_eq!(RawSegment::vmaddr(&seg), 0x4000_0000);
        assert_eq!(RawSegment::filesize(&seg), 0x1000);

        let mut sym = Nlist32::default();
        sym.set_value(0x1234_5678);
        assert_eq!(RawNlist::value(&sym), 0x1234_5678);
    }

    #[test]
    fn test_header_reserved() {
        let mut h64 = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
            reserved: 0,
        };
        assert!(h64.set_reserved(0x0003_0001));
        assert_eq!(h64.reserved, 0x0003_0001);

        let mut h32 = MachHeader32 {
            magic: MH_MAGIC,
            cputype: CPU_TYPE_ARM,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
        };
        assert!(!h32.set_reserved(0x0003_0001));
        assert_eq!(RawMachHeader::reserved(&h32), None);
    }
}
